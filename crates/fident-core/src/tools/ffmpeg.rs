use std::ffi::OsStr;
use std::path::Path;

use serde_json::Value;

use super::{run, strip_dir, ProbeReport, StreamInfo};
use crate::error::Result;
use crate::record::MediaInfo;

/// Verbose-mode output that means the file cannot be opened at all.
const CORRUPT_PATTERNS: &[&str] = &["Error opening input files"];

/// Warnings that a plain re-encode repairs.
pub const REENCODE_PATTERNS: &[&str] = &["A non-intra slice in an IDR NAL unit"];

const STREAM_ENTRIES: &str = "stream=index,codec_name,codec_long_name,codec_type,profile,\
codec_tag,pix_fmt,color_space,coded_width,coded_height,r_frame_rate,bit_rate,channels,\
channel_layout,sample_aspect_ratio,display_aspect_ratio";

pub fn inspect(path: &Path, verbose: bool) -> Result<ProbeReport> {
    let errors = if verbose {
        // decode every frame and report what breaks
        let out = run(
            "ffmpeg",
            &[
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-i"),
                path.as_os_str(),
                OsStr::new("-f"),
                OsStr::new("null"),
                OsStr::new("-"),
            ],
        )?;
        String::from_utf8_lossy(&out.stderr).into_owned()
    } else {
        let out = run(
            "ffprobe",
            &[OsStr::new("-hide_banner"), OsStr::new("-show_error"), path.as_os_str()],
        )?;
        String::from_utf8_lossy(&out.stdout).into_owned()
    };

    let mut report = classify(&strip_dir(&errors, path), verbose);
    report.info = stream_listing(path)?.map(|data| MediaInfo {
        source: "ffmpeg".to_string(),
        data,
    });
    Ok(report)
}

/// Turn probe error text into a report. Without `verbose` any output means
/// the file is unreadable; in verbose mode only known patterns do.
pub fn classify(errors: &str, verbose: bool) -> ProbeReport {
    let errors = errors.trim();
    let corrupt = if verbose {
        CORRUPT_PATTERNS.iter().any(|p| errors.contains(p))
    } else {
        !errors.is_empty()
    };
    ProbeReport {
        corrupt,
        warning: errors.to_string(),
        info: None,
    }
}

pub fn needs_reencode(warning: &str) -> bool {
    REENCODE_PATTERNS.iter().any(|p| warning.contains(p))
}

/// The `streams` array reported by ffprobe, `None` if ffprobe fails.
pub fn stream_listing(path: &Path) -> Result<Option<Value>> {
    let out = run(
        "ffprobe",
        &[
            path.as_os_str(),
            OsStr::new("-hide_banner"),
            OsStr::new("-show_entries"),
            OsStr::new(STREAM_ENTRIES),
            OsStr::new("-output_format"),
            OsStr::new("json"),
        ],
    )?;
    if !out.status.success() {
        return Ok(None);
    }
    Ok(parse_stream_listing(&String::from_utf8_lossy(&out.stdout)))
}

pub fn parse_stream_listing(stdout: &str) -> Option<Value> {
    let mut doc: Value = serde_json::from_str(stdout).ok()?;
    match doc.get_mut("streams")?.take() {
        streams @ Value::Array(_) => Some(streams),
        _ => None,
    }
}

pub fn streams_of(listing: &Value) -> Vec<StreamInfo> {
    listing
        .as_array()
        .map(|streams| {
            streams
                .iter()
                .filter_map(|s| serde_json::from_value(s.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
