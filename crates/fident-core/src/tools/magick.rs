use std::ffi::OsStr;
use std::path::Path;

use super::{run, strip_dir, ProbeReport};
use crate::error::Result;
use crate::record::MediaInfo;

const IDENTIFY_FORMAT: &str = "%m %wx%h %g %z-bit %[channels]";

/// Messages meaning the image cannot be decoded.
const CORRUPT_PATTERNS: &[&str] = &[
    "identify: Cannot read",
    "identify: Sanity check on directory count failed",
    "identify: Failed to read directory",
    "data: premature end of data segment",
];

pub fn inspect(path: &Path, verbose: bool) -> Result<ProbeReport> {
    let mut args: Vec<&OsStr> = vec![OsStr::new("identify")];
    if verbose {
        args.extend([OsStr::new("-verbose"), OsStr::new("-regard-warnings")]);
    }
    args.extend([OsStr::new("-format"), OsStr::new(IDENTIFY_FORMAT), path.as_os_str()]);

    let out = run("magick", &args)?;
    let stdout = strip_dir(&String::from_utf8_lossy(&out.stdout), path);
    let stderr = strip_dir(&String::from_utf8_lossy(&out.stderr), path);
    Ok(classify(&stdout, &stderr, verbose))
}

pub fn classify(stdout: &str, stderr: &str, verbose: bool) -> ProbeReport {
    let stderr = stderr.trim();
    let corrupt = if verbose {
        CORRUPT_PATTERNS.iter().any(|p| stderr.contains(p))
    } else {
        !stderr.is_empty()
    };
    let stdout = stdout.trim();
    ProbeReport {
        corrupt,
        warning: stderr.to_string(),
        info: (!stdout.is_empty()).then(|| MediaInfo {
            source: "magick".to_string(),
            data: serde_json::Value::String(stdout.to_string()),
        }),
    }
}

pub fn media_info(path: &Path) -> Result<Option<MediaInfo>> {
    let out = run(
        "magick",
        &[OsStr::new("identify"), OsStr::new("-format"), OsStr::new(IDENTIFY_FORMAT), path.as_os_str()],
    )?;
    Ok(classify(&strip_dir(&String::from_utf8_lossy(&out.stdout), path), "", false).info)
}
