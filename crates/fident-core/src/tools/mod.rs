//! Seams to the external programs: format identifier, media probes and
//! converters. Each trait has a process-backed implementation; callers own a
//! [`Toolbox`] so the pipeline can run against stubs.

pub mod convert;
pub mod ffmpeg;
pub mod magick;
pub mod siegfried;

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::Tool;
use crate::record::{IdentifierOutput, MediaInfo};

pub use convert::ExternalConverter;
pub use siegfried::Siegfried;

/// Classifies one file.
pub trait Identifier: Send + Sync {
    fn identify(&self, path: &Path) -> Result<IdentifierOutput>;
}

/// Structural checks and stream listings.
pub trait MediaProbe: Send + Sync {
    fn inspect(&self, kind: InspectorKind, path: &Path, verbose: bool) -> Result<ProbeReport>;

    /// Stream listing of an audio/video file, `None` when the probe fails.
    fn streams(&self, path: &Path) -> Result<Option<Vec<StreamInfo>>>;

    /// Structured info for a freshly converted file.
    fn media_info(&self, kind: InspectorKind, path: &Path) -> Result<Option<MediaInfo>>;
}

pub trait Converter: Send + Sync {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<ConversionOutput>;
}

/// Which probe handles a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectorKind {
    /// ffprobe / ffmpeg
    Media,
    /// ImageMagick identify
    Image,
    NotInspectable,
}

impl InspectorKind {
    /// Probe for a policy tool, inferring from the top-level MIME type when the
    /// policy names none. The flag is true when the choice was inferred.
    pub fn resolve(tool: Tool, mime: &str) -> (Self, bool) {
        match tool {
            Tool::Ffmpeg => (InspectorKind::Media, false),
            Tool::Magick => (InspectorKind::Image, false),
            Tool::Soffice => (InspectorKind::NotInspectable, false),
            Tool::None => match mime.split('/').next().unwrap_or("") {
                "image" => (InspectorKind::Image, true),
                "audio" | "video" => (InspectorKind::Media, true),
                _ => (InspectorKind::NotInspectable, false),
            },
        }
    }

    pub fn tool(&self) -> Tool {
        match self {
            InspectorKind::Media => Tool::Ffmpeg,
            InspectorKind::Image => Tool::Magick,
            InspectorKind::NotInspectable => Tool::None,
        }
    }
}

/// Tri-state probe outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub corrupt: bool,
    pub warning: String,
    pub info: Option<MediaInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub codec_name: String,
    #[serde(default)]
    pub codec_type: String,
}

#[derive(Debug, Clone)]
pub struct ConversionRequest<'a> {
    pub source: &'a Path,
    pub tool: Tool,
    pub target_container: &'a str,
    pub args: &'a str,
    /// Per-conversion directory, already created.
    pub work_dir: &'a Path,
    pub stem: &'a str,
}

impl ConversionRequest<'_> {
    pub fn target_path(&self) -> PathBuf {
        self.work_dir
            .join(format!("{}.{}", self.stem, self.target_container))
    }

    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.log", self.stem))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutput {
    pub target: PathBuf,
    pub command: String,
    pub log_path: PathBuf,
}

/// The set of external collaborators used by a run.
pub struct Toolbox {
    pub identifier: Box<dyn Identifier>,
    pub probe: Box<dyn MediaProbe>,
    pub converter: Box<dyn Converter>,
}

impl Toolbox {
    /// Process-backed tools found on `PATH`.
    pub fn external() -> Self {
        Self {
            identifier: Box::new(Siegfried::default()),
            probe: Box::new(ExternalProbe),
            converter: Box::new(ExternalConverter::default()),
        }
    }
}

/// Probe backed by ffprobe/ffmpeg and ImageMagick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalProbe;

impl MediaProbe for ExternalProbe {
    fn inspect(&self, kind: InspectorKind, path: &Path, verbose: bool) -> Result<ProbeReport> {
        match kind {
            InspectorKind::Media => ffmpeg::inspect(path, verbose),
            InspectorKind::Image => magick::inspect(path, verbose),
            InspectorKind::NotInspectable => Ok(ProbeReport::default()),
        }
    }

    fn streams(&self, path: &Path) -> Result<Option<Vec<StreamInfo>>> {
        Ok(ffmpeg::stream_listing(path)?.map(|listing| ffmpeg::streams_of(&listing)))
    }

    fn media_info(&self, kind: InspectorKind, path: &Path) -> Result<Option<MediaInfo>> {
        match kind {
            InspectorKind::Media => Ok(ffmpeg::stream_listing(path)?.map(|data| MediaInfo {
                source: Tool::Ffmpeg.as_str().to_string(),
                data,
            })),
            InspectorKind::Image => magick::media_info(path),
            InspectorKind::NotInspectable => Ok(None),
        }
    }
}

/// Run a program to completion, mapping spawn failures to [`Error::Tool`].
pub(crate) fn run(program: &str, args: &[&std::ffi::OsStr]) -> Result<Output> {
    Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::tool(program, format!("cannot run: {e}")))
}

/// Strip a directory prefix from tool output so logs stay readable.
pub(crate) fn strip_dir(text: &str, path: &Path) -> String {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            text.replace(&parent.to_string_lossy().into_owned(), "")
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_inspector() {
        assert_eq!(InspectorKind::resolve(Tool::Ffmpeg, "image/png"), (InspectorKind::Media, false));
        assert_eq!(InspectorKind::resolve(Tool::Soffice, "video/mp4"), (InspectorKind::NotInspectable, false));
        assert_eq!(InspectorKind::resolve(Tool::None, "image/tiff"), (InspectorKind::Image, true));
        assert_eq!(InspectorKind::resolve(Tool::None, "audio/x-wav"), (InspectorKind::Media, true));
        assert_eq!(InspectorKind::resolve(Tool::None, "application/pdf"), (InspectorKind::NotInspectable, false));
        assert_eq!(InspectorKind::resolve(Tool::None, ""), (InspectorKind::NotInspectable, false));
    }

    #[test]
    fn test_conversion_paths() {
        let request = ConversionRequest {
            source: Path::new("/in/a/raw.cr2"),
            tool: Tool::Magick,
            target_container: "tif",
            args: "",
            work_dir: Path::new("/w/raw.cr2_abcdef"),
            stem: "raw",
        };
        assert_eq!(request.target_path(), PathBuf::from("/w/raw.cr2_abcdef/raw.tif"));
        assert_eq!(request.log_path(), PathBuf::from("/w/raw.cr2_abcdef/raw.log"));
    }
}
