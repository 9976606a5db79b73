use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use super::{ConversionOutput, ConversionRequest, Converter};
use crate::error::{Error, Result};
use crate::policy::Tool;

/// LibreOffice export filter selecting PDF/A-2.
const PDF_EXPORT: &str = r#"pdf:writer_pdf_Export:{"SelectPdfVersion":{"type":"long","value":"2"}}"#;

#[cfg(target_os = "macos")]
const SOFFICE: &str = "/Applications/LibreOffice.app/Contents/MacOS/soffice";
#[cfg(not(target_os = "macos"))]
const SOFFICE: &str = "libreoffice";

/// Converter running ffmpeg, ImageMagick or LibreOffice.
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    pub soffice: String,
}

impl Default for ExternalConverter {
    fn default() -> Self {
        Self {
            soffice: SOFFICE.to_string(),
        }
    }
}

impl ExternalConverter {
    /// Program and argument vector for a request. Policy arguments are split
    /// on whitespace and never pass through a shell.
    pub fn command(&self, request: &ConversionRequest<'_>) -> Result<(String, Vec<OsString>)> {
        let policy_args = request.args.split_whitespace().map(OsString::from);
        let source = request.source.as_os_str().to_os_string();
        let target = request.target_path().into_os_string();

        let (program, args): (String, Vec<OsString>) = match request.tool {
            Tool::Ffmpeg => {
                let mut args = vec!["-y".into(), "-i".into(), source];
                args.extend(policy_args);
                args.push(target);
                ("ffmpeg".to_string(), args)
            }
            Tool::Magick => {
                let mut args: Vec<OsString> = policy_args.collect();
                args.extend([source, target]);
                ("magick".to_string(), args)
            }
            Tool::Soffice => {
                let mut args: Vec<OsString> = policy_args.collect();
                if request.target_container == "pdf" {
                    args.push(PDF_EXPORT.into());
                } else {
                    args.push(request.target_container.into());
                }
                args.extend([
                    source,
                    "--outdir".into(),
                    request.work_dir.as_os_str().to_os_string(),
                ]);
                (self.soffice.clone(), args)
            }
            Tool::None => {
                return Err(Error::tool("converter", "policy names no conversion tool"));
            }
        };
        Ok((program, args))
    }
}

impl Converter for ExternalConverter {
    fn convert(&self, request: &ConversionRequest<'_>) -> Result<ConversionOutput> {
        let (program, args) = self.command(request)?;
        let command = command_line(&program, &args);
        let log_path = request.log_path();
        let log = File::create(&log_path)?;

        debug!(%command, "running converter");
        let mut cmd = Command::new(&program);
        cmd.args(&args).stdin(Stdio::null());
        if request.tool == Tool::Soffice {
            cmd.stdout(Stdio::from(log.try_clone()?));
        } else {
            cmd.stdout(Stdio::null());
        }
        cmd.stderr(Stdio::from(log));
        let status = cmd
            .status()
            .map_err(|e| Error::tool(&program, format!("cannot run: {e}")))?;

        // the output is still verified, a partial file may be usable
        if !status.success() {
            warn!(%command, "converter {status}");
            let mut log = OpenOptions::new().append(true).open(&log_path)?;
            writeln!(log, "{program} exited with {status}")?;
        }

        Ok(ConversionOutput {
            target: request.target_path(),
            command,
            log_path,
        })
    }
}

/// Printable command line for the audit log.
pub fn command_line(program: &str, args: &[OsString]) -> String {
    let mut line = quote(program);
    for arg in args {
        line.push(' ');
        line.push_str(&quote(&arg.to_string_lossy()));
    }
    line
}

fn quote(token: &str) -> String {
    if !token.is_empty() && !token.contains(|c: char| c.is_whitespace() || "'\"{}$`\\".contains(c)) {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request<'a>(tool: Tool, container: &'a str, args: &'a str) -> ConversionRequest<'a> {
        ConversionRequest {
            source: Path::new("/in/my clip.avi"),
            tool,
            target_container: container,
            args,
            work_dir: Path::new("/w/my clip.avi_abc123"),
            stem: "my clip",
        }
    }

    #[test]
    fn test_ffmpeg_command() {
        let converter = ExternalConverter::default();
        let (program, args) = converter
            .command(&request(Tool::Ffmpeg, "mp4", "-c:v libx264  -crf 18"))
            .unwrap();
        assert_eq!(
            command_line(&program, &args),
            "ffmpeg -y -i '/in/my clip.avi' -c:v libx264 -crf 18 '/w/my clip.avi_abc123/my clip.mp4'"
        );
    }

    #[test]
    fn test_magick_command() {
        let converter = ExternalConverter::default();
        let (program, args) = converter.command(&request(Tool::Magick, "tif", "")).unwrap();
        assert_eq!(program, "magick");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_soffice_pdf_filter() {
        let converter = ExternalConverter { soffice: "soffice".to_string() };
        let (_, args) = converter
            .command(&request(Tool::Soffice, "pdf", "--headless --convert-to"))
            .unwrap();
        assert_eq!(args[2], OsString::from(PDF_EXPORT));
        assert_eq!(args[4], OsString::from("--outdir"));

        let (_, args) = converter
            .command(&request(Tool::Soffice, "docx", "--headless --convert-to"))
            .unwrap();
        assert_eq!(args[2], OsString::from("docx"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_exit_is_written_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("letter.doc");
        std::fs::write(&source, b"doc").unwrap();
        let converter = ExternalConverter { soffice: "false".to_string() };
        let request = ConversionRequest {
            source: &source,
            tool: Tool::Soffice,
            target_container: "docx",
            args: "--headless --convert-to",
            work_dir: dir.path(),
            stem: "letter",
        };

        let output = converter.convert(&request).unwrap();
        assert!(!output.target.exists());
        let log = std::fs::read_to_string(&output.log_path).unwrap();
        assert!(log.contains("false exited with exit status: 1"), "{log}");
    }

    #[test]
    fn test_no_tool_is_an_error() {
        let converter = ExternalConverter::default();
        assert!(converter.command(&request(Tool::None, "tif", "")).is_err());
    }
}
