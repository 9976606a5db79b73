use std::ffi::OsStr;
use std::path::Path;

use serde_json::Value;

use super::{run, Identifier};
use crate::error::{Error, Result};
use crate::record::IdentifierOutput;

/// Identifier backed by the `sf` command line tool.
#[derive(Debug, Clone)]
pub struct Siegfried {
    pub program: String,
}

impl Default for Siegfried {
    fn default() -> Self {
        Self {
            program: "sf".to_string(),
        }
    }
}

impl Identifier for Siegfried {
    fn identify(&self, path: &Path) -> Result<IdentifierOutput> {
        let out = run(&self.program, &[OsStr::new("-json"), path.as_os_str()])?;
        if !out.status.success() && out.stdout.is_empty() {
            return Err(Error::tool(
                &self.program,
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        parse_output(&String::from_utf8_lossy(&out.stdout), path)
    }
}

/// Extract the single file entry from `sf -json` output.
pub fn parse_output(stdout: &str, path: &Path) -> Result<IdentifierOutput> {
    let malformed = |reason: String| Error::MalformedRecord {
        path: path.display().to_string(),
        reason,
    };
    let mut doc: Value = serde_json::from_str(stdout).map_err(|e| malformed(e.to_string()))?;
    let entry = doc
        .get_mut("files")
        .and_then(|files| files.as_array_mut())
        .and_then(|files| files.first_mut())
        .map(Value::take)
        .ok_or_else(|| malformed("no file entry in identifier output".to_string()))?;
    serde_json::from_value(entry).map_err(|e| malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = r#"{
        "siegfried": "1.11.1",
        "identifiers": [{"name": "pronom", "details": "DROID_SignatureFile_V120.xml"}],
        "files": [{
            "filename": "/in/doc.pdf",
            "filesize": 12345,
            "modified": "2024-03-01T10:00:00+01:00",
            "errors": "",
            "matches": [{
                "ns": "pronom", "id": "fmt/276", "format": "Acrobat PDF 1.7 - Portable Document Format",
                "version": "1.7", "mime": "application/pdf", "class": "Page Description",
                "basis": "extension match pdf; byte match at [[0 8] [12336 3]]", "warning": ""
            }]
        }]
    }"#;

    #[test]
    fn test_parse_output() {
        let output = parse_output(OUTPUT, Path::new("/in/doc.pdf")).unwrap();
        assert_eq!(output.filesize, 12345);
        assert_eq!(output.matches[0].id, "fmt/276");
        assert_eq!(output.matches[0].format_class, "Page Description");
    }

    #[test]
    fn test_parse_output_without_files() {
        let err = parse_output(r#"{"files": []}"#, Path::new("/in/x")).unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { .. }));
        assert!(parse_output("oops", Path::new("/in/x")).is_err());
    }
}
