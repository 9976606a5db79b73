use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

const BUILTIN_TABLE: &str = include_str!("../data/fmt2ext.json");

/// Human name and expected extensions of a format id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatInfo {
    pub name: String,
    #[serde(default)]
    pub file_extensions: Vec<String>,
}

/// Static lookup table from format id to name and extensions.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: HashMap<String, FormatInfo>,
}

impl FormatRegistry {
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            formats: serde_json::from_str(BUILTIN_TABLE)?,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(Self {
            formats: serde_json::from_reader(reader)?,
        })
    }


    pub fn name(&self, format: &str) -> &str {
        self.formats.get(format).map_or("unknown", |f| f.name.as_str())
    }

    pub fn extensions(&self, format: &str) -> &[String] {
        self.formats
            .get(format)
            .map(|f| f.file_extensions.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let registry = FormatRegistry::builtin().unwrap();
        assert_eq!(registry.name("fmt/353"), "Tagged Image File Format");
        assert_eq!(registry.extensions("fmt/11").to_vec(), vec!["png".to_string()]);
        assert_eq!(registry.extensions("fmt/42").len(), 3);
    }

    #[test]
    fn test_unknown_format() {
        let registry = FormatRegistry::default();
        assert_eq!(registry.name("fmt/0"), "unknown");
        assert!(registry.extensions("fmt/0").is_empty());
    }
}
