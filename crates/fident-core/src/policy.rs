use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::FormatRegistry;

const DEFAULT_POLICIES: &str = include_str!("../data/default_policies.json");

/// External tool used to inspect and convert a format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tool {
    #[serde(rename = "magick")]
    Magick,
    #[serde(rename = "ffmpeg")]
    Ffmpeg,
    #[serde(rename = "soffice")]
    Soffice,
    #[default]
    #[serde(rename = "")]
    None,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Magick => "magick",
            Tool::Ffmpeg => "ffmpeg",
            Tool::Soffice => "soffice",
            Tool::None => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMatch {
    /// Every stream must use one of the codecs.
    All,
    /// At least one stream must use one of the codecs.
    Any,
}

/// Codec constraint on the streams of an accepted container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRule {
    pub mode: StreamMatch,
    pub codecs: Vec<String>,
}

impl StreamRule {
    pub fn is_satisfied_by<'a>(&self, codecs: impl IntoIterator<Item = &'a str>) -> bool {
        let allowed = |c: &str| self.codecs.iter().any(|a| a == c);
        let mut codecs = codecs.into_iter();
        match self.mode {
            StreamMatch::All => codecs.all(allowed),
            StreamMatch::Any => codecs.any(allowed),
        }
    }
}

/// Rules for containers whose policy does not declare one.
pub fn builtin_stream_rule(format: &str) -> Option<StreamRule> {
    match format {
        "fmt/199" => Some(StreamRule {
            mode: StreamMatch::All,
            codecs: vec!["h264".to_string(), "aac".to_string()],
        }),
        "fmt/569" => Some(StreamRule {
            mode: StreamMatch::Any,
            codecs: vec!["ffv1".to_string()],
        }),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    #[serde(default)]
    pub format_name: String,
    #[serde(default)]
    pub bin: Tool,
    #[serde(default = "default_true")]
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_container: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub processing_args: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected: Vec<String>,
    #[serde(default)]
    pub remove_original: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_rule: Option<StreamRule>,
}

impl PolicyEntry {
    /// Skeleton entry: accepted, no conversion fields.
    pub fn blank(format_name: &str) -> Self {
        Self {
            format_name: format_name.to_string(),
            bin: Tool::None,
            accepted: true,
            target_container: String::new(),
            processing_args: String::new(),
            expected: Vec::new(),
            remove_original: false,
            stream_rule: None,
        }
    }

    pub fn validate(&self, format: &str) -> Result<()> {
        if self.processing_args.contains(';') {
            return Err(Error::policy(format, "processing_args must not contain ';'"));
        }
        if !self.accepted {
            if self.target_container.is_empty() {
                return Err(Error::policy(format, "target_container is required when not accepted"));
            }
            if self.expected.iter().all(|e| e.is_empty()) {
                return Err(Error::policy(format, "expected is required when not accepted"));
            }
            if self.bin == Tool::None {
                return Err(Error::policy(format, "bin is required when not accepted"));
            }
        }
        Ok(())
    }

    pub fn effective_stream_rule(&self, format: &str) -> Option<StreamRule> {
        self.stream_rule.clone().or_else(|| builtin_stream_rule(format))
    }
}

/// The policy document: `{name, comment, policies: {format: entry}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyEntry>,
}

#[derive(Deserialize)]
struct RawPolicyFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    policies: BTreeMap<String, serde_json::Value>,
}

impl PolicyFile {
    /// Parse and validate a policy document. Entries are decoded one by one
    /// so errors name the offending format.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawPolicyFile = serde_json::from_str(text)?;
        let mut policies = BTreeMap::new();
        for (format, value) in raw.policies {
            let entry: PolicyEntry =
                serde_json::from_value(value).map_err(|e| Error::policy(&format, e.to_string()))?;
            entry.validate(&format)?;
            policies.insert(format, entry);
        }
        Ok(Self {
            name: raw.name,
            comment: raw.comment,
            policies,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn builtin_defaults() -> Result<Self> {
        Self::from_json(DEFAULT_POLICIES)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn get(&self, format: &str) -> Option<&PolicyEntry> {
        self.policies.get(format)
    }

    pub fn contains(&self, format: &str) -> bool {
        self.policies.contains_key(format)
    }
}

/// Result of generating a policy table for a run.
#[derive(Debug, Clone, Default)]
pub struct GeneratedPolicies {
    pub file: PolicyFile,
    /// Formats that got a synthesized blank entry and want operator review.
    pub non_default: Vec<String>,
}

/// One accepted skeleton entry per encountered format.
pub fn generate_blank<'a>(
    name: &str,
    formats: impl IntoIterator<Item = &'a str>,
    registry: &FormatRegistry,
    remove_original: bool,
) -> PolicyFile {
    let mut file = PolicyFile {
        name: name.to_string(),
        comment: "autogenerated blank policies".to_string(),
        policies: BTreeMap::new(),
    };
    for format in formats {
        let mut entry = PolicyEntry::blank(registry.name(format));
        entry.remove_original = remove_original;
        file.policies.insert(format.to_string(), entry);
    }
    file
}

/// Options that shape default generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    pub strict: bool,
    pub remove_original: bool,
}

/// Build the policy-of-record from the built-in defaults.
///
/// With `existing`, every entry already present is kept unchanged and only
/// formats missing from it are added. Without a default, a format gets a
/// blank accepted entry in lenient mode and no entry in strict mode.
pub fn generate_default<'a>(
    name: &str,
    formats: impl IntoIterator<Item = &'a str>,
    registry: &FormatRegistry,
    defaults: &PolicyFile,
    existing: Option<&PolicyFile>,
    options: GenerateOptions,
) -> GeneratedPolicies {
    let mut comment = "autogenerated using default policies".to_string();
    if options.strict {
        comment.push_str(" in strict mode");
    }
    if let Some(existing) = existing {
        comment.push_str(&format!(" extending {}", existing.name));
    }

    let mut file = PolicyFile {
        name: name.to_string(),
        comment,
        policies: existing.map(|e| e.policies.clone()).unwrap_or_default(),
    };
    let mut non_default = Vec::new();

    for format in formats {
        if file.policies.contains_key(format) {
            continue;
        }
        let mut entry = match defaults.get(format) {
            Some(default) => default.clone(),
            None if options.strict => continue,
            None => {
                non_default.push(format.to_string());
                PolicyEntry::blank(registry.name(format))
            }
        };
        if options.remove_original {
            entry.remove_original = true;
        }
        file.policies.insert(format.to_string(), entry);
    }

    GeneratedPolicies { file, non_default }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FormatRegistry {
        FormatRegistry::builtin().unwrap()
    }

    #[test]
    fn test_builtin_defaults_are_valid() {
        let defaults = PolicyFile::builtin_defaults().unwrap();
        let raw = defaults.get("fmt/592").unwrap();
        assert!(!raw.accepted);
        assert_eq!(raw.bin, Tool::Magick);
        assert_eq!(raw.target_container, "tif");
        assert_eq!(raw.expected, vec!["fmt/353".to_string()]);
        assert_eq!(
            defaults.get("fmt/199").unwrap().stream_rule.as_ref().unwrap().mode,
            StreamMatch::All
        );
    }

    #[test]
    fn test_rejects_semicolon_in_args() {
        let json = r#"{"name": "p", "policies": {"fmt/5": {
            "bin": "ffmpeg", "accepted": false, "target_container": "mp4",
            "processing_args": "-c:v libx264; rm -rf /", "expected": ["fmt/199"]}}}"#;
        let err = PolicyFile::from_json(json).unwrap_err();
        assert!(matches!(err, Error::PolicyValidation { ref format, .. } if format == "fmt/5"));
    }

    #[test]
    fn test_rejects_unknown_tool() {
        let json = r#"{"policies": {"fmt/5": {"bin": "handbrake", "accepted": true}}}"#;
        let err = PolicyFile::from_json(json).unwrap_err();
        assert!(matches!(err, Error::PolicyValidation { ref format, .. } if format == "fmt/5"));
    }

    #[test]
    fn test_rejects_incomplete_conversion_entry() {
        for entry in [
            r#"{"bin": "ffmpeg", "accepted": false, "expected": ["fmt/199"]}"#,
            r#"{"bin": "ffmpeg", "accepted": false, "target_container": "mp4"}"#,
            r#"{"bin": "ffmpeg", "accepted": false, "target_container": "mp4", "expected": [""]}"#,
            r#"{"accepted": false, "target_container": "mp4", "expected": ["fmt/199"]}"#,
        ] {
            let json = format!(r#"{{"policies": {{"fmt/5": {entry}}}}}"#);
            assert!(PolicyFile::from_json(&json).is_err(), "{entry}");
        }
    }

    #[test]
    fn test_stream_rules() {
        let mp4 = builtin_stream_rule("fmt/199").unwrap();
        assert!(mp4.is_satisfied_by(["h264", "aac"]));
        assert!(!mp4.is_satisfied_by(["h264", "mp3"]));

        let mkv = builtin_stream_rule("fmt/569").unwrap();
        assert!(mkv.is_satisfied_by(["ffv1", "flac"]));
        assert!(!mkv.is_satisfied_by(["h264", "aac"]));
        assert!(builtin_stream_rule("fmt/5").is_none());
    }

    #[test]
    fn test_generate_blank_one_entry_per_format() {
        let file = generate_blank("p.json", ["fmt/592", "fmt/11", "fmt/592"], &registry(), false);
        assert_eq!(file.policies.len(), 2);
        assert!(file.policies.values().all(|p| p.accepted && p.bin == Tool::None));
        assert_eq!(file.get("fmt/11").unwrap().format_name, "Portable Network Graphics");
    }

    #[test]
    fn test_generate_default_lenient_and_strict() {
        let defaults = PolicyFile::builtin_defaults().unwrap();
        let formats = ["fmt/592", "fmt/9999"];

        let lenient = generate_default("p", formats, &registry(), &defaults, None, GenerateOptions::default());
        assert!(!lenient.file.get("fmt/592").unwrap().accepted);
        assert!(lenient.file.get("fmt/9999").unwrap().accepted);
        assert_eq!(lenient.non_default, vec!["fmt/9999".to_string()]);

        let strict = generate_default(
            "p",
            formats,
            &registry(),
            &defaults,
            None,
            GenerateOptions { strict: true, remove_original: false },
        );
        assert!(strict.file.contains("fmt/592"));
        assert!(!strict.file.contains("fmt/9999"));
        assert!(strict.non_default.is_empty());
    }

    #[test]
    fn test_extend_preserves_existing_entries() {
        let defaults = PolicyFile::builtin_defaults().unwrap();
        let mut existing = PolicyFile {
            name: "mine.json".to_string(),
            ..Default::default()
        };
        existing.policies.insert("fmt/592".to_string(), PolicyEntry::blank("my raw"));
        existing.policies.insert("fmt/1".to_string(), PolicyEntry::blank("not in scan"));

        let extended = generate_default(
            "p",
            ["fmt/592", "fmt/11"],
            &registry(),
            &defaults,
            Some(&existing),
            GenerateOptions { strict: false, remove_original: true },
        );
        let raw = extended.file.get("fmt/592").unwrap();
        assert_eq!(raw.format_name, "my raw");
        assert!(raw.accepted);
        assert!(!raw.remove_original);
        assert!(extended.file.contains("fmt/1"));
        assert!(extended.file.get("fmt/11").unwrap().remove_original);
    }
}
