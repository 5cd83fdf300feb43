//! Sectioned key/value settings with default-section fallback.
//!
//! Lookups never invent values: a key missing from both the named section and
//! the default section resolves to `None` and is reported as a warning, leaving
//! the caller to decide whether absence is fatal.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::warn;

use crate::core::failure::ProvisionError;

/// Name of the distinguished fallback section.
pub const DEFAULT_SECTION: &str = "default";

/// One named section of settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Insert or replace `key`, keeping first-insertion order.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Ordered collection of sections (file order is preserved).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    sections: Vec<Section>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the named section, creating it at the end if missing.
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Builder-style setter used by tests and the loader.
    pub fn with(mut self, section: &str, key: &str, value: &str) -> Self {
        self.section_mut(section).set(key, value);
        self
    }

    /// Resolve `key` in `section`, falling back to the default section.
    pub fn resolve(&self, key: &str, section: Option<&str>) -> Option<&str> {
        if let Some(value) = section
            .and_then(|name| self.section(name))
            .and_then(|s| s.get(key))
        {
            return Some(value);
        }
        if let Some(value) = self.section(DEFAULT_SECTION).and_then(|s| s.get(key)) {
            return Some(value);
        }
        warn!(key, section = section.unwrap_or(DEFAULT_SECTION), "undefined config");
        None
    }

    /// Resolve `key` or fail with a config error naming it.
    pub fn require(&self, key: &str, section: Option<&str>) -> Result<&str> {
        self.resolve(key, section).ok_or_else(|| {
            ProvisionError::config(format!(
                "missing required setting '{key}' (section '{}' or '{DEFAULT_SECTION}')",
                section.unwrap_or(DEFAULT_SECTION)
            ))
            .into()
        })
    }

    /// Resolve a comma-separated list; entries are trimmed and empties dropped.
    pub fn resolve_list(&self, key: &str, section: Option<&str>) -> Vec<String> {
        self.resolve(key, section).map(split_list).unwrap_or_default()
    }

    /// Resolve a boolean flag. Absent or unrecognized values are `false`.
    pub fn resolve_flag(&self, key: &str, section: Option<&str>) -> bool {
        self.resolve(key, section).is_some_and(is_truthy)
    }

    /// Flatten every section into `<section>_<key>` pairs.
    ///
    /// Sections are visited in file order, so on a name collision the later
    /// section wins.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut flat = BTreeMap::new();
        for section in &self.sections {
            for (key, value) in section.entries() {
                flat.insert(format!("{}_{}", section.name, key), value.to_string());
            }
        }
        flat
    }
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::failure::{FailureKind, failure_kind};

    fn sample() -> Settings {
        Settings::new()
            .with("default", "aws_type", "m1.small")
            .with("default", "project_name", "maps")
            .with("webserver", "aws_type", "c1.medium")
            .with("webserver", "userdata_files", "base.sh,web.sh")
    }

    #[test]
    fn section_value_wins_over_default() {
        let settings = sample();
        assert_eq!(
            settings.resolve("aws_type", Some("webserver")),
            Some("c1.medium")
        );
    }

    #[test]
    fn missing_section_key_falls_back_to_default() {
        let settings = sample();
        assert_eq!(
            settings.resolve("project_name", Some("webserver")),
            Some("maps")
        );
        assert_eq!(settings.resolve("aws_type", Some("nosuch")), Some("m1.small"));
        assert_eq!(settings.resolve("aws_type", None), Some("m1.small"));
    }

    #[test]
    fn default_only_key_resolves_for_named_section() {
        let settings = Settings::new().with("default", "aws_type", "t1.micro");
        assert_eq!(
            settings.resolve("aws_type", Some("webserver")),
            Some("t1.micro")
        );
    }

    #[test]
    fn absent_everywhere_is_unresolved() {
        let settings = sample();
        assert_eq!(settings.resolve("aws_keypair", Some("webserver")), None);
        assert_eq!(Settings::new().resolve("aws_type", None), None);
    }

    #[test]
    fn require_reports_config_failure() {
        let err = sample().require("aws_ami", None).unwrap_err();
        assert_eq!(failure_kind(&err), FailureKind::Config);
        assert!(err.to_string().contains("aws_ami"));
    }

    #[test]
    fn list_values_are_trimmed() {
        let settings = Settings::new().with("default", "aws_security_groups", " web, ,db ,");
        assert_eq!(
            settings.resolve_list("aws_security_groups", None),
            vec!["web".to_string(), "db".to_string()]
        );
        assert!(settings.resolve_list("userdata_files", None).is_empty());
    }

    #[test]
    fn flags_accept_common_spellings() {
        let settings = Settings::new()
            .with("default", "a", "Yes")
            .with("default", "b", "0")
            .with("default", "c", "true");
        assert!(settings.resolve_flag("a", None));
        assert!(!settings.resolve_flag("b", None));
        assert!(settings.resolve_flag("c", None));
        assert!(!settings.resolve_flag("d", None));
    }

    #[test]
    fn flatten_prefixes_keys_and_later_section_wins() {
        // "a_b" + "c" and "a" + "b_c" both flatten to "a_b_c".
        let settings = Settings::new()
            .with("a_b", "c", "first")
            .with("a", "b_c", "second")
            .with("default", "project_name", "maps");
        let flat = settings.flatten();
        assert_eq!(flat.get("a_b_c").map(String::as_str), Some("second"));
        assert_eq!(
            flat.get("default_project_name").map(String::as_str),
            Some("maps")
        );
    }

    #[test]
    fn set_replaces_existing_key() {
        let mut settings = Settings::new();
        settings.section_mut("default").set("aws_type", "m1.small");
        settings.section_mut("default").set("aws_type", "m1.large");
        assert_eq!(settings.resolve("aws_type", None), Some("m1.large"));
        assert_eq!(settings.sections().len(), 1);
    }
}
