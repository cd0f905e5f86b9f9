use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::KbError;
use crate::store::{read_json_or_default, write_json_atomic};

/// Display metadata and default analyses for one decimal category.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Decimal {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_analyses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    #[serde(default)]
    pub description: String,
}

/// `config/registry.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub decimals: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub tags: BTreeMap<String, Tag>,
}

fn decimal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2}(\.\d{2})*$").expect("valid decimal regex"))
}

/// Validate a decimal code such as `50.01.01`.
pub fn validate_code(code: &str) -> Result<(), KbError> {
    if decimal_re().is_match(code) {
        Ok(())
    } else {
        Err(KbError::invalid(
            "decimal",
            format!("{code} (expected NN, NN.NN, NN.NN.NN, ...)"),
        ))
    }
}

/// Parent code: `50.01.01` -> `50.01`, `50` -> None.
pub fn parent_code(code: &str) -> Option<&str> {
    code.rsplit_once('.').map(|(parent, _)| parent)
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        read_json_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn get(&self, code: &str) -> Option<&Decimal> {
        self.decimals.get(code)
    }

    /// Add or replace a decimal.
    pub fn add_decimal(&mut self, code: &str, decimal: Decimal) -> Result<(), KbError> {
        validate_code(code)?;
        if decimal.name.trim().is_empty() {
            return Err(KbError::invalid("decimal name", "must not be empty"));
        }
        self.decimals.insert(code.to_string(), decimal);
        Ok(())
    }

    pub fn remove_decimal(&mut self, code: &str) -> Result<Decimal, KbError> {
        self.decimals
            .remove(code)
            .ok_or_else(|| KbError::not_found("decimal", code))
    }

    pub fn set_default_analyses(&mut self, code: &str, analyses: Vec<String>) -> Result<(), KbError> {
        let d = self
            .decimals
            .get_mut(code)
            .ok_or_else(|| KbError::not_found("decimal", code))?;
        d.default_analyses = analyses;
        Ok(())
    }

    /// Default analyses for a code: its own non-empty list, else the nearest
    /// ancestor's non-empty list, else nothing.
    pub fn effective_analyses(&self, code: &str) -> Vec<String> {
        let mut current = Some(code);
        while let Some(c) = current {
            if let Some(d) = self.decimals.get(c) {
                if !d.default_analyses.is_empty() {
                    return d.default_analyses.clone();
                }
            }
            current = parent_code(c);
        }
        Vec::new()
    }

    /// Human label: `50.01.01 Podcasts`.
    pub fn label(&self, code: &str) -> String {
        match self.decimals.get(code) {
            Some(d) => format!("{code} {}", d.name),
            None => code.to_string(),
        }
    }

    pub fn add_tag(&mut self, name: &str, description: &str) -> Result<(), KbError> {
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(KbError::invalid("tag", format!("{name:?}")));
        }
        self.tags.insert(
            name.to_string(),
            Tag {
                description: description.to_string(),
            },
        );
        Ok(())
    }

    pub fn remove_tag(&mut self, name: &str) -> Result<(), KbError> {
        self.tags
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KbError::not_found("tag", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decimal(name: &str, analyses: &[&str]) -> Decimal {
        Decimal {
            name: name.to_string(),
            description: String::new(),
            default_analyses: analyses.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn validates_codes() {
        for ok in ["50", "50.01", "50.01.01"] {
            assert!(validate_code(ok).is_ok(), "{ok}");
        }
        for bad in ["5", "50.1", "50.01.", "ab.01", ""] {
            assert!(validate_code(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn effective_analyses_inherit_from_ancestors() {
        let mut reg = Registry::default();
        reg.add_decimal("50", decimal("Media", &["summary"])).unwrap();
        reg.add_decimal("50.01", decimal("Podcasts", &[])).unwrap();
        reg.add_decimal("50.01.01", decimal("Guest episodes", &["summary", "linkedin_post"]))
            .unwrap();

        assert_eq!(reg.effective_analyses("50.01.01"), vec!["summary", "linkedin_post"]);
        assert_eq!(reg.effective_analyses("50.01"), vec!["summary"]);
        assert_eq!(reg.effective_analyses("50.01.02"), vec!["summary"]);
        assert!(reg.effective_analyses("60").is_empty());
    }

    #[test]
    fn set_analyses_requires_existing_decimal() {
        let mut reg = Registry::default();
        assert!(matches!(
            reg.set_default_analyses("10", vec![]),
            Err(KbError::NotFound { .. })
        ));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut reg = Registry::default();
        reg.add_decimal("20.01", decimal("Talks", &["summary"])).unwrap();
        reg.add_tag("ai", "AI topics").unwrap();
        reg.save(&path).unwrap();

        let back = Registry::load(&path).unwrap();
        assert_eq!(back.label("20.01"), "20.01 Talks");
        assert!(back.tags.contains_key("ai"));
    }

    #[test]
    fn rejects_tags_with_spaces() {
        let mut reg = Registry::default();
        assert!(reg.add_tag("two words", "").is_err());
        assert!(reg.remove_tag("absent").is_err());
    }
}
