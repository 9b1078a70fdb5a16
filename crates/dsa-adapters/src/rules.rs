use std::path::Path;

use anyhow::{Context, Result};
use dsa_core::CertType;
use serde::Deserialize;

/// Project type assigned when the source text matches no rule.
pub const UNKNOWN_PROJECT_TYPE: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CertRule {
    pub cert: CertType,
    /// Exact (case-insensitive) values of the whole field.
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectTypeRule {
    pub category: String,
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub contains_any: Vec<String>,
}

/// Code to category maps for cert types and project types. Exact code matches
/// win over substring matches; within each pass the first rule listed wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClassificationRules {
    #[allow(dead_code)]
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    pub cert_types: Vec<CertRule>,
    #[serde(default)]
    pub project_types: Vec<ProjectTypeRule>,
}

fn default_version() -> u32 {
    1
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

fn cert(cert: CertType, codes: &[&str], contains_any: &[&str]) -> CertRule {
    CertRule {
        cert,
        codes: strings(codes),
        contains_any: strings(contains_any),
    }
}

fn project_type(category: &str, codes: &[&str], contains_any: &[&str]) -> ProjectTypeRule {
    ProjectTypeRule {
        category: category.to_string(),
        codes: strings(codes),
        contains_any: strings(contains_any),
    }
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            version: 1,
            cert_types: vec![
                cert(
                    CertType::Dsa,
                    &["DSA", "CERT", "CERTIFIED"],
                    &["certification & close of file", "certified"],
                ),
                cert(
                    CertType::Other,
                    &["VOID", "EXC", "OTHER"],
                    &["w/o certification", "yr void", "voided", "exception"],
                ),
                cert(
                    CertType::Pc,
                    &["PC", "P/C", "PLAN CHECK"],
                    &["301p", "plan check", "notification of requirement"],
                ),
            ],
            project_types: vec![
                project_type("New Construction", &["NC", "NEW"], &["new construction", "new building"]),
                project_type("Addition", &["ADD"], &["addition"]),
                project_type("Alteration", &["ALT"], &["alteration", "remodel", "modernization"]),
                project_type("Relocatable", &["REL", "PORT"], &["relocatable", "portable", "modular"]),
                project_type("Reconstruction", &["RECON"], &["reconstruction"]),
                project_type("Repair", &["REP"], &["repair"]),
                project_type("Accessibility", &["ACC", "ADA"], &["accessib"]),
                project_type("Site Work", &["SITE"], &["site work", "paving"]),
            ],
        }
    }
}

fn matches_rule(haystack: &str, codes: &[String], contains_any: &[String], exact: bool) -> bool {
    if exact {
        codes.iter().any(|c| c.eq_ignore_ascii_case(haystack))
    } else {
        let lower = haystack.to_ascii_lowercase();
        contains_any
            .iter()
            .any(|needle| lower.contains(&needle.to_ascii_lowercase()))
    }
}

impl ClassificationRules {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing classification rules")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `None` when the text is blank or no rule recognizes it.
    pub fn classify_cert(&self, raw: &str) -> Option<CertType> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        [true, false].into_iter().find_map(|exact| {
            self.cert_types
                .iter()
                .find(|rule| matches_rule(raw, &rule.codes, &rule.contains_any, exact))
                .map(|rule| rule.cert)
        })
    }

    pub fn classify_project_type(&self, raw: &str) -> Option<&str> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        [true, false].into_iter().find_map(|exact| {
            self.project_types
                .iter()
                .find(|rule| matches_rule(raw, &rule.codes, &rule.contains_any, exact))
                .map(|rule| rule.category.as_str())
        })
    }
}
