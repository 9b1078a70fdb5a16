use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use dsa_core::District;
use serde::Deserialize;

use crate::config::ConfigError;

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    counties: Vec<CountyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CountyEntry {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    code: Option<String>,
    #[serde(default)]
    districts: Vec<DistrictEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct DistrictEntry {
    name: String,
    code: String,
}

/// County to district lookup. Loaded once and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct DistrictCatalog {
    counties: Vec<(String, Vec<District>)>,
}

impl DistrictCatalog {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml).context("parsing district catalog")?;
        let mut seen = HashSet::new();
        let mut counties = Vec::with_capacity(file.counties.len());
        for county in file.counties {
            let mut districts = Vec::with_capacity(county.districts.len());
            for entry in county.districts {
                let code = entry.code.trim().to_string();
                if code.is_empty() {
                    anyhow::bail!("district {:?} in {} has an empty code", entry.name, county.name);
                }
                if !seen.insert(code.clone()) {
                    anyhow::bail!("district code {code} is listed more than once");
                }
                districts.push(District {
                    county: county.name.clone(),
                    name: entry.name.trim().to_string(),
                    code,
                });
            }
            counties.push((county.name, districts));
        }
        Ok(Self { counties })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn counties(&self) -> Vec<&str> {
        self.counties.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Districts of a county, matched case-insensitively.
    pub fn districts_in(&self, county: &str) -> Option<&[District]> {
        self.counties
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(county.trim()))
            .map(|(_, districts)| districts.as_slice())
    }

    pub fn find(&self, code: &str) -> Option<&District> {
        let code = code.trim();
        self.all().find(|d| d.code == code)
    }

    pub fn all(&self) -> impl Iterator<Item = &District> {
        self.counties.iter().flat_map(|(_, districts)| districts.iter())
    }

    /// Resolve district codes in the order given. Repeated codes are kept once.
    pub fn select<S: AsRef<str>>(&self, codes: &[S]) -> Result<Vec<District>, ConfigError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for code in codes {
            let code = code.as_ref().trim();
            let district = self
                .find(code)
                .ok_or_else(|| ConfigError::UnknownDistrict(code.to_string()))?;
            if seen.insert(district.code.clone()) {
                out.push(district.clone());
            }
        }
        Ok(out)
    }
}
