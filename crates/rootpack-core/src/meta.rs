use std::collections::HashSet;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::package::validate_package_name;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageMeta {
    pub version: String,
    #[serde(default)]
    pub runtime_deps: Vec<String>,
}

impl PackageMeta {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let meta: Self = toml::from_str(input).context("failed to parse package metadata")?;
        if meta.version.trim().is_empty() {
            return Err(anyhow!("package metadata version must not be empty"));
        }

        let mut seen = HashSet::new();
        for dep in &meta.runtime_deps {
            validate_package_name(dep)
                .with_context(|| format!("invalid runtime dependency '{dep}'"))?;
            if !seen.insert(dep.as_str()) {
                return Err(anyhow!("duplicate runtime dependency '{dep}'"));
            }
        }
        Ok(meta)
    }

    #[cfg(test)]
    pub(crate) fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize package metadata")
    }
}
