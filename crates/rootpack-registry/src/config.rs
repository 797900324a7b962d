use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use rootpack_core::KNOWN_ARCHES;
use serde::{Deserialize, Serialize};

use crate::source::RepositoryLocation;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, rename = "repo")]
    pub repos: Vec<RepositoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub path: String,
}

impl RepositoryConfig {
    pub fn locations(&self) -> Vec<RepositoryLocation> {
        self.repos
            .iter()
            .map(|entry| RepositoryLocation::parse(&entry.path))
            .collect()
    }
}

pub fn parse_repository_config(content: &str) -> Result<RepositoryConfig> {
    let config = toml::from_str::<RepositoryConfig>(content)?;
    if let Some(arch) = &config.arch {
        if !KNOWN_ARCHES.contains(&arch.as_str()) {
            anyhow::bail!(
                "unsupported architecture '{arch}' (expected one of: {})",
                KNOWN_ARCHES.join(", ")
            );
        }
    }
    if let Some(position) = config
        .repos
        .iter()
        .position(|entry| entry.path.trim().is_empty())
    {
        anyhow::bail!("repository entry {} has an empty path", position + 1);
    }
    Ok(config)
}

/// Loads the repository configuration at `path`. A missing file is an empty
/// configuration.
pub fn load_repository_config(path: &Path) -> Result<RepositoryConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(RepositoryConfig::default())
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed reading repository config: {}", path.display())
            })
        }
    };
    parse_repository_config(&content)
        .with_context(|| format!("failed parsing repository config: {}", path.display()))
}
