use std::cmp::Ordering;
use std::io::Read;

use anyhow::{Context, Result};
use rootpack_core::{compare_versions, PackageMeta};
use thiserror::Error;
use tracing::debug;

use crate::source::{meta_artifact_path, RepositorySet};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("package {name} not found on any configured repository")]
    NotFound { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMetadata {
    pub meta: PackageMeta,
    /// Index into the [`RepositorySet`] the metadata was read from.
    pub repository: usize,
}

/// Reads `pkg/<name>.meta` from every repository and keeps the highest
/// version. On equal versions the earlier repository wins.
pub fn resolve_metadata(repos: &RepositorySet, name: &str) -> Result<ResolvedMetadata> {
    let relative_path = meta_artifact_path(name);
    let mut best: Option<ResolvedMetadata> = None;

    for (index, repo) in repos.iter().enumerate() {
        let Some(mut reader) = repo
            .open(&relative_path)
            .with_context(|| format!("failed reading {relative_path} from repository {repo}"))?
        else {
            debug!(repository = %repo, "{relative_path} not present");
            continue;
        };

        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .with_context(|| format!("failed reading {relative_path} from repository {repo}"))?;
        let meta = PackageMeta::from_toml_str(&content)
            .with_context(|| format!("invalid {relative_path} in repository {repo}"))?;
        debug!(repository = %repo, version = %meta.version, "found {relative_path}");

        let newer = match &best {
            Some(current) => {
                compare_versions(&meta.version, &current.meta.version) == Ordering::Greater
            }
            None => true,
        };
        if newer {
            best = Some(ResolvedMetadata {
                meta,
                repository: index,
            });
        }
    }

    best.ok_or_else(|| {
        ResolveError::NotFound {
            name: name.to_string(),
        }
        .into()
    })
}
