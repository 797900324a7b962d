use anyhow::{Context, Result};
use rootpack_core::PackageRef;
use rootpack_registry::{resolve_metadata, RepositorySet};
use tracing::info;

/// A requested package and the artifacts installing it takes: the package
/// itself first, then its runtime dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSet {
    pub request: String,
    pub artifacts: Vec<String>,
    /// Index of the repository every artifact is fetched from.
    pub repository: usize,
}

pub fn expand(repos: &RepositorySet, requested: &str, default_arch: &str) -> Result<InstallSet> {
    let mut package = PackageRef::parse(requested)
        .with_context(|| format!("invalid package request '{requested}'"))?;
    if !package.has_arch_suffix() && !package.is_fully_specified() {
        package = package.with_default_arch(default_arch);
    }

    let lookup_name = package.to_string();
    let resolved = resolve_metadata(repos, &lookup_name)?;
    if package.has_arch_suffix() {
        package = package.with_version(&resolved.meta.version);
    }

    let full_name = package.to_string();
    let mut artifacts = vec![full_name];
    for dep in resolved.meta.runtime_deps {
        if !artifacts.contains(&dep) {
            artifacts.push(dep);
        }
    }

    info!("resolved {requested} to [{}]", artifacts.join(", "));
    Ok(InstallSet {
        request: requested.to_string(),
        artifacts,
        repository: resolved.repository,
    })
}
