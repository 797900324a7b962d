use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rootpack_registry::{image_artifact_path, meta_artifact_path, Repository};
use tracing::{debug, info};

use crate::config::extract_config;
use crate::counter::ByteCounter;
use crate::layout::RootLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOutcome {
    AlreadyInstalled,
    /// Another installer holds the staging directory for this package.
    Deferred,
    Installed,
}

/// Fetches `name` from `repo` into a private staging directory and commits
/// it into the live store: metadata first, image last. The image appearing
/// in `roimg/` marks the package as installed.
pub fn install_artifact(
    layout: &RootLayout,
    repo: &Repository,
    name: &str,
    first_install: bool,
    counter: &ByteCounter,
) -> Result<ArtifactOutcome> {
    if layout.is_installed(name)? {
        debug!("package {name} already installed");
        return Ok(ArtifactOutcome::AlreadyInstalled);
    }

    let staging = layout.staging_path(name);
    match fs::create_dir(&staging) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            debug!(staging = %staging.display(), "package {name} is being installed elsewhere");
            return Ok(ArtifactOutcome::Deferred);
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to create staging dir {}", staging.display()))
        }
    }

    info!("installing package {name}");
    let staged_image = staging.join(format!("{name}.squashfs"));
    let staged_meta = staging.join(format!("{name}.meta"));
    fetch_artifact(repo, &image_artifact_path(name), &staged_image, counter)?;
    fetch_artifact(repo, &meta_artifact_path(name), &staged_meta, counter)?;

    if first_install {
        info!("copying {name}/etc");
        let summary = extract_config(&staged_image, &layout.etc_dir(), counter)
            .with_context(|| format!("failed to extract configuration of {name}"))?;
        debug!(?summary, "extracted configuration of {name}");
    }

    let meta_path = layout.meta_path(name);
    fs::rename(&staged_meta, &meta_path)
        .with_context(|| format!("failed to commit {}", meta_path.display()))?;
    let image_path = layout.image_path(name);
    fs::rename(&staged_image, &image_path)
        .with_context(|| format!("failed to commit {}", image_path.display()))?;
    fs::remove_dir(&staging)
        .with_context(|| format!("failed to remove staging dir {}", staging.display()))?;

    Ok(ArtifactOutcome::Installed)
}

fn fetch_artifact(
    repo: &Repository,
    relative_path: &str,
    dest: &Path,
    counter: &ByteCounter,
) -> Result<u64> {
    let mut reader = repo
        .open(relative_path)
        .with_context(|| format!("failed to fetch {relative_path} from {repo}"))?
        .ok_or_else(|| anyhow!("artifact {relative_path} not found in {repo}"))?;

    let mut file =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let copied = counter
        .copy(&mut reader, &mut file)
        .with_context(|| format!("failed to download {relative_path} from {repo}"))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", dest.display()))?;
    Ok(copied)
}
