use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayout {
    root: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn roimg_dir(&self) -> PathBuf {
        self.root.join("roimg")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.roimg_dir().join("tmp")
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn ctl_path(&self) -> PathBuf {
        self.root.join("ro").join("ctl")
    }

    pub fn repos_config_path(&self) -> PathBuf {
        self.etc_dir().join("rootpack").join("repos.toml")
    }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.roimg_dir().join(format!("{name}.squashfs"))
    }

    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.roimg_dir().join(format!("{name}.meta"))
    }

    /// Staging directory owned by this process while it installs `name`.
    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.tmp_dir()
            .join(format!(".{name}{}", std::process::id()))
    }

    pub fn is_installed(&self, name: &str) -> Result<bool> {
        let path = self.image_path(name);
        match fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed to stat {}", path.display())),
        }
    }

    /// Drops every staging directory left behind by earlier runs and
    /// recreates the live store directories.
    pub fn reset_tmp_dir(&self) -> Result<()> {
        let tmp_dir = self.tmp_dir();
        match fs::remove_dir_all(&tmp_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove {}", tmp_dir.display()))
            }
        }

        for dir in [self.roimg_dir(), tmp_dir] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
