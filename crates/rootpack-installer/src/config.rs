use std::collections::HashSet;
use std::fs::{self, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rootpack_squashfs::{EntryKind, Image, Inode, InodeRef, ReadAt};
use tracing::{debug, warn};

use crate::counter::ByteCounter;
use crate::fs_utils::remove_non_dir_if_exists;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    pub skipped: usize,
}

/// Mirrors the `etc` directory of the image at `image_path` into `etc_dir`.
/// Images without an `etc` directory extract nothing. A directory listed more
/// than once in the tree is rejected.
pub fn extract_config(
    image_path: &Path,
    etc_dir: &Path,
    counter: &ByteCounter,
) -> Result<ExtractSummary> {
    let image = Image::open_path(image_path)
        .with_context(|| format!("failed to open image {}", image_path.display()))?;
    let root = image
        .root()
        .with_context(|| format!("failed to read root of {}", image_path.display()))?;

    let mut summary = ExtractSummary::default();
    let Some(etc) = image.lookup(&root, "etc")? else {
        debug!(image = %image_path.display(), "image has no etc directory");
        return Ok(summary);
    };
    if etc.kind() != EntryKind::Directory {
        debug!(image = %image_path.display(), kind = ?etc.kind(), "image etc is not a directory");
        return Ok(summary);
    }

    let etc_inode = image.inode(etc.inode())?;
    fs::create_dir_all(etc_dir)
        .with_context(|| format!("failed to create {}", etc_dir.display()))?;
    let mut walk = Walk {
        counter,
        summary: &mut summary,
        visited: HashSet::from([etc.inode()]),
    };
    copy_dir(&image, &etc_inode, etc_dir, &mut walk, 0)?;
    Ok(summary)
}

struct Walk<'a> {
    counter: &'a ByteCounter,
    summary: &'a mut ExtractSummary,
    visited: HashSet<InodeRef>,
}

fn copy_dir<R: ReadAt>(
    image: &Image<R>,
    dir: &Inode,
    dest: &Path,
    walk: &mut Walk<'_>,
    depth: usize,
) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(anyhow!(
            "configuration tree nests deeper than {MAX_DEPTH} directories at {}",
            dest.display()
        ));
    }

    let entries = image
        .read_dir(dir)
        .with_context(|| format!("failed to list image directory for {}", dest.display()))?;
    for entry in entries {
        let target = dest.join(entry.name());
        match entry.kind() {
            EntryKind::Directory => {
                if !walk.visited.insert(entry.inode()) {
                    return Err(anyhow!(
                        "directory {} is listed more than once in the image",
                        target.display()
                    ));
                }
                let inode = image.inode(entry.inode())?;
                fs::create_dir_all(&target)
                    .with_context(|| format!("failed to create {}", target.display()))?;
                walk.summary.directories += 1;
                copy_dir(image, &inode, &target, walk, depth + 1)?;
            }
            EntryKind::File => {
                let inode = image.inode(entry.inode())?;
                copy_file(image, &inode, &target, walk.counter)
                    .with_context(|| format!("failed to write {}", target.display()))?;
                walk.summary.files += 1;
            }
            EntryKind::Symlink => {
                let inode = image.inode(entry.inode())?;
                let link = image.read_link(&inode)?;
                remove_non_dir_if_exists(&target)
                    .and_then(|()| std::os::unix::fs::symlink(&link, &target))
                    .with_context(|| {
                        format!(
                            "failed to link {} -> {}",
                            target.display(),
                            link.display()
                        )
                    })?;
                walk.summary.symlinks += 1;
            }
            kind => {
                warn!(path = %target.display(), ?kind, "skipping unsupported configuration entry");
                walk.summary.skipped += 1;
            }
        }
    }
    Ok(())
}

fn copy_file<R: ReadAt>(
    image: &Image<R>,
    inode: &Inode,
    target: &Path,
    counter: &ByteCounter,
) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.is_dir() => {
            return Err(anyhow!("refusing to replace directory with a file"));
        }
        Ok(metadata) if metadata.file_type().is_symlink() => fs::remove_file(target)?,
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let mode = inode.permissions();
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(target)?;
    let mut reader = image.file_reader(inode)?;
    counter.copy(&mut reader, &mut file)?;
    file.set_permissions(Permissions::from_mode(mode))?;
    Ok(())
}
