use std::fs;
use std::io;
use std::path::Path;

/// Removes a file or symlink at `path`. Directories are left alone and
/// reported as an error.
pub(crate) fn remove_non_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("refusing to replace directory {}", path.display()),
        )),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
