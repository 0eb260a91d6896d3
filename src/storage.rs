//! Small filesystem helpers shared by every durable component.
//!
//! All state files (kill-switch record, manifests, audit high-water mark,
//! health report) are replaced with a write-to-temp-then-rename so readers
//! never observe a half-written file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Temporary sibling path used while replacing `path`.
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `contents` atomically.
///
/// Creates the parent directory when missing.
///
/// # Errors
///
/// Returns the underlying I/O error when the temp file cannot be written,
/// synced, or renamed into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = tmp_sibling(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Create `dir` (and parents) and restrict it to the owning user.
///
/// # Errors
///
/// Returns the underlying I/O error when creation or chmod fails.
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write a new file readable only by the owning user.
///
/// Fails if the file already exists.
///
/// # Errors
///
/// Returns [`io::ErrorKind::AlreadyExists`] when `path` exists, or any other
/// I/O error from creating or writing the file.
pub fn create_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Permission bits of `path` that grant group or world access (`mode & 0o077`).
///
/// Always `0` on platforms without Unix permissions.
///
/// # Errors
///
/// Returns the underlying I/O error when metadata cannot be read.
pub fn shared_permission_bits(path: &Path) -> io::Result<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = fs::metadata(path)?.permissions().mode() & 0o777;
        Ok(mode & 0o077)
    }

    #[cfg(not(unix))]
    {
        fs::metadata(path)?;
        Ok(0)
    }
}

/// Full permission bits of `path` (`mode & 0o777`), `0` where unsupported.
///
/// # Errors
///
/// Returns the underlying I/O error when metadata cannot be read.
pub fn permission_bits(path: &Path) -> io::Result<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        Ok(fs::metadata(path)?.permissions().mode() & 0o777)
    }

    #[cfg(not(unix))]
    {
        fs::metadata(path)?;
        Ok(0)
    }
}
