//! Restoring permissions, ownership and mtimes on extracted filesystem
//! entries (spec.md §4.8, original_source's `set_attributes`).

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::warn;

use crate::error::{Error, FsCreateError, Result};

fn attrs_failed(path: &Path) -> Error {
    Error::FsCreate(FsCreateError::Other(
        path.display().to_string(),
        io::Error::other("failed to restore one or more attributes"),
    ))
}

/// What `set_attributes` needs about an inode, independent of its kind.
#[derive(Copy, Clone, Debug)]
pub struct Attrs {
    pub permissions: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
}

/// Restores mtime, ownership (root only) and permissions on `path`.
///
/// Matches original_source: non-root processes get their write bits
/// stripped rather than failing outright, and a permission-denied set
/// retries once with the sticky bit cleared. Every failure is logged; when
/// `strict_errors` is set the first one returns immediately (failing fast,
/// original_source's `EXIT_UNSQUASH_STRICT`) rather than pressing on to the
/// remaining attributes.
pub fn set_attributes(
    path: &Path,
    attrs: Attrs,
    is_file: bool,
    running_as_root: bool,
    strict_errors: bool,
) -> Result<()> {
    let mut had_error = false;

    let times = nix::sys::time::TimeVal::new(attrs.mtime as i64, 0);
    if let Err(e) = nix::sys::stat::utimes(path, &times, &times) {
        warn!(?path, %e, "failed to set mtime");
        had_error = true;
        if strict_errors {
            return Err(attrs_failed(path));
        }
    }

    let mut mode = u32::from(attrs.permissions);

    if running_as_root {
        if let Err(e) = nix::unistd::lchown(
            path,
            Some(nix::unistd::Uid::from_raw(attrs.uid)),
            Some(nix::unistd::Gid::from_raw(attrs.gid)),
        ) {
            warn!(?path, uid = attrs.uid, gid = attrs.gid, %e, "lchown failed");
            return Err(attrs_failed(path));
        }
    } else if is_file {
        mode &= !0o022;
    }

    if let Err(e) = fs::set_permissions(path, Permissions::from_mode(mode)) {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            let retry = fs::set_permissions(path, Permissions::from_mode(mode & !0o1000));
            if retry.is_err() {
                warn!(?path, "could not set permissions");
                had_error = true;
            }
        } else {
            warn!(?path, %e, "failed to set permissions");
            had_error = true;
        }
    }

    if had_error {
        Err(attrs_failed(path))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sets_mtime_and_mode_non_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();

        let attrs = Attrs { permissions: 0o777, uid: 0, gid: 0, mtime: 1_000_000 };
        set_attributes(&path, attrs, true, false, false).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o022, 0);
    }
}
