use std::{io, os::unix::fs::PermissionsExt, path::Path};

use tokio::fs;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates a single directory with an exact mode, optionally owned by `owner`.
///
/// The mode is applied after creation so the process umask does not interfere. Fails if the
/// directory already exists.
pub async fn mkdir_as(path: impl AsRef<Path>, mode: u32, owner: Option<(u32, u32)>) -> io::Result<()> {
    let path = path.as_ref();
    fs::create_dir(path).await?;
    apply_mode_and_owner(path, mode, owner).await
}

/// Creates a directory and all of its missing parents.
///
/// Only the leaf gets `mode` and `owner` applied, and only when it did not exist before.
pub async fn mkdir_all_as(
    path: impl AsRef<Path>,
    mode: u32,
    owner: Option<(u32, u32)>,
) -> io::Result<()> {
    let path = path.as_ref();
    if path_exists(path).await {
        return Ok(());
    }

    fs::create_dir_all(path).await?;
    apply_mode_and_owner(path, mode, owner).await
}

/// Returns `true` if something exists at `path`, following symlinks.
pub async fn path_exists(path: impl AsRef<Path>) -> bool {
    fs::metadata(path).await.is_ok()
}

/// Formats the permission bits of a mode the way `ls -l` does, e.g. `rwxr-xr-x`.
///
/// ## Examples
///
/// ```
/// use hardlinkfs::utils::format_mode;
///
/// assert_eq!(format_mode(0o755), "rwxr-xr-x");
/// assert_eq!(format_mode(0o100640), "rw-r-----");
/// ```
pub fn format_mode(mode: u32) -> String {
    const SYMBOLS: [char; 3] = ['r', 'w', 'x'];

    (0..9)
        .map(|bit| {
            if mode & (0o400 >> bit) != 0 {
                SYMBOLS[bit % 3]
            } else {
                '-'
            }
        })
        .collect()
}

async fn apply_mode_and_owner(path: &Path, mode: u32, owner: Option<(u32, u32)>) -> io::Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    if let Some((uid, gid)) = owner {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    }

    tracing::debug!(
        "Created directory {} ({}, owner {:?})",
        path.display(),
        format_mode(mode),
        owner
    );

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
