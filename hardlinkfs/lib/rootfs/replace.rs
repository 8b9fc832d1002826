use std::{io, path::Path};

use tokio::fs;

use crate::HardlinksResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Atomically publishes `staged_dir` at `target_dir`.
///
/// If `target_dir` does not exist, `staged_dir` is simply renamed into place. Otherwise the two
/// directories are exchanged, so after a successful return `target_dir` holds the staged content
/// and `staged_dir` holds the previous content, which the caller is expected to remove.
///
/// On Linux with glibc the exchange is a single `renameat2(RENAME_EXCHANGE)` call, so readers
/// always see a complete directory at `target_dir`. Elsewhere, or on filesystems that reject the
/// flag, the exchange is emulated with three renames.
///
/// Both paths must be on the same filesystem.
pub async fn replace_dir(
    staged_dir: impl AsRef<Path>,
    target_dir: impl AsRef<Path>,
) -> HardlinksResult<()> {
    let staged_dir = staged_dir.as_ref();
    let target_dir = target_dir.as_ref();

    match fs::symlink_metadata(target_dir).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(
                "Renaming {} -> {}",
                staged_dir.display(),
                target_dir.display()
            );
            fs::rename(staged_dir, target_dir).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    tracing::debug!(
        "Exchanging {} <-> {}",
        staged_dir.display(),
        target_dir.display()
    );

    exchange(staged_dir, target_dir).await
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
async fn exchange(staged_dir: &Path, target_dir: &Path) -> HardlinksResult<()> {
    use nix::{
        errno::Errno,
        fcntl::{renameat2, RenameFlags},
    };

    match renameat2(
        None,
        staged_dir,
        None,
        target_dir,
        RenameFlags::RENAME_EXCHANGE,
    ) {
        Ok(()) => Ok(()),
        // Filesystems without RENAME_EXCHANGE support.
        Err(Errno::EINVAL | Errno::ENOSYS) => exchange_by_rename(staged_dir, target_dir).await,
        Err(errno) => Err(io::Error::from(errno).into()),
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
async fn exchange(staged_dir: &Path, target_dir: &Path) -> HardlinksResult<()> {
    exchange_by_rename(staged_dir, target_dir).await
}

async fn exchange_by_rename(staged_dir: &Path, target_dir: &Path) -> HardlinksResult<()> {
    let aside = staged_dir.with_extension("old");

    fs::rename(target_dir, &aside).await?;
    if let Err(e) = fs::rename(staged_dir, target_dir).await {
        fs::rename(&aside, target_dir).await?;
        return Err(e.into());
    }

    park_previous(&aside, staged_dir).await;

    Ok(())
}

/// Moves the previous content to `staged_dir` for the caller to remove, or removes it right away
/// if that rename fails. The new content is already committed at this point.
async fn park_previous(aside: &Path, staged_dir: &Path) {
    let Err(e) = fs::rename(aside, staged_dir).await else {
        return;
    };

    tracing::warn!(
        "Failed to move previous content {} to {}: {}, removing it",
        aside.display(),
        staged_dir.display(),
        e
    );

    if let Err(e) = fs::remove_dir_all(aside).await {
        tracing::warn!("Failed to remove {}: {}", aside.display(), e);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_rootfs_replace_dir_renames_when_target_missing() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let staged = temp.path().join("tmproot");
        let target = temp.path().join("root");
        fs::create_dir(&staged).await?;
        fs::write(staged.join("file.txt"), "new").await?;

        replace_dir(&staged, &target).await?;

        assert!(!staged.exists());
        assert_eq!(fs::read_to_string(target.join("file.txt")).await?, "new");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_replace_dir_exchanges_non_empty_target() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let staged = temp.path().join("tmproot");
        let target = temp.path().join("root");
        fs::create_dir(&staged).await?;
        fs::create_dir(&target).await?;
        fs::write(staged.join("file.txt"), "new").await?;
        fs::write(target.join("file.txt"), "old").await?;
        fs::write(target.join("stale.txt"), "stale").await?;

        replace_dir(&staged, &target).await?;

        assert_eq!(fs::read_to_string(target.join("file.txt")).await?, "new");
        assert!(!target.join("stale.txt").exists());
        assert_eq!(fs::read_to_string(staged.join("file.txt")).await?, "old");
        assert!(staged.join("stale.txt").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_replace_dir_rename_fallback_exchanges() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let staged = temp.path().join("tmproot");
        let target = temp.path().join("root");
        fs::create_dir(&staged).await?;
        fs::create_dir(&target).await?;
        fs::write(staged.join("file.txt"), "new").await?;
        fs::write(target.join("file.txt"), "old").await?;

        exchange_by_rename(&staged, &target).await?;

        assert_eq!(fs::read_to_string(target.join("file.txt")).await?, "new");
        assert_eq!(fs::read_to_string(staged.join("file.txt")).await?, "old");
        assert!(!staged.with_extension("old").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_park_previous_removes_content_it_cannot_move() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let aside = temp.path().join("tmproot.old");
        let staged = temp.path().join("tmproot");
        fs::create_dir_all(aside.join("etc")).await?;
        fs::write(aside.join("etc/hosts"), "old").await?;

        // A non-empty directory in the way makes the rename fail.
        fs::create_dir(&staged).await?;
        fs::write(staged.join("blocker"), "").await?;

        park_previous(&aside, &staged).await;

        assert!(!aside.exists());
        assert!(staged.join("blocker").exists());

        Ok(())
    }
}
