use std::io;

use tokio::fs;

use crate::{
    archive::{DiffStream, TarOptions},
    config::TMP_ROOT_PREFIX,
    driver::ApplyOutcome,
    rootfs::{self, CopyMode},
    utils, HardlinksError, HardlinksResult,
};

use super::HardlinksDriver;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HardlinksDriver {
    /// Rebuilds the layer root as a hardlinked copy of the parent with `diff` applied on top.
    ///
    /// The new root is staged in a scratch directory inside the layer and only swapped in once it
    /// is complete. The scratch directory is removed on every failure path, so the committed
    /// `root/` is either fully replaced or untouched.
    pub(super) async fn apply_layer_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: DiffStream,
    ) -> HardlinksResult<ApplyOutcome> {
        let Some(parent) = parent.filter(|p| !p.is_empty()) else {
            tracing::debug!("Layer {} has no parent, applying the generic way", id);
            return Ok(ApplyOutcome::Fallback(diff));
        };

        let parent_root = self.root_dir(parent);
        if !utils::path_exists(&parent_root).await {
            tracing::debug!(
                "Parent root {} is missing, applying the generic way",
                parent_root.display()
            );
            return Ok(ApplyOutcome::Fallback(diff));
        }

        let layer_dir = self.layer_dir(id);
        if !utils::path_exists(&layer_dir).await {
            return Err(HardlinksError::LayerNotFound(layer_dir));
        }

        let staging = tempfile::Builder::new()
            .prefix(TMP_ROOT_PREFIX)
            .tempdir_in(&layer_dir)?;
        tracing::debug!("Staging diff for {} in {}", id, staging.path().display());

        rootfs::copy_dir(&parent_root, staging.path(), CopyMode::Hardlink).await?;

        let extractor = self.extractor.clone();
        let dest = staging.path().to_path_buf();
        let options = TarOptions {
            id_mappings: self.id_mappings.clone(),
        };
        let size =
            tokio::task::spawn_blocking(move || extractor.apply_layer(&dest, diff, &options))
                .await??;

        rootfs::replace_dir(staging.path(), self.root_dir(id)).await?;

        // The staging directory now holds the previous root.
        let previous_root = staging.path().to_path_buf();
        match tokio::task::spawn_blocking(move || staging.close()).await? {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove previous root {}: {}",
                previous_root.display(),
                e
            ),
        }

        let mnt_dir = self.mnt_dir(id);
        match fs::remove_dir(&mnt_dir).await {
            Ok(()) => tracing::debug!("Removed mount point {}", mnt_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove mount point {}: {}", mnt_dir.display(), e),
        }

        tracing::info!("Applied diff to {} on top of {} ({} bytes)", id, parent, size);

        Ok(ApplyOutcome::Applied(size))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        os::unix::fs::MetadataExt,
        path::{Path, PathBuf},
        sync::Arc,
    };

    use tempfile::tempdir;
    use walkdir::WalkDir;

    use crate::{
        archive::{DiffExtractor, TarExtractor},
        config::DriverConfig,
        driver::{ApplyDiffProtoDriver, ProtoDriver},
    };

    use super::super::tests::helper;
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_apply_without_parent_falls_back_untouched() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let (driver, _) = helper::setup_driver(temp.path(), DriverConfig::default()).await?;
        driver.create("base", None, "").await?;
        let before = snapshot(&driver.layer_dir("base"))?;

        let outcome = driver
            .apply_diff("base", None, test_helper::hosts_diff()?)
            .await?;
        assert!(matches!(outcome, ApplyOutcome::Fallback(_)));

        let outcome = driver
            .apply_diff("base", Some(""), test_helper::hosts_diff()?)
            .await?;
        assert!(matches!(outcome, ApplyOutcome::Fallback(_)));

        assert_eq!(snapshot(&driver.layer_dir("base"))?, before);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_with_missing_parent_root_falls_back() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let (driver, _) = helper::setup_driver(temp.path(), DriverConfig::default()).await?;
        driver.create("base", None, "").await?;
        driver.create("child", Some("base"), "").await?;
        std::fs::remove_dir_all(driver.root_dir("base"))?;
        let before = snapshot(&driver.layer_dir("child"))?;

        let outcome = driver
            .apply_diff("child", Some("base"), test_helper::hosts_diff()?)
            .await?;

        let ApplyOutcome::Fallback(mut diff) = outcome else {
            anyhow::bail!("expected fallback");
        };
        let mut bytes = Vec::new();
        diff.read_to_end(&mut bytes)?;
        assert!(!bytes.is_empty());
        assert_eq!(snapshot(&driver.layer_dir("child"))?, before);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_commits_new_root() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let (driver, _) = helper::setup_driver(temp.path(), DriverConfig::default()).await?;
        driver.create("base", None, "").await?;

        let base_root = driver.root_dir("base");
        std::fs::create_dir(base_root.join("etc"))?;
        std::fs::write(base_root.join("etc/hosts"), "localhost")?;
        std::fs::write(base_root.join("etc/motd"), "welcome")?;
        std::fs::write(base_root.join("untouched"), "same")?;

        driver.create("child", Some("base"), "").await?;
        std::fs::write(driver.root_dir("child").join("stale"), "from create")?;

        let outcome = driver
            .apply_diff("child", Some("base"), test_helper::hosts_diff()?)
            .await?;
        assert!(matches!(outcome, ApplyOutcome::Applied(19)));

        let child_root = driver.root_dir("child");
        assert_eq!(
            std::fs::read_to_string(child_root.join("etc/hosts"))?,
            "127.0.0.1 localhost"
        );
        assert!(!child_root.join("etc/motd").exists());
        assert!(!child_root.join("stale").exists());
        assert_eq!(
            std::fs::metadata(child_root.join("untouched"))?.ino(),
            std::fs::metadata(base_root.join("untouched"))?.ino()
        );

        assert_eq!(std::fs::read_to_string(base_root.join("etc/hosts"))?, "localhost");
        assert!(base_root.join("etc/motd").exists());

        assert!(!driver.mnt_dir("child").exists());
        assert_eq!(test_helper::leftover_staging(&driver.layer_dir("child"))?, 0);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_failure_keeps_root_unchanged() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let (driver, _) = helper::setup_driver(temp.path(), DriverConfig::default()).await?;
        let driver = driver.with_extractor(Arc::new(test_helper::FailingExtractor));

        driver.create("base", None, "").await?;
        std::fs::write(driver.root_dir("base").join("file"), "base")?;
        driver.create("child", Some("base"), "").await?;
        let before = snapshot(&driver.root_dir("child"))?;

        let err = driver
            .apply_diff("child", Some("base"), test_helper::hosts_diff()?)
            .await
            .unwrap_err();

        assert!(matches!(err, HardlinksError::Extract(_)));
        assert_eq!(snapshot(&driver.root_dir("child"))?, before);
        assert!(driver.mnt_dir("child").exists());
        assert_eq!(test_helper::leftover_staging(&driver.layer_dir("child"))?, 0);

        Ok(())
    }

    /// Lists every path under `dir` with its content, for before/after comparisons.
    fn snapshot(dir: &Path) -> anyhow::Result<Vec<(PathBuf, Option<Vec<u8>>)>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            let content = if entry.file_type().is_file() {
                Some(std::fs::read(entry.path())?)
            } else {
                None
            };
            entries.push((entry.path().to_path_buf(), content));
        }
        Ok(entries)
    }

    mod test_helper {
        use crate::archive::TarOptions;

        use super::*;

        /// Writes part of the diff and then fails, like a truncated stream would.
        #[derive(Debug)]
        pub(super) struct FailingExtractor;

        impl DiffExtractor for FailingExtractor {
            fn apply_layer(
                &self,
                dest: &Path,
                diff: DiffStream,
                options: &TarOptions,
            ) -> HardlinksResult<u64> {
                let mut truncated = Vec::new();
                diff.take(1024).read_to_end(&mut truncated)?;
                TarExtractor.apply_layer(dest, Box::new(io::Cursor::new(truncated)), options)?;
                Err(HardlinksError::Extract("unexpected end of archive".to_string()))
            }
        }

        /// A diff replacing `etc/hosts` and deleting `etc/motd`.
        pub(super) fn hosts_diff() -> anyhow::Result<DiffStream> {
            let mut builder = tar::Builder::new(Vec::new());

            let content = b"127.0.0.1 localhost";
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(1_700_000_000);
            builder.append_data(&mut header, "etc/hosts", &content[..])?;

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(0);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(1_700_000_000);
            builder.append_data(&mut header, "etc/.wh.motd", io::empty())?;

            Ok(Box::new(io::Cursor::new(builder.into_inner()?)))
        }

        pub(super) fn leftover_staging(layer_dir: &Path) -> anyhow::Result<usize> {
            let mut count = 0;
            for entry in std::fs::read_dir(layer_dir)? {
                if entry?
                    .file_name()
                    .to_string_lossy()
                    .starts_with(TMP_ROOT_PREFIX)
                {
                    count += 1;
                }
            }
            Ok(count)
        }
    }
}
