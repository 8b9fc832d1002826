use std::path::PathBuf;

use getset::{CopyGetters, Getters};

use crate::{mount::format_mount_label, utils, HardlinksError, HardlinksResult};

use super::HardlinksDriver;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The mount record of an acquired layer.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct ActiveMount {
    /// The number of outstanding `get` calls.
    #[getset(get_copy = "pub with_prefix")]
    count: u32,

    /// The path handed out to callers.
    #[getset(get = "pub with_prefix")]
    path: PathBuf,

    /// Whether `path` is a bind mount the driver has to undo.
    #[getset(get_copy = "pub with_prefix")]
    mounted: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HardlinksDriver {
    pub(super) async fn acquire(&self, id: &str, mount_label: &str) -> HardlinksResult<PathBuf> {
        let mut active = self.active.lock().await;

        if let Some(record) = active.get_mut(id) {
            record.count += 1;
            tracing::debug!("Reusing mount of {} (count: {})", id, record.count);
            return Ok(record.path.clone());
        }

        let layer_dir = self.layer_dir(id);
        if !utils::path_exists(&layer_dir).await {
            return Err(HardlinksError::LayerNotFound(layer_dir));
        }

        let root_dir = self.root_dir(id);
        if !utils::path_exists(&root_dir).await {
            return Err(HardlinksError::LayerNotFound(root_dir));
        }

        let mnt_dir = self.mnt_dir(id);
        let record = if utils::path_exists(&mnt_dir).await {
            let options = format_mount_label(self.config.mount_options(id), mount_label);
            self.bind_mount(root_dir, mnt_dir.clone(), options).await?;
            ActiveMount {
                count: 1,
                path: mnt_dir,
                mounted: true,
            }
        } else {
            // Layers without a parent are used in place.
            ActiveMount {
                count: 1,
                path: root_dir,
                mounted: false,
            }
        };

        let path = record.path.clone();
        active.insert(id.to_string(), record);

        Ok(path)
    }

    pub(super) async fn release(&self, id: &str) -> HardlinksResult<()> {
        let mut active = self.active.lock().await;

        let Some(record) = active.get_mut(id) else {
            tracing::debug!("Put on {} without an active mount", id);

            // A mount may have outlived a previous driver instance.
            let mnt_dir = self.mnt_dir(id);
            if utils::path_exists(self.layer_dir(id)).await && utils::path_exists(&mnt_dir).await {
                if let Err(e) = self.unmount(mnt_dir.clone()).await {
                    tracing::debug!("Failed to unmount {}: {}", mnt_dir.display(), e);
                }
            }

            return Ok(());
        };

        record.count -= 1;
        if record.count > 0 {
            tracing::debug!("Released {} (count: {})", id, record.count);
            return Ok(());
        }

        let Some(record) = active.remove(id) else {
            return Ok(());
        };

        if record.mounted {
            if let Err(e) = self.unmount(record.path.clone()).await {
                tracing::warn!("Failed to unmount {}: {}", record.path.display(), e);
            }
        }

        Ok(())
    }

    async fn bind_mount(
        &self,
        source: PathBuf,
        target: PathBuf,
        options: String,
    ) -> HardlinksResult<()> {
        let mounter = self.mounter.clone();
        tokio::task::spawn_blocking(move || mounter.bind_mount(&source, &target, &options)).await?
    }

    async fn unmount(&self, target: PathBuf) -> HardlinksResult<()> {
        let mounter = self.mounter.clone();
        tokio::task::spawn_blocking(move || mounter.unmount(&target)).await?
    }
}
