use std::{io, path::Path};

use tokio::fs;

use crate::{
    config::{LAYER_DIR_MODE, LAYER_SUBDIR_MODE},
    rootfs::{self, CopyMode},
    utils, HardlinksError, HardlinksResult,
};

use super::HardlinksDriver;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HardlinksDriver {
    pub(super) async fn create_layer(&self, id: &str, parent: Option<&str>) -> HardlinksResult<()> {
        let parent = parent.filter(|p| !p.is_empty());
        let parent_root = match parent {
            Some(parent) => {
                let parent_root = self.root_dir(parent);
                if !utils::path_exists(self.layer_dir(parent)).await
                    || !utils::path_exists(&parent_root).await
                {
                    return Err(HardlinksError::ParentNotFound(parent_root));
                }
                Some(parent_root)
            }
            None => None,
        };

        let layer_dir = self.layer_dir(id);
        let owner = self.id_mappings.root_pair()?;
        match utils::mkdir_as(&layer_dir, LAYER_DIR_MODE, owner).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(HardlinksError::LayerAlreadyExists(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.populate_layer(id, parent_root.as_deref(), owner).await {
            tracing::warn!("Failed to create layer {}: {}", id, e);
            if let Err(cleanup) = fs::remove_dir_all(&layer_dir).await {
                tracing::warn!(
                    "Failed to clean up layer directory {}: {}",
                    layer_dir.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        match parent {
            Some(parent) => tracing::info!("Created layer {} from {}", id, parent),
            None => tracing::info!("Created base layer {}", id),
        }

        Ok(())
    }

    async fn populate_layer(
        &self,
        id: &str,
        parent_root: Option<&Path>,
        owner: Option<(u32, u32)>,
    ) -> HardlinksResult<()> {
        let root_dir = self.root_dir(id);
        utils::mkdir_as(&root_dir, LAYER_SUBDIR_MODE, owner).await?;

        let Some(parent_root) = parent_root else {
            return Ok(());
        };

        utils::mkdir_as(self.mnt_dir(id), LAYER_SUBDIR_MODE, owner).await?;
        rootfs::copy_dir(parent_root, &root_dir, CopyMode::Hardlink).await
    }

    pub(super) async fn remove_layer(&self, id: &str) -> HardlinksResult<()> {
        let layer_dir = self.layer_dir(id);
        match fs::remove_dir_all(&layer_dir).await {
            Ok(()) => {
                tracing::info!("Removed layer {}", id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("Layer {} is already gone", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
