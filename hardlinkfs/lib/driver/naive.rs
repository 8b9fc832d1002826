use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::{
    archive::{self, Change, DiffExtractor, DiffStream, TarExtractor, TarOptions},
    config::IdMappings,
    HardlinksResult,
};

use super::{Driver, ProtoDriver};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Completes a [`ProtoDriver`] into a [`Driver`] by working on the directories it hands out.
///
/// Diffs are applied by extracting straight into the acquired layer, and changes are found by
/// walking the acquired layer and its parent side by side. Every layer acquired with `get` is
/// released with `put` before the call returns, whether it succeeded or not.
#[derive(Debug)]
pub struct NaiveDiffDriver<D> {
    driver: D,
    id_mappings: IdMappings,
    extractor: Arc<dyn DiffExtractor>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<D: ProtoDriver> NaiveDiffDriver<D> {
    /// Wraps `driver`, extracting diffs with [`TarExtractor`] and `id_mappings`.
    pub fn new(driver: D, id_mappings: IdMappings) -> Self {
        Self {
            driver,
            id_mappings,
            extractor: Arc::new(TarExtractor),
        }
    }

    /// Replaces the extractor used by `apply_diff`.
    pub fn with_extractor(mut self, extractor: Arc<dyn DiffExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Returns the wrapped driver.
    pub fn inner(&self) -> &D {
        &self.driver
    }

    /// Runs `f` on the path of `id`, releasing the layer afterwards.
    async fn with_layer<T, F, Fut>(&self, id: &str, f: F) -> HardlinksResult<T>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: std::future::Future<Output = HardlinksResult<T>> + Send,
        T: Send,
    {
        let path = self.driver.get(id, "").await?;
        let result = f(path).await;
        self.release(id).await;
        result
    }

    async fn release(&self, id: &str) {
        if let Err(e) = self.driver.put(id).await {
            tracing::warn!("Failed to release layer {}: {}", id, e);
        }
    }

    async fn changes_at(
        &self,
        layer_fs: PathBuf,
        parent: Option<&str>,
    ) -> HardlinksResult<Vec<Change>> {
        match parent.filter(|p| !p.is_empty()) {
            Some(parent) => {
                self.with_layer(parent, |parent_fs| async move {
                    tokio::task::spawn_blocking(move || {
                        archive::detect_changes(&layer_fs, Some(&parent_fs))
                    })
                    .await?
                })
                .await
            }
            None => {
                tokio::task::spawn_blocking(move || archive::detect_changes(&layer_fs, None)).await?
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl<D: ProtoDriver> ProtoDriver for NaiveDiffDriver<D> {
    fn name(&self) -> &str {
        self.driver.name()
    }

    fn status(&self) -> Vec<(String, String)> {
        self.driver.status()
    }

    async fn get_metadata(&self, id: &str) -> HardlinksResult<Option<HashMap<String, String>>> {
        self.driver.get_metadata(id).await
    }

    async fn cleanup(&self) -> HardlinksResult<()> {
        self.driver.cleanup().await
    }

    async fn create(
        &self,
        id: &str,
        parent: Option<&str>,
        mount_label: &str,
    ) -> HardlinksResult<()> {
        self.driver.create(id, parent, mount_label).await
    }

    async fn remove(&self, id: &str) -> HardlinksResult<()> {
        self.driver.remove(id).await
    }

    async fn get(&self, id: &str, mount_label: &str) -> HardlinksResult<PathBuf> {
        self.driver.get(id, mount_label).await
    }

    async fn put(&self, id: &str) -> HardlinksResult<()> {
        self.driver.put(id).await
    }

    async fn exists(&self, id: &str) -> bool {
        self.driver.exists(id).await
    }
}

#[async_trait]
impl<D: ProtoDriver> Driver for NaiveDiffDriver<D> {
    async fn apply_diff(
        &self,
        id: &str,
        _parent: Option<&str>,
        diff: DiffStream,
    ) -> HardlinksResult<u64> {
        let extractor = self.extractor.clone();
        let options = TarOptions {
            id_mappings: self.id_mappings.clone(),
        };

        let size = self
            .with_layer(id, |layer_fs| async move {
                tokio::task::spawn_blocking(move || extractor.apply_layer(&layer_fs, diff, &options))
                    .await?
            })
            .await?;

        tracing::info!("Applied diff to {} in place ({} bytes)", id, size);
        Ok(size)
    }

    async fn changes(&self, id: &str, parent: Option<&str>) -> HardlinksResult<Vec<Change>> {
        self.with_layer(id, |layer_fs| self.changes_at(layer_fs, parent))
            .await
    }

    async fn diff(&self, id: &str, parent: Option<&str>) -> HardlinksResult<DiffStream> {
        self.with_layer(id, |layer_fs| async move {
            let changes = self.changes_at(layer_fs.clone(), parent).await?;
            tokio::task::spawn_blocking(move || archive::export_changes(&layer_fs, &changes))
                .await?
        })
        .await
    }

    async fn diff_size(&self, id: &str, parent: Option<&str>) -> HardlinksResult<u64> {
        self.with_layer(id, |layer_fs| async move {
            let changes = self.changes_at(layer_fs.clone(), parent).await?;
            tokio::task::spawn_blocking(move || archive::changes_size(&layer_fs, &changes))
                .await?
        })
        .await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
