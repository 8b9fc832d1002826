use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::{
    archive::{Change, DiffExtractor, DiffStream},
    config::IdMappings,
    HardlinksResult,
};

use super::{ApplyDiffProtoDriver, ApplyOutcome, Driver, NaiveDiffDriver, ProtoDriver};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`NaiveDiffDriver`] that tries the wrapped driver's own `apply_diff` first.
///
/// When the wrapped driver answers with [`ApplyOutcome::Fallback`], the stream it hands back is
/// applied by the naive driver instead. Every other operation goes straight to the naive driver.
#[derive(Debug)]
pub struct NaiveDiffDriverWithApply<D> {
    naive: NaiveDiffDriver<D>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<D: ApplyDiffProtoDriver> NaiveDiffDriverWithApply<D> {
    /// Wraps `driver`.
    pub fn new(driver: D, id_mappings: IdMappings) -> Self {
        Self {
            naive: NaiveDiffDriver::new(driver, id_mappings),
        }
    }

    /// Replaces the extractor used when falling back.
    pub fn with_extractor(self, extractor: Arc<dyn DiffExtractor>) -> Self {
        Self {
            naive: self.naive.with_extractor(extractor),
        }
    }

    /// Returns the wrapped driver.
    pub fn inner(&self) -> &D {
        self.naive.inner()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl<D: ApplyDiffProtoDriver> ProtoDriver for NaiveDiffDriverWithApply<D> {
    fn name(&self) -> &str {
        self.naive.name()
    }

    fn status(&self) -> Vec<(String, String)> {
        self.naive.status()
    }

    async fn get_metadata(&self, id: &str) -> HardlinksResult<Option<HashMap<String, String>>> {
        self.naive.get_metadata(id).await
    }

    async fn cleanup(&self) -> HardlinksResult<()> {
        self.naive.cleanup().await
    }

    async fn create(
        &self,
        id: &str,
        parent: Option<&str>,
        mount_label: &str,
    ) -> HardlinksResult<()> {
        self.naive.create(id, parent, mount_label).await
    }

    async fn remove(&self, id: &str) -> HardlinksResult<()> {
        self.naive.remove(id).await
    }

    async fn get(&self, id: &str, mount_label: &str) -> HardlinksResult<PathBuf> {
        self.naive.get(id, mount_label).await
    }

    async fn put(&self, id: &str) -> HardlinksResult<()> {
        self.naive.put(id).await
    }

    async fn exists(&self, id: &str) -> bool {
        self.naive.exists(id).await
    }
}

#[async_trait]
impl<D: ApplyDiffProtoDriver> Driver for NaiveDiffDriverWithApply<D> {
    async fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: DiffStream,
    ) -> HardlinksResult<u64> {
        match ApplyDiffProtoDriver::apply_diff(self.inner(), id, parent, diff).await? {
            ApplyOutcome::Applied(size) => Ok(size),
            ApplyOutcome::Fallback(diff) => {
                tracing::debug!("{} declined the diff for {}, applying in place", self.name(), id);
                Driver::apply_diff(&self.naive, id, parent, diff).await
            }
        }
    }

    async fn changes(&self, id: &str, parent: Option<&str>) -> HardlinksResult<Vec<Change>> {
        self.naive.changes(id, parent).await
    }

    async fn diff(&self, id: &str, parent: Option<&str>) -> HardlinksResult<DiffStream> {
        self.naive.diff(id, parent).await
    }

    async fn diff_size(&self, id: &str, parent: Option<&str>) -> HardlinksResult<u64> {
        self.naive.diff_size(id, parent).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        io,
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use tempfile::tempdir;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_fallback_delegates_declined_diffs() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let driver = NaiveDiffDriverWithApply::new(
            helper::StubDriver::new(temp.path(), false),
            IdMappings::default(),
        );

        let size = driver
            .apply_diff("layer", None, helper::diff_with("hello.txt", b"hello")?)
            .await?;

        assert_eq!(size, 5);
        assert_eq!(std::fs::read_to_string(temp.path().join("hello.txt"))?, "hello");
        assert_eq!(driver.inner().custom_applies.load(Ordering::SeqCst), 1);
        assert_eq!(*driver.inner().calls.lock().unwrap(), vec!["get", "put"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_fallback_passes_applied_result_through() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let driver = NaiveDiffDriverWithApply::new(
            helper::StubDriver::new(temp.path(), true),
            IdMappings::default(),
        );

        let size = driver
            .apply_diff("layer", Some("parent"), helper::diff_with("hello.txt", b"hello")?)
            .await?;

        assert_eq!(size, 42);
        assert!(!temp.path().join("hello.txt").exists());
        assert!(driver.inner().calls.lock().unwrap().is_empty());
        assert_eq!(driver.name(), "stub");

        Ok(())
    }

    mod helper {
        use super::*;

        /// Hands out a fixed directory and either applies everything or nothing.
        pub(super) struct StubDriver {
            dir: PathBuf,
            accept: bool,
            pub(super) custom_applies: AtomicUsize,
            pub(super) calls: Mutex<Vec<&'static str>>,
        }

        impl StubDriver {
            pub(super) fn new(dir: &Path, accept: bool) -> Self {
                Self {
                    dir: dir.to_path_buf(),
                    accept,
                    custom_applies: AtomicUsize::new(0),
                    calls: Mutex::new(Vec::new()),
                }
            }
        }

        impl std::fmt::Debug for StubDriver {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct("StubDriver").field("dir", &self.dir).finish()
            }
        }

        #[async_trait]
        impl ProtoDriver for StubDriver {
            fn name(&self) -> &str {
                "stub"
            }

            fn status(&self) -> Vec<(String, String)> {
                Vec::new()
            }

            async fn get_metadata(
                &self,
                _id: &str,
            ) -> HardlinksResult<Option<HashMap<String, String>>> {
                Ok(None)
            }

            async fn cleanup(&self) -> HardlinksResult<()> {
                Ok(())
            }

            async fn create(&self, _: &str, _: Option<&str>, _: &str) -> HardlinksResult<()> {
                Ok(())
            }

            async fn remove(&self, _id: &str) -> HardlinksResult<()> {
                Ok(())
            }

            async fn get(&self, _id: &str, _mount_label: &str) -> HardlinksResult<PathBuf> {
                self.calls.lock().unwrap().push("get");
                Ok(self.dir.clone())
            }

            async fn put(&self, _id: &str) -> HardlinksResult<()> {
                self.calls.lock().unwrap().push("put");
                Ok(())
            }

            async fn exists(&self, _id: &str) -> bool {
                true
            }
        }

        #[async_trait]
        impl ApplyDiffProtoDriver for StubDriver {
            async fn apply_diff(
                &self,
                _id: &str,
                _parent: Option<&str>,
                diff: DiffStream,
            ) -> HardlinksResult<ApplyOutcome> {
                self.custom_applies.fetch_add(1, Ordering::SeqCst);
                if self.accept {
                    Ok(ApplyOutcome::Applied(42))
                } else {
                    Ok(ApplyOutcome::Fallback(diff))
                }
            }
        }

        pub(super) fn diff_with(path: &str, content: &[u8]) -> anyhow::Result<DiffStream> {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(1_700_000_000);
            builder.append_data(&mut header, path, content)?;
            Ok(Box::new(io::Cursor::new(builder.into_inner()?)))
        }
    }
}
