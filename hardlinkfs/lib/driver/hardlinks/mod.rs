//! The hardlinks driver.

mod apply;
mod layer;
mod mount;

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use getset::Getters;
use tokio::sync::Mutex;

use crate::{
    archive::{DiffExtractor, DiffStream, TarExtractor},
    config::{
        DriverConfig, IdMap, IdMappings, BACKING_FS, BACKING_FS_STATUS_KEY, DRIVER_NAME,
        LAYER_DIR_MODE, MNT_SUBDIR, ROOT_SUBDIR,
    },
    mount::{Mounter, SysMounter},
    utils, HardlinksResult,
};

use super::{ApplyDiffProtoDriver, ApplyOutcome, NaiveDiffDriverWithApply, ProtoDriver};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use mount::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A layer storage driver that materializes a child layer as a hardlinked copy of its parent.
///
/// ## Layout
///
/// ```text
/// home/
/// ├── base/
/// │   └── root/        - no parent, used in place
/// └── container/
///     ├── root/        - starts as a hardlinked copy of base/root
///     └── mnt/         - root/ is bind mounted here by get()
/// ```
///
/// ## Write-once roots
///
/// Unmodified regular files of a child share their inode with the parent, so writing to such a
/// file in place changes every layer that links it. A committed `root/` must therefore never be
/// written through. The driver itself only ever replaces `root/` as a whole, and extraction always
/// unlinks an entry before recreating it. Anything writing into a layer handed out by
/// [`get`](ProtoDriver::get) has to do the same.
///
/// ## Concurrency
///
/// The mount table is the only shared state and is guarded by a single lock held for the whole
/// of `get` and `put`. `create`, `remove` and `apply_diff` take no lock; callers must not run
/// them concurrently for the same layer.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct HardlinksDriver {
    /// The directory every layer lives under.
    home: PathBuf,

    /// The ID mappings applied to created directories and extracted entries.
    id_mappings: IdMappings,

    /// The driver configuration.
    config: DriverConfig,

    #[getset(skip)]
    active: Mutex<HashMap<String, ActiveMount>>,

    #[getset(skip)]
    mounter: Arc<dyn Mounter>,

    #[getset(skip)]
    extractor: Arc<dyn DiffExtractor>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HardlinksDriver {
    /// Creates a driver rooted at `home`, creating the directory if needed.
    ///
    /// The driver bind mounts with [`SysMounter`] and extracts diffs with [`TarExtractor`].
    pub async fn new(
        home: impl Into<PathBuf>,
        config: DriverConfig,
        id_mappings: IdMappings,
    ) -> HardlinksResult<Self> {
        let home = home.into();
        let owner = id_mappings.root_pair()?;
        utils::mkdir_all_as(&home, LAYER_DIR_MODE, owner).await?;

        tracing::info!("Initialized {} driver at {}", DRIVER_NAME, home.display());

        Ok(Self {
            home,
            id_mappings,
            config,
            active: Mutex::new(HashMap::new()),
            mounter: Arc::new(SysMounter),
            extractor: Arc::new(TarExtractor),
        })
    }

    /// Replaces the mounter used by `get` and `put`.
    pub fn with_mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    /// Replaces the extractor used by `apply_diff`.
    pub fn with_extractor(mut self, extractor: Arc<dyn DiffExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Returns a snapshot of the mount record of a layer, if it is currently acquired.
    pub async fn active_mount(&self, id: &str) -> Option<ActiveMount> {
        self.active.lock().await.get(id).cloned()
    }

    /// Returns the directory of a layer.
    pub fn layer_dir(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }

    /// Returns the committed content directory of a layer.
    pub fn root_dir(&self, id: &str) -> PathBuf {
        self.layer_dir(id).join(ROOT_SUBDIR)
    }

    /// Returns the bind mount target of a layer.
    pub fn mnt_dir(&self, id: &str) -> PathBuf {
        self.layer_dir(id).join(MNT_SUBDIR)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Initializes a hardlinks driver at `home`.
///
/// `options` are `key=value` driver options (see [`DriverConfig::from_options`]); `uid_maps` and
/// `gid_maps` remap ownership of everything the driver creates. The returned driver falls back
/// to directory comparison for diffs the hardlinks driver cannot apply itself.
///
/// ## Examples
///
/// ```no_run
/// use hardlinkfs::{config::IdMap, driver};
///
/// # async fn example() -> anyhow::Result<()> {
/// let driver = driver::init(
///     "/var/lib/hardlinks",
///     &["hardlinks.readonly_mounts=true".to_string()],
///     vec![IdMap::new(0, 100000, 65536)],
///     vec![IdMap::new(0, 100000, 65536)],
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn init(
    home: impl AsRef<Path>,
    options: &[String],
    uid_maps: Vec<IdMap>,
    gid_maps: Vec<IdMap>,
) -> HardlinksResult<NaiveDiffDriverWithApply<HardlinksDriver>> {
    let config = DriverConfig::from_options(options)?;
    let id_mappings = IdMappings::new(uid_maps, gid_maps);
    let driver = HardlinksDriver::new(home.as_ref(), config, id_mappings.clone()).await?;

    Ok(NaiveDiffDriverWithApply::new(driver, id_mappings))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ProtoDriver for HardlinksDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn status(&self) -> Vec<(String, String)> {
        vec![(BACKING_FS_STATUS_KEY.to_string(), BACKING_FS.to_string())]
    }

    async fn get_metadata(&self, _id: &str) -> HardlinksResult<Option<HashMap<String, String>>> {
        Ok(None)
    }

    async fn cleanup(&self) -> HardlinksResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        id: &str,
        parent: Option<&str>,
        _mount_label: &str,
    ) -> HardlinksResult<()> {
        self.create_layer(id, parent).await
    }

    async fn remove(&self, id: &str) -> HardlinksResult<()> {
        self.remove_layer(id).await
    }

    async fn get(&self, id: &str, mount_label: &str) -> HardlinksResult<PathBuf> {
        self.acquire(id, mount_label).await
    }

    async fn put(&self, id: &str) -> HardlinksResult<()> {
        self.release(id).await
    }

    async fn exists(&self, id: &str) -> bool {
        utils::path_exists(self.layer_dir(id)).await
    }
}

#[async_trait]
impl ApplyDiffProtoDriver for HardlinksDriver {
    async fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: DiffStream,
    ) -> HardlinksResult<ApplyOutcome> {
        self.apply_layer_diff(id, parent, diff).await
    }
}

impl fmt::Display for HardlinksDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DRIVER_NAME}")
    }
}

impl fmt::Debug for HardlinksDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardlinksDriver")
            .field("home", &self.home)
            .field("id_mappings", &self.id_mappings)
            .field("config", &self.config)
            .field("mounter", &self.mounter)
            .field("extractor", &self.extractor)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
