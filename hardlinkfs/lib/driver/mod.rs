//! Layer storage drivers.
//!
//! A driver is described by three traits:
//!
//! - [`ProtoDriver`] is the layer lifecycle: create, remove, get, put, exists and introspection.
//! - [`ApplyDiffProtoDriver`] adds a driver specific `apply_diff` that may decline a diff by
//!   returning [`ApplyOutcome::Fallback`].
//! - [`Driver`] is the complete surface callers use, adding diff application, change listing
//!   and diff export.
//!
//! [`NaiveDiffDriver`] turns any [`ProtoDriver`] into a [`Driver`] by comparing directory trees.
//! [`NaiveDiffDriverWithApply`] does the same but tries the driver's own `apply_diff` first.
//! [`HardlinksDriver`] is the hardlink based [`ApplyDiffProtoDriver`], and [`init`] builds it
//! wrapped in [`NaiveDiffDriverWithApply`].

mod fallback;
mod hardlinks;
mod naive;
mod registry;

use std::{collections::HashMap, fmt, path::PathBuf};

use async_trait::async_trait;

use crate::{
    archive::{Change, DiffStream},
    HardlinksResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use fallback::*;
pub use hardlinks::*;
pub use naive::*;
pub use registry::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a driver specific `apply_diff`.
pub enum ApplyOutcome {
    /// The diff was applied and committed; holds the number of bytes extracted.
    Applied(u64),

    /// The driver cannot apply this diff itself. The untouched stream is handed back so the
    /// caller can apply it the generic way.
    Fallback(DiffStream),
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The layer lifecycle every storage driver implements.
#[async_trait]
pub trait ProtoDriver: Send + Sync {
    /// Returns the name the driver is registered under.
    fn name(&self) -> &str;

    /// Returns human readable `(key, value)` status pairs.
    fn status(&self) -> Vec<(String, String)>;

    /// Returns driver specific metadata about a layer, if the driver keeps any.
    async fn get_metadata(&self, id: &str) -> HardlinksResult<Option<HashMap<String, String>>>;

    /// Releases resources held by the driver.
    async fn cleanup(&self) -> HardlinksResult<()>;

    /// Creates a new layer.
    ///
    /// ## Arguments
    ///
    /// * `id` - The identity of the new layer
    /// * `parent` - The layer the new one starts as a copy of, if any
    /// * `mount_label` - The SELinux label of the new layer
    ///
    /// ## Errors
    ///
    /// Returns an error if:
    /// - A layer with the same id already exists
    /// - The parent layer does not exist
    /// - The layer cannot be populated, in which case nothing is left behind
    async fn create(&self, id: &str, parent: Option<&str>, mount_label: &str)
        -> HardlinksResult<()>;

    /// Removes a layer and everything in it. Removing an absent layer succeeds.
    async fn remove(&self, id: &str) -> HardlinksResult<()>;

    /// Acquires a reference to a layer and returns the path its content is reachable at.
    ///
    /// Every successful `get` must be balanced by a [`put`](ProtoDriver::put).
    ///
    /// ## Arguments
    ///
    /// * `id` - The layer to acquire
    /// * `mount_label` - The SELinux label used when the layer has to be mounted
    async fn get(&self, id: &str, mount_label: &str) -> HardlinksResult<PathBuf>;

    /// Releases a reference acquired with [`get`](ProtoDriver::get).
    async fn put(&self, id: &str) -> HardlinksResult<()>;

    /// Returns `true` if the layer exists.
    async fn exists(&self, id: &str) -> bool;
}

/// A [`ProtoDriver`] with its own way of applying diffs.
#[async_trait]
pub trait ApplyDiffProtoDriver: ProtoDriver {
    /// Applies `diff` to layer `id`, built on top of `parent`.
    ///
    /// Returns [`ApplyOutcome::Fallback`] with the unread stream when the driver cannot handle
    /// the request, without touching the layer.
    async fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: DiffStream,
    ) -> HardlinksResult<ApplyOutcome>;
}

/// The complete driver surface.
#[async_trait]
pub trait Driver: ProtoDriver {
    /// Applies `diff` to layer `id` and returns the number of bytes extracted.
    async fn apply_diff(&self, id: &str, parent: Option<&str>, diff: DiffStream)
        -> HardlinksResult<u64>;

    /// Lists the changes of layer `id` relative to `parent`, sorted by path.
    async fn changes(&self, id: &str, parent: Option<&str>) -> HardlinksResult<Vec<Change>>;

    /// Exports the changes of layer `id` relative to `parent` as a diff stream.
    async fn diff(&self, id: &str, parent: Option<&str>) -> HardlinksResult<DiffStream>;

    /// Returns the number of bytes in regular files added or modified by layer `id`.
    async fn diff_size(&self, id: &str, parent: Option<&str>) -> HardlinksResult<u64>;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Applied(size) => f.debug_tuple("Applied").field(size).finish(),
            ApplyOutcome::Fallback(_) => f.debug_tuple("Fallback").field(&"<diff>").finish(),
        }
    }
}
