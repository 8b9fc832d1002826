//! Layer diff handling.
//!
//! A layer diff is an uncompressed tar stream using OCI whiteouts:
//!
//! - `.wh.<name>` deletes `<name>` from the layer below
//! - `.wh..wh..opq` hides everything the layer below has in the containing directory
//!
//! This module provides the [`DiffExtractor`] seam the drivers apply diffs through, the default
//! [`TarExtractor`], change detection between two layer trees, and the export of those changes
//! as a diff stream.

mod changes;
mod export;
mod extract;

use std::{fmt, io::Read, path::Path};

use crate::{config::IdMappings, HardlinksResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use changes::*;
pub use export::*;
pub use extract::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Name of an opaque whiteout entry.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An uncompressed tar stream describing a layer diff.
pub type DiffStream = Box<dyn Read + Send>;

/// Options controlling how a diff is extracted.
#[derive(Debug, Clone, Default)]
pub struct TarOptions {
    /// Ownership remapping applied to every extracted entry.
    pub id_mappings: IdMappings,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Applies a diff stream on top of a directory.
///
/// Implementations run on the blocking thread pool.
pub trait DiffExtractor: fmt::Debug + Send + Sync {
    /// Extracts `diff` on top of `dest`, realizing added, modified and deleted entries.
    ///
    /// Returns the number of content bytes written.
    ///
    /// Existing non-directory entries that are replaced must be unlinked rather than written
    /// through, since they may share their inode with another layer.
    fn apply_layer(&self, dest: &Path, diff: DiffStream, options: &TarOptions)
        -> HardlinksResult<u64>;
}
