//! Bind mount plumbing.
//!
//! The driver never calls `mount(2)` directly; it goes through the [`Mounter`] trait so the
//! reference tracking logic can be exercised without privileges. [`SysMounter`] is the real
//! implementation used by default.

mod label;
mod sys;

use std::{fmt, path::Path};

use crate::HardlinksResult;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use label::*;
pub use sys::*;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Establishes and tears down bind mounts.
pub trait Mounter: fmt::Debug + Send + Sync {
    /// Bind mounts `source` onto `target`.
    ///
    /// `options` is a comma separated mount option string such as `bind,ro` or
    /// `bind,context="system_u:object_r:container_file_t:s0"`.
    fn bind_mount(&self, source: &Path, target: &Path, options: &str) -> HardlinksResult<()>;

    /// Unmounts whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> HardlinksResult<()>;
}
