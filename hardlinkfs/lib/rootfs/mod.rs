//! Layer root materialization.
//!
//! This module provides the two filesystem primitives every layer commit is built from:
//!
//! 1. [`copy_dir`] reproduces a directory tree, hardlinking regular files so that a child layer
//!    shares the storage of every file it does not change.
//! 2. [`replace_dir`] swaps a fully staged directory into place so a half-written `root/` is never
//!    observable.
//!
//! # Examples
//!
//! ```no_run
//! use hardlinkfs::rootfs::{self, CopyMode};
//!
//! # async fn example() -> anyhow::Result<()> {
//! rootfs::copy_dir("/layers/parent/root", "/layers/child/tmproot", CopyMode::Hardlink).await?;
//! rootfs::replace_dir("/layers/child/tmproot", "/layers/child/root").await?;
//! # Ok(())
//! # }
//! ```

mod copy;
mod replace;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use copy::*;
pub use replace::*;
