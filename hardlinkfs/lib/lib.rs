//! `hardlinkfs` is a layer storage driver for container images that links child layers to their
//! parents with hardlinks instead of a union filesystem.
//!
//! # Overview
//!
//! Every layer lives in its own directory under the driver home:
//!
//! ```text
//! home/
//! └── <id>/
//!     ├── root/  - committed filesystem content of the layer
//!     └── mnt/   - bind mount target, only for layers with a parent
//! ```
//!
//! A child layer starts out as a hardlinked copy of its parent's `root/`, so every unmodified
//! regular file shares its inode with the parent. This is only sound because a committed `root/`
//! is written at most once and never mutated afterwards.
//!
//! # Components
//!
//! - [`rootfs`] - the hardlink copy engine and the atomic directory swap used for commits
//! - [`driver`] - the driver traits, the hardlinks driver, the generic diff driver, the fallback
//!   wrapper and the driver registry
//! - [`archive`] - diff extraction, change detection and diff export
//! - [`mount`] - bind mount plumbing and mount label formatting
//! - [`config`] - driver options, ID mappings and defaults
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use hardlinkfs::driver::{self, Driver, ProtoDriver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let driver = driver::init("/var/lib/hardlinks", &[], vec![], vec![]).await?;
//!
//!     driver.create("base", None, "").await?;
//!     driver.create("container", Some("base"), "").await?;
//!
//!     let rootfs = driver.get("container", "").await?;
//!     println!("rootfs mounted at {}", rootfs.display());
//!     driver.put("container").await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod archive;
pub mod config;
pub mod driver;
pub mod mount;
pub mod rootfs;
pub mod utils;

pub use error::*;
