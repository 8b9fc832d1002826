use std::path::Path;

#[cfg(target_os = "linux")]
use nix::mount::MsFlags;

use crate::HardlinksResult;

use super::Mounter;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`Mounter`] backed by the `mount(2)` and `umount2(2)` syscalls.
///
/// Requires `CAP_SYS_ADMIN`. On platforms other than Linux every call fails with
/// [`HardlinksError::MountUnsupported`](crate::HardlinksError::MountUnsupported).
#[derive(Debug, Clone, Copy, Default)]
pub struct SysMounter;

/// A mount option string split into kernel flags and filesystem data.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMountOptions {
    /// Flags passed to `mount(2)`.
    pub flags: MsFlags,

    /// Options passed through as the data argument, comma separated.
    pub data: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits a comma separated option string into mount flags and a data string.
///
/// Recognized flag options are `bind`, `rbind`, `ro`, `rw`, `nosuid`, `nodev`, `noexec`,
/// `private` and `rprivate`; everything else is forwarded as data.
#[cfg(target_os = "linux")]
pub fn parse_mount_options(options: &str) -> ParsedMountOptions {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        match option {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags &= !MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "private" => flags |= MsFlags::MS_PRIVATE,
            "rprivate" => flags |= MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            other => data.push(other),
        }
    }

    ParsedMountOptions {
        flags,
        data: data.join(","),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[cfg(target_os = "linux")]
impl Mounter for SysMounter {
    fn bind_mount(&self, source: &Path, target: &Path, options: &str) -> HardlinksResult<()> {
        use nix::mount::mount;

        use crate::HardlinksError;

        let parsed = parse_mount_options(options);
        let data = (!parsed.data.is_empty()).then_some(parsed.data.as_str());
        let mount_error = |errno| HardlinksError::Mount {
            source_path: source.to_path_buf(),
            target: target.to_path_buf(),
            errno,
        };

        // The kernel ignores MS_RDONLY on the initial bind, so read-only needs a remount.
        let initial_flags = parsed.flags & !MsFlags::MS_RDONLY;
        mount(Some(source), target, None::<&str>, initial_flags, data)
            .map_err(|errno| mount_error(errno))?;

        if parsed.flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY) {
            let remount_flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
            let remounted = mount(None::<&str>, target, None::<&str>, remount_flags, None::<&str>);
            if let Err(errno) = remounted {
                if let Err(e) = self.unmount(target) {
                    tracing::warn!("Failed to roll back bind mount on {}: {}", target.display(), e);
                }
                return Err(mount_error(errno));
            }
        }

        tracing::info!(
            "Bind mounted {} on {} ({})",
            source.display(),
            target.display(),
            options
        );

        Ok(())
    }

    fn unmount(&self, target: &Path) -> HardlinksResult<()> {
        use nix::mount::{umount2, MntFlags};

        use crate::HardlinksError;

        umount2(target, MntFlags::empty()).map_err(|errno| HardlinksError::Unmount {
            target: target.to_path_buf(),
            errno,
        })?;

        tracing::info!("Unmounted {}", target.display());
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for SysMounter {
    fn bind_mount(&self, _source: &Path, _target: &Path, _options: &str) -> HardlinksResult<()> {
        Err(crate::HardlinksError::MountUnsupported)
    }

    fn unmount(&self, _target: &Path) -> HardlinksResult<()> {
        Err(crate::HardlinksError::MountUnsupported)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
