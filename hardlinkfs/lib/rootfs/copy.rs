use std::{
    fs::{self, Metadata},
    io,
    os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    libc,
    sys::{
        stat::{self, Mode, SFlag},
        time::TimeVal,
    },
    unistd,
};
use walkdir::WalkDir;

use crate::{utils, HardlinksError, HardlinksResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The only extended attribute carried over to recreated entries.
const CAPABILITY_XATTR: &str = "security.capability";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How regular files are reproduced by [`copy_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Regular files are hardlinked and share their inode with the source.
    Hardlink,

    /// Regular files are copied byte for byte into new inodes.
    Content,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Recursively reproduces `source_dir` under `dest_dir`.
///
/// `dest_dir` must either not exist or be empty. Regular files are hardlinked or copied depending
/// on `mode`; directories are always created fresh; symlinks are recreated verbatim; FIFOs,
/// sockets and device nodes are recreated with the same type and device number. Ownership, mode
/// bits, timestamps and file capabilities are preserved. Directory modes and timestamps are
/// applied only after their contents are in place.
///
/// Hardlinked files are shared with the source, so this is only safe while nobody writes through
/// either tree in place.
///
/// The copy runs on the blocking thread pool.
///
/// # Errors
/// Returns [`HardlinksError::Copy`] naming the failing path if any filesystem operation fails. A
/// partially populated `dest_dir` is left behind for the caller to remove.
pub async fn copy_dir(
    source_dir: impl AsRef<Path>,
    dest_dir: impl AsRef<Path>,
    mode: CopyMode,
) -> HardlinksResult<()> {
    let source_dir = source_dir.as_ref().to_path_buf();
    let dest_dir = dest_dir.as_ref().to_path_buf();

    tokio::task::spawn_blocking(move || copy_dir_blocking(&source_dir, &dest_dir, mode)).await?
}

/// Blocking version of [`copy_dir`].
pub fn copy_dir_blocking(source_dir: &Path, dest_dir: &Path, mode: CopyMode) -> HardlinksResult<()> {
    tracing::debug!(
        "Copying {} -> {} ({:?})",
        source_dir.display(),
        dest_dir.display(),
        mode
    );

    // Directories get their final mode and times last, deepest first.
    let mut directories: Vec<(PathBuf, Metadata)> = Vec::new();

    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| source_dir.to_path_buf());
            HardlinksError::copy(path, e.into())
        })?;

        let source_path = entry.path();
        let relative_path = source_path
            .strip_prefix(source_dir)
            .map_err(HardlinksError::custom)?;
        let target_path = dest_dir.join(relative_path);

        let metadata = entry
            .metadata()
            .map_err(|e| HardlinksError::copy(source_path, e.into()))?;

        copy_entry(source_path, &target_path, &metadata, mode)
            .map_err(|e| HardlinksError::copy(source_path, e))?;

        if metadata.is_dir() {
            directories.push((target_path, metadata));
        }
    }

    for (target_path, metadata) in directories.iter().rev() {
        fs::set_permissions(target_path, fs::Permissions::from_mode(metadata.mode() & 0o7777))
            .and_then(|_| set_times(target_path, metadata))
            .map_err(|e| HardlinksError::copy(target_path, e))?;
    }

    Ok(())
}

fn copy_entry(source: &Path, target: &Path, metadata: &Metadata, mode: CopyMode) -> io::Result<()> {
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        match fs::create_dir(target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && target.is_dir() => {}
            Err(e) => return Err(e),
        }

        // Owner-writable until the final mode is applied after the contents are in place.
        fs::set_permissions(target, fs::Permissions::from_mode(0o700))?;
        lchown_like(target, metadata)?;
        copy_capabilities(source, target)?;
        return Ok(());
    }

    if file_type.is_file() {
        match mode {
            CopyMode::Hardlink => {
                tracing::debug!("Linking file: {} -> {}", source.display(), target.display());
                return fs::hard_link(source, target);
            }
            CopyMode::Content => {
                tracing::debug!("Copying file: {} -> {}", source.display(), target.display());
                fs::copy(source, target)?;
            }
        }
    } else if file_type.is_symlink() {
        let link_target = fs::read_link(source)?;
        tracing::debug!(
            "Creating symlink: {} -> {}",
            target.display(),
            link_target.display()
        );
        std::os::unix::fs::symlink(&link_target, target)?;

        // Symlinks carry no permissions of their own.
        lchown_like(target, metadata)?;
        return set_times(target, metadata);
    } else if file_type.is_fifo() {
        tracing::debug!("Creating FIFO: {}", target.display());
        unistd::mkfifo(target, permission_bits(metadata)).map_err(io::Error::from)?;
    } else if file_type.is_char_device() || file_type.is_block_device() || file_type.is_socket() {
        tracing::debug!("Creating special file: {}", target.display());
        let kind = SFlag::from_bits_truncate(metadata.mode() as libc::mode_t & SFlag::S_IFMT.bits());
        stat::mknod(target, kind, permission_bits(metadata), metadata.rdev() as libc::dev_t)
            .map_err(io::Error::from)?;
    } else {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unknown file type {:?}", file_type),
        ));
    }

    lchown_like(target, metadata)?;
    fs::set_permissions(target, fs::Permissions::from_mode(metadata.mode() & 0o7777))?;
    copy_capabilities(source, target)?;
    set_times(target, metadata)?;

    tracing::debug!(
        "Applied original permissions to {}: {} ({:#o})",
        target.display(),
        utils::format_mode(metadata.mode()),
        metadata.mode() & 0o7777
    );

    Ok(())
}

fn permission_bits(metadata: &Metadata) -> Mode {
    Mode::from_bits_truncate(metadata.mode() as libc::mode_t & 0o7777)
}

fn lchown_like(target: &Path, metadata: &Metadata) -> io::Result<()> {
    std::os::unix::fs::lchown(target, Some(metadata.uid()), Some(metadata.gid()))
}

fn set_times(target: &Path, metadata: &Metadata) -> io::Result<()> {
    let atime = TimeVal::new(metadata.atime() as _, (metadata.atime_nsec() / 1000) as _);
    let mtime = TimeVal::new(metadata.mtime() as _, (metadata.mtime_nsec() / 1000) as _);
    stat::lutimes(target, &atime, &mtime).map_err(io::Error::from)
}

fn copy_capabilities(source: &Path, target: &Path) -> io::Result<()> {
    match xattr::get(source, CAPABILITY_XATTR) {
        Ok(Some(value)) => xattr::set(target, CAPABILITY_XATTR, &value),
        Ok(None) => Ok(()),
        Err(e) if is_unsupported(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_unsupported(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::Unsupported
        || error.raw_os_error() == Some(Errno::ENOTSUP as i32)
        || error.raw_os_error() == Some(Errno::ENODATA as i32)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
