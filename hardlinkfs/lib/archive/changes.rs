use std::{
    collections::HashSet,
    fmt,
    fs::{self, Metadata},
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use nix::libc;
use walkdir::WalkDir;

use crate::{HardlinksError, HardlinksResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of a [`Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    /// The entry exists only in the layer.
    Add,

    /// The entry exists in both trees but differs.
    Modify,

    /// The entry exists only in the parent.
    Delete,
}

/// A single filesystem difference between a layer and its parent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Change {
    /// Absolute path of the entry inside the layer, e.g. `/etc/hosts`.
    pub path: PathBuf,

    /// What happened to the entry.
    pub kind: ChangeKind,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Change {
    /// Creates a new change for the layer-relative `relative_path`.
    pub fn new(relative_path: impl AsRef<Path>, kind: ChangeKind) -> Self {
        Self {
            path: Path::new("/").join(relative_path),
            kind,
        }
    }

    /// Returns the path relative to the layer root.
    pub fn relative_path(&self) -> &Path {
        self.path.strip_prefix("/").unwrap_or(&self.path)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Compares the tree at `layer_root` against `parent_root` and lists the differences, sorted by
/// path.
///
/// With no parent every entry of the layer is reported as [`ChangeKind::Add`]. Entries sharing an
/// inode are unchanged by definition; otherwise the file type, mode, ownership, device number and
/// symlink target are compared, plus size and modification time for non-directories. The children
/// of a deleted directory are not listed.
pub fn detect_changes(layer_root: &Path, parent_root: Option<&Path>) -> HardlinksResult<Vec<Change>> {
    let mut changes = Vec::new();

    for entry in WalkDir::new(layer_root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        let relative_path = relative_to(entry.path(), layer_root)?;
        let layer_metadata = entry.metadata().map_err(walk_error)?;

        let Some(parent_root) = parent_root else {
            changes.push(Change::new(relative_path, ChangeKind::Add));
            continue;
        };

        let parent_path = parent_root.join(relative_path);
        match fs::symlink_metadata(&parent_path) {
            Ok(parent_metadata) => {
                if has_changed(entry.path(), &layer_metadata, &parent_path, &parent_metadata)? {
                    changes.push(Change::new(relative_path, ChangeKind::Modify));
                }
            }
            Err(e) if is_missing(&e) => changes.push(Change::new(relative_path, ChangeKind::Add)),
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(parent_root) = parent_root {
        let mut walker = WalkDir::new(parent_root)
            .min_depth(1)
            .follow_links(false)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(walk_error)?;
            let relative_path = relative_to(entry.path(), parent_root)?;

            match fs::symlink_metadata(layer_root.join(relative_path)) {
                Ok(layer_metadata) => {
                    // Replaced by a non-directory, already reported as a modification.
                    if entry.file_type().is_dir() && !layer_metadata.is_dir() {
                        walker.skip_current_dir();
                    }
                }
                Err(e) if is_missing(&e) => {
                    changes.push(Change::new(relative_path, ChangeKind::Delete));
                    if entry.file_type().is_dir() {
                        walker.skip_current_dir();
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    changes.sort();
    tracing::debug!(
        "Detected {} changes in {}",
        changes.len(),
        layer_root.display()
    );

    Ok(changes)
}

/// Sums the sizes of the regular files added or modified by `changes` under `root`.
///
/// Files hardlinked to each other are counted once.
pub fn changes_size(root: &Path, changes: &[Change]) -> HardlinksResult<u64> {
    let mut seen = HashSet::new();
    let mut size = 0;

    for change in changes {
        if change.kind == ChangeKind::Delete {
            continue;
        }

        let metadata = match fs::symlink_metadata(root.join(change.relative_path())) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        if metadata.is_file() && seen.insert((metadata.dev(), metadata.ino())) {
            size += metadata.size();
        }
    }

    Ok(size)
}

fn has_changed(
    layer_path: &Path,
    layer: &Metadata,
    parent_path: &Path,
    parent: &Metadata,
) -> io::Result<bool> {
    if layer.dev() == parent.dev() && layer.ino() == parent.ino() {
        return Ok(false);
    }

    if layer.file_type() != parent.file_type()
        || layer.mode() != parent.mode()
        || layer.uid() != parent.uid()
        || layer.gid() != parent.gid()
        || layer.rdev() != parent.rdev()
    {
        return Ok(true);
    }

    if layer.file_type().is_symlink() && fs::read_link(layer_path)? != fs::read_link(parent_path)? {
        return Ok(true);
    }

    Ok(!layer.is_dir() && (layer.size() != parent.size() || !same_mtime(layer, parent)))
}

/// Copies keep microseconds and archives keep whole seconds.
fn same_mtime(a: &Metadata, b: &Metadata) -> bool {
    a.mtime() == b.mtime()
        && (a.mtime_nsec() / 1000 == b.mtime_nsec() / 1000
            || a.mtime_nsec() == 0
            || b.mtime_nsec() == 0)
}

fn relative_to<'a>(path: &'a Path, root: &Path) -> HardlinksResult<&'a Path> {
    path.strip_prefix(root).map_err(HardlinksError::custom)
}

/// Absent, or shadowed by a non-directory ancestor.
pub(super) fn is_missing(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::NotFound || error.raw_os_error() == Some(libc::ENOTDIR)
}

fn walk_error(error: walkdir::Error) -> HardlinksError {
    HardlinksError::Io(error.into())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Add => write!(f, "A"),
            ChangeKind::Modify => write!(f, "C"),
            ChangeKind::Delete => write!(f, "D"),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path.display())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
