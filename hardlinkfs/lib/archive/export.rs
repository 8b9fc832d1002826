use std::{
    io::{self, Cursor},
    path::Path,
};

use tar::{Builder, EntryType, Header};

use crate::{HardlinksError, HardlinksResult};

use super::{Change, ChangeKind, DiffStream, WHITEOUT_PREFIX};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Packs `changes` of the tree at `root` into an uncompressed tar diff.
///
/// Added and modified entries are archived from `root` without following symlinks; each deletion
/// becomes an empty `.wh.<name>` marker next to where the entry used to be.
pub fn export_changes(root: &Path, changes: &[Change]) -> HardlinksResult<DiffStream> {
    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for change in changes {
        let relative_path = change.relative_path();
        match change.kind {
            ChangeKind::Add | ChangeKind::Modify => {
                builder
                    .append_path_with_name(root.join(relative_path), relative_path)
                    .map_err(|e| HardlinksError::copy(root.join(relative_path), e))?;
            }
            ChangeKind::Delete => {
                let Some(name) = relative_path.file_name() else {
                    continue;
                };

                let mut whiteout_name = std::ffi::OsString::from(WHITEOUT_PREFIX);
                whiteout_name.push(name);
                let whiteout_path = relative_path.with_file_name(whiteout_name);

                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                header.set_uid(0);
                header.set_gid(0);
                header.set_mtime(0);
                builder.append_data(&mut header, &whiteout_path, io::empty())?;
            }
        }
    }

    let bytes = builder.into_inner()?;
    tracing::debug!(
        "Exported {} changes from {} ({} bytes)",
        changes.len(),
        root.display(),
        bytes.len()
    );

    Ok(Box::new(Cursor::new(bytes)))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
