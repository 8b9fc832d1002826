use std::{
    collections::HashSet,
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use nix::unistd::Uid;
use walkdir::WalkDir;

use crate::{HardlinksError, HardlinksResult};

use super::{
    changes::is_missing, DiffExtractor, DiffStream, TarOptions, WHITEOUT_OPAQUE, WHITEOUT_PREFIX,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The default [`DiffExtractor`], built on the `tar` crate.
///
/// Entries are extracted in archive order. Whiteout markers are processed instead of being
/// written; opaque directories are emptied of lower content once the whole archive has been
/// read, so entries the diff itself adds to them survive.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarExtractor;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl DiffExtractor for TarExtractor {
    fn apply_layer(
        &self,
        dest: &Path,
        diff: DiffStream,
        options: &TarOptions,
    ) -> HardlinksResult<u64> {
        let remap = !options.id_mappings.is_empty();
        let root = fs::canonicalize(dest).map_err(extract_error)?;

        let mut archive = tar::Archive::new(diff);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(true);
        archive.set_overwrite(true);
        archive.set_preserve_ownerships(!remap && Uid::effective().is_root());

        let mut size = 0;
        let mut unpacked = HashSet::new();
        let mut opaque_dirs = Vec::new();

        for entry in archive.entries().map_err(extract_error)? {
            let mut entry = entry.map_err(extract_error)?;
            let raw_path = entry.path().map_err(extract_error)?.into_owned();
            let relative_path = sanitize(&raw_path)?;

            let Some(file_name) = relative_path.file_name() else {
                continue;
            };
            let file_name = file_name.to_string_lossy().into_owned();
            let parent = relative_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();

            if file_name == WHITEOUT_OPAQUE {
                tracing::debug!("Opaque whiteout: {}", parent.display());
                opaque_dirs.push(parent);
                continue;
            }

            if let Some(original_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                if matches!(original_name, "" | "." | "..") {
                    return Err(HardlinksError::Extract(format!(
                        "invalid whiteout: {}",
                        raw_path.display()
                    )));
                }

                let target = resolve_inside(&root, &parent)?.join(original_name);
                tracing::debug!("Whiteout: {}", target.display());
                remove_path(&target).map_err(extract_error)?;
                continue;
            }

            let target = resolve_inside(&root, &parent)?.join(&file_name);
            let entry_type = entry.header().entry_type();

            clear_target(&target, entry_type.is_dir()).map_err(extract_error)?;

            if !entry.unpack_in(&root).map_err(extract_error)? {
                return Err(escape_error(&raw_path));
            }

            if entry_type.is_file() {
                size += entry.size();
            }

            if remap {
                let header = entry.header();
                let uid = options.id_mappings.to_host_uid(header_id(header.uid(), "uid")?)?;
                let gid = options.id_mappings.to_host_gid(header_id(header.gid(), "gid")?)?;
                std::os::unix::fs::lchown(&target, Some(uid), Some(gid)).map_err(extract_error)?;

                // chown clears setuid and setgid bits.
                if !entry_type.is_symlink() && !entry_type.is_hard_link() {
                    let mode = header.mode().map_err(extract_error)?;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                        .map_err(extract_error)?;
                }
            }

            tracing::debug!("Extracted {} ({:?})", relative_path.display(), entry_type);

            for ancestor in relative_path.ancestors() {
                if !unpacked.insert(ancestor.to_path_buf()) {
                    break;
                }
            }
        }

        for dir in opaque_dirs {
            clear_opaque_dir(&root, &dir, &unpacked)?;
        }

        tracing::info!("Applied diff onto {} ({} bytes)", dest.display(), size);
        Ok(size)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn extract_error(error: io::Error) -> HardlinksError {
    HardlinksError::Extract(error.to_string())
}

fn escape_error(path: &Path) -> HardlinksError {
    HardlinksError::Extract(format!("entry escapes destination: {}", path.display()))
}

fn header_id(id: io::Result<u64>, kind: &str) -> HardlinksResult<u32> {
    let id = id.map_err(extract_error)?;
    u32::try_from(id).map_err(|_| {
        HardlinksError::InvalidIdMapping(format!("{} {} does not fit in 32 bits", kind, id))
    })
}

/// Strips leading `/` and `.` components and rejects `..`.
fn sanitize(path: &Path) -> HardlinksResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return Err(escape_error(path)),
        }
    }
    Ok(clean)
}

/// Resolves `relative` under the canonical `root`, following symlinks that already exist.
///
/// Trailing components that do not exist yet are appended as they are. Fails if the existing part
/// resolves outside `root`, or if it ends in a dangling symlink.
fn resolve_inside(root: &Path, relative: &Path) -> HardlinksResult<PathBuf> {
    let mut existing = root.join(relative);
    let mut missing = Vec::new();

    let resolved = loop {
        match fs::canonicalize(&existing) {
            Ok(resolved) => break resolved,
            Err(e) if is_missing(&e) => {
                // A dangling symlink cannot be followed safely.
                if fs::symlink_metadata(&existing).is_ok() {
                    return Err(escape_error(relative));
                }

                let (Some(name), Some(parent)) = (existing.file_name(), existing.parent()) else {
                    return Err(extract_error(e));
                };
                missing.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            Err(e) => return Err(extract_error(e)),
        }
    };

    if !resolved.starts_with(root) {
        tracing::warn!(
            "Refusing {}: resolves to {}",
            relative.display(),
            resolved.display()
        );
        return Err(escape_error(relative));
    }

    Ok(missing
        .into_iter()
        .rev()
        .fold(resolved, |path, name| path.join(name)))
}

/// Unlinks whatever an incoming entry is about to replace.
///
/// An existing directory is kept when a directory replaces it. Anything else is removed so the new
/// entry gets a fresh inode instead of being written through a link shared with another layer.
fn clear_target(target: &Path, incoming_is_dir: bool) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.is_dir() && incoming_is_dir => Ok(()),
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(target),
        Ok(_) => fs::remove_file(target),
        Err(e) if is_missing(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_path(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(target),
        Ok(_) => fs::remove_file(target),
        Err(e) if is_missing(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes everything under `dir` that was not written by the current diff.
fn clear_opaque_dir(root: &Path, dir: &Path, unpacked: &HashSet<PathBuf>) -> HardlinksResult<()> {
    let opaque_root = resolve_inside(root, dir)?;
    if fs::symlink_metadata(&opaque_root).is_err() {
        return fs::create_dir_all(&opaque_root).map_err(extract_error);
    }

    let mut walker = WalkDir::new(&opaque_root)
        .min_depth(1)
        .follow_links(false)
        .into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| extract_error(e.into()))?;
        let relative_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| escape_error(entry.path()))?;

        if unpacked.contains(relative_path) {
            continue;
        }

        tracing::debug!("Hiding lower entry: {}", entry.path().display());
        if entry.file_type().is_dir() {
            fs::remove_dir_all(entry.path()).map_err(extract_error)?;
            walker.skip_current_dir();
        } else {
            fs::remove_file(entry.path()).map_err(extract_error)?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{symlink, MetadataExt};

    use tar::{Builder, EntryType, Header};
    use tempfile::tempdir;

    use crate::config::{IdMap, IdMappings};

    use super::*;

    #[test_log::test]
    fn test_archive_extract_adds_and_replaces_entries() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let dest = temp.path().join("dest");
        fs::create_dir_all(dest.join("etc"))?;
        fs::write(dest.join("etc/hostname"), "old")?;

        let diff = helper::build_diff(|builder| {
            helper::append_dir(builder, "etc", 0o755)?;
            helper::append_file(builder, "etc/hostname", b"new-host", 0o644)?;
            helper::append_file(builder, "usr/bin/tool", b"#!/bin/sh\n", 0o755)?;
            helper::append_symlink(builder, "usr/bin/alias", "tool")
        })?;

        let size = TarExtractor.apply_layer(&dest, diff, &TarOptions::default())?;

        assert_eq!(size, 8 + 10);
        assert_eq!(fs::read_to_string(dest.join("etc/hostname"))?, "new-host");
        assert_eq!(
            fs::metadata(dest.join("usr/bin/tool"))?.permissions().mode() & 0o777,
            0o755
        );
        assert_eq!(fs::read_link(dest.join("usr/bin/alias"))?, PathBuf::from("tool"));

        Ok(())
    }

    #[test_log::test]
    fn test_archive_extract_never_writes_through_shared_inode() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let lower = temp.path().join("lower.txt");
        let dest = temp.path().join("dest");
        fs::create_dir(&dest)?;
        fs::write(&lower, "lower content")?;
        fs::hard_link(&lower, dest.join("shared.txt"))?;

        let diff = helper::build_diff(|builder| {
            helper::append_file(builder, "shared.txt", b"upper content", 0o644)
        })?;
        TarExtractor.apply_layer(&dest, diff, &TarOptions::default())?;

        assert_eq!(fs::read_to_string(&lower)?, "lower content");
        assert_eq!(fs::read_to_string(dest.join("shared.txt"))?, "upper content");
        assert_ne!(
            fs::metadata(&lower)?.ino(),
            fs::metadata(dest.join("shared.txt"))?.ino()
        );

        Ok(())
    }

    #[test_log::test]
    fn test_archive_extract_whiteouts() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let dest = temp.path().join("dest");
        fs::create_dir_all(dest.join("dir1/nested"))?;
        fs::write(dest.join("file1.txt"), "remove me")?;
        fs::write(dest.join("file2.txt"), "keep me")?;
        fs::write(dest.join("dir1/inside1.txt"), "hidden")?;
        fs::write(dest.join("dir1/nested/deep.txt"), "hidden")?;
        fs::create_dir_all(dest.join("gone/sub"))?;

        let diff = helper::build_diff(|builder| {
            helper::append_file(builder, ".wh.file1.txt", b"", 0o644)?;
            helper::append_file(builder, ".wh.gone", b"", 0o644)?;
            helper::append_dir(builder, "dir1", 0o755)?;
            helper::append_file(builder, "dir1/.wh..wh..opq", b"", 0o644)?;
            helper::append_file(builder, "dir1/new_file.txt", b"new", 0o644)?;
            helper::append_file(builder, "dir1/fresh/child.txt", b"child", 0o644)
        })?;
        let size = TarExtractor.apply_layer(&dest, diff, &TarOptions::default())?;

        assert_eq!(size, 3 + 5);
        assert!(!dest.join("file1.txt").exists());
        assert!(!dest.join(".wh.file1.txt").exists());
        assert!(!dest.join("gone").exists());
        assert!(dest.join("file2.txt").exists());
        assert!(dest.join("dir1").is_dir());
        assert!(!dest.join("dir1/inside1.txt").exists());
        assert!(!dest.join("dir1/nested").exists());
        assert!(!dest.join("dir1/.wh..wh..opq").exists());
        assert_eq!(fs::read_to_string(dest.join("dir1/new_file.txt"))?, "new");
        assert_eq!(fs::read_to_string(dest.join("dir1/fresh/child.txt"))?, "child");

        Ok(())
    }

    #[test_log::test]
    fn test_archive_extract_replaces_directory_with_file() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let dest = temp.path().join("dest");
        fs::create_dir_all(dest.join("config/sub"))?;
        fs::write(dest.join("config/sub/a"), "a")?;

        let diff = helper::build_diff(|builder| {
            helper::append_file(builder, "config", b"flat", 0o600)
        })?;
        TarExtractor.apply_layer(&dest, diff, &TarOptions::default())?;

        assert!(fs::symlink_metadata(dest.join("config"))?.is_file());
        assert_eq!(fs::read_to_string(dest.join("config"))?, "flat");

        Ok(())
    }

    #[test_log::test]
    fn test_archive_extract_rejects_parent_traversal() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let dest = temp.path().join("dest");
        fs::create_dir(&dest)?;

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_old();
        let name = b"../escaped.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"evil"[..])?;
        let diff: DiffStream = Box::new(io::Cursor::new(builder.into_inner()?));

        let err = TarExtractor
            .apply_layer(&dest, diff, &TarOptions::default())
            .unwrap_err();

        assert!(matches!(err, HardlinksError::Extract(_)));
        assert!(!temp.path().join("escaped.txt").exists());

        Ok(())
    }

    #[test_log::test]
    fn test_archive_extract_refuses_to_follow_symlinks_out_of_dest() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let host = temp.path().join("host");
        let dest = temp.path().join("dest");
        fs::create_dir(&host)?;
        fs::create_dir(&dest)?;
        fs::write(host.join("victim"), "victim")?;
        fs::write(host.join("victim2"), "victim2")?;
        symlink(&host, dest.join("escape"))?;
        symlink("../host", dest.join("relative_escape"))?;

        let diffs = [
            helper::build_diff(|builder| {
                helper::append_file(builder, "escape/.wh.victim", b"", 0o644)
            })?,
            helper::build_diff(|builder| {
                helper::append_file(builder, "escape/victim2", b"overwritten", 0o644)
            })?,
            helper::build_diff(|builder| {
                helper::append_file(builder, "relative_escape/.wh.victim", b"", 0o644)
            })?,
            helper::build_diff(|builder| {
                helper::append_file(builder, "escape/.wh..wh..opq", b"", 0o644)
            })?,
        ];

        for diff in diffs {
            let err = TarExtractor
                .apply_layer(&dest, diff, &TarOptions::default())
                .unwrap_err();
            assert!(matches!(err, HardlinksError::Extract(_)));
        }

        assert_eq!(fs::read_to_string(host.join("victim"))?, "victim");
        assert_eq!(fs::read_to_string(host.join("victim2"))?, "victim2");
        assert!(fs::symlink_metadata(dest.join("escape"))?.file_type().is_symlink());

        Ok(())
    }

    #[test_log::test]
    fn test_archive_extract_follows_symlinks_inside_dest() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let dest = temp.path().join("dest");
        fs::create_dir_all(dest.join("usr/lib"))?;
        fs::write(dest.join("usr/lib/old.so"), "old")?;
        symlink("usr/lib", dest.join("lib"))?;
        symlink("/nowhere", dest.join("dangling"))?;

        let diff = helper::build_diff(|builder| {
            helper::append_file(builder, "lib/.wh.old.so", b"", 0o644)?;
            helper::append_file(builder, "lib/new.so", b"new", 0o644)?;
            helper::append_file(builder, ".wh.dangling", b"", 0o644)
        })?;
        TarExtractor.apply_layer(&dest, diff, &TarOptions::default())?;

        assert!(!dest.join("usr/lib/old.so").exists());
        assert_eq!(fs::read_to_string(dest.join("usr/lib/new.so"))?, "new");
        assert!(fs::symlink_metadata(dest.join("lib"))?.file_type().is_symlink());
        assert!(fs::symlink_metadata(dest.join("dangling")).is_err());

        let diff = helper::build_diff(|builder| {
            helper::append_file(builder, ".wh..", b"", 0o644)
        })?;
        assert!(TarExtractor
            .apply_layer(&dest, diff, &TarOptions::default())
            .is_err());
        assert!(dest.join("usr/lib/new.so").exists());

        Ok(())
    }

    #[test_log::test]
    fn test_archive_extract_rejects_ids_wider_than_32_bits() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let dest = temp.path().join("dest");
        fs::create_dir(&dest)?;

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(2);
        header.set_mode(0o644);
        header.set_uid(u64::from(u32::MAX) + 1);
        header.set_gid(0);
        header.set_mtime(1_700_000_000);
        builder.append_data(&mut header, "wide", &b"hi"[..])?;
        let diff: DiffStream = Box::new(io::Cursor::new(builder.into_inner()?));

        let options = TarOptions {
            id_mappings: IdMappings::new(
                vec![IdMap::new(0, 100_000, 65_536)],
                vec![IdMap::new(0, 100_000, 65_536)],
            ),
        };
        let err = TarExtractor.apply_layer(&dest, diff, &options).unwrap_err();

        assert!(matches!(err, HardlinksError::InvalidIdMapping(_)));

        Ok(())
    }

    pub(crate) mod helper {
        use super::*;

        pub(crate) fn build_diff(
            build: impl FnOnce(&mut Builder<Vec<u8>>) -> io::Result<()>,
        ) -> io::Result<DiffStream> {
            let mut builder = Builder::new(Vec::new());
            build(&mut builder)?;
            Ok(Box::new(io::Cursor::new(builder.into_inner()?)))
        }

        pub(crate) fn append_file(
            builder: &mut Builder<Vec<u8>>,
            path: &str,
            content: &[u8],
            mode: u32,
        ) -> io::Result<()> {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(mode);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(1_700_000_000);
            builder.append_data(&mut header, path, content)
        }

        pub(crate) fn append_dir(
            builder: &mut Builder<Vec<u8>>,
            path: &str,
            mode: u32,
        ) -> io::Result<()> {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(mode);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(1_700_000_000);
            builder.append_data(&mut header, path, io::empty())
        }

        pub(crate) fn append_symlink(
            builder: &mut Builder<Vec<u8>>,
            path: &str,
            target: &str,
        ) -> io::Result<()> {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(1_700_000_000);
            builder.append_link(&mut header, path, target)
        }
    }
}
