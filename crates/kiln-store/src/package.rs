//! Deterministic package archives.
//!
//! A packed package is a tar stream whose entries are sorted by relative
//! path, with zeroed timestamps and root ownership, so identical package
//! trees always hash to the same object.

use crate::StoreError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

pub fn pack_package(package_dir: &Path) -> Result<Vec<u8>, StoreError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for (rel, full) in walk(package_dir)? {
        let meta = full.symlink_metadata()?;
        let ft = meta.file_type();
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(meta.permissions().mode());

        if ft.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, format!("{rel}/"), std::io::empty())?;
        } else if ft.is_file() {
            let data = fs::read(&full)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, &rel, data.as_slice())?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&full)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_cksum();
            builder.append_link(&mut header, &rel, &target)?;
        } else {
            warn!("skipping unsupported file type in package: {rel}");
        }
    }

    Ok(builder.into_inner()?)
}

pub fn unpack_package(data: &[u8], target_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target_dir)?;
    let mut archive = tar::Archive::new(data);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(false);
    archive.set_unpack_xattrs(false);
    archive.unpack(target_dir)?;
    Ok(())
}

/// Sorted relative paths of every regular file and symlink under `dir`.
pub fn list_files(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut files = Vec::new();
    for (rel, full) in walk(dir)? {
        if !full.symlink_metadata()?.is_dir() {
            files.push(rel);
        }
    }
    Ok(files)
}

/// Every entry below `root` as `(relative, absolute)`, sorted by relative
/// path. Relative paths always use `/`.
fn walk(root: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let full = entry?.path();
            let rel = full
                .strip_prefix(root)
                .map_err(|e| StoreError::Io(std::io::Error::other(format!("path strip: {e}"))))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if full.symlink_metadata()?.is_dir() {
                pending.push(full.clone());
            }
            out.push((rel, full));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
