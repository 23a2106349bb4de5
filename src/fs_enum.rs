//! Filesystem enumeration for the listing producer

use anyhow::{Context, Result};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::protocol::{DirEntry, Timestamp, MODE_DIR, MODE_PERM};
use crate::protocol_core::slash_name;

/// Preorder walk of `root`, one `DirEntry` per object below it.
///
/// Entries are sorted by file name within each directory, so a directory is
/// always yielded before anything inside it. The root itself is not reported.
/// Symlinks are not followed; they are reported as non-directories.
pub struct TreeWalk {
    root: PathBuf,
    inner: walkdir::IntoIter,
}

impl TreeWalk {
    pub fn new(root: &Path) -> Self {
        let inner = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        Self {
            root: root.to_path_buf(),
            inner,
        }
    }

    fn to_entry(&self, entry: walkdir::DirEntry) -> Result<DirEntry> {
        let path = entry.path();
        let rel = path
            .strip_prefix(&self.root)
            .with_context(|| format!("{} is outside {}", path.display(), self.root.display()))?;
        let name = slash_name(rel);
        let md = entry
            .metadata()
            .with_context(|| format!("{}: stat", name))?;
        Ok(entry_from_metadata(name, &md))
    }
}

impl Iterator for TreeWalk {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.inner.next()?;
        Some(match next {
            Ok(entry) => self.to_entry(entry),
            Err(e) => {
                let where_ = e
                    .path()
                    .and_then(|p| p.strip_prefix(&self.root).ok())
                    .map(slash_name)
                    .unwrap_or_default();
                Err(anyhow::Error::new(e).context(format!("walk {}", where_)))
            }
        })
    }
}

/// Build the wire entry for one object
pub fn entry_from_metadata(name: String, md: &Metadata) -> DirEntry {
    let mut mode = permission_bits(md);
    if md.is_dir() {
        mode |= MODE_DIR;
    }
    let mod_time = md
        .modified()
        .map(Timestamp::from_system_time)
        .unwrap_or_default();
    DirEntry {
        name,
        size: md.len() as i64,
        mode,
        mod_time,
    }
}

#[cfg(unix)]
fn permission_bits(md: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & MODE_PERM
}

#[cfg(not(unix))]
fn permission_bits(md: &Metadata) -> u32 {
    let base = if md.is_dir() { 0o777 } else { 0o666 };
    let bits = if md.permissions().readonly() { base & 0o555 } else { base };
    bits & MODE_PERM
}
