use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::Path;
use walkdir::WalkDir;

use crate::archive;
use crate::error::{Error, Result};

/// Names that never take part in a tree: VCS metadata and OS droppings.
const IGNORED_NAMES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".DS_Store",
    "__MACOSX",
    "Thumbs.db",
    "desktop.ini",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
    Symlink { target: String },
}

/// One file, directory or symlink of a tree, addressed by its index in `Tree::entries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Relative path, always slash-separated.
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    /// Byte size (0 for directories and symlinks).
    pub size: u64,
}

impl Entry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Ordered description of a tree. Indices are dense and stable for the
/// lifetime of a diff or apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: Vec<Entry>,
    /// Sum of all file sizes.
    pub size: u64,
}

impl Tree {
    pub fn new(entries: Vec<Entry>) -> Self {
        let size = entries.iter().filter(|e| e.is_file()).map(|e| e.size).sum();
        Self { entries, size }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry, failing with a decode error on a dangling index.
    pub fn entry(&self, index: usize) -> Result<&Entry> {
        self.entries.get(index).ok_or_else(|| {
            Error::decode(
                "tree",
                format!("entry index {} out of range ({} entries)", index, self.entries.len()),
            )
        })
    }

    /// Indices of file entries, in tree order.
    pub fn file_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_file())
            .map(|(i, _)| i)
    }

    /// Short human summary, e.g. "12 files, 3 dirs, 0 symlinks".
    pub fn stats(&self) -> String {
        let mut files = 0;
        let mut dirs = 0;
        let mut symlinks = 0;
        for e in &self.entries {
            match e.kind {
                EntryKind::File => files += 1,
                EntryKind::Dir => dirs += 1,
                EntryKind::Symlink { .. } => symlinks += 1,
            }
        }
        format!("{} files, {} dirs, {} symlinks", files, dirs, symlinks)
    }
}

pub(crate) fn is_ignored(name: &str) -> bool {
    IGNORED_NAMES.contains(&name)
}

#[cfg(unix)]
fn entry_mode(meta: &Metadata, _kind: &EntryKind) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(_meta: &Metadata, kind: &EntryKind) -> u32 {
    match kind {
        EntryKind::File => 0o644,
        EntryKind::Dir => 0o755,
        EntryKind::Symlink { .. } => 0o777,
    }
}

/// Describe the tree rooted at `root`.
///
/// A directory is walked recursively in file-name order without following
/// symlinks. A `.zip` archive is described by its members. Any other regular
/// file becomes a one-entry tree named after the file.
pub fn walk_tree(root: &Path) -> Result<Tree> {
    let meta = std::fs::metadata(root)
        .map_err(|e| Error::io(format!("reading metadata of {}", root.display()), e))?;

    if meta.is_file() && archive::is_archive(root) {
        return archive::walk_zip(root);
    }
    if meta.is_file() {
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::config(format!("Non-UTF8 path: {}", root.display())))?;
        return Ok(Tree::new(vec![Entry {
            path: name.to_string(),
            kind: EntryKind::File,
            mode: entry_mode(&meta, &EntryKind::File),
            size: meta.len(),
        }]));
    }

    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_str().map_or(false, is_ignored));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let message = e.to_string();
            Error::io(
                format!("walking {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, message)),
            )
        })?;

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::config(format!("Path outside root: {}", entry.path().display())))?;
        let path = relative
            .to_str()
            .ok_or_else(|| Error::config(format!("Non-UTF8 path: {}", relative.display())))?
            .replace('\\', "/");

        let meta = entry
            .metadata()
            .map_err(|e| Error::io(format!("reading metadata of {}", entry.path().display()), e.into()))?;

        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())
                .map_err(|e| Error::io(format!("reading link {}", entry.path().display()), e))?;
            EntryKind::Symlink {
                target: target.to_string_lossy().replace('\\', "/"),
            }
        } else {
            EntryKind::File
        };

        let size = if kind == EntryKind::File { meta.len() } else { 0 };
        let mode = entry_mode(&meta, &kind);

        entries.push(Entry {
            path,
            kind,
            mode,
            size,
        });
    }

    Ok(Tree::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_walk_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("b/inner/c.bin"), vec![7u8; 300]).unwrap();
        fs::write(dir.path().join(".git/HEAD"), b"ref").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();

        let tree = walk_tree(dir.path()).unwrap();
        let paths: Vec<&str> = tree.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b", "b/inner", "b/inner/c.bin"]);
        assert_eq!(tree.size, 305);
        assert_eq!(tree.entries[1].kind, EntryKind::Dir);
        assert_eq!(tree.entries[1].size, 0);
        assert_eq!(tree.file_indices().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn test_walk_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blob.bin");
        fs::write(&file, vec![1u8; 42]).unwrap();

        let tree = walk_tree(&file).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.entries[0].path, "blob.bin");
        assert_eq!(tree.size, 42);
    }

    #[test]
    fn test_walk_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = walk_tree(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_records_symlink() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link")).unwrap();

        let tree = walk_tree(dir.path()).unwrap();
        let link = tree.entries.iter().find(|e| e.path == "link").unwrap();
        assert_eq!(
            link.kind,
            EntryKind::Symlink {
                target: "real.txt".to_string()
            }
        );
        assert_eq!(tree.size, 4);
    }

    #[test]
    fn test_stats() {
        let tree = Tree::new(vec![
            Entry { path: "d".into(), kind: EntryKind::Dir, mode: 0o755, size: 0 },
            Entry { path: "d/f".into(), kind: EntryKind::File, mode: 0o644, size: 10 },
        ]);
        assert_eq!(tree.stats(), "1 files, 1 dirs, 0 symlinks");
    }
}
