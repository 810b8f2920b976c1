//! Random-access content over a `Tree`.

use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::archive::{self, ZipPool};
use crate::error::{Error, Result};
use crate::tree::{Entry, EntryKind, Tree};
use crate::util;

/// Buffer size for sequential entry reads.
const READ_BUF_SIZE: usize = 256 * 1024;

/// Byte-range access to the file entries of a tree.
pub trait Pool: Send + Sync {
    fn tree(&self) -> &Tree;

    /// Fill `buf` with the bytes of entry `index` starting at `offset`.
    /// Ranges past the declared entry size are an integrity error.
    fn read_range(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Sequential reader over the whole content of entry `index`.
    fn entry_reader(&self, index: usize) -> Result<Box<dyn Read + Send + '_>>;
}

/// Check that `[offset, offset + len)` lies inside file entry `index` of `tree`.
pub fn check_range<'a>(tree: &'a Tree, index: usize, offset: u64, len: u64) -> Result<&'a Entry> {
    let entry = tree.entries.get(index).ok_or_else(|| {
        Error::integrity(
            format!("#{}", index),
            format!("entry index out of range ({} entries)", tree.len()),
        )
    })?;
    if entry.kind != EntryKind::File {
        return Err(Error::integrity(&entry.path, "range read from a non-file entry"));
    }
    let end = offset.checked_add(len);
    if end.map_or(true, |end| end > entry.size) {
        return Err(Error::integrity(
            &entry.path,
            format!(
                "range {}+{} exceeds entry size {}",
                offset, len, entry.size
            ),
        ));
    }
    Ok(entry)
}

/// Open the pool matching what `walk_tree` made of `root`: a zip archive,
/// a directory, or a single file.
pub fn open_pool(tree: Tree, root: &Path) -> Result<Box<dyn Pool>> {
    if archive::is_archive(root) {
        Ok(Box::new(ZipPool::open(tree, root)?))
    } else {
        Ok(Box::new(FsPool::open(tree, root)?))
    }
}

/// Pool backed by a directory on disk, or by a single file for one-entry trees.
pub struct FsPool {
    root: PathBuf,
    tree: Tree,
    single_file: bool,
    /// Last mapped entry; copies mostly hit the same old file in a row.
    mapped: Mutex<Option<(usize, Mmap)>>,
}

impl FsPool {
    pub fn open(tree: Tree, root: &Path) -> Result<Self> {
        let meta = std::fs::metadata(root)
            .map_err(|e| Error::io(format!("opening pool at {}", root.display()), e))?;
        Ok(Self {
            root: root.to_path_buf(),
            tree,
            single_file: meta.is_file(),
            mapped: Mutex::new(None),
        })
    }

    pub fn entry_path(&self, index: usize) -> Result<PathBuf> {
        let entry = self.tree.entry(index)?;
        if self.single_file {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(&entry.path))
        }
    }
}

impl Pool for FsPool {
    fn tree(&self) -> &Tree {
        &self.tree
    }

    fn read_range(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let entry = check_range(&self.tree, index, offset, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(());
        }

        let mut mapped = self.mapped.lock().unwrap_or_else(|p| p.into_inner());
        let (_, map) = match mapped.take() {
            Some((i, map)) if i == index => mapped.insert((i, map)),
            _ => {
                let map = util::mmap_file(&self.entry_path(index)?)?;
                mapped.insert((index, map))
            }
        };
        let start = offset as usize;
        let end = start + buf.len();
        if end > map.len() {
            return Err(Error::integrity(
                &entry.path,
                format!("file on disk is {} bytes, shorter than declared {}", map.len(), entry.size),
            ));
        }
        buf.copy_from_slice(&map[start..end]);
        Ok(())
    }

    fn entry_reader(&self, index: usize) -> Result<Box<dyn Read + Send + '_>> {
        let entry = check_range(&self.tree, index, 0, 0)?;
        let path = self.entry_path(index)?;
        let file = File::open(&path).map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
        Ok(Box::new(
            BufReader::with_capacity(READ_BUF_SIZE, file).take(entry.size),
        ))
    }
}

/// Pool holding every file in memory.
#[derive(Debug, Clone)]
pub struct MemPool {
    tree: Tree,
    data: Vec<Vec<u8>>,
}

impl MemPool {
    /// Build a flat tree of files from `(path, content)` pairs.
    pub fn from_files<P: AsRef<str>, D: AsRef<[u8]>>(files: &[(P, D)]) -> Self {
        let entries = files
            .iter()
            .map(|(path, data)| Entry {
                path: path.as_ref().to_string(),
                kind: EntryKind::File,
                mode: 0o644,
                size: data.as_ref().len() as u64,
            })
            .collect();
        let data = files.iter().map(|(_, d)| d.as_ref().to_vec()).collect();
        Self {
            tree: Tree::new(entries),
            data,
        }
    }

    /// Pair a tree with content; non-file entries get empty content.
    pub fn new(tree: Tree, data: Vec<Vec<u8>>) -> Result<Self> {
        if data.len() != tree.len() {
            return Err(Error::config(format!(
                "{} content buffers for {} entries",
                data.len(),
                tree.len()
            )));
        }
        for (entry, content) in tree.entries.iter().zip(&data) {
            if entry.is_file() && content.len() as u64 != entry.size {
                return Err(Error::config(format!(
                    "{}: {} bytes of content, {} declared",
                    entry.path,
                    content.len(),
                    entry.size
                )));
            }
        }
        Ok(Self { tree, data })
    }

    pub fn content(&self, index: usize) -> &[u8] {
        &self.data[index]
    }
}

impl Pool for MemPool {
    fn tree(&self) -> &Tree {
        &self.tree
    }

    fn read_range(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(&self.tree, index, offset, buf.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[index][start..start + buf.len()]);
        Ok(())
    }

    fn entry_reader(&self, index: usize) -> Result<Box<dyn Read + Send + '_>> {
        check_range(&self.tree, index, 0, 0)?;
        Ok(Box::new(&self.data[index][..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::walk_tree;

    #[test]
    fn test_mem_pool_read_range() {
        let pool = MemPool::from_files(&[("a", b"0123456789".as_slice())]);
        let mut buf = [0u8; 4];
        pool.read_range(0, 3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn test_read_past_end_is_integrity_error() {
        let pool = MemPool::from_files(&[("a", b"0123456789".as_slice())]);
        let mut buf = [0u8; 4];
        let err = pool.read_range(0, 8, &mut buf).unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains('a'));

        let err = pool.read_range(5, 0, &mut buf).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_fs_pool_reads_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/x.bin"), b"abcdefgh").unwrap();
        std::fs::write(dir.path().join("y.bin"), b"XYZ").unwrap();

        let tree = walk_tree(dir.path()).unwrap();
        let pool = FsPool::open(tree, dir.path()).unwrap();
        let x = pool.tree().entries.iter().position(|e| e.path == "sub/x.bin").unwrap();
        let y = pool.tree().entries.iter().position(|e| e.path == "y.bin").unwrap();

        let mut buf = [0u8; 3];
        pool.read_range(x, 2, &mut buf).unwrap();
        assert_eq!(&buf, b"cde");
        pool.read_range(y, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"XYZ");

        let mut all = Vec::new();
        pool.entry_reader(x).unwrap().read_to_end(&mut all).unwrap();
        assert_eq!(all, b"abcdefgh");

        let dir_index = pool.tree().entries.iter().position(|e| e.path == "sub").unwrap();
        assert!(pool.read_range(dir_index, 0, &mut []).unwrap_err().is_integrity());
    }

    #[test]
    fn test_fs_pool_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("one.bin");
        std::fs::write(&file, b"payload").unwrap();

        let pool = FsPool::open(walk_tree(&file).unwrap(), &file).unwrap();
        let mut buf = [0u8; 7];
        pool.read_range(0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }
}
