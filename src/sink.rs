//! Output targets for the apply engine.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::signature::{BlockHasher, Signature};
use crate::tree::{EntryKind, Tree};

const WRITE_BUF_SIZE: usize = 256 * 1024;

/// Where reconstructed entries go. Entries are written one at a time:
/// `open_entry`, any number of `write_range`, then `finish_entry`.
pub trait Sink {
    fn open_entry(&mut self, index: usize) -> Result<()>;
    fn write_range(&mut self, index: usize, offset: u64, data: &[u8]) -> Result<()>;
    fn finish_entry(&mut self, index: usize) -> Result<()>;
    /// Called once after the last entry.
    fn finalize(&mut self) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn open_entry(&mut self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn write_range(&mut self, _index: usize, _offset: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn finish_entry(&mut self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every entry in memory.
#[derive(Debug, Default)]
pub struct MemSink {
    entries: Vec<Vec<u8>>,
}

impl MemSink {
    pub fn new(tree: &Tree) -> Self {
        Self {
            entries: vec![Vec::new(); tree.len()],
        }
    }

    pub fn content(&self, index: usize) -> &[u8] {
        &self.entries[index]
    }

    pub fn into_entries(self) -> Vec<Vec<u8>> {
        self.entries
    }
}

impl Sink for MemSink {
    fn open_entry(&mut self, index: usize) -> Result<()> {
        self.entries[index].clear();
        Ok(())
    }

    fn write_range(&mut self, index: usize, offset: u64, data: &[u8]) -> Result<()> {
        let buf = &mut self.entries[index];
        let start = offset as usize;
        if buf.len() < start + data.len() {
            buf.resize(start + data.len(), 0);
        }
        buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn finish_entry(&mut self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Join a tree path onto `root`, refusing anything that would escape it.
fn safe_join(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.is_empty() {
        return Err(Error::integrity(path, "path escapes the output directory"));
    }
    Ok(root.join(relative))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(format!("setting mode of {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

struct OpenFile {
    index: usize,
    path: PathBuf,
    writer: BufWriter<File>,
    pos: u64,
}

/// Writes the tree into a directory on disk.
pub struct FsSink {
    root: PathBuf,
    tree: Tree,
    open: Option<OpenFile>,
}

impl FsSink {
    pub fn new(tree: Tree, root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| Error::io(format!("creating {}", root.display()), e))?;
        Ok(Self {
            root: root.to_path_buf(),
            tree,
            open: None,
        })
    }

    fn make_dir(&self, index: usize) -> Result<()> {
        let entry = &self.tree.entries[index];
        let path = safe_join(&self.root, &entry.path)?;
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::io(format!("creating directory {}", path.display()), e))?;
        set_mode(&path, entry.mode)
    }

    fn make_symlink(&self, index: usize, target: &str) -> Result<()> {
        let entry = &self.tree.entries[index];
        let path = safe_join(&self.root, &entry.path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating directory {}", parent.display()), e))?;
        }
        #[cfg(unix)]
        {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(format!("replacing {}", path.display()), e)),
            }
            std::os::unix::fs::symlink(target, &path)
                .map_err(|e| Error::io(format!("creating symlink {}", path.display()), e))?;
        }
        #[cfg(not(unix))]
        tracing::warn!(path = %entry.path, link_target = target, "Symlinks are not supported on this platform, skipping");
        Ok(())
    }
}

impl Sink for FsSink {
    fn open_entry(&mut self, index: usize) -> Result<()> {
        self.open = None;
        let entry = self.tree.entry(index)?;
        let path = safe_join(&self.root, &entry.path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating directory {}", parent.display()), e))?;
        }
        let file = File::create(&path)
            .map_err(|e| Error::io(format!("creating {}", path.display()), e))?;
        self.open = Some(OpenFile {
            index,
            path,
            writer: BufWriter::with_capacity(WRITE_BUF_SIZE, file),
            pos: 0,
        });
        Ok(())
    }

    fn write_range(&mut self, index: usize, offset: u64, data: &[u8]) -> Result<()> {
        let open = match self.open.as_mut() {
            Some(open) if open.index == index => open,
            _ => {
                return Err(Error::integrity(
                    &self.tree.entry(index)?.path,
                    "write to an entry that is not open",
                ))
            }
        };
        if open.pos != offset {
            open.writer
                .seek(SeekFrom::Start(offset))
                .map_err(|e| Error::io(format!("seeking in {}", open.path.display()), e))?;
        }
        open.writer
            .write_all(data)
            .map_err(|e| Error::io(format!("writing {}", open.path.display()), e))?;
        open.pos = offset + data.len() as u64;
        Ok(())
    }

    fn finish_entry(&mut self, index: usize) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        open.writer
            .flush()
            .map_err(|e| Error::io(format!("flushing {}", open.path.display()), e))?;
        drop(open.writer);
        set_mode(&open.path, self.tree.entries[index].mode)
    }

    /// Files are done; create directories (including empty ones) and symlinks.
    fn finalize(&mut self) -> Result<()> {
        for index in 0..self.tree.len() {
            match self.tree.entries[index].kind.clone() {
                EntryKind::Dir => self.make_dir(index)?,
                EntryKind::Symlink { target } => self.make_symlink(index, &target)?,
                EntryKind::File => {}
            }
        }
        Ok(())
    }
}

/// Checks every block written against an expected signature before
/// passing it on, failing at the first block that disagrees.
pub struct ValidatingSink<S: Sink> {
    inner: S,
    expected: Signature,
    current: Option<(usize, BlockHasher)>,
    checked: usize,
    written: u64,
}

impl<S: Sink> ValidatingSink<S> {
    /// `tree` is the layout being written; it must match the signature's.
    pub fn new(inner: S, expected: Signature, tree: &Tree) -> Result<Self> {
        if expected.tree.len() != tree.len() {
            return Err(Error::integrity(
                "<tree>",
                format!(
                    "signature describes {} entries, patch produces {}",
                    expected.tree.len(),
                    tree.len()
                ),
            ));
        }
        for (want, got) in expected.tree.entries.iter().zip(&tree.entries) {
            if want.path != got.path || want.kind != got.kind || want.size != got.size {
                return Err(Error::integrity(&got.path, "entry differs from the signature's tree"));
            }
        }
        Ok(Self {
            inner,
            expected,
            current: None,
            checked: 0,
            written: 0,
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn path(&self, index: usize) -> &str {
        self.expected
            .tree
            .entries
            .get(index)
            .map_or("<unknown entry>", |e| e.path.as_str())
    }

    fn check_blocks(&mut self, index: usize, blocks: &[crate::signature::BlockHash]) -> Result<()> {
        let expected = &self.expected.hashes[index];
        for (i, got) in blocks.iter().enumerate().skip(self.checked) {
            match expected.get(i) {
                Some(want) if want == got => {}
                Some(_) => {
                    return Err(Error::integrity(
                        self.path(index),
                        format!("block {} does not match the signature", i),
                    ))
                }
                None => {
                    return Err(Error::integrity(
                        self.path(index),
                        format!("more than {} blocks written", expected.len()),
                    ))
                }
            }
        }
        self.checked = blocks.len();
        Ok(())
    }
}

impl<S: Sink> Sink for ValidatingSink<S> {
    fn open_entry(&mut self, index: usize) -> Result<()> {
        self.expected.tree.entry(index)?;
        self.current = Some((index, BlockHasher::new(self.expected.block_size)));
        self.checked = 0;
        self.written = 0;
        self.inner.open_entry(index)
    }

    fn write_range(&mut self, index: usize, offset: u64, data: &[u8]) -> Result<()> {
        let Some((open, mut hasher)) = self.current.take() else {
            return Err(Error::integrity(self.path(index), "write to an entry that is not open"));
        };
        if open != index || offset != self.written {
            return Err(Error::integrity(
                self.path(index),
                format!("out-of-order write at offset {}", offset),
            ));
        }
        hasher.update(data);
        let result = self.check_blocks(index, hasher.blocks());
        self.current = Some((open, hasher));
        result?;
        self.written += data.len() as u64;
        self.inner.write_range(index, offset, data)
    }

    fn finish_entry(&mut self, index: usize) -> Result<()> {
        let Some((open, hasher)) = self.current.take() else {
            return Err(Error::integrity(self.path(index), "finishing an entry that is not open"));
        };
        if open != index {
            return Err(Error::integrity(self.path(index), "finishing the wrong entry"));
        }
        let blocks = hasher.finish();
        self.check_blocks(index, &blocks)?;
        if blocks.len() != self.expected.hashes[index].len() {
            return Err(Error::integrity(
                self.path(index),
                format!(
                    "{} blocks written, signature has {}",
                    blocks.len(),
                    self.expected.hashes[index].len()
                ),
            ));
        }
        self.inner.finish_entry(index)
    }

    fn finalize(&mut self) -> Result<()> {
        self.inner.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemPool;
    use crate::signature::compute_signature;
    use crate::util::CancelFlag;
    use indicatif::ProgressBar;

    fn expected_for(files: &[(&str, Vec<u8>)], block_size: usize) -> (Tree, Signature) {
        let pool = MemPool::from_files(files);
        let sig = compute_signature(&pool, block_size, &ProgressBar::hidden(), &CancelFlag::new()).unwrap();
        (sig.tree.clone(), sig)
    }

    #[test]
    fn test_validating_sink_accepts_correct_bytes() {
        let data: Vec<u8> = (0..100u8).collect();
        let (tree, sig) = expected_for(&[("a", data.clone())], 16);
        let mut sink = ValidatingSink::new(NullSink, sig, &tree).unwrap();
        sink.open_entry(0).unwrap();
        sink.write_range(0, 0, &data[..33]).unwrap();
        sink.write_range(0, 33, &data[33..]).unwrap();
        sink.finish_entry(0).unwrap();
        sink.finalize().unwrap();
    }

    #[test]
    fn test_validating_sink_fails_at_first_bad_block() {
        let data: Vec<u8> = (0..100u8).collect();
        let (tree, sig) = expected_for(&[("a.bin", data.clone())], 16);
        let mut sink = ValidatingSink::new(NullSink, sig, &tree).unwrap();
        let mut bad = data.clone();
        bad[20] ^= 0xFF;

        sink.open_entry(0).unwrap();
        sink.write_range(0, 0, &bad[..16]).unwrap();
        let err = sink.write_range(0, 16, &bad[16..40]).unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("a.bin"));
        assert!(err.to_string().contains("block 1"));
    }

    #[test]
    fn test_validating_sink_detects_short_output() {
        let data = vec![5u8; 40];
        let (tree, sig) = expected_for(&[("a", data.clone())], 16);
        let mut sink = ValidatingSink::new(NullSink, sig, &tree).unwrap();
        sink.open_entry(0).unwrap();
        sink.write_range(0, 0, &data[..32]).unwrap();
        assert!(sink.finish_entry(0).unwrap_err().is_integrity());
    }

    #[test]
    fn test_validating_sink_rejects_other_tree() {
        let (_, sig) = expected_for(&[("a", vec![1u8; 10])], 16);
        let (other, _) = expected_for(&[("b", vec![1u8; 10])], 16);
        assert!(ValidatingSink::new(NullSink, sig, &other).is_err());
    }

    #[test]
    fn test_fs_sink_writes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::new(vec![
            crate::tree::Entry { path: "empty_dir".into(), kind: EntryKind::Dir, mode: 0o755, size: 0 },
            crate::tree::Entry { path: "sub/file.txt".into(), kind: EntryKind::File, mode: 0o644, size: 11 },
        ]);
        let mut sink = FsSink::new(tree, dir.path()).unwrap();
        sink.open_entry(1).unwrap();
        sink.write_range(1, 0, b"hello ").unwrap();
        sink.write_range(1, 6, b"world").unwrap();
        sink.finish_entry(1).unwrap();
        sink.finalize().unwrap();

        assert_eq!(std::fs::read(dir.path().join("sub/file.txt")).unwrap(), b"hello world");
        assert!(dir.path().join("empty_dir").is_dir());
    }

    #[test]
    fn test_fs_sink_refuses_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::new(vec![crate::tree::Entry {
            path: "../outside.txt".into(),
            kind: EntryKind::File,
            mode: 0o644,
            size: 1,
        }]);
        let mut sink = FsSink::new(tree, dir.path()).unwrap();
        assert!(sink.open_entry(0).unwrap_err().is_integrity());
    }
}
