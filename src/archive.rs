//! Zip archives as trees: walking the central directory and reading entries.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Component, Path};
use std::sync::Mutex;

use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::pool::{check_range, Pool};
use crate::tree::{self, Entry, EntryKind, Tree};

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

type Archive = ZipArchive<BufReader<File>>;

/// True for a regular file with a `.zip` extension.
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("zip"))
        && path.is_file()
}

fn zip_error(context: impl Into<String>, e: ZipError) -> Error {
    match e {
        ZipError::Io(io) => Error::io(context, io),
        other => Error::decode(context, other),
    }
}

fn open_archive(path: &Path) -> Result<Archive> {
    let file = File::open(path).map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    ZipArchive::new(BufReader::new(file))
        .map_err(|e| zip_error(format!("reading archive {}", path.display()), e))
}

/// Slash-separated relative path of an archive member, or `None` for
/// names that would escape the archive root or are empty.
fn member_path(name: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn is_ignored_path(path: &str) -> bool {
    path.split('/').any(tree::is_ignored)
}

/// Describe the members of a zip archive as a tree.
///
/// Directories missing from the central directory are implied by the files
/// inside them. Entries are ordered the way a directory walk orders them.
pub fn walk_zip(path: &Path) -> Result<Tree> {
    let mut archive = open_archive(path)?;
    let mut members: BTreeMap<String, Entry> = BTreeMap::new();

    for i in 0..archive.len() {
        let file = archive
            .by_index_raw(i)
            .map_err(|e| zip_error(format!("reading member #{} of {}", i, path.display()), e))?;
        let name = member_path(file.name()).ok_or_else(|| {
            Error::decode(
                format!("archive {}", path.display()),
                format!("unsafe member path {:?}", file.name()),
            )
        })?;
        if is_ignored_path(&name) {
            continue;
        }

        let is_dir = file.is_dir();
        let mode = file.unix_mode().map(|m| m & 0o7777).filter(|m| *m != 0);

        let mut parent = name.as_str();
        while let Some((head, _)) = parent.rsplit_once('/') {
            members.entry(head.to_string()).or_insert_with(|| Entry {
                path: head.to_string(),
                kind: EntryKind::Dir,
                mode: DEFAULT_DIR_MODE,
                size: 0,
            });
            parent = head;
        }

        let entry = if is_dir {
            Entry {
                path: name.clone(),
                kind: EntryKind::Dir,
                mode: mode.unwrap_or(DEFAULT_DIR_MODE),
                size: 0,
            }
        } else {
            Entry {
                path: name.clone(),
                kind: EntryKind::File,
                mode: mode.unwrap_or(DEFAULT_FILE_MODE),
                size: file.size(),
            }
        };
        members.insert(name, entry);
    }

    let mut entries: Vec<Entry> = members.into_values().collect();
    entries.sort_by(|a, b| a.path.split('/').cmp(b.path.split('/')));
    Ok(Tree::new(entries))
}

/// Pool over the members of a zip archive.
///
/// Members are decompressed whole; the last one read by `read_range` is kept.
pub struct ZipPool {
    tree: Tree,
    archive: Mutex<Archive>,
    /// Archive index of every file entry of `tree`.
    members: Vec<Option<usize>>,
    cached: Mutex<Option<(usize, Vec<u8>)>>,
}

impl ZipPool {
    pub fn open(tree: Tree, path: &Path) -> Result<Self> {
        let mut archive = open_archive(path)?;
        let mut by_name = HashMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive
                .by_index_raw(i)
                .map_err(|e| zip_error(format!("reading member #{} of {}", i, path.display()), e))?;
            if let Some(name) = member_path(file.name()) {
                by_name.insert(name, i);
            }
        }

        let mut members = Vec::with_capacity(tree.len());
        for entry in &tree.entries {
            if !entry.is_file() {
                members.push(None);
                continue;
            }
            let index = by_name
                .get(&entry.path)
                .copied()
                .ok_or_else(|| Error::integrity(&entry.path, "missing from the archive"))?;
            members.push(Some(index));
        }

        Ok(Self {
            tree,
            archive: Mutex::new(archive),
            members,
            cached: Mutex::new(None),
        })
    }

    fn decompress(&self, index: usize) -> Result<Vec<u8>> {
        let entry = check_range(&self.tree, index, 0, 0)?;
        let member = self.members[index]
            .ok_or_else(|| Error::integrity(&entry.path, "missing from the archive"))?;

        let mut archive = self.archive.lock().unwrap_or_else(|p| p.into_inner());
        let file = archive
            .by_index(member)
            .map_err(|e| zip_error(format!("opening {} in archive", entry.path), e))?;
        let mut data = Vec::with_capacity(entry.size as usize);
        file.take(entry.size + 1)
            .read_to_end(&mut data)
            .map_err(|e| Error::io(format!("decompressing {}", entry.path), e))?;
        if data.len() as u64 != entry.size {
            return Err(Error::integrity(
                &entry.path,
                format!("archive member is {} bytes, declared {}", data.len(), entry.size),
            ));
        }
        Ok(data)
    }
}

impl Pool for ZipPool {
    fn tree(&self) -> &Tree {
        &self.tree
    }

    fn read_range(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(&self.tree, index, offset, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(());
        }

        let mut cached = self.cached.lock().unwrap_or_else(|p| p.into_inner());
        let (_, data) = match cached.take() {
            Some((i, data)) if i == index => cached.insert((i, data)),
            _ => {
                let data = self.decompress(index)?;
                cached.insert((index, data))
            }
        };
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn entry_reader(&self, index: usize) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(self.decompress(index)?)))
    }
}
