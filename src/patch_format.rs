use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::tree::Tree;
use crate::wire::{self, BodyReader, BodyWriter, CompressionSettings};

pub const PATCH_MAGIC: &[u8; 8] = b"TPATCH01";

/// One reconstruction step for a file of the new tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Reuse `length` bytes of old entry `entry`, starting at `offset`.
    Copy { entry: usize, offset: u64, length: u64 },
    /// Literal bytes found nowhere in the old tree.
    Fresh { data: Vec<u8> },
}

impl PatchOp {
    /// Number of output bytes this op produces.
    pub fn output_len(&self) -> u64 {
        match self {
            PatchOp::Copy { length, .. } => *length,
            PatchOp::Fresh { data } => data.len() as u64,
        }
    }
}

/// Body records. Every file entry of the new tree, in order, is framed as
/// `Begin`, its ops, then `End`.
#[derive(Debug, Serialize, Deserialize)]
enum PatchRecord {
    Begin { entry: usize },
    Op(PatchOp),
    End,
}

/// A whole patch held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Layout of the tree the patch produces.
    pub tree: Tree,
    pub compression: CompressionSettings,
    /// Ops per entry of `tree`; empty for non-files and empty files.
    pub entries: Vec<Vec<PatchOp>>,
}

/// Destination for ops produced by the diff engine.
pub trait PatchSink {
    fn begin_entry(&mut self, index: usize) -> Result<()>;
    fn write_op(&mut self, op: PatchOp) -> Result<()>;
    fn end_entry(&mut self) -> Result<()>;
}

/// Streaming patch encoder.
pub struct PatchWriter<W: Write> {
    body: BodyWriter<W>,
}

impl<W: Write> PatchWriter<W> {
    pub fn new(w: W, tree: &Tree, compression: CompressionSettings) -> Result<Self> {
        let mut body = wire::start_body(w, PATCH_MAGIC, compression)?;
        wire::write_record(&mut body, tree, "patch tree")?;
        Ok(Self { body })
    }

    /// Finish the compressed stream and return the underlying writer.
    pub fn finish(self) -> Result<W> {
        self.body.finish()
    }
}

impl<W: Write> PatchSink for PatchWriter<W> {
    fn begin_entry(&mut self, index: usize) -> Result<()> {
        wire::write_record(&mut self.body, &PatchRecord::Begin { entry: index }, "patch entry")
    }

    fn write_op(&mut self, op: PatchOp) -> Result<()> {
        wire::write_record(&mut self.body, &PatchRecord::Op(op), "patch op")
    }

    fn end_entry(&mut self) -> Result<()> {
        wire::write_record(&mut self.body, &PatchRecord::End, "patch entry end")
    }
}

/// Collects ops into an in-memory `Patch`.
pub struct PatchBuilder {
    patch: Patch,
    current: Option<usize>,
}

impl PatchBuilder {
    pub fn new(tree: Tree, compression: CompressionSettings) -> Self {
        let entries = vec![Vec::new(); tree.len()];
        Self {
            patch: Patch {
                tree,
                compression,
                entries,
            },
            current: None,
        }
    }

    pub fn finish(self) -> Patch {
        self.patch
    }
}

impl PatchSink for PatchBuilder {
    fn begin_entry(&mut self, index: usize) -> Result<()> {
        self.patch.tree.entry(index)?;
        self.current = Some(index);
        Ok(())
    }

    fn write_op(&mut self, op: PatchOp) -> Result<()> {
        let index = self
            .current
            .ok_or_else(|| Error::decode("patch", "op outside of an entry"))?;
        self.patch.entries[index].push(op);
        Ok(())
    }

    fn end_entry(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

/// Streaming patch decoder.
///
/// Call `next_entry` to advance to the next file entry, then `next_op`
/// until it returns `None`.
pub struct PatchReader<R: Read> {
    body: BodyReader<R>,
    tree: Tree,
    compression: CompressionSettings,
    file_indices: Vec<usize>,
    next_file: usize,
    in_entry: bool,
}

impl<R: Read> PatchReader<R> {
    pub fn open(r: R) -> Result<Self> {
        let (mut body, compression) = wire::open_body(r, PATCH_MAGIC, "patch")?
            .ok_or_else(|| Error::decode("patch", "not a patch file (bad magic)"))?;
        let tree: Tree = wire::read_record(&mut body, "patch tree")?;
        let file_indices = tree.file_indices().collect();
        Ok(Self {
            body,
            tree,
            compression,
            file_indices,
            next_file: 0,
            in_entry: false,
        })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn compression(&self) -> CompressionSettings {
        self.compression
    }

    /// Advance to the next file entry, or `None` once every file was read.
    pub fn next_entry(&mut self) -> Result<Option<usize>> {
        if self.in_entry {
            return Err(Error::decode("patch", "previous entry was not fully read"));
        }
        let Some(&expected) = self.file_indices.get(self.next_file) else {
            return Ok(None);
        };
        match wire::read_record(&mut self.body, "patch entry")? {
            PatchRecord::Begin { entry } if entry == expected => {
                self.next_file += 1;
                self.in_entry = true;
                Ok(Some(entry))
            }
            PatchRecord::Begin { entry } => Err(Error::decode(
                "patch",
                format!("expected entry {}, found entry {}", expected, entry),
            )),
            other => Err(Error::decode(
                "patch",
                format!("expected entry {}, found {:?}", expected, other),
            )),
        }
    }

    /// Next op of the current entry, or `None` at its end.
    pub fn next_op(&mut self) -> Result<Option<PatchOp>> {
        if !self.in_entry {
            return Err(Error::decode("patch", "op requested outside of an entry"));
        }
        match wire::read_record(&mut self.body, "patch op")? {
            PatchRecord::Op(op) => Ok(Some(op)),
            PatchRecord::End => {
                self.in_entry = false;
                Ok(None)
            }
            PatchRecord::Begin { entry } => Err(Error::decode(
                "patch",
                format!("entry {} started before previous entry ended", entry),
            )),
        }
    }
}

/// Encode an in-memory patch.
pub fn write_patch<W: Write>(w: W, patch: &Patch) -> Result<W> {
    let mut writer = PatchWriter::new(w, &patch.tree, patch.compression)?;
    for index in patch.tree.file_indices() {
        writer.begin_entry(index)?;
        for op in &patch.entries[index] {
            writer.write_op(op.clone())?;
        }
        writer.end_entry()?;
    }
    writer.finish()
}

/// Decode a whole patch into memory.
pub fn read_patch<R: Read>(r: R) -> Result<Patch> {
    let mut reader = PatchReader::open(r)?;
    let mut entries = vec![Vec::new(); reader.tree().len()];
    while let Some(index) = reader.next_entry()? {
        while let Some(op) = reader.next_op()? {
            entries[index].push(op);
        }
    }
    Ok(Patch {
        tree: reader.tree.clone(),
        compression: reader.compression,
        entries,
    })
}
