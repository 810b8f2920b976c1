//! Block signatures of a tree: building, lookup and the signature file format.

use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::rolling_hash::RollingHash;
use crate::tree::Tree;
use crate::util::{self, CancelFlag, STRONG_HASH_LEN};
use crate::wire::{self, CompressionSettings};

pub const SIGNATURE_MAGIC: &[u8; 8] = b"TPSIG001";

pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Largest block size accepted when building or reading a signature.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Weak and strong checksum of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    pub weak: u32,
    pub strong: [u8; STRONG_HASH_LEN],
}

impl BlockHash {
    pub fn of(block: &[u8]) -> Self {
        Self {
            weak: RollingHash::checksum(block),
            strong: util::strong_hash(block),
        }
    }
}

/// A tree plus, for every entry, the hashes of its consecutive blocks.
/// Non-file and empty entries have no blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub tree: Tree,
    pub block_size: usize,
    pub hashes: Vec<Vec<BlockHash>>,
}

impl Signature {
    /// Number of blocks a file of `size` bytes splits into.
    pub fn block_count(block_size: usize, size: u64) -> usize {
        size.div_ceil(block_size as u64) as usize
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::decode(
                "signature",
                format!("block size {} outside 1..={}", self.block_size, MAX_BLOCK_SIZE),
            ));
        }
        if self.hashes.len() != self.tree.len() {
            return Err(Error::decode(
                "signature",
                format!("{} hash lists for {} entries", self.hashes.len(), self.tree.len()),
            ));
        }
        for (entry, hashes) in self.tree.entries.iter().zip(&self.hashes) {
            let expected = if entry.is_file() {
                Self::block_count(self.block_size, entry.size)
            } else {
                0
            };
            if hashes.len() != expected {
                return Err(Error::decode(
                    "signature",
                    format!("{}: {} blocks, expected {}", entry.path, hashes.len(), expected),
                ));
            }
        }
        Ok(())
    }
}

/// Incremental block hashing over a byte stream.
pub struct BlockHasher {
    block_size: usize,
    buf: Vec<u8>,
    blocks: Vec<BlockHash>,
}

impl BlockHasher {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            buf: Vec::with_capacity(block_size),
            blocks: Vec::new(),
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.block_size - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.block_size {
                self.blocks.push(BlockHash::of(&self.buf));
                self.buf.clear();
            }
        }
    }

    /// Blocks completed so far.
    pub fn blocks(&self) -> &[BlockHash] {
        &self.blocks
    }

    /// Hash the trailing short block, if any, and return every block.
    pub fn finish(mut self) -> Vec<BlockHash> {
        if !self.buf.is_empty() {
            self.blocks.push(BlockHash::of(&self.buf));
        }
        self.blocks
    }
}

fn hash_entry(
    pool: &dyn Pool,
    index: usize,
    block_size: usize,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<Vec<BlockHash>> {
    let entry = &pool.tree().entries[index];
    if !entry.is_file() || entry.size == 0 {
        return Ok(Vec::new());
    }

    let mut reader = pool.entry_reader(index)?;
    let mut hashes = Vec::with_capacity(Signature::block_count(block_size, entry.size));
    let mut buf = vec![0u8; block_size];
    let mut remaining = entry.size;

    while remaining > 0 {
        cancel.check()?;
        let want = (block_size as u64).min(remaining) as usize;
        reader
            .read_exact(&mut buf[..want])
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::integrity(
                    &entry.path,
                    format!("content ends before declared size {}", entry.size),
                ),
                _ => Error::io(format!("reading {}", entry.path), e),
            })?;
        hashes.push(BlockHash::of(&buf[..want]));
        remaining -= want as u64;
        progress.inc(want as u64);
    }

    Ok(hashes)
}

/// Compute the signature of every entry in `pool`.
///
/// Entries are hashed in parallel; the result is always in tree order.
pub fn compute_signature(
    pool: &dyn Pool,
    block_size: usize,
    progress: &ProgressBar,
    cancel: &CancelFlag,
) -> Result<Signature> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(Error::config(format!(
            "block size must be between 1 and {} bytes",
            MAX_BLOCK_SIZE
        )));
    }

    let hashes = (0..pool.tree().len())
        .into_par_iter()
        .map(|index| hash_entry(pool, index, block_size, progress, cancel))
        .collect::<Result<Vec<_>>>()?;

    Ok(Signature {
        tree: pool.tree().clone(),
        block_size,
        hashes,
    })
}

/// Where a block of the old tree lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub entry: usize,
    pub offset: u64,
    pub len: usize,
    strong: [u8; STRONG_HASH_LEN],
}

/// Weak checksum lookup over every block of a signature, in any entry.
/// Read-only once built.
pub struct BlockLibrary {
    block_size: usize,
    by_weak: HashMap<u32, Vec<BlockLocation>>,
}

impl BlockLibrary {
    pub fn new(sig: &Signature) -> Self {
        let total: usize = sig.hashes.iter().map(Vec::len).sum();
        let mut by_weak: HashMap<u32, Vec<BlockLocation>> = HashMap::with_capacity(total);

        for (entry_index, (entry, hashes)) in sig.tree.entries.iter().zip(&sig.hashes).enumerate() {
            for (block_index, hash) in hashes.iter().enumerate() {
                let offset = (block_index * sig.block_size) as u64;
                let len = (entry.size - offset).min(sig.block_size as u64) as usize;
                by_weak.entry(hash.weak).or_default().push(BlockLocation {
                    entry: entry_index,
                    offset,
                    len,
                    strong: hash.strong,
                });
            }
        }

        Self {
            block_size: sig.block_size,
            by_weak,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// First block whose weak hash, length and strong hash all match `window`.
    pub fn find(&self, weak: u32, window: &[u8]) -> Option<BlockLocation> {
        let candidates = self.by_weak.get(&weak)?;
        let mut strong = None;
        for candidate in candidates {
            if candidate.len != window.len() {
                continue;
            }
            let strong = strong.get_or_insert_with(|| util::strong_hash(window));
            if candidate.strong == *strong {
                return Some(*candidate);
            }
        }
        None
    }
}

/// Serialize a signature. Returns the underlying writer.
pub fn write_signature<W: Write>(
    w: W,
    sig: &Signature,
    compression: CompressionSettings,
) -> Result<W> {
    let mut body = wire::start_body(w, SIGNATURE_MAGIC, compression)?;
    wire::write_record(&mut body, &sig.tree, "signature tree")?;
    wire::write_record(&mut body, &(sig.block_size as u64), "signature block size")?;
    for hashes in &sig.hashes {
        wire::write_record(&mut body, hashes, "signature hashes")?;
    }
    body.finish()
}

fn read_signature_body<R: Read>(body: &mut R) -> Result<Signature> {
    let tree: Tree = wire::read_record(body, "signature tree")?;
    let block_size: u64 = wire::read_record(body, "signature block size")?;
    let mut hashes = Vec::with_capacity(tree.len());
    for _ in 0..tree.len() {
        hashes.push(wire::read_record(body, "signature hashes")?);
    }
    let sig = Signature {
        tree,
        block_size: block_size as usize,
        hashes,
    };
    sig.validate()?;
    Ok(sig)
}

/// Outcome of reading something that may or may not be a signature file.
#[derive(Debug)]
pub enum SignatureProbe {
    Signature(Signature),
    /// Empty, too short, or wrong magic: interpret the input some other way.
    NotASignature,
    /// Right magic, unusable content.
    Corrupt(Error),
}

/// Try to read a signature. I/O failures are errors; format failures are outcomes.
pub fn probe_signature<R: Read>(r: R) -> Result<SignatureProbe> {
    let (mut body, _) = match wire::open_body(r, SIGNATURE_MAGIC, "signature") {
        Ok(Some(found)) => found,
        Ok(None) => return Ok(SignatureProbe::NotASignature),
        Err(e @ Error::Decode { .. }) => return Ok(SignatureProbe::Corrupt(e)),
        Err(e) => return Err(e),
    };
    match read_signature_body(&mut body) {
        Ok(sig) => Ok(SignatureProbe::Signature(sig)),
        Err(e @ Error::Decode { .. }) => Ok(SignatureProbe::Corrupt(e)),
        Err(e) => Err(e),
    }
}

/// Probe a path; directories are never signatures.
pub fn probe_signature_path(path: &Path) -> Result<SignatureProbe> {
    let meta = std::fs::metadata(path)
        .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    if meta.is_dir() {
        return Ok(SignatureProbe::NotASignature);
    }
    let file = File::open(path).map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    probe_signature(BufReader::new(file))
}

/// Read a signature, treating anything else as a decode error.
pub fn read_signature<R: Read>(r: R) -> Result<Signature> {
    match probe_signature(r)? {
        SignatureProbe::Signature(sig) => Ok(sig),
        SignatureProbe::NotASignature => Err(Error::decode("signature", "not a signature file")),
        SignatureProbe::Corrupt(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemPool;

    fn sig_of(pool: &MemPool, block_size: usize) -> Signature {
        compute_signature(pool, block_size, &ProgressBar::hidden(), &CancelFlag::new()).unwrap()
    }

    #[test]
    fn test_block_hasher_matches_chunks() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut hasher = BlockHasher::new(64);
        for piece in data.chunks(7) {
            hasher.update(piece);
        }
        let blocks = hasher.finish();
        let expected: Vec<BlockHash> = data.chunks(64).map(BlockHash::of).collect();
        assert_eq!(blocks, expected);
        assert_eq!(blocks.len(), 16);
    }

    #[test]
    fn test_signature_block_layout() {
        let pool = MemPool::from_files(&[
            ("a", vec![1u8; 100]),
            ("empty", vec![]),
            ("b", vec![2u8; 64]),
        ]);
        let sig = sig_of(&pool, 32);
        assert_eq!(sig.hashes[0].len(), 4);
        assert!(sig.hashes[1].is_empty());
        assert_eq!(sig.hashes[2].len(), 2);
        assert_eq!(sig.hashes[0][3], BlockHash::of(&[1u8; 4]));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let pool = MemPool::from_files(&[("x", (0..5000u32).map(|i| i as u8).collect::<Vec<_>>())]);
        assert_eq!(sig_of(&pool, 128), sig_of(&pool, 128));
    }

    #[test]
    fn test_library_finds_short_tail_block() {
        let pool = MemPool::from_files(&[("a", b"0123456789".to_vec())]);
        let sig = sig_of(&pool, 4);
        let lib = BlockLibrary::new(&sig);

        let tail = b"89";
        let found = lib.find(RollingHash::checksum(tail), tail).unwrap();
        assert_eq!((found.entry, found.offset, found.len), (0, 8, 2));

        let mid = b"4567";
        let found = lib.find(RollingHash::checksum(mid), mid).unwrap();
        assert_eq!((found.entry, found.offset, found.len), (0, 4, 4));

        let unaligned = b"3456";
        assert!(lib.find(RollingHash::checksum(unaligned), unaligned).is_none());
    }

    #[test]
    fn test_codec_and_detection() {
        let pool = MemPool::from_files(&[("a", vec![9u8; 300]), ("b", vec![])]);
        let sig = sig_of(&pool, 128);

        for compression in [CompressionSettings::none(), CompressionSettings::default()] {
            let bytes = write_signature(Vec::new(), &sig, compression).unwrap();
            assert_eq!(read_signature(&bytes[..]).unwrap(), sig);
        }
    }

    #[test]
    fn test_signature_detection_outcomes() {
        assert!(matches!(probe_signature(&b""[..]).unwrap(), SignatureProbe::NotASignature));
        assert!(matches!(
            probe_signature(&b"just some file content"[..]).unwrap(),
            SignatureProbe::NotASignature
        ));

        let pool = MemPool::from_files(&[("a", vec![9u8; 300])]);
        let bytes = write_signature(Vec::new(), &sig_of(&pool, 128), CompressionSettings::none()).unwrap();
        let truncated = &bytes[..bytes.len() - 5];
        assert!(matches!(probe_signature(truncated).unwrap(), SignatureProbe::Corrupt(_)));
    }

    #[test]
    fn test_truncated_zstd_signature_is_corrupt() {
        let data: Vec<u8> = (0..4000u32).map(|i| (i.wrapping_mul(2654435761) >> 11) as u8).collect();
        let pool = MemPool::from_files(&[("a", data)]);
        let bytes = write_signature(Vec::new(), &sig_of(&pool, 64), CompressionSettings::default()).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(probe_signature(truncated).unwrap(), SignatureProbe::Corrupt(_)));
    }

    #[test]
    fn test_absurd_block_size_is_corrupt() {
        let pool = MemPool::from_files(&[("a", vec![1u8; 10])]);
        let mut sig = sig_of(&pool, 16);
        sig.block_size = usize::MAX;
        sig.hashes = vec![Vec::new()];
        let bytes = write_signature(Vec::new(), &sig, CompressionSettings::none()).unwrap();
        match probe_signature(&bytes[..]).unwrap() {
            SignatureProbe::Corrupt(Error::Decode { message, .. }) => {
                assert!(message.contains("block size"), "message: {}", message)
            }
            other => panic!("expected a corrupt signature, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_block_size_is_rejected_when_building() {
        let pool = MemPool::from_files(&[("a", vec![1u8; 10])]);
        let result = compute_signature(&pool, MAX_BLOCK_SIZE + 1, &ProgressBar::hidden(), &CancelFlag::new());
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_plain_file_is_not_a_signature() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("setup.exe");
        std::fs::write(&file, b"MZ\x90\x00 definitely not a signature").unwrap();
        assert!(matches!(
            probe_signature_path(&file).unwrap(),
            SignatureProbe::NotASignature
        ));
    }

    #[test]
    fn test_directory_is_not_a_signature() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            probe_signature_path(dir.path()).unwrap(),
            SignatureProbe::NotASignature
        ));
    }

    #[test]
    fn test_cancelled_signature() {
        let pool = MemPool::from_files(&[("a", vec![1u8; 100])]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = compute_signature(&pool, 16, &ProgressBar::hidden(), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
