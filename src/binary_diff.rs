use indicatif::ProgressBar;
use std::io::Read;

use crate::error::{Error, Result};
use crate::patch_format::{Patch, PatchBuilder, PatchOp, PatchSink};
use crate::pool::Pool;
use crate::rolling_hash::RollingHash;
use crate::signature::{BlockHash, BlockHasher, BlockLibrary, Signature};
use crate::tree::Entry;
use crate::util::CancelFlag;
use crate::wire::CompressionSettings;

/// Largest literal run emitted as a single `Fresh` op.
pub const MAX_FRESH_LEN: usize = 4 * 1024 * 1024;

/// Smallest read issued against the new pool while scanning.
const MIN_READ_CHUNK: usize = 256 * 1024;

pub struct DiffOptions {
    pub max_fresh_len: usize,
    pub progress: ProgressBar,
    pub cancel: CancelFlag,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            max_fresh_len: MAX_FRESH_LEN,
            progress: ProgressBar::hidden(),
            cancel: CancelFlag::new(),
        }
    }
}

/// Byte accounting of one diff. `reused_bytes + fresh_bytes` always equals
/// the size of the new tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffStats {
    pub reused_bytes: u64,
    pub fresh_bytes: u64,
}

impl DiffStats {
    pub fn reused_percent(&self) -> f64 {
        let total = self.reused_bytes + self.fresh_bytes;
        if total == 0 {
            return 100.0;
        }
        100.0 * self.reused_bytes as f64 / total as f64
    }
}

/// Buffered view of one new entry, positioned at the start of the scan window.
struct ScanBuffer<'r> {
    reader: Box<dyn Read + Send + 'r>,
    buf: Vec<u8>,
    head: usize,
    unread: u64,
    chunk: usize,
}

impl<'r> ScanBuffer<'r> {
    fn new(reader: Box<dyn Read + Send + 'r>, size: u64, block_size: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            head: 0,
            unread: size,
            chunk: block_size.max(MIN_READ_CHUNK),
        }
    }

    /// Make at least `n` bytes available from the window start.
    /// `n` never exceeds what is left of the entry.
    fn fill(&mut self, n: usize, entry: &Entry) -> Result<()> {
        if self.buf.len() - self.head >= n {
            return Ok(());
        }
        self.buf.drain(..self.head);
        self.head = 0;

        while self.buf.len() < n {
            let want = (self.chunk.max(n - self.buf.len()) as u64).min(self.unread) as usize;
            if want == 0 {
                return Err(Error::integrity(&entry.path, "scan window ran past the declared size"));
            }
            let start = self.buf.len();
            self.buf.resize(start + want, 0);
            self.reader
                .read_exact(&mut self.buf[start..])
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => Error::integrity(
                        &entry.path,
                        format!("content ends before declared size {}", entry.size),
                    ),
                    _ => Error::io(format!("reading {}", entry.path), e),
                })?;
            self.unread -= want as u64;
        }
        Ok(())
    }

    fn window(&self, len: usize) -> &[u8] {
        &self.buf[self.head..self.head + len]
    }

    fn advance(&mut self, n: usize) {
        self.head += n;
    }
}

/// Turns matches and literal bytes into ops: coalesces contiguous copies
/// and batches literals up to `max_fresh_len`.
struct OpEmitter<'s> {
    sink: &'s mut dyn PatchSink,
    pending_copy: Option<(usize, u64, u64)>,
    fresh: Vec<u8>,
    max_fresh_len: usize,
}

impl<'s> OpEmitter<'s> {
    fn copy(&mut self, entry: usize, offset: u64, length: u64) -> Result<()> {
        self.flush_fresh()?;
        if let Some((e, o, l)) = self.pending_copy.as_mut() {
            if *e == entry && *o + *l == offset {
                *l += length;
                return Ok(());
            }
        }
        self.flush_copy()?;
        self.pending_copy = Some((entry, offset, length));
        Ok(())
    }

    fn fresh_byte(&mut self, byte: u8) -> Result<()> {
        self.flush_copy()?;
        self.fresh.push(byte);
        if self.fresh.len() >= self.max_fresh_len {
            self.flush_fresh()?;
        }
        Ok(())
    }

    fn flush_copy(&mut self) -> Result<()> {
        if let Some((entry, offset, length)) = self.pending_copy.take() {
            self.sink.write_op(PatchOp::Copy {
                entry,
                offset,
                length,
            })?;
        }
        Ok(())
    }

    fn flush_fresh(&mut self) -> Result<()> {
        if !self.fresh.is_empty() {
            let data = std::mem::take(&mut self.fresh);
            self.sink.write_op(PatchOp::Fresh { data })?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_copy()?;
        self.flush_fresh()
    }
}

/// Scan one new entry against the old blocks, emitting ops and hashing the
/// entry's own blocks in the same pass.
fn diff_entry(
    pool: &dyn Pool,
    index: usize,
    library: &BlockLibrary,
    sink: &mut dyn PatchSink,
    options: &DiffOptions,
    stats: &mut DiffStats,
) -> Result<Vec<BlockHash>> {
    let entry = &pool.tree().entries[index];
    let size = entry.size;
    let block_size = library.block_size();
    let mut hasher = BlockHasher::new(block_size);

    sink.begin_entry(index)?;
    if size == 0 {
        sink.end_entry()?;
        return Ok(hasher.finish());
    }

    let mut scan = ScanBuffer::new(pool.entry_reader(index)?, size, block_size);
    let mut emitter = OpEmitter {
        sink: &mut *sink,
        pending_copy: None,
        fresh: Vec::new(),
        max_fresh_len: options.max_fresh_len,
    };

    let mut rolling = RollingHash::new();
    let mut needs_init = true;
    let mut pos: u64 = 0;
    let mut unreported: u64 = 0;

    while pos < size {
        let wlen = (size - pos).min(block_size as u64) as usize;
        if needs_init {
            scan.fill(wlen, entry)?;
            rolling.init(scan.window(wlen));
            needs_init = false;
        }

        if let Some(found) = library.find(rolling.digest(), scan.window(wlen)) {
            emitter.copy(found.entry, found.offset, wlen as u64)?;
            hasher.update(scan.window(wlen));
            scan.advance(wlen);
            pos += wlen as u64;
            stats.reused_bytes += wlen as u64;
            unreported += wlen as u64;
            needs_init = true;
        } else {
            let out = scan.window(1)[0];
            emitter.fresh_byte(out)?;
            hasher.update(&[out]);

            if pos + (wlen as u64) < size {
                scan.fill(wlen + 1, entry)?;
                let incoming = scan.window(wlen + 1)[wlen];
                rolling.rotate(out, incoming);
            } else {
                rolling.roll_out(out);
            }
            scan.advance(1);
            pos += 1;
            stats.fresh_bytes += 1;
            unreported += 1;
        }

        if unreported >= block_size as u64 {
            options.progress.inc(unreported);
            unreported = 0;
            options.cancel.check()?;
        }
    }

    options.progress.inc(unreported);
    emitter.flush()?;
    sink.end_entry()?;
    Ok(hasher.finish())
}

/// Diff the tree in `new_pool` against `old`, streaming ops into `sink`.
///
/// Returns the signature of the new tree, computed from the same pass,
/// and the reused/fresh byte accounting.
pub fn diff_into(
    old: &Signature,
    new_pool: &dyn Pool,
    sink: &mut dyn PatchSink,
    options: &DiffOptions,
) -> Result<(Signature, DiffStats)> {
    if options.max_fresh_len == 0 {
        return Err(Error::config("maximum fresh op length must be positive"));
    }

    let library = BlockLibrary::new(old);
    let tree = new_pool.tree();
    let mut stats = DiffStats::default();
    let mut hashes = Vec::with_capacity(tree.len());

    tracing::debug!(
        old_entries = old.tree.len(),
        new_entries = tree.len(),
        block_size = old.block_size,
        "Starting diff"
    );

    for (index, entry) in tree.entries.iter().enumerate() {
        options.cancel.check()?;
        if !entry.is_file() {
            hashes.push(Vec::new());
            continue;
        }
        let before = stats;
        hashes.push(diff_entry(new_pool, index, &library, sink, options, &mut stats)?);
        tracing::debug!(
            path = %entry.path,
            reused = stats.reused_bytes - before.reused_bytes,
            fresh = stats.fresh_bytes - before.fresh_bytes,
            "Diffed entry"
        );
    }

    let signature = Signature {
        tree: tree.clone(),
        block_size: old.block_size,
        hashes,
    };
    Ok((signature, stats))
}

/// Diff into an in-memory patch.
pub fn compute_diff(
    old: &Signature,
    new_pool: &dyn Pool,
    compression: CompressionSettings,
    options: &DiffOptions,
) -> Result<(Patch, Signature, DiffStats)> {
    let mut builder = PatchBuilder::new(new_pool.tree().clone(), compression);
    let (signature, stats) = diff_into(old, new_pool, &mut builder, options)?;
    Ok((builder.finish(), signature, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemPool;
    use crate::signature::compute_signature;

    const BS: usize = 64;

    fn signature(pool: &MemPool) -> Signature {
        compute_signature(pool, BS, &ProgressBar::hidden(), &CancelFlag::new()).unwrap()
    }

    fn diff(old: &MemPool, new: &MemPool) -> (Patch, Signature, DiffStats) {
        compute_diff(
            &signature(old),
            new,
            CompressionSettings::none(),
            &DiffOptions::default(),
        )
        .unwrap()
    }

    fn replay(old: &MemPool, ops: &[PatchOp]) -> Vec<u8> {
        let mut out = Vec::new();
        for op in ops {
            match op {
                PatchOp::Copy { entry, offset, length } => {
                    let start = *offset as usize;
                    out.extend_from_slice(&old.content(*entry)[start..start + *length as usize]);
                }
                PatchOp::Fresh { data } => out.extend_from_slice(data),
            }
        }
        out
    }

    fn pattern(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed.wrapping_mul(2654435761).wrapping_add(1);
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn test_identical_data() {
        let data = pattern(BS * 3 + 10, 1);
        let old = MemPool::from_files(&[("f", data.clone())]);
        let (patch, _, stats) = diff(&old, &old);
        assert_eq!(stats.reused_bytes, data.len() as u64);
        assert_eq!(stats.fresh_bytes, 0);
        assert_eq!(
            patch.entries[0],
            vec![PatchOp::Copy { entry: 0, offset: 0, length: data.len() as u64 }]
        );
    }

    #[test]
    fn test_completely_different() {
        let old = MemPool::from_files(&[("f", pattern(BS * 2, 1))]);
        let new = MemPool::from_files(&[("f", pattern(BS * 2, 2))]);
        let (patch, _, stats) = diff(&old, &new);
        assert_eq!(stats.reused_bytes, 0);
        assert_eq!(stats.fresh_bytes, (BS * 2) as u64);
        assert_eq!(replay(&old, &patch.entries[0]), new.content(0));
    }

    #[test]
    fn test_prefix_changed() {
        let old_data = pattern(BS * 4, 3);
        let mut new_data = old_data.clone();
        for b in new_data[..BS].iter_mut() {
            *b = !*b;
        }
        let old = MemPool::from_files(&[("f", old_data)]);
        let new = MemPool::from_files(&[("f", new_data.clone())]);

        let (patch, _, stats) = diff(&old, &new);
        assert_eq!(replay(&old, &patch.entries[0]), new_data);
        assert_eq!(stats.reused_bytes, (BS * 3) as u64);
        assert_eq!(stats.fresh_bytes, BS as u64);
    }

    #[test]
    fn test_insertion_in_middle_matches_unaligned() {
        let old_data = pattern(BS * 4, 4);
        let mut new_data = old_data.clone();
        new_data.splice(BS * 2 + 7..BS * 2 + 7, vec![0xAA; 13]);
        let old = MemPool::from_files(&[("f", old_data)]);
        let new = MemPool::from_files(&[("f", new_data.clone())]);

        let (patch, _, stats) = diff(&old, &new);
        assert_eq!(replay(&old, &patch.entries[0]), new_data);
        assert_eq!(stats.reused_bytes + stats.fresh_bytes, new_data.len() as u64);
        assert!(stats.reused_bytes >= (BS * 3) as u64);
    }

    #[test]
    fn test_renamed_file_reuses_content() {
        let data = pattern(BS * 5 + 3, 5);
        let old = MemPool::from_files(&[("old/name.bin", data.clone())]);
        let new = MemPool::from_files(&[("other.txt", b"hi".to_vec()), ("new/name.bin", data.clone())]);

        let (patch, _, stats) = diff(&old, &new);
        assert_eq!(stats.reused_bytes, data.len() as u64);
        assert_eq!(stats.fresh_bytes, 2);
        assert_eq!(
            patch.entries[1],
            vec![PatchOp::Copy { entry: 0, offset: 0, length: data.len() as u64 }]
        );
    }

    #[test]
    fn test_empty_entries() {
        let old = MemPool::from_files(&[("f", pattern(100, 6))]);
        let new = MemPool::from_files(&[("f", Vec::new())]);
        let (patch, sig, stats) = diff(&old, &new);
        assert!(patch.entries[0].is_empty());
        assert!(sig.hashes[0].is_empty());
        assert_eq!(stats, DiffStats::default());
    }

    #[test]
    fn test_short_files() {
        let old = MemPool::from_files(&[("f", b"Hello, World!".to_vec())]);
        let new = MemPool::from_files(&[("f", b"Hello, Rust!".to_vec())]);
        let (patch, _, stats) = diff(&old, &new);
        assert_eq!(replay(&old, &patch.entries[0]), b"Hello, Rust!");
        assert_eq!(stats.fresh_bytes, 12);
    }

    #[test]
    fn test_new_signature_matches_fresh_computation() {
        let old = MemPool::from_files(&[("a", pattern(BS * 3, 7))]);
        let mut changed = pattern(BS * 3, 7);
        changed.extend_from_slice(&pattern(BS + 5, 8));
        let new = MemPool::from_files(&[("a", changed), ("b", pattern(BS / 2, 9))]);

        let (_, sig, _) = diff(&old, &new);
        assert_eq!(sig, signature(&new));
    }

    #[test]
    fn test_fresh_runs_are_capped() {
        let old = MemPool::from_files(&[("f", Vec::new())]);
        let new = MemPool::from_files(&[("f", pattern(1000, 10))]);
        let options = DiffOptions {
            max_fresh_len: 300,
            ..DiffOptions::default()
        };
        let (patch, _, _) =
            compute_diff(&signature(&old), &new, CompressionSettings::none(), &options).unwrap();
        let lens: Vec<u64> = patch.entries[0].iter().map(PatchOp::output_len).collect();
        assert_eq!(lens, vec![300, 300, 300, 100]);
    }

    #[test]
    fn test_cancelled_diff() {
        let old = MemPool::from_files(&[("f", pattern(100, 11))]);
        let options = DiffOptions::default();
        options.cancel.cancel();
        let err = compute_diff(&signature(&old), &old, CompressionSettings::none(), &options).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
