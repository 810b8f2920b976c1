use indicatif::ProgressBar;
use std::io::Read;

use crate::error::{Error, Result};
use crate::patch_format::{PatchOp, PatchReader};
use crate::pool::{self, Pool};
use crate::sink::Sink;
use crate::util::CancelFlag;

/// Buffer size for replaying `Copy` ops.
const COPY_BUF_SIZE: usize = 1024 * 1024;

pub struct ApplyOptions {
    pub progress: ProgressBar,
    pub cancel: CancelFlag,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            progress: ProgressBar::hidden(),
            cancel: CancelFlag::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub files: usize,
    pub copied_bytes: u64,
    pub fresh_bytes: u64,
}

/// Reconstruct the new tree described by `patch` from `old` into `sink`.
///
/// Every file entry is replayed in order and must come out at exactly its
/// declared size. `Copy` ops outside the old entry's bounds abort the apply.
/// Output already written is left in place on failure.
pub fn apply_patch<R: Read>(
    patch: &mut PatchReader<R>,
    old: &dyn Pool,
    sink: &mut dyn Sink,
    options: &ApplyOptions,
) -> Result<ApplyStats> {
    let tree = patch.tree().clone();
    let mut stats = ApplyStats::default();
    let mut buf = Vec::new();

    while let Some(index) = patch.next_entry()? {
        options.cancel.check()?;
        let entry = &tree.entries[index];
        sink.open_entry(index)?;

        let mut written: u64 = 0;
        while let Some(op) = patch.next_op()? {
            let len = op.output_len();
            if written.checked_add(len).map_or(true, |end| end > entry.size) {
                return Err(Error::integrity(
                    &entry.path,
                    format!("ops produce more than the declared {} bytes", entry.size),
                ));
            }

            match op {
                PatchOp::Copy {
                    entry: source,
                    offset,
                    length,
                } => {
                    pool::check_range(old.tree(), source, offset, length).map_err(|e| {
                        Error::integrity(&entry.path, format!("invalid copy from old tree: {}", e))
                    })?;
                    let mut done = 0u64;
                    while done < length {
                        let n = (length - done).min(COPY_BUF_SIZE as u64) as usize;
                        buf.resize(n, 0);
                        old.read_range(source, offset + done, &mut buf[..n])?;
                        sink.write_range(index, written + done, &buf[..n])?;
                        done += n as u64;
                    }
                    stats.copied_bytes += length;
                }
                PatchOp::Fresh { data } => {
                    sink.write_range(index, written, &data)?;
                    stats.fresh_bytes += len;
                }
            }

            written += len;
            options.progress.inc(len);
            options.cancel.check()?;
        }

        if written != entry.size {
            return Err(Error::integrity(
                &entry.path,
                format!("reconstructed {} bytes, declared {}", written, entry.size),
            ));
        }
        sink.finish_entry(index)?;
        stats.files += 1;
        tracing::debug!(path = %entry.path, size = entry.size, "Applied entry");
    }

    sink.finalize()?;
    Ok(stats)
}
