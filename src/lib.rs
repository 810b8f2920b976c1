//! treepatch: signature-based binary diffing for directory trees.
//!
//! A tree is hashed into a [`Signature`] of per-block weak and strong
//! checksums. Diffing a new tree against an old signature produces a patch
//! of `Copy`/`Fresh` ops plus the new tree's signature; applying the patch to
//! the old tree rebuilds the new one, optionally validating every block
//! against that signature without writing anything.

pub mod apply;
pub mod archive;
pub mod binary_diff;
pub mod binary_patch;
pub mod create;
pub mod error;
pub mod patch_format;
pub mod pool;
pub mod rolling_hash;
pub mod signature;
pub mod sink;
pub mod tree;
pub mod util;
pub mod wire;

pub use binary_diff::{compute_diff, diff_into, DiffOptions, DiffStats};
pub use binary_patch::{apply_patch, ApplyOptions, ApplyStats};
pub use error::{Error, Result};
pub use patch_format::{Patch, PatchOp, PatchReader, PatchWriter};
pub use pool::{open_pool, FsPool, MemPool, Pool};
pub use signature::{compute_signature, Signature, SignatureProbe, DEFAULT_BLOCK_SIZE};
pub use sink::{FsSink, MemSink, NullSink, Sink, ValidatingSink};
pub use tree::{walk_tree, Entry, EntryKind, Tree};
pub use wire::{CompressionAlgorithm, CompressionSettings};
