use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::binary_diff::{self, DiffOptions, DiffStats, MAX_FRESH_LEN};
use crate::binary_patch::{self, ApplyOptions};
use crate::patch_format::{PatchReader, PatchWriter};
use crate::pool::{self, Pool};
use crate::signature::{self, Signature, SignatureProbe};
use crate::sink::{NullSink, ValidatingSink};
use crate::tree::{self, Tree};
use crate::util::{self, CancelFlag, CountingWriter};
use crate::wire::CompressionSettings;
use crate::Error;

/// Everything the `diff` command needs.
#[derive(Debug, Clone)]
pub struct DiffParams {
    /// Old tree, or a signature file computed from it.
    pub old: PathBuf,
    pub new: PathBuf,
    /// Patch output; the new signature goes to `<patch>.sig`.
    pub patch: PathBuf,
    pub compression: CompressionSettings,
    /// Block size when the old signature has to be computed.
    pub block_size: usize,
    pub verify: bool,
    pub show_progress: bool,
    pub cancel: CancelFlag,
}

/// How the old side was obtained and how fast it was hashed.
pub enum OldSource {
    SignatureFile,
    Hashed { elapsed: Duration },
}

pub struct DiffSummary {
    pub old_tree: Tree,
    pub old_source: OldSource,
    pub new_tree: Tree,
    pub stats: DiffStats,
    pub patch_size: u64,
    pub signature_path: PathBuf,
    pub signature_size: u64,
    pub diff_elapsed: Duration,
    pub verified: bool,
}

pub struct SignSummary {
    pub tree: Tree,
    pub signature_size: u64,
}

/// Path of the signature written next to a patch.
pub fn signature_path_for(patch: &Path) -> PathBuf {
    let mut s = patch.as_os_str().to_owned();
    s.push(".sig");
    PathBuf::from(s)
}

fn require_path(path: &Path, what: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::config(format!("diff: must specify {}", what)).into());
    }
    Ok(())
}

fn hash_tree(
    tree: Tree,
    root: &Path,
    block_size: usize,
    show_progress: bool,
    cancel: &CancelFlag,
) -> crate::Result<Signature> {
    let pool: Box<dyn Pool> = pool::open_pool(tree, root)?;
    let progress = util::byte_progress(pool.tree().size, "hashing", show_progress);
    let sig = signature::compute_signature(&*pool, block_size, &progress, cancel);
    progress.finish_and_clear();
    sig
}

/// Diff `params.new` against `params.old`, writing the patch and the new
/// tree's signature, and optionally replaying the patch to check it.
pub async fn create_patch(params: &DiffParams) -> Result<DiffSummary> {
    require_path(&params.old, "old")?;
    require_path(&params.new, "new")?;
    require_path(&params.patch, "patch")?;

    // Stage 1: is the old side a signature file or a tree?
    let old_path = params.old.clone();
    let probe = tokio::task::spawn_blocking(move || signature::probe_signature_path(&old_path))
        .await?
        .context("opening old")?;

    let old_signature = match probe {
        SignatureProbe::Signature(sig) => {
            tracing::info!(path = %params.old.display(), "Read signature");
            Some(sig)
        }
        SignatureProbe::NotASignature => None,
        SignatureProbe::Corrupt(e) => {
            return Err(e).context("determining if old is a signature or a tree");
        }
    };

    if params.verify && old_signature.is_some() {
        return Err(Error::config(
            "--verify replays the patch against old content and needs a tree, not a signature",
        )
        .into());
    }

    // Stage 2: walk the trees concurrently.
    let new_path = params.new.clone();
    let old_path = params.old.clone();
    let needs_old_walk = old_signature.is_none();
    let (old_tree, new_tree) = tokio::try_join!(
        tokio::task::spawn_blocking(move || -> Result<Option<Tree>> {
            if !needs_old_walk {
                return Ok(None);
            }
            Ok(Some(tree::walk_tree(&old_path).context("walking old as a tree")?))
        }),
        tokio::task::spawn_blocking(move || tree::walk_tree(&new_path).context("walking new as a tree")),
    )?;
    let old_tree = old_tree?;
    let new_tree = new_tree?;

    // Stage 3: hash the old tree unless we were handed its signature.
    let (old_signature, old_source) = match (old_signature, old_tree) {
        (Some(sig), _) => (sig, OldSource::SignatureFile),
        (None, Some(tree)) => {
            tracing::info!(path = %params.old.display(), "Hashing old tree");
            let start = Instant::now();
            let root = params.old.clone();
            let block_size = params.block_size;
            let show_progress = params.show_progress;
            let cancel = params.cancel.clone();
            let sig = tokio::task::spawn_blocking(move || {
                hash_tree(tree, &root, block_size, show_progress, &cancel)
            })
            .await?
            .context("computing old signature")?;
            (sig, OldSource::Hashed { elapsed: start.elapsed() })
        }
        (None, None) => bail!("old tree was neither read nor walked"),
    };

    // Stage 4: diff, streaming the patch and then the new signature to disk.
    let old_tree = old_signature.tree.clone();
    tracing::info!(path = %params.new.display(), "Diffing new tree");
    let start = Instant::now();
    let signature_path = signature_path_for(&params.patch);
    let job = params.clone();
    let sig_path = signature_path.clone();
    let reported_tree = new_tree.clone();
    let (stats, patch_size, signature_size) = tokio::task::spawn_blocking(move || -> Result<(DiffStats, u64, u64)> {
        let pool = pool::open_pool(new_tree, &job.new).context("opening new tree")?;

        let patch_file = File::create(&job.patch)
            .with_context(|| format!("creating patch file {}", job.patch.display()))?;
        let sig_file = File::create(&sig_path)
            .with_context(|| format!("creating signature file {}", sig_path.display()))?;

        let progress = util::byte_progress(pool.tree().size, "diffing", job.show_progress);
        let options = DiffOptions {
            max_fresh_len: MAX_FRESH_LEN,
            progress: progress.clone(),
            cancel: job.cancel.clone(),
        };

        let mut writer = PatchWriter::new(
            CountingWriter::new(BufWriter::new(patch_file)),
            pool.tree(),
            job.compression,
        )
        .context("writing patch header")?;
        let (new_signature, stats) = binary_diff::diff_into(&old_signature, &*pool, &mut writer, &options)
            .context("computing and writing patch")?;
        let patch_size = writer.finish().context("finishing patch file")?.count();
        progress.finish_and_clear();

        let sig_writer = signature::write_signature(
            CountingWriter::new(BufWriter::new(sig_file)),
            &new_signature,
            job.compression,
        )
        .context("writing signature file")?;

        Ok((stats, patch_size, sig_writer.count()))
    })
    .await??;
    let diff_elapsed = start.elapsed();

    let mut verified = false;
    if params.verify {
        tracing::info!("Applying patch to verify it");
        verify_patch(params, old_tree.clone(), &signature_path).await?;
        verified = true;
    }

    Ok(DiffSummary {
        old_tree,
        old_source,
        new_tree: reported_tree,
        stats,
        patch_size,
        signature_path,
        signature_size,
        diff_elapsed,
        verified,
    })
}

/// Replay the patch just written into a validating null sink, reading old
/// content through the same tree the patch was computed against.
async fn verify_patch(params: &DiffParams, old_tree: Tree, signature_path: &Path) -> Result<()> {
    let patch_path = params.patch.clone();
    let old_path = params.old.clone();
    let signature_path = signature_path.to_path_buf();
    let show_progress = params.show_progress;
    let cancel = params.cancel.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let sig_file = File::open(&signature_path).context("reading fresh signature file")?;
        let expected = signature::read_signature(BufReader::new(sig_file))
            .context("decoding fresh signature file")?;

        let patch_file = File::open(&patch_path).context("opening patch for verification")?;
        let mut reader = PatchReader::open(BufReader::new(patch_file)).context("reading patch header")?;

        let old_pool = pool::open_pool(old_tree, &old_path).context("opening old tree")?;

        let mut sink = ValidatingSink::new(NullSink, expected, reader.tree())
            .context("patch and signature disagree")?;
        let progress = util::byte_progress(reader.tree().size, "verifying", show_progress);
        let options = ApplyOptions {
            progress: progress.clone(),
            cancel,
        };
        binary_patch::apply_patch(&mut reader, &*old_pool, &mut sink, &options)
            .context("patch does not apply cleanly")?;
        progress.finish_and_clear();
        Ok(())
    })
    .await?
}

/// Compute the signature of a tree and write it to `output`.
pub async fn create_signature(
    dir: &Path,
    output: &Path,
    block_size: usize,
    compression: CompressionSettings,
    show_progress: bool,
    cancel: CancelFlag,
) -> Result<SignSummary> {
    require_path(dir, "tree")?;
    require_path(output, "output")?;

    let dir = dir.to_path_buf();
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<SignSummary> {
        let tree = tree::walk_tree(&dir).context("walking tree")?;
        let sig = hash_tree(tree, &dir, block_size, show_progress, &cancel).context("computing signature")?;

        let file = File::create(&output)
            .with_context(|| format!("creating signature file {}", output.display()))?;
        let writer = signature::write_signature(CountingWriter::new(BufWriter::new(file)), &sig, compression)
            .context("writing signature file")?;

        Ok(SignSummary {
            signature_size: writer.count(),
            tree: sig.tree,
        })
    })
    .await?
}
