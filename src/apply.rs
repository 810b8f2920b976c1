use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::binary_patch::{self, ApplyOptions, ApplyStats};
use crate::patch_format::PatchReader;
use crate::pool;
use crate::signature;
use crate::sink::{FsSink, ValidatingSink};
use crate::tree::{self, Tree};
use crate::util::{self, CancelFlag};
use crate::Error;

/// Everything the `apply` command needs.
#[derive(Debug, Clone)]
pub struct ApplyParams {
    pub patch: PathBuf,
    /// Old tree the patch was computed against.
    pub old: PathBuf,
    /// Fresh directory receiving the new tree.
    pub output: PathBuf,
    /// Signature of the new tree; when given every block is checked as it is written.
    pub signature: Option<PathBuf>,
    pub show_progress: bool,
    pub cancel: CancelFlag,
}

pub struct ApplySummary {
    pub tree: Tree,
    pub stats: ApplyStats,
    pub validated: bool,
}

fn same_location(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Reconstruct the new tree from `params.old` and a patch into `params.output`.
pub async fn apply_patch(params: &ApplyParams) -> Result<ApplySummary> {
    for (path, what) in [(&params.patch, "patch"), (&params.old, "old"), (&params.output, "output")] {
        if path.as_os_str().is_empty() {
            return Err(Error::config(format!("apply: must specify {}", what)).into());
        }
    }
    if same_location(&params.old, &params.output) {
        return Err(Error::config("apply: output directory must differ from the old tree").into());
    }

    let params = params.clone();
    tokio::task::spawn_blocking(move || -> Result<ApplySummary> {
        let patch_file = File::open(&params.patch)
            .with_context(|| format!("opening patch {}", params.patch.display()))?;
        let mut reader = PatchReader::open(BufReader::new(patch_file)).context("reading patch header")?;
        let new_tree = reader.tree().clone();
        tracing::debug!(
            entries = new_tree.len(),
            compression = ?reader.compression(),
            "Opened patch"
        );

        let old_tree = tree::walk_tree(&params.old).context("walking old as a tree")?;
        let old_pool = pool::open_pool(old_tree, &params.old).context("opening old tree")?;

        let sink = FsSink::new(new_tree.clone(), &params.output).context("creating output directory")?;
        let progress = util::byte_progress(new_tree.size, "patching", params.show_progress);
        let options = ApplyOptions {
            progress: progress.clone(),
            cancel: params.cancel.clone(),
        };

        let stats = match &params.signature {
            Some(sig_path) => {
                let sig_file = File::open(sig_path)
                    .with_context(|| format!("opening signature {}", sig_path.display()))?;
                let expected =
                    signature::read_signature(BufReader::new(sig_file)).context("reading signature")?;
                let mut sink = ValidatingSink::new(sink, expected, &new_tree)
                    .context("patch and signature disagree")?;
                binary_patch::apply_patch(&mut reader, &*old_pool, &mut sink, &options)
            }
            None => {
                let mut sink = sink;
                binary_patch::apply_patch(&mut reader, &*old_pool, &mut sink, &options)
            }
        }
        .context("applying patch")?;
        progress.finish_and_clear();

        tracing::info!(
            files = stats.files,
            copied = stats.copied_bytes,
            fresh = stats.fresh_bytes,
            "Patch applied"
        );

        Ok(ApplySummary {
            tree: new_tree,
            stats,
            validated: params.signature.is_some(),
        })
    })
    .await?
}
