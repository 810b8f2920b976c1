use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{HumanBytes, HumanDuration};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use treepatch::create::{self, DiffParams, OldSource};
use treepatch::util::CancelFlag;
use treepatch::{apply, CompressionAlgorithm, CompressionSettings, DEFAULT_BLOCK_SIZE};

#[derive(Parser)]
#[command(name = "treepatch", about = "Compute, verify and apply binary patches between directory trees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Hide progress bars
    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Codec {
    None,
    Zstd,
}

#[derive(Args)]
struct CompressionArgs {
    /// Compression of the patch and signature streams
    #[arg(long, value_enum, default_value_t = Codec::Zstd)]
    compression: Codec,
    /// Zstd compression level
    #[arg(long, default_value_t = treepatch::wire::DEFAULT_ZSTD_LEVEL)]
    level: i32,
}

impl CompressionArgs {
    fn settings(&self) -> CompressionSettings {
        match self.compression {
            Codec::None => CompressionSettings::none(),
            Codec::Zstd => CompressionSettings {
                algorithm: CompressionAlgorithm::Zstd,
                level: self.level,
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the difference between two trees. Writes the patch, and the
    /// new tree's signature next to it with `.sig` appended
    Diff {
        /// Directory or file with the older content, or a signature of it
        old: PathBuf,
        /// Directory or file with the newer content
        new: PathBuf,
        /// Where to write the patch
        #[arg(default_value = "patch.pwr")]
        patch: PathBuf,
        /// Make sure the patch applies cleanly by replaying it (slower)
        #[arg(long)]
        verify: bool,
        /// Block size used when hashing the old tree
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
        #[command(flatten)]
        compression: CompressionArgs,
    },
    /// Rebuild the new tree from the old tree and a patch
    Apply {
        /// Patch file
        patch: PathBuf,
        /// Old tree the patch was computed against
        old: PathBuf,
        /// Output directory for the new tree
        #[arg(long)]
        dir: PathBuf,
        /// Validate every written block against this signature of the new tree
        #[arg(long)]
        signature: Option<PathBuf>,
    },
    /// Write the signature of a tree
    Sign {
        /// Directory or file to hash
        dir: PathBuf,
        /// Where to write the signature
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
        #[command(flatten)]
        compression: CompressionArgs,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "treepatch=info",
        1 => "treepatch=debug",
        _ => "treepatch=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn setup_cancel_handler() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, cancelling...");
            flag.cancel();
        }
    });
    cancel
}

fn per_second(bytes: u64, elapsed: Duration) -> HumanBytes {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return HumanBytes(bytes);
    }
    HumanBytes((bytes as f64 / secs) as u64)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cancel = setup_cancel_handler();
    let show_progress = !cli.quiet;

    match cli.command {
        Commands::Diff {
            old,
            new,
            patch,
            verify,
            block_size,
            compression,
        } => {
            let params = DiffParams {
                old,
                new,
                patch,
                compression: compression.settings(),
                block_size,
                verify,
                show_progress,
                cancel,
            };
            let summary = create::create_patch(&params).await?;

            match summary.old_source {
                OldSource::SignatureFile => {
                    println!("Read signature from {}", params.old.display());
                    println!(
                        "  Old: {} ({})",
                        HumanBytes(summary.old_tree.size),
                        summary.old_tree.stats()
                    );
                }
                OldSource::Hashed { elapsed } => {
                    println!(
                        "  Old: {} ({}) @ {}/s",
                        HumanBytes(summary.old_tree.size),
                        summary.old_tree.stats(),
                        per_second(summary.old_tree.size, elapsed)
                    );
                }
            }
            println!(
                "  New: {} ({}) @ {}/s",
                HumanBytes(summary.new_tree.size),
                summary.new_tree.stats(),
                per_second(summary.new_tree.size, summary.diff_elapsed)
            );

            let rel_to_new = if summary.new_tree.size == 0 {
                0.0
            } else {
                100.0 * summary.patch_size as f64 / summary.new_tree.size as f64
            };
            println!(
                "Re-used {:.2}% of old, added {} fresh data",
                summary.stats.reused_percent(),
                HumanBytes(summary.stats.fresh_bytes)
            );
            println!(
                "{} patch ({:.2}% of the full size) in {}",
                HumanBytes(summary.patch_size),
                rel_to_new,
                HumanDuration(summary.diff_elapsed)
            );
            println!(
                "Signature written to {} ({})",
                summary.signature_path.display(),
                HumanBytes(summary.signature_size)
            );
            if summary.verified {
                println!("Patch applies cleanly!");
            }
        }
        Commands::Apply {
            patch,
            old,
            dir,
            signature,
        } => {
            println!("Applying patch...");
            println!("  Patch: {}", patch.display());
            println!("  Old: {}", old.display());
            println!("  Output: {}", dir.display());

            let start = Instant::now();
            let params = apply::ApplyParams {
                patch,
                old,
                output: dir,
                signature,
                show_progress,
                cancel,
            };
            let summary = apply::apply_patch(&params).await?;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Tree: {} ({})", HumanBytes(summary.tree.size), summary.tree.stats());
            println!("  Copied from old: {}", HumanBytes(summary.stats.copied_bytes));
            println!("  Fresh data: {}", HumanBytes(summary.stats.fresh_bytes));
            if summary.validated {
                println!("  Every block matched the signature");
            }
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Sign {
            dir,
            output,
            block_size,
            compression,
        } => {
            let start = Instant::now();
            let summary = create::create_signature(
                &dir,
                &output,
                block_size,
                compression.settings(),
                show_progress,
                cancel,
            )
            .await?;
            let elapsed = start.elapsed();

            println!(
                "{} ({}) @ {}/s",
                HumanBytes(summary.tree.size),
                summary.tree.stats(),
                per_second(summary.tree.size, elapsed)
            );
            println!(
                "Signature written to {} ({})",
                output.display(),
                HumanBytes(summary.signature_size)
            );
        }
    }

    Ok(())
}
