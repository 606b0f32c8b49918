//! form-replay: headless replica for form operation journals.
//!
//! Replays a JSON-lines journal through the same core the editor uses and
//! prints the converged document tree.

use anyhow::{bail, Context, Result};
use clap::Parser;
use form_sync::{SectionId, UserId};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use form_replay::{check_convergence, load_journal, replay, save_journal, ReplayOptions};

#[derive(Parser, Debug)]
#[command(name = "form-replay")]
#[command(about = "Replay a form operation journal")]
struct Args {
    /// Path to the journal (one JSON operation per line)
    journal: PathBuf,

    /// Section of the starting document (repeatable, in order)
    #[arg(short, long = "section", default_value = "S1")]
    sections: Vec<String>,

    /// User id the replica runs as
    #[arg(long, default_value = "form-replay")]
    user: String,

    /// Also replay in permuted delivery orders and fail if they diverge
    #[arg(long)]
    check: bool,

    /// Write the tree here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the parsed journal back out, normalized, to this path
    #[arg(long)]
    normalize: Option<PathBuf>,

    /// Pretty-print the tree
    #[arg(long)]
    pretty: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so the tree can be piped. RUST_LOG wins over --verbose.
    let default_filter = if args.verbose {
        "debug,form_sync=debug,form_replay=debug"
    } else {
        "info,form_sync=warn,form_replay=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let sections = args
        .sections
        .iter()
        .map(|s| s.parse::<SectionId>())
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid section id")?;
    let user: UserId = args.user.parse().context("Invalid user id")?;
    let options = ReplayOptions { sections, user };

    let ops = load_journal(&args.journal)?;
    info!("Loaded {} operation(s) from {:?}", ops.len(), args.journal);

    if let Some(path) = &args.normalize {
        save_journal(path, &ops)?;
        info!("Wrote normalized journal to {:?}", path);
    }

    let (tree, report) = replay(&ops, &options)?;
    info!(
        "Replayed: {} applied, {} skipped, {} dropped, {} duplicate(s)",
        report.applied, report.skipped, report.dropped, report.duplicates
    );

    if args.check {
        let convergence = check_convergence(&ops, &options)?;
        if !convergence.converged() {
            bail!(
                "Replicas diverged across {} delivery orders on field(s): {}",
                convergence.orders,
                convergence
                    .diverged_fields
                    .iter()
                    .map(|id| id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if !convergence.identical {
            warn!("Fields converged but row order differs between delivery orders");
        }
        info!("Converged across {} delivery orders", convergence.orders);
    }

    let json = if args.pretty {
        serde_json::to_string_pretty(&*tree)?
    } else {
        serde_json::to_string(&*tree)?
    };

    match &args.output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote tree to {:?}", path);
        }
        None => println!("{}", json),
    }

    Ok(())
}
