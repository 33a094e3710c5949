//! CLI binary for paperflow.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, picks a run mode, and prints reports.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use paperflow::{
    ExperimentSandbox, FetchRequest, Mode, Orchestrator, PipelineConfig, PipelineProgress,
    ResetScope, RunReport, Stage, StageOps, StagePolicy, StatusSummary, WipeConfirmation,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one progress bar per stage, with per-item
/// log lines printed above it.
struct CliProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        Arc::new(CliProgress {
            bar: Mutex::new(None),
        })
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            f(bar);
        }
    }
}

impl PipelineProgress for CliProgress {
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>4}/{len} papers  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.set_prefix(format!("{stage:>10}", stage = stage.to_string()));
        bar.enable_steady_tick(Duration::from_millis(80));
        bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{stage}: {total} candidates"))
        ));
        *self.bar.lock().unwrap() = Some(bar);
    }

    fn on_item_done(&self, _stage: Stage, paper_id: &str) {
        self.with_bar(|bar| {
            bar.println(format!("  {} {}", green("✓"), dim(paper_id)));
            bar.inc(1);
        });
    }

    fn on_item_failed(&self, _stage: Stage, paper_id: &str, error: &str) {
        // Truncate very long error messages to keep output tidy.
        let msg = truncated(error, 80);
        self.with_bar(|bar| {
            bar.println(format!("  {} {}  {}", red("✗"), paper_id, red(&msg)));
            bar.inc(1);
        });
    }

    fn on_item_skipped(&self, _stage: Stage, paper_id: &str, reason: &str) {
        self.with_bar(|bar| {
            bar.println(format!("  {} {}  {}", dim("–"), dim(paper_id), dim(reason)));
            bar.inc(1);
        });
    }

    fn on_stage_complete(&self, stage: Stage, succeeded: usize, failed: usize) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
        if failed == 0 {
            eprintln!("{} {stage}: {} succeeded", green("✔"), bold(&succeeded.to_string()));
        } else {
            eprintln!(
                "{} {stage}: {} succeeded, {} failed",
                cyan("⚠"),
                bold(&succeeded.to_string()),
                red(&failed.to_string()),
            );
        }
    }
}

/// Cap a message at `max` characters, replacing the tail with an ellipsis.
///
/// Counts characters, not bytes: error messages quote URLs and upstream
/// response text, so a byte-index cut could land inside a multi-byte
/// character and panic.
fn truncated(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        message.to_string()
    } else {
        let cut: String = message.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full pipeline: search, download, convert, extract
  paperflow run "retrieval augmented generation" --total 200

  # Fetch metadata only, restricted to open-access CS papers since 2020
  paperflow fetch "graph neural networks" --field "Computer Science" \
      --open-access-only --year 2020-

  # Re-run downloads, attempting non-open-access papers too
  paperflow download --all-access

  # Re-convert everything, even papers already converted
  paperflow convert --overwrite --grobid-url http://localhost:8070

  # Show per-stage progress counts
  paperflow status

  # Back to pending without touching artifacts
  paperflow reset

  # Destroy the dataset (asks two confirmation questions)
  paperflow reset --full --remove-artifacts

  # Run the same pipeline inside an isolated experiment directory
  paperflow --experiment experiments/exp1 run "diffusion models" --total 50

ENVIRONMENT VARIABLES:
  PAPERFLOW_DB               Record-store path (default: papers.db)
  PAPERFLOW_GROBID_URL       Conversion-service base URL
  SEMANTIC_SCHOLAR_API_KEY   Metadata API key (optional; raises rate limits)

SETUP:
  1. Start a GROBID-compatible service:  docker run -p 8070:8070 grobid/grobid
  2. Fetch and process:                  paperflow run "your topic" --total 100
"#;

/// Fetch, download, convert, and section academic papers — resumably.
#[derive(Parser, Debug)]
#[command(
    name = "paperflow",
    version,
    about = "Resumable pipeline for fetching and processing academic papers",
    long_about = "Moves academic papers through four ordered stages (metadata fetch, PDF \
download, TEI conversion, section extraction), persisting per-paper progress in SQLite so any \
stage can be re-run independently and incrementally.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Record-store path.
    #[arg(long, global = true, env = "PAPERFLOW_DB", default_value = "papers.db")]
    db: PathBuf,

    /// Parent directory for the pdf/, tei/, and text/ storage roots.
    #[arg(long, global = true, default_value = "storage")]
    storage_root: PathBuf,

    /// Run inside an isolated experiment directory (own db and storage).
    #[arg(long, global = true, value_name = "DIR")]
    experiment: Option<PathBuf>,

    /// Conversion-service base URL.
    #[arg(
        long,
        global = true,
        env = "PAPERFLOW_GROBID_URL",
        default_value = "http://localhost:8070"
    )]
    grobid_url: String,

    /// Attempt downloads for non-open-access papers too.
    #[arg(long, global = true)]
    all_access: bool,

    /// Delete each source PDF once its conversion is recorded.
    #[arg(long, global = true)]
    delete_pdf_after_convert: bool,

    /// Disable the progress bar.
    #[arg(long, global = true)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(clap::Args, Debug, Clone)]
struct PolicyArgs {
    /// Maximum number of papers to process this run.
    #[arg(long)]
    limit: Option<usize>,

    /// Re-process papers already done or permanently failed.
    #[arg(long)]
    overwrite: bool,

    /// Concurrent in-flight papers.
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Milliseconds between dispatches (default varies per stage).
    #[arg(long)]
    delay_ms: Option<u64>,
}

impl PolicyArgs {
    fn apply(&self, base: StagePolicy) -> StagePolicy {
        StagePolicy {
            limit: self.limit.or(base.limit),
            overwrite: self.overwrite || base.overwrite,
            concurrency: self.concurrency,
            delay: self
                .delay_ms
                .map(Duration::from_millis)
                .unwrap_or(base.delay),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct FetchArgs {
    /// Search query, passed to the metadata API verbatim.
    query: String,

    /// Total number of results to fetch (pages of up to 100).
    #[arg(long, default_value_t = 100)]
    total: usize,

    /// Fields-of-study filter; repeatable.
    #[arg(long = "field")]
    fields_of_study: Vec<String>,

    /// Restrict the search itself to open-access papers.
    #[arg(long)]
    open_access_only: bool,

    /// Publication-year filter, e.g. 2020, 2019-2024, or 2020-.
    #[arg(long)]
    year: Option<String>,
}

impl FetchArgs {
    fn to_request(&self) -> FetchRequest {
        let mut request = FetchRequest::new(&self.query);
        request.desired_total = self.total;
        request.fields_of_study = self.fields_of_study.clone();
        request.open_access_only = self.open_access_only;
        request.year = self.year.clone();
        request
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline: fetch, download, convert, extract.
    Run {
        #[command(flatten)]
        fetch: FetchArgs,
        #[command(flatten)]
        policy: PolicyArgs,
        /// Skip the conversion stage.
        #[arg(long)]
        skip_convert: bool,
        /// Skip the extraction stage.
        #[arg(long)]
        skip_extract: bool,
    },
    /// Fetch paper metadata into the record store.
    Fetch {
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Download PDFs for papers that still need one.
    Download {
        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// Convert downloaded PDFs to TEI XML.
    Convert {
        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// Extract section text from converted TEI.
    Extract {
        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// Show per-stage progress counts.
    Status {
        /// Output the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Reset stage status, or wipe the dataset entirely.
    Reset {
        /// Delete all records instead of resetting status.
        #[arg(long)]
        full: bool,
        /// With --full: also delete artifact files under the storage roots.
        #[arg(long)]
        remove_artifacts: bool,
        /// Non-interactive: acknowledge that all pipeline records will be lost.
        #[arg(long)]
        acknowledge_data_loss: bool,
        /// Non-interactive: acknowledge that the wipe cannot be undone.
        #[arg(long)]
        acknowledge_irreversible: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active; the
    // bar provides the feedback that matters.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Interrupt handling ───────────────────────────────────────────────
    // Ctrl-C raises the cooperative flag: no new dispatches, in-flight
    // items are drained and recorded, then the run ends cleanly.
    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} finishing in-flight papers, then stopping…", cyan("◆"));
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    // ── Build config ─────────────────────────────────────────────────────
    let mut builder = PipelineConfig::builder()
        .db_path(&cli.db)
        .storage_root(&cli.storage_root)
        .all_access(cli.all_access)
        .delete_pdf_after_convert(cli.delete_pdf_after_convert)
        .interrupt(interrupt);
    if show_progress {
        builder = builder.progress(CliProgress::new());
    }

    let defaults = PipelineConfig::default();
    let mode = match &cli.command {
        Command::Run {
            fetch,
            policy,
            skip_convert,
            skip_extract,
        } => {
            builder = builder
                .skip_convert(*skip_convert)
                .skip_extract(*skip_extract)
                .download_policy(policy.apply(defaults.download_policy.clone()))
                .convert_policy(policy.apply(defaults.convert_policy.clone()))
                .extract_policy(policy.apply(defaults.extract_policy.clone()));
            Mode::FullRun(fetch.to_request())
        }
        Command::Fetch { fetch } => Mode::Fetch(fetch.to_request()),
        Command::Download { policy } => {
            builder = builder.download_policy(policy.apply(defaults.download_policy.clone()));
            Mode::Download
        }
        Command::Convert { policy } => {
            builder = builder.convert_policy(policy.apply(defaults.convert_policy.clone()));
            Mode::Convert
        }
        Command::Extract { policy } => {
            builder = builder.extract_policy(policy.apply(defaults.extract_policy.clone()));
            Mode::Extract
        }
        Command::Status { .. } => Mode::Status,
        Command::Reset {
            full,
            remove_artifacts,
            acknowledge_data_loss,
            acknowledge_irreversible,
        } => {
            if *full {
                let confirmation = confirm_wipe(*acknowledge_data_loss, *acknowledge_irreversible)?;
                Mode::Reset(ResetScope::Full {
                    confirmation,
                    remove_artifacts: *remove_artifacts,
                })
            } else {
                Mode::Reset(ResetScope::Status)
            }
        }
    };
    let config = builder.build().context("Invalid configuration")?;

    // ── Build orchestrator, possibly sandboxed ───────────────────────────
    let ops = StageOps::live(&cli.grobid_url).context("Failed to build HTTP clients")?;
    let orchestrator = match &cli.experiment {
        Some(dir) => {
            // Same policies, flags, progress, and interrupt as the primary
            // run; only the db and storage roots move.
            let experiment = config.relocated(dir.join("papers.db"), dir.join("storage"));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create experiment dir {}", dir.display()))?;
            let sandbox = ExperimentSandbox::new(&config, experiment, ops)
                .context("Experiment is not isolated from the primary dataset")?;
            if !cli.quiet {
                eprintln!("{} experiment sandbox: {}", cyan("◆"), bold(&dir.display().to_string()));
            }
            return finish(&cli, sandbox.orchestrator().run(mode).await?);
        }
        None => Orchestrator::new(config, ops).context("Failed to open the record store")?,
    };

    finish(&cli, orchestrator.run(mode).await?)
}

/// Print the final report and summary.
fn finish(cli: &Cli, report: RunReport) -> Result<()> {
    if let Command::Status { json } = &cli.command {
        if *json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report.summary)
                    .context("Failed to serialise summary")?
            );
            return Ok(());
        }
    }

    if let Some(reset) = &report.reset {
        eprintln!(
            "{} reset: {} papers affected, {} artifact files removed",
            green("✔"),
            bold(&reset.papers_affected.to_string()),
            reset.artifacts_removed,
        );
    }
    if !cli.quiet {
        print_summary(&report.summary);
        for stage in &report.stages {
            if stage.interrupted {
                eprintln!("{} {} run was interrupted before completion", cyan("⚠"), stage.stage);
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &StatusSummary) {
    let mut out = io::stderr().lock();
    let _ = writeln!(out, "{}", bold(&format!("{} papers", summary.total)));
    for stage in Stage::ALL {
        let counts = summary.counts_for(stage);
        let _ = writeln!(
            out,
            "  {:>10}  {} done  {} pending  {}",
            stage.to_string(),
            green(&format!("{:>5}", counts.done)),
            format_args!("{:>5}", counts.pending),
            if counts.error > 0 {
                red(&format!("{} error", counts.error))
            } else {
                dim("0 error")
            },
        );
    }
}

/// Obtain both wipe confirmations: from flags if given, otherwise from two
/// separate interactive prompts.
fn confirm_wipe(ack_data_loss: bool, ack_irreversible: bool) -> Result<WipeConfirmation> {
    let data_loss = ack_data_loss
        || prompt("This deletes every paper record. Type DELETE to continue: ")? == "DELETE";
    // Short-circuit: no second question if the first was declined.
    let irreversible = data_loss
        && (ack_irreversible
            || prompt("This cannot be undone. Type yes to confirm: ")?.eq_ignore_ascii_case("yes"));
    Ok(WipeConfirmation::new(data_loss, irreversible))
}

fn prompt(message: &str) -> Result<String> {
    eprint!("{message}");
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Failed to read confirmation")?;
    Ok(line.trim().to_string())
}
