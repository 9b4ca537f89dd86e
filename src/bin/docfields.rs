//! CLI binary for docfields.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, feeds it a block file, and prints the result as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use docfields::{
    run, DocumentInput, HttpValidationProvider, PipelineConfig, ProcessingProgress, RunStatus,
    TextBlock, Tier,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Local-only extraction (no external calls)
  docfields blocks.json

  # With validation service for tier 2/3 escalation
  docfields blocks.json --endpoint https://validator.example.com

  # Attach rendered pages so tier 3 can run
  docfields blocks.json --endpoint ... --image page1.png --image page2.png

  # Force a full visual re-extraction
  docfields blocks.json --endpoint ... --image page1.png --entry-tier tier3

  # Never go past the free tier
  docfields blocks.json --max-tier tier1

INPUT FORMAT:
  A JSON array of positioned text blocks, top-to-bottom per page:
    [{"text": "Facture N° FA-2024-001", "page": 1,
      "bbox": {"x": 50.0, "y": 40.0, "width": 180.0, "height": 14.0}}, ...]

ENVIRONMENT VARIABLES:
  DOCFIELDS_ENDPOINT   Validation service base URL
  DOCFIELDS_API_KEY    Bearer token for the validation service
"#;

/// Extract structured fields from document text blocks.
#[derive(Parser, Debug)]
#[command(
    name = "docfields",
    version,
    about = "Progressive multi-tier field extraction for business documents",
    long_about = "Extract invoice-style fields (numbers, dates, amounts, identifiers, party \
names) from positioned text blocks. Starts with free local pattern matching and escalates \
doubtful fields to an external validation service only when confidence requires it.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// JSON file containing the document's positioned text blocks.
    input: PathBuf,

    /// Write the result JSON to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Document identifier used in progress events and stored output.
    #[arg(long)]
    document_id: Option<String>,

    /// Rendered page image (repeatable, in page order). Enables tier 3.
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// Validation service base URL. Without it the pipeline stays local.
    #[arg(long, env = "DOCFIELDS_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer token for the validation service.
    #[arg(long, env = "DOCFIELDS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Tier to start from: tier1, tier2, tier3.
    #[arg(long, value_enum, default_value = "tier1")]
    entry_tier: TierArg,

    /// Highest tier the run may escalate to.
    #[arg(long, value_enum, default_value = "tier3")]
    max_tier: TierArg,

    /// Overall confidence below which tier 1 escalates to tier 2.
    #[arg(long, default_value_t = 0.85)]
    tier1_threshold: f64,

    /// Overall confidence below which tier 2 escalates to tier 3.
    #[arg(long, default_value_t = 0.90)]
    tier2_threshold: f64,

    /// Retries per external call on transient failure.
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Per-call timeout in seconds.
    #[arg(long, default_value_t = 30)]
    api_timeout: u64,

    /// Pretty-print the output JSON.
    #[arg(long)]
    pretty: bool,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors and the result.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TierArg {
    Tier1,
    Tier2,
    Tier3,
}

impl From<TierArg> for Tier {
    fn from(v: TierArg) -> Self {
        match v {
            TierArg::Tier1 => Tier::Tier1,
            TierArg::Tier2 => Tier::Tier2,
            TierArg::Tier3 => Tier::Tier3,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress bar and INFO logs fight over the terminal; prefer the bar.
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

    // ── Load inputs ──────────────────────────────────────────────────────
    let raw = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let blocks: Vec<TextBlock> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid block file", cli.input.display()))?;

    let mut images = Vec::with_capacity(cli.images.len());
    for path in &cli.images {
        let img = image::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?;
        images.push(img);
    }

    let document_id = cli.document_id.clone().unwrap_or_else(|| {
        cli.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string())
    });

    // ── Build config ─────────────────────────────────────────────────────
    let mut builder = PipelineConfig::builder()
        .entry_tier(cli.entry_tier.into())
        .max_tier(cli.max_tier.into())
        .tier1_escalation_threshold(cli.tier1_threshold)
        .tier2_escalation_threshold(cli.tier2_threshold)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout);

    if let Some(endpoint) = &cli.endpoint {
        let provider = HttpValidationProvider::new(endpoint.clone(), cli.api_key.clone())
            .context("failed to construct validation provider")?;
        builder = builder.provider(Arc::new(provider));
    } else if !matches!(cli.entry_tier, TierArg::Tier1) {
        // Forcing tier 2/3 entry makes no sense without a service to call.
        return Err(docfields::PipelineError::EndpointNotConfigured.into());
    }

    let (progress_task, builder) = if show_progress {
        let (tx, rx) = mpsc::channel::<ProcessingProgress>(64);
        (Some(spawn_progress_bar(rx)), builder.progress(tx))
    } else {
        (None, builder)
    };

    let config = builder.build().context("invalid pipeline configuration")?;

    // ── Run ──────────────────────────────────────────────────────────────
    let doc = DocumentInput::new(document_id, blocks).with_images(images);
    let output = run(doc, &config).await;

    // Close the progress channel so the bar task can finish.
    drop(config);
    if let Some(task) = progress_task {
        let _ = task.await;
    }

    // ── Report ───────────────────────────────────────────────────────────
    if !cli.quiet {
        print_summary(&output);
    }

    let json = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    match &cli.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(json.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }

    if output.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

/// Drive an indicatif bar from the pipeline's progress events.
fn spawn_progress_bar(
    rx: mpsc::Receiver<ProcessingProgress>,
) -> tokio::task::JoinHandle<()> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    bar.set_prefix("Extracting");
    bar.enable_steady_tick(Duration::from_millis(80));

    tokio::spawn(async move {
        let mut events = std::pin::pin!(docfields::progress_stream(rx));
        while let Some(event) = events.next().await {
            bar.set_position(u64::from(event.percent));
            bar.set_message(event.message.clone());
            if let Some(tier) = event.tier {
                bar.set_prefix(tier.to_string());
            }
        }
        bar.finish_and_clear();
    })
}

fn print_summary(output: &docfields::ExtractionOutput) {
    let badge = match output.status {
        RunStatus::Completed => green("✔"),
        RunStatus::Partial => yellow("⚠"),
        RunStatus::Failed => red("✘"),
        RunStatus::Queued | RunStatus::Processing => dim("…"),
    };
    eprintln!(
        "{badge} {} fields  {}  {}  {}",
        bold(&output.fields.len().to_string()),
        dim(&format!("confidence {:.2}", output.overall_confidence)),
        dim(&format!(
            "tiers {}",
            output
                .tiers_executed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("→")
        )),
        dim(&format!(
            "{} calls (${:.4})",
            output.usage.total_calls(),
            output.usage.estimated_cost
        )),
    );
    for (kind, field) in &output.fields {
        eprintln!(
            "  {} {:<16} {}  {}",
            green("•"),
            kind.name(),
            field.value,
            dim(&format!("{:.2} {}", field.confidence, field.provenance)),
        );
    }
    for c in &output.corrections {
        eprintln!(
            "  {} {:<16} {} → {}",
            yellow("±"),
            c.field.name(),
            c.original,
            c.corrected,
        );
    }
    for e in &output.errors {
        eprintln!("  {} {e}", red("✗"));
    }
}
