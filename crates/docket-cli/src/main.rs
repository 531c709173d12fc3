use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use docket_client::{
    ConfiguredStore, MistralOcr, PdfLinkEnumerator, ReqwestFetcher, StorageConfig, ThrottleConfig,
    ThrottledFetcher,
};
use docket_core::artifact::{FsArtifactStore, object_key};
use docket_core::enumerate::{ManifestEnumerator, StoreEnumerator};
use docket_core::processors::{DownloadProcessor, TransformProcessor};
use docket_core::{
    ArtifactStore, CheckpointStore, Coordinator, Enumerator, Executor, PageRange, Processor,
    RetryPolicy, RunConfig, RunSummary, StatusCounts, TracingRunReporter, UnitStatus,
};

#[derive(Parser)]
#[command(
    name = "docket",
    version,
    about = "Resumable ingestion of regulatory filings"
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover PDF links on index pages (or read a manifest) and download them
    Crawl {
        /// Index page URL; `{n}` is replaced by each page number
        #[arg(long, required_unless_present = "manifest", requires_all = ["from", "to"])]
        index: Option<String>,

        /// First page number (may be greater than --to)
        #[arg(long, allow_negative_numbers = true)]
        from: Option<i64>,

        /// Last page number, inclusive
        #[arg(long, allow_negative_numbers = true)]
        to: Option<i64>,

        /// JSON or CSV file listing the documents to download
        #[arg(long, conflicts_with = "index")]
        manifest: Option<PathBuf>,

        /// Key prefix for uploaded PDFs
        #[arg(long, env = "DOCKET_PREFIX", default_value = "")]
        prefix: String,

        /// Minimum pause between requests to the same host, in milliseconds
        #[arg(long, env = "DOCKET_DELAY_MS", default_value_t = 1000)]
        delay_ms: u64,

        /// Render index pages with a headless browser
        #[arg(long, default_value_t = false)]
        headless: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// OCR stored documents and upload the JSON output
    Ocr {
        /// Key prefix to read source documents from
        #[arg(long, required_unless_present = "manifest")]
        input_prefix: Option<String>,

        /// Only process keys ending with this suffix (case-insensitive)
        #[arg(long, default_value = ".pdf")]
        suffix: String,

        /// JSON or CSV file listing object keys or document URLs to OCR.
        /// URLs are passed to the OCR service directly.
        #[arg(long, conflicts_with = "input_prefix")]
        manifest: Option<PathBuf>,

        /// Key prefix for uploaded OCR results
        #[arg(long)]
        output_prefix: String,

        /// Mistral API key
        #[arg(long, env = "MISTRAL_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Mistral API base URL
        #[arg(
            long,
            env = "MISTRAL_BASE_URL",
            default_value = "https://api.mistral.ai/v1"
        )]
        base_url: String,

        /// Include base64 page images in the output
        #[arg(long, default_value_t = false)]
        include_images: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show checkpoint totals and failed units
    Status {
        #[arg(long, env = "DOCKET_CHECKPOINT", default_value = "docket-checkpoint.csv")]
        checkpoint: PathBuf,

        /// Print as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Make units eligible for processing again
    Reset {
        #[arg(long, env = "DOCKET_CHECKPOINT", default_value = "docket-checkpoint.csv")]
        checkpoint: PathBuf,

        /// Unit id to reset (repeatable)
        #[arg(long = "unit", required_unless_present_any = ["failed", "all"])]
        units: Vec<String>,

        /// Reset every failed unit
        #[arg(long, default_value_t = false, conflicts_with = "all")]
        failed: bool,

        /// Move the whole checkpoint log aside and start fresh
        #[arg(long, default_value_t = false, conflicts_with = "units")]
        all: bool,
    },
}

/// Flags shared by the processing commands.
#[derive(Args)]
struct RunArgs {
    /// Checkpoint log path
    #[arg(long, env = "DOCKET_CHECKPOINT", default_value = "docket-checkpoint.csv")]
    checkpoint: PathBuf,

    /// Directory for staged artifacts
    #[arg(long, env = "DOCKET_WORK_DIR", default_value = "docket-work")]
    work_dir: PathBuf,

    /// Keep artifacts on local disk instead of uploading them
    #[arg(long, default_value_t = false)]
    no_upload: bool,

    /// Stop after processing this many units
    #[arg(long)]
    limit: Option<usize>,

    /// Units processed concurrently
    #[arg(long, env = "DOCKET_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Attempts per unit before it is recorded as failed
    #[arg(long, env = "DOCKET_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Per-attempt timeout in seconds
    #[arg(long, env = "DOCKET_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Print the run summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Upload the checkpoint log to the store after the run
    #[arg(long, default_value_t = false)]
    upload_checkpoint: bool,
}

impl RunArgs {
    fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    fn run_config(&self, upload_prefix: &str) -> RunConfig {
        RunConfig::default()
            .with_workers(self.workers)
            .with_limit(self.limit)
            .with_upload(!self.no_upload)
            .with_upload_prefix(upload_prefix)
    }

    /// The configured store, or a local stand-in when nothing will be uploaded.
    fn store(&self, required: bool) -> Result<ConfiguredStore> {
        if required || !self.no_upload || self.upload_checkpoint {
            let config = StorageConfig::from_env().context("Failed to read storage configuration")?;
            return config
                .connect()
                .context("Failed to connect to the artifact store");
        }
        Ok(ConfiguredStore::Fs(FsArtifactStore::new(&self.work_dir)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let directive = if cli.verbose {
        "docket=debug"
    } else {
        "docket=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Crawl {
            index,
            from,
            to,
            manifest,
            prefix,
            delay_ms,
            headless,
            run,
        } => {
            let source = match (index, manifest) {
                (_, Some(path)) => CrawlSource::Manifest(path),
                (Some(template), None) => {
                    let (Some(from), Some(to)) = (from, to) else {
                        bail!("--index requires --from and --to");
                    };
                    CrawlSource::Index {
                        template,
                        range: PageRange::new(from, to),
                        headless,
                    }
                }
                (None, None) => bail!("Either --index or --manifest is required"),
            };
            cmd_crawl(source, &prefix, Duration::from_millis(delay_ms), &run).await?;
        }
        Commands::Ocr {
            input_prefix,
            suffix,
            manifest,
            output_prefix,
            api_key,
            base_url,
            include_images,
            run,
        } => {
            let ocr = MistralOcr::with_base_url(&api_key, &base_url)
                .context("Failed to configure the OCR client")?
                .with_timeout(run.attempt_timeout())
                .context("Failed to configure the OCR client")?
                .with_images(include_images);
            let source = match (input_prefix, manifest) {
                (_, Some(path)) => OcrSource::Manifest(path),
                (Some(prefix), None) => OcrSource::Listing { prefix, suffix },
                (None, None) => bail!("either --input-prefix or --manifest is required"),
            };
            cmd_ocr(ocr, source, &output_prefix, &run).await?;
        }
        Commands::Status { checkpoint, json } => cmd_status(&checkpoint, json)?,
        Commands::Reset {
            checkpoint,
            units,
            failed,
            all,
        } => cmd_reset(&checkpoint, &units, failed, all)?,
    }

    Ok(())
}

enum CrawlSource {
    Index {
        template: String,
        range: PageRange,
        headless: bool,
    },
    Manifest(PathBuf),
}

async fn cmd_crawl(
    source: CrawlSource,
    prefix: &str,
    delay: Duration,
    run: &RunArgs,
) -> Result<()> {
    let throttle = ThrottleConfig::new(delay);
    let fetcher = ThrottledFetcher::new(
        ReqwestFetcher::with_timeout(run.attempt_timeout())
            .context("Failed to build the HTTP client")?,
        throttle.clone(),
    );
    let policy = RetryPolicy::default().with_max_attempts(run.max_attempts);

    let enumerator: Box<dyn Enumerator> = match source {
        CrawlSource::Manifest(path) => Box::new(ManifestEnumerator::new(path)),
        CrawlSource::Index {
            template,
            range,
            headless: false,
        } => Box::new(
            PdfLinkEnumerator::new(fetcher.clone(), range, &template).with_policy(policy.clone()),
        ),
        CrawlSource::Index {
            template,
            range,
            headless: true,
        } => headless_enumerator(range, &template, throttle, policy.clone(), run).await?,
    };

    let processor = DownloadProcessor::new(fetcher, &run.work_dir);
    let store = run.store(false)?;
    execute(processor, store, enumerator.as_ref(), policy, prefix, run).await
}

#[cfg(feature = "browser")]
async fn headless_enumerator(
    range: PageRange,
    template: &str,
    throttle: ThrottleConfig,
    policy: RetryPolicy,
    run: &RunArgs,
) -> Result<Box<dyn Enumerator>> {
    let browser = docket_client::BrowserFetcher::with_timeout(run.attempt_timeout())
        .await
        .context("Failed to launch the headless browser")?;
    let fetcher = ThrottledFetcher::new(browser, throttle);
    Ok(Box::new(
        PdfLinkEnumerator::new(fetcher, range, template).with_policy(policy),
    ))
}

#[cfg(not(feature = "browser"))]
async fn headless_enumerator(
    _range: PageRange,
    _template: &str,
    _throttle: ThrottleConfig,
    _policy: RetryPolicy,
    _run: &RunArgs,
) -> Result<Box<dyn Enumerator>> {
    bail!("--headless requires docket to be built with the `browser` feature")
}

enum OcrSource {
    Listing { prefix: String, suffix: String },
    Manifest(PathBuf),
}

async fn cmd_ocr(
    ocr: MistralOcr,
    source: OcrSource,
    output_prefix: &str,
    run: &RunArgs,
) -> Result<()> {
    // Listing needs the configured store; a manifest does not.
    let store = run.store(matches!(source, OcrSource::Listing { .. }))?;
    let enumerator: Box<dyn Enumerator> = match source {
        OcrSource::Listing { prefix, suffix } => {
            Box::new(StoreEnumerator::new(store.clone(), prefix, suffix))
        }
        OcrSource::Manifest(path) => Box::new(ManifestEnumerator::new(path)),
    };
    let processor = TransformProcessor::new(store.clone(), ocr, &run.work_dir);
    let policy = RetryPolicy::default().with_max_attempts(run.max_attempts);
    execute(processor, store, enumerator.as_ref(), policy, output_prefix, run).await
}

/// Run the coordinator until the enumerator is exhausted or Ctrl+C is pressed.
async fn execute<P: Processor>(
    processor: P,
    store: ConfiguredStore,
    enumerator: &dyn Enumerator,
    policy: RetryPolicy,
    upload_prefix: &str,
    run: &RunArgs,
) -> Result<()> {
    let checkpoint = CheckpointStore::open(&run.checkpoint).with_context(|| {
        format!("Failed to open checkpoint log {}", run.checkpoint.display())
    })?;

    let executor = Executor::new(processor, policy).with_attempt_timeout(run.attempt_timeout());
    let coordinator = Coordinator::new(executor, store.clone(), run.run_config(upload_prefix));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received, finishing in-flight units");
                trigger.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });

    let result = coordinator
        .run(enumerator, &checkpoint, cancel, &TracingRunReporter)
        .await;

    if run.upload_checkpoint {
        upload_checkpoint(&store, &checkpoint, upload_prefix).await;
    }

    let summary = result.context("Run aborted")?;
    print_summary(&summary, run.json)?;
    Ok(())
}

async fn upload_checkpoint(store: &ConfiguredStore, checkpoint: &CheckpointStore, prefix: &str) {
    let file_name = checkpoint
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint.csv".to_string());
    let key = object_key(prefix, &format!("checkpoints/{file_name}"));
    match store.put(checkpoint.path(), &key).await {
        Ok(()) => tracing::info!(%key, "Uploaded checkpoint log"),
        Err(e) => tracing::warn!(%key, error = %e, "Failed to upload checkpoint log"),
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Run {}", summary.run_id);
    println!("  Total:      {}", summary.total);
    println!("  Succeeded:  {}", summary.succeeded);
    println!("  Failed:     {}", summary.failed);
    println!("  Skipped:    {}", summary.skipped);
    if summary.duplicates > 0 {
        println!("  Duplicates: {}", summary.duplicates);
    }
    if summary.cancelled {
        println!("  Cancelled before all units were dispatched");
    }
    Ok(())
}

fn cmd_status(path: &Path, json: bool) -> Result<()> {
    let records = CheckpointStore::load(path)
        .with_context(|| format!("Failed to read checkpoint log {}", path.display()))?;
    let counts = StatusCounts::tally(records.values());
    let mut failed: Vec<_> = records
        .values()
        .filter(|r| r.status == UnitStatus::Failed)
        .collect();
    failed.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));

    if json {
        let failed: Vec<_> = failed
            .iter()
            .map(|r| {
                serde_json::json!({
                    "unit_id": r.unit_id,
                    "error_message": r.error_message,
                    "recorded_at": r.recorded_at.to_rfc3339(),
                })
            })
            .collect();
        let out = serde_json::json!({ "counts": counts, "failed": failed });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Checkpoint: {}", path.display());
    println!("  Success: {}", counts.success);
    println!("  Failed:  {}", counts.failed);
    println!("  Pending: {}", counts.pending);

    if !failed.is_empty() {
        println!();
        for record in failed {
            println!(
                "{}  {}",
                record.unit_id,
                record.error_message.as_deref().unwrap_or("(no reason recorded)")
            );
        }
    }
    Ok(())
}

fn cmd_reset(path: &Path, units: &[String], failed: bool, all: bool) -> Result<()> {
    if all {
        match CheckpointStore::reset_all(path)
            .with_context(|| format!("Failed to reset {}", path.display()))?
        {
            Some(backup) => println!("Moved checkpoint log to {}", backup.display()),
            None => println!("No checkpoint log at {}", path.display()),
        }
        return Ok(());
    }

    let store = CheckpointStore::open(path)
        .with_context(|| format!("Failed to open checkpoint log {}", path.display()))?;

    if failed {
        let reset = store.reset_failed().context("Failed to reset failed units")?;
        println!("Reset {reset} failed unit(s)");
    }

    for unit_id in units {
        if store
            .reset_unit(unit_id)
            .with_context(|| format!("Failed to reset {unit_id}"))?
        {
            println!("Reset {unit_id}");
        } else {
            println!("{unit_id} is unknown or already pending");
        }
    }
    Ok(())
}
