//! CLI binary for trade-doc-validator.
//!
//! A thin shim over the library crate: maps flags to `PipelineConfig`,
//! wires the local object store, the SQLite record store and the in-process
//! channel, and prints JSON results to stdout. Logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use trade_doc_validator::{
    ChannelDispatcher, LlmVisionModel, LocalObjectStore, PdfiumRasteriser, Pipeline,
    PipelineConfig, PriceTable, RecordStore, SqliteRecordStore,
};

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process one document already in the object store (./objects/trade-docs/inbox/lc.png)
  tdv process --bucket trade-docs --key inbox/lc.png

  # Route a trigger in any accepted shape (file or stdin)
  tdv route event.json
  echo '{"Records":[{"body":"{\"bucket\":\"b\",\"key\":\"k.pdf\"}"}]}' | tdv route

  # Inline content, stored under the inline bucket first
  echo '{"key":"swift/lc.mt700","content":":20:LC123..."}' | tdv route

  # Read back results
  tdv record doc_3f2a9c1b7e04
  tdv audit doc_3f2a9c1b7e04

  # Drop records and audit rows past their retention
  tdv purge

  # Escalation rate per type, threshold boundary counts and costs, last 30 days
  tdv stats --since 30 --confidence-threshold 0.85

ESCALATION:
  c >= threshold (0.8)           extract on the cheap model
  floor (0.5) <= c < threshold   re-classify once on the capable model, extract there
  c < floor                      REJECTED, no extraction call
  An incomplete extraction is retried once on the capable model; after two
  incomplete attempts the best one is kept as EXTRACTED_DEGRADED.

ENVIRONMENT:
  ANTHROPIC_API_KEY / OPENAI_API_KEY / GEMINI_API_KEY   provider auto-detection
  EDGEQUAKE_LLM_PROVIDER                                force a provider
  PDFIUM_LIB_PATH                                       directory holding libpdfium
  RUST_LOG                                              overrides --verbose/--quiet
"#;

/// Route, classify and extract trade-finance documents with two model tiers.
#[derive(Parser, Debug)]
#[command(
    name = "tdv",
    version,
    about = "Route, classify and extract trade-finance documents with two model tiers",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root directory of the local object store (root/bucket/key).
    #[arg(long, global = true, env = "TDV_OBJECTS_DIR", default_value = "./objects")]
    objects_dir: PathBuf,

    /// SQLite file holding records and the audit trail.
    #[arg(long, global = true, env = "TDV_DB", default_value = "./tdv-records.db")]
    db: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "TDV_VERBOSE")]
    verbose: bool,

    /// Suppress all logs except errors.
    #[arg(short, long, global = true, env = "TDV_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process one document by bucket and key.
    Process {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Route a trigger payload (direct, queue-wrapped or storage event) and
    /// run it to completion.
    Route {
        /// JSON file; stdin when omitted or '-'.
        input: Option<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Print the processing record of a document.
    Record { document_id: String },
    /// Print the audit trail of a document.
    Audit { document_id: String },
    /// Delete records and audit rows whose retention has lapsed.
    Purge,
    /// Report escalation, threshold boundary and cost figures over recent
    /// records, with a sweep of alternative thresholds.
    Stats {
        /// Window in days, counted back from now.
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(1..))]
        since: i64,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Classification confidence at or above which no escalation happens.
    #[arg(long, env = "TDV_CONFIDENCE_THRESHOLD", default_value_t = 0.8)]
    confidence_threshold: f64,

    /// Classification confidence below which the document is rejected.
    #[arg(long, env = "TDV_REJECT_FLOOR", default_value_t = 0.5)]
    reject_floor: f64,

    /// Extraction attempts per document (1 or 2).
    #[arg(long, env = "TDV_MAX_EXTRACTION_ATTEMPTS", default_value_t = 2,
          value_parser = clap::value_parser!(u32).range(1..=2))]
    max_extraction_attempts: u32,

    /// Extraction confidence below which the quality gate fails.
    #[arg(long, env = "TDV_MIN_EXTRACTION_CONFIDENCE", default_value_t = 0.3)]
    min_extraction_confidence: f64,

    /// Also escalate confident classifications of type OTHER.
    #[arg(long, env = "TDV_ESCALATE_ON_AMBIGUOUS_TYPE")]
    escalate_on_ambiguous_type: bool,

    /// Cheap-tier model id.
    #[arg(long, env = "TDV_CHEAP_MODEL", default_value = "claude-3-haiku-20240307")]
    cheap_model: String,

    /// Capable-tier model id.
    #[arg(long, env = "TDV_CAPABLE_MODEL", default_value = "claude-3-5-sonnet-20240620")]
    capable_model: String,

    /// LLM provider: anthropic, openai, gemini, ollama, azure.
    #[arg(
        long,
        env = "TDV_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set."
    )]
    provider: Option<String>,

    /// Estimated USD per cheap-tier call (decimal).
    #[arg(long, env = "TDV_CHEAP_PRICE", default_value = "0.000500")]
    cheap_price: String,

    /// Estimated USD per capable-tier call (decimal).
    #[arg(long, env = "TDV_CAPABLE_PRICE", default_value = "0.006000")]
    capable_price: String,

    #[arg(long, env = "TDV_CLASSIFICATION_TEMPERATURE", default_value_t = 0.1)]
    classification_temperature: f32,

    #[arg(long, env = "TDV_EXTRACTION_TEMPERATURE", default_value_t = 0.0)]
    extraction_temperature: f32,

    #[arg(long, env = "TDV_CLASSIFICATION_MAX_TOKENS", default_value_t = 1000)]
    classification_max_tokens: usize,

    #[arg(long, env = "TDV_EXTRACTION_MAX_TOKENS", default_value_t = 2000)]
    extraction_max_tokens: usize,

    /// Infrastructure retries per model or storage call.
    #[arg(long, env = "TDV_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base backoff between infrastructure retries, doubled each time.
    #[arg(long, env = "TDV_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Per model call timeout in seconds.
    #[arg(long, env = "TDV_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Per storage call timeout in seconds.
    #[arg(long, env = "TDV_STORAGE_TIMEOUT", default_value_t = 15)]
    storage_timeout: u64,

    /// PDF rendering DPI (72–400).
    #[arg(long, env = "TDV_DPI", default_value_t = 144,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Long-edge pixel cap for rendered pages.
    #[arg(long, env = "TDV_MAX_RENDERED_PIXELS", default_value_t = 4000)]
    max_rendered_pixels: u32,

    #[arg(long, env = "TDV_RECORD_RETENTION_DAYS", default_value_t = 90)]
    record_retention_days: i64,

    #[arg(long, env = "TDV_AUDIT_RETENTION_DAYS", default_value_t = 365)]
    audit_retention_days: i64,

    /// Bucket that inline trigger content is stored under.
    #[arg(long, env = "TDV_INLINE_BUCKET", default_value = "inline")]
    inline_bucket: String,

    /// Documents handled concurrently.
    #[arg(short, long, env = "TDV_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
}

impl PipelineArgs {
    fn to_config(&self) -> Result<PipelineConfig> {
        let prices = PriceTable::from_strs(&self.cheap_price, &self.capable_price)
            .context("Invalid price table")?;
        let mut builder = PipelineConfig::builder()
            .confidence_threshold(self.confidence_threshold)
            .reject_floor(self.reject_floor)
            .max_extraction_attempts(self.max_extraction_attempts)
            .min_extraction_confidence(self.min_extraction_confidence)
            .escalate_on_ambiguous_type(self.escalate_on_ambiguous_type)
            .cheap_model_id(&self.cheap_model)
            .capable_model_id(&self.capable_model)
            .price_table(prices)
            .classification_temperature(self.classification_temperature)
            .extraction_temperature(self.extraction_temperature)
            .classification_max_tokens(self.classification_max_tokens)
            .extraction_max_tokens(self.extraction_max_tokens)
            .max_retries(self.max_retries)
            .retry_backoff_ms(self.retry_backoff_ms)
            .api_timeout_secs(self.api_timeout)
            .storage_timeout_secs(self.storage_timeout)
            .dpi(self.dpi)
            .max_rendered_pixels(self.max_rendered_pixels)
            .record_retention_days(self.record_retention_days)
            .audit_retention_days(self.audit_retention_days)
            .inline_bucket(&self.inline_bucket)
            .worker_concurrency(self.concurrency);
        if let Some(provider) = &self.provider {
            builder = builder.provider_name(provider);
        }
        builder.build().context("Invalid pipeline configuration")
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn read_trigger(input: Option<&PathBuf>) -> Result<Value> {
    let text = match input {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read trigger file {}", path.display()))?,
        _ => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read trigger from stdin")?;
            buf
        }
    };
    serde_json::from_str(&text).context("Trigger is not valid JSON")
}

async fn run_pipeline(cli: &Cli, args: &PipelineArgs, trigger: Value) -> Result<()> {
    let config = args.to_config()?;
    let model =
        LlmVisionModel::from_config(&config).context("Failed to set up the model provider")?;
    let records = SqliteRecordStore::open(&cli.db).context("Failed to open record store")?;
    let (dispatcher, mut rx) = ChannelDispatcher::channel();
    let rasteriser = PdfiumRasteriser::new(config.dpi, config.max_rendered_pixels);

    let pipeline = Pipeline::new(
        config,
        Arc::new(model),
        Arc::new(LocalObjectStore::new(&cli.objects_dir)),
        Arc::new(records),
        Arc::new(dispatcher),
        Arc::new(rasteriser),
    );
    let report = pipeline
        .run(&trigger, &mut rx)
        .await
        .context("Pipeline run failed")?;
    print_json(&report)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
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

    match &cli.command {
        Command::Process {
            bucket,
            key,
            pipeline,
        } => {
            let trigger = serde_json::json!({ "bucket": bucket, "key": key });
            run_pipeline(&cli, pipeline, trigger).await
        }
        Command::Route { input, pipeline } => {
            let trigger = read_trigger(input.as_ref())?;
            run_pipeline(&cli, pipeline, trigger).await
        }
        Command::Record { document_id } => {
            let store = SqliteRecordStore::open(&cli.db).context("Failed to open record store")?;
            match store.get_record(document_id).await? {
                Some(record) => print_json(&record),
                None => bail!("No record for document '{}'", document_id),
            }
        }
        Command::Audit { document_id } => {
            let store = SqliteRecordStore::open(&cli.db).context("Failed to open record store")?;
            let trail = store.audit_trail(document_id).await?;
            if trail.is_empty() {
                bail!("No audit trail for document '{}'", document_id);
            }
            print_json(&trail)
        }
        Command::Purge => {
            let store = SqliteRecordStore::open(&cli.db).context("Failed to open record store")?;
            let (records, audit_rows) = store.purge_expired(chrono::Utc::now()).await?;
            print_json(&serde_json::json!({
                "records_deleted": records,
                "audit_rows_deleted": audit_rows,
            }))
        }
        Command::Stats { since, pipeline } => {
            let config = pipeline.to_config()?;
            let store = SqliteRecordStore::open(&cli.db).context("Failed to open record store")?;
            let from = chrono::Utc::now() - chrono::Duration::days(*since);
            let records = store.records_since(from).await?;
            print_json(&trade_doc_validator::summarize(&records, &config, from))
        }
    }
}
