//! picksplit CLI
//!
//! Recovers page headers from scanned picklist PDFs and splits each input
//! into per-document files.
//!
//! ```bash
//! picksplit run batch.pdf --output-dir output
//! picksplit run scans/*.pdf --config picksplit.toml
//! picksplit check-engine
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use picksplit::extract::Extractor;
use picksplit::ocr::{OcrEngine, OcrPipeline, TesseractEngine};
use picksplit::pdf::{bind_pdfium, PdfiumAssembler, PdfiumPageSource};
use picksplit::splitter::DocumentSplitter;
use picksplit::telemetry::{JsonlTarget, NullSink, QueuedSink, TelemetrySink};
use picksplit::validator::HeaderValidator;
use picksplit::ExtractionConfig;

#[derive(Parser)]
#[command(name = "picksplit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Header recovery and splitting for scanned picklist PDFs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one or more PDFs: extract headers and split
    Run {
        /// Input PDF files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Configuration file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Output directory (overrides the configured one)
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Use the legacy-mode engine as a secondary fallback
        #[arg(long)]
        secondary_engine: bool,
    },
    /// Probe the OCR engine and PDF library and report availability
    CheckEngine,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            inputs,
            config,
            output_dir,
            secondary_engine,
        } => run(inputs, config, output_dir, secondary_engine),
        Commands::CheckEngine => check_engine(),
    }
}

fn run(
    inputs: Vec<PathBuf>,
    config_path: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    secondary_engine: bool,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => ExtractionConfig::from_toml_path(path)
            .with_context(|| format!("loading config from '{}'", path.display()))?,
        None => ExtractionConfig::default(),
    };
    if let Some(dir) = &output_dir {
        config.output_dir = dir.to_string_lossy().into_owned();
    }
    if secondary_engine {
        config.enable_secondary_fallback = true;
    }
    config.validate().context("validating configuration")?;
    let config = Arc::new(config);

    if let Err(e) = config.parallel.install_global_thread_pool() {
        warn!(error = %e, "thread pool already configured, keeping existing");
    }

    let validator = HeaderValidator::new(config.clone())?;
    let engine = Arc::new(TesseractEngine::new());
    let secondary: Option<Arc<dyn OcrEngine>> = if config.enable_secondary_fallback {
        Some(Arc::new(TesseractEngine::legacy()))
    } else {
        None
    };
    let pipeline = OcrPipeline::new(config.clone(), validator.clone(), engine, secondary);
    let splitter = DocumentSplitter::new(config.clone(), validator.clone());

    let sink: Arc<dyn TelemetrySink> = if config.enable_telemetry {
        Arc::new(QueuedSink::new(
            Box::new(JsonlTarget::new(&config.telemetry_path)),
            config.telemetry_queue_size,
            config.circuit_breaker_threshold,
        ))
    } else {
        Arc::new(NullSink)
    };

    let extractor = Extractor::new(config.clone(), validator, pipeline, splitter, sink);
    let pdfium = bind_pdfium()?;
    let out_dir = PathBuf::from(&config.output_dir);

    let mut failures = 0usize;
    for input in &inputs {
        let filename = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.to_string_lossy().into_owned());

        // A document that cannot be opened is a job-level failure; the
        // remaining inputs still run.
        let source = match PdfiumPageSource::open(&pdfium, input) {
            Ok(source) => source,
            Err(e) => {
                error!(input = %input.display(), error = %e, "failed to open document");
                failures += 1;
                continue;
            }
        };
        let assembler = PdfiumAssembler::new(&pdfium, input);

        match extractor.process_document(&source, &assembler, &filename, &out_dir) {
            Ok(summary) => {
                info!(
                    input = %input.display(),
                    job = %summary.job_id,
                    headers = summary.headers_extracted,
                    outputs = summary.outputs.len(),
                    elapsed_ms = summary.elapsed_ms,
                    "done"
                );
                println!(
                    "{}: {} page(s), {} header(s), {} output file(s)",
                    filename,
                    summary.total_pages,
                    summary.headers_extracted,
                    summary.outputs.len()
                );
                for output in &summary.outputs {
                    println!(
                        "  {} (pages {}-{}) -> {}",
                        output.header,
                        output.start_page + 1,
                        output.end_page + 1,
                        output.path.display()
                    );
                }
            }
            Err(e) => {
                error!(input = %input.display(), error = %e, "processing failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} input(s) failed", inputs.len());
    }
    Ok(())
}

fn check_engine() -> anyhow::Result<()> {
    let engine = TesseractEngine::new();
    if engine.is_available() {
        println!("OCR engine: {} available", engine.name());
    } else {
        println!(
            "OCR engine: {} NOT available (install tesseract-ocr)",
            engine.name()
        );
    }
    match bind_pdfium() {
        Ok(_) => println!("PDF library: PDFium available"),
        Err(e) => println!("PDF library: NOT available ({e})"),
    }
    Ok(())
}
