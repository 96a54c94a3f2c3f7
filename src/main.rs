//! id-scan - live ID-document capture
//!
//! Command-line front end: analyze a frame, extract fields from recognized
//! text, validate a field set or run a whole scan session against a still
//! image.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use id_scan::capture::StillFrameSource;
use id_scan::config::{default_config_path, load_config, AppConfig, DetectionProfile};
use id_scan::extraction::{DocumentType, ExtractionEngine, FieldName};
use id_scan::pipeline::ScanPipeline;
use id_scan::scan::ScanEvent;
use id_scan::vision::{analyze, FixedTextBackend};
use id_scan::{CapturedImage, Frame, ScanOutcome};

/// id-scan - live ID-document capture
#[derive(Parser, Debug)]
#[command(name = "id-scan")]
#[command(about = "Detect, capture and read ID documents")]
struct Args {
    /// Config file (defaults to the user config file when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the strict detection profile instead of the config file's thresholds
    #[arg(long, global = true)]
    strict: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze one image as a preview frame and print the metrics
    Analyze {
        image: PathBuf,
    },
    /// Extract fields from an image, using text recognized by another tool
    Extract {
        image: PathBuf,
        /// File with the recognized text
        #[arg(long)]
        text: PathBuf,
        /// Confidence reported by the recognizer
        #[arg(long, default_value = "0.8")]
        confidence: f64,
    },
    /// Validate a JSON object of fields against a document type
    Validate {
        fields: PathBuf,
        /// drivers_license, passport or national_id
        #[arg(short, long, default_value = "drivers_license")]
        document_type: String,
    },
    /// Run a scan session using the image as camera preview and capture
    Scan {
        image: PathBuf,
        /// File with the recognized text
        #[arg(long)]
        text: PathBuf,
        #[arg(long, default_value = "0.8")]
        confidence: f64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = resolve_config(&args)?;

    match args.command {
        Command::Analyze { image } => run_analyze(&config, &image),
        Command::Extract {
            image,
            text,
            confidence,
        } => run_extract(&config, &image, &text, confidence),
        Command::Validate {
            fields,
            document_type,
        } => run_validate(&config, &fields, &document_type),
        Command::Scan {
            image,
            text,
            confidence,
        } => run_scan(config, &image, &text, confidence),
    }
}

fn resolve_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => match default_config_path() {
            Ok(path) if path.exists() => {
                info!("Using config {}", path.display());
                load_config(&path)?
            }
            Ok(_) => AppConfig::default(),
            Err(e) => {
                warn!("{}; using defaults", e);
                AppConfig::default()
            }
        },
    };

    if args.strict {
        let strict = AppConfig::for_profile(DetectionProfile::Strict);
        config.profile = strict.profile;
        config.analysis = strict.analysis;
        config.scan = strict.scan;
    }

    config.validate()?;
    Ok(config)
}

fn open_image(path: &Path) -> Result<image::DynamicImage> {
    image::open(path).with_context(|| format!("Failed to open image {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read text {}", path.display()))
}

fn engine_for(config: &AppConfig, text: String, confidence: f64) -> Result<ExtractionEngine> {
    let backend = Arc::new(FixedTextBackend::new(text, confidence));
    Ok(ExtractionEngine::with_schemas(backend, config.schema_registry()?))
}

fn run_analyze(config: &AppConfig, path: &Path) -> Result<()> {
    let frame = Frame::from_image(&open_image(path)?);
    let result = analyze(&frame, &config.analysis)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_extract(config: &AppConfig, image: &Path, text: &Path, confidence: f64) -> Result<()> {
    let engine = engine_for(config, read_text(text)?, confidence)?;
    let captured = CapturedImage::from(open_image(image)?);

    let result = engine.extract(&captured, &config.preprocessing)?;
    let validation = engine.validate(&result.fields, result.document_type);

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "result": result,
            "validation": validation,
        }))?
    );
    Ok(())
}

fn run_validate(config: &AppConfig, fields: &Path, document_type: &str) -> Result<()> {
    let document_type: DocumentType = document_type.parse()?;
    let content = std::fs::read_to_string(fields)
        .with_context(|| format!("Failed to read fields {}", fields.display()))?;
    let fields: BTreeMap<FieldName, String> =
        serde_json::from_str(&content).context("Fields must be a JSON object of field name to value")?;

    let schemas = config.schema_registry()?;
    let result = id_scan::extraction::validate_with_schema(&fields, &schemas.get(document_type));
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_scan(config: AppConfig, image: &Path, text: &Path, confidence: f64) -> Result<()> {
    let engine = engine_for(&config, read_text(text)?, confidence)?;
    let source = Arc::new(StillFrameSource::new(&open_image(image)?));
    let pipeline = ScanPipeline::new(Arc::new(engine), &config);

    let events = pipeline.subscribe();
    let printer = std::thread::spawn(move || {
        for event in events {
            print_event(&event);
        }
    });

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(async {
        let handle = pipeline.start(source, || warn!("Auto-entry timeout: fall back to manual entry"))?;
        anyhow::Ok(handle.wait().await)
    })?;

    // Closing the bus ends the printer
    drop(pipeline);
    let _ = printer.join();

    match outcome {
        ScanOutcome::Success(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        other => anyhow::bail!("Scan did not succeed: {:?}", other),
    }
}

fn print_event(event: &ScanEvent) {
    match event {
        ScanEvent::DocumentDetected(result) | ScanEvent::Positioned(result) | ScanEvent::QualityChanged(result) => {
            info!(
                "{}: quality {:.2}, box {:?}, positioned {}",
                event.name(),
                result.quality,
                result.bounding_box,
                result.is_positioned
            );
        }
        ScanEvent::ScanComplete(Ok(result)) => {
            info!("{}: accepted (confidence {:.2})", event.name(), result.confidence);
        }
        ScanEvent::ScanComplete(Err(failure)) => {
            info!("{}: rejected ({})", event.name(), failure);
        }
    }
}
