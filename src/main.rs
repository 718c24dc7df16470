use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use bunker_transcode::io::{RawFrameReader, SharedReader, StreamWriter};
use bunker_transcode::observability::{MetricsCollector, log_snapshot};
#[cfg(feature = "metrics-server")]
use bunker_transcode::observability::server::MetricsServer;
use bunker_transcode::pipeline::StageRegistry;
use bunker_transcode::recipe::Recipe;
use bunker_transcode::runner::{RunReport, Session, output_kind};
use bunker_transcode::timestamp::{TimecodeSink, TimecodeWriter};
use bunker_transcode::validation::validate_recipe;
use clap::{Parser, Subcommand};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match command {
        Commands::Run {
            recipe,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            report,
            otlp_endpoint: _,
        } => run_recipe(
            recipe,
            MetricsOutputs {
                print: print_metrics,
                json: metrics_json,
                prometheus: metrics_prometheus,
                listen: metrics_listen,
            },
            report,
        ),
        Commands::Plan { recipe } => plan_recipe(recipe),
        Commands::Validate { recipe } => validate_recipe_cmd(recipe),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "bunker-transcode")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct MetricsOutputs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
    listen: Option<String>,
}

fn load_checked(recipe_path: &Path, registry: &StageRegistry) -> Result<Recipe> {
    let mut recipe = Recipe::load(recipe_path)?;
    let report = validate_recipe(&recipe, registry);
    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ));
    }
    if let Some(base) = recipe_path.parent() {
        recipe.resolve_paths(base);
    }
    Ok(recipe)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn run_recipe(recipe_path: PathBuf, metrics: MetricsOutputs, report_path: Option<PathBuf>) -> Result<()> {
    let registry = build_registry();
    let recipe = load_checked(&recipe_path, &registry)?;
    let started_at = chrono::Utc::now();

    let input = File::open(&recipe.input.path)
        .with_context(|| format!("Failed to open input: {}", recipe.input.path.display()))?;
    let reader: SharedReader = Arc::new(Mutex::new(RawFrameReader::new(
        BufReader::new(input),
        recipe.input.frame_info(),
    )));

    let timecode: Option<Box<dyn TimecodeSink>> = match &recipe.output.timecode {
        Some(path) => {
            create_parent(path)?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create timecode file: {}", path.display()))?;
            Some(Box::new(TimecodeWriter::new(BufWriter::new(file))?))
        }
        None => None,
    };

    let metrics_handle = MetricsCollector::global().clone();
    metrics_handle.reset();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &metrics.listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &metrics.listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let mut session = Session::open(&recipe, &registry, reader, timecode, metrics_handle.clone())?;

    create_parent(&recipe.output.path)?;
    let output = File::create(&recipe.output.path).with_context(|| {
        format!("Failed to create output: {}", recipe.output.path.display())
    })?;
    let mut writer = StreamWriter::new(BufWriter::new(output), output_kind(&recipe));

    let summary = session
        .pipeline
        .run(&mut writer)
        .with_context(|| format!("Pipeline failed for {}", recipe_path.display()))?;
    writer
        .into_inner()
        .flush()
        .with_context(|| format!("Failed to flush output: {}", recipe.output.path.display()))?;
    session.pipeline.release().context("Failed to release work surfaces")?;

    info!(
        input = %recipe.input.path.display(),
        output = %recipe.output.path.display(),
        frames = summary.frames_written,
        "Pipeline completed"
    );

    if metrics.print || metrics.json.is_some() || metrics.prometheus.is_some() {
        let snapshot = metrics_handle.snapshot();
        if metrics.print {
            log_snapshot(&snapshot);
        }
        if let Some(path) = metrics.json {
            create_parent(&path)?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = metrics.prometheus {
            create_parent(&path)?;
            std::fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    if let Some(path) = report_path {
        create_parent(&path)?;
        let report = RunReport::new(recipe_path.display().to_string(), started_at, &session, summary);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create report: {}", path.display()))?;
        to_writer_pretty(file, &report)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!(report = %path.display(), "Run report written");
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    Ok(())
}

/// Negotiate pools without touching the input and print the result.
fn plan_recipe(recipe_path: PathBuf) -> Result<()> {
    let registry = build_registry();
    let recipe = load_checked(&recipe_path, &registry)?;
    let reader: SharedReader = Arc::new(Mutex::new(RawFrameReader::new(
        std::io::empty(),
        recipe.input.frame_info(),
    )));
    let session = Session::open(&recipe, &registry, reader, None, MetricsCollector::new())?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    to_writer_pretty(&mut out, &session.plans).context("Failed to print allocation plan")?;
    writeln!(out)?;
    Ok(())
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn validate_recipe_cmd(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = build_registry();
    let report = validate_recipe(&recipe, &registry);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn build_registry() -> StageRegistry {
    StageRegistry::with_defaults()
}

#[derive(Parser)]
#[command(
    name = "bunker-transcode",
    version,
    about = "Hardware video transcoding pipeline runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a recipe to completion.
    Run {
        recipe: PathBuf,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        /// Write a JSON run report with pool plans and stage counters.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Print the negotiated work-surface pools.
    Plan { recipe: PathBuf },
    Validate { recipe: PathBuf },
    ListStages,
}
