//! anchor-infer binary
//!
//! Drives the inference session layer from the command line against the
//! loopback runtime.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use anchor_infer::inference::ProgressCallback;
use anchor_infer::{
    format_error_message, AnchorConfig, GenerationEvent, GenerationOptions, LoopbackRuntime,
    ModelRuntime, SessionError, SessionFacade, UserAction,
};

#[derive(Parser)]
#[command(
    name = "anchor-infer",
    version,
    about = "Worker-hosted LLM inference session",
    long_about = None
)]
struct Cli {
    /// Path to configuration file (overrides anchor-infer.{toml,json})
    #[arg(long, global = true, env = "ANCHOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log at info level instead of warn
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a model and answer a prompt
    Chat {
        prompt: String,

        /// Model id (defaults to session.default_model)
        #[arg(long)]
        model: Option<String>,

        /// Print fragments as they are generated
        #[arg(long)]
        stream: bool,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        temperature: Option<f32>,
    },
    /// Load a model and print session info
    Info {
        #[arg(long)]
        model: Option<String>,
    },
    /// Print the effective configuration as JSON
    Config,
}

/// Load AnchorConfig from file path or default locations
fn load_config(path: Option<&Path>) -> Result<AnchorConfig> {
    match path {
        Some(p) => {
            info!("Loading config from: {}", p.display());
            AnchorConfig::from_file(p)
                .with_context(|| format!("Failed to load config from {}", p.display()))
        }
        None => match AnchorConfig::load() {
            Ok(config) => Ok(config),
            Err(e) => {
                info!("No usable config found ({}), using defaults", e);
                Ok(AnchorConfig::default())
            }
        },
    }
}

fn init_logging(verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_log_level = if verbose {
        "anchor_infer=info"
    } else {
        "anchor_infer=warn"
    };
    let filter = EnvFilter::builder().parse_lossy(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_level.to_string()),
    );

    if let Ok(log_dir) = std::env::var("ANCHOR_LOG_DIR") {
        // Daily rotation
        let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "anchor-infer.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(non_blocking)
            .init();
        info!("File logging enabled to {}/anchor-infer.log", log_dir);
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}

fn build_facade(config: AnchorConfig) -> Result<SessionFacade> {
    SessionFacade::builder()
        .config(config)
        .runtime_factory(|| -> Result<Arc<dyn ModelRuntime>> {
            Ok(Arc::new(LoopbackRuntime::new()))
        })
        .build()
}

fn progress_printer() -> ProgressCallback {
    Arc::new(|percent: u8| {
        eprint!("\rLoading model... {:>3}%", percent);
        if percent == 100 {
            eprintln!();
        }
    })
}

async fn load(facade: &SessionFacade, model: Option<&str>) -> Result<()> {
    match facade.load_model(model, Some(progress_printer())).await {
        Ok(meta) => {
            info!(
                session_id = %meta.session_id,
                backend = %meta.backend,
                precision = %meta.precision_profile,
                "Model loaded"
            );
            Ok(())
        }
        Err(e) => {
            eprintln!();
            eprintln!("{}", format_error_message(&e, UserAction::LoadingModel));
            if e.offers_retry() {
                eprintln!("Run the command again to retry.");
            }
            Err(e.into())
        }
    }
}

async fn chat(
    facade: &SessionFacade,
    prompt: String,
    model: Option<String>,
    stream: bool,
    options: GenerationOptions,
) -> Result<()> {
    load(facade, model.as_deref()).await?;

    let result: Result<String, SessionError> = if stream {
        let mut events = facade.generate_stream(prompt, Some(options))?;
        let mut stdout = std::io::stdout();
        loop {
            match events.next().await {
                Some(Ok(GenerationEvent::Fragment(text))) => {
                    print!("{}", text);
                    stdout.flush()?;
                }
                Some(Ok(GenerationEvent::Complete(text))) => {
                    println!();
                    break Ok(text);
                }
                Some(Err(e)) => break Err(e),
                None => break Err(SessionError::channel("stream ended without completion")),
            }
        }
    } else {
        facade.generate(prompt, Some(options), None).await.map(|text| {
            println!("{}", text);
            text
        })
    };

    result.map(|_| ()).map_err(|e| {
        eprintln!("{}", format_error_message(&e, UserAction::GeneratingAnswer));
        e.into()
    })
}

async fn run(cli: Cli, config: AnchorConfig) -> Result<()> {
    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Info { model } => {
            let facade = build_facade(config)?;
            let outcome = load(&facade, model.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&facade.info().await)?);
            facade.shutdown();
            outcome
        }
        Command::Chat {
            prompt,
            model,
            stream,
            max_tokens,
            temperature,
        } => {
            let mut options = config.generation_options();
            if let Some(max_tokens) = max_tokens {
                options.max_output_tokens = max_tokens;
            }
            if let Some(temperature) = temperature {
                options.temperature = temperature;
            }

            let facade = build_facade(config)?;
            let outcome = tokio::select! {
                outcome = chat(&facade, prompt, model, stream, options) => outcome,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    Ok(())
                }
            };
            facade.shutdown();
            outcome
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep the guard alive for the entire program lifetime
    let _log_guard = init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    config
        .validate()
        .context("Configuration validation failed")?;

    info!("anchor-infer v{} starting up", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    runtime.block_on(run(cli, config))
}
