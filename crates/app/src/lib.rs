use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use genvid_core::admission::{AdmissionController, AdmissionPolicy};
use genvid_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use genvid_core::engine::{GenerationParams, WorkerSampler};
use genvid_core::executor::JobExecutor;
use genvid_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use genvid_core::server::{app_router, AppState};
use genvid_core::store::ClaimStore;

#[derive(Parser)]
#[command(
    name = "genvid",
    about = "HTTP front end for long-running video generation jobs",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Model weights directory (overrides config and MODEL_BASE)"
    )]
    model_base: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    Generate(GenerateArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(help = "Text prompt describing the video to generate")]
    prompt: String,
    #[arg(
        short = 'o',
        long,
        value_name = "DIR",
        help = "Where to write the generated video (defaults to the configured results dir)"
    )]
    output_dir: Option<PathBuf>,
    #[arg(long, help = "Fixed seed for reproducible sampling")]
    seed: Option<i64>,
    #[arg(long, value_name = "PIXELS")]
    width: Option<u32>,
    #[arg(long, value_name = "PIXELS")]
    height: Option<u32>,
    #[arg(long, value_name = "FRAMES", help = "Number of frames to sample")]
    video_length: Option<u32>,
    #[arg(long, value_name = "COUNT", help = "Denoising steps for the run")]
    steps: Option<u32>,
    #[arg(long, value_name = "SCALE")]
    guidance_scale: Option<f64>,
    #[arg(long, value_name = "SHIFT")]
    flow_shift: Option<f64>,
    #[arg(long, value_name = "TEXT", help = "Content to steer sampling away from")]
    negative_prompt: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        resolved_data_dir.as_path(),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(command_name(&cli.command), resolved_data_dir.as_path());

    match cli.command {
        Some(Commands::Generate(args)) => {
            run_generate(args, cli.model_base, resolved_data_dir).await
        }
        None => run_server(cli.port, cli.host, cli.model_base, resolved_data_dir).await,
    }
}

fn command_name(command: &Option<Commands>) -> &'static str {
    match command {
        Some(Commands::Generate(_)) => "generate",
        None => "server",
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        include_noise_filter_when_implicit: true,
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::select_log_filter(&options)
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            eprintln!(
                "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
            );
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(command: &'static str, data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        command,
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config
}

fn apply_cli_overrides(
    config: &mut AppConfig,
    port: Option<u16>,
    host: Option<&str>,
    model_base: Option<&Path>,
) {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host.to_string();
    }
    if let Some(model_base) = model_base {
        config.engine.model_base = model_base.to_path_buf();
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    model_base_override: Option<PathBuf>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let mut config = load_config(&data_dir);
    apply_cli_overrides(
        &mut config,
        port_override,
        host_override.as_deref(),
        model_base_override.as_deref(),
    );

    let state = AppState::from_config(&config)?;
    let app = app_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(%addr, "Starting genvid server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_generate(
    args: GenerateArgs,
    model_base_override: Option<PathBuf>,
    data_dir: PathBuf,
) -> Result<()> {
    let mut config = load_config(&data_dir);
    apply_cli_overrides(&mut config, None, None, model_base_override.as_deref());

    let results_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.paths.results_dir.clone());
    let params = generation_params_from_args(&args);

    // One-shot runs keep admission local to the process; nothing is shared
    // with a running server.
    let store = ClaimStore::in_memory(config.store.claim_ttl());
    let admission = Arc::new(AdmissionController::new(
        store,
        AdmissionPolicy::from_config(&config.store),
    ));
    let sampler = Arc::new(WorkerSampler::new(&config.engine)?);
    let executor = JobExecutor::new(admission, sampler, results_dir);

    info!(prompt = %params.prompt, "Starting one-shot generation");
    let result = executor.run_generation(&params).await?;
    info!(
        video_path = %result.video_path.display(),
        seed = result.seed,
        "Generation complete"
    );
    // Logs go to stderr; the artifact path on stdout is the scriptable result.
    println!("{}", result.video_path.display());
    Ok(())
}

fn generation_params_from_args(args: &GenerateArgs) -> GenerationParams {
    let mut params = GenerationParams::new(args.prompt.clone());
    if let Some(width) = args.width {
        params.width = width;
    }
    if let Some(height) = args.height {
        params.height = height;
    }
    if let Some(video_length) = args.video_length {
        params.video_length = video_length;
    }
    if let Some(steps) = args.steps {
        params.num_inference_steps = steps;
    }
    if let Some(guidance_scale) = args.guidance_scale {
        params.guidance_scale = guidance_scale;
    }
    if let Some(flow_shift) = args.flow_shift {
        params.flow_shift = flow_shift;
    }
    params.seed = args.seed;
    params.negative_prompt = args.negative_prompt.clone();
    params
}


#[cfg(test)]
mod cli_override_tests {
    use super::*;

    #[test]
    fn cli_overrides_replace_config_values() {
        let mut config = AppConfig::default();
        apply_cli_overrides(
            &mut config,
            Some(8080),
            Some("127.0.0.1"),
            Some(Path::new("/weights")),
        );

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.engine.model_base, Path::new("/weights"));
    }

    #[test]
    fn absent_cli_overrides_keep_config_values() {
        let mut config = AppConfig::default();
        let original = config.clone();

        apply_cli_overrides(&mut config, None, None, None);
        assert_eq!(config, original);
    }
}
