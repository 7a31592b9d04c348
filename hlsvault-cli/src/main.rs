use std::path::Path;
use std::time::Duration;

use clap::Parser;
use hlsvault_engine::proxy::{ProxyAuth, ProxyConfig};
use hlsvault_engine::{DownloadOrchestrator, EngineConfig, TaskRequest, TaskStatus};
use mimalloc::MiMalloc;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod cli;
mod error;
mod utils;

use cli::CliArgs;
use error::AppError;
use utils::progress::ProgressReporter;
use utils::{default_output, parse_params};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Time running segments get to settle after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        if let AppError::TaskFailed { report, .. } = &e {
            for action in &report.suggested_actions {
                eprintln!("  hint: {action}");
            }
        }
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();
    init_logging(args.verbose, args.log_json)?;

    let config = build_config(&args)?;
    let engine = DownloadOrchestrator::new(config)?;
    engine.start()?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.url));
    let mut request = TaskRequest::new(args.url.clone(), output)
        .with_priority(args.priority)
        .with_variant_policy(args.variant);
    if let Some(task_id) = &args.task_id {
        request = request.with_task_id(task_id.clone());
    }
    for (name, value) in parse_params(&args.headers)? {
        request = request.with_header(name, value);
    }

    // Subscribe before the task is queued so no event is missed.
    let events = engine.subscribe();
    let task_id = engine.add_task(request)?;
    info!(task_id = %task_id, url = %args.url, "Task queued");

    let span = info_span!("download", task = %task_id);
    let reporter = ProgressReporter::new(task_id.clone(), span.clone(), !args.no_progress);
    let progress = tokio::spawn(reporter.run(events).instrument(span));

    let outcome = tokio::select! {
        task = engine.wait_for(&task_id) => Some(task?),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        None => {
            warn!("Interrupted, pausing download");
            engine.shutdown(SHUTDOWN_GRACE).await;
            progress.abort();
            info!("Resume with: --task-id {task_id}");
            Ok(())
        }
        Some(task) => {
            engine.shutdown(SHUTDOWN_GRACE).await;
            let _ = progress.await;
            let metrics = engine.metrics();
            info!(
                segments = task.completed_segment_count,
                bytes = task.bytes_downloaded,
                retries = metrics.segment_retries,
                resumed = metrics.segments_resumed,
                "Task {task_id} finished with status {}",
                task.status
            );
            match task.status {
                TaskStatus::Completed => {
                    info!("Saved to {}", task.output_path.display());
                    Ok(())
                }
                TaskStatus::Cancelled => Err(AppError::Cancelled(task_id)),
                TaskStatus::Paused => {
                    info!("Resume with: --task-id {task_id}");
                    Ok(())
                }
                _ => match task.last_error {
                    Some(report) => Err(AppError::TaskFailed { task_id, report }),
                    None => Err(AppError::InvalidInput(format!(
                        "task {task_id} ended as {}",
                        task.status
                    ))),
                },
            }
        }
    }
}

fn init_logging(verbose: bool, json: bool) -> Result<(), AppError> {
    let default_directive = if verbose {
        "hlsvault=debug,hlsvault_engine=debug"
    } else {
        "hlsvault=info,hlsvault_engine=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        let indicatif_layer = IndicatifLayer::new();
        let writer = indicatif_layer.get_stderr_writer();
        registry
            .with(fmt::layer().json().with_writer(writer))
            .with(indicatif_layer)
            .try_init()
    } else {
        let indicatif_layer = IndicatifLayer::new();
        let writer = indicatif_layer.get_stderr_writer();
        registry
            .with(fmt::layer().with_writer(writer))
            .with(indicatif_layer)
            .try_init()
    };
    result.map_err(|e| AppError::Initialization(e.to_string()))
}

fn load_config(path: &Path) -> Result<EngineConfig, AppError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn build_config(args: &CliArgs) -> Result<EngineConfig, AppError> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };

    if let Some(dir) = &args.output_dir {
        config.paths.output_dir = dir.clone();
    }
    if let Some(dir) = &args.temp_dir {
        config.paths.temp_dir = dir.clone();
    }
    if let Some(dir) = &args.state_dir {
        config.paths.state_dir = dir.clone();
    }
    if let Some(workers) = args.workers {
        config.concurrency.max_workers_per_task = workers;
    }
    if let Some(attempts) = args.max_attempts {
        config.retry.max_attempts_per_segment = attempts;
    }
    if let Some(tolerance) = args.tolerate_failures {
        config.retry.segment_failure_tolerance = tolerance;
    }
    if let Some(secs) = args.connect_timeout {
        config.http.connect_timeout_ms = secs.saturating_mul(1000);
    }
    if let Some(secs) = args.budget {
        config.task_budget_ms = Some(secs.saturating_mul(1000));
    }
    if let Some(user_agent) = &args.user_agent {
        config.http.user_agent = user_agent.clone();
    }
    if args.no_system_proxy {
        config.http.use_system_proxy = false;
    }
    if args.insecure {
        config.http.danger_accept_invalid_certs = true;
    }

    if let Some(url) = &args.proxy {
        let auth = match (&args.proxy_user, &args.proxy_pass) {
            (Some(username), Some(password)) => Some(ProxyAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(AppError::InvalidInput(
                    "--proxy-user and --proxy-pass must be given together".to_string(),
                ));
            }
        };
        info!(proxy = %url, proxy_type = ?args.proxy_type, "Using proxy");
        config.http.proxy = Some(ProxyConfig {
            url: url.clone(),
            proxy_type: args.proxy_type,
            auth,
        });
    }

    config.validate()?;
    Ok(config)
}
