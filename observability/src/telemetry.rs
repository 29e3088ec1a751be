use crate::conf::{execution_environment, ExecutionEnvironment, TelemetryConfig, ENVIRONMENT};
use anyhow::Context;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::{layer, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

const LOCAL_DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn,alloy_transport_http=warn";
const DEFAULT_FILTER: &str = "info";

/// Keeps the background log file writer alive. Buffered lines are flushed when
/// this is dropped, so hold it until the process exits.
#[must_use]
pub struct TracingGuard {
    _file: Option<WorkerGuard>,
}

/// Filter resolution: the configured filter, then `RUST_LOG`, then a default that
/// depends on the `RUN_MODE`.
pub fn make_env_filter(settings: &TelemetryConfig) -> anyhow::Result<EnvFilter> {
    if let Some(filter) = settings.log_filter() {
        return EnvFilter::try_new(filter)
            .with_context(|| format!("invalid log filter {filter:?}"));
    }
    let fallback = match *ENVIRONMENT {
        ExecutionEnvironment::Integration | ExecutionEnvironment::Local => LOCAL_DEFAULT_FILTER,
        _ => DEFAULT_FILTER,
    };
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
}

/// Install the global subscriber. Can only succeed once per process.
pub fn init_tracing(settings: &TelemetryConfig) -> anyhow::Result<TracingGuard> {
    let env_filter = make_env_filter(settings)?;

    let (text_layer, json_layer) = if settings.json_logs() {
        (None, Some(fmt_layer().json().with_current_span(true)))
    } else {
        (Some(fmt_layer()), None)
    };

    let (file_layer, file_guard) = match settings.log_file() {
        Some(path) => {
            let appender = file_appender(path)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .json()
                .with_current_span(true)
                .with_span_list(true);
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize tracing")?;

    info!(
        service = settings.tracing_service_name(),
        environment = %execution_environment(),
        "tracing initialized"
    );
    Ok(TracingGuard { _file: file_guard })
}

fn file_appender(path: &Path) -> anyhow::Result<RollingFileAppender> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log file {} has no file name", path.display()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory)
        .with_context(|| format!("cannot create log directory {}", directory.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy().as_ref())
        .build(directory)
        .with_context(|| format!("cannot open log file {}", path.display()))
}

fn fmt_layer<S>() -> Layer<S> {
    layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NONE)
}
