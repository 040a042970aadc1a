//! Telemetry helpers: the global tracing subscriber, the Prometheus recorder
//! and thread spawning that keeps the current dispatcher.

use std::{io, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps the Chrome trace writer alive; dropping it flushes the file.
pub(crate) struct TelemetryGuard {
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Install the global metrics recorder once and return its handle.
pub(crate) fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).context("metrics recorder already installed")?;

    let upkeep_handle = handle.clone();
    let upkeep = spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })
    .context("failed to spawn prometheus upkeep thread")?;
    let _ = PROM_UPKEEP_THREAD.set(upkeep);

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// The Prometheus handle, when the recorder has been installed.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` drives the filter (default `info`). A Chrome trace of spans is
/// written alongside when requested.
pub(crate) fn init(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_filter(env_filter);

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let installed = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
        .with(fmt_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    TelemetryGuard {
        _chrome_guard: chrome_guard,
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Async)
        .build();
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_run_and_return() {
        let handle = spawn_thread("relocate-test", || 2 + 2).unwrap();
        assert_eq!(handle.join().unwrap(), 4);
    }
}
