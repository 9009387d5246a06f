use clap::ValueEnum;
use ratchet_application::runtime::ShutdownSignal;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// `RATCHET_LOG` takes precedence over `--log-level`.
pub fn init_tracing(log_level: &str, format: LogFormat) -> Result<(), String> {
    let directives = std::env::var("RATCHET_LOG").unwrap_or_else(|_| log_level.to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(&directives)
        .map_err(|err| format!("invalid log filter '{directives}': {err}"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_names(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

#[cfg(feature = "prometheus")]
const LATENCY_BUCKETS_MS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

#[cfg(feature = "prometheus")]
fn describe_metrics() {
    metrics::describe_counter!("ratchet.bars.inserted_total", "Bars written at period boundaries.");
    metrics::describe_counter!("ratchet.ticks.malformed_total", "Stream frames skipped as malformed.");
    metrics::describe_counter!("ratchet.trailing.modified_total", "Protective triggers raised in place.");
    metrics::describe_counter!("ratchet.trailing.replaced_total", "Protective orders replaced on a raise.");
    metrics::describe_gauge!("ratchet.stream.connected", "1 while the tick stream is connected.");
    metrics::describe_histogram!("ratchet.bars.persist_ms", metrics::Unit::Milliseconds, "Boundary write latency.");
}

/// Serves `/metrics` on `addr` for the lifetime of the process.
#[cfg(feature = "prometheus")]
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<(), String> {
    use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

    let Some(addr) = addr else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "ratchet")
        .set_buckets_for_metric(Matcher::Suffix("_ms".to_string()), LATENCY_BUCKETS_MS)
        .map_err(|err| format!("invalid latency buckets: {err}"))?
        .install()
        .map_err(|err| format!("metrics listener on {addr}: {err}"))?;
    describe_metrics();
    tracing::info!(%addr, "serving prometheus metrics");
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<(), String> {
    match addr {
        Some(addr) => Err(format!(
            "--metrics-addr {addr} needs a build with the `prometheus` feature"
        )),
        None => Ok(()),
    }
}

/// Triggers `shutdown` on Ctrl-C from a dedicated signal thread.
pub fn install_ctrl_c(shutdown: ShutdownSignal) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("failed to build signal runtime: {err}"))?;
    std::thread::Builder::new()
        .name("ratchet-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                    shutdown.trigger();
                }
            });
        })
        .map_err(|err| format!("failed to spawn signal thread: {err}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_stay_off_without_an_address() {
        assert!(init_metrics(None).is_ok());
    }

    #[cfg(not(feature = "prometheus"))]
    #[test]
    fn address_without_exporter_is_an_error() {
        let err = init_metrics(Some("127.0.0.1:9464".parse().expect("addr"))).expect_err("no exporter");
        assert!(err.contains("prometheus"));
    }
}
