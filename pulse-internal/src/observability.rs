use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Initializes the tracing subscriber. Honors `RUST_LOG` when set, otherwise
/// logs the gateway crates at `info` and dependencies at `warn`.
pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,gateway=info,pulse_internal=info"));

    let log_layer = match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })
}

/// Installs the global Prometheus recorder and returns the handle the
/// `/metrics` endpoint renders from.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus metrics recorder: {e}"),
        })
    })
}
