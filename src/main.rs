// SPDX-License-Identifier: MIT
use anyhow::{Context, Result};
use dice_service::routes;
use dice_service::shutdown::AggregateError;
use dice_service::telemetry::{init_telemetry, TelemetryConfig, DEFAULT_SHUTDOWN_TIMEOUT};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = init_telemetry(TelemetryConfig::default())?;

    // Telemetry is drained on every exit path so buffered batches are not
    // lost, then server and drain outcomes are both surfaced.
    let served = serve().await;
    let drained = telemetry.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT);
    combine_exit_errors(served, drained)
}

/// Surfaces both the server outcome and the telemetry-drain outcome. When
/// both fail, neither error is dropped: the drain failure is attached to the
/// server error.
fn combine_exit_errors(served: Result<()>, drained: Result<(), AggregateError>) -> Result<()> {
    match (served, drained) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(served), Ok(())) => Err(served),
        (Ok(()), Err(drained)) => Err(drained.into()),
        (Err(served), Err(drained)) => {
            Err(served.context(format!("additionally, telemetry drain failed: {drained}")))
        }
    }
}

async fn serve() -> Result<()> {
    let addr =
        std::env::var("DICE_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("HTTP server is listening on {addr}");

    axum::serve(listener, routes::router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for interrupt signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dice_service::shutdown::ShutdownRegistry;
    use opentelemetry_sdk::error::OTelSdkError;
    use std::time::Duration;

    fn drain_error(message: &str) -> AggregateError {
        let mut registry = ShutdownRegistry::new();
        let message = message.to_string();
        registry.register(move |_| Err(OTelSdkError::InternalFailure(message)));
        registry
            .shutdown(Duration::from_secs(1))
            .expect_err("teardown failure surfaces")
    }

    #[test]
    fn both_outcomes_succeeding_is_success() {
        assert!(combine_exit_errors(Ok(()), Ok(())).is_ok());
    }

    #[test]
    fn lone_failures_pass_through() {
        let err = combine_exit_errors(Err(anyhow::anyhow!("bind refused")), Ok(()))
            .expect_err("server error surfaces");
        assert!(format!("{err:#}").contains("bind refused"));

        let err = combine_exit_errors(Ok(()), Err(drain_error("flush failed")))
            .expect_err("drain error surfaces");
        assert!(format!("{err:#}").contains("flush failed"));
    }

    #[test]
    fn drain_failure_is_not_dropped_when_server_also_failed() {
        let err = combine_exit_errors(
            Err(anyhow::anyhow!("bind refused")),
            Err(drain_error("collector unreachable")),
        )
        .expect_err("both errors surface");
        let rendered = format!("{err:#}");
        assert!(rendered.contains("bind refused"));
        assert!(rendered.contains("collector unreachable"));
    }
}
