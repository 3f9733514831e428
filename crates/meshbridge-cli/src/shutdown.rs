//! Shutdown handling for the bridge process.
//!
//! The first SIGINT/SIGTERM stops the dispatch loop and disconnects the
//! transports; the process then waits out a grace period so disconnect
//! handshakes can finish. A second signal during that period exits at once.

use meshbridge_devices::Bridge;
use std::future::Future;
use std::time::Duration;

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

/// Disconnect the bridge, then wait `grace` unless `interrupt` resolves
/// first. Returns true when interrupted.
pub async fn stop_bridge<F>(bridge: &mut Bridge, grace: Duration, interrupt: F) -> bool
where
    F: Future<Output = ()>,
{
    let graceful = async {
        bridge.shutdown().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        _ = graceful => {
            tracing::info!("Exiting now!");
            false
        }
        _ = interrupt => {
            tracing::warn!("Second signal received, exiting immediately");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_core::BridgeConfig;
    use meshbridge_devices::{MemoryBroker, MemoryMesh};
    use std::sync::Arc;
    use tokio::time::Instant;

    const CONFIG: &str = r#"
        [[devices]]
        address = [2, 37, 3, 0]
        name = "alavalot"
        topic = "nest/zwave/sauna/alavalot"
    "#;

    const GRACE: Duration = Duration::from_millis(1000);

    async fn running_bridge() -> (Bridge, Arc<MemoryBroker>) {
        let config = BridgeConfig::from_toml_str(CONFIG).unwrap();
        let mesh = Arc::new(MemoryMesh::for_devices(&config.devices));
        let broker = Arc::new(MemoryBroker::new());
        let bridge = Bridge::from_config(&config, mesh, broker.clone()).unwrap();
        bridge.start().await.unwrap();
        (bridge, broker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_out_grace_period() {
        let (mut bridge, broker) = running_bridge().await;
        let started = Instant::now();

        let interrupted = stop_bridge(&mut bridge, GRACE, std::future::pending()).await;

        assert!(!interrupted);
        assert!(started.elapsed() >= GRACE);
        assert!(!broker.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_signal_exits_immediately() {
        let (mut bridge, _broker) = running_bridge().await;
        let started = Instant::now();

        let interrupted = stop_bridge(
            &mut bridge,
            GRACE,
            tokio::time::sleep(Duration::from_millis(10)),
        )
        .await;

        assert!(interrupted);
        assert!(started.elapsed() < GRACE);
    }
}
