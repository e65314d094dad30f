//! Bridge runtime orchestration.

use crate::bus;
use crate::config::AgentConfig;
use anyhow::{Context, Result};
use mqtt_bridge_broker::{BridgeError, ConnectionManager, Reader, Writer};
use mqtt_bridge_core::{Configuration, RoutingTables};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How long shutdown waits for the writer and bus output to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The running bridge: one broker session, one reader, one writer.
pub struct Bridge {
    config: AgentConfig,
    routes: Arc<RoutingTables>,
    connection: Arc<ConnectionManager>,
}

impl Bridge {
    /// Build routing tables and the connection manager.
    ///
    /// # Errors
    ///
    /// Returns error if the bridge configuration cannot be routed.
    pub fn new(config: AgentConfig, bridge: &Configuration) -> Result<Self> {
        let routes = RoutingTables::new(bridge).context("Failed to build routing tables")?;

        tracing::info!(
            inbound_topics = routes.inbound_topics().len(),
            outbound_metrics = routes.outbound_ids().len(),
            "Routing tables built"
        );

        let connection = ConnectionManager::new(bridge, routes.subscriptions().to_vec())
            .context("Failed to create connection manager")?;

        Ok(Self {
            config,
            routes: Arc::new(routes),
            connection: Arc::new(connection),
        })
    }

    /// Run until Ctrl+C.
    ///
    /// A broken broker stream stops the session, waits the restart delay and
    /// reconnects. The writer and the platform bus survive restarts.
    ///
    /// # Errors
    ///
    /// Returns error if a component cannot be started.
    pub async fn run(self) -> Result<()> {
        tracing::info!(client_id = %self.connection.client_id(), "Starting bridge runtime");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (to_platform, from_reader) = mpsc::channel(self.config.queue_capacity);
        let (to_writer, from_platform) = mpsc::channel(self.config.queue_capacity);

        // stdin blocks, so it gets its own thread rather than a runtime task
        std::thread::Builder::new()
            .name("bus-input".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                if let Err(e) = bus::read_messages(stdin.lock(), &to_writer) {
                    tracing::error!(error = %e, "Failed to read platform bus");
                }
                tracing::info!("Platform bus input closed");
            })
            .context("Failed to spawn bus input thread")?;

        let bus_output = tokio::spawn(bus::write_messages(from_reader, tokio::io::stdout()));

        let writer = tokio::spawn(
            Writer::new(Arc::clone(&self.routes), Arc::clone(&self.connection))
                .run(from_platform, shutdown_rx.clone()),
        );

        tracing::info!("Bridge running, press Ctrl+C to stop");

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            let stream = tokio::select! {
                _ = &mut ctrl_c => break,
                stream = self.connection.connect() => match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::info!(error = %e, "Connection attempt ended");
                        break;
                    }
                },
            };

            let reader = Reader::new(Arc::clone(&self.routes), to_platform.clone());
            let result = tokio::select! {
                _ = &mut ctrl_c => break,
                result = reader.run(stream, shutdown_rx.clone()) => result,
            };

            match result {
                Ok(()) => {
                    tracing::info!("Reader finished");
                    break;
                }
                Err(BridgeError::Stream(e)) => {
                    tracing::error!(
                        error = %e,
                        restart_delay_secs = self.config.restart_delay.as_secs(),
                        "Broker stream failed, restarting session"
                    );
                    self.connection.stop().await;

                    tokio::select! {
                        _ = &mut ctrl_c => break,
                        () = tokio::time::sleep(self.config.restart_delay) => {}
                    }
                }
                Err(e) => {
                    self.connection.stop().await;
                    return Err(e).context("Reader failed");
                }
            }
        }

        tracing::info!("Shutting down");

        let _ = shutdown_tx.send(true);
        self.connection.stop().await;

        if tokio::time::timeout(DRAIN_TIMEOUT, writer).await.is_err() {
            tracing::warn!("Writer did not stop in time");
        }

        drop(to_platform);
        match tokio::time::timeout(DRAIN_TIMEOUT, bus_output).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Failed to write platform bus"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Bus output task failed"),
            Err(_) => tracing::warn!("Bus output did not drain in time"),
        }

        tracing::info!("Bridge stopped");
        Ok(())
    }
}
