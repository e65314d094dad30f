//! Outbound loop: platform queue to broker publishes.

use crate::connection::ConnectionManager;
use crate::error::BridgeError;
use crate::shutdown_requested;
use mqtt_bridge_core::{translate, Message, Qos, RoutingTables};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Sink for outbound payloads.
pub trait Publish: Send + Sync + 'static {
    /// Publish `payload` on `topic`.
    fn publish(
        &self,
        topic: String,
        qos: Qos,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;
}

impl Publish for ConnectionManager {
    async fn publish(&self, topic: String, qos: Qos, payload: Vec<u8>) -> Result<(), BridgeError> {
        ConnectionManager::publish(self, topic, qos, payload).await
    }
}

/// Translates internal messages into broker publishes.
pub struct Writer<P> {
    routes: Arc<RoutingTables>,
    publisher: Arc<P>,
}

impl<P: Publish> Writer<P> {
    /// Create a writer publishing through `publisher`.
    #[must_use]
    pub fn new(routes: Arc<RoutingTables>, publisher: Arc<P>) -> Self {
        Self { routes, publisher }
    }

    /// Run until shutdown or until the platform queue closes.
    pub async fn run(
        self,
        mut messages: mpsc::Receiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let message = tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    tracing::info!("Stopping writer");
                    break;
                }
                message = messages.recv() => message,
            };

            let Some(message) = message else {
                tracing::info!("Platform queue closed, stopping writer");
                break;
            };

            self.dispatch(&message);
        }
    }

    /// Start one publish per writable metric matching the message identity.
    ///
    /// Publishes run as detached tasks; their failures are only logged.
    /// Returns the number of publishes started.
    pub fn dispatch(&self, message: &Message) -> usize {
        let id = message.header.metric_id();

        let Some(targets) = self.routes.outbound(&id) else {
            tracing::warn!(metric = %id, "Skipping unexpected message");
            return 0;
        };

        let mut started = 0;
        for target in targets {
            if !target.metric.access.is_writable() {
                tracing::warn!(metric = %id, "Skipping non-writable metric");
                continue;
            }

            let payload = match translate::outbound(target, message) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, metric = %id, message = ?message, "Failed to translate outbound message");
                    continue;
                }
            };

            let publisher = Arc::clone(&self.publisher);
            let topic = target.payload.topic.clone();
            let qos = target.payload.qos;

            tokio::spawn(async move {
                if let Err(e) = publisher.publish(topic.clone(), qos, payload).await {
                    tracing::warn!(error = %e, topic, "Publish failed");
                }
            });
            started += 1;
        }

        started
    }
}
