//! Inbound loop: broker messages to the platform queue.

use crate::error::BridgeError;
use crate::shutdown_requested;
use mqtt_bridge_core::{translate, Message, RoutingTables};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Topic it was published on
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

/// Stream of messages received on subscribed topics.
pub trait InboundSource: Send {
    /// Wait for the next message.
    ///
    /// `Ok(None)` means the stream has ended; `Err` means the transport broke.
    fn next_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<Inbound>, BridgeError>> + Send;
}

/// Translates broker messages into internal messages.
pub struct Reader {
    routes: Arc<RoutingTables>,
    messages: mpsc::Sender<Message>,
}

impl Reader {
    /// Create a reader producing onto `messages`.
    #[must_use]
    pub fn new(routes: Arc<RoutingTables>, messages: mpsc::Sender<Message>) -> Self {
        Self { routes, messages }
    }

    /// Run until shutdown, the end of the stream, or a transport failure.
    ///
    /// Messages that cannot be translated are logged and dropped. Pushing to
    /// a full platform queue suspends the loop.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Stream`] if the broker stream breaks.
    pub async fn run<S: InboundSource>(
        self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        loop {
            let next = tokio::select! {
                () = shutdown_requested(&mut shutdown) => {
                    tracing::info!("Stopping reader");
                    return Ok(());
                }
                next = source.next_message() => next,
            };

            let inbound = match next {
                Ok(Some(inbound)) => inbound,
                Ok(None) => {
                    tracing::info!("Broker stream ended, stopping reader");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            for message in self.dispatch(&inbound) {
                tokio::select! {
                    () = shutdown_requested(&mut shutdown) => {
                        tracing::info!("Stopping reader");
                        return Ok(());
                    }
                    sent = self.messages.send(message) => {
                        if sent.is_err() {
                            tracing::warn!("Platform queue closed, stopping reader");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Translate one broker message for every metric routed from its topic.
    ///
    /// Failures are logged per metric; other metrics on the topic still
    /// produce messages.
    #[must_use]
    pub fn dispatch(&self, inbound: &Inbound) -> Vec<Message> {
        let Some(targets) = self.routes.inbound(&inbound.topic) else {
            tracing::warn!(topic = %inbound.topic, "Skipping unexpected topic");
            return Vec::new();
        };

        let mut messages = Vec::with_capacity(targets.len());
        for target in targets {
            if !target.metric.access.is_readable() {
                tracing::warn!(topic = %inbound.topic, metric = %target.metric.name, "Skipping non-readable metric");
                continue;
            }

            match translate::inbound(target, &inbound.payload) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        topic = %inbound.topic,
                        metric = %target.metric.name,
                        payload = %String::from_utf8_lossy(&inbound.payload),
                        "Failed to translate inbound message"
                    );
                }
            }
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_bridge_core::Configuration;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct ScriptedSource {
        items: VecDeque<Result<Inbound, BridgeError>>,
        pending_when_empty: bool,
    }

    impl ScriptedSource {
        fn new(items: Vec<Result<Inbound, BridgeError>>) -> Self {
            Self {
                items: items.into(),
                pending_when_empty: false,
            }
        }

        fn pending(mut self) -> Self {
            self.pending_when_empty = true;
            self
        }
    }

    impl InboundSource for ScriptedSource {
        async fn next_message(&mut self) -> Result<Option<Inbound>, BridgeError> {
            match self.items.pop_front() {
                Some(item) => item.map(Some),
                None if self.pending_when_empty => std::future::pending().await,
                None => Ok(None),
            }
        }
    }

    fn inbound(topic: &str, payload: &str) -> Result<Inbound, BridgeError> {
        Ok(Inbound {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        })
    }

    fn routes() -> Arc<RoutingTables> {
        let config = Configuration::from_json_str(
            &json!({
                "connection": {"ip": "localhost"},
                "payloads": [
                    {"topic": "sensors/temp", "timestamp": {"field_name": "ts", "format": "s"}},
                    {"topic": "out/x"}
                ],
                "metrics_map": [
                    {
                        "name": "temp", "data_type": "float32", "asset_name": "pump-1", "access": "RO",
                        "configuration": {"topic": "sensors/temp", "mapping": [{"external": "temp", "internal": "value"}]}
                    },
                    {
                        "name": "temp_raw", "data_type": "object", "asset_name": "pump-1", "access": "RW",
                        "configuration": {"topic": "sensors/temp"}
                    },
                    {
                        "name": "x", "data_type": "float32", "asset_name": "A", "access": "WO",
                        "configuration": {"topic": "out/x"}
                    }
                ]
            })
            .to_string(),
        )
        .unwrap();
        Arc::new(RoutingTables::new(&config).unwrap())
    }

    async fn run_to_end(source: ScriptedSource) -> (Result<(), BridgeError>, Vec<Message>) {
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = Reader::new(routes(), tx).run(source, shutdown_rx).await;

        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        (result, messages)
    }

    #[tokio::test]
    async fn mapped_message_with_timestamp() {
        let (result, messages) = run_to_end(ScriptedSource::new(vec![inbound(
            "sensors/temp",
            r#"{"ts":1700000000,"temp":21.5}"#,
        )]))
        .await;

        tokio_test::assert_ok!(result);
        let mapped = messages.iter().find(|m| m.header.name == "temp").unwrap();
        assert_eq!(mapped.fields["value"], json!(21.5));
        assert_eq!(mapped.fields.len(), 1);
        assert_eq!(mapped.header.time_of_validity, 1_700_000_000_000_000_000);
    }

    #[tokio::test]
    async fn shared_topic_produces_one_message_per_metric() {
        let (result, messages) = run_to_end(ScriptedSource::new(vec![inbound(
            "sensors/temp",
            r#"{"ts":1700000000,"temp":21.5}"#,
        )]))
        .await;

        tokio_test::assert_ok!(result);
        let names: Vec<&str> = messages.iter().map(|m| m.header.name.as_str()).collect();
        assert_eq!(names, vec!["temp", "temp_raw"]);

        let raw = &messages[1];
        assert_eq!(raw.fields["temp"], json!(21.5));
        assert_eq!(raw.fields["ts"], json!(1_700_000_000));
    }

    #[tokio::test]
    async fn unexpected_topic_is_skipped() {
        let (result, messages) = run_to_end(ScriptedSource::new(vec![
            inbound("foo/bar", r#"{"temp":1}"#),
            inbound("sensors/temp", r#"{"ts":1,"temp":2}"#),
        ]))
        .await;

        tokio_test::assert_ok!(result);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.header.time_of_validity == 1_000_000_000));
    }

    #[tokio::test]
    async fn write_only_topic_produces_nothing() {
        let (result, messages) =
            run_to_end(ScriptedSource::new(vec![inbound("out/x", r#"{"value":1}"#)])).await;

        tokio_test::assert_ok!(result);
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn bad_payload_does_not_stop_the_loop() {
        let (result, messages) = run_to_end(ScriptedSource::new(vec![
            inbound("sensors/temp", "not json"),
            inbound("sensors/temp", r#"{"temp":3}"#),
            inbound("sensors/temp", r#"{"ts":5,"temp":4}"#),
        ]))
        .await;

        tokio_test::assert_ok!(result);
        // the second payload lacks "ts" for both metrics
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].fields["value"], json!(4));
    }

    #[tokio::test]
    async fn stream_failure_is_escalated() {
        let (result, messages) = run_to_end(ScriptedSource::new(vec![
            inbound("sensors/temp", r#"{"ts":1,"temp":2}"#),
            Err(BridgeError::Stream("connection reset".to_string())),
            inbound("sensors/temp", r#"{"ts":1,"temp":2}"#),
        ]))
        .await;

        assert!(matches!(result, Err(BridgeError::Stream(_))));
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_while_waiting_for_broker() {
        let (tx, _rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(
            Reader::new(routes(), tx).run(ScriptedSource::new(Vec::new()).pending(), shutdown_rx),
        );

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        tokio_test::assert_ok!(result);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_until_shutdown() {
        let (tx, mut rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let source = ScriptedSource::new(vec![
            inbound("sensors/temp", r#"{"ts":1,"temp":2}"#),
            inbound("sensors/temp", r#"{"ts":1,"temp":2}"#),
        ])
        .pending();
        let handle = tokio::spawn(Reader::new(routes(), tx).run(source, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert!(rx.try_recv().is_ok());

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        tokio_test::assert_ok!(result);
    }
}
