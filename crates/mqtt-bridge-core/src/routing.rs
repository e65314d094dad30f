//! Routing tables for inbound and outbound dispatch.
//!
//! Built once from a validated [`Configuration`] and read-only afterwards:
//!
//! - inbound: `topic -> [(metric, payload)]` for readable metrics
//! - outbound: `(name, type, asset) -> [(metric, payload)]` for writable metrics
//!
//! A metric whose access mode excludes a direction is left out of that
//! direction's table.

use crate::config::{ConfigError, Configuration, MetricMap, PayloadDefinition, Qos};
use crate::message::MetricId;
use std::collections::HashMap;
use std::sync::Arc;

/// One dispatch target: a metric and the payload definition it maps onto.
#[derive(Debug, Clone)]
pub struct Target {
    /// Metric map
    pub metric: Arc<MetricMap>,
    /// Payload definition for the metric's topic
    pub payload: Arc<PayloadDefinition>,
}

/// Inbound and outbound routing tables.
#[derive(Debug, Clone, Default)]
pub struct RoutingTables {
    inbound: HashMap<String, Vec<Target>>,
    outbound: HashMap<MetricId, Vec<Target>>,
    subscriptions: Vec<(String, Qos)>,
}

impl RoutingTables {
    /// Build the tables from a configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a metric references a topic with no payload definition.
    pub fn new(config: &Configuration) -> Result<Self, ConfigError> {
        let payloads: HashMap<&str, Arc<PayloadDefinition>> = config
            .payloads
            .iter()
            .map(|payload| (payload.topic.as_str(), Arc::new(payload.clone())))
            .collect();

        let mut tables = Self {
            subscriptions: config
                .payloads
                .iter()
                .map(|payload| (payload.topic.clone(), payload.qos))
                .collect(),
            ..Self::default()
        };

        for metric in &config.metrics_map {
            let topic = &metric.configuration.topic;
            let payload = payloads.get(topic.as_str()).ok_or_else(|| {
                ConfigError::Validation(vec![format!(
                    "metric {:?}: topic {topic:?} not in payloads",
                    metric.name
                )])
            })?;

            let target = Target {
                metric: Arc::new(metric.clone()),
                payload: Arc::clone(payload),
            };

            if metric.access.is_readable() {
                tables
                    .inbound
                    .entry(topic.clone())
                    .or_default()
                    .push(target.clone());
            } else {
                tracing::debug!(metric = %metric.name, topic, "Metric not readable, excluded from inbound routing");
            }

            if metric.access.is_writable() {
                tables
                    .outbound
                    .entry(metric.metric_id())
                    .or_default()
                    .push(target);
            } else {
                tracing::debug!(metric = %metric.name, topic, "Metric not writable, excluded from outbound routing");
            }
        }

        Ok(tables)
    }

    /// Targets for a message received on `topic`.
    #[must_use]
    pub fn inbound(&self, topic: &str) -> Option<&[Target]> {
        self.inbound.get(topic).map(Vec::as_slice)
    }

    /// Targets for an internal message with identity `id`.
    #[must_use]
    pub fn outbound(&self, id: &MetricId) -> Option<&[Target]> {
        self.outbound.get(id).map(Vec::as_slice)
    }

    /// Every payload topic with its declared QoS, in configuration order.
    #[must_use]
    pub fn subscriptions(&self) -> &[(String, Qos)] {
        &self.subscriptions
    }

    /// Topics with at least one readable metric, sorted.
    #[must_use]
    pub fn inbound_topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.inbound.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    /// Metric identities with at least one writable metric, sorted.
    #[must_use]
    pub fn outbound_ids(&self) -> Vec<&MetricId> {
        let mut ids: Vec<&MetricId> = self.outbound.keys().collect();
        ids.sort_unstable();
        ids
    }
}
