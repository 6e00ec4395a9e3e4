//! Telemetry records consumed by the aggregator.
//!
//! These mirror what a tracing exporter hands over: finished or in-flight
//! spans, log records and gauge data points.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attrs::{AttrValue, KeyValue};
use crate::ids::{SpanContext, SpanId, SpanLink};
use crate::span::SpanStatus;

/// The resource a span was produced by.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

impl Resource {
    pub fn new(attributes: Vec<KeyValue>) -> Self {
        Self { attributes }
    }

    /// Value of the attribute named `key`.
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| &kv.value)
    }

    /// Attributes sorted by key, so equal sets compare equal regardless of
    /// order.
    pub(crate) fn canonical(&self) -> Vec<KeyValue> {
        let mut attrs = self.attributes.clone();
        attrs.sort_by(|a, b| a.key.cmp(&b.key));
        attrs
    }
}

/// A span as exported by a tracer.
///
/// A running span has an end time before its start time, typically the
/// default (epoch) value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    pub span_context: SpanContext,
    #[serde(default)]
    pub parent_span_id: SpanId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<SpanLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
}

impl SpanData {
    pub fn span_id(&self) -> SpanId {
        self.span_context.span_id
    }
}

/// A log line attached to a span.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub span_id: SpanId,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<KeyValue>,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Whether the boolean attribute `key` is set.
    pub fn flag(&self, key: &str) -> bool {
        self.attributes
            .iter()
            .any(|kv| kv.key == key && kv.value == AttrValue::Bool(true))
    }
}

/// One int64 gauge observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<KeyValue>,
    pub time: DateTime<Utc>,
    pub value: i64,
}

impl DataPoint {
    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| &kv.value)
    }
}

/// A named series of gauge observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    pub name: String,
    #[serde(default)]
    pub points: Vec<DataPoint>,
}
