//! Signal record definitions
//!
//! A signal is the unit of telemetry: one span, one log record or one metric
//! data point. Records are immutable once produced; ownership moves through
//! the exporter chain.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in nanoseconds since the UNIX epoch
pub type Timestamp = u64;

/// Record attributes, ordered by key so encoded batches are deterministic
pub type Attributes = BTreeMap<String, AttributeValue>;

/// The three signal kinds handled by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Trace,
    Log,
    Metric,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Trace, SignalKind::Log, SignalKind::Metric];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Trace => "trace",
            SignalKind::Log => "log",
            SignalKind::Metric => "metric",
        }
    }

    /// Directory name used for this kind under the storage root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            SignalKind::Trace => "spans",
            SignalKind::Log => "logs",
            SignalKind::Metric => "metrics",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignalKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" | "traces" | "span" | "spans" => Ok(SignalKind::Trace),
            "log" | "logs" => Ok(SignalKind::Log),
            "metric" | "metrics" => Ok(SignalKind::Metric),
            _ => anyhow::bail!("Invalid signal kind: {}", s),
        }
    }
}

/// A record type that can travel through an exporter and be persisted to disk.
pub trait Signal:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    const KIND: SignalKind;
}

/// Attribute value. Externally tagged so it survives non-self-describing encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    I64(i64),
    F64(f64),
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::I64(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::F64(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

/// A finished span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    /// 32 hex chars
    pub trace_id: String,

    /// 16 hex chars
    pub span_id: String,

    pub parent_span_id: Option<String>,

    pub name: String,

    pub kind: SpanKind,

    pub start_time_unix_nano: Timestamp,

    pub end_time_unix_nano: Timestamp,

    pub attributes: Attributes,

    pub status: SpanStatus,
}

impl SpanData {
    pub fn new(name: impl Into<String>, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            name: name.into(),
            kind: SpanKind::Internal,
            start_time_unix_nano: 0,
            end_time_unix_nano: 0,
            attributes: Attributes::new(),
            status: SpanStatus::Unset,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Span duration in nanoseconds (zero if the end precedes the start).
    pub fn duration_ns(&self) -> u64 {
        self.end_time_unix_nano
            .saturating_sub(self.start_time_unix_nano)
    }
}

impl Signal for SpanData {
    const KIND: SignalKind = SignalKind::Trace;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// A single log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecordData {
    pub timestamp_unix_nano: Timestamp,
    pub severity: Severity,
    pub body: String,
    pub attributes: Attributes,

    /// Correlation with the active span, when there is one
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl LogRecordData {
    pub fn new(severity: Severity, body: impl Into<String>) -> Self {
        Self {
            timestamp_unix_nano: 0,
            severity,
            body: body.into(),
            attributes: Attributes::new(),
            trace_id: None,
            span_id: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Signal for LogRecordData {
    const KIND: SignalKind = SignalKind::Log;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Gauge(f64),
    Sum {
        value: f64,
        monotonic: bool,
    },
    Histogram {
        count: u64,
        sum: f64,
        bounds: Vec<f64>,
        bucket_counts: Vec<u64>,
    },
}

/// One metric data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub timestamp_unix_nano: Timestamp,
    pub value: MetricValue,
    pub attributes: Attributes,
}

impl MetricData {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            unit: String::new(),
            timestamp_unix_nano: 0,
            value: MetricValue::Gauge(value),
            attributes: Attributes::new(),
        }
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self {
            value: MetricValue::Sum {
                value,
                monotonic: true,
            },
            ..Self::gauge(name, value)
        }
    }
}

impl Signal for MetricData {
    const KIND: SignalKind = SignalKind::Metric;
}
