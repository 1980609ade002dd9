//! The synthetic log record model.
//!
//! Pools, weights and ranges here define the traffic shape this tool seeds:
//! microservice request logs with occasional operational measurements and
//! error detail on ERROR records.

use rand::{
    Rng,
    distr::{Distribution, StandardUniform},
    seq::IndexedRandom,
};
use serde::Serialize;

pub(crate) const SERVICES: [&str; 9] = [
    "user-service",
    "payment-service",
    "inventory-service",
    "notification-service",
    "auth-service",
    "catalog-service",
    "order-service",
    "shipping-service",
    "analytics-service",
];

pub(crate) const ENVIRONMENTS: [&str; 3] = ["prod", "staging", "dev"];

const ERROR_KINDS: [&str; 4] = [
    "TimeoutException",
    "ConnectionError",
    "ValidationError",
    "AuthError",
];

const TEMPLATES: [&str; 15] = [
    "Request processed successfully",
    "Database connection established",
    "Cache miss for key {}",
    "Rate limit exceeded for user {}",
    "Payment transaction completed",
    "User authentication successful",
    "API endpoint /api/v1/{} called",
    "Memory usage at {}%",
    "Processing batch of {} items",
    "Connection timeout after {}ms",
    "Scheduled task executed",
    "Configuration reloaded",
    "Healthcheck passed",
    "Queue size: {} items",
    "File upload completed: {} bytes",
];

/// Log severity. Sampling is weighted toward the quiet end: INFO 40, DEBUG
/// 30, WARN 15, ERROR 10, TRACE 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level {
    /// Routine operation.
    #[serde(rename = "INFO")]
    Info,
    /// Developer chatter.
    #[serde(rename = "DEBUG")]
    Debug,
    /// Something off, nothing broken.
    #[serde(rename = "WARN")]
    Warn,
    /// A failed operation. Records at this level carry error detail.
    #[serde(rename = "ERROR")]
    Error,
    /// Finest-grained noise.
    #[serde(rename = "TRACE")]
    Trace,
}

impl Distribution<Level> for StandardUniform {
    fn sample<R>(&self, rng: &mut R) -> Level
    where
        R: Rng + ?Sized,
    {
        match rng.random_range(0_u8..100) {
            0..=39 => Level::Info,
            40..=69 => Level::Debug,
            70..=84 => Level::Warn,
            85..=94 => Level::Error,
            _ => Level::Trace,
        }
    }
}

/// Operational measurements. Each is present independently with probability
/// 0.7 and omitted from serialization otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    /// Uniform 10-5000, two decimal places.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    /// Uniform 100-4096, two decimal places.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<f64>,
    /// Uniform 1-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<u32>,
    /// Uniform 1-1000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_count: Option<u32>,
    /// Uniform 0-50.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
    /// Uniform 1 KiB-100 MiB, two decimal places.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_processed: Option<f64>,
}

const MEASUREMENT_PROBABILITY: f64 = 0.7;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn maybe_float<R>(rng: &mut R, low: f64, high: f64) -> Option<f64>
where
    R: Rng + ?Sized,
{
    (rng.random::<f64>() < MEASUREMENT_PROBABILITY).then(|| round2(rng.random_range(low..=high)))
}

fn maybe_int<R>(rng: &mut R, low: u32, high: u32) -> Option<u32>
where
    R: Rng + ?Sized,
{
    (rng.random::<f64>() < MEASUREMENT_PROBABILITY).then(|| rng.random_range(low..=high))
}

impl Distribution<Metrics> for StandardUniform {
    fn sample<R>(&self, rng: &mut R) -> Metrics
    where
        R: Rng + ?Sized,
    {
        Metrics {
            response_time_ms: maybe_float(rng, 10.0, 5_000.0),
            memory_usage_mb: maybe_float(rng, 100.0, 4_096.0),
            cpu_usage_percent: maybe_int(rng, 1, 100),
            request_count: maybe_int(rng, 1, 1_000),
            error_count: maybe_int(rng, 0, 50),
            bytes_processed: maybe_float(rng, 1_024.0, 104_857_600.0),
        }
    }
}

/// Failure detail attached to ERROR records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    /// Exception class name.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Where the failure surfaced.
    pub stack_trace: String,
    /// Whether a retry of the failed operation could succeed. Fixed per
    /// kind: timeouts and connection drops are retryable, validation and
    /// auth rejections are not.
    pub retryable: bool,
}

impl ErrorDetail {
    pub(crate) fn sample<R>(rng: &mut R, service: &str) -> Self
    where
        R: Rng + ?Sized,
    {
        let kind = *ERROR_KINDS.choose(rng).expect("pool is non-empty");
        let line: u16 = rng.random_range(50..=500);
        Self {
            kind,
            stack_trace: format!("at {service}.handler.process() line {line}"),
            retryable: matches!(kind, "TimeoutException" | "ConnectionError"),
        }
    }
}

/// One synthetic log document.
///
/// Serializes to exactly the shape delivered to the backend. Optional
/// fields are omitted when absent, never null, and measurements sit at the
/// top level of the document rather than under a sub-object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Event time, RFC 3339 UTC.
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    /// Originating service.
    pub service: &'static str,
    /// Severity.
    pub level: Level,
    /// Rendered message text.
    pub message: String,
    /// Deployment environment.
    pub environment: &'static str,
    /// Emitting host, `host-01` through `host-20`.
    pub host: String,
    /// Request correlation id.
    pub request_id: String,
    /// Authenticated user, attached to roughly four requests in five.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    /// Session correlation id.
    pub session_id: String,
    /// Operational measurements.
    #[serde(flatten)]
    pub metrics: Metrics,
    /// Failure detail, present exactly when `level` is ERROR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Render a message from the template pool, filling `{}` placeholders.
pub(crate) fn message<R>(rng: &mut R) -> String
where
    R: Rng + ?Sized,
{
    let template = *TEMPLATES.choose(rng).expect("pool is non-empty");
    if !template.contains("{}") {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(idx) = rest.find("{}") {
        out.push_str(&rest[..idx]);
        out.push_str(&placeholder(rng));
        rest = &rest[idx + 2..];
    }
    out.push_str(rest);
    out
}

fn placeholder<R>(rng: &mut R) -> String
where
    R: Rng + ?Sized,
{
    match rng.random_range(0_u8..7) {
        0 => rng.random_range(1..=1_000_u32).to_string(),
        1 => format!("user_{id}", id = rng.random_range(1_000..=9_999_u32)),
        2 => format!("session_{id}", id = rng.random_range(10_000..=99_999_u32)),
        3 => rng.random_range(50..=95_u32).to_string(),
        4 => "orders".to_string(),
        5 => "products".to_string(),
        _ => rng.random_range(100..=10_000_u32).to_string(),
    }
}
