//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    fs, io,
    num::{NonZeroU16, NonZeroU32, NonZeroU64},
    path::{Path, PathBuf},
};

use http::Uri;
use serde::Deserialize;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

fn default_documents_per_second() -> NonZeroU32 {
    NonZeroU32::new(1_000).expect("not zero")
}

fn default_batch_size() -> NonZeroU32 {
    NonZeroU32::new(500).expect("not zero")
}

fn default_flush_interval_milliseconds() -> NonZeroU64 {
    NonZeroU64::new(1_000).expect("not zero")
}

fn default_workers() -> NonZeroU16 {
    NonZeroU16::new(4).expect("not zero")
}

fn default_host() -> Uri {
    Uri::from_static("http://localhost:9200")
}

fn default_verify_certs() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout_seconds() -> NonZeroU64 {
    NonZeroU64::new(60).expect("not zero")
}

fn default_drain_timeout_seconds() -> NonZeroU64 {
    NonZeroU64::new(10).expect("not zero")
}

fn default_failure_threshold() -> f64 {
    0.05
}

fn default_seed() -> [u8; 32] {
    rand::random()
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The index bulk documents are addressed to
    pub index: String,
    /// The total documents per second produced, shared across all workers
    #[serde(default = "default_documents_per_second")]
    pub documents_per_second: NonZeroU32,
    /// The number of documents that forces a batch to be submitted
    #[serde(default = "default_batch_size")]
    pub batch_size: NonZeroU32,
    /// The age at which a non-empty, non-full batch is submitted anyway
    #[serde(default = "default_flush_interval_milliseconds")]
    pub flush_interval_milliseconds: NonZeroU64,
    /// The number of concurrent pipeline workers
    #[serde(default = "default_workers")]
    pub workers: NonZeroU16,
    /// Wall-clock bound on the run. Unset means run until interrupted.
    #[serde(default)]
    pub duration_seconds: Option<NonZeroU64>,
    /// The URI for the search backend, must be a valid URI
    #[serde(with = "http_serde::uri", default = "default_host")]
    pub host: Uri,
    /// Basic auth username for the backend
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password for the backend
    #[serde(default)]
    pub password: Option<String>,
    /// Whether TLS certificates are verified
    #[serde(default = "default_verify_certs")]
    pub verify_certs: bool,
    /// Submission attempts allowed per batch beyond the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request timeout, in seconds
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: NonZeroU64,
    /// Bound on the drain phase, in seconds
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: NonZeroU64,
    /// Fraction of failed documents above which the run exits non-zero
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// The seed for deterministic document synthesis
    #[serde(default = "default_seed")]
    pub seed: [u8; 32],
}

impl Config {
    /// Create a [`Config`] for `index` with every other field defaulted.
    #[must_use]
    pub fn for_index(index: String) -> Self {
        Self {
            index,
            documents_per_second: default_documents_per_second(),
            batch_size: default_batch_size(),
            flush_interval_milliseconds: default_flush_interval_milliseconds(),
            workers: default_workers(),
            duration_seconds: None,
            host: default_host(),
            username: None,
            password: None,
            verify_certs: default_verify_certs(),
            max_retries: default_max_retries(),
            request_timeout_seconds: default_request_timeout_seconds(),
            drain_timeout_seconds: default_drain_timeout_seconds(),
            failure_threshold: default_failure_threshold(),
            seed: default_seed(),
        }
    }
}

/// Load configuration from a file path
///
/// # Errors
///
/// Returns an error if the path cannot be read or the contents are not valid
/// YAML for [`Config`].
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    serde_yaml::from_str(&contents).map_err(Error::from)
}
