//! Bulk delivery to the search backend.
//!
//! A [`Submitter`] owns the HTTP client and the retry policy. Submission
//! retries whole requests on transient failure with exponential backoff,
//! never individual documents: item-level rejections reported by the
//! backend are final. Authentication refusals are surfaced distinctly so
//! the pipeline can halt rather than hammer a backend that will never
//! accept its documents.

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use rand::Rng;
use reqwest::{Client, RequestBuilder, header::CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    batch::Batch,
    bulk::{self, Disposition},
    config::Config,
};

const NDJSON: &str = "application/x-ndjson";
const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Doublings of `BACKOFF_BASE` stop here, bounding a single wait at
/// 6.4 seconds before jitter.
const BACKOFF_EXPONENT_CAP: u32 = 6;
const MAX_LOGGED_REJECTIONS: usize = 3;

/// Errors produced by [`Submitter`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// HTTP client construction failed.
    #[error("HTTP client construction error: {0}")]
    Client(#[source] reqwest::Error),
    /// A record could not be encoded into a request body.
    #[error(transparent)]
    Body(#[from] bulk::Error),
    /// The backend could not be reached at startup.
    #[error("startup probe of {uri} failed: {source}")]
    Unreachable {
        /// Probed URI
        uri: String,
        /// Underlying transport error
        #[source]
        source: Box<reqwest::Error>,
    },
    /// The backend refused the startup probe.
    #[error("startup probe refused with status {status}")]
    Probe {
        /// Refusing status
        status: StatusCode,
    },
    /// The backend answered the startup probe with an unintelligible body.
    #[error("startup probe returned an unintelligible body: {0}")]
    ProbeBody(#[source] reqwest::Error),
    /// The backend refused our credentials. Not retryable.
    #[error("authentication refused with status {status}")]
    Auth {
        /// Refusing status
        status: StatusCode,
    },
    /// The batch was refused and retrying cannot help.
    #[error("batch refused with status {status} after {retries} retries")]
    Permanent {
        /// Refusing status
        status: StatusCode,
        /// Retries spent before the refusal
        retries: u64,
    },
    /// The retry budget ran out before the batch went through.
    #[error("batch undeliverable after {attempts} attempts")]
    Exhausted {
        /// Total attempts made, including the first
        attempts: u64,
    },
}

/// Identity reported by the backend's root endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterInfo {
    /// Name of the cluster.
    pub cluster_name: String,
    /// Version block.
    pub version: Version,
}

/// Version block within [`ClusterInfo`].
#[derive(Debug, Clone, Deserialize)]
pub struct Version {
    /// Version number string.
    pub number: String,
}

/// Outcome of a settled batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Documents the backend accepted.
    pub accepted: u64,
    /// Documents the backend rejected item-by-item. Final.
    pub rejected: u64,
    /// Retry attempts spent getting the request through.
    pub retries: u64,
}

/// Delivers batches to the search backend's bulk endpoint.
#[derive(Debug, Clone)]
pub struct Submitter {
    client: Client,
    bulk_uri: String,
    ping_uri: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
    max_retries: u32,
}

fn endpoints(host: &http::Uri) -> (String, String) {
    let base = host.to_string();
    let base = base.trim_end_matches('/');
    (format!("{base}/_bulk"), format!("{base}/"))
}

impl Submitter {
    /// Create a new [`Submitter`] from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be
    /// constructed.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.get()))
            .pool_max_idle_per_host(usize::from(config.workers.get()))
            .danger_accept_invalid_certs(!config.verify_certs)
            .build()
            .map_err(Error::Client)?;

        let (bulk_uri, ping_uri) = endpoints(&config.host);

        Ok(Self {
            client,
            bulk_uri,
            ping_uri,
            index: config.index.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            max_retries: config.max_retries,
        })
    }

    /// Probe the backend's root endpoint, confirming reachability and
    /// credentials before any document is synthesized.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached, refuses the
    /// probe or answers with a body that does not identify a cluster.
    pub async fn ping(&self) -> Result<ClusterInfo, Error> {
        let request = self.authenticate(self.client.get(&self.ping_uri));
        let response = request.send().await.map_err(|source| Error::Unreachable {
            uri: self.ping_uri.clone(),
            source: Box::new(source),
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Auth { status });
        }
        if !status.is_success() {
            return Err(Error::Probe { status });
        }
        response.json().await.map_err(Error::ProbeBody)
    }

    /// Deliver `batch`, retrying transient failures until the retry
    /// budget runs out.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be delivered. Every error
    /// settles the whole batch as failed; [`Error::Auth`] additionally
    /// requires the run to halt.
    pub async fn submit(&self, batch: &Batch) -> Result<Delivery, Error> {
        let body = bulk::body(&self.index, batch.records())?;
        let total = batch.len() as u64;

        let mut retries: u32 = 0;
        loop {
            match self.attempt(body.clone()).await {
                Disposition::Success { accepted, rejected } => {
                    // Whatever the backend claims, every document in the
                    // batch settles exactly once.
                    let rejected = rejected.min(total);
                    let accepted = accepted.min(total - rejected);
                    return Ok(Delivery {
                        accepted,
                        rejected,
                        retries: u64::from(retries),
                    });
                }
                Disposition::Transient => {
                    if retries >= self.max_retries {
                        return Err(Error::Exhausted {
                            attempts: u64::from(retries) + 1,
                        });
                    }
                    retries += 1;
                    let delay = backoff(retries);
                    debug!(
                        retry = retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transient submission failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Disposition::Permanent(status) => {
                    return Err(Error::Permanent {
                        status,
                        retries: u64::from(retries),
                    });
                }
                Disposition::Fatal(status) => {
                    return Err(Error::Auth { status });
                }
            }
        }
    }

    async fn attempt(&self, body: Bytes) -> Disposition {
        let request = self
            .client
            .post(&self.bulk_uri)
            .header(CONTENT_TYPE, NDJSON)
            .body(body);
        let request = self.authenticate(request);

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                debug!("bulk request failed in transit: {error}");
                return Disposition::Transient;
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Disposition::from_status(status);
        }

        match response.json::<bulk::Response>().await {
            Ok(bulk) => {
                debug!(took = bulk.took, "bulk response");
                for rejection in bulk.rejections().take(MAX_LOGGED_REJECTIONS) {
                    if let Some(error) = &rejection.error {
                        warn!(
                            status = rejection.status,
                            kind = %error.kind,
                            reason = error.reason.as_deref().unwrap_or(""),
                            "document rejected"
                        );
                    } else {
                        warn!(status = rejection.status, "document rejected");
                    }
                }
                bulk.disposition()
            }
            Err(error) => {
                // A 2xx answer that cannot be understood leaves the batch
                // unsettled, so try again.
                warn!("unable to parse bulk response: {error}");
                Disposition::Transient
            }
        }
    }

    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(username) = &self.username {
            request.basic_auth(username, self.password.as_deref())
        } else {
            request
        }
    }
}

/// Wait before the nth retry: `BACKOFF_BASE * 2^(n-1)` plus up to 25%
/// jitter.
fn backoff(retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(BACKOFF_EXPONENT_CAP);
    let base = BACKOFF_BASE.saturating_mul(2_u32.saturating_pow(exponent));
    let jitter = rand::rng().random_range(0.0..=0.25_f64);
    base.mul_f64(1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use ballast_payload::Synthesizer;
    use http::StatusCode;
    use warp::Filter;

    use super::{BACKOFF_BASE, Delivery, Error, Submitter, backoff, endpoints};
    use crate::{batch::Batch, config::Config};

    fn batch(count: u64) -> Batch {
        let synthesizer = Synthesizer::new([29; 32]);
        Batch::new(
            (0..count)
                .map(|sequence| synthesizer.synthesize(sequence).expect("synthesize failed"))
                .collect(),
        )
    }

    fn config_for(addr: SocketAddr, max_retries: u32) -> Config {
        let mut config: Config = serde_yaml::from_str("index: app-logs").expect("config");
        config.host = format!("http://{addr}").parse().expect("valid URI");
        config.max_retries = max_retries;
        config
    }

    /// Count documents in a bulk body: two NDJSON lines per document.
    fn doc_count(body: &[u8]) -> usize {
        body.split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .count()
            / 2
    }

    fn bulk_accept_all(body: &[u8]) -> serde_json::Value {
        let items: Vec<serde_json::Value> = (0..doc_count(body))
            .map(|_| serde_json::json!({"create": {"status": 201}}))
            .collect();
        serde_json::json!({"took": 2, "errors": false, "items": items})
    }

    /// Bulk stub that answers 503 for the first `failures` requests and
    /// accepts everything afterwards. Returns the bound address and a
    /// request counter.
    fn flaky_bulk_server(failures: u32) -> (SocketAddr, Arc<AtomicU32>) {
        let requests = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&requests);
        let route = warp::post()
            .and(warp::path("_bulk"))
            .and(warp::body::bytes())
            .map(move |body: bytes::Bytes| {
                let attempt = seen.fetch_add(1, Ordering::SeqCst);
                if attempt < failures {
                    warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({})),
                        warp::http::StatusCode::SERVICE_UNAVAILABLE,
                    )
                } else {
                    warp::reply::with_status(
                        warp::reply::json(&bulk_accept_all(&body)),
                        warp::http::StatusCode::OK,
                    )
                }
            });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve);
        (addr, requests)
    }

    /// Bulk stub that always answers with the given status.
    fn refusing_bulk_server(status: u16) -> (SocketAddr, Arc<AtomicU32>) {
        let requests = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&requests);
        let route = warp::post()
            .and(warp::path("_bulk"))
            .map(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({})),
                    warp::http::StatusCode::from_u16(status).expect("valid status"),
                )
            });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve);
        (addr, requests)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (addr, requests) = flaky_bulk_server(2);
        let submitter = Submitter::new(&config_for(addr, 3)).expect("submitter");

        let delivery = submitter.submit(&batch(5)).await.expect("submit failed");
        assert_eq!(
            delivery,
            Delivery {
                accepted: 5,
                rejected: 0,
                retries: 2
            }
        );
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_exhausts() {
        let (addr, requests) = refusing_bulk_server(503);
        let submitter = Submitter::new(&config_for(addr, 1)).expect("submitter");

        let result = submitter.submit(&batch(3)).await;
        assert!(matches!(result, Err(Error::Exhausted { attempts: 2 })));
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_refusal_is_not_retried() {
        let (addr, requests) = refusing_bulk_server(401);
        let submitter = Submitter::new(&config_for(addr, 3)).expect("submitter");

        let result = submitter.submit(&batch(3)).await;
        assert!(matches!(
            result,
            Err(Error::Auth {
                status: StatusCode::UNAUTHORIZED
            })
        ));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_refusal_is_not_retried() {
        let (addr, requests) = refusing_bulk_server(400);
        let submitter = Submitter::new(&config_for(addr, 3)).expect("submitter");

        let result = submitter.submit(&batch(3)).await;
        assert!(matches!(
            result,
            Err(Error::Permanent {
                status: StatusCode::BAD_REQUEST,
                retries: 0
            })
        ));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn item_rejections_are_final() {
        let requests = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&requests);
        // Every second document is rejected item-by-item.
        let route = warp::post()
            .and(warp::path("_bulk"))
            .and(warp::body::bytes())
            .map(move |body: bytes::Bytes| {
                seen.fetch_add(1, Ordering::SeqCst);
                let items: Vec<serde_json::Value> = (0..doc_count(&body))
                    .map(|position| {
                        if position % 2 == 0 {
                            serde_json::json!({"create": {"status": 201}})
                        } else {
                            serde_json::json!({"create": {
                                "status": 400,
                                "error": {"type": "mapper_parsing_exception", "reason": "bad field"}
                            }})
                        }
                    })
                    .collect();
                warp::reply::json(
                    &serde_json::json!({"took": 1, "errors": true, "items": items}),
                )
            });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve);

        let submitter = Submitter::new(&config_for(addr, 3)).expect("submitter");
        let delivery = submitter.submit(&batch(10)).await.expect("submit failed");

        assert_eq!(
            delivery,
            Delivery {
                accepted: 5,
                rejected: 5,
                retries: 0
            }
        );
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unparseable_success_body_is_transient() {
        let requests = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&requests);
        let route = warp::post()
            .and(warp::path("_bulk"))
            .and(warp::body::bytes())
            .map(move |body: bytes::Bytes| {
                let attempt = seen.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    warp::reply::with_status(
                        warp::reply::html(String::from("not json at all")),
                        warp::http::StatusCode::OK,
                    )
                } else {
                    warp::reply::with_status(
                        warp::reply::html(bulk_accept_all(&body).to_string()),
                        warp::http::StatusCode::OK,
                    )
                }
            });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve);

        let submitter = Submitter::new(&config_for(addr, 3)).expect("submitter");
        let delivery = submitter.submit(&batch(2)).await.expect("submit failed");

        assert_eq!(delivery.retries, 1);
        assert_eq!(delivery.accepted, 2);
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ping_reads_cluster_identity() {
        let route = warp::get().and(warp::path::end()).map(|| {
            warp::reply::json(&serde_json::json!({
                "name": "node-1",
                "cluster_name": "test-cluster",
                "version": {"number": "8.7.0", "build_flavor": "default"}
            }))
        });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve);

        let submitter = Submitter::new(&config_for(addr, 0)).expect("submitter");
        let info = submitter.ping().await.expect("ping failed");

        assert_eq!(info.cluster_name, "test-cluster");
        assert_eq!(info.version.number, "8.7.0");
    }

    #[tokio::test]
    async fn ping_surfaces_auth_refusal() {
        let route = warp::get().and(warp::path::end()).map(|| {
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({})),
                warp::http::StatusCode::UNAUTHORIZED,
            )
        });
        let (addr, serve) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve);

        let submitter = Submitter::new(&config_for(addr, 0)).expect("submitter");
        let result = submitter.ping().await;
        assert!(matches!(
            result,
            Err(Error::Auth {
                status: StatusCode::UNAUTHORIZED
            })
        ));
    }

    #[tokio::test]
    async fn ping_fails_fast_when_unreachable() {
        // Port 1 is essentially never listening.
        let addr: SocketAddr = "127.0.0.1:1".parse().expect("valid addr");
        let submitter = Submitter::new(&config_for(addr, 0)).expect("submitter");

        let result = submitter.ping().await;
        assert!(matches!(result, Err(Error::Unreachable { .. })));
    }

    #[test]
    fn endpoints_join_cleanly() {
        let (bulk, ping) = endpoints(&"http://localhost:9200".parse().expect("valid URI"));
        assert_eq!(bulk, "http://localhost:9200/_bulk");
        assert_eq!(ping, "http://localhost:9200/");

        let (bulk, ping) =
            endpoints(&"https://search.example.com:9243/es/".parse().expect("valid URI"));
        assert_eq!(bulk, "https://search.example.com:9243/es/_bulk");
        assert_eq!(ping, "https://search.example.com:9243/es/");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        for retry in 1..=10_u32 {
            let exponent = retry.saturating_sub(1).min(6);
            let base = BACKOFF_BASE * 2_u32.pow(exponent);
            let delay = backoff(retry);
            assert!(delay >= base, "retry {retry}: {delay:?} < {base:?}");
            assert!(
                delay <= base.mul_f64(1.25),
                "retry {retry}: {delay:?} too large"
            );
        }
        // The cap holds regardless of retry count.
        assert!(backoff(64) <= Duration::from_millis(6_400).mul_f64(1.25));
    }
}
