use std::{
    env,
    net::SocketAddr,
    num::{NonZeroU16, NonZeroU32, NonZeroU64},
    path::PathBuf,
};

use ballast::{
    config::{self, Config},
    pipeline::Server,
};
use clap::{ArgGroup, Parser};
use http::Uri;
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to deserialize ballast config: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Pipeline(#[from] ballast::pipeline::Error),
    #[error("Invalid host URI: {0}")]
    Host(#[from] http::uri::InvalidUri),
    #[error("An index must be given by flag or configuration file")]
    MissingIndex,
    #[error("{failed} of {synthesized} documents failed, over the configured threshold")]
    FailureThreshold {
        failed: u64,
        synthesized: u64,
    },
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
#[clap(group(
    ArgGroup::new("run-duration")
        .required(false)
        .args(&["duration_seconds", "infinite"]),
))]
struct Opts {
    /// path on disk to the configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// the index documents are written to, required unless the configuration
    /// file provides one
    #[clap(long)]
    index: Option<String>,
    /// documents synthesized per second, shared across all workers
    #[clap(long)]
    rate: Option<NonZeroU32>,
    /// the time, in seconds, to run the pipeline; 0 means indefinite
    #[clap(long)]
    duration_seconds: Option<u64>,
    /// flag to allow indefinite runs
    #[clap(long)]
    infinite: bool,
    /// documents per bulk request
    #[clap(long)]
    batch_size: Option<NonZeroU32>,
    /// the age, in milliseconds, at which a partial batch is flushed anyway
    #[clap(long)]
    flush_interval_millis: Option<NonZeroU64>,
    /// the number of concurrent pipeline workers
    #[clap(long)]
    workers: Option<NonZeroU16>,
    /// the search backend host, scheme optional
    #[clap(long)]
    host: Option<String>,
    /// basic auth username, falls back to the ES_USERNAME environment
    /// variable
    #[clap(long)]
    username: Option<String>,
    /// basic auth password, falls back to the ES_PASSWORD environment
    /// variable
    #[clap(long)]
    password: Option<String>,
    /// disable TLS certificate verification
    #[clap(long)]
    no_verify_certs: bool,
    /// per-request timeout, in seconds
    #[clap(long)]
    request_timeout_seconds: Option<NonZeroU64>,
    /// submission attempts allowed per batch beyond the first
    #[clap(long)]
    max_retries: Option<u32>,
    /// the maximum time to wait, in seconds, for workers to drain
    #[clap(long)]
    drain_timeout_seconds: Option<NonZeroU64>,
    /// the failed fraction of documents above which the exit is nonzero
    #[clap(long)]
    failure_threshold: Option<f64>,
    /// seed for reproducible document synthesis
    #[clap(long)]
    seed: Option<u64>,
    /// address to bind the prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

fn spread_seed(seed: u64) -> [u8; 32] {
    let mut out = [0; 32];
    out[..8].copy_from_slice(&seed.to_le_bytes());
    out
}

fn parse_host(host: &str) -> Result<Uri, Error> {
    // A bare host:port is taken as http.
    let uri = if host.contains("://") {
        host.parse::<Uri>()?
    } else {
        format!("http://{host}").parse::<Uri>()?
    };
    Ok(uri)
}

fn apply_overrides(config: &mut Config, opts: &Opts) -> Result<(), Error> {
    if let Some(index) = &opts.index {
        config.index.clone_from(index);
    }
    if let Some(rate) = opts.rate {
        config.documents_per_second = rate;
    }
    if opts.infinite {
        config.duration_seconds = None;
    } else if let Some(seconds) = opts.duration_seconds {
        config.duration_seconds = NonZeroU64::new(seconds);
    }
    if let Some(batch_size) = opts.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(interval) = opts.flush_interval_millis {
        config.flush_interval_milliseconds = interval;
    }
    if let Some(workers) = opts.workers {
        config.workers = workers;
    }
    if let Some(host) = &opts.host {
        config.host = parse_host(host)?;
    }
    if let Some(username) = &opts.username {
        config.username = Some(username.clone());
    }
    if let Some(password) = &opts.password {
        config.password = Some(password.clone());
    }
    if opts.no_verify_certs {
        config.verify_certs = false;
    }
    if let Some(timeout) = opts.request_timeout_seconds {
        config.request_timeout_seconds = timeout;
    }
    if let Some(max_retries) = opts.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(drain) = opts.drain_timeout_seconds {
        config.drain_timeout_seconds = drain;
    }
    if let Some(threshold) = opts.failure_threshold {
        config.failure_threshold = threshold;
    }
    if let Some(seed) = opts.seed {
        config.seed = spread_seed(seed);
    }
    if config.username.is_none() {
        config.username = env::var("ES_USERNAME").ok();
    }
    if config.password.is_none() {
        config.password = env::var("ES_PASSWORD").ok();
    }
    Ok(())
}

fn get_config(opts: &Opts) -> Result<Config, Error> {
    let mut config = if let Ok(contents) = env::var("BALLAST_CONFIG") {
        debug!("Using config from env var 'BALLAST_CONFIG'");
        serde_yaml::from_str(&contents)?
    } else if let Some(path) = &opts.config_path {
        debug!("Attempting to open configuration file at: {}", path.display());
        config::load_config_from_path(path)?
    } else {
        let index = opts.index.clone().ok_or(Error::MissingIndex)?;
        Config::for_index(index)
    };
    apply_overrides(&mut config, opts)?;
    Ok(config)
}

async fn inner_main(config: Config, prometheus_addr: Option<SocketAddr>) -> Result<(), Error> {
    if let Some(addr) = prometheus_addr {
        let builder = PrometheusBuilder::new().with_http_listener(addr);
        tokio::spawn(async move {
            builder
                .install()
                .expect("failed to install prometheus recorder");
        });
    }

    let index = config.index.clone();
    let target_rate = config.documents_per_second.get();
    let failure_threshold = config.failure_threshold;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c");
                signal_shutdown.cancel();
            }
            Err(err) => error!("could not listen for ctrl-c: {err}"),
        }
    });

    let server = Server::new(config, shutdown)?;
    let state = server.state();
    let start = Instant::now();
    let res = server.spin().await;
    let elapsed = start.elapsed();

    let snapshot = state.snapshot();
    let effective_rate = snapshot.sent as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        index = %index,
        synthesized = snapshot.synthesized,
        sent = snapshot.sent,
        failed = snapshot.failed,
        retried = snapshot.retried,
        elapsed_seconds = elapsed.as_secs_f64(),
        target_rate,
        effective_rate,
        "run complete"
    );
    if effective_rate >= 0.9 * f64::from(target_rate) {
        info!("target rate achieved");
    } else {
        warn!("target rate missed");
    }
    res?;

    if snapshot.synthesized > 0
        && (snapshot.failed as f64) > failure_threshold * (snapshot.synthesized as f64)
    {
        return Err(Error::FailureThreshold {
            failed: snapshot.failed,
            synthesized: snapshot.synthesized,
        });
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting ballast {version} run.");

    let opts = Opts::parse();
    let config = get_config(&opts)?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, opts.prometheus_addr));
    // The prometheus exporter and signal listener are not plugged into the
    // shutdown mechanism. Shutting the runtime down explicitly keeps them
    // from holding the process open.
    runtime.shutdown_timeout(Duration::from_secs(2));
    info!("Bye. :)");
    res
}
