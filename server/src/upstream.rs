//! Upstream client pool (C5).
//!
//! Holds an ordered list of upstream binary caches and fetches info
//! records / NARs from the first healthy one that has the artifact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncRead;
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;
use tracing::warn;

use crate::config::UpstreamConfig;
use crate::error::{ServerError, ServerResult};
use pullcache_core::signing::NixPublicKey;

/// A fetched artifact body, readable as a stream.
pub struct UpstreamBody {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub size: Option<u64>,
}

/// A single upstream cache and its current health.
pub struct Upstream {
    pub base_url: String,
    pub priority: usize,
    pub public_keys: Vec<NixPublicKey>,
    pub healthy: AtomicBool,
}

impl Upstream {
    fn from_config(priority: usize, config: UpstreamConfig) -> ServerResult<Self> {
        let public_keys = config
            .public_keys
            .iter()
            .map(|k| NixPublicKey::from_str(k))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ServerError::request_error)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            priority,
            public_keys,
            healthy: AtomicBool::new(true),
        })
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
    }
}

/// Pool of upstream caches, tried in priority order.
pub struct UpstreamPool {
    client: Client,
    upstreams: Vec<Arc<Upstream>>,
}

impl UpstreamPool {
    pub fn new(configs: Vec<UpstreamConfig>) -> ServerResult<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(ServerError::request_error)?;

        let upstreams = configs
            .into_iter()
            .enumerate()
            .map(|(priority, c)| Upstream::from_config(priority, c).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { client, upstreams })
    }

    /// The configured upstreams, in priority order.
    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    /// Fetches a `.narinfo` by hash, probing every healthy upstream in
    /// parallel and returning the first one that has it. Remaining probes
    /// are aborted (dropping the `JoinSet` cancels them) rather than left
    /// to run to completion.
    pub async fn get_info(&self, hash: &str) -> ServerResult<(String, Arc<Upstream>)> {
        let mut probes = JoinSet::new();

        for upstream in self.ordered_healthy().cloned() {
            let client = self.client.clone();
            let hash = hash.to_string();

            probes.spawn(async move {
                let url = format!("{}/{}.narinfo", upstream.base_url, hash);
                let result = client.get(&url).send().await;
                (upstream, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (upstream, result) = match joined {
                Ok(pair) => pair,
                Err(_) => continue, // probe task panicked or was cancelled
            };

            match result {
                Ok(resp) if resp.status() == StatusCode::OK => match resp.text().await {
                    Ok(body) => return Ok((body, upstream)),
                    Err(e) => {
                        warn!(upstream = %upstream.base_url, "error reading narinfo body: {e}");
                    }
                },
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {}
                Ok(resp) => {
                    warn!(upstream = %upstream.base_url, status = %resp.status(), "unexpected narinfo response");
                }
                Err(e) => {
                    warn!(upstream = %upstream.base_url, "transport error fetching narinfo: {e}");
                    upstream.mark_unhealthy();
                }
            }
        }

        Err(ServerError::UpstreamUnavailable)
    }

    /// Fetches a NAR by its relative URL, probing every healthy upstream in
    /// parallel like [`UpstreamPool::get_info`]. Used when a NAR is
    /// requested without already knowing which upstream served its narinfo
    /// (e.g. a direct `GET /nar/:path` with no prior info-record fetch in
    /// this process).
    pub async fn get_nar_any(&self, relative_url: &str) -> ServerResult<(UpstreamBody, Arc<Upstream>)> {
        let mut probes = JoinSet::new();

        for upstream in self.ordered_healthy().cloned() {
            let client = self.client.clone();
            let url = relative_url.to_string();

            probes.spawn(async move {
                let full_url = format!("{}/{}", upstream.base_url, url);
                let result = client.get(&full_url).send().await;
                (upstream, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (upstream, result) = match joined {
                Ok(pair) => pair,
                Err(_) => continue,
            };

            match result {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    upstream.mark_healthy();
                    let size = resp.content_length();
                    let stream = resp
                        .bytes_stream()
                        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
                    let reader = StreamReader::new(stream);

                    return Ok((UpstreamBody { reader: Box::new(reader), size }, upstream));
                }
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {}
                Ok(resp) => {
                    warn!(upstream = %upstream.base_url, status = %resp.status(), "unexpected NAR response");
                }
                Err(e) => {
                    warn!(upstream = %upstream.base_url, "transport error fetching NAR: {e}");
                    upstream.mark_unhealthy();
                }
            }
        }

        Err(ServerError::UpstreamUnavailable)
    }

    /// Fetches a NAR by its relative URL (as found in a narinfo's `URL`
    /// field) from a specific upstream, since the NAR must come from the
    /// same cache that served the narinfo pointing at it.
    pub async fn get_nar(&self, upstream: &Upstream, relative_url: &str) -> ServerResult<UpstreamBody> {
        let url = if relative_url.starts_with("http://") || relative_url.starts_with("https://") {
            relative_url.to_string()
        } else {
            format!("{}/{}", upstream.base_url, relative_url)
        };

        let resp = self.client.get(&url).send().await.map_err(|e| {
            upstream.mark_unhealthy();
            ServerError::request_error(e)
        })?;

        match resp.status() {
            StatusCode::OK => {
                upstream.mark_healthy();
                let size = resp.content_length();
                let stream = resp
                    .bytes_stream()
                    .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
                let reader = StreamReader::new(stream);

                Ok(UpstreamBody { reader: Box::new(reader), size })
            }
            StatusCode::NOT_FOUND => Err(ServerError::NotFound),
            status => {
                warn!(upstream = %upstream.base_url, %status, "unexpected NAR response");
                Err(ServerError::UpstreamUnavailable)
            }
        }
    }

    /// Upstreams in priority order, healthy ones first so a previously
    /// flaky upstream does not get probed again before its peers.
    fn ordered_healthy(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.iter().filter(|u| u.is_healthy())
    }
}
