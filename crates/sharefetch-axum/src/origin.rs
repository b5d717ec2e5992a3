//! reqwest implementation of the [`OriginFetcher`] port.
//!
//! Every response is handed back as is, whatever its status; only transport
//! failures become [`OriginError`]. The body is pulled with
//! `Response::chunk`, so nothing is buffered beyond one network read.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::{DATE, RANGE};
use tracing::debug;

use sharefetch_core::{OriginBody, OriginError, OriginFetcher, OriginResponse};

/// Time allowed to establish a connection to the origin.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest silence tolerated between two reads of an origin body.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle keep-alive connections kept per origin host.
const POOL_MAX_IDLE_PER_HOST: usize = 512;

/// Origin client backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestOrigin {
    client: Client,
}

impl ReqwestOrigin {
    /// Build a client with the default timeouts and pool size.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()?;
        Ok(Self { client })
    }

    /// Use a preconfigured client.
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// `Range` header value for a resumed fetch.
fn range_header(resume_from: u64) -> Option<String> {
    (resume_from > 0).then(|| format!("bytes={resume_from}-"))
}

/// RFC 7231 `Date` header value.
fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn classify(url: &str, err: &reqwest::Error) -> OriginError {
    let url = url.to_string();
    let message = err.to_string();
    if err.is_connect() {
        OriginError::Connect { url, message }
    } else if err.is_timeout() {
        OriginError::Timeout { url, message }
    } else {
        OriginError::Transport { url, message }
    }
}

#[async_trait]
impl OriginFetcher for ReqwestOrigin {
    async fn fetch(&self, url: &str, resume_from: u64) -> Result<OriginResponse, OriginError> {
        let mut request = self.client.get(url).header(DATE, http_date(Utc::now()));
        if let Some(range) = range_header(resume_from) {
            request = request.header(RANGE, range);
        }

        let response = request.send().await.map_err(|e| classify(url, &e))?;
        let status = response.status().as_u16();
        debug!(url, resume_from, status, "Origin responded");

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        Ok(OriginResponse {
            status,
            headers,
            body: Box::new(ReqwestBody {
                url: url.to_string(),
                response,
            }),
        })
    }
}

/// Streaming body of a reqwest response.
struct ReqwestBody {
    url: String,
    response: reqwest::Response,
}

#[async_trait]
impl OriginBody for ReqwestBody {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| classify(&self.url, &e).into_io())
    }
}
