//! HTTP range fetcher
//!
//! - Connection pooling (via reqwest)
//! - `HEAD` for object size, falling back to a one-byte range GET
//! - Range GETs validated against the size the file was opened with
//! - Exponential backoff for transient failures (see [`RetryPolicy`])

use super::retry::{Attempt, RetryPolicy};
use super::{clamp_range, RangeFetcher};
use crate::core::config::VfsConfig;
use crate::core::error::FetchError;
use crate::core::page::RemoteFile;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct HttpRangeFetcher {
    client: Client,
    policy: RetryPolicy,
    auth_token: Option<String>,
    /// Every HTTP request sent, retries included
    requests: AtomicU64,
}

impl HttpRangeFetcher {
    pub fn new(config: &VfsConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| FetchError::unavailable(0, format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpRangeFetcher {
            client,
            policy: RetryPolicy::new(
                config.max_retries,
                config.retry_base_delay(),
                config.retry_max_delay(),
            ),
            auth_token: config.auth_token.clone(),
            requests: AtomicU64::new(0),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let builder = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Size from a `Range: bytes=0-0` probe, for servers that refuse HEAD
    async fn probe_size(&self, url: &str) -> Result<u64, FetchError> {
        self.policy
            .run(&format!("probe {}", url), |_| async move {
                let response = self
                    .request(Method::GET, url)
                    .header(RANGE, "bytes=0-0")
                    .send()
                    .await
                    .map_err(send_error)?;

                let status = response.status();
                match status {
                    StatusCode::PARTIAL_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE => {
                        content_range_total(response.headers()).ok_or_else(|| {
                            Attempt::Fatal(FetchError::Rejected {
                                url: url.to_string(),
                                status: status.as_u16(),
                            })
                        })
                    }
                    StatusCode::OK => match header_u64(response.headers(), CONTENT_LENGTH.as_str()) {
                        Some(len) => Ok(len),
                        None => {
                            let body = response.bytes().await.map_err(body_error)?;
                            Ok(body.len() as u64)
                        }
                    },
                    other => Err(classify_status(other, url)),
                }
            })
            .await
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn object_size(&self, url: &str) -> Result<u64, FetchError> {
        if reqwest::Url::parse(url).is_err() {
            return Err(FetchError::NotFound(format!("invalid URL '{}'", url)));
        }

        let head = self
            .policy
            .run(&format!("HEAD {}", url), |_| async move {
                let response = self
                    .request(Method::HEAD, url)
                    .send()
                    .await
                    .map_err(send_error)?;

                let status = response.status();
                if status.is_success() {
                    return Ok(header_u64(response.headers(), CONTENT_LENGTH.as_str()));
                }
                match status {
                    StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => Ok(None),
                    other => Err(classify_status(other, url)),
                }
            })
            .await?;

        match head {
            Some(size) => {
                debug!("HEAD {} -> {} bytes", url, size);
                Ok(size)
            }
            None => {
                debug!("HEAD {} gave no length, probing with a range request", url);
                self.probe_size(url).await
            }
        }
    }

    async fn fetch(&self, file: &RemoteFile, offset: u64, len: usize) -> Result<Bytes, FetchError> {
        let Some((start, end)) = clamp_range(file, offset, len) else {
            return Ok(Bytes::new());
        };
        let expected = (end - start + 1) as usize;
        let url = file.url();

        self.policy
            .run(&format!("GET {} bytes={}-{}", url, start, end), |_| async move {
                let response = self
                    .request(Method::GET, url)
                    .header(RANGE, format!("bytes={}-{}", start, end))
                    .send()
                    .await
                    .map_err(send_error)?;

                match response.status() {
                    StatusCode::PARTIAL_CONTENT => {
                        if let Some(total) = content_range_total(response.headers()) {
                            if total != file.size() {
                                return Err(Attempt::Fatal(FetchError::NotFound(format!(
                                    "{} changed size: opened with {} bytes, server reports {}",
                                    url,
                                    file.size(),
                                    total
                                ))));
                            }
                        }
                        let body = response.bytes().await.map_err(body_error)?;
                        if body.len() != expected {
                            return Err(Attempt::Transient(format!(
                                "short body: {} of {} bytes",
                                body.len(),
                                expected
                            )));
                        }
                        Ok(body)
                    }
                    StatusCode::OK => {
                        // Server ignored the Range header and sent everything
                        let body = response.bytes().await.map_err(body_error)?;
                        if body.len() as u64 != file.size() {
                            return Err(Attempt::Fatal(FetchError::NotFound(format!(
                                "{} changed size: opened with {} bytes, server sent {}",
                                url,
                                file.size(),
                                body.len()
                            ))));
                        }
                        Ok(body.slice(start as usize..=end as usize))
                    }
                    StatusCode::RANGE_NOT_SATISFIABLE => Err(Attempt::Fatal(FetchError::NotFound(
                        format!("{} no longer covers bytes {}-{}", url, start, end),
                    ))),
                    other => Err(classify_status(other, url)),
                }
            })
            .await
    }
}

fn classify_status(status: StatusCode, url: &str) -> Attempt {
    match status.as_u16() {
        404 | 410 => Attempt::Fatal(FetchError::NotFound(url.to_string())),
        408 | 429 | 500 | 502 | 503 | 504 => Attempt::Transient(format!("HTTP {}", status.as_u16())),
        code => Attempt::Fatal(FetchError::Rejected {
            url: url.to_string(),
            status: code,
        }),
    }
}

fn send_error(err: reqwest::Error) -> Attempt {
    if err.is_builder() {
        Attempt::Fatal(FetchError::NotFound(format!("invalid request: {}", err)))
    } else {
        Attempt::Transient(err.to_string())
    }
}

fn body_error(err: reqwest::Error) -> Attempt {
    Attempt::Transient(format!("failed to read body: {}", err))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Total length from `Content-Range: bytes a-b/TOTAL` or `bytes */TOTAL`
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}
