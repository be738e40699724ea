//! HTTP(S) transfer source using byte-range requests
//!
//! Status handling:
//! - `206` with a matching `Content-Range` resumes at the requested offset
//! - `200` means the server ignored the range; the caller restarts from zero
//! - `416` with a total equal to the offset means the partial file is already complete
//! - `429` and `5xx` are transient; other `4xx` are permanent

use super::classify::is_retryable_status;
use super::{
    parse_checksum_sidecar, RetryErrorType, SourceStream, TransferConfig, TransferError,
    TransferSource,
};
use crate::locator::SourceLocator;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

/// Reads `http://` and `https://` locators with a blocking reqwest client
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    use_sidecar: bool,
}

impl HttpSource {
    /// Build a source whose client honours the configured timeouts
    pub fn new(config: &TransferConfig) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransferError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            use_sidecar: config.verify_checksums,
        })
    }

    fn url<'a>(&self, locator: &'a SourceLocator) -> Result<&'a str, TransferError> {
        match locator {
            SourceLocator::Http(url) => Ok(url),
            other => Err(TransferError::Permanent(format!("not an HTTP locator: {other}"))),
        }
    }

    fn send(&self, url: &str, offset: u64) -> Result<Response, TransferError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        request.send().map_err(|e| {
            warn!(url, error = %e, "Network error");
            TransferError::transient(RetryErrorType::from_reqwest(&e), e.to_string())
        })
    }
}

/// Map a non-success status to a transfer error
fn status_error(url: &str, status: StatusCode) -> TransferError {
    let kind = RetryErrorType::from_status(status.as_u16());
    if is_retryable_status(status) {
        warn!(url, status = status.as_u16(), "Retryable server response");
        TransferError::transient(kind, format!("HTTP {status} from {url}"))
    } else {
        TransferError::Permanent(format!("HTTP {status} from {url}: {}", kind.description()))
    }
}

/// Parsed `Content-Range: bytes start-end/total` (or `bytes */total`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: Option<u64>,
    total: Option<u64>,
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let start = match range.trim() {
        "*" => None,
        r => Some(r.split_once('-')?.0.trim().parse().ok()?),
    };
    Some(ContentRange { start, total })
}

fn content_range(response: &Response) -> Option<ContentRange> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
}

fn header_len(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

impl TransferSource for HttpSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, locator: &SourceLocator) -> bool {
        matches!(locator, SourceLocator::Http(_))
    }

    fn probe_len(&self, locator: &SourceLocator) -> Result<Option<u64>, TransferError> {
        let url = self.url(locator)?;
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|e| TransferError::transient(RetryErrorType::from_reqwest(&e), e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }
        // HEAD bodies are empty, so read the header rather than the body size hint
        Ok(header_len(&response))
    }

    fn open(&self, locator: &SourceLocator, offset: u64) -> Result<SourceStream, TransferError> {
        let url = self.url(locator)?;
        let response = self.send(url, offset)?;
        let status = response.status();
        debug!(url, offset, status = status.as_u16(), "Opened HTTP stream");

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let range = content_range(&response).ok_or_else(|| {
                    TransferError::Permanent(format!("HTTP 206 from {url} without a Content-Range"))
                })?;
                if range.start != Some(offset) {
                    return Err(TransferError::Permanent(format!(
                        "requested bytes from {offset} but {url} answered {:?}",
                        range.start
                    )));
                }
                Ok(SourceStream {
                    reader: Box::new(response),
                    start_offset: offset,
                    total_len: range.total,
                })
            }
            StatusCode::OK => {
                if offset > 0 {
                    info!(url, offset, "Server ignored range request; restarting from zero");
                }
                let total_len = header_len(&response);
                Ok(SourceStream {
                    reader: Box::new(response),
                    start_offset: 0,
                    total_len,
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let total = content_range(&response).and_then(|r| r.total);
                if total == Some(offset) {
                    debug!(url, offset, "Partial file already holds the whole object");
                    Ok(SourceStream {
                        reader: Box::new(std::io::empty()),
                        start_offset: offset,
                        total_len: total,
                    })
                } else if offset > 0 {
                    info!(url, offset, ?total, "Range not satisfiable; restarting from zero");
                    self.open(locator, 0)
                } else {
                    Err(status_error(url, status))
                }
            }
            s if s.is_success() => Err(TransferError::Permanent(format!(
                "unexpected HTTP {s} from {url}"
            ))),
            s => Err(status_error(url, s)),
        }
    }

    fn fetch_checksum(&self, locator: &SourceLocator) -> Result<Option<String>, TransferError> {
        if !self.use_sidecar {
            return Ok(None);
        }
        let url = format!("{}.sha256", self.url(locator)?);
        let response = match self.client.get(&url).send() {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Checksum sidecar unavailable");
                return Ok(None);
            }
        };
        if !response.status().is_success() {
            debug!(url = %url, status = response.status().as_u16(), "No checksum sidecar");
            return Ok(None);
        }
        let body = response
            .text()
            .map_err(|e| TransferError::transient(RetryErrorType::from_reqwest(&e), e.to_string()))?;
        Ok(parse_checksum_sidecar(&body))
    }
}
