//! Retry classification and retry log formatting for transfers.
//!
//! Every transient failure is tagged with a [`RetryErrorType`] so the retry
//! loop can decide whether to try again and print a line a human can act on.

use reqwest::StatusCode;
use std::io;
use std::time::Duration;

/// Classification of transfer errors for retry decisions and user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Network timeout or a read that stalled long enough to time out
    NetworkTimeout,
    /// Connection refused or reset, DNS failure, or other offline scenarios
    NetworkOffline,
    /// HTTP 429 rate limit exceeded
    RateLimit,
    /// HTTP 5xx server error
    ServerError(u16),
    /// Authentication failures (401/403)
    AuthFailed(u16),
    /// Other client errors (4xx, except 429)
    ClientError(u16),
    /// Body ended before the declared length
    Truncated,
    /// Generic fallback when no better classification fits
    NetworkGeneric,
}

impl RetryErrorType {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => RetryErrorType::AuthFailed(status),
            429 => RetryErrorType::RateLimit,
            500..=599 => RetryErrorType::ServerError(status),
            400..=499 => RetryErrorType::ClientError(status),
            _ => RetryErrorType::NetworkGeneric,
        }
    }

    /// Classify an I/O error raised while reading a source.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RetryErrorType::NetworkTimeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => RetryErrorType::NetworkOffline,
            io::ErrorKind::UnexpectedEof => RetryErrorType::Truncated,
            _ => RetryErrorType::NetworkGeneric,
        }
    }

    /// Classify a reqwest error, preferring its status when it has one.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16());
        }
        if err.is_timeout() {
            return RetryErrorType::NetworkTimeout;
        }
        if err.is_connect() {
            return RetryErrorType::NetworkOffline;
        }
        RetryErrorType::NetworkGeneric
    }

    /// Short description used inside retry log messages.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::AuthFailed(code) => match code {
                401 => "authentication failed (401)",
                403 => "access denied (403)",
                _ => "authentication failed",
            },
            Self::ClientError(code) => match code {
                404 => "artifact not found",
                410 => "artifact gone",
                _ => "client error",
            },
            Self::Truncated => "connection closed early",
            Self::NetworkGeneric => "network error",
        }
    }

    /// Suggested remediation shown once retries are exhausted.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check network connectivity or raise the read timeout",
            Self::NetworkOffline => "Verify the source host is reachable and DNS resolves",
            Self::RateLimit => "Lower --max-workers or wait before retrying",
            Self::ServerError(_) => "The source server may be overloaded, try again later",
            Self::AuthFailed(_) => "Check credentials and access rights for the source",
            Self::ClientError(_) => "Check the source locator for typos",
            Self::Truncated => "Rerun the batch; the transfer resumes from the partial file",
            Self::NetworkGeneric => "Check network connectivity and try again",
        }
    }

    /// Whether the error type is typically retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RetryErrorType::AuthFailed(_) | RetryErrorType::ClientError(_)
        )
    }
}

/// Context for one retry decision, used to format log lines.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Classification of the failure
    pub error_type: RetryErrorType,
    /// Wait before the next attempt
    pub backoff_duration: Duration,
    /// Bytes confirmed in the partial file so far
    pub bytes_confirmed: u64,
    /// Source being transferred
    pub source: String,
}

impl RetryContext {
    /// Standardized retry message with attempt counters and context.
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds... ({}, {} bytes kept)",
            self.attempt + 1,
            self.max_attempts,
            self.error_type.description(),
            self.backoff_duration.as_secs_f64(),
            self.source,
            self.bytes_confirmed
        )
    }

    /// Final failure summary with an actionable suggestion.
    pub fn format_failure(&self, last_error: &str) -> String {
        format!(
            "transfer of {} failed after {} attempts: {} ({}; suggestion: {})",
            self.source,
            self.max_attempts,
            last_error,
            self.error_type.description(),
            self.error_type.suggestion()
        )
    }
}

/// Whether an HTTP status should be retried.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}
