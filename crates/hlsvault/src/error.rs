use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;

use crate::model::TaskStatus;

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Which phase of a network request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkFailure {
    Dns,
    Connect,
    Request,
    Body,
    Other,
}

/// Where in the key/decrypt pipeline an encryption error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionStage {
    KeyFetch,
    KeyInvalid,
    InvalidIv,
    Padding,
    Unsupported,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network error ({kind:?}) for {url}: {reason}")]
    Network {
        url: String,
        kind: NetworkFailure,
        reason: String,
    },

    #[error("request to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("encryption error ({stage:?}): {reason}")]
    Encryption {
        stage: EncryptionStage,
        reason: String,
        retryable: bool,
    },

    #[error("{} failed validation: {reason}", validation_target(.segment_index))]
    Validation {
        /// `None` for the init section.
        segment_index: Option<u64>,
        reason: String,
    },

    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resource error: {reason}")]
    Resource { reason: String },

    #[error("playlist parse error: {reason}")]
    Parse { reason: String },

    #[error("circuit open for host {host}, retry in {retry_after:?}")]
    CircuitOpen { host: String, retry_after: Duration },

    #[error("merge failed: {reason} (expected {expected_bytes} bytes, wrote {actual_bytes})")]
    Merge {
        reason: String,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    #[error("task exceeded its time budget of {budget:?}")]
    TimeoutExceeded { budget: Duration },

    #[error("download cancelled")]
    Cancelled,

    #[error("task `{task_id}` not found")]
    TaskNotFound { task_id: String },

    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task `{task_id}` is {status}")]
    TaskActive { task_id: String, status: TaskStatus },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

/// Machine-readable failure category surfaced to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Http,
    Encryption,
    Validation,
    Filesystem,
    Resource,
    Parse,
    CircuitOpen,
    Merge,
    TimeoutExceeded,
    Cancelled,
    Usage,
}

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Affects a single task.
    Task,
    /// May affect the whole engine; the collaborator decides what to do.
    Engine,
}

/// A surfaced failure: category, severity, message and what to try next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub suggested_actions: Vec<String>,
}

impl DownloadError {
    pub fn network(url: impl Into<String>, kind: NetworkFailure, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            kind,
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            retry_after: None,
        }
    }

    pub fn encryption(stage: EncryptionStage, reason: impl Into<String>) -> Self {
        Self::Encryption {
            stage,
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn validation(segment_index: Option<u64>, reason: impl Into<String>) -> Self {
        Self::Validation {
            segment_index,
            reason: reason.into(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn resource(reason: impl Into<String>) -> Self {
        Self::Resource {
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    /// Map a reqwest error onto the taxonomy. Timeouts are reported by the
    /// caller, which knows the timeout that was applied.
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_connect() {
            let text = format!("{err:?}").to_ascii_lowercase();
            if text.contains("dns") || text.contains("resolve") || text.contains("lookup") {
                NetworkFailure::Dns
            } else {
                NetworkFailure::Connect
            }
        } else if err.is_body() || err.is_decode() {
            NetworkFailure::Body
        } else if err.is_request() {
            NetworkFailure::Request
        } else {
            NetworkFailure::Other
        };
        Self::network(url, kind, err.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => ErrorCategory::Network,
            Self::HttpStatus { .. } => ErrorCategory::Http,
            Self::Encryption { .. } => ErrorCategory::Encryption,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Filesystem { .. } => ErrorCategory::Filesystem,
            Self::Resource { .. } => ErrorCategory::Resource,
            Self::Parse { .. } => ErrorCategory::Parse,
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::Merge { .. } => ErrorCategory::Merge,
            Self::TimeoutExceeded { .. } => ErrorCategory::TimeoutExceeded,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::TaskNotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::TaskActive { .. }
            | Self::Configuration { .. } => ErrorCategory::Usage,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Filesystem { .. } | Self::Resource { .. } => Severity::Engine,
            _ => Severity::Task,
        }
    }

    /// Whether a request that failed this way should count against the host's
    /// circuit breaker. Client errors and local failures say nothing about the
    /// host's health.
    pub fn is_host_failure(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Check if this error is likely transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::CircuitOpen { .. } => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Encryption { retryable, .. } => *retryable,
            Self::Validation { .. } => true,
            Self::Filesystem { .. }
            | Self::Resource { .. }
            | Self::Parse { .. }
            | Self::Merge { .. }
            | Self::TimeoutExceeded { .. }
            | Self::Cancelled
            | Self::TaskNotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::TaskActive { .. }
            | Self::Configuration { .. } => false,
        }
    }

    pub fn suggested_actions(&self) -> &'static [&'static str] {
        match self {
            Self::Network { kind: NetworkFailure::Dns, .. } => &[
                "check DNS resolution for the stream host",
                "check network connectivity",
            ],
            Self::Network { .. } | Self::Timeout { .. } => &[
                "check network connectivity",
                "retry later or lower the worker count",
            ],
            Self::HttpStatus { status, .. } if status.is_client_error() => match status.as_u16() {
                401 | 403 => &[
                    "verify the request headers (cookies, Referer, Authorization)",
                    "the stream URL may have expired; fetch a fresh one",
                ],
                404 | 410 => &["verify URL still valid", "fetch a fresh playlist URL"],
                429 => &["reduce concurrency", "retry later"],
                _ => &["verify URL still valid"],
            },
            Self::HttpStatus { .. } => &["the server is failing; retry later"],
            Self::Encryption { stage, .. } => match stage {
                EncryptionStage::KeyFetch | EncryptionStage::KeyInvalid => &[
                    "verify the key URL is reachable with the task headers",
                    "the key may require authentication",
                ],
                EncryptionStage::Unsupported => &["this encryption method is not supported"],
                EncryptionStage::InvalidIv | EncryptionStage::Padding => {
                    &["the segment or key is corrupt; retry the task"]
                }
            },
            Self::Validation { .. } => &["the server returned corrupt data; retry the task"],
            Self::Filesystem { .. } => &[
                "check free disk space",
                "check permissions on the output and temp directories",
            ],
            Self::Resource { .. } => &[
                "reduce concurrent tasks",
                "pause all tasks and restart the engine",
            ],
            Self::Parse { .. } => &["verify URL still valid", "verify the URL points to an M3U8 playlist"],
            Self::CircuitOpen { .. } => &["the host is failing repeatedly; retry later"],
            Self::Merge { .. } => &[
                "segment files were kept in the temp directory for manual recovery",
                "check free disk space",
            ],
            Self::TimeoutExceeded { .. } => &["raise the task time budget", "check network speed"],
            Self::Cancelled => &[],
            Self::TaskNotFound { .. } | Self::InvalidTransition { .. } => {
                &["refresh the task list"]
            }
            Self::TaskActive { .. } => &["pause or cancel the task first"],
            Self::Configuration { .. } => &["fix the engine configuration"],
        }
    }

    pub fn report(&self) -> FailureReport {
        FailureReport {
            category: self.category(),
            severity: self.severity(),
            message: self.to_string(),
            suggested_actions: self
                .suggested_actions()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

fn validation_target(segment_index: &Option<u64>) -> String {
    match segment_index {
        Some(index) => format!("segment {index}"),
        None => "init section".to_string(),
    }
}

/// Parse a `Retry-After` header value given in delta-seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable_except_429() {
        let not_found = DownloadError::http_status(StatusCode::NOT_FOUND, "http://a/x");
        assert!(!not_found.is_retryable());
        assert!(!not_found.is_host_failure());

        let throttled = DownloadError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://a/x");
        assert!(throttled.is_retryable());
        assert!(throttled.is_host_failure());

        let unavailable = DownloadError::http_status(StatusCode::SERVICE_UNAVAILABLE, "http://a/x");
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn filesystem_and_resource_errors_are_engine_severity() {
        let fs = DownloadError::filesystem(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(fs.severity(), Severity::Engine);
        assert_eq!(DownloadError::resource("pool closed").severity(), Severity::Engine);
        assert_eq!(DownloadError::parse("bad").severity(), Severity::Task);
    }

    #[test]
    fn report_carries_category_and_actions() {
        let err = DownloadError::network("http://a/x", NetworkFailure::Connect, "refused");
        let report = err.report();
        assert_eq!(report.category, ErrorCategory::Network);
        assert!(report
            .suggested_actions
            .iter()
            .any(|a| a.contains("network connectivity")));
    }

    #[test]
    fn retry_after_accepts_delta_seconds() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
