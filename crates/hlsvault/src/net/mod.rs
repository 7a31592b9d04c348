//! Per-host networking: session pool, adaptive timeouts and the guarded
//! request path every playlist, key and segment fetch goes through.

mod health;
mod http;
mod pool;
mod timeout;

pub use health::HostHealthRecord;
pub use http::{FetchRequest, FetchedBody, HttpFetcher};
pub use pool::{ConnectionPool, HostPoolStats, PoolStats, PooledConnection};
pub use timeout::{AdaptiveTimeoutTracker, LatencyStats};

use url::Url;

use crate::error::{DownloadError, Result};

/// Key identifying a host for pooling, timeouts and circuit breaking.
pub fn host_key(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| DownloadError::parse(format!("URL `{url}` has no host")))?;
    match url.port_or_known_default() {
        Some(port) => Ok(format!("{host}:{port}")),
        None => Ok(host.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_includes_default_port() {
        let url = Url::parse("https://cdn.example.com/a/b.ts").unwrap();
        assert_eq!(host_key(&url).unwrap(), "cdn.example.com:443");
        let url = Url::parse("http://127.0.0.1:8080/x").unwrap();
        assert_eq!(host_key(&url).unwrap(), "127.0.0.1:8080");
    }

    #[test]
    fn host_key_rejects_hostless_urls() {
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert!(host_key(&url).is_err());
    }
}
