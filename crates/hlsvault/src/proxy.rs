use reqwest::Proxy;
use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy used by every per-host session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub auth: Option<ProxyAuth>,
}

pub fn build_proxy(config: &ProxyConfig) -> Result<Proxy> {
    let proxy_url = &config.url;

    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(proxy_url).map_err(|e| {
            DownloadError::configuration(format!("invalid HTTP proxy URL `{proxy_url}`: {e}"))
        })?,
        ProxyType::Https => Proxy::https(proxy_url).map_err(|e| {
            DownloadError::configuration(format!("invalid HTTPS proxy URL `{proxy_url}`: {e}"))
        })?,
        ProxyType::Socks5 => {
            let url = if proxy_url.starts_with("socks5://") || proxy_url.starts_with("socks5h://") {
                proxy_url.to_string()
            } else {
                format!("socks5://{proxy_url}")
            };
            Proxy::all(&url).map_err(|e| {
                DownloadError::configuration(format!("invalid SOCKS5 proxy URL `{url}`: {e}"))
            })?
        }
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_scheme_is_added_when_missing() {
        let config = ProxyConfig {
            url: "127.0.0.1:1080".to_string(),
            proxy_type: ProxyType::Socks5,
            auth: None,
        };
        assert!(build_proxy(&config).is_ok());
    }

    #[test]
    fn malformed_proxy_url_is_a_configuration_error() {
        let config = ProxyConfig {
            url: "http://[::1".to_string(),
            proxy_type: ProxyType::Http,
            auth: None,
        };
        assert!(matches!(
            build_proxy(&config),
            Err(DownloadError::Configuration { .. })
        ));
    }
}
