// Segment decryption and per-task key caching.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use aes::Aes128;
use bytes::Bytes;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use moka::future::Cache;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::config::DecryptionConfig;
use crate::error::{DownloadError, EncryptionStage, Result};
use crate::metrics::EngineMetrics;
use crate::model::{EncryptionDescriptor, EncryptionMethod};
use crate::net::{FetchRequest, HttpFetcher};
use crate::resilience::RequestKind;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

const BLOCK: usize = 16;

/// AES-128-CBC with PKCS#7, optionally run on the blocking pool.
#[derive(Debug, Clone)]
pub struct Decryptor {
    offload: bool,
    offload_min_bytes: usize,
    metrics: Option<Arc<EngineMetrics>>,
}

impl Decryptor {
    pub fn new(config: &DecryptionConfig) -> Self {
        Self {
            offload: config.offload_to_blocking,
            offload_min_bytes: config.offload_min_bytes,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decrypt one buffer. Padding failures are reported as retryable: the
    /// usual cause is a truncated or corrupt download.
    pub fn decrypt(ciphertext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
            return Err(DownloadError::Encryption {
                stage: EncryptionStage::Padding,
                reason: format!(
                    "ciphertext length {} is not a positive multiple of {BLOCK}",
                    ciphertext.len()
                ),
                retryable: true,
            });
        }

        let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
            DownloadError::encryption(EncryptionStage::KeyInvalid, format!("bad key or IV: {e}"))
        })?;
        let mut buffer = ciphertext.to_vec();
        let len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| DownloadError::Encryption {
                stage: EncryptionStage::Padding,
                reason: format!("invalid PKCS#7 padding: {e}"),
                retryable: true,
            })?
            .len();
        buffer.truncate(len);
        Ok(Bytes::from(buffer))
    }

    /// AES-128-CBC encrypt with PKCS#7 padding.
    pub fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Bytes {
        let cipher = Aes128CbcEnc::new(key.into(), iv.into());
        Bytes::from(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    /// Decrypt a downloaded segment according to its descriptor. Unencrypted
    /// segments pass through untouched.
    pub async fn decrypt_segment(
        &self,
        data: Bytes,
        descriptor: &EncryptionDescriptor,
        key: Option<[u8; 16]>,
        media_sequence: u64,
    ) -> Result<Bytes> {
        match &descriptor.method {
            EncryptionMethod::None => return Ok(data),
            EncryptionMethod::Aes128 => {}
            EncryptionMethod::SampleAes => {
                return Err(DownloadError::encryption(
                    EncryptionStage::Unsupported,
                    "SAMPLE-AES segments are not supported",
                ));
            }
            EncryptionMethod::Unknown(method) => {
                return Err(DownloadError::encryption(
                    EncryptionStage::Unsupported,
                    format!("unsupported encryption method `{method}`"),
                ));
            }
        }

        let key = key.ok_or_else(|| {
            DownloadError::encryption(EncryptionStage::KeyInvalid, "AES-128 segment without a key")
        })?;
        let iv = descriptor.iv_for(media_sequence);
        let started = Instant::now();
        let len = data.len();

        let plaintext = if self.offload && len >= self.offload_min_bytes {
            tokio::task::spawn_blocking(move || Self::decrypt(&data, &key, &iv))
                .await
                .map_err(|e| DownloadError::resource(format!("decryption task failed: {e}")))??
        } else {
            Self::decrypt(&data, &key, &iv)?
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_decryption(len as u64, started.elapsed());
        }
        trace!(bytes = len, media_sequence, "Decrypted segment");
        Ok(plaintext)
    }
}

/// Keys for one task, fetched once per key URL.
///
/// Never shared between tasks. Failed fetches are not cached.
pub struct KeyCache {
    fetcher: Arc<HttpFetcher>,
    headers: HeaderMap,
    keys: Cache<Url, [u8; 16]>,
}

impl KeyCache {
    pub fn new(fetcher: Arc<HttpFetcher>, headers: HeaderMap) -> Self {
        Self {
            fetcher,
            headers,
            keys: Cache::builder().max_capacity(1024).build(),
        }
    }

    pub async fn key_for(&self, url: &Url, cancel: &CancellationToken) -> Result<[u8; 16]> {
        let fetched = AtomicBool::new(false);
        let result = self
            .keys
            .try_get_with(url.clone(), async {
                fetched.store(true, Ordering::Relaxed);
                self.fetch_key(url, cancel).await
            })
            .await;

        let metrics = self.fetcher.metrics();
        if fetched.load(Ordering::Relaxed) {
            metrics.record_key_cache_miss();
        } else {
            metrics.record_key_cache_hit();
        }
        result.map_err(|shared| rebuild(&shared))
    }

    async fn fetch_key(&self, url: &Url, cancel: &CancellationToken) -> Result<[u8; 16]> {
        let body = self
            .fetcher
            .fetch(FetchRequest::new(url, RequestKind::Key, &self.headers), cancel)
            .await
            .map_err(|e| match e {
                DownloadError::Cancelled | DownloadError::CircuitOpen { .. } => e,
                other => DownloadError::Encryption {
                    stage: EncryptionStage::KeyFetch,
                    retryable: other.is_retryable(),
                    reason: format!("fetching key {url}: {other}"),
                },
            })?;

        let key: [u8; 16] = body.bytes.as_ref().try_into().map_err(|_| {
            DownloadError::encryption(
                EncryptionStage::KeyInvalid,
                format!(
                    "key from {url} is {} bytes, expected 16",
                    body.bytes.len()
                ),
            )
        })?;
        debug!(url = %url, "Fetched decryption key");
        Ok(key)
    }
}

/// Reconstruct an error shared by the cache between concurrent waiters.
fn rebuild(err: &DownloadError) -> DownloadError {
    match err {
        DownloadError::Cancelled => DownloadError::Cancelled,
        DownloadError::CircuitOpen { host, retry_after } => DownloadError::CircuitOpen {
            host: host.clone(),
            retry_after: *retry_after,
        },
        DownloadError::Encryption {
            stage,
            reason,
            retryable,
        } => DownloadError::Encryption {
            stage: *stage,
            reason: reason.clone(),
            retryable: *retryable,
        },
        other => DownloadError::Encryption {
            stage: EncryptionStage::KeyFetch,
            reason: other.to_string(),
            retryable: other.is_retryable(),
        },
    }
}
