//! Playlist interpretation.
//!
//! Turns `#EXTM3U` text into the [`Stream`] model: master playlists become a
//! list of variants (segments empty), media playlists a single stream with
//! absolute segment URLs, carried-forward keys and resolved byte ranges.
//! Nothing here retries; callers go through the retry coordinator.

use std::sync::Arc;

use bytes::Bytes;
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, parse_playlist_res};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{DownloadError, Result};
use crate::model::{
    ByteRange, EncryptionDescriptor, EncryptionMethod, InitSection, Resolution, Segment, Stream,
};
use crate::net::{FetchRequest, HttpFetcher};
use crate::resilience::RequestKind;

/// How a variant is picked from a master playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantSelectionPolicy {
    #[default]
    HighestBandwidth,
    LowestBandwidth,
    ClosestToBandwidth(u64),
    /// Exact resolution when listed, otherwise the variant nearest in pixel count.
    MatchingResolution { width: u64, height: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistDocument {
    Master(Vec<Stream>),
    Media(Stream),
}

/// A fetched and parsed playlist together with the bytes it came from.
#[derive(Debug, Clone)]
pub struct LoadedPlaylist {
    pub url: Url,
    pub raw: Bytes,
    pub document: PlaylistDocument,
}

/// A media stream ready to download.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub stream: Stream,
    /// Checksum of the media playlist the segments were read from.
    pub checksum: String,
}

/// Hex SHA-256 of playlist bytes, used to spot stale recovery state.
pub fn playlist_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn parse_playlist(bytes: &[u8], base_url: &Url) -> Result<PlaylistDocument> {
    let text = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let first_non_space = text.iter().position(|b| !b.is_ascii_whitespace());
    if !first_non_space.is_some_and(|i| text[i..].starts_with(b"#EXTM3U")) {
        return Err(DownloadError::parse(format!(
            "{base_url} is not an M3U8 playlist (missing #EXTM3U)"
        )));
    }

    match parse_playlist_res(text) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => parse_master(&pl, base_url),
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => parse_media(&pl, base_url),
        Err(e) => Err(DownloadError::parse(format!(
            "failed to parse playlist {base_url}: {e}"
        ))),
    }
}

fn parse_master(pl: &MasterPlaylist, base_url: &Url) -> Result<PlaylistDocument> {
    let mut streams = Vec::with_capacity(pl.variants.len());
    for variant in pl.variants.iter().filter(|v| !v.is_i_frame) {
        let url = join(base_url, &variant.uri)?;
        streams.push(Stream {
            url,
            bandwidth: variant.bandwidth,
            resolution: variant.resolution.as_ref().map(|r| Resolution {
                width: r.width,
                height: r.height,
            }),
            codecs: variant.codecs.clone(),
            segments: Vec::new(),
            encryption: Arc::new(EncryptionDescriptor::none()),
            init_section: None,
            target_duration: 0.0,
            is_live: false,
        });
    }
    if streams.is_empty() {
        return Err(DownloadError::parse(format!(
            "master playlist {base_url} lists no playable variants"
        )));
    }
    Ok(PlaylistDocument::Master(streams))
}

fn parse_media(pl: &MediaPlaylist, base_url: &Url) -> Result<PlaylistDocument> {
    if pl.segments.is_empty() {
        return Err(DownloadError::parse(format!(
            "media playlist {base_url} has no segments"
        )));
    }

    let unencrypted = Arc::new(EncryptionDescriptor::none());
    let mut key = Arc::clone(&unencrypted);
    let mut init_section: Option<InitSection> = None;
    // (uri, end offset) of the last ranged segment, for implicit offsets
    let mut last_range: Option<(Url, u64)> = None;
    let mut segments = Vec::with_capacity(pl.segments.len());

    for (position, seg) in pl.segments.iter().enumerate() {
        let index = position as u64;
        if let Some(k) = &seg.key {
            key = Arc::new(descriptor_from_key(k, base_url)?);
        }

        if let Some(map) = &seg.map {
            let url = join(base_url, &map.uri)?;
            let byte_range = map
                .byte_range
                .as_ref()
                .map(|br| ByteRange {
                    offset: br.offset.unwrap_or(0),
                    length: br.length,
                });
            if let Some(existing) = &init_section {
                if existing.url != url || existing.byte_range != byte_range {
                    warn!(
                        playlist = %base_url,
                        segment = index,
                        "Playlist switches EXT-X-MAP mid-stream; keeping the first init section"
                    );
                }
            } else {
                init_section = Some(InitSection {
                    url,
                    byte_range,
                    encryption: Arc::clone(&key),
                });
            }
        }

        let url = join(base_url, &seg.uri)?;
        let byte_range = match &seg.byte_range {
            None => {
                last_range = None;
                None
            }
            Some(br) => {
                let offset = match (br.offset, &last_range) {
                    (Some(offset), _) => offset,
                    (None, Some((prev_url, end))) if *prev_url == url => *end,
                    (None, _) => {
                        return Err(DownloadError::parse(format!(
                            "segment {index} has a BYTERANGE without offset and no preceding range on {url}"
                        )));
                    }
                };
                last_range = Some((url.clone(), offset + br.length));
                Some(ByteRange {
                    offset,
                    length: br.length,
                })
            }
        };

        segments.push(Segment {
            sequence_index: index,
            media_sequence: pl.media_sequence + index,
            url,
            byte_range,
            duration: f64::from(seg.duration),
            encryption: Arc::clone(&key),
        });
    }

    let is_live = !pl.end_list;
    if is_live {
        warn!(
            playlist = %base_url,
            segments = segments.len(),
            "Playlist has no EXT-X-ENDLIST; downloading the segments listed now"
        );
    }

    let encryption = segments
        .first()
        .map(|s| Arc::clone(&s.encryption))
        .unwrap_or(unencrypted);

    Ok(PlaylistDocument::Media(Stream {
        url: base_url.clone(),
        bandwidth: 0,
        resolution: None,
        codecs: None,
        segments,
        encryption,
        init_section,
        target_duration: pl.target_duration as f64,
        is_live,
    }))
}

fn descriptor_from_key(key: &m3u8_rs::Key, base_url: &Url) -> Result<EncryptionDescriptor> {
    let method = match &key.method {
        KeyMethod::None => return Ok(EncryptionDescriptor::none()),
        KeyMethod::AES128 => EncryptionMethod::Aes128,
        KeyMethod::SampleAES => EncryptionMethod::SampleAes,
        KeyMethod::Other(other) => EncryptionMethod::Unknown(other.clone()),
    };

    let key_url = key.uri.as_deref().map(|uri| join(base_url, uri)).transpose()?;
    if method == EncryptionMethod::Aes128 && key_url.is_none() {
        return Err(DownloadError::parse("EXT-X-KEY METHOD=AES-128 without URI"));
    }
    let iv = key.iv.as_deref().map(parse_iv).transpose()?;

    Ok(EncryptionDescriptor {
        method,
        key_url,
        iv,
    })
}

fn parse_iv(value: &str) -> Result<[u8; 16]> {
    let hex_str = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let mut iv = [0u8; 16];
    hex::decode_to_slice(hex_str, &mut iv)
        .map_err(|e| DownloadError::parse(format!("invalid IV `{value}`: {e}")))?;
    Ok(iv)
}

fn join(base: &Url, reference: &str) -> Result<Url> {
    base.join(reference.trim()).map_err(|e| {
        DownloadError::parse(format!("cannot resolve `{reference}` against {base}: {e}"))
    })
}

/// Pick one variant. `None` only when `variants` is empty.
pub fn select_variant<'a>(
    variants: &'a [Stream],
    policy: &VariantSelectionPolicy,
) -> Option<&'a Stream> {
    // ties keep the first listed variant
    match *policy {
        VariantSelectionPolicy::HighestBandwidth => variants
            .iter()
            .reduce(|best, s| if s.bandwidth > best.bandwidth { s } else { best }),
        VariantSelectionPolicy::LowestBandwidth => variants
            .iter()
            .reduce(|best, s| if s.bandwidth < best.bandwidth { s } else { best }),
        VariantSelectionPolicy::ClosestToBandwidth(target) => variants
            .iter()
            .reduce(|best, s| {
                if s.bandwidth.abs_diff(target) < best.bandwidth.abs_diff(target) {
                    s
                } else {
                    best
                }
            }),
        VariantSelectionPolicy::MatchingResolution { width, height } => {
            let wanted = width.saturating_mul(height);
            let exact = variants
                .iter()
                .filter(|s| s.resolution == Some(Resolution { width, height }))
                .reduce(|best, s| if s.bandwidth > best.bandwidth { s } else { best });
            exact.or_else(|| {
                variants
                    .iter()
                    .filter(|s| s.resolution.is_some())
                    .min_by_key(|s| {
                        s.resolution
                            .map(|r| r.width.saturating_mul(r.height).abs_diff(wanted))
                            .unwrap_or(u64::MAX)
                    })
                    .or_else(|| select_variant(variants, &VariantSelectionPolicy::HighestBandwidth))
            })
        }
    }
}

/// Fetches playlists through the guarded request path.
pub struct PlaylistParser {
    fetcher: Arc<HttpFetcher>,
}

impl PlaylistParser {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }

    /// Fetch and parse one playlist. A single attempt.
    pub async fn load(
        &self,
        url: &Url,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<LoadedPlaylist> {
        let body = self
            .fetcher
            .fetch(FetchRequest::new(url, RequestKind::Playlist, headers), cancel)
            .await?;
        let document = parse_playlist(&body.bytes, url)?;
        debug!(
            url = %url,
            kind = match &document {
                PlaylistDocument::Master(_) => "master",
                PlaylistDocument::Media(_) => "media",
            },
            "Loaded playlist"
        );
        Ok(LoadedPlaylist {
            url: url.clone(),
            raw: body.bytes,
            document,
        })
    }

    /// Load `url` and, for a master playlist, the media playlist of the
    /// variant `policy` picks. A single attempt per playlist.
    pub async fn resolve_stream(
        &self,
        url: &Url,
        headers: &HeaderMap,
        policy: &VariantSelectionPolicy,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStream> {
        let loaded = self.load(url, headers, cancel).await?;
        let variants = match loaded.document {
            PlaylistDocument::Media(stream) => {
                return Ok(ResolvedStream {
                    stream,
                    checksum: playlist_checksum(&loaded.raw),
                });
            }
            PlaylistDocument::Master(variants) => variants,
        };

        let chosen = select_variant(&variants, policy)
            .ok_or_else(|| DownloadError::parse(format!("master playlist {url} has no variants")))?;
        info!(
            master = %url,
            variant = %chosen.url,
            bandwidth = chosen.bandwidth,
            resolution = chosen.resolution.map(|r| r.to_string()).unwrap_or_default(),
            "Selected variant"
        );

        let media = self.load(&chosen.url, headers, cancel).await?;
        match media.document {
            PlaylistDocument::Media(mut stream) => {
                stream.bandwidth = chosen.bandwidth;
                stream.resolution = chosen.resolution;
                stream.codecs = chosen.codecs.clone();
                Ok(ResolvedStream {
                    stream,
                    checksum: playlist_checksum(&media.raw),
                })
            }
            PlaylistDocument::Master(_) => Err(DownloadError::parse(format!(
                "variant {} is itself a master playlist",
                chosen.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::default_iv;
    use proptest::prelude::*;

    fn base() -> Url {
        Url::parse("https://cdn.example.com/live/stream/index.m3u8").unwrap()
    }

    fn media(doc: PlaylistDocument) -> Stream {
        match doc {
            PlaylistDocument::Media(stream) => stream,
            PlaylistDocument::Master(_) => panic!("expected media playlist"),
        }
    }

    fn master(doc: PlaylistDocument) -> Vec<Stream> {
        match doc {
            PlaylistDocument::Master(variants) => variants,
            PlaylistDocument::Media(_) => panic!("expected master playlist"),
        }
    }

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:100
#EXTINF:6.0,
seg0.ts
#EXTINF:6.0,
/abs/seg1.ts
#EXTINF:4.5,
https://other.example.com/seg2.ts
#EXT-X-ENDLIST
";

    #[test]
    fn media_playlist_resolves_urls_and_sequence() {
        let stream = media(parse_playlist(MEDIA.as_bytes(), &base()).unwrap());
        assert_eq!(stream.segments.len(), 3);
        assert!(!stream.is_live);
        assert_eq!(stream.target_duration, 6.0);

        let urls: Vec<_> = stream.segments.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            [
                "https://cdn.example.com/live/stream/seg0.ts",
                "https://cdn.example.com/abs/seg1.ts",
                "https://other.example.com/seg2.ts",
            ]
        );
        assert_eq!(stream.segments[2].media_sequence, 102);
        assert_eq!(stream.segments[2].sequence_index, 2);
        assert!((stream.total_duration() - 16.5).abs() < 1e-6);
    }

    #[test]
    fn keys_carry_forward_until_replaced() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4,
clear.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"key1.bin\"
#EXTINF:4,
a.ts
#EXTINF:4,
b.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/k2\",IV=0X000102030405060708090A0B0C0D0E0F
#EXTINF:4,
c.ts
#EXT-X-KEY:METHOD=NONE
#EXTINF:4,
d.ts
#EXT-X-ENDLIST
";
        let stream = media(parse_playlist(text.as_bytes(), &base()).unwrap());
        let segs = &stream.segments;
        assert!(!segs[0].encryption.is_encrypted());
        assert_eq!(segs[1].encryption.method, EncryptionMethod::Aes128);
        assert!(Arc::ptr_eq(&segs[1].encryption, &segs[2].encryption));
        assert_eq!(
            segs[1].encryption.key_url.as_ref().unwrap().as_str(),
            "https://cdn.example.com/live/stream/key1.bin"
        );
        assert_eq!(segs[1].encryption.iv_for(1), default_iv(1));

        let expected_iv: [u8; 16] = core::array::from_fn(|i| i as u8);
        assert_eq!(segs[3].encryption.iv, Some(expected_iv));
        assert!(!segs[4].encryption.is_encrypted());
    }

    #[test]
    fn implicit_byte_range_offsets_continue_on_same_uri() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"main.mp4\",BYTERANGE=\"720@0\"
#EXTINF:4,
#EXT-X-BYTERANGE:1000@720
main.mp4
#EXTINF:4,
#EXT-X-BYTERANGE:500
main.mp4
#EXT-X-ENDLIST
";
        let stream = media(parse_playlist(text.as_bytes(), &base()).unwrap());
        assert_eq!(
            stream.segments[0].byte_range,
            Some(ByteRange { offset: 720, length: 1000 })
        );
        assert_eq!(
            stream.segments[1].byte_range,
            Some(ByteRange { offset: 1720, length: 500 })
        );
        let init = stream.init_section.unwrap();
        assert_eq!(init.byte_range, Some(ByteRange { offset: 0, length: 720 }));
        assert_eq!(init.url.as_str(), "https://cdn.example.com/live/stream/main.mp4");
    }

    #[test]
    fn missing_endlist_marks_stream_live() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2,\na.ts\n";
        let stream = media(parse_playlist(text.as_bytes(), &base()).unwrap());
        assert!(stream.is_live);
    }

    #[test]
    fn malformed_playlists_are_parse_errors() {
        for text in [
            "",
            "not a playlist\nseg.ts\n",
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-ENDLIST\n",
            "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128\n#EXTINF:2,\na.ts\n",
            "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k\",IV=0xZZ\n#EXTINF:2,\na.ts\n",
        ] {
            let err = parse_playlist(text.as_bytes(), &base()).unwrap_err();
            assert!(matches!(err, DownloadError::Parse { .. }), "{text:?} gave {err:?}");
        }
    }

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080,CODECS=\"avc1.640028,mp4a.40.2\"
high/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
mid/index.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=9000000,URI=\"iframes.m3u8\"
";

    #[test]
    fn master_variants_exclude_iframe_streams() {
        let variants = master(parse_playlist(MASTER.as_bytes(), &base()).unwrap());
        assert_eq!(variants.len(), 3);
        assert!(variants.iter().all(|v| v.segments.is_empty()));
        assert_eq!(
            variants[1].url.as_str(),
            "https://cdn.example.com/live/stream/high/index.m3u8"
        );
    }

    #[test]
    fn selection_policies() {
        let variants = master(parse_playlist(MASTER.as_bytes(), &base()).unwrap());
        let pick = |policy| select_variant(&variants, &policy).unwrap().bandwidth;

        assert_eq!(pick(VariantSelectionPolicy::HighestBandwidth), 5_000_000);
        assert_eq!(pick(VariantSelectionPolicy::LowestBandwidth), 800_000);
        assert_eq!(pick(VariantSelectionPolicy::ClosestToBandwidth(3_000_000)), 2_500_000);
        assert_eq!(
            pick(VariantSelectionPolicy::MatchingResolution { width: 1280, height: 720 }),
            2_500_000
        );
        // no exact match: nearest pixel count
        assert_eq!(
            pick(VariantSelectionPolicy::MatchingResolution { width: 1600, height: 900 }),
            2_500_000
        );
        assert!(select_variant(&[], &VariantSelectionPolicy::HighestBandwidth).is_none());
    }

    #[test]
    fn checksum_is_stable_hex_sha256() {
        let a = playlist_checksum(MEDIA.as_bytes());
        assert_eq!(a.len(), 64);
        assert_eq!(a, playlist_checksum(MEDIA.as_bytes()));
        assert_ne!(a, playlist_checksum(MASTER.as_bytes()));
    }

    proptest! {
        #[test]
        fn sequence_indices_are_contiguous_in_file_order(
            durations in proptest::collection::vec(0.5f32..12.0, 1..64),
            media_sequence in 0u64..1_000_000,
        ) {
            let mut text = format!(
                "#EXTM3U\n#EXT-X-TARGETDURATION:12\n#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"
            );
            for (i, d) in durations.iter().enumerate() {
                text.push_str(&format!("#EXTINF:{d:.3},\nseg{i}.ts\n"));
            }
            text.push_str("#EXT-X-ENDLIST\n");

            let stream = media(parse_playlist(text.as_bytes(), &base()).unwrap());
            prop_assert_eq!(stream.segments.len(), durations.len());
            for (i, seg) in stream.segments.iter().enumerate() {
                prop_assert_eq!(seg.sequence_index, i as u64);
                prop_assert_eq!(seg.media_sequence, media_sequence + i as u64);
                let expected = format!("seg{i}.ts");
                prop_assert!(seg.url.path().ends_with(&expected));
            }
        }

        #[test]
        fn highest_bandwidth_is_the_maximum(bandwidths in proptest::collection::vec(1u64..100_000_000, 1..16)) {
            let mut text = String::from("#EXTM3U\n");
            for (i, bw) in bandwidths.iter().enumerate() {
                text.push_str(&format!("#EXT-X-STREAM-INF:BANDWIDTH={bw}\nv{i}.m3u8\n"));
            }
            let variants = master(parse_playlist(text.as_bytes(), &base()).unwrap());
            let best = select_variant(&variants, &VariantSelectionPolicy::HighestBandwidth).unwrap();
            prop_assert_eq!(best.bandwidth, *bandwidths.iter().max().unwrap());
        }
    }
}
