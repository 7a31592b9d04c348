use url::Url;

use crate::config::ValidationConfig;
use crate::error::{DownloadError, Result};
use crate::model::{ByteRange, InitSection, Segment};

const TS_PACKET: usize = 188;
const TS_SYNC: u8 = 0x47;

/// Top-level ISO-BMFF boxes a CMAF fragment or init section may start with.
const MP4_LEADING_BOXES: &[&[u8; 4]] = &[
    b"ftyp", b"styp", b"moof", b"sidx", b"emsg", b"prft", b"free", b"mdat", b"moov",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    MpegTs,
    Fmp4,
    Adts,
    Unknown,
}

impl ContainerFormat {
    /// Guess the container from the URL path extension.
    pub fn from_url(url: &Url) -> Self {
        let ext = url
            .path()
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("ts") | Some("tsv") | Some("tsa") => Self::MpegTs,
            Some("mp4") | Some("m4s") | Some("m4v") | Some("m4a") | Some("cmfv") | Some("cmfa") => {
                Self::Fmp4
            }
            Some("aac") => Self::Adts,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub passed: bool,
    pub reason: Option<String>,
    pub container: ContainerFormat,
}

impl ValidationReport {
    fn pass(container: ContainerFormat) -> Self {
        Self {
            passed: true,
            reason: None,
            container,
        }
    }

    fn fail(container: ContainerFormat, reason: String) -> Self {
        Self {
            passed: false,
            reason: Some(reason),
            container,
        }
    }

    /// `Ok` when passed, otherwise a validation error for `segment_index`
    /// (`None` for the init section).
    pub fn into_result(self, segment_index: Option<u64>) -> Result<()> {
        if self.passed {
            Ok(())
        } else {
            Err(DownloadError::validation(
                segment_index,
                self.reason.unwrap_or_else(|| "validation failed".to_string()),
            ))
        }
    }
}

/// Structural sanity checks on downloaded bytes.
#[derive(Debug, Clone)]
pub struct SegmentValidator {
    config: ValidationConfig,
}

impl SegmentValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// A ranged request must deliver exactly the declared length.
    pub fn check_transfer(
        &self,
        segment_index: Option<u64>,
        received: usize,
        range: Option<ByteRange>,
    ) -> Result<()> {
        match range {
            Some(range) if received as u64 != range.length => Err(DownloadError::validation(
                segment_index,
                format!(
                    "expected {} bytes for byte range, received {received}",
                    range.length
                ),
            )),
            _ => Ok(()),
        }
    }

    pub fn validate(&self, bytes: &[u8], segment: &Segment) -> ValidationReport {
        self.check(bytes, &segment.url)
    }

    pub fn validate_init(&self, bytes: &[u8], init: &InitSection) -> ValidationReport {
        self.check(bytes, &init.url)
    }

    fn check(&self, bytes: &[u8], url: &Url) -> ValidationReport {
        let container = ContainerFormat::from_url(url);
        if bytes.is_empty() {
            return ValidationReport::fail(container, "segment is empty".to_string());
        }
        if bytes.len() < self.config.min_segment_bytes {
            return ValidationReport::fail(
                container,
                format!(
                    "segment is {} bytes, below the minimum of {}",
                    bytes.len(),
                    self.config.min_segment_bytes
                ),
            );
        }
        if !self.config.enforce_container_signature {
            return ValidationReport::pass(container);
        }

        let signature = match container {
            ContainerFormat::MpegTs => check_ts(bytes),
            ContainerFormat::Fmp4 => check_fmp4(bytes),
            ContainerFormat::Adts => check_adts(bytes),
            ContainerFormat::Unknown => Ok(()),
        };
        match signature {
            Ok(()) => ValidationReport::pass(container),
            Err(reason) => ValidationReport::fail(container, reason),
        }
    }
}

fn check_ts(bytes: &[u8]) -> std::result::Result<(), String> {
    if bytes[0] != TS_SYNC {
        return Err(format!(
            "missing MPEG-TS sync byte, found 0x{:02x}",
            bytes[0]
        ));
    }
    if bytes.len() > TS_PACKET && bytes[TS_PACKET] != TS_SYNC {
        return Err("second MPEG-TS packet is not aligned to 188 bytes".to_string());
    }
    Ok(())
}

fn check_fmp4(bytes: &[u8]) -> std::result::Result<(), String> {
    if bytes.len() < 8 {
        return Err(format!("{} bytes is too short for an MP4 box", bytes.len()));
    }
    let box_type = &bytes[4..8];
    if MP4_LEADING_BOXES.iter().any(|b| &b[..] == box_type) {
        Ok(())
    } else {
        Err(format!(
            "unexpected leading MP4 box `{}`",
            String::from_utf8_lossy(box_type)
        ))
    }
}

fn check_adts(bytes: &[u8]) -> std::result::Result<(), String> {
    if bytes.starts_with(b"ID3") {
        return Ok(());
    }
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xF0 == 0xF0 {
        return Ok(());
    }
    Err("missing ADTS sync word".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::model::EncryptionDescriptor;

    fn segment(path: &str) -> Segment {
        Segment {
            sequence_index: 3,
            media_sequence: 3,
            url: Url::parse(&format!("https://cdn.example.com/{path}")).unwrap(),
            byte_range: None,
            duration: 4.0,
            encryption: Arc::new(EncryptionDescriptor::none()),
        }
    }

    fn validator() -> SegmentValidator {
        SegmentValidator::new(ValidationConfig::default())
    }

    #[test]
    fn detects_container_from_extension() {
        let url = |p: &str| Url::parse(&format!("https://a/{p}")).unwrap();
        assert_eq!(ContainerFormat::from_url(&url("x/seg1.TS?token=1")), ContainerFormat::MpegTs);
        assert_eq!(ContainerFormat::from_url(&url("x/seg1.m4s")), ContainerFormat::Fmp4);
        assert_eq!(ContainerFormat::from_url(&url("x/audio.aac")), ContainerFormat::Adts);
        assert_eq!(ContainerFormat::from_url(&url("x/segment")), ContainerFormat::Unknown);
    }

    #[test]
    fn empty_segments_fail() {
        let report = validator().validate(&[], &segment("a.ts"));
        assert!(!report.passed);
        let err = report.into_result(Some(3)).unwrap_err();
        assert!(matches!(err, DownloadError::Validation { segment_index: Some(3), .. }));
    }

    #[test]
    fn transport_stream_sync_bytes() {
        let mut good = vec![0u8; TS_PACKET * 2];
        good[0] = TS_SYNC;
        good[TS_PACKET] = TS_SYNC;
        assert!(validator().validate(&good, &segment("a.ts")).passed);

        let mut misaligned = good.clone();
        misaligned[TS_PACKET] = 0;
        assert!(!validator().validate(&misaligned, &segment("a.ts")).passed);

        let html = b"<html>not found</html>";
        let report = validator().validate(html, &segment("a.ts"));
        assert!(!report.passed);
        assert!(report.reason.unwrap().contains("sync byte"));
    }

    #[test]
    fn fmp4_leading_boxes() {
        let mut moof = vec![0, 0, 0, 16];
        moof.extend_from_slice(b"moof");
        moof.extend_from_slice(&[0; 8]);
        assert!(validator().validate(&moof, &segment("v/1.m4s")).passed);

        let mut junk = vec![0, 0, 0, 16];
        junk.extend_from_slice(b"junk");
        assert!(!validator().validate(&junk, &segment("v/1.m4s")).passed);
    }

    #[test]
    fn unknown_container_only_needs_bytes() {
        assert!(validator().validate(b"anything", &segment("seg-7")).passed);
    }

    #[test]
    fn signature_checks_can_be_disabled() {
        let validator = SegmentValidator::new(ValidationConfig {
            min_segment_bytes: 1,
            enforce_container_signature: false,
        });
        assert!(validator.validate(b"abc", &segment("a.ts")).passed);
    }

    #[test]
    fn ranged_transfers_must_match_declared_length() {
        let range = Some(ByteRange { offset: 100, length: 50 });
        assert!(validator().check_transfer(Some(1), 50, range).is_ok());
        assert!(validator().check_transfer(Some(1), 49, range).is_err());
        assert!(validator().check_transfer(Some(1), 49, None).is_ok());
    }
}
