//! Encoding detection and decoding for bytes-on-disk text formats.
//!
//! Detection order: byte-order-mark sniff, then the optional charset
//! detector (`charset-detection` feature), then strict cp1252, then
//! latin-1. The path actually taken is recorded in document metadata so an
//! import can always explain how its text was decoded.

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};

/// How a byte stream was decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    pub text: String,
    /// e.g. `"bom:utf-8"`, `"detector:windows-1252"`, `"fallback:cp1252"`.
    pub detection: String,
    /// True when the chosen decoder substituted replacement characters.
    pub lossy: bool,
}

/// Decodes `bytes` following the detection chain.
pub fn decode(bytes: &[u8]) -> DecodedText {
    if let Some((encoding, bom_len)) = sniff_bom(bytes) {
        let (text, had_errors) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return DecodedText {
            text: text.into_owned(),
            detection: format!("bom:{}", encoding.name().to_ascii_lowercase()),
            lossy: had_errors,
        };
    }
    decode_without_bom(bytes)
}

#[cfg(feature = "charset-detection")]
fn decode_without_bom(bytes: &[u8]) -> DecodedText {
    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    DecodedText {
        text: text.into_owned(),
        detection: format!("detector:{}", encoding.name().to_ascii_lowercase()),
        lossy: had_errors,
    }
}

#[cfg(not(feature = "charset-detection"))]
fn decode_without_bom(bytes: &[u8]) -> DecodedText {
    // cp1252 leaves these five bytes undefined; a strict decode rejects
    // them and falls through to latin-1.
    const CP1252_UNDEFINED: [u8; 5] = [0x81, 0x8D, 0x8F, 0x90, 0x9D];

    if let Ok(text) = std::str::from_utf8(bytes) {
        return DecodedText {
            text: text.to_string(),
            detection: "utf-8".to_string(),
            lossy: false,
        };
    }
    if !bytes.iter().any(|b| CP1252_UNDEFINED.contains(b)) {
        let (text, had_errors) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
        return DecodedText {
            text: text.into_owned(),
            detection: "fallback:cp1252".to_string(),
            lossy: had_errors,
        };
    }
    // latin-1: every byte maps to U+00XX, never fails.
    DecodedText {
        text: bytes.iter().map(|&b| b as char).collect(),
        detection: "fallback:latin-1".to_string(),
        lossy: false,
    }
}

fn sniff_bom(bytes: &[u8]) -> Option<(&'static Encoding, usize)> {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        Some((UTF_8, 3))
    } else if bytes.starts_with(&[0xFF, 0xFE]) {
        Some((UTF_16LE, 2))
    } else if bytes.starts_with(&[0xFE, 0xFF]) {
        Some((UTF_16BE, 2))
    } else {
        None
    }
}
