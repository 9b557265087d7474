use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix obs-websocket puts in front of PNG screenshots.
pub const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Normalised box in image space, every component in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One recognised run of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextObservation {
    pub text: String,
    pub bounding_box: BoundingBox,
}

impl TextObservation {
    pub fn left(&self) -> f64 {
        self.bounding_box.x
    }

    pub fn right(&self) -> f64 {
        self.bounding_box.x + self.bounding_box.width
    }
}

/// `responseData` of a `__GetTextFromLastScreenshot` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextResults {
    pub text_results: Vec<TextObservation>,
}

#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("recognition engine failed: {0}")]
    Engine(String),
    #[error("failed to run recognition engine: {0}")]
    Io(#[from] std::io::Error),
}

/// Image-to-text service consulted for `__GetTextFromLastScreenshot`.
///
/// Implementations receive raw PNG bytes and may return observations in
/// any order. A call may take a long time; it must not block the async
/// runtime's worker thread.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn recognize(&self, image: &[u8]) -> Result<Vec<TextObservation>, RecognitionError>;
}

/// Recognizer that never finds any text.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecognizer;

#[async_trait]
impl TextRecognizer for NullRecognizer {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn recognize(&self, _image: &[u8]) -> Result<Vec<TextObservation>, RecognitionError> {
        Ok(Vec::new())
    }
}

/// Turns a cached `data:image/png;base64,...` payload into PNG bytes.
pub fn decode_screenshot(payload: &str) -> Result<Vec<u8>, RecognitionError> {
    let encoded = payload.strip_prefix(PNG_DATA_URI_PREFIX).ok_or_else(|| {
        RecognitionError::InvalidImage("payload is not a base64 PNG data URI".into())
    })?;

    let bytes = STANDARD
        .decode(encoded.trim_end())
        .map_err(|err| RecognitionError::InvalidImage(format!("malformed base64: {err}")))?;

    if bytes.is_empty() {
        return Err(RecognitionError::InvalidImage("image is empty".into()));
    }
    if !bytes.starts_with(&PNG_SIGNATURE) {
        return Err(RecognitionError::InvalidImage(
            "image does not carry a PNG signature".into(),
        ));
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_uri(bytes: &[u8]) -> String {
        format!("{PNG_DATA_URI_PREFIX}{}", STANDARD.encode(bytes))
    }

    #[test]
    fn decodes_png_payload() {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend_from_slice(b"IHDR....");
        assert_eq!(decode_screenshot(&data_uri(&png)).unwrap(), png);
    }

    #[test]
    fn rejects_other_payloads() {
        let cases = [
            "data:image/jpeg;base64,/9j/4AAQ".to_string(),
            format!("{PNG_DATA_URI_PREFIX}!!not-base64!!"),
            PNG_DATA_URI_PREFIX.to_string(),
            data_uri(b"GIF89a"),
        ];
        for payload in cases {
            assert!(
                matches!(
                    decode_screenshot(&payload),
                    Err(RecognitionError::InvalidImage(_))
                ),
                "{payload} should be rejected"
            );
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn null_recognizer_finds_nothing() {
        let observations = NullRecognizer.recognize(&PNG_SIGNATURE).await.unwrap();
        assert!(observations.is_empty());
    }
}
