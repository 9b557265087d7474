//! Shared primitives for the obs-websocket OCR proxy: the `{op, d}` wire
//! envelope, the synthetic `__GetTextFromLastScreenshot` response, the
//! per-session screenshot slot and the text recognition seam.

pub mod cache;
pub mod recognition;
pub mod tesseract;
pub mod wire;

pub use cache::ScreenshotCache;
pub use recognition::{
    decode_screenshot, BoundingBox, NullRecognizer, RecognitionError, TextObservation,
    TextRecognizer, TextResults,
};
pub use tesseract::TesseractRecognizer;
pub use wire::{
    build_failed_response, build_synthetic_response, extract_request_payload, is_request_of,
    screenshot_from_response, DecodeError, OpCode, RequestId, WireMessage,
};
