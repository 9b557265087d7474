//! Minimal obs-websocket client used to drive `obs-ocr-server`: it
//! identifies, asks OBS for a screenshot of one source and reads back the
//! text the proxy recognised on it.

pub mod auth;
pub mod connection;
pub mod layout;

pub use auth::authentication_string;
pub use connection::{ClientError, ObsConnection, DEFAULT_MAX_FRAME_BYTES};
pub use layout::{arrange_lines, LayoutParams};
