use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use obs_ocr_core::{NullRecognizer, TesseractRecognizer, TextRecognizer};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use url::Url;

/// Screenshots travel as one text frame; the tungstenite defaults (16 MiB
/// frames) are too small for a 4K PNG encoded as base64.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecognizerKind {
    /// Run the `tesseract` CLI for every request.
    Tesseract,
    /// Always answer with no text.
    None,
}

#[derive(Debug, Parser)]
#[command(
    name = "obs-ocr-server",
    author,
    version,
    about = "obs-websocket proxy that answers __GetTextFromLastScreenshot with OCR results"
)]
pub struct Cli {
    /// Address to accept obs-websocket clients on.
    #[arg(long, env = "OBS_OCR_LISTEN_ADDR", default_value = "127.0.0.1:4456")]
    pub listen_addr: String,

    /// obs-websocket server every session is forwarded to.
    #[arg(short = 'u', long, env = "OBS_OCR_UPSTREAM_URL", default_value = "ws://127.0.0.1:4455")]
    pub upstream_url: String,

    /// Largest frame/message accepted on either leg.
    #[arg(long, env = "OBS_OCR_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Text recognition engine.
    #[arg(long, env = "OBS_OCR_RECOGNIZER", value_enum, default_value_t = RecognizerKind::Tesseract)]
    pub recognizer: RecognizerKind,

    /// Path to the tesseract executable.
    #[arg(long, env = "OBS_OCR_TESSERACT_BIN", default_value = "tesseract")]
    pub tesseract_bin: PathBuf,

    /// Tesseract language pack(s), e.g. `eng` or `jpn+eng`.
    #[arg(long, env = "OBS_OCR_TESSERACT_LANG")]
    pub tesseract_lang: Option<String>,

    /// Upper bound for one recognition call; 0 waits forever.
    #[arg(long, env = "OBS_OCR_RECOGNITION_TIMEOUT_SECS", default_value_t = 30)]
    pub recognition_timeout_secs: u64,

    /// How long the second leg of a session may take to close after the first.
    #[arg(long, env = "OBS_OCR_CLOSE_GRACE_SECS", default_value_t = 5)]
    pub close_grace_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "OBS_OCR_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

/// Where and how sessions reach the real obs-websocket server.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: Url,
    pub max_frame_bytes: usize,
}

impl UpstreamConfig {
    pub fn new(url: &str, max_frame_bytes: usize) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid upstream url: {url}"))?;
        if url.scheme() != "ws" {
            bail!("upstream url must use ws:// (got {})", url.scheme());
        }
        Ok(Self {
            url,
            max_frame_bytes,
        })
    }

    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_frame_size = Some(self.max_frame_bytes);
        config.max_message_size = Some(self.max_frame_bytes);
        config
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub recognizer: RecognizerKind,
    pub tesseract_bin: PathBuf,
    pub tesseract_lang: Option<String>,
    pub recognition_timeout: Option<Duration>,
    pub close_grace: Duration,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn build_recognizer(&self) -> Arc<dyn TextRecognizer> {
        match self.recognizer {
            RecognizerKind::None => Arc::new(NullRecognizer),
            RecognizerKind::Tesseract => {
                let mut recognizer = TesseractRecognizer::new(self.tesseract_bin.clone());
                if let Some(language) = &self.tesseract_lang {
                    recognizer = recognizer.with_language(language.clone());
                }
                Arc::new(recognizer)
            }
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.max_frame_bytes == 0 {
            bail!("max frame size must be greater than zero");
        }
        let upstream = UpstreamConfig::new(&cli.upstream_url, cli.max_frame_bytes)?;
        let recognition_timeout = match cli.recognition_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(ServerConfig {
            listen_addr,
            upstream,
            recognizer: cli.recognizer,
            tesseract_bin: cli.tesseract_bin,
            tesseract_lang: cli.tesseract_lang,
            recognition_timeout,
            close_grace: Duration::from_secs(cli.close_grace_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let cli = Cli::try_parse_from(std::iter::once("obs-ocr-server").chain(args.iter().copied()))?;
        ServerConfig::try_from(cli)
    }

    #[test]
    fn defaults_match_obs_websocket_ports() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:4456".parse().unwrap());
        assert_eq!(config.upstream.url.as_str(), "ws://127.0.0.1:4455/");
        assert_eq!(config.upstream.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(config.recognizer, RecognizerKind::Tesseract);
        assert_eq!(config.recognition_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_recognition_timeout_disables_it() {
        let config = parse(&["--recognition-timeout-secs", "0", "--recognizer", "none"]).unwrap();
        assert_eq!(config.recognition_timeout, None);
        assert_eq!(config.build_recognizer().name(), "none");
    }

    #[test]
    fn rejects_tls_and_garbage_upstreams() {
        assert!(parse(&["--upstream-url", "wss://obs.example:4455"]).is_err());
        assert!(parse(&["--upstream-url", "not a url"]).is_err());
        assert!(parse(&["--listen-addr", "localhost"]).is_err());
        assert!(parse(&["--max-frame-bytes", "0"]).is_err());
    }

    #[test]
    fn upstream_url_has_a_short_flag() {
        let config = parse(&["-u", "ws://10.0.0.5:4455"]).unwrap();
        assert_eq!(config.upstream.url.as_str(), "ws://10.0.0.5:4455/");
    }

    #[test]
    fn frame_limit_applies_to_frames_and_messages() {
        let upstream = UpstreamConfig::new("ws://127.0.0.1:4455", 1024).unwrap();
        let config = upstream.websocket_config();
        assert_eq!(config.max_frame_size, Some(1024));
        assert_eq!(config.max_message_size, Some(1024));
    }
}
