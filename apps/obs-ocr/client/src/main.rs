use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use obs_ocr_client::{arrange_lines, LayoutParams, ObsConnection, DEFAULT_MAX_FRAME_BYTES};
use tokio::{signal, time};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "obs-ocr-client",
    about = "Print the text obs-ocr-server recognises on an OBS source"
)]
struct Cli {
    /// Proxy (or obs-websocket) URL.
    #[arg(long, env = "OBS_OCR_CLIENT_URL", default_value = "ws://127.0.0.1:4456")]
    url: String,

    #[arg(long, env = "OBS_WEBSOCKET_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Source to screenshot.
    #[arg(long, default_value = "video")]
    source: String,

    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Largest frame/message accepted from the server.
    #[arg(long, env = "OBS_OCR_CLIENT_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,

    #[arg(long, default_value_t = 0.22)]
    top: f64,

    #[arg(long, default_value_t = 0.06)]
    line_height: f64,

    #[arg(long, default_value_t = 0.14)]
    min_left: f64,

    #[arg(long, default_value_t = 0.8)]
    max_right: f64,

    #[arg(long, default_value_t = 0.025)]
    min_height: f64,
}

impl Cli {
    fn layout(&self) -> LayoutParams {
        LayoutParams {
            top: self.top,
            line_height: self.line_height,
            min_left: self.min_left,
            max_right: self.max_right,
            min_height: self.min_height,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let cli = Cli::parse();
    let layout = cli.layout();

    if cli.max_frame_bytes == 0 {
        anyhow::bail!("max frame size must be greater than zero");
    }
    let mut connection =
        ObsConnection::connect_with_limit(&cli.url, cli.password.as_deref(), cli.max_frame_bytes)
            .await
            .with_context(|| format!("failed to connect to {}", cli.url))?;
    info!(url = %cli.url, source = %cli.source, "connected");

    let mut ticker = time::interval(Duration::from_millis(cli.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        match connection.capture_text(&cli.source).await {
            Ok(observations) => {
                for line in arrange_lines(&observations, &layout) {
                    println!("{line}");
                }
                println!("-----");
            }
            Err(err @ obs_ocr_client::ClientError::RequestFailed { .. }) => {
                warn!(error = %err, "capture failed");
            }
            Err(err) => return Err(err).context("connection lost"),
        }
    }

    connection.close().await.context("failed to close connection")?;
    Ok(())
}
