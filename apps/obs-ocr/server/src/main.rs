use anyhow::Result;
use clap::Parser;
use obs_ocr_server::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        upstream_url = %config.upstream.url,
        "starting obs-ocr proxy"
    );

    obs_ocr_server::run(config, Some(telemetry.metrics_handle())).await
}
