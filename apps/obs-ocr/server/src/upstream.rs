use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::config::UpstreamConfig;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
    #[error("failed to connect to upstream: {0}")]
    Connect(#[from] tungstenite::Error),
}

/// Opens the upstream leg of a session, asking for `subprotocol` when the
/// client negotiated one with the proxy.
pub async fn connect(
    config: &UpstreamConfig,
    subprotocol: Option<&str>,
) -> Result<UpstreamSocket, UpstreamError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| UpstreamError::InvalidRequest(err.to_string()))?;

    if let Some(protocol) = subprotocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|err| UpstreamError::InvalidRequest(err.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let (socket, response) =
        connect_async_with_config(request, Some(config.websocket_config()), true).await?;
    debug!(
        upstream = %config.url,
        status = %response.status(),
        "upstream handshake complete"
    );
    Ok(socket)
}
