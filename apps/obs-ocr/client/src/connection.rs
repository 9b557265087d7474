use futures_util::{SinkExt, StreamExt};
use obs_ocr_core::{
    wire::{OBS_JSON_SUBPROTOCOL, SCREENSHOT_REQUEST_TYPE, SYNTHETIC_REQUEST_TYPE},
    DecodeError, OpCode, TextObservation, TextResults, WireMessage,
};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace};

use crate::auth::authentication_string;

const RPC_VERSION: u64 = 1;

/// Screenshot responses arrive as a single text frame, well past the
/// tungstenite default of 16 MiB for large sources.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

pub type ObsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("malformed message from server: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed by server")]
    Closed,
    #[error("server requires a password but none was given")]
    PasswordRequired,
    #[error("unexpected op code {0} during handshake")]
    UnexpectedOp(i64),
    #[error("{request_type} failed with code {code}: {comment}")]
    RequestFailed {
        request_type: String,
        code: i64,
        comment: String,
    },
}

/// Identified obs-websocket session.
pub struct ObsConnection {
    socket: ObsSocket,
    next_request_id: u64,
}

impl ObsConnection {
    /// Opens the socket and completes the `Hello`/`Identify`/`Identified`
    /// exchange, answering the authentication challenge when the server
    /// sends one.
    pub async fn connect(url: &str, password: Option<&str>) -> Result<Self, ClientError> {
        Self::connect_with_limit(url, password, DEFAULT_MAX_FRAME_BYTES).await
    }

    /// Like [`ObsConnection::connect`], accepting frames and messages of up
    /// to `max_frame_bytes`.
    pub async fn connect_with_limit(
        url: &str,
        password: Option<&str>,
        max_frame_bytes: usize,
    ) -> Result<Self, ClientError> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OBS_JSON_SUBPROTOCOL),
        );
        let mut config = WebSocketConfig::default();
        config.max_frame_size = Some(max_frame_bytes);
        config.max_message_size = Some(max_frame_bytes);
        let (socket, _) = connect_async_with_config(request, Some(config), false).await?;

        let mut connection = Self {
            socket,
            next_request_id: 1,
        };
        connection.identify(password).await?;
        Ok(connection)
    }

    async fn identify(&mut self, password: Option<&str>) -> Result<(), ClientError> {
        let hello = self.next_message().await?;
        if hello.op() != OpCode::Hello {
            return Err(ClientError::UnexpectedOp(hello.op().as_raw()));
        }

        let mut identify = Map::new();
        identify.insert("rpcVersion".into(), json!(RPC_VERSION));
        identify.insert("eventSubscriptions".into(), json!(0));
        if let Some(challenge) = hello.payload().get("authentication") {
            let password = password.ok_or(ClientError::PasswordRequired)?;
            let field = |name: &str| challenge.get(name).and_then(Value::as_str).unwrap_or_default();
            identify.insert(
                "authentication".into(),
                Value::String(authentication_string(password, field("salt"), field("challenge"))),
            );
        }
        self.send(WireMessage::new(OpCode::Identify, identify)).await?;

        let identified = self.next_message().await?;
        match identified.op() {
            OpCode::Identified => {
                debug!("identified with obs-websocket");
                Ok(())
            }
            other => Err(ClientError::UnexpectedOp(other.as_raw())),
        }
    }

    /// Sends one request and waits for its response, skipping events and
    /// responses to other requests. Returns `responseData`, empty when the
    /// server sent none.
    pub async fn call(
        &mut self,
        request_type: &str,
        request_data: Option<Value>,
    ) -> Result<Map<String, Value>, ClientError> {
        let request_id = self.next_request_id.to_string();
        self.next_request_id += 1;

        let mut payload = Map::new();
        payload.insert("requestType".into(), Value::String(request_type.to_owned()));
        payload.insert("requestId".into(), Value::String(request_id.clone()));
        if let Some(data) = request_data {
            payload.insert("requestData".into(), data);
        }
        self.send(WireMessage::new(OpCode::Request, payload)).await?;

        loop {
            let message = self.next_message().await?;
            if message.op() != OpCode::RequestResponse
                || message.payload().get("requestId").and_then(Value::as_str)
                    != Some(request_id.as_str())
            {
                trace!(op = message.op().as_raw(), "skipping unrelated message");
                continue;
            }

            let mut response = message.into_payload();
            let status = response.get("requestStatus");
            let succeeded = status
                .and_then(|status| status.get("result"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !succeeded {
                return Err(ClientError::RequestFailed {
                    request_type: request_type.to_owned(),
                    code: status
                        .and_then(|status| status.get("code"))
                        .and_then(Value::as_i64)
                        .unwrap_or_default(),
                    comment: status
                        .and_then(|status| status.get("comment"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                });
            }

            return Ok(match response.remove("responseData") {
                Some(Value::Object(data)) => data,
                _ => Map::new(),
            });
        }
    }

    /// Asks OBS for a PNG screenshot of `source` and then asks the proxy for
    /// the text on it.
    pub async fn capture_text(&mut self, source: &str) -> Result<Vec<TextObservation>, ClientError> {
        self.call(
            SCREENSHOT_REQUEST_TYPE,
            Some(json!({ "sourceName": source, "imageFormat": "png" })),
        )
        .await?;
        let data = self.call(SYNTHETIC_REQUEST_TYPE, None).await?;
        let results: TextResults = serde_json::from_value(Value::Object(data))?;
        Ok(results.text_results)
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.socket.close(None).await?;
        Ok(())
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), ClientError> {
        self.socket.send(Message::Text(message.encode()?)).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<WireMessage, ClientError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(WireMessage::decode(text.as_bytes())?),
                Some(Ok(Message::Binary(bytes))) => return Ok(WireMessage::decode(&bytes)?),
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}
