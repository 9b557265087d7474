use std::{
    borrow::Cow,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::{counter, decrement_gauge, histogram, increment_gauge};
use obs_ocr_core::{
    build_failed_response, build_synthetic_response, decode_screenshot, extract_request_payload,
    is_request_of, screenshot_from_response,
    wire::{SCREENSHOT_REQUEST_TYPE, STATUS_REQUEST_PROCESSING_FAILED, SYNTHETIC_REQUEST_TYPE},
    OpCode, RequestId, ScreenshotCache, TextRecognizer, WireMessage,
};
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::tungstenite::{
    protocol::frame::coding::CloseCode, Message as UpstreamMessage,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ServerConfig, UpstreamConfig},
    upstream::{self, UpstreamSocket},
};

const CLIENT_OUTBOX_DEPTH: usize = 64;
const MAX_CLOSE_REASON_BYTES: usize = 123;

const TO_UPSTREAM: &str = "client_to_upstream";
const TO_CLIENT: &str = "upstream_to_client";

/// Settings shared by every session of one server.
pub struct SessionSettings {
    pub upstream: UpstreamConfig,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub recognition_timeout: Option<Duration>,
    pub close_grace: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            upstream: config.upstream.clone(),
            recognizer: config.build_recognizer(),
            recognition_timeout: config.recognition_timeout,
            close_grace: config.close_grace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upstream handshake in flight.
    Connecting,
    /// Both legs are being pumped.
    Active,
    /// One leg has ended and the other is being torn down.
    Closing,
    Closed,
}

/// One client connection paired with one upstream connection.
///
/// The pairing is fixed for the lifetime of the session and the screenshot
/// cache lives and dies with it.
pub struct ProxySession {
    id: u64,
    state: SessionState,
    settings: Arc<SessionSettings>,
    cache: Arc<ScreenshotCache>,
}

impl ProxySession {
    pub fn new(id: u64, settings: Arc<SessionSettings>) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
            settings,
            cache: Arc::new(ScreenshotCache::new()),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            session_id = self.id,
            from = ?self.state,
            to = ?next,
            "session state change"
        );
        self.state = next;
    }

    /// Connects the upstream leg and proxies until either leg closes.
    ///
    /// When the upstream cannot be reached the client is closed straight
    /// away without any response.
    pub async fn serve(mut self, mut client: WebSocket, subprotocol: Option<&str>) {
        counter!("obs_ocr_sessions_total", 1);

        let upstream = match upstream::connect(&self.settings.upstream, subprotocol).await {
            Ok(upstream) => upstream,
            Err(err) => {
                counter!("obs_ocr_upstream_connect_failures_total", 1);
                warn!(
                    session_id = self.id,
                    upstream = %self.settings.upstream.url,
                    error = %err,
                    "upstream connection failed; closing client"
                );
                let _ = client
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::ERROR,
                        reason: Cow::Borrowed("upstream unavailable"),
                    })))
                    .await;
                self.transition(SessionState::Closed);
                return;
            }
        };

        self.transition(SessionState::Active);
        info!(
            session_id = self.id,
            subprotocol = subprotocol.unwrap_or("-"),
            "session established"
        );
        increment_gauge!("obs_ocr_sessions_active", 1.0);

        self.run(client, upstream).await;

        decrement_gauge!("obs_ocr_sessions_active", 1.0);
        self.transition(SessionState::Closed);
        info!(session_id = self.id, "session closed");
    }

    async fn run(&mut self, client: WebSocket, upstream: UpstreamSocket) {
        let (client_sink, client_stream) = client.split();
        let (upstream_sink, upstream_stream) = upstream.split();
        let (outbox, inbox) = mpsc::channel(CLIENT_OUTBOX_DEPTH);
        let mut writer = tokio::spawn(write_client(self.id, client_sink, inbox));

        let legs = Legs {
            session_id: self.id,
            settings: Arc::clone(&self.settings),
            cache: Arc::clone(&self.cache),
        };
        let client_leg = legs.pump_client(client_stream, upstream_sink, outbox.clone());
        let upstream_leg = legs.pump_upstream(upstream_stream, outbox);
        tokio::pin!(client_leg, upstream_leg);

        let grace = self.settings.close_grace;
        tokio::select! {
            end = &mut client_leg => {
                self.transition(SessionState::Closing);
                info!(session_id = self.id, reason = ?end, "client leg ended; closing upstream");
                match timeout(grace, &mut upstream_leg).await {
                    Ok(end) => debug!(session_id = self.id, reason = ?end, "upstream leg ended"),
                    Err(_) => warn!(session_id = self.id, "upstream leg did not close in time; dropping it"),
                }
            }
            end = &mut upstream_leg => {
                self.transition(SessionState::Closing);
                info!(session_id = self.id, reason = ?end, "upstream leg ended; closing client");
                match timeout(grace, &mut client_leg).await {
                    Ok(end) => debug!(session_id = self.id, reason = ?end, "client leg ended"),
                    Err(_) => warn!(session_id = self.id, "client leg did not close in time; dropping it"),
                }
            }
        }

        if timeout(grace, &mut writer).await.is_err() {
            writer.abort();
        }
    }
}

/// Why a leg's read loop stopped.
#[derive(Debug)]
enum LegEnd {
    Closed(Option<CloseInfo>),
    Failed(String),
    /// The opposite leg could no longer be written to.
    PeerUnavailable,
}

#[derive(Debug, Clone, PartialEq)]
struct CloseInfo {
    code: u16,
    reason: String,
}

impl CloseInfo {
    fn from_client(frame: CloseFrame<'static>) -> Self {
        Self {
            code: frame.code,
            reason: frame.reason.into_owned(),
        }
    }

    fn from_upstream(frame: tokio_tungstenite::tungstenite::protocol::CloseFrame<'static>) -> Self {
        Self {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        }
    }

    /// Close frame relayed to the client, `None` when the code may not be
    /// sent on the wire.
    fn to_client_frame(&self) -> Option<CloseFrame<'static>> {
        if !CloseCode::from(self.code).is_allowed() {
            return None;
        }
        let reason = if self.reason.len() <= MAX_CLOSE_REASON_BYTES {
            self.reason.clone()
        } else {
            String::new()
        };
        Some(CloseFrame {
            code: self.code,
            reason: Cow::Owned(reason),
        })
    }
}

#[derive(Debug, PartialEq)]
enum Interception {
    PassThrough,
    Respond(String),
    /// Synthetic request that cannot be answered; neither forwarded nor
    /// answered.
    Swallow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyntheticOutcome {
    Recognized,
    NoScreenshot,
    InvalidImage,
    RecognitionFailed,
    TimedOut,
    MissingRequestId,
}

impl SyntheticOutcome {
    fn label(self) -> &'static str {
        match self {
            SyntheticOutcome::Recognized => "recognized",
            SyntheticOutcome::NoScreenshot => "no_screenshot",
            SyntheticOutcome::InvalidImage => "invalid_image",
            SyntheticOutcome::RecognitionFailed => "recognition_failed",
            SyntheticOutcome::TimedOut => "timed_out",
            SyntheticOutcome::MissingRequestId => "missing_request_id",
        }
    }
}

/// State borrowed by both read loops of a session.
struct Legs {
    session_id: u64,
    settings: Arc<SessionSettings>,
    cache: Arc<ScreenshotCache>,
}

impl Legs {
    async fn pump_client(
        &self,
        mut client: SplitStream<WebSocket>,
        mut upstream: SplitSink<UpstreamSocket, UpstreamMessage>,
        outbox: mpsc::Sender<Message>,
    ) -> LegEnd {
        let end = loop {
            let message = match client.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => break LegEnd::Failed(err.to_string()),
                None => break LegEnd::Closed(None),
            };

            let forward = match message {
                Message::Text(text) => match self.intercept(&text).await {
                    Interception::PassThrough => UpstreamMessage::Text(text),
                    Interception::Respond(response) => {
                        if outbox.send(Message::Text(response)).await.is_err() {
                            break LegEnd::PeerUnavailable;
                        }
                        continue;
                    }
                    Interception::Swallow => continue,
                },
                Message::Binary(bytes) => UpstreamMessage::Binary(bytes),
                Message::Close(frame) => break LegEnd::Closed(frame.map(CloseInfo::from_client)),
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            let bytes = forward.len();
            if let Err(err) = upstream.send(forward).await {
                debug!(session_id = self.session_id, error = %err, "upstream write failed");
                break LegEnd::PeerUnavailable;
            }
            record_forwarded(TO_UPSTREAM, bytes);
        };

        // a leg that is already closing reports an error here; nothing to do
        if let Err(err) = upstream.close().await {
            debug!(session_id = self.session_id, error = %err, "upstream already closed");
        }
        end
    }

    async fn pump_upstream(
        &self,
        mut upstream: SplitStream<UpstreamSocket>,
        outbox: mpsc::Sender<Message>,
    ) -> LegEnd {
        let end = loop {
            let message = match upstream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => break LegEnd::Failed(err.to_string()),
                None => break LegEnd::Closed(None),
            };

            match message {
                UpstreamMessage::Text(text) => {
                    let observed = may_carry_screenshot(&text).then(|| text.clone());
                    let bytes = text.len();
                    if outbox.send(Message::Text(text)).await.is_err() {
                        break LegEnd::PeerUnavailable;
                    }
                    record_forwarded(TO_CLIENT, bytes);
                    if let Some(text) = observed {
                        self.observe_screenshot(&text);
                    }
                }
                UpstreamMessage::Binary(bytes) => {
                    let len = bytes.len();
                    if outbox.send(Message::Binary(bytes)).await.is_err() {
                        break LegEnd::PeerUnavailable;
                    }
                    record_forwarded(TO_CLIENT, len);
                }
                UpstreamMessage::Close(frame) => {
                    break LegEnd::Closed(frame.map(CloseInfo::from_upstream))
                }
                UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => {}
            }
        };

        let close = match &end {
            LegEnd::Closed(Some(info)) => info.to_client_frame(),
            LegEnd::Failed(_) => Some(CloseFrame {
                code: close_code::ERROR,
                reason: Cow::Borrowed("upstream connection lost"),
            }),
            _ => None,
        };
        let _ = outbox.send(Message::Close(close)).await;
        end
    }

    fn observe_screenshot(&self, text: &str) {
        let message = match WireMessage::decode(text.as_bytes()) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    session_id = self.session_id,
                    error = %err,
                    "could not decode upstream frame"
                );
                return;
            }
        };

        if let Some(image_data) = screenshot_from_response(message) {
            debug!(
                session_id = self.session_id,
                bytes = image_data.len(),
                "cached screenshot"
            );
            self.cache.store(image_data);
            counter!("obs_ocr_screenshots_cached_total", 1);
        }
    }

    async fn intercept(&self, text: &str) -> Interception {
        let message = match WireMessage::decode(text.as_bytes()) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    session_id = self.session_id,
                    error = %err,
                    "client frame is not an obs-websocket envelope; forwarding unchanged"
                );
                return Interception::PassThrough;
            }
        };

        if !is_request_of(&message, OpCode::Request, SYNTHETIC_REQUEST_TYPE) {
            return Interception::PassThrough;
        }
        let Some((request_id, _)) =
            extract_request_payload(&message, OpCode::Request, SYNTHETIC_REQUEST_TYPE)
        else {
            record_outcome(SyntheticOutcome::MissingRequestId);
            return Interception::Swallow;
        };

        let (outcome, response) = self.answer(&request_id).await;
        record_outcome(outcome);
        match response {
            Ok(response) => {
                debug!(
                    session_id = self.session_id,
                    request_id = %request_id,
                    outcome = outcome.label(),
                    "answered synthetic request"
                );
                Interception::Respond(response)
            }
            Err(err) => {
                warn!(
                    session_id = self.session_id,
                    request_id = %request_id,
                    error = %err,
                    "failed to encode synthetic response"
                );
                Interception::Swallow
            }
        }
    }

    async fn answer(
        &self,
        request_id: &RequestId,
    ) -> (SyntheticOutcome, serde_json::Result<String>) {
        let Some(payload) = self.cache.current() else {
            debug!(session_id = self.session_id, "no screenshot cached yet");
            return (
                SyntheticOutcome::NoScreenshot,
                build_synthetic_response(request_id, &[]),
            );
        };

        let image = match decode_screenshot(&payload) {
            Ok(image) => image,
            Err(err) => {
                warn!(session_id = self.session_id, error = %err, "cached screenshot is unusable");
                return (
                    SyntheticOutcome::InvalidImage,
                    build_synthetic_response(request_id, &[]),
                );
            }
        };
        drop(payload);

        let recognizer = &self.settings.recognizer;
        let started = Instant::now();
        let result = match self.settings.recognition_timeout {
            Some(limit) => match timeout(limit, recognizer.recognize(&image)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        session_id = self.session_id,
                        recognizer = recognizer.name(),
                        timeout_ms = limit.as_millis() as u64,
                        "text recognition timed out"
                    );
                    return (
                        SyntheticOutcome::TimedOut,
                        build_failed_response(
                            request_id,
                            STATUS_REQUEST_PROCESSING_FAILED,
                            "text recognition timed out",
                        ),
                    );
                }
            },
            None => recognizer.recognize(&image).await,
        };
        histogram!(
            "obs_ocr_recognition_duration_ms",
            started.elapsed().as_secs_f64() * 1000.0
        );

        match result {
            Ok(observations) => (
                SyntheticOutcome::Recognized,
                build_synthetic_response(request_id, &observations),
            ),
            Err(err) => {
                warn!(
                    session_id = self.session_id,
                    recognizer = recognizer.name(),
                    error = %err,
                    "text recognition failed"
                );
                (
                    SyntheticOutcome::RecognitionFailed,
                    build_synthetic_response(request_id, &[]),
                )
            }
        }
    }
}

/// Owns the client sink; everything sent to the client goes through here
/// so upstream frames and synthetic responses keep their relative order.
async fn write_client(
    session_id: u64,
    mut sink: SplitSink<WebSocket, Message>,
    mut inbox: mpsc::Receiver<Message>,
) {
    while let Some(message) = inbox.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            debug!(session_id, error = %err, "client write failed");
            return;
        }
        if closing {
            return;
        }
    }
    let _ = sink.close().await;
}

/// Cheap textual check run before decoding large upstream frames.
///
/// A frame that spells the request type with `\u` escapes only matches
/// after decoding, so any frame carrying an escape is decoded too.
fn may_carry_screenshot(text: &str) -> bool {
    text.contains(SCREENSHOT_REQUEST_TYPE) || text.contains("\\u")
}

fn record_forwarded(direction: &'static str, bytes: usize) {
    counter!("obs_ocr_frames_forwarded_total", 1, "direction" => direction);
    counter!("obs_ocr_bytes_forwarded_total", bytes as u64, "direction" => direction);
}

fn record_outcome(outcome: SyntheticOutcome) {
    counter!(
        "obs_ocr_synthetic_requests_total",
        1,
        "outcome" => outcome.label()
    );
}
