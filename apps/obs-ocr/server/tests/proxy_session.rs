use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::{SinkExt, Stream, StreamExt};
use obs_ocr_core::{BoundingBox, NullRecognizer, RecognitionError, TextObservation, TextRecognizer};
use obs_ocr_server::{
    config::UpstreamConfig,
    router::{router, AppState, OBS_JSON_SUBPROTOCOL},
    session::SessionSettings,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Notify},
    time::timeout,
};
use tokio_tungstenite::{
    accept_hdr_async, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

type UpstreamSide = WebSocketStream<TcpStream>;
type ClientSide = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);

struct FakeUpstream {
    url: String,
    accepted: mpsc::UnboundedReceiver<(UpstreamSide, Option<String>)>,
}

impl FakeUpstream {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut requested = None;
                    let callback = |request: &Request,
                                    mut response: Response|
                     -> Result<Response, ErrorResponse> {
                        if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                            requested = protocol.to_str().ok().map(str::to_owned);
                            response
                                .headers_mut()
                                .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
                        }
                        Ok(response)
                    };
                    let accepted = accept_hdr_async(stream, callback).await;
                    if let Ok(socket) = accepted {
                        let _ = tx.send((socket, requested));
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}"),
            accepted,
        }
    }

    async fn next_session(&mut self) -> (UpstreamSide, Option<String>) {
        timeout(STEP, self.accepted.recv())
            .await
            .expect("proxy never dialled upstream")
            .expect("fake upstream stopped")
    }
}

#[derive(Default)]
struct RecordingRecognizer {
    seen: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl TextRecognizer for RecordingRecognizer {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn recognize(&self, image: &[u8]) -> Result<Vec<TextObservation>, RecognitionError> {
        self.seen.lock().push(image.to_vec());
        Ok(vec![TextObservation {
            text: "What will PIKACHU do?".into(),
            bounding_box: BoundingBox {
                x: 0.125,
                y: 0.25,
                width: 0.5,
                height: 0.0625,
            },
        }])
    }
}

/// Recognizer that holds every call until the test releases it.
#[derive(Default)]
struct GatedRecognizer {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl TextRecognizer for GatedRecognizer {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn recognize(&self, _image: &[u8]) -> Result<Vec<TextObservation>, RecognitionError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }
}

async fn spawn_proxy(upstream_url: &str, recognizer: Arc<dyn TextRecognizer>) -> SocketAddr {
    let settings = SessionSettings {
        upstream: UpstreamConfig::new(upstream_url, 64 * 1024 * 1024).unwrap(),
        recognizer,
        recognition_timeout: Some(Duration::from_secs(5)),
        close_grace: Duration::from_secs(1),
    };
    let state = Arc::new(AppState::new(settings, None));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}

async fn connect_client(addr: SocketAddr) -> ClientSide {
    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(OBS_JSON_SUBPROTOCOL),
    );
    let (socket, response) = timeout(STEP, connect_async(request))
        .await
        .expect("proxy handshake timed out")
        .expect("proxy handshake failed");
    assert_eq!(
        response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
        OBS_JSON_SUBPROTOCOL
    );
    socket
}

async fn next_text<S>(socket: &mut S) -> String
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let message = timeout(STEP, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Waits for the peer to close; returns the close frame if one was sent.
async fn expect_closed<S>(socket: &mut S) -> Option<CloseFrame<'static>>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(STEP, socket.next())
            .await
            .expect("leg was left open")
        {
            Some(Ok(Message::Close(frame))) => return frame,
            None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

fn png(tag: &[u8]) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(tag);
    bytes
}

fn screenshot_response(request_id: &str, image: &[u8]) -> String {
    json!({
        "op": 7,
        "d": {
            "requestType": "GetSourceScreenshot",
            "requestId": request_id,
            "requestStatus": {"result": true, "code": 100},
            "responseData": {
                "imageData": format!("data:image/png;base64,{}", STANDARD.encode(image))
            }
        }
    })
    .to_string()
}

#[test_timeout::tokio_timeout_test(secs = 30, workers = 2)]
async fn frames_pass_through_unchanged_and_in_order() {
    let mut fake = FakeUpstream::spawn().await;
    let proxy = spawn_proxy(&fake.url, Arc::new(NullRecognizer)).await;
    let mut client = connect_client(proxy).await;
    let (mut upstream, protocol) = fake.next_session().await;
    assert_eq!(protocol.as_deref(), Some(OBS_JSON_SUBPROTOCOL));

    let outbound = [
        r#"{"op":1,"d":{"rpcVersion":1,"eventSubscriptions":33}}"#,
        r#"{ "op" : 6 , "d" : { "requestType" : "GetVersion" , "requestId" : "1" } }"#,
        r#"{"op":6,"d":{"requestType":"GetSourceScreenshot","requestId":2,"requestData":{"sourceName":"video","imageFormat":"png"}}}"#,
        "not json at all",
        r#"{"op":6,"d":{"requestType":"SetInputSettings","requestId":"ünïcødé","requestData":{"a":1e3}}}"#,
    ];
    for frame in outbound {
        client.send(Message::text(frame)).await.unwrap();
    }
    for frame in outbound {
        assert_eq!(next_text(&mut upstream).await, frame);
    }

    let inbound = [
        r#"{"op":0,"d":{"obsWebSocketVersion":"5.5.0","rpcVersion":1}}"#.to_string(),
        r#"{"op":5,"d":{"eventType":"CurrentProgramSceneChanged","eventIntent":4,"eventData":{"sceneName":"Battle"}}}"#.to_string(),
        screenshot_response("2", &png(b"frame")),
        "}{ garbage from upstream".to_string(),
    ];
    for frame in &inbound {
        upstream.send(Message::text(frame.clone())).await.unwrap();
    }
    for frame in &inbound {
        assert_eq!(&next_text(&mut client).await, frame);
    }
}

#[test_timeout::tokio_timeout_test(secs = 30, workers = 2)]
async fn synthetic_request_before_any_screenshot_gets_empty_results() {
    let mut fake = FakeUpstream::spawn().await;
    let proxy = spawn_proxy(&fake.url, Arc::new(NullRecognizer)).await;
    let mut client = connect_client(proxy).await;
    let (mut upstream, _) = fake.next_session().await;

    client
        .send(Message::text(
            r#"{"op":6,"d":{"requestType":"__GetTextFromLastScreenshot","requestId":"abc-1"}}"#,
        ))
        .await
        .unwrap();
    let response: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(
        response,
        json!({
            "op": 7,
            "d": {
                "requestType": "__GetTextFromLastScreenshot",
                "requestId": "abc-1",
                "requestStatus": {"result": true, "code": 100},
                "responseData": {"text_results": []}
            }
        })
    );

    // the synthetic request never reached upstream
    let marker = r#"{"op":6,"d":{"requestType":"GetStats","requestId":"m"}}"#;
    client.send(Message::text(marker)).await.unwrap();
    assert_eq!(next_text(&mut upstream).await, marker);
}

#[test_timeout::tokio_timeout_test(secs = 30, workers = 2)]
async fn latest_screenshot_is_recognized_and_integer_id_is_echoed() {
    let mut fake = FakeUpstream::spawn().await;
    let recognizer = Arc::new(RecordingRecognizer::default());
    let proxy = spawn_proxy(&fake.url, recognizer.clone()).await;
    let mut client = connect_client(proxy).await;
    let (mut upstream, _) = fake.next_session().await;

    let first = png(b"first");
    let second = png(b"second");
    for (id, image) in [("s1", &first), ("s2", &second)] {
        let frame = screenshot_response(id, image);
        upstream.send(Message::text(frame.clone())).await.unwrap();
        assert_eq!(next_text(&mut client).await, frame);
    }

    client
        .send(Message::text(
            r#"{"op":6,"d":{"requestType":"__GetTextFromLastScreenshot","requestId":42}}"#,
        ))
        .await
        .unwrap();
    let response: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();

    assert!(response["d"]["requestId"].is_i64());
    assert_eq!(response["d"]["requestId"], json!(42));
    assert_eq!(response["d"]["requestStatus"], json!({"result": true, "code": 100}));
    assert_eq!(
        response["d"]["responseData"]["text_results"],
        json!([{
            "text": "What will PIKACHU do?",
            "bounding_box": {"x": 0.125, "y": 0.25, "width": 0.5, "height": 0.0625}
        }])
    );
    assert_eq!(*recognizer.seen.lock(), vec![second]);
}

#[test_timeout::tokio_timeout_test(secs = 30, workers = 2)]
async fn upstream_traffic_flows_while_recognition_runs() {
    let mut fake = FakeUpstream::spawn().await;
    let recognizer = Arc::new(GatedRecognizer::default());
    let proxy = spawn_proxy(&fake.url, recognizer.clone()).await;
    let mut client = connect_client(proxy).await;
    let (mut upstream, _) = fake.next_session().await;

    let shot = screenshot_response("s1", &png(b"slow"));
    upstream.send(Message::text(shot.clone())).await.unwrap();
    assert_eq!(next_text(&mut client).await, shot);

    client
        .send(Message::text(
            r#"{"op":6,"d":{"requestType":"__GetTextFromLastScreenshot","requestId":"slow"}}"#,
        ))
        .await
        .unwrap();
    timeout(STEP, recognizer.started.notified())
        .await
        .expect("recognition never started");

    let event = r#"{"op":5,"d":{"eventType":"CurrentProgramSceneChanged","eventData":{"sceneName":"Battle"}}}"#;
    upstream.send(Message::text(event)).await.unwrap();
    assert_eq!(next_text(&mut client).await, event);

    recognizer.release.notify_one();
    let response: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
    assert_eq!(response["d"]["requestId"], "slow");
    assert_eq!(response["d"]["responseData"]["text_results"], json!([]));
}

#[test_timeout::tokio_timeout_test(secs = 30, workers = 2)]
async fn sessions_do_not_share_screenshots() {
    let mut fake = FakeUpstream::spawn().await;
    let recognizer = Arc::new(RecordingRecognizer::default());
    let proxy = spawn_proxy(&fake.url, recognizer.clone()).await;

    let mut first_client = connect_client(proxy).await;
    let (mut first_upstream, _) = fake.next_session().await;
    let mut second_client = connect_client(proxy).await;
    let (_second_upstream, _) = fake.next_session().await;

    let frame = screenshot_response("s1", &png(b"only-first"));
    first_upstream.send(Message::text(frame.clone())).await.unwrap();
    assert_eq!(next_text(&mut first_client).await, frame);

    second_client
        .send(Message::text(
            r#"{"op":6,"d":{"requestType":"__GetTextFromLastScreenshot","requestId":"b"}}"#,
        ))
        .await
        .unwrap();
    let response: Value = serde_json::from_str(&next_text(&mut second_client).await).unwrap();
    assert_eq!(response["d"]["responseData"]["text_results"], json!([]));
    assert!(recognizer.seen.lock().is_empty());
}

#[test_timeout::tokio_timeout_test(secs = 30, workers = 2)]
async fn client_close_closes_upstream() {
    let mut fake = FakeUpstream::spawn().await;
    let proxy = spawn_proxy(&fake.url, Arc::new(NullRecognizer)).await;
    let mut client = connect_client(proxy).await;
    let (mut upstream, _) = fake.next_session().await;

    client.close(None).await.unwrap();
    expect_closed(&mut upstream).await;
}

#[test_timeout::tokio_timeout_test(secs = 30, workers = 2)]
async fn upstream_close_closes_client_with_its_code() {
    let mut fake = FakeUpstream::spawn().await;
    let proxy = spawn_proxy(&fake.url, Arc::new(NullRecognizer)).await;
    let mut client = connect_client(proxy).await;
    let (mut upstream, _) = fake.next_session().await;

    upstream
        .close(Some(CloseFrame {
            code: CloseCode::from(4009),
            reason: "Authentication failed.".into(),
        }))
        .await
        .unwrap();

    let frame = expect_closed(&mut client).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 4009);
    assert_eq!(frame.reason, "Authentication failed.");
}

#[test_timeout::tokio_timeout_test(secs = 30, workers = 2)]
async fn unreachable_upstream_closes_client() {
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("ws://{}", parked.local_addr().unwrap());
    drop(parked);

    let proxy = spawn_proxy(&dead_url, Arc::new(NullRecognizer)).await;
    let mut client = connect_client(proxy).await;

    if let Some(frame) = expect_closed(&mut client).await {
        assert_eq!(frame.code, CloseCode::Error);
    }
}
