use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::recognition::TextObservation;

/// Subprotocol token obs-websocket uses for JSON framing.
pub const OBS_JSON_SUBPROTOCOL: &str = "obswebsocket.json";

/// Request type answered by the proxy itself.
pub const SYNTHETIC_REQUEST_TYPE: &str = "__GetTextFromLastScreenshot";

/// Request type whose responses populate the screenshot cache.
pub const SCREENSHOT_REQUEST_TYPE: &str = "GetSourceScreenshot";

/// obs-websocket `RequestStatus::Success`.
pub const STATUS_SUCCESS: u16 = 100;

/// obs-websocket `RequestStatus::RequestProcessingFailed`.
pub const STATUS_REQUEST_PROCESSING_FAILED: u16 = 702;

/// Operation codes of the obs-websocket v5 envelope.
///
/// Codes the proxy has no name for are kept as `Other` so that decoding
/// never fails on a newer server or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Hello,
    Identify,
    Identified,
    Reidentify,
    Event,
    Request,
    RequestResponse,
    RequestBatch,
    RequestBatchResponse,
    Other(i64),
}

impl OpCode {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => OpCode::Hello,
            1 => OpCode::Identify,
            2 => OpCode::Identified,
            3 => OpCode::Reidentify,
            5 => OpCode::Event,
            6 => OpCode::Request,
            7 => OpCode::RequestResponse,
            8 => OpCode::RequestBatch,
            9 => OpCode::RequestBatchResponse,
            other => OpCode::Other(other),
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            OpCode::Hello => 0,
            OpCode::Identify => 1,
            OpCode::Identified => 2,
            OpCode::Reidentify => 3,
            OpCode::Event => 5,
            OpCode::Request => 6,
            OpCode::RequestResponse => 7,
            OpCode::RequestBatch => 8,
            OpCode::RequestBatchResponse => 9,
            OpCode::Other(raw) => raw,
        }
    }
}

/// Errors for frames that are not a `{op, d}` envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("envelope is missing `op`")]
    MissingOp,
    #[error("envelope `op` is not an integer")]
    InvalidOp,
}

/// A decoded envelope with a loosely typed payload.
///
/// The payload is kept as a generic JSON map; only the handful of fields
/// the proxy acts on are ever looked at.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    op: OpCode,
    payload: Map<String, Value>,
}

#[derive(Serialize)]
struct Envelope<T> {
    op: i64,
    d: T,
}

impl WireMessage {
    pub fn new(op: OpCode, payload: Map<String, Value>) -> Self {
        Self { op, payload }
    }

    pub fn op(&self) -> OpCode {
        self.op
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn into_payload(self) -> Map<String, Value> {
        self.payload
    }

    /// Decodes a text or binary frame.
    ///
    /// A missing or non-object `d` yields an empty payload; unknown `op`
    /// values and unexpected fields are accepted as-is.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(mut envelope) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let op = envelope
            .get("op")
            .ok_or(DecodeError::MissingOp)?
            .as_i64()
            .ok_or(DecodeError::InvalidOp)?;

        let payload = match envelope.remove("d") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Ok(Self {
            op: OpCode::from_raw(op),
            payload,
        })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            op: self.op.as_raw(),
            d: &self.payload,
        })
    }
}

/// Correlation identifier echoed from a request onto its response.
///
/// obs-websocket clients use either strings or integers; the original JSON
/// type is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Text(String),
    Integer(i64),
}

impl RequestId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(RequestId::Text(text.clone())),
            Value::Number(number) => number.as_i64().map(RequestId::Integer),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Text(text) => f.write_str(text),
            RequestId::Integer(value) => write!(f, "{value}"),
        }
    }
}

/// True when `message` carries `op == expected_op` and
/// `d.requestType == expected_request_type`.
pub fn is_request_of(message: &WireMessage, expected_op: OpCode, expected_request_type: &str) -> bool {
    message.op == expected_op
        && message.payload.get("requestType").and_then(Value::as_str)
            == Some(expected_request_type)
}

/// Returns the request id and payload of a matching request or response.
///
/// Any op or request type mismatch yields `None`. A matching frame whose
/// `requestId` is absent or neither a string nor an integer also yields
/// `None` and is logged.
pub fn extract_request_payload<'a>(
    message: &'a WireMessage,
    expected_op: OpCode,
    expected_request_type: &str,
) -> Option<(RequestId, &'a Map<String, Value>)> {
    if !is_request_of(message, expected_op, expected_request_type) {
        return None;
    }

    match message.payload.get("requestId") {
        Some(value) => match RequestId::from_value(value) {
            Some(request_id) => Some((request_id, &message.payload)),
            None => {
                warn!(
                    request_type = expected_request_type,
                    request_id = %value,
                    "requestId is neither a string nor an integer"
                );
                None
            }
        },
        None => {
            warn!(
                request_type = expected_request_type,
                "request is missing requestId"
            );
            None
        }
    }
}

/// Takes `responseData.imageData` out of a `GetSourceScreenshot` response.
pub fn screenshot_from_response(message: WireMessage) -> Option<String> {
    extract_request_payload(&message, OpCode::RequestResponse, SCREENSHOT_REQUEST_TYPE)?;

    let mut payload = message.into_payload();
    let Value::Object(mut response_data) = payload.remove("responseData")? else {
        return None;
    };
    match response_data.remove("imageData")? {
        Value::String(image_data) => Some(image_data),
        _ => None,
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBody<'a> {
    request_type: &'static str,
    request_id: &'a RequestId,
    request_status: RequestStatus<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_data: Option<TextResultsRef<'a>>,
}

#[derive(Serialize)]
struct RequestStatus<'a> {
    result: bool,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
}

#[derive(Serialize)]
struct TextResultsRef<'a> {
    text_results: &'a [TextObservation],
}

fn encode_response(body: ResponseBody<'_>) -> serde_json::Result<String> {
    serde_json::to_string(&Envelope {
        op: OpCode::RequestResponse.as_raw(),
        d: body,
    })
}

/// Builds the successful `__GetTextFromLastScreenshot` response.
pub fn build_synthetic_response(
    request_id: &RequestId,
    text_results: &[TextObservation],
) -> serde_json::Result<String> {
    encode_response(ResponseBody {
        request_type: SYNTHETIC_REQUEST_TYPE,
        request_id,
        request_status: RequestStatus {
            result: true,
            code: STATUS_SUCCESS,
            comment: None,
        },
        response_data: Some(TextResultsRef { text_results }),
    })
}

/// Builds a failed `__GetTextFromLastScreenshot` response without
/// `responseData`.
pub fn build_failed_response(
    request_id: &RequestId,
    code: u16,
    comment: &str,
) -> serde_json::Result<String> {
    encode_response(ResponseBody {
        request_type: SYNTHETIC_REQUEST_TYPE,
        request_id,
        request_status: RequestStatus {
            result: false,
            code,
            comment: Some(comment),
        },
        response_data: None,
    })
}
