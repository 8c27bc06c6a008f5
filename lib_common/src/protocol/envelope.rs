//! # Envelope
//!
//! Every frame on the wire is one JSON object of the shape
//!
//! ```text
//! { "message": <tag>, "clientTime" | "serverTime": <unix seconds>, "payload": { "type": ..., ... } }
//! ```
//!
//! The `payload.type` field tells requests from responses. Responses carry a
//! `result` of `ok` or `error` (with an `error` reason string in the latter case).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ProtocolError;

/// Message tags understood by the clients.
pub mod tags {
    pub const AUTHENTICATION: &str = "authentication";
    pub const REGISTRATION: &str = "registration";
    pub const KEEPALIVE: &str = "keepalive";
    pub const SENSOR_ALERT: &str = "sensoralert";
    pub const STATE_CHANGE: &str = "statechange";
    pub const SENSORS_STATE: &str = "sensorsstate";
    pub const OPTION: &str = "option";
    pub const STATUS: &str = "status";
}

const TYPE_REQUEST: &str = "request";
const TYPE_RESPONSE: &str = "response";
const RESULT_OK: &str = "ok";
const RESULT_ERROR: &str = "error";

/// Current wall clock as unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Whether a frame asks for something or answers something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: String,
    #[serde(rename = "clientTime", default, skip_serializing_if = "Option::is_none")]
    pub client_time: Option<i64>,
    #[serde(rename = "serverTime", default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<i64>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// # Request
    ///
    /// Builds a client request frame. The payload must serialize to a JSON
    /// object; `type: "request"` is added to it.
    pub fn request<P: Serialize>(tag: &str, payload: &P) -> Result<Self, ProtocolError> {
        let mut object = to_object(tag, payload)?;
        object.insert("type".into(), Value::String(TYPE_REQUEST.into()));
        Ok(Self::client(tag, object))
    }

    /// Positive response to a server request with the given tag.
    pub fn response_ok(tag: &str) -> Self {
        let mut object = Map::new();
        object.insert("type".into(), Value::String(TYPE_RESPONSE.into()));
        object.insert("result".into(), Value::String(RESULT_OK.into()));
        Self::client(tag, object)
    }

    /// Negative response carrying the reason the request was refused.
    pub fn response_error(tag: &str, reason: &str) -> Self {
        let mut object = Map::new();
        object.insert("type".into(), Value::String(TYPE_RESPONSE.into()));
        object.insert("result".into(), Value::String(RESULT_ERROR.into()));
        object.insert("error".into(), Value::String(reason.into()));
        Self::client(tag, object)
    }

    fn client(tag: &str, payload: Map<String, Value>) -> Self {
        Self { message: tag.to_string(), client_time: Some(unix_now()), server_time: None, payload }
    }

    /// Classifies the frame by its `payload.type`.
    pub fn kind(&self) -> Result<PayloadKind, ProtocolError> {
        match self.payload.get("type").and_then(Value::as_str) {
            Some(TYPE_REQUEST) => Ok(PayloadKind::Request),
            Some(TYPE_RESPONSE) => Ok(PayloadKind::Response),
            Some(other) => Err(ProtocolError::InvalidPayload {
                tag: self.message.clone(),
                reason: format!("unknown payload type '{other}'"),
            }),
            None => Err(ProtocolError::InvalidPayload { tag: self.message.clone(), reason: "missing payload type".into() }),
        }
    }

    /// # Result
    ///
    /// For a response frame, `Ok(())` when the server accepted the request and
    /// `Err(reason)` when it refused it.
    pub fn result(&self) -> Result<(), String> {
        match self.payload.get("result").and_then(Value::as_str) {
            Some(RESULT_OK) => Ok(()),
            Some(_) => Err(self
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request refused without reason")
                .to_string()),
            None => Err("response without result".to_string()),
        }
    }

    /// Deserializes the payload (minus the bookkeeping fields) into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| ProtocolError::InvalidPayload { tag: self.message.clone(), reason: e.to_string() })
    }
}

fn to_object<P: Serialize>(tag: &str, payload: &P) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::to_value(payload) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(ProtocolError::Serialize {
            tag: tag.to_string(),
            reason: format!("payload must be a JSON object, got {other}"),
        }),
        Err(e) => Err(ProtocolError::Serialize { tag: tag.to_string(), reason: e.to_string() }),
    }
}
