//! Wire envelopes for the streaming channel.
//!
//! Inbound frames name the event under `event` or `type` and carry the body
//! under `payload` or `data`. Some older server paths send the body inline
//! with the name, in which case the whole object is the payload. Outbound
//! frames always use `{"type": .., "payload": ..}`.

use serde::Serialize;
use serde_json::{Map, Value};

/// A decoded inbound frame: event name plus raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    pub payload: Value,
}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no event name")]
    MissingEventName,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(FrameError::NotAnObject);
        };

        let event = match take_name(&mut object, "event").or_else(|| take_name(&mut object, "type"))
        {
            Some(name) => name,
            None => return Err(FrameError::MissingEventName),
        };

        let payload = match take_non_null(&mut object, "payload")
            .or_else(|| take_non_null(&mut object, "data"))
        {
            Some(payload) => payload,
            None => Value::Object(object),
        };

        Ok(Self { event, payload })
    }

    /// Encode in the canonical outbound shape.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        encode_outbound(&self.event, &self.payload)
    }
}

/// Serialize `{"type": event, "payload": payload}`.
pub fn encode_outbound<P: Serialize + ?Sized>(
    event: &str,
    payload: &P,
) -> Result<String, serde_json::Error> {
    #[derive(Serialize)]
    struct Outbound<'a, P: ?Sized> {
        #[serde(rename = "type")]
        event: &'a str,
        payload: &'a P,
    }

    serde_json::to_string(&Outbound { event, payload })
}

fn take_name(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key) {
        Some(Value::String(name)) if !name.is_empty() => {
            let name = name.clone();
            object.remove(key);
            Some(name)
        }
        _ => None,
    }
}

fn take_non_null(object: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match object.get(key) {
        Some(Value::Null) | None => None,
        Some(_) => object.remove(key),
    }
}
