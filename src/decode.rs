//! Inbound frame decoding.

use serde_json::Value;

/// Message decoder trait for converting raw frame bytes into messages.
///
/// The [`ConnectionManager`](crate::ConnectionManager) runs every inbound
/// text or binary frame through its decoder before updating the last-message
/// slot and broadcasting to subscribers.
///
/// # Example
///
/// ```ignore
/// pub struct TickDecoder;
///
/// impl MessageDecoder<Tick> for TickDecoder {
///     fn decode(&self, bytes: &[u8]) -> reconnecting_ws::Result<Tick> {
///         Ok(serde_json::from_slice(bytes)?)
///     }
/// }
/// ```
pub trait MessageDecoder<M>: Send + Sync + 'static {
    /// Decode one inbound frame into a message.
    fn decode(&self, bytes: &[u8]) -> crate::Result<M>;
}

/// An inbound payload: structured when JSON decoding succeeds, raw otherwise.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Frame decoded as JSON
    Json(Value),
    /// Non-JSON text frame, passed through unchanged
    Text(String),
    /// Non-UTF-8 binary frame, passed through unchanged
    Binary(Vec<u8>),
}

impl Payload {
    /// The decoded JSON value, if this payload is structured.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) | Self::Binary(_) => None,
        }
    }

    /// The raw text, if this payload is an undecoded text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(_) | Self::Binary(_) => None,
        }
    }
}

/// Default decoder: attempt a structured JSON decode, pass the raw payload
/// through unchanged on failure. Never errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl MessageDecoder<Payload> for JsonDecoder {
    fn decode(&self, bytes: &[u8]) -> crate::Result<Payload> {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return Ok(Payload::Json(value));
        }

        Ok(match std::str::from_utf8(bytes) {
            Ok(text) => Payload::Text(text.to_owned()),
            Err(_) => Payload::Binary(bytes.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_frame_decodes_structured() {
        let payload = JsonDecoder
            .decode(br#"{"kind":"tick","value":42}"#)
            .expect("decode");
        assert_eq!(payload, Payload::Json(json!({"kind": "tick", "value": 42})));
    }

    #[test]
    fn non_json_text_passes_through_raw() {
        let payload = JsonDecoder.decode(b"hello there").expect("decode");
        assert_eq!(payload.as_text(), Some("hello there"));
    }

    #[test]
    fn non_utf8_bytes_pass_through_raw() {
        let payload = JsonDecoder.decode(&[0xff, 0xfe, 0x00]).expect("decode");
        assert_eq!(payload, Payload::Binary(vec![0xff, 0xfe, 0x00]));
    }

    #[test]
    fn bare_json_scalar_still_counts_as_structured() {
        let payload = JsonDecoder.decode(b"42").expect("decode");
        assert_eq!(payload, Payload::Json(json!(42)));
    }
}
