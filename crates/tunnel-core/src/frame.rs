//! Control-link frame codec (C1).
//!
//! The wire format is a JSON object with a `type` field carrying one of eight literal
//! kind strings and a required `streamId`. Binary payloads (`DATA`, `WS_DATA`) are
//! base64-encoded in a `data` field alongside an `_isBase64` sentinel.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TunnelError;

pub type StreamId = String;

/// A binary payload transported as base64 text on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Base64Data(pub Vec<u8>);

impl Base64Data {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Base64Data(bytes.into())
    }
}

impl Serialize for Base64Data {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            data: &'a str,
            #[serde(rename = "_isBase64")]
            is_base64: bool,
        }
        let encoded = BASE64.encode(&self.0);
        Wire {
            data: &encoded,
            is_base64: true,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Base64Data {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wire {
            data: String,
            #[serde(default, rename = "_isBase64")]
            #[allow(dead_code)]
            is_base64: bool,
        }
        let wire = Wire::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(wire.data.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Base64Data(bytes))
    }
}

/// One of the eight control-link message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "TUNNEL_REQUEST")]
    Request {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        port: u16,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheme: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "workerId")]
        worker_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "deadlineMs")]
        deadline_ms: Option<u64>,
    },

    #[serde(rename = "TUNNEL_RESPONSE")]
    Response {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        #[serde(rename = "statusCode")]
        status_code: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            rename = "statusMessage"
        )]
        status_message: Option<String>,
    },

    #[serde(rename = "TUNNEL_DATA")]
    Data {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        #[serde(flatten)]
        payload: Base64Data,
    },

    #[serde(rename = "TUNNEL_END")]
    End {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
    },

    #[serde(rename = "TUNNEL_ERROR")]
    Error {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        error: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            rename = "statusCode"
        )]
        status_code: Option<u16>,
    },

    #[serde(rename = "TUNNEL_WS_UPGRADE")]
    WsUpgrade {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        port: u16,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },

    #[serde(rename = "TUNNEL_WS_DATA")]
    WsData {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        #[serde(flatten)]
        payload: Base64Data,
        #[serde(rename = "isBinary")]
        is_binary: bool,
    },

    #[serde(rename = "TUNNEL_WS_CLOSE")]
    WsClose {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Frame {
    pub fn stream_id(&self) -> &str {
        match self {
            Frame::Request { stream_id, .. }
            | Frame::Response { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::End { stream_id }
            | Frame::Error { stream_id, .. }
            | Frame::WsUpgrade { stream_id, .. }
            | Frame::WsData { stream_id, .. }
            | Frame::WsClose { stream_id, .. } => stream_id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "TUNNEL_REQUEST",
            Frame::Response { .. } => "TUNNEL_RESPONSE",
            Frame::Data { .. } => "TUNNEL_DATA",
            Frame::End { .. } => "TUNNEL_END",
            Frame::Error { .. } => "TUNNEL_ERROR",
            Frame::WsUpgrade { .. } => "TUNNEL_WS_UPGRADE",
            Frame::WsData { .. } => "TUNNEL_WS_DATA",
            Frame::WsClose { .. } => "TUNNEL_WS_CLOSE",
        }
    }

    pub fn error(stream_id: impl Into<StreamId>, error: &TunnelError) -> Frame {
        Frame::Error {
            stream_id: stream_id.into(),
            error: error.to_string(),
            status_code: Some(error.status_code()),
        }
    }

    pub fn data(stream_id: impl Into<StreamId>, bytes: impl Into<Vec<u8>>) -> Frame {
        Frame::Data {
            stream_id: stream_id.into(),
            payload: Base64Data::new(bytes),
        }
    }

    pub fn ws_data(stream_id: impl Into<StreamId>, bytes: impl Into<Vec<u8>>, is_binary: bool) -> Frame {
        Frame::WsData {
            stream_id: stream_id.into(),
            payload: Base64Data::new(bytes),
            is_binary,
        }
    }

    pub fn end(stream_id: impl Into<StreamId>) -> Frame {
        Frame::End {
            stream_id: stream_id.into(),
        }
    }
}

/// Parses one text frame. Missing `type`/`streamId` or kind-specific required fields
/// produce [`TunnelError::MalformedFrame`]; the link stays up regardless.
pub fn parse_frame(text: &str) -> Result<Frame, TunnelError> {
    serde_json::from_str(text).map_err(|e| TunnelError::MalformedFrame(e.to_string()))
}

/// Serializes a frame to its wire text form. Total for every valid in-memory `Frame`.
pub fn serialize_frame(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("Frame serialization is total for valid values")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_wire_format() {
        let frame = Frame::Request {
            stream_id: "s1".into(),
            port: 3000,
            method: "GET".into(),
            path: "/hello".into(),
            headers: HashMap::new(),
            scheme: None,
            worker_id: None,
            deadline_ms: None,
        };
        let text = serialize_frame(&frame);
        assert!(text.contains("\"type\":\"TUNNEL_REQUEST\""));
        assert!(text.contains("\"streamId\":\"s1\""));
        let parsed = parse_frame(&text).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn data_frame_round_trips_binary_bytes_exactly() {
        let bytes = vec![0u8, 1, 2, 255, 254, 10, 13];
        let frame = Frame::data("s2", bytes.clone());
        let text = serialize_frame(&frame);
        assert!(text.contains("_isBase64"));
        let parsed = parse_frame(&text).unwrap();
        match parsed {
            Frame::Data { payload, .. } => assert_eq!(payload.0, bytes),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn missing_type_field_is_malformed() {
        let err = parse_frame(r#"{"streamId":"s1"}"#).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        // TUNNEL_REQUEST without port/method/path.
        let err = parse_frame(r#"{"type":"TUNNEL_REQUEST","streamId":"s1"}"#).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
    }

    #[test]
    fn unknown_kind_is_malformed_not_panicking() {
        let err = parse_frame(r#"{"type":"TUNNEL_BOGUS","streamId":"s1"}"#).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
    }

    #[test]
    fn ws_data_carries_binarity() {
        let frame = Frame::ws_data("s3", b"hello".to_vec(), true);
        let text = serialize_frame(&frame);
        let parsed = parse_frame(&text).unwrap();
        match parsed {
            Frame::WsData {
                payload, is_binary, ..
            } => {
                assert_eq!(payload.0, b"hello");
                assert!(is_binary);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn error_frame_carries_status_code_from_tunnel_error() {
        let err = TunnelError::PolicyDenied(8080);
        let frame = Frame::error("s4", &err);
        match frame {
            Frame::Error { status_code, .. } => assert_eq!(status_code, Some(403)),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
