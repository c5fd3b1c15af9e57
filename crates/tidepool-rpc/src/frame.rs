//! JSON text frames exchanged over the WebSocket.
//!
//! Three shapes travel on the wire:
//!
//! - request: `{"id": 7, "method": "MR.task.liveQuery", "params": [...]}`
//! - response: `{"id": 7, "result": ...}` or `{"id": 7, "error": {"message": "..."}}`
//! - push: `{"method": "MR.task.add", "params": [...]}` (server → client, no id)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Outgoing request, correlated with its response by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

/// Error payload carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Response to a previously sent request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

/// Server-initiated call with no reply expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Anything the server may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Response(ResponseFrame),
    Push(PushFrame),
}

impl RequestFrame {
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Frame {
            message: e.to_string(),
            body: self.method.clone(),
        })
    }
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::Frame {
            message: e.to_string(),
            body: text.to_owned(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let frame = RequestFrame {
            id: 3,
            method: "MR.task.liveQuery".into(),
            params: vec![json!([{"method": "find", "args": []}]), json!(1)],
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "id": 3,
          "method": "MR.task.liveQuery",
          "params": [
            [
              {
                "args": [],
                "method": "find"
              }
            ],
            1
          ]
        }
        "#);
    }

    #[test]
    fn decode_success_response() {
        let frame = InboundFrame::decode(r#"{"id": 9, "result": {"count": 4}}"#).unwrap();
        match frame {
            InboundFrame::Response(resp) => {
                assert_eq!(resp.id, 9);
                assert_eq!(resp.result, Some(json!({"count": 4})));
                assert!(resp.error.is_none());
            }
            InboundFrame::Push(_) => panic!("expected response"),
        }
    }

    #[test]
    fn decode_error_response() {
        let frame =
            InboundFrame::decode(r#"{"id": 2, "error": {"message": "nope", "code": "E1"}}"#)
                .unwrap();
        let InboundFrame::Response(resp) = frame else {
            panic!("expected response");
        };
        let err = resp.error.unwrap();
        assert_eq!(err.message, "nope");
        assert_eq!(err.code.as_deref(), Some("E1"));
    }

    #[test]
    fn decode_push() {
        let frame = InboundFrame::decode(
            r#"{"method": "MR.task.add", "params": [1, {"_id": "a"}, 0]}"#,
        )
        .unwrap();
        let InboundFrame::Push(push) = frame else {
            panic!("expected push");
        };
        assert_eq!(push.method, "MR.task.add");
        assert_eq!(push.params.len(), 3);
    }

    #[test]
    fn decode_garbage_is_frame_error() {
        let err = InboundFrame::decode("not json").unwrap_err();
        assert!(matches!(err, Error::Frame { .. }));
    }
}
