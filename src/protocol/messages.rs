use std::collections::BTreeMap;

use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::RequestId;

/// `type` tags the client knows how to decode.
const KNOWN_TYPES: [&str; 5] = ["http_request", "http_response", "ping", "pong", "error"];

/// A header value as carried on the wire: a single string or a list of
/// strings for repeated headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
}

impl HeaderField {
    pub fn values(&self) -> &[String] {
        match self {
            HeaderField::One(value) => std::slice::from_ref(value),
            HeaderField::Many(values) => values,
        }
    }

    /// Append a repeated value, promoting a single value to a list.
    pub fn push(&mut self, value: String) {
        match self {
            HeaderField::One(first) => {
                *self = HeaderField::Many(vec![std::mem::take(first), value]);
            }
            HeaderField::Many(values) => values.push(value),
        }
    }
}

pub type Headers = BTreeMap<String, HeaderField>;

/// Request received by the relay, to be replayed against the local service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub request_id: RequestId,
    pub method: String,
    #[serde(alias = "url")]
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, deserialize_with = "body_text")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
}

impl HttpRequest {
    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        decode_body(self.body.as_deref(), self.body_encoding.as_deref())
    }
}

/// Response produced by the local service (or synthesized on failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub request_id: RequestId,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, deserialize_with = "body_text")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
}

impl HttpResponse {
    pub fn new(
        request_id: RequestId,
        status_code: u16,
        headers: Headers,
        body: Option<Vec<u8>>,
    ) -> Self {
        let (body, body_encoding) = encode_body(body);
        Self {
            request_id,
            status_code,
            headers,
            body,
            body_encoding,
        }
    }

    #[cfg(test)]
    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        decode_body(self.body.as_deref(), self.body_encoding.as_deref())
    }
}

/// Frames exchanged over the control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    Ping {
        #[serde(default)]
        timestamp: i64,
    },
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
    Error {
        #[serde(alias = "error")]
        message: String,
    },
    /// A well-formed frame whose `type` this client does not understand.
    /// Never produced by serde and never sent.
    #[serde(skip)]
    Unknown { kind: String },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("invalid `{kind}` frame: {source}")]
    Schema {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// An `http_request` that names its request but is otherwise unusable.
    /// The relay still expects an answer for `request_id`.
    #[error("invalid http_request {request_id}: {source}")]
    InvalidRequest {
        request_id: RequestId,
        #[source]
        source: serde_json::Error,
    },
}

impl WireMessage {
    pub fn ping_now() -> Self {
        WireMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn pong(timestamp: i64) -> Self {
        WireMessage::Pong { timestamp }
    }

    /// Decode a single frame. Unrecognised `type` values yield
    /// [`WireMessage::Unknown`] rather than an error; extra fields are ignored.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(DecodeError::MissingType),
        };

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(WireMessage::Unknown { kind });
        }

        let request_id = match (kind.as_str(), value.get("requestId")) {
            ("http_request", Some(Value::String(id))) => Some(RequestId::from(id.as_str())),
            _ => None,
        };

        serde_json::from_value(value).map_err(|source| match request_id {
            Some(request_id) => DecodeError::InvalidRequest { request_id, source },
            None => DecodeError::Schema { kind, source },
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &str {
        match self {
            WireMessage::HttpRequest(_) => "http_request",
            WireMessage::HttpResponse(_) => "http_response",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::Error { .. } => "error",
            WireMessage::Unknown { kind } => kind,
        }
    }
}

/// Accepts a string body as-is, `null` as no body, and any other JSON value
/// (relays that pre-parse JSON payloads) as its serialized text.
fn body_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn encode_body(body: Option<Vec<u8>>) -> (Option<String>, Option<String>) {
    match body {
        None => (None, None),
        Some(data) if data.is_empty() => (Some(String::new()), None),
        Some(data) => match String::from_utf8(data) {
            Ok(s) => (Some(s), None),
            Err(e) => {
                // Binary data, encode as base64
                let encoded = base64::engine::general_purpose::STANDARD.encode(e.as_bytes());
                (Some(encoded), Some("base64".to_string()))
            }
        },
    }
}

pub fn decode_body(body: Option<&str>, encoding: Option<&str>) -> Option<Vec<u8>> {
    let body = body?;

    match encoding {
        Some("base64") => base64::engine::general_purpose::STANDARD.decode(body).ok(),
        _ => Some(body.as_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_http_request() {
        let frame = json!({
            "type": "http_request",
            "requestId": "req-1",
            "method": "POST",
            "path": "/api/items?page=2",
            "headers": {
                "content-type": "application/json",
                "accept": ["text/html", "application/json"]
            },
            "body": "{\"name\":\"x\"}"
        })
        .to_string();

        let WireMessage::HttpRequest(req) = WireMessage::decode(&frame).unwrap() else {
            panic!("expected http_request");
        };

        assert_eq!(req.request_id, RequestId::from("req-1"));
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/items?page=2");
        assert_eq!(req.headers["content-type"].values(), ["application/json"]);
        assert_eq!(
            req.headers["accept"].values(),
            ["text/html", "application/json"]
        );
        assert_eq!(req.body_bytes(), Some(b"{\"name\":\"x\"}".to_vec()));
    }

    #[test]
    fn test_decode_accepts_legacy_url_field_and_missing_optionals() {
        let frame = r#"{"type":"http_request","requestId":"r","method":"GET","url":"/health"}"#;

        let WireMessage::HttpRequest(req) = WireMessage::decode(frame).unwrap() else {
            panic!("expected http_request");
        };

        assert_eq!(req.path, "/health");
        assert!(req.headers.is_empty());
        assert_eq!(req.body, None);
        assert_eq!(req.body_bytes(), None);
    }

    #[test]
    fn test_decode_object_body_is_serialized() {
        let frame = json!({
            "type": "http_request",
            "requestId": "r",
            "method": "POST",
            "path": "/",
            "body": {"a": 1}
        })
        .to_string();

        let WireMessage::HttpRequest(req) = WireMessage::decode(&frame).unwrap() else {
            panic!("expected http_request");
        };

        assert_eq!(req.body.as_deref(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn test_decode_unknown_type() {
        let msg = WireMessage::decode(r#"{"type":"frobnicate","payload":1}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::Unknown {
                kind: "frobnicate".to_string()
            }
        );
        assert_eq!(msg.kind(), "frobnicate");
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            WireMessage::decode("not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            WireMessage::decode(r#"{"requestId":"r"}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            WireMessage::decode("[1,2,3]"),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            WireMessage::decode(r#"{"type":"http_request","method":"GET"}"#),
            Err(DecodeError::Schema { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_request_keeps_request_id() {
        let frame = json!({
            "type": "http_request",
            "requestId": "req-x",
            "method": "GET",
            "path": "/",
            "headers": { "x-count": 5 }
        })
        .to_string();

        let Err(DecodeError::InvalidRequest { request_id, .. }) = WireMessage::decode(&frame) else {
            panic!("expected InvalidRequest");
        };
        assert_eq!(request_id, RequestId::from("req-x"));

        // A non-string id cannot be answered
        assert!(matches!(
            WireMessage::decode(r#"{"type":"http_request","requestId":7,"method":"GET"}"#),
            Err(DecodeError::Schema { .. })
        ));
        // Only requests are answered on failure
        assert!(matches!(
            WireMessage::decode(r#"{"type":"http_response","requestId":"r","statusCode":"x"}"#),
            Err(DecodeError::Schema { .. })
        ));
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let msg = WireMessage::decode(r#"{"type":"ping","timestamp":42,"seq":7}"#).unwrap();
        assert_eq!(msg, WireMessage::Ping { timestamp: 42 });
    }

    #[test]
    fn test_decode_error_accepts_both_field_names() {
        let a = WireMessage::decode(r#"{"type":"error","message":"no tunnel"}"#).unwrap();
        let b = WireMessage::decode(r#"{"type":"error","error":"no tunnel"}"#).unwrap();
        let expected = WireMessage::Error {
            message: "no tunnel".to_string(),
        };
        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }

    #[test]
    fn test_encode_http_response_shape() {
        let mut headers = Headers::new();
        headers.insert(
            "set-cookie".to_string(),
            HeaderField::Many(vec!["a=1".to_string(), "b=2".to_string()]),
        );
        let msg = WireMessage::HttpResponse(HttpResponse::new(
            RequestId::from("req-9"),
            404,
            headers,
            Some(b"missing".to_vec()),
        ));

        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "http_response",
                "requestId": "req-9",
                "statusCode": 404,
                "headers": {"set-cookie": ["a=1", "b=2"]},
                "body": "missing"
            })
        );
    }

    #[test]
    fn test_encode_binary_body_as_base64() {
        let response = HttpResponse::new(
            RequestId::from("r"),
            200,
            Headers::new(),
            Some(vec![0xff, 0x00, 0xfe]),
        );

        assert_eq!(response.body_encoding.as_deref(), Some("base64"));
        assert_eq!(response.body_bytes(), Some(vec![0xff, 0x00, 0xfe]));
    }

    #[test]
    fn test_encode_unknown_fails() {
        let msg = WireMessage::Unknown {
            kind: "x".to_string(),
        };
        assert!(msg.encode().is_err());
    }
}
