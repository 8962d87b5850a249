//! Wire envelopes and the connection handshake.
//!
//! One JSON value per line, UTF-8. Requests look like
//! `{"id":1,"method":"add","params":[2,3]}`; every response carries all three
//! of `id`, `result` and `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method name of the structured handshake form.
pub const AUTHENTICATE_METHOD: &str = "_authenticate";

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub method: String,
    /// Positional parameters. Omitted means none.
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: i64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Response envelope. `result` and `error` are serialized even when null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: i64,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn error(id: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// First line sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Bare secret, either as raw text or as a JSON string.
    Secret(String),
    /// `{"id":n,"method":"_authenticate","params":[secret]}`. Answered with an
    /// envelope either way.
    Authenticate { id: i64, secret: Option<String> },
}

impl Handshake {
    /// Interpret a handshake line. Returns `None` for anything that is neither
    /// a secret nor an `_authenticate` request.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(line) {
            Ok(Value::String(secret)) => Some(Self::Secret(secret)),
            Ok(Value::Object(_)) => {
                let request: Request = serde_json::from_str(line).ok()?;
                if request.method != AUTHENTICATE_METHOD {
                    return None;
                }
                let secret = match request.params.first() {
                    Some(Value::String(s)) => Some(s.clone()),
                    _ => None,
                };
                Some(Self::Authenticate {
                    id: request.id,
                    secret,
                })
            }
            // Numbers, arrays, etc. that happen to parse are still raw text.
            Ok(_) | Err(_) => Some(Self::Secret(line.to_string())),
        }
    }

    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Secret(secret) => Some(secret),
            Self::Authenticate { secret, .. } => secret.as_deref(),
        }
    }
}

/// Constant-time comparison of two secrets.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_request() {
        let req: Request =
            serde_json::from_str(r#"{"id":1,"method":"add","params":[2,3]}"#).unwrap();
        assert_eq!(req, Request::new(1, "add", vec![json!(2), json!(3)]));
    }

    #[test]
    fn params_may_be_omitted() {
        let req: Request = serde_json::from_str(r#"{"id":7,"method":"ping"}"#).unwrap();
        assert!(req.params.is_empty());
    }

    #[test]
    fn request_requires_integer_id() {
        assert!(serde_json::from_str::<Request>(r#"{"id":"x","method":"ping"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"method":"ping"}"#).is_err());
    }

    #[test]
    fn success_response_keeps_all_keys() {
        let json = serde_json::to_string(&Response::success(1, json!("pong"))).unwrap();
        assert_eq!(json, r#"{"id":1,"result":"pong","error":null}"#);
    }

    #[test]
    fn void_success_has_null_result() {
        let json = serde_json::to_string(&Response::success(4, Value::Null)).unwrap();
        assert_eq!(json, r#"{"id":4,"result":null,"error":null}"#);
    }

    #[test]
    fn error_response() {
        let resp = Response::error(3, "Unknown RPC: doesNotExist");
        assert!(resp.is_error());
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"id":3,"result":null,"error":"Unknown RPC: doesNotExist"}"#
        );
    }

    #[test]
    fn handshake_forms() {
        assert_eq!(
            Handshake::parse("abc-123\n"),
            Some(Handshake::Secret("abc-123".into()))
        );
        assert_eq!(
            Handshake::parse(r#""abc-123""#),
            Some(Handshake::Secret("abc-123".into()))
        );
        assert_eq!(
            Handshake::parse(r#"{"id":0,"method":"_authenticate","params":["abc"]}"#),
            Some(Handshake::Authenticate {
                id: 0,
                secret: Some("abc".into())
            })
        );
        assert_eq!(
            Handshake::parse(r#"{"id":2,"method":"_authenticate","params":[]}"#),
            Some(Handshake::Authenticate { id: 2, secret: None })
        );
    }

    #[test]
    fn handshake_rejects_other_requests() {
        assert_eq!(Handshake::parse(r#"{"id":1,"method":"ping"}"#), None);
        assert_eq!(Handshake::parse(""), None);
        assert_eq!(Handshake::parse("\r\n"), None);
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3creT"));
        assert!(!secrets_match("s3cret", "s3cre"));
        assert!(!secrets_match("s3cret", ""));
    }
}
