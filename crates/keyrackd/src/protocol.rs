//! Wire protocol for the keyrack daemon
//!
//! One newline-free JSON request document per connection, one JSON response
//! back, then the connection closes. Request: `{command, payload}`.
//! Response: `{success, data?, error?}`.

use keyrack_core::{KeyGrade, KeyGrant};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A single daemon command with its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload")]
pub enum Request {
    /// Store a batch of grants, overwriting by slug
    #[serde(rename = "UNLOCK")]
    Unlock { keys: Vec<KeyGrant> },

    /// Fetch requested grants, filtered by org/env; expired or missing
    /// grants are omitted, never errors
    #[serde(rename = "GET")]
    Get {
        slugs: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        org: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<String>,
    },

    /// List all live grants with remaining TTL
    #[serde(rename = "STATUS")]
    Status {},

    /// Purge grants: exactly `slugs` if given, else everything under `env`,
    /// else the whole store
    #[serde(rename = "RELOCK")]
    Relock {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slugs: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<String>,
    },

    /// Liveness and identity probe
    #[serde(rename = "PING")]
    Ping {},
}

/// Uniform response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self { success: true, data: Some(value), error: None },
            Err(e) => Self::err(format!("failed to encode response: {}", e)),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()) }
    }

    /// Decode the `data` payload into a typed shape.
    pub fn parse_data<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| anyhow::anyhow!("response carried no data"))?;
        Ok(serde_json::from_value(data)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockData {
    pub unlocked: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetData {
    pub keys: Vec<KeyGrant>,
}

/// One live grant as STATUS reports it. `ttl_left_ms` is `null` for grants
/// with no expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub slug: String,
    pub env: String,
    pub org: String,
    pub vault: String,
    pub mech: String,
    pub grade: KeyGrade,
    pub ttl_left_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub keys: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelockData {
    pub relocked: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingData {
    pub pid: u32,
    pub version: String,
    pub session: String,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = Request::Get {
            slugs: vec!["acme.prod.A".to_string()],
            org: Some("acme".to_string()),
            env: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["command"], "GET");
        assert_eq!(json["payload"]["slugs"][0], "acme.prod.A");
        assert_eq!(json["payload"]["org"], "acme");
    }

    #[test]
    fn test_status_round_trip() {
        let json = r#"{"command":"STATUS","payload":{}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(req, Request::Status {}));
    }

    #[test]
    fn test_unknown_command_fails_to_parse() {
        let json = r#"{"command":"EXPLODE","payload":{}}"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }

    #[test]
    fn test_response_envelope() {
        let resp = Response::ok(&UnlockData { unlocked: vec!["a.b.c".to_string()] });
        assert!(resp.success);
        let data: UnlockData = resp.parse_data().unwrap();
        assert_eq!(data.unlocked, vec!["a.b.c"]);

        let resp = Response::err("nope");
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("nope"));
        // No data key at all on errors
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"data\""));
    }
}
