//! The wire protocol (spec.md §4.7).
//!
//! Frames aren't a single tagged enum on the wire — the original protocol
//! distinguishes them by which keys are present, not by a `type` field, so
//! each shape below is its own struct and the connection handler picks
//! which one to parse/send based on the state it's in.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// First message a client sends after connecting: `{token, last_update?}`.
/// `last_update` is present on reconnect and carries the `_tstamp` of the
/// last document the client successfully applied, letting it catch up
/// directly instead of replaying the full snapshot.
#[derive(Debug, Deserialize)]
pub struct AuthMessage {
    pub token: String,
    #[serde(default)]
    pub last_update: Option<f64>,
}

/// Server's handshake reply: `{status_code}`. 200 on success; 401/403/404
/// per spec.md §7, after which the server closes the connection.
#[derive(Debug, Serialize)]
pub struct StatusFrame {
    pub status_code: u16,
}

/// Sent once authenticated, before streaming begins: the anchors this
/// connection starts out following.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialAnchorsFrame {
    pub initial_anchors: Vec<String>,
}

/// A client-invoked RPC call: `{callId, action, params}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCall {
    pub call_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// Successful RPC reply: `{callId, result}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub call_id: String,
    pub result: Value,
}

/// Failed RPC reply: `{callId, error}`. Never closes the connection —
/// spec.md §7's `ActionError` is reported in-band.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionErrorFrame {
    pub call_id: String,
    pub error: String,
}

/// A server-pushed runtime variable update: `{runtimeVar, value}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVarFrame {
    pub runtime_var: String,
    pub value: Value,
}

/// Tells the client to start following a new anchor mid-connection, without
/// reconnecting: `{prependAnchor}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrependAnchorFrame {
    pub prepend_anchor: String,
}

/// A client request to follow or drop an anchor after the initial
/// handshake — the dynamic half of the per-connection followed-anchor set.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum AnchorSubscriptionRequest {
    #[serde(rename = "follow")]
    Follow { anchor_id: String },
    #[serde(rename = "unfollow")]
    Unfollow { anchor_id: String },
}

/// Every shape a client may send once streaming has started. Actions and
/// anchor subscription changes are the only two the connection handler
/// expects in LIVE state; distinguished by which fields are present.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Action(ActionCall),
    AnchorSubscription(AnchorSubscriptionRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_without_last_update() {
        let json = r#"{"token": "abc"}"#;
        let msg: AuthMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.token, "abc");
        assert_eq!(msg.last_update, None);
    }

    #[test]
    fn auth_message_with_last_update() {
        let json = r#"{"token": "abc", "last_update": 1700000000.5}"#;
        let msg: AuthMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.last_update, Some(1700000000.5));
    }

    #[test]
    fn status_frame_serializes_bare() {
        let frame = StatusFrame { status_code: 401 };
        assert_eq!(serde_json::to_string(&frame).unwrap(), r#"{"status_code":401}"#);
    }

    #[test]
    fn action_call_parses_camel_case() {
        let json = r#"{"callId": "c1", "action": "sendMessage", "params": {"text": "hi"}}"#;
        let call: ActionCall = serde_json::from_str(json).unwrap();
        assert_eq!(call.call_id, "c1");
        assert_eq!(call.action, "sendMessage");
    }

    #[test]
    fn action_error_frame_shape() {
        let frame = ActionErrorFrame {
            call_id: "c1".into(),
            error: "unknown action".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"callId":"c1","error":"unknown action"}"#);
    }
}
