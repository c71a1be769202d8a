//! WebSocket wire message shapes (spec.md §4.8, §6).
//!
//! Grounded on `examples/original_source/src/app_ws_client.cc`'s message
//! keyword table (`cmd`/`type`/`data`/`mesg` etc.) and the teacher's
//! `serde`-derive idiom for wire structs (`rust/src/streaming/webrtc_streamer.rs`
//! `OfferPayload`/`IceCandidatePayload`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `data` field of a `{"cmd":"request","type":"config", ...}` message
/// (spec.md §4.8 last row).
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigAction {
    Read,
    Save,
    ResetToDefault,
    Apply,
    Patch(Value),
}

impl ConfigAction {
    pub fn from_json(value: &Value) -> Self {
        match value.as_str() {
            Some("read") => ConfigAction::Read,
            Some("save") => ConfigAction::Save,
            Some("reset-to-default") => ConfigAction::ResetToDefault,
            Some("apply") => ConfigAction::Apply,
            _ => ConfigAction::Patch(value.clone()),
        }
    }
}

/// A parsed inbound command (spec.md §6 inbound table). Parsing from the raw
/// `serde_json::Value` happens in `ClientCommand::from_value` rather than via
/// `#[derive(Deserialize)]` directly on this enum, since the wire format
/// discriminates on `cmd` plus a nested `type`/`data` shape that doesn't map
/// cleanly onto serde's tagged-enum representations.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Register { room_id: i64, client_id: i64 },
    Send { msg: String },
    RequestDeviceId,
    RequestConfig { deviceid: String, data: ConfigAction },
    Unknown,
}

impl ClientCommand {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let cmd = value.get("cmd").and_then(Value::as_str).ok_or("missing cmd field")?;
        match cmd {
            "register" => {
                let room_id = value.get("roomid").and_then(Value::as_i64).ok_or("missing roomid")?;
                let client_id = value.get("clientid").and_then(Value::as_i64).ok_or("missing clientid")?;
                Ok(ClientCommand::Register { room_id, client_id })
            }
            "send" => {
                let msg = value.get("msg").and_then(Value::as_str).ok_or("missing msg")?.to_string();
                Ok(ClientCommand::Send { msg })
            }
            "request" => {
                let ty = value.get("type").and_then(Value::as_str).ok_or("missing type")?;
                match ty {
                    "deviceid" => Ok(ClientCommand::RequestDeviceId),
                    "config" => {
                        let deviceid = value.get("deviceid").and_then(Value::as_str).unwrap_or_default().to_string();
                        let data = value.get("data").cloned().ok_or("missing data")?;
                        Ok(ClientCommand::RequestConfig { deviceid, data: ConfigAction::from_json(&data) })
                    }
                    _ => Ok(ClientCommand::Unknown),
                }
            }
            _ => Ok(ClientCommand::Unknown),
        }
    }
}

/// The inner envelope carried by a `{"cmd":"send","msg":"..."}` message,
/// typically SDP or ICE (spec.md §4.8). Only the `type` discriminant is
/// inspected by the signaling layer itself; the payload is otherwise opaque
/// and handed to the WebRTC stack.
#[derive(Debug, Clone, Deserialize)]
pub struct InnerEnvelope {
    #[serde(rename = "type")]
    pub message_type: Option<String>,
}

pub const INNER_TYPE_BYE: &str = "bye";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseResult {
    Success,
    Failed,
}

/// Outbound envelopes from the server (spec.md §6 outbound table).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ServerEnvelope {
    Send {
        msg: String,
    },
    Response {
        #[serde(rename = "type")]
        response_type: String,
        data: Value,
        result: ResponseResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        #[serde(rename = "type")]
        event_type: EventType,
        mesg: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Error,
    Notice,
}

impl ServerEnvelope {
    pub fn error_event(mesg: impl Into<String>) -> Self {
        ServerEnvelope::Event { event_type: EventType::Error, mesg: mesg.into() }
    }

    pub fn notice_event(mesg: impl Into<String>) -> Self {
        ServerEnvelope::Event { event_type: EventType::Notice, mesg: mesg.into() }
    }

    pub fn response_ok(response_type: impl Into<String>, data: Value) -> Self {
        ServerEnvelope::Response {
            response_type: response_type.into(),
            data,
            result: ResponseResult::Success,
            error: None,
        }
    }

    pub fn response_failed(response_type: impl Into<String>, error: impl Into<String>) -> Self {
        ServerEnvelope::Response {
            response_type: response_type.into(),
            data: Value::Null,
            result: ResponseResult::Failed,
            error: Some(error.into()),
        }
    }

    pub fn send(msg: impl Into<String>) -> Self {
        ServerEnvelope::Send { msg: msg.into() }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).expect("ServerEnvelope always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_command() {
        let value = serde_json::json!({"cmd": "register", "roomid": 1, "clientid": 2});
        let cmd = ClientCommand::from_value(&value).unwrap();
        assert_eq!(cmd, ClientCommand::Register { room_id: 1, client_id: 2 });
    }

    #[test]
    fn parses_config_patch_data_as_object() {
        let value = serde_json::json!({
            "cmd": "request", "type": "config", "deviceid": "abc",
            "data": {"rotation": 90}
        });
        let cmd = ClientCommand::from_value(&value).unwrap();
        match cmd {
            ClientCommand::RequestConfig { deviceid, data } => {
                assert_eq!(deviceid, "abc");
                assert_eq!(data, ConfigAction::Patch(serde_json::json!({"rotation": 90})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_event_serializes_per_outbound_contract() {
        let env = ServerEnvelope::error_event("Streamer session is already in use by another user");
        let json: Value = serde_json::from_str(&env.to_json_string()).unwrap();
        assert_eq!(json["cmd"], "event");
        assert_eq!(json["type"], "error");
        assert_eq!(json["mesg"], "Streamer session is already in use by another user");
    }

    #[test]
    fn inner_bye_message_type_detected() {
        let inner: InnerEnvelope = serde_json::from_str(r#"{"type":"bye"}"#).unwrap();
        assert_eq!(inner.message_type.as_deref(), Some(INNER_TYPE_BYE));
    }
}
