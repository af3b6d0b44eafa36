//! Gateway wire format: the `{op, d, s, t}` envelope, op-codes, close codes
//! and the handshake payloads a shard sends.

use crate::error::Error;
use serde::Deserialize;
use serde_json::{json, Value};

/// Gateway op-codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::PresenceUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Dispatch => 0,
            OpCode::Heartbeat => 1,
            OpCode::Identify => 2,
            OpCode::PresenceUpdate => 3,
            OpCode::VoiceStateUpdate => 4,
            OpCode::Resume => 6,
            OpCode::Reconnect => 7,
            OpCode::RequestGuildMembers => 8,
            OpCode::InvalidSession => 9,
            OpCode::Hello => 10,
            OpCode::HeartbeatAck => 11,
        }
    }
}

/// One inbound gateway frame
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Decode a text frame. Unknown op-codes are a protocol error.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let payload: GatewayPayload = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed payload: {}", e)))?;
        if OpCode::from_u8(payload.op).is_none() {
            return Err(Error::Protocol(format!("unknown opcode {}", payload.op)));
        }
        Ok(payload)
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }
}

/// `d` of a Hello
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// The fields of READY the shard itself needs
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// A dispatched event handed to the [`crate::EventHandler`]
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    pub name: String,
    pub sequence: Option<u64>,
    pub data: Value,
}

/// Commands an application may send over a shard
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    PresenceUpdate(Value),
    VoiceStateUpdate(Value),
    RequestGuildMembers(Value),
}

impl GatewayCommand {
    pub fn opcode(&self) -> OpCode {
        match self {
            GatewayCommand::PresenceUpdate(_) => OpCode::PresenceUpdate,
            GatewayCommand::VoiceStateUpdate(_) => OpCode::VoiceStateUpdate,
            GatewayCommand::RequestGuildMembers(_) => OpCode::RequestGuildMembers,
        }
    }

    pub fn to_json(&self) -> String {
        let d = match self {
            GatewayCommand::PresenceUpdate(d)
            | GatewayCommand::VoiceStateUpdate(d)
            | GatewayCommand::RequestGuildMembers(d) => d,
        };
        json!({ "op": self.opcode().as_u8(), "d": d }).to_string()
    }
}

pub fn identify(token: &str, intents: u64, shard_id: u32, total_shards: u32) -> String {
    json!({
        "op": OpCode::Identify.as_u8(),
        "d": {
            "token": token,
            "intents": intents,
            "shard": [shard_id, total_shards],
            "compress": false,
            "properties": {
                "os": std::env::consts::OS,
                "browser": env!("CARGO_PKG_NAME"),
                "device": env!("CARGO_PKG_NAME"),
            }
        }
    })
    .to_string()
}

pub fn resume(token: &str, session_id: &str, sequence: Option<u64>) -> String {
    json!({
        "op": OpCode::Resume.as_u8(),
        "d": {
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        }
    })
    .to_string()
}

pub fn heartbeat(sequence: Option<u64>) -> String {
    json!({ "op": OpCode::Heartbeat.as_u8(), "d": sequence }).to_string()
}

/// What a gateway close code means for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the session
    Resume,
    /// Reconnect with a fresh identify
    Reidentify,
    /// Do not reconnect
    Fatal,
}

/// Classify a close code. Unknown codes resume.
pub fn classify_close(code: u16) -> CloseAction {
    match code {
        4000 | 4001 | 4002 | 4003 | 4005 | 4008 => CloseAction::Resume,
        4007 | 4009 => CloseAction::Reidentify,
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseAction::Fatal,
        _ => CloseAction::Resume,
    }
}

pub fn close_reason(code: u16) -> &'static str {
    match code {
        1000 => "Normal closure",
        1001 => "Going away",
        4000 => "Unknown error",
        4001 => "Unknown opcode",
        4002 => "Decode error",
        4003 => "Not authenticated",
        4004 => "Authentication failed",
        4005 => "Already authenticated",
        4007 => "Invalid seq",
        4008 => "Rate limited",
        4009 => "Session timed out",
        4010 => "Invalid shard",
        4011 => "Sharding required",
        4012 => "Invalid API version",
        4013 => "Invalid intent(s)",
        4014 => "Disallowed intent(s)",
        _ => "Unknown close code",
    }
}

/// Close code a client sends when it wants to resume afterwards.
/// 1000 and 1001 invalidate the session.
pub const RESUMABLE_CLOSE_CODE: u16 = 4000;
/// Close code for a clean shutdown
pub const NORMAL_CLOSE_CODE: u16 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dispatch() {
        let p = GatewayPayload::parse(
            r#"{"op":0,"d":{"session_id":"abc"},"s":42,"t":"READY"}"#,
        )
        .unwrap();
        assert_eq!(p.opcode(), Some(OpCode::Dispatch));
        assert_eq!(p.s, Some(42));
        assert_eq!(p.t.as_deref(), Some("READY"));
        let ready: Ready = serde_json::from_value(p.d).unwrap();
        assert_eq!(ready.session_id, "abc");
        assert!(ready.resume_gateway_url.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage_and_unknown_opcodes() {
        assert!(matches!(
            GatewayPayload::parse("{not json"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            GatewayPayload::parse(r#"{"op":5,"d":null}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_heartbeat_ack_without_data() {
        let p = GatewayPayload::parse(r#"{"op":11}"#).unwrap();
        assert_eq!(p.opcode(), Some(OpCode::HeartbeatAck));
        assert!(p.d.is_null());
    }

    #[test]
    fn test_close_code_table() {
        assert_eq!(classify_close(4000), CloseAction::Resume);
        assert_eq!(classify_close(4008), CloseAction::Resume);
        assert_eq!(classify_close(4007), CloseAction::Reidentify);
        assert_eq!(classify_close(4009), CloseAction::Reidentify);
        assert_eq!(classify_close(4004), CloseAction::Fatal);
        assert_eq!(classify_close(4014), CloseAction::Fatal);
        // Unknown codes resume with backoff
        assert_eq!(classify_close(1006), CloseAction::Resume);
        assert_eq!(classify_close(4999), CloseAction::Resume);
    }

    #[test]
    fn test_handshake_payloads() {
        let v: Value = serde_json::from_str(&identify("tok", 513, 3, 8)).unwrap();
        assert_eq!(v["op"], 2);
        assert_eq!(v["d"]["shard"], json!([3, 8]));
        assert_eq!(v["d"]["intents"], 513);

        let v: Value = serde_json::from_str(&resume("tok", "sess", Some(17))).unwrap();
        assert_eq!(v["op"], 6);
        assert_eq!(v["d"]["session_id"], "sess");
        assert_eq!(v["d"]["seq"], 17);

        let v: Value = serde_json::from_str(&heartbeat(None)).unwrap();
        assert_eq!(v["op"], 1);
        assert!(v["d"].is_null());
    }

    #[test]
    fn test_command_opcodes() {
        let cmd = GatewayCommand::PresenceUpdate(json!({"status": "idle"}));
        let v: Value = serde_json::from_str(&cmd.to_json()).unwrap();
        assert_eq!(v["op"], 3);
        assert_eq!(v["d"]["status"], "idle");
        assert_eq!(
            GatewayCommand::RequestGuildMembers(Value::Null).opcode().as_u8(),
            8
        );
    }
}
