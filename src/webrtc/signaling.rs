//! Signaling wire protocol
//!
//! Text frames over a WebSocket:
//!
//! | direction | frame |
//! |-----------|-------|
//! | client → server | `HELLO <id>` |
//! | server → client | `HELLO` |
//! | client → server | `SESSION <peer_id>` |
//! | server → client | `SESSION_OK` or `ERROR <reason>` |
//! | client → server | `{"sdp": {"type": "offer", "sdp": "..."}}` |
//! | server → client | `{"sdp": {"type": "answer", "sdp": "..."}}` |
//! | both | `{"ice": {"candidate": "...", "sdpMLineIndex": 0}}` |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// SDP kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP payload inside an `{"sdp": ...}` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// ICE candidate inside an `{"ice": ...}` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mline_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum JsonFrame {
    Sdp { sdp: SessionDescription },
    Ice { ice: IceCandidate },
}

/// Frames we send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Hello(u32),
    Session(String),
    Offer(String),
    Ice(IceCandidate),
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String> {
        let text = match self {
            ClientMessage::Hello(id) => format!("HELLO {}", id),
            ClientMessage::Session(peer) => format!("SESSION {}", peer),
            ClientMessage::Offer(sdp) => serde_json::to_string(&JsonFrame::Sdp {
                sdp: SessionDescription {
                    kind: SdpType::Offer,
                    sdp: sdp.clone(),
                },
            })?,
            ClientMessage::Ice(candidate) => serde_json::to_string(&JsonFrame::Ice {
                ice: candidate.clone(),
            })?,
        };
        Ok(text)
    }
}

/// Frames we accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Hello,
    SessionOk,
    Error(String),
    Answer(String),
    Ice(IceCandidate),
}

impl ServerMessage {
    /// Parse a text frame; anything unexpected is a protocol violation
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        match trimmed {
            "HELLO" => return Ok(ServerMessage::Hello),
            "SESSION_OK" => return Ok(ServerMessage::SessionOk),
            "ERROR" => return Ok(ServerMessage::Error(String::new())),
            _ => {}
        }
        if let Some(reason) = trimmed.strip_prefix("ERROR ") {
            return Ok(ServerMessage::Error(reason.trim().to_string()));
        }
        if !trimmed.starts_with('{') {
            return Err(AppError::ProtocolViolation(format!(
                "unexpected frame '{}'",
                truncate(trimmed, 64)
            )));
        }

        let frame: JsonFrame = serde_json::from_str(trimmed).map_err(|e| {
            AppError::ProtocolViolation(format!("malformed JSON frame: {}", e))
        })?;
        match frame {
            JsonFrame::Sdp { sdp } if sdp.kind == SdpType::Answer => Ok(ServerMessage::Answer(sdp.sdp)),
            JsonFrame::Sdp { sdp } => Err(AppError::ProtocolViolation(format!(
                "expected an SDP answer, got {:?}",
                sdp.kind
            ))),
            JsonFrame::Ice { ice } => Ok(ServerMessage::Ice(ice)),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Signaling client state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Negotiating,
    Connected,
    Error,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingState::Disconnected => write!(f, "disconnected"),
            SignalingState::Connecting => write!(f, "connecting"),
            SignalingState::Negotiating => write!(f, "negotiating"),
            SignalingState::Connected => write!(f, "connected"),
            SignalingState::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames() {
        assert_eq!(ClientMessage::Hello(105).to_text().unwrap(), "HELLO 105");
        assert_eq!(ClientMessage::Session("7".into()).to_text().unwrap(), "SESSION 7");

        let offer = ClientMessage::Offer("v=0\r\n".into()).to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&offer).unwrap();
        assert_eq!(value["sdp"]["type"], "offer");
        assert_eq!(value["sdp"]["sdp"], "v=0\r\n");

        let ice = ClientMessage::Ice(IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 5000 typ host", 0))
            .to_text()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&ice).unwrap();
        assert_eq!(value["ice"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_server_frames() {
        assert_eq!(ServerMessage::parse("HELLO").unwrap(), ServerMessage::Hello);
        assert_eq!(ServerMessage::parse("SESSION_OK\n").unwrap(), ServerMessage::SessionOk);
        assert_eq!(
            ServerMessage::parse("ERROR peer 7 not found").unwrap(),
            ServerMessage::Error("peer 7 not found".into())
        );
        assert_eq!(ServerMessage::parse("ERROR").unwrap(), ServerMessage::Error(String::new()));
        assert_eq!(
            ServerMessage::parse(r#"{"sdp": {"type": "answer", "sdp": "v=0"}}"#).unwrap(),
            ServerMessage::Answer("v=0".into())
        );
        assert_eq!(
            ServerMessage::parse(r#"{"ice": {"candidate": "c", "sdpMLineIndex": 1}}"#).unwrap(),
            ServerMessage::Ice(IceCandidate::new("c", 1))
        );
    }

    #[test]
    fn test_protocol_violations() {
        for frame in [
            "GOODBYE",
            "ERRORFOO",
            "ERROR_peer",
            r#"{"sdp": {"type": "offer", "sdp": "v=0"}}"#,
            r#"{"unknown": 1}"#,
            "{ broken",
        ] {
            let err = ServerMessage::parse(frame).unwrap_err();
            assert!(matches!(err, AppError::ProtocolViolation(_)), "{}", frame);
        }
    }
}
