//! Control-channel wire format
//!
//! Listeners in the wild send the same semantic message in several shapes
//! (flat, wrapped once or twice, batched, or bare SDP text). [`normalize`]
//! maps every accepted shape to one [`InboundMessage`] variant so the
//! endpoint only ever dispatches on canonical messages.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::audio::params::{MixSnapshot, MixUpdate};
use crate::error::SignalingError;
use crate::transport::IceCandidate;

/// Keys a session description may be wrapped under
const DESCRIPTION_WRAPPERS: [&str; 6] = ["sdp", "description", "offer", "answer", "payload", "data"];

/// Maximum wrapping depth accepted around a session description
const MAX_WRAP_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Canonical inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Description { kind: SdpKind, sdp: String },
    Candidates(Vec<IceCandidate>),
    /// Client clock value to echo back
    Ping { t: Value },
    Bye,
    Mix(MixUpdate),
    /// Valid JSON in a shape we do not know; dropped
    Unrecognized,
}

impl InboundMessage {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            InboundMessage::Description { kind: SdpKind::Offer, .. } => "offer",
            InboundMessage::Description { kind: SdpKind::Answer, .. } => "answer",
            InboundMessage::Candidates(_) => "candidates",
            InboundMessage::Ping { .. } => "ping",
            InboundMessage::Bye => "bye",
            InboundMessage::Mix(_) => "mix",
            InboundMessage::Unrecognized => "unrecognized",
        }
    }
}

/// Server → listener messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Answer {
        sdp: String,
    },
    Ice {
        candidate: IceCandidate,
    },
    Pong {
        t: Value,
        ts: i64,
    },
    Mix {
        alpha: f32,
        #[serde(rename = "micMuted")]
        mic_muted: bool,
    },
    Ack {
        stage: String,
    },
    Error {
        message: String,
    },
    Bye,
}

impl OutboundMessage {
    pub fn ack(stage: &str) -> Self {
        OutboundMessage::Ack {
            stage: stage.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    pub fn mix(snapshot: MixSnapshot) -> Self {
        OutboundMessage::Mix {
            alpha: snapshot.alpha,
            mic_muted: snapshot.mic_muted,
        }
    }

    pub fn pong(t: Value) -> Self {
        OutboundMessage::Pong {
            t,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Structural sniff for an SDP document
pub fn looks_like_sdp(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with("v=0") && (text.contains("\nm=") || text.contains("\na="))
}

/// Parse one text frame into its canonical form.
///
/// Errors only for frames that are neither JSON nor SDP; everything that
/// parses but is not understood comes back as [`InboundMessage::Unrecognized`].
pub fn normalize(text: &str) -> Result<InboundMessage, SignalingError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SignalingError::Malformed("empty frame".into()));
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(obj)) => Ok(normalize_object(&obj)),
        Ok(Value::String(s)) if looks_like_sdp(&s) => Ok(InboundMessage::Description {
            kind: SdpKind::Offer,
            sdp: s,
        }),
        Ok(_) => Ok(InboundMessage::Unrecognized),
        Err(_) if looks_like_sdp(trimmed) => Ok(InboundMessage::Description {
            kind: SdpKind::Offer,
            sdp: trimmed.to_string(),
        }),
        Err(e) => Err(SignalingError::Malformed(e.to_string())),
    }
}

fn normalize_object(obj: &Map<String, Value>) -> InboundMessage {
    let ty = type_of(obj);

    match ty.as_deref() {
        Some("ping") => {
            return InboundMessage::Ping {
                t: obj.get("t").cloned().unwrap_or(Value::Null),
            }
        }
        Some("bye") => return InboundMessage::Bye,
        Some("mix") => {
            return InboundMessage::Mix(MixUpdate {
                alpha: obj.get("alpha").and_then(Value::as_f64).map(|a| a as f32),
                mic_muted: obj.get("micMuted").and_then(Value::as_bool),
            })
        }
        _ => {}
    }

    if obj.get("bye") == Some(&Value::Bool(true)) {
        return InboundMessage::Bye;
    }

    if let Some((kind, sdp)) = find_description(obj, 0) {
        return InboundMessage::Description { kind, sdp };
    }

    if let Some(Value::Array(items)) = obj.get("candidates") {
        return InboundMessage::Candidates(items.iter().filter_map(candidate_from).collect());
    }

    if let Some(ice) = obj.get("ice") {
        return InboundMessage::Candidates(candidate_from(ice).into_iter().collect());
    }

    if ty.as_deref() == Some("ice") || obj.contains_key("candidate") {
        let candidate = match obj.get("candidate") {
            Some(inner @ Value::Object(_)) => candidate_from(inner),
            _ => candidate_from_map(obj),
        };
        return InboundMessage::Candidates(candidate.into_iter().collect());
    }

    InboundMessage::Unrecognized
}

fn type_of(obj: &Map<String, Value>) -> Option<String> {
    obj.get("type")
        .and_then(Value::as_str)
        .map(|t| t.to_ascii_lowercase())
}

fn find_description(obj: &Map<String, Value>, depth: usize) -> Option<(SdpKind, String)> {
    let kind = match type_of(obj).as_deref() {
        Some("offer") => Some(SdpKind::Offer),
        Some("answer") => Some(SdpKind::Answer),
        _ => None,
    };

    match (kind, obj.get("sdp")) {
        (Some(kind), Some(Value::String(sdp))) if !sdp.trim().is_empty() => {
            return Some((kind, sdp.clone()))
        }
        (None, Some(Value::String(sdp))) if looks_like_sdp(sdp) => {
            return Some((SdpKind::Offer, sdp.clone()))
        }
        _ => {}
    }

    if depth >= MAX_WRAP_DEPTH {
        return None;
    }
    DESCRIPTION_WRAPPERS.iter().find_map(|key| match obj.get(*key) {
        Some(Value::Object(inner)) => find_description(inner, depth + 1),
        _ => None,
    })
}

fn candidate_from(value: &Value) -> Option<IceCandidate> {
    match value {
        Value::Object(map) => match map.get("candidate") {
            Some(inner @ Value::Object(_)) => candidate_from(inner),
            _ => candidate_from_map(map),
        },
        Value::String(line) if !line.trim().is_empty() => Some(IceCandidate {
            candidate: line.clone(),
            sdp_mid: None,
            sdp_mline_index: None,
        }),
        _ => None,
    }
}

fn candidate_from_map(map: &Map<String, Value>) -> Option<IceCandidate> {
    let line = map
        .get("candidate")
        .or_else(|| map.get("sdp"))
        .and_then(Value::as_str)?;
    if line.trim().is_empty() {
        return None;
    }
    Some(IceCandidate {
        candidate: line.to_string(),
        sdp_mid: map.get("sdpMid").and_then(Value::as_str).map(str::to_string),
        sdp_mline_index: map
            .get("sdpMLineIndex")
            .and_then(Value::as_u64)
            .and_then(|i| u16::try_from(i).ok()),
    })
}
