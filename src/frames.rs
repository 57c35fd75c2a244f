//! # Wire Protocol Frames
//!
//! This module defines all frame types exchanged between mesh peers and the
//! JSON codec for them. Frames are UTF-8 encoded JSON objects dispatched on
//! their `type` field; anything that is not a recognized control frame is
//! treated as an application frame and routed by message id.
//!
//! ## Frame Types
//!
//! | `type` | Frame | Purpose |
//! |--------|-------|---------|
//! | `ping` | [`Ping`] | Keepalive probe |
//! | `pong` | [`Pong`] | Keepalive reply, echoes the probe timestamp |
//! | `meshAnnouncement` | [`MeshAnnouncement`] | Topology gossip |
//! | `messageAck` | [`MessageAck`] | Per-hop delivery acknowledgement |
//! | anything else | [`AppFrame`] | Application payload, relayed hop by hop |
//!
//! ## Size Limits
//!
//! All parsing is bounded by [`MAX_FRAME_SIZE`]. Oversized or malformed
//! frames are rejected with [`FrameError`] and dropped by the caller; they
//! never abort the dispatch loop.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Maximum size of a single wire frame (64 KiB).
/// Prevents memory exhaustion from oversized payloads.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Milliseconds since the Unix epoch, for wire timestamps.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Opaque stable identifier for a device in the mesh.
///
/// Device ids are assigned by the transport-bootstrap layer and are unique
/// keys for peers and topology nodes. The engine never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for an application message.
///
/// Generated once at submission (or first relay) and carried on the wire so
/// every node can deduplicate regardless of which path delivered the frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh message id: originating device plus a random nonce.
    pub fn generate(origin: &DeviceId) -> Self {
        let nonce: [u8; 8] = rand::random();
        Self(format!("{}-{}", origin, hex::encode(nonce)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Keepalive probe carrying the sender's epoch-ms clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub timestamp: u64,
}

/// Keepalive reply. `original_timestamp` echoes the probe it answers;
/// `timestamp` is the responder's clock at reply time. RTT is derived from
/// the two embedded values, never from receipt wall-clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub original_timestamp: u64,
    pub timestamp: u64,
}

/// Periodic topology gossip: who the sender is, how connected it is, and
/// which peers it reports being linked to.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshAnnouncement {
    pub device_id: DeviceId,
    pub timestamp: u64,
    pub connection_count: usize,
    pub network_strength: f64,
    pub connected_peers: Vec<DeviceId>,
}

/// Per-hop acknowledgement for an application frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAck {
    pub message_id: MessageId,
    pub timestamp: u64,
}

/// An application frame: opaque payload fields plus the routing metadata the
/// engine inspects (`messageId` and `_path`). Everything else in `body` is
/// carried untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct AppFrame {
    pub message_id: MessageId,
    pub path: Vec<DeviceId>,
    pub body: Map<String, Value>,
}

impl AppFrame {
    /// Reassemble the full wire object, routing metadata included.
    pub fn to_value(&self) -> Value {
        let mut obj = self.body.clone();
        obj.insert("messageId".to_string(), json!(self.message_id));
        obj.insert("_path".to_string(), json!(self.path));
        Value::Object(obj)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_value()).unwrap_or_default()
    }

    /// The frame with the local device appended to its traversal path,
    /// ready to forward to the next hop.
    pub fn forwarded_via(&self, local: &DeviceId) -> AppFrame {
        let mut next = self.clone();
        if !next.path.contains(local) {
            next.path.push(local.clone());
        }
        next
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping(Ping),
    Pong(Pong),
    Announcement(MeshAnnouncement),
    Ack(MessageAck),
    Application(AppFrame),
}

impl Frame {
    /// Parse and classify a raw frame.
    ///
    /// Rejects oversized buffers, non-object JSON, and control frames with
    /// missing or mistyped required fields. Unknown `type` values fall
    /// through to [`Frame::Application`] provided a `messageId` is present.
    pub fn parse(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(bytes.len()));
        }
        let value: Value = serde_json::from_slice(bytes).map_err(FrameError::Json)?;
        let obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(FrameError::NotObject),
        };

        match obj.get("type").and_then(Value::as_str) {
            Some("ping") => Ok(Frame::Ping(Ping {
                timestamp: u64_field(&obj, "timestamp")?,
            })),
            Some("pong") => Ok(Frame::Pong(Pong {
                original_timestamp: u64_field(&obj, "originalTimestamp")?,
                timestamp: u64_field(&obj, "timestamp")?,
            })),
            Some("meshAnnouncement") => Ok(Frame::Announcement(MeshAnnouncement {
                device_id: str_field(&obj, "deviceId")?.into(),
                timestamp: u64_field(&obj, "timestamp")?,
                connection_count: u64_field(&obj, "connectionCount")? as usize,
                network_strength: f64_field(&obj, "networkStrength")?,
                connected_peers: id_list_field(&obj, "connectedPeers")?,
            })),
            Some("messageAck") => Ok(Frame::Ack(MessageAck {
                message_id: str_field(&obj, "messageId")?.into(),
                timestamp: obj
                    .get("timestamp")
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
            })),
            _ => {
                let message_id: MessageId = str_field(&obj, "messageId")?.into();
                let path = match obj.get("_path") {
                    Some(v) => id_list(v, "_path")?,
                    None => Vec::new(),
                };
                let mut body = obj;
                body.remove("messageId");
                body.remove("_path");
                Ok(Frame::Application(AppFrame {
                    message_id,
                    path,
                    body,
                }))
            }
        }
    }

    /// Encode for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let value = match self {
            Frame::Ping(p) => json!({ "type": "ping", "timestamp": p.timestamp }),
            Frame::Pong(p) => json!({
                "type": "pong",
                "originalTimestamp": p.original_timestamp,
                "timestamp": p.timestamp,
            }),
            Frame::Announcement(a) => json!({
                "type": "meshAnnouncement",
                "deviceId": a.device_id,
                "timestamp": a.timestamp,
                "connectionCount": a.connection_count,
                "networkStrength": a.network_strength,
                "connectedPeers": a.connected_peers,
            }),
            Frame::Ack(a) => json!({
                "type": "messageAck",
                "messageId": a.message_id,
                "timestamp": a.timestamp,
            }),
            Frame::Application(f) => f.to_value(),
        };
        serde_json::to_vec(&value).unwrap_or_default()
    }
}

fn u64_field(obj: &Map<String, Value>, key: &'static str) -> Result<u64, FrameError> {
    obj.get(key)
        .and_then(Value::as_u64)
        .ok_or(FrameError::MissingField(key))
}

fn f64_field(obj: &Map<String, Value>, key: &'static str) -> Result<f64, FrameError> {
    obj.get(key)
        .and_then(Value::as_f64)
        .ok_or(FrameError::MissingField(key))
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, FrameError> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingField(key))
}

fn id_list_field(obj: &Map<String, Value>, key: &'static str) -> Result<Vec<DeviceId>, FrameError> {
    match obj.get(key) {
        Some(v) => id_list(v, key),
        None => Err(FrameError::MissingField(key)),
    }
}

fn id_list(value: &Value, key: &'static str) -> Result<Vec<DeviceId>, FrameError> {
    let items = value.as_array().ok_or(FrameError::MissingField(key))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(DeviceId::from)
                .ok_or(FrameError::MissingField(key))
        })
        .collect()
}

/// Why a frame failed to parse. Malformed frames are dropped at the point of
/// receipt and converted into a debug log line, never propagated.
#[derive(Debug)]
pub enum FrameError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    TooLarge(usize),
    /// Top-level JSON value is not an object.
    NotObject,
    /// A required field is absent or has the wrong type.
    MissingField(&'static str),
    /// Not valid JSON at all.
    Json(serde_json::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge(len) => write!(f, "frame size {} exceeds {} bytes", len, MAX_FRAME_SIZE),
            Self::NotObject => write!(f, "frame is not a JSON object"),
            Self::MissingField(field) => write!(f, "frame missing required field `{}`", field),
            Self::Json(e) => write!(f, "frame is not valid JSON: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}
