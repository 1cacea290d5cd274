//! Wire types shared by the appliance and its clients: the binary viewer
//! handshake sent on every WebSocket connection, and the JSON bodies of the
//! control API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── viewer handshake ─────────────────────────────────────────────────────

/// Fixed 8-byte record sent once per viewer before any video chunk.
///
/// Layout: 4-byte ASCII magic, big-endian `u16` width, big-endian `u16`
/// height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub width: u16,
    pub height: u16,
}

impl Handshake {
    pub const MAGIC: [u8; 4] = *b"jsmp";
    pub const LEN: usize = 8;

    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(&Self::MAGIC);
        out[4..6].copy_from_slice(&self.width.to_be_bytes());
        out[6..8].copy_from_slice(&self.height.to_be_bytes());
        out
    }

    /// Returns `None` unless `buf` is exactly one record with the right magic.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::LEN || buf[..4] != Self::MAGIC {
            return None;
        }
        Some(Self {
            width: u16::from_be_bytes([buf[4], buf[5]]),
            height: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }
}

// ── control API ──────────────────────────────────────────────────────────

/// What a run does with each captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Stream and score; notify only on explicit intents.
    Continuous,
    /// Stream and score; notify whenever watering is needed.
    AutoNotify,
    /// One still, one score, no streaming.
    Single,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::AutoNotify => "auto-notify",
            Self::Single => "single",
        }
    }

    /// Whether the run opens the video pipeline.
    pub fn streams(&self) -> bool {
        !matches!(self, Self::Single)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown run mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for RunMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continuous" => Ok(Self::Continuous),
            "auto-notify" => Ok(Self::AutoNotify),
            "single" => Ok(Self::Single),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

/// Lifecycle controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    CameraOpen,
    ServersStarted,
    Recording,
    Stopping,
}

impl Phase {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::CameraOpen,
            2 => Self::ServersStarted,
            3 => Self::Recording,
            4 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

/// `GET /api/status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub phase: Phase,
    /// Mode of the active run, if any.
    pub mode: Option<RunMode>,
    pub running: bool,
    pub water_intent: bool,
    pub look_intent: bool,
    /// Latest smoothed score.
    pub last_score: Option<f64>,
    pub viewers: usize,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// `PUT /api/intent/{name}` body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntentRequest {
    pub enabled: bool,
}

/// Generic reply for control operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    pub message: String,
}

impl ControlReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}
