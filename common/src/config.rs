//! Configuration parsing – reads a KEY=VALUE file (`plantcam.conf`).
//!
//! The same file drives the camera, the transcoder arguments, the page
//! template and the viewer handshake, so the dimensions used everywhere
//! come from one place.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

/// Application configuration. Immutable for the lifetime of one run.
#[derive(Debug, Clone)]
pub struct Config {
    // ── video ────────────────────────────────────────────────────────
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub vflip: bool,
    pub hflip: bool,

    // ── network ──────────────────────────────────────────────────────
    pub bind_addr: String,
    pub http_port: u16,
    pub ws_port: u16,
    /// Address the control API listens on.
    pub control_listen_addr: String,

    // ── page / overlay colors ────────────────────────────────────────
    pub color: String,
    pub bgcolor: String,
    pub annotate_alert_color: String,
    pub annotate_ok_color: String,

    // ── scoring ──────────────────────────────────────────────────────
    pub score_threshold_under: f64,
    pub score_threshold_upper: f64,
    pub check_interval_secs: f64,
    pub scorer_command: Option<String>,

    // ── files ────────────────────────────────────────────────────────
    pub picture_dir: PathBuf,
    pub still_size: u32,
    pub assets_dir: PathBuf,

    // ── transcoder / relay ───────────────────────────────────────────
    pub transcoder: String,
    pub transcoder_bitrate: String,
    pub transcoder_grace_secs: f64,
    pub chunk_size: usize,
    pub viewer_queue_depth: usize,

    // ── camera programs ──────────────────────────────────────────────
    pub camera_video_command: String,
    pub camera_still_command: String,

    // ── notifications ────────────────────────────────────────────────
    pub slack_token: Option<String>,
    pub slack_channel: Option<String>,
    pub water_comment: String,
    pub not_water_comment: String,
    pub look_comment: String,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/plantcam/plantcam.conf"
    }

    /// Size in bytes of one raw YUV420p frame.
    pub fn frame_len(&self) -> usize {
        let pixels = self.width as usize * self.height as usize;
        pixels + pixels / 2
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.http_port)
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.ws_port)
    }

    /// Bounded wait for the transcoder to exit once its input is closed.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.transcoder_grace_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    /// Reject combinations the pipeline cannot run with.
    ///
    /// The handshake carries 16-bit dimensions and YUV420p needs even
    /// sizes, so anything else would desynchronise the player from the
    /// transcoder.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            bail!("WIDTH and HEIGHT must be non-zero");
        }
        if self.width > u16::MAX as u32 || self.height > u16::MAX as u32 {
            bail!(
                "Resolution {}x{} does not fit the viewer handshake",
                self.width,
                self.height
            );
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            bail!(
                "Resolution {}x{} must be even for yuv420p",
                self.width,
                self.height
            );
        }
        if self.framerate == 0 {
            bail!("FRAMERATE must be non-zero");
        }
        if self.score_threshold_under >= self.score_threshold_upper {
            bail!(
                "SCORE_THRESHOLD_UNDER ({}) must be below SCORE_THRESHOLD_UPPER ({})",
                self.score_threshold_under,
                self.score_threshold_upper
            );
        }
        if self.chunk_size == 0 || self.viewer_queue_depth == 0 {
            bail!("CHUNK_SIZE and VIEWER_QUEUE_DEPTH must be non-zero");
        }
        if !(self.transcoder_grace_secs > 0.0) || !(self.check_interval_secs >= 0.0) {
            bail!("TRANSCODER_GRACE_SECS must be positive and CHECK_INTERVAL_SECS non-negative");
        }
        self.control_listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Bad CONTROL_LISTEN_ADDR: {}", self.control_listen_addr))?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse and validate a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_map(&parse_conf(&text));
    config
        .validate()
        .with_context(|| format!("Invalid config: {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_str = |key: &str, default: &str| -> String {
        get(key).filter(|s| !s.is_empty()).unwrap_or_else(|| default.to_string())
    };
    let get_opt = |key: &str| -> Option<String> { get(key).filter(|s| !s.is_empty()) };
    let get_f64 = |key: &str, default: f64| -> f64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u16 = |key: &str, default: u16| -> u16 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_usize = |key: &str, default: usize| -> usize {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_bool = |key: &str| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    };

    Config {
        width: get_u32("WIDTH", 640),
        height: get_u32("HEIGHT", 480),
        framerate: get_u32("FRAMERATE", 24),
        vflip: get_bool("VFLIP"),
        hflip: get_bool("HFLIP"),

        bind_addr: get_str("BIND_ADDR", "0.0.0.0"),
        http_port: get_u16("HTTP_PORT", 8082),
        ws_port: get_u16("WS_PORT", 8084),
        control_listen_addr: get_str("CONTROL_LISTEN_ADDR", "127.0.0.1:8086"),

        color: get_str("COLOR", "#444"),
        bgcolor: get_str("BGCOLOR", "#333"),
        annotate_alert_color: get_str("ANNOTATE_ALERT_COLOR", "#ff0000"),
        annotate_ok_color: get_str("ANNOTATE_OK_COLOR", "#00ff00"),

        score_threshold_under: get_f64("SCORE_THRESHOLD_UNDER", 6.0),
        score_threshold_upper: get_f64("SCORE_THRESHOLD_UPPER", 10.0),
        check_interval_secs: get_f64("CHECK_INTERVAL_SECS", 2.0),
        scorer_command: get_opt("SCORER_COMMAND"),

        picture_dir: PathBuf::from(get_str("PICTURE_DIR", "/var/lib/plantcam/pictures")),
        still_size: get_u32("STILL_SIZE", 480),
        assets_dir: PathBuf::from(get_str("ASSETS_DIR", "/usr/share/plantcam")),

        transcoder: get_str("TRANSCODER", "ffmpeg"),
        transcoder_bitrate: get_str("TRANSCODER_BITRATE", "800k"),
        transcoder_grace_secs: get_f64("TRANSCODER_GRACE_SECS", 5.0),
        chunk_size: get_usize("CHUNK_SIZE", 32768),
        viewer_queue_depth: get_usize("VIEWER_QUEUE_DEPTH", 64),

        camera_video_command: get_str("CAMERA_VIDEO_COMMAND", "rpicam-vid"),
        camera_still_command: get_str("CAMERA_STILL_COMMAND", "rpicam-still"),

        slack_token: get_opt("SLACK_TOKEN"),
        slack_channel: get_opt("SLACK_CHANNEL"),
        water_comment: get_str(
            "WATER_COMMENT",
            "The soil is dry. The plant needs watering.",
        ),
        not_water_comment: get_str(
            "NOT_WATER_COMMENT",
            "The soil is still moist. No watering needed.",
        ),
        look_comment: get_str("LOOK_COMMENT", "This is how the plant looks right now."),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
pub fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
