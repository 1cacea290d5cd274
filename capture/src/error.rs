//! Error types at the pipeline seams.

use std::path::PathBuf;
use std::time::Duration;

use plantcam_common::protocol::RunMode;

/// Failures raised by the video pipeline components.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("missing resource file {}", .0.display())]
    MissingAsset(PathBuf),

    #[error("cannot spawn transcoder `{program}`: {source}")]
    TranscoderSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder did not exit within {0:?} and was killed")]
    TranscoderTimeout(Duration),

    #[error("frame sink is closed")]
    SinkClosed,

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Rejections issued by the supervisor, which allows one run at a time.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("a {0} run is already active")]
    AlreadyRunning(RunMode),

    #[error("water monitoring is active and already checks the soil")]
    WaterMonitorActive,

    #[error("no run is active")]
    NotRunning,

    #[error("cannot start pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
}
