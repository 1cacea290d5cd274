//! Camera access – spawns `rpicam-vid` / `rpicam-still` as child processes.
//!
//! While recording, a `camera` thread reads raw YUV420p frames from
//! `rpicam-vid`, paints the status band, keeps the newest frame for stills
//! and pushes every frame into the frame sink in capture order.

use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use plantcam_common::config::Config;

use crate::error::PipelineError;
use crate::frame::{self, Rgb, BAND_ROWS};
use crate::sink::FrameOutput;

/// How long `stop_recording` waits for the camera thread.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Overlay shown on the live stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub text: String,
    pub color: Rgb,
}

/// A camera opened for one run.
pub trait Camera: Send {
    /// Begin delivering frames to `output` on a background thread.
    fn start_recording(&mut self, output: Arc<dyn FrameOutput>) -> Result<()>;

    /// Fails once the recording has stopped delivering frames.
    fn wait_recording(&mut self) -> Result<()>;

    /// Save a `size`×`size` JPEG still to `path`.
    fn capture_still(&mut self, path: &Path, size: u32) -> Result<()>;

    fn annotate(&mut self, annotation: Annotation);

    fn stop_recording(&mut self) -> Result<()>;
}

/// Opens cameras for the lifecycle controller.
pub trait CameraDriver: Send + Sync {
    fn open(&self, config: &Config) -> Result<Box<dyn Camera>, PipelineError>;
}

/// Raspberry Pi camera through the `rpicam-apps` command-line tools.
pub struct RpiCameraDriver;

impl CameraDriver for RpiCameraDriver {
    fn open(&self, config: &Config) -> Result<Box<dyn Camera>, PipelineError> {
        Ok(Box::new(RpiCamera::open(config)?))
    }
}

pub struct RpiCamera {
    width: u32,
    height: u32,
    framerate: u32,
    vflip: bool,
    hflip: bool,
    video_command: String,
    still_command: String,
    annotation: Arc<Mutex<Option<Annotation>>>,
    latest: Arc<Mutex<Option<Vec<u8>>>>,
    recording: Option<Recording>,
}

struct Recording {
    child: Child,
    stop: Arc<AtomicBool>,
    reader: JoinHandle<Result<u64>>,
}

impl RpiCamera {
    /// Probe for a camera and claim it for this run.
    pub fn open(config: &Config) -> Result<Self, PipelineError> {
        let output = Command::new(&config.camera_still_command)
            .arg("--list-cameras")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                PipelineError::CameraUnavailable(format!(
                    "cannot run {}: {e}",
                    config.camera_still_command
                ))
            })?;

        let listing = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() || listing.contains("No cameras available") {
            return Err(PipelineError::CameraUnavailable(
                listing.lines().last().unwrap_or("no camera detected").to_string(),
            ));
        }
        info!(
            "Camera ready ({}x{} @ {} fps, vflip={}, hflip={})",
            config.width, config.height, config.framerate, config.vflip, config.hflip
        );

        Ok(Self {
            width: config.width,
            height: config.height,
            framerate: config.framerate,
            vflip: config.vflip,
            hflip: config.hflip,
            video_command: config.camera_video_command.clone(),
            still_command: config.camera_still_command.clone(),
            annotation: Arc::new(Mutex::new(None)),
            latest: Arc::new(Mutex::new(None)),
            recording: None,
        })
    }

    fn orientation_args(&self) -> Vec<&'static str> {
        let mut args = Vec::new();
        if self.vflip {
            args.push("--vflip");
        }
        if self.hflip {
            args.push("--hflip");
        }
        args
    }
}

impl Camera for RpiCamera {
    fn start_recording(&mut self, output: Arc<dyn FrameOutput>) -> Result<()> {
        if self.recording.is_some() {
            bail!("Camera is already recording");
        }

        let mut cmd = Command::new(&self.video_command);
        cmd.args(["-n", "-t", "0", "--codec", "yuv420"])
            .args(["--width", &self.width.to_string()])
            .args(["--height", &self.height.to_string()])
            .args(["--framerate", &self.framerate.to_string()])
            .args(self.orientation_args())
            .args(["-o", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.video_command))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{} has no stdout", self.video_command);
        };
        info!("{} started (pid={})", self.video_command, child.id());

        let stop = Arc::new(AtomicBool::new(false));
        let pump = FramePump {
            width: self.width,
            height: self.height,
            output,
            annotation: self.annotation.clone(),
            latest: self.latest.clone(),
            stop: stop.clone(),
        };
        let reader = std::thread::Builder::new()
            .name("camera".into())
            .spawn(move || pump.run(stdout))
            .context("Cannot spawn camera thread")?;

        self.recording = Some(Recording { child, stop, reader });
        Ok(())
    }

    fn wait_recording(&mut self) -> Result<()> {
        let finished = self
            .recording
            .as_ref()
            .is_some_and(|rec| rec.reader.is_finished());
        if !finished {
            return Ok(());
        }
        if let Some(mut rec) = self.recording.take() {
            let _ = rec.child.kill();
            let _ = rec.child.wait();
            return match rec.reader.join() {
                Ok(Ok(frames)) => bail!("Camera stopped after {frames} frames"),
                Ok(Err(e)) => Err(e.context("Camera recording failed")),
                Err(_) => bail!("Camera thread panicked"),
            };
        }
        Ok(())
    }

    fn capture_still(&mut self, path: &Path, size: u32) -> Result<()> {
        let latest = self
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        if let (Some(frame), true) = (latest, self.recording.is_some()) {
            let rgb = frame::yuv420_to_rgb(&frame, self.width, self.height)?;
            let still =
                image::imageops::resize(&rgb, size, size, image::imageops::FilterType::Triangle);
            still
                .save(path)
                .with_context(|| format!("Cannot save still {}", path.display()))?;
            return Ok(());
        }

        let status = Command::new(&self.still_command)
            .args(["-n", "-t", "1000"])
            .args(["--width", &size.to_string()])
            .args(["--height", &size.to_string()])
            .args(self.orientation_args())
            .arg("-o")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("Failed to run {}", self.still_command))?;
        if !status.success() {
            bail!("{} exited with {status}", self.still_command);
        }
        Ok(())
    }

    fn annotate(&mut self, annotation: Annotation) {
        debug!("Annotation: {}", annotation.text);
        *self.annotation.lock().unwrap_or_else(|e| e.into_inner()) = Some(annotation);
    }

    fn stop_recording(&mut self) -> Result<()> {
        let Some(mut rec) = self.recording.take() else {
            return Ok(());
        };
        info!("Stopping camera recording");
        rec.stop.store(true, Ordering::Relaxed);
        if let Err(e) = rec.child.kill() {
            debug!("Camera process already gone: {e}");
        }
        let _ = rec.child.wait();

        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !rec.reader.is_finished() {
            if Instant::now() >= deadline {
                // Stuck writing into a stalled transcoder; flushing the
                // sink kills it and releases the thread.
                bail!("Camera thread still busy after {JOIN_TIMEOUT:?}, detaching it");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        match rec.reader.join() {
            Ok(Ok(frames)) => {
                info!("Camera delivered {frames} frames");
                Ok(())
            }
            Ok(Err(e)) => Err(e.context("Camera recording failed")),
            Err(_) => bail!("Camera thread panicked"),
        }
    }
}

impl Drop for RpiCamera {
    fn drop(&mut self) {
        if let Err(e) = self.stop_recording() {
            warn!("Closing camera: {e:#}");
        }
    }
}

/// Moves frames from the camera process to the frame sink.
pub(crate) struct FramePump {
    pub width: u32,
    pub height: u32,
    pub output: Arc<dyn FrameOutput>,
    pub annotation: Arc<Mutex<Option<Annotation>>>,
    pub latest: Arc<Mutex<Option<Vec<u8>>>>,
    pub stop: Arc<AtomicBool>,
}

impl FramePump {
    /// Returns the number of frames delivered.
    pub fn run<R: Read>(self, mut source: R) -> Result<u64> {
        let frame_len = {
            let luma = self.width as usize * self.height as usize;
            luma + luma / 2
        };
        let mut buf = vec![0u8; frame_len];
        let mut frames = 0u64;

        loop {
            if let Err(e) = source.read_exact(&mut buf) {
                if self.stop.load(Ordering::Relaxed) {
                    return Ok(frames);
                }
                if e.kind() == ErrorKind::UnexpectedEof {
                    bail!("Camera stream ended after {frames} frames");
                }
                return Err(e).context("Cannot read camera stream");
            }

            let color = self
                .annotation
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map(|a| a.color);
            if let Some(color) = color {
                frame::paint_band(&mut buf, self.width, self.height, color, BAND_ROWS);
            }

            if let Err(e) = self.output.write_frame(&buf) {
                if self.stop.load(Ordering::Relaxed) {
                    return Ok(frames);
                }
                return Err(e).context("Cannot hand frame to transcoder");
            }
            frames += 1;

            let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
            match latest.as_mut() {
                Some(prev) => prev.copy_from_slice(&buf),
                None => *latest = Some(buf.clone()),
            }
        }
    }
}
