//! Lifecycle controller – one run of the capture pipeline.
//!
//! ```text
//! Idle → CameraOpen → ServersStarted → Recording → Stopping → Idle
//! ```
//!
//! Start-up failures abort the run before any background work starts.
//! Once recording, the loop ends when the `running` flag is cleared, the
//! relay reports the end of the transcoder stream or the camera stops
//! delivering frames.  Every teardown step runs even if an earlier one
//! failed.
//!
//! `run` blocks and must be called from a plain thread, not from inside
//! the tokio runtime whose handle the pipeline holds.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use plantcam_common::config::Config;
use plantcam_common::protocol::{Handshake, Phase, RunMode};

use crate::camera::{Annotation, Camera, CameraDriver};
use crate::error::PipelineError;
use crate::frame::Rgb;
use crate::notify::NotifyHandle;
use crate::pages::{self, PageAssets};
use crate::relay::{self, RelayStats};
use crate::scoring::{ScoreWindow, Scorer, Thresholds};
use crate::sink::{FrameOutput, FrameSink, TranscoderCommand};
use crate::state::{PhaseCell, RunState};
use crate::viewers::{self, SocketState, ViewerRegistry};

/// Granularity of the pause between checks.
const PAUSE_SLICE: Duration = Duration::from_millis(100);
/// How long teardown waits for server tasks and viewer sessions.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything started in `CameraOpen → ServersStarted`, torn down in
/// reverse order.
struct Started {
    sink: Arc<FrameSink>,
    relay: JoinHandle<RelayStats>,
    relay_done: CancellationToken,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

pub struct Pipeline {
    config: Config,
    state: Arc<RunState>,
    phase: PhaseCell,
    registry: Arc<ViewerRegistry>,
    runtime: Handle,
    transcoder: TranscoderCommand,
    thresholds: Thresholds,
    alert_color: Rgb,
    ok_color: Rgb,
}

impl Pipeline {
    pub fn new(config: Config, runtime: Handle) -> Self {
        let color = |value: &str, fallback: Rgb| {
            Rgb::parse_hex(value).unwrap_or_else(|e| {
                warn!("Bad annotation color {value}: {e:#}");
                fallback
            })
        };
        Self {
            state: Arc::new(RunState::new()),
            phase: PhaseCell::default(),
            registry: ViewerRegistry::new(config.viewer_queue_depth),
            runtime,
            transcoder: TranscoderCommand::mpeg1(&config),
            thresholds: Thresholds::from_config(&config),
            alert_color: color(&config.annotate_alert_color, Rgb(255, 0, 0)),
            ok_color: color(&config.annotate_ok_color, Rgb(0, 255, 0)),
            config,
        }
    }

    /// Replace the transcoder launched for streaming runs.
    #[cfg(test)]
    pub fn with_transcoder(mut self, transcoder: TranscoderCommand) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub fn viewers(&self) -> usize {
        self.registry.len()
    }

    /// Execute one run in `mode` and return once the pipeline is idle again.
    pub fn run(
        &self,
        mode: RunMode,
        driver: &dyn CameraDriver,
        scorer: &mut dyn Scorer,
        notify: &NotifyHandle,
    ) -> Result<(), PipelineError> {
        info!("Starting {mode} run");
        let result = if mode.streams() {
            self.run_streaming(mode, driver, scorer, notify)
        } else {
            self.run_single(driver, scorer, notify)
        };
        self.state.set_running(false);
        if !mode.streams() {
            // A single check gets one chance at the requests that started it.
            let water = self.state.take_water();
            let look = self.state.take_look();
            if water || look {
                warn!("Single check ended without answering (water: {water}, look: {look})");
            }
        }
        self.phase.set(Phase::Idle);
        match &result {
            Ok(()) => info!("{mode} run finished"),
            Err(e) => error!("{mode} run failed: {e}"),
        }
        result
    }

    fn run_single(
        &self,
        driver: &dyn CameraDriver,
        scorer: &mut dyn Scorer,
        notify: &NotifyHandle,
    ) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.config.picture_dir)?;
        self.phase.set(Phase::CameraOpen);
        let mut camera = driver.open(&self.config)?;

        self.phase.set(Phase::Recording);
        let mut window = ScoreWindow::new();
        let checked =
            self.check_once(RunMode::Single, camera.as_mut(), scorer, &mut window, notify);
        if let Err(e) = checked {
            warn!("Single check failed: {e:#}");
        }

        self.phase.set(Phase::Stopping);
        if let Err(e) = camera.stop_recording() {
            warn!("Closing camera: {e:#}");
        }
        Ok(())
    }

    fn run_streaming(
        &self,
        mode: RunMode,
        driver: &dyn CameraDriver,
        scorer: &mut dyn Scorer,
        notify: &NotifyHandle,
    ) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.config.picture_dir)?;

        // ── Idle → CameraOpen ────────────────────────────────────────
        self.phase.set(Phase::CameraOpen);
        let mut camera = driver.open(&self.config)?;

        // ── CameraOpen → ServersStarted ──────────────────────────────
        let started = self.start_servers()?;
        self.phase.set(Phase::ServersStarted);

        // ── ServersStarted → Recording ───────────────────────────────
        let output: Arc<dyn FrameOutput> = started.sink.clone();
        let result = match camera.start_recording(output) {
            Ok(()) => {
                self.phase.set(Phase::Recording);
                self.record(mode, camera.as_mut(), scorer, notify, &started.relay_done);
                Ok(())
            }
            Err(e) => Err(PipelineError::CameraUnavailable(format!("{e:#}"))),
        };

        // ── Recording → Stopping → Idle ──────────────────────────────
        self.phase.set(Phase::Stopping);
        self.teardown(camera.as_mut(), started);
        result
    }

    /// Load resources, bind both listeners, spawn the transcoder and the
    /// relay, then hand the servers to the runtime.
    fn start_servers(&self) -> Result<Started, PipelineError> {
        let assets = PageAssets::load(&self.config.assets_dir)?;
        let page_listener = self.bind(self.config.http_addr())?;
        let socket_listener = self.bind(self.config.ws_addr())?;

        let (sink, stdout) = FrameSink::spawn(&self.transcoder, self.config.grace_period())?;
        let sink = Arc::new(sink);

        let relay_done = CancellationToken::new();
        let relay = relay::spawn(
            stdout,
            self.registry.clone(),
            self.config.chunk_size,
            relay_done.clone(),
        )?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let app = pages::router(&assets, &self.config);
        let token = shutdown.clone();
        tracker.spawn_on(
            async move {
                if let Err(e) = pages::serve(page_listener, app, token).await {
                    error!("Page server error: {e:#}");
                }
            },
            &self.runtime,
        );

        let socket_state = SocketState {
            registry: self.registry.clone(),
            handshake: Handshake::new(
                u16::try_from(self.config.width).unwrap_or(u16::MAX),
                u16::try_from(self.config.height).unwrap_or(u16::MAX),
            ),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };
        tracker.spawn_on(
            async move {
                if let Err(e) = viewers::serve(socket_listener, socket_state).await {
                    error!("Socket server error: {e:#}");
                }
            },
            &self.runtime,
        );

        Ok(Started {
            sink,
            relay,
            relay_done,
            shutdown,
            tracker,
        })
    }

    fn bind(&self, addr: String) -> Result<TcpListener, PipelineError> {
        self.runtime
            .block_on(TcpListener::bind(&addr))
            .map_err(|source| PipelineError::Bind { addr, source })
    }

    fn record(
        &self,
        mode: RunMode,
        camera: &mut dyn Camera,
        scorer: &mut dyn Scorer,
        notify: &NotifyHandle,
        relay_done: &CancellationToken,
    ) {
        let mut window = ScoreWindow::new();
        loop {
            if !self.state.is_running() {
                info!("Stop requested");
                break;
            }
            if relay_done.is_cancelled() {
                warn!("Transcoder stream ended, shutting the run down");
                break;
            }
            if let Err(e) = camera.wait_recording() {
                error!("{e:#}, shutting the run down");
                break;
            }
            if !self.pause(relay_done) {
                continue;
            }
            if let Err(e) = self.check_once(mode, camera, scorer, &mut window, notify) {
                warn!("Check failed: {e:#}");
            }
        }
    }

    /// Wait one check interval. Returns `false` if the run should end.
    fn pause(&self, relay_done: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.config.check_interval();
        loop {
            if !self.state.is_running() || relay_done.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    /// Capture, score, annotate and act on pending intents.
    fn check_once(
        &self,
        mode: RunMode,
        camera: &mut dyn Camera,
        scorer: &mut dyn Scorer,
        window: &mut ScoreWindow,
        notify: &NotifyHandle,
    ) -> anyhow::Result<()> {
        let path = still_path(&self.config.picture_dir);
        camera.capture_still(&path, self.config.still_size)?;
        let score = scorer.score(&path)?;
        let mean = window.push(score);
        self.state.record_score(mean);

        let needs_water = self.thresholds.needs_water(mean);
        info!("Score {score:.2} (mean {mean:.2}), needs water: {needs_water}");
        camera.annotate(Annotation {
            text: format!("{mean:.1} Score"),
            color: if needs_water {
                self.alert_color
            } else {
                self.ok_color
            },
        });

        for message in self.pick_messages(mode, needs_water) {
            notify.send(&path, message);
        }
        Ok(())
    }

    /// Consume at most one intent and choose the notifications to send.
    ///
    /// A look request shadows the water intent until the next check. The
    /// auto-notify alert is independent of both.
    fn pick_messages(&self, mode: RunMode, needs_water: bool) -> Vec<&str> {
        let c = &self.config;
        let mut messages = Vec::new();
        let mut answered_water = false;
        if self.state.take_look() {
            messages.push(c.look_comment.as_str());
        } else if self.state.take_water() {
            answered_water = needs_water;
            messages.push(if needs_water {
                c.water_comment.as_str()
            } else {
                c.not_water_comment.as_str()
            });
        }
        if mode == RunMode::AutoNotify && needs_water && !answered_water {
            messages.push(c.water_comment.as_str());
        }
        messages
    }

    /// Reverse of start-up. Failures are logged and the next step runs.
    fn teardown(&self, camera: &mut dyn Camera, started: Started) {
        let Started {
            sink,
            relay,
            relay_done,
            shutdown,
            tracker,
        } = started;

        if let Err(e) = camera.stop_recording() {
            warn!("Stopping camera: {e:#}");
        }

        if let Err(e) = sink.flush() {
            warn!("Flushing frame sink: {e}");
        }
        if !sink.has_exited() {
            error!("Transcoder is still running after flush");
        }

        let deadline = Instant::now() + self.config.grace_period();
        while !relay.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if relay.is_finished() {
            match relay.join() {
                Ok(stats) => info!(
                    "Relay joined ({} chunks, {} evictions)",
                    stats.chunks, stats.evictions
                ),
                Err(_) => error!("Broadcast relay panicked"),
            }
        } else {
            warn!("Broadcast relay still reading, detaching it");
        }
        relay_done.cancel();

        shutdown.cancel();
        self.registry.close_all();
        tracker.close();
        let waited = self.runtime.block_on(async {
            tokio::time::timeout(SERVER_STOP_TIMEOUT, tracker.wait()).await
        });
        if waited.is_err() {
            warn!(
                "Servers did not stop within {SERVER_STOP_TIMEOUT:?}, {} task(s) left",
                tracker.len()
            );
        } else {
            info!("Servers stopped");
        }
    }
}

/// Timestamped still file name inside `dir`.
fn still_path(dir: &Path) -> PathBuf {
    dir.join(format!(
        "{}.jpg",
        chrono::Local::now().format("%Y%m%d-%H%M%S%.3f")
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::notify::tests::Recorder;
    use crate::notify::NotifyQueue;

    /// Camera that streams blank frames from a thread and writes a dummy
    /// still file.
    pub(crate) struct FakeCamera {
        frame_len: usize,
        annotations: Arc<Mutex<Vec<Annotation>>>,
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl Camera for FakeCamera {
        fn start_recording(&mut self, output: Arc<dyn FrameOutput>) -> anyhow::Result<()> {
            let frame = vec![16u8; self.frame_len];
            let stop = self.stop.clone();
            self.thread = Some(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if output.write_frame(&frame).is_err() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }));
            Ok(())
        }

        fn wait_recording(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn capture_still(&mut self, path: &Path, _size: u32) -> anyhow::Result<()> {
            std::fs::write(path, b"still")?;
            Ok(())
        }

        fn annotate(&mut self, annotation: Annotation) {
            self.annotations.lock().unwrap().push(annotation);
        }

        fn stop_recording(&mut self) -> anyhow::Result<()> {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                let deadline = Instant::now() + Duration::from_secs(1);
                while !thread.is_finished() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeDriver {
        pub unavailable: bool,
        pub annotations: Arc<Mutex<Vec<Annotation>>>,
    }

    impl CameraDriver for FakeDriver {
        fn open(&self, config: &Config) -> Result<Box<dyn Camera>, PipelineError> {
            if self.unavailable {
                return Err(PipelineError::CameraUnavailable("no camera".into()));
            }
            Ok(Box::new(FakeCamera {
                frame_len: config.frame_len(),
                annotations: self.annotations.clone(),
                stop: Arc::new(AtomicBool::new(false)),
                thread: None,
            }))
        }
    }

    pub(crate) struct FixedScorer(pub f64);

    impl Scorer for FixedScorer {
        fn score(&mut self, _image: &Path) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    /// Small frames, ephemeral ports and a temp directory for everything
    /// written to disk.
    pub(crate) fn test_config(dir: &Path) -> Config {
        let assets = dir.join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join(pages::INDEX_FILE), "<p>${WIDTH}x${HEIGHT}</p>").unwrap();
        std::fs::write(assets.join(pages::SCRIPT_FILE), "var jsmpeg;").unwrap();

        let mut config = Config::default();
        config.width = 16;
        config.height = 16;
        config.framerate = 10;
        config.bind_addr = "127.0.0.1".into();
        config.http_port = 0;
        config.ws_port = 0;
        config.check_interval_secs = 0.05;
        config.picture_dir = dir.join("pictures");
        config.assets_dir = assets;
        config.transcoder_grace_secs = 2.0;
        config.chunk_size = 64;
        config
    }

    pub(crate) fn cat() -> TranscoderCommand {
        TranscoderCommand::new("cat", &[])
    }

    pub(crate) fn wait_for_phase(pipeline: &Pipeline, phase: Phase) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.phase() != phase {
            assert!(Instant::now() < deadline, "never reached {phase:?}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn spawn_run(
        pipeline: &Arc<Pipeline>,
        mode: RunMode,
        score: f64,
        notify: NotifyHandle,
    ) -> JoinHandle<Result<(), PipelineError>> {
        let pipeline = pipeline.clone();
        std::thread::spawn(move || {
            pipeline.run(mode, &FakeDriver::default(), &mut FixedScorer(score), &notify)
        })
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_during_recording_returns_to_idle() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(
            Pipeline::new(test_config(dir.path()), rt.handle().clone()).with_transcoder(cat()),
        );
        let queue = NotifyQueue::start(Box::new(Recorder::default())).unwrap();

        pipeline.state().set_running(true);
        let run = spawn_run(&pipeline, RunMode::Continuous, 3.0, queue.handle());
        wait_for_phase(&pipeline, Phase::Recording);
        std::thread::sleep(Duration::from_millis(200));

        let stopping = Instant::now();
        pipeline.state().set_running(false);
        run.join().unwrap().unwrap();

        assert!(stopping.elapsed() < Duration::from_secs(5));
        assert_eq!(pipeline.phase(), Phase::Idle);
        assert_eq!(pipeline.viewers(), 0);
        assert_eq!(pipeline.state().last_score(), Some(3.0));
        queue.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_kills_transcoder_that_ignores_eof() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transcoder_grace_secs = 0.3;
        let pipeline = Arc::new(
            Pipeline::new(config, rt.handle().clone())
                .with_transcoder(TranscoderCommand::new("sleep", &["30"])),
        );
        let queue = NotifyQueue::start(Box::new(Recorder::default())).unwrap();

        pipeline.state().set_running(true);
        let run = spawn_run(&pipeline, RunMode::Continuous, 3.0, queue.handle());
        wait_for_phase(&pipeline, Phase::Recording);
        std::thread::sleep(Duration::from_millis(200));

        let stopping = Instant::now();
        pipeline.state().set_running(false);
        run.join().unwrap().unwrap();

        assert!(stopping.elapsed() < Duration::from_secs(10));
        assert_eq!(pipeline.phase(), Phase::Idle);
        queue.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_transcoder_exit_ends_the_run() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(
            Pipeline::new(test_config(dir.path()), rt.handle().clone())
                .with_transcoder(TranscoderCommand::new("head", &["-c", "1000"])),
        );
        let queue = NotifyQueue::start(Box::new(Recorder::default())).unwrap();

        pipeline.state().set_running(true);
        let run = spawn_run(&pipeline, RunMode::Continuous, 3.0, queue.handle());
        run.join().unwrap().unwrap();

        assert_eq!(pipeline.phase(), Phase::Idle);
        assert!(!pipeline.state().is_running());
        queue.shutdown();
    }

    #[test]
    fn test_startup_failures_are_fatal_and_leave_idle() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let queue = NotifyQueue::start(Box::new(Recorder::default())).unwrap();

        let pipeline = Pipeline::new(test_config(dir.path()), rt.handle().clone());
        let driver = FakeDriver {
            unavailable: true,
            ..Default::default()
        };
        let err = pipeline
            .run(RunMode::Continuous, &driver, &mut FixedScorer(1.0), &queue.handle())
            .unwrap_err();
        assert!(matches!(err, PipelineError::CameraUnavailable(_)));
        assert_eq!(pipeline.phase(), Phase::Idle);

        let mut config = test_config(dir.path());
        config.assets_dir = dir.path().join("missing");
        let pipeline = Pipeline::new(config, rt.handle().clone());
        let err = pipeline
            .run(
                RunMode::Continuous,
                &FakeDriver::default(),
                &mut FixedScorer(1.0),
                &queue.handle(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingAsset(_)));
        assert_eq!(pipeline.phase(), Phase::Idle);
        queue.shutdown();
    }

    #[test]
    fn test_water_intent_is_cleared_once_on_either_branch() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (water, not_water) = (config.water_comment.clone(), config.not_water_comment.clone());

        for (score, expected) in [(8.0, water), (2.0, not_water)] {
            let recorder = Recorder::default();
            let queue = NotifyQueue::start(Box::new(recorder.clone())).unwrap();
            let pipeline = Pipeline::new(config.clone(), rt.handle().clone());
            let driver = FakeDriver::default();

            pipeline.state().set_water_intent(true);
            pipeline
                .run(RunMode::Single, &driver, &mut FixedScorer(score), &queue.handle())
                .unwrap();
            assert!(!pipeline.state().water_intent());

            // A second cycle has nothing left to act on.
            pipeline
                .run(RunMode::Single, &driver, &mut FixedScorer(score), &queue.handle())
                .unwrap();
            queue.shutdown();

            assert_eq!(recorder.messages(), vec![expected]);
            assert_eq!(driver.annotations.lock().unwrap().len(), 2);
        }
    }

    #[test]
    fn test_annotation_follows_thresholds() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let queue = NotifyQueue::start(Box::new(Recorder::default())).unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()), rt.handle().clone());
        let driver = FakeDriver::default();

        pipeline
            .run(RunMode::Single, &driver, &mut FixedScorer(7.5), &queue.handle())
            .unwrap();
        pipeline
            .run(RunMode::Single, &driver, &mut FixedScorer(20.0), &queue.handle())
            .unwrap();
        queue.shutdown();

        let notes = driver.annotations.lock().unwrap();
        assert_eq!(notes[0].text, "7.5 Score");
        assert_eq!(notes[0].color, Rgb(255, 0, 0));
        assert_eq!(notes[1].text, "20.0 Score");
        assert_eq!(notes[1].color, Rgb(0, 255, 0));
        assert!(std::fs::read_dir(dir.path().join("pictures")).unwrap().count() >= 1);
    }

    #[test]
    fn test_pick_messages_per_mode() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()), rt.handle().clone());
        let c = pipeline.config().clone();
        let state = pipeline.state().clone();
        let (look, water, not_water) = (
            c.look_comment.as_str(),
            c.water_comment.as_str(),
            c.not_water_comment.as_str(),
        );

        assert!(pipeline.pick_messages(RunMode::Continuous, true).is_empty());
        assert_eq!(pipeline.pick_messages(RunMode::AutoNotify, true), vec![water]);
        assert!(pipeline.pick_messages(RunMode::AutoNotify, false).is_empty());

        // Look wins and leaves the water intent for the next check.
        state.set_look_intent(true);
        state.set_water_intent(true);
        assert_eq!(pipeline.pick_messages(RunMode::Continuous, false), vec![look]);
        assert!(state.water_intent());
        assert_eq!(pipeline.pick_messages(RunMode::AutoNotify, false), vec![not_water]);
        assert!(!state.water_intent() && !state.look_intent());
    }

    #[test]
    fn test_auto_notify_alert_is_not_shadowed_by_intents() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()), rt.handle().clone());
        let c = pipeline.config().clone();
        let state = pipeline.state().clone();
        let (look, water) = (c.look_comment.as_str(), c.water_comment.as_str());

        state.set_look_intent(true);
        assert_eq!(pipeline.pick_messages(RunMode::AutoNotify, true), vec![look, water]);

        // An answered water intent already carries the alert.
        state.set_water_intent(true);
        assert_eq!(pipeline.pick_messages(RunMode::AutoNotify, true), vec![water]);
    }

    #[test]
    fn test_failed_single_check_clears_its_requests() {
        struct BrokenScorer;

        impl Scorer for BrokenScorer {
            fn score(&mut self, _image: &Path) -> anyhow::Result<f64> {
                anyhow::bail!("scorer exited with status 1")
            }
        }

        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let queue = NotifyQueue::start(Box::new(recorder.clone())).unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()), rt.handle().clone());

        let driver = FakeDriver {
            unavailable: true,
            ..Default::default()
        };
        pipeline.state().set_water_intent(true);
        let err = pipeline
            .run(RunMode::Single, &driver, &mut FixedScorer(8.0), &queue.handle())
            .unwrap_err();
        assert!(matches!(err, PipelineError::CameraUnavailable(_)));
        assert!(!pipeline.state().water_intent());

        pipeline.state().set_water_intent(true);
        pipeline.state().set_look_intent(true);
        pipeline
            .run(
                RunMode::Single,
                &FakeDriver::default(),
                &mut BrokenScorer,
                &queue.handle(),
            )
            .unwrap();
        assert!(!pipeline.state().water_intent());
        assert!(!pipeline.state().look_intent());
        assert_eq!(pipeline.phase(), Phase::Idle);

        queue.shutdown();
        assert!(recorder.messages().is_empty());
    }
}
