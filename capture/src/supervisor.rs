//! Supervisor – the orchestration layer in front of the pipeline.
//!
//! Owns the single active run and is the only way to start one.  The
//! pipeline itself assumes single-instance use, so a second start while a
//! run is alive is rejected here.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::{error, info};

use plantcam_common::protocol::{RunMode, StatusResponse};

use crate::camera::CameraDriver;
use crate::error::ControlError;
use crate::lifecycle::Pipeline;
use crate::notify::NotifyHandle;
use crate::scoring::Scorer;

struct ActiveRun {
    mode: RunMode,
    thread: JoinHandle<()>,
}

pub struct Supervisor {
    pipeline: Arc<Pipeline>,
    driver: Arc<dyn CameraDriver>,
    scorer: Arc<Mutex<Box<dyn Scorer>>>,
    notify: NotifyHandle,
    active: Mutex<Option<ActiveRun>>,
}

impl Supervisor {
    pub fn new(
        pipeline: Arc<Pipeline>,
        driver: Arc<dyn CameraDriver>,
        scorer: Box<dyn Scorer>,
        notify: NotifyHandle,
    ) -> Self {
        Self {
            pipeline,
            driver,
            scorer: Arc::new(Mutex::new(scorer)),
            notify,
            active: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn start_continuous(&self) -> Result<(), ControlError> {
        self.start(RunMode::Continuous)
    }

    pub fn start_continuous_with_auto_notify(&self) -> Result<(), ControlError> {
        self.start(RunMode::AutoNotify)
    }

    pub fn request_single_check(&self) -> Result<(), ControlError> {
        self.start(RunMode::Single)
    }

    /// Ask the active run to stop. Returns without waiting; see [`Self::wait`].
    pub fn stop(&self) -> Result<(), ControlError> {
        let mode = self.active_mode().ok_or(ControlError::NotRunning)?;
        info!("Stopping {mode} run");
        self.pipeline.state().set_running(false);
        Ok(())
    }

    /// Block until the active run, if any, has returned to idle.
    pub fn wait(&self) {
        let run = self.lock().take();
        if let Some(run) = run {
            if run.thread.join().is_err() {
                error!("Pipeline thread panicked");
            }
        }
    }

    pub fn set_water_intent(&self, on: bool) {
        self.pipeline.state().set_water_intent(on);
    }

    pub fn set_look_intent(&self, on: bool) {
        self.pipeline.state().set_look_intent(on);
    }

    pub fn water_intent(&self) -> bool {
        self.pipeline.state().water_intent()
    }

    pub fn look_intent(&self) -> bool {
        self.pipeline.state().look_intent()
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.state().is_running()
    }

    /// "Should I water?" The answer comes from the next check.
    ///
    /// Auto-notify runs already report when watering is needed, so the
    /// request is refused there.  A continuous run picks the intent up on
    /// its next iteration; otherwise a single check is started for it.
    pub fn check_water(&self) -> Result<(), ControlError> {
        match self.active_mode() {
            Some(RunMode::AutoNotify) => Err(ControlError::WaterMonitorActive),
            Some(RunMode::Continuous) => {
                self.set_water_intent(true);
                Ok(())
            }
            Some(RunMode::Single) => Err(ControlError::AlreadyRunning(RunMode::Single)),
            None => {
                self.set_water_intent(true);
                self.start(RunMode::Single)
            }
        }
    }

    /// Post the next still regardless of its score.
    pub fn check_look(&self) -> Result<(), ControlError> {
        match self.active_mode() {
            Some(RunMode::Single) => Err(ControlError::AlreadyRunning(RunMode::Single)),
            Some(_) => {
                self.set_look_intent(true);
                Ok(())
            }
            None => {
                self.set_look_intent(true);
                self.start(RunMode::Single)
            }
        }
    }

    /// Mode of the run that has not yet returned to idle.
    pub fn active_mode(&self) -> Option<RunMode> {
        self.lock()
            .as_ref()
            .filter(|run| !run.thread.is_finished())
            .map(|run| run.mode)
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            phase: self.pipeline.phase(),
            mode: self.active_mode(),
            running: self.is_running(),
            water_intent: self.water_intent(),
            look_intent: self.look_intent(),
            last_score: self.pipeline.state().last_score(),
            viewers: self.pipeline.viewers(),
        }
    }

    fn start(&self, mode: RunMode) -> Result<(), ControlError> {
        let mut active = self.lock();
        if let Some(run) = active.as_ref() {
            if !run.thread.is_finished() {
                return Err(ControlError::AlreadyRunning(run.mode));
            }
        }
        if let Some(done) = active.take() {
            if done.thread.join().is_err() {
                error!("Previous pipeline thread panicked");
            }
        }

        if mode.streams() {
            self.pipeline.state().set_running(true);
        }
        let pipeline = self.pipeline.clone();
        let driver = self.driver.clone();
        let scorer = self.scorer.clone();
        let notify = self.notify.clone();
        let spawned = std::thread::Builder::new()
            .name("pipeline".into())
            .spawn(move || {
                let mut scorer = scorer.lock().unwrap_or_else(|e| e.into_inner());
                // Errors are logged by the pipeline.
                let _ = pipeline.run(mode, driver.as_ref(), &mut **scorer, &notify);
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.pipeline.state().set_running(false);
                return Err(e.into());
            }
        };

        info!("{mode} run started");
        *active = Some(ActiveRun { mode, thread });
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}
