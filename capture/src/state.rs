//! Shared run-state flags.
//!
//! `running` is the cooperative "continue" flag checked at the top of every
//! capture iteration.  `water` and `look` are one-shot intents: an external
//! caller sets them, and the capture loop consumes each exactly once with
//! [`RunState::take_water`] / [`RunState::take_look`] after acting on it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use plantcam_common::protocol::Phase;

#[derive(Debug, Default)]
pub struct RunState {
    running: AtomicBool,
    water: AtomicBool,
    look: AtomicBool,
    last_score: Mutex<Option<f64>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn water_intent(&self) -> bool {
        self.water.load(Ordering::Relaxed)
    }

    pub fn set_water_intent(&self, on: bool) {
        self.water.store(on, Ordering::Relaxed);
    }

    pub fn look_intent(&self) -> bool {
        self.look.load(Ordering::Relaxed)
    }

    pub fn set_look_intent(&self, on: bool) {
        self.look.store(on, Ordering::Relaxed);
    }

    /// Consume the water intent. Returns `true` for exactly one caller per set.
    pub fn take_water(&self) -> bool {
        self.water.swap(false, Ordering::AcqRel)
    }

    /// Consume the look intent. Returns `true` for exactly one caller per set.
    pub fn take_look(&self) -> bool {
        self.look.swap(false, Ordering::AcqRel)
    }

    pub fn last_score(&self) -> Option<f64> {
        *self.last_score.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_score(&self, score: f64) {
        *self.last_score.lock().unwrap_or_else(|e| e.into_inner()) = Some(score);
    }
}

/// Published lifecycle phase, readable from any thread.
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl Default for PhaseCell {
    fn default() -> Self {
        Self(AtomicU8::new(Phase::Idle.as_u8()))
    }
}

impl PhaseCell {
    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: Phase) {
        let prev = Phase::from_u8(self.0.swap(phase.as_u8(), Ordering::AcqRel));
        if prev != phase {
            tracing::info!("Lifecycle: {prev:?} → {phase:?}");
        }
    }
}
