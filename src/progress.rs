//! Progress reporting and cooperative cancellation
//!
//! The orchestrator owns a single `ProgressReporter`; every component reports
//! through a sub-range of it. The reporter clamps every fraction to the
//! highest value already reported, so consumers never see progress regress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Caller-supplied progress callback: `(message, fraction)`.
///
/// Invoked from the installation worker thread; the consumer is responsible
/// for marshalling onto its own thread.
pub type ProgressSink = Arc<dyn Fn(&str, Option<f64>) + Send + Sync>;

/// A sink that drops every update
pub fn null_sink() -> ProgressSink {
    Arc::new(|_, _| {})
}

/// Cooperative stop flag, checked between pipeline steps
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    stopped: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the installation to stop at the next step boundary
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    message: String,
    fraction: f64,
}

/// Monotonic progress state shared by all steps of one installation
#[derive(Clone)]
pub struct ProgressReporter {
    sink: ProgressSink,
    state: Arc<Mutex<ProgressState>>,
    start: f64,
    end: f64,
}

impl ProgressReporter {
    pub fn new(sink: ProgressSink) -> Self {
        Self {
            sink,
            state: Arc::new(Mutex::new(ProgressState::default())),
            start: 0.0,
            end: 1.0,
        }
    }

    /// A reporter mapping `[0, 1]` onto `[start, end]` of this reporter's range
    pub fn sub_range(&self, start: f64, end: f64) -> Self {
        let span = self.end - self.start;
        Self {
            sink: Arc::clone(&self.sink),
            state: Arc::clone(&self.state),
            start: self.start + span * start.clamp(0.0, 1.0),
            end: self.start + span * end.clamp(0.0, 1.0),
        }
    }

    /// Report a raw fraction local to this reporter's range
    pub fn report(&self, message: &str, local_fraction: f64) {
        let raw = self.start + (self.end - self.start) * local_fraction.clamp(0.0, 1.0);
        let fraction = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if raw > state.fraction {
                state.fraction = raw;
            }
            state.message = message.to_string();
            state.fraction
        };
        tracing::debug!(fraction, "{}", message);
        (self.sink)(message, Some(fraction));
    }

    /// Report a message without moving the fraction
    pub fn message(&self, message: &str) {
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.message = message.to_string();
        }
        (self.sink)(message, None);
    }

    /// Highest fraction reported so far
    pub fn fraction(&self) -> f64 {
        match self.state.lock() {
            Ok(s) => s.fraction,
            Err(poisoned) => poisoned.into_inner().fraction,
        }
    }

    /// Last message reported
    pub fn last_message(&self) -> String {
        match self.state.lock() {
            Ok(s) => s.message.clone(),
            Err(poisoned) => poisoned.into_inner().message.clone(),
        }
    }
}
