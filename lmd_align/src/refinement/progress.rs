//! Progress events, cancellation and event logs for refinement runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::SharedFn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Non-convergence report. The best-so-far field is kept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefinementStalled {
    /// Iteration (1-based) at which the run stopped.
    pub iteration: usize,
    /// Iteration at which the best metric was reached.
    pub best_iteration: usize,
    pub best_metric: f64,
    /// Length of the trailing window without improvement.
    pub window: usize,
}

/// One entry in the ordered event stream of a refinement run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RefinementEvent {
    Started { iterations: usize },
    /// `iteration` is 1-based and strictly increasing within a run.
    Iteration { iteration: usize, metric: f64 },
    Stalled(RefinementStalled),
    /// `best_metric` is `None` when no iteration ran.
    Finished {
        iterations_run: usize,
        best_metric: Option<f64>,
    },
    Failed { reason: String },
    Cancelled { iteration: usize },
}

impl RefinementEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefinementEvent::Finished { .. }
                | RefinementEvent::Failed { .. }
                | RefinementEvent::Cancelled { .. }
        )
    }
}

/// Callback type for progress reporting.
pub type ProgressCallback = SharedFn<dyn Fn(RefinementEvent) + Send + Sync>;

/// Report an event using the callback if set.
pub fn report_progress(callback: &ProgressCallback, event: RefinementEvent) {
    if let Some(f) = callback.as_ref() {
        f(event);
    }
}

/// Cooperative cancellation flag, checked at iteration boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Append-only event log shared between a run and its observers.
/// Readers always see a prefix of the final sequence.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<RefinementEvent>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: RefinementEvent) {
        self.0.lock().push(event);
    }

    pub fn snapshot(&self) -> Vec<RefinementEvent> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// `(iteration, metric)` pairs recorded so far.
    pub fn metrics(&self) -> Vec<(usize, f64)> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                RefinementEvent::Iteration { iteration, metric } => Some((*iteration, *metric)),
                _ => None,
            })
            .collect()
    }
}
