//! Progress reporting for long-running operations
//!
//! A [`ProgressTracker`] belongs to one operation (a cycle, a cleanup run). It records
//! step progress plus bounded lists of errors and warnings, and forwards every
//! update to an optional observer callback. The tracker is shared between the async
//! orchestrator and the rendering worker thread, so all state sits behind a lock.

use crate::graphs::panic_message;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Observer invoked on every progress update
///
/// Returning `Err` (or panicking) is recorded as a tracker error; it never aborts the
/// operation being observed.
pub type ProgressCallback =
    Arc<dyn Fn(&ProgressUpdate) -> std::result::Result<(), String> + Send + Sync>;

/// Tracker limits and switches
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressTrackerConfig {
    /// Maximum number of retained errors (default: 100)
    pub max_errors: usize,
    /// Maximum number of retained warnings (default: 100)
    pub max_warnings: usize,
    /// Forward updates to the callback (default: true)
    pub enable_callbacks: bool,
    /// Attach elapsed time to updates (default: true)
    pub track_elapsed_time: bool,
}

impl Default for ProgressTrackerConfig {
    fn default() -> Self {
        Self {
            max_errors: 100,
            max_warnings: 100,
            enable_callbacks: true,
            track_elapsed_time: true,
        }
    }
}

/// Snapshot passed to the progress callback
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Human-readable description of the current step
    pub message: String,
    /// Current step number
    pub current: u32,
    /// Total number of steps
    pub total: u32,
    /// Caller metadata merged with `elapsed_time`, `errors` and `warnings`
    pub metadata: BTreeMap<String, Value>,
}

impl ProgressUpdate {
    /// Errors recorded so far
    pub fn errors(&self) -> Vec<String> {
        string_list(self.metadata.get("errors"))
    }

    /// Warnings recorded so far
    pub fn warnings(&self) -> Vec<String> {
        string_list(self.metadata.get("warnings"))
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Final report of a tracked operation
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSummary {
    /// Last step reached
    pub completed_steps: u32,
    /// Total number of steps
    pub total_steps: u32,
    /// Number of retained errors
    pub error_count: usize,
    /// Number of retained warnings
    pub warning_count: usize,
    /// Retained errors in order of occurrence
    pub errors: Vec<String>,
    /// Retained warnings in order of occurrence
    pub warnings: Vec<String>,
    /// Time since the tracker was created
    pub total_time: Duration,
}

impl ProgressSummary {
    /// Whether any error was recorded
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    current_step: u32,
    total_steps: u32,
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Step progress plus bounded error and warning lists for one operation
pub struct ProgressTracker {
    config: ProgressTrackerConfig,
    callback: Option<ProgressCallback>,
    started: Instant,
    state: Mutex<ProgressState>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("config", &self.config)
            .field("has_callback", &self.callback.is_some())
            .field("state", &*self.state())
            .finish()
    }
}

impl ProgressTracker {
    /// Create a tracker with default limits
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self::with_config(ProgressTrackerConfig::default(), callback)
    }

    /// Create a tracker with explicit limits
    pub fn with_config(config: ProgressTrackerConfig, callback: Option<ProgressCallback>) -> Self {
        Self {
            config,
            callback,
            started: Instant::now(),
            state: Mutex::new(ProgressState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the tracker was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record step progress and notify the callback
    ///
    /// `metadata` is merged with the accumulated error and warning lists (and the
    /// elapsed time when enabled) before it reaches the callback.
    pub fn update(
        &self,
        message: &str,
        current: u32,
        total: u32,
        metadata: BTreeMap<String, Value>,
    ) {
        let (errors, warnings) = {
            let mut state = self.state();
            state.current_step = current;
            state.total_steps = total;
            (state.errors.clone(), state.warnings.clone())
        };

        let mut metadata = metadata;
        if self.config.track_elapsed_time {
            metadata.insert(
                "elapsed_time".to_string(),
                Value::from(self.elapsed().as_secs_f64()),
            );
        }
        metadata.insert("errors".to_string(), Value::from(errors));
        metadata.insert("warnings".to_string(), Value::from(warnings));

        debug!(step = current, total, "Progress: {}", message);

        if !self.config.enable_callbacks {
            return;
        }
        let Some(callback) = &self.callback else {
            return;
        };

        let update = ProgressUpdate {
            message: message.to_string(),
            current,
            total,
            metadata,
        };

        // Callback runs outside the state lock so it may query the tracker
        let outcome = match catch_unwind(AssertUnwindSafe(|| callback(&update))) {
            Ok(result) => result,
            Err(panic) => Err(panic_message(panic.as_ref())),
        };
        if let Err(e) = outcome {
            self.add_error(format!("Progress callback failed: {e}"));
        }
    }

    /// Record an error (always logged, retained up to `max_errors`)
    pub fn add_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Progress tracker error: {}", message);
        let mut state = self.state();
        if state.errors.len() < self.config.max_errors {
            state.errors.push(message);
        }
    }

    /// Record a warning (always logged, retained up to `max_warnings`)
    pub fn add_warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Progress tracker warning: {}", message);
        let mut state = self.state();
        if state.warnings.len() < self.config.max_warnings {
            state.warnings.push(message);
        }
    }

    /// Whether any error was recorded
    pub fn has_errors(&self) -> bool {
        !self.state().errors.is_empty()
    }

    /// Snapshot of the tracked operation
    pub fn get_summary(&self) -> ProgressSummary {
        let state = self.state();
        ProgressSummary {
            completed_steps: state.current_step,
            total_steps: state.total_steps,
            error_count: state.errors.len(),
            warning_count: state.warnings.len(),
            errors: state.errors.clone(),
            warnings: state.warnings.clone(),
            total_time: self.elapsed(),
        }
    }

    /// Log the summary at info level
    pub fn log_summary(&self, operation: &str) {
        let summary = self.get_summary();
        info!(
            operation,
            completed_steps = summary.completed_steps,
            total_steps = summary.total_steps,
            errors = summary.error_count,
            warnings = summary.warning_count,
            total_time_secs = summary.total_time.as_secs_f64(),
            "Operation finished"
        );
    }
}
