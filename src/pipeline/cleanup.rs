//! Retention cleanup of generated graphs

use super::{GraphPipeline, offload};
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::storage::{self, CleanupOutcome};
use chrono::Local;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Result of a cleanup run
#[derive(Clone, Debug, PartialEq)]
pub struct CleanupStats {
    /// Files removed
    pub files_deleted: usize,
    /// Directories removed
    pub dirs_removed: usize,
    /// Retention window that was applied
    pub keep_days: u32,
    /// Wall time of the run
    pub cleanup_time: Duration,
    /// Errors recorded during the run
    pub errors: Vec<String>,
    /// Warnings recorded during the run
    pub warnings: Vec<String>,
}

impl GraphPipeline {
    /// Delete date directories older than `data.keep_days`
    ///
    /// Runs on a worker thread under `pipeline.cleanup_timeout`.
    ///
    /// # Errors
    /// - [`Error::Timeout`] if the deadline expires
    /// - [`Error::Pipeline`] if the graph directory cannot be listed
    pub async fn cleanup_old_graphs(&self, tracker: &ProgressTracker) -> Result<CleanupStats> {
        let config = self.store.get_current();
        let keep_days = config.data.keep_days;
        let graph_dir = config.output.graph_dir.clone();
        let today = Local::now().date_naive();

        self.run_cleanup(
            "Graph cleanup",
            keep_days,
            config.pipeline.cleanup_timeout,
            tracker,
            move || storage::cleanup_dated_graphs(&graph_dir, keep_days, today),
        )
        .await
    }

    /// Delete one user's graphs from date directories older than `data.keep_days`
    ///
    /// # Errors
    /// Same as [`cleanup_old_graphs`](Self::cleanup_old_graphs)
    pub async fn cleanup_old_user_graphs(
        &self,
        user_email: &str,
        tracker: &ProgressTracker,
    ) -> Result<CleanupStats> {
        let config = self.store.get_current();
        let keep_days = config.data.keep_days;
        let graph_dir = config.output.graph_dir.clone();
        let user_email = user_email.to_string();
        let today = Local::now().date_naive();

        self.run_cleanup(
            "User graph cleanup",
            keep_days,
            config.pipeline.cleanup_timeout,
            tracker,
            move || storage::cleanup_user_dated_graphs(&graph_dir, &user_email, keep_days, today),
        )
        .await
    }

    /// Delete specific graph files right away (e.g. once they were delivered)
    ///
    /// Returns the number of files removed; failures are logged.
    pub async fn delete_graph_files(&self, files: Vec<PathBuf>) -> usize {
        match tokio::task::spawn_blocking(move || storage::delete_files(&files)).await {
            Ok(outcome) => outcome.files_deleted,
            Err(e) => {
                tracing::error!("Graph file deletion task failed: {}", e);
                0
            }
        }
    }

    /// Run retention work on a worker thread under `timeout`, reporting two progress steps
    pub(super) async fn run_cleanup<F>(
        &self,
        operation: &str,
        keep_days: u32,
        timeout: Duration,
        tracker: &ProgressTracker,
        work: F,
    ) -> Result<CleanupStats>
    where
        F: FnOnce() -> Result<CleanupOutcome> + Send + 'static,
    {
        let mut metadata = BTreeMap::new();
        metadata.insert("stage".to_string(), Value::from("cleanup"));
        metadata.insert("keep_days".to_string(), Value::from(keep_days));
        tracker.update(&format!("{operation} started"), 1, 2, metadata.clone());

        let started = std::time::Instant::now();
        let cancel = CancellationToken::new();
        let outcome = match offload(operation, timeout, tracker, &cancel, work).await {
            Ok(outcome) => outcome,
            Err(e @ Error::Timeout { .. }) => return Err(e),
            Err(e) => {
                tracker.add_error(format!("{operation} failed: {e}"));
                return Err(Error::pipeline(format!("{operation} failed"), e));
            }
        };

        for warning in &outcome.warnings {
            tracker.add_warning(warning.clone());
        }
        tracker.update(&format!("{operation} completed"), 2, 2, metadata);

        let summary = tracker.get_summary();
        let stats = CleanupStats {
            files_deleted: outcome.files_deleted,
            dirs_removed: outcome.dirs_removed,
            keep_days,
            cleanup_time: started.elapsed(),
            errors: summary.errors,
            warnings: summary.warnings,
        };
        info!(
            operation,
            files_deleted = stats.files_deleted,
            keep_days,
            "Cleanup finished"
        );
        Ok(stats)
    }
}
