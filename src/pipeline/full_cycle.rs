//! Generate, publish and clean up in one call

use super::{CleanupStats, CycleParams, GraphPipeline};
use crate::error::Result;
use crate::progress::{ProgressCallback, ProgressSummary, ProgressTracker};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Delivers generated graphs (to a chat channel, a web directory, ...)
#[async_trait]
pub trait GraphPublisher: Send + Sync {
    /// Deliver `files`; an error is recorded but does not fail the cycle
    async fn publish(&self, files: &[PathBuf]) -> Result<()>;
}

/// Outcome of a full cycle
#[derive(Clone, Debug)]
pub struct CycleReport {
    /// Files that passed output validation
    pub files: Vec<PathBuf>,
    /// Whether the publisher accepted the files
    pub published: bool,
    /// Cleanup result; `None` if cleanup failed
    pub cleanup: Option<CleanupStats>,
    /// Tracker summary of the generation cycle
    pub summary: ProgressSummary,
}

impl GraphPipeline {
    /// Generate server graphs, hand them to `publisher`, then apply retention
    ///
    /// Publishing and cleanup failures are recorded in the report instead of failing
    /// the call.
    ///
    /// # Errors
    /// Propagates a failed generation cycle (see [`run_cycle`](Self::run_cycle)).
    pub async fn run_full_cycle(
        &self,
        publisher: Option<&dyn GraphPublisher>,
        callback: Option<ProgressCallback>,
    ) -> Result<CycleReport> {
        let config = self.store.get_current();
        let tracker = Arc::new(ProgressTracker::new(callback.clone()));

        let files = self.run_cycle(&CycleParams::server(&config), &tracker).await?;
        let published = publish(publisher, &files, &tracker).await;

        let cleanup_tracker = ProgressTracker::new(callback);
        let cleanup = match self.cleanup_old_graphs(&cleanup_tracker).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracker.add_warning(format!("Cleanup of old graphs failed: {e}"));
                None
            }
        };

        info!(
            files = files.len(),
            published,
            "Full graph cycle finished"
        );
        Ok(CycleReport {
            files,
            published,
            cleanup,
            summary: tracker.get_summary(),
        })
    }

    /// Generate a user's graphs, deliver them, then delete them
    ///
    /// Delivered files are removed immediately; expired user directories are cleaned
    /// up afterwards.
    ///
    /// # Errors
    /// Propagates a failed generation cycle (see [`run_user_cycle`](Self::run_user_cycle)).
    pub async fn run_user_full_cycle(
        &self,
        user_email: &str,
        publisher: Option<&dyn GraphPublisher>,
        callback: Option<ProgressCallback>,
    ) -> Result<CycleReport> {
        let config = self.store.get_current();
        let tracker = Arc::new(ProgressTracker::new(callback.clone()));

        let files = self
            .run_user_cycle(user_email, &CycleParams::user(&config), &tracker)
            .await?;
        let published = publish(publisher, &files, &tracker).await;
        if published {
            let deleted = self.delete_graph_files(files.clone()).await;
            info!(user_email, deleted, "Removed delivered user graphs");
        }

        let cleanup_tracker = ProgressTracker::new(callback);
        let cleanup = match self
            .cleanup_old_user_graphs(user_email, &cleanup_tracker)
            .await
        {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracker.add_warning(format!("Cleanup of old user graphs failed: {e}"));
                None
            }
        };

        Ok(CycleReport {
            files,
            published,
            cleanup,
            summary: tracker.get_summary(),
        })
    }
}

async fn publish(
    publisher: Option<&dyn GraphPublisher>,
    files: &[PathBuf],
    tracker: &ProgressTracker,
) -> bool {
    let Some(publisher) = publisher else {
        return false;
    };
    if files.is_empty() {
        tracker.add_warning("No graphs to publish");
        return false;
    }
    match publisher.publish(files).await {
        Ok(()) => true,
        Err(e) => {
            tracker.add_error(format!("Failed to publish graphs: {e}"));
            false
        }
    }
}
