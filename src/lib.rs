//! # tgraph
//!
//! Fetches playback statistics from a Tautulli server and turns them into charts.
//!
//! ## Design Philosophy
//!
//! tgraph is designed to be:
//! - **Resilient** - Timeouts are retried with backoff, partial failures are recorded
//!   instead of aborting the cycle
//! - **Live-configurable** - Settings are read from an immutable snapshot that can be
//!   swapped at runtime or reloaded when the file changes
//! - **Library-first** - Rendering and delivery are collaborators supplied by the
//!   embedding application
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use tgraph::{ConfigStore, GraphFactory, GraphPipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = ConfigStore::from_file(Path::new("config.yml"))?;
//!     store.start_file_monitoring(Path::new("config.yml"))?;
//!
//!     // Register renderers for the graph kinds you want
//!     let factory = GraphFactory::new();
//!     let pipeline = GraphPipeline::new(store, factory);
//!
//!     let report = pipeline.run_full_cycle(None, None).await?;
//!     println!("Generated {} graphs", report.files.len());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Tautulli API client with response cache and retry
pub mod client;
/// Configuration types
pub mod config;
/// Live configuration store with file monitoring
pub mod config_store;
/// Error types
pub mod error;
/// Rendering collaborator boundary
pub mod graphs;
/// Paginated play history fetching
pub mod history;
/// Graph generation orchestrator (decomposed into focused submodules)
pub mod pipeline;
/// Progress and error accounting for long operations
pub mod progress;
/// Retry logic with exponential backoff
pub mod retry;
/// Output directory layout and retention cleanup
pub mod storage;

// Re-export commonly used types
pub use client::{FetchRequest, HttpTransport, JsonMap, ParamValue, TautulliClient, Transport};
pub use config::{Config, DataConfig, GraphSelection, PipelineConfig, RetryConfig, TautulliConfig};
pub use config_store::{CallbackId, ChangeCallback, ConfigStore};
pub use error::{Error, Result};
pub use graphs::{Graph, GraphData, GraphFactory, GraphKind};
pub use history::PlayHistory;
pub use pipeline::{CleanupStats, CycleParams, CycleReport, CycleStage, GraphPipeline, GraphPublisher};
pub use progress::{
    ProgressCallback, ProgressSummary, ProgressTracker, ProgressTrackerConfig, ProgressUpdate,
};

use std::future::Future;
use std::time::Duration;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Run full update cycles every `update_days` until a termination signal arrives.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use tgraph::{ConfigStore, GraphFactory, GraphPipeline, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = ConfigStore::from_file(Path::new("config.yml"))?;
///     let pipeline = GraphPipeline::new(store, GraphFactory::new());
///
///     // Regenerate graphs on schedule until Ctrl+C
///     run_with_shutdown(&pipeline, None).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(
    pipeline: &GraphPipeline,
    publisher: Option<&dyn GraphPublisher>,
) -> Result<()> {
    run_until(pipeline, publisher, wait_for_signal()).await
}

/// Run full update cycles every `update_days` until `shutdown` completes.
///
/// The interval is read from the current configuration snapshot after each cycle,
/// so a changed `update_days` applies from the next wait. A failed cycle is logged
/// and retried at the next interval. A cycle in flight when `shutdown` completes is
/// abandoned. File monitoring on the pipeline's store is stopped before returning.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for shutdown hooks that can fail.
pub async fn run_until<S>(
    pipeline: &GraphPipeline,
    publisher: Option<&dyn GraphPublisher>,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            outcome = pipeline.run_full_cycle(publisher, None) => match outcome {
                Ok(report) => tracing::info!(
                    files = report.files.len(),
                    published = report.published,
                    "Scheduled update finished"
                ),
                Err(e) => tracing::error!(error = %e, "Scheduled update failed"),
            },
        }

        let update_days = pipeline.config_store().get_current().data.update_days;
        let interval = Duration::from_secs(u64::from(update_days) * SECONDS_PER_DAY);
        tracing::debug!(update_days, "Waiting for next scheduled update");

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    if pipeline.config_store().stop_file_monitoring() {
        tracing::debug!("Stopped configuration file monitoring");
    }
    tracing::info!("Scheduled updates stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
