//! Graph generation orchestrator split into focused submodules.
//!
//! [`GraphPipeline`] drives one cycle at a time through fixed stages (fetch, validate
//! input, generate, validate output), reporting each stage on a
//! [`ProgressTracker`](crate::progress::ProgressTracker):
//! - [`fetch`] - Data collection with pipeline-level retry
//! - [`validation`] - Input shape checks and output file checks
//! - [`cycle`] - Server-wide and per-user cycles
//! - [`cleanup`] - Retention cleanup
//! - [`full_cycle`] - Generate, publish and clean up in one call
//!
//! Rendering is CPU bound and runs on a blocking worker thread under a deadline. When
//! the deadline expires the cycle fails immediately; the worker is told to start no
//! further graphs, but a graph already being rendered runs to completion in the
//! background.

mod cleanup;
mod cycle;
mod fetch;
mod full_cycle;
mod validation;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use cleanup::CleanupStats;
pub use full_cycle::{CycleReport, GraphPublisher};

use crate::client::TautulliClient;
use crate::config::{Config, RetryConfig, TautulliConfig};
use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::graphs::GraphFactory;
use crate::progress::ProgressTracker;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Number of progress steps in a generation cycle
pub const CYCLE_STEPS: u32 = 4;

/// Stage of a generation cycle, reported in progress metadata under `stage`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleStage {
    /// Collecting data from the API
    FetchingData,
    /// Checking the collected data
    ValidatingInput,
    /// Rendering on the worker thread
    GeneratingGraphs,
    /// Checking the generated files
    ValidatingOutput,
    /// Cycle finished
    Completed,
}

impl CycleStage {
    /// Stable identifier used in progress metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStage::FetchingData => "fetching_data",
            CycleStage::ValidatingInput => "validating_input",
            CycleStage::GeneratingGraphs => "generating_graphs",
            CycleStage::ValidatingOutput => "validating_output",
            CycleStage::Completed => "completed",
        }
    }

    /// Progress step number of this stage
    pub fn step(&self) -> u32 {
        match self {
            CycleStage::FetchingData => 1,
            CycleStage::ValidatingInput => 2,
            CycleStage::GeneratingGraphs => 3,
            CycleStage::ValidatingOutput | CycleStage::Completed => 4,
        }
    }
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one generation cycle
#[derive(Clone, Debug, PartialEq)]
pub struct CycleParams {
    /// Play history range in days
    pub time_range_days: u32,
    /// Fetch retries after the first attempt
    pub max_retries: u32,
    /// Deadline for the rendering stage
    pub timeout: Duration,
}

impl CycleParams {
    /// Server-wide cycle parameters from a config snapshot
    pub fn server(config: &Config) -> Self {
        Self {
            time_range_days: config.data.time_range_days,
            max_retries: config.pipeline.fetch_retry.max_retries,
            timeout: config.pipeline.generation_timeout,
        }
    }

    /// Per-user cycle parameters from a config snapshot
    pub fn user(config: &Config) -> Self {
        Self {
            timeout: config.pipeline.user_generation_timeout,
            ..Self::server(config)
        }
    }
}

/// Where API clients come from
enum ClientSource {
    /// One client for the pipeline's lifetime
    Fixed(Arc<TautulliClient>),
    /// Built from the current snapshot, rebuilt when connection settings change
    FromConfig(tokio::sync::Mutex<Option<ConfiguredClient>>),
}

struct ConfiguredClient {
    tautulli: TautulliConfig,
    retry: RetryConfig,
    client: Arc<TautulliClient>,
}

/// Orchestrates fetching, rendering, validation and cleanup
pub struct GraphPipeline {
    store: ConfigStore,
    factory: Arc<GraphFactory>,
    clients: ClientSource,
}

impl fmt::Debug for GraphPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphPipeline")
            .field("graphs", &self.factory.len())
            .finish_non_exhaustive()
    }
}

impl GraphPipeline {
    /// Create a pipeline that talks HTTP to the server named in the current config
    ///
    /// The client is rebuilt (and its cache discarded) whenever the connection or
    /// request retry settings change in the store.
    pub fn new(store: ConfigStore, factory: GraphFactory) -> Self {
        Self {
            store,
            factory: Arc::new(factory),
            clients: ClientSource::FromConfig(tokio::sync::Mutex::new(None)),
        }
    }

    /// Create a pipeline around an existing client
    pub fn with_client(
        store: ConfigStore,
        factory: GraphFactory,
        client: Arc<TautulliClient>,
    ) -> Self {
        Self {
            store,
            factory: Arc::new(factory),
            clients: ClientSource::Fixed(client),
        }
    }

    /// Configuration store backing this pipeline
    pub fn config_store(&self) -> &ConfigStore {
        &self.store
    }

    /// Client for the given snapshot
    async fn client_for(&self, config: &Config) -> Result<Arc<TautulliClient>> {
        match &self.clients {
            ClientSource::Fixed(client) => Ok(client.clone()),
            ClientSource::FromConfig(slot) => {
                let mut slot = slot.lock().await;
                let reusable = slot.as_ref().filter(|existing| {
                    existing.tautulli == config.tautulli && existing.retry == config.request_retry
                });
                if let Some(existing) = reusable {
                    return Ok(existing.client.clone());
                }

                let client = Arc::new(TautulliClient::from_config(config)?);
                tracing::debug!(endpoint = %config.tautulli.api_endpoint(), "Created API client");
                *slot = Some(ConfiguredClient {
                    tautulli: config.tautulli.clone(),
                    retry: config.request_retry.clone(),
                    client: client.clone(),
                });
                Ok(client)
            }
        }
    }

    /// Report a stage on the tracker
    fn report_stage(tracker: &ProgressTracker, stage: CycleStage, message: &str) {
        let mut metadata = BTreeMap::new();
        metadata.insert("stage".to_string(), Value::from(stage.as_str()));
        tracker.update(message, stage.step(), CYCLE_STEPS, metadata);
    }
}

/// Run blocking work on a worker thread under a deadline
///
/// On expiry `cancel` is triggered, the timeout is recorded on `tracker`, and
/// [`Error::Timeout`] is returned without waiting for the worker.
async fn offload<T, F>(
    operation: &str,
    timeout: Duration,
    tracker: &ProgressTracker,
    cancel: &CancellationToken,
    work: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(Error::Other(format!(
            "{operation} worker failed: {join_error}"
        ))),
        Err(_) => {
            cancel.cancel();
            let error = Error::Timeout {
                operation: operation.to_string(),
                timeout,
            };
            tracker.add_error(error.to_string());
            Err(error)
        }
    }
}
