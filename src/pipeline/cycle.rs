//! Server-wide and per-user generation cycles

use super::validation::{SERVER_DATASETS, USER_DATASETS, validate_input, validate_output};
use super::{CycleParams, CycleStage, GraphPipeline, offload};
use crate::config::{Config, GraphSelection, RetryConfig};
use crate::error::{Error, Result};
use crate::graphs::GraphData;
use crate::progress::ProgressTracker;
use crate::storage;
use chrono::{Local, NaiveDate};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

impl GraphPipeline {
    /// Generate server-wide graphs
    ///
    /// Stages: fetch (with retry), validate input, render on a worker thread under
    /// `params.timeout`, validate output. The client cache is cleared when the cycle
    /// starts, so cached responses are only reused by retries within the cycle.
    ///
    /// Per-graph failures do not fail the cycle; the returned list holds every file
    /// that passed output validation. Timeout retries inside the client are recorded
    /// on `tracker` as warnings.
    ///
    /// Every failure is recorded on `tracker` before it is returned, so the tracker
    /// summary is a complete history of the cycle either way.
    ///
    /// # Errors
    /// - [`Error::Timeout`] if rendering (or the whole cycle, when
    ///   `pipeline.cycle_timeout` is set) exceeds its deadline
    /// - [`Error::Pipeline`] for any other failure, wrapping the cause
    pub async fn run_cycle(
        &self,
        params: &CycleParams,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<Vec<PathBuf>> {
        let config = self.store.get_current();
        let cancel = CancellationToken::new();
        // Stops the worker from starting new graphs once this cycle returns
        let _stop_worker = cancel.clone().drop_guard();

        info!(
            time_range_days = params.time_range_days,
            max_retries = params.max_retries,
            timeout_secs = params.timeout.as_secs_f64(),
            "Starting graph generation cycle"
        );

        let stages = self.server_stages(&config, params, tracker, &cancel);
        let result = within_cycle_deadline(config.pipeline.cycle_timeout, tracker, stages).await;
        finish("Graph generation", result, tracker)
    }

    /// Generate graphs for the user with `user_email`
    ///
    /// Output goes to
    /// `<graph_dir>/<date>/users/<sanitized email>/`.
    ///
    /// # Errors
    /// Same as [`run_cycle`](Self::run_cycle); an unknown email fails the cycle.
    pub async fn run_user_cycle(
        &self,
        user_email: &str,
        params: &CycleParams,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<Vec<PathBuf>> {
        let config = self.store.get_current();
        let cancel = CancellationToken::new();
        let _stop_worker = cancel.clone().drop_guard();

        info!(
            user_email,
            time_range_days = params.time_range_days,
            "Starting user graph generation cycle"
        );

        let stages = self.user_stages(&config, user_email, params, tracker, &cancel);
        let result = within_cycle_deadline(config.pipeline.cycle_timeout, tracker, stages).await;
        finish("User graph generation", result, tracker)
    }

    async fn server_stages(
        &self,
        config: &Config,
        params: &CycleParams,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        Self::report_stage(tracker, CycleStage::FetchingData, "Fetching data from Tautulli API");
        let client = self.client_for(config).await?.observed_by(tracker.clone());
        client.clear_cache().await;
        let retry = fetch_retry(config, params);
        let data = self
            .fetch_with_retry("server graph data", &retry, tracker, cancel, || {
                Self::fetch_server_data(&client, config, params.time_range_days)
            })
            .await?;

        Self::report_stage(tracker, CycleStage::ValidatingInput, "Validating fetched data");
        validate_input(&data, SERVER_DATASETS, tracker)?;

        Self::report_stage(tracker, CycleStage::GeneratingGraphs, "Generating graphs");
        let output_dir = storage::dated_graph_dir(&config.output.graph_dir, today());
        let files = self
            .render(
                "Graph generation",
                data,
                output_dir,
                config.graphs.clone(),
                params.timeout,
                tracker,
                cancel,
            )
            .await?;

        self.validate_and_complete(files, tracker).await
    }

    async fn user_stages(
        &self,
        config: &Config,
        user_email: &str,
        params: &CycleParams,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        Self::report_stage(tracker, CycleStage::FetchingData, "Fetching user data from Tautulli API");
        let client = self.client_for(config).await?.observed_by(tracker.clone());
        client.clear_cache().await;
        let retry = fetch_retry(config, params);
        let data = self
            .fetch_with_retry("user graph data", &retry, tracker, cancel, || {
                Self::fetch_user_data(&client, config, user_email, params.time_range_days)
            })
            .await?;

        Self::report_stage(tracker, CycleStage::ValidatingInput, "Validating fetched data");
        validate_input(&data, USER_DATASETS, tracker)?;

        Self::report_stage(tracker, CycleStage::GeneratingGraphs, "Generating user graphs");
        let output_dir = storage::user_graph_dir(&config.output.graph_dir, today(), user_email);
        let files = self
            .render(
                "User graph generation",
                data,
                output_dir,
                config.graphs.clone(),
                params.timeout,
                tracker,
                cancel,
            )
            .await?;

        self.validate_and_complete(files, tracker).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn render(
        &self,
        operation: &str,
        data: GraphData,
        output_dir: PathBuf,
        selection: GraphSelection,
        timeout: Duration,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let factory = self.factory.clone();
        let worker_tracker = tracker.clone();
        let worker_cancel = cancel.clone();
        offload(operation, timeout, tracker, cancel, move || {
            factory.generate_all(&data, &output_dir, &selection, &worker_tracker, &worker_cancel)
        })
        .await
    }

    async fn validate_and_complete(
        &self,
        files: Vec<PathBuf>,
        tracker: &ProgressTracker,
    ) -> Result<Vec<PathBuf>> {
        Self::report_stage(tracker, CycleStage::ValidatingOutput, "Validating generated files");
        let files = validate_output(files, tracker).await;
        Self::report_stage(
            tracker,
            CycleStage::Completed,
            &format!("Generated {} graphs", files.len()),
        );
        Ok(files)
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn fetch_retry(config: &Config, params: &CycleParams) -> RetryConfig {
    RetryConfig {
        max_retries: params.max_retries,
        ..config.pipeline.fetch_retry.clone()
    }
}

/// Apply the optional whole-cycle deadline
///
/// Dropping the stage future on expiry also aborts any pending backoff sleep.
async fn within_cycle_deadline<F>(
    limit: Option<Duration>,
    tracker: &ProgressTracker,
    stages: F,
) -> Result<Vec<PathBuf>>
where
    F: Future<Output = Result<Vec<PathBuf>>>,
{
    let Some(limit) = limit else {
        return stages.await;
    };
    match tokio::time::timeout(limit, stages).await {
        Ok(result) => result,
        Err(_) => {
            let error = Error::Timeout {
                operation: "Graph update cycle".to_string(),
                timeout: limit,
            };
            tracker.add_error(error.to_string());
            Err(error)
        }
    }
}

/// Normalize a cycle result and log the summary
///
/// Timeouts and pipeline errors pass through; anything else is wrapped in
/// [`Error::Pipeline`]. Validation failures were already recorded by the validator.
fn finish(
    operation: &str,
    result: Result<Vec<PathBuf>>,
    tracker: &ProgressTracker,
) -> Result<Vec<PathBuf>> {
    let result = match result {
        Ok(files) => Ok(files),
        Err(e @ (Error::Timeout { .. } | Error::Pipeline { .. })) => Err(e),
        Err(e @ Error::Validation(_)) => Err(Error::pipeline(
            "Invalid or insufficient data for graph generation",
            e,
        )),
        Err(e) => {
            tracker.add_error(format!("{operation} failed: {e}"));
            Err(Error::pipeline(format!("{operation} failed"), e))
        }
    };

    if let Err(e) = &result {
        error!(operation, error = %e, code = e.error_code(), "Cycle failed");
    }
    tracker.log_summary(operation);
    result
}
