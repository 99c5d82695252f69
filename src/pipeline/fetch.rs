//! Data collection with pipeline-level retry

use super::GraphPipeline;
use crate::client::TautulliClient;
use crate::config::{Config, RetryConfig};
use crate::error::{Error, Result};
use crate::graphs::{self, GraphData};
use crate::progress::ProgressTracker;
use crate::retry::{IsRetryable, RetryAttempt, retry_when};
use serde_json::Value;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::info;

impl GraphPipeline {
    /// Run `fetch`, retrying retryable failures per `retry`
    ///
    /// Each retry is recorded as a tracker warning. Exhaustion (or a non-retryable
    /// failure) is recorded as a tracker error and returned as [`Error::Pipeline`].
    pub(super) async fn fetch_with_retry<T, F, Fut>(
        &self,
        what: &str,
        retry: &RetryConfig,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
        mut fetch: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        let result = retry_when(
            retry,
            Some(cancel),
            |e: &Error| e.is_retryable(),
            |attempt: &RetryAttempt<'_, Error>| {
                tracker.add_warning(format!(
                    "Data fetch attempt {}/{} failed: {}; retrying in {:.1}s",
                    attempt.attempt + 1,
                    attempt.max_retries + 1,
                    attempt.error,
                    attempt.delay.as_secs_f64()
                ));
            },
            || {
                attempts += 1;
                fetch()
            },
        )
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                tracker.add_error(format!(
                    "Failed to fetch {what} after {attempts} attempt(s): {e}"
                ));
                Err(Error::pipeline(
                    format!("failed to fetch {what} after {attempts} attempts"),
                    e,
                ))
            }
        }
    }

    /// Play history plus monthly aggregate for the whole server
    pub(super) async fn fetch_server_data(
        client: &TautulliClient,
        config: &Config,
        time_range_days: u32,
    ) -> Result<GraphData> {
        let history = client
            .get_play_history(time_range_days, None, config.data.use_date_filtering)
            .await?;
        let monthly = client
            .get_plays_per_month(config.data.time_range_months)
            .await?;

        info!(
            records = history.records.len(),
            time_range_days, "Fetched server graph data"
        );

        Ok(GraphData::new()
            .with(graphs::PLAY_HISTORY, history.to_json())
            .with(graphs::MONTHLY_PLAYS, Value::Object((*monthly).clone()))
            .with(graphs::TIME_RANGE_DAYS, time_range_days)
            .with(graphs::TIME_RANGE_MONTHS, config.data.time_range_months))
    }

    /// User record plus that user's play history
    pub(super) async fn fetch_user_data(
        client: &TautulliClient,
        config: &Config,
        user_email: &str,
        time_range_days: u32,
    ) -> Result<GraphData> {
        let user_info = client
            .find_user_by_email(user_email)
            .await?
            .ok_or_else(|| Error::Validation(format!("User not found with email: {user_email}")))?;

        let user_id = user_id_of(&user_info).ok_or_else(|| {
            Error::Validation(format!("User record for {user_email} has no user_id"))
        })?;

        let history = client
            .get_play_history(time_range_days, Some(user_id), config.data.use_date_filtering)
            .await?;

        info!(
            user_id,
            records = history.records.len(),
            time_range_days, "Fetched user graph data"
        );

        Ok(GraphData::new()
            .with(graphs::PLAY_HISTORY, history.to_json())
            .with(graphs::USER_EMAIL, user_email)
            .with(graphs::USER_ID, user_id)
            .with(graphs::USER_INFO, Value::Object(user_info))
            .with(graphs::TIME_RANGE_DAYS, time_range_days))
    }
}

/// `user_id` as a number, accepting numeric strings
fn user_id_of(user: &serde_json::Map<String, Value>) -> Option<i64> {
    match user.get("user_id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
