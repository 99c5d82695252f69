//! Paginated play history retrieval
//!
//! `get_history` is served in pages of [`PAGE_SIZE`] records. The fetcher walks pages
//! by offset until a short page arrives, optionally asking the server to pre-filter
//! by date. The date bound includes a safety buffer so records near the edge of the
//! requested range are never dropped by the server.

use crate::client::{FetchRequest, TautulliClient};
use crate::error::Result;
use chrono::{Days, Local, NaiveDate};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// Records requested per page
pub const PAGE_SIZE: u32 = 1000;

/// Ranges up to this many days stop early once [`SHORT_RANGE_RECORD_LIMIT`] is reached
pub const SHORT_RANGE_DAYS: u32 = 7;

/// Record count that ends pagination for short ranges
pub const SHORT_RANGE_RECORD_LIMIT: usize = 500;

/// Safety buffer (in days) added to the date filter for a given range
///
/// - up to 30 days: 7
/// - 31 to 90 days: 14
/// - above 90 days: 30
pub fn calculate_buffer_size(time_range_days: u32) -> u32 {
    if time_range_days <= 30 {
        7
    } else if time_range_days <= 90 {
        14
    } else {
        30
    }
}

/// Lower date bound (`YYYY-MM-DD`) for the `after` parameter
///
/// The bound is `today - (time_range_days + buffer)`.
pub fn calculate_api_date_filter(time_range_days: u32, today: NaiveDate) -> String {
    let total_days = u64::from(time_range_days) + u64::from(calculate_buffer_size(time_range_days));
    today
        .checked_sub_days(Days::new(total_days))
        .unwrap_or(NaiveDate::MIN)
        .format("%Y-%m-%d")
        .to_string()
}

/// Concatenated history records with the server-reported counts of the last page
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayHistory {
    /// Records in server order
    pub records: Vec<Value>,
    /// `recordsFiltered` as reported by the last page
    pub records_filtered: u64,
    /// `recordsTotal` as reported by the last page
    pub records_total: u64,
}

impl PlayHistory {
    /// JSON shape handed to the renderers
    pub fn to_json(&self) -> Value {
        json!({
            "data": self.records,
            "recordsFiltered": self.records_filtered,
            "recordsTotal": self.records_total,
        })
    }

    /// Whether no record was returned
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pagination cursor
#[derive(Debug)]
struct PageState {
    offset: u32,
    pages: u32,
    history: PlayHistory,
}

impl PageState {
    fn new() -> Self {
        Self {
            offset: 0,
            pages: 0,
            history: PlayHistory::default(),
        }
    }

    /// Absorb a page; returns whether another page should be requested
    fn absorb(&mut self, page: Vec<Value>, time_range_days: u32) -> bool {
        let page_items = page.len();
        self.pages += 1;
        self.offset = self.offset.saturating_add(PAGE_SIZE);
        self.history.records.extend(page);

        if page_items < PAGE_SIZE as usize {
            return false;
        }
        if time_range_days <= SHORT_RANGE_DAYS
            && self.history.records.len() >= SHORT_RANGE_RECORD_LIMIT
        {
            debug!(
                records = self.history.records.len(),
                time_range_days, "Stopping pagination early for short time range"
            );
            return false;
        }
        true
    }
}

impl TautulliClient {
    /// Fetch the complete play history for the last `time_range_days` days
    ///
    /// # Arguments
    /// * `time_range_days` - Range forwarded as `time_range`
    /// * `user_id` - Restrict to a single user
    /// * `use_date_filtering` - Send an `after` bound (range plus safety buffer)
    ///
    /// # Errors
    /// Propagates the first failing page request.
    pub async fn get_play_history(
        &self,
        time_range_days: u32,
        user_id: Option<i64>,
        use_date_filtering: bool,
    ) -> Result<PlayHistory> {
        self.get_play_history_as_of(
            time_range_days,
            user_id,
            use_date_filtering,
            Local::now().date_naive(),
        )
        .await
    }

    /// [`get_play_history`](Self::get_play_history) with an explicit "today"
    ///
    /// # Errors
    /// Propagates the first failing page request.
    pub async fn get_play_history_as_of(
        &self,
        time_range_days: u32,
        user_id: Option<i64>,
        use_date_filtering: bool,
        today: NaiveDate,
    ) -> Result<PlayHistory> {
        let after = use_date_filtering.then(|| calculate_api_date_filter(time_range_days, today));
        let mut state = PageState::new();

        loop {
            let request = FetchRequest::new("get_history")
                .param("length", PAGE_SIZE)
                .param("start", state.offset)
                .param("time_range", time_range_days)
                .param_opt("user_id", user_id)
                .param_opt("after", after.clone());

            let payload = self.request(&request).await?;

            if let Some(filtered) = payload.get("recordsFiltered").and_then(Value::as_u64) {
                state.history.records_filtered = filtered;
            }
            if let Some(total) = payload.get("recordsTotal").and_then(Value::as_u64) {
                state.history.records_total = total;
            }

            let page = match payload.get("data") {
                Some(Value::Array(items)) => items.clone(),
                _ => {
                    warn!(
                        offset = state.offset,
                        "History page has no record list, stopping pagination"
                    );
                    break;
                }
            };

            if !state.absorb(page, time_range_days) {
                break;
            }
        }

        info!(
            records = state.history.records.len(),
            pages = state.pages,
            time_range_days,
            user_id = ?user_id,
            "Fetched play history"
        );
        Ok(state.history)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{ScriptedTransport, fast_retry, success};
    use std::sync::Arc;

    fn page(count: usize, start: usize) -> Value {
        let records: Vec<Value> = (start..start + count)
            .map(|i| json!({"row_id": i, "user": "alice"}))
            .collect();
        success(json!({
            "data": records,
            "recordsFiltered": 2500,
            "recordsTotal": 9000,
        }))
    }

    fn query_value<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
        query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn buffer_is_a_step_function() {
        for days in 1..=30 {
            assert_eq!(calculate_buffer_size(days), 7, "days={days}");
        }
        for days in 31..=90 {
            assert_eq!(calculate_buffer_size(days), 14, "days={days}");
        }
        for days in [91, 180, 365, 1000] {
            assert_eq!(calculate_buffer_size(days), 30, "days={days}");
        }
    }

    #[test]
    fn date_filter_subtracts_range_plus_buffer() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();

        assert_eq!(calculate_api_date_filter(30, today), "2026-09-11");
        assert_eq!(calculate_api_date_filter(60, today), "2026-08-05");
        assert_eq!(calculate_api_date_filter(365, today), "2025-09-18");
    }

    #[tokio::test]
    async fn walks_pages_until_short_page() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(page(1000, 0)));
        transport.push(Ok(page(1000, 1000)));
        transport.push(Ok(page(500, 2000)));
        let client = TautulliClient::with_transport(transport.clone(), "key", fast_retry());
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();

        let history = client
            .get_play_history_as_of(90, None, true, today)
            .await
            .unwrap();

        assert_eq!(history.records.len(), 2500);
        assert_eq!(history.records[1500]["row_id"], 1500);
        assert_eq!(history.records_filtered, 2500);
        assert_eq!(history.records_total, 9000);
        assert_eq!(transport.call_count(), 3);

        let calls = transport.calls.lock().unwrap();
        let offsets: Vec<_> = calls
            .iter()
            .map(|query| query_value(query, "start").unwrap().to_string())
            .collect();
        assert_eq!(offsets, vec!["0", "1000", "2000"]);
        // 90 days plus the 14 day buffer
        let after = today.checked_sub_days(Days::new(104)).unwrap();
        assert_eq!(after.to_string(), "2026-07-06");
        assert!(calls.iter().all(|query| query_value(query, "after") == Some("2026-07-06")));
        assert_eq!(query_value(&calls[0], "time_range"), Some("90"));
        assert_eq!(query_value(&calls[0], "length"), Some("1000"));
        assert_eq!(query_value(&calls[0], "cmd"), Some("get_history"));
    }

    #[tokio::test]
    async fn short_range_stops_early() {
        let transport = Arc::new(ScriptedTransport::default());
        for i in 0..5 {
            transport.push(Ok(page(1000, i * 1000)));
        }
        let client = TautulliClient::with_transport(transport.clone(), "key", fast_retry());

        let history = client.get_play_history(7, None, false).await.unwrap();

        assert!(transport.call_count() <= 2);
        assert!(history.records.len() >= SHORT_RANGE_RECORD_LIMIT);
    }

    #[tokio::test]
    async fn user_filter_and_no_date_bound() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(page(3, 0)));
        let client = TautulliClient::with_transport(transport.clone(), "key", fast_retry());

        let history = client.get_play_history(30, Some(42), false).await.unwrap();

        assert_eq!(history.records.len(), 3);
        let calls = transport.calls.lock().unwrap();
        assert_eq!(query_value(&calls[0], "user_id"), Some("42"));
        assert_eq!(query_value(&calls[0], "after"), None);
    }

    #[tokio::test]
    async fn missing_record_list_ends_pagination() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(success(json!({"recordsFiltered": 0}))));
        let client = TautulliClient::with_transport(transport.clone(), "key", fast_retry());

        let history = client.get_play_history(30, None, true).await.unwrap();

        assert!(history.is_empty());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_page_propagates() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(page(1000, 0)));
        transport.push(Ok(json!({"response": {"result": "error", "message": "Database locked"}})));
        let client = TautulliClient::with_transport(transport, "key", fast_retry());

        let result = client.get_play_history(30, None, false).await;

        assert!(matches!(result, Err(crate::Error::Api { .. })));
    }
}
