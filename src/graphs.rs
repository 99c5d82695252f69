//! Rendering collaborator boundary
//!
//! Chart drawing itself lives outside this crate. A renderer implements [`Graph`] for
//! one chart type; [`GraphFactory`] owns the registered graphs and renders every
//! enabled one against a [`GraphData`] set on the calling (worker) thread.
//!
//! Graphs render independently: a failing or panicking graph is recorded on the
//! progress tracker and the remaining graphs still run.

use crate::config::GraphSelection;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dataset name: play history table (`{data, recordsFiltered, recordsTotal}`)
pub const PLAY_HISTORY: &str = "play_history";
/// Dataset name: monthly aggregate returned by `get_plays_per_month`
pub const MONTHLY_PLAYS: &str = "monthly_plays";
/// Dataset name: requested time range in days
pub const TIME_RANGE_DAYS: &str = "time_range_days";
/// Dataset name: requested time range in months
pub const TIME_RANGE_MONTHS: &str = "time_range_months";
/// Dataset name: user email (per-user cycles)
pub const USER_EMAIL: &str = "user_email";
/// Dataset name: Tautulli user id (per-user cycles)
pub const USER_ID: &str = "user_id";
/// Dataset name: user record from `get_users` (per-user cycles)
pub const USER_INFO: &str = "user_info";

/// Chart types known to the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphKind {
    /// Plays per day over the time range
    DailyPlayCount,
    /// Plays per weekday
    PlayCountByDayOfWeek,
    /// Plays per hour of day
    PlayCountByHourOfDay,
    /// Most used platforms
    Top10Platforms,
    /// Most active users
    Top10Users,
    /// Plays per month
    PlayCountByMonth,
}

impl GraphKind {
    /// Every graph kind, in generation order
    pub const ALL: [GraphKind; 6] = [
        GraphKind::DailyPlayCount,
        GraphKind::PlayCountByDayOfWeek,
        GraphKind::PlayCountByHourOfDay,
        GraphKind::Top10Platforms,
        GraphKind::Top10Users,
        GraphKind::PlayCountByMonth,
    ];

    /// Stable identifier, also used as the default file stem
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphKind::DailyPlayCount => "daily_play_count",
            GraphKind::PlayCountByDayOfWeek => "play_count_by_dayofweek",
            GraphKind::PlayCountByHourOfDay => "play_count_by_hourofday",
            GraphKind::Top10Platforms => "top_10_platforms",
            GraphKind::Top10Users => "top_10_users",
            GraphKind::PlayCountByMonth => "play_count_by_month",
        }
    }
}

impl fmt::Display for GraphKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named datasets handed to the renderers
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GraphData {
    datasets: serde_json::Map<String, Value>,
}

impl GraphData {
    /// Create an empty data set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a dataset, builder style
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Add or replace a dataset
    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.datasets.insert(name.to_string(), value.into());
    }

    /// Look up a dataset by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.datasets.get(name)
    }

    /// Whether a dataset is present
    pub fn contains(&self, name: &str) -> bool {
        self.datasets.contains_key(name)
    }

    /// All datasets keyed by name
    pub fn datasets(&self) -> &serde_json::Map<String, Value> {
        &self.datasets
    }

    /// Records of the play history dataset (empty if absent or malformed)
    pub fn play_records(&self) -> &[Value] {
        self.get(PLAY_HISTORY)
            .and_then(|history| history.get("data"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A single chart renderer
///
/// Implementations are synchronous and may be CPU heavy; they always run on a worker
/// thread, never on the async runtime.
pub trait Graph: Send + Sync {
    /// Which chart this renderer produces
    fn kind(&self) -> GraphKind;

    /// Render into `output_dir` and return the written file
    ///
    /// Empty datasets should produce a "no data" chart rather than an error.
    fn render(&self, data: &GraphData, output_dir: &Path) -> Result<PathBuf>;
}

/// Registry of renderers; renders the enabled subset for one cycle
#[derive(Clone, Default)]
pub struct GraphFactory {
    graphs: Vec<Arc<dyn Graph>>,
}

impl GraphFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a renderer, builder style
    pub fn with_graph(mut self, graph: impl Graph + 'static) -> Self {
        self.register(graph);
        self
    }

    /// Register a renderer
    pub fn register(&mut self, graph: impl Graph + 'static) {
        self.graphs.push(Arc::new(graph));
    }

    /// Number of registered renderers
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    /// Whether no renderer is registered
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Registered renderers whose kind is enabled in `selection`
    pub fn enabled_graphs(&self, selection: &GraphSelection) -> Vec<Arc<dyn Graph>> {
        self.graphs
            .iter()
            .filter(|graph| selection.is_enabled(graph.kind()))
            .cloned()
            .collect()
    }

    /// Render every enabled graph into `output_dir`
    ///
    /// Per-graph failures (errors and panics) are recorded on `tracker` and skipped.
    /// Once `cancel` fires no further graph is started; the graph being rendered at
    /// that moment runs to completion.
    ///
    /// # Errors
    /// Returns an error only if the output directory cannot be created.
    pub fn generate_all(
        &self,
        data: &GraphData,
        output_dir: &Path,
        selection: &GraphSelection,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create graph directory '{}': {}",
                    output_dir.display(),
                    e
                ),
            ))
        })?;

        let graphs = self.enabled_graphs(selection);
        debug!(
            enabled = graphs.len(),
            registered = self.graphs.len(),
            output_dir = %output_dir.display(),
            "Starting graph generation"
        );

        let mut generated = Vec::with_capacity(graphs.len());
        for graph in graphs {
            if cancel.is_cancelled() {
                warn!("Graph generation cancelled, skipping remaining graphs");
                break;
            }

            let kind = graph.kind();
            match catch_unwind(AssertUnwindSafe(|| graph.render(data, output_dir))) {
                Ok(Ok(path)) => {
                    debug!(graph = %kind, path = %path.display(), "Graph generated");
                    generated.push(path);
                }
                Ok(Err(e)) => {
                    tracker.add_error(format!("Failed to generate {kind}: {e}"));
                }
                Err(panic) => {
                    tracker.add_error(format!(
                        "Failed to generate {kind}: renderer panicked: {}",
                        panic_message(panic.as_ref())
                    ));
                }
            }
        }

        if generated.is_empty() {
            tracker.add_warning("No graphs were generated");
        } else {
            info!(count = generated.len(), "Generated graphs");
        }

        Ok(generated)
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
