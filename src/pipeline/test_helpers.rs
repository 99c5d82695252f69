//! Shared test helpers for building pipelines over scripted API responses.

use crate::client::TautulliClient;
use crate::client::tests::{ScriptedTransport, success};
use crate::config::{Config, RetryConfig};
use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::graphs::{Graph, GraphData, GraphFactory, GraphKind};
use crate::pipeline::{GraphPipeline, GraphPublisher};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Renderer that writes a small file named after its kind
pub(crate) struct FileGraph(pub(crate) GraphKind);

impl Graph for FileGraph {
    fn kind(&self) -> GraphKind {
        self.0
    }

    fn render(&self, data: &GraphData, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(format!("{}.png", self.0));
        std::fs::write(&path, format!("{} plays", data.play_records().len()))?;
        Ok(path)
    }
}

/// Renderer that always fails
pub(crate) struct FailingGraph(pub(crate) GraphKind);

impl Graph for FailingGraph {
    fn kind(&self) -> GraphKind {
        self.0
    }

    fn render(&self, _data: &GraphData, _output_dir: &Path) -> Result<PathBuf> {
        Err(Error::Other("renderer crashed".to_string()))
    }
}

/// Renderer that produces a zero-byte file
pub(crate) struct EmptyGraph(pub(crate) GraphKind);

impl Graph for EmptyGraph {
    fn kind(&self) -> GraphKind {
        self.0
    }

    fn render(&self, _data: &GraphData, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(format!("{}.png", self.0));
        std::fs::write(&path, b"")?;
        Ok(path)
    }
}

/// Renderer that blocks its thread before writing
pub(crate) struct SlowGraph {
    pub(crate) kind: GraphKind,
    pub(crate) delay: Duration,
}

impl Graph for SlowGraph {
    fn kind(&self) -> GraphKind {
        self.kind
    }

    fn render(&self, data: &GraphData, output_dir: &Path) -> Result<PathBuf> {
        std::thread::sleep(self.delay);
        FileGraph(self.kind).render(data, output_dir)
    }
}

/// Publisher that records what it was given
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    pub(crate) delivered: Mutex<Vec<PathBuf>>,
    pub(crate) fail: bool,
}

#[async_trait]
impl GraphPublisher for RecordingPublisher {
    async fn publish(&self, files: &[PathBuf]) -> Result<()> {
        if self.fail {
            return Err(Error::Other("channel not found".to_string()));
        }
        self.delivered.lock().unwrap().extend_from_slice(files);
        Ok(())
    }
}

/// Three working renderers
pub(crate) fn three_graphs() -> GraphFactory {
    GraphFactory::new()
        .with_graph(FileGraph(GraphKind::DailyPlayCount))
        .with_graph(FileGraph(GraphKind::PlayCountByDayOfWeek))
        .with_graph(FileGraph(GraphKind::Top10Platforms))
}

/// Valid config writing into `graph_dir`, with millisecond retry delays
pub(crate) fn test_config(graph_dir: &Path) -> Config {
    let mut config = Config::default();
    config.tautulli.api_key = "test-key".to_string();
    config.output.graph_dir = graph_dir.to_path_buf();
    config.request_retry.max_retries = 0;
    config.pipeline.fetch_retry = RetryConfig {
        max_retries: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Some(Duration::from_millis(10)),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// One short history page
pub(crate) fn history_page() -> serde_json::Value {
    success(json!({
        "data": [
            {"date": 1760745600, "user": "alice", "platform": "Chrome"},
            {"date": 1760832000, "user": "bob", "platform": "Roku"},
            {"date": 1760918400, "user": "alice", "platform": "Android"}
        ],
        "recordsFiltered": 3,
        "recordsTotal": 3
    }))
}

/// Monthly aggregate
pub(crate) fn monthly_plays() -> serde_json::Value {
    success(json!({
        "categories": ["2026-09", "2026-10"],
        "series": [{"name": "Movies", "data": [4, 9]}]
    }))
}

/// User listing containing alice
pub(crate) fn users() -> serde_json::Value {
    success(json!([
        {"user_id": 11, "email": "alice@example.com", "username": "alice"},
        {"user_id": 12, "email": "bob@example.com", "username": "bob"}
    ]))
}

/// Script a successful server-wide fetch
pub(crate) fn script_server_fetch(transport: &ScriptedTransport) {
    transport.push(Ok(history_page()));
    transport.push(Ok(monthly_plays()));
}

/// Build a pipeline over a scripted transport
pub(crate) fn create_test_pipeline(
    factory: GraphFactory,
    config: Config,
) -> (GraphPipeline, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::default());
    let client = Arc::new(TautulliClient::with_transport(
        transport.clone(),
        config.tautulli.api_key.clone(),
        config.request_retry.clone(),
    ));
    let pipeline = GraphPipeline::with_client(ConfigStore::new(config), factory, client);
    (pipeline, transport)
}
