//! Configurations, renderers and publishers shared by the integration tests

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tgraph::{
    Config, Graph, GraphData, GraphFactory, GraphKind, GraphPublisher, Result, RetryConfig,
};

/// API key the mock server expects
pub const API_KEY: &str = "integration-key";

/// Valid configuration pointing at `url` and writing into `graph_dir`
///
/// Retry delays are in milliseconds so exhausted retries finish quickly.
pub fn test_config(url: &str, graph_dir: &Path) -> Config {
    let mut config = Config::default();
    config.tautulli.url = url.to_string();
    config.tautulli.api_key = API_KEY.to_string();
    config.tautulli.request_timeout = Duration::from_secs(5);
    config.output.graph_dir = graph_dir.to_path_buf();
    config.request_retry = RetryConfig {
        max_retries: 0,
        ..quick_retry()
    };
    config.pipeline.fetch_retry = quick_retry();
    config
}

fn quick_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_delay: Duration::from_millis(5),
        max_delay: Some(Duration::from_millis(20)),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Renderer writing a text file with the number of plays it was given
pub struct CountingGraph(pub GraphKind);

impl Graph for CountingGraph {
    fn kind(&self) -> GraphKind {
        self.0
    }

    fn render(&self, data: &GraphData, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(format!("{}.png", self.0));
        std::fs::write(&path, data.play_records().len().to_string())?;
        Ok(path)
    }
}

/// Factory with a renderer for every graph kind
pub fn all_graphs() -> GraphFactory {
    GraphKind::ALL
        .into_iter()
        .fold(GraphFactory::new(), |factory, kind| {
            factory.with_graph(CountingGraph(kind))
        })
}

/// Publisher that remembers each delivery
#[derive(Default)]
pub struct CollectingPublisher {
    /// One entry per `publish` call
    pub deliveries: Mutex<Vec<Vec<PathBuf>>>,
}

#[async_trait]
impl GraphPublisher for CollectingPublisher {
    async fn publish(&self, files: &[PathBuf]) -> Result<()> {
        self.deliveries
            .lock()
            .map_err(|e| tgraph::Error::Other(e.to_string()))?
            .push(files.to_vec());
        Ok(())
    }
}
