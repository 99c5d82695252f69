//! Input shape checks and output file checks

use crate::error::{Error, Result};
use crate::graphs::{self, GraphData};
use crate::progress::ProgressTracker;
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

/// Expected JSON shape of a required dataset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Shape {
    /// JSON object
    Object,
    /// JSON string
    Text,
    /// Any non-null value
    Present,
}

impl Shape {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Shape::Object => value.is_object(),
            Shape::Text => value.is_string(),
            Shape::Present => !value.is_null(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Shape::Object => "an object",
            Shape::Text => "a string",
            Shape::Present => "a value",
        }
    }
}

/// Datasets a server-wide cycle needs
pub(super) const SERVER_DATASETS: &[(&str, Shape)] = &[
    (graphs::PLAY_HISTORY, Shape::Object),
    (graphs::MONTHLY_PLAYS, Shape::Object),
];

/// Datasets a per-user cycle needs
pub(super) const USER_DATASETS: &[(&str, Shape)] = &[
    (graphs::PLAY_HISTORY, Shape::Object),
    (graphs::USER_EMAIL, Shape::Text),
    (graphs::USER_ID, Shape::Present),
    (graphs::USER_INFO, Shape::Object),
];

/// Check that every required dataset is present with the right shape
///
/// Structural problems are recorded on `tracker` and returned as
/// [`Error::Validation`]. Empty play history or monthly data only produces warnings.
pub(super) fn validate_input(
    data: &GraphData,
    required: &[(&str, Shape)],
    tracker: &ProgressTracker,
) -> Result<()> {
    for (name, shape) in required {
        let problem = match data.get(name) {
            None => Some(format!("Missing required dataset: {name}")),
            Some(value) if !shape.matches(value) => {
                Some(format!("Dataset {name} must be {}", shape.describe()))
            }
            Some(_) => None,
        };
        if let Some(problem) = problem {
            tracker.add_error(problem.clone());
            return Err(Error::Validation(problem));
        }
    }

    if data.play_records().is_empty() {
        tracker.add_warning("Play history is empty - graphs may show no data");
    }
    let monthly_is_empty = data
        .get(graphs::MONTHLY_PLAYS)
        .and_then(Value::as_object)
        .is_some_and(|monthly| monthly.is_empty());
    if monthly_is_empty {
        tracker.add_warning("Monthly play data is empty");
    }

    debug!(datasets = data.datasets().len(), "Input data validated");
    Ok(())
}

/// Keep only generated files that exist, are regular files and are not empty
///
/// Missing paths and non-files are recorded as errors and dropped. Zero-byte files
/// are recorded as warnings and dropped.
pub(super) async fn validate_output(files: Vec<PathBuf>, tracker: &ProgressTracker) -> Vec<PathBuf> {
    let mut valid = Vec::with_capacity(files.len());
    for path in files {
        match tokio::fs::metadata(&path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracker.add_error(format!("Generated file does not exist: {}", path.display()));
            }
            Err(e) => {
                tracker.add_error(format!("Error validating {}: {}", path.display(), e));
            }
            Ok(meta) if !meta.is_file() => {
                tracker.add_error(format!(
                    "Generated path is not a file: {}",
                    path.display()
                ));
            }
            Ok(meta) if meta.len() == 0 => {
                tracker.add_warning(format!("Generated file is empty: {}", path.display()));
            }
            Ok(_) => valid.push(path),
        }
    }
    valid
}
