//! Configuration types for tgraph
//!
//! [`Config`] is an immutable snapshot of every tunable parameter. It is loaded from a
//! YAML file, validated as a whole, and replaced wholesale whenever it changes (see
//! [`ConfigStore`](crate::config_store::ConfigStore)).

use crate::error::{Error, Result};
use crate::graphs::GraphKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// API key shipped in the sample configuration; rejected by [`Config::validate`]
pub const PLACEHOLDER_API_KEY: &str = "your_tautulli_api_key_here";

/// Tautulli connection settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TautulliConfig {
    /// Base URL of the Tautulli server (default: "http://localhost:8181")
    ///
    /// The `/api/v2` endpoint is appended unless the URL already ends with it.
    #[serde(default = "default_tautulli_url")]
    pub url: String,

    /// Tautulli API key
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for TautulliConfig {
    fn default() -> Self {
        Self {
            url: default_tautulli_url(),
            api_key: default_api_key(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl TautulliConfig {
    /// Full API endpoint, `<url>/api/v2`
    pub fn api_endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if base.ends_with("/api/v2") {
            base.to_string()
        } else {
            format!("{base}/api/v2")
        }
    }
}

/// Data collection and retention windows
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Time range in days for play history (1-365, default: 30)
    #[serde(default = "default_time_range_days")]
    pub time_range_days: u32,

    /// Time range in months for the monthly aggregate (1-60, default: 12)
    #[serde(default = "default_time_range_months")]
    pub time_range_months: u32,

    /// Number of days to keep generated graphs (1-365, default: 7)
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,

    /// Number of days between automatic updates (1-365, default: 7)
    #[serde(default = "default_update_days")]
    pub update_days: u32,

    /// Ask the API to pre-filter history by date, with a safety buffer (default: true)
    #[serde(default = "default_true")]
    pub use_date_filtering: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            time_range_days: default_time_range_days(),
            time_range_months: default_time_range_months(),
            keep_days: default_keep_days(),
            update_days: default_update_days(),
            use_date_filtering: true,
        }
    }
}

/// Where generated graphs are written
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root of the date-partitioned graph tree (default: "data/graphs")
    #[serde(default = "default_graph_dir")]
    pub graph_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            graph_dir: default_graph_dir(),
        }
    }
}

/// Per-graph enable flags
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSelection {
    /// Daily play count
    #[serde(default = "default_true")]
    pub daily_play_count: bool,
    /// Play count by day of week
    #[serde(default = "default_true")]
    pub play_count_by_dayofweek: bool,
    /// Play count by hour of day
    #[serde(default = "default_true")]
    pub play_count_by_hourofday: bool,
    /// Top 10 platforms
    #[serde(default = "default_true")]
    pub top_10_platforms: bool,
    /// Top 10 users
    #[serde(default = "default_true")]
    pub top_10_users: bool,
    /// Play count by month
    #[serde(default = "default_true")]
    pub play_count_by_month: bool,
}

impl Default for GraphSelection {
    fn default() -> Self {
        Self {
            daily_play_count: true,
            play_count_by_dayofweek: true,
            play_count_by_hourofday: true,
            top_10_platforms: true,
            top_10_users: true,
            play_count_by_month: true,
        }
    }
}

impl GraphSelection {
    /// Whether graphs of `kind` should be generated
    pub fn is_enabled(&self, kind: GraphKind) -> bool {
        match kind {
            GraphKind::DailyPlayCount => self.daily_play_count,
            GraphKind::PlayCountByDayOfWeek => self.play_count_by_dayofweek,
            GraphKind::PlayCountByHourOfDay => self.play_count_by_hourofday,
            GraphKind::Top10Platforms => self.top_10_platforms,
            GraphKind::Top10Users => self.top_10_users,
            GraphKind::PlayCountByMonth => self.play_count_by_month,
        }
    }
}

/// Retry configuration for transient failures
///
/// The delay before retry `n` (0-based) is `initial_delay * backoff_multiplier^n`,
/// optionally capped at `max_delay`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Ceiling for a single delay (default: none)
    #[serde(default, with = "optional_duration_serde")]
    pub max_delay: Option<Duration>,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: None,
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry `attempt` (0-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Orchestration settings: pipeline-level retry and bounded waits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retry policy wrapped around a whole data fetch (default: 3 retries, 30s cap)
    #[serde(default = "default_fetch_retry")]
    pub fetch_retry: RetryConfig,

    /// Deadline for server-wide graph generation (default: 300 seconds)
    #[serde(default = "default_generation_timeout", with = "duration_serde")]
    pub generation_timeout: Duration,

    /// Deadline for per-user graph generation (default: 180 seconds)
    #[serde(default = "default_user_generation_timeout", with = "duration_serde")]
    pub user_generation_timeout: Duration,

    /// Deadline for retention cleanup (default: 60 seconds)
    #[serde(default = "default_cleanup_timeout", with = "duration_serde")]
    pub cleanup_timeout: Duration,

    /// Optional deadline for a whole cycle, fetch retries included (default: none)
    #[serde(default, with = "optional_duration_serde")]
    pub cycle_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_retry: default_fetch_retry(),
            generation_timeout: default_generation_timeout(),
            user_generation_timeout: default_user_generation_timeout(),
            cleanup_timeout: default_cleanup_timeout(),
            cycle_timeout: None,
        }
    }
}

/// Main configuration snapshot
///
/// Fields are organized into logical sub-configs:
/// - [`tautulli`](TautulliConfig) - endpoint, credentials, request timeout
/// - [`data`](DataConfig) - time ranges and retention
/// - [`output`](OutputConfig) - graph directory
/// - [`graphs`](GraphSelection) - which graphs to render
/// - [`request_retry`](RetryConfig) - transport-level retry (timeouts only)
/// - [`pipeline`](PipelineConfig) - orchestration retry and deadlines
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tautulli connection settings
    #[serde(default)]
    pub tautulli: TautulliConfig,

    /// Data collection and retention windows
    #[serde(default)]
    pub data: DataConfig,

    /// Output locations
    #[serde(default)]
    pub output: OutputConfig,

    /// Graph selection
    #[serde(default)]
    pub graphs: GraphSelection,

    /// Transport-level retry for request timeouts
    #[serde(default)]
    pub request_retry: RetryConfig,

    /// Orchestration settings
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid YAML, or fails
    /// [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        let config = Self::from_yaml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration document without validating it
    ///
    /// An empty document yields the defaults. A document whose top level is not a
    /// mapping is rejected.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        match value {
            serde_yaml::Value::Null => Ok(Self::default()),
            serde_yaml::Value::Mapping(_) => Ok(serde_yaml::from_value(value)?),
            other => Err(Error::Config {
                message: format!(
                    "configuration file must contain a YAML mapping, got {}",
                    yaml_type_name(&other)
                ),
                key: None,
            }),
        }
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the configuration atomically (temporary file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_yaml()?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::config("path", format!("invalid config path: {}", path.display())))?;
        let temp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

        if let Err(e) = std::fs::write(&temp_path, content) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&temp_path, path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Validate value ranges and required settings
    pub fn validate(&self) -> Result<()> {
        let api_key = self.tautulli.api_key.trim();
        if api_key.is_empty() {
            return Err(Error::config("tautulli.api_key", "API key must not be empty"));
        }
        if api_key == PLACEHOLDER_API_KEY {
            return Err(Error::config(
                "tautulli.api_key",
                "API key is still the sample placeholder",
            ));
        }

        let url = url::Url::parse(&self.tautulli.url).map_err(|e| {
            Error::config("tautulli.url", format!("invalid URL '{}': {}", self.tautulli.url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config(
                "tautulli.url",
                format!("URL must use http or https, got '{}'", url.scheme()),
            ));
        }
        if self.tautulli.request_timeout.is_zero() {
            return Err(Error::config(
                "tautulli.request_timeout",
                "request timeout must be greater than zero",
            ));
        }

        check_range("data.time_range_days", self.data.time_range_days, 1, 365)?;
        check_range("data.time_range_months", self.data.time_range_months, 1, 60)?;
        check_range("data.keep_days", self.data.keep_days, 1, 365)?;
        check_range("data.update_days", self.data.update_days, 1, 365)?;

        for (key, retry) in [
            ("request_retry", &self.request_retry),
            ("pipeline.fetch_retry", &self.pipeline.fetch_retry),
        ] {
            if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
                return Err(Error::config(
                    &format!("{key}.backoff_multiplier"),
                    "backoff multiplier must be a finite number >= 1.0",
                ));
            }
        }

        for (key, timeout) in [
            ("pipeline.generation_timeout", self.pipeline.generation_timeout),
            (
                "pipeline.user_generation_timeout",
                self.pipeline.user_generation_timeout,
            ),
            ("pipeline.cleanup_timeout", self.pipeline.cleanup_timeout),
        ] {
            if timeout.is_zero() {
                return Err(Error::config(key, "timeout must be greater than zero"));
            }
        }

        Ok(())
    }

    /// Read-only flat projection, keyed by dotted path (e.g. `data.keep_days`)
    pub fn to_value_map(&self) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        if let Ok(value) = serde_json::to_value(self) {
            flatten_value("", &value, &mut map);
        }
        map
    }
}

fn flatten_value(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, serde_json::Value>) {
    match value {
        serde_json::Value::Object(fields) => {
            for (key, field) in fields {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_value(&path, field, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn check_range(key: &str, value: u32, min: u32, max: u32) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::config(
            key,
            format!("{key} must be between {min} and {max}, got {value}"),
        ))
    }
}

fn yaml_type_name(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "sequence",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged value",
    }
}

fn default_tautulli_url() -> String {
    "http://localhost:8181".to_string()
}

fn default_api_key() -> String {
    PLACEHOLDER_API_KEY.to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_time_range_days() -> u32 {
    30
}

fn default_time_range_months() -> u32 {
    12
}

fn default_keep_days() -> u32 {
    7
}

fn default_update_days() -> u32 {
    7
}

fn default_graph_dir() -> PathBuf {
    PathBuf::from("data").join("graphs")
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_fetch_retry() -> RetryConfig {
    RetryConfig {
        max_delay: Some(Duration::from_secs(30)),
        ..RetryConfig::default()
    }
}

fn default_generation_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_user_generation_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_cleanup_timeout() -> Duration {
    Duration::from_secs(60)
}

// Duration serialization helper (fractional seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
