//! Tautulli API client with response caching and timeout retry
//!
//! Every call is a GET against `<url>/api/v2` with `apikey`, `cmd` and the command
//! parameters in the query string. Successful payloads are cached per request
//! fingerprint for the lifetime of the client (or until [`TautulliClient::clear_cache`]).
//!
//! Only request timeouts are retried here; API errors and malformed bodies surface
//! immediately. Broader retry of a whole fetch happens in the orchestrator.

use crate::config::{Config, RetryConfig, TautulliConfig};
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::retry::{RetryAttempt, retry_when};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// JSON object payload returned by the API
pub type JsonMap = serde_json::Map<String, Value>;

/// A single query parameter value
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    /// Text parameter
    Str(String),
    /// Integer parameter
    Int(i64),
    /// Floating point parameter
    Float(f64),
    /// Boolean parameter (sent as 0/1)
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => f.write_str(s),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// An API command plus its parameters
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    command: String,
    parameters: BTreeMap<String, ParamValue>,
}

impl FetchRequest {
    /// Create a request for `command` without parameters
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a parameter, builder style
    pub fn param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    /// Add a parameter only when a value is present
    pub fn param_opt(self, name: &str, value: Option<impl Into<ParamValue>>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    /// API command name
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Parameters, ordered by name
    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.parameters
    }

    /// Deterministic fingerprint of command and parameters
    ///
    /// Parameters are hashed in name order, so insertion order never matters.
    pub fn cache_key(&self) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_bytes());
        for (name, value) in &self.parameters {
            hasher.update(b"\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
        }
        let digest = hasher.finalize();
        CacheKey(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Full query string pairs, credentials first
    fn query(&self, api_key: &str) -> Vec<(String, String)> {
        let mut query = Vec::with_capacity(self.parameters.len() + 2);
        query.push(("apikey".to_string(), api_key.to_string()));
        query.push(("cmd".to_string(), self.command.clone()));
        query.extend(
            self.parameters
                .iter()
                .map(|(name, value)| (name.clone(), value.to_string())),
        );
        query
    }
}

/// Request fingerprint used as cache key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Raw HTTP exchange with the API endpoint
///
/// Implementations return the decoded JSON body. Request timeouts must be reported as
/// [`Error::Transient`] so the client can retry them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one GET with the given query pairs
    async fn get(&self, query: &[(String, String)]) -> Result<Value>;
}

/// reqwest-backed [`Transport`]
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport for `endpoint` with a per-request timeout
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tgraph/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
        })
    }
}

fn classify(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Transient(format!("request timed out: {e}"))
    } else if e.is_decode() {
        Error::Format(format!("response body is not valid JSON: {e}"))
    } else {
        Error::Network(e)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, query: &[(String, String)]) -> Result<Value> {
        let response = self
            .http_client
            .get(&self.endpoint)
            .query(query)
            .send()
            .await
            .map_err(classify)?;

        let response = response.error_for_status().map_err(Error::Network)?;
        response.json::<Value>().await.map_err(classify)
    }
}

/// Cached, retrying client for the Tautulli API
///
/// Clones share the transport, cache and shutdown token.
#[derive(Clone)]
pub struct TautulliClient {
    transport: Arc<dyn Transport>,
    api_key: String,
    retry: RetryConfig,
    cache: Arc<RwLock<HashMap<CacheKey, Arc<JsonMap>>>>,
    shutdown: CancellationToken,
    observer: Option<Arc<ProgressTracker>>,
}

impl fmt::Debug for TautulliClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TautulliClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TautulliClient {
    /// Create a client talking HTTP to the configured server
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::connect(&config.tautulli, config.request_retry.clone())
    }

    /// Create a client from connection settings and a retry policy
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn connect(tautulli: &TautulliConfig, retry: RetryConfig) -> Result<Self> {
        let transport = HttpTransport::new(tautulli.api_endpoint(), tautulli.request_timeout)?;
        Ok(Self::with_transport(
            Arc::new(transport),
            tautulli.api_key.clone(),
            retry,
        ))
    }

    /// Create a client over an arbitrary transport
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        api_key: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            api_key: api_key.into(),
            retry,
            cache: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            observer: None,
        }
    }

    /// Handle sharing this client's cache whose timeout retries are recorded as
    /// warnings on `tracker`
    pub fn observed_by(&self, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            observer: Some(tracker),
            ..self.clone()
        }
    }

    /// Perform a request, serving repeats from the cache
    ///
    /// On a handle from [`observed_by`](Self::observed_by) every timeout retry is also
    /// recorded on the tracker.
    ///
    /// Returns the payload's `data` member: an object is returned as-is, a list is
    /// wrapped as `{"data": [...]}`, anything else becomes an empty object.
    ///
    /// # Errors
    /// - [`Error::Transient`] if every attempt timed out
    /// - [`Error::Api`] if the server answered `result: "error"`
    /// - [`Error::Format`] if the body is not shaped like an API response
    /// - [`Error::Cancelled`] if [`shutdown`](Self::shutdown) interrupted a backoff
    pub async fn request(&self, request: &FetchRequest) -> Result<Arc<JsonMap>> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.read().await.get(&key) {
            debug!(command = request.command(), "Cache hit");
            return Ok(hit.clone());
        }

        let query = request.query(&self.api_key);
        let body = retry_when(
            &self.retry,
            Some(&self.shutdown),
            |e: &Error| matches!(e, Error::Transient(_)),
            |attempt: &RetryAttempt<'_, Error>| {
                if let Some(tracker) = &self.observer {
                    tracker.add_warning(format!(
                        "Request {} attempt {}/{} failed: {}; retrying in {:.1}s",
                        request.command(),
                        attempt.attempt + 1,
                        attempt.max_retries + 1,
                        attempt.error,
                        attempt.delay.as_secs_f64()
                    ));
                }
            },
            || self.transport.get(&query),
        )
        .await?;

        let payload = Arc::new(extract_payload(request.command(), body)?);
        self.cache.write().await.insert(key, payload.clone());
        debug!(command = request.command(), "Fetched and cached response");
        Ok(payload)
    }

    /// Drop every cached response
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        let cleared = cache.len();
        cache.clear();
        info!(entries = cleared, "API cache cleared");
    }

    /// Number of cached responses
    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Abort pending backoff waits; later retries fail with [`Error::Cancelled`]
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Monthly play aggregate for the last `time_range_months` months
    ///
    /// # Errors
    /// See [`request`](Self::request)
    pub async fn get_plays_per_month(&self, time_range_months: u32) -> Result<Arc<JsonMap>> {
        self.request(
            &FetchRequest::new("get_plays_per_month").param("time_range", time_range_months),
        )
        .await
    }

    /// Details of a single user
    ///
    /// # Errors
    /// See [`request`](Self::request)
    pub async fn get_user(&self, user_id: i64) -> Result<Arc<JsonMap>> {
        self.request(&FetchRequest::new("get_user").param("user_id", user_id))
            .await
    }

    /// Every user known to the server (`{"data": [...]}`)
    ///
    /// # Errors
    /// See [`request`](Self::request)
    pub async fn get_users(&self) -> Result<Arc<JsonMap>> {
        self.request(&FetchRequest::new("get_users")).await
    }

    /// Library sections (`{"data": [...]}`)
    ///
    /// # Errors
    /// See [`request`](Self::request)
    pub async fn get_libraries(&self) -> Result<Arc<JsonMap>> {
        self.request(&FetchRequest::new("get_libraries")).await
    }

    /// Metadata of a single media item
    ///
    /// # Errors
    /// See [`request`](Self::request)
    pub async fn get_metadata(&self, rating_key: i64) -> Result<Arc<JsonMap>> {
        self.request(&FetchRequest::new("get_metadata").param("rating_key", rating_key))
            .await
    }

    /// Media items of a library section, highest resolution first
    ///
    /// # Errors
    /// See [`request`](Self::request)
    pub async fn get_library_media_info(&self, section_id: i64) -> Result<Arc<JsonMap>> {
        self.request(
            &FetchRequest::new("get_library_media_info")
                .param("section_id", section_id)
                .param("order_column", "video_resolution")
                .param("order_dir", "desc")
                .param("length", 1000u32),
        )
        .await
    }

    /// Find a user record by email (case-insensitive)
    ///
    /// # Errors
    /// See [`request`](Self::request)
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<JsonMap>> {
        let users = self.get_users().await?;
        let found = users
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object)
            .find(|user| {
                user.get("email")
                    .and_then(Value::as_str)
                    .is_some_and(|candidate| candidate.eq_ignore_ascii_case(email))
            })
            .cloned();
        Ok(found)
    }
}

/// Validate a response body and pull out its `data` member
fn extract_payload(command: &str, body: Value) -> Result<JsonMap> {
    let Value::Object(mut body) = body else {
        return Err(Error::Format(format!(
            "expected a JSON object for command '{command}'"
        )));
    };
    let Some(Value::Object(mut response)) = body.remove("response") else {
        return Err(Error::Format(format!(
            "missing 'response' object for command '{command}'"
        )));
    };

    if response.get("result").and_then(Value::as_str) == Some("error") {
        let message = response
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown API error")
            .to_string();
        return Err(Error::Api {
            command: command.to_string(),
            message,
        });
    }

    Ok(match response.remove("data") {
        Some(Value::Object(data)) => data,
        Some(Value::Array(items)) => {
            let mut wrapped = JsonMap::new();
            wrapped.insert("data".to_string(), Value::Array(items));
            wrapped
        }
        _ => JsonMap::new(),
    })
}
