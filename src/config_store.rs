//! Live configuration store
//!
//! [`ConfigStore`] holds the current [`Config`] snapshot behind a lock and hands out
//! `Arc` clones, so readers never see a half-applied change. Swaps notify registered
//! callbacks with the actual old/new pair after the new snapshot is visible.
//!
//! File monitoring watches the parent directory of the config file (editors often
//! replace files rather than writing in place), coalesces bursts of events with a
//! trailing-edge debounce, and reloads. A reload that fails to parse or validate is
//! logged and the last good snapshot stays in place.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::graphs::panic_message;
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Quiet period after the last file event before a reload
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Called with `(old, new)` after every successful swap
pub type ChangeCallback = Arc<dyn Fn(&Arc<Config>, &Arc<Config>) + Send + Sync>;

/// Handle returned by [`ConfigStore::register_change_callback`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct StoreState {
    current: Arc<Config>,
    callbacks: Vec<(CallbackId, ChangeCallback)>,
    next_callback_id: u64,
}

struct FileMonitor {
    path: PathBuf,
    // Dropping the watcher stops event delivery and closes the channel
    _watcher: RecommendedWatcher,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    monitor: Mutex<Option<FileMonitor>>,
    debounce: Duration,
}

/// Shared handle to the current configuration snapshot
///
/// Cloning is cheap; every clone refers to the same store.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("current", &self.get_current())
            .field("monitoring", &self.monitored_path())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConfigStore {
    /// Create a store holding `config`
    pub fn new(config: Config) -> Self {
        Self::with_debounce(config, DEFAULT_DEBOUNCE)
    }

    /// Create a store with a custom debounce window for file monitoring
    pub fn with_debounce(config: Config, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    current: Arc::new(config),
                    callbacks: Vec::new(),
                    next_callback_id: 0,
                }),
                monitor: Mutex::new(None),
                debounce,
            }),
        }
    }

    /// Load, validate and wrap a configuration file
    ///
    /// # Errors
    /// See [`Config::load`]
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(Config::load(path)?))
    }

    /// Current snapshot
    ///
    /// Repeated calls without an intervening swap return the same `Arc`.
    pub fn get_current(&self) -> Arc<Config> {
        lock(&self.inner.state).current.clone()
    }

    /// Replace the snapshot and notify callbacks
    ///
    /// Callbacks run on the calling thread, after the lock is released, in
    /// registration order. A panicking callback is logged and skipped.
    ///
    /// Returns the previous snapshot.
    pub fn update_runtime(&self, config: Config) -> Arc<Config> {
        let new = Arc::new(config);
        let (old, callbacks) = {
            let mut state = lock(&self.inner.state);
            let old = std::mem::replace(&mut state.current, new.clone());
            let callbacks: Vec<ChangeCallback> =
                state.callbacks.iter().map(|(_, cb)| cb.clone()).collect();
            (old, callbacks)
        };

        debug!(callbacks = callbacks.len(), "Configuration snapshot replaced");

        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&old, &new))) {
                error!(
                    "Configuration change callback panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }

        old
    }

    /// Load and validate `path`, then swap it in
    ///
    /// # Errors
    /// Returns the load or validation error; the current snapshot is left untouched.
    pub fn reload_from(&self, path: &Path) -> Result<Arc<Config>> {
        let config = Config::load(path)?;
        self.update_runtime(config);
        info!(path = %path.display(), "Configuration reloaded");
        Ok(self.get_current())
    }

    /// Register a callback for future swaps
    pub fn register_change_callback(
        &self,
        callback: impl Fn(&Arc<Config>, &Arc<Config>) + Send + Sync + 'static,
    ) -> CallbackId {
        let mut state = lock(&self.inner.state);
        let id = CallbackId(state.next_callback_id);
        state.next_callback_id += 1;
        state.callbacks.push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback; returns whether it was registered
    pub fn unregister_change_callback(&self, id: CallbackId) -> bool {
        let mut state = lock(&self.inner.state);
        let before = state.callbacks.len();
        state.callbacks.retain(|(existing, _)| *existing != id);
        state.callbacks.len() != before
    }

    /// Path currently being monitored, if any
    pub fn monitored_path(&self) -> Option<PathBuf> {
        lock(&self.inner.monitor)
            .as_ref()
            .map(|monitor| monitor.path.clone())
    }

    /// Watch `path` and reload it whenever it changes
    ///
    /// Replaces any previous monitor. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::FileWatch`] if the file's directory cannot be watched or no
    /// runtime is available.
    pub fn start_file_monitoring(&self, path: &Path) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::FileWatch(format!("file monitoring requires a Tokio runtime: {}", e))
        })?;

        let path = std::path::absolute(path)
            .map_err(|e| Error::FileWatch(format!("Invalid config path: {}", e)))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| Error::FileWatch(format!("Not a file path: {}", path.display())))?;
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::FileWatch(format!("No parent directory: {}", path.display())))?;

        self.stop_file_monitoring();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant && tx.send(()).is_err() {
                        debug!("Config reload loop has stopped, dropping event");
                    }
                }
                Err(e) => error!("Filesystem watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::FileWatch(e.to_string()))?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|e| Error::FileWatch(format!("Failed to watch config directory: {}", e)))?;

        let cancel = CancellationToken::new();
        let task = runtime.spawn(reload_loop(
            Arc::downgrade(&self.inner),
            path.clone(),
            rx,
            self.inner.debounce,
            cancel.clone(),
        ));

        info!(path = %path.display(), "Watching configuration file");
        *lock(&self.inner.monitor) = Some(FileMonitor {
            path,
            _watcher: watcher,
            cancel,
            task,
        });
        Ok(())
    }

    /// Stop monitoring; returns whether a monitor was active
    pub fn stop_file_monitoring(&self) -> bool {
        let monitor = lock(&self.inner.monitor).take();
        match monitor {
            Some(monitor) => {
                monitor.cancel.cancel();
                monitor.task.abort();
                info!(path = %monitor.path.display(), "Stopped watching configuration file");
                true
            }
            None => false,
        }
    }
}

/// Debounced reload loop; exits when cancelled, when the watcher is dropped, or when
/// the store itself is gone
async fn reload_loop(
    store: Weak<StoreInner>,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => if event.is_none() { return },
        }

        // Trailing edge: every new event restarts the quiet period
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => break,
                event = rx.recv() => if event.is_none() { return },
            }
        }

        let Some(inner) = store.upgrade() else {
            return;
        };
        let live = ConfigStore { inner };
        let reload_path = path.clone();
        match tokio::task::spawn_blocking(move || live.reload_from(&reload_path)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(
                path = %path.display(),
                error = %e,
                "Configuration reload failed, keeping current configuration"
            ),
            Err(e) => error!("Configuration reload task failed: {}", e),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config_with_range(days: u32) -> Config {
        let mut config = Config::default();
        config.tautulli.api_key = "abc123".to_string();
        config.data.time_range_days = days;
        config
    }

    #[test]
    fn repeated_reads_share_one_snapshot() {
        let store = ConfigStore::new(config_with_range(30));
        let a = store.get_current();
        let b = store.get_current();
        assert!(Arc::ptr_eq(&a, &b));

        store.update_runtime(config_with_range(60));
        let c = store.get_current();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.data.time_range_days, 60);
    }

    #[test]
    fn callbacks_receive_old_and_new() {
        let store = ConfigStore::new(config_with_range(30));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.register_change_callback(move |old, new| {
            sink.lock()
                .unwrap()
                .push((old.data.time_range_days, new.data.time_range_days));
        });

        store.update_runtime(config_with_range(60));
        store.update_runtime(config_with_range(90));

        assert_eq!(*seen.lock().unwrap(), vec![(30, 60), (60, 90)]);
    }

    #[test]
    fn unregistered_callbacks_stop_firing() {
        let store = ConfigStore::new(config_with_range(30));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let id = store.register_change_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.update_runtime(config_with_range(31));
        assert!(store.unregister_change_callback(id));
        assert!(!store.unregister_change_callback(id));
        store.update_runtime(config_with_range(32));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let store = ConfigStore::new(config_with_range(30));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        store.register_change_callback(|_, _| panic!("listener bug"));
        store.register_change_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.update_runtime(config_with_range(45));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_current().data.time_range_days, 45);
    }

    #[test]
    fn callback_may_read_the_store() {
        let store = ConfigStore::new(config_with_range(30));
        let observed = Arc::new(AtomicU32::new(0));
        let reader = store.clone();
        let sink = observed.clone();
        store.register_change_callback(move |_, new| {
            // New snapshot is already visible to readers
            let current = reader.get_current();
            assert!(Arc::ptr_eq(&current, new));
            sink.store(current.data.time_range_days, Ordering::SeqCst);
        });

        store.update_runtime(config_with_range(77));

        assert_eq!(observed.load(Ordering::SeqCst), 77);
    }

    #[test]
    fn concurrent_swaps_form_a_single_chain() {
        const WRITERS: u32 = 8;
        const PER_WRITER: u32 = 25;

        let store = ConfigStore::new(config_with_range(0));
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        store.register_change_callback(move |old, new| {
            sink.lock()
                .unwrap()
                .push((old.data.time_range_days, new.data.time_range_days));
        });

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        store.update_runtime(config_with_range(1 + w * PER_WRITER + i));
                        let _ = store.get_current();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let transitions = transitions.lock().unwrap();
        let total = (WRITERS * PER_WRITER) as usize;
        assert_eq!(transitions.len(), total);

        // Every swap replaced exactly the snapshot that was current before it
        let next: HashMap<u32, u32> = transitions.iter().copied().collect();
        assert_eq!(next.len(), total, "each snapshot is replaced at most once");
        let mut cursor = 0;
        let mut visited = 0;
        while let Some(&following) = next.get(&cursor) {
            cursor = following;
            visited += 1;
        }
        assert_eq!(visited, total);
        assert_eq!(store.get_current().data.time_range_days, cursor);
    }

    #[test]
    fn reload_rejects_invalid_file_and_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "data:\n  keep_days: 0\ntautulli:\n  api_key: abc\n").unwrap();
        let store = ConfigStore::new(config_with_range(30));

        assert!(store.reload_from(&path).is_err());
        assert_eq!(store.get_current().data.time_range_days, 30);
    }

    async fn wait_for_range(store: &ConfigStore, days: u32) -> bool {
        for _ in 0..100 {
            if store.get_current().data.time_range_days == days {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn file_changes_are_debounced_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        config_with_range(30).save(&path).unwrap();

        let store = ConfigStore::with_debounce(Config::load(&path).unwrap(), Duration::from_millis(200));
        let reloads = Arc::new(AtomicU32::new(0));
        let counter = reloads.clone();
        store.register_change_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.start_file_monitoring(&path).unwrap();
        assert_eq!(store.monitored_path(), Some(std::path::absolute(&path).unwrap()));

        // Burst of writes inside one debounce window
        for days in [40, 50, 60] {
            config_with_range(days).save(&path).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(wait_for_range(&store, 60).await, "reload never happened");
        let after_burst = reloads.load(Ordering::SeqCst);
        assert!(
            (1..=2).contains(&after_burst),
            "burst should coalesce, got {after_burst} reloads"
        );

        // Broken edit keeps the last good snapshot
        std::fs::write(&path, "tautulli: [not, a, mapping").unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(store.get_current().data.time_range_days, 60);

        assert!(store.stop_file_monitoring());
        assert!(!store.stop_file_monitoring());
        config_with_range(90).save(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.get_current().data.time_range_days, 60);
    }

    #[test]
    fn monitoring_requires_a_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let store = ConfigStore::new(config_with_range(30));

        assert!(matches!(
            store.start_file_monitoring(&path),
            Err(Error::FileWatch(_))
        ));
    }
}
