//! Date-partitioned graph storage
//!
//! Graphs are written to `<graph_dir>/<YYYY-MM-DD>/` and per-user graphs to
//! `<graph_dir>/<YYYY-MM-DD>/users/<sanitized id>/`. Retention cleanup removes whole
//! date directories once they are `keep_days` old.

use crate::error::Result;
use chrono::{Days, NaiveDate};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Subdirectory of a date directory holding per-user graphs
pub const USERS_DIR: &str = "users";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Make a user identifier (usually an email) safe for use as a directory name
///
/// `@` becomes `_at_`, `.` becomes `_`, and anything outside `[A-Za-z0-9_-]` becomes `_`.
pub fn sanitize_user_id(user_id: &str) -> String {
    let replaced = user_id.replace('@', "_at_").replace('.', "_");
    let sanitized: String = replaced
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

/// Directory for graphs generated on `date`
pub fn dated_graph_dir(graph_dir: &Path, date: NaiveDate) -> PathBuf {
    graph_dir.join(date.format(DATE_FORMAT).to_string())
}

/// Directory for a user's graphs generated on `date`
pub fn user_graph_dir(graph_dir: &Path, date: NaiveDate, user_id: &str) -> PathBuf {
    dated_graph_dir(graph_dir, date)
        .join(USERS_DIR)
        .join(sanitize_user_id(user_id))
}

/// Parse a date directory name; `None` for anything that is not `YYYY-MM-DD`
pub fn parse_date_dir(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name, DATE_FORMAT).ok()
}

/// Whether a directory dated `dir_date` is past retention
///
/// A directory expires once it is `keep_days` old: `dir_date <= today - keep_days`.
pub fn is_expired(dir_date: NaiveDate, today: NaiveDate, keep_days: u32) -> bool {
    match today.checked_sub_days(Days::new(u64::from(keep_days))) {
        Some(cutoff) => dir_date <= cutoff,
        None => false,
    }
}

/// Result of a retention pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Files removed
    pub files_deleted: usize,
    /// Directories removed
    pub dirs_removed: usize,
    /// Non-fatal problems (entries that could not be removed)
    pub warnings: Vec<String>,
}

/// Remove expired date directories below `graph_dir`
///
/// Entries that are not date directories are left alone. A missing `graph_dir` is not
/// an error.
///
/// # Errors
/// Returns an error only if `graph_dir` exists but cannot be listed.
pub fn cleanup_dated_graphs(
    graph_dir: &Path,
    keep_days: u32,
    today: NaiveDate,
) -> Result<CleanupOutcome> {
    let mut outcome = CleanupOutcome::default();
    for (date_dir, dir_date) in expired_date_dirs(graph_dir, keep_days, today)? {
        debug!(dir = %date_dir.display(), date = %dir_date, "Removing expired graph directory");
        remove_tree(&date_dir, &mut outcome);
    }

    info!(
        files_deleted = outcome.files_deleted,
        dirs_removed = outcome.dirs_removed,
        keep_days,
        "Graph retention cleanup finished"
    );
    Ok(outcome)
}

/// Remove a single user's graphs from expired date directories
///
/// Other users' graphs and server graphs are not touched. Date directories left empty
/// are removed as well.
///
/// # Errors
/// Returns an error only if `graph_dir` exists but cannot be listed.
pub fn cleanup_user_dated_graphs(
    graph_dir: &Path,
    user_id: &str,
    keep_days: u32,
    today: NaiveDate,
) -> Result<CleanupOutcome> {
    let sanitized = sanitize_user_id(user_id);
    let mut outcome = CleanupOutcome::default();
    for (date_dir, _) in expired_date_dirs(graph_dir, keep_days, today)? {
        let users_dir = date_dir.join(USERS_DIR);
        let user_dir = users_dir.join(&sanitized);
        if user_dir.is_dir() {
            remove_tree(&user_dir, &mut outcome);
            remove_if_empty(&users_dir, &mut outcome);
            remove_if_empty(&date_dir, &mut outcome);
        }
    }
    Ok(outcome)
}

/// Delete specific files (e.g. graphs that were already delivered)
///
/// Missing files are skipped silently; other failures are logged and reported as
/// warnings.
pub fn delete_files(paths: &[PathBuf]) -> CleanupOutcome {
    let mut outcome = CleanupOutcome::default();
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => outcome.files_deleted += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete graph file");
                outcome
                    .warnings
                    .push(format!("Failed to delete {}: {}", path.display(), e));
            }
        }
    }
    outcome
}

fn expired_date_dirs(
    graph_dir: &Path,
    keep_days: u32,
    today: NaiveDate,
) -> Result<Vec<(PathBuf, NaiveDate)>> {
    let entries = match std::fs::read_dir(graph_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut expired = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(dir_date) = name.to_str().and_then(parse_date_dir) else {
            continue;
        };
        if is_expired(dir_date, today, keep_days) {
            expired.push((entry.path(), dir_date));
        }
    }
    expired.sort_by_key(|(_, date)| *date);
    Ok(expired)
}

/// Depth-first removal that keeps going past individual failures
fn remove_tree(dir: &Path, outcome: &mut CleanupOutcome) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            outcome
                .warnings
                .push(format!("Failed to read {}: {}", dir.display(), e));
            return;
        }
    };

    for entry in entries {
        let Some(entry) = entry_or_warn(entry, dir, outcome) else {
            continue;
        };
        let path = entry.path();
        let Some(file_type) = entry_or_warn(entry.file_type(), &path, outcome) else {
            continue;
        };
        if file_type.is_dir() {
            remove_tree(&path, outcome);
        } else {
            match std::fs::remove_file(&path) {
                Ok(()) => outcome.files_deleted += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete graph file");
                    outcome
                        .warnings
                        .push(format!("Failed to delete {}: {}", path.display(), e));
                }
            }
        }
    }

    remove_if_empty(dir, outcome);
}

/// Unwrap a directory listing result, recording a failure as a warning
fn entry_or_warn<T>(
    entry: io::Result<T>,
    path: &Path,
    outcome: &mut CleanupOutcome,
) -> Option<T> {
    match entry {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read directory entry");
            outcome
                .warnings
                .push(format!("Failed to read entry in {}: {}", path.display(), e));
            None
        }
    }
}

fn remove_if_empty(dir: &Path, outcome: &mut CleanupOutcome) {
    let is_empty = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if !is_empty {
        return;
    }
    match std::fs::remove_dir(dir) {
        Ok(()) => outcome.dirs_removed += 1,
        Err(e) => outcome
            .warnings
            .push(format!("Failed to remove directory {}: {}", dir.display(), e)),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date_dir(s).unwrap()
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"png").unwrap();
    }

    #[test]
    fn sanitizes_emails() {
        assert_eq!(sanitize_user_id("john.doe@example.com"), "john_doe_at_example_com");
        assert_eq!(sanitize_user_id("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_user_id(""), "unknown");
    }

    #[test]
    fn builds_partitioned_paths() {
        let root = Path::new("data/graphs");
        let day = date("2026-10-18");

        assert_eq!(dated_graph_dir(root, day), Path::new("data/graphs/2026-10-18"));
        assert_eq!(
            user_graph_dir(root, day, "a@b.io"),
            Path::new("data/graphs/2026-10-18/users/a_at_b_io")
        );
    }

    #[test]
    fn expiry_is_inclusive_of_the_cutoff() {
        let today = date("2026-10-18");

        assert!(is_expired(date("2026-10-11"), today, 7));
        assert!(is_expired(date("2026-09-01"), today, 7));
        assert!(!is_expired(date("2026-10-12"), today, 7));
        assert!(!is_expired(today, today, 7));
    }

    #[test]
    fn cleanup_removes_only_expired_date_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("2026-10-01/daily_play_count.png"));
        touch(&root.join("2026-10-01/users/a_at_b_io/top_10_platforms.png"));
        touch(&root.join("2026-10-11/daily_play_count.png"));
        touch(&root.join("2026-10-17/daily_play_count.png"));
        touch(&root.join("not-a-date/keep.png"));
        touch(&root.join("2026-01-01.png"));

        let outcome = cleanup_dated_graphs(root, 7, date("2026-10-18")).unwrap();

        assert_eq!(outcome.files_deleted, 3);
        assert!(outcome.warnings.is_empty());
        assert!(!root.join("2026-10-01").exists());
        assert!(!root.join("2026-10-11").exists());
        assert!(root.join("2026-10-17/daily_play_count.png").exists());
        assert!(root.join("not-a-date/keep.png").exists());
        assert!(root.join("2026-01-01.png").exists());
    }

    #[test]
    fn cleanup_of_missing_root_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = cleanup_dated_graphs(&dir.path().join("missing"), 7, date("2026-10-18")).unwrap();
        assert_eq!(outcome, CleanupOutcome::default());
    }

    #[test]
    fn user_cleanup_leaves_other_users_alone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("2026-10-01/users/a_at_b_io/daily_play_count.png"));
        touch(&root.join("2026-10-01/users/c_at_d_io/daily_play_count.png"));
        touch(&root.join("2026-10-02/users/a_at_b_io/daily_play_count.png"));

        let outcome =
            cleanup_user_dated_graphs(root, "a@b.io", 7, date("2026-10-18")).unwrap();

        assert_eq!(outcome.files_deleted, 2);
        assert!(root.join("2026-10-01/users/c_at_d_io/daily_play_count.png").exists());
        assert!(!root.join("2026-10-01/users/a_at_b_io").exists());
        assert!(!root.join("2026-10-02").exists());
    }

    #[test]
    fn unreadable_entries_become_warnings() {
        let mut outcome = CleanupOutcome::default();
        let dir = Path::new("/graphs/2026-10-01");

        let entry: Option<u32> =
            entry_or_warn(Err(io::Error::other("stale handle")), dir, &mut outcome);
        let ok = entry_or_warn(Ok(5u32), dir, &mut outcome);

        assert_eq!(entry, None);
        assert_eq!(ok, Some(5));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("2026-10-01"));
        assert!(outcome.warnings[0].contains("stale handle"));
    }

    #[test]
    fn delete_files_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.png");
        touch(&present);

        let outcome = delete_files(&[present.clone(), dir.path().join("gone.png")]);

        assert_eq!(outcome.files_deleted, 1);
        assert!(outcome.warnings.is_empty());
        assert!(!present.exists());
    }
}
