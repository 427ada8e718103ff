use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One engagement rating recorded by the feedback channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementRating {
    /// Row identifier (insertion order).
    pub id: i64,
    /// Rating between 0 and 5.
    pub rating: f64,
    /// Free-form comment, when the store keeps one.
    pub comment: Option<String>,
    /// Creation timestamp as stored (`YYYY-MM-DD HH:MM:SS`).
    pub created_at: Option<String>,
}

/// Failures reading the rating store. Never fatal for the display.
#[derive(Debug, Error)]
pub enum FeedbackError {
    /// Database file does not exist.
    #[error("DB file not found: {0}")]
    StoreMissing(PathBuf),
    /// Database exists but has no `feedback` table.
    #[error("Table 'feedback' not found")]
    MissingTable,
    /// Any other read failure (locked, corrupt, schema mismatch).
    #[error("DB read error: {0}")]
    Read(String),
}

impl From<rusqlite::Error> for FeedbackError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Read(err.to_string())
    }
}

/// Read-only view of the append-only rating store.
pub trait RatingStore: Send + Sync {
    /// Returns at most `window` ratings, newest first.
    fn recent(&self, window: usize) -> Result<Vec<EngagementRating>, FeedbackError>;
}

/// SQLite-backed store written by the feedback bot.
#[derive(Debug, Clone)]
pub struct SqliteRatingStore {
    path: PathBuf,
    budget: Duration,
}

impl SqliteRatingStore {
    /// Points at a database file; `budget` bounds how long a read waits on locks.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, budget: Duration) -> Self {
        Self {
            path: path.into(),
            budget,
        }
    }

    /// Database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, FeedbackError> {
        if !self.path.exists() {
            return Err(FeedbackError::StoreMissing(self.path.clone()));
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.budget)?;
        Ok(conn)
    }
}

impl RatingStore for SqliteRatingStore {
    fn recent(&self, window: usize) -> Result<Vec<EngagementRating>, FeedbackError> {
        let conn = self.open()?;
        let has_table = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name='feedback'",
                [],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !has_table {
            return Err(FeedbackError::MissingTable);
        }

        let columns = table_columns(&conn)?;
        let has = |name: &str| columns.iter().any(|column| column == name);
        let comment = if has("comment") { "comment" } else { "NULL" };
        let (created_at, order) = if has("created_at") {
            (
                "CAST(created_at AS TEXT)",
                "ORDER BY datetime(created_at) DESC, rowid DESC",
            )
        } else {
            ("NULL", "ORDER BY rowid DESC")
        };
        let sql = format!(
            "SELECT rowid, rating, {comment}, {created_at} FROM feedback {order} LIMIT ?1"
        );
        let limit = i64::try_from(window).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut ratings = Vec::new();
        for row in rows {
            let (id, rating, comment, created_at) = row?;
            if let Some(rating) = rating {
                ratings.push(EngagementRating {
                    id,
                    rating,
                    comment,
                    created_at,
                });
            }
        }
        Ok(ratings)
    }
}

fn table_columns(conn: &Connection) -> Result<Vec<String>, FeedbackError> {
    let mut stmt = conn.prepare("PRAGMA table_info(feedback)")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// In-memory store for tests and demo runs.
#[derive(Debug, Default)]
pub struct MemoryRatingStore {
    ratings: RwLock<Vec<EngagementRating>>,
    unavailable: RwLock<bool>,
}

impl MemoryRatingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rating; ids follow insertion order.
    pub fn push(&self, rating: f64, created_at: Option<&str>) {
        let mut ratings = self.ratings.write();
        let id = i64::try_from(ratings.len()).unwrap_or(i64::MAX) + 1;
        ratings.push(EngagementRating {
            id,
            rating,
            comment: None,
            created_at: created_at.map(str::to_string),
        });
    }

    /// Simulates an unreachable store.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }
}

impl RatingStore for MemoryRatingStore {
    fn recent(&self, window: usize) -> Result<Vec<EngagementRating>, FeedbackError> {
        if *self.unavailable.read() {
            return Err(FeedbackError::Read("store unavailable".into()));
        }
        let mut ratings = self.ratings.read().clone();
        // Timestamped rows first (newest first), then insertion order.
        ratings.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        ratings.truncate(window);
        Ok(ratings)
    }
}

/// Ratings window handed to the policy and the logging collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackWindow {
    /// Ratings, newest first.
    pub ratings: Vec<f64>,
    /// Mean of `ratings`; `None` when empty or unreadable.
    pub average: Option<f64>,
    /// Soft failure description.
    pub error: Option<String>,
}

/// Mean of the ratings, `None` for an empty slice.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rolling_average(ratings: &[f64]) -> Option<f64> {
    if ratings.is_empty() {
        None
    } else {
        Some(ratings.iter().sum::<f64>() / ratings.len() as f64)
    }
}

/// Pulls the recent window from a rating store.
#[derive(Clone)]
pub struct FeedbackAggregator {
    store: Arc<dyn RatingStore>,
}

impl std::fmt::Debug for FeedbackAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackAggregator").finish_non_exhaustive()
    }
}

impl FeedbackAggregator {
    /// Wraps a store.
    #[must_use]
    pub fn new(store: Arc<dyn RatingStore>) -> Self {
        Self { store }
    }

    /// Reads at most `window` ratings once; failures come back in `error`.
    #[must_use]
    pub fn recent_ratings(&self, window: usize) -> FeedbackWindow {
        match self.store.recent(window) {
            Ok(rows) => {
                let ratings: Vec<f64> = rows.into_iter().map(|row| row.rating).collect();
                FeedbackWindow {
                    average: rolling_average(&ratings),
                    ratings,
                    error: None,
                }
            }
            Err(err) => FeedbackWindow {
                ratings: Vec::new(),
                average: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bot_schema(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                rating INTEGER CHECK (rating BETWEEN 0 AND 5),
                comment TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn window_excludes_older_ratings() {
        let store = MemoryRatingStore::new();
        for rating in [1.0, 1.0, 5.0, 5.0, 5.0] {
            store.push(rating, None);
        }
        let window = FeedbackAggregator::new(Arc::new(store)).recent_ratings(3);
        assert_eq!(window.ratings, vec![5.0, 5.0, 5.0]);
        assert_eq!(window.average, Some(5.0));
        assert!(window.error.is_none());
    }

    #[test]
    fn empty_store_has_no_average() {
        let window = FeedbackAggregator::new(Arc::new(MemoryRatingStore::new())).recent_ratings(20);
        assert!(window.ratings.is_empty());
        assert_eq!(window.average, None);
        assert!(window.error.is_none());
    }

    #[test]
    fn unavailable_store_is_soft_failure() {
        let store = Arc::new(MemoryRatingStore::new());
        store.push(4.0, None);
        store.set_unavailable(true);
        let window = FeedbackAggregator::new(store).recent_ratings(20);
        assert_eq!(window.average, None);
        assert!(window.error.is_some());
    }

    #[test]
    fn sqlite_orders_by_created_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feedback.db");
        let conn = bot_schema(&path);
        conn.execute_batch(
            "INSERT INTO feedback (user_id, rating, comment, created_at) VALUES
                (1, 2, 'late insert, old stamp', '2025-01-01 08:00:00'),
                (1, 4, NULL, '2025-01-03 08:00:00'),
                (2, 3, 'nice', '2025-01-02 08:00:00'),
                (2, NULL, 'no rating', '2025-01-04 08:00:00');",
        )
        .unwrap();
        drop(conn);
        let store = SqliteRatingStore::new(&path, Duration::from_millis(50));
        let rows = store.recent(20).unwrap();
        let ratings: Vec<f64> = rows.iter().map(|row| row.rating).collect();
        assert_eq!(ratings, vec![4.0, 3.0, 2.0]);
        assert_eq!(rows[1].comment.as_deref(), Some("nice"));
        assert_eq!(rows[0].created_at.as_deref(), Some("2025-01-03 08:00:00"));
    }

    #[test]
    fn sqlite_falls_back_to_insertion_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE feedback (rating INTEGER);
             INSERT INTO feedback (rating) VALUES (1), (1), (5), (5), (5);",
        )
        .unwrap();
        drop(conn);
        let store = SqliteRatingStore::new(&path, Duration::from_millis(50));
        let aggregator = FeedbackAggregator::new(Arc::new(store));
        let window = aggregator.recent_ratings(3);
        assert_eq!(window.ratings, vec![5.0, 5.0, 5.0]);
        assert_eq!(window.average, Some(5.0));
    }

    #[test]
    fn sqlite_missing_file_and_table_are_reported() {
        let dir = tempdir().unwrap();
        let missing =
            SqliteRatingStore::new(dir.path().join("absent.db"), Duration::from_millis(10));
        assert!(matches!(missing.recent(5), Err(FeedbackError::StoreMissing(_))));

        let path = dir.path().join("empty.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE users (user_id INTEGER PRIMARY KEY);")
            .unwrap();
        let store = SqliteRatingStore::new(&path, Duration::from_millis(10));
        assert!(matches!(store.recent(5), Err(FeedbackError::MissingTable)));

        let window = FeedbackAggregator::new(Arc::new(store)).recent_ratings(5);
        assert_eq!(window.error.as_deref(), Some("Table 'feedback' not found"));
    }
}
