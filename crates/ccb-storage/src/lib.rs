//! Persistence for canonical bug rows: the `BugStore` contract, a PostgreSQL
//! implementation and an in-memory implementation used by tests and dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ccb_core::CanonicalBugRow;
use thiserror::Error;
use tokio::sync::Mutex;

mod postgres;

pub use postgres::{PgBugStore, MIGRATOR};

pub const CRATE_NAME: &str = "ccb-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to store: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("bug {0} is already stored")]
    DuplicateBug(i32),
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Storage for [`CanonicalBugRow`]s keyed by `bug_id`.
///
/// Every write commits on its own. `replace` deletes the stored row for the
/// bug and inserts the new one; it is the only way a stored row changes.
#[async_trait]
pub trait BugStore: Send + Sync {
    /// Insert a row; fails with [`StoreError::DuplicateBug`] if the id is taken.
    async fn insert(&self, row: &CanonicalBugRow) -> Result<(), StoreError>;

    async fn get(&self, bug_id: i32) -> Result<Option<CanonicalBugRow>, StoreError>;

    async fn replace(&self, row: &CanonicalBugRow) -> Result<(), StoreError>;

    /// Rows with `target > '5'` (text comparison).
    async fn active_target_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError>;

    /// Closed, high impact rows whose closed loop is still open.
    async fn closed_loop_pending_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError>;

    /// Rows with `target >= '5'`, newest report first.
    async fn published_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Release the underlying connection(s).
    async fn close(&self) {}
}

#[derive(Debug, Default)]
pub struct MemoryBugStore {
    rows: Mutex<BTreeMap<i32, CanonicalBugRow>>,
}

impl MemoryBugStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = CanonicalBugRow>) -> Self {
        Self {
            rows: Mutex::new(rows.into_iter().map(|r| (r.bug_id, r)).collect()),
        }
    }

    pub async fn snapshot(&self) -> Vec<CanonicalBugRow> {
        self.rows.lock().await.values().cloned().collect()
    }

    async fn select(&self, keep: impl Fn(&CanonicalBugRow) -> bool) -> Vec<CanonicalBugRow> {
        self.rows
            .lock()
            .await
            .values()
            .filter(|row| keep(row))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BugStore for MemoryBugStore {
    async fn insert(&self, row: &CanonicalBugRow) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&row.bug_id) {
            return Err(StoreError::DuplicateBug(row.bug_id));
        }
        rows.insert(row.bug_id, row.clone());
        Ok(())
    }

    async fn get(&self, bug_id: i32) -> Result<Option<CanonicalBugRow>, StoreError> {
        Ok(self.rows.lock().await.get(&bug_id).cloned())
    }

    async fn replace(&self, row: &CanonicalBugRow) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        rows.remove(&row.bug_id);
        rows.insert(row.bug_id, row.clone());
        Ok(())
    }

    async fn active_target_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError> {
        Ok(self.select(CanonicalBugRow::is_active_target).await)
    }

    async fn closed_loop_pending_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError> {
        Ok(self.select(CanonicalBugRow::is_closed_loop_pending).await)
    }

    async fn published_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError> {
        let mut rows = self.select(CanonicalBugRow::is_published).await;
        rows.sort_by(|a, b| b.reported_date.cmp(&a.reported_date));
        Ok(rows)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.rows.lock().await.len())
    }
}
