use async_trait::async_trait;
use ccb_core::{CanonicalBugRow, RECHECK_RESOLUTIONS, RECHECK_SEVERITIES, STATE_CLOSED};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{migrate::Migrator, PgPool, Postgres, Row};
use tracing::{debug, info};

use crate::{BugStore, StoreError};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const SELECT_COLUMNS: &str = r#"
    SELECT reported_date, bug_id, summary, version, target, component, severity,
           assignee, qa_contact, state, resolution, closed_loop, qa_whiteboard,
           triaged, reported_by, customer_data
      FROM ceph_customer_bugs
"#;

const INSERT_ROW: &str = r#"
    INSERT INTO ceph_customer_bugs (
        reported_date, bug_id, summary, version, target, component, severity,
        assignee, qa_contact, state, resolution, closed_loop, qa_whiteboard,
        triaged, reported_by, customer_data
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
"#;

/// `ceph_customer_bugs` on PostgreSQL; every statement is parameterized.
#[derive(Debug, Clone)]
pub struct PgBugStore {
    pool: PgPool,
}

impl PgBugStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("ceph_customer_bugs schema is up to date");
        Ok(())
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        binds: &[&str],
    ) -> Result<Vec<CanonicalBugRow>, StoreError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_from_pg).collect()
    }
}

async fn insert_with<'e, E>(executor: E, row: &CanonicalBugRow) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(INSERT_ROW)
        .bind(row.reported_date)
        .bind(row.bug_id)
        .bind(&row.summary)
        .bind(&row.version)
        .bind(&row.target)
        .bind(&row.component)
        .bind(&row.severity)
        .bind(&row.assignee)
        .bind(&row.qa_contact)
        .bind(&row.state)
        .bind(&row.resolution)
        .bind(row.closed_loop)
        .bind(&row.qa_whiteboard)
        .bind(row.triaged)
        .bind(&row.reported_by)
        .bind(&row.customer_data)
        .execute(executor)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateBug(row.bug_id)
            }
            other => StoreError::Query(other),
        })?;
    Ok(())
}

fn row_from_pg(row: &PgRow) -> Result<CanonicalBugRow, StoreError> {
    Ok(CanonicalBugRow {
        reported_date: row.try_get("reported_date")?,
        bug_id: row.try_get("bug_id")?,
        summary: row.try_get("summary")?,
        version: row.try_get("version")?,
        target: row.try_get("target")?,
        component: row.try_get("component")?,
        severity: row.try_get("severity")?,
        assignee: row.try_get("assignee")?,
        qa_contact: row.try_get("qa_contact")?,
        state: row.try_get("state")?,
        resolution: row.try_get("resolution")?,
        closed_loop: row.try_get("closed_loop")?,
        qa_whiteboard: row.try_get("qa_whiteboard")?,
        triaged: row.try_get("triaged")?,
        reported_by: row.try_get("reported_by")?,
        customer_data: row.try_get("customer_data")?,
    })
}

#[async_trait]
impl BugStore for PgBugStore {
    async fn insert(&self, row: &CanonicalBugRow) -> Result<(), StoreError> {
        insert_with(&self.pool, row).await
    }

    async fn get(&self, bug_id: i32) -> Result<Option<CanonicalBugRow>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE bug_id = $1");
        let row = sqlx::query(&sql)
            .bind(bug_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_from_pg).transpose()
    }

    async fn replace(&self, row: &CanonicalBugRow) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM ceph_customer_bugs WHERE bug_id = $1")
            .bind(row.bug_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        insert_with(&mut *tx, row).await?;
        tx.commit().await?;
        debug!(bug_id = row.bug_id, deleted, "replaced stored row");
        Ok(())
    }

    async fn active_target_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE target > $1 ORDER BY bug_id");
        self.fetch_rows(&sql, &[ccb_core::RECHECK_TARGET_FLOOR]).await
    }

    async fn closed_loop_pending_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE closed_loop = FALSE
               AND state = $1
               AND (resolution = $2 OR resolution = $3)
               AND (severity = $4 OR severity = $5)
             ORDER BY bug_id"
        );
        self.fetch_rows(
            &sql,
            &[
                STATE_CLOSED,
                RECHECK_RESOLUTIONS[0],
                RECHECK_RESOLUTIONS[1],
                RECHECK_SEVERITIES[0],
                RECHECK_SEVERITIES[1],
            ],
        )
        .await
    }

    async fn published_rows(&self) -> Result<Vec<CanonicalBugRow>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE target >= $1 ORDER BY reported_date DESC");
        self.fetch_rows(&sql, &[ccb_core::PUBLISH_TARGET_FLOOR]).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ceph_customer_bugs")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("store connection closed");
    }
}
