//! Downstream projection of the bug table: rows with `target >= '5'`, newest
//! first, shaped like the shared spreadsheet and exported as Parquet.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use ccb_core::CanonicalBugRow;
use ccb_storage::{BugStore, PgBugStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::SyncConfig;

pub const SHEET_COLUMNS: [&str; 16] = [
    "Time",
    "Bug_id",
    "Summary",
    "Version",
    "Target Version",
    "Component",
    "Severity",
    "Assignee",
    "QA_Contact",
    "State",
    "Resolution",
    "Closed Loop Completed",
    "qa_whiteboard",
    "Triaged",
    "Reported By",
    "Customer Data",
];

const SHEET_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetRow {
    pub time: String,
    pub bug_id: String,
    pub summary: String,
    pub version: String,
    pub target_version: String,
    pub component: String,
    pub severity: String,
    pub assignee: String,
    pub qa_contact: String,
    pub state: String,
    pub resolution: String,
    pub closed_loop_completed: bool,
    pub qa_whiteboard: String,
    pub triaged: bool,
    pub reported_by: String,
    pub customer_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub rows: usize,
    pub files: Vec<ManifestFile>,
}

/// Spreadsheet formula linking a bug id to its Bugzilla page.
pub fn bug_link(base_url: &str, bug_id: i32) -> String {
    let base = base_url.trim_end_matches('/');
    format!("=HYPERLINK(\"{base}/show_bug.cgi?id={bug_id}\", \"{bug_id}\")")
}

pub fn sheet_rows(rows: &[CanonicalBugRow], base_url: &str) -> Vec<SheetRow> {
    rows.iter()
        .map(|row| SheetRow {
            time: row.reported_date.format(SHEET_TIME_FORMAT).to_string(),
            bug_id: bug_link(base_url, row.bug_id),
            summary: row.summary.clone(),
            version: row.version.clone(),
            target_version: row.target.clone(),
            component: row.component.clone(),
            severity: row.severity.clone(),
            assignee: row.assignee.clone(),
            qa_contact: row.qa_contact.clone(),
            state: row.state.clone(),
            resolution: row.resolution.clone(),
            closed_loop_completed: row.closed_loop,
            qa_whiteboard: row.qa_whiteboard.clone(),
            triaged: row.triaged,
            reported_by: row.reported_by.clone(),
            customer_data: row.customer_data.clone(),
        })
        .collect()
}

/// Load the projection from `store` and write
/// `<reports_root>/<run_id>/snapshots/{customer_bugs.parquet,manifest.json}`.
pub async fn export_projection(
    store: &dyn BugStore,
    base_url: &str,
    reports_root: &Path,
) -> Result<ProjectionManifest> {
    let rows = store
        .published_rows()
        .await
        .context("loading projection rows")?;
    let sheet = sheet_rows(&rows, base_url);

    let run_id = Uuid::new_v4();
    let reports_dir = reports_root.join(run_id.to_string());
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let parquet_path = snapshot_dir.join("customer_bugs.parquet");
    write_sheet_parquet(&parquet_path, &sheet)?;

    let manifest = ProjectionManifest {
        schema_version: 1,
        run_id,
        rows: sheet.len(),
        files: vec![manifest_entry("customer_bugs", &reports_dir, &parquet_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing projection manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(%run_id, rows = sheet.len(), path = %parquet_path.display(), "projection exported");
    Ok(manifest)
}

pub async fn run_publish_from_config(config: &SyncConfig) -> Result<ProjectionManifest> {
    let store = PgBugStore::connect(&config.database_url).await?;
    let result = export_projection(&store, &config.bugzilla_url, &config.reports_dir).await;
    store.close().await;
    result
}

fn write_sheet_parquet(path: &PathBuf, rows: &[SheetRow]) -> Result<()> {
    let fields = SHEET_COLUMNS
        .iter()
        .map(|name| {
            let data_type = match *name {
                "Closed Loop Completed" | "Triaged" => DataType::Boolean,
                _ => DataType::Utf8,
            };
            ArrowField::new(*name, data_type, false)
        })
        .collect::<Vec<_>>();
    let schema = Arc::new(Schema::new(fields));

    let text = |get: fn(&SheetRow) -> &str| -> ArrayRef {
        Arc::new(StringArray::from(
            rows.iter().map(|r| Some(get(r))).collect::<Vec<_>>(),
        ))
    };
    let flag = |get: fn(&SheetRow) -> bool| -> ArrayRef {
        Arc::new(BooleanArray::from(rows.iter().map(get).collect::<Vec<_>>()))
    };

    let columns = vec![
        text(|r| r.time.as_str()),
        text(|r| r.bug_id.as_str()),
        text(|r| r.summary.as_str()),
        text(|r| r.version.as_str()),
        text(|r| r.target_version.as_str()),
        text(|r| r.component.as_str()),
        text(|r| r.severity.as_str()),
        text(|r| r.assignee.as_str()),
        text(|r| r.qa_contact.as_str()),
        text(|r| r.state.as_str()),
        text(|r| r.resolution.as_str()),
        flag(|r| r.closed_loop_completed),
        text(|r| r.qa_whiteboard.as_str()),
        flag(|r| r.triaged),
        text(|r| r.reported_by.as_str()),
        text(|r| r.customer_data.as_str()),
    ];

    let batch =
        RecordBatch::try_new(schema, columns).context("building customer_bugs record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &PathBuf, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
