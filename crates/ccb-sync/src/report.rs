use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::{PhaseReport, SyncRunSummary};

/// Write `sync_summary.json` and `daily_brief.md` under `<root>/<run_id>/`.
pub async fn write_reports(root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let reports_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(reports_dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;

    fs::write(reports_dir.join("daily_brief.md"), daily_brief(summary))
        .await
        .context("writing daily_brief.md")?;

    Ok(reports_dir)
}

fn daily_brief(summary: &SyncRunSummary) -> String {
    let phases = summary
        .phases
        .iter()
        .map(phase_line)
        .collect::<Vec<_>>()
        .join("\n");

    let failures = summary
        .phases
        .iter()
        .flat_map(|p| p.failures.iter())
        .map(|f| format!("- bug {}: {}", f.bug_id, f.error))
        .collect::<Vec<_>>();
    let failures = if failures.is_empty() {
        "- none".to_string()
    } else {
        failures.join("\n")
    };

    format!(
        "# Ceph Customer Bug Sync\n\n- Run ID: `{}`\n- Mode: {:?}\n- Started: {}\n- Finished: {}\n- Inserted: {}\n- Replaced: {}\n- Failed: {}\n\n## Phases\n{}\n\n## Failures\n{}\n",
        summary.run_id,
        summary.mode,
        summary.started_at,
        summary.finished_at,
        summary.inserted(),
        summary.replaced(),
        summary.failed(),
        phases,
        failures,
    )
}

fn phase_line(phase: &PhaseReport) -> String {
    format!(
        "- {:?}: {} candidates, {} inserted, {} replaced, {} unchanged, {} failed",
        phase.phase,
        phase.candidates,
        phase.inserted,
        phase.replaced,
        phase.unchanged,
        phase.failures.len()
    )
}
