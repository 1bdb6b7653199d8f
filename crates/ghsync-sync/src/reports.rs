//! Per-run report files and the `report` rollup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ghsync_adapters::JobKind;
use ghsync_core::ReconciliationSummary;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_MD: &str = "summary.md";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub job: JobKind,
    pub summary: ReconciliationSummary,
}

/// Write `<reports_dir>/<run_id>/summary.{json,md}` and return the run directory.
pub async fn write_run_report(
    reports_dir: &Path,
    job: JobKind,
    summary: &ReconciliationSummary,
) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let record = RunRecord {
        job,
        summary: summary.clone(),
    };
    let json = serde_json::to_vec_pretty(&record).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_JSON), json)
        .await
        .with_context(|| format!("writing {SUMMARY_JSON}"))?;
    fs::write(run_dir.join(SUMMARY_MD), render_summary_markdown(job, summary))
        .await
        .with_context(|| format!("writing {SUMMARY_MD}"))?;

    Ok(run_dir)
}

pub fn render_summary_markdown(job: JobKind, summary: &ReconciliationSummary) -> String {
    let mut lines = vec![
        format!("# ghsync run `{}`", summary.run_id),
        String::new(),
        format!("- Job: {job}"),
        format!("- Database: `{}`", summary.database_id),
        format!("- Dry run: {}", summary.dry_run),
        format!("- Started: {}", summary.started_at),
    ];
    if let Some(finished) = summary.finished_at {
        lines.push(format!("- Finished: {finished}"));
    }
    lines.extend([
        String::new(),
        "| processed | created | updated | skipped | failed |".to_string(),
        "|---|---|---|---|---|".to_string(),
        format!(
            "| {} | {} | {} | {} | {} |",
            summary.processed, summary.created, summary.updated, summary.skipped, summary.failed
        ),
    ]);
    if !summary.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for failure in &summary.failures {
            lines.push(format!("- `{}`: {}", failure.identifier, failure.message));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown rollup of the `runs` most recent runs under `reports_dir`, newest first.
pub fn report_recent_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;

    let mut records = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path().join(SUMMARY_JSON);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let record: RunRecord = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        records.push(record);
    }
    records.sort_by(|a, b| b.summary.started_at.cmp(&a.summary.started_at));

    let mut lines = vec!["# ghsync recent runs".to_string(), String::new()];
    if records.is_empty() {
        lines.push("No runs recorded.".to_string());
    }
    for record in records.into_iter().take(runs.max(1)) {
        let s = &record.summary;
        lines.push(format!("## {} `{}`", record.job, s.run_id));
        lines.push(format!("- started: {}", s.started_at));
        lines.push(format!("- database: `{}`", s.database_id));
        lines.push(format!(
            "- created {} / updated {} / skipped {} / failed {} of {}{}",
            s.created,
            s.updated,
            s.skipped,
            s.failed,
            s.processed,
            if s.dry_run { " (dry run)" } else { "" }
        ));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
