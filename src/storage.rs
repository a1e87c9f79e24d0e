//! Saved run records and exports.
//!
//! Runs live as pretty-printed JSON files under the platform data directory,
//! one file per run, named after the run's timestamp and id.

use crate::model::RunRecord;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

fn runs_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no data directory available on this platform")?;
    Ok(base.join("promptchain").join("runs"))
}

fn short_id(record: &RunRecord) -> &str {
    record.run_id.get(..8).unwrap_or(&record.run_id)
}

fn record_filename(record: &RunRecord) -> String {
    let ts = record.timestamp_utc.replace(':', "-").replace('T', "_");
    format!("run-{}-{}.json", ts, short_id(record))
}

/// Save a run record to the data directory, returning the file path.
pub fn save_run(record: &RunRecord) -> Result<PathBuf> {
    save_run_in(&runs_dir()?, record)
}

fn save_run_in(dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating run directory {}", dir.display()))?;
    let path = dir.join(record_filename(record));
    let json = serde_json::to_string_pretty(record).context("serializing run record")?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Load up to `limit` saved runs, newest first.
pub fn load_recent(limit: usize) -> Result<Vec<RunRecord>> {
    load_recent_in(&runs_dir()?, limit)
}

fn load_recent_in(dir: &Path, limit: usize) -> Result<Vec<RunRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<RunRecord>(&s).ok());
        match parsed {
            Some(record) => records.push(record),
            None => tracing::warn!(path = %path.display(), "skipping unreadable run record"),
        }
    }
    // RFC 3339 timestamps sort lexicographically in time order.
    records.sort_by(|a, b| b.timestamp_utc.cmp(&a.timestamp_utc));
    records.truncate(limit);
    Ok(records)
}

/// Delete the saved file for a run.
pub fn delete_run(record: &RunRecord) -> Result<()> {
    delete_run_in(&runs_dir()?, record)
}

fn delete_run_in(dir: &Path, record: &RunRecord) -> Result<()> {
    let path = dir.join(record_filename(record));
    if path.exists() {
        return fs::remove_file(&path).with_context(|| format!("deleting {}", path.display()));
    }
    // Files saved under an older naming scheme are matched by stored id.
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let candidate = entry?.path();
        if candidate.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let matches = fs::read_to_string(&candidate)
            .ok()
            .and_then(|s| serde_json::from_str::<RunRecord>(&s).ok())
            .map(|r| r.run_id == record.run_id)
            .unwrap_or(false);
        if matches {
            return fs::remove_file(&candidate)
                .with_context(|| format!("deleting {}", candidate.display()));
        }
    }
    anyhow::bail!("no saved record for run {}", record.run_id)
}

/// Export a run record as pretty JSON to an explicit path.
pub fn export_json(path: &Path, record: &RunRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(record).context("serializing run record")?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

/// Export a run's step results as CSV, one row per step.
pub fn export_csv(path: &Path, record: &RunRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut out = String::from("step,prompt_id,prompt_title,status,execution_time_s,detail\n");
    for result in &record.results {
        let (status, detail) = if result.succeeded() {
            ("success", result.output.as_deref().unwrap_or(""))
        } else {
            ("error", result.error.as_deref().unwrap_or(""))
        };
        out.push_str(&format!(
            "{},{},{},{},{:.3},{}\n",
            result.step,
            csv_field(&result.prompt_id),
            csv_field(&result.prompt_title),
            status,
            result.execution_time,
            csv_field(detail),
        ));
    }
    fs::write(path, out).with_context(|| format!("writing {}", path.display()))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionConfig, RunOutcome, StepResult};

    fn record(run_id: &str, timestamp: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            timestamp_utc: timestamp.to_string(),
            workspace_id: 3,
            workspace_name: Some("Research".into()),
            comments: None,
            config: ExecutionConfig::new(2),
            results: vec![
                StepResult::success(1, "1".into(), "Draft, v1".into(), None, "ok".into(), 0.5),
                StepResult::failure(2, "2".into(), "Review".into(), None, "model \"quit\"".into(), 0.1),
            ],
            final_output: "ok".into(),
            fatal_error: None,
            outcome: RunOutcome::CompletedWithErrors,
            completed_steps: 1,
            total_steps: 2,
            total_time: 0.6,
        }
    }

    #[test]
    fn save_then_load_round_trips_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        save_run_in(dir.path(), &record("11111111aa", "2026-08-20T10:00:00Z")).unwrap();
        save_run_in(dir.path(), &record("22222222bb", "2026-08-22T10:00:00Z")).unwrap();

        let loaded = load_recent_in(dir.path(), 10).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].run_id, "22222222bb");
        assert_eq!(loaded[1].run_id, "11111111aa");
        assert_eq!(loaded[0].results.len(), 2);

        let limited = load_recent_in(dir.path(), 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].run_id, "22222222bb");
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        save_run_in(dir.path(), &record("33333333cc", "2026-08-21T09:00:00Z")).unwrap();
        fs::write(dir.path().join("junk.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_recent_in(dir.path(), 10).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn delete_removes_the_saved_file() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record("44444444dd", "2026-08-21T09:00:00Z");
        let path = save_run_in(dir.path(), &rec).unwrap();
        assert!(path.exists());

        delete_run_in(dir.path(), &rec).unwrap();
        assert!(!path.exists());
        assert!(delete_run_in(dir.path(), &rec).is_err());
    }

    #[test]
    fn delete_falls_back_to_matching_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record("55555555ee", "2026-08-21T09:00:00Z");
        let odd_path = dir.path().join("legacy-name.json");
        fs::write(&odd_path, serde_json::to_string(&rec).unwrap()).unwrap();

        delete_run_in(dir.path(), &rec).unwrap();
        assert!(!odd_path.exists());
    }

    #[test]
    fn csv_export_writes_one_row_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        export_csv(&path, &record("66666666ff", "2026-08-21T09:00:00Z")).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("step,prompt_id,prompt_title,status"));
        assert!(lines[1].contains("\"Draft, v1\""), "comma field quoted: {}", lines[1]);
        assert!(lines[2].contains("error"));
        assert!(lines[2].contains("\"model \"\"quit\"\"\""), "quotes doubled: {}", lines[2]);
    }

    #[test]
    fn short_ids_do_not_break_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record("7", "2026-08-21T09:00:00Z");
        let path = save_run_in(dir.path(), &rec).unwrap();
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with("-7.json"))
            .unwrap_or(false));
    }
}
