//! Text summary builder for CLI output.
//!
//! Formats a settled run record as human-readable lines for text mode.

use crate::model::RunRecord;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a settled run record.
pub(crate) fn build_text_summary(record: &RunRecord) -> TextSummary {
    let mut lines = Vec::new();

    match record.workspace_name.as_deref() {
        Some(name) => lines.push(format!("Workspace: {} (id {})", name, record.workspace_id)),
        None => lines.push(format!("Workspace id: {}", record.workspace_id)),
    }
    if let Some(comments) = record.comments.as_deref() {
        if !comments.trim().is_empty() {
            lines.push(format!("Comments: {}", comments));
        }
    }
    let failed = record.failed_count();
    let failed_note = if failed > 0 {
        format!(", {failed} failed")
    } else {
        String::new()
    };
    lines.push(format!(
        "Outcome: {} ({}/{} steps{}, model {}, {:.1}s)",
        record.outcome.label(),
        record.succeeded_count(),
        record.total_steps,
        failed_note,
        record.config.model,
        record.total_time
    ));
    if let Some(err) = record.fatal_error.as_deref() {
        lines.push(format!("Error: {}", err));
    }

    let disabled: Vec<String> = record
        .config
        .enabled_steps
        .iter()
        .enumerate()
        .filter(|(_, enabled)| !**enabled)
        .map(|(i, _)| (i + 1).to_string())
        .collect();
    if !disabled.is_empty() {
        lines.push(format!("Disabled steps: {}", disabled.join(", ")));
    }

    if !record.results.is_empty() {
        lines.push("Steps:".to_string());
        for result in &record.results {
            match result.error.as_deref() {
                None => lines.push(format!(
                    "  {}. ✓ {} ({:.1}s)",
                    result.step, result.prompt_title, result.execution_time
                )),
                Some(err) => lines.push(format!(
                    "  {}. ✗ {} ({:.1}s): {}",
                    result.step, result.prompt_title, result.execution_time, err
                )),
            }
        }
    }

    if !record.final_output.is_empty() {
        lines.push("Final output:".to_string());
        for line in record.final_output.lines() {
            lines.push(line.to_string());
        }
    }

    TextSummary { lines }
}
