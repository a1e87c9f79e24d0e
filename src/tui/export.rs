use crate::model::RunRecord;
use anyhow::{Context, Result};
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;

use super::AppState;

// Global clipboard manager channel - initialized once on first use
static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

fn default_export_name(record: &RunRecord, ext: &str) -> String {
    let short_id = record.run_id.get(..8).unwrap_or(&record.run_id);
    format!(
        "promptchain-run-{}-{}.{ext}",
        record.timestamp_utc.replace(':', "-").replace('T', "_"),
        short_id
    )
}

/// Save a record to the default auto-save location and update state.info
/// with the saved path message.
pub fn save_and_show_path(record: &RunRecord, state: &mut AppState) {
    match crate::storage::save_run(record) {
        Ok(path) => {
            // Verify file exists before showing path
            if path.exists() {
                state.info = format!("Saved: {}", path.display());
            } else {
                state.info = format!("Saved (verifying): {}", path.display());
            }
        }
        Err(e) => {
            state.info = format!("Save failed: {e:#}");
        }
    }
}

/// Export JSON next to where the program was started.
/// Returns the absolute path of the exported file.
pub fn export_record_json(record: &RunRecord) -> Result<std::path::PathBuf> {
    let current_dir = std::env::current_dir().context("get current directory")?;
    let path = current_dir.join(default_export_name(record, "json"));
    crate::storage::export_json(&path, record)?;
    Ok(path)
}

/// Export CSV next to where the program was started.
/// Returns the absolute path of the exported file.
pub fn export_record_csv(record: &RunRecord) -> Result<std::path::PathBuf> {
    let current_dir = std::env::current_dir().context("get current directory")?;
    let path = current_dir.join(default_export_name(record, "csv"));
    crate::storage::export_csv(&path, record)?;
    Ok(path)
}

/// Initialize the clipboard manager thread if not already initialized.
/// This creates a background thread that processes clipboard operations sequentially,
/// keeping each clipboard instance alive for a sufficient duration.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        // Spawn a dedicated thread to manage clipboard operations
        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                // Create a new clipboard instance for each operation
                if let Ok(mut clipboard) = Clipboard::new() {
                    // Set the text
                    if clipboard.set_text(&text).is_ok() {
                        // Keep the clipboard instance alive for 2 seconds
                        // This gives clipboard managers plenty of time to read the contents
                        std::thread::sleep(Duration::from_secs(2));
                    }
                    // Clipboard is dropped here
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Copy text to clipboard.
/// Uses a background thread manager to keep clipboard instances alive for a sufficient duration
/// to ensure clipboard managers have time to read the contents on Linux.
/// Returns immediately after queuing the clipboard operation, without blocking the main thread.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}
