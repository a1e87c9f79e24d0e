use crate::model::WorkflowEvent;
use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

/// Line-based reader over a server-sent-event stream. Only `data:` lines
/// carry payloads; everything else (comments, field lines, blank keep-alives)
/// is skipped.
pub struct EventReader<R> {
    reader: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> EventReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Next decoded event, or `None` once the stream ends. Payloads that fail
    /// to decode are skipped rather than killing the stream.
    pub async fn next_event(&mut self) -> Result<Option<WorkflowEvent>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading event stream")?;
            if n == 0 {
                return Ok(None);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            if let Some(event) = parse_data_line(data) {
                return Ok(Some(event));
            }
        }
    }
}

/// Wrap a streaming response into an event reader.
pub fn event_reader(response: reqwest::Response) -> EventReader<impl AsyncBufRead + Unpin> {
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    EventReader::new(BufReader::new(StreamReader::new(stream)))
}

/// Decode one `data:` payload, `None` when it is not a usable event.
pub fn parse_data_line(data: &str) -> Option<WorkflowEvent> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str::<WorkflowEvent>(data) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(error = %err, payload = data, "skipping malformed event payload");
            None
        }
    }
}
