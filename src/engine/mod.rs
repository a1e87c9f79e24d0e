pub mod api;
pub mod sse;

use crate::model::{ExecutionConfig, InfoEvent, PromptInfo, RunConfig, RunEvent, RunRecord};
use crate::session::ExecutionSession;
use anyhow::Result;
use rand::RngCore;
use std::time::Instant;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ExecutionEngine {
    cfg: RunConfig,
}

impl ExecutionEngine {
    pub fn new(cfg: RunConfig) -> Self {
        Self { cfg }
    }

    /// Run one workflow execution until it settles and return the record.
    /// Cancellation and transport failures settle the run too (as aborted or
    /// failed); `Err` is reserved for refusing to start at all.
    pub async fn run(
        self,
        prompts: Vec<PromptInfo>,
        config: ExecutionConfig,
        event_tx: mpsc::UnboundedSender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<RunRecord> {
        config.validate(prompts.len())?;

        let api = api::WorkflowApi::new(&self.cfg)?;
        let mut session = ExecutionSession::new(prompts);
        session.start_run(&config);

        let _ = event_tx.send(RunEvent::Info(InfoEvent::Connecting {
            workspace_id: self.cfg.workspace_id,
        }));

        let started = Instant::now();
        match api.execute_stream(self.cfg.workspace_id, &config).await {
            Ok(resp) => {
                let reader = sse::event_reader(resp);
                drive_stream(&mut session, reader, &event_tx, &cancel).await;
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    session.mark_aborted();
                } else {
                    session.mark_fatal(format!("{err:#}"));
                }
            }
        }

        Ok(session.to_record(
            gen_run_id(),
            time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            &self.cfg,
            &config,
            started.elapsed().as_secs_f64(),
        ))
    }
}

/// Fold the event stream into the session until the run settles. The token
/// decides how an interrupted stream is classified: cancelled means aborted,
/// anything else is a transport failure. Dropping the reader on exit is what
/// tears the connection down.
async fn drive_stream<R: AsyncBufRead + Unpin>(
    session: &mut ExecutionSession,
    mut reader: sse::EventReader<R>,
    event_tx: &mpsc::UnboundedSender<RunEvent>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                session.mark_aborted();
                return;
            }
            next = reader.next_event() => match next {
                Ok(Some(event)) => {
                    session.apply(&event);
                    let _ = event_tx.send(RunEvent::Workflow(event));
                    if session.state().is_terminal() {
                        return;
                    }
                }
                Ok(None) => {
                    if cancel.is_cancelled() {
                        session.mark_aborted();
                    } else {
                        session.mark_fatal("stream ended before the workflow completed");
                    }
                    return;
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        session.mark_aborted();
                    } else {
                        session.mark_fatal(format!("{err:#}"));
                    }
                    return;
                }
            }
        }
    }
}

/// Generate a random id for one run.
fn gen_run_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunOutcome, RunState, WorkflowEvent};
    use sse::EventReader;
    use std::time::Duration;
    use tokio::io::BufReader;

    fn test_cfg() -> RunConfig {
        RunConfig {
            // Nothing listens here; only used by tests that must fail to connect.
            base_url: "http://127.0.0.1:1".into(),
            workspace_id: 7,
            token: None,
            user_agent: "promptchain-test".into(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            comments: None,
        }
    }

    fn prompts(n: usize) -> Vec<PromptInfo> {
        (1..=n)
            .map(|i| PromptInfo {
                id: i.to_string(),
                title: format!("Prompt {i}"),
                category: None,
            })
            .collect()
    }

    fn sse_body(events: &[WorkflowEvent]) -> String {
        events
            .iter()
            .map(|e| format!("data: {}\n", serde_json::to_string(e).unwrap()))
            .collect()
    }

    fn script_to_complete() -> Vec<WorkflowEvent> {
        vec![
            WorkflowEvent::Init {
                workspace_name: Some("Research".into()),
                total_steps: Some(2),
            },
            WorkflowEvent::Start {
                step: 1,
                prompt_id: Some("1".into()),
                prompt_title: Some("Prompt 1".into()),
                total_steps: Some(2),
            },
            WorkflowEvent::Complete {
                step: 1,
                prompt_id: "1".into(),
                prompt_title: "Prompt 1".into(),
                input: None,
                output: "one".into(),
                execution_time: 0.3,
            },
            WorkflowEvent::Start {
                step: 2,
                prompt_id: Some("2".into()),
                prompt_title: Some("Prompt 2".into()),
                total_steps: Some(2),
            },
            WorkflowEvent::Complete {
                step: 2,
                prompt_id: "2".into(),
                prompt_title: "Prompt 2".into(),
                input: Some("one".into()),
                output: "two".into(),
                execution_time: 0.2,
            },
            WorkflowEvent::WorkflowComplete {
                final_output: "two".into(),
                completed_steps: 2,
                total_steps: 2,
                success: true,
                total_time: Some(0.5),
            },
        ]
    }

    #[tokio::test]
    async fn driver_folds_a_full_stream_and_forwards_every_event() {
        let script = script_to_complete();
        let body = sse_body(&script);
        let reader = EventReader::new(BufReader::new(body.as_bytes()));

        let mut session = ExecutionSession::new(prompts(2));
        session.start_run(&ExecutionConfig::new(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        drive_stream(&mut session, reader, &tx, &cancel).await;

        assert_eq!(session.state(), RunState::Completed);
        assert_eq!(session.final_output(), "two");
        let mut forwarded = 0;
        while let Ok(ev) = rx.try_recv() {
            assert!(matches!(ev, RunEvent::Workflow(_)));
            forwarded += 1;
        }
        assert_eq!(forwarded, script.len());
    }

    #[tokio::test]
    async fn premature_end_of_stream_is_a_transport_failure() {
        let body = sse_body(&[WorkflowEvent::Start {
            step: 1,
            prompt_id: None,
            prompt_title: None,
            total_steps: None,
        }]);
        let reader = EventReader::new(BufReader::new(body.as_bytes()));

        let mut session = ExecutionSession::new(prompts(2));
        session.start_run(&ExecutionConfig::new(2));
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        drive_stream(&mut session, reader, &tx, &cancel).await;

        assert_eq!(session.state(), RunState::Failed);
        assert_eq!(
            session.fatal_error(),
            Some("stream ended before the workflow completed")
        );
    }

    #[tokio::test]
    async fn cancelled_token_aborts_instead_of_consuming_the_stream() {
        let body = sse_body(&script_to_complete());
        let reader = EventReader::new(BufReader::new(body.as_bytes()));

        let mut session = ExecutionSession::new(prompts(2));
        session.start_run(&ExecutionConfig::new(2));
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        drive_stream(&mut session, reader, &tx, &cancel).await;

        assert_eq!(session.state(), RunState::Aborted);
        assert!(session.fatal_error().is_none());
        assert!(session.results().is_empty());
    }

    #[tokio::test]
    async fn server_side_abort_event_settles_the_run() {
        let body = sse_body(&[
            WorkflowEvent::Start {
                step: 1,
                prompt_id: None,
                prompt_title: None,
                total_steps: None,
            },
            WorkflowEvent::Aborted {
                message: Some("stopped by user".into()),
            },
        ]);
        let reader = EventReader::new(BufReader::new(body.as_bytes()));

        let mut session = ExecutionSession::new(prompts(2));
        session.start_run(&ExecutionConfig::new(2));
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        drive_stream(&mut session, reader, &tx, &cancel).await;

        assert_eq!(session.state(), RunState::Aborted);
        assert!(session.fatal_error().is_none());
    }

    #[tokio::test]
    async fn invalid_config_refuses_to_start_and_emits_nothing() {
        let mut config = ExecutionConfig::new(2);
        config.set_all_steps(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let engine = ExecutionEngine::new(test_cfg());
        let err = engine
            .run(prompts(2), config, tx, CancellationToken::new())
            .await
            .expect_err("no enabled steps must refuse to run");

        assert!(err.to_string().contains("no steps are enabled"));
        assert!(rx.try_recv().is_err(), "nothing may be emitted");
    }

    #[tokio::test]
    async fn connection_failure_produces_a_failed_record() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = ExecutionEngine::new(test_cfg());
        let record = engine
            .run(prompts(2), ExecutionConfig::new(2), tx, CancellationToken::new())
            .await
            .expect("connection failures settle into a record");

        assert_eq!(record.outcome, RunOutcome::Failed);
        assert!(record.fatal_error.is_some());
        assert!(record.results.is_empty());
    }

    #[tokio::test]
    async fn connection_failure_after_cancel_reports_aborted() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let engine = ExecutionEngine::new(test_cfg());
        let record = engine
            .run(prompts(2), ExecutionConfig::new(2), tx, cancel)
            .await
            .expect("cancelled runs settle into a record");

        assert_eq!(record.outcome, RunOutcome::Aborted);
        assert!(record.fatal_error.is_none());
    }
}
