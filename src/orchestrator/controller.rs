//! Run lifecycle controller.
//!
//! Owns the single active run and emits events for presentation layers.

use crate::cli::{build_execution_config, build_run_config, Cli};
use crate::engine::ExecutionEngine;
use crate::model::{ExecutionConfig, InfoEvent, PromptInfo, RunEvent, RunRecord};
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Commands emitted by UI layers to control execution.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Execute(ExecutionConfig),
    Stop,
    Quit,
}

/// Internal handle for a running execution task.
struct RunCtx {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<Result<RunRecord>>>,
}

/// Spawn a new execution and return its control handle.
fn start_run(
    args: &Cli,
    prompts: &[PromptInfo],
    config: ExecutionConfig,
    event_tx: UnboundedSender<RunEvent>,
) -> RunCtx {
    let cfg = build_run_config(args);
    let cancel = CancellationToken::new();
    let engine = ExecutionEngine::new(cfg);
    let prompts = prompts.to_vec();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { engine.run(prompts, config, event_tx, cancel).await }
    });
    RunCtx {
        cancel,
        handle: Some(handle),
    }
}

/// Orchestrate executions based on UI commands and emit events back to
/// presentation layers. At most one run is active at a time; an `Execute`
/// while one is active is refused with an info message.
pub(crate) async fn run_controller(
    args: &Cli,
    prompts: Vec<PromptInfo>,
    event_tx: UnboundedSender<RunEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut run_ctx = if args.run_on_launch {
        match build_execution_config(args, prompts.len()) {
            Ok(config) => match config.validate(prompts.len()) {
                Ok(()) => Some(start_run(args, &prompts, config, event_tx.clone())),
                Err(e) => {
                    let _ = event_tx.send(RunEvent::Info(InfoEvent::InvalidConfig(e.to_string())));
                    None
                }
            },
            Err(e) => {
                let _ = event_tx.send(RunEvent::Info(InfoEvent::InvalidConfig(format!("{e:#}"))));
                None
            }
        }
    } else {
        None
    };
    let mut quit_pending = false;
    // Once the command channel closes, recv() resolves immediately forever;
    // disable that branch so waiting for the final run does not spin.
    let mut cmd_closed = false;
    // Cancel watchdog: if a cancel takes too long, emit a status message to keep UI feedback alive.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    let res = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !cmd_closed => {
                match cmd {
                    Some(UiCommand::Execute(config)) => {
                        if run_ctx.is_some() {
                            let _ = event_tx.send(RunEvent::Info(InfoEvent::RunInProgress));
                        } else {
                            match config.validate(prompts.len()) {
                                Ok(()) => {
                                    run_ctx = Some(start_run(args, &prompts, config, event_tx.clone()));
                                }
                                Err(e) => {
                                    let _ = event_tx.send(RunEvent::Info(InfoEvent::InvalidConfig(
                                        e.to_string(),
                                    )));
                                }
                            }
                        }
                    }
                    Some(UiCommand::Stop) => {
                        // Stopping with nothing active is a no-op.
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel.cancel();
                            let _ = event_tx.send(RunEvent::Info(InfoEvent::Cancelling));
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        }
                    }
                    Some(UiCommand::Quit) => {
                        // Quit waits for the current run to finish so we can cleanly finalize UI state.
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel.cancel();
                            let _ = event_tx.send(RunEvent::Info(InfoEvent::Cancelling));
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            break Ok(());
                        }
                    }
                    None => {
                        cmd_closed = true;
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel.cancel();
                        } else {
                            break Ok(());
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(ctx) = &mut run_ctx {
                        ctx.handle.take();
                    }
                    match join_res {
                        Ok(Ok(record)) => {
                            let _ = event_tx.send(RunEvent::RunCompleted { record: Box::new(record) });
                        }
                        Ok(Err(e)) => {
                            let _ = event_tx.send(RunEvent::Info(InfoEvent::RunFailed(format!("{e:#}"))));
                        }
                        Err(e) => {
                            let _ = event_tx.send(RunEvent::Info(InfoEvent::Message(format!(
                                "Run join failed: {e}"
                            ))));
                        }
                    }
                    run_ctx = None;
                    cancel_deadline = None;
                    if quit_pending {
                        break Ok(());
                    }
                }
            }
            // If cancel stalls (e.g., a read in flight), keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && run_ctx.is_some() {
                        let _ = event_tx.send(RunEvent::Info(InfoEvent::StillCancelling));
                        cancel_deadline = None;
                    }
                }
            }
        }
    };

    res
}
