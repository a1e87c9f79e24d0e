use crate::engine::api::WorkflowApi;
use crate::engine::ExecutionEngine;
use crate::model::{ExecutionConfig, RunConfig, RunEvent, RunOutcome, WorkflowEvent, DEFAULT_MODEL};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "promptchain",
    version,
    about = "Run prompt workflows against a workflow service, with optional TUI"
)]
pub struct Cli {
    /// Base URL of the workflow service
    #[arg(long, default_value = "http://localhost:5000")]
    pub base_url: String,

    /// Workspace id whose prompt sequence to execute
    #[arg(long)]
    pub workspace: Option<u64>,

    /// Bearer token for the service (falls back to PROMPTCHAIN_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// List visible workspaces and exit
    #[arg(long)]
    pub list: bool,

    /// Print the run record as JSON and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Model to execute the prompts with
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Sampling temperature (clamped to 0.0..=2.0)
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,

    /// Initial input passed to the first step
    #[arg(long)]
    pub input: Option<String>,

    /// Read the initial input from a file
    #[arg(long)]
    pub input_file: Option<std::path::PathBuf>,

    /// Use --stop-on-error true or --stop-on-error false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub stop_on_error: bool,

    /// Steps to skip, 1-based (e.g. --skip-steps 2,5)
    #[arg(long, value_delimiter = ',')]
    pub skip_steps: Vec<u32>,

    /// Run only these steps, 1-based (e.g. --only-steps 1,3)
    #[arg(long, value_delimiter = ',')]
    pub only_steps: Vec<u32>,

    /// Connect timeout for the service
    #[arg(long, default_value = "10s")]
    pub connect_timeout: humantime::Duration,

    /// Timeout for non-streaming requests
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Export the run record as JSON
    #[arg(long)]
    pub export_json: Option<std::path::PathBuf>,

    /// Export step results as CSV
    #[arg(long)]
    pub export_csv: Option<std::path::PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// Start a run as soon as the TUI launches
    #[arg(long)]
    pub run_on_launch: bool,

    /// Attach custom comments to this run
    #[arg(long)]
    pub comments: Option<String>,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }
    if args.input.is_some() && args.input_file.is_some() {
        return Err(anyhow::anyhow!(
            "--input and --input-file cannot be combined"
        ));
    }

    if args.list {
        return run_list(args).await;
    }
    if args.workspace.is_none() {
        return Err(anyhow::anyhow!(
            "--workspace is required (use --list to discover workspaces)"
        ));
    }

    // Silent mode takes precedence over other output modes
    if args.silent {
        return run_streaming(args, true).await;
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(args).await;
        }
    }

    if args.json {
        return run_streaming(args, false).await;
    }

    run_text(args).await
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_run_config(args: &Cli) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        workspace_id: args.workspace.unwrap_or_default(),
        token: args
            .token
            .clone()
            .or_else(|| std::env::var("PROMPTCHAIN_TOKEN").ok()),
        user_agent: format!("promptchain/{}", env!("CARGO_PKG_VERSION")),
        connect_timeout: Duration::from(args.connect_timeout),
        request_timeout: Duration::from(args.request_timeout),
        comments: args.comments.clone(),
    }
}

/// Build an `ExecutionConfig` from CLI arguments for a workspace with
/// `prompt_count` prompts.
pub fn build_execution_config(args: &Cli, prompt_count: usize) -> Result<ExecutionConfig> {
    let mut config = ExecutionConfig::new(prompt_count);
    config.model = args.model.clone();
    config.set_temperature(args.temperature);
    config.stop_on_error = args.stop_on_error;
    config.initial_input = read_initial_input(args)?;
    apply_step_selection(&mut config, &args.only_steps, &args.skip_steps, prompt_count);
    Ok(config)
}

fn read_initial_input(args: &Cli) -> Result<String> {
    if let Some(path) = args.input_file.as_deref() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("reading input file {}", path.display()));
    }
    Ok(args.input.clone().unwrap_or_default())
}

/// Turn 1-based --only-steps/--skip-steps selections into the enabled mask.
/// --only-steps applies first, then --skip-steps; out-of-range entries are
/// ignored with a warning.
fn apply_step_selection(
    config: &mut ExecutionConfig,
    only: &[u32],
    skip: &[u32],
    prompt_count: usize,
) {
    if !only.is_empty() {
        config.set_all_steps(false);
        for &step in only {
            match (step as usize).checked_sub(1) {
                Some(i) if i < prompt_count => config.enabled_steps[i] = true,
                _ => tracing::warn!(step, "ignoring --only-steps entry out of range"),
            }
        }
    }
    for &step in skip {
        match (step as usize).checked_sub(1) {
            Some(i) if i < prompt_count => config.enabled_steps[i] = false,
            _ => tracing::warn!(step, "ignoring --skip-steps entry out of range"),
        }
    }
}

/// Hook Ctrl-C up to the run's cancellation token so an interrupted stream
/// settles as aborted instead of killing the process mid-write.
fn spawn_ctrl_c_cancel(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

async fn run_list(args: Cli) -> Result<()> {
    let cfg = build_run_config(&args);
    let api = WorkflowApi::new(&cfg)?;
    let spaces = api.list_workspaces().await?;

    let (out_tx, out_handle) = spawn_output_writer();
    if spaces.is_empty() {
        let _ = out_tx.send(OutputLine::Stderr("No workspaces visible".into()));
    }
    for space in &spaces {
        let desc = space.description.as_deref().unwrap_or("");
        let _ = out_tx.send(OutputLine::Stdout(format!(
            "{:>6}  {:<32} {:>3} prompts  {:>3} members  {}",
            space.id, space.name, space.prompt_count, space.member_count, desc
        )));
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

/// Common function to run an execution and process the record.
/// `silent` controls whether to consume events and suppress output.
async fn run_streaming(args: Cli, silent: bool) -> Result<()> {
    let cfg = build_run_config(&args);
    let api = WorkflowApi::new(&cfg)?;
    let prompts = api.fetch_prompts(cfg.workspace_id).await?;
    let config = build_execution_config(&args, prompts.len())?;
    config.validate(prompts.len())?;

    let (out_tx, out_handle) = if silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    let cancel = CancellationToken::new();
    spawn_ctrl_c_cancel(&cancel);
    let engine = ExecutionEngine::new(cfg);

    let record = if silent {
        // In silent mode, spawn the task and consume events
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
        let handle =
            tokio::spawn(async move { engine.run(prompts, config, evt_tx, cancel).await });

        // Consume events silently (no output)
        while let Some(_ev) = evt_rx.recv().await {
            // All events are silently consumed - no output
        }

        handle
            .await
            .context("execution task failed")?
            .context("workflow execution failed")?
    } else {
        // In JSON mode, directly await the engine (no need to consume events)
        let (evt_tx, _) = mpsc::unbounded_channel::<RunEvent>();
        engine
            .run(prompts, config, evt_tx, cancel)
            .await
            .context("workflow execution failed")?
    };

    // Handle exports (errors will propagate)
    handle_exports(&args, &record)?;

    if let Some(tx) = out_tx.as_ref() {
        // Print JSON output in non-silent mode
        let out = serde_json::to_string_pretty(&record)?;
        let _ = tx.send(OutputLine::Stdout(out));
    }

    // Save the record if auto_save is enabled
    if args.auto_save {
        if silent {
            crate::storage::save_run(&record).context("failed to save run record")?;
        } else if let Some(tx) = out_tx.as_ref() {
            if let Ok(p) = crate::storage::save_run(&record) {
                let _ = tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
            }
        }
    }

    if let Some(tx) = out_tx {
        drop(tx);
    }
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    if record.outcome == RunOutcome::Failed {
        anyhow::bail!(
            "workflow failed: {}",
            record.fatal_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_text(args: Cli) -> Result<()> {
    let cfg = build_run_config(&args);
    let api = WorkflowApi::new(&cfg)?;
    let prompts = api.fetch_prompts(cfg.workspace_id).await?;
    let config = build_execution_config(&args, prompts.len())?;
    config.validate(prompts.len())?;

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let cancel = CancellationToken::new();
    spawn_ctrl_c_cancel(&cancel);

    let mut total_steps = prompts.len() as u32;
    let engine = ExecutionEngine::new(cfg);
    let handle = tokio::spawn(async move { engine.run(prompts, config, evt_tx, cancel).await });

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            RunEvent::Workflow(event) => match event {
                WorkflowEvent::Init {
                    workspace_name,
                    total_steps: total,
                } => {
                    if let Some(total) = total {
                        total_steps = total;
                    }
                    if let Some(name) = workspace_name {
                        let _ = out_tx.send(OutputLine::Stderr(format!("== {name} ==")));
                    }
                }
                WorkflowEvent::Start {
                    step,
                    prompt_title,
                    total_steps: total,
                    ..
                } => {
                    if let Some(total) = total {
                        total_steps = total;
                    }
                    let title = prompt_title.as_deref().unwrap_or("step");
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "[{step}/{total_steps}] {title} ..."
                    )));
                }
                WorkflowEvent::Complete {
                    step,
                    prompt_title,
                    execution_time,
                    ..
                } => {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "[{step}/{total_steps}] ✓ {prompt_title} ({execution_time:.1}s)"
                    )));
                }
                WorkflowEvent::StepError {
                    step,
                    prompt_title,
                    error,
                    execution_time,
                    ..
                } => {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "[{step}/{total_steps}] ✗ {prompt_title} ({execution_time:.1}s): {error}"
                    )));
                }
                WorkflowEvent::Aborted { message } => {
                    let suffix = message.map(|m| format!(": {m}")).unwrap_or_default();
                    let _ = out_tx.send(OutputLine::Stderr(format!("Aborted{suffix}")));
                }
                WorkflowEvent::Error { error } => {
                    let _ = out_tx.send(OutputLine::Stderr(format!("Error: {error}")));
                }
                WorkflowEvent::WorkflowComplete { .. } | WorkflowEvent::Unknown => {}
            },
            RunEvent::Info(info) => {
                let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
            }
            RunEvent::RunCompleted { .. } => {}
        }
    }

    let record = handle.await??;

    handle_exports(&args, &record)?;
    let summary = crate::text_summary::build_text_summary(&record);
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    if args.auto_save {
        if let Ok(p) = crate::storage::save_run(&record) {
            let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;

    if record.outcome == RunOutcome::Failed {
        anyhow::bail!(
            "workflow failed: {}",
            record.fatal_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Handle export operations (JSON and CSV) for both text and JSON modes.
fn handle_exports(args: &Cli, record: &crate::model::RunRecord) -> Result<()> {
    if let Some(p) = args.export_json.as_deref() {
        crate::storage::export_json(p, record)?;
    }
    if let Some(p) = args.export_csv.as_deref() {
        crate::storage::export_csv(p, record)?;
    }
    Ok(())
}
