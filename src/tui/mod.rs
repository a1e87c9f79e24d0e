mod export;
mod help;

use crate::cli::{build_execution_config, build_run_config, Cli};
use crate::engine::api::WorkflowApi;
use crate::model::{
    ExecutionConfig, PromptInfo, RunEvent, RunOutcome, RunRecord, RunState, StepStatus,
    WorkflowEvent,
};
use crate::orchestrator::{self, UiCommand};
use crate::session::ExecutionSession;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::Color,
    style::Modifier,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs, Wrap},
    Terminal,
};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

struct AppState {
    tab: usize,
    info: String,
    comments: Option<String>,

    /// The UI's own fold of the event stream; the authoritative record
    /// replaces its ending when the run settles.
    session: ExecutionSession,
    /// Next run's knobs. Locked while a run is active.
    exec: ExecutionConfig,
    selected_step: usize,
    /// Track the newest step in the output pane until the user navigates.
    follow_steps: bool,

    last_record: Option<RunRecord>,
    history: Vec<RunRecord>,
    history_selected: usize, // Index of selected history item (0 = most recent)
    history_scroll_offset: usize,
    history_loaded_count: usize,
    initial_history_load_size: usize, // Initial load size based on terminal height

    auto_save: bool,
    last_exported_path: Option<String>,
}

impl AppState {
    fn new(
        args: &Cli,
        prompts: Vec<PromptInfo>,
        workspace_name: Option<String>,
        exec: ExecutionConfig,
        initial_load: usize,
    ) -> Self {
        let mut session = ExecutionSession::new(prompts);
        if let Some(name) = workspace_name {
            session.set_workspace_name(name);
        }
        Self {
            tab: 0,
            info: String::new(),
            comments: args.comments.clone(),
            session,
            exec,
            selected_step: 0,
            follow_steps: true,
            last_record: None,
            history: Vec::new(),
            history_selected: 0,
            history_scroll_offset: 0,
            history_loaded_count: 0,
            initial_history_load_size: initial_load,
            auto_save: args.auto_save,
            last_exported_path: None,
        }
    }
}

fn push_wrapped_status_kv(
    out: &mut Vec<Line<'static>>,
    label: &str,
    value: &str,
    status_area_width: u16,
) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }

    // Account for borders (2 chars on each side)
    let usable_width = status_area_width.saturating_sub(4).max(1);
    let label_text = format!("{label}:");
    let label_width = label_text.chars().count() as u16;

    let value_chars: Vec<char> = value.chars().collect();
    let mut remaining = value_chars.as_slice();
    let mut first = true;

    while !remaining.is_empty() {
        let line_width = if first {
            usable_width.saturating_sub(label_width + 1).max(1)
        } else {
            usable_width.saturating_sub(2).max(1)
        };

        let chars_to_take = (remaining.len() as u16).min(line_width) as usize;
        let (line_chars, rest) = remaining.split_at(chars_to_take);
        let line_text: String = line_chars.iter().collect();

        if first {
            out.push(Line::from(vec![
                Span::styled(label_text.clone(), Style::default().fg(Color::Gray)),
                Span::raw(" "),
                Span::raw(line_text),
            ]));
            first = false;
        } else {
            out.push(Line::from(vec![Span::raw("  "), Span::raw(line_text)]));
        }

        remaining = rest;
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_run_config(&args);
    let api = WorkflowApi::new(&cfg)?;
    // Resolve the workspace before the terminal takes over so connection
    // problems print as ordinary errors. The name is cosmetic; the prompt
    // sequence is required.
    let workspace_name = api
        .fetch_workspace(cfg.workspace_id)
        .await
        .ok()
        .map(|w| w.name);
    let prompts = api.fetch_prompts(cfg.workspace_id).await?;
    let exec = build_execution_config(&args, prompts.len())?;

    // Unbounded channels avoid backpressure and task switching in the hot path.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_prompts = prompts.clone();
    let ui_handle = std::thread::spawn(move || {
        run_threaded(ui_args, ui_prompts, workspace_name, exec, event_rx, cmd_tx)
    });

    let res = orchestrator::run_controller(&args, prompts, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    args: Cli,
    prompts: Vec<PromptInfo>,
    workspace_name: Option<String>,
    exec: ExecutionConfig,
    mut event_rx: UnboundedReceiver<RunEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let initial_load = terminal
        .size()
        .map(|size| ((size.height as usize).saturating_sub(2) * 3).max(20))
        .unwrap_or(60);

    // AppState is owned by the UI thread only; no cross-thread mutation.
    let mut state = AppState::new(&args, prompts, workspace_name, exec, initial_load);
    state.history = crate::storage::load_recent(initial_load).unwrap_or_default();
    state.history_loaded_count = state.history.len();

    if args.run_on_launch && state.exec.validate(state.session.prompts().len()).is_ok() {
        // The controller spawns the launch run itself; mirror it locally so
        // the dashboard shows it active from the first frame.
        state.session.start_run(&state.exec);
        state.info = "Starting run...".into();
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive; unbounded channel avoids backpressure.
        while let Ok(ev) = event_rx.try_recv() {
            match ev {
                RunEvent::RunCompleted { record } => {
                    handle_run_completed(&args, &mut state, *record);
                }
                RunEvent::Workflow(event) => apply_workflow_event(&mut state, event),
                RunEvent::Info(info) => state.info = info.to_message(),
            }
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('r')) => {
                        if state.tab == 1 {
                            let reload_size = state
                                .initial_history_load_size
                                .max(state.history_loaded_count);
                            match crate::storage::load_recent(reload_size) {
                                Ok(new_history) => {
                                    let old_count = state.history.len();
                                    state.history = new_history;
                                    state.history_loaded_count = state.history.len();
                                    clamp_history_selection(&mut state);

                                    let new_count = state.history.len();
                                    if new_count > old_count {
                                        state.info = format!(
                                            "Refreshed: {} new run(s)",
                                            new_count - old_count
                                        );
                                    } else if new_count < old_count {
                                        state.info = format!(
                                            "Refreshed: {} run(s) removed",
                                            old_count - new_count
                                        );
                                    } else {
                                        state.info = "Refreshed".into();
                                    }
                                }
                                Err(e) => {
                                    state.info = format!("Refresh failed: {e:#}");
                                }
                            }
                        } else if state.session.is_executing() {
                            state.info = "A run is already active, press x to stop it".into();
                        } else {
                            match state.exec.validate(state.session.prompts().len()) {
                                Ok(()) => {
                                    // Reset the fold before the first event of
                                    // the new run can arrive.
                                    state.session.start_run(&state.exec);
                                    state.follow_steps = true;
                                    state.info = "Starting run...".into();
                                    let _ = cmd_tx.send(UiCommand::Execute(state.exec.clone()));
                                }
                                Err(e) => {
                                    state.info = format!("Cannot start run: {e}");
                                }
                            }
                        }
                    }
                    (_, KeyCode::Char('x')) => {
                        if state.session.is_executing() {
                            let _ = cmd_tx.send(UiCommand::Stop);
                        } else {
                            state.info = "No active run to stop".into();
                        }
                    }
                    (_, KeyCode::Char('s')) => {
                        if state.tab == 0 {
                            if let Some(record) = state.last_record.clone() {
                                export::save_and_show_path(&record, &mut state);
                            } else {
                                state.info = "No completed run to save yet.".into();
                            }
                        }
                    }
                    (_, KeyCode::Char(' ')) => {
                        if state.tab == 0 && !state.session.is_executing() {
                            state.exec.toggle_step(state.selected_step);
                        }
                    }
                    (_, KeyCode::Char('A')) => {
                        if state.tab == 0 && !state.session.is_executing() {
                            state.exec.set_all_steps(true);
                        }
                    }
                    (_, KeyCode::Char('D')) => {
                        if state.tab == 0 && !state.session.is_executing() {
                            state.exec.set_all_steps(false);
                        }
                    }
                    (_, KeyCode::Char('o')) => {
                        if state.tab == 0 && !state.session.is_executing() {
                            state.exec.stop_on_error = !state.exec.stop_on_error;
                        }
                    }
                    (_, KeyCode::Char('+')) | (_, KeyCode::Char('=')) => {
                        if state.tab == 0 && !state.session.is_executing() {
                            let t = state.exec.temperature;
                            state.exec.set_temperature(t + 0.1);
                        }
                    }
                    (_, KeyCode::Char('-')) => {
                        if state.tab == 0 && !state.session.is_executing() {
                            let t = state.exec.temperature;
                            state.exec.set_temperature(t - 0.1);
                        }
                    }
                    (_, KeyCode::Char('e')) => {
                        if state.tab == 1
                            && !state.history.is_empty()
                            && state.history_selected < state.history.len()
                        {
                            let record = &state.history[state.history_selected];
                            match export::export_record_json(record) {
                                Ok(p) => {
                                    state.last_exported_path =
                                        Some(p.to_string_lossy().to_string());
                                    state.info = format!(
                                        "Exported JSON: {} (press 'y' to copy path)",
                                        p.display()
                                    );
                                }
                                Err(e) => {
                                    state.info = format!("JSON export failed: {e:#}");
                                }
                            }
                        }
                    }
                    (_, KeyCode::Char('c')) => {
                        if state.tab == 1
                            && !state.history.is_empty()
                            && state.history_selected < state.history.len()
                        {
                            let record = &state.history[state.history_selected];
                            match export::export_record_csv(record) {
                                Ok(p) => {
                                    state.last_exported_path =
                                        Some(p.to_string_lossy().to_string());
                                    state.info = format!(
                                        "Exported CSV: {} (press 'y' to copy path)",
                                        p.display()
                                    );
                                }
                                Err(e) => {
                                    state.info = format!("CSV export failed: {e:#}");
                                }
                            }
                        }
                    }
                    (_, KeyCode::Char('y')) => {
                        if state.tab == 1 {
                            if let Some(ref path) = state.last_exported_path {
                                match export::copy_to_clipboard(path) {
                                    Ok(_) => {
                                        state.info = format!(
                                            "✓ Copied to clipboard: {}",
                                            shorten_path(path, 60)
                                        );
                                    }
                                    Err(e) => {
                                        state.info = format!("Clipboard copy failed: {e:#}");
                                    }
                                }
                            } else {
                                state.info =
                                    "No exported file path to copy. Export a file first (e/c)"
                                        .into();
                            }
                        }
                    }
                    (_, KeyCode::Char('a')) => {
                        state.auto_save = !state.auto_save;
                        state.info = if state.auto_save {
                            "Auto-save enabled".into()
                        } else {
                            "Auto-save disabled".into()
                        };
                    }
                    (_, KeyCode::Tab) => {
                        let new_tab = (state.tab + 1) % 3;
                        state.tab = new_tab;
                        if new_tab == 1 {
                            state.history_selected = 0;
                            state.history_scroll_offset = 0;
                        }
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        if state.tab == 0 {
                            if state.selected_step > 0 {
                                state.selected_step -= 1;
                            }
                            state.follow_steps = false;
                        } else if state.tab == 1
                            && !state.history.is_empty()
                            && state.history_selected > 0
                        {
                            state.history_selected -= 1;
                            if state.history_selected < state.history_scroll_offset {
                                state.history_scroll_offset = state.history_selected;
                            }
                        }
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        if state.tab == 0 {
                            if state.selected_step + 1 < state.session.prompts().len() {
                                state.selected_step += 1;
                            }
                            state.follow_steps = false;
                        } else if state.tab == 1
                            && !state.history.is_empty()
                            && state.history_selected < state.history.len().saturating_sub(1)
                        {
                            state.history_selected += 1;
                            let estimated_max_items = 30;
                            if state.history_selected
                                >= state.history_scroll_offset + estimated_max_items
                            {
                                state.history_scroll_offset = state
                                    .history_selected
                                    .saturating_sub(estimated_max_items - 1);
                            }

                            // Load more records when the selection nears the
                            // end of what storage has handed us so far.
                            let load_threshold = state.history_loaded_count.saturating_sub(10);
                            if state.history_selected >= load_threshold
                                && state.history_loaded_count == state.history.len()
                            {
                                let load_more = state.history.len().max(20) * 2;
                                if let Ok(more_history) = crate::storage::load_recent(load_more) {
                                    let existing_ids: std::collections::HashSet<_> =
                                        state.history.iter().map(|r| r.run_id.clone()).collect();
                                    let new_items: Vec<_> = more_history
                                        .into_iter()
                                        .filter(|r| !existing_ids.contains(&r.run_id))
                                        .collect();
                                    if !new_items.is_empty() {
                                        state.history.extend(new_items);
                                        state.history_loaded_count = state.history.len();
                                    }
                                }
                            }
                        }
                    }
                    (_, KeyCode::Char('d')) => {
                        if state.tab == 1
                            && !state.history.is_empty()
                            && state.history_selected < state.history.len()
                        {
                            let to_delete = state.history[state.history_selected].clone();
                            if let Err(e) = crate::storage::delete_run(&to_delete) {
                                state.info = format!("Delete failed: {e:#}");
                            } else {
                                state.history.remove(state.history_selected);
                                state.history_loaded_count =
                                    state.history_loaded_count.saturating_sub(1);
                                clamp_history_selection(&mut state);
                                state.info = "Deleted".into();
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

/// Fold one wire event into the UI's session and keep the output pane on the
/// newest step while the user has not taken over the selection.
fn apply_workflow_event(state: &mut AppState, event: WorkflowEvent) {
    state.session.apply(&event);
    if state.follow_steps {
        if let Some(current) = state.session.current_step() {
            state.selected_step = current;
        } else if let Some(last) = state.session.results().last() {
            state.selected_step = (last.step as usize).saturating_sub(1);
        }
    }
}

fn clamp_history_selection(state: &mut AppState) {
    if state.history.is_empty() {
        state.history_selected = 0;
        state.history_scroll_offset = 0;
        return;
    }
    if state.history_selected >= state.history.len() {
        state.history_selected = state.history.len() - 1;
    }
    if state.history_scroll_offset >= state.history.len() {
        state.history_scroll_offset = state.history.len().saturating_sub(20);
    }
}

/// Adopt the authoritative record once the run settles. The terminal wire
/// event has normally ended the fold already; a local cancel or transport
/// failure only shows up in the record's outcome.
fn handle_run_completed(args: &Cli, state: &mut AppState, record: RunRecord) {
    match record.outcome {
        RunOutcome::Aborted => state.session.mark_aborted(),
        RunOutcome::Failed => state.session.mark_fatal(
            record
                .fatal_error
                .clone()
                .unwrap_or_else(|| "stream ended unexpectedly".into()),
        ),
        _ => {}
    }

    let reload_size = (state.history_loaded_count + 1).max(state.initial_history_load_size);
    let processed =
        orchestrator::process_run_completion(args, reload_size, state.auto_save, &record);

    state.info = format!("Run {}", record.outcome.label());
    if let Some(path) = processed.auto_saved_path.as_ref() {
        state.info = format!("Saved: {}", path.display());
    }
    if !processed.export_messages.is_empty() {
        state.info = processed.export_messages.join("; ");
    }

    state.last_record = Some(processed.record);
    state.history = processed.history;
    state.history_loaded_count = state.history.len();
    if state.tab == 1 {
        state.history_selected = 0;
        state.history_scroll_offset = 0;
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from("History"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("promptchain"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        1 => draw_history(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &AppState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(6), Constraint::Length(7)].as_ref())
        .split(area);

    let row = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(42), Constraint::Percentage(58)].as_ref())
        .split(main[0]);

    draw_steps(row[0], f, state);
    draw_output(row[1], f, state);
    draw_status(main[1], f, state);
}

fn step_symbol(status: StepStatus) -> (&'static str, Color) {
    match status {
        StepStatus::Pending => ("·", Color::DarkGray),
        StepStatus::Running => ("▶", Color::Yellow),
        StepStatus::Success => ("✓", Color::Green),
        StepStatus::Error => ("✗", Color::Red),
    }
}

fn state_color(state: RunState) -> Color {
    match state {
        RunState::Idle => Color::Gray,
        RunState::Running => Color::Yellow,
        RunState::Completed => Color::Green,
        RunState::CompletedWithErrors => Color::Yellow,
        RunState::Aborted => Color::DarkGray,
        RunState::Failed => Color::Red,
    }
}

fn outcome_color(outcome: RunOutcome) -> Color {
    match outcome {
        RunOutcome::Completed => Color::Green,
        RunOutcome::CompletedWithErrors => Color::Yellow,
        RunOutcome::Aborted => Color::DarkGray,
        RunOutcome::Failed => Color::Red,
    }
}

fn draw_steps(area: Rect, f: &mut ratatui::Frame, state: &AppState) {
    let mut lines: Vec<Line> = Vec::new();
    let max_items = (area.height as usize).saturating_sub(2).max(1);
    // Keep the selection visible for workflows longer than the pane.
    let scroll = state
        .selected_step
        .saturating_sub(max_items.saturating_sub(1));
    let title_width = (area.width as usize).saturating_sub(22).max(8);

    for (index, prompt) in state
        .session
        .prompts()
        .iter()
        .enumerate()
        .skip(scroll)
        .take(max_items)
    {
        let is_selected = index == state.selected_step;
        let enabled = state
            .exec
            .enabled_steps
            .get(index)
            .copied()
            .unwrap_or(true);
        let (symbol, symbol_color) = step_symbol(state.session.step_status(index));
        let time = state
            .session
            .results()
            .iter()
            .find(|r| r.step == (index + 1) as u32)
            .map(|r| format!("{:>6.1}s", r.execution_time))
            .unwrap_or_default();

        let base = if is_selected {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::REVERSED)
        } else if enabled {
            Style::default()
        } else {
            Style::default().fg(Color::DarkGray)
        };

        lines.push(Line::from(vec![
            Span::styled(if is_selected { "> " } else { "  " }, base),
            Span::styled(
                format!("{:>2}. ", index + 1),
                if is_selected {
                    base
                } else {
                    Style::default().fg(Color::Gray)
                },
            ),
            Span::styled(if enabled { "[x] " } else { "[ ] " }, base),
            Span::styled(
                format!("{symbol} "),
                if is_selected {
                    base
                } else {
                    Style::default().fg(symbol_color)
                },
            ),
            Span::styled(format!("{:<w$.w$}", prompt.title, w = title_width), base),
            Span::styled(
                time,
                if is_selected {
                    base
                } else {
                    Style::default().fg(Color::Gray)
                },
            ),
        ]));
    }

    if state.session.prompts().is_empty() {
        lines.push(Line::from("No prompts in this workspace."));
    }

    let title = format!(
        "Steps ({} enabled of {})",
        state.exec.enabled_count(),
        state.session.prompts().len()
    );
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_output(area: Rect, f: &mut ratatui::Frame, state: &AppState) {
    if let Some(err) = state.session.fatal_error() {
        let split = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)].as_ref())
            .split(area);
        draw_step_detail(split[0], f, state);
        let p = Paragraph::new(err.to_string())
            .wrap(Wrap { trim: false })
            .style(Style::default().fg(Color::Red))
            .block(Block::default().borders(Borders::ALL).title("Run failed"));
        f.render_widget(p, split[1]);
        return;
    }

    let final_output = state.session.final_output();
    if state.session.state().is_terminal() && !final_output.is_empty() {
        let split = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)].as_ref())
            .split(area);
        draw_step_detail(split[0], f, state);
        let p = Paragraph::new(final_output.to_string())
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Final output"));
        f.render_widget(p, split[1]);
    } else {
        draw_step_detail(area, f, state);
    }
}

fn draw_step_detail(area: Rect, f: &mut ratatui::Frame, state: &AppState) {
    let index = state.selected_step;
    let step_no = (index + 1) as u32;
    let title = state
        .session
        .prompts()
        .get(index)
        .map(|p| p.title.as_str())
        .unwrap_or("step");

    let result = state.session.results().iter().find(|r| r.step == step_no);
    let (block_title, body, color) = match result {
        Some(r) => {
            let mut body: Vec<Line> = Vec::new();
            if let Some(input) = r.input.as_deref() {
                if !input.is_empty() {
                    body.push(Line::from(vec![
                        Span::styled("Input: ", Style::default().fg(Color::Gray)),
                        Span::styled(excerpt(input, 120), Style::default().fg(Color::Gray)),
                    ]));
                    body.push(Line::from(""));
                }
            }
            match r.error.as_deref() {
                None => {
                    for line in r.output.as_deref().unwrap_or_default().lines() {
                        body.push(Line::from(line.to_string()));
                    }
                    (
                        format!("Step {}: {} ({:.1}s)", step_no, title, r.execution_time),
                        body,
                        None,
                    )
                }
                Some(err) => {
                    body.push(Line::from(Span::styled(
                        err.to_string(),
                        Style::default().fg(Color::Red),
                    )));
                    (
                        format!(
                            "Step {}: {} failed ({:.1}s)",
                            step_no, title, r.execution_time
                        ),
                        body,
                        Some(Color::Red),
                    )
                }
            }
        }
        None => match state.session.step_status(index) {
            StepStatus::Running => (
                format!("Step {}: {}", step_no, title),
                vec![Line::from("Running...")],
                Some(Color::Yellow),
            ),
            _ => (format!("Step {}: {}", step_no, title), Vec::new(), None),
        },
    };

    let mut p = Paragraph::new(body)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title(block_title));
    if let Some(c) = color {
        p = p.style(Style::default().fg(c));
    }
    f.render_widget(p, area);
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &AppState) {
    let progress = state.session.progress();
    let run_state = state.session.state();

    let mut lines = vec![
        Line::from(vec![
            Span::styled("Workspace: ", Style::default().fg(Color::Gray)),
            Span::raw(state.session.workspace_name().unwrap_or("-").to_string()),
            Span::raw("   "),
            Span::styled("Model: ", Style::default().fg(Color::Gray)),
            Span::raw(state.exec.model.clone()),
            Span::raw("   "),
            Span::styled("Temp: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{:.1}", state.exec.temperature)),
            Span::raw("   "),
            Span::styled("Stop-on-error: ", Style::default().fg(Color::Gray)),
            Span::raw(if state.exec.stop_on_error { "on" } else { "off" }),
        ]),
        Line::from(vec![
            Span::styled("State: ", Style::default().fg(Color::Gray)),
            Span::styled(
                run_state.label(),
                Style::default().fg(state_color(run_state)),
            ),
            Span::raw("   "),
            Span::styled("Progress: ", Style::default().fg(Color::Gray)),
            Span::raw(format!(
                "{} ok / {} failed / {} enabled",
                progress.succeeded,
                progress.failed,
                state.exec.enabled_count()
            )),
            Span::raw("   "),
            Span::styled("Auto-save: ", Style::default().fg(Color::Gray)),
            Span::styled(
                if state.auto_save { "ON" } else { "OFF" },
                if state.auto_save {
                    Style::default().fg(Color::Green)
                } else {
                    Style::default().fg(Color::Red)
                },
            ),
        ]),
    ];

    if let Some(comments) = state.comments.as_deref() {
        push_wrapped_status_kv(&mut lines, "Comments", comments, area.width);
    }
    push_wrapped_status_kv(&mut lines, "Info", &state.info, area.width);

    lines.push(Line::from(
        "Keys: r run | x stop | space toggle | A/D all | o stop-on-err | +/- temp | s save | tab | ? help | q quit",
    ));

    let status =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(status, area);
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &AppState) {
    let mut lines: Vec<Line> = Vec::new();

    // Subtract 2 for the header lines
    let max_items = (area.height as usize).saturating_sub(2).max(1);

    let total_count = state.history.len();
    let current_pos = if total_count > 0 {
        state.history_selected + 1
    } else {
        0
    };

    lines.push(Line::from(vec![
        Span::raw(format!("History ({}/{}", current_pos, total_count)),
        if total_count > max_items {
            Span::raw(format!(", showing {} items", max_items))
        } else {
            Span::raw("")
        },
        Span::raw(") - "),
        Span::styled("↑/↓/j/k", Style::default().fg(Color::Magenta)),
        Span::raw(": navigate, "),
        Span::styled("r", Style::default().fg(Color::Magenta)),
        Span::raw(": refresh, "),
        Span::styled("d", Style::default().fg(Color::Magenta)),
        Span::raw(": delete, "),
        Span::styled("e", Style::default().fg(Color::Magenta)),
        Span::raw(": export JSON, "),
        Span::styled("c", Style::default().fg(Color::Magenta)),
        Span::raw(": export CSV"),
    ]));

    // Show export/refresh/delete feedback on this tab; run progress messages
    // belong to the dashboard.
    let history_info = state.info.starts_with("Exported")
        || state.info.contains("export failed")
        || state.info.starts_with("Refresh")
        || state.info == "Deleted"
        || state.info.starts_with("Delete failed")
        || state.info.starts_with("✓ Copied")
        || state.info.starts_with("Clipboard")
        || state.info.starts_with("No exported");
    if history_info {
        push_wrapped_status_kv(&mut lines, "Info", &state.info, area.width);
    }

    lines.push(Line::from(""));

    // Keep the selected item visible even when the offset went stale.
    let scroll_offset = {
        let mut offset = state
            .history_scroll_offset
            .min(state.history.len().saturating_sub(1));
        if state.history_selected < offset {
            offset = state.history_selected;
        } else if state.history_selected >= offset + max_items {
            offset = state.history_selected.saturating_sub(max_items - 1);
        }
        offset
    };

    let local_offset = time::UtcOffset::current_local_offset().ok();

    for (display_idx, record) in state
        .history
        .iter()
        .skip(scroll_offset)
        .take(max_items)
        .enumerate()
    {
        let history_idx = scroll_offset + display_idx;
        let is_selected = history_idx == state.history_selected;

        let style = if is_selected {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::REVERSED)
        } else {
            Style::default()
        };

        let dim = |color: Color| {
            if is_selected {
                style
            } else {
                Style::default().fg(color)
            }
        };

        lines.push(Line::from(vec![
            Span::styled(format!("{:>2}. ", history_idx + 1), dim(Color::Gray)),
            Span::styled(if is_selected { "> " } else { "  " }, style),
            Span::styled(
                format_timestamp(&record.timestamp_utc, local_offset),
                dim(Color::Gray),
            ),
            Span::raw("  "),
            Span::styled(
                format!("{:<14.14}", record.workspace_name.as_deref().unwrap_or("-")),
                dim(Color::Blue),
            ),
            Span::raw("  "),
            Span::styled(
                format!("{:<21}", record.outcome.label()),
                dim(outcome_color(record.outcome)),
            ),
            Span::styled(
                format!(
                    "{:>2}/{:<2} ok",
                    record.succeeded_count(),
                    record.total_steps
                ),
                if is_selected { style } else { Style::default() },
            ),
            Span::raw("  "),
            Span::styled(format!("{:>7.1}s", record.total_time), dim(Color::Gray)),
            Span::raw("  "),
            Span::styled(record.config.model.clone(), dim(Color::Magenta)),
        ]));
    }

    if state.history.is_empty() {
        lines.push(Line::from("No history available."));
    }

    if let Some(ref path) = state.last_exported_path {
        lines.push(Line::from(""));
        push_wrapped_status_kv(&mut lines, "Last exported", path, area.width);
        lines.push(Line::from(vec![
            Span::styled("Press ", Style::default().fg(Color::Gray)),
            Span::styled("y", Style::default().fg(Color::Magenta)),
            Span::styled(
                " to copy path to clipboard",
                Style::default().fg(Color::Gray),
            ),
        ]));
    }

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("History"));
    f.render_widget(p, area);
}

/// Render an RFC3339 timestamp for the history table, shifted into the given
/// offset when one is known and left in UTC otherwise.
fn format_timestamp(ts: &str, offset: Option<time::UtcOffset>) -> String {
    use time::format_description::well_known::Rfc3339;

    let format = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let parsed = match time::OffsetDateTime::parse(ts, &Rfc3339) {
        Ok(parsed) => parsed,
        Err(_) => return ts.to_string(),
    };

    match offset {
        Some(offset) if !offset.is_utc() => {
            let local = parsed.to_offset(offset);
            match local.format(format) {
                Ok(text) => {
                    let sign = if offset.is_negative() { '-' } else { '+' };
                    format!(
                        "{text} {sign}{:02}:{:02}",
                        offset.whole_hours().abs(),
                        (offset.whole_minutes() % 60).abs()
                    )
                }
                Err(_) => ts.to_string(),
            }
        }
        _ => match parsed.to_offset(time::UtcOffset::UTC).format(format) {
            Ok(text) => format!("{text} UTC"),
            Err(_) => ts.to_string(),
        },
    }
}

/// First line of `text`, truncated to at most `max` characters.
fn excerpt(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(max).collect();
        format!("{truncated}...")
    }
}

/// Shorten a long path to at most `max` characters for the info line.
/// Counts characters, not bytes, so multi-byte path components stay intact.
fn shorten_path(path: &str, max: usize) -> String {
    if path.chars().count() <= max {
        path.to_string()
    } else {
        let kept: String = path.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
