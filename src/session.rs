use crate::model::{
    ExecutionConfig, PromptInfo, RunConfig, RunOutcome, RunRecord, RunState, StepResult,
    StepStatus, WorkflowEvent,
};

/// Success/failure counts derived from the results accumulated so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub attempted: usize,
}

/// One run's accumulated state. A session is a plain value: the engine folds
/// wire events into its own copy to produce the authoritative record, and each
/// UI folds a copy of its own for live display. All mutation goes through
/// `start_run`, `apply` and the two driver transitions; everything else reads.
#[derive(Debug, Clone)]
pub struct ExecutionSession {
    state: RunState,
    workspace_name: Option<String>,
    prompts: Vec<PromptInfo>,
    enabled: Vec<bool>,
    // 0-based index of the step the server reported as started, None before
    // the first start event and after the run settles.
    current_step: Option<usize>,
    results: Vec<StepResult>,
    final_output: String,
    fatal_error: Option<String>,
    total_steps: u32,
    server_total_time: Option<f64>,
}

impl ExecutionSession {
    pub fn new(prompts: Vec<PromptInfo>) -> Self {
        let enabled = vec![true; prompts.len()];
        let total_steps = prompts.len() as u32;
        Self {
            state: RunState::Idle,
            workspace_name: None,
            prompts,
            enabled,
            current_step: None,
            results: Vec::new(),
            final_output: String::new(),
            fatal_error: None,
            total_steps,
            server_total_time: None,
        }
    }

    /// Begin a fresh run: prior results and outputs are dropped, the step
    /// flags are taken from the config, and the session enters `Running`.
    pub fn start_run(&mut self, config: &ExecutionConfig) {
        self.results.clear();
        self.final_output.clear();
        self.fatal_error = None;
        self.current_step = None;
        self.server_total_time = None;
        self.enabled = config.enabled_steps.clone();
        self.state = RunState::Running;
    }

    /// Fold one wire event into the session. Events arriving after the run
    /// has settled are ignored, as are event kinds this client does not know.
    pub fn apply(&mut self, event: &WorkflowEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            WorkflowEvent::Init {
                workspace_name,
                total_steps,
            } => {
                if let Some(name) = workspace_name {
                    self.workspace_name = Some(name.clone());
                }
                if let Some(total) = total_steps {
                    self.total_steps = *total;
                }
            }
            WorkflowEvent::Start {
                step, total_steps, ..
            } => {
                self.current_step = Some(step.saturating_sub(1) as usize);
                if let Some(total) = total_steps {
                    self.total_steps = *total;
                }
            }
            WorkflowEvent::Complete {
                step,
                prompt_id,
                prompt_title,
                input,
                output,
                execution_time,
            } => {
                self.results.push(StepResult::success(
                    *step,
                    prompt_id.clone(),
                    prompt_title.clone(),
                    input.clone(),
                    output.clone(),
                    *execution_time,
                ));
            }
            WorkflowEvent::StepError {
                step,
                prompt_id,
                prompt_title,
                input,
                error,
                execution_time,
            } => {
                self.results.push(StepResult::failure(
                    *step,
                    prompt_id.clone(),
                    prompt_title.clone(),
                    input.clone(),
                    error.clone(),
                    *execution_time,
                ));
            }
            WorkflowEvent::WorkflowComplete {
                final_output,
                total_steps,
                total_time,
                ..
            } => {
                self.final_output = final_output.clone();
                if *total_steps > 0 {
                    self.total_steps = *total_steps;
                }
                self.server_total_time = *total_time;
                self.current_step = None;
                // The client's own results decide the terminal state, not the
                // server's success flag.
                self.state = if self.results.iter().any(|r| !r.succeeded()) {
                    RunState::CompletedWithErrors
                } else {
                    RunState::Completed
                };
            }
            WorkflowEvent::Aborted { .. } => {
                self.current_step = None;
                self.state = RunState::Aborted;
            }
            WorkflowEvent::Error { error } => {
                self.fatal_error = Some(error.clone());
                self.current_step = None;
                self.state = RunState::Failed;
            }
            WorkflowEvent::Unknown => {}
        }
    }

    /// Local cancellation settled: the run ends without an error. A no-op if
    /// the run already reached a terminal state.
    pub fn mark_aborted(&mut self) {
        if !self.state.is_terminal() {
            self.current_step = None;
            self.state = RunState::Aborted;
        }
    }

    /// The stream died for a reason other than cancellation. A no-op if the
    /// run already reached a terminal state.
    pub fn mark_fatal(&mut self, message: impl Into<String>) {
        if !self.state.is_terminal() {
            self.fatal_error = Some(message.into());
            self.current_step = None;
            self.state = RunState::Failed;
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_executing(&self) -> bool {
        self.state.is_running()
    }

    pub fn workspace_name(&self) -> Option<&str> {
        self.workspace_name.as_deref()
    }

    pub fn set_workspace_name(&mut self, name: impl Into<String>) {
        self.workspace_name = Some(name.into());
    }

    pub fn prompts(&self) -> &[PromptInfo] {
        &self.prompts
    }

    pub fn step_enabled(&self, index: usize) -> bool {
        self.enabled.get(index).copied().unwrap_or(false)
    }

    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn final_output(&self) -> &str {
        &self.final_output
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    /// Display status of the step at `index` (0-based). A step that produced
    /// a result reports that result even while the server moves on; a step
    /// that never ran (disabled, or not reached) stays pending.
    pub fn step_status(&self, index: usize) -> StepStatus {
        let step_no = (index + 1) as u32;
        if let Some(result) = self.results.iter().find(|r| r.step == step_no) {
            return if result.succeeded() {
                StepStatus::Success
            } else {
                StepStatus::Error
            };
        }
        if self.state.is_running() && self.current_step == Some(index) {
            return StepStatus::Running;
        }
        StepStatus::Pending
    }

    pub fn progress(&self) -> ProgressSummary {
        let succeeded = self.results.iter().filter(|r| r.succeeded()).count();
        ProgressSummary {
            succeeded,
            failed: self.results.len() - succeeded,
            attempted: self.results.len(),
        }
    }

    /// Terminal outcome, None while idle or running.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.state {
            RunState::Completed => Some(RunOutcome::Completed),
            RunState::CompletedWithErrors => Some(RunOutcome::CompletedWithErrors),
            RunState::Aborted => Some(RunOutcome::Aborted),
            RunState::Failed => Some(RunOutcome::Failed),
            RunState::Idle | RunState::Running => None,
        }
    }

    /// Snapshot the settled run as a persistable record. The server's own
    /// total time wins over the client wall clock when it reported one.
    pub fn to_record(
        &self,
        run_id: String,
        timestamp_utc: String,
        run: &RunConfig,
        config: &ExecutionConfig,
        elapsed_secs: f64,
    ) -> RunRecord {
        RunRecord {
            run_id,
            timestamp_utc,
            workspace_id: run.workspace_id,
            workspace_name: self.workspace_name.clone(),
            comments: run.comments.clone(),
            config: config.clone(),
            results: self.results.clone(),
            final_output: self.final_output.clone(),
            fatal_error: self.fatal_error.clone(),
            outcome: self.outcome().unwrap_or(RunOutcome::Aborted),
            completed_steps: self.progress().succeeded as u32,
            total_steps: self.total_steps,
            total_time: self.server_total_time.unwrap_or(elapsed_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn prompts(n: usize) -> Vec<PromptInfo> {
        (1..=n)
            .map(|i| PromptInfo {
                id: i.to_string(),
                title: format!("Prompt {i}"),
                category: None,
            })
            .collect()
    }

    fn running_session(n: usize) -> (ExecutionSession, ExecutionConfig) {
        let config = ExecutionConfig::new(n);
        let mut session = ExecutionSession::new(prompts(n));
        session.start_run(&config);
        (session, config)
    }

    fn start(step: u32) -> WorkflowEvent {
        WorkflowEvent::Start {
            step,
            prompt_id: Some(step.to_string()),
            prompt_title: Some(format!("Prompt {step}")),
            total_steps: None,
        }
    }

    fn complete(step: u32, output: &str) -> WorkflowEvent {
        WorkflowEvent::Complete {
            step,
            prompt_id: step.to_string(),
            prompt_title: format!("Prompt {step}"),
            input: Some("(no input)".to_string()),
            output: output.to_string(),
            execution_time: 0.4,
        }
    }

    fn step_error(step: u32, error: &str) -> WorkflowEvent {
        WorkflowEvent::StepError {
            step,
            prompt_id: step.to_string(),
            prompt_title: format!("Prompt {step}"),
            input: None,
            error: error.to_string(),
            execution_time: 0.2,
        }
    }

    fn workflow_complete(final_output: &str, success: bool) -> WorkflowEvent {
        WorkflowEvent::WorkflowComplete {
            final_output: final_output.to_string(),
            completed_steps: 0,
            total_steps: 0,
            success,
            total_time: None,
        }
    }

    fn test_run_config() -> RunConfig {
        RunConfig {
            base_url: "http://localhost:5000".into(),
            workspace_id: 7,
            token: None,
            user_agent: "promptchain-test".into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            comments: Some("unit test".into()),
        }
    }

    #[test]
    fn full_run_folds_to_completed() {
        let (mut session, _) = running_session(3);
        session.apply(&WorkflowEvent::Init {
            workspace_name: Some("Research".into()),
            total_steps: Some(3),
        });
        for step in 1..=3 {
            session.apply(&start(step));
            assert_eq!(session.current_step(), Some(step as usize - 1));
            assert_eq!(session.step_status(step as usize - 1), StepStatus::Running);
            session.apply(&complete(step, &format!("output {step}")));
        }
        session.apply(&workflow_complete("output 3", true));

        assert_eq!(session.state(), RunState::Completed);
        assert!(!session.is_executing());
        assert_eq!(session.workspace_name(), Some("Research"));
        assert_eq!(session.results().len(), 3);
        assert_eq!(session.final_output(), "output 3");
        assert_eq!(session.current_step(), None);
        assert_eq!(
            session.progress(),
            ProgressSummary {
                succeeded: 3,
                failed: 0,
                attempted: 3
            }
        );
        for i in 0..3 {
            assert_eq!(session.step_status(i), StepStatus::Success);
        }
    }

    #[test]
    fn failed_step_makes_the_run_completed_with_errors() {
        let (mut session, _) = running_session(3);
        session.apply(&start(1));
        session.apply(&complete(1, "one"));
        session.apply(&start(2));
        session.apply(&step_error(2, "model refused"));
        session.apply(&start(3));
        session.apply(&complete(3, "three"));
        // The server may still report overall success; the client's own
        // results decide.
        session.apply(&workflow_complete("three", true));

        assert_eq!(session.state(), RunState::CompletedWithErrors);
        assert_eq!(session.step_status(1), StepStatus::Error);
        assert_eq!(
            session.progress(),
            ProgressSummary {
                succeeded: 2,
                failed: 1,
                attempted: 3
            }
        );
    }

    #[test]
    fn stop_on_error_run_ends_after_the_failing_step() {
        let (mut session, _) = running_session(3);
        session.apply(&start(1));
        session.apply(&complete(1, "one"));
        session.apply(&start(2));
        session.apply(&step_error(2, "boom"));
        session.apply(&workflow_complete("one", false));

        assert_eq!(session.state(), RunState::CompletedWithErrors);
        assert_eq!(session.results().len(), 2);
        // Step 3 was never attempted.
        assert_eq!(session.step_status(2), StepStatus::Pending);
        assert_eq!(session.final_output(), "one");
    }

    #[test]
    fn abort_mid_run_keeps_partial_results_and_no_error() {
        let (mut session, _) = running_session(3);
        session.apply(&start(1));
        session.apply(&complete(1, "one"));
        session.apply(&start(2));
        session.mark_aborted();

        assert_eq!(session.state(), RunState::Aborted);
        assert_eq!(session.results().len(), 1);
        assert!(session.fatal_error().is_none());
        assert!(!session.is_executing());
        assert_eq!(session.current_step(), None);
        assert_eq!(session.outcome(), Some(RunOutcome::Aborted));
    }

    #[test]
    fn disabled_steps_stay_pending_and_produce_no_result() {
        let mut config = ExecutionConfig::new(3);
        config.toggle_step(1);
        let mut session = ExecutionSession::new(prompts(3));
        session.start_run(&config);

        session.apply(&start(1));
        assert_eq!(session.step_status(1), StepStatus::Pending);
        session.apply(&complete(1, "one"));
        session.apply(&start(3));
        assert_eq!(session.step_status(1), StepStatus::Pending);
        session.apply(&complete(3, "three"));
        session.apply(&workflow_complete("three", true));

        assert_eq!(session.state(), RunState::Completed);
        assert_eq!(session.results().len(), 2);
        assert!(session.results().iter().all(|r| r.step != 2));
        assert_eq!(session.step_status(1), StepStatus::Pending);
        assert!(!session.step_enabled(1));
    }

    #[test]
    fn events_after_a_terminal_state_are_ignored() {
        let (mut session, _) = running_session(2);
        session.apply(&start(1));
        session.apply(&complete(1, "one"));
        session.apply(&workflow_complete("one", true));
        assert_eq!(session.state(), RunState::Completed);

        session.apply(&step_error(2, "late"));
        session.apply(&WorkflowEvent::Error {
            error: "late failure".into(),
        });
        session.mark_aborted();
        session.mark_fatal("late transport failure");

        assert_eq!(session.state(), RunState::Completed);
        assert_eq!(session.results().len(), 1);
        assert!(session.fatal_error().is_none());
    }

    #[test]
    fn unknown_events_change_nothing() {
        let (mut session, _) = running_session(2);
        session.apply(&start(1));
        let before_results = session.results().len();
        session.apply(&WorkflowEvent::Unknown);
        assert_eq!(session.state(), RunState::Running);
        assert_eq!(session.results().len(), before_results);
        assert_eq!(session.current_step(), Some(0));
    }

    #[test]
    fn results_only_ever_grow() {
        let (mut session, _) = running_session(3);
        let events = [
            start(1),
            complete(1, "one"),
            start(2),
            step_error(2, "bad"),
            start(3),
            complete(3, "three"),
        ];
        let mut prev = 0;
        for event in &events {
            session.apply(event);
            assert!(session.results().len() >= prev);
            prev = session.results().len();
        }
        assert_eq!(prev, 3);
        // Entries keep their completion order.
        let steps: Vec<u32> = session.results().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[test]
    fn error_event_sets_fatal_error() {
        let (mut session, _) = running_session(2);
        session.apply(&start(1));
        session.apply(&WorkflowEvent::Error {
            error: "workspace not found".into(),
        });
        assert_eq!(session.state(), RunState::Failed);
        assert_eq!(session.fatal_error(), Some("workspace not found"));
        assert_eq!(session.outcome(), Some(RunOutcome::Failed));
    }

    #[test]
    fn transport_failure_is_distinct_from_abort() {
        let (mut session, _) = running_session(2);
        session.mark_fatal("connection reset by peer");
        assert_eq!(session.state(), RunState::Failed);
        assert_eq!(session.fatal_error(), Some("connection reset by peer"));

        let (mut session, _) = running_session(2);
        session.mark_aborted();
        assert_eq!(session.state(), RunState::Aborted);
        assert!(session.fatal_error().is_none());
    }

    #[test]
    fn starting_a_new_run_clears_the_previous_one() {
        let (mut session, config) = running_session(2);
        session.apply(&start(1));
        session.apply(&step_error(1, "bad"));
        session.apply(&workflow_complete("", false));
        assert_eq!(session.state(), RunState::CompletedWithErrors);

        session.start_run(&config);
        assert_eq!(session.state(), RunState::Running);
        assert!(session.results().is_empty());
        assert_eq!(session.final_output(), "");
        assert!(session.fatal_error().is_none());
        assert_eq!(session.current_step(), None);
        assert_eq!(session.step_status(0), StepStatus::Pending);
    }

    #[test]
    fn record_round_trips_through_serde() {
        let (mut session, config) = running_session(2);
        session.apply(&WorkflowEvent::Init {
            workspace_name: Some("Research".into()),
            total_steps: Some(2),
        });
        session.apply(&start(1));
        session.apply(&complete(1, "one"));
        session.apply(&start(2));
        session.apply(&complete(2, "two"));
        session.apply(&workflow_complete("two", true));

        let record = session.to_record(
            "abc123".into(),
            "2026-08-23T10:00:00Z".into(),
            &test_run_config(),
            &config,
            4.2,
        );
        let json = serde_json::to_string(&record).unwrap();
        let decoded: RunRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            serde_json::to_value(&decoded).unwrap()
        );
        assert_eq!(decoded.outcome, RunOutcome::Completed);
        assert_eq!(decoded.results.len(), 2);
        assert_eq!(decoded.final_output, "two");
        assert_eq!(decoded.completed_steps, 2);
        assert_eq!(decoded.workspace_name.as_deref(), Some("Research"));
    }

    #[test]
    fn server_reported_total_time_wins_in_the_record() {
        let (mut session, config) = running_session(1);
        session.apply(&start(1));
        session.apply(&complete(1, "one"));
        session.apply(&WorkflowEvent::WorkflowComplete {
            final_output: "one".into(),
            completed_steps: 1,
            total_steps: 1,
            success: true,
            total_time: Some(2.5),
        });
        let record = session.to_record(
            "id".into(),
            "2026-08-23T10:00:00Z".into(),
            &test_run_config(),
            &config,
            9.9,
        );
        assert_eq!(record.total_time, 2.5);

        let (mut session, config) = running_session(1);
        session.apply(&complete(1, "one"));
        session.apply(&workflow_complete("one", true));
        let record = session.to_record(
            "id".into(),
            "2026-08-23T10:00:00Z".into(),
            &test_run_config(),
            &config,
            9.9,
        );
        assert_eq!(record.total_time, 9.9);
    }
}
