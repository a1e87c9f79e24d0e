use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const TEMPERATURE_MIN: f64 = 0.0;
pub const TEMPERATURE_MAX: f64 = 2.0;
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_url: String,
    pub workspace_id: u64,
    // Never written to disk or exports.
    #[serde(skip)]
    pub token: Option<String>,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub comments: Option<String>,
}

/// Request body for a streaming execution, and the per-run knobs the UI edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub initial_input: String,
    pub model: String,
    pub temperature: f64,
    pub stop_on_error: bool,
    pub enabled_steps: Vec<bool>,
}

impl ExecutionConfig {
    pub fn new(prompt_count: usize) -> Self {
        Self {
            initial_input: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 1.0,
            stop_on_error: true,
            enabled_steps: vec![true; prompt_count],
        }
    }

    /// Set the sampling temperature, clamped to the supported range.
    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature.clamp(TEMPERATURE_MIN, TEMPERATURE_MAX);
    }

    /// Flip one step's enabled flag. Out-of-range indices are ignored.
    pub fn toggle_step(&mut self, index: usize) {
        if let Some(flag) = self.enabled_steps.get_mut(index) {
            *flag = !*flag;
        }
    }

    pub fn set_all_steps(&mut self, enabled: bool) {
        for flag in &mut self.enabled_steps {
            *flag = enabled;
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled_steps.iter().filter(|e| **e).count()
    }

    /// Check the config against the workspace's prompt sequence. Failures here
    /// must be reported before any request goes out.
    pub fn validate(&self, prompt_count: usize) -> Result<(), ConfigError> {
        if prompt_count == 0 {
            return Err(ConfigError::EmptyWorkflow);
        }
        if self.enabled_steps.len() != prompt_count {
            return Err(ConfigError::StepCountMismatch {
                flags: self.enabled_steps.len(),
                prompts: prompt_count,
            });
        }
        if self.enabled_count() == 0 {
            return Err(ConfigError::NoStepsEnabled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("workspace has no prompts to run")]
    EmptyWorkflow,
    #[error("no steps are enabled")]
    NoStepsEnabled,
    #[error("step flags ({flags}) do not match the workspace prompt count ({prompts})")]
    StepCountMismatch { flags: usize, prompts: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prompt_count: u32,
    #[serde(default)]
    pub member_count: u32,
}

/// Server-sent progress events, tagged by `event_type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Init {
        #[serde(default)]
        workspace_name: Option<String>,
        #[serde(default)]
        total_steps: Option<u32>,
    },
    Start {
        step: u32,
        #[serde(default)]
        prompt_id: Option<String>,
        #[serde(default)]
        prompt_title: Option<String>,
        #[serde(default)]
        total_steps: Option<u32>,
    },
    Complete {
        step: u32,
        prompt_id: String,
        prompt_title: String,
        #[serde(default)]
        input: Option<String>,
        output: String,
        #[serde(default)]
        execution_time: f64,
    },
    StepError {
        step: u32,
        prompt_id: String,
        prompt_title: String,
        #[serde(default)]
        input: Option<String>,
        error: String,
        #[serde(default)]
        execution_time: f64,
    },
    WorkflowComplete {
        final_output: String,
        #[serde(default)]
        completed_steps: u32,
        #[serde(default)]
        total_steps: u32,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        total_time: Option<f64>,
    },
    Aborted {
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        error: String,
    },
    // Event kinds added by newer servers decode here and are ignored.
    #[serde(other)]
    Unknown,
}

/// Outcome of one prompt step, in completion order. Exactly one of `output`
/// and `error` is set; the constructors are the only way these are built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: u32,
    pub prompt_id: String,
    pub prompt_title: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_time: f64,
}

impl StepResult {
    pub fn success(
        step: u32,
        prompt_id: String,
        prompt_title: String,
        input: Option<String>,
        output: String,
        execution_time: f64,
    ) -> Self {
        Self {
            step,
            prompt_id,
            prompt_title,
            input,
            output: Some(output),
            error: None,
            execution_time,
        }
    }

    pub fn failure(
        step: u32,
        prompt_id: String,
        prompt_title: String,
        input: Option<String>,
        error: String,
        execution_time: f64,
    ) -> Self {
        Self {
            step,
            prompt_id,
            prompt_title,
            input,
            output: None,
            error: Some(error),
            execution_time,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    CompletedWithErrors,
    Aborted,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::CompletedWithErrors
                | RunState::Aborted
                | RunState::Failed
        )
    }

    pub fn is_running(self) -> bool {
        self == RunState::Running
    }

    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::CompletedWithErrors => "completed with errors",
            RunState::Aborted => "aborted",
            RunState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    CompletedWithErrors,
    Aborted,
    Failed,
}

impl RunOutcome {
    pub fn label(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::CompletedWithErrors => "completed with errors",
            RunOutcome::Aborted => "aborted",
            RunOutcome::Failed => "failed",
        }
    }
}

/// Derived display status for one step slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub timestamp_utc: String,
    pub workspace_id: u64,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    pub config: ExecutionConfig,
    pub results: Vec<StepResult>,
    #[serde(default)]
    pub final_output: String,
    #[serde(default)]
    pub fatal_error: Option<String>,
    pub outcome: RunOutcome,
    #[serde(default)]
    pub completed_steps: u32,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub total_time: f64,
}

impl RunRecord {
    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.succeeded()).count()
    }
}

/// Structured info events emitted by the engine/controller and consumed by
/// UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    // UI/CLI messages generated outside the engine.
    Message(String),
    Connecting { workspace_id: u64 },
    Cancelling,
    StillCancelling,
    RunInProgress,
    InvalidConfig(String),
    RunFailed(String),
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Connecting { workspace_id } => {
                format!("Connecting to workspace {}...", workspace_id)
            }
            InfoEvent::Cancelling => "Cancelling run...".to_string(),
            InfoEvent::StillCancelling => {
                "Still cancelling, waiting for the stream to close...".to_string()
            }
            InfoEvent::RunInProgress => "A run is already in progress".to_string(),
            InfoEvent::InvalidConfig(reason) => format!("Cannot start run: {}", reason),
            InfoEvent::RunFailed(err) => format!("Run failed: {}", err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    Workflow(WorkflowEvent),
    Info(InfoEvent),
    RunCompleted {
        // Box to keep RunEvent size small; RunRecord is large and would bloat the enum.
        record: Box<RunRecord>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_is_clamped_to_supported_range() {
        let mut config = ExecutionConfig::new(3);
        config.set_temperature(2.7);
        assert_eq!(config.temperature, TEMPERATURE_MAX);
        config.set_temperature(-0.4);
        assert_eq!(config.temperature, TEMPERATURE_MIN);
        config.set_temperature(0.85);
        assert_eq!(config.temperature, 0.85);
    }

    #[test]
    fn toggling_a_step_twice_restores_the_original_flags() {
        let mut config = ExecutionConfig::new(3);
        let before = config.enabled_steps.clone();
        config.toggle_step(1);
        assert!(!config.enabled_steps[1]);
        config.toggle_step(1);
        assert_eq!(config.enabled_steps, before);
        // Out-of-range toggles are no-ops.
        config.toggle_step(17);
        assert_eq!(config.enabled_steps, before);
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let config = ExecutionConfig::new(0);
        assert_eq!(config.validate(0), Err(ConfigError::EmptyWorkflow));

        let mut config = ExecutionConfig::new(3);
        assert_eq!(
            config.validate(4),
            Err(ConfigError::StepCountMismatch { flags: 3, prompts: 4 })
        );

        config.set_all_steps(false);
        assert_eq!(config.validate(3), Err(ConfigError::NoStepsEnabled));

        config.toggle_step(2);
        assert!(config.validate(3).is_ok());
    }

    #[test]
    fn wire_events_decode_by_tag() {
        let event: WorkflowEvent = serde_json::from_str(
            r#"{"event_type":"start","step":2,"prompt_title":"Summarize","total_steps":3}"#,
        )
        .unwrap();
        match event {
            WorkflowEvent::Start {
                step,
                prompt_title,
                total_steps,
                ..
            } => {
                assert_eq!(step, 2);
                assert_eq!(prompt_title.as_deref(), Some("Summarize"));
                assert_eq!(total_steps, Some(3));
            }
            other => panic!("expected start, got {:?}", other),
        }

        let event: WorkflowEvent = serde_json::from_str(
            r#"{"event_type":"complete","step":1,"prompt_id":"7","prompt_title":"Draft","input":"(no input)","output":"done","execution_time":1.25}"#,
        )
        .unwrap();
        match event {
            WorkflowEvent::Complete {
                step,
                output,
                execution_time,
                ..
            } => {
                assert_eq!(step, 1);
                assert_eq!(output, "done");
                assert_eq!(execution_time, 1.25);
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn unknown_event_kinds_decode_to_unknown() {
        let event: WorkflowEvent =
            serde_json::from_str(r#"{"event_type":"heartbeat","sequence":9}"#).unwrap();
        assert!(matches!(event, WorkflowEvent::Unknown));
    }

    #[test]
    fn step_result_constructors_keep_output_and_error_exclusive() {
        let ok = StepResult::success(1, "p1".into(), "Draft".into(), None, "out".into(), 0.5);
        assert!(ok.succeeded());
        assert!(ok.output.is_some() && ok.error.is_none());

        let bad = StepResult::failure(2, "p2".into(), "Review".into(), None, "boom".into(), 0.2);
        assert!(!bad.succeeded());
        assert!(bad.output.is_none() && bad.error.is_some());
    }

    #[test]
    fn run_config_serialization_never_includes_the_token() {
        let config = RunConfig {
            base_url: "http://localhost:5000".into(),
            workspace_id: 4,
            token: Some("secret".into()),
            user_agent: "promptchain-test".into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            comments: None,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"), "token leaked into {json}");
    }
}
