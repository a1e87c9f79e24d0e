use crate::model::{ExecutionConfig, PromptInfo, RunConfig, WorkspaceInfo};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use std::time::Duration;

/// Client for the workflow service. One shared connection pool; the bearer
/// token, when configured, rides along as a default header.
pub struct WorkflowApi {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl WorkflowApi {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &cfg.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("auth token is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(cfg.connect_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            request_timeout: cfg.request_timeout,
        })
    }

    pub async fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>> {
        let url = format!("{}/api/workflow-spaces", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("requesting workspace list")?
            .error_for_status()
            .context("workspace list request rejected")?;
        resp.json().await.context("decoding workspace list")
    }

    pub async fn fetch_workspace(&self, workspace_id: u64) -> Result<WorkspaceInfo> {
        let url = format!("{}/api/workflow-spaces/{}", self.base_url, workspace_id);
        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("requesting workspace {workspace_id}"))?
            .error_for_status()
            .context("workspace request rejected")?;
        resp.json().await.context("decoding workspace")
    }

    /// Ordered prompt sequence for one workspace.
    pub async fn fetch_prompts(&self, workspace_id: u64) -> Result<Vec<PromptInfo>> {
        let url = format!(
            "{}/api/workflow-spaces/{}/prompts",
            self.base_url, workspace_id
        );
        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("requesting prompts for workspace {workspace_id}"))?
            .error_for_status()
            .context("prompt list request rejected")?;
        let entries: Vec<PromptAssociation> =
            resp.json().await.context("decoding prompt list")?;
        Ok(flatten_prompts(entries))
    }

    /// Open the streaming execution. No overall timeout here: the stream
    /// stays up for as long as the workflow runs; only the connect timeout
    /// applies.
    pub async fn execute_stream(
        &self,
        workspace_id: u64,
        config: &ExecutionConfig,
    ) -> Result<reqwest::Response> {
        let url = format!(
            "{}/api/workflow-spaces/{}/execute/stream",
            self.base_url, workspace_id
        );
        let resp = self
            .client
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .json(config)
            .send()
            .await
            .with_context(|| format!("starting execution for workspace {workspace_id}"))?;
        resp.error_for_status()
            .context("execution request rejected")
    }
}

// The service returns workspace/prompt association rows with the prompt
// embedded; entries whose prompt was deleted come back without one.
#[derive(Debug, Deserialize)]
struct PromptAssociation {
    #[serde(default)]
    order_index: i64,
    #[serde(default)]
    prompt: Option<PromptBody>,
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    id: IdValue,
    title: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Num(u64),
    Text(String),
}

impl IdValue {
    fn into_string(self) -> String {
        match self {
            IdValue::Num(n) => n.to_string(),
            IdValue::Text(s) => s,
        }
    }
}

fn flatten_prompts(mut entries: Vec<PromptAssociation>) -> Vec<PromptInfo> {
    entries.sort_by_key(|e| e.order_index);
    entries
        .into_iter()
        .filter_map(|e| e.prompt)
        .map(|p| PromptInfo {
            id: p.id.into_string(),
            title: p.title,
            category: p.category,
        })
        .collect()
}
