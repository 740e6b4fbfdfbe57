//! LLM chat client and the planner built on it
//!
//! The chat call is treated as an opaque collaborator: messages in, content
//! out, bounded retry on rate limits. The API key is a constructor
//! parameter, resolved once by the embedder and never re-queried from
//! global state inside the pipeline.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::planner::{parse_edit_response, CommandFixRequest, Planner, PlannedEdit, RepairRequest};

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

const REPAIR_SYSTEM: &str = "You are fixing a code change that failed automated verification. \
You will receive the failing check output and the plan summary. Respond with JSON only: \
{\"edits\": [{\"path\": \"...\", \"new_content\": \"...\", \"old_content\": \"...\"}]}. \
Keep the fix minimal and focused on the failure.";

const COMMAND_FIX_SYSTEM: &str = "A test command failed. From the output tail, propose the \
smallest file edits that make it pass. Respond with JSON only: \
{\"edits\": [{\"path\": \"...\", \"new_content\": \"...\", \"old_content\": \"...\"}]}.";

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// OpenRouter-compatible chat client with bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ChatClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: OPENROUTER_URL.to_string(),
        }
    }

    /// Point the client at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn chat(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: 8192,
            stream: false,
        };

        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut last_error = anyhow::anyhow!("LLM call never attempted");

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                warn!(attempt, backoff_ms, "retrying LLM call");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms *= BACKOFF_MULTIPLIER;
            }

            let response = self
                .http
                .post(&self.base_url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = anyhow::anyhow!("LLM returned {}", status);
                        continue;
                    }
                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        anyhow::bail!("LLM returned {}: {}", status, body);
                    }
                    let parsed: ChatResponse = resp.json().await?;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| anyhow::anyhow!("LLM response had no choices"))?;
                    debug!(chars = content.len(), "LLM response received");
                    return Ok(content);
                }
                Err(e) => {
                    last_error = e.into();
                }
            }
        }

        Err(last_error)
    }
}

/// `Planner` backed by the chat client.
#[derive(Debug, Clone)]
pub struct LlmPlanner {
    client: ChatClient,
}

impl LlmPlanner {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

impl Planner for LlmPlanner {
    fn repair<'a>(
        &'a self,
        request: &'a RepairRequest,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PlannedEdit>>> {
        Box::pin(async move {
            let user = format!(
                "Plan summary: {}\nScope: {}\n{}Failing check output:\n{}",
                request.plan_summary.as_deref().unwrap_or("(none)"),
                request.scope_mode.label(),
                request
                    .fingerprint
                    .as_deref()
                    .map(|f| format!("Failure fingerprint: {}\n", f))
                    .unwrap_or_default(),
                request.failure_log
            );
            let response = self.client.chat(REPAIR_SYSTEM, &user).await?;
            parse_edit_response(&response)
        })
    }

    fn propose_command_fix<'a>(
        &'a self,
        request: &'a CommandFixRequest,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PlannedEdit>>> {
        Box::pin(async move {
            let user = format!(
                "Command: {}\nOutput tail:\n{}",
                request.command, request.output_tail
            );
            let response = self.client.chat(COMMAND_FIX_SYSTEM, &user).await?;
            parse_edit_response(&response)
        })
    }
}
