//! OpenRouter chat-completions client that asks a model for whole-file
//! terraform edits.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use prism_core::error::{RemoteServiceError, Service};
use prism_core::model::FileChange;
use prism_core::remote::ModelClient;

use crate::{http_client, status_error, transport_error, trim_base};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";

const SYSTEM_PROMPT: &str = r#"You are a Terraform infrastructure expert. Based on the user's request, modify the Terraform files to implement the requested change.

Preserve all existing code and make only the minimal changes necessary:
- Keep existing resources, variables and outputs that are not being changed
- Only add new resources or modify the specific attributes the user asked for
- Keep comments, formatting and file organization intact
- Append new resources to the existing file content

Respond with ONLY a JSON object. No explanations, no markdown code fences, no text before or after.

Format:
{
  "files": [
    {
      "path": "main.tf",
      "content": "resource \"aws_instance\" \"example\" {\n  ami = \"ami-123\"\n}"
    }
  ]
}

Only include files that need to be modified or created. Each file's content must be the complete new file."#;

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

impl Message {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Modifications {
    #[serde(default)]
    files: Vec<FileChange>,
}

fn model_error(message: impl Into<String>) -> RemoteServiceError {
    RemoteServiceError::new(Service::Model, None, message)
}

/// Render the current files as the context message.
fn files_context(files: &[FileChange]) -> String {
    let mut context = String::from("Current Terraform files:\n");
    for file in files {
        context.push_str(&format!("\n--- {} ---\n{}\n", file.path, file.content));
    }
    context
}

/// Drop a surrounding markdown fence if the model added one anyway.
fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string (`json`) up to the first newline.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_modifications(reply: &str) -> Result<Vec<FileChange>, RemoteServiceError> {
    let parsed: Modifications = serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| model_error(format!("failed to parse model response: {e}")))?;
    Ok(parsed.files)
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_base(&base_url.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn generate_file_modifications(
        &self,
        message: &str,
        current_files: &[FileChange],
    ) -> Result<Vec<FileChange>, RemoteServiceError> {
        if self.api_key.is_empty() {
            return Err(model_error("OPENROUTER_API_KEY not set"));
        }

        let request = CompletionRequest {
            model: &self.model,
            messages: vec![
                Message::new("system", SYSTEM_PROMPT),
                Message::new("user", files_context(current_files)),
                Message::new("user", message),
            ],
        };

        tracing::debug!(model = %self.model, files = current_files.len(), "requesting file modifications");
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(Service::Model, e))?;

        if !response.status().is_success() {
            return Err(status_error(Service::Model, response).await);
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Service::Model, e))?;
        let reply = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| model_error("no response from model"))?;

        let files = parse_modifications(&reply.message.content)?;
        tracing::info!(files = files.len(), "model proposed modifications");
        Ok(files)
    }
}
