//! Hosted responses-API backend: `<api>/responses` with server-sent events.
//!
//! Grounded on `original_source/backend/llm_runners/openai_runner.py` —
//! `seed` is stripped (unsupported by the hosted API), streaming runs over
//! `response.output_text.delta` / `response.completed` / `response.error`
//! SSE events terminated by a literal `data: [DONE]` line.

use super::{
    format_runner_error, CompletionOptions, EmbeddingConfig, EmbeddingFn, Message,
    MessageProgress, Role, Runner, StreamResult, ThinkingSupport, INFINITE_LOOP_MESSAGE,
    STOPPED_MESSAGE, STOP_SENTINEL,
};
use crate::error::RunnerError;
use crate::guard::GenerationGuard;
use serde::Deserialize;
use serde_json::json;
use std::io::BufRead;
use std::time::Instant;

const DEFAULT_HOST_API: &str = "https://api.openai.com/v1";

pub struct OpenAiRunner {
    host_api: String,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl OpenAiRunner {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            host_api: DEFAULT_HOST_API.to_string(),
            api_key: api_key.into(),
            client: reqwest::blocking::Client::new(),
        }
    }

    fn auth(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.api_key))
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn messages_json(messages: &[Message]) -> serde_json::Value {
    serde_json::Value::Array(
        messages
            .iter()
            .map(|m| json!({ "role": role_str(m.role), "content": m.content }))
            .collect(),
    )
}

/// `max_output_tokens` is the only option the hosted API accepts; `seed`
/// and any per-backend temperature key are stripped per the original's
/// `_options.pop("seed")`.
fn options_json(options: CompletionOptions) -> serde_json::Value {
    let options = options.with_defaults();
    json!({ "max_output_tokens": options.max_output_tokens })
}

#[derive(Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    etype: String,
    #[serde(default)]
    delta: String,
    #[serde(default)]
    error: Option<SseError>,
}

#[derive(Deserialize)]
struct SseError {
    message: String,
}

impl Runner for OpenAiRunner {
    fn list_chat_models(&self) -> Vec<String> {
        let Ok(resp) = self.auth(self.client.get(format!("{}/models", self.host_api))).send()
        else {
            return Vec::new();
        };
        let Ok(body) = resp.json::<serde_json::Value>() else { return Vec::new() };
        body["data"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|m| m["id"].as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    fn is_model_installed(&self, model: &str) -> bool {
        let Ok(resp) =
            self.auth(self.client.get(format!("{}/models/{model}", self.host_api))).send()
        else {
            return false;
        };
        let Ok(body) = resp.json::<serde_json::Value>() else { return false };
        body["id"].as_str() == Some(model)
    }

    fn pull_model(&self, model: &str) -> bool {
        self.is_model_installed(model)
    }

    fn remove_model(&self, _model: &str) -> bool {
        false
    }

    fn run_text_completion_streaming(
        &self,
        model: &str,
        messages: &[Message],
        is_stopped: &dyn Fn() -> bool,
        guard: &mut GenerationGuard,
        on_progress: &mut dyn FnMut(MessageProgress),
        options: CompletionOptions,
    ) -> Result<StreamResult, RunnerError> {
        let payload = json!({
            "model": model,
            "input": messages_json(messages),
            "stream": true,
            "max_output_tokens": options_json(options)["max_output_tokens"],
        });

        let mut assistant_text = String::new();
        let mut num_chunks: u32 = 0;
        let mut last_instant: Option<Instant> = None;
        let mut failed = false;

        let response = match self
            .auth(self.client.post(format!("{}/responses", self.host_api)))
            .json(&payload)
            .send()
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let status = r.status();
                let text = r.text().unwrap_or_default();
                let err = RunnerError::Transport(format!("status {status}: {text}"));
                on_progress(MessageProgress::error(0, err.to_string()));
                return Err(err);
            }
            Err(e) => {
                let err = RunnerError::Transport(e.to_string());
                on_progress(MessageProgress::error(0, err.to_string()));
                return Err(err);
            }
        };

        let reader = std::io::BufReader::new(response);
        let run = (|| -> Result<(), RunnerError> {
            for line in reader.lines() {
                let line = line.map_err(|e| RunnerError::Transport(e.to_string()))?;
                if is_stopped() {
                    assistant_text.push_str(STOP_SENTINEL);
                    on_progress(MessageProgress::error(num_chunks, STOPPED_MESSAGE));
                    failed = true;
                    return Ok(());
                }
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "[DONE]" || line == "data: [DONE]" {
                    break;
                }
                let Some(data_str) = line.strip_prefix("data:") else { continue };
                let data_str = data_str.trim();
                let event: SseEvent = serde_json::from_str(data_str)
                    .map_err(|e| RunnerError::InvalidOutput(e.to_string()))?;
                match event.etype.as_str() {
                    "response.error" => {
                        let message =
                            event.error.map(|e| e.message).unwrap_or_else(|| "unknown".into());
                        return Err(RunnerError::Transport(message));
                    }
                    "response.completed" => break,
                    "response.output_text.delta" => {
                        let now = Instant::now();
                        num_chunks += 1;
                        guard.accumulate_tokens(&event.delta);
                        assistant_text.push_str(&event.delta);
                        if let Some(last) = last_instant {
                            on_progress(MessageProgress::generating(
                                now.duration_since(last).as_secs_f64(),
                                num_chunks,
                            ));
                        }
                        if guard.is_infinite_generation() {
                            on_progress(MessageProgress::error(num_chunks, INFINITE_LOOP_MESSAGE));
                            assistant_text.push_str(&guard.message_infinite_loop());
                            failed = true;
                            return Ok(());
                        }
                        last_instant = Some(now);
                    }
                    _ => {}
                }
            }
            Ok(())
        })();

        if let Err(e) = run {
            on_progress(MessageProgress::error(num_chunks, e.to_string()));
            if !assistant_text.is_empty() {
                assistant_text.push_str(&format_runner_error(&e));
            }
            failed = true;
        }

        if assistant_text.is_empty() {
            return Err(RunnerError::EmptyResponse);
        }
        Ok((assistant_text, failed))
    }

    fn run_text_completion_simple(
        &self,
        model: &str,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, RunnerError> {
        let payload = json!({
            "model": model,
            "input": messages_json(messages),
            "stream": false,
            "max_output_tokens": options_json(options)["max_output_tokens"],
        });
        let resp = self
            .auth(self.client.post(format!("{}/responses", self.host_api)))
            .json(&payload)
            .send()
            .map_err(|e| RunnerError::Transport(e.to_string()))?;
        let body: serde_json::Value =
            resp.json().map_err(|e| RunnerError::Transport(e.to_string()))?;
        body["output"][0]["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RunnerError::InvalidOutput("missing output[0].content[0].text".to_string()))
    }

    fn get_embedding(&self, config: &EmbeddingConfig) -> Option<EmbeddingFn> {
        if !self.is_model_installed(&config.model) {
            return None;
        }
        let host_api = self.host_api.clone();
        let api_key = self.api_key.clone();
        let model = config.model.clone();
        let client = self.client.clone();
        Some(std::sync::Arc::new(move |text: &str| {
            let resp = client
                .post(format!("{host_api}/embeddings"))
                .header("Authorization", format!("Bearer {api_key}"))
                .json(&json!({ "model": model, "input": text }))
                .send()
                .map_err(|e| RunnerError::Transport(e.to_string()))?;
            let body: serde_json::Value =
                resp.json().map_err(|e| RunnerError::Transport(e.to_string()))?;
            body["data"][0]["embedding"]
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                .ok_or_else(|| RunnerError::InvalidOutput("missing data[0].embedding".to_string()))
        }))
    }

    /// The hosted API exposes no programmatic way to tell whether a model
    /// reasons before answering.
    fn supports_thinking(&self, _model: &str) -> ThinkingSupport {
        None
    }
}
