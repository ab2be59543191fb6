//! Local chat endpoint backend: `<host>/api/chat` with streaming NDJSON.
//!
//! Grounded on `original_source/backend/llm_runners/ollama_runner.py` —
//! exact endpoint paths, option defaults, and the terminal-outcome
//! conditions (`done`, `error`, empty-response, stop, infinite loop).

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

pub struct OllamaRunner {
    host: String,
    client: reqwest::blocking::Client,
}

impl OllamaRunner {
    pub fn new(host: impl Into<String>) -> Self {
        let mut host = host.into();
        if host.ends_with('/') {
            host.pop();
        }
        Self { host, client: reqwest::blocking::Client::new() }
    }

    fn tags(&self) -> Result<Vec<TagEntry>, RunnerError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.host))
            .send()
            .map_err(|e| RunnerError::Transport(e.to_string()))?;
        let body: TagsResponse =
            resp.json().map_err(|e| RunnerError::Transport(e.to_string()))?;
        Ok(body.models)
    }

    fn show(&self, model: &str) -> Result<ShowResponse, RunnerError> {
        let resp = self
            .client
            .post(format!("{}/api/show", self.host))
            .json(&json!({ "model": model }))
            .send()
            .map_err(|e| RunnerError::Transport(e.to_string()))?;
        resp.json().map_err(|e| RunnerError::Transport(e.to_string()))
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    model: String,
}

#[derive(Deserialize)]
struct ShowResponse {
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: String,
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
            .map(|m| {
                let mut v = json!({ "role": role_str(m.role), "content": m.content });
                if !m.images.is_empty() {
                    v["images"] = json!(m.images);
                }
                v
            })
            .collect(),
    )
}

fn options_json(options: CompletionOptions) -> serde_json::Value {
    let options = options.with_defaults();
    let mut v = json!({
        "seed": options.seed,
        "num_predict": options.max_output_tokens,
    });
    if let Some(t) = options.temperature {
        v["temperature"] = json!(t);
    }
    v
}

impl Runner for OllamaRunner {
    fn list_chat_models(&self) -> Vec<String> {
        let Ok(entries) = self.tags() else { return Vec::new() };
        entries
            .into_iter()
            .filter(|e| {
                self.show(&e.model)
                    .map(|s| s.capabilities.iter().any(|c| c == "completion"))
                    .unwrap_or(false)
            })
            .map(|e| e.model)
            .collect()
    }

    fn is_model_installed(&self, model: &str) -> bool {
        self.tags()
            .map(|entries| entries.iter().any(|e| e.model == model))
            .unwrap_or(false)
    }

    fn pull_model(&self, model: &str) -> bool {
        let Ok(resp) = self
            .client
            .post(format!("{}/api/pull", self.host))
            .json(&json!({ "name": model, "stream": false }))
            .send()
        else {
            return false;
        };
        let Ok(body) = resp.json::<serde_json::Value>() else { return false };
        body.get("error").is_none()
    }

    fn remove_model(&self, model: &str) -> bool {
        let Ok(resp) = self
            .client
            .post(format!("{}/api/delete", self.host))
            .json(&json!({ "name": model }))
            .send()
        else {
            return false;
        };
        let Ok(body) = resp.json::<serde_json::Value>() else { return false };
        body.get("error").is_none()
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
            "messages": messages_json(messages),
            "stream": true,
            "options": options_json(options),
        });

        let mut assistant_text = String::new();
        let mut num_chunks: u32 = 0;
        let mut last_instant: Option<Instant> = None;
        let mut failed = false;

        let send_result = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&payload)
            .send();

        let response = match send_result {
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
                if line.is_empty() {
                    continue;
                }
                let now = Instant::now();
                let data: ChatLine = serde_json::from_str(&line)
                    .map_err(|e| RunnerError::InvalidOutput(e.to_string()))?;
                if data.done {
                    break;
                }
                if let Some(err) = data.error {
                    return Err(RunnerError::Transport(err));
                }
                let msg = data.message.unwrap_or_default();
                guard.think_content_switch(!msg.thinking.is_empty(), !msg.content.is_empty());
                // Thinking tokens feed the loop detector but never reach the
                // returned assistant text; only content tokens are persisted.
                if !msg.thinking.is_empty() {
                    guard.accumulate_tokens(&msg.thinking);
                }
                if msg.content.is_empty() {
                    last_instant = Some(now);
                    continue;
                }
                num_chunks += 1;
                guard.accumulate_tokens(&msg.content);
                assistant_text.push_str(&msg.content);
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
            "messages": messages_json(messages),
            "stream": false,
            "options": options_json(options),
        });
        let resp = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&payload)
            .send()
            .map_err(|e| RunnerError::Transport(e.to_string()))?;
        let body: serde_json::Value =
            resp.json().map_err(|e| RunnerError::Transport(e.to_string()))?;
        body["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RunnerError::InvalidOutput("missing message.content".to_string()))
    }

    fn get_embedding(&self, config: &EmbeddingConfig) -> Option<EmbeddingFn> {
        if !self.is_model_installed(&config.model) {
            return None;
        }
        let host = self.host.clone();
        let model = config.model.clone();
        let client = self.client.clone();
        Some(std::sync::Arc::new(move |text: &str| {
            let resp = client
                .post(format!("{host}/api/embed"))
                .json(&json!({ "model": model, "input": text }))
                .send()
                .map_err(|e| RunnerError::Transport(e.to_string()))?;
            let body: serde_json::Value =
                resp.json().map_err(|e| RunnerError::Transport(e.to_string()))?;
            body["embeddings"][0]
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                .ok_or_else(|| RunnerError::InvalidOutput("missing embeddings[0]".to_string()))
        }))
    }

    fn supports_thinking(&self, model: &str) -> ThinkingSupport {
        if !self.is_model_installed(model) {
            return None;
        }
        self.show(model).ok().map(|s| s.capabilities.iter().any(|c| c == "thinking"))
    }
}
