//! C4 — Runner: a uniform interface over model backends.
//!
//! Grounded on `original_source/backend/llm_runners/llm_runner.py` for the
//! trait surface and the streaming terminal-outcome table; the HTTP
//! streaming client idiom (blocking `reqwest` + `BufRead`) follows the
//! teacher's synchronous, thread-per-task model (each chat turn runs on its
//! own short-lived thread per spec §5) rather than introducing an async
//! runtime anywhere in this crate.

mod composite;
mod debug;
mod ollama;
mod openai;

pub use composite::SuperRunner;
pub use debug::DebugRunner;
pub use ollama::OllamaRunner;
pub use openai::OpenAiRunner;

use crate::error::RunnerError;
use crate::guard::GenerationGuard;
use serde::{Deserialize, Serialize};

/// Reproducibility defaults mirrored from the original assistant (`RANDOM_SEED`,
/// `MAX_TOKENS_LIMIT`).
pub use crate::config::{DEFAULT_MAX_TOKENS, DEFAULT_SEED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message. `images` carries base64-encoded image bytes for
/// multimodal turns (vision-LLM convertor, image-bearing chat turns).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), images: Vec::new() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), images: Vec::new() }
    }

    pub fn user_with_images(content: impl Into<String>, images: Vec<String>) -> Self {
        Self { role: Role::User, content: content.into(), images }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), images: Vec::new() }
    }
}

/// Completion options. `None` fields are omitted per-backend rather than
/// sent as nulls; a backend that does not support a key (e.g. the hosted
/// API's `seed`) silently drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionOptions {
    pub seed: Option<i64>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<i64>,
}

impl CompletionOptions {
    pub fn with_defaults(self) -> Self {
        Self {
            seed: Some(self.seed.unwrap_or(DEFAULT_SEED)),
            temperature: self.temperature,
            max_output_tokens: Some(self.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        }
    }
}

/// One incremental progress notification delivered during streaming.
/// Mirrors `MessageProgress(status, new_tokens, delta_duration, total_tokens, message?)`.
#[derive(Debug, Clone)]
pub struct MessageProgress {
    pub status: &'static str,
    pub new_tokens: u32,
    pub delta_seconds: f64,
    pub total_tokens: u32,
    pub message: Option<String>,
}

impl MessageProgress {
    pub fn generating(delta_seconds: f64, total_tokens: u32) -> Self {
        Self { status: "generating", new_tokens: 1, delta_seconds, total_tokens, message: None }
    }

    pub fn error(total_tokens: u32, message: impl Into<String>) -> Self {
        Self {
            status: "error",
            new_tokens: 0,
            delta_seconds: 0.0,
            total_tokens,
            message: Some(message.into()),
        }
    }
}

/// Tri-state probe result for `supports_thinking`: a backend may not be
/// able to answer at all (model unknown to it), distinct from a definite
/// yes/no.
pub type ThinkingSupport = Option<bool>;

/// An embedding function bound to one model configuration. Kept as a boxed
/// closure rather than a trait object so `DebugRunner`'s deterministic hash
/// embedding and a real HTTP-backed embedding share one call shape.
pub type EmbeddingFn = std::sync::Arc<dyn Fn(&str) -> Result<Vec<f32>, RunnerError> + Send + Sync>;

/// Configuration identifying one embedding model, as carried by a KB
/// descriptor's `embedding` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    #[serde(default)]
    pub seed: Option<i64>,
}

/// `(text, failed)` — the streaming terminal-outcome shape from spec §4.4.
pub type StreamResult = (String, bool);

/// The contract every backend and the composite dispatcher implement.
pub trait Runner: Send + Sync {
    fn list_chat_models(&self) -> Vec<String>;

    fn is_model_installed(&self, model: &str) -> bool;

    fn pull_model(&self, model: &str) -> bool;

    fn remove_model(&self, model: &str) -> bool;

    #[allow(clippy::too_many_arguments)]
    fn run_text_completion_streaming(
        &self,
        model: &str,
        messages: &[Message],
        is_stopped: &dyn Fn() -> bool,
        guard: &mut GenerationGuard,
        on_progress: &mut dyn FnMut(MessageProgress),
        options: CompletionOptions,
    ) -> Result<StreamResult, RunnerError>;

    fn run_text_completion_simple(
        &self,
        model: &str,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, RunnerError>;

    fn get_embedding(&self, config: &EmbeddingConfig) -> Option<EmbeddingFn>;

    fn supports_thinking(&self, model: &str) -> ThinkingSupport;
}

/// Formats a transient failure the way the original assistant appends it to
/// partial output (`LLMRunner.message_exception`).
pub fn format_runner_error(err: &RunnerError) -> String {
    format!(
        "\n\n---\n\nSYSTEM: \n\nLLM generation has failed: {err}\n\n\
         Please try another prompt and/or model in a different chatroom.\n\n---\n\n"
    )
}

pub const STOP_SENTINEL: &str = "[STOP]";
pub const STOPPED_MESSAGE: &str = "LLM model has been stopped";
pub const INFINITE_LOOP_MESSAGE: &str =
    "LLM model has entered an infinite loop and response generation has been stopped. Please try another prompt or model.";
