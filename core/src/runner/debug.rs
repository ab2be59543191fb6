//! Deterministic debug backend, useful for testing the orchestrator and
//! ingestion pipeline without a real model endpoint.
//!
//! Grounded on `original_source/backend/llm_runners/debug_runner.py` — three
//! fixed model names, a canned HTML response, embeddings left unsupported
//! (the original never implements them either). Unlike the original, which
//! sleeps 2 seconds before returning, this backend streams its canned text
//! token-by-token through the guard so callers can exercise cancellation and
//! the generation guard deterministically.

use super::{
    CompletionOptions, EmbeddingConfig, EmbeddingFn, Message, MessageProgress, Runner,
    StreamResult, ThinkingSupport, STOPPED_MESSAGE, STOP_SENTINEL,
};
use crate::error::RunnerError;
use crate::guard::GenerationGuard;

const MOCK_OUTPUT: &str = "<h1>Lorem Ipsum</h1>\n<p>Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua.</p>\n<h2>Lorem Ipsum</h2>\n<p>Ut enim ad minim veniam, quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat.</p>\n<ul>\n<li>Lorem Ipsum</li>\n<li>Lorem Ipsum</li>\n</ul>\n";

pub struct DebugRunner;

impl DebugRunner {
    pub fn new() -> Self {
        Self
    }

    fn models() -> [&'static str; 3] {
        ["debug_lorem_ipsum", "debug_code", "debug_markdown"]
    }
}

impl Default for DebugRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for DebugRunner {
    fn list_chat_models(&self) -> Vec<String> {
        Self::models().iter().map(|s| s.to_string()).collect()
    }

    fn is_model_installed(&self, model: &str) -> bool {
        Self::models().contains(&model)
    }

    fn pull_model(&self, _model: &str) -> bool {
        false
    }

    fn remove_model(&self, _model: &str) -> bool {
        false
    }

    fn run_text_completion_streaming(
        &self,
        _model: &str,
        _messages: &[Message],
        is_stopped: &dyn Fn() -> bool,
        guard: &mut GenerationGuard,
        on_progress: &mut dyn FnMut(MessageProgress),
        _options: CompletionOptions,
    ) -> Result<StreamResult, RunnerError> {
        let mut assistant_text = String::new();
        let mut num_chunks: u32 = 0;
        for word in MOCK_OUTPUT.split_inclusive(' ') {
            if is_stopped() {
                assistant_text.push_str(STOP_SENTINEL);
                on_progress(MessageProgress::error(num_chunks, STOPPED_MESSAGE));
                return Ok((assistant_text, true));
            }
            num_chunks += 1;
            guard.accumulate_tokens(word);
            assistant_text.push_str(word);
            on_progress(MessageProgress::generating(0.0, num_chunks));
            if guard.is_infinite_generation() {
                assistant_text.push_str(&guard.message_infinite_loop());
                return Ok((assistant_text, true));
            }
        }
        Ok((assistant_text, false))
    }

    fn run_text_completion_simple(
        &self,
        _model: &str,
        _messages: &[Message],
        _options: CompletionOptions,
    ) -> Result<String, RunnerError> {
        Ok(MOCK_OUTPUT.to_string())
    }

    /// Unsupported, matching the original (`DebugRunner.get_embedding`
    /// always returns `None`).
    fn get_embedding(&self, _config: &EmbeddingConfig) -> Option<EmbeddingFn> {
        None
    }

    fn supports_thinking(&self, model: &str) -> ThinkingSupport {
        if self.is_model_installed(model) {
            Some(true)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationGuardSettings;
    use crate::guard::GuardConfig;

    fn guard() -> GenerationGuard {
        GenerationGuard::new(GuardConfig::from(GenerationGuardSettings::default()))
    }

    #[test]
    fn lists_three_fixed_models() {
        let runner = DebugRunner::new();
        assert_eq!(runner.list_chat_models().len(), 3);
        assert!(runner.is_model_installed("debug_code"));
        assert!(!runner.is_model_installed("gpt-4"));
    }

    #[test]
    fn streaming_completes_normally_when_not_stopped() {
        let runner = DebugRunner::new();
        let mut g = guard();
        let mut progress = Vec::new();
        let (text, failed) = runner
            .run_text_completion_streaming(
                "debug_lorem_ipsum",
                &[],
                &|| false,
                &mut g,
                &mut |p| progress.push(p),
                CompletionOptions::default(),
            )
            .unwrap();
        assert!(!failed);
        assert_eq!(text, MOCK_OUTPUT);
        assert!(!progress.is_empty());
    }

    #[test]
    fn streaming_honours_stop_flag() {
        let runner = DebugRunner::new();
        let mut g = guard();
        let seen = std::cell::Cell::new(0);
        let (text, failed) = runner
            .run_text_completion_streaming(
                "debug_lorem_ipsum",
                &[],
                &|| {
                    seen.set(seen.get() + 1);
                    seen.get() > 2
                },
                &mut g,
                &mut |_| {},
                CompletionOptions::default(),
            )
            .unwrap();
        assert!(failed);
        assert!(text.ends_with(STOP_SENTINEL));
    }
}
