//! Composite dispatch over an ordered list of backends.
//!
//! Grounded on `original_source/backend/llm_runners/llm_runner.py`'s
//! `SuperRunner`: every model-bound call routes to the first backend whose
//! `is_model_installed` holds; `list_chat_models` concatenates without
//! deduplication (spec §9 open question — first backend wins at call time,
//! duplicates are intentional); `get_embedding`/`pull_model` probe backends
//! in order until one succeeds.

use super::{
    CompletionOptions, EmbeddingConfig, EmbeddingFn, Message, MessageProgress, Runner,
    StreamResult, ThinkingSupport,
};
use crate::error::RunnerError;
use crate::guard::GenerationGuard;

pub struct SuperRunner {
    runners: Vec<Box<dyn Runner>>,
}

impl SuperRunner {
    pub fn new(runners: Vec<Box<dyn Runner>>) -> Self {
        Self { runners }
    }

    fn find_installed(&self, model: &str) -> Option<&dyn Runner> {
        self.runners.iter().map(|r| r.as_ref()).find(|r| r.is_model_installed(model))
    }
}

impl Runner for SuperRunner {
    fn list_chat_models(&self) -> Vec<String> {
        self.runners.iter().flat_map(|r| r.list_chat_models()).collect()
    }

    fn is_model_installed(&self, model: &str) -> bool {
        self.runners.iter().any(|r| r.is_model_installed(model))
    }

    fn pull_model(&self, model: &str) -> bool {
        self.runners.iter().any(|r| r.pull_model(model))
    }

    fn remove_model(&self, model: &str) -> bool {
        let mut removed = false;
        for runner in &self.runners {
            if runner.is_model_installed(model) {
                removed |= runner.remove_model(model);
            }
        }
        removed
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
        match self.find_installed(model) {
            Some(runner) => runner
                .run_text_completion_streaming(model, messages, is_stopped, guard, on_progress, options),
            None => Err(RunnerError::ModelNotFound(model.to_string())),
        }
    }

    fn run_text_completion_simple(
        &self,
        model: &str,
        messages: &[Message],
        options: CompletionOptions,
    ) -> Result<String, RunnerError> {
        match self.find_installed(model) {
            Some(runner) => runner.run_text_completion_simple(model, messages, options),
            None => Err(RunnerError::ModelNotFound(model.to_string())),
        }
    }

    fn get_embedding(&self, config: &EmbeddingConfig) -> Option<EmbeddingFn> {
        self.runners.iter().find_map(|r| r.get_embedding(config))
    }

    fn supports_thinking(&self, model: &str) -> ThinkingSupport {
        self.runners.iter().find_map(|r| r.supports_thinking(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::DebugRunner;

    struct NeverInstalled;
    impl Runner for NeverInstalled {
        fn list_chat_models(&self) -> Vec<String> {
            vec!["ghost-model".to_string()]
        }
        fn is_model_installed(&self, _model: &str) -> bool {
            false
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
            _is_stopped: &dyn Fn() -> bool,
            _guard: &mut GenerationGuard,
            _on_progress: &mut dyn FnMut(MessageProgress),
            _options: CompletionOptions,
        ) -> Result<StreamResult, RunnerError> {
            unreachable!("never installed, never dispatched to")
        }
        fn run_text_completion_simple(
            &self,
            _model: &str,
            _messages: &[Message],
            _options: CompletionOptions,
        ) -> Result<String, RunnerError> {
            unreachable!()
        }
        fn get_embedding(&self, _config: &EmbeddingConfig) -> Option<EmbeddingFn> {
            None
        }
        fn supports_thinking(&self, _model: &str) -> ThinkingSupport {
            None
        }
    }

    #[test]
    fn dispatches_to_the_backend_that_has_the_model_installed() {
        let composite =
            SuperRunner::new(vec![Box::new(NeverInstalled), Box::new(DebugRunner::new())]);
        assert!(composite.is_model_installed("debug_code"));
        assert!(!composite.is_model_installed("nonexistent"));
    }

    #[test]
    fn list_chat_models_concatenates_without_deduplication() {
        let composite =
            SuperRunner::new(vec![Box::new(NeverInstalled), Box::new(DebugRunner::new())]);
        let models = composite.list_chat_models();
        assert_eq!(models.len(), 1 + 3);
    }
}
