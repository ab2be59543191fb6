//! The in-process configuration value handed to the Ingestion Service and
//! Chat Orchestrator at construction time.
//!
//! This is the already-validated projection of the recognised settings keys
//! (§6): the core never reads a settings file from disk itself — that is an
//! external collaborator's job. Mirrors the teacher's `ScanConfig` pattern
//! of a plain, cheaply-cloned config struct with a `Default` impl rather
//! than a global.

use serde::{Deserialize, Serialize};

/// Retrieval tuning knobs, consumed by the Reranker and Chat Orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RagSettings {
    pub rag_document_count: usize,
    pub rag_char_chunk_size: usize,
    pub rag_char_overlap: usize,
    pub rag_similarity_score_threshold: f32,
    pub rag_score_margin: f32,
    pub rag_cosine_distance_irrelevance_threshold: f32,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            rag_document_count: 5,
            rag_char_chunk_size: 1000,
            rag_char_overlap: 200,
            rag_similarity_score_threshold: 0.8,
            rag_score_margin: 0.2,
            rag_cosine_distance_irrelevance_threshold: 1.0,
        }
    }
}

/// Generation Guard thresholds. Any non-positive field disables the
/// corresponding behavior (see `guard.rs`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationGuardSettings {
    pub safe_token_threshold: i64,
    pub max_repeats: i64,
    pub window_size: i64,
    pub token_check_interval: i64,
}

impl Default for GenerationGuardSettings {
    fn default() -> Self {
        Self {
            safe_token_threshold: 200,
            max_repeats: 8,
            window_size: 12,
            token_check_interval: 4,
        }
    }
}

/// Default completion options applied when a caller does not override them,
/// mirroring the upstream assistant's reproducibility defaults.
pub const DEFAULT_SEED: i64 = 42;
pub const DEFAULT_MAX_TOKENS: i64 = 32_000;

/// The top-level configuration value threaded through the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub default_system_prompt: String,
    pub rag_settings: RagSettings,
    pub generation_guard: GenerationGuardSettings,
}
