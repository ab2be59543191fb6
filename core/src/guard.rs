//! C8 — Generation Guard: detects pathological repetition in a streaming
//! token sequence.
//!
//! Grounded verbatim on `original_source/backend/generation_guard.py`:
//! non-positive thresholds disable the corresponding behavior, the ring is
//! cleared on a thinking/content phase transition, and the canned message
//! names whichever phase was stuck.

use std::collections::VecDeque;

/// Configuration for one guard instance. Any field `<= 0` disables the
/// behavior it gates.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    pub safe_token_threshold: i64,
    pub max_repeats: i64,
    pub window_size: i64,
    pub token_check_interval: i64,
}

impl From<crate::config::GenerationGuardSettings> for GuardConfig {
    fn from(s: crate::config::GenerationGuardSettings) -> Self {
        Self {
            safe_token_threshold: s.safe_token_threshold,
            max_repeats: s.max_repeats,
            window_size: s.window_size,
            token_check_interval: s.token_check_interval,
        }
    }
}

/// A streaming watchdog: accumulates tokens and flags pathological
/// repetition. One instance per chat turn.
pub struct GenerationGuard {
    config: GuardConfig,
    token_count: i64,
    ring: VecDeque<String>,
    thinking: bool,
}

impl GenerationGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            token_count: 0,
            ring: VecDeque::new(),
            thinking: false,
        }
    }

    /// Call when the stream transitions between "thinking" output and
    /// normal content: a phase transition is evidence of progress, not a
    /// loop, so the ring is cleared.
    pub fn think_content_switch(&mut self, thinking_token: bool, content_token: bool) {
        if thinking_token && !self.thinking {
            self.ring.clear();
            self.thinking = true;
        } else if content_token && self.thinking {
            self.ring.clear();
            self.thinking = false;
        }
    }

    /// Increment the running count; once above `safe_token_threshold`,
    /// append the token to the ring.
    pub fn accumulate_tokens(&mut self, token: &str) {
        self.token_count += 1;
        if self.config.safe_token_threshold <= 0
            || self.token_count > self.config.safe_token_threshold
        {
            self.ring.push_back(token.to_string());
        }
    }

    fn is_check_interval(&self) -> bool {
        self.config.token_check_interval > 0
            && self.token_count % self.config.token_check_interval == 0
    }

    /// False unless the ring is long enough and we're on a check-interval
    /// boundary. Otherwise counts occurrences of every length-`window_size`
    /// contiguous subsequence; true if any recurs `>= max_repeats` times.
    pub fn is_infinite_generation(&self) -> bool {
        if self.config.window_size <= 0
            || self.config.max_repeats <= 0
            || self.config.token_check_interval <= 0
        {
            return false;
        }
        let window = self.config.window_size as usize;
        let needed_len = (self.config.window_size * self.config.max_repeats) as usize;
        if self.ring.len() < needed_len || !self.is_check_interval() {
            return false;
        }

        let tokens: Vec<&str> = self.ring.iter().map(|s| s.as_str()).collect();
        if tokens.len() < window {
            return false;
        }
        let mut counts: std::collections::HashMap<Vec<&str>, i64> = std::collections::HashMap::new();
        for window_slice in tokens.windows(window) {
            let key = window_slice.to_vec();
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            if *count >= self.config.max_repeats {
                return true;
            }
        }
        false
    }

    /// Canned notice naming whichever phase ("thinking" vs "content") was
    /// stuck, based on the guard's phase flag at the moment of detection.
    pub fn message_infinite_loop(&self) -> String {
        let phase = if self.thinking { "thinking" } else { "content" };
        format!(
            "[Generation stopped: the model appears to be stuck repeating itself in the {phase} phase.]"
        )
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking
    }
}
