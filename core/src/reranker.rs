//! C7 — Reranker: a second-stage filter over retrieved passages, removing
//! out-of-margin scores and near-duplicates.
//!
//! Grounded on `original_source/backend/reranker.py` for the exact
//! three-stage pipeline and threshold semantics: drop anything at or past
//! the irrelevance threshold, keep only what's within `rag_score_margin` of
//! the best remaining score, then collapse near-duplicate passages
//! (pairwise cosine similarity over the margin group) down to the single
//! lowest-scoring representative of each cluster.

use crate::config::RagSettings;
use crate::kb::distance;
use crate::runner::EmbeddingFn;
use serde::{Deserialize, Serialize};
use serde_json::Map;

/// One retrieved passage plus its distance score (lower = more similar)
/// and whatever vector-record metadata the caller wants to carry through
/// reranking (document path, page number, filename, ...) for later
/// serialization as a persisted "sources" blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub content: String,
    pub similarity_score: f32,
    pub metadata: Map<String, serde_json::Value>,
}

impl ScoredPassage {
    pub fn new(content: impl Into<String>, similarity_score: f32) -> Self {
        Self { content: content.into(), similarity_score, metadata: Map::new() }
    }
}

/// Filters `passages` down to a deduplicated, in-margin subset, preserving
/// the input order of whatever survives.
pub fn rerank(
    passages: Vec<ScoredPassage>,
    embed: &EmbeddingFn,
    settings: &RagSettings,
) -> Vec<ScoredPassage> {
    let relevant: Vec<(usize, ScoredPassage)> = passages
        .into_iter()
        .enumerate()
        .filter(|(_, p)| p.similarity_score < settings.rag_cosine_distance_irrelevance_threshold)
        .collect();
    if relevant.is_empty() {
        return Vec::new();
    }

    let best_score = relevant
        .iter()
        .map(|(_, p)| p.similarity_score)
        .fold(f32::INFINITY, f32::min);
    let margin_bound = best_score + settings.rag_score_margin;
    let in_margin: Vec<(usize, ScoredPassage)> = relevant
        .into_iter()
        .filter(|(_, p)| p.similarity_score <= margin_bound)
        .collect();

    let embeddings: Vec<Option<Vec<f32>>> = in_margin
        .iter()
        .map(|(_, p)| embed(&p.content).ok())
        .collect();

    let mut dropped = vec![false; in_margin.len()];
    for i in 0..in_margin.len() {
        if dropped[i] {
            continue;
        }
        for j in (i + 1)..in_margin.len() {
            if dropped[j] {
                continue;
            }
            let similar = match (&embeddings[i], &embeddings[j]) {
                (Some(a), Some(b)) => {
                    1.0 - distance(a, b) > settings.rag_similarity_score_threshold
                }
                _ => false,
            };
            if similar {
                // Keep the single lowest-scoring (most similar to the
                // query) item in the pair; drop the other.
                if in_margin[i].1.similarity_score <= in_margin[j].1.similarity_score {
                    dropped[j] = true;
                } else {
                    dropped[i] = true;
                    break;
                }
            }
        }
    }

    let mut survivors: Vec<(usize, ScoredPassage)> = in_margin
        .into_iter()
        .zip(dropped)
        .filter(|(_, drop)| !drop)
        .map(|(item, _)| item)
        .collect();
    survivors.sort_by_key(|(original_index, _)| *original_index);
    survivors.into_iter().map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settings() -> RagSettings {
        RagSettings {
            rag_document_count: 5,
            rag_char_chunk_size: 1000,
            rag_char_overlap: 200,
            rag_similarity_score_threshold: 0.8,
            rag_score_margin: 0.2,
            rag_cosine_distance_irrelevance_threshold: 1.0,
        }
    }

    fn passage(content: &str, score: f32) -> ScoredPassage {
        ScoredPassage::new(content, score)
    }

    #[test]
    fn single_relevant_item_survives_unchanged() {
        let embed: EmbeddingFn = Arc::new(|s: &str| Ok(vec![s.len() as f32, 0.0]));
        let result = rerank(vec![passage("a", 0.5)], &embed, &settings());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].content, "a");
    }

    #[test]
    fn single_item_over_threshold_is_dropped() {
        let embed: EmbeddingFn = Arc::new(|s: &str| Ok(vec![s.len() as f32, 0.0]));
        let result = rerank(vec![passage("a", 1.0)], &embed, &settings());
        assert!(result.is_empty());
    }

    #[test]
    fn out_of_margin_items_are_dropped() {
        let embed: EmbeddingFn = Arc::new(|s: &str| Ok(vec![s.len() as f32, 0.0]));
        let result = rerank(
            vec![passage("best", 0.1), passage("far", 0.9)],
            &embed,
            &settings(),
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].content, "best");
    }

    #[test]
    fn spec_scenario_6_grouping() {
        // Four passages scored [0.44, 0.44, 0.47, 0.51]; first two are
        // cosine-similar past 0.8; margin keeps all four (0.51 <= 0.44+0.2);
        // grouping collapses the near-duplicate pair to one.
        let embed: EmbeddingFn = Arc::new(|s: &str| {
            Ok(match s {
                "dup_a" => vec![1.0, 0.0],
                "dup_b" => vec![0.99, 0.01],
                "other1" => vec![0.0, 1.0],
                "other2" => vec![-1.0, 0.0],
                _ => vec![0.0, 0.0],
            })
        });
        let passages = vec![
            passage("dup_a", 0.44),
            passage("dup_b", 0.44),
            passage("other1", 0.47),
            passage("other2", 0.51),
        ];
        let result = rerank(passages, &embed, &settings());
        assert_eq!(result.len(), 3);
        assert!(result.iter().any(|p| p.content == "dup_a"));
        assert!(!result.iter().any(|p| p.content == "dup_b"));
        assert!(result.iter().any(|p| p.content == "other1"));
        assert!(result.iter().any(|p| p.content == "other2"));
    }

    #[test]
    fn preserves_input_order_among_survivors() {
        let embed: EmbeddingFn = Arc::new(|s: &str| {
            Ok(match s {
                "a" => vec![1.0, 0.0],
                "b" => vec![0.0, 1.0],
                _ => vec![-1.0, 0.0],
            })
        });
        let result = rerank(
            vec![passage("b", 0.2), passage("a", 0.1)],
            &embed,
            &settings(),
        );
        assert_eq!(result.iter().map(|p| p.content.clone()).collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
