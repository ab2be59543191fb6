//! C5 — KB: a named, vector-backed collection of indexed passages plus the
//! descriptor that produced it.
//!
//! Grounded on `original_source/backend/kb/{knowledge_base,chroma}.py`:
//! exact invariants for `has_full_document`/`has_full_convertor_result`
//! (group by `(output_hash, conversion, model)`, compare number-set
//! cardinality against stored counts), `add_doc_path`'s alias-merge
//! semantics, and `needs_refresh`'s field-by-field comparison. The vector
//! backend itself is `vector_store::FileVectorStore` rather than Chroma
//! (see that module's header for why).

use crate::convertor::ConvertorResult;
use crate::document_file::{DocumentFile, DocumentKind};
use crate::error::KbError;
use crate::hash::{hash_folder, read_json_if_exists, write_atomic_json};
use crate::runner::{EmbeddingConfig, EmbeddingFn};
use crate::vector_store::{cosine_distance, VectorRecord, VectorStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::convertor::ConvertorConfig;

/// One KB descriptor (§3): `{name, selection, convertors, embedding,
/// languages}`. Persisted verbatim as a KB Store's `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KbDescriptor {
    pub name: String,
    pub selection: Vec<String>,
    pub convertors: Vec<ConvertorConfig>,
    pub embedding: EmbeddingConfig,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

impl KbDescriptor {
    /// True iff `other` differs from `self` in a way that invalidates the
    /// existing collection: name, critical fields (convertors, embedding),
    /// or a selection pattern `self` had that `other` dropped.
    pub fn needs_refresh(&self, other: &KbDescriptor) -> bool {
        if self.selection.iter().any(|p| !other.selection.contains(p)) {
            return true;
        }
        other.name != self.name || other.convertors != self.convertors || other.embedding != self.embedding
    }
}

/// Folder-hash revalidation: recomputes the conversion artifact's folder
/// hash and compares it against the stored `result_hash`. Mismatch means
/// the artifact was altered out-of-band and must not be indexed.
pub fn validate_document_source(result: &ConvertorResult) -> Result<bool, KbError> {
    if !result.output_path.exists() {
        return Ok(false);
    }
    let extra: Vec<String> = result.model.iter().cloned().collect();
    let computed = hash_folder(&result.output_path, &extra)?;
    Ok(computed == result.result_hash)
}

/// Per-KB freshness hint (§3 KB-check cache): document path -> last-checked
/// timestamp. A fast-path only; clearing it can never change query results.
struct CheckCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CheckCache {
    fn new(path: PathBuf) -> Self {
        let entries = read_json_if_exists::<HashMap<String, DateTime<Utc>>>(&path)
            .ok()
            .flatten()
            .unwrap_or_default();
        Self { path, entries: Mutex::new(entries) }
    }

    fn is_checked(&self, document_path: &str) -> bool {
        self.entries.lock().unwrap().contains_key(document_path)
    }

    fn mark_checked(&self, document_path: &str) {
        let mut guard = self.entries.lock().unwrap();
        guard.insert(document_path.to_string(), Utc::now());
        let _ = write_atomic_json(&self.path, &*guard);
    }

    fn clear(&self) {
        let mut guard = self.entries.lock().unwrap();
        guard.clear();
        let _ = fs::remove_file(&self.path);
    }
}

pub const DEFAULT_KB_CHECK_CACHE_DIR: &str = ".cache/kb_check_cache";

/// The contract every KB implements (§4.5). `embed` binds the descriptor's
/// embedding model for operations that need to vectorise text; operations
/// that only filter on stored metadata do not call it.
pub trait Kb: Send + Sync {
    fn name(&self) -> &str;
    fn full_name(&self) -> String {
        self.name().to_string()
    }
    fn descriptor(&self) -> &KbDescriptor;

    fn rag_lookup(
        &self,
        embed: &EmbeddingFn,
        query: &str,
        k: usize,
    ) -> Result<Vec<(VectorRecord, f32)>, KbError>;

    fn store_convertor_result(
        &self,
        embed: &EmbeddingFn,
        result: &ConvertorResult,
        rag_settings: &crate::config::RagSettings,
    ) -> Result<(), KbError>;

    fn has_full_document(&self, doc: &DocumentFile, force: bool) -> Result<bool, KbError>;

    fn has_full_convertor_result(&self, result: &ConvertorResult) -> Result<bool, KbError>;

    fn add_doc_path(&self, doc: &DocumentFile, force: bool) -> Result<(), KbError>;

    fn clear(&self) -> Result<(), KbError>;

    /// Marks `document_path` as freshly checked in this KB's check cache,
    /// called by the ingestion loop after a successful
    /// `has_full_document`/`store_convertor_result` round-trip. A no-op by
    /// default; only [`VectorKb`] actually carries a check cache.
    fn mark_checked(&self, _document_path: &str) {}

    fn needs_refresh(&self, new_descriptor: &KbDescriptor) -> bool {
        self.descriptor().needs_refresh(new_descriptor)
    }
}

/// Splits `text` into chunks of at most `chunk_size` characters with
/// `overlap` characters shared between consecutive chunks, dropping empty
/// chunks. Operates on Unicode scalar values, not bytes.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if chunk_size == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// A KB backed by [`crate::vector_store::FileVectorStore`]: `collection`
/// names the backing collection (the KB's slug, distinct from its
/// human-readable `name` so renames don't orphan data), `descriptor` is the
/// current config, `check_cache` the freshness hint.
pub struct VectorKb {
    descriptor: KbDescriptor,
    collection: String,
    store: Arc<dyn VectorStore>,
    check_cache: CheckCache,
}

impl VectorKb {
    pub fn new(
        descriptor: KbDescriptor,
        collection: String,
        store: Arc<dyn VectorStore>,
        check_cache_dir: &Path,
    ) -> Self {
        store.get_or_create_collection(&collection);
        let cache_path = check_cache_dir.join(format!("{}.json", sanitize_cache_name(&descriptor.name)));
        Self {
            descriptor,
            collection,
            store,
            check_cache: CheckCache::new(cache_path),
        }
    }

    fn group_key(record: &VectorRecord) -> (String, String, String) {
        (
            record.metadata_str("output_hash").unwrap_or_default().to_string(),
            record.metadata_str("conversion").unwrap_or_default().to_string(),
            record.metadata_str("model").unwrap_or_default().to_string(),
        )
    }
}

fn sanitize_cache_name(name: &str) -> String {
    name.replace('/', "_")
}

impl Kb for VectorKb {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn descriptor(&self) -> &KbDescriptor {
        &self.descriptor
    }

    fn rag_lookup(
        &self,
        embed: &EmbeddingFn,
        query: &str,
        k: usize,
    ) -> Result<Vec<(VectorRecord, f32)>, KbError> {
        let query_embedding = embed(query)?;
        Ok(self.store.similarity_search_with_score(&self.collection, &query_embedding, k))
    }

    fn store_convertor_result(
        &self,
        embed: &EmbeddingFn,
        result: &ConvertorResult,
        rag_settings: &crate::config::RagSettings,
    ) -> Result<(), KbError> {
        if !validate_document_source(result)? {
            return Err(KbError::ArtifactCorrupt(result.output_path.display().to_string()));
        }
        if self.has_full_convertor_result(result)? {
            return Ok(());
        }

        let mut page_texts = Vec::with_capacity(result.pages.len());
        for page_path in &result.pages {
            let text = fs::read_to_string(page_path).unwrap_or_default();
            page_texts.push(text);
        }

        let document_count = result.pages.len();
        let mut raw_chunks: Vec<(usize, String)> = Vec::new();
        for (document_number, text) in page_texts.iter().enumerate() {
            let document_number = document_number + 1;
            for chunk in chunk_text(text, rag_settings.rag_char_chunk_size, rag_settings.rag_char_overlap) {
                raw_chunks.push((document_number, chunk));
            }
        }
        if raw_chunks.is_empty() {
            return Ok(());
        }
        let chunk_count = raw_chunks.len();

        let model_str = result.model.clone().unwrap_or_default();
        let inserted = Utc::now().to_rfc3339();
        let mut records = Vec::with_capacity(chunk_count);
        for (chunk_number, (document_number, chunk)) in raw_chunks.into_iter().enumerate() {
            let embedding = embed(&chunk)?;
            let mut metadata = Map::new();
            metadata.insert("type".to_string(), json!(result.document_metadata.kind));
            metadata.insert("inserted".to_string(), json!(inserted));
            metadata.insert("conversion".to_string(), json!(result.conversion_type));
            metadata.insert("model".to_string(), json!(model_str));
            metadata.insert(
                "document_hash".to_string(),
                json!(result.document_metadata.hash),
            );
            metadata.insert("output_hash".to_string(), json!(result.result_hash));
            metadata.insert("document_number".to_string(), json!(document_number as i64));
            metadata.insert("document_count".to_string(), json!(document_count as i64));
            metadata.insert("chunk_number".to_string(), json!((chunk_number + 1) as i64));
            metadata.insert("chunk_count".to_string(), json!(chunk_count as i64));
            metadata.insert("document_path".to_string(), json!(result.document_path));
            if result.document_metadata.kind == DocumentKind::Document {
                metadata.insert("filename".to_string(), json!(result.document_metadata.filename));
                metadata.insert("page_number".to_string(), json!(document_number as i64));
                metadata.insert("page_count".to_string(), json!(document_count as i64));
            }

            records.push(VectorRecord {
                id: uuid::Uuid::new_v4().to_string(),
                embedding,
                document: chunk,
                metadata,
            });
        }
        self.store.add(&self.collection, records);
        Ok(())
    }

    fn has_full_document(&self, doc: &DocumentFile, force: bool) -> Result<bool, KbError> {
        let document_path = doc.get_document_path();
        if self.check_cache.is_checked(&document_path) && !doc.has_changed && !force {
            return Ok(true);
        }
        let mut filter = HashMap::new();
        filter.insert("document_hash".to_string(), json!(doc.file_hash()?));
        let records = self.store.get(&self.collection, &filter);

        let mut groups: HashMap<(String, String, String), Vec<&VectorRecord>> = HashMap::new();
        for record in &records {
            groups.entry(Self::group_key(record)).or_default().push(record);
        }
        for group in groups.values() {
            let document_numbers: HashSet<i64> =
                group.iter().filter_map(|r| r.metadata_i64("document_number")).collect();
            let document_count = group
                .first()
                .and_then(|r| r.metadata_i64("document_count"))
                .unwrap_or(0);
            let chunk_numbers: HashSet<i64> =
                group.iter().filter_map(|r| r.metadata_i64("chunk_number")).collect();
            let chunk_count = group.first().and_then(|r| r.metadata_i64("chunk_count")).unwrap_or(0);
            if !group.is_empty()
                && document_numbers.len() as i64 == document_count
                && chunk_numbers.len() as i64 == chunk_count
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn has_full_convertor_result(&self, result: &ConvertorResult) -> Result<bool, KbError> {
        let mut filter = HashMap::new();
        filter.insert("output_hash".to_string(), json!(result.result_hash));
        let records = self.store.get(&self.collection, &filter);
        if records.is_empty() {
            return Ok(false);
        }
        let document_numbers: HashSet<i64> =
            records.iter().filter_map(|r| r.metadata_i64("document_number")).collect();
        let chunk_numbers: HashSet<i64> =
            records.iter().filter_map(|r| r.metadata_i64("chunk_number")).collect();
        let chunk_count = records.first().and_then(|r| r.metadata_i64("chunk_count")).unwrap_or(0);
        Ok(document_numbers.len() == result.pages.len() && chunk_numbers.len() as i64 == chunk_count)
    }

    fn add_doc_path(&self, doc: &DocumentFile, force: bool) -> Result<(), KbError> {
        let document_path = doc.get_document_path();
        if self.check_cache.is_checked(&document_path) && !doc.has_changed && !force {
            return Ok(());
        }
        let mut filter = HashMap::new();
        filter.insert("document_hash".to_string(), json!(doc.file_hash()?));
        let records = self.store.get(&self.collection, &filter);

        let mut alias_set: HashSet<String> = HashSet::new();
        for record in &records {
            if let Some(existing) = record.metadata_str("document_path") {
                alias_set.extend(existing.split(';').map(str::to_string));
            }
        }
        if alias_set.contains(&document_path) {
            return Ok(());
        }
        alias_set.insert(document_path);
        let mut aliases: Vec<String> = alias_set.into_iter().collect();
        aliases.sort();
        let joined = aliases.join(";");

        for record in &records {
            let mut metadata = record.metadata.clone();
            metadata.insert("document_path".to_string(), json!(joined));
            self.store.update_metadata(&self.collection, &record.id, metadata);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), KbError> {
        self.store.delete_collection(&self.collection);
        self.check_cache.clear();
        Ok(())
    }

    fn mark_checked(&self, document_path: &str) {
        self.check_cache.mark_checked(document_path);
    }
}

/// Exposed for the reranker, which needs raw cosine distance between
/// already-embedded passages without going through a KB at all.
pub fn distance(a: &[f32], b: &[f32]) -> f32 {
    cosine_distance(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_drops_empty_and_respects_overlap() {
        let chunks = chunk_text("abcdefghij", 4, 2);
        assert_eq!(chunks, vec!["abcd", "cdef", "efgh", "ghij", "ij"]);
    }

    #[test]
    fn chunking_of_empty_text_is_empty() {
        assert!(chunk_text("", 10, 2).is_empty());
        assert!(chunk_text("   ", 10, 2).is_empty());
    }

    fn descriptor(name: &str, selection: Vec<&str>) -> KbDescriptor {
        KbDescriptor {
            name: name.to_string(),
            selection: selection.into_iter().map(str::to_string).collect(),
            convertors: vec![ConvertorConfig { conversion: "raw".to_string(), model: None, seed: None, temperature: None }],
            embedding: EmbeddingConfig { model: "e".to_string(), seed: None },
            languages: vec!["eng".to_string()],
        }
    }

    #[test]
    fn needs_refresh_true_when_selection_pattern_dropped() {
        let a = descriptor("k", vec!["src/*.pdf", "src/*.txt"]);
        let b = descriptor("k", vec!["src/*.pdf"]);
        assert!(a.needs_refresh(&b));
        assert!(!a.needs_refresh(&a.clone()));
    }

    #[test]
    fn needs_refresh_true_when_embedding_changes() {
        let a = descriptor("k", vec!["src/*"]);
        let mut b = a.clone();
        b.embedding.model = "other".to_string();
        assert!(a.needs_refresh(&b));
    }
}
