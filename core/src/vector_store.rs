//! Embedded vector store backing the KB abstraction: one flat JSON file per
//! collection under `<store-root>/db/<collection>.json`, brute-force cosine
//! distance search over resident records.
//!
//! No external vector-database process: this crate runs single-process with
//! local disk (spec §1 Non-goals), and the teacher introduces no async
//! runtime anywhere, so an embedded client that would require one (grpc/http
//! to a sidecar) does not fit. Grounded on the flat-file JSON index idiom in
//! `examples/DevsHero-NeuroSiphon/src/vector_store.rs` (`IndexStore`:
//! `serde_json`-persisted records, brute-force cosine over an in-memory
//! `Vec`), adapted from its per-repo-file schema to the KB's per-chunk
//! record schema the spec's wire contract describes (§6).

use crate::hash::{read_json_if_exists, write_atomic_json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// One stored chunk: an embedding plus the text and metadata the KB layer
/// attaches (document_hash, output_hash, chunk_number, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: Map<String, Value>,
}

impl VectorRecord {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn metadata_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(|v| v.as_i64())
    }
}

/// The contract a KB issues against (§6 Vector-store wire contract). Lower
/// score = more similar (distance semantics), matching the cosine-distance
/// thresholds `rag_settings` expresses scores in.
pub trait VectorStore: Send + Sync {
    fn get_or_create_collection(&self, name: &str);

    /// Returns every record in `collection` whose metadata matches every
    /// key/value pair in `filter` (conjunctive equality — the only query
    /// shape the KB layer ever issues).
    fn get(&self, collection: &str, filter: &HashMap<String, Value>) -> Vec<VectorRecord>;

    fn add(&self, collection: &str, records: Vec<VectorRecord>);

    /// Replaces one record's metadata wholesale (used by `add_doc_path` to
    /// rewrite `document_path` after an alias merge).
    fn update_metadata(&self, collection: &str, id: &str, metadata: Map<String, Value>);

    /// Top-k by ascending cosine distance (`1 - cosine_similarity`).
    fn similarity_search_with_score(
        &self,
        collection: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Vec<(VectorRecord, f32)>;

    fn delete_collection(&self, name: &str);
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    records: Vec<VectorRecord>,
}

fn matches_filter(record: &VectorRecord, filter: &HashMap<String, Value>) -> bool {
    filter.iter().all(|(k, v)| record.metadata.get(k) == Some(v))
}

/// A local persistent client holding one JSON file per collection under
/// `<root>/db`, matching §6's `<kb-store-root>/db/` layout.
pub struct FileVectorStore {
    db_dir: PathBuf,
    cache: Mutex<HashMap<String, Collection>>,
}

impl FileVectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let db_dir = root.into().join("db");
        let _ = fs::create_dir_all(&db_dir);
        Self { db_dir, cache: Mutex::new(HashMap::new()) }
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.db_dir.join(format!("{collection}.json"))
    }

    fn load(&self, collection: &str) -> Collection {
        read_json_if_exists::<Collection>(&self.path_for(collection))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    fn with_collection<R>(&self, collection: &str, f: impl FnOnce(&mut Collection) -> R) -> R {
        let mut cache = self.cache.lock().unwrap();
        let entry = cache
            .entry(collection.to_string())
            .or_insert_with(|| self.load(collection));
        let result = f(entry);
        let _ = write_atomic_json(&self.path_for(collection), entry);
        result
    }
}

impl VectorStore for FileVectorStore {
    fn get_or_create_collection(&self, name: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.entry(name.to_string()).or_insert_with(|| self.load(name));
    }

    fn get(&self, collection: &str, filter: &HashMap<String, Value>) -> Vec<VectorRecord> {
        let mut cache = self.cache.lock().unwrap();
        let entry = cache
            .entry(collection.to_string())
            .or_insert_with(|| self.load(collection));
        entry.records.iter().filter(|r| matches_filter(r, filter)).cloned().collect()
    }

    fn add(&self, collection: &str, records: Vec<VectorRecord>) {
        self.with_collection(collection, |c| c.records.extend(records));
    }

    fn update_metadata(&self, collection: &str, id: &str, metadata: Map<String, Value>) {
        self.with_collection(collection, |c| {
            if let Some(r) = c.records.iter_mut().find(|r| r.id == id) {
                r.metadata = metadata;
            }
        });
    }

    fn similarity_search_with_score(
        &self,
        collection: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Vec<(VectorRecord, f32)> {
        let mut cache = self.cache.lock().unwrap();
        let entry = cache
            .entry(collection.to_string())
            .or_insert_with(|| self.load(collection));
        let mut scored: Vec<(VectorRecord, f32)> = entry
            .records
            .iter()
            .map(|r| (r.clone(), cosine_distance(query_embedding, &r.embedding)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    fn delete_collection(&self, name: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.remove(name);
        let _ = fs::remove_file(self.path_for(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, embedding: Vec<f32>, meta: &[(&str, &str)]) -> VectorRecord {
        let mut metadata = Map::new();
        for (k, v) in meta {
            metadata.insert(k.to_string(), json!(v));
        }
        VectorRecord { id: id.to_string(), embedding, document: "text".to_string(), metadata }
    }

    #[test]
    fn cosine_distance_is_zero_for_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn add_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVectorStore::new(dir.path());
        store.add(
            "kb1",
            vec![record("a", vec![1.0, 0.0], &[("document_hash", "h1")])],
        );
        let mut filter = HashMap::new();
        filter.insert("document_hash".to_string(), json!("h1"));
        let found = store.get("kb1", &filter);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[test]
    fn similarity_search_orders_by_ascending_distance() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVectorStore::new(dir.path());
        store.add(
            "kb1",
            vec![
                record("far", vec![0.0, 1.0], &[]),
                record("near", vec![1.0, 0.0], &[]),
            ],
        );
        let results = store.similarity_search_with_score("kb1", &[1.0, 0.0], 2);
        assert_eq!(results[0].0.id, "near");
        assert_eq!(results[1].0.id, "far");
    }

    #[test]
    fn update_metadata_replaces_record_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVectorStore::new(dir.path());
        store.add("kb1", vec![record("a", vec![1.0], &[("document_path", "x")])]);
        let mut meta = Map::new();
        meta.insert("document_path".to_string(), json!("x;y"));
        store.update_metadata("kb1", "a", meta);
        let mut filter = HashMap::new();
        filter.insert("document_path".to_string(), json!("x;y"));
        assert_eq!(store.get("kb1", &filter).len(), 1);
    }

    #[test]
    fn delete_collection_removes_records_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVectorStore::new(dir.path());
        store.add("kb1", vec![record("a", vec![1.0], &[])]);
        store.delete_collection("kb1");
        assert!(store.get("kb1", &HashMap::new()).is_empty());
        assert!(!dir.path().join("db").join("kb1.json").exists());
    }

    #[test]
    fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileVectorStore::new(dir.path());
            store.add("kb1", vec![record("a", vec![1.0], &[])]);
        }
        let store2 = FileVectorStore::new(dir.path());
        assert_eq!(store2.get("kb1", &HashMap::new()).len(), 1);
    }
}
