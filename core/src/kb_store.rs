//! C5 — KB Store: a persistence backend owning a set of KBs, plus the
//! composite that routes across nested stores by full-name prefix.
//!
//! Grounded on `original_source/backend/kb/knowledge_base.py`'s store-side
//! counterpart (`KnowledgeBaseStore`/`SuperKnowledgeBaseStore`): descriptors
//! persisted one-per-directory as `config.json`, slugified for the
//! directory name with a uuid suffix for uniqueness, `needs_refresh`
//! clearing the old collection before the new descriptor is written. The
//! registry-over-trait-objects shape follows `doc_source::SuperDocSource`.

use crate::error::KbError;
use crate::hash::{read_json_if_exists, write_atomic_json};
use crate::kb::{Kb, KbDescriptor, VectorKb};
use crate::runner::EmbeddingFn;
use crate::vector_store::VectorStore;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Truncates to 50 chars, replaces any character outside
/// `[A-Za-z0-9._-]` with `_`, and prefixes `kb_` if the result would start
/// with `. _ -`. Does not append the uuid suffix — callers own uniqueness.
pub fn slugify(name: &str) -> String {
    let truncated: String = name.chars().take(50).collect();
    let mut slug: String = truncated
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if slug.is_empty() {
        slug = "kb".to_string();
    }
    let first = slug.chars().next().unwrap();
    if matches!(first, '.' | '_' | '-') {
        slug = format!("kb_{slug}");
    }
    slug
}

pub fn directory_name(name: &str) -> String {
    format!("{}-{}", slugify(name), uuid::Uuid::new_v4())
}

/// The contract every KB Store implements (§4.5), including the composite.
pub trait KbStore: Send + Sync {
    fn name(&self) -> &str;

    fn list(&self) -> Vec<Arc<dyn Kb>>;

    fn get(&self, name: &str) -> Option<Arc<dyn Kb>>;

    fn upsert(&self, descriptor: KbDescriptor) -> Result<Arc<dyn Kb>, KbError>;

    fn delete(&self, name: &str) -> Result<(), KbError>;

    /// Re-scans disk, discarding any in-memory state. Concrete stores
    /// reload descriptors from their `<slug>-<uuid>/config.json` entries;
    /// composites forward to every child.
    fn refresh(&self) -> Result<(), KbError>;
}

struct Entry {
    kb: Arc<VectorKb>,
    dir: PathBuf,
}

/// A KB Store persisting descriptors under `<store-root>/<slug>-<uuid>/config.json`,
/// with the vector backend's own storage at `<store-root>/db/`.
pub struct FileKbStore {
    name: String,
    root: PathBuf,
    store: Arc<dyn VectorStore>,
    check_cache_dir: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
}

impl FileKbStore {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        store: Arc<dyn VectorStore>,
        check_cache_dir: impl Into<PathBuf>,
    ) -> Result<Self, KbError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let this = Self {
            name: name.into(),
            root,
            store,
            check_cache_dir: check_cache_dir.into(),
            entries: Mutex::new(HashMap::new()),
        };
        this.refresh()?;
        Ok(this)
    }

    fn config_path(dir: &Path) -> PathBuf {
        dir.join("config.json")
    }

    fn load_entry(&self, dir: PathBuf) -> Result<Option<(String, Entry)>, KbError> {
        let descriptor = match read_json_if_exists::<KbDescriptor>(&Self::config_path(&dir))? {
            Some(d) => d,
            None => return Ok(None),
        };
        let collection = dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| descriptor.name.clone());
        let name = descriptor.name.clone();
        let kb = Arc::new(VectorKb::new(
            descriptor,
            collection,
            Arc::clone(&self.store),
            &self.check_cache_dir,
        ));
        Ok(Some((name, Entry { kb, dir })))
    }
}

impl KbStore for FileKbStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn list(&self) -> Vec<Arc<dyn Kb>> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|e| Arc::clone(&e.kb) as Arc<dyn Kb>)
            .collect()
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Kb>> {
        self.entries.lock().unwrap().get(name).map(|e| Arc::clone(&e.kb) as Arc<dyn Kb>)
    }

    fn upsert(&self, descriptor: KbDescriptor) -> Result<Arc<dyn Kb>, KbError> {
        let mut entries = self.entries.lock().unwrap();
        let existing = entries.get(&descriptor.name);

        let needs_refresh = existing.map(|e| e.kb.needs_refresh(&descriptor)).unwrap_or(false);
        if let Some(e) = existing {
            if needs_refresh {
                e.kb.clear()?;
            }
        }

        let dir = match existing {
            Some(e) if !needs_refresh => e.dir.clone(),
            _ => self.root.join(directory_name(&descriptor.name)),
        };
        fs::create_dir_all(&dir)?;
        write_atomic_json(&Self::config_path(&dir), &descriptor)?;

        let collection = dir.file_name().unwrap().to_string_lossy().into_owned();
        let kb = Arc::new(VectorKb::new(
            descriptor.clone(),
            collection,
            Arc::clone(&self.store),
            &self.check_cache_dir,
        ));
        entries.insert(descriptor.name.clone(), Entry { kb: Arc::clone(&kb), dir });
        Ok(kb)
    }

    fn delete(&self, name: &str) -> Result<(), KbError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.remove(name) {
            entry.kb.clear()?;
            let _ = fs::remove_dir_all(&entry.dir);
        }
        Ok(())
    }

    fn refresh(&self) -> Result<(), KbError> {
        let mut fresh = HashMap::new();
        if self.root.is_dir() {
            let mut dirs: Vec<PathBuf> = fs::read_dir(&self.root)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir() && p.file_name() != Some(std::ffi::OsStr::new("db")))
                .collect();
            dirs.sort();
            for dir in dirs {
                if let Some((name, entry)) = self.load_entry(dir)? {
                    fresh.insert(name, entry);
                }
            }
        }
        *self.entries.lock().unwrap() = fresh;
        Ok(())
    }
}

/// Routes `get`/`upsert`/`delete` by full-name prefix `<store>/<kb>`;
/// unqualified names fall back to linear search across children. Nestable.
pub struct SuperKbStore {
    name: String,
    children: Vec<Arc<dyn KbStore>>,
}

impl SuperKbStore {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn KbStore>>) -> Self {
        Self { name: name.into(), children }
    }

    fn split_prefix<'a>(&self, full_name: &'a str) -> Option<(&'a str, &'a str)> {
        full_name.split_once('/')
    }
}

impl KbStore for SuperKbStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn list(&self) -> Vec<Arc<dyn Kb>> {
        self.children.iter().flat_map(|c| c.list()).collect()
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Kb>> {
        if let Some((store_name, rest)) = self.split_prefix(name) {
            if let Some(child) = self.children.iter().find(|c| c.name() == store_name) {
                if let Some(kb) = child.get(rest) {
                    return Some(kb);
                }
            }
        }
        self.children.iter().find_map(|c| c.get(name))
    }

    fn upsert(&self, descriptor: KbDescriptor) -> Result<Arc<dyn Kb>, KbError> {
        if let Some((store_name, rest)) = self.split_prefix(&descriptor.name) {
            if let Some(child) = self.children.iter().find(|c| c.name() == store_name) {
                let mut inner = descriptor;
                inner.name = rest.to_string();
                return child.upsert(inner);
            }
        }
        self.children
            .first()
            .ok_or_else(|| KbError::InvalidDescriptor("no child store to receive upsert".to_string()))?
            .upsert(descriptor)
    }

    fn delete(&self, name: &str) -> Result<(), KbError> {
        if let Some((store_name, rest)) = self.split_prefix(name) {
            if let Some(child) = self.children.iter().find(|c| c.name() == store_name) {
                return child.delete(rest);
            }
        }
        for child in &self.children {
            child.delete(name)?;
        }
        Ok(())
    }

    fn refresh(&self) -> Result<(), KbError> {
        for child in &self.children {
            child.refresh()?;
        }
        Ok(())
    }
}

/// Resolves a KB's full name across a composite store (`<store>/<kb>`,
/// nestable); a leaf store's full name is just its own KB name.
pub fn full_name(store_name: &str, kb_name: &str) -> String {
    if store_name.is_empty() {
        kb_name.to_string()
    } else {
        format!("{store_name}/{kb_name}")
    }
}

/// Binds an embedding function for a KB's descriptor via the given runner,
/// or `None` if the embedding model is not available on any backend.
pub fn embedding_for(
    runner: &dyn crate::runner::Runner,
    kb: &dyn Kb,
) -> Option<EmbeddingFn> {
    runner.get_embedding(&kb.descriptor().embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convertor::ConvertorConfig;
    use crate::runner::EmbeddingConfig;
    use crate::vector_store::FileVectorStore;

    fn descriptor(name: &str) -> KbDescriptor {
        KbDescriptor {
            name: name.to_string(),
            selection: vec!["src/*".to_string()],
            convertors: vec![ConvertorConfig { conversion: "raw".to_string(), model: None, seed: None, temperature: None }],
            embedding: EmbeddingConfig { model: "e".to_string(), seed: None },
            languages: vec!["eng".to_string()],
        }
    }

    #[test]
    fn slugify_truncates_and_replaces_forbidden_chars() {
        let long = "a".repeat(80);
        assert_eq!(slugify(&long).len(), 50);
        assert_eq!(slugify("hello world!"), "hello_world_");
    }

    #[test]
    fn slugify_prefixes_kb_for_leading_special_chars() {
        assert!(slugify(".hidden").starts_with("kb_"));
        assert!(slugify("-dash").starts_with("kb_"));
        assert!(slugify("_under").starts_with("kb_"));
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileVectorStore::new(dir.path()));
        let kb_store =
            FileKbStore::new("s", dir.path(), store, dir.path().join(".cache/kb_check_cache"))
                .unwrap();
        kb_store.upsert(descriptor("k")).unwrap();
        assert!(kb_store.get("k").is_some());
        assert_eq!(kb_store.list().len(), 1);
    }

    #[test]
    fn upsert_with_needs_refresh_clears_old_collection() {
        use crate::vector_store::VectorRecord;
        let dir = tempfile::tempdir().unwrap();
        let vstore = Arc::new(FileVectorStore::new(dir.path()));
        let kb_store = FileKbStore::new(
            "s",
            dir.path(),
            Arc::clone(&vstore) as Arc<dyn VectorStore>,
            dir.path().join(".cache/kb_check_cache"),
        )
        .unwrap();
        let kb1 = kb_store.upsert(descriptor("k")).unwrap();
        vstore.add(
            &kb1.full_name(),
            vec![VectorRecord {
                id: "r1".to_string(),
                embedding: vec![1.0, 0.0],
                document: "text".to_string(),
                metadata: Default::default(),
            }],
        );
        assert_eq!(vstore.get(&kb1.full_name(), &Default::default()).len(), 1);

        let mut changed = descriptor("k");
        changed.embedding.model = "other".to_string();
        let kb2 = kb_store.upsert(changed).unwrap();
        assert_eq!(kb2.descriptor().embedding.model, "other");
        assert_eq!(vstore.get(&kb1.full_name(), &Default::default()).len(), 0);
    }

    #[test]
    fn refresh_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileVectorStore::new(dir.path()));
        let kb_store =
            FileKbStore::new("s", dir.path(), store, dir.path().join(".cache/kb_check_cache"))
                .unwrap();
        kb_store.upsert(descriptor("k")).unwrap();
        kb_store.refresh().unwrap();
        assert!(kb_store.get("k").is_some());
    }

    #[test]
    fn composite_routes_by_full_name_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileVectorStore::new(dir.path()));
        let leaf = Arc::new(
            FileKbStore::new("s1", dir.path().join("s1"), store, dir.path().join(".cache"))
                .unwrap(),
        );
        leaf.upsert(descriptor("k")).unwrap();
        let composite = SuperKbStore::new("", vec![leaf as Arc<dyn KbStore>]);
        assert!(composite.get("s1/k").is_some());
        assert!(composite.get("k").is_some());
        assert!(composite.get("s2/k").is_none());
    }
}
