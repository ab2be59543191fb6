//! C6 — Ingestion Service: a single-threaded cooperative worker that walks
//! every KB x document x convertor, honouring caches and cancellation.
//!
//! Grounded on `original_source/backend/knowledge_base_service.py` for the
//! exact loop/checkpoint/status-blob shape (cancellation checked before
//! every KB, every selection pattern, every document, every convertor);
//! the Rust worker-thread/mutex-flag idiom (an `AtomicBool` flag plus a
//! `start`/`stop` pair around a detached `std::thread`) is grounded on the
//! teacher's `server/src/watch.rs` background-worker pattern.

use crate::convertor::{self, Convertor, DocumentContext};
use crate::doc_source::DocSource;
use crate::document_file::DocumentKind;
use crate::kb::Kb;
use crate::kb_store::KbStore;
use crate::runner::Runner;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Done,
    Cancelled,
}

/// The status blob readable at any time while (or after) a run executes.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub status: RunStatus,
    pub kb_num: usize,
    pub kb_name: String,
    pub kb_total: usize,
    pub doc_num: usize,
    pub doc_path: String,
    pub doc_total: usize,
    pub convertor: Option<String>,
    pub error: bool,
}

/// `kb_status(name)` result: the KB's selection partitioned by whether
/// `has_full_document` currently holds for each resolved file. Independent
/// of a running worker — useful for an external caller to render ingestion
/// coverage without starting a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KbStatus {
    pub processed_documents: Vec<String>,
    pub not_processed_documents: Vec<String>,
}

impl Default for IngestionStatus {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            kb_num: 0,
            kb_name: String::new(),
            kb_total: 0,
            doc_num: 0,
            doc_path: String::new(),
            doc_total: 0,
            convertor: None,
            error: false,
        }
    }
}

/// Raised internally to unwind out of the nested KB/document/convertor
/// loops the moment a cancellation checkpoint observes `active == false`.
/// Caught once at the top of the worker; never escapes `run()`.
struct Cancelled;

/// Long-running worker over a [`KbStore`] and a [`DocSource`], started on
/// demand. Holds a mutex-guarded status blob readable by any caller while
/// the background thread (if any) is running.
pub struct IngestionService {
    doc_source: Arc<dyn DocSource>,
    kb_store: Arc<dyn KbStore>,
    runner: Arc<dyn Runner>,
    rag_settings: crate::config::RagSettings,
    active: Arc<AtomicBool>,
    status: Arc<Mutex<IngestionStatus>>,
}

impl IngestionService {
    pub fn new(
        doc_source: Arc<dyn DocSource>,
        kb_store: Arc<dyn KbStore>,
        runner: Arc<dyn Runner>,
        rag_settings: crate::config::RagSettings,
    ) -> Self {
        Self {
            doc_source,
            kb_store,
            runner,
            rag_settings,
            active: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(IngestionStatus::default())),
        }
    }

    pub fn status(&self) -> IngestionStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolves `name`'s KB selection into a file list and partitions it
    /// into `processed_documents`/`not_processed_documents` by calling
    /// `has_full_document` per file. Does not touch the `active` flag or
    /// status blob; safe to call whether or not a run is in progress.
    /// Returns `None` if no KB named `name` is known to the store.
    pub fn kb_status(&self, name: &str) -> Option<KbStatus> {
        let kb = self.kb_store.get(name)?;
        let mut doc_paths: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for pattern in &kb.descriptor().selection {
            if let Ok(paths) = self.doc_source.list_files(pattern) {
                doc_paths.extend(paths);
            }
        }

        let mut status = KbStatus::default();
        for path in doc_paths {
            let processed = self
                .doc_source
                .get(&path)
                .and_then(|doc| kb.has_full_document(&doc, false).ok())
                .unwrap_or(false);
            if processed {
                status.processed_documents.push(path);
            } else {
                status.not_processed_documents.push(path);
            }
        }
        Some(status)
    }

    /// Spawns the worker iff not already active. Returns `false` if a run
    /// was already in progress (no new thread spawned).
    pub fn start(self: &Arc<Self>) -> bool {
        if self.active.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return false;
        }
        let this = Arc::clone(self);
        std::thread::spawn(move || this.run());
        true
    }

    /// Clears the `active` flag; the worker observes this at the next
    /// checkpoint (at most one document.convertor later) and exits with
    /// `status=cancelled`.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn checkpoint(&self) -> Result<(), Cancelled> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(Cancelled);
        }
        Ok(())
    }

    fn set_status(&self, f: impl FnOnce(&mut IngestionStatus)) {
        f(&mut self.status.lock().unwrap());
    }

    fn run(self: Arc<Self>) {
        self.set_status(|s| {
            *s = IngestionStatus { status: RunStatus::Running, ..IngestionStatus::default() };
        });
        info!("ingestion run starting");

        let outcome = self.run_inner();

        self.active.store(false, Ordering::SeqCst);
        self.set_status(|s| {
            s.status = match outcome {
                Ok(()) => RunStatus::Done,
                Err(Cancelled) => RunStatus::Cancelled,
            };
        });
        info!(status = ?self.status().status, "ingestion run finished");
    }

    fn run_inner(&self) -> Result<(), Cancelled> {
        let kbs = self.kb_store.list();
        let kb_total = kbs.len();
        self.set_status(|s| s.kb_total = kb_total);

        for (kb_index, kb) in kbs.into_iter().enumerate() {
            self.checkpoint()?;
            self.set_status(|s| {
                s.kb_num = kb_index + 1;
                s.kb_name = kb.full_name();
                s.doc_num = 0;
                s.doc_total = 0;
                s.doc_path.clear();
                s.convertor = None;
            });

            if let Err(Cancelled) = self.run_kb(kb.as_ref()) {
                return Err(Cancelled);
            }
        }
        Ok(())
    }

    fn run_kb(&self, kb: &dyn Kb) -> Result<(), Cancelled> {
        let descriptor = kb.descriptor();
        let convertors: Vec<Box<dyn Convertor>> = descriptor
            .convertors
            .iter()
            .filter_map(|cfg| convertor::from_config(cfg, Arc::clone(&self.runner)))
            .collect();
        if convertors.is_empty() {
            warn!(kb = kb.full_name(), "no convertors resolved for KB, skipping");
            return Ok(());
        }
        let ctx = DocumentContext { languages: descriptor.languages.clone() };

        let mut doc_paths: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for pattern in &descriptor.selection {
            self.checkpoint()?;
            match self.doc_source.list_files(pattern) {
                Ok(paths) => doc_paths.extend(paths),
                Err(e) => {
                    warn!(kb = kb.full_name(), pattern, error = %e, "selection pattern failed to expand");
                    self.set_status(|s| s.error = true);
                }
            }
        }
        let doc_paths: Vec<String> = doc_paths.into_iter().collect();
        self.set_status(|s| s.doc_total = doc_paths.len());

        let embed = self.runner.get_embedding(&descriptor.embedding);

        for (doc_index, doc_path) in doc_paths.iter().enumerate() {
            self.checkpoint()?;
            self.set_status(|s| {
                s.doc_num = doc_index + 1;
                s.doc_path = doc_path.clone();
                s.convertor = None;
            });

            self.run_document(kb, &convertors, &ctx, doc_path, embed.as_ref());
        }
        Ok(())
    }

    fn run_document(
        &self,
        kb: &dyn Kb,
        convertors: &[Box<dyn Convertor>],
        ctx: &DocumentContext,
        doc_path: &str,
        embed: Option<&crate::runner::EmbeddingFn>,
    ) {
        let mut doc = match self.doc_source.get(doc_path) {
            Some(d) => d,
            None => {
                warn!(doc_path, "document handle could not be resolved, skipping");
                self.set_status(|s| s.error = true);
                return;
            }
        };

        match kb.has_full_document(&doc, false) {
            Ok(true) => {
                if let Err(e) = kb.add_doc_path(&doc, false) {
                    warn!(doc_path, error = %e, "alias merge failed");
                    self.set_status(|s| s.error = true);
                    return;
                }
                kb.mark_checked(doc_path);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(doc_path, error = %e, "has_full_document failed");
                self.set_status(|s| s.error = true);
                return;
            }
        }

        let Some(embed) = embed else {
            warn!(kb = kb.full_name(), "embedding model unavailable, skipping document");
            self.set_status(|s| s.error = true);
            return;
        };

        for c in convertors {
            if self.checkpoint().is_err() {
                return;
            }
            if c.is_image_only() && doc.document_kind() != DocumentKind::Image {
                continue;
            }
            self.set_status(|s| s.convertor = Some(c.conversion_type().to_string()));

            let result = match c.convert(&mut doc, ctx) {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) => {
                    warn!(doc_path, conversion = c.conversion_type(), error = %e, "conversion failed");
                    self.set_status(|s| s.error = true);
                    continue;
                }
            };

            match kb.store_convertor_result(embed, &result, &self.rag_settings) {
                Ok(()) => {
                    kb.mark_checked(doc_path);
                    return;
                }
                Err(e) => {
                    warn!(doc_path, conversion = c.conversion_type(), error = %e, "storing conversion result failed");
                    self.set_status(|s| s.error = true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RagSettings;
    use crate::convertor::ConvertorConfig;
    use crate::doc_source::LocalFileSystemSource;
    use crate::kb::KbDescriptor;
    use crate::kb_store::FileKbStore;
    use crate::runner::{DebugRunner, EmbeddingConfig};
    use crate::vector_store::FileVectorStore;

    fn settings() -> RagSettings {
        RagSettings {
            rag_document_count: 5,
            rag_char_chunk_size: 50,
            rag_char_overlap: 5,
            rag_similarity_score_threshold: 0.8,
            rag_score_margin: 0.2,
            rag_cosine_distance_irrelevance_threshold: 1.0,
        }
    }

    struct HashEmbedRunner;
    impl Runner for HashEmbedRunner {
        fn list_chat_models(&self) -> Vec<String> {
            Vec::new()
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
            _messages: &[crate::runner::Message],
            _is_stopped: &dyn Fn() -> bool,
            _guard: &mut crate::guard::GenerationGuard,
            _on_progress: &mut dyn FnMut(crate::runner::MessageProgress),
            _options: crate::runner::CompletionOptions,
        ) -> Result<crate::runner::StreamResult, crate::error::RunnerError> {
            unreachable!()
        }
        fn run_text_completion_simple(
            &self,
            _model: &str,
            _messages: &[crate::runner::Message],
            _options: crate::runner::CompletionOptions,
        ) -> Result<String, crate::error::RunnerError> {
            unreachable!()
        }
        fn get_embedding(&self, _config: &EmbeddingConfig) -> Option<crate::runner::EmbeddingFn> {
            Some(Arc::new(|text: &str| {
                Ok(vec![crate::hash::hash_bytes(text.as_bytes()).len() as f32, text.len() as f32])
            }))
        }
        fn supports_thinking(&self, _model: &str) -> crate::runner::ThinkingSupport {
            None
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<IngestionService>, Arc<FileKbStore>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/foo.txt"), "hello world, this is a test document").unwrap();

        let doc_source = Arc::new(
            LocalFileSystemSource::with_cache(
                "src",
                dir.path().join("src"),
                true,
                &dir.path().join(".cache/doc_hash_cache"),
            )
            .unwrap(),
        );
        let vstore = Arc::new(FileVectorStore::new(dir.path().join("kbstore")));
        let kb_store = Arc::new(
            FileKbStore::new(
                "default",
                dir.path().join("kbstore"),
                vstore,
                dir.path().join(".cache/kb_check_cache"),
            )
            .unwrap(),
        );
        kb_store
            .upsert(KbDescriptor {
                name: "k".to_string(),
                selection: vec!["src/*.txt".to_string()],
                convertors: vec![ConvertorConfig {
                    conversion: "raw".to_string(),
                    model: None,
                    seed: None,
                    temperature: None,
                }],
                embedding: EmbeddingConfig { model: "e".to_string(), seed: None },
                languages: vec!["eng".to_string()],
            })
            .unwrap();

        let runner: Arc<dyn Runner> = Arc::new(HashEmbedRunner);
        let service =
            Arc::new(IngestionService::new(doc_source, Arc::clone(&kb_store) as Arc<dyn crate::kb_store::KbStore>, runner, settings()));
        (dir, service, kb_store)
    }

    #[test]
    fn fresh_ingestion_indexes_the_document() {
        let (dir, service, kb_store) = setup();
        service.run_inner().unwrap();
        let kb = kb_store.get("k").unwrap();
        let doc_source = crate::doc_source::LocalFileSystemSource::with_cache(
            "src",
            dir.path().join("src"),
            true,
            &dir.path().join(".cache/doc_hash_cache"),
        )
        .unwrap();
        let doc = doc_source.get("src/foo.txt").unwrap();
        assert!(kb.has_full_document(&doc, true).unwrap());
    }

    #[test]
    fn second_run_inserts_nothing_new() {
        let (_dir, service, kb_store) = setup();
        service.run_inner().unwrap();
        let kb = kb_store.get("k").unwrap();
        let before = kb
            .rag_lookup(&Arc::new(|_: &str| Ok(vec![0.0, 0.0])), "q", 100)
            .unwrap()
            .len();

        service.run_inner().unwrap();
        let after = kb
            .rag_lookup(&Arc::new(|_: &str| Ok(vec![0.0, 0.0])), "q", 100)
            .unwrap()
            .len();
        assert_eq!(before, after);
    }

    #[test]
    fn kb_status_partitions_processed_and_unprocessed() {
        let (_dir, service, _kb_store) = setup();
        let before = service.kb_status("k").unwrap();
        assert_eq!(before.processed_documents, Vec::<String>::new());
        assert_eq!(before.not_processed_documents, vec!["src/foo.txt".to_string()]);

        service.run_inner().unwrap();
        let after = service.kb_status("k").unwrap();
        assert_eq!(after.processed_documents, vec!["src/foo.txt".to_string()]);
        assert!(after.not_processed_documents.is_empty());
    }

    #[test]
    fn kb_status_unknown_kb_is_none() {
        let (_dir, service, _kb_store) = setup();
        assert!(service.kb_status("nope").is_none());
    }

    #[test]
    fn start_twice_only_spawns_one_worker() {
        let (_dir, service, _kb_store) = setup();
        assert!(service.start());
        // The CAS in `start()` flips `active` synchronously before the
        // worker thread is spawned, so this is deterministic regardless
        // of whether the first worker has finished yet.
        assert!(!service.start());
        for _ in 0..200 {
            if !service.is_active() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!service.is_active());
    }

    #[test]
    fn stop_before_start_leaves_idle_status() {
        let (_dir, service, _kb_store) = setup();
        service.stop();
        assert_eq!(service.status().status, RunStatus::Idle);
    }
}
