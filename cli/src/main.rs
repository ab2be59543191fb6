//! `ragcore` CLI — drives ingestion and one-shot chat turns against a
//! locally configured knowledge base, for manual testing of the core
//! library without a host server.

use clap::{Parser, Subcommand};
use ragcore::config::{CoreConfig, RagSettings};
use ragcore::convertor::ConvertorConfig;
use ragcore::doc_source::LocalFileSystemSource;
use ragcore::guard::GuardConfig;
use ragcore::ingestion::IngestionService;
use ragcore::kb::{Kb, KbDescriptor};
use ragcore::kb_store::{FileKbStore, KbStore};
use ragcore::orchestrator::{ChatOrchestrator, ChatTurnRequest};
use ragcore::room::RoomStateRegistry;
use ragcore::runner::{CompletionOptions, DebugRunner, EmbeddingConfig, OllamaRunner, Runner};
use ragcore::vector_store::FileVectorStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ragcore", version, about = "Self-hosted RAG assistant core, driven from the command line")]
struct Cli {
    /// Data root: document source files live under <root>/docs, KB
    /// descriptors and vector data under <root>/kb.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// LLM backend: "debug" (canned, no network) or "ollama" (local server).
    #[arg(long, global = true, default_value = "debug")]
    backend: String,

    /// Ollama host, used when --backend=ollama.
    #[arg(long, global = true, default_value = "http://localhost:11434")]
    ollama_host: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a KB descriptor.
    KbUpsert {
        name: String,
        /// Glob pattern(s) against the document source, e.g. "docs/*.txt".
        #[arg(long = "pattern", required = true)]
        patterns: Vec<String>,
        /// Convertor tag: raw | ocr | ocr_llm | vision_llm.
        #[arg(long, default_value = "raw")]
        conversion: String,
        #[arg(long, default_value = "nomic-embed-text")]
        embedding_model: String,
    },
    /// List configured KBs.
    KbList,
    /// Start a background ingestion run over every configured KB. Ctrl-C
    /// requests cancellation instead of killing the process outright.
    IngestStart,
    /// Request cancellation of the running ingestion worker.
    IngestStop,
    /// Print the current ingestion status as JSON.
    IngestStatus,
    /// Resolve a KB's selection and report which files are fully indexed.
    KbStatus { name: String },
    /// Run one chat turn against a KB (or without retrieval if --kb is omitted).
    Chat {
        /// Room id; turns in the same room share cancellation state.
        #[arg(long, default_value = "default")]
        room: String,
        /// Chat model name known to the selected backend.
        #[arg(long, default_value = "debug_lorem_ipsum")]
        model: String,
        /// KB name to ground the turn in. Omit for a plain chat turn.
        #[arg(long)]
        kb: Option<String>,
        /// The user's message.
        message: String,
    },
}

fn doc_source_root(root: &std::path::Path) -> PathBuf {
    root.join("docs")
}

fn kb_store_root(root: &std::path::Path) -> PathBuf {
    root.join("kb")
}

fn build_runner(cli: &Cli) -> Arc<dyn Runner> {
    match cli.backend.as_str() {
        "ollama" => Arc::new(OllamaRunner::new(cli.ollama_host.clone())),
        _ => Arc::new(DebugRunner::new()),
    }
}

fn open_kb_store(root: &std::path::Path) -> Arc<FileKbStore> {
    let store_root = kb_store_root(root);
    let vector_store = Arc::new(FileVectorStore::new(store_root.join("db")));
    Arc::new(
        FileKbStore::new("kb", store_root.clone(), vector_store, store_root.join(".cache/kb_check_cache"))
            .unwrap_or_else(|e| {
                eprintln!("failed to open KB store: {e}");
                std::process::exit(1);
            }),
    )
}

/// Spawns a background thread that blocks on Ctrl-C and runs `on_interrupt`
/// once the signal arrives, so a long-running command cancels the work it
/// started instead of leaving a half-written run behind.
fn spawn_ctrl_c_canceller(on_interrupt: impl FnOnce() + Send + 'static) {
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build ctrl-c runtime");
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, requesting cancellation...");
                on_interrupt();
            }
        });
    });
}

fn open_doc_source(root: &std::path::Path) -> Arc<LocalFileSystemSource> {
    let docs_root = doc_source_root(root);
    Arc::new(
        LocalFileSystemSource::new("docs", docs_root.clone()).unwrap_or_else(|e| {
            eprintln!("failed to open document source at {}: {e}", docs_root.display());
            std::process::exit(1);
        }),
    )
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ragcore=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let root = cli.root.clone();

    match &cli.command {
        Commands::KbUpsert { name, patterns, conversion, embedding_model } => {
            let kb_store = open_kb_store(&root);
            let descriptor = KbDescriptor {
                name: name.clone(),
                selection: patterns.clone(),
                convertors: vec![ConvertorConfig {
                    conversion: conversion.clone(),
                    model: None,
                    seed: None,
                    temperature: None,
                }],
                embedding: EmbeddingConfig { model: embedding_model.clone(), seed: None },
                languages: vec!["eng".to_string()],
            };
            match kb_store.upsert(descriptor) {
                Ok(kb) => println!("upserted KB {:?}", kb.full_name()),
                Err(e) => {
                    eprintln!("upsert failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::KbList => {
            let kb_store = open_kb_store(&root);
            for kb in kb_store.list() {
                println!("{}", kb.full_name());
            }
        }
        Commands::IngestStart => {
            let doc_source = open_doc_source(&root);
            let kb_store = open_kb_store(&root);
            let runner = build_runner(&cli);
            let service = Arc::new(IngestionService::new(doc_source, kb_store, runner, RagSettings::default()));
            if !service.start() {
                eprintln!("ingestion already running");
                std::process::exit(1);
            }
            println!("ingestion started");
            spawn_ctrl_c_canceller({
                let service = Arc::clone(&service);
                move || service.stop()
            });
            // The worker detaches onto its own thread; block here only long
            // enough for a one-shot CLI invocation to observe completion.
            while service.is_active() {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            let status = service.status();
            println!("{}", serde_json::to_string_pretty(&status).unwrap());
        }
        Commands::IngestStop => {
            // A standalone invocation has no handle to a running worker in
            // another process; this command only makes sense against a
            // long-lived host holding the same `IngestionService`. Exposed
            // here to mirror the operation's existence in the library API.
            eprintln!("stop is only meaningful against a long-lived host process; no-op here");
        }
        Commands::IngestStatus => {
            eprintln!("status is only meaningful against a long-lived host process; no-op here");
        }
        Commands::KbStatus { name } => {
            let doc_source = open_doc_source(&root);
            let kb_store = open_kb_store(&root);
            let runner = build_runner(&cli);
            let service = IngestionService::new(doc_source, kb_store, runner, RagSettings::default());
            match service.kb_status(name) {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status).unwrap()),
                None => {
                    eprintln!("KB {name:?} not found");
                    std::process::exit(1);
                }
            }
        }
        Commands::Chat { room, model, kb, message } => {
            let runner = build_runner(&cli);
            let kb_store = open_kb_store(&root);
            let bound_kb = kb.as_ref().and_then(|name| kb_store.get(name));
            if kb.is_some() && bound_kb.is_none() {
                eprintln!("KB {:?} not found", kb.as_ref().unwrap());
                std::process::exit(1);
            }

            let rooms = RoomStateRegistry::new();
            let room_state = rooms.get_or_create(room);
            spawn_ctrl_c_canceller({
                let room_state = Arc::clone(&room_state);
                move || room_state.stop()
            });
            let orchestrator = ChatOrchestrator::new(runner, GuardConfig::from(CoreConfig::default().generation_guard));

            let result = orchestrator.run_turn(
                ChatTurnRequest {
                    llm_model: model,
                    system_prompt: "You are a helpful assistant.",
                    kb: bound_kb.as_deref(),
                    rag_settings: &RagSettings::default(),
                    room_state: &room_state,
                    user_input: message,
                    history: &[],
                    options: CompletionOptions::default().with_defaults(),
                },
                &mut |progress| {
                    if progress.status == "error" {
                        if let Some(msg) = &progress.message {
                            eprintln!("{msg}");
                        }
                    }
                },
            );

            match result {
                Ok(turn) => {
                    println!("{}", turn.assistant_text);
                    if !turn.reranked_sources.is_empty() {
                        eprintln!("\n--- sources ---\n{}", turn.reranked_sources_json);
                    }
                }
                Err(e) => {
                    eprintln!("chat turn failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
