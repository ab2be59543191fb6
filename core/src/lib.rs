//! `ragcore` — the self-hosted RAG assistant's core library: document
//! ingestion, embedding-backed knowledge bases, and chat-turn orchestration
//! over pluggable LLM backends.
//!
//! This crate carries no async runtime; every long-running operation
//! (ingestion, a streaming chat turn) runs on its own thread and is
//! cancelled cooperatively through a polled flag (see [`ingestion`] and
//! [`room`]). A host binary (the `cli` crate, or any other front end) owns
//! threads, signal handling, and scheduling.

pub mod config;
pub mod convertor;
pub mod doc_source;
pub mod document_file;
pub mod error;
pub mod guard;
pub mod hash;
pub mod ingestion;
pub mod kb;
pub mod kb_store;
pub mod orchestrator;
pub mod reranker;
pub mod room;
pub mod runner;
pub mod vector_store;

pub use config::CoreConfig;
pub use error::CoreError;
