//! Error taxonomy for every fallible surface in this crate.
//!
//! Each component gets its own enum so callers can match on the failure
//! family that matters to them; [`CoreError`] composes all of them for
//! code paths that cross component boundaries (e.g. the ingestion loop,
//! which touches doc sources, convertors, and the KB in the same call).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DocSourceError {
    #[error("doc source name {0:?} contains a forbidden character (one of / \\ * ? [ ])")]
    InvalidName(String),
    #[error("io error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path {0:?} does not belong to this source")]
    NotOwned(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentFileError {
    #[error("unsupported file extension: {0:?}")]
    UnsupportedExtension(String),
    #[error("raw text dump is not supported for image files")]
    RawDumpUnsupportedForImage,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to rasterise {path:?}: {message}")]
    RasterisationFailed { path: PathBuf, message: String },
    #[error("metadata sidecar at {0:?} is not valid JSON")]
    MalformedSidecar(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertorError {
    #[error("convertor {0:?} refuses documents of type {1:?}")]
    UnsupportedDocumentType(&'static str, String),
    #[error("subprocess {program:?} failed: {message}")]
    SubprocessFailed { program: String, message: String },
    #[error(transparent)]
    DocumentFile(#[from] DocumentFileError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no backend has model {0:?} installed")]
    ModelNotFound(String),
    #[error("backend {0:?} does not support this operation")]
    Unsupported(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned an empty response")]
    EmptyResponse,
    #[error("backend returned malformed output: {0}")]
    InvalidOutput(String),
}

#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("unknown KB {0:?}")]
    NotFound(String),
    #[error("KB descriptor is invalid: {0}")]
    InvalidDescriptor(String),
    #[error("conversion artifact hash mismatch for {0:?}: artifact must be re-produced")]
    ArtifactCorrupt(String),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("ingestion run was cancelled")]
    Cancelled,
    #[error(transparent)]
    DocSource(#[from] DocSourceError),
    #[error(transparent)]
    Convertor(#[from] ConvertorError),
    #[error(transparent)]
    Kb(#[from] KbError),
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("KB {0:?} is not known to this orchestrator")]
    UnknownKb(String),
    #[error("embedding model for KB {0:?} is not available on any configured runner")]
    EmbeddingModelUnavailable(String),
    #[error(transparent)]
    Kb(#[from] KbError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    DocSource(#[from] DocSourceError),
    #[error(transparent)]
    DocumentFile(#[from] DocumentFileError),
    #[error(transparent)]
    Convertor(#[from] ConvertorError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Kb(#[from] KbError),
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    #[error(transparent)]
    Chat(#[from] ChatError),
}
