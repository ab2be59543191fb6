//! C3 — Convertor: transforms a document into a sequence of per-page text
//! artifacts. Four variants (raw, OCR, OCR+LLM, vision-LLM).
//!
//! Grounded on `original_source/backend/convertors/{convertor,raw_convertor,
//! document_image_convertor,llm_convertor}.py` and the root-level
//! `convertors/ocr_convertor.py`/`ocr_with_llm_convertor.py` (the backend/
//! tree never materialized its own ocr/ocr_llm modules, only referenced them
//! from the factory) for exact constants and control flow. The
//! tagged-variant-enum-plus-factory idiom follows the teacher's
//! `DependencyScanner`/`default_scanners()` registry in `scan.rs`.

mod ocr;
mod ocr_llm;
mod raw;
mod vision_llm;

pub use ocr::OcrConvertor;
pub use ocr_llm::OcrLlmConvertor;
pub use raw::RawConvertor;
pub use vision_llm::VisionLlmConvertor;

use crate::document_file::{DocumentFile, DocumentKind, DocumentMetadata};
use crate::error::ConvertorError;
use crate::hash::hash_folder;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-document conversion context: currently just the owning KB's OCR
/// language set (`DocumentContext` in the original).
#[derive(Debug, Clone, Default)]
pub struct DocumentContext {
    pub languages: Vec<String>,
}

/// One convertor config entry from a KB descriptor
/// (`{conversion, model?, seed?, temperature?}`).
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ConvertorConfig {
    pub conversion: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// The result of a conversion attempt, successful or reused from cache.
/// `result_hash` is `None` only for the transient "not yet converted"
/// sentinel `get_or_init_conversion` returns before a fresh conversion runs.
#[derive(Debug, Clone)]
pub struct ConvertorResult {
    pub pages: Vec<PathBuf>,
    pub document_metadata: DocumentMetadata,
    pub conversion_type: String,
    pub model: Option<String>,
    pub output_folder_name: String,
    pub output_path: PathBuf,
    pub result_hash: Option<String>,
    pub document_path: String,
}

/// Strips characters outside `[A-Za-z0-9 _.-]`, mirroring `utils.clean_name`
/// (used to build an output folder name from a model id).
pub fn clean_name(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-' || *c == '_' || *c == '.')
        .collect()
}

pub fn output_folder_name(conversion_type: &str, model: Option<&str>) -> String {
    match model {
        Some(m) => format!("{conversion_type}_{}", clean_name(m)),
        None => conversion_type.to_string(),
    }
}

/// Shared contract implemented by every convertor variant.
pub trait Convertor: Send + Sync {
    fn conversion_type(&self) -> &str;
    fn model(&self) -> Option<&str>;
    fn output_folder_name(&self) -> String {
        output_folder_name(self.conversion_type(), self.model())
    }

    /// `true` for variants that require a rasterisable/image-based input
    /// (the ingestion loop skips these for non-image documents).
    fn is_image_only(&self) -> bool {
        false
    }

    fn convert(
        &self,
        doc: &mut DocumentFile,
        ctx: &DocumentContext,
    ) -> Result<Option<ConvertorResult>, ConvertorError>;

    /// Checks the document's sidecar for a matching `(conversion_type,
    /// model)` entry whose stored hash equals the current folder hash; if
    /// found, returns a completed result reusing on-disk pages, otherwise
    /// an empty-pages result the caller uses to drive a fresh conversion.
    fn get_or_init_conversion(
        &self,
        doc: &DocumentFile,
    ) -> Result<ConvertorResult, ConvertorError> {
        let document_metadata = doc.get_or_init_metadata()?;
        let extra_strings: Vec<String> = self.model().map(|m| m.to_string()).into_iter().collect();
        let output_path = doc.get_output_path(&self.output_folder_name())?;
        let folder_hash = hash_folder(&output_path, &extra_strings)?;

        for entry in &document_metadata.conversions {
            if entry.conversion == self.conversion_type() && entry.model.as_deref() == self.model()
            {
                if Some(&entry.hash) == folder_hash.as_ref() {
                    return Ok(ConvertorResult {
                        pages: list_pages(&output_path)?,
                        document_metadata,
                        conversion_type: self.conversion_type().to_string(),
                        model: self.model().map(str::to_string),
                        output_folder_name: self.output_folder_name(),
                        output_path,
                        result_hash: Some(entry.hash.clone()),
                        document_path: doc.get_document_path(),
                    });
                }
            }
        }
        Ok(ConvertorResult {
            pages: Vec::new(),
            document_metadata,
            conversion_type: self.conversion_type().to_string(),
            model: self.model().map(str::to_string),
            output_folder_name: self.output_folder_name(),
            output_path,
            result_hash: None,
            document_path: doc.get_document_path(),
        })
    }
}

/// Shared image-based conversion flow used by `OcrConvertor`, `OcrLlmConvertor`
/// and `VisionLlmConvertor`: rasterise the document (a no-op for images
/// themselves, which return their own path), run `image_to_text` over each
/// page image, write one text file per page, then hash the output folder
/// and append a sidecar entry.
///
/// Grounded on `original_source/convertors/document_image_convertor.py`
/// `convert_image_document` — same per-page loop, same
/// rasterise-then-always-cleanup (`finally: document.clear_images()`) shape.
pub(crate) fn convert_image_document(
    doc: &mut DocumentFile,
    conversion_type: &str,
    output_folder_name: &str,
    extra_hash_strings: &[String],
    output_path: &PathBuf,
    mut image_to_text: impl FnMut(&std::path::Path) -> Result<String, ConvertorError>,
) -> Result<Option<ConvertorResult>, ConvertorError> {
    let images = doc.convert_document_to_images();
    let images = match images {
        Ok(images) => images,
        Err(e) => {
            doc.cleanup_temp_files();
            return Err(e.into());
        }
    };

    let run = (|| -> Result<(Vec<PathBuf>, String), ConvertorError> {
        std::fs::create_dir_all(output_path)?;
        let mut written = Vec::with_capacity(images.len());
        for image_path in &images {
            let text = image_to_text(image_path)?;
            let stem = image_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("page");
            let dest = output_path.join(format!("{stem}.txt"));
            std::fs::write(&dest, text)?;
            written.push(dest);
        }
        let folder_hash = hash_folder(output_path, extra_hash_strings)?
            .ok_or_else(|| ConvertorError::SubprocessFailed {
                program: conversion_type.to_string(),
                message: "no pages produced".to_string(),
            })?;
        Ok((written, folder_hash))
    })();
    doc.cleanup_temp_files();

    let (pages, result_hash) = match run {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let document_metadata = doc.get_or_init_metadata()?;
    let mut metadata = document_metadata;
    metadata.conversions.push(crate::document_file::ConversionEntry {
        conversion: conversion_type.to_string(),
        model: extra_hash_strings.first().cloned(),
        output_folder: output_folder_name.to_string(),
        hash: result_hash.clone(),
    });
    doc.write_metadata(&metadata)?;

    Ok(Some(ConvertorResult {
        pages,
        document_metadata: metadata,
        conversion_type: conversion_type.to_string(),
        model: extra_hash_strings.first().cloned(),
        output_folder_name: output_folder_name.to_string(),
        output_path: output_path.clone(),
        result_hash: Some(result_hash),
        document_path: doc.get_document_path(),
    }))
}

fn list_pages(output_path: &std::path::Path) -> Result<Vec<PathBuf>, ConvertorError> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(output_path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    Ok(entries)
}

/// Refuses raw-dump conversion for image documents; shared by `RawConvertor`.
pub(crate) fn reject_image(doc: &DocumentFile) -> Result<(), ConvertorError> {
    if doc.document_kind() == DocumentKind::Image {
        return Err(ConvertorError::UnsupportedDocumentType("raw", "image".to_string()));
    }
    Ok(())
}

/// `Convertor::from_config` — resolves a KB descriptor convertor entry into
/// a boxed variant. Unknown conversion tags resolve to `None`, matching the
/// original's `from_config` returning `None` for an unrecognised type.
pub fn from_config(
    config: &ConvertorConfig,
    runner: Arc<dyn crate::runner::Runner>,
) -> Option<Box<dyn Convertor>> {
    match config.conversion.as_str() {
        "raw" => Some(Box::new(RawConvertor::new())),
        "ocr" => Some(Box::new(OcrConvertor::new())),
        "ocr_llm" => config
            .model
            .clone()
            .map(|model| Box::new(OcrLlmConvertor::new(runner, model)) as Box<dyn Convertor>),
        "llm" => config
            .model
            .clone()
            .map(|model| Box::new(VisionLlmConvertor::new(runner, model)) as Box<dyn Convertor>),
        _ => None,
    }
}
