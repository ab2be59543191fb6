//! Raw convertor: PDF -> per-page text via the PDF text extractor, Text ->
//! copy. Refuses images.
//!
//! Grounded on `original_source/backend/convertors/raw_convertor.py`.

use super::{reject_image, Convertor, ConvertorResult, DocumentContext};
use crate::document_file::DocumentFile;
use crate::error::ConvertorError;
use crate::hash::hash_folder;
use tracing::error;

pub struct RawConvertor;

impl RawConvertor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RawConvertor {
    fn default() -> Self {
        Self::new()
    }
}

impl Convertor for RawConvertor {
    fn conversion_type(&self) -> &str {
        "raw"
    }

    fn model(&self) -> Option<&str> {
        None
    }

    fn convert(
        &self,
        doc: &mut DocumentFile,
        _ctx: &DocumentContext,
    ) -> Result<Option<ConvertorResult>, ConvertorError> {
        reject_image(doc)?;
        let mut result = self.get_or_init_conversion(doc)?;
        if !result.pages.is_empty() {
            return Ok(Some(result));
        }

        match doc.raw_dump(&result.output_path) {
            Ok(pages) => {
                let folder_hash = hash_folder(&result.output_path, &[])?;
                let Some(result_hash) = folder_hash else {
                    return Ok(None);
                };
                let mut metadata = result.document_metadata.clone();
                metadata.conversions.push(crate::document_file::ConversionEntry {
                    conversion: self.conversion_type().to_string(),
                    model: None,
                    output_folder: self.output_folder_name(),
                    hash: result_hash.clone(),
                });
                doc.write_metadata(&metadata)?;
                result.pages = pages;
                result.document_metadata = metadata;
                result.result_hash = Some(result_hash);
                Ok(Some(result))
            }
            Err(e) => {
                error!(conversion = "raw", error = %e, "raw conversion failed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_file::DocumentFile;
    use chrono::Utc;
    use std::fs;

    fn make_handle(dir: &std::path::Path, ext: &str, bytes: &[u8]) -> DocumentFile {
        let file_path = dir.join(format!("doc.{ext}"));
        fs::write(&file_path, bytes).unwrap();
        DocumentFile::create(
            "src".to_string(),
            dir.to_path_buf(),
            file_path,
            None,
            Utc::now(),
            bytes.len() as u64,
        )
        .unwrap()
    }

    #[test]
    fn converts_text_document_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = make_handle(dir.path(), "txt", b"hello world");
        let convertor = RawConvertor::new();
        let ctx = DocumentContext::default();

        let first = convertor.convert(&mut doc, &ctx).unwrap().unwrap();
        assert_eq!(first.pages.len(), 1);
        assert!(first.result_hash.is_some());

        let second = convertor.convert(&mut doc, &ctx).unwrap().unwrap();
        assert_eq!(second.result_hash, first.result_hash);
    }

    #[test]
    fn refuses_image_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = make_handle(dir.path(), "png", b"\x89PNG");
        let convertor = RawConvertor::new();
        let err = convertor.convert(&mut doc, &DocumentContext::default()).unwrap_err();
        assert!(matches!(err, ConvertorError::UnsupportedDocumentType(_, _)));
    }
}
