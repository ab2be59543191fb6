//! OCR convertor: rasterise -> invoke an OCR subprocess with a language set
//! derived from the owning KB's `languages`.
//!
//! Grounded on `original_source/convertors/ocr_convertor.py` (a thin
//! `DocumentImageConvertor` subclass whose `image_to_text` shells out to
//! the system OCR engine) and `document_image_convertor.py` for the
//! rasterise/write-per-page/hash/sidecar-append flow, shared here via
//! [`super::convert_image_document`].

use super::{convert_image_document, Convertor, ConvertorResult, DocumentContext};
use crate::document_file::DocumentFile;
use crate::error::ConvertorError;
use std::process::Command;

pub struct OcrConvertor;

impl OcrConvertor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OcrConvertor {
    fn default() -> Self {
        Self::new()
    }
}

impl Convertor for OcrConvertor {
    fn conversion_type(&self) -> &str {
        "ocr"
    }

    fn model(&self) -> Option<&str> {
        None
    }

    fn is_image_only(&self) -> bool {
        true
    }

    fn convert(
        &self,
        doc: &mut DocumentFile,
        ctx: &DocumentContext,
    ) -> Result<Option<ConvertorResult>, ConvertorError> {
        if !doc.image_based() {
            return Ok(None);
        }
        let result = self.get_or_init_conversion(doc)?;
        if !result.pages.is_empty() {
            return Ok(Some(result));
        }
        let lang_flag = if ctx.languages.is_empty() {
            "eng".to_string()
        } else {
            ctx.languages.join("+")
        };
        convert_image_document(
            doc,
            self.conversion_type(),
            &self.output_folder_name(),
            &[],
            &result.output_path,
            |image_path| ocr_image(image_path, &lang_flag),
        )
    }
}

fn ocr_binary() -> String {
    std::env::var("RAGCORE_OCR_BINARY").unwrap_or_else(|_| "tesseract".to_string())
}

fn ocr_image(image_path: &std::path::Path, lang_flag: &str) -> Result<String, ConvertorError> {
    let output = Command::new(ocr_binary())
        .arg(image_path)
        .arg("stdout")
        .args(["-l", lang_flag])
        .output()
        .map_err(|e| ConvertorError::SubprocessFailed {
            program: ocr_binary(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(ConvertorError::SubprocessFailed {
            program: ocr_binary(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_image_only() {
        assert!(OcrConvertor::new().is_image_only());
    }

    #[test]
    fn non_image_document_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("doc.txt");
        std::fs::write(&file_path, b"hello").unwrap();
        let mut doc = DocumentFile::create(
            "src".to_string(),
            dir.path().to_path_buf(),
            file_path,
            None,
            chrono::Utc::now(),
            5,
        )
        .unwrap();
        let convertor = OcrConvertor::new();
        let result = convertor.convert(&mut doc, &DocumentContext::default()).unwrap();
        assert!(result.is_none());
    }
}
