//! C2 — typed per-file document handles.
//!
//! Grounded on `original_source/backend/convertors/document_file.py`: exact
//! per-kind behavior (zero-padding width, raw-dump rules, processed-path
//! naming). One deliberate deviation from the original: rasterised scratch
//! images are written to a handle-private temp directory rather than a
//! shared global scratch dir, removing a concurrency hazard the original
//! carries (two documents converted concurrently would otherwise clobber
//! each other's temp images) without changing any externally observable
//! behavior the spec describes.

use crate::error::DocumentFileError;
use crate::hash::{hash_file, write_atomic_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The coarse kind reported in sidecar metadata and consulted by
/// convertors that refuse non-document input (`RawConvertor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Document,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVariant {
    Pdf,
    Text,
    Image,
}

impl FileVariant {
    /// Dispatches on a lowercased file extension, mirroring
    /// `DocumentFile.create()`'s factory.
    pub fn from_extension(ext: &str) -> Result<Self, DocumentFileError> {
        match ext.to_lowercase().as_str() {
            "pdf" => Ok(FileVariant::Pdf),
            "txt" | "md" => Ok(FileVariant::Text),
            "png" | "jpg" | "jpeg" => Ok(FileVariant::Image),
            other => Err(DocumentFileError::UnsupportedExtension(other.to_string())),
        }
    }

    pub fn kind(&self) -> DocumentKind {
        match self {
            FileVariant::Pdf | FileVariant::Text => DocumentKind::Document,
            FileVariant::Image => DocumentKind::Image,
        }
    }

    pub fn image_based(&self) -> bool {
        matches!(self, FileVariant::Pdf | FileVariant::Image)
    }
}

/// One entry in a sidecar's `conversions` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEntry {
    pub conversion: String,
    pub model: Option<String>,
    pub output_folder: String,
    pub hash: String,
}

/// The `metadata.json` sidecar shape (§3 Conversion artifact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    pub filename: String,
    pub file_location: String,
    pub hash: String,
    pub conversions: Vec<ConversionEntry>,
}

/// An immutable-per-discovery handle to one file under a Document Source.
pub struct DocumentFile {
    pub doc_source_name: String,
    pub doc_source_root: PathBuf,
    pub file_path: PathBuf,
    pub variant: FileVariant,
    pub last_modified: DateTime<Utc>,
    pub file_size: u64,
    /// Set by the Document Source when mtime/size did not match its cache,
    /// signalling downstream layers to skip the KB-check fast path.
    pub has_changed: bool,
    precalculated_hash: Option<String>,
    computed_hash: std::cell::OnceCell<String>,
    temp_dir: Option<PathBuf>,
}

impl DocumentFile {
    pub fn create(
        doc_source_name: String,
        doc_source_root: PathBuf,
        file_path: PathBuf,
        precalc_file_hash: Option<String>,
        last_modified: DateTime<Utc>,
        file_size: u64,
    ) -> Result<Self, DocumentFileError> {
        let ext = file_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let variant = FileVariant::from_extension(ext)?;
        Ok(Self {
            doc_source_name,
            doc_source_root,
            file_path,
            variant,
            last_modified,
            file_size,
            has_changed: false,
            precalculated_hash: precalc_file_hash,
            computed_hash: std::cell::OnceCell::new(),
            temp_dir: None,
        })
    }

    pub fn document_kind(&self) -> DocumentKind {
        self.variant.kind()
    }

    pub fn image_based(&self) -> bool {
        self.variant.image_based()
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// SHA-256 of the file's bytes, computed once and cached. Uses a
    /// precomputed value from the Document Source's hash cache when given.
    pub fn file_hash(&self) -> Result<&str, DocumentFileError> {
        if let Some(h) = &self.precalculated_hash {
            return Ok(h.as_str());
        }
        if let Some(h) = self.computed_hash.get() {
            return Ok(h.as_str());
        }
        let h = hash_file(&self.file_path)?;
        let _ = self.computed_hash.set(h);
        Ok(self.computed_hash.get().unwrap().as_str())
    }

    /// `<source>/<relpath>` using forward slashes, regardless of platform.
    pub fn get_document_path(&self) -> String {
        let rel = self
            .file_path
            .strip_prefix(&self.doc_source_root)
            .unwrap_or(&self.file_path);
        let rel_posix = rel.to_string_lossy().replace('\\', "/");
        format!("{}/{}", self.doc_source_name, rel_posix)
    }

    /// `processed/<relpath>/<filename>_<hash>` — content-addressed so two
    /// files with identical bytes at different paths still get distinct
    /// conversion artifacts (only KB-level vector records get merged).
    pub fn processed_path(&self) -> Result<PathBuf, DocumentFileError> {
        let rel = self
            .file_path
            .strip_prefix(&self.doc_source_root)
            .unwrap_or(&self.file_path);
        let parent = rel.parent().unwrap_or(Path::new(""));
        let hash = self.file_hash()?;
        let dirname = format!("{}_{}", self.file_name(), hash);
        Ok(PathBuf::from("processed").join(parent).join(dirname))
    }

    pub fn get_output_path(&self, output_folder_name: &str) -> Result<PathBuf, DocumentFileError> {
        Ok(self.processed_path()?.join(output_folder_name))
    }

    /// Idempotent sidecar read-or-create.
    pub fn get_or_init_metadata(&self) -> Result<DocumentMetadata, DocumentFileError> {
        let sidecar = self.processed_path()?.join("metadata.json");
        if sidecar.exists() {
            let bytes = fs::read(&sidecar)?;
            return serde_json::from_slice(&bytes)
                .map_err(|_| DocumentFileError::MalformedSidecar(sidecar.clone()));
        }
        let metadata = DocumentMetadata {
            kind: self.document_kind(),
            filename: self.file_name(),
            file_location: self.get_document_path(),
            hash: self.file_hash()?.to_string(),
            conversions: Vec::new(),
        };
        self.write_metadata(&metadata)?;
        Ok(metadata)
    }

    pub fn write_metadata(&self, metadata: &DocumentMetadata) -> Result<(), DocumentFileError> {
        let sidecar = self.processed_path()?.join("metadata.json");
        write_atomic_json(&sidecar, metadata)?;
        Ok(())
    }

    /// Extracts raw per-page text. PDF writes one zero-padded file per
    /// page (width scales with page count); Text copies the whole file
    /// into `raw/1.txt`; Image is unsupported.
    pub fn raw_dump(&self, output_path: &Path) -> Result<Vec<PathBuf>, DocumentFileError> {
        fs::create_dir_all(output_path)?;
        match self.variant {
            FileVariant::Text => {
                let dest = output_path.join("1.txt");
                fs::copy(&self.file_path, &dest)?;
                Ok(vec![dest])
            }
            FileVariant::Pdf => {
                let pages = extract_pdf_text_pages(&self.file_path)?;
                let width = pad_width(pages.len());
                let mut written = Vec::with_capacity(pages.len());
                for (i, text) in pages.iter().enumerate() {
                    let dest = output_path.join(format!("{:0width$}.txt", i + 1, width = width));
                    fs::write(&dest, text)?;
                    written.push(dest);
                }
                Ok(written)
            }
            FileVariant::Image => Err(DocumentFileError::RawDumpUnsupportedForImage),
        }
    }

    /// Produces per-page rasterised images in a handle-private scratch
    /// directory (cleaned up by [`Self::cleanup_temp_files`]).
    pub fn convert_document_to_images(&mut self) -> Result<Vec<PathBuf>, DocumentFileError> {
        match self.variant {
            FileVariant::Image => Ok(vec![self.file_path.clone()]),
            FileVariant::Pdf => {
                let dir = std::env::temp_dir().join(format!(
                    "ragcore-rasterise-{}",
                    uuid::Uuid::new_v4()
                ));
                fs::create_dir_all(&dir)?;
                let images = rasterise_pdf(&self.file_path, &dir, 300)?;
                self.temp_dir = Some(dir);
                Ok(images)
            }
            FileVariant::Text => Ok(Vec::new()),
        }
    }

    pub fn cleanup_temp_files(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

impl Drop for DocumentFile {
    fn drop(&mut self) {
        self.cleanup_temp_files();
    }
}

fn pad_width(page_count: usize) -> usize {
    page_count.to_string().len().max(1)
}

/// Invokes an external PDF text extractor. The binary contract mirrors the
/// OCR/rasteriser subprocess contract assumed by §1: one argument (the PDF
/// path), newline-delimited pages on stdout separated by a form-feed.
fn extract_pdf_text_pages(path: &Path) -> Result<Vec<String>, DocumentFileError> {
    let output = Command::new(pdf_text_binary())
        .arg(path)
        .arg("-")
        .output()
        .map_err(|e| DocumentFileError::RasterisationFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(DocumentFileError::RasterisationFailed {
            path: path.to_path_buf(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .split('\u{0C}')
        .map(|page| page.to_string())
        .collect())
}

fn rasterise_pdf(
    path: &Path,
    out_dir: &Path,
    dpi: u32,
) -> Result<Vec<PathBuf>, DocumentFileError> {
    let prefix = out_dir.join("page");
    let status = Command::new(rasteriser_binary())
        .args(["-png", "-r", &dpi.to_string()])
        .arg(path)
        .arg(&prefix)
        .status()
        .map_err(|e| DocumentFileError::RasterisationFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    if !status.success() {
        return Err(DocumentFileError::RasterisationFailed {
            path: path.to_path_buf(),
            message: format!("rasteriser exited with {status}"),
        });
    }
    let mut images: Vec<PathBuf> = fs::read_dir(out_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("png"))
        .collect();
    images.sort();
    Ok(images)
}

fn rasteriser_binary() -> String {
    std::env::var("RAGCORE_PDF_RASTERISER").unwrap_or_else(|_| "pdftoppm".to_string())
}

fn pdf_text_binary() -> String {
    std::env::var("RAGCORE_PDF_TEXT_EXTRACTOR").unwrap_or_else(|_| "pdftotext".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_dispatch_matches_kind_and_image_based() {
        assert_eq!(FileVariant::from_extension("PDF").unwrap(), FileVariant::Pdf);
        assert_eq!(FileVariant::from_extension("md").unwrap(), FileVariant::Text);
        assert_eq!(
            FileVariant::from_extension("jpeg").unwrap(),
            FileVariant::Image
        );
        assert!(FileVariant::from_extension("exe").is_err());

        assert_eq!(FileVariant::Pdf.kind(), DocumentKind::Document);
        assert!(FileVariant::Pdf.image_based());
        assert_eq!(FileVariant::Text.kind(), DocumentKind::Document);
        assert!(!FileVariant::Text.image_based());
        assert_eq!(FileVariant::Image.kind(), DocumentKind::Image);
        assert!(FileVariant::Image.image_based());
    }

    #[test]
    fn pad_width_scales_with_page_count() {
        assert_eq!(pad_width(9), 1);
        assert_eq!(pad_width(10), 2);
        assert_eq!(pad_width(999), 3);
        assert_eq!(pad_width(1000), 4);
    }

    fn make_handle(dir: &Path, variant_ext: &str, bytes: &[u8]) -> DocumentFile {
        let root = dir.to_path_buf();
        let file_path = dir.join(format!("doc.{variant_ext}"));
        fs::write(&file_path, bytes).unwrap();
        DocumentFile::create(
            "src".to_string(),
            root,
            file_path,
            None,
            Utc::now(),
            bytes.len() as u64,
        )
        .unwrap()
    }

    #[test]
    fn get_document_path_prefixes_source_name() {
        let dir = tempfile::tempdir().unwrap();
        let handle = make_handle(dir.path(), "txt", b"hello");
        assert_eq!(handle.get_document_path(), "src/doc.txt");
    }

    #[test]
    fn image_raw_dump_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let handle = make_handle(dir.path(), "png", b"\x89PNG");
        let out = dir.path().join("out");
        let err = handle.raw_dump(&out).unwrap_err();
        assert!(matches!(err, DocumentFileError::RawDumpUnsupportedForImage));
    }

    #[test]
    fn text_raw_dump_writes_single_page() {
        let dir = tempfile::tempdir().unwrap();
        let handle = make_handle(dir.path(), "txt", b"hello world");
        let out = dir.path().join("out");
        let written = handle.raw_dump(&out).unwrap();
        assert_eq!(written, vec![out.join("1.txt")]);
        assert_eq!(fs::read_to_string(&written[0]).unwrap(), "hello world");
    }

    #[test]
    fn image_convert_to_images_returns_self_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = make_handle(dir.path(), "jpg", b"\xFF\xD8");
        let images = handle.convert_document_to_images().unwrap();
        assert_eq!(images, vec![handle.file_path.clone()]);
    }

    #[test]
    fn sidecar_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handle = make_handle(dir.path(), "txt", b"hello");
        let first = handle.get_or_init_metadata().unwrap();
        let second = handle.get_or_init_metadata().unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.filename, "doc.txt");
    }
}
