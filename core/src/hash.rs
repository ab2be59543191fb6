//! Content hashing and atomic durable writes.
//!
//! Every durable file in this crate (sidecars, descriptors, caches, model
//! lists) is written through [`write_atomic`]: readers must never observe a
//! partially-written file.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// SHA-256 hex digest of a file's bytes, streamed in 8 KiB chunks.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

/// SHA-256 over a folder: sorted per-file hashes concatenated, plus any
/// extra strings (e.g. a model name), hashed once more.
///
/// Returns `None` if the folder does not exist or contains no files
/// (matching the original source's "nothing to hash yet" sentinel).
pub fn hash_folder(folder: &Path, extra_strings: &[String]) -> io::Result<Option<String>> {
    if !folder.exists() {
        return Ok(None);
    }
    let mut entries: Vec<_> = fs::read_dir(folder)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    if entries.is_empty() {
        return Ok(None);
    }
    entries.sort_by_key(|e| e.file_name());

    let mut hashes = Vec::with_capacity(entries.len());
    for entry in entries {
        hashes.push(hash_file(&entry.path())?);
    }
    hashes.extend(extra_strings.iter().cloned());

    let mut hasher = Sha256::new();
    hasher.update(hashes.concat().as_bytes());
    Ok(Some(hex(&hasher.finalize())))
}

/// SHA-256 hex digest of raw bytes (used for content-addressing document
/// handles whose bytes are already resident, and for the debug runner's
/// deterministic embeddings).
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write `contents` to `path` by first writing `<path>.tmp` then renaming
/// it into place. Never leaves a truncated file at `path`: a reader always
/// observes either the previous complete file or the new complete file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path_for(path);
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Convenience wrapper for atomically writing a serializable value as JSON.
pub fn write_atomic_json<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &body)
}

/// Reads a JSON file, treating a missing file as `None` rather than an
/// error (readers must tolerate missing durable files).
pub fn read_json_if_exists<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> io::Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    os.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hash_file_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello world").unwrap();
        let h1 = hash_file(&path).unwrap();
        let h2 = hash_file(&path).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn hash_folder_empty_or_missing_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(hash_folder(&dir.path().join("missing"), &[]).unwrap(), None);
        assert_eq!(hash_folder(dir.path(), &[]).unwrap(), None);
    }

    #[test]
    fn hash_folder_changes_with_extra_strings() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1.txt"), b"page one").unwrap();
        let without_model = hash_folder(dir.path(), &[]).unwrap().unwrap();
        let with_model = hash_folder(dir.path(), &["llama3.2-vision".to_string()])
            .unwrap()
            .unwrap();
        assert_ne!(without_model, with_model);
    }

    #[test]
    fn write_atomic_never_leaves_tmp_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sidecar.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn read_json_if_exists_treats_missing_as_none() {
        let dir = tempdir().unwrap();
        let value: Option<serde_json::Value> =
            read_json_if_exists(&dir.path().join("nope.json")).unwrap();
        assert!(value.is_none());
    }
}
