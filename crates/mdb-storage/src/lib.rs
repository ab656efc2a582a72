//! Whole-file JSON persistence for canonical collections.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mdb-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("incoming batch {} is unavailable", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("incoming batch {} could not be parsed", path.display())]
    UnreadableSource {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} does not contain a JSON array", path.display())]
    NotAnArray { path: PathBuf },
    #[error("{} is locked by another writer", path.display())]
    Locked { path: PathBuf },
    #[error("i/o error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
    pub unchanged: bool,
}

/// Serialize a collection the way the data files are kept: two-space indent,
/// non-ASCII text written literally.
pub fn to_pretty_bytes(values: &[Value]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec_pretty(values)
}

fn into_array(value: Value, path: &Path) -> Result<Vec<Value>, StorageError> {
    match value {
        Value::Array(values) => Ok(values),
        _ => Err(StorageError::NotAnArray {
            path: path.to_path_buf(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct CollectionStore {
    root: PathBuf,
}

impl CollectionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths resolve against the store root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Load a canonical collection. A missing file is an empty collection.
    pub fn load_collection(&self, path: impl AsRef<Path>) -> anyhow::Result<Vec<Value>> {
        let path = self.resolve(path);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "canonical collection missing; starting empty");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let value: Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(into_array(value, &path)?)
    }

    /// Load an incoming batch. Unlike canonical collections there is no
    /// bootstrap case: a batch that cannot be read aborts the run.
    pub fn load_incoming(&self, path: impl AsRef<Path>) -> Result<Vec<Value>, StorageError> {
        let path = self.resolve(path);
        let text = fs::read_to_string(&path).map_err(|source| StorageError::SourceUnavailable {
            path: path.clone(),
            source,
        })?;
        let value: Value =
            serde_json::from_str(&text).map_err(|source| StorageError::UnreadableSource {
                path: path.clone(),
                source,
            })?;
        into_array(value, &path)
    }

    /// Rewrite a collection in full using a temp file and an atomic rename.
    /// Skips the write when the file already holds the same bytes.
    pub fn save_collection(
        &self,
        path: impl AsRef<Path>,
        values: &[Value],
    ) -> anyhow::Result<SaveOutcome> {
        let absolute_path = self.resolve(path);
        let span = info_span!("save_collection", path = %absolute_path.display());
        let _guard = span.enter();

        let bytes = to_pretty_bytes(values)
            .with_context(|| format!("serializing {}", absolute_path.display()))?;
        let sha256 = Self::sha256_hex(&bytes);

        if let Ok(existing) = fs::read(&absolute_path) {
            if Self::sha256_hex(&existing) == sha256 {
                info!(records = values.len(), "collection unchanged; skipping write");
                return Ok(SaveOutcome {
                    path: absolute_path,
                    sha256,
                    bytes: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let parent = match absolute_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("creating collection directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = write_new_file(&temp_path, &bytes);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err)
                .with_context(|| format!("writing temp collection file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp collection {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        info!(records = values.len(), bytes = bytes.len(), "collection written");
        Ok(SaveOutcome {
            path: absolute_path,
            sha256,
            bytes: bytes.len(),
            unchanged: false,
        })
    }

    pub fn lock(&self, path: impl AsRef<Path>) -> Result<WriterLock, StorageError> {
        WriterLock::acquire(self.resolve(path))
    }
}

fn write_new_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

/// Advisory single-writer lock held as `<file>.lock` next to the target.
/// Released on drop.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    pub fn lock_path_for(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("collection"));
        name.push(".lock");
        target.with_file_name(name)
    }

    pub fn acquire(target: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = Self::lock_path_for(target.as_ref());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(
                    file,
                    "pid={} acquired_at={}",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                );
                Ok(Self { path })
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::Locked { path })
            }
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            CollectionStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn missing_canonical_collection_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        let values = store
            .load_collection("monster_data.json")
            .expect("bootstrap load");
        assert!(values.is_empty());
    }

    #[test]
    fn missing_incoming_batch_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        let err = store.load_incoming("parsed.json").expect_err("missing batch");
        assert!(matches!(err, StorageError::SourceUnavailable { .. }));
    }

    #[test]
    fn garbled_incoming_batch_is_fatal() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("parsed.json"), "[{\"id\": ").expect("write");
        let store = CollectionStore::new(dir.path());
        let err = store.load_incoming("parsed.json").expect_err("garbled batch");
        assert!(matches!(err, StorageError::UnreadableSource { .. }));
    }

    #[test]
    fn non_array_collection_is_rejected() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("items.json"), "{\"id\": \"1\"}").expect("write");
        let store = CollectionStore::new(dir.path());
        assert!(store.load_collection("items.json").is_err());
        assert!(matches!(
            store.load_incoming("items.json"),
            Err(StorageError::NotAnArray { .. })
        ));
    }

    #[test]
    fn save_writes_pretty_utf8_and_skips_identical_rewrites() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        let values = vec![json!({"id": "100100", "name": "달팽이"})];

        let first = store
            .save_collection("data/monster_data.json", &values)
            .expect("first save");
        let second = store
            .save_collection("data/monster_data.json", &values)
            .expect("second save");

        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.sha256, second.sha256);

        let text = std::fs::read_to_string(&first.path).expect("read back");
        assert_eq!(
            text,
            "[\n  {\n    \"id\": \"100100\",\n    \"name\": \"달팽이\"\n  }\n]"
        );

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("data"))
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["monster_data.json".to_string()]);
    }

    #[test]
    fn saved_collection_loads_back_in_the_same_order() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());
        let values = vec![json!({"id": "3", "name": "Mushroom", "level": 5, "hp": 10})];
        store.save_collection("m.json", &values).expect("save");
        let loaded = store.load_collection("m.json").expect("load");
        assert_eq!(loaded, values);
        let keys: Vec<_> = loaded[0]
            .as_object()
            .expect("object")
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, vec!["id", "name", "level", "hp"]);
    }

    #[test]
    fn writer_lock_is_exclusive_until_dropped() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path());

        let held = store.lock("monster_data.json").expect("first lock");
        assert!(held.path().ends_with("monster_data.json.lock"));
        assert!(matches!(
            store.lock("monster_data.json"),
            Err(StorageError::Locked { .. })
        ));

        drop(held);
        assert!(!dir.path().join("monster_data.json.lock").exists());
        store.lock("monster_data.json").expect("lock after release");
    }
}
