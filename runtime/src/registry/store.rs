//! Persistence for the registry document.
//!
//! Every write replaces the whole document. [`FileRegistryStore`] does so by
//! writing a sibling temp file, syncing it and renaming it over the target,
//! so a concurrent reader (in this process or another) sees either the old
//! document or the new one, never a torn write.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use shopmesh_core::RegistryDocument;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Errors from registry persistence.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Reading or writing the backing file failed
    #[error("Registry I/O failed for {}: {source}", path.display())]
    Io {
        /// Backing file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The backing file is not a valid registry document
    #[error("Registry document {} is malformed: {source}", path.display())]
    Malformed {
        /// Backing file
        path: PathBuf,
        /// Parse error
        #[source]
        source: serde_json::Error,
    },

    /// The document could not be encoded
    #[error("Failed to encode registry document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Whole-document key/value storage for the registry.
///
/// Implementations must make [`replace`](RegistryStore::replace) atomic with
/// respect to [`load`](RegistryStore::load).
pub trait RegistryStore: Send + Sync {
    /// Read the current document. A store that has never been written is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the document cannot be read or parsed.
    fn load(&self) -> BoxFuture<'_, Result<RegistryDocument, RegistryError>>;

    /// Atomically replace the whole document.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the document cannot be written.
    fn replace(&self, document: RegistryDocument) -> BoxFuture<'_, Result<(), RegistryError>>;
}

/// JSON file shared by every process on the host.
#[derive(Debug, Clone)]
pub struct FileRegistryStore {
    path: PathBuf,
}

impl FileRegistryStore {
    /// Store backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "registry".into(), |name| name.to_string_lossy());
        let temp_name = format!(
            ".{file_name}.{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        self.path.with_file_name(temp_name)
    }

    async fn read_document(&self) -> Result<RegistryDocument, RegistryError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Ok(RegistryDocument::new());
            }
            Err(error) => return Err(self.io_error(error)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(RegistryDocument::new());
        }

        serde_json::from_slice(&bytes).map_err(|source| RegistryError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_document(&self, document: &RegistryDocument) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(document)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let temp = self.temp_path();
        let written = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, &self.path).await
        }
        .await;

        if let Err(error) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(self.io_error(error));
        }
        Ok(())
    }
}

impl RegistryStore for FileRegistryStore {
    fn load(&self) -> BoxFuture<'_, Result<RegistryDocument, RegistryError>> {
        Box::pin(self.read_document())
    }

    fn replace(&self, document: RegistryDocument) -> BoxFuture<'_, Result<(), RegistryError>> {
        Box::pin(async move { self.write_document(&document).await })
    }
}

/// Process-local store, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryRegistryStore {
    document: RwLock<RegistryDocument>,
}

impl InMemoryRegistryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for InMemoryRegistryStore {
    fn load(&self) -> BoxFuture<'_, Result<RegistryDocument, RegistryError>> {
        let document = self.document.read().clone();
        Box::pin(futures::future::ready(Ok(document)))
    }

    fn replace(&self, document: RegistryDocument) -> BoxFuture<'_, Result<(), RegistryError>> {
        *self.document.write() = document;
        Box::pin(futures::future::ready(Ok(())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shopmesh_core::ServiceRegistration;

    fn document(names: &[&str]) -> RegistryDocument {
        names
            .iter()
            .map(|name| {
                let descriptor = ServiceRegistration::new(format!("http://{name}:80"))
                    .into_descriptor(Utc::now());
                ((*name).to_string(), descriptor)
            })
            .collect()
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistryStore::new(dir.path().join("service-registry.json"));

        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service-registry.json");
        std::fs::write(&path, "  \n").unwrap();

        assert!(FileRegistryStore::new(path).load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_round_trips_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistryStore::new(dir.path().join("nested").join("registry.json"));

        store.replace(document(&["user-service", "item-service"])).await.unwrap();
        store.replace(document(&["list-service"])).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), ["list-service"]);

        let entries = std::fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{not json").unwrap();

        let error = FileRegistryStore::new(path).load().await.unwrap_err();
        assert!(matches!(error, RegistryError::Malformed { .. }));
    }

    #[tokio::test]
    async fn readers_never_observe_partial_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let writer = FileRegistryStore::new(&path);
        let reader = FileRegistryStore::new(&path);
        writer.replace(document(&["a"])).await.unwrap();

        let big: Vec<String> = (0..200).map(|i| format!("service-{i}")).collect();
        let big_refs: Vec<&str> = big.iter().map(String::as_str).collect();
        let big_doc = document(&big_refs);

        let writes = async {
            for _ in 0..20 {
                writer.replace(big_doc.clone()).await.unwrap();
                writer.replace(document(&["a"])).await.unwrap();
            }
        };
        let reads = async {
            for _ in 0..100 {
                let loaded = reader.load().await.unwrap();
                assert!(loaded.len() == 1 || loaded.len() == 200);
                tokio::task::yield_now().await;
            }
        };

        tokio::join!(writes, reads);
    }

    #[tokio::test]
    async fn in_memory_store_replaces_whole_document() {
        let store = InMemoryRegistryStore::new();
        store.replace(document(&["a", "b"])).await.unwrap();
        store.replace(document(&["c"])).await.unwrap();

        assert_eq!(store.load().await.unwrap().keys().collect::<Vec<_>>(), ["c"]);
    }
}
