//! Filesystem-backed document and file store.
//!
//! Layout under the root directory:
//! - `records/<model>.json`: every record of a model, in creation order
//! - `files/index.json`: directory and file descriptors
//! - `blobs/<sha256>`: file contents, hash-addressed and written atomically

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ksync_core::{Entry, FileDescriptor, FileKind, StoredRecord};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{CreateFileOptions, FileContent, FileSelector, StorageClient, StorageError};

pub const ROOT_DIR_ID: &str = "io.cozy.files.root-dir";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedFile {
    descriptor: FileDescriptor,
    blob: Option<String>,
}

#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn read_file(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        let index = self.read_index().await?;
        let blob = index
            .iter()
            .find(|row| row.descriptor.id == id)
            .and_then(|row| row.blob.clone())
            .ok_or_else(|| StorageError::NotFound {
                what: format!("file {id}"),
            })?;
        Ok(fs::read(self.root.join("blobs").join(blob)).await?)
    }

    pub async fn list_files(&self) -> Result<Vec<FileDescriptor>, StorageError> {
        Ok(self
            .read_index()
            .await?
            .into_iter()
            .map(|row| row.descriptor)
            .filter(|d| d.kind == FileKind::File)
            .collect())
    }

    fn records_path(&self, model: &str) -> PathBuf {
        let file_name: String = model
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join("records").join(format!("{file_name}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("files").join("index.json")
    }

    async fn read_records(&self, model: &str) -> Result<Vec<StoredRecord>, StorageError> {
        read_json_or_default(&self.records_path(model)).await
    }

    async fn write_records(&self, model: &str, records: &[StoredRecord]) -> Result<(), StorageError> {
        write_atomically(&self.records_path(model), &serde_json::to_vec_pretty(records)?).await
    }

    async fn read_index(&self) -> Result<Vec<IndexedFile>, StorageError> {
        read_json_or_default(&self.index_path()).await
    }

    async fn write_index(&self, index: &[IndexedFile]) -> Result<(), StorageError> {
        write_atomically(&self.index_path(), &serde_json::to_vec_pretty(index)?).await
    }

    async fn store_blob(&self, bytes: &[u8]) -> Result<String, StorageError> {
        let hash = Self::sha256_hex(bytes);
        let path = self.root.join("blobs").join(&hash);
        if fs::try_exists(&path).await? {
            debug!(%hash, "blob already stored");
            return Ok(hash);
        }
        write_atomically(&path, bytes).await?;
        Ok(hash)
    }
}

fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

fn root_descriptor() -> FileDescriptor {
    FileDescriptor {
        id: ROOT_DIR_ID.to_string(),
        kind: FileKind::Directory,
        name: String::new(),
        path: "/".to_string(),
        dir_id: None,
        trashed: false,
        size: 0,
        content_type: None,
        metadata: None,
    }
}

fn next_rev(rev: &str) -> String {
    let generation = rev
        .split_once('-')
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, Uuid::new_v4().simple())
}

async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

/// Writes through a temp file in the same directory, then renames into place.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err.into());
    }
    Ok(())
}

#[async_trait]
impl StorageClient for LocalStore {
    async fn list_all(&self, model: &str) -> Result<Vec<StoredRecord>, StorageError> {
        let _guard = self.lock.lock().await;
        self.read_records(model).await
    }

    async fn create(&self, model: &str, entry: &Entry) -> Result<StoredRecord, StorageError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records(model).await?;
        let record = StoredRecord {
            id: Uuid::new_v4().simple().to_string(),
            rev: next_rev(""),
            fields: entry.clone(),
        };
        records.push(record.clone());
        self.write_records(model, &records).await?;
        Ok(record)
    }

    async fn update_attributes(
        &self,
        model: &str,
        id: &str,
        changes: &Entry,
    ) -> Result<StoredRecord, StorageError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records(model).await?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::NotFound {
                what: format!("{model} record {id}"),
            })?;
        record.fields.merge(changes);
        record.rev = next_rev(&record.rev);
        let updated = record.clone();
        self.write_records(model, &records).await?;
        Ok(updated)
    }

    async fn stat_by_path(&self, path: &str) -> Result<Option<FileDescriptor>, StorageError> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Some(root_descriptor()));
        }
        let _guard = self.lock.lock().await;
        Ok(self
            .read_index()
            .await?
            .into_iter()
            .map(|row| row.descriptor)
            .find(|d| !d.trashed && d.path == path))
    }

    async fn query_files_by_metadata(
        &self,
        selector: &FileSelector,
    ) -> Result<Vec<FileDescriptor>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_index()
            .await?
            .into_iter()
            .map(|row| row.descriptor)
            .filter(|d| d.kind == FileKind::File && selector.matches(d))
            .collect())
    }

    async fn create_directory(&self, path: &str) -> Result<FileDescriptor, StorageError> {
        let path = normalize_path(path);
        let _guard = self.lock.lock().await;
        let mut index = self.read_index().await?;
        let mut parent = root_descriptor();
        let mut changed = false;

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let current_path = if parent.path == "/" {
                format!("/{segment}")
            } else {
                format!("{}/{segment}", parent.path)
            };
            let existing = index
                .iter()
                .map(|row| &row.descriptor)
                .find(|d| !d.trashed && d.path == current_path)
                .cloned();
            parent = match existing {
                Some(d) if d.kind == FileKind::Directory => d,
                Some(_) => return Err(StorageError::AlreadyExists { path: current_path }),
                None => {
                    let dir = FileDescriptor {
                        id: Uuid::new_v4().simple().to_string(),
                        kind: FileKind::Directory,
                        name: segment.to_string(),
                        path: current_path,
                        dir_id: Some(parent.id.clone()),
                        trashed: false,
                        size: 0,
                        content_type: None,
                        metadata: None,
                    };
                    index.push(IndexedFile {
                        descriptor: dir.clone(),
                        blob: None,
                    });
                    changed = true;
                    dir
                }
            };
        }

        if changed {
            self.write_index(&index).await?;
        }
        Ok(parent)
    }

    async fn create_file(
        &self,
        content: FileContent,
        options: &CreateFileOptions,
    ) -> Result<FileDescriptor, StorageError> {
        let _guard = self.lock.lock().await;
        let mut index = self.read_index().await?;
        let dir = if options.dir_id == ROOT_DIR_ID {
            root_descriptor()
        } else {
            index
                .iter()
                .map(|row| &row.descriptor)
                .find(|d| d.id == options.dir_id && d.kind == FileKind::Directory && !d.trashed)
                .cloned()
                .ok_or_else(|| StorageError::NotFound {
                    what: format!("directory {}", options.dir_id),
                })?
        };
        let path = if dir.path == "/" {
            format!("/{}", options.name)
        } else {
            format!("{}/{}", dir.path, options.name)
        };
        if index.iter().any(|row| !row.descriptor.trashed && row.descriptor.path == path) {
            return Err(StorageError::AlreadyExists { path });
        }

        let blob = self.store_blob(&content.bytes).await?;
        let descriptor = FileDescriptor {
            id: Uuid::new_v4().simple().to_string(),
            kind: FileKind::File,
            name: options.name.clone(),
            path,
            dir_id: Some(dir.id),
            trashed: false,
            size: content.bytes.len() as u64,
            content_type: options.content_type.clone().or(content.content_type),
            metadata: options.metadata.clone(),
        };
        index.push(IndexedFile {
            descriptor: descriptor.clone(),
            blob: Some(blob),
        });
        self.write_index(&index).await?;
        Ok(descriptor)
    }

    async fn trash_file(&self, id: &str) -> Result<FileDescriptor, StorageError> {
        let _guard = self.lock.lock().await;
        let mut index = self.read_index().await?;
        let row = index
            .iter_mut()
            .find(|row| row.descriptor.id == id)
            .ok_or_else(|| StorageError::NotFound {
                what: format!("file {id}"),
            })?;
        row.descriptor.trashed = true;
        let descriptor = row.descriptor.clone();
        self.write_index(&index).await?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksync_core::FileMetadata;
    use tempfile::tempdir;

    fn pdf(bytes: &[u8]) -> FileContent {
        FileContent::new(bytes.to_vec(), Some("application/pdf".into()))
    }

    #[test]
    fn blob_hashing_is_stable() {
        let hash = LocalStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn records_are_created_listed_and_updated() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());

        let created = store
            .create("bills", &Entry::new().with("vendor", "acme").with("amount", 10))
            .await
            .expect("create");
        assert!(created.rev.starts_with("1-"));

        let updated = store
            .update_attributes("bills", &created.id, &Entry::new().with("amount", 12))
            .await
            .expect("update");
        assert!(updated.rev.starts_with("2-"));
        assert_eq!(updated.fields.vendor(), Some("acme"));

        let all = store.list_all("bills").await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].fields.get("amount"), Some(&ksync_core::FieldValue::Int(12)));
        assert!(store.list_all("other").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_record_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());
        let err = store
            .update_attributes("bills", "nope", &Entry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn create_directory_is_idempotent_and_creates_parents() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());

        let first = store.create_directory("/Administrative/Acme").await.expect("mkdir");
        let second = store.create_directory("Administrative/Acme/").await.expect("mkdir again");
        assert_eq!(first.id, second.id);
        assert_eq!(first.path, "/Administrative/Acme");

        let parent = store.stat_by_path("/Administrative").await.expect("stat").expect("parent");
        assert_eq!(first.dir_id.as_deref(), Some(parent.id.as_str()));
    }

    #[tokio::test]
    async fn files_are_found_by_path_and_metadata() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());
        let folder = store.create_directory("/bills").await.expect("mkdir");
        let metadata = FileMetadata {
            file_id_attributes: Some("F-1".into()),
            source_account_identifier: Some("alice".into()),
            created_by_app: Some("acme".into()),
        };

        let file = store
            .create_file(
                pdf(b"%PDF-1.4"),
                &CreateFileOptions {
                    name: "a.pdf".into(),
                    dir_id: folder.id.clone(),
                    content_type: None,
                    metadata: Some(metadata),
                },
            )
            .await
            .expect("create file");
        assert_eq!(file.path, "/bills/a.pdf");
        assert_eq!(file.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(store.read_file(&file.id).await.expect("read"), b"%PDF-1.4");

        let by_path = store.stat_by_path("/bills/a.pdf").await.expect("stat");
        assert_eq!(by_path.map(|d| d.id), Some(file.id.clone()));

        let selector = FileSelector {
            file_id_attributes: "F-1".into(),
            source_account_identifier: "alice".into(),
            created_by_app: "acme".into(),
            trashed: false,
        };
        assert_eq!(store.query_files_by_metadata(&selector).await.expect("query").len(), 1);

        store.trash_file(&file.id).await.expect("trash");
        assert!(store.stat_by_path("/bills/a.pdf").await.expect("stat").is_none());
        assert!(store.query_files_by_metadata(&selector).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn duplicate_paths_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());
        let folder = store.create_directory("/bills").await.expect("mkdir");
        let options = CreateFileOptions {
            name: "a.pdf".into(),
            dir_id: folder.id,
            content_type: None,
            metadata: None,
        };
        store.create_file(pdf(b"one"), &options).await.expect("first");
        let err = store.create_file(pdf(b"two"), &options).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn files_in_unknown_directories_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());
        let err = store
            .create_file(
                pdf(b"x"),
                &CreateFileOptions {
                    name: "a.pdf".into(),
                    dir_id: "missing".into(),
                    content_type: None,
                    metadata: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }
}
