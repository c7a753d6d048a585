use std::sync::Arc;

use ksync_core::{entry_file_name, CompositeKey, Entry, EntryError, FileDescriptor, FileNamingRule};
use ksync_storage::{FileSelector, StorageClient, StorageError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DestinationScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Metadata,
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingFile {
    pub descriptor: FileDescriptor,
    pub matched_by: MatchTier,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error("file lookup failed: {0}")]
    Storage(#[from] StorageError),
}

/// Metadata query for the entry's file, or `None` when the scope cannot
/// fingerprint files.
pub fn fingerprint_selector(
    entry: &Entry,
    scope: &DestinationScope,
) -> Result<Option<FileSelector>, EntryError> {
    if !scope.fingerprint_ready() {
        return Ok(None);
    }
    let (Some(app), Some(account)) = (&scope.created_by_app, &scope.source_account_identifier) else {
        return Ok(None);
    };
    let key = CompositeKey::fingerprint(entry, &scope.file_id_attributes)?;
    Ok(Some(FileSelector {
        file_id_attributes: key.into_string(),
        source_account_identifier: account.clone(),
        created_by_app: app.clone(),
        trashed: false,
    }))
}

/// Full destination path of the entry's file inside `folder`.
pub fn file_path(folder: &str, entry: &Entry, naming: Option<&FileNamingRule>) -> Result<String, EntryError> {
    let name = entry_file_name(entry, naming)?;
    Ok(format!("{}/{}", folder.trim_end_matches('/'), name))
}

/// Two-tier lookup: metadata fingerprint first, then the deterministic path.
pub struct FileExistenceResolver {
    storage: Arc<dyn StorageClient>,
    naming: Option<FileNamingRule>,
    scope: DestinationScope,
}

impl FileExistenceResolver {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        naming: Option<FileNamingRule>,
        scope: DestinationScope,
    ) -> Self {
        Self {
            storage,
            naming,
            scope,
        }
    }

    pub fn naming(&self) -> Option<&FileNamingRule> {
        self.naming.as_ref()
    }

    pub fn scope(&self) -> &DestinationScope {
        &self.scope
    }

    pub async fn resolve(&self, entry: &Entry, folder: &str) -> Result<Option<ExistingFile>, ResolveError> {
        if let Some(selector) = fingerprint_selector(entry, &self.scope)? {
            let found = match self.storage.query_files_by_metadata(&selector).await {
                Ok(files) => files,
                Err(StorageError::NotFound { .. }) => Vec::new(),
                Err(err) => return Err(err.into()),
            };
            if found.len() > 1 {
                warn!(
                    fingerprint = %selector.file_id_attributes,
                    matches = found.len(),
                    "several files share a fingerprint, using the first"
                );
            }
            if let Some(descriptor) = found.into_iter().next() {
                debug!(file_id = %descriptor.id, "file matched by metadata");
                return Ok(Some(ExistingFile {
                    descriptor,
                    matched_by: MatchTier::Metadata,
                }));
            }
        }

        let path = file_path(folder, entry, self.naming.as_ref())?;
        match self.storage.stat_by_path(&path).await {
            Ok(Some(descriptor)) => {
                debug!(file_id = %descriptor.id, %path, "file matched by path");
                Ok(Some(ExistingFile {
                    descriptor,
                    matched_by: MatchTier::Path,
                }))
            }
            Ok(None) | Err(StorageError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
