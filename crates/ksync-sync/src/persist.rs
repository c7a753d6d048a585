use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ksync_core::{
    entry_file_name, Entry, EntryError, FileDescriptor, FileMetadata, DATE_FIELD, FILE_FIELD,
    VENDOR_FIELD,
};
use ksync_storage::{
    CreateFileOptions, FetchError, Fetcher, FileContent, ResponseTransform, StorageClient,
    StorageError,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::FileOptions;
use crate::pipeline::{PipelineContext, RunStats, Stage, StageError};
use crate::resolver::{fingerprint_selector, FileExistenceResolver, ResolveError};

const QUOTA_EXCEEDED_STATUS: u16 = 413;
const GENERIC_CONTENT_TYPE: &str = "application/octet-stream";

/// Why an existing file cannot stand in for the entry's download.
fn stale_reason(file: &FileDescriptor) -> Option<&'static str> {
    if file.size == 0 {
        return Some("empty");
    }
    let declared = file
        .content_type
        .as_deref()
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case(GENERIC_CONTENT_TYPE))?;
    let expected = mime_guess::from_path(&file.name);
    if expected.is_empty() || expected.iter_raw().any(|mime| mime.eq_ignore_ascii_case(declared)) {
        None
    } else {
        Some("content type does not match the file extension")
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{operation} failed: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: StorageError,
    },
}

impl PersistError {
    fn storage(operation: &'static str) -> impl FnOnce(StorageError) -> Self {
        move |source| Self::Storage { operation, source }
    }

    /// Quota exhaustion stops the whole run; everything else only costs the entry.
    pub fn is_fatal(&self) -> bool {
        let source = match self {
            Self::Storage { source, .. } => source,
            Self::Resolve(ResolveError::Storage(source)) => source,
            _ => return false,
        };
        matches!(
            source,
            StorageError::QuotaExceeded
                | StorageError::Remote {
                    status: QUOTA_EXCEEDED_STATUS,
                    ..
                }
        )
    }
}

/// Saves the files and records of `filtered_entries` (or `raw_entries` when
/// no filter ran), then re-creates missing files for the whole raw batch.
pub struct SaveDataAndFilesStage {
    storage: Arc<dyn StorageClient>,
    fetcher: Arc<dyn Fetcher>,
    resolver: FileExistenceResolver,
    model: String,
    vendor: Option<String>,
    files: FileOptions,
    transform: Option<Arc<dyn ResponseTransform>>,
    debug_entries: bool,
}

impl SaveDataAndFilesStage {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        fetcher: Arc<dyn Fetcher>,
        model: impl Into<String>,
        vendor: Option<String>,
        files: FileOptions,
    ) -> Self {
        let resolver =
            FileExistenceResolver::new(storage.clone(), files.naming.clone(), files.scope.clone());
        Self {
            storage,
            fetcher,
            resolver,
            model: model.into(),
            vendor,
            files,
            transform: None,
            debug_entries: false,
        }
    }

    pub fn with_transform(mut self, transform: Option<Arc<dyn ResponseTransform>>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_debug_entries(mut self, enabled: bool) -> Self {
        self.debug_entries = enabled;
        self
    }

    pub async fn save_entry(
        &self,
        entry: &mut Entry,
        folder: &str,
        stats: &mut RunStats,
    ) -> Result<(), PersistError> {
        // Refuse a bad date before any file lands in the store.
        if entry.contains(DATE_FIELD) {
            entry.day()?;
        }

        if entry.pdf_url().is_some() {
            let file = self.ensure_file(entry, folder, stats).await?;
            if entry.file_id().is_none() {
                entry.insert(FILE_FIELD, file.id);
            }
        }

        if entry.vendor().is_none() {
            if let Some(vendor) = &self.vendor {
                entry.insert(VENDOR_FIELD, vendor.as_str());
            }
        }
        entry.canonicalize_date()?;

        if self.debug_entries {
            debug!(?entry, model = %self.model, "creating record");
        }
        let record = self
            .storage
            .create(&self.model, entry)
            .await
            .map_err(PersistError::storage("create record"))?;
        debug!(record_id = %record.id, "record created");
        stats.record_created(&self.model);
        Ok(())
    }

    async fn ensure_file(
        &self,
        entry: &Entry,
        folder: &str,
        stats: &mut RunStats,
    ) -> Result<FileDescriptor, PersistError> {
        let Some(existing) = self.resolver.resolve(entry, folder).await? else {
            let created = self.create_file(entry, folder).await?;
            stats.files_created += 1;
            return Ok(created);
        };
        let Some(reason) = stale_reason(&existing.descriptor) else {
            stats.files_reused += 1;
            return Ok(existing.descriptor);
        };

        info!(file_id = %existing.descriptor.id, path = %existing.descriptor.path, reason, "replacing stored file");
        self.storage
            .trash_file(&existing.descriptor.id)
            .await
            .map_err(PersistError::storage("trash file"))?;
        let created = self.create_file(entry, folder).await?;
        stats.files_replaced += 1;
        Ok(created)
    }

    pub async fn create_file(&self, entry: &Entry, folder: &str) -> Result<FileDescriptor, PersistError> {
        let url = entry.pdf_url().unwrap_or_default().to_string();
        let name = entry_file_name(entry, self.files.naming.as_ref())?;
        let span = info_span!("save_file", %url, %name);
        self.download_and_upload(entry, folder, &url, name)
            .instrument(span)
            .await
    }

    async fn download_and_upload(
        &self,
        entry: &Entry,
        folder: &str,
        url: &str,
        name: String,
    ) -> Result<FileDescriptor, PersistError> {
        let dir = self
            .storage
            .create_directory(folder)
            .await
            .map_err(PersistError::storage("create directory"))?;

        let response = self.fetcher.download(url, &self.files.download).await?;
        let content = match &self.transform {
            Some(transform) => transform.transform(response)?,
            None => FileContent::from(response),
        };
        if content.bytes.is_empty() {
            return Err(PersistError::Fetch(FetchError::EmptyBody { url: url.to_string() }));
        }

        let metadata = fingerprint_selector(entry, &self.files.scope)?.map(|selector| FileMetadata {
            file_id_attributes: Some(selector.file_id_attributes),
            source_account_identifier: Some(selector.source_account_identifier),
            created_by_app: Some(selector.created_by_app),
        });
        let options = CreateFileOptions {
            name,
            dir_id: dir.id,
            content_type: self
                .files
                .content_type
                .clone()
                .or_else(|| content.content_type.clone()),
            metadata,
        };
        let size = content.bytes.len();
        let created = self
            .storage
            .create_file(content, &options)
            .await
            .map_err(PersistError::storage("create file"))?;
        info!(file_id = %created.id, path = %created.path, size, "file saved");
        Ok(created)
    }

    /// Second chance for files of entries the filter skipped or whose first
    /// upload failed. Records are never created here.
    async fn repair_missing_files(&self, ctx: &mut PipelineContext, folder: &str) -> Result<(), StageError> {
        for (index, entry) in ctx.raw_entries.iter().enumerate() {
            if entry.pdf_url().is_none() {
                continue;
            }
            let outcome = match self.resolver.resolve(entry, folder).await {
                Ok(Some(_)) => continue,
                Ok(None) => self.create_file(entry, folder).await.map(|_| ()),
                Err(err) => Err(err.into()),
            };
            match outcome {
                Ok(()) => {
                    ctx.stats.files_repaired += 1;
                    info!(index, "missing file restored");
                }
                Err(err) if err.is_fatal() => return Err(StageError::QuotaExceeded),
                Err(err) => warn!(index, error = %err, "could not restore missing file"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for SaveDataAndFilesStage {
    fn name(&self) -> &str {
        "save_data_and_files"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        let folder = ctx
            .required_fields
            .normalized_folder_path()
            .map_err(StageError::FolderPath)?;
        let mut entries = match ctx.filtered_entries.take() {
            Some(filtered) => filtered,
            None => ctx.raw_entries.clone(),
        };
        ctx.stats.created.entry(self.model.clone()).or_default();

        info!(model = %self.model, %folder, entries = entries.len(), "saving entries");
        let deadline = self
            .files
            .time_budget_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let total = entries.len();
        let mut quota_exceeded = false;
        let mut out_of_time = false;
        for (index, entry) in entries.iter_mut().enumerate() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let remaining = total - index;
                warn!(remaining, total, "time budget spent, leaving the rest for the next run");
                ctx.stats.deferred += remaining;
                out_of_time = true;
                break;
            }
            match self.save_entry(entry, &folder, &mut ctx.stats).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    warn!(index, error = %err, "storage quota exceeded, stopping");
                    quota_exceeded = true;
                    break;
                }
                Err(err) => {
                    warn!(index, error = %err, "entry not saved");
                    ctx.stats.failed += 1;
                }
            }
        }
        ctx.filtered_entries = Some(entries);
        if quota_exceeded {
            return Err(StageError::QuotaExceeded);
        }

        if !out_of_time {
            self.repair_missing_files(ctx, &folder).await?;
        }
        info!(
            model = %self.model,
            created = ctx.stats.created_for(&self.model),
            failed = ctx.stats.failed,
            files_created = ctx.stats.files_created,
            files_reused = ctx.stats.files_reused,
            files_repaired = ctx.stats.files_repaired,
            files_replaced = ctx.stats.files_replaced,
            deferred = ctx.stats.deferred,
            "entries saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ksync_core::{FieldValue, RequiredFields, PDF_URL_FIELD};
    use ksync_storage::{DownloadOptions, FetchedResponse, LocalStore};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StaticFetcher {
        bodies: BTreeMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.bodies.insert(url.to_string(), body.to_vec());
            self
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn download(&self, url: &str, _options: &DownloadOptions) -> Result<FetchedResponse, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            let body = self.bodies.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })?;
            Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                content_type: Some("application/octet-stream".into()),
                body,
            })
        }
    }

    fn bill(url: &str) -> Entry {
        Entry::new()
            .with(DATE_FIELD, Utc.with_ymd_and_hms(2024, 1, 5, 14, 30, 0).unwrap())
            .with("amount", 12.5)
            .with(PDF_URL_FIELD, url)
    }

    fn setup(fetcher: StaticFetcher) -> (tempfile::TempDir, Arc<LocalStore>, Arc<StaticFetcher>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path().join("store")));
        (dir, store, Arc::new(fetcher))
    }

    #[tokio::test]
    async fn saves_file_then_record_with_defaults() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/a.pdf", b"%PDF-a"));
        let stage = SaveDataAndFilesStage::new(
            store.clone(),
            fetcher.clone(),
            "io.cozy.bills",
            Some("acme".into()),
            FileOptions {
                content_type: Some("application/pdf".into()),
                ..Default::default()
            },
        );
        let mut ctx = PipelineContext::new(RequiredFields::new("Bills/Acme"), vec![bill("https://acme.test/a.pdf")]);

        stage.run(&mut ctx).await.unwrap();

        let records = store.list_all("io.cozy.bills").await.unwrap();
        assert_eq!(records.len(), 1);
        let saved = &records[0].fields;
        assert_eq!(saved.vendor(), Some("acme"));
        assert_eq!(
            saved.get(DATE_FIELD),
            Some(&FieldValue::Date(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()))
        );
        let file = store.stat_by_path("/Bills/Acme/a.pdf").await.unwrap().unwrap();
        assert_eq!(saved.file_id(), Some(file.id.as_str()));
        assert_eq!(file.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(ctx.stats.created_for("io.cozy.bills"), 1);
        assert_eq!(ctx.stats.files_created, 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn existing_file_is_reused_without_download() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default());
        let folder = store.create_directory("/bills").await.unwrap();
        let existing = store
            .create_file(
                FileContent::new(b"old".to_vec(), None),
                &CreateFileOptions {
                    name: "a.pdf".into(),
                    dir_id: folder.id,
                    content_type: None,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher.clone(), "bills", None, FileOptions::default());
        let mut ctx = PipelineContext::new(RequiredFields::new("/bills"), vec![bill("https://acme.test/a.pdf")]);

        stage.run(&mut ctx).await.unwrap();

        assert_eq!(fetcher.calls(), 0);
        assert_eq!(ctx.stats.files_reused, 1);
        let records = store.list_all("bills").await.unwrap();
        assert_eq!(records[0].fields.file_id(), Some(existing.id.as_str()));
    }

    async fn store_file(store: &LocalStore, name: &str, bytes: &[u8], content_type: Option<&str>) -> FileDescriptor {
        let folder = store.create_directory("/bills").await.unwrap();
        store
            .create_file(
                FileContent::new(bytes.to_vec(), None),
                &CreateFileOptions {
                    name: name.into(),
                    dir_id: folder.id,
                    content_type: content_type.map(str::to_string),
                    metadata: None,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_existing_file_is_trashed_and_downloaded_again() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/a.pdf", b"%PDF-new"));
        let empty = store_file(&store, "a.pdf", b"", Some("application/pdf")).await;
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher.clone(), "bills", None, FileOptions::default());
        let mut ctx = PipelineContext::new(RequiredFields::new("/bills"), vec![bill("https://acme.test/a.pdf")]);

        stage.run(&mut ctx).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(ctx.stats.files_replaced, 1);
        let current = store.stat_by_path("/bills/a.pdf").await.unwrap().unwrap();
        assert_ne!(current.id, empty.id);
        assert_eq!(store.read_file(&current.id).await.unwrap(), b"%PDF-new");
        let records = store.list_all("bills").await.unwrap();
        assert_eq!(records[0].fields.file_id(), Some(current.id.as_str()));
    }

    #[tokio::test]
    async fn mistyped_existing_file_is_replaced() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/a.pdf", b"%PDF-new"));
        store_file(&store, "a.pdf", b"<html>login</html>", Some("text/html")).await;
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher.clone(), "bills", None, FileOptions::default());
        let mut stats = RunStats::default();

        stage
            .save_entry(&mut bill("https://acme.test/a.pdf"), "/bills", &mut stats)
            .await
            .unwrap();
        assert_eq!(stats.files_replaced, 1);
        assert_eq!(stats.files_reused, 0);
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn generic_or_matching_content_types_are_kept() {
        let file = |name: &str, size: u64, content_type: Option<&str>| FileDescriptor {
            id: "f1".into(),
            kind: ksync_core::FileKind::File,
            name: name.into(),
            path: format!("/bills/{name}"),
            dir_id: None,
            trashed: false,
            size,
            content_type: content_type.map(str::to_string),
            metadata: None,
        };
        assert_eq!(stale_reason(&file("a.pdf", 3, Some("application/pdf"))), None);
        assert_eq!(stale_reason(&file("a.pdf", 3, Some("application/octet-stream"))), None);
        assert_eq!(stale_reason(&file("a.pdf", 3, None)), None);
        assert_eq!(stale_reason(&file("a.unknownext", 3, Some("text/html"))), None);
        assert!(stale_reason(&file("a.pdf", 3, Some("text/html"))).is_some());
        assert!(stale_reason(&file("a.pdf", 0, Some("application/pdf"))).is_some());
    }

    #[tokio::test]
    async fn spent_time_budget_defers_the_remaining_entries() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/a.pdf", b"%PDF"));
        let files = FileOptions {
            time_budget_secs: Some(0),
            ..Default::default()
        };
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher.clone(), "bills", None, files);
        let mut ctx = PipelineContext::new(
            RequiredFields::new("/bills"),
            vec![bill("https://acme.test/a.pdf"), bill("https://acme.test/b.pdf")],
        );

        stage.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.stats.deferred, 2);
        assert_eq!(ctx.stats.failed, 0);
        assert_eq!(fetcher.calls(), 0);
        assert!(store.list_all("bills").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preset_file_field_is_kept() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/a.pdf", b"%PDF"));
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher, "bills", None, FileOptions::default());
        let mut ctx = PipelineContext::new(
            RequiredFields::new("/bills"),
            vec![bill("https://acme.test/a.pdf").with(FILE_FIELD, "already-linked")],
        );

        stage.run(&mut ctx).await.unwrap();
        let records = store.list_all("bills").await.unwrap();
        assert_eq!(records[0].fields.file_id(), Some("already-linked"));
    }

    #[tokio::test]
    async fn one_failed_download_does_not_stop_the_batch() {
        let (_dir, store, fetcher) = setup(
            StaticFetcher::default()
                .with("https://acme.test/a.pdf", b"%PDF-a")
                .with("https://acme.test/c.pdf", b"%PDF-c"),
        );
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher, "bills", None, FileOptions::default());
        let mut ctx = PipelineContext::new(
            RequiredFields::new("/bills"),
            vec![
                bill("https://acme.test/a.pdf"),
                bill("https://acme.test/b.pdf"),
                bill("https://acme.test/c.pdf"),
            ],
        );

        stage.run(&mut ctx).await.unwrap();
        assert_eq!(store.list_all("bills").await.unwrap().len(), 2);
        assert_eq!(ctx.stats.failed, 1);
    }

    #[tokio::test]
    async fn empty_download_is_rejected() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/a.pdf", b""));
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher, "bills", None, FileOptions::default());
        let mut stats = RunStats::default();
        let err = stage
            .save_entry(&mut bill("https://acme.test/a.pdf"), "/bills", &mut stats)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Fetch(FetchError::EmptyBody { .. })));
        assert!(store.list_all("bills").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_date_fails_before_any_file_is_written() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/a.pdf", b"%PDF"));
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher.clone(), "bills", None, FileOptions::default());
        let mut entry = bill("https://acme.test/a.pdf").with(DATE_FIELD, "tomorrow");
        let err = stage
            .save_entry(&mut entry, "/bills", &mut RunStats::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Entry(EntryError::NonCanonicalDate { .. })));
        assert_eq!(fetcher.calls(), 0);
        assert!(store.list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transform_shapes_the_uploaded_content() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/a.pdf", b"raw"));
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher, "bills", None, FileOptions::default())
            .with_transform(Some(Arc::new(|response: FetchedResponse| {
                let mut bytes = b"wrapped:".to_vec();
                bytes.extend(response.body);
                Ok::<_, FetchError>(FileContent::new(bytes, Some("text/plain".into())))
            })));
        let mut ctx = PipelineContext::new(RequiredFields::new("/bills"), vec![bill("https://acme.test/a.pdf")]);

        stage.run(&mut ctx).await.unwrap();
        let file = store.stat_by_path("/bills/a.pdf").await.unwrap().unwrap();
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
        assert_eq!(store.read_file(&file.id).await.unwrap(), b"wrapped:raw");
    }

    #[tokio::test]
    async fn repair_pass_restores_files_of_filtered_out_entries() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default().with("https://acme.test/old.pdf", b"%PDF-old"));
        let stage = SaveDataAndFilesStage::new(store.clone(), fetcher, "bills", None, FileOptions::default());
        let mut ctx = PipelineContext::new(RequiredFields::new("/bills"), vec![bill("https://acme.test/old.pdf")]);
        ctx.filtered_entries = Some(Vec::new());

        stage.run(&mut ctx).await.unwrap();
        assert!(store.stat_by_path("/bills/old.pdf").await.unwrap().is_some());
        assert!(store.list_all("bills").await.unwrap().is_empty());
        assert_eq!(ctx.stats.files_repaired, 1);
    }

    #[tokio::test]
    async fn invalid_folder_is_fatal() {
        let (_dir, store, fetcher) = setup(StaticFetcher::default());
        let stage = SaveDataAndFilesStage::new(store, fetcher, "bills", None, FileOptions::default());
        let mut ctx = PipelineContext::new(RequiredFields::new(""), vec![bill("https://acme.test/a.pdf")]);
        assert!(matches!(stage.run(&mut ctx).await, Err(StageError::FolderPath(_))));
    }

    #[test]
    fn quota_errors_are_fatal() {
        assert!(PersistError::storage("create file")(StorageError::QuotaExceeded).is_fatal());
        assert!(PersistError::storage("create file")(StorageError::Remote {
            status: 413,
            message: "quota".into()
        })
        .is_fatal());
        assert!(!PersistError::storage("create file")(StorageError::Remote {
            status: 500,
            message: "oops".into()
        })
        .is_fatal());
    }
}
