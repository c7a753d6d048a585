//! Dedup, file persistence and reconciliation stages for scraped connector entries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ksync_core::{Entry, RequiredFields};
use ksync_storage::{
    Fetcher, HttpFetcher, LocalStore, ResponseTransform, RetryingStorage, StorageClient,
};
use tracing::info;

mod config;
mod filter;
mod persist;
mod pipeline;
mod reconcile;
mod resolver;

pub use config::{ConnectorConfig, DestinationScope, FileOptions, ReconcileConfig, SyncConfig};
pub use filter::{filter_existing, FilterExistingStage, FilterOutcome};
pub use persist::{PersistError, SaveDataAndFilesStage};
pub use pipeline::{
    write_run_report, Pipeline, PipelineContext, PipelineError, PipelineState, RejectedEntry,
    RunStats, RunSummary, Stage, StageError,
};
pub use reconcile::{plan_reconciliation, Reconciliation, UpdateOrCreateStage};
pub use resolver::{
    file_path, fingerprint_selector, ExistingFile, FileExistenceResolver, MatchTier, ResolveError,
};

pub const CRATE_NAME: &str = "ksync-sync";
pub const BILLS_MODEL: &str = "io.cozy.bills";

/// Summary of a finished run together with the context it left behind.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub context: PipelineContext,
}

/// Dedup on `connector.model` followed by file and record persistence.
/// `transform`, when given, shapes every downloaded response before upload.
pub fn build_sync_pipeline(
    storage: Arc<dyn StorageClient>,
    fetcher: Arc<dyn Fetcher>,
    connector: &ConnectorConfig,
    settings: &SyncConfig,
    transform: Option<Arc<dyn ResponseTransform>>,
) -> Pipeline {
    Pipeline::new()
        .stage(
            FilterExistingStage::new(storage.clone(), connector.model.clone())
                .with_partition(connector.vendor.clone())
                .with_keys(connector.key_fields.clone())
                .with_debug_entries(settings.debug_entries),
        )
        .stage(
            SaveDataAndFilesStage::new(
                storage,
                fetcher,
                connector.model.clone(),
                connector.vendor.clone(),
                connector.files.clone(),
            )
            .with_transform(transform)
            .with_debug_entries(settings.debug_entries),
        )
}

pub fn build_reconcile_pipeline(
    storage: Arc<dyn StorageClient>,
    connector: &ConnectorConfig,
) -> Result<Pipeline> {
    let Some(reconcile) = &connector.reconcile else {
        bail!("connector for {} has no reconcile section", connector.model);
    };
    let stage = UpdateOrCreateStage::new(
        storage,
        connector.model.clone(),
        reconcile.collection.clone(),
        reconcile.match_fields.clone(),
    )?;
    Ok(Pipeline::new().stage(stage))
}

/// Per-call knobs of [`save_bills`].
#[derive(Clone, Default)]
pub struct SaveBillsOptions {
    pub vendor: Option<String>,
    pub files: FileOptions,
    pub transform: Option<Arc<dyn ResponseTransform>>,
}

/// Saves bills: dedup against stored bills of the same vendor, then files and
/// records for the new ones.
pub async fn save_bills(
    storage: Arc<dyn StorageClient>,
    fetcher: Arc<dyn Fetcher>,
    required_fields: RequiredFields,
    entries: Vec<Entry>,
    options: SaveBillsOptions,
    settings: &SyncConfig,
) -> Result<RunOutcome, PipelineError> {
    let connector = ConnectorConfig {
        model: BILLS_MODEL.to_string(),
        vendor: options.vendor,
        key_fields: ksync_core::default_key_fields(),
        files: options.files,
        reconcile: None,
    };
    let mut pipeline = build_sync_pipeline(storage, fetcher, &connector, settings, options.transform);
    let mut context = PipelineContext::new(required_fields, entries);
    let summary = pipeline.run(&mut context).await?;
    Ok(RunOutcome { summary, context })
}

/// Reads a JSON array of entries.
pub fn load_entries(path: &Path) -> Result<Vec<Entry>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: Vec<serde_json::Value> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    raw.into_iter()
        .enumerate()
        .map(|(index, value)| {
            Entry::from_json(value).with_context(|| format!("entry {index} of {}", path.display()))
        })
        .collect()
}

/// Local store under `settings.store_dir`, every call behind the remote policy.
pub fn open_local_storage(settings: &SyncConfig) -> Arc<dyn StorageClient> {
    Arc::new(RetryingStorage::new(
        LocalStore::new(settings.store_dir.clone()),
        settings.remote_policy(),
    ))
}

async fn finish_run(
    settings: &SyncConfig,
    mut pipeline: Pipeline,
    mut context: PipelineContext,
) -> Result<(RunSummary, PathBuf)> {
    let summary = pipeline.run(&mut context).await?;
    let report = write_run_report(&settings.reports_dir, &summary, &context.rejected).await?;
    info!(run_id = %summary.run_id, report = %report.display(), "run report written");
    Ok((summary, report))
}

pub async fn run_sync_once(
    settings: &SyncConfig,
    connector: &ConnectorConfig,
    required_fields: RequiredFields,
    entries: Vec<Entry>,
) -> Result<(RunSummary, PathBuf)> {
    let storage = open_local_storage(settings);
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(settings.http_config())?);
    let pipeline = build_sync_pipeline(storage, fetcher, connector, settings, None);
    finish_run(settings, pipeline, PipelineContext::new(required_fields, entries)).await
}

/// Reconciles `entries` as the connector's reconcile collection.
pub async fn run_reconcile_once(
    settings: &SyncConfig,
    connector: &ConnectorConfig,
    entries: Vec<Entry>,
) -> Result<(RunSummary, PathBuf)> {
    let storage = open_local_storage(settings);
    let pipeline = build_reconcile_pipeline(storage, connector)?;
    let collection = connector
        .reconcile
        .as_ref()
        .map(|r| r.collection.clone())
        .unwrap_or_default();
    let context = PipelineContext::default().with_collection(collection, entries);
    finish_run(settings, pipeline, context).await
}
