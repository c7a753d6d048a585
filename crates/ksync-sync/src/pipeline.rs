use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ksync_core::{Entry, EntryError, RequiredFields};
use ksync_storage::StorageError;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Running counters for one pipeline run. `created` and `updated` are keyed
/// by model (persistor) or collection name (reconciler).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub created: BTreeMap<String, usize>,
    pub updated: BTreeMap<String, usize>,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub files_created: usize,
    pub files_reused: usize,
    pub files_repaired: usize,
    /// Existing files that were empty or mistyped and got downloaded again.
    pub files_replaced: usize,
    /// Entries left unsaved because the run's time budget ran out.
    pub deferred: usize,
}

impl RunStats {
    pub fn reset_counters(&mut self, key: &str) {
        self.created.insert(key.to_string(), 0);
        self.updated.insert(key.to_string(), 0);
    }

    pub fn record_created(&mut self, key: &str) {
        *self.created.entry(key.to_string()).or_default() += 1;
    }

    pub fn record_updated(&mut self, key: &str) {
        *self.updated.entry(key.to_string()).or_default() += 1;
    }

    pub fn created_for(&self, key: &str) -> usize {
        self.created.get(key).copied().unwrap_or(0)
    }

    pub fn updated_for(&self, key: &str) -> usize {
        self.updated.get(key).copied().unwrap_or(0)
    }

    pub fn created_total(&self) -> usize {
        self.created.values().sum()
    }

    pub fn updated_total(&self) -> usize {
        self.updated.values().sum()
    }
}

/// Fetched entry refused by validation, kept for the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedEntry {
    pub index: usize,
    pub reason: String,
    pub entry: Entry,
}

/// State shared by every stage of a run.
#[derive(Debug, Default)]
pub struct PipelineContext {
    pub required_fields: RequiredFields,
    pub raw_entries: Vec<Entry>,
    /// `None` until a dedup stage has run.
    pub filtered_entries: Option<Vec<Entry>>,
    pub collections: BTreeMap<String, Vec<Entry>>,
    pub stats: RunStats,
    pub rejected: Vec<RejectedEntry>,
}

impl PipelineContext {
    pub fn new(required_fields: RequiredFields, raw_entries: Vec<Entry>) -> Self {
        Self {
            required_fields,
            raw_entries,
            ..Default::default()
        }
    }

    pub fn with_collection(mut self, name: impl Into<String>, entries: Vec<Entry>) -> Self {
        self.collections.insert(name.into(), entries);
        self
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("listing existing {model} records failed: {source}")]
    ListFailed {
        model: String,
        #[source]
        source: StorageError,
    },
    #[error("cannot build the destination folder path: {0}")]
    FolderPath(#[source] EntryError),
    #[error("storage quota exceeded while saving files")]
    QuotaExceeded,
    #[error("invalid stage configuration: {0}")]
    Config(String),
}

/// One step of a pipeline. Returning `Err` aborts the run; per-entry
/// failures are the stage's to contain.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut PipelineContext) -> Result<(), StageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Ready,
    Running { stage: usize },
    Done,
    Failed { stage: usize },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {index} ({name}) failed: {source}")]
    Stage {
        index: usize,
        name: String,
        #[source]
        source: StageError,
    },
    #[error("pipeline already ran to {0:?}")]
    AlreadyFinished(PipelineState),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<String>,
    pub raw_entries: usize,
    pub filtered_entries: Option<usize>,
    pub rejected_entries: usize,
    pub stats: RunStats,
}

/// Ordered list of stages run once over a [`PipelineContext`].
pub struct Pipeline {
    run_id: Uuid,
    stages: Vec<Box<dyn Stage>>,
    state: PipelineState,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stages: Vec::new(),
            state: PipelineState::Ready,
        }
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn run(&mut self, ctx: &mut PipelineContext) -> Result<RunSummary, PipelineError> {
        if self.state.is_terminal() {
            return Err(PipelineError::AlreadyFinished(self.state));
        }
        let started_at = Utc::now();
        let run_id = self.run_id;

        for (index, stage) in self.stages.iter().enumerate() {
            self.state = PipelineState::Running { stage: index };
            let span = info_span!("pipeline_stage", %run_id, index, stage = stage.name());
            if let Err(source) = stage.run(ctx).instrument(span).await {
                warn!(%run_id, index, stage = stage.name(), error = %source, "stage failed, aborting run");
                self.state = PipelineState::Failed { stage: index };
                return Err(PipelineError::Stage {
                    index,
                    name: stage.name().to_string(),
                    source,
                });
            }
        }

        self.state = PipelineState::Done;
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stages: self.stage_names(),
            raw_entries: ctx.raw_entries.len(),
            filtered_entries: ctx.filtered_entries.as_ref().map(Vec::len),
            rejected_entries: ctx.rejected.len(),
            stats: ctx.stats.clone(),
        };
        info!(
            %run_id,
            created = summary.stats.created_total(),
            updated = summary.stats.updated_total(),
            skipped = summary.stats.skipped,
            failed = summary.stats.failed,
            "pipeline run complete"
        );
        Ok(summary)
    }
}

/// Writes `<reports_dir>/<run_id>/run_summary.json`.
pub async fn write_run_report(
    reports_dir: &Path,
    summary: &RunSummary,
    rejected: &[RejectedEntry],
) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let bytes = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "rejected": rejected,
    }))
    .context("serializing run summary")?;
    let path = run_dir.join("run_summary.json");
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Stage for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.stats.skipped += 1;
            if self.fail {
                Err(StageError::Config("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn counting(name: &'static str, calls: &Arc<AtomicUsize>, fail: bool) -> Counting {
        Counting {
            name,
            calls: calls.clone(),
            fail,
        }
    }

    #[tokio::test]
    async fn stages_run_in_order_and_share_context() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new()
            .stage(counting("first", &calls, false))
            .stage(counting("second", &calls, false));
        let mut ctx = PipelineContext::new(RequiredFields::new("/bills"), vec![Entry::new()]);

        let summary = pipeline.run(&mut ctx).await.expect("run");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.stats.skipped, 2);
        assert_eq!(summary.stages, vec!["first", "second"]);
        assert_eq!(pipeline.state(), PipelineState::Done);
    }

    #[tokio::test]
    async fn fatal_stage_error_stops_later_stages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let later = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new()
            .stage(counting("failing", &calls, true))
            .stage(counting("never", &later, false));
        let mut ctx = PipelineContext::default();

        let err = pipeline.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Stage { index: 0, .. }));
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.state(), PipelineState::Failed { stage: 0 });

        let again = pipeline.run(&mut ctx).await.unwrap_err();
        assert!(matches!(again, PipelineError::AlreadyFinished(_)));
    }

    #[tokio::test]
    async fn run_report_is_written_per_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pipeline = Pipeline::new();
        let mut ctx = PipelineContext::default();
        let summary = pipeline.run(&mut ctx).await.expect("run");

        let path = write_run_report(dir.path(), &summary, &[]).await.expect("report");
        assert!(path.ends_with("run_summary.json"));
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains(&summary.run_id.to_string()));
    }
}
