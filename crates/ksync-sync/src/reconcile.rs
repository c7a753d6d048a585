use std::sync::Arc;

use async_trait::async_trait;
use ksync_core::{Entry, StoredRecord};
use ksync_storage::StorageClient;
use tracing::{debug, info, warn};

use crate::pipeline::{PipelineContext, Stage, StageError};

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Update { record_id: String, changes: Entry },
    Create { entry: Entry },
}

fn same_on(a: &Entry, b: &Entry, fields: &[String]) -> bool {
    fields.iter().all(|field| match (a.get(field), b.get(field)) {
        (Some(left), Some(right)) => left.same_value(right),
        (None, None) => true,
        _ => false,
    })
}

/// Pairs each entry with the first stored record equal on every match field.
/// Entries aimed at the same record, or at the same new record, are merged
/// with later fields winning, so no record is written twice.
pub fn plan_reconciliation(
    existing: &[StoredRecord],
    entries: &[Entry],
    match_fields: &[String],
) -> Vec<Reconciliation> {
    let mut plan: Vec<Reconciliation> = Vec::new();
    for entry in entries {
        let target = existing
            .iter()
            .find(|record| same_on(entry, &record.fields, match_fields));

        let merged = plan.iter_mut().find_map(|step| match (step, target) {
            (Reconciliation::Update { record_id, changes }, Some(record)) if *record_id == record.id => {
                Some(changes)
            }
            (Reconciliation::Create { entry: pending }, None) if same_on(entry, pending, match_fields) => {
                Some(pending)
            }
            _ => None,
        });
        if let Some(previous) = merged {
            previous.merge(entry);
            continue;
        }

        plan.push(match target {
            Some(record) => Reconciliation::Update {
                record_id: record.id.clone(),
                changes: entry.clone(),
            },
            None => Reconciliation::Create {
                entry: entry.clone(),
            },
        });
    }
    plan
}

/// Writes a named collection of the context into `model`, updating matched
/// records and creating the rest.
pub struct UpdateOrCreateStage {
    storage: Arc<dyn StorageClient>,
    model: String,
    collection: String,
    match_fields: Vec<String>,
}

impl UpdateOrCreateStage {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        model: impl Into<String>,
        collection: impl Into<String>,
        match_fields: Vec<String>,
    ) -> Result<Self, StageError> {
        if match_fields.is_empty() {
            return Err(StageError::Config(
                "update-or-create needs at least one match field".to_string(),
            ));
        }
        Ok(Self {
            storage,
            model: model.into(),
            collection: collection.into(),
            match_fields,
        })
    }
}

#[async_trait]
impl Stage for UpdateOrCreateStage {
    fn name(&self) -> &str {
        "update_or_create"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        ctx.stats.reset_counters(&self.collection);
        let entries = match ctx.collections.get(&self.collection) {
            Some(entries) if !entries.is_empty() => entries.clone(),
            _ => {
                info!(collection = %self.collection, "nothing to reconcile");
                return Ok(());
            }
        };

        let existing = self
            .storage
            .list_all(&self.model)
            .await
            .map_err(|source| StageError::ListFailed {
                model: self.model.clone(),
                source,
            })?;

        let plan = plan_reconciliation(&existing, &entries, &self.match_fields);
        debug!(entries = entries.len(), writes = plan.len(), "reconciliation planned");

        for step in plan {
            match step {
                Reconciliation::Update { record_id, changes } => {
                    match self.storage.update_attributes(&self.model, &record_id, &changes).await {
                        Ok(_) => ctx.stats.record_updated(&self.collection),
                        Err(err) => {
                            warn!(%record_id, error = %err, "update failed");
                            ctx.stats.failed += 1;
                        }
                    }
                }
                Reconciliation::Create { entry } => match self.storage.create(&self.model, &entry).await {
                    Ok(_) => ctx.stats.record_created(&self.collection),
                    Err(err) => {
                        warn!(error = %err, "create failed");
                        ctx.stats.failed += 1;
                    }
                },
            }
        }

        info!(
            collection = %self.collection,
            model = %self.model,
            created = ctx.stats.created_for(&self.collection),
            updated = ctx.stats.updated_for(&self.collection),
            "reconciled"
        );
        Ok(())
    }
}
