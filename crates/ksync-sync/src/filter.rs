use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ksync_core::{default_key_fields, CompositeKey, Entry, EntryError, StoredRecord, ID_FIELD};
use ksync_storage::StorageClient;
use tracing::{debug, info, warn};

use crate::pipeline::{PipelineContext, RejectedEntry, Stage, StageError};

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub retained: Vec<Entry>,
    pub rejected: Vec<RejectedEntry>,
    /// Partition actually used, derived from the first entry when not given.
    pub partition: Option<String>,
    pub duplicates: usize,
    pub other_partition: usize,
    /// Index of each fetched entry that matched a stored record, with that
    /// record's id.
    pub matched: Vec<(usize, String)>,
}

/// Key of a stored record. A textual date left by another writer is read as a
/// day before giving up on the record.
fn stored_key(record: &StoredRecord, keys: &[String]) -> Result<CompositeKey, EntryError> {
    CompositeKey::for_entry(&record.fields, keys).or_else(|err| {
        let mut fields = record.fields.clone();
        if fields.promote_textual_date() {
            CompositeKey::for_entry(&fields, keys)
        } else {
            Err(err)
        }
    })
}

/// Drops fetched entries whose composite key already exists among the stored
/// records of the same partition. Order of the retained entries is kept.
pub fn filter_existing(
    stored: &[StoredRecord],
    fetched: Vec<Entry>,
    partition: Option<&str>,
    keys: &[String],
) -> FilterOutcome {
    let partition = partition
        .map(str::to_string)
        .or_else(|| fetched.first().and_then(|e| e.vendor().map(str::to_string)));

    let mut lookup = HashMap::new();
    for record in stored {
        if partition.is_some() && record.vendor() != partition.as_deref() {
            continue;
        }
        match stored_key(record, keys) {
            Ok(key) => {
                lookup.entry(key).or_insert_with(|| record.id.clone());
            }
            Err(err) => warn!(record_id = %record.id, error = %err, "stored record has no usable key"),
        }
    }

    let mut outcome = FilterOutcome {
        partition,
        ..Default::default()
    };
    for (index, entry) in fetched.into_iter().enumerate() {
        if entry.vendor() != outcome.partition.as_deref() {
            outcome.other_partition += 1;
            continue;
        }
        match CompositeKey::for_entry(&entry, keys) {
            Ok(key) => match lookup.get(&key) {
                Some(record_id) => {
                    outcome.duplicates += 1;
                    outcome.matched.push((index, record_id.clone()));
                }
                None => outcome.retained.push(entry),
            },
            Err(err) => outcome.rejected.push(RejectedEntry {
                index,
                reason: err.to_string(),
                entry,
            }),
        }
    }
    outcome
}

/// Lists the stored records of `model` and narrows `raw_entries` down to the
/// new ones in `filtered_entries`. Raw entries that already exist get the id
/// of their stored record in `_id`.
pub struct FilterExistingStage {
    storage: Arc<dyn StorageClient>,
    model: String,
    partition: Option<String>,
    keys: Vec<String>,
    debug_entries: bool,
}

impl FilterExistingStage {
    pub fn new(storage: Arc<dyn StorageClient>, model: impl Into<String>) -> Self {
        Self {
            storage,
            model: model.into(),
            partition: None,
            keys: default_key_fields(),
            debug_entries: false,
        }
    }

    pub fn with_partition(mut self, partition: Option<String>) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        if !keys.is_empty() {
            self.keys = keys;
        }
        self
    }

    pub fn with_debug_entries(mut self, enabled: bool) -> Self {
        self.debug_entries = enabled;
        self
    }
}

#[async_trait]
impl Stage for FilterExistingStage {
    fn name(&self) -> &str {
        "filter_existing"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<(), StageError> {
        let stored = self
            .storage
            .list_all(&self.model)
            .await
            .map_err(|source| StageError::ListFailed {
                model: self.model.clone(),
                source,
            })?;

        let outcome = filter_existing(
            &stored,
            ctx.raw_entries.clone(),
            self.partition.as_deref(),
            &self.keys,
        );
        for rejected in &outcome.rejected {
            warn!(index = rejected.index, reason = %rejected.reason, "fetched entry rejected");
        }
        info!(
            model = %self.model,
            partition = outcome.partition.as_deref().unwrap_or("<none>"),
            stored = stored.len(),
            fetched = ctx.raw_entries.len(),
            retained = outcome.retained.len(),
            duplicates = outcome.duplicates,
            other_partition = outcome.other_partition,
            "filtered existing entries"
        );
        if self.debug_entries {
            debug!(entries = ?outcome.retained, "entries to save");
        }

        for (index, record_id) in &outcome.matched {
            if let Some(entry) = ctx.raw_entries.get_mut(*index) {
                entry.insert(ID_FIELD, record_id.as_str());
            }
        }
        ctx.stats.duplicates += outcome.duplicates;
        ctx.stats.skipped += outcome.rejected.len();
        ctx.rejected.extend(outcome.rejected);
        ctx.filtered_entries = Some(outcome.retained);
        Ok(())
    }
}
