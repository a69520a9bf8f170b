use std::collections::HashSet;

use fts_core::{DataMode, FundingRecord};
use fts_storage::RecordStore;
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::chunking::{chunk, ChunkWindow};
use crate::records::RecordStream;
use crate::{SyncError, SyncStrategy};

/// Running totals of one synchronizer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkTotals {
    pub chunks: usize,
    pub deleted: u64,
    pub inserted: u64,
    /// The row cap stopped the pass before the stream was exhausted.
    pub capped: bool,
}

/// Writes a record stream to a store one chunk at a time.
pub struct Synchronizer<'a> {
    store: &'a dyn RecordStore,
    chunk_size: usize,
    row_limit: Option<usize>,
    echo: bool,
}

impl<'a> Synchronizer<'a> {
    pub fn new(store: &'a dyn RecordStore, chunk_size: usize, row_limit: Option<usize>) -> Self {
        Self {
            store,
            chunk_size,
            row_limit,
            echo: false,
        }
    }

    /// Logs every record before it is written.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Backfill appends every chunk. Populate first deletes the rows whose key
    /// appears in the chunk, skipping keys an earlier chunk of this pass
    /// already reconciled, then inserts. The row cap is checked between
    /// chunks, so the last chunk may overshoot it.
    pub async fn apply(
        &self,
        mode: DataMode,
        strategy: SyncStrategy,
        records: RecordStream,
    ) -> Result<ChunkTotals, SyncError> {
        let table = mode.table_name();
        let mut totals = ChunkTotals::default();
        let mut reconciled: HashSet<String> = HashSet::new();
        let mut chunks = chunk(records, self.chunk_size, ChunkWindow::default());

        while let Some(batch) = chunks.next().await {
            let batch = batch?;
            if self.echo {
                echo_records(&batch);
            }

            match strategy {
                SyncStrategy::Backfill => {
                    let inserted = self.store.insert_records(mode, &batch).await?;
                    totals.inserted += inserted;
                    info!(table, inserted, "inserted chunk");
                }
                SyncStrategy::Populate => {
                    let mut keys = Vec::new();
                    for record in &batch {
                        let key = record.identity_key();
                        if !reconciled.contains(key) {
                            reconciled.insert(key.to_string());
                            keys.push(key.to_string());
                        }
                    }
                    let outcome = self.store.replace_records(mode, &keys, &batch).await?;
                    totals.deleted += outcome.deleted;
                    totals.inserted += outcome.inserted;
                    info!(
                        table,
                        deleted = outcome.deleted,
                        inserted = outcome.inserted,
                        "replaced chunk"
                    );
                }
            }
            totals.chunks += 1;

            if let Some(limit) = self.row_limit {
                if totals.inserted >= limit as u64 {
                    totals.capped = true;
                    info!(table, limit, inserted = totals.inserted, "row limit reached");
                    break;
                }
            }
        }

        Ok(totals)
    }
}

fn echo_records(batch: &[FundingRecord]) {
    for record in batch {
        let flat = record.to_flat();
        if !flat.conflicts.is_empty() {
            warn!(
                key = record.identity_key(),
                conflicts = ?flat.conflicts,
                "record fields collided"
            );
        }
        info!(record = %serde_json::Value::Object(flat.fields), "record");
    }
}
