//! Log mapper: one per (node, logger).
//!
//! Scans its logger's durable segment over the run's epoch window,
//! partitions every record to the reducer owning its `(storage, key)`, and
//! ships per-reducer buffers through the bounded rings. Cancellation is
//! observed between read batches; a full ring blocks the mapper
//! (backpressure) but never past a cancellation.

use crate::gleaner::RunContext;
use kiln_error::{KilnError, Result};
use kiln_types::{LoggerId, NodeId, StorageId};
use kiln_storage::Partitioner;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::{debug, trace};

pub struct LogMapper {
    node: NodeId,
    logger: LoggerId,
}

impl LogMapper {
    #[must_use]
    pub fn new(node: NodeId, logger: LoggerId) -> Self {
        Self { node, logger }
    }

    pub fn run(&self, ctx: &RunContext) -> Result<()> {
        let snapshot = ctx.run.snapshot;
        let mut reader = ctx.log.open_segment(
            self.node,
            self.logger,
            snapshot.base_epoch,
            snapshot.valid_until_epoch,
        )?;

        let node_count = usize::from(ctx.config.node_count);
        let batch_cap = ctx.config.mapper_batch_records;
        let cancel = ctx.control.gleaner.cancel_flag();
        let mut buckets: Vec<Vec<kiln_types::LogRecord>> =
            (0..node_count).map(|_| Vec::new()).collect();
        let mut partitioners: HashMap<StorageId, Partitioner> = HashMap::new();
        let mut scanned = 0_u64;
        let mut shipped_batches = 0_u64;

        loop {
            if ctx.control.gleaner.is_cancelled() {
                return Err(KilnError::Cancelled);
            }
            let batch = reader.next_batch(batch_cap)?;
            if batch.is_empty() {
                break;
            }
            scanned += batch.len() as u64;

            for record in batch {
                debug_assert!(
                    record.epoch <= snapshot.valid_until_epoch,
                    "log layer leaked a record past the snapshot horizon"
                );
                let partitioner = match partitioners.entry(record.storage_id) {
                    Entry::Occupied(entry) => *entry.get(),
                    Entry::Vacant(entry) => {
                        let partitioner = ctx
                            .storages
                            .partitioner_for(record.storage_id)
                            .ok_or_else(|| {
                                KilnError::Inconsistent(format!(
                                    "log record for unknown storage {}",
                                    record.storage_id
                                ))
                            })?;
                        *entry.insert(partitioner)
                    }
                };
                let target = partitioner.node_of(record.key);
                let bucket = buckets.get_mut(usize::from(target.0)).ok_or_else(|| {
                    KilnError::Inconsistent(format!(
                        "partitioner routed storage {} to unknown node {target}",
                        record.storage_id
                    ))
                })?;
                bucket.push(record);
                if bucket.len() >= batch_cap {
                    let full = std::mem::take(bucket);
                    ctx.run.ring(target).push(full, &cancel)?;
                    shipped_batches += 1;
                }
            }
        }

        // end of segment: flush partial buckets
        for (target, bucket) in buckets.iter_mut().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let rest = std::mem::take(bucket);
            trace!(
                target: "kiln::snapshot::mapper",
                event = "bucket_flushed",
                node = self.node.0,
                logger = self.logger.0,
                to_node = target,
                records = rest.len()
            );
            ctx.run.ring(NodeId(target as u16)).push(rest, &cancel)?;
            shipped_batches += 1;
        }

        debug!(
            target: "kiln::snapshot::mapper",
            event = "mapper_done",
            node = self.node.0,
            logger = self.logger.0,
            snapshot = snapshot.id.0,
            scanned,
            shipped_batches
        );
        Ok(())
    }
}
