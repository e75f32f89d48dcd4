// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Scheduling of per-bin sort tasks at sink finalization.
//!
//! Responsibilities:
//! - Fans one sort task per non-empty bin out onto a worker pool.
//! - Invokes the sorted-partition callback per completed bin and joins all tasks,
//!   surfacing the first failure.
//!
//! Key exported interfaces:
//! - Types: `PartitionMergeEvent`.

use std::sync::mpsc;
use std::sync::Arc;

use threadpool::ThreadPool;

use crate::exec::chunk::Chunk;
use crate::exec::partition::sink::PartitionGlobalState;
use crate::exec::partition::sort::sort_bin_chunks;
use crate::gale_logging::debug;

pub(crate) struct MergeTask {
    pub(crate) bin: usize,
    pub(crate) chunks: Vec<Chunk>,
}

/// Sorts every buffered bin in parallel. Each completed bin stores its
/// [`HashPartition`](crate::exec::partition::HashPartition) into the global
/// state and fires the sorted-partition callback.
pub struct PartitionMergeEvent {
    tasks: Vec<MergeTask>,
}

impl PartitionMergeEvent {
    pub(crate) fn new(tasks: Vec<MergeTask>) -> Self {
        Self { tasks }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Run all sort tasks on `pool` and block until every one has finished.
    /// `on_sorted` runs once per sorted bin, on the worker that sorted it.
    pub fn run(
        self,
        pool: &ThreadPool,
        gpart: Arc<PartitionGlobalState>,
        on_sorted: Arc<dyn Fn(usize) -> Result<(), String> + Send + Sync>,
    ) -> Result<(), String> {
        let task_count = self.tasks.len();
        if task_count == 0 {
            return Ok(());
        }
        debug!("scheduling {} partition sort task(s)", task_count);

        let (tx, rx) = mpsc::channel::<Result<(), String>>();
        for task in self.tasks {
            let tx = tx.clone();
            let gpart = Arc::clone(&gpart);
            let on_sorted = Arc::clone(&on_sorted);
            pool.execute(move || {
                let result = run_one(&gpart, task, on_sorted.as_ref());
                // Receiver outlives all senders; a send failure means the
                // event was dropped and the result no longer matters.
                let _ = tx.send(result);
            });
        }
        drop(tx);

        let mut first_error = None;
        for _ in 0..task_count {
            match rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some("partition sort worker disappeared".to_string());
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn run_one(
    gpart: &Arc<PartitionGlobalState>,
    task: MergeTask,
    on_sorted: &(dyn Fn(usize) -> Result<(), String> + Send + Sync),
) -> Result<(), String> {
    let bin = task.bin;
    let layout = gpart.layout();
    let Some(partition) = sort_bin_chunks(gpart.spec(), &layout, bin, task.chunks)? else {
        return Ok(());
    };
    gpart.store_hash_group(bin, partition);
    on_sorted(bin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::partition::sink::PartitionSpec;
    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn payload_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("p", DataType::Int64, false), SlotId::new(1)),
            field_with_slot_id(Field::new("x", DataType::Int64, false), SlotId::new(2)),
        ]))
    }

    fn chunk(rows: &[(i64, i64)]) -> Chunk {
        let batch = RecordBatch::try_new(
            payload_schema(),
            vec![
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))),
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.1))),
            ],
        )
        .expect("batch");
        Chunk::try_new(batch).expect("chunk")
    }

    #[test]
    fn merge_event_sorts_bins_and_fires_callbacks() {
        let spec = PartitionSpec::new(payload_schema(), vec![0], vec![]).with_num_bins(4);
        let gpart = Arc::new(PartitionGlobalState::new(spec));
        let mut local = gpart.local_state();
        local
            .sink(chunk(&[(1, 10), (2, 20), (1, 30), (3, 5)]))
            .expect("sink");
        local.combine().expect("combine");

        let event = gpart.prepare_merge().expect("prepare merge");
        let sorted_bins = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sorted_bins);
        let pool = ThreadPool::new(2);
        event
            .run(
                &pool,
                Arc::clone(&gpart),
                Arc::new(move |_bin| {
                    counter.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                }),
            )
            .expect("merge");

        let populated: usize = (0..gpart.num_bins())
            .filter(|&b| gpart.hash_group_count(b).is_some())
            .count();
        assert_eq!(populated, sorted_bins.load(Ordering::Acquire));
        let total: usize = (0..gpart.num_bins())
            .filter_map(|b| gpart.hash_group_count(b))
            .sum();
        assert_eq!(total, 4);
    }
}
