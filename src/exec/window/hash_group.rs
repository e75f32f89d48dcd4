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
//! One sorted partition's materialized rows plus window execution state.
//!
//! Responsibilities:
//! - Owns the sorted row/heap blocks, the boundary masks, and the per-expression
//!   function global states of one hash group.
//! - Derives the group's processing stage from its atomic progress counters.
//!
//! Key exported interfaces:
//! - Types: `WindowHashGroup`, `WindowGroupStage`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow_buffer::{BooleanBuffer, BooleanBufferBuilder};

use crate::exec::partition::PartitionGlobalState;
use crate::exec::rows::{RowBlockCollection, RowBlockScanner, RowLayout};
use crate::exec::window::executors::{WindowExecutor, WindowExecutorGlobalState};
use crate::gale_logging::debug;

/// The processing stage of a hash group. Stages advance strictly
/// `Sink < Finalize < GetData`; `Done` is reached once the last task
/// referencing the group has finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowGroupStage {
    Sink,
    Finalize,
    GetData,
    Done,
}

type ExecutorGlobalStates = Arc<Vec<Arc<WindowExecutorGlobalState>>>;

/// One hash partition, materialized and sorted, with everything the three
/// executor passes need.
pub struct WindowHashGroup {
    bin: usize,
    count: usize,
    blocks: usize,
    chunk_rows: usize,
    external: bool,
    rows: Option<RowBlockCollection>,
    heap: Option<RowBlockCollection>,
    layout: Arc<RowLayout>,
    partition_mask: BooleanBuffer,
    order_masks: HashMap<usize, BooleanBuffer>,
    /// Lazily-built function global states, guarded for first-touch
    /// construction.
    gestates: Mutex<Option<ExecutorGlobalStates>>,
    /// Rows that have completed the sink pass.
    pub sunk: AtomicUsize,
    /// Blocks that have completed the finalize pass.
    pub finalized: AtomicUsize,
    /// Tasks still referencing this group; the 1→0 transition releases it.
    pub tasks_remaining: AtomicUsize,
    /// Starting batch index for ordered output.
    batch_base: AtomicUsize,
}

impl WindowHashGroup {
    /// Build the group for `bin` from the partition subsystem's state.
    ///
    /// There are three kinds of partition:
    /// 1. no partition and no sort: the single raw collection (bin 0);
    /// 2. one partition (sorting without hashing);
    /// 3. multiple partitions (sorting and hashing).
    pub fn new(
        gpart: &PartitionGlobalState,
        arities: &[usize],
        bin: usize,
    ) -> Result<Self, String> {
        let layout = gpart.layout();
        let chunk_rows = gpart.spec().chunk_rows;

        let hashed_count = gpart.hash_group_count(bin);
        let count = if let Some(count) = hashed_count {
            count
        } else if bin == 0 && gpart.has_rows() {
            gpart.count()
        } else {
            // Empty bin: nothing to materialize, nothing to schedule.
            return Ok(Self::empty(bin, layout, chunk_rows));
        };

        // Masks start all-invalid, one order mask per distinct key arity.
        let mut partition_mask = all_invalid(count);
        let mut order_masks: HashMap<usize, BooleanBufferBuilder> = HashMap::new();
        for &arity in arities {
            order_masks.entry(arity).or_insert_with(|| all_invalid(count));
        }

        let external;
        let rows;
        let heap;
        if hashed_count.is_none() {
            // Single unhashed partition: one boundary at row zero.
            if count > 0 {
                partition_mask.set_bit(0, true);
                for mask in order_masks.values_mut() {
                    mask.set_bit(0, true);
                }
            }
            // Align the heap pages with the row blocks; unhashed data always
            // takes the paged scan path.
            let (aligned_rows, aligned_heap) = gpart.align_raw_collections()?;
            rows = Some(aligned_rows);
            heap = Some(aligned_heap);
            external = true;
        } else {
            let mut partition = gpart
                .take_hash_group(bin)
                .ok_or_else(|| format!("internal error: hash group {} taken twice", bin))?;
            partition.compute_masks(&mut partition_mask, &mut order_masks)?;
            external = partition.external;
            let (data, heap_blocks) = materialize_sorted_data(&layout, &mut partition)?;
            rows = Some(data);
            heap = Some(heap_blocks);
        }

        let blocks = rows.as_ref().map(|r| r.blocks.len()).unwrap_or(0);
        debug!(
            "window hash group {}: {} row(s) in {} block(s), external={}",
            bin, count, blocks, external
        );

        Ok(Self {
            bin,
            count,
            blocks,
            chunk_rows,
            external,
            rows,
            heap,
            layout,
            partition_mask: partition_mask.finish(),
            order_masks: order_masks
                .into_iter()
                .map(|(arity, mut mask)| (arity, mask.finish()))
                .collect(),
            gestates: Mutex::new(None),
            sunk: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
            tasks_remaining: AtomicUsize::new(0),
            batch_base: AtomicUsize::new(0),
        })
    }

    fn empty(bin: usize, layout: Arc<RowLayout>, chunk_rows: usize) -> Self {
        Self {
            bin,
            count: 0,
            blocks: 0,
            chunk_rows,
            external: false,
            rows: None,
            heap: None,
            layout,
            partition_mask: all_invalid(0).finish(),
            order_masks: HashMap::new(),
            gestates: Mutex::new(None),
            sunk: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
            tasks_remaining: AtomicUsize::new(0),
            batch_base: AtomicUsize::new(0),
        }
    }

    pub fn bin(&self) -> usize {
        self.bin
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn external(&self) -> bool {
        self.external
    }

    pub fn batch_base(&self) -> usize {
        self.batch_base.load(Ordering::Relaxed)
    }

    /// Assigned once, single-threaded, before any source task runs.
    pub fn set_batch_base(&self, base: usize) {
        self.batch_base.store(base, Ordering::Relaxed);
    }

    /// Derive the group's stage from its progress counters.
    pub fn stage(&self) -> WindowGroupStage {
        let mut result = WindowGroupStage::Sink;
        if self.sunk.load(Ordering::Acquire) == self.count {
            result = WindowGroupStage::Finalize;
        }
        if self.finalized.load(Ordering::Acquire) == self.blocks {
            result = WindowGroupStage::GetData;
            if self.tasks_remaining.load(Ordering::Acquire) == 0 {
                result = WindowGroupStage::Done;
            }
        }
        result
    }

    /// First-touch construction of the function global states. The states can
    /// be large, so they are deferred until a worker actually reaches the
    /// group. Idempotent: later callers get the same vector.
    pub fn initialize(
        &self,
        executors: &[WindowExecutor],
    ) -> Result<ExecutorGlobalStates, String> {
        let mut guard = self.gestates.lock().expect("gestates lock");
        if let Some(gestates) = guard.as_ref() {
            return Ok(Arc::clone(gestates));
        }
        let mut gestates = Vec::with_capacity(executors.len());
        for executor in executors {
            let arity = executor.spec().key_arity();
            let order_mask = self.order_masks.get(&arity).ok_or_else(|| {
                format!("internal error: no order mask for key arity {}", arity)
            })?;
            gestates.push(executor.create_global(
                self.count,
                self.partition_mask.clone(),
                order_mask.clone(),
            ));
        }
        let gestates = Arc::new(gestates);
        *guard = Some(Arc::clone(&gestates));
        Ok(gestates)
    }

    /// Scan a block during the build (sink) pass: non-flushing.
    pub fn build_scanner(&self, block_idx: usize) -> Result<Option<RowBlockScanner>, String> {
        let Some(rows) = &self.rows else {
            return Ok(None);
        };
        RowBlockScanner::new(
            rows,
            self.heap.as_ref(),
            Arc::clone(&self.layout),
            self.chunk_rows,
            self.external,
            block_idx,
            false,
        )
        .map(Some)
    }

    /// Scan a block during the evaluate (output) pass: the second pass can
    /// flush each block as it drains.
    pub fn evaluate_scanner(&self, block_idx: usize) -> Result<RowBlockScanner, String> {
        let rows = self
            .rows
            .as_ref()
            .ok_or_else(|| "internal error: evaluate scan on an empty group".to_string())?;
        RowBlockScanner::new(
            rows,
            self.heap.as_ref(),
            Arc::clone(&self.layout),
            self.chunk_rows,
            self.external,
            block_idx,
            true,
        )
    }
}

fn all_invalid(count: usize) -> BooleanBufferBuilder {
    let mut builder = BooleanBufferBuilder::new(count);
    builder.append_n(count, false);
    builder
}

/// Move the sort output into scan collections. The sorted run is exactly one
/// block set; heap blocks are optional but the scan wants both, so a missing
/// heap becomes an empty collection. Taking the heap releases the sort state
/// entirely.
fn materialize_sorted_data(
    layout: &Arc<RowLayout>,
    partition: &mut crate::exec::partition::HashPartition,
) -> Result<(RowBlockCollection, RowBlockCollection), String> {
    let run = partition
        .take_sorted()
        .ok_or_else(|| "internal error: sorted run materialized twice".to_string())?;
    let data = run.data_blocks;
    let heap = if run.heap_blocks.blocks.is_empty() {
        RowBlockCollection::new(layout.heap_schema(), data.block_capacity(), false)
    } else {
        run.heap_blocks
    };
    Ok((data, heap))
}
