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
//! Sink side of the partition subsystem.
//!
//! Responsibilities:
//! - Routes sunk rows into hash bins by partition-key hash, or buffers them raw
//!   when the operator has neither partition nor order keys.
//! - Merges per-worker buffers into operator-wide state on combine.
//!
//! Key exported interfaces:
//! - Types: `PartitionSpec`, `SortKeySpec`, `PartitionGlobalState`, `PartitionLocalState`.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::{Array, ArrayRef, UInt32Builder};
use arrow::compute::take;
use arrow::datatypes::{DataType, SchemaRef, TimeUnit};
use hashbrown::DefaultHashBuilder;

use crate::common::config;
use crate::exec::chunk::Chunk;
use crate::exec::partition::merge::{MergeTask, PartitionMergeEvent};
use crate::exec::partition::sort::HashPartition;
use crate::exec::rows::{align_heap_blocks, RowBlockCollection, RowLayout};
use crate::gale_logging::debug;

/// One ORDER BY key: payload column index plus direction.
#[derive(Clone, Copy, Debug)]
pub struct SortKeySpec {
    pub column: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKeySpec {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            descending: false,
            nulls_first: true,
        }
    }
}

/// Shape of the partitioned sink: payload schema, keys, and paging knobs.
#[derive(Clone)]
pub struct PartitionSpec {
    pub payload_schema: SchemaRef,
    pub partition_cols: Vec<usize>,
    pub order_keys: Vec<SortKeySpec>,
    pub num_bins: usize,
    pub block_rows: usize,
    pub chunk_rows: usize,
    pub external: bool,
}

impl PartitionSpec {
    pub fn new(
        payload_schema: SchemaRef,
        partition_cols: Vec<usize>,
        order_keys: Vec<SortKeySpec>,
    ) -> Self {
        Self {
            payload_schema,
            partition_cols,
            order_keys,
            num_bins: config::window_partition_bins(),
            block_rows: config::window_block_rows(),
            chunk_rows: config::exec_chunk_size(),
            external: config::window_force_external(),
        }
    }

    pub fn with_num_bins(mut self, num_bins: usize) -> Self {
        self.num_bins = num_bins.max(1).next_power_of_two();
        self
    }

    pub fn with_block_rows(mut self, block_rows: usize) -> Self {
        self.block_rows = block_rows.max(1);
        self
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    pub fn with_external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    /// Neither partition nor order keys: rows are kept raw, in arrival order.
    pub fn is_unsorted(&self) -> bool {
        self.partition_cols.is_empty() && self.order_keys.is_empty()
    }

    /// Number of hash bins actually used. A sort without partition keys is a
    /// single unhashed bin.
    pub fn effective_bins(&self) -> usize {
        if self.partition_cols.is_empty() {
            1
        } else {
            self.num_bins.max(1).next_power_of_two()
        }
    }
}

struct PartitionBuffers {
    bins: Vec<Vec<Chunk>>,
    rows: Option<RowBlockCollection>,
    strings: Option<RowBlockCollection>,
    merge_prepared: bool,
}

/// Operator-wide partitioned sink state. Workers sink through
/// [`PartitionLocalState`] and merge via [`PartitionGlobalState::combine`].
pub struct PartitionGlobalState {
    spec: PartitionSpec,
    layout: Arc<RowLayout>,
    hasher: DefaultHashBuilder,
    count: AtomicUsize,
    buffers: Mutex<PartitionBuffers>,
    hash_groups: Mutex<Vec<Option<HashPartition>>>,
}

impl PartitionGlobalState {
    pub fn new(spec: PartitionSpec) -> Self {
        let layout = Arc::new(RowLayout::new(Arc::clone(&spec.payload_schema)));
        let bins = vec![Vec::new(); spec.effective_bins()];
        Self {
            spec,
            layout,
            hasher: DefaultHashBuilder::default(),
            count: AtomicUsize::new(0),
            buffers: Mutex::new(PartitionBuffers {
                bins,
                rows: None,
                strings: None,
                merge_prepared: false,
            }),
            hash_groups: Mutex::new(Vec::new()),
        }
    }

    pub fn spec(&self) -> &PartitionSpec {
        &self.spec
    }

    pub fn layout(&self) -> Arc<RowLayout> {
        Arc::clone(&self.layout)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn external(&self) -> bool {
        self.spec.external
    }

    pub fn local_state(self: &Arc<Self>) -> PartitionLocalState {
        PartitionLocalState {
            gpart: Arc::clone(self),
            bins: vec![Vec::new(); self.spec.effective_bins()],
            raw: Vec::new(),
            sunk_rows: 0,
        }
    }

    /// Merge a worker's buffered rows into the global state.
    pub fn combine(&self, local: PartitionLocalState) -> Result<(), String> {
        let mut guard = self.buffers.lock().expect("partition buffers lock");
        if self.spec.is_unsorted() {
            let rows = guard.rows.get_or_insert_with(|| {
                RowBlockCollection::new(self.layout.row_schema(), self.spec.block_rows, false)
            });
            let mut heap_parts = Vec::new();
            for chunk in &local.raw {
                let (row_part, heap_part) = self.layout.split(&chunk.batch)?;
                rows.append_batch(row_part)?;
                if let Some(heap_part) = heap_part {
                    heap_parts.push(heap_part);
                }
            }
            if self.layout.has_heap() {
                let strings = guard.strings.get_or_insert_with(|| {
                    RowBlockCollection::new(self.layout.heap_schema(), self.spec.block_rows, false)
                });
                // Heap pages on combine granularity; scan alignment happens later.
                for heap_part in heap_parts {
                    strings.append_block(heap_part);
                }
            }
        } else {
            for (bin, mut chunks) in local.bins.into_iter().enumerate() {
                guard.bins[bin].append(&mut chunks);
            }
        }
        self.count.fetch_add(local.sunk_rows, Ordering::AcqRel);
        Ok(())
    }

    /// Whether the raw (unsorted, unhashed) collection was materialized.
    pub fn has_rows(&self) -> bool {
        self.buffers
            .lock()
            .expect("partition buffers lock")
            .rows
            .is_some()
    }

    pub fn rows_block_count(&self) -> usize {
        self.buffers
            .lock()
            .expect("partition buffers lock")
            .rows
            .as_ref()
            .map(|r| r.blocks.len())
            .unwrap_or(0)
    }

    /// Any buffered bins left to sort?
    pub fn has_merge_tasks(&self) -> bool {
        self.buffers
            .lock()
            .expect("partition buffers lock")
            .bins
            .iter()
            .any(|b| !b.is_empty())
    }

    /// Take the buffered bins and turn them into one sort task per non-empty
    /// bin. Also sizes the sorted-partition slots (the merge-begin hook).
    pub fn prepare_merge(&self) -> Result<PartitionMergeEvent, String> {
        let mut guard = self.buffers.lock().expect("partition buffers lock");
        if guard.merge_prepared {
            return Err("internal error: partition merge prepared twice".to_string());
        }
        guard.merge_prepared = true;
        let mut tasks = Vec::new();
        for (bin, chunks) in guard.bins.iter_mut().enumerate() {
            if chunks.is_empty() {
                continue;
            }
            tasks.push(MergeTask {
                bin,
                chunks: std::mem::take(chunks),
            });
        }
        drop(guard);

        let mut slots = self.hash_groups.lock().expect("hash groups lock");
        slots.resize_with(self.spec.effective_bins(), || None);
        drop(slots);

        debug!("partition merge prepared: {} sort task(s)", tasks.len());
        Ok(PartitionMergeEvent::new(tasks))
    }

    pub(crate) fn store_hash_group(&self, bin: usize, group: HashPartition) {
        let mut slots = self.hash_groups.lock().expect("hash groups lock");
        slots[bin] = Some(group);
    }

    pub fn num_bins(&self) -> usize {
        self.spec.effective_bins()
    }

    /// Row count of the sorted partition at `bin`, if one exists.
    pub fn hash_group_count(&self, bin: usize) -> Option<usize> {
        let slots = self.hash_groups.lock().expect("hash groups lock");
        slots.get(bin).and_then(|s| s.as_ref()).map(|g| g.count)
    }

    /// Move the sorted partition out of its slot. The caller takes ownership
    /// of the sort output.
    pub fn take_hash_group(&self, bin: usize) -> Option<HashPartition> {
        let mut slots = self.hash_groups.lock().expect("hash groups lock");
        slots.get_mut(bin).and_then(|s| s.take())
    }

    /// Clone-empty + align the raw collections for single-partition scanning.
    /// Returns `(rows, heap)` sharing the raw row blocks, with heap blocks
    /// re-chunked onto row-block boundaries.
    pub fn align_raw_collections(
        &self,
    ) -> Result<(RowBlockCollection, RowBlockCollection), String> {
        let guard = self.buffers.lock().expect("partition buffers lock");
        let src_rows = guard
            .rows
            .as_ref()
            .ok_or_else(|| "internal error: no raw row collection".to_string())?;
        let mut dst_rows = src_rows.clone_empty(src_rows.keep_pinned());
        let mut dst_heap = match guard.strings.as_ref() {
            Some(strings) => strings.clone_empty(strings.keep_pinned()),
            None => RowBlockCollection::new(self.layout.heap_schema(), self.spec.block_rows, false),
        };
        if self.layout.has_heap() {
            let src_heap = guard
                .strings
                .as_ref()
                .ok_or_else(|| "internal error: no raw heap collection".to_string())?;
            align_heap_blocks(&mut dst_rows, &mut dst_heap, src_rows, src_heap)?;
        } else {
            for block in &src_rows.blocks {
                dst_rows.blocks.push(Arc::clone(block));
            }
            dst_rows.count = src_rows.count;
        }
        Ok((dst_rows, dst_heap))
    }

    pub(crate) fn bin_of_row(&self, cols: &[ArrayRef], row: usize) -> Result<usize, String> {
        let mask = self.spec.effective_bins() - 1;
        let mut hasher = self.hasher.build_hasher();
        for col in cols {
            hash_value_into(col, row, &mut hasher)?;
        }
        Ok((hasher.finish() as usize) & mask)
    }
}

/// Per-worker sink buffers. Rows are routed to bins locally; the global state
/// sees them only at combine.
pub struct PartitionLocalState {
    gpart: Arc<PartitionGlobalState>,
    bins: Vec<Vec<Chunk>>,
    raw: Vec<Chunk>,
    sunk_rows: usize,
}

impl PartitionLocalState {
    pub fn sink(&mut self, chunk: Chunk) -> Result<(), String> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.sunk_rows += chunk.len();

        let spec = self.gpart.spec();
        if spec.is_unsorted() {
            self.raw.push(chunk);
            return Ok(());
        }
        if spec.partition_cols.is_empty() {
            // Sorting without hashing: everything lands in the single bin.
            self.bins[0].push(chunk);
            return Ok(());
        }

        let key_cols: Vec<ArrayRef> = spec
            .partition_cols
            .iter()
            .map(|&i| Arc::clone(&chunk.columns()[i]))
            .collect();

        let rows = chunk.len();
        let mut row_bins = Vec::with_capacity(rows);
        for row in 0..rows {
            row_bins.push(self.gpart.bin_of_row(&key_cols, row)?);
        }

        for bin in 0..spec.effective_bins() {
            let mut indices = UInt32Builder::with_capacity(rows);
            for (row, &b) in row_bins.iter().enumerate() {
                if b == bin {
                    indices.append_value(row as u32);
                }
            }
            let indices = indices.finish();
            if indices.is_empty() {
                continue;
            }
            let columns: Vec<ArrayRef> = chunk
                .columns()
                .iter()
                .map(|col| take(col.as_ref(), &indices, None))
                .collect::<Result<_, _>>()
                .map_err(|e| format!("partition take: {}", e))?;
            let batch = arrow::array::RecordBatch::try_new(chunk.schema(), columns)
                .map_err(|e| format!("partition batch: {}", e))?;
            self.bins[bin].push(Chunk::try_new(batch)?);
        }
        Ok(())
    }

    pub fn combine(self) -> Result<(), String> {
        let gpart = Arc::clone(&self.gpart);
        gpart.combine(self)
    }
}

fn hash_value_into(array: &ArrayRef, row: usize, hasher: &mut impl Hasher) -> Result<(), String> {
    if array.is_null(row) {
        hasher.write_u8(0);
        return Ok(());
    }
    hasher.write_u8(1);
    match array.data_type() {
        DataType::Boolean => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::BooleanArray>()
                .ok_or_else(|| "failed to downcast BooleanArray".to_string())?;
            a.value(row).hash(hasher);
        }
        DataType::Int32 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Int32Array>()
                .ok_or_else(|| "failed to downcast Int32Array".to_string())?;
            // Widen so int32 and int64 keys of equal value co-locate.
            i64::from(a.value(row)).hash(hasher);
        }
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Int64Array>()
                .ok_or_else(|| "failed to downcast Int64Array".to_string())?;
            a.value(row).hash(hasher);
        }
        DataType::UInt32 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::UInt32Array>()
                .ok_or_else(|| "failed to downcast UInt32Array".to_string())?;
            i64::from(a.value(row)).hash(hasher);
        }
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Float64Array>()
                .ok_or_else(|| "failed to downcast Float64Array".to_string())?;
            a.value(row).to_bits().hash(hasher);
        }
        DataType::Utf8 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::StringArray>()
                .ok_or_else(|| "failed to downcast StringArray".to_string())?;
            a.value(row).hash(hasher);
        }
        DataType::Date32 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Date32Array>()
                .ok_or_else(|| "failed to downcast Date32Array".to_string())?;
            a.value(row).hash(hasher);
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::TimestampMicrosecondArray>()
                .ok_or_else(|| "failed to downcast TimestampMicrosecondArray".to_string())?;
            a.value(row).hash(hasher);
        }
        other => {
            return Err(format!("unsupported partition key type for hashing: {:?}", other));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{Field, Schema};

    fn payload_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("p", DataType::Int64, false), SlotId::new(1)),
            field_with_slot_id(Field::new("x", DataType::Int64, false), SlotId::new(2)),
        ]))
    }

    fn chunk(pairs: &[(i64, i64)]) -> Chunk {
        let batch = RecordBatch::try_new(
            payload_schema(),
            vec![
                Arc::new(Int64Array::from_iter_values(pairs.iter().map(|p| p.0))),
                Arc::new(Int64Array::from_iter_values(pairs.iter().map(|p| p.1))),
            ],
        )
        .expect("batch");
        Chunk::try_new(batch).expect("chunk")
    }

    #[test]
    fn equal_keys_land_in_the_same_bin() {
        let spec = PartitionSpec::new(payload_schema(), vec![0], vec![]).with_num_bins(8);
        let gpart = Arc::new(PartitionGlobalState::new(spec));
        let c = chunk(&[(1, 10), (2, 20), (1, 30)]);
        let keys = vec![Arc::clone(&c.columns()[0])];
        let b0 = gpart.bin_of_row(&keys, 0).expect("bin");
        let b2 = gpart.bin_of_row(&keys, 2).expect("bin");
        assert_eq!(b0, b2);
    }

    #[test]
    fn combine_accumulates_counts_and_bins() {
        let spec = PartitionSpec::new(payload_schema(), vec![0], vec![]).with_num_bins(4);
        let gpart = Arc::new(PartitionGlobalState::new(spec));
        let mut local = gpart.local_state();
        local.sink(chunk(&[(1, 10), (2, 20), (1, 30)])).expect("sink");
        local.combine().expect("combine");

        assert_eq!(gpart.count(), 3);
        assert!(gpart.has_merge_tasks());
        assert!(!gpart.has_rows());
    }

    #[test]
    fn unsorted_spec_materializes_raw_rows_on_combine() {
        let spec = PartitionSpec::new(payload_schema(), vec![], vec![]).with_block_rows(2);
        let gpart = Arc::new(PartitionGlobalState::new(spec));
        let mut local = gpart.local_state();
        local.sink(chunk(&[(1, 10), (2, 20), (3, 30)])).expect("sink");
        local.combine().expect("combine");

        assert!(gpart.has_rows());
        assert_eq!(gpart.rows_block_count(), 2);
        assert!(!gpart.has_merge_tasks());
    }
}
