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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;

/// One fixed-capacity block of rows. The payload batch sits behind a mutex so
/// a flushing scanner can release it as soon as the final pass is done with
/// the block.
pub struct RowBlock {
    capacity: usize,
    count: usize,
    data: Mutex<Option<RecordBatch>>,
    swizzled: AtomicBool,
}

impl RowBlock {
    fn new(batch: RecordBatch, capacity: usize) -> Self {
        let count = batch.num_rows();
        Self {
            capacity,
            count,
            data: Mutex::new(Some(batch)),
            swizzled: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Snapshot the block payload for scanning. `None` once flushed.
    pub fn batch(&self) -> Option<RecordBatch> {
        self.data.lock().expect("row block lock").clone()
    }

    /// Take the payload out, releasing the block memory. Used by the flushing
    /// scan path once a block has been fully consumed.
    pub fn take_batch(&self) -> Option<RecordBatch> {
        self.data.lock().expect("row block lock").take()
    }

    /// Mark the block as swizzled (prepared for paging out). External scans
    /// assume every fully-sunk block has been marked.
    pub fn swizzle(&self) {
        self.swizzled.store(true, Ordering::Release);
    }

    pub fn is_swizzled(&self) -> bool {
        self.swizzled.load(Ordering::Acquire)
    }
}

/// An ordered collection of row blocks sharing one schema.
pub struct RowBlockCollection {
    schema: SchemaRef,
    block_capacity: usize,
    keep_pinned: bool,
    pub blocks: Vec<Arc<RowBlock>>,
    pub count: usize,
}

impl RowBlockCollection {
    pub fn new(schema: SchemaRef, block_capacity: usize, keep_pinned: bool) -> Self {
        Self {
            schema,
            block_capacity: block_capacity.max(1),
            keep_pinned,
            blocks: Vec::new(),
            count: 0,
        }
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn block_capacity(&self) -> usize {
        self.block_capacity
    }

    pub fn keep_pinned(&self) -> bool {
        self.keep_pinned
    }

    /// A new collection with the same shape and no blocks.
    pub fn clone_empty(&self, keep_pinned: bool) -> Self {
        Self::new(Arc::clone(&self.schema), self.block_capacity, keep_pinned)
    }

    /// Append a batch, topping off the trailing partial block and splitting
    /// the remainder into capacity-sized blocks.
    pub fn append_batch(&mut self, batch: RecordBatch) -> Result<(), String> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let mut offset = 0;
        let total = batch.num_rows();

        if let Some(last) = self.blocks.last() {
            let room = last.capacity.saturating_sub(last.count);
            if room > 0 {
                let take = room.min(total);
                let tail = batch.slice(offset, take);
                let last = self.blocks.pop().expect("non-empty blocks");
                let existing = last
                    .batch()
                    .ok_or_else(|| "internal error: append into a flushed block".to_string())?;
                let merged = concat_batches(&self.schema, [&existing, &tail])
                    .map_err(|e| format!("merge row block: {}", e))?;
                self.blocks
                    .push(Arc::new(RowBlock::new(merged, self.block_capacity)));
                offset += take;
            }
        }

        while offset < total {
            let take = self.block_capacity.min(total - offset);
            let slice = batch.slice(offset, take);
            self.blocks
                .push(Arc::new(RowBlock::new(slice, self.block_capacity)));
            offset += take;
        }
        self.count += total;
        Ok(())
    }

    /// Append a batch as exactly one block, whatever its size. Used where the
    /// producer controls block boundaries (sorted runs, heap pages).
    pub fn append_block(&mut self, batch: RecordBatch) {
        if batch.num_rows() == 0 {
            return;
        }
        self.count += batch.num_rows();
        let capacity = self.block_capacity.max(batch.num_rows());
        self.blocks.push(Arc::new(RowBlock::new(batch, capacity)));
    }

    /// Number of rows stored in blocks preceding `block_idx`.
    pub fn prefix_rows(&self, block_idx: usize) -> usize {
        self.blocks[..block_idx.min(self.blocks.len())]
            .iter()
            .map(|b| b.count())
            .sum()
    }
}

/// Rebuild `dst_heap` so heap block `i` covers exactly the row range of row
/// block `i`. The ingest path pages heap data on its own boundaries, so the
/// two collections disagree until the scan layout is fixed up here. Row
/// blocks are shared into `dst_rows` unchanged.
pub fn align_heap_blocks(
    dst_rows: &mut RowBlockCollection,
    dst_heap: &mut RowBlockCollection,
    src_rows: &RowBlockCollection,
    src_heap: &RowBlockCollection,
) -> Result<(), String> {
    if src_heap.count != src_rows.count {
        return Err(format!(
            "internal error: heap/row cardinality mismatch: {} vs {}",
            src_heap.count, src_rows.count
        ));
    }

    for block in &src_rows.blocks {
        dst_rows.blocks.push(Arc::clone(block));
    }
    dst_rows.count = src_rows.count;

    if src_heap.blocks.is_empty() {
        return Ok(());
    }

    let heap_batches: Vec<RecordBatch> = src_heap
        .blocks
        .iter()
        .map(|b| {
            b.batch()
                .ok_or_else(|| "internal error: aligning a flushed heap block".to_string())
        })
        .collect::<Result<_, _>>()?;
    let heap_refs: Vec<&RecordBatch> = heap_batches.iter().collect();
    let schema = src_heap.schema();
    let merged =
        concat_batches(&schema, heap_refs).map_err(|e| format!("merge heap blocks: {}", e))?;

    let mut offset = 0;
    for block in &src_rows.blocks {
        let slice = merged.slice(offset, block.count());
        dst_heap.append_block(slice);
        offset += block.count();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn int_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("v", DataType::Int64, false),
            SlotId::new(1),
        )]))
    }

    fn str_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("s", DataType::Utf8, false),
            SlotId::new(2),
        )]))
    }

    fn int_batch(values: std::ops::Range<i64>) -> RecordBatch {
        RecordBatch::try_new(
            int_schema(),
            vec![Arc::new(Int64Array::from_iter_values(values))],
        )
        .expect("int batch")
    }

    #[test]
    fn append_batch_splits_on_capacity_and_tops_off() {
        let mut coll = RowBlockCollection::new(int_schema(), 4, false);
        coll.append_batch(int_batch(0..6)).expect("append 6");
        assert_eq!(coll.blocks.len(), 2);
        assert_eq!(coll.blocks[0].count(), 4);
        assert_eq!(coll.blocks[1].count(), 2);

        coll.append_batch(int_batch(6..9)).expect("append 3");
        assert_eq!(coll.count, 9);
        assert_eq!(coll.blocks.len(), 3);
        assert_eq!(coll.blocks[1].count(), 4);
        assert_eq!(coll.blocks[2].count(), 1);
        assert_eq!(coll.prefix_rows(2), 8);
    }

    #[test]
    fn align_heap_blocks_matches_row_boundaries() {
        let mut rows = RowBlockCollection::new(int_schema(), 3, false);
        rows.append_batch(int_batch(0..7)).expect("append rows");

        // Heap pages on its own boundaries: 5 + 2.
        let mut heap = RowBlockCollection::new(str_schema(), 16, false);
        let words: Vec<String> = (0..7).map(|i| format!("w{i}")).collect();
        let first = StringArray::from_iter_values(words[..5].iter());
        let second = StringArray::from_iter_values(words[5..].iter());
        heap.append_block(
            RecordBatch::try_new(str_schema(), vec![Arc::new(first)]).expect("heap 1"),
        );
        heap.append_block(
            RecordBatch::try_new(str_schema(), vec![Arc::new(second)]).expect("heap 2"),
        );

        let mut dst_rows = rows.clone_empty(false);
        let mut dst_heap = heap.clone_empty(false);
        align_heap_blocks(&mut dst_rows, &mut dst_heap, &rows, &heap).expect("align");

        assert_eq!(dst_rows.blocks.len(), dst_heap.blocks.len());
        for (r, h) in dst_rows.blocks.iter().zip(dst_heap.blocks.iter()) {
            assert_eq!(r.count(), h.count());
        }
        let last = dst_heap.blocks[2].batch().expect("heap batch");
        let col = last
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8");
        assert_eq!(col.value(0), "w6");
    }

    #[test]
    fn take_batch_releases_block_payload() {
        let mut coll = RowBlockCollection::new(int_schema(), 8, false);
        coll.append_batch(int_batch(0..3)).expect("append");
        let block = Arc::clone(&coll.blocks[0]);
        assert!(block.batch().is_some());
        assert!(block.take_batch().is_some());
        assert!(block.batch().is_none());
        // Count survives the flush; only the payload is gone.
        assert_eq!(block.count(), 3);
    }
}
