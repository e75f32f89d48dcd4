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
use std::sync::Arc;

use arrow::array::RecordBatch;

use crate::exec::chunk::Chunk;
use crate::exec::rows::collection::{RowBlock, RowBlockCollection};
use crate::exec::rows::layout::RowLayout;

/// Cursor over one row block (and its aligned heap block), emitting payload
/// chunks of at most `chunk_rows` rows.
///
/// `scanned()` reports collection-relative offsets so executor sinks can use
/// it directly as the group row position of the next chunk. The flushing
/// variant releases the block payload once the block is exhausted.
pub struct RowBlockScanner {
    row_block: Arc<RowBlock>,
    heap_block: Option<Arc<RowBlock>>,
    row_batch: RecordBatch,
    heap_batch: Option<RecordBatch>,
    layout: Arc<RowLayout>,
    chunk_rows: usize,
    base: usize,
    total: usize,
    offset: usize,
    external: bool,
    flush: bool,
    keep_pinned: bool,
}

impl RowBlockScanner {
    pub fn new(
        rows: &RowBlockCollection,
        heap: Option<&RowBlockCollection>,
        layout: Arc<RowLayout>,
        chunk_rows: usize,
        external: bool,
        block_idx: usize,
        flush: bool,
    ) -> Result<Self, String> {
        let row_block = rows
            .blocks
            .get(block_idx)
            .cloned()
            .ok_or_else(|| format!("internal error: row block {} out of range", block_idx))?;
        let row_batch = row_block
            .batch()
            .ok_or_else(|| format!("internal error: row block {} already flushed", block_idx))?;

        let (heap_block, heap_batch) = if layout.has_heap() {
            let heap = heap.ok_or_else(|| {
                "internal error: layout has heap columns but no heap collection".to_string()
            })?;
            let heap_block = heap.blocks.get(block_idx).cloned().ok_or_else(|| {
                format!("internal error: unaligned heap block {}", block_idx)
            })?;
            if heap_block.count() != row_block.count() {
                return Err(format!(
                    "internal error: heap block {} holds {} rows, row block holds {}",
                    block_idx,
                    heap_block.count(),
                    row_block.count()
                ));
            }
            let heap_batch = heap_block.batch().ok_or_else(|| {
                format!("internal error: heap block {} already flushed", block_idx)
            })?;
            (Some(heap_block), Some(heap_batch))
        } else {
            (None, None)
        };

        Ok(Self {
            row_block,
            heap_block,
            row_batch,
            heap_batch,
            layout,
            chunk_rows: chunk_rows.max(1),
            base: rows.prefix_rows(block_idx),
            total: rows.count,
            offset: 0,
            external,
            flush,
            keep_pinned: rows.keep_pinned(),
        })
    }

    /// Collection-relative row offset of the next chunk to be scanned.
    pub fn scanned(&self) -> usize {
        self.base + self.offset
    }

    /// Total rows in the owning collection.
    pub fn count(&self) -> usize {
        self.total
    }

    /// Rows left in this block.
    pub fn remaining(&self) -> usize {
        self.row_block.count() - self.offset
    }

    pub fn scan(&mut self) -> Result<Option<Chunk>, String> {
        let remaining = self.remaining();
        if remaining == 0 {
            self.maybe_flush();
            return Ok(None);
        }
        let take = remaining.min(self.chunk_rows);
        let row_slice = self.row_batch.slice(self.offset, take);
        let heap_slice = self.heap_batch.as_ref().map(|b| b.slice(self.offset, take));
        self.offset += take;
        if self.remaining() == 0 {
            self.maybe_flush();
        }
        let batch = self.layout.assemble(&row_slice, heap_slice.as_ref())?;
        Chunk::try_new(batch).map(Some)
    }

    /// Mark the scanned block as prepared for paging. Meaningful only on the
    /// external path; a no-op otherwise.
    pub fn swizzle_block(&self) {
        if !self.external {
            return;
        }
        self.row_block.swizzle();
        if let Some(heap_block) = &self.heap_block {
            heap_block.swizzle();
        }
    }

    fn maybe_flush(&self) {
        if !self.flush || self.keep_pinned {
            return;
        }
        self.row_block.take_batch();
        if let Some(heap_block) = &self.heap_block {
            heap_block.take_batch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

    fn int_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("v", DataType::Int64, false),
            SlotId::new(1),
        )]))
    }

    fn collection(rows: i64, block_capacity: usize) -> RowBlockCollection {
        let mut coll = RowBlockCollection::new(int_schema(), block_capacity, false);
        let batch = RecordBatch::try_new(
            int_schema(),
            vec![Arc::new(Int64Array::from_iter_values(0..rows))],
        )
        .expect("batch");
        coll.append_batch(batch).expect("append");
        coll
    }

    #[test]
    fn scanner_reports_collection_relative_offsets() {
        let coll = collection(10, 4);
        let layout = Arc::new(RowLayout::new(int_schema()));
        let mut scanner =
            RowBlockScanner::new(&coll, None, layout, 3, false, 1, false).expect("scanner");

        assert_eq!(scanner.count(), 10);
        assert_eq!(scanner.scanned(), 4);
        assert_eq!(scanner.remaining(), 4);

        let first = scanner.scan().expect("scan").expect("chunk");
        assert_eq!(first.len(), 3);
        assert_eq!(scanner.scanned(), 7);

        let second = scanner.scan().expect("scan").expect("chunk");
        assert_eq!(second.len(), 1);
        assert_eq!(scanner.remaining(), 0);
        assert!(scanner.scan().expect("scan").is_none());

        // Non-flushing scans leave the block payload in place.
        assert!(coll.blocks[1].batch().is_some());
    }

    #[test]
    fn flushing_scanner_releases_exhausted_blocks() {
        let coll = collection(4, 4);
        let layout = Arc::new(RowLayout::new(int_schema()));
        let mut scanner =
            RowBlockScanner::new(&coll, None, layout, 8, true, 0, true).expect("scanner");

        let chunk = scanner.scan().expect("scan").expect("chunk");
        assert_eq!(chunk.len(), 4);
        assert!(coll.blocks[0].batch().is_none());

        scanner.swizzle_block();
        assert!(coll.blocks[0].is_swizzled());
    }
}
