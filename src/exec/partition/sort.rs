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
//! Per-bin sorting and boundary-mask computation.
//!
//! Responsibilities:
//! - Sorts one bin's buffered chunks by partition keys then order keys and pages the
//!   result into row/heap blocks.
//! - Computes partition/order boundary bitmaps over the sorted run, then drops the
//!   retained key scratch.
//!
//! Key exported interfaces:
//! - Types: `HashPartition`, `SortedRun`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arrow::array::{Array, ArrayRef, RecordBatch};
use arrow::compute::{concat_batches, lexsort_to_indices, take, SortColumn, SortOptions};
use arrow::datatypes::{DataType, TimeUnit};
use arrow_buffer::BooleanBufferBuilder;

use crate::exec::chunk::Chunk;
use crate::exec::partition::sink::PartitionSpec;
use crate::exec::rows::{RowBlockCollection, RowLayout};

/// The paged output of one bin sort: fixed-width row blocks plus heap blocks
/// with matching boundaries.
pub struct SortedRun {
    pub data_blocks: RowBlockCollection,
    pub heap_blocks: RowBlockCollection,
}

/// One sorted bin, ready for mask computation and materialization.
///
/// The sorted key columns are retained only until `compute_masks` has run;
/// they are scratch the consumer has no further use for.
pub struct HashPartition {
    pub bin: usize,
    pub count: usize,
    pub external: bool,
    num_partition_cols: usize,
    sorted: Option<SortedRun>,
    sort_keys: Mutex<Option<Vec<ArrayRef>>>,
}

impl HashPartition {
    /// Populate the partition mask and one order mask per requested arity.
    /// Bit 0 is always a boundary; bit `i` is set when the first `k` sort
    /// columns differ between rows `i-1` and `i` (with `k` the partition
    /// arity for the partition mask, the map key for each order mask).
    pub fn compute_masks(
        &self,
        partition_mask: &mut BooleanBufferBuilder,
        order_masks: &mut HashMap<usize, BooleanBufferBuilder>,
    ) -> Result<(), String> {
        let keys = self
            .sort_keys
            .lock()
            .expect("sort keys lock")
            .take()
            .ok_or_else(|| "internal error: boundary masks computed twice".to_string())?;

        if self.count == 0 {
            return Ok(());
        }
        partition_mask.set_bit(0, true);
        for mask in order_masks.values_mut() {
            mask.set_bit(0, true);
        }

        for i in 1..self.count {
            // Index of the first sort column that differs between adjacent rows.
            let mut first_diff = keys.len();
            for (k, col) in keys.iter().enumerate() {
                if !value_equal_or_both_null(col.as_ref(), i - 1, i)? {
                    first_diff = k;
                    break;
                }
            }
            if first_diff < self.num_partition_cols {
                partition_mask.set_bit(i, true);
            }
            for (&arity, mask) in order_masks.iter_mut() {
                if first_diff < arity {
                    mask.set_bit(i, true);
                }
            }
        }
        Ok(())
    }

    /// Move the sorted run out for materialization.
    pub fn take_sorted(&mut self) -> Option<SortedRun> {
        self.sorted.take()
    }
}

/// Sort one bin's buffered chunks. Returns `None` for an empty bin.
pub(crate) fn sort_bin_chunks(
    spec: &PartitionSpec,
    layout: &Arc<RowLayout>,
    bin: usize,
    chunks: Vec<Chunk>,
) -> Result<Option<HashPartition>, String> {
    if chunks.is_empty() {
        return Ok(None);
    }
    let schema = chunks[0].schema();
    let batches: Vec<RecordBatch> = chunks.into_iter().map(|c| c.batch).collect();
    let batch = concat_batches(&schema, batches.iter())
        .map_err(|e| format!("concat bin {}: {}", bin, e))?;
    let count = batch.num_rows();
    if count == 0 {
        return Ok(None);
    }

    let key_columns: Vec<(usize, SortOptions)> = spec
        .partition_cols
        .iter()
        .map(|&col| {
            (
                col,
                SortOptions {
                    descending: false,
                    nulls_first: true,
                },
            )
        })
        .chain(spec.order_keys.iter().map(|key| {
            (
                key.column,
                SortOptions {
                    descending: key.descending,
                    nulls_first: key.nulls_first,
                },
            )
        }))
        .collect();

    let sort_columns: Vec<SortColumn> = key_columns
        .iter()
        .map(|(col, options)| SortColumn {
            values: Arc::clone(batch.column(*col)),
            options: Some(*options),
        })
        .collect();
    let indices = lexsort_to_indices(&sort_columns, None)
        .map_err(|e| format!("sort bin {}: {}", bin, e))?;
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("reorder bin {}: {}", bin, e))?;
    let sorted = RecordBatch::try_new(batch.schema(), columns)
        .map_err(|e| format!("sorted bin {} batch: {}", bin, e))?;

    let sort_keys: Vec<ArrayRef> = key_columns
        .iter()
        .map(|(col, _)| Arc::clone(sorted.column(*col)))
        .collect();

    // Page the sorted run into blocks; heap blocks share row-block boundaries.
    let mut data_blocks = RowBlockCollection::new(layout.row_schema(), spec.block_rows, false);
    let mut heap_blocks = RowBlockCollection::new(layout.heap_schema(), spec.block_rows, false);
    let mut offset = 0;
    while offset < count {
        let take_rows = spec.block_rows.min(count - offset);
        let slice = sorted.slice(offset, take_rows);
        let (row_part, heap_part) = layout.split(&slice)?;
        data_blocks.append_block(row_part);
        if let Some(heap_part) = heap_part {
            heap_blocks.append_block(heap_part);
        }
        offset += take_rows;
    }

    Ok(Some(HashPartition {
        bin,
        count,
        external: spec.external,
        num_partition_cols: spec.partition_cols.len(),
        sorted: Some(SortedRun {
            data_blocks,
            heap_blocks,
        }),
        sort_keys: Mutex::new(Some(sort_keys)),
    }))
}

pub(crate) fn value_equal_or_both_null(
    array: &dyn Array,
    left: usize,
    right: usize,
) -> Result<bool, String> {
    if array.is_null(left) && array.is_null(right) {
        return Ok(true);
    }
    if array.is_null(left) || array.is_null(right) {
        return Ok(false);
    }
    match array.data_type() {
        DataType::Boolean => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::BooleanArray>()
                .ok_or_else(|| "failed to downcast BooleanArray".to_string())?;
            Ok(a.value(left) == a.value(right))
        }
        DataType::Int32 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Int32Array>()
                .ok_or_else(|| "failed to downcast Int32Array".to_string())?;
            Ok(a.value(left) == a.value(right))
        }
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Int64Array>()
                .ok_or_else(|| "failed to downcast Int64Array".to_string())?;
            Ok(a.value(left) == a.value(right))
        }
        DataType::UInt32 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::UInt32Array>()
                .ok_or_else(|| "failed to downcast UInt32Array".to_string())?;
            Ok(a.value(left) == a.value(right))
        }
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Float64Array>()
                .ok_or_else(|| "failed to downcast Float64Array".to_string())?;
            Ok(a.value(left).to_bits() == a.value(right).to_bits())
        }
        DataType::Utf8 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::StringArray>()
                .ok_or_else(|| "failed to downcast StringArray".to_string())?;
            Ok(a.value(left) == a.value(right))
        }
        DataType::Date32 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Date32Array>()
                .ok_or_else(|| "failed to downcast Date32Array".to_string())?;
            Ok(a.value(left) == a.value(right))
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::TimestampMicrosecondArray>()
                .ok_or_else(|| "failed to downcast TimestampMicrosecondArray".to_string())?;
            Ok(a.value(left) == a.value(right))
        }
        other => Err(format!("unsupported key type for equality: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::exec::partition::sink::SortKeySpec;
    use arrow::array::Int64Array;
    use arrow::datatypes::{Field, Schema, SchemaRef};
    use arrow_buffer::BooleanBufferBuilder;

    fn payload_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            field_with_slot_id(Field::new("p", DataType::Int64, false), SlotId::new(1)),
            field_with_slot_id(Field::new("o", DataType::Int64, false), SlotId::new(2)),
            field_with_slot_id(Field::new("x", DataType::Int64, false), SlotId::new(3)),
        ]))
    }

    fn chunk(rows: &[(i64, i64, i64)]) -> Chunk {
        let batch = RecordBatch::try_new(
            payload_schema(),
            vec![
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))),
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.1))),
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.2))),
            ],
        )
        .expect("batch");
        Chunk::try_new(batch).expect("chunk")
    }

    fn all_invalid(count: usize) -> BooleanBufferBuilder {
        let mut b = BooleanBufferBuilder::new(count);
        b.append_n(count, false);
        b
    }

    #[test]
    fn sort_bin_orders_rows_and_marks_boundaries() {
        let spec = PartitionSpec::new(payload_schema(), vec![0], vec![SortKeySpec::asc(1)])
            .with_block_rows(2);
        let layout = Arc::new(RowLayout::new(spec.payload_schema.clone()));
        let chunks = vec![
            chunk(&[(2, 1, 5), (1, 2, 20)]),
            chunk(&[(1, 1, 10), (1, 2, 15)]),
        ];
        let partition =
            sort_bin_chunks(&spec, &layout, 0, chunks).expect("sort").expect("non-empty");
        assert_eq!(partition.count, 4);

        let mut pmask = all_invalid(4);
        let mut order_masks = HashMap::new();
        order_masks.insert(2usize, all_invalid(4));
        partition
            .compute_masks(&mut pmask, &mut order_masks)
            .expect("masks");

        // Sorted order: (1,1) (1,2) (1,2) (2,1) — partition boundary at 0 and 3.
        let pmask = pmask.finish();
        assert!(pmask.value(0));
        assert!(!pmask.value(1));
        assert!(!pmask.value(2));
        assert!(pmask.value(3));

        // Arity 2 boundaries: peer groups (1,1) | (1,2),(1,2) | (2,1).
        let omask = order_masks.remove(&2).expect("arity 2").finish();
        assert!(omask.value(0));
        assert!(omask.value(1));
        assert!(!omask.value(2));
        assert!(omask.value(3));

        // Scratch is consumed: a second computation is an internal error.
        let mut pmask2 = all_invalid(4);
        let mut order_masks2 = HashMap::new();
        assert!(partition
            .compute_masks(&mut pmask2, &mut order_masks2)
            .is_err());
    }

    #[test]
    fn key_equality_covers_every_hashable_type() {
        // Any type the sink can hash into a bin must also compare at mask
        // computation.
        let ts = arrow::array::TimestampMicrosecondArray::from(vec![
            Some(1_000_000),
            Some(1_000_000),
            Some(2_000_000),
            None,
        ]);
        assert!(value_equal_or_both_null(&ts, 0, 1).expect("equal timestamps"));
        assert!(!value_equal_or_both_null(&ts, 1, 2).expect("distinct timestamps"));
        assert!(!value_equal_or_both_null(&ts, 2, 3).expect("null vs value"));
    }

    #[test]
    fn sorted_run_pages_into_block_rows() {
        let spec = PartitionSpec::new(payload_schema(), vec![0], vec![]).with_block_rows(2);
        let layout = Arc::new(RowLayout::new(spec.payload_schema.clone()));
        let chunks = vec![chunk(&[(1, 1, 1), (1, 2, 2), (1, 3, 3), (1, 4, 4), (1, 5, 5)])];
        let mut partition =
            sort_bin_chunks(&spec, &layout, 3, chunks).expect("sort").expect("non-empty");
        let run = partition.take_sorted().expect("sorted run");
        assert_eq!(run.data_blocks.blocks.len(), 3);
        assert_eq!(run.data_blocks.count, 5);
        assert!(run.heap_blocks.blocks.is_empty());
        assert!(partition.take_sorted().is_none());
    }
}
