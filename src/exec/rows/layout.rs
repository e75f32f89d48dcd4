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

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions};
use arrow::datatypes::{DataType, Schema, SchemaRef};

/// Describes how payload columns split into the fixed-width row part and the
/// variable-length heap part. Row blocks and heap blocks are stored and paged
/// separately; a scanner uses the layout to reassemble payload chunks.
#[derive(Debug)]
pub struct RowLayout {
    payload_schema: SchemaRef,
    row_schema: SchemaRef,
    heap_schema: SchemaRef,
    row_indices: Vec<usize>,
    heap_indices: Vec<usize>,
}

fn is_heap_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Binary | DataType::LargeBinary
    )
}

impl RowLayout {
    pub fn new(payload_schema: SchemaRef) -> Self {
        let mut row_indices = Vec::new();
        let mut heap_indices = Vec::new();
        for (idx, field) in payload_schema.fields().iter().enumerate() {
            if is_heap_type(field.data_type()) {
                heap_indices.push(idx);
            } else {
                row_indices.push(idx);
            }
        }
        let row_fields: Vec<_> = row_indices
            .iter()
            .map(|&i| payload_schema.field(i).clone())
            .collect();
        let heap_fields: Vec<_> = heap_indices
            .iter()
            .map(|&i| payload_schema.field(i).clone())
            .collect();
        Self {
            payload_schema,
            row_schema: Arc::new(Schema::new(row_fields)),
            heap_schema: Arc::new(Schema::new(heap_fields)),
            row_indices,
            heap_indices,
        }
    }

    pub fn payload_schema(&self) -> SchemaRef {
        Arc::clone(&self.payload_schema)
    }

    pub fn row_schema(&self) -> SchemaRef {
        Arc::clone(&self.row_schema)
    }

    pub fn heap_schema(&self) -> SchemaRef {
        Arc::clone(&self.heap_schema)
    }

    pub fn has_heap(&self) -> bool {
        !self.heap_indices.is_empty()
    }

    /// Split a payload batch into its row part and, when the layout carries
    /// variable-length columns, its heap part.
    pub fn split(&self, batch: &RecordBatch) -> Result<(RecordBatch, Option<RecordBatch>), String> {
        let rows = self.project(batch, &self.row_indices, &self.row_schema)?;
        if !self.has_heap() {
            return Ok((rows, None));
        }
        let heap = self.project(batch, &self.heap_indices, &self.heap_schema)?;
        Ok((rows, Some(heap)))
    }

    /// Reassemble a payload batch from a row batch and an optional heap batch,
    /// restoring the original column order.
    pub fn assemble(
        &self,
        rows: &RecordBatch,
        heap: Option<&RecordBatch>,
    ) -> Result<RecordBatch, String> {
        let num_rows = rows.num_rows();
        if self.has_heap() {
            let heap = heap.ok_or_else(|| {
                "internal error: layout has heap columns but no heap batch was provided".to_string()
            })?;
            if heap.num_rows() != num_rows {
                return Err(format!(
                    "internal error: row/heap cardinality mismatch: {} vs {}",
                    num_rows,
                    heap.num_rows()
                ));
            }
        }
        let mut columns: Vec<Option<ArrayRef>> =
            vec![None; self.payload_schema.fields().len()];
        for (pos, &idx) in self.row_indices.iter().enumerate() {
            columns[idx] = Some(Arc::clone(rows.column(pos)));
        }
        if let Some(heap) = heap {
            for (pos, &idx) in self.heap_indices.iter().enumerate() {
                columns[idx] = Some(Arc::clone(heap.column(pos)));
            }
        }
        let columns: Vec<ArrayRef> = columns
            .into_iter()
            .map(|c| c.ok_or_else(|| "internal error: unassigned payload column".to_string()))
            .collect::<Result<_, _>>()?;
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        RecordBatch::try_new_with_options(self.payload_schema(), columns, &options)
            .map_err(|e| format!("assemble payload batch: {}", e))
    }

    fn project(
        &self,
        batch: &RecordBatch,
        indices: &[usize],
        schema: &SchemaRef,
    ) -> Result<RecordBatch, String> {
        let columns: Vec<ArrayRef> = indices
            .iter()
            .map(|&i| Arc::clone(batch.column(i)))
            .collect();
        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        RecordBatch::try_new_with_options(Arc::clone(schema), columns, &options)
            .map_err(|e| format!("project payload batch: {}", e))
    }
}
