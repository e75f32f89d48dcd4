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

use arrow::array::{ArrayRef, Float64Builder, Int64Builder};

use crate::exec::window::executors::{MaskCursor, WindowExecutorGlobalState};
use crate::exec::window::spec::WindowFuncKind;

/// Ranking family: computed purely from the boundary masks, no payload.
pub(crate) fn evaluate(
    kind: &WindowFuncKind,
    position: usize,
    len: usize,
    gstate: &WindowExecutorGlobalState,
    cursor: &mut MaskCursor,
) -> Result<ArrayRef, String> {
    match kind {
        WindowFuncKind::RowNumber => {
            let mut b = Int64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                b.append_value((row - cursor.partition_start + 1) as i64);
            }
            Ok(Arc::new(b.finish()))
        }
        WindowFuncKind::Rank => {
            let mut b = Int64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                b.append_value(cursor.rank());
            }
            Ok(Arc::new(b.finish()))
        }
        WindowFuncKind::DenseRank => {
            let mut b = Int64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                b.append_value(cursor.dense_rank);
            }
            Ok(Arc::new(b.finish()))
        }
        WindowFuncKind::PercentRank => {
            let mut b = Float64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let size = cursor.partition_size() as f64;
                let v = if size > 1.0 {
                    (cursor.rank() as f64 - 1.0) / (size - 1.0)
                } else {
                    0.0
                };
                b.append_value(v);
            }
            Ok(Arc::new(b.finish()))
        }
        WindowFuncKind::CumeDist => {
            let mut b = Float64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let size = cursor.partition_size() as f64;
                let v = (cursor.peer_end - cursor.partition_start) as f64 / size;
                b.append_value(v);
            }
            Ok(Arc::new(b.finish()))
        }
        WindowFuncKind::Ntile { buckets } => {
            let buckets = *buckets as i64;
            let mut b = Int64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let n = cursor.partition_size() as i64;
                let small_bucket_size = n / buckets;
                let large_bucket_size = small_bucket_size + 1;
                let num_large_buckets = n % buckets;
                let num_large_bucket_rows = num_large_buckets * large_bucket_size;
                let pos = (row - cursor.partition_start) as i64;
                let id = if pos < num_large_bucket_rows {
                    pos / large_bucket_size + 1
                } else {
                    (pos - num_large_bucket_rows) / small_bucket_size + num_large_buckets + 1
                };
                b.append_value(id);
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(format!(
            "internal error: {:?} is not a ranking window function",
            other
        )),
    }
}
