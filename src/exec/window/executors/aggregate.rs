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
//! Aggregate window functions over the default frame.
//!
//! The frame of row `r` is `[partition_start(r), peer_end(r))`. An expression
//! without ORDER BY keys reads an order mask whose boundaries are exactly the
//! partition starts, which widens the frame to the whole partition with no
//! special casing here.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Builder, Int64Builder};
use arrow::datatypes::DataType;

use crate::exec::window::executors::{BuiltState, MaskCursor, WindowExecutorGlobalState};
use crate::exec::window::spec::AggKind;

/// Frame accumulators built once per group at finalize. Sums and counts are
/// prefix arrays; min/max are running values that reset at partition starts,
/// which is enough because the frame start is pinned to the partition start.
pub(crate) enum AggAccumulator {
    CountStar,
    Count { non_null: Vec<i64> },
    SumInt { sums: Vec<i128>, non_null: Vec<i64> },
    SumFloat { sums: Vec<f64>, non_null: Vec<i64> },
    MinMaxInt { best: Vec<Option<i64>> },
    MinMaxFloat { best: Vec<Option<f64>> },
}

pub(crate) fn build_accumulator(
    kind: AggKind,
    values: &[ArrayRef],
    gstate: &WindowExecutorGlobalState,
) -> Result<AggAccumulator, String> {
    let count = gstate.count;
    if values.is_empty() {
        if kind == AggKind::Count {
            return Ok(AggAccumulator::CountStar);
        }
        return Err("internal error: aggregate window function without an argument".to_string());
    }
    let value = &values[0];
    if value.len() != count {
        return Err(format!(
            "internal error: assembled payload holds {} rows, group holds {}",
            value.len(),
            count
        ));
    }

    match kind {
        AggKind::Count => {
            let mut non_null = vec![0i64; count + 1];
            for i in 0..count {
                non_null[i + 1] = non_null[i] + if value.is_null(i) { 0 } else { 1 };
            }
            Ok(AggAccumulator::Count { non_null })
        }
        AggKind::Sum | AggKind::Avg => match value.data_type() {
            DataType::Int32 | DataType::Int64 => {
                let mut sums = vec![0i128; count + 1];
                let mut non_null = vec![0i64; count + 1];
                for i in 0..count {
                    let (d, n) = if value.is_null(i) {
                        (0, 0)
                    } else {
                        (scalar_i64(value.as_ref(), i)? as i128, 1)
                    };
                    sums[i + 1] = sums[i] + d;
                    non_null[i + 1] = non_null[i] + n;
                }
                Ok(AggAccumulator::SumInt { sums, non_null })
            }
            DataType::Float64 => {
                let mut sums = vec![0f64; count + 1];
                let mut non_null = vec![0i64; count + 1];
                for i in 0..count {
                    let (d, n) = if value.is_null(i) {
                        (0.0, 0)
                    } else {
                        (scalar_f64(value.as_ref(), i)?, 1)
                    };
                    sums[i + 1] = sums[i] + d;
                    non_null[i + 1] = non_null[i] + n;
                }
                Ok(AggAccumulator::SumFloat { sums, non_null })
            }
            other => Err(format!(
                "unsupported sum/avg window argument type: {:?}",
                other
            )),
        },
        AggKind::Min | AggKind::Max => {
            let minimum = kind == AggKind::Min;
            match value.data_type() {
                DataType::Int32 | DataType::Int64 => {
                    let mut best = vec![None; count];
                    let mut current: Option<i64> = None;
                    for i in 0..count {
                        if gstate.partition_mask.value(i) {
                            current = None;
                        }
                        if !value.is_null(i) {
                            let v = scalar_i64(value.as_ref(), i)?;
                            current = Some(match current {
                                Some(c) if minimum => c.min(v),
                                Some(c) => c.max(v),
                                None => v,
                            });
                        }
                        best[i] = current;
                    }
                    Ok(AggAccumulator::MinMaxInt { best })
                }
                DataType::Float64 => {
                    let mut best = vec![None; count];
                    let mut current: Option<f64> = None;
                    for i in 0..count {
                        if gstate.partition_mask.value(i) {
                            current = None;
                        }
                        if !value.is_null(i) {
                            let v = scalar_f64(value.as_ref(), i)?;
                            current = Some(match current {
                                Some(c) if minimum => c.min(v),
                                Some(c) => c.max(v),
                                None => v,
                            });
                        }
                        best[i] = current;
                    }
                    Ok(AggAccumulator::MinMaxFloat { best })
                }
                other => Err(format!(
                    "unsupported min/max window argument type: {:?}",
                    other
                )),
            }
        }
    }
}

pub(crate) fn evaluate(
    kind: AggKind,
    position: usize,
    len: usize,
    gstate: &WindowExecutorGlobalState,
    cursor: &mut MaskCursor,
    built: &BuiltState,
) -> Result<ArrayRef, String> {
    let acc = built
        .acc
        .as_ref()
        .ok_or_else(|| "internal error: aggregate evaluated without accumulator".to_string())?;

    match (kind, acc) {
        (AggKind::Count, AggAccumulator::CountStar) => {
            let mut b = Int64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                b.append_value((cursor.peer_end - cursor.partition_start) as i64);
            }
            Ok(Arc::new(b.finish()))
        }
        (AggKind::Count, AggAccumulator::Count { non_null }) => {
            let mut b = Int64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                b.append_value(non_null[cursor.peer_end] - non_null[cursor.partition_start]);
            }
            Ok(Arc::new(b.finish()))
        }
        (AggKind::Sum, AggAccumulator::SumInt { sums, non_null }) => {
            let mut b = Int64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let (s, e) = (cursor.partition_start, cursor.peer_end);
                if non_null[e] - non_null[s] == 0 {
                    b.append_null();
                } else {
                    let sum = sums[e] - sums[s];
                    let sum: i64 = sum
                        .try_into()
                        .map_err(|_| "sum window aggregate overflow".to_string())?;
                    b.append_value(sum);
                }
            }
            Ok(Arc::new(b.finish()))
        }
        (AggKind::Sum, AggAccumulator::SumFloat { sums, non_null }) => {
            let mut b = Float64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let (s, e) = (cursor.partition_start, cursor.peer_end);
                if non_null[e] - non_null[s] == 0 {
                    b.append_null();
                } else {
                    b.append_value(sums[e] - sums[s]);
                }
            }
            Ok(Arc::new(b.finish()))
        }
        (AggKind::Avg, AggAccumulator::SumInt { sums, non_null }) => {
            let mut b = Float64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let (s, e) = (cursor.partition_start, cursor.peer_end);
                let n = non_null[e] - non_null[s];
                if n == 0 {
                    b.append_null();
                } else {
                    b.append_value((sums[e] - sums[s]) as f64 / n as f64);
                }
            }
            Ok(Arc::new(b.finish()))
        }
        (AggKind::Avg, AggAccumulator::SumFloat { sums, non_null }) => {
            let mut b = Float64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let (s, e) = (cursor.partition_start, cursor.peer_end);
                let n = non_null[e] - non_null[s];
                if n == 0 {
                    b.append_null();
                } else {
                    b.append_value((sums[e] - sums[s]) / n as f64);
                }
            }
            Ok(Arc::new(b.finish()))
        }
        (AggKind::Min | AggKind::Max, AggAccumulator::MinMaxInt { best }) => {
            let mut b = Int64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                match best[cursor.peer_end - 1] {
                    Some(v) => b.append_value(v),
                    None => b.append_null(),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        (AggKind::Min | AggKind::Max, AggAccumulator::MinMaxFloat { best }) => {
            let mut b = Float64Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                match best[cursor.peer_end - 1] {
                    Some(v) => b.append_value(v),
                    None => b.append_null(),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        _ => Err("internal error: aggregate kind does not match its accumulator".to_string()),
    }
}

fn scalar_i64(array: &dyn Array, row: usize) -> Result<i64, String> {
    match array.data_type() {
        DataType::Int32 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Int32Array>()
                .ok_or_else(|| "failed to downcast Int32Array".to_string())?;
            Ok(i64::from(a.value(row)))
        }
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Int64Array>()
                .ok_or_else(|| "failed to downcast Int64Array".to_string())?;
            Ok(a.value(row))
        }
        other => Err(format!("expected integer array, got {:?}", other)),
    }
}

fn scalar_f64(array: &dyn Array, row: usize) -> Result<f64, String> {
    match array.data_type() {
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<arrow::array::Float64Array>()
                .ok_or_else(|| "failed to downcast Float64Array".to_string())?;
            Ok(a.value(row))
        }
        other => Err(format!("expected float array, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_buffer::{BooleanBuffer, BooleanBufferBuilder};
    use std::sync::Mutex;

    fn mask(bits: &[bool]) -> BooleanBuffer {
        let mut b = BooleanBufferBuilder::new(bits.len());
        for &bit in bits {
            b.append(bit);
        }
        b.finish()
    }

    fn gstate(pbits: &[bool], obits: &[bool]) -> WindowExecutorGlobalState {
        WindowExecutorGlobalState {
            count: pbits.len(),
            partition_mask: mask(pbits),
            order_mask: mask(obits),
            payload: None,
            built: Mutex::new(None),
        }
    }

    fn ints(array: &ArrayRef) -> Vec<Option<i64>> {
        let a = array
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 array");
        (0..a.len())
            .map(|i| (!a.is_null(i)).then(|| a.value(i)))
            .collect()
    }

    #[test]
    fn running_sum_accumulates_over_peer_groups() {
        // Partitions [0,2) and [2,3); every row its own peer group.
        let g = gstate(&[true, false, true], &[true, true, true]);
        let values: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![10, 20, 5]))];
        let acc = build_accumulator(AggKind::Sum, &values, &g).expect("accumulator");
        let built = BuiltState {
            values,
            acc: Some(acc),
        };
        let mut cursor = MaskCursor::default();
        let out = evaluate(AggKind::Sum, 0, 3, &g, &mut cursor, &built).expect("sum");
        assert_eq!(ints(&out), vec![Some(10), Some(30), Some(5)]);
    }

    #[test]
    fn sum_without_order_keys_covers_the_partition() {
        // Order mask equals the partition mask: whole-partition frames.
        let g = gstate(&[true, false, true], &[true, false, true]);
        let values: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![10, 20, 5]))];
        let acc = build_accumulator(AggKind::Sum, &values, &g).expect("accumulator");
        let built = BuiltState {
            values,
            acc: Some(acc),
        };
        let mut cursor = MaskCursor::default();
        let out = evaluate(AggKind::Sum, 0, 3, &g, &mut cursor, &built).expect("sum");
        assert_eq!(ints(&out), vec![Some(30), Some(30), Some(5)]);
    }

    #[test]
    fn count_star_and_min_handle_frames_and_nulls() {
        let g = gstate(&[true, false, false], &[true, true, true]);
        let out = {
            let built = BuiltState {
                values: Vec::new(),
                acc: Some(AggAccumulator::CountStar),
            };
            let mut cursor = MaskCursor::default();
            evaluate(AggKind::Count, 0, 3, &g, &mut cursor, &built).expect("count(*)")
        };
        assert_eq!(ints(&out), vec![Some(1), Some(2), Some(3)]);

        let values: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![
            None,
            Some(7),
            Some(3),
        ]))];
        let acc = build_accumulator(AggKind::Min, &values, &g).expect("accumulator");
        let built = BuiltState {
            values,
            acc: Some(acc),
        };
        let mut cursor = MaskCursor::default();
        let out = evaluate(AggKind::Min, 0, 3, &g, &mut cursor, &built).expect("min");
        assert_eq!(ints(&out), vec![None, Some(7), Some(3)]);
    }
}
