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
//! Value-navigation window functions: lead/lag and first/last/nth value.
//!
//! All of them resolve to row indices into the assembled argument column and
//! finish with one `take`, which keeps them generic over the value type.

use std::sync::Arc;

use arrow::array::{new_null_array, Array, ArrayRef, BooleanBuilder, Scalar, UInt32Builder};
use arrow::compute::kernels::zip::zip;
use arrow::compute::{cast, take};
use arrow::datatypes::DataType;

use crate::exec::window::executors::{BuiltState, MaskCursor, WindowExecutorGlobalState};
use crate::exec::window::spec::WindowFuncKind;

pub(crate) fn evaluate(
    kind: &WindowFuncKind,
    position: usize,
    len: usize,
    gstate: &WindowExecutorGlobalState,
    cursor: &mut MaskCursor,
    built: &BuiltState,
) -> Result<ArrayRef, String> {
    let value = built
        .values
        .first()
        .ok_or_else(|| "internal error: value window function without payload".to_string())?;

    match kind {
        WindowFuncKind::LeadLag {
            lag,
            offset,
            default,
        } => {
            let step = i64::try_from(*offset)
                .map_err(|_| "lead/lag offset out of range".to_string())?;
            let mut indices = UInt32Builder::with_capacity(len);
            let mut use_default = BooleanBuilder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let target = if *lag {
                    row as i64 - step
                } else {
                    row as i64 + step
                };
                if target >= cursor.partition_start as i64 && target < cursor.partition_end as i64
                {
                    indices.append_value(target as u32);
                    use_default.append_value(false);
                } else {
                    indices.append_null();
                    use_default.append_value(default.is_some());
                }
            }
            let indices = indices.finish();
            let taken =
                take(value.as_ref(), &indices, None).map_err(|e| e.to_string())?;

            let Some(default) = default else {
                return Ok(taken);
            };
            let default = normalize_default(default, value.data_type())?;
            let mask = use_default.finish();
            let scalar = Scalar::new(default);
            zip(&mask, &scalar, &taken).map_err(|e| e.to_string())
        }
        WindowFuncKind::FirstValue => {
            let mut indices = UInt32Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                indices.append_value(cursor.partition_start as u32);
            }
            take(value.as_ref(), &indices.finish(), None).map_err(|e| e.to_string())
        }
        WindowFuncKind::LastValue => {
            let mut indices = UInt32Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                indices.append_value((cursor.peer_end - 1) as u32);
            }
            take(value.as_ref(), &indices.finish(), None).map_err(|e| e.to_string())
        }
        WindowFuncKind::NthValue { n } => {
            let n = *n as usize;
            let mut indices = UInt32Builder::with_capacity(len);
            for row in position..position + len {
                cursor.update(row, gstate);
                let target = cursor.partition_start + (n - 1);
                if target < cursor.peer_end {
                    indices.append_value(target as u32);
                } else {
                    indices.append_null();
                }
            }
            take(value.as_ref(), &indices.finish(), None).map_err(|e| e.to_string())
        }
        other => Err(format!(
            "internal error: {:?} is not a value window function",
            other
        )),
    }
}

/// Bring the constant default onto the value type so the zip kernel sees a
/// single coherent type.
fn normalize_default(default: &ArrayRef, value_type: &DataType) -> Result<ArrayRef, String> {
    if default.len() != 1 {
        return Err(format!(
            "internal error: lead/lag default must be a single value, got {} rows",
            default.len()
        ));
    }
    if default.data_type() == value_type {
        return Ok(Arc::clone(default));
    }
    if matches!(default.data_type(), DataType::Null) {
        return Ok(new_null_array(value_type, 1));
    }
    cast(default.as_ref(), value_type).map_err(|e| {
        format!(
            "cast lead/lag default value from {:?} to {:?}: {}",
            default.data_type(),
            value_type,
            e
        )
    })
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

    fn built(values: Vec<i64>) -> BuiltState {
        BuiltState {
            values: vec![Arc::new(Int64Array::from(values)) as ArrayRef],
            acc: None,
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
    fn lag_stays_inside_the_partition() {
        // Partitions [0,2) and [2,4).
        let g = gstate(&[true, false, true, false], &[true, true, true, true]);
        let b = built(vec![10, 20, 30, 40]);
        let kind = WindowFuncKind::LeadLag {
            lag: true,
            offset: 1,
            default: None,
        };
        let mut cursor = MaskCursor::default();
        let out = evaluate(&kind, 0, 4, &g, &mut cursor, &b).expect("lag");
        assert_eq!(ints(&out), vec![None, Some(10), None, Some(30)]);
    }

    #[test]
    fn lead_applies_the_constant_default() {
        let g = gstate(&[true, false, false], &[true, true, true]);
        let b = built(vec![1, 2, 3]);
        let kind = WindowFuncKind::LeadLag {
            lag: false,
            offset: 2,
            default: Some(Arc::new(Int64Array::from(vec![-1])) as ArrayRef),
        };
        let mut cursor = MaskCursor::default();
        let out = evaluate(&kind, 0, 3, &g, &mut cursor, &b).expect("lead");
        assert_eq!(ints(&out), vec![Some(3), Some(-1), Some(-1)]);
    }

    #[test]
    fn first_last_and_nth_follow_the_default_frame() {
        // One partition, peers {0},{1,2}.
        let g = gstate(&[true, false, false], &[true, true, false]);
        let b = built(vec![7, 8, 9]);

        let mut cursor = MaskCursor::default();
        let first =
            evaluate(&WindowFuncKind::FirstValue, 0, 3, &g, &mut cursor, &b).expect("first");
        assert_eq!(ints(&first), vec![Some(7), Some(7), Some(7)]);

        let mut cursor = MaskCursor::default();
        let last = evaluate(&WindowFuncKind::LastValue, 0, 3, &g, &mut cursor, &b).expect("last");
        assert_eq!(ints(&last), vec![Some(7), Some(9), Some(9)]);

        let mut cursor = MaskCursor::default();
        let nth = evaluate(
            &WindowFuncKind::NthValue { n: 2 },
            0,
            3,
            &g,
            &mut cursor,
            &b,
        )
        .expect("nth");
        assert_eq!(ints(&nth), vec![None, Some(8), Some(8)]);
    }
}
