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
//! Per-expression window function executors.
//!
//! Responsibilities:
//! - Implements the Sink → Finalize → Evaluate lifecycle driven by the hash-group
//!   scheduler, one executor per window expression.
//! - Collects sunk payload concurrently, assembles it once on finalize, and computes
//!   output columns from boundary masks plus the assembled payload.
//!
//! Key exported interfaces:
//! - Types: `WindowExecutor`, `WindowExecutorGlobalState`, `WindowExecutorLocalState`.

pub(crate) mod aggregate;
pub(crate) mod rank;
pub(crate) mod value;

use std::sync::{Arc, Mutex};

use arrow::array::{Array, ArrayRef};
use arrow::compute::concat;
use arrow_buffer::BooleanBuffer;

use crate::exec::chunk::Chunk;
use crate::exec::window::executors::aggregate::AggAccumulator;
use crate::exec::window::spec::{AggKind, WindowExprSpec, WindowFuncKind};

/// Function-wide state for one expression within one hash group. Shared by
/// all workers touching the group; the boundary masks are cheap shared views
/// whose backing store outlives every task of the group.
pub struct WindowExecutorGlobalState {
    pub(crate) count: usize,
    pub(crate) partition_mask: BooleanBuffer,
    pub(crate) order_mask: BooleanBuffer,
    payload: Option<PayloadCollector>,
    built: Mutex<Option<Arc<BuiltState>>>,
}

impl WindowExecutorGlobalState {
    pub(crate) fn built(&self) -> Result<Arc<BuiltState>, String> {
        self.built
            .lock()
            .expect("executor built lock")
            .clone()
            .ok_or_else(|| "internal error: evaluate before finalize".to_string())
    }
}

/// Chunk-grained payload collection. Sinks from different workers cover
/// disjoint row ranges, so ordering the parts by offset at assembly restores
/// the group row order.
struct PayloadCollector {
    parts: Mutex<Vec<(usize, Vec<ArrayRef>)>>,
}

impl PayloadCollector {
    fn new() -> Self {
        Self {
            parts: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, offset: usize, arrays: Vec<ArrayRef>) {
        self.parts.lock().expect("payload parts lock").push((offset, arrays));
    }

    fn assemble(&self, count: usize, num_args: usize) -> Result<Vec<ArrayRef>, String> {
        let mut parts = std::mem::take(&mut *self.parts.lock().expect("payload parts lock"));
        parts.sort_by_key(|(offset, _)| *offset);

        let mut covered = 0;
        for (offset, arrays) in &parts {
            if *offset != covered {
                return Err(format!(
                    "internal error: sink coverage gap at row {} (expected {})",
                    offset, covered
                ));
            }
            let len = arrays
                .first()
                .map(|a| a.len())
                .ok_or_else(|| "internal error: sunk part without arrays".to_string())?;
            covered += len;
        }
        if covered != count {
            return Err(format!(
                "internal error: sink covered {} of {} rows",
                covered, count
            ));
        }

        let mut values = Vec::with_capacity(num_args);
        for arg in 0..num_args {
            let slices: Vec<&dyn arrow::array::Array> =
                parts.iter().map(|(_, arrays)| arrays[arg].as_ref()).collect();
            let merged =
                concat(&slices).map_err(|e| format!("assemble window payload: {}", e))?;
            values.push(merged);
        }
        Ok(values)
    }
}

/// Output of finalize: assembled argument columns plus any aggregate
/// accumulator structures, all sized for the whole group.
pub(crate) struct BuiltState {
    pub(crate) values: Vec<ArrayRef>,
    pub(crate) acc: Option<AggAccumulator>,
}

/// Per-worker executor scratch: a streaming mask cursor plus a cached handle
/// on the finalized group state.
#[derive(Default)]
pub struct WindowExecutorLocalState {
    pub(crate) cursor: MaskCursor,
    pub(crate) built: Option<Arc<BuiltState>>,
}

/// One window expression's executor. Polymorphic over the kind tag; every
/// kind shares the `(create_global, create_local, sink, finalize, evaluate)`
/// lifecycle the scheduler drives.
pub struct WindowExecutor {
    spec: WindowExprSpec,
}

impl WindowExecutor {
    pub fn try_new(spec: WindowExprSpec) -> Result<Self, String> {
        let args = spec.args.len();
        match &spec.kind {
            WindowFuncKind::Aggregate(AggKind::Count) => {
                if args > 1 {
                    return Err(format!(
                        "internal error: count takes at most one argument, got {}",
                        args
                    ));
                }
            }
            WindowFuncKind::Aggregate(_) => {
                if args != 1 {
                    return Err(format!(
                        "internal error: aggregate window function takes one argument, got {}",
                        args
                    ));
                }
            }
            WindowFuncKind::RowNumber
            | WindowFuncKind::Rank
            | WindowFuncKind::DenseRank
            | WindowFuncKind::PercentRank
            | WindowFuncKind::CumeDist => {
                if args != 0 {
                    return Err(format!(
                        "internal error: ranking window function takes no arguments, got {}",
                        args
                    ));
                }
            }
            WindowFuncKind::Ntile { buckets } => {
                if *buckets == 0 {
                    return Err("internal error: ntile buckets must be positive".to_string());
                }
                if args != 0 {
                    return Err("internal error: ntile takes its bucket count as a constant".to_string());
                }
            }
            WindowFuncKind::LeadLag { .. }
            | WindowFuncKind::FirstValue
            | WindowFuncKind::LastValue => {
                if args != 1 {
                    return Err(format!(
                        "internal error: value window function takes one argument, got {}",
                        args
                    ));
                }
            }
            WindowFuncKind::NthValue { n } => {
                if *n == 0 {
                    return Err("internal error: nth_value position must be positive".to_string());
                }
                if args != 1 {
                    return Err(format!(
                        "internal error: nth_value takes one argument, got {}",
                        args
                    ));
                }
            }
        }
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &WindowExprSpec {
        &self.spec
    }

    fn needs_payload(&self) -> bool {
        match &self.spec.kind {
            WindowFuncKind::Aggregate(_) => !self.spec.args.is_empty(),
            WindowFuncKind::LeadLag { .. }
            | WindowFuncKind::FirstValue
            | WindowFuncKind::LastValue
            | WindowFuncKind::NthValue { .. } => true,
            _ => false,
        }
    }

    /// Allocate the function-wide state. Deferred to first use per group
    /// because the payload buffers can be large.
    pub fn create_global(
        &self,
        count: usize,
        partition_mask: BooleanBuffer,
        order_mask: BooleanBuffer,
    ) -> Arc<WindowExecutorGlobalState> {
        Arc::new(WindowExecutorGlobalState {
            count,
            partition_mask,
            order_mask,
            payload: self.needs_payload().then(PayloadCollector::new),
            built: Mutex::new(None),
        })
    }

    pub fn create_local(&self, _gstate: &WindowExecutorGlobalState) -> WindowExecutorLocalState {
        WindowExecutorLocalState::default()
    }

    /// Feed one payload chunk at group row `input_offset`. Safe to call from
    /// multiple workers on the same global state with disjoint offsets.
    pub fn sink(
        &self,
        chunk: &Chunk,
        input_offset: usize,
        _total_count: usize,
        gstate: &WindowExecutorGlobalState,
        _lstate: &mut WindowExecutorLocalState,
    ) -> Result<(), String> {
        if input_offset + chunk.len() > gstate.count {
            return Err(format!(
                "internal error: sink past the group: offset {} + {} > {}",
                input_offset,
                chunk.len(),
                gstate.count
            ));
        }
        let Some(payload) = &gstate.payload else {
            return Ok(());
        };
        let arrays: Vec<ArrayRef> = self
            .spec
            .args
            .iter()
            .map(|&i| {
                chunk
                    .columns()
                    .get(i)
                    .cloned()
                    .ok_or_else(|| format!("internal error: argument column {} out of range", i))
            })
            .collect::<Result<_, _>>()?;
        payload.push(input_offset, arrays);
        Ok(())
    }

    /// Close accumulation for the group. Idempotent; concurrent callers block
    /// until the first build completes, so on return the group is quiescent.
    pub fn finalize(
        &self,
        gstate: &WindowExecutorGlobalState,
        _lstate: &mut WindowExecutorLocalState,
    ) -> Result<(), String> {
        let mut guard = gstate.built.lock().expect("executor built lock");
        if guard.is_some() {
            return Ok(());
        }
        let values = match &gstate.payload {
            Some(payload) => payload.assemble(gstate.count, self.spec.args.len())?,
            None => Vec::new(),
        };
        let acc = match &self.spec.kind {
            WindowFuncKind::Aggregate(kind) => {
                Some(aggregate::build_accumulator(*kind, &values, gstate)?)
            }
            _ => None,
        };
        *guard = Some(Arc::new(BuiltState { values, acc }));
        Ok(())
    }

    /// Write this expression's output column for `input_chunk.len()` rows
    /// starting at group row `position`.
    pub fn evaluate(
        &self,
        position: usize,
        input_chunk: &Chunk,
        lstate: &mut WindowExecutorLocalState,
        gstate: &WindowExecutorGlobalState,
    ) -> Result<ArrayRef, String> {
        let len = input_chunk.len();
        match &self.spec.kind {
            WindowFuncKind::RowNumber
            | WindowFuncKind::Rank
            | WindowFuncKind::DenseRank
            | WindowFuncKind::PercentRank
            | WindowFuncKind::CumeDist
            | WindowFuncKind::Ntile { .. } => {
                rank::evaluate(&self.spec.kind, position, len, gstate, &mut lstate.cursor)
            }
            WindowFuncKind::Aggregate(kind) => {
                let built = cached_built(lstate, gstate)?;
                aggregate::evaluate(*kind, position, len, gstate, &mut lstate.cursor, &built)
            }
            WindowFuncKind::LeadLag { .. }
            | WindowFuncKind::FirstValue
            | WindowFuncKind::LastValue
            | WindowFuncKind::NthValue { .. } => {
                let built = cached_built(lstate, gstate)?;
                value::evaluate(
                    &self.spec.kind,
                    position,
                    len,
                    gstate,
                    &mut lstate.cursor,
                    &built,
                )
            }
        }
    }
}

fn cached_built(
    lstate: &mut WindowExecutorLocalState,
    gstate: &WindowExecutorGlobalState,
) -> Result<Arc<BuiltState>, String> {
    match &lstate.built {
        Some(built) => Ok(Arc::clone(built)),
        None => {
            let built = gstate.built()?;
            lstate.built = Some(Arc::clone(&built));
            Ok(built)
        }
    }
}

/// Largest set bit at or before `from`. Masks always carry bit 0.
pub(crate) fn prev_set_bit(mask: &BooleanBuffer, from: usize) -> usize {
    let mut i = from;
    loop {
        if mask.value(i) {
            return i;
        }
        if i == 0 {
            return 0;
        }
        i -= 1;
    }
}

/// Smallest set bit at or after `from`, or `count` when none is left.
pub(crate) fn next_set_bit(mask: &BooleanBuffer, from: usize, count: usize) -> usize {
    let mut i = from;
    while i < count {
        if mask.value(i) {
            return i;
        }
        i += 1;
    }
    count
}

/// Streaming view over the partition/order masks. Contiguous row access is
/// O(1) amortized; random access re-seeks by scanning the masks.
#[derive(Default)]
pub(crate) struct MaskCursor {
    valid: bool,
    next_row: usize,
    pub(crate) partition_start: usize,
    pub(crate) partition_end: usize,
    pub(crate) peer_start: usize,
    pub(crate) peer_end: usize,
    pub(crate) dense_rank: i64,
}

impl MaskCursor {
    pub(crate) fn update(&mut self, row: usize, gstate: &WindowExecutorGlobalState) {
        let pmask = &gstate.partition_mask;
        let omask = &gstate.order_mask;
        let count = gstate.count;

        if !self.valid || row != self.next_row {
            self.seek(row, gstate);
        } else if row >= self.partition_end {
            self.partition_start = row;
            self.partition_end = next_set_bit(pmask, row + 1, count);
            self.peer_start = row;
            self.peer_end = next_set_bit(omask, row + 1, count);
            self.dense_rank = 1;
        } else if row >= self.peer_end {
            self.peer_start = row;
            self.peer_end = next_set_bit(omask, row + 1, count);
            self.dense_rank += 1;
        }
        self.next_row = row + 1;
    }

    fn seek(&mut self, row: usize, gstate: &WindowExecutorGlobalState) {
        let pmask = &gstate.partition_mask;
        let omask = &gstate.order_mask;
        let count = gstate.count;

        self.partition_start = prev_set_bit(pmask, row);
        self.partition_end = next_set_bit(pmask, row + 1, count);
        self.peer_start = prev_set_bit(omask, row);
        self.peer_end = next_set_bit(omask, row + 1, count);
        let mut dense = 1;
        for i in (self.partition_start + 1)..=self.peer_start {
            if omask.value(i) {
                dense += 1;
            }
        }
        self.dense_rank = dense;
        self.valid = true;
    }

    pub(crate) fn rank(&self) -> i64 {
        (self.peer_start - self.partition_start + 1) as i64
    }

    pub(crate) fn partition_size(&self) -> usize {
        self.partition_end - self.partition_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_buffer::BooleanBufferBuilder;

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

    #[test]
    fn cursor_streams_over_partitions_and_peers() {
        // Two partitions: [0,3) with peers {0},{1,2}; [3,5) with peers {3},{4}.
        let g = gstate(
            &[true, false, false, true, false],
            &[true, true, false, true, true],
        );
        let mut cursor = MaskCursor::default();

        cursor.update(0, &g);
        assert_eq!((cursor.partition_start, cursor.partition_end), (0, 3));
        assert_eq!(cursor.rank(), 1);
        cursor.update(1, &g);
        assert_eq!(cursor.rank(), 2);
        assert_eq!(cursor.dense_rank, 2);
        cursor.update(2, &g);
        assert_eq!(cursor.rank(), 2);
        assert_eq!((cursor.peer_start, cursor.peer_end), (1, 3));
        cursor.update(3, &g);
        assert_eq!((cursor.partition_start, cursor.partition_end), (3, 5));
        assert_eq!(cursor.rank(), 1);
        assert_eq!(cursor.dense_rank, 1);
    }

    #[test]
    fn cursor_seeks_on_random_access() {
        let g = gstate(
            &[true, false, false, true, false],
            &[true, true, false, true, true],
        );
        let mut cursor = MaskCursor::default();
        cursor.update(4, &g);
        assert_eq!((cursor.partition_start, cursor.partition_end), (3, 5));
        assert_eq!(cursor.rank(), 2);
        assert_eq!(cursor.dense_rank, 2);

        // Jump backwards: must re-seek, not stream.
        cursor.update(1, &g);
        assert_eq!((cursor.partition_start, cursor.partition_end), (0, 3));
        assert_eq!(cursor.rank(), 2);
    }
}
