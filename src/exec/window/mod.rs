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
//! Parallel window-function operator: sink, three-phase source, and the
//! pipeline-facing surface.
//!
//! Responsibilities:
//! - Ingests rows through the hash partitioner, sorts partitions on finalize, and
//!   evaluates every window expression over the sorted hash groups.
//! - Exposes sink/combine/finalize/get_data results the surrounding pipeline drives,
//!   including batch ordering and progress reporting.
//!
//! Key exported interfaces:
//! - Types: `WindowOperator`, `WindowGlobalSinkState`, `WindowLocalSinkState`,
//!   `SinkResult`, `SinkFinalizeResult`, `SourceResult`, `SourceOrderMode`.

pub mod executors;
pub mod hash_group;
pub mod source;
pub mod spec;

use std::sync::{Arc, Mutex};

use arrow::datatypes::{Field, Schema, SchemaRef};
use threadpool::ThreadPool;

use crate::common::ids::SlotId;
use crate::exec::chunk::{field_slot_id, field_with_slot_id, Chunk};
use crate::exec::partition::{PartitionGlobalState, PartitionLocalState, PartitionSpec};
use crate::exec::window::executors::WindowExecutor;
use crate::exec::window::hash_group::WindowHashGroup;
use crate::exec::window::source::{
    SourcePoll, WakeHandle, WindowGlobalSourceState, WindowLocalSourceState,
};
use crate::exec::window::spec::WindowExprSpec;
use crate::gale_logging::debug;

/// Sink-phase result. Ingestion never blocks at this operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkResult {
    NeedMoreInput,
}

/// Verdict of sink finalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkFinalizeResult {
    /// Zero input rows: the source phase never runs.
    NoOutputPossible,
    /// Sorted data is ready for the source phase.
    Ready,
}

/// Source-phase result tag; hot-path signalling stays out of the error path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceResult {
    HaveMoreOutput,
    Finished,
    Blocked,
}

/// Whether the emitted chunk stream carries a meaningful order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceOrderMode {
    FixedOrder,
    NoOrder,
}

/// Physical window operator. Immutable once built; all execution state lives
/// in the sink/source state objects.
pub struct WindowOperator {
    exprs: Vec<WindowExprSpec>,
    partition_spec: PartitionSpec,
    output_schema: SchemaRef,
    order_idx: usize,
    is_order_dependent: bool,
}

impl WindowOperator {
    pub fn try_new(
        partition_spec: PartitionSpec,
        exprs: Vec<WindowExprSpec>,
    ) -> Result<Self, String> {
        if exprs.is_empty() {
            return Err("internal error: window operator without expressions".to_string());
        }

        let payload_fields = partition_spec.payload_schema.fields();
        let num_partition_cols = partition_spec.partition_cols.len();
        let num_order_keys = partition_spec.order_keys.len();

        let mut order_idx = 0;
        let mut max_orders = 0;
        let mut is_order_dependent = false;
        for (idx, expr) in exprs.iter().enumerate() {
            if expr.partition_cols == 0 && expr.order_keys == 0 {
                is_order_dependent = true;
            }
            if expr.partition_cols != num_partition_cols {
                return Err(format!(
                    "internal error: expression '{}' expects {} partition keys, operator has {}",
                    expr.name, expr.partition_cols, num_partition_cols
                ));
            }
            if expr.order_keys > num_order_keys {
                return Err(format!(
                    "internal error: expression '{}' expects {} order keys, operator has {}",
                    expr.name, expr.order_keys, num_order_keys
                ));
            }
            for &arg in &expr.args {
                if arg >= payload_fields.len() {
                    return Err(format!(
                        "internal error: expression '{}' argument column {} out of range",
                        expr.name, arg
                    ));
                }
            }
            if expr.order_keys > max_orders {
                order_idx = idx;
                max_orders = expr.order_keys;
            }
        }

        let output_schema = build_output_schema(&partition_spec.payload_schema, &exprs)?;
        Ok(Self {
            exprs,
            partition_spec,
            output_schema,
            order_idx,
            is_order_dependent,
        })
    }

    pub fn exprs(&self) -> &[WindowExprSpec] {
        &self.exprs
    }

    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    pub fn is_order_dependent(&self) -> bool {
        self.is_order_dependent
    }

    /// Order can only be preserved for single (unhashed) partitioning; work
    /// stealing over hash groups scrambles batch numbers otherwise. The
    /// order-dependent OVER () shape also preserves arrival order through the
    /// single raw collection.
    pub fn supports_batch_index(&self) -> bool {
        let driving = &self.exprs[self.order_idx];
        driving.partition_cols == 0 && (driving.order_keys > 0 || self.is_order_dependent)
    }

    pub fn source_order(&self) -> SourceOrderMode {
        if self.supports_batch_index() {
            SourceOrderMode::FixedOrder
        } else {
            SourceOrderMode::NoOrder
        }
    }

    /// One line per window expression.
    pub fn params_to_string(&self) -> String {
        let names: Vec<&str> = self.exprs.iter().map(|e| e.name.as_str()).collect();
        names.join("\n")
    }

    pub fn global_sink_state(self: &Arc<Self>) -> Result<Arc<WindowGlobalSinkState>, String> {
        WindowGlobalSinkState::new(Arc::clone(self)).map(Arc::new)
    }

    pub fn local_sink_state(&self, gsink: &WindowGlobalSinkState) -> WindowLocalSinkState {
        WindowLocalSinkState {
            local_partition: gsink.global_partition.local_state(),
        }
    }

    pub fn sink(
        &self,
        lsink: &mut WindowLocalSinkState,
        chunk: Chunk,
    ) -> Result<SinkResult, String> {
        lsink.local_partition.sink(chunk)?;
        Ok(SinkResult::NeedMoreInput)
    }

    pub fn combine(&self, lsink: WindowLocalSinkState) -> Result<(), String> {
        lsink.local_partition.combine()
    }

    /// Finish ingestion: either report that no output is possible, or sort
    /// every buffered partition (scheduled on `pool`) and build one window
    /// hash group per sorted bin.
    pub fn finalize(
        &self,
        gsink: &Arc<WindowGlobalSinkState>,
        pool: &ThreadPool,
    ) -> Result<SinkFinalizeResult, String> {
        let gpart = &gsink.global_partition;

        // Did we get any data?
        if gpart.count() == 0 {
            return Ok(SinkFinalizeResult::NoOutputPossible);
        }

        // The raw path has no sorting to schedule; the source constructs the
        // single hash group lazily.
        if gpart.has_rows() {
            return Ok(SinkFinalizeResult::Ready);
        }

        if !gpart.has_merge_tasks() {
            return Ok(SinkFinalizeResult::NoOutputPossible);
        }

        {
            let mut slots = gsink
                .window_hash_groups
                .lock()
                .expect("window hash groups lock");
            slots.resize_with(gpart.num_bins(), || None);
        }

        let event = gpart.prepare_merge()?;
        debug!("window finalize: {} partition sort task(s)", event.task_count());

        let callback_gsink = Arc::clone(gsink);
        let arities = gsink.arities();
        let on_sorted: Arc<dyn Fn(usize) -> Result<(), String> + Send + Sync> =
            Arc::new(move |bin| {
                let group =
                    WindowHashGroup::new(&callback_gsink.global_partition, &arities, bin)?;
                let mut slots = callback_gsink
                    .window_hash_groups
                    .lock()
                    .expect("window hash groups lock");
                slots[bin] = Some(Arc::new(group));
                Ok(())
            });
        event.run(pool, Arc::clone(gpart), on_sorted)?;

        Ok(SinkFinalizeResult::Ready)
    }

    pub fn global_source_state(
        &self,
        gsink: &Arc<WindowGlobalSinkState>,
        num_threads: usize,
    ) -> Result<Arc<WindowGlobalSourceState>, String> {
        WindowGlobalSourceState::new(Arc::clone(gsink), num_threads).map(Arc::new)
    }

    pub fn local_source_state(
        &self,
        gsource: &Arc<WindowGlobalSourceState>,
    ) -> WindowLocalSourceState {
        WindowLocalSourceState::new(Arc::clone(gsource))
    }

    /// One source poll: the block-and-wake variant. A worker arriving at a
    /// stage that is not ready registers its wake handle and reports
    /// `Blocked`; any poll that makes progress flushes the blocked set.
    pub fn get_data(
        &self,
        gsource: &Arc<WindowGlobalSourceState>,
        lsource: &mut WindowLocalSourceState,
        wake: Option<WakeHandle>,
    ) -> Result<(Option<Chunk>, SourceResult), String> {
        match lsource.poll() {
            Ok(SourcePoll::Chunk(chunk)) => {
                gsource.add_returned(chunk.len());
                gsource.update_blocked_tasks(false, None);
                Ok((Some(chunk), SourceResult::HaveMoreOutput))
            }
            Ok(SourcePoll::Finished) => {
                gsource.update_blocked_tasks(false, None);
                Ok((None, SourceResult::Finished))
            }
            Ok(SourcePoll::NotReady) => {
                gsource.update_blocked_tasks(true, wake);
                Ok((None, SourceResult::Blocked))
            }
            Err(e) => {
                gsource.stop();
                gsource.update_blocked_tasks(false, None);
                Err(e)
            }
        }
    }

    /// Yield-and-retry variant of [`get_data`](Self::get_data): spins the
    /// scheduler with a thread yield instead of parking. Semantically
    /// equivalent; useful where thread parking is expensive or unavailable.
    pub fn get_data_yielding(
        &self,
        gsource: &Arc<WindowGlobalSourceState>,
        lsource: &mut WindowLocalSourceState,
    ) -> Result<(Option<Chunk>, SourceResult), String> {
        loop {
            match self.get_data(gsource, lsource, None)? {
                (chunk, SourceResult::HaveMoreOutput) => {
                    return Ok((chunk, SourceResult::HaveMoreOutput));
                }
                (_, SourceResult::Finished) => return Ok((None, SourceResult::Finished)),
                (_, SourceResult::Blocked) => std::thread::yield_now(),
            }
        }
    }

    /// Batch index of the worker's latest output chunk.
    pub fn get_batch_index(&self, lsource: &WindowLocalSourceState) -> usize {
        lsource.batch_index()
    }

    /// Fraction of rows returned, or -1 when the operator saw no rows.
    pub fn get_progress(&self, gsource: &WindowGlobalSourceState) -> f64 {
        let count = gsource.gsink().global_partition.count();
        if count == 0 {
            return -1.0;
        }
        gsource.returned() as f64 / count as f64
    }
}

fn build_output_schema(
    payload_schema: &SchemaRef,
    exprs: &[WindowExprSpec],
) -> Result<SchemaRef, String> {
    let mut max_slot = 0u32;
    let mut fields: Vec<Field> = Vec::with_capacity(payload_schema.fields().len() + exprs.len());
    for field in payload_schema.fields() {
        let slot = field_slot_id(field.as_ref())?.ok_or_else(|| {
            format!("payload field '{}' carries no slot id", field.name())
        })?;
        max_slot = max_slot.max(slot.as_u32());
        fields.push(field.as_ref().clone());
    }
    for (idx, expr) in exprs.iter().enumerate() {
        let slot = SlotId::new(max_slot + 1 + idx as u32);
        fields.push(field_with_slot_id(
            Field::new(format!("window_{}", idx), expr.return_type.clone(), true),
            slot,
        ));
    }
    Ok(Arc::new(Schema::new(fields)))
}

/// Operator-wide sink state: the executor list, the partitioned input, and
/// the window hash groups once sorting completes.
pub struct WindowGlobalSinkState {
    op: Arc<WindowOperator>,
    pub(crate) executors: Vec<WindowExecutor>,
    pub(crate) global_partition: Arc<PartitionGlobalState>,
    pub(crate) window_hash_groups: Mutex<Vec<Option<Arc<WindowHashGroup>>>>,
}

impl WindowGlobalSinkState {
    fn new(op: Arc<WindowOperator>) -> Result<Self, String> {
        let executors = op
            .exprs
            .iter()
            .map(|expr| WindowExecutor::try_new(expr.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let global_partition = Arc::new(PartitionGlobalState::new(op.partition_spec.clone()));
        Ok(Self {
            op,
            executors,
            global_partition,
            window_hash_groups: Mutex::new(Vec::new()),
        })
    }

    pub fn global_partition(&self) -> &Arc<PartitionGlobalState> {
        &self.global_partition
    }

    pub(crate) fn executors(&self) -> &[WindowExecutor] {
        &self.executors
    }

    pub(crate) fn output_schema(&self) -> SchemaRef {
        self.op.output_schema()
    }

    pub(crate) fn arities(&self) -> Vec<usize> {
        self.op.exprs.iter().map(|e| e.key_arity()).collect()
    }

    pub(crate) fn group(&self, group_idx: usize) -> Result<Arc<WindowHashGroup>, String> {
        let groups = self
            .window_hash_groups
            .lock()
            .expect("window hash groups lock");
        groups
            .get(group_idx)
            .and_then(|slot| slot.as_ref())
            .cloned()
            .ok_or_else(|| format!("internal error: window hash group {} is gone", group_idx))
    }
}

/// Per-worker sink state: a thin wrapper over the partition local sink.
pub struct WindowLocalSinkState {
    local_partition: PartitionLocalState,
}
