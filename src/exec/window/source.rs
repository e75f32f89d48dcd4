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
//! Task scheduling and the per-worker source loop of the window operator.
//!
//! Responsibilities:
//! - Generates the flat task queue (group-major, stage-major, block-range split)
//!   and gates each task behind its group's current stage.
//! - Drives one worker through Sink/Finalize/GetData passes and releases a group
//!   when its last task finishes.
//!
//! Key exported interfaces:
//! - Types: `Task`, `TaskPoll`, `SourcePoll`, `WakeHandle`,
//!   `WindowGlobalSourceState`, `WindowLocalSourceState`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions};

use crate::exec::chunk::Chunk;
use crate::exec::rows::RowBlockScanner;
use crate::exec::window::executors::{WindowExecutorGlobalState, WindowExecutorLocalState};
use crate::exec::window::hash_group::{WindowGroupStage, WindowHashGroup};
use crate::exec::window::WindowGlobalSinkState;
use crate::gale_logging::debug;

/// One unit of work: a block range of one group in one stage. The shape is
/// fixed at generation; only `begin_idx` advances as the owning worker makes
/// progress.
#[derive(Clone, Copy, Debug)]
pub struct Task {
    pub stage: WindowGroupStage,
    pub group_idx: usize,
    pub max_idx: usize,
    pub begin_idx: usize,
    pub end_idx: usize,
}

/// Outcome of a task poll.
pub enum TaskPoll {
    /// A task whose stage matches its group's current stage.
    Task(Task),
    /// The next task's stage is not ready yet; back off and retry.
    NotReady,
    /// The queue is drained or the operator is stopped.
    Done,
}

/// Outcome of one worker poll of the source.
pub enum SourcePoll {
    Chunk(Chunk),
    NotReady,
    Finished,
}

/// Callback waking a blocked worker so it re-polls the task queue.
pub type WakeHandle = Arc<dyn Fn() + Send + Sync>;

struct TaskQueue {
    next_task: usize,
    blocked: Vec<WakeHandle>,
}

/// Shared task generator and scheduler for the source phase.
pub struct WindowGlobalSourceState {
    gsink: Arc<WindowGlobalSinkState>,
    tasks: Vec<Task>,
    queue: Mutex<TaskQueue>,
    stopped: AtomicBool,
    returned: AtomicUsize,
}

impl WindowGlobalSourceState {
    pub fn new(gsink: Arc<WindowGlobalSinkState>, num_threads: usize) -> Result<Self, String> {
        let gpart = gsink.global_partition();
        let arities = gsink.arities();

        let mut groups = gsink
            .window_hash_groups
            .lock()
            .expect("window hash groups lock");

        if groups.is_empty() {
            // OVER (): the sort tasks never ran, so the single group is
            // constructed here.
            if gpart.has_rows() && gpart.rows_block_count() > 0 {
                let group = WindowHashGroup::new(gpart, &arities, 0)?;
                groups.push(Some(Arc::new(group)));
            }
        }

        // Assign output batch bases by running sum over block counts.
        let mut batch_base = 0;
        for group in groups.iter().flatten() {
            if group.blocks() == 0 {
                continue;
            }
            group.set_batch_base(batch_base);
            batch_base += group.blocks();
        }

        // Schedule the largest group first so worker startup picks up the
        // most parallelizable work.
        let mut partition_blocks: Vec<(usize, usize)> = groups
            .iter()
            .enumerate()
            .filter_map(|(idx, group)| {
                group
                    .as_ref()
                    .map(|g| (g.blocks(), idx))
                    .filter(|(blocks, _)| *blocks > 0)
            })
            .collect();
        partition_blocks.sort_unstable_by(|a, b| b.cmp(a));

        let mut tasks = Vec::new();
        if let Some(&(max_blocks, _)) = partition_blocks.first() {
            let threads = num_threads.max(1);
            let per_thread = max_blocks.div_ceil(threads);

            let stages = [
                WindowGroupStage::Sink,
                WindowGroupStage::Finalize,
                WindowGroupStage::GetData,
            ];
            for &(blocks, group_idx) in &partition_blocks {
                let group = groups[group_idx]
                    .as_ref()
                    .ok_or_else(|| "internal error: scheduled group missing".to_string())?;
                for stage in stages {
                    let mut begin_idx = 0;
                    while begin_idx < blocks {
                        let end_idx = (begin_idx + per_thread).min(blocks);
                        tasks.push(Task {
                            stage,
                            group_idx,
                            max_idx: blocks,
                            begin_idx,
                            end_idx,
                        });
                        group.tasks_remaining.fetch_add(1, Ordering::AcqRel);
                        begin_idx = end_idx;
                    }
                }
            }
        }
        drop(groups);
        debug!(
            "window source scheduled {} task(s) over {} group(s)",
            tasks.len(),
            partition_blocks.len()
        );

        Ok(Self {
            gsink,
            tasks,
            queue: Mutex::new(TaskQueue {
                next_task: 0,
                blocked: Vec::new(),
            }),
            stopped: AtomicBool::new(false),
            returned: AtomicUsize::new(0),
        })
    }

    pub fn gsink(&self) -> &Arc<WindowGlobalSinkState> {
        &self.gsink
    }

    /// Parallelism is capped by the number of generated tasks.
    pub fn max_threads(&self) -> usize {
        self.tasks.len()
    }

    /// Hand out the next task if its stage matches its group's current stage.
    /// A mismatch means the group is still working through an earlier stage;
    /// the caller must back off and re-poll.
    pub fn try_next_task(&self) -> Result<TaskPoll, String> {
        let mut queue = self.queue.lock().expect("window source lock");
        if queue.next_task >= self.tasks.len() || self.stopped.load(Ordering::Acquire) {
            return Ok(TaskPoll::Done);
        }
        let task = self.tasks[queue.next_task];
        let group = self.gsink.group(task.group_idx)?;
        if task.stage == group.stage() {
            queue.next_task += 1;
            return Ok(TaskPoll::Task(task));
        }
        Ok(TaskPoll::NotReady)
    }

    /// Release one finished task. The worker observing the group's counter
    /// hit zero tears the group down; this is the sole deallocation point.
    pub fn finish_task(&self, task: Task) -> Result<(), String> {
        let mut groups = self
            .gsink
            .window_hash_groups
            .lock()
            .expect("window hash groups lock");
        let slot = groups
            .get_mut(task.group_idx)
            .ok_or_else(|| "internal error: finished task for unknown group".to_string())?;
        let group = slot
            .as_ref()
            .ok_or_else(|| "internal error: finished task for a released group".to_string())?;
        if group.tasks_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("window hash group {} released", group.bin());
            *slot = None;
        }
        Ok(())
    }

    /// Park or wake blocked workers. `blocked=true` registers the handle;
    /// `blocked=false` fires and clears every registered handle. Flushing an
    /// empty set is a no-op.
    pub fn update_blocked_tasks(&self, blocked: bool, handle: Option<WakeHandle>) {
        let handles = {
            let mut queue = self.queue.lock().expect("window source lock");
            if blocked {
                if let Some(handle) = handle {
                    queue.blocked.push(handle);
                }
                return;
            }
            std::mem::take(&mut queue.blocked)
        };
        for handle in handles {
            handle();
        }
    }

    /// Stop producing tasks; workers drain on their next poll.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn add_returned(&self, rows: usize) {
        self.returned.fetch_add(rows, Ordering::AcqRel);
    }

    pub fn returned(&self) -> usize {
        self.returned.load(Ordering::Acquire)
    }
}

/// Per-worker source state: the current task, the group it points into, the
/// scan cursor, and per-expression local states.
pub struct WindowLocalSourceState {
    gsource: Arc<WindowGlobalSourceState>,
    batch_index: usize,
    task: Option<Task>,
    group: Option<Arc<WindowHashGroup>>,
    gestates: Option<Arc<Vec<Arc<WindowExecutorGlobalState>>>>,
    local_states: Vec<WindowExecutorLocalState>,
    scanner: Option<RowBlockScanner>,
}

impl WindowLocalSourceState {
    pub fn new(gsource: Arc<WindowGlobalSourceState>) -> Self {
        Self {
            gsource,
            batch_index: 0,
            task: None,
            group: None,
            gestates: None,
            local_states: Vec::new(),
            scanner: None,
        }
    }

    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    /// Enter the group the current task points at: lazily build the function
    /// global states, then this worker's local states.
    fn begin_hash_group(&mut self) -> Result<(), String> {
        let Some(task) = self.task else {
            return Ok(());
        };
        let gsink = self.gsource.gsink();
        let group = gsink.group(task.group_idx)?;
        let gestates = group.initialize(gsink.executors())?;

        let executors = gsink.executors();
        let mut local_states = Vec::with_capacity(executors.len());
        for (executor, gestate) in executors.iter().zip(gestates.iter()) {
            local_states.push(executor.create_local(gestate));
        }

        self.group = Some(group);
        self.gestates = Some(gestates);
        self.local_states = local_states;
        Ok(())
    }

    /// Drop all references into the previous group and release its task.
    fn finish_hash_group(&mut self, prev: Option<Task>) -> Result<(), String> {
        self.scanner = None;
        self.local_states.clear();
        self.gestates = None;
        self.group = None;
        if let Some(prev) = prev {
            self.gsource.finish_task(prev)?;
        }
        Ok(())
    }

    /// First pass: feed every block in the task's range to every executor,
    /// without flushing.
    fn sink_stage(&mut self) -> Result<(), String> {
        let gsink = Arc::clone(self.gsource.gsink());
        let executors = gsink.executors();
        let group = self
            .group
            .clone()
            .ok_or_else(|| "internal error: sink stage without a group".to_string())?;
        let gestates = self
            .gestates
            .clone()
            .ok_or_else(|| "internal error: sink stage before initialize".to_string())?;

        loop {
            let Some(task) = self.task.as_mut() else {
                return Err("internal error: sink stage without a task".to_string());
            };
            if task.begin_idx >= task.end_idx {
                break;
            }
            let Some(mut scanner) = group.build_scanner(task.begin_idx)? else {
                break;
            };
            loop {
                let input_idx = scanner.scanned();
                let Some(chunk) = scanner.scan()? else {
                    break;
                };
                for (w, executor) in executors.iter().enumerate() {
                    executor.sink(
                        &chunk,
                        input_idx,
                        scanner.count(),
                        &gestates[w],
                        &mut self.local_states[w],
                    )?;
                }
                group.sunk.fetch_add(chunk.len(), Ordering::AcqRel);
            }
            // External scanning assumes all blocks are swizzled.
            scanner.swizzle_block();
            task.begin_idx += 1;
        }
        Ok(())
    }

    /// Second pass: close accumulation. The executors coordinate any internal
    /// parallelism and return only when the group is quiescent.
    fn finalize_stage(&mut self) -> Result<(), String> {
        let gsink = Arc::clone(self.gsource.gsink());
        let executors = gsink.executors();
        let group = self
            .group
            .clone()
            .ok_or_else(|| "internal error: finalize stage without a group".to_string())?;
        let gestates = self
            .gestates
            .clone()
            .ok_or_else(|| "internal error: finalize stage before initialize".to_string())?;

        for (w, executor) in executors.iter().enumerate() {
            executor.finalize(&gestates[w], &mut self.local_states[w])?;
        }

        let task = self
            .task
            .as_mut()
            .ok_or_else(|| "internal error: finalize stage without a task".to_string())?;
        group
            .finalized
            .fetch_add(task.end_idx - task.begin_idx, Ordering::AcqRel);
        task.begin_idx = task.end_idx;
        Ok(())
    }

    /// One worker poll: works through scheduled Sink/Finalize tasks inline and
    /// produces one output chunk per GetData poll.
    pub fn poll(&mut self) -> Result<SourcePoll, String> {
        // Done with the current block?
        if let Some(scanner) = &self.scanner {
            if scanner.remaining() == 0 {
                self.scanner = None;
                if let Some(task) = self.task.as_mut() {
                    task.begin_idx += 1;
                }
            }
        }

        // Done with the current task?
        loop {
            let producing = matches!(
                &self.task,
                Some(t) if t.begin_idx < t.end_idx && t.stage == WindowGroupStage::GetData
            );
            if producing {
                break;
            }

            let prev = self.task.take();
            match self.gsource.try_next_task()? {
                TaskPoll::NotReady => {
                    self.finish_hash_group(prev)?;
                    return Ok(SourcePoll::NotReady);
                }
                TaskPoll::Done => {
                    self.finish_hash_group(prev)?;
                    return Ok(SourcePoll::Finished);
                }
                TaskPoll::Task(task) => {
                    let new_group = match prev {
                        None => true,
                        Some(p) => p.group_idx != task.group_idx,
                    };
                    self.task = Some(task);
                    if new_group {
                        // Release the old group's data before entering the new one.
                        self.finish_hash_group(prev)?;
                        self.begin_hash_group()?;
                    } else if let Some(prev) = prev {
                        // Same group: the previous task is complete, release
                        // its slot while keeping the group-local state.
                        self.gsource.finish_task(prev)?;
                    }
                    match task.stage {
                        WindowGroupStage::Sink => self.sink_stage()?,
                        WindowGroupStage::Finalize => self.finalize_stage()?,
                        WindowGroupStage::GetData => {}
                        WindowGroupStage::Done => {
                            return Err("internal error: scheduled task in Done stage".to_string());
                        }
                    }
                }
            }
        }

        let task = self
            .task
            .ok_or_else(|| "internal error: producing without a task".to_string())?;
        let group = self
            .group
            .clone()
            .ok_or_else(|| "internal error: producing without a group".to_string())?;

        if self.scanner.is_none() {
            self.scanner = Some(group.evaluate_scanner(task.begin_idx)?);
            self.batch_index = group.batch_base() + task.begin_idx;
        }
        let scanner = self
            .scanner
            .as_mut()
            .ok_or_else(|| "internal error: no scanner for the producing block".to_string())?;

        let position = scanner.scanned();
        let input = scanner
            .scan()?
            .ok_or_else(|| "internal error: producing block scanned dry".to_string())?;

        let gsink = self.gsource.gsink();
        let executors = gsink.executors();
        let gestates = self
            .gestates
            .as_ref()
            .ok_or_else(|| "internal error: producing before initialize".to_string())?;

        let mut columns: Vec<ArrayRef> = input.columns().to_vec();
        for (w, executor) in executors.iter().enumerate() {
            let column = executor.evaluate(
                position,
                &input,
                &mut self.local_states[w],
                &gestates[w],
            )?;
            columns.push(column);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(input.len()));
        let batch = RecordBatch::try_new_with_options(gsink.output_schema(), columns, &options)
            .map_err(|e| format!("build window output chunk: {}", e))?;
        Ok(SourcePoll::Chunk(Chunk::try_new(batch)?))
    }
}
