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
//! Hash-partitioned ingestion and per-bin sorting feeding the window operator.
//!
//! Responsibilities:
//! - Buffers sunk chunks into hash bins (or a raw unsorted collection) across worker threads.
//! - Sorts each bin on merge and exposes sorted runs plus boundary-mask computation.
//!
//! Key exported interfaces:
//! - Types: `PartitionSpec`, `SortKeySpec`, `PartitionGlobalState`, `PartitionLocalState`,
//!   `HashPartition`, `SortedRun`, `PartitionMergeEvent`.

pub mod merge;
pub mod sink;
pub mod sort;

pub use merge::PartitionMergeEvent;
pub use sink::{PartitionGlobalState, PartitionLocalState, PartitionSpec, SortKeySpec};
pub use sort::{HashPartition, SortedRun};
