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
//! Block-oriented row storage scanned by the window operator.
//!
//! Responsibilities:
//! - Splits payload data into fixed-width row blocks and variable-length heap blocks.
//! - Provides per-block scanners that reassemble payload chunks for executor passes.
//!
//! Key exported interfaces:
//! - Types: `RowLayout`, `RowBlock`, `RowBlockCollection`, `RowBlockScanner`.
//! - Functions: `align_heap_blocks`.

pub mod collection;
pub mod layout;
pub mod scanner;

pub use collection::{align_heap_blocks, RowBlock, RowBlockCollection};
pub use layout::RowLayout;
pub use scanner::RowBlockScanner;
