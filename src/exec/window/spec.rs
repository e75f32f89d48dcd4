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
use arrow::array::ArrayRef;
use arrow::datatypes::DataType;

/// Aggregate function evaluated over the window frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// Window function kind. Constant arguments (bucket counts, offsets, defaults)
/// are part of the kind; value arguments are payload column references in
/// [`WindowExprSpec::args`].
#[derive(Clone, Debug)]
pub enum WindowFuncKind {
    Aggregate(AggKind),
    RowNumber,
    Rank,
    DenseRank,
    PercentRank,
    CumeDist,
    Ntile {
        buckets: u64,
    },
    /// `lead`/`lag` share one shape: `lag` looks backwards. The optional
    /// default is a one-row array applied where the offset leaves the
    /// partition.
    LeadLag {
        lag: bool,
        offset: u64,
        default: Option<ArrayRef>,
    },
    FirstValue,
    LastValue,
    NthValue {
        n: u64,
    },
}

/// Descriptor for one window expression: immutable after construction and
/// shared by every worker.
#[derive(Clone, Debug)]
pub struct WindowExprSpec {
    /// Display name, one line in the operator's parameter listing.
    pub name: String,
    pub kind: WindowFuncKind,
    /// Payload column indices feeding the function.
    pub args: Vec<usize>,
    /// Number of PARTITION BY keys of this expression.
    pub partition_cols: usize,
    /// Number of ORDER BY keys of this expression.
    pub order_keys: usize,
    pub return_type: DataType,
}

impl WindowExprSpec {
    /// Key arity selecting which order boundary mask this expression reads.
    pub fn key_arity(&self) -> usize {
        self.partition_cols + self.order_keys
    }
}
