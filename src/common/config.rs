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
use crate::gale_config::config as gale_app_config;

pub(crate) fn exec_chunk_size() -> usize {
    gale_app_config()
        .ok()
        .map(|c| c.exec.chunk_size)
        .unwrap_or(4096)
        .max(1)
}

pub(crate) fn window_block_rows() -> usize {
    gale_app_config()
        .ok()
        .map(|c| c.exec.window_block_rows)
        .unwrap_or(16384)
        .max(1)
}

pub(crate) fn window_partition_bins() -> usize {
    let bins = gale_app_config()
        .ok()
        .map(|c| c.exec.window_partition_bins)
        .unwrap_or(16)
        .max(1);
    bins.next_power_of_two()
}

pub(crate) fn window_force_external() -> bool {
    gale_app_config()
        .ok()
        .map(|c| c.exec.window_force_external)
        .unwrap_or(false)
}

pub(crate) fn exec_threads() -> usize {
    let configured = gale_app_config()
        .ok()
        .map(|c| c.exec.exec_threads)
        .unwrap_or(0);
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
