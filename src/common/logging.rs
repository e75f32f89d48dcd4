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
//! Tracing setup for the execution core.
//!
//! A library init: plain-text compact output on stderr, installed at most
//! once and silently ceding to any subscriber the embedding process already
//! registered.

use std::sync::OnceLock;

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

static INIT: OnceLock<()> = OnceLock::new();

/// Plain levels get a per-target default that keeps arrow kernel internals
/// quiet; anything with explicit directives is taken as a full filter.
fn build_filter(level: &str) -> EnvFilter {
    if level.contains('=') || level.contains(',') {
        return EnvFilter::new(level);
    }
    EnvFilter::new(format!("{level},arrow=warn"))
}

pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        let _ = tracing_fmt()
            .compact()
            .with_env_filter(build_filter(level))
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_timer(ChronoLocal::new("%Y%m%d %H:%M:%S%.6f".to_string()))
            .try_init();
    });
}

pub fn init() {
    init_with_level("info");
}

pub use tracing::{debug, error, info, trace, warn};
