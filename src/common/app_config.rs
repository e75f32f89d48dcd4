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
//! Process-wide configuration loaded from `gale.toml`.
//!
//! Responsibilities:
//! - Deserializes the optional configuration file once and caches it for the process lifetime.
//! - Provides section structs with serde defaults so a missing file or section still yields usable values.
//!
//! Key exported interfaces:
//! - Functions: `init_from_path`, `init_from_env_or_default`, `config`.
//! - Types: `GaleConfig`, `ExecConfig`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<GaleConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static GaleConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = GaleConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

/// Load the configuration, falling back to built-in defaults when no file is
/// present. Unlike a server binary, a library embedding should not fail hard
/// on a missing config file.
pub fn init_from_env_or_default() -> Result<&'static GaleConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = match config_path_from_env_or_default() {
        Some(path) => GaleConfig::load_from_file(&path)?,
        None => GaleConfig::default(),
    };
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static GaleConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("GALE_CONFIG") {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }

    let candidate = PathBuf::from("gale.toml");
    if candidate.exists() {
        return Some(candidate);
    }
    None
}

#[derive(Clone, Deserialize)]
pub struct GaleConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub exec: ExecConfig,
}

impl GaleConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: GaleConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for GaleConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            exec: ExecConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_window_block_rows")]
    pub window_block_rows: usize,
    #[serde(default = "default_window_partition_bins")]
    pub window_partition_bins: usize,
    #[serde(default = "default_window_force_external")]
    pub window_force_external: bool,
    #[serde(default = "default_exec_threads")]
    pub exec_threads: usize,
}

fn default_chunk_size() -> usize {
    4096
}
fn default_window_block_rows() -> usize {
    16384
}
fn default_window_partition_bins() -> usize {
    16
}
fn default_window_force_external() -> bool {
    false
}
fn default_exec_threads() -> usize {
    0
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            window_block_rows: default_window_block_rows(),
            window_partition_bins: default_window_partition_bins(),
            window_force_external: default_window_force_external(),
            exec_threads: default_exec_threads(),
        }
    }
}
