// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::Result;
use crate::sched::SchedulerConfig;
use crate::watcher::RESCAN_INTERVAL;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for a directory backed sharded searcher.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardsConfig {
    pub index_dir: PathBuf,
    /// Concurrent searches admitted by the scheduler; 0 means one per CPU.
    pub capacity: usize,
    pub sched: SchedulerConfig,
    /// Block `DirectorySearcher::open` until the initial scan is loaded.
    pub wait_until_ready: bool,
    pub rescan_interval: Duration,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("."),
            capacity: 0,
            sched: SchedulerConfig::default(),
            wait_until_ready: false,
            rescan_interval: RESCAN_INTERVAL,
        }
    }
}

/// CLI-level options that binaries pass to `load_shards_config`.
#[derive(Clone, Debug, Default)]
pub struct MergeOpts {
    pub config_path: Option<PathBuf>,
    pub cli_index_dir: Option<PathBuf>,
    pub cli_capacity: Option<usize>,
    pub cli_sched: Option<String>,
    pub cli_wait_until_ready: Option<bool>,
    pub cli_rescan_seconds: Option<u64>,
}

/// Load and merge ShardsConfig from: defaults <- config file <- env vars <- CLI
pub fn load_shards_config(mut base: ShardsConfig, opts: MergeOpts) -> Result<ShardsConfig> {
    if let Some(path) = opts.config_path.as_ref() {
        if path.exists() {
            let s = fs::read_to_string(path)?;
            let v: toml::Value = toml::from_str(&s)?;
            if let Some(d) = v.get("index_dir").and_then(|x| x.as_str()) {
                base.index_dir = PathBuf::from(d);
            }
            if let Some(c) = v.get("search_capacity").and_then(|x| x.as_integer()) {
                base.capacity = c.max(0) as usize;
            }
            if let Some(s) = v.get("sched").and_then(|x| x.as_str()) {
                base.sched = SchedulerConfig::from_tuneables(s);
            }
            if let Some(w) = v.get("wait_until_ready").and_then(|x| x.as_bool()) {
                base.wait_until_ready = w;
            }
            if let Some(r) = v.get("rescan_seconds").and_then(|x| x.as_integer()) {
                if r > 0 {
                    base.rescan_interval = Duration::from_secs(r as u64);
                }
            }
        }
    }

    // env vars override file
    if let Ok(d) = std::env::var("ZOEKT_INDEX_DIR") {
        base.index_dir = PathBuf::from(d);
    }
    if let Ok(c) = std::env::var("ZOEKT_SEARCH_CAPACITY") {
        if let Ok(v) = c.parse::<usize>() {
            base.capacity = v;
        }
    }
    if let Ok(s) = std::env::var("ZOEKT_SCHED") {
        base.sched = SchedulerConfig::from_tuneables(&s);
    }
    if let Ok(r) = std::env::var("ZOEKT_RESCAN_SECONDS") {
        if let Ok(v) = r.parse::<u64>() {
            if v > 0 {
                base.rescan_interval = Duration::from_secs(v);
            }
        }
    }

    // CLI overrides everything
    if let Some(d) = opts.cli_index_dir {
        base.index_dir = d;
    }
    if let Some(c) = opts.cli_capacity {
        base.capacity = c;
    }
    if let Some(s) = opts.cli_sched {
        base.sched = SchedulerConfig::from_tuneables(&s);
    }
    if let Some(w) = opts.cli_wait_until_ready {
        base.wait_until_ready = w;
    }
    if let Some(r) = opts.cli_rescan_seconds.filter(|r| *r > 0) {
        base.rescan_interval = Duration::from_secs(r);
    }

    Ok(base)
}
