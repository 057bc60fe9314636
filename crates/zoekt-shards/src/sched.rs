// Copyright 2025 HyperZoekt Project
// Derived from sourcegraph/zoekt (https://github.com/sourcegraph/zoekt)
// Copyright 2016 Google Inc. All rights reserved.
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

//! Admission control for searches.
//!
//! A search first acquires a slot in the interactive pool. Once it has been
//! running for longer than the interactive budget it gives that slot up and
//! moves to the smaller batch pool, so short queries keep flowing while a few
//! expensive ones still make progress.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_DIV: usize = 4;
pub const DEFAULT_INTERACTIVE_DURATION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Use a single semaphore without the interactive/batch split.
    pub disabled: bool,
    /// Batch capacity is the interactive capacity divided by this (floor 1).
    pub batch_div: usize,
    /// How long a process may stay interactive before yielding.
    pub interactive_duration: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            batch_div: DEFAULT_BATCH_DIV,
            interactive_duration: DEFAULT_INTERACTIVE_DURATION,
        }
    }
}

impl SchedulerConfig {
    /// Parse a comma separated `key=value` string such as
    /// `disable,batchdiv=8,interactiveseconds=10`.
    ///
    /// A bare key means `1`. Values that fail to parse become `0`. Unknown
    /// keys are ignored; zero leaves `batchdiv` and `interactiveseconds` at
    /// their defaults.
    pub fn from_tuneables(s: &str) -> Self {
        let mut cfg = SchedulerConfig::default();
        for kv in s.split(',').map(str::trim).filter(|kv| !kv.is_empty()) {
            let (key, value) = match kv.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim().parse::<u64>().unwrap_or(0)),
                None => (kv, 1),
            };
            match key {
                "disable" => cfg.disabled = value != 0,
                "batchdiv" if value > 0 => cfg.batch_div = value as usize,
                "interactiveseconds" if value > 0 => {
                    cfg.interactive_duration = Duration::from_secs(value)
                }
                _ => {}
            }
        }
        cfg
    }
}

/// Hands out [`Process`] tickets.
#[derive(Debug)]
pub struct Scheduler {
    interactive: Arc<Semaphore>,
    /// `None` in single-semaphore mode.
    batch: Option<Arc<Semaphore>>,
    capacity: usize,
    batch_capacity: usize,
    interactive_duration: Duration,
}

impl Scheduler {
    /// Create a scheduler admitting `capacity` concurrent processes. A
    /// capacity of zero means one per available CPU.
    pub fn new(capacity: usize, cfg: &SchedulerConfig) -> Self {
        let capacity = if capacity == 0 {
            num_cpus()
        } else {
            capacity
        };
        let batch_capacity = (capacity / cfg.batch_div.max(1)).max(1);
        let batch = if cfg.disabled {
            None
        } else {
            Some(Arc::new(Semaphore::new(batch_capacity)))
        };
        tracing::debug!(
            capacity,
            batch_capacity,
            disabled = cfg.disabled,
            "scheduler created"
        );
        Self {
            interactive: Arc::new(Semaphore::new(capacity)),
            batch,
            capacity,
            batch_capacity: if cfg.disabled { 0 } else { batch_capacity },
            interactive_duration: cfg.interactive_duration,
        }
    }

    /// Block until admitted into the interactive pool or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Process> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            p = self.interactive.clone().acquire_owned() => p.map_err(|_| Error::SchedulerClosed)?,
        };
        Ok(Process {
            permit: Some(permit),
            state: ProcessState::Interactive,
            yield_at: self
                .batch
                .as_ref()
                .map(|_| Instant::now() + self.interactive_duration),
            batch: self.batch.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    pub fn available_interactive(&self) -> usize {
        self.interactive.available_permits()
    }

    pub fn available_batch(&self) -> usize {
        self.batch
            .as_ref()
            .map(|b| b.available_permits())
            .unwrap_or(0)
    }

    pub fn is_single(&self) -> bool {
        self.batch.is_none()
    }
}

pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Interactive,
    Batch,
    Released,
}

/// One admitted search. Must be driven from a single task.
///
/// Dropping the process releases whatever slot it holds.
#[derive(Debug)]
pub struct Process {
    permit: Option<OwnedSemaphorePermit>,
    state: ProcessState,
    /// Cleared after the first yield attempt.
    yield_at: Option<Instant>,
    batch: Option<Arc<Semaphore>>,
}

impl Process {
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Move from the interactive pool to the batch pool once the interactive
    /// budget has elapsed. Does at most one transition per process.
    pub async fn maybe_yield(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(deadline) = self.yield_at else {
            return Ok(());
        };
        if self.state != ProcessState::Interactive || Instant::now() < deadline {
            return Ok(());
        }
        self.yield_at = None;
        let Some(batch) = self.batch.clone() else {
            return Ok(());
        };

        // Give up the interactive slot before waiting on the batch pool.
        self.permit = None;
        self.state = ProcessState::Released;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            p = batch.acquire_owned() => p.map_err(|_| Error::SchedulerClosed)?,
        };
        self.permit = Some(permit);
        self.state = ProcessState::Batch;
        tracing::debug!("search yielded to batch pool");
        Ok(())
    }

    /// Release the held slot. Safe to call more than once.
    pub fn release(&mut self) {
        self.permit = None;
        self.state = ProcessState::Released;
        self.yield_at = None;
    }
}
