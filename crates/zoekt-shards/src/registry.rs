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

use crate::query::Query;
use crate::searcher::Searcher;
use crate::types::{ListOptions, Repository};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A loaded shard with the repository metadata it contains.
///
/// The underlying searcher is closed when the last `Arc` to the ranked shard
/// is dropped, which happens only after every snapshot and in-flight search
/// that saw it has finished with it.
pub struct RankedShard {
    name: String,
    searcher: Box<dyn Searcher>,
    priority: f64,
    repos: Vec<Repository>,
}

impl RankedShard {
    /// Wrap `searcher`, listing its repositories once to compute the rank.
    pub fn new(name: impl Into<String>, searcher: Box<dyn Searcher>) -> anyhow::Result<Self> {
        let list = searcher.list(
            &CancellationToken::new(),
            &Query::Const(true),
            &ListOptions::default(),
        )?;
        let repos: Vec<Repository> = list.repos.into_iter().map(|e| e.repository).collect();
        let priority = repos.iter().map(Repository::priority).fold(0.0, f64::max);
        Ok(Self {
            name: name.into(),
            searcher,
            priority,
            repos,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn searcher(&self) -> &dyn Searcher {
        self.searcher.as_ref()
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn repos(&self) -> &[Repository] {
        &self.repos
    }
}

impl std::fmt::Debug for RankedShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedShard")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("repos", &self.repos.len())
            .finish()
    }
}

impl Drop for RankedShard {
    fn drop(&mut self) {
        tracing::debug!(shard = %self.name, "closing shard");
        self.searcher.close();
    }
}

/// Order by descending priority, then shards with repository metadata
/// before shards without, then by first repository name.
fn compare_ranked(a: &Arc<RankedShard>, b: &Arc<RankedShard>) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| match (a.repos.first(), b.repos.first()) {
            (Some(ra), Some(rb)) => ra.name.cmp(&rb.name),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.name.cmp(&b.name))
}

/// A point in time view of the registry.
#[derive(Clone)]
pub struct Loaded {
    pub shards: Arc<Vec<Arc<RankedShard>>>,
    /// The initial load of the index directory has completed.
    pub ready: bool,
}

/// Set of loaded shards, readable without locks while being replaced.
pub struct ShardRegistry {
    shards: Mutex<HashMap<String, Arc<RankedShard>>>,
    ranked: ArcSwap<Vec<Arc<RankedShard>>>,
    ready: AtomicBool,
    load_failures: AtomicUsize,
}

impl Default for ShardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self {
            shards: Mutex::new(HashMap::new()),
            ranked: ArcSwap::from_pointee(Vec::new()),
            ready: AtomicBool::new(false),
            load_failures: AtomicUsize::new(0),
        }
    }

    /// Install or remove shards. A `None` value removes the key.
    ///
    /// Ranked shards are built before the lock is taken; readers see either
    /// the previous or the new sorted list, never a mix.
    pub fn replace(&self, deltas: HashMap<String, Option<Box<dyn Searcher>>>) {
        if deltas.is_empty() {
            return;
        }

        let mut built: Vec<(String, Option<Arc<RankedShard>>)> = Vec::with_capacity(deltas.len());
        for (key, searcher) in deltas {
            let Some(searcher) = searcher else {
                built.push((key, None));
                continue;
            };
            let describe = searcher.describe();
            match RankedShard::new(key.clone(), searcher) {
                Ok(rs) => built.push((key, Some(Arc::new(rs)))),
                Err(err) => {
                    self.load_failures.fetch_add(1, AtomicOrdering::Relaxed);
                    tracing::warn!(shard = %key, searcher = %describe, error = %err, "listing shard failed, omitting it");
                    built.push((key, None));
                }
            }
        }

        // Retired shards are dropped after the lock is released.
        let mut retired = Vec::new();
        {
            let mut shards = self.shards.lock();
            for (key, rs) in built {
                let old = match rs {
                    Some(rs) => shards.insert(key, rs),
                    None => shards.remove(&key),
                };
                retired.extend(old);
            }
            let mut ranked: Vec<Arc<RankedShard>> = shards.values().cloned().collect();
            ranked.sort_by(compare_ranked);
            self.ranked.store(Arc::new(ranked));
        }
        drop(retired);
    }

    /// Lock-free read of the latest published shard list.
    pub fn snapshot(&self) -> Loaded {
        let ready = self.ready.load(AtomicOrdering::Acquire);
        Loaded {
            shards: self.ranked.load_full(),
            ready,
        }
    }

    pub fn mark_ready(&self) {
        if !self.ready.swap(true, AtomicOrdering::AcqRel) {
            tracing::info!(shards = self.len(), "shard registry ready");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(AtomicOrdering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.ranked.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shards.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of shards omitted because listing them failed.
    pub fn load_failures(&self) -> usize {
        self.load_failures.load(AtomicOrdering::Relaxed)
    }

    /// Remove every shard. Each shard is closed once in-flight searches
    /// release it.
    pub fn close(&self) {
        let retired: Vec<Arc<RankedShard>> = {
            let mut shards = self.shards.lock();
            self.ranked.store(Arc::new(Vec::new()));
            shards.drain().map(|(_, v)| v).collect()
        };
        drop(retired);
    }
}
