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

use crate::collect::{
    new_flush_collect_sender, CollectSender, CopySender, DisplayTruncator, LimitSender,
};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::registry::{Loaded, RankedShard, ShardRegistry};
use crate::sched::{num_cpus, Scheduler, SchedulerConfig};
use crate::searcher::Sender;
use crate::select::select_repo_set;
use crate::stream;
use crate::types::{
    copy_files, ListOptions, Progress, RepoList, RepoListEntry, RepoStats, SearchOptions,
    SearchResult, Stats,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Searches every shard of a [`ShardRegistry`] under a [`Scheduler`].
pub struct ShardedSearcher {
    sched: Scheduler,
    registry: Arc<ShardRegistry>,
}

/// The first event of every streamed search: no files, a crash if the
/// registry is still loading, and the highest priority among the shards
/// left to search.
fn progress_event(loaded: &Loaded, shards: &[Arc<RankedShard>], wait: Duration) -> SearchResult {
    let max_pending_priority = shards
        .first()
        .map(|s| s.priority())
        .unwrap_or(f64::NEG_INFINITY);
    SearchResult {
        stats: Stats {
            crashes: usize::from(!loaded.ready),
            wait,
            ..Default::default()
        },
        progress: Progress {
            priority: f64::NEG_INFINITY,
            max_pending_priority,
        },
        ..Default::default()
    }
}

impl ShardedSearcher {
    pub fn new(registry: Arc<ShardRegistry>, capacity: usize, cfg: &SchedulerConfig) -> Self {
        Self {
            sched: Scheduler::new(capacity, cfg),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Search all shards and return one aggregated, sorted and truncated
    /// result with bytes copied out of shard memory.
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        q: &Query,
        opts: &SearchOptions,
    ) -> Result<SearchResult> {
        let start = Instant::now();
        let req = cancel.child_token();
        let _req_guard = req.clone().drop_guard();

        let mut proc = self.sched.acquire(&req).await?;
        let wait = start.elapsed();
        let loaded = self.registry.snapshot();

        let (shards, q) = select_repo_set(&loaded.shards, q);
        let q = q.simplify();

        let collect = CollectSender::new(opts);
        collect.send(progress_event(&loaded, &shards, wait));
        tracing::debug!(query = %q, opts = %opts, shards = shards.len(), "search");
        let res = stream::stream_search(&req, &mut proc, &shards, q, opts, &collect).await;
        proc.release();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        res?;

        let mut sr = collect.done().unwrap_or_default();
        if let Some(mut truncator) = DisplayTruncator::new(opts) {
            truncator.truncate(&mut sr.files);
        }
        copy_files(&mut sr);
        sr.stats.duration = start.elapsed();
        drop(shards);
        drop(loaded);
        Ok(sr)
    }

    /// Stream results to `sender` as shards complete.
    ///
    /// Every batch reaching `sender` owns its bytes. The first batch is a
    /// progress event carrying the initial max pending priority.
    pub async fn stream_search(
        &self,
        cancel: &CancellationToken,
        q: &Query,
        opts: &SearchOptions,
        sender: Arc<dyn Sender>,
    ) -> Result<()> {
        let start = Instant::now();
        let req = cancel.child_token();
        let _req_guard = req.clone().drop_guard();

        let mut proc = self.sched.acquire(&req).await?;
        let loaded = self.registry.snapshot();
        let (shards, q) = select_repo_set(&loaded.shards, q);
        let q = q.simplify();
        sender.send(progress_event(&loaded, &shards, start.elapsed()));
        tracing::debug!(query = %q, opts = %opts, shards = shards.len(), "stream search");

        let limited = LimitSender::wrap(opts, req.clone(), sender);
        let (flush_sender, final_flush) = new_flush_collect_sender(opts, limited);
        let copy = CopySender::new(flush_sender);

        let res = stream::stream_search(&req, &mut proc, &shards, q, opts, &copy).await;
        final_flush.flush();
        proc.release();
        drop(shards);
        drop(loaded);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        res
    }

    /// List the repositories matching `q`, merging repositories that span
    /// several shards.
    pub async fn list(
        &self,
        cancel: &CancellationToken,
        q: &Query,
        opts: &ListOptions,
    ) -> Result<RepoList> {
        let req = cancel.child_token();
        let _req_guard = req.clone().drop_guard();

        let mut proc = self.sched.acquire(&req).await?;
        let loaded = self.registry.snapshot();
        let (shards, q) = select_repo_set(&loaded.shards, q);
        let q = q.simplify();
        let q = Arc::new(q);

        let limit = Arc::new(Semaphore::new(num_cpus()));
        let mut tasks = JoinSet::new();
        for shard in shards.iter().cloned() {
            let limit = Arc::clone(&limit);
            let token = req.clone();
            let q = Arc::clone(&q);
            let opts = *opts;
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let name = shard.name().to_string();
                let joined =
                    tokio::task::spawn_blocking(move || shard.searcher().list(&token, &q, &opts))
                        .await;
                (name, joined)
            });
        }

        let mut crashes = usize::from(!loaded.ready);
        let mut stats = RepoStats::default();
        let mut uniq: HashMap<String, RepoListEntry> = HashMap::new();
        let mut repos_map = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (name, rl) = match joined {
                Ok((name, Ok(Ok(rl)))) => (name, rl),
                Ok((name, Ok(Err(source)))) => {
                    return Err(Error::Shard {
                        shard: name,
                        source,
                    })
                }
                Ok((name, Err(err))) => {
                    tracing::error!(shard = %name, error = %err, "crashed shard during list");
                    crashes += 1;
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, "list task failed");
                    crashes += 1;
                    continue;
                }
            };
            tracing::trace!(shard = %name, repos = rl.repos.len(), "listed shard");

            crashes += rl.crashes;
            stats.add(&rl.stats);
            for entry in rl.repos {
                match uniq.get_mut(&entry.repository.name) {
                    Some(prev) => prev.stats.add(&entry.stats),
                    None => {
                        uniq.insert(entry.repository.name.clone(), entry);
                    }
                }
            }
            for (id, entry) in rl.repos_map {
                repos_map.entry(id).or_insert(entry);
            }
        }
        proc.release();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut repos: Vec<RepoListEntry> = uniq.into_values().collect();
        repos.sort_by(|a, b| a.repository.name.cmp(&b.repository.name));
        stats.repos = repos.len() + repos_map.len();
        Ok(RepoList {
            repos,
            repos_map,
            crashes,
            stats,
        })
    }

    /// Drop every shard from the registry.
    pub fn close(&self) {
        self.registry.close();
    }
}
