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

//! Parallel fan-out of one query over a list of shards.

use crate::error::{Error, Result};
use crate::query::Query;
use crate::registry::RankedShard;
use crate::sched::{num_cpus, Process};
use crate::searcher::Sender;
use crate::types::{sort_files, Progress, SearchOptions, SearchResult, Stats};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Priorities of dispatched shards whose results have not arrived yet.
#[derive(Debug, Default)]
pub(crate) struct PrioritySlice {
    values: Vec<f64>,
}

impl PrioritySlice {
    pub(crate) fn append(&mut self, p: f64) {
        self.values.push(p);
    }

    pub(crate) fn remove(&mut self, p: f64) {
        if let Some(i) = self.values.iter().position(|v| *v == p) {
            self.values.swap_remove(i);
        }
    }

    pub(crate) fn max(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

struct ShardResult {
    priority: f64,
    result: Result<SearchResult>,
}

/// Search a single shard on the blocking pool. A panic inside the shard is
/// reported as one crash instead of failing the request.
async fn search_one_shard(
    cancel: CancellationToken,
    shard: Arc<RankedShard>,
    q: Arc<Query>,
    opts: Arc<SearchOptions>,
) -> ShardResult {
    let priority = shard.priority();
    if cancel.is_cancelled() {
        return ShardResult {
            priority,
            result: Ok(SearchResult {
                stats: Stats {
                    shards_skipped: 1,
                    ..Default::default()
                },
                ..Default::default()
            }),
        };
    }

    let name = shard.name().to_string();
    let joined =
        tokio::task::spawn_blocking(move || shard.searcher().search(&cancel, &q, &opts)).await;
    let result = match joined {
        Ok(Ok(sr)) => Ok(sr),
        Ok(Err(source)) => Err(Error::Shard {
            shard: name,
            source,
        }),
        Err(err) => {
            tracing::error!(shard = %name, error = %err, "crashed shard");
            Ok(SearchResult {
                stats: Stats {
                    crashes: 1,
                    ..Default::default()
                },
                ..Default::default()
            })
        }
    };
    ShardResult { priority, result }
}

/// Forward `sr` as one batch per contiguous run of files from the same
/// repository. Stats ride on the last batch only.
pub(crate) fn send_by_repository(mut sr: SearchResult, sender: &dyn Sender) {
    if sr.repo_urls.len() <= 1 || sr.files.is_empty() {
        sort_files(&mut sr.files);
        sender.send(sr);
        return;
    }

    let max_pending = sr.progress.max_pending_priority;
    let mut files = std::mem::take(&mut sr.files);
    let mut runs = Vec::new();
    while !files.is_empty() {
        let id = files[0].repository_id;
        let end = files
            .iter()
            .position(|f| f.repository_id != id)
            .unwrap_or(files.len());
        let rest = files.split_off(end);
        runs.push(files);
        files = rest;
    }

    let last = runs.len() - 1;
    for (i, mut run) in runs.into_iter().enumerate() {
        sort_files(&mut run);
        let repo = run[0].repository.clone();
        let priority = run[0].repository_priority;
        let pick = |m: &HashMap<String, String>| -> HashMap<String, String> {
            m.get(&repo)
                .map(|v| HashMap::from([(repo.clone(), v.clone())]))
                .unwrap_or_default()
        };
        sender.send(SearchResult {
            stats: if i == last {
                std::mem::take(&mut sr.stats)
            } else {
                Stats::default()
            },
            progress: Progress {
                priority,
                max_pending_priority: max_pending,
            },
            repo_urls: pick(&sr.repo_urls),
            line_fragments: pick(&sr.line_fragments),
            files: run,
        });
    }
}

async fn reserve<T>(tx: &Option<mpsc::Sender<T>>) -> Option<mpsc::Permit<'_, T>> {
    match tx {
        Some(tx) => tx.reserve().await.ok(),
        None => std::future::pending().await,
    }
}

/// Search `shards` (sorted by descending priority) with a pool of workers
/// and stream every shard result to `sender`.
///
/// A shard error stops dispatching further shards; results of shards that
/// are already running are still forwarded before the error is returned.
pub(crate) async fn stream_search(
    cancel: &CancellationToken,
    proc: &mut Process,
    shards: &[Arc<RankedShard>],
    q: Query,
    opts: &SearchOptions,
    sender: &dyn Sender,
) -> Result<()> {
    if shards.is_empty() {
        return Ok(());
    }

    let token = cancel.child_token();
    // Cancels the wall time timer once the search is over.
    let _stop = token.clone().drop_guard();
    if !opts.max_wall_time.is_zero() {
        let t = token.clone();
        let budget = opts.max_wall_time;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(budget) => t.cancel(),
                _ = t.cancelled() => {}
            }
        });
    }

    let q = Arc::new(q);
    let shared_opts = Arc::new(opts.clone());
    let workers = num_cpus().min(shards.len());
    let (work_tx, work_rx) = mpsc::channel::<Arc<RankedShard>>(workers);
    let (results_tx, mut results_rx) = mpsc::channel::<ShardResult>(workers);
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

    for _ in 0..workers {
        let work_rx = Arc::clone(&work_rx);
        let results_tx = results_tx.clone();
        let token = token.clone();
        let q = Arc::clone(&q);
        let opts = Arc::clone(&shared_opts);
        tokio::spawn(async move {
            loop {
                let next = work_rx.lock().await.recv().await;
                let Some(shard) = next else { break };
                let r = search_one_shard(token.clone(), shard, q.clone(), opts.clone()).await;
                if results_tx.send(r).await.is_err() {
                    break;
                }
            }
        });
    }
    // The results channel closes once every worker has exited.
    drop(results_tx);

    let mut work_tx = Some(work_tx);
    let mut next = 0usize;
    let mut pending = PrioritySlice::default();
    let mut total_match_count = 0usize;
    let mut err: Option<Error> = None;

    loop {
        if proc.maybe_yield(&token).await.is_err() {
            work_tx = None;
        }
        if next >= shards.len() {
            work_tx = None;
        }

        // The select output may hold a permit borrowing `work_tx`, so the
        // sender is only dropped once the select is over.
        let mut stop_dispatch = false;
        tokio::select! {
            biased;
            _ = token.cancelled(), if work_tx.is_some() => {
                tracing::debug!(dispatched = next, total = shards.len(), "search cancelled, stop dispatching");
                stop_dispatch = true;
            }
            r = results_rx.recv() => {
                let Some(r) = r else { break };
                pending.remove(r.priority);
                match r.result {
                    Err(e) => {
                        tracing::warn!(error = %e, "shard search failed");
                        err.get_or_insert(e);
                        stop_dispatch = true;
                    }
                    Ok(mut sr) => {
                        // Shards are dispatched in priority order so the next
                        // undispatched one bounds everything not yet queued.
                        let mut max_pending = pending.max();
                        if work_tx.is_some() && next < shards.len() {
                            max_pending = max_pending.max(shards[next].priority());
                        }
                        sr.progress = Progress {
                            priority: r.priority,
                            max_pending_priority: max_pending,
                        };
                        total_match_count += sr.stats.match_count;
                        send_by_repository(sr, sender);

                        if opts.total_max_match_count > 0
                            && total_match_count > opts.total_max_match_count
                        {
                            stop_dispatch = true;
                        }
                    }
                }
            }
            permit = reserve(&work_tx), if work_tx.is_some() => match permit {
                Some(permit) => {
                    let shard = Arc::clone(&shards[next]);
                    pending.append(shard.priority());
                    permit.send(shard);
                    next += 1;
                }
                None => stop_dispatch = true,
            },
        }
        if stop_dispatch {
            work_tx = None;
        }
    }

    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
