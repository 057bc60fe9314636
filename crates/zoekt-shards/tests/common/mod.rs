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

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use zoekt_shards::types::{MinimalRepoListEntry, RepoListEntry, RepoStats};
use zoekt_shards::{
    FileMatch, LineMatch, ListOptions, Query, RepoList, RepoListField, Repository, SearchOptions,
    SearchResult, Searcher, Sender, ShardBytes, ShardRegistry, Stats,
};

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

pub fn repo(id: u32, name: &str, priority: f64) -> Repository {
    Repository::new(id, name).with_priority(priority)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Ok,
    Panic,
    Fail,
    /// The first `list` call (made when the shard is ranked) succeeds, later
    /// calls fail.
    FailLaterLists,
    PanicLaterLists,
    FailAllLists,
}

/// An in-memory shard returning one file per repository for every search.
pub struct FakeShard {
    pub name: String,
    pub repos: Vec<Repository>,
    pub delay: Duration,
    pub behavior: Behavior,
    pub closed: Arc<AtomicBool>,
    pub searches: Arc<AtomicUsize>,
    lists: AtomicUsize,
}

impl FakeShard {
    pub fn new(name: &str, repos: Vec<Repository>) -> Self {
        Self {
            name: name.to_string(),
            repos,
            delay: Duration::ZERO,
            behavior: Behavior::Ok,
            closed: Arc::new(AtomicBool::new(false)),
            searches: Arc::new(AtomicUsize::new(0)),
            lists: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = d;
        self
    }

    pub fn with_behavior(mut self, b: Behavior) -> Self {
        self.behavior = b;
        self
    }

    pub fn boxed(self) -> Box<dyn Searcher> {
        Box::new(self)
    }

    fn wait(&self, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }
}

impl Searcher for FakeShard {
    fn search(
        &self,
        cancel: &CancellationToken,
        _q: &Query,
        _opts: &SearchOptions,
    ) -> anyhow::Result<SearchResult> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Panic => panic!("shard {} exploded", self.name),
            Behavior::Fail => anyhow::bail!("shard {} is corrupt", self.name),
            _ => {}
        }
        if !self.wait(cancel) {
            return Ok(SearchResult {
                stats: Stats {
                    shards_scanned: 1,
                    ..Default::default()
                },
                ..Default::default()
            });
        }

        let mut sr = SearchResult {
            stats: Stats {
                shards_scanned: 1,
                file_count: self.repos.len(),
                match_count: self.repos.len(),
                ..Default::default()
            },
            ..Default::default()
        };
        for r in &self.repos {
            sr.repo_urls.insert(r.name.clone(), format!("https://{}/{{path}}", r.name));
            sr.line_fragments.insert(r.name.clone(), "#L{line}".to_string());
            sr.files.push(FileMatch {
                file_name: format!("{}/main.go", r.name),
                repository: r.name.clone(),
                repository_id: r.id,
                repository_priority: r.priority(),
                score: r.priority(),
                line_matches: vec![LineMatch {
                    line: ShardBytes::from("hit"),
                    line_number: 1,
                    ..Default::default()
                }],
                ..Default::default()
            });
        }
        Ok(sr)
    }

    fn list(
        &self,
        _cancel: &CancellationToken,
        q: &Query,
        opts: &ListOptions,
    ) -> anyhow::Result<RepoList> {
        let n = self.lists.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::FailAllLists => anyhow::bail!("cannot list {}", self.name),
            Behavior::FailLaterLists if n > 0 => anyhow::bail!("cannot list {}", self.name),
            Behavior::PanicLaterLists if n > 0 => panic!("list of {} exploded", self.name),
            _ => {}
        }
        let mut rl = RepoList::default();
        for r in self.repos.iter().filter(|r| match q {
            Query::RepoSet(set) => set.contains(&r.name),
            _ => true,
        }) {
            let stats = RepoStats {
                shards: 1,
                documents: 1,
                ..Default::default()
            };
            rl.stats.add(&stats);
            match opts.field {
                RepoListField::Repos => rl.repos.push(RepoListEntry {
                    repository: r.clone(),
                    stats,
                }),
                RepoListField::ReposMap => {
                    rl.repos_map.insert(
                        r.id,
                        MinimalRepoListEntry {
                            branches: r.branches.clone(),
                            ..Default::default()
                        },
                    );
                }
            }
        }
        rl.stats.repos = rl.repos.len() + rl.repos_map.len();
        Ok(rl)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Build a ready registry from `(key, shard)` pairs.
pub fn registry_with(shards: Vec<FakeShard>) -> Arc<ShardRegistry> {
    let registry = Arc::new(ShardRegistry::new());
    let deltas: HashMap<String, Option<Box<dyn Searcher>>> = shards
        .into_iter()
        .map(|s| (s.name.clone(), Some(s.boxed())))
        .collect();
    registry.replace(deltas);
    registry.mark_ready();
    registry
}

/// Records every batch with its arrival time.
pub struct RecordingSender {
    start: Instant,
    events: Mutex<Vec<(Duration, SearchResult)>>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<(Duration, SearchResult)> {
        self.events.lock().clone()
    }

    /// Batches that carry at least one file.
    pub fn file_events(&self) -> Vec<(Duration, SearchResult)> {
        self.events()
            .into_iter()
            .filter(|(_, sr)| !sr.files.is_empty())
            .collect()
    }

    pub fn all_files(&self) -> Vec<FileMatch> {
        self.events()
            .into_iter()
            .flat_map(|(_, sr)| sr.files)
            .collect()
    }
}

impl Sender for RecordingSender {
    fn send(&self, sr: SearchResult) {
        self.events.lock().push((self.start.elapsed(), sr));
    }
}

/// Write a single-repository shard at `path`.
pub fn write_shard(
    path: impl AsRef<std::path::Path>,
    repo: Repository,
    docs: &[(&str, &str)],
) -> std::path::PathBuf {
    let mut w = zoekt_shards::ShardWriter::new();
    let idx = w.add_repo(repo);
    for (name, content) in docs {
        w.add_document(zoekt_shards::ShardDocument::new(idx, *name, content.as_bytes()));
    }
    w.write(path).unwrap()
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
