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

//! Keeps a [`ShardLoader`] in sync with the `*.zoekt` files of a directory.

use crate::error::{Error, Result};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Current shard format version written by indexers.
pub const INDEX_FORMAT_VERSION: u32 = 16;
/// Newest format version this reader accepts.
pub const NEXT_INDEX_FORMAT_VERSION: u32 = 17;
/// Fallback rescan period for filesystem events that were missed.
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(60);

pub const SHARD_SUFFIX: &str = ".zoekt";
pub const META_SUFFIX: &str = ".meta";

/// Receives shard paths that need (re)loading or unloading.
///
/// Both calls are made from the blocking pool and may take a while.
pub trait ShardLoader: Send + Sync + 'static {
    fn load(&self, keys: &[String]);
    fn drop_shards(&self, keys: &[String]);
}

/// Split `name_v16.00000.zoekt` into `("name", 16)`. Paths without a
/// parsable version are returned unchanged with version 0.
pub fn version_from_path(path: &str) -> (&str, u32) {
    let Some(und) = path.rfind('_') else {
        return (path, 0);
    };
    let Some(dot) = path[und..].find('.') else {
        return (path, 0);
    };
    let Some(digits) = path[und..und + dot].strip_prefix("_v") else {
        return (path, 0);
    };
    match digits.parse::<u32>() {
        Ok(v) => (&path[..und], v),
        Err(_) => (path, 0),
    }
}

fn mod_time(path: &Path) -> Option<SystemTime> {
    std::fs::symlink_metadata(path)
        .and_then(|m| m.modified())
        .ok()
}

struct Scanner {
    dir: PathBuf,
    timestamps: HashMap<String, SystemTime>,
    loader: Arc<dyn ShardLoader>,
}

impl Scanner {
    fn scan(&mut self) -> Result<()> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SHARD_SUFFIX))
            {
                files.push(path.to_string_lossy().into_owned());
            }
        }

        let mut latest: HashMap<&str, u32> = HashMap::new();
        for f in &files {
            let (name, version) = version_from_path(f);
            // Never pick up formats newer than we can read.
            if version > NEXT_INDEX_FORMAT_VERSION {
                continue;
            }
            let v = latest.entry(name).or_insert(0);
            *v = (*v).max(version);
        }

        let mut ts: HashMap<String, SystemTime> = HashMap::new();
        for f in &files {
            let (name, version) = version_from_path(f);
            if latest.get(name) != Some(&version) {
                continue;
            }
            let Some(mut mtime) = mod_time(Path::new(f)) else {
                continue;
            };
            if let Some(meta) = mod_time(Path::new(&format!("{}{}", f, META_SUFFIX))) {
                mtime = mtime.max(meta);
            }
            ts.insert(f.clone(), mtime);
        }

        let mut to_load = Vec::new();
        for (k, mtime) in &ts {
            if self.timestamps.get(k) != Some(mtime) {
                to_load.push(k.clone());
                self.timestamps.insert(k.clone(), *mtime);
            }
        }

        let to_drop: Vec<String> = self
            .timestamps
            .keys()
            .filter(|k| !ts.contains_key(*k))
            .cloned()
            .collect();
        for k in &to_drop {
            self.timestamps.remove(k);
        }

        if !to_drop.is_empty() {
            tracing::info!(count = to_drop.len(), dir = %self.dir.display(), "unloading shards");
            self.loader.drop_shards(&to_drop);
        }
        if !to_load.is_empty() {
            to_load.sort();
            tracing::info!(count = to_load.len(), dir = %self.dir.display(), "loading shards");
            self.loader.load(&to_load);
        }
        Ok(())
    }
}

async fn scan_blocking(scanner: &Arc<Mutex<Scanner>>) -> Result<()> {
    let scanner = Arc::clone(scanner);
    tokio::task::spawn_blocking(move || scanner.lock().scan())
        .await
        .map_err(|e| Error::Watch(format!("scan task failed: {}", e)))?
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    /// Initial scan in progress.
    Scanning,
    /// Initial scan done, reacting to changes.
    Watching,
    /// The initial scan or watch setup failed.
    Failed(String),
    Stopped,
}

/// Watches a shard directory until [`DirectoryWatcher::stop`] is called.
pub struct DirectoryWatcher {
    dir: PathBuf,
    quit: CancellationToken,
    state: watch::Receiver<WatcherState>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryWatcher {
    /// Start watching `dir`. The initial scan runs in the background; use
    /// [`DirectoryWatcher::wait_until_ready`] to wait for it.
    pub fn start(
        dir: impl Into<PathBuf>,
        loader: Arc<dyn ShardLoader>,
        rescan_interval: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        if !std::fs::metadata(&dir)?.is_dir() {
            return Err(Error::Watch(format!("{} is not a directory", dir.display())));
        }

        let scanner = Arc::new(Mutex::new(Scanner {
            dir: dir.clone(),
            timestamps: HashMap::new(),
            loader,
        }));
        let quit = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(WatcherState::Scanning);
        let handle = tokio::spawn(run(
            dir.clone(),
            scanner,
            quit.clone(),
            state_tx,
            rescan_interval,
        ));

        Ok(Self {
            dir,
            quit,
            state: state_rx,
            handle: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> WatcherState {
        self.state.borrow().clone()
    }

    /// Wait for the initial scan to finish. The returned future does not
    /// borrow the watcher.
    pub fn wait_until_ready(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut rx = self.state.clone();
        async move {
            let state = rx
                .wait_for(|s| *s != WatcherState::Scanning)
                .await
                .map_err(|_| Error::Watch("watcher exited during initial scan".to_string()))?
                .clone();
            match state {
                WatcherState::Failed(msg) => Err(Error::Watch(msg)),
                _ => Ok(()),
            }
        }
    }

    /// Stop watching and wait for the background task to exit. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        self.quit.cancel();
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            if let Err(e) = h.await {
                tracing::warn!(error = %e, "directory watcher task failed");
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.quit.cancel();
    }
}

async fn run(
    dir: PathBuf,
    scanner: Arc<Mutex<Scanner>>,
    quit: CancellationToken,
    state: watch::Sender<WatcherState>,
    rescan_interval: Duration,
) {
    if let Err(e) = scan_blocking(&scanner).await {
        tracing::error!(dir = %dir.display(), error = %e, "initial shard scan failed");
        state.send_replace(WatcherState::Failed(e.to_string()));
        return;
    }

    // Depth one: notifications arriving while a rescan is pending coalesce.
    let (signal_tx, mut signal_rx) = mpsc::channel::<()>(1);
    let watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(_) => {
                let _ = signal_tx.try_send(());
            }
            Err(e) => tracing::warn!(error = %e, "watch error"),
        },
        Config::default(),
    )
    .and_then(|mut w| w.watch(&dir, RecursiveMode::NonRecursive).map(|_| w));
    let _watcher = match watcher {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "failed to watch shard directory");
            state.send_replace(WatcherState::Failed(e.to_string()));
            return;
        }
    };
    state.send_replace(WatcherState::Watching);
    tracing::info!(dir = %dir.display(), "watching shard directory");

    let mut ticker = tokio::time::interval(rescan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = quit.cancelled() => break,
            _ = ticker.tick() => {}
            Some(()) = signal_rx.recv() => {}
        }
        if let Err(e) = scan_blocking(&scanner).await {
            tracing::warn!(dir = %dir.display(), error = %e, "shard rescan failed");
        }
    }

    state.send_replace(WatcherState::Stopped);
    tracing::info!(dir = %dir.display(), "stopped watching shard directory");
}
