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

use crate::config::ShardsConfig;
use crate::error::Result;
use crate::registry::ShardRegistry;
use crate::searcher::Searcher;
use crate::shard::FileShard;
use crate::sharded::ShardedSearcher;
use crate::watcher::{DirectoryWatcher, ShardLoader};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Publish partially loaded batches at least this often.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Turns a shard path into a searcher.
pub trait ShardOpener: Send + Sync + 'static {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn Searcher>>;
}

impl<F> ShardOpener for F
where
    F: Fn(&Path) -> anyhow::Result<Box<dyn Searcher>> + Send + Sync + 'static,
{
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn Searcher>> {
        self(path)
    }
}

/// Opens shards with [`FileShard::open`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FileShardOpener;

impl ShardOpener for FileShardOpener {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn Searcher>> {
        Ok(Box::new(FileShard::open(path)?))
    }
}

/// Loads shard files into a [`ShardRegistry`] on behalf of the watcher.
pub struct RegistryLoader {
    registry: Arc<ShardRegistry>,
    opener: Arc<dyn ShardOpener>,
    failures: AtomicUsize,
    progress_interval: Duration,
}

struct Batch {
    shards: HashMap<String, Option<Box<dyn Searcher>>>,
    loaded: usize,
    last_publish: Instant,
}

impl RegistryLoader {
    pub fn new(registry: Arc<ShardRegistry>, opener: Arc<dyn ShardOpener>) -> Self {
        Self {
            registry,
            opener,
            failures: AtomicUsize::new(0),
            progress_interval: PROGRESS_INTERVAL,
        }
    }

    /// Publish partially loaded batches every `interval` instead of every
    /// five seconds.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Shards that failed to open since creation.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

impl ShardLoader for RegistryLoader {
    fn load(&self, keys: &[String]) {
        let total = keys.len();
        let batch = Mutex::new(Batch {
            shards: HashMap::with_capacity(total),
            loaded: 0,
            last_publish: Instant::now(),
        });

        keys.par_iter().for_each(|key| {
            let opened = self.opener.open(Path::new(key));
            let chunk = {
                let mut b = batch.lock();
                match opened {
                    Ok(s) => {
                        b.shards.insert(key.clone(), Some(s));
                    }
                    Err(e) => {
                        // A previously loaded version stays in place.
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(shard = %key, error = %e, "failed to load shard");
                    }
                }
                b.loaded += 1;
                if b.last_publish.elapsed() < self.progress_interval {
                    return;
                }
                b.last_publish = Instant::now();
                tracing::info!(loaded = b.loaded, total, "loading shards");
                std::mem::take(&mut b.shards)
            };
            // Ranking lists every shard, so publish without holding the batch.
            self.registry.replace(chunk);
        });

        let chunk = std::mem::take(&mut batch.lock().shards);
        self.registry.replace(chunk);
        tracing::info!(total, shards = self.registry.len(), "finished loading shards");
        self.registry.mark_ready();
    }

    fn drop_shards(&self, keys: &[String]) {
        let deltas: HashMap<String, Option<Box<dyn Searcher>>> =
            keys.iter().map(|k| (k.clone(), None)).collect();
        self.registry.replace(deltas);
    }
}

/// A [`ShardedSearcher`] kept in sync with an index directory.
pub struct DirectorySearcher {
    searcher: ShardedSearcher,
    watcher: DirectoryWatcher,
    loader: Arc<RegistryLoader>,
}

impl DirectorySearcher {
    pub async fn open(cfg: &ShardsConfig) -> Result<Self> {
        Self::open_with(cfg, Arc::new(FileShardOpener)).await
    }

    pub async fn open_with(cfg: &ShardsConfig, opener: Arc<dyn ShardOpener>) -> Result<Self> {
        let registry = Arc::new(ShardRegistry::new());
        let searcher = ShardedSearcher::new(Arc::clone(&registry), cfg.capacity, &cfg.sched);
        let loader = Arc::new(RegistryLoader::new(Arc::clone(&registry), opener));
        let watcher = DirectoryWatcher::start(
            &cfg.index_dir,
            Arc::clone(&loader) as Arc<dyn ShardLoader>,
            cfg.rescan_interval,
        )?;

        // An empty directory never triggers a load, so readiness also
        // follows the watcher.
        let ready = watcher.wait_until_ready();
        if cfg.wait_until_ready {
            ready.await?;
            registry.mark_ready();
        } else {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                if ready.await.is_ok() {
                    registry.mark_ready();
                }
            });
        }

        tracing::info!(dir = %cfg.index_dir.display(), "opened directory searcher");
        Ok(Self {
            searcher,
            watcher,
            loader,
        })
    }

    pub fn watcher(&self) -> &DirectoryWatcher {
        &self.watcher
    }

    pub fn loader(&self) -> &RegistryLoader {
        &self.loader
    }

    /// Stop the watcher, then drop every shard.
    pub async fn close(&self) {
        self.watcher.stop().await;
        self.searcher.close();
    }
}

impl Deref for DirectorySearcher {
    type Target = ShardedSearcher;

    fn deref(&self) -> &ShardedSearcher {
        &self.searcher
    }
}
