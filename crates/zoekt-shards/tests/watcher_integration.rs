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

mod common;

use common::{eventually, init_test_logging, repo, write_shard};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zoekt_shards::{
    DirectorySearcher, DirectoryWatcher, Query, SearchOptions, ShardLoader, ShardsConfig,
    WatcherState,
};

#[derive(Default)]
struct RecordingLoader {
    loads: Mutex<Vec<Vec<String>>>,
    drops: Mutex<Vec<Vec<String>>>,
}

impl ShardLoader for RecordingLoader {
    fn load(&self, keys: &[String]) {
        self.loads.lock().push(keys.to_vec());
    }

    fn drop_shards(&self, keys: &[String]) {
        self.drops.lock().push(keys.to_vec());
    }
}

fn base_names(keys: &[String]) -> Vec<String> {
    keys.iter()
        .map(|k| {
            Path::new(k)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .collect()
}

fn touch(path: &Path) {
    std::fs::write(path, b"").unwrap();
}

#[tokio::test]
async fn initial_scan_picks_latest_readable_versions() {
    init_test_logging();
    tracing::info!("TEST START: initial_scan_picks_latest_readable_versions");
    let dir = TempDir::new().unwrap();
    for f in [
        "a_v16.00000.zoekt",
        "a_v17.00000.zoekt",
        "a_v18.00000.zoekt",
        "b.zoekt",
        "notes.txt",
    ] {
        touch(&dir.path().join(f));
    }

    let loader = Arc::new(RecordingLoader::default());
    let w = DirectoryWatcher::start(
        dir.path(),
        Arc::clone(&loader) as Arc<dyn ShardLoader>,
        Duration::from_secs(60),
    )
    .unwrap();
    w.wait_until_ready().await.unwrap();
    assert_eq!(w.state(), WatcherState::Watching);

    let loads = loader.loads.lock().clone();
    assert_eq!(loads.len(), 1);
    assert_eq!(
        base_names(&loads[0]),
        vec!["a_v17.00000.zoekt".to_string(), "b.zoekt".to_string()]
    );
    assert!(loader.drops.lock().is_empty());

    w.stop().await;
    w.stop().await;
    assert_eq!(w.state(), WatcherState::Stopped);
    tracing::info!("TEST END: initial_scan_picks_latest_readable_versions");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rescan_reloads_changed_and_drops_deleted() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a_v16.00000.zoekt");
    let b = dir.path().join("b_v16.00000.zoekt");
    touch(&a);
    touch(&b);

    let loader = Arc::new(RecordingLoader::default());
    let w = DirectoryWatcher::start(
        dir.path(),
        Arc::clone(&loader) as Arc<dyn ShardLoader>,
        Duration::from_millis(50),
    )
    .unwrap();
    w.wait_until_ready().await.unwrap();

    // A newer sidecar counts as a change of the shard.
    let meta = dir.path().join("a_v16.00000.zoekt.meta");
    touch(&meta);
    std::fs::OpenOptions::new()
        .write(true)
        .open(&meta)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
    let reloaded = eventually(Duration::from_secs(5), || {
        loader
            .loads
            .lock()
            .iter()
            .skip(1)
            .any(|keys| base_names(keys) == vec!["a_v16.00000.zoekt".to_string()])
    })
    .await;
    assert!(reloaded);

    std::fs::remove_file(&b).unwrap();
    let dropped = eventually(Duration::from_secs(5), || {
        loader
            .drops
            .lock()
            .iter()
            .any(|keys| base_names(keys) == vec!["b_v16.00000.zoekt".to_string()])
    })
    .await;
    assert!(dropped);

    w.stop().await;
}

#[tokio::test]
async fn start_requires_a_directory() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("plain");
    touch(&file);
    let loader: Arc<dyn ShardLoader> = Arc::new(RecordingLoader::default());

    assert!(DirectoryWatcher::start(&file, Arc::clone(&loader), Duration::from_secs(60)).is_err());
    assert!(DirectoryWatcher::start(
        dir.path().join("missing"),
        loader,
        Duration::from_secs(60)
    )
    .is_err());
}

fn config(dir: &Path) -> ShardsConfig {
    ShardsConfig {
        index_dir: dir.to_path_buf(),
        capacity: 2,
        wait_until_ready: true,
        rescan_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directory_searcher_follows_the_index() {
    init_test_logging();
    tracing::info!("TEST START: directory_searcher_follows_the_index");
    let dir = TempDir::new().unwrap();
    write_shard(
        dir.path().join("hello_v16.00000.zoekt"),
        repo(1, "hello", 2.0),
        &[("main.go", "package main\n// hello world\n")],
    );
    write_shard(
        dir.path().join("other_v16.00000.zoekt"),
        repo(2, "other", 1.0),
        &[("lib.go", "package lib\n// hello again\n")],
    );
    std::fs::write(dir.path().join("broken_v16.00000.zoekt"), b"junk junk junk junk").unwrap();

    let ds = DirectorySearcher::open(&config(dir.path())).await.unwrap();
    assert!(ds.registry().is_ready());
    assert_eq!(ds.registry().len(), 2);
    assert_eq!(ds.loader().failures(), 1);

    let cancel = CancellationToken::new();
    let sr = ds
        .search(&cancel, &Query::substring("hello"), &SearchOptions::default())
        .await
        .unwrap();
    let mut repos: Vec<&str> = sr.files.iter().map(|f| f.repository.as_str()).collect();
    repos.sort();
    assert_eq!(repos, vec!["hello", "other"]);
    for f in &sr.files {
        for lm in &f.line_matches {
            assert!(!lm.line.is_mapped());
        }
    }

    // Publish atomically so the watcher never sees a half written shard.
    let tmp = write_shard(
        dir.path().join("late.tmp"),
        repo(3, "late", 5.0),
        &[("x.go", "hello late\n")],
    );
    let late = dir.path().join("late_v16.00000.zoekt");
    std::fs::rename(&tmp, &late).unwrap();
    let registry = Arc::clone(ds.registry());
    assert!(eventually(Duration::from_secs(5), || registry.len() == 3).await);
    assert_eq!(
        registry.snapshot().shards[0].name(),
        late.to_string_lossy()
    );

    std::fs::remove_file(dir.path().join("other_v16.00000.zoekt")).unwrap();
    assert!(eventually(Duration::from_secs(5), || registry.len() == 2).await);

    ds.close().await;
    assert_eq!(ds.watcher().state(), WatcherState::Stopped);
    assert!(registry.is_empty());
    tracing::info!("TEST END: directory_searcher_follows_the_index");
}

#[tokio::test]
async fn empty_directory_becomes_ready() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let ds = DirectorySearcher::open(&config(dir.path())).await.unwrap();
    assert!(ds.registry().is_ready());
    let sr = ds
        .search(
            &CancellationToken::new(),
            &Query::substring("x"),
            &SearchOptions::default(),
        )
        .await
        .unwrap();
    assert!(sr.files.is_empty());
    assert_eq!(sr.stats.crashes, 0);
    ds.close().await;
}

#[tokio::test]
async fn open_fails_for_missing_directory() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let res = DirectorySearcher::open(&config(&dir.path().join("nope"))).await;
    assert!(res.is_err());
}
