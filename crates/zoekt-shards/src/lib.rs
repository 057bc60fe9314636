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

//! Concurrent, priority-aware search over a hot-swappable set of index shards.
//! A `ShardedSearcher` admits requests through a two-pool scheduler, prunes
//! shards by repository set, fans the query out and streams merged results.

pub mod collect;
pub mod config;
pub mod error;
pub mod loader;
pub mod query;
pub mod registry;
pub mod sched;
pub mod searcher;
pub mod select;
pub mod shard;
pub mod sharded;
mod stream;
pub mod types;
pub mod watcher;

pub use crate::config::{load_shards_config, MergeOpts, ShardsConfig};
pub use crate::error::{Error, Result};
pub use crate::loader::{DirectorySearcher, FileShardOpener, RegistryLoader, ShardOpener};
pub use crate::query::{BranchRepos, Query};
pub use crate::registry::{Loaded, RankedShard, ShardRegistry};
pub use crate::sched::{Process, ProcessState, Scheduler, SchedulerConfig};
pub use crate::searcher::{Searcher, Sender, SenderFn};
pub use crate::select::select_repo_set;
pub use crate::shard::{FileShard, ShardDocument, ShardWriter};
pub use crate::sharded::ShardedSearcher;
pub use crate::types::{
    FileMatch, FlushReason, LineMatch, ListOptions, Progress, RepoList, RepoListField,
    Repository, RepositoryBranch, SearchOptions, SearchResult, ShardBytes, Stats,
};
pub use crate::watcher::{version_from_path, DirectoryWatcher, ShardLoader, WatcherState};
