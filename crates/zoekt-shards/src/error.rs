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

use std::path::PathBuf;

/// Typed errors returned by the sharded searcher and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request context was cancelled or its deadline expired.
    #[error("search cancelled")]
    Cancelled,
    /// A scheduler semaphore was closed underneath a waiting request.
    #[error("scheduler closed")]
    SchedulerClosed,
    /// A single shard returned an error from `Search` or `List`.
    #[error("shard {shard}: {source}")]
    Shard {
        shard: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid shard {}: {reason}", path.display())]
    InvalidShard { path: PathBuf, reason: String },
    #[error("watcher: {0}")]
    Watch(String),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
