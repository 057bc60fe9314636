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
use crate::types::{ListOptions, RepoList, SearchOptions, SearchResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A single searchable unit, usually one index shard.
///
/// Calls are synchronous and CPU bound; the sharded searcher runs them on the
/// blocking thread pool. Implementations should poll `cancel` between
/// documents and return early once it fires.
pub trait Searcher: Send + Sync + 'static {
    fn search(
        &self,
        cancel: &CancellationToken,
        q: &Query,
        opts: &SearchOptions,
    ) -> anyhow::Result<SearchResult>;

    fn list(
        &self,
        cancel: &CancellationToken,
        q: &Query,
        opts: &ListOptions,
    ) -> anyhow::Result<RepoList>;

    /// Release resources. Called exactly once, after the last in-flight
    /// search holding this searcher has finished.
    fn close(&self) {}

    /// Human readable name used in logs.
    fn describe(&self) -> String;
}

/// Receives streamed search results.
pub trait Sender: Send + Sync {
    fn send(&self, sr: SearchResult);
}

impl<S: Sender + ?Sized> Sender for Arc<S> {
    fn send(&self, sr: SearchResult) {
        (**self).send(sr)
    }
}

/// Adapts a closure into a [`Sender`].
pub struct SenderFn<F>(pub F);

impl<F> Sender for SenderFn<F>
where
    F: Fn(SearchResult) + Send + Sync,
{
    fn send(&self, sr: SearchResult) {
        (self.0)(sr)
    }
}
