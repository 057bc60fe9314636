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

//! Senders that sit between the executor and the caller: aggregation,
//! timed flushing, display truncation and the final copy out of shard memory.

use crate::searcher::Sender;
use crate::types::{copy_files, sort_files, FileMatch, FlushReason, SearchOptions, SearchResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Merges streamed batches into one sorted result.
#[derive(Debug)]
pub struct Collector {
    aggregate: Option<SearchResult>,
    max_doc_display_count: usize,
}

impl Collector {
    pub fn new(opts: &SearchOptions) -> Self {
        Self {
            aggregate: None,
            max_doc_display_count: opts.max_doc_display_count,
        }
    }

    pub fn add(&mut self, sr: SearchResult) {
        let first = self.aggregate.is_none();
        let agg = self.aggregate.get_or_insert_with(SearchResult::default);
        if first {
            agg.progress = sr.progress;
        } else {
            // Batches arrive with non-increasing max pending priority.
            agg.progress.priority = agg.progress.priority.max(sr.progress.priority);
            agg.progress.max_pending_priority = sr.progress.max_pending_priority;
        }
        agg.stats.add(&sr.stats);

        if !sr.files.is_empty() {
            agg.files.extend(sr.files);
            agg.repo_urls.extend(sr.repo_urls);
            agg.line_fragments.extend(sr.line_fragments);
            sort_files(&mut agg.files);
            if self.max_doc_display_count > 0 {
                agg.files.truncate(self.max_doc_display_count);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate.is_none()
    }

    /// Take the aggregate, leaving the collector empty. `None` when nothing
    /// was collected since the last call.
    pub fn done(&mut self) -> Option<SearchResult> {
        let mut agg = self.aggregate.take()?;
        sort_files(&mut agg.files);
        Some(agg)
    }
}

/// A [`Sender`] that collects everything it receives.
pub struct CollectSender {
    collector: Mutex<Collector>,
}

impl CollectSender {
    pub fn new(opts: &SearchOptions) -> Self {
        Self {
            collector: Mutex::new(Collector::new(opts)),
        }
    }

    pub fn done(&self) -> Option<SearchResult> {
        self.collector.lock().done()
    }
}

impl Sender for CollectSender {
    fn send(&self, sr: SearchResult) {
        self.collector.lock().add(sr);
    }
}

struct FlushState {
    /// `Some` while buffering, `None` after the one-way switch to pass-through.
    collector: Mutex<Option<Collector>>,
    sender: Arc<dyn Sender>,
}

impl FlushState {
    fn flush(&self, reason: FlushReason) {
        let mut collector = self.collector.lock();
        let Some(mut c) = collector.take() else {
            return;
        };
        if let Some(mut agg) = c.done() {
            agg.stats.flush_reason = Some(reason);
            self.sender.send(agg);
        }
    }
}

struct FlushCollectSender {
    state: Arc<FlushState>,
}

impl Sender for FlushCollectSender {
    fn send(&self, sr: SearchResult) {
        let mut collector = self.state.collector.lock();
        match collector.as_mut() {
            Some(c) => c.add(sr),
            None => self.state.sender.send(sr),
        }
    }
}

/// Handle returned by [`new_flush_collect_sender`] that ends buffering.
pub struct FinalFlush {
    state: Option<Arc<FlushState>>,
    timer: CancellationToken,
}

impl FinalFlush {
    /// Flush buffered results with [`FlushReason::FinalFlush`] unless the
    /// timer already did.
    pub fn flush(self) {
        self.timer.cancel();
        if let Some(state) = &self.state {
            state.flush(FlushReason::FinalFlush);
        }
    }
}

/// Buffer results for up to `opts.flush_wall_time`, then flush the sorted
/// aggregate once and pass later batches straight through.
///
/// With a zero flush wall time `sender` is returned unchanged.
pub fn new_flush_collect_sender(
    opts: &SearchOptions,
    sender: Arc<dyn Sender>,
) -> (Arc<dyn Sender>, FinalFlush) {
    let timer = CancellationToken::new();
    if opts.flush_wall_time.is_zero() {
        return (sender, FinalFlush { state: None, timer });
    }

    let state = Arc::new(FlushState {
        collector: Mutex::new(Some(Collector::new(opts))),
        sender,
    });

    let timer_state = Arc::clone(&state);
    let stop = timer.clone();
    let wait = opts.flush_wall_time;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(wait) => timer_state.flush(FlushReason::TimerExpired),
            _ = stop.cancelled() => {}
        }
    });

    (
        Arc::new(FlushCollectSender {
            state: Arc::clone(&state),
        }),
        FinalFlush {
            state: Some(state),
            timer,
        },
    )
}

/// Enforces `max_doc_display_count` and `max_match_display_count` across
/// consecutive batches.
#[derive(Debug)]
pub struct DisplayTruncator {
    doc_limit: Option<usize>,
    match_limit: Option<usize>,
    done: bool,
}

impl DisplayTruncator {
    /// Returns `None` when the options set no display limits.
    pub fn new(opts: &SearchOptions) -> Option<Self> {
        let doc_limit = (opts.max_doc_display_count > 0).then_some(opts.max_doc_display_count);
        let match_limit =
            (opts.max_match_display_count > 0).then_some(opts.max_match_display_count);
        if doc_limit.is_none() && match_limit.is_none() {
            return None;
        }
        Some(Self {
            doc_limit,
            match_limit,
            done: false,
        })
    }

    /// Trim `files` to the remaining budget. Returns false once the budget
    /// is exhausted and no further files can be shown.
    pub fn truncate(&mut self, files: &mut Vec<FileMatch>) -> bool {
        if self.done {
            files.clear();
            return false;
        }
        if let Some(limit) = self.doc_limit.as_mut() {
            if files.len() >= *limit {
                files.truncate(*limit);
                self.done = true;
            }
            *limit -= files.len();
        }
        if let Some(limit) = self.match_limit.as_mut() {
            *limit = limit_line_matches(files, *limit);
            if *limit == 0 {
                self.done = true;
            }
        }
        !self.done
    }
}

/// Keep at most `limit` line matches across `files`, dropping files after the
/// budget runs out. Returns the remaining budget.
fn limit_line_matches(files: &mut Vec<FileMatch>, mut limit: usize) -> usize {
    let mut keep = files.len();
    for (i, f) in files.iter_mut().enumerate() {
        f.line_matches.truncate(limit);
        limit -= f.line_matches.len();
        if limit == 0 {
            keep = i + 1;
            break;
        }
    }
    files.truncate(keep);
    limit
}

/// Applies a [`DisplayTruncator`] and cancels `stop` once the display budget
/// is used up, so no more shards get searched.
pub struct LimitSender {
    truncator: Mutex<DisplayTruncator>,
    stop: CancellationToken,
    sender: Arc<dyn Sender>,
}

impl LimitSender {
    pub fn wrap(
        opts: &SearchOptions,
        stop: CancellationToken,
        sender: Arc<dyn Sender>,
    ) -> Arc<dyn Sender> {
        match DisplayTruncator::new(opts) {
            Some(truncator) => Arc::new(LimitSender {
                truncator: Mutex::new(truncator),
                stop,
                sender,
            }),
            None => sender,
        }
    }
}

impl Sender for LimitSender {
    fn send(&self, mut sr: SearchResult) {
        let more = self.truncator.lock().truncate(&mut sr.files);
        if !more {
            self.stop.cancel();
        }
        self.sender.send(sr);
    }
}

/// Detaches every result from shard memory before passing it on.
pub struct CopySender {
    sender: Arc<dyn Sender>,
}

impl CopySender {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self { sender }
    }
}

impl Sender for CopySender {
    fn send(&self, mut sr: SearchResult) {
        copy_files(&mut sr);
        self.sender.send(sr);
    }
}
