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

use memmap2::Mmap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, Range};
use std::sync::Arc;
use std::time::Duration;

/// Byte buffer carried by search results.
///
/// Shards hand out `Mapped` slices that point straight into their memory map.
/// The map is reference counted, so a slice never dangles, but it pins the
/// whole shard file until it is detached with [`ShardBytes::detach`].
#[derive(Clone)]
pub enum ShardBytes {
    Owned(Vec<u8>),
    Mapped { map: Arc<Mmap>, range: Range<usize> },
}

impl ShardBytes {
    pub fn mapped(map: Arc<Mmap>, range: Range<usize>) -> Self {
        ShardBytes::Mapped { map, range }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ShardBytes::Owned(v) => v,
            ShardBytes::Mapped { map, range } => &map[range.clone()],
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, ShardBytes::Mapped { .. })
    }

    /// Replace a mapped slice with an owned copy of its bytes.
    pub fn detach(&mut self) {
        if let ShardBytes::Mapped { .. } = self {
            *self = ShardBytes::Owned(self.as_slice().to_vec());
        }
    }
}

impl Default for ShardBytes {
    fn default() -> Self {
        ShardBytes::Owned(Vec::new())
    }
}

impl Deref for ShardBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for ShardBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for ShardBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_slice()))
    }
}

impl From<Vec<u8>> for ShardBytes {
    fn from(v: Vec<u8>) -> Self {
        ShardBytes::Owned(v)
    }
}

impl From<&[u8]> for ShardBytes {
    fn from(v: &[u8]) -> Self {
        ShardBytes::Owned(v.to_vec())
    }
}

impl From<&str> for ShardBytes {
    fn from(v: &str) -> Self {
        ShardBytes::Owned(v.as_bytes().to_vec())
    }
}

impl Serialize for ShardBytes {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(self.as_slice()))
    }
}

/// An indexed branch: a name combined with a version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryBranch {
    pub name: String,
    pub version: String,
}

/// Repository metadata as stored in a shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub id: u32,
    pub name: String,
    pub url: String,
    pub branches: Vec<RepositoryBranch>,
    /// Free-form configuration; `priority` feeds shard ranking.
    pub raw_config: HashMap<String, String>,
    pub file_url_template: String,
    pub line_fragment_template: String,
    pub has_symbols: bool,
    pub tombstone: bool,
}

impl Repository {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.raw_config
            .insert("priority".to_string(), priority.to_string());
        self
    }

    /// Priority parsed from `raw_config["priority"]`, 0 when absent or malformed.
    pub fn priority(&self) -> f64 {
        self.raw_config
            .get("priority")
            .and_then(|p| p.parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    /// Merge the fields that may change without re-indexing (raw config and
    /// URL templates). Returns true if anything changed. Metadata for a
    /// different repository is ignored.
    pub fn merge_mutable(&mut self, other: &Repository) -> bool {
        if self.name != other.name || self.id != other.id {
            return false;
        }
        let mut mutated = false;
        for (k, v) in &other.raw_config {
            if self.raw_config.get(k) != Some(v) {
                self.raw_config.insert(k.clone(), v.clone());
                mutated = true;
            }
        }
        for (dst, src) in [
            (&mut self.url, &other.url),
            (&mut self.file_url_template, &other.file_url_template),
            (&mut self.line_fragment_template, &other.line_fragment_template),
        ] {
            if !src.is_empty() && dst != src {
                *dst = src.clone();
                mutated = true;
            }
        }
        mutated
    }
}

/// Why an aggregated batch was flushed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    TimerExpired,
    FinalFlush,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::TimerExpired => write!(f, "timer_expired"),
            FlushReason::FinalFlush => write!(f, "final_flush"),
        }
    }
}

/// Counters describing the work done for a search. Every field is a plain
/// sum so batches can be aggregated with [`Stats::add`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    /// Amount of I/O for reading contents.
    pub content_bytes_loaded: u64,
    /// Amount of I/O for reading from the index.
    pub index_bytes_loaded: u64,
    /// Number of shards that crashed (or results possibly missing while loading).
    pub crashes: usize,
    pub duration: Duration,
    /// Number of files containing a match.
    pub file_count: usize,
    pub shard_files_considered: usize,
    pub files_considered: usize,
    pub files_loaded: usize,
    /// Candidate files skipped because enough matches were gathered.
    pub files_skipped: usize,
    pub shards_scanned: usize,
    /// Shards not processed because the query was cancelled.
    pub shards_skipped: usize,
    pub shards_skipped_filter: usize,
    /// Number of non-overlapping matches.
    pub match_count: usize,
    pub ngram_matches: usize,
    pub ngram_lookups: usize,
    /// Time spent queued in the scheduler.
    pub wait: Duration,
    pub regexps_considered: usize,
    pub flush_reason: Option<FlushReason>,
}

impl Stats {
    pub fn add(&mut self, o: &Stats) {
        self.content_bytes_loaded += o.content_bytes_loaded;
        self.index_bytes_loaded += o.index_bytes_loaded;
        self.crashes += o.crashes;
        self.duration += o.duration;
        self.file_count += o.file_count;
        self.shard_files_considered += o.shard_files_considered;
        self.files_considered += o.files_considered;
        self.files_loaded += o.files_loaded;
        self.files_skipped += o.files_skipped;
        self.shards_scanned += o.shards_scanned;
        self.shards_skipped += o.shards_skipped;
        self.shards_skipped_filter += o.shards_skipped_filter;
        self.match_count += o.match_count;
        self.ngram_matches += o.ngram_matches;
        self.ngram_lookups += o.ngram_lookups;
        self.wait += o.wait;
        self.regexps_considered += o.regexps_considered;

        // The first flush reason sticks when aggregating several batches.
        if self.flush_reason.is_none() {
            self.flush_reason = o.flush_reason;
        }
    }

    pub fn is_zero(&self) -> bool {
        let mut zeroed = self.clone();
        zeroed.flush_reason = None;
        zeroed == Stats::default()
    }
}

/// Global progress of a running query, used by callers to reorder results
/// once they are known to be stable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    /// Priority of the shard that produced this batch.
    pub priority: f64,
    /// Highest priority among shards still being searched. Decreases
    /// monotonically over the batches of one request.
    pub max_pending_priority: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineFragmentMatch {
    /// Offset within the line.
    pub line_offset: usize,
    /// Offset within the file.
    pub offset: u32,
    pub match_length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineMatch {
    pub line: ShardBytes,
    pub line_start: usize,
    pub line_end: usize,
    pub line_number: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<ShardBytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<ShardBytes>,
    /// The match was on the file name rather than the content.
    pub file_name: bool,
    pub score: f64,
    pub fragments: Vec<LineFragmentMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileMatch {
    pub file_name: String,
    pub repository: String,
    pub repository_id: u32,
    pub repository_priority: f64,
    pub branches: Vec<String>,
    pub language: String,
    pub score: f64,
    pub line_matches: Vec<LineMatch>,
    /// Whole file content, only set when `SearchOptions::whole` is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ShardBytes>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResult {
    pub stats: Stats,
    // -inf cannot be encoded in JSON
    #[serde(skip)]
    pub progress: Progress,
    pub files: Vec<FileMatch>,
    /// Repository name to file URL template.
    pub repo_urls: HashMap<String, String>,
    /// Repository name to line fragment template.
    pub line_fragments: HashMap<String, String>,
}

impl SearchResult {
    pub fn match_count(&self) -> usize {
        self.files
            .iter()
            .map(|f| f.line_matches.len().max(1))
            .sum()
    }
}

/// Sort file matches by descending score. The sort is stable so equally
/// scored files keep their shard order.
pub fn sort_files(files: &mut [FileMatch]) {
    files.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Detach every byte buffer in the result from shard memory.
pub fn copy_files(sr: &mut SearchResult) {
    for f in &mut sr.files {
        if let Some(c) = f.content.as_mut() {
            c.detach();
        }
        for lm in &mut f.line_matches {
            lm.line.detach();
            if let Some(b) = lm.before.as_mut() {
                b.detach();
            }
            if let Some(a) = lm.after.as_mut() {
                a.detach();
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    /// Return the whole file content.
    pub whole: bool,
    /// Stop processing a shard after this many non-overlapping matches.
    pub shard_max_match_count: usize,
    /// Stop dispatching shards once this many matches were found across shards.
    pub total_max_match_count: usize,
    /// Abort the search after this much time. Zero disables the budget.
    pub max_wall_time: Duration,
    /// Collate and sort results for up to this long before streaming. Zero
    /// streams every batch immediately.
    pub flush_wall_time: Duration,
    /// Truncate the number of files after collating and sorting.
    pub max_doc_display_count: usize,
    /// Truncate the number of line matches after collating and sorting.
    pub max_match_display_count: usize,
    /// Lines of context to attach before and after each matched line.
    pub num_context_lines: usize,
}

// Succinct form for logs: only non-default fields are printed.
impl fmt::Display for SearchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SearchOptions{{ ")?;
        for (name, v) in [
            ("ShardMaxMatchCount", self.shard_max_match_count),
            ("TotalMaxMatchCount", self.total_max_match_count),
            ("MaxDocDisplayCount", self.max_doc_display_count),
            ("MaxMatchDisplayCount", self.max_match_display_count),
            ("NumContextLines", self.num_context_lines),
        ] {
            if v != 0 {
                write!(f, "{}={} ", name, v)?;
            }
        }
        for (name, d) in [
            ("MaxWallTime", self.max_wall_time),
            ("FlushWallTime", self.flush_wall_time),
        ] {
            if !d.is_zero() {
                write!(f, "{}={:?} ", name, d)?;
            }
        }
        if self.whole {
            write!(f, "Whole ")?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepoStats {
    pub repos: usize,
    pub shards: usize,
    pub documents: usize,
    pub index_bytes: u64,
    pub content_bytes: u64,
    pub new_lines_count: u64,
    pub default_branch_new_lines_count: u64,
    pub other_branches_new_lines_count: u64,
}

impl RepoStats {
    pub fn add(&mut self, o: &RepoStats) {
        // repos is deliberately not summed: a repository may span shards.
        self.shards += o.shards;
        self.documents += o.documents;
        self.index_bytes += o.index_bytes;
        self.content_bytes += o.content_bytes;
        self.new_lines_count += o.new_lines_count;
        self.default_branch_new_lines_count += o.default_branch_new_lines_count;
        self.other_branches_new_lines_count += o.other_branches_new_lines_count;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepoListEntry {
    pub repository: Repository,
    pub stats: RepoStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MinimalRepoListEntry {
    pub has_symbols: bool,
    pub branches: Vec<RepositoryBranch>,
    pub index_time_unix: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepoList {
    pub repos: Vec<RepoListEntry>,
    pub repos_map: HashMap<u32, MinimalRepoListEntry>,
    pub crashes: usize,
    /// Aggregate stats of all repositories matching the query.
    pub stats: RepoStats,
}

/// Which field of [`RepoList`] a `List` call populates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepoListField {
    #[default]
    Repos,
    ReposMap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub field: RepoListField,
}
