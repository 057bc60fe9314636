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

//! Per-document query evaluation for [`FileShard`].

use super::reader::FileShard;
use super::DocEntry;
use crate::query::{BranchRepos, Query};
use crate::types::{
    FileMatch, LineFragmentMatch, LineMatch, ListOptions, MinimalRepoListEntry, RepoList,
    RepoListEntry, RepoListField, RepoStats, Repository, SearchOptions, SearchResult, ShardBytes,
    Stats,
};
use anyhow::Result;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A query compiled for matching against raw document bytes.
enum Matcher<'q> {
    Const(bool),
    Substring {
        needle: Vec<u8>,
        case_sensitive: bool,
        file_name: bool,
        content: bool,
    },
    Regexp {
        re: regex::bytes::Regex,
        file_name: bool,
        content: bool,
    },
    Branch {
        pattern: &'q str,
        exact: bool,
    },
    Repo(&'q Regex),
    RepoSet(&'q BTreeSet<String>),
    RepoIds(&'q BTreeSet<u32>),
    BranchesRepos(&'q [BranchRepos]),
    And(Vec<Matcher<'q>>),
    Or(Vec<Matcher<'q>>),
    Not(Box<Matcher<'q>>),
}

impl<'q> Matcher<'q> {
    fn compile(q: &'q Query) -> Result<Self> {
        Ok(match q {
            Query::Const(b) => Matcher::Const(*b),
            Query::Substring {
                pattern,
                case_sensitive,
                file_name,
                content,
            } => Matcher::Substring {
                needle: if *case_sensitive {
                    pattern.as_bytes().to_vec()
                } else {
                    pattern.to_ascii_lowercase().into_bytes()
                },
                case_sensitive: *case_sensitive,
                file_name: *file_name,
                content: *content,
            },
            Query::Regexp {
                regex,
                file_name,
                content,
            } => Matcher::Regexp {
                re: regex::bytes::Regex::new(regex.as_str())?,
                file_name: *file_name,
                content: *content,
            },
            Query::Branch { pattern, exact } => Matcher::Branch {
                pattern,
                exact: *exact,
            },
            Query::Repo(re) => Matcher::Repo(re),
            Query::RepoSet(set) => Matcher::RepoSet(set),
            Query::RepoIds(ids) => Matcher::RepoIds(ids),
            Query::BranchesRepos(brs) => Matcher::BranchesRepos(brs),
            Query::And(qs) => Matcher::And(qs.iter().map(Matcher::compile).collect::<Result<_>>()?),
            Query::Or(qs) => Matcher::Or(qs.iter().map(Matcher::compile).collect::<Result<_>>()?),
            Query::Not(inner) => Matcher::Not(Box::new(Matcher::compile(inner)?)),
        })
    }

    /// Evaluate for one document, appending match positions to `hits` when
    /// the document matches.
    fn matches(&self, doc: &Doc<'_>, hits: &mut Vec<Hit>) -> bool {
        match self {
            Matcher::Const(b) => *b,
            Matcher::Substring {
                needle,
                case_sensitive,
                file_name,
                content,
            } => {
                if needle.is_empty() {
                    return true;
                }
                let before = hits.len();
                if !*content {
                    let name = if *case_sensitive {
                        doc.name.as_bytes().to_vec()
                    } else {
                        doc.name.to_ascii_lowercase().into_bytes()
                    };
                    find_all(&name, needle, true, hits);
                }
                if !*file_name {
                    if *case_sensitive {
                        find_all(doc.content, needle, false, hits);
                    } else {
                        find_all(&doc.content.to_ascii_lowercase(), needle, false, hits);
                    }
                }
                hits.len() > before
            }
            Matcher::Regexp {
                re,
                file_name,
                content,
            } => {
                let before = hits.len();
                if !*content {
                    for m in re.find_iter(doc.name.as_bytes()) {
                        if m.start() < m.end() {
                            hits.push(Hit::new(true, m.start(), m.end()));
                        }
                    }
                }
                if !*file_name {
                    for m in re.find_iter(doc.content) {
                        if m.start() < m.end() {
                            hits.push(Hit::new(false, m.start(), m.end()));
                        }
                    }
                }
                hits.len() > before
            }
            Matcher::Branch { pattern, exact } => doc.entry.branches.iter().any(|b| {
                if *exact {
                    b == pattern
                } else {
                    b.contains(pattern)
                }
            }),
            Matcher::Repo(re) => re.is_match(&doc.repo.name),
            Matcher::RepoSet(set) => set.contains(&doc.repo.name),
            Matcher::RepoIds(ids) => ids.contains(&doc.repo.id),
            Matcher::BranchesRepos(brs) => brs.iter().any(|br| {
                br.repos.contains(&doc.repo.id) && doc.entry.branches.iter().any(|b| *b == br.branch)
            }),
            Matcher::And(ms) => {
                let mut local = Vec::new();
                for m in ms {
                    if !m.matches(doc, &mut local) {
                        return false;
                    }
                }
                hits.append(&mut local);
                true
            }
            Matcher::Or(ms) => {
                let mut any = false;
                for m in ms {
                    any |= m.matches(doc, hits);
                }
                any
            }
            Matcher::Not(m) => !m.matches(doc, &mut Vec::new()),
        }
    }

    /// Repository level evaluation: `None` when the answer depends on
    /// document contents.
    fn matches_repo(&self, repo: &Repository) -> Option<bool> {
        match self {
            Matcher::Const(b) => Some(*b),
            Matcher::Substring { .. } | Matcher::Regexp { .. } => None,
            Matcher::Branch { pattern, exact } => {
                let any = repo.branches.iter().any(|b| {
                    if *exact {
                        b.name == *pattern
                    } else {
                        b.name.contains(pattern)
                    }
                });
                if any || repo.branches.is_empty() {
                    None
                } else {
                    Some(false)
                }
            }
            Matcher::Repo(re) => Some(re.is_match(&repo.name)),
            Matcher::RepoSet(set) => Some(set.contains(&repo.name)),
            Matcher::RepoIds(ids) => Some(ids.contains(&repo.id)),
            Matcher::BranchesRepos(brs) => Some(brs.iter().any(|br| br.repos.contains(&repo.id))),
            Matcher::And(ms) => {
                let mut all = Some(true);
                for m in ms {
                    match m.matches_repo(repo) {
                        Some(false) => return Some(false),
                        None => all = None,
                        Some(true) => {}
                    }
                }
                all
            }
            Matcher::Or(ms) => {
                let mut any = Some(false);
                for m in ms {
                    match m.matches_repo(repo) {
                        Some(true) => return Some(true),
                        None => any = None,
                        Some(false) => {}
                    }
                }
                any
            }
            Matcher::Not(m) => m.matches_repo(repo).map(|b| !b),
        }
    }
}

struct Doc<'a> {
    entry: &'a DocEntry,
    repo: &'a Repository,
    name: &'a str,
    content: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    file_name: bool,
    start: usize,
    end: usize,
}

impl Hit {
    fn new(file_name: bool, start: usize, end: usize) -> Self {
        Self {
            file_name,
            start,
            end,
        }
    }
}

/// Non-overlapping occurrences of `needle` in `haystack`.
fn find_all(haystack: &[u8], needle: &[u8], file_name: bool, hits: &mut Vec<Hit>) {
    let n = needle.len();
    let mut i = 0;
    while i + n <= haystack.len() {
        if &haystack[i..i + n] == needle {
            hits.push(Hit::new(file_name, i, i + n));
            i += n;
        } else {
            i += 1;
        }
    }
}

/// Offsets at which each line of `content` starts.
fn line_starts(content: &[u8]) -> Vec<usize> {
    let mut starts = vec![0];
    starts.extend(
        content
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .map(|(i, _)| i + 1)
            .filter(|i| *i < content.len()),
    );
    starts
}

fn line_for_offset(starts: &[usize], pos: usize) -> usize {
    starts.partition_point(|s| *s <= pos).saturating_sub(1)
}

/// `[begin, end)` of a line excluding its trailing newline.
fn line_bounds(starts: &[usize], line: usize, content: &[u8]) -> (usize, usize) {
    let begin = starts[line];
    let mut end = starts.get(line + 1).copied().unwrap_or(content.len());
    if end > begin && content[end - 1] == b'\n' {
        end -= 1;
    }
    (begin, end)
}

fn build_line_matches(
    shard: &FileShard,
    doc: &Doc<'_>,
    abs_start: usize,
    hits: &mut [Hit],
    context: usize,
) -> Vec<LineMatch> {
    hits.sort_by_key(|h| (!h.file_name, h.start));
    let mut out: Vec<LineMatch> = Vec::new();

    let name_hits: Vec<&Hit> = hits.iter().filter(|h| h.file_name).collect();
    if !name_hits.is_empty() {
        out.push(LineMatch {
            line: ShardBytes::from(doc.name),
            line_end: doc.name.len(),
            file_name: true,
            score: name_hits.len() as f64,
            fragments: name_hits
                .iter()
                .map(|h| LineFragmentMatch {
                    line_offset: h.start,
                    offset: h.start as u32,
                    match_length: h.end - h.start,
                })
                .collect(),
            ..Default::default()
        });
    }

    let content_hits: Vec<&Hit> = hits.iter().filter(|h| !h.file_name).collect();
    if content_hits.is_empty() {
        return out;
    }
    let starts = line_starts(doc.content);
    let mapped = |b: usize, e: usize| ShardBytes::mapped(shard.map.clone(), abs_start + b..abs_start + e);

    let mut current: Option<(usize, LineMatch)> = None;
    for h in content_hits {
        let line = line_for_offset(&starts, h.start);
        let (begin, end) = line_bounds(&starts, line, doc.content);
        let fragment = LineFragmentMatch {
            line_offset: h.start - begin,
            offset: h.start as u32,
            match_length: h.end.min(end.max(h.start + 1)) - h.start,
        };
        match current.as_mut() {
            Some((l, lm)) if *l == line => {
                lm.fragments.push(fragment);
                lm.score += 1.0;
            }
            _ => {
                if let Some((_, lm)) = current.take() {
                    out.push(lm);
                }
                let mut lm = LineMatch {
                    line: mapped(begin, end),
                    line_start: begin,
                    line_end: end,
                    line_number: line + 1,
                    score: 1.0,
                    fragments: vec![fragment],
                    ..Default::default()
                };
                if context > 0 {
                    let first = line.saturating_sub(context);
                    if first < line {
                        let (b, _) = line_bounds(&starts, first, doc.content);
                        lm.before = Some(mapped(b, begin));
                    }
                    let last = (line + context).min(starts.len() - 1);
                    if last > line {
                        let (_, e) = line_bounds(&starts, last, doc.content);
                        let after_begin = starts[line + 1];
                        lm.after = Some(mapped(after_begin, e.max(after_begin)));
                    }
                }
                current = Some((line, lm));
            }
        }
    }
    if let Some((_, lm)) = current {
        out.push(lm);
    }
    out
}

pub(super) fn search_shard(
    shard: &FileShard,
    cancel: &CancellationToken,
    q: &Query,
    opts: &SearchOptions,
) -> Result<SearchResult> {
    let start = Instant::now();
    let matcher = Matcher::compile(q)?;
    let mut sr = SearchResult {
        stats: Stats {
            shards_scanned: 1,
            shard_files_considered: 1,
            ..Default::default()
        },
        ..Default::default()
    };

    // Skip repositories the query rules out without touching documents.
    let repo_ok: Vec<bool> = shard
        .repos
        .iter()
        .map(|r| !r.tombstone && matcher.matches_repo(r) != Some(false))
        .collect();
    if !repo_ok.iter().any(|ok| *ok) {
        sr.stats.shards_skipped_filter = 1;
        sr.stats.duration = start.elapsed();
        return Ok(sr);
    }

    for (i, entry) in shard.docs.iter().enumerate() {
        if cancel.is_cancelled() {
            sr.stats.files_skipped += shard.docs.len() - i;
            break;
        }
        if opts.shard_max_match_count > 0 && sr.stats.match_count >= opts.shard_max_match_count {
            sr.stats.files_skipped += shard.docs.len() - i;
            break;
        }
        let repo_idx = entry.repo as usize;
        if !repo_ok[repo_idx] {
            continue;
        }
        let repo = &shard.repos[repo_idx];
        let range = shard.doc_range(entry);
        let abs_start = range.start;
        let doc = Doc {
            entry,
            repo,
            name: &entry.name,
            content: &shard.map[range.clone()],
        };
        sr.stats.files_considered += 1;
        sr.stats.files_loaded += 1;
        sr.stats.content_bytes_loaded += entry.len;

        let mut hits = Vec::new();
        if !matcher.matches(&doc, &mut hits) {
            continue;
        }

        let line_matches =
            build_line_matches(shard, &doc, abs_start, &mut hits, opts.num_context_lines);
        sr.stats.match_count += line_matches
            .iter()
            .map(|lm| lm.fragments.len())
            .sum::<usize>()
            .max(1);
        sr.stats.file_count += 1;

        sr.repo_urls
            .entry(repo.name.clone())
            .or_insert_with(|| repo.file_url_template.clone());
        sr.line_fragments
            .entry(repo.name.clone())
            .or_insert_with(|| repo.line_fragment_template.clone());
        sr.files.push(FileMatch {
            file_name: entry.name.clone(),
            repository: repo.name.clone(),
            repository_id: repo.id,
            repository_priority: repo.priority(),
            branches: entry.branches.clone(),
            language: entry.language.clone(),
            score: hits.len() as f64,
            line_matches,
            content: opts
                .whole
                .then(|| ShardBytes::mapped(shard.map.clone(), range)),
        });
    }

    sr.stats.duration = start.elapsed();
    Ok(sr)
}

pub(super) fn list_shard(shard: &FileShard, q: &Query, opts: &ListOptions) -> Result<RepoList> {
    let mut rl = RepoList::default();
    let matcher = Matcher::compile(q)?;

    let mut per_repo: HashMap<usize, RepoStats> = HashMap::new();
    for d in &shard.docs {
        let st = per_repo.entry(d.repo as usize).or_default();
        let content = &shard.map[shard.doc_range(d)];
        let lines = content.iter().filter(|b| **b == b'\n').count() as u64;
        let repo = &shard.repos[d.repo as usize];
        let on_default = match (repo.branches.first(), d.branches.first()) {
            (Some(default), Some(b)) => default.name == *b,
            _ => true,
        };
        st.documents += 1;
        st.content_bytes += d.len;
        st.new_lines_count += lines;
        if on_default {
            st.default_branch_new_lines_count += lines;
        } else {
            st.other_branches_new_lines_count += lines;
        }
    }

    let live = shard.repos.iter().filter(|r| !r.tombstone).count().max(1) as u64;
    for (i, repo) in shard.repos.iter().enumerate() {
        if repo.tombstone || matcher.matches_repo(repo) == Some(false) {
            continue;
        }
        let mut stats = per_repo.remove(&i).unwrap_or_default();
        stats.shards = 1;
        stats.index_bytes = shard.map.len() as u64 / live;
        rl.stats.add(&stats);
        match opts.field {
            RepoListField::Repos => rl.repos.push(RepoListEntry {
                repository: repo.clone(),
                stats,
            }),
            RepoListField::ReposMap => {
                rl.repos_map.insert(
                    repo.id,
                    MinimalRepoListEntry {
                        has_symbols: repo.has_symbols,
                        branches: repo.branches.clone(),
                        index_time_unix: shard.index_time_unix,
                    },
                );
            }
        }
    }
    rl.stats.repos = rl.repos.len() + rl.repos_map.len();
    Ok(rl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_all_is_non_overlapping() {
        let mut hits = Vec::new();
        find_all(b"aaaa", b"aa", false, &mut hits);
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[1].start, hits[1].end), (2, 4));
    }

    #[test]
    fn line_helpers() {
        let content = b"one\ntwo\nthree\n";
        let starts = line_starts(content);
        assert_eq!(starts, vec![0, 4, 8]);
        assert_eq!(line_for_offset(&starts, 5), 1);
        assert_eq!(line_bounds(&starts, 2, content), (8, 13));
        assert_eq!(line_bounds(&starts, 0, content), (0, 3));
    }
}
