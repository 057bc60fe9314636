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

//! Repository set pushdown.
//!
//! Queries of the form `(AND (reposet ...) q)` only need the shards holding
//! at least one of the named repositories. When every repository of every
//! remaining shard is in the set the predicate is redundant and is replaced
//! by `TRUE` up front instead of being re-evaluated per shard.

use crate::query::Query;
use crate::registry::RankedShard;
use crate::types::Repository;
use std::borrow::Cow;
use std::sync::Arc;

/// `(any, all)` over the repositories of one shard. A shard without
/// repository metadata matches nothing.
fn has_repos(repos: &[Repository], pred: &dyn Fn(&Repository) -> bool) -> (bool, bool) {
    let mut any = false;
    let mut all = true;
    for r in repos {
        let b = pred(r);
        any |= b;
        all &= b;
    }
    (any, all)
}

/// Prune `shards` against the first repository set predicate of `q` and
/// rewrite the query when the predicate no longer discriminates.
pub fn select_repo_set<'a>(
    shards: &'a [Arc<RankedShard>],
    q: &Query,
) -> (Cow<'a, [Arc<RankedShard>]>, Query) {
    match q {
        Query::And(children) => select_in_and(shards, children),
        other => {
            // Wrap so `(reposet ...)` alone gets the same treatment, then
            // unwrap again.
            let (shards, q) = select_in_and(shards, std::slice::from_ref(other));
            (shards, q.simplify())
        }
    }
}

fn select_in_and<'a>(
    shards: &'a [Arc<RankedShard>],
    children: &[Query],
) -> (Cow<'a, [Arc<RankedShard>]>, Query) {
    for (i, c) in children.iter().enumerate() {
        let (set_size, pred): (usize, Box<dyn Fn(&Repository) -> bool + '_>) = match c {
            Query::RepoSet(set) => (set.len(), Box::new(move |r: &Repository| set.contains(&r.name))),
            Query::RepoIds(ids) => (ids.len(), Box::new(move |r: &Repository| ids.contains(&r.id))),
            Query::Repo(re) => (0, Box::new(move |r: &Repository| re.is_match(&r.name))),
            Query::BranchesRepos(brs) => (
                brs.iter().map(|br| br.repos.len()).sum(),
                Box::new(move |r: &Repository| brs.iter().any(|br| br.repos.contains(&r.id))),
            ),
            _ => continue,
        };

        let mut filtered = Vec::with_capacity(set_size.min(shards.len()));
        let mut filtered_all = true;
        for s in shards {
            let (any, all) = has_repos(s.repos(), pred.as_ref());
            if any {
                filtered.push(Arc::clone(s));
                filtered_all &= all;
            }
        }

        let and = Query::And(children.to_vec());
        if filtered.is_empty() || !filtered_all {
            return (Cow::Owned(filtered), and);
        }

        let replacement = match c {
            Query::BranchesRepos(brs) => match brs.as_slice() {
                [only] => Query::Branch {
                    pattern: only.branch.clone(),
                    exact: true,
                },
                // Repositories want different branches; keep the predicate.
                _ => return (Cow::Owned(filtered), and),
            },
            _ => Query::Const(true),
        };
        let mut rewritten = children.to_vec();
        rewritten[i] = replacement;
        return (Cow::Owned(filtered), Query::And(rewritten).simplify());
    }

    (Cow::Borrowed(shards), Query::And(children.to_vec()))
}
