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

use common::{repo, FakeShard};
use std::collections::BTreeSet;
use std::sync::Arc;
use zoekt_shards::{select_repo_set, BranchRepos, Query, RankedShard, Repository};

fn ranked(name: &str, repos: Vec<Repository>) -> Arc<RankedShard> {
    Arc::new(RankedShard::new(name, FakeShard::new(name, repos).boxed()).unwrap())
}

fn names(shards: &[Arc<RankedShard>]) -> Vec<&str> {
    shards.iter().map(|s| s.name()).collect()
}

fn content() -> Query {
    Query::substring("needle")
}

fn with_branches(mut r: Repository, branches: &[&str]) -> Repository {
    r.branches = branches
        .iter()
        .map(|b| zoekt_shards::RepositoryBranch {
            name: b.to_string(),
            version: "v1".to_string(),
        })
        .collect();
    r
}

#[test]
fn partial_match_keeps_predicate() {
    let shards = vec![
        ranked("A", vec![repo(1, "repoX", 0.0), repo(2, "repoY", 0.0)]),
        ranked("B", vec![repo(3, "repoZ", 0.0)]),
        ranked("C", vec![repo(4, "repoX", 0.0)]),
    ];
    let q = Query::and(vec![Query::repo_set(["repoX"]), content()]);

    let (selected, rewritten) = select_repo_set(&shards, &q);
    assert_eq!(names(&selected), vec!["A", "C"]);
    // Shard A also holds repoY, so the predicate still discriminates.
    assert_eq!(rewritten, q);
}

#[test]
fn full_match_drops_predicate() {
    let shards = vec![
        ranked("A", vec![repo(1, "repoX", 0.0)]),
        ranked("B", vec![repo(2, "repoY", 0.0)]),
    ];
    let q = Query::and(vec![Query::repo_set(["repoX"]), content()]);

    let (selected, rewritten) = select_repo_set(&shards, &q);
    assert_eq!(names(&selected), vec!["A"]);
    assert_eq!(rewritten, content());
}

#[test]
fn no_match_selects_nothing() {
    let shards = vec![ranked("A", vec![repo(1, "repoX", 0.0)])];
    let q = Query::and(vec![Query::repo_set(["missing"]), content()]);

    let (selected, rewritten) = select_repo_set(&shards, &q);
    assert!(selected.is_empty());
    assert_eq!(rewritten, q);
}

#[test]
fn repo_ids_and_regex_predicates() {
    let shards = vec![
        ranked("A", vec![repo(1, "github.com/a/one", 0.0)]),
        ranked("B", vec![repo(2, "gitlab.com/b/two", 0.0)]),
    ];

    let q = Query::and(vec![Query::repo_ids([2]), content()]);
    let (selected, rewritten) = select_repo_set(&shards, &q);
    assert_eq!(names(&selected), vec!["B"]);
    assert_eq!(rewritten, content());

    let q = Query::and(vec![Query::repo("^github\\.com/").unwrap(), content()]);
    let (selected, rewritten) = select_repo_set(&shards, &q);
    assert_eq!(names(&selected), vec!["A"]);
    assert_eq!(rewritten, content());
}

#[test]
fn only_first_predicate_is_consulted() {
    let shards = vec![
        ranked("A", vec![repo(1, "x", 0.0)]),
        ranked("B", vec![repo(2, "y", 0.0)]),
    ];
    let q = Query::and(vec![
        Query::repo_set(["x", "y"]),
        Query::repo_ids([2]),
        content(),
    ]);

    let (selected, rewritten) = select_repo_set(&shards, &q);
    // The id predicate would prune A but is never looked at.
    assert_eq!(names(&selected), vec!["A", "B"]);
    assert_eq!(
        rewritten,
        Query::and(vec![Query::repo_ids([2]), content()])
    );
}

#[test]
fn single_branch_becomes_branch_query() {
    let shards = vec![
        ranked("A", vec![with_branches(repo(1, "x", 0.0), &["main"])]),
        ranked("B", vec![with_branches(repo(2, "y", 0.0), &["main"])]),
    ];
    let q = Query::and(vec![
        Query::BranchesRepos(vec![BranchRepos {
            branch: "main".to_string(),
            repos: BTreeSet::from([1]),
        }]),
        content(),
    ]);

    let (selected, rewritten) = select_repo_set(&shards, &q);
    assert_eq!(names(&selected), vec!["A"]);
    assert_eq!(
        rewritten,
        Query::and(vec![
            Query::Branch {
                pattern: "main".to_string(),
                exact: true,
            },
            content(),
        ])
    );
}

#[test]
fn several_branches_keep_predicate() {
    let shards = vec![
        ranked("A", vec![repo(1, "x", 0.0)]),
        ranked("B", vec![repo(2, "y", 0.0)]),
    ];
    let q = Query::and(vec![
        Query::BranchesRepos(vec![
            BranchRepos {
                branch: "main".to_string(),
                repos: BTreeSet::from([1]),
            },
            BranchRepos {
                branch: "dev".to_string(),
                repos: BTreeSet::from([2]),
            },
        ]),
        content(),
    ]);

    let (selected, rewritten) = select_repo_set(&shards, &q);
    assert_eq!(names(&selected), vec!["A", "B"]);
    assert_eq!(rewritten, q);
}

#[test]
fn bare_predicate_is_wrapped() {
    let shards = vec![
        ranked("A", vec![repo(1, "x", 0.0)]),
        ranked("B", vec![repo(2, "y", 0.0)]),
    ];

    let (selected, rewritten) = select_repo_set(&shards, &Query::repo_set(["y"]));
    assert_eq!(names(&selected), vec!["B"]);
    assert_eq!(rewritten, Query::Const(true));
}

#[test]
fn shards_without_metadata_are_excluded() {
    let shards = vec![ranked("A", vec![repo(1, "x", 0.0)]), ranked("empty", vec![])];
    let q = Query::and(vec![Query::repo_set(["x"]), content()]);

    let (selected, _) = select_repo_set(&shards, &q);
    assert_eq!(names(&selected), vec!["A"]);
}

#[test]
fn no_predicate_keeps_everything() {
    let shards = vec![
        ranked("A", vec![repo(1, "x", 0.0)]),
        ranked("empty", vec![]),
    ];

    let (selected, rewritten) = select_repo_set(&shards, &content());
    assert_eq!(names(&selected), vec!["A", "empty"]);
    assert_eq!(rewritten, content());
}
