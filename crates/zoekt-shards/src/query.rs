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

use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;

/// A set of repository ids that should be searched on one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRepos {
    pub branch: String,
    pub repos: BTreeSet<u32>,
}

#[derive(Debug, Clone)]
pub enum Query {
    Const(bool),
    Substring {
        pattern: String,
        case_sensitive: bool,
        /// Match only against the file name.
        file_name: bool,
        /// Match only against the content.
        content: bool,
    },
    Regexp {
        regex: Regex,
        file_name: bool,
        content: bool,
    },
    Branch {
        pattern: String,
        /// Require an exact branch name instead of a substring.
        exact: bool,
    },
    /// Repository name matches the regex.
    Repo(Regex),
    /// Repository name is in the set.
    RepoSet(BTreeSet<String>),
    /// Repository id is in the set.
    RepoIds(BTreeSet<u32>),
    BranchesRepos(Vec<BranchRepos>),
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
}

impl Query {
    pub fn substring(pattern: impl Into<String>) -> Self {
        Query::Substring {
            pattern: pattern.into(),
            case_sensitive: false,
            file_name: false,
            content: false,
        }
    }

    pub fn regexp(re: &str) -> Result<Self, regex::Error> {
        Ok(Query::Regexp {
            regex: Regex::new(re)?,
            file_name: false,
            content: false,
        })
    }

    pub fn repo(re: &str) -> Result<Self, regex::Error> {
        Ok(Query::Repo(Regex::new(re)?))
    }

    pub fn repo_set<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Query::RepoSet(names.into_iter().map(Into::into).collect())
    }

    pub fn repo_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        Query::RepoIds(ids.into_iter().collect())
    }

    pub fn and(children: Vec<Query>) -> Self {
        Query::And(children)
    }

    pub fn or(children: Vec<Query>) -> Self {
        Query::Or(children)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(q: Query) -> Self {
        Query::Not(Box::new(q))
    }

    /// Collapse constant children and flatten nested conjunctions and
    /// disjunctions.
    pub fn simplify(self) -> Query {
        match self {
            Query::And(children) => {
                let mut out = Vec::with_capacity(children.len());
                for c in children {
                    match c.simplify() {
                        Query::Const(true) => {}
                        Query::Const(false) => return Query::Const(false),
                        Query::And(nested) => out.extend(nested),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Query::Const(true),
                    1 => out.pop().unwrap_or(Query::Const(true)),
                    _ => Query::And(out),
                }
            }
            Query::Or(children) => {
                let mut out = Vec::with_capacity(children.len());
                for c in children {
                    match c.simplify() {
                        Query::Const(false) => {}
                        Query::Const(true) => return Query::Const(true),
                        Query::Or(nested) => out.extend(nested),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Query::Const(false),
                    1 => out.pop().unwrap_or(Query::Const(false)),
                    _ => Query::Or(out),
                }
            }
            Query::Not(inner) => match inner.simplify() {
                Query::Const(b) => Query::Const(!b),
                Query::Not(double) => *double,
                other => Query::Not(Box::new(other)),
            },
            other => other,
        }
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        use Query::*;
        match (self, other) {
            (Const(a), Const(b)) => a == b,
            (
                Substring {
                    pattern: p1,
                    case_sensitive: c1,
                    file_name: f1,
                    content: n1,
                },
                Substring {
                    pattern: p2,
                    case_sensitive: c2,
                    file_name: f2,
                    content: n2,
                },
            ) => p1 == p2 && c1 == c2 && f1 == f2 && n1 == n2,
            (
                Regexp {
                    regex: r1,
                    file_name: f1,
                    content: n1,
                },
                Regexp {
                    regex: r2,
                    file_name: f2,
                    content: n2,
                },
            ) => r1.as_str() == r2.as_str() && f1 == f2 && n1 == n2,
            (
                Branch {
                    pattern: p1,
                    exact: e1,
                },
                Branch {
                    pattern: p2,
                    exact: e2,
                },
            ) => p1 == p2 && e1 == e2,
            (Repo(a), Repo(b)) => a.as_str() == b.as_str(),
            (RepoSet(a), RepoSet(b)) => a == b,
            (RepoIds(a), RepoIds(b)) => a == b,
            (BranchesRepos(a), BranchesRepos(b)) => a == b,
            (And(a), And(b)) | (Or(a), Or(b)) => a == b,
            (Not(a), Not(b)) => a == b,
            _ => false,
        }
    }
}

fn write_children(f: &mut fmt::Formatter<'_>, op: &str, qs: &[Query]) -> fmt::Result {
    write!(f, "({}", op)?;
    for q in qs {
        write!(f, " {}", q)?;
    }
    write!(f, ")")
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Const(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Query::Substring {
                pattern,
                case_sensitive,
                file_name,
                content,
            } => {
                let scope = if *file_name {
                    "file_"
                } else if *content {
                    "content_"
                } else {
                    ""
                };
                let case = if *case_sensitive { "case_" } else { "" };
                write!(f, "{}{}substr:{:?}", scope, case, pattern)
            }
            Query::Regexp {
                regex,
                file_name,
                content,
            } => {
                let scope = if *file_name {
                    "file_"
                } else if *content {
                    "content_"
                } else {
                    ""
                };
                write!(f, "{}regex:{:?}", scope, regex.as_str())
            }
            Query::Branch { pattern, exact } => {
                if *exact {
                    write!(f, "branch={:?}", pattern)
                } else {
                    write!(f, "branch:{:?}", pattern)
                }
            }
            Query::Repo(re) => write!(f, "repo:{:?}", re.as_str()),
            Query::RepoSet(set) => {
                write!(f, "(reposet")?;
                for name in set {
                    write!(f, " {}", name)?;
                }
                write!(f, ")")
            }
            Query::RepoIds(ids) => write!(f, "(repoids count:{})", ids.len()),
            Query::BranchesRepos(brs) => {
                write!(f, "(branchesrepos")?;
                for br in brs {
                    write!(f, " {}:{}", br.branch, br.repos.len())?;
                }
                write!(f, ")")
            }
            Query::And(qs) => write_children(f, "AND", qs),
            Query::Or(qs) => write_children(f, "OR", qs),
            Query::Not(inner) => write!(f, "(NOT {})", inner),
        }
    }
}
