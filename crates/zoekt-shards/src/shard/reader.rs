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

use super::eval;
use super::{DocEntry, ShardHeader, MAGIC, PREAMBLE_LEN, VERSION};
use crate::query::Query;
use crate::searcher::Searcher;
use crate::types::{ListOptions, RepoList, Repository, SearchOptions, SearchResult};
use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A read-only shard backed by a memory map.
///
/// Line matches point into the map; they keep it alive through their own
/// `Arc`, so closing the shard never invalidates a result.
pub struct FileShard {
    path: PathBuf,
    pub(crate) map: Arc<Mmap>,
    pub(crate) blob_start: usize,
    pub(crate) repos: Vec<Repository>,
    pub(crate) docs: Vec<DocEntry>,
    pub(crate) index_time_unix: i64,
    closed: AtomicBool,
}

fn read_u32(map: &[u8], at: usize) -> Result<u32> {
    let b = map
        .get(at..at + 4)
        .with_context(|| format!("shard truncated reading u32 at {}", at))?;
    Ok(u32::from_le_bytes(b.try_into()?))
}

fn read_u64(map: &[u8], at: usize) -> Result<u64> {
    let b = map
        .get(at..at + 8)
        .with_context(|| format!("shard truncated reading u64 at {}", at))?;
    Ok(u64::from_le_bytes(b.try_into()?))
}

impl FileShard {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        // SAFETY: shard files are written once and replaced atomically, never
        // modified in place.
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < PREAMBLE_LEN {
            bail!("file too small (len={})", map.len())
        }
        let magic = read_u32(&map, 0)?;
        let version = read_u32(&map, 4)?;
        if magic != MAGIC || version != VERSION {
            bail!("bad header (magic={:#x}, version={})", magic, version)
        }
        let header_len = read_u64(&map, 8)? as usize;
        let blob_start = PREAMBLE_LEN
            .checked_add(header_len)
            .filter(|end| *end <= map.len())
            .with_context(|| format!("shard header length {} out of range", header_len))?;
        let header: ShardHeader = serde_json::from_slice(&map[PREAMBLE_LEN..blob_start])
            .context("shard header corrupted")?;

        let blob_len = (map.len() - blob_start) as u64;
        for d in &header.docs {
            if d.offset.saturating_add(d.len) > blob_len {
                bail!("document {} extends past end of shard", d.name)
            }
            if d.repo as usize >= header.repos.len() {
                bail!("document {} refers to unknown repository {}", d.name, d.repo)
            }
        }

        let mut repos = header.repos;
        merge_meta(path, &mut repos)?;

        Ok(Self {
            path: path.to_path_buf(),
            map: Arc::new(map),
            blob_start,
            repos,
            docs: header.docs,
            index_time_unix: header.index_time_unix,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn repositories(&self) -> &[Repository] {
        &self.repos
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn doc_range(&self, d: &DocEntry) -> std::ops::Range<usize> {
        let start = self.blob_start + d.offset as usize;
        start..start + d.len as usize
    }
}

/// Overlay mutable repository fields from `<path>.meta`, when present. The
/// sidecar holds either one repository or a list of them.
fn merge_meta(path: &Path, repos: &mut [Repository]) -> Result<()> {
    let mut meta_path = path.as_os_str().to_owned();
    meta_path.push(crate::watcher::META_SUFFIX);
    let meta_path = PathBuf::from(meta_path);
    let bytes = match std::fs::read(&meta_path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("read {}", meta_path.display())),
    };
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", meta_path.display()))?;
    let overrides: Vec<Repository> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    for o in &overrides {
        for r in repos.iter_mut() {
            if r.merge_mutable(o) {
                tracing::debug!(repo = %r.name, meta = %meta_path.display(), "merged repository metadata");
            }
        }
    }
    Ok(())
}

impl Searcher for FileShard {
    fn search(
        &self,
        cancel: &CancellationToken,
        q: &Query,
        opts: &SearchOptions,
    ) -> anyhow::Result<SearchResult> {
        eval::search_shard(self, cancel, q, opts)
    }

    fn list(
        &self,
        _cancel: &CancellationToken,
        q: &Query,
        opts: &ListOptions,
    ) -> anyhow::Result<RepoList> {
        eval::list_shard(self, q, opts)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(shard = %self.path.display(), "closed file shard");
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
