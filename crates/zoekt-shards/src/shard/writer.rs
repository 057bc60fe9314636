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

use super::{DocEntry, ShardHeader, MAGIC, VERSION};
use crate::types::Repository;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// A document to be written into a shard.
#[derive(Debug, Clone, Default)]
pub struct ShardDocument {
    pub name: String,
    /// Index of the owning repository as returned by [`ShardWriter::add_repo`].
    pub repo: usize,
    pub branches: Vec<String>,
    pub language: String,
    pub content: Vec<u8>,
}

impl ShardDocument {
    pub fn new(repo: usize, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            repo,
            branches: vec!["HEAD".to_string()],
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Collects repositories and documents and writes them as one shard file.
#[derive(Debug, Default)]
pub struct ShardWriter {
    repos: Vec<Repository>,
    docs: Vec<ShardDocument>,
}

impl ShardWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repo(&mut self, repo: Repository) -> usize {
        self.repos.push(repo);
        self.repos.len() - 1
    }

    pub fn add_document(&mut self, doc: ShardDocument) {
        self.docs.push(doc);
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let mut header = ShardHeader {
            repos: self.repos.clone(),
            docs: Vec::with_capacity(self.docs.len()),
            index_time_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        };

        let mut offset = 0u64;
        for d in &self.docs {
            if d.repo >= self.repos.len() {
                bail!("document {} refers to unknown repository {}", d.name, d.repo);
            }
            header.docs.push(DocEntry {
                name: d.name.clone(),
                repo: d.repo as u32,
                branches: d.branches.clone(),
                language: d.language.clone(),
                offset,
                len: d.content.len() as u64,
            });
            offset += d.content.len() as u64;
        }
        let header_bytes = serde_json::to_vec(&header).context("encode shard header")?;

        let file = File::create(path)
            .with_context(|| format!("create shard file {}", path.display()))?;
        let mut w = BufWriter::new(file);
        w.write_all(&MAGIC.to_le_bytes())?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
        w.write_all(&header_bytes)?;
        for d in &self.docs {
            w.write_all(&d.content)?;
        }
        w.flush()?;
        tracing::debug!(
            shard = %path.display(),
            repos = self.repos.len(),
            docs = self.docs.len(),
            "wrote shard"
        );
        Ok(path.to_path_buf())
    }
}

/// Write the `<shard>.meta` sidecar holding repository metadata overrides.
pub fn write_meta(shard_path: impl AsRef<Path>, repos: &[Repository]) -> Result<PathBuf> {
    let mut p = shard_path.as_ref().as_os_str().to_owned();
    p.push(crate::watcher::META_SUFFIX);
    let p = PathBuf::from(p);
    let bytes = serde_json::to_vec_pretty(repos).context("encode meta sidecar")?;
    std::fs::write(&p, bytes).with_context(|| format!("write {}", p.display()))?;
    Ok(p)
}
