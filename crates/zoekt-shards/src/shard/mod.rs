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

//! A simple memory mapped shard file: `FileShard` reads it, `ShardWriter`
//! writes it.
//!
//! Layout: `[magic u32][version u32][header_len u64][JSON header][content]`,
//! all integers little endian. Document offsets in the header are relative
//! to the start of the content blob.

use crate::types::Repository;
use serde::{Deserialize, Serialize};

pub const MAGIC: u32 = 0x5a53_4844; // 'ZSHD'
pub const VERSION: u32 = 1;
pub(crate) const PREAMBLE_LEN: usize = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ShardHeader {
    pub repos: Vec<Repository>,
    pub docs: Vec<DocEntry>,
    pub index_time_unix: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct DocEntry {
    pub name: String,
    /// Index into `ShardHeader::repos`.
    pub repo: u32,
    pub branches: Vec<String>,
    pub language: String,
    pub offset: u64,
    pub len: u64,
}

mod eval;

mod reader;
pub use reader::FileShard;

mod writer;
pub use writer::{write_meta, ShardDocument, ShardWriter};
