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

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use zoekt_shards::{
    load_shards_config, DirectorySearcher, ListOptions, MergeOpts, Query, RepoListField,
    SearchOptions, SearchResult, SenderFn, ShardsConfig,
};

#[derive(Parser, Debug)]
#[command(name = "zs-search", about = "Search a directory of shards (demo)")]
struct Args {
    /// Index directory holding *.zoekt shards
    #[arg(long)]
    index: Option<std::path::PathBuf>,
    /// Substring to search for (regex with --regex). Omit with --list.
    query: Option<String>,
    /// Treat query as regex
    #[arg(long)]
    regex: bool,
    /// Match case exactly
    #[arg(long)]
    case_sensitive: bool,
    /// Restrict to these repositories (repeatable)
    #[arg(long = "repo")]
    repos: Vec<String>,
    /// List matching repositories instead of searching
    #[arg(long)]
    list: bool,
    /// Stream results as shards finish
    #[arg(long)]
    stream: bool,
    /// Buffer streamed results for this many milliseconds
    #[arg(long, default_value_t = 0)]
    flush_ms: u64,
    /// Abort the search after this many milliseconds (0 = no limit)
    #[arg(long, default_value_t = 0)]
    max_wall_ms: u64,
    /// Maximum number of files to show
    #[arg(long, default_value_t = 0)]
    max_docs: usize,
    /// Maximum number of line matches to show
    #[arg(long, default_value_t = 0)]
    max_matches: usize,
    /// Lines of context around each match
    #[arg(long, default_value_t = 0)]
    context: usize,
    /// Include whole file contents
    #[arg(long)]
    whole: bool,
    /// Optional TOML config file
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Concurrent searches (0 = CPU count)
    #[arg(long)]
    capacity: Option<usize>,
    /// Scheduler tuneables, e.g. "batchdiv=8,interactiveseconds=10"
    #[arg(long)]
    sched: Option<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_query(args: &Args) -> Result<Query> {
    let mut children = Vec::new();
    if !args.repos.is_empty() {
        children.push(Query::repo_set(args.repos.iter().cloned()));
    }
    match &args.query {
        Some(q) if args.regex => children.push(Query::regexp(q)?),
        Some(q) => children.push(Query::Substring {
            pattern: q.clone(),
            case_sensitive: args.case_sensitive,
            file_name: false,
            content: false,
        }),
        None if !args.list => anyhow::bail!("a query is required unless --list is given"),
        None => {}
    }
    Ok(Query::and(children).simplify())
}

fn print_result(sr: &SearchResult) {
    for f in &sr.files {
        match serde_json::to_string(f) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "failed to encode file match"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let cfg = load_shards_config(
        ShardsConfig {
            wait_until_ready: true,
            ..Default::default()
        },
        MergeOpts {
            config_path: args.config.clone(),
            cli_index_dir: args.index.clone(),
            cli_capacity: args.capacity,
            cli_sched: args.sched.clone(),
            cli_wait_until_ready: Some(true),
            cli_rescan_seconds: None,
        },
    )?;
    let q = build_query(&args)?;
    let searcher = DirectorySearcher::open(&cfg).await?;
    let cancel = CancellationToken::new();

    if args.list {
        let rl = searcher
            .list(
                &cancel,
                &q,
                &ListOptions {
                    field: RepoListField::Repos,
                },
            )
            .await?;
        for entry in &rl.repos {
            println!("{}", serde_json::to_string(entry)?);
        }
        eprintln!("{}", serde_json::to_string(&rl.stats)?);
        searcher.close().await;
        return Ok(());
    }

    let opts = SearchOptions {
        whole: args.whole,
        max_wall_time: Duration::from_millis(args.max_wall_ms),
        flush_wall_time: Duration::from_millis(args.flush_ms),
        max_doc_display_count: args.max_docs,
        max_match_display_count: args.max_matches,
        num_context_lines: args.context,
        ..Default::default()
    };

    if args.stream {
        let sender = Arc::new(SenderFn(|sr: SearchResult| print_result(&sr)));
        searcher.stream_search(&cancel, &q, &opts, sender).await?;
    } else {
        let sr = searcher.search(&cancel, &q, &opts).await?;
        print_result(&sr);
        eprintln!("{}", serde_json::to_string(&sr.stats)?);
    }
    searcher.close().await;
    Ok(())
}
