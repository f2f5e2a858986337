//! `metafetch`: batch NDJSON meta-fetch requests against a multi-search
//! backend.
//!
//! Each input line is `{"class": "...", "target": "...", "body": {...}}`
//! (`class` defaults to `"default"`). Results are printed one JSON line per
//! input line, in input order: `{"line": n, "ok": ...}` or
//! `{"line": n, "error": "..."}`, where `n` counts non-blank lines from 1.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use metafetch_core::{FetchError, DEFAULT_STRATEGY};
use metafetch_engine::{
    BatchScheduler, EngineConfig, MsearchTransport, RequestHandle, TimeoutTransport,
};

#[derive(Parser, Debug)]
#[command(name = "metafetch")]
#[command(about = "Coalesce and batch meta-fetch requests against a multi-search backend")]
struct Args {
    /// Backend base URL; batches are posted to `<endpoint>/_msearch`
    #[arg(long, default_value = "http://localhost:9200", env = "METAFETCH_ENDPOINT")]
    endpoint: String,

    /// JSON engine configuration (strategies, flush timing, timeouts)
    #[arg(long, env = "METAFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// NDJSON request file; reads stdin when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Emit logs as JSON instead of human-readable text
    #[arg(long, env = "METAFETCH_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Debug, Deserialize)]
struct InputLine {
    #[serde(default = "default_class")]
    class: String,
    target: String,
    body: Value,
}

fn default_class() -> String {
    DEFAULT_STRATEGY.to_string()
}

enum Pending {
    Submitted(RequestHandle),
    Rejected(String),
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn submit_all<R: AsyncBufRead + Unpin>(
    scheduler: &BatchScheduler,
    reader: R,
) -> anyhow::Result<Vec<Pending>> {
    let mut lines = reader.lines();
    let mut pending = Vec::new();
    while let Some(line) = lines.next_line().await.context("reading input")? {
        if line.trim().is_empty() {
            continue;
        }
        let submitted = match serde_json::from_str::<InputLine>(&line) {
            Ok(input) => scheduler
                .request(&input.class, &input.target, &input.body)
                .map_or_else(|e| Pending::Rejected(e.to_string()), Pending::Submitted),
            Err(e) => Pending::Rejected(format!("invalid input line: {e}")),
        };
        pending.push(submitted);
    }
    Ok(pending)
}

async fn settle(pending: Pending) -> Result<Value, String> {
    match pending {
        Pending::Submitted(handle) => handle
            .await
            .map(|value| Value::clone(&value))
            .map_err(|e: FetchError| e.to_string()),
        Pending::Rejected(message) => Err(message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let transport = TimeoutTransport::new(
        MsearchTransport::new(&args.endpoint),
        config.request_timeout(),
    );
    info!(endpoint = %args.endpoint, "starting metafetch");
    let scheduler = BatchScheduler::new(config, transport);

    let pending = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            submit_all(&scheduler, BufReader::new(file)).await?
        }
        None => submit_all(&scheduler, BufReader::new(tokio::io::stdin())).await?,
    };
    scheduler.flush();

    let results = join_all(pending.into_iter().map(settle)).await;

    let mut stdout = tokio::io::stdout();
    for (line, result) in results.into_iter().enumerate() {
        let out = match result {
            Ok(value) => json!({ "line": line + 1, "ok": value }),
            Err(message) => json!({ "line": line + 1, "error": message }),
        };
        stdout.write_all(out.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;

    let stats = scheduler.stats();
    info!(
        requests = stats.requests,
        deduplicated = stats.deduplicated,
        wire_calls = stats.wire_calls,
        retries = stats.retries,
        failed_groups = stats.failed_groups,
        "done"
    );
    scheduler.close();
    Ok(())
}
