//! `pcat read` orchestrator: source -> cache -> server -> render -> cache,
//! plus the single-request `pcat prune`.
//! Only input and prune errors are fatal; cache and lifecycle problems are
//! logged and the run carries on.

use crate::cache::{CacheEntry, CacheError, CacheKey, CacheStore, KeyParams};
use crate::client::{PruneClient, PruneError, PruneRequest, PruneResponse, RawResponse};
use crate::config::Settings;
use crate::launcher::Launcher;
use crate::render::render_pruned;
use crate::server::{self, LifecycleError, LifecycleOptions, Readiness, SkipReason};
use crate::source::{self, InputError, SourceInput};
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

pub const WEIGHTS_REPO: &str = "ayanami-kitasan/code-pruner";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    File(PathBuf),
    Stdin,
}

/// Per-invocation options for `pcat read`.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub source: InputSource,
    pub label: Option<String>,
    pub query: String,
    /// 0 = unlimited.
    pub max_bytes: u64,
    pub threshold: f64,
    pub context_lines: usize,
    pub chunk_overlap_tokens: u32,
    pub always_keep_first_frags: bool,
    pub line_numbers: bool,
    pub header: bool,
    /// Print the raw server response instead of rendered text. Never cached.
    pub json: bool,
}

#[derive(Debug, Error)]
pub enum PcatError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Prune(#[from] PruneError),
}

impl PcatError {
    pub fn diagnostic(&self) -> String {
        match self {
            PcatError::Input(err) => err.to_string(),
            PcatError::Prune(err) => err.diagnostic(),
        }
    }
}

/// What to print: `stdout` verbatim, `tokens` as a stderr summary line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub stdout: String,
    pub tokens: Option<String>,
    pub cached: bool,
}

pub fn run(
    opts: &ReadOptions,
    settings: &Settings,
    launcher: &dyn Launcher,
) -> Result<Outcome, PcatError> {
    let input = match &opts.source {
        InputSource::File(path) => source::load_file(path, opts.max_bytes)?,
        InputSource::Stdin => source::load_stdin(opts.label.as_deref(), opts.max_bytes)?,
    };
    let url = server::normalize_url(&settings.url);
    tracing::debug!(url = %url, bytes = input.text.len(), "input loaded");

    // ── Cache lookup ────────────────────────────────────────
    let cache = (!opts.json && settings.cache_enabled).then(|| {
        let key = CacheKey::derive(&input.identity, &key_params(opts, &url));
        (CacheStore::new(&settings.cache_dir), key)
    });

    if let Some((store, key)) = &cache {
        match store.lookup(key) {
            Ok(entry) => {
                tracing::debug!(key = key.as_str(), "cache hit");
                return Ok(cached_outcome(opts, &input, entry));
            }
            Err(CacheError::Miss) => tracing::debug!(key = key.as_str(), "cache miss"),
            Err(err) => tracing::debug!(key = key.as_str(), error = %err, "cache entry ignored"),
        }
    }

    // ── Server ──────────────────────────────────────────────
    let lifecycle = LifecycleOptions {
        url: &url,
        auto_start: settings.auto_start,
        model_path: &settings.model_path,
        log_path: &settings.server_log,
        start_timeout: settings.start_timeout,
        command: &settings.server_command,
    };
    log_readiness(server::ensure_ready(&lifecycle, launcher));

    let client = PruneClient::new(settings.request_timeout)?
        .with_connection_hint(remediation_hint(settings));
    let request = PruneRequest {
        query: opts.query.clone(),
        code: input.text.clone(),
        threshold: opts.threshold,
        always_keep_first_frags: opts.always_keep_first_frags,
        chunk_overlap_tokens: opts.chunk_overlap_tokens,
    };

    if opts.json {
        let raw = client.request_raw(&url, &request)?;
        return Ok(json_outcome(raw));
    }

    let response = client.request(&url, &request)?;

    // ── Render ──────────────────────────────────────────────
    let lines = input.lines();
    let formatted = render_pruned(
        &lines,
        &response.kept_frags,
        opts.context_lines,
        opts.line_numbers,
    );

    let mut stdout = String::new();
    if opts.header {
        stdout.push_str(&input.header_line());
        stdout.push('\n');
        stdout.push_str(&format!("# Query: {}\n", opts.query));
        stdout.push_str(&format!(
            "# Lines: {}  Threshold: {:?}  Context: {}",
            lines.len(),
            opts.threshold,
            opts.context_lines
        ));
        if opts.max_bytes > 0 {
            stdout.push_str(&format!("  MaxBytes: {}", opts.max_bytes));
        }
        stdout.push_str("\n\n");
    }
    stdout.push_str(&formatted);
    stdout.push('\n');

    let entry = CacheEntry {
        text: formatted,
        origin_token_cnt: response.origin_token_cnt,
        left_token_cnt: response.left_token_cnt,
    };
    if let Some((store, key)) = &cache {
        match store.store(key, &entry) {
            Ok(()) => tracing::debug!(path = %store.entry_path(key).display(), "cache stored"),
            Err(err) => tracing::debug!(error = %err, "cache write skipped"),
        }
    }

    Ok(Outcome {
        stdout,
        tokens: token_summary(entry.origin_token_cnt, entry.left_token_cnt),
        cached: false,
    })
}

fn json_outcome(raw: RawResponse) -> Outcome {
    let pretty = serde_json::to_string_pretty(&raw.value).unwrap_or(raw.body);
    Outcome {
        stdout: format!("{pretty}\n"),
        tokens: None,
        cached: false,
    }
}

// ── pcat prune ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    File(PathBuf),
    Stdin,
    Inline(String),
}

/// Options for `pcat prune`: one raw request, server-side pruned text out.
#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub source: CodeSource,
    pub query: String,
    pub threshold: f64,
    pub always_keep_first_frags: bool,
    pub chunk_overlap_tokens: u32,
    pub json: bool,
}

/// Send one prune request and print the server's `pruned_code`. No cache,
/// no auto-start: the server is expected to be running.
pub fn prune(opts: &PruneOptions, settings: &Settings) -> Result<Outcome, PcatError> {
    let code = match &opts.source {
        CodeSource::File(path) => source::load_file(path, 0)?.text,
        CodeSource::Stdin => source::load_stdin(None, 0)?.text,
        CodeSource::Inline(code) if code.is_empty() => return Err(InputError::Empty.into()),
        CodeSource::Inline(code) => code.clone(),
    };
    let url = server::normalize_url(&settings.url);
    let client = PruneClient::new(settings.request_timeout)?
        .with_connection_hint(remediation_hint(settings));
    let request = PruneRequest {
        query: opts.query.clone(),
        code,
        threshold: opts.threshold,
        always_keep_first_frags: opts.always_keep_first_frags,
        chunk_overlap_tokens: opts.chunk_overlap_tokens,
    };

    let raw = client.request_raw(&url, &request)?;
    if opts.json {
        return Ok(json_outcome(raw));
    }
    let response = PruneResponse::from_raw(raw)?;
    Ok(Outcome {
        stdout: format!("{}\n", response.pruned_code.unwrap_or_default()),
        tokens: token_summary(response.origin_token_cnt, response.left_token_cnt),
        cached: false,
    })
}

fn key_params<'a>(opts: &'a ReadOptions, url: &'a str) -> KeyParams<'a> {
    KeyParams {
        query: &opts.query,
        url,
        threshold: opts.threshold,
        context_lines: opts.context_lines,
        always_keep_first_frags: opts.always_keep_first_frags,
        chunk_overlap_tokens: opts.chunk_overlap_tokens,
        max_bytes: opts.max_bytes,
    }
}

fn cached_outcome(opts: &ReadOptions, input: &SourceInput, entry: CacheEntry) -> Outcome {
    let mut stdout = String::new();
    if opts.header {
        stdout.push_str(&input.header_line());
        stdout.push('\n');
        stdout.push_str(&format!("# Query: {}\n", opts.query));
        stdout.push_str("# Cached: true\n\n");
    }
    stdout.push_str(&entry.text);
    stdout.push('\n');
    Outcome {
        stdout,
        tokens: token_summary(entry.origin_token_cnt, entry.left_token_cnt),
        cached: true,
    }
}

fn token_summary(origin: Option<u64>, left: Option<u64>) -> Option<String> {
    if origin.is_none() && left.is_none() {
        return None;
    }
    let show = |count: Option<u64>| count.map_or_else(|| "None".to_string(), |n| n.to_string());
    Some(format!("[token] {} -> {}", show(origin), show(left)))
}

fn log_readiness(result: Result<Readiness, LifecycleError>) {
    match result {
        Ok(Readiness::AlreadyHealthy) => {}
        Ok(Readiness::Started { pid }) => tracing::info!(pid, "auto-started pruner server"),
        Err(LifecycleError::NotAttempted(SkipReason::AutoStartDisabled)) => {
            tracing::debug!("server not healthy, auto-start disabled")
        }
        Err(err @ LifecycleError::NotAttempted(_)) => tracing::info!("{err}"),
        Err(err) => tracing::warn!("{err}"),
    }
}

/// Printed under a connection error: how to start the server and where to
/// get weights.
pub fn remediation_hint(settings: &Settings) -> String {
    let port = Url::parse(&server::normalize_url(&settings.url))
        .ok()
        .and_then(|u| u.port())
        .unwrap_or(server::DEFAULT_PORT);
    let start = settings
        .server_command
        .launch_spec(
            server::BIND_HOST,
            port,
            &settings.model_path,
            &settings.server_log,
        )
        .command_line();
    format!(
        "Start the pruner server first, e.g.:\n  {start}\n\n\
         Or download the model weights:\n  {download}\n\n\
         Server log (if auto-start attempted): {log}\n",
        download = download_command(settings),
        log = settings.server_log.display(),
    )
}

pub fn download_command(settings: &Settings) -> String {
    format!(
        "huggingface-cli download {WEIGHTS_REPO} --local-dir \"{}\"",
        settings.model_path.display()
    )
}
