//! Result cache: one JSON file per (source identity, query, server, params)
//! digest. Entries are never mutated or expired; any change to the inputs
//! produces a new key and simply orphans the old file.

use crate::source::SourceIdentity;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

const CACHE_FILE_EXT: &str = "json";

// ── Key derivation ──────────────────────────────────────────

/// Request parameters that take part in the cache key.
#[derive(Debug, Clone)]
pub struct KeyParams<'a> {
    pub query: &'a str,
    /// Normalized server URL.
    pub url: &'a str,
    pub threshold: f64,
    pub context_lines: usize,
    pub always_keep_first_frags: bool,
    pub chunk_overlap_tokens: u32,
    pub max_bytes: u64,
}

/// Lowercase SHA-256 hex digest naming one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key from the newline-joined field tuple. Field order and
    /// formatting are part of the on-disk format.
    pub fn derive(identity: &SourceIdentity, params: &KeyParams<'_>) -> Self {
        let mut fields: Vec<String> = match identity {
            SourceIdentity::File {
                path,
                size,
                mtime_ns,
            } => vec![
                path.display().to_string(),
                size.to_string(),
                mtime_ns.to_string(),
            ],
            SourceIdentity::Stdin { label, sha256 } => {
                vec!["stdin".to_string(), label.clone(), sha256.clone()]
            }
        };
        fields.extend([
            params.query.to_string(),
            params.url.to_string(),
            format!("{:.6}", params.threshold),
            params.context_lines.to_string(),
            (if params.always_keep_first_frags { "1" } else { "0" }).to_string(),
            params.chunk_overlap_tokens.to_string(),
            params.max_bytes.to_string(),
        ]);
        CacheKey(sha256_hex(fields.join("\n").as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn file_name(&self) -> String {
        format!("{}.{CACHE_FILE_EXT}", self.0)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// ── Store ───────────────────────────────────────────────────

/// A previously rendered result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub origin_token_cnt: Option<u64>,
    #[serde(default)]
    pub left_token_cnt: Option<u64>,
}

/// Why a cache operation produced nothing. Callers treat every kind as a
/// miss or a skipped write.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed cache entry: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[cfg(test)]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub fn lookup(&self, key: &CacheKey) -> Result<CacheEntry, CacheError> {
        let raw = match fs::read_to_string(self.entry_path(key)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(CacheError::Miss),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the entry through a temp file in the cache dir and rename it into
    /// place, so a concurrent reader never sees a half-written file.
    pub fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root)?;
        let serialized = serde_json::to_string(entry)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.root)?;
        tmp.write_all(serialized.as_bytes())?;
        tmp.persist(self.entry_path(key))
            .map_err(|err| CacheError::Io(err.error))?;
        Ok(())
    }
}
