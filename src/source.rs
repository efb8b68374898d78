//! Source I/O for `pcat read`: file/stdin reading with a byte cap, decoding,
//! and the identity the result cache keys on.

use crate::cache::sha256_hex;
use crate::codec::decode_bytes;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

pub const STDIN_LABEL: &str = "<stdin>";

/// Fatal input problems. All of them end the run with exit code 2.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("No input read (empty file or empty stdin).")]
    Empty,
    #[error("Failed to read {what}: {source}")]
    Read {
        what: String,
        #[source]
        source: io::Error,
    },
}

// ── Identity ────────────────────────────────────────────────

/// What the cache key knows about where the text came from.
///
/// Files are identified by path, size and mtime so a large file never has to
/// be hashed just to look up a cached rendering. Piped input has no stable
/// filesystem identity and is identified by a digest of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceIdentity {
    File {
        path: PathBuf,
        size: u64,
        mtime_ns: u128,
    },
    Stdin {
        label: String,
        sha256: String,
    },
}

/// Decoded input plus its identity.
#[derive(Debug, Clone)]
pub struct SourceInput {
    pub identity: SourceIdentity,
    pub text: String,
}

impl SourceInput {
    /// Header line naming the source (`# File: ...` or `# Source: ...`).
    pub fn header_line(&self) -> String {
        match &self.identity {
            SourceIdentity::File { path, .. } => format!("# File: {}", path.display()),
            SourceIdentity::Stdin { label, .. } => format!("# Source: {label}"),
        }
    }

    pub fn lines(&self) -> Vec<&str> {
        split_lines(&self.text)
    }
}

// ── Loading ─────────────────────────────────────────────────

/// Load a file, reading at most `max_bytes` (0 = unlimited).
pub fn load_file(path: &Path, max_bytes: u64) -> Result<SourceInput, InputError> {
    let resolved = match fs::canonicalize(path) {
        Ok(p) => p,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(InputError::NotFound(absolutize(path)));
        }
        Err(err) => {
            return Err(InputError::Read {
                what: path.display().to_string(),
                source: err,
            })
        }
    };
    let read_err = |source| InputError::Read {
        what: resolved.display().to_string(),
        source,
    };

    let metadata = fs::metadata(&resolved).map_err(read_err)?;
    let handle = File::open(&resolved).map_err(read_err)?;
    let raw = read_capped(handle, max_bytes).map_err(read_err)?;

    let text = decode_bytes(&raw);
    if text.is_empty() {
        return Err(InputError::Empty);
    }

    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|dur| dur.as_nanos())
        .unwrap_or(0);

    Ok(SourceInput {
        identity: SourceIdentity::File {
            path: resolved,
            size: metadata.len(),
            mtime_ns,
        },
        text,
    })
}

/// Load piped input from stdin, reading at most `max_bytes` (0 = unlimited).
pub fn load_stdin(label: Option<&str>, max_bytes: u64) -> Result<SourceInput, InputError> {
    load_reader(io::stdin().lock(), label, max_bytes)
}

pub fn load_reader<R: Read>(
    reader: R,
    label: Option<&str>,
    max_bytes: u64,
) -> Result<SourceInput, InputError> {
    let raw = read_capped(reader, max_bytes).map_err(|source| InputError::Read {
        what: "stdin".to_string(),
        source,
    })?;

    let text = decode_bytes(&raw);
    if text.is_empty() {
        return Err(InputError::Empty);
    }

    Ok(SourceInput {
        identity: SourceIdentity::Stdin {
            label: label.unwrap_or(STDIN_LABEL).to_string(),
            sha256: sha256_hex(&raw),
        },
        text,
    })
}

fn read_capped<R: Read>(reader: R, max_bytes: u64) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    if max_bytes > 0 {
        reader.take(max_bytes).read_to_end(&mut bytes)?;
    } else {
        let mut reader = reader;
        reader.read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

// ── Line splitting ──────────────────────────────────────────

/// Split text into lines on `\n`, `\r\n`, a lone `\r`, and the other
/// Unicode line boundaries (VT, FF, FS/GS/RS, NEL, LS, PS).
/// A trailing terminator does not produce an empty last line.
pub fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if !is_line_break(ch) {
            continue;
        }
        lines.push(&text[start..idx]);
        let mut end = idx + ch.len_utf8();
        if ch == '\r' && matches!(chars.peek(), Some((_, '\n'))) {
            chars.next();
            end += 1;
        }
        start = end;
    }
    if start < text.len() {
        lines.push(&text[start..]);
    }
    lines
}

fn is_line_break(ch: char) -> bool {
    matches!(
        ch,
        '\n' | '\r'
            | '\u{0b}'
            | '\u{0c}'
            | '\u{1c}'
            | '\u{1d}'
            | '\u{1e}'
            | '\u{85}'
            | '\u{2028}'
            | '\u{2029}'
    )
}
