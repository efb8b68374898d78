//! Pruner HTTP client: typed request/response for `POST /prune`.
//! Response parsing is lenient; only a body that is not a JSON object fails.

use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

// ── Wire types ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PruneRequest {
    pub query: String,
    pub code: String,
    pub threshold: f64,
    pub always_keep_first_frags: bool,
    pub chunk_overlap_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PruneResponse {
    /// 1-based line numbers the server judged relevant.
    #[serde(default, deserialize_with = "lenient_line_list")]
    pub kept_frags: Vec<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub origin_token_cnt: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub left_token_cnt: Option<u64>,
    /// Server-side pruned text, used by `pcat prune`.
    #[serde(default, deserialize_with = "lenient_text")]
    pub pruned_code: Option<String>,
}

/// A 2xx answer: status, body as received, and the parsed JSON.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub value: Value,
}

impl PruneResponse {
    pub fn from_raw(raw: RawResponse) -> Result<Self, PruneError> {
        let RawResponse {
            status,
            body,
            value,
        } = raw;
        if !value.is_object() {
            return Err(PruneError::Decode {
                status,
                detail: format!("expected a JSON object, got {}", json_kind(&value)),
                body,
            });
        }
        serde_json::from_value(value).map_err(|err| PruneError::Decode {
            status,
            detail: err.to_string(),
            body,
        })
    }
}

/// Anything but a list degrades to "nothing kept"; list items that are not
/// non-negative integers (or digit strings) are dropped.
fn lenient_line_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items.iter().filter_map(line_number).collect(),
        _ => Vec::new(),
    })
}

fn lenient_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_u64())
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_str().map(str::to_string))
}

fn line_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse().ok()
        }
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Errors ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PruneError {
    /// Server answered with a non-2xx status. Status and body are kept verbatim.
    #[error("HTTP {status} {reason}")]
    Http {
        status: u16,
        reason: String,
        body: String,
    },
    /// Server could not be reached (refused, DNS, timeout).
    #[error("Connection error: {cause}")]
    Connection {
        url: String,
        cause: String,
        hint: String,
    },
    /// 2xx answer whose body is not a JSON object. Status and body are kept.
    #[error("Invalid response from pruner (HTTP {status}): {detail}")]
    Decode {
        status: u16,
        detail: String,
        body: String,
    },
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl PruneError {
    /// Lines a user needs to see on stderr: the summary plus the server body
    /// or the remediation hint.
    pub fn diagnostic(&self) -> String {
        match self {
            PruneError::Http { body, .. } | PruneError::Decode { body, .. } => {
                format!("{self}\n{body}")
            }
            PruneError::Connection { hint, .. } if !hint.is_empty() => {
                format!("{self}\n{hint}")
            }
            _ => self.to_string(),
        }
    }
}

// ── Client ──────────────────────────────────────────────────

pub struct PruneClient {
    http: Client,
    connection_hint: String,
}

impl PruneClient {
    pub fn new(timeout: Duration) -> Result<Self, PruneError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PruneError::Client(err.to_string()))?;
        Ok(Self {
            http,
            connection_hint: String::new(),
        })
    }

    /// Text attached to every `PruneError::Connection` this client returns.
    pub fn with_connection_hint(mut self, hint: impl Into<String>) -> Self {
        self.connection_hint = hint.into();
        self
    }

    pub fn request(&self, url: &str, request: &PruneRequest) -> Result<PruneResponse, PruneError> {
        PruneResponse::from_raw(self.request_raw(url, request)?)
    }

    /// Send the request and return the JSON body untouched.
    pub fn request_raw(
        &self,
        url: &str,
        request: &PruneRequest,
    ) -> Result<RawResponse, PruneError> {
        tracing::debug!(
            url,
            code_bytes = request.code.len(),
            threshold = request.threshold,
            "sending prune request"
        );

        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .map_err(|err| self.connection_error(url, &err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_else(|err| {
                format!("<failed to read response body: {}>", error_chain(&err))
            });
            return Err(PruneError::Http {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .map_err(|err| self.connection_error(url, &err))?;
        let body = String::from_utf8_lossy(&bytes).into_owned();
        let status = status.as_u16();
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(RawResponse {
                status,
                body,
                value,
            }),
            Err(err) => Err(PruneError::Decode {
                status,
                detail: err.to_string(),
                body,
            }),
        }
    }

    fn connection_error(&self, url: &str, err: &reqwest::Error) -> PruneError {
        PruneError::Connection {
            url: url.to_string(),
            cause: error_chain(err),
            hint: self.connection_hint.clone(),
        }
    }
}

/// reqwest's top-level message is terse ("error sending request"); append the
/// underlying causes so "connection refused" or "timed out" is visible.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
