//! Structured worker output: the MC_RESULT envelope.
//!
//! The worker prompt and this parser share `MC_RESULT_MARKER` as their only
//! contract; both sides derive from the one constant, because any drift
//! between them silently fails every parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::PricingConfig;

pub const MC_RESULT_MARKER: &str = "MC_RESULT:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseFailure,
    Timeout,
    NonZeroExit,
    Infrastructure,
    Cancelled,
}

/// Token counts accumulated over a worker session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    /// USD cost from per-million rates; used when the worker reports usage
    /// but no cost figure.
    pub fn cost(&self, pricing: &PricingConfig) -> f64 {
        self.input_tokens as f64 * pricing.input_per_million / 1_000_000.0
            + self.output_tokens as f64 * pricing.output_per_million / 1_000_000.0
            + self.cache_creation_tokens as f64 * pricing.cache_write_per_million / 1_000_000.0
            + self.cache_read_tokens as f64 * pricing.cache_read_per_million / 1_000_000.0
    }
}

/// The worker's structured result, parsed from stdout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub exit_status: i32,
    /// Worker-reported status: completed / failed / blocked.
    pub status: String,
    pub files_changed: Vec<String>,
    pub summary: String,
    pub cost_usd: f64,
    pub tokens: TokenUsage,
    /// Branch the worker committed to; empty when the unit produced no
    /// commits.
    pub branch_ref: String,
    pub discoveries: Vec<String>,
    pub context_items: Vec<String>,
    pub error_kind: Option<ErrorKind>,
}

impl ResultEnvelope {
    pub fn is_success(&self) -> bool {
        self.exit_status == 0 && self.status == "completed" && self.error_kind.is_none()
    }

    pub fn failed(kind: ErrorKind, summary: impl Into<String>) -> Self {
        Self {
            exit_status: -1,
            status: "failed".into(),
            summary: summary.into(),
            error_kind: Some(kind),
            ..Default::default()
        }
    }
}

/// Parse a worker's stdout into an envelope. An unparseable envelope is a
/// degraded signal (`error_kind = parse_failure`), never a crash.
pub fn parse_envelope(stdout: &str, exit_status: i32, pricing: &PricingConfig) -> ResultEnvelope {
    let Some(data) = extract_mc_result(stdout) else {
        warn!(
            output_len = stdout.len(),
            tail = %last_chars(stdout, 200),
            "No parseable MC_RESULT block in worker output"
        );
        return ResultEnvelope {
            exit_status,
            status: "failed".into(),
            summary: last_chars(stdout, 500),
            error_kind: Some(ErrorKind::ParseFailure),
            ..Default::default()
        };
    };

    let tokens = data
        .get("tokens")
        .map(|t| TokenUsage {
            input_tokens: u64_field(t, "input_tokens"),
            output_tokens: u64_field(t, "output_tokens"),
            cache_read_tokens: u64_field(t, "cache_read_tokens"),
            cache_creation_tokens: u64_field(t, "cache_creation_tokens"),
        })
        .unwrap_or_default();

    let cost_usd = data
        .get("cost_usd")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| tokens.cost(pricing));

    let status = data
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(if exit_status == 0 { "completed" } else { "failed" })
        .to_string();

    let error_kind = if exit_status != 0 && status == "completed" {
        // The worker claims success but the process failed; trust the exit.
        Some(ErrorKind::NonZeroExit)
    } else {
        None
    };

    ResultEnvelope {
        exit_status,
        status,
        files_changed: string_list(&data, "files_changed"),
        summary: data
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        cost_usd,
        tokens,
        branch_ref: data
            .get("branch")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        discoveries: string_list(&data, "discoveries"),
        context_items: string_list(&data, "context_items"),
        error_kind,
    }
}

/// Locate the last MC_RESULT marker and extract the JSON object after it.
fn extract_mc_result(output: &str) -> Option<Value> {
    let idx = output.rfind(MC_RESULT_MARKER)?;
    let remainder = &output[idx + MC_RESULT_MARKER.len()..];
    extract_json_object(remainder)
}

/// Scan for the first balanced JSON object in `text`, tolerating prose
/// around it. Strings and escapes are respected so braces inside values do
/// not unbalance the scan.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn string_list(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn u64_field(data: &Value, key: &str) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn last_chars(s: &str, n: usize) -> String {
    let start = s.len().saturating_sub(n);
    let mut start = start;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
