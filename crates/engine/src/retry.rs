//! Stream-scope retry classification.
//!
//! Pure analysis of a provider error value: walk the error tree for
//! signals, assign an error kind (ordered rules, first match wins), and
//! surface a `Retry-After` delay when the response carried one. The caller
//! combines the classification with the backoff policy and the retry
//! gating rules.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use strand_domain::ErrorKind;

/// Result of classifying one error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// The caller must handle this explicitly (context overflow, credits,
    /// auth, invalid request) — backing off will not help.
    pub requires_explicit_handling: bool,
    /// Delay requested by the response's `Retry-After` headers, if any.
    pub retry_after_ms: Option<u64>,
}

impl Classification {
    fn plain(kind: ErrorKind, retryable: bool) -> Self {
        Self {
            kind,
            retryable,
            requires_explicit_handling: false,
            retry_after_ms: None,
        }
    }

    fn explicit(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: false,
            requires_explicit_handling: true,
            retry_after_ms: None,
        }
    }
}

/// Upper bound on nodes visited while walking nested causes.
const MAX_WALK_NODES: usize = 16;

/// Upper bound honored for `Retry-After` signals, in milliseconds.
const RETRY_AFTER_CAP_MS: u64 = 60_000;

// ── Pattern tables ─────────────────────────────────────────────────

static ABORT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![Regex::new(r"(?i)request was aborted").unwrap()]
});

static CONTEXT_WINDOW_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)prompt is too long",
        r"(?i)exceeds the context window",
        r"(?i)maximum context length",
        r"(?i)context length exceeded",
        r"(?i)context_length_exceeded",
        r"(?i)input is too long",
        r"(?i)^4(00|13) status code \(no body\)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static CREDITS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)insufficient credit",
        r"(?i)insufficient funds",
        r"(?i)exceeded your current quota",
        r"(?i)billing",
        r"(?i)payment required",
        r"(?i)purchase (more )?credits",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static AUTH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)invalid api key",
        r"(?i)incorrect api key",
        r"(?i)invalid x-api-key",
        r"(?i)unauthorized",
        r"(?i)authentication",
        r"(?i)permission denied",
        r"(?i)access denied",
        r"(?i)forbidden",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static RATE_LIMIT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)rate limit", r"(?i)too many requests"]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});

static NETWORK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)connection (reset|refused|closed|error)",
        r"(?i)socket hang ?up",
        r"(?i)network error",
        r"(?i)fetch failed",
        r"(?i)getaddrinfo",
        r"(?i)dns lookup",
        r"(?i)econn(reset|refused)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static INVALID_REQUEST_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)invalid request",
        r"(?i)invalid_request_error",
        r"(?i)malformed",
        r"(?i)unprocessable entity",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const ABORT_NAMES: &[&str] = &["aborterror", "responseaborted", "timeouterror"];

const NETWORK_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "EHOSTUNREACH",
    "EPIPE",
    "ENOTFOUND",
    "CONNECTIONREFUSED",
    "CONNECTIONCLOSED",
    "FAILEDTOOPENSOCKET",
];

const CONTEXT_PROVIDER_CODES: &[&str] = &[
    "context_length_exceeded",
    "context_window_exceeded",
    "string_above_max_length",
];

const CREDITS_PROVIDER_CODES: &[&str] = &["insufficient_quota", "insufficient_credits"];

const RATE_PROVIDER_CODES: &[&str] = &["rate_limit_exceeded", "rate_limit_error"];

// ── Signal extraction ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct Signals {
    name: Option<String>,
    code: Option<String>,
    status: Option<u16>,
    is_retryable: Option<bool>,
    retry_error_reason: Option<String>,
    headers: HashMap<String, String>,
    provider_code: Option<String>,
    provider_type: Option<String>,
    messages: Vec<String>,
}

impl Signals {
    fn matches_any(&self, patterns: &[Regex]) -> bool {
        self.messages
            .iter()
            .any(|m| patterns.iter().any(|p| p.is_match(m)))
    }

    fn provider_code_in(&self, set: &[&str]) -> bool {
        self.provider_code
            .as_deref()
            .map(|c| set.contains(&c))
            .unwrap_or(false)
    }
}

/// Walk the error value breadth-first through `cause` / `lastError` /
/// `errors[0..=3]`, visiting at most [`MAX_WALK_NODES`] nodes. Scalar
/// signals are first-wins; message strings accumulate from every level.
fn extract_signals(error: &Value) -> Signals {
    let mut signals = Signals::default();
    let mut queue: VecDeque<&Value> = VecDeque::new();
    queue.push_back(error);
    let mut visited = 0;

    while let Some(node) = queue.pop_front() {
        if visited >= MAX_WALK_NODES {
            break;
        }
        visited += 1;

        let obj = match node {
            Value::String(s) => {
                signals.messages.push(s.clone());
                continue;
            }
            Value::Object(obj) => obj,
            _ => continue,
        };

        if let Some(message) = obj.get("message").and_then(Value::as_str) {
            signals.messages.push(message.to_string());
        }
        if signals.name.is_none() {
            if let Some(name) = obj.get("name").and_then(Value::as_str) {
                signals.name = Some(name.to_ascii_lowercase());
            }
        }
        if signals.code.is_none() {
            match obj.get("code") {
                Some(Value::String(code)) => signals.code = Some(code.to_ascii_uppercase()),
                Some(Value::Number(code)) => signals.code = Some(code.to_string()),
                _ => {}
            }
        }
        if signals.status.is_none() {
            signals.status = obj
                .get("status")
                .or_else(|| obj.get("statusCode"))
                .and_then(as_status);
        }
        if signals.is_retryable.is_none() {
            signals.is_retryable = obj.get("isRetryable").and_then(Value::as_bool);
        }
        if signals.retry_error_reason.is_none() {
            if let Some(reason) = obj.get("retryErrorReason").and_then(Value::as_str) {
                signals.retry_error_reason = Some(reason.to_ascii_lowercase());
            }
        }
        if let Some(headers) = obj.get("responseHeaders").and_then(Value::as_object) {
            for (key, value) in headers {
                let key = key.to_ascii_lowercase();
                if let Some(value) = value.as_str() {
                    signals.headers.entry(key).or_insert_with(|| value.to_string());
                }
            }
        }
        if let Some(body) = obj.get("responseBody").and_then(Value::as_str) {
            signals.messages.push(body.to_string());
            if let Ok(parsed) = serde_json::from_str::<Value>(body) {
                absorb_provider_fields(&mut signals, &parsed);
            }
        }
        if let Some(data) = obj.get("data") {
            match data {
                Value::String(raw) => {
                    if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                        absorb_provider_fields(&mut signals, &parsed);
                    }
                }
                Value::Object(_) => absorb_provider_fields(&mut signals, data),
                _ => {}
            }
        }

        // Nested causes, in walk order.
        if let Some(cause) = obj.get("cause") {
            queue.push_back(cause);
        }
        if let Some(last) = obj.get("lastError") {
            queue.push_back(last);
        }
        if let Some(errors) = obj.get("errors").and_then(Value::as_array) {
            for nested in errors.iter().take(4) {
                queue.push_back(nested);
            }
        }
    }

    signals
}

fn as_status(value: &Value) -> Option<u16> {
    let n = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    (100..=599).contains(&n).then_some(n as u16)
}

/// Pull provider `code`/`type` out of a parsed response body or data blob
/// (possibly nested under an `error` key).
fn absorb_provider_fields(signals: &mut Signals, parsed: &Value) {
    let source = parsed.get("error").unwrap_or(parsed);
    if signals.provider_code.is_none() {
        if let Some(code) = source.get("code").and_then(Value::as_str) {
            signals.provider_code = Some(code.to_ascii_lowercase());
        }
    }
    if signals.provider_type.is_none() {
        if let Some(kind) = source.get("type").and_then(Value::as_str) {
            signals.provider_type = Some(kind.to_ascii_lowercase());
        }
    }
    if let Some(message) = source.get("message").and_then(Value::as_str) {
        signals.messages.push(message.to_string());
    }
}

// ── Retry-After ────────────────────────────────────────────────────

/// Extract a retry delay from response headers.
///
/// `retry-after-ms` (numeric milliseconds, 0..=60000) wins; else
/// `retry-after` as float seconds (result capped at 60s) or as an HTTP
/// date (delay to that instant, clamped into [0, 60000]). Out-of-range or
/// malformed numeric values are ignored.
fn retry_after_ms(headers: &HashMap<String, String>, now: DateTime<Utc>) -> Option<u64> {
    if let Some(raw) = headers.get("retry-after-ms") {
        if let Ok(ms) = raw.trim().parse::<f64>() {
            if ms.is_finite() && ms >= 0.0 && ms <= RETRY_AFTER_CAP_MS as f64 {
                return Some(ms as u64);
            }
        }
    }
    if let Some(raw) = headers.get("retry-after") {
        let raw = raw.trim();
        if let Ok(secs) = raw.parse::<f64>() {
            let ms = secs * 1_000.0;
            if ms.is_finite() && ms >= 0.0 && ms <= RETRY_AFTER_CAP_MS as f64 {
                return Some(ms as u64);
            }
            return None;
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(raw) {
            let delta = date.with_timezone(&Utc) - now;
            let ms = delta.num_milliseconds().max(0) as u64;
            return Some(ms.min(RETRY_AFTER_CAP_MS));
        }
    }
    None
}

// ── Classification ─────────────────────────────────────────────────

/// Classify a provider error value. Rules apply in order; the first match
/// wins.
pub fn classify(error: &Value) -> Classification {
    let signals = extract_signals(error);
    let retry_after = retry_after_ms(&signals.headers, Utc::now());

    let mut classification = classify_signals(&signals);
    classification.retry_after_ms = retry_after;
    classification
}

fn classify_signals(signals: &Signals) -> Classification {
    // 1. Abort-like: never retried, never escalated.
    let aborted = signals.retry_error_reason.as_deref() == Some("abort")
        || signals
            .name
            .as_deref()
            .map(|n| ABORT_NAMES.contains(&n))
            .unwrap_or(false)
        || signals.matches_any(&ABORT_PATTERNS);
    if aborted {
        return Classification::plain(ErrorKind::Unknown, false);
    }

    // 2. Context-window overflow.
    if signals.provider_code_in(CONTEXT_PROVIDER_CODES)
        || signals.matches_any(&CONTEXT_WINDOW_PATTERNS)
    {
        return Classification::explicit(ErrorKind::ContextWindowExceeded);
    }

    // 3. Insufficient credits / quota exhausted.
    if signals.provider_code_in(CREDITS_PROVIDER_CODES)
        || signals.status == Some(402)
        || signals.matches_any(&CREDITS_PATTERNS)
    {
        return Classification::explicit(ErrorKind::InsufficientCredits);
    }

    // 4. Authentication / authorization.
    if matches!(signals.status, Some(401) | Some(403)) || signals.matches_any(&AUTH_PATTERNS) {
        return Classification::explicit(ErrorKind::Auth);
    }

    // 5. Rate limiting.
    if signals.status == Some(429)
        || signals.provider_code_in(RATE_PROVIDER_CODES)
        || signals.matches_any(&RATE_LIMIT_PATTERNS)
    {
        return Classification::plain(ErrorKind::RateLimited, true);
    }

    // 6. Provider 5xx.
    if matches!(signals.status, Some(s) if (500..=599).contains(&s)) {
        return Classification::plain(ErrorKind::Provider5xx, true);
    }

    // 7. Request timeout / conflict.
    if matches!(signals.status, Some(408) | Some(409)) {
        return Classification::plain(ErrorKind::Network, true);
    }

    // 8. Connection-level failures.
    let network_code = signals
        .code
        .as_deref()
        .map(|c| NETWORK_CODES.contains(&c))
        .unwrap_or(false);
    if network_code
        || signals.matches_any(&NETWORK_PATTERNS)
        || (signals.is_retryable == Some(true) && signals.status.is_none())
    {
        return Classification::plain(ErrorKind::Network, true);
    }

    // 9. Invalid request.
    if matches!(signals.status, Some(400) | Some(422))
        || signals.matches_any(&INVALID_REQUEST_PATTERNS)
    {
        return Classification::explicit(ErrorKind::InvalidRequest);
    }

    // 10. Anything else.
    Classification::plain(ErrorKind::Unknown, false)
}

/// Normalize an error value into a user-visible message: its `message`
/// field, its string form, or `"Unknown error"`.
pub fn normalize_message(error: &Value) -> String {
    match error {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Object(obj) => match obj.get("message").and_then(Value::as_str) {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => "Unknown error".to_string(),
        },
        _ => "Unknown error".to_string(),
    }
}
