//! Rate-limit and ban detection from provider HTTP responses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rotor_core::{RotationReason, RotorError};
use serde::Serialize;

/// What a provider response means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseClass {
    Ok,
    /// Back off and rotate the key.
    RateLimited,
    /// The identity was refused; rotate identity as well.
    Banned,
    /// Retry with the same credentials.
    Transient,
    /// Retrying will not help.
    Fatal,
}

impl ResponseClass {
    /// Rotation the coordinator should run for this response, if any.
    pub fn rotation_reason(self) -> Option<RotationReason> {
        match self {
            Self::RateLimited => Some(RotationReason::RateLimit),
            Self::Banned => Some(RotationReason::Ban),
            _ => None,
        }
    }
}

/// A rate-limit pattern found in a response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDetected {
    pub source: String,
    pub status: u16,
    pub matched_pattern: String,
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
    "resource_exhausted",
    "resource exhausted",
    "slow down",
];

const BAN_PATTERNS: &[&str] = &[
    "banned",
    "blocked",
    "access denied",
    "forbidden",
    "suspended",
];

fn find_pattern(body: &str, patterns: &'static [&'static str]) -> Option<&'static str> {
    let lowered = body.to_ascii_lowercase();
    patterns
        .iter()
        .copied()
        .find(|pattern| lowered.contains(pattern))
}

/// Classify a provider response from its status code and body.
///
/// Status decides first (429 rate-limited, 403 banned, 408/5xx transient,
/// other 4xx fatal); for non-success statuses a body pattern can upgrade
/// the class, for example a 503 whose body says "rate limit".
pub fn classify_response(status: u16, body: &str) -> ResponseClass {
    if (200..300).contains(&status) {
        return ResponseClass::Ok;
    }
    match status {
        429 => return ResponseClass::RateLimited,
        403 => return ResponseClass::Banned,
        _ => {}
    }
    if find_pattern(body, RATE_LIMIT_PATTERNS).is_some() {
        return ResponseClass::RateLimited;
    }
    if find_pattern(body, BAN_PATTERNS).is_some() {
        return ResponseClass::Banned;
    }
    match status {
        408 | 425 | 500..=599 => ResponseClass::Transient,
        _ => ResponseClass::Fatal,
    }
}

/// Report the rate-limit pattern behind a non-success response, if any.
pub fn detect_rate_limit(source: &str, status: u16, body: &str) -> Option<RateLimitDetected> {
    if (200..300).contains(&status) {
        return None;
    }
    let matched = match find_pattern(body, RATE_LIMIT_PATTERNS) {
        Some(pattern) => pattern.to_string(),
        None if status == 429 => "429".to_string(),
        None => return None,
    };
    Some(RateLimitDetected {
        source: source.to_string(),
        status,
        matched_pattern: matched,
    })
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
/// Dates in the past yield zero.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let seconds = (retry_at - now).num_seconds().max(0) as u64;
    Some(Duration::from_secs(seconds))
}

/// Build the classified error a provider adapter should return for a
/// rate-limited response.
pub fn rate_limit_error(source: &str, status: u16, body: &str, retry_after: Option<Duration>) -> RotorError {
    let snippet: String = body.chars().take(160).collect();
    RotorError::RateLimited {
        source_name: source.to_string(),
        message: format!("HTTP {status}: {snippet}"),
        retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
    }
}
