//! Authenticated portal access: session management, mutating actions, and
//! read-only scraping. Gated behind the "portal" feature flag.

mod session;

pub use session::{
    extract_article_body_from, extract_comments_from, extract_news_links_from, Comment,
    Credentials, NewsItem, PackageInfo, Session,
};

use serde::Serialize;
use std::io::Read;

/// Configuration for portal access. One structure enumerates every
/// recognized option so each action consumes them identically.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Portal root, e.g. `https://aur.archlinux.org`.
    pub base_url: String,
    /// News index URL.
    pub news_url: String,
    /// User-Agent header.
    pub user_agent: String,
    /// Request timeout in seconds. Applied to every network call.
    pub timeout_secs: u64,
    pub max_redirects: usize,
    pub max_response_bytes: usize,
    /// Retry attempts for idempotent page fetches. Mutating submissions are
    /// never retried.
    pub retry_attempts: usize,
    /// Base delay for the fetch retry backoff.
    pub retry_delay_ms: u64,
    /// Minimum spacing between sequential requests, to stay under the
    /// portal's defensive rate limiting.
    pub min_request_delay_ms: u64,
    /// Name of the username input on the login form.
    pub identity_field: String,
    /// Name of the password input. The portal has used more than one name
    /// for it over time, so this must stay configurable.
    pub secret_field: String,
    /// Name of the "stay logged in" checkbox.
    pub remember_field: String,
    /// Cookie whose presence marks an authenticated session.
    pub session_cookie: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://aur.archlinux.org".to_string(),
            news_url: "https://archlinux.org/news/".to_string(),
            user_agent: "aurum/0.1 (+https://github.com/GhostPeony/aurum)".to_string(),
            timeout_secs: 30,
            max_redirects: 5,
            max_response_bytes: 2 * 1024 * 1024,
            retry_attempts: 2,
            retry_delay_ms: 500,
            min_request_delay_ms: 1_000,
            identity_field: "user".to_string(),
            secret_field: "passwd".to_string(),
            remember_field: "remember_me".to_string(),
            session_cookie: "AURSID".to_string(),
        }
    }
}

/// Transport and parsing failures below the operation taxonomy.
#[derive(Debug)]
pub enum PortalError {
    InvalidUrl(String),
    Network(String),
    HttpStatus { status: u16, url: String },
    ResponseTooLarge(usize),
    NotFound(String),
    Decode(String),
}

impl std::fmt::Display for PortalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortalError::InvalidUrl(e) => write!(f, "invalid URL: {}", e),
            PortalError::Network(e) => write!(f, "network error: {}", e),
            PortalError::HttpStatus { status, url } => {
                write!(f, "HTTP {} from {}", status, url)
            }
            PortalError::ResponseTooLarge(cap) => {
                write!(f, "response exceeded {} bytes", cap)
            }
            PortalError::NotFound(what) => write!(f, "not found: {}", what),
            PortalError::Decode(e) => write!(f, "malformed response: {}", e),
        }
    }
}

impl std::error::Error for PortalError {}

/// Outcome of one mutating portal operation. Every expected failure mode is
/// a value here; nothing in this taxonomy is raised past the session
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationResult {
    Success { detail: String },
    AuthFailure { reason: String },
    ResolutionFailure { reason: String },
    TransportFailure { reason: String },
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success { .. })
    }

    pub(crate) fn transport(err: PortalError) -> Self {
        OperationResult::TransportFailure {
            reason: err.to_string(),
        }
    }
}

/// Read a response body with a hard size cap.
pub(crate) fn read_body_limited(
    response: reqwest::blocking::Response,
    cap: usize,
) -> Result<String, PortalError> {
    let mut buf = Vec::new();
    let mut limited = response.take(cap as u64 + 1);
    limited
        .read_to_end(&mut buf)
        .map_err(|e| PortalError::Network(e.to_string()))?;
    if buf.len() > cap {
        return Err(PortalError::ResponseTooLarge(cap));
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Exponential backoff delay, bounded, stretched by any Retry-After hint.
pub(crate) fn retry_backoff_ms(base_ms: u64, attempt: usize, retry_after_secs: Option<u64>) -> u64 {
    let base = base_ms.max(50);
    let exp = 1u64 << attempt.min(6);
    let mut delay = base.saturating_mul(exp).min(30_000);
    if let Some(secs) = retry_after_secs {
        delay = delay.max(secs.saturating_mul(1000));
    }
    delay
}

pub(crate) fn parse_retry_after(value: &reqwest::header::HeaderValue) -> Option<u64> {
    let s = value.to_str().ok()?;
    s.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff_ms(500, 0, None), 500);
        assert_eq!(retry_backoff_ms(500, 1, None), 1_000);
        assert_eq!(retry_backoff_ms(500, 2, None), 2_000);
        assert_eq!(retry_backoff_ms(500, 20, None), 30_000);
    }

    #[test]
    fn retry_after_stretches_backoff() {
        assert_eq!(retry_backoff_ms(500, 0, Some(10)), 10_000);
        // a shorter hint never shrinks the computed delay
        assert_eq!(retry_backoff_ms(5_000, 2, Some(1)), 20_000);
    }

    #[test]
    fn operation_result_serializes_tagged() {
        let ok = OperationResult::Success {
            detail: "confirmed".to_string(),
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["detail"], "confirmed");

        let auth = OperationResult::AuthFailure {
            reason: "no AURSID cookie after login (status 200)".to_string(),
        };
        let json = serde_json::to_value(&auth).unwrap();
        assert_eq!(json["status"], "auth_failure");
    }
}
