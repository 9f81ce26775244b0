use ag_domain::error::Error;
use std::time::Duration;

/// Map a `reqwest` transport error onto the shared error taxonomy.
///
/// Timeouts and connection failures are retriable upstream outages; anything
/// else at the transport layer is, too (the request never reached a
/// well-formed response).
pub fn from_reqwest(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::UpstreamUnavailable(format!("request timed out: {err}"))
    } else if err.is_connect() {
        Error::UpstreamUnavailable(format!("connect failed: {err}"))
    } else {
        Error::UpstreamUnavailable(err.to_string())
    }
}

/// Map a non-2xx provider response to an error with the right retriability.
pub fn from_status(
    provider: &str,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    let summary = truncate(body, 300);
    if status.as_u16() == 429 {
        Error::RateLimited {
            message: format!("{provider} returned 429: {summary}"),
            retry_after,
        }
    } else if status.is_server_error() {
        Error::UpstreamUnavailable(format!("{provider} returned {status}: {summary}"))
    } else {
        // 4xx other than 429: bad key, content filter, malformed request.
        // Permanent; never retried.
        Error::Provider {
            provider: provider.to_string(),
            message: format!("HTTP {} - {summary}", status.as_u16()),
        }
    }
}

/// Parse a `Retry-After` header value (seconds form only).
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
