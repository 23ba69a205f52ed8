//! Rate limit headers and the 429 rejection body.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::ratelimit::{Decision, Outcome, QuotaStatus};

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");

/// Error code carried in every rejection body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Attach the headers a decision calls for. Unlimited and fail-open
/// decisions carry none.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    let Some(quota) = decision.quota() else {
        return;
    };

    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
    if !decision.is_allowed() {
        headers.insert(RETRY_AFTER, HeaderValue::from(quota.retry_after_secs));
    }
}

/// JSON body for a rejected request.
pub fn rejection_body(quota: Option<&QuotaStatus>) -> serde_json::Value {
    let retry_after_secs = quota.map(|q| q.retry_after_secs).unwrap_or(1);
    json!({
        "success": false,
        "error": {
            "code": RATE_LIMIT_EXCEEDED,
            "message": format!("Too many requests. Retry after {} seconds.", retry_after_secs),
            "limit": quota.map(|q| q.limit),
            "retry_after_secs": retry_after_secs,
        }
    })
}

/// The full 429 response for a denied decision.
pub fn rejection(decision: &Decision) -> Response {
    let mut headers = HeaderMap::new();
    apply_quota_headers(&mut headers, decision);

    (
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        Json(rejection_body(decision.quota())),
    )
        .into_response()
}

/// Status code for a decision when answered directly.
pub fn status_for(decision: &Decision) -> StatusCode {
    match decision.outcome {
        Outcome::Denied | Outcome::FailedClosed => StatusCode::TOO_MANY_REQUESTS,
        Outcome::Unlimited | Outcome::Allowed | Outcome::FailedOpen => StatusCode::OK,
    }
}
