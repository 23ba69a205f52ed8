//! HTTP surface: tower middleware for embedding and a standalone service.

mod middleware;
mod response;
mod server;
mod service;

pub use middleware::{AdmissionLayer, AdmissionService};
pub use response::{
    apply_quota_headers, rejection, rejection_body, status_for, RATELIMIT_LIMIT,
    RATELIMIT_REMAINING, RATE_LIMIT_EXCEEDED,
};
pub use server::HttpServer;
pub use service::{router, ApiError, AppState};
