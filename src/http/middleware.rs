//! Tower middleware enforcing admission ahead of protected routes.
//!
//! The layer expects a [`Principal`] in the request extensions, inserted by
//! whatever authenticates the caller. Requests without one pass through
//! unchecked.

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::trace;

use super::response::{apply_quota_headers, rejection};
use crate::ratelimit::{AdmissionGate, AdmissionRequest, Endpoint, Principal};

/// Layer wrapping services with an [`AdmissionService`].
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    gate: Arc<AdmissionGate>,
}

impl AdmissionLayer {
    pub fn new(gate: Arc<AdmissionGate>) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

/// Admission-checking service.
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    gate: Arc<AdmissionGate>,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        // The instance polled ready is the one that must take the request
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let Some(principal) = request.extensions().get::<Principal>().cloned() else {
                trace!(
                    path = %request.uri().path(),
                    "No principal on request, skipping admission"
                );
                return inner.call(request).await;
            };

            let endpoint = Endpoint::new(request.method().as_str(), request.uri().path());
            let admission = AdmissionRequest::new(&principal, endpoint);
            let decision = gate.admit(&admission).await;

            if !decision.is_allowed() {
                return Ok(rejection(&decision));
            }

            let mut response = inner.call(request).await?;
            apply_quota_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}
