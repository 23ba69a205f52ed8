//! Tollgate - Request Admission Control
//!
//! This crate decides, for every incoming request, whether it may proceed
//! under per-entity, per-endpoint fixed-window quotas. Counting is exact
//! under concurrency: the counter store increments and checks in one atomic
//! step, in process or in a shared Redis. The gate can be embedded as a
//! tower layer or run as a standalone HTTP service.

pub mod config;
pub mod error;
pub mod http;
pub mod mesh;
pub mod ratelimit;
