//! Read-through HTTP response cache for content APIs.
//!
//! [`cache`] holds the middleware, backends and invalidation;
//! [`infra::http`] wires them into axum routers.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
