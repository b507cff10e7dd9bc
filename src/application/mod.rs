//! Application services layer.

pub mod cache_admin;
pub mod error;
