//! Pagehold: full-page HTTP response cache with tag-based invalidation.

pub mod cache;
pub mod config;
pub mod infra;
