//! Tollbooth - Distributed API Rate Limiting
//!
//! This crate implements multi-window token bucket rate limiting for a
//! horizontally scaled API. Every worker shares one counter store, so the
//! limits hold across the whole fleet without coordination between workers.
//! Limits are resolved per request from role, endpoint and global tables,
//! and can be changed at runtime through the admin service.

pub mod admin;
pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
