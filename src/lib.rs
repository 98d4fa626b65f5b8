//! Tollbooth - Per-Identity Token Bucket Admission Control
//!
//! This crate decides whether a caller identified by an opaque string may
//! proceed, using a token bucket per identity. Bucket state lives behind a
//! storage abstraction so a single process can keep it in memory while a
//! fleet of instances shares it through Redis.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
pub mod store;
