//! Turnstile - per-user request admission control
//!
//! This crate decides, for a stream of concurrent callers keyed by user
//! identity, whether each request may proceed. Two interchangeable policies
//! are provided: a sliding time window and a token bucket. Per-key state lives
//! in a lock-sharded table so unrelated users never contend.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod simulate;
