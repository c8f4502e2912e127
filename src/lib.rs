//! Gatekeeper - Multi-Strategy Admission Control
//!
//! This crate decides whether a request from a client to an endpoint may
//! proceed. Endpoints are matched to ordered rules, each rule runs one of
//! four algorithms (fixed window, sliding window, token bucket, leaky bucket)
//! and denied requests carry the rule's action (block, delay, challenge or
//! redirect). Counters live in Redis when configured so that every process
//! shares one view, with a local in-memory store as the fallback.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
