//! Tokenwarden - Token Bucket Rate Limiting
//!
//! This crate limits requests and response bandwidth per client key using
//! token buckets. Buckets live in memory or in Redis, and a store chain
//! falls back to the next store when one fails.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod throttle;
