//! Synthetic monitoring for S3-compatible object storage.
//!
//! The canary periodically creates a bucket, writes a few objects, reads them back, deletes them
//! and deletes the bucket again, logging the latency of every step. See [`canary::CanarySession`]
//! for the cycle itself and [`runner::Runner`] for how cycles are scheduled.

pub mod canary;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod runner;
pub mod seed;
pub mod store;
