//! # dispatchd
//!
//! Cross-account, event-triggered, on-demand task dispatcher.
//!
//! Storage notifications arriving from other accounts pass a policy gate,
//! are normalized to a deterministic id, recorded exactly once in a
//! durable ledger (Postgres), and launched as bounded units of compute
//! under a concurrency ceiling that an autoscale advisor adjusts from host
//! utilization. Work lost to reclaimed capacity is re-queued within a
//! retry budget.

pub mod autoscale;
pub mod ceiling;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gate;
pub mod launcher;
pub mod ledger;
pub mod model;
pub mod normalize;
pub mod reclaim;
pub mod telemetry;
pub mod templates;
