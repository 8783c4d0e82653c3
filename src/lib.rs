//! # jobtree
//!
//! Distributed fan-out/fan-in processing of tree-shaped jobs.
//!
//! A job is submitted as one root work item. Worker units split each item
//! into children, which the dispatcher registers against a per-job counter
//! and republishes to the queue. The job is finished when its counter
//! drains to zero; the tree itself is never held in memory.
//!
//! Provides job counters (in-process and Postgres), work queues (in-process
//! and pgmq), the dispatcher and fault handler, document and blob stores,
//! a seekable adapter for forward-only byte streams, and OpenTelemetry
//! observability.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod model;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod worker;
