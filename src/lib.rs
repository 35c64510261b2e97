//! Batch text extraction and grammar checking.
//!
//! Jobs are added to a [`queue::QueueStore`], and a [`scheduler::BatchEngine`]
//! runs each one through the [`pipeline::Pipeline`]: validate the source,
//! extract its text, check the grammar. Failed jobs are retried according to
//! [`retry::decide`], and [`stats::Statistics`] summarizes the queue.

pub mod async_utils;
pub mod config;
pub mod cpu_limit;
pub mod engines;
pub mod error;
pub mod export;
pub mod job;
pub mod pipeline;
pub mod prelude;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod stats;
