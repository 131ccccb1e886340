//! webarc: pipelined web archival crawler
//!
//! A distributed web archival crawler built around:
//! - A reactor admitting items under a global token budget
//! - A four-stage pipeline (preprocess, archive, postprocess, finish)
//!   connected by bounded channels with a feedback loop
//! - A durable host-grouped queue with a write-ahead log and host-fair
//!   round-robin dequeue
//! - An optional remote "crawl HQ" work source replacing the local queue
//! - A local seencheck store, pause broadcasting, and an admin HTTP API

pub mod api;
pub mod config;
pub mod controller;
pub mod extractors;
pub mod hq;
pub mod models;
pub mod pause;
pub mod pipeline;
pub mod queue;
pub mod reactor;
pub mod seencheck;
pub mod stats;
pub mod warc;
pub mod watchers;

pub use config::Config;
pub use controller::Controller;
