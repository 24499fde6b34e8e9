//! # Courier Server
//!
//! Worker process for Courier. Runs one dispatcher per configured queue
//! against Postgres, binds job types to built-in handlers from
//! configuration, and offers operator commands for enqueueing, backlog
//! stats, inspection and requeueing.

pub mod app;
pub mod handlers;
