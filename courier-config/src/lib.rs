//! Configuration loading for Courier workers.
//!
//! A single [`CourierConfig`] document carries the dispatch catalog consumed
//! by `courier-core`, the database connection, telemetry settings and the
//! binding of each job type to a built-in handler. It is read from TOML or
//! JSON; see [`CourierConfig::load_from_env`] for the lookup order.

#![allow(missing_docs)]

pub mod loader;
pub mod models;

pub use loader::CourierConfigSource;
pub use models::{
    CourierConfig, DatabaseConfig, TelemetryConfig, handlers::HandlerBinding,
};
