//! Observability setup for processes embedding Keelson.

pub mod tracing_setup;
