//! Shared domain types for Keelson.
//!
//! This crate contains the plain data types used across the durable-execution
//! substrate: scope keys, timer subscriptions, batch states, and the engine
//! configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod batch;
pub mod config;
pub mod scope;
pub mod timer;
