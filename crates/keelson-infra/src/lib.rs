//! Infrastructure layer for Keelson.
//!
//! Concrete collaborators for the traits defined in `keelson-core`: a tokio
//! backed `ExternalTimerService` and the TOML configuration loader.

pub mod config;
pub mod timer;
