//! # Configuration
//!
//! Server configuration structures and the loader that layers defaults,
//! configuration files, environment variables, and CLI overrides.

pub mod server;
