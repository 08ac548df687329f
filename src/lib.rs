//! Inkpost Backend Library
//!
//! Identity registration, activation and session-token lifecycle for the
//! blog platform. Exposed as a library for the binary and integration tests.

pub mod auth;
pub mod config;
pub mod email;
pub mod middleware;
pub mod server;
