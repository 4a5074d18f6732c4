//! Gatewrap - a wrapper proxy for a lazily launched gateway backend
//!
//! This library provides the pieces of a single-backend reverse proxy that:
//! - Spawns the backend as a child process on first use (or at startup)
//! - Tracks readiness from the backend's stdout and coalesces concurrent starts
//! - Forwards HTTP requests and WebSocket upgrades to the backend over loopback
//! - Answers with a plain 502 whenever the backend cannot be reached
//! - Writes the backend's `config.json` into its state directory

pub mod config;
pub mod error;
pub mod gate;
pub mod pool;
pub mod process;
pub mod router;
pub mod server;
pub mod state;
