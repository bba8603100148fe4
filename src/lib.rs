//! wallet-gateway library
//!
//! Exposes a local wallet backend to a UI process over a loopback HTTPS
//! listener guarded by a per-process token, plus a WebSocket event stream.

pub mod backend;
pub mod cli;
pub mod config;
pub mod logging;
pub mod server;
pub mod tls;
