//! Server module
//!
//! Loopback HTTPS listener, token gate, API routes and the event socket.

pub mod auth;
pub mod bind;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod handlers;
pub mod http;
pub mod registry;
pub mod startup;

pub use connection::ConnectionDescriptor;
pub use startup::{start_gateway, GatewayOptions, ServerHandle, StartupError};
