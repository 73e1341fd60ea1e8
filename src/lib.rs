//! Local bridge between a UI process and the messaging protocol service.
//!
//! The UI talks JSON over a websocket; the bridge owns the single session to
//! the protocol service and layers history pagination and push registration
//! on top of it.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod logging;
pub mod pagination;
pub mod prompt;
pub mod push;
pub mod server;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeCore};
pub use config::BridgeConfig;
pub use error::BridgeError;
