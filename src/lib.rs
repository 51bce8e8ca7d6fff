//! tether: a framed binary protocol server.
//!
//! Every connection opens with a handshake that negotiates a ping interval.
//! After that the server acknowledges each payload it receives and sends
//! periodic liveness pings whose cadence the peer can renegotiate.
//!
//! Layers, leaves first:
//! - [`protocol`]: frame codec and payload variants
//! - [`liveness`]: per-connection ping timer
//! - [`session`]: handshake, read loop and response dispatch
//! - [`pool`]: bounded worker pool running sessions
//! - [`server`]: listener loop feeding the pool
//! - [`client`]: minimal client for the same protocol

pub mod client;
pub mod config;
pub mod error;
pub mod liveness;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::Client;
pub use config::Config;
pub use error::ProtocolError;
pub use server::Server;
