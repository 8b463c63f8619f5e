//! FaIDS: authenticated peers exchange files through a TLS relay
//!
//! The relay brokers presence and consent between connected parties and pipes
//! file bytes from one channel to another without ever storing them.

pub mod auth;
pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod frame;
pub mod logging;
pub mod message;
pub mod negotiation;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;
pub mod transfer;

pub use client::Client;
pub use config::Config;
pub use error::RelayError;
pub use server::{serve, serve_connection, serve_with_tls, Limits, RelayContext};
