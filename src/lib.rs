//! lanshare library
//!
//! A small LAN file-sharing service: one TCP request per connection, a
//! length-prefixed wire format, and a client that repairs routing when the
//! server is not directly reachable.

pub mod cli;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod handlers;
pub mod logger;
pub mod netinfo;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;
