//! Keepsafe sync server.
//!
//! Two surfaces share one storage layer and one token authority: an
//! axum HTTP surface for registration and login, and a framed RPC
//! surface for record synchronization and chunked file transfer.

pub mod config;
pub mod error;
pub mod files;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod storage;
