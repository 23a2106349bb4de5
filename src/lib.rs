//! ft library
//!
//! Point-to-point directory transfer: a server streams a directory listing and
//! file contents over a framed protocol; the client mirrors the tree with a
//! pool of concurrent download workers.

pub mod cli;
pub mod client;
pub mod download;
pub mod error;
pub mod fs_enum;
pub mod listing;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod tls;
