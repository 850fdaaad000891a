//! # wirehub — JSON-RPC service over TCP
//!
//! Command-line front end for `wirehub-core`.
//!
//! ## Modes
//!
//! - **serve**: Echo JSON-RPC requests back to callers, or store them per
//!   peer when `storage.store_messages` is set. Raw traffic can be
//!   recorded per peer with `storage.record`.
//! - **call**: Connect to a server and issue one request or notification.

pub mod config;
pub mod service;
