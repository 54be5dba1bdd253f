//! LMS Sync Bridge
//!
//! Mirrors a Logitech Media Server player onto a local host player:
//! - JSON-RPC and CLI notification clients for LMS, plus UDP discovery
//! - A server state model with pending-command tracking
//! - A once-per-tick reconciliation loop and a host event mirror
//! - A local player adapter that queues silence-proxy addresses
//! - Server-Sent Events and a status endpoint for monitoring

pub mod adapters;
pub mod api;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod player;
pub mod sync;
