//! Mock servers for integration testing
//!
//! These mock servers simulate the LMS JSON-RPC endpoint and the LMS CLI
//! port, allowing full integration testing without a real server.
#![allow(dead_code)]

pub mod lms;
pub mod lms_cli;

pub use lms::{MockLmsServer, MockTrack};
pub use lms_cli::MockCliServer;
