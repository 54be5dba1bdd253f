//! LMS protocol adapters: JSON-RPC client, CLI notification listener and
//! UDP discovery, plus the retrying lifecycle wrapper they run under.

pub mod handle;
pub mod lms;
pub mod lms_cli;
pub mod lms_discovery;
pub mod traits;

pub use handle::{AdapterHandle, RetryConfig};
pub use traits::{AdapterContext, AdapterLogic, RetryDecision};
