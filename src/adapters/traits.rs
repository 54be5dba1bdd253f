use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::SharedBus;

/// Context passed to adapter logic during execution
pub struct AdapterContext {
    /// Event bus for publishing events
    pub bus: SharedBus,
    /// Cancellation token for shutdown coordination
    pub shutdown: CancellationToken,
}

/// What `AdapterHandle` should do after `run()` failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back off, then call `run()` again
    Retry,
    /// Stop for good and report the failure to the caller
    GiveUp,
}

/// Adapter-specific logic trait
///
/// Implementors provide one connection session in `run()`.
/// Lifecycle (retry, backoff, shutdown, ACK) is handled by AdapterHandle.
#[async_trait]
pub trait AdapterLogic: Send + Sync + 'static {
    /// Short name used in logs and `ComponentStopped` events
    fn prefix(&self) -> &'static str;

    /// Run one session. Returns `Ok` when `ctx.shutdown` fires, `Err` when
    /// the session broke and may be retried.
    async fn run(&self, ctx: AdapterContext) -> Result<()>;

    /// Optional: called before every run() for per-attempt setup
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Classify a failed session. Default: always retry.
    async fn on_failure(&self, _error: &anyhow::Error) -> RetryDecision {
        RetryDecision::Retry
    }
}
