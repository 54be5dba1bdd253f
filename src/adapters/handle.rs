//! Session supervisor for long-lived protocol adapters
//!
//! An adapter implements a single session; `AdapterHandle` restarts it with
//! doubling backoff until shutdown or until the adapter gives up, and
//! acknowledges shutdown on the bus either way.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::traits::{AdapterContext, AdapterLogic, RetryDecision};
use crate::bus::{BusEvent, SharedBus};

/// Backoff between sessions
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay
    pub max_delay: Duration,
    /// Sessions at least this long count as healthy and reset the delay
    pub stable_run_threshold: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            stable_run_threshold: Duration::from_secs(30),
        }
    }
}

pub struct AdapterHandle<T: AdapterLogic> {
    logic: Arc<T>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl<T: AdapterLogic> AdapterHandle<T> {
    pub fn new(logic: T, bus: SharedBus, shutdown: CancellationToken) -> Self {
        Self {
            logic: Arc::new(logic),
            bus,
            shutdown,
        }
    }

    /// Run sessions until shutdown.
    ///
    /// `Ok` on shutdown or when a session ends cleanly; `Err` carrying the
    /// last session error once the adapter answers [`RetryDecision::GiveUp`].
    /// `ComponentStopped` is published in every case.
    pub async fn run_with_retry(self, config: RetryConfig) -> Result<()> {
        let name = self.logic.prefix();
        let mut delay = config.initial_delay;

        let outcome = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }

            let started = Instant::now();
            let err = match self.session().await {
                Ok(()) => break Ok(()),
                Err(e) => e,
            };

            if self.logic.on_failure(&err).await == RetryDecision::GiveUp {
                error!("{}: giving up: {:#}", name, err);
                break Err(err);
            }

            if started.elapsed() >= config.stable_run_threshold {
                delay = config.initial_delay;
            }
            warn!("{}: session failed ({:#}), reconnecting in {:?}", name, err, delay);

            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {
                    delay = (delay * 2).min(config.max_delay);
                }
            }
        };

        info!("{}: stopped", name);
        self.bus.publish(BusEvent::ComponentStopped {
            component: name.to_string(),
        });
        outcome
    }

    /// One session, cut short by the token or a `ShuttingDown` event
    async fn session(&self) -> Result<()> {
        let name = self.logic.prefix();
        self.logic.init().await?;

        let mut events = self.bus.subscribe();
        let shutting_down = async move {
            loop {
                match events.recv().await {
                    Ok(BusEvent::ShuttingDown { .. }) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        };
        let ctx = AdapterContext {
            bus: self.bus.clone(),
            shutdown: self.shutdown.clone(),
        };

        tokio::select! {
            result = self.logic.run(ctx) => result,
            _ = shutting_down => {
                info!("{}: shutdown announced", name);
                Ok(())
            }
            _ = self.shutdown.cancelled() => Ok(()),
        }
    }
}
