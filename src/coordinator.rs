//! ComponentCoordinator - lifecycle management for the bridge's long-lived tasks
//!
//! Every component (CLI listener, reconciler, host event mirror) runs as one
//! tokio task with its own child cancellation token. Shutdown is coordinated:
//! publish `ShuttingDown`, cancel, collect `ComponentStopped` ACKs, then join.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, SharedBus};

struct RegisteredComponent {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct ComponentCoordinator {
    components: RwLock<HashMap<String, RegisteredComponent>>,
    bus: SharedBus,
    /// Parent of every component token
    shutdown: CancellationToken,
    /// Timeout for shutdown acknowledgments
    shutdown_timeout: Duration,
}

impl ComponentCoordinator {
    pub fn new(bus: SharedBus, shutdown: CancellationToken) -> Self {
        Self::with_shutdown_timeout(bus, shutdown, Duration::from_secs(5))
    }

    pub fn with_shutdown_timeout(bus: SharedBus, shutdown: CancellationToken, timeout: Duration) -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            bus,
            shutdown,
            shutdown_timeout: timeout,
        }
    }

    /// Spawn a component. The spawn function receives (bus, cancel_token).
    pub async fn start<F, Fut>(&self, name: &str, spawn_fn: F) -> Result<()>
    where
        F: FnOnce(SharedBus, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut components = self.components.write().await;
        if components.get(name).is_some_and(|c| !c.handle.is_finished()) {
            return Err(anyhow!("component {} already running", name));
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(spawn_fn(self.bus.clone(), cancel.clone()));
        components.insert(name.to_string(), RegisteredComponent { handle, cancel });

        info!("Started component: {}", name);
        Ok(())
    }

    pub async fn is_running(&self, name: &str) -> bool {
        let components = self.components.read().await;
        components
            .get(name)
            .is_some_and(|c| !c.handle.is_finished())
    }

    /// Stop one component and wait (bounded) for its task
    pub async fn stop(&self, name: &str) -> Result<()> {
        let component = {
            let mut components = self.components.write().await;
            components
                .remove(name)
                .ok_or_else(|| anyhow!("component {} not registered", name))?
        };

        info!("Stopping component: {}", name);
        component.cancel.cancel();
        join(name, component.handle, self.shutdown_timeout).await;
        Ok(())
    }

    /// Graceful shutdown of all components
    pub async fn shutdown(&self) {
        let running: Vec<String> = {
            let components = self.components.read().await;
            components
                .iter()
                .filter(|(_, c)| !c.handle.is_finished())
                .map(|(name, _)| name.clone())
                .collect()
        };

        // Subscribe before anything can acknowledge
        let rx = self.bus.subscribe();
        self.bus.publish(BusEvent::ShuttingDown {
            reason: Some("Coordinator shutdown".to_string()),
        });
        self.shutdown.cancel();

        if !running.is_empty() {
            info!("Shutting down {} component(s): {:?}", running.len(), running);
            let acks = self.wait_for_acks(rx, &running).await;
            if acks < running.len() {
                warn!(
                    "Only received {}/{} shutdown ACKs",
                    acks,
                    running.len()
                );
            }
        }

        let components: Vec<(String, RegisteredComponent)> = {
            let mut components = self.components.write().await;
            components.drain().collect()
        };
        for (name, component) in components {
            join(&name, component.handle, Duration::from_secs(1)).await;
        }

        info!("Coordinator shutdown complete");
    }

    async fn wait_for_acks(
        &self,
        mut rx: tokio::sync::broadcast::Receiver<BusEvent>,
        expected: &[String],
    ) -> usize {
        let mut received: Vec<String> = Vec::new();
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        while received.len() < expected.len() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(BusEvent::ComponentStopped { component })) => {
                    if expected.contains(&component) && !received.contains(&component) {
                        debug!("Received ACK from component: {}", component);
                        received.push(component);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                    debug!("ACK receiver lagged by {}", n);
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }

        received.len()
    }

    pub async fn component_status(&self) -> Vec<ComponentStatus> {
        let components = self.components.read().await;
        let mut status: Vec<ComponentStatus> = components
            .iter()
            .map(|(name, c)| ComponentStatus {
                name: name.clone(),
                running: !c.handle.is_finished(),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }
}

async fn join(name: &str, handle: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(())) => debug!("Component {} joined", name),
        Ok(Err(e)) => error!("Component {} task panicked: {}", name, e),
        Err(_) => warn!("Component {} did not stop within {:?}, abandoning", name, limit),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub name: String,
    pub running: bool,
}
