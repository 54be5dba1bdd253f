//! Bus event definitions.
//!
//! Events are grouped by the component that publishes them:
//! - LMS connectivity: JSON-RPC reachability and the CLI notification stream
//! - Remote player: mode and playlist changes seen by the server state model
//! - Sync: corrective actions applied by the reconciliation loop
//! - Lifecycle: component stop acknowledgements and shutdown

use serde::{Deserialize, Serialize};

/// All events that can be published on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    // =========================================================================
    // LMS Connectivity
    // =========================================================================
    /// First successful status query against a server
    LmsConnected { host: String, port: u16 },

    /// Status polling failed `consecutive_failures` times in a row
    LmsUnavailable {
        host: String,
        consecutive_failures: u32,
        error: String,
    },

    /// CLI notification stream established (logged in and subscribed)
    CliConnected { host: String },

    /// CLI notification stream dropped; the listener will reconnect
    CliDisconnected { host: String, reason: Option<String> },

    /// A notification line arrived on the CLI stream (already percent-decoded)
    CliNotification { player_id: String, event: String },

    // =========================================================================
    // Remote Player
    // =========================================================================
    /// Remote transport mode changed between two refreshes
    RemoteModeChanged { player_id: String, mode: String },

    /// Remote playlist checksum changed between two refreshes
    RemotePlaylistChanged {
        player_id: String,
        checksum: Option<String>,
    },

    // =========================================================================
    // Sync
    // =========================================================================
    /// The reconciliation loop applied a corrective action
    SyncActionApplied { action: String },

    /// A corrective action failed; the next tick re-evaluates
    SyncActionFailed { action: String, error: String },

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// A component task has fully stopped
    ComponentStopped { component: String },

    /// System is shutting down
    ShuttingDown { reason: Option<String> },
}

impl BusEvent {
    /// Get the event type as a string (for logging/filtering)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LmsConnected { .. } => "lms_connected",
            Self::LmsUnavailable { .. } => "lms_unavailable",
            Self::CliConnected { .. } => "cli_connected",
            Self::CliDisconnected { .. } => "cli_disconnected",
            Self::CliNotification { .. } => "cli_notification",
            Self::RemoteModeChanged { .. } => "remote_mode_changed",
            Self::RemotePlaylistChanged { .. } => "remote_playlist_changed",
            Self::SyncActionApplied { .. } => "sync_action_applied",
            Self::SyncActionFailed { .. } => "sync_action_failed",
            Self::ComponentStopped { .. } => "component_stopped",
            Self::ShuttingDown { .. } => "shutting_down",
        }
    }

    /// Check if this event concerns LMS reachability
    pub fn is_connectivity_event(&self) -> bool {
        matches!(
            self,
            Self::LmsConnected { .. }
                | Self::LmsUnavailable { .. }
                | Self::CliConnected { .. }
                | Self::CliDisconnected { .. }
        )
    }

    /// Check if this event was produced by the reconciliation loop
    pub fn is_sync_event(&self) -> bool {
        matches!(
            self,
            Self::SyncActionApplied { .. } | Self::SyncActionFailed { .. }
        )
    }
}
