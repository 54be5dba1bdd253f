//! Remote state tracking and the two synchronization paths:
//! the polling reconciler and the host event mirror.

pub mod guard;
pub mod mirror;
pub mod reconcile;
pub mod server_state;
pub mod status;

pub use guard::{BusyToken, SyncGuard};
pub use mirror::{Mirror, MirrorOutcome};
pub use reconcile::{Reconciler, SyncAction, TickOutcome};
pub use server_state::{Expectation, ServerState, ServerStateView, SharedServerState};
pub use status::{PlayerMode, PlaylistEntry, ServerStatus};
