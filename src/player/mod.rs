//! Local Player Adapter and the host player boundary

pub mod headless;
pub mod host;
pub mod local;
pub mod track;

pub use headless::{HeadlessHost, HostAction};
pub use host::{HostEvent, HostMedia, HostPlayer};
pub use local::{EventOrigin, LocalPlayer, LocalSnapshot, PlaylistSource};
pub use track::{coerce_duration, silence_address, TrackDescriptor};
