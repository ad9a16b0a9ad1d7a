pub mod peer;
mod registry;

pub use peer::{PeerRecord, PeerState};
pub use registry::{InboundMessage, PeerRegistry, RegistrySnapshot};
