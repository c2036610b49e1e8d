pub mod config;
pub mod correlator;
pub mod directory;
pub mod errors;
pub mod instances;
pub mod media_sync;
pub mod point;
pub mod runtime;
pub mod selector;
pub mod session;

pub use config::{CastPointConfig, ConfigError};
pub use correlator::{Correlator, PendingAction};
pub use directory::{Device, DeviceDirectory, DirectoryChange, ObserverId};
pub use errors::CastError;
pub use instances::{Instance, InstanceHello, InstanceId, InstanceRegistry};
pub use media_sync::{MediaSession, MediaTable};
pub use point::CastPoint;
pub use runtime::{
    CastPointHandle, CoreEvent, DiscoveryConnector, DiscoveryLink, spawn_castpoint_runtime,
};
pub use selector::{SelectionCoordinator, SelectionOutcome};
pub use session::{
    DeviceChannel, Session, SessionKey, SessionState, SessionTable, policy_matches,
};
