// Library interface for kartcam
// This allows integration tests and benches to access internal modules

pub mod config;
pub mod errors;
pub mod fleet;
pub mod journal;
pub mod monitor;
pub mod writer;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::KartcamError;
pub use fleet::{
    CameraStatus, DeviceRecord, EventKind, FleetEvent, FleetRegistry, VideoFilter, VideoRecord,
};
pub use monitor::FleetMonitor;
