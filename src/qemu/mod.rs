pub mod args;
pub mod firmware;
pub mod qmp;

pub use args::{build_args, hardware_acceleration_available, LaunchPlan};
pub use firmware::{resolve_firmware, FirmwarePair};
