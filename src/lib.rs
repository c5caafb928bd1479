pub mod capture;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod flash;
pub mod network;
pub mod paths;
pub mod process;
pub mod qemu;
pub mod remote;
pub mod serial;
pub mod server;
pub mod session;
pub mod storage;
pub mod types;
pub mod utils;
pub mod worker;

// Re-export core types for convenience
pub use error::WorkerError;
pub use types::{DeviceType, FlashState, SessionState};
