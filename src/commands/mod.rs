pub mod preflight;
pub mod serve;

pub use preflight::cmd_preflight;
pub use serve::cmd_serve;
