pub mod disk;
pub mod raid;

pub use raid::{AssembledDevice, BlockAssembler, MdadmRaid};
