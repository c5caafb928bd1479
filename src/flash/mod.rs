pub mod pipeline;
pub mod staging;
pub mod tracker;

pub use pipeline::{
    flash_disk, FlashPhase, FlashPipeline, FlashProgress, FlashReport, ProgressSender,
};
pub use staging::ImageStaging;
pub use tracker::FlashTracker;
