//! Page capture: frame discovery, the three reference passes and markup
//! assembly with embedded resources.

mod emit;
mod frames;
mod options;
mod pipeline;
mod resources;
mod scan;
mod styles;
#[cfg(test)]
mod testing;

pub use frames::FrameAccess;
pub use frames::FrameContentReply;
pub use frames::FrameRecord;
pub use frames::FrameReplySender;
pub use frames::FrameRouter;
pub use frames::FrameTree;
pub use frames::discover_frames;
pub use options::CaptureOptions;
pub use options::CssImageMode;
pub use options::FontSelection;
pub use options::ItemToggles;
pub use options::PageInfo;
pub use pipeline::CANCELLED;
pub use pipeline::CancelFlag;
pub use pipeline::CaptureEvent;
pub use pipeline::CapturedPage;
pub use pipeline::FrameReport;
pub use pipeline::PageCapture;
pub use pipeline::PassStats;
pub use resources::ReferenceOrigin;
pub use resources::ResourceReference;
pub use resources::ResourceTable;
pub use resources::SequenceAllocator;
