mod manifest;
mod placement;
mod process_splitter;
mod range_ref_splitter;
mod resource_checkers;
mod senders;
mod stagers;

pub use manifest::*;
pub use placement::*;
pub use process_splitter::{ProcessSplitter, ProcessSplitterSettings};
pub use range_ref_splitter::*;
pub use resource_checkers::*;
pub use senders::*;
pub use stagers::*;
