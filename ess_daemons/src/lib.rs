mod assigner;
mod broker;
mod config;
mod context;
mod engine;
mod finisher;
mod messaging;
pub mod plugins;
mod precacher;
mod registry;
mod resource_manager;
mod runner;
mod splitter;
mod stager;

pub use assigner::*;
pub use broker::*;
pub use config::*;
pub use context::*;
pub use engine::*;
pub use finisher::*;
pub use messaging::*;
pub use precacher::*;
pub use registry::*;
pub use resource_manager::*;
pub use runner::run_daemons;
pub use splitter::*;
pub use stager::*;
