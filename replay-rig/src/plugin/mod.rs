//! Stage plugins: the capability trait, the registry resolving plugin
//! references and the built-in plugins.

pub mod builtin;
pub mod error;
pub mod registry;
pub mod traits;

pub use error::PluginError;
pub use registry::{DEFAULT_REPLAY_PLUGIN, PluginDescriptor, PluginFactory, PluginRegistry};
pub use traits::{Handoff, PluginContext, StageInput, StagePlugin, StepProgress};
pub use crate::diagram::LogCallback;
