//! Built-in plugins.

pub mod basic;
pub mod command;

use super::{PluginDescriptor, PluginRegistry};
use crate::domain::Stage;

/// Register every built-in plugin.
pub fn register(registry: &mut PluginRegistry) {
    registry.register(
        PluginDescriptor::new(basic::NAME).with_all_roles(|_| Ok(Box::new(basic::BasicPlugin::new()))),
    );
    registry.register(
        PluginDescriptor::new(command::NAME)
            .with_role(Stage::Download, |ctx| {
                Ok(Box::new(command::CommandPlugin::new(ctx.stage)))
            })
            .with_role(Stage::Upload, |ctx| {
                Ok(Box::new(command::CommandPlugin::new(ctx.stage)))
            }),
    );
}
