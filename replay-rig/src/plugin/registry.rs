//! Plugin registry: resolves plugin references to fresh plugin instances.
//!
//! A reference is either a registered name (`basic`) or a path whose file
//! stem names a registered plugin (`/opt/plugins/basic.so`). Each lookup
//! builds a new instance, so an instance lives for one stage of one job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::builtin;
use super::{PluginContext, PluginError, StagePlugin};
use crate::domain::Stage;

/// Plugin used for the replay stage when a job names none.
pub const DEFAULT_REPLAY_PLUGIN: &str = "basic";

/// Builds one plugin instance for a stage.
pub type PluginFactory =
    Arc<dyn Fn(&PluginContext) -> Result<Box<dyn StagePlugin>, PluginError> + Send + Sync>;

/// A named plugin with one factory per stage role it supports.
#[derive(Clone)]
pub struct PluginDescriptor {
    name: String,
    download: Option<PluginFactory>,
    replay: Option<PluginFactory>,
    upload: Option<PluginFactory>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            download: None,
            replay: None,
            upload: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Use `factory` for the given stage role.
    pub fn with_role<F>(mut self, stage: Stage, factory: F) -> Self
    where
        F: Fn(&PluginContext) -> Result<Box<dyn StagePlugin>, PluginError> + Send + Sync + 'static,
    {
        let factory: PluginFactory = Arc::new(factory);
        match stage {
            Stage::Download => self.download = Some(factory),
            Stage::Replay => self.replay = Some(factory),
            Stage::Upload => self.upload = Some(factory),
        }
        self
    }

    /// Use `factory` for every stage role.
    pub fn with_all_roles<F>(mut self, factory: F) -> Self
    where
        F: Fn(&PluginContext) -> Result<Box<dyn StagePlugin>, PluginError> + Send + Sync + 'static,
    {
        let factory: PluginFactory = Arc::new(factory);
        self.download = Some(factory.clone());
        self.replay = Some(factory.clone());
        self.upload = Some(factory);
        self
    }

    pub fn supports(&self, stage: Stage) -> bool {
        self.factory(stage).is_some()
    }

    fn factory(&self, stage: Stage) -> Option<&PluginFactory> {
        match stage {
            Stage::Download => self.download.as_ref(),
            Stage::Replay => self.replay.as_ref(),
            Stage::Upload => self.upload.as_ref(),
        }
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("download", &self.download.is_some())
            .field("replay", &self.replay.is_some())
            .field("upload", &self.upload.is_some())
            .finish()
    }
}

/// Result of resolving a reference, before instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlugin {
    pub name: String,
    pub path: Option<PathBuf>,
}

/// Registry of available stage plugins.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginDescriptor>,
    plugin_dir: Option<PathBuf>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Directory relative path references are resolved against.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = Some(dir.into());
        self
    }

    /// Register a plugin, replacing any plugin of the same name.
    pub fn register(&mut self, descriptor: PluginDescriptor) {
        debug!(plugin = %descriptor.name, "Registering plugin");
        self.plugins.insert(descriptor.name.clone(), descriptor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Names of all registered plugins, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a reference for a stage without instantiating it.
    pub fn resolve(&self, reference: &str, stage: Stage) -> Result<ResolvedPlugin, PluginError> {
        let reference = reference.trim();

        if reference.is_empty() {
            return match stage {
                Stage::Replay => Ok(ResolvedPlugin {
                    name: DEFAULT_REPLAY_PLUGIN.to_string(),
                    path: None,
                }),
                _ => Err(PluginError::NotFound(String::new())),
            };
        }

        if self.plugins.contains_key(reference) {
            return Ok(ResolvedPlugin {
                name: reference.to_string(),
                path: None,
            });
        }

        let path = self.plugin_path(reference);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PluginError::NotFound(reference.to_string()))?;

        if self.plugins.contains_key(stem) {
            return Ok(ResolvedPlugin {
                name: stem.to_string(),
                path: Some(path.clone()),
            });
        }

        if path.is_file() {
            Err(PluginError::malformed(
                reference,
                format!("module '{stem}' does not provide a registered plugin"),
            ))
        } else {
            Err(PluginError::NotFound(reference.to_string()))
        }
    }

    /// Resolve a reference and build a fresh instance for the stage.
    pub fn load(
        &self,
        reference: &str,
        mut context: PluginContext,
    ) -> Result<Box<dyn StagePlugin>, PluginError> {
        let stage = context.stage;
        let resolved = self.resolve(reference, stage)?;

        let descriptor = self
            .plugins
            .get(&resolved.name)
            .ok_or_else(|| PluginError::NotFound(resolved.name.clone()))?;
        let factory = descriptor.factory(stage).ok_or_else(|| {
            PluginError::malformed(
                &resolved.name,
                format!("no factory for the {stage} stage"),
            )
        })?;

        context.plugin_path = resolved.path;
        debug!(plugin = %resolved.name, stage = %stage, job = %context.job_name, "Loading plugin");

        factory(&context).map_err(|e| match e {
            PluginError::Malformed { .. } => e,
            other => PluginError::malformed(&resolved.name, format!("factory failed: {other}")),
        })
    }

    fn plugin_path(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        match &self.plugin_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}
