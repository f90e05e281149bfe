//! Controller kinds by name
//!
//! Flow definitions name a controller kind; the registry maps that name to
//! a factory when the configuration is loaded, so an unknown kind fails at
//! startup rather than at the first tick.

use flowline_common::{FlowError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::directory::{CopyFileHandler, DirectoryFlowController, FileHandler, JsonLinesHandler};
use super::FlowController;
use crate::config::FlowDefinition;

/// Builds a controller for one flow definition
pub type ControllerFactory =
    Arc<dyn Fn(&FlowDefinition) -> Result<Arc<dyn FlowController>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ControllerRegistry {
    factories: BTreeMap<String, ControllerFactory>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in directory kinds: `directory` copies files,
    /// `json_lines` parses newline-delimited JSON
    pub fn with_defaults() -> Self {
        Self::new()
            .with_directory_kind("directory", Arc::new(CopyFileHandler))
            .with_directory_kind("json_lines", Arc::new(JsonLinesHandler))
    }

    /// Register `kind`; a later registration under the same name replaces the earlier one
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&FlowDefinition) -> Result<Arc<dyn FlowController>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Register a directory controller kind backed by `handler`
    pub fn with_directory_kind(mut self, kind: impl Into<String>, handler: Arc<dyn FileHandler>) -> Self {
        self.register(kind, move |def: &FlowDefinition| {
            let mut controller = DirectoryFlowController::new(
                def.code.clone(),
                def.inbox.clone(),
                def.target_dir.clone(),
                Arc::clone(&handler),
            )
            .with_entity_types(def.source_entity_type.clone(), def.target_entity_type.clone());
            if let Some(ext) = &def.extension {
                controller = controller.with_extension(ext.clone());
            }
            Ok(Arc::new(controller) as Arc<dyn FlowController>)
        });
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(&self, definition: &FlowDefinition) -> Result<Arc<dyn FlowController>> {
        let factory = self
            .factories
            .get(&definition.kind)
            .ok_or_else(|| FlowError::UnknownController(definition.kind.clone()))?;
        factory(definition)
    }
}

impl std::fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn definition(kind: &str) -> FlowDefinition {
        FlowDefinition {
            code: "devices".to_string(),
            name: None,
            kind: kind.to_string(),
            inbox: PathBuf::from("/in"),
            target_dir: PathBuf::from("/out"),
            extension: Some("jsonl".to_string()),
            source_entity_type: "device_export".to_string(),
            target_entity_type: "device".to_string(),
            poll_interval_secs: None,
            max_consecutive_failures: None,
        }
    }

    #[test]
    fn test_defaults_build_directory_controllers() {
        let registry = ControllerRegistry::with_defaults();
        assert_eq!(registry.kinds(), vec!["directory", "json_lines"]);

        let controller = registry.build(&definition("json_lines")).unwrap();
        assert_eq!(controller.flow_code(), "devices");
        assert_eq!(controller.source_entity_type(), "device_export");
        assert_eq!(controller.target_entity_type(), "device");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let registry = ControllerRegistry::with_defaults();
        let err = registry.build(&definition("ftp")).err().unwrap();
        assert!(matches!(err, FlowError::UnknownController(ref kind) if kind == "ftp"));
    }

    #[test]
    fn test_custom_registration_replaces() {
        let mut registry = ControllerRegistry::new();
        registry.register("directory", |_def: &FlowDefinition| {
            Err(FlowError::config("disabled"))
        });
        assert!(registry.contains("directory"));
        assert!(registry.build(&definition("directory")).is_err());

        let registry = registry.with_directory_kind("directory", Arc::new(CopyFileHandler));
        assert!(registry.build(&definition("directory")).is_ok());
    }
}
