//! Typed surface over remote configuration: capture threads, plugin instances, pipelines.
//!
//! Every model holds an open config validated against an optional schema. Construction fails
//! as a whole on invalid input; later updates either apply fully and mark the model dirty, or
//! leave it untouched.

pub mod dct;
pub mod pipeline;
pub mod plugin_instance;
pub mod schedule;

pub use dct::DataCaptureThread;
pub use pipeline::Pipeline;
pub use plugin_instance::PluginInstance;
pub use schedule::{Interval, Schedule, Weekday};

use crate::error::ValidationError;
use crate::schema::{
    apply_defaults_to_object, project_config, validate_against_schema, validate_config, Config,
    SchemaDefinition,
};
use std::sync::Arc;

/// Config, schema and dirty flag shared by every model.
#[derive(Debug, Clone)]
pub(crate) struct ConfigState {
    config: Config,
    schema: Option<Arc<SchemaDefinition>>,
    dirty: bool,
}

impl ConfigState {
    /// Without a schema the config is trusted as-is. Declared defaults count toward mandatory fields.
    pub(crate) fn validated(
        config: Config,
        schema: Option<Arc<SchemaDefinition>>,
    ) -> Result<Self, ValidationError> {
        if let Some(schema) = &schema {
            validate_config(&apply_defaults_to_object(config.clone(), schema, false), schema)?;
        }
        Ok(Self {
            config,
            schema,
            dirty: false,
        })
    }

    pub(crate) fn schema(&self) -> Option<&Arc<SchemaDefinition>> {
        self.schema.as_ref()
    }

    pub(crate) fn get_config(&self) -> Config {
        match &self.schema {
            Some(schema) => project_config(&self.config, schema),
            None => self.config.clone(),
        }
    }

    /// Validates `patch` on its own, then shallow-merges it.
    pub(crate) fn update(&mut self, patch: Config) -> Result<(), ValidationError> {
        if let Some(schema) = &self.schema {
            let errors = validate_against_schema(&patch, schema);
            if !errors.is_empty() {
                return Err(ValidationError::new(errors));
            }
        }
        self.config.extend(patch);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}
