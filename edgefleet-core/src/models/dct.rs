use super::ConfigState;
use crate::catalog::SchemaCatalog;
use crate::error::ValidationError;
use crate::schema::{Config, SchemaDefinition};
use serde_json::Value;
use std::sync::Arc;

const TYPE_KEY: &str = "TYPE";
const METADATA_KEY: &str = "STREAM_CONFIG_METADATA";

/// How a node acquires the input of a pipeline (video stream, sensor, ...).
#[derive(Debug, Clone)]
pub struct DataCaptureThread {
    kind: String,
    state: ConfigState,
    metadata: Config,
    stats: Option<Value>,
}

impl DataCaptureThread {
    /// Builds a capture thread from a raw config carrying its `TYPE` and, optionally,
    /// `STREAM_CONFIG_METADATA`.
    pub fn make(
        mut config: Config,
        stats: Option<Value>,
        schema: Option<Arc<SchemaDefinition>>,
    ) -> Result<Self, ValidationError> {
        let kind = match config.remove(TYPE_KEY) {
            Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
            _ => return Err(ValidationError::single(format!("Missing mandatory field {TYPE_KEY}"))),
        };
        let metadata = match config.remove(METADATA_KEY) {
            Some(Value::Object(metadata)) => metadata,
            _ => Config::new(),
        };
        Ok(Self {
            kind,
            state: ConfigState::validated(config, schema)?,
            metadata,
            stats,
        })
    }

    /// Like [`make`](Self::make), with the schema looked up by `TYPE`. Unknown types are trusted.
    pub fn from_catalog(
        config: Config,
        stats: Option<Value>,
        catalog: &dyn SchemaCatalog,
    ) -> Result<Self, ValidationError> {
        let schema = config
            .get(TYPE_KEY)
            .and_then(Value::as_str)
            .and_then(|kind| catalog.dct_schema(kind));
        Self::make(config, stats, schema)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn schema(&self) -> Option<&Arc<SchemaDefinition>> {
        self.state.schema()
    }

    pub fn stats(&self) -> Option<&Value> {
        self.stats.as_ref()
    }

    /// Latest runtime stats reported by the node. Not a local edit, so the dirty flag is kept.
    pub fn set_stats(&mut self, stats: Value) {
        self.stats = Some(stats);
    }

    pub fn get_config(&self) -> Config {
        self.state.get_config()
    }

    pub fn metadata(&self) -> &Config {
        &self.metadata
    }

    pub fn update_config(&mut self, patch: Config) -> Result<(), ValidationError> {
        self.state.update(patch)
    }

    pub fn update_metadata(&mut self, patch: Config) {
        self.metadata.extend(patch);
        self.state.set_dirty(true);
    }

    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    pub fn mark_dirty(&mut self) {
        self.state.set_dirty(true);
    }

    pub fn clear_dirty(&mut self) {
        self.state.set_dirty(false);
    }
}
