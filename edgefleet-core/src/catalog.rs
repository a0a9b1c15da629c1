//! Schema catalogs: where capture-thread and plugin schemas come from.
//!
//! The core only reads schemas. A catalog maps a DCT type or a plugin signature to its
//! [`SchemaDefinition`]; `DirectoryCatalog` loads them from `*.json` files on disk.

use crate::error::CatalogError;
use crate::schema::SchemaDefinition;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

pub trait SchemaCatalog: Send + Sync {
    fn dct_schema(&self, dct_type: &str) -> Option<Arc<SchemaDefinition>>;
    fn plugin_schema(&self, signature: &str) -> Option<Arc<SchemaDefinition>>;
}

/// In-memory catalog, filled programmatically.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    dcts: HashMap<String, Arc<SchemaDefinition>>,
    plugins: HashMap<String, Arc<SchemaDefinition>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dct(mut self, schema: SchemaDefinition) -> Self {
        self.dcts.insert(schema.kind.clone(), Arc::new(schema));
        self
    }

    pub fn with_plugin(mut self, schema: SchemaDefinition) -> Self {
        self.plugins.insert(schema.kind.clone(), Arc::new(schema));
        self
    }

    pub fn len(&self) -> usize {
        self.dcts.len() + self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SchemaCatalog for StaticCatalog {
    fn dct_schema(&self, dct_type: &str) -> Option<Arc<SchemaDefinition>> {
        self.dcts.get(dct_type).cloned()
    }

    fn plugin_schema(&self, signature: &str) -> Option<Arc<SchemaDefinition>> {
        self.plugins.get(signature).cloned()
    }
}

/// Catalog loaded from `<root>/dct/*.json` and `<root>/plugins/*.json`.
#[derive(Debug, Clone, Default)]
pub struct DirectoryCatalog {
    inner: StaticCatalog,
}

impl DirectoryCatalog {
    pub async fn load<P: AsRef<Path>>(root: P) -> Result<Self, CatalogError> {
        let root = root.as_ref();
        let mut inner = StaticCatalog::new();
        for schema in load_schemas_from_dir(&root.join("dct")).await? {
            inner = inner.with_dct(schema);
        }
        for schema in load_schemas_from_dir(&root.join("plugins")).await? {
            inner = inner.with_plugin(schema);
        }
        debug!(schemas = inner.len(), root = %root.display(), "schema catalog loaded");
        Ok(Self { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl SchemaCatalog for DirectoryCatalog {
    fn dct_schema(&self, dct_type: &str) -> Option<Arc<SchemaDefinition>> {
        self.inner.dct_schema(dct_type)
    }

    fn plugin_schema(&self, signature: &str) -> Option<Arc<SchemaDefinition>> {
        self.inner.plugin_schema(signature)
    }
}

async fn load_schemas_from_dir(dir: &Path) -> Result<Vec<SchemaDefinition>, CatalogError> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "schema directory not found");
        return Ok(Vec::new());
    }

    let mut schemas = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let content = fs::read_to_string(&path).await?;
        let schema = serde_json::from_str::<SchemaDefinition>(&content).map_err(|source| {
            CatalogError::Invalid {
                path: path.display().to_string(),
                source,
            }
        })?;
        schemas.push(schema);
    }
    Ok(schemas)
}
