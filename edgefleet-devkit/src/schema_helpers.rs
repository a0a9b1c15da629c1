/*!
Builders for schema definitions used in tests, and on-disk catalogs for `DirectoryCatalog`.
*/

use anyhow::Result;
use edgefleet_core::schema::{AllowedValues, Field, SchemaDefinition, SchemaOptions};
use serde_json::Value;
use std::path::Path;

pub struct SchemaBuilder {
    schema: SchemaDefinition,
}

impl SchemaBuilder {
    /// `kind` is the DCT type or plugin signature the schema is looked up by.
    pub fn new(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            schema: SchemaDefinition {
                name: kind.clone(),
                description: String::new(),
                kind,
                fields: Vec::new(),
                options: None,
            },
        }
    }

    pub fn field(mut self, key: &str, kind: &str) -> Self {
        self.schema.fields.push(Field {
            key: key.to_string(),
            kind: kind.to_string(),
            label: key.to_string(),
            description: String::new(),
            default: None,
            required: false,
            allowed_values: None,
        });
        self
    }

    pub fn required(mut self) -> Self {
        if let Some(field) = self.schema.fields.last_mut() {
            field.required = true;
        }
        self
    }

    pub fn default_value(mut self, default: Value) -> Self {
        if let Some(field) = self.schema.fields.last_mut() {
            field.default = Some(default);
        }
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        if let Some(field) = self.schema.fields.last_mut() {
            field.allowed_values = Some(AllowedValues::Range {
                min: Some(min),
                max: Some(max),
            });
        }
        self
    }

    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        if let Some(field) = self.schema.fields.last_mut() {
            field.allowed_values = Some(AllowedValues::Set(values));
        }
        self
    }

    pub fn linkable(mut self) -> Self {
        self.schema.options = Some(SchemaOptions { linkable: true });
        self
    }

    pub fn build(self) -> SchemaDefinition {
        self.schema
    }
}

/// Writes `schemas` as `<root>/<subdir>/<kind>.json`, the layout `DirectoryCatalog` reads.
pub fn write_catalog(root: &Path, subdir: &str, schemas: &[SchemaDefinition]) -> Result<()> {
    let dir = root.join(subdir);
    std::fs::create_dir_all(&dir)?;
    for schema in schemas {
        let path = dir.join(format!("{}.json", schema.kind));
        std::fs::write(&path, serde_json::to_vec_pretty(schema)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgefleet_core::schema::check_type;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let schema = SchemaBuilder::new("VideoStream")
            .field("URL", "string")
            .required()
            .field("CAP_RESOLUTION", "integer")
            .default_value(json!(20))
            .range(1.0, 100.0)
            .build();
        assert_eq!(schema.fields.len(), 2);
        assert!(schema.field("URL").unwrap().required);
        let resolution = schema.field("CAP_RESOLUTION").unwrap();
        assert!(!check_type(&json!(101), &resolution.kind, resolution.allowed_values.as_ref()));
        assert!(!schema.is_linkable());
    }
}
