use super::{ConfigState, Schedule};
use crate::catalog::SchemaCatalog;
use crate::error::ValidationError;
use crate::schema::{Config, SchemaDefinition};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const INSTANCE_ID_KEY: &str = "INSTANCE_ID";
const TAGS_KEY: &str = "ID_TAGS";
const SCHEDULE_KEY: &str = "WORKING_HOURS";
const LINKED_KEY: &str = "LINKED_INSTANCES";

/// Configured unit of processing logic attached to a pipeline.
///
/// Linkable instances form collector/collected pairs: a collector gathers the output of the
/// instances it lists, and any instance has at most one collector.
#[derive(Debug, Clone)]
pub struct PluginInstance {
    id: String,
    signature: String,
    state: ConfigState,
    tags: BTreeMap<String, String>,
    schedule: Option<Schedule>,
    collector: Option<String>,
    linked: Vec<String>,
}

impl PluginInstance {
    /// `config` may carry `ID_TAGS`, `WORKING_HOURS` and `LINKED_INSTANCES`, as running
    /// configs reported by nodes do; they are split out of the plain config.
    pub fn make(
        id: impl Into<String>,
        signature: impl Into<String>,
        mut config: Config,
        schema: Option<Arc<SchemaDefinition>>,
    ) -> Result<Self, ValidationError> {
        let (id, signature) = (id.into(), signature.into());
        config.remove(INSTANCE_ID_KEY);
        let mut errors = Vec::new();

        let tags = match config.remove(TAGS_KEY) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(raw)) => raw
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    other => {
                        errors.push(format!("Invalid tag {k}: expected string, received {other}"));
                        None
                    }
                })
                .collect(),
            Some(other) => {
                errors.push(format!("Invalid value for {TAGS_KEY}: received {other}, expected object"));
                BTreeMap::new()
            }
        };
        let schedule = match config.remove(SCHEDULE_KEY) {
            None | Some(Value::Null) => None,
            Some(raw) => match Schedule::from_value(&raw) {
                Ok(schedule) => Some(schedule),
                Err(e) => {
                    errors.extend(e.messages);
                    None
                }
            },
        };
        let linked: Vec<String> = match config.remove(LINKED_KEY) {
            Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            _ => Vec::new(),
        };

        let state = match ConfigState::validated(config, schema) {
            Ok(state) => state,
            Err(e) => {
                errors.extend(e.messages);
                return Err(ValidationError::new(errors));
            }
        };
        if !errors.is_empty() {
            return Err(ValidationError::new(errors));
        }
        if !linked.is_empty() && !state.schema().is_none_or(|s| s.is_linkable()) {
            return Err(ValidationError::single(format!(
                "Instance {id} ({signature}) cannot collect instances: plugin is not linkable"
            )));
        }
        Ok(Self {
            id,
            signature,
            state,
            tags,
            schedule,
            collector: None,
            linked,
        })
    }

    pub fn from_catalog(
        id: impl Into<String>,
        signature: impl Into<String>,
        config: Config,
        catalog: &dyn SchemaCatalog,
    ) -> Result<Self, ValidationError> {
        let signature = signature.into();
        let schema = catalog.plugin_schema(&signature);
        Self::make(id, signature, config, schema)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn schema(&self) -> Option<&Arc<SchemaDefinition>> {
        self.state.schema()
    }

    pub fn get_config(&self) -> Config {
        self.state.get_config()
    }

    pub fn update_config(&mut self, patch: Config) -> Result<(), ValidationError> {
        self.state.update(patch)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
        self.state.set_dirty(true);
    }

    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        let removed = self.tags.remove(key);
        if removed.is_some() {
            self.state.set_dirty(true);
        }
        removed
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    /// Validates and replaces `WORKING_HOURS`; `Value::Null` clears it.
    pub fn set_schedule(&mut self, raw: &Value) -> Result<(), ValidationError> {
        self.schedule = match raw {
            Value::Null => None,
            raw => Some(Schedule::from_value(raw)?),
        };
        self.state.set_dirty(true);
        Ok(())
    }

    pub fn is_linkable(&self) -> bool {
        self.schema().is_some_and(|s| s.is_linkable())
    }

    /// Links reported by a node are accepted unless the schema says the plugin is not linkable.
    pub(crate) fn may_link(&self) -> bool {
        self.schema().is_none_or(|s| s.is_linkable())
    }

    /// Id of the instance collecting this one.
    pub fn collector(&self) -> Option<&str> {
        self.collector.as_deref()
    }

    /// Ids of the instances this one collects.
    pub fn linked_instances(&self) -> &[String] {
        &self.linked
    }

    /// Makes `self` the collector of `collected`. Both sides must be linkable, and `collected`
    /// must not already belong to another collector.
    pub fn link(&mut self, collected: &mut PluginInstance) -> Result<(), ValidationError> {
        if self.id == collected.id {
            return Err(ValidationError::single(format!("Instance {} cannot collect itself", self.id)));
        }
        for instance in [&*self, &*collected] {
            if !instance.is_linkable() {
                return Err(ValidationError::single(format!(
                    "Instance {} ({}) is not linkable",
                    instance.id, instance.signature
                )));
            }
        }
        match collected.collector.as_deref() {
            Some(current) if current == self.id => return Ok(()),
            Some(current) => {
                return Err(ValidationError::single(format!(
                    "Instance {} is already collected by {current}",
                    collected.id
                )))
            }
            None => {}
        }
        collected.collector = Some(self.id.clone());
        collected.state.set_dirty(true);
        if !self.linked.contains(&collected.id) {
            self.linked.push(collected.id.clone());
        }
        self.state.set_dirty(true);
        Ok(())
    }

    /// Undoes [`link`](Self::link). Returns false when the two were not linked.
    pub fn unlink(&mut self, collected: &mut PluginInstance) -> bool {
        if collected.collector.as_deref() != Some(self.id.as_str()) {
            return false;
        }
        collected.collector = None;
        collected.state.set_dirty(true);
        self.linked.retain(|id| id != &collected.id);
        self.state.set_dirty(true);
        true
    }

    /// Records `collector` as collecting this instance, as reported by the node. Not a local edit.
    pub(crate) fn restore_collector(&mut self, collector: &str) {
        self.collector = Some(collector.to_string());
    }

    /// Drops any reference to `id` without touching the other instance.
    pub(crate) fn forget(&mut self, id: &str) {
        let before = self.linked.len();
        self.linked.retain(|linked| linked != id);
        let was_collector = self.collector.as_deref() == Some(id);
        if was_collector {
            self.collector = None;
        }
        if was_collector || before != self.linked.len() {
            self.state.set_dirty(true);
        }
    }

    /// `{INSTANCE_ID, ..config, ID_TAGS?, WORKING_HOURS?, LINKED_INSTANCES?}` as sent to the node.
    pub fn to_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert(INSTANCE_ID_KEY.into(), Value::String(self.id.clone()));
        payload.extend(self.get_config());
        if !self.tags.is_empty() {
            let tags = self.tags.iter().map(|(k, v)| (k.clone(), Value::String(v.clone())));
            payload.insert(TAGS_KEY.into(), Value::Object(tags.collect()));
        }
        if let Some(schedule) = &self.schedule {
            payload.insert(SCHEDULE_KEY.into(), schedule.to_value());
        }
        if !self.linked.is_empty() {
            let linked = self.linked.iter().cloned().map(Value::String).collect();
            payload.insert(LINKED_KEY.into(), Value::Array(linked));
        }
        Value::Object(payload)
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
