use super::{DataCaptureThread, PluginInstance};
use crate::error::ValidationError;
use crate::schema::Config;
use serde_json::{json, Value};

/// Named processing graph on one node: a capture thread feeding plugin instances.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    dct: DataCaptureThread,
    instances: Vec<PluginInstance>,
    dirty: bool,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, dct: DataCaptureThread) -> Self {
        Self {
            name: name.into(),
            dct,
            instances: Vec::new(),
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dct(&self) -> &DataCaptureThread {
        &self.dct
    }

    pub fn dct_mut(&mut self) -> &mut DataCaptureThread {
        &mut self.dct
    }

    /// Pipeline-level config is the capture thread's.
    pub fn update_config(&mut self, patch: Config) -> Result<(), ValidationError> {
        self.dct.update_config(patch)
    }

    pub fn instances(&self) -> &[PluginInstance] {
        &self.instances
    }

    pub fn get_instance(&self, id: &str) -> Option<&PluginInstance> {
        self.instances.iter().find(|i| i.id() == id)
    }

    pub fn get_instance_mut(&mut self, id: &str) -> Option<&mut PluginInstance> {
        self.instances.iter_mut().find(|i| i.id() == id)
    }

    /// Adds an instance; ids are unique within a pipeline. Links declared by the instance or
    /// by instances already present are restored on both sides, provided every collected
    /// instance ends up with a single collector. Nothing changes on error.
    pub fn add_instance(&mut self, mut instance: PluginInstance) -> Result<(), ValidationError> {
        let id = instance.id();
        if self.get_instance(id).is_some() {
            return Err(ValidationError::single(format!(
                "Instance {id} already exists in pipeline {}",
                self.name
            )));
        }
        let collectors: Vec<&str> = self
            .instances
            .iter()
            .filter(|other| other.linked_instances().iter().any(|linked| linked == id))
            .map(PluginInstance::id)
            .collect();
        if collectors.len() > 1 {
            return Err(ValidationError::single(format!(
                "Instance {id} is listed by several collectors: {}",
                collectors.join(", ")
            )));
        }
        if !collectors.is_empty() && !instance.may_link() {
            return Err(ValidationError::single(format!(
                "Instance {id} ({}) is not linkable",
                instance.signature()
            )));
        }
        for linked in instance.linked_instances() {
            let Some(other) = self.get_instance(linked) else {
                continue;
            };
            if !other.may_link() {
                return Err(ValidationError::single(format!(
                    "Instance {linked} ({}) is not linkable",
                    other.signature()
                )));
            }
            if let Some(current) = other.collector().filter(|current| *current != id) {
                return Err(ValidationError::single(format!(
                    "Instance {linked} is already collected by {current}"
                )));
            }
        }

        for other in &mut self.instances {
            if other.linked_instances().iter().any(|id| id == instance.id()) {
                instance.restore_collector(other.id());
            }
            if instance.linked_instances().iter().any(|id| id == other.id()) {
                other.restore_collector(instance.id());
            }
        }
        self.instances.push(instance);
        self.dirty = true;
        Ok(())
    }

    /// Removes an instance and every link pointing at it.
    pub fn remove_instance(&mut self, id: &str) -> Option<PluginInstance> {
        let position = self.instances.iter().position(|i| i.id() == id)?;
        let removed = self.instances.remove(position);
        for other in &mut self.instances {
            other.forget(id);
        }
        self.dirty = true;
        Some(removed)
    }

    /// Makes `collector` collect `collected`, both instances of this pipeline.
    pub fn link_instances(&mut self, collector: &str, collected: &str) -> Result<(), ValidationError> {
        let (collector, collected) = self.pair_mut(collector, collected)?;
        collector.link(collected)
    }

    pub fn unlink_instances(&mut self, collector: &str, collected: &str) -> Result<bool, ValidationError> {
        let (collector, collected) = self.pair_mut(collector, collected)?;
        Ok(collector.unlink(collected))
    }

    fn pair_mut(&mut self, a: &str, b: &str) -> Result<(&mut PluginInstance, &mut PluginInstance), ValidationError> {
        let position = |id: &str| {
            self.instances
                .iter()
                .position(|i| i.id() == id)
                .ok_or_else(|| ValidationError::single(format!("Unknown instance {id} in pipeline {}", self.name)))
        };
        let (i, j) = (position(a)?, position(b)?);
        if i == j {
            return Err(ValidationError::single(format!("Instance {a} cannot collect itself")));
        }
        if i < j {
            let (left, right) = self.instances.split_at_mut(j);
            Ok((&mut left[i], &mut right[0]))
        } else {
            let (left, right) = self.instances.split_at_mut(i);
            Ok((&mut right[0], &mut left[j]))
        }
    }

    /// Deploy payload: `NAME`, `TYPE`, the capture config and the instances grouped by signature.
    pub fn to_payload(&self) -> Value {
        let mut payload = self.dct.get_config();
        payload.insert("NAME".into(), Value::String(self.name.clone()));
        payload.insert("TYPE".into(), Value::String(self.dct.kind().to_string()));
        if !self.dct.metadata().is_empty() {
            payload.insert(
                "STREAM_CONFIG_METADATA".into(),
                Value::Object(self.dct.metadata().clone()),
            );
        }

        let mut plugins: Vec<(&str, Vec<Value>)> = Vec::new();
        for instance in &self.instances {
            match plugins.iter_mut().find(|(sig, _)| *sig == instance.signature()) {
                Some((_, list)) => list.push(instance.to_payload()),
                None => plugins.push((instance.signature(), vec![instance.to_payload()])),
            }
        }
        let plugins = plugins
            .into_iter()
            .map(|(signature, instances)| json!({"SIGNATURE": signature, "INSTANCES": instances}))
            .collect();
        payload.insert("PLUGINS".into(), Value::Array(plugins));
        Value::Object(payload)
    }

    /// Dirty when the pipeline, its capture thread or any instance has unsaved edits.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.dct.is_dirty() || self.instances.iter().any(PluginInstance::is_dirty)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Called once a commit to the node succeeded.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
        self.dct.clear_dirty();
        self.instances.iter_mut().for_each(PluginInstance::clear_dirty);
    }
}
