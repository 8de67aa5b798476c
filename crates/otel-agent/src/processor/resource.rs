//! Resource processor: edits the resource attributes of every batch.

use crate::components::default_config;
use async_trait::async_trait;
use otel_agent_pipeline::factory::{DynProcessor, Factory, ProcessorFactory};
use otel_agent_pipeline::pdata::proto::common::v1::{AnyValue, KeyValue, any_value};
use otel_agent_pipeline::pdata::proto::resource::v1::Resource;
use otel_agent_pipeline::pdata::{Batch, Logs, Metrics, Traces};
use otel_agent_pipeline::{
    Capabilities, Component, ComponentConfig, ComponentError, ComponentType, ConsumeError,
    Consumer, Context, CreateSettings, DynConsumer, Host, StabilityLevel,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What to do with one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Sets the value, replacing an existing one.
    #[default]
    Upsert,
    /// Sets the value only when the key is absent.
    Insert,
    /// Replaces the value only when the key is present.
    Update,
    /// Removes the key.
    Delete,
}

/// One attribute edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeAction {
    /// Attribute key.
    pub key: String,
    /// New value: a string, integer, float or boolean. Ignored by `delete`.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// The edit to apply.
    #[serde(default)]
    pub action: Action,
}

/// Settings of a `resource` processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceConfig {
    /// Edits applied in order.
    pub attributes: Vec<AttributeAction>,
}

#[derive(Debug, Clone)]
struct Edit {
    key: String,
    value: Option<AnyValue>,
    action: Action,
}

impl Edit {
    fn apply(&self, resource: &mut Resource) {
        let existing = resource.attributes.iter().position(|kv| kv.key == self.key);
        match (self.action, existing) {
            (Action::Delete, Some(index)) => {
                resource.attributes.remove(index);
            }
            (Action::Upsert | Action::Update, Some(index)) => {
                resource.attributes[index].value = self.value.clone();
            }
            (Action::Upsert | Action::Insert, None) => resource.attributes.push(KeyValue {
                key: self.key.clone(),
                value: self.value.clone(),
            }),
            _ => {}
        }
    }
}

fn to_any_value(
    id: &otel_agent_pipeline::ComponentId,
    value: &serde_json::Value,
) -> Result<AnyValue, ComponentError> {
    let value = match value {
        serde_json::Value::String(s) => any_value::Value::StringValue(s.clone()),
        serde_json::Value::Bool(b) => any_value::Value::BoolValue(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => any_value::Value::IntValue(i),
            None => any_value::Value::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        other => {
            return Err(ComponentError::InvalidConfig {
                id: id.clone(),
                source: serde::de::Error::custom(format!(
                    "unsupported attribute value {other}"
                )),
            });
        }
    };
    Ok(AnyValue { value: Some(value) })
}

/// Batches whose resources can be edited in place.
pub trait Resources: Batch {
    /// Calls `f` on the resource of every entry, creating missing resources.
    fn for_each_resource(&mut self, f: impl FnMut(&mut Resource));
}

impl Resources for Traces {
    fn for_each_resource(&mut self, mut f: impl FnMut(&mut Resource)) {
        for rs in &mut self.request_mut().resource_spans {
            f(rs.resource.get_or_insert_with(Resource::default));
        }
    }
}

impl Resources for Metrics {
    fn for_each_resource(&mut self, mut f: impl FnMut(&mut Resource)) {
        for rm in &mut self.request_mut().resource_metrics {
            f(rm.resource.get_or_insert_with(Resource::default));
        }
    }
}

impl Resources for Logs {
    fn for_each_resource(&mut self, mut f: impl FnMut(&mut Resource)) {
        for rl in &mut self.request_mut().resource_logs {
            f(rl.resource.get_or_insert_with(Resource::default));
        }
    }
}

/// Applies attribute edits to every resource, then forwards the batch.
pub struct ResourceProcessor<T: Resources> {
    edits: Vec<Edit>,
    next: DynConsumer<T>,
}

#[async_trait]
impl<T: Resources> Consumer<T> for ResourceProcessor<T> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::MUTATES
    }

    async fn consume(&self, ctx: &Context, mut batch: T) -> Result<(), ConsumeError> {
        batch.for_each_resource(|resource| {
            for edit in &self.edits {
                edit.apply(resource);
            }
        });
        self.next.consume(ctx, batch).await
    }
}

#[async_trait]
impl<T: Resources> Component for ResourceProcessor<T> {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Factory for `resource` processors.
#[derive(Debug, Default)]
pub struct ResourceProcessorFactory;

impl ResourceProcessorFactory {
    fn create<T: Resources>(
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<T>,
    ) -> Result<Arc<ResourceProcessor<T>>, ComponentError> {
        let config: ResourceConfig = config.parse()?;
        let edits = config
            .attributes
            .iter()
            .map(|attribute| {
                let value = match (&attribute.value, attribute.action) {
                    (_, Action::Delete) => None,
                    (Some(value), _) => Some(to_any_value(&settings.id, value)?),
                    (None, _) => {
                        return Err(ComponentError::InvalidConfig {
                            id: settings.id.clone(),
                            source: serde::de::Error::custom(format!(
                                "attribute {:?} needs a value",
                                attribute.key
                            )),
                        });
                    }
                };
                Ok(Edit {
                    key: attribute.key.clone(),
                    value,
                    action: attribute.action,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(ResourceProcessor { edits, next }))
    }
}

impl Factory for ResourceProcessorFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("resource")
    }

    fn create_default_config(&self) -> serde_json::Value {
        default_config::<ResourceConfig>()
    }
}

impl ProcessorFactory for ResourceProcessorFactory {
    fn traces_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn metrics_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn logs_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn create_traces(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Traces>,
    ) -> Result<DynProcessor<Traces>, ComponentError> {
        Ok(Self::create(settings, config, next)?)
    }

    fn create_metrics(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynProcessor<Metrics>, ComponentError> {
        Ok(Self::create(settings, config, next)?)
    }

    fn create_logs(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Logs>,
    ) -> Result<DynProcessor<Logs>, ComponentError> {
        Ok(Self::create(settings, config, next)?)
    }
}
