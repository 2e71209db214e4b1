use karta_events::bus::EventBus;
use karta_events::listener::TestEventListener;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::capability::{Capability, FeatureSourceParser, StepRunner, TestDataSource};
use crate::error::PluginError;

/// What a plugin receives when it is initialized.
#[derive(Clone)]
pub struct PluginContext {
    pub name: String,
    pub properties: toml::Table,
    pub events: Arc<EventBus>,
}

impl PluginContext {
    pub fn new(name: impl Into<String>, properties: toml::Table, events: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            properties,
            events,
        }
    }

    /// Deserializes the property table into the plugin's own config type.
    pub fn properties_as<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        toml::Value::Table(self.properties.clone())
            .try_into()
            .map_err(|source| PluginError::Properties {
                name: self.name.clone(),
                source,
            })
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&self, _context: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    fn close(&self) {}
}

/// A plugin together with the capabilities it explicitly provides.
#[derive(Clone)]
pub struct PluginEntry {
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) step_runner: Option<Arc<dyn StepRunner>>,
    pub(crate) data_source: Option<Arc<dyn TestDataSource>>,
    pub(crate) parser: Option<Arc<dyn FeatureSourceParser>>,
    pub(crate) listener: Option<Arc<dyn TestEventListener>>,
}

impl PluginEntry {
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            plugin,
            step_runner: None,
            data_source: None,
            parser: None,
            listener: None,
        }
    }

    pub fn step_runner<T: Plugin + StepRunner + 'static>(plugin: Arc<T>) -> Self {
        Self::new(plugin.clone()).with_step_runner(plugin)
    }

    pub fn data_source<T: Plugin + TestDataSource + 'static>(plugin: Arc<T>) -> Self {
        Self::new(plugin.clone()).with_data_source(plugin)
    }

    pub fn parser<T: Plugin + FeatureSourceParser + 'static>(plugin: Arc<T>) -> Self {
        Self::new(plugin.clone()).with_parser(plugin)
    }

    pub fn listener<T: Plugin + TestEventListener + 'static>(plugin: Arc<T>) -> Self {
        Self::new(plugin.clone()).with_listener(plugin)
    }

    pub fn with_step_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.step_runner = Some(runner);
        self
    }

    pub fn with_data_source(mut self, source: Arc<dyn TestDataSource>) -> Self {
        self.data_source = Some(source);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn FeatureSourceParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn TestEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities = Vec::new();
        if self.step_runner.is_some() {
            capabilities.push(Capability::StepRunner);
        }
        if self.data_source.is_some() {
            capabilities.push(Capability::TestDataSource);
        }
        if self.parser.is_some() {
            capabilities.push(Capability::FeatureSourceParser);
        }
        if self.listener.is_some() {
            capabilities.push(Capability::EventListener);
        }
        capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct ShellProperties {
        host: String,
        #[serde(default)]
        port: u16,
    }

    #[test]
    fn properties_deserialize_into_typed_config() {
        let mut properties = toml::Table::new();
        properties.insert("host".to_string(), toml::Value::String("db-1".to_string()));
        properties.insert("port".to_string(), toml::Value::Integer(5432));
        let context = PluginContext::new("shell", properties, Arc::new(EventBus::new()));

        let parsed: ShellProperties = context.properties_as().expect("typed properties");
        assert_eq!(
            parsed,
            ShellProperties {
                host: "db-1".to_string(),
                port: 5432
            }
        );
    }

    #[test]
    fn bad_properties_name_the_plugin() {
        let context = PluginContext::new("shell", toml::Table::new(), Arc::new(EventBus::new()));
        let err = context
            .properties_as::<ShellProperties>()
            .expect_err("missing host");
        assert!(matches!(err, PluginError::Properties { ref name, .. } if name == "shell"));
    }
}
