use karta_events::bus::EventBus;
use karta_events::listener::TestEventListener;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{Capability, FeatureSourceParser, StepRunner, TestDataSource};
use crate::error::PluginError;
use crate::plugin::{PluginContext, PluginEntry};

struct RegisteredPlugin {
    entry: PluginEntry,
    enabled: bool,
    initialized: bool,
}

impl RegisteredPlugin {
    fn active(&self) -> bool {
        self.enabled && self.initialized
    }
}

/// Name to plugin map with capability lookup.
///
/// Lifecycle: `register`, `enable`, `initialize_enabled`, `close`. Only
/// enabled and initialized plugins resolve.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<RegisteredPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: PluginEntry) -> Result<(), PluginError> {
        let mut plugins = self.plugins.write();
        if plugins.iter().any(|p| p.entry.name() == entry.name()) {
            return Err(PluginError::Duplicate {
                name: entry.name().to_string(),
            });
        }
        tracing::debug!(
            plugin = entry.name(),
            capabilities = ?entry.capabilities(),
            "plugin registered"
        );
        plugins.push(RegisteredPlugin {
            entry,
            enabled: false,
            initialized: false,
        });
        Ok(())
    }

    /// Enables the named plugins; an empty list enables every registered plugin.
    pub fn enable(&self, names: &[String]) -> Result<(), PluginError> {
        let mut plugins = self.plugins.write();
        if names.is_empty() {
            plugins.iter_mut().for_each(|p| p.enabled = true);
            return Ok(());
        }
        for name in names {
            let plugin = plugins
                .iter_mut()
                .find(|p| p.entry.name() == name.as_str())
                .ok_or_else(|| PluginError::Unknown { name: name.clone() })?;
            plugin.enabled = true;
        }
        Ok(())
    }

    /// Initializes every enabled plugin in registration order. Any failure is fatal.
    pub fn initialize_enabled(
        &self,
        properties: &HashMap<String, toml::Table>,
        events: &Arc<EventBus>,
    ) -> Result<(), PluginError> {
        let pending: Vec<PluginEntry> = self
            .plugins
            .read()
            .iter()
            .filter(|p| p.enabled && !p.initialized)
            .map(|p| p.entry.clone())
            .collect();

        for entry in pending {
            let name = entry.name().to_string();
            let context = PluginContext::new(
                name.clone(),
                properties.get(&name).cloned().unwrap_or_default(),
                events.clone(),
            );
            entry.plugin.initialize(&context)?;
            if let Some(plugin) = self
                .plugins
                .write()
                .iter_mut()
                .find(|p| p.entry.name() == name)
            {
                plugin.initialized = true;
            }
            tracing::info!(plugin = %name, "plugin initialized");
        }
        Ok(())
    }

    pub fn resolve_step_runner(&self, name: &str) -> Result<Arc<dyn StepRunner>, PluginError> {
        self.resolve(name, Capability::StepRunner, |entry| entry.step_runner.clone())
    }

    pub fn resolve_data_source(&self, name: &str) -> Result<Arc<dyn TestDataSource>, PluginError> {
        self.resolve(name, Capability::TestDataSource, |entry| {
            entry.data_source.clone()
        })
    }

    pub fn resolve_data_sources(
        &self,
        names: &[String],
    ) -> Result<Vec<Arc<dyn TestDataSource>>, PluginError> {
        names
            .iter()
            .map(|name| self.resolve_data_source(name))
            .collect()
    }

    pub fn resolve_parser(&self, name: &str) -> Result<Arc<dyn FeatureSourceParser>, PluginError> {
        self.resolve(name, Capability::FeatureSourceParser, |entry| {
            entry.parser.clone()
        })
    }

    /// Event listeners of every active plugin, in registration order.
    pub fn listeners(&self) -> Vec<Arc<dyn TestEventListener>> {
        self.plugins
            .read()
            .iter()
            .filter(|p| p.active())
            .filter_map(|p| p.entry.listener.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins
            .read()
            .iter()
            .map(|p| p.entry.name().to_string())
            .collect()
    }

    /// Closes initialized plugins in reverse registration order.
    pub fn close(&self) {
        let closing: Vec<PluginEntry> = {
            let mut plugins = self.plugins.write();
            plugins
                .iter_mut()
                .rev()
                .filter(|p| p.initialized)
                .map(|p| {
                    p.initialized = false;
                    p.entry.clone()
                })
                .collect()
        };
        for entry in closing {
            entry.plugin.close();
            tracing::debug!(plugin = entry.name(), "plugin closed");
        }
    }

    fn resolve<T: ?Sized>(
        &self,
        name: &str,
        capability: Capability,
        slot: impl Fn(&PluginEntry) -> Option<Arc<T>>,
    ) -> Result<Arc<T>, PluginError> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.entry.name() == name && p.active())
            .and_then(|p| slot(&p.entry))
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
                capability,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{FnStepRunner, JsonFeatureParser, StaticDataSource};
    use crate::plugin::Plugin;
    use karta_core::results::StepResult;
    use karta_core::types::{TestExecutionContext, TestStep};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenPlugin;

    impl Plugin for BrokenPlugin {
        fn name(&self) -> &str {
            "broken"
        }

        fn initialize(&self, context: &PluginContext) -> Result<(), PluginError> {
            Err(PluginError::Initialization {
                name: context.name.clone(),
                message: "missing credentials".to_string(),
            })
        }
    }

    struct CountingPlugin {
        name: &'static str,
        closes: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        initialized: AtomicUsize,
    }

    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn initialize(&self, _context: &PluginContext) -> Result<(), PluginError> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.closes.lock().push(self.name);
        }
    }

    fn started(registry: &PluginRegistry) {
        registry.enable(&[]).expect("enable all");
        registry
            .initialize_enabled(&HashMap::new(), &Arc::new(EventBus::new()))
            .expect("initialize");
    }

    #[test]
    fn resolves_only_declared_capabilities() {
        let registry = PluginRegistry::new();
        registry
            .register(PluginEntry::step_runner(Arc::new(
                FnStepRunner::new("kriya").step("noop", |_, _| Ok(StepResult::passed())),
            )))
            .expect("register runner");
        registry
            .register(PluginEntry::parser(Arc::new(JsonFeatureParser)))
            .expect("register parser");
        started(&registry);

        let runner = registry.resolve_step_runner("kriya").expect("runner");
        let mut context = TestExecutionContext::default();
        assert!(runner
            .run_step(&TestStep::new("noop"), &mut context)
            .expect("run")
            .passed);

        assert!(registry.resolve_parser("json").is_ok());
        let err = registry
            .resolve_parser("kriya")
            .err()
            .expect("runner is not a parser");
        assert!(matches!(
            err,
            PluginError::NotFound {
                capability: Capability::FeatureSourceParser,
                ..
            }
        ));
        assert!(registry.resolve_step_runner("missing").is_err());
    }

    #[test]
    fn disabled_plugins_do_not_resolve() {
        let registry = PluginRegistry::new();
        registry
            .register(PluginEntry::parser(Arc::new(JsonFeatureParser)))
            .expect("register parser");
        registry
            .register(PluginEntry::data_source(Arc::new(StaticDataSource::default())))
            .expect("register source");
        registry.enable(&["static".to_string()]).expect("enable");
        registry
            .initialize_enabled(&HashMap::new(), &Arc::new(EventBus::new()))
            .expect("initialize");

        assert!(registry.resolve_data_source("static").is_ok());
        assert!(registry.resolve_parser("json").is_err());
    }

    #[test]
    fn enabling_unknown_plugin_fails() {
        let registry = PluginRegistry::new();
        let err = registry
            .enable(&["ghost".to_string()])
            .expect_err("unknown");
        assert!(matches!(err, PluginError::Unknown { ref name } if name == "ghost"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = PluginRegistry::new();
        registry
            .register(PluginEntry::parser(Arc::new(JsonFeatureParser)))
            .expect("first");
        assert!(matches!(
            registry.register(PluginEntry::parser(Arc::new(JsonFeatureParser))),
            Err(PluginError::Duplicate { .. })
        ));
    }

    #[test]
    fn initialization_failure_is_fatal() {
        let registry = PluginRegistry::new();
        registry
            .register(PluginEntry::new(Arc::new(BrokenPlugin)))
            .expect("register");
        registry.enable(&[]).expect("enable");
        let err = registry
            .initialize_enabled(&HashMap::new(), &Arc::new(EventBus::new()))
            .expect_err("broken plugin");
        assert!(err.to_string().contains("missing credentials"));
    }

    #[test]
    fn close_runs_in_reverse_registration_order_once() {
        let closes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = PluginRegistry::new();
        for name in ["first", "second", "third"] {
            registry
                .register(PluginEntry::new(Arc::new(CountingPlugin {
                    name,
                    closes: closes.clone(),
                    initialized: AtomicUsize::new(0),
                })))
                .expect("register");
        }
        started(&registry);
        registry.close();
        registry.close();

        assert_eq!(*closes.lock(), vec!["third", "second", "first"]);
        assert_eq!(registry.names(), vec!["first", "second", "third"]);
    }
}
