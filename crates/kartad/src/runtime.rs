//! The assembled runtime: plugins, event bus, minions, pools and runners.

use karta_core::chaos::ChaosAction;
use karta_core::config::KartaConfig;
use karta_core::results::{RunReport, ScenarioResult, StepResult, TestJobResult};
use karta_core::types::{RunName, RunTarget, TestCatalog, TestExecutionContext, TestJob, TestStep};
use karta_core::validation::{Validate, ValidationLevel};
use karta_events::bus::EventBus;
use karta_events::event_log::JsonlEventLog;
use karta_events::listener::{TestEventListener, TracingEventListener};
use karta_minion::client::TcpMinionClient;
use karta_minion::registry::{KartaMinion, MinionRegistry};
use karta_minion::service::{MinionHealth, MinionService, RemoteStepOutcome, ScenarioRequest};
use karta_minion::MinionError;
use karta_plugins::builtin::{EchoStepRunner, JsonFeatureParser, StaticDataSource};
use karta_plugins::error::PluginError;
use karta_plugins::plugin::PluginEntry;
use karta_plugins::registry::PluginRegistry;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::executor::{RemoteScenarioExecutor, ScenarioExecutor};
use crate::feature_runner::FeatureRunner;
use crate::job_runner::JobRunner;
use crate::pool::ThreadPoolGroupManager;
use crate::scenario_runner::ScenarioRunner;
use crate::step_target::StepTarget;

pub const DEFAULT_RUNTIME_NAME: &str = "karta";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("runtime {name} is shut down")]
    ShutDown { name: String },
}

pub struct KartaRuntimeBuilder {
    name: String,
    config: KartaConfig,
    plugins: Vec<PluginEntry>,
    listeners: Vec<Arc<dyn TestEventListener>>,
    catalog: TestCatalog,
    minions: Vec<KartaMinion>,
}

impl KartaRuntimeBuilder {
    pub fn new(config: KartaConfig) -> Self {
        Self {
            name: DEFAULT_RUNTIME_NAME.to_string(),
            config,
            plugins: Vec::new(),
            listeners: Vec::new(),
            catalog: TestCatalog::default(),
            minions: Vec::new(),
        }
    }

    /// Name reported by health checks when this runtime serves as a minion.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn plugin(mut self, entry: PluginEntry) -> Self {
        self.plugins.push(entry);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn TestEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn catalog(mut self, catalog: TestCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn minion(mut self, minion: KartaMinion) -> Self {
        self.minions.push(minion);
        self
    }

    /// Validates the configuration, initializes every enabled plugin and starts the event bus.
    ///
    /// Any plugin that fails to initialize aborts the build.
    pub fn build(self) -> Result<Arc<KartaRuntime>, RuntimeError> {
        let issues = self.config.validate();
        for issue in issues.iter().filter(|issue| issue.level == ValidationLevel::Warning) {
            tracing::warn!(code = issue.code, "{}", issue.message);
        }
        let errors: Vec<String> = issues
            .iter()
            .filter(|issue| issue.is_error())
            .map(|issue| format!("{}: {}", issue.code, issue.message))
            .collect();
        if !errors.is_empty() {
            return Err(RuntimeError::InvalidConfig(errors.join("; ")));
        }

        let config = Arc::new(self.config);
        let registry = Arc::new(PluginRegistry::new());
        registry.register(PluginEntry::parser(Arc::new(JsonFeatureParser)))?;
        registry.register(PluginEntry::data_source(Arc::new(StaticDataSource::default())))?;
        registry.register(PluginEntry::listener(Arc::new(TracingEventListener)))?;
        registry.register(PluginEntry::step_runner(Arc::new(EchoStepRunner)))?;
        for entry in self.plugins {
            registry.register(entry)?;
        }

        let events = Arc::new(EventBus::new());
        registry.enable(&config.enabled_plugins)?;
        registry.initialize_enabled(&config.plugins, &events)?;

        for listener in registry.listeners() {
            events.add_listener(listener);
        }
        for listener in self.listeners {
            events.add_listener(listener);
        }
        if let Some(dir) = &config.event_log_dir {
            events.add_listener(Arc::new(JsonlEventLog::new(dir.clone())));
        }

        let minions = Arc::new(MinionRegistry::new());
        if config.minions_enabled {
            for minion in &config.minions {
                minions.add(KartaMinion::new(
                    minion.name.clone(),
                    minion.address.clone(),
                    Arc::new(TcpMinionClient::new(minion.address.clone())),
                ));
            }
        }
        for minion in self.minions {
            minions.add(minion);
        }

        let rng = Arc::new(Mutex::new(match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }));

        events.start();

        let scenarios = ScenarioRunner::new(
            registry.clone(),
            events.clone(),
            config.default_step_runner_plugin.clone(),
            config.default_test_data_source_plugins.clone(),
        );
        let executor: Arc<dyn ScenarioExecutor> = if config.minions_enabled && !minions.is_empty() {
            tracing::info!(minions = ?minions.names(), "scenarios delegated to minions");
            Arc::new(RemoteScenarioExecutor::new(minions.clone(), events.clone()))
        } else {
            Arc::new(scenarios.clone())
        };
        let pools = Arc::new(ThreadPoolGroupManager::new());
        let features = FeatureRunner::new(scenarios.clone(), executor, pools.clone(), rng.clone());
        let dispatcher = Dispatcher::new(
            features,
            registry.clone(),
            events.clone(),
            pools.clone(),
            Arc::new(self.catalog),
            config.clone(),
        );
        let jobs = JobRunner::new(scenarios.clone(), minions.clone(), rng);

        tracing::info!(
            runtime = %self.name,
            plugins = ?registry.names(),
            listeners = events.listener_count(),
            "runtime started"
        );
        Ok(Arc::new(KartaRuntime {
            name: self.name,
            config,
            registry,
            events,
            minions,
            pools,
            scenarios,
            dispatcher,
            jobs,
            shut_down: AtomicBool::new(false),
        }))
    }
}

pub struct KartaRuntime {
    name: String,
    config: Arc<KartaConfig>,
    registry: Arc<PluginRegistry>,
    events: Arc<EventBus>,
    minions: Arc<MinionRegistry>,
    pools: Arc<ThreadPoolGroupManager>,
    scenarios: ScenarioRunner,
    dispatcher: Dispatcher,
    jobs: JobRunner,
    shut_down: AtomicBool,
}

impl KartaRuntime {
    pub fn builder(config: KartaConfig) -> KartaRuntimeBuilder {
        KartaRuntimeBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &KartaConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn minions(&self) -> &Arc<MinionRegistry> {
        &self.minions
    }

    pub fn pools(&self) -> &Arc<ThreadPoolGroupManager> {
        &self.pools
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Runs `target` and blocks until it completes. A missing name becomes `Unnamed-<millis>`.
    pub fn run(&self, run_name: Option<RunName>, target: &RunTarget) -> Result<RunReport, RuntimeError> {
        self.ensure_running()?;
        let run_name = run_name.unwrap_or_else(RunName::unnamed);
        Ok(self.dispatcher.dispatch(&run_name, target))
    }

    pub fn run_job(
        &self,
        run_name: Option<RunName>,
        job: &TestJob,
        iteration: u64,
    ) -> Result<TestJobResult, RuntimeError> {
        self.ensure_running()?;
        let run_name = run_name.unwrap_or_else(RunName::unnamed);
        Ok(self.jobs.run(run_name.as_ref(), job, iteration))
    }

    /// Drains pools, closes the bus, drops minions, then closes plugins. Safe to call twice.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pools.shutdown();
        self.events.close();
        self.minions.clear();
        self.registry.close();
        tracing::info!(runtime = %self.name, "runtime shut down");
    }

    fn ensure_running(&self) -> Result<(), RuntimeError> {
        if self.is_shut_down() {
            return Err(RuntimeError::ShutDown {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn local_target(&self, plugin: &str) -> Result<StepTarget, StepResult> {
        self.registry
            .resolve_step_runner(plugin)
            .map(StepTarget::Local)
            .map_err(|err| StepResult::error(err.to_string()))
    }
}

impl Drop for KartaRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serving side of the minion protocol: work arriving over RPC runs on local plugins.
impl MinionService for KartaRuntime {
    fn run_step(
        &self,
        plugin: &str,
        step: &TestStep,
        context: &TestExecutionContext,
    ) -> Result<RemoteStepOutcome, MinionError> {
        let mut context = context.clone();
        let result = match self.local_target(plugin) {
            Ok(target) => target.run_step(step, &mut context),
            Err(result) => result,
        };
        Ok(RemoteStepOutcome {
            result,
            variables: context.variables,
        })
    }

    fn perform_chaos_action(
        &self,
        plugin: &str,
        action: &ChaosAction,
        context: &TestExecutionContext,
    ) -> Result<RemoteStepOutcome, MinionError> {
        let mut context = context.clone();
        let result = match self.local_target(plugin) {
            Ok(target) => target.perform_chaos_action(action, &mut context),
            Err(result) => result,
        };
        Ok(RemoteStepOutcome {
            result,
            variables: context.variables,
        })
    }

    fn run_scenario(&self, request: &ScenarioRequest) -> Result<ScenarioResult, MinionError> {
        Ok(self.scenarios.run(request))
    }

    fn health(&self) -> Result<MinionHealth, MinionError> {
        Ok(MinionHealth {
            name: self.name.clone(),
            healthy: !self.is_shut_down(),
        })
    }
}
