//! Plugins shipped with the runtime.

use karta_core::chaos::ChaosAction;
use karta_core::results::{StepResult, TestIncident};
use karta_core::types::{
    ExecutionStepPointer, TestData, TestExecutionContext, TestFeature, TestStep,
};
use karta_events::listener::TracingEventListener;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{FeatureSourceParser, StepRunner, TestDataSource};
use crate::error::{ParseError, PluginError, StepExecutionError};
use crate::plugin::{Plugin, PluginContext, PluginEntry};

pub const JSON_FEATURE_PARSER: &str = "json";
pub const STATIC_DATA_SOURCE: &str = "static";
pub const TRACING_LISTENER: &str = "tracing";
pub const ECHO_STEP_RUNNER: &str = "echo";

/// Parses features written as JSON documents of the feature model.
#[derive(Debug, Clone, Default)]
pub struct JsonFeatureParser;

impl Plugin for JsonFeatureParser {
    fn name(&self) -> &str {
        JSON_FEATURE_PARSER
    }
}

impl FeatureSourceParser for JsonFeatureParser {
    fn parse_feature_source(&self, source: &str) -> Result<TestFeature, ParseError> {
        let feature: TestFeature =
            serde_json::from_str(source).map_err(|source| ParseError::Json { source })?;
        if feature.name.trim().is_empty() {
            return Err(ParseError::Invalid {
                message: "feature name must not be empty".to_string(),
            });
        }
        Ok(feature)
    }
}

#[derive(Debug, Default, Deserialize)]
struct StaticDataProperties {
    #[serde(default)]
    data: toml::Table,
}

/// Serves the same data for every pointer, from its `data` property table.
#[derive(Debug, Default)]
pub struct StaticDataSource {
    data: RwLock<TestData>,
}

impl StaticDataSource {
    pub fn with_data(data: TestData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }
}

impl Plugin for StaticDataSource {
    fn name(&self) -> &str {
        STATIC_DATA_SOURCE
    }

    fn initialize(&self, context: &PluginContext) -> Result<(), PluginError> {
        let properties: StaticDataProperties = context.properties_as()?;
        let mut data = self.data.write();
        for (key, value) in properties.data {
            let value = serde_json::to_value(value).map_err(|err| PluginError::Initialization {
                name: context.name.clone(),
                message: err.to_string(),
            })?;
            data.insert(key, value);
        }
        Ok(())
    }
}

impl TestDataSource for StaticDataSource {
    fn get_data(&self, _pointer: &ExecutionStepPointer) -> TestData {
        self.data.read().clone()
    }
}

impl Plugin for TracingEventListener {
    fn name(&self) -> &str {
        TRACING_LISTENER
    }
}

type StepHandler =
    Box<dyn Fn(&TestStep, &mut TestExecutionContext) -> Result<StepResult, StepExecutionError> + Send + Sync>;
type ChaosHandler = Box<
    dyn Fn(&ChaosAction, &mut TestExecutionContext) -> Result<StepResult, StepExecutionError>
        + Send
        + Sync,
>;

/// Step runner backed by closures keyed on step identifier or action name.
pub struct FnStepRunner {
    name: String,
    steps: HashMap<String, StepHandler>,
    actions: HashMap<String, ChaosHandler>,
    fallback: Option<StepHandler>,
}

impl FnStepRunner {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: HashMap::new(),
            actions: HashMap::new(),
            fallback: None,
        }
    }

    pub fn step<F>(mut self, identifier: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&TestStep, &mut TestExecutionContext) -> Result<StepResult, StepExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.steps.insert(identifier.into(), Box::new(handler));
        self
    }

    pub fn chaos<F>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ChaosAction, &mut TestExecutionContext) -> Result<StepResult, StepExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.actions.insert(action.into(), Box::new(handler));
        self
    }

    /// Handles steps with no exact definition.
    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TestStep, &mut TestExecutionContext) -> Result<StepResult, StepExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    pub fn into_entry(self) -> PluginEntry {
        PluginEntry::step_runner(Arc::new(self))
    }
}

impl Plugin for FnStepRunner {
    fn name(&self) -> &str {
        &self.name
    }
}

impl StepRunner for FnStepRunner {
    fn run_step(
        &self,
        step: &TestStep,
        context: &mut TestExecutionContext,
    ) -> Result<StepResult, StepExecutionError> {
        match self.steps.get(&step.identifier).or(self.fallback.as_ref()) {
            Some(handler) => handler(step, context),
            None => Ok(StepResult::failed(format!(
                "no step definition matches '{}'",
                step.identifier
            ))),
        }
    }

    fn perform_chaos_action(
        &self,
        action: &ChaosAction,
        context: &mut TestExecutionContext,
    ) -> Result<StepResult, StepExecutionError> {
        match self.actions.get(&action.name) {
            Some(handler) => handler(action, context),
            None => Err(StepExecutionError::Unsupported {
                operation: "chaos action",
                name: action.name.clone(),
            }),
        }
    }
}

/// Dry-run step runner: every step passes and publishes its parameters.
#[derive(Debug, Clone, Default)]
pub struct EchoStepRunner;

impl Plugin for EchoStepRunner {
    fn name(&self) -> &str {
        ECHO_STEP_RUNNER
    }
}

impl StepRunner for EchoStepRunner {
    fn run_step(
        &self,
        step: &TestStep,
        _context: &mut TestExecutionContext,
    ) -> Result<StepResult, StepExecutionError> {
        let mut result = StepResult::passed();
        result
            .results
            .extend(step.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(result)
    }

    fn perform_chaos_action(
        &self,
        action: &ChaosAction,
        _context: &mut TestExecutionContext,
    ) -> Result<StepResult, StepExecutionError> {
        Ok(StepResult::passed().with_incident(TestIncident::info(format!(
            "dry run: chaos action {} on {:?} skipped",
            action.name, action.subjects
        ))))
    }
}
