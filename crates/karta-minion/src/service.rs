use karta_core::chaos::ChaosAction;
use karta_core::results::{ScenarioResult, StepResult};
use karta_core::types::{TestData, TestExecutionContext, TestScenario, TestStep};
use serde::{Deserialize, Serialize};

use crate::error::MinionError;

/// A remote step result plus the variables as the step left them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStepOutcome {
    pub result: StepResult,
    #[serde(default)]
    pub variables: TestData,
}

/// Everything a minion needs to run one scenario iteration on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRequest {
    pub run_name: String,
    pub feature_name: String,
    pub iteration: u64,
    #[serde(default)]
    pub scenario_setup_steps: Vec<TestStep>,
    pub scenario: TestScenario,
    #[serde(default)]
    pub scenario_tear_down_steps: Vec<TestStep>,
    #[serde(default)]
    pub step_runner_plugin: Option<String>,
    #[serde(default)]
    pub data_source_plugins: Vec<String>,
    /// Variables published by feature setup, seeding the scenario context.
    #[serde(default)]
    pub variables: TestData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinionHealth {
    pub name: String,
    pub healthy: bool,
}

/// Operations a minion performs on the orchestrator's behalf.
pub trait MinionService: Send + Sync {
    fn run_step(
        &self,
        plugin: &str,
        step: &TestStep,
        context: &TestExecutionContext,
    ) -> Result<RemoteStepOutcome, MinionError>;

    fn perform_chaos_action(
        &self,
        plugin: &str,
        action: &ChaosAction,
        context: &TestExecutionContext,
    ) -> Result<RemoteStepOutcome, MinionError>;

    fn run_scenario(&self, request: &ScenarioRequest) -> Result<ScenarioResult, MinionError>;

    fn health(&self) -> Result<MinionHealth, MinionError>;
}
