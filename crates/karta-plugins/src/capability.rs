use karta_core::chaos::ChaosAction;
use karta_core::results::StepResult;
use karta_core::types::{
    ExecutionStepPointer, TestData, TestExecutionContext, TestFeature, TestStep,
};
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, StepExecutionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    StepRunner,
    TestDataSource,
    FeatureSourceParser,
    EventListener,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::StepRunner => "step runner",
            Capability::TestDataSource => "test data source",
            Capability::FeatureSourceParser => "feature source parser",
            Capability::EventListener => "event listener",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait StepRunner: Send + Sync {
    fn run_step(
        &self,
        step: &TestStep,
        context: &mut TestExecutionContext,
    ) -> Result<StepResult, StepExecutionError>;

    fn perform_chaos_action(
        &self,
        action: &ChaosAction,
        _context: &mut TestExecutionContext,
    ) -> Result<StepResult, StepExecutionError> {
        Err(StepExecutionError::Unsupported {
            operation: "chaos action",
            name: action.name.clone(),
        })
    }
}

pub trait TestDataSource: Send + Sync {
    /// Unknown pointers yield an empty map.
    fn get_data(&self, pointer: &ExecutionStepPointer) -> TestData;
}

pub trait FeatureSourceParser: Send + Sync {
    fn parse_feature_source(&self, source: &str) -> Result<TestFeature, ParseError>;
}
