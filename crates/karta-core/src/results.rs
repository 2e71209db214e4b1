//! Result and incident types produced by runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::TestData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestIncident {
    pub message: String,
    /// Failure incidents fail the enclosing result; informational ones do not.
    pub failure: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub exception: Option<String>,
    pub at: DateTime<Utc>,
}

impl TestIncident {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure: true,
            tags: BTreeSet::new(),
            exception: None,
            at: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            failure: false,
            ..Self::failure(message)
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
        self.tags.iter().any(|tag| tags.contains(tag))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    FeatureSetup,
    ScenarioSetup,
    ScenarioBody,
    ScenarioTearDown,
    FeatureTearDown,
    Job,
    ChaosAction,
}

impl StepPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StepPhase::FeatureSetup => "feature_setup",
            StepPhase::ScenarioSetup => "scenario_setup",
            StepPhase::ScenarioBody => "scenario_body",
            StepPhase::ScenarioTearDown => "scenario_tear_down",
            StepPhase::FeatureTearDown => "feature_tear_down",
            StepPhase::Job => "job",
            StepPhase::ChaosAction => "chaos_action",
        }
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub passed: bool,
    /// Unrecoverable fault, distinct from an ordinary failure.
    pub error: bool,
    #[serde(default)]
    pub incidents: Vec<TestIncident>,
    /// Values published by the step; folded into the scenario variables.
    #[serde(default)]
    pub results: TestData,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl StepResult {
    pub fn passed() -> Self {
        let now = Utc::now();
        Self {
            passed: true,
            error: false,
            incidents: Vec::new(),
            results: TestData::new(),
            start_time: now,
            end_time: now,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            incidents: vec![TestIncident::failure(message)],
            ..Self::passed()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: true,
            ..Self::failed(message)
        }
    }

    pub fn with_result(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.results.insert(key.into(), value);
        self
    }

    pub fn with_incident(mut self, incident: TestIncident) -> Self {
        if incident.failure {
            self.passed = false;
        }
        self.incidents.push(incident);
        self
    }

    pub fn timed(mut self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    /// Passed, not errored, and no failure incident recorded.
    pub fn is_successful(&self) -> bool {
        self.passed && !self.error && !has_failure(&self.incidents)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub phase: StepPhase,
    pub identifier: String,
    pub result: StepResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub iteration: u64,
    pub passed: bool,
    pub error: bool,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub incidents: Vec<TestIncident>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ScenarioResult {
    pub fn new(scenario: impl Into<String>, iteration: u64) -> Self {
        let now = Utc::now();
        Self {
            scenario: scenario.into(),
            iteration,
            passed: true,
            error: false,
            steps: Vec::new(),
            incidents: Vec::new(),
            start_time: now,
            end_time: now,
        }
    }

    pub fn error(scenario: impl Into<String>, iteration: u64, message: impl Into<String>) -> Self {
        let mut result = Self::new(scenario, iteration);
        result.add_incident(TestIncident::failure(message));
        result.error = true;
        result.end_time = Utc::now();
        result
    }

    pub fn record_step(&mut self, phase: StepPhase, identifier: impl Into<String>, result: StepResult) {
        if !result.is_successful() {
            self.passed = false;
        }
        if result.error {
            self.error = true;
        }
        self.steps.push(StepRecord {
            phase,
            identifier: identifier.into(),
            result,
        });
    }

    /// Records a teardown step. Its outcome never changes `passed`.
    pub fn record_tear_down(&mut self, identifier: impl Into<String>, result: StepResult) {
        self.steps.push(StepRecord {
            phase: StepPhase::ScenarioTearDown,
            identifier: identifier.into(),
            result,
        });
    }

    pub fn add_incident(&mut self, incident: TestIncident) {
        if incident.failure {
            self.passed = false;
        }
        self.incidents.push(incident);
    }

    pub fn steps_in(&self, phase: StepPhase) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(move |record| record.phase == phase)
    }

    /// Own incidents followed by each step's incidents in execution order.
    pub fn all_incidents(&self) -> Vec<&TestIncident> {
        self.incidents
            .iter()
            .chain(self.steps.iter().flat_map(|record| record.result.incidents.iter()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestJobResult {
    pub job: String,
    pub iteration: u64,
    pub passed: bool,
    pub error: bool,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub incidents: Vec<TestIncident>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl TestJobResult {
    pub fn new(job: impl Into<String>, iteration: u64) -> Self {
        let now = Utc::now();
        Self {
            job: job.into(),
            iteration,
            passed: true,
            error: false,
            steps: Vec::new(),
            incidents: Vec::new(),
            start_time: now,
            end_time: now,
        }
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.error = true;
        self.passed = false;
        self.incidents.push(TestIncident::failure(message));
    }

    pub fn record_step(&mut self, phase: StepPhase, identifier: impl Into<String>, result: StepResult) {
        if !result.is_successful() {
            self.passed = false;
        }
        self.steps.push(StepRecord {
            phase,
            identifier: identifier.into(),
            result,
        });
    }

    pub fn add_incident(&mut self, incident: TestIncident) {
        if incident.failure {
            self.passed = false;
        }
        self.incidents.push(incident);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub index: u64,
    pub passed: bool,
    #[serde(default)]
    pub scenarios: Vec<ScenarioResult>,
    #[serde(default)]
    pub incidents: Vec<TestIncident>,
}

impl IterationResult {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            passed: true,
            scenarios: Vec::new(),
            incidents: Vec::new(),
        }
    }

    pub fn push(&mut self, scenario: ScenarioResult) {
        if !scenario.passed || scenario.error {
            self.passed = false;
        }
        self.scenarios.push(scenario);
    }

    pub fn add_incident(&mut self, incident: TestIncident) {
        if incident.failure {
            self.passed = false;
        }
        self.incidents.push(incident);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureResult {
    pub feature: String,
    pub passed: bool,
    #[serde(default)]
    pub setup: Vec<StepRecord>,
    #[serde(default)]
    pub iterations: Vec<IterationResult>,
    #[serde(default)]
    pub tear_down: Vec<StepRecord>,
    #[serde(default)]
    pub incidents: Vec<TestIncident>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl FeatureResult {
    pub fn new(feature: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            feature: feature.into(),
            passed: true,
            setup: Vec::new(),
            iterations: Vec::new(),
            tear_down: Vec::new(),
            incidents: Vec::new(),
            start_time: now,
            end_time: now,
        }
    }

    pub fn failed(feature: impl Into<String>, incident: TestIncident) -> Self {
        let mut result = Self::new(feature);
        result.add_incident(incident);
        result
    }

    pub fn add_incident(&mut self, incident: TestIncident) {
        if incident.failure {
            self.passed = false;
        }
        self.incidents.push(incident);
    }

    pub fn setup_passed(&self) -> bool {
        self.setup.iter().all(|record| record.result.is_successful())
    }

    pub fn scenario_results(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.iterations.iter().flat_map(|iteration| iteration.scenarios.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_name: String,
    pub passed: bool,
    #[serde(default)]
    pub features: Vec<FeatureResult>,
    #[serde(default)]
    pub incidents: Vec<TestIncident>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl RunReport {
    pub fn new(run_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_name: run_name.into(),
            passed: true,
            features: Vec::new(),
            incidents: Vec::new(),
            start_time: now,
            end_time: now,
        }
    }

    pub fn push_feature(&mut self, feature: FeatureResult) {
        if !feature.passed {
            self.passed = false;
        }
        self.features.push(feature);
    }

    pub fn add_incident(&mut self, incident: TestIncident) {
        if incident.failure {
            self.passed = false;
        }
        self.incidents.push(incident);
    }

    /// Every incident in the run, run-level first, then per feature in order.
    pub fn all_incidents(&self) -> Vec<&TestIncident> {
        let mut collected: Vec<&TestIncident> = self.incidents.iter().collect();
        for feature in &self.features {
            collected.extend(feature.incidents.iter());
            collected.extend(feature.setup.iter().flat_map(|r| r.result.incidents.iter()));
            for iteration in &feature.iterations {
                collected.extend(iteration.incidents.iter());
                for scenario in &iteration.scenarios {
                    collected.extend(scenario.all_incidents());
                }
            }
            collected.extend(feature.tear_down.iter().flat_map(|r| r.result.incidents.iter()));
        }
        collected
    }
}

pub fn has_failure(incidents: &[TestIncident]) -> bool {
    incidents.iter().any(|incident| incident.failure)
}
