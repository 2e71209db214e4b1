//! Test model types shared by the runtime, plugins and minions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::chaos::ChaosTreeSpec;

/// Flat variable map handed to steps.
pub type TestData = HashMap<String, serde_json::Value>;

/// Candidate values per key, picked cyclically by iteration index.
pub type TestDataSet = HashMap<String, Vec<serde_json::Value>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct RunName(pub String);

impl RunName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Name used when a run request carries none.
    pub fn unnamed() -> Self {
        Self(format!("Unnamed-{}", chrono::Utc::now().timestamp_millis()))
    }
}

impl std::fmt::Display for RunName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub identifier: String,
    /// Overrides the runner-level default step runner.
    #[serde(default)]
    pub step_runner_plugin: Option<String>,
    #[serde(default)]
    pub test_data: TestData,
    #[serde(default)]
    pub test_data_set: TestDataSet,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl TestStep {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.test_data.insert(key.into(), value);
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.step_runner_plugin = Some(plugin.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestScenario {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<TestStep>,
    /// Relative weight for chance-based selection. Unset counts as 1.0.
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub exclusive_group: Option<String>,
    #[serde(default)]
    pub test_data: TestData,
    #[serde(default)]
    pub test_data_set: TestDataSet,
}

impl TestScenario {
    pub fn new(name: impl Into<String>, steps: Vec<TestStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            ..Self::default()
        }
    }

    pub fn selection_weight(&self) -> f64 {
        match self.probability {
            Some(weight) if weight.is_finite() && weight > 0.0 => weight,
            Some(_) => 0.0,
            None => 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestFeature {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Runs once before any iteration.
    #[serde(default)]
    pub setup_steps: Vec<TestStep>,
    #[serde(default)]
    pub scenario_setup_steps: Vec<TestStep>,
    #[serde(default)]
    pub scenarios: Vec<TestScenario>,
    #[serde(default)]
    pub scenario_tear_down_steps: Vec<TestStep>,
    /// Runs once after all iterations.
    #[serde(default)]
    pub tear_down_steps: Vec<TestStep>,
}

impl TestFeature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobWork {
    Steps {
        #[serde(default)]
        steps: Vec<TestStep>,
    },
    Chaos {
        tree: ChaosTreeSpec,
    },
    #[serde(other)]
    Unsupported,
}

impl JobWork {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobWork::Steps { .. } => "steps",
            JobWork::Chaos { .. } => "chaos",
            JobWork::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestJob {
    pub name: String,
    pub work: JobWork,
    #[serde(default)]
    pub step_runner_plugin: Option<String>,
    /// Minion that should execute this job's steps and actions.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub test_data: TestData,
    #[serde(default)]
    pub test_data_set: TestDataSet,
}

impl TestJob {
    pub fn new(name: impl Into<String>, work: JobWork) -> Self {
        Self {
            name: name.into(),
            work,
            step_runner_plugin: None,
            node: None,
            test_data: TestData::new(),
            test_data_set: TestDataSet::new(),
        }
    }
}

/// Addresses one step in one iteration of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionStepPointer {
    pub run_name: String,
    pub feature_name: String,
    #[serde(default)]
    pub scenario_name: Option<String>,
    pub iteration_index: u64,
    pub step_identifier: String,
}

impl ExecutionStepPointer {
    pub fn new(
        run_name: impl Into<String>,
        feature_name: impl Into<String>,
        scenario_name: Option<String>,
        iteration_index: i64,
        step_identifier: impl Into<String>,
    ) -> Self {
        Self {
            run_name: run_name.into(),
            feature_name: feature_name.into(),
            scenario_name,
            iteration_index: iteration_index.max(0) as u64,
            step_identifier: step_identifier.into(),
        }
    }
}

/// Variables visible to one step invocation.
///
/// `data` is a fresh merged copy per step. `variables` belong to a single
/// scenario run and are never shared between iterations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestExecutionContext {
    pub run_name: String,
    pub feature_name: String,
    #[serde(default)]
    pub scenario_name: Option<String>,
    pub iteration_index: u64,
    #[serde(default)]
    pub step_identifier: String,
    #[serde(default)]
    pub data: TestData,
    #[serde(default)]
    pub variables: TestData,
}

impl TestExecutionContext {
    pub fn new(
        run_name: impl Into<String>,
        feature_name: impl Into<String>,
        scenario_name: Option<String>,
        iteration_index: u64,
    ) -> Self {
        Self {
            run_name: run_name.into(),
            feature_name: feature_name.into(),
            scenario_name,
            iteration_index,
            ..Self::default()
        }
    }

    pub fn pointer(&self, step_identifier: &str) -> ExecutionStepPointer {
        ExecutionStepPointer {
            run_name: self.run_name.clone(),
            feature_name: self.feature_name.clone(),
            scenario_name: self.scenario_name.clone(),
            iteration_index: self.iteration_index,
            step_identifier: step_identifier.to_string(),
        }
    }

    /// Points the context at a new step with freshly merged data.
    pub fn enter_step(&mut self, step_identifier: impl Into<String>, data: TestData) {
        self.step_identifier = step_identifier.into();
        self.data = data;
    }

    /// Looks a key up in the step data, then in the scenario variables.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key).or_else(|| self.variables.get(key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RunTargetKind {
    FeatureFile(PathBuf),
    FeatureSource(String),
    Tags(BTreeSet<String>),
    /// Name of a test registered in the catalog.
    TestReference(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTarget {
    pub what: RunTargetKind,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub chance_based: bool,
    #[serde(default)]
    pub exclusive_per_iteration: bool,
}

impl RunTarget {
    pub fn new(what: RunTargetKind) -> Self {
        Self {
            what,
            iterations: default_iterations(),
            parallelism: default_parallelism(),
            chance_based: false,
            exclusive_per_iteration: false,
        }
    }

    pub fn with_iterations(mut self, iterations: u64, parallelism: usize) -> Self {
        self.iterations = iterations;
        self.parallelism = parallelism;
        self
    }

    pub fn iteration_options(&self) -> IterationOptions {
        IterationOptions {
            iterations: self.iterations,
            parallelism: self.parallelism,
            chance_based: self.chance_based,
            exclusive_per_iteration: self.exclusive_per_iteration,
        }
    }
}

fn default_iterations() -> u64 {
    1
}

fn default_parallelism() -> usize {
    1
}

/// Iteration control shared by run targets and catalog tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationOptions {
    pub iterations: u64,
    pub parallelism: usize,
    pub chance_based: bool,
    pub exclusive_per_iteration: bool,
}

impl Default for IterationOptions {
    fn default() -> Self {
        Self {
            iterations: 1,
            parallelism: 1,
            chance_based: false,
            exclusive_per_iteration: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestSource {
    Feature { feature: TestFeature },
    FeatureSource {
        #[serde(default)]
        parser_plugin: Option<String>,
        text: String,
    },
}

/// A catalog entry that has already been assembled from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogTest {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub source: TestSource,
    #[serde(default)]
    pub step_runner_plugin: Option<String>,
    #[serde(default)]
    pub data_source_plugins: Vec<String>,
    #[serde(default)]
    pub thread_group: Option<String>,
    #[serde(default)]
    pub iterations: IterationOptions,
}

impl CatalogTest {
    pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
        self.tags.iter().any(|tag| tags.contains(tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCatalog {
    #[serde(default)]
    pub tests: Vec<CatalogTest>,
}

impl TestCatalog {
    pub fn new(tests: Vec<CatalogTest>) -> Self {
        Self { tests }
    }

    pub fn find(&self, name: &str) -> Option<&CatalogTest> {
        self.tests.iter().find(|test| test.name == name)
    }

    /// Tests carrying at least one of `tags`, sorted by name.
    pub fn filter_by_tags(&self, tags: &BTreeSet<String>) -> Vec<&CatalogTest> {
        let mut matched: Vec<&CatalogTest> = self
            .tests
            .iter()
            .filter(|test| test.has_any_tag(tags))
            .collect();
        matched.sort_by(|left, right| left.name.cmp(&right.name));
        matched
    }
}
