use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chaos::ChaosAction;
use crate::results::{StepPhase, StepResult, TestIncident};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    RunComplete {
        passed: bool,
    },
    FeatureStart,
    FeatureComplete {
        passed: bool,
    },
    ScenarioStart,
    ScenarioComplete {
        passed: bool,
        error: bool,
    },
    StepStart {
        phase: StepPhase,
        step: String,
    },
    StepComplete {
        phase: StepPhase,
        step: String,
        result: StepResult,
    },
    JobStart,
    JobComplete {
        passed: bool,
        error: bool,
    },
    ChaosActionStart {
        action: ChaosAction,
    },
    ChaosActionComplete {
        action: ChaosAction,
        result: StepResult,
    },
    Incident {
        incident: TestIncident,
    },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStart => "run_start",
            EventKind::RunComplete { .. } => "run_complete",
            EventKind::FeatureStart => "feature_start",
            EventKind::FeatureComplete { .. } => "feature_complete",
            EventKind::ScenarioStart => "scenario_start",
            EventKind::ScenarioComplete { .. } => "scenario_complete",
            EventKind::StepStart { .. } => "step_start",
            EventKind::StepComplete { .. } => "step_complete",
            EventKind::JobStart => "job_start",
            EventKind::JobComplete { .. } => "job_complete",
            EventKind::ChaosActionStart { .. } => "chaos_action_start",
            EventKind::ChaosActionComplete { .. } => "chaos_action_complete",
            EventKind::Incident { .. } => "incident",
        }
    }
}

/// One lifecycle event, addressed by run and the enclosing units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_name: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub feature: Option<String>,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub job: Option<String>,
    #[serde(default)]
    pub iteration: Option<u64>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(run_name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            run_name: run_name.into(),
            at: Utc::now(),
            feature: None,
            scenario: None,
            job: None,
            iteration: None,
            kind,
        }
    }

    pub fn in_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn in_scenario(mut self, scenario: impl Into<String>, iteration: u64) -> Self {
        self.scenario = Some(scenario.into());
        self.iteration = Some(iteration);
        self
    }

    pub fn in_job(mut self, job: impl Into<String>, iteration: u64) -> Self {
        self.job = Some(job.into());
        self.iteration = Some(iteration);
        self
    }

    pub fn at_iteration(mut self, iteration: u64) -> Self {
        self.iteration = Some(iteration);
        self
    }
}
