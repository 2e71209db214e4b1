//! Local or minion-delegated execution of scenario iterations.

use karta_core::events::EventKind;
use karta_core::results::{ScenarioResult, TestIncident};
use karta_core::types::TestExecutionContext;
use karta_events::bus::EventBus;
use karta_minion::registry::MinionRegistry;
use karta_minion::service::ScenarioRequest;
use std::sync::Arc;

use crate::lifecycle::{context_event, emit};
use crate::scenario_runner::ScenarioRunner;
use crate::step_target::MINION_INCIDENT_TAG;

pub trait ScenarioExecutor: Send + Sync {
    fn execute(&self, request: &ScenarioRequest) -> ScenarioResult;
}

impl ScenarioExecutor for ScenarioRunner {
    fn execute(&self, request: &ScenarioRequest) -> ScenarioResult {
        self.run(request)
    }
}

/// Sends each scenario iteration to the next minion, round robin.
pub struct RemoteScenarioExecutor {
    minions: Arc<MinionRegistry>,
    events: Arc<EventBus>,
}

impl RemoteScenarioExecutor {
    pub fn new(minions: Arc<MinionRegistry>, events: Arc<EventBus>) -> Self {
        Self { minions, events }
    }
}

impl ScenarioExecutor for RemoteScenarioExecutor {
    fn execute(&self, request: &ScenarioRequest) -> ScenarioResult {
        let context = TestExecutionContext::new(
            request.run_name.clone(),
            request.feature_name.clone(),
            Some(request.scenario.name.clone()),
            request.iteration,
        );
        emit(&self.events, context_event(&context, EventKind::ScenarioStart));

        let result = match self.minions.next() {
            None => ScenarioResult::error(
                &request.scenario.name,
                request.iteration,
                "no minion available for remote execution",
            ),
            Some(minion) => match minion.service.run_scenario(request) {
                Ok(result) => {
                    tracing::debug!(
                        minion = %minion.name,
                        scenario = %request.scenario.name,
                        iteration = request.iteration,
                        "scenario delegated"
                    );
                    result
                }
                Err(err) => {
                    tracing::warn!(minion = %minion.name, error = %err, "scenario delegation failed");
                    let mut result = ScenarioResult::new(&request.scenario.name, request.iteration);
                    result.error = true;
                    result.add_incident(
                        TestIncident::failure(format!(
                            "minion {} could not run scenario: {err}",
                            minion.name
                        ))
                        .with_tags([MINION_INCIDENT_TAG]),
                    );
                    result
                }
            },
        };

        // step events were raised on the minion's bus; replay them on ours
        for record in &result.steps {
            emit(
                &self.events,
                context_event(
                    &context,
                    EventKind::StepStart {
                        phase: record.phase,
                        step: record.identifier.clone(),
                    },
                ),
            );
            emit(
                &self.events,
                context_event(
                    &context,
                    EventKind::StepComplete {
                        phase: record.phase,
                        step: record.identifier.clone(),
                        result: record.result.clone(),
                    },
                ),
            );
        }

        emit(
            &self.events,
            context_event(
                &context,
                EventKind::ScenarioComplete {
                    passed: result.passed,
                    error: result.error,
                },
            ),
        );
        result
    }
}
