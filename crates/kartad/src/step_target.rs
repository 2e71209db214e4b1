//! Where a single step or chaos action executes.

use chrono::Utc;
use karta_core::chaos::ChaosAction;
use karta_core::results::{StepResult, TestIncident};
use karta_core::types::{TestExecutionContext, TestStep};
use karta_minion::registry::KartaMinion;
use karta_minion::service::RemoteStepOutcome;
use karta_minion::MinionError;
use karta_plugins::capability::StepRunner;
use karta_plugins::error::StepExecutionError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub const MINION_INCIDENT_TAG: &str = "minion";

#[derive(Clone)]
pub enum StepTarget {
    Local(Arc<dyn StepRunner>),
    Remote {
        minion: Arc<KartaMinion>,
        plugin: String,
    },
}

impl StepTarget {
    pub fn run_step(&self, step: &TestStep, context: &mut TestExecutionContext) -> StepResult {
        let started = Utc::now();
        let result = match self {
            StepTarget::Local(runner) => guarded(&step.identifier, || runner.run_step(step, context)),
            StepTarget::Remote { minion, plugin } => {
                let outcome = minion.service.run_step(plugin, step, context);
                remote(minion, context, outcome)
            }
        };
        result.timed(started, Utc::now())
    }

    pub fn perform_chaos_action(
        &self,
        action: &ChaosAction,
        context: &mut TestExecutionContext,
    ) -> StepResult {
        let started = Utc::now();
        let result = match self {
            StepTarget::Local(runner) => guarded(&action.name, || {
                runner.perform_chaos_action(action, context)
            }),
            StepTarget::Remote { minion, plugin } => {
                let outcome = minion.service.perform_chaos_action(plugin, action, context);
                remote(minion, context, outcome)
            }
        };
        result.timed(started, Utc::now())
    }
}

fn guarded(
    name: &str,
    call: impl FnOnce() -> Result<StepResult, StepExecutionError>,
) -> StepResult {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => StepResult::failed(err.to_string()),
        Err(_) => StepResult::failed(format!("step runner panicked while running '{name}'")),
    }
}

fn remote(
    minion: &KartaMinion,
    context: &mut TestExecutionContext,
    outcome: Result<RemoteStepOutcome, MinionError>,
) -> StepResult {
    match outcome {
        Ok(outcome) => {
            context.variables = outcome.variables;
            outcome.result
        }
        Err(err) => {
            tracing::warn!(minion = %minion.name, error = %err, "remote call failed");
            StepResult::passed().with_incident(
                TestIncident::failure(format!("minion {} call failed: {err}", minion.name))
                    .with_tags([MINION_INCIDENT_TAG]),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karta_core::results::ScenarioResult;
    use karta_minion::service::{MinionHealth, MinionService, ScenarioRequest};
    use karta_plugins::builtin::FnStepRunner;
    use serde_json::json;

    struct DownMinion;

    impl MinionService for DownMinion {
        fn run_step(
            &self,
            _plugin: &str,
            _step: &TestStep,
            _context: &TestExecutionContext,
        ) -> Result<RemoteStepOutcome, MinionError> {
            Err(MinionError::ConnectionClosed {
                address: "10.0.0.1:9700".to_string(),
            })
        }

        fn perform_chaos_action(
            &self,
            _plugin: &str,
            _action: &ChaosAction,
            context: &TestExecutionContext,
        ) -> Result<RemoteStepOutcome, MinionError> {
            let mut variables = context.variables.clone();
            variables.insert("chaos".to_string(), json!("done"));
            Ok(RemoteStepOutcome {
                result: StepResult::passed(),
                variables,
            })
        }

        fn run_scenario(&self, request: &ScenarioRequest) -> Result<ScenarioResult, MinionError> {
            Ok(ScenarioResult::new(&request.scenario.name, request.iteration))
        }

        fn health(&self) -> Result<MinionHealth, MinionError> {
            Ok(MinionHealth {
                name: "down".to_string(),
                healthy: false,
            })
        }
    }

    fn remote_target() -> StepTarget {
        StepTarget::Remote {
            minion: Arc::new(KartaMinion::new("m1", "10.0.0.1:9700", Arc::new(DownMinion))),
            plugin: "kriya".to_string(),
        }
    }

    #[test]
    fn local_errors_and_panics_become_failed_results() {
        let runner = FnStepRunner::new("kriya")
            .step("explode", |_, _| panic!("bad step"))
            .step("refuse", |step, _| {
                Err(StepExecutionError::Failed {
                    step: step.identifier.clone(),
                    message: "precondition".to_string(),
                })
            });
        let target = StepTarget::Local(Arc::new(runner));
        let mut context = TestExecutionContext::default();

        let panicked = target.run_step(&TestStep::new("explode"), &mut context);
        assert!(!panicked.passed);
        assert!(!panicked.error);
        assert!(panicked.incidents[0].message.contains("explode"));

        let refused = target.run_step(&TestStep::new("refuse"), &mut context);
        assert!(refused.incidents[0].message.contains("precondition"));
    }

    #[test]
    fn transport_failure_is_a_tagged_failed_result() {
        let mut context = TestExecutionContext::default();
        let result = remote_target().run_step(&TestStep::new("ping"), &mut context);
        assert!(!result.passed);
        assert!(result.incidents[0].tags.contains(MINION_INCIDENT_TAG));
    }

    #[test]
    fn remote_outcome_replaces_context_variables() {
        let mut context = TestExecutionContext::default();
        context.variables.insert("before".to_string(), json!(1));
        let result = remote_target().perform_chaos_action(&ChaosAction::new("kill"), &mut context);
        assert!(result.passed);
        assert_eq!(context.variables["chaos"], json!("done"));
        assert_eq!(context.variables["before"], json!(1));
    }
}
