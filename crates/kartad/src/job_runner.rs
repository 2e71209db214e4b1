//! Runs a test job: an ordered step list or a chaos tree draw.

use karta_core::chaos::{ChaosAction, ChaosActionTree};
use karta_core::events::{Event, EventKind};
use karta_core::results::{StepPhase, TestIncident, TestJobResult};
use karta_core::types::{JobWork, TestData, TestExecutionContext, TestJob, TestStep};
use karta_core::validation::Validate;
use karta_minion::registry::MinionRegistry;
use karta_plugins::capability::TestDataSource;
use karta_plugins::data_merge::{merge_test_data, overlay};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::sync::Arc;

use crate::lifecycle::emit;
use crate::scenario_runner::ScenarioRunner;
use crate::step_target::StepTarget;

#[derive(Clone)]
pub struct JobRunner {
    scenarios: ScenarioRunner,
    minions: Arc<MinionRegistry>,
    rng: Arc<Mutex<StdRng>>,
}

/// A job that passed preparation, with where its work executes.
struct PreparedJob<'a> {
    run_name: &'a str,
    job: &'a TestJob,
    iteration: u64,
    target: StepTarget,
    sources: Vec<Arc<dyn TestDataSource>>,
}

impl PreparedJob<'_> {
    fn event(&self, kind: EventKind) -> Event {
        Event::new(self.run_name, kind).in_job(self.job.name.clone(), self.iteration)
    }

    /// Job data overlaid by the step's own data, merged with the data sources.
    fn data(&self, context: &TestExecutionContext, identifier: &str, step: Option<&TestStep>) -> TestData {
        let (static_data, data_set) = match step {
            Some(step) => (
                overlay(&self.job.test_data, &step.test_data),
                overlay(&self.job.test_data_set, &step.test_data_set),
            ),
            None => (self.job.test_data.clone(), self.job.test_data_set.clone()),
        };
        merge_test_data(&self.sources, &static_data, &data_set, &context.pointer(identifier))
    }
}

impl JobRunner {
    pub fn new(scenarios: ScenarioRunner, minions: Arc<MinionRegistry>, rng: Arc<Mutex<StdRng>>) -> Self {
        Self {
            scenarios,
            minions,
            rng,
        }
    }

    pub fn run(&self, run_name: &str, job: &TestJob, iteration: u64) -> TestJobResult {
        let events = self.scenarios.events();
        emit(
            events,
            Event::new(run_name, EventKind::JobStart).in_job(job.name.clone(), iteration),
        );

        let mut result = TestJobResult::new(&job.name, iteration);
        match self.prepare(run_name, job, iteration) {
            Ok(prepared) => {
                let mut context = TestExecutionContext::new(run_name, job.name.clone(), None, iteration);
                match &job.work {
                    JobWork::Steps { steps } => self.run_steps(&prepared, steps, &mut context, &mut result),
                    JobWork::Chaos { tree } => {
                        let drawn = ChaosActionTree::from_spec(tree).next_chaos_actions(&mut *self.rng.lock());
                        match drawn {
                            Ok(actions) if actions.is_empty() => {
                                result.add_incident(TestIncident::info("chaos tree selected no action"));
                            }
                            Ok(actions) => {
                                for action in &actions {
                                    self.run_action(&prepared, action, &mut context, &mut result);
                                }
                            }
                            Err(err) => result.mark_error(err.to_string()),
                        }
                    }
                    JobWork::Unsupported => result.mark_error("unsupported job kind"),
                }
            }
            Err(message) => {
                tracing::warn!(run = %run_name, job = %job.name, error = %message, "job not started");
                result.mark_error(message);
            }
        }
        result.end_time = chrono::Utc::now();

        emit(
            events,
            Event::new(
                run_name,
                EventKind::JobComplete {
                    passed: result.passed,
                    error: result.error,
                },
            )
            .in_job(job.name.clone(), iteration),
        );
        tracing::info!(
            run = %run_name,
            job = %job.name,
            iteration,
            passed = result.passed,
            error = result.error,
            "job finished"
        );
        result
    }

    /// Rejects unrunnable jobs and resolves where their work executes.
    fn prepare<'a>(
        &self,
        run_name: &'a str,
        job: &'a TestJob,
        iteration: u64,
    ) -> Result<PreparedJob<'a>, String> {
        if let Some(issue) = job.validate().into_iter().find(|issue| issue.is_error()) {
            return Err(issue.message);
        }

        let target = match &job.node {
            Some(node) => {
                let minion = self.minions.require(node).map_err(|err| err.to_string())?;
                let plugin = job
                    .step_runner_plugin
                    .as_deref()
                    .or(self.scenarios.default_step_runner())
                    .ok_or_else(|| "plugin not found: no step runner configured".to_string())?;
                StepTarget::Remote {
                    minion,
                    plugin: plugin.to_string(),
                }
            }
            None => {
                let plugins = self.scenarios.resolve(job.step_runner_plugin.as_deref(), &[])?;
                StepTarget::Local(plugins.step_runner)
            }
        };
        let sources = self.scenarios.resolve_data_sources(&[])?;
        Ok(PreparedJob {
            run_name,
            job,
            iteration,
            target,
            sources,
        })
    }

    fn run_steps(
        &self,
        prepared: &PreparedJob<'_>,
        steps: &[TestStep],
        context: &mut TestExecutionContext,
        result: &mut TestJobResult,
    ) {
        let events = self.scenarios.events();
        for step in steps {
            let data = prepared.data(context, &step.identifier, Some(step));
            context.enter_step(step.identifier.clone(), data);
            emit(
                events,
                prepared.event(EventKind::StepStart {
                    phase: StepPhase::Job,
                    step: step.identifier.clone(),
                }),
            );
            let step_result = prepared.target.run_step(step, context);
            context
                .variables
                .extend(step_result.results.iter().map(|(k, v)| (k.clone(), v.clone())));
            emit(
                events,
                prepared.event(EventKind::StepComplete {
                    phase: StepPhase::Job,
                    step: step.identifier.clone(),
                    result: step_result.clone(),
                }),
            );
            let succeeded = step_result.is_successful();
            result.record_step(StepPhase::Job, &step.identifier, step_result);
            if !succeeded {
                break;
            }
        }
    }

    fn run_action(
        &self,
        prepared: &PreparedJob<'_>,
        action: &ChaosAction,
        context: &mut TestExecutionContext,
        result: &mut TestJobResult,
    ) {
        let events = self.scenarios.events();
        let data = prepared.data(context, &action.name, None);
        context.enter_step(action.name.clone(), data);
        emit(
            events,
            prepared.event(EventKind::ChaosActionStart {
                action: action.clone(),
            }),
        );
        let action_result = prepared.target.perform_chaos_action(action, context);
        emit(
            events,
            prepared.event(EventKind::ChaosActionComplete {
                action: action.clone(),
                result: action_result.clone(),
            }),
        );
        result.record_step(StepPhase::ChaosAction, &action.name, action_result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karta_core::chaos::{ChaosTreeSpec, SubTreeSelection};
    use karta_core::results::StepResult;
    use karta_core::types::TestStep;
    use karta_events::bus::EventBus;
    use karta_events::listener::RecordingListener;
    use karta_plugins::builtin::FnStepRunner;
    use karta_plugins::registry::PluginRegistry;
    use rand::SeedableRng;
    use serde_json::json;
    use std::collections::HashMap;

    fn job_runner(step_runner: FnStepRunner) -> (JobRunner, Arc<RecordingListener>) {
        let registry = Arc::new(PluginRegistry::new());
        registry.register(step_runner.into_entry()).expect("register");
        let events = Arc::new(EventBus::new());
        registry.enable(&[]).expect("enable");
        registry
            .initialize_enabled(&HashMap::new(), &events)
            .expect("initialize");
        let recorder = Arc::new(RecordingListener::new());
        events.add_listener(recorder.clone());
        events.start();
        let scenarios = ScenarioRunner::new(registry, events, Some("kriya".to_string()), Vec::new());
        (
            JobRunner::new(
                scenarios,
                Arc::new(MinionRegistry::new()),
                Arc::new(Mutex::new(StdRng::seed_from_u64(9))),
            ),
            recorder,
        )
    }

    fn chaos_runner() -> FnStepRunner {
        FnStepRunner::new("kriya")
            .chaos("kill pod", |action, _| {
                Ok(StepResult::passed().with_result("killed", json!(action.subjects.clone())))
            })
            .chaos("partition", |_, _| Ok(StepResult::passed()))
            .fallback(|_, _| Ok(StepResult::passed()))
    }

    #[test]
    fn steps_stop_at_first_failure_and_data_merges_job_then_step() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = seen.clone();
        let runner_plugin = FnStepRunner::new("kriya")
            .step("warm", move |_, context| {
                observed
                    .lock()
                    .push((context.get("region").cloned(), context.get("size").cloned()));
                Ok(StepResult::passed())
            })
            .step("load", |_, _| Ok(StepResult::failed("p99 over budget")));
        let (runner, recorder) = job_runner(runner_plugin);

        let mut job = TestJob::new(
            "soak",
            JobWork::Steps {
                steps: vec![
                    TestStep::new("warm").with_data("size", json!("large")),
                    TestStep::new("load"),
                    TestStep::new("cool"),
                ],
            },
        );
        job.test_data.insert("region".to_string(), json!("eu"));
        job.test_data.insert("size".to_string(), json!("small"));

        let result = runner.run("run", &job, 0);
        assert!(!result.passed);
        assert!(!result.error);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(*seen.lock(), vec![(Some(json!("eu")), Some(json!("large")))]);
        assert_eq!(
            recorder.kinds(),
            vec!["job_start", "step_start", "step_complete", "step_start", "step_complete", "job_complete"]
        );
        assert_eq!(recorder.events()[0].job.as_deref(), Some("soak"));
    }

    #[test]
    fn unrunnable_jobs_are_errors_without_execution() {
        let (runner, recorder) = job_runner(chaos_runner());

        for work in [
            JobWork::Unsupported,
            JobWork::Steps { steps: Vec::new() },
            JobWork::Chaos {
                tree: ChaosTreeSpec::branch(
                    SubTreeSelection::Exclusive,
                    1.0,
                    vec![ChaosTreeSpec::leaf(ChaosAction::new("kill pod"), 0.0)],
                ),
            },
        ] {
            let result = runner.run("run", &TestJob::new("bad", work), 0);
            assert!(result.error);
            assert!(!result.passed);
            assert!(result.steps.is_empty());
        }
        assert!(!recorder.kinds().contains(&"step_start"));
    }

    #[test]
    fn unknown_node_is_an_error() {
        let (runner, _) = job_runner(chaos_runner());
        let mut job = TestJob::new("remote", JobWork::Steps { steps: vec![TestStep::new("a")] });
        job.node = Some("ghost".to_string());
        let result = runner.run("run", &job, 0);
        assert!(result.error);
        assert!(result.incidents[0].message.contains("ghost"));
    }

    #[test]
    fn chaos_job_runs_every_drawn_action_with_events() {
        let (runner, recorder) = job_runner(chaos_runner());
        let job = TestJob::new(
            "chaos",
            JobWork::Chaos {
                tree: ChaosTreeSpec::branch(
                    SubTreeSelection::Inclusive,
                    1.0,
                    vec![
                        ChaosTreeSpec::leaf(ChaosAction::new("kill pod").with_subjects(["api"]), 1.0),
                        ChaosTreeSpec::leaf(ChaosAction::new("partition"), 2.0),
                    ],
                ),
            },
        );

        let result = runner.run("run", &job, 2);
        assert!(result.passed);
        let ran: Vec<&str> = result.steps.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(ran, vec!["kill pod", "partition"]);
        assert_eq!(result.steps[0].result.results["killed"], json!(["api"]));
        assert_eq!(
            recorder.kinds(),
            vec![
                "job_start",
                "chaos_action_start",
                "chaos_action_complete",
                "chaos_action_start",
                "chaos_action_complete",
                "job_complete"
            ]
        );
    }

    #[test]
    fn unsupported_chaos_action_fails_the_job() {
        let (runner, _) = job_runner(FnStepRunner::new("kriya"));
        let job = TestJob::new(
            "chaos",
            JobWork::Chaos {
                tree: ChaosTreeSpec::leaf(ChaosAction::new("reboot"), 1.0),
            },
        );
        let result = runner.run("run", &job, 0);
        assert!(!result.passed);
        assert!(!result.error);
        assert!(result.steps[0].result.incidents[0].message.contains("not supported"));
    }
}
