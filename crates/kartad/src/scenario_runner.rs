//! Runs one scenario: setup, body, then teardown.
//!
//! A failed setup or body step skips the remaining setup and body steps.
//! Teardown always runs and never turns a passing scenario into a failure.

use karta_core::events::EventKind;
use karta_core::results::{ScenarioResult, StepPhase, StepResult};
use karta_core::types::{TestData, TestDataSet, TestExecutionContext, TestStep};
use karta_events::bus::EventBus;
use karta_minion::service::ScenarioRequest;
use karta_plugins::capability::{StepRunner, TestDataSource};
use karta_plugins::data_merge::{merge_test_data, overlay};
use karta_plugins::registry::PluginRegistry;
use std::sync::Arc;

use crate::lifecycle::{context_event, emit};
use crate::step_target::StepTarget;

/// Plugins resolved once for a scenario or feature.
#[derive(Clone)]
pub struct ResolvedPlugins {
    pub step_runner: Arc<dyn StepRunner>,
    pub data_sources: Vec<Arc<dyn TestDataSource>>,
}

#[derive(Clone)]
pub struct ScenarioRunner {
    registry: Arc<PluginRegistry>,
    events: Arc<EventBus>,
    default_step_runner: Option<String>,
    default_data_sources: Vec<String>,
}

impl ScenarioRunner {
    pub fn new(
        registry: Arc<PluginRegistry>,
        events: Arc<EventBus>,
        default_step_runner: Option<String>,
        default_data_sources: Vec<String>,
    ) -> Self {
        Self {
            registry,
            events,
            default_step_runner,
            default_data_sources,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn default_step_runner(&self) -> Option<&str> {
        self.default_step_runner.as_deref()
    }

    /// Resolves the step runner and data sources, falling back to the defaults.
    pub fn resolve(
        &self,
        step_runner: Option<&str>,
        data_sources: &[String],
    ) -> Result<ResolvedPlugins, String> {
        let name = step_runner
            .or(self.default_step_runner.as_deref())
            .ok_or_else(|| "plugin not found: no step runner configured".to_string())?;
        let step_runner = self
            .registry
            .resolve_step_runner(name)
            .map_err(|err| err.to_string())?;

        Ok(ResolvedPlugins {
            step_runner,
            data_sources: self.resolve_data_sources(data_sources)?,
        })
    }

    /// Resolves `names`, or the default data sources when `names` is empty.
    pub fn resolve_data_sources(&self, names: &[String]) -> Result<Vec<Arc<dyn TestDataSource>>, String> {
        let names = if names.is_empty() {
            &self.default_data_sources
        } else {
            names
        };
        self.registry
            .resolve_data_sources(names)
            .map_err(|err| err.to_string())
    }

    /// Runs the scenario and raises its start and complete events.
    pub fn run(&self, request: &ScenarioRequest) -> ScenarioResult {
        let context = TestExecutionContext::new(
            request.run_name.clone(),
            request.feature_name.clone(),
            Some(request.scenario.name.clone()),
            request.iteration,
        );
        let addressed = context.clone();
        emit(&self.events, context_event(&addressed, EventKind::ScenarioStart));
        let result = self.execute(request, context);
        emit(
            &self.events,
            context_event(
                &addressed,
                EventKind::ScenarioComplete {
                    passed: result.passed,
                    error: result.error,
                },
            ),
        );
        tracing::debug!(
            run = %request.run_name,
            feature = %request.feature_name,
            scenario = %request.scenario.name,
            iteration = request.iteration,
            passed = result.passed,
            "scenario finished"
        );
        result
    }

    fn execute(&self, request: &ScenarioRequest, mut context: TestExecutionContext) -> ScenarioResult {
        let scenario = &request.scenario;
        let plugins = match self.resolve(
            request.step_runner_plugin.as_deref(),
            &request.data_source_plugins,
        ) {
            Ok(plugins) => plugins,
            Err(message) => {
                tracing::warn!(scenario = %scenario.name, error = %message, "scenario not started");
                return ScenarioResult::error(&scenario.name, request.iteration, message);
            }
        };

        context.variables = request.variables.clone();
        let mut result = ScenarioResult::new(&scenario.name, request.iteration);
        let scope = DataScope {
            test_data: &scenario.test_data,
            test_data_set: &scenario.test_data_set,
        };

        let phases = [
            (StepPhase::ScenarioSetup, &request.scenario_setup_steps),
            (StepPhase::ScenarioBody, &scenario.steps),
        ];
        'phases: for (phase, steps) in phases {
            for step in steps {
                let step_result = self.run_step(phase, step, &plugins, scope, &mut context);
                let succeeded = step_result.is_successful();
                result.record_step(phase, &step.identifier, step_result);
                if !succeeded {
                    break 'phases;
                }
            }
        }

        for step in &request.scenario_tear_down_steps {
            let step_result =
                self.run_step(StepPhase::ScenarioTearDown, step, &plugins, scope, &mut context);
            result.record_tear_down(&step.identifier, step_result);
        }

        result.end_time = chrono::Utc::now();
        result
    }

    /// Merges data, runs one step and folds its published results into the variables.
    pub fn run_step(
        &self,
        phase: StepPhase,
        step: &TestStep,
        plugins: &ResolvedPlugins,
        scope: DataScope<'_>,
        context: &mut TestExecutionContext,
    ) -> StepResult {
        let data = merge_test_data(
            &plugins.data_sources,
            &overlay(scope.test_data, &step.test_data),
            &overlay(scope.test_data_set, &step.test_data_set),
            &context.pointer(&step.identifier),
        );
        context.enter_step(step.identifier.clone(), data);
        emit(
            &self.events,
            context_event(
                context,
                EventKind::StepStart {
                    phase,
                    step: step.identifier.clone(),
                },
            ),
        );

        let result = match &step.step_runner_plugin {
            Some(name) => match self.registry.resolve_step_runner(name) {
                Ok(runner) => StepTarget::Local(runner).run_step(step, context),
                Err(err) => StepResult::error(err.to_string()),
            },
            None => StepTarget::Local(plugins.step_runner.clone()).run_step(step, context),
        };
        context
            .variables
            .extend(result.results.iter().map(|(k, v)| (k.clone(), v.clone())));

        emit(
            &self.events,
            context_event(
                context,
                EventKind::StepComplete {
                    phase,
                    step: step.identifier.clone(),
                    result: result.clone(),
                },
            ),
        );
        result
    }
}

/// Static data and data set of the unit that owns a step.
#[derive(Clone, Copy)]
pub struct DataScope<'a> {
    pub test_data: &'a TestData,
    pub test_data_set: &'a TestDataSet,
}

#[cfg(test)]
mod tests {
    use super::*;
    use karta_core::types::TestScenario;
    use karta_events::listener::RecordingListener;
    use karta_plugins::builtin::{FnStepRunner, StaticDataSource};
    use karta_plugins::plugin::PluginEntry;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    fn runner_with(step_runner: FnStepRunner) -> (ScenarioRunner, Arc<RecordingListener>) {
        let registry = Arc::new(PluginRegistry::new());
        registry.register(step_runner.into_entry()).expect("register runner");
        let mut data = TestData::new();
        data.insert("env".to_string(), json!("staging"));
        registry
            .register(PluginEntry::data_source(Arc::new(StaticDataSource::with_data(data))))
            .expect("register source");
        let events = Arc::new(EventBus::new());
        registry.enable(&[]).expect("enable");
        registry
            .initialize_enabled(&HashMap::new(), &events)
            .expect("initialize");
        let recorder = Arc::new(RecordingListener::new());
        events.add_listener(recorder.clone());
        events.start();
        (
            ScenarioRunner::new(
                registry,
                events,
                Some("kriya".to_string()),
                vec!["static".to_string()],
            ),
            recorder,
        )
    }

    fn request(setup: &[&str], body: &[&str], tear_down: &[&str]) -> ScenarioRequest {
        let steps = |ids: &[&str]| ids.iter().map(|id| TestStep::new(*id)).collect::<Vec<_>>();
        ScenarioRequest {
            run_name: "run".to_string(),
            feature_name: "feature".to_string(),
            iteration: 0,
            scenario_setup_steps: steps(setup),
            scenario: TestScenario::new("scenario", steps(body)),
            scenario_tear_down_steps: steps(tear_down),
            step_runner_plugin: None,
            data_source_plugins: Vec::new(),
            variables: TestData::new(),
        }
    }

    fn passing_runner(log: Arc<Mutex<Vec<String>>>) -> FnStepRunner {
        FnStepRunner::new("kriya")
            .step("fail", |_, _| Ok(StepResult::failed("assertion failed")))
            .fallback(move |step, _| {
                log.lock().push(step.identifier.clone());
                Ok(StepResult::passed())
            })
    }

    #[test]
    fn teardown_runs_after_body_failure_and_skipped_steps_are_not_recorded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (runner, _) = runner_with(passing_runner(log.clone()));

        let result = runner.run(&request(
            &["setup"],
            &["body-1", "fail", "body-3"],
            &["td-1", "td-2"],
        ));

        assert!(!result.passed);
        assert!(!result.error);
        let recorded: Vec<&str> = result.steps.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(recorded, vec!["setup", "body-1", "fail", "td-1", "td-2"]);
        assert_eq!(*log.lock(), vec!["setup", "body-1", "td-1", "td-2"]);
        assert_eq!(result.steps_in(StepPhase::ScenarioTearDown).count(), 2);
    }

    #[test]
    fn setup_failure_skips_body_but_not_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (runner, _) = runner_with(passing_runner(log.clone()));

        let result = runner.run(&request(&["fail"], &["body-1"], &["td-1"]));
        assert!(!result.passed);
        assert_eq!(*log.lock(), vec!["td-1"]);
    }

    #[test]
    fn teardown_failure_does_not_fail_a_passing_scenario() {
        let (runner, _) = runner_with(passing_runner(Arc::new(Mutex::new(Vec::new()))));
        let result = runner.run(&request(&[], &["body-1"], &["fail"]));
        assert!(result.passed);
        assert!(!result.steps[1].result.passed);
    }

    #[test]
    fn missing_step_runner_is_an_error_result_without_steps() {
        let (runner, recorder) = runner_with(passing_runner(Arc::new(Mutex::new(Vec::new()))));
        let mut request = request(&["setup"], &["body"], &["td"]);
        request.step_runner_plugin = Some("ghost".to_string());

        let result = runner.run(&request);
        assert!(result.error);
        assert!(!result.passed);
        assert!(result.steps.is_empty());
        assert!(result.incidents[0].message.contains("plugin not found"));
        assert_eq!(recorder.kinds(), vec!["scenario_start", "scenario_complete"]);
    }

    #[test]
    fn step_override_that_does_not_resolve_fails_that_step() {
        let (runner, _) = runner_with(passing_runner(Arc::new(Mutex::new(Vec::new()))));
        let mut request = request(&[], &[], &["td"]);
        request.scenario.steps = vec![TestStep::new("remote").with_plugin("ghost"), TestStep::new("next")];

        let result = runner.run(&request);
        assert!(result.error);
        let recorded: Vec<&str> = result.steps.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(recorded, vec!["remote", "td"]);
    }

    #[test]
    fn merged_data_and_published_results_reach_later_steps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = seen.clone();
        let step_runner = FnStepRunner::new("kriya")
            .step("login", |_, _| Ok(StepResult::passed().with_result("token", json!("abc"))))
            .step("use token", move |_, context| {
                observed.lock().push((
                    context.get("token").cloned(),
                    context.get("env").cloned(),
                    context.get("user").cloned(),
                ));
                Ok(StepResult::passed())
            });
        let (runner, _) = runner_with(step_runner);
        let mut request = request(&[], &["login", "use token"], &[]);
        request
            .scenario
            .test_data_set
            .insert("user".to_string(), vec![json!("ann"), json!("bob")]);
        request.iteration = 3;

        assert!(runner.run(&request).passed);
        assert_eq!(
            *seen.lock(),
            vec![(Some(json!("abc")), Some(json!("staging")), Some(json!("bob")))]
        );
    }

    #[test]
    fn events_wrap_each_step_in_order() {
        let (runner, recorder) = runner_with(passing_runner(Arc::new(Mutex::new(Vec::new()))));
        runner.run(&request(&["setup"], &["body"], &["td"]));

        assert_eq!(
            recorder.kinds(),
            vec![
                "scenario_start",
                "step_start",
                "step_complete",
                "step_start",
                "step_complete",
                "step_start",
                "step_complete",
                "scenario_complete"
            ]
        );
        let events = recorder.events();
        assert!(matches!(
            &events[1].kind,
            EventKind::StepStart { phase: StepPhase::ScenarioSetup, step } if step == "setup"
        ));
        assert_eq!(events[1].scenario.as_deref(), Some("scenario"));
    }
}
