//! Runs a feature: setup once, iterations fanned out to a pool, teardown once.

use karta_core::events::EventKind;
use karta_core::results::{FeatureResult, IterationResult, StepPhase, StepRecord, TestIncident};
use karta_core::types::{
    IterationOptions, TestData, TestDataSet, TestExecutionContext, TestFeature, TestStep,
};
use karta_minion::service::ScenarioRequest;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::sync::Arc;

use crate::executor::ScenarioExecutor;
use crate::lifecycle::{context_event, emit};
use crate::pool::{PoolError, TaskHandle, ThreadPoolGroupManager};
use crate::scenario_runner::{DataScope, ResolvedPlugins, ScenarioRunner};
use crate::selection::select_scenarios;

/// One feature to run, with the plugins and iteration options that apply to it.
#[derive(Debug, Clone)]
pub struct FeatureRequest {
    pub run_name: String,
    pub feature: TestFeature,
    pub options: IterationOptions,
    pub step_runner_plugin: Option<String>,
    pub data_source_plugins: Vec<String>,
}

impl FeatureRequest {
    pub fn new(run_name: impl Into<String>, feature: TestFeature, options: IterationOptions) -> Self {
        Self {
            run_name: run_name.into(),
            feature,
            options,
            step_runner_plugin: None,
            data_source_plugins: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct FeatureRunner {
    scenarios: ScenarioRunner,
    executor: Arc<dyn ScenarioExecutor>,
    pools: Arc<ThreadPoolGroupManager>,
    rng: Arc<Mutex<StdRng>>,
}

impl FeatureRunner {
    pub fn new(
        scenarios: ScenarioRunner,
        executor: Arc<dyn ScenarioExecutor>,
        pools: Arc<ThreadPoolGroupManager>,
        rng: Arc<Mutex<StdRng>>,
    ) -> Self {
        Self {
            scenarios,
            executor,
            pools,
            rng,
        }
    }

    pub fn run(&self, request: &FeatureRequest) -> FeatureResult {
        let feature = &request.feature;
        let context = TestExecutionContext::new(
            request.run_name.clone(),
            feature.name.clone(),
            None,
            0,
        );
        let events = self.scenarios.events();
        emit(events, context_event(&context, EventKind::FeatureStart));
        tracing::info!(
            run = %request.run_name,
            feature = %feature.name,
            iterations = request.options.iterations,
            parallelism = request.options.parallelism,
            "feature started"
        );

        let result = self.execute(request, context.clone());

        emit(
            events,
            context_event(
                &context,
                EventKind::FeatureComplete {
                    passed: result.passed,
                },
            ),
        );
        tracing::info!(
            run = %request.run_name,
            feature = %feature.name,
            passed = result.passed,
            "feature finished"
        );
        result
    }

    fn execute(&self, request: &FeatureRequest, mut context: TestExecutionContext) -> FeatureResult {
        let feature = &request.feature;
        let mut result = FeatureResult::new(&feature.name);

        let plugins = match self.scenarios.resolve(
            request.step_runner_plugin.as_deref(),
            &request.data_source_plugins,
        ) {
            Ok(plugins) => plugins,
            Err(message) => {
                result.add_incident(TestIncident::failure(message));
                result.end_time = chrono::Utc::now();
                return result;
            }
        };

        let (setup, setup_passed) = self.run_feature_steps(
            StepPhase::FeatureSetup,
            &feature.setup_steps,
            &plugins,
            &mut context,
            true,
        );
        result.setup = setup;
        if !setup_passed {
            result.add_incident(TestIncident::failure(format!(
                "feature setup failed for {}",
                feature.name
            )));
        } else {
            for iteration in self.run_iterations(request, &context.variables) {
                if !iteration.passed {
                    result.passed = false;
                }
                result.iterations.push(iteration);
            }
        }

        let (tear_down, _) = self.run_feature_steps(
            StepPhase::FeatureTearDown,
            &feature.tear_down_steps,
            &plugins,
            &mut context,
            false,
        );
        result.tear_down = tear_down;
        result.end_time = chrono::Utc::now();
        result
    }

    /// Runs feature-level steps; with `stop_on_failure` the first unsuccessful step ends the phase.
    fn run_feature_steps(
        &self,
        phase: StepPhase,
        steps: &[TestStep],
        plugins: &ResolvedPlugins,
        context: &mut TestExecutionContext,
        stop_on_failure: bool,
    ) -> (Vec<StepRecord>, bool) {
        let empty_data = TestData::new();
        let empty_set = TestDataSet::new();
        let scope = DataScope {
            test_data: &empty_data,
            test_data_set: &empty_set,
        };
        let mut records = Vec::with_capacity(steps.len());
        let mut passed = true;
        for step in steps {
            let step_result = self.scenarios.run_step(phase, step, plugins, scope, context);
            let succeeded = step_result.is_successful();
            records.push(StepRecord {
                phase,
                identifier: step.identifier.clone(),
                result: step_result,
            });
            if !succeeded {
                passed = false;
                if stop_on_failure {
                    break;
                }
            }
        }
        (records, passed)
    }

    fn run_iterations(&self, request: &FeatureRequest, variables: &TestData) -> Vec<IterationResult> {
        let batches = self.plan(request, variables);
        let group = request.feature.name.as_str();
        // sized by this request and stopped once its iterations are joined
        let pool = match self
            .pools
            .scoped(&format!("{group}/iterations"), request.options.parallelism)
        {
            Ok(pool) => pool,
            Err(err) => {
                return batches
                    .into_iter()
                    .map(|(index, _)| incomplete_iteration(group, index, &err))
                    .collect();
            }
        };

        let handles: Vec<(u64, Result<TaskHandle<IterationResult>, PoolError>)> = batches
            .into_iter()
            .map(|(index, requests)| {
                let executor = self.executor.clone();
                let handle = pool.submit(move || run_iteration(executor.as_ref(), index, &requests));
                (index, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(index, handle)| match handle.and_then(TaskHandle::join) {
                Ok(iteration) => iteration,
                Err(err) => incomplete_iteration(group, index, &err),
            })
            .collect()
    }

    /// Draws every iteration's scenarios up front so one random source serves the whole feature.
    fn plan(&self, request: &FeatureRequest, variables: &TestData) -> Vec<(u64, Vec<ScenarioRequest>)> {
        let feature = &request.feature;
        let mut rng = self.rng.lock();
        (0..request.options.iterations)
            .map(|index| {
                let requests = select_scenarios(&feature.scenarios, &request.options, index, &mut *rng)
                    .into_iter()
                    .map(|scenario| ScenarioRequest {
                        run_name: request.run_name.clone(),
                        feature_name: feature.name.clone(),
                        iteration: index,
                        scenario_setup_steps: feature.scenario_setup_steps.clone(),
                        scenario: scenario.clone(),
                        scenario_tear_down_steps: feature.scenario_tear_down_steps.clone(),
                        step_runner_plugin: request.step_runner_plugin.clone(),
                        data_source_plugins: request.data_source_plugins.clone(),
                        variables: variables.clone(),
                    })
                    .collect();
                (index, requests)
            })
            .collect()
    }
}

fn incomplete_iteration(feature: &str, index: u64, err: &PoolError) -> IterationResult {
    tracing::warn!(feature, iteration = index, error = %err, "iteration failed to complete");
    let mut iteration = IterationResult::new(index);
    iteration.add_incident(TestIncident::failure(format!(
        "iteration {index} did not complete: {err}"
    )));
    iteration
}

fn run_iteration(executor: &dyn ScenarioExecutor, index: u64, requests: &[ScenarioRequest]) -> IterationResult {
    let mut iteration = IterationResult::new(index);
    for request in requests {
        iteration.push(executor.execute(request));
    }
    iteration
}
