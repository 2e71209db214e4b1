//! End-to-end runs through the assembled runtime.

use karta_core::config::KartaConfig;
use karta_core::results::{StepPhase, StepResult};
use karta_core::types::{
    CatalogTest, IterationOptions, JobWork, RunName, RunTarget, RunTargetKind, TestCatalog,
    TestFeature, TestJob, TestScenario, TestSource, TestStep,
};
use karta_events::listener::RecordingListener;
use karta_minion::client::TcpMinionClient;
use karta_minion::registry::KartaMinion;
use karta_minion::server::MinionServer;
use karta_plugins::builtin::FnStepRunner;
use karta_plugins::plugin::PluginEntry;
use kartad::KartaRuntime;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config() -> KartaConfig {
    KartaConfig {
        default_step_runner_plugin: Some("kriya".to_string()),
        random_seed: Some(11),
        ..KartaConfig::default()
    }
}

/// `ok` passes, `boom` fails, `whoami` reports which node ran it, anything else passes.
fn kriya(node: &'static str) -> PluginEntry {
    FnStepRunner::new("kriya")
        .step("boom", |_, _| Ok(StepResult::failed("boom went the step")))
        .step("whoami", move |_, _| {
            Ok(StepResult::passed().with_result("node", json!(node)))
        })
        .fallback(|_, _| Ok(StepResult::passed()))
        .into_entry()
}

fn source(feature: &TestFeature) -> RunTarget {
    let text = serde_json::to_string(feature).expect("serialize feature");
    RunTarget::new(RunTargetKind::FeatureSource(text))
}

fn steps(ids: &[&str]) -> Vec<TestStep> {
    ids.iter().map(|id| TestStep::new(*id)).collect()
}

#[test]
fn feature_source_runs_end_to_end_and_events_arrive_in_order() {
    let recorder = Arc::new(RecordingListener::new());
    let runtime = KartaRuntime::builder(config())
        .plugin(kriya("local"))
        .listener(recorder.clone())
        .build()
        .expect("runtime");
    let feature = TestFeature {
        scenarios: vec![TestScenario::new("only", steps(&["ok"]))],
        ..TestFeature::new("ordering")
    };

    let report = runtime
        .run(Some(RunName::new("ordered")), &source(&feature))
        .expect("run");
    runtime.shutdown();

    assert!(report.passed);
    assert_eq!(report.run_name, "ordered");
    assert_eq!(
        recorder.kinds(),
        vec![
            "run_start",
            "feature_start",
            "scenario_start",
            "step_start",
            "step_complete",
            "scenario_complete",
            "feature_complete",
            "run_complete",
        ]
    );
    assert!(recorder.started());
    assert!(recorder.closed());
}

#[test]
fn tear_down_runs_after_a_failed_body() {
    let runtime = KartaRuntime::builder(config())
        .plugin(kriya("local"))
        .build()
        .expect("runtime");
    let feature = TestFeature {
        scenarios: vec![TestScenario::new("fails", steps(&["ok", "boom", "never"]))],
        scenario_tear_down_steps: steps(&["cleanup", "boom"]),
        tear_down_steps: steps(&["drop-db"]),
        ..TestFeature::new("teardown")
    };

    let report = runtime.run(None, &source(&feature)).expect("run");

    assert!(!report.passed);
    let feature = &report.features[0];
    let scenario = feature.scenario_results().next().expect("one scenario");
    let body: Vec<_> = scenario
        .steps_in(StepPhase::ScenarioBody)
        .map(|record| record.identifier.as_str())
        .collect();
    assert_eq!(body, vec!["ok", "boom"]);
    assert_eq!(scenario.steps_in(StepPhase::ScenarioTearDown).count(), 2);
    assert_eq!(feature.tear_down.len(), 1);
    assert!(feature.tear_down[0].result.passed);
}

#[test]
fn parallel_iterations_stay_isolated() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let (a, p, c) = (active.clone(), peak.clone(), calls.clone());
    let counter = FnStepRunner::new("kriya")
        .step("count", move |_, context| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            let seen = context.get("n").and_then(|value| value.as_u64()).unwrap_or(0);
            a.fetch_sub(1, Ordering::SeqCst);
            Ok(StepResult::passed().with_result("n", json!(seen + 1)))
        })
        .step("check", |_, context| {
            if context.get("n") == Some(&json!(1)) {
                Ok(StepResult::passed())
            } else {
                Ok(StepResult::failed(format!("leaked state: {:?}", context.get("n"))))
            }
        })
        .into_entry();
    let runtime = KartaRuntime::builder(config())
        .plugin(counter)
        .build()
        .expect("runtime");
    let feature = TestFeature {
        scenarios: vec![TestScenario::new("isolated", steps(&["count", "check"]))],
        ..TestFeature::new("parallel")
    };

    let report = runtime
        .run(None, &source(&feature).with_iterations(50, 10))
        .expect("run");

    assert!(report.passed, "{:?}", report.all_incidents());
    let feature = &report.features[0];
    assert_eq!(feature.iterations.len(), 50);
    let mut indices: Vec<u64> = feature.iterations.iter().map(|it| it.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..50).collect::<Vec<_>>());
    assert_eq!(calls.load(Ordering::SeqCst), 50);
    assert!(peak.load(Ordering::SeqCst) <= 10);
}

fn catalog_test(name: &str, tags: &[&str], scenario_steps: &[&str]) -> CatalogTest {
    CatalogTest {
        name: name.to_string(),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
        source: TestSource::Feature {
            feature: TestFeature {
                scenarios: vec![TestScenario::new("main", steps(scenario_steps))],
                ..TestFeature::new(name)
            },
        },
        step_runner_plugin: None,
        data_source_plugins: Vec::new(),
        thread_group: None,
        iterations: IterationOptions {
            iterations: 2,
            ..IterationOptions::default()
        },
    }
}

#[test]
fn tag_runs_cover_every_matching_catalog_test() {
    let catalog = TestCatalog::new(vec![
        catalog_test("login", &["smoke"], &["ok"]),
        catalog_test("checkout", &["smoke", "payments"], &["ok"]),
        catalog_test("soak", &["slow"], &["boom"]),
    ]);
    let runtime = KartaRuntime::builder(config())
        .plugin(kriya("local"))
        .catalog(catalog)
        .build()
        .expect("runtime");

    let tags: BTreeSet<String> = ["smoke".to_string()].into_iter().collect();
    let report = runtime
        .run(None, &RunTarget::new(RunTargetKind::Tags(tags)))
        .expect("run");

    assert!(report.passed);
    let mut names: Vec<&str> = report.features.iter().map(|f| f.feature.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["checkout", "login"]);
    assert!(report.features.iter().all(|f| f.iterations.len() == 2));

    let reference = runtime
        .run(None, &RunTarget::new(RunTargetKind::TestReference("soak".to_string())))
        .expect("run");
    assert!(!reference.passed);
    assert_eq!(reference.features[0].iterations.len(), 1);
}

#[test]
fn unknown_tags_and_tests_fail_the_run() {
    let runtime = KartaRuntime::builder(config())
        .plugin(kriya("local"))
        .build()
        .expect("runtime");

    let tags: BTreeSet<String> = ["nightly".to_string()].into_iter().collect();
    let report = runtime
        .run(None, &RunTarget::new(RunTargetKind::Tags(tags)))
        .expect("run");
    assert!(!report.passed);
    assert!(report.features.is_empty());

    let report = runtime
        .run(None, &RunTarget::new(RunTargetKind::TestReference("ghost".to_string())))
        .expect("run");
    assert!(!report.passed);
    assert!(report.incidents[0].message.contains("ghost"));
}

#[test]
fn jobs_separate_errors_from_failures() {
    let runtime = KartaRuntime::builder(config())
        .plugin(kriya("local"))
        .build()
        .expect("runtime");

    let failing = TestJob::new(
        "smoke-job",
        JobWork::Steps {
            steps: steps(&["ok", "boom", "never"]),
        },
    );
    let result = runtime.run_job(None, &failing, 0).expect("job");
    assert!(!result.passed);
    assert!(!result.error);
    assert_eq!(result.steps.len(), 2);

    let empty = TestJob::new("empty-job", JobWork::Steps { steps: Vec::new() });
    let result = runtime.run_job(None, &empty, 0).expect("job");
    assert!(!result.passed);
    assert!(result.error);
    assert!(result.steps.is_empty());

    let remote = TestJob {
        node: Some("nowhere".to_string()),
        ..TestJob::new("remote-job", JobWork::Steps { steps: steps(&["ok"]) })
    };
    let result = runtime.run_job(None, &remote, 3).expect("job");
    assert!(result.error);
    assert_eq!(result.iteration, 3);
}

#[test]
fn scenarios_are_delegated_to_a_tcp_minion() {
    let minion_runtime = KartaRuntime::builder(config())
        .name("minion-a")
        .plugin(kriya("minion-a"))
        .build()
        .expect("minion runtime");
    let server = MinionServer::bind("127.0.0.1:0", minion_runtime.clone()).expect("bind");
    let handle = server.spawn().expect("spawn");
    let address = handle.address().to_string();

    let recorder = Arc::new(RecordingListener::new());
    let orchestrator = KartaRuntime::builder(KartaConfig {
        minions_enabled: true,
        ..config()
    })
    .plugin(kriya("orchestrator"))
    .listener(recorder.clone())
    .minion(KartaMinion::new(
        "minion-a",
        address.clone(),
        Arc::new(TcpMinionClient::new(address)),
    ))
    .build()
    .expect("orchestrator");
    let feature = TestFeature {
        scenarios: vec![TestScenario::new("where", steps(&["whoami"]))],
        ..TestFeature::new("delegated")
    };

    let report = orchestrator
        .run(None, &source(&feature).with_iterations(3, 2))
        .expect("run");
    orchestrator.shutdown();
    handle.stop().expect("stop minion");
    minion_runtime.shutdown();

    assert!(report.passed, "{:?}", report.all_incidents());
    let nodes: Vec<_> = report.features[0]
        .scenario_results()
        .flat_map(|scenario| scenario.steps.iter())
        .map(|record| record.result.results.get("node").cloned())
        .collect();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|node| *node == Some(json!("minion-a"))));

    let kinds = recorder.kinds();
    assert_eq!(kinds.iter().filter(|k| **k == "scenario_start").count(), 3);
    assert_eq!(kinds.iter().filter(|k| **k == "scenario_complete").count(), 3);
    assert_eq!(kinds.iter().filter(|k| **k == "step_start").count(), 3);
    assert_eq!(kinds.iter().filter(|k| **k == "step_complete").count(), 3);
}

#[test]
fn unreachable_minion_fails_the_iteration_not_the_process() {
    let orchestrator = KartaRuntime::builder(KartaConfig {
        minions_enabled: true,
        ..config()
    })
    .plugin(kriya("orchestrator"))
    .minion(KartaMinion::new(
        "gone",
        "127.0.0.1:1",
        Arc::new(TcpMinionClient::new("127.0.0.1:1")),
    ))
    .build()
    .expect("orchestrator");
    let feature = TestFeature {
        scenarios: vec![TestScenario::new("where", steps(&["whoami"]))],
        ..TestFeature::new("delegated")
    };

    let report = orchestrator.run(None, &source(&feature)).expect("run");

    assert!(!report.passed);
    let scenario = report.features[0].scenario_results().next().expect("scenario");
    assert!(scenario.error);
    assert!(scenario
        .incidents
        .iter()
        .any(|incident| incident.tags.contains("minion")));
}
