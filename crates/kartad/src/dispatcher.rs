//! Turns a run target into feature runs and collects the run report.

use karta_core::config::{KartaConfig, DEFAULT_THREAD_GROUP};
use karta_core::events::{Event, EventKind};
use karta_core::results::{FeatureResult, RunReport, TestIncident};
use karta_core::types::{
    CatalogTest, IterationOptions, RunName, RunTarget, RunTargetKind, TestCatalog, TestFeature,
    TestSource,
};
use karta_events::bus::EventBus;
use karta_plugins::builtin::JSON_FEATURE_PARSER;
use karta_plugins::error::{ParseError, PluginError};
use karta_plugins::registry::PluginRegistry;
use std::path::PathBuf;
use std::sync::Arc;

use crate::feature_runner::{FeatureRequest, FeatureRunner};
use crate::lifecycle::emit;
use crate::pool::{PoolError, ThreadPoolGroupManager};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to read feature file {path}: {source}")]
    ReadFeature {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("parser {parser} rejected feature source: {source}")]
    Parse {
        parser: String,
        #[source]
        source: ParseError,
    },
    #[error("test {name} is not in the catalog")]
    UnknownTest { name: String },
    #[error("no catalog test carries any of the tags {tags:?}")]
    NoTestsForTags { tags: Vec<String> },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Clone)]
pub struct Dispatcher {
    features: FeatureRunner,
    registry: Arc<PluginRegistry>,
    events: Arc<EventBus>,
    pools: Arc<ThreadPoolGroupManager>,
    catalog: Arc<TestCatalog>,
    config: Arc<KartaConfig>,
}

impl Dispatcher {
    pub fn new(
        features: FeatureRunner,
        registry: Arc<PluginRegistry>,
        events: Arc<EventBus>,
        pools: Arc<ThreadPoolGroupManager>,
        catalog: Arc<TestCatalog>,
        config: Arc<KartaConfig>,
    ) -> Self {
        Self {
            features,
            registry,
            events,
            pools,
            catalog,
            config,
        }
    }

    /// Runs `target` to completion. Failures of any kind end up in the report.
    pub fn dispatch(&self, run_name: &RunName, target: &RunTarget) -> RunReport {
        let run = run_name.as_ref();
        emit(&self.events, Event::new(run, EventKind::RunStart));
        tracing::info!(run = %run, what = ?target.what, "run started");

        let mut report = RunReport::new(run);
        if let Err(err) = self.dispatch_target(run, target, &mut report) {
            self.record_incident(&mut report, TestIncident::failure(err.to_string()));
        }
        report.end_time = chrono::Utc::now();

        emit(
            &self.events,
            Event::new(
                run,
                EventKind::RunComplete {
                    passed: report.passed,
                },
            ),
        );
        tracing::info!(
            run = %run,
            passed = report.passed,
            features = report.features.len(),
            incidents = report.all_incidents().len(),
            "run finished"
        );
        report
    }

    fn dispatch_target(
        &self,
        run: &str,
        target: &RunTarget,
        report: &mut RunReport,
    ) -> Result<(), DispatchError> {
        let options = target.iteration_options();
        match &target.what {
            RunTargetKind::FeatureFile(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| DispatchError::ReadFeature {
                    path: path.clone(),
                    source,
                })?;
                let feature = self.parse(None, &text)?;
                report.push_feature(self.features.run(&FeatureRequest::new(run, feature, options)));
            }
            RunTargetKind::FeatureSource(text) => {
                let feature = self.parse(None, text)?;
                report.push_feature(self.features.run(&FeatureRequest::new(run, feature, options)));
            }
            RunTargetKind::TestReference(name) => {
                let test = self
                    .catalog
                    .find(name)
                    .ok_or_else(|| DispatchError::UnknownTest { name: name.clone() })?;
                let request = self.catalog_request(run, test, options)?;
                report.push_feature(self.features.run(&request));
            }
            RunTargetKind::Tags(tags) => {
                let tests = self.catalog.filter_by_tags(tags);
                if tests.is_empty() {
                    return Err(DispatchError::NoTestsForTags {
                        tags: tags.iter().cloned().collect(),
                    });
                }
                self.dispatch_catalog_tests(run, &tests, report);
            }
        }
        Ok(())
    }

    /// Submits every test to its thread group and waits for all of them.
    fn dispatch_catalog_tests(&self, run: &str, tests: &[&CatalogTest], report: &mut RunReport) {
        let mut pending = Vec::with_capacity(tests.len());
        for test in tests {
            let submitted = self.catalog_request(run, test, test.iterations).and_then(|request| {
                let group = test.thread_group.as_deref().unwrap_or(DEFAULT_THREAD_GROUP);
                let features = self.features.clone();
                tracing::debug!(run = %run, test = %test.name, group = %group, "test submitted");
                self.pools
                    .submit(group, self.config.thread_group_size(group), move || {
                        features.run(&request)
                    })
                    .map_err(DispatchError::from)
            });
            pending.push((test.name.clone(), submitted));
        }

        for (name, submitted) in pending {
            match submitted.and_then(|handle| handle.join().map_err(DispatchError::from)) {
                Ok(feature) => report.push_feature(feature),
                Err(err) => {
                    let incident = TestIncident::failure(format!("test {name} did not complete: {err}"));
                    let feature = FeatureResult::failed(name, incident.clone());
                    emit(&self.events, Event::new(run, EventKind::Incident { incident }));
                    report.push_feature(feature);
                }
            }
        }
    }

    fn catalog_request(
        &self,
        run: &str,
        test: &CatalogTest,
        options: IterationOptions,
    ) -> Result<FeatureRequest, DispatchError> {
        let feature = match &test.source {
            TestSource::Feature { feature } => feature.clone(),
            TestSource::FeatureSource {
                parser_plugin,
                text,
            } => self.parse(parser_plugin.as_deref(), text)?,
        };
        let mut request = FeatureRequest::new(run, feature, options);
        request.step_runner_plugin = test.step_runner_plugin.clone();
        request.data_source_plugins = test.data_source_plugins.clone();
        Ok(request)
    }

    fn parse(&self, parser: Option<&str>, text: &str) -> Result<TestFeature, DispatchError> {
        let parser = parser
            .or(self.config.default_feature_source_parser_plugin.as_deref())
            .unwrap_or(JSON_FEATURE_PARSER);
        self.registry
            .resolve_parser(parser)?
            .parse_feature_source(text)
            .map_err(|source| DispatchError::Parse {
                parser: parser.to_string(),
                source,
            })
    }

    fn record_incident(&self, report: &mut RunReport, incident: TestIncident) {
        tracing::warn!(run = %report.run_name, incident = %incident.message, "run incident");
        emit(
            &self.events,
            Event::new(
                report.run_name.clone(),
                EventKind::Incident {
                    incident: incident.clone(),
                },
            ),
        );
        report.add_incident(incident);
    }
}
