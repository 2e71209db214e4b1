use karta_core::events::{Event, EventKind};
use karta_core::results::TestIncident;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ListenerError;

pub trait TestEventListener: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_event(&self, event: &Event) -> Result<(), ListenerError>;

    fn close(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StdoutListener;

impl TestEventListener for StdoutListener {
    fn name(&self) -> &str {
        "stdout"
    }

    fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        println!(
            "[{}] {} | feature={:?} scenario={:?} job={:?} iteration={:?}",
            event.run_name,
            event.kind.as_str(),
            event.feature,
            event.scenario,
            event.job,
            event.iteration,
        );
        Ok(())
    }
}

/// Logs each event through `tracing`; failures and incidents at warn level.
#[derive(Debug, Clone, Default)]
pub struct TracingEventListener;

impl TestEventListener for TracingEventListener {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        let failed = match &event.kind {
            EventKind::RunComplete { passed }
            | EventKind::FeatureComplete { passed }
            | EventKind::ScenarioComplete { passed, .. }
            | EventKind::JobComplete { passed, .. } => !passed,
            EventKind::StepComplete { result, .. }
            | EventKind::ChaosActionComplete { result, .. } => !result.is_successful(),
            EventKind::Incident { incident } => incident.failure,
            _ => false,
        };

        if failed {
            tracing::warn!(
                run = %event.run_name,
                feature = ?event.feature,
                scenario = ?event.scenario,
                job = ?event.job,
                iteration = ?event.iteration,
                "{}",
                event.kind.as_str()
            );
        } else {
            tracing::debug!(
                run = %event.run_name,
                feature = ?event.feature,
                scenario = ?event.scenario,
                job = ?event.job,
                iteration = ?event.iteration,
                "{}",
                event.kind.as_str()
            );
        }
        Ok(())
    }
}

/// Keeps incidents carrying any of the watched tags. An empty tag set keeps all.
#[derive(Debug, Default)]
pub struct IncidentCollector {
    tags: BTreeSet<String>,
    incidents: Mutex<Vec<(String, TestIncident)>>,
}

impl IncidentCollector {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            incidents: Mutex::new(Vec::new()),
        }
    }

    pub fn incidents(&self) -> Vec<(String, TestIncident)> {
        self.incidents.lock().clone()
    }

    fn matches(&self, incident: &TestIncident) -> bool {
        self.tags.is_empty() || incident.has_any_tag(&self.tags)
    }
}

impl TestEventListener for IncidentCollector {
    fn name(&self) -> &str {
        "incident-collector"
    }

    fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        if let EventKind::Incident { incident } = &event.kind {
            if self.matches(incident) {
                self.incidents
                    .lock()
                    .push((event.run_name.clone(), incident.clone()));
            }
        }
        Ok(())
    }
}

/// Stores every event in memory.
#[derive(Debug, Default)]
pub struct RecordingListener {
    tag: Option<String>,
    order: Option<Arc<Mutex<Vec<String>>>>,
    events: Mutex<Vec<Event>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also appends `"<tag>:<kind>"` to a shared log, for cross-listener ordering checks.
    pub fn tagged(tag: impl Into<String>, order: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            tag: Some(tag.into()),
            order: Some(order),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind.as_str()).collect()
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TestEventListener for RecordingListener {
    fn name(&self) -> &str {
        self.tag.as_deref().unwrap_or("recording")
    }

    fn start(&self) -> Result<(), ListenerError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        if let (Some(tag), Some(order)) = (&self.tag, &self.order) {
            order.lock().push(format!("{tag}:{}", event.kind.as_str()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn close(&self) -> Result<(), ListenerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
