use karta_core::events::{Event, EventKind};
use karta_core::types::TestExecutionContext;
use karta_events::bus::EventBus;

/// Raises `event`, logging instead of failing when the bus rejects it.
pub fn emit(events: &EventBus, event: Event) {
    if let Err(err) = events.raise_event(event) {
        tracing::warn!(error = %err, "lifecycle event dropped");
    }
}

/// Event addressed to the unit `context` currently points at.
pub fn context_event(context: &TestExecutionContext, kind: EventKind) -> Event {
    let event = Event::new(context.run_name.clone(), kind).in_feature(context.feature_name.clone());
    match &context.scenario_name {
        Some(scenario) => event.in_scenario(scenario.clone(), context.iteration_index),
        None => event.at_iteration(context.iteration_index),
    }
}
