pub mod bus;
pub mod error;
pub mod event_log;
pub mod listener;

pub use bus::*;
pub use error::*;
pub use event_log::*;
pub use listener::*;

#[cfg(test)]
mod tests {
    use super::{
        EventBus, EventBusError, IncidentCollector, JsonlEventLog, ListenerError,
        RecordingListener, StdoutListener, TestEventListener, TracingEventListener,
    };
    use std::any::TypeId;
    use std::sync::Arc;

    #[test]
    fn crate_root_reexports_types() {
        let _ = TypeId::of::<EventBus>();
        let _ = TypeId::of::<EventBusError>();
        let _ = TypeId::of::<ListenerError>();
        let _ = TypeId::of::<JsonlEventLog>();
        let _ = TypeId::of::<IncidentCollector>();
        let _ = TypeId::of::<StdoutListener>();
        let _ = TypeId::of::<TracingEventListener>();
    }

    #[test]
    fn listeners_are_object_safe() {
        let _listener: Arc<dyn TestEventListener> = Arc::new(RecordingListener::new());
    }
}
