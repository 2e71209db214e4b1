use crate::event_log::EventLogError;

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus is closed; dropped {kind} event for run {run_name}")]
    Closed { run_name: String, kind: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error("event listener failed: {message}")]
    Failed { message: String },
}

#[cfg(test)]
mod tests {
    use super::{EventBusError, ListenerError};

    #[test]
    fn closed_formats_run_and_kind() {
        let err = EventBusError::Closed {
            run_name: "nightly".to_string(),
            kind: "run_start",
        };

        assert_eq!(
            err.to_string(),
            "event bus is closed; dropped run_start event for run nightly"
        );
    }

    #[test]
    fn listener_failed_formats_message() {
        let err = ListenerError::Failed {
            message: "socket closed".to_string(),
        };

        assert_eq!(err.to_string(), "event listener failed: socket closed");
        assert!(matches!(err, ListenerError::Failed { ref message } if message == "socket closed"));
    }
}
