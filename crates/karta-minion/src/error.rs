#[derive(Debug, thiserror::Error)]
pub enum MinionError {
    #[error("minion transport to {address} failed: {source}")]
    Transport {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("minion {address} closed the connection before responding")]
    ConnectionClosed { address: String },
    #[error("minion protocol error: {message}")]
    Protocol { message: String },
    #[error("failed to encode minion payload: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    #[error("minion reported error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("minion {name} is not registered")]
    UnknownMinion { name: String },
}

impl MinionError {
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MinionError::Transport { .. } | MinionError::ConnectionClosed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::MinionError;

    #[test]
    fn transport_formats_address() {
        let err = MinionError::Transport {
            address: "10.0.0.5:9700".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };

        assert_eq!(
            err.to_string(),
            "minion transport to 10.0.0.5:9700 failed: refused"
        );
        assert!(err.is_transport());
    }

    #[test]
    fn remote_formats_code_and_message() {
        let err = MinionError::Remote {
            code: -32601,
            message: "unknown method".to_string(),
        };

        assert_eq!(err.to_string(), "minion reported error -32601: unknown method");
        assert!(!err.is_transport());
    }
}
