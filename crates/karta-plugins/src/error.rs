use crate::capability::Capability;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin not found: {name} does not provide {capability}")]
    NotFound { name: String, capability: Capability },
    #[error("plugin {name} is not registered")]
    Unknown { name: String },
    #[error("plugin {name} is already registered")]
    Duplicate { name: String },
    #[error("plugin {name} failed to initialize: {message}")]
    Initialization { name: String, message: String },
    #[error("invalid properties for plugin {name}: {source}")]
    Properties {
        name: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StepExecutionError {
    #[error("step '{step}' failed: {message}")]
    Failed { step: String, message: String },
    #[error("{operation} '{name}' is not supported by this step runner")]
    Unsupported {
        operation: &'static str,
        name: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to parse feature source: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid feature source: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_plugin_and_capability() {
        let err = PluginError::NotFound {
            name: "kriya".to_string(),
            capability: Capability::StepRunner,
        };

        assert_eq!(
            err.to_string(),
            "plugin not found: kriya does not provide step runner"
        );
    }

    #[test]
    fn unsupported_formats_operation() {
        let err = StepExecutionError::Unsupported {
            operation: "chaos action",
            name: "kill-pod".to_string(),
        };

        assert_eq!(
            err.to_string(),
            "chaos action 'kill-pod' is not supported by this step runner"
        );
    }
}
