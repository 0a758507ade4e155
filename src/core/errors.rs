use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the orchestration engine
#[derive(Debug, Error)]
pub enum CrossflowError {
    /// No stage could be executed in a full pass, even with breakpoints disabled
    #[error("Deadlock: {message}")]
    Deadlock {
        message: String,
        pending: Vec<String>,
    },

    /// A backend executor failed while running a stage
    #[error("Stage {stage} failed on platform {platform} (group {group})")]
    StageExecution {
        stage: String,
        group: String,
        platform: String,
        context: HashMap<String, String>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Programming error: reference counting or activation bookkeeping went wrong
    #[error("Invariant violated: {message}")]
    InvariantViolation { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// The execution graph is malformed
    #[error("Invalid graph: {message}")]
    InvalidGraph { message: String },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CrossflowError {
    /// Create a deadlock error listing the stages that were left waiting
    pub fn deadlock<S: Into<String>>(message: S, pending: Vec<String>) -> Self {
        Self::Deadlock {
            message: message.into(),
            pending,
        }
    }

    /// Wrap a backend failure with the stage, group and platform it happened on
    pub fn stage_execution<S, G, P>(stage: S, group: G, platform: P, source: anyhow::Error) -> Self
    where
        S: Into<String>,
        G: Into<String>,
        P: Into<String>,
    {
        Self::StageExecution {
            stage: stage.into(),
            group: group.into(),
            platform: platform.into(),
            context: HashMap::new(),
            source: source.into(),
        }
    }

    /// Add context to a stage execution error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::StageExecution { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn invalid_graph<S: Into<String>>(message: S) -> Self {
        Self::InvalidGraph {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Whether the caller can fix its input and try again without touching the run
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Configuration { .. } | Self::InvalidGraph { .. } | Self::Serialization { .. } => true,
            Self::Deadlock { .. } | Self::StageExecution { .. } | Self::InvariantViolation { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Deadlock { .. } => "deadlock",
            Self::StageExecution { .. } => "execution",
            Self::InvariantViolation { .. } => "invariant",
            Self::Configuration { .. } => "configuration",
            Self::InvalidGraph { .. } => "graph",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CrossflowError>;

impl From<serde_json::Error> for CrossflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for CrossflowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_execution_error() {
        let err = CrossflowError::stage_execution(
            "stage-1",
            "group-a",
            "local",
            anyhow::anyhow!("disk full"),
        );
        assert_eq!(err.category(), "execution");
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Stage stage-1 failed on platform local (group group-a)"
        );
        let source = std::error::Error::source(&err).expect("source is kept");
        assert_eq!(source.to_string(), "disk full");
    }

    #[test]
    fn test_error_context() {
        let err = CrossflowError::stage_execution("s", "g", "p", anyhow::anyhow!("boom"))
            .with_context("run_id", "r-1")
            .with_context("attempt", "1");

        if let CrossflowError::StageExecution { context, .. } = err {
            assert_eq!(context.get("run_id"), Some(&"r-1".to_string()));
            assert_eq!(context.get("attempt"), Some(&"1".to_string()));
        } else {
            panic!("Expected stage execution error");
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(CrossflowError::deadlock("stuck", vec![]).category(), "deadlock");
        assert_eq!(CrossflowError::invariant("double discard").category(), "invariant");
        assert!(!CrossflowError::invariant("x").is_recoverable());
        assert!(CrossflowError::configuration("x").is_recoverable());
    }

    #[test]
    fn test_yaml_conversion() {
        let parsed: std::result::Result<Vec<u32>, _> = serde_yaml::from_str("{not: [a list");
        let err: CrossflowError = parsed.unwrap_err().into();
        assert!(matches!(err, CrossflowError::Serialization { ref format, .. } if format == "yaml"));
    }
}
