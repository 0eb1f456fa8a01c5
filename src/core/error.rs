//! CP-002: Engine error taxonomy.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by graph building, resolution, orchestration and state I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Reference cycle between instances; fatal for the run.
    #[error("dependency cycle detected involving: {}", members.join(", "))]
    CyclicDependency { members: Vec<String> },

    /// An expression names an instance that is not declared.
    #[error("instance '{instance}' references unknown instance in '{expression}'")]
    UnknownReference {
        instance: String,
        expression: String,
    },

    /// The referenced output path does not exist.
    #[error("instance '{instance}' cannot resolve '{expression}'")]
    UnresolvedReference {
        instance: String,
        expression: String,
    },

    /// A provider was consulted before it settled.
    #[error("instance '{instance}' read '{dependency}' before it settled")]
    DependencyNotReady {
        instance: String,
        dependency: String,
    },

    /// The external driver reported a failure.
    #[error("driver failed for '{instance}': {message}")]
    Driver { instance: String, message: String },

    /// Malformed snapshot.
    #[error("snapshot error: {0}")]
    Serialization(String),

    /// No driver registered for a declared type.
    #[error("instance '{instance}' has unregistered type '{type_name}'")]
    UnknownType { instance: String, type_name: String },

    /// Structural problem in a declaration.
    #[error("invalid declaration: {0}")]
    Validation(String),

    /// Snapshot storage failed to read or write.
    #[error("state storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Fatal errors abort the whole run before any driver call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. }
                | Self::UnknownReference { .. }
                | Self::UnknownType { .. }
                | Self::Validation(_)
                | Self::Serialization(_)
                | Self::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cp002_error_display() {
        let e = EngineError::CyclicDependency {
            members: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(e.to_string(), "dependency cycle detected involving: a, b");

        let e = EngineError::UnresolvedReference {
            instance: "site".to_string(),
            expression: "${api.url}".to_string(),
        };
        assert_eq!(e.to_string(), "instance 'site' cannot resolve '${api.url}'");

        let e = EngineError::Driver {
            instance: "api".to_string(),
            message: "throttled".to_string(),
        };
        assert_eq!(e.to_string(), "driver failed for 'api': throttled");
    }

    #[test]
    fn test_cp002_fatal_classification() {
        assert!(EngineError::CyclicDependency { members: vec![] }.is_fatal());
        assert!(EngineError::UnknownReference {
            instance: "a".to_string(),
            expression: "${b.x}".to_string(),
        }
        .is_fatal());
        assert!(!EngineError::Driver {
            instance: "a".to_string(),
            message: "boom".to_string(),
        }
        .is_fatal());
        assert!(!EngineError::UnresolvedReference {
            instance: "a".to_string(),
            expression: "${b.x}".to_string(),
        }
        .is_fatal());
    }
}
