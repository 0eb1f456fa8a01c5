//! CP-011: Declaration parsing and validation.
//!
//! Parses compositor.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Project and stage must be named
//! - Instance names are single identity segments and not `env`
//! - `${env.NAME}` expressions name exactly one value
//! - Fan-out limit is at least 1

use super::error::{EngineError, Result};
use super::resolver::collect_references;
use super::types::*;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a compositor.yaml file from disk.
pub fn parse_declaration_file(path: &Path) -> Result<Declaration> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Validation(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_declaration(&content)
}

/// Parse a compositor.yaml from a string.
pub fn parse_declaration(yaml: &str) -> Result<Declaration> {
    serde_yaml_ng::from_str(yaml)
        .map_err(|e| EngineError::Validation(format!("YAML parse error: {}", e)))
}

/// Validate a parsed declaration. Returns a list of errors (empty = valid).
pub fn validate_declaration(decl: &Declaration) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if decl.version != SCHEMA_VERSION {
        push(format!(
            "version must be \"{}\", got \"{}\"",
            SCHEMA_VERSION, decl.version
        ));
    }

    if decl.project.trim().is_empty() {
        push("project must not be empty".to_string());
    }
    if decl.stage.trim().is_empty() {
        push("stage must not be empty".to_string());
    }

    for (name, instance) in &decl.instances {
        if name.is_empty() {
            push("instance name must not be empty".to_string());
        } else if name.contains('.') {
            push(format!("instance name '{}' must not contain '.'", name));
        } else if name == ENV_NAMESPACE {
            push(format!("instance name '{}' is reserved", name));
        }

        if instance.type_name.trim().is_empty() {
            push(format!("instance '{}' has no type", name));
        }

        for reference in collect_references(&instance.inputs) {
            if reference.is_env() && reference.path.len() != 1 {
                push(format!(
                    "instance '{}': '{}' must name exactly one env value",
                    name, reference.expression
                ));
            }
        }
    }

    if decl.policy.max_concurrency == 0 {
        push("policy.max_concurrency must be at least 1".to_string());
    }

    errors
}
