//! Driver capability — the side-effecting half of every instance type.
//!
//! Each instance type supplies a driver that knows how to deploy and remove
//! it. The engine treats driver calls as opaque I/O: it hands over resolved
//! inputs and previous outputs and records whatever comes back.

pub mod registry;

pub use crate::core::executor::DeployContext;
pub use registry::{DriverFactory, Registry};

use crate::core::error::EngineError;
use crate::core::types::{Declaration, TargetKey};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for DriverError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for DriverError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<EngineError> for DriverError {
    fn from(e: EngineError) -> Self {
        Self::new(e.to_string())
    }
}

/// Deploy/remove capability for one instance type.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create or update the instance and return its outputs.
    ///
    /// `previous` carries the outputs of the last successful deploy, or None
    /// on first deploy and after the old instance was removed for a replace.
    async fn deploy(
        &self,
        ctx: &DeployContext,
        inputs: &Value,
        previous: Option<&Value>,
    ) -> Result<Value, DriverError>;

    /// Tear down the instance described by its last outputs.
    async fn remove(
        &self,
        ctx: &RunContext,
        id: &str,
        previous_outputs: &Value,
    ) -> Result<(), DriverError>;

    /// Input fields (dotted paths) that cannot change in place.
    fn replace_fields(&self) -> &[&str] {
        &[]
    }
}

/// Process-wide settings threaded into every driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub target: TargetKey,
    pub org: Option<String>,
    pub app: Option<String>,
    /// provider → setting → value, e.g. `aws.accessKeyId`
    pub credentials: BTreeMap<String, BTreeMap<String, String>>,
    /// Values visible to `${env.NAME}` expressions
    pub env: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(target: TargetKey) -> Self {
        Self {
            target,
            org: None,
            app: None,
            credentials: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    /// Context carrying a declaration's target, org and app.
    pub fn from_declaration(decl: &Declaration) -> Self {
        Self {
            org: decl.org.clone(),
            app: decl.app.clone(),
            ..Self::new(decl.target())
        }
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_credential(mut self, provider: &str, key: &str, value: &str) -> Self {
        self.credentials
            .entry(provider.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn credentials_for(&self, provider: &str) -> Option<&BTreeMap<String, String>> {
        self.credentials.get(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_context_from_declaration() {
        let decl: Declaration = serde_yaml_ng::from_str(
            r#"
version: "1.0"
project: realtime
stage: prod
org: acme
app: chat
"#,
        )
        .unwrap();
        let ctx = RunContext::from_declaration(&decl)
            .with_env("REGION", "us-east-1")
            .with_credential("aws", "accessKeyId", "AKIA")
            .with_credential("aws", "secretAccessKey", "s3cr3t");
        assert_eq!(ctx.target, TargetKey::new("realtime", "prod"));
        assert_eq!(ctx.org.as_deref(), Some("acme"));
        assert_eq!(ctx.app.as_deref(), Some("chat"));
        assert_eq!(ctx.env["REGION"], "us-east-1");
        assert_eq!(ctx.credentials_for("aws").map(|c| c.len()), Some(2));
        assert!(ctx.credentials_for("google").is_none());
    }

    #[test]
    fn test_driver_error_conversions() {
        let e: DriverError = "throttled".into();
        assert_eq!(e.to_string(), "throttled");
        let e: DriverError = EngineError::Validation("bad".to_string()).into();
        assert_eq!(e.message, "invalid declaration: bad");
    }
}
