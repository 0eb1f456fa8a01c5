//! CP-001: Data model — declarations, policy, snapshots, plans, reports.
//!
//! Defines the YAML schema for the declaration document and the persisted
//! snapshot, plus the in-memory result types of a run. Input and output
//! trees are `serde_json::Value` so they roundtrip through YAML and JSON alike.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Schema version written into snapshots and accepted in declarations.
pub const SCHEMA_VERSION: &str = "1.0";

/// Reserved expression namespace for run-context environment values.
pub const ENV_NAMESPACE: &str = "env";

// ============================================================================
// Declaration document (compositor.yaml)
// ============================================================================

/// Root declaration — the desired state of one deployment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declaration {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Project name (first half of the target key)
    pub project: String,

    /// Stage name (second half of the target key)
    #[serde(default = "default_stage")]
    pub stage: String,

    /// Owning organization, handed to drivers
    #[serde(default)]
    pub org: Option<String>,

    /// Application name, handed to drivers
    #[serde(default)]
    pub app: Option<String>,

    /// Instance declarations (order-preserving)
    #[serde(default)]
    pub instances: IndexMap<String, InstanceDecl>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

fn default_stage() -> String {
    "dev".to_string()
}

impl Declaration {
    /// The deployment target this declaration describes.
    pub fn target(&self) -> TargetKey {
        TargetKey::new(&self.project, &self.stage)
    }
}

/// A single declared instance: a type name and a raw input tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDecl {
    /// Instance type, looked up in the driver registry
    #[serde(rename = "type")]
    pub type_name: String,

    /// Raw inputs, possibly containing `${...}` expressions
    #[serde(default = "empty_tree")]
    pub inputs: Value,
}

impl InstanceDecl {
    pub fn new(type_name: &str, inputs: Value) -> Self {
        Self {
            type_name: type_name.to_string(),
            inputs,
        }
    }
}

fn empty_tree() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum driver calls in flight per scope
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    /// Treat an unreadable snapshot as absent instead of aborting
    #[serde(default)]
    pub tolerate_corrupt_state: bool,

    /// Append lifecycle events to the JSONL event log
    #[serde(default = "default_true")]
    pub event_log: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            tolerate_corrupt_state: false,
            event_log: true,
        }
    }
}

fn default_concurrency() -> usize {
    8
}

fn default_true() -> bool {
    true
}

/// Deployment target — one snapshot exists per (project, stage).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub project: String,
    pub stage: String,
}

impl TargetKey {
    pub fn new(project: &str, stage: &str) -> Self {
        Self {
            project: project.to_string(),
            stage: stage.to_string(),
        }
    }

    /// Relative directory used by file-backed state.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(&self.project).join(&self.stage)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.stage)
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Persisted record of one run's instance graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema version
    pub schema: String,

    /// Target this snapshot belongs to
    pub target: TargetKey,

    /// When the snapshot was generated
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// Per-instance state keyed by full identity
    #[serde(default)]
    pub instances: BTreeMap<String, SnapshotEntry>,
}

impl Snapshot {
    /// Entries owned by no parent, i.e. declared at the top level.
    pub fn top_level(&self) -> impl Iterator<Item = (&String, &SnapshotEntry)> {
        self.instances.iter().filter(|(id, _)| !id.contains('.'))
    }
}

/// Data-only record of a single instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Instance type
    #[serde(rename = "type")]
    pub type_name: String,

    /// Resolved inputs
    #[serde(default = "empty_tree")]
    pub inputs: Value,

    /// Outputs produced by the last successful deploy
    #[serde(default = "empty_tree")]
    pub outputs: Value,

    /// Full identities of child instances, in construction order
    #[serde(default)]
    pub children: Vec<String>,

    /// Full identities of the instances this one read outputs from
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// BLAKE3 fingerprint of the resolved inputs
    pub fingerprint: String,
}

// ============================================================================
// Diff verdicts and lifecycle
// ============================================================================

/// Diff engine classification of the action an instance requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    None,
    Deploy,
    Replace,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Deploy => write!(f, "deploy"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

/// Per-run lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Resolving,
    Skipped,
    Deploying,
    Removing,
    Settled,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Resolving => write!(f, "RESOLVING"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Deploying => write!(f, "DEPLOYING"),
            Self::Removing => write!(f, "REMOVING"),
            Self::Settled => write!(f, "SETTLED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action a dry run predicts for an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    Destroy,
    NoOp,
    /// Inputs depend on a provider that will be redeployed first
    Pending,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
            Self::Pending => write!(f, "PENDING"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub instance_id: String,
    pub type_name: String,
    pub action: PlanAction,
    pub description: String,
}

/// Full dry-run plan for a target.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub target: TargetKey,
    pub changes: Vec<PlannedChange>,
    /// Topological evaluation order (top-level identities)
    pub execution_order: Vec<String>,
    pub to_create: u32,
    pub to_update: u32,
    pub to_replace: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
    pub pending: u32,
}

// ============================================================================
// Run report
// ============================================================================

/// Outcome of one instance in a run.
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub state: LifecycleState,
    pub verdict: Option<Verdict>,
    /// True when the instance was torn down rather than deployed
    pub removed: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    PartialFailure,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "COMPLETE"),
            Self::PartialFailure => write!(f, "PARTIAL-FAILURE"),
        }
    }
}

/// Result of a deploy or remove run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub target: TargetKey,
    pub run_id: String,
    pub instances: IndexMap<String, InstanceReport>,
    pub total_duration: Duration,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.failed() == 0 {
            RunStatus::Complete
        } else {
            RunStatus::PartialFailure
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == RunStatus::Complete
    }

    pub fn deployed(&self) -> u32 {
        self.count(|r| r.state == LifecycleState::Settled && !r.removed && r.verdict != Some(Verdict::None))
    }

    pub fn unchanged(&self) -> u32 {
        self.count(|r| r.state == LifecycleState::Settled && r.verdict == Some(Verdict::None))
    }

    pub fn removed(&self) -> u32 {
        self.count(|r| r.state == LifecycleState::Settled && r.removed)
    }

    pub fn failed(&self) -> u32 {
        self.count(|r| r.state == LifecycleState::Failed)
    }

    /// Error message recorded for an instance, if it failed.
    pub fn error_of(&self, id: &str) -> Option<&str> {
        self.instances.get(id).and_then(|r| r.error.as_deref())
    }

    fn count(&self, pred: impl Fn(&InstanceReport) -> bool) -> u32 {
        self.instances.values().filter(|r| pred(r)).count() as u32
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Lifecycle event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        target: String,
        run_id: String,
        compositor_version: String,
    },
    InstanceStarted {
        instance: String,
        action: String,
    },
    InstanceSettled {
        instance: String,
        verdict: Verdict,
        duration_seconds: f64,
        fingerprint: String,
    },
    InstanceSkipped {
        instance: String,
        fingerprint: String,
    },
    InstanceRemoved {
        instance: String,
        duration_seconds: f64,
    },
    InstanceFailed {
        instance: String,
        error: String,
    },
    RunCompleted {
        target: String,
        run_id: String,
        deployed: u32,
        unchanged: u32,
        removed: u32,
        failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Value helpers
// ============================================================================

/// Render a scalar for string interpolation. Returns None for trees.
pub fn value_to_text(val: &Value) -> Option<String> {
    match val {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Walk a path of mapping keys / sequence indices into a tree.
pub fn lookup_path<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cp001_declaration_parse() {
        let yaml = r#"
version: "1.0"
project: realtime
stage: prod
org: acme
instances:
  api:
    type: Socket
    inputs:
      memory: 512
  site:
    type: Website
    inputs:
      apiUrl: "${api.url}"
policy:
  max_concurrency: 2
"#;
        let decl: Declaration = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(decl.project, "realtime");
        assert_eq!(decl.org.as_deref(), Some("acme"));
        assert_eq!(decl.instances.len(), 2);
        assert_eq!(decl.instances["api"].type_name, "Socket");
        assert_eq!(decl.instances["site"].inputs["apiUrl"], json!("${api.url}"));
        assert_eq!(decl.policy.max_concurrency, 2);
        let keys: Vec<_> = decl.instances.keys().collect();
        assert_eq!(keys, vec!["api", "site"]);
    }

    #[test]
    fn test_cp001_declaration_defaults() {
        let yaml = r#"
version: "1.0"
project: p
instances:
  bare:
    type: Thing
"#;
        let decl: Declaration = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(decl.stage, "dev");
        assert_eq!(decl.instances["bare"].inputs, json!({}));
        assert_eq!(decl.policy, Policy::default());
    }

    #[test]
    fn test_cp001_policy_defaults() {
        let p = Policy::default();
        assert_eq!(p.max_concurrency, 8);
        assert!(!p.tolerate_corrupt_state);
        assert!(p.event_log);
    }

    #[test]
    fn test_cp001_target_key() {
        let t = TargetKey::new("realtime", "dev");
        assert_eq!(t.to_string(), "realtime/dev");
        assert_eq!(t.relative_dir(), PathBuf::from("realtime/dev"));
    }

    #[test]
    fn test_cp001_snapshot_entry_defaults_for_older_snapshots() {
        let yaml = r#"
type: Website
inputs: {name: site}
outputs: {url: "https://x"}
fingerprint: "blake3:abc"
"#;
        let entry: SnapshotEntry = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(entry.children.is_empty());
        assert!(entry.dependencies.is_empty());
        assert_eq!(entry.outputs["url"], json!("https://x"));
    }

    #[test]
    fn test_cp001_snapshot_top_level() {
        let entry = SnapshotEntry {
            type_name: "T".to_string(),
            inputs: json!({}),
            outputs: json!({}),
            children: vec![],
            dependencies: vec![],
            fingerprint: "blake3:x".to_string(),
        };
        let snapshot = Snapshot {
            schema: SCHEMA_VERSION.to_string(),
            target: TargetKey::new("p", "dev"),
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            generator: "compositor test".to_string(),
            instances: BTreeMap::from([
                ("app".to_string(), entry.clone()),
                ("app.socket".to_string(), entry),
            ]),
        };
        let top: Vec<_> = snapshot.top_level().map(|(id, _)| id.as_str()).collect();
        assert_eq!(top, vec!["app"]);
    }

    #[test]
    fn test_cp001_verdict_and_state_display() {
        assert_eq!(Verdict::None.to_string(), "none");
        assert_eq!(Verdict::Replace.to_string(), "replace");
        assert_eq!(LifecycleState::Settled.to_string(), "SETTLED");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
    }

    #[test]
    fn test_cp001_provenance_event_serde() {
        let event = ProvenanceEvent::InstanceSkipped {
            instance: "site".to_string(),
            fingerprint: "blake3:abc".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"instance_skipped\""));
        assert!(json.contains("\"instance\":\"site\""));
    }

    #[test]
    fn test_cp001_value_to_text() {
        assert_eq!(value_to_text(&json!("hello")).as_deref(), Some("hello"));
        assert_eq!(value_to_text(&json!(42)).as_deref(), Some("42"));
        assert_eq!(value_to_text(&json!(true)).as_deref(), Some("true"));
        assert_eq!(value_to_text(&Value::Null).as_deref(), Some(""));
        assert!(value_to_text(&json!({"a": 1})).is_none());
    }

    #[test]
    fn test_cp001_lookup_path() {
        let tree = json!({"websockets": {"url": "wss://x", "ports": [80, 443]}});
        assert_eq!(
            lookup_path(&tree, &["websockets", "url"]),
            Some(&json!("wss://x"))
        );
        assert_eq!(
            lookup_path(&tree, &["websockets", "ports", "1"]),
            Some(&json!(443))
        );
        assert_eq!(lookup_path::<&str>(&tree, &[]), Some(&tree));
        assert!(lookup_path(&tree, &["websockets", "missing"]).is_none());
        assert!(lookup_path(&tree, &["websockets", "url", "deeper"]).is_none());
    }
}
