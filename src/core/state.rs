//! CP-013: Snapshot serialization and persistence.
//!
//! `serialize` turns a live instance graph into a data-only snapshot;
//! `deserialize` rebuilds the live graph by looking every type up in the
//! registry. Neither direction calls a driver hook.
//!
//! Snapshots are YAML documents keyed by identity. The file store writes them
//! atomically (temp file, then rename) under `<state>/<project>/<stage>/`.

use super::error::{EngineError, Result};
use super::instance::{parent_of, Instance, InstanceGraph};
use super::types::{Snapshot, SnapshotEntry, TargetKey, SCHEMA_VERSION};
use crate::driver::Registry;
use crate::tripwire::eventlog::now_iso8601;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

// ============================================================================
// Serializer
// ============================================================================

/// Convert a live graph into a snapshot. Driver handles are dropped.
pub fn serialize(graph: &InstanceGraph, target: &TargetKey) -> Snapshot {
    let instances: BTreeMap<String, SnapshotEntry> = graph
        .iter()
        .map(|inst| {
            (
                inst.id.clone(),
                SnapshotEntry {
                    type_name: inst.type_name.clone(),
                    inputs: inst.inputs.clone(),
                    outputs: inst.outputs.clone(),
                    children: inst.children.clone(),
                    dependencies: inst.dependencies.clone(),
                    fingerprint: inst.fingerprint.clone(),
                },
            )
        })
        .collect();

    Snapshot {
        schema: SCHEMA_VERSION.to_string(),
        target: target.clone(),
        generated_at: now_iso8601(),
        generator: format!("compositor {}", env!("CARGO_PKG_VERSION")),
        instances,
    }
}

/// Rebuild a live graph from a snapshot, attaching drivers from `registry`.
pub fn deserialize(snapshot: &Snapshot, registry: &Registry) -> Result<InstanceGraph> {
    check_snapshot(snapshot)?;

    let mut graph = InstanceGraph::new();
    for (id, entry) in &snapshot.instances {
        let driver = registry.lookup(&entry.type_name).ok_or_else(|| {
            EngineError::Serialization(format!(
                "instance '{}' has type '{}' which is not registered",
                id, entry.type_name
            ))
        })?;
        graph.insert(Instance {
            id: id.clone(),
            type_name: entry.type_name.clone(),
            inputs: entry.inputs.clone(),
            outputs: entry.outputs.clone(),
            children: entry.children.clone(),
            dependencies: entry.dependencies.clone(),
            fingerprint: entry.fingerprint.clone(),
            driver: driver.create(),
        })?;
    }
    Ok(graph)
}

/// Structural checks shared by `deserialize` and the stores.
pub fn check_snapshot(snapshot: &Snapshot) -> Result<()> {
    if !schema_supported(&snapshot.schema) {
        return Err(EngineError::Serialization(format!(
            "unsupported snapshot schema \"{}\"",
            snapshot.schema
        )));
    }
    for (id, entry) in &snapshot.instances {
        for child in &entry.children {
            if !snapshot.instances.contains_key(child) {
                return Err(EngineError::Serialization(format!(
                    "instance '{}' lists missing child '{}'",
                    id, child
                )));
            }
            if parent_of(child) != Some(id.as_str()) {
                return Err(EngineError::Serialization(format!(
                    "child '{}' is not namespaced under '{}'",
                    child, id
                )));
            }
        }
    }
    Ok(())
}

/// Any 1.x schema is readable; new fields are added with defaults.
fn schema_supported(schema: &str) -> bool {
    schema.split('.').next() == Some("1")
}

/// Render a snapshot as YAML.
pub fn to_yaml(snapshot: &Snapshot) -> Result<String> {
    serde_yaml_ng::to_string(snapshot)
        .map_err(|e| EngineError::Serialization(format!("serialize error: {}", e)))
}

/// Parse and check a YAML snapshot.
pub fn from_yaml(yaml: &str) -> Result<Snapshot> {
    let snapshot: Snapshot = serde_yaml_ng::from_str(yaml)
        .map_err(|e| EngineError::Serialization(format!("invalid snapshot: {}", e)))?;
    check_snapshot(&snapshot)?;
    Ok(snapshot)
}

/// `id` and every recorded descendant, children before parents and later
/// siblings before earlier ones.
pub fn teardown_order(snapshot: &Snapshot, id: &str) -> Vec<String> {
    fn walk(snapshot: &Snapshot, id: &str, order: &mut Vec<String>) {
        if let Some(entry) = snapshot.instances.get(id) {
            for child in entry.children.iter().rev() {
                walk(snapshot, child, order);
            }
        }
        order.push(id.to_string());
    }
    let mut order = Vec::new();
    walk(snapshot, id, &mut order);
    order
}

/// Empty snapshot for a target.
pub fn empty_snapshot(target: &TargetKey) -> Snapshot {
    serialize(&InstanceGraph::new(), target)
}

// ============================================================================
// Stores
// ============================================================================

/// Persisted snapshot storage, one snapshot per target.
pub trait SnapshotStore: Send + Sync {
    /// Load the target's snapshot; `Ok(None)` when none was ever saved.
    fn load(&self, target: &TargetKey) -> Result<Option<Snapshot>>;

    /// Replace the target's snapshot wholesale.
    fn save(&self, target: &TargetKey, snapshot: &Snapshot) -> Result<()>;
}

/// Load the previous snapshot, applying the corruption policy.
///
/// A `Serialization` error is returned as-is unless `tolerate_corrupt` is
/// set, in which case the target is treated as never deployed.
pub fn load_previous(
    store: &dyn SnapshotStore,
    target: &TargetKey,
    tolerate_corrupt: bool,
) -> Result<Option<Snapshot>> {
    match store.load(target) {
        Ok(found) => {
            tracing::debug!(%target, found = found.is_some(), "loaded previous snapshot");
            Ok(found)
        }
        Err(EngineError::Serialization(msg)) if tolerate_corrupt => {
            tracing::warn!(%target, error = %msg, "ignoring corrupt snapshot");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Derive the snapshot path for a target within the state directory.
pub fn snapshot_path(state_dir: &Path, target: &TargetKey) -> PathBuf {
    state_dir.join(target.relative_dir()).join("snapshot.yaml")
}

/// YAML files under a state directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    state_dir: PathBuf,
}

impl FileStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

impl SnapshotStore for FileStore {
    fn load(&self, target: &TargetKey) -> Result<Option<Snapshot>> {
        let path = snapshot_path(&self.state_dir, target);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Storage(format!("cannot read {}: {}", path.display(), e)))?;
        from_yaml(&content)
            .map(Some)
            .map_err(|e| EngineError::Serialization(format!("{}: {}", path.display(), e)))
    }

    fn save(&self, target: &TargetKey, snapshot: &Snapshot) -> Result<()> {
        let path = snapshot_path(&self.state_dir, target);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Storage(format!("cannot create dir {}: {}", parent.display(), e))
            })?;
        }

        let yaml = to_yaml(snapshot)?;

        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml).map_err(|e| {
            EngineError::Storage(format!("cannot write {}: {}", tmp_path.display(), e))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            EngineError::Storage(format!(
                "cannot rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;
        tracing::debug!(path = %path.display(), instances = snapshot.instances.len(), "saved snapshot");
        Ok(())
    }
}

/// In-process store. Snapshots are kept as YAML text so loads go through
/// the same parser as files do.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<TargetKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw document text for a target, bypassing serialization.
    pub fn put_raw(&self, target: &TargetKey, document: &str) {
        self.documents
            .lock()
            .insert(target.clone(), document.to_string());
    }

    pub fn raw(&self, target: &TargetKey) -> Option<String> {
        self.documents.lock().get(target).cloned()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, target: &TargetKey) -> Result<Option<Snapshot>> {
        match self.raw(target) {
            Some(doc) => from_yaml(&doc).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, target: &TargetKey, snapshot: &Snapshot) -> Result<()> {
        let yaml = to_yaml(snapshot)?;
        self.put_raw(target, &yaml);
        Ok(())
    }
}
