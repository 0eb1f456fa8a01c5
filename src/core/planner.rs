//! CP-006: Diff engine — decide what each instance needs this run.
//!
//! An instance is compared against its entry in the previous snapshot:
//! nothing recorded means deploy, a changed type or a changed replace-only
//! field means replace, an identical input fingerprint means nothing to do.
//! `plan` runs the same classification without calling any driver.

use super::error::Result;
use super::graph;
use super::resolver::{OutputPool, Resolver};
use super::types::*;
use crate::driver::Registry;
use crate::tripwire::hasher;
use std::collections::{BTreeMap, HashSet};

/// Classify one instance against its previous snapshot entry.
pub fn should_deploy(
    type_name: &str,
    inputs: &serde_json::Value,
    fingerprint: &str,
    previous: Option<&SnapshotEntry>,
    replace_fields: &[&str],
    force: bool,
) -> Verdict {
    let Some(prev) = previous else {
        return Verdict::Deploy;
    };

    if prev.type_name != type_name {
        return Verdict::Replace;
    }

    if let Some(field) = changed_replace_field(inputs, &prev.inputs, replace_fields) {
        tracing::debug!(field, "replace-only field changed");
        return Verdict::Replace;
    }

    if prev.fingerprint == fingerprint && !force {
        return Verdict::None;
    }

    Verdict::Deploy
}

/// First replace-only field whose value differs between the two trees.
/// A field present on one side only counts as changed.
pub fn changed_replace_field<'f>(
    inputs: &serde_json::Value,
    previous_inputs: &serde_json::Value,
    replace_fields: &[&'f str],
) -> Option<&'f str> {
    replace_fields.iter().copied().find(|field| {
        let path: Vec<&str> = field.split('.').collect();
        lookup_path(inputs, &path) != lookup_path(previous_inputs, &path)
    })
}

/// Dry run: predict the action for every top-level instance plus the
/// orphans a deploy would remove.
///
/// Instances that read from a provider which is itself about to change are
/// reported as `Pending`, since their inputs are only known after the
/// provider settles. Children are decided at deploy time by their parents
/// and are not listed individually.
pub fn plan(
    decl: &Declaration,
    previous: Option<&Snapshot>,
    registry: &Registry,
    run_env: &BTreeMap<String, String>,
    force: bool,
) -> Result<ExecutionPlan> {
    let dag = graph::build_graph(&decl.instances)?;

    let mut changes = Vec::new();
    let mut to_create = 0u32;
    let mut to_update = 0u32;
    let mut to_replace = 0u32;
    let mut unchanged = 0u32;
    let mut pending = 0u32;

    let mut pool = OutputPool::new();
    let mut moving: HashSet<&str> = HashSet::new();

    for id in dag.order() {
        let Some(instance) = decl.instances.get(id) else {
            continue;
        };
        let driver = registry.driver_for(id, &instance.type_name)?;
        let prev = previous.and_then(|s| s.instances.get(id));

        let action = if prev.is_none() {
            PlanAction::Create
        } else if dag.providers_of(id).iter().any(|p| moving.contains(p.as_str())) {
            PlanAction::Pending
        } else {
            match Resolver::new(&pool, run_env).resolve_inputs(id, &instance.inputs) {
                Ok(resolved) => {
                    let fp = hasher::fingerprint(&resolved);
                    let verdict = should_deploy(
                        &instance.type_name,
                        &resolved,
                        &fp,
                        prev,
                        driver.replace_fields(),
                        force,
                    );
                    match verdict {
                        Verdict::None => PlanAction::NoOp,
                        Verdict::Deploy => PlanAction::Update,
                        Verdict::Replace => PlanAction::Replace,
                    }
                }
                Err(e) => {
                    tracing::debug!(instance = %id, error = %e, "inputs unresolvable in dry run");
                    PlanAction::Pending
                }
            }
        };

        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Replace => to_replace += 1,
            PlanAction::NoOp => unchanged += 1,
            PlanAction::Pending => pending += 1,
            PlanAction::Destroy => {}
        }

        if action == PlanAction::NoOp {
            if let Some(entry) = prev {
                pool.insert(id, entry.outputs.clone());
            }
        } else {
            moving.insert(id.as_str());
        }

        changes.push(PlannedChange {
            instance_id: id.clone(),
            type_name: instance.type_name.clone(),
            description: describe_action(id, &instance.type_name, &action),
            action,
        });
    }

    let mut to_destroy = 0u32;
    if let Some(snapshot) = previous {
        for (id, entry) in snapshot.top_level() {
            if decl.instances.contains_key(id) {
                continue;
            }
            to_destroy += 1;
            changes.push(PlannedChange {
                instance_id: id.clone(),
                type_name: entry.type_name.clone(),
                description: describe_action(id, &entry.type_name, &PlanAction::Destroy),
                action: PlanAction::Destroy,
            });
        }
    }

    Ok(ExecutionPlan {
        target: decl.target(),
        changes,
        execution_order: dag.order().to_vec(),
        to_create,
        to_update,
        to_replace,
        to_destroy,
        unchanged,
        pending,
    })
}

/// One-line human description of a planned action.
pub fn describe_action(instance_id: &str, type_name: &str, action: &PlanAction) -> String {
    match action {
        PlanAction::Create => format!("{}: create {}", instance_id, type_name),
        PlanAction::Update => format!("{}: update {} (inputs changed)", instance_id, type_name),
        PlanAction::Replace => format!("{}: replace {} (remove, then deploy)", instance_id, type_name),
        PlanAction::Destroy => format!("{}: remove {} and its children", instance_id, type_name),
        PlanAction::NoOp => format!("{}: no changes", instance_id),
        PlanAction::Pending => format!("{}: decided after its providers settle", instance_id),
    }
}
