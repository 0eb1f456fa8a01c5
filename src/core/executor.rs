//! CP-012: Orchestrator — runs the instance lifecycle for a target.
//!
//! deploy: validate → load snapshot → DAG → remove orphans → run scope → save
//!
//! Each scope (the top-level declarations, or the children one parent
//! constructs) is scheduled independently: instances start once all of their
//! providers have settled, at most `max_concurrency` run at a time, and a
//! failure fails every transitive dependent without calling its driver.
//! Settled instances are appended to a shared accumulator that becomes the
//! next snapshot.

use super::error::{EngineError, Result};
use super::graph::{self, DependencyGraph};
use super::instance::{child_id, Instance, InstanceGraph};
use super::parser;
use super::planner;
use super::resolver::{OutputPool, Resolver};
use super::state::{self, SnapshotStore};
use super::types::*;
use crate::driver::{DriverError, Registry, RunContext};
use crate::tripwire::{eventlog, hasher};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Drives deploy, plan and teardown runs against one snapshot store.
pub struct Orchestrator {
    registry: Arc<Registry>,
    store: Arc<dyn SnapshotStore>,
    force: bool,
    event_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            registry,
            store,
            force: false,
            event_dir: None,
        }
    }

    /// Redeploy instances whose inputs did not change.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Append lifecycle events under `dir/<project>/<stage>/events.jsonl`.
    pub fn with_event_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.event_dir = Some(dir.into());
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dry run: classify every top-level instance without calling drivers.
    pub fn plan(&self, decl: &Declaration, context: &RunContext) -> Result<ExecutionPlan> {
        let previous = state::load_previous(
            self.store.as_ref(),
            &decl.target(),
            decl.policy.tolerate_corrupt_state,
        )?;
        planner::plan(
            decl,
            previous.as_ref(),
            &self.registry,
            &context.env,
            self.force,
        )
    }

    /// Bring the target in line with `decl`.
    ///
    /// Fatal errors (invalid declaration, unreadable snapshot, unknown types,
    /// cycles, unknown references) are returned before any driver is called.
    /// Past that point the snapshot is always saved and per-instance failures
    /// are reported in the returned `RunReport`.
    pub async fn deploy(&self, decl: &Declaration, context: RunContext) -> Result<RunReport> {
        let start = Instant::now();

        let errors = parser::validate_declaration(decl);
        if !errors.is_empty() {
            let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(EngineError::Validation(joined.join("; ")));
        }

        let target = decl.target();
        let previous = state::load_previous(
            self.store.as_ref(),
            &target,
            decl.policy.tolerate_corrupt_state,
        )?;

        graph::build_graph(&decl.instances)?;
        for (id, instance) in &decl.instances {
            self.registry.driver_for(id, &instance.type_name)?;
        }

        let mut context = context;
        context.target = target.clone();
        let shared = Arc::new(RunShared::new(
            self,
            context,
            previous,
            decl.policy.clone(),
        ));

        tracing::info!(%target, run_id = %shared.run_id, instances = decl.instances.len(), "deploy started");
        shared.emit(ProvenanceEvent::RunStarted {
            target: target.to_string(),
            run_id: shared.run_id.clone(),
            compositor_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        // Orphans are removed before any declared provider can be replaced.
        let orphans: Vec<String> = shared
            .previous
            .as_ref()
            .map(|prev| {
                prev.top_level()
                    .filter(|(id, _)| !decl.instances.contains_key(*id))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "removing orphaned instances");
            shared.remove_subtrees(&orphans).await;
        }

        let outcome = run_scope(Arc::clone(&shared), None, decl.instances.clone()).await;

        self.persist(&shared, &target)?;
        let report = shared.finish(start.elapsed());
        outcome.map(|_| report)
    }

    /// Tear down every instance recorded for the context's target.
    ///
    /// Instances that could not be removed stay in the saved snapshot.
    pub async fn remove_all(&self, context: RunContext) -> Result<RunReport> {
        let start = Instant::now();
        let target = context.target.clone();

        let Some(snapshot) = state::load_previous(self.store.as_ref(), &target, false)? else {
            tracing::info!(%target, "nothing recorded; nothing to remove");
            return Ok(RunReport {
                target,
                run_id: eventlog::generate_run_id(),
                instances: IndexMap::new(),
                total_duration: start.elapsed(),
            });
        };

        let roots: Vec<String> = snapshot.top_level().map(|(id, _)| id.clone()).collect();
        let shared = Arc::new(RunShared::new(
            self,
            context,
            Some(snapshot),
            Policy::default(),
        ));

        tracing::info!(%target, run_id = %shared.run_id, instances = roots.len(), "remove started");
        shared.emit(ProvenanceEvent::RunStarted {
            target: target.to_string(),
            run_id: shared.run_id.clone(),
            compositor_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        shared.remove_subtrees(&roots).await;

        self.persist(&shared, &target)?;
        Ok(shared.finish(start.elapsed()))
    }

    fn persist(&self, shared: &RunShared, target: &TargetKey) -> Result<()> {
        let snapshot = {
            let graph = shared.accumulator.lock();
            state::serialize(&graph, target)
        };
        self.store.save(target, &snapshot)
    }
}

// ============================================================================
// Deploy context
// ============================================================================

/// Handed to a driver's deploy hook.
pub struct DeployContext {
    id: String,
    shared: Arc<RunShared>,
    children: Mutex<Vec<String>>,
}

impl DeployContext {
    fn new(id: String, shared: Arc<RunShared>) -> Self {
        Self {
            id,
            shared,
            children: Mutex::new(Vec::new()),
        }
    }

    /// Full identity of the instance being deployed.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_context(&self) -> &RunContext {
        &self.shared.context
    }

    /// Identities of the children constructed so far.
    pub fn children(&self) -> Vec<String> {
        self.children.lock().clone()
    }

    /// Construct and run child instances.
    ///
    /// Children form their own scope: `${name.path}` expressions refer to
    /// sibling children by local name. Returns each child's outputs keyed by
    /// local name. Fails if any child fails.
    pub async fn compose(
        &self,
        children: IndexMap<String, InstanceDecl>,
    ) -> std::result::Result<IndexMap<String, Value>, DriverError> {
        {
            let mut constructed = self.children.lock();
            for local in children.keys() {
                let id = child_id(Some(&self.id), local);
                if constructed.contains(&id) {
                    return Err(DriverError::new(format!("child '{}' constructed twice", id)));
                }
            }
            constructed.extend(children.keys().map(|local| child_id(Some(&self.id), local)));
        }

        let scope = run_scope(Arc::clone(&self.shared), Some(self.id.clone()), children).await?;
        if !scope.failed.is_empty() {
            return Err(DriverError::new(format!(
                "child instance(s) failed: {}",
                scope.failed.join(", ")
            )));
        }
        Ok(scope.outputs)
    }
}

impl std::fmt::Debug for DeployContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployContext")
            .field("id", &self.id)
            .field("target", &self.shared.context.target)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Shared run state
// ============================================================================

/// State shared by every task of one run.
struct RunShared {
    registry: Arc<Registry>,
    context: RunContext,
    previous: Option<Snapshot>,
    policy: Policy,
    force: bool,
    run_id: String,
    event_dir: Option<PathBuf>,
    accumulator: Mutex<InstanceGraph>,
    reports: Mutex<IndexMap<String, InstanceReport>>,
    /// Recorded identities torn down during this run
    removed: Mutex<HashSet<String>>,
    /// Providers of recorded dependents that could not be removed
    pinned: Mutex<HashSet<String>>,
    log_lock: Mutex<()>,
}

impl RunShared {
    fn new(
        owner: &Orchestrator,
        context: RunContext,
        previous: Option<Snapshot>,
        policy: Policy,
    ) -> Self {
        Self {
            registry: Arc::clone(&owner.registry),
            context,
            previous,
            policy,
            force: owner.force,
            run_id: eventlog::generate_run_id(),
            event_dir: owner.event_dir.clone(),
            accumulator: Mutex::new(InstanceGraph::new()),
            reports: Mutex::new(IndexMap::new()),
            removed: Mutex::new(HashSet::new()),
            pinned: Mutex::new(HashSet::new()),
            log_lock: Mutex::new(()),
        }
    }

    /// Last recorded state of `id`, unless it was torn down this run.
    fn previous_entry(&self, id: &str) -> Option<SnapshotEntry> {
        if self.removed.lock().contains(id) {
            return None;
        }
        self.previous
            .as_ref()
            .and_then(|s| s.instances.get(id))
            .cloned()
    }

    fn emit(&self, event: ProvenanceEvent) {
        if !self.policy.event_log {
            return;
        }
        let Some(dir) = self.event_dir.as_deref() else {
            return;
        };
        let _guard = self.log_lock.lock();
        if let Err(e) = eventlog::append_event(dir, &self.context.target, event) {
            tracing::warn!(error = %e, "event log append failed");
        }
    }

    fn record(&self, id: &str, report: InstanceReport) {
        self.reports.lock().insert(id.to_string(), report);
    }

    /// Record a failed instance and return its outcome.
    fn fail(&self, id: &str, verdict: Option<Verdict>, error: String, started: Instant) -> Outcome {
        tracing::warn!(instance = %id, %error, "instance failed");
        self.emit(ProvenanceEvent::InstanceFailed {
            instance: id.to_string(),
            error: error.clone(),
        });
        self.record(
            id,
            InstanceReport {
                state: LifecycleState::Failed,
                verdict,
                removed: false,
                error: Some(error),
                duration: started.elapsed(),
            },
        );
        Outcome::Failed
    }

    /// Copy snapshot entries into the accumulator, children first. Entries
    /// already present are left alone; child lists are trimmed to what is
    /// present so the saved snapshot stays self-consistent.
    fn restore(&self, snapshot: &Snapshot, ids: &[String]) {
        let removed = self.removed.lock().clone();
        let mut graph = self.accumulator.lock();
        for id in ids {
            if graph.contains(id) || removed.contains(id) {
                continue;
            }
            let Some(entry) = snapshot.instances.get(id) else {
                continue;
            };
            let Some(factory) = self.registry.lookup(&entry.type_name) else {
                tracing::warn!(instance = %id, type_name = %entry.type_name, "dropping entry of unregistered type");
                continue;
            };
            let children = entry
                .children
                .iter()
                .filter(|c| graph.contains(c))
                .cloned()
                .collect();
            let restored = Instance {
                id: id.clone(),
                type_name: entry.type_name.clone(),
                inputs: entry.inputs.clone(),
                outputs: entry.outputs.clone(),
                children,
                dependencies: entry.dependencies.clone(),
                fingerprint: entry.fingerprint.clone(),
                driver: factory.create(),
            };
            if let Err(e) = graph.insert(restored) {
                tracing::warn!(error = %e, "could not restore entry");
            }
        }
    }

    /// Keep the last-known state of `root` and its descendants. Children
    /// constructed this run that settled are added to the root's child list.
    fn retain_previous(&self, root: &str, constructed: &[String]) {
        let Some(prev) = self.previous.as_ref() else {
            return;
        };
        if !prev.instances.contains_key(root) || self.removed.lock().contains(root) {
            return;
        }
        self.restore(prev, &state::teardown_order(prev, root));

        let mut graph = self.accumulator.lock();
        let settled: Vec<String> = constructed
            .iter()
            .filter(|c| graph.contains(c))
            .cloned()
            .collect();
        if let Some(instance) = graph.get_mut(root) {
            for child in settled {
                if !instance.children.contains(&child) {
                    instance.children.push(child);
                }
            }
        }
    }

    /// Remove `root` and its previously recorded descendants, children first.
    async fn remove_tree(&self, root: &str) -> std::result::Result<(), String> {
        match self.previous.as_ref() {
            Some(prev) => self.remove_tree_from(prev, root).await,
            None => Ok(()),
        }
    }

    /// Remove `root` and its descendants as recorded in `prev`.
    ///
    /// On the first failure the remaining entries are kept in the
    /// accumulator and the error is returned.
    async fn remove_tree_from(
        &self,
        prev: &Snapshot,
        root: &str,
    ) -> std::result::Result<(), String> {
        let order = state::teardown_order(prev, root);

        for (i, id) in order.iter().enumerate() {
            let Some(entry) = prev.instances.get(id) else {
                continue;
            };
            let started = Instant::now();
            tracing::info!(instance = %id, state = %LifecycleState::Removing, "removing");
            self.emit(ProvenanceEvent::InstanceStarted {
                instance: id.clone(),
                action: "remove".to_string(),
            });

            let result = match self.registry.driver_for(id, &entry.type_name) {
                Ok(driver) => driver
                    .remove(&self.context, id, &entry.outputs)
                    .await
                    .map_err(|e| e.message),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(()) => {
                    let duration = started.elapsed();
                    self.removed.lock().insert(id.clone());
                    self.emit(ProvenanceEvent::InstanceRemoved {
                        instance: id.clone(),
                        duration_seconds: duration.as_secs_f64(),
                    });
                    self.record(
                        id,
                        InstanceReport {
                            state: LifecycleState::Settled,
                            verdict: None,
                            removed: true,
                            error: None,
                            duration,
                        },
                    );
                }
                Err(message) => {
                    self.restore(prev, &order[i..]);
                    self.fail(id, None, message.clone(), started);
                    return Err(format!("{}: {}", id, message));
                }
            }
        }
        Ok(())
    }

    async fn remove_subtrees(&self, roots: &[String]) -> Vec<String> {
        match self.previous.as_ref() {
            Some(prev) => self.remove_subtrees_from(prev, roots).await,
            None => Vec::new(),
        }
    }

    /// Remove several subtrees recorded in `prev`, dependents before their
    /// providers.
    ///
    /// A root whose removal fails keeps its providers alive; providers outside
    /// `roots` are pinned for the rest of the run. Returns the roots that are
    /// still recorded afterwards.
    async fn remove_subtrees_from(&self, prev: &Snapshot, roots: &[String]) -> Vec<String> {
        let providers: IndexMap<String, Vec<String>> = roots
            .iter()
            .map(|id| {
                let deps = prev
                    .instances
                    .get(id)
                    .map(|e| e.dependencies.clone())
                    .unwrap_or_default();
                (id.clone(), deps)
            })
            .collect();
        let order = graph::topological_order(roots, &providers).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "recorded dependencies are cyclic; removing in recorded order");
            roots.to_vec()
        });

        let mut blocked: HashSet<String> = HashSet::new();
        let mut kept: HashSet<String> = HashSet::new();
        for id in order.iter().rev() {
            if blocked.contains(id) {
                self.restore(prev, &state::teardown_order(prev, id));
                self.fail(
                    id,
                    None,
                    "kept because a dependent could not be removed".to_string(),
                    Instant::now(),
                );
            } else if self.remove_tree_from(prev, id).await.is_ok() {
                continue;
            }
            kept.insert(id.clone());
            if let Some(deps) = providers.get(id) {
                blocked.extend(deps.iter().cloned());
            }
        }

        self.pinned
            .lock()
            .extend(blocked.into_iter().filter(|p| !providers.contains_key(p)));
        roots.iter().filter(|id| kept.contains(*id)).cloned().collect()
    }

    /// Tear down the settled children of a parent whose deploy failed and
    /// left no recorded state behind, so none of them is left without a
    /// parent entry. Children that cannot be removed are kept under
    /// `placeholder`, whose empty fingerprint forces a redeploy next run.
    async fn discard_constructed(&self, placeholder: Instance, constructed: &[String]) {
        let (source, roots) = {
            let mut graph = self.accumulator.lock();
            let roots: Vec<String> = constructed
                .iter()
                .filter(|c| graph.contains(c))
                .cloned()
                .collect();
            if roots.is_empty() {
                return;
            }
            let source = state::serialize(&graph, &self.context.target);
            for root in &roots {
                for id in graph.teardown_order(root) {
                    graph.remove(&id);
                }
            }
            (source, roots)
        };

        tracing::info!(instance = %placeholder.id, count = roots.len(), "removing children of failed instance");
        let kept = self.remove_subtrees_from(&source, &roots).await;
        if kept.is_empty() {
            return;
        }

        tracing::warn!(instance = %placeholder.id, kept = kept.len(), "recording failed instance to keep its children");
        let mut graph = self.accumulator.lock();
        let mut placeholder = placeholder;
        placeholder.children = kept.into_iter().filter(|c| graph.contains(c)).collect();
        if let Err(e) = graph.insert(placeholder) {
            tracing::warn!(error = %e, "could not record failed instance");
        }
    }

    fn finish(&self, total_duration: Duration) -> RunReport {
        let report = RunReport {
            target: self.context.target.clone(),
            run_id: self.run_id.clone(),
            instances: self.reports.lock().clone(),
            total_duration,
        };
        self.emit(ProvenanceEvent::RunCompleted {
            target: report.target.to_string(),
            run_id: report.run_id.clone(),
            deployed: report.deployed(),
            unchanged: report.unchanged(),
            removed: report.removed(),
            failed: report.failed(),
            total_seconds: total_duration.as_secs_f64(),
        });
        let target = &report.target;
        tracing::info!(
            %target,
            status = %report.status(),
            deployed = report.deployed(),
            unchanged = report.unchanged(),
            removed = report.removed(),
            failed = report.failed(),
            "run finished in {:.1}s",
            total_duration.as_secs_f64()
        );
        report
    }
}

// ============================================================================
// Scope scheduler
// ============================================================================

/// Result of one instance's lifecycle.
enum Outcome {
    Settled(Value),
    Failed,
}

/// What a spawned instance task needs.
struct InstanceJob {
    id: String,
    type_name: String,
    inputs: Value,
    dependencies: Vec<String>,
}

/// Outputs of the instances that settled in a scope, keyed by local name,
/// plus the full identities of those that failed.
struct ScopeResult {
    outputs: IndexMap<String, Value>,
    failed: Vec<String>,
}

type ScopeFuture = Pin<Box<dyn Future<Output = Result<ScopeResult>> + Send>>;

fn check_scope(
    registry: &Registry,
    parent: Option<&str>,
    decls: &IndexMap<String, InstanceDecl>,
) -> Result<()> {
    for (local, decl) in decls {
        let id = child_id(parent, local);
        if local.is_empty() || local.contains('.') || local == ENV_NAMESPACE {
            return Err(EngineError::Validation(format!(
                "invalid instance name '{}'",
                id
            )));
        }
        registry.driver_for(&id, &decl.type_name)?;
    }
    Ok(())
}

/// Mark every transitive dependent of `local` failed.
fn cascade_failure(
    shared: &RunShared,
    parent: Option<&str>,
    dag: &DependencyGraph,
    position: &HashMap<String, usize>,
    failed: &mut HashSet<String>,
    local: &str,
) {
    let mut dependents: Vec<String> = dag.transitive_dependents(local).into_iter().collect();
    dependents.sort_by_key(|d| position.get(d).copied().unwrap_or(usize::MAX));
    for dependent in dependents {
        if !failed.insert(dependent.clone()) {
            continue;
        }
        let id = child_id(parent, &dependent);
        shared.retain_previous(&id, &[]);
        shared.fail(
            &id,
            None,
            format!("dependency '{}' failed", child_id(parent, local)),
            Instant::now(),
        );
    }
}

/// Run one scope to completion. Boxed so that `compose` can recurse.
fn run_scope(
    shared: Arc<RunShared>,
    parent: Option<String>,
    decls: IndexMap<String, InstanceDecl>,
) -> ScopeFuture {
    Box::pin(async move {
        let parent = parent.as_deref();
        check_scope(&shared.registry, parent, &decls)?;
        let dag = graph::build_graph(&decls)?;

        let position: HashMap<String, usize> = decls
            .keys()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let mut waiting: HashMap<String, usize> = decls
            .keys()
            .map(|name| (name.clone(), dag.providers_of(name).len()))
            .collect();
        let mut ready: BTreeSet<usize> = decls
            .keys()
            .enumerate()
            .filter(|(_, name)| dag.providers_of(name).is_empty())
            .map(|(i, _)| i)
            .collect();

        let limit = shared.policy.max_concurrency.max(1);
        let mut pool = OutputPool::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<(String, Outcome)> = JoinSet::new();

        loop {
            while tasks.len() < limit {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                let Some((local, decl)) = decls.get_index(index) else {
                    continue;
                };
                let id = child_id(parent, local);
                tracing::debug!(instance = %id, state = %LifecycleState::Resolving, "resolving inputs");

                let resolved =
                    Resolver::new(&pool, &shared.context.env).resolve_inputs(&id, &decl.inputs);
                match resolved {
                    Ok(inputs) => {
                        let job = InstanceJob {
                            dependencies: dag
                                .providers_of(local)
                                .iter()
                                .map(|p| child_id(parent, p))
                                .collect(),
                            id,
                            type_name: decl.type_name.clone(),
                            inputs,
                        };
                        let local = local.clone();
                        let task_shared = Arc::clone(&shared);
                        tasks.spawn(async move { (local, run_instance(task_shared, job).await) });
                    }
                    Err(e) => {
                        shared.retain_previous(&id, &[]);
                        shared.fail(&id, None, e.to_string(), Instant::now());
                        failed.insert(local.clone());
                        cascade_failure(&shared, parent, &dag, &position, &mut failed, local);
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (local, outcome) = joined.map_err(|e| EngineError::Driver {
                instance: parent.unwrap_or("<root>").to_string(),
                message: format!("instance task did not complete: {}", e),
            })?;

            match outcome {
                Outcome::Settled(outputs) => {
                    pool.insert(&local, outputs);
                    for dependent in dag.dependents_of(&local) {
                        let Some(count) = waiting.get_mut(dependent) else {
                            continue;
                        };
                        *count = count.saturating_sub(1);
                        if *count == 0 && !failed.contains(dependent) {
                            if let Some(&i) = position.get(dependent) {
                                ready.insert(i);
                            }
                        }
                    }
                }
                Outcome::Failed => {
                    failed.insert(local.clone());
                    cascade_failure(&shared, parent, &dag, &position, &mut failed, &local);
                }
            }
        }

        let outputs = decls
            .keys()
            .filter_map(|name| pool.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        let mut failed: Vec<String> = failed.into_iter().collect();
        failed.sort_by_key(|name| position.get(name).copied().unwrap_or(usize::MAX));
        let failed = failed.iter().map(|name| child_id(parent, name)).collect();
        Ok(ScopeResult { outputs, failed })
    })
}

// ============================================================================
// Instance lifecycle
// ============================================================================

/// resolving → skipped | deploying | removing → settled | failed
async fn run_instance(shared: Arc<RunShared>, job: InstanceJob) -> Outcome {
    let started = Instant::now();
    let InstanceJob {
        id,
        type_name,
        inputs,
        dependencies,
    } = job;

    let driver = match shared.registry.driver_for(&id, &type_name) {
        Ok(driver) => driver,
        Err(e) => {
            shared.retain_previous(&id, &[]);
            return shared.fail(&id, None, e.to_string(), started);
        }
    };

    let fingerprint = hasher::fingerprint(&inputs);
    let previous = shared.previous_entry(&id);
    let verdict = planner::should_deploy(
        &type_name,
        &inputs,
        &fingerprint,
        previous.as_ref(),
        driver.replace_fields(),
        shared.force,
    );
    tracing::debug!(instance = %id, %verdict, "diff verdict");

    let prior_outputs = match (verdict, previous.as_ref()) {
        (Verdict::None, Some(prev)) => {
            shared.retain_previous(&id, &[]);
            shared.emit(ProvenanceEvent::InstanceSkipped {
                instance: id.clone(),
                fingerprint: fingerprint.clone(),
            });
            shared.record(
                &id,
                InstanceReport {
                    state: LifecycleState::Settled,
                    verdict: Some(Verdict::None),
                    removed: false,
                    error: None,
                    duration: started.elapsed(),
                },
            );
            tracing::info!(instance = %id, state = %LifecycleState::Skipped, "unchanged");
            return Outcome::Settled(prev.outputs.clone());
        }
        (Verdict::Replace, Some(_)) => {
            let pinned = shared.pinned.lock().contains(&id);
            if pinned {
                shared.retain_previous(&id, &[]);
                return shared.fail(
                    &id,
                    Some(verdict),
                    "cannot replace: a recorded dependent could not be removed".to_string(),
                    started,
                );
            }
            tracing::info!(instance = %id, "replacing: removing previous instance first");
            if let Err(e) = shared.remove_tree(&id).await {
                return shared.fail(
                    &id,
                    Some(verdict),
                    format!("removing previous instance: {}", e),
                    started,
                );
            }
            None
        }
        _ => previous.as_ref().map(|prev| prev.outputs.clone()),
    };
    let replaced = verdict == Verdict::Replace;

    tracing::info!(instance = %id, state = %LifecycleState::Deploying, %verdict, "deploying");
    shared.emit(ProvenanceEvent::InstanceStarted {
        instance: id.clone(),
        action: verdict.to_string(),
    });

    let ctx = DeployContext::new(id.clone(), Arc::clone(&shared));
    let result = driver.deploy(&ctx, &inputs, prior_outputs.as_ref()).await;
    let constructed = ctx.children();

    let outputs = match result {
        Ok(outputs) => outputs,
        Err(e) => {
            if !replaced {
                shared.retain_previous(&id, &constructed);
            }
            let retained = shared.accumulator.lock().contains(&id);
            if !retained {
                let placeholder = Instance {
                    id: id.clone(),
                    type_name,
                    inputs,
                    outputs: Value::Object(Default::default()),
                    children: Vec::new(),
                    dependencies,
                    fingerprint: String::new(),
                    driver,
                };
                shared.discard_constructed(placeholder, &constructed).await;
            }
            return shared.fail(&id, Some(verdict), e.message, started);
        }
    };

    // Previous children the deploy hook did not construct again.
    let stale: Vec<String> = match previous.as_ref() {
        Some(prev) if !replaced => prev
            .children
            .iter()
            .filter(|c| !constructed.contains(c))
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    let kept = shared.remove_subtrees(&stale).await;

    let inserted = {
        let mut graph = shared.accumulator.lock();
        let children: Vec<String> = constructed
            .into_iter()
            .chain(kept)
            .filter(|c| graph.contains(c))
            .collect();
        graph.insert(Instance {
            id: id.clone(),
            type_name,
            inputs,
            outputs: outputs.clone(),
            children,
            dependencies,
            fingerprint: fingerprint.clone(),
            driver,
        })
    };
    if let Err(e) = inserted {
        return shared.fail(&id, Some(verdict), e.to_string(), started);
    }

    let duration = started.elapsed();
    shared.emit(ProvenanceEvent::InstanceSettled {
        instance: id.clone(),
        verdict,
        duration_seconds: duration.as_secs_f64(),
        fingerprint,
    });
    shared.record(
        &id,
        InstanceReport {
            state: LifecycleState::Settled,
            verdict: Some(verdict),
            removed: false,
            error: None,
            duration,
        },
    );
    tracing::info!(instance = %id, state = %LifecycleState::Settled, "settled in {:.2}s", duration.as_secs_f64());
    Outcome::Settled(outputs)
}
