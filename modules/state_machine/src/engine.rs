use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use flowkit::{Callable, EventBus, JsonMap, ServiceRegistry};

use crate::definition::{HookDef, StateMachineDefinition};
use crate::error::StateMachineError;
use crate::instance::{InstanceSnapshot, TransitionRecord};
use crate::store::InstanceStore;

/// Cycle-break bound for chained `autoTransform` transitions.
const MAX_AUTO_TRANSITIONS: u32 = 64;

/// Synthetic state an instance is parked in when the auto-transition bound
/// is exceeded.
const FAILED_STATE: &str = "failed";

type InstanceCell = Arc<Mutex<InstanceSnapshot>>;

/// The state machine engine: owns definitions and live instances.
///
/// Transitions are atomic per instance — the state swap, counter increment
/// and data merge happen under the instance lock; hooks and the
/// auto-transition loop run outside it. Concurrent transitions on
/// different instances run in parallel.
pub struct StateMachineEngine {
    registry: Arc<ServiceRegistry>,
    events: EventBus,
    definitions: RwLock<HashMap<String, Arc<StateMachineDefinition>>>,
    instances: DashMap<String, InstanceCell>,
    store: RwLock<Option<Arc<dyn InstanceStore>>>,
    persistence_degraded: AtomicBool,
}

impl StateMachineEngine {
    pub fn new(registry: Arc<ServiceRegistry>, events: EventBus) -> Self {
        Self {
            registry,
            events,
            definitions: RwLock::new(HashMap::new()),
            instances: DashMap::new(),
            store: RwLock::new(None),
            persistence_degraded: AtomicBool::new(false),
        }
    }

    /// Attach a persistence adapter; every successful transition writes
    /// through it from then on.
    pub fn attach_store(&self, store: Arc<dyn InstanceStore>) {
        *self.store.write() = Some(store);
    }

    pub fn has_store(&self) -> bool {
        self.store.read().is_some()
    }

    /// True once a write-through failed after a committed transition.
    pub fn persistence_degraded(&self) -> bool {
        self.persistence_degraded.load(Ordering::Relaxed)
    }

    pub fn register_definition(
        &self,
        def: StateMachineDefinition,
    ) -> Result<(), StateMachineError> {
        def.validate()?;
        let mut definitions = self.definitions.write();
        if definitions.contains_key(&def.name) {
            return Err(StateMachineError::DuplicateDefinition(def.name));
        }
        tracing::info!(definition = %def.name, states = def.states.len(), "Registered state machine definition");
        definitions.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Option<Arc<StateMachineDefinition>> {
        self.definitions.read().get(name).cloned()
    }

    pub fn definition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create an instance in the definition's initial state.
    pub async fn new_instance(
        &self,
        definition: &str,
        initial_data: JsonMap,
    ) -> Result<String, StateMachineError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.new_instance_with_id(definition, &id, initial_data)
            .await?;
        Ok(id)
    }

    /// Create an instance with a caller-provided id (bootstrap instances,
    /// tests). Fails if the id is live; an id already persisted in the
    /// attached store is loaded instead of recreated, so configured
    /// bootstrap instances survive restarts.
    pub async fn new_instance_with_id(
        &self,
        definition: &str,
        id: &str,
        initial_data: JsonMap,
    ) -> Result<(), StateMachineError> {
        let def = self
            .definition(definition)
            .ok_or_else(|| StateMachineError::DefinitionNotFound(definition.to_string()))?;

        if !self.instances.contains_key(id) {
            if let Some(store) = self.current_store() {
                match store.load(id).await {
                    Ok(Some(existing)) => {
                        tracing::info!(
                            instance = id,
                            state = %existing.state,
                            "Bootstrap instance already persisted; keeping stored state"
                        );
                        self.instances
                            .insert(id.to_string(), Arc::new(Mutex::new(existing)));
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(instance = id, error = %e, "Store read-through failed during bootstrap");
                    }
                }
            }
        }

        let snapshot =
            InstanceSnapshot::new(id, definition, def.initial_state.clone(), initial_data);
        match self.instances.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StateMachineError::InvalidDefinition {
                    name: definition.to_string(),
                    reason: format!("instance id '{id}' already exists"),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(snapshot.clone())));
            }
        }
        self.persist(&snapshot).await;

        tracing::debug!(instance = id, definition, "Instance created");
        self.events.publish(
            "instance.created",
            serde_json::json!({ "id": id, "definition": definition, "state": def.initial_state }),
        );
        Ok(())
    }

    /// Frozen view of an instance.
    pub async fn query(&self, id: &str) -> Result<InstanceSnapshot, StateMachineError> {
        let cell = self
            .instances
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StateMachineError::InstanceNotFound(id.to_string()))?;
        let guard = cell.lock().await;
        Ok(guard.clone())
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Fire a named transition on an instance.
    ///
    /// On success the new state is committed atomically, the payload is
    /// merged into instance data, the store (if any) is written through,
    /// hooks run in declared order, a `transition` event is emitted, and
    /// any `autoTransform` chain is processed (bounded).
    pub async fn trigger(
        &self,
        id: &str,
        transition: &str,
        payload: JsonMap,
    ) -> Result<InstanceSnapshot, StateMachineError> {
        let (mut snapshot, def) = self.commit_one(id, transition, payload).await?;
        self.after_commit(&def, transition, &mut snapshot).await?;

        // Auto-transition chain, outside any lock, bounded to break cycles
        // in buggy definitions.
        let mut hops = 0u32;
        while let Some((auto_name, _)) = def.auto_transition_from(&snapshot.state) {
            let auto_name = auto_name.to_string();
            hops += 1;
            if hops > MAX_AUTO_TRANSITIONS {
                tracing::error!(
                    instance = id,
                    definition = %def.name,
                    "Auto-transition bound exceeded; failing instance"
                );
                snapshot = self.fail_instance(id, "autotransform-cycle").await?;
                break;
            }
            match self.commit_one(id, &auto_name, JsonMap::new()).await {
                Ok((next, _)) => {
                    snapshot = next;
                    self.after_commit(&def, &auto_name, &mut snapshot).await?;
                }
                Err(e) => {
                    // A concurrent trigger advanced the instance first.
                    tracing::debug!(instance = id, transition = %auto_name, error = %e, "Auto-transition skipped");
                    break;
                }
            }
        }

        Ok(snapshot)
    }

    /// Swap state, bump the counter and merge the payload under the
    /// instance lock; write through the store before releasing it so saves
    /// stay counter-ordered.
    async fn commit_one(
        &self,
        id: &str,
        transition: &str,
        payload: JsonMap,
    ) -> Result<(InstanceSnapshot, Arc<StateMachineDefinition>), StateMachineError> {
        let cell = self
            .instances
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StateMachineError::InstanceNotFound(id.to_string()))?;

        let mut guard = cell.lock().await;
        let def = self
            .definition(&guard.definition)
            .ok_or_else(|| StateMachineError::DefinitionNotFound(guard.definition.clone()))?;

        let t = def.transitions.get(transition).ok_or_else(|| {
            StateMachineError::NoSuchTransition {
                definition: def.name.clone(),
                transition: transition.to_string(),
            }
        })?;

        if t.from != guard.state {
            return Err(StateMachineError::InvalidTransition {
                transition: transition.to_string(),
                current: guard.state.clone(),
                from: t.from.clone(),
            });
        }
        if let Some(state) = def.states.get(&guard.state) {
            if state.is_terminal() {
                return Err(StateMachineError::Terminal {
                    id: id.to_string(),
                    state: guard.state.clone(),
                });
            }
        }

        let record = TransitionRecord {
            counter: guard.counter + 1,
            transition: transition.to_string(),
            from: guard.state.clone(),
            to: t.to.clone(),
            at: Utc::now(),
        };

        guard.state = t.to.clone();
        guard.counter += 1;
        for (k, v) in payload.iter() {
            guard.data.insert(k.clone(), v.clone());
        }
        guard.updated_at = record.at;
        guard.push_history(record.clone());

        let snapshot = guard.clone();
        self.persist(&snapshot).await;
        if let Some(store) = self.current_store() {
            if let Err(e) = store.record_transition(id, &record, &payload).await {
                tracing::warn!(instance = id, error = %e, "Transition log write failed");
            }
        }
        drop(guard);

        tracing::debug!(
            instance = id,
            transition,
            from = %record.from,
            to = %record.to,
            counter = record.counter,
            "Transition committed"
        );

        Ok((snapshot, def))
    }

    /// Hook invocation and the `transition` event, after the swap has
    /// committed. A hook observing current state may already see a later
    /// state than its own transition; the snapshot argument is the
    /// point-in-time view.
    async fn after_commit(
        &self,
        def: &StateMachineDefinition,
        transition: &str,
        snapshot: &mut InstanceSnapshot,
    ) -> Result<(), StateMachineError> {
        if let Some(hooks) = def.hooks.get(transition) {
            for hook in hooks {
                self.run_hook(hook, transition, snapshot).await?;
            }
        }

        let last = snapshot.history.last();
        self.events.publish(
            "transition",
            serde_json::json!({
                "instance": snapshot.id,
                "definition": snapshot.definition,
                "transition": transition,
                "from": last.map(|r| r.from.clone()),
                "to": snapshot.state,
                "counter": snapshot.counter,
            }),
        );
        Ok(())
    }

    async fn run_hook(
        &self,
        hook: &HookDef,
        transition: &str,
        snapshot: &mut InstanceSnapshot,
    ) -> Result<(), StateMachineError> {
        let mut params = match &hook.payload {
            Some(template) => {
                match flowkit::template::render_value(template, &snapshot.data) {
                    serde_json::Value::Object(map) => map,
                    other => {
                        let mut map = JsonMap::new();
                        map.insert("payload".to_string(), other);
                        map
                    }
                }
            }
            None => JsonMap::new(),
        };
        params.insert(
            "transition".to_string(),
            serde_json::Value::String(transition.to_string()),
        );
        params.insert(
            "instance".to_string(),
            serde_json::to_value(&*snapshot).unwrap_or(serde_json::Value::Null),
        );

        let callable: Arc<dyn Callable> = match self.registry.get(&hook.module) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(module = %hook.module, transition, error = %e, "Hook target not resolvable");
                if hook.propagate_failure {
                    return Err(StateMachineError::HookFailed {
                        module: hook.module.clone(),
                        transition: transition.to_string(),
                        source: e.into(),
                    });
                }
                return Ok(());
            }
        };

        if hook.detached {
            let module = hook.module.clone();
            let transition = transition.to_string();
            tokio::spawn(async move {
                if let Err(e) = callable.execute(params).await {
                    tracing::error!(module = %module, transition = %transition, error = %e, "Detached hook failed");
                }
            });
            return Ok(());
        }

        match callable.execute(params).await {
            Ok(result) => {
                if hook.contributing && !result.is_empty() {
                    self.merge_instance_data(&snapshot.id, &result).await;
                    for (k, v) in result {
                        snapshot.data.insert(k, v);
                    }
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(module = %hook.module, transition, error = %e, "Hook failed");
                if hook.propagate_failure {
                    Err(StateMachineError::HookFailed {
                        module: hook.module.clone(),
                        transition: transition.to_string(),
                        source: e,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn merge_instance_data(&self, id: &str, patch: &JsonMap) {
        if let Some(cell) = self.instances.get(id).map(|e| e.value().clone()) {
            let mut guard = cell.lock().await;
            for (k, v) in patch {
                guard.data.insert(k.clone(), v.clone());
            }
            guard.updated_at = Utc::now();
            let snapshot = guard.clone();
            drop(guard);
            self.persist(&snapshot).await;
        }
    }

    /// Park the instance in the synthetic failed state.
    async fn fail_instance(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<InstanceSnapshot, StateMachineError> {
        let cell = self
            .instances
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StateMachineError::InstanceNotFound(id.to_string()))?;
        let mut guard = cell.lock().await;
        guard.state = FAILED_STATE.to_string();
        guard
            .data
            .insert("failure_reason".to_string(), serde_json::json!(reason));
        guard.updated_at = Utc::now();
        let snapshot = guard.clone();
        drop(guard);

        self.persist(&snapshot).await;
        self.events.publish(
            "instance.failed",
            serde_json::json!({ "id": id, "reason": reason }),
        );
        Ok(snapshot)
    }

    fn current_store(&self) -> Option<Arc<dyn InstanceStore>> {
        self.store.read().clone()
    }

    /// Write-through. A failure after the in-memory commit is logged and
    /// flips the degraded flag; the in-memory truth is authoritative.
    async fn persist(&self, snapshot: &InstanceSnapshot) {
        let Some(store) = self.current_store() else {
            return;
        };
        if let Err(e) = store.save(snapshot).await {
            tracing::error!(instance = %snapshot.id, error = %e, "Instance persistence failed");
            self.persistence_degraded.store(true, Ordering::Relaxed);
            self.events.publish(
                "persistence.degraded",
                serde_json::json!({ "instance": snapshot.id, "error": e.to_string() }),
            );
        }
    }

    /// Load every persisted instance into memory. States absent from the
    /// current definition are preserved for forward compatibility and
    /// logged as warnings.
    pub async fn restore_from_store(&self) -> anyhow::Result<usize> {
        let Some(store) = self.current_store() else {
            return Ok(0);
        };

        let ids = store.list(None).await?;
        let mut restored = 0usize;
        for id in ids {
            if self.instances.contains_key(&id) {
                continue;
            }
            let Some(snapshot) = store.load(&id).await? else {
                continue;
            };
            match self.definition(&snapshot.definition) {
                Some(def) => {
                    if !def.states.contains_key(&snapshot.state) {
                        tracing::warn!(
                            instance = %id,
                            state = %snapshot.state,
                            definition = %snapshot.definition,
                            "Restored instance is in a state unknown to the current definition"
                        );
                    }
                }
                None => {
                    tracing::warn!(
                        instance = %id,
                        definition = %snapshot.definition,
                        "Restored instance references an unregistered definition"
                    );
                }
            }
            self.instances.insert(id, Arc::new(Mutex::new(snapshot)));
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(count = restored, "Restored instances from store");
        }
        Ok(restored)
    }
}

impl std::fmt::Debug for StateMachineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineEngine")
            .field("definitions", &self.definitions.read().len())
            .field("instances", &self.instances.len())
            .field("has_store", &self.has_store())
            .finish()
    }
}
