//! The server synchronizer.
//!
//! [`ServerSync`] owns the change log and the id translator of one model.
//! Local mutations flow in through the change listener and are sent with
//! every request; results coming back are merged into the graph:
//! instance data first, then conditions, then change records.
//!
//! ## Applying server changes
//!
//! Records are applied in order, except that a `Save` record found further
//! down the batch is applied first. The server writes every record with
//! persisted ids, so records that follow a save may name an entity by an
//! id the client only learns from that save. The records the save jumped
//! over are applied afterwards without being recorded into the log.
//!
//! Every mutation made while applying holds the applying latch, so none of
//! it is captured as a local change.

use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::convert::{to_wire, value_from_wire};
use crate::error::{SyncError, SyncResult};
use crate::events::{RequestKind, SyncObserver, SyncStats};
use crate::instances;
use crate::listener::{ChangeListener, ChangeSink};
use crate::loader;
use crate::resolve::{self, LazyLoadMode};
use crate::signal::Signal;
use crate::transport::{Callback, SyncTransport};
use exograph_model::{
    Entity, EntityType, GraphObserver, Model, Origin, PropertyMeta, PropertyType, Value,
};
use exograph_protocol::{
    ChangeLog, ChangeRecord, ChangeSet, ConditionData, Conditions, EntityRef, EventRequest,
    IdChange, Query, QueryRequest, RoundtripRequest, SaveRequest, ServerResult, Translator,
    WireItem,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Synchronizes one model with the server.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct ServerSync {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    ctx: Arc<SyncContext>,
    config: SyncConfig,
    log: Mutex<ChangeLog>,
    exclusions: RwLock<HashSet<u64>>,
    capture_registered: AtomicBool,
    pending_requests: AtomicUsize,
    conditions: RwLock<HashMap<String, Vec<ConditionData>>>,
    observers: RwLock<Vec<Arc<dyn SyncObserver>>>,
    stats: RwLock<SyncStats>,
    model_observers: Vec<Arc<dyn GraphObserver>>,
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        for observer in &self.model_observers {
            self.ctx.model.remove_observer(observer);
        }
    }
}

impl ChangeSink for SyncInner {
    fn capture(&self, change: ChangeRecord) {
        if self.ctx.is_applying() {
            return;
        }
        let added = self.log.lock().add(change.clone());
        match added {
            Ok(seq) => {
                debug!(seq, kind = change.kind().as_str(), "change captured");
                self.stats.write().changes_captured += 1;
                let observers = self.observers.read().clone();
                for observer in observers {
                    observer.change_captured(&change);
                }
            }
            Err(e) => error!(error = %e, "could not record change"),
        }
    }
}

/// Turns pre-existing entities discovered after the context loaded into
/// ghosts, so their data is fetched on first use.
struct RegistrationCapture {
    sync: Weak<SyncInner>,
}

impl GraphObserver for RegistrationCapture {
    fn entity_registered(&self, entity: &Entity) {
        if let Some(sync) = self.sync.upgrade() {
            if sync.capture_registered.load(Ordering::SeqCst)
                && !sync.ctx.is_applying()
                && !entity.is_new()
                && entity.entity_type().origin() == Origin::Server
            {
                sync.ctx.model.mark_unloaded(entity);
            }
        }
    }
}

impl ServerSync {
    /// Creates a synchronizer for `model` and starts tracking its changes.
    pub fn new(model: Arc<Model>, transport: impl SyncTransport + 'static, config: SyncConfig) -> Self {
        let ctx = SyncContext::new(model, Arc::new(transport), config.default_paths.clone());
        let mut log = ChangeLog::new();
        log.start(&config.client_source);

        let inner = Arc::new_cyclic(|weak: &Weak<SyncInner>| {
            let sink: Weak<dyn ChangeSink> = weak.clone();
            let model_observers: Vec<Arc<dyn GraphObserver>> = vec![
                ctx.observer(),
                Arc::new(ChangeListener::new(sink)),
                Arc::new(RegistrationCapture { sync: weak.clone() }),
            ];
            SyncInner {
                ctx: Arc::clone(&ctx),
                config,
                log: Mutex::new(log),
                exclusions: RwLock::new(HashSet::new()),
                capture_registered: AtomicBool::new(false),
                pending_requests: AtomicUsize::new(0),
                conditions: RwLock::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
                stats: RwLock::new(SyncStats::default()),
                model_observers,
            }
        });
        for observer in &inner.model_observers {
            ctx.model.add_observer(Arc::clone(observer));
        }
        Self { inner }
    }

    /// Returns the synchronized model.
    pub fn model(&self) -> &Arc<Model> {
        &self.inner.ctx.model
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Adds an observer.
    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Removes an observer previously added.
    pub fn remove_observer(&self, observer: &Arc<dyn SyncObserver>) {
        self.inner
            .observers
            .write()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn observers(&self) -> Vec<Arc<dyn SyncObserver>> {
        self.inner.observers.read().clone()
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Returns true while server changes are being applied.
    pub fn is_applying_changes(&self) -> bool {
        self.inner.ctx.is_applying()
    }

    /// Makes pre-existing entities registered from now on load lazily.
    pub fn enable_capture_registered(&self) {
        self.inner.capture_registered.store(true, Ordering::SeqCst);
    }

    /// Returns true once registered entities are captured as ghosts.
    pub fn is_capturing_registered(&self) -> bool {
        self.inner.capture_registered.load(Ordering::SeqCst)
    }

    /// Returns the number of requests in flight.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending_requests.load(Ordering::SeqCst)
    }

    /// Returns true while any request is in flight.
    pub fn is_busy(&self) -> bool {
        self.pending_requests() > 0
    }

    /// Returns a copy of the id translator.
    pub fn translator(&self) -> Translator {
        self.inner.ctx.translator.read().clone()
    }

    /// Returns a copy of the change log.
    pub fn change_log(&self) -> ChangeLog {
        self.inner.log.lock().clone()
    }

    /// Returns the conditions last reported by the server for `code`.
    pub fn conditions(&self, code: &str) -> Vec<ConditionData> {
        self.inner
            .conditions
            .read()
            .get(code)
            .cloned()
            .unwrap_or_default()
    }

    fn apply_conditions(&self, conditions: &Conditions) {
        if conditions.is_empty() {
            return;
        }
        let mut stored = self.inner.conditions.write();
        for (code, list) in conditions {
            debug!(code = %code, count = list.len(), "conditions received");
            stored.insert(code.clone(), list.clone());
        }
    }

    // ------------------------------------------------------------------
    // Save eligibility
    // ------------------------------------------------------------------

    /// Serializes pending changes, only the save-eligible ones unless
    /// `include_all` is set.
    pub fn changes(&self, include_all: bool) -> Vec<ChangeSet> {
        let log = self.change_log();
        log.serialize(|change| include_all || self.can_save(change))
    }

    /// Returns true if `entity` has not been excluded from saving.
    pub fn can_save_object(&self, entity: &Entity) -> bool {
        !self.inner.exclusions.read().contains(&entity.uid())
    }

    /// Includes `entity` in saves again.
    pub fn enable_save(&self, entity: &Entity) {
        self.inner.exclusions.write().remove(&entity.uid());
    }

    /// Excludes `entity` and every change referencing it from saves.
    pub fn disable_save(&self, entity: &Entity) {
        self.inner.exclusions.write().insert(entity.uid());
    }

    /// Returns true if `change` may be sent with a save.
    ///
    /// References to unknown types or unregistered entities never make a
    /// change ineligible.
    pub fn can_save(&self, change: &ChangeRecord) -> bool {
        let saveable = |r: &EntityRef| match self.inner.ctx.find(&r.type_name, &r.id) {
            Some(entity) => self.can_save_object(&entity),
            None => true,
        };
        match change {
            ChangeRecord::ListChange {
                instance,
                added,
                removed,
                ..
            } => {
                if !saveable(instance) {
                    return false;
                }
                let mut items = added.iter().chain(removed.iter()).peekable();
                items.peek().is_none()
                    || items.any(|item| item.as_entity().map_or(true, saveable))
            }
            _ => change.entity_refs().into_iter().all(saveable),
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    fn request<S, A>(&self, kind: RequestKind, send: S, after_apply: A, done: Callback<ServerResult>)
    where
        S: FnOnce(&dyn SyncTransport, Callback<ServerResult>),
        A: FnOnce(&ServerSync, u64) + Send + 'static,
    {
        self.inner.pending_requests.fetch_add(1, Ordering::SeqCst);
        self.inner.stats.write().requests_started += 1;
        for observer in self.observers() {
            observer.request_begin(kind);
        }
        debug!(kind = kind.as_str(), "request sent");

        let sync = self.clone();
        send(
            self.inner.ctx.transport.as_ref(),
            Box::new(move |result| match result {
                Ok(result) => {
                    let before = sync.inner.log.lock().last_seq();
                    let finisher = sync.clone();
                    sync.handle_result(
                        result,
                        Box::new(move |applied| {
                            match &applied {
                                Ok(result) => {
                                    after_apply(&finisher, before);
                                    for observer in finisher.observers() {
                                        observer.request_succeeded(kind, result);
                                    }
                                }
                                Err(e) => finisher.request_failed(kind, e),
                            }
                            finisher.request_end(kind);
                            done(applied);
                        }),
                    );
                }
                Err(e) => {
                    sync.request_failed(kind, &e);
                    sync.request_end(kind);
                    done(Err(e));
                }
            }),
        );
    }

    fn request_failed(&self, kind: RequestKind, e: &SyncError) {
        warn!(kind = kind.as_str(), error = %e, "request failed");
        {
            let mut stats = self.inner.stats.write();
            stats.requests_failed += 1;
            stats.last_error = Some(e.to_string());
        }
        for observer in self.observers() {
            observer.request_failed(kind, e);
        }
    }

    fn request_end(&self, kind: RequestKind) {
        self.inner.pending_requests.fetch_sub(1, Ordering::SeqCst);
        for observer in self.observers() {
            observer.request_end(kind);
        }
    }

    /// Applies a server result: instance data, then conditions, then changes.
    fn handle_result(&self, result: ServerResult, done: Callback<ServerResult>) {
        self.remap_ids(&result.changes);
        let sync = self.clone();
        instances::apply_instances(
            &self.inner.ctx,
            result.instances.clone(),
            Box::new(move |applied| {
                if let Err(e) = applied {
                    return done(Err(e));
                }
                sync.apply_conditions(&result.conditions);
                let source = sync.inner.config.server_source.clone();
                let changes = result.changes.clone();
                sync.apply_changes(changes, Some(&source), move |applied| {
                    done(applied.map(|_| result));
                });
            }),
        );
    }

    /// Applies the id changes of a result's `Save` records ahead of its
    /// instance data, which already names saved entities by their new ids.
    /// Remaps for entities not registered locally wait for the record itself.
    fn remap_ids(&self, changes: &[ChangeRecord]) {
        for change in changes {
            let ChangeRecord::Save { id_changes } = change else {
                continue;
            };
            for id_change in id_changes {
                let model = &self.inner.ctx.model;
                if model.get(&id_change.type_name, &id_change.old_id).is_none() {
                    continue;
                }
                if let Some(ty) = model.ty(&id_change.type_name) {
                    self.apply_id_change(&ty, id_change);
                }
            }
        }
    }

    /// Raises a server event on `target`.
    ///
    /// Entity arguments are sent as references. Pending changes go along,
    /// only the save-eligible ones unless `include_all` is set.
    pub fn raise_server_event<F>(
        &self,
        name: &str,
        target: &Entity,
        args: Vec<(String, Value)>,
        include_all: bool,
        paths: Vec<String>,
        done: F,
    ) where
        F: FnOnce(SyncResult<ServerResult>) + Send + 'static,
    {
        let request = EventRequest {
            event_name: name.to_string(),
            target: target.to_ref(),
            event_args: args
                .iter()
                .map(|(key, value)| (key.clone(), to_wire(value)))
                .collect(),
            paths,
            changes: self.changes(include_all),
        };
        self.request(
            RequestKind::Event,
            move |transport, cb| transport.raise_event(request, cb),
            |_, _| {},
            Box::new(done),
        );
    }

    /// Sends pending changes and applies whatever the server reports back.
    pub fn roundtrip<F>(&self, done: F)
    where
        F: FnOnce(SyncResult<ServerResult>) + Send + 'static,
    {
        let request = RoundtripRequest {
            changes: self.changes(self.inner.config.roundtrip_includes_all_changes),
        };
        self.request(
            RequestKind::Roundtrip,
            move |transport, cb| transport.roundtrip(request, cb),
            |_, _| {},
            Box::new(done),
        );
    }

    /// Saves every pending change, rooted at `root`.
    ///
    /// On success the id remapping is applied and the log drops the
    /// save-eligible changes that were sent or produced by the save.
    /// Changes made while the save was in flight stay pending.
    pub fn save<F>(&self, root: &Entity, done: F)
    where
        F: FnOnce(SyncResult<ServerResult>) + Send + 'static,
    {
        let (watermark, changes) = {
            let log = self.inner.log.lock();
            (log.last_seq(), log.serialize_all())
        };
        let request = SaveRequest {
            root: root.to_ref(),
            changes,
        };
        self.request(
            RequestKind::Save,
            move |transport, cb| transport.save(request, cb),
            move |sync, before| sync.truncate_saved(watermark, before),
            Box::new(done),
        );
    }

    fn truncate_saved(&self, watermark: u64, before: u64) {
        let mut log = self.inner.log.lock();
        let after = log.last_seq();
        let removed = log.truncate(|entry| {
            let persisted = entry.seq <= watermark || (entry.seq > before && entry.seq <= after);
            persisted && self.can_save(&entry.record)
        });
        log.start(&self.inner.config.client_source);
        drop(log);
        debug!(removed, "log truncated after save");
        self.inner.stats.write().saves_completed += 1;
    }

    /// Runs the initial queries, applies their result and then starts
    /// treating newly registered pre-existing entities as ghosts.
    pub fn load_context<F>(&self, queries: Vec<Query>, done: F)
    where
        F: FnOnce(SyncResult<ServerResult>) + Send + 'static,
    {
        let request = QueryRequest {
            queries,
            changes: self.changes(false),
        };
        self.request(
            RequestKind::Context,
            move |transport, cb| transport.query(request, cb),
            |sync, _| sync.enable_capture_registered(),
            Box::new(done),
        );
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    /// Undoes up to `steps` changes (all of them if `None`), newest first.
    ///
    /// Returns the number of changes undone. New entities stay registered
    /// when their creation is rolled back.
    pub fn rollback(&self, steps: Option<usize>) -> usize {
        let _applying = self.inner.ctx.applying();
        let mut undone = 0;
        while steps.map_or(true, |steps| undone < steps) {
            let change = self.inner.log.lock().undo();
            let Some(change) = change else { break };
            if let Err(e) = self.undo_change(&change) {
                warn!(kind = change.kind().as_str(), error = %e, "could not roll back change");
            }
            undone += 1;
        }
        self.inner.stats.write().changes_rolled_back += undone as u64;
        debug!(undone, "rolled back");
        undone
    }

    fn undo_change(&self, change: &ChangeRecord) -> SyncResult<()> {
        let ctx = &self.inner.ctx;
        match change {
            ChangeRecord::InitNew { .. } | ChangeRecord::Save { .. } => Ok(()),
            ChangeRecord::ValueChange {
                instance,
                property,
                old_value,
                ..
            } => {
                let entity = self.find_local(instance)?;
                let prop = ctx.model.property(&entity, property)?;
                let old = value_from_wire(old_value, value_type(&prop));
                Ok(ctx.model.set_value(&entity, property, old)?)
            }
            ChangeRecord::ReferenceChange {
                instance,
                property,
                old_value,
                ..
            } => {
                let entity = self.find_local(instance)?;
                let old = match old_value {
                    Some(r) => Value::Entity(self.find_local(r)?),
                    None => Value::Null,
                };
                Ok(ctx.model.set_value(&entity, property, old)?)
            }
            ChangeRecord::ListChange {
                instance,
                property,
                added,
                removed,
            } => {
                let entity = self.find_local(instance)?;
                let prop = ctx.model.property(&entity, property)?;
                let restore = self.local_items(&prop, removed);
                let discard = self.local_items(&prop, added);
                Ok(ctx.model.change_list(&entity, property, restore, discard)?)
            }
        }
    }

    fn find_local(&self, r: &EntityRef) -> SyncResult<Entity> {
        self.inner
            .ctx
            .find(&r.type_name, &r.id)
            .ok_or_else(|| SyncError::unresolved(&r.type_name, &r.id))
    }

    fn local_items(&self, prop: &PropertyMeta, items: &[WireItem]) -> Vec<Value> {
        items
            .iter()
            .filter_map(|item| match item {
                WireItem::Entity(r) => match self.find_local(r) {
                    Ok(entity) => Some(Value::Entity(entity)),
                    Err(e) => {
                        warn!(error = %e, "list item not found");
                        None
                    }
                },
                WireItem::Value(json) => Some(value_from_wire(json, value_type(prop))),
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Applying server changes
    // ------------------------------------------------------------------

    /// Applies change records received from the server.
    ///
    /// The records are recorded under a change set labeled `source` (the
    /// configured server source if `None`); local recording resumes under
    /// the client source afterwards. A record that cannot be applied is
    /// logged and skipped; the batch always completes.
    pub fn apply_changes<F>(&self, changes: Vec<ChangeRecord>, source: Option<&str>, done: F)
    where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        if changes.is_empty() {
            return done(Ok(()));
        }
        let source = source.unwrap_or(self.inner.config.server_source.as_str());
        debug!(count = changes.len(), source, "applying changes");
        self.inner.log.lock().start(source);

        let run = Arc::new(ApplyRun {
            sync: self.clone(),
            state: Mutex::new(RunState {
                queue: changes.into(),
                ignore_count: 0,
                applied: 0,
                skipped: 0,
            }),
            signal: Signal::new("apply_changes"),
            done: Mutex::new(Some(Box::new(done))),
        });
        run.run();
    }

    fn apply_record(&self, record: ChangeRecord, done: Callback<()>) {
        match record {
            ChangeRecord::InitNew { instance } => self.apply_init(instance, done),
            ChangeRecord::ReferenceChange {
                instance,
                property,
                new_value,
                ..
            } => self.apply_ref(instance, property, new_value, done),
            ChangeRecord::ValueChange {
                instance,
                property,
                new_value,
                ..
            } => self.apply_val(instance, property, new_value, done),
            ChangeRecord::ListChange {
                instance,
                property,
                added,
                removed,
            } => self.apply_list(instance, property, added, removed, done),
            ChangeRecord::Save { id_changes } => self.apply_save(id_changes, done),
        }
    }

    fn apply_init(&self, instance: EntityRef, done: Callback<()>) {
        let sync = self.clone();
        resolve::try_get_type(
            &self.inner.ctx,
            &instance.type_name,
            true,
            Box::new(move |result| {
                let created = result.and_then(|ty| sync.create_for_server(&ty, &instance.id));
                done(created);
            }),
        );
    }

    fn create_for_server(&self, ty: &Arc<EntityType>, server_id: &str) -> SyncResult<()> {
        let ctx = &self.inner.ctx;
        if ctx.find(ty.name(), server_id).is_some() {
            return Ok(());
        }
        let _applying = ctx.applying();
        let server_old_id = ctx
            .translator
            .read()
            .forward(ty.name(), server_id)
            .unwrap_or(server_id)
            .to_string();
        let entity = ctx.model.create(ty.name())?;
        ctx.translator
            .write()
            .add(ty.name(), &entity.id(), &server_old_id, false);
        Ok(())
    }

    fn apply_ref(
        &self,
        instance: EntityRef,
        property: String,
        new_value: Option<EntityRef>,
        done: Callback<()>,
    ) {
        let sync = self.clone();
        let name = property.clone();
        self.with_target(
            &instance,
            &name,
            Box::new(move |entity: Entity, done: Callback<()>| {
                let Some(target) = new_value else {
                    return done(sync.set_applied(&entity, &property, Value::Null));
                };
                let setter = sync.clone();
                resolve::try_get_entity(
                    &sync.inner.ctx,
                    &target.type_name,
                    &target.id,
                    None,
                    LazyLoadMode::Force,
                    Box::new(move |result| {
                        done(result.and_then(|value| {
                            setter.set_applied(&entity, &property, Value::Entity(value))
                        }))
                    }),
                );
            }),
            done,
        );
    }

    fn apply_val(&self, instance: EntityRef, property: String, new_value: Json, done: Callback<()>) {
        let sync = self.clone();
        let name = property.clone();
        self.with_target(
            &instance,
            &name,
            Box::new(move |entity: Entity, done: Callback<()>| {
                let applied = sync
                    .inner
                    .ctx
                    .model
                    .property(&entity, &property)
                    .map_err(SyncError::from)
                    .and_then(|prop| {
                        let value = value_from_wire(&new_value, value_type(&prop));
                        sync.set_applied(&entity, &property, value)
                    });
                done(applied);
            }),
            done,
        );
    }

    fn apply_list(
        &self,
        instance: EntityRef,
        property: String,
        added: Vec<WireItem>,
        removed: Vec<WireItem>,
        done: Callback<()>,
    ) {
        let sync = self.clone();
        let name = property.clone();
        let label = format!("{}.{}", instance.key(), property);
        self.with_target(
            &instance,
            &name,
            Box::new(move |entity: Entity, done: Callback<()>| {
                let prop = match sync.inner.ctx.model.property(&entity, &property) {
                    Ok(prop) => prop,
                    Err(e) => return done(Err(e.into())),
                };
                let items = Signal::new(label);
                let added = sync.resolve_items(&prop, added, &items);
                let removed = sync.resolve_items(&prop, removed, &items);
                items.wait_for_all(move || {
                    let added = collect_items(&added);
                    let removed = collect_items(&removed);
                    done(sync.change_list_applied(&entity, &prop, added, removed));
                });
            }),
            done,
        );
    }

    /// Resolves list items, waiting for in-flight work on each referenced
    /// entity to settle. Unresolvable items are logged and left out.
    fn resolve_items(
        &self,
        prop: &PropertyMeta,
        items: Vec<WireItem>,
        signal: &Signal,
    ) -> Arc<Mutex<Vec<Option<Value>>>> {
        let slots = Arc::new(Mutex::new(vec![None; items.len()]));
        for (index, item) in items.into_iter().enumerate() {
            match item {
                WireItem::Value(json) => {
                    slots.lock()[index] = Some(value_from_wire(&json, value_type(prop)));
                }
                WireItem::Entity(r) => {
                    signal.pending();
                    let ctx = Arc::clone(&self.inner.ctx);
                    let slots = Arc::clone(&slots);
                    let signal = signal.clone();
                    let key = r.key();
                    resolve::try_get_entity(
                        &self.inner.ctx,
                        &r.type_name,
                        &r.id,
                        None,
                        LazyLoadMode::Force,
                        Box::new(move |result| match result {
                            Ok(entity) => {
                                let fill = move || {
                                    slots.lock()[index] = Some(Value::Entity(entity));
                                    signal.done();
                                };
                                match ctx.active_entity_signal(&key) {
                                    Some(active) => active.wait_for_all(fill),
                                    None => fill(),
                                }
                            }
                            Err(e) => {
                                error!(item = %key, error = %e, "could not resolve list item");
                                signal.done();
                            }
                        }),
                    );
                }
            }
        }
        slots
    }

    fn change_list_applied(
        &self,
        entity: &Entity,
        prop: &PropertyMeta,
        added: Vec<Value>,
        removed: Vec<Value>,
    ) -> SyncResult<()> {
        let model = &self.inner.ctx.model;
        let _applying = self.inner.ctx.applying();
        let current = model.list(entity, &prop.name)?.unwrap_or_default();
        let mut to_add: Vec<Value> = Vec::with_capacity(added.len());
        for item in added {
            if !current.contains(&item) && !to_add.contains(&item) {
                to_add.push(item);
            }
        }
        Ok(model.change_list(entity, &prop.name, to_add, removed)?)
    }

    fn apply_save(&self, id_changes: Vec<IdChange>, done: Callback<()>) {
        let signal = Signal::new("apply_save");
        for change in id_changes {
            let sync = self.clone();
            let type_name = change.type_name.clone();
            resolve::try_get_type(
                &self.inner.ctx,
                &type_name,
                true,
                Box::new(signal.pending_callback(move |result: SyncResult<Arc<EntityType>>| {
                    match result {
                        Ok(ty) => sync.apply_id_change(&ty, &change),
                        Err(e) => error!(type_name = %change.type_name, error = %e, "could not apply id change"),
                    }
                })),
            );
        }
        signal.wait_for_all(move || done(Ok(())));
    }

    fn apply_id_change(&self, ty: &Arc<EntityType>, change: &IdChange) {
        let ctx = &self.inner.ctx;
        let type_name = ty.name();
        let remapped = ctx.translator.read().forward(type_name, &change.old_id) == Some(change.new_id.as_str());
        if remapped && ctx.model.get(type_name, &change.new_id).is_some() {
            trace!(type_name, new_id = %change.new_id, "id change already applied");
            return;
        }
        let client_old_id = if ctx.model.get(type_name, &change.old_id).is_some() {
            change.old_id.clone()
        } else {
            ctx.translator
                .read()
                .reverse(type_name, &change.old_id)
                .unwrap_or(change.old_id.as_str())
                .to_string()
        };

        let Some(entity) = ctx.model.get(type_name, &client_old_id) else {
            ctx.translator
                .write()
                .add(type_name, &change.new_id, &change.old_id, true);
            return;
        };

        {
            let _applying = ctx.applying();
            if let Err(e) = ctx.model.change_id(&entity, &change.new_id) {
                error!(entity = ?entity, new_id = %change.new_id, error = %e, "could not change id");
                return;
            }
            entity.set_new(false);
        }
        ctx.translator
            .write()
            .add(type_name, &client_old_id, &change.new_id, true);

        let root = ty.root_name().to_string();
        let same_root = |name: &str| ctx.model.ty(name).is_some_and(|t| t.root_name() == root);
        self.inner.log.lock().for_each_record_mut(|record| {
            record.for_each_ref_mut(|r| {
                if r.id == client_old_id && same_root(&r.type_name) {
                    r.id = change.new_id.clone();
                    r.is_new = false;
                }
            });
        });
        debug!(type_name, old_id = %client_old_id, new_id = %change.new_id, "id changed");
    }

    /// Resolves the entity a change targets and runs `mutate` on it.
    ///
    /// `Force` modes load the target as configured. Under
    /// [`LazyLoadMode::None`] nothing is loaded: a registered entity takes
    /// scalar values even if it is a ghost, while a missing entity or an
    /// uninitialized list gets the change once it becomes available. The
    /// record completes as soon as that wait is registered.
    fn with_target(&self, instance: &EntityRef, property: &str, mutate: Mutation, done: Callback<()>) {
        let ctx = Arc::clone(&self.inner.ctx);
        let mode = self.inner.config.apply_load_mode;
        if mode != LazyLoadMode::None {
            return resolve::try_get_entity(
                &ctx,
                &instance.type_name,
                &instance.id,
                Some(property),
                mode,
                Box::new(move |result| match result {
                    Ok(entity) => mutate(entity, done),
                    Err(e) => done(Err(e)),
                }),
            );
        }

        let type_name = instance.type_name.clone();
        let instance = instance.clone();
        let property = property.to_string();
        let resolver = Arc::clone(&ctx);
        resolve::try_get_type(
            &ctx,
            &type_name,
            true,
            Box::new(move |result| {
                let ty = match result {
                    Ok(ty) => ty,
                    Err(e) => return done(Err(e)),
                };
                match resolver.find(ty.name(), &instance.id) {
                    Some(entity)
                        if entity.is_available(Some(property.as_str()))
                            || !is_list_property(&entity, &property) =>
                    {
                        mutate(entity, done)
                    }
                    _ => {
                        debug!(instance = %instance, property = %property, "target not available, change deferred");
                        let key = instance.key();
                        resolver.wait_for_entity(
                            ty.name(),
                            &instance.id,
                            Some(property),
                            Box::new(move |entity| {
                                mutate(
                                    entity,
                                    Box::new(move |applied| {
                                        if let Err(e) = applied {
                                            error!(instance = %key, error = %e, "deferred change failed");
                                        }
                                    }),
                                )
                            }),
                        );
                        done(Ok(()))
                    }
                }
            }),
        );
    }

    fn set_applied(&self, entity: &Entity, property: &str, value: Value) -> SyncResult<()> {
        let _applying = self.inner.ctx.applying();
        Ok(self.inner.ctx.model.set_value(entity, property, value)?)
    }

    /// Rewrites a record's references to the ids the client knows.
    fn localize(&self, mut record: ChangeRecord) -> ChangeRecord {
        record.for_each_ref_mut(|r| {
            if let Some(entity) = self.inner.ctx.find(&r.type_name, &r.id) {
                r.id = entity.id();
                r.is_new = entity.is_new();
            }
        });
        record
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Resolves a type name, fetching it when `force_load` is set and
    /// waiting for it to be defined otherwise.
    pub fn try_get_type<F>(&self, type_name: &str, force_load: bool, done: F)
    where
        F: FnOnce(SyncResult<Arc<EntityType>>) + Send + 'static,
    {
        resolve::try_get_type(&self.inner.ctx, type_name, force_load, Box::new(done));
    }

    /// Resolves a server `(type, id)` reference to a live entity.
    pub fn try_get_entity<F>(
        &self,
        type_name: &str,
        id: &str,
        property: Option<&str>,
        mode: LazyLoadMode,
        done: F,
    ) where
        F: FnOnce(SyncResult<Entity>) + Send + 'static,
    {
        resolve::try_get_entity(&self.inner.ctx, type_name, id, property, mode, Box::new(done));
    }

    /// Loads `entity`, or one of its properties, if it is not available yet.
    pub fn ensure_loaded<F>(&self, entity: &Entity, property: Option<&str>, done: F)
    where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        loader::ensure_loaded(&self.inner.ctx, entity, property, Box::new(done));
    }
}

impl std::fmt::Debug for ServerSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSync")
            .field("pending_requests", &self.pending_requests())
            .field("applying", &self.is_applying_changes())
            .field("changes", &self.inner.log.lock().len())
            .finish()
    }
}

fn value_type(prop: &PropertyMeta) -> Option<exograph_model::ValueType> {
    match prop.property_type {
        PropertyType::Value(value_type) => Some(value_type),
        PropertyType::Entity(_) => None,
    }
}

/// A change to run against its resolved target entity.
type Mutation = Box<dyn FnOnce(Entity, Callback<()>) + Send>;

fn is_list_property(entity: &Entity, property: &str) -> bool {
    entity
        .entity_type()
        .property(property)
        .is_some_and(|p| p.is_list)
}

fn collect_items(slots: &Mutex<Vec<Option<Value>>>) -> Vec<Value> {
    slots.lock().iter().flatten().cloned().collect()
}

/// One `apply_changes` batch in progress.
struct ApplyRun {
    sync: ServerSync,
    state: Mutex<RunState>,
    signal: Signal,
    done: Mutex<Option<Callback<()>>>,
}

struct RunState {
    queue: VecDeque<ChangeRecord>,
    ignore_count: usize,
    applied: usize,
    skipped: usize,
}

impl ApplyRun {
    /// Picks the next record. The flag is set for records a save jumped
    /// over; those are applied but not recorded.
    fn take_next(&self) -> Option<(ChangeRecord, bool)> {
        let mut state = self.state.lock();
        if state.ignore_count > 0 {
            let record = state.queue.pop_front()?;
            state.ignore_count -= 1;
            return Some((record, true));
        }
        if let Some(index) = state.queue.iter().position(ChangeRecord::is_save) {
            if index > 0 {
                let save = state.queue.remove(index)?;
                state.ignore_count = index;
                return Some((save, false));
            }
        }
        state.queue.pop_front().map(|record| (record, false))
    }

    fn run(self: Arc<Self>) {
        while let Some((record, jumped)) = self.take_next() {
            if record.is_save() {
                // Everything started so far settles before ids change.
                let run = Arc::clone(&self);
                self.signal.wait_for_all(move || {
                    let sync = run.sync.clone();
                    sync.apply_record(
                        record.clone(),
                        Box::new(move |result| {
                            run.settle(record, jumped, result);
                            run.run();
                        }),
                    );
                });
                return;
            }
            self.signal.pending();
            let run = Arc::clone(&self);
            self.sync.apply_record(
                record.clone(),
                Box::new(move |result| {
                    run.settle(record, jumped, result);
                    run.signal.done();
                }),
            );
        }
        let run = Arc::clone(&self);
        self.signal.wait_for_all(move || run.finish());
    }

    fn settle(&self, record: ChangeRecord, jumped: bool, result: SyncResult<()>) {
        match result {
            Ok(()) => {
                if !jumped {
                    let record = self.sync.localize(record);
                    if let Err(e) = self.sync.inner.log.lock().add(record) {
                        error!(error = %e, "could not record applied change");
                    }
                }
                self.state.lock().applied += 1;
            }
            Err(e) => {
                error!(kind = record.kind().as_str(), instance = ?record.instance(), error = %e, "change skipped");
                self.state.lock().skipped += 1;
            }
        }
    }

    fn finish(&self) {
        let inner = &self.sync.inner;
        inner.log.lock().start(&inner.config.client_source);
        let (applied, skipped) = {
            let state = self.state.lock();
            (state.applied, state.skipped)
        };
        {
            let mut stats = inner.stats.write();
            stats.changes_applied += applied as u64;
            stats.changes_skipped += skipped as u64;
        }
        debug!(applied, skipped, "changes applied");
        for observer in self.sync.observers() {
            observer.changes_applied(applied, skipped);
        }
        let done = self.done.lock().take();
        if let Some(done) = done {
            done(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, Operation};
    use exograph_model::ValueType;
    use exograph_protocol::{ChangeKind, ConditionTarget};
    use serde_json::json;

    fn model() -> Arc<Model> {
        let model = Arc::new(Model::new());
        let car = model
            .define_type(
                EntityType::builder("Car")
                    .property(PropertyMeta::value("Model", ValueType::String))
                    .build(),
            )
            .unwrap();
        model
            .define_type(
                EntityType::builder("Driver")
                    .property(PropertyMeta::value("Name", ValueType::String))
                    .property(PropertyMeta::value("Age", ValueType::Integer))
                    .property(PropertyMeta::reference("Car", car.name()))
                    .property(PropertyMeta::reference("Cars", car.name()).list())
                    .build(),
            )
            .unwrap();
        model
    }

    fn sync_with(transport: Arc<MockTransport>) -> ServerSync {
        ServerSync::new(model(), transport, SyncConfig::default())
    }

    fn kinds(sync: &ServerSync) -> Vec<ChangeKind> {
        sync.change_log().entries().map(|e| e.record.kind()).collect()
    }

    #[test]
    fn local_changes_are_captured() {
        let sync = sync_with(Arc::new(MockTransport::new()));
        let driver = sync.model().create("Driver").unwrap();
        sync.model().set_value(&driver, "Name", "Ann".into()).unwrap();
        assert_eq!(kinds(&sync), vec![ChangeKind::InitNew, ChangeKind::ValueChange]);
        assert_eq!(sync.stats().changes_captured, 2);
    }

    #[test]
    fn applied_changes_are_not_captured() {
        let sync = sync_with(Arc::new(MockTransport::new()));
        let driver = sync.model().create("Driver").unwrap();
        let before = sync.change_log().len();

        sync.apply_changes(
            vec![ChangeRecord::value_change(driver.to_ref(), "Name", json!(null), json!("Bo"))],
            None,
            |r| r.unwrap(),
        );
        assert_eq!(
            sync.model().value(&driver, "Name").unwrap(),
            Some(Value::Text("Bo".into()))
        );
        let log = sync.change_log();
        assert_eq!(log.len(), before + 1);
        assert!(log
            .sets()
            .iter()
            .any(|s| s.source() == crate::SERVER_SOURCE && s.len() == 1));
        assert_eq!(log.active_source(), Some(exograph_protocol::CLIENT_SOURCE));
        assert!(!sync.is_applying_changes());
    }

    #[test]
    fn server_init_new_maps_ids() {
        let sync = sync_with(Arc::new(MockTransport::new()));
        sync.apply_changes(
            vec![ChangeRecord::init_new(EntityRef::new_instance("Driver", "+s7"))],
            None,
            |r| r.unwrap(),
        );
        let translator = sync.translator();
        let created = sync.model().entities("Driver");
        assert_eq!(created.len(), 1);
        assert_eq!(translator.forward("Driver", &created[0].id()), Some("+s7"));
        assert_eq!(translator.reverse("Driver", "+s7"), Some(created[0].id().as_str()));
    }

    #[test]
    fn failed_records_are_skipped() {
        let sync = sync_with(Arc::new(MockTransport::new()));
        let driver = sync.model().create("Driver").unwrap();
        sync.apply_changes(
            vec![
                ChangeRecord::value_change(EntityRef::new("Boat", "1"), "Name", json!(null), json!("x")),
                ChangeRecord::value_change(driver.to_ref(), "Age", json!(null), json!(30)),
            ],
            None,
            |r| r.unwrap(),
        );
        let stats = sync.stats();
        assert_eq!(stats.changes_applied, 1);
        assert_eq!(stats.changes_skipped, 1);
        assert_eq!(sync.model().value(&driver, "Age").unwrap(), Some(Value::Int(30)));
    }

    #[test]
    fn list_changes_for_missing_entities_wait_in_background() {
        let sync = sync_with(Arc::new(MockTransport::new()));
        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        sync.apply_changes(
            vec![ChangeRecord::list_change(
                EntityRef::new("Driver", "9"),
                "Cars",
                vec![WireItem::Entity(EntityRef::new("Car", "5"))],
                vec![],
            )],
            None,
            move |r| {
                r.unwrap();
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(sync.change_log().active_source(), Some(exograph_protocol::CLIENT_SOURCE));

        let driver = sync.model().get_or_ghost("Driver", "9").unwrap();
        assert_eq!(sync.model().list(&driver, "Cars").unwrap(), None);
        sync.model().init_list(&driver, "Cars", vec![]).unwrap();

        let cars = sync.model().list(&driver, "Cars").unwrap().unwrap();
        assert_eq!(cars.len(), 1);
        assert_eq!(cars[0].as_entity().map(|c| c.id()), Some("5".to_string()));
        assert_eq!(sync.stats().changes_captured, 0);
    }

    #[test]
    fn rollback_restores_values() {
        let sync = sync_with(Arc::new(MockTransport::new()));
        let driver = sync.model().create("Driver").unwrap();
        sync.model().set_value(&driver, "Age", Value::Int(1)).unwrap();
        sync.model().set_value(&driver, "Age", Value::Int(2)).unwrap();

        assert_eq!(sync.rollback(Some(1)), 1);
        assert_eq!(sync.model().value(&driver, "Age").unwrap(), Some(Value::Int(1)));
        assert_eq!(sync.rollback(None), 2);
        assert_eq!(sync.model().value(&driver, "Age").unwrap(), Some(Value::Null));
        assert!(sync.change_log().is_empty());
        assert_eq!(sync.model().get("Driver", &driver.id()), Some(driver));
    }

    #[test]
    fn disabled_entities_are_not_saveable() {
        let sync = sync_with(Arc::new(MockTransport::new()));
        let driver = sync.model().create("Driver").unwrap();
        let car = sync.model().create("Car").unwrap();
        sync.model().set_value(&driver, "Car", car.clone().into()).unwrap();

        sync.disable_save(&car);
        let change = sync.change_log().last_change().cloned().unwrap();
        assert!(!sync.can_save(&change));
        assert!(sync.can_save(&ChangeRecord::init_new(driver.to_ref())));
        assert!(sync.can_save(&ChangeRecord::init_new(EntityRef::new("Boat", "1"))));

        sync.enable_save(&car);
        assert!(sync.can_save(&change));
    }

    #[test]
    fn list_changes_need_one_saveable_item() {
        let sync = sync_with(Arc::new(MockTransport::new()));
        let driver = sync.model().create("Driver").unwrap();
        let a = sync.model().create("Car").unwrap();
        let b = sync.model().create("Car").unwrap();
        sync.disable_save(&a);

        let only_a = ChangeRecord::list_change(driver.to_ref(), "Cars", vec![a.to_ref().into()], vec![]);
        let both = ChangeRecord::list_change(
            driver.to_ref(),
            "Cars",
            vec![a.to_ref().into(), b.to_ref().into()],
            vec![],
        );
        assert!(!sync.can_save(&only_a));
        assert!(sync.can_save(&both));
    }

    #[test]
    fn conditions_replace_per_code() {
        let transport = Arc::new(MockTransport::new());
        let condition = |message: &str| ConditionData {
            message: Some(message.into()),
            targets: vec![ConditionTarget {
                instance: EntityRef::new("Driver", "1"),
                properties: vec!["Name".into()],
            }],
        };
        transport.respond(
            Operation::Roundtrip,
            Ok(ServerResult::new().with_conditions("required", vec![condition("a"), condition("b")])),
        );
        transport.respond(
            Operation::Roundtrip,
            Ok(ServerResult::new().with_conditions("required", vec![condition("c")])),
        );
        let sync = sync_with(transport);
        sync.roundtrip(|r| assert!(r.is_ok()));
        assert_eq!(sync.conditions("required").len(), 2);
        sync.roundtrip(|r| assert!(r.is_ok()));
        assert_eq!(sync.conditions("required"), vec![condition("c")]);
        assert!(sync.conditions("other").is_empty());
    }

    #[test]
    fn failed_requests_are_reported() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(Operation::Roundtrip, Err(SyncError::transport_retryable("offline")));
        let sync = sync_with(transport);
        sync.model().create("Driver").unwrap();
        sync.roundtrip(|r| assert!(r.unwrap_err().is_retryable()));

        let stats = sync.stats();
        assert_eq!(stats.requests_failed, 1);
        assert!(stats.last_error.is_some());
        assert!(!sync.is_busy());
        assert_eq!(sync.change_log().len(), 1);
    }

    #[test]
    fn dropping_the_synchronizer_stops_tracking() {
        let model = model();
        let sync = ServerSync::new(Arc::clone(&model), MockTransport::new(), SyncConfig::default());
        assert_eq!(model.observer_count(), 3);
        drop(sync);
        assert_eq!(model.observer_count(), 0);
    }
}
