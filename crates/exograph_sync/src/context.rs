//! Per-model synchronization context.
//!
//! Everything the resolution helpers, the loader and the synchronizer
//! share lives here: the translator, the applying latch, the keyed
//! entity signals, in-flight loads and the registry of callbacks waiting
//! for types and entities to appear. One context exists per model, so
//! independent models never share registries.

use crate::signal::Signal;
use crate::transport::{Callback, SyncTransport};
use exograph_model::{Entity, EntityType, GraphObserver, Model, PropertyMeta};
use exograph_protocol::Translator;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

type Deferred = Box<dyn FnOnce() + Send>;
type TypeWaiter = Box<dyn FnOnce(Arc<EntityType>) + Send>;
type EntityWaiterFn = Box<dyn FnOnce(Entity) + Send>;

struct EntityWaiter {
    type_name: String,
    id: String,
    property: Option<String>,
    then: EntityWaiterFn,
}

#[derive(Default)]
struct Waiters {
    types: HashMap<String, Vec<TypeWaiter>>,
    unregistered: Vec<EntityWaiter>,
    // (entity uid, property) -> callbacks; `None` waits for the entity itself.
    unavailable: HashMap<(u64, Option<String>), Vec<EntityWaiterFn>>,
}

/// A load shared by every caller that asks for the same data while it is
/// in flight.
#[derive(Clone)]
pub(crate) struct PendingLoad {
    pub(crate) signal: Signal,
    pub(crate) failure: Arc<Mutex<Option<crate::SyncError>>>,
}

pub(crate) struct SyncContext {
    pub(crate) model: Arc<Model>,
    pub(crate) transport: Arc<dyn SyncTransport>,
    pub(crate) translator: RwLock<Translator>,
    pub(crate) default_paths: Vec<String>,
    pub(crate) type_loads: Mutex<HashMap<String, Vec<Callback<Arc<EntityType>>>>>,
    pub(crate) loads: Mutex<HashMap<String, PendingLoad>>,
    entity_signals: Mutex<HashMap<String, Signal>>,
    waiters: Mutex<Waiters>,
    applying: AtomicUsize,
    deferred: Mutex<Vec<Deferred>>,
}

/// Holds the applying latch for as long as it lives.
///
/// The latch is a counter, so overlapping holders never release each
/// other. Wake-ups queued while the latch was held run when the last
/// holder drops.
pub(crate) struct ApplyingGuard<'a> {
    ctx: &'a SyncContext,
}

impl Drop for ApplyingGuard<'_> {
    fn drop(&mut self) {
        if self.ctx.applying.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.ctx.flush_deferred();
        }
    }
}

impl SyncContext {
    pub(crate) fn new(
        model: Arc<Model>,
        transport: Arc<dyn SyncTransport>,
        default_paths: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model,
            transport,
            translator: RwLock::new(Translator::new()),
            default_paths,
            type_loads: Mutex::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
            entity_signals: Mutex::new(HashMap::new()),
            waiters: Mutex::new(Waiters::default()),
            applying: AtomicUsize::new(0),
            deferred: Mutex::new(Vec::new()),
        })
    }

    /// Returns the observer that feeds model events into the waiter registry.
    pub(crate) fn observer(self: &Arc<Self>) -> Arc<dyn GraphObserver> {
        Arc::new(ContextObserver {
            ctx: Arc::downgrade(self),
        })
    }

    // ------------------------------------------------------------------
    // Applying latch
    // ------------------------------------------------------------------

    pub(crate) fn applying(&self) -> ApplyingGuard<'_> {
        self.applying.fetch_add(1, Ordering::SeqCst);
        ApplyingGuard { ctx: self }
    }

    pub(crate) fn is_applying(&self) -> bool {
        self.applying.load(Ordering::SeqCst) > 0
    }

    fn run_or_defer(&self, callbacks: Vec<Deferred>) {
        if callbacks.is_empty() {
            return;
        }
        if self.is_applying() {
            self.deferred.lock().extend(callbacks);
        } else {
            for callback in callbacks {
                callback();
            }
        }
    }

    fn flush_deferred(&self) {
        loop {
            let batch = std::mem::take(&mut *self.deferred.lock());
            if batch.is_empty() {
                return;
            }
            for callback in batch {
                callback();
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Finds a registered entity by an id as received from the server,
    /// trying every translation of it.
    pub(crate) fn find(&self, type_name: &str, id: &str) -> Option<Entity> {
        self.model.ty(type_name)?;
        let candidates = self.translator.read().candidates(type_name, id);
        candidates
            .iter()
            .find_map(|candidate| self.model.get(type_name, candidate))
    }

    /// Finds an entity or registers a ghost under the translated id.
    pub(crate) fn find_or_ghost(&self, type_name: &str, id: &str) -> crate::SyncResult<Entity> {
        if let Some(entity) = self.find(type_name, id) {
            return Ok(entity);
        }
        let local_id = self.translator.read().translate_id(type_name, id);
        Ok(self.model.get_or_ghost(type_name, &local_id)?)
    }

    // ------------------------------------------------------------------
    // Entity signals
    // ------------------------------------------------------------------

    /// Returns the signal keyed by `key`, creating it with one pending unit.
    pub(crate) fn entity_signal(&self, key: &str) -> (Signal, bool) {
        let mut signals = self.entity_signals.lock();
        if let Some(signal) = signals.get(key) {
            return (signal.clone(), false);
        }
        let signal = Signal::new(key);
        signal.pending();
        signals.insert(key.to_string(), signal.clone());
        (signal, true)
    }

    /// Completes and forgets the signal keyed by `key`, at most once.
    pub(crate) fn complete_entity_signal(&self, key: &str) {
        let signal = self.entity_signals.lock().remove(key);
        if let Some(signal) = signal {
            if signal.is_active() {
                signal.done();
            }
        }
    }

    /// Returns the signal keyed by `key` if it is still pending.
    pub(crate) fn active_entity_signal(&self, key: &str) -> Option<Signal> {
        self.entity_signals
            .lock()
            .get(key)
            .filter(|s| s.is_active())
            .cloned()
    }

    // ------------------------------------------------------------------
    // Waiters
    // ------------------------------------------------------------------

    /// Runs `then` once `type_name` is defined.
    pub(crate) fn wait_for_type(&self, type_name: &str, then: TypeWaiter) {
        let ty = {
            let mut waiters = self.waiters.lock();
            match self.model.ty(type_name) {
                Some(ty) => ty,
                None => {
                    waiters
                        .types
                        .entry(type_name.to_string())
                        .or_default()
                        .push(then);
                    return;
                }
            }
        };
        then(ty);
    }

    /// Runs `then` once the entity is registered and available for
    /// `property` (or loaded, if no property is given).
    pub(crate) fn wait_for_entity(
        &self,
        type_name: &str,
        id: &str,
        property: Option<String>,
        then: EntityWaiterFn,
    ) {
        let ready = {
            let mut waiters = self.waiters.lock();
            match self.find(type_name, id) {
                Some(entity) if entity.is_available(property.as_deref()) => entity,
                Some(entity) => {
                    waiters
                        .unavailable
                        .entry((entity.uid(), property))
                        .or_default()
                        .push(then);
                    return;
                }
                None => {
                    waiters.unregistered.push(EntityWaiter {
                        type_name: type_name.to_string(),
                        id: id.to_string(),
                        property,
                        then,
                    });
                    return;
                }
            }
        };
        then(ready);
    }

    fn wake_type(&self, ty: &Arc<EntityType>) {
        let callbacks = self.waiters.lock().types.remove(ty.name()).unwrap_or_default();
        let ty = Arc::clone(ty);
        let deferred = callbacks
            .into_iter()
            .map(|cb| {
                let ty = Arc::clone(&ty);
                Box::new(move || cb(ty)) as Deferred
            })
            .collect();
        self.run_or_defer(deferred);
    }

    fn wake_registered(&self, entity: &Entity) {
        let mut ready = Vec::new();
        {
            let mut waiters = self.waiters.lock();
            let pending = std::mem::take(&mut waiters.unregistered);
            let translator = self.translator.read();
            for waiter in pending {
                let matches = entity.entity_type().is_subtype_of(&waiter.type_name)
                    && translator
                        .candidates(&waiter.type_name, &waiter.id)
                        .iter()
                        .any(|c| *c == entity.id());
                if !matches {
                    waiters.unregistered.push(waiter);
                } else if entity.is_available(waiter.property.as_deref()) {
                    ready.push(waiter.then);
                } else {
                    waiters
                        .unavailable
                        .entry((entity.uid(), waiter.property))
                        .or_default()
                        .push(waiter.then);
                }
            }
        }
        self.wake_with(entity, ready);
    }

    fn wake_available(&self, entity: &Entity, property: Option<&str>) {
        let ready = self
            .waiters
            .lock()
            .unavailable
            .remove(&(entity.uid(), property.map(str::to_string)))
            .unwrap_or_default();
        self.wake_with(entity, ready);
    }

    fn wake_with(&self, entity: &Entity, callbacks: Vec<EntityWaiterFn>) {
        let deferred = callbacks
            .into_iter()
            .map(|cb| {
                let entity = entity.clone();
                Box::new(move || cb(entity)) as Deferred
            })
            .collect();
        self.run_or_defer(deferred);
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        let waiters = self.waiters.lock();
        waiters.types.values().map(Vec::len).sum::<usize>()
            + waiters.unregistered.len()
            + waiters.unavailable.values().map(Vec::len).sum::<usize>()
    }
}

struct ContextObserver {
    ctx: Weak<SyncContext>,
}

impl GraphObserver for ContextObserver {
    fn type_defined(&self, ty: &Arc<EntityType>) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.wake_type(ty);
        }
    }

    fn entity_registered(&self, entity: &Entity) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.wake_registered(entity);
        }
    }

    fn entity_loaded(&self, entity: &Entity) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.wake_available(entity, None);
        }
    }

    fn property_initialized(&self, entity: &Entity, property: &PropertyMeta) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.wake_available(entity, Some(&property.name));
        }
    }
}
