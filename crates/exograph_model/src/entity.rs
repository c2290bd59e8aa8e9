//! Entity handles.

use crate::meta::EntityType;
use crate::value::Value;
use exograph_protocol::EntityRef;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Storage of one initialized property.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Scalar(Value),
    List(Vec<Value>),
}

struct EntityInner {
    uid: u64,
    ty: Arc<EntityType>,
    id: RwLock<String>,
    is_new: AtomicBool,
    loaded: AtomicBool,
    slots: RwLock<HashMap<String, Slot>>,
}

/// A shared handle to a live entity.
///
/// Cloning the handle does not clone the entity. Two handles are equal
/// when they point at the same entity. The `uid` is stable for the
/// lifetime of the entity, even when its id changes after a save.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    pub(crate) fn new(
        uid: u64,
        ty: Arc<EntityType>,
        id: String,
        is_new: bool,
        loaded: bool,
        slots: HashMap<String, Slot>,
    ) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                uid,
                ty,
                id: RwLock::new(id),
                is_new: AtomicBool::new(is_new),
                loaded: AtomicBool::new(loaded),
                slots: RwLock::new(slots),
            }),
        }
    }

    /// Returns the stable, model-unique identity of this entity.
    pub fn uid(&self) -> u64 {
        self.inner.uid
    }

    /// Returns the entity's type.
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.inner.ty
    }

    /// Returns the entity's type name.
    pub fn type_name(&self) -> &str {
        self.inner.ty.name()
    }

    /// Returns the current id.
    pub fn id(&self) -> String {
        self.inner.id.read().clone()
    }

    /// Returns true if the entity has not been persisted yet.
    pub fn is_new(&self) -> bool {
        self.inner.is_new.load(Ordering::SeqCst)
    }

    /// Sets whether the entity has been persisted.
    pub fn set_new(&self, is_new: bool) {
        self.inner.is_new.store(is_new, Ordering::SeqCst);
    }

    /// Returns true unless the entity is a ghost awaiting its data.
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::SeqCst)
    }

    /// Returns true if `property` holds a value (loaded or assigned).
    pub fn is_initialized(&self, property: &str) -> bool {
        self.inner.slots.read().contains_key(property)
    }

    /// Returns true if the entity, or the given property, is available
    /// without loading.
    pub fn is_available(&self, property: Option<&str>) -> bool {
        match property {
            Some(p) => self.is_initialized(p),
            None => self.is_loaded(),
        }
    }

    /// Returns the wire reference of this entity.
    pub fn to_ref(&self) -> EntityRef {
        EntityRef {
            type_name: self.type_name().to_string(),
            id: self.id(),
            is_new: self.is_new(),
        }
    }

    pub(crate) fn set_id(&self, id: String) {
        *self.inner.id.write() = id;
    }

    pub(crate) fn set_loaded(&self, loaded: bool) {
        self.inner.loaded.store(loaded, Ordering::SeqCst);
    }

    pub(crate) fn slot(&self, property: &str) -> Option<Slot> {
        self.inner.slots.read().get(property).cloned()
    }

    pub(crate) fn with_slots<R>(&self, f: impl FnOnce(&mut HashMap<String, Slot>) -> R) -> R {
        f(&mut self.inner.slots.write())
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.uid.hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}|{})", self.type_name(), self.id())
    }
}
