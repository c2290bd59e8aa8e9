//! The entity pool and its observable mutation surface.

use crate::entity::{Entity, Slot};
use crate::error::{ModelError, ModelResult};
use crate::meta::{EntityType, PropertyMeta, PropertyType, ValueType};
use crate::value::Value;
use exograph_protocol::TypeInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Receives mutation and lifecycle notifications from a [`Model`].
///
/// Every method has an empty default. Notifications are delivered after
/// the change is stored, with no model lock held.
pub trait GraphObserver: Send + Sync {
    /// A type was defined.
    fn type_defined(&self, _ty: &Arc<EntityType>) {}

    /// An entity was added to the pool.
    fn entity_registered(&self, _entity: &Entity) {}

    /// An entity is about to leave the pool. Returning an error aborts
    /// the unregistration.
    fn entity_unregistering(&self, _entity: &Entity) -> ModelResult<()> {
        Ok(())
    }

    /// A ghost entity received its data.
    fn entity_loaded(&self, _entity: &Entity) {}

    /// The entity's id changed.
    fn id_changed(&self, _entity: &Entity, _old_id: &str) {}

    /// A scalar property was assigned a different value.
    fn property_changed(
        &self,
        _entity: &Entity,
        _property: &PropertyMeta,
        _old: &Value,
        _new: &Value,
    ) {
    }

    /// A property received its first value.
    fn property_initialized(&self, _entity: &Entity, _property: &PropertyMeta) {}

    /// Items were added to or removed from a list property.
    fn list_changed(
        &self,
        _entity: &Entity,
        _property: &PropertyMeta,
        _added: &[Value],
        _removed: &[Value],
    ) {
    }
}

type PoolKey = (String, String);

/// The in-memory entity graph.
pub struct Model {
    types: RwLock<HashMap<String, Arc<EntityType>>>,
    pool: RwLock<HashMap<PoolKey, Entity>>,
    observers: RwLock<Vec<Arc<dyn GraphObserver>>>,
    next_uid: AtomicU64,
    next_new_id: AtomicU64,
}

impl Model {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            pool: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            next_uid: AtomicU64::new(1),
            next_new_id: AtomicU64::new(0),
        }
    }

    /// Subscribes an observer.
    pub fn add_observer(&self, observer: Arc<dyn GraphObserver>) {
        self.observers.write().push(observer);
    }

    /// Unsubscribes an observer.
    pub fn remove_observer(&self, observer: &Arc<dyn GraphObserver>) {
        self.observers.write().retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Returns the number of subscribed observers.
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    fn notify(&self, f: impl Fn(&dyn GraphObserver)) {
        let observers = self.observers.read().clone();
        for observer in &observers {
            f(observer.as_ref());
        }
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    /// Defines a type.
    pub fn define_type(&self, ty: EntityType) -> ModelResult<Arc<EntityType>> {
        let ty = Arc::new(ty);
        {
            let mut types = self.types.write();
            if types.contains_key(ty.name()) {
                return Err(ModelError::DuplicateType(ty.name().to_string()));
            }
            types.insert(ty.name().to_string(), Arc::clone(&ty));
        }
        trace!(type_name = ty.name(), "type defined");
        self.notify(|o| o.type_defined(&ty));
        Ok(ty)
    }

    /// Defines a type from provider metadata. The base type must already exist.
    pub fn define_type_from_info(&self, info: &TypeInfo) -> ModelResult<Arc<EntityType>> {
        let base = match &info.base_type {
            Some(name) => Some(self.require_type(name)?),
            None => None,
        };
        self.define_type(EntityType::from_info(info, base))
    }

    /// Looks up a type.
    pub fn ty(&self, name: &str) -> Option<Arc<EntityType>> {
        self.types.read().get(name).cloned()
    }

    /// Looks up a type, failing with [`ModelError::UnknownType`].
    pub fn require_type(&self, name: &str) -> ModelResult<Arc<EntityType>> {
        self.ty(name)
            .ok_or_else(|| ModelError::UnknownType(name.to_string()))
    }

    // ------------------------------------------------------------------
    // Pool
    // ------------------------------------------------------------------

    fn key(ty: &EntityType, id: &str) -> PoolKey {
        (ty.root_name().to_string(), id.to_string())
    }

    /// Creates an unregistered new entity with a client id (`+c0`, `+c1`, ...)
    /// and every property initialized to its default.
    pub fn new_entity(&self, ty: &Arc<EntityType>) -> Entity {
        let id = format!("+c{}", self.next_new_id.fetch_add(1, Ordering::SeqCst));
        let slots = ty
            .all_properties()
            .iter()
            .map(|p| {
                let slot = if p.is_list {
                    Slot::List(Vec::new())
                } else {
                    Slot::Scalar(Value::Null)
                };
                (p.name.clone(), slot)
            })
            .collect();
        Entity::new(self.next_uid(), Arc::clone(ty), id, true, true, slots)
    }

    /// Creates an unregistered ghost: a persisted entity whose data has not
    /// been loaded.
    pub fn new_ghost(&self, ty: &Arc<EntityType>, id: impl Into<String>) -> Entity {
        Entity::new(
            self.next_uid(),
            Arc::clone(ty),
            id.into(),
            false,
            false,
            HashMap::new(),
        )
    }

    fn next_uid(&self) -> u64 {
        self.next_uid.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates and registers a new entity.
    pub fn create(&self, type_name: &str) -> ModelResult<Entity> {
        let ty = self.require_type(type_name)?;
        let entity = self.new_entity(&ty);
        self.register(&entity)?;
        Ok(entity)
    }

    /// Returns the registered entity, or registers a ghost for it.
    pub fn get_or_ghost(&self, type_name: &str, id: &str) -> ModelResult<Entity> {
        let ty = self.require_type(type_name)?;
        if let Some(existing) = self.get(type_name, id) {
            return Ok(existing);
        }
        let ghost = self.new_ghost(&ty, id);
        self.register(&ghost)?;
        Ok(ghost)
    }

    /// Adds an entity to the pool.
    pub fn register(&self, entity: &Entity) -> ModelResult<()> {
        let key = Self::key(entity.entity_type(), &entity.id());
        {
            let mut pool = self.pool.write();
            if let Some(existing) = pool.get(&key) {
                if existing == entity {
                    return Ok(());
                }
                return Err(ModelError::DuplicateId {
                    type_name: entity.type_name().to_string(),
                    id: key.1,
                });
            }
            pool.insert(key, entity.clone());
        }
        trace!(entity = ?entity, "entity registered");
        self.notify(|o| o.entity_registered(entity));
        Ok(())
    }

    /// Removes an entity from the pool, unless an observer refuses.
    pub fn unregister(&self, entity: &Entity) -> ModelResult<()> {
        let key = Self::key(entity.entity_type(), &entity.id());
        if self.pool.read().get(&key) != Some(entity) {
            return Err(ModelError::NotRegistered {
                type_name: entity.type_name().to_string(),
                id: key.1,
            });
        }
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.entity_unregistering(entity)?;
        }
        self.pool.write().remove(&key);
        Ok(())
    }

    /// Looks up a registered entity of `type_name` (or a subtype) by id.
    pub fn get(&self, type_name: &str, id: &str) -> Option<Entity> {
        let ty = self.ty(type_name)?;
        let found = self.pool.read().get(&Self::key(&ty, id)).cloned()?;
        found
            .entity_type()
            .is_subtype_of(type_name)
            .then_some(found)
    }

    /// Returns every registered entity of `type_name` (or a subtype).
    pub fn entities(&self, type_name: &str) -> Vec<Entity> {
        self.pool
            .read()
            .values()
            .filter(|e| e.entity_type().is_subtype_of(type_name))
            .cloned()
            .collect()
    }

    /// Re-keys a registered entity under a new id.
    pub fn change_id(&self, entity: &Entity, new_id: &str) -> ModelResult<()> {
        let old_id = entity.id();
        if old_id == new_id {
            return Ok(());
        }
        let old_key = Self::key(entity.entity_type(), &old_id);
        let new_key = Self::key(entity.entity_type(), new_id);
        {
            let mut pool = self.pool.write();
            if pool.get(&old_key) != Some(entity) {
                return Err(ModelError::NotRegistered {
                    type_name: entity.type_name().to_string(),
                    id: old_id,
                });
            }
            if pool.contains_key(&new_key) {
                return Err(ModelError::DuplicateId {
                    type_name: entity.type_name().to_string(),
                    id: new_id.to_string(),
                });
            }
            pool.remove(&old_key);
            entity.set_id(new_id.to_string());
            pool.insert(new_key, entity.clone());
        }
        self.notify(|o| o.id_changed(entity, &old_id));
        Ok(())
    }

    /// Marks a ghost as loaded.
    pub fn mark_loaded(&self, entity: &Entity) {
        if entity.is_loaded() {
            return;
        }
        entity.set_loaded(true);
        self.notify(|o| o.entity_loaded(entity));
    }

    /// Turns a registered entity into a ghost that must be loaded on demand.
    pub fn mark_unloaded(&self, entity: &Entity) {
        entity.set_loaded(false);
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    /// Looks up a property of the entity's type.
    pub fn property(&self, entity: &Entity, name: &str) -> ModelResult<Arc<PropertyMeta>> {
        entity
            .entity_type()
            .property(name)
            .cloned()
            .ok_or_else(|| ModelError::UnknownProperty {
                type_name: entity.type_name().to_string(),
                property: name.to_string(),
            })
    }

    /// Reads a scalar property. `None` means not initialized.
    pub fn value(&self, entity: &Entity, property: &str) -> ModelResult<Option<Value>> {
        let prop = self.property(entity, property)?;
        if prop.is_list {
            return Err(ModelError::IsAList(prop.name.clone()));
        }
        Ok(match entity.slot(property) {
            Some(Slot::Scalar(v)) => Some(v),
            _ => None,
        })
    }

    /// Reads a list property. `None` means not initialized.
    pub fn list(&self, entity: &Entity, property: &str) -> ModelResult<Option<Vec<Value>>> {
        let prop = self.property(entity, property)?;
        if !prop.is_list {
            return Err(ModelError::NotAList(prop.name.clone()));
        }
        Ok(match entity.slot(property) {
            Some(Slot::List(items)) => Some(items),
            _ => None,
        })
    }

    /// Assigns a scalar property and notifies observers if the value changed.
    pub fn set_value(&self, entity: &Entity, property: &str, value: Value) -> ModelResult<()> {
        let prop = self.property(entity, property)?;
        if prop.is_list {
            return Err(ModelError::IsAList(prop.name.clone()));
        }
        check_value(&prop, &value)?;

        let previous = entity.with_slots(|slots| {
            slots.insert(prop.name.clone(), Slot::Scalar(value.clone()))
        });
        let (old, was_initialized) = match previous {
            Some(Slot::Scalar(old)) => (old, true),
            _ => (Value::Null, false),
        };

        if was_initialized && old == value {
            return Ok(());
        }
        self.notify(|o| o.property_changed(entity, &prop, &old, &value));
        if !was_initialized {
            self.notify(|o| o.property_initialized(entity, &prop));
        }
        Ok(())
    }

    /// Sets a scalar property from loaded data.
    ///
    /// An uninitialized property is initialized silently; an initialized
    /// one is assigned as by [`set_value`](Self::set_value).
    pub fn init_value(&self, entity: &Entity, property: &str, value: Value) -> ModelResult<()> {
        let prop = self.property(entity, property)?;
        if prop.is_list {
            return Err(ModelError::IsAList(prop.name.clone()));
        }
        if entity.is_initialized(property) {
            return self.set_value(entity, property, value);
        }
        check_value(&prop, &value)?;
        entity.with_slots(|slots| slots.insert(prop.name.clone(), Slot::Scalar(value)));
        self.notify(|o| o.property_initialized(entity, &prop));
        Ok(())
    }

    /// Sets a list property from loaded data.
    ///
    /// An uninitialized list is initialized silently; an initialized one is
    /// replaced and observers see the difference as one list change.
    pub fn init_list(&self, entity: &Entity, property: &str, items: Vec<Value>) -> ModelResult<()> {
        let prop = self.property(entity, property)?;
        if !prop.is_list {
            return Err(ModelError::NotAList(prop.name.clone()));
        }
        for item in &items {
            check_value(&prop, item)?;
        }
        let previous =
            entity.with_slots(|slots| slots.insert(prop.name.clone(), Slot::List(items.clone())));
        match previous {
            Some(Slot::List(old)) => {
                let removed: Vec<Value> =
                    old.iter().filter(|v| !items.contains(v)).cloned().collect();
                let added: Vec<Value> =
                    items.iter().filter(|v| !old.contains(v)).cloned().collect();
                if !added.is_empty() || !removed.is_empty() {
                    self.notify(|o| o.list_changed(entity, &prop, &added, &removed));
                }
            }
            _ => self.notify(|o| o.property_initialized(entity, &prop)),
        }
        Ok(())
    }

    /// Removes `removed` items (first occurrence each) and appends `added`
    /// items as one list mutation.
    ///
    /// Observers see the items actually removed, and are not notified if
    /// nothing changed.
    pub fn change_list(
        &self,
        entity: &Entity,
        property: &str,
        added: Vec<Value>,
        removed: Vec<Value>,
    ) -> ModelResult<()> {
        let prop = self.property(entity, property)?;
        if !prop.is_list {
            return Err(ModelError::NotAList(prop.name.clone()));
        }
        for item in &added {
            check_value(&prop, item)?;
        }
        let actually_removed = entity.with_slots(|slots| match slots.get_mut(&prop.name) {
            Some(Slot::List(items)) => {
                let mut gone = Vec::new();
                for r in removed {
                    if let Some(pos) = items.iter().position(|v| *v == r) {
                        gone.push(items.remove(pos));
                    }
                }
                items.extend(added.iter().cloned());
                Ok(gone)
            }
            _ => Err(ModelError::NotInitialized(prop.name.clone())),
        })?;

        if !added.is_empty() || !actually_removed.is_empty() {
            self.notify(|o| o.list_changed(entity, &prop, &added, &actually_removed));
        }
        Ok(())
    }

    /// Appends one item to a list property.
    pub fn add_to_list(&self, entity: &Entity, property: &str, item: Value) -> ModelResult<()> {
        self.change_list(entity, property, vec![item], Vec::new())
    }

    /// Removes one item from a list property.
    pub fn remove_from_list(&self, entity: &Entity, property: &str, item: Value) -> ModelResult<()> {
        self.change_list(entity, property, Vec::new(), vec![item])
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

fn check_value(prop: &PropertyMeta, value: &Value) -> ModelResult<()> {
    let ok = match (&prop.property_type, value) {
        (_, Value::Null) => true,
        (PropertyType::Entity(target), Value::Entity(e)) => e.entity_type().is_subtype_of(target),
        (PropertyType::Entity(_), _) => false,
        (PropertyType::Value(_), Value::Entity(_)) => false,
        (PropertyType::Value(ValueType::Object), _) => true,
        (PropertyType::Value(ValueType::Boolean), Value::Bool(_)) => true,
        (PropertyType::Value(ValueType::Integer), Value::Int(_)) => true,
        (PropertyType::Value(ValueType::Number), Value::Int(_) | Value::Float(_)) => true,
        (PropertyType::Value(ValueType::String), Value::Text(_)) => true,
        (PropertyType::Value(ValueType::Date), Value::Date(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ModelError::TypeMismatch {
            property: prop.name.clone(),
            expected: match &prop.property_type {
                PropertyType::Entity(t) => t.clone(),
                PropertyType::Value(v) => format!("{v:?}"),
            },
        })
    }
}
