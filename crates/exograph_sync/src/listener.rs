//! Turns model notifications into change records.

use crate::convert::{to_wire, to_wire_item, to_wire_ref};
use exograph_model::{Entity, EntityType, GraphObserver, ModelError, ModelResult, Origin, PropertyMeta, Value};
use exograph_protocol::ChangeRecord;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Receives the change records produced by a [`ChangeListener`].
pub trait ChangeSink: Send + Sync {
    /// Records one change.
    fn capture(&self, change: ChangeRecord);
}

/// Graph observer that emits a [`ChangeRecord`] for every tracked mutation.
///
/// A property is tracked when both it and its declaring type come from
/// server metadata and it is not static. New entities of server-origin
/// types produce an `InitNew` record. Unregistering an entity of a
/// server-origin type is refused.
pub struct ChangeListener {
    sink: Weak<dyn ChangeSink>,
}

impl ChangeListener {
    /// Creates a listener feeding `sink`. The listener does not keep the
    /// sink alive.
    pub fn new(sink: Weak<dyn ChangeSink>) -> Self {
        Self { sink }
    }

    fn emit(&self, change: ChangeRecord) {
        if let Some(sink) = self.sink.upgrade() {
            trace!(kind = change.kind().as_str(), "change emitted");
            sink.capture(change);
        }
    }
}

/// Returns true if mutations of `property` on `entity` are synchronized.
pub fn is_tracked(entity: &Entity, property: &PropertyMeta) -> bool {
    if property.is_static || property.origin != Origin::Server {
        return false;
    }
    declaring_type(entity.entity_type(), &property.declaring_type)
        .is_some_and(|ty| ty.origin() == Origin::Server)
}

fn declaring_type<'a>(ty: &'a Arc<EntityType>, name: &str) -> Option<&'a Arc<EntityType>> {
    let mut current = Some(ty);
    while let Some(ty) = current {
        if ty.name() == name {
            return Some(ty);
        }
        current = ty.base();
    }
    None
}

impl GraphObserver for ChangeListener {
    fn entity_registered(&self, entity: &Entity) {
        if entity.is_new() && entity.entity_type().origin() == Origin::Server {
            self.emit(ChangeRecord::init_new(entity.to_ref()));
        }
    }

    fn entity_unregistering(&self, entity: &Entity) -> ModelResult<()> {
        if entity.entity_type().origin() == Origin::Server {
            return Err(ModelError::UnregisterRejected {
                type_name: entity.type_name().to_string(),
                id: entity.id(),
                reason: "entity is synchronized with the server".into(),
            });
        }
        Ok(())
    }

    fn property_changed(&self, entity: &Entity, property: &PropertyMeta, old: &Value, new: &Value) {
        if !is_tracked(entity, property) {
            return;
        }
        let change = if property.is_entity() {
            ChangeRecord::reference_change(
                entity.to_ref(),
                property.name.clone(),
                to_wire_ref(old),
                to_wire_ref(new),
            )
        } else {
            ChangeRecord::value_change(
                entity.to_ref(),
                property.name.clone(),
                to_wire(old),
                to_wire(new),
            )
        };
        self.emit(change);
    }

    fn list_changed(&self, entity: &Entity, property: &PropertyMeta, added: &[Value], removed: &[Value]) {
        if !is_tracked(entity, property) {
            return;
        }
        self.emit(ChangeRecord::list_change(
            entity.to_ref(),
            property.name.clone(),
            added.iter().map(to_wire_item).collect(),
            removed.iter().map(to_wire_item).collect(),
        ));
    }
}
