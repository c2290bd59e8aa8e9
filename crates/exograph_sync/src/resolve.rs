//! Best-effort resolution of type names and `(type, id)` references.
//!
//! Resolution is asynchronous: a type may have to be fetched and an entity
//! may not be registered or loaded yet. Callers never block; the callback
//! runs once the target is usable, which may be immediately.

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::loader;
use crate::transport::Callback;
use exograph_model::{Entity, EntityType};
use std::sync::Arc;
use tracing::{trace, warn};

/// How entity resolution treats an entity that is missing or not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LazyLoadMode {
    /// Wait for the entity to be registered and the property initialized
    /// by someone else. Never triggers a load.
    #[default]
    None,
    /// Register a ghost if the entity is missing and start loading the
    /// property, without waiting for the load.
    Force,
    /// Like `Force`, but report only once the load has finished.
    ForceAndWait,
}

/// Resolves a type name to its type, fetching it when `force_load` is set.
///
/// Without `force_load` an unknown type is waited for indefinitely.
pub(crate) fn try_get_type(
    ctx: &Arc<SyncContext>,
    type_name: &str,
    force_load: bool,
    done: Callback<Arc<EntityType>>,
) {
    if let Some(ty) = ctx.model.ty(type_name) {
        return done(Ok(ty));
    }
    if force_load {
        loader::load_type(ctx, type_name, done);
    } else {
        trace!(type_name, "waiting for type definition");
        ctx.wait_for_type(type_name, Box::new(move |ty| done(Ok(ty))));
    }
}

/// Resolves a `(type, id)` reference, as received from the server, to a
/// live entity. The type is always fetched if unknown.
pub(crate) fn try_get_entity(
    ctx: &Arc<SyncContext>,
    type_name: &str,
    id: &str,
    property: Option<&str>,
    mode: LazyLoadMode,
    done: Callback<Entity>,
) {
    let resolver = Arc::clone(ctx);
    let id = id.to_string();
    let property = property.map(str::to_string);
    try_get_type(
        ctx,
        type_name,
        true,
        Box::new(move |result| match result {
            Ok(ty) => resolve_entity(&resolver, ty, id, property, mode, done),
            Err(e) => done(Err(e)),
        }),
    );
}

fn resolve_entity(
    ctx: &Arc<SyncContext>,
    ty: Arc<EntityType>,
    id: String,
    property: Option<String>,
    mode: LazyLoadMode,
    done: Callback<Entity>,
) {
    let found = ctx.find(ty.name(), &id);
    if let Some(entity) = &found {
        if entity.is_available(property.as_deref()) {
            return done(Ok(entity.clone()));
        }
    }

    if mode == LazyLoadMode::None {
        return wait_for_entity(ctx, ty, id, property, done);
    }

    let entity = match found {
        Some(entity) => entity,
        None => match ctx.find_or_ghost(ty.name(), &id) {
            Ok(entity) => entity,
            Err(e) => return done(Err(e)),
        },
    };

    // A bare reference only needs a ghost; the entity loads on demand.
    if property.is_none() && mode == LazyLoadMode::Force {
        return done(Ok(entity));
    }

    if mode == LazyLoadMode::Force {
        let target = entity.clone();
        loader::ensure_loaded(
            ctx,
            &entity,
            property.as_deref(),
            Box::new(move |result| {
                if let Err(e) = result {
                    warn!(entity = ?target, error = %e, "background load failed");
                }
            }),
        );
        done(Ok(entity));
    } else {
        let key = format!("{}|{}", ty.name(), id);
        let (_, created) = ctx.entity_signal(&key);
        let signals = Arc::clone(ctx);
        let target = entity.clone();
        loader::ensure_loaded(
            ctx,
            &entity,
            property.as_deref(),
            Box::new(move |result| {
                if created {
                    signals.complete_entity_signal(&key);
                }
                done(result.map(|_| target));
            }),
        );
    }
}

/// Waits, without loading, until the entity is registered and available.
///
/// Concurrent waits for the same `type|id` share one keyed signal.
fn wait_for_entity(
    ctx: &Arc<SyncContext>,
    ty: Arc<EntityType>,
    id: String,
    property: Option<String>,
    done: Callback<Entity>,
) {
    let key = format!("{}|{}", ty.name(), id);
    let (signal, created) = ctx.entity_signal(&key);
    if created {
        trace!(key = %key, "waiting for entity");
        let completer = Arc::clone(ctx);
        let signal_key = key.clone();
        ctx.wait_for_entity(
            ty.name(),
            &id,
            property.clone(),
            Box::new(move |_| completer.complete_entity_signal(&signal_key)),
        );
    }

    let resolver = Arc::clone(ctx);
    signal.wait_for_all(move || {
        // The shared signal may have been created for another property.
        match resolver.find(ty.name(), &id) {
            Some(entity) if entity.is_available(property.as_deref()) => done(Ok(entity)),
            Some(_) => resolve_entity(&resolver, ty, id, property, LazyLoadMode::None, done),
            None => done(Err(SyncError::unresolved(ty.name(), id))),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncResult;
    use crate::transport::{MockTransport, Operation};
    use exograph_model::{Model, PropertyMeta, ValueType};
    use exograph_protocol::{InstanceData, OriginTag, PropertyInfo, ServerResult, TypeInfo};
    use parking_lot::Mutex;
    use serde_json::json;

    fn setup() -> (Arc<SyncContext>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let ctx = SyncContext::new(Arc::new(Model::new()), transport.clone(), Vec::new());
        ctx.model.add_observer(ctx.observer());
        (ctx, transport)
    }

    fn car_info() -> TypeInfo {
        TypeInfo {
            name: "Car".into(),
            base_type: None,
            origin: OriginTag::Server,
            properties: vec![PropertyInfo::new("Model", "String")],
        }
    }

    fn slot<T: Send + 'static>() -> (Arc<Mutex<Option<SyncResult<T>>>>, Callback<T>) {
        let slot = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        (slot, Box::new(move |r| *s.lock() = Some(r)))
    }

    #[test]
    fn forced_type_load_defines_type() {
        let (ctx, transport) = setup();
        transport.add_type(car_info());
        let (result, done) = slot();
        try_get_type(&ctx, "Car", true, done);
        assert!(matches!(&*result.lock(), Some(Ok(ty)) if ty.name() == "Car"));
        assert!(ctx.model.ty("Car").is_some());
    }

    #[test]
    fn unknown_forced_type_fails() {
        let (ctx, _) = setup();
        let (result, done) = slot();
        try_get_type(&ctx, "Boat", true, done);
        assert!(matches!(&*result.lock(), Some(Err(_))));
    }

    #[test]
    fn unforced_type_waits_for_definition() {
        let (ctx, _) = setup();
        let (result, done) = slot();
        try_get_type(&ctx, "Car", false, done);
        assert!(result.lock().is_none());
        ctx.model
            .define_type(
                EntityType::builder("Car")
                    .property(PropertyMeta::value("Model", ValueType::String))
                    .build(),
            )
            .unwrap();
        assert!(matches!(&*result.lock(), Some(Ok(_))));
    }

    #[test]
    fn none_mode_waits_for_loaded_entity() {
        let (ctx, transport) = setup();
        transport.add_type(car_info());
        let (first, done_first) = slot();
        let (second, done_second) = slot();
        try_get_entity(&ctx, "Car", "5", None, LazyLoadMode::None, done_first);
        try_get_entity(&ctx, "Car", "5", None, LazyLoadMode::None, done_second);
        assert!(first.lock().is_none());
        assert!(ctx.active_entity_signal("Car|5").is_some());

        let ghost = ctx.model.get_or_ghost("Car", "5").unwrap();
        assert!(first.lock().is_none());
        assert!(second.lock().is_none());

        ctx.model.mark_loaded(&ghost);
        assert!(matches!(&*first.lock(), Some(Ok(e)) if *e == ghost));
        assert!(matches!(&*second.lock(), Some(Ok(e)) if *e == ghost));
        assert!(ctx.active_entity_signal("Car|5").is_none());
        // No load was requested.
        assert!(transport
            .calls()
            .iter()
            .all(|c| matches!(c, crate::transport::TransportCall::Type(_))));
    }

    #[test]
    fn force_mode_creates_ghost_without_loading() {
        let (ctx, transport) = setup();
        transport.add_type(car_info());
        let (result, done) = slot();
        try_get_entity(&ctx, "Car", "5", None, LazyLoadMode::Force, done);
        let entity = match result.lock().take() {
            Some(Ok(e)) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(entity.id(), "5");
        assert!(!entity.is_loaded());
        assert_eq!(ctx.model.get("Car", "5"), Some(entity));
    }

    #[test]
    fn force_and_wait_loads_instance_data() {
        let (ctx, transport) = setup();
        transport.add_type(car_info());
        transport.respond(
            Operation::Objects,
            Ok(ServerResult::new().with_instance("Car", "5", InstanceData::Fields(vec![json!("Roadster")]))),
        );
        let (result, done) = slot();
        try_get_entity(&ctx, "Car", "5", None, LazyLoadMode::ForceAndWait, done);
        let entity = match result.lock().take() {
            Some(Ok(e)) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert!(entity.is_loaded());
        assert_eq!(
            ctx.model.value(&entity, "Model").unwrap(),
            Some(exograph_model::Value::Text("Roadster".into()))
        );
    }

    #[test]
    fn translated_ids_resolve() {
        let (ctx, transport) = setup();
        transport.add_type(car_info());
        let (_, done) = slot();
        try_get_type(&ctx, "Car", true, done);
        let car = ctx.model.create("Car").unwrap();
        ctx.translator.write().add("Car", &car.id(), "s-1", false);

        let (result, done) = slot();
        try_get_entity(&ctx, "Car", "s-1", None, LazyLoadMode::None, done);
        assert!(matches!(&*result.lock(), Some(Ok(e)) if *e == car));
    }
}
