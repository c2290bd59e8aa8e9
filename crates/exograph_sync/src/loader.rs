//! Lazy loading of types, ghost entities and uninitialized properties.
//!
//! Concurrent requests for the same data share one transport call: the
//! first caller issues it, later callers wait on the load's signal and all
//! of them see the same outcome.

use crate::context::{PendingLoad, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::instances;
use crate::signal::Signal;
use crate::transport::Callback;
use exograph_model::{Entity, EntityType, ModelError, Value};
use exograph_protocol::{ListRequest, ObjectRequest, ServerResult, TypeInfo};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fetches and defines a type, sharing the request with concurrent callers.
pub(crate) fn load_type(ctx: &Arc<SyncContext>, type_name: &str, done: Callback<Arc<EntityType>>) {
    {
        let mut loads = ctx.type_loads.lock();
        if let Some(waiting) = loads.get_mut(type_name) {
            waiting.push(done);
            return;
        }
        loads.insert(type_name.to_string(), vec![done]);
    }

    debug!(type_name, "fetching type");
    let loader = Arc::clone(ctx);
    let name = type_name.to_string();
    ctx.transport.fetch_type(
        type_name,
        Box::new(move |result| {
            let outcome = result.and_then(|infos| define_types(&loader, &name, &infos));
            if let Err(e) = &outcome {
                warn!(type_name = %name, error = %e, "type load failed");
            }
            let waiting = loader.type_loads.lock().remove(&name).unwrap_or_default();
            for done in waiting {
                done(outcome.clone());
            }
        }),
    );
}

fn define_types(
    ctx: &SyncContext,
    type_name: &str,
    infos: &[TypeInfo],
) -> SyncResult<Arc<EntityType>> {
    for info in infos {
        if ctx.model.ty(&info.name).is_some() {
            continue;
        }
        match ctx.model.define_type_from_info(info) {
            Ok(_) | Err(ModelError::DuplicateType(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    ctx.model
        .ty(type_name)
        .ok_or_else(|| SyncError::UnknownType(type_name.to_string()))
}

/// Makes `entity` (or one of its properties) available, loading it if needed.
pub(crate) fn ensure_loaded(
    ctx: &Arc<SyncContext>,
    entity: &Entity,
    property: Option<&str>,
    done: Callback<()>,
) {
    if entity.is_available(property) {
        return done(Ok(()));
    }
    if !entity.is_loaded() {
        return load_entity(ctx, entity, done);
    }
    if let Some(property) = property {
        load_property(ctx, entity, property, done);
    }
}

fn load_entity(ctx: &Arc<SyncContext>, entity: &Entity, done: Callback<()>) {
    let key = format!("{}|{}", entity.type_name(), entity.id());
    let request = ObjectRequest {
        type_name: entity.type_name().to_string(),
        ids: vec![entity.id()],
        paths: ctx.default_paths.clone(),
        changes: Vec::new(),
    };
    let target = entity.clone();
    shared_load(
        ctx,
        key,
        done,
        move |ctx, done| ctx.transport.fetch_objects(request, done),
        move |ctx| {
            // The server may omit data for an entity it no longer has.
            ctx.model.mark_loaded(&target);
        },
    );
}

fn load_property(ctx: &Arc<SyncContext>, entity: &Entity, property: &str, done: Callback<()>) {
    let prop = match ctx.model.property(entity, property) {
        Ok(prop) => prop,
        Err(e) => return done(Err(e.into())),
    };
    let key = format!("{}|{}|{}", entity.type_name(), entity.id(), property);
    let target = entity.clone();
    let fill = move |ctx: &SyncContext| {
        if target.is_initialized(&prop.name) {
            return;
        }
        let _applying = ctx.applying();
        let filled = if prop.is_list {
            ctx.model.init_list(&target, &prop.name, Vec::new())
        } else {
            ctx.model.init_value(&target, &prop.name, Value::Null)
        };
        if let Err(e) = filled {
            warn!(entity = ?target, property = %prop.name, error = %e, "could not initialize property");
        }
    };

    let is_list = entity
        .entity_type()
        .property(property)
        .is_some_and(|p| p.is_list);
    if is_list {
        let request = ListRequest {
            owner_type: entity.type_name().to_string(),
            owner_id: entity.id(),
            paths: vec![property.to_string()],
        };
        shared_load(ctx, key, done, move |ctx, done| ctx.transport.fetch_list(request, done), fill);
    } else {
        let request = ObjectRequest {
            type_name: entity.type_name().to_string(),
            ids: vec![entity.id()],
            paths: vec![property.to_string()],
            changes: Vec::new(),
        };
        shared_load(ctx, key, done, move |ctx, done| ctx.transport.fetch_objects(request, done), fill);
    }
}

fn shared_load<S, C>(ctx: &Arc<SyncContext>, key: String, done: Callback<()>, start: S, complete: C)
where
    S: FnOnce(&Arc<SyncContext>, Callback<ServerResult>),
    C: FnOnce(&SyncContext) + Send + 'static,
{
    let (load, first) = {
        let mut loads = ctx.loads.lock();
        match loads.get(&key) {
            Some(load) => (load.clone(), false),
            None => {
                let load = PendingLoad {
                    signal: Signal::new(key.clone()),
                    failure: Arc::new(Mutex::new(None)),
                };
                load.signal.pending();
                loads.insert(key.clone(), load.clone());
                (load, true)
            }
        }
    };

    let failure = Arc::clone(&load.failure);
    load.signal.wait_for_all(move || {
        let failed = failure.lock().clone();
        done(failed.map_or(Ok(()), Err));
    });
    if !first {
        return;
    }

    debug!(key = %key, "loading");
    let loader = Arc::clone(ctx);
    start(
        ctx,
        Box::new(move |result| match result {
            Ok(result) => {
                let finisher = Arc::clone(&loader);
                instances::apply_instances(
                    &loader,
                    result.instances,
                    Box::new(move |applied| {
                        if applied.is_ok() {
                            complete(&finisher);
                        }
                        settle(&finisher, &key, &load, applied);
                    }),
                );
            }
            Err(e) => settle(&loader, &key, &load, Err(e)),
        }),
    );
}

fn settle(ctx: &SyncContext, key: &str, load: &PendingLoad, outcome: SyncResult<()>) {
    if let Err(e) = outcome {
        warn!(key, error = %e, "load failed");
        *load.failure.lock() = Some(e);
    }
    ctx.loads.lock().remove(key);
    load.signal.done();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, Operation, TransportCall};
    use exograph_model::{Model, PropertyMeta, ValueType};
    use exograph_protocol::{InstanceData, OriginTag, PropertyInfo};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(transport: Arc<MockTransport>) -> Arc<SyncContext> {
        let ctx = SyncContext::new(Arc::new(Model::new()), transport, Vec::new());
        ctx.model.add_observer(ctx.observer());
        ctx.model
            .define_type(
                EntityType::builder("Driver")
                    .property(PropertyMeta::value("Name", ValueType::String))
                    .property(PropertyMeta::reference("Cars", "Driver").list())
                    .build(),
            )
            .unwrap();
        ctx
    }

    fn counter() -> (Arc<AtomicUsize>, Callback<()>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Box::new(move |r: SyncResult<()>| {
                if r.is_ok() {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
    }

    #[test]
    fn concurrent_loads_share_one_request() {
        let transport = Arc::new(MockTransport::deferred());
        transport.respond(
            Operation::Objects,
            Ok(ServerResult::new().with_instance(
                "Driver",
                "1",
                InstanceData::Fields(vec![json!("Ann"), json!([])]),
            )),
        );
        let ctx = setup(transport.clone());
        let ghost = ctx.model.get_or_ghost("Driver", "1").unwrap();

        let (first, done_first) = counter();
        let (second, done_second) = counter();
        ensure_loaded(&ctx, &ghost, None, done_first);
        ensure_loaded(&ctx, &ghost, None, done_second);
        assert_eq!(transport.calls().len(), 1);

        transport.deliver_all();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(ghost.is_loaded());
        assert_eq!(
            ctx.model.value(&ghost, "Name").unwrap(),
            Some(Value::Text("Ann".into()))
        );
    }

    #[test]
    fn failed_load_reaches_every_waiter() {
        let transport = Arc::new(MockTransport::deferred());
        transport.respond(Operation::Objects, Err(SyncError::Timeout));
        let ctx = setup(transport.clone());
        let ghost = ctx.model.get_or_ghost("Driver", "1").unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let e = Arc::clone(&errors);
            ensure_loaded(
                &ctx,
                &ghost,
                None,
                Box::new(move |r| {
                    if r == Err(SyncError::Timeout) {
                        e.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            );
        }
        transport.deliver_all();
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert!(!ghost.is_loaded());
        assert!(ctx.loads.lock().is_empty());
    }

    #[test]
    fn list_property_uses_list_provider() {
        let transport = Arc::new(MockTransport::new());
        let ctx = setup(transport.clone());
        let ghost = ctx.model.get_or_ghost("Driver", "1").unwrap();
        ctx.model.mark_loaded(&ghost);

        let (done_count, done) = counter();
        ensure_loaded(&ctx, &ghost, Some("Cars"), done);
        assert_eq!(done_count.load(Ordering::SeqCst), 1);
        assert!(matches!(transport.calls()[0], TransportCall::List(_)));
        assert_eq!(ctx.model.list(&ghost, "Cars").unwrap(), Some(vec![]));
    }

    #[test]
    fn type_chain_defines_bases_first() {
        let transport = Arc::new(MockTransport::new());
        transport.add_type_chain(
            "Truck",
            vec![
                TypeInfo {
                    name: "Vehicle".into(),
                    base_type: None,
                    origin: OriginTag::Server,
                    properties: vec![PropertyInfo::new("Wheels", "Integer")],
                },
                TypeInfo {
                    name: "Truck".into(),
                    base_type: Some("Vehicle".into()),
                    origin: OriginTag::Server,
                    properties: vec![],
                },
            ],
        );
        let ctx = setup(transport);
        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        load_type(&ctx, "Truck", Box::new(move |t| *r.lock() = Some(t)));
        let truck = match result.lock().take() {
            Some(Ok(ty)) => ty,
            other => panic!("unexpected {other:?}"),
        };
        assert!(truck.is_subtype_of("Vehicle"));
        assert!(truck.property("Wheels").is_some());
    }
}
