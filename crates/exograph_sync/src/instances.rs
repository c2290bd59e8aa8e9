//! Merging server instance data into the entity graph.

use crate::context::SyncContext;
use crate::convert::value_from_wire;
use crate::error::{SyncError, SyncResult};
use crate::resolve::try_get_type;
use crate::signal::Signal;
use crate::transport::Callback;
use exograph_model::{Entity, EntityType, PropertyMeta, PropertyType, Value};
use exograph_protocol::{InstanceData, Instances};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{debug, error};

/// Applies instance data: unknown types are fetched first, then every
/// instance is registered (as a ghost if new to the client), its
/// properties initialized and the entity marked loaded.
///
/// Runs under the applying latch, so nothing it does is captured.
pub(crate) fn apply_instances(ctx: &Arc<SyncContext>, instances: Instances, done: Callback<()>) {
    if instances.is_empty() {
        return done(Ok(()));
    }

    let signal = Signal::new("apply_instances");
    let failure: Arc<Mutex<Option<SyncError>>> = Arc::new(Mutex::new(None));
    for type_name in instances.keys() {
        if ctx.model.ty(type_name).is_some() {
            continue;
        }
        let failure = Arc::clone(&failure);
        try_get_type(
            ctx,
            type_name,
            true,
            Box::new(signal.pending_callback(move |result: SyncResult<Arc<EntityType>>| {
                if let Err(e) = result {
                    *failure.lock() = Some(e);
                }
            })),
        );
    }

    let ctx = Arc::clone(ctx);
    signal.wait_for_all(move || {
        let failed = failure.lock().take();
        match failed {
            Some(e) => done(Err(e)),
            None => {
                apply_now(&ctx, &instances);
                done(Ok(()))
            }
        }
    });
}

fn apply_now(ctx: &SyncContext, instances: &Instances) {
    let _applying = ctx.applying();
    for (type_name, objects) in instances {
        for (id, data) in objects {
            let applied = ctx
                .find_or_ghost(type_name, id)
                .and_then(|entity| apply_instance(ctx, &entity, data).map(|_| entity));
            match applied {
                Ok(entity) => ctx.model.mark_loaded(&entity),
                Err(e) => error!(type_name = %type_name, id = %id, error = %e, "could not apply instance data"),
            }
        }
    }
}

fn apply_instance(ctx: &SyncContext, entity: &Entity, data: &InstanceData) -> SyncResult<()> {
    match data {
        InstanceData::Fields(values) => {
            let properties = entity.entity_type().all_properties();
            for (prop, json) in properties.iter().zip(values) {
                init_property(ctx, entity, prop, json)?;
            }
        }
        InstanceData::Named(values) => {
            for (name, json) in values {
                match entity.entity_type().property(name).cloned() {
                    Some(prop) => init_property(ctx, entity, &prop, json)?,
                    None => debug!(entity = ?entity, property = %name, "ignoring unknown property"),
                }
            }
        }
    }
    Ok(())
}

fn init_property(
    ctx: &SyncContext,
    entity: &Entity,
    prop: &PropertyMeta,
    json: &Json,
) -> SyncResult<()> {
    if prop.is_list {
        let items = match json {
            Json::Array(items) => items
                .iter()
                .map(|item| value_for(ctx, prop, item))
                .collect::<SyncResult<Vec<_>>>()?,
            Json::Null => Vec::new(),
            other => {
                return Err(SyncError::InvalidChange {
                    type_name: entity.type_name().to_string(),
                    property: prop.name.clone(),
                    reason: format!("expected a list, got {other}"),
                })
            }
        };
        ctx.model.init_list(entity, &prop.name, items)?;
    } else {
        let value = value_for(ctx, prop, json)?;
        ctx.model.init_value(entity, &prop.name, value)?;
    }
    Ok(())
}

/// Converts one JSON value of `prop` to a model value, resolving entity
/// references (as `{type, id}` objects or bare ids) to registered entities
/// or new ghosts.
pub(crate) fn value_for(ctx: &SyncContext, prop: &PropertyMeta, json: &Json) -> SyncResult<Value> {
    match &prop.property_type {
        PropertyType::Value(value_type) => Ok(value_from_wire(json, Some(*value_type))),
        PropertyType::Entity(declared) => {
            let (type_name, id) = match json {
                Json::Null => return Ok(Value::Null),
                Json::String(id) => (declared.clone(), id.clone()),
                Json::Number(n) => (declared.clone(), n.to_string()),
                Json::Object(map) => {
                    let id = match map.get("id") {
                        Some(Json::String(s)) => s.clone(),
                        Some(Json::Number(n)) => n.to_string(),
                        _ => return Err(bad_reference(prop, json)),
                    };
                    let type_name = map
                        .get("type")
                        .and_then(Json::as_str)
                        .filter(|t| {
                            ctx.model
                                .ty(t)
                                .is_some_and(|ty| ty.is_subtype_of(declared))
                        })
                        .unwrap_or(declared)
                        .to_string();
                    (type_name, id)
                }
                _ => return Err(bad_reference(prop, json)),
            };
            Ok(Value::Entity(ctx.find_or_ghost(&type_name, &id)?))
        }
    }
}

fn bad_reference(prop: &PropertyMeta, json: &Json) -> SyncError {
    SyncError::InvalidChange {
        type_name: prop.declaring_type.clone(),
        property: prop.name.clone(),
        reason: format!("not an entity reference: {json}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use exograph_model::{Model, ValueType};
    use exograph_protocol::{OriginTag, PropertyInfo, TypeInfo};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn setup() -> (Arc<SyncContext>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let ctx = SyncContext::new(Arc::new(Model::new()), transport.clone(), Vec::new());
        ctx.model.add_observer(ctx.observer());
        ctx.model
            .define_type(
                EntityType::builder("Driver")
                    .property(PropertyMeta::value("Name", ValueType::String))
                    .property(PropertyMeta::value("Born", ValueType::Date))
                    .property(PropertyMeta::reference("Cars", "Car").list())
                    .build(),
            )
            .unwrap();
        transport.add_type(TypeInfo {
            name: "Car".into(),
            base_type: None,
            origin: OriginTag::Server,
            properties: vec![PropertyInfo::new("Owner", "Driver")],
        });
        (ctx, transport)
    }

    fn apply(ctx: &Arc<SyncContext>, instances: Instances) -> SyncResult<()> {
        let outcome = Arc::new(Mutex::new(None));
        let o = Arc::clone(&outcome);
        apply_instances(ctx, instances, Box::new(move |r| *o.lock() = Some(r)));
        let result = outcome.lock().take();
        result.unwrap_or(Err(SyncError::Cancelled))
    }

    fn instances(entries: Vec<(&str, &str, InstanceData)>) -> Instances {
        let mut out: Instances = BTreeMap::new();
        for (ty, id, data) in entries {
            out.entry(ty.to_string())
                .or_default()
                .insert(id.to_string(), data);
        }
        out
    }

    #[test]
    fn positional_data_fills_properties_and_ghosts_references() {
        let (ctx, _) = setup();
        try_get_type(&ctx, "Car", true, Box::new(|_| {}));
        apply(
            &ctx,
            instances(vec![(
                "Driver",
                "1",
                InstanceData::Fields(vec![
                    json!("Ann"),
                    json!("1990-05-01T00:00:00.000Z"),
                    json!([{"type": "Car", "id": "5"}, "6"]),
                ]),
            )]),
        )
        .unwrap();

        let driver = ctx.model.get("Driver", "1").unwrap();
        assert!(driver.is_loaded());
        assert!(matches!(ctx.model.value(&driver, "Born").unwrap(), Some(Value::Date(_))));
        let cars = ctx.model.list(&driver, "Cars").unwrap().unwrap();
        assert_eq!(cars.len(), 2);
        let car = cars[0].as_entity().unwrap();
        assert_eq!(car.id(), "5");
        assert!(!car.is_loaded());
    }

    #[test]
    fn named_data_updates_registered_entities() {
        let (ctx, _) = setup();
        let driver = ctx.model.create("Driver").unwrap();
        let mut named = serde_json::Map::new();
        named.insert("Name".into(), json!("Bea"));
        named.insert("Unknown".into(), json!(1));
        apply(
            &ctx,
            instances(vec![("Driver", &driver.id(), InstanceData::Named(named))]),
        )
        .unwrap();
        assert_eq!(
            ctx.model.value(&driver, "Name").unwrap(),
            Some(Value::Text("Bea".into()))
        );
        assert!(!ctx.is_applying());
    }

    #[test]
    fn unknown_instance_type_fails() {
        let (ctx, _) = setup();
        let result = apply(
            &ctx,
            instances(vec![("Boat", "1", InstanceData::Fields(vec![]))]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn instance_types_are_fetched() {
        let (ctx, _) = setup();
        apply(
            &ctx,
            instances(vec![("Car", "9", InstanceData::Fields(vec![json!(null)]))]),
        )
        .unwrap();
        let car = ctx.model.get("Car", "9").unwrap();
        assert_eq!(ctx.model.value(&car, "Owner").unwrap(), Some(Value::Null));
    }
}
