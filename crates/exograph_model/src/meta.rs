//! Type metadata.

use exograph_protocol::{OriginTag, PropertyInfo, TypeInfo};
use std::sync::Arc;

/// Where a type or property was defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Defined by server-provided metadata.
    Server,
    /// Added by client code only.
    Client,
}

impl From<OriginTag> for Origin {
    fn from(tag: OriginTag) -> Self {
        match tag {
            OriginTag::Server => Origin::Server,
            OriginTag::Client => Origin::Client,
        }
    }
}

/// Primitive value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `true` / `false`.
    Boolean,
    /// Whole numbers.
    Integer,
    /// Any number.
    Number,
    /// Text.
    String,
    /// Date and time (UTC).
    Date,
    /// Anything that is not an entity.
    Object,
}

impl ValueType {
    /// Maps a wire type name to a value type.
    ///
    /// Returns `None` for names that denote entity types.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Boolean" => Some(ValueType::Boolean),
            "Integer" => Some(ValueType::Integer),
            "Number" => Some(ValueType::Number),
            "String" => Some(ValueType::String),
            "Date" => Some(ValueType::Date),
            "Object" => Some(ValueType::Object),
            _ => None,
        }
    }
}

/// The type of values a property holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyType {
    /// A primitive value.
    Value(ValueType),
    /// A reference to an entity of the named type.
    Entity(String),
}

impl PropertyType {
    /// Parses a wire type name.
    pub fn from_name(name: &str) -> Self {
        ValueType::from_name(name)
            .map(PropertyType::Value)
            .unwrap_or_else(|| PropertyType::Entity(name.to_string()))
    }
}

/// Metadata of one property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMeta {
    /// Property name.
    pub name: String,
    /// Name of the type that declares the property.
    pub declaring_type: String,
    /// Where the property was defined.
    pub origin: Origin,
    /// Whether the property is static (shared, not per-instance).
    pub is_static: bool,
    /// Whether the property holds a list.
    pub is_list: bool,
    /// Type of the property's values.
    pub property_type: PropertyType,
}

impl PropertyMeta {
    /// Creates a server-origin, instance-level scalar property.
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            declaring_type: String::new(),
            origin: Origin::Server,
            is_static: false,
            is_list: false,
            property_type,
        }
    }

    /// Creates a primitive property.
    pub fn value(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::new(name, PropertyType::Value(value_type))
    }

    /// Creates an entity reference property.
    pub fn reference(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Entity(type_name.into()))
    }

    /// Marks the property as a list.
    pub fn list(mut self) -> Self {
        self.is_list = true;
        self
    }

    /// Marks the property as static.
    pub fn shared(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Sets the origin.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Returns the referenced entity type name, for entity properties.
    pub fn entity_type(&self) -> Option<&str> {
        match &self.property_type {
            PropertyType::Entity(name) => Some(name),
            PropertyType::Value(_) => None,
        }
    }

    /// Returns true for entity-typed properties.
    pub fn is_entity(&self) -> bool {
        self.entity_type().is_some()
    }

    fn from_info(info: &PropertyInfo) -> Self {
        Self {
            name: info.name.clone(),
            declaring_type: String::new(),
            origin: info.origin.into(),
            is_static: info.is_static,
            is_list: info.is_list,
            property_type: PropertyType::from_name(&info.type_name),
        }
    }
}

/// Metadata of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    name: String,
    base: Option<Arc<EntityType>>,
    origin: Origin,
    properties: Vec<Arc<PropertyMeta>>,
}

impl EntityType {
    /// Starts building a server-origin type.
    pub fn builder(name: impl Into<String>) -> TypeBuilder {
        TypeBuilder {
            name: name.into(),
            base: None,
            origin: Origin::Server,
            properties: Vec::new(),
        }
    }

    /// Builds a type from provider metadata.
    pub fn from_info(info: &TypeInfo, base: Option<Arc<EntityType>>) -> Self {
        let mut builder = Self::builder(info.name.clone()).origin(info.origin.into());
        if let Some(base) = base {
            builder = builder.base(base);
        }
        for p in &info.properties {
            builder = builder.property(PropertyMeta::from_info(p));
        }
        builder.build()
    }

    /// Returns the type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the base type.
    pub fn base(&self) -> Option<&Arc<EntityType>> {
        self.base.as_ref()
    }

    /// Returns where the type was defined.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Returns the name of the base-most type, which scopes ids.
    pub fn root_name(&self) -> &str {
        match &self.base {
            Some(base) => base.root_name(),
            None => &self.name,
        }
    }

    /// Returns true if this type is `name` or derives from it.
    pub fn is_subtype_of(&self, name: &str) -> bool {
        self.name == name || self.base.as_ref().is_some_and(|b| b.is_subtype_of(name))
    }

    /// Returns the properties declared by this type only.
    pub fn own_properties(&self) -> &[Arc<PropertyMeta>] {
        &self.properties
    }

    /// Looks up a property by name, walking base types.
    pub fn property(&self, name: &str) -> Option<&Arc<PropertyMeta>> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .or_else(|| self.base.as_ref().and_then(|b| b.property(name)))
    }

    /// Returns every property, base type properties first.
    pub fn all_properties(&self) -> Vec<Arc<PropertyMeta>> {
        let mut all = self
            .base
            .as_ref()
            .map(|b| b.all_properties())
            .unwrap_or_default();
        all.extend(self.properties.iter().cloned());
        all
    }

    /// Looks up a property by its position in [`all_properties`](Self::all_properties).
    pub fn property_at(&self, index: usize) -> Option<Arc<PropertyMeta>> {
        self.all_properties().get(index).cloned()
    }
}

/// Builder for [`EntityType`].
#[derive(Debug)]
pub struct TypeBuilder {
    name: String,
    base: Option<Arc<EntityType>>,
    origin: Origin,
    properties: Vec<PropertyMeta>,
}

impl TypeBuilder {
    /// Sets the base type.
    pub fn base(mut self, base: Arc<EntityType>) -> Self {
        self.base = Some(base);
        self
    }

    /// Sets the origin.
    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Declares a property.
    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }

    /// Finishes the type.
    pub fn build(self) -> EntityType {
        let name = self.name;
        let properties = self
            .properties
            .into_iter()
            .map(|mut p| {
                p.declaring_type = name.clone();
                Arc::new(p)
            })
            .collect();
        EntityType {
            name,
            base: self.base,
            origin: self.origin,
            properties,
        }
    }
}
