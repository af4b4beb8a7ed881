//! Discriminator-based polymorphism.
//!
//! Discriminators form a closed lookup from discriminator text to type.
//! Class maps register theirs on registration; other runtime types
//! register theirs the first time a value of that type is written. On read,
//! text that is neither registered nor the name of a known built-in type is
//! a mapping error.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::class_map::{DISCRIMINATOR_ELEMENT, WRAPPED_VALUE_ELEMENT};
use super::native::{NativeValue, TypeRef};
use super::serializer::{SerializationContext, Serializer, is_natural, natural_native, unexpected_bson};
use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::value::Bson;

/// Discriminator text to type, append-only.
#[derive(Debug, Default)]
pub struct DiscriminatorRegistry {
    by_discriminator: RwLock<HashMap<String, TypeRef>>,
}

impl DiscriminatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a discriminator. Registering the same pair again is a no-op;
    /// reusing a discriminator for a different type is an error.
    pub fn register(&self, discriminator: &str, ty: &TypeRef) -> BsonResult<()> {
        if let Some(existing) = self.by_discriminator.read().get(discriminator) {
            return Self::check_same(discriminator, existing, ty);
        }
        let mut map = self.by_discriminator.write();
        match map.get(discriminator) {
            Some(existing) => Self::check_same(discriminator, existing, ty),
            None => {
                debug!(discriminator, ty = %ty, "registered discriminator");
                map.insert(discriminator.to_string(), ty.clone());
                Ok(())
            }
        }
    }

    fn check_same(discriminator: &str, existing: &TypeRef, ty: &TypeRef) -> BsonResult<()> {
        if existing == ty {
            Ok(())
        } else {
            Err(BsonError::invalid_operation(format!(
                "discriminator {:?} is already used by {}",
                discriminator, existing
            )))
        }
    }

    pub fn get(&self, discriminator: &str) -> Option<TypeRef> {
        self.by_discriminator.read().get(discriminator).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_discriminator.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes values of a polymorphic static type together with a
/// discriminator naming their runtime type.
///
/// Documents get `_t` as their first element; other values are wrapped
/// as `{ "_t" : ..., "_v" : ... }`. Values of the nominal type's natural
/// runtime type are written plainly unless `always` is set.
#[derive(Debug, Clone)]
pub struct DiscriminatedSerializer {
    nominal: TypeRef,
    always: bool,
}

impl DiscriminatedSerializer {
    pub fn new(nominal: TypeRef) -> Self {
        Self {
            nominal,
            always: false,
        }
    }

    /// A serializer that writes the discriminator for every value.
    pub fn always(nominal: TypeRef) -> Self {
        Self {
            nominal,
            always: true,
        }
    }

    /// The runtime type written without a discriminator.
    fn default_runtime_type(&self) -> Option<TypeRef> {
        match &self.nominal {
            TypeRef::Enumerable(item) => Some(TypeRef::List(item.clone())),
            TypeRef::Object => None,
            other => Some(other.clone()),
        }
    }

    fn needs_discriminator(&self, actual: &TypeRef) -> bool {
        if self.always {
            return true;
        }
        if self.nominal == TypeRef::Object {
            return !is_natural(actual);
        }
        self.default_runtime_type().as_ref() != Some(actual)
    }
}

/// Put `_t` in front of an existing document.
fn with_discriminator(discriminator: &str, document: Document) -> Document {
    let mut out = Document::with_capacity(document.len() + 1);
    out.insert(DISCRIMINATOR_ELEMENT, discriminator);
    for (name, value) in document {
        if name != DISCRIMINATOR_ELEMENT {
            out.insert(name, value);
        }
    }
    out
}

impl Serializer for DiscriminatedSerializer {
    fn value_type(&self) -> TypeRef {
        self.nominal.clone()
    }

    fn serialize(&self, ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let Some(actual) = value.runtime_type() else {
            return Ok(Bson::Null);
        };
        let registry = ctx.registry();
        if !registry.is_assignable(&actual, &self.nominal) {
            return Err(BsonError::mapping(format!(
                "a value of type {} cannot be stored as {}",
                actual, self.nominal
            )));
        }
        let written = ctx.lookup(&actual)?.serialize(ctx, value)?;
        if !self.needs_discriminator(&actual) {
            return Ok(written);
        }
        let discriminator = registry.discriminator_for(&actual)?;
        Ok(Bson::Document(match written {
            Bson::Document(document) if matches!(actual, TypeRef::Class(_)) => {
                with_discriminator(&discriminator, document)
            }
            other => {
                let mut wrapper = Document::with_capacity(2);
                wrapper.insert(DISCRIMINATOR_ELEMENT, discriminator);
                wrapper.insert(WRAPPED_VALUE_ELEMENT, other);
                wrapper
            }
        }))
    }

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        let registry = ctx.registry();
        match value {
            Bson::Null => Ok(NativeValue::Null),
            Bson::Document(document) if document.contains_key(DISCRIMINATOR_ELEMENT) => {
                let discriminator = document
                    .get_str(DISCRIMINATOR_ELEMENT)
                    .map_err(|_| BsonError::mapping("discriminator must be a string"))?;
                let actual = registry.resolve_discriminator(discriminator)?;
                if !registry.is_assignable(&actual, &self.nominal) {
                    return Err(BsonError::mapping(format!(
                        "discriminator {:?} names {}, which is not assignable to {}",
                        discriminator, actual, self.nominal
                    )));
                }
                let serializer = ctx.lookup(&actual)?;
                if matches!(actual, TypeRef::Class(_)) {
                    return serializer.deserialize(ctx, value);
                }
                let wrapped = document.get(WRAPPED_VALUE_ELEMENT).filter(|_| document.len() == 2).ok_or_else(|| {
                    BsonError::format(format!("a {} value must be wrapped as {{ _t, _v }}", actual))
                })?;
                serializer.deserialize(ctx, wrapped)
            }
            other => match &self.nominal {
                TypeRef::Object => deserialize_object(ctx, other),
                _ => match self.default_runtime_type() {
                    Some(default) => ctx.lookup(&default)?.deserialize(ctx, other),
                    None => Err(unexpected_bson(&self.nominal, other)),
                },
            },
        }
    }
}

/// Read a value with no static type information beyond `Object`.
fn deserialize_object(ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
    if let Some(native) = natural_native(value) {
        return Ok(native);
    }
    let object = DiscriminatedSerializer::new(TypeRef::Object);
    match value {
        Bson::Array(items) => Ok(NativeValue::list(
            TypeRef::Object,
            items
                .iter()
                .map(|item| object.deserialize(ctx, item))
                .collect::<BsonResult<_>>()?,
        )),
        Bson::Document(document) => {
            let mut entries = indexmap::IndexMap::with_capacity(document.len());
            for (name, item) in document {
                entries.insert(name.clone(), object.deserialize(ctx, item)?);
            }
            Ok(NativeValue::Dictionary {
                value_type: TypeRef::Object,
                entries,
            })
        }
        other => Ok(NativeValue::Bson(other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::class_map::{ClassMapBuilder, ConventionPack, MemberMapBuilder};
    use crate::serialization::native::Instance;
    use crate::serialization::registry::SerializerRegistry;
    use crate::{array, doc};
    use pretty_assertions::assert_eq;

    fn animals() -> SerializerRegistry {
        let registry = SerializerRegistry::new();
        let conventions = ConventionPack::new();
        registry
            .register_class_map(
                ClassMapBuilder::new("Animal")
                    .set_abstract(true)
                    .member(MemberMapBuilder::new("Name", TypeRef::String))
                    .freeze(&conventions)
                    .unwrap(),
            )
            .unwrap();
        registry
            .register_class_map(
                ClassMapBuilder::new("Cat")
                    .base("Animal")
                    .member(MemberMapBuilder::new("Lives", TypeRef::Int32))
                    .freeze(&conventions)
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_hash_set_wrapped_with_discriminator() {
        let registry = SerializerRegistry::new();
        let ctx = SerializationContext::new(&registry);
        let serializer = DiscriminatedSerializer::always(TypeRef::hash_set(TypeRef::Int32));
        let set = NativeValue::hash_set(TypeRef::Int32, vec![1.into(), 2.into()]);
        let wire = serializer.serialize(&ctx, &set).unwrap();
        assert_eq!(
            wire,
            Bson::Document(doc! { "_t" => "HashSet<Int32>", "_v" => array![1, 2] })
        );
        assert_eq!(
            wire.to_string(),
            r#"{ "_t" : "HashSet<Int32>", "_v" : [1, 2] }"#
        );
        let read = serializer.deserialize(&ctx, &wire).unwrap();
        assert_eq!(read, set);
        assert_eq!(read.runtime_type(), Some(TypeRef::hash_set(TypeRef::Int32)));
    }

    #[test]
    fn test_enumerable_defaults_to_list() {
        let registry = SerializerRegistry::new();
        let ctx = SerializationContext::new(&registry);
        let serializer = registry.lookup(&TypeRef::enumerable(TypeRef::Int32)).unwrap();
        let list = NativeValue::list(TypeRef::Int32, vec![1.into()]);
        assert_eq!(serializer.serialize(&ctx, &list).unwrap(), array![1]);
        let set = NativeValue::hash_set(TypeRef::Int32, vec![1.into()]);
        let wire = serializer.serialize(&ctx, &set).unwrap();
        assert_eq!(serializer.deserialize(&ctx, &wire).unwrap(), set);
        assert_eq!(serializer.deserialize(&ctx, &array![1]).unwrap(), list);
    }

    #[test]
    fn test_unknown_discriminator_is_mapping_error() {
        let registry = animals();
        let ctx = SerializationContext::new(&registry);
        let serializer = registry.lookup(&TypeRef::class("Animal")).unwrap();
        let err = serializer
            .deserialize(&ctx, &Bson::Document(doc! { "_t" => "Dog", "Name" => "Rex" }))
            .unwrap_err();
        assert!(err.is_mapping_error());

        let object = DiscriminatedSerializer::new(TypeRef::Object);
        let err = object
            .deserialize(&ctx, &Bson::Document(doc! { "_t" => "Nope<Int32>", "_v" => 1 }))
            .unwrap_err();
        assert!(err.is_mapping_error());
    }

    #[test]
    fn test_derived_class_through_base() {
        let registry = animals();
        let ctx = SerializationContext::new(&registry);
        let serializer = registry.lookup(&TypeRef::class("Animal")).unwrap();
        let cat = NativeValue::Object(Instance::new("Cat").with("Name", "Tom").with("Lives", 9));
        let wire = serializer.serialize(&ctx, &cat).unwrap();
        assert_eq!(wire, Bson::Document(doc! { "_t" => "Cat", "Name" => "Tom", "Lives" => 9 }));
        assert_eq!(serializer.deserialize(&ctx, &wire).unwrap(), cat);
    }

    #[test]
    fn test_abstract_without_discriminator() {
        let registry = animals();
        let ctx = SerializationContext::new(&registry);
        let serializer = registry.lookup(&TypeRef::class("Animal")).unwrap();
        let err = serializer
            .deserialize(&ctx, &Bson::Document(doc! { "Name" => "Tom" }))
            .unwrap_err();
        assert!(err.is_mapping_error());
    }

    #[test]
    fn test_object_members() {
        let registry = animals();
        let ctx = SerializationContext::new(&registry);
        let object = registry.lookup(&TypeRef::Object).unwrap();
        assert_eq!(object.serialize(&ctx, &NativeValue::Int32(5)).unwrap(), Bson::Int32(5));
        let cat = NativeValue::Object(Instance::new("Cat").with("Name", "Tom").with("Lives", 1));
        let wire = object.serialize(&ctx, &cat).unwrap();
        assert_eq!(wire.as_document().unwrap().first().unwrap().0, "_t");
        assert_eq!(object.deserialize(&ctx, &wire).unwrap(), cat);
        assert_eq!(object.deserialize(&ctx, &Bson::String("x".into())).unwrap(), NativeValue::from("x"));
    }

    #[test]
    fn test_incompatible_discriminator_rejected() {
        let registry = animals();
        let ctx = SerializationContext::new(&registry);
        let serializer = DiscriminatedSerializer::new(TypeRef::enumerable(TypeRef::String));
        let wire = Bson::Document(doc! { "_t" => "HashSet<Int32>", "_v" => array![1] });
        assert!(serializer.deserialize(&ctx, &wire).unwrap_err().is_mapping_error());
    }

    #[test]
    fn test_discriminator_conflicts() {
        let discriminators = DiscriminatorRegistry::new();
        discriminators.register("A", &TypeRef::class("A")).unwrap();
        discriminators.register("A", &TypeRef::class("A")).unwrap();
        let err = discriminators.register("A", &TypeRef::class("B")).unwrap_err();
        assert!(err.is_invalid_operation());
        assert_eq!(discriminators.len(), 1);
    }
}
