//! The serializer registry.
//!
//! Resolution is memoized per type and per (class, member). Both memos are
//! append-only: once a serializer is published for a key it is never
//! replaced, so concurrent lookups always agree.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use smol_str::SmolStr;
use tracing::debug;

use super::class_map::{ClassMap, ClassMapSerializer};
use super::collection::{CollectionSerializer, DictionarySerializer};
use super::discriminator::{DiscriminatedSerializer, DiscriminatorRegistry};
use super::native::{NativeValue, TypeRef};
use super::options::SerializerOptions;
use super::serializer::{
    BooleanSerializer, BsonValueSerializer, BytesSerializer, CharSerializer, DateTimeSerializer,
    EnumMap, EnumSerializer, GuidSerializer, NullableSerializer, NumericSerializer,
    ObjectIdSerializer, SerializationContext, SerializerRef, StringSerializer,
};
use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::guid::GuidRepresentation;
use crate::value::Bson;

/// Deepest class hierarchy followed before giving up.
const MAX_HIERARCHY_DEPTH: usize = 64;

/// Resolves serializers for types and class members.
#[derive(Debug, Default)]
pub struct SerializerRegistry {
    guid_representation: GuidRepresentation,
    class_maps: RwLock<HashMap<SmolStr, Arc<ClassMap>>>,
    enums: RwLock<HashMap<SmolStr, Arc<EnumMap>>>,
    by_type: RwLock<HashMap<TypeRef, SerializerRef>>,
    by_class: RwLock<HashMap<SmolStr, Arc<ClassMapSerializer>>>,
    by_member: RwLock<HashMap<(SmolStr, SmolStr), SerializerRef>>,
    discriminators: DiscriminatorRegistry,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte order used for GUID members that do not choose their own.
    pub fn with_guid_representation(mut self, representation: GuidRepresentation) -> Self {
        self.guid_representation = representation;
        self
    }

    pub fn guid_representation(&self) -> GuidRepresentation {
        self.guid_representation
    }

    pub fn context(&self) -> SerializationContext<'_> {
        SerializationContext::new(self)
    }

    pub fn discriminators(&self) -> &DiscriminatorRegistry {
        &self.discriminators
    }

    /// Register a frozen class map. Its base class must already be known.
    pub fn register_class_map(&self, class_map: Arc<ClassMap>) -> BsonResult<()> {
        let name = SmolStr::new(class_map.name());
        if let Some(base) = class_map.base() {
            if base == name {
                return Err(BsonError::mapping(format!("class {} cannot derive from itself", name)));
            }
            if !self.class_maps.read().contains_key(base) {
                return Err(BsonError::mapping(format!(
                    "base class {} of {} is not registered",
                    base, name
                )));
            }
        }
        {
            let mut maps = self.class_maps.write();
            if maps.contains_key(&name) {
                return Err(BsonError::invalid_operation(format!(
                    "a class map for {} is already registered",
                    name
                )));
            }
            maps.insert(name.clone(), class_map.clone());
        }
        self.discriminators
            .register(class_map.discriminator(), &TypeRef::Class(name.clone()))?;
        debug!(class = %name, discriminator = class_map.discriminator(), "registered class map");
        Ok(())
    }

    pub fn register_enum(&self, map: EnumMap) -> BsonResult<()> {
        let name = SmolStr::new(map.name());
        let mut enums = self.enums.write();
        if enums.contains_key(&name) {
            return Err(BsonError::invalid_operation(format!("enum {} is already registered", name)));
        }
        enums.insert(name, Arc::new(map));
        Ok(())
    }

    /// Use `serializer` for every value of `ty`. Fails once a serializer for
    /// the type has been published.
    pub fn register_serializer(&self, ty: TypeRef, serializer: SerializerRef) -> BsonResult<()> {
        let mut memo = self.by_type.write();
        if memo.contains_key(&ty) {
            return Err(BsonError::invalid_operation(format!(
                "a serializer for {} is already registered",
                ty
            )));
        }
        memo.insert(ty, serializer);
        Ok(())
    }

    pub fn class_map(&self, name: &str) -> Option<Arc<ClassMap>> {
        self.class_maps.read().get(name).cloned()
    }

    pub fn enum_map(&self, name: &str) -> Option<Arc<EnumMap>> {
        self.enums.read().get(name).cloned()
    }

    /// The serializer for values of `ty` with default options.
    pub fn lookup(&self, ty: &TypeRef) -> BsonResult<SerializerRef> {
        if let Some(found) = self.by_type.read().get(ty) {
            return Ok(found.clone());
        }
        crate::lodestar_debug!(ty = %ty, "serializer cache miss");
        let built = self.build(ty, &SerializerOptions::default())?;
        Ok(self.by_type.write().entry(ty.clone()).or_insert(built).clone())
    }

    /// The serializer for values of `ty` with member-specific options.
    pub fn lookup_with_options(&self, ty: &TypeRef, options: &SerializerOptions) -> BsonResult<SerializerRef> {
        if options.is_default() {
            self.lookup(ty)
        } else {
            self.build(ty, options)
        }
    }

    /// The serializer for one member of a class.
    pub fn member_serializer(&self, class: &str, member: &str) -> BsonResult<SerializerRef> {
        let key = (SmolStr::new(class), SmolStr::new(member));
        if let Some(found) = self.by_member.read().get(&key) {
            return Ok(found.clone());
        }
        let class_map = self
            .class_map(class)
            .ok_or_else(|| BsonError::mapping(format!("no class map registered for {}", class)))?;
        let member_map = class_map
            .member(member)
            .ok_or_else(|| BsonError::mapping(format!("class {} has no member {}", class, member)))?;
        let built = match member_map.explicit_serializer() {
            Some(serializer) => serializer.clone(),
            None => self.lookup_with_options(member_map.member_type(), member_map.options())?,
        };
        debug!(class, member, "resolved member serializer");
        Ok(self.by_member.write().entry(key).or_insert(built).clone())
    }

    /// The concrete serializer of a registered class.
    pub fn class_serializer(&self, name: &str) -> BsonResult<Arc<ClassMapSerializer>> {
        if let Some(found) = self.by_class.read().get(name) {
            return Ok(found.clone());
        }
        let chain = self.class_chain(name)?;
        let built = Arc::new(ClassMapSerializer::new(&chain)?);
        Ok(self
            .by_class
            .write()
            .entry(SmolStr::new(name))
            .or_insert(built)
            .clone())
    }

    /// Class maps from the root base class down to `name`.
    fn class_chain(&self, name: &str) -> BsonResult<Vec<Arc<ClassMap>>> {
        let mut chain = Vec::new();
        let mut current = Some(SmolStr::new(name));
        while let Some(class) = current {
            if chain.len() >= MAX_HIERARCHY_DEPTH {
                return Err(BsonError::mapping(format!("class hierarchy of {} is too deep", name)));
            }
            let map = self
                .class_map(&class)
                .ok_or_else(|| BsonError::mapping(format!("no class map registered for {}", class)))?;
            current = map.base().map(SmolStr::new);
            chain.push(map);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Whether `derived` is `base` or inherits from it.
    pub fn is_subclass_of(&self, derived: &str, base: &str) -> bool {
        let mut current = Some(SmolStr::new(derived));
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let Some(class) = current else {
                return false;
            };
            if class == base {
                return true;
            }
            current = self.class_map(&class).and_then(|m| m.base().map(SmolStr::new));
        }
        false
    }

    /// Whether a runtime value of type `actual` may be stored where `nominal`
    /// is declared.
    pub fn is_assignable(&self, actual: &TypeRef, nominal: &TypeRef) -> bool {
        if actual == nominal {
            return true;
        }
        match (actual, nominal) {
            (_, TypeRef::Object) => true,
            (_, TypeRef::Nullable(inner)) => self.is_assignable(actual, inner),
            (TypeRef::Class(derived), TypeRef::Class(base)) => self.is_subclass_of(derived, base),
            (actual, TypeRef::Enumerable(item)) => match actual.item_type() {
                Some(actual_item) => **item == TypeRef::Object || actual_item == &**item,
                None => false,
            },
            _ => false,
        }
    }

    /// The discriminator written for values of `ty`, registering it so it
    /// can be read back.
    pub fn discriminator_for(&self, ty: &TypeRef) -> BsonResult<String> {
        if let TypeRef::Class(name) = ty {
            let map = self
                .class_map(name)
                .ok_or_else(|| BsonError::mapping(format!("no class map registered for {}", name)))?;
            return Ok(map.discriminator().to_string());
        }
        let discriminator = ty.to_string();
        self.discriminators.register(&discriminator, ty)?;
        Ok(discriminator)
    }

    /// The type a discriminator names.
    pub fn resolve_discriminator(&self, discriminator: &str) -> BsonResult<TypeRef> {
        if let Some(ty) = self.discriminators.get(discriminator) {
            return Ok(ty);
        }
        let named = |name: &str| -> Option<TypeRef> {
            if let Some(ty) = self.discriminators.get(name) {
                return Some(ty);
            }
            if self.enums.read().contains_key(name) {
                return Some(TypeRef::Enum(SmolStr::new(name)));
            }
            None
        };
        TypeRef::parse_with(discriminator, &named).map_err(|_| {
            BsonError::mapping(format!("unknown discriminator {:?}", discriminator))
        })
    }

    fn build(&self, ty: &TypeRef, options: &SerializerOptions) -> BsonResult<SerializerRef> {
        let serializer: SerializerRef = match ty {
            TypeRef::Int16
            | TypeRef::Int32
            | TypeRef::Int64
            | TypeRef::UInt32
            | TypeRef::UInt64
            | TypeRef::Single
            | TypeRef::Double
            | TypeRef::Decimal
            | TypeRef::Decimal128 => Arc::new(NumericSerializer::new(ty.clone(), options)?),
            TypeRef::Bool => Arc::new(BooleanSerializer::new(options)?),
            TypeRef::String => Arc::new(StringSerializer::new(options)?),
            TypeRef::Char => Arc::new(CharSerializer::new(options)?),
            TypeRef::Guid => Arc::new(GuidSerializer::new(options, self.guid_representation)?),
            TypeRef::DateTime => Arc::new(DateTimeSerializer::new(options)?),
            TypeRef::ObjectId => Arc::new(ObjectIdSerializer::new(options)?),
            TypeRef::Bytes => Arc::new(BytesSerializer::new(options)?),
            TypeRef::Enum(name) => {
                let map = self
                    .enum_map(name)
                    .ok_or_else(|| BsonError::mapping(format!("no enum registered for {}", name)))?;
                Arc::new(EnumSerializer::new(map, options)?)
            }
            TypeRef::Class(name) => self.class_serializer(name)?,
            TypeRef::List(item) | TypeRef::HashSet(item) | TypeRef::Array(item) => {
                Arc::new(CollectionSerializer::new(ty.clone(), self.lookup(item)?)?)
            }
            TypeRef::Enumerable(_) | TypeRef::Object => Arc::new(DiscriminatedSerializer::new(ty.clone())),
            TypeRef::Dictionary(value) => Arc::new(DictionarySerializer::new(
                self.lookup(value)?,
                options.dictionary_representation,
            )),
            TypeRef::Nullable(inner) => Arc::new(NullableSerializer::new(self.lookup_with_options(inner, options)?)),
            TypeRef::BsonValue => Arc::new(BsonValueSerializer),
        };
        Ok(serializer)
    }

    /// Serialize a value whose wire form is a document, such as a class
    /// instance or a dictionary.
    pub fn serialize_document(&self, value: &NativeValue) -> BsonResult<Document> {
        let ty = value
            .runtime_type()
            .ok_or_else(|| BsonError::invalid_operation("cannot serialize null as a document"))?;
        match self.to_bson(&ty, value)? {
            Bson::Document(document) => Ok(document),
            other => Err(BsonError::invalid_operation(format!(
                "{} serializes to {}, not a document",
                ty,
                other.element_type()
            ))),
        }
    }

    pub fn deserialize_document(&self, ty: &TypeRef, document: &Document) -> BsonResult<NativeValue> {
        self.from_bson(ty, &Bson::Document(document.clone()))
    }

    pub fn to_bson(&self, ty: &TypeRef, value: &NativeValue) -> BsonResult<Bson> {
        self.lookup(ty)?.serialize(&self.context(), value)
    }

    pub fn from_bson(&self, ty: &TypeRef, value: &Bson) -> BsonResult<NativeValue> {
        self.lookup(ty)?.deserialize(&self.context(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementType;
    use crate::json::{JsonWriterSettings, document_to_json, parse_document};
    use crate::serialization::class_map::{ClassMapBuilder, ConventionPack, MemberMapBuilder};
    use crate::serialization::native::Instance;
    use pretty_assertions::assert_eq;
    use std::thread;

    #[test]
    fn test_lookup_is_memoized() {
        let registry = SerializerRegistry::new();
        let first = registry.lookup(&TypeRef::list(TypeRef::Int32)).unwrap();
        let second = registry.lookup(&TypeRef::list(TypeRef::Int32)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_lookups_agree() {
        let registry = Arc::new(SerializerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.lookup(&TypeRef::dictionary(TypeRef::Double)).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let published = registry.lookup(&TypeRef::dictionary(TypeRef::Double)).unwrap();
        // Racing builders may each build one, but only the first is ever published.
        assert!(results.iter().any(|r| Arc::ptr_eq(r, &published)));
    }

    #[test]
    fn test_member_options_are_per_member() {
        let registry = SerializerRegistry::new();
        let map = ClassMapBuilder::new("Order")
            .member(MemberMapBuilder::new("Total", TypeRef::Decimal).representation(ElementType::String))
            .member(MemberMapBuilder::new("Tax", TypeRef::Decimal))
            .freeze(&ConventionPack::new())
            .unwrap();
        registry.register_class_map(map).unwrap();
        let order = Instance::new("Order")
            .with("Total", rust_decimal::Decimal::new(1050, 2))
            .with("Tax", rust_decimal::Decimal::new(5, 1));
        let document = registry.serialize_document(&NativeValue::Object(order)).unwrap();
        assert_eq!(document.get("Total"), Some(&Bson::String("10.50".into())));
        assert!(matches!(document.get("Tax"), Some(Bson::Decimal128(_))));
        let a = registry.member_serializer("Order", "Total").unwrap();
        let b = registry.member_serializer("Order", "Total").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = SerializerRegistry::new();
        let map = ClassMapBuilder::new("A").freeze(&ConventionPack::new()).unwrap();
        registry.register_class_map(map.clone()).unwrap();
        assert!(registry.register_class_map(map).unwrap_err().is_invalid_operation());
        registry.lookup(&TypeRef::Int32).unwrap();
        let err = registry
            .register_serializer(TypeRef::Int32, Arc::new(BsonValueSerializer))
            .unwrap_err();
        assert!(err.is_invalid_operation());
    }

    #[test]
    fn test_missing_base_rejected() {
        let registry = SerializerRegistry::new();
        let map = ClassMapBuilder::new("Cat").base("Animal").freeze(&ConventionPack::new()).unwrap();
        assert!(registry.register_class_map(map).unwrap_err().is_mapping_error());
    }

    #[test]
    fn test_hash_set_member_round_trips_through_json() {
        let registry = SerializerRegistry::new();
        let conventions = ConventionPack::new();
        registry
            .register_class_map(
                ClassMapBuilder::new("Tagged")
                    .member(MemberMapBuilder::new("Plain", TypeRef::hash_set(TypeRef::Int32)))
                    .member(
                        MemberMapBuilder::new("Wrapped", TypeRef::hash_set(TypeRef::Int32))
                            .serializer(Arc::new(DiscriminatedSerializer::always(TypeRef::hash_set(TypeRef::Int32)))),
                    )
                    .freeze(&conventions)
                    .unwrap(),
            )
            .unwrap();
        let set = NativeValue::hash_set(TypeRef::Int32, vec![1.into(), 2.into()]);
        let tagged = Instance::new("Tagged").with("Plain", set.clone()).with("Wrapped", set.clone());
        let document = registry.serialize_document(&NativeValue::Object(tagged.clone())).unwrap();
        let json = document_to_json(&document, &JsonWriterSettings::relaxed());
        assert_eq!(
            json,
            r#"{ "Plain" : [1, 2], "Wrapped" : { "_t" : "HashSet<Int32>", "_v" : [1, 2] } }"#
        );

        let fresh = SerializerRegistry::new();
        fresh
            .register_class_map(
                ClassMapBuilder::new("Tagged")
                    .member(MemberMapBuilder::new("Plain", TypeRef::hash_set(TypeRef::Int32)))
                    .member(
                        MemberMapBuilder::new("Wrapped", TypeRef::hash_set(TypeRef::Int32))
                            .serializer(Arc::new(DiscriminatedSerializer::always(TypeRef::hash_set(TypeRef::Int32)))),
                    )
                    .freeze(&conventions)
                    .unwrap(),
            )
            .unwrap();
        let read = fresh
            .deserialize_document(&TypeRef::class("Tagged"), &parse_document(&json).unwrap())
            .unwrap();
        assert_eq!(read, NativeValue::Object(tagged));
        let wrapped = read.as_instance().unwrap().get("Wrapped").unwrap();
        assert_eq!(wrapped.runtime_type(), Some(TypeRef::hash_set(TypeRef::Int32)));
    }

    #[test]
    fn test_nullable_and_enum() {
        let registry = SerializerRegistry::new();
        registry.register_enum(EnumMap::new("Level", [("Low", 1), ("High", 2)])).unwrap();
        let level = registry.lookup(&TypeRef::nullable(TypeRef::enumeration("Level"))).unwrap();
        let ctx = registry.context();
        assert_eq!(level.serialize(&ctx, &NativeValue::Null).unwrap(), Bson::Null);
        let high = registry.enum_map("Level").unwrap().value("High").unwrap();
        assert_eq!(level.serialize(&ctx, &NativeValue::Enum(high)).unwrap(), Bson::Int32(2));
        assert!(registry.lookup(&TypeRef::enumeration("Missing")).unwrap_err().is_mapping_error());
    }

    #[test]
    fn test_serialize_document_requires_document() {
        let registry = SerializerRegistry::new();
        let err = registry.serialize_document(&NativeValue::Int32(1)).unwrap_err();
        assert!(err.is_invalid_operation());
    }
}
