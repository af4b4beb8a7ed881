//! Mapping between native values and BSON.
//!
//! A [`SerializerRegistry`] resolves a [`Serializer`] for every [`TypeRef`].
//! Classes are described by frozen [`ClassMap`]s built with
//! [`ClassMapBuilder`]; polymorphic members carry a `_t` discriminator.
//!
//! ```
//! use lodestar_bson::prelude::*;
//! use lodestar_bson::serialization::{Instance, MemberMapBuilder};
//!
//! let registry = SerializerRegistry::new();
//! let person = ClassMapBuilder::new("Person")
//!     .member(MemberMapBuilder::new("Name", TypeRef::String))
//!     .member(MemberMapBuilder::new("Age", TypeRef::Int32))
//!     .freeze(&ConventionPack::new().camel_case_element_names(true))
//!     .unwrap();
//! registry.register_class_map(person).unwrap();
//!
//! let ada = Instance::new("Person").with("Name", "Ada").with("Age", 36);
//! let document = registry.serialize_document(&NativeValue::Object(ada)).unwrap();
//! assert_eq!(document.to_relaxed_json(), r#"{ "name" : "Ada", "age" : 36 }"#);
//! ```

pub mod class_map;
pub mod collection;
pub mod convert;
pub mod discriminator;
pub mod native;
pub mod options;
pub mod registry;
pub mod serializer;

pub use class_map::{
    ClassMap, ClassMapBuilder, ClassMapSerializer, ConventionPack, DISCRIMINATOR_ELEMENT, ID_ELEMENT,
    MemberMap, MemberMapBuilder, WRAPPED_VALUE_ELEMENT,
};
pub use collection::{CollectionSerializer, DictionarySerializer};
pub use convert::{Number, RepresentationConverter};
pub use discriminator::{DiscriminatedSerializer, DiscriminatorRegistry};
pub use native::{EnumValue, Instance, NativeValue, TypeRef};
pub use options::{DictionaryRepresentation, SerializerOptions};
pub use registry::SerializerRegistry;
pub use serializer::{
    ArraySerializer, BooleanSerializer, BsonValueSerializer, BytesSerializer, CharSerializer,
    DateTimeSerializer, DocumentSerializer, EnumMap, EnumSerializer, GuidSerializer,
    MemberSerializationInfo, NullableSerializer, NumericSerializer, ObjectIdSerializer,
    SerializationContext, Serializer, SerializerRef, StringSerializer,
};
