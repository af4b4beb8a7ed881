//! Serializers for the intermediate shapes a pipeline produces.
//!
//! A scalar projection is written as `{ _v: value }`, an anonymous
//! projection as a document of its members, and a grouping as
//! `{ _id: key, _elements: [...] }`. These serializers read those shapes
//! back and expose their members to later translation steps.

use std::fmt;

use indexmap::IndexMap;
use lodestar_bson::serialization::{
    ArraySerializer, DocumentSerializer, ID_ELEMENT, Instance, MemberSerializationInfo, NativeValue,
    SerializationContext, Serializer, SerializerRef, TypeRef, WRAPPED_VALUE_ELEMENT,
};
use lodestar_bson::{Bson, BsonError, BsonResult, Document};
use smol_str::SmolStr;

/// Field holding the members of a grouping.
pub const ELEMENTS_ELEMENT: &str = "_elements";

/// Type name given to instances read by a [`ProjectionSerializer`].
pub const ANONYMOUS_TYPE: &str = "<anonymous>";

/// A value stored under `_v`.
#[derive(Clone)]
pub struct WrappedValueSerializer {
    inner: SerializerRef,
}

impl WrappedValueSerializer {
    pub fn new(inner: SerializerRef) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &SerializerRef {
        &self.inner
    }
}

impl fmt::Debug for WrappedValueSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WrappedValueSerializer").field(&self.inner.value_type()).finish()
    }
}

impl Serializer for WrappedValueSerializer {
    fn value_type(&self) -> TypeRef {
        self.inner.value_type()
    }

    fn serialize(&self, ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let mut document = Document::new();
        document.insert(WRAPPED_VALUE_ELEMENT, self.inner.serialize(ctx, value)?);
        Ok(Bson::Document(document))
    }

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        let document = value
            .as_document()
            .ok_or_else(|| BsonError::format(format!("expected a wrapped value, found {}", value.element_type())))?;
        let inner = document.get(WRAPPED_VALUE_ELEMENT).unwrap_or(&Bson::Null);
        self.inner.deserialize(ctx, inner)
    }
}

/// One member of a projected document.
#[derive(Clone)]
pub struct ProjectedMember {
    pub name: SmolStr,
    pub element_name: SmolStr,
    pub serializer: SerializerRef,
}

impl ProjectedMember {
    pub fn new(name: impl Into<SmolStr>, element_name: impl Into<SmolStr>, serializer: SerializerRef) -> Self {
        Self {
            name: name.into(),
            element_name: element_name.into(),
            serializer,
        }
    }
}

impl fmt::Debug for ProjectedMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.name, self.element_name, self.serializer.value_type())
    }
}

/// Anonymous documents produced by `new { ... }` projections, joins and
/// window stages. Instances read back carry [`ANONYMOUS_TYPE`].
#[derive(Debug, Clone)]
pub struct ProjectionSerializer {
    members: Vec<ProjectedMember>,
}

impl ProjectionSerializer {
    pub fn new(members: Vec<ProjectedMember>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[ProjectedMember] {
        &self.members
    }
}

impl Serializer for ProjectionSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::Object
    }

    fn serialize(&self, ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let instance = match value {
            NativeValue::Null => return Ok(Bson::Null),
            NativeValue::Object(instance) => instance,
            other => return Err(BsonError::mapping(format!("cannot serialize {:?} as a projection", other))),
        };
        let mut document = Document::with_capacity(self.members.len());
        for member in &self.members {
            let value = instance.get(&member.name).unwrap_or(&NativeValue::Null);
            document.insert(member.element_name.as_str(), member.serializer.serialize(ctx, value)?);
        }
        Ok(Bson::Document(document))
    }

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        let document = match value {
            Bson::Null => return Ok(NativeValue::Null),
            Bson::Document(document) => document,
            other => {
                return Err(BsonError::format(format!(
                    "expected a projected document, found {}",
                    other.element_type()
                )));
            }
        };
        let mut instance = Instance::new(ANONYMOUS_TYPE);
        for member in &self.members {
            let value = match document.get(&member.element_name) {
                Some(element) => member.serializer.deserialize(ctx, element)?,
                None => NativeValue::Null,
            };
            instance.fields.insert(member.name.clone(), value);
        }
        Ok(NativeValue::Object(instance))
    }

    fn as_document(&self) -> Option<&dyn DocumentSerializer> {
        Some(self)
    }
}

impl DocumentSerializer for ProjectionSerializer {
    fn member(&self, _ctx: &SerializationContext<'_>, name: &str) -> BsonResult<Option<MemberSerializationInfo>> {
        Ok(self.members.iter().find(|m| m.name == name).map(|m| MemberSerializationInfo {
            element_name: m.element_name.to_string(),
            serializer: m.serializer.clone(),
        }))
    }
}

/// The result of grouping: a key plus the grouped elements.
///
/// Reads back as an instance with `Key` and `Elements` fields. It is both
/// document-shaped, for `g.Key`, and array-shaped, for `g.Count()` and the
/// other sequence methods, whose input is the `_elements` field.
#[derive(Clone)]
pub struct GroupingSerializer {
    key: SerializerRef,
    element: SerializerRef,
}

impl GroupingSerializer {
    pub const TYPE_NAME: &'static str = "Grouping";

    pub fn new(key: SerializerRef, element: SerializerRef) -> Self {
        Self { key, element }
    }
}

impl fmt::Debug for GroupingSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupingSerializer")
            .field("key", &self.key.value_type())
            .field("element", &self.element.value_type())
            .finish()
    }
}

impl Serializer for GroupingSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::enumerable(self.element.value_type())
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, _value: &NativeValue) -> BsonResult<Bson> {
        Err(BsonError::invalid_operation("groupings are produced by the server and cannot be serialized"))
    }

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        let document = value
            .as_document()
            .ok_or_else(|| BsonError::format(format!("expected a grouping, found {}", value.element_type())))?;
        let key = self.key.deserialize(ctx, document.get(ID_ELEMENT).unwrap_or(&Bson::Null))?;
        let elements = match document.get(ELEMENTS_ELEMENT) {
            Some(Bson::Array(items)) => items
                .iter()
                .map(|item| self.element.deserialize(ctx, item))
                .collect::<BsonResult<Vec<_>>>()?,
            Some(other) => return Err(BsonError::format(format!("grouping elements must be an array, found {}", other.element_type()))),
            None => Vec::new(),
        };
        let mut fields = IndexMap::new();
        fields.insert(SmolStr::new("Key"), key);
        fields.insert(
            SmolStr::new("Elements"),
            NativeValue::list(self.element.value_type(), elements),
        );
        Ok(NativeValue::Object(Instance {
            type_name: SmolStr::new(Self::TYPE_NAME),
            fields,
        }))
    }

    fn as_document(&self) -> Option<&dyn DocumentSerializer> {
        Some(self)
    }

    fn as_array(&self) -> Option<&dyn ArraySerializer> {
        Some(self)
    }
}

impl DocumentSerializer for GroupingSerializer {
    fn member(&self, _ctx: &SerializationContext<'_>, name: &str) -> BsonResult<Option<MemberSerializationInfo>> {
        Ok(match name {
            "Key" => Some(MemberSerializationInfo {
                element_name: ID_ELEMENT.to_string(),
                serializer: self.key.clone(),
            }),
            _ => None,
        })
    }
}

impl ArraySerializer for GroupingSerializer {
    fn item_serializer(&self) -> SerializerRef {
        self.element.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_bson::doc;
    use lodestar_bson::serialization::SerializerRegistry;
    use std::sync::Arc;

    #[test]
    fn test_wrapped_value_reads_v() {
        let registry = SerializerRegistry::new();
        let serializer = WrappedValueSerializer::new(registry.lookup(&TypeRef::Int64).unwrap());
        let value = serializer
            .deserialize(&registry.context(), &Bson::Document(doc! { "_v" => 7 }))
            .unwrap();
        assert_eq!(value, NativeValue::Int64(7));
    }

    #[test]
    fn test_projection_round_trip() {
        let registry = SerializerRegistry::new();
        let serializer = ProjectionSerializer::new(vec![
            ProjectedMember::new("Name", "Name", registry.lookup(&TypeRef::String).unwrap()),
            ProjectedMember::new("Outer", "_document", registry.lookup(&TypeRef::BsonValue).unwrap()),
        ]);
        let ctx = registry.context();
        let value = serializer
            .deserialize(&ctx, &Bson::Document(doc! { "Name" => "Ada", "_document" => doc! { "x" => 1 } }))
            .unwrap();
        let instance = value.as_instance().unwrap();
        assert_eq!(instance.type_name, ANONYMOUS_TYPE);
        assert_eq!(instance.get("Name"), Some(&NativeValue::String("Ada".into())));
        let member = serializer.member(&ctx, "Outer").unwrap().unwrap();
        assert_eq!(member.element_name, "_document");
        assert_eq!(
            serializer.serialize(&ctx, &value).unwrap(),
            Bson::Document(doc! { "Name" => "Ada", "_document" => doc! { "x" => 1 } })
        );
    }

    #[test]
    fn test_grouping_members() {
        let registry = SerializerRegistry::new();
        let grouping = Arc::new(GroupingSerializer::new(
            registry.lookup(&TypeRef::String).unwrap(),
            registry.lookup(&TypeRef::Int32).unwrap(),
        ));
        let ctx = registry.context();
        let key = grouping.member(&ctx, "Key").unwrap().unwrap();
        assert_eq!(key.element_name, "_id");
        assert!(grouping.member(&ctx, "Missing").unwrap().is_none());
        let value = grouping
            .deserialize(&ctx, &Bson::Document(doc! { "_id" => "a", "_elements" => lodestar_bson::array![1, 2] }))
            .unwrap();
        let instance = value.as_instance().unwrap();
        assert_eq!(instance.get("Key"), Some(&NativeValue::String("a".into())));
        assert_eq!(instance.get("Elements").and_then(|e| e.as_items()).map(|i| i.len()), Some(2));
    }
}
