//! Serializers for sequences and string-keyed dictionaries.

use indexmap::IndexMap;

use super::native::{NativeValue, TypeRef};
use super::options::DictionaryRepresentation;
use super::serializer::{
    ArraySerializer, SerializationContext, Serializer, SerializerRef, unexpected_bson,
    unexpected_value,
};
use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::value::Bson;

/// A concrete list, set or array, written as a plain wire array.
#[derive(Debug, Clone)]
pub struct CollectionSerializer {
    ty: TypeRef,
    item: SerializerRef,
}

impl CollectionSerializer {
    pub fn new(ty: TypeRef, item: SerializerRef) -> BsonResult<Self> {
        if !ty.is_collection() {
            return Err(BsonError::mapping(format!("{} is not a collection type", ty)));
        }
        Ok(Self { ty, item })
    }

    fn item_type(&self) -> TypeRef {
        self.ty.item_type().cloned().unwrap_or(TypeRef::Object)
    }

    /// Build the runtime collection this serializer produces.
    fn collect(&self, items: Vec<NativeValue>) -> NativeValue {
        match self.ty {
            TypeRef::HashSet(_) => NativeValue::hash_set(self.item_type(), items),
            _ => NativeValue::Collection {
                ty: self.ty.clone(),
                items,
            },
        }
    }
}

impl Serializer for CollectionSerializer {
    fn value_type(&self) -> TypeRef {
        self.ty.clone()
    }

    fn serialize(&self, ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        match value {
            NativeValue::Null => Ok(Bson::Null),
            NativeValue::Collection { items, .. } => items
                .iter()
                .map(|item| self.item.serialize(ctx, item))
                .collect::<BsonResult<Vec<_>>>()
                .map(Bson::Array),
            other => Err(unexpected_value(&self.ty, other)),
        }
    }

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::Null => Ok(NativeValue::Null),
            Bson::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.item.deserialize(ctx, item))
                    .collect::<BsonResult<Vec<_>>>()?;
                Ok(self.collect(items))
            }
            other => Err(unexpected_bson(&self.ty, other)),
        }
    }

    fn as_array(&self) -> Option<&dyn ArraySerializer> {
        Some(self)
    }
}

impl ArraySerializer for CollectionSerializer {
    fn item_serializer(&self) -> SerializerRef {
        self.item.clone()
    }
}

/// A dictionary with string keys.
#[derive(Debug, Clone)]
pub struct DictionarySerializer {
    value_type: TypeRef,
    value: SerializerRef,
    representation: DictionaryRepresentation,
}

impl DictionarySerializer {
    pub fn new(value: SerializerRef, representation: DictionaryRepresentation) -> Self {
        Self {
            value_type: value.value_type(),
            value,
            representation,
        }
    }

    fn ty(&self) -> TypeRef {
        TypeRef::dictionary(self.value_type.clone())
    }

    fn entry(&self, ctx: &SerializationContext<'_>, key: &Bson, value: &Bson) -> BsonResult<(String, NativeValue)> {
        let key = key
            .as_str()
            .ok_or_else(|| BsonError::format(format!("dictionary key must be a string, found {}", key.element_type())))?;
        Ok((key.to_string(), self.value.deserialize(ctx, value)?))
    }
}

impl Serializer for DictionarySerializer {
    fn value_type(&self) -> TypeRef {
        self.ty()
    }

    fn serialize(&self, ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let entries = match value {
            NativeValue::Null => return Ok(Bson::Null),
            NativeValue::Dictionary { entries, .. } => entries,
            other => return Err(unexpected_value(&self.ty(), other)),
        };
        match self.representation {
            DictionaryRepresentation::Document => {
                let mut document = Document::with_capacity(entries.len());
                for (key, item) in entries {
                    document.insert(key.clone(), self.value.serialize(ctx, item)?);
                }
                Ok(Bson::Document(document))
            }
            DictionaryRepresentation::ArrayOfArrays => entries
                .iter()
                .map(|(key, item)| {
                    Ok(Bson::Array(vec![Bson::String(key.clone()), self.value.serialize(ctx, item)?]))
                })
                .collect::<BsonResult<Vec<_>>>()
                .map(Bson::Array),
            DictionaryRepresentation::ArrayOfDocuments => entries
                .iter()
                .map(|(key, item)| {
                    let mut pair = Document::new();
                    pair.insert("k", key.as_str());
                    pair.insert("v", self.value.serialize(ctx, item)?);
                    Ok(Bson::Document(pair))
                })
                .collect::<BsonResult<Vec<_>>>()
                .map(Bson::Array),
        }
    }

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        let mut entries = IndexMap::new();
        match value {
            Bson::Null => return Ok(NativeValue::Null),
            Bson::Document(document) => {
                for (key, item) in document {
                    entries.insert(key.clone(), self.value.deserialize(ctx, item)?);
                }
            }
            // Either array layout is accepted regardless of the configured one.
            Bson::Array(pairs) => {
                for pair in pairs {
                    let (key, item) = match pair {
                        Bson::Array(kv) if kv.len() == 2 => self.entry(ctx, &kv[0], &kv[1])?,
                        Bson::Document(kv) if kv.len() == 2 => match (kv.get("k"), kv.get("v")) {
                            (Some(k), Some(v)) => self.entry(ctx, k, v)?,
                            _ => return Err(BsonError::format("dictionary entry must have k and v")),
                        },
                        other => return Err(unexpected_bson(&self.ty(), other)),
                    };
                    entries.insert(key, item);
                }
            }
            other => return Err(unexpected_bson(&self.ty(), other)),
        }
        Ok(NativeValue::Dictionary {
            value_type: self.value_type.clone(),
            entries,
        })
    }
}
