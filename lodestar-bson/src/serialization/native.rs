//! The native object model the registry maps to and from documents.
//!
//! [`TypeRef`] names a static type; [`NativeValue`] is a runtime value that
//! always knows its concrete runtime type, which is what polymorphic
//! serialization dispatches on.

use std::fmt;

use chrono::Utc;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::decimal128::Decimal128;
use crate::error::{BsonError, BsonResult};
use crate::oid::ObjectId;
use crate::value::Bson;

/// A static type as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Bool,
    Int16,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Single,
    Double,
    Decimal,
    Decimal128,
    Char,
    String,
    Guid,
    DateTime,
    ObjectId,
    Bytes,
    /// A registered enumeration.
    Enum(SmolStr),
    /// A registered class.
    Class(SmolStr),
    List(Box<TypeRef>),
    HashSet(Box<TypeRef>),
    Array(Box<TypeRef>),
    /// Any sequence; the concrete collection is only known at runtime.
    Enumerable(Box<TypeRef>),
    /// String-keyed dictionary with the given value type.
    Dictionary(Box<TypeRef>),
    Nullable(Box<TypeRef>),
    /// Any value at all.
    Object,
    /// A raw wire value.
    BsonValue,
}

const PRIMITIVES: [(&str, TypeRef); 16] = [
    ("Boolean", TypeRef::Bool),
    ("Int16", TypeRef::Int16),
    ("Int32", TypeRef::Int32),
    ("Int64", TypeRef::Int64),
    ("UInt32", TypeRef::UInt32),
    ("UInt64", TypeRef::UInt64),
    ("Single", TypeRef::Single),
    ("Double", TypeRef::Double),
    ("Decimal", TypeRef::Decimal),
    ("Decimal128", TypeRef::Decimal128),
    ("Char", TypeRef::Char),
    ("String", TypeRef::String),
    ("Guid", TypeRef::Guid),
    ("DateTime", TypeRef::DateTime),
    ("ObjectId", TypeRef::ObjectId),
    ("Byte[]", TypeRef::Bytes),
];

impl TypeRef {
    pub fn list(item: TypeRef) -> Self {
        Self::List(Box::new(item))
    }

    pub fn hash_set(item: TypeRef) -> Self {
        Self::HashSet(Box::new(item))
    }

    pub fn array(item: TypeRef) -> Self {
        Self::Array(Box::new(item))
    }

    pub fn enumerable(item: TypeRef) -> Self {
        Self::Enumerable(Box::new(item))
    }

    pub fn dictionary(value: TypeRef) -> Self {
        Self::Dictionary(Box::new(value))
    }

    pub fn nullable(inner: TypeRef) -> Self {
        Self::Nullable(Box::new(inner))
    }

    pub fn class(name: impl Into<SmolStr>) -> Self {
        Self::Class(name.into())
    }

    pub fn enumeration(name: impl Into<SmolStr>) -> Self {
        Self::Enum(name.into())
    }

    /// Whether values of this type are numbers.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt32
                | Self::UInt64
                | Self::Single
                | Self::Double
                | Self::Decimal
                | Self::Decimal128
        )
    }

    /// Item type of a sequence type.
    pub fn item_type(&self) -> Option<&TypeRef> {
        match self {
            Self::List(t) | Self::HashSet(t) | Self::Array(t) | Self::Enumerable(t) => Some(t),
            _ => None,
        }
    }

    /// Whether this is a concrete sequence type.
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::List(_) | Self::HashSet(_) | Self::Array(_))
    }

    /// Types whose runtime values may be of a different, more specific type.
    pub fn is_polymorphic(&self) -> bool {
        matches!(self, Self::Object | Self::Enumerable(_))
    }

    /// Strip one level of `Nullable`.
    pub fn underlying(&self) -> &TypeRef {
        match self {
            Self::Nullable(inner) => inner,
            other => other,
        }
    }

    /// Parse the display form back into a type, e.g. `HashSet<Int32>`.
    ///
    /// Bare names that are not primitives are returned through
    /// `named`, which decides whether they are a registered class or enum.
    pub fn parse_with(
        text: &str,
        named: &dyn Fn(&str) -> Option<TypeRef>,
    ) -> BsonResult<TypeRef> {
        let text = text.trim();
        if let Some(item) = text.strip_suffix("[]") {
            if item == "Byte" {
                return Ok(Self::Bytes);
            }
            return Ok(Self::array(Self::parse_with(item, named)?));
        }
        if let Some((head, rest)) = text.split_once('<') {
            let inner = rest
                .strip_suffix('>')
                .ok_or_else(|| BsonError::mapping(format!("malformed type name {:?}", text)))?;
            return match head {
                "List" => Ok(Self::list(Self::parse_with(inner, named)?)),
                "HashSet" => Ok(Self::hash_set(Self::parse_with(inner, named)?)),
                "IEnumerable" => Ok(Self::enumerable(Self::parse_with(inner, named)?)),
                "Nullable" => Ok(Self::nullable(Self::parse_with(inner, named)?)),
                "Dictionary" => {
                    let value = inner.strip_prefix("String,").ok_or_else(|| {
                        BsonError::mapping(format!("dictionary keys must be strings: {:?}", text))
                    })?;
                    Ok(Self::dictionary(Self::parse_with(value, named)?))
                }
                _ => Err(BsonError::mapping(format!("unknown generic type {:?}", head))),
            };
        }
        match text {
            "Object" => return Ok(Self::Object),
            "BsonValue" => return Ok(Self::BsonValue),
            _ => {}
        }
        if let Some((_, ty)) = PRIMITIVES.iter().find(|(name, _)| *name == text) {
            return Ok(ty.clone());
        }
        named(text).ok_or_else(|| BsonError::mapping(format!("unknown type {:?}", text)))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((name, _)) = PRIMITIVES.iter().find(|(_, ty)| ty == self) {
            return f.write_str(name);
        }
        match self {
            Self::Enum(name) | Self::Class(name) => f.write_str(name),
            Self::List(t) => write!(f, "List<{}>", t),
            Self::HashSet(t) => write!(f, "HashSet<{}>", t),
            Self::Array(t) => write!(f, "{}[]", t),
            Self::Enumerable(t) => write!(f, "IEnumerable<{}>", t),
            Self::Dictionary(t) => write!(f, "Dictionary<String,{}>", t),
            Self::Nullable(t) => write!(f, "Nullable<{}>", t),
            Self::Object => f.write_str("Object"),
            Self::BsonValue => f.write_str("BsonValue"),
            _ => f.write_str("?"),
        }
    }
}

/// A value of a registered enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub type_name: SmolStr,
    pub name: SmolStr,
    pub value: i64,
}

/// An instance of a registered class.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub type_name: SmolStr,
    pub fields: IndexMap<SmolStr, NativeValue>,
}

impl Instance {
    pub fn new(type_name: impl Into<SmolStr>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: IndexMap::new(),
        }
    }

    /// Builder-style field assignment.
    pub fn with(mut self, name: impl Into<SmolStr>, value: impl Into<NativeValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&NativeValue> {
        self.fields.get(name)
    }
}

/// A runtime value that carries its concrete runtime type.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Single(f32),
    Double(f64),
    Decimal(Decimal),
    Decimal128(Decimal128),
    Char(char),
    String(String),
    Guid(Uuid),
    DateTime(chrono::DateTime<Utc>),
    ObjectId(ObjectId),
    Bytes(Vec<u8>),
    Enum(EnumValue),
    /// A concrete sequence; `ty` is its runtime collection type.
    Collection { ty: TypeRef, items: Vec<NativeValue> },
    Dictionary {
        value_type: TypeRef,
        entries: IndexMap<String, NativeValue>,
    },
    Object(Instance),
    Bson(Bson),
}

impl NativeValue {
    pub fn list(item_type: TypeRef, items: Vec<NativeValue>) -> Self {
        Self::Collection {
            ty: TypeRef::list(item_type),
            items,
        }
    }

    pub fn array(item_type: TypeRef, items: Vec<NativeValue>) -> Self {
        Self::Collection {
            ty: TypeRef::array(item_type),
            items,
        }
    }

    /// A set keeps the first occurrence of each equal item.
    pub fn hash_set(item_type: TypeRef, items: Vec<NativeValue>) -> Self {
        let mut unique: Vec<NativeValue> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Self::Collection {
            ty: TypeRef::hash_set(item_type),
            items: unique,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The concrete runtime type; `None` for null.
    pub fn runtime_type(&self) -> Option<TypeRef> {
        Some(match self {
            Self::Null => return None,
            Self::Bool(_) => TypeRef::Bool,
            Self::Int16(_) => TypeRef::Int16,
            Self::Int32(_) => TypeRef::Int32,
            Self::Int64(_) => TypeRef::Int64,
            Self::UInt32(_) => TypeRef::UInt32,
            Self::UInt64(_) => TypeRef::UInt64,
            Self::Single(_) => TypeRef::Single,
            Self::Double(_) => TypeRef::Double,
            Self::Decimal(_) => TypeRef::Decimal,
            Self::Decimal128(_) => TypeRef::Decimal128,
            Self::Char(_) => TypeRef::Char,
            Self::String(_) => TypeRef::String,
            Self::Guid(_) => TypeRef::Guid,
            Self::DateTime(_) => TypeRef::DateTime,
            Self::ObjectId(_) => TypeRef::ObjectId,
            Self::Bytes(_) => TypeRef::Bytes,
            Self::Enum(e) => TypeRef::Enum(e.type_name.clone()),
            Self::Collection { ty, .. } => ty.clone(),
            Self::Dictionary { value_type, .. } => TypeRef::dictionary(value_type.clone()),
            Self::Object(instance) => TypeRef::Class(instance.type_name.clone()),
            Self::Bson(_) => TypeRef::BsonValue,
        })
    }

    /// The zero value of a type, used by ignore-if-default.
    pub fn default_for(ty: &TypeRef) -> NativeValue {
        match ty {
            TypeRef::Bool => Self::Bool(false),
            TypeRef::Int16 => Self::Int16(0),
            TypeRef::Int32 => Self::Int32(0),
            TypeRef::Int64 => Self::Int64(0),
            TypeRef::UInt32 => Self::UInt32(0),
            TypeRef::UInt64 => Self::UInt64(0),
            TypeRef::Single => Self::Single(0.0),
            TypeRef::Double => Self::Double(0.0),
            TypeRef::Decimal => Self::Decimal(Decimal::ZERO),
            TypeRef::Decimal128 => Self::Decimal128(Decimal128::ZERO),
            TypeRef::Char => Self::Char('\0'),
            TypeRef::Guid => Self::Guid(Uuid::nil()),
            TypeRef::DateTime => Self::DateTime(chrono::DateTime::<Utc>::UNIX_EPOCH),
            TypeRef::ObjectId => Self::ObjectId(ObjectId::from_bytes([0; 12])),
            _ => Self::Null,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Self::Object(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn as_items(&self) -> Option<&[NativeValue]> {
        match self {
            Self::Collection { items, .. } => Some(items),
            _ => None,
        }
    }
}

macro_rules! native_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for NativeValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

native_from! {
    bool => Bool,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Single,
    f64 => Double,
    Decimal => Decimal,
    Decimal128 => Decimal128,
    char => Char,
    String => String,
    Uuid => Guid,
    chrono::DateTime<Utc> => DateTime,
    ObjectId => ObjectId,
    Vec<u8> => Bytes,
    EnumValue => Enum,
    Instance => Object,
    Bson => Bson,
}

impl From<&str> for NativeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl<T: Into<NativeValue>> From<Option<T>> for NativeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
