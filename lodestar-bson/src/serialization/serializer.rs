//! The serializer trait and the serializers for scalar types.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use smol_str::SmolStr;

use super::convert::{Number, RepresentationConverter};
use super::native::{EnumValue, NativeValue, TypeRef};
use super::options::SerializerOptions;
use super::registry::SerializerRegistry;
use crate::datetime::DateTime;
use crate::decimal128::Decimal128;
use crate::document::Document;
use crate::element::{BinarySubtype, ElementType};
use crate::error::{BsonError, BsonResult};
use crate::guid::GuidRepresentation;
use crate::json::format_double;
use crate::oid::ObjectId;
use crate::value::{Binary, Bson};

/// Shared handle to a serializer.
pub type SerializerRef = Arc<dyn Serializer>;

/// State threaded through a serialization call.
///
/// Serializers resolve the serializers of nested values through the
/// registry carried here instead of holding references back to it.
#[derive(Clone, Copy)]
pub struct SerializationContext<'r> {
    registry: &'r SerializerRegistry,
}

impl<'r> SerializationContext<'r> {
    pub fn new(registry: &'r SerializerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &'r SerializerRegistry {
        self.registry
    }

    pub fn lookup(&self, ty: &TypeRef) -> BsonResult<SerializerRef> {
        self.registry.lookup(ty)
    }
}

impl fmt::Debug for SerializationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializationContext").finish_non_exhaustive()
    }
}

/// Where a member of a document-shaped value is stored and how.
#[derive(Debug, Clone)]
pub struct MemberSerializationInfo {
    pub element_name: String,
    pub serializer: SerializerRef,
}

/// Converts between native values of one static type and wire values.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// The static type this serializer handles.
    fn value_type(&self) -> TypeRef;

    fn serialize(&self, ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson>;

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue>;

    /// Member lookup for serializers that produce documents.
    fn as_document(&self) -> Option<&dyn DocumentSerializer> {
        None
    }

    /// Item lookup for serializers that produce arrays.
    fn as_array(&self) -> Option<&dyn ArraySerializer> {
        None
    }
}

/// A serializer whose wire form is a document with named members.
pub trait DocumentSerializer {
    /// `Ok(None)` when the type has no such member.
    fn member(
        &self,
        ctx: &SerializationContext<'_>,
        name: &str,
    ) -> BsonResult<Option<MemberSerializationInfo>>;
}

/// A serializer whose wire form is an array.
pub trait ArraySerializer {
    fn item_serializer(&self) -> SerializerRef;
}

pub(crate) fn unexpected_value(expected: &TypeRef, value: &NativeValue) -> BsonError {
    let found = value
        .runtime_type()
        .map_or_else(|| "null".to_string(), |t| t.to_string());
    BsonError::mapping(format!("expected a value of type {}, found {}", expected, found))
}

pub(crate) fn unexpected_bson(target: &TypeRef, value: &Bson) -> BsonError {
    BsonError::format(format!(
        "cannot deserialize a '{}' from BsonType '{}'",
        target,
        value.element_type()
    ))
}

fn invalid_representation(ty: &TypeRef, representation: ElementType) -> BsonError {
    BsonError::mapping(format!(
        "{} is not a valid representation for {}",
        representation, ty
    ))
}

/// Numbers of every width, stored as any numeric wire type or as a string.
#[derive(Debug, Clone)]
pub struct NumericSerializer {
    ty: TypeRef,
    representation: ElementType,
    converter: RepresentationConverter,
}

impl NumericSerializer {
    pub fn new(ty: TypeRef, options: &SerializerOptions) -> BsonResult<Self> {
        let natural = match ty {
            TypeRef::Int16 | TypeRef::Int32 => ElementType::Int32,
            TypeRef::Int64 | TypeRef::UInt32 | TypeRef::UInt64 => ElementType::Int64,
            TypeRef::Single | TypeRef::Double => ElementType::Double,
            TypeRef::Decimal | TypeRef::Decimal128 => ElementType::Decimal128,
            _ => return Err(BsonError::mapping(format!("{} is not a numeric type", ty))),
        };
        let representation = options.representation.unwrap_or(natural);
        if !matches!(
            representation,
            ElementType::Int32
                | ElementType::Int64
                | ElementType::Double
                | ElementType::Decimal128
                | ElementType::String
        ) {
            return Err(invalid_representation(&ty, representation));
        }
        Ok(Self {
            ty,
            representation,
            converter: options.converter(),
        })
    }

    pub fn representation(&self) -> ElementType {
        self.representation
    }

    fn to_number(&self, value: &NativeValue) -> BsonResult<Number> {
        let number = match (&self.ty, value) {
            (TypeRef::Int16, NativeValue::Int16(v)) => Number::from(*v),
            (TypeRef::Int32, NativeValue::Int32(v)) => Number::from(*v),
            (TypeRef::Int64, NativeValue::Int64(v)) => Number::from(*v),
            (TypeRef::UInt32, NativeValue::UInt32(v)) => Number::from(*v),
            (TypeRef::UInt64, NativeValue::UInt64(v)) => Number::from(*v),
            (TypeRef::Single, NativeValue::Single(v)) => Number::from(*v),
            (TypeRef::Double, NativeValue::Double(v)) => Number::from(*v),
            (TypeRef::Decimal, NativeValue::Decimal(v)) => Number::from(*v),
            (TypeRef::Decimal128, NativeValue::Decimal128(v)) => Number::from(*v),
            _ => return Err(unexpected_value(&self.ty, value)),
        };
        Ok(number)
    }

    fn parse_text(&self, text: &str) -> BsonResult<Number> {
        let invalid = || BsonError::format(format!("{:?} is not a valid {}", text, self.ty));
        match self.ty {
            TypeRef::Single => text.parse::<f32>().map(Number::from).map_err(|_| invalid()),
            TypeRef::Double => text.parse::<f64>().map(Number::from).map_err(|_| invalid()),
            TypeRef::Decimal => text.parse::<Decimal>().map(Number::from).map_err(|_| invalid()),
            TypeRef::Decimal128 => Decimal128::parse(text).map(Number::from),
            _ => text.parse::<i128>().map(Number::Integer).map_err(|_| invalid()),
        }
    }

    fn to_native(&self, number: Number) -> BsonResult<NativeValue> {
        let c = &self.converter;
        Ok(match self.ty {
            TypeRef::Int16 => NativeValue::Int16(c.to_i16(number)?),
            TypeRef::Int32 => NativeValue::Int32(c.to_i32(number)?),
            TypeRef::Int64 => NativeValue::Int64(c.to_i64(number)?),
            TypeRef::UInt32 => NativeValue::UInt32(c.to_u32(number)?),
            TypeRef::UInt64 => NativeValue::UInt64(c.to_u64(number)?),
            TypeRef::Single => NativeValue::Single(c.to_f32(number)?),
            TypeRef::Double => NativeValue::Double(c.to_f64(number)?),
            TypeRef::Decimal => NativeValue::Decimal(c.to_decimal(number)?),
            _ => NativeValue::Decimal128(c.to_decimal128(number)?),
        })
    }
}

impl Serializer for NumericSerializer {
    fn value_type(&self) -> TypeRef {
        self.ty.clone()
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let number = self.to_number(value)?;
        let c = &self.converter;
        Ok(match self.representation {
            ElementType::Int32 => Bson::Int32(c.to_i32(number)?),
            ElementType::Int64 => Bson::Int64(c.to_i64(number)?),
            ElementType::Double => Bson::Double(c.to_f64(number)?),
            ElementType::Decimal128 => Bson::Decimal128(c.to_decimal128(number)?),
            _ => Bson::String(match number {
                Number::Integer(v) => v.to_string(),
                Number::Single(f) => f.to_string(),
                Number::Double(f) => format_double(f),
                Number::Decimal(d) => d.to_string(),
                Number::Decimal128(d) => d.to_string(),
            }),
        })
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        let number = match value {
            Bson::Int32(v) => Number::from(*v),
            Bson::Int64(v) => Number::from(*v),
            Bson::Double(v) => Number::from(*v),
            Bson::Decimal128(v) => Number::from(*v),
            Bson::String(s) => self.parse_text(s)?,
            other => return Err(unexpected_bson(&self.ty, other)),
        };
        self.to_native(number)
    }
}

/// Booleans, natively or as a number or string.
#[derive(Debug, Clone)]
pub struct BooleanSerializer {
    representation: ElementType,
}

impl BooleanSerializer {
    pub fn new(options: &SerializerOptions) -> BsonResult<Self> {
        let representation = options.representation.unwrap_or(ElementType::Boolean);
        match representation {
            ElementType::Boolean
            | ElementType::Int32
            | ElementType::Int64
            | ElementType::Double
            | ElementType::String => Ok(Self { representation }),
            other => Err(invalid_representation(&TypeRef::Bool, other)),
        }
    }
}

impl Serializer for BooleanSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::Bool
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let NativeValue::Bool(b) = value else {
            return Err(unexpected_value(&TypeRef::Bool, value));
        };
        Ok(match self.representation {
            ElementType::Int32 => Bson::Int32(i32::from(*b)),
            ElementType::Int64 => Bson::Int64(i64::from(*b)),
            ElementType::Double => Bson::Double(if *b { 1.0 } else { 0.0 }),
            ElementType::String => Bson::String(b.to_string()),
            _ => Bson::Boolean(*b),
        })
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::Boolean(b) => Ok(NativeValue::Bool(*b)),
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => {
                Ok(NativeValue::Bool(value.is_truthy()))
            }
            Bson::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(NativeValue::Bool(true)),
                "false" => Ok(NativeValue::Bool(false)),
                _ => Err(BsonError::format(format!("{:?} is not a valid Boolean", s))),
            },
            other => Err(unexpected_bson(&TypeRef::Bool, other)),
        }
    }
}

/// Strings, or hex strings stored as object ids, or symbols.
#[derive(Debug, Clone)]
pub struct StringSerializer {
    representation: ElementType,
}

impl StringSerializer {
    pub fn new(options: &SerializerOptions) -> BsonResult<Self> {
        let representation = options.representation.unwrap_or(ElementType::String);
        match representation {
            ElementType::String | ElementType::ObjectId | ElementType::Symbol => Ok(Self { representation }),
            other => Err(invalid_representation(&TypeRef::String, other)),
        }
    }
}

impl Serializer for StringSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::String
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let s = match value {
            NativeValue::String(s) => s,
            NativeValue::Null => return Ok(Bson::Null),
            other => return Err(unexpected_value(&TypeRef::String, other)),
        };
        Ok(match self.representation {
            ElementType::ObjectId => Bson::ObjectId(ObjectId::parse_str(s)?),
            ElementType::Symbol => Bson::Symbol(s.clone()),
            _ => Bson::String(s.clone()),
        })
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::String(s) | Bson::Symbol(s) => Ok(NativeValue::String(s.clone())),
            Bson::ObjectId(oid) => Ok(NativeValue::String(oid.to_hex())),
            Bson::Null => Ok(NativeValue::Null),
            other => Err(unexpected_bson(&TypeRef::String, other)),
        }
    }
}

/// Characters as their code point or as a one-character string.
#[derive(Debug, Clone)]
pub struct CharSerializer {
    representation: ElementType,
}

impl CharSerializer {
    pub fn new(options: &SerializerOptions) -> BsonResult<Self> {
        let representation = options.representation.unwrap_or(ElementType::Int32);
        match representation {
            ElementType::Int32 | ElementType::String => Ok(Self { representation }),
            other => Err(invalid_representation(&TypeRef::Char, other)),
        }
    }
}

impl Serializer for CharSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::Char
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let NativeValue::Char(c) = value else {
            return Err(unexpected_value(&TypeRef::Char, value));
        };
        Ok(match self.representation {
            ElementType::String => Bson::String(c.to_string()),
            _ => Bson::Int32(*c as i32),
        })
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::Int32(code) => u32::try_from(*code)
                .ok()
                .and_then(char::from_u32)
                .map(NativeValue::Char)
                .ok_or_else(|| BsonError::format(format!("{} is not a valid Char", code))),
            Bson::String(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(NativeValue::Char(c)),
                    _ => Err(BsonError::format(format!("{:?} is not a single character", s))),
                }
            }
            other => Err(unexpected_bson(&TypeRef::Char, other)),
        }
    }
}

/// GUIDs as binary in a chosen byte order, or as strings.
#[derive(Debug, Clone)]
pub struct GuidSerializer {
    representation: ElementType,
    guid_representation: GuidRepresentation,
}

impl GuidSerializer {
    pub fn new(options: &SerializerOptions, default: GuidRepresentation) -> BsonResult<Self> {
        let representation = options.representation.unwrap_or(ElementType::Binary);
        match representation {
            ElementType::Binary | ElementType::String => Ok(Self {
                representation,
                guid_representation: options.guid_representation.unwrap_or(default),
            }),
            other => Err(invalid_representation(&TypeRef::Guid, other)),
        }
    }
}

impl Serializer for GuidSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::Guid
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let NativeValue::Guid(guid) = value else {
            return Err(unexpected_value(&TypeRef::Guid, value));
        };
        match self.representation {
            ElementType::String => Ok(Bson::String(guid.hyphenated().to_string())),
            _ => self.guid_representation.to_binary(*guid).map(Bson::Binary),
        }
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::Binary(binary) => self.guid_representation.from_binary(binary).map(NativeValue::Guid),
            Bson::String(s) => uuid::Uuid::parse_str(s)
                .map(NativeValue::Guid)
                .map_err(|e| BsonError::format(format!("{:?} is not a valid Guid: {}", s, e))),
            other => Err(unexpected_bson(&TypeRef::Guid, other)),
        }
    }
}

/// Ticks between 0001-01-01 and the Unix epoch, at 100ns per tick.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Date-times stored as a wire date, milliseconds, an ISO string, or a
/// `{ DateTime, Ticks }` document. Sub-millisecond precision is dropped.
#[derive(Debug, Clone)]
pub struct DateTimeSerializer {
    representation: ElementType,
}

impl DateTimeSerializer {
    pub fn new(options: &SerializerOptions) -> BsonResult<Self> {
        let representation = options.representation.unwrap_or(ElementType::DateTime);
        match representation {
            ElementType::DateTime
            | ElementType::Int64
            | ElementType::String
            | ElementType::EmbeddedDocument => Ok(Self { representation }),
            other => Err(invalid_representation(&TypeRef::DateTime, other)),
        }
    }

    fn to_native(millis: i64) -> BsonResult<NativeValue> {
        DateTime::from_millis(millis)
            .to_chrono()
            .map(NativeValue::DateTime)
            .ok_or_else(|| BsonError::format(format!("{} ms is outside the supported date range", millis)))
    }
}

impl Serializer for DateTimeSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::DateTime
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let NativeValue::DateTime(dt) = value else {
            return Err(unexpected_value(&TypeRef::DateTime, value));
        };
        let wire = DateTime::from_chrono(*dt);
        Ok(match self.representation {
            ElementType::Int64 => Bson::Int64(wire.timestamp_millis()),
            ElementType::String => Bson::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            ElementType::EmbeddedDocument => {
                let ticks = wire
                    .timestamp_millis()
                    .checked_mul(TICKS_PER_MILLISECOND)
                    .and_then(|t| t.checked_add(UNIX_EPOCH_TICKS))
                    .ok_or_else(|| BsonError::overflow("date-time ticks out of range"))?;
                let mut document = Document::new();
                document.insert("DateTime", Bson::DateTime(wire));
                document.insert("Ticks", Bson::Int64(ticks));
                Bson::Document(document)
            }
            _ => Bson::DateTime(wire),
        })
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::DateTime(dt) => Self::to_native(dt.timestamp_millis()),
            Bson::Int64(ms) => Self::to_native(*ms),
            Bson::String(s) => {
                let parsed = DateTime::parse_iso(s)?;
                Self::to_native(parsed.timestamp_millis())
            }
            Bson::Document(document) => {
                let ticks = document.get_i64("Ticks")?;
                Self::to_native((ticks - UNIX_EPOCH_TICKS) / TICKS_PER_MILLISECOND)
            }
            other => Err(unexpected_bson(&TypeRef::DateTime, other)),
        }
    }
}

/// Object ids, natively or as hex strings.
#[derive(Debug, Clone)]
pub struct ObjectIdSerializer {
    representation: ElementType,
}

impl ObjectIdSerializer {
    pub fn new(options: &SerializerOptions) -> BsonResult<Self> {
        let representation = options.representation.unwrap_or(ElementType::ObjectId);
        match representation {
            ElementType::ObjectId | ElementType::String => Ok(Self { representation }),
            other => Err(invalid_representation(&TypeRef::ObjectId, other)),
        }
    }
}

impl Serializer for ObjectIdSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::ObjectId
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let NativeValue::ObjectId(oid) = value else {
            return Err(unexpected_value(&TypeRef::ObjectId, value));
        };
        Ok(match self.representation {
            ElementType::String => Bson::String(oid.to_hex()),
            _ => Bson::ObjectId(*oid),
        })
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::ObjectId(oid) => Ok(NativeValue::ObjectId(*oid)),
            Bson::String(s) => ObjectId::parse_str(s).map(NativeValue::ObjectId),
            other => Err(unexpected_bson(&TypeRef::ObjectId, other)),
        }
    }
}

/// Byte arrays as generic binary, or as hex strings.
#[derive(Debug, Clone)]
pub struct BytesSerializer {
    representation: ElementType,
}

impl BytesSerializer {
    pub fn new(options: &SerializerOptions) -> BsonResult<Self> {
        let representation = options.representation.unwrap_or(ElementType::Binary);
        match representation {
            ElementType::Binary | ElementType::String => Ok(Self { representation }),
            other => Err(invalid_representation(&TypeRef::Bytes, other)),
        }
    }
}

impl Serializer for BytesSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::Bytes
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let bytes = match value {
            NativeValue::Bytes(bytes) => bytes,
            NativeValue::Null => return Ok(Bson::Null),
            other => return Err(unexpected_value(&TypeRef::Bytes, other)),
        };
        Ok(match self.representation {
            ElementType::String => Bson::String(hex::encode(bytes)),
            _ => Bson::Binary(Binary::new(BinarySubtype::Generic, bytes.clone())),
        })
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::Binary(binary)
                if matches!(binary.subtype, BinarySubtype::Generic | BinarySubtype::BinaryOld) =>
            {
                Ok(NativeValue::Bytes(binary.bytes.clone()))
            }
            Bson::String(s) => hex::decode(s)
                .map(NativeValue::Bytes)
                .map_err(|e| BsonError::format(format!("{:?} is not valid hex: {}", s, e))),
            Bson::Null => Ok(NativeValue::Null),
            other => Err(unexpected_bson(&TypeRef::Bytes, other)),
        }
    }
}

/// The named values of an enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMap {
    name: SmolStr,
    values: Vec<(SmolStr, i64)>,
}

impl EnumMap {
    pub fn new<N: Into<SmolStr>>(name: impl Into<SmolStr>, values: impl IntoIterator<Item = (N, i64)>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(|(n, v)| (n.into(), v)).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value with the given name.
    pub fn value(&self, name: &str) -> Option<EnumValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(n, v)| self.make(n, *v))
    }

    /// The value with the given number.
    pub fn by_number(&self, number: i64) -> Option<EnumValue> {
        self.values
            .iter()
            .find(|(_, v)| *v == number)
            .map(|(n, v)| self.make(n, *v))
    }

    fn make(&self, name: &SmolStr, value: i64) -> EnumValue {
        EnumValue {
            type_name: self.name.clone(),
            name: name.clone(),
            value,
        }
    }
}

/// Enumeration values by number or by name.
#[derive(Debug, Clone)]
pub struct EnumSerializer {
    map: Arc<EnumMap>,
    representation: ElementType,
}

impl EnumSerializer {
    pub fn new(map: Arc<EnumMap>, options: &SerializerOptions) -> BsonResult<Self> {
        let representation = options.representation.unwrap_or(ElementType::Int32);
        match representation {
            ElementType::Int32 | ElementType::Int64 | ElementType::String => Ok(Self { map, representation }),
            other => Err(invalid_representation(&TypeRef::Enum(map.name.clone()), other)),
        }
    }

    fn ty(&self) -> TypeRef {
        TypeRef::Enum(self.map.name.clone())
    }
}

impl Serializer for EnumSerializer {
    fn value_type(&self) -> TypeRef {
        self.ty()
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let NativeValue::Enum(e) = value else {
            return Err(unexpected_value(&self.ty(), value));
        };
        if e.type_name != self.map.name {
            return Err(unexpected_value(&self.ty(), value));
        }
        Ok(match self.representation {
            ElementType::String => Bson::String(e.name.to_string()),
            ElementType::Int64 => Bson::Int64(e.value),
            _ => Bson::Int32(RepresentationConverter::default().to_i32(e.value)?),
        })
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        let found = match value {
            Bson::String(name) => self.map.value(name),
            Bson::Int32(n) => self.map.by_number(i64::from(*n)),
            Bson::Int64(n) => self.map.by_number(*n),
            other => return Err(unexpected_bson(&self.ty(), other)),
        };
        found.map(NativeValue::Enum).ok_or_else(|| {
            BsonError::format(format!("{} is not a defined value of {}", value, self.map.name))
        })
    }
}

/// Wraps a serializer so that null passes through.
#[derive(Debug, Clone)]
pub struct NullableSerializer {
    inner: SerializerRef,
}

impl NullableSerializer {
    pub fn new(inner: SerializerRef) -> Self {
        Self { inner }
    }
}

impl Serializer for NullableSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::nullable(self.inner.value_type())
    }

    fn serialize(&self, ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        match value {
            NativeValue::Null => Ok(Bson::Null),
            other => self.inner.serialize(ctx, other),
        }
    }

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        match value {
            Bson::Null => Ok(NativeValue::Null),
            other => self.inner.deserialize(ctx, other),
        }
    }

    fn as_document(&self) -> Option<&dyn DocumentSerializer> {
        self.inner.as_document()
    }

    fn as_array(&self) -> Option<&dyn ArraySerializer> {
        self.inner.as_array()
    }
}

/// Raw wire values, unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BsonValueSerializer;

impl Serializer for BsonValueSerializer {
    fn value_type(&self) -> TypeRef {
        TypeRef::BsonValue
    }

    fn serialize(&self, _ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        match value {
            NativeValue::Bson(b) => Ok(b.clone()),
            NativeValue::Null => Ok(Bson::Null),
            other => Err(unexpected_value(&TypeRef::BsonValue, other)),
        }
    }

    fn deserialize(&self, _ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        Ok(NativeValue::Bson(value.clone()))
    }
}

/// The native value a wire value maps to when nothing more specific is known.
pub(crate) fn natural_native(value: &Bson) -> Option<NativeValue> {
    Some(match value {
        Bson::Null | Bson::Undefined => NativeValue::Null,
        Bson::Boolean(b) => NativeValue::Bool(*b),
        Bson::Int32(v) => NativeValue::Int32(*v),
        Bson::Int64(v) => NativeValue::Int64(*v),
        Bson::Double(v) => NativeValue::Double(*v),
        Bson::Decimal128(v) => NativeValue::Decimal128(*v),
        Bson::String(s) => NativeValue::String(s.clone()),
        Bson::ObjectId(oid) => NativeValue::ObjectId(*oid),
        Bson::DateTime(dt) => NativeValue::DateTime(dt.to_chrono()?),
        Bson::Binary(binary) if binary.subtype == BinarySubtype::Generic => {
            NativeValue::Bytes(binary.bytes.clone())
        }
        _ => return None,
    })
}

/// Whether a runtime type maps to a self-describing wire value.
pub(crate) fn is_natural(ty: &TypeRef) -> bool {
    matches!(
        ty,
        TypeRef::Bool
            | TypeRef::Int32
            | TypeRef::Int64
            | TypeRef::Double
            | TypeRef::Decimal128
            | TypeRef::String
            | TypeRef::ObjectId
            | TypeRef::DateTime
            | TypeRef::Bytes
            | TypeRef::BsonValue
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::registry::SerializerRegistry;
    use chrono::{TimeZone, Utc};

    fn ctx(registry: &SerializerRegistry) -> SerializationContext<'_> {
        SerializationContext::new(registry)
    }

    #[test]
    fn test_numeric_representations() {
        let registry = SerializerRegistry::new();
        let ctx = ctx(&registry);
        let as_string = NumericSerializer::new(TypeRef::Int64, &SerializerOptions::with_representation(ElementType::String)).unwrap();
        assert_eq!(as_string.serialize(&ctx, &NativeValue::Int64(42)).unwrap(), Bson::String("42".into()));
        assert_eq!(as_string.deserialize(&ctx, &Bson::String("42".into())).unwrap(), NativeValue::Int64(42));

        let as_int32 = NumericSerializer::new(TypeRef::Int64, &SerializerOptions::with_representation(ElementType::Int32)).unwrap();
        let err = as_int32.serialize(&ctx, &NativeValue::Int64(1 << 40)).unwrap_err();
        assert!(err.is_overflow());

        let lenient = NumericSerializer::new(
            TypeRef::Double,
            &SerializerOptions::with_representation(ElementType::Int32).allow_truncation(true),
        )
        .unwrap();
        assert_eq!(lenient.serialize(&ctx, &NativeValue::Double(1.5)).unwrap(), Bson::Int32(1));
    }

    #[test]
    fn test_numeric_rejects_invalid_representation() {
        let err = NumericSerializer::new(TypeRef::Int32, &SerializerOptions::with_representation(ElementType::ObjectId))
            .unwrap_err();
        assert!(err.is_mapping_error());
    }

    #[test]
    fn test_reading_wider_wire_types() {
        let registry = SerializerRegistry::new();
        let ctx = ctx(&registry);
        let int32 = NumericSerializer::new(TypeRef::Int32, &SerializerOptions::default()).unwrap();
        assert_eq!(int32.deserialize(&ctx, &Bson::Int64(5)).unwrap(), NativeValue::Int32(5));
        assert!(int32.deserialize(&ctx, &Bson::Double(5.5)).unwrap_err().is_truncation());
        assert!(int32.deserialize(&ctx, &Bson::Boolean(true)).unwrap_err().is_format_error());
    }

    #[test]
    fn test_date_time_representations() {
        let registry = SerializerRegistry::new();
        let ctx = ctx(&registry);
        let when = Utc.timestamp_millis_opt(1_500).unwrap();
        let as_document = DateTimeSerializer::new(&SerializerOptions::with_representation(ElementType::EmbeddedDocument)).unwrap();
        let wire = as_document.serialize(&ctx, &NativeValue::DateTime(when)).unwrap();
        let document = wire.as_document().unwrap();
        assert_eq!(document.get_i64("Ticks").unwrap(), UNIX_EPOCH_TICKS + 15_000_000);
        assert_eq!(as_document.deserialize(&ctx, &wire).unwrap(), NativeValue::DateTime(when));

        let as_string = DateTimeSerializer::new(&SerializerOptions::with_representation(ElementType::String)).unwrap();
        assert_eq!(
            as_string.serialize(&ctx, &NativeValue::DateTime(when)).unwrap(),
            Bson::String("1970-01-01T00:00:01.500Z".into())
        );
    }

    #[test]
    fn test_guid_requires_representation() {
        let registry = SerializerRegistry::new();
        let ctx = ctx(&registry);
        let guid = uuid::Uuid::new_v4();
        let unspecified = GuidSerializer::new(&SerializerOptions::default(), GuidRepresentation::Unspecified).unwrap();
        assert!(unspecified.serialize(&ctx, &NativeValue::Guid(guid)).unwrap_err().is_invalid_operation());

        let standard = GuidSerializer::new(&SerializerOptions::default(), GuidRepresentation::Standard).unwrap();
        let wire = standard.serialize(&ctx, &NativeValue::Guid(guid)).unwrap();
        assert_eq!(standard.deserialize(&ctx, &wire).unwrap(), NativeValue::Guid(guid));
    }

    #[test]
    fn test_enum_by_name_and_number() {
        let registry = SerializerRegistry::new();
        let ctx = ctx(&registry);
        let colors = Arc::new(EnumMap::new("Color", [("Red", 0), ("Green", 1)]));
        let green = NativeValue::Enum(colors.value("Green").unwrap());

        let by_number = EnumSerializer::new(colors.clone(), &SerializerOptions::default()).unwrap();
        assert_eq!(by_number.serialize(&ctx, &green).unwrap(), Bson::Int32(1));
        let by_name = EnumSerializer::new(colors, &SerializerOptions::with_representation(ElementType::String)).unwrap();
        assert_eq!(by_name.serialize(&ctx, &green).unwrap(), Bson::String("Green".into()));
        assert_eq!(by_name.deserialize(&ctx, &Bson::Int32(1)).unwrap(), green);
        assert!(by_name.deserialize(&ctx, &Bson::String("Blue".into())).unwrap_err().is_format_error());
    }

    #[test]
    fn test_char_and_bytes() {
        let registry = SerializerRegistry::new();
        let ctx = ctx(&registry);
        let chars = CharSerializer::new(&SerializerOptions::default()).unwrap();
        assert_eq!(chars.serialize(&ctx, &NativeValue::Char('A')).unwrap(), Bson::Int32(65));
        let bytes = BytesSerializer::new(&SerializerOptions::with_representation(ElementType::String)).unwrap();
        assert_eq!(
            bytes.serialize(&ctx, &NativeValue::Bytes(vec![0xde, 0xad])).unwrap(),
            Bson::String("dead".into())
        );
    }
}
