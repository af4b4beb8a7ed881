//! Class maps: how a class's members are laid out in a document.
//!
//! Configuration is collected in a mutable [`ClassMapBuilder`] and frozen
//! into an immutable [`ClassMap`]. Once frozen, a map cannot change, so it
//! can be shared freely between threads and cached serializers.
//!
//! Settings resolve in a fixed order: an explicit member setting wins over
//! the [`ConventionPack`], which wins over the built-in default.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::debug;

use super::native::{Instance, NativeValue, TypeRef};
use super::options::SerializerOptions;
use super::serializer::{
    DocumentSerializer, MemberSerializationInfo, SerializationContext, Serializer, SerializerRef,
    unexpected_bson, unexpected_value,
};
use crate::document::Document;
use crate::element::ElementType;
use crate::error::{BsonError, BsonResult};
use crate::value::Bson;

/// Element name of the discriminator.
pub const DISCRIMINATOR_ELEMENT: &str = "_t";
/// Element name of the wrapped value next to a discriminator.
pub const WRAPPED_VALUE_ELEMENT: &str = "_v";
/// Element name of the id member.
pub const ID_ELEMENT: &str = "_id";

/// Type-level conventions applied to members that do not say otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConventionPack {
    /// `FirstName` is stored as `firstName`.
    pub camel_case_element_names: bool,
    pub ignore_if_null: bool,
    pub ignore_extra_elements: bool,
}

impl ConventionPack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn camel_case_element_names(mut self, enabled: bool) -> Self {
        self.camel_case_element_names = enabled;
        self
    }

    pub fn ignore_if_null(mut self, enabled: bool) -> Self {
        self.ignore_if_null = enabled;
        self
    }

    pub fn ignore_extra_elements(mut self, enabled: bool) -> Self {
        self.ignore_extra_elements = enabled;
        self
    }
}

fn camel_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Mutable configuration of one member.
#[derive(Debug, Clone)]
pub struct MemberMapBuilder {
    name: SmolStr,
    ty: TypeRef,
    element_name: Option<String>,
    order: Option<i32>,
    default_value: Option<NativeValue>,
    ignore_if_null: Option<bool>,
    ignore_if_default: bool,
    is_required: bool,
    serializer: Option<SerializerRef>,
    options: SerializerOptions,
}

impl MemberMapBuilder {
    pub fn new(name: impl Into<SmolStr>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            element_name: None,
            order: None,
            default_value: None,
            ignore_if_null: None,
            ignore_if_default: false,
            is_required: false,
            serializer: None,
            options: SerializerOptions::default(),
        }
    }

    pub fn element_name(mut self, name: impl Into<String>) -> Self {
        self.element_name = Some(name.into());
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn default_value(mut self, value: impl Into<NativeValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn ignore_if_null(mut self, ignore: bool) -> Self {
        self.ignore_if_null = Some(ignore);
        self
    }

    pub fn ignore_if_default(mut self, ignore: bool) -> Self {
        self.ignore_if_default = ignore;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.is_required = required;
        self
    }

    /// Use this serializer instead of the one the registry would pick.
    pub fn serializer(mut self, serializer: SerializerRef) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn representation(mut self, representation: ElementType) -> Self {
        self.options.representation = Some(representation);
        self
    }

    pub fn options(mut self, options: SerializerOptions) -> Self {
        self.options = options;
        self
    }
}

/// Frozen configuration of one member.
#[derive(Debug, Clone)]
pub struct MemberMap {
    name: SmolStr,
    ty: TypeRef,
    element_name: String,
    order: Option<i32>,
    default_value: Option<NativeValue>,
    ignore_if_null: bool,
    ignore_if_default: bool,
    is_required: bool,
    is_id: bool,
    serializer: Option<SerializerRef>,
    options: SerializerOptions,
}

impl MemberMap {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member_type(&self) -> &TypeRef {
        &self.ty
    }

    pub fn element_name(&self) -> &str {
        &self.element_name
    }

    pub fn order(&self) -> Option<i32> {
        self.order
    }

    pub fn default_value(&self) -> Option<&NativeValue> {
        self.default_value.as_ref()
    }

    pub fn ignore_if_null(&self) -> bool {
        self.ignore_if_null
    }

    pub fn ignore_if_default(&self) -> bool {
        self.ignore_if_default
    }

    pub fn is_required(&self) -> bool {
        self.is_required
    }

    pub fn is_id(&self) -> bool {
        self.is_id
    }

    pub fn explicit_serializer(&self) -> Option<&SerializerRef> {
        self.serializer.as_ref()
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    /// Whether `value` should be left out of the document.
    fn is_ignored(&self, value: &NativeValue) -> bool {
        if self.ignore_if_null && value.is_null() {
            return true;
        }
        if self.ignore_if_default {
            let default = self
                .default_value
                .clone()
                .unwrap_or_else(|| NativeValue::default_for(&self.ty));
            return *value == default;
        }
        false
    }
}

/// Mutable configuration of one class.
#[derive(Debug, Clone)]
pub struct ClassMapBuilder {
    name: SmolStr,
    base: Option<SmolStr>,
    is_abstract: bool,
    discriminator: Option<String>,
    discriminator_is_required: bool,
    ignore_extra_elements: Option<bool>,
    id_member: Option<SmolStr>,
    members: Vec<MemberMapBuilder>,
}

impl ClassMapBuilder {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            base: None,
            is_abstract: false,
            discriminator: None,
            discriminator_is_required: false,
            ignore_extra_elements: None,
            id_member: None,
            members: Vec::new(),
        }
    }

    /// The class this one derives from; its members come first.
    pub fn base(mut self, base: impl Into<SmolStr>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Abstract classes are only ever read through a discriminator.
    pub fn set_abstract(mut self, is_abstract: bool) -> Self {
        self.is_abstract = is_abstract;
        self
    }

    pub fn discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    /// Always write the discriminator, even for the nominal type.
    pub fn discriminator_is_required(mut self, required: bool) -> Self {
        self.discriminator_is_required = required;
        self
    }

    pub fn ignore_extra_elements(mut self, ignore: bool) -> Self {
        self.ignore_extra_elements = Some(ignore);
        self
    }

    pub fn member(mut self, member: MemberMapBuilder) -> Self {
        self.members.push(member);
        self
    }

    /// Map the id member; it is always stored as `_id` and written first.
    pub fn id(mut self, member: MemberMapBuilder) -> Self {
        self.id_member = Some(member.name.clone());
        self.members.push(member);
        self
    }

    /// Resolve every setting and produce the immutable map.
    pub fn freeze(self, conventions: &ConventionPack) -> BsonResult<Arc<ClassMap>> {
        let mut seen_members = HashSet::new();
        let mut seen_elements = HashSet::new();
        let mut members = Vec::with_capacity(self.members.len());

        for member in self.members {
            if !seen_members.insert(member.name.clone()) {
                return Err(BsonError::mapping(format!(
                    "class {} maps member {} twice",
                    self.name, member.name
                )));
            }
            let is_id = self.id_member.as_ref() == Some(&member.name);
            let element_name = if is_id {
                ID_ELEMENT.to_string()
            } else if let Some(name) = member.element_name {
                name
            } else if conventions.camel_case_element_names {
                camel_case(&member.name)
            } else {
                member.name.to_string()
            };
            if element_name == DISCRIMINATOR_ELEMENT || element_name.contains('\0') {
                return Err(BsonError::mapping(format!(
                    "{:?} is not a valid element name for {}.{}",
                    element_name, self.name, member.name
                )));
            }
            if !seen_elements.insert(element_name.clone()) {
                return Err(BsonError::mapping(format!(
                    "class {} maps element {:?} twice",
                    self.name, element_name
                )));
            }
            members.push(MemberMap {
                ignore_if_null: member.ignore_if_null.unwrap_or(conventions.ignore_if_null),
                name: member.name,
                ty: member.ty,
                element_name,
                order: member.order,
                default_value: member.default_value,
                ignore_if_default: member.ignore_if_default,
                is_required: member.is_required,
                is_id,
                serializer: member.serializer,
                options: member.options,
            });
        }

        // Id first, then by declared order; unordered members keep their
        // declaration order after the ordered ones.
        members.sort_by_key(|m| (!m.is_id, m.order.unwrap_or(i32::MAX)));

        debug!(class = %self.name, members = members.len(), "froze class map");
        Ok(Arc::new(ClassMap {
            discriminator: self.discriminator.unwrap_or_else(|| self.name.to_string()),
            name: self.name,
            base: self.base,
            is_abstract: self.is_abstract,
            discriminator_is_required: self.discriminator_is_required,
            ignore_extra_elements: self
                .ignore_extra_elements
                .unwrap_or(conventions.ignore_extra_elements),
            members,
        }))
    }
}

/// Immutable configuration of one class.
#[derive(Debug, Clone)]
pub struct ClassMap {
    name: SmolStr,
    base: Option<SmolStr>,
    is_abstract: bool,
    discriminator: String,
    discriminator_is_required: bool,
    ignore_extra_elements: bool,
    members: Vec<MemberMap>,
}

impl ClassMap {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    pub fn discriminator_is_required(&self) -> bool {
        self.discriminator_is_required
    }

    pub fn ignore_extra_elements(&self) -> bool {
        self.ignore_extra_elements
    }

    /// Members declared on this class, in document order.
    pub fn members(&self) -> &[MemberMap] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&MemberMap> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn id_member(&self) -> Option<&MemberMap> {
        self.members.iter().find(|m| m.is_id)
    }
}

/// A member together with the class that declares it.
#[derive(Debug, Clone)]
struct ResolvedMember {
    declaring_class: SmolStr,
    map: MemberMap,
}

/// Reads and writes instances of one class and, through discriminators,
/// of the classes derived from it.
#[derive(Debug)]
pub struct ClassMapSerializer {
    class: Arc<ClassMap>,
    members: Vec<ResolvedMember>,
}

impl ClassMapSerializer {
    /// `chain` lists the class maps from the root base class down to the
    /// class being serialized.
    pub fn new(chain: &[Arc<ClassMap>]) -> BsonResult<Self> {
        let class = chain
            .last()
            .cloned()
            .ok_or_else(|| BsonError::mapping("empty class hierarchy"))?;
        let mut members: Vec<ResolvedMember> = chain
            .iter()
            .flat_map(|map| {
                map.members.iter().map(|m| ResolvedMember {
                    declaring_class: map.name.clone(),
                    map: m.clone(),
                })
            })
            .collect();
        members.sort_by_key(|m| !m.map.is_id);

        let mut seen = HashSet::new();
        for member in &members {
            if !seen.insert(member.map.element_name.as_str()) {
                return Err(BsonError::mapping(format!(
                    "class {} inherits a second member stored as {:?}",
                    class.name, member.map.element_name
                )));
            }
        }
        Ok(Self { class, members })
    }

    pub fn class_map(&self) -> &Arc<ClassMap> {
        &self.class
    }

    fn ty(&self) -> TypeRef {
        TypeRef::Class(self.class.name.clone())
    }

    fn member_serializer(&self, ctx: &SerializationContext<'_>, member: &ResolvedMember) -> BsonResult<SerializerRef> {
        ctx.registry()
            .member_serializer(&member.declaring_class, &member.map.name)
    }

    /// Write an instance of exactly this class.
    pub fn write_instance(
        &self,
        ctx: &SerializationContext<'_>,
        instance: &Instance,
        write_discriminator: bool,
    ) -> BsonResult<Document> {
        if let Some(unknown) = instance
            .fields
            .keys()
            .find(|name| !self.members.iter().any(|m| m.map.name == **name))
        {
            return Err(BsonError::mapping(format!(
                "class {} has no member {}",
                self.class.name, unknown
            )));
        }

        let mut document = Document::with_capacity(self.members.len() + 1);
        if write_discriminator || self.class.discriminator_is_required {
            document.insert(DISCRIMINATOR_ELEMENT, self.class.discriminator.as_str());
        }
        for member in &self.members {
            let value = instance
                .fields
                .get(&member.map.name)
                .cloned()
                .or_else(|| member.map.default_value.clone())
                .unwrap_or(NativeValue::Null);
            if member.map.is_ignored(&value) {
                continue;
            }
            let serializer = self.member_serializer(ctx, member)?;
            document.insert(member.map.element_name.clone(), serializer.serialize(ctx, &value)?);
        }
        Ok(document)
    }

    /// Read a document as an instance of exactly this class.
    pub fn read_instance(&self, ctx: &SerializationContext<'_>, document: &Document) -> BsonResult<Instance> {
        let mut instance = Instance::new(self.class.name.clone());
        for (element, value) in document {
            if element == DISCRIMINATOR_ELEMENT {
                continue;
            }
            let Some(member) = self.members.iter().find(|m| m.map.element_name == *element) else {
                if self.class.ignore_extra_elements {
                    continue;
                }
                return Err(BsonError::mapping(format!(
                    "element {:?} does not match any member of class {}",
                    element, self.class.name
                )));
            };
            let serializer = self.member_serializer(ctx, member)?;
            instance
                .fields
                .insert(member.map.name.clone(), serializer.deserialize(ctx, value)?);
        }
        for member in &self.members {
            if instance.fields.contains_key(&member.map.name) {
                continue;
            }
            if member.map.is_required {
                return Err(BsonError::mapping(format!(
                    "required element {:?} of class {} is missing",
                    member.map.element_name, self.class.name
                )));
            }
            if let Some(default) = &member.map.default_value {
                instance.fields.insert(member.map.name.clone(), default.clone());
            }
        }
        Ok(instance)
    }
}

impl Serializer for ClassMapSerializer {
    fn value_type(&self) -> TypeRef {
        self.ty()
    }

    fn serialize(&self, ctx: &SerializationContext<'_>, value: &NativeValue) -> BsonResult<Bson> {
        let instance = match value {
            NativeValue::Null => return Ok(Bson::Null),
            NativeValue::Object(instance) => instance,
            other => return Err(unexpected_value(&self.ty(), other)),
        };
        if instance.type_name == self.class.name {
            return self.write_instance(ctx, instance, false).map(Bson::Document);
        }
        let registry = ctx.registry();
        if !registry.is_subclass_of(&instance.type_name, &self.class.name) {
            return Err(unexpected_value(&self.ty(), value));
        }
        let actual = registry.class_serializer(&instance.type_name)?;
        actual.write_instance(ctx, instance, true).map(Bson::Document)
    }

    fn deserialize(&self, ctx: &SerializationContext<'_>, value: &Bson) -> BsonResult<NativeValue> {
        let document = match value {
            Bson::Null => return Ok(NativeValue::Null),
            Bson::Document(document) => document,
            other => return Err(unexpected_bson(&self.ty(), other)),
        };
        let registry = ctx.registry();
        match document.get(DISCRIMINATOR_ELEMENT) {
            Some(discriminator) => {
                let discriminator = discriminator.as_str().ok_or_else(|| {
                    BsonError::mapping(format!("discriminator must be a string, found {}", discriminator))
                })?;
                let TypeRef::Class(actual) = registry.resolve_discriminator(discriminator)? else {
                    return Err(BsonError::mapping(format!(
                        "discriminator {:?} does not name a class",
                        discriminator
                    )));
                };
                if actual == self.class.name {
                    return self.read_instance(ctx, document).map(NativeValue::Object);
                }
                if !registry.is_subclass_of(&actual, &self.class.name) {
                    return Err(BsonError::mapping(format!(
                        "{} is not assignable to {}",
                        actual, self.class.name
                    )));
                }
                registry
                    .class_serializer(&actual)?
                    .read_instance(ctx, document)
                    .map(NativeValue::Object)
            }
            None if self.class.is_abstract => Err(BsonError::mapping(format!(
                "cannot create an instance of abstract class {} without a discriminator",
                self.class.name
            ))),
            None => self.read_instance(ctx, document).map(NativeValue::Object),
        }
    }

    fn as_document(&self) -> Option<&dyn DocumentSerializer> {
        Some(self)
    }
}

impl DocumentSerializer for ClassMapSerializer {
    fn member(&self, ctx: &SerializationContext<'_>, name: &str) -> BsonResult<Option<MemberSerializationInfo>> {
        let Some(member) = self.members.iter().find(|m| m.map.name == name) else {
            return Ok(None);
        };
        Ok(Some(MemberSerializationInfo {
            element_name: member.map.element_name.clone(),
            serializer: self.member_serializer(ctx, member)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::serialization::registry::SerializerRegistry;
    use pretty_assertions::assert_eq;

    fn person() -> ClassMapBuilder {
        ClassMapBuilder::new("Person")
            .member(MemberMapBuilder::new("LastName", TypeRef::String).order(2))
            .member(MemberMapBuilder::new("FirstName", TypeRef::String).order(1))
            .member(MemberMapBuilder::new("Nickname", TypeRef::String).element_name("nick"))
            .id(MemberMapBuilder::new("Id", TypeRef::Int32))
    }

    #[test]
    fn test_freeze_orders_id_first() {
        let map = person().freeze(&ConventionPack::new()).unwrap();
        let names: Vec<_> = map.members().iter().map(|m| m.element_name()).collect();
        assert_eq!(names, vec!["_id", "FirstName", "LastName", "nick"]);
        assert!(map.id_member().unwrap().is_id());
    }

    #[test]
    fn test_member_setting_beats_convention() {
        let conventions = ConventionPack::new().camel_case_element_names(true).ignore_if_null(true);
        let map = ClassMapBuilder::new("Person")
            .member(MemberMapBuilder::new("FirstName", TypeRef::String))
            .member(MemberMapBuilder::new("Nickname", TypeRef::String).element_name("Nick").ignore_if_null(false))
            .freeze(&conventions)
            .unwrap();
        let first = map.member("FirstName").unwrap();
        assert_eq!(first.element_name(), "firstName");
        assert!(first.ignore_if_null());
        let nick = map.member("Nickname").unwrap();
        assert_eq!(nick.element_name(), "Nick");
        assert!(!nick.ignore_if_null());
    }

    #[test]
    fn test_duplicate_element_names_rejected() {
        let err = ClassMapBuilder::new("Bad")
            .member(MemberMapBuilder::new("A", TypeRef::Int32).element_name("x"))
            .member(MemberMapBuilder::new("B", TypeRef::Int32).element_name("x"))
            .freeze(&ConventionPack::new())
            .unwrap_err();
        assert!(err.is_mapping_error());
    }

    #[test]
    fn test_write_and_read_instance() {
        let registry = SerializerRegistry::new();
        registry.register_class_map(person().freeze(&ConventionPack::new()).unwrap()).unwrap();
        let instance = Instance::new("Person")
            .with("FirstName", "Ada")
            .with("LastName", "Lovelace")
            .with("Nickname", NativeValue::Null)
            .with("Id", 7);
        let document = registry.serialize_document(&NativeValue::Object(instance.clone())).unwrap();
        assert_eq!(
            document,
            doc! { "_id" => 7, "FirstName" => "Ada", "LastName" => "Lovelace", "nick" => Bson::Null }
        );
        let read = registry.deserialize_document(&TypeRef::class("Person"), &document).unwrap();
        assert_eq!(read.as_instance().unwrap().get("FirstName"), instance.get("FirstName"));
    }

    #[test]
    fn test_ignore_if_default_and_required() {
        let registry = SerializerRegistry::new();
        let map = ClassMapBuilder::new("Counter")
            .member(MemberMapBuilder::new("Count", TypeRef::Int32).ignore_if_default(true))
            .member(MemberMapBuilder::new("Name", TypeRef::String).required(true))
            .freeze(&ConventionPack::new())
            .unwrap();
        registry.register_class_map(map).unwrap();
        let zero = Instance::new("Counter").with("Count", 0).with("Name", "n");
        let document = registry.serialize_document(&NativeValue::Object(zero)).unwrap();
        assert_eq!(document, doc! { "Name" => "n" });

        let err = registry
            .deserialize_document(&TypeRef::class("Counter"), &doc! { "Count" => 1 })
            .unwrap_err();
        assert!(err.is_mapping_error());
    }

    #[test]
    fn test_extra_elements() {
        let registry = SerializerRegistry::new();
        registry
            .register_class_map(
                ClassMapBuilder::new("Strict")
                    .member(MemberMapBuilder::new("A", TypeRef::Int32))
                    .freeze(&ConventionPack::new())
                    .unwrap(),
            )
            .unwrap();
        registry
            .register_class_map(
                ClassMapBuilder::new("Loose")
                    .member(MemberMapBuilder::new("A", TypeRef::Int32))
                    .freeze(&ConventionPack::new().ignore_extra_elements(true))
                    .unwrap(),
            )
            .unwrap();
        let document = doc! { "A" => 1, "B" => 2 };
        assert!(registry
            .deserialize_document(&TypeRef::class("Strict"), &document)
            .unwrap_err()
            .is_mapping_error());
        assert!(registry.deserialize_document(&TypeRef::class("Loose"), &document).is_ok());
    }

    #[test]
    fn test_member_info_for_translation() {
        let registry = SerializerRegistry::new();
        registry
            .register_class_map(
                ClassMapBuilder::new("Item")
                    .member(MemberMapBuilder::new("Price", TypeRef::Decimal).element_name("price"))
                    .freeze(&ConventionPack::new())
                    .unwrap(),
            )
            .unwrap();
        let serializer = registry.lookup(&TypeRef::class("Item")).unwrap();
        let ctx = SerializationContext::new(&registry);
        let info = serializer.as_document().unwrap().member(&ctx, "Price").unwrap().unwrap();
        assert_eq!(info.element_name, "price");
        assert_eq!(info.serializer.value_type(), TypeRef::Decimal);
        assert!(serializer.as_document().unwrap().member(&ctx, "Missing").unwrap().is_none());
    }
}
