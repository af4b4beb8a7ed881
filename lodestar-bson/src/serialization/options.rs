//! Per-member serialization options.

use serde::{Deserialize, Serialize};

use super::convert::RepresentationConverter;
use crate::element::ElementType;
use crate::guid::GuidRepresentation;

/// How a string-keyed dictionary is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DictionaryRepresentation {
    /// `{ "key" : value, ... }`
    #[default]
    Document,
    /// `[["key", value], ...]`
    ArrayOfArrays,
    /// `[{ "k" : "key", "v" : value }, ...]`
    ArrayOfDocuments,
}

/// Options a member hands to the serializer built for it.
///
/// The defaults reproduce each type's natural wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SerializerOptions {
    /// Wire type to store the value as, when it differs from the natural one.
    pub representation: Option<ElementType>,
    pub allow_overflow: bool,
    pub allow_truncation: bool,
    /// Overrides the registry's GUID byte order for this member.
    pub guid_representation: Option<GuidRepresentation>,
    pub dictionary_representation: DictionaryRepresentation,
}

impl SerializerOptions {
    pub fn with_representation(representation: ElementType) -> Self {
        Self {
            representation: Some(representation),
            ..Self::default()
        }
    }

    pub fn allow_overflow(mut self, allow: bool) -> Self {
        self.allow_overflow = allow;
        self
    }

    pub fn allow_truncation(mut self, allow: bool) -> Self {
        self.allow_truncation = allow;
        self
    }

    pub fn guid_representation(mut self, representation: GuidRepresentation) -> Self {
        self.guid_representation = Some(representation);
        self
    }

    pub fn dictionary_representation(mut self, representation: DictionaryRepresentation) -> Self {
        self.dictionary_representation = representation;
        self
    }

    pub fn converter(&self) -> RepresentationConverter {
        RepresentationConverter::new(self.allow_overflow, self.allow_truncation)
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}
