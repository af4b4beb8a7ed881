//! The packed binary encoding.
//!
//! A document is `<int32 length><element>*<0x00>` and each element is
//! `<type byte><cstring name><payload>`. Arrays are documents keyed
//! `"0"`, `"1"`, and so on.

mod reader;
mod writer;

use serde::{Deserialize, Serialize};

pub use reader::{DocumentReader, decode_document, decode_document_with};
pub use writer::{encode_document, encode_document_into, encode_document_with};

use crate::document::Document;
use crate::error::BsonResult;

/// Default upper bound on a single document, 16 MiB.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Nesting beyond this depth is rejected on read.
pub const MAX_NESTING_DEPTH: usize = 200;

/// What the reader does when a document repeats an element name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateElementPolicy {
    /// The later value replaces the earlier one, keeping the earlier position.
    #[default]
    LastWins,
    /// Fail with a format error.
    Reject,
}

/// Options for decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderSettings {
    pub max_document_size: usize,
    pub duplicate_element_policy: DuplicateElementPolicy,
    /// Surface subtype 2 (old binary) values as subtype 0.
    pub fix_old_binary_subtype_on_input: bool,
    /// Map the historical out-of-range max date (253402300800000 ms) to
    /// 9999-12-31T23:59:59.999Z.
    pub fix_old_date_time_max_value_on_input: bool,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            duplicate_element_policy: DuplicateElementPolicy::LastWins,
            fix_old_binary_subtype_on_input: false,
            fix_old_date_time_max_value_on_input: false,
        }
    }
}

impl ReaderSettings {
    pub fn builder() -> ReaderSettingsBuilder {
        ReaderSettingsBuilder::default()
    }
}

/// Builder for [`ReaderSettings`].
#[derive(Debug, Clone, Default)]
pub struct ReaderSettingsBuilder {
    settings: ReaderSettings,
}

impl ReaderSettingsBuilder {
    pub fn max_document_size(mut self, size: usize) -> Self {
        self.settings.max_document_size = size;
        self
    }

    pub fn duplicate_element_policy(mut self, policy: DuplicateElementPolicy) -> Self {
        self.settings.duplicate_element_policy = policy;
        self
    }

    pub fn fix_old_binary_subtype_on_input(mut self, enabled: bool) -> Self {
        self.settings.fix_old_binary_subtype_on_input = enabled;
        self
    }

    pub fn fix_old_date_time_max_value_on_input(mut self, enabled: bool) -> Self {
        self.settings.fix_old_date_time_max_value_on_input = enabled;
        self
    }

    pub fn build(self) -> ReaderSettings {
        self.settings
    }
}

/// Options for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSettings {
    pub max_document_size: usize,
    /// Write subtype 2 (old binary) values as subtype 0.
    pub fix_old_binary_subtype_on_output: bool,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            fix_old_binary_subtype_on_output: false,
        }
    }
}

impl Document {
    /// Encode with default settings.
    pub fn to_vec(&self) -> BsonResult<Vec<u8>> {
        encode_document(self)
    }

    /// Decode exactly one document occupying the whole slice.
    pub fn from_slice(bytes: &[u8]) -> BsonResult<Self> {
        decode_document(bytes)
    }
}
