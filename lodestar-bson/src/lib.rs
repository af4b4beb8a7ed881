//! # lodestar-bson
//!
//! Value model, codecs and serializer registry for the Lodestar document
//! database client.
//!
//! This crate provides:
//! - The [`Bson`] value model with ordered [`Document`]s
//! - A binary codec with size limits and legacy fixups ([`binary`])
//! - An extended JSON codec with canonical, relaxed and shell dialects ([`json`])
//! - A serializer registry mapping native values to documents ([`serialization`])
//!
//! ## Documents
//!
//! ```rust
//! use lodestar_bson::{doc, Bson, Document};
//!
//! let d = doc! { "x" => 1, "name" => "lodestar" };
//! let bytes = d.to_vec().unwrap();
//! assert_eq!(Document::from_slice(&bytes).unwrap(), d);
//! ```
//!
//! ## Extended JSON
//!
//! ```rust
//! use lodestar_bson::{doc, Document};
//!
//! let d = doc! { "x" => -0.0 };
//! assert_eq!(d.to_canonical_json(), r#"{ "x" : { "$numberDouble" : "-0.0" } }"#);
//! assert_eq!(Document::from_json(&d.to_canonical_json()).unwrap(), d);
//! ```

pub mod binary;
pub mod datetime;
pub mod decimal128;
pub mod document;
pub mod element;
pub mod error;
pub mod guid;
pub mod json;
pub mod logging;
pub mod oid;
pub mod serialization;
pub mod value;

pub use datetime::DateTime;
pub use decimal128::Decimal128;
pub use document::Document;
pub use element::{BinarySubtype, ElementType};
pub use error::{BsonError, BsonResult};
pub use guid::GuidRepresentation;
pub use oid::ObjectId;
pub use value::{Array, Binary, Bson, JavaScriptCodeWithScope, Regex, Timestamp};

/// Commonly used items.
pub mod prelude {
    pub use crate::binary::{ReaderSettings, WriterSettings};
    pub use crate::json::{JsonOutputMode, JsonWriterSettings};
    pub use crate::serialization::{
        ClassMap, ClassMapBuilder, ConventionPack, NativeValue, SerializationContext, Serializer,
        SerializerRef, SerializerRegistry, TypeRef,
    };
    pub use crate::{Bson, BsonError, BsonResult, Document, array, doc};
}
