//! # Lodestar
//!
//! The core of a document database client.
//!
//! Lodestar provides:
//! - A BSON value model with binary and extended JSON codecs ([`bson`])
//! - A serializer registry mapping native objects to documents
//! - A translator from typed query expressions to aggregation pipelines ([`linq`])
//! - Wire framing, topology tracking and server selection ([`driver`])
//! - A TOML configuration loader feeding explicit settings to each layer ([`config`])
//!
//! ## Quick Start
//!
//! ```rust
//! use lodestar::prelude::*;
//! use lodestar::bson::serialization::{ClassMapBuilder, ConventionPack, MemberMapBuilder, TypeRef};
//! use lodestar::linq::eval::{Collections, run_pipeline};
//!
//! let registry = SerializerRegistry::new();
//! registry
//!     .register_class_map(
//!         ClassMapBuilder::new("Person")
//!             .member(MemberMapBuilder::new("Name", TypeRef::String))
//!             .member(MemberMapBuilder::new("Age", TypeRef::Int32))
//!             .freeze(&ConventionPack::new())
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let p = Parameter::new("p", TypeRef::class("Person"));
//! let query = Queryable::new(&registry, "people", TypeRef::class("Person"))
//!     .where_(Expr::lambda([p.clone()], p.expr().member("Age").gte(Expr::constant(18))))
//!     .to_list()
//!     .unwrap();
//!
//! let people = vec![
//!     doc! { "Name" => "Ada", "Age" => 36 },
//!     doc! { "Name" => "Tim", "Age" => 12 },
//! ];
//! let adults = run_pipeline(&query.pipeline, people, &Collections::new()).unwrap();
//! assert_eq!(adults.len(), 1);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;

/// Value model, codecs and the serializer registry.
pub mod bson {
    pub use lodestar_bson::*;
}

/// Query translation, the pipeline AST and the in-memory evaluator.
pub mod linq {
    pub use lodestar_linq::*;
}

/// Wire protocol, topology and server selection.
pub mod driver {
    pub use lodestar_driver::*;
}

pub use config::{ConfigError, ConfigResult, LodestarConfig};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::LodestarConfig;
    pub use lodestar_bson::serialization::SerializerRegistry;
    pub use lodestar_bson::{Bson, BsonError, Document, array, doc};
    pub use lodestar_driver::{Cluster, ClusterSettings, DriverError, ReadPreference, ServerSelector};
    pub use lodestar_linq::expression::{Expr, Parameter};
    pub use lodestar_linq::{Queryable, TranslationError, TranslationOptions};
}
