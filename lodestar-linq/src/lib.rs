//! # lodestar-linq
//!
//! Translates typed query expressions into aggregation pipelines.
//!
//! This crate provides:
//! - A source expression tree with lambdas and member access ([`expression`])
//! - A [`Queryable`] builder for query operators and terminals
//! - The pipeline AST with its renderer and simplifier ([`ast`])
//! - The translator from expressions to pipeline stages ([`translate`])
//! - An in-memory evaluator for executing pipelines against documents ([`eval`])
//!
//! ## Translating a query
//!
//! ```rust
//! use lodestar_bson::json::{JsonWriterSettings, to_json};
//! use lodestar_bson::serialization::{ClassMapBuilder, ConventionPack, MemberMapBuilder, SerializerRegistry, TypeRef};
//! use lodestar_linq::Queryable;
//! use lodestar_linq::expression::{Expr, Parameter};
//!
//! let registry = SerializerRegistry::new();
//! registry
//!     .register_class_map(
//!         ClassMapBuilder::new("Person")
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
//! assert_eq!(
//!     to_json(&query.pipeline.render_bson(), &JsonWriterSettings::relaxed()),
//!     r#"[{ "$match" : { "Age" : { "$gte" : 18 } } }]"#
//! );
//! ```

pub mod ast;
pub mod error;
pub mod eval;
pub mod expression;
pub mod queryable;
pub mod translate;

pub use error::{ErrorKind, TranslationError, TranslationResult};
pub use queryable::{
    AggregateKind, ExecutableQuery, FinalOperator, LookupSpec, QueryOperation, QueryOutput, QuerySource, Queryable,
    WindowDefinition, WindowFunction, WindowOutput,
};
pub use translate::TranslationOptions;

/// Commonly used items.
pub mod prelude {
    pub use crate::ast::{AstExpr, AstFilter, AstPipeline, AstStage};
    pub use crate::expression::{Expr, Parameter};
    pub use crate::{ExecutableQuery, QueryOutput, Queryable, TranslationError, TranslationOptions, TranslationResult};
}
