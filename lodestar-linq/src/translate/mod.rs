//! Lowering source expressions into the pipeline AST.
//!
//! Translation threads a [`TranslationContext`] holding the symbol table:
//! what each lambda parameter in scope stands for in the pipeline and how
//! its values are serialized. Value-position expressions go through
//! [`translate_expr`], `$match` predicates through [`translate_filter`],
//! and query operators through the pipeline translator.

mod context;
mod expression;
mod filter;
mod methods;
pub(crate) mod pipeline;
mod serializers;

pub use context::{Symbol, SymbolTable, TranslationContext};
pub use expression::{Translated, translate_expr};
pub use filter::translate_filter;
pub use pipeline::{TranslatedPipeline, TranslationOptions, translate_source};
pub use serializers::{
    ANONYMOUS_TYPE, ELEMENTS_ELEMENT, GroupingSerializer, ProjectedMember, ProjectionSerializer, WrappedValueSerializer,
};
