//! The pipeline AST.
//!
//! Translation produces an [`AstPipeline`] of [`AstStage`]s whose
//! expressions are [`AstExpr`] trees and whose `$match` bodies are
//! [`AstFilter`]s. Rendering is a pure function of a node.
//!
//! ```rust
//! use lodestar_bson::Bson;
//! use lodestar_linq::ast::{AstFieldOp, AstFilter, AstPipeline, AstStage};
//!
//! let pipeline = AstPipeline::empty()
//!     .push(AstStage::Match(AstFilter::field("x", AstFieldOp::Gte(Bson::Int32(3)))))
//!     .push(AstStage::Limit(10));
//! assert_eq!(pipeline.render(), pipeline.render());
//! assert_eq!(pipeline.len(), 2);
//! ```

mod expr;
mod filter;
mod simplify;
mod stage;
mod window;

pub use expr::{AstBinaryOp, AstExpr, AstNaryOp, AstUnaryOp, CURRENT, ROOT};
pub use filter::{AstFieldOp, AstFilter};
pub use simplify::{simplify_expr, simplify_filter, simplify_pipeline};
pub use stage::{Accumulator, AccumulatorOp, AstPipeline, AstStage, ProjectField, SortDirection, SortField};
pub use window::{SetWindowFields, WindowBound, WindowBounds, WindowField, WindowOperator};
