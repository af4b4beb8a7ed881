//! The queryable builder and the executable query it produces.
//!
//! ```rust
//! use lodestar_bson::serialization::{ClassMapBuilder, ConventionPack, MemberMapBuilder, SerializerRegistry, TypeRef};
//! use lodestar_linq::expression::{Expr, Parameter};
//! use lodestar_linq::Queryable;
//!
//! let registry = SerializerRegistry::new();
//! registry
//!     .register_class_map(
//!         ClassMapBuilder::new("Order")
//!             .member(MemberMapBuilder::new("Total", TypeRef::Double))
//!             .freeze(&ConventionPack::new())
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let o = Parameter::new("o", TypeRef::class("Order"));
//! let query = Queryable::new(&registry, "orders", TypeRef::class("Order"))
//!     .where_(Expr::lambda([o.clone()], o.expr().member("Total").gt(Expr::constant(100.0))))
//!     .take(5)
//!     .to_list()
//!     .unwrap();
//! assert_eq!(query.pipeline.len(), 2);
//! ```

use std::fmt;
use std::sync::Arc;

use lodestar_bson::serialization::{NativeValue, SerializerRef, SerializerRegistry, TypeRef};
use lodestar_bson::{Bson, Document, doc};
use smol_str::SmolStr;
use tracing::debug;

use crate::ast::{AstPipeline, SortDirection, WindowBounds};
use crate::error::{TranslationError, TranslationResult};
use crate::expression::Expr;
use crate::translate::pipeline::{Terminal, TranslationOptions, translate_query};

/// A query operator applied to a source.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperation {
    Where(Expr),
    Select(Expr),
    SelectMany(Expr),
    OrderBy { key: Expr, direction: SortDirection },
    ThenBy { key: Expr, direction: SortDirection },
    Skip(i64),
    Take(i64),
    GroupBy(Expr),
    Distinct,
    OfType(SmolStr),
    UnionWith(QuerySource),
    Lookup(LookupSpec),
    SetWindowFields(WindowDefinition),
}

/// A left outer join with another collection on equal keys.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupSpec {
    pub from: SmolStr,
    pub foreign_type: TypeRef,
    /// Lambda over the local document.
    pub local_key: Expr,
    /// Lambda over the foreign document.
    pub foreign_key: Expr,
}

/// A window function. Selectors are lambdas over the input document.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowFunction {
    DocumentNumber,
    Rank,
    DenseRank,
    Sum(Expr),
    Average(Expr),
    Min(Expr),
    Max(Expr),
    First(Expr),
    Last(Expr),
    Shift {
        selector: Expr,
        by: i64,
        default: Option<NativeValue>,
    },
}

impl WindowFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DocumentNumber => "DocumentNumber",
            Self::Rank => "Rank",
            Self::DenseRank => "DenseRank",
            Self::Sum(_) => "Sum",
            Self::Average(_) => "Average",
            Self::Min(_) => "Min",
            Self::Max(_) => "Max",
            Self::First(_) => "First",
            Self::Last(_) => "Last",
            Self::Shift { .. } => "Shift",
        }
    }

    pub fn selector(&self) -> Option<&Expr> {
        match self {
            Self::DocumentNumber | Self::Rank | Self::DenseRank => None,
            Self::Sum(s) | Self::Average(s) | Self::Min(s) | Self::Max(s) | Self::First(s) | Self::Last(s) => Some(s),
            Self::Shift { selector, .. } => Some(selector),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutput {
    pub name: SmolStr,
    pub function: WindowFunction,
    pub window: Option<WindowBounds>,
}

/// The body of a `SetWindowFields` operator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowDefinition {
    pub partition_by: Option<Expr>,
    pub sort_by: Vec<(Expr, SortDirection)>,
    pub outputs: Vec<WindowOutput>,
}

impl WindowDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_by(mut self, key: Expr) -> Self {
        self.partition_by = Some(key);
        self
    }

    pub fn sort_by(mut self, key: Expr) -> Self {
        self.sort_by.push((key, SortDirection::Ascending));
        self
    }

    pub fn sort_by_descending(mut self, key: Expr) -> Self {
        self.sort_by.push((key, SortDirection::Descending));
        self
    }

    pub fn output(mut self, name: impl Into<SmolStr>, function: WindowFunction) -> Self {
        self.outputs.push(WindowOutput {
            name: name.into(),
            function,
            window: None,
        });
        self
    }

    pub fn output_with_window(mut self, name: impl Into<SmolStr>, function: WindowFunction, window: WindowBounds) -> Self {
        self.outputs.push(WindowOutput {
            name: name.into(),
            function,
            window: Some(window),
        });
        self
    }
}

/// A collection and the operators applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySource {
    pub collection: SmolStr,
    pub document_type: TypeRef,
    pub operations: Vec<QueryOperation>,
}

impl QuerySource {
    pub fn new(collection: impl Into<SmolStr>, document_type: TypeRef) -> Self {
        Self {
            collection: collection.into(),
            document_type,
            operations: Vec::new(),
        }
    }

    /// The source as a chain of method calls, for error messages.
    pub fn to_expr(&self) -> Expr {
        let mut expr = Expr::source(self.collection.clone(), self.document_type.clone());
        for operation in &self.operations {
            expr = operation_expr(expr, operation);
        }
        expr
    }
}

impl fmt::Display for QuerySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_expr())
    }
}

fn operation_expr(source: Expr, operation: &QueryOperation) -> Expr {
    let descending = |d: &SortDirection| *d == SortDirection::Descending;
    match operation {
        QueryOperation::Where(p) => source.call("Where", [p.clone()]),
        QueryOperation::Select(s) => source.call("Select", [s.clone()]),
        QueryOperation::SelectMany(s) => source.call("SelectMany", [s.clone()]),
        QueryOperation::OrderBy { key, direction } if descending(direction) => {
            source.call("OrderByDescending", [key.clone()])
        }
        QueryOperation::OrderBy { key, .. } => source.call("OrderBy", [key.clone()]),
        QueryOperation::ThenBy { key, direction } if descending(direction) => {
            source.call("ThenByDescending", [key.clone()])
        }
        QueryOperation::ThenBy { key, .. } => source.call("ThenBy", [key.clone()]),
        QueryOperation::Skip(n) => source.call("Skip", [Expr::constant(*n)]),
        QueryOperation::Take(n) => source.call("Take", [Expr::constant(*n)]),
        QueryOperation::GroupBy(k) => source.call("GroupBy", [k.clone()]),
        QueryOperation::Distinct => source.call("Distinct", []),
        QueryOperation::OfType(name) => source.call("OfType", [Expr::constant(name.as_str())]),
        QueryOperation::UnionWith(other) => source.call("UnionWith", [other.to_expr()]),
        QueryOperation::Lookup(spec) => source.call(
            "Lookup",
            [
                Expr::constant(spec.from.as_str()),
                spec.local_key.clone(),
                spec.foreign_key.clone(),
            ],
        ),
        QueryOperation::SetWindowFields(_) => source.call("SetWindowFields", []),
    }
}

/// Builds a query over one collection.
#[derive(Debug, Clone)]
pub struct Queryable<'r> {
    registry: &'r SerializerRegistry,
    source: QuerySource,
    options: TranslationOptions,
}

impl<'r> Queryable<'r> {
    pub fn new(registry: &'r SerializerRegistry, collection: impl Into<SmolStr>, document_type: TypeRef) -> Self {
        Self {
            registry,
            source: QuerySource::new(collection, document_type),
            options: TranslationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TranslationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    /// The source as a value for `union_with`.
    pub fn into_source(self) -> QuerySource {
        self.source
    }

    fn push(mut self, operation: QueryOperation) -> Self {
        self.source.operations.push(operation);
        self
    }

    pub fn where_(self, predicate: Expr) -> Self {
        self.push(QueryOperation::Where(predicate))
    }

    pub fn select(self, selector: Expr) -> Self {
        self.push(QueryOperation::Select(selector))
    }

    pub fn select_many(self, selector: Expr) -> Self {
        self.push(QueryOperation::SelectMany(selector))
    }

    pub fn order_by(self, key: Expr) -> Self {
        self.push(QueryOperation::OrderBy {
            key,
            direction: SortDirection::Ascending,
        })
    }

    pub fn order_by_descending(self, key: Expr) -> Self {
        self.push(QueryOperation::OrderBy {
            key,
            direction: SortDirection::Descending,
        })
    }

    pub fn then_by(self, key: Expr) -> Self {
        self.push(QueryOperation::ThenBy {
            key,
            direction: SortDirection::Ascending,
        })
    }

    pub fn then_by_descending(self, key: Expr) -> Self {
        self.push(QueryOperation::ThenBy {
            key,
            direction: SortDirection::Descending,
        })
    }

    pub fn skip(self, count: i64) -> Self {
        self.push(QueryOperation::Skip(count))
    }

    pub fn take(self, count: i64) -> Self {
        self.push(QueryOperation::Take(count))
    }

    pub fn group_by(self, key: Expr) -> Self {
        self.push(QueryOperation::GroupBy(key))
    }

    pub fn distinct(self) -> Self {
        self.push(QueryOperation::Distinct)
    }

    /// Keep documents whose discriminator names `class_name`.
    pub fn of_type(self, class_name: impl Into<SmolStr>) -> Self {
        self.push(QueryOperation::OfType(class_name.into()))
    }

    pub fn union_with(self, other: QuerySource) -> Self {
        self.push(QueryOperation::UnionWith(other))
    }

    pub fn lookup(self, from: impl Into<SmolStr>, foreign_type: TypeRef, local_key: Expr, foreign_key: Expr) -> Self {
        self.push(QueryOperation::Lookup(LookupSpec {
            from: from.into(),
            foreign_type,
            local_key,
            foreign_key,
        }))
    }

    pub fn set_window_fields(self, definition: WindowDefinition) -> Self {
        self.push(QueryOperation::SetWindowFields(definition))
    }

    fn finish(&self, terminal: Terminal) -> TranslationResult<ExecutableQuery> {
        translate_query(self.registry, &self.source, terminal, &self.options)
    }

    pub fn to_list(&self) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::ToList)
    }

    pub fn count(&self) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Count(None))
    }

    pub fn count_where(&self, predicate: Expr) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Count(Some(predicate)))
    }

    pub fn any(&self) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Any(None))
    }

    pub fn any_where(&self, predicate: Expr) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Any(Some(predicate)))
    }

    pub fn first(&self) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::First)
    }

    pub fn first_or_default(&self) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::FirstOrDefault)
    }

    pub fn single(&self) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Single)
    }

    pub fn sum(&self, selector: Expr) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Aggregate(AggregateKind::Sum, selector))
    }

    pub fn average(&self, selector: Expr) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Aggregate(AggregateKind::Average, selector))
    }

    pub fn min(&self, selector: Expr) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Aggregate(AggregateKind::Min, selector))
    }

    pub fn max(&self, selector: Expr) -> TranslationResult<ExecutableQuery> {
        self.finish(Terminal::Aggregate(AggregateKind::Max, selector))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Sum,
    Average,
    Min,
    Max,
}

/// How result documents turn into the caller's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalOperator {
    Sequence,
    Count,
    Any,
    First,
    FirstOrDefault,
    Single,
    Aggregate(AggregateKind),
}

/// Materialized results.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Sequence(Vec<NativeValue>),
    Scalar(NativeValue),
}

/// A translated query, ready to send.
#[derive(Clone)]
pub struct ExecutableQuery {
    pub collection: SmolStr,
    pub pipeline: Arc<AstPipeline>,
    /// Reads each result document.
    pub output: SerializerRef,
    pub operator: FinalOperator,
}

impl fmt::Debug for ExecutableQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableQuery")
            .field("collection", &self.collection)
            .field("pipeline", &self.pipeline)
            .field("output", &self.output.value_type())
            .field("operator", &self.operator)
            .finish()
    }
}

impl ExecutableQuery {
    pub fn render(&self) -> Vec<Document> {
        self.pipeline.render()
    }

    /// The `aggregate` command for this query.
    pub fn to_command(&self) -> Document {
        doc! {
            "aggregate" => self.collection.as_str(),
            "pipeline" => self.pipeline.render_bson(),
            "cursor" => Document::new(),
        }
    }

    /// Read result documents into the value the final operator promises.
    pub fn materialize(&self, registry: &SerializerRegistry, documents: &[Document]) -> TranslationResult<QueryOutput> {
        let ctx = registry.context();
        let read = |document: &Document| -> TranslationResult<NativeValue> {
            Ok(self.output.deserialize(&ctx, &Bson::Document(document.clone()))?)
        };
        debug!(operator = ?self.operator, count = documents.len(), "materializing results");
        let output = match self.operator {
            FinalOperator::Sequence => QueryOutput::Sequence(documents.iter().map(read).collect::<TranslationResult<_>>()?),
            FinalOperator::Count => match documents.first() {
                Some(document) => QueryOutput::Scalar(read(document)?),
                None => QueryOutput::Scalar(NativeValue::Int64(0)),
            },
            FinalOperator::Any => QueryOutput::Scalar(NativeValue::Bool(!documents.is_empty())),
            FinalOperator::First => match documents.first() {
                Some(document) => QueryOutput::Scalar(read(document)?),
                None => return Err(no_elements()),
            },
            FinalOperator::FirstOrDefault => match documents.first() {
                Some(document) => QueryOutput::Scalar(read(document)?),
                None => QueryOutput::Scalar(NativeValue::Null),
            },
            FinalOperator::Single => match documents {
                [document] => QueryOutput::Scalar(read(document)?),
                [] => return Err(no_elements()),
                _ => {
                    return Err(TranslationError::invalid_operation(
                        "sequence contains more than one element",
                    ));
                }
            },
            FinalOperator::Aggregate(kind) => match (documents.first(), kind) {
                (Some(document), _) => QueryOutput::Scalar(read(document)?),
                (None, AggregateKind::Sum) => QueryOutput::Scalar(NativeValue::default_for(&self.output.value_type())),
                (None, _) if matches!(self.output.value_type(), TypeRef::Nullable(_)) => {
                    QueryOutput::Scalar(NativeValue::Null)
                }
                (None, _) => return Err(no_elements()),
            },
        };
        Ok(output)
    }
}

fn no_elements() -> TranslationError {
    TranslationError::invalid_operation("sequence contains no elements")
}
