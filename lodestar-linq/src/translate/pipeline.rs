//! Query operators to pipeline stages.
//!
//! Each operator maps the current output shape to a new one. The shape
//! says how documents leaving the pipeline so far are read: either as the
//! documents themselves or as a scalar wrapped in `{ _v: ... }`.

use std::sync::Arc;

use lodestar_bson::Bson;
use lodestar_bson::serialization::{SerializerRef, SerializerRegistry, TypeRef, WRAPPED_VALUE_ELEMENT};
use smol_str::SmolStr;
use tracing::debug;

use super::context::{Symbol, TranslationContext};
use super::expression::{Translated, array_input, check_field_name, list_of, numeric_rank, serialize_like, translate_expr};
use super::filter::translate_filter;
use super::serializers::{ELEMENTS_ELEMENT, GroupingSerializer, ProjectedMember, ProjectionSerializer, WrappedValueSerializer};
use crate::ast::{
    Accumulator, AccumulatorOp, AstExpr, AstFieldOp, AstFilter, AstPipeline, AstStage, ProjectField, SetWindowFields,
    SortField, WindowBounds, WindowField, WindowOperator, simplify_pipeline,
};
use crate::error::{TranslationError, TranslationResult};
use crate::expression::Expr;
use crate::queryable::{
    AggregateKind, ExecutableQuery, FinalOperator, LookupSpec, QueryOperation, QuerySource, WindowDefinition,
    WindowFunction,
};

/// Field a join or window stage keeps the input document in.
const DOCUMENT_ELEMENT: &str = "_document";
/// Field `$lookup` writes matches to.
const RESULTS_ELEMENT: &str = "_results";

/// Translation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationOptions {
    /// Run the simplifier over the finished pipeline.
    pub simplify: bool,
}

impl Default for TranslationOptions {
    fn default() -> Self {
        Self { simplify: true }
    }
}

/// How the documents leaving the pipeline so far are read.
#[derive(Debug, Clone)]
struct Shape {
    serializer: SerializerRef,
    /// Whether the value sits in `_v`.
    wrapped: bool,
}

impl Shape {
    fn document(serializer: SerializerRef) -> Self {
        Self {
            serializer,
            wrapped: false,
        }
    }

    fn wrapped(serializer: SerializerRef) -> Self {
        Self {
            serializer,
            wrapped: true,
        }
    }

    fn symbol(&self, name: impl Into<SmolStr>) -> Symbol {
        if self.wrapped {
            Symbol::current_field(name, WRAPPED_VALUE_ELEMENT, self.serializer.clone())
        } else {
            Symbol::current(name, self.serializer.clone())
        }
    }

    /// The value as an expression over the current document.
    fn value(&self) -> Arc<AstExpr> {
        if self.wrapped {
            AstExpr::field(WRAPPED_VALUE_ELEMENT)
        } else {
            AstExpr::root()
        }
    }

    fn output_serializer(&self) -> SerializerRef {
        if self.wrapped {
            Arc::new(WrappedValueSerializer::new(self.serializer.clone()))
        } else {
            self.serializer.clone()
        }
    }

    fn same_as(&self, other: &Shape) -> bool {
        self.wrapped == other.wrapped && self.serializer.value_type() == other.serializer.value_type()
    }
}

/// A translated source: its stages and the shape of what they produce.
#[derive(Debug, Clone)]
pub struct TranslatedPipeline {
    pub pipeline: Arc<AstPipeline>,
    shape: Shape,
}

impl TranslatedPipeline {
    pub fn output_serializer(&self) -> SerializerRef {
        self.shape.output_serializer()
    }
}

/// The operator that ends a query.
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    ToList,
    Count(Option<Expr>),
    Any(Option<Expr>),
    First,
    FirstOrDefault,
    Single,
    Aggregate(AggregateKind, Expr),
}

/// Translate the operators of `source` into stages.
pub fn translate_source(registry: &SerializerRegistry, source: &QuerySource) -> TranslationResult<TranslatedPipeline> {
    let mut translator = PipelineTranslator::new(registry, source)?;
    for operation in &source.operations {
        translator.apply(source, operation)?;
    }
    Ok(translator.finish())
}

pub(crate) fn translate_query(
    registry: &SerializerRegistry,
    source: &QuerySource,
    terminal: Terminal,
    options: &TranslationOptions,
) -> TranslationResult<ExecutableQuery> {
    let mut translator = PipelineTranslator::new(registry, source)?;
    for operation in &source.operations {
        translator.apply(source, operation)?;
    }
    let operator = translator.terminate(source, terminal)?;
    let translated = translator.finish();
    let pipeline = if options.simplify {
        simplify_pipeline(&translated.pipeline)
    } else {
        translated.pipeline
    };
    debug!(collection = %source.collection, stages = pipeline.len(), "translated query");
    Ok(ExecutableQuery {
        collection: source.collection.clone(),
        pipeline,
        output: translated.shape.output_serializer(),
        operator,
    })
}

struct PipelineTranslator<'r> {
    registry: &'r SerializerRegistry,
    pipeline: Arc<AstPipeline>,
    shape: Shape,
}

impl<'r> PipelineTranslator<'r> {
    fn new(registry: &'r SerializerRegistry, source: &QuerySource) -> TranslationResult<Self> {
        Ok(Self {
            registry,
            pipeline: AstPipeline::empty(),
            shape: Shape::document(registry.lookup(&source.document_type)?),
        })
    }

    fn finish(self) -> TranslatedPipeline {
        TranslatedPipeline {
            pipeline: self.pipeline,
            shape: self.shape,
        }
    }

    fn push(&mut self, stage: AstStage) {
        debug!(stage = stage.name(), "appending stage");
        self.pipeline = self.pipeline.push(stage);
    }

    /// A context in which the lambda's parameter stands for the current
    /// value, and the lambda's body.
    fn bind<'e>(&self, lambda: &'e Expr, symbol: impl FnOnce(SmolStr) -> Symbol) -> TranslationResult<(TranslationContext<'r>, &'e Expr)> {
        let (parameters, body) = super::expression::lambda_parts(lambda, 1)?;
        let ctx = TranslationContext::new(self.registry).with_symbol(symbol(parameters[0].name.clone()));
        Ok((ctx, body))
    }

    fn translate_lambda(&self, lambda: &Expr) -> TranslationResult<Translated> {
        let (ctx, body) = self.bind(lambda, |name| self.shape.symbol(name))?;
        translate_expr(&ctx, body)
    }

    fn apply(&mut self, source: &QuerySource, operation: &QueryOperation) -> TranslationResult<()> {
        match operation {
            QueryOperation::Where(predicate) => {
                let (ctx, body) = self.bind(predicate, |name| self.shape.symbol(name))?;
                let filter = translate_filter(&ctx, body)?;
                self.push(AstStage::Match(filter));
            }
            QueryOperation::Select(selector) => self.select(selector)?,
            QueryOperation::SelectMany(selector) => {
                let selected = self.translate_lambda(selector)?;
                let Some((input, item)) = array_input(&selected) else {
                    return Err(TranslationError::not_supported(
                        selector,
                        format!("SelectMany needs a sequence, found {}", selected.value_type()),
                    ));
                };
                self.push(AstStage::Project(vec![
                    (SmolStr::new(WRAPPED_VALUE_ELEMENT), ProjectField::Computed(input)),
                    (SmolStr::new("_id"), ProjectField::Exclude),
                ]));
                self.push(AstStage::Unwind {
                    path: SmolStr::new(WRAPPED_VALUE_ELEMENT),
                    preserve_null_and_empty_arrays: false,
                });
                self.shape = Shape::wrapped(item);
            }
            QueryOperation::OrderBy { key, direction } => {
                let path = self.sort_path(key)?;
                self.push(AstStage::Sort(vec![SortField {
                    path,
                    direction: *direction,
                }]));
            }
            QueryOperation::ThenBy { key, direction } => {
                let path = self.sort_path(key)?;
                let Some(AstStage::Sort(fields)) = self.pipeline.stages().last().map(|s| &**s) else {
                    return Err(TranslationError::invalid_operation(
                        "ThenBy must directly follow OrderBy or ThenBy",
                    ));
                };
                let mut fields = fields.clone();
                fields.push(SortField {
                    path,
                    direction: *direction,
                });
                self.pipeline = self.pipeline.replace_last(AstStage::Sort(fields));
            }
            QueryOperation::Skip(count) => {
                if *count < 0 {
                    return Err(TranslationError::invalid_operation(format!("cannot skip {} documents", count)));
                }
                self.push(AstStage::Skip(*count));
            }
            QueryOperation::Take(count) => match *count {
                n if n < 0 => {
                    return Err(TranslationError::invalid_operation(format!("cannot take {} documents", n)));
                }
                0 => self.push(AstStage::Match(AstFilter::expr(AstExpr::constant(false)))),
                n => self.push(AstStage::Limit(n)),
            },
            QueryOperation::GroupBy(key) => {
                let key = self.translate_lambda(key)?;
                self.push(AstStage::Group {
                    id: key.ast,
                    fields: vec![(
                        SmolStr::new(ELEMENTS_ELEMENT),
                        Accumulator::new(AccumulatorOp::Push, self.shape.value()),
                    )],
                });
                self.shape = Shape::document(Arc::new(GroupingSerializer::new(key.serializer, self.shape.serializer.clone())));
            }
            QueryOperation::Distinct => {
                self.push(AstStage::Group {
                    id: self.shape.value(),
                    fields: Vec::new(),
                });
                if self.shape.wrapped {
                    self.push(AstStage::Project(vec![
                        (SmolStr::new(WRAPPED_VALUE_ELEMENT), ProjectField::Computed(AstExpr::field("_id"))),
                        (SmolStr::new("_id"), ProjectField::Exclude),
                    ]));
                } else {
                    self.push(AstStage::ReplaceRoot(AstExpr::field("_id")));
                }
            }
            QueryOperation::OfType(class_name) => self.of_type(class_name)?,
            QueryOperation::UnionWith(other) => {
                let translated = translate_source(self.registry, other)?;
                if !self.shape.same_as(&translated.shape) {
                    return Err(TranslationError::not_supported(
                        source,
                        format!(
                            "UnionWith needs both sides to produce {}, found {}",
                            self.shape.serializer.value_type(),
                            translated.shape.serializer.value_type()
                        ),
                    ));
                }
                self.push(AstStage::UnionWith {
                    collection: other.collection.clone(),
                    pipeline: translated.pipeline,
                });
            }
            QueryOperation::Lookup(spec) => self.lookup(spec)?,
            QueryOperation::SetWindowFields(definition) => self.set_window_fields(source, definition)?,
        }
        Ok(())
    }

    fn select(&mut self, selector: &Expr) -> TranslationResult<()> {
        if let Expr::Lambda { parameters, body } = selector {
            if let (Expr::Parameter(p), [only]) = (&**body, parameters.as_slice()) {
                if p.name == only.name {
                    debug!("identity projection skipped");
                    return Ok(());
                }
            }
        }
        let selected = self.translate_lambda(selector)?;
        if let AstExpr::Document(members) = &*selected.ast {
            let mut fields: Vec<(SmolStr, ProjectField)> = members
                .iter()
                .map(|(name, value)| (name.clone(), ProjectField::Computed(value.clone())))
                .collect();
            if !members.iter().any(|(name, _)| name == "_id") {
                fields.push((SmolStr::new("_id"), ProjectField::Exclude));
            }
            self.push(AstStage::Project(fields));
            self.shape = Shape::document(selected.serializer);
        } else {
            self.push(AstStage::Project(vec![
                (SmolStr::new(WRAPPED_VALUE_ELEMENT), ProjectField::Computed(selected.ast)),
                (SmolStr::new("_id"), ProjectField::Exclude),
            ]));
            self.shape = Shape::wrapped(selected.serializer);
        }
        Ok(())
    }

    fn sort_path(&self, key: &Expr) -> TranslationResult<SmolStr> {
        let translated = self.translate_lambda(key)?;
        match translated.ast.current_path() {
            Some(path) if !path.is_empty() => Ok(SmolStr::new(path)),
            _ => Err(TranslationError::not_supported(key, "sort keys must be fields")),
        }
    }

    fn of_type(&mut self, class_name: &str) -> TranslationResult<()> {
        if self.registry.class_map(class_name).is_none() {
            return Err(TranslationError::mapping(format!("no class map registered for {}", class_name)));
        }
        let discriminator = self.registry.discriminator_for(&TypeRef::class(class_name))?;
        let path = if self.shape.wrapped {
            format!("{}._t", WRAPPED_VALUE_ELEMENT)
        } else {
            "_t".to_string()
        };
        self.push(AstStage::Match(AstFilter::field(path, AstFieldOp::Eq(Bson::String(discriminator)))));
        let serializer: SerializerRef = self.registry.class_serializer(class_name)?;
        self.shape = Shape {
            serializer,
            wrapped: self.shape.wrapped,
        };
        Ok(())
    }

    /// Move the current value into `_document` so later fields can sit
    /// beside it.
    fn nest_document(&mut self) {
        self.push(AstStage::Project(vec![
            (SmolStr::new("_id"), ProjectField::Exclude),
            (SmolStr::new(DOCUMENT_ELEMENT), ProjectField::Computed(self.shape.value())),
        ]));
    }

    fn nested_symbol(&self, name: SmolStr) -> Symbol {
        Symbol::current_field(name, DOCUMENT_ELEMENT, self.shape.serializer.clone())
    }

    fn lookup(&mut self, spec: &LookupSpec) -> TranslationResult<()> {
        let outer = self.shape.serializer.clone();
        let foreign = self.registry.lookup(&spec.foreign_type)?;
        let (local_ctx, local_body) = self.bind(&spec.local_key, |name| self.nested_symbol(name))?;
        let local = translate_expr(&local_ctx, local_body)?;
        let (foreign_ctx, foreign_body) = self.bind(&spec.foreign_key, |name| Symbol::current(name, foreign.clone()))?;
        let foreign_key = translate_expr(&foreign_ctx, foreign_body)?;
        let (Some(local_field), Some(foreign_field)) = (
            local.ast.current_path().filter(|p| !p.is_empty()),
            foreign_key.ast.current_path().filter(|p| !p.is_empty()),
        ) else {
            return Err(TranslationError::not_supported(
                &spec.local_key,
                "join keys must be fields of their documents",
            ));
        };
        self.nest_document();
        self.push(AstStage::Lookup {
            from: spec.from.clone(),
            local_field: SmolStr::new(local_field),
            foreign_field: SmolStr::new(foreign_field),
            as_field: SmolStr::new(RESULTS_ELEMENT),
        });
        self.shape = Shape::document(Arc::new(ProjectionSerializer::new(vec![
            ProjectedMember::new("Outer", DOCUMENT_ELEMENT, outer),
            ProjectedMember::new("Inner", RESULTS_ELEMENT, list_of(foreign)?),
        ])));
        Ok(())
    }

    fn set_window_fields(&mut self, source: &QuerySource, definition: &WindowDefinition) -> TranslationResult<()> {
        let mut spec = SetWindowFields::new();
        if let Some(partition) = &definition.partition_by {
            let (ctx, body) = self.bind(partition, |name| self.nested_symbol(name))?;
            spec = spec.partition_by(translate_expr(&ctx, body)?.ast);
        }
        for (key, direction) in &definition.sort_by {
            let (ctx, body) = self.bind(key, |name| self.nested_symbol(name))?;
            let translated = translate_expr(&ctx, body)?;
            let Some(path) = translated.ast.current_path().filter(|p| !p.is_empty()) else {
                return Err(TranslationError::not_supported(key, "window sort keys must be fields"));
            };
            spec = spec.sort_by(SortField {
                path: SmolStr::new(path),
                direction: *direction,
            });
        }

        let mut members = vec![ProjectedMember::new("Document", DOCUMENT_ELEMENT, self.shape.serializer.clone())];
        for output in &definition.outputs {
            check_field_name(&output.name)?;
            if output.name == DOCUMENT_ELEMENT || members.iter().any(|m| m.name == output.name) {
                return Err(TranslationError::invalid_operation(format!(
                    "window output {} is already defined",
                    output.name
                )));
            }
            let needs_sort = output.function.selector().is_none() || matches!(output.function, WindowFunction::Shift { .. });
            if needs_sort && spec.sort_by.is_empty() {
                return Err(TranslationError::invalid_operation(format!(
                    "{} needs a sort order",
                    output.function.name()
                )));
            }
            if needs_sort && output.window.is_some() {
                return Err(TranslationError::invalid_operation(format!(
                    "{} does not take a window",
                    output.function.name()
                )));
            }
            if matches!(output.window, Some(WindowBounds::Range(..))) && spec.sort_by.len() != 1 {
                return Err(TranslationError::invalid_operation(
                    "a range window needs exactly one sort field",
                ));
            }
            let (field, serializer) = self.window_field(source, &output.function)?;
            let field = match &output.window {
                Some(window) => field.window(window.clone()),
                None => field,
            };
            spec = spec.output(output.name.clone(), field);
            members.push(ProjectedMember::new(output.name.clone(), output.name.clone(), serializer));
        }

        self.nest_document();
        self.push(AstStage::SetWindowFields(spec));
        self.shape = Shape::document(Arc::new(ProjectionSerializer::new(members)));
        Ok(())
    }

    fn window_field(&self, source: &QuerySource, function: &WindowFunction) -> TranslationResult<(WindowField, SerializerRef)> {
        let int64 = || Ok::<_, TranslationError>(self.registry.lookup(&TypeRef::Int64)?);
        let operator = match function {
            WindowFunction::DocumentNumber => return Ok((WindowField::new(WindowOperator::DocumentNumber), int64()?)),
            WindowFunction::Rank => return Ok((WindowField::new(WindowOperator::Rank), int64()?)),
            WindowFunction::DenseRank => return Ok((WindowField::new(WindowOperator::DenseRank), int64()?)),
            WindowFunction::Sum(_) => WindowOperator::Sum,
            WindowFunction::Average(_) => WindowOperator::Avg,
            WindowFunction::Min(_) => WindowOperator::Min,
            WindowFunction::Max(_) => WindowOperator::Max,
            WindowFunction::First(_) => WindowOperator::First,
            WindowFunction::Last(_) => WindowOperator::Last,
            WindowFunction::Shift { .. } => WindowOperator::Shift { by: 0, default: None },
        };
        let Some(selector) = function.selector() else {
            return Err(TranslationError::invalid_operation("window function without a selector"));
        };
        let (ctx, body) = self.bind(selector, |name| self.nested_symbol(name))?;
        let argument = translate_expr(&ctx, body)?;
        let value_type = argument.value_type();
        let numeric = numeric_rank(&value_type);
        let mut serializer = argument.serializer.clone();
        match function {
            WindowFunction::Sum(_) | WindowFunction::Average(_) if numeric.is_none() => {
                return Err(TranslationError::not_supported(
                    source,
                    format!("{} needs numeric values, found {}", function.name(), value_type),
                ));
            }
            WindowFunction::Average(_) if numeric != Some(4) => {
                serializer = self.registry.lookup(&TypeRef::Double)?;
            }
            _ => {}
        }
        let operator = match (operator, function) {
            (WindowOperator::Shift { .. }, WindowFunction::Shift { by, default, .. }) => WindowOperator::Shift {
                by: *by,
                default: default
                    .as_ref()
                    .map(|value| serialize_like(&ctx, value, &argument.serializer))
                    .transpose()?,
            },
            (operator, _) => operator,
        };
        Ok((WindowField::new(operator).argument(argument.ast), serializer))
    }

    /// Append the stages of the final operator.
    fn terminate(&mut self, source: &QuerySource, terminal: Terminal) -> TranslationResult<FinalOperator> {
        Ok(match terminal {
            Terminal::ToList => FinalOperator::Sequence,
            Terminal::Count(predicate) => {
                if let Some(predicate) = predicate {
                    self.apply(source, &QueryOperation::Where(predicate))?;
                }
                self.push(AstStage::Count(SmolStr::new(WRAPPED_VALUE_ELEMENT)));
                self.shape = Shape::wrapped(self.registry.lookup(&TypeRef::Int64)?);
                FinalOperator::Count
            }
            Terminal::Any(predicate) => {
                if let Some(predicate) = predicate {
                    self.apply(source, &QueryOperation::Where(predicate))?;
                }
                self.push(AstStage::Limit(1));
                self.push(AstStage::Project(vec![
                    (SmolStr::new("_id"), ProjectField::Exclude),
                    (SmolStr::new(WRAPPED_VALUE_ELEMENT), ProjectField::Computed(AstExpr::constant(true))),
                ]));
                self.shape = Shape::wrapped(self.registry.lookup(&TypeRef::Bool)?);
                FinalOperator::Any
            }
            Terminal::First => {
                self.push(AstStage::Limit(1));
                FinalOperator::First
            }
            Terminal::FirstOrDefault => {
                self.push(AstStage::Limit(1));
                FinalOperator::FirstOrDefault
            }
            Terminal::Single => {
                self.push(AstStage::Limit(2));
                FinalOperator::Single
            }
            Terminal::Aggregate(kind, selector) => {
                let selected = self.translate_lambda(&selector)?;
                let value_type = selected.value_type();
                let numeric = numeric_rank(&value_type);
                let (op, serializer) = match kind {
                    AggregateKind::Sum | AggregateKind::Average if numeric.is_none() => {
                        return Err(TranslationError::not_supported(
                            &selector,
                            format!("{:?} needs numeric values, found {}", kind, value_type),
                        ));
                    }
                    AggregateKind::Sum => (AccumulatorOp::Sum, selected.serializer.clone()),
                    AggregateKind::Average if numeric == Some(4) => (AccumulatorOp::Avg, selected.serializer.clone()),
                    AggregateKind::Average => (AccumulatorOp::Avg, self.registry.lookup(&TypeRef::Double)?),
                    AggregateKind::Min => (AccumulatorOp::Min, selected.serializer.clone()),
                    AggregateKind::Max => (AccumulatorOp::Max, selected.serializer.clone()),
                };
                self.push(AstStage::Group {
                    id: AstExpr::constant(Bson::Null),
                    fields: vec![(SmolStr::new(WRAPPED_VALUE_ELEMENT), Accumulator::new(op, selected.ast))],
                });
                self.shape = Shape::wrapped(serializer);
                FinalOperator::Aggregate(kind)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::WindowBound;
    use crate::expression::Parameter;
    use crate::queryable::Queryable;
    use lodestar_bson::json::{JsonWriterSettings, to_json};
    use lodestar_bson::serialization::{ClassMapBuilder, ConventionPack, MemberMapBuilder, NativeValue};
    use lodestar_bson::doc;
    use pretty_assertions::assert_eq;

    fn registry() -> SerializerRegistry {
        let registry = SerializerRegistry::new();
        let conventions = ConventionPack::new();
        for builder in [
            ClassMapBuilder::new("Sale")
                .member(MemberMapBuilder::new("Region", TypeRef::String))
                .member(MemberMapBuilder::new("Amount", TypeRef::Int32))
                .member(MemberMapBuilder::new("Day", TypeRef::Int32))
                .member(MemberMapBuilder::new("CustomerId", TypeRef::Int32))
                .member(MemberMapBuilder::new("Tags", TypeRef::list(TypeRef::String))),
            ClassMapBuilder::new("Customer")
                .id(MemberMapBuilder::new("Id", TypeRef::Int32))
                .member(MemberMapBuilder::new("Name", TypeRef::String)),
            ClassMapBuilder::new("Animal").member(MemberMapBuilder::new("Name", TypeRef::String)),
            ClassMapBuilder::new("Cat")
                .base("Animal")
                .member(MemberMapBuilder::new("Lives", TypeRef::Int32)),
        ] {
            registry.register_class_map(builder.freeze(&conventions).unwrap()).unwrap();
        }
        registry
    }

    fn s() -> Parameter {
        Parameter::new("s", TypeRef::class("Sale"))
    }

    fn sales(registry: &SerializerRegistry) -> Queryable<'_> {
        Queryable::new(registry, "sales", TypeRef::class("Sale"))
    }

    fn on_sale(body: Expr) -> Expr {
        Expr::lambda([s()], body)
    }

    fn json(query: &ExecutableQuery) -> String {
        to_json(&query.pipeline.render_bson(), &JsonWriterSettings::relaxed())
    }

    #[test]
    fn test_where_order_skip_take() {
        let registry = registry();
        let query = sales(&registry)
            .where_(on_sale(s().expr().member("Amount").gte(Expr::constant(3)).and(s().expr().member("Amount").lte(Expr::constant(10)))))
            .order_by(on_sale(s().expr().member("Region")))
            .then_by_descending(on_sale(s().expr().member("Day")))
            .skip(5)
            .take(10)
            .to_list()
            .unwrap();
        assert_eq!(
            json(&query),
            concat!(
                r#"[{ "$match" : { "Amount" : { "$gte" : 3, "$lte" : 10 } } }, "#,
                r#"{ "$sort" : { "Region" : 1, "Day" : -1 } }, { "$skip" : 5 }, { "$limit" : 10 }]"#
            )
        );
    }

    #[test]
    fn test_then_by_without_order_by_fails() {
        let registry = registry();
        let err = sales(&registry)
            .then_by(on_sale(s().expr().member("Day")))
            .to_list()
            .unwrap_err();
        assert!(matches!(err, TranslationError::InvalidOperation(_)));
    }

    #[test]
    fn test_take_zero_and_negative() {
        let registry = registry();
        let none = sales(&registry).take(0).to_list().unwrap();
        assert_eq!(json(&none), r#"[{ "$match" : { "$expr" : false } }]"#);
        assert!(sales(&registry).take(-1).to_list().is_err());
        assert!(sales(&registry).skip(-1).to_list().is_err());
    }

    #[test]
    fn test_scalar_select_is_wrapped() {
        let registry = registry();
        let query = sales(&registry)
            .select(on_sale(s().expr().member("Amount")))
            .where_(Expr::lambda([Parameter::new("a", TypeRef::Int32)], Parameter::new("a", TypeRef::Int32).expr().gt(Expr::constant(1))))
            .to_list()
            .unwrap();
        assert_eq!(
            json(&query),
            r#"[{ "$project" : { "_v" : "$Amount", "_id" : 0 } }, { "$match" : { "_v" : { "$gt" : 1 } } }]"#
        );
        let output = query.materialize(&registry, &[doc! { "_v" => 4 }]).unwrap();
        assert_eq!(output, crate::queryable::QueryOutput::Sequence(vec![NativeValue::Int32(4)]));
    }

    #[test]
    fn test_anonymous_select() {
        let registry = registry();
        let query = sales(&registry)
            .select(on_sale(Expr::new_object([
                ("Area", s().expr().member("Region")),
                ("Double", s().expr().member("Amount").multiply(Expr::constant(2))),
            ])))
            .to_list()
            .unwrap();
        assert_eq!(
            json(&query),
            r#"[{ "$project" : { "Area" : "$Region", "Double" : { "$multiply" : ["$Amount", 2] }, "_id" : 0 } }]"#
        );
    }

    #[test]
    fn test_identity_select_is_skipped() {
        let registry = registry();
        let query = sales(&registry).select(on_sale(s().expr())).to_list().unwrap();
        assert!(query.pipeline.is_empty());
    }

    #[test]
    fn test_select_many_unwinds() {
        let registry = registry();
        let query = sales(&registry)
            .select_many(on_sale(s().expr().member("Tags")))
            .to_list()
            .unwrap();
        assert_eq!(
            json(&query),
            r#"[{ "$project" : { "_v" : "$Tags", "_id" : 0 } }, { "$unwind" : "$_v" }]"#
        );
        assert_eq!(query.output.value_type(), TypeRef::String);
    }

    #[test]
    fn test_group_by_with_aggregates() {
        let registry = registry();
        let g = Parameter::new("g", TypeRef::enumerable(TypeRef::class("Sale")));
        let query = sales(&registry)
            .group_by(on_sale(s().expr().member("Region")))
            .select(Expr::lambda(
                [g.clone()],
                Expr::new_object([
                    ("Region", g.expr().member("Key")),
                    ("Count", g.expr().call("Count", [])),
                    ("Total", g.expr().call("Sum", [on_sale(s().expr().member("Amount"))])),
                ]),
            ))
            .to_list()
            .unwrap();
        assert_eq!(
            json(&query),
            concat!(
                r#"[{ "$group" : { "_id" : "$Region", "_elements" : { "$push" : "$$ROOT" } } }, "#,
                r#"{ "$project" : { "Region" : "$_id", "Count" : { "$size" : "$_elements" }, "#,
                r#""Total" : { "$sum" : { "$map" : { "input" : "$_elements", "as" : "s", "in" : "$$s.Amount" } } }, "_id" : 0 } }]"#
            )
        );
    }

    #[test]
    fn test_distinct_scalar() {
        let registry = registry();
        let query = sales(&registry)
            .select(on_sale(s().expr().member("Region")))
            .distinct()
            .to_list()
            .unwrap();
        assert_eq!(
            json(&query),
            concat!(
                r#"[{ "$project" : { "_v" : "$Region", "_id" : 0 } }, { "$group" : { "_id" : "$_v" } }, "#,
                r#"{ "$project" : { "_v" : "$_id", "_id" : 0 } }]"#
            )
        );
    }

    #[test]
    fn test_of_type_matches_discriminator() {
        let registry = registry();
        let query = Queryable::new(&registry, "animals", TypeRef::class("Animal"))
            .of_type("Cat")
            .to_list()
            .unwrap();
        assert_eq!(json(&query), r#"[{ "$match" : { "_t" : "Cat" } }]"#);
        assert_eq!(query.output.value_type(), TypeRef::class("Cat"));
        let err = Queryable::new(&registry, "animals", TypeRef::class("Animal"))
            .of_type("Dog")
            .to_list()
            .unwrap_err();
        assert!(matches!(err, TranslationError::Mapping(_)));
    }

    #[test]
    fn test_union_with_requires_same_shape() {
        let registry = registry();
        let other = sales(&registry)
            .where_(on_sale(s().expr().member("Day").eq(Expr::constant(1))))
            .into_source();
        let query = sales(&registry).union_with(other).to_list().unwrap();
        assert_eq!(
            json(&query),
            r#"[{ "$unionWith" : { "coll" : "sales", "pipeline" : [{ "$match" : { "Day" : 1 } }] } }]"#
        );
        let customers = QuerySource::new("customers", TypeRef::class("Customer"));
        assert!(sales(&registry).union_with(customers).to_list().unwrap_err().is_not_supported());
    }

    #[test]
    fn test_lookup_nests_outer_document() {
        let registry = registry();
        let c = Parameter::new("c", TypeRef::class("Customer"));
        let query = sales(&registry)
            .lookup(
                "customers",
                TypeRef::class("Customer"),
                on_sale(s().expr().member("CustomerId")),
                Expr::lambda([c.clone()], c.expr().member("Id")),
            )
            .to_list()
            .unwrap();
        assert_eq!(
            json(&query),
            concat!(
                r#"[{ "$project" : { "_id" : 0, "_document" : "$$ROOT" } }, "#,
                r#"{ "$lookup" : { "from" : "customers", "localField" : "_document.CustomerId", "foreignField" : "_id", "as" : "_results" } }]"#
            )
        );
        let row = doc! {
            "_document" => doc! { "Region" => "n", "Amount" => 1, "Day" => 1, "CustomerId" => 7, "Tags" => lodestar_bson::array![] },
            "_results" => lodestar_bson::array![doc! { "_id" => 7, "Name" => "Ada" }],
        };
        let crate::queryable::QueryOutput::Sequence(rows) = query.materialize(&registry, &[row]).unwrap() else {
            panic!("expected a sequence");
        };
        let joined = rows[0].as_instance().unwrap();
        let inner = joined.get("Inner").and_then(|v| v.as_items()).unwrap();
        assert_eq!(inner[0].as_instance().unwrap().get("Name"), Some(&NativeValue::String("Ada".into())));
    }

    #[test]
    fn test_window_fields() {
        let registry = registry();
        let definition = WindowDefinition::new()
            .partition_by(on_sale(s().expr().member("Region")))
            .sort_by(on_sale(s().expr().member("Day")))
            .output("Rank", WindowFunction::Rank)
            .output_with_window(
                "Running",
                WindowFunction::Sum(on_sale(s().expr().member("Amount"))),
                WindowBounds::Documents(WindowBound::Unbounded, WindowBound::Current),
            )
            .output("Mean", WindowFunction::Average(on_sale(s().expr().member("Amount"))));
        let query = sales(&registry).set_window_fields(definition).to_list().unwrap();
        assert_eq!(
            json(&query),
            concat!(
                r#"[{ "$project" : { "_id" : 0, "_document" : "$$ROOT" } }, "#,
                r#"{ "$setWindowFields" : { "partitionBy" : "$_document.Region", "sortBy" : { "_document.Day" : 1 }, "output" : { "#,
                r#""Rank" : { "$rank" : { } }, "#,
                r#""Running" : { "$sum" : "$_document.Amount", "window" : { "documents" : ["unbounded", "current"] } }, "#,
                r#""Mean" : { "$avg" : "$_document.Amount" } } } }]"#
            )
        );
        let row = doc! {
            "_document" => doc! { "Region" => "n", "Amount" => 4, "Day" => 1, "CustomerId" => 7, "Tags" => lodestar_bson::array![] },
            "Rank" => 1,
            "Running" => 4,
            "Mean" => 4.0,
        };
        let crate::queryable::QueryOutput::Sequence(rows) = query.materialize(&registry, &[row]).unwrap() else {
            panic!("expected a sequence");
        };
        let window = rows[0].as_instance().unwrap();
        assert_eq!(window.get("Rank"), Some(&NativeValue::Int64(1)));
        assert_eq!(window.get("Mean"), Some(&NativeValue::Double(4.0)));
    }

    #[test]
    fn test_window_validation() {
        let registry = registry();
        let unsorted = WindowDefinition::new().output("Rank", WindowFunction::DenseRank);
        assert!(matches!(
            sales(&registry).set_window_fields(unsorted).to_list().unwrap_err(),
            TranslationError::InvalidOperation(_)
        ));
        let range = WindowDefinition::new()
            .sort_by(on_sale(s().expr().member("Day")))
            .sort_by_descending(on_sale(s().expr().member("Amount")))
            .output_with_window(
                "Near",
                WindowFunction::Sum(on_sale(s().expr().member("Amount"))),
                WindowBounds::Range(WindowBound::offset(-1), WindowBound::offset(1)),
            );
        assert!(sales(&registry).set_window_fields(range).to_list().is_err());
        let bad_name = WindowDefinition::new().output("a.b", WindowFunction::Sum(on_sale(s().expr().member("Amount"))));
        assert!(sales(&registry).set_window_fields(bad_name).to_list().is_err());
    }

    #[test]
    fn test_average_terminal_reads_double() {
        let registry = registry();
        let query = sales(&registry).average(on_sale(s().expr().member("Amount"))).unwrap();
        assert_eq!(query.output.value_type(), TypeRef::Double);
        assert!(sales(&registry).sum(on_sale(s().expr().member("Region"))).unwrap_err().is_not_supported());
    }

    #[test]
    fn test_simplify_can_be_disabled() {
        let registry = registry();
        let predicate = on_sale(s().expr().member("Day").eq(Expr::constant(1)));
        let raw = sales(&registry)
            .with_options(TranslationOptions { simplify: false })
            .where_(predicate.clone())
            .where_(predicate.clone())
            .to_list()
            .unwrap();
        assert_eq!(raw.pipeline.len(), 2);
        let simplified = sales(&registry).where_(predicate.clone()).where_(predicate).to_list().unwrap();
        assert_eq!(simplified.pipeline.len(), 1);
    }
}
