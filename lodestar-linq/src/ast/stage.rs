//! Pipeline stages and the pipeline itself.

use std::sync::Arc;

use lodestar_bson::{Bson, Document};
use smol_str::SmolStr;

use super::expr::{AstExpr, fields};
use super::filter::AstFilter;
use super::window::SetWindowFields;
use crate::error::{TranslationError, TranslationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortField {
    pub path: SmolStr,
    pub direction: SortDirection,
}

impl SortField {
    pub fn ascending(path: impl Into<SmolStr>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(path: impl Into<SmolStr>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Descending,
        }
    }
}

pub(crate) fn render_sort(sort: &[SortField]) -> Document {
    let mut document = Document::new();
    for field in sort {
        let direction = match field.direction {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        };
        document.insert(field.path.as_str(), Bson::Int32(direction));
    }
    document
}

/// How a field appears in `$project`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Arc<AstExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
}

impl AccumulatorOp {
    pub fn operator(self) -> &'static str {
        match self {
            Self::Sum => "$sum",
            Self::Avg => "$avg",
            Self::Min => "$min",
            Self::Max => "$max",
            Self::First => "$first",
            Self::Last => "$last",
            Self::Push => "$push",
            Self::AddToSet => "$addToSet",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub op: AccumulatorOp,
    pub argument: Arc<AstExpr>,
}

impl Accumulator {
    pub fn new(op: AccumulatorOp, argument: Arc<AstExpr>) -> Self {
        Self { op, argument }
    }
}

/// A pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum AstStage {
    Match(Arc<AstFilter>),
    Project(Vec<(SmolStr, ProjectField)>),
    Group {
        id: Arc<AstExpr>,
        fields: Vec<(SmolStr, Accumulator)>,
    },
    Sort(Vec<SortField>),
    Skip(i64),
    Limit(i64),
    Unwind {
        path: SmolStr,
        preserve_null_and_empty_arrays: bool,
    },
    ReplaceRoot(Arc<AstExpr>),
    Count(SmolStr),
    UnionWith {
        collection: SmolStr,
        pipeline: Arc<AstPipeline>,
    },
    Lookup {
        from: SmolStr,
        local_field: SmolStr,
        foreign_field: SmolStr,
        as_field: SmolStr,
    },
    SetWindowFields(SetWindowFields),
}

impl AstStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Match(_) => "$match",
            Self::Project(_) => "$project",
            Self::Group { .. } => "$group",
            Self::Sort(_) => "$sort",
            Self::Skip(_) => "$skip",
            Self::Limit(_) => "$limit",
            Self::Unwind { .. } => "$unwind",
            Self::ReplaceRoot(_) => "$replaceRoot",
            Self::Count(_) => "$count",
            Self::UnionWith { .. } => "$unionWith",
            Self::Lookup { .. } => "$lookup",
            Self::SetWindowFields(_) => "$setWindowFields",
        }
    }

    /// Expressions directly owned by the stage, in a fixed order.
    pub fn expressions(&self) -> Vec<Arc<AstExpr>> {
        match self {
            Self::Project(fields) => fields
                .iter()
                .filter_map(|(_, f)| match f {
                    ProjectField::Computed(expr) => Some(expr.clone()),
                    _ => None,
                })
                .collect(),
            Self::Group { id, fields } => std::iter::once(id.clone())
                .chain(fields.iter().map(|(_, a)| a.argument.clone()))
                .collect(),
            Self::ReplaceRoot(expr) => vec![expr.clone()],
            Self::SetWindowFields(spec) => spec.expressions(),
            _ => Vec::new(),
        }
    }

    /// Rebuild with new expressions, keeping `self` when all are unchanged.
    pub fn with_expressions(self: &Arc<Self>, expressions: Vec<Arc<AstExpr>>) -> TranslationResult<Arc<Self>> {
        let expected = self.expressions().len();
        if expressions.len() != expected {
            return Err(TranslationError::invalid_operation(format!(
                "{} stage takes {} expressions, got {}",
                self.name(),
                expected,
                expressions.len()
            )));
        }
        Ok(self.rebuild_expressions(expressions))
    }

    /// [`AstStage::with_expressions`] for expressions derived from
    /// [`AstStage::expressions`] of this same stage.
    pub(super) fn rebuild_expressions(self: &Arc<Self>, expressions: Vec<Arc<AstExpr>>) -> Arc<Self> {
        let current = self.expressions();
        if current.len() == expressions.len() && current.iter().zip(&expressions).all(|(a, b)| Arc::ptr_eq(a, b)) {
            return self.clone();
        }
        let mut replacements = expressions.into_iter();
        let rebuilt = match &**self {
            Self::Project(fields) => Self::Project(
                fields
                    .iter()
                    .map(|(name, field)| {
                        let field = match field {
                            ProjectField::Computed(current) => {
                                ProjectField::Computed(replacements.next().unwrap_or_else(|| current.clone()))
                            }
                            other => other.clone(),
                        };
                        (name.clone(), field)
                    })
                    .collect(),
            ),
            Self::Group { id, fields } => {
                let id = replacements.next().unwrap_or_else(|| id.clone());
                Self::Group {
                    id,
                    fields: fields
                        .iter()
                        .map(|(name, acc)| {
                            let argument = replacements.next().unwrap_or_else(|| acc.argument.clone());
                            (name.clone(), Accumulator::new(acc.op, argument))
                        })
                        .collect(),
                }
            }
            Self::ReplaceRoot(current) => Self::ReplaceRoot(replacements.next().unwrap_or_else(|| current.clone())),
            Self::SetWindowFields(spec) => Self::SetWindowFields(spec.with_expressions(replacements.collect())),
            _ => return self.clone(),
        };
        Arc::new(rebuilt)
    }

    /// Replace the filter of a `$match` stage.
    pub fn update_match(self: &Arc<Self>, filter: Arc<AstFilter>) -> TranslationResult<Arc<Self>> {
        match &**self {
            Self::Match(current) if Arc::ptr_eq(current, &filter) => Ok(self.clone()),
            Self::Match(_) => Ok(Arc::new(Self::Match(filter))),
            other => Err(TranslationError::invalid_operation(format!(
                "update_match called on a {} stage",
                other.name()
            ))),
        }
    }

    pub fn render(&self) -> Document {
        let body = match self {
            Self::Match(filter) => Bson::Document(filter.render()),
            Self::Project(fields) => {
                let mut spec = Document::new();
                for (name, field) in fields {
                    let value = match field {
                        ProjectField::Include => Bson::Int32(1),
                        ProjectField::Exclude => Bson::Int32(0),
                        ProjectField::Computed(expr) => match &**expr {
                            // Bare numbers and booleans would read as inclusion flags.
                            AstExpr::Constant(value @ (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Boolean(_))) => {
                                Bson::Document(fields_literal(value.clone()))
                            }
                            other => other.render(),
                        },
                    };
                    spec.insert(name.as_str(), value);
                }
                Bson::Document(spec)
            }
            Self::Group { id, fields } => {
                let mut spec = Document::new();
                spec.insert("_id", id.render());
                for (name, acc) in fields {
                    spec.insert(name.as_str(), fields_of(acc.op.operator(), acc.argument.render()));
                }
                Bson::Document(spec)
            }
            Self::Sort(sort) => Bson::Document(render_sort(sort)),
            Self::Skip(n) | Self::Limit(n) => integer(*n),
            Self::Unwind {
                path,
                preserve_null_and_empty_arrays,
            } => {
                let path = Bson::String(format!("${}", path));
                if *preserve_null_and_empty_arrays {
                    Bson::Document(fields([("path", path), ("preserveNullAndEmptyArrays", Bson::Boolean(true))]))
                } else {
                    path
                }
            }
            Self::ReplaceRoot(expr) => Bson::Document(fields([("newRoot", expr.render())])),
            Self::Count(name) => Bson::String(name.to_string()),
            Self::UnionWith { collection, pipeline } => Bson::Document(fields([
                ("coll", Bson::String(collection.to_string())),
                ("pipeline", pipeline.render_bson()),
            ])),
            Self::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => Bson::Document(fields([
                ("from", Bson::String(from.to_string())),
                ("localField", Bson::String(local_field.to_string())),
                ("foreignField", Bson::String(foreign_field.to_string())),
                ("as", Bson::String(as_field.to_string())),
            ])),
            Self::SetWindowFields(spec) => Bson::Document(spec.render()),
        };
        fields([(self.name(), body)])
    }
}

fn fields_literal(value: Bson) -> Document {
    fields([("$literal", value)])
}

fn fields_of(name: &str, value: Bson) -> Bson {
    Bson::Document(fields([(name, value)]))
}

/// Counts render as Int32 when they fit so documents compare naturally.
pub(crate) fn integer(n: i64) -> Bson {
    match i32::try_from(n) {
        Ok(small) => Bson::Int32(small),
        Err(_) => Bson::Int64(n),
    }
}

/// An aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AstPipeline {
    stages: Vec<Arc<AstStage>>,
}

impl AstPipeline {
    pub fn new(stages: Vec<Arc<AstStage>>) -> Self {
        Self { stages }
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stages(&self) -> &[Arc<AstStage>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// A new pipeline with `stage` appended.
    pub fn push(self: &Arc<Self>, stage: AstStage) -> Arc<Self> {
        let mut stages = self.stages.clone();
        stages.push(Arc::new(stage));
        Arc::new(Self { stages })
    }

    /// A new pipeline with the last stage replaced.
    pub fn replace_last(self: &Arc<Self>, stage: AstStage) -> Arc<Self> {
        let mut stages = self.stages.clone();
        stages.pop();
        stages.push(Arc::new(stage));
        Arc::new(Self { stages })
    }

    pub fn with_stages(self: &Arc<Self>, stages: Vec<Arc<AstStage>>) -> Arc<Self> {
        if stages.len() == self.stages.len() && stages.iter().zip(&self.stages).all(|(a, b)| Arc::ptr_eq(a, b)) {
            return self.clone();
        }
        Arc::new(Self { stages })
    }

    pub fn render(&self) -> Vec<Document> {
        self.stages.iter().map(|s| s.render()).collect()
    }

    pub fn render_bson(&self) -> Bson {
        Bson::Array(self.render().into_iter().map(Bson::Document).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstBinaryOp, AstFieldOp};
    use lodestar_bson::doc;
    use lodestar_bson::json::{JsonWriterSettings, to_json};
    use pretty_assertions::assert_eq;

    fn json(pipeline: &AstPipeline) -> String {
        to_json(&pipeline.render_bson(), &JsonWriterSettings::relaxed())
    }

    #[test]
    fn test_render_common_stages() {
        let pipeline = AstPipeline::empty()
            .push(AstStage::Match(AstFilter::field("age", AstFieldOp::Gte(Bson::Int32(18)))))
            .push(AstStage::Sort(vec![SortField::descending("age")]))
            .push(AstStage::Skip(5))
            .push(AstStage::Limit(10));
        assert_eq!(
            json(&pipeline),
            r#"[{ "$match" : { "age" : { "$gte" : 18 } } }, { "$sort" : { "age" : -1 } }, { "$skip" : 5 }, { "$limit" : 10 }]"#
        );
    }

    #[test]
    fn test_project_wraps_literal_numbers() {
        let stage = AstStage::Project(vec![
            ("_v".into(), ProjectField::Computed(AstExpr::constant(1))),
            ("_id".into(), ProjectField::Exclude),
        ]);
        assert_eq!(stage.render(), doc! { "$project" => doc! { "_v" => doc! { "$literal" => 1 }, "_id" => 0 } });
    }

    #[test]
    fn test_group_render() {
        let stage = AstStage::Group {
            id: AstExpr::field("dept"),
            fields: vec![("total".into(), Accumulator::new(AccumulatorOp::Sum, AstExpr::field("salary")))],
        };
        assert_eq!(
            stage.render(),
            doc! { "$group" => doc! { "_id" => "$dept", "total" => doc! { "$sum" => "$salary" } } }
        );
    }

    #[test]
    fn test_with_expressions_identity() {
        let id = AstExpr::field("dept");
        let stage = Arc::new(AstStage::Group { id: id.clone(), fields: Vec::new() });
        assert!(Arc::ptr_eq(&stage, &stage.with_expressions(vec![id.clone()]).unwrap()));
        let changed = stage
            .with_expressions(vec![AstExpr::binary(AstBinaryOp::Cmp, AstExpr::field("a"), AstExpr::field("b"))])
            .unwrap();
        assert!(!Arc::ptr_eq(&stage, &changed));
        let err = stage.with_expressions(vec![id.clone(), id]).unwrap_err();
        assert!(err.to_string().contains("$group stage takes 1 expressions, got 2"), "{err}");
    }

    #[test]
    fn test_update_match_checks_stage() {
        let filter = AstFilter::field("a", AstFieldOp::Eq(Bson::Int32(1)));
        let stage = Arc::new(AstStage::Match(filter.clone()));
        assert!(Arc::ptr_eq(&stage, &stage.update_match(filter.clone()).unwrap()));
        let err = Arc::new(AstStage::Skip(1)).update_match(filter).unwrap_err();
        assert!(err.is_invalid_operation(), "{err}");
        assert!(err.to_string().contains("update_match called on a $skip stage"), "{err}");
    }

    #[test]
    fn test_unwind_and_union() {
        let inner = AstPipeline::empty().push(AstStage::Limit(1));
        let pipeline = AstPipeline::empty()
            .push(AstStage::Unwind {
                path: "tags".into(),
                preserve_null_and_empty_arrays: false,
            })
            .push(AstStage::UnionWith {
                collection: "archive".into(),
                pipeline: inner,
            });
        assert_eq!(
            json(&pipeline),
            r#"[{ "$unwind" : "$tags" }, { "$unionWith" : { "coll" : "archive", "pipeline" : [{ "$limit" : 1 }] } }]"#
        );
    }

    #[test]
    fn test_with_stages_identity() {
        let pipeline = AstPipeline::empty().push(AstStage::Limit(1));
        let same = pipeline.with_stages(pipeline.stages().to_vec());
        assert!(Arc::ptr_eq(&pipeline, &same));
    }
}
