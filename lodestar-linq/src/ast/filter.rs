//! `$match` filter nodes.

use std::sync::Arc;

use lodestar_bson::{Bson, Document, Regex};
use smallvec::SmallVec;
use smol_str::SmolStr;

use super::expr::{AstExpr, AstUnaryOp, operator};
use crate::error::{TranslationError, TranslationResult};

/// A per-field query operator.
#[derive(Debug, Clone, PartialEq)]
pub enum AstFieldOp {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Exists(bool),
    Size(i64),
    Regex(Regex),
    ElemMatch(Arc<AstFilter>),
    Not(Box<AstFieldOp>),
}

impl AstFieldOp {
    pub fn operator(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::In(_) => "$in",
            Self::Nin(_) => "$nin",
            Self::Exists(_) => "$exists",
            Self::Size(_) => "$size",
            Self::Regex(_) => "$regex",
            Self::ElemMatch(_) => "$elemMatch",
            Self::Not(_) => "$not",
        }
    }

    /// The operator that matches exactly when this one does not, if a
    /// direct one exists.
    pub fn negated(&self) -> Option<Self> {
        Some(match self {
            Self::Eq(v) => Self::Ne(v.clone()),
            Self::Ne(v) => Self::Eq(v.clone()),
            Self::In(v) => Self::Nin(v.clone()),
            Self::Nin(v) => Self::In(v.clone()),
            Self::Exists(b) => Self::Exists(!b),
            Self::Not(inner) => (**inner).clone(),
            _ => return None,
        })
    }

    fn argument(&self) -> Bson {
        match self {
            Self::Eq(v) | Self::Ne(v) | Self::Gt(v) | Self::Gte(v) | Self::Lt(v) | Self::Lte(v) => v.clone(),
            Self::In(values) | Self::Nin(values) => Bson::Array(values.clone()),
            Self::Exists(b) => Bson::Boolean(*b),
            Self::Size(n) => Bson::Int64(*n),
            Self::Regex(regex) => Bson::RegularExpression(regex.clone()),
            Self::ElemMatch(filter) => filter.render_elem_match(),
            Self::Not(inner) => match &**inner {
                Self::Regex(regex) => Bson::RegularExpression(regex.clone()),
                other => {
                    let mut document = Document::new();
                    document.insert(other.operator(), other.argument());
                    Bson::Document(document)
                }
            },
        }
    }
}

/// A `$match` filter.
#[derive(Debug, Clone, PartialEq)]
pub enum AstFilter {
    /// Operators applied to one field; an empty path means the value being
    /// matched itself, as inside `$elemMatch` over scalars.
    Field {
        path: SmolStr,
        ops: SmallVec<[AstFieldOp; 2]>,
    },
    And(Vec<Arc<AstFilter>>),
    Or(Vec<Arc<AstFilter>>),
    Nor(Vec<Arc<AstFilter>>),
    Expr(Arc<AstExpr>),
}

impl AstFilter {
    pub fn field(path: impl Into<SmolStr>, op: AstFieldOp) -> Arc<Self> {
        let mut ops = SmallVec::new();
        ops.push(op);
        Arc::new(Self::Field { path: path.into(), ops })
    }

    pub fn expr(expr: Arc<AstExpr>) -> Arc<Self> {
        Arc::new(Self::Expr(expr))
    }

    /// Always true.
    pub fn matches_all() -> Arc<Self> {
        Arc::new(Self::And(Vec::new()))
    }

    /// Conjunction; nested conjunctions are flattened and operators on the
    /// same field are merged when they do not collide.
    pub fn and(filters: impl IntoIterator<Item = Arc<AstFilter>>) -> Arc<Self> {
        let mut flat: Vec<Arc<AstFilter>> = Vec::new();
        for filter in filters {
            match &*filter {
                Self::And(children) => flat.extend(children.iter().cloned()),
                _ => flat.push(filter),
            }
        }
        let merged = merge_fields(flat);
        if let [single] = merged.as_slice() {
            return single.clone();
        }
        Arc::new(Self::And(merged))
    }

    pub fn or(filters: impl IntoIterator<Item = Arc<AstFilter>>) -> Arc<Self> {
        let mut flat = Vec::new();
        for filter in filters {
            match &*filter {
                Self::Or(children) => flat.extend(children.iter().cloned()),
                _ => flat.push(filter),
            }
        }
        match flat.len() {
            1 => flat.pop().unwrap_or_else(Self::matches_all),
            _ => Arc::new(Self::Or(flat)),
        }
    }

    /// Negation, pushed into field operators where one exists.
    pub fn not(filter: Arc<AstFilter>) -> Arc<Self> {
        match &*filter {
            Self::Field { path, ops } if ops.len() == 1 => {
                let op = &ops[0];
                let negated = op.negated().unwrap_or_else(|| AstFieldOp::Not(Box::new(op.clone())));
                Self::field(path.clone(), negated)
            }
            Self::Nor(children) if children.len() == 1 => children[0].clone(),
            Self::Expr(expr) => Self::expr(AstExpr::unary(AstUnaryOp::Not, expr.clone())),
            _ => Arc::new(Self::Nor(vec![filter.clone()])),
        }
    }

    pub fn is_matches_all(&self) -> bool {
        matches!(self, Self::And(children) if children.is_empty())
    }

    pub fn children(&self) -> Vec<Arc<AstFilter>> {
        match self {
            Self::And(children) | Self::Or(children) | Self::Nor(children) => children.clone(),
            Self::Field { ops, .. } => ops
                .iter()
                .filter_map(|op| match op {
                    AstFieldOp::ElemMatch(inner) => Some(inner.clone()),
                    _ => None,
                })
                .collect(),
            Self::Expr(_) => Vec::new(),
        }
    }

    /// Rebuild around new child filters, keeping `self` when nothing changed.
    /// Only logical nodes accept a different number of children.
    pub fn with_children(self: &Arc<Self>, children: Vec<Arc<AstFilter>>) -> TranslationResult<Arc<Self>> {
        let expected = self.children().len();
        let variadic = matches!(**self, Self::And(_) | Self::Or(_) | Self::Nor(_));
        if !variadic && children.len() != expected {
            return Err(TranslationError::invalid_operation(format!(
                "{} filter takes {} children, got {}",
                self.name(),
                expected,
                children.len()
            )));
        }
        Ok(self.rebuild(children))
    }

    /// [`AstFilter::with_children`] for children derived from
    /// [`AstFilter::children`] of this same node.
    pub(super) fn rebuild(self: &Arc<Self>, children: Vec<Arc<AstFilter>>) -> Arc<Self> {
        let current = self.children();
        if current.len() == children.len() && current.iter().zip(&children).all(|(a, b)| Arc::ptr_eq(a, b)) {
            return self.clone();
        }
        let rebuilt = match &**self {
            Self::And(_) => Self::And(children),
            Self::Or(_) => Self::Or(children),
            Self::Nor(_) => Self::Nor(children),
            Self::Field { path, ops } => {
                let mut replacements = children.into_iter();
                let ops = ops
                    .iter()
                    .map(|op| match op {
                        AstFieldOp::ElemMatch(current) => {
                            AstFieldOp::ElemMatch(replacements.next().unwrap_or_else(|| current.clone()))
                        }
                        other => other.clone(),
                    })
                    .collect();
                Self::Field { path: path.clone(), ops }
            }
            Self::Expr(_) => return self.clone(),
        };
        Arc::new(rebuilt)
    }

    /// Replace the expression of an `$expr` filter.
    pub fn update_expr(self: &Arc<Self>, expr: Arc<AstExpr>) -> TranslationResult<Arc<Self>> {
        match &**self {
            Self::Expr(current) if Arc::ptr_eq(current, &expr) => Ok(self.clone()),
            Self::Expr(_) => Ok(Self::expr(expr)),
            other => Err(TranslationError::invalid_operation(format!(
                "update_expr called on a {} filter",
                other.name()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Field { .. } => "field",
            Self::And(_) => "$and",
            Self::Or(_) => "$or",
            Self::Nor(_) => "$nor",
            Self::Expr(_) => "$expr",
        }
    }

    pub fn render(&self) -> Document {
        match self.render_value() {
            Bson::Document(document) => document,
            other => {
                let mut document = Document::new();
                document.insert("$eq", other);
                document
            }
        }
    }

    /// `$elemMatch` over scalars takes an operator document, never a bare
    /// value.
    fn render_elem_match(&self) -> Bson {
        match self {
            Self::Field { path, ops } if path.is_empty() => Bson::Document(operator_document(ops)),
            other => other.render_value(),
        }
    }

    fn render_value(&self) -> Bson {
        match self {
            Self::Field { path, ops } => {
                let value = render_ops(ops);
                if path.is_empty() {
                    return value;
                }
                let mut document = Document::new();
                document.insert(path.as_str(), value);
                Bson::Document(document)
            }
            Self::And(children) => {
                if let Some(flat) = render_flat(children) {
                    return Bson::Document(flat);
                }
                operator("$and", Bson::Array(children.iter().map(|c| c.render_value()).collect()))
            }
            Self::Or(children) => operator("$or", Bson::Array(children.iter().map(|c| c.render_value()).collect())),
            Self::Nor(children) => operator("$nor", Bson::Array(children.iter().map(|c| c.render_value()).collect())),
            Self::Expr(expr) => operator("$expr", expr.render()),
        }
    }
}

fn render_ops(ops: &[AstFieldOp]) -> Bson {
    if let [AstFieldOp::Eq(value)] = ops {
        if !matches!(value, Bson::Document(_) | Bson::RegularExpression(_)) {
            return value.clone();
        }
    }
    Bson::Document(operator_document(ops))
}

fn operator_document(ops: &[AstFieldOp]) -> Document {
    let mut document = Document::new();
    for op in ops {
        document.insert(op.operator(), op.argument());
    }
    document
}

/// `{ a : …, b : … }` when every conjunct renders to distinct top-level keys.
fn render_flat(children: &[Arc<AstFilter>]) -> Option<Document> {
    let mut flat = Document::new();
    for child in children {
        let rendered = match child.render_value() {
            Bson::Document(document) => document,
            _ => return None,
        };
        for (name, value) in rendered {
            if (name.starts_with('$') && name != "$expr") || flat.contains_key(&name) {
                return None;
            }
            flat.insert(name, value);
        }
    }
    Some(flat)
}

fn merge_fields(filters: Vec<Arc<AstFilter>>) -> Vec<Arc<AstFilter>> {
    let mut merged: Vec<Arc<AstFilter>> = Vec::with_capacity(filters.len());
    for filter in filters {
        if let AstFilter::Field { path, ops } = &*filter {
            let target = merged.iter_mut().find(|existing| match &***existing {
                AstFilter::Field { path: other, ops: existing_ops } => {
                    other == path
                        && ops.iter().all(|op| {
                            !matches!(op, AstFieldOp::Eq(_))
                                && existing_ops
                                    .iter()
                                    .all(|e| !matches!(e, AstFieldOp::Eq(_)) && e.operator() != op.operator())
                        })
                }
                _ => false,
            });
            if let Some(existing) = target {
                if let AstFilter::Field { path, ops: existing_ops } = &**existing {
                    let mut combined = existing_ops.clone();
                    combined.extend(ops.iter().cloned());
                    *existing = Arc::new(AstFilter::Field {
                        path: path.clone(),
                        ops: combined,
                    });
                }
                continue;
            }
        }
        merged.push(filter);
    }
    merged
}
