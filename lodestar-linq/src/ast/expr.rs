//! Aggregation expression nodes.
//!
//! Nodes are immutable and shared through `Arc`. Rewrites go through
//! [`AstExpr::with_children`], which hands back the same `Arc` when every
//! child is pointer-equal to the current one, so a pass that changes nothing
//! allocates nothing.

use std::sync::Arc;

use lodestar_bson::{Bson, Document};
use smol_str::SmolStr;

use crate::error::{TranslationError, TranslationResult};

/// Name of the variable bound to the document being processed.
pub const CURRENT: &str = "CURRENT";
/// Name of the variable bound to the top-level document.
pub const ROOT: &str = "ROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AstUnaryOp {
    Not,
    Size,
    Abs,
    Ceil,
    Floor,
    Sqrt,
    Ln,
    Log10,
    Exp,
    Trunc,
    ToLower,
    ToUpper,
    Trim,
    StrLenCP,
    First,
    Last,
    AnyElementTrue,
    AllElementsTrue,
    Sum,
    Avg,
    Min,
    Max,
    IsArray,
}

impl AstUnaryOp {
    pub fn operator(self) -> &'static str {
        match self {
            Self::Not => "$not",
            Self::Size => "$size",
            Self::Abs => "$abs",
            Self::Ceil => "$ceil",
            Self::Floor => "$floor",
            Self::Sqrt => "$sqrt",
            Self::Ln => "$ln",
            Self::Log10 => "$log10",
            Self::Exp => "$exp",
            Self::Trunc => "$trunc",
            Self::ToLower => "$toLower",
            Self::ToUpper => "$toUpper",
            Self::Trim => "$trim",
            Self::StrLenCP => "$strLenCP",
            Self::First => "$first",
            Self::Last => "$last",
            Self::AnyElementTrue => "$anyElementTrue",
            Self::AllElementsTrue => "$allElementsTrue",
            Self::Sum => "$sum",
            Self::Avg => "$avg",
            Self::Min => "$min",
            Self::Max => "$max",
            Self::IsArray => "$isArray",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AstBinaryOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    Subtract,
    Divide,
    Mod,
    Pow,
    Log,
    Round,
    ArrayElemAt,
    In,
    IfNull,
    IndexOfCP,
}

impl AstBinaryOp {
    pub fn operator(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Cmp => "$cmp",
            Self::Subtract => "$subtract",
            Self::Divide => "$divide",
            Self::Mod => "$mod",
            Self::Pow => "$pow",
            Self::Log => "$log",
            Self::Round => "$round",
            Self::ArrayElemAt => "$arrayElemAt",
            Self::In => "$in",
            Self::IfNull => "$ifNull",
            Self::IndexOfCP => "$indexOfCP",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AstNaryOp {
    And,
    Or,
    Add,
    Multiply,
    Concat,
    ConcatArrays,
    SubstrCP,
    Min,
    Max,
}

impl AstNaryOp {
    pub fn operator(self) -> &'static str {
        match self {
            Self::And => "$and",
            Self::Or => "$or",
            Self::Add => "$add",
            Self::Multiply => "$multiply",
            Self::Concat => "$concat",
            Self::ConcatArrays => "$concatArrays",
            Self::SubstrCP => "$substrCP",
            Self::Min => "$min",
            Self::Max => "$max",
        }
    }

    /// Whether nested uses of the operator can be flattened into one.
    pub fn is_associative(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Add | Self::Multiply | Self::Concat | Self::ConcatArrays)
    }
}

/// An aggregation expression.
#[derive(Debug, Clone, PartialEq)]
pub enum AstExpr {
    Constant(Bson),
    /// `$$name`.
    Var(SmolStr),
    GetField {
        input: Arc<AstExpr>,
        field: SmolStr,
    },
    Unary {
        op: AstUnaryOp,
        arg: Arc<AstExpr>,
    },
    Binary {
        op: AstBinaryOp,
        left: Arc<AstExpr>,
        right: Arc<AstExpr>,
    },
    Nary {
        op: AstNaryOp,
        args: Vec<Arc<AstExpr>>,
    },
    Cond {
        test: Arc<AstExpr>,
        then: Arc<AstExpr>,
        otherwise: Arc<AstExpr>,
    },
    Filter {
        input: Arc<AstExpr>,
        var: SmolStr,
        cond: Arc<AstExpr>,
    },
    Map {
        input: Arc<AstExpr>,
        var: SmolStr,
        body: Arc<AstExpr>,
    },
    /// `$reduce`; the body sees `$$this` and `$$value`.
    Reduce {
        input: Arc<AstExpr>,
        initial: Arc<AstExpr>,
        body: Arc<AstExpr>,
    },
    Let {
        vars: Vec<(SmolStr, Arc<AstExpr>)>,
        body: Arc<AstExpr>,
    },
    Document(Vec<(SmolStr, Arc<AstExpr>)>),
    Array(Vec<Arc<AstExpr>>),
    Convert {
        input: Arc<AstExpr>,
        to: SmolStr,
    },
    RegexMatch {
        input: Arc<AstExpr>,
        pattern: SmolStr,
        options: SmolStr,
    },
}

impl AstExpr {
    pub fn constant(value: impl Into<Bson>) -> Arc<Self> {
        Arc::new(Self::Constant(value.into()))
    }

    pub fn var(name: impl Into<SmolStr>) -> Arc<Self> {
        Arc::new(Self::Var(name.into()))
    }

    pub fn current() -> Arc<Self> {
        Self::var(CURRENT)
    }

    pub fn root() -> Arc<Self> {
        Self::var(ROOT)
    }

    /// A dotted path on the current document, `$a.b`.
    pub fn field(path: &str) -> Arc<Self> {
        path.split('.').fold(Self::current(), |input, segment| Self::get_field(input, segment))
    }

    pub fn get_field(input: Arc<AstExpr>, field: impl Into<SmolStr>) -> Arc<Self> {
        Arc::new(Self::GetField {
            input,
            field: field.into(),
        })
    }

    pub fn unary(op: AstUnaryOp, arg: Arc<AstExpr>) -> Arc<Self> {
        Arc::new(Self::Unary { op, arg })
    }

    pub fn binary(op: AstBinaryOp, left: Arc<AstExpr>, right: Arc<AstExpr>) -> Arc<Self> {
        Arc::new(Self::Binary { op, left, right })
    }

    pub fn nary(op: AstNaryOp, args: impl IntoIterator<Item = Arc<AstExpr>>) -> Arc<Self> {
        Arc::new(Self::Nary {
            op,
            args: args.into_iter().collect(),
        })
    }

    pub fn and(args: impl IntoIterator<Item = Arc<AstExpr>>) -> Arc<Self> {
        Self::nary(AstNaryOp::And, args)
    }

    pub fn or(args: impl IntoIterator<Item = Arc<AstExpr>>) -> Arc<Self> {
        Self::nary(AstNaryOp::Or, args)
    }

    pub fn cond(test: Arc<AstExpr>, then: Arc<AstExpr>, otherwise: Arc<AstExpr>) -> Arc<Self> {
        Arc::new(Self::Cond { test, then, otherwise })
    }

    pub fn filter(input: Arc<AstExpr>, var: impl Into<SmolStr>, cond: Arc<AstExpr>) -> Arc<Self> {
        Arc::new(Self::Filter {
            input,
            var: var.into(),
            cond,
        })
    }

    pub fn map(input: Arc<AstExpr>, var: impl Into<SmolStr>, body: Arc<AstExpr>) -> Arc<Self> {
        Arc::new(Self::Map {
            input,
            var: var.into(),
            body,
        })
    }

    pub fn reduce(input: Arc<AstExpr>, initial: Arc<AstExpr>, body: Arc<AstExpr>) -> Arc<Self> {
        Arc::new(Self::Reduce { input, initial, body })
    }

    pub fn let_<N: Into<SmolStr>>(vars: impl IntoIterator<Item = (N, Arc<AstExpr>)>, body: Arc<AstExpr>) -> Arc<Self> {
        Arc::new(Self::Let {
            vars: vars.into_iter().map(|(n, v)| (n.into(), v)).collect(),
            body,
        })
    }

    pub fn document<N: Into<SmolStr>>(fields: impl IntoIterator<Item = (N, Arc<AstExpr>)>) -> Arc<Self> {
        Arc::new(Self::Document(fields.into_iter().map(|(n, v)| (n.into(), v)).collect()))
    }

    pub fn array(items: impl IntoIterator<Item = Arc<AstExpr>>) -> Arc<Self> {
        Arc::new(Self::Array(items.into_iter().collect()))
    }

    pub fn convert(input: Arc<AstExpr>, to: impl Into<SmolStr>) -> Arc<Self> {
        Arc::new(Self::Convert { input, to: to.into() })
    }

    pub fn regex_match(input: Arc<AstExpr>, pattern: impl Into<SmolStr>, options: impl Into<SmolStr>) -> Arc<Self> {
        Arc::new(Self::RegexMatch {
            input,
            pattern: pattern.into(),
            options: options.into(),
        })
    }

    pub fn as_constant(&self) -> Option<&Bson> {
        match self {
            Self::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_var(&self, name: &str) -> bool {
        matches!(self, Self::Var(v) if v == name)
    }

    /// Whether the node always evaluates to a boolean.
    pub fn is_boolean(&self) -> bool {
        match self {
            Self::Constant(value) => matches!(value, Bson::Boolean(_)),
            Self::Binary { op, .. } => op.is_comparison() || *op == AstBinaryOp::In,
            Self::Nary { op, .. } => matches!(op, AstNaryOp::And | AstNaryOp::Or),
            Self::Unary { op, .. } => matches!(
                op,
                AstUnaryOp::Not | AstUnaryOp::AnyElementTrue | AstUnaryOp::AllElementsTrue | AstUnaryOp::IsArray
            ),
            Self::RegexMatch { .. } => true,
            _ => false,
        }
    }

    /// The dotted path of a field of the current document, or `""` for
    /// the current document itself.
    pub fn current_path(&self) -> Option<String> {
        match self {
            Self::Var(name) if name == CURRENT => Some(String::new()),
            Self::GetField { input, field } if is_simple_field(field) => {
                let prefix = input.current_path()?;
                if prefix.is_empty() {
                    Some(field.to_string())
                } else {
                    Some(format!("{}.{}", prefix, field))
                }
            }
            _ => None,
        }
    }

    /// The `$a.b` or `$$var.a.b` string form of a field access.
    pub fn field_path(&self) -> Option<String> {
        match self {
            Self::GetField { input, field } if is_simple_field(field) => match &**input {
                Self::Var(name) if name == CURRENT => Some(format!("${}", field)),
                Self::Var(name) => Some(format!("$${}.{}", name, field)),
                other => other.field_path().map(|p| format!("{}.{}", p, field)),
            },
            _ => None,
        }
    }

    /// Whether `$$name` is referenced where it is not rebound.
    pub fn references_var(&self, name: &str) -> bool {
        match self {
            Self::Var(v) => v == name,
            Self::Map { input, var, body } | Self::Filter { input, var, cond: body } => {
                input.references_var(name) || (var != name && body.references_var(name))
            }
            Self::Reduce { input, initial, body } => {
                input.references_var(name)
                    || initial.references_var(name)
                    || (name != "this" && name != "value" && body.references_var(name))
            }
            Self::Let { vars, body } => {
                vars.iter().any(|(_, v)| v.references_var(name))
                    || (!vars.iter().any(|(n, _)| n == name) && body.references_var(name))
            }
            _ => self.children().iter().any(|c| c.references_var(name)),
        }
    }

    /// Child nodes in a fixed order understood by [`AstExpr::with_children`].
    pub fn children(&self) -> Vec<Arc<AstExpr>> {
        match self {
            Self::Constant(_) | Self::Var(_) => Vec::new(),
            Self::GetField { input, .. } | Self::Convert { input, .. } | Self::RegexMatch { input, .. } => {
                vec![input.clone()]
            }
            Self::Unary { arg, .. } => vec![arg.clone()],
            Self::Binary { left, right, .. } => vec![left.clone(), right.clone()],
            Self::Nary { args, .. } | Self::Array(args) => args.clone(),
            Self::Cond { test, then, otherwise } => vec![test.clone(), then.clone(), otherwise.clone()],
            Self::Filter { input, cond, .. } => vec![input.clone(), cond.clone()],
            Self::Map { input, body, .. } => vec![input.clone(), body.clone()],
            Self::Reduce { input, initial, body } => vec![input.clone(), initial.clone(), body.clone()],
            Self::Let { vars, body } => vars
                .iter()
                .map(|(_, v)| v.clone())
                .chain(std::iter::once(body.clone()))
                .collect(),
            Self::Document(fields) => fields.iter().map(|(_, v)| v.clone()).collect(),
        }
    }

    /// Rebuild this node around new children.
    ///
    /// Returns `self` when every child is pointer-equal to the existing one.
    /// Only `Nary` and `Array` nodes accept a different number of children.
    pub fn with_children(self: &Arc<Self>, children: Vec<Arc<AstExpr>>) -> TranslationResult<Arc<Self>> {
        let expected = self.children().len();
        let variadic = matches!(**self, Self::Nary { .. } | Self::Array(_));
        if !variadic && children.len() != expected {
            return Err(TranslationError::invalid_operation(format!(
                "{} takes {} children, got {}",
                self.name(),
                expected,
                children.len()
            )));
        }
        Ok(self.rebuild(children))
    }

    /// [`AstExpr::with_children`] for children derived from
    /// [`AstExpr::children`] of this same node.
    fn rebuild(self: &Arc<Self>, children: Vec<Arc<AstExpr>>) -> Arc<Self> {
        let current = self.children();
        if current.len() == children.len() && current.iter().zip(&children).all(|(a, b)| Arc::ptr_eq(a, b)) {
            return self.clone();
        }
        let rebuilt = match (&**self, children.as_slice()) {
            (Self::GetField { field, .. }, [input]) => Self::GetField {
                input: input.clone(),
                field: field.clone(),
            },
            (Self::Convert { to, .. }, [input]) => Self::Convert {
                input: input.clone(),
                to: to.clone(),
            },
            (Self::RegexMatch { pattern, options, .. }, [input]) => Self::RegexMatch {
                input: input.clone(),
                pattern: pattern.clone(),
                options: options.clone(),
            },
            (Self::Unary { op, .. }, [arg]) => Self::Unary {
                op: *op,
                arg: arg.clone(),
            },
            (Self::Binary { op, .. }, [left, right]) => Self::Binary {
                op: *op,
                left: left.clone(),
                right: right.clone(),
            },
            (Self::Nary { op, .. }, args) => Self::Nary { op: *op, args: args.to_vec() },
            (Self::Array(_), items) => Self::Array(items.to_vec()),
            (Self::Cond { .. }, [test, then, otherwise]) => Self::Cond {
                test: test.clone(),
                then: then.clone(),
                otherwise: otherwise.clone(),
            },
            (Self::Filter { var, .. }, [input, cond]) => Self::Filter {
                input: input.clone(),
                var: var.clone(),
                cond: cond.clone(),
            },
            (Self::Map { var, .. }, [input, body]) => Self::Map {
                input: input.clone(),
                var: var.clone(),
                body: body.clone(),
            },
            (Self::Reduce { .. }, [input, initial, body]) => Self::Reduce {
                input: input.clone(),
                initial: initial.clone(),
                body: body.clone(),
            },
            (Self::Let { vars, .. }, values) => {
                let (body, values) = match values.split_last() {
                    Some(split) => split,
                    None => return self.clone(),
                };
                Self::Let {
                    vars: vars
                        .iter()
                        .zip(values)
                        .map(|((name, _), value)| (name.clone(), value.clone()))
                        .collect(),
                    body: body.clone(),
                }
            }
            (Self::Document(fields), values) => Self::Document(
                fields
                    .iter()
                    .zip(values)
                    .map(|((name, _), value)| (name.clone(), value.clone()))
                    .collect(),
            ),
            _ => return self.clone(),
        };
        Arc::new(rebuilt)
    }

    pub fn update_unary(self: &Arc<Self>, arg: Arc<AstExpr>) -> TranslationResult<Arc<Self>> {
        self.expect_shape(matches!(**self, Self::Unary { .. }), "update_unary")?;
        self.with_children(vec![arg])
    }

    pub fn update_binary(self: &Arc<Self>, left: Arc<AstExpr>, right: Arc<AstExpr>) -> TranslationResult<Arc<Self>> {
        self.expect_shape(matches!(**self, Self::Binary { .. }), "update_binary")?;
        self.with_children(vec![left, right])
    }

    pub fn update_nary(self: &Arc<Self>, args: Vec<Arc<AstExpr>>) -> TranslationResult<Arc<Self>> {
        self.expect_shape(matches!(**self, Self::Nary { .. }), "update_nary")?;
        self.with_children(args)
    }

    pub fn update_cond(
        self: &Arc<Self>,
        test: Arc<AstExpr>,
        then: Arc<AstExpr>,
        otherwise: Arc<AstExpr>,
    ) -> TranslationResult<Arc<Self>> {
        self.expect_shape(matches!(**self, Self::Cond { .. }), "update_cond")?;
        self.with_children(vec![test, then, otherwise])
    }

    pub fn update_map(self: &Arc<Self>, input: Arc<AstExpr>, body: Arc<AstExpr>) -> TranslationResult<Arc<Self>> {
        self.expect_shape(matches!(**self, Self::Map { .. }), "update_map")?;
        self.with_children(vec![input, body])
    }

    pub fn update_filter(self: &Arc<Self>, input: Arc<AstExpr>, cond: Arc<AstExpr>) -> TranslationResult<Arc<Self>> {
        self.expect_shape(matches!(**self, Self::Filter { .. }), "update_filter")?;
        self.with_children(vec![input, cond])
    }

    pub fn update_reduce(
        self: &Arc<Self>,
        input: Arc<AstExpr>,
        initial: Arc<AstExpr>,
        body: Arc<AstExpr>,
    ) -> TranslationResult<Arc<Self>> {
        self.expect_shape(matches!(**self, Self::Reduce { .. }), "update_reduce")?;
        self.with_children(vec![input, initial, body])
    }

    fn expect_shape(&self, fits: bool, method: &str) -> TranslationResult<()> {
        if fits {
            Ok(())
        } else {
            Err(TranslationError::invalid_operation(format!("{method} called on a {} node", self.name())))
        }
    }

    /// Operator or node name used in error messages.
    fn name(&self) -> &'static str {
        match self {
            Self::Constant(_) => "$literal",
            Self::Var(_) => "variable",
            Self::GetField { .. } => "$getField",
            Self::Convert { .. } => "$convert",
            Self::RegexMatch { .. } => "$regexMatch",
            Self::Unary { op, .. } => op.operator(),
            Self::Binary { op, .. } => op.operator(),
            Self::Nary { op, .. } => op.operator(),
            Self::Array(_) => "array",
            Self::Cond { .. } => "$cond",
            Self::Filter { .. } => "$filter",
            Self::Map { .. } => "$map",
            Self::Reduce { .. } => "$reduce",
            Self::Let { .. } => "$let",
            Self::Document(_) => "document",
        }
    }

    /// Rewrite bottom-up. `rewrite` returns `None` to keep a node.
    pub fn transform<F>(self: &Arc<Self>, rewrite: &mut F) -> Arc<Self>
    where
        F: FnMut(&Arc<AstExpr>) -> Option<Arc<AstExpr>>,
    {
        let children = self.children().iter().map(|c| c.transform(rewrite)).collect();
        let rebuilt = self.rebuild(children);
        rewrite(&rebuilt).unwrap_or(rebuilt)
    }

    pub fn render(&self) -> Bson {
        match self {
            Self::Constant(value) => render_constant(value),
            Self::Var(name) => Bson::String(format!("$${}", name)),
            Self::GetField { input, field } => match self.field_path() {
                Some(path) => Bson::String(path),
                None => operator(
                    "$getField",
                    Bson::Document(fields([("field", Bson::String(field.to_string())), ("input", input.render())])),
                ),
            },
            Self::Unary { op, arg } => match op {
                AstUnaryOp::Trim => operator(op.operator(), Bson::Document(fields([("input", arg.render())]))),
                _ => operator(op.operator(), arg.render()),
            },
            Self::Binary { op, left, right } => operator(op.operator(), Bson::Array(vec![left.render(), right.render()])),
            Self::Nary { op, args } => operator(op.operator(), Bson::Array(args.iter().map(|a| a.render()).collect())),
            Self::Cond { test, then, otherwise } => operator(
                "$cond",
                Bson::Document(fields([("if", test.render()), ("then", then.render()), ("else", otherwise.render())])),
            ),
            Self::Filter { input, var, cond } => operator(
                "$filter",
                Bson::Document(fields([
                    ("input", input.render()),
                    ("as", Bson::String(var.to_string())),
                    ("cond", cond.render()),
                ])),
            ),
            Self::Map { input, var, body } => operator(
                "$map",
                Bson::Document(fields([
                    ("input", input.render()),
                    ("as", Bson::String(var.to_string())),
                    ("in", body.render()),
                ])),
            ),
            Self::Reduce { input, initial, body } => operator(
                "$reduce",
                Bson::Document(fields([
                    ("input", input.render()),
                    ("initialValue", initial.render()),
                    ("in", body.render()),
                ])),
            ),
            Self::Let { vars, body } => {
                let mut bindings = Document::new();
                for (name, value) in vars {
                    bindings.insert(name.as_str(), value.render());
                }
                operator("$let", Bson::Document(fields([("vars", Bson::Document(bindings)), ("in", body.render())])))
            }
            Self::Document(members) => {
                let mut document = Document::new();
                for (name, value) in members {
                    document.insert(name.as_str(), value.render());
                }
                Bson::Document(document)
            }
            Self::Array(items) => Bson::Array(items.iter().map(|i| i.render()).collect()),
            Self::Convert { input, to } => operator(
                "$convert",
                Bson::Document(fields([("input", input.render()), ("to", Bson::String(to.to_string()))])),
            ),
            Self::RegexMatch { input, pattern, options } => {
                let mut spec = fields([("input", input.render()), ("regex", Bson::String(pattern.to_string()))]);
                if !options.is_empty() {
                    spec.insert("options", options.as_str());
                }
                operator("$regexMatch", Bson::Document(spec))
            }
        }
    }
}

fn is_simple_field(field: &str) -> bool {
    !field.is_empty() && !field.starts_with('$') && !field.contains('.')
}

/// Constants the server would read as field paths or operators are quoted.
fn render_constant(value: &Bson) -> Bson {
    let needs_literal = match value {
        Bson::String(s) => s.starts_with('$'),
        Bson::Document(_) | Bson::Array(_) => true,
        _ => false,
    };
    if needs_literal {
        operator("$literal", value.clone())
    } else {
        value.clone()
    }
}

pub(crate) fn operator(name: &str, argument: Bson) -> Bson {
    let mut document = Document::new();
    document.insert(name, argument);
    Bson::Document(document)
}

pub(crate) fn fields<const N: usize>(entries: [(&str, Bson); N]) -> Document {
    let mut document = Document::with_capacity(N);
    for (name, value) in entries {
        document.insert(name, value);
    }
    document
}
