//! In-memory execution of pipeline ASTs.
//!
//! Runs the operators the translator emits against documents held in
//! memory, following the server's semantics closely enough to check that a
//! translated pipeline means what the source query meant: variable scoping,
//! field paths over arrays, type-bracketed query comparisons and empty
//! inputs in particular.
//!
//! Inside expressions a missing field evaluates to [`Bson::Undefined`];
//! documents built by `$project` and object literals drop such fields.
//!
//! ```rust
//! use lodestar_bson::{Bson, doc};
//! use lodestar_linq::ast::{AstFieldOp, AstFilter, AstPipeline, AstStage};
//! use lodestar_linq::eval::{Collections, run_pipeline};
//!
//! let pipeline = AstPipeline::empty()
//!     .push(AstStage::Match(AstFilter::field("n", AstFieldOp::Gt(Bson::Int32(1)))));
//! let docs = vec![doc! { "n" => 1 }, doc! { "n" => 2 }];
//! let out = run_pipeline(&pipeline, docs, &Collections::new()).unwrap();
//! assert_eq!(out, vec![doc! { "n" => 2 }]);
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use lodestar_bson::{Bson, Decimal128, Document, Regex};
use smol_str::SmolStr;
use thiserror::Error;
use tracing::debug;

use crate::ast::{
    Accumulator, AccumulatorOp, AstBinaryOp, AstExpr, AstFieldOp, AstFilter, AstNaryOp, AstPipeline, AstStage,
    AstUnaryOp, CURRENT, ProjectField, ROOT, SetWindowFields, SortDirection, SortField, WindowBound, WindowBounds,
    WindowField, WindowOperator,
};

/// Errors raised while executing a pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("{operator} does not accept a value of type {found}")]
    TypeMismatch { operator: &'static str, found: String },

    #[error("use of undefined variable: $${0}")]
    UnknownVariable(SmolStr),

    #[error("collection '{0}' is not available")]
    UnknownCollection(SmolStr),

    #[error("{operator}: {reason}")]
    InvalidArgument { operator: &'static str, reason: String },

    #[error("{0} is not supported in memory")]
    Unsupported(String),
}

impl EvalError {
    fn type_mismatch(operator: &'static str, value: &Bson) -> Self {
        Self::TypeMismatch {
            operator,
            found: value.element_type().to_string(),
        }
    }

    fn invalid(operator: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operator,
            reason: reason.into(),
        }
    }
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Named collections visible to `$lookup` and `$unionWith`.
#[derive(Debug, Clone, Default)]
pub struct Collections {
    collections: HashMap<SmolStr, Arc<Vec<Document>>>,
}

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<SmolStr>, documents: Vec<Document>) -> Self {
        self.insert(name, documents);
        self
    }

    pub fn insert(&mut self, name: impl Into<SmolStr>, documents: Vec<Document>) {
        self.collections.insert(name.into(), Arc::new(documents));
    }

    pub fn get(&self, name: &str) -> EvalResult<&[Document]> {
        self.collections
            .get(name)
            .map(|docs| docs.as_slice())
            .ok_or_else(|| EvalError::UnknownCollection(SmolStr::new(name)))
    }

    /// Run `pipeline` over the named collection.
    pub fn aggregate(&self, collection: &str, pipeline: &AstPipeline) -> EvalResult<Vec<Document>> {
        let documents = self.get(collection)?.to_vec();
        run_pipeline(pipeline, documents, self)
    }
}

/// Run every stage of `pipeline` over `documents`.
pub fn run_pipeline(pipeline: &AstPipeline, documents: Vec<Document>, collections: &Collections) -> EvalResult<Vec<Document>> {
    pipeline.stages().iter().try_fold(documents, |docs, stage| {
        lodestar_bson::lodestar_trace!(stage = %stage.name(), input = docs.len(), "running stage");
        run_stage(stage, docs, collections)
    })
}

/// Evaluate an aggregation expression with `$$CURRENT` and `$$ROOT` bound
/// to `document`.
pub fn evaluate(expr: &AstExpr, document: &Document) -> EvalResult<Bson> {
    Env::for_document(document).eval(expr)
}

/// Whether `document` satisfies a `$match` filter.
pub fn matches(filter: &AstFilter, document: &Document) -> EvalResult<bool> {
    matches_value(filter, &Bson::Document(document.clone()))
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Variable bindings, innermost last.
struct Env {
    vars: Vec<(SmolStr, Bson)>,
}

impl Env {
    fn for_document(document: &Document) -> Self {
        Self::for_value(Bson::Document(document.clone()))
    }

    fn for_value(value: Bson) -> Self {
        Self {
            vars: vec![(SmolStr::new_static(ROOT), value.clone()), (SmolStr::new_static(CURRENT), value)],
        }
    }

    fn lookup(&self, name: &str) -> EvalResult<&Bson> {
        self.vars
            .iter()
            .rev()
            .find(|(var, _)| var == name)
            .map(|(_, value)| value)
            .ok_or_else(|| EvalError::UnknownVariable(SmolStr::new(name)))
    }

    fn scoped<T>(&mut self, bindings: Vec<(SmolStr, Bson)>, body: impl FnOnce(&mut Self) -> EvalResult<T>) -> EvalResult<T> {
        let depth = self.vars.len();
        self.vars.extend(bindings);
        let result = body(self);
        self.vars.truncate(depth);
        result
    }

    fn eval(&mut self, expr: &AstExpr) -> EvalResult<Bson> {
        match expr {
            AstExpr::Constant(value) => Ok(value.clone()),
            AstExpr::Var(name) => self.lookup(name).cloned(),
            AstExpr::GetField { input, field } => {
                let base = self.eval(input)?;
                Ok(field.split('.').fold(base, |value, segment| get_field(&value, segment)))
            }
            AstExpr::Unary { op, arg } => {
                let value = self.eval(arg)?;
                unary(*op, value)
            }
            AstExpr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, left, right)
            }
            AstExpr::Nary { op, args } => self.nary(*op, args),
            AstExpr::Cond { test, then, otherwise } => {
                if self.eval(test)?.is_truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            AstExpr::Filter { input, var, cond } => {
                let Some(items) = self.array_input("$filter", input)? else {
                    return Ok(Bson::Null);
                };
                let mut kept = Vec::new();
                for item in items {
                    let keep = self.scoped(vec![(var.clone(), item.clone())], |env| env.eval(cond))?;
                    if keep.is_truthy() {
                        kept.push(item);
                    }
                }
                Ok(Bson::Array(kept))
            }
            AstExpr::Map { input, var, body } => {
                let Some(items) = self.array_input("$map", input)? else {
                    return Ok(Bson::Null);
                };
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    let value = self.scoped(vec![(var.clone(), item)], |env| env.eval(body))?;
                    mapped.push(missing_as_null(value));
                }
                Ok(Bson::Array(mapped))
            }
            AstExpr::Reduce { input, initial, body } => {
                let Some(items) = self.array_input("$reduce", input)? else {
                    return Ok(Bson::Null);
                };
                let mut accumulated = self.eval(initial)?;
                for item in items {
                    let bindings = vec![(SmolStr::new_static("this"), item), (SmolStr::new_static("value"), accumulated)];
                    accumulated = self.scoped(bindings, |env| env.eval(body))?;
                }
                Ok(accumulated)
            }
            AstExpr::Let { vars, body } => {
                // Every initializer sees the outer scope, not its siblings.
                let mut bindings = Vec::with_capacity(vars.len());
                for (name, value) in vars {
                    bindings.push((name.clone(), self.eval(value)?));
                }
                self.scoped(bindings, |env| env.eval(body))
            }
            AstExpr::Document(fields) => {
                let mut document = Document::with_capacity(fields.len());
                for (name, value) in fields {
                    let value = self.eval(value)?;
                    if !matches!(value, Bson::Undefined) {
                        document.insert(name.as_str(), value);
                    }
                }
                Ok(Bson::Document(document))
            }
            AstExpr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(missing_as_null(self.eval(item)?));
                }
                Ok(Bson::Array(values))
            }
            AstExpr::Convert { input, to } => {
                let value = self.eval(input)?;
                convert(value, to)
            }
            AstExpr::RegexMatch { input, pattern, options } => {
                let value = self.eval(input)?;
                match value {
                    Bson::String(text) => Ok(Bson::Boolean(compile_regex(pattern, options)?.is_match(&text))),
                    v if is_nullish(&v) => Ok(Bson::Boolean(false)),
                    other => Err(EvalError::type_mismatch("$regexMatch", &other)),
                }
            }
        }
    }

    /// `None` when the input is null or missing.
    fn array_input(&mut self, operator: &'static str, input: &AstExpr) -> EvalResult<Option<Vec<Bson>>> {
        match self.eval(input)? {
            Bson::Array(items) => Ok(Some(items)),
            v if is_nullish(&v) => Ok(None),
            other => Err(EvalError::type_mismatch(operator, &other)),
        }
    }

    fn nary(&mut self, op: AstNaryOp, args: &[Arc<AstExpr>]) -> EvalResult<Bson> {
        match op {
            AstNaryOp::And => {
                for arg in args {
                    if !self.eval(arg)?.is_truthy() {
                        return Ok(Bson::Boolean(false));
                    }
                }
                Ok(Bson::Boolean(true))
            }
            AstNaryOp::Or => {
                for arg in args {
                    if self.eval(arg)?.is_truthy() {
                        return Ok(Bson::Boolean(true));
                    }
                }
                Ok(Bson::Boolean(false))
            }
            _ => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                nary(op, values)
            }
        }
    }
}

fn is_nullish(value: &Bson) -> bool {
    matches!(value, Bson::Null | Bson::Undefined)
}

fn missing_as_null(value: Bson) -> Bson {
    match value {
        Bson::Undefined => Bson::Null,
        other => other,
    }
}

/// One step of a field path: documents yield the field, arrays map the step
/// over their document elements.
fn get_field(value: &Bson, name: &str) -> Bson {
    match value {
        Bson::Document(document) => document.get(name).cloned().unwrap_or(Bson::Undefined),
        Bson::Array(items) => Bson::Array(
            items
                .iter()
                .filter(|item| matches!(item, Bson::Document(_) | Bson::Array(_)))
                .map(|item| get_field(item, name))
                .filter(|v| !matches!(v, Bson::Undefined))
                .collect(),
        ),
        _ => Bson::Undefined,
    }
}

/// Aggregation comparison: missing sorts below null, otherwise canonical.
fn compare(left: &Bson, right: &Bson) -> Ordering {
    match (left, right) {
        (Bson::Undefined, Bson::Null) => Ordering::Less,
        (Bson::Null, Bson::Undefined) => Ordering::Greater,
        _ => left.canonical_cmp(right),
    }
}

fn values_equal(left: &Bson, right: &Bson) -> bool {
    compare(left, right) == Ordering::Equal
}

fn unary(op: AstUnaryOp, value: Bson) -> EvalResult<Bson> {
    let operator = op.operator();
    match op {
        AstUnaryOp::Not => Ok(Bson::Boolean(!value.is_truthy())),
        AstUnaryOp::IsArray => Ok(Bson::Boolean(matches!(value, Bson::Array(_)))),
        AstUnaryOp::Size => match value {
            Bson::Array(items) => Ok(count_value(items.len())),
            other => Err(EvalError::type_mismatch(operator, &other)),
        },
        AstUnaryOp::Abs | AstUnaryOp::Ceil | AstUnaryOp::Floor | AstUnaryOp::Trunc => {
            if is_nullish(&value) {
                return Ok(Bson::Null);
            }
            let round = |x: f64| match op {
                AstUnaryOp::Abs => x.abs(),
                AstUnaryOp::Ceil => x.ceil(),
                AstUnaryOp::Floor => x.floor(),
                _ => x.trunc(),
            };
            match value {
                Bson::Int32(v) if op == AstUnaryOp::Abs => Ok(v.checked_abs().map_or(Bson::Int64(i64::from(v).abs()), Bson::Int32)),
                Bson::Int64(v) if op == AstUnaryOp::Abs => v
                    .checked_abs()
                    .map(Bson::Int64)
                    .ok_or_else(|| EvalError::invalid(operator, "can't take the absolute value of the minimum long")),
                Bson::Int32(_) | Bson::Int64(_) => Ok(value),
                Bson::Double(v) => Ok(Bson::Double(round(v))),
                Bson::Decimal128(d) => Ok(Bson::Decimal128(Decimal128::from_f64(round(d.to_f64())))),
                other => Err(EvalError::type_mismatch(operator, &other)),
            }
        }
        AstUnaryOp::Sqrt | AstUnaryOp::Ln | AstUnaryOp::Log10 | AstUnaryOp::Exp => {
            if is_nullish(&value) {
                return Ok(Bson::Null);
            }
            let x = number(operator, &value)?;
            if x < 0.0 && op == AstUnaryOp::Sqrt {
                return Err(EvalError::invalid(operator, "argument must be greater than or equal to 0"));
            }
            if x <= 0.0 && matches!(op, AstUnaryOp::Ln | AstUnaryOp::Log10) {
                return Err(EvalError::invalid(operator, "argument must be a positive number"));
            }
            Ok(Bson::Double(match op {
                AstUnaryOp::Sqrt => x.sqrt(),
                AstUnaryOp::Ln => x.ln(),
                AstUnaryOp::Log10 => x.log10(),
                _ => x.exp(),
            }))
        }
        AstUnaryOp::ToLower | AstUnaryOp::ToUpper | AstUnaryOp::Trim => {
            let text = match value {
                Bson::String(text) | Bson::Symbol(text) => text,
                v if is_nullish(&v) => String::new(),
                other => return Err(EvalError::type_mismatch(operator, &other)),
            };
            Ok(Bson::String(match op {
                AstUnaryOp::ToLower => text.to_lowercase(),
                AstUnaryOp::ToUpper => text.to_uppercase(),
                _ => text.trim().to_string(),
            }))
        }
        AstUnaryOp::StrLenCP => match value {
            Bson::String(text) => Ok(count_value(text.chars().count())),
            other => Err(EvalError::type_mismatch(operator, &other)),
        },
        AstUnaryOp::First | AstUnaryOp::Last => match value {
            Bson::Array(items) => {
                let item = if op == AstUnaryOp::First { items.into_iter().next() } else { items.into_iter().last() };
                Ok(item.unwrap_or(Bson::Undefined))
            }
            v if is_nullish(&v) => Ok(Bson::Null),
            other => Err(EvalError::type_mismatch(operator, &other)),
        },
        AstUnaryOp::AnyElementTrue | AstUnaryOp::AllElementsTrue => match value {
            Bson::Array(items) => Ok(Bson::Boolean(if op == AstUnaryOp::AnyElementTrue {
                items.iter().any(Bson::is_truthy)
            } else {
                items.iter().all(Bson::is_truthy)
            })),
            other => Err(EvalError::type_mismatch(operator, &other)),
        },
        AstUnaryOp::Sum | AstUnaryOp::Avg | AstUnaryOp::Min | AstUnaryOp::Max => {
            let values = match value {
                Bson::Array(items) => items,
                other => vec![other],
            };
            match op {
                AstUnaryOp::Sum => sum_values(values.iter()),
                AstUnaryOp::Avg => avg_values(values.iter()),
                AstUnaryOp::Min => Ok(extreme_value(values.iter(), Ordering::Less)),
                _ => Ok(extreme_value(values.iter(), Ordering::Greater)),
            }
        }
    }
}

fn binary(op: AstBinaryOp, left: Bson, right: Bson) -> EvalResult<Bson> {
    let operator = op.operator();
    match op {
        AstBinaryOp::Eq => Ok(Bson::Boolean(compare(&left, &right) == Ordering::Equal)),
        AstBinaryOp::Ne => Ok(Bson::Boolean(compare(&left, &right) != Ordering::Equal)),
        AstBinaryOp::Gt => Ok(Bson::Boolean(compare(&left, &right) == Ordering::Greater)),
        AstBinaryOp::Gte => Ok(Bson::Boolean(compare(&left, &right) != Ordering::Less)),
        AstBinaryOp::Lt => Ok(Bson::Boolean(compare(&left, &right) == Ordering::Less)),
        AstBinaryOp::Lte => Ok(Bson::Boolean(compare(&left, &right) != Ordering::Greater)),
        AstBinaryOp::Cmp => Ok(Bson::Int32(match compare(&left, &right) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        })),
        AstBinaryOp::Subtract => {
            if let (Bson::DateTime(a), Bson::DateTime(b)) = (&left, &right) {
                return Ok(Bson::Int64(a.timestamp_millis() - b.timestamp_millis()));
            }
            arithmetic(operator, Arithmetic::Subtract, &left, &right)
        }
        AstBinaryOp::Divide => {
            if is_nullish(&left) || is_nullish(&right) {
                return Ok(Bson::Null);
            }
            let (x, y) = (number(operator, &left)?, number(operator, &right)?);
            if y == 0.0 {
                return Err(EvalError::invalid(operator, "can't divide by zero"));
            }
            if matches!(left, Bson::Decimal128(_)) || matches!(right, Bson::Decimal128(_)) {
                return Ok(Bson::Decimal128(Decimal128::from_f64(x / y)));
            }
            Ok(Bson::Double(x / y))
        }
        AstBinaryOp::Mod => {
            if is_nullish(&left) || is_nullish(&right) {
                return Ok(Bson::Null);
            }
            let (x, y) = (number(operator, &left)?, number(operator, &right)?);
            if y == 0.0 {
                return Err(EvalError::invalid(operator, "can't mod by zero"));
            }
            match (&left, &right) {
                (Bson::Int32(a), Bson::Int32(b)) => Ok(Bson::Int32(a.wrapping_rem(*b))),
                (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
                    let (a, b) = (int(&left), int(&right));
                    Ok(Bson::Int64(a.wrapping_rem(b)))
                }
                _ => Ok(Bson::Double(x % y)),
            }
        }
        AstBinaryOp::Pow => {
            if is_nullish(&left) || is_nullish(&right) {
                return Ok(Bson::Null);
            }
            let (x, y) = (number(operator, &left)?, number(operator, &right)?);
            let integral = matches!(left, Bson::Int32(_) | Bson::Int64(_)) && matches!(right, Bson::Int32(_) | Bson::Int64(_));
            if integral {
                if let Ok(exponent) = u32::try_from(int(&right)) {
                    if let Some(result) = int(&left).checked_pow(exponent) {
                        return Ok(narrow(result, matches!((&left, &right), (Bson::Int32(_), Bson::Int32(_)))));
                    }
                }
            }
            Ok(Bson::Double(x.powf(y)))
        }
        AstBinaryOp::Log => {
            if is_nullish(&left) || is_nullish(&right) {
                return Ok(Bson::Null);
            }
            let (x, base) = (number(operator, &left)?, number(operator, &right)?);
            if x <= 0.0 || base <= 0.0 || base == 1.0 {
                return Err(EvalError::invalid(operator, "arguments must be positive and the base can't be 1"));
            }
            Ok(Bson::Double(x.ln() / base.ln()))
        }
        AstBinaryOp::Round => {
            if is_nullish(&left) {
                return Ok(Bson::Null);
            }
            let places = if is_nullish(&right) { 0 } else { int_arg(operator, &right)? };
            match left {
                Bson::Int32(_) | Bson::Int64(_) if places >= 0 => Ok(left),
                Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => {
                    let x = number(operator, &left)?;
                    let scale = 10f64.powi(i32::try_from(places).unwrap_or(i32::MAX));
                    let rounded = (x * scale).round_ties_even() / scale;
                    match left {
                        Bson::Decimal128(_) => Ok(Bson::Decimal128(Decimal128::from_f64(rounded))),
                        Bson::Int32(_) | Bson::Int64(_) => Ok(Bson::Int64(rounded as i64)),
                        _ => Ok(Bson::Double(rounded)),
                    }
                }
                other => Err(EvalError::type_mismatch(operator, &other)),
            }
        }
        AstBinaryOp::ArrayElemAt => {
            let items = match left {
                Bson::Array(items) => items,
                v if is_nullish(&v) => return Ok(Bson::Null),
                other => return Err(EvalError::type_mismatch(operator, &other)),
            };
            let index = int_arg(operator, &right)?;
            let position = if index < 0 { items.len() as i64 + index } else { index };
            Ok(usize::try_from(position)
                .ok()
                .and_then(|p| items.get(p).cloned())
                .unwrap_or(Bson::Undefined))
        }
        AstBinaryOp::In => match right {
            Bson::Array(items) => Ok(Bson::Boolean(items.iter().any(|item| values_equal(&left, item)))),
            other => Err(EvalError::type_mismatch(operator, &other)),
        },
        AstBinaryOp::IfNull => Ok(if is_nullish(&left) { right } else { left }),
        AstBinaryOp::IndexOfCP => match (left, right) {
            (v, _) if is_nullish(&v) => Ok(Bson::Null),
            (Bson::String(text), Bson::String(needle)) => Ok(Bson::Int32(
                text.find(&needle)
                    .map_or(-1, |byte| i32::try_from(text[..byte].chars().count()).unwrap_or(i32::MAX)),
            )),
            (Bson::String(_), other) | (other, _) => Err(EvalError::type_mismatch(operator, &other)),
        },
    }
}

fn nary(op: AstNaryOp, values: Vec<Bson>) -> EvalResult<Bson> {
    let operator = op.operator();
    match op {
        AstNaryOp::And => Ok(Bson::Boolean(values.iter().all(Bson::is_truthy))),
        AstNaryOp::Or => Ok(Bson::Boolean(values.iter().any(Bson::is_truthy))),
        AstNaryOp::Add | AstNaryOp::Multiply => {
            let (kind, seed) = if op == AstNaryOp::Add {
                (Arithmetic::Add, Bson::Int32(0))
            } else {
                (Arithmetic::Multiply, Bson::Int32(1))
            };
            let mut date = None;
            let mut total = seed;
            for value in &values {
                if let (Bson::DateTime(d), AstNaryOp::Add) = (value, op) {
                    date = Some(d.timestamp_millis());
                    continue;
                }
                total = arithmetic(operator, kind, &total, value)?;
            }
            match date {
                Some(millis) if !is_nullish(&total) => {
                    let offset = total
                        .to_i64_exact()
                        .or_else(|| total.to_f64_lossy().map(|f| f.round() as i64))
                        .unwrap_or_default();
                    Ok(Bson::DateTime(lodestar_bson::DateTime::from_millis(millis.saturating_add(offset))))
                }
                _ => Ok(total),
            }
        }
        AstNaryOp::Concat => {
            let mut out = String::new();
            for value in values {
                match value {
                    Bson::String(text) => out.push_str(&text),
                    v if is_nullish(&v) => return Ok(Bson::Null),
                    other => return Err(EvalError::type_mismatch(operator, &other)),
                }
            }
            Ok(Bson::String(out))
        }
        AstNaryOp::ConcatArrays => {
            let mut out = Vec::new();
            for value in values {
                match value {
                    Bson::Array(items) => out.extend(items),
                    v if is_nullish(&v) => return Ok(Bson::Null),
                    other => return Err(EvalError::type_mismatch(operator, &other)),
                }
            }
            Ok(Bson::Array(out))
        }
        AstNaryOp::SubstrCP => {
            let [text, start, count] = <[Bson; 3]>::try_from(values)
                .map_err(|v| EvalError::invalid(operator, format!("expects 3 arguments, got {}", v.len())))?;
            let text = match text {
                Bson::String(text) => text,
                v if is_nullish(&v) => String::new(),
                other => return Err(EvalError::type_mismatch(operator, &other)),
            };
            let start = usize::try_from(int_arg(operator, &start)?)
                .map_err(|_| EvalError::invalid(operator, "starting index must be non-negative"))?;
            let count = usize::try_from(int_arg(operator, &count)?).unwrap_or(usize::MAX);
            Ok(Bson::String(text.chars().skip(start).take(count).collect()))
        }
        AstNaryOp::Min | AstNaryOp::Max => {
            let values = match <[Bson; 1]>::try_from(values) {
                Ok([Bson::Array(items)]) => items,
                Ok([single]) => vec![single],
                Err(values) => values,
            };
            let wanted = if op == AstNaryOp::Min { Ordering::Less } else { Ordering::Greater };
            Ok(extreme_value(values.iter(), wanted))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arithmetic {
    Add,
    Subtract,
    Multiply,
}

/// Integer arithmetic stays integral and widens to Int64 or Double on
/// overflow; any double or decimal operand makes the result one too.
fn arithmetic(operator: &'static str, kind: Arithmetic, left: &Bson, right: &Bson) -> EvalResult<Bson> {
    if is_nullish(left) || is_nullish(right) {
        return Ok(Bson::Null);
    }
    if let (Bson::DateTime(d), Arithmetic::Subtract) = (left, kind) {
        let offset = right.to_i64_exact().ok_or_else(|| EvalError::type_mismatch(operator, right))?;
        return Ok(Bson::DateTime(lodestar_bson::DateTime::from_millis(d.timestamp_millis().saturating_sub(offset))));
    }
    let (x, y) = (number(operator, left)?, number(operator, right)?);
    let float = match kind {
        Arithmetic::Add => x + y,
        Arithmetic::Subtract => x - y,
        Arithmetic::Multiply => x * y,
    };
    match (left, right) {
        (Bson::Decimal128(_), _) | (_, Bson::Decimal128(_)) => Ok(Bson::Decimal128(Decimal128::from_f64(float))),
        (Bson::Double(_), _) | (_, Bson::Double(_)) => Ok(Bson::Double(float)),
        _ => {
            let (a, b) = (int(left), int(right));
            let exact = match kind {
                Arithmetic::Add => a.checked_add(b),
                Arithmetic::Subtract => a.checked_sub(b),
                Arithmetic::Multiply => a.checked_mul(b),
            };
            Ok(match exact {
                Some(value) => narrow(value, matches!((left, right), (Bson::Int32(_), Bson::Int32(_)))),
                None => Bson::Double(float),
            })
        }
    }
}

fn narrow(value: i64, prefer_int32: bool) -> Bson {
    match i32::try_from(value) {
        Ok(v) if prefer_int32 => Bson::Int32(v),
        _ => Bson::Int64(value),
    }
}

fn int(value: &Bson) -> i64 {
    value.to_i64_exact().unwrap_or_default()
}

fn number(operator: &'static str, value: &Bson) -> EvalResult<f64> {
    value.to_f64_lossy().ok_or_else(|| EvalError::type_mismatch(operator, value))
}

fn int_arg(operator: &'static str, value: &Bson) -> EvalResult<i64> {
    value
        .to_i64_exact()
        .ok_or_else(|| EvalError::invalid(operator, format!("expected an integral number, found {}", value.element_type())))
}

fn count_value(count: usize) -> Bson {
    match i32::try_from(count) {
        Ok(v) => Bson::Int32(v),
        Err(_) => Bson::Int64(i64::try_from(count).unwrap_or(i64::MAX)),
    }
}

/// `$sum` ignores non-numeric values and sums an empty input to 0.
fn sum_values<'a>(values: impl Iterator<Item = &'a Bson>) -> EvalResult<Bson> {
    values
        .filter(|v| v.is_number())
        .try_fold(Bson::Int32(0), |total, v| arithmetic("$sum", Arithmetic::Add, &total, v))
}

/// `$avg` of no numbers is null.
fn avg_values<'a>(values: impl Iterator<Item = &'a Bson>) -> EvalResult<Bson> {
    let numbers: Vec<&Bson> = values.filter(|v| v.is_number()).collect();
    if numbers.is_empty() {
        return Ok(Bson::Null);
    }
    let total = numbers.iter().filter_map(|v| v.to_f64_lossy()).sum::<f64>();
    let mean = total / numbers.len() as f64;
    if numbers.iter().any(|v| matches!(v, Bson::Decimal128(_))) {
        return Ok(Bson::Decimal128(Decimal128::from_f64(mean)));
    }
    Ok(Bson::Double(mean))
}

/// `$min`/`$max` skip null and missing values; null when nothing is left.
fn extreme_value<'a>(values: impl Iterator<Item = &'a Bson>, wanted: Ordering) -> Bson {
    values
        .filter(|v| !is_nullish(v))
        .fold(None::<&Bson>, |best, v| match best {
            Some(b) if v.canonical_cmp(b) != wanted => Some(b),
            _ => Some(v),
        })
        .cloned()
        .unwrap_or(Bson::Null)
}

fn convert(value: Bson, to: &str) -> EvalResult<Bson> {
    if is_nullish(&value) {
        return Ok(Bson::Null);
    }
    let failed = |value: &Bson| EvalError::invalid("$convert", format!("can't convert {} to {to}", value.element_type()));
    match to {
        "int" => value
            .to_i64_exact()
            .or_else(|| value.to_f64_lossy().map(|f| f.trunc() as i64))
            .or_else(|| value.as_bool().map(i64::from))
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .and_then(|v| i32::try_from(v).ok())
            .map(Bson::Int32)
            .ok_or_else(|| failed(&value)),
        "long" => value
            .to_i64_exact()
            .or_else(|| value.to_f64_lossy().map(|f| f.trunc() as i64))
            .or_else(|| value.as_bool().map(i64::from))
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .map(Bson::Int64)
            .ok_or_else(|| failed(&value)),
        "double" => value
            .to_f64_lossy()
            .or_else(|| value.as_bool().map(|b| if b { 1.0 } else { 0.0 }))
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .map(Bson::Double)
            .ok_or_else(|| failed(&value)),
        "decimal" => match &value {
            Bson::String(text) => Decimal128::parse(text).map(Bson::Decimal128).map_err(|_| failed(&value)),
            Bson::Int32(_) | Bson::Int64(_) => Ok(Bson::Decimal128(Decimal128::from_i64(int(&value)))),
            other => other
                .to_f64_lossy()
                .map(|f| Bson::Decimal128(Decimal128::from_f64(f)))
                .ok_or_else(|| failed(&value)),
        },
        "bool" => Ok(Bson::Boolean(value.is_truthy())),
        "string" => match &value {
            Bson::String(_) => Ok(value),
            Bson::Int32(v) => Ok(Bson::String(v.to_string())),
            Bson::Int64(v) => Ok(Bson::String(v.to_string())),
            Bson::Double(v) => Ok(Bson::String(v.to_string())),
            Bson::Decimal128(d) => Ok(Bson::String(d.to_string())),
            Bson::Boolean(b) => Ok(Bson::String(b.to_string())),
            Bson::ObjectId(oid) => Ok(Bson::String(oid.to_string())),
            Bson::DateTime(dt) => dt.to_iso_string().map(Bson::String).ok_or_else(|| failed(&value)),
            _ => Err(failed(&value)),
        },
        other => Err(EvalError::Unsupported(format!("$convert to '{other}'"))),
    }
}

fn compile_regex(pattern: &str, options: &str) -> EvalResult<regex_lite::Regex> {
    let flags: String = options.chars().filter(|c| matches!(c, 'i' | 'm' | 's' | 'x')).collect();
    let source = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    regex_lite::Regex::new(&source).map_err(|e| EvalError::invalid("$regex", e.to_string()))
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn matches_value(filter: &AstFilter, value: &Bson) -> EvalResult<bool> {
    match filter {
        AstFilter::Field { path, ops } => {
            let mut found = Vec::new();
            resolve_path(value, path, &mut found);
            for op in ops {
                if !field_op_matches(op, &found)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        AstFilter::And(filters) => {
            for filter in filters {
                if !matches_value(filter, value)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        AstFilter::Or(filters) => {
            for filter in filters {
                if matches_value(filter, value)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        AstFilter::Nor(filters) => {
            for filter in filters {
                if matches_value(filter, value)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        AstFilter::Expr(expr) => Ok(Env::for_value(value.clone()).eval(expr)?.is_truthy()),
    }
}

/// Values reached by a dotted query path. Arrays met along the way are
/// traversed element by element; numeric segments also index them. An
/// empty path is the value itself.
fn resolve_path<'a>(value: &'a Bson, path: &str, out: &mut Vec<&'a Bson>) {
    if path.is_empty() {
        out.push(value);
        return;
    }
    let segments: Vec<&str> = path.split('.').collect();
    walk(value, &segments, out);
}

fn walk<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Bson::Document(document) => {
            if let Some(child) = document.get(segment) {
                walk(child, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    walk(item, rest, out);
                }
            }
            for item in items.iter().filter(|item| matches!(item, Bson::Document(_))) {
                walk(item, segments, out);
            }
        }
        _ => {}
    }
}

/// The leaf values plus the elements of leaf arrays.
fn candidates<'a>(found: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut out = Vec::with_capacity(found.len());
    for value in found {
        out.push(*value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn query_equals(found: &[&Bson], expected: &Bson) -> bool {
    if expected.is_null() && (found.is_empty() || candidates(found).iter().any(|v| is_nullish(v))) {
        return true;
    }
    candidates(found)
        .iter()
        .any(|v| v.canonical_rank() == expected.canonical_rank() && v.canonical_cmp(expected) == Ordering::Equal)
}

fn query_compare(found: &[&Bson], bound: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    candidates(found)
        .iter()
        .any(|v| v.canonical_rank() == bound.canonical_rank() && accept(v.canonical_cmp(bound)))
}

fn regex_matches(found: &[&Bson], regex: &Regex) -> EvalResult<bool> {
    let compiled = compile_regex(&regex.pattern, &regex.options)?;
    Ok(candidates(found)
        .iter()
        .any(|v| matches!(v, Bson::String(s) | Bson::Symbol(s) if compiled.is_match(s))))
}

fn in_list(found: &[&Bson], list: &[Bson]) -> EvalResult<bool> {
    for item in list {
        let hit = match item {
            Bson::RegularExpression(regex) => regex_matches(found, regex)?,
            other => query_equals(found, other),
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn field_op_matches(op: &AstFieldOp, found: &[&Bson]) -> EvalResult<bool> {
    Ok(match op {
        AstFieldOp::Eq(expected) => query_equals(found, expected),
        AstFieldOp::Ne(expected) => !query_equals(found, expected),
        AstFieldOp::Gt(bound) => query_compare(found, bound, |o| o == Ordering::Greater),
        AstFieldOp::Gte(bound) => query_compare(found, bound, |o| o != Ordering::Less),
        AstFieldOp::Lt(bound) => query_compare(found, bound, |o| o == Ordering::Less),
        AstFieldOp::Lte(bound) => query_compare(found, bound, |o| o != Ordering::Greater),
        AstFieldOp::In(list) => in_list(found, list)?,
        AstFieldOp::Nin(list) => !in_list(found, list)?,
        AstFieldOp::Exists(expected) => !found.is_empty() == *expected,
        AstFieldOp::Size(size) => found
            .iter()
            .any(|v| matches!(v, Bson::Array(items) if items.len() as i64 == *size)),
        AstFieldOp::Regex(regex) => regex_matches(found, regex)?,
        AstFieldOp::ElemMatch(filter) => {
            for value in found {
                if let Bson::Array(items) = value {
                    for item in items {
                        if matches_value(filter, item)? {
                            return Ok(true);
                        }
                    }
                }
            }
            false
        }
        AstFieldOp::Not(inner) => !field_op_matches(inner, found)?,
    })
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

fn run_stage(stage: &AstStage, documents: Vec<Document>, collections: &Collections) -> EvalResult<Vec<Document>> {
    match stage {
        AstStage::Match(filter) => {
            let mut kept = Vec::with_capacity(documents.len());
            for document in documents {
                if matches(filter, &document)? {
                    kept.push(document);
                }
            }
            Ok(kept)
        }
        AstStage::Project(fields) => documents.iter().map(|document| project(fields, document)).collect(),
        AstStage::Group { id, fields } => group(id, fields, documents),
        AstStage::Sort(sort) => {
            let mut documents = documents;
            documents.sort_by(|a, b| compare_by_sort(sort, a, b));
            Ok(documents)
        }
        AstStage::Skip(n) => Ok(documents.into_iter().skip(usize::try_from(*n).unwrap_or(0)).collect()),
        AstStage::Limit(n) => {
            if *n <= 0 {
                return Err(EvalError::invalid("$limit", "the limit must be positive"));
            }
            Ok(documents.into_iter().take(usize::try_from(*n).unwrap_or(usize::MAX)).collect())
        }
        AstStage::Unwind {
            path,
            preserve_null_and_empty_arrays,
        } => Ok(unwind(path, *preserve_null_and_empty_arrays, documents)),
        AstStage::ReplaceRoot(expr) => documents
            .iter()
            .map(|document| match evaluate(expr, document)? {
                Bson::Document(root) => Ok(root),
                other => Err(EvalError::type_mismatch("$replaceRoot", &other)),
            })
            .collect(),
        AstStage::Count(name) => {
            if documents.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Document::new();
            out.insert(name.as_str(), count_value(documents.len()));
            Ok(vec![out])
        }
        AstStage::UnionWith { collection, pipeline } => {
            let mut documents = documents;
            let other = collections.aggregate(collection, pipeline)?;
            debug!(collection = %collection, appended = other.len(), "unionWith");
            documents.extend(other);
            Ok(documents)
        }
        AstStage::Lookup {
            from,
            local_field,
            foreign_field,
            as_field,
        } => {
            let foreign = collections.get(from)?;
            let null = Bson::Null;
            let mut out = Vec::with_capacity(documents.len());
            for mut document in documents {
                let local = Bson::Document(document.clone());
                let mut keys = Vec::new();
                resolve_path(&local, local_field, &mut keys);
                let keys = if keys.is_empty() { vec![&null] } else { candidates(&keys) };
                let joined: Vec<Bson> = foreign
                    .iter()
                    .filter(|candidate| {
                        let candidate = Bson::Document((*candidate).clone());
                        let mut found = Vec::new();
                        resolve_path(&candidate, foreign_field, &mut found);
                        keys.iter().any(|key| query_equals(&found, key))
                    })
                    .cloned()
                    .map(Bson::Document)
                    .collect();
                set_path(&mut document, as_field, Bson::Array(joined));
                out.push(document);
            }
            Ok(out)
        }
        AstStage::SetWindowFields(spec) => set_window_fields(spec, documents),
    }
}

fn project(fields: &[(SmolStr, ProjectField)], document: &Document) -> EvalResult<Document> {
    let exclusion = fields
        .iter()
        .all(|(name, field)| matches!(field, ProjectField::Exclude) || (name == "_id" && !matches!(field, ProjectField::Computed(_))));
    if exclusion && fields.iter().any(|(_, f)| matches!(f, ProjectField::Exclude)) {
        let mut out = document.clone();
        for (name, field) in fields {
            if matches!(field, ProjectField::Exclude) {
                remove_path(&mut out, name);
            }
        }
        return Ok(out);
    }
    let mut out = Document::new();
    let id_listed = fields.iter().any(|(name, _)| name == "_id");
    if !id_listed {
        if let Some(id) = document.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (name, field) in fields {
        match field {
            ProjectField::Exclude => {}
            ProjectField::Include => {
                if let Some(value) = document.get_path(name) {
                    set_path(&mut out, name, value.clone());
                }
            }
            ProjectField::Computed(expr) => {
                let value = evaluate(expr, document)?;
                if !matches!(value, Bson::Undefined) {
                    set_path(&mut out, name, value);
                }
            }
        }
    }
    Ok(out)
}

fn set_path(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(document.get(head), Some(Bson::Document(_))) {
                document.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = document.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = document.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Running state of one accumulator within one group.
enum AccumulatorState {
    Values(Vec<Bson>),
    First(Option<Bson>),
    Last(Bson),
}

impl AccumulatorState {
    fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::First => Self::First(None),
            AccumulatorOp::Last => Self::Last(Bson::Null),
            _ => Self::Values(Vec::new()),
        }
    }

    fn push(&mut self, op: AccumulatorOp, value: Bson) {
        match self {
            Self::First(slot @ None) => *slot = Some(missing_as_null(value)),
            Self::First(Some(_)) => {}
            Self::Last(slot) => *slot = missing_as_null(value),
            Self::Values(values) => {
                if matches!(value, Bson::Undefined) {
                    return;
                }
                if op == AccumulatorOp::AddToSet && values.iter().any(|v| values_equal(v, &value)) {
                    return;
                }
                values.push(value);
            }
        }
    }

    fn finish(self, op: AccumulatorOp) -> EvalResult<Bson> {
        match self {
            Self::First(value) => Ok(value.unwrap_or(Bson::Null)),
            Self::Last(value) => Ok(value),
            Self::Values(values) => match op {
                AccumulatorOp::Sum => sum_values(values.iter()),
                AccumulatorOp::Avg => avg_values(values.iter()),
                AccumulatorOp::Min => Ok(extreme_value(values.iter(), Ordering::Less)),
                AccumulatorOp::Max => Ok(extreme_value(values.iter(), Ordering::Greater)),
                _ => Ok(Bson::Array(values)),
            },
        }
    }
}

fn group(id: &AstExpr, fields: &[(SmolStr, Accumulator)], documents: Vec<Document>) -> EvalResult<Vec<Document>> {
    let mut groups: Vec<(Bson, Vec<AccumulatorState>)> = Vec::new();
    for document in &documents {
        let key = missing_as_null(evaluate(id, document)?);
        let position = match groups.iter().position(|(existing, _)| values_equal(existing, &key)) {
            Some(position) => position,
            None => {
                let states = fields.iter().map(|(_, acc)| AccumulatorState::new(acc.op)).collect();
                groups.push((key, states));
                groups.len() - 1
            }
        };
        for ((_, acc), state) in fields.iter().zip(groups[position].1.iter_mut()) {
            let value = evaluate(&acc.argument, document)?;
            state.push(acc.op, value);
        }
    }
    groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = Document::with_capacity(fields.len() + 1);
            out.insert("_id", key);
            for ((name, acc), state) in fields.iter().zip(states) {
                out.insert(name.as_str(), state.finish(acc.op)?);
            }
            Ok(out)
        })
        .collect()
}

fn sort_key(document: &Document, path: &str) -> Bson {
    document.get_path(path).cloned().unwrap_or(Bson::Null)
}

fn compare_by_sort(sort: &[SortField], a: &Document, b: &Document) -> Ordering {
    for field in sort {
        let ordering = sort_key(a, &field.path).canonical_cmp(&sort_key(b, &field.path));
        let ordering = match field.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn unwind(path: &str, preserve: bool, documents: Vec<Document>) -> Vec<Document> {
    let mut out = Vec::with_capacity(documents.len());
    for document in documents {
        match document.get_path(path).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = document.clone();
                    set_path(&mut copy, path, item);
                    out.push(copy);
                }
            }
            Some(Bson::Array(_)) => {
                if preserve {
                    let mut copy = document;
                    remove_path(&mut copy, path);
                    out.push(copy);
                }
            }
            None | Some(Bson::Null) | Some(Bson::Undefined) => {
                if preserve {
                    out.push(document);
                }
            }
            Some(_) => out.push(document),
        }
    }
    out
}

fn set_window_fields(spec: &SetWindowFields, documents: Vec<Document>) -> EvalResult<Vec<Document>> {
    let mut keyed = Vec::with_capacity(documents.len());
    for document in documents {
        let partition = match &spec.partition_by {
            Some(expr) => missing_as_null(evaluate(expr, &document)?),
            None => Bson::Null,
        };
        keyed.push((partition, document));
    }
    keyed.sort_by(|(pa, a), (pb, b)| pa.canonical_cmp(pb).then_with(|| compare_by_sort(&spec.sort_by, a, b)));

    let mut out = Vec::with_capacity(keyed.len());
    let mut start = 0;
    while start < keyed.len() {
        let end = keyed[start..]
            .iter()
            .position(|(key, _)| !values_equal(key, &keyed[start].0))
            .map_or(keyed.len(), |offset| start + offset);
        let partition: Vec<Document> = keyed[start..end].iter().map(|(_, doc)| doc.clone()).collect();
        let mut outputs: Vec<Vec<Bson>> = Vec::with_capacity(spec.output.len());
        for (_, field) in &spec.output {
            outputs.push(window_values(spec, field, &partition)?);
        }
        for (index, mut document) in partition.into_iter().enumerate() {
            for ((name, _), values) in spec.output.iter().zip(&outputs) {
                set_path(&mut document, name, values[index].clone());
            }
            out.push(document);
        }
        start = end;
    }
    Ok(out)
}

fn window_values(spec: &SetWindowFields, field: &WindowField, partition: &[Document]) -> EvalResult<Vec<Bson>> {
    let operator = field.operator.operator();
    let len = partition.len();
    match &field.operator {
        WindowOperator::DocumentNumber => Ok((1..=len).map(count_value).collect()),
        WindowOperator::Rank | WindowOperator::DenseRank => {
            let dense = matches!(field.operator, WindowOperator::DenseRank);
            let mut ranks = Vec::with_capacity(len);
            let mut rank = 0usize;
            for index in 0..len {
                let tied = index > 0 && compare_by_sort(&spec.sort_by, &partition[index - 1], &partition[index]) == Ordering::Equal;
                if !tied {
                    rank = if dense { rank + 1 } else { index + 1 };
                }
                ranks.push(count_value(rank));
            }
            Ok(ranks)
        }
        WindowOperator::Shift { by, default } => {
            let values = argument_values(operator, field, partition)?;
            let fallback = default.clone().unwrap_or(Bson::Null);
            Ok((0..len)
                .map(|index| {
                    let target = index as i64 + by;
                    usize::try_from(target)
                        .ok()
                        .and_then(|t| values.get(t))
                        .map_or_else(|| fallback.clone(), |v| missing_as_null(v.clone()))
                })
                .collect())
        }
        WindowOperator::Sum
        | WindowOperator::Avg
        | WindowOperator::Min
        | WindowOperator::Max
        | WindowOperator::First
        | WindowOperator::Last => {
            let values = argument_values(operator, field, partition)?;
            let mut out = Vec::with_capacity(len);
            for index in 0..len {
                let (lower, upper) = window_range(spec, field.window.as_ref(), partition, index)?;
                let frame = values.get(lower..upper).unwrap_or(&[]);
                out.push(match field.operator {
                    WindowOperator::Sum => sum_values(frame.iter())?,
                    WindowOperator::Avg => avg_values(frame.iter())?,
                    WindowOperator::Min => extreme_value(frame.iter(), Ordering::Less),
                    WindowOperator::Max => extreme_value(frame.iter(), Ordering::Greater),
                    WindowOperator::First => frame.first().cloned().map_or(Bson::Null, missing_as_null),
                    _ => frame.last().cloned().map_or(Bson::Null, missing_as_null),
                });
            }
            Ok(out)
        }
    }
}

fn argument_values(operator: &'static str, field: &WindowField, partition: &[Document]) -> EvalResult<Vec<Bson>> {
    let argument = field
        .argument
        .as_ref()
        .ok_or_else(|| EvalError::invalid(operator, "requires an argument"))?;
    partition.iter().map(|document| evaluate(argument, document)).collect()
}

/// Half-open index range of the window around `index`.
fn window_range(spec: &SetWindowFields, window: Option<&WindowBounds>, partition: &[Document], index: usize) -> EvalResult<(usize, usize)> {
    let len = partition.len();
    match window {
        None => Ok((0, len)),
        Some(WindowBounds::Documents(lower, upper)) => {
            let position = |bound: &WindowBound, unbounded: i64| -> EvalResult<i64> {
                Ok(match bound {
                    WindowBound::Unbounded => unbounded,
                    WindowBound::Current => index as i64,
                    WindowBound::Offset(offset) => index as i64 + int_arg("documents", offset)?,
                })
            };
            let lo = position(lower, 0)?.clamp(0, len as i64);
            let hi = (position(upper, len as i64 - 1)? + 1).clamp(0, len as i64);
            Ok((lo as usize, hi.max(lo) as usize))
        }
        Some(WindowBounds::Range(lower, upper)) => {
            let Some(sort) = spec.sort_by.first() else {
                return Err(EvalError::invalid("range", "a range window requires a sortBy field"));
            };
            let keys: Vec<f64> = partition
                .iter()
                .map(|doc| {
                    sort_key(doc, &sort.path)
                        .to_f64_lossy()
                        .ok_or_else(|| EvalError::invalid("range", "sortBy values must be numeric"))
                })
                .collect::<EvalResult<_>>()?;
            let current = keys[index];
            let limit = |bound: &WindowBound, unbounded: f64| -> EvalResult<f64> {
                Ok(match bound {
                    WindowBound::Unbounded => unbounded,
                    WindowBound::Current => current,
                    WindowBound::Offset(offset) => current + number("range", offset)?,
                })
            };
            let (lo, hi) = (limit(lower, f64::NEG_INFINITY)?, limit(upper, f64::INFINITY)?);
            let first = keys.iter().position(|k| *k >= lo).unwrap_or(len);
            let last = keys.iter().rposition(|k| *k <= hi).map_or(0, |p| p + 1);
            Ok((first, last.max(first)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstExpr as E;
    use lodestar_bson::{array, doc};
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    fn run(pipeline: &Arc<AstPipeline>, docs: Vec<Document>) -> Vec<Document> {
        run_pipeline(pipeline, docs, &Collections::new()).unwrap()
    }

    #[test]
    fn test_field_path_over_array_maps_elements() {
        let document = doc! { "items" => array![doc! { "n" => 1 }, doc! { "m" => 2 }, doc! { "n" => 3 }] };
        assert_eq!(evaluate(&E::field("items.n"), &document).unwrap(), array![1, 3]);
        assert_eq!(evaluate(&E::field("missing"), &document).unwrap(), Bson::Undefined);
    }

    #[test]
    fn test_inner_variable_shadows_nothing_outer() {
        // Outer and element documents both carry `Value`; `$Value` must keep
        // meaning the outer one inside `$map`.
        let document = doc! {
            "Value" => 2,
            "Children" => array![doc! { "Value" => 1 }, doc! { "Value" => 2 }],
        };
        let body = E::binary(AstBinaryOp::Eq, E::get_field(E::var("b"), "Value"), E::field("Value"));
        let expr = E::unary(AstUnaryOp::AnyElementTrue, E::map(E::field("Children"), "b", body));
        assert_eq!(evaluate(&expr, &document).unwrap(), Bson::Boolean(true));

        let other = doc! { "Value" => 5, "Children" => array![doc! { "Value" => 1 }] };
        assert_eq!(evaluate(&expr, &other).unwrap(), Bson::Boolean(false));
    }

    #[test]
    fn test_reduce_binds_this_and_value() {
        let expr = E::reduce(
            E::constant(array![1, 2, 3]),
            E::constant(0),
            E::nary(AstNaryOp::Add, [E::var("value"), E::var("this")]),
        );
        assert_eq!(evaluate(&expr, &Document::new()).unwrap(), Bson::Int32(6));
    }

    #[test]
    fn test_let_rebinding_is_visible_in_body_only() {
        let expr = E::let_([("x", E::constant(10))], E::nary(AstNaryOp::Add, [E::var("x"), E::constant(1)]));
        assert_eq!(evaluate(&expr, &Document::new()).unwrap(), Bson::Int32(11));
        assert_eq!(
            evaluate(&E::var("x"), &Document::new()).unwrap_err(),
            EvalError::UnknownVariable(SmolStr::new("x"))
        );
    }

    #[test]
    fn test_arithmetic_widens() {
        let add = |a: Bson, b: Bson| evaluate(&E::nary(AstNaryOp::Add, [E::constant(a), E::constant(b)]), &Document::new()).unwrap();
        assert_eq!(add(Bson::Int32(1), Bson::Int32(2)), Bson::Int32(3));
        assert_eq!(add(Bson::Int32(i32::MAX), Bson::Int32(1)), Bson::Int64(i64::from(i32::MAX) + 1));
        assert_eq!(add(Bson::Int64(1), Bson::Double(0.5)), Bson::Double(1.5));
        assert_eq!(add(Bson::Int32(1), Bson::Null), Bson::Null);

        let divide = E::binary(AstBinaryOp::Divide, E::constant(7), E::constant(2));
        assert_eq!(evaluate(&divide, &Document::new()).unwrap(), Bson::Double(3.5));
        let by_zero = E::binary(AstBinaryOp::Divide, E::constant(7), E::constant(0));
        assert!(matches!(evaluate(&by_zero, &Document::new()), Err(EvalError::InvalidArgument { .. })));
    }

    #[test]
    fn test_missing_is_not_null_in_expressions() {
        let expr = E::binary(AstBinaryOp::Eq, E::field("absent"), E::constant(Bson::Null));
        assert_eq!(evaluate(&expr, &Document::new()).unwrap(), Bson::Boolean(false));
        let coalesce = E::binary(AstBinaryOp::IfNull, E::field("absent"), E::constant("x"));
        assert_eq!(evaluate(&coalesce, &Document::new()).unwrap(), Bson::from("x"));
    }

    #[test]
    fn test_string_operators() {
        let document = doc! { "s" => "  Hello  " };
        let trimmed = E::unary(AstUnaryOp::Trim, E::field("s"));
        assert_eq!(evaluate(&trimmed, &document).unwrap(), Bson::from("Hello"));
        let upper = E::unary(AstUnaryOp::ToUpper, trimmed.clone());
        assert_eq!(evaluate(&upper, &document).unwrap(), Bson::from("HELLO"));
        let index = E::binary(AstBinaryOp::IndexOfCP, trimmed.clone(), E::constant("llo"));
        assert_eq!(evaluate(&index, &document).unwrap(), Bson::Int32(2));
        let sub = E::nary(AstNaryOp::SubstrCP, [trimmed.clone(), E::constant(1), E::constant(3)]);
        assert_eq!(evaluate(&sub, &document).unwrap(), Bson::from("ell"));
        let re = E::regex_match(trimmed, "^h", "i");
        assert_eq!(evaluate(&re, &document).unwrap(), Bson::Boolean(true));
    }

    #[test]
    fn test_filter_equality_traverses_arrays() {
        let document = doc! { "tags" => array!["a", "b"], "n" => 5 };
        assert!(matches(&AstFilter::field("tags", AstFieldOp::Eq(Bson::from("b"))), &document).unwrap());
        assert!(matches(&AstFilter::field("gone", AstFieldOp::Eq(Bson::Null)), &document).unwrap());
        assert!(!matches(&AstFilter::field("n", AstFieldOp::Eq(Bson::Null)), &document).unwrap());
        assert!(matches(&AstFilter::field("n", AstFieldOp::Eq(Bson::Double(5.0))), &document).unwrap());
    }

    #[test]
    fn test_filter_comparisons_are_type_bracketed() {
        let document = doc! { "n" => "10" };
        assert!(!matches(&AstFilter::field("n", AstFieldOp::Gt(Bson::Int32(3))), &document).unwrap());
        let numeric = doc! { "n" => 10 };
        assert!(matches(&AstFilter::field("n", AstFieldOp::Gt(Bson::Int32(3))), &numeric).unwrap());
    }

    #[test]
    fn test_filter_elem_match_and_size() {
        let document = doc! { "scores" => array![1, 7], "kids" => array![doc! { "age" => 4 }] };
        let scalar = AstFilter::field(
            "scores",
            AstFieldOp::ElemMatch(AstFilter::field("", AstFieldOp::Gt(Bson::Int32(5)))),
        );
        assert!(matches(&scalar, &document).unwrap());
        let nested = AstFilter::field(
            "kids",
            AstFieldOp::ElemMatch(AstFilter::field("age", AstFieldOp::Lt(Bson::Int32(3)))),
        );
        assert!(!matches(&nested, &document).unwrap());
        assert!(matches(&AstFilter::field("scores", AstFieldOp::Size(2)), &document).unwrap());
        let not_empty = AstFilter::Field {
            path: SmolStr::new("scores"),
            ops: smallvec![AstFieldOp::Ne(Bson::Null), AstFieldOp::Not(Box::new(AstFieldOp::Size(0)))],
        };
        assert!(matches(&not_empty, &document).unwrap());
        assert!(!matches(&not_empty, &doc! { "scores" => array![] }).unwrap());
    }

    #[test]
    fn test_filter_in_exists_and_regex() {
        let document = doc! { "name" => "Alice" };
        let listed = AstFieldOp::In(vec![Bson::from("Bob"), Bson::from("Alice")]);
        assert!(matches(&AstFilter::field("name", listed), &document).unwrap());
        assert!(!matches(&AstFilter::field("age", AstFieldOp::Exists(true)), &document).unwrap());
        let regex = AstFieldOp::Regex(Regex::new("^al", "i"));
        assert!(matches(&AstFilter::field("name", regex), &document).unwrap());
    }

    #[test]
    fn test_match_sort_skip_limit() {
        let pipeline = AstPipeline::empty()
            .push(AstStage::Match(AstFilter::field("n", AstFieldOp::Gte(Bson::Int32(2)))))
            .push(AstStage::Sort(vec![SortField::descending("n")]))
            .push(AstStage::Skip(1))
            .push(AstStage::Limit(1));
        let docs = vec![doc! { "n" => 1 }, doc! { "n" => 4 }, doc! { "n" => 3 }, doc! { "n" => 2 }];
        assert_eq!(run(&pipeline, docs), vec![doc! { "n" => 3 }]);
    }

    #[test]
    fn test_project_inclusion_and_computed() {
        let pipeline = AstPipeline::empty().push(AstStage::Project(vec![
            (SmolStr::new("a"), ProjectField::Include),
            (SmolStr::new("twice"), ProjectField::Computed(E::nary(AstNaryOp::Multiply, [E::field("a"), E::constant(2)]))),
            (SmolStr::new("gone"), ProjectField::Computed(E::field("nope"))),
        ]));
        let out = run(&pipeline, vec![doc! { "_id" => 1, "a" => 3, "b" => 4 }]);
        assert_eq!(out, vec![doc! { "_id" => 1, "a" => 3, "twice" => 6 }]);

        let exclude = AstPipeline::empty().push(AstStage::Project(vec![(SmolStr::new("_id"), ProjectField::Exclude)]));
        assert_eq!(run(&exclude, vec![doc! { "_id" => 1, "a" => 3 }]), vec![doc! { "a" => 3 }]);
    }

    #[test]
    fn test_group_accumulators() {
        let pipeline = AstPipeline::empty().push(AstStage::Group {
            id: E::field("k"),
            fields: vec![
                (SmolStr::new("total"), Accumulator::new(AccumulatorOp::Sum, E::field("v"))),
                (SmolStr::new("mean"), Accumulator::new(AccumulatorOp::Avg, E::field("v"))),
                (SmolStr::new("all"), Accumulator::new(AccumulatorOp::Push, E::field("v"))),
                (SmolStr::new("n"), Accumulator::new(AccumulatorOp::Sum, E::constant(1))),
            ],
        });
        let docs = vec![doc! { "k" => "a", "v" => 1 }, doc! { "k" => "b", "v" => 5 }, doc! { "k" => "a", "v" => 3 }];
        assert_eq!(
            run(&pipeline, docs),
            vec![
                doc! { "_id" => "a", "total" => 4, "mean" => 2.0, "all" => array![1, 3], "n" => 2 },
                doc! { "_id" => "b", "total" => 5, "mean" => 5.0, "all" => array![5], "n" => 1 },
            ]
        );
    }

    #[test]
    fn test_unwind_and_count() {
        let unwind = AstPipeline::empty().push(AstStage::Unwind {
            path: SmolStr::new("xs"),
            preserve_null_and_empty_arrays: false,
        });
        let docs = vec![doc! { "xs" => array![1, 2] }, doc! { "xs" => array![] }, doc! { "y" => 1 }];
        assert_eq!(run(&unwind, docs.clone()), vec![doc! { "xs" => 1 }, doc! { "xs" => 2 }]);

        let preserving = AstPipeline::empty().push(AstStage::Unwind {
            path: SmolStr::new("xs"),
            preserve_null_and_empty_arrays: true,
        });
        assert_eq!(run(&preserving, docs).len(), 4);

        let count = AstPipeline::empty().push(AstStage::Count(SmolStr::new("_v")));
        assert_eq!(run(&count, vec![doc! {}, doc! {}]), vec![doc! { "_v" => 2 }]);
        assert!(run(&count, Vec::new()).is_empty());
    }

    #[test]
    fn test_lookup_and_union_with() {
        let collections = Collections::new()
            .with("owners", vec![doc! { "_id" => 1, "name" => "Ann" }, doc! { "_id" => 2, "name" => "Bo" }])
            .with("extra", vec![doc! { "pet" => "Rex" }]);
        let pipeline = AstPipeline::empty()
            .push(AstStage::Lookup {
                from: SmolStr::new("owners"),
                local_field: SmolStr::new("owner"),
                foreign_field: SmolStr::new("_id"),
                as_field: SmolStr::new("joined"),
            })
            .push(AstStage::UnionWith {
                collection: SmolStr::new("extra"),
                pipeline: AstPipeline::empty(),
            });
        let out = run_pipeline(&pipeline, vec![doc! { "pet" => "Tom", "owner" => 2 }], &collections).unwrap();
        assert_eq!(
            out,
            vec![
                doc! { "pet" => "Tom", "owner" => 2, "joined" => array![doc! { "_id" => 2, "name" => "Bo" }] },
                doc! { "pet" => "Rex" },
            ]
        );

        let missing = AstPipeline::empty().push(AstStage::UnionWith {
            collection: SmolStr::new("nowhere"),
            pipeline: AstPipeline::empty(),
        });
        assert_eq!(
            run_pipeline(&missing, Vec::new(), &collections).unwrap_err(),
            EvalError::UnknownCollection(SmolStr::new("nowhere"))
        );
    }

    #[test]
    fn test_window_fields() {
        let spec = SetWindowFields::new()
            .partition_by(E::field("g"))
            .sort_by(SortField::ascending("t"))
            .output("n", WindowField::new(WindowOperator::DocumentNumber))
            .output("rank", WindowField::new(WindowOperator::Rank))
            .output(
                "running",
                WindowField::new(WindowOperator::Sum)
                    .argument(E::field("v"))
                    .window(WindowBounds::Documents(WindowBound::Unbounded, WindowBound::Current)),
            )
            .output(
                "prev",
                WindowField::new(WindowOperator::Shift { by: -1, default: Some(Bson::Int32(0)) }).argument(E::field("v")),
            );
        let pipeline = AstPipeline::empty().push(AstStage::SetWindowFields(spec));
        let docs = vec![
            doc! { "g" => "a", "t" => 2, "v" => 10 },
            doc! { "g" => "b", "t" => 1, "v" => 7 },
            doc! { "g" => "a", "t" => 1, "v" => 5 },
            doc! { "g" => "a", "t" => 2, "v" => 1 },
        ];
        assert_eq!(
            run(&pipeline, docs),
            vec![
                doc! { "g" => "a", "t" => 1, "v" => 5, "n" => 1, "rank" => 1, "running" => 5, "prev" => 0 },
                doc! { "g" => "a", "t" => 2, "v" => 10, "n" => 2, "rank" => 2, "running" => 15, "prev" => 5 },
                doc! { "g" => "a", "t" => 2, "v" => 1, "n" => 3, "rank" => 2, "running" => 16, "prev" => 10 },
                doc! { "g" => "b", "t" => 1, "v" => 7, "n" => 1, "rank" => 1, "running" => 7, "prev" => 0 },
            ]
        );
    }

    #[test]
    fn test_range_window_uses_sort_values() {
        let spec = SetWindowFields::new().sort_by(SortField::ascending("t")).output(
            "near",
            WindowField::new(WindowOperator::Sum)
                .argument(E::field("v"))
                .window(WindowBounds::Range(WindowBound::offset(-1), WindowBound::Current)),
        );
        let pipeline = AstPipeline::empty().push(AstStage::SetWindowFields(spec));
        let docs = vec![doc! { "t" => 1, "v" => 1 }, doc! { "t" => 2, "v" => 2 }, doc! { "t" => 5, "v" => 4 }];
        let near: Vec<Bson> = run(&pipeline, docs).iter().map(|d| d.get("near").cloned().unwrap()).collect();
        assert_eq!(near, vec![Bson::Int32(1), Bson::Int32(3), Bson::Int32(4)]);
    }
}
