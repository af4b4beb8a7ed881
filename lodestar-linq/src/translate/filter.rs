//! Predicates in `$match` position.
//!
//! A predicate becomes a field filter when every comparison it makes is
//! between a field of the current document and a constant. Anything else
//! is wrapped in `$expr` and evaluated as an aggregation expression.

use std::sync::Arc;

use lodestar_bson::serialization::{NativeValue, TypeRef};
use lodestar_bson::{Bson, Regex};
use tracing::trace;

use super::context::{Symbol, TranslationContext};
use super::expression::{Translated, array_input, lambda_parts, serialize_like, translate_expr};
use super::methods::string_pattern;
use crate::ast::{AstExpr, AstFieldOp, AstFilter, AstUnaryOp};
use crate::error::{TranslationError, TranslationResult};
use crate::expression::{BinaryOperator, CallTarget, Expr, UnaryOperator};

/// What field paths are relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterScope {
    /// A pipeline document; the document itself cannot be matched.
    Document,
    /// An array element inside `$elemMatch`, which may be a scalar.
    Element,
}

/// Translate a predicate over the documents of the current stage.
pub fn translate_filter(ctx: &TranslationContext<'_>, expr: &Expr) -> TranslationResult<Arc<AstFilter>> {
    translate_in_scope(ctx, expr, FilterScope::Document)
}

fn translate_in_scope(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    scope: FilterScope,
) -> TranslationResult<Arc<AstFilter>> {
    match expr {
        Expr::Constant(NativeValue::Bool(true)) => Ok(AstFilter::matches_all()),
        Expr::Constant(NativeValue::Bool(false)) => Ok(AstFilter::expr(AstExpr::constant(false))),
        Expr::Binary {
            op: BinaryOperator::AndAlso,
            left,
            right,
        } => Ok(AstFilter::and([
            translate_in_scope(ctx, left, scope)?,
            translate_in_scope(ctx, right, scope)?,
        ])),
        Expr::Binary {
            op: BinaryOperator::OrElse,
            left,
            right,
        } => Ok(AstFilter::or([
            translate_in_scope(ctx, left, scope)?,
            translate_in_scope(ctx, right, scope)?,
        ])),
        Expr::Binary { op, left, right } if op.is_comparison() => {
            translate_comparison(ctx, expr, *op, left, right, scope)
        }
        Expr::Unary {
            op: UnaryOperator::Not,
            operand,
        } => Ok(AstFilter::not(translate_in_scope(ctx, operand, scope)?)),
        Expr::Member { target, name } if name == "HasValue" => {
            let target = translate_expr(ctx, target)?;
            match path_in_scope(&target, scope) {
                Some(path) if matches!(target.value_type(), TypeRef::Nullable(_)) => {
                    Ok(AstFilter::field(path, AstFieldOp::Ne(Bson::Null)))
                }
                _ => translate_as_expr(ctx, expr, scope),
            }
        }
        Expr::Call {
            target: CallTarget::Instance(target),
            method,
            arguments,
        } => translate_call(ctx, expr, target, method, arguments, scope),
        Expr::Call {
            target: CallTarget::Static(type_name),
            method,
            arguments,
        } if type_name == "String" && method == "IsNullOrEmpty" && arguments.len() == 1 => {
            let value = translate_expr(ctx, &arguments[0])?;
            match path_in_scope(&value, scope) {
                Some(path) => Ok(AstFilter::field(
                    path,
                    AstFieldOp::In(vec![Bson::Null, Bson::String(String::new())]),
                )),
                None => translate_as_expr(ctx, expr, scope),
            }
        }
        _ => translate_as_expr(ctx, expr, scope),
    }
}

/// The path of a translated value relative to the scope, if it is one.
fn path_in_scope(value: &Translated, scope: FilterScope) -> Option<String> {
    let path = value.ast.current_path()?;
    if path.is_empty() && scope == FilterScope::Document {
        return None;
    }
    Some(path)
}

fn field_op(op: BinaryOperator, value: Bson) -> Option<AstFieldOp> {
    Some(match op {
        BinaryOperator::Equal => AstFieldOp::Eq(value),
        BinaryOperator::NotEqual => AstFieldOp::Ne(value),
        BinaryOperator::GreaterThan => AstFieldOp::Gt(value),
        BinaryOperator::GreaterThanOrEqual => AstFieldOp::Gte(value),
        BinaryOperator::LessThan => AstFieldOp::Lt(value),
        BinaryOperator::LessThanOrEqual => AstFieldOp::Lte(value),
        _ => return None,
    })
}

fn translate_comparison(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    op: BinaryOperator,
    left: &Expr,
    right: &Expr,
    scope: FilterScope,
) -> TranslationResult<Arc<AstFilter>> {
    let (field, constant, op) = match (left, right) {
        (Expr::Constant(_), Expr::Constant(_)) => return translate_as_expr(ctx, expr, scope),
        (field, Expr::Constant(constant)) => (field, constant, op),
        (Expr::Constant(constant), field) => (field, constant, op.flipped()),
        _ => return translate_as_expr(ctx, expr, scope),
    };
    let field = translate_expr(ctx, field)?;

    // `a.Count() == n` on a stored array.
    if let (AstExpr::Unary { op: AstUnaryOp::Size, arg }, BinaryOperator::Equal) = (&*field.ast, op) {
        let size = match constant {
            NativeValue::Int32(n) => Some(i64::from(*n)),
            NativeValue::Int64(n) => Some(*n),
            _ => None,
        };
        if let (Some(path), Some(size)) = (arg.current_path().filter(|p| !p.is_empty()), size) {
            return Ok(AstFilter::field(path, AstFieldOp::Size(size)));
        }
    }

    let Some(path) = path_in_scope(&field, scope) else {
        return translate_as_expr(ctx, expr, scope);
    };
    let value = serialize_like(ctx, constant, &field.serializer)?;
    match field_op(op, value) {
        Some(op) => Ok(AstFilter::field(path, op)),
        None => translate_as_expr(ctx, expr, scope),
    }
}

fn translate_call(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    target: &Expr,
    method: &str,
    arguments: &[Expr],
    scope: FilterScope,
) -> TranslationResult<Arc<AstFilter>> {
    match (method, arguments) {
        ("Equals", [other]) => translate_comparison(ctx, expr, BinaryOperator::Equal, target, other, scope),
        ("Contains", [value]) => {
            if let Expr::Constant(NativeValue::Collection { items, .. }) = target {
                let field = translate_expr(ctx, value)?;
                let Some(path) = path_in_scope(&field, scope) else {
                    return translate_as_expr(ctx, expr, scope);
                };
                let values = items
                    .iter()
                    .map(|item| serialize_like(ctx, item, &field.serializer))
                    .collect::<TranslationResult<Vec<_>>>()?;
                return Ok(AstFilter::field(path, AstFieldOp::In(values)));
            }
            let Expr::Constant(constant) = value else {
                return translate_as_expr(ctx, expr, scope);
            };
            let field = translate_expr(ctx, target)?;
            let Some(path) = path_in_scope(&field, scope) else {
                return translate_as_expr(ctx, expr, scope);
            };
            if let (TypeRef::String, NativeValue::String(text)) = (field.value_type().underlying(), constant) {
                return Ok(regex_filter(path, method, text));
            }
            match array_input(&field) {
                Some((_, item)) => Ok(AstFilter::field(
                    path,
                    AstFieldOp::Eq(serialize_like(ctx, constant, &item)?),
                )),
                None => translate_as_expr(ctx, expr, scope),
            }
        }
        ("StartsWith" | "EndsWith", [Expr::Constant(NativeValue::String(text))]) => {
            let field = translate_expr(ctx, target)?;
            match path_in_scope(&field, scope) {
                Some(path) if field.value_type().underlying() == &TypeRef::String => {
                    Ok(regex_filter(path, method, text))
                }
                _ => translate_as_expr(ctx, expr, scope),
            }
        }
        ("Any", []) => {
            let field = translate_expr(ctx, target)?;
            match path_in_scope(&field, scope).filter(|p| !p.is_empty()) {
                Some(path) if array_input(&field).is_some() => Ok(AstFilter::and([
                    AstFilter::field(path.clone(), AstFieldOp::Ne(Bson::Null)),
                    AstFilter::field(path, AstFieldOp::Not(Box::new(AstFieldOp::Size(0)))),
                ])),
                _ => translate_as_expr(ctx, expr, scope),
            }
        }
        ("Any", [predicate]) => translate_elem_match(ctx, expr, target, predicate, scope),
        _ => translate_as_expr(ctx, expr, scope),
    }
}

fn regex_filter(path: String, method: &str, text: &str) -> Arc<AstFilter> {
    AstFilter::field(path, AstFieldOp::Regex(Regex::new(string_pattern(method, text), "")))
}

/// `a.Items.Any(x => ...)` as `$elemMatch` when the predicate only looks at
/// the element and every part of it has a field-filter form.
fn translate_elem_match(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    target: &Expr,
    predicate: &Expr,
    scope: FilterScope,
) -> TranslationResult<Arc<AstFilter>> {
    let (parameters, body) = lambda_parts(predicate, 1)?;
    let parameter = &parameters[0];
    if body.references_outside(std::slice::from_ref(&parameter.name)) {
        trace!(expression = %expr, "predicate refers to an enclosing parameter");
        return translate_as_expr(ctx, expr, scope);
    }
    let array = translate_expr(ctx, target)?;
    let (Some(path), Some((_, item))) = (
        path_in_scope(&array, scope).filter(|p| !p.is_empty()),
        array_input(&array),
    ) else {
        return translate_as_expr(ctx, expr, scope);
    };
    let element = ctx.for_stage(Symbol::current(parameter.name.clone(), item));
    let inner = translate_in_scope(&element, body, FilterScope::Element)?;
    if contains_expr(&inner) {
        trace!(expression = %expr, "element predicate needs $expr");
        return translate_as_expr(ctx, expr, scope);
    }
    if let AstFilter::Field { path: inner_path, ops } = &*inner {
        if let ([op], true) = (ops.as_slice(), inner_path.is_empty()) {
            if matches_any_element(op) {
                return Ok(AstFilter::field(path, op.clone()));
            }
        }
    } else if has_bare_element(&inner) {
        // `$or`/`$and`/`$nor` only take documents keyed by field names.
        trace!(expression = %expr, "compound scalar predicate needs $expr");
        return translate_as_expr(ctx, expr, scope);
    }
    Ok(AstFilter::field(path, AstFieldOp::ElemMatch(inner)))
}

/// Operators that already mean "some element matches" when applied to an
/// array field.
fn matches_any_element(op: &AstFieldOp) -> bool {
    match op {
        AstFieldOp::Eq(value) => !value.is_null(),
        AstFieldOp::In(values) => !values.iter().any(Bson::is_null),
        AstFieldOp::Gt(_) | AstFieldOp::Gte(_) | AstFieldOp::Lt(_) | AstFieldOp::Lte(_) | AstFieldOp::Regex(_) => true,
        _ => false,
    }
}

/// Whether a logical node holds an operator on the element itself.
fn has_bare_element(filter: &AstFilter) -> bool {
    match filter {
        AstFilter::Field { path, .. } => path.is_empty(),
        AstFilter::And(children) | AstFilter::Or(children) | AstFilter::Nor(children) => {
            children.iter().any(|c| has_bare_element(c))
        }
        AstFilter::Expr(_) => false,
    }
}

fn contains_expr(filter: &AstFilter) -> bool {
    match filter {
        AstFilter::Expr(_) => true,
        other => other.children().iter().any(|c| contains_expr(c)),
    }
}

/// The predicate as an aggregation expression inside `$expr`.
fn translate_as_expr(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    scope: FilterScope,
) -> TranslationResult<Arc<AstFilter>> {
    let value = translate_expr(ctx, expr)?;
    if value.value_type().underlying() != &TypeRef::Bool {
        return Err(TranslationError::not_supported(
            expr,
            format!("a filter must be a boolean, found {}", value.value_type()),
        ));
    }
    if let Some(path) = path_in_scope(&value, scope) {
        return Ok(AstFilter::field(path, AstFieldOp::Eq(Bson::Boolean(true))));
    }
    Ok(AstFilter::expr(value.ast))
}
