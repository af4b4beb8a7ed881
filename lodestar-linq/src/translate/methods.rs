//! Method calls in value position.

use std::sync::Arc;

use lodestar_bson::Bson;
use lodestar_bson::serialization::{NativeValue, SerializerRef, TypeRef};
use smol_str::SmolStr;
use tracing::debug;

use super::context::{Symbol, SymbolTable, TranslationContext};
use super::expression::{
    Translated, array_input, boolean, lambda_parts, list_of, numeric_rank, promoted, serialize_like,
    translate_expr,
};
use crate::ast::{AstBinaryOp, AstExpr, AstNaryOp, AstUnaryOp};
use crate::error::{TranslationError, TranslationResult};
use crate::expression::{CallTarget, Expr};

/// `$reduce` binds the current element here.
const THIS: &str = "this";
/// `$reduce` binds the accumulated value here.
const VALUE: &str = "value";

pub(crate) fn translate_call(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    target: &CallTarget,
    method: &str,
    arguments: &[Expr],
) -> TranslationResult<Translated> {
    match target {
        CallTarget::Static(type_name) => match type_name.as_str() {
            "Math" => translate_math(ctx, expr, method, arguments),
            "String" => translate_string_static(ctx, expr, method, arguments),
            other => Err(TranslationError::not_supported(
                expr,
                format!("no translation for static methods of {}", other),
            )),
        },
        CallTarget::Instance(target) => {
            if let ("Equals", [other]) = (method, arguments) {
                let (left, right) = super::expression::translate_operands(ctx, target, other)?;
                return Ok(Translated::new(
                    AstExpr::binary(AstBinaryOp::Eq, left.ast, right.ast),
                    boolean(ctx)?,
                ));
            }
            let source = translate_expr(ctx, target)?;
            if source.value_type().underlying() == &TypeRef::String {
                return translate_string_method(ctx, expr, source, method, arguments);
            }
            translate_sequence_method(ctx, expr, source, method, arguments)
        }
    }
}

/// A regex matching strings that start with, end with or contain `text`.
pub(crate) fn string_pattern(method: &str, text: &str) -> String {
    let escaped = regex_lite::escape(text);
    match method {
        "StartsWith" => format!("^{}", escaped),
        "EndsWith" => format!("{}$", escaped),
        _ => escaped,
    }
}

fn translate_string_method(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    source: Translated,
    method: &str,
    arguments: &[Expr],
) -> TranslationResult<Translated> {
    let int32 = || ctx.serializer(&TypeRef::Int32);
    let unary = |op: AstUnaryOp, source: Translated| Translated::new(AstExpr::unary(op, source.ast), source.serializer);
    Ok(match (method, arguments) {
        ("ToLower" | "ToLowerInvariant", []) => unary(AstUnaryOp::ToLower, source),
        ("ToUpper" | "ToUpperInvariant", []) => unary(AstUnaryOp::ToUpper, source),
        ("Trim", []) => unary(AstUnaryOp::Trim, source),
        ("Substring", [start]) => {
            let start = translate_expr(ctx, start)?;
            let length = AstExpr::binary(
                AstBinaryOp::Subtract,
                AstExpr::unary(AstUnaryOp::StrLenCP, source.ast.clone()),
                start.ast.clone(),
            );
            Translated::new(
                AstExpr::nary(AstNaryOp::SubstrCP, [source.ast, start.ast, length]),
                source.serializer,
            )
        }
        ("Substring", [start, length]) => {
            let start = translate_expr(ctx, start)?;
            let length = translate_expr(ctx, length)?;
            Translated::new(
                AstExpr::nary(AstNaryOp::SubstrCP, [source.ast, start.ast, length.ast]),
                source.serializer,
            )
        }
        ("StartsWith" | "EndsWith" | "Contains", [Expr::Constant(NativeValue::String(text))]) => Translated::new(
            AstExpr::regex_match(source.ast, string_pattern(method, text), ""),
            boolean(ctx)?,
        ),
        ("StartsWith", [other]) => {
            let other = translate_expr(ctx, other)?;
            Translated::new(
                AstExpr::binary(
                    AstBinaryOp::Eq,
                    AstExpr::binary(AstBinaryOp::IndexOfCP, source.ast, other.ast),
                    AstExpr::constant(0),
                ),
                boolean(ctx)?,
            )
        }
        ("Contains", [other]) => {
            let other = translate_expr(ctx, other)?;
            Translated::new(
                AstExpr::binary(
                    AstBinaryOp::Gte,
                    AstExpr::binary(AstBinaryOp::IndexOfCP, source.ast, other.ast),
                    AstExpr::constant(0),
                ),
                boolean(ctx)?,
            )
        }
        ("IndexOf", [other]) => {
            let other = translate_expr(ctx, other)?;
            Translated::new(AstExpr::binary(AstBinaryOp::IndexOfCP, source.ast, other.ast), int32()?)
        }
        _ => {
            return Err(TranslationError::not_supported(
                expr,
                format!("no translation for string method {}", method),
            ));
        }
    })
}

fn translate_string_static(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    method: &str,
    arguments: &[Expr],
) -> TranslationResult<Translated> {
    match (method, arguments) {
        ("Concat", [_, _, ..]) => {
            let parts = arguments
                .iter()
                .map(|a| translate_expr(ctx, a).map(|t| t.ast))
                .collect::<TranslationResult<Vec<_>>>()?;
            Ok(Translated::new(
                AstExpr::nary(AstNaryOp::Concat, parts),
                ctx.serializer(&TypeRef::String)?,
            ))
        }
        ("IsNullOrEmpty", [value]) => {
            let value = translate_expr(ctx, value)?;
            Ok(Translated::new(
                AstExpr::binary(
                    AstBinaryOp::In,
                    value.ast,
                    AstExpr::array([AstExpr::constant(Bson::Null), AstExpr::constant("")]),
                ),
                boolean(ctx)?,
            ))
        }
        _ => Err(TranslationError::not_supported(
            expr,
            format!("no translation for String.{}", method),
        )),
    }
}

fn translate_math(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    method: &str,
    arguments: &[Expr],
) -> TranslationResult<Translated> {
    let args = arguments
        .iter()
        .map(|a| translate_expr(ctx, a))
        .collect::<TranslationResult<Vec<_>>>()?;
    if let Some(arg) = args.iter().find(|a| numeric_rank(&a.value_type()).is_none()) {
        return Err(TranslationError::not_supported(
            expr,
            format!("Math.{} needs numeric arguments, found {}", method, arg.value_type()),
        ));
    }
    let double = || ctx.serializer(&TypeRef::Double);
    let same = |op: AstUnaryOp, x: &Translated| Translated::new(AstExpr::unary(op, x.ast.clone()), x.serializer.clone());
    Ok(match (method, args.as_slice()) {
        ("Abs", [x]) => same(AstUnaryOp::Abs, x),
        ("Ceiling", [x]) => same(AstUnaryOp::Ceil, x),
        ("Floor", [x]) => same(AstUnaryOp::Floor, x),
        ("Truncate", [x]) => same(AstUnaryOp::Trunc, x),
        ("Round", [x]) => Translated::new(
            AstExpr::binary(AstBinaryOp::Round, x.ast.clone(), AstExpr::constant(0)),
            x.serializer.clone(),
        ),
        ("Round", [x, digits]) => Translated::new(
            AstExpr::binary(AstBinaryOp::Round, x.ast.clone(), digits.ast.clone()),
            x.serializer.clone(),
        ),
        ("Sqrt", [x]) => Translated::new(AstExpr::unary(AstUnaryOp::Sqrt, x.ast.clone()), double()?),
        ("Exp", [x]) => Translated::new(AstExpr::unary(AstUnaryOp::Exp, x.ast.clone()), double()?),
        ("Log10", [x]) => Translated::new(AstExpr::unary(AstUnaryOp::Log10, x.ast.clone()), double()?),
        ("Log", [x]) => Translated::new(AstExpr::unary(AstUnaryOp::Ln, x.ast.clone()), double()?),
        ("Log", [x, base]) => Translated::new(
            AstExpr::binary(AstBinaryOp::Log, x.ast.clone(), base.ast.clone()),
            double()?,
        ),
        ("Pow", [x, y]) => Translated::new(
            AstExpr::binary(AstBinaryOp::Pow, x.ast.clone(), y.ast.clone()),
            double()?,
        ),
        ("Max", [a, b]) => Translated::new(
            AstExpr::nary(AstNaryOp::Max, [a.ast.clone(), b.ast.clone()]),
            promoted(ctx, a, b)?,
        ),
        ("Min", [a, b]) => Translated::new(
            AstExpr::nary(AstNaryOp::Min, [a.ast.clone(), b.ast.clone()]),
            promoted(ctx, a, b)?,
        ),
        _ => {
            return Err(TranslationError::not_supported(
                expr,
                format!("no translation for Math.{} with {} argument(s)", method, arguments.len()),
            ));
        }
    })
}

/// Bind a one-parameter lambda's parameter to a fresh `$map`/`$filter`
/// variable and translate its body.
fn bind_item(
    ctx: &TranslationContext<'_>,
    lambda: &Expr,
    item: &SerializerRef,
) -> TranslationResult<(SmolStr, Translated)> {
    let (parameters, body) = lambda_parts(lambda, 1)?;
    let parameter = &parameters[0];
    let var = ctx.symbols().unique_var_name(&parameter.name);
    let inner = ctx.with_symbol(Symbol::new(parameter.name.clone(), AstExpr::var(var.clone()), item.clone()));
    Ok((var, translate_expr(&inner, body)?))
}

fn translate_sequence_method(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    source: Translated,
    method: &str,
    arguments: &[Expr],
) -> TranslationResult<Translated> {
    let Some((input, item)) = array_input(&source) else {
        return Err(TranslationError::not_supported(
            expr,
            format!("no translation for {} on {}", method, source.value_type()),
        ));
    };
    let int32 = || ctx.serializer(&TypeRef::Int32);
    let filtered = |predicate: &Expr| -> TranslationResult<Arc<AstExpr>> {
        let (var, condition) = bind_item(ctx, predicate, &item)?;
        Ok(AstExpr::filter(input.clone(), var, condition.ast))
    };
    let selected = |selector: &Expr| -> TranslationResult<Translated> {
        let (var, body) = bind_item(ctx, selector, &item)?;
        Ok(Translated::new(AstExpr::map(input.clone(), var, body.ast), body.serializer))
    };
    Ok(match (method, arguments) {
        ("Any", []) => Translated::new(
            AstExpr::binary(
                AstBinaryOp::Gt,
                AstExpr::unary(AstUnaryOp::Size, input),
                AstExpr::constant(0),
            ),
            boolean(ctx)?,
        ),
        ("Any", [predicate]) => quantifier(ctx, expr, input, &item, predicate, true)?,
        ("All", [predicate]) => quantifier(ctx, expr, input, &item, predicate, false)?,
        ("Where", [predicate]) => {
            if input.field_path().is_none() {
                return Err(TranslationError::not_supported(
                    expr,
                    "Where in an expression needs a plain array field as its source",
                ));
            }
            Translated::new(filtered(predicate)?, list_of(item.clone())?)
        }
        ("Select", [selector]) => {
            let mapped = selected(selector)?;
            let serializer = list_of(mapped.serializer)?;
            Translated::new(mapped.ast, serializer)
        }
        ("Count", []) => Translated::new(AstExpr::unary(AstUnaryOp::Size, input), int32()?),
        ("LongCount", []) => Translated::new(
            AstExpr::unary(AstUnaryOp::Size, input),
            ctx.serializer(&TypeRef::Int64)?,
        ),
        ("Count", [predicate]) => Translated::new(AstExpr::unary(AstUnaryOp::Size, filtered(predicate)?), int32()?),
        ("Sum" | "Average" | "Min" | "Max", []) => {
            aggregate_values(ctx, expr, method, Translated::new(input.clone(), item.clone()))?
        }
        ("Sum" | "Average" | "Min" | "Max", [selector]) => aggregate_values(ctx, expr, method, selected(selector)?)?,
        ("First", []) => Translated::new(AstExpr::unary(AstUnaryOp::First, input), item.clone()),
        ("Last", []) => Translated::new(AstExpr::unary(AstUnaryOp::Last, input), item.clone()),
        ("First", [predicate]) => Translated::new(AstExpr::unary(AstUnaryOp::First, filtered(predicate)?), item.clone()),
        ("Last", [predicate]) => Translated::new(AstExpr::unary(AstUnaryOp::Last, filtered(predicate)?), item.clone()),
        ("ElementAt", [index]) => {
            let index = translate_expr(ctx, index)?;
            Translated::new(AstExpr::binary(AstBinaryOp::ArrayElemAt, input, index.ast), item.clone())
        }
        ("Contains", [value]) => {
            let value = match value {
                Expr::Constant(constant) => AstExpr::constant(serialize_like(ctx, constant, &item)?),
                other => translate_expr(ctx, other)?.ast,
            };
            Translated::new(AstExpr::binary(AstBinaryOp::In, value, input), boolean(ctx)?)
        }
        ("Concat", [other]) => {
            let other = translate_expr(ctx, other)?;
            let Some((other_input, _)) = array_input(&other) else {
                return Err(TranslationError::not_supported(expr, "Concat needs two sequences"));
            };
            Translated::new(
                AstExpr::nary(AstNaryOp::ConcatArrays, [input, other_input]),
                list_of(item.clone())?,
            )
        }
        ("Aggregate", [seed, func]) => aggregate(ctx, input, &item, seed, func)?,
        _ => {
            return Err(TranslationError::not_supported(
                expr,
                format!("no translation for method {} with {} argument(s)", method, arguments.len()),
            ));
        }
    })
}

/// `Sum`, `Average`, `Min` and `Max` over an array of values.
fn aggregate_values(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    method: &str,
    values: Translated,
) -> TranslationResult<Translated> {
    let item_type = values.value_type();
    let item = values.serializer.clone();
    let (op, serializer) = match method {
        "Sum" => (AstUnaryOp::Sum, item),
        "Average" if numeric_rank(&item_type) == Some(4) => (AstUnaryOp::Avg, item),
        "Average" => (AstUnaryOp::Avg, ctx.serializer(&TypeRef::Double)?),
        "Min" => (AstUnaryOp::Min, item),
        _ => (AstUnaryOp::Max, item),
    };
    if matches!(op, AstUnaryOp::Sum | AstUnaryOp::Avg) && numeric_rank(&item_type).is_none() {
        return Err(TranslationError::not_supported(
            expr,
            format!("{} needs numeric values, found {}", method, item_type),
        ));
    }
    Ok(Translated::new(AstExpr::unary(op, values.ast), serializer))
}

/// `Any(predicate)` and `All(predicate)`.
///
/// The preferred form folds the predicate with `$reduce`. Inside `$reduce`
/// the element is `$$this`, which shadows any enclosing `$reduce` element,
/// so a predicate that refers to an enclosing parameter is mapped with
/// `$map`, whose `as` variable leaves outer variables visible.
fn quantifier(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    input: Arc<AstExpr>,
    item: &SerializerRef,
    predicate: &Expr,
    any: bool,
) -> TranslationResult<Translated> {
    let (parameters, body) = lambda_parts(predicate, 1)?;
    let parameter = &parameters[0];
    if body.references_outside(std::slice::from_ref(&parameter.name)) {
        debug!(expression = %expr, "predicate refers to an enclosing scope, using $map");
        let (var, condition) = bind_item(ctx, predicate, item)?;
        let op = if any {
            AstUnaryOp::AnyElementTrue
        } else {
            AstUnaryOp::AllElementsTrue
        };
        return Ok(Translated::new(
            AstExpr::unary(op, AstExpr::map(input, var, condition.ast)),
            boolean(ctx)?,
        ));
    }
    let inner = ctx.with_symbol(Symbol::new(parameter.name.clone(), AstExpr::var(THIS), item.clone()));
    let condition = translate_expr(&inner, body)?;
    let accumulated = AstExpr::var(VALUE);
    let folded = if any {
        AstExpr::or([accumulated, condition.ast])
    } else {
        AstExpr::and([accumulated, condition.ast])
    };
    Ok(Translated::new(
        AstExpr::reduce(input, AstExpr::constant(!any), folded),
        boolean(ctx)?,
    ))
}

/// `Aggregate(seed, (acc, x) => ...)` as `$reduce`.
///
/// Enclosing symbols stored in `$$this` or `$$value` are rebound with
/// `$let` first, since `$reduce` rebinds both.
fn aggregate(
    ctx: &TranslationContext<'_>,
    input: Arc<AstExpr>,
    item: &SerializerRef,
    seed: &Expr,
    func: &Expr,
) -> TranslationResult<Translated> {
    let seed = translate_expr(ctx, seed)?;
    let (parameters, body) = lambda_parts(func, 2)?;
    let mut visible: Vec<Symbol> = ctx.symbols().iter().cloned().collect();
    visible.reverse();
    let mut bindings: Vec<(SmolStr, Arc<AstExpr>)> = Vec::new();
    let mut table = SymbolTable::new();
    for mut symbol in visible {
        let captured = symbol.ast.references_var(THIS) || symbol.ast.references_var(VALUE);
        let shadowed = parameters.iter().any(|p| p.name == symbol.name);
        if captured && !shadowed && body.references(&symbol.name) {
            let mut var = ctx.symbols().unique_var_name(&symbol.name);
            let mut attempt = 1;
            while bindings.iter().any(|(name, _)| *name == var) {
                var = ctx.symbols().unique_var_name(&format!("{}{}", symbol.name, attempt));
                attempt += 1;
            }
            bindings.push((var.clone(), symbol.ast.clone()));
            symbol.ast = AstExpr::var(var);
            symbol.is_current = false;
        }
        table = table.with_symbol(symbol);
    }
    let inner = ctx
        .with_symbols(table)
        .with_symbol(Symbol::new(parameters[0].name.clone(), AstExpr::var(VALUE), seed.serializer.clone()))
        .with_symbol(Symbol::new(parameters[1].name.clone(), AstExpr::var(THIS), item.clone()));
    let body = translate_expr(&inner, body)?;
    let reduce = AstExpr::reduce(input, seed.ast, body.ast);
    let ast = if bindings.is_empty() {
        reduce
    } else {
        debug!(count = bindings.len(), "rebinding enclosing $reduce variables with $let");
        AstExpr::let_(bindings, reduce)
    };
    Ok(Translated::new(ast, seed.serializer))
}
