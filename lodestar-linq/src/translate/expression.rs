//! Lowering of source expressions to aggregation expressions.
//!
//! Every translated node carries the serializer of its result so that
//! constants compared against it are written the same way the stored
//! values are, and so that results can be read back without guessing.

use std::fmt;
use std::sync::Arc;

use lodestar_bson::Bson;
use lodestar_bson::serialization::{CollectionSerializer, NativeValue, SerializerRef, TypeRef};
use smol_str::SmolStr;
use tracing::trace;

use super::context::TranslationContext;
use super::methods::translate_call;
use super::serializers::{ELEMENTS_ELEMENT, ProjectedMember, ProjectionSerializer};
use crate::ast::{AstBinaryOp, AstExpr, AstNaryOp, AstUnaryOp};
use crate::error::{TranslationError, TranslationResult};
use crate::expression::{BinaryOperator, Expr, Parameter, UnaryOperator};

/// A translated value expression and the serializer of its result.
#[derive(Clone)]
pub struct Translated {
    pub ast: Arc<AstExpr>,
    pub serializer: SerializerRef,
}

impl Translated {
    pub fn new(ast: Arc<AstExpr>, serializer: SerializerRef) -> Self {
        Self { ast, serializer }
    }

    pub fn value_type(&self) -> TypeRef {
        self.serializer.value_type()
    }
}

impl fmt::Debug for Translated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translated")
            .field("ast", &self.ast)
            .field("type", &self.serializer.value_type())
            .finish()
    }
}

/// Translate `expr` in value position.
pub fn translate_expr(ctx: &TranslationContext<'_>, expr: &Expr) -> TranslationResult<Translated> {
    match expr {
        Expr::Parameter(parameter) => {
            let symbol = ctx.lookup(parameter)?;
            Ok(Translated::new(symbol.ast.clone(), symbol.serializer.clone()))
        }
        Expr::Constant(value) => translate_constant(ctx, value),
        Expr::Member { target, name } => translate_member(ctx, expr, target, name),
        Expr::Index { target, index } => translate_index(ctx, expr, target, index),
        Expr::Binary { op, left, right } => translate_binary(ctx, expr, *op, left, right),
        Expr::Unary { op, operand } => translate_unary(ctx, *op, operand),
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => {
            let test = translate_expr(ctx, test)?;
            let (then, otherwise) = translate_operands(ctx, if_true, if_false)?;
            let serializer = match &**if_true {
                Expr::Constant(NativeValue::Null) => otherwise.serializer.clone(),
                _ => then.serializer.clone(),
            };
            Ok(Translated::new(AstExpr::cond(test.ast, then.ast, otherwise.ast), serializer))
        }
        Expr::Call {
            target,
            method,
            arguments,
        } => translate_call(ctx, expr, target, method, arguments),
        Expr::New { members } => translate_new(ctx, members),
        Expr::Convert { operand, to } => translate_convert(ctx, expr, operand, to),
        Expr::Lambda { .. } => Err(TranslationError::not_supported(
            expr,
            "lambdas are only translated as method arguments",
        )),
        Expr::Source { .. } => Err(TranslationError::not_supported(
            expr,
            "a collection cannot be used as a value",
        )),
    }
}

/// A constant, written with the serializer of its own runtime type.
pub(crate) fn translate_constant(ctx: &TranslationContext<'_>, value: &NativeValue) -> TranslationResult<Translated> {
    let ty = value.runtime_type().unwrap_or(TypeRef::BsonValue);
    let serializer = ctx.serializer(&ty)?;
    let bson = serializer.serialize(&ctx.serialization(), value)?;
    Ok(Translated::new(AstExpr::constant(bson), serializer))
}

/// Serialize a constant the way values it is compared with are stored.
///
/// Falls back to the constant's own type when `peer` cannot write it,
/// such as a null compared with a non-nullable member.
pub(crate) fn serialize_like(
    ctx: &TranslationContext<'_>,
    value: &NativeValue,
    peer: &SerializerRef,
) -> TranslationResult<Bson> {
    match peer.serialize(&ctx.serialization(), value) {
        Ok(bson) => Ok(bson),
        Err(err) => {
            trace!(error = %err, ty = %peer.value_type(), "constant not writable by peer serializer");
            let constant = translate_constant(ctx, value)?;
            Ok(constant.ast.as_constant().cloned().unwrap_or(Bson::Null))
        }
    }
}

/// Translate a pair of operands; a constant side is serialized like the
/// other side.
pub(crate) fn translate_operands(
    ctx: &TranslationContext<'_>,
    left: &Expr,
    right: &Expr,
) -> TranslationResult<(Translated, Translated)> {
    match (left, right) {
        (Expr::Constant(_), Expr::Constant(_)) => Ok((translate_expr(ctx, left)?, translate_expr(ctx, right)?)),
        (Expr::Constant(value), other) => {
            let other = translate_expr(ctx, other)?;
            let constant = serialize_like(ctx, value, &other.serializer)?;
            Ok((Translated::new(AstExpr::constant(constant), other.serializer.clone()), other))
        }
        (other, Expr::Constant(value)) => {
            let other = translate_expr(ctx, other)?;
            let constant = serialize_like(ctx, value, &other.serializer)?;
            Ok((other.clone(), Translated::new(AstExpr::constant(constant), other.serializer)))
        }
        _ => Ok((translate_expr(ctx, left)?, translate_expr(ctx, right)?)),
    }
}

pub(crate) fn boolean(ctx: &TranslationContext<'_>) -> TranslationResult<SerializerRef> {
    ctx.serializer(&TypeRef::Bool)
}

/// A list serializer for items written by `item`.
pub(crate) fn list_of(item: SerializerRef) -> TranslationResult<SerializerRef> {
    let ty = TypeRef::list(item.value_type());
    Ok(Arc::new(CollectionSerializer::new(ty, item)?))
}

/// The array a sequence method reads, and the serializer of its items.
///
/// A serializer that is both document- and array-shaped is a grouping,
/// whose items live in `_elements`.
pub(crate) fn array_input(value: &Translated) -> Option<(Arc<AstExpr>, SerializerRef)> {
    if value.value_type() == TypeRef::BsonValue {
        return Some((value.ast.clone(), value.serializer.clone()));
    }
    let array = value.serializer.as_array()?;
    let input = if value.serializer.as_document().is_some() {
        AstExpr::get_field(value.ast.clone(), ELEMENTS_ELEMENT)
    } else {
        value.ast.clone()
    };
    Some((input, array.item_serializer()))
}

/// Split a lambda into its parameters and body, checking the arity.
pub(crate) fn lambda_parts<'e>(expr: &'e Expr, arity: usize) -> TranslationResult<(&'e [Parameter], &'e Expr)> {
    match expr {
        Expr::Lambda { parameters, body } if parameters.len() == arity => Ok((parameters, body)),
        Expr::Lambda { parameters, .. } => Err(TranslationError::not_supported(
            expr,
            format!("expected a lambda of {} parameter(s), found {}", arity, parameters.len()),
        )),
        other => Err(TranslationError::not_supported(other, "expected a lambda")),
    }
}

fn translate_member(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    target: &Expr,
    name: &SmolStr,
) -> TranslationResult<Translated> {
    let target = translate_expr(ctx, target)?;
    let ty = target.value_type();
    match (ty.underlying(), name.as_str()) {
        (TypeRef::String, "Length") => {
            return Ok(Translated::new(
                AstExpr::unary(AstUnaryOp::StrLenCP, target.ast),
                ctx.serializer(&TypeRef::Int32)?,
            ));
        }
        (_, "HasValue") if matches!(ty, TypeRef::Nullable(_)) => {
            return Ok(Translated::new(
                AstExpr::binary(AstBinaryOp::Ne, target.ast, AstExpr::constant(Bson::Null)),
                boolean(ctx)?,
            ));
        }
        (inner, "Value") if matches!(ty, TypeRef::Nullable(_)) => {
            return Ok(Translated::new(target.ast.clone(), ctx.serializer(inner)?));
        }
        _ => {}
    }
    let is_plain_array = target.serializer.as_array().is_some() && target.serializer.as_document().is_none();
    if is_plain_array && matches!(name.as_str(), "Length" | "Count") {
        return Ok(Translated::new(
            AstExpr::unary(AstUnaryOp::Size, target.ast),
            ctx.serializer(&TypeRef::Int32)?,
        ));
    }
    if ty == TypeRef::BsonValue {
        return Ok(Translated::new(
            AstExpr::get_field(target.ast, name.clone()),
            target.serializer,
        ));
    }
    let Some(document) = target.serializer.as_document() else {
        return Err(TranslationError::not_supported(
            expr,
            format!("{} has no members", ty),
        ));
    };
    match document.member(&ctx.serialization(), name)? {
        Some(info) => Ok(Translated::new(
            AstExpr::get_field(target.ast.clone(), info.element_name),
            info.serializer,
        )),
        None => Err(TranslationError::not_supported(
            expr,
            format!("{} has no member {}", ty, name),
        )),
    }
}

fn translate_index(ctx: &TranslationContext<'_>, expr: &Expr, target: &Expr, index: &Expr) -> TranslationResult<Translated> {
    let target = translate_expr(ctx, target)?;
    if let Expr::Constant(NativeValue::String(key)) = index {
        match target.value_type() {
            TypeRef::Dictionary(value) => {
                return Ok(Translated::new(
                    AstExpr::get_field(target.ast, key.as_str()),
                    ctx.serializer(&value)?,
                ));
            }
            TypeRef::BsonValue => {
                return Ok(Translated::new(AstExpr::get_field(target.ast, key.as_str()), target.serializer));
            }
            _ => {}
        }
    }
    let Some((input, item)) = array_input(&target) else {
        return Err(TranslationError::not_supported(
            expr,
            format!("{} cannot be indexed", target.value_type()),
        ));
    };
    let index = translate_expr(ctx, index)?;
    Ok(Translated::new(AstExpr::binary(AstBinaryOp::ArrayElemAt, input, index.ast), item))
}

fn comparison(op: BinaryOperator) -> Option<AstBinaryOp> {
    Some(match op {
        BinaryOperator::Equal => AstBinaryOp::Eq,
        BinaryOperator::NotEqual => AstBinaryOp::Ne,
        BinaryOperator::GreaterThan => AstBinaryOp::Gt,
        BinaryOperator::GreaterThanOrEqual => AstBinaryOp::Gte,
        BinaryOperator::LessThan => AstBinaryOp::Lt,
        BinaryOperator::LessThanOrEqual => AstBinaryOp::Lte,
        _ => return None,
    })
}

fn translate_binary(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    op: BinaryOperator,
    left: &Expr,
    right: &Expr,
) -> TranslationResult<Translated> {
    if let Some(ast_op) = comparison(op) {
        let (left, right) = translate_operands(ctx, left, right)?;
        return Ok(Translated::new(AstExpr::binary(ast_op, left.ast, right.ast), boolean(ctx)?));
    }
    match op {
        BinaryOperator::AndAlso | BinaryOperator::OrElse => {
            let left = translate_expr(ctx, left)?;
            let right = translate_expr(ctx, right)?;
            let ast_op = if op == BinaryOperator::AndAlso {
                AstNaryOp::And
            } else {
                AstNaryOp::Or
            };
            Ok(Translated::new(flatten(ast_op, left.ast, right.ast), boolean(ctx)?))
        }
        BinaryOperator::Coalesce => {
            let (left, right) = translate_operands(ctx, left, right)?;
            let serializer = match left.value_type() {
                TypeRef::Nullable(inner) => ctx.serializer(&inner)?,
                _ => left.serializer.clone(),
            };
            Ok(Translated::new(
                AstExpr::binary(AstBinaryOp::IfNull, left.ast, right.ast),
                serializer,
            ))
        }
        _ => translate_arithmetic(ctx, expr, op, left, right),
    }
}

fn translate_arithmetic(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    op: BinaryOperator,
    left: &Expr,
    right: &Expr,
) -> TranslationResult<Translated> {
    let (left, right) = translate_operands(ctx, left, right)?;
    let is_string = |t: &Translated| t.value_type().underlying() == &TypeRef::String;
    if op == BinaryOperator::Add && (is_string(&left) || is_string(&right)) {
        let string = if is_string(&left) { left.serializer.clone() } else { right.serializer.clone() };
        return Ok(Translated::new(flatten(AstNaryOp::Concat, left.ast, right.ast), string));
    }
    if numeric_rank(&left.value_type()).is_none() || numeric_rank(&right.value_type()).is_none() {
        return Err(TranslationError::not_supported(
            expr,
            format!(
                "operator {} needs numeric operands, found {} and {}",
                op.symbol(),
                left.value_type(),
                right.value_type()
            ),
        ));
    }
    let serializer = promoted(ctx, &left, &right)?;
    let ast = match op {
        BinaryOperator::Add => flatten(AstNaryOp::Add, left.ast, right.ast),
        BinaryOperator::Multiply => flatten(AstNaryOp::Multiply, left.ast, right.ast),
        BinaryOperator::Subtract => AstExpr::binary(AstBinaryOp::Subtract, left.ast, right.ast),
        BinaryOperator::Modulo => AstExpr::binary(AstBinaryOp::Mod, left.ast, right.ast),
        BinaryOperator::Divide => {
            // $divide always produces a floating point result.
            let serializer = if numeric_rank(&serializer.value_type()) == Some(4) {
                serializer
            } else {
                ctx.serializer(&TypeRef::Double)?
            };
            return Ok(Translated::new(
                AstExpr::binary(AstBinaryOp::Divide, left.ast, right.ast),
                serializer,
            ));
        }
        other => {
            return Err(TranslationError::not_supported(
                expr,
                format!("no translation for operator {}", other.symbol()),
            ));
        }
    };
    Ok(Translated::new(ast, serializer))
}

/// `op(left, right)`, merged into `left` when it is already `op`.
fn flatten(op: AstNaryOp, left: Arc<AstExpr>, right: Arc<AstExpr>) -> Arc<AstExpr> {
    match &*left {
        AstExpr::Nary { op: inner, args } if *inner == op => {
            let mut args = args.clone();
            args.push(right);
            AstExpr::nary(op, args)
        }
        _ => AstExpr::nary(op, [left, right]),
    }
}

/// Width class of a numeric type; `None` for non-numbers.
pub(crate) fn numeric_rank(ty: &TypeRef) -> Option<u8> {
    match ty.underlying() {
        TypeRef::Int16 | TypeRef::Int32 => Some(1),
        TypeRef::UInt32 | TypeRef::Int64 | TypeRef::UInt64 => Some(2),
        TypeRef::Single | TypeRef::Double => Some(3),
        TypeRef::Decimal | TypeRef::Decimal128 => Some(4),
        TypeRef::BsonValue => Some(3),
        _ => None,
    }
}

/// The serializer of an arithmetic result: the wider operand type.
pub(crate) fn promoted(ctx: &TranslationContext<'_>, left: &Translated, right: &Translated) -> TranslationResult<SerializerRef> {
    let (Some(a), Some(b)) = (numeric_rank(&left.value_type()), numeric_rank(&right.value_type())) else {
        return Ok(left.serializer.clone());
    };
    let wider = if b > a { right } else { left };
    match wider.value_type() {
        TypeRef::Nullable(inner) => ctx.serializer(&inner),
        TypeRef::BsonValue => ctx.serializer(&TypeRef::Double),
        _ => Ok(wider.serializer.clone()),
    }
}

fn translate_unary(ctx: &TranslationContext<'_>, op: UnaryOperator, operand: &Expr) -> TranslationResult<Translated> {
    let operand = translate_expr(ctx, operand)?;
    Ok(match op {
        UnaryOperator::Not => Translated::new(AstExpr::unary(AstUnaryOp::Not, operand.ast), boolean(ctx)?),
        UnaryOperator::Negate => Translated::new(
            AstExpr::binary(AstBinaryOp::Subtract, AstExpr::constant(0), operand.ast),
            operand.serializer,
        ),
        UnaryOperator::ArrayLength => Translated::new(
            AstExpr::unary(AstUnaryOp::Size, operand.ast),
            ctx.serializer(&TypeRef::Int32)?,
        ),
    })
}

fn translate_new(ctx: &TranslationContext<'_>, members: &[(SmolStr, Expr)]) -> TranslationResult<Translated> {
    let mut fields = Vec::with_capacity(members.len());
    let mut projected = Vec::with_capacity(members.len());
    for (name, value) in members {
        check_field_name(name)?;
        let value = translate_expr(ctx, value)?;
        fields.push((name.clone(), value.ast));
        projected.push(ProjectedMember::new(name.clone(), name.clone(), value.serializer));
    }
    Ok(Translated::new(
        AstExpr::document(fields),
        Arc::new(ProjectionSerializer::new(projected)),
    ))
}

/// Output field names may not be empty, start with `$` or contain `.`.
pub(crate) fn check_field_name(name: &str) -> TranslationResult<()> {
    if name.is_empty() || name.starts_with('$') || name.contains('.') {
        return Err(TranslationError::invalid_operation(format!(
            "{:?} is not a valid field name",
            name
        )));
    }
    Ok(())
}

fn convert_target(ty: &TypeRef) -> Option<&'static str> {
    Some(match ty {
        TypeRef::Int16 | TypeRef::Int32 => "int",
        TypeRef::Int64 => "long",
        TypeRef::Single | TypeRef::Double => "double",
        TypeRef::Decimal | TypeRef::Decimal128 => "decimal",
        TypeRef::String => "string",
        TypeRef::Bool => "bool",
        TypeRef::DateTime => "date",
        TypeRef::ObjectId => "objectId",
        _ => return None,
    })
}

fn translate_convert(ctx: &TranslationContext<'_>, expr: &Expr, operand: &Expr, to: &TypeRef) -> TranslationResult<Translated> {
    let operand = translate_expr(ctx, operand)?;
    let serializer = ctx.serializer(to)?;
    let from = operand.value_type();
    if from.underlying() == to.underlying() {
        return Ok(Translated::new(operand.ast, serializer));
    }
    let Some(target) = convert_target(to.underlying()) else {
        return Err(TranslationError::not_supported(
            expr,
            format!("no conversion from {} to {}", from, to),
        ));
    };
    Ok(Translated::new(AstExpr::convert(operand.ast, target), serializer))
}
