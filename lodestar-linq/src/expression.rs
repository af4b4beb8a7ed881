//! Source query expressions.
//!
//! Queries are written as a tree of [`Expr`] nodes: lambdas over typed
//! parameters, member access, operators and method calls. The translator
//! lowers this tree into the pipeline AST. `Display` renders the tree in
//! source syntax, which is what error messages quote.
//!
//! ```rust
//! use lodestar_bson::serialization::TypeRef;
//! use lodestar_linq::expression::{Expr, Parameter};
//!
//! let a = Parameter::new("a", TypeRef::class("Person"));
//! let body = a.expr().member("Age").gte(Expr::constant(18));
//! assert_eq!(Expr::lambda([a], body).to_string(), "a => (a.Age >= 18)");
//! ```

use std::fmt;

use lodestar_bson::serialization::{NativeValue, TypeRef};
use smol_str::SmolStr;

/// A lambda parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: SmolStr,
    pub ty: TypeRef,
}

impl Parameter {
    pub fn new(name: impl Into<SmolStr>, ty: TypeRef) -> Self {
        Self { name: name.into(), ty }
    }

    /// A reference to this parameter.
    pub fn expr(&self) -> Expr {
        Expr::Parameter(self.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    AndAlso,
    OrElse,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Coalesce,
}

impl BinaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::AndAlso => "&&",
            Self::OrElse => "||",
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
            Self::Coalesce => "??",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
                | Self::LessThan
                | Self::LessThanOrEqual
        )
    }

    /// The comparison that holds with the operands swapped.
    pub fn flipped(self) -> Self {
        match self {
            Self::GreaterThan => Self::LessThan,
            Self::GreaterThanOrEqual => Self::LessThanOrEqual,
            Self::LessThan => Self::GreaterThan,
            Self::LessThanOrEqual => Self::GreaterThanOrEqual,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Not,
    Negate,
    ArrayLength,
}

/// The receiver of a method call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    /// `target.Method(...)`, including the query operators.
    Instance(Box<Expr>),
    /// `Type.Method(...)`, such as `Math.Abs`.
    Static(SmolStr),
}

/// A query expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Parameter(Parameter),
    Constant(NativeValue),
    Member {
        target: Box<Expr>,
        name: SmolStr,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    Call {
        target: CallTarget,
        method: SmolStr,
        arguments: Vec<Expr>,
    },
    Lambda {
        parameters: Vec<Parameter>,
        body: Box<Expr>,
    },
    /// An anonymous object, `new { A = ..., B = ... }`.
    New {
        members: Vec<(SmolStr, Expr)>,
    },
    Convert {
        operand: Box<Expr>,
        to: TypeRef,
    },
    /// The documents of a collection.
    Source {
        collection: SmolStr,
        document_type: TypeRef,
    },
}

impl Expr {
    pub fn constant(value: impl Into<NativeValue>) -> Self {
        Self::Constant(value.into())
    }

    pub fn lambda(parameters: impl IntoIterator<Item = Parameter>, body: Expr) -> Self {
        Self::Lambda {
            parameters: parameters.into_iter().collect(),
            body: Box::new(body),
        }
    }

    pub fn source(collection: impl Into<SmolStr>, document_type: TypeRef) -> Self {
        Self::Source {
            collection: collection.into(),
            document_type,
        }
    }

    pub fn new_object<N: Into<SmolStr>>(members: impl IntoIterator<Item = (N, Expr)>) -> Self {
        Self::New {
            members: members.into_iter().map(|(n, e)| (n.into(), e)).collect(),
        }
    }

    pub fn static_call(type_name: impl Into<SmolStr>, method: impl Into<SmolStr>, arguments: impl IntoIterator<Item = Expr>) -> Self {
        Self::Call {
            target: CallTarget::Static(type_name.into()),
            method: method.into(),
            arguments: arguments.into_iter().collect(),
        }
    }

    pub fn conditional(test: Expr, if_true: Expr, if_false: Expr) -> Self {
        Self::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        }
    }

    pub fn member(self, name: impl Into<SmolStr>) -> Self {
        Self::Member {
            target: Box::new(self),
            name: name.into(),
        }
    }

    pub fn index(self, index: Expr) -> Self {
        Self::Index {
            target: Box::new(self),
            index: Box::new(index),
        }
    }

    pub fn call(self, method: impl Into<SmolStr>, arguments: impl IntoIterator<Item = Expr>) -> Self {
        Self::Call {
            target: CallTarget::Instance(Box::new(self)),
            method: method.into(),
            arguments: arguments.into_iter().collect(),
        }
    }

    pub fn convert(self, to: TypeRef) -> Self {
        Self::Convert {
            operand: Box::new(self),
            to,
        }
    }

    pub fn binary(self, op: BinaryOperator, right: Expr) -> Self {
        Self::Binary {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    pub fn unary(self, op: UnaryOperator) -> Self {
        Self::Unary {
            op,
            operand: Box::new(self),
        }
    }

    pub fn eq(self, right: Expr) -> Self {
        self.binary(BinaryOperator::Equal, right)
    }

    pub fn ne(self, right: Expr) -> Self {
        self.binary(BinaryOperator::NotEqual, right)
    }

    pub fn gt(self, right: Expr) -> Self {
        self.binary(BinaryOperator::GreaterThan, right)
    }

    pub fn gte(self, right: Expr) -> Self {
        self.binary(BinaryOperator::GreaterThanOrEqual, right)
    }

    pub fn lt(self, right: Expr) -> Self {
        self.binary(BinaryOperator::LessThan, right)
    }

    pub fn lte(self, right: Expr) -> Self {
        self.binary(BinaryOperator::LessThanOrEqual, right)
    }

    pub fn and(self, right: Expr) -> Self {
        self.binary(BinaryOperator::AndAlso, right)
    }

    pub fn or(self, right: Expr) -> Self {
        self.binary(BinaryOperator::OrElse, right)
    }

    pub fn add(self, right: Expr) -> Self {
        self.binary(BinaryOperator::Add, right)
    }

    pub fn subtract(self, right: Expr) -> Self {
        self.binary(BinaryOperator::Subtract, right)
    }

    pub fn multiply(self, right: Expr) -> Self {
        self.binary(BinaryOperator::Multiply, right)
    }

    pub fn divide(self, right: Expr) -> Self {
        self.binary(BinaryOperator::Divide, right)
    }

    pub fn modulo(self, right: Expr) -> Self {
        self.binary(BinaryOperator::Modulo, right)
    }

    pub fn coalesce(self, right: Expr) -> Self {
        self.binary(BinaryOperator::Coalesce, right)
    }

    pub fn not(self) -> Self {
        self.unary(UnaryOperator::Not)
    }

    pub fn negate(self) -> Self {
        self.unary(UnaryOperator::Negate)
    }

    /// Whether any parameter other than those in `bound` is referenced.
    ///
    /// Parameters introduced by nested lambdas count as bound inside
    /// those lambdas.
    pub fn references_outside(&self, bound: &[SmolStr]) -> bool {
        let mut scope: Vec<SmolStr> = bound.to_vec();
        self.references_outside_in(&mut scope)
    }

    /// Whether the parameter `name` is referenced where no nested lambda
    /// rebinds it.
    pub fn references(&self, name: &str) -> bool {
        match self {
            Self::Parameter(p) => p.name == name,
            Self::Lambda { parameters, body } => {
                !parameters.iter().any(|p| p.name == name) && body.references(name)
            }
            Self::Constant(_) | Self::Source { .. } => false,
            Self::Member { target, .. } => target.references(name),
            Self::Index { target, index } => target.references(name) || index.references(name),
            Self::Binary { left, right, .. } => left.references(name) || right.references(name),
            Self::Unary { operand, .. } | Self::Convert { operand, .. } => operand.references(name),
            Self::Conditional {
                test,
                if_true,
                if_false,
            } => test.references(name) || if_true.references(name) || if_false.references(name),
            Self::Call { target, arguments, .. } => {
                matches!(target, CallTarget::Instance(t) if t.references(name))
                    || arguments.iter().any(|a| a.references(name))
            }
            Self::New { members } => members.iter().any(|(_, e)| e.references(name)),
        }
    }

    fn references_outside_in(&self, scope: &mut Vec<SmolStr>) -> bool {
        match self {
            Self::Parameter(p) => !scope.contains(&p.name),
            Self::Constant(_) | Self::Source { .. } => false,
            Self::Member { target, .. } => target.references_outside_in(scope),
            Self::Index { target, index } => {
                target.references_outside_in(scope) || index.references_outside_in(scope)
            }
            Self::Binary { left, right, .. } => {
                left.references_outside_in(scope) || right.references_outside_in(scope)
            }
            Self::Unary { operand, .. } | Self::Convert { operand, .. } => operand.references_outside_in(scope),
            Self::Conditional {
                test,
                if_true,
                if_false,
            } => {
                test.references_outside_in(scope)
                    || if_true.references_outside_in(scope)
                    || if_false.references_outside_in(scope)
            }
            Self::Call { target, arguments, .. } => {
                let in_target = match target {
                    CallTarget::Instance(t) => t.references_outside_in(scope),
                    CallTarget::Static(_) => false,
                };
                in_target || arguments.iter().any(|a| a.references_outside_in(scope))
            }
            Self::Lambda { parameters, body } => {
                let depth = scope.len();
                scope.extend(parameters.iter().map(|p| p.name.clone()));
                let found = body.references_outside_in(scope);
                scope.truncate(depth);
                found
            }
            Self::New { members } => members.iter().any(|(_, e)| e.references_outside_in(scope)),
        }
    }
}

fn write_constant(f: &mut fmt::Formatter<'_>, value: &NativeValue) -> fmt::Result {
    match value {
        NativeValue::Null => f.write_str("null"),
        NativeValue::Bool(b) => write!(f, "{}", b),
        NativeValue::Int16(v) => write!(f, "{}", v),
        NativeValue::Int32(v) => write!(f, "{}", v),
        NativeValue::Int64(v) => write!(f, "{}L", v),
        NativeValue::UInt32(v) => write!(f, "{}U", v),
        NativeValue::UInt64(v) => write!(f, "{}UL", v),
        NativeValue::Single(v) => write!(f, "{}F", v),
        NativeValue::Double(v) => write!(f, "{:?}", v),
        NativeValue::Decimal(v) => write!(f, "{}M", v),
        NativeValue::Char(c) => write!(f, "'{}'", c),
        NativeValue::String(s) => write!(f, "{:?}", s),
        NativeValue::Enum(e) => write!(f, "{}.{}", e.type_name, e.name),
        NativeValue::Collection { items, .. } => {
            f.write_str("{ ")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_constant(f, item)?;
            }
            f.write_str(" }")
        }
        other => match other.runtime_type() {
            Some(ty) => write!(f, "value({})", ty),
            None => f.write_str("value"),
        },
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameter(p) => f.write_str(&p.name),
            Self::Constant(value) => write_constant(f, value),
            Self::Member { target, name } => write!(f, "{}.{}", target, name),
            Self::Index { target, index } => write!(f, "{}[{}]", target, index),
            Self::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Self::Unary { op, operand } => match op {
                UnaryOperator::Not => write!(f, "!{}", operand),
                UnaryOperator::Negate => write!(f, "-{}", operand),
                UnaryOperator::ArrayLength => write!(f, "ArrayLength({})", operand),
            },
            Self::Conditional {
                test,
                if_true,
                if_false,
            } => write!(f, "({} ? {} : {})", test, if_true, if_false),
            Self::Call {
                target,
                method,
                arguments,
            } => {
                match target {
                    CallTarget::Instance(t) => write!(f, "{}.{}(", t, method)?,
                    CallTarget::Static(ty) => write!(f, "{}.{}(", ty, method)?,
                }
                write_list(f, arguments)?;
                f.write_str(")")
            }
            Self::Lambda { parameters, body } => {
                if let [single] = parameters.as_slice() {
                    write!(f, "{} => {}", single.name, body)
                } else {
                    f.write_str("(")?;
                    for (i, p) in parameters.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        f.write_str(&p.name)?;
                    }
                    write!(f, ") => {}", body)
                }
            }
            Self::New { members } => {
                f.write_str("new { ")?;
                for (i, (name, value)) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} = {}", name, value)?;
                }
                f.write_str(" }")
            }
            Self::Convert { operand, to } => write!(f, "Convert({}, {})", operand, to),
            Self::Source { collection, .. } => write!(f, "{}.AsQueryable()", collection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Parameter {
        Parameter::new("a", TypeRef::class("Person"))
    }

    #[test]
    fn test_display_nested_lambda() {
        let a = person();
        let b = Parameter::new("b", TypeRef::class("Child"));
        let any = a
            .expr()
            .member("Children")
            .call("Any", [Expr::lambda([b], a.expr().member("Value").eq(Expr::constant(2)))]);
        assert_eq!(any.to_string(), "a.Children.Any(b => (a.Value == 2))");
    }

    #[test]
    fn test_references_outside() {
        let a = person();
        let b = Parameter::new("b", TypeRef::class("Child"));
        let own = Expr::lambda([b.clone()], b.expr().member("X").eq(Expr::constant(1)));
        let outer = Expr::lambda([b], a.expr().member("X").eq(Expr::constant(1)));
        assert!(!own.references_outside(&[]));
        assert!(outer.references_outside(&[]));
        assert!(!outer.references_outside(&["a".into()]));
    }

    #[test]
    fn test_references_respects_shadowing() {
        let a = person();
        let shadow = Parameter::new("a", TypeRef::Int32);
        let inner = Expr::lambda([shadow.clone()], shadow.expr().gt(Expr::constant(1)));
        let call = a.expr().member("Values").call("Any", [inner]);
        assert!(call.references("a"));
        let only_inner = Expr::constant(1).call("Equals", [Expr::lambda([shadow.clone()], shadow.expr())]);
        assert!(!only_inner.references("a"));
    }

    #[test]
    fn test_flipped_comparison() {
        assert_eq!(BinaryOperator::LessThan.flipped(), BinaryOperator::GreaterThan);
        assert_eq!(BinaryOperator::Equal.flipped(), BinaryOperator::Equal);
    }

    #[test]
    fn test_display_constants() {
        assert_eq!(Expr::constant("x").to_string(), "\"x\"");
        assert_eq!(Expr::constant(5i64).to_string(), "5L");
        assert_eq!(Expr::static_call("Math", "Abs", [Expr::constant(-1)]).to_string(), "Math.Abs(-1)");
    }
}
