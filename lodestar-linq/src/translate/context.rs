//! Translation state: the symbol table and the context threaded through
//! every translation call.

use std::fmt;
use std::sync::Arc;

use lodestar_bson::serialization::{SerializationContext, SerializerRef, SerializerRegistry, TypeRef};
use smol_str::SmolStr;

use crate::ast::{AstExpr, CURRENT};
use crate::error::{TranslationError, TranslationResult};
use crate::expression::Parameter;

/// What a source parameter stands for in the pipeline.
#[derive(Clone)]
pub struct Symbol {
    /// The source parameter name.
    pub name: SmolStr,
    /// How the bound value is referenced, e.g. `$$CURRENT` or `$$this`.
    pub ast: Arc<AstExpr>,
    pub serializer: SerializerRef,
    /// Whether field paths on this symbol are relative to the current
    /// document, which is what `$match` and `$elemMatch` can express.
    pub is_current: bool,
}

impl Symbol {
    pub fn new(name: impl Into<SmolStr>, ast: Arc<AstExpr>, serializer: SerializerRef) -> Self {
        Self {
            name: name.into(),
            ast,
            serializer,
            is_current: false,
        }
    }

    /// A symbol for the document being processed.
    pub fn current(name: impl Into<SmolStr>, serializer: SerializerRef) -> Self {
        Self {
            name: name.into(),
            ast: AstExpr::current(),
            serializer,
            is_current: true,
        }
    }

    /// A symbol for a field of the document being processed, such as the
    /// `_v` wrapper written by a scalar projection.
    pub fn current_field(name: impl Into<SmolStr>, field: &str, serializer: SerializerRef) -> Self {
        Self {
            name: name.into(),
            ast: AstExpr::field(field),
            serializer,
            is_current: true,
        }
    }

    /// The `$$name` variable a bound symbol is stored in, if any.
    pub fn var_name(&self) -> Option<&str> {
        match &*self.ast {
            AstExpr::Var(name) if name != CURRENT => Some(name),
            _ => None,
        }
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name)
            .field("ast", &self.ast)
            .field("type", &self.serializer.value_type())
            .field("is_current", &self.is_current)
            .finish()
    }
}

#[derive(Debug)]
struct SymbolNode {
    symbol: Symbol,
    parent: Option<Arc<SymbolNode>>,
}

/// A persistent symbol table.
///
/// Adding a symbol produces a new table sharing the old one; the old table
/// is unchanged, so leaving a scope is just dropping the inner table.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    head: Option<Arc<SymbolNode>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(&self, symbol: Symbol) -> Self {
        Self {
            head: Some(Arc::new(SymbolNode {
                symbol,
                parent: self.head.clone(),
            })),
        }
    }

    /// Innermost binding of `name`.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        std::iter::successors(self.head.as_deref(), |node| node.parent.as_deref()).map(|node| &node.symbol)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Whether some visible symbol is stored in `$$name`.
    pub fn uses_var(&self, name: &str) -> bool {
        self.iter().any(|s| s.ast.references_var(name))
    }

    /// A variable name derived from `base` that no visible symbol uses.
    pub fn unique_var_name(&self, base: &str) -> SmolStr {
        let base = sanitize_var_name(base);
        if !self.uses_var(&base) && !is_reserved(&base) {
            return SmolStr::new(&base);
        }
        (1..)
            .map(|n| format!("{}{}", base, n))
            .find(|candidate| !self.uses_var(candidate))
            .map(SmolStr::new)
            .unwrap_or_else(|| SmolStr::new(base))
    }
}

/// Variable names must start with a lowercase letter.
fn sanitize_var_name(name: &str) -> String {
    let mut out: String = name.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    match out.chars().next() {
        Some(c) if c.is_ascii_lowercase() => {}
        Some(c) if c.is_ascii_uppercase() => {
            let lower = c.to_ascii_lowercase();
            out.replace_range(..1, &lower.to_string());
        }
        _ => out.insert(0, 'v'),
    }
    out
}

fn is_reserved(name: &str) -> bool {
    matches!(name, "this" | "value")
}

/// State threaded through translation.
#[derive(Clone)]
pub struct TranslationContext<'r> {
    registry: &'r SerializerRegistry,
    symbols: SymbolTable,
}

impl<'r> TranslationContext<'r> {
    pub fn new(registry: &'r SerializerRegistry) -> Self {
        Self {
            registry,
            symbols: SymbolTable::new(),
        }
    }

    pub fn registry(&self) -> &'r SerializerRegistry {
        self.registry
    }

    pub fn serialization(&self) -> SerializationContext<'r> {
        SerializationContext::new(self.registry)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn with_symbol(&self, symbol: Symbol) -> Self {
        Self {
            registry: self.registry,
            symbols: self.symbols.with_symbol(symbol),
        }
    }

    pub fn with_symbols(&self, symbols: SymbolTable) -> Self {
        Self {
            registry: self.registry,
            symbols,
        }
    }

    /// A context in which only `symbol` is visible, for the body of a stage.
    pub fn for_stage(&self, symbol: Symbol) -> Self {
        Self {
            registry: self.registry,
            symbols: SymbolTable::new().with_symbol(symbol),
        }
    }

    pub fn lookup(&self, parameter: &Parameter) -> TranslationResult<&Symbol> {
        self.symbols.lookup(&parameter.name).ok_or_else(|| {
            TranslationError::invalid_operation(format!("parameter {} is not in scope", parameter.name))
        })
    }

    pub fn serializer(&self, ty: &TypeRef) -> TranslationResult<SerializerRef> {
        Ok(self.registry.lookup(ty)?)
    }
}

impl fmt::Debug for TranslationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationContext").field("symbols", &self.symbols).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32(registry: &SerializerRegistry) -> SerializerRef {
        registry.lookup(&TypeRef::Int32).unwrap()
    }

    #[test]
    fn test_with_symbol_does_not_mutate_parent() {
        let registry = SerializerRegistry::new();
        let outer = SymbolTable::new().with_symbol(Symbol::current("a", int32(&registry)));
        let inner = outer.with_symbol(Symbol::new("b", AstExpr::var("b"), int32(&registry)));
        assert!(outer.lookup("b").is_none());
        assert!(inner.lookup("a").is_some());
        assert_eq!(inner.len(), 2);
        assert_eq!(outer.len(), 1);
    }

    #[test]
    fn test_inner_binding_shadows() {
        let registry = SerializerRegistry::new();
        let table = SymbolTable::new()
            .with_symbol(Symbol::current("x", int32(&registry)))
            .with_symbol(Symbol::new("x", AstExpr::var("x"), int32(&registry)));
        assert!(!table.lookup("x").unwrap().is_current);
    }

    #[test]
    fn test_unique_var_names() {
        let registry = SerializerRegistry::new();
        let table = SymbolTable::new().with_symbol(Symbol::new("b", AstExpr::var("b"), int32(&registry)));
        assert_eq!(table.unique_var_name("b"), "b1");
        assert_eq!(table.unique_var_name("c"), "c");
        assert_eq!(table.unique_var_name("Item"), "item");
        assert_eq!(table.unique_var_name("_x"), "v_x");
        assert_eq!(table.unique_var_name("this"), "this1");
    }
}
