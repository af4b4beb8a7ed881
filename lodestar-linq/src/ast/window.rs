//! `$setWindowFields` support.
//!
//! ```rust
//! use lodestar_linq::ast::{AstExpr, SortField, SetWindowFields, WindowBound, WindowBounds, WindowField, WindowOperator};
//!
//! // Running total per department, ordered by date.
//! let stage = SetWindowFields::new()
//!     .partition_by(AstExpr::field("dept"))
//!     .sort_by(SortField::ascending("date"))
//!     .output(
//!         "running",
//!         WindowField::new(WindowOperator::Sum)
//!             .argument(AstExpr::field("amount"))
//!             .window(WindowBounds::Documents(WindowBound::Unbounded, WindowBound::Current)),
//!     );
//! assert_eq!(stage.output.len(), 1);
//! ```

use std::sync::Arc;

use lodestar_bson::{Bson, Document};
use smol_str::SmolStr;

use super::expr::{AstExpr, fields};
use super::stage::{SortField, render_sort};

/// One end of a window.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowBound {
    Unbounded,
    Current,
    /// Documents for a documents window, a value distance for a range window.
    Offset(Bson),
}

impl WindowBound {
    pub fn offset(value: impl Into<Bson>) -> Self {
        Self::Offset(value.into())
    }

    fn render(&self) -> Bson {
        match self {
            Self::Unbounded => Bson::from("unbounded"),
            Self::Current => Bson::from("current"),
            Self::Offset(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowBounds {
    Documents(WindowBound, WindowBound),
    Range(WindowBound, WindowBound),
}

impl WindowBounds {
    fn render(&self) -> Document {
        let (name, lower, upper) = match self {
            Self::Documents(lower, upper) => ("documents", lower, upper),
            Self::Range(lower, upper) => ("range", lower, upper),
        };
        fields([(name, Bson::Array(vec![lower.render(), upper.render()]))])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowOperator {
    DocumentNumber,
    Rank,
    DenseRank,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    /// Value of the document `by` positions away, or `default` past the end.
    Shift { by: i64, default: Option<Bson> },
}

impl WindowOperator {
    pub fn operator(&self) -> &'static str {
        match self {
            Self::DocumentNumber => "$documentNumber",
            Self::Rank => "$rank",
            Self::DenseRank => "$denseRank",
            Self::Sum => "$sum",
            Self::Avg => "$avg",
            Self::Min => "$min",
            Self::Max => "$max",
            Self::First => "$first",
            Self::Last => "$last",
            Self::Shift { .. } => "$shift",
        }
    }

    /// Ranking operators take no argument and no window.
    pub fn is_ranking(&self) -> bool {
        matches!(self, Self::DocumentNumber | Self::Rank | Self::DenseRank)
    }
}

/// One output field of `$setWindowFields`.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowField {
    pub operator: WindowOperator,
    pub argument: Option<Arc<AstExpr>>,
    pub window: Option<WindowBounds>,
}

impl WindowField {
    pub fn new(operator: WindowOperator) -> Self {
        Self {
            operator,
            argument: None,
            window: None,
        }
    }

    pub fn argument(mut self, argument: Arc<AstExpr>) -> Self {
        self.argument = Some(argument);
        self
    }

    pub fn window(mut self, window: WindowBounds) -> Self {
        self.window = Some(window);
        self
    }

    pub fn render(&self) -> Document {
        let argument = self.argument.as_ref().map_or(Bson::Null, |a| a.render());
        let value = match &self.operator {
            op if op.is_ranking() => Bson::Document(Document::new()),
            WindowOperator::Shift { by, default } => {
                let mut spec = fields([("output", argument), ("by", Bson::Int64(*by))]);
                if let Some(default) = default {
                    spec.insert("default", default.clone());
                }
                Bson::Document(spec)
            }
            _ => argument,
        };
        let mut document = fields([(self.operator.operator(), value)]);
        if let Some(window) = &self.window {
            document.insert("window", window.render());
        }
        document
    }
}

/// The `$setWindowFields` stage body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SetWindowFields {
    pub partition_by: Option<Arc<AstExpr>>,
    pub sort_by: Vec<SortField>,
    pub output: Vec<(SmolStr, WindowField)>,
}

impl SetWindowFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_by(mut self, expr: Arc<AstExpr>) -> Self {
        self.partition_by = Some(expr);
        self
    }

    pub fn sort_by(mut self, field: SortField) -> Self {
        self.sort_by.push(field);
        self
    }

    pub fn output(mut self, name: impl Into<SmolStr>, field: WindowField) -> Self {
        self.output.push((name.into(), field));
        self
    }

    /// Expressions in a fixed order: the partition key, then each argument.
    pub(crate) fn expressions(&self) -> Vec<Arc<AstExpr>> {
        self.partition_by
            .iter()
            .cloned()
            .chain(self.output.iter().filter_map(|(_, f)| f.argument.clone()))
            .collect()
    }

    pub(crate) fn with_expressions(&self, expressions: Vec<Arc<AstExpr>>) -> Self {
        let mut replacements = expressions.into_iter();
        let partition_by = self
            .partition_by
            .as_ref()
            .map(|current| replacements.next().unwrap_or_else(|| current.clone()));
        let output = self
            .output
            .iter()
            .map(|(name, field)| {
                let argument = field
                    .argument
                    .as_ref()
                    .map(|current| replacements.next().unwrap_or_else(|| current.clone()));
                (name.clone(), WindowField { argument, ..field.clone() })
            })
            .collect();
        Self {
            partition_by,
            sort_by: self.sort_by.clone(),
            output,
        }
    }

    pub fn render(&self) -> Document {
        let mut spec = Document::new();
        if let Some(partition) = &self.partition_by {
            spec.insert("partitionBy", partition.render());
        }
        if !self.sort_by.is_empty() {
            spec.insert("sortBy", render_sort(&self.sort_by));
        }
        let mut output = Document::new();
        for (name, field) in &self.output {
            output.insert(name.as_str(), field.render());
        }
        spec.insert("output", output);
        spec
    }
}
