//! Peephole simplification of translated pipelines.
//!
//! Every rewrite here preserves meaning. Input that is already simple comes
//! back as the identical `Arc`s.

use std::sync::Arc;

use tracing::trace;

use super::expr::{AstExpr, AstNaryOp, AstUnaryOp};
use super::filter::AstFilter;
use super::stage::{AstPipeline, AstStage};

pub fn simplify_expr(expr: &Arc<AstExpr>) -> Arc<AstExpr> {
    expr.transform(&mut simplify_expr_node)
}

fn simplify_expr_node(node: &Arc<AstExpr>) -> Option<Arc<AstExpr>> {
    match &**node {
        AstExpr::Nary { op, args } if matches!(op, AstNaryOp::And | AstNaryOp::Or) => {
            let nested = args
                .iter()
                .any(|a| matches!(&**a, AstExpr::Nary { op: inner, .. } if inner == op));
            if nested {
                let mut flat = Vec::with_capacity(args.len());
                for arg in args {
                    match &**arg {
                        AstExpr::Nary { op: inner, args: inner_args } if inner == op => {
                            flat.extend(inner_args.iter().cloned())
                        }
                        _ => flat.push(arg.clone()),
                    }
                }
                let flattened = AstExpr::nary(*op, flat);
                return Some(simplify_expr_node(&flattened).unwrap_or(flattened));
            }
            match args.as_slice() {
                [single] if single.is_boolean() => Some(single.clone()),
                _ => None,
            }
        }
        AstExpr::Unary {
            op: AstUnaryOp::Not,
            arg,
        } => match &**arg {
            AstExpr::Unary {
                op: AstUnaryOp::Not,
                arg: inner,
            } if inner.is_boolean() => Some(inner.clone()),
            _ => None,
        },
        _ => None,
    }
}

pub fn simplify_filter(filter: &Arc<AstFilter>) -> Arc<AstFilter> {
    let children: Vec<_> = filter.children().iter().map(simplify_filter).collect();
    let node = filter.rebuild(children);
    let node = match &*node {
        AstFilter::Expr(expr) => {
            let simplified = simplify_expr(expr);
            if Arc::ptr_eq(&simplified, expr) {
                node.clone()
            } else {
                AstFilter::expr(simplified)
            }
        }
        _ => node.clone(),
    };
    let rebuilt = match &*node {
        AstFilter::And(children) if !children.is_empty() => Some(AstFilter::and(children.iter().cloned())),
        AstFilter::Or(children) => Some(AstFilter::or(children.iter().cloned())),
        AstFilter::Nor(children) => match children.as_slice() {
            [single] => match &**single {
                AstFilter::Nor(inner) if inner.len() == 1 => Some(AstFilter::or(inner.iter().cloned())),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    };
    match rebuilt {
        Some(rebuilt) if *rebuilt != *node => rebuilt,
        _ => node,
    }
}

pub fn simplify_pipeline(pipeline: &Arc<AstPipeline>) -> Arc<AstPipeline> {
    let mut stages: Vec<Arc<AstStage>> = Vec::with_capacity(pipeline.len());
    for stage in pipeline.stages() {
        let stage = simplify_stage(stage);
        match &*stage {
            AstStage::Skip(0) => {
                trace!("dropping $skip: 0");
                continue;
            }
            AstStage::Match(filter) => {
                if let Some(AstStage::Match(previous)) = stages.last().map(|s| &**s) {
                    trace!("merging adjacent $match stages");
                    let merged = simplify_filter(&AstFilter::and([previous.clone(), filter.clone()]));
                    stages.pop();
                    stages.push(Arc::new(AstStage::Match(merged)));
                    continue;
                }
            }
            _ => {}
        }
        stages.push(stage);
    }
    pipeline.with_stages(stages)
}

fn simplify_stage(stage: &Arc<AstStage>) -> Arc<AstStage> {
    match &**stage {
        AstStage::Match(filter) => {
            let simplified = simplify_filter(filter);
            if Arc::ptr_eq(&simplified, filter) {
                stage.clone()
            } else {
                Arc::new(AstStage::Match(simplified))
            }
        }
        AstStage::UnionWith { collection, pipeline } => {
            let simplified = simplify_pipeline(pipeline);
            if Arc::ptr_eq(&simplified, pipeline) {
                stage.clone()
            } else {
                Arc::new(AstStage::UnionWith {
                    collection: collection.clone(),
                    pipeline: simplified,
                })
            }
        }
        _ => {
            let expressions = stage.expressions().iter().map(simplify_expr).collect();
            stage.rebuild_expressions(expressions)
        }
    }
}
