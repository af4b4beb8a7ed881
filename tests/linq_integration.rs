//! Integration tests for query translation and in-memory execution.
//!
//! Each query is translated to a pipeline, run by the evaluator against
//! sample documents, and materialized the way a driver would.

use lodestar::bson::json::{JsonWriterSettings, to_json};
use lodestar::bson::serialization::{ClassMapBuilder, ConventionPack, MemberMapBuilder, NativeValue, TypeRef};
use lodestar::linq::eval::{Collections, run_pipeline};
use lodestar::linq::{ExecutableQuery, QueryOutput};
use lodestar::prelude::*;
use pretty_assertions::assert_eq;

fn registry() -> SerializerRegistry {
    let registry = SerializerRegistry::new();
    let conventions = ConventionPack::new();
    for builder in [
        ClassMapBuilder::new("Child").member(MemberMapBuilder::new("Value", TypeRef::Int32)),
        ClassMapBuilder::new("Parent")
            .member(MemberMapBuilder::new("Name", TypeRef::String))
            .member(MemberMapBuilder::new("Value", TypeRef::Int32))
            .member(MemberMapBuilder::new("Children", TypeRef::list(TypeRef::class("Child")))),
    ] {
        registry.register_class_map(builder.freeze(&conventions).unwrap()).unwrap();
    }
    registry
}

fn a() -> Parameter {
    Parameter::new("a", TypeRef::class("Parent"))
}

fn b() -> Parameter {
    Parameter::new("b", TypeRef::class("Child"))
}

fn on_parent(body: Expr) -> Expr {
    Expr::lambda([a()], body)
}

fn parents(registry: &SerializerRegistry) -> Queryable<'_> {
    Queryable::new(registry, "parents", TypeRef::class("Parent"))
}

fn children(values: &[i32]) -> Bson {
    Bson::Array(values.iter().map(|v| Bson::Document(doc! { "Value" => *v })).collect())
}

fn sample() -> Vec<Document> {
    vec![
        doc! { "Name" => "ann", "Value" => 1, "Children" => children(&[1, 5]) },
        doc! { "Name" => "bob", "Value" => 2, "Children" => children(&[3]) },
        doc! { "Name" => "cy", "Value" => 3, "Children" => children(&[]) },
        doc! { "Name" => "dee", "Value" => 4, "Children" => children(&[4, 4]) },
    ]
}

fn run(query: &ExecutableQuery, documents: Vec<Document>) -> Vec<Document> {
    run_pipeline(&query.pipeline, documents, &Collections::new()).unwrap()
}

fn names(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .filter_map(|d| d.get("Name").and_then(Bson::as_str).map(str::to_string))
        .collect()
}

#[test]
fn test_filter_sort_and_page() {
    let registry = registry();
    let query = parents(&registry)
        .where_(on_parent(a().expr().member("Value").gt(Expr::constant(1))))
        .order_by_descending(on_parent(a().expr().member("Value")))
        .skip(1)
        .take(2)
        .to_list()
        .unwrap();
    assert_eq!(names(&run(&query, sample())), vec!["cy", "bob"]);
}

#[test]
fn test_inner_lambda_field_does_not_shadow_outer() {
    // Both classes have a `Value` member; the inner one must read the
    // element, the outer one the root document.
    let registry = registry();
    let predicate = a()
        .expr()
        .member("Children")
        .call("Any", [Expr::lambda([b()], b().expr().member("Value").eq(a().expr().member("Value")))]);
    let query = parents(&registry).where_(on_parent(predicate)).to_list().unwrap();
    assert_eq!(names(&run(&query, sample())), vec!["ann", "dee"]);
}

#[test]
fn test_quantifier_over_elements_only() {
    let registry = registry();
    let predicate = a()
        .expr()
        .member("Children")
        .call("Any", [Expr::lambda([b()], b().expr().member("Value").gte(Expr::constant(4)))]);
    let query = parents(&registry).where_(on_parent(predicate)).to_list().unwrap();
    assert_eq!(names(&run(&query, sample())), vec!["ann", "dee"]);
}

#[test]
fn test_count_materializes_int64() {
    let registry = registry();
    let query = parents(&registry)
        .count_where(on_parent(a().expr().member("Value").lte(Expr::constant(2))))
        .unwrap();
    let output = query.materialize(&registry, &run(&query, sample())).unwrap();
    assert_eq!(output, QueryOutput::Scalar(NativeValue::Int64(2)));

    let empty = query.materialize(&registry, &run(&query, Vec::new())).unwrap();
    assert_eq!(empty, QueryOutput::Scalar(NativeValue::Int64(0)));
}

#[test]
fn test_any_and_first_terminals() {
    let registry = registry();
    let any = parents(&registry).any().unwrap();
    assert_eq!(
        any.materialize(&registry, &run(&any, sample())).unwrap(),
        QueryOutput::Scalar(NativeValue::Bool(true))
    );
    assert_eq!(
        any.materialize(&registry, &run(&any, Vec::new())).unwrap(),
        QueryOutput::Scalar(NativeValue::Bool(false))
    );

    let first = parents(&registry).first().unwrap();
    assert!(first.materialize(&registry, &run(&first, Vec::new())).is_err());
}

#[test]
fn test_sum_of_selected_field() {
    let registry = registry();
    let query = parents(&registry).sum(on_parent(a().expr().member("Value"))).unwrap();
    let output = query.materialize(&registry, &run(&query, sample())).unwrap();
    assert_eq!(output, QueryOutput::Scalar(NativeValue::Int32(10)));
}

#[test]
fn test_aggregate_command_shape() {
    let registry = registry();
    let query = parents(&registry)
        .where_(on_parent(a().expr().member("Name").eq(Expr::constant("bob"))))
        .to_list()
        .unwrap();
    let command = query.to_command();
    assert_eq!(command.get("aggregate").and_then(Bson::as_str), Some("parents"));
    assert_eq!(
        to_json(&query.pipeline.render_bson(), &JsonWriterSettings::relaxed()),
        r#"[{ "$match" : { "Name" : "bob" } }]"#
    );
}

#[test]
fn test_take_zero_returns_nothing() {
    let registry = registry();
    let query = parents(&registry).take(0).to_list().unwrap();
    assert!(run(&query, sample()).is_empty());
}
