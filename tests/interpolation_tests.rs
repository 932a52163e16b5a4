//! String interpolation end to end: escapes resolved by the lexer,
//! `${...}` bodies re-parsed by the parser, and the embedded expressions
//! evaluated against a live context.

use std::sync::Arc;

use rstest::rstest;

use puppetc::context::Context;
use puppetc::eval::Evaluator;
use puppetc::fact::MapFactSource;
use puppetc::log::{LogLevel, MemorySink};
use puppetc::parser::Parser;

fn context() -> Context {
    Context::new(
        "t.example.com",
        "production",
        Arc::new(MapFactSource::new()),
        Arc::new(MemorySink::new()),
        LogLevel::Notice,
    )
}

/// Evaluates `source` and returns the last statement's value as a string.
fn eval_to_string(source: &str) -> String {
    let mut ctx = context();
    let body = Parser::parse_manifest(source, None).unwrap().body;
    ctx.registry.scan_and_commit(&body).unwrap();
    let mut evaluator = Evaluator::new();
    evaluator.hoist_functions(&body);
    evaluator.eval_body(&body, &mut ctx).unwrap().to_display_string()
}

#[rstest]
#[case(r#""a${1 + 1}b""#, "a2b")]
#[case(r#""${ 'nested' }""#, "nested")]
#[case(r#""2 + 2 is ${2 + 2}""#, "2 + 2 is 4")]
fn embedded_expressions_are_evaluated_and_stringified(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(eval_to_string(source), expected);
}

#[test]
fn bare_variable_interpolation_reads_the_scope() {
    assert_eq!(eval_to_string(r#"$name = 'world' "hello $name""#), "hello world");
}

#[test]
fn braced_name_is_a_variable_lookup_not_a_bare_word() {
    assert_eq!(eval_to_string(r#"$title = 'site' "/etc/${title}""#), "/etc/site");
}

#[test]
fn braced_access_chains_resolve_through_the_variable() {
    assert_eq!(eval_to_string(r#"$h = { 'a' => [10, 20] } "${h['a'][1]}""#), "20");
}

#[test]
fn undef_interpolates_as_an_empty_string() {
    assert_eq!(eval_to_string(r#""<${undef}>""#), "<>");
}

#[test]
fn arrays_and_hashes_render_deterministically() {
    assert_eq!(eval_to_string(r#"$a = ['x', 1] "${a}""#), "['x', 1]");
    assert_eq!(eval_to_string(r#"$h = { 'k' => 1 } "${h}""#), "{'k' => 1}");
}

#[test]
fn match_variables_interpolate_after_a_match() {
    let source = r#"$ok = 'ab12' =~ /([a-z]+)(\d+)/ "$1/$2""#;
    assert_eq!(eval_to_string(source), "ab/12");
}

#[test]
fn unmatched_match_variable_is_empty() {
    assert_eq!(eval_to_string(r#""<$9>""#), "<>");
}

#[rstest]
#[case(r#""a\tb""#, "a\tb")]
#[case(r#""a\nb""#, "a\nb")]
#[case(r#""a\sb""#, "a b")]
#[case(r#""\$literal""#, "$literal")]
#[case(r#""q\"uote""#, "q\"uote")]
fn escape_sequences_resolve_in_double_quotes(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(eval_to_string(source), expected);
}

#[test]
fn single_quotes_do_not_interpolate() {
    assert_eq!(eval_to_string(r#"$x = 1 '${x}'"#), "${x}");
}

#[test]
fn heredoc_interpolation_uses_the_same_machinery() {
    let source = "$port = 8080\n$cfg = @(\"EOT\")\nlisten ${port}\n| EOT\n$cfg";
    assert_eq!(eval_to_string(source), "listen 8080\n");
}

#[test]
fn errors_inside_an_interpolation_propagate() {
    let mut ctx = context();
    let body = Parser::parse_manifest(r#""${1 / 0}""#, None).unwrap().body;
    let mut evaluator = Evaluator::new();
    let err = evaluator.eval_body(&body, &mut ctx).unwrap_err();
    assert!(err.message.contains("division by zero"));
}
