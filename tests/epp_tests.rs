//! EPP template rendering: text/code interleaving, the parameter tag,
//! and the output-stream overlay.

use std::sync::Arc;

use puppetc::context::Context;
use puppetc::eval::Evaluator;
use puppetc::fact::MapFactSource;
use puppetc::log::{LogLevel, MemorySink};
use puppetc::parser::parse_epp;
use puppetc::value::Value;

fn context() -> Context {
    Context::new(
        "t.example.com",
        "production",
        Arc::new(MapFactSource::new()),
        Arc::new(MemorySink::new()),
        LogLevel::Notice,
    )
}

fn render(template: &str, arguments: &[(String, Value)]) -> Result<String, String> {
    let tree = parse_epp(template, None).map_err(|e| e.message)?;
    let mut ctx = context();
    let mut evaluator = Evaluator::new();
    evaluator.eval_epp(&tree, arguments, &mut ctx).map_err(|e| e.message)
}

fn arg(name: &str, value: Value) -> (String, Value) {
    (name.to_string(), value)
}

#[test]
fn text_only_templates_render_verbatim() {
    assert_eq!(render("plain text\n", &[]).unwrap(), "plain text\n");
}

#[test]
fn printing_tags_insert_expression_results() {
    let output = render("Hello <%= $name %>!", &[arg("name", Value::string("world"))]).unwrap();
    assert_eq!(output, "Hello world!");
}

#[test]
fn code_tags_run_statements_without_printing() {
    let output = render("<% $x = 6 * 7 %>answer: <%= $x %>", &[]).unwrap();
    assert_eq!(output, "answer: 42");
}

#[test]
fn parameter_tag_defaults_apply_when_arguments_are_missing() {
    let template = "<%- |$greeting = 'hello', $name| -%><%= $greeting %>, <%= $name %>";
    let output = render(template, &[arg("name", Value::string("world"))]).unwrap();
    assert_eq!(output, "hello, world");
}

#[test]
fn missing_required_parameter_is_an_error() {
    let err = render("<%- |$name| -%>x", &[]).unwrap_err();
    assert!(err.contains("missing required template parameter"));
}

#[test]
fn templates_without_a_parameter_tag_see_every_argument() {
    let output = render("<%= $a %>-<%= $b %>", &[arg("a", Value::Integer(1)), arg("b", Value::Integer(2))]).unwrap();
    assert_eq!(output, "1-2");
}

#[test]
fn conditional_logic_renders_only_the_taken_branch() {
    let template = "<%= if $enabled { 'on' } else { 'off' } %>";
    assert_eq!(render(template, &[arg("enabled", Value::Boolean(true))]).unwrap(), "on");
    assert_eq!(render(template, &[arg("enabled", Value::Boolean(false))]).unwrap(), "off");
}

#[test]
fn nested_template_scopes_do_not_leak_into_each_other() {
    let mut ctx = context();
    let mut evaluator = Evaluator::new();
    let first = parse_epp("<% $x = 1 %><%= $x %>", None).unwrap();
    let second = parse_epp("<%= $x %>", None).unwrap();
    assert_eq!(evaluator.eval_epp(&first, &[], &mut ctx).unwrap(), "1");
    // `$x` was local to the first template's scope.
    assert_eq!(evaluator.eval_epp(&second, &[], &mut ctx).unwrap(), "");
}
