use ginja::{to_value, Environment, Error, Value};
use serde_json::json;

fn data(v: serde_json::Value) -> Value {
    to_value(v).unwrap()
}

fn parse_err(source: &str) -> Error {
    Environment::new().parse(source).unwrap_err()
}

fn render_err(source: &str, ctx: serde_json::Value) -> Error {
    Environment::new().render_str(source, &data(ctx)).unwrap_err()
}

#[test]
fn mismatched_end_tag_names_the_open_block() {
    let err = parse_err("{% for item in seq %}...{% endif %}");
    assert_eq!(
        err.to_string(),
        "Encountered unknown tag 'endif'. Jinja was looking for the following tags: \
         'endfor' or 'else'. The innermost block that needs to be closed is 'for'."
    );
    assert!(matches!(err, Error::Syntax { .. }));
}

#[test]
fn mismatched_end_tag_inside_if() {
    let err = parse_err("{% if x %}{% endfor %}");
    assert_eq!(
        err.to_string(),
        "Encountered unknown tag 'endfor'. Jinja was looking for the following tags: \
         'elif' or 'else' or 'endif'. The innermost block that needs to be closed is 'if'."
    );
}

#[test]
fn unexpected_end_of_template() {
    let err = parse_err("{% for item in seq %}body");
    assert_eq!(
        err.to_string(),
        "Unexpected end of template. Jinja was looking for the following tags: \
         'endfor' or 'else'. The innermost block that needs to be closed is 'for'."
    );
}

#[test]
fn unknown_tag_at_top_level_has_no_suffix() {
    let err = parse_err("{% unknown %}");
    assert_eq!(err.to_string(), "Encountered unknown tag 'unknown'.");
}

#[test]
fn hyphenated_names_are_rejected() {
    let err = parse_err("{% block foo-bar-baz %}{% endblock %}");
    assert!(err.to_string().contains("use an underscore instead"));
    assert!(matches!(err, Error::Syntax { .. }));
}

#[test]
fn loop_is_a_reserved_for_target() {
    let err = parse_err("{% for loop in seq %}{% endfor %}");
    assert!(matches!(err, Error::Assertion { .. }));
    assert!(err.to_string().contains("'loop'"));
}

#[test]
fn extends_must_come_first() {
    let err = parse_err("hello {% extends 'base.html' %}");
    assert!(err
        .to_string()
        .contains("'extends' must be the first tag in the template"));
    let err = parse_err("{% if x %}{% extends 'base.html' %}{% endif %}");
    assert!(err
        .to_string()
        .contains("'extends' must be the first tag in the template"));
}

#[test]
fn duplicate_block_names_are_rejected() {
    let err = parse_err("{% block a %}{% endblock %}{% block a %}{% endblock %}");
    assert!(err.to_string().contains("block 'a' defined twice"));
}

#[test]
fn mismatching_endblock_name() {
    let err = parse_err("{% block a %}{% endblock b %}");
    assert!(err.to_string().contains("mismatching name in endblock tag"));
}

#[test]
fn lexer_errors_carry_locations() {
    let err = parse_err("{{ 'unterminated }}");
    assert_eq!(err.to_string(), "unterminated string");
    let location = err.location().expect("syntax errors carry a location");
    assert_eq!(location.line, 1);
    assert!(location.start <= location.end);

    let err = parse_err("{# never closed");
    assert_eq!(err.to_string(), "unterminated comment");

    let err = parse_err("{{ '\\q' }}");
    assert!(err.to_string().contains("unknown escape sequence"));

    let err = parse_err("{{ (1 ] }}");
    assert!(err.to_string().contains("unexpected ']'"));

    let err = parse_err("{{ x");
    assert_eq!(err.to_string(), "unexpected end of template");
}

#[test]
fn unpack_arity_messages_are_exact() {
    let err = render_err("{% for a, b, c in [[1]] %}{% endfor %}", json!({}));
    assert_eq!(
        err.to_string(),
        "not enough values to unpack (expected 3, got 1)"
    );
    let err = render_err("{% for a, b in [[1, 2, 3]] %}{% endfor %}", json!({}));
    assert_eq!(err.to_string(), "too many values to unpack (expected 2)");
}

#[test]
fn iterating_non_iterables_fails() {
    let err = render_err("{% for x in none %}{% endfor %}", json!({}));
    assert_eq!(err.to_string(), "cannot iterate over none");
    let err = render_err("{% for x in n %}{% endfor %}", json!({ "n": 42 }));
    assert_eq!(err.to_string(), "value of type int is not iterable");
}

#[test]
fn unknown_filter_and_test() {
    let err = render_err("{{ x|nope }}", json!({}));
    assert_eq!(err.to_string(), "unknown filter 'nope'");
    assert!(matches!(err, Error::Runtime(_)));
    let err = render_err("{% if 1 is nope %}{% endif %}", json!({}));
    assert_eq!(err.to_string(), "unknown test 'nope'");
}

#[test]
fn calling_non_callables_fails() {
    let err = render_err("{{ n() }}", json!({ "n": 1 }));
    assert_eq!(err.to_string(), "value of type int is not callable");
}

#[test]
fn undefined_access_raises_undefined_error() {
    let err = render_err("{{ missing.attr }}", json!({}));
    assert!(matches!(err, Error::Undefined(_)));
    assert!(err.to_string().contains("'attr'"));

    let err = render_err("{{ missing['key'] }}", json!({}));
    assert!(matches!(err, Error::Undefined(_)));
}

#[test]
fn loop_metadata_outside_a_loop_is_undefined() {
    // `loop` is not bound in a for-filter predicate when no outer loop
    // is active, so touching its attributes fails
    let err = render_err(
        "{% for x in [1] if loop.index > 0 %}{{ x }}{% endfor %}",
        json!({}),
    );
    assert!(matches!(err, Error::Undefined(_)));
}

#[test]
fn super_outside_a_block_fails() {
    let err = render_err("{{ super() }}", json!({}));
    assert!(err.to_string().contains("super() is only available inside a block"));
}

#[test]
fn recursive_call_requires_recursive_loop() {
    let err = render_err("{% for x in [1] %}{{ loop([2]) }}{% endfor %}", json!({}));
    assert!(err.to_string().contains("recursive"));
}

#[test]
fn missing_loader_is_reported() {
    let err = render_err("{% include 'x.html' %}", json!({}));
    assert_eq!(err.to_string(), "no template loader configured");
}
