use ginja::{to_value, Context, Environment, Error, Finalize, PassMode, Syntax, Value};
use serde_json::json;

fn data(v: serde_json::Value) -> Value {
    to_value(v).unwrap()
}

fn render(source: &str, ctx: serde_json::Value) -> String {
    Environment::new().render_str(source, &data(ctx)).unwrap()
}

#[test]
fn literal_only_template_round_trips() {
    assert_eq!(render("Hello, world!", json!({})), "Hello, world!");
    assert_eq!(render("no markup\nat all", json!({})), "no markup\nat all");
    assert_eq!(
        ginja::render_str("Hello {{ name }}!", &data(json!({ "name": "World" }))).unwrap(),
        "Hello World!"
    );
}

#[test]
fn trailing_newline_dropped_by_default() {
    assert_eq!(render("hi\n", json!({})), "hi");
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    assert_eq!(env.render_str("hi\n", &data(json!({}))).unwrap(), "hi\n");
}

#[test]
fn simple_loop() {
    let out = render(
        "{% for item in seq %}{{ item }}{% endfor %}",
        json!({ "seq": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9] }),
    );
    assert_eq!(out, "0123456789");
}

#[test]
fn for_else_on_missing_sequence() {
    let out = render(
        "{% for item in seq %}XXX{% else %}...{% endfor %}",
        json!({}),
    );
    assert_eq!(out, "...");
}

#[test]
fn for_else_skipped_when_nonempty() {
    let out = render(
        "{% for item in seq %}{{ item }}{% else %}nope{% endfor %}",
        json!({ "seq": [1] }),
    );
    assert_eq!(out, "1");
}

#[test]
fn loop_filter_with_test() {
    let out = render(
        "{% for item in range(10) if item is even %}[{{ item }}]{% endfor %}",
        json!({}),
    );
    assert_eq!(out, "[0][2][4][6][8]");
}

#[test]
fn php_style_delimiters() {
    let mut syntax = Syntax::default();
    syntax.block_start = "<?".into();
    syntax.block_end = "?>".into();
    syntax.variable_start = "<?=".into();
    syntax.variable_end = "?>".into();
    syntax.comment_start = "<!--".into();
    syntax.comment_end = "-->".into();
    let mut env = Environment::new();
    env.set_syntax(syntax);

    let tmpl = "<!-- I'm a comment --><? for item in seq -?>\n    <?= item ?>\n<?- endfor ?>";
    let out = env
        .render_str(tmpl, &data(json!({ "seq": [0, 1, 2, 3, 4] })))
        .unwrap();
    assert_eq!(out, "01234");
}

#[test]
fn delimiter_genericity() {
    let mut syntax = Syntax::default();
    syntax.block_start = "[%".into();
    syntax.block_end = "%]".into();
    syntax.variable_start = "[[".into();
    syntax.variable_end = "]]".into();
    syntax.comment_start = "[#".into();
    syntax.comment_end = "#]".into();
    let mut env = Environment::new();
    env.set_syntax(syntax);

    let ctx = data(json!({ "seq": ["a", "b"] }));
    let custom = env
        .render_str("[# c #][% for x in seq %][[ x ]][% endfor %]", &ctx)
        .unwrap();
    let canonical = Environment::new()
        .render_str("{# c #}{% for x in seq %}{{ x }}{% endfor %}", &ctx)
        .unwrap();
    assert_eq!(custom, canonical);
    assert_eq!(custom, "ab");
}

#[test]
fn nested_loop_metadata() {
    let out = render(
        "{% for row in table %}{%- set rowloop = loop -%}{% for cell in row -%}\
         [{{ rowloop.index }}|{{ loop.index }}]{%- endfor %}{%- endfor %}",
        json!({ "table": ["ab", "cd"] }),
    );
    assert_eq!(out, "[1|1][1|2][2|1][2|2]");
}

#[test]
fn loop_metadata_invariants() {
    let out = render(
        "{% for x in seq %}{{ loop.index }}/{{ loop.index0 }}/{{ loop.revindex }}/\
         {{ loop.revindex0 }}/{{ loop.first }}/{{ loop.last }}/{{ loop.length }};{% endfor %}",
        json!({ "seq": ["a", "b", "c"] }),
    );
    assert_eq!(
        out,
        "1/0/3/2/true/false/3;2/1/2/1/false/false/3;3/2/1/0/false/true/3;"
    );
}

#[test]
fn loop_previtem_and_nextitem() {
    let out = render(
        "{% for x in seq %}({{ loop.previtem }}<{{ x }}>{{ loop.nextitem }}){% endfor %}",
        json!({ "seq": [1, 2, 3] }),
    );
    assert_eq!(out, "(<1>2)(1<2>3)(2<3>)");
}

#[test]
fn loop_cycle_and_changed() {
    let out = render(
        "{% for i in range(4) %}{{ loop.cycle('a', 'b') }}{% endfor %}",
        json!({}),
    );
    assert_eq!(out, "abab");

    let out = render(
        "{% for x in seq %}{{ loop.changed(x) }};{% endfor %}",
        json!({ "seq": [1, 1, 2] }),
    );
    assert_eq!(out, "true;false;true;");
}

#[test]
fn recursive_loop() {
    let out = render(
        "{% for node in nodes recursive %}{{ node.title }}[{{ loop.depth }}]\
         {% if node.children %}({{ loop(node.children) }}){% endif %}{% endfor %}",
        json!({
            "nodes": [
                { "title": "a", "children": [ { "title": "b", "children": [] } ] },
                { "title": "c", "children": [] }
            ]
        }),
    );
    assert_eq!(out, "a[1](b[2])c[1]");
}

#[test]
fn map_iteration_yields_pairs() {
    let out = render(
        "{% for key, value in mapping %}{{ key }}={{ value }};{% endfor %}",
        json!({ "mapping": { "a": 1, "b": 2 } }),
    );
    assert_eq!(out, "a=1;b=2;");
}

#[test]
fn string_iteration_is_per_character() {
    let out = render("{% for c in 'abc' %}{{ c }}.{% endfor %}", json!({}));
    assert_eq!(out, "a.b.c.");
}

#[test]
fn unpacking_binds_in_order() {
    let out = render(
        "{% for a, b, c in [[1, 2, 3]] %}{{ a }}{{ b }}{{ c }}{% endfor %}",
        json!({}),
    );
    assert_eq!(out, "123");
}

#[test]
fn loop_targets_do_not_leak() {
    let out = render(
        "{% set x = 'outer' %}{% for x in [1, 2] %}{{ x }}{% endfor %}{{ x }}",
        json!({}),
    );
    assert_eq!(out, "12outer");

    let out = render("{% for y in [1] %}{% endfor %}{{ y }}", json!({}));
    assert_eq!(out, "");
}

#[test]
fn set_assignment_and_tuple_unpack() {
    assert_eq!(render("{% set x = 40 + 2 %}{{ x }}", json!({})), "42");
    assert_eq!(
        render("{% set a, b = 'x', 'y' %}{{ a }}{{ b }}", json!({})),
        "xy"
    );
}

#[test]
fn set_block_form_with_filter() {
    let out = render(
        "{% set greeting | upper %}hello {{ name }}{% endset %}{{ greeting }}",
        json!({ "name": "ada" }),
    );
    assert_eq!(out, "HELLO ADA");
}

#[test]
fn if_elif_else() {
    let tmpl = "{% if n == 1 %}one{% elif n == 2 %}two{% else %}many{% endif %}";
    assert_eq!(render(tmpl, json!({ "n": 1 })), "one");
    assert_eq!(render(tmpl, json!({ "n": 2 })), "two");
    assert_eq!(render(tmpl, json!({ "n": 7 })), "many");
}

#[test]
fn truthiness_is_python_like() {
    let tmpl = "{% if v %}t{% else %}f{% endif %}";
    assert_eq!(render(tmpl, json!({ "v": [] })), "f");
    assert_eq!(render(tmpl, json!({ "v": "" })), "f");
    assert_eq!(render(tmpl, json!({ "v": 0 })), "f");
    assert_eq!(render(tmpl, json!({ "v": null })), "f");
    assert_eq!(render(tmpl, json!({ "v": [0] })), "t");
    assert_eq!(render(tmpl, json!({ "v": "x" })), "t");
    assert_eq!(render(tmpl, json!({ "v": -1 })), "t");
}

#[test]
fn arithmetic_and_precedence() {
    assert_eq!(render("{{ 1 + 2 * 3 }}", json!({})), "7");
    assert_eq!(render("{{ (1 + 2) * 3 }}", json!({})), "9");
    assert_eq!(render("{{ 7 // 2 }}", json!({})), "3");
    assert_eq!(render("{{ -7 // 2 }}", json!({})), "-4");
    assert_eq!(render("{{ 7 % 3 }}", json!({})), "1");
    assert_eq!(render("{{ -7 % 3 }}", json!({})), "2");
    assert_eq!(render("{{ 2 ** 8 }}", json!({})), "256");
    assert_eq!(render("{{ -2 ** 2 }}", json!({})), "-4");
    assert_eq!(render("{{ 4 / 2 }}", json!({})), "2.0");
    assert_eq!(render("{{ 1 / 2 }}", json!({})), "0.5");
}

#[test]
fn string_operations() {
    assert_eq!(render("{{ 'a' + 'b' }}", json!({})), "ab");
    assert_eq!(render("{{ 'ab' * 3 }}", json!({})), "ababab");
    assert_eq!(render("{{ 'a' ~ 1 ~ 'b' }}", json!({})), "a1b");
}

#[test]
fn chained_comparisons() {
    assert_eq!(render("{% if 1 < 2 < 3 %}y{% endif %}", json!({})), "y");
    assert_eq!(render("{% if 1 < 2 > 3 %}y{% else %}n{% endif %}", json!({})), "n");
}

#[test]
fn membership_and_identity_tests() {
    assert_eq!(render("{% if 1 in [1, 2] %}y{% endif %}", json!({})), "y");
    assert_eq!(render("{% if 'x' not in 'abc' %}y{% endif %}", json!({})), "y");
    assert_eq!(render("{% if 'b' in 'abc' %}y{% endif %}", json!({})), "y");
    assert_eq!(
        render("{% if missing is not defined %}y{% endif %}", json!({})),
        "y"
    );
    assert_eq!(
        render("{% if 9 is divisibleby 3 %}y{% endif %}", json!({})),
        "y"
    );
    assert_eq!(
        render("{% if 9 is divisibleby(4) %}y{% else %}n{% endif %}", json!({})),
        "n"
    );
}

#[test]
fn inline_condition() {
    assert_eq!(render("{{ 'a' if true else 'b' }}", json!({})), "a");
    assert_eq!(render("{{ 'a' if false else 'b' }}", json!({})), "b");
    // missing else yields undefined, which prints as nothing
    assert_eq!(render("{{ 'a' if false }}", json!({})), "");
}

#[test]
fn logic_returns_operands() {
    assert_eq!(render("{{ 'x' or 'y' }}", json!({})), "x");
    assert_eq!(render("{{ '' or 'y' }}", json!({})), "y");
    assert_eq!(render("{{ 'x' and 'y' }}", json!({})), "y");
    assert_eq!(render("{{ not '' }}", json!({})), "true");
}

#[test]
fn subscripts_and_slices() {
    assert_eq!(render("{{ 'abc'[0] }}", json!({})), "a");
    assert_eq!(render("{{ 'abc'[-1] }}", json!({})), "c");
    assert_eq!(render("{{ 'hello'[1:3] }}", json!({})), "el");
    assert_eq!(render("{{ 'hello'[::-1] }}", json!({})), "olleh");
    assert_eq!(render("{{ [1, 2, 3, 4][::2] }}", json!({})), "[1, 3]");
    assert_eq!(render("{{ seq.1 }}", json!({ "seq": [10, 20] })), "20");
    assert_eq!(
        render("{{ user.name }}/{{ user['name'] }}", json!({ "user": { "name": "ada" } })),
        "ada/ada"
    );
}

#[test]
fn container_output_uses_repr() {
    assert_eq!(render("{{ [1, 'a'] }}", json!({})), "[1, 'a']");
    assert_eq!(render("{{ {'k': 1} }}", json!({})), "{'k': 1}");
}

#[test]
fn with_statement_scopes_and_sequencing() {
    let out = render(
        "{% with a = 1, b = a + 1 %}{{ a }}{{ b }}{% endwith %}{{ a }}",
        json!({}),
    );
    assert_eq!(out, "12");
}

#[test]
fn do_statement_produces_no_output() {
    assert_eq!(render("a{% do 1 + 1 %}b", json!({})), "ab");
}

#[test]
fn comments_are_swallowed() {
    assert_eq!(render("A{# a comment #}B", json!({})), "AB");
    assert_eq!(render("A{#- spaced -#}B", json!({})), "AB");
}

#[test]
fn raw_block_is_literal() {
    assert_eq!(
        render("{% raw %}{{ not_evaluated }}{% endraw %}", json!({})),
        "{{ not_evaluated }}"
    );
    assert_eq!(
        render("{% raw %}{% if %}{% endraw %}", json!({})),
        "{% if %}"
    );
}

#[test]
fn whitespace_modifiers() {
    assert_eq!(render("a   {%- if true %}b{% endif %}", json!({})), "ab");
    assert_eq!(render("{% if true -%}   b{% endif %}", json!({})), "b");
}

#[test]
fn trim_blocks_only_removes_whitespace() {
    let tmpl = "A{% if true %}\nX{% endif %}\nB";
    let plain = render(tmpl, json!({}));
    assert_eq!(plain, "A\nX\nB");

    let mut env = Environment::new();
    env.set_trim_blocks(true);
    let trimmed = env.render_str(tmpl, &data(json!({}))).unwrap();
    assert_eq!(trimmed, "AXB");
    // monotonic: trimming only removes characters
    assert!(plain.len() >= trimmed.len());
    assert_eq!(
        plain.replace(char::is_whitespace, ""),
        trimmed.replace(char::is_whitespace, "")
    );
}

#[test]
fn lstrip_blocks_strips_leading_indentation() {
    let tmpl = "  {% if true %}X{% endif %}";
    assert_eq!(render(tmpl, json!({})), "  X");

    let mut env = Environment::new();
    env.set_lstrip_blocks(true);
    assert_eq!(env.render_str(tmpl, &data(json!({}))).unwrap(), "X");
    // a `+` modifier disables left-stripping for that tag
    assert_eq!(
        env.render_str("  {%+ if true %}X{% endif %}", &data(json!({})))
            .unwrap(),
        "  X"
    );
}

#[test]
fn line_statements_and_comments() {
    let mut env = Environment::new();
    env.set_line_statement_prefix(Some("%"));
    env.set_line_comment_prefix(Some("##"));
    let out = env
        .render_str(
            "% for item in seq\n{{ item }}\n% endfor",
            &data(json!({ "seq": [1, 2] })),
        )
        .unwrap();
    assert_eq!(out, "1\n2\n");

    let out = env
        .render_str("## ignored\nhello", &data(json!({})))
        .unwrap();
    assert_eq!(out, "\nhello");
}

#[test]
fn builtin_filters() {
    assert_eq!(render("{{ 'ada'|upper }}", json!({})), "ADA");
    assert_eq!(render("{{ 'ADA'|lower }}", json!({})), "ada");
    assert_eq!(render("{{ 'ada lovelace'|capitalize }}", json!({})), "Ada lovelace");
    assert_eq!(render("{{ '  x  '|trim }}", json!({})), "x");
    assert_eq!(render("{{ [1, 2, 3]|length }}", json!({})), "3");
    assert_eq!(render("{{ 'abc'|count }}", json!({})), "3");
    assert_eq!(render("{{ [1, 2]|first }}/{{ [1, 2]|last }}", json!({})), "1/2");
    assert_eq!(render("{{ ['a', 'b']|join(', ') }}", json!({})), "a, b");
    assert_eq!(render("{{ 'abc'|reverse }}", json!({})), "cba");
    assert_eq!(render("{{ missing|default('fallback') }}", json!({})), "fallback");
    assert_eq!(render("{{ ''|default('x', true) }}", json!({})), "x");
    assert_eq!(render("{{ 'kept'|d('x') }}", json!({})), "kept");
    assert_eq!(render("{{ -3|abs }}", json!({})), "3");
    assert_eq!(render("{{ ('42'|int) + 1 }}", json!({})), "43");
    assert_eq!(render("{{ '2.5'|float }}", json!({})), "2.5");
    assert_eq!(render("{{ user|attr('name') }}", json!({ "user": { "name": "x" } })), "x");
}

#[test]
fn filter_pipeline_and_args() {
    assert_eq!(
        render("{{ words|join(' ')|upper }}", json!({ "words": ["a", "b"] })),
        "A B"
    );
}

#[test]
fn filter_block_statement() {
    let out = render(
        "{% filter upper %}a{{ 'b' }}c{% endfilter %}",
        json!({}),
    );
    assert_eq!(out, "ABC");
}

#[test]
fn custom_filter_and_test_registration() {
    let mut env = Environment::new();
    env.add_filter("shout", |args, _kwargs| {
        Ok(Value::String(format!(
            "{}!!",
            args.first().map(Value::to_output_string).unwrap_or_default()
        )))
    });
    env.add_test("big", |args, _kwargs| {
        Ok(Value::Bool(
            args.first().and_then(Value::as_int).unwrap_or(0) > 100,
        ))
    });
    let out = env
        .render_str(
            "{{ 'hi'|shout }} {% if 200 is big %}big{% endif %}",
            &data(json!({})),
        )
        .unwrap();
    assert_eq!(out, "hi!! big");
}

#[test]
fn pass_context_global_sees_scope() {
    let out = render("{{ debug() }}", json!({ "zebra_var": 1 }));
    assert!(out.contains("zebra_var"));
    assert!(out.contains("range"));
}

#[test]
fn autoescape_modes() {
    // off by default
    assert_eq!(render("{{ '<b>' }}", json!({})), "<b>");
    // escape filter works regardless
    assert_eq!(render("{{ '<b>'|e }}", json!({})), "&lt;b&gt;");

    let mut env = Environment::new();
    env.set_auto_escape(true);
    let ctx = data(json!({ "x": "<script>&" }));
    assert_eq!(
        env.render_str("{{ x }}", &ctx).unwrap(),
        "&lt;script&gt;&amp;"
    );
    // already-safe markup is not double escaped
    assert_eq!(env.render_str("{{ x|e }}", &ctx).unwrap(), "&lt;script&gt;&amp;");
    assert_eq!(env.render_str("{{ x|safe }}", &ctx).unwrap(), "<script>&");
}

#[test]
fn autoescape_statement_overrides_flag() {
    let out = render(
        "{% autoescape true %}{{ x }}{% endautoescape %}{{ x }}",
        json!({ "x": "<i>" }),
    );
    assert_eq!(out, "&lt;i&gt;<i>");
}

#[test]
fn finalize_post_processes_output() {
    let mut env = Environment::new();
    env.set_finalize(Finalize::Value(Box::new(|v| match v {
        Value::Undefined => Value::String("N/A".into()),
        other => other,
    })));
    assert_eq!(
        env.render_str("{{ missing }}/{{ 1 }}", &data(json!({}))).unwrap(),
        "N/A/1"
    );
}

#[test]
fn optimizer_is_transparent() {
    let tmpl = "{{ 1 + 2 * 3 }}|{{ 'a' ~ 'b' }}|{{ [1, 2][0] }}|{{ {'k': 7}.k }}|{{ 'x' if 1 > 2 else 'y' }}";
    let ctx = data(json!({}));
    let mut unopt = Environment::new();
    unopt.set_optimize(false);
    let expected = unopt.render_str(tmpl, &ctx).unwrap();
    assert_eq!(Environment::new().render_str(tmpl, &ctx).unwrap(), expected);
    assert_eq!(expected, "7|ab|1|7|y");
}

#[test]
fn optimizer_leaves_failing_constants_to_render_time() {
    // constant folding must not turn a render-time error into a parse
    // failure, nor swallow it
    let env = Environment::new();
    let tmpl = env.from_string("{{ 1 / 0 }}").unwrap();
    let err = tmpl.render(&data(json!({}))).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert_eq!(err.to_string(), "division by zero");
}

#[test]
fn strict_lookup_mode() {
    let mut env = Environment::new();
    env.set_strict_lookup(true);
    let err = env.render_str("{{ missing }}", &data(json!({}))).unwrap_err();
    match err {
        Error::ContextVariableNotFound { variable_name } => {
            assert_eq!(variable_name, "missing");
        }
        other => panic!("expected strict lookup error, got {other:?}"),
    }
    assert_eq!(
        env.render_str("{{ present }}", &data(json!({ "present": 1 })))
            .unwrap(),
        "1"
    );
}

#[test]
fn render_chunks_is_pull_based() {
    let env = Environment::new();
    let tmpl = env
        .from_string("A{% set x = 1 %}{% for i in [1, 2] %}{{ i }}{% endfor %}{{ x }}")
        .unwrap();
    let ctx = data(json!({}));
    let chunks: Vec<String> = tmpl
        .render_chunks(&ctx)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(chunks.concat(), tmpl.render(&ctx).unwrap());
    assert_eq!(chunks.len(), 4);

    // dropping early cancels the rest without error
    let mut chunks = tmpl.render_chunks(&ctx).unwrap();
    assert_eq!(chunks.next().unwrap().unwrap(), "A");
    drop(chunks);
}

#[test]
fn context_scopes_and_escaping() {
    let env = Environment::new();
    let mut root = ginja::Scope::new();
    root.insert("name".to_string(), Value::from("ada"));
    let mut ctx = Context::new(&env, root);
    assert_eq!(ctx.resolve("name").unwrap(), Value::from("ada"));
    assert!(ctx.resolve("missing").unwrap().is_undefined());

    // overrides shadow for the duration of the closure only
    let mut overrides = ginja::Scope::new();
    overrides.insert("name".to_string(), Value::from("grace"));
    let seen = ctx
        .apply(overrides, |ctx| ctx.resolve("name"))
        .unwrap();
    assert_eq!(seen, Value::from("grace"));
    assert_eq!(ctx.resolve("name").unwrap(), Value::from("ada"));

    // a derived context is independent
    let mut derived = ctx.derived();
    derived.set("name", Value::from("linus"));
    assert_eq!(derived.resolve("name").unwrap(), Value::from("linus"));
    assert_eq!(ctx.resolve("name").unwrap(), Value::from("ada"));

    assert_eq!(ctx.escape(Value::from("<b>")), Value::from("<b>"));
}

#[test]
fn registered_callables_expose_their_pass_mode() {
    let plain = ginja::RegisteredCallable::new(|_args, _kwargs| Ok(Value::None));
    assert_eq!(plain.mode(), PassMode::None);
    let ctxful = ginja::pass_context(|_ctx, _args, _kwargs| Ok(Value::None));
    assert_eq!(ctxful.mode(), PassMode::Context);
    let envful = ginja::pass_environment(|_env, _args, _kwargs| Ok(Value::None));
    assert_eq!(envful.mode(), PassMode::Environment);
}

#[test]
fn environments_compare_by_syntax() {
    let a = Environment::new();
    let b = Environment::new();
    assert_eq!(a, b);
    let mut c = Environment::new();
    c.set_trim_blocks(true);
    assert_ne!(a, c);
}

#[test]
fn modifier_injects_scoped_overrides() {
    use ginja::ast::{Expr, Stmt};

    let mut env = Environment::new();
    env.add_modifier(|_env, body| {
        let inner = std::mem::take(body);
        *body = vec![Stmt::ScopedContextModifier {
            overrides: vec![(
                "site_name".to_string(),
                Expr::Const(Value::String("ginja".to_string())),
            )],
            body: inner,
        }];
    });
    assert_eq!(
        env.render_str("{{ site_name }}", &data(json!({}))).unwrap(),
        "ginja"
    );
}

#[test]
fn lex_entry_point_exposes_tokens() {
    use ginja::token::TokenKind;

    let env = Environment::new();
    let tokens = env.lex("hi {{ name }}").unwrap();
    let kinds: Vec<&TokenKind> = tokens.iter().map(|t| &t.kind).collect();
    assert!(matches!(kinds[0], TokenKind::Data(d) if d == "hi "));
    assert_eq!(kinds[1], &TokenKind::VariableStart);
    assert!(matches!(kinds[2], TokenKind::Name(n) if n == "name"));
    assert_eq!(kinds[3], &TokenKind::VariableEnd);
    assert_eq!(kinds[4], &TokenKind::Eof);
    for token in &tokens {
        assert!(token.span.start <= token.span.end);
        assert!(token.span.line >= 1);
    }
}
