use std::cell::Cell;
use std::rc::Rc;

use ginja::{to_value, Environment, Error, Loader, MapLoader, Value};
use serde_json::json;

fn data(v: serde_json::Value) -> Value {
    to_value(v).unwrap()
}

fn env_with(templates: &[(&str, &str)]) -> Environment {
    let mut loader = MapLoader::new();
    for (name, source) in templates {
        loader.insert(*name, *source);
    }
    let mut env = Environment::new();
    env.set_loader(loader);
    env
}

#[test]
fn child_overrides_parent_block() {
    let env = env_with(&[
        (
            "base.html",
            "<html>{% block title %}Default{% endblock %}|{% block body %}Base body{% endblock %}</html>",
        ),
        (
            "child.html",
            "{% extends 'base.html' %}{% block title %}Child{% endblock %}",
        ),
    ]);
    let out = env
        .get_template("child.html")
        .unwrap()
        .render(&data(json!({})))
        .unwrap();
    assert_eq!(out, "<html>Child|Base body</html>");
}

#[test]
fn super_composes_across_deep_chains() {
    let env = env_with(&[
        ("c.html", "{% block x %}C{% endblock %}"),
        (
            "b.html",
            "{% extends 'c.html' %}{% block x %}B({{ super() }}){% endblock %}",
        ),
        (
            "a.html",
            "{% extends 'b.html' %}{% block x %}A({{ super() }}){% endblock %}",
        ),
    ]);
    let out = env
        .get_template("a.html")
        .unwrap()
        .render(&data(json!({})))
        .unwrap();
    assert_eq!(out, "A(B(C))");
}

#[test]
fn extends_template_name_can_be_an_expression() {
    let env = env_with(&[
        ("base.html", "[{% block x %}base{% endblock %}]"),
        (
            "child.html",
            "{% extends parent %}{% block x %}child{% endblock %}",
        ),
    ]);
    let out = env
        .get_template("child.html")
        .unwrap()
        .render(&data(json!({ "parent": "base.html" })))
        .unwrap();
    assert_eq!(out, "[child]");
}

#[test]
fn required_block_must_be_overridden() {
    let env = env_with(&[
        ("base.html", "{% block content required %}{% endblock %}"),
        ("bad.html", "{% extends 'base.html' %}"),
        (
            "good.html",
            "{% extends 'base.html' %}{% block content %}ok{% endblock %}",
        ),
    ]);
    let err = env
        .get_template("bad.html")
        .unwrap()
        .render(&data(json!({})))
        .unwrap_err();
    assert!(err.to_string().contains("required block 'content'"));

    let out = env
        .get_template("good.html")
        .unwrap()
        .render(&data(json!({})))
        .unwrap();
    assert_eq!(out, "ok");
}

#[test]
fn block_scoping_default_and_scoped() {
    let env = env_with(&[
        (
            "scoped.html",
            "{% for item in seq %}{% block entry scoped %}{{ item }}{% endblock %}{% endfor %}",
        ),
        (
            "unscoped.html",
            "{% for item in seq %}{% block entry %}{{ item }}x{% endblock %}{% endfor %}",
        ),
        (
            "child_scoped.html",
            "{% extends 'scoped.html' %}{% block entry %}<{{ item }}>{% endblock %}",
        ),
        (
            "child_unscoped.html",
            "{% extends 'unscoped.html' %}{% block entry %}{{ item }}x{% endblock %}",
        ),
    ]);
    let ctx = data(json!({ "seq": [1, 2] }));
    let out = env
        .get_template("child_scoped.html")
        .unwrap()
        .render(&ctx)
        .unwrap();
    assert_eq!(out, "<1><2>");

    // without `scoped` the block sees only the render data, so the loop
    // target is undefined inside it
    let out = env
        .get_template("child_unscoped.html")
        .unwrap()
        .render(&ctx)
        .unwrap();
    assert_eq!(out, "xx");
}

#[test]
fn include_with_and_without_context() {
    let mut env = env_with(&[("header.html", "Hi {{ name }}{{ site }}")]);
    env.add_global("site", Value::String("!".into()));
    let ctx = data(json!({ "name": "ada" }));
    assert_eq!(
        env.render_str("{% include 'header.html' %}", &ctx).unwrap(),
        "Hi ada!"
    );
    // without context: globals stay visible, render data does not
    assert_eq!(
        env.render_str("{% include 'header.html' without context %}", &ctx)
            .unwrap(),
        "Hi !"
    );
}

#[test]
fn include_ignore_missing_and_candidate_lists() {
    let env = env_with(&[("real.html", "ok")]);
    let ctx = data(json!({}));
    assert_eq!(
        env.render_str("{% include 'nope.html' ignore missing %}", &ctx)
            .unwrap(),
        ""
    );
    assert_eq!(
        env.render_str("{% include ['nope.html', 'real.html'] %}", &ctx)
            .unwrap(),
        "ok"
    );
    let err = env
        .render_str("{% include ['a.html', 'b.html'] %}", &ctx)
        .unwrap_err();
    match err {
        Error::TemplatesNotFound(names) => assert_eq!(names, vec!["a.html", "b.html"]),
        other => panic!("expected TemplatesNotFound, got {other:?}"),
    }
    let err = env.render_str("{% include 'nope.html' %}", &ctx).unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound(name) if name == "nope.html"));
}

#[test]
fn included_template_renders_its_own_inheritance() {
    let env = env_with(&[
        ("base.html", "[{% block x %}b{% endblock %}]"),
        (
            "child.html",
            "{% extends 'base.html' %}{% block x %}c{% endblock %}",
        ),
    ]);
    assert_eq!(
        env.render_str("pre {% include 'child.html' %} post", &data(json!({})))
            .unwrap(),
        "pre [c] post"
    );
}

#[test]
fn import_exposes_macros_and_sets() {
    let env = env_with(&[(
        "helpers.html",
        "{% macro greet(name) %}Hello {{ name }}!{% endmacro %}{% set version = 3 %}",
    )]);
    let ctx = data(json!({}));
    assert_eq!(
        env.render_str(
            "{% import 'helpers.html' as h %}{{ h.greet('x') }} v{{ h.version }}",
            &ctx
        )
        .unwrap(),
        "Hello x! v3"
    );
    assert_eq!(
        env.render_str(
            "{% from 'helpers.html' import greet as hi, version %}{{ hi('y') }} v{{ version }}",
            &ctx
        )
        .unwrap(),
        "Hello y! v3"
    );
}

#[test]
fn from_import_unknown_name_fails() {
    let env = env_with(&[("helpers.html", "{% set x = 1 %}")]);
    let err = env
        .render_str("{% from 'helpers.html' import nope %}", &data(json!({})))
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("does not export the requested name 'nope'"));
}

#[test]
fn macro_defaults_and_keyword_arguments() {
    let tmpl = "{% macro input(name, type='text') %}<input name=\"{{ name }}\" type=\"{{ type }}\">{% endmacro %}\
                {{ input('user') }}{{ input('pw', type='password') }}";
    let out = Environment::new().render_str(tmpl, &data(json!({}))).unwrap();
    assert_eq!(
        out,
        "<input name=\"user\" type=\"text\"><input name=\"pw\" type=\"password\">"
    );
}

#[test]
fn macro_scope_is_arguments_plus_globals() {
    // enclosing locals are not visible inside a macro body
    let tmpl = "{% set secret = 'hidden' %}{% macro peek() %}{{ secret }}{% endmacro %}[{{ peek() }}]";
    let out = Environment::new().render_str(tmpl, &data(json!({}))).unwrap();
    assert_eq!(out, "[]");
}

#[test]
fn macro_can_recurse() {
    let tmpl = "{% macro fact(n) %}{% if n <= 1 %}1{% else %}{{ n }}*{{ fact(n - 1) }}{% endif %}{% endmacro %}{{ fact(3) }}";
    let out = Environment::new().render_str(tmpl, &data(json!({}))).unwrap();
    assert_eq!(out, "3*2*1");
}

#[test]
fn macro_argument_errors() {
    let env = Environment::new();
    let ctx = data(json!({}));
    let err = env
        .render_str(
            "{% macro m(a) %}{{ a }}{% endmacro %}{{ m(1, 2) }}",
            &ctx,
        )
        .unwrap_err();
    assert!(err.to_string().contains("takes not more than 1 argument(s)"));

    let err = env
        .render_str(
            "{% macro m(a) %}{{ a }}{% endmacro %}{{ m(b=1) }}",
            &ctx,
        )
        .unwrap_err();
    assert!(err.to_string().contains("unexpected keyword argument 'b'"));
}

#[test]
fn call_block_provides_caller() {
    let tmpl = "{% macro wrap() %}[{{ caller() }}]{% endmacro %}\
                {% set prefix = 'P' %}{% call wrap() %}{{ prefix }}inner{% endcall %}";
    let out = Environment::new().render_str(tmpl, &data(json!({}))).unwrap();
    assert_eq!(out, "[Pinner]");
}

#[test]
fn call_block_with_caller_arguments() {
    let tmpl = "{% macro dump(items) %}{% for i in items %}{{ caller(i) }}{% endfor %}{% endmacro %}\
                {% call(x) dump([1, 2]) %}<{{ x }}>{% endcall %}";
    let out = Environment::new().render_str(tmpl, &data(json!({}))).unwrap();
    assert_eq!(out, "<1><2>");
}

#[test]
fn circular_inheritance_is_detected() {
    let env = env_with(&[
        ("a.html", "{% extends 'b.html' %}"),
        ("b.html", "{% extends 'a.html' %}"),
    ]);
    let err = env
        .get_template("a.html")
        .unwrap()
        .render(&data(json!({})))
        .unwrap_err();
    assert!(err.to_string().contains("circular"));
}

#[test]
fn self_include_is_detected() {
    let env = env_with(&[("a.html", "{% include 'a.html' %}")]);
    let err = env
        .get_template("a.html")
        .unwrap()
        .render(&data(json!({})))
        .unwrap_err();
    assert!(err.to_string().contains("circular"));
}

struct CountingLoader {
    inner: MapLoader,
    loads: Rc<Cell<usize>>,
}

impl Loader for CountingLoader {
    fn load(&self, env: &Environment, name: &str) -> ginja::Result<String> {
        self.loads.set(self.loads.get() + 1);
        self.inner.load(env, name)
    }

    fn list(&self) -> Vec<String> {
        self.inner.list()
    }
}

#[test]
fn template_cache_honors_auto_reload() {
    let loads = Rc::new(Cell::new(0));
    let mut inner = MapLoader::new();
    inner.insert("t.html", "cached");

    let mut env = Environment::new();
    env.set_loader(CountingLoader {
        inner: inner.clone(),
        loads: Rc::clone(&loads),
    });
    // auto_reload defaults to on: the cache is bypassed
    env.get_template("t.html").unwrap();
    env.get_template("t.html").unwrap();
    assert_eq!(loads.get(), 2);

    let mut env = Environment::new();
    env.set_loader(CountingLoader {
        inner,
        loads: Rc::clone(&loads),
    });
    env.set_auto_reload(false);
    loads.set(0);
    env.get_template("t.html").unwrap();
    env.get_template("t.html").unwrap();
    assert_eq!(loads.get(), 1);
}

#[test]
fn list_templates_delegates_to_loader() {
    let env = env_with(&[("a.html", ""), ("b.html", "")]);
    assert_eq!(env.list_templates(), vec!["a.html", "b.html"]);
    assert!(Environment::new().list_templates().is_empty());
}

#[test]
fn template_path_is_exposed() {
    let env = env_with(&[("page.html", "x")]);
    assert_eq!(env.get_template("page.html").unwrap().path(), Some("page.html"));
    assert_eq!(env.from_string("x").unwrap().path(), None);
}
