
use fixtures::{context, generate_random_whitespace, generate_random_whitespace_at_least_one, get_engine, get_engine_with};
use jinjate::{
    AutoEscape, Context, Environment, ErrorKind, MemoryBytecodeCache, TemplateEngine, UndefinedBehavior, Value,
};

fn render(env: &Environment, source: &str, ctx: &Context) -> String {
    env.from_string(source).unwrap().render(ctx).unwrap()
}

#[test]
#[ntest::timeout(100)]
fn test_basic_substitution() {
    let mut engine = get_engine();
    TemplateEngine::add_template(&mut engine, "Template A", "Hello {{ name|upper }}!").unwrap();

    let missing = engine.context("Template A", &Context::new()).unwrap();
    assert_eq!(missing.len(), 1, "should need a single variable");
    assert!(missing.contains("name"));

    let ctx = context([("name", Value::from("world"))]);
    let rendered = TemplateEngine::render(&engine, "Template A", Some(&ctx)).unwrap();
    assert_eq!(rendered, "Hello WORLD!", "Rendered string should match the template.");
}

#[test]
#[ntest::timeout(100)]
fn test_basic_iteration() {
    let template = format!(
        "{{%{}for{}cat{}in{}cats{}%}}Greetings {{{{{}cat{}}}}}\n{{%{}endfor{}%}}",
        generate_random_whitespace(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
    );

    let mut engine = get_engine();
    engine.add_template("Template A", &template).unwrap();

    let missing = engine.context("Template A", &Context::new()).unwrap();
    assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec!["cats".to_string()]);

    let ctx = context([("cats", Value::from(vec!["Fluffy", "Whiskers", "Mittens"]))]);
    let rendered = TemplateEngine::render(&engine, "Template A", Some(&ctx)).unwrap();
    assert_eq!(rendered, "Greetings Fluffy\nGreetings Whiskers\nGreetings Mittens\n");
}

#[test]
#[ntest::timeout(100)]
fn test_range_loop_and_macro() {
    let env = get_engine();
    assert_eq!(render(&env, "{% for i in range(3) %}{{ i }}{% endfor %}", &Context::new()), "012");
    assert_eq!(
        render(&env, "{% macro greet(n) %}Hi {{ n }}{% endmacro %}{{ greet('Bob') }}", &Context::new()),
        "Hi Bob"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_whitespace_control() {
    let mut env = get_engine();
    env.set_trim_blocks(true);
    assert_eq!(render(&env, "{% if true %}\nX{% endif %}", &Context::new()), "X");

    let mut env = get_engine();
    env.set_lstrip_blocks(true);
    assert_eq!(render(&env, "   {% if true %}X{% endif %}", &Context::new()), "X");

    let env = get_engine();
    assert_eq!(render(&env, "a  {%- if true -%}  b  {%- endif %}", &Context::new()), "ab");
}

#[test]
#[ntest::timeout(100)]
fn test_folding_agrees_with_runtime() {
    let mut env = get_engine();
    assert_eq!(render(&env, "{{ 1 + 2 * 3 }}", &Context::new()), "7");
    env.set_optimized(false);
    assert_eq!(render(&env, "{{ 1 + 2 * 3 }}", &Context::new()), "7");
    let ctx = context([("two", Value::from(2))]);
    assert_eq!(render(&env, "{{ 1 + two * 3 }}", &ctx), "7");
}

#[test]
#[ntest::timeout(100)]
fn test_tuple_versus_parenthesized_value() {
    let env = get_engine();
    assert_eq!(render(&env, "{{ (1,)|length }}", &Context::new()), "1");
    assert_eq!(render(&env, "{{ (1) + 1 }}", &Context::new()), "2");
}

#[test]
#[ntest::timeout(100)]
fn test_conditional_set_resolves_dynamically() {
    let env = get_engine();
    let source = "{% set x = 1 %}{% if cond %}{% set x = 2 %}{% endif %}{{ x }}";
    assert_eq!(render(&env, source, &context([("cond", Value::from(true))])), "2");
    assert_eq!(render(&env, source, &context([("cond", Value::from(false))])), "1");
}

#[test]
#[ntest::timeout(100)]
fn test_undefined_behaviors() {
    let mut env = get_engine();
    assert_eq!(render(&env, "[{{ missing }}]", &Context::new()), "[]");
    let err = env.from_string("{{ missing.attr }}").unwrap().render(&Context::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Undefined);
    assert_eq!(err.message(), "'missing' is undefined");

    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let err = env.from_string("{{ missing }}").unwrap().render(&Context::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Undefined);
    assert!(env.from_string("{% if missing %}{% endif %}").unwrap().render(&Context::new()).is_err());

    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    assert_eq!(render(&env, "[{{ missing.a.b }}]", &Context::new()), "[]");

    env.set_undefined_behavior(UndefinedBehavior::Debug);
    assert_eq!(render(&env, "{{ missing }}", &Context::new()), "{{ missing }}");
}

#[test]
#[ntest::timeout(100)]
fn test_loop_metadata_over_one_shot_iterable() {
    let env = get_engine();
    let items = Value::from_iter_once(vec![Value::from("a"), Value::from("b"), Value::from("c")]);
    let rendered = render(
        &env,
        "{% for x in items %}{{ loop.index }}{{ loop.first }}{{ loop.last }}{{ loop.length }};{% endfor %}",
        &context([("items", items)]),
    );
    assert_eq!(rendered, "1TrueFalse3;2FalseFalse3;3FalseTrue3;");
}

#[test]
#[ntest::timeout(100)]
fn test_inheritance_with_super() {
    let (env, _) = get_engine_with(&[
        ("base.html", "<{% block title %}Base{% endblock %}|{% block body %}body{% endblock %}>"),
        (
            "child.html",
            "{% extends 'base.html' %}ignored{% block title %}Child {{ super() }}{% endblock %}",
        ),
    ]);
    let rendered = env.get_template("child.html").unwrap().render(&Context::new()).unwrap();
    assert_eq!(rendered, "<Child Base|body>");
}

#[test]
#[ntest::timeout(100)]
fn test_multi_level_inheritance_and_self() {
    let (env, _) = get_engine_with(&[
        ("a.html", "{% block x %}A{% endblock %}/{{ self.x() }}"),
        ("b.html", "{% extends 'a.html' %}{% block x %}B{{ super() }}{% endblock %}"),
        ("c.html", "{% extends 'b.html' %}{% block x %}C{{ super() }}{% endblock %}"),
    ]);
    let rendered = env.get_template("c.html").unwrap().render(&Context::new()).unwrap();
    assert_eq!(rendered, "CBA/CBA");
}

#[test]
#[ntest::timeout(100)]
fn test_required_and_scoped_blocks() {
    let (env, _) = get_engine_with(&[
        ("base.html", "[{% block content required %}{% endblock %}]"),
        ("page.html", "{% extends 'base.html' %}{% block content %}filled{% endblock %}"),
    ]);
    assert_eq!(env.get_template("page.html").unwrap().render(&Context::new()).unwrap(), "[filled]");
    let err = env.get_template("base.html").unwrap().render(&Context::new()).unwrap_err();
    assert_eq!(err.message(), "Required block 'content' not found");

    let env = get_engine();
    assert_eq!(
        render(&env, "{% for i in range(2) %}{% block b scoped %}{{ i }}{% endblock %}{% endfor %}", &Context::new()),
        "01"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_bytecode_cache_matches_fresh_compile() {
    let source = "{% for i in range(n) %}{{ i * 2 }},{% endfor %}";
    let ctx = context([("n", Value::from(3))]);
    let cache = MemoryBytecodeCache::new();

    let (fresh, _) = get_engine_with(&[("t.html", source)]);
    let expected = fresh.get_template("t.html").unwrap().render(&ctx).unwrap();

    let (mut primer, _) = get_engine_with(&[("t.html", source)]);
    primer.set_bytecode_cache(cache.clone());
    primer.get_template("t.html").unwrap();

    let (mut cached, loader) = get_engine_with(&[("t.html", source)]);
    cached.set_bytecode_cache(cache.clone());
    assert_eq!(cached.get_template("t.html").unwrap().render(&ctx).unwrap(), expected);

    loader.insert("t.html", "changed {{ n }}");
    assert_eq!(cached.get_template("t.html").unwrap().render(&ctx).unwrap(), "changed 3");
}

#[test]
#[ntest::timeout(100)]
fn test_include_and_imports() {
    let (env, _) = get_engine_with(&[
        ("header.html", "<h1>{{ title }}</h1>"),
        ("macros.html", "{% macro link(url, text='go') %}<a href=\"{{ url }}\">{{ text }}</a>{% endmacro %}{% set version = 2 %}"),
        (
            "page.html",
            "{% include 'header.html' %}{% include 'missing.html' ignore missing %}\
             {% import 'macros.html' as m %}{{ m.link('/a') }}{{ m.version }}\
             {% from 'macros.html' import link as l %}{{ l('/b', text='b') }}",
        ),
    ]);
    let ctx = context([("title", Value::from("Hi"))]);
    let rendered = env.get_template("page.html").unwrap().render(&ctx).unwrap();
    assert_eq!(rendered, "<h1>Hi</h1><a href=\"/a\">go</a>2<a href=\"/b\">b</a>");

    let err = env
        .from_string("{% include 'missing.html' %}")
        .unwrap()
        .render(&Context::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
}

#[test]
#[ntest::timeout(100)]
fn test_include_list_and_without_context() {
    let (env, _) = get_engine_with(&[("b.html", "[{{ who }}]")]);
    let ctx = context([("who", Value::from("me"))]);
    assert_eq!(render(&env, "{% include ['a.html', 'b.html'] %}", &ctx), "[me]");
    assert_eq!(render(&env, "{% include 'b.html' without context %}", &ctx), "[]");
    let err = env.from_string("{% include ['x.html', 'y.html'] %}").unwrap().render(&ctx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplatesNotFound);
}

#[test]
#[ntest::timeout(100)]
fn test_missing_import_name_is_explained() {
    let (env, _) = get_engine_with(&[("macros.html", "{% macro a() %}{% endmacro %}")]);
    let mut strict = get_engine_with(&[("macros.html", "{% macro a() %}{% endmacro %}")]).0;
    strict.set_undefined_behavior(UndefinedBehavior::Strict);
    assert_eq!(render(&env, "{% from 'macros.html' import b %}[{{ b }}]", &Context::new()), "[]");
    strict.add_template("main.html", "{% from 'macros.html' import b %}{{ b }}").unwrap();
    let err = strict.get_template("main.html").unwrap().render(&Context::new()).unwrap_err();
    assert_eq!(
        err.message(),
        "the template 'macros.html' (imported on line 1 in 'main.html') does not export the requested name 'b'"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_autoescape() {
    let mut env = get_engine();
    env.set_autoescape(AutoEscape::Enabled);
    let ctx = context([("html", Value::from("<b>"))]);
    assert_eq!(render(&env, "{{ html }}", &ctx), "&lt;b&gt;");
    assert_eq!(render(&env, "{{ html|safe }}", &ctx), "<b>");
    assert_eq!(render(&env, "{% autoescape false %}{{ html }}{% endautoescape %}", &ctx), "<b>");
    assert_eq!(
        render(&env, "{% macro m() %}<i>{{ html }}</i>{% endmacro %}{{ m() }}", &ctx),
        "<i>&lt;b&gt;</i>"
    );
    let env = get_engine();
    assert_eq!(render(&env, "{{ html }}{{ html|e }}", &ctx), "<b>&lt;b&gt;");
}

#[test]
#[ntest::timeout(100)]
fn test_call_blocks_and_macro_features() {
    let env = get_engine();
    assert_eq!(
        render(
            &env,
            "{% macro wrap(tag) %}<{{ tag }}>{{ caller(1) }}</{{ tag }}>{% endmacro %}\
             {% call(n) wrap('p') %}n={{ n }}{% endcall %}",
            &Context::new()
        ),
        "<p>n=1</p>"
    );
    assert_eq!(
        render(
            &env,
            "{% macro m(a, b=2) %}{{ a }}{{ b }}{{ varargs|length }}{{ kwargs|length }}{% endmacro %}{{ m(1) }}|{{ m(1, 3, 4, x=5) }}",
            &Context::new()
        ),
        "1200|1311"
    );
    assert_eq!(
        render(
            &env,
            "{% macro m() %}{{ varargs }}{% endmacro %}{{ m() }}|{{ m(1) }}|{{ m(1, 'a') }}|{{ m.arguments }}",
            &Context::new()
        ),
        "()|(1,)|(1, 'a')|()"
    );
    assert_eq!(
        render(&env, "{{ (1,) }} {{ () }} {{ (1, 2) }} {{ (1) }} {{ [1] }} {% set t = 1, 2 %}{{ t }}", &Context::new()),
        "(1,) () (1, 2) 1 [1] (1, 2)"
    );
    assert_eq!(
        render(&env, "{% macro m(a, b) %}{% endmacro %}{{ m.name }}:{{ m.arguments|join(',') }}", &Context::new()),
        "m:a,b"
    );
    let err = env
        .from_string("{% macro m(a) %}{% endmacro %}{{ m(1, 2) }}")
        .unwrap()
        .render(&Context::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
#[ntest::timeout(100)]
fn test_recursive_loop() {
    let env = get_engine();
    let tree = Value::from(vec![
        Value::from_map([
            ("name", Value::from("a")),
            ("children", Value::from(vec![Value::from_map([("name", "b")])])),
        ]),
        Value::from_map([("name", Value::from("c"))]),
    ]);
    let rendered = render(
        &env,
        "{% for node in tree recursive %}{{ node.name }}{% if node.children %}({{ loop(node.children) }}){% endif %}{% endfor %}",
        &context([("tree", tree)]),
    );
    assert_eq!(rendered, "a(b)c");
}

#[test]
#[ntest::timeout(100)]
fn test_assignments_and_blocks() {
    let env = get_engine();
    assert_eq!(render(&env, "{% set a, b = 1, 2 %}{{ b }}{{ a }}", &Context::new()), "21");
    assert_eq!(render(&env, "{% set body | upper %}abc{% endset %}{{ body }}", &Context::new()), "ABC");
    assert_eq!(render(&env, "{% filter upper %}x{{ 'y' }}{% endfilter %}", &Context::new()), "XY");
    assert_eq!(
        render(&env, "{% with a = 1, b = 2 %}{{ a + b }}{% endwith %}[{{ a }}]", &Context::new()),
        "3[]"
    );
    assert_eq!(
        render(
            &env,
            "{% set ns = namespace(found=false) %}{% for i in [1, 2] %}{% if i == 2 %}{% set ns.found = true %}{% endif %}{% endfor %}{{ ns.found }}",
            &Context::new()
        ),
        "True"
    );
    assert_eq!(render(&env, "{% do 1 + 1 %}done", &Context::new()), "done");
}

#[test]
#[ntest::timeout(100)]
fn test_expressions() {
    let env = get_engine();
    let ctx = context([("items", Value::from(vec![1, 2, 3, 4])), ("d", Value::from_map([("k", "v")]))]);
    assert_eq!(render(&env, "{{ items[1:3] }}", &ctx), "[2, 3]");
    assert_eq!(render(&env, "{{ items[-1] }}", &ctx), "4");
    assert_eq!(render(&env, "{{ 2 in items }}{{ 5 not in items }}", &ctx), "TrueTrue");
    assert_eq!(render(&env, "{{ d.k }}{{ d['k'] }}", &ctx), "vv");
    assert_eq!(render(&env, "{{ 1 < 2 < 3 }}{{ 3 > 2 > 2 }}", &ctx), "TrueFalse");
    assert_eq!(render(&env, "{{ 'a' if false else 'b' }}{{ 'x' ~ 1 }}", &ctx), "bx1");
    assert_eq!(render(&env, "{{ 7 // 2 }}{{ 2 ** 3 }}{{ 7 % 3 }}", &ctx), "381");
    assert_eq!(render(&env, "{{ 3 is odd }}{{ 4 is not odd }}{{ 9 is divisibleby 3 }}", &ctx), "TrueTrueTrue");
    assert_eq!(render(&env, "{{ 'a' 'b' }}", &ctx), "ab");
}

#[test]
#[ntest::timeout(100)]
fn test_errors_carry_template_positions() {
    let (env, _) = get_engine_with(&[
        ("inner.html", "ok\n{{ 1 // 0 }}"),
        ("outer.html", "line one\n\n{% include 'inner.html' %}"),
    ]);
    let err = env.get_template("outer.html").unwrap().render(&Context::new()).unwrap_err();
    assert_eq!(err.name(), Some("inner.html"));
    assert_eq!(err.lineno(), Some(2));
    let frames: Vec<(Option<&str>, usize)> = err
        .traceback()
        .iter()
        .map(|frame| (frame.name.as_deref(), frame.lineno))
        .collect();
    assert_eq!(frames, vec![(Some("inner.html"), 2), (Some("outer.html"), 3)]);

    let err = env.from_string("{% for %}").unwrap_err();
    assert!(err.kind().is_syntax_error());
    assert_eq!(err.lineno(), Some(1));
}

#[test]
#[ntest::timeout(100)]
fn test_unknown_filter_in_dead_branch() {
    let env = get_engine();
    assert_eq!(render(&env, "{% if false %}{{ x|nope }}{% endif %}ok", &Context::new()), "ok");
    let err = env.from_string("{{ x|nope }}").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateAssertion);
}
