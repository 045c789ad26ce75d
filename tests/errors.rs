use blockjinja::{render_string, Config, Environment, ErrorKind, MemoryLoader};
use serde_json::json;

fn env_with(templates: &[(&str, &str)]) -> Environment {
    let loader = MemoryLoader::new();
    for (name, text) in templates {
        loader.insert(*name, *text);
    }
    let mut env = Environment::new();
    env.add_loader(loader);
    env
}

fn strict_env() -> Environment {
    Environment::with_config(Config {
        throw_on_undefined: true,
        ..Config::default()
    })
    .unwrap()
}

// ── Compile errors ──

#[test]
fn syntax_errors_carry_positions() {
    let err = render_string("line one\nline two {{ 1 + }}", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(err.line(), Some(2));
    assert!(err.to_string().starts_with("(<string>) [Line 2, Column"), "{}", err);
}

#[test]
fn lexical_errors() {
    let err = render_string("{{ 'open }}", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lexical);
    let err = render_string("{# never closed", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lexical);
}

#[test]
fn unclosed_blocks_name_their_opener() {
    let err = render_string("{% for x in xs %}\n{% if x %}\n{% endfor %}", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert!(err.message().contains("endif"), "{}", err);
    assert!(err.message().contains("line 2"), "{}", err);
}

#[test]
fn unknown_tags() {
    let err = render_string("{% shout %}", json!({})).unwrap_err();
    assert_eq!(err.message(), "unknown block tag: shout");
}

// ── Render errors ──

#[test]
fn strict_mode_rejects_undefined_output() {
    let env = strict_env();
    let err = env.render_string("ok\n{{ missing }}", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Evaluation);
    assert_eq!(err.message(), "attempted to output null or undefined value");
    assert_eq!(err.line(), Some(2));

    assert!(env.render_string("{{ nothing }}", json!({ "nothing": null })).is_err());
    // Only output is checked
    assert_eq!(env.render_string("{% if missing %}x{% endif %}{{ missing or 'y' }}", json!({})).unwrap(), "y");
}

#[test]
fn unknown_filters_and_tests() {
    let err = render_string("{{ x | frobnicate }}", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_eq!(err.message(), "filter not found: frobnicate");

    let err = render_string("{{ x is frobnicated }}", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}

#[test]
fn arithmetic_on_missing_values_fails() {
    let err = render_string("{{ missing + 1 }}", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Evaluation);
    assert!(err.message().contains("unsupported operand"), "{}", err);
}

#[test]
fn calling_undefined_names_the_callee() {
    let err = render_string("{{ helpers.format(1) }}", json!({ "helpers": {} })).unwrap_err();
    assert!(err.message().contains("`format`"), "{}", err);
}

// ── Template chains ──

#[test]
fn errors_name_the_included_template_and_the_chain() {
    let env = env_with(&[
        ("page.html", "<body>\n{% include 'partial.html' %}\n</body>"),
        ("partial.html", "fine\nfine\n{{ 1 + none }}"),
    ]);
    let err = env.render("page.html", json!({})).unwrap_err();
    assert_eq!(err.template(), Some("partial.html"));
    assert_eq!(err.line(), Some(3));
    assert_eq!(err.chain(), ["page.html".to_string()]);
    let text = err.to_string();
    assert!(text.starts_with("(partial.html) [Line 3, Column"), "{}", text);
    assert!(text.ends_with("via page.html"), "{}", text);
}

#[test]
fn parse_errors_in_parents_are_reported_against_the_parent() {
    let env = env_with(&[
        ("base.html", "{% block a %}{% endblock %}{{ }}"),
        ("child.html", "{% extends 'base.html' %}"),
    ]);
    let err = env.render("child.html", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(err.template(), Some("base.html"));
    assert_eq!(err.chain(), ["child.html".to_string()]);
}

#[test]
fn errors_in_imported_macros_point_at_the_macro_source() {
    let env = env_with(&[
        ("lib.html", "{% macro boom() %}\n{{ nope() }}{% endmacro %}"),
        ("page.html", "{% import 'lib.html' as lib %}{{ lib.boom() }}"),
    ]);
    let err = env.render("page.html", json!({})).unwrap_err();
    assert_eq!(err.template(), Some("lib.html"));
    assert_eq!(err.line(), Some(2));
    assert_eq!(err.chain(), ["page.html".to_string()]);
}

#[test]
fn first_error_wins() {
    let env = strict_env();
    let err = env.render_string("{{ a }}{{ b | nope }}", json!({})).unwrap_err();
    assert_eq!(err.message(), "attempted to output null or undefined value");
}
