use blockjinja::{Environment, ErrorKind, MemoryLoader};
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

// ── extends / block / super ──

#[test]
fn child_overrides_parent_blocks() {
    let env = env_with(&[
        ("base.html", "<title>{% block title %}Default{% endblock %}</title><main>{% block body %}{% endblock %}</main>"),
        ("page.html", "{% extends 'base.html' %}ignored{% block body %}Hello {{ name }}{% endblock %}"),
    ]);
    assert_eq!(
        env.render("page.html", json!({ "name": "Ann" })).unwrap(),
        "<title>Default</title><main>Hello Ann</main>"
    );
}

#[test]
fn super_renders_the_overridden_block() {
    let env = env_with(&[
        ("base.html", "{% block nav %}<a>home</a>{% endblock %}"),
        ("mid.html", "{% extends 'base.html' %}{% block nav %}{{ super() }}<a>blog</a>{% endblock %}"),
        ("leaf.html", "{% extends 'mid.html' %}{% block nav %}{{ super() }}<a>post</a>{% endblock %}"),
    ]);
    assert_eq!(env.render("leaf.html", json!({})).unwrap(), "<a>home</a><a>blog</a><a>post</a>");
    assert_eq!(env.render("mid.html", json!({})).unwrap(), "<a>home</a><a>blog</a>");
}

#[test]
fn nested_blocks_can_be_overridden_separately() {
    let env = env_with(&[
        ("base.html", "{% block outer %}[{% block inner %}base{% endblock %}]{% endblock %}"),
        ("child.html", "{% extends 'base.html' %}{% block inner %}child{% endblock %}"),
    ]);
    assert_eq!(env.render("child.html", json!({})).unwrap(), "[child]");
}

#[test]
fn top_level_sets_in_child_are_visible_to_parent() {
    let env = env_with(&[
        ("base.html", "<h1>{{ title }}</h1>{% block body %}{% endblock %}"),
        ("page.html", "{% extends 'base.html' %}{% set title = 'Page' %}{% block body %}{{ title }}!{% endblock %}"),
    ]);
    assert_eq!(env.render("page.html", json!({})).unwrap(), "<h1>Page</h1>Page!");
}

#[test]
fn extends_accepts_an_expression() {
    let env = env_with(&[
        ("a.html", "A:{% block x %}{% endblock %}"),
        ("b.html", "B:{% block x %}{% endblock %}"),
        ("page.html", "{% extends layout ~ '.html' %}{% block x %}page{% endblock %}"),
    ]);
    assert_eq!(env.render("page.html", json!({ "layout": "b" })).unwrap(), "B:page");
}

#[test]
fn super_without_a_parent_block_fails() {
    let env = env_with(&[("solo.html", "{% block a %}{{ super() }}{% endblock %}")]);
    let err = env.render("solo.html", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Evaluation);
    assert!(err.message().contains("no super block"), "{}", err);
}

#[test]
fn cyclic_extends_is_an_error() {
    let env = env_with(&[
        ("a.html", "{% extends 'b.html' %}{% block x %}a{% endblock %}"),
        ("b.html", "{% extends 'a.html' %}{% block x %}b{% endblock %}"),
        ("self.html", "{% extends 'self.html' %}"),
    ]);
    let err = env.render("a.html", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Evaluation);
    assert!(err.message().contains("a.html -> b.html -> a.html"), "{}", err);

    let err = env.render("self.html", json!({})).unwrap_err();
    assert!(err.message().contains("self.html -> self.html"), "{}", err);
}

// ── include ──

#[test]
fn include_sees_render_data_and_locals() {
    let env = env_with(&[
        ("item.html", "<li>{{ item }} of {{ owner }}</li>"),
        ("list.html", "<ul>{% for item in items %}{% include 'item.html' %}{% endfor %}</ul>"),
    ]);
    assert_eq!(
        env.render("list.html", json!({ "items": ["a", "b"], "owner": "me" })).unwrap(),
        "<ul><li>a of me</li><li>b of me</li></ul>"
    );
}

#[test]
fn include_cannot_change_the_includer() {
    let env = env_with(&[
        ("inner.html", "{% set x = 'inner' %}{{ x }}"),
        ("outer.html", "{% set x = 'outer' %}{% include 'inner.html' %}|{{ x }}"),
    ]);
    assert_eq!(env.render("outer.html", json!({})).unwrap(), "inner|outer");
}

#[test]
fn include_ignore_missing() {
    let env = env_with(&[("page.html", "a{% include 'nope.html' ignore missing %}b")]);
    assert_eq!(env.render("page.html", json!({})).unwrap(), "ab");

    let env = env_with(&[("page.html", "a{% include 'nope.html' %}b")]);
    let err = env.render("page.html", json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}

#[test]
fn relative_includes() {
    let env = env_with(&[
        ("pages/home.html", "{% include './parts/nav.html' %}"),
        ("pages/parts/nav.html", "nav:{% include '../footer.html' %}"),
        ("pages/footer.html", "footer"),
    ]);
    assert_eq!(env.render("pages/home.html", json!({})).unwrap(), "nav:footer");
}

// ── import / from import ──

const FORMS: &str = "{% set prefix = 'f-' %}\
                     {% macro input(name) %}<input id=\"{{ prefix }}{{ name }}\">{% endmacro %}\
                     {% macro label(text) %}<label>{{ text }}{{ suffix }}</label>{% endmacro %}\
                     {% set _hidden = 1 %}";

#[test]
fn import_binds_exports() {
    let env = env_with(&[
        ("forms.html", FORMS),
        ("page.html", "{% import 'forms.html' as forms %}{{ forms.input('user') }}[{{ forms.prefix }}][{{ forms._hidden }}]"),
    ]);
    assert_eq!(env.render("page.html", json!({})).unwrap(), "<input id=\"f-user\">[f-][]");
}

#[test]
fn from_import_with_aliases() {
    let env = env_with(&[
        ("forms.html", FORMS),
        ("page.html", "{% from 'forms.html' import input as field, label %}{{ field('a') }}{{ label('L') }}"),
    ]);
    assert_eq!(env.render("page.html", json!({ "suffix": ":" })).unwrap(), "<input id=\"f-a\"><label>L</label>");
}

#[test]
fn import_with_context_sees_render_data() {
    let env = env_with(&[
        ("forms.html", FORMS),
        ("page.html", "{% from 'forms.html' import label with context %}{{ label('L') }}"),
    ]);
    assert_eq!(env.render("page.html", json!({ "suffix": ":" })).unwrap(), "<label>L:</label>");
}

#[test]
fn importing_an_unknown_name_fails() {
    let env = env_with(&[
        ("forms.html", FORMS),
        ("page.html", "{% from 'forms.html' import missing %}"),
    ]);
    let err = env.render("page.html", json!({})).unwrap_err();
    assert!(err.message().contains("cannot import 'missing'"), "{}", err);
}

#[test]
fn imported_template_output_is_discarded() {
    let env = env_with(&[
        ("lib.html", "noise{% macro hi() %}hi{% endmacro %}"),
        ("page.html", "{% import 'lib.html' as lib %}[{{ lib.hi() }}]"),
    ]);
    assert_eq!(env.render("page.html", json!({})).unwrap(), "[hi]");
}
