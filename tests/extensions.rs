use std::time::Duration;

use async_trait::async_trait;
use blockjinja::ast::{Node, NodeRef};
use blockjinja::extension::call_node;
use blockjinja::lexer::Token;
use blockjinja::parser::Parser;
use blockjinja::{CallArgs, Content, Context, Environment, Extension, Result, Value};
use serde_json::json;

/// `{% shout prefix %}body{% endshout %}` renders `prefix` followed by the
/// upper-cased body.
struct Shout;

#[async_trait(?Send)]
impl Extension for Shout {
    fn name(&self) -> &str {
        "shout"
    }

    fn tags(&self) -> &[&'static str] {
        &["shout"]
    }

    fn parse(&self, parser: &mut Parser<'_>, tag: Token) -> Result<NodeRef> {
        let prefix = parser.parse_expression()?;
        let args = Node::list(tag.line, tag.column, vec![prefix]);
        parser.advance_after_block_end(&tag.value)?;
        let (body, _) = parser.parse_body(&tag, &["endshout"])?;
        parser.finish_end_tag("endshout")?;
        Ok(call_node(self, &tag, "run", args, vec![body]))
    }

    async fn run(&self, _context: &Context, method: &str, args: CallArgs, content: Vec<Content<'_>>) -> Result<Value> {
        assert_eq!(method, "run");
        let mut body = String::new();
        for part in content {
            body.push_str(&part.render().await?);
        }
        let prefix = args.get(0, "prefix").cloned().unwrap_or_default();
        Ok(Value::from(format!("{}{}", prefix, body.to_uppercase())))
    }
}

/// `{% user_name %}`: reads the render data and suspends before answering.
struct UserName;

#[async_trait(?Send)]
impl Extension for UserName {
    fn name(&self) -> &str {
        "user_name"
    }

    fn tags(&self) -> &[&'static str] {
        &["user_name"]
    }

    fn is_async(&self) -> bool {
        true
    }

    fn autoescape(&self) -> bool {
        false
    }

    fn parse(&self, parser: &mut Parser<'_>, tag: Token) -> Result<NodeRef> {
        parser.advance_after_block_end(&tag.value)?;
        let args = Node::list(tag.line, tag.column, vec![]);
        Ok(call_node(self, &tag, "lookup", args, vec![]))
    }

    async fn run(&self, context: &Context, _method: &str, _args: CallArgs, _content: Vec<Content<'_>>) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(context.lookup("user"))
    }
}

#[test]
fn extension_tags_parse_and_render() {
    let mut env = Environment::new();
    env.add_extension(Shout);
    let out = env
        .render_string("{% shout '> ' %}hello {{ name }}{% endshout %}!", json!({ "name": "ann" }))
        .unwrap();
    assert_eq!(out, "&gt; HELLO ANN!");
}

#[test]
fn extension_bodies_see_loop_variables() {
    let mut env = Environment::new();
    env.add_extension(Shout);
    let out = env
        .render_string("{% for x in ['a', 'b'] %}{% shout loop.index %}{{ x }}{% endshout %}{% endfor %}", json!({}))
        .unwrap();
    assert_eq!(out, "1A2B");
}

#[test]
fn unregistered_tags_are_unknown() {
    let err = Environment::new().render_string("{% shout 'x' %}{% endshout %}", json!({})).unwrap_err();
    assert!(err.message().contains("unknown block tag"), "{}", err);
}

#[tokio::test]
async fn async_extensions_read_the_context() {
    let mut env = Environment::new();
    env.add_extension(UserName);
    let out = env
        .render_string_async("<{% user_name %}>", json!({ "user": "<root>" }))
        .await
        .unwrap();
    // Not escaped: the extension opted out
    assert_eq!(out, "<<root>>");
}

#[tokio::test]
async fn async_extensions_inside_loops() {
    let mut env = Environment::new();
    env.add_extension(UserName);
    let out = env
        .render_string_async("{% for i in range(3) %}{{ i }}{% user_name %}{% endfor %}", json!({ "user": "u" }))
        .await
        .unwrap();
    assert_eq!(out, "0u1u2u");
}
