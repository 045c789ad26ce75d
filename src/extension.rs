//! Host-defined block tags.
//!
//! An extension claims one or more tag names. When the parser meets one of
//! them it hands control to [`Extension::parse`], which consumes the rest of
//! the tag (and any body) and returns a node built with [`call_node`]. At
//! render time the evaluator calls [`Extension::run`] with the evaluated
//! arguments and one lazily rendered [`Content`] per body.

use async_trait::async_trait;
use futures::future::LocalBoxFuture;

use crate::ast::{CallExtension, Node, NodeKind, NodeRef};
use crate::error::Result;
use crate::lexer::Token;
use crate::parser::Parser;
use crate::scope::Context;
use crate::value::{CallArgs, Value};

/// A body captured by an extension tag; rendering happens only when asked.
pub struct Content<'a> {
    render: Box<dyn FnOnce() -> LocalBoxFuture<'a, Result<String>> + 'a>,
}

impl<'a> Content<'a> {
    pub fn new<F>(render: F) -> Self
    where
        F: FnOnce() -> LocalBoxFuture<'a, Result<String>> + 'a,
    {
        Self {
            render: Box::new(render),
        }
    }

    pub async fn render(self) -> Result<String> {
        (self.render)().await
    }
}

#[async_trait(?Send)]
pub trait Extension: Send + Sync {
    /// Registry key; must match the `extension` recorded by [`call_node`].
    fn name(&self) -> &str;

    /// Block tags this extension parses.
    fn tags(&self) -> &[&'static str];

    /// Calls suspend (rendered through `CallExtensionAsync`).
    fn is_async(&self) -> bool {
        false
    }

    /// Escape the result when autoescaping is on.
    fn autoescape(&self) -> bool {
        true
    }

    /// Parse the tag. The `{%` and the tag name (`tag`) are already consumed.
    fn parse(&self, parser: &mut Parser<'_>, tag: Token) -> Result<NodeRef>;

    async fn run(
        &self,
        context: &Context,
        method: &str,
        args: CallArgs,
        content: Vec<Content<'_>>,
    ) -> Result<Value>;
}

/// Build the call node for `extension`.
pub fn call_node(
    extension: &dyn Extension,
    tag: &Token,
    method: &str,
    args: NodeRef,
    content: Vec<NodeRef>,
) -> NodeRef {
    let call = CallExtension {
        extension: extension.name().to_string(),
        method: method.to_string(),
        args,
        content,
        autoescape: extension.autoescape(),
    };
    let kind = if extension.is_async() {
        NodeKind::CallExtensionAsync(call)
    } else {
        NodeKind::CallExtension(call)
    };
    Node::new(tag.line, tag.column, kind)
}
