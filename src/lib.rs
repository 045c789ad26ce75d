//! blockjinja: a block-structured Jinja/Nunjucks-style template engine.
//!
//! Templates go through four stages:
//! - the tokenizer ([`lexer`]) splits source text into data and tag tokens;
//! - the parser ([`parser`]) builds a tree of [`ast::Node`]s;
//! - the transformer ([`transformer`]) lifts async calls and `super()` out of
//!   expressions;
//! - the renderer walks the tree against a [`scope::Frame`] chain and a
//!   per-render [`Context`].
//!
//! Supported syntax includes `if`/`elif`/`else`, `for` with loop metadata,
//! `set` (direct and capture), macros with `call` blocks, template
//! inheritance (`extends`, `block`, `super()`), `include`, `import` and
//! `from … import`, `raw`/`verbatim`, `filter` blocks, whitespace control
//! with `-`, and host-defined tags through [`Extension`].
//!
//! Rendering is asynchronous at heart: filters, loaders and extensions may
//! return futures. The synchronous entry points drive the render to
//! completion in place and fail if anything actually suspends.
//!
//! ```
//! use blockjinja::{Environment, MemoryLoader};
//! use serde_json::json;
//!
//! let mut env = Environment::new();
//! env.add_loader(
//!     MemoryLoader::new()
//!         .with_template("base.html", "<h1>{% block title %}Site{% endblock %}</h1>")
//!         .with_template("page.html", "{% extends 'base.html' %}{% block title %}{{ name }} | {{ super() }}{% endblock %}"),
//! );
//! let html = env.render("page.html", json!({ "name": "Home" })).unwrap();
//! assert_eq!(html, "<h1>Home | Site</h1>");
//! ```

pub mod ast;
mod builtins;
pub mod config;
pub mod environment;
pub mod error;
mod eval;
pub mod extension;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod scope;
pub mod transformer;
pub mod value;

use once_cell::sync::Lazy;

pub use config::{Config, Delimiters};
pub use environment::{Environment, Template};
pub use error::{ErrorKind, Result, TemplateError};
pub use extension::{Content, Extension};
pub use loader::{Loader, MemoryLoader, Source};
pub use scope::Context;
pub use value::{CallArgs, Function, Map, Value};

static DEFAULT_ENV: Lazy<Environment> = Lazy::new(Environment::new);

/// Render `source` with a default [`Environment`] (autoescaping on, no
/// loaders, built-in tests and globals only).
///
/// ```
/// let out = blockjinja::render_string("Hello {{ who }}!", serde_json::json!({ "who": "<you>" })).unwrap();
/// assert_eq!(out, "Hello &lt;you&gt;!");
/// ```
pub fn render_string(source: &str, data: impl Into<Value>) -> Result<String> {
    DEFAULT_ENV.render_string(source, data)
}
