//! Template registry and render entry points.
//!
//! An [`Environment`] owns the configuration, loaders, filters, tests, globals
//! and extensions, plus a cache of loaded templates. It is cheap to clone and
//! safe to share between threads; registration goes through `&mut self` and
//! clears the cache, since compiled trees depend on what was registered.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::ast::{find_all, Node, NodeKind, NodeRef};
use crate::builtins;
use crate::config::Config;
use crate::error::{Result, TemplateError};
use crate::eval::Renderer;
use crate::extension::Extension;
use crate::loader::Loader;
use crate::parser::parse_template;
use crate::scope::{BlockDef, Frame};
use crate::transformer::transform;
use crate::value::{Map, Value};

pub type FilterFn = dyn Fn(Value, Vec<Value>) -> Result<Value> + Send + Sync;
pub type AsyncFilterFn = dyn Fn(Value, Vec<Value>) -> LocalBoxFuture<'static, Result<Value>> + Send + Sync;
pub type TestFn = dyn Fn(&Value, &[Value]) -> Result<bool> + Send + Sync;

#[derive(Clone)]
pub(crate) enum Filter {
    Sync(Arc<FilterFn>),
    Async(Arc<AsyncFilterFn>),
}

#[derive(Clone)]
struct Inner {
    config: Config,
    loaders: Vec<Arc<dyn Loader>>,
    filters: HashMap<String, Filter>,
    async_filters: HashSet<String>,
    tests: HashMap<String, Arc<TestFn>>,
    globals: Map,
    extensions: Vec<Arc<dyn Extension>>,
    cache: Arc<DashMap<String, Arc<Template>>>,
}

#[derive(Clone)]
pub struct Environment {
    inner: Arc<Inner>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// An environment with the default [`Config`] and the built-in tests,
    /// filters and globals. No loaders are installed.
    pub fn new() -> Self {
        let mut inner = Inner {
            config: Config::default(),
            loaders: Vec::new(),
            filters: HashMap::new(),
            async_filters: HashSet::new(),
            tests: HashMap::new(),
            globals: Map::new(),
            extensions: Vec::new(),
            cache: Arc::new(DashMap::new()),
        };
        for (name, filter) in builtins::filters() {
            inner.filters.insert(name.to_string(), Filter::Sync(filter));
        }
        for (name, test) in builtins::tests() {
            inner.tests.insert(name.to_string(), test);
        }
        for (name, value) in builtins::globals() {
            inner.globals.insert(name.to_string(), value);
        }
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        let mut env = Self::new();
        env.inner_mut().config = config;
        Ok(env)
    }

    fn inner_mut(&mut self) -> &mut Inner {
        let inner = Arc::make_mut(&mut self.inner);
        inner.cache = Arc::new(DashMap::new());
        inner
    }

    pub fn add_loader(&mut self, loader: impl Loader + 'static) -> &mut Self {
        self.inner_mut().loaders.push(Arc::new(loader));
        self
    }

    pub fn add_filter<F>(&mut self, name: &str, filter: F) -> &mut Self
    where
        F: Fn(Value, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let inner = self.inner_mut();
        inner.async_filters.remove(name);
        inner.filters.insert(name.to_string(), Filter::Sync(Arc::new(filter)));
        self
    }

    /// Register a filter that may suspend. Templates using it are rewritten so
    /// the call is awaited before the statement that needs its result.
    pub fn add_async_filter<F, Fut>(&mut self, name: &str, filter: F) -> &mut Self
    where
        F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + 'static,
    {
        let filter: Arc<AsyncFilterFn> =
            Arc::new(move |value: Value, args: Vec<Value>| filter(value, args).boxed_local());
        let inner = self.inner_mut();
        inner.async_filters.insert(name.to_string());
        inner.filters.insert(name.to_string(), Filter::Async(filter));
        self
    }

    pub fn add_test<F>(&mut self, name: &str, test: F) -> &mut Self
    where
        F: Fn(&Value, &[Value]) -> Result<bool> + Send + Sync + 'static,
    {
        self.inner_mut().tests.insert(name.to_string(), Arc::new(test));
        self
    }

    pub fn add_global(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.inner_mut().globals.insert(name.to_string(), value.into());
        self
    }

    pub fn add_extension(&mut self, extension: impl Extension + 'static) -> &mut Self {
        self.inner_mut().extensions.push(Arc::new(extension));
        self
    }

    /// Drop every cached template.
    pub fn invalidate_cache(&self) {
        debug!(templates = self.inner.cache.len(), "template cache invalidated");
        self.inner.cache.clear();
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn filter(&self, name: &str) -> Option<Filter> {
        self.inner.filters.get(name).cloned()
    }

    pub fn test(&self, name: &str) -> Option<Arc<TestFn>> {
        self.inner.tests.get(name).cloned()
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.inner.globals.get(name).cloned()
    }

    pub fn extension(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.inner
            .extensions
            .iter()
            .find(|ext| ext.name() == name)
            .cloned()
    }

    pub fn extensions(&self) -> &[Arc<dyn Extension>] {
        &self.inner.extensions
    }

    pub(crate) fn async_filters(&self) -> &HashSet<String> {
        &self.inner.async_filters
    }

    /// Find `name` through the loaders, in registration order. Relative names
    /// (`./x`, `../x`) resolve against `parent`.
    pub async fn load_template(
        &self,
        name: &str,
        parent: Option<&str>,
        ignore_missing: bool,
    ) -> Result<Option<Arc<Template>>> {
        for loader in &self.inner.loaders {
            let full = match parent {
                Some(parent) if loader.is_relative(name) => loader.resolve(parent, name),
                _ => name.to_string(),
            };

            let cached = self.inner.cache.get(&full).map(|entry| Arc::clone(entry.value()));
            if let Some(template) = cached {
                trace!(template = %full, "template cache hit");
                return Ok(Some(template));
            }

            let Some(source) = loader.get_source(&full).await? else {
                continue;
            };
            trace!(template = %full, path = %source.path, cacheable = source.cacheable, "template loaded");
            let template = Arc::new(Template::new(source.path, source.text));
            if source.cacheable {
                self.inner.cache.insert(full, Arc::clone(&template));
            }
            return Ok(Some(template));
        }

        if ignore_missing {
            return Ok(None);
        }
        Err(TemplateError::resolution(format!("template not found: {}", name)))
    }

    /// Load `name` without an async runtime.
    pub fn get_template(&self, name: &str) -> Result<Arc<Template>> {
        match self.load_template(name, None, false).now_or_never() {
            Some(result) => result?.ok_or_else(|| not_found(name)),
            None => Err(needs_async()),
        }
    }

    /// Render the named template. Fails if a loader, filter or extension
    /// actually suspends; use [`Environment::render_async`] for those.
    pub fn render(&self, name: &str, data: impl Into<Value>) -> Result<String> {
        self.render_async(name, data)
            .now_or_never()
            .unwrap_or_else(|| Err(needs_async()))
    }

    pub fn render_string(&self, source: &str, data: impl Into<Value>) -> Result<String> {
        self.render_string_async(source, data)
            .now_or_never()
            .unwrap_or_else(|| Err(needs_async()))
    }

    pub async fn render_async(&self, name: &str, data: impl Into<Value>) -> Result<String> {
        let template = self
            .load_template(name, None, false)
            .await?
            .ok_or_else(|| not_found(name))?;
        template.render_async(self, data).await
    }

    pub async fn render_string_async(&self, source: &str, data: impl Into<Value>) -> Result<String> {
        let template = Arc::new(Template::new("<string>", source));
        template.render_async(self, data).await
    }

    /// Render `name` and hand the outcome to `callback`, exactly once.
    pub async fn render_with_callback<F>(&self, name: &str, data: impl Into<Value>, callback: F)
    where
        F: FnOnce(Result<String>),
    {
        callback(self.render_async(name, data).await)
    }
}

fn not_found(name: &str) -> TemplateError {
    TemplateError::resolution(format!("template not found: {}", name))
}

fn needs_async() -> TemplateError {
    TemplateError::evaluation("template needs async rendering; use render_async")
}

/// Turn render data into the initial context variables.
fn into_vars(data: Value) -> Result<Map> {
    match data {
        Value::Map(map) => Ok(map),
        Value::Undefined | Value::None => Ok(Map::new()),
        other => Err(TemplateError::evaluation(format!(
            "render data must be a map, got {}",
            other.type_name()
        ))),
    }
}

#[derive(Debug)]
pub(crate) struct Compiled {
    pub root: NodeRef,
    pub blocks: IndexMap<String, Arc<BlockDef>>,
}

/// A loaded template. Compiled on first use; the compiled tree is shared by
/// every render.
#[derive(Debug)]
pub struct Template {
    name: Arc<str>,
    source: String,
    compiled: OnceCell<Compiled>,
}

impl Template {
    pub fn new(name: impl Into<Arc<str>>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            compiled: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parse and transform the source once. Later calls return the same tree.
    pub fn compile(&self, env: &Environment) -> Result<()> {
        self.compiled(env).map(|_| ())
    }

    /// The transformed tree, compiling it first if needed.
    pub fn root(&self, env: &Environment) -> Result<NodeRef> {
        Ok(Arc::clone(&self.compiled(env)?.root))
    }

    pub(crate) fn compiled(&self, env: &Environment) -> Result<&Compiled> {
        self.compiled
            .get_or_try_init(|| self.build(env))
            .map_err(|e| e.update(&self.name))
    }

    fn build(&self, env: &Environment) -> Result<Compiled> {
        let root = parse_template(&self.source, env.config(), env.extensions())?;
        let root = transform(&root, env.async_filters());

        let mut blocks = IndexMap::new();
        for node in find_all(&root, &|n: &Node| matches!(n.kind, NodeKind::Block(_))) {
            let NodeKind::Block(block) = &node.kind else {
                continue;
            };
            let def = Arc::new(BlockDef {
                name: block.name.clone(),
                body: Arc::clone(&block.body),
                template: Arc::clone(&self.name),
            });
            if blocks.insert(block.name.clone(), def).is_some() {
                return Err(TemplateError::syntax(
                    format!("block \"{}\" defined more than once", block.name),
                    node.line,
                    node.column,
                ));
            }
        }

        debug!(template = %self.name, blocks = blocks.len(), "template compiled");
        Ok(Compiled { root, blocks })
    }

    /// Render synchronously; see [`Environment::render`].
    pub fn render(self: &Arc<Self>, env: &Environment, data: impl Into<Value>) -> Result<String> {
        self.render_async(env, data)
            .now_or_never()
            .unwrap_or_else(|| Err(needs_async()))
    }

    /// Render with fresh render state. The template itself is not modified, so
    /// concurrent renders of one template are independent.
    pub async fn render_async(self: &Arc<Self>, env: &Environment, data: impl Into<Value>) -> Result<String> {
        let vars = into_vars(data.into())?;
        debug!(template = %self.name, "render started");
        let renderer = Renderer::new(env);
        let (out, _) = renderer.render_template(self, vars, Frame::root()).await?;
        debug!(template = %self.name, bytes = out.len(), "render finished");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::loader::MemoryLoader;
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

    #[test]
    fn templates_are_cached() {
        let env = env_with(&[("a.html", "A")]);
        let first = env.get_template("a.html").unwrap();
        let second = env.get_template("a.html").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        env.invalidate_cache();
        let third = env.get_template("a.html").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn uncached_sources_are_reloaded() {
        let mut env = Environment::new();
        env.add_loader(MemoryLoader::new().uncached().with_template("a.html", "A"));
        let first = env.get_template("a.html").unwrap();
        let second = env.get_template("a.html").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn loaders_are_asked_in_order() {
        let mut env = Environment::new();
        env.add_loader(MemoryLoader::new().with_template("a.html", "first"));
        env.add_loader(
            MemoryLoader::new()
                .with_template("a.html", "second")
                .with_template("b.html", "only"),
        );
        assert_eq!(env.render("a.html", json!({})).unwrap(), "first");
        assert_eq!(env.render("b.html", json!({})).unwrap(), "only");
    }

    #[test]
    fn missing_templates() {
        let env = env_with(&[]);
        let err = env.get_template("nope.html").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert_eq!(err.message(), "template not found: nope.html");

        let found = env
            .load_template("nope.html", None, true)
            .now_or_never()
            .unwrap()
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn relative_names_resolve_against_parent() {
        let env = env_with(&[("pages/nav.html", "nav")]);
        let template = env
            .load_template("./nav.html", Some("pages/home.html"), false)
            .now_or_never()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(template.name(), "pages/nav.html");
    }

    #[test]
    fn registration_clears_the_cache() {
        let mut env = env_with(&[("a.html", "{{ x }}")]);
        let first = env.get_template("a.html").unwrap();
        env.add_global("x", "g");
        let second = env.get_template("a.html").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(env.render("a.html", json!({})).unwrap(), "g");
        assert_eq!(env.render("a.html", json!({"x": "data"})).unwrap(), "data");
    }

    #[test]
    fn render_data_must_be_a_map() {
        let env = Environment::new();
        assert_eq!(env.render_string("ok", Value::None).unwrap(), "ok");
        let err = env.render_string("ok", json!([1, 2])).unwrap_err();
        assert!(err.message().contains("must be a map"));
    }

    #[test]
    fn compile_is_idempotent() {
        let env = Environment::new();
        let template = Template::new("t", "{% if a %}{{ b }}{% endif %}");
        let first = template.root(&env).unwrap();
        let second = template.root(&env).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn duplicate_blocks_are_rejected() {
        let env = Environment::new();
        let template = Template::new("dup.html", "{% block a %}{% endblock %}\n{% block a %}{% endblock %}");
        let err = template.compile(&env).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.template(), Some("dup.html"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.tags.variable_start = "{%".to_string();
        assert!(Environment::with_config(config).is_err());
    }

    #[test]
    fn sync_render_reports_suspension() {
        let mut env = Environment::new();
        env.add_async_filter("ready", |value, _| async move { Ok(value) });
        env.add_async_filter("never", |_, _| async move {
            futures::future::pending::<()>().await;
            Ok(Value::None)
        });
        assert_eq!(env.render_string("{{ 'x' | ready }}", json!({})).unwrap(), "x");
        let err = env.render_string("{{ 'x' | never }}", json!({})).unwrap_err();
        assert!(err.message().contains("render_async"));
    }

    #[test]
    fn callback_receives_the_result() {
        let env = env_with(&[("a.html", "{{ n + 1 }}")]);
        let mut seen = None;
        env.render_with_callback("a.html", json!({"n": 1}), |result| seen = Some(result))
            .now_or_never()
            .unwrap();
        assert_eq!(seen.unwrap().unwrap(), "2");
    }
}
