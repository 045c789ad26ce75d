use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use futures::future::{try_join_all, LocalBoxFuture};
use futures::FutureExt;
use indexmap::IndexMap;
use tracing::trace;

use crate::ast::*;
use crate::environment::{Compiled, Environment, Filter as FilterImpl, Template};
use crate::error::{Result, TemplateError};
use crate::extension::Content;
use crate::scope::{BlockDef, Context, Frame};
use crate::value::{self, escape_html, CallArgs, Map, MacroDef, MacroValue, Value};

const MAX_MACRO_DEPTH: usize = 200;

/// Where a piece of template code is running.
struct Scope {
    context: Rc<Context>,
    /// Template the running code came from; relative names resolve against it.
    path: Arc<str>,
    /// Set by `extends` at the top level of a template.
    parent: RefCell<Option<Arc<Template>>>,
    /// The block being rendered, if any.
    block: Option<Arc<BlockDef>>,
}

impl Scope {
    fn new(context: Rc<Context>, path: Arc<str>, block: Option<Arc<BlockDef>>) -> Self {
        Self {
            context,
            path,
            parent: RefCell::new(None),
            block,
        }
    }
}

pub(crate) struct Renderer<'env> {
    env: &'env Environment,
    depth: Cell<usize>,
}

impl<'env> Renderer<'env> {
    pub(crate) fn new(env: &'env Environment) -> Self {
        Self {
            env,
            depth: Cell::new(0),
        }
    }

    fn compile<'t>(&self, template: &'t Template) -> Result<&'t Compiled> {
        template.compiled(self.env)
    }

    /// Render `template` with a fresh context built from `vars`. The context
    /// is returned so imports can read its exports.
    pub(crate) async fn render_template(
        &self,
        template: &Arc<Template>,
        vars: Map,
        frame: Rc<Frame>,
    ) -> Result<(String, Rc<Context>)> {
        let compiled = self.compile(template)?;
        let context = Rc::new(Context::new(self.env.clone(), vars, &compiled.blocks));
        let out = self
            .render_root(Arc::clone(template), Rc::clone(&context), frame, Vec::new())
            .await?;
        Ok((out, context))
    }

    /// `lineage` holds the templates already rendered on the way up an
    /// `extends` chain.
    fn render_root<'s>(
        &'s self,
        template: Arc<Template>,
        context: Rc<Context>,
        frame: Rc<Frame>,
        mut lineage: Vec<Arc<str>>,
    ) -> LocalBoxFuture<'s, Result<String>> {
        async move {
            lineage.push(template.path());
            let scope = Scope::new(Rc::clone(&context), template.path(), None);
            let mut out = String::new();
            let result = match self.compile(&template) {
                Ok(compiled) => self.exec(&scope, &compiled.root, &frame, &mut out).await,
                Err(e) => Err(e),
            };
            result.map_err(|e| e.update(template.name()))?;

            let parent = scope.parent.borrow_mut().take();
            match parent {
                // The child's own top-level output is dropped
                Some(parent) => {
                    if lineage.iter().any(|name| **name == *parent.name()) {
                        let mut cycle: Vec<&str> = lineage.iter().map(|name| &**name).collect();
                        cycle.push(parent.name());
                        return Err(TemplateError::evaluation(format!(
                            "cyclic template inheritance: {}",
                            cycle.join(" -> ")
                        ))
                        .update(template.name()));
                    }
                    trace!(template = template.name(), parent = parent.name(), "rendering parent template");
                    self.render_root(parent, context, frame, lineage).await
                }
                None => Ok(out),
            }
        }
        .boxed_local()
    }

    fn write(&self, value: Value, out: &mut String) -> Result<()> {
        let config = self.env.config();
        match value {
            Value::Undefined | Value::None if config.throw_on_undefined => Err(
                TemplateError::evaluation("attempted to output null or undefined value"),
            ),
            Value::Undefined | Value::None => Ok(()),
            Value::Safe(s) => {
                out.push_str(&s);
                Ok(())
            }
            other if config.autoescape => {
                out.push_str(&escape_html(&other.to_string()));
                Ok(())
            }
            other => {
                out.push_str(&other.to_string());
                Ok(())
            }
        }
    }

    fn exec<'s>(
        &'s self,
        scope: &'s Scope,
        node: &'s NodeRef,
        frame: &'s Rc<Frame>,
        out: &'s mut String,
    ) -> LocalBoxFuture<'s, Result<()>> {
        async move {
            self.exec_node(scope, node, frame, out)
                .await
                .map_err(|e| e.at(node.line, node.column))
        }
        .boxed_local()
    }

    async fn exec_node(&self, scope: &Scope, node: &NodeRef, frame: &Rc<Frame>, out: &mut String) -> Result<()> {
        match &node.kind {
            NodeKind::Root(list) | NodeKind::NodeList(list) => {
                for child in &list.children {
                    self.exec(scope, child, frame, out).await?;
                }
                Ok(())
            }
            NodeKind::Output(list) => {
                for child in &list.children {
                    match &child.kind {
                        NodeKind::TemplateData(data) => out.push_str(&data.text),
                        _ => {
                            let value = self.eval(scope, child, frame).await?;
                            self.write(value, out)
                                .map_err(|e| e.at(child.line, child.column))?;
                        }
                    }
                }
                Ok(())
            }
            NodeKind::TemplateData(data) => {
                out.push_str(&data.text);
                Ok(())
            }
            NodeKind::If(node) => self.exec_if(scope, node, frame, out).await,
            NodeKind::IfAsync(node) => {
                trace!(line = node.cond.line, "async if");
                self.exec_if(scope, node, frame, out).await
            }
            NodeKind::For(node) => self.exec_for(scope, node, frame, out).await,
            NodeKind::AsyncEach(node) => {
                trace!(line = node.arr.line, "async each");
                self.exec_for(scope, node, frame, out).await
            }
            NodeKind::AsyncAll(node) => self.exec_all(scope, node, frame, out).await,
            NodeKind::Set(set) => self.exec_set(scope, set, frame).await,
            NodeKind::Macro(m) => {
                let value = self.define_macro(scope, m, false);
                frame.set(&m.name, value.clone(), false);
                if frame.is_top_level() {
                    scope.context.set_variable(&m.name, value);
                    if !m.name.starts_with('_') {
                        scope.context.add_export(&m.name);
                    }
                }
                Ok(())
            }
            NodeKind::Block(block) => self.exec_block(scope, block, frame, out).await,
            NodeKind::Super(node) => self.exec_super(scope, node, frame).await,
            NodeKind::Extends(node) => self.exec_extends(scope, node, frame).await,
            NodeKind::Include(node) => self.exec_include(scope, node, frame, out).await,
            NodeKind::Import(import) => {
                let exports = self
                    .exported(scope, &import.template, frame, import.with_context)
                    .await?;
                bind(scope, frame, &import.target, Value::Map(exports));
                Ok(())
            }
            NodeKind::FromImport(from) => {
                let exports = self
                    .exported(scope, &from.template, frame, from.with_context)
                    .await?;
                for name in &from.names {
                    let value = exports.get(&name.name).cloned().ok_or_else(|| {
                        TemplateError::resolution(format!("cannot import '{}'", name.name))
                    })?;
                    bind(scope, frame, name.alias.as_ref().unwrap_or(&name.name), value);
                }
                Ok(())
            }
            NodeKind::CallExtension(call) | NodeKind::CallExtensionAsync(call) => {
                let value = self.call_extension(scope, call, frame).await?;
                match value {
                    Value::Undefined | Value::None => {}
                    Value::Safe(s) => out.push_str(&s),
                    other if call.autoescape && self.env.config().autoescape => {
                        out.push_str(&escape_html(&other.to_string()))
                    }
                    other => out.push_str(&other.to_string()),
                }
                Ok(())
            }
            NodeKind::AsyncBind(bind) => {
                let value = self.eval(scope, &bind.call, frame).await?;
                if let Some(name) = bind.symbol.as_symbol() {
                    frame.set(name, value, false);
                }
                Ok(())
            }

            // A bare expression in statement position is output
            NodeKind::Capture(_)
            | NodeKind::Literal(_)
            | NodeKind::Symbol(_)
            | NodeKind::Array(_)
            | NodeKind::Pair(_)
            | NodeKind::Dict(_)
            | NodeKind::KeywordArgs(_)
            | NodeKind::Or(_)
            | NodeKind::And(_)
            | NodeKind::In(_)
            | NodeKind::Is(_)
            | NodeKind::Add(_)
            | NodeKind::Concat(_)
            | NodeKind::Sub(_)
            | NodeKind::Mul(_)
            | NodeKind::Div(_)
            | NodeKind::FloorDiv(_)
            | NodeKind::Mod(_)
            | NodeKind::Pow(_)
            | NodeKind::Not(_)
            | NodeKind::Neg(_)
            | NodeKind::Pos(_)
            | NodeKind::Compare(_)
            | NodeKind::CompareOperand(_)
            | NodeKind::InlineIf(_)
            | NodeKind::LookupVal(_)
            | NodeKind::Slice(_)
            | NodeKind::FunCall(_)
            | NodeKind::Filter(_)
            | NodeKind::Caller(_) => {
                let value = self.eval(scope, node, frame).await?;
                self.write(value, out)
            }
        }
    }

    fn eval<'s>(
        &'s self,
        scope: &'s Scope,
        node: &'s NodeRef,
        frame: &'s Rc<Frame>,
    ) -> LocalBoxFuture<'s, Result<Value>> {
        async move {
            self.eval_node(scope, node, frame)
                .await
                .map_err(|e| e.at(node.line, node.column))
        }
        .boxed_local()
    }

    async fn eval_node(&self, scope: &Scope, node: &NodeRef, frame: &Rc<Frame>) -> Result<Value> {
        match &node.kind {
            NodeKind::Literal(lit) => literal(&lit.value),
            NodeKind::Symbol(sym) => Ok(lookup(scope, frame, &sym.name)),
            NodeKind::Array(list) => {
                let mut items = Vec::with_capacity(list.children.len());
                for child in &list.children {
                    items.push(self.eval(scope, child, frame).await?);
                }
                Ok(Value::Array(items))
            }
            NodeKind::Dict(list) | NodeKind::KeywordArgs(list) => {
                let mut map = Map::new();
                for child in &list.children {
                    let NodeKind::Pair(pair) = &child.kind else {
                        return Err(TemplateError::evaluation("expected key/value pair"));
                    };
                    let key = match pair.key.as_symbol() {
                        Some(name) => name.to_string(),
                        None => self.eval(scope, &pair.key, frame).await?.to_string(),
                    };
                    map.insert(key, self.eval(scope, &pair.value, frame).await?);
                }
                Ok(Value::Map(map))
            }
            NodeKind::Capture(capture) => {
                let mut buf = String::new();
                self.exec(scope, &capture.body, frame, &mut buf).await?;
                Ok(Value::Safe(buf))
            }
            NodeKind::Or(op) => {
                let left = self.eval(scope, &op.left, frame).await?;
                if left.is_truthy() {
                    return Ok(left);
                }
                self.eval(scope, &op.right, frame).await
            }
            NodeKind::And(op) => {
                let left = self.eval(scope, &op.left, frame).await?;
                if !left.is_truthy() {
                    return Ok(left);
                }
                self.eval(scope, &op.right, frame).await
            }
            NodeKind::Not(op) => Ok(Value::Bool(!self.eval(scope, &op.target, frame).await?.is_truthy())),
            NodeKind::In(op) => {
                let needle = self.eval(scope, &op.left, frame).await?;
                let haystack = self.eval(scope, &op.right, frame).await?;
                Ok(Value::Bool(value::contains(&haystack, &needle)?))
            }
            NodeKind::Is(op) => self.eval_test(scope, op, frame).await,
            NodeKind::Add(op) => self.binary(scope, op, frame, value::add).await,
            NodeKind::Sub(op) => self.binary(scope, op, frame, value::sub).await,
            NodeKind::Mul(op) => self.binary(scope, op, frame, value::mul).await,
            NodeKind::Div(op) => self.binary(scope, op, frame, value::div).await,
            NodeKind::FloorDiv(op) => self.binary(scope, op, frame, value::floor_div).await,
            NodeKind::Mod(op) => self.binary(scope, op, frame, value::rem).await,
            NodeKind::Pow(op) => self.binary(scope, op, frame, value::pow).await,
            NodeKind::Concat(op) => {
                self.binary(scope, op, frame, |a, b| Ok(value::concat(a, b)))
                    .await
            }
            NodeKind::Neg(op) => value::neg(&self.eval(scope, &op.target, frame).await?),
            NodeKind::Pos(op) => value::pos(&self.eval(scope, &op.target, frame).await?),
            NodeKind::Compare(cmp) => {
                // Chains fold left: `a < b < c` is `(a < b) < c`
                let mut acc = self.eval(scope, &cmp.expr, frame).await?;
                for operand in &cmp.ops {
                    let NodeKind::CompareOperand(operand) = &operand.kind else {
                        return Err(TemplateError::evaluation("malformed comparison"));
                    };
                    let right = self.eval(scope, &operand.expr, frame).await?;
                    acc = Value::Bool(compare(operand.op, &acc, &right));
                }
                Ok(acc)
            }
            NodeKind::CompareOperand(operand) => self.eval(scope, &operand.expr, frame).await,
            NodeKind::InlineIf(inline) => {
                if self.eval(scope, &inline.cond, frame).await?.is_truthy() {
                    self.eval(scope, &inline.body, frame).await
                } else if let Some(else_) = &inline.else_ {
                    self.eval(scope, else_, frame).await
                } else {
                    Ok(Value::Undefined)
                }
            }
            NodeKind::LookupVal(lookup) => {
                let target = self.eval(scope, &lookup.target, frame).await?;
                match &lookup.val.kind {
                    NodeKind::Slice(slice) => {
                        let start = self.eval_index(scope, &slice.start, frame).await?;
                        let stop = self.eval_index(scope, &slice.stop, frame).await?;
                        let step = self.eval_index(scope, &slice.step, frame).await?;
                        slice_value(&target, start, stop, step)
                    }
                    _ => {
                        let key = self.eval(scope, &lookup.val, frame).await?;
                        Ok(target.get_member(&key))
                    }
                }
            }
            NodeKind::FunCall(call) => {
                let callee = self.eval(scope, &call.name, frame).await?;
                let args = self.eval_args(scope, &call.args, frame).await?;
                self.call(scope, &call.name, callee, args).await
            }
            NodeKind::Filter(filter) => self.eval_filter(scope, filter, frame).await,
            NodeKind::CallExtension(call) | NodeKind::CallExtensionAsync(call) => {
                self.call_extension(scope, call, frame).await
            }
            NodeKind::Caller(m) => {
                let Value::Macro(mut caller) = self.define_macro(scope, m, true) else {
                    return Err(TemplateError::evaluation("malformed caller"));
                };
                // The body sees everything visible at the call site
                let mut closure = scope.context.variables();
                closure.extend(frame.flatten());
                caller.closure = Some(Arc::new(closure));
                Ok(Value::Macro(caller))
            }

            NodeKind::Pair(_) | NodeKind::Slice(_) => Err(TemplateError::evaluation(format!(
                "unexpected {} in expression",
                node.kind.name()
            ))),
            NodeKind::Root(_)
            | NodeKind::NodeList(_)
            | NodeKind::Output(_)
            | NodeKind::TemplateData(_)
            | NodeKind::If(_)
            | NodeKind::IfAsync(_)
            | NodeKind::For(_)
            | NodeKind::AsyncEach(_)
            | NodeKind::AsyncAll(_)
            | NodeKind::Set(_)
            | NodeKind::Macro(_)
            | NodeKind::Block(_)
            | NodeKind::Super(_)
            | NodeKind::Extends(_)
            | NodeKind::Include(_)
            | NodeKind::Import(_)
            | NodeKind::FromImport(_)
            | NodeKind::AsyncBind(_) => Err(TemplateError::evaluation(format!(
                "{} cannot be used as an expression",
                node.kind.name()
            ))),
        }
    }

    async fn binary(
        &self,
        scope: &Scope,
        op: &BinOp,
        frame: &Rc<Frame>,
        f: impl Fn(&Value, &Value) -> Result<Value>,
    ) -> Result<Value> {
        let left = self.eval(scope, &op.left, frame).await?;
        let right = self.eval(scope, &op.right, frame).await?;
        f(&left, &right)
    }

    async fn eval_index(
        &self,
        scope: &Scope,
        node: &Option<NodeRef>,
        frame: &Rc<Frame>,
    ) -> Result<Option<i64>> {
        let Some(node) = node else { return Ok(None) };
        let value = self.eval(scope, node, frame).await?;
        if value.is_nullish() {
            return Ok(None);
        }
        value.as_i64().map(Some).ok_or_else(|| {
            TemplateError::evaluation(format!("slice indices must be integers, got {}", value.type_name()))
        })
    }

    async fn eval_args(&self, scope: &Scope, args: &NodeRef, frame: &Rc<Frame>) -> Result<CallArgs> {
        let mut out = CallArgs::default();
        for arg in args.children() {
            match self.eval(scope, arg, frame).await? {
                Value::Map(kwargs) if matches!(arg.kind, NodeKind::KeywordArgs(_)) => {
                    out.kwargs = kwargs
                }
                value => out.positional.push(value),
            }
        }
        Ok(out)
    }

    async fn call(&self, scope: &Scope, name: &Node, callee: Value, args: CallArgs) -> Result<Value> {
        match callee {
            Value::Macro(m) => self.call_macro(scope, &m, args).await,
            Value::Function(f) => f.call(args).map_err(|e| e.at(name.line, name.column)),
            other if other.is_nullish() => Err(TemplateError::evaluation(format!(
                "unable to call `{}`, which is undefined or falsey",
                callee_name(name)
            ))),
            _ => Err(TemplateError::evaluation(format!(
                "unable to call `{}`, which is not a function",
                callee_name(name)
            ))),
        }
    }

    fn define_macro(&self, scope: &Scope, m: &Macro, is_caller: bool) -> Value {
        let mut params = Vec::new();
        let mut defaults = Vec::new();
        for arg in m.args.children() {
            match &arg.kind {
                NodeKind::Symbol(sym) => params.push(sym.name.clone()),
                NodeKind::KeywordArgs(list) => {
                    for pair in &list.children {
                        if let NodeKind::Pair(pair) = &pair.kind {
                            if let Some(name) = pair.key.as_symbol() {
                                defaults.push((name.to_string(), Arc::clone(&pair.value)));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Value::Macro(MacroValue::new(MacroDef {
            name: m.name.clone(),
            params,
            defaults,
            body: Arc::clone(&m.body),
            template: Arc::clone(&scope.path),
            is_caller,
        }))
    }

    async fn call_macro(&self, scope: &Scope, m: &MacroValue, args: CallArgs) -> Result<Value> {
        // Concurrent loop bodies share the counter, so adjust rather than restore
        if self.depth.get() >= MAX_MACRO_DEPTH {
            return Err(TemplateError::evaluation(format!(
                "maximum macro call depth exceeded in `{}`",
                m.name()
            )));
        }
        self.depth.set(self.depth.get() + 1);
        let result = self.run_macro(scope, m, args).await;
        self.depth.set(self.depth.get() - 1);
        result
    }

    async fn run_macro(&self, scope: &Scope, m: &MacroValue, args: CallArgs) -> Result<Value> {
        let def = &m.def;
        let frame = match &m.closure {
            Some(closure) => Frame::from_vars((**closure).clone()).push(true),
            None => Frame::detached(),
        };
        let macro_scope = match &m.scope {
            Some(exports) => Scope::new(
                Rc::new(Context::new(self.env.clone(), (**exports).clone(), &IndexMap::new())),
                Arc::clone(&def.template),
                None,
            ),
            None => Scope::new(Rc::clone(&scope.context), Arc::clone(&def.template), None),
        };

        let CallArgs { positional, mut kwargs } = args;
        let mut positional = positional.into_iter();
        for name in &def.params {
            let value = positional
                .next()
                .or_else(|| kwargs.shift_remove(name))
                .unwrap_or_default();
            frame.set(name, value, false);
        }
        // Extra positional arguments fill keyword parameters in order
        for (name, default) in &def.defaults {
            let value = match positional.next().or_else(|| kwargs.shift_remove(name)) {
                Some(value) => value,
                None => self.eval(&macro_scope, default, &frame).await?,
            };
            frame.set(name, value, false);
        }
        if let Some(caller) = kwargs.shift_remove("caller") {
            frame.set("caller", caller, false);
        }

        let mut out = String::new();
        let result = self.exec(&macro_scope, &def.body, &frame, &mut out).await;
        match (&m.scope, result) {
            (_, Ok(())) => Ok(Value::Safe(out)),
            (Some(_), Err(e)) => Err(e.update(&def.template)),
            (None, Err(e)) => Err(e),
        }
    }

    async fn eval_filter(&self, scope: &Scope, filter: &Filter, frame: &Rc<Frame>) -> Result<Value> {
        let implementation = self
            .env
            .filter(&filter.name)
            .ok_or_else(|| TemplateError::resolution(format!("filter not found: {}", filter.name)))?;

        let mut args = Vec::new();
        for arg in filter.args.children() {
            args.push(self.eval(scope, arg, frame).await?);
        }
        let value = if args.is_empty() {
            Value::Undefined
        } else {
            args.remove(0)
        };

        match implementation {
            FilterImpl::Sync(f) => f(value, args),
            FilterImpl::Async(f) => {
                trace!(filter = %filter.name, "awaiting async filter");
                f(value, args).await
            }
        }
    }

    async fn eval_test(&self, scope: &Scope, op: &BinOp, frame: &Rc<Frame>) -> Result<Value> {
        let value = self.eval(scope, &op.left, frame).await?;
        let (name, args) = match &op.right.kind {
            NodeKind::Symbol(sym) => (sym.name.as_str(), Vec::new()),
            NodeKind::Literal(Literal { value: LiteralValue::None }) => ("none", Vec::new()),
            NodeKind::FunCall(call) => match call.name.as_symbol() {
                Some(name) => (name, self.eval_args(scope, &call.args, frame).await?.positional),
                None => return Err(TemplateError::evaluation("test name must be a plain name")),
            },
            _ => return Err(TemplateError::evaluation("test name must be a plain name")),
        };
        let test = self
            .env
            .test(name)
            .ok_or_else(|| TemplateError::resolution(format!("test not found: {}", name)))?;
        Ok(Value::Bool(test(&value, &args)?))
    }

    async fn call_extension(&self, scope: &Scope, call: &CallExtension, frame: &Rc<Frame>) -> Result<Value> {
        let extension = self.env.extension(&call.extension).ok_or_else(|| {
            TemplateError::resolution(format!("extension not found: {}", call.extension))
        })?;
        let args = self.eval_args(scope, &call.args, frame).await?;
        let content = call
            .content
            .iter()
            .map(|body| {
                Content::new(move || {
                    async move {
                        let mut buf = String::new();
                        self.exec(scope, body, frame, &mut buf).await?;
                        Ok::<_, TemplateError>(buf)
                    }
                    .boxed_local()
                })
            })
            .collect();
        extension.run(&scope.context, &call.method, args, content).await
    }

    async fn exec_if(&self, scope: &Scope, node: &If, frame: &Rc<Frame>, out: &mut String) -> Result<()> {
        if self.eval(scope, &node.cond, frame).await?.is_truthy() {
            self.exec(scope, &node.body, frame, out).await
        } else if let Some(else_) = &node.else_ {
            self.exec(scope, else_, frame, out).await
        } else {
            Ok(())
        }
    }

    /// Evaluate the loop target and build one frame per iteration.
    async fn loop_frames(&self, scope: &Scope, node: &For, frame: &Rc<Frame>) -> Result<Vec<Rc<Frame>>> {
        let iterable = self.eval(scope, &node.arr, frame).await?;
        let names: Vec<&str> = match &node.name.kind {
            NodeKind::Array(list) => list.children.iter().filter_map(|n| n.as_symbol()).collect(),
            _ => node.name.as_symbol().into_iter().collect(),
        };

        let items: Vec<Value> = match iterable {
            Value::Array(items) => items,
            Value::Map(map) if names.len() == 2 => map
                .into_iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
                .collect(),
            Value::Map(map) => map.into_keys().map(Value::String).collect(),
            Value::String(s) | Value::Safe(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
            Value::Undefined | Value::None => Vec::new(),
            other => {
                return Err(TemplateError::evaluation(format!(
                    "cannot iterate over a value of type {}",
                    other.type_name()
                ))
                .at(node.arr.line, node.arr.column))
            }
        };

        let length = items.len();
        let mut frames = Vec::with_capacity(length);
        for (i, item) in items.into_iter().enumerate() {
            let child = frame.push(false);
            match names.as_slice() {
                [name] => child.set(name, item, false),
                names => {
                    let type_name = item.type_name();
                    let Value::Array(parts) = item else {
                        return Err(TemplateError::evaluation(format!(
                            "cannot unpack a value of type {} into {} names",
                            type_name,
                            names.len()
                        )));
                    };
                    for (j, name) in names.iter().enumerate() {
                        child.set(name, parts.get(j).cloned().unwrap_or_default(), false);
                    }
                }
            }
            child.set("loop", loop_metadata(i, length), false);
            frames.push(child);
        }
        Ok(frames)
    }

    async fn exec_for(&self, scope: &Scope, node: &For, frame: &Rc<Frame>, out: &mut String) -> Result<()> {
        let frames = self.loop_frames(scope, node, frame).await?;
        if frames.is_empty() {
            if let Some(else_) = &node.else_ {
                self.exec(scope, else_, frame, out).await?;
            }
            return Ok(());
        }
        for child in &frames {
            self.exec(scope, &node.body, child, out).await?;
        }
        Ok(())
    }

    /// Run every iteration concurrently, each into its own buffer.
    async fn exec_all(&self, scope: &Scope, node: &For, frame: &Rc<Frame>, out: &mut String) -> Result<()> {
        let frames = self.loop_frames(scope, node, frame).await?;
        if frames.is_empty() {
            if let Some(else_) = &node.else_ {
                self.exec(scope, else_, frame, out).await?;
            }
            return Ok(());
        }
        trace!(iterations = frames.len(), "async all");
        let body = &node.body;
        let parts = try_join_all(frames.iter().map(|child| async move {
            let mut buf = String::new();
            self.exec(scope, body, child, &mut buf).await?;
            Ok::<_, TemplateError>(buf)
        }))
        .await?;
        for part in parts {
            out.push_str(&part);
        }
        Ok(())
    }

    async fn exec_set(&self, scope: &Scope, set: &Set, frame: &Rc<Frame>) -> Result<()> {
        let value = match (&set.value, &set.body) {
            (Some(value), _) => self.eval(scope, value, frame).await?,
            (None, Some(body)) => self.eval(scope, body, frame).await?,
            (None, None) => Value::Undefined,
        };
        for target in &set.targets {
            let Some(name) = target.as_symbol() else {
                return Err(TemplateError::evaluation("set target must be a plain name"));
            };
            frame.set(name, value.clone(), true);
            if frame.is_top_level() {
                scope.context.set_variable(name, value.clone());
                if !name.starts_with('_') {
                    scope.context.add_export(name);
                }
            }
        }
        Ok(())
    }

    async fn exec_block(&self, scope: &Scope, block: &Block, frame: &Rc<Frame>, out: &mut String) -> Result<()> {
        // Once a parent is known, the parent decides where blocks go
        if scope.block.is_none() && scope.parent.borrow().is_some() {
            return Ok(());
        }
        let def = scope.context.get_block(&block.name)?;
        let block_scope = Scope::new(
            Rc::clone(&scope.context),
            Arc::clone(&def.template),
            Some(Arc::clone(&def)),
        );
        let child = frame.push(true);
        self.exec(&block_scope, &def.body, &child, out)
            .await
            .map_err(|e| e.update(&def.template))
    }

    async fn exec_super(&self, scope: &Scope, node: &Super, frame: &Rc<Frame>) -> Result<()> {
        let current = scope.block.as_ref().ok_or_else(|| {
            TemplateError::evaluation(format!("super() called outside of block \"{}\"", node.block_name))
        })?;
        let next = scope.context.get_super(&node.block_name, current)?;
        let super_scope = Scope::new(
            Rc::clone(&scope.context),
            Arc::clone(&next.template),
            Some(Arc::clone(&next)),
        );
        let child = frame.push(true);
        let mut buf = String::new();
        self.exec(&super_scope, &next.body, &child, &mut buf)
            .await
            .map_err(|e| e.update(&next.template))?;
        if let Some(name) = node.symbol.as_symbol() {
            frame.set(name, Value::Safe(buf), false);
        }
        Ok(())
    }

    async fn template_name(&self, scope: &Scope, node: &NodeRef, frame: &Rc<Frame>) -> Result<String> {
        match self.eval(scope, node, frame).await? {
            Value::String(name) | Value::Safe(name) => Ok(name),
            other => Err(TemplateError::evaluation(format!(
                "template name must be a string, got {}",
                other.type_name()
            ))),
        }
    }

    async fn load(&self, scope: &Scope, name: &str, ignore_missing: bool) -> Result<Option<Arc<Template>>> {
        self.env
            .load_template(name, Some(&scope.path), ignore_missing)
            .await
    }

    async fn exec_extends(&self, scope: &Scope, node: &Extends, frame: &Rc<Frame>) -> Result<()> {
        let name = self.template_name(scope, &node.template, frame).await?;
        let Some(parent) = self.load(scope, &name, false).await? else {
            return Err(TemplateError::resolution(format!("template not found: {}", name)));
        };
        let compiled = self.compile(&parent)?;
        for block in compiled.blocks.values() {
            scope.context.add_block(Arc::clone(block));
        }
        *scope.parent.borrow_mut() = Some(parent);
        Ok(())
    }

    async fn exec_include(&self, scope: &Scope, node: &Include, frame: &Rc<Frame>, out: &mut String) -> Result<()> {
        let name = self.template_name(scope, &node.template, frame).await?;
        let Some(template) = self.load(scope, &name, node.ignore_missing).await? else {
            trace!(template = %name, "skipping missing include");
            return Ok(());
        };
        let child = frame.push_top_level(true);
        let (rendered, _) = self
            .render_template(&template, scope.context.variables(), child)
            .await?;
        out.push_str(&rendered);
        Ok(())
    }

    /// Render the template named by `node` for its exports. Macros in the
    /// result are bound to the imported template's variables.
    async fn exported(
        &self,
        scope: &Scope,
        node: &NodeRef,
        frame: &Rc<Frame>,
        with_context: bool,
    ) -> Result<Map> {
        let name = self.template_name(scope, node, frame).await?;
        let Some(template) = self.load(scope, &name, false).await? else {
            return Err(TemplateError::resolution(format!("template not found: {}", name)));
        };
        let (vars, child) = if with_context {
            (scope.context.variables(), frame.push_top_level(true))
        } else {
            (Map::new(), Frame::root())
        };
        let (_, context) = self.render_template(&template, vars, child).await?;

        let snapshot = Arc::new(context.variables());
        let mut exports = context.exported();
        for value in exports.values_mut() {
            if let Value::Macro(m) = value {
                if m.scope.is_none() && !m.def.is_caller {
                    m.scope = Some(Arc::clone(&snapshot));
                }
            }
        }
        Ok(exports)
    }
}

/// Bind an imported name in the frame, and in the context at top level.
fn bind(scope: &Scope, frame: &Rc<Frame>, name: &str, value: Value) {
    frame.set(name, value.clone(), false);
    if frame.is_top_level() {
        scope.context.set_variable(name, value);
    }
}

fn lookup(scope: &Scope, frame: &Frame, name: &str) -> Value {
    match frame.lookup(name) {
        Some(value) => value,
        None => scope.context.lookup(name),
    }
}

fn callee_name(node: &Node) -> String {
    match &node.kind {
        NodeKind::Symbol(sym) => sym.name.clone(),
        NodeKind::LookupVal(lookup) => match &lookup.val.kind {
            NodeKind::Literal(Literal { value: LiteralValue::String(s) }) => s.clone(),
            _ => "[expression]".to_string(),
        },
        _ => "[expression]".to_string(),
    }
}

fn literal(value: &LiteralValue) -> Result<Value> {
    Ok(match value {
        LiteralValue::None => Value::None,
        LiteralValue::Bool(b) => Value::Bool(*b),
        LiteralValue::Int(i) => Value::Int(*i),
        LiteralValue::Float(f) => Value::Float(*f),
        LiteralValue::String(s) => Value::String(s.clone()),
        LiteralValue::Regex { pattern, flags } => {
            // `g` and `y` have no meaning for a compiled pattern
            let inline: String = flags.chars().filter(|c| matches!(c, 'i' | 'm')).collect();
            let source = if inline.is_empty() {
                pattern.clone()
            } else {
                format!("(?{}){}", inline, pattern)
            };
            let regex = regex::Regex::new(&source)
                .map_err(|e| TemplateError::evaluation(format!("invalid regular expression: {}", e)))?;
            Value::Regex(regex)
        }
    })
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    use std::cmp::Ordering;
    match op {
        CompareOp::Eq => value::loose_eq(a, b),
        CompareOp::Ne => !value::loose_eq(a, b),
        CompareOp::StrictEq => value::strict_eq(a, b),
        CompareOp::StrictNe => !value::strict_eq(a, b),
        CompareOp::Lt => value::compare(a, b) == Some(Ordering::Less),
        CompareOp::Gt => value::compare(a, b) == Some(Ordering::Greater),
        CompareOp::Le => matches!(value::compare(a, b), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Ge => matches!(value::compare(a, b), Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn loop_metadata(index: usize, length: usize) -> Value {
    let mut map = Map::new();
    map.insert("index".into(), Value::from(index + 1));
    map.insert("index0".into(), Value::from(index));
    map.insert("revindex".into(), Value::from(length - index));
    map.insert("revindex0".into(), Value::from(length - index - 1));
    map.insert("first".into(), Value::Bool(index == 0));
    map.insert("last".into(), Value::Bool(index + 1 == length));
    map.insert("length".into(), Value::from(length));
    Value::Map(map)
}

/// Python slice semantics over arrays and strings.
fn slice_value(target: &Value, start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Result<Value> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(TemplateError::evaluation("slice step cannot be zero"));
    }
    let (items, is_string): (Vec<Value>, bool) = match target {
        Value::Array(items) => (items.clone(), false),
        Value::String(s) | Value::Safe(s) => {
            (s.chars().map(|c| Value::String(c.to_string())).collect(), true)
        }
        Value::Undefined | Value::None => return Ok(Value::Undefined),
        other => {
            return Err(TemplateError::evaluation(format!(
                "cannot slice a value of type {}",
                other.type_name()
            )))
        }
    };

    let len = items.len() as i64;
    let clamp = |i: i64, low: i64, high: i64| i.max(low).min(high);
    let normalize = |i: i64| if i < 0 { i + len } else { i };

    let mut picked = Vec::new();
    if step > 0 {
        let mut i = clamp(start.map(normalize).unwrap_or(0), 0, len);
        let stop = clamp(stop.map(normalize).unwrap_or(len), 0, len);
        while i < stop {
            picked.push(items[i as usize].clone());
            i = match i.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
    } else {
        let mut i = clamp(start.map(normalize).unwrap_or(len - 1), -1, len - 1);
        let stop = clamp(stop.map(normalize).unwrap_or(-1), -1, len - 1);
        while i > stop {
            picked.push(items[i as usize].clone());
            i = match i.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
    }

    if is_string {
        return Ok(Value::String(picked.iter().map(|v| v.to_string()).collect()));
    }
    Ok(Value::Array(picked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn render(source: &str, data: serde_json::Value) -> Result<String> {
        Environment::new().render_string(source, data)
    }

    fn ok(source: &str, data: serde_json::Value) -> String {
        render(source, data).unwrap()
    }

    #[test]
    fn expressions() {
        assert_eq!(ok("{{ 1 + 2 * 3 }}", json!({})), "7");
        assert_eq!(ok("{{ 7 // 2 }} {{ 7 / 2 }} {{ 2 ** 3 ** 2 }}", json!({})), "3 3.5 512");
        assert_eq!(ok("{{ 'a' ~ 1 ~ none }}", json!({})), "a1");
        assert_eq!(ok("{{ x or 'fallback' }}|{{ 0 and 1 }}", json!({})), "fallback|0");
        assert_eq!(ok("{{ 'yes' if flag else 'no' }}", json!({"flag": true})), "yes");
        assert_eq!(ok("{{ 3 in [1, 2, 3] }} {{ 'k' not in {k: 1} }}", json!({})), "true false");
    }

    #[test]
    fn comparison_chains_fold_left() {
        assert_eq!(ok("{{ 1 < 2 }} {{ 3 > 2 > 1 }} {{ 1 == '1' }} {{ 1 === '1' }}", json!({})), "true false true false");
    }

    #[test]
    fn lookups_and_slices() {
        let data = json!({"user": {"name": "Ann", "tags": ["a", "b", "c", "d"]}});
        assert_eq!(ok("{{ user.name }} {{ user['name'] }} {{ user.tags[1] }}", data.clone()), "Ann Ann b");
        assert_eq!(ok("{{ user.tags[1:3] }} {{ user.tags[::-1] }} {{ user.tags[-2:] }}", data.clone()), "b,c d,c,b,a c,d");
        assert_eq!(ok("{{ 'hello'[1:4] }}", json!({})), "ell");
        assert_eq!(ok("{{ user.missing.deeper }}", data), "");
    }

    #[test]
    fn huge_slice_steps_stop_after_one_item() {
        assert_eq!(ok("{{ [1, 2, 3][1::9223372036854775807] }}", json!({})), "2");
        assert_eq!(ok("{{ [1, 2, 3][1::-9223372036854775807] }}", json!({})), "2");
        assert_eq!(ok("{{ 'abc'[::9223372036854775807] }}", json!({})), "a");
    }

    #[test]
    fn tests_via_is() {
        assert_eq!(ok("{{ x is defined }} {{ y is none }} {{ 9 is divisibleby(3) }} {{ 4 is not odd }}", json!({"x": 1, "y": null})), "true true true true");
        let err = render("{{ 1 is shiny }}", json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }

    #[test]
    fn for_loops() {
        assert_eq!(
            ok("{% for x in xs %}{{ loop.index }}:{{ x }}{% if not loop.last %},{% endif %}{% endfor %}", json!({"xs": ["a", "b"]})),
            "1:a,2:b"
        );
        assert_eq!(ok("{% for k, v in m %}{{ k }}={{ v }};{% endfor %}", json!({"m": {"a": 1, "b": 2}})), "a=1;b=2;");
        assert_eq!(ok("{% for k in m %}{{ k }}{% endfor %}", json!({"m": {"a": 1, "b": 2}})), "ab");
        assert_eq!(ok("{% for a, b in pairs %}{{ a }}{{ b }}{% endfor %}", json!({"pairs": [[1, 2], [3, 4]]})), "1234");
        assert_eq!(ok("{% for x in missing %}x{% else %}empty{% endfor %}", json!({})), "empty");
        assert_eq!(ok("{% for c in 'abc' %}{{ loop.revindex }}{{ c }}{% endfor %}", json!({})), "3a2b1c");
        assert!(render("{% for x in 5 %}{% endfor %}", json!({})).is_err());
    }

    #[test]
    fn set_and_capture() {
        assert_eq!(ok("{% set a, b = 'x' %}{{ a }}{{ b }}", json!({})), "xx");
        assert_eq!(ok("{% set html %}<b>{{ 1 }}</b>{% endset %}{{ html }}", json!({})), "<b>1</b>");
        // Writes from a loop body reach a variable bound outside it
        assert_eq!(ok("{% set n = 0 %}{% for x in [1, 2] %}{% set n = n + x %}{% endfor %}{{ n }}", json!({})), "3");
    }

    #[test]
    fn macros() {
        let source = "{% macro field(name, value='', type='text') %}\
                      <input type=\"{{ type }}\" name=\"{{ name }}\" value=\"{{ value }}\">\
                      {% endmacro %}\
                      {{ field('user') }}|{{ field('pass', type='password') }}|{{ field('n', 'v', 'x') }}";
        assert_eq!(
            ok(source, json!({})),
            "<input type=\"text\" name=\"user\" value=\"\">|\
             <input type=\"password\" name=\"pass\" value=\"\">|\
             <input type=\"x\" name=\"n\" value=\"v\">"
        );
    }

    #[test]
    fn macro_defaults_see_earlier_arguments() {
        assert_eq!(ok("{% macro m(a, b=a ~ '!') %}{{ b }}{% endmacro %}{{ m('hi') }}", json!({})), "hi!");
    }

    #[test]
    fn call_blocks() {
        let source = "{% macro list(items) %}<ul>{% for i in items %}<li>{{ caller(i) }}</li>{% endfor %}</ul>{% endmacro %}\
                      {% set prefix = '#' %}\
                      {% call(item) list(xs) %}{{ prefix }}{{ item }}{% endcall %}";
        assert_eq!(ok(source, json!({"xs": [1, 2]})), "<ul><li>#1</li><li>#2</li></ul>");
    }

    #[test]
    fn calling_non_functions_fails() {
        let err = render("{{ nothing() }}", json!({})).unwrap_err();
        assert!(err.message().contains("nothing"), "{}", err);
        let err = render("{{ s() }}", json!({"s": "text"})).unwrap_err();
        assert!(err.message().contains("not a function"), "{}", err);
    }

    #[test]
    fn filter_blocks_and_missing_filters() {
        let mut env = Environment::new();
        env.add_filter("shout", |value, _| Ok(Value::from(value.to_string().to_uppercase() + "!")));
        assert_eq!(env.render_string("{% filter shout %}hi {{ 'there' }}{% endfilter %}", json!({})).unwrap(), "HI THERE!");
        assert_eq!(env.render_string("{{ 'a' | shout }}", json!({})).unwrap(), "A!");
        let err = render("{{ x | nope }}", json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(err.message().contains("filter not found: nope"));
    }

    #[test]
    fn runaway_recursion_is_an_error() {
        // Deep nesting of boxed futures needs more than the default test stack
        let handle = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| render("{% macro f() %}{{ f() }}{% endmacro %}{{ f() }}", json!({})))
            .unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(err.message().contains("depth"), "{}", err);
    }

    #[test]
    fn globals() {
        assert_eq!(ok("{% for i in range(3) %}{{ i }}{% endfor %}", json!({})), "012");
        assert_eq!(ok("{{ range(1, 10, 4) }}", json!({})), "1,5,9");
    }
}
