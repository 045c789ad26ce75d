//! Render-time variable storage.
//!
//! A [`Frame`] holds local bindings (loop variables, `set` targets, macro
//! arguments) and links to its parent. A [`Context`] holds the render data,
//! the block table used by inheritance and the names a template exports.
//! Both live for one render only.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::ast::NodeRef;
use crate::environment::Environment;
use crate::error::{Result, TemplateError};
use crate::value::{Map, Value};

#[derive(Debug, Default)]
pub struct Frame {
    variables: RefCell<Map>,
    parent: Option<Rc<Frame>>,
    /// Writes that resolve upwards stop here.
    isolate_writes: bool,
    top_level: bool,
}

impl Frame {
    pub fn root() -> Rc<Frame> {
        Rc::new(Frame {
            top_level: true,
            ..Frame::default()
        })
    }

    /// A parentless frame that is not top level (macro bodies).
    pub fn detached() -> Rc<Frame> {
        Rc::new(Frame::default())
    }

    /// A parentless frame seeded with `vars`.
    pub fn from_vars(vars: Map) -> Rc<Frame> {
        Rc::new(Frame {
            variables: RefCell::new(vars),
            ..Frame::default()
        })
    }

    pub fn push(self: &Rc<Self>, isolate_writes: bool) -> Rc<Frame> {
        Rc::new(Frame {
            variables: RefCell::default(),
            parent: Some(Rc::clone(self)),
            isolate_writes,
            top_level: false,
        })
    }

    /// A child that still counts as top level (include/import roots).
    pub fn push_top_level(self: &Rc<Self>, isolate_writes: bool) -> Rc<Frame> {
        Rc::new(Frame {
            variables: RefCell::default(),
            parent: Some(Rc::clone(self)),
            isolate_writes,
            top_level: true,
        })
    }

    pub fn is_top_level(&self) -> bool {
        self.top_level
    }

    /// Bind `name`. With `resolve_up`, an existing binding in an ancestor is
    /// overwritten instead, unless a write-isolated frame lies in between.
    pub fn set(&self, name: &str, value: Value, resolve_up: bool) {
        if resolve_up {
            if let Some(frame) = self.resolve(name, true) {
                frame.variables.borrow_mut().insert(name.to_string(), value);
                return;
            }
        }
        self.variables.borrow_mut().insert(name.to_string(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.variables.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// The nearest frame binding `name`. When resolving for a write the search
    /// does not go past an isolated frame.
    pub fn resolve(&self, name: &str, for_write: bool) -> Option<&Frame> {
        if self.variables.borrow().contains_key(name) {
            return Some(self);
        }
        if for_write && self.isolate_writes {
            return None;
        }
        self.parent.as_deref().and_then(|p| p.resolve(name, for_write))
    }

    /// Every visible binding, nearest first.
    pub fn flatten(&self) -> Map {
        let mut map = match &self.parent {
            Some(parent) => parent.flatten(),
            None => Map::new(),
        };
        for (k, v) in self.variables.borrow().iter() {
            map.insert(k.clone(), v.clone());
        }
        map
    }
}

/// A block body registered for inheritance.
#[derive(Debug)]
pub struct BlockDef {
    pub name: String,
    pub body: NodeRef,
    /// Template that defined this block.
    pub template: Arc<str>,
}

pub struct Context {
    env: Environment,
    ctx: RefCell<Map>,
    blocks: RefCell<IndexMap<String, Vec<Arc<BlockDef>>>>,
    exported: RefCell<IndexSet<String>>,
}

impl Context {
    pub fn new(env: Environment, vars: Map, blocks: &IndexMap<String, Arc<BlockDef>>) -> Self {
        let blocks = blocks
            .iter()
            .map(|(name, block)| (name.clone(), vec![Arc::clone(block)]))
            .collect();
        Self {
            env,
            ctx: RefCell::new(vars),
            blocks: RefCell::new(blocks),
            exported: RefCell::default(),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Render data first, then environment globals.
    pub fn lookup(&self, name: &str) -> Value {
        if let Some(value) = self.ctx.borrow().get(name) {
            return value.clone();
        }
        self.env.global(name).unwrap_or_default()
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        self.ctx.borrow_mut().insert(name.to_string(), value);
    }

    pub fn variables(&self) -> Map {
        self.ctx.borrow().clone()
    }

    /// Queue `block` behind any existing entries for its name.
    pub fn add_block(&self, block: Arc<BlockDef>) {
        self.blocks
            .borrow_mut()
            .entry(block.name.clone())
            .or_default()
            .push(block);
    }

    pub fn get_block(&self, name: &str) -> Result<Arc<BlockDef>> {
        self.blocks
            .borrow()
            .get(name)
            .and_then(|entries| entries.first().cloned())
            .ok_or_else(|| TemplateError::resolution(format!("unknown block \"{}\"", name)))
    }

    /// The entry that `current` overrides.
    pub fn get_super(&self, name: &str, current: &Arc<BlockDef>) -> Result<Arc<BlockDef>> {
        let blocks = self.blocks.borrow();
        let entries = blocks.get(name).map(Vec::as_slice).unwrap_or_default();
        entries
            .iter()
            .position(|b| Arc::ptr_eq(b, current))
            .and_then(|i| entries.get(i + 1).cloned())
            .ok_or_else(|| {
                TemplateError::evaluation(format!("no super block available for \"{}\"", name))
            })
    }

    pub fn add_export(&self, name: &str) {
        self.exported.borrow_mut().insert(name.to_string());
    }

    /// Exported names with their current values.
    pub fn exported(&self) -> Map {
        let ctx = self.ctx.borrow();
        self.exported
            .borrow()
            .iter()
            .map(|name| (name.clone(), ctx.get(name).cloned().unwrap_or_default()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Node;

    #[test]
    fn lookup_walks_parents() {
        let root = Frame::root();
        root.set("a", Value::Int(1), false);
        let child = root.push(false);
        child.set("b", Value::Int(2), false);
        assert_eq!(child.lookup("a"), Some(Value::Int(1)));
        assert_eq!(child.lookup("b"), Some(Value::Int(2)));
        assert_eq!(root.lookup("b"), None);
        assert!(root.is_top_level());
        assert!(!child.is_top_level());
    }

    #[test]
    fn writes_stop_at_isolated_frames() {
        let root = Frame::root();
        root.set("x", Value::Int(1), false);

        let open = root.push(false);
        open.set("x", Value::Int(2), true);
        assert_eq!(root.lookup("x"), Some(Value::Int(2)));

        let isolated = root.push(true);
        isolated.set("x", Value::Int(3), true);
        assert_eq!(root.lookup("x"), Some(Value::Int(2)));
        assert_eq!(isolated.lookup("x"), Some(Value::Int(3)));
    }

    #[test]
    fn flatten_prefers_nearest() {
        let root = Frame::root();
        root.set("x", Value::Int(1), false);
        root.set("y", Value::Int(1), false);
        let child = root.push(false);
        child.set("x", Value::Int(2), false);
        let flat = child.flatten();
        assert_eq!(flat.get("x"), Some(&Value::Int(2)));
        assert_eq!(flat.get("y"), Some(&Value::Int(1)));
    }

    fn block(name: &str, template: &str) -> Arc<BlockDef> {
        Arc::new(BlockDef {
            name: name.to_string(),
            body: Node::list(1, 1, vec![]),
            template: Arc::from(template),
        })
    }

    #[test]
    fn block_chain() {
        let child = block("content", "child.html");
        let mut own = IndexMap::new();
        own.insert("content".to_string(), Arc::clone(&child));
        let context = Context::new(Environment::new(), Map::new(), &own);

        let parent = block("content", "base.html");
        context.add_block(Arc::clone(&parent));

        assert!(Arc::ptr_eq(&context.get_block("content").unwrap(), &child));
        assert!(Arc::ptr_eq(&context.get_super("content", &child).unwrap(), &parent));
        assert!(context.get_super("content", &parent).is_err());
        assert!(context.get_block("missing").is_err());
    }

    #[test]
    fn exports_track_current_values() {
        let context = Context::new(Environment::new(), Map::new(), &IndexMap::new());
        context.set_variable("title", Value::from("a"));
        context.add_export("title");
        context.set_variable("title", Value::from("b"));
        assert_eq!(context.exported().get("title"), Some(&Value::from("b")));
    }
}
