//! Rewrites applied between parsing and evaluation.
//!
//! 1. Calls that may suspend (async filters, async extension tags) are pulled
//!    out of expressions into `AsyncBind` nodes placed before the statement
//!    that used them.
//! 2. `super()` calls inside a block become a `Super` node at the top of the
//!    block body plus a symbol reference at the call site.
//! 3. `If`/`For` statements containing async work become `IfAsync`/`AsyncEach`.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::ast::*;

pub fn transform(root: &NodeRef, async_filters: &HashSet<String>) -> NodeRef {
    let mut lifter = AsyncLifter {
        async_filters,
        counter: 0,
    };
    let root = rewrite(root, &mut lifter);
    let root = rewrite(&root, &mut SuperLifter { counter: 0 });
    rewrite(&root, &mut Promoter)
}

struct AsyncLifter<'a> {
    async_filters: &'a HashSet<String>,
    counter: usize,
}

impl AsyncLifter<'_> {
    /// Rewrite the expression slots of `node`, then put any collected binds in
    /// front of it.
    fn lift(&mut self, node: NodeRef) -> NodeRef {
        let mut calls = CallCollector {
            async_filters: self.async_filters,
            counter: &mut self.counter,
            binds: Vec::new(),
        };

        let lifted = match &node.kind {
            NodeKind::Output(_) => map_children(&node, &mut |child: &NodeRef| rewrite(child, &mut calls)),
            NodeKind::Set(set) => match &set.value {
                Some(value) => {
                    let value = rewrite(value, &mut calls);
                    node.with_kind(NodeKind::Set(Set {
                        value: Some(value),
                        ..set.clone()
                    }))
                }
                None => return node,
            },
            NodeKind::For(f) | NodeKind::AsyncEach(f) | NodeKind::AsyncAll(f) => {
                let arr = rewrite(&f.arr, &mut calls);
                let f = For { arr, ..f.clone() };
                node.with_kind(match &node.kind {
                    NodeKind::AsyncEach(_) => NodeKind::AsyncEach(f),
                    NodeKind::AsyncAll(_) => NodeKind::AsyncAll(f),
                    _ => NodeKind::For(f),
                })
            }
            NodeKind::If(i) | NodeKind::IfAsync(i) => {
                let cond = rewrite(&i.cond, &mut calls);
                let i = If { cond, ..i.clone() };
                node.with_kind(match &node.kind {
                    NodeKind::IfAsync(_) => NodeKind::IfAsync(i),
                    _ => NodeKind::If(i),
                })
            }
            NodeKind::CallExtension(call) | NodeKind::CallExtensionAsync(call) => {
                let args = rewrite(&call.args, &mut calls);
                let call = CallExtension { args, ..call.clone() };
                node.with_kind(match &node.kind {
                    NodeKind::CallExtensionAsync(_) => NodeKind::CallExtensionAsync(call),
                    _ => NodeKind::CallExtension(call),
                })
            }
            _ => return node,
        };

        if calls.binds.is_empty() {
            return node;
        }
        trace!(statement = node.kind.name(), binds = calls.binds.len(), "lifted async calls");
        let mut nodes = calls.binds;
        nodes.push(lifted);
        Node::list(node.line, node.column, nodes)
    }
}

impl Rewriter for AsyncLifter<'_> {
    fn leave(&mut self, node: NodeRef) -> NodeRef {
        self.lift(node)
    }
}

/// Replaces suspend-capable calls inside one expression with placeholders.
struct CallCollector<'a> {
    async_filters: &'a HashSet<String>,
    counter: &'a mut usize,
    binds: Vec<NodeRef>,
}

impl Rewriter for CallCollector<'_> {
    fn enter(&mut self, node: &NodeRef) -> Option<NodeRef> {
        // Statement bodies nested in expressions were lifted on their own
        match node.kind {
            NodeKind::Block(_) | NodeKind::Capture(_) | NodeKind::Caller(_) | NodeKind::AsyncBind(_) => {
                Some(Arc::clone(node))
            }
            _ => None,
        }
    }

    fn leave(&mut self, node: NodeRef) -> NodeRef {
        let suspends = match &node.kind {
            NodeKind::Filter(filter) => self.async_filters.contains(&filter.name),
            NodeKind::CallExtensionAsync(_) => true,
            _ => false,
        };
        if !suspends {
            return node;
        }
        let symbol = Node::symbol(node.line, node.column, format!("#t{}", self.counter));
        *self.counter += 1;
        self.binds.push(node.with_kind(NodeKind::AsyncBind(AsyncBind {
            call: Arc::clone(&node),
            symbol: Arc::clone(&symbol),
        })));
        symbol
    }
}

struct SuperLifter {
    counter: usize,
}

impl Rewriter for SuperLifter {
    fn leave(&mut self, node: NodeRef) -> NodeRef {
        let NodeKind::Block(block) = &node.kind else {
            return node;
        };
        let symbol = Node::symbol(node.line, node.column, format!("#s{}", self.counter));
        let mut finder = SuperFinder {
            symbol: &symbol,
            found: false,
        };
        let body = rewrite(&block.body, &mut finder);
        if !finder.found {
            return node;
        }
        self.counter += 1;

        let lifted = node.with_kind(NodeKind::Super(Super {
            block_name: block.name.clone(),
            symbol,
        }));
        let mut children = vec![lifted];
        match &body.kind {
            NodeKind::NodeList(list) => children.extend(list.children.iter().cloned()),
            _ => children.push(body.clone()),
        }
        node.with_kind(NodeKind::Block(Block {
            name: block.name.clone(),
            body: Node::list(body.line, body.column, children),
        }))
    }
}

struct SuperFinder<'a> {
    symbol: &'a NodeRef,
    found: bool,
}

impl Rewriter for SuperFinder<'_> {
    fn enter(&mut self, node: &NodeRef) -> Option<NodeRef> {
        match node.kind {
            NodeKind::Block(_) => Some(Arc::clone(node)),
            _ => None,
        }
    }

    fn leave(&mut self, node: NodeRef) -> NodeRef {
        if let NodeKind::FunCall(call) = &node.kind {
            if call.name.as_symbol() == Some("super") && call.args.children().is_empty() {
                self.found = true;
                return Arc::clone(self.symbol);
            }
        }
        node
    }
}

fn is_async_node(node: &Node) -> bool {
    matches!(
        node.kind,
        NodeKind::AsyncBind(_)
            | NodeKind::IfAsync(_)
            | NodeKind::AsyncEach(_)
            | NodeKind::AsyncAll(_)
            | NodeKind::CallExtensionAsync(_)
    )
}

fn is_block(node: &Node) -> bool {
    matches!(node.kind, NodeKind::Block(_))
}

struct Promoter;

impl Rewriter for Promoter {
    fn leave(&mut self, node: NodeRef) -> NodeRef {
        let kind = match &node.kind {
            NodeKind::If(i) if any_descendant(&node, &is_async_node, &is_block) => {
                NodeKind::IfAsync(i.clone())
            }
            NodeKind::For(f) if any_descendant(&node, &is_async_node, &is_block) => {
                NodeKind::AsyncEach(f.clone())
            }
            _ => return node,
        };
        trace!(line = node.line, from = node.kind.name(), "promoted statement to async");
        node.with_kind(kind)
    }
}
