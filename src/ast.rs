//! Template syntax tree.
//!
//! Nodes are immutable and shared through [`NodeRef`]. Every variant declares its
//! child fields once, in the table at the bottom of this file, which gives the
//! generic accessors ([`NodeKind::fields`], [`NodeKind::fields_mut`]) that the
//! rewriting passes are built on.

use std::sync::Arc;

pub type NodeRef = Arc<Node>;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub line: usize,
    pub column: usize,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(line: usize, column: usize, kind: NodeKind) -> NodeRef {
        Arc::new(Node { line, column, kind })
    }

    pub fn list(line: usize, column: usize, children: Vec<NodeRef>) -> NodeRef {
        Node::new(line, column, NodeKind::NodeList(Children { children }))
    }

    pub fn symbol(line: usize, column: usize, name: impl Into<String>) -> NodeRef {
        Node::new(line, column, NodeKind::Symbol(Symbol { name: name.into() }))
    }

    pub fn string(line: usize, column: usize, value: impl Into<String>) -> NodeRef {
        Node::new(
            line,
            column,
            NodeKind::Literal(Literal {
                value: LiteralValue::String(value.into()),
            }),
        )
    }

    /// Same position, different kind.
    pub fn with_kind(&self, kind: NodeKind) -> NodeRef {
        Node::new(self.line, self.column, kind)
    }

    /// The symbol name, when this node is a plain symbol.
    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Symbol(s) => Some(&s.name),
            _ => None,
        }
    }

    /// Children of list-style nodes.
    pub fn children(&self) -> &[NodeRef] {
        match &self.kind {
            NodeKind::Root(c)
            | NodeKind::NodeList(c)
            | NodeKind::Output(c)
            | NodeKind::Array(c)
            | NodeKind::Dict(c)
            | NodeKind::KeywordArgs(c) => &c.children,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Children {
    pub children: Vec<NodeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateData {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub body: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Regex { pattern: String, flags: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub value: LiteralValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub key: NodeRef,
    pub value: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinOp {
    pub left: NodeRef,
    pub right: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryOp {
    pub target: NodeRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,       // ==
    StrictEq, // ===
    Ne,       // !=
    StrictNe, // !==
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    pub fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "==" => CompareOp::Eq,
            "===" => CompareOp::StrictEq,
            "!=" => CompareOp::Ne,
            "!==" => CompareOp::StrictNe,
            "<" => CompareOp::Lt,
            ">" => CompareOp::Gt,
            "<=" => CompareOp::Le,
            ">=" => CompareOp::Ge,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compare {
    pub expr: NodeRef,
    /// `CompareOperand` nodes, applied left to right.
    pub ops: Vec<NodeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareOperand {
    pub expr: NodeRef,
    pub op: CompareOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineIf {
    pub cond: NodeRef,
    pub body: NodeRef,
    pub else_: Option<NodeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupVal {
    pub target: NodeRef,
    pub val: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub start: Option<NodeRef>,
    pub stop: Option<NodeRef>,
    pub step: Option<NodeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunCall {
    pub name: NodeRef,
    /// `NodeList` of positional arguments, optionally ending in `KeywordArgs`.
    pub args: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub name: String,
    /// `NodeList` whose first element is the filtered value.
    pub args: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExtension {
    pub extension: String,
    pub method: String,
    pub args: NodeRef,
    pub content: Vec<NodeRef>,
    pub autoescape: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct If {
    pub cond: NodeRef,
    pub body: NodeRef,
    pub else_: Option<NodeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct For {
    /// A `Symbol`, or an `Array` of symbols for destructuring.
    pub name: NodeRef,
    pub arr: NodeRef,
    pub body: NodeRef,
    pub else_: Option<NodeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Set {
    pub targets: Vec<NodeRef>,
    pub value: Option<NodeRef>,
    /// `Capture` node for the block form.
    pub body: Option<NodeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    pub name: String,
    /// `NodeList` of symbols, optionally ending in `KeywordArgs` of defaults.
    pub args: NodeRef,
    pub body: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub body: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Super {
    pub block_name: String,
    pub symbol: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extends {
    pub template: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub template: NodeRef,
    pub ignore_missing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub template: NodeRef,
    pub target: String,
    pub with_context: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportName {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromImport {
    pub template: NodeRef,
    pub names: Vec<ImportName>,
    pub with_context: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsyncBind {
    pub call: NodeRef,
    pub symbol: NodeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    // Structure
    Root(Children),
    NodeList(Children),
    Output(Children),
    TemplateData(TemplateData),
    Capture(Capture),

    // Literals and references
    Literal(Literal),
    Symbol(Symbol),
    Array(Children),
    Pair(Pair),
    Dict(Children),
    KeywordArgs(Children),

    // Operators
    Or(BinOp),
    And(BinOp),
    In(BinOp),
    Is(BinOp),
    Add(BinOp),
    Concat(BinOp),
    Sub(BinOp),
    Mul(BinOp),
    Div(BinOp),
    FloorDiv(BinOp),
    Mod(BinOp),
    Pow(BinOp),
    Not(UnaryOp),
    Neg(UnaryOp),
    Pos(UnaryOp),
    Compare(Compare),
    CompareOperand(CompareOperand),
    InlineIf(InlineIf),

    // Access and calls
    LookupVal(LookupVal),
    Slice(Slice),
    FunCall(FunCall),
    Filter(Filter),
    CallExtension(CallExtension),
    CallExtensionAsync(CallExtension),

    // Statements
    If(If),
    IfAsync(If),
    For(For),
    AsyncEach(For),
    AsyncAll(For),
    Set(Set),
    Macro(Macro),
    Caller(Macro),
    Block(Block),
    Super(Super),
    Extends(Extends),
    Include(Include),
    Import(Import),
    FromImport(FromImport),

    // Inserted by the async lifting pass
    AsyncBind(AsyncBind),
}

/// A child slot of a node.
#[derive(Debug, Clone, Copy)]
pub enum Field<'a> {
    One(&'a NodeRef),
    Opt(&'a Option<NodeRef>),
    Many(&'a Vec<NodeRef>),
}

impl<'a> From<&'a NodeRef> for Field<'a> {
    fn from(node: &'a NodeRef) -> Self {
        Field::One(node)
    }
}

impl<'a> From<&'a Option<NodeRef>> for Field<'a> {
    fn from(node: &'a Option<NodeRef>) -> Self {
        Field::Opt(node)
    }
}

impl<'a> From<&'a Vec<NodeRef>> for Field<'a> {
    fn from(nodes: &'a Vec<NodeRef>) -> Self {
        Field::Many(nodes)
    }
}

impl<'a> Field<'a> {
    pub fn nodes(self) -> Box<dyn Iterator<Item = &'a NodeRef> + 'a> {
        match self {
            Field::One(node) => Box::new(std::iter::once(node)),
            Field::Opt(node) => Box::new(node.iter()),
            Field::Many(nodes) => Box::new(nodes.iter()),
        }
    }
}

pub enum FieldMut<'a> {
    One(&'a mut NodeRef),
    Opt(&'a mut Option<NodeRef>),
    Many(&'a mut Vec<NodeRef>),
}

impl<'a> From<&'a mut NodeRef> for FieldMut<'a> {
    fn from(node: &'a mut NodeRef) -> Self {
        FieldMut::One(node)
    }
}

impl<'a> From<&'a mut Option<NodeRef>> for FieldMut<'a> {
    fn from(node: &'a mut Option<NodeRef>) -> Self {
        FieldMut::Opt(node)
    }
}

impl<'a> From<&'a mut Vec<NodeRef>> for FieldMut<'a> {
    fn from(nodes: &'a mut Vec<NodeRef>) -> Self {
        FieldMut::Many(nodes)
    }
}

macro_rules! node_fields {
    ($($variant:ident => [$($field:ident),*]),* $(,)?) => {
        impl NodeKind {
            pub fn name(&self) -> &'static str {
                match self {
                    $(NodeKind::$variant(_) => stringify!($variant),)*
                }
            }

            /// Declared child fields, in evaluation order.
            pub fn field_names(&self) -> &'static [&'static str] {
                match self {
                    $(NodeKind::$variant(_) => &[$(stringify!($field)),*],)*
                }
            }

            #[allow(unused_variables)]
            pub fn fields(&self) -> Vec<Field<'_>> {
                match self {
                    $(NodeKind::$variant(n) => vec![$(Field::from(&n.$field)),*],)*
                }
            }

            #[allow(unused_variables)]
            pub fn fields_mut(&mut self) -> Vec<FieldMut<'_>> {
                match self {
                    $(NodeKind::$variant(n) => vec![$(FieldMut::from(&mut n.$field)),*],)*
                }
            }
        }
    };
}

node_fields! {
    Root => [children],
    NodeList => [children],
    Output => [children],
    TemplateData => [],
    Capture => [body],
    Literal => [],
    Symbol => [],
    Array => [children],
    Pair => [key, value],
    Dict => [children],
    KeywordArgs => [children],
    Or => [left, right],
    And => [left, right],
    In => [left, right],
    Is => [left, right],
    Add => [left, right],
    Concat => [left, right],
    Sub => [left, right],
    Mul => [left, right],
    Div => [left, right],
    FloorDiv => [left, right],
    Mod => [left, right],
    Pow => [left, right],
    Not => [target],
    Neg => [target],
    Pos => [target],
    Compare => [expr, ops],
    CompareOperand => [expr],
    InlineIf => [cond, body, else_],
    LookupVal => [target, val],
    Slice => [start, stop, step],
    FunCall => [name, args],
    Filter => [args],
    CallExtension => [args, content],
    CallExtensionAsync => [args, content],
    If => [cond, body, else_],
    IfAsync => [cond, body, else_],
    For => [arr, name, body, else_],
    AsyncEach => [arr, name, body, else_],
    AsyncAll => [arr, name, body, else_],
    Set => [targets, value, body],
    Macro => [args, body],
    Caller => [args, body],
    Block => [body],
    Super => [symbol],
    Extends => [template],
    Include => [template],
    Import => [template],
    FromImport => [template],
    AsyncBind => [call, symbol],
}

enum Slot {
    One(NodeRef),
    Opt(Option<NodeRef>),
    Many(Vec<NodeRef>),
}

/// Rebuild `node` with every child passed through `f`.
///
/// Returns the original `Arc` when `f` hands back every child unchanged, so
/// untouched subtrees stay shared.
pub fn map_children(node: &NodeRef, f: &mut dyn FnMut(&NodeRef) -> NodeRef) -> NodeRef {
    let mut changed = false;
    let mut slots = Vec::new();
    for field in node.kind.fields() {
        let slot = match field {
            Field::One(child) => {
                let new = f(child);
                changed |= !Arc::ptr_eq(child, &new);
                Slot::One(new)
            }
            Field::Opt(child) => {
                let new = child.as_ref().map(|c| {
                    let new = f(c);
                    changed |= !Arc::ptr_eq(c, &new);
                    new
                });
                Slot::Opt(new)
            }
            Field::Many(children) => {
                let new: Vec<NodeRef> = children
                    .iter()
                    .map(|c| {
                        let new = f(c);
                        changed |= !Arc::ptr_eq(c, &new);
                        new
                    })
                    .collect();
                Slot::Many(new)
            }
        };
        slots.push(slot);
    }

    if !changed {
        return Arc::clone(node);
    }

    let mut rebuilt = (**node).clone();
    for (field, slot) in rebuilt.kind.fields_mut().into_iter().zip(slots) {
        match (field, slot) {
            (FieldMut::One(dst), Slot::One(new)) => *dst = new,
            (FieldMut::Opt(dst), Slot::Opt(new)) => *dst = new,
            (FieldMut::Many(dst), Slot::Many(new)) => *dst = new,
            _ => unreachable!("field table changed shape during rewrite"),
        }
    }
    Arc::new(rebuilt)
}

/// A tree rewrite driven by [`rewrite`].
pub trait Rewriter {
    /// Called before a node's children. Returning `Some` replaces the node and
    /// skips its subtree.
    fn enter(&mut self, _node: &NodeRef) -> Option<NodeRef> {
        None
    }

    /// Called after the node's children have been rewritten.
    fn leave(&mut self, node: NodeRef) -> NodeRef {
        node
    }
}

pub fn rewrite<R: Rewriter + ?Sized>(node: &NodeRef, rewriter: &mut R) -> NodeRef {
    if let Some(replacement) = rewriter.enter(node) {
        return replacement;
    }
    let node = map_children(node, &mut |child: &NodeRef| rewrite(child, rewriter));
    rewriter.leave(node)
}

/// True if any node under `node` (excluding `node` itself) matches `pred`.
/// Subtrees rooted at nodes matching `stop` are not searched.
pub fn any_descendant(
    node: &Node,
    pred: &dyn Fn(&Node) -> bool,
    stop: &dyn Fn(&Node) -> bool,
) -> bool {
    node.kind.fields().into_iter().any(|field| {
        field.nodes().any(|child| {
            let child: &Node = child;
            pred(child) || (!stop(child) && any_descendant(child, pred, stop))
        })
    })
}

/// Collect every node matching `pred`, pre-order.
pub fn find_all(node: &NodeRef, pred: &dyn Fn(&Node) -> bool) -> Vec<NodeRef> {
    let mut found = Vec::new();
    collect(node, pred, &mut found);
    found
}

fn collect(node: &NodeRef, pred: &dyn Fn(&Node) -> bool, found: &mut Vec<NodeRef>) {
    if pred(node.as_ref()) {
        found.push(Arc::clone(node));
    }
    for field in node.kind.fields() {
        for child in field.nodes() {
            collect(child, pred, found);
        }
    }
}
