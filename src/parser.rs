use std::collections::VecDeque;
use std::sync::Arc;

use crate::ast::*;
use crate::config::Config;
use crate::error::{Result, TemplateError};
use crate::extension::Extension;
use crate::lexer::{Token, TokenKind, Tokenizer};

/// Tags that only make sense as the continuation or end of an open block.
fn is_closing_tag(name: &str) -> bool {
    name.starts_with("end") || matches!(name, "else" | "elif" | "elseif")
}

fn describe(token: &Token) -> String {
    match token.kind {
        TokenKind::Data => "template text".to_string(),
        TokenKind::String => format!("string \"{}\"", token.value),
        _ => format!("`{}`", token.value),
    }
}

fn error_at(message: impl Into<String>, token: &Token) -> TemplateError {
    TemplateError::syntax(message, token.line, token.column)
}

struct OpenTag {
    name: String,
    end: String,
    line: usize,
}

pub struct Parser<'a> {
    lexer: Tokenizer<'a>,
    buffer: VecDeque<Token>,
    extensions: &'a [Arc<dyn Extension>],
    comment_start: String,
    comment_end: String,
    drop_leading_whitespace: bool,
    open: Vec<OpenTag>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self::with_config(input, &Config::default(), &[])
    }

    pub fn with_config(
        input: &'a str,
        config: &Config,
        extensions: &'a [Arc<dyn Extension>],
    ) -> Self {
        Self {
            lexer: Tokenizer::with_config(input, config),
            buffer: VecDeque::new(),
            extensions,
            comment_start: config.tags.comment_start.clone(),
            comment_end: config.tags.comment_end.clone(),
            drop_leading_whitespace: false,
            open: Vec::new(),
        }
    }

    /// Look `n` tokens ahead, skipping whitespace.
    pub fn peek(&mut self, n: usize) -> Result<Option<&Token>> {
        while self.buffer.len() <= n {
            match self.lexer.next_token()? {
                Some(token) if token.kind == TokenKind::Whitespace => continue,
                Some(token) => self.buffer.push_back(token),
                None => return Ok(None),
            }
        }
        Ok(self.buffer.get(n))
    }

    fn peek_kind(&mut self, n: usize) -> Result<Option<TokenKind>> {
        Ok(self.peek(n)?.map(|t| t.kind))
    }

    fn peek_is(&mut self, n: usize, kind: TokenKind, value: &str) -> Result<bool> {
        Ok(self.peek(n)?.is_some_and(|t| t.is(kind, value)))
    }

    pub fn next_token(&mut self) -> Result<Option<Token>> {
        if let Some(token) = self.buffer.pop_front() {
            return Ok(Some(token));
        }
        loop {
            match self.lexer.next_token()? {
                Some(token) if token.kind == TokenKind::Whitespace => continue,
                other => return Ok(other),
            }
        }
    }

    fn unexpected_eof(&self, expected: &str) -> TemplateError {
        TemplateError::syntax(
            format!("expected {}, got end of file", expected),
            self.lexer.line(),
            self.lexer.column(),
        )
    }

    pub fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token> {
        match self.next_token()? {
            Some(t) if t.kind == kind => Ok(t),
            Some(t) => Err(error_at(format!("expected {}, got {}", expected, describe(&t)), &t)),
            None => Err(self.unexpected_eof(expected)),
        }
    }

    pub fn skip(&mut self, kind: TokenKind) -> Result<bool> {
        if self.peek_kind(0)? == Some(kind) {
            self.next_token()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn skip_value(&mut self, kind: TokenKind, value: &str) -> Result<bool> {
        if self.peek_is(0, kind, value)? {
            self.next_token()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn skip_symbol(&mut self, name: &str) -> Result<bool> {
        self.skip_value(TokenKind::Symbol, name)
    }

    fn next_trims_before(&mut self) -> Result<bool> {
        let comment_trim = format!("{}-", self.comment_start);
        Ok(match self.peek(0)? {
            Some(t) if matches!(t.kind, TokenKind::BlockStart | TokenKind::VariableStart) => {
                t.value.ends_with('-')
            }
            Some(t) if t.kind == TokenKind::Comment => t.value.starts_with(&comment_trim),
            _ => false,
        })
    }

    /// Parse a whole template into a `Root` node.
    pub fn parse(&mut self) -> Result<NodeRef> {
        let nodes = self.parse_nodes(&[])?;
        Ok(Node::new(1, 1, NodeKind::Root(Children { children: nodes })))
    }

    fn parse_nodes(&mut self, until: &[&str]) -> Result<Vec<NodeRef>> {
        let mut nodes = Vec::new();
        loop {
            let token = match self.peek(0)? {
                Some(t) => t.clone(),
                None => break,
            };
            match token.kind {
                TokenKind::BlockStart => {
                    // A pending `-%}`/`-}}` trim never reaches past the next tag
                    self.drop_leading_whitespace = false;
                    // Block terminator found; stop parsing this sequence
                    if let Some(next) = self.peek(1)? {
                        if next.kind == TokenKind::Symbol && until.contains(&next.value.as_str()) {
                            break;
                        }
                    }
                    self.next_token()?; // {%
                    nodes.push(self.parse_statement()?);
                }
                TokenKind::Data => {
                    self.next_token()?;
                    let mut text = token.value.as_str();
                    if self.drop_leading_whitespace {
                        text = text.trim_start();
                        self.drop_leading_whitespace = false;
                    }
                    if self.next_trims_before()? {
                        text = text.trim_end();
                    }
                    if !text.is_empty() {
                        let data = Node::new(
                            token.line,
                            token.column,
                            NodeKind::TemplateData(TemplateData { text: text.to_string() }),
                        );
                        nodes.push(token_output(&token, data));
                    }
                }
                TokenKind::VariableStart => {
                    self.next_token()?; // {{
                    let expr = self.parse_expression()?;
                    self.drop_leading_whitespace = false;
                    let end = self.expect(TokenKind::VariableEnd, "end of variable tag")?;
                    if end.value.starts_with('-') {
                        self.drop_leading_whitespace = true;
                    }
                    nodes.push(token_output(&token, expr));
                }
                TokenKind::Comment => {
                    self.next_token()?;
                    let trim = format!("-{}", self.comment_end);
                    self.drop_leading_whitespace = token.value.ends_with(&trim);
                }
                _ => {
                    return Err(error_at(
                        format!("unexpected token at top level: {}", describe(&token)),
                        &token,
                    ))
                }
            }
        }
        Ok(nodes)
    }

    /// Parse statements until a tag named in `names` (the last one being the
    /// real end tag). Consumes that tag's `{%` and returns its name, which is
    /// left unconsumed.
    pub fn parse_body(&mut self, opener: &Token, names: &[&str]) -> Result<(NodeRef, String)> {
        let end = names.last().copied().unwrap_or("end");
        self.open.push(OpenTag {
            name: opener.value.clone(),
            end: end.to_string(),
            line: opener.line,
        });
        let nodes = self.parse_nodes(names);
        self.open.pop();
        let body = Node::list(opener.line, opener.column, nodes?);

        match self.next_token()? {
            Some(t) if t.kind == TokenKind::BlockStart => {
                let name = self.peek(0)?.map(|t| t.value.clone()).unwrap_or_default();
                Ok((body, name))
            }
            _ => Err(error_at(
                format!(
                    "missing end tag `{}` for `{}` opened on line {}",
                    end, opener.value, opener.line
                ),
                opener,
            )),
        }
    }

    /// Consume the end tag name left by [`Parser::parse_body`] and its block end.
    pub fn finish_end_tag(&mut self, name: &str) -> Result<Token> {
        self.expect(TokenKind::Symbol, name)?;
        self.advance_after_block_end(name)
    }

    pub fn advance_after_block_end(&mut self, name: &str) -> Result<Token> {
        match self.next_token()? {
            Some(t) if t.kind == TokenKind::BlockEnd => {
                self.drop_leading_whitespace = t.value.starts_with('-');
                Ok(t)
            }
            Some(t) => Err(error_at(
                format!("expected block end in {} statement, got {}", name, describe(&t)),
                &t,
            )),
            None => Err(self.unexpected_eof(&format!("block end in {} statement", name))),
        }
    }

    fn parse_statement(&mut self) -> Result<NodeRef> {
        let tag = match self.peek(0)? {
            Some(t) if t.kind == TokenKind::Symbol => t.clone(),
            Some(t) => {
                let t = t.clone();
                return Err(error_at(format!("tag name expected, got {}", describe(&t)), &t));
            }
            None => return Err(self.unexpected_eof("tag name")),
        };

        match tag.value.as_str() {
            "raw" | "verbatim" => self.parse_raw(),
            "if" | "ifAsync" => self.parse_if(),
            "for" | "asyncEach" | "asyncAll" => self.parse_for(),
            "block" => self.parse_block(),
            "extends" => self.parse_extends(),
            "include" => self.parse_include(),
            "set" => self.parse_set(),
            "macro" => self.parse_macro(),
            "call" => self.parse_call(),
            "import" => self.parse_import(),
            "from" => self.parse_from(),
            "filter" => self.parse_filter_statement(),
            name => {
                let extension = self
                    .extensions
                    .iter()
                    .find(|ext| ext.tags().contains(&name))
                    .cloned();
                if let Some(extension) = extension {
                    self.next_token()?;
                    return extension.parse(self, tag);
                }
                if is_closing_tag(name) {
                    return Err(match self.open.last() {
                        Some(open) => error_at(
                            format!(
                                "missing end tag `{}` for `{}` opened on line {}, found `{}`",
                                open.end, open.name, open.line, name
                            ),
                            &tag,
                        ),
                        None => error_at(format!("unexpected `{}` tag", name), &tag),
                    });
                }
                Err(error_at(format!("unknown block tag: {}", name), &tag))
            }
        }
    }

    fn parse_raw(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "raw")?;
        self.advance_after_block_end(&tag.value)?;
        let end = format!("end{}", tag.value);
        if let Some(extra) = self.buffer.front() {
            return Err(error_at(format!("unexpected {} after {} tag", describe(extra), tag.value), extra));
        }
        let raw = self.lexer.take_raw(&end).ok_or_else(|| {
            error_at(
                format!("missing end tag `{}` for `{}` opened on line {}", end, tag.value, tag.line),
                &tag,
            )
        })?;
        let mut text = raw.text;
        if self.drop_leading_whitespace {
            text = text.trim_start().to_string();
        }
        self.drop_leading_whitespace = raw.trim_after;
        let data = Node::new(tag.line, tag.column, NodeKind::TemplateData(TemplateData { text }));
        Ok(token_output(&tag, data))
    }

    fn parse_if(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "if")?; // if, elif, elseif or ifAsync
        let cond = self.parse_expression()?;
        self.advance_after_block_end(&tag.value)?;

        let (body, closing) = self.parse_body(&tag, &["elif", "elseif", "else", "endif"])?;
        let else_ = match closing.as_str() {
            "elif" | "elseif" => Some(self.parse_if()?),
            "else" => {
                self.finish_end_tag("else")?;
                let (else_body, _) = self.parse_body(&tag, &["endif"])?;
                self.finish_end_tag("endif")?;
                Some(else_body)
            }
            _ => {
                self.finish_end_tag("endif")?;
                None
            }
        };

        let node = If { cond, body, else_ };
        let kind = if tag.value == "ifAsync" {
            NodeKind::IfAsync(node)
        } else {
            NodeKind::If(node)
        };
        Ok(Node::new(tag.line, tag.column, kind))
    }

    fn parse_for(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "for")?;
        let end = match tag.value.as_str() {
            "asyncEach" => "endeach",
            "asyncAll" => "endall",
            _ => "endfor",
        };

        let first = self.parse_symbol("loop variable")?;
        let name = if self.peek_kind(0)? == Some(TokenKind::Comma) {
            let mut names = vec![first];
            while self.skip(TokenKind::Comma)? {
                names.push(self.parse_symbol("loop variable")?);
            }
            Node::new(tag.line, tag.column, NodeKind::Array(Children { children: names }))
        } else {
            first
        };

        if !self.skip_symbol("in")? {
            return Err(self.error_here("expected \"in\" keyword for loop")?);
        }
        let arr = self.parse_expression()?;
        self.advance_after_block_end(&tag.value)?;

        let (body, closing) = self.parse_body(&tag, &["else", end])?;
        let else_ = if closing == "else" {
            self.finish_end_tag("else")?;
            let (else_body, _) = self.parse_body(&tag, &[end])?;
            Some(else_body)
        } else {
            None
        };
        self.finish_end_tag(end)?;

        let node = For { name, arr, body, else_ };
        let kind = match tag.value.as_str() {
            "asyncEach" => NodeKind::AsyncEach(node),
            "asyncAll" => NodeKind::AsyncAll(node),
            _ => NodeKind::For(node),
        };
        Ok(Node::new(tag.line, tag.column, kind))
    }

    fn parse_block(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "block")?;
        let name = self.expect(TokenKind::Symbol, "block name")?.value;
        self.advance_after_block_end("block")?;

        let (body, _) = self.parse_body(&tag, &["endblock"])?;
        self.expect(TokenKind::Symbol, "endblock")?;
        self.skip_symbol(&name)?;
        self.advance_after_block_end("endblock")?;

        Ok(Node::new(tag.line, tag.column, NodeKind::Block(Block { name, body })))
    }

    fn parse_extends(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "extends")?;
        let template = self.parse_expression()?;
        self.advance_after_block_end("extends")?;
        Ok(Node::new(tag.line, tag.column, NodeKind::Extends(Extends { template })))
    }

    fn parse_include(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "include")?;
        let template = self.parse_expression()?;
        let mut ignore_missing = false;
        if self.skip_symbol("ignore")? {
            if !self.skip_symbol("missing")? {
                return Err(self.error_here("expected \"missing\" after \"ignore\"")?);
            }
            ignore_missing = true;
        }
        self.advance_after_block_end("include")?;
        Ok(Node::new(
            tag.line,
            tag.column,
            NodeKind::Include(Include { template, ignore_missing }),
        ))
    }

    fn parse_set(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "set")?;
        let mut targets = vec![self.parse_symbol("variable name")?];
        while self.skip(TokenKind::Comma)? {
            targets.push(self.parse_symbol("variable name")?);
        }

        let set = if self.skip_value(TokenKind::Operator, "=")? {
            let value = self.parse_expression()?;
            self.advance_after_block_end("set")?;
            Set { targets, value: Some(value), body: None }
        } else if self.peek_kind(0)? == Some(TokenKind::BlockEnd) {
            self.advance_after_block_end("set")?;
            let (body, _) = self.parse_body(&tag, &["endset"])?;
            self.finish_end_tag("endset")?;
            let capture = Node::new(tag.line, tag.column, NodeKind::Capture(Capture { body }));
            Set { targets, value: None, body: Some(capture) }
        } else {
            return Err(self.error_here("expected = or block end in set tag")?);
        };
        Ok(Node::new(tag.line, tag.column, NodeKind::Set(set)))
    }

    fn parse_macro(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "macro")?;
        let name = self.expect(TokenKind::Symbol, "macro name")?.value;
        let args = self.parse_signature()?;
        check_macro_args(&args)?;
        self.advance_after_block_end("macro")?;

        let (body, _) = self.parse_body(&tag, &["endmacro"])?;
        self.finish_end_tag("endmacro")?;
        Ok(Node::new(tag.line, tag.column, NodeKind::Macro(Macro { name, args, body })))
    }

    /// `{% call(args) macro(...) %}body{% endcall %}` passes the body to the
    /// macro as a `caller` keyword argument.
    fn parse_call(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "call")?;
        let caller_args = if self.peek_kind(0)? == Some(TokenKind::LeftParen) {
            let args = self.parse_signature()?;
            check_macro_args(&args)?;
            args
        } else {
            Node::list(tag.line, tag.column, Vec::new())
        };

        let call = self.parse_primary(false)?;
        let funcall = match &call.kind {
            NodeKind::FunCall(funcall) => funcall.clone(),
            _ => return Err(error_at("expected a macro call after \"call\"", &tag)),
        };
        self.advance_after_block_end("call")?;

        let (body, _) = self.parse_body(&tag, &["endcall"])?;
        self.finish_end_tag("endcall")?;

        let caller = Node::new(
            tag.line,
            tag.column,
            NodeKind::Caller(Macro {
                name: "caller".to_string(),
                args: caller_args,
                body,
            }),
        );
        let pair = Node::new(
            tag.line,
            tag.column,
            NodeKind::Pair(Pair {
                key: Node::symbol(tag.line, tag.column, "caller"),
                value: caller,
            }),
        );

        let mut args = funcall.args.children().to_vec();
        match args.last() {
            Some(last) if matches!(last.kind, NodeKind::KeywordArgs(_)) => {
                let mut kwargs = last.children().to_vec();
                kwargs.push(pair);
                let replaced = last.with_kind(NodeKind::KeywordArgs(Children { children: kwargs }));
                let n = args.len();
                args[n - 1] = replaced;
            }
            _ => args.push(Node::new(
                tag.line,
                tag.column,
                NodeKind::KeywordArgs(Children { children: vec![pair] }),
            )),
        }

        let call = call.with_kind(NodeKind::FunCall(FunCall {
            name: funcall.name,
            args: Node::list(funcall.args.line, funcall.args.column, args),
        }));
        Ok(token_output(&tag, call))
    }

    fn parse_with_context(&mut self) -> Result<Option<bool>> {
        let with = if self.peek_is(0, TokenKind::Symbol, "with")? {
            true
        } else if self.peek_is(0, TokenKind::Symbol, "without")? {
            false
        } else {
            return Ok(None);
        };
        self.next_token()?;
        if !self.skip_symbol("context")? {
            return Err(self.error_here("expected \"context\" after with/without")?);
        }
        Ok(Some(with))
    }

    fn parse_import(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "import")?;
        let template = self.parse_expression()?;
        if !self.skip_symbol("as")? {
            return Err(self.error_here("expected \"as\" keyword in import")?);
        }
        let target = self.expect(TokenKind::Symbol, "import target name")?.value;
        let with_context = self.parse_with_context()?.unwrap_or(false);
        self.advance_after_block_end("import")?;
        Ok(Node::new(
            tag.line,
            tag.column,
            NodeKind::Import(Import { template, target, with_context }),
        ))
    }

    fn parse_from(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "from")?;
        let template = self.parse_expression()?;
        if !self.skip_symbol("import")? {
            return Err(self.error_here("expected \"import\" keyword in from tag")?);
        }

        let mut names = Vec::new();
        let mut with_context = None;
        loop {
            if self.peek_kind(0)? == Some(TokenKind::BlockEnd) {
                if names.is_empty() {
                    return Err(self.error_here("expected at least one import name")?);
                }
                self.advance_after_block_end("from")?;
                break;
            }
            if !names.is_empty() {
                self.expect(TokenKind::Comma, "`,` between import names")?;
            }
            let name = self.expect(TokenKind::Symbol, "name to import")?;
            if name.value.starts_with('_') {
                return Err(error_at("names starting with an underscore cannot be imported", &name));
            }
            let alias = if self.skip_symbol("as")? {
                Some(self.expect(TokenKind::Symbol, "import alias")?.value)
            } else {
                None
            };
            names.push(ImportName { name: name.value, alias });
            if let Some(with) = self.parse_with_context()? {
                with_context = Some(with);
            }
        }

        Ok(Node::new(
            tag.line,
            tag.column,
            NodeKind::FromImport(FromImport {
                template,
                names,
                with_context: with_context.unwrap_or(false),
            }),
        ))
    }

    /// `{% filter name(args) %}body{% endfilter %}` applies the filter to the
    /// captured body.
    fn parse_filter_statement(&mut self) -> Result<NodeRef> {
        let tag = self.expect(TokenKind::Symbol, "filter")?;
        let name = self.parse_filter_name()?;
        let extra = if self.peek_kind(0)? == Some(TokenKind::LeftParen) {
            self.parse_signature()?.children().to_vec()
        } else {
            Vec::new()
        };
        self.advance_after_block_end("filter")?;

        let (body, _) = self.parse_body(&tag, &["endfilter"])?;
        self.finish_end_tag("endfilter")?;

        let capture = Node::new(tag.line, tag.column, NodeKind::Capture(Capture { body }));
        let mut args = vec![capture];
        args.extend(extra);
        let filter = Node::new(
            tag.line,
            tag.column,
            NodeKind::Filter(Filter {
                name,
                args: Node::list(tag.line, tag.column, args),
            }),
        );
        Ok(token_output(&tag, filter))
    }

    fn error_here(&mut self, message: &str) -> Result<TemplateError> {
        Ok(match self.peek(0)? {
            Some(t) => error_at(format!("{}, got {}", message, describe(t)), t),
            None => self.unexpected_eof(message),
        })
    }

    fn parse_symbol(&mut self, what: &str) -> Result<NodeRef> {
        let token = self.expect(TokenKind::Symbol, what)?;
        Ok(Node::symbol(token.line, token.column, token.value))
    }

    fn parse_filter_name(&mut self) -> Result<String> {
        let mut name = self.expect(TokenKind::Symbol, "filter name")?.value;
        while self.peek_is(0, TokenKind::Operator, ".")?
            && self.peek_kind(1)? == Some(TokenKind::Symbol)
        {
            self.next_token()?; // .
            if let Some(part) = self.next_token()? {
                name.push('.');
                name.push_str(&part.value);
            }
        }
        Ok(name)
    }

    // Expressions, lowest precedence first

    pub fn parse_expression(&mut self) -> Result<NodeRef> {
        self.parse_inline_if()
    }

    fn parse_inline_if(&mut self) -> Result<NodeRef> {
        let body = self.parse_or()?;
        if !self.skip_symbol("if")? {
            return Ok(body);
        }
        let cond = self.parse_or()?;
        let else_ = if self.skip_symbol("else")? {
            Some(self.parse_inline_if()?)
        } else {
            None
        };
        Ok(body.with_kind(NodeKind::InlineIf(InlineIf {
            cond,
            body: Arc::clone(&body),
            else_,
        })))
    }

    fn parse_or(&mut self) -> Result<NodeRef> {
        let mut lhs = self.parse_and()?;
        while self.skip_symbol("or")? {
            let rhs = self.parse_and()?;
            lhs = binary(lhs, rhs, NodeKind::Or);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<NodeRef> {
        let mut lhs = self.parse_not()?;
        while self.skip_symbol("and")? {
            let rhs = self.parse_not()?;
            lhs = binary(lhs, rhs, NodeKind::And);
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<NodeRef> {
        let line = self.peek(0)?.map(|t| (t.line, t.column));
        if self.skip_symbol("not")? {
            let target = self.parse_not()?;
            let (line, column) = line.unwrap_or((target.line, target.column));
            return Ok(Node::new(line, column, NodeKind::Not(UnaryOp { target })));
        }
        self.parse_compare()
    }

    /// Comparison operators, `in`, `not in`, `is` and `is not` form one
    /// left-associative chain. `in` and `is` close the comparisons gathered
    /// so far and take the result as their left operand.
    fn parse_compare(&mut self) -> Result<NodeRef> {
        let mut expr = self.parse_additive()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek(0)? {
                Some(t) if t.kind == TokenKind::Operator => CompareOp::from_operator(&t.value),
                _ => None,
            };
            if let Some(op) = op {
                let token = self.expect(TokenKind::Operator, "comparison operator")?;
                let operand = self.parse_additive()?;
                ops.push(Node::new(
                    token.line,
                    token.column,
                    NodeKind::CompareOperand(CompareOperand { expr: operand, op }),
                ));
                continue;
            }

            let not_in = self.peek_is(0, TokenKind::Symbol, "not")?
                && self.peek_is(1, TokenKind::Symbol, "in")?;
            if not_in || self.peek_is(0, TokenKind::Symbol, "in")? {
                if not_in {
                    self.next_token()?; // not
                }
                self.next_token()?; // in
                let lhs = fold_compare(expr, std::mem::take(&mut ops));
                let rhs = self.parse_additive()?;
                expr = negate_if(binary(lhs, rhs, NodeKind::In), not_in);
            } else if self.skip_symbol("is")? {
                let negate = self.skip_symbol("not")?;
                let lhs = fold_compare(expr, std::mem::take(&mut ops));
                let rhs = self.parse_additive()?;
                expr = negate_if(binary(lhs, rhs, NodeKind::Is), negate);
            } else {
                break;
            }
        }
        Ok(fold_compare(expr, ops))
    }

    fn parse_additive(&mut self) -> Result<NodeRef> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let kind: fn(BinOp) -> NodeKind = if self.skip_value(TokenKind::Operator, "+")? {
                NodeKind::Add
            } else if self.skip_value(TokenKind::Operator, "-")? {
                NodeKind::Sub
            } else if self.skip(TokenKind::Tilde)? {
                NodeKind::Concat
            } else {
                break;
            };
            let rhs = self.parse_multiplicative()?;
            lhs = binary(lhs, rhs, kind);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<NodeRef> {
        let mut lhs = self.parse_unary()?;
        loop {
            let kind: fn(BinOp) -> NodeKind = if self.skip_value(TokenKind::Operator, "*")? {
                NodeKind::Mul
            } else if self.skip_value(TokenKind::Operator, "//")? {
                NodeKind::FloorDiv
            } else if self.skip_value(TokenKind::Operator, "/")? {
                NodeKind::Div
            } else if self.skip_value(TokenKind::Operator, "%")? {
                NodeKind::Mod
            } else {
                break;
            };
            let rhs = self.parse_unary()?;
            lhs = binary(lhs, rhs, kind);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<NodeRef> {
        let kind: fn(UnaryOp) -> NodeKind = match self.peek(0)? {
            Some(t) if t.is(TokenKind::Operator, "-") => NodeKind::Neg,
            Some(t) if t.is(TokenKind::Operator, "+") => NodeKind::Pos,
            _ => return self.parse_power(),
        };
        let token = self.expect(TokenKind::Operator, "unary operator")?;
        let target = self.parse_unary()?;
        Ok(Node::new(token.line, token.column, kind(UnaryOp { target })))
    }

    fn parse_power(&mut self) -> Result<NodeRef> {
        let base = self.parse_primary(false)?;
        if self.skip_value(TokenKind::Operator, "**")? {
            // Right-associative; the exponent may carry its own sign
            let exponent = self.parse_unary()?;
            return Ok(binary(base, exponent, NodeKind::Pow));
        }
        Ok(base)
    }

    /// A literal, symbol or aggregate, followed by calls, subscripts,
    /// attribute lookups and filters unless `no_postfix` is set.
    pub fn parse_primary(&mut self, no_postfix: bool) -> Result<NodeRef> {
        let token = match self.next_token()? {
            Some(t) => t,
            None => return Err(self.unexpected_eof("expression")),
        };
        let literal = |value| {
            Node::new(token.line, token.column, NodeKind::Literal(Literal { value }))
        };

        let node = match token.kind {
            TokenKind::String => literal(LiteralValue::String(token.value.clone())),
            TokenKind::Int => match token.value.parse::<i64>() {
                Ok(n) => literal(LiteralValue::Int(n)),
                Err(_) => return Err(error_at("integer literal out of range", &token)),
            },
            TokenKind::Float => match token.value.parse::<f64>() {
                Ok(n) => literal(LiteralValue::Float(n)),
                Err(_) => return Err(error_at("invalid number literal", &token)),
            },
            TokenKind::Boolean => literal(LiteralValue::Bool(token.value == "true")),
            TokenKind::None => literal(LiteralValue::None),
            TokenKind::Regex => match token.regex_parts() {
                Some((pattern, flags)) => literal(LiteralValue::Regex {
                    pattern: pattern.to_string(),
                    flags: flags.to_string(),
                }),
                None => return Err(error_at("malformed regular expression", &token)),
            },
            TokenKind::Symbol => Node::symbol(token.line, token.column, token.value.clone()),
            TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftCurly => {
                self.parse_aggregate(&token)?
            }
            _ => return Err(error_at(format!("unexpected token: {}", describe(&token)), &token)),
        };

        if no_postfix {
            return Ok(node);
        }
        self.parse_postfix(node)
    }

    fn parse_aggregate(&mut self, open: &Token) -> Result<NodeRef> {
        let close = match open.kind {
            TokenKind::LeftParen => TokenKind::RightParen,
            TokenKind::LeftBracket => TokenKind::RightBracket,
            _ => TokenKind::RightCurly,
        };
        let is_dict = open.kind == TokenKind::LeftCurly;

        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            if self.skip(close)? {
                break;
            }
            if !items.is_empty() {
                self.expect(TokenKind::Comma, "`,` between items")?;
                if self.skip(close)? {
                    trailing_comma = true;
                    break;
                }
            }
            if is_dict {
                // Symbol keys are read as plain names, never looked up
                let key = self.parse_primary(true)?;
                let key = match &key.kind {
                    NodeKind::Symbol(s) => Node::string(key.line, key.column, s.name.clone()),
                    _ => key,
                };
                self.expect(TokenKind::Colon, "`:` after dict key")?;
                let value = self.parse_expression()?;
                items.push(key.with_kind(NodeKind::Pair(Pair { key: key.clone(), value })));
            } else {
                items.push(self.parse_expression()?);
            }
        }

        let node = match open.kind {
            TokenKind::LeftParen if items.len() == 1 && !trailing_comma => return Ok(items.remove(0)),
            TokenKind::LeftCurly => NodeKind::Dict(Children { children: items }),
            _ => NodeKind::Array(Children { children: items }),
        };
        Ok(Node::new(open.line, open.column, node))
    }

    fn parse_postfix(&mut self, mut node: NodeRef) -> Result<NodeRef> {
        loop {
            let dot = self.peek_is(0, TokenKind::Operator, ".")?;
            match self.peek_kind(0)? {
                Some(TokenKind::LeftParen) => {
                    let args = self.parse_signature()?;
                    node = node.with_kind(NodeKind::FunCall(FunCall { name: node.clone(), args }));
                }
                Some(TokenKind::LeftBracket) => {
                    self.next_token()?; // [
                    let val = self.parse_subscript()?;
                    node = node.with_kind(NodeKind::LookupVal(LookupVal { target: node.clone(), val }));
                }
                Some(TokenKind::Operator) if dot => {
                    self.next_token()?; // .
                    let token = match self.next_token()? {
                        Some(t) => t,
                        None => return Err(self.unexpected_eof("name as lookup value")),
                    };
                    let val = match token.kind {
                        TokenKind::Symbol => Node::string(token.line, token.column, token.value),
                        TokenKind::Int => match token.value.parse::<i64>() {
                            Ok(n) => Node::new(
                                token.line,
                                token.column,
                                NodeKind::Literal(Literal { value: LiteralValue::Int(n) }),
                            ),
                            Err(_) => return Err(error_at("integer literal out of range", &token)),
                        },
                        _ => {
                            return Err(error_at(
                                format!("expected name as lookup value, got {}", describe(&token)),
                                &token,
                            ))
                        }
                    };
                    node = node.with_kind(NodeKind::LookupVal(LookupVal { target: node.clone(), val }));
                }
                Some(TokenKind::Pipe) => {
                    self.next_token()?; // |
                    let name = self.parse_filter_name()?;
                    let mut args = vec![node.clone()];
                    if self.peek_kind(0)? == Some(TokenKind::LeftParen) {
                        args.extend(self.parse_signature()?.children().iter().cloned());
                    }
                    node = node.with_kind(NodeKind::Filter(Filter {
                        name,
                        args: Node::list(node.line, node.column, args),
                    }));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    /// Contents of `[...]` after the opening bracket: an index or a slice.
    fn parse_subscript(&mut self) -> Result<NodeRef> {
        let (line, column) = (self.lexer.line(), self.lexer.column());
        let start = if self.peek_kind(0)? == Some(TokenKind::Colon) {
            None
        } else {
            Some(self.parse_expression()?)
        };

        if !self.skip(TokenKind::Colon)? {
            self.expect(TokenKind::RightBracket, "`]`")?;
            return match start {
                Some(index) => Ok(index),
                None => Err(TemplateError::syntax("expected index expression", line, column)),
            };
        }

        let stop = match self.peek_kind(0)? {
            Some(TokenKind::Colon) | Some(TokenKind::RightBracket) => None,
            _ => Some(self.parse_expression()?),
        };
        let step = if self.skip(TokenKind::Colon)? && self.peek_kind(0)? != Some(TokenKind::RightBracket) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect(TokenKind::RightBracket, "`]`")?;

        let (line, column) = start.as_ref().map(|n| (n.line, n.column)).unwrap_or((line, column));
        Ok(Node::new(line, column, NodeKind::Slice(Slice { start, stop, step })))
    }

    /// `(a, b, name=value)`: a `NodeList` of positional arguments followed by
    /// one `KeywordArgs` node when keywords are present.
    pub fn parse_signature(&mut self) -> Result<NodeRef> {
        let open = self.expect(TokenKind::LeftParen, "`(`")?;
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        loop {
            if self.skip(TokenKind::RightParen)? {
                break;
            }
            if !args.is_empty() || !kwargs.is_empty() {
                self.expect(TokenKind::Comma, "`,` between arguments")?;
                if self.skip(TokenKind::RightParen)? {
                    break;
                }
            }

            let arg = self.parse_expression()?;
            if self.skip_value(TokenKind::Operator, "=")? {
                if arg.as_symbol().is_none() {
                    return Err(TemplateError::syntax(
                        "keyword argument name must be a plain name",
                        arg.line,
                        arg.column,
                    ));
                }
                let value = self.parse_expression()?;
                kwargs.push(arg.with_kind(NodeKind::Pair(Pair { key: arg.clone(), value })));
            } else if !kwargs.is_empty() {
                return Err(TemplateError::syntax(
                    "positional argument follows keyword argument",
                    arg.line,
                    arg.column,
                ));
            } else {
                args.push(arg);
            }
        }

        if !kwargs.is_empty() {
            args.push(Node::new(
                open.line,
                open.column,
                NodeKind::KeywordArgs(Children { children: kwargs }),
            ));
        }
        Ok(Node::list(open.line, open.column, args))
    }
}

fn token_output(token: &Token, child: NodeRef) -> NodeRef {
    Node::new(token.line, token.column, NodeKind::Output(Children { children: vec![child] }))
}

fn binary(lhs: NodeRef, rhs: NodeRef, kind: fn(BinOp) -> NodeKind) -> NodeRef {
    lhs.with_kind(kind(BinOp { left: lhs.clone(), right: rhs }))
}

fn fold_compare(expr: NodeRef, ops: Vec<NodeRef>) -> NodeRef {
    if ops.is_empty() {
        return expr;
    }
    expr.with_kind(NodeKind::Compare(Compare { expr: expr.clone(), ops }))
}

fn negate_if(node: NodeRef, negate: bool) -> NodeRef {
    if !negate {
        return node;
    }
    node.with_kind(NodeKind::Not(UnaryOp { target: node.clone() }))
}

fn check_macro_args(args: &NodeRef) -> Result<()> {
    for arg in args.children() {
        match &arg.kind {
            NodeKind::Symbol(_) | NodeKind::KeywordArgs(_) => {}
            _ => {
                return Err(TemplateError::syntax(
                    "macro parameters must be plain names or name=default",
                    arg.line,
                    arg.column,
                ))
            }
        }
    }
    Ok(())
}

/// Parse `source` with the given options and tag extensions.
pub fn parse_template(
    source: &str,
    config: &Config,
    extensions: &[Arc<dyn Extension>],
) -> Result<NodeRef> {
    Parser::with_config(source, config, extensions).parse()
}
