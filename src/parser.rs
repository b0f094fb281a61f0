use std::collections::VecDeque;
use std::rc::Rc;

use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::{Syntax, Tokenizer};
use crate::token::{Span, Token, TokenKind};
use crate::value::Value;

/// Recursive-descent parser with one-token lookahead over a lazy
/// tokenizer. Comment tokens are skipped while buffering; line
/// statements are normalized to block tokens so every statement parse
/// path sees one token shape.
pub struct Parser<'a> {
    tokenizer: Tokenizer<'a>,
    buffer: VecDeque<Token>,
    path: Option<&'a str>,
    last: Token,
    open_blocks: Vec<BlockFrame>,
    block_names: Vec<String>,
    root_emitted: bool,
}

struct BlockFrame {
    tag: &'static str,
    end_tags: &'static [&'static str],
}

const RESERVED_NAMES: &[&str] = &["and", "or", "not", "if", "else", "in", "is", "recursive"];

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, syntax: &'a Syntax, path: Option<&'a str>) -> Parser<'a> {
        Parser {
            tokenizer: Tokenizer::new(source, syntax, path),
            buffer: VecDeque::new(),
            path,
            last: Token::new(TokenKind::Initial, Span::new(1, 0, 0)),
            open_blocks: Vec::new(),
            block_names: Vec::new(),
            root_emitted: false,
        }
    }

    /// Parses the whole template into its top-level statement list.
    pub fn parse(&mut self) -> Result<Vec<Stmt>> {
        self.subparse(&[])
    }

    fn fill(&mut self, n: usize) -> Result<()> {
        while self.buffer.len() <= n {
            let token = self.tokenizer.next_token()?;
            match token.kind {
                TokenKind::CommentStart | TokenKind::CommentEnd | TokenKind::LineComment => {}
                TokenKind::LineStatementStart => self
                    .buffer
                    .push_back(Token::new(TokenKind::BlockStart, token.span)),
                TokenKind::LineStatementEnd => self
                    .buffer
                    .push_back(Token::new(TokenKind::BlockEnd, token.span)),
                _ => self.buffer.push_back(token),
            }
        }
        Ok(())
    }

    fn peek(&mut self, n: usize) -> Result<&Token> {
        self.fill(n)?;
        Ok(&self.buffer[n])
    }

    fn next(&mut self) -> Result<Token> {
        self.fill(0)?;
        let token = self.buffer.pop_front().expect("buffer filled");
        self.last = token.clone();
        Ok(token)
    }

    fn syntax_error(&self, message: impl Into<String>, span: Span) -> Error {
        Error::syntax(message, span, self.path)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        let token = self.next()?;
        if token.kind == kind {
            Ok(token)
        } else {
            Err(self.syntax_error(
                format!(
                    "unexpected {}, expected {}",
                    token.kind.describe(),
                    kind.describe()
                ),
                token.span,
            ))
        }
    }

    fn expect_name(&mut self) -> Result<(String, Span)> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Name(name) => Ok((name, token.span)),
            other => Err(self.syntax_error(
                format!("unexpected {}, expected a name", other.describe()),
                token.span,
            )),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        let token = self.next()?;
        match &token.kind {
            TokenKind::Name(name) if name == keyword => Ok(()),
            other => Err(self.syntax_error(
                format!("unexpected {}, expected '{keyword}'", other.describe()),
                token.span,
            )),
        }
    }

    fn peek_keyword(&mut self, keyword: &str) -> Result<bool> {
        Ok(matches!(&self.peek(0)?.kind, TokenKind::Name(name) if name == keyword))
    }

    fn skip_keyword(&mut self, keyword: &str) -> Result<bool> {
        if self.peek_keyword(keyword)? {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn skip_token(&mut self, kind: &TokenKind) -> Result<bool> {
        if &self.peek(0)?.kind == kind {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The verbatim unknown-tag / unexpected-eof diagnostic, naming the
    /// innermost unclosed block and the tags that would close it.
    fn tag_error(&self, base: impl Into<String>, span: Span) -> Error {
        let mut message = base.into();
        if let Some(frame) = self.open_blocks.last() {
            let expected = frame
                .end_tags
                .iter()
                .map(|t| format!("'{t}'"))
                .collect::<Vec<_>>()
                .join(" or ");
            message.push_str(&format!(
                " Jinja was looking for the following tags: {expected}. \
                 The innermost block that needs to be closed is '{}'.",
                frame.tag
            ));
        }
        self.syntax_error(message, span)
    }

    /// Rejects `foo-bar` written where a single identifier is required.
    fn check_hyphenated(&mut self, span: Span) -> Result<()> {
        let next = self.peek(0)?;
        if next.kind == TokenKind::Sub && next.span.start == span.end {
            let span = next.span;
            return Err(self.syntax_error(
                "names must be valid identifiers and may not contain hyphens, \
                 use an underscore instead",
                span,
            ));
        }
        Ok(())
    }

    fn parse_assign_name(&mut self) -> Result<String> {
        let (name, span) = self.expect_name()?;
        self.check_hyphenated(span)?;
        Ok(name)
    }

    /// Comma-separated assignment targets, e.g. of `for` or `set`.
    fn parse_target_names(&mut self, forbid_loop: bool) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        loop {
            let (name, span) = self.expect_name()?;
            self.check_hyphenated(span)?;
            if forbid_loop && name == "loop" {
                return Err(Error::assertion(
                    "cannot assign to the special 'loop' variable in a for-loop target",
                    span,
                    self.path,
                ));
            }
            targets.push(name);
            if !self.skip_token(&TokenKind::Comma)? {
                return Ok(targets);
            }
        }
    }

    /// Parses statements until one of `end_tags` is seen at a block
    /// start. Leaves the closing tag name unconsumed; an empty set means
    /// "until end of template".
    fn subparse(&mut self, end_tags: &'static [&'static str]) -> Result<Vec<Stmt>> {
        let is_root = end_tags.is_empty();
        let mut rv: Vec<Stmt> = Vec::new();
        let mut output: Vec<Expr> = Vec::new();

        macro_rules! flush {
            () => {
                if !output.is_empty() {
                    rv.push(Stmt::Output(std::mem::take(&mut output)));
                }
            };
        }

        loop {
            let token = self.peek(0)?;
            let span = token.span;
            match &token.kind {
                TokenKind::Eof => {
                    if is_root {
                        flush!();
                        return Ok(rv);
                    }
                    return Err(self.tag_error("Unexpected end of template.", span));
                }
                TokenKind::Data(_) => {
                    let token = self.next()?;
                    if let TokenKind::Data(text) = token.kind {
                        if is_root {
                            self.root_emitted = true;
                        }
                        output.push(Expr::TemplateData(text));
                    }
                }
                TokenKind::VariableStart => {
                    self.next()?;
                    if is_root {
                        self.root_emitted = true;
                    }
                    let expr = self.parse_tuple(true, &[])?;
                    self.expect(TokenKind::VariableEnd)?;
                    output.push(expr);
                }
                TokenKind::BlockStart => {
                    flush!();
                    self.next()?;
                    let token = self.peek(0)?;
                    let span = token.span;
                    match &token.kind {
                        TokenKind::Name(name) if end_tags.contains(&name.as_str()) => {
                            return Ok(rv);
                        }
                        TokenKind::Name(_) => {
                            let stmt = self.parse_statement(is_root)?;
                            if is_root {
                                self.root_emitted = true;
                            }
                            rv.push(stmt);
                        }
                        TokenKind::Eof => {
                            return Err(self.tag_error("Unexpected end of template.", span));
                        }
                        other => {
                            let message =
                                format!("unexpected {}, expected a tag name", other.describe());
                            return Err(self.syntax_error(message, span));
                        }
                    }
                }
                other => {
                    let message = format!("unexpected {}", other.describe());
                    return Err(self.syntax_error(message, span));
                }
            }
        }
    }

    fn parse_statement(&mut self, at_root: bool) -> Result<Stmt> {
        let (tag, span) = self.expect_name()?;
        match tag.as_str() {
            "for" => self.parse_for(),
            "if" => self.parse_if(),
            "set" => self.parse_set(),
            "block" => self.parse_block(),
            "extends" => self.parse_extends(at_root, span),
            "include" => self.parse_include(),
            "import" => self.parse_import(),
            "from" => self.parse_from_import(),
            "macro" => self.parse_macro(),
            "call" => self.parse_call_block(),
            "filter" => self.parse_filter_block(),
            "with" => self.parse_with(),
            "do" => self.parse_do(),
            "autoescape" => self.parse_autoescape(),
            _ => Err(self.tag_error(format!("Encountered unknown tag '{tag}'."), span)),
        }
    }

    fn parse_body(
        &mut self,
        tag: &'static str,
        end_tags: &'static [&'static str],
    ) -> Result<Vec<Stmt>> {
        self.open_blocks.push(BlockFrame { tag, end_tags });
        let body = self.subparse(end_tags)?;
        Ok(body)
    }

    fn close_body(&mut self) -> Result<()> {
        self.open_blocks.pop();
        self.expect(TokenKind::BlockEnd)?;
        Ok(())
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        let targets = self.parse_target_names(true)?;
        self.expect_keyword("in")?;
        let iter = self.parse_tuple(false, &["if", "recursive"])?;
        let filter = if self.skip_keyword("if")? {
            Some(self.parse_expression(true)?)
        } else {
            None
        };
        let recursive = self.skip_keyword("recursive")?;
        self.expect(TokenKind::BlockEnd)?;

        let body = self.parse_body("for", &["endfor", "else"])?;
        let (tag, _) = self.expect_name()?;
        let else_body = if tag == "else" {
            self.expect(TokenKind::BlockEnd)?;
            self.open_blocks
                .last_mut()
                .expect("for frame open")
                .end_tags = &["endfor"];
            let else_body = self.subparse(&["endfor"])?;
            self.expect_name()?;
            else_body
        } else {
            Vec::new()
        };
        self.close_body()?;

        Ok(Stmt::For {
            targets,
            iter,
            body: Rc::new(body),
            else_body,
            filter,
            recursive,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let mut arms = Vec::new();
        let mut else_body = Vec::new();
        self.open_blocks.push(BlockFrame {
            tag: "if",
            end_tags: &["elif", "else", "endif"],
        });
        loop {
            let cond = self.parse_expression(false)?;
            self.expect(TokenKind::BlockEnd)?;
            let body = self.subparse(&["elif", "else", "endif"])?;
            arms.push((cond, body));
            let (tag, _) = self.expect_name()?;
            match tag.as_str() {
                "elif" => continue,
                "else" => {
                    self.expect(TokenKind::BlockEnd)?;
                    self.open_blocks.last_mut().expect("if frame open").end_tags = &["endif"];
                    else_body = self.subparse(&["endif"])?;
                    self.expect_name()?;
                    break;
                }
                _ => break, // endif
            }
        }
        self.close_body()?;
        Ok(Stmt::If { arms, else_body })
    }

    fn parse_set(&mut self) -> Result<Stmt> {
        let targets = self.parse_target_names(false)?;
        if self.skip_token(&TokenKind::Assign)? {
            let value = self.parse_tuple(true, &[])?;
            self.expect(TokenKind::BlockEnd)?;
            return Ok(Stmt::Set { targets, value });
        }

        // block form: {% set x | filters %}body{% endset %}
        if targets.len() != 1 {
            let span = self.last.span;
            return Err(self.syntax_error("block assignments take exactly one target", span));
        }
        let mut filters = Vec::new();
        while self.skip_token(&TokenKind::Pipe)? {
            filters.push(self.parse_filter_spec()?);
        }
        self.expect(TokenKind::BlockEnd)?;
        let body = self.parse_body("set", &["endset"])?;
        self.expect_name()?;
        self.close_body()?;
        Ok(Stmt::AssignBlock {
            target: targets.into_iter().next().expect("one target"),
            filters,
            body,
        })
    }

    fn parse_block(&mut self) -> Result<Stmt> {
        let (name, span) = self.expect_name()?;
        self.check_hyphenated(span)?;
        if self.block_names.iter().any(|n| n == &name) {
            return Err(self.syntax_error(format!("block '{name}' defined twice"), span));
        }
        self.block_names.push(name.clone());

        let mut scoped = false;
        let mut required = false;
        loop {
            if self.skip_keyword("scoped")? {
                scoped = true;
            } else if self.skip_keyword("required")? {
                required = true;
            } else {
                break;
            }
        }
        self.expect(TokenKind::BlockEnd)?;

        let body = self.parse_body("block", &["endblock"])?;
        self.expect_name()?;
        // optional repeated name: {% endblock sidebar %}
        let end_span = self.peek(0)?.span;
        let end_name = match &self.peek(0)?.kind {
            TokenKind::Name(n) => Some(n.clone()),
            _ => None,
        };
        if let Some(end_name) = end_name {
            if end_name != name {
                return Err(self.syntax_error(
                    format!("mismatching name in endblock tag: expected '{name}'"),
                    end_span,
                ));
            }
            self.next()?;
        }
        self.close_body()?;

        Ok(Stmt::Block(BlockDef {
            name,
            scoped,
            required,
            body: Rc::new(body),
        }))
    }

    fn parse_extends(&mut self, at_root: bool, span: Span) -> Result<Stmt> {
        // never promoted: anything before it, even literal text, is an error
        if !at_root || self.root_emitted || !self.open_blocks.is_empty() {
            return Err(
                self.syntax_error("'extends' must be the first tag in the template", span)
            );
        }
        let template = self.parse_expression(true)?;
        self.expect(TokenKind::BlockEnd)?;
        Ok(Stmt::Extends { template })
    }

    fn parse_include(&mut self) -> Result<Stmt> {
        let template = self.parse_expression(true)?;
        let ignore_missing = if self.skip_keyword("ignore")? {
            self.expect_keyword("missing")?;
            true
        } else {
            false
        };
        let with_context = self.parse_context_flag()?.unwrap_or(true);
        self.expect(TokenKind::BlockEnd)?;
        Ok(Stmt::Include {
            template,
            ignore_missing,
            with_context,
        })
    }

    fn parse_import(&mut self) -> Result<Stmt> {
        let template = self.parse_expression(true)?;
        self.expect_keyword("as")?;
        let alias = self.parse_assign_name()?;
        let with_context = self.parse_context_flag()?.unwrap_or(false);
        self.expect(TokenKind::BlockEnd)?;
        Ok(Stmt::Import {
            template,
            alias,
            with_context,
        })
    }

    fn parse_from_import(&mut self) -> Result<Stmt> {
        let template = self.parse_expression(true)?;
        self.expect_keyword("import")?;
        let mut names = Vec::new();
        loop {
            if (self.peek_keyword("with")? || self.peek_keyword("without")?)
                && matches!(&self.peek(1)?.kind, TokenKind::Name(n) if n == "context")
            {
                break;
            }
            let name = self.parse_assign_name()?;
            let alias = if self.skip_keyword("as")? {
                Some(self.parse_assign_name()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.skip_token(&TokenKind::Comma)? {
                break;
            }
        }
        if names.is_empty() {
            let span = self.last.span;
            return Err(self.syntax_error("expected at least one name to import", span));
        }
        let with_context = self.parse_context_flag()?.unwrap_or(false);
        self.expect(TokenKind::BlockEnd)?;
        Ok(Stmt::FromImport {
            template,
            names,
            with_context,
        })
    }

    fn parse_context_flag(&mut self) -> Result<Option<bool>> {
        if self.skip_keyword("with")? {
            self.expect_keyword("context")?;
            Ok(Some(true))
        } else if self.skip_keyword("without")? {
            self.expect_keyword("context")?;
            Ok(Some(false))
        } else {
            Ok(None)
        }
    }

    fn parse_macro(&mut self) -> Result<Stmt> {
        let name = self.parse_assign_name()?;
        self.expect(TokenKind::LParen)?;
        let (args, defaults) = self.parse_signature()?;
        self.expect(TokenKind::BlockEnd)?;
        let body = self.parse_body("macro", &["endmacro"])?;
        self.expect_name()?;
        self.close_body()?;
        Ok(Stmt::Macro(MacroDecl {
            name,
            args,
            defaults,
            body: Rc::new(body),
        }))
    }

    /// `(a, b, c=1, d=2)` — defaults must trail.
    fn parse_signature(&mut self) -> Result<(Vec<String>, Vec<Expr>)> {
        let mut args = Vec::new();
        let mut defaults = Vec::new();
        loop {
            if self.skip_token(&TokenKind::RParen)? {
                return Ok((args, defaults));
            }
            if !args.is_empty() {
                self.expect(TokenKind::Comma)?;
                if self.skip_token(&TokenKind::RParen)? {
                    return Ok((args, defaults));
                }
            }
            let (name, span) = self.expect_name()?;
            self.check_hyphenated(span)?;
            if self.skip_token(&TokenKind::Assign)? {
                defaults.push(self.parse_expression(true)?);
            } else if !defaults.is_empty() {
                return Err(
                    self.syntax_error("non-default argument follows default argument", span)
                );
            }
            args.push(name);
        }
    }

    fn parse_call_block(&mut self) -> Result<Stmt> {
        let caller_args = if self.skip_token(&TokenKind::LParen)? {
            let (args, defaults) = self.parse_signature()?;
            if !defaults.is_empty() {
                let span = self.last.span;
                return Err(self.syntax_error("caller arguments take no defaults", span));
            }
            args
        } else {
            Vec::new()
        };
        let call = self.parse_postfix_expr()?;
        if !matches!(call, Expr::Call { .. }) {
            let span = self.last.span;
            return Err(self.syntax_error("expected a call to a macro", span));
        }
        self.expect(TokenKind::BlockEnd)?;
        let body = self.parse_body("call", &["endcall"])?;
        self.expect_name()?;
        self.close_body()?;
        Ok(Stmt::CallBlock {
            call,
            caller_args,
            body: Rc::new(body),
        })
    }

    fn parse_filter_block(&mut self) -> Result<Stmt> {
        let mut filters = vec![self.parse_filter_spec()?];
        while self.skip_token(&TokenKind::Pipe)? {
            filters.push(self.parse_filter_spec()?);
        }
        self.expect(TokenKind::BlockEnd)?;
        let body = self.parse_body("filter", &["endfilter"])?;
        self.expect_name()?;
        self.close_body()?;
        Ok(Stmt::FilterBlock { filters, body })
    }

    fn parse_with(&mut self) -> Result<Stmt> {
        let mut targets = Vec::new();
        let mut values = Vec::new();
        while !matches!(self.peek(0)?.kind, TokenKind::BlockEnd) {
            if !targets.is_empty() {
                self.expect(TokenKind::Comma)?;
            }
            targets.push(self.parse_assign_name()?);
            self.expect(TokenKind::Assign)?;
            values.push(self.parse_expression(true)?);
        }
        self.expect(TokenKind::BlockEnd)?;
        let body = self.parse_body("with", &["endwith"])?;
        self.expect_name()?;
        self.close_body()?;
        Ok(Stmt::With {
            targets,
            values,
            body,
        })
    }

    fn parse_do(&mut self) -> Result<Stmt> {
        let expr = self.parse_tuple(true, &[])?;
        self.expect(TokenKind::BlockEnd)?;
        Ok(Stmt::Do(expr))
    }

    fn parse_autoescape(&mut self) -> Result<Stmt> {
        let value = self.parse_expression(true)?;
        self.expect(TokenKind::BlockEnd)?;
        let body = self.parse_body("autoescape", &["endautoescape"])?;
        self.expect_name()?;
        self.close_body()?;
        Ok(Stmt::AutoEscape { value, body })
    }

    // ---- expressions ----

    /// Comma-separated expressions; a single expression without a comma
    /// stays itself, anything else becomes a `Tuple`.
    fn parse_tuple(&mut self, with_condexpr: bool, extra_end_keywords: &[&str]) -> Result<Expr> {
        let mut items = Vec::new();
        let mut is_tuple = false;
        loop {
            if !items.is_empty() {
                self.expect(TokenKind::Comma)?;
            }
            if self.tuple_ends(extra_end_keywords)? {
                break;
            }
            items.push(self.parse_expression(with_condexpr)?);
            if matches!(self.peek(0)?.kind, TokenKind::Comma) {
                is_tuple = true;
            } else {
                break;
            }
        }
        if !is_tuple {
            return match items.into_iter().next() {
                Some(expr) => Ok(expr),
                None => {
                    let span = self.peek(0)?.span;
                    Err(self.syntax_error("expected an expression", span))
                }
            };
        }
        Ok(Expr::Tuple(items))
    }

    fn tuple_ends(&mut self, extra_end_keywords: &[&str]) -> Result<bool> {
        Ok(match &self.peek(0)?.kind {
            TokenKind::VariableEnd
            | TokenKind::BlockEnd
            | TokenKind::RParen
            | TokenKind::Eof => true,
            TokenKind::Name(name) => extra_end_keywords.contains(&name.as_str()),
            _ => false,
        })
    }

    fn parse_expression(&mut self, with_condexpr: bool) -> Result<Expr> {
        if with_condexpr {
            self.parse_condexpr()
        } else {
            self.parse_or()
        }
    }

    /// `a if cond else b`; a missing else yields undefined at render time.
    fn parse_condexpr(&mut self) -> Result<Expr> {
        let mut expr = self.parse_or()?;
        while self.skip_keyword("if")? {
            let test = self.parse_or()?;
            let otherwise = if self.skip_keyword("else")? {
                Some(Box::new(self.parse_condexpr()?))
            } else {
                None
            };
            expr = Expr::Condition {
                test: Box::new(test),
                then: Box::new(expr),
                otherwise,
            };
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.skip_keyword("or")? {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.skip_keyword("and")? {
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek_keyword("not")?
            && !matches!(&self.peek(1)?.kind, TokenKind::Name(n) if n == "in")
        {
            self.next()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(self.parse_not()?),
            });
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let mut expr = self.parse_filtered()?;
        let mut ops: Vec<(CmpOp, Expr)> = Vec::new();
        loop {
            let op = match &self.peek(0)?.kind {
                TokenKind::Eq => CmpOp::Eq,
                TokenKind::Ne => CmpOp::Ne,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::Lteq => CmpOp::Lteq,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::Gteq => CmpOp::Gteq,
                TokenKind::Name(n) if n == "in" => CmpOp::In,
                TokenKind::Name(n) if n == "not" => {
                    if matches!(&self.peek(1)?.kind, TokenKind::Name(n) if n == "in") {
                        self.next()?;
                        CmpOp::NotIn
                    } else {
                        break;
                    }
                }
                TokenKind::Name(n) if n == "is" => {
                    self.next()?;
                    let finished = finish_compare(expr, &mut ops);
                    expr = self.parse_test(finished)?;
                    continue;
                }
                _ => break,
            };
            self.next()?;
            let right = self.parse_filtered()?;
            ops.push((op, right));
        }
        Ok(finish_compare(expr, &mut ops))
    }

    /// The tail of `x is [not] testname[(args)]`.
    fn parse_test(&mut self, operand: Expr) -> Result<Expr> {
        let negated = self.skip_keyword("not")?;
        let (name, _) = self.expect_name()?;
        let (args, kwargs) = if self.skip_token(&TokenKind::LParen)? {
            let (args, kwargs, var_arg, kw_arg) = self.parse_call_args()?;
            if var_arg.is_some() || kw_arg.is_some() {
                let span = self.last.span;
                return Err(self.syntax_error("tests take no '*' or '**' arguments", span));
            }
            (args, kwargs)
        } else if self.test_shorthand_arg_follows()? {
            // bare argument form: `x is divisibleby 3`
            (vec![self.parse_postfix_expr()?], Vec::new())
        } else {
            (Vec::new(), Vec::new())
        };
        let mut expr = Expr::Test {
            name,
            operand: Box::new(operand),
            args,
            kwargs,
        };
        if negated {
            expr = Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(expr),
            };
        }
        Ok(expr)
    }

    fn test_shorthand_arg_follows(&mut self) -> Result<bool> {
        Ok(match &self.peek(0)?.kind {
            TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Str(_) => true,
            TokenKind::Name(name) => !RESERVED_NAMES.contains(&name.as_str()),
            _ => false,
        })
    }

    fn parse_filtered(&mut self) -> Result<Expr> {
        let mut expr = self.parse_concat()?;
        while self.skip_token(&TokenKind::Pipe)? {
            let spec = self.parse_filter_spec()?;
            expr = Expr::Filter {
                name: spec.name,
                operand: Some(Box::new(expr)),
                args: spec.args,
                kwargs: spec.kwargs,
            };
        }
        Ok(expr)
    }

    fn parse_filter_spec(&mut self) -> Result<FilterSpec> {
        let (name, _) = self.expect_name()?;
        let (args, kwargs) = if self.skip_token(&TokenKind::LParen)? {
            let (args, kwargs, var_arg, kw_arg) = self.parse_call_args()?;
            if var_arg.is_some() || kw_arg.is_some() {
                let span = self.last.span;
                return Err(self.syntax_error("filters take no '*' or '**' arguments", span));
            }
            (args, kwargs)
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(FilterSpec { name, args, kwargs })
    }

    fn parse_concat(&mut self) -> Result<Expr> {
        let first = self.parse_math1()?;
        if !matches!(self.peek(0)?.kind, TokenKind::Tilde) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.skip_token(&TokenKind::Tilde)? {
            items.push(self.parse_math1()?);
        }
        Ok(Expr::Concat(items))
    }

    fn parse_math1(&mut self) -> Result<Expr> {
        let mut left = self.parse_math2()?;
        loop {
            let op = match self.peek(0)?.kind {
                TokenKind::Add => BinOp::Add,
                TokenKind::Sub => BinOp::Sub,
                _ => break,
            };
            self.next()?;
            let right = self.parse_math2()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_math2(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek(0)?.kind {
                TokenKind::Mul => BinOp::Mul,
                TokenKind::Div => BinOp::Div,
                TokenKind::FloorDiv => BinOp::FloorDiv,
                TokenKind::Mod => BinOp::Mod,
                _ => break,
            };
            self.next()?;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek(0)?.kind {
            TokenKind::Add => Some(UnaryOp::Pos),
            TokenKind::Sub => Some(UnaryOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            self.next()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(self.parse_unary()?),
            });
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> Result<Expr> {
        let mut left = self.parse_postfix_expr()?;
        while self.skip_token(&TokenKind::Pow)? {
            // right operand may carry a sign: 2 ** -1
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_postfix_expr(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek(0)?.kind {
                TokenKind::Dot => {
                    self.next()?;
                    let token = self.next()?;
                    expr = match token.kind {
                        TokenKind::Name(name) => Expr::Getattr {
                            target: Box::new(expr),
                            name,
                        },
                        TokenKind::Int(idx) => Expr::Getitem {
                            target: Box::new(expr),
                            key: Box::new(Expr::Const(Value::Int(idx))),
                        },
                        other => {
                            return Err(self.syntax_error(
                                format!("unexpected {} after '.'", other.describe()),
                                token.span,
                            ));
                        }
                    };
                }
                TokenKind::LBracket => {
                    self.next()?;
                    let key = self.parse_subscript()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::Getitem {
                        target: Box::new(expr),
                        key: Box::new(key),
                    };
                }
                TokenKind::LParen => {
                    self.next()?;
                    let (args, kwargs, var_arg, kw_arg) = self.parse_call_args()?;
                    expr = Expr::Call {
                        target: Box::new(expr),
                        args,
                        kwargs,
                        var_arg,
                        kw_arg,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// The inside of `[...]`: a plain key or a `start:stop:step` slice.
    fn parse_subscript(&mut self) -> Result<Expr> {
        let start = if matches!(self.peek(0)?.kind, TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expression(true)?))
        };
        if !matches!(self.peek(0)?.kind, TokenKind::Colon) {
            return match start {
                Some(key) => Ok(*key),
                None => {
                    let span = self.peek(0)?.span;
                    Err(self.syntax_error("expected a subscript expression", span))
                }
            };
        }
        self.next()?;
        let stop = if matches!(self.peek(0)?.kind, TokenKind::Colon | TokenKind::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_expression(true)?))
        };
        let step = if self.skip_token(&TokenKind::Colon)? {
            if matches!(self.peek(0)?.kind, TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expression(true)?))
            }
        } else {
            None
        };
        Ok(Expr::Slice { start, stop, step })
    }

    /// Call arguments after a consumed `(`, through the closing `)`.
    #[allow(clippy::type_complexity)]
    fn parse_call_args(
        &mut self,
    ) -> Result<(
        Vec<Expr>,
        Vec<(String, Expr)>,
        Option<Box<Expr>>,
        Option<Box<Expr>>,
    )> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        let mut var_arg = None;
        let mut kw_arg = None;
        loop {
            if self.skip_token(&TokenKind::RParen)? {
                return Ok((args, kwargs, var_arg, kw_arg));
            }
            if !(args.is_empty() && kwargs.is_empty() && var_arg.is_none() && kw_arg.is_none()) {
                self.expect(TokenKind::Comma)?;
                if self.skip_token(&TokenKind::RParen)? {
                    return Ok((args, kwargs, var_arg, kw_arg));
                }
            }
            if self.skip_token(&TokenKind::Pow)? {
                kw_arg = Some(Box::new(self.parse_expression(true)?));
            } else if self.skip_token(&TokenKind::Mul)? {
                var_arg = Some(Box::new(self.parse_expression(true)?));
            } else if matches!(self.peek(0)?.kind, TokenKind::Name(_))
                && matches!(self.peek(1)?.kind, TokenKind::Assign)
            {
                let (name, _) = self.expect_name()?;
                self.next()?;
                kwargs.push((name, self.parse_expression(true)?));
            } else {
                if !kwargs.is_empty() || kw_arg.is_some() {
                    let span = self.peek(0)?.span;
                    return Err(self.syntax_error(
                        "positional argument follows keyword argument",
                        span,
                    ));
                }
                args.push(self.parse_expression(true)?);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Name(name) => Ok(match name.as_str() {
                "true" | "True" => Expr::Const(Value::Bool(true)),
                "false" | "False" => Expr::Const(Value::Bool(false)),
                "none" | "None" => Expr::Const(Value::None),
                _ => Expr::Name(name),
            }),
            TokenKind::Int(v) => Ok(Expr::Const(Value::Int(v))),
            TokenKind::Float(v) => Ok(Expr::Const(Value::Float(v))),
            TokenKind::Str(s) => Ok(Expr::Const(Value::String(s))),
            TokenKind::LParen => {
                if self.skip_token(&TokenKind::RParen)? {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let inner = self.parse_tuple(true, &[])?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                loop {
                    if self.skip_token(&TokenKind::RBracket)? {
                        return Ok(Expr::List(items));
                    }
                    if !items.is_empty() {
                        self.expect(TokenKind::Comma)?;
                        if self.skip_token(&TokenKind::RBracket)? {
                            return Ok(Expr::List(items));
                        }
                    }
                    items.push(self.parse_expression(true)?);
                }
            }
            TokenKind::LBrace => {
                let mut pairs = Vec::new();
                loop {
                    if self.skip_token(&TokenKind::RBrace)? {
                        return Ok(Expr::Dict(pairs));
                    }
                    if !pairs.is_empty() {
                        self.expect(TokenKind::Comma)?;
                        if self.skip_token(&TokenKind::RBrace)? {
                            return Ok(Expr::Dict(pairs));
                        }
                    }
                    let key = self.parse_expression(true)?;
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_expression(true)?;
                    pairs.push((key, value));
                }
            }
            other => Err(self.syntax_error(
                format!("unexpected {}, expected an expression", other.describe()),
                token.span,
            )),
        }
    }
}

fn finish_compare(expr: Expr, ops: &mut Vec<(CmpOp, Expr)>) -> Expr {
    if ops.is_empty() {
        expr
    } else {
        Expr::Compare {
            left: Box::new(expr),
            ops: std::mem::take(ops),
        }
    }
}
