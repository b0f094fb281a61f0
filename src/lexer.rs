use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::token::{Span, Token, TokenKind};

/// Markup delimiters and whitespace policy consumed by the tokenizer.
///
/// Two environments with equal `Syntax` lex any template identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syntax {
    pub block_start: String,
    pub block_end: String,
    pub variable_start: String,
    pub variable_end: String,
    pub comment_start: String,
    pub comment_end: String,
    /// Column-0 statement marker, e.g. `%`.
    pub line_statement_prefix: Option<String>,
    /// Column-0 comment marker, e.g. `##`.
    pub line_comment_prefix: Option<String>,
    /// Strip one newline after a block or comment end.
    pub trim_blocks: bool,
    /// Strip leading tabs/spaces on the line of a block start.
    pub lstrip_blocks: bool,
    /// Newline sequence literal data is normalized to.
    pub newline: String,
    pub keep_trailing_newline: bool,
}

impl Default for Syntax {
    fn default() -> Syntax {
        Syntax {
            block_start: "{%".into(),
            block_end: "%}".into(),
            variable_start: "{{".into(),
            variable_end: "}}".into(),
            comment_start: "{#".into(),
            comment_end: "#}".into(),
            line_statement_prefix: None,
            line_comment_prefix: None,
            trim_blocks: false,
            lstrip_blocks: false,
            newline: "\n".into(),
            keep_trailing_newline: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkupKind {
    Variable,
    Block,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Variable,
    Block,
    LineStatement,
}

/// Whitespace adjustment owed to the leading edge of the next data token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Nothing,
    /// A `-` end modifier: strip all leading whitespace.
    StripAll,
    /// `trim_blocks`: strip exactly one leading newline.
    TrimNewline,
}

/// State-machine tokenizer over one template source.
pub struct Tokenizer<'a> {
    source: &'a str,
    syntax: &'a Syntax,
    path: Option<&'a str>,
    cursor: usize,
    line: u32,
    state: State,
    balance: Vec<char>,
    pending: Pending,
    queue: VecDeque<Token>,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str, syntax: &'a Syntax, path: Option<&'a str>) -> Tokenizer<'a> {
        let source = if syntax.keep_trailing_newline {
            source
        } else if let Some(chopped) = source.strip_suffix("\r\n") {
            chopped
        } else if let Some(chopped) = source.strip_suffix('\n') {
            chopped
        } else {
            source
        };
        Tokenizer {
            source,
            syntax,
            path,
            cursor: 0,
            line: 1,
            state: State::Data,
            balance: Vec::new(),
            pending: Pending::Nothing,
            queue: VecDeque::new(),
        }
    }

    fn remaining(&self) -> &'a str {
        &self.source[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        let consumed = &self.source[self.cursor..self.cursor + n];
        self.line += consumed.matches('\n').count() as u32;
        self.cursor += n;
    }

    fn span_from(&self, start: usize, line: u32) -> Span {
        Span::new(line, start as u32, self.cursor as u32)
    }

    fn error(&self, message: impl Into<String>, start: usize) -> Error {
        Error::syntax(
            message,
            Span::new(self.line, start as u32, self.cursor.max(start) as u32),
            self.path,
        )
    }

    /// The next token; returns `Eof` forever once the source is consumed.
    pub fn next_token(&mut self) -> Result<Token> {
        loop {
            if let Some(token) = self.queue.pop_front() {
                return Ok(token);
            }
            match self.state {
                State::Data => {
                    if self.cursor >= self.source.len() {
                        let span = Span::new(self.line, self.cursor as u32, self.cursor as u32);
                        return Ok(Token::new(TokenKind::Eof, span));
                    }
                    self.lex_data()?;
                }
                _ => return self.lex_markup(),
            }
        }
    }

    /// Drains the whole stream, including the final `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn at_line_start(&self, pos: usize) -> bool {
        pos == 0 || self.source.as_bytes()[pos - 1] == b'\n'
    }

    /// Scans literal text up to the next markup start and queues the
    /// resulting tokens.
    fn lex_data(&mut self) -> Result<()> {
        let data_start = self.cursor;
        let data_line = self.line;
        let bytes = self.source.as_bytes();

        let candidates = self.markup_candidates();
        let mut found: Option<(MarkupKind, usize, usize)> = None; // kind, pos, sigil len
        let mut line_prefix: Option<(bool, usize, usize)> = None; // is_comment, pos, len
        let mut i = self.cursor;
        'scan: while i < self.source.len() {
            for (kind, sigil) in candidates {
                if self.source[i..].starts_with(sigil) {
                    found = Some((kind, i, sigil.len()));
                    break 'scan;
                }
            }
            if self.at_line_start(i) {
                if let Some(prefix) = &self.syntax.line_comment_prefix {
                    if self.source[i..].starts_with(prefix.as_str()) {
                        line_prefix = Some((true, i, prefix.len()));
                        break 'scan;
                    }
                }
                if let Some(prefix) = &self.syntax.line_statement_prefix {
                    if self.source[i..].starts_with(prefix.as_str()) {
                        line_prefix = Some((false, i, prefix.len()));
                        break 'scan;
                    }
                }
            }
            // skip over the rest of this character
            i += 1;
            while i < self.source.len() && bytes[i] & 0xc0 == 0x80 {
                i += 1;
            }
        }

        if let Some((kind, pos, sigil_len)) = found {
            let modifier = self.modifier_at(pos + sigil_len);
            self.emit_data(data_start, pos, data_line, Some(kind), modifier);
            match kind {
                MarkupKind::Variable => {
                    let line = self.line;
                    self.advance(pos + sigil_len + modifier.map_or(0, |_| 1) - pos);
                    self.queue.push_back(Token::new(
                        TokenKind::VariableStart,
                        self.span_from(pos, line),
                    ));
                    self.state = State::Variable;
                }
                MarkupKind::Block => {
                    let after = pos + sigil_len + modifier.map_or(0, |_| 1);
                    if let Some(raw) = self.match_raw_tag(after) {
                        self.lex_raw_block(pos, raw)?;
                    } else {
                        let line = self.line;
                        self.advance(after - pos);
                        self.queue
                            .push_back(Token::new(TokenKind::BlockStart, self.span_from(pos, line)));
                        self.state = State::Block;
                    }
                }
                MarkupKind::Comment => {
                    self.lex_comment(pos, sigil_len, modifier)?;
                }
            }
        } else if let Some((is_comment, pos, prefix_len)) = line_prefix {
            self.emit_data(data_start, pos, data_line, None, None);
            let line = self.line;
            self.advance(pos + prefix_len - pos);
            if is_comment {
                let text_len = self.remaining().find('\n').unwrap_or(self.remaining().len());
                self.advance(text_len);
                self.queue
                    .push_back(Token::new(TokenKind::LineComment, self.span_from(pos, line)));
            } else {
                self.queue.push_back(Token::new(
                    TokenKind::LineStatementStart,
                    self.span_from(pos, line),
                ));
                self.state = State::LineStatement;
            }
        } else {
            // plain text to the end of the template
            let end = self.source.len();
            self.emit_data(data_start, end, data_line, None, None);
        }
        Ok(())
    }

    fn markup_candidates(&self) -> [(MarkupKind, &str); 3] {
        let mut candidates = [
            (MarkupKind::Variable, self.syntax.variable_start.as_str()),
            (MarkupKind::Block, self.syntax.block_start.as_str()),
            (MarkupKind::Comment, self.syntax.comment_start.as_str()),
        ];
        // longest sigil wins when one is a prefix of another, e.g. a
        // `<?=` variable start alongside a `<?` block start
        candidates.sort_by_key(|(_, s)| std::cmp::Reverse(s.len()));
        candidates
    }

    fn modifier_at(&self, pos: usize) -> Option<char> {
        match self.source.as_bytes().get(pos) {
            Some(b'-') => Some('-'),
            Some(b'+') => Some('+'),
            _ => None,
        }
    }

    /// Applies whitespace control to `source[start..end]` and queues it
    /// as a `Data` token if anything is left.
    fn emit_data(
        &mut self,
        start: usize,
        end: usize,
        line: u32,
        next_tag: Option<MarkupKind>,
        next_modifier: Option<char>,
    ) {
        let raw = &self.source[start..end];
        let mut text = raw;
        match self.pending {
            Pending::Nothing => {}
            Pending::StripAll => text = text.trim_start(),
            Pending::TrimNewline => {
                text = text
                    .strip_prefix("\r\n")
                    .or_else(|| text.strip_prefix('\n'))
                    .or_else(|| text.strip_prefix('\r'))
                    .unwrap_or(text);
            }
        }
        self.pending = Pending::Nothing;

        let mut text = text.to_string();
        match next_modifier {
            Some('-') => text.truncate(text.trim_end().len()),
            Some(_) => {}
            None => {
                let lstrip_applies = self.syntax.lstrip_blocks
                    && matches!(next_tag, Some(MarkupKind::Block) | Some(MarkupKind::Comment));
                if lstrip_applies {
                    let (tail_start, at_line_start) = match text.rfind('\n') {
                        Some(p) => (p + 1, true),
                        None => (0, self.at_line_start(start)),
                    };
                    if at_line_start
                        && text[tail_start..].chars().all(|c| c == ' ' || c == '\t')
                    {
                        text.truncate(tail_start);
                    }
                }
            }
        }

        self.advance(end - start);
        if !text.is_empty() {
            let text = normalize_newlines(&text, &self.syntax.newline);
            self.queue.push_back(Token::new(
                TokenKind::Data(text),
                Span::new(line, start as u32, end as u32),
            ));
        }
    }

    fn set_pending_after_end(&mut self, kind: MarkupKind, modifier: Option<char>) {
        self.pending = match modifier {
            Some('-') => Pending::StripAll,
            Some('+') => Pending::Nothing,
            _ if self.syntax.trim_blocks
                && matches!(kind, MarkupKind::Block | MarkupKind::Comment) =>
            {
                Pending::TrimNewline
            }
            _ => Pending::Nothing,
        };
    }

    fn lex_comment(&mut self, pos: usize, sigil_len: usize, modifier: Option<char>) -> Result<()> {
        let line = self.line;
        self.advance(pos + sigil_len + modifier.map_or(0, |_| 1) - pos);
        self.queue
            .push_back(Token::new(TokenKind::CommentStart, self.span_from(pos, line)));

        let end_sigil = self.syntax.comment_end.as_str();
        let rel = match self.remaining().find(end_sigil) {
            Some(rel) => rel,
            None => return Err(self.error("unterminated comment", pos)),
        };
        let abs = self.cursor + rel;
        let end_modifier = if rel > 0 {
            self.modifier_at(abs - 1)
        } else {
            None
        };
        let end_start = if end_modifier.is_some() { abs - 1 } else { abs };
        self.advance(end_start - self.cursor);
        let line = self.line;
        let end_start_abs = self.cursor;
        self.advance(abs - end_start + end_sigil.len());
        self.queue.push_back(Token::new(
            TokenKind::CommentEnd,
            self.span_from(end_start_abs, line),
        ));
        self.set_pending_after_end(MarkupKind::Comment, end_modifier);
        Ok(())
    }

    /// If the block tag opening at `after` is `{% raw %}`, returns the
    /// offset one past its closing sigil.
    fn match_raw_tag(&self, after: usize) -> Option<usize> {
        let mut k = after;
        k += leading_ws(&self.source[k..]);
        let rest = &self.source[k..];
        if !rest.starts_with("raw") {
            return None;
        }
        k += 3;
        if self.source[k..]
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            return None;
        }
        k += leading_ws(&self.source[k..]);
        if self.modifier_at(k).is_some() {
            k += 1;
        }
        if self.source[k..].starts_with(self.syntax.block_end.as_str()) {
            Some(k + self.syntax.block_end.len())
        } else {
            None
        }
    }

    /// Lexes `{% raw %}…{% endraw %}` into a single data token.
    fn lex_raw_block(&mut self, tag_start: usize, content_start: usize) -> Result<()> {
        // modifier before the opening tag's end sigil, e.g. `{% raw -%}`
        let open_end_modifier = {
            let before = content_start - self.syntax.block_end.len();
            self.modifier_at(before.wrapping_sub(1))
        };

        let bs = self.syntax.block_start.as_str();
        let be = self.syntax.block_end.as_str();
        let mut j = content_start;
        let (content_end, close_start, close_end, close_modifiers) = loop {
            let rel = match self.source[j..].find(bs) {
                Some(rel) => rel,
                None => return Err(self.error("unterminated raw block", tag_start)),
            };
            let p = j + rel;
            let mut k = p + bs.len();
            let open_modifier = self.modifier_at(k);
            if open_modifier.is_some() {
                k += 1;
            }
            k += leading_ws(&self.source[k..]);
            if self.source[k..].starts_with("endraw") {
                k += 6;
                k += leading_ws(&self.source[k..]);
                let end_modifier = self.modifier_at(k);
                if end_modifier.is_some() {
                    k += 1;
                }
                if self.source[k..].starts_with(be) {
                    break (p, p, k + be.len(), (open_modifier, end_modifier));
                }
            }
            j = p + bs.len();
        };
        let _ = close_start;

        let mut content = &self.source[content_start..content_end];
        match open_end_modifier {
            Some('-') => content = content.trim_start(),
            Some(_) => {}
            None if self.syntax.trim_blocks => {
                content = content
                    .strip_prefix("\r\n")
                    .or_else(|| content.strip_prefix('\n'))
                    .unwrap_or(content);
            }
            None => {}
        }
        if close_modifiers.0 == Some('-') {
            content = content.trim_end();
        }
        let text = content;

        let line = self.line;
        if !text.is_empty() {
            let text = normalize_newlines(text, &self.syntax.newline);
            self.queue.push_back(Token::new(
                TokenKind::Data(text),
                Span::new(line, content_start as u32, content_end as u32),
            ));
        }
        self.advance(close_end - self.cursor);
        self.set_pending_after_end(MarkupKind::Block, close_modifiers.1);
        Ok(())
    }

    /// Lexes one expression token inside `{% %}`, `{{ }}` or a line
    /// statement.
    fn lex_markup(&mut self) -> Result<Token> {
        loop {
            let rest = self.remaining();
            let c = match rest.chars().next() {
                Some(c) => c,
                None => {
                    if self.state == State::LineStatement {
                        self.state = State::Data;
                        let span = Span::new(self.line, self.cursor as u32, self.cursor as u32);
                        return Ok(Token::new(TokenKind::LineStatementEnd, span));
                    }
                    return Err(self.error("unexpected end of template", self.cursor));
                }
            };

            if c == '\n' && self.state == State::LineStatement && self.balance.is_empty() {
                let start = self.cursor;
                let line = self.line;
                self.advance(1);
                self.state = State::Data;
                return Ok(Token::new(
                    TokenKind::LineStatementEnd,
                    self.span_from(start, line),
                ));
            }
            if c.is_whitespace() {
                self.advance(c.len_utf8());
                continue;
            }

            let start = self.cursor;
            let line = self.line;

            // end sigils close the tag only outside brackets
            if self.balance.is_empty() && self.state != State::LineStatement {
                let (end_sigil, end_kind, markup) = match self.state {
                    State::Variable => (
                        self.syntax.variable_end.as_str(),
                        TokenKind::VariableEnd,
                        MarkupKind::Variable,
                    ),
                    State::Block => (
                        self.syntax.block_end.as_str(),
                        TokenKind::BlockEnd,
                        MarkupKind::Block,
                    ),
                    _ => unreachable!(),
                };
                let modifier = match c {
                    '-' | '+' if rest[1..].starts_with(end_sigil) => Some(c),
                    _ => None,
                };
                let matched = modifier.is_some() || rest.starts_with(end_sigil);
                if matched {
                    self.advance(end_sigil.len() + modifier.map_or(0, |_| 1));
                    self.state = State::Data;
                    self.set_pending_after_end(markup, modifier);
                    return Ok(Token::new(end_kind, self.span_from(start, line)));
                }
            }

            // two-character operators first
            let two = if rest.len() >= 2 && rest.is_char_boundary(2) {
                &rest[..2]
            } else {
                ""
            };
            let kind = match two {
                "==" => Some(TokenKind::Eq),
                "!=" => Some(TokenKind::Ne),
                "<=" => Some(TokenKind::Lteq),
                ">=" => Some(TokenKind::Gteq),
                "//" => Some(TokenKind::FloorDiv),
                "**" => Some(TokenKind::Pow),
                _ => None,
            };
            if let Some(kind) = kind {
                self.advance(2);
                return Ok(Token::new(kind, self.span_from(start, line)));
            }

            let kind = match c {
                '+' => Some(TokenKind::Add),
                '-' => Some(TokenKind::Sub),
                '*' => Some(TokenKind::Mul),
                '/' => Some(TokenKind::Div),
                '%' => Some(TokenKind::Mod),
                '~' => Some(TokenKind::Tilde),
                '<' => Some(TokenKind::Lt),
                '>' => Some(TokenKind::Gt),
                '=' => Some(TokenKind::Assign),
                '.' => Some(TokenKind::Dot),
                ':' => Some(TokenKind::Colon),
                '|' => Some(TokenKind::Pipe),
                ',' => Some(TokenKind::Comma),
                ';' => Some(TokenKind::Semicolon),
                _ => None,
            };
            if let Some(kind) = kind {
                self.advance(1);
                return Ok(Token::new(kind, self.span_from(start, line)));
            }

            match c {
                '(' | '[' | '{' => {
                    self.balance.push(c);
                    self.advance(1);
                    let kind = match c {
                        '(' => TokenKind::LParen,
                        '[' => TokenKind::LBracket,
                        _ => TokenKind::LBrace,
                    };
                    return Ok(Token::new(kind, self.span_from(start, line)));
                }
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if self.balance.pop() != Some(expected) {
                        return Err(self.error(format!("unexpected '{c}'"), start));
                    }
                    self.advance(1);
                    let kind = match c {
                        ')' => TokenKind::RParen,
                        ']' => TokenKind::RBracket,
                        _ => TokenKind::RBrace,
                    };
                    return Ok(Token::new(kind, self.span_from(start, line)));
                }
                '\'' | '"' => return self.lex_string(c),
                c if c.is_ascii_digit() => return self.lex_number(),
                c if c.is_alphabetic() || c == '_' => {
                    let name: String = rest
                        .chars()
                        .take_while(|c| c.is_alphanumeric() || *c == '_')
                        .collect();
                    self.advance(name.len());
                    return Ok(Token::new(TokenKind::Name(name), self.span_from(start, line)));
                }
                other => return Err(self.error(format!("unexpected character {other:?}"), start)),
            }
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<Token> {
        let start = self.cursor;
        let line = self.line;
        self.advance(1);
        let mut value = String::new();
        let mut chars = self.remaining().char_indices();
        while let Some((_, c)) = chars.next() {
            match c {
                c if c == quote => {
                    let consumed = chars.next().map_or(self.remaining().len(), |(i, _)| i);
                    self.advance(consumed);
                    return Ok(Token::new(TokenKind::Str(value), self.span_from(start, line)));
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '\'')) => value.push('\''),
                    Some((_, '"')) => value.push('"'),
                    Some((_, other)) => {
                        return Err(
                            self.error(format!("unknown escape sequence '\\{other}'"), start)
                        );
                    }
                    None => break,
                },
                other => value.push(other),
            }
        }
        Err(self.error("unterminated string", start))
    }

    fn lex_number(&mut self) -> Result<Token> {
        let start = self.cursor;
        let line = self.line;
        let rest = self.remaining();
        let bytes = rest.as_bytes();
        let mut end = 0;
        let mut is_float = false;
        while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'_') {
            end += 1;
        }
        if end < bytes.len()
            && bytes[end] == b'.'
            && bytes.get(end + 1).is_some_and(u8::is_ascii_digit)
        {
            is_float = true;
            end += 1;
            while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'_') {
                end += 1;
            }
        }
        if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
            let mut exp = end + 1;
            if bytes.get(exp).is_some_and(|b| *b == b'+' || *b == b'-') {
                exp += 1;
            }
            if bytes.get(exp).is_some_and(u8::is_ascii_digit) {
                is_float = true;
                end = exp;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
            }
        }
        let text: String = rest[..end].chars().filter(|c| *c != '_').collect();
        self.advance(end);
        let kind = if is_float {
            TokenKind::Float(
                text.parse()
                    .map_err(|_| self.error("invalid float literal", start))?,
            )
        } else {
            match text.parse::<i64>() {
                Ok(v) => TokenKind::Int(v),
                // fall back for literals beyond the integer range
                Err(_) => TokenKind::Float(
                    text.parse()
                        .map_err(|_| self.error("invalid integer literal", start))?,
                ),
            }
        };
        Ok(Token::new(kind, self.span_from(start, line)))
    }
}

fn leading_ws(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

fn normalize_newlines(text: &str, newline: &str) -> String {
    if !text.contains('\r') && newline == "\n" {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(newline);
            }
            '\n' => out.push_str(newline),
            other => out.push(other),
        }
    }
    out
}
