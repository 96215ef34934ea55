//! Tokenization of template source.
//!
//! A [`Lexer`] holds the compiled rule set for one delimiter/whitespace configuration and is
//! cached per configuration in a [`LexerCache`]. Lexing itself is lazy: [`Lexer::tokenize`]
//! returns a [`Tokenizer`] that produces one [`Token`] at a time while walking a stack of
//! states (template data, statement tags, print tags, line statements).

use std::{collections::VecDeque, fmt, sync::Arc};

use regex::Regex;

use crate::{
    cache::LruCache,
    error::{Error, JinjateResult},
};

/// A boxed token producer, as handed to extension stream filters.
pub type TokenIter = Box<dyn Iterator<Item = JinjateResult<Token>>>;

/// Lexers keyed by the configuration they were built for.
pub type LexerCache = LruCache<LexerConfig, Arc<Lexer>>;

/// Capacity of the lexer cache an environment creates when none is injected.
pub const DEFAULT_LEXER_CACHE_SIZE: usize = 50;

/// The closed set of token types.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Add,
    Assign,
    Colon,
    Comma,
    Div,
    Dot,
    Eq,
    FloorDiv,
    Gt,
    GtEq,
    LBrace,
    LBracket,
    LParen,
    Lt,
    LtEq,
    Mod,
    Mul,
    Ne,
    Pipe,
    Pow,
    RBrace,
    RBracket,
    RParen,
    Semicolon,
    Sub,
    Tilde,
    Name,
    String,
    Integer,
    Float,
    Data,
    BlockBegin,
    BlockEnd,
    VariableBegin,
    VariableEnd,
    Initial,
    Eof,
}

const ALL_KINDS: [TokenKind; 37] = [
    TokenKind::Add,
    TokenKind::Assign,
    TokenKind::Colon,
    TokenKind::Comma,
    TokenKind::Div,
    TokenKind::Dot,
    TokenKind::Eq,
    TokenKind::FloorDiv,
    TokenKind::Gt,
    TokenKind::GtEq,
    TokenKind::LBrace,
    TokenKind::LBracket,
    TokenKind::LParen,
    TokenKind::Lt,
    TokenKind::LtEq,
    TokenKind::Mod,
    TokenKind::Mul,
    TokenKind::Ne,
    TokenKind::Pipe,
    TokenKind::Pow,
    TokenKind::RBrace,
    TokenKind::RBracket,
    TokenKind::RParen,
    TokenKind::Semicolon,
    TokenKind::Sub,
    TokenKind::Tilde,
    TokenKind::Name,
    TokenKind::String,
    TokenKind::Integer,
    TokenKind::Float,
    TokenKind::Data,
    TokenKind::BlockBegin,
    TokenKind::BlockEnd,
    TokenKind::VariableBegin,
    TokenKind::VariableEnd,
    TokenKind::Initial,
    TokenKind::Eof,
];

impl TokenKind {
    /// The name used in `"type:value"` token expressions.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Assign => "assign",
            Self::Colon => "colon",
            Self::Comma => "comma",
            Self::Div => "div",
            Self::Dot => "dot",
            Self::Eq => "eq",
            Self::FloorDiv => "floordiv",
            Self::Gt => "gt",
            Self::GtEq => "gteq",
            Self::LBrace => "lbrace",
            Self::LBracket => "lbracket",
            Self::LParen => "lparen",
            Self::Lt => "lt",
            Self::LtEq => "lteq",
            Self::Mod => "mod",
            Self::Mul => "mul",
            Self::Ne => "ne",
            Self::Pipe => "pipe",
            Self::Pow => "pow",
            Self::RBrace => "rbrace",
            Self::RBracket => "rbracket",
            Self::RParen => "rparen",
            Self::Semicolon => "semicolon",
            Self::Sub => "sub",
            Self::Tilde => "tilde",
            Self::Name => "name",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Data => "data",
            Self::BlockBegin => "block_begin",
            Self::BlockEnd => "block_end",
            Self::VariableBegin => "variable_begin",
            Self::VariableEnd => "variable_end",
            Self::Initial => "initial",
            Self::Eof => "eof",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_KINDS.iter().copied().find(|kind| kind.as_str() == name)
    }

    /// A human readable description for error messages.
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Assign => "=",
            Self::Colon => ":",
            Self::Comma => ",",
            Self::Div => "/",
            Self::Dot => ".",
            Self::Eq => "==",
            Self::FloorDiv => "//",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::LBrace => "{",
            Self::LBracket => "[",
            Self::LParen => "(",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Mod => "%",
            Self::Mul => "*",
            Self::Ne => "!=",
            Self::Pipe => "|",
            Self::Pow => "**",
            Self::RBrace => "}",
            Self::RBracket => "]",
            Self::RParen => ")",
            Self::Semicolon => ";",
            Self::Sub => "-",
            Self::Tilde => "~",
            Self::Name => "name",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Data => "template data / text",
            Self::BlockBegin => "begin of statement block",
            Self::BlockEnd => "end of statement block",
            Self::VariableBegin => "begin of print statement",
            Self::VariableEnd => "end of print statement",
            Self::Initial => "initial",
            Self::Eof => "end of template",
        }
    }

    fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "+" => Self::Add,
            "-" => Self::Sub,
            "/" => Self::Div,
            "//" => Self::FloorDiv,
            "*" => Self::Mul,
            "%" => Self::Mod,
            "**" => Self::Pow,
            "~" => Self::Tilde,
            "[" => Self::LBracket,
            "]" => Self::RBracket,
            "(" => Self::LParen,
            ")" => Self::RParen,
            "{" => Self::LBrace,
            "}" => Self::RBrace,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::GtEq,
            "<" => Self::Lt,
            "<=" => Self::LtEq,
            "=" => Self::Assign,
            "." => Self::Dot,
            ":" => Self::Colon,
            "|" => Self::Pipe,
            "," => Self::Comma,
            ";" => Self::Semicolon,
            _ => return None,
        })
    }
}

/// The payload of a token.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    None,
    Str(String),
    Int(i64),
    Float(f64),
}

/// A single token: `(line number, type, value)`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub lineno: usize,
    pub kind: TokenKind,
    pub value: TokenValue,
}

impl Token {
    pub const fn new(lineno: usize, kind: TokenKind, value: TokenValue) -> Self {
        Self {
            lineno,
            kind,
            value,
        }
    }

    pub const fn simple(lineno: usize, kind: TokenKind) -> Self {
        Self::new(lineno, kind, TokenValue::None)
    }

    pub fn str_value(&self) -> Option<&str> {
        match &self.value {
            TokenValue::Str(s) => Some(s),
            TokenValue::None | TokenValue::Int(_) | TokenValue::Float(_) => None,
        }
    }

    /// True for a name token with the given value.
    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.str_value() == Some(name)
    }

    /// Tests against a token expression: either a type (`"block_end"`) or `"type:value"`.
    pub fn test(&self, expr: &str) -> bool {
        if self.kind.as_str() == expr {
            return true;
        }
        match expr.split_once(':') {
            Some((kind, value)) => self.kind.as_str() == kind && self.str_value() == Some(value),
            None => false,
        }
    }

    pub fn test_any(&self, exprs: &[&str]) -> bool {
        exprs.iter().any(|expr| self.test(expr))
    }

    pub fn describe(&self) -> String {
        match (&self.kind, &self.value) {
            (TokenKind::Name, TokenValue::Str(name)) => name.clone(),
            (kind, _) => kind.describe().to_string(),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Describes a token expression like `"name:endfor"` for error messages.
pub fn describe_token_expr(expr: &str) -> String {
    match expr.split_once(':') {
        Some(("name", value)) => value.to_string(),
        Some((kind, _)) => kind_description(kind),
        None => kind_description(expr),
    }
}

fn kind_description(kind: &str) -> String {
    TokenKind::from_name(kind).map_or_else(|| kind.to_string(), |k| k.describe().to_string())
}

/// Everything that influences how source text is split into tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LexerConfig {
    pub block_start: String,
    pub block_end: String,
    pub variable_start: String,
    pub variable_end: String,
    pub comment_start: String,
    pub comment_end: String,
    pub line_statement_prefix: Option<String>,
    pub line_comment_prefix: Option<String>,
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
    pub newline_sequence: String,
    pub keep_trailing_newline: bool,
}

impl Default for LexerConfig {
    fn default() -> Self {
        Self {
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
            newline_sequence: "\n".into(),
            keep_trailing_newline: false,
        }
    }
}

/// Compiled lexing rules for one [`LexerConfig`].
#[derive(Debug)]
pub struct Lexer {
    config: LexerConfig,
    root: Regex,
    raw_end: Regex,
    whitespace: Regex,
    inline_whitespace: Regex,
    float: Regex,
    integer: Regex,
    name: Regex,
    identifier: Regex,
    string: Regex,
    operator: Regex,
}

fn compile(pattern: &str) -> JinjateResult<Regex> {
    Regex::new(pattern).map_err(|e| Error::runtime(format!("invalid lexer rule: {}", e)))
}

impl Lexer {
    /// Builds the rule set for a configuration.
    ///
    /// # Errors
    /// - If delimiters are empty or collide with each other.
    pub fn new(config: LexerConfig) -> JinjateResult<Self> {
        let delimiters = [
            &config.block_start,
            &config.variable_start,
            &config.comment_start,
        ];
        if delimiters.iter().any(|d| d.is_empty())
            || config.block_end.is_empty()
            || config.variable_end.is_empty()
            || config.comment_end.is_empty()
        {
            return Err(Error::runtime("template delimiters must not be empty"));
        }
        if config.block_start == config.variable_start
            || config.block_start == config.comment_start
            || config.variable_start == config.comment_start
        {
            return Err(Error::runtime("template start delimiters must be distinct"));
        }
        if !matches!(config.newline_sequence.as_str(), "\n" | "\r\n" | "\r") {
            return Err(Error::runtime(
                "newline_sequence must be one of '\\n', '\\r\\n' or '\\r'",
            ));
        }

        let block_start = regex::escape(&config.block_start);
        let block_end = regex::escape(&config.block_end);

        // Longer openers first so that a prefix of another opener never wins.
        let mut rules: Vec<(usize, String)> = vec![
            (
                config.block_start.len() + 1,
                format!(
                    r"(?P<raw>{}(?P<raw_ws>[-+]?)\s*raw\s*(?P<raw_end_ws>[-+]?){})",
                    block_start, block_end
                ),
            ),
            (
                config.block_start.len(),
                format!(r"(?P<block>{}(?P<block_ws>[-+]?))", block_start),
            ),
            (
                config.variable_start.len(),
                format!(
                    r"(?P<variable>{}(?P<variable_ws>[-+]?))",
                    regex::escape(&config.variable_start)
                ),
            ),
            (
                config.comment_start.len(),
                format!(
                    r"(?P<comment>{}(?P<comment_ws>[-+]?))",
                    regex::escape(&config.comment_start)
                ),
            ),
        ];
        if let Some(prefix) = &config.line_statement_prefix {
            rules.push((
                prefix.len(),
                format!(r"(?P<linestatement>(?m:^)[ \t]*{})", regex::escape(prefix)),
            ));
        }
        if let Some(prefix) = &config.line_comment_prefix {
            rules.push((
                prefix.len(),
                format!(r"(?P<linecomment>[ \t]*{})", regex::escape(prefix)),
            ));
        }
        rules.sort_by(|a, b| b.0.cmp(&a.0));
        let root = rules
            .into_iter()
            .map(|(_, rule)| rule)
            .collect::<Vec<_>>()
            .join("|");

        Ok(Self {
            root: compile(&root)?,
            raw_end: compile(&format!(
                r"{}(?P<ws>[-+]?)\s*endraw\s*(?P<end_ws>[-+]?){}",
                block_start, block_end
            ))?,
            whitespace: compile(r"\A\s+")?,
            inline_whitespace: compile(r"\A[^\S\n]+")?,
            float: compile(
                r"(?i)\A(\d+_)*\d+((\.(\d+_)*\d+)?e[+\-]?(\d+_)*\d+|\.(\d+_)*\d+)",
            )?,
            integer: compile(
                r"(?i)\A(0b(_?[0-1])+|0o(_?[0-7])+|0x(_?[\da-f])+|[1-9](_?\d)*|0(_?0)*)",
            )?,
            name: compile(r"\A\w+")?,
            identifier: compile(r"\A[\p{XID_Start}_]\p{XID_Continue}*\z")?,
            string: compile(r#"(?s)\A('([^'\\]*(?:\\.[^'\\]*)*)'|"([^"\\]*(?:\\.[^"\\]*)*)")"#)?,
            operator: compile(r"\A(//|\*\*|==|!=|>=|<=|[+\-/*%~\[\](){}=.:,|;><])")?,
            config,
        })
    }

    pub const fn config(&self) -> &LexerConfig {
        &self.config
    }

    /// Looks up (or builds and caches) the lexer for a configuration.
    pub fn cached(cache: &LexerCache, config: &LexerConfig) -> JinjateResult<Arc<Self>> {
        if let Some(lexer) = cache.get(config) {
            tracing::trace!("lexer cache hit");
            return Ok(lexer);
        }
        tracing::trace!("lexer cache miss, compiling rules");
        let lexer = Arc::new(Self::new(config.clone())?);
        cache.insert(config.clone(), lexer.clone());
        Ok(lexer)
    }

    /// Starts lazily tokenizing `source`.
    pub fn tokenize(self: &Arc<Self>, source: &str) -> Tokenizer {
        Tokenizer::new(self.clone(), self.normalize_source(source))
    }

    /// Converts every newline to `\n` and drops one trailing newline unless configured otherwise.
    fn normalize_source(&self, source: &str) -> String {
        let mut normalized = source.replace("\r\n", "\n").replace('\r', "\n");
        if !self.config.keep_trailing_newline && normalized.ends_with('\n') {
            normalized.pop();
        }
        normalized
    }

    fn normalize_newlines(&self, data: &str) -> String {
        if self.config.newline_sequence == "\n" {
            data.to_string()
        } else {
            data.replace('\n', &self.config.newline_sequence)
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Block,
    Variable,
    LineStatement,
}

/// A lazy token producer for one source string.
pub struct Tokenizer {
    lexer: Arc<Lexer>,
    source: String,
    pos: usize,
    lineno: usize,
    states: Vec<State>,
    balancing: Vec<char>,
    pending: VecDeque<Token>,
    strip_next: bool,
    trim_newline: bool,
    last_kind: TokenKind,
    done: bool,
}

impl Tokenizer {
    fn new(lexer: Arc<Lexer>, source: String) -> Self {
        Self {
            lexer,
            source,
            pos: 0,
            lineno: 1,
            states: Vec::new(),
            balancing: Vec::new(),
            pending: VecDeque::new(),
            strip_next: false,
            trim_newline: false,
            last_kind: TokenKind::Initial,
            done: false,
        }
    }

    fn rest(&self) -> &str {
        self.source.get(self.pos..).unwrap_or("")
    }

    fn emit(&mut self, lineno: usize, kind: TokenKind, value: TokenValue) {
        self.last_kind = kind;
        self.pending.push_back(Token::new(lineno, kind, value));
    }

    fn advance(&mut self, len: usize) {
        let consumed = self.source.get(self.pos..self.pos.saturating_add(len)).unwrap_or("");
        self.lineno = self.lineno.saturating_add(consumed.matches('\n').count());
        self.pos = self.pos.saturating_add(len);
    }

    fn error(&self, message: String) -> Error {
        Error::syntax(message, self.lineno)
    }

    /// Applies pending right-strip / trim-blocks to a chunk of template data.
    fn take_leading(&mut self, data: &str) -> String {
        let mut data = data;
        if std::mem::take(&mut self.strip_next) {
            data = data.trim_start();
        } else if std::mem::take(&mut self.trim_newline) {
            data = data.strip_prefix('\n').unwrap_or(data);
        }
        data.to_string()
    }

    fn emit_data(&mut self, lineno: usize, data: &str) {
        if !data.is_empty() {
            let data = self.lexer.normalize_newlines(data);
            self.emit(lineno, TokenKind::Data, TokenValue::Str(data));
        }
    }

    /// Strips the indentation before a tag if it is alone on its line.
    fn lstrip(&self, data: String, data_start: usize) -> String {
        let trimmed = data.trim_end_matches([' ', '\t']);
        let at_line_start = if trimmed.is_empty() {
            data_start == 0 || self.source.get(..data_start).is_some_and(|s| s.ends_with('\n'))
        } else {
            trimmed.ends_with('\n')
        };
        if at_line_start {
            trimmed.to_string()
        } else {
            data
        }
    }

    fn lex_root(&mut self) -> JinjateResult<()> {
        let data_start = self.pos;
        let start_line = self.lineno;
        let Some(caps) = self.lexer.root.captures_at(&self.source, self.pos) else {
            let rest = self.rest().to_string();
            let data = self.take_leading(&rest);
            self.emit_data(start_line, &data);
            self.advance(rest.len());
            self.done = true;
            return Ok(());
        };
        let Some(whole) = caps.get(0) else {
            self.done = true;
            return Ok(());
        };
        let modifier = |group: &str| caps.name(group).map_or(String::new(), |m| m.as_str().to_string());
        let (kind, ws) = if caps.name("raw").is_some() {
            ("raw", modifier("raw_ws"))
        } else if caps.name("block").is_some() {
            ("block", modifier("block_ws"))
        } else if caps.name("variable").is_some() {
            ("variable", modifier("variable_ws"))
        } else if caps.name("comment").is_some() {
            ("comment", modifier("comment_ws"))
        } else if caps.name("linestatement").is_some() {
            ("linestatement", String::new())
        } else {
            ("linecomment", String::new())
        };
        let raw_end_ws = modifier("raw_end_ws");
        let (tag_start, tag_end) = (whole.start(), whole.end());
        let raw_data = self.source.get(data_start..tag_start).unwrap_or("").to_string();
        let mut data = self.take_leading(&raw_data);

        if ws == "-" {
            data = data.trim_end().to_string();
        } else if ws != "+"
            && self.lexer.config.lstrip_blocks
            && matches!(kind, "raw" | "block" | "comment")
        {
            data = self.lstrip(data, data_start);
        }
        self.emit_data(start_line, &data);
        self.advance(tag_start.saturating_sub(self.pos));
        let tag_line = self.lineno;

        match kind {
            "raw" => self.lex_raw(tag_end, &raw_end_ws),
            "comment" => self.lex_comment(tag_end),
            "linecomment" => {
                let line_end = self
                    .source
                    .get(tag_end..)
                    .and_then(|rest| rest.find('\n'))
                    .map_or(self.source.len(), |idx| tag_end.saturating_add(idx));
                self.advance(line_end.saturating_sub(self.pos));
                Ok(())
            }
            "variable" => {
                self.advance(tag_end.saturating_sub(self.pos));
                self.emit(tag_line, TokenKind::VariableBegin, TokenValue::None);
                self.states.push(State::Variable);
                Ok(())
            }
            "linestatement" => {
                self.advance(tag_end.saturating_sub(self.pos));
                self.emit(tag_line, TokenKind::BlockBegin, TokenValue::None);
                self.states.push(State::LineStatement);
                Ok(())
            }
            _ => {
                self.advance(tag_end.saturating_sub(self.pos));
                self.emit(tag_line, TokenKind::BlockBegin, TokenValue::None);
                self.states.push(State::Block);
                Ok(())
            }
        }
    }

    fn lex_raw(&mut self, body_start: usize, begin_end_ws: &str) -> JinjateResult<()> {
        let Some(caps) = self.lexer.raw_end.captures_at(&self.source, body_start) else {
            return Err(self.error("Missing end of raw directive".to_string()));
        };
        let Some(end) = caps.get(0) else {
            return Err(self.error("Missing end of raw directive".to_string()));
        };
        let (end_start, end_end) = (end.start(), end.end());
        let strip_body_end = caps.name("ws").is_some_and(|m| m.as_str() == "-");
        let end_ws = caps.name("end_ws").map_or(String::new(), |m| m.as_str().to_string());

        let mut body = self.source.get(body_start..end_start).unwrap_or("");
        if begin_end_ws == "-" {
            body = body.trim_start();
        }
        if strip_body_end {
            body = body.trim_end();
        }
        let body = body.to_string();
        self.advance(body_start.saturating_sub(self.pos));
        let body_line = self.lineno;
        self.emit_data(body_line, &body);
        match end_ws.as_str() {
            "-" => self.strip_next = true,
            "+" => {}
            _ => self.trim_newline = self.lexer.config.trim_blocks,
        }
        self.advance(end_end.saturating_sub(self.pos));
        Ok(())
    }

    fn lex_comment(&mut self, body_start: usize) -> JinjateResult<()> {
        let end_marker = self.lexer.config.comment_end.clone();
        let Some(offset) = self.source.get(body_start..).and_then(|rest| rest.find(&end_marker))
        else {
            return Err(self.error("Missing end of comment tag".to_string()));
        };
        let end = body_start.saturating_add(offset);
        let body = self.source.get(body_start..end).unwrap_or("");
        if body.ends_with('-') {
            self.strip_next = true;
        } else if !body.ends_with('+') {
            self.trim_newline = self.lexer.config.trim_blocks;
        }
        self.advance(end.saturating_add(end_marker.len()).saturating_sub(self.pos));
        Ok(())
    }

    /// Tries to close the current tag. Returns whether it did.
    fn lex_tag_end(&mut self, state: State) -> bool {
        if !self.balancing.is_empty() {
            return false;
        }
        let lineno = self.lineno;
        if state == State::LineStatement {
            let rest = self.rest();
            let ws_len = rest.len().saturating_sub(rest.trim_start_matches([' ', '\t', '\r']).len());
            let after = rest.get(ws_len..).unwrap_or("");
            if after.is_empty() || after.starts_with('\n') {
                let len = ws_len.saturating_add(usize::from(after.starts_with('\n')));
                self.advance(len);
                self.emit(lineno, TokenKind::BlockEnd, TokenValue::None);
                self.states.pop();
                return true;
            }
            return false;
        }
        let (end, kind) = match state {
            State::Block => (self.lexer.config.block_end.clone(), TokenKind::BlockEnd),
            State::Variable | State::LineStatement => {
                (self.lexer.config.variable_end.clone(), TokenKind::VariableEnd)
            }
        };
        let rest = self.rest();
        let (len, modifier) = if rest.starts_with(&end) {
            (end.len(), None)
        } else if rest.starts_with('-') && rest.get(1..).is_some_and(|r| r.starts_with(&end)) {
            (end.len().saturating_add(1), Some('-'))
        } else if rest.starts_with('+') && rest.get(1..).is_some_and(|r| r.starts_with(&end)) {
            (end.len().saturating_add(1), Some('+'))
        } else {
            return false;
        };
        self.advance(len);
        self.emit(lineno, kind, TokenValue::None);
        self.states.pop();
        match modifier {
            Some('-') => self.strip_next = true,
            Some(_) => {}
            None => self.trim_newline = kind == TokenKind::BlockEnd && self.lexer.config.trim_blocks,
        }
        true
    }

    fn lex_tag(&mut self, state: State) -> JinjateResult<()> {
        let ws_rule = if state == State::LineStatement && self.balancing.is_empty() {
            &self.lexer.inline_whitespace
        } else {
            &self.lexer.whitespace
        };
        if let Some(m) = ws_rule.find(self.rest()) {
            let len = m.end();
            self.advance(len);
        }
        if self.pos >= self.source.len() {
            if state == State::LineStatement && self.balancing.is_empty() {
                self.emit(self.lineno, TokenKind::BlockEnd, TokenValue::None);
                self.states.pop();
            }
            self.done = true;
            return Ok(());
        }
        if self.lex_tag_end(state) {
            return Ok(());
        }
        let lineno = self.lineno;
        let rest = self.rest();

        if self.last_kind != TokenKind::Dot {
            if let Some(m) = self.lexer.float.find(rest) {
                let text = m.as_str().replace('_', "");
                let len = m.end();
                let value: f64 = text
                    .parse()
                    .map_err(|_| self.error(format!("invalid float literal '{}'", text)))?;
                self.advance(len);
                self.emit(lineno, TokenKind::Float, TokenValue::Float(value));
                return Ok(());
            }
        }
        if let Some(m) = self.lexer.integer.find(rest) {
            let len = m.end();
            let value = parse_integer(m.as_str()).ok_or_else(|| {
                self.error(format!("integer literal '{}' is out of range", m.as_str()))
            })?;
            self.advance(len);
            self.emit(lineno, TokenKind::Integer, TokenValue::Int(value));
            return Ok(());
        }
        if let Some(m) = self.lexer.name.find(rest) {
            let name = m.as_str().to_string();
            if !self.lexer.identifier.is_match(&name) {
                return Err(self.error(format!("Invalid character in identifier '{}'", name)));
            }
            self.advance(name.len());
            self.emit(lineno, TokenKind::Name, TokenValue::Str(name));
            return Ok(());
        }
        if let Some(m) = self.lexer.string.find(rest) {
            let literal = m.as_str();
            let len = m.end();
            let inner = literal
                .get(1..literal.len().saturating_sub(1))
                .unwrap_or("");
            let value = unescape(inner).map_err(|message| self.error(message))?;
            self.advance(len);
            self.emit(lineno, TokenKind::String, TokenValue::Str(value));
            return Ok(());
        }
        if let Some(m) = self.lexer.operator.find(rest) {
            let op = m.as_str().to_string();
            self.check_balance(&op)?;
            let kind = TokenKind::from_operator(&op)
                .ok_or_else(|| self.error(format!("unexpected char '{}'", op)))?;
            self.advance(op.len());
            self.emit(lineno, kind, TokenValue::None);
            return Ok(());
        }
        let c = rest.chars().next().unwrap_or(' ');
        Err(self.error(format!("unexpected char '{}' at {}", c, self.pos)))
    }

    fn check_balance(&mut self, op: &str) -> JinjateResult<()> {
        match op {
            "(" => self.balancing.push(')'),
            "[" => self.balancing.push(']'),
            "{" => self.balancing.push('}'),
            ")" | "]" | "}" => {
                let Some(expected) = self.balancing.pop() else {
                    return Err(self.error(format!("unexpected '{}'", op)));
                };
                if !op.starts_with(expected) {
                    return Err(self.error(format!(
                        "unexpected '{}', expected '{}'",
                        op, expected
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn step(&mut self) -> JinjateResult<()> {
        match self.states.last().copied() {
            None => self.lex_root(),
            Some(state) => self.lex_tag(state),
        }
    }
}

impl Iterator for Tokenizer {
    type Item = JinjateResult<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(Ok(token));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.step() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

fn parse_integer(literal: &str) -> Option<i64> {
    let clean = literal.replace('_', "").to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = clean.strip_prefix("0b") {
        (rest.to_string(), 2)
    } else if let Some(rest) = clean.strip_prefix("0o") {
        (rest.to_string(), 8)
    } else if let Some(rest) = clean.strip_prefix("0x") {
        (rest.to_string(), 16)
    } else {
        (clean, 10)
    };
    i64::from_str_radix(&digits, radix).ok()
}

fn hex_escape<I: Iterator<Item = char>>(chars: &mut I, len: usize, escape: char) -> Result<char, String> {
    let digits: String = chars.take(len).collect();
    if digits.len() != len {
        return Err(format!("truncated \\{}{} escape", escape, digits));
    }
    u32::from_str_radix(&digits, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| format!("invalid escape sequence '\\{}{}'", escape, digits))
}

/// Resolves backslash escapes in a string literal.
pub(crate) fn unescape(input: &str) -> Result<String, String> {
    let mut rv = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            rv.push(c);
            continue;
        }
        let Some(escape) = chars.next() else {
            return Err("string literal ends with a backslash".to_string());
        };
        match escape {
            '\\' => rv.push('\\'),
            '\'' => rv.push('\''),
            '"' => rv.push('"'),
            'n' => rv.push('\n'),
            't' => rv.push('\t'),
            'r' => rv.push('\r'),
            'b' => rv.push('\u{8}'),
            'f' => rv.push('\u{c}'),
            'v' => rv.push('\u{b}'),
            'a' => rv.push('\u{7}'),
            '\n' => {}
            'x' => rv.push(hex_escape(&mut chars, 2, 'x')?),
            'u' => rv.push(hex_escape(&mut chars, 4, 'u')?),
            'U' => rv.push(hex_escape(&mut chars, 8, 'U')?),
            '0'..='7' => {
                let mut value = escape.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(digit) => {
                            value = value.saturating_mul(8).saturating_add(digit);
                            chars.next();
                        }
                        None => break,
                    }
                }
                rv.push(char::from_u32(value).unwrap_or('\u{fffd}'));
            }
            other => return Err(format!("invalid escape sequence '\\{}'", other)),
        }
    }
    Ok(rv)
}

/// A pull-based token stream with one token of push-back.
///
/// `current` is always defined; once the producer is exhausted it stays an end-of-template token.
pub struct TokenStream {
    iter: TokenIter,
    pushed: VecDeque<Token>,
    current: Token,
    name: Option<String>,
    filename: Option<String>,
    closed: bool,
}

impl TokenStream {
    pub fn new(
        iter: TokenIter,
        name: Option<&str>,
        filename: Option<&str>,
    ) -> JinjateResult<Self> {
        let mut stream = Self {
            iter,
            pushed: VecDeque::new(),
            current: Token::simple(1, TokenKind::Initial),
            name: name.map(str::to_string),
            filename: filename.map(str::to_string),
            closed: false,
        };
        stream.advance()?;
        Ok(stream)
    }

    pub const fn current(&self) -> &Token {
        &self.current
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn is_eof(&self) -> bool {
        self.current.kind == TokenKind::Eof
    }

    fn pull(&mut self) -> JinjateResult<Token> {
        if self.closed {
            return Ok(Token::simple(self.current.lineno, TokenKind::Eof));
        }
        match self.iter.next() {
            Some(Ok(token)) => Ok(token),
            Some(Err(err)) => {
                self.close();
                Err(err.with_source_info(self.name.as_deref(), self.filename.as_deref()))
            }
            None => {
                self.close();
                Ok(Token::simple(self.current.lineno, TokenKind::Eof))
            }
        }
    }

    /// Moves to the next token and returns the previous current one.
    pub fn advance(&mut self) -> JinjateResult<Token> {
        let next = match self.pushed.pop_front() {
            Some(token) => token,
            None if self.current.kind == TokenKind::Eof => return Ok(self.current.clone()),
            None => self.pull()?,
        };
        Ok(std::mem::replace(&mut self.current, next))
    }

    /// Pushes a token back; it becomes current after the present current token.
    pub fn push(&mut self, token: Token) {
        self.pushed.push_back(token);
    }

    /// Returns the token after the current one without consuming anything.
    pub fn look(&mut self) -> JinjateResult<Token> {
        let old = self.advance()?;
        let result = self.current.clone();
        self.pushed.push_front(result.clone());
        self.current = old;
        Ok(result)
    }

    pub fn skip(&mut self, n: usize) -> JinjateResult<()> {
        for _ in 0..n {
            self.advance()?;
        }
        Ok(())
    }

    pub fn next_if(&mut self, expr: &str) -> JinjateResult<Option<Token>> {
        if self.current.test(expr) {
            self.advance().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn skip_if(&mut self, expr: &str) -> JinjateResult<bool> {
        self.next_if(expr).map(|token| token.is_some())
    }

    /// Consumes the current token if it matches `expr`, fails otherwise.
    pub fn expect(&mut self, expr: &str) -> JinjateResult<Token> {
        if !self.current.test(expr) {
            let expected = describe_token_expr(expr);
            let message = if self.current.kind == TokenKind::Eof {
                format!("unexpected end of template, expected '{}'.", expected)
            } else {
                format!(
                    "expected token '{}', got '{}'",
                    expected,
                    self.current.describe()
                )
            };
            return Err(Error::syntax(message, self.current.lineno)
                .with_source_info(self.name.as_deref(), self.filename.as_deref()));
        }
        self.advance()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexer(config: LexerConfig) -> Arc<Lexer> {
        Arc::new(Lexer::new(config).unwrap())
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lexer(LexerConfig::default())
            .tokenize(source)
            .map(|t| t.unwrap().kind)
            .collect()
    }

    fn data(config: LexerConfig, source: &str) -> String {
        lexer(config)
            .tokenize(source)
            .filter_map(|t| {
                let t = t.unwrap();
                (t.kind == TokenKind::Data).then(|| t.str_value().unwrap_or("").to_string())
            })
            .collect()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_plain_text_round_trips() {
        let source = "Hello\nthere, { not a tag } % # world";
        assert_eq!(data(LexerConfig::default(), source), source);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_newline_sequence_and_trailing_newline() {
        let config = LexerConfig {
            newline_sequence: "\r\n".into(),
            ..LexerConfig::default()
        };
        assert_eq!(data(config, "a\nb\r\nc\n"), "a\r\nb\r\nc");
        let keep = LexerConfig {
            keep_trailing_newline: true,
            ..LexerConfig::default()
        };
        assert_eq!(data(keep, "a\n"), "a\n");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tag_tokens() {
        assert_eq!(
            kinds("a{{ x|upper }}b"),
            vec![
                TokenKind::Data,
                TokenKind::VariableBegin,
                TokenKind::Name,
                TokenKind::Pipe,
                TokenKind::Name,
                TokenKind::VariableEnd,
                TokenKind::Data,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_operators_longest_first() {
        assert_eq!(
            kinds("{{ a // b ** c <= d }}"),
            vec![
                TokenKind::VariableBegin,
                TokenKind::Name,
                TokenKind::FloorDiv,
                TokenKind::Name,
                TokenKind::Pow,
                TokenKind::Name,
                TokenKind::LtEq,
                TokenKind::Name,
                TokenKind::VariableEnd,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_numbers() {
        let tokens: Vec<Token> = lexer(LexerConfig::default())
            .tokenize("{{ 1_000 0x1f 2.5 1e3 1_0.0_1 }}")
            .map(Result::unwrap)
            .collect();
        let values: Vec<&TokenValue> = tokens.iter().map(|t| &t.value).collect();
        assert_eq!(
            values,
            vec![
                &TokenValue::None,
                &TokenValue::Int(1000),
                &TokenValue::Int(31),
                &TokenValue::Float(2.5),
                &TokenValue::Float(1000.0),
                &TokenValue::Float(10.01),
                &TokenValue::None,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_attribute_after_dot_is_not_a_float() {
        assert_eq!(
            kinds("{{ a.0.1 }}"),
            vec![
                TokenKind::VariableBegin,
                TokenKind::Name,
                TokenKind::Dot,
                TokenKind::Integer,
                TokenKind::Dot,
                TokenKind::Integer,
                TokenKind::VariableEnd,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_escapes() {
        assert_eq!(unescape(r"a\nb\x41é\'").unwrap(), "a\nbAé'");
        assert_eq!(unescape(r"\q").unwrap_err(), "invalid escape sequence '\\q'");
        let err = lexer(LexerConfig::default())
            .tokenize(r"{{ 'bad \q' }}")
            .find_map(Result::err)
            .unwrap();
        assert!(err.message().contains("\\q"), "error should name the escape");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_invalid_identifier() {
        let err = lexer(LexerConfig::default())
            .tokenize("{{ \u{2160}\u{0301} }}")
            .find_map(Result::err);
        assert!(err.is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_balanced_braces_inside_tag() {
        assert_eq!(
            kinds("{{ {'a': {'b': 1}} }}"),
            vec![
                TokenKind::VariableBegin,
                TokenKind::LBrace,
                TokenKind::String,
                TokenKind::Colon,
                TokenKind::LBrace,
                TokenKind::String,
                TokenKind::Colon,
                TokenKind::Integer,
                TokenKind::RBrace,
                TokenKind::RBrace,
                TokenKind::VariableEnd,
            ]
        );
        let err = lexer(LexerConfig::default())
            .tokenize("{{ (a] }}")
            .find_map(Result::err)
            .unwrap();
        assert_eq!(err.message(), "unexpected ']', expected ')'");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_whitespace_control() {
        let config = LexerConfig::default();
        assert_eq!(data(config.clone(), "a  \n {%- if x -%}\n  b"), "ab");
        let trim = LexerConfig {
            trim_blocks: true,
            ..LexerConfig::default()
        };
        assert_eq!(data(trim.clone(), "{% if x %}\nX"), "X");
        assert_eq!(data(trim, "{% if x +%}\nX"), "\nX");
        let lstrip = LexerConfig {
            lstrip_blocks: true,
            ..LexerConfig::default()
        };
        assert_eq!(data(lstrip.clone(), "a\n   {% if x %}X"), "a\nX");
        assert_eq!(data(lstrip.clone(), "a   {% if x %}X"), "a   X");
        assert_eq!(data(lstrip, "a\n   {%+ if x %}X"), "a\n   X");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comments_and_raw() {
        assert_eq!(data(LexerConfig::default(), "a{# skip {{ me }} #}b"), "ab");
        assert_eq!(
            data(LexerConfig::default(), "{% raw %}{{ kept }}{% endraw %}"),
            "{{ kept }}"
        );
        let err = lexer(LexerConfig::default())
            .tokenize("a{# open")
            .find_map(Result::err)
            .unwrap();
        assert_eq!(err.message(), "Missing end of comment tag");
        let err = lexer(LexerConfig::default())
            .tokenize("{% raw %}open")
            .find_map(Result::err)
            .unwrap();
        assert_eq!(err.message(), "Missing end of raw directive");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_line_statements_and_comments() {
        let config = LexerConfig {
            line_statement_prefix: Some("#".into()),
            line_comment_prefix: Some("##".into()),
            ..LexerConfig::default()
        };
        let tokens: Vec<TokenKind> = lexer(config)
            .tokenize("# if x\nyes ## hidden\n# endif")
            .map(|t| t.unwrap().kind)
            .collect();
        assert_eq!(
            tokens,
            vec![
                TokenKind::BlockBegin,
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::BlockEnd,
                TokenKind::Data,
                TokenKind::Data,
                TokenKind::BlockBegin,
                TokenKind::Name,
                TokenKind::BlockEnd,
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_line_numbers() {
        let tokens: Vec<Token> = lexer(LexerConfig::default())
            .tokenize("a\nb\n{{\nx }}")
            .map(Result::unwrap)
            .collect();
        let name = tokens.iter().find(|t| t.kind == TokenKind::Name).unwrap();
        assert_eq!(name.lineno, 4);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_token_stream_lookahead_and_expect() {
        let iter = Box::new(lexer(LexerConfig::default()).tokenize("{{ a.b }}"));
        let mut stream = TokenStream::new(iter, Some("t"), None).unwrap();
        assert!(stream.current().test("variable_begin"));
        stream.advance().unwrap();
        assert!(stream.current().test("name:a"));
        assert_eq!(stream.look().unwrap().kind, TokenKind::Dot);
        assert!(stream.current().test("name:a"), "look must not consume");
        assert!(stream.skip_if("name:a").unwrap());
        let err = stream.expect("name").unwrap_err();
        assert_eq!(err.message(), "expected token 'name', got '.'");
        assert_eq!(err.name(), Some("t"));
        stream.skip(4).unwrap();
        assert!(stream.is_eof());
        assert!(stream.is_eof(), "eof is sticky");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_cache_reuses_lexers() {
        let cache = LexerCache::new(2);
        let a = Lexer::cached(&cache, &LexerConfig::default()).unwrap();
        let b = Lexer::cached(&cache, &LexerConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b), "same config should yield the same lexer");
    }
}
