use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    ast::{
        AssignBlock, Block, Call, CallArgs, CallBlock, Expr, ExprKind, FilterBlock, FilterCall,
        For, FromImport, If, Import, Include, Keyword, LogicOp, Macro, NameCtx, Operand, Stmt,
        StmtKind, Template, TestCall, UnaryOp, With, expr_stores,
    },
    error::{Error, JinjateResult},
    ext::Extension,
    lexer::{Token, TokenKind, TokenStream, TokenValue, describe_token_expr},
    value::{BinOpKind, CmpOp, Value},
};

const STATEMENT_KEYWORDS: [&str; 12] = [
    "for",
    "if",
    "block",
    "extends",
    "print",
    "macro",
    "include",
    "from",
    "import",
    "set",
    "with",
    "autoescape",
];

/// Extension tag handlers keyed by tag name.
pub type TagHandlers = IndexMap<String, Arc<dyn Extension>>;

/// Recursive-descent parser from a [`TokenStream`] to a [`Template`] tree.
///
/// The public methods are the building blocks extensions use to parse their own tags.
pub struct Parser<'a> {
    stream: TokenStream,
    extensions: &'a TagHandlers,
    /// Names of the tags currently being parsed, innermost last.
    tag_stack: Vec<String>,
    /// The end tokens each open construct is waiting for.
    end_token_stack: Vec<Vec<String>>,
}

impl<'a> Parser<'a> {
    pub fn new(stream: TokenStream, extensions: &'a TagHandlers) -> Self {
        Self {
            stream,
            extensions,
            tag_stack: Vec::new(),
            end_token_stack: Vec::new(),
        }
    }

    pub fn stream(&mut self) -> &mut TokenStream {
        &mut self.stream
    }

    /// A syntax error at `lineno` carrying this template's name and filename.
    pub fn fail(&self, message: impl Into<String>, lineno: usize) -> Error {
        Error::syntax(message, lineno).with_source_info(self.stream.name(), self.stream.filename())
    }

    fn fail_assertion(&self, message: impl Into<String>, lineno: usize) -> Error {
        Error::assertion(message, lineno)
            .with_source_info(self.stream.name(), self.stream.filename())
    }

    fn fail_ut_eof(&self, name: Option<&str>, lineno: usize) -> Error {
        let expected: Vec<String> = self
            .end_token_stack
            .iter()
            .flatten()
            .map(|expr| describe_token_expr(expr))
            .collect();
        let currently_looking = self.end_token_stack.last().map(|exprs| {
            exprs
                .iter()
                .map(|expr| format!("'{}'", describe_token_expr(expr)))
                .collect::<Vec<_>>()
                .join(" or ")
        });
        let mut message = vec![match name {
            None => "Unexpected end of template.".to_string(),
            Some(name) => format!("Encountered unknown tag '{}'.", name),
        }];
        if let Some(looking) = currently_looking {
            if name.is_some_and(|name| expected.iter().any(|e| e == name)) {
                message.push(format!(
                    "You probably made a nesting mistake. This tag is expected, but the \
                     parser is currently looking for {}.",
                    looking
                ));
            } else {
                message.push(format!(
                    "The parser was looking for the following tags: {}.",
                    looking
                ));
            }
        }
        if let Some(tag) = self.tag_stack.last() {
            message.push(format!(
                "The innermost block that needs to be closed is '{}'.",
                tag
            ));
        }
        self.fail(message.join(" "), lineno)
    }

    fn fail_unknown_tag(&self, name: &str, lineno: usize) -> Error {
        self.fail_ut_eof(Some(name), lineno)
    }

    fn fail_eof(&mut self, end_tokens: &[&str], lineno: usize) -> Error {
        self.end_token_stack
            .push(end_tokens.iter().map(|t| (*t).to_string()).collect());
        let err = self.fail_ut_eof(None, lineno);
        self.end_token_stack.pop();
        err
    }

    fn current(&self) -> &Token {
        self.stream.current()
    }

    fn current_kind(&self) -> TokenKind {
        self.stream.current().kind
    }

    fn is_tuple_end(&self, extra_end_rules: &[&str]) -> bool {
        matches!(
            self.current().kind,
            TokenKind::VariableEnd | TokenKind::BlockEnd | TokenKind::RParen
        ) || self.current().test_any(extra_end_rules)
    }

    fn expect_name(&mut self) -> JinjateResult<(String, usize)> {
        let token = self.stream.expect("name")?;
        let name = token.str_value().unwrap_or_default().to_string();
        Ok((name, token.lineno))
    }

    /// Parses a single statement, which may expand to several nodes.
    pub fn parse_statement(&mut self) -> JinjateResult<Vec<Stmt>> {
        let token = self.current().clone();
        if token.kind != TokenKind::Name {
            return Err(self.fail("tag name expected", token.lineno));
        }
        let name = token.str_value().unwrap_or_default().to_string();
        self.tag_stack.push(name.clone());
        let result = self.dispatch_statement(&name, token.lineno);
        self.tag_stack.pop();
        result
    }

    fn dispatch_statement(&mut self, name: &str, lineno: usize) -> JinjateResult<Vec<Stmt>> {
        if STATEMENT_KEYWORDS.contains(&name) {
            let stmt = match name {
                "for" => self.parse_for()?,
                "if" => self.parse_if()?,
                "block" => self.parse_block()?,
                "extends" => self.parse_extends()?,
                "print" => self.parse_print()?,
                "macro" => self.parse_macro()?,
                "include" => self.parse_include()?,
                "from" => self.parse_from()?,
                "import" => self.parse_import()?,
                "set" => self.parse_set()?,
                "with" => self.parse_with()?,
                _ => self.parse_autoescape()?,
            };
            return Ok(vec![stmt]);
        }
        match name {
            "call" => return Ok(vec![self.parse_call_block()?]),
            "filter" => return Ok(vec![self.parse_filter_block()?]),
            _ => {}
        }
        if let Some(ext) = self.extensions.get(name).cloned() {
            return ext.parse(self);
        }
        // The unknown tag is not part of the stack that needs closing.
        let tag = self.tag_stack.pop();
        let err = self.fail_unknown_tag(name, lineno);
        self.tag_stack.extend(tag);
        Err(err)
    }

    /// Parses the statements up to one of `end_tokens`.
    ///
    /// The current token must be the end of the opening tag. With `drop_needle` the matching end
    /// token is consumed too.
    pub fn parse_statements(
        &mut self,
        end_tokens: &[&str],
        drop_needle: bool,
    ) -> JinjateResult<Vec<Stmt>> {
        self.stream.skip_if("colon")?;
        self.stream.expect("block_end")?;
        let result = self.subparse(Some(end_tokens))?;
        if self.current().kind == TokenKind::Eof {
            let lineno = self.current().lineno;
            return Err(self.fail_eof(end_tokens, lineno));
        }
        if drop_needle {
            self.stream.advance()?;
        }
        Ok(result)
    }

    fn parse_set(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let target = self.parse_assign_target(true, false, &[], true)?;
        if self.stream.skip_if("assign")? {
            let node = self.parse_tuple(false, true, &[], false)?;
            return Ok(Stmt::new(StmtKind::Assign { target, node }, lineno));
        }
        let filter = self.parse_filter(None, false)?;
        let body = self.parse_statements(&["name:endset"], true)?;
        Ok(Stmt::new(
            StmtKind::AssignBlock(Box::new(AssignBlock {
                target,
                filter,
                body,
            })),
            lineno,
        ))
    }

    fn parse_for(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.expect("name:for")?.lineno;
        let target = self.parse_assign_target(true, false, &["name:in"], false)?;
        if expr_stores(&target, "loop") {
            return Err(self.fail_assertion(
                "Can't assign to special loop variable in for-loop target",
                lineno,
            ));
        }
        self.stream.expect("name:in")?;
        let iter = self.parse_tuple(false, false, &["name:recursive"], false)?;
        let test = if self.stream.skip_if("name:if")? {
            Some(self.parse_expression(true)?)
        } else {
            None
        };
        let recursive = self.stream.skip_if("name:recursive")?;
        let body = self.parse_statements(&["name:endfor", "name:else"], false)?;
        let else_ = if self.stream.advance()?.is_name("endfor") {
            Vec::new()
        } else {
            self.parse_statements(&["name:endfor"], true)?
        };
        Ok(Stmt::new(
            StmtKind::For(Box::new(For {
                target,
                iter,
                body,
                else_,
                test,
                recursive,
            })),
            lineno,
        ))
    }

    fn parse_if(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.expect("name:if")?.lineno;
        let mut branches: Vec<If> = Vec::new();
        let mut branch_line = lineno;
        let else_ = loop {
            let test = self.parse_tuple(false, false, &[], false)?;
            let body = self.parse_statements(&["name:elif", "name:else", "name:endif"], false)?;
            branches.push(If {
                test,
                body,
                elif: Vec::new(),
                else_: Vec::new(),
                lineno: branch_line,
            });
            let token = self.stream.advance()?;
            if token.is_name("elif") {
                branch_line = self.current().lineno;
                continue;
            }
            if token.is_name("else") {
                break self.parse_statements(&["name:endif"], true)?;
            }
            break Vec::new();
        };
        let mut branches = branches.into_iter();
        let Some(mut root) = branches.next() else {
            return Err(self.fail("expected if condition", lineno));
        };
        root.elif = branches.collect();
        root.else_ = else_;
        Ok(Stmt::new(StmtKind::If(Box::new(root)), lineno))
    }

    fn parse_with(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let mut targets = Vec::new();
        let mut values = Vec::new();
        while self.current().kind != TokenKind::BlockEnd {
            if !targets.is_empty() {
                self.stream.expect("comma")?;
            }
            let mut target = self.parse_assign_target(true, false, &[], false)?;
            target.set_ctx(NameCtx::Param);
            targets.push(target);
            self.stream.expect("assign")?;
            values.push(self.parse_expression(true)?);
        }
        let body = self.parse_statements(&["name:endwith"], true)?;
        Ok(Stmt::new(
            StmtKind::With(Box::new(With {
                targets,
                values,
                body,
            })),
            lineno,
        ))
    }

    fn parse_autoescape(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let value = self.parse_expression(true)?;
        let body = self.parse_statements(&["name:endautoescape"], true)?;
        let modifier = Stmt::new(
            StmtKind::ScopedEvalContextModifier {
                options: vec![Keyword {
                    key: "autoescape".into(),
                    value,
                }],
                body,
            },
            lineno,
        );
        Ok(Stmt::new(StmtKind::Scope(vec![modifier]), lineno))
    }

    fn parse_block(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let (name, _) = self.expect_name()?;
        let scoped = self.stream.skip_if("name:scoped")?;
        let required = self.stream.skip_if("name:required")?;
        if self.current().kind == TokenKind::Sub {
            return Err(self.fail(
                "Block names have to be valid identifiers and may not contain hyphens, use an \
                 underscore instead.",
                self.current().lineno,
            ));
        }
        let body = self.parse_statements(&["name:endblock"], true)?;
        if required {
            let only_whitespace = body.iter().all(|stmt| match &stmt.kind {
                StmtKind::Output(nodes) => nodes.iter().all(|node| {
                    matches!(&node.kind, ExprKind::TemplateData(data) if data.trim().is_empty())
                }),
                _ => false,
            });
            if !only_whitespace {
                return Err(self.fail_assertion(
                    "Required blocks can only contain comments or whitespace",
                    lineno,
                ));
            }
        }
        self.stream.skip_if(&format!("name:{}", name))?;
        Ok(Stmt::new(
            StmtKind::Block(Box::new(Block {
                name,
                body,
                scoped,
                required,
            })),
            lineno,
        ))
    }

    fn parse_extends(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let template = self.parse_expression(true)?;
        Ok(Stmt::new(StmtKind::Extends(template), lineno))
    }

    /// Parses an optional `with context` / `without context` suffix.
    fn parse_import_context(&mut self) -> JinjateResult<Option<bool>> {
        if self.current().test_any(&["name:with", "name:without"])
            && self.stream.look()?.test("name:context")
        {
            let with = self.stream.advance()?.is_name("with");
            self.stream.skip(1)?;
            return Ok(Some(with));
        }
        Ok(None)
    }

    fn parse_include(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let template = self.parse_expression(true)?;
        let ignore_missing = if self.current().test("name:ignore")
            && self.stream.look()?.test("name:missing")
        {
            self.stream.skip(2)?;
            true
        } else {
            false
        };
        let with_context = self.parse_import_context()?.unwrap_or(true);
        Ok(Stmt::new(
            StmtKind::Include(Box::new(Include {
                template,
                with_context,
                ignore_missing,
            })),
            lineno,
        ))
    }

    fn parse_import(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let template = self.parse_expression(true)?;
        self.stream.expect("name:as")?;
        let (target, _) = self.expect_name()?;
        let with_context = self.parse_import_context()?.unwrap_or(false);
        Ok(Stmt::new(
            StmtKind::Import(Box::new(Import {
                template,
                target,
                with_context,
            })),
            lineno,
        ))
    }

    fn parse_from(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let template = self.parse_expression(true)?;
        self.stream.expect("name:import")?;
        let mut names = Vec::new();
        let with_context = loop {
            if !names.is_empty() {
                self.stream.expect("comma")?;
            }
            if self.current().kind != TokenKind::Name {
                self.stream.expect("name")?;
                continue;
            }
            if let Some(with_context) = self.parse_import_context()? {
                break Some(with_context);
            }
            let (name, name_line) = self.expect_name()?;
            if name.starts_with('_') {
                return Err(self.fail_assertion(
                    "names starting with an underline can not be imported",
                    name_line,
                ));
            }
            let alias = if self.stream.skip_if("name:as")? {
                Some(self.expect_name()?.0)
            } else {
                None
            };
            names.push((name, alias));
            let with_context = self.parse_import_context()?;
            if with_context.is_some() || self.current().kind != TokenKind::Comma {
                break with_context;
            }
        };
        Ok(Stmt::new(
            StmtKind::FromImport(Box::new(FromImport {
                template,
                names,
                with_context: with_context.unwrap_or(false),
            })),
            lineno,
        ))
    }

    fn parse_signature(&mut self) -> JinjateResult<(Vec<Expr>, Vec<Expr>)> {
        let mut args = Vec::new();
        let mut defaults = Vec::new();
        self.stream.expect("lparen")?;
        while self.current().kind != TokenKind::RParen {
            if !args.is_empty() {
                self.stream.expect("comma")?;
            }
            let (name, lineno) = self.expect_name()?;
            let arg = Expr::name(&name, NameCtx::Param, lineno);
            if self.stream.skip_if("assign")? {
                defaults.push(self.parse_expression(true)?);
            } else if !defaults.is_empty() {
                return Err(self.fail("non-default argument follows default argument", lineno));
            }
            args.push(arg);
        }
        self.stream.expect("rparen")?;
        Ok((args, defaults))
    }

    fn parse_call_block(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let (args, defaults) = if self.current().kind == TokenKind::LParen {
            self.parse_signature()?
        } else {
            (Vec::new(), Vec::new())
        };
        let call = self.parse_expression(true)?;
        if !matches!(call.kind, ExprKind::Call(_)) {
            return Err(self.fail("expected call", lineno));
        }
        let body = self.parse_statements(&["name:endcall"], true)?;
        Ok(Stmt::new(
            StmtKind::CallBlock(Box::new(CallBlock {
                call,
                args,
                defaults,
                body,
            })),
            lineno,
        ))
    }

    fn parse_filter_block(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let Some(filter) = self.parse_filter(None, true)? else {
            return Err(self.fail("expected filter", lineno));
        };
        let body = self.parse_statements(&["name:endfilter"], true)?;
        Ok(Stmt::new(
            StmtKind::FilterBlock(Box::new(FilterBlock { body, filter })),
            lineno,
        ))
    }

    fn parse_macro(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let (name, _) = self.expect_name()?;
        let (args, defaults) = self.parse_signature()?;
        let body = self.parse_statements(&["name:endmacro"], true)?;
        Ok(Stmt::new(
            StmtKind::Macro(Box::new(Macro {
                name,
                args,
                defaults,
                body,
            })),
            lineno,
        ))
    }

    fn parse_print(&mut self) -> JinjateResult<Stmt> {
        let lineno = self.stream.advance()?.lineno;
        let mut nodes = Vec::new();
        while self.current().kind != TokenKind::BlockEnd {
            if !nodes.is_empty() {
                self.stream.expect("comma")?;
            }
            nodes.push(self.parse_expression(true)?);
        }
        Ok(Stmt::new(StmtKind::Output(nodes), lineno))
    }

    /// Parses an assignment target: a name, a tuple of targets, or (with `with_namespace`)
    /// a `namespace.attribute` reference.
    pub fn parse_assign_target(
        &mut self,
        with_tuple: bool,
        name_only: bool,
        extra_end_rules: &[&str],
        with_namespace: bool,
    ) -> JinjateResult<Expr> {
        let mut target = if name_only {
            let (name, lineno) = self.expect_name()?;
            Expr::name(&name, NameCtx::Store, lineno)
        } else if with_namespace && self.stream.look()?.kind == TokenKind::Dot {
            let (name, lineno) = self.expect_name()?;
            self.stream.advance()?;
            let (attr, _) = self.expect_name()?;
            Expr::new(ExprKind::NsRef { name, attr }, lineno)
        } else if with_tuple {
            self.parse_tuple(true, true, extra_end_rules, false)?
        } else {
            self.parse_primary()?
        };
        target.set_ctx(NameCtx::Store);
        if !target.can_assign() {
            return Err(self.fail(
                format!("can't assign to '{}'", target.node_name()),
                target.lineno,
            ));
        }
        Ok(target)
    }

    /// Parses an expression, optionally allowing inline `if`/`else`.
    pub fn parse_expression(&mut self, with_condexpr: bool) -> JinjateResult<Expr> {
        if with_condexpr {
            self.parse_condexpr()
        } else {
            self.parse_or()
        }
    }

    fn parse_condexpr(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let mut expr1 = self.parse_or()?;
        while self.stream.skip_if("name:if")? {
            let test = self.parse_or()?;
            let expr2 = if self.stream.skip_if("name:else")? {
                Some(Box::new(self.parse_condexpr()?))
            } else {
                None
            };
            expr1 = Expr::new(
                ExprKind::CondExpr {
                    test: Box::new(test),
                    expr1: Box::new(expr1),
                    expr2,
                },
                lineno,
            );
        }
        Ok(expr1)
    }

    fn parse_or(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let mut left = self.parse_and()?;
        while self.stream.skip_if("name:or")? {
            let right = self.parse_and()?;
            left = logic(LogicOp::Or, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let mut left = self.parse_not()?;
        while self.stream.skip_if("name:and")? {
            let right = self.parse_not()?;
            left = logic(LogicOp::And, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> JinjateResult<Expr> {
        if self.current().test("name:not") {
            let lineno = self.stream.advance()?.lineno;
            let node = self.parse_not()?;
            return Ok(unary(UnaryOp::Not, node, lineno));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let expr = self.parse_math1()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.current_kind() {
                TokenKind::Eq => Some(CmpOp::Eq),
                TokenKind::Ne => Some(CmpOp::Ne),
                TokenKind::Lt => Some(CmpOp::Lt),
                TokenKind::LtEq => Some(CmpOp::LtEq),
                TokenKind::Gt => Some(CmpOp::Gt),
                TokenKind::GtEq => Some(CmpOp::GtEq),
                _ => None,
            };
            let op = if let Some(op) = op {
                self.stream.advance()?;
                op
            } else if self.stream.skip_if("name:in")? {
                CmpOp::In
            } else if self.current().test("name:not") && self.stream.look()?.test("name:in") {
                self.stream.skip(2)?;
                CmpOp::NotIn
            } else {
                break;
            };
            let expr = self.parse_math1()?;
            ops.push(Operand { op, expr });
        }
        if ops.is_empty() {
            return Ok(expr);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                expr: Box::new(expr),
                ops,
            },
            lineno,
        ))
    }

    fn parse_math1(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.current_kind() {
                TokenKind::Add => BinOpKind::Add,
                TokenKind::Sub => BinOpKind::Sub,
                _ => break,
            };
            self.stream.advance()?;
            let right = self.parse_concat()?;
            left = binop(op, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let mut args = vec![self.parse_math2()?];
        while self.current().kind == TokenKind::Tilde {
            self.stream.advance()?;
            args.push(self.parse_math2()?);
        }
        if args.len() == 1 {
            if let Some(single) = args.pop() {
                return Ok(single);
            }
        }
        Ok(Expr::new(ExprKind::Concat(args), lineno))
    }

    fn parse_math2(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.current_kind() {
                TokenKind::Mul => BinOpKind::Mul,
                TokenKind::Div => BinOpKind::Div,
                TokenKind::FloorDiv => BinOpKind::FloorDiv,
                TokenKind::Mod => BinOpKind::Mod,
                _ => break,
            };
            self.stream.advance()?;
            let right = self.parse_pow()?;
            left = binop(op, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let mut left = self.parse_unary(true)?;
        while self.current().kind == TokenKind::Pow {
            self.stream.advance()?;
            let right = self.parse_unary(true)?;
            left = binop(BinOpKind::Pow, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_unary(&mut self, with_filter: bool) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let node = match self.current_kind() {
            TokenKind::Sub => {
                self.stream.advance()?;
                let node = self.parse_unary(false)?;
                unary(UnaryOp::Neg, node, lineno)
            }
            TokenKind::Add => {
                self.stream.advance()?;
                let node = self.parse_unary(false)?;
                unary(UnaryOp::Pos, node, lineno)
            }
            _ => self.parse_primary()?,
        };
        let node = self.parse_postfix(node)?;
        if with_filter {
            self.parse_filter_expr(node)
        } else {
            Ok(node)
        }
    }

    /// Parses a literal, a name, or a parenthesized / bracketed / braced expression.
    pub fn parse_primary(&mut self) -> JinjateResult<Expr> {
        let token = self.current().clone();
        let lineno = token.lineno;
        let node = match (&token.kind, &token.value) {
            (TokenKind::Name, TokenValue::Str(name)) => {
                self.stream.advance()?;
                match name.as_str() {
                    "true" | "True" => Expr::constant(Value::Bool(true), lineno),
                    "false" | "False" => Expr::constant(Value::Bool(false), lineno),
                    "none" | "None" => Expr::constant(Value::None, lineno),
                    _ => Expr::name(name, NameCtx::Load, lineno),
                }
            }
            (TokenKind::String, TokenValue::Str(first)) => {
                self.stream.advance()?;
                let mut buf = first.clone();
                while self.current().kind == TokenKind::String {
                    buf.push_str(self.current().str_value().unwrap_or_default());
                    self.stream.advance()?;
                }
                Expr::constant(Value::from(buf), lineno)
            }
            (TokenKind::Integer, TokenValue::Int(value)) => {
                self.stream.advance()?;
                Expr::constant(Value::Int(*value), lineno)
            }
            (TokenKind::Float, TokenValue::Float(value)) => {
                self.stream.advance()?;
                Expr::constant(Value::Float(*value), lineno)
            }
            (TokenKind::LParen, _) => {
                self.stream.advance()?;
                let node = self.parse_tuple(false, true, &[], true)?;
                self.stream.expect("rparen")?;
                node
            }
            (TokenKind::LBracket, _) => self.parse_list()?,
            (TokenKind::LBrace, _) => self.parse_dict()?,
            _ => {
                return Err(self.fail(format!("unexpected '{}'", token.describe()), lineno));
            }
        };
        Ok(node)
    }

    /// Parses comma separated expressions.
    ///
    /// - `simplified`: only primaries, as used for assignment targets.
    /// - `with_condexpr`: whether inline `if`/`else` is allowed in the items.
    /// - `extra_end_rules`: token expressions that end the tuple besides the closing tokens.
    /// - `explicit_parentheses`: the tuple sits inside `(...)`, where `()` and `(x,)` are tuples.
    ///
    /// Without parentheses a single expression with a trailing comma stays that expression.
    pub fn parse_tuple(
        &mut self,
        simplified: bool,
        with_condexpr: bool,
        extra_end_rules: &[&str],
        explicit_parentheses: bool,
    ) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let mut args = Vec::new();
        let mut is_tuple = false;
        loop {
            if !args.is_empty() {
                self.stream.expect("comma")?;
            }
            if self.is_tuple_end(extra_end_rules) {
                break;
            }
            let item = if simplified {
                self.parse_primary()?
            } else {
                self.parse_expression(with_condexpr)?
            };
            args.push(item);
            if self.current().kind == TokenKind::Comma {
                is_tuple = true;
            } else {
                break;
            }
        }
        if args.len() == 1 && (!is_tuple || !explicit_parentheses) {
            if let Some(single) = args.pop() {
                return Ok(single);
            }
        }
        if args.is_empty() && !explicit_parentheses {
            return Err(self.fail(
                format!(
                    "Expected an expression, got '{}'",
                    self.current().describe()
                ),
                self.current().lineno,
            ));
        }
        Ok(Expr::new(
            ExprKind::Tuple {
                items: args,
                ctx: NameCtx::Load,
            },
            lineno,
        ))
    }

    fn parse_list(&mut self) -> JinjateResult<Expr> {
        let lineno = self.stream.expect("lbracket")?.lineno;
        let mut items = Vec::new();
        while self.current().kind != TokenKind::RBracket {
            if !items.is_empty() {
                self.stream.expect("comma")?;
            }
            if self.current().kind == TokenKind::RBracket {
                break;
            }
            items.push(self.parse_expression(true)?);
        }
        self.stream.expect("rbracket")?;
        Ok(Expr::new(ExprKind::List(items), lineno))
    }

    fn parse_dict(&mut self) -> JinjateResult<Expr> {
        let lineno = self.stream.expect("lbrace")?.lineno;
        let mut items = Vec::new();
        while self.current().kind != TokenKind::RBrace {
            if !items.is_empty() {
                self.stream.expect("comma")?;
            }
            if self.current().kind == TokenKind::RBrace {
                break;
            }
            let key = self.parse_expression(true)?;
            self.stream.expect("colon")?;
            let value = self.parse_expression(true)?;
            items.push((key, value));
        }
        self.stream.expect("rbrace")?;
        Ok(Expr::new(ExprKind::Dict(items), lineno))
    }

    fn parse_postfix(&mut self, mut node: Expr) -> JinjateResult<Expr> {
        loop {
            node = match self.current_kind() {
                TokenKind::Dot | TokenKind::LBracket => self.parse_subscript(node)?,
                TokenKind::LParen => self.parse_call(node)?,
                _ => return Ok(node),
            };
        }
    }

    fn parse_filter_expr(&mut self, mut node: Expr) -> JinjateResult<Expr> {
        loop {
            node = match self.current_kind() {
                TokenKind::Pipe => match self.parse_filter(Some(node), false)? {
                    Some(filtered) => filtered,
                    None => return Err(self.fail("expected filter", self.current().lineno)),
                },
                TokenKind::Name if self.current().is_name("is") => self.parse_test(node)?,
                TokenKind::LParen => self.parse_call(node)?,
                _ => return Ok(node),
            };
        }
    }

    fn parse_subscript(&mut self, node: Expr) -> JinjateResult<Expr> {
        let token = self.stream.advance()?;
        let lineno = token.lineno;
        match token.kind {
            TokenKind::Dot => {
                let attr = self.stream.advance()?;
                match (&attr.kind, &attr.value) {
                    (TokenKind::Name, TokenValue::Str(name)) => Ok(Expr::new(
                        ExprKind::Getattr {
                            node: Box::new(node),
                            attr: name.clone(),
                        },
                        lineno,
                    )),
                    (TokenKind::Integer, TokenValue::Int(idx)) => Ok(Expr::new(
                        ExprKind::Getitem {
                            node: Box::new(node),
                            arg: Box::new(Expr::constant(Value::Int(*idx), attr.lineno)),
                        },
                        lineno,
                    )),
                    _ => Err(self.fail("expected name or number", attr.lineno)),
                }
            }
            TokenKind::LBracket => {
                let mut args = Vec::new();
                while self.current().kind != TokenKind::RBracket {
                    if !args.is_empty() {
                        self.stream.expect("comma")?;
                    }
                    args.push(self.parse_subscribed()?);
                }
                self.stream.expect("rbracket")?;
                let arg = if args.len() == 1 {
                    args.pop()
                        .ok_or_else(|| self.fail("expected subscript expression", lineno))?
                } else {
                    Expr::new(
                        ExprKind::Tuple {
                            items: args,
                            ctx: NameCtx::Load,
                        },
                        lineno,
                    )
                };
                Ok(Expr::new(
                    ExprKind::Getitem {
                        node: Box::new(node),
                        arg: Box::new(arg),
                    },
                    lineno,
                ))
            }
            _ => Err(self.fail("expected subscript expression", lineno)),
        }
    }

    fn parse_subscribed(&mut self) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let start = if self.current().kind == TokenKind::Colon {
            self.stream.advance()?;
            None
        } else {
            let node = self.parse_expression(true)?;
            if self.current().kind != TokenKind::Colon {
                return Ok(node);
            }
            self.stream.advance()?;
            Some(Box::new(node))
        };
        let stop = if matches!(
            self.current().kind,
            TokenKind::Colon | TokenKind::RBracket | TokenKind::Comma
        ) {
            None
        } else {
            Some(Box::new(self.parse_expression(true)?))
        };
        let step = if self.current().kind == TokenKind::Colon {
            self.stream.advance()?;
            if matches!(self.current().kind, TokenKind::RBracket | TokenKind::Comma) {
                None
            } else {
                Some(Box::new(self.parse_expression(true)?))
            }
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Slice { start, stop, step }, lineno))
    }

    fn parse_call_args(&mut self) -> JinjateResult<CallArgs> {
        let token = self.stream.expect("lparen")?;
        let mut call = CallArgs::default();
        let mut require_comma = false;
        let invalid = |parser: &Self| {
            parser.fail("invalid syntax for function call expression", token.lineno)
        };
        while self.current().kind != TokenKind::RParen {
            if require_comma {
                self.stream.expect("comma")?;
                if self.current().kind == TokenKind::RParen {
                    break;
                }
            }
            match self.current_kind() {
                TokenKind::Mul => {
                    if call.dyn_args.is_some() || call.dyn_kwargs.is_some() {
                        return Err(invalid(self));
                    }
                    self.stream.advance()?;
                    call.dyn_args = Some(Box::new(self.parse_expression(true)?));
                }
                TokenKind::Pow => {
                    if call.dyn_kwargs.is_some() {
                        return Err(invalid(self));
                    }
                    self.stream.advance()?;
                    call.dyn_kwargs = Some(Box::new(self.parse_expression(true)?));
                }
                TokenKind::Name if self.stream.look()?.kind == TokenKind::Assign => {
                    if call.dyn_kwargs.is_some() {
                        return Err(invalid(self));
                    }
                    let key = self.current().str_value().unwrap_or_default().to_string();
                    self.stream.skip(2)?;
                    let value = self.parse_expression(true)?;
                    call.kwargs.push(Keyword { key, value });
                }
                _ => {
                    if call.dyn_args.is_some()
                        || call.dyn_kwargs.is_some()
                        || !call.kwargs.is_empty()
                    {
                        return Err(invalid(self));
                    }
                    call.args.push(self.parse_expression(true)?);
                }
            }
            require_comma = true;
        }
        self.stream.expect("rparen")?;
        Ok(call)
    }

    fn parse_call(&mut self, node: Expr) -> JinjateResult<Expr> {
        let lineno = self.current().lineno;
        let args = self.parse_call_args()?;
        Ok(Expr::new(ExprKind::Call(Box::new(Call { node, args })), lineno))
    }

    fn parse_dotted_name(&mut self) -> JinjateResult<(String, usize)> {
        let (mut name, lineno) = self.expect_name()?;
        while self.current().kind == TokenKind::Dot {
            self.stream.advance()?;
            name.push('.');
            name.push_str(&self.expect_name()?.0);
        }
        Ok((name, lineno))
    }

    /// Parses `| name(args)` chains. With `start_inline` the first filter has no leading pipe.
    pub fn parse_filter(
        &mut self,
        mut node: Option<Expr>,
        mut start_inline: bool,
    ) -> JinjateResult<Option<Expr>> {
        while self.current().kind == TokenKind::Pipe || start_inline {
            if !start_inline {
                self.stream.advance()?;
            }
            let (name, lineno) = self.parse_dotted_name()?;
            let args = if self.current().kind == TokenKind::LParen {
                self.parse_call_args()?
            } else {
                CallArgs::default()
            };
            node = Some(Expr::new(
                ExprKind::Filter(Box::new(FilterCall { node, name, args })),
                lineno,
            ));
            start_inline = false;
        }
        Ok(node)
    }

    fn parse_test(&mut self, node: Expr) -> JinjateResult<Expr> {
        let lineno = self.stream.advance()?.lineno;
        let negated = self.stream.skip_if("name:not")?;
        let (name, _) = self.parse_dotted_name()?;
        let args = match self.current_kind() {
            TokenKind::LParen => self.parse_call_args()?,
            TokenKind::Name
            | TokenKind::String
            | TokenKind::Integer
            | TokenKind::Float
            | TokenKind::LBracket
            | TokenKind::LBrace
                if !self
                    .current()
                    .test_any(&["name:else", "name:or", "name:and"]) =>
            {
                if self.current().test("name:is") {
                    return Err(self.fail(
                        "You cannot chain multiple tests with is",
                        self.current().lineno,
                    ));
                }
                let arg = self.parse_primary()?;
                let arg = self.parse_postfix(arg)?;
                CallArgs {
                    args: vec![arg],
                    ..CallArgs::default()
                }
            }
            _ => CallArgs::default(),
        };
        let test = Expr::new(
            ExprKind::Test(Box::new(TestCall { node, name, args })),
            lineno,
        );
        Ok(if negated {
            unary(UnaryOp::Not, test, lineno)
        } else {
            test
        })
    }

    /// Parses template data and tags until one of `end_tokens` opens a tag (or to the end).
    pub fn subparse(&mut self, end_tokens: Option<&[&str]>) -> JinjateResult<Vec<Stmt>> {
        if let Some(end_tokens) = end_tokens {
            self.end_token_stack
                .push(end_tokens.iter().map(|t| (*t).to_string()).collect());
        }
        let result = self.subparse_inner(end_tokens);
        if end_tokens.is_some() {
            self.end_token_stack.pop();
        }
        result
    }

    fn subparse_inner(&mut self, end_tokens: Option<&[&str]>) -> JinjateResult<Vec<Stmt>> {
        let mut body = Vec::new();
        let mut data_buffer: Vec<Expr> = Vec::new();
        let flush = |body: &mut Vec<Stmt>, buffer: &mut Vec<Expr>| {
            if let Some(first) = buffer.first() {
                let lineno = first.lineno;
                body.push(Stmt::new(StmtKind::Output(std::mem::take(buffer)), lineno));
            }
        };
        loop {
            let token = self.current().clone();
            match token.kind {
                TokenKind::Eof => break,
                TokenKind::Data => {
                    if let TokenValue::Str(data) = token.value {
                        if !data.is_empty() {
                            data_buffer.push(Expr::new(ExprKind::TemplateData(data), token.lineno));
                        }
                    }
                    self.stream.advance()?;
                }
                TokenKind::VariableBegin => {
                    self.stream.advance()?;
                    data_buffer.push(self.parse_tuple(false, true, &[], false)?);
                    self.stream.expect("variable_end")?;
                }
                TokenKind::BlockBegin => {
                    flush(&mut body, &mut data_buffer);
                    self.stream.advance()?;
                    if let Some(end_tokens) = end_tokens {
                        if self.current().test_any(end_tokens) {
                            return Ok(body);
                        }
                    }
                    body.extend(self.parse_statement()?);
                    self.stream.expect("block_end")?;
                }
                _ => return Err(self.fail("internal parsing error", token.lineno)),
            }
        }
        flush(&mut body, &mut data_buffer);
        Ok(body)
    }

    /// Parses the whole template.
    pub fn parse(mut self) -> JinjateResult<Template> {
        let body = self.subparse(None)?;
        Ok(Template { body })
    }
}

fn logic(op: LogicOp, left: Expr, right: Expr, lineno: usize) -> Expr {
    Expr::new(
        ExprKind::Logic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        lineno,
    )
}

fn binop(op: BinOpKind, left: Expr, right: Expr, lineno: usize) -> Expr {
    Expr::new(
        ExprKind::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        lineno,
    )
}

fn unary(op: UnaryOp, node: Expr, lineno: usize) -> Expr {
    Expr::new(
        ExprKind::Unary {
            op,
            node: Box::new(node),
        },
        lineno,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        lexer::{Lexer, LexerConfig},
    };

    macro_rules! int {
        ($value:expr) => {
            Expr::constant(Value::Int($value), 1)
        };
    }

    macro_rules! name {
        ($name:expr) => {
            Expr::name($name, NameCtx::Load, 1)
        };
    }

    fn parse(source: &str) -> JinjateResult<Template> {
        let lexer = Arc::new(Lexer::new(LexerConfig::default())?);
        let stream = TokenStream::new(Box::new(lexer.tokenize(source)), Some("test"), None)?;
        let handlers = TagHandlers::new();
        Parser::new(stream, &handlers).parse()
    }

    fn parse_expr(source: &str) -> Expr {
        let template = parse(&format!("{{{{ {} }}}}", source)).unwrap();
        let Some(Stmt {
            kind: StmtKind::Output(mut nodes),
            ..
        }) = template.body.into_iter().next()
        else {
            panic!("expected output");
        };
        nodes.remove(0)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_input() {
        assert_eq!(parse("").unwrap(), Template { body: vec![] });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_data_and_variables_share_an_output() {
        let template = parse("Hello {{ name }}!").unwrap();
        assert_eq!(
            template.body,
            vec![Stmt::new(
                StmtKind::Output(vec![
                    Expr::new(ExprKind::TemplateData("Hello ".into()), 1),
                    name!("name"),
                    Expr::new(ExprKind::TemplateData("!".into()), 1),
                ]),
                1
            )]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_precedence() {
        assert_eq!(
            parse_expr("1 + 2 * 3"),
            binop(
                BinOpKind::Add,
                int!(1),
                binop(BinOpKind::Mul, int!(2), int!(3), 1),
                1
            )
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tuples_need_parentheses_for_one_item() {
        assert_eq!(
            parse_expr("(1,)"),
            Expr::new(
                ExprKind::Tuple {
                    items: vec![int!(1)],
                    ctx: NameCtx::Load
                },
                1
            )
        );
        assert_eq!(parse_expr("(1)"), int!(1));
        assert_eq!(parse_expr("1,"), int!(1));
        assert!(matches!(
            parse_expr("1, 2").kind,
            ExprKind::Tuple { ref items, .. } if items.len() == 2
        ));
        assert!(matches!(
            parse_expr("()").kind,
            ExprKind::Tuple { ref items, .. } if items.is_empty()
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compare_chain() {
        let expr = parse_expr("a < b <= c not in d");
        let ExprKind::Compare { ops, .. } = expr.kind else {
            panic!("expected compare");
        };
        let ops: Vec<CmpOp> = ops.iter().map(|op| op.op).collect();
        assert_eq!(ops, vec![CmpOp::Lt, CmpOp::LtEq, CmpOp::NotIn]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_filters_and_tests() {
        let expr = parse_expr("x|default('a')|upper is not divisibleby 3");
        let ExprKind::Unary {
            op: UnaryOp::Not,
            node,
        } = expr.kind
        else {
            panic!("expected negated test");
        };
        let ExprKind::Test(test) = node.kind else {
            panic!("expected test");
        };
        assert_eq!(test.name, "divisibleby");
        assert_eq!(test.args.args, vec![int!(3)]);
        let ExprKind::Filter(filter) = test.node.kind else {
            panic!("expected filter");
        };
        assert_eq!(filter.name, "upper");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_slices_and_subscripts() {
        assert!(matches!(
            parse_expr("a[1:]").kind,
            ExprKind::Getitem { ref arg, .. }
                if matches!(arg.kind, ExprKind::Slice { ref start, stop: None, step: None } if start.is_some())
        ));
        assert!(matches!(
            parse_expr("a.0").kind,
            ExprKind::Getitem { ref arg, .. } if **arg == int!(0)
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_call_argument_order() {
        let err = parse("{{ f(a=1, 2) }}").unwrap_err();
        assert_eq!(err.message(), "invalid syntax for function call expression");
        let expr = parse_expr("f(1, b=2, *c, **d)");
        let ExprKind::Call(call) = expr.kind else {
            panic!("expected call");
        };
        assert_eq!(call.args.args.len(), 1);
        assert_eq!(call.args.kwargs.len(), 1);
        assert!(call.args.dyn_args.is_some() && call.args.dyn_kwargs.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_literal_concatenation() {
        assert_eq!(
            parse_expr("'a' \"b\""),
            Expr::constant(Value::from("ab"), 1)
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_statements() {
        let template = parse(
            "{% for a, b in items if a recursive %}{% else %}x{% endfor %}\
             {% set ns.count = 1 %}{% macro m(x, y=2) %}{% endmacro %}\
             {% from 'f' import a as b, c with context %}{% block title required %} {% endblock title %}",
        )
        .unwrap();
        let kinds: Vec<&str> = template
            .body
            .iter()
            .map(|stmt| match &stmt.kind {
                StmtKind::For(node) if node.recursive && node.test.is_some() => "for",
                StmtKind::Assign { target, .. }
                    if matches!(target.kind, ExprKind::NsRef { .. }) =>
                {
                    "nsassign"
                }
                StmtKind::Macro(node) if node.defaults.len() == 1 => "macro",
                StmtKind::FromImport(node) if node.with_context && node.names.len() == 2 => "from",
                StmtKind::Block(node) if node.required => "block",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["for", "nsassign", "macro", "from", "block"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_from_import_context_suffix() {
        let imports = |source: &str| {
            let template = parse(source).unwrap();
            let StmtKind::FromImport(node) = &template.body[0].kind else {
                panic!("expected a from-import");
            };
            (node.names.len(), node.with_context)
        };
        assert_eq!(imports("{% from 'f' import a, b %}"), (2, false));
        assert_eq!(imports("{% from 'f' import a, with context %}"), (1, true));
        assert_eq!(imports("{% from 'f' import with context %}"), (0, true));
        assert_eq!(imports("{% from 'f' import a without context %}"), (1, false));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_elif_else() {
        let template = parse("{% if a %}1{% elif b %}2{% elif c %}3{% else %}4{% endif %}").unwrap();
        let StmtKind::If(node) = &template.body[0].kind else {
            panic!("expected if");
        };
        assert_eq!(node.elif.len(), 2);
        assert_eq!(node.else_.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_messages() {
        let err = parse("{% for x in y %}").unwrap_err();
        assert_eq!(
            err.message(),
            "Unexpected end of template. The parser was looking for the following tags: \
             'endfor' or 'else'. The innermost block that needs to be closed is 'for'."
        );
        assert_eq!(err.name(), Some("test"));

        let err = parse("{% if x %}{% endfor %}{% endif %}").unwrap_err();
        assert_eq!(
            err.message(),
            "Encountered unknown tag 'endfor'. The parser was looking for the following tags: \
             'elif' or 'else' or 'endif'. The innermost block that needs to be closed is 'if'."
        );

        let err = parse("{% if x %}{% for y in z %}{% endif %}{% endfor %}{% endif %}").unwrap_err();
        assert_eq!(
            err.message(),
            "Encountered unknown tag 'endif'. You probably made a nesting mistake. This tag is \
             expected, but the parser is currently looking for 'endfor' or 'else'. The innermost \
             block that needs to be closed is 'for'."
        );

        let err = parse("\n\n{% foo %}").unwrap_err();
        assert_eq!(err.lineno(), Some(3));
        assert_eq!(err.message(), "Encountered unknown tag 'foo'.");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_is_not_a_valid_target() {
        let err = parse("{% for loop in x %}{% endfor %}").unwrap_err();
        assert!(err.kind().is_syntax_error());
        assert_eq!(
            err.message(),
            "Can't assign to special loop variable in for-loop target"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_required_block_body() {
        let err = parse("{% block b required %}text{% endblock %}").unwrap_err();
        assert_eq!(
            err.message(),
            "Required blocks can only contain comments or whitespace"
        );
        assert_eq!(err.kind(), ErrorKind::TemplateAssertion);
        assert!(err.kind().is_syntax_error());
        let err = parse("{% block my-block %}{% endblock %}").unwrap_err();
        assert!(err.message().starts_with("Block names have to be valid identifiers"));
    }
}
