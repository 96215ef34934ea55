use std::{collections::HashSet, ops::ControlFlow};

use crate::value::{BinOpKind, CmpOp, Value};

/// How a name is used at the place it appears.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NameCtx {
    Load,
    Store,
    /// Bound by a signature: macro and call block arguments, `with` targets.
    Param,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

/// The root of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Template data and `{{ ... }}` expressions, in source order.
    Output(Vec<Expr>),
    For(Box<For>),
    If(Box<If>),
    Macro(Box<Macro>),
    CallBlock(Box<CallBlock>),
    FilterBlock(Box<FilterBlock>),
    With(Box<With>),
    Block(Box<Block>),
    Extends(Expr),
    Include(Box<Include>),
    Import(Box<Import>),
    FromImport(Box<FromImport>),
    /// An expression evaluated for its side effects (`{% do %}`).
    ExprStmt(Expr),
    Assign {
        target: Expr,
        node: Expr,
    },
    AssignBlock(Box<AssignBlock>),
    Break,
    Continue,
    /// An artificial scope.
    Scope(Vec<Stmt>),
    /// Changes evaluation context options (only `autoescape`) for the body.
    ScopedEvalContextModifier {
        options: Vec<Keyword>,
        body: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Name {
        name: String,
        ctx: NameCtx,
    },
    /// `ns.attr` as an assignment target.
    NsRef {
        name: String,
        attr: String,
    },
    Const(Value),
    TemplateData(String),
    Tuple {
        items: Vec<Expr>,
        ctx: NameCtx,
    },
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    CondExpr {
        test: Box<Expr>,
        expr1: Box<Expr>,
        expr2: Option<Box<Expr>>,
    },
    Filter(Box<FilterCall>),
    Test(Box<TestCall>),
    Call(Box<Call>),
    Getitem {
        node: Box<Expr>,
        arg: Box<Expr>,
    },
    Getattr {
        node: Box<Expr>,
        attr: String,
    },
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    /// `a ~ b ~ c`
    Concat(Vec<Expr>),
    Compare {
        expr: Box<Expr>,
        ops: Vec<Operand>,
    },
    BinOp {
        op: BinOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logic {
        op: LogicOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        node: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub op: CmpOp,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub key: String,
    pub value: Expr,
}

/// Arguments at a call site.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallArgs {
    pub args: Vec<Expr>,
    pub kwargs: Vec<Keyword>,
    pub dyn_args: Option<Box<Expr>>,
    pub dyn_kwargs: Option<Box<Expr>>,
}

impl CallArgs {
    fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.args
            .iter()
            .chain(self.kwargs.iter().map(|kw| &kw.value))
            .chain(self.dyn_args.as_deref())
            .chain(self.dyn_kwargs.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    /// `None` inside a filter block, where the body output is filtered.
    pub node: Option<Expr>,
    pub name: String,
    pub args: CallArgs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCall {
    pub node: Expr,
    pub name: String,
    pub args: CallArgs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub node: Expr,
    pub args: CallArgs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct For {
    pub target: Expr,
    pub iter: Expr,
    pub body: Vec<Stmt>,
    pub else_: Vec<Stmt>,
    pub test: Option<Expr>,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct If {
    pub test: Expr,
    pub body: Vec<Stmt>,
    pub elif: Vec<If>,
    pub else_: Vec<Stmt>,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    pub name: String,
    pub args: Vec<Expr>,
    pub defaults: Vec<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallBlock {
    pub call: Expr,
    pub args: Vec<Expr>,
    pub defaults: Vec<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterBlock {
    pub body: Vec<Stmt>,
    pub filter: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct With {
    pub targets: Vec<Expr>,
    pub values: Vec<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub body: Vec<Stmt>,
    pub scoped: bool,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub template: Expr,
    pub with_context: bool,
    pub ignore_missing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub template: Expr,
    pub target: String,
    pub with_context: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromImport {
    pub template: Expr,
    /// `(name, alias)` pairs.
    pub names: Vec<(String, Option<String>)>,
    pub with_context: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignBlock {
    pub target: Expr,
    pub filter: Option<Expr>,
    pub body: Vec<Stmt>,
}

impl Stmt {
    pub const fn new(kind: StmtKind, lineno: usize) -> Self {
        Self { kind, lineno }
    }
}

impl Expr {
    pub const fn new(kind: ExprKind, lineno: usize) -> Self {
        Self { kind, lineno }
    }

    pub fn name(name: &str, ctx: NameCtx, lineno: usize) -> Self {
        Self::new(
            ExprKind::Name {
                name: name.to_string(),
                ctx,
            },
            lineno,
        )
    }

    pub const fn constant(value: Value, lineno: usize) -> Self {
        Self::new(ExprKind::Const(value), lineno)
    }

    /// Marks every name in an assignment target with `ctx`.
    pub fn set_ctx(&mut self, new_ctx: NameCtx) {
        match &mut self.kind {
            ExprKind::Name { ctx, .. } => *ctx = new_ctx,
            ExprKind::Tuple { items, ctx } => {
                *ctx = new_ctx;
                for item in items {
                    item.set_ctx(new_ctx);
                }
            }
            _ => {}
        }
    }

    pub fn can_assign(&self) -> bool {
        match &self.kind {
            ExprKind::Name { name, .. } => {
                !matches!(name.as_str(), "true" | "false" | "none" | "True" | "False" | "None")
            }
            ExprKind::NsRef { .. } => true,
            ExprKind::Tuple { items, .. } => items.iter().all(Self::can_assign),
            _ => false,
        }
    }

    /// The lowercase node name used in "can't assign to" errors.
    pub const fn node_name(&self) -> &'static str {
        match &self.kind {
            ExprKind::Name { .. } => "name",
            ExprKind::NsRef { .. } => "nsref",
            ExprKind::Const(_) => "const",
            ExprKind::TemplateData(_) => "templatedata",
            ExprKind::Tuple { .. } => "tuple",
            ExprKind::List(_) => "list",
            ExprKind::Dict(_) => "dict",
            ExprKind::CondExpr { .. } => "condexpr",
            ExprKind::Filter(_) => "filter",
            ExprKind::Test(_) => "test",
            ExprKind::Call(_) => "call",
            ExprKind::Getitem { .. } => "getitem",
            ExprKind::Getattr { .. } => "getattr",
            ExprKind::Slice { .. } => "slice",
            ExprKind::Concat(_) => "concat",
            ExprKind::Compare { .. } => "compare",
            ExprKind::BinOp { .. } => "binop",
            ExprKind::Logic { .. } => "logic",
            ExprKind::Unary { .. } => "unaryop",
        }
    }
}

/// A read-only walk over the tree.
///
/// The default methods visit every child in source order; override a method and call the
/// matching `walk_*` function to keep descending. Returning `ControlFlow::Break` stops the walk.
pub trait Visitor {
    fn visit_stmt(&mut self, stmt: &Stmt) -> ControlFlow<()> {
        walk_stmt(self, stmt)
    }

    fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        walk_expr(self, expr)
    }
}

pub fn walk_stmts<V: Visitor + ?Sized>(visitor: &mut V, stmts: &[Stmt]) -> ControlFlow<()> {
    for stmt in stmts {
        visitor.visit_stmt(stmt)?;
    }
    ControlFlow::Continue(())
}

fn walk_exprs<'a, V, I>(visitor: &mut V, exprs: I) -> ControlFlow<()>
where
    V: Visitor + ?Sized,
    I: IntoIterator<Item = &'a Expr>,
{
    for expr in exprs {
        visitor.visit_expr(expr)?;
    }
    ControlFlow::Continue(())
}

fn walk_if<V: Visitor + ?Sized>(visitor: &mut V, node: &If) -> ControlFlow<()> {
    visitor.visit_expr(&node.test)?;
    walk_stmts(visitor, &node.body)?;
    for elif in &node.elif {
        walk_if(visitor, elif)?;
    }
    walk_stmts(visitor, &node.else_)
}

pub fn walk_stmt<V: Visitor + ?Sized>(visitor: &mut V, stmt: &Stmt) -> ControlFlow<()> {
    match &stmt.kind {
        StmtKind::Output(nodes) => walk_exprs(visitor, nodes),
        StmtKind::For(node) => {
            visitor.visit_expr(&node.target)?;
            visitor.visit_expr(&node.iter)?;
            walk_stmts(visitor, &node.body)?;
            walk_stmts(visitor, &node.else_)?;
            walk_exprs(visitor, &node.test)
        }
        StmtKind::If(node) => walk_if(visitor, node),
        StmtKind::Macro(node) => {
            walk_exprs(visitor, &node.args)?;
            walk_exprs(visitor, &node.defaults)?;
            walk_stmts(visitor, &node.body)
        }
        StmtKind::CallBlock(node) => {
            visitor.visit_expr(&node.call)?;
            walk_exprs(visitor, &node.args)?;
            walk_exprs(visitor, &node.defaults)?;
            walk_stmts(visitor, &node.body)
        }
        StmtKind::FilterBlock(node) => {
            walk_stmts(visitor, &node.body)?;
            visitor.visit_expr(&node.filter)
        }
        StmtKind::With(node) => {
            walk_exprs(visitor, &node.targets)?;
            walk_exprs(visitor, &node.values)?;
            walk_stmts(visitor, &node.body)
        }
        StmtKind::Block(node) => walk_stmts(visitor, &node.body),
        StmtKind::Extends(template) => visitor.visit_expr(template),
        StmtKind::Include(node) => visitor.visit_expr(&node.template),
        StmtKind::Import(node) => visitor.visit_expr(&node.template),
        StmtKind::FromImport(node) => visitor.visit_expr(&node.template),
        StmtKind::ExprStmt(node) => visitor.visit_expr(node),
        StmtKind::Assign { target, node } => {
            visitor.visit_expr(target)?;
            visitor.visit_expr(node)
        }
        StmtKind::AssignBlock(node) => {
            visitor.visit_expr(&node.target)?;
            walk_exprs(visitor, &node.filter)?;
            walk_stmts(visitor, &node.body)
        }
        StmtKind::Break | StmtKind::Continue => ControlFlow::Continue(()),
        StmtKind::Scope(body) => walk_stmts(visitor, body),
        StmtKind::ScopedEvalContextModifier { options, body } => {
            walk_exprs(visitor, options.iter().map(|kw| &kw.value))?;
            walk_stmts(visitor, body)
        }
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) -> ControlFlow<()> {
    match &expr.kind {
        ExprKind::Name { .. }
        | ExprKind::NsRef { .. }
        | ExprKind::Const(_)
        | ExprKind::TemplateData(_) => ControlFlow::Continue(()),
        ExprKind::Tuple { items, .. } | ExprKind::List(items) | ExprKind::Concat(items) => {
            walk_exprs(visitor, items)
        }
        ExprKind::Dict(items) => {
            for (key, value) in items {
                visitor.visit_expr(key)?;
                visitor.visit_expr(value)?;
            }
            ControlFlow::Continue(())
        }
        ExprKind::CondExpr { test, expr1, expr2 } => {
            visitor.visit_expr(test)?;
            visitor.visit_expr(expr1)?;
            walk_exprs(visitor, expr2.as_deref())
        }
        ExprKind::Filter(filter) => {
            walk_exprs(visitor, &filter.node)?;
            walk_exprs(visitor, filter.args.exprs())
        }
        ExprKind::Test(test) => {
            visitor.visit_expr(&test.node)?;
            walk_exprs(visitor, test.args.exprs())
        }
        ExprKind::Call(call) => {
            visitor.visit_expr(&call.node)?;
            walk_exprs(visitor, call.args.exprs())
        }
        ExprKind::Getitem { node, arg } => {
            visitor.visit_expr(node)?;
            visitor.visit_expr(arg)
        }
        ExprKind::Getattr { node, .. } => visitor.visit_expr(node),
        ExprKind::Slice { start, stop, step } => walk_exprs(
            visitor,
            start
                .as_deref()
                .into_iter()
                .chain(stop.as_deref())
                .chain(step.as_deref()),
        ),
        ExprKind::Compare { expr, ops } => {
            visitor.visit_expr(expr)?;
            walk_exprs(visitor, ops.iter().map(|op| &op.expr))
        }
        ExprKind::BinOp { left, right, .. } | ExprKind::Logic { left, right, .. } => {
            visitor.visit_expr(left)?;
            visitor.visit_expr(right)
        }
        ExprKind::Unary { node, .. } => visitor.visit_expr(node),
    }
}

/// The direct child expressions of an expression, in source order.
pub fn child_exprs(expr: &Expr) -> Vec<&Expr> {
    let mut out: Vec<&Expr> = Vec::new();
    match &expr.kind {
        ExprKind::Name { .. }
        | ExprKind::NsRef { .. }
        | ExprKind::Const(_)
        | ExprKind::TemplateData(_) => {}
        ExprKind::Tuple { items, .. } | ExprKind::List(items) | ExprKind::Concat(items) => {
            out.extend(items);
        }
        ExprKind::Dict(items) => {
            for (key, value) in items {
                out.push(key);
                out.push(value);
            }
        }
        ExprKind::CondExpr { test, expr1, expr2 } => {
            out.push(test);
            out.push(expr1);
            out.extend(expr2.as_deref());
        }
        ExprKind::Filter(filter) => {
            out.extend(&filter.node);
            out.extend(filter.args.exprs());
        }
        ExprKind::Test(test) => {
            out.push(&test.node);
            out.extend(test.args.exprs());
        }
        ExprKind::Call(call) => {
            out.push(&call.node);
            out.extend(call.args.exprs());
        }
        ExprKind::Getitem { node, arg } => {
            out.push(node);
            out.push(arg);
        }
        ExprKind::Getattr { node, .. } | ExprKind::Unary { node, .. } => out.push(node),
        ExprKind::Slice { start, stop, step } => {
            out.extend(start.as_deref());
            out.extend(stop.as_deref());
            out.extend(step.as_deref());
        }
        ExprKind::Compare { expr, ops } => {
            out.push(expr);
            out.extend(ops.iter().map(|op| &op.expr));
        }
        ExprKind::BinOp { left, right, .. } | ExprKind::Logic { left, right, .. } => {
            out.push(left);
            out.push(right);
        }
    }
    out
}

struct BlockCollector<'a> {
    blocks: Vec<(&'a Block, usize)>,
}

impl<'a> BlockCollector<'a> {
    fn collect(&mut self, stmts: &'a [Stmt]) {
        for stmt in stmts {
            if let StmtKind::Block(block) = &stmt.kind {
                self.blocks.push((block, stmt.lineno));
            }
            for child in child_bodies(stmt) {
                self.collect(child);
            }
        }
    }
}

/// The statement bodies directly owned by a statement.
pub fn child_bodies(stmt: &Stmt) -> Vec<&[Stmt]> {
    fn if_bodies<'a>(node: &'a If, out: &mut Vec<&'a [Stmt]>) {
        out.push(&node.body);
        for elif in &node.elif {
            if_bodies(elif, out);
        }
        out.push(&node.else_);
    }

    let mut out: Vec<&[Stmt]> = Vec::new();
    match &stmt.kind {
        StmtKind::For(node) => {
            out.push(&node.body);
            out.push(&node.else_);
        }
        StmtKind::If(node) => if_bodies(node, &mut out),
        StmtKind::Macro(node) => out.push(&node.body),
        StmtKind::CallBlock(node) => out.push(&node.body),
        StmtKind::FilterBlock(node) => out.push(&node.body),
        StmtKind::With(node) => out.push(&node.body),
        StmtKind::Block(node) => out.push(&node.body),
        StmtKind::AssignBlock(node) => out.push(&node.body),
        StmtKind::Scope(body) | StmtKind::ScopedEvalContextModifier { body, .. } => {
            out.push(body);
        }
        StmtKind::Output(_)
        | StmtKind::Extends(_)
        | StmtKind::Include(_)
        | StmtKind::Import(_)
        | StmtKind::FromImport(_)
        | StmtKind::ExprStmt(_)
        | StmtKind::Assign { .. }
        | StmtKind::Break
        | StmtKind::Continue => {}
    }
    out
}

/// Every `{% block %}` in the tree, at any depth, with its line number.
pub fn find_blocks(stmts: &[Stmt]) -> Vec<(&Block, usize)> {
    let mut collector = BlockCollector { blocks: Vec::new() };
    collector.collect(stmts);
    collector.blocks
}

struct UndeclaredNames {
    names: HashSet<String>,
    undeclared: HashSet<String>,
}

impl Visitor for UndeclaredNames {
    fn visit_stmt(&mut self, stmt: &Stmt) -> ControlFlow<()> {
        match &stmt.kind {
            StmtKind::Block(_) => ControlFlow::Continue(()),
            _ => walk_stmt(self, stmt),
        }
    }

    fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let ExprKind::Name { name, ctx } = &expr.kind {
            if *ctx == NameCtx::Load && self.names.contains(name) {
                self.undeclared.insert(name.clone());
                if self.undeclared == self.names {
                    return ControlFlow::Break(());
                }
            } else {
                self.names.remove(name);
            }
            return ControlFlow::Continue(());
        }
        walk_expr(self, expr)
    }
}

/// Which of `names` are read in `stmts` before being bound. Nested blocks are not inspected.
pub fn find_undeclared(stmts: &[Stmt], names: &[&str]) -> HashSet<String> {
    let mut visitor = UndeclaredNames {
        names: names.iter().map(|name| (*name).to_string()).collect(),
        undeclared: HashSet::new(),
    };
    let _ = walk_stmts(&mut visitor, stmts);
    visitor.undeclared
}

struct NameStores<'n> {
    name: &'n str,
    found: Option<usize>,
}

impl Visitor for NameStores<'_> {
    fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let ExprKind::Name { name, ctx } = &expr.kind {
            if *ctx == NameCtx::Store && name == self.name {
                self.found = Some(expr.lineno);
                return ControlFlow::Break(());
            }
        }
        walk_expr(self, expr)
    }
}

/// The line of the first assignment to `name` in the statement, if any.
pub fn find_store(stmt: &Stmt, name: &str) -> Option<usize> {
    let mut visitor = NameStores { name, found: None };
    let _ = visitor.visit_stmt(stmt);
    visitor.found
}

/// Whether an expression (an assignment target) stores to `name`.
pub fn expr_stores(expr: &Expr, name: &str) -> bool {
    let mut visitor = NameStores { name, found: None };
    let _ = visitor.visit_expr(expr);
    visitor.found.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(name: &str, ctx: NameCtx) -> Stmt {
        Stmt::new(StmtKind::Output(vec![Expr::name(name, ctx, 1)]), 1)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_find_blocks_descends_into_bodies() {
        let inner = Stmt::new(
            StmtKind::Block(Box::new(Block {
                name: "inner".into(),
                body: vec![],
                scoped: false,
                required: false,
            })),
            2,
        );
        let outer = Stmt::new(
            StmtKind::Block(Box::new(Block {
                name: "outer".into(),
                body: vec![inner],
                scoped: false,
                required: false,
            })),
            1,
        );
        let names: Vec<(&str, usize)> = find_blocks(std::slice::from_ref(&outer))
            .into_iter()
            .map(|(block, line)| (block.name.as_str(), line))
            .collect();
        assert_eq!(names, vec![("outer", 1), ("inner", 2)]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_find_undeclared_skips_blocks_and_stores() {
        let body = vec![
            output("caller", NameCtx::Load),
            output("varargs", NameCtx::Store),
            output("varargs", NameCtx::Load),
            Stmt::new(
                StmtKind::Block(Box::new(Block {
                    name: "b".into(),
                    body: vec![output("kwargs", NameCtx::Load)],
                    scoped: false,
                    required: false,
                })),
                1,
            ),
        ];
        let found = find_undeclared(&body, &["caller", "varargs", "kwargs"]);
        assert_eq!(found, HashSet::from(["caller".to_string()]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_ctx_and_can_assign() {
        let mut target = Expr::new(
            ExprKind::Tuple {
                items: vec![Expr::name("a", NameCtx::Load, 1), Expr::name("b", NameCtx::Load, 1)],
                ctx: NameCtx::Load,
            },
            1,
        );
        target.set_ctx(NameCtx::Store);
        assert!(target.can_assign());
        assert_eq!(find_store(&Stmt::new(StmtKind::ExprStmt(target), 1), "b"), Some(1));
        assert!(!Expr::constant(Value::from(1), 1).can_assign());
    }
}
