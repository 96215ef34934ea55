//! Static scope analysis: decides how every name in a compiled scope gets its initial value.
//!
//! Each scope the compiler opens owns a [`Symbols`] table stored in a [`SymbolArena`]. Tables
//! point at their parent by id; a table is analyzed while detached from the arena so that
//! branch copies can be taken and merged without aliasing the parent chain.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::{
    ast::{AssignBlock, Expr, ExprKind, FilterBlock, For, If, NameCtx, Stmt, StmtKind, With},
    error::{Error, ErrorKind, JinjateResult},
};

/// A reference to a variable slot. Two names with the same `level` and `name` in the same unit
/// share one slot, which is what lets sibling branches store into the same variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    /// Nesting depth of the compiled unit that owns the slot.
    pub depth: usize,
    pub level: usize,
    pub name: String,
}

/// How a reference is initialized when its scope is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadInstruction {
    /// Bound by the scope itself: a signature argument or a loop target.
    Param,
    /// Looked up by name in the render context.
    Resolve(String),
    /// Copied from a reference that is live in an enclosing scope.
    Alias(Ref),
    /// Starts out missing until a store runs.
    Undefined,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SymbolsId(usize);

#[derive(Debug, Clone, Default)]
pub struct Symbols {
    parent: Option<SymbolsId>,
    level: usize,
    depth: usize,
    refs: IndexMap<String, Ref>,
    loads: IndexMap<Ref, LoadInstruction>,
    stores: BTreeSet<String>,
}

impl Symbols {
    /// Load instructions in definition order.
    pub fn loads(&self) -> impl Iterator<Item = (&Ref, &LoadInstruction)> {
        self.loads.iter()
    }

    fn define_ref(&mut self, name: &str, load: LoadInstruction) -> Ref {
        let ident = Ref {
            depth: self.depth,
            level: self.level,
            name: name.to_string(),
        };
        self.refs.insert(name.to_string(), ident.clone());
        self.loads.insert(ident.clone(), load);
        ident
    }
}

/// Owner of every symbol table created while compiling one template.
#[derive(Debug, Default)]
pub struct SymbolArena {
    tables: Vec<Symbols>,
}

/// Which part of a loop a table is analyzed for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForBranch {
    Body,
    Else,
    Test,
}

/// The node a fresh table is analyzed from.
#[derive(Debug, Clone, Copy)]
pub enum ScopeNode<'a> {
    /// The template root, a block body, or an artificial scope.
    Body(&'a [Stmt]),
    /// A macro or call block signature with its body.
    Callable {
        args: &'a [Expr],
        defaults: &'a [Expr],
        body: &'a [Stmt],
    },
    For(&'a For, ForBranch),
    With(&'a With),
    FilterBlock(&'a FilterBlock),
    AssignBlock(&'a AssignBlock),
}

impl SymbolArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with no parent, owned by the unit at `depth`.
    pub fn root(&mut self, depth: usize) -> SymbolsId {
        self.push(Symbols {
            depth,
            ..Symbols::default()
        })
    }

    /// A table one level below `parent`.
    pub fn child(&mut self, parent: SymbolsId, depth: usize) -> SymbolsId {
        let level = self.get(parent).level.saturating_add(1);
        self.push(Symbols {
            parent: Some(parent),
            level,
            depth,
            ..Symbols::default()
        })
    }

    fn push(&mut self, symbols: Symbols) -> SymbolsId {
        self.tables.push(symbols);
        SymbolsId(self.tables.len().saturating_sub(1))
    }

    pub fn get(&self, id: SymbolsId) -> &Symbols {
        &self.tables[id.0]
    }

    fn get_mut(&mut self, id: SymbolsId) -> &mut Symbols {
        &mut self.tables[id.0]
    }

    /// The reference `name` is bound to, searching enclosing tables.
    pub fn find_ref(&self, id: SymbolsId, name: &str) -> Option<&Ref> {
        let symbols = self.get(id);
        symbols
            .refs
            .get(name)
            .or_else(|| symbols.parent.and_then(|parent| self.find_ref(parent, name)))
    }

    /// Like [`Self::find_ref`], but a name the analysis never saw is an internal error.
    pub fn lookup(&self, id: SymbolsId, name: &str) -> JinjateResult<Ref> {
        self.find_ref(id, name).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::TemplateAssertion,
                format!(
                    "Tried to resolve a name to a reference that was unknown to the frame ('{}')",
                    name
                ),
            )
        })
    }

    pub fn declare_parameter(&mut self, id: SymbolsId, name: &str) -> Ref {
        let symbols = self.get_mut(id);
        symbols.stores.insert(name.to_string());
        symbols.define_ref(name, LoadInstruction::Param)
    }

    /// Every name stored in this table or an enclosing one, resolved from `id`, sorted by name.
    pub fn dump_stores(&self, id: SymbolsId) -> IndexMap<String, Ref> {
        let mut rv: IndexMap<String, Ref> = IndexMap::new();
        let mut node = Some(id);
        while let Some(current) = node {
            let symbols = self.get(current);
            for name in &symbols.stores {
                if !rv.contains_key(name) {
                    if let Some(target) = self.find_ref(id, name) {
                        rv.insert(name.clone(), target.clone());
                    }
                }
            }
            node = symbols.parent;
        }
        rv.sort_keys();
        rv
    }

    /// Runs the analysis for `node` into the table `id`.
    pub fn analyze(&mut self, id: SymbolsId, node: ScopeNode<'_>) {
        let table = std::mem::take(self.get_mut(id));
        let mut visitor = FrameVisitor {
            arena: self,
            symbols: table,
        };
        visitor.root(node);
        let table = visitor.symbols;
        *self.get_mut(id) = table;
    }
}

/// Records names in one table. Bodies that get their own scope are not entered.
struct FrameVisitor<'a> {
    arena: &'a SymbolArena,
    symbols: Symbols,
}

impl FrameVisitor<'_> {
    fn root(&mut self, node: ScopeNode<'_>) {
        match node {
            ScopeNode::Body(body) => self.stmts(body),
            ScopeNode::Callable {
                args,
                defaults,
                body,
            } => {
                for expr in args.iter().chain(defaults) {
                    self.expr(expr, false);
                }
                self.stmts(body);
            }
            ScopeNode::For(node, ForBranch::Body) => {
                self.expr(&node.target, true);
                self.stmts(&node.body);
            }
            ScopeNode::For(node, ForBranch::Else) => self.stmts(&node.else_),
            ScopeNode::For(node, ForBranch::Test) => {
                self.expr(&node.target, true);
                if let Some(test) = &node.test {
                    self.expr(test, false);
                }
            }
            ScopeNode::With(node) => {
                for target in &node.targets {
                    self.expr(target, false);
                }
                self.stmts(&node.body);
            }
            ScopeNode::FilterBlock(node) => {
                self.stmts(&node.body);
                self.expr(&node.filter, false);
            }
            ScopeNode::AssignBlock(node) => {
                self.stmts(&node.body);
                if let Some(filter) = &node.filter {
                    self.expr(filter, false);
                }
            }
        }
    }

    fn find_ref(&self, name: &str) -> Option<&Ref> {
        self.symbols.refs.get(name).or_else(|| {
            self.symbols
                .parent
                .and_then(|parent| self.arena.find_ref(parent, name))
        })
    }

    fn store(&mut self, name: &str) {
        self.symbols.stores.insert(name.to_string());
        if self.symbols.refs.contains_key(name) {
            return;
        }
        let outer = self
            .symbols
            .parent
            .and_then(|parent| self.arena.find_ref(parent, name))
            .cloned();
        match outer {
            Some(outer) => self.symbols.define_ref(name, LoadInstruction::Alias(outer)),
            None => self.symbols.define_ref(name, LoadInstruction::Undefined),
        };
    }

    fn load(&mut self, name: &str) {
        if self.find_ref(name).is_none() {
            self.symbols
                .define_ref(name, LoadInstruction::Resolve(name.to_string()));
        }
    }

    fn declare_parameter(&mut self, name: &str) {
        self.symbols.stores.insert(name.to_string());
        self.symbols.define_ref(name, LoadInstruction::Param);
    }

    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Output(nodes) => {
                for node in nodes {
                    self.expr(node, false);
                }
            }
            StmtKind::For(node) => self.expr(&node.iter, false),
            StmtKind::If(node) => self.if_stmt(node),
            StmtKind::Macro(node) => self.store(&node.name),
            StmtKind::CallBlock(node) => self.expr(&node.call, false),
            StmtKind::FilterBlock(node) => self.expr(&node.filter, false),
            StmtKind::With(node) => {
                for value in &node.values {
                    self.expr(value, false);
                }
            }
            StmtKind::Extends(template) => self.expr(template, false),
            StmtKind::Include(node) => self.expr(&node.template, false),
            StmtKind::Import(node) => {
                self.expr(&node.template, false);
                self.store(&node.target);
            }
            StmtKind::FromImport(node) => {
                self.expr(&node.template, false);
                for (name, alias) in &node.names {
                    self.store(alias.as_deref().unwrap_or(name));
                }
            }
            StmtKind::ExprStmt(node) => self.expr(node, false),
            StmtKind::Assign { target, node } => {
                self.expr(node, false);
                self.expr(target, false);
            }
            StmtKind::AssignBlock(node) => self.expr(&node.target, false),
            StmtKind::ScopedEvalContextModifier { options, body } => {
                for option in options {
                    self.expr(&option.value, false);
                }
                self.stmts(body);
            }
            // Nested scopes are analyzed on their own.
            StmtKind::Block(_) | StmtKind::Scope(_) | StmtKind::Break | StmtKind::Continue => {}
        }
    }

    fn if_stmt(&mut self, node: &If) {
        self.expr(&node.test, false);
        let original = self.symbols.clone();
        let body = self.branch(&original, |v| v.stmts(&node.body));
        let elif = self.branch(&original, |v| {
            for elif in &node.elif {
                v.if_stmt(elif);
            }
        });
        let else_ = self.branch(&original, |v| v.stmts(&node.else_));
        self.symbols = branch_update(self.arena, &original, &[body, elif, else_]);
    }

    /// Analyzes one branch against a copy of `original` and returns the copy.
    fn branch(&mut self, original: &Symbols, visit: impl FnOnce(&mut Self)) -> Symbols {
        self.symbols = original.clone();
        visit(self);
        std::mem::replace(&mut self.symbols, original.clone())
    }

    /// `as_param` marks loop targets, which bind like signature arguments.
    fn expr(&mut self, expr: &Expr, as_param: bool) {
        match &expr.kind {
            ExprKind::Name { name, ctx } => match ctx {
                _ if as_param => self.declare_parameter(name),
                NameCtx::Param => self.declare_parameter(name),
                NameCtx::Store => self.store(name),
                NameCtx::Load => self.load(name),
            },
            ExprKind::NsRef { name, .. } => self.load(name),
            ExprKind::Tuple { items, .. } => {
                for item in items {
                    self.expr(item, as_param);
                }
            }
            _ => {
                for child in crate::ast::child_exprs(expr) {
                    self.expr(child, false);
                }
            }
        }
    }
}

/// Merges the tables of the branches of a conditional into a new table derived from `base`.
///
/// A name stored in every branch keeps its reference. A name stored in only some branches may
/// still be unbound after the conditional, so it falls back to an outer alias when one exists
/// and to a context lookup otherwise.
pub fn branch_update(arena: &SymbolArena, base: &Symbols, branches: &[Symbols]) -> Symbols {
    let mut counts: IndexMap<&str, usize> = IndexMap::new();
    for branch in branches {
        for target in &branch.stores {
            if base.stores.contains(target) {
                continue;
            }
            let count = counts.entry(target.as_str()).or_insert(0);
            *count = count.saturating_add(1);
        }
    }

    let mut merged = base.clone();
    for branch in branches {
        merged
            .refs
            .extend(branch.refs.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .loads
            .extend(branch.loads.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.stores.extend(branch.stores.iter().cloned());
    }

    for (name, count) in counts {
        if count == branches.len() {
            continue;
        }
        let Some(target) = merged.refs.get(name).cloned() else {
            continue;
        };
        let outer = merged
            .parent
            .and_then(|parent| arena.find_ref(parent, name))
            .cloned();
        let load = match outer {
            Some(outer) => LoadInstruction::Alias(outer),
            None => LoadInstruction::Resolve(name.to_string()),
        };
        merged.loads.insert(target, load);
    }
    merged
}
