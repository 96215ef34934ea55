//! Code generation: lowers an analyzed syntax tree into the units of a [`CompiledTemplate`].
//!
//! Every macro, call block, recursive loop and loop filter gets its own [`CodeUnit`]. Units are
//! built on a stack whose index is the unit depth recorded in symbol references, so a reference
//! resolves to a slot a fixed number of scopes out from the code that uses it.

use std::{
    collections::{BTreeSet, HashMap},
    ops::ControlFlow,
    sync::Arc,
};

use indexmap::IndexMap;

use crate::{
    ast::{
        self, AssignBlock, Block, Call, CallArgs, CallBlock, Expr, ExprKind, FilterBlock, FilterCall, For,
        FromImport, If, Import, Include, Keyword, LogicOp, Macro, Stmt, StmtKind, TestCall, UnaryOp, Visitor,
        With,
    },
    environment::Environment,
    error::{Error, ErrorKind, JinjateResult},
    idtracking::{ForBranch, LoadInstruction, Ref, ScopeNode, SymbolArena, SymbolsId},
    instructions::{
        CallSpec, CodeUnit, CompiledTemplate, EmitMode, Export, Instruction, MacroSpec, SlotRef, TemplateLookup,
        UnitId,
    },
    optimizer::{FoldCtx, fold},
    value::{Undefined, Value},
};

/// Compiles a parsed template.
pub(crate) fn generate(
    env: &Environment,
    template: &ast::Template,
    name: Option<&str>,
    filename: Option<&str>,
) -> JinjateResult<CompiledTemplate> {
    let mut generator = CodeGenerator::new(env, name, filename);
    generator.template(template)?;
    Ok(generator.finish())
}

/// Compile time state of one scope.
#[derive(Debug, Clone, Copy)]
struct Frame {
    symbols: SymbolsId,
    /// Statements here run at the top level of the template (exports are tracked).
    toplevel: bool,
    /// Like `toplevel`, but not inside any conditional.
    rootlevel: bool,
    /// Output must be skipped once a parent template is known.
    require_output_check: bool,
    /// Unknown filters and tests are reported at runtime rather than now.
    soft: bool,
}

impl Frame {
    const fn new(symbols: SymbolsId) -> Self {
        Self {
            symbols,
            toplevel: false,
            rootlevel: false,
            require_output_check: false,
            soft: false,
        }
    }

    const fn inner(&self, symbols: SymbolsId) -> Self {
        Self {
            require_output_check: self.require_output_check,
            ..Self::new(symbols)
        }
    }

    const fn soft(&self) -> Self {
        Self {
            rootlevel: false,
            soft: true,
            ..*self
        }
    }
}

struct LoopLabels {
    top: usize,
    breaks: Vec<usize>,
    captures: usize,
    autoescapes: usize,
}

struct UnitBuilder {
    id: UnitId,
    unit: CodeUnit,
    slots: HashMap<(usize, String), usize>,
    last_line: usize,
    loops: Vec<LoopLabels>,
    captures: usize,
    autoescapes: usize,
    temps: usize,
}

impl UnitBuilder {
    fn new(id: UnitId, name: String) -> Self {
        Self {
            id,
            unit: CodeUnit::new(name),
            slots: HashMap::new(),
            last_line: 0,
            loops: Vec::new(),
            captures: 0,
            autoescapes: 0,
            temps: 0,
        }
    }

    fn slot(&mut self, level: usize, name: &str) -> usize {
        let next = self.slots.len();
        *self.slots.entry((level, name.to_string())).or_insert(next)
    }
}

fn set_target(instr: &mut Instruction, target: usize) {
    match instr {
        Instruction::Jump(t)
        | Instruction::JumpIfFalse(t)
        | Instruction::JumpIfTrue(t)
        | Instruction::JumpIfFalseOrPop(t)
        | Instruction::JumpIfTrueOrPop(t)
        | Instruction::JumpIfBound(_, t)
        | Instruction::Iterate(t)
        | Instruction::CompareChain(_, t)
        | Instruction::JumpIfExtended(t)
        | Instruction::JumpIfNotExtended(t) => *t = target,
        _ => {}
    }
}

fn const_template_names(expr: &Expr, out: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Const(Value::String(name)) => out.push(name.to_string()),
        ExprKind::Const(Value::Seq(items) | Value::Tuple(items)) => {
            out.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
        }
        ExprKind::Tuple { items, .. } | ExprKind::List(items) => {
            for item in items {
                if let ExprKind::Const(Value::String(name)) = &item.kind {
                    out.push(name.to_string());
                }
            }
        }
        _ => {}
    }
}

fn include_lookup(expr: &Expr) -> TemplateLookup {
    match &expr.kind {
        ExprKind::Const(Value::String(_)) => TemplateLookup::Get,
        ExprKind::Const(Value::Seq(_) | Value::Tuple(_)) | ExprKind::Tuple { .. } | ExprKind::List(_) => {
            TemplateLookup::Select
        }
        _ => TemplateLookup::Either,
    }
}

fn publish_mode(name: &str, public: Export) -> Export {
    if name.starts_with('_') {
        Export::Keep
    } else {
        public
    }
}

/// Names bound by an assignment target, in binding order.
fn target_names(target: &Expr, out: &mut Vec<String>) {
    match &target.kind {
        ExprKind::Name { name, .. } => out.push(name.clone()),
        ExprKind::Tuple { items, .. } => {
            for item in items {
                target_names(item, out);
            }
        }
        _ => {}
    }
}

struct ExtendsFinder;

impl Visitor for ExtendsFinder {
    fn visit_stmt(&mut self, stmt: &Stmt) -> ControlFlow<()> {
        if matches!(stmt.kind, StmtKind::Extends(_)) {
            return ControlFlow::Break(());
        }
        ast::walk_stmt(self, stmt)
    }
}

fn has_extends(stmts: &[Stmt]) -> bool {
    ast::walk_stmts(&mut ExtendsFinder, stmts).is_break()
}

struct CodeGenerator<'env> {
    env: &'env Environment,
    name: Option<String>,
    filename: Option<String>,
    arena: SymbolArena,
    units: Vec<Option<CodeUnit>>,
    stack: Vec<UnitBuilder>,
    blocks: IndexMap<String, UnitId>,
    filters: IndexMap<String, usize>,
    tests: IndexMap<String, usize>,
    resolved: BTreeSet<String>,
    references: Vec<String>,
    has_known_extends: bool,
    extends_so_far: usize,
    /// Set by an `extends` that makes the rest of the current body unreachable.
    compiler_exit: bool,
    autoescape: bool,
    volatile: bool,
}

impl<'env> CodeGenerator<'env> {
    fn new(env: &'env Environment, name: Option<&str>, filename: Option<&str>) -> Self {
        Self {
            env,
            name: name.map(str::to_string),
            filename: filename.map(str::to_string),
            arena: SymbolArena::new(),
            units: Vec::new(),
            stack: Vec::new(),
            blocks: IndexMap::new(),
            filters: IndexMap::new(),
            tests: IndexMap::new(),
            resolved: BTreeSet::new(),
            references: Vec::new(),
            has_known_extends: false,
            extends_so_far: 0,
            compiler_exit: false,
            autoescape: env.autoescape_for(name),
            volatile: false,
        }
    }

    fn finish(self) -> CompiledTemplate {
        CompiledTemplate {
            name: self.name,
            filename: self.filename,
            units: self.units.into_iter().map(Option::unwrap_or_default).collect(),
            blocks: self.blocks,
            filters: self.filters.into_keys().collect(),
            tests: self.tests.into_keys().collect(),
            resolved: self.resolved,
            references: self.references,
        }
    }

    // -- unit management --

    fn depth(&self) -> usize {
        self.stack.len().saturating_sub(1)
    }

    fn begin_unit<S: Into<String>>(&mut self, name: S) {
        let id = self.units.len();
        self.units.push(None);
        self.stack.push(UnitBuilder::new(id, name.into()));
    }

    fn end_unit(&mut self) -> JinjateResult<UnitId> {
        let builder = self.stack.pop().ok_or_else(|| internal("no unit to finish"))?;
        let mut unit = builder.unit;
        unit.num_slots = builder.slots.len();
        if let Some(entry) = self.units.get_mut(builder.id) {
            *entry = Some(unit);
        }
        Ok(builder.id)
    }

    fn builder(&mut self) -> JinjateResult<&mut UnitBuilder> {
        self.stack.last_mut().ok_or_else(|| internal("no unit is being built"))
    }

    fn emit(&mut self, instr: Instruction) -> JinjateResult<usize> {
        let builder = self.builder()?;
        builder.unit.instructions.push(instr);
        Ok(builder.unit.instructions.len().saturating_sub(1))
    }

    fn here(&mut self) -> JinjateResult<usize> {
        Ok(self.builder()?.unit.instructions.len())
    }

    fn patch(&mut self, at: usize, target: usize) -> JinjateResult<()> {
        if let Some(instr) = self.builder()?.unit.instructions.get_mut(at) {
            set_target(instr, target);
        }
        Ok(())
    }

    fn patch_here(&mut self, at: usize) -> JinjateResult<()> {
        let target = self.here()?;
        self.patch(at, target)
    }

    fn mark_line(&mut self, lineno: usize) -> JinjateResult<()> {
        let builder = self.builder()?;
        if lineno == builder.last_line {
            return Ok(());
        }
        builder.last_line = lineno;
        let offset = builder.unit.instructions.len();
        match builder.unit.debug_info.last_mut() {
            Some(last) if last.1 == offset => last.0 = lineno,
            _ => builder.unit.debug_info.push((lineno, offset)),
        }
        Ok(())
    }

    fn slot_for(&mut self, target: &Ref) -> JinjateResult<SlotRef> {
        let up = self
            .depth()
            .checked_sub(target.depth)
            .ok_or_else(|| internal("reference to an inner unit"))?;
        let builder = self
            .stack
            .get_mut(target.depth)
            .ok_or_else(|| internal("reference to a finished unit"))?;
        Ok(SlotRef {
            up,
            slot: builder.slot(target.level, &target.name),
        })
    }

    fn name_slot(&mut self, frame: &Frame, name: &str) -> JinjateResult<SlotRef> {
        let target = self.arena.lookup(frame.symbols, name)?;
        self.slot_for(&target)
    }

    /// A slot for a compiler generated value in the current unit.
    fn temp_slot(&mut self) -> JinjateResult<SlotRef> {
        let builder = self.builder()?;
        builder.temps = builder.temps.saturating_add(1);
        let name = format!("#t{}", builder.temps);
        Ok(SlotRef {
            up: 0,
            slot: builder.slot(usize::MAX, &name),
        })
    }

    fn begin_capture(&mut self) -> JinjateResult<()> {
        self.emit(Instruction::BeginCapture)?;
        let builder = self.builder()?;
        builder.captures = builder.captures.saturating_add(1);
        Ok(())
    }

    fn end_capture(&mut self) -> JinjateResult<()> {
        self.emit(Instruction::EndCapture)?;
        let builder = self.builder()?;
        builder.captures = builder.captures.saturating_sub(1);
        Ok(())
    }

    fn fold_ctx(&self) -> FoldCtx<'env> {
        FoldCtx {
            env: self.env,
            autoescape: self.autoescape,
            volatile: self.volatile,
        }
    }

    fn filter_index(&mut self, name: &str) -> usize {
        let next = self.filters.len();
        *self.filters.entry(name.to_string()).or_insert(next)
    }

    fn test_index(&mut self, name: &str) -> usize {
        let next = self.tests.len();
        *self.tests.entry(name.to_string()).or_insert(next)
    }

    // -- frames --

    fn enter_frame(&mut self, frame: &Frame) -> JinjateResult<()> {
        let loads: Vec<(Ref, LoadInstruction)> = self
            .arena
            .get(frame.symbols)
            .loads()
            .map(|(target, load)| (target.clone(), load.clone()))
            .collect();
        for (target, load) in loads {
            match load {
                LoadInstruction::Param => {}
                LoadInstruction::Resolve(name) => {
                    let slot = self.slot_for(&target)?;
                    self.emit(Instruction::Resolve {
                        name: name.as_str().into(),
                        slot,
                    })?;
                    self.resolved.insert(name);
                }
                LoadInstruction::Alias(source) => {
                    let from = self.slot_for(&source)?;
                    let to = self.slot_for(&target)?;
                    self.emit(Instruction::CopyRef(from, to))?;
                }
                LoadInstruction::Undefined => {
                    let slot = self.slot_for(&target)?;
                    self.emit(Instruction::ClearRef(slot))?;
                }
            }
        }
        Ok(())
    }

    /// Clears every slot the frame loaded, unless the frame's unit is about to end anyway.
    fn leave_frame(&mut self, frame: &Frame, unit_scope: bool) -> JinjateResult<()> {
        if unit_scope {
            return Ok(());
        }
        let targets: Vec<Ref> = self
            .arena
            .get(frame.symbols)
            .loads()
            .map(|(target, _)| target.clone())
            .collect();
        for target in targets {
            let slot = self.slot_for(&target)?;
            self.emit(Instruction::ClearRef(slot))?;
        }
        Ok(())
    }

    fn local_slots(&mut self, frame: &Frame) -> JinjateResult<Vec<(Arc<str>, SlotRef)>> {
        let stores = self.arena.dump_stores(frame.symbols);
        let mut rv = Vec::with_capacity(stores.len());
        for (name, target) in stores {
            rv.push((Arc::from(name.as_str()), self.slot_for(&target)?));
        }
        Ok(rv)
    }

    // -- template structure --

    fn template(&mut self, node: &ast::Template) -> JinjateResult<()> {
        let mut blocks: IndexMap<&str, &Block> = IndexMap::new();
        for (block, lineno) in ast::find_blocks(&node.body) {
            if blocks.insert(block.name.as_str(), block).is_some() {
                return Err(Error::assertion(
                    format!("block '{}' defined twice", block.name),
                    lineno,
                ));
            }
        }
        let have_extends = has_extends(&node.body);

        self.begin_unit("root");
        let symbols = self.arena.root(0);
        let frame = Frame {
            toplevel: true,
            rootlevel: true,
            require_output_check: have_extends,
            ..Frame::new(symbols)
        };
        if ast::find_undeclared(&node.body, &["self"]).contains("self") {
            let target = self.arena.declare_parameter(symbols, "self");
            self.emit(Instruction::LoadSelf)?;
            let slot = self.slot_for(&target)?;
            self.emit(Instruction::StoreRef(slot))?;
        }
        self.arena.analyze(symbols, ScopeNode::Body(&node.body));
        self.enter_frame(&frame)?;
        self.blockvisit(&node.body, &frame)?;
        if have_extends {
            let guard = match self.has_known_extends {
                true => None,
                false => Some(self.emit(Instruction::JumpIfNotExtended(0))?),
            };
            self.emit(Instruction::RenderParent)?;
            if let Some(guard) = guard {
                self.patch_here(guard)?;
            }
        }
        self.end_unit()?;

        for (name, block) in blocks {
            let unit = self.block_unit(name, block)?;
            self.blocks.insert(name.to_string(), unit);
        }
        Ok(())
    }

    fn block_unit(&mut self, name: &str, block: &Block) -> JinjateResult<UnitId> {
        self.begin_unit(format!("block {}", name));
        let symbols = self.arena.root(0);
        let frame = Frame::new(symbols);
        let undeclared = ast::find_undeclared(&block.body, &["self", "super"]);
        if undeclared.contains("self") {
            let target = self.arena.declare_parameter(symbols, "self");
            self.emit(Instruction::LoadSelf)?;
            let slot = self.slot_for(&target)?;
            self.emit(Instruction::StoreRef(slot))?;
        }
        if undeclared.contains("super") {
            let target = self.arena.declare_parameter(symbols, "super");
            self.emit(Instruction::LoadSuper(name.into()))?;
            let slot = self.slot_for(&target)?;
            self.emit(Instruction::StoreRef(slot))?;
        }
        self.arena.analyze(symbols, ScopeNode::Body(&block.body));
        self.enter_frame(&frame)?;
        self.blockvisit(&block.body, &frame)?;
        self.end_unit()
    }

    fn blockvisit(&mut self, stmts: &[Stmt], frame: &Frame) -> JinjateResult<()> {
        for stmt in stmts {
            self.stmt(stmt, frame)?;
            if self.compiler_exit {
                self.compiler_exit = false;
                break;
            }
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt, frame: &Frame) -> JinjateResult<()> {
        self.mark_line(stmt.lineno)?;
        match &stmt.kind {
            StmtKind::Output(nodes) => self.output(nodes, frame),
            StmtKind::For(node) => self.for_loop(stmt, node, frame),
            StmtKind::If(node) => self.if_stmt(node, &frame.soft()),
            StmtKind::Macro(node) => self.macro_def(node, frame, stmt.lineno),
            StmtKind::CallBlock(node) => self.call_block(node, frame, stmt.lineno),
            StmtKind::FilterBlock(node) => self.filter_block(node, frame),
            StmtKind::With(node) => self.with_stmt(node, frame),
            StmtKind::Block(node) => self.block_call(node, frame),
            StmtKind::Extends(template) => self.extends(template, frame, stmt.lineno),
            StmtKind::Include(node) => self.include(node, frame),
            StmtKind::Import(node) => self.import(node, frame),
            StmtKind::FromImport(node) => self.from_import(node, frame, stmt.lineno),
            StmtKind::ExprStmt(node) => {
                self.expr(node, frame)?;
                self.emit(Instruction::Pop).map(drop)
            }
            StmtKind::Assign { target, node } => {
                self.expr(node, frame)?;
                self.store_target(target, frame)?;
                self.publish_target(target, frame)
            }
            StmtKind::AssignBlock(node) => self.assign_block(node, frame),
            StmtKind::Break => self.loop_control(true, stmt.lineno),
            StmtKind::Continue => self.loop_control(false, stmt.lineno),
            StmtKind::Scope(body) => {
                let symbols = self.arena.child(frame.symbols, self.depth());
                self.arena.analyze(symbols, ScopeNode::Body(body));
                let scope = frame.inner(symbols);
                self.enter_frame(&scope)?;
                self.blockvisit(body, &scope)?;
                self.leave_frame(&scope, false)
            }
            StmtKind::ScopedEvalContextModifier { options, body } => self.eval_context(options, body, frame),
        }
    }

    fn output(&mut self, nodes: &[Expr], frame: &Frame) -> JinjateResult<()> {
        if self.has_known_extends && frame.require_output_check {
            return Ok(());
        }
        let guard = match frame.require_output_check {
            true => Some(self.emit(Instruction::JumpIfExtended(0))?),
            false => None,
        };
        let mut pending = String::new();
        for node in nodes {
            let constant = match &node.kind {
                ExprKind::TemplateData(data) => Some(data.clone()),
                _ if self.env.optimized() && !self.volatile => fold(node, &self.fold_ctx()).map(|value| {
                    match self.autoescape {
                        true => value.escape().to_string(),
                        false => value.to_string(),
                    }
                }),
                _ => None,
            };
            if let Some(text) = constant {
                pending.push_str(&text);
                continue;
            }
            if !pending.is_empty() {
                self.emit(Instruction::Emit(std::mem::take(&mut pending).into()))?;
            }
            self.mark_line(node.lineno)?;
            self.expr(node, frame)?;
            let mode = if self.volatile {
                EmitMode::Auto
            } else if self.autoescape {
                EmitMode::Escape
            } else {
                EmitMode::Str
            };
            self.emit(Instruction::EmitValue(mode))?;
        }
        if !pending.is_empty() {
            self.emit(Instruction::Emit(pending.into()))?;
        }
        if let Some(guard) = guard {
            self.patch_here(guard)?;
        }
        Ok(())
    }

    fn if_stmt(&mut self, node: &If, frame: &Frame) -> JinjateResult<()> {
        let mut ends = Vec::new();
        let mut branches = std::iter::once((&node.test, &node.body, node.lineno))
            .chain(node.elif.iter().map(|elif| (&elif.test, &elif.body, elif.lineno)))
            .peekable();
        while let Some((test, body, lineno)) = branches.next() {
            self.mark_line(lineno)?;
            self.expr(test, frame)?;
            let skip = self.emit(Instruction::JumpIfFalse(0))?;
            self.blockvisit(body, frame)?;
            if branches.peek().is_some() || !node.else_.is_empty() {
                ends.push(self.emit(Instruction::Jump(0))?);
            }
            self.patch_here(skip)?;
        }
        self.blockvisit(&node.else_, frame)?;
        for end in ends {
            self.patch_here(end)?;
        }
        Ok(())
    }

    fn for_loop(&mut self, stmt: &Stmt, node: &For, frame: &Frame) -> JinjateResult<()> {
        let depth = self.depth();
        let body_depth = if node.recursive { depth.saturating_add(1) } else { depth };
        let loop_symbols = self.arena.child(frame.symbols, body_depth);
        let else_symbols = self.arena.child(frame.symbols, body_depth);
        let test_symbols = self.arena.child(frame.symbols, body_depth.saturating_add(1));

        let scoped_block = ast::find_blocks(&node.body)
            .iter()
            .chain(ast::find_blocks(&node.else_).iter())
            .any(|(block, _)| block.scoped);
        let extended = node.recursive
            || scoped_block
            || ast::find_undeclared(&node.body, &["loop"]).contains("loop");
        let loop_ref = match extended {
            true => Some(self.arena.declare_parameter(loop_symbols, "loop")),
            false => None,
        };
        self.arena.analyze(loop_symbols, ScopeNode::For(node, ForBranch::Body));
        if !node.else_.is_empty() {
            self.arena.analyze(else_symbols, ScopeNode::For(node, ForBranch::Else));
        }
        if node.test.is_some() {
            self.arena.analyze(test_symbols, ScopeNode::For(node, ForBranch::Test));
        }
        let loop_frame = frame.inner(loop_symbols);
        let else_frame = frame.inner(else_symbols);
        let test_frame = frame.inner(test_symbols);

        if node.recursive {
            self.expr(&node.iter, frame)?;
            self.begin_unit("loop");
            self.loop_code(stmt, node, &loop_frame, &else_frame, &test_frame, loop_ref.as_ref())?;
            let unit = self.end_unit()?;
            self.emit(Instruction::CallRecursiveLoop(unit))?;
            self.emit(Instruction::EmitValue(EmitMode::Str)).map(drop)
        } else {
            self.expr(&node.iter, frame)?;
            self.loop_code(stmt, node, &loop_frame, &else_frame, &test_frame, loop_ref.as_ref())
        }
    }

    /// Loop code expecting the iterable on the stack.
    fn loop_code(
        &mut self,
        stmt: &Stmt,
        node: &For,
        loop_frame: &Frame,
        else_frame: &Frame,
        test_frame: &Frame,
        loop_ref: Option<&Ref>,
    ) -> JinjateResult<()> {
        let loop_slot = match loop_ref {
            Some(target) => {
                let slot = self.slot_for(target)?;
                self.emit(Instruction::ClearRef(slot))?;
                Some(slot)
            }
            None => None,
        };
        if let Some(lineno) = ast::find_store(stmt, "loop") {
            return Err(Error::assertion(
                "Can't assign to special loop variable in for-loop target",
                lineno,
            ));
        }
        if let Some(test) = &node.test {
            let unit = self.loop_filter(node, test, test_frame)?;
            self.emit(Instruction::FilterIter(unit))?;
        }
        self.emit(Instruction::PushLoop {
            recursive: node.recursive,
        })?;
        let top = self.emit(Instruction::Iterate(0))?;
        self.store_target(&node.target, loop_frame)?;
        if let Some(slot) = loop_slot {
            self.emit(Instruction::LoadLoop)?;
            self.emit(Instruction::StoreRef(slot))?;
        }
        self.enter_frame(loop_frame)?;

        let builder = self.builder()?;
        let labels = LoopLabels {
            top,
            breaks: Vec::new(),
            captures: builder.captures,
            autoescapes: builder.autoescapes,
        };
        builder.loops.push(labels);
        self.blockvisit(&node.body, loop_frame)?;
        let labels = self
            .builder()?
            .loops
            .pop()
            .ok_or_else(|| internal("loop labels out of balance"))?;
        self.emit(Instruction::Jump(top))?;
        self.patch_here(top)?;
        for at in labels.breaks {
            self.patch_here(at)?;
        }
        self.emit(Instruction::PopLoop {
            push_iterated: !node.else_.is_empty(),
        })?;
        self.leave_frame(loop_frame, node.recursive && node.else_.is_empty())?;

        if !node.else_.is_empty() {
            let skip = self.emit(Instruction::JumpIfTrue(0))?;
            self.enter_frame(else_frame)?;
            self.blockvisit(&node.else_, else_frame)?;
            self.leave_frame(else_frame, false)?;
            self.patch_here(skip)?;
        }
        Ok(())
    }

    /// A unit that receives one item on the stack and returns whether the loop keeps it.
    fn loop_filter(&mut self, node: &For, test: &Expr, test_frame: &Frame) -> JinjateResult<UnitId> {
        self.begin_unit("loop filter");
        self.enter_frame(test_frame)?;
        self.store_target(&node.target, test_frame)?;
        self.expr(test, test_frame)?;
        self.end_unit()
    }

    fn loop_control(&mut self, is_break: bool, lineno: usize) -> JinjateResult<()> {
        let builder = self.builder()?;
        let Some(labels) = builder.loops.last() else {
            let keyword = if is_break { "break" } else { "continue" };
            return Err(Error::assertion(format!("'{}' outside loop", keyword), lineno));
        };
        let (top, captures, autoescapes) = (labels.top, labels.captures, labels.autoescapes);
        let open_captures = builder.captures.saturating_sub(captures);
        let open_autoescapes = builder.autoescapes.saturating_sub(autoescapes);
        for _ in 0..open_captures {
            self.emit(Instruction::DiscardCapture)?;
        }
        for _ in 0..open_autoescapes {
            self.emit(Instruction::PopAutoescape)?;
        }
        if is_break {
            let at = self.emit(Instruction::Jump(0))?;
            if let Some(labels) = self.builder()?.loops.last_mut() {
                labels.breaks.push(at);
            }
        } else {
            self.emit(Instruction::Jump(top))?;
        }
        Ok(())
    }

    /// Compiles a macro or caller body into its own unit.
    fn macro_body(
        &mut self,
        name: &str,
        args: &[Expr],
        defaults: &[Expr],
        body: &[Stmt],
        frame: &Frame,
        lineno: usize,
    ) -> JinjateResult<Arc<MacroSpec>> {
        self.begin_unit(format!("macro {}", name));
        let symbols = self.arena.child(frame.symbols, self.depth());
        self.arena.analyze(symbols, ScopeNode::Callable { args, defaults, body });
        let mut macro_frame = frame.inner(symbols);
        macro_frame.require_output_check = false;

        let arg_names: Vec<&str> = args
            .iter()
            .filter_map(|arg| match &arg.kind {
                ExprKind::Name { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        let explicit_caller = arg_names.iter().position(|arg| *arg == "caller");
        let mut params: Vec<Ref> = arg_names
            .iter()
            .map(|arg| self.arena.lookup(symbols, arg))
            .collect::<JinjateResult<_>>()?;

        let undeclared = ast::find_undeclared(body, &["caller", "kwargs", "varargs"]);
        let caller = undeclared.contains("caller");
        if caller {
            match explicit_caller {
                Some(idx) if arg_names.len().saturating_sub(idx) > defaults.len() => {
                    return Err(Error::assertion(
                        "When defining macros or call blocks the special \"caller\" argument must be \
                         omitted or be given a default.",
                        lineno,
                    ));
                }
                Some(_) => {}
                None => params.push(self.arena.declare_parameter(symbols, "caller")),
            }
        }
        let catch_kwargs = undeclared.contains("kwargs") && !arg_names.contains(&"kwargs");
        if catch_kwargs {
            params.push(self.arena.declare_parameter(symbols, "kwargs"));
        }
        let catch_varargs = undeclared.contains("varargs") && !arg_names.contains(&"varargs");
        if catch_varargs {
            params.push(self.arena.declare_parameter(symbols, "varargs"));
        }

        self.enter_frame(&macro_frame)?;
        let first_default = arg_names.len().saturating_sub(defaults.len());
        for (idx, arg) in arg_names.iter().enumerate() {
            let slot = self.name_slot(&macro_frame, arg)?;
            let skip = self.emit(Instruction::JumpIfBound(slot, 0))?;
            match idx.checked_sub(first_default).and_then(|d| defaults.get(d)) {
                Some(default) => self.expr(default, &macro_frame)?,
                None => {
                    let hint = format!("parameter '{}' was not provided", arg);
                    self.emit(Instruction::LoadConst(Value::Undefined(Undefined::with_hint(
                        Some(arg),
                        &hint,
                    ))))?;
                }
            }
            self.emit(Instruction::StoreRef(slot))?;
            self.patch_here(skip)?;
        }
        self.blockvisit(body, &macro_frame)?;

        let mut slots = Vec::with_capacity(params.len());
        for param in &params {
            slots.push(self.slot_for(param)?.slot);
        }
        let unit = self.end_unit()?;
        Ok(Arc::new(MacroSpec {
            unit,
            name: name.into(),
            arguments: arg_names.iter().map(|arg| Arc::from(*arg)).collect(),
            params: slots,
            caller,
            catch_kwargs,
            catch_varargs,
            explicit_caller: explicit_caller.is_some(),
        }))
    }

    fn macro_def(&mut self, node: &Macro, frame: &Frame, lineno: usize) -> JinjateResult<()> {
        let spec = self.macro_body(&node.name, &node.args, &node.defaults, &node.body, frame, lineno)?;
        self.emit(Instruction::MakeMacro(spec))?;
        let slot = self.name_slot(frame, &node.name)?;
        self.emit(Instruction::StoreRef(slot))?;
        if frame.toplevel {
            self.emit(Instruction::Publish {
                name: node.name.as_str().into(),
                slot,
                export: publish_mode(&node.name, Export::Add),
            })?;
        }
        Ok(())
    }

    fn call_block(&mut self, node: &CallBlock, frame: &Frame, lineno: usize) -> JinjateResult<()> {
        let spec = self.macro_body("caller", &node.args, &node.defaults, &node.body, frame, lineno)?;
        self.emit(Instruction::MakeMacro(spec))?;
        let caller = self.temp_slot()?;
        self.emit(Instruction::StoreRef(caller))?;
        let ExprKind::Call(call) = &node.call.kind else {
            return Err(Error::assertion("call block without a call", lineno));
        };
        self.call(call, frame, Some(caller))?;
        self.emit(Instruction::EmitValue(EmitMode::Str)).map(drop)
    }

    fn filter_block(&mut self, node: &FilterBlock, frame: &Frame) -> JinjateResult<()> {
        let symbols = self.arena.child(frame.symbols, self.depth());
        self.arena.analyze(symbols, ScopeNode::FilterBlock(node));
        let filter_frame = frame.inner(symbols);
        self.enter_frame(&filter_frame)?;
        self.begin_capture()?;
        self.blockvisit(&node.body, &filter_frame)?;
        self.expr(&node.filter, &filter_frame)?;
        self.emit(Instruction::EmitValue(EmitMode::Str))?;
        self.leave_frame(&filter_frame, false)
    }

    fn with_stmt(&mut self, node: &With, frame: &Frame) -> JinjateResult<()> {
        let symbols = self.arena.child(frame.symbols, self.depth());
        self.arena.analyze(symbols, ScopeNode::With(node));
        let with_frame = frame.inner(symbols);
        self.enter_frame(&with_frame)?;
        for (target, value) in node.targets.iter().zip(&node.values) {
            self.expr(value, frame)?;
            self.store_target(target, &with_frame)?;
        }
        self.blockvisit(&node.body, &with_frame)?;
        self.leave_frame(&with_frame, false)
    }

    fn block_call(&mut self, node: &Block, frame: &Frame) -> JinjateResult<()> {
        let mut guard = None;
        if frame.toplevel {
            if self.has_known_extends {
                return Ok(());
            }
            if self.extends_so_far > 0 {
                guard = Some(self.emit(Instruction::JumpIfExtended(0))?);
            }
        }
        if node.scoped {
            let locals = self.local_slots(frame)?;
            self.emit(Instruction::BuildLocals(locals))?;
        }
        self.emit(Instruction::CallBlock {
            name: node.name.as_str().into(),
            scoped: node.scoped,
            required: node.required,
        })?;
        if let Some(guard) = guard {
            self.patch_here(guard)?;
        }
        Ok(())
    }

    fn extends(&mut self, template: &Expr, frame: &Frame, lineno: usize) -> JinjateResult<()> {
        if !frame.toplevel {
            return Err(Error::assertion("cannot use extend from a non top-level scope", lineno));
        }
        if self.extends_so_far > 0 {
            if self.has_known_extends {
                self.emit(Instruction::Fail("extended multiple times".into()))?;
                self.compiler_exit = true;
                return Ok(());
            }
            let guard = self.emit(Instruction::JumpIfNotExtended(0))?;
            self.emit(Instruction::Fail("extended multiple times".into()))?;
            self.patch_here(guard)?;
        }
        self.expr(template, frame)?;
        self.emit(Instruction::Extends)?;
        const_template_names(template, &mut self.references);
        if frame.rootlevel {
            self.has_known_extends = true;
        }
        self.extends_so_far = self.extends_so_far.saturating_add(1);
        Ok(())
    }

    fn push_locals(&mut self, with_context: bool, frame: &Frame) -> JinjateResult<()> {
        if with_context {
            let locals = self.local_slots(frame)?;
            self.emit(Instruction::BuildLocals(locals))?;
        }
        Ok(())
    }

    fn include(&mut self, node: &Include, frame: &Frame) -> JinjateResult<()> {
        self.expr(&node.template, frame)?;
        self.push_locals(node.with_context, frame)?;
        self.emit(Instruction::Include {
            lookup: include_lookup(&node.template),
            ignore_missing: node.ignore_missing,
            with_context: node.with_context,
        })?;
        const_template_names(&node.template, &mut self.references);
        Ok(())
    }

    fn import(&mut self, node: &Import, frame: &Frame) -> JinjateResult<()> {
        self.expr(&node.template, frame)?;
        self.push_locals(node.with_context, frame)?;
        self.emit(Instruction::Import {
            with_context: node.with_context,
        })?;
        const_template_names(&node.template, &mut self.references);
        let slot = self.name_slot(frame, &node.target)?;
        self.emit(Instruction::StoreRef(slot))?;
        if frame.toplevel {
            self.emit(Instruction::Publish {
                name: node.target.as_str().into(),
                slot,
                export: publish_mode(&node.target, Export::Discard),
            })?;
        }
        Ok(())
    }

    fn from_import(&mut self, node: &FromImport, frame: &Frame, lineno: usize) -> JinjateResult<()> {
        self.expr(&node.template, frame)?;
        self.push_locals(node.with_context, frame)?;
        self.emit(Instruction::Import {
            with_context: node.with_context,
        })?;
        const_template_names(&node.template, &mut self.references);
        let module = self.temp_slot()?;
        self.emit(Instruction::StoreRef(module))?;
        for (name, alias) in &node.names {
            let alias = alias.as_deref().unwrap_or(name);
            self.emit(Instruction::LoadRef(module, "module".into()))?;
            self.emit(Instruction::GetModuleAttr {
                name: name.as_str().into(),
                lineno,
            })?;
            let slot = self.name_slot(frame, alias)?;
            self.emit(Instruction::StoreRef(slot))?;
            if frame.toplevel {
                self.emit(Instruction::Publish {
                    name: alias.into(),
                    slot,
                    export: publish_mode(alias, Export::Discard),
                })?;
            }
        }
        self.emit(Instruction::ClearRef(module)).map(drop)
    }

    fn assign_block(&mut self, node: &AssignBlock, frame: &Frame) -> JinjateResult<()> {
        let symbols = self.arena.child(frame.symbols, self.depth());
        self.arena.analyze(symbols, ScopeNode::AssignBlock(node));
        let mut block_frame = frame.inner(symbols);
        block_frame.require_output_check = false;
        self.enter_frame(&block_frame)?;
        self.begin_capture()?;
        self.blockvisit(&node.body, &block_frame)?;
        match &node.filter {
            Some(filter) => {
                self.expr(filter, &block_frame)?;
                self.emit(Instruction::MarkSafe)?;
            }
            None => self.end_capture()?,
        }
        self.store_target(&node.target, frame)?;
        self.publish_target(&node.target, frame)?;
        self.leave_frame(&block_frame, false)
    }

    fn eval_context(&mut self, options: &[Keyword], body: &[Stmt], frame: &Frame) -> JinjateResult<()> {
        let saved = (self.autoescape, self.volatile);
        let mut pushed = 0usize;
        for option in options {
            self.expr(&option.value, frame)?;
            if option.key != "autoescape" {
                self.emit(Instruction::Pop)?;
                continue;
            }
            match fold(&option.value, &self.fold_ctx()) {
                Some(value) => self.autoescape = value.is_true(),
                None => self.volatile = true,
            }
            self.emit(Instruction::PushAutoescape)?;
            pushed = pushed.saturating_add(1);
            let builder = self.builder()?;
            builder.autoescapes = builder.autoescapes.saturating_add(1);
        }
        self.blockvisit(body, frame)?;
        for _ in 0..pushed {
            self.emit(Instruction::PopAutoescape)?;
            let builder = self.builder()?;
            builder.autoescapes = builder.autoescapes.saturating_sub(1);
        }
        (self.autoescape, self.volatile) = saved;
        Ok(())
    }

    fn store_target(&mut self, target: &Expr, frame: &Frame) -> JinjateResult<()> {
        match &target.kind {
            ExprKind::Name { name, .. } => {
                let slot = self.name_slot(frame, name)?;
                self.emit(Instruction::StoreRef(slot)).map(drop)
            }
            ExprKind::Tuple { items, .. } => {
                self.emit(Instruction::UnpackSeq(items.len()))?;
                items.iter().try_for_each(|item| self.store_target(item, frame))
            }
            ExprKind::NsRef { name, attr } => {
                let slot = self.name_slot(frame, name)?;
                self.emit(Instruction::LoadRef(slot, name.as_str().into()))?;
                self.emit(Instruction::SetNamespaceAttr(attr.as_str().into()))
                    .map(drop)
            }
            _ => Err(Error::assertion(
                format!("can't assign to {:?}", target.node_name()),
                target.lineno,
            )),
        }
    }

    /// Copies top level assignments into the context variables and export list.
    fn publish_target(&mut self, target: &Expr, frame: &Frame) -> JinjateResult<()> {
        if !frame.toplevel {
            return Ok(());
        }
        let mut names = Vec::new();
        target_names(target, &mut names);
        for name in names {
            let slot = self.name_slot(frame, &name)?;
            self.emit(Instruction::Publish {
                name: name.as_str().into(),
                slot,
                export: publish_mode(&name, Export::Add),
            })?;
        }
        Ok(())
    }

    // -- expressions --

    fn expr(&mut self, expr: &Expr, frame: &Frame) -> JinjateResult<()> {
        match &expr.kind {
            ExprKind::Name { name, .. } => {
                let slot = self.name_slot(frame, name)?;
                self.emit(Instruction::LoadRef(slot, name.as_str().into()))?;
            }
            ExprKind::NsRef { .. } => {
                return Err(Error::assertion("namespace reference outside of an assignment", expr.lineno));
            }
            ExprKind::Const(value) => {
                self.emit(Instruction::LoadConst(value.clone()))?;
            }
            ExprKind::TemplateData(data) => {
                if self.volatile {
                    self.emit(Instruction::LoadConst(Value::from(data.as_str())))?;
                    self.emit(Instruction::MarkSafe)?;
                } else if self.autoescape {
                    self.emit(Instruction::LoadConst(Value::from_safe_string(data.as_str())))?;
                } else {
                    self.emit(Instruction::LoadConst(Value::from(data.as_str())))?;
                }
            }
            ExprKind::Tuple { items, .. } => {
                for item in items {
                    self.expr(item, frame)?;
                }
                self.emit(Instruction::BuildTuple(items.len()))?;
            }
            ExprKind::List(items) => {
                for item in items {
                    self.expr(item, frame)?;
                }
                self.emit(Instruction::BuildList(items.len()))?;
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key, frame)?;
                    self.expr(value, frame)?;
                }
                self.emit(Instruction::BuildMap(pairs.len()))?;
            }
            ExprKind::CondExpr { test, expr1, expr2 } => self.cond_expr(test, expr1, expr2.as_deref(), frame)?,
            ExprKind::Filter(filter) => self.filter(filter, frame, expr.lineno)?,
            ExprKind::Test(test) => self.test(test, frame, expr.lineno)?,
            ExprKind::Call(call) => self.call(call, frame, None)?,
            ExprKind::Getitem { node, arg } => {
                self.expr(node, frame)?;
                match &arg.kind {
                    ExprKind::Slice { start, stop, step } => {
                        for part in [start, stop, step] {
                            match part {
                                Some(part) => self.expr(part, frame)?,
                                None => {
                                    self.emit(Instruction::LoadConst(Value::None))?;
                                }
                            }
                        }
                        self.emit(Instruction::Slice)?;
                    }
                    _ => {
                        self.expr(arg, frame)?;
                        self.emit(Instruction::GetItem)?;
                    }
                }
            }
            ExprKind::Getattr { node, attr } => {
                self.expr(node, frame)?;
                self.emit(Instruction::GetAttr(attr.as_str().into()))?;
            }
            ExprKind::Slice { .. } => {
                return Err(Error::assertion("slice outside of a subscript", expr.lineno));
            }
            ExprKind::Concat(nodes) => {
                for node in nodes {
                    self.expr(node, frame)?;
                }
                self.emit(Instruction::Concat(nodes.len()))?;
            }
            ExprKind::Compare { expr, ops } => {
                self.expr(expr, frame)?;
                let mut chain = Vec::new();
                for (idx, operand) in ops.iter().enumerate() {
                    self.expr(&operand.expr, frame)?;
                    if idx.saturating_add(1) < ops.len() {
                        chain.push(self.emit(Instruction::CompareChain(operand.op, 0))?);
                    } else {
                        self.emit(Instruction::Compare(operand.op))?;
                    }
                }
                for at in chain {
                    self.patch_here(at)?;
                }
            }
            ExprKind::BinOp { op, left, right } => {
                self.expr(left, frame)?;
                self.expr(right, frame)?;
                self.emit(Instruction::BinOp(*op))?;
            }
            ExprKind::Logic { op, left, right } => {
                self.expr(left, frame)?;
                let jump = match op {
                    LogicOp::And => self.emit(Instruction::JumpIfFalseOrPop(0))?,
                    LogicOp::Or => self.emit(Instruction::JumpIfTrueOrPop(0))?,
                };
                self.expr(right, frame)?;
                self.patch_here(jump)?;
            }
            ExprKind::Unary { op, node } => {
                self.expr(node, frame)?;
                self.emit(match op {
                    UnaryOp::Not => Instruction::Not,
                    UnaryOp::Neg => Instruction::Neg,
                    UnaryOp::Pos => Instruction::Pos,
                })?;
            }
        }
        Ok(())
    }

    fn cond_expr(&mut self, test: &Expr, expr1: &Expr, expr2: Option<&Expr>, frame: &Frame) -> JinjateResult<()> {
        let frame = frame.soft();
        self.expr(test, &frame)?;
        let otherwise = self.emit(Instruction::JumpIfFalse(0))?;
        self.expr(expr1, &frame)?;
        let end = self.emit(Instruction::Jump(0))?;
        self.patch_here(otherwise)?;
        match expr2 {
            Some(expr2) => self.expr(expr2, &frame)?,
            None => {
                let hint = format!(
                    "the inline if-expression on line {} in {} evaluated to false and no else section \
                     was defined.",
                    test.lineno,
                    self.name.as_deref().map_or_else(|| "None".to_string(), |name| format!("'{}'", name)),
                );
                self.emit(Instruction::LoadConst(Value::Undefined(Undefined::with_hint(None, &hint))))?;
            }
        }
        self.patch_here(end)
    }

    fn call_args(&mut self, args: &CallArgs, frame: &Frame, caller: Option<SlotRef>) -> JinjateResult<CallSpec> {
        for arg in &args.args {
            self.expr(arg, frame)?;
        }
        let mut kwargs: Vec<Arc<str>> = Vec::with_capacity(args.kwargs.len());
        for kw in &args.kwargs {
            self.expr(&kw.value, frame)?;
            kwargs.push(kw.key.as_str().into());
        }
        if let Some(slot) = caller {
            self.emit(Instruction::LoadRef(slot, "caller".into()))?;
            kwargs.push("caller".into());
        }
        if let Some(dyn_args) = &args.dyn_args {
            self.expr(dyn_args, frame)?;
        }
        if let Some(dyn_kwargs) = &args.dyn_kwargs {
            self.expr(dyn_kwargs, frame)?;
        }
        Ok(CallSpec {
            args: args.args.len(),
            kwargs,
            dyn_args: args.dyn_args.is_some(),
            dyn_kwargs: args.dyn_kwargs.is_some(),
        })
    }

    fn call(&mut self, call: &Call, frame: &Frame, caller: Option<SlotRef>) -> JinjateResult<()> {
        match &call.node.kind {
            ExprKind::Getattr { node, attr } => {
                self.expr(node, frame)?;
                let spec = self.call_args(&call.args, frame, caller)?;
                self.emit(Instruction::CallMethod(attr.as_str().into(), spec))?;
            }
            _ => {
                self.expr(&call.node, frame)?;
                let spec = self.call_args(&call.args, frame, caller)?;
                self.emit(Instruction::Call(spec))?;
            }
        }
        Ok(())
    }

    fn filter(&mut self, filter: &FilterCall, frame: &Frame, lineno: usize) -> JinjateResult<()> {
        if self.env.filter(&filter.name).is_none() && !frame.soft {
            return Err(Error::assertion(format!("No filter named '{}'.", filter.name), lineno));
        }
        let idx = self.filter_index(&filter.name);
        match &filter.node {
            Some(node) => self.expr(node, frame)?,
            None => self.end_capture()?,
        }
        let spec = self.call_args(&filter.args, frame, None)?;
        self.emit(Instruction::CallFilter(idx, spec)).map(drop)
    }

    fn test(&mut self, test: &TestCall, frame: &Frame, lineno: usize) -> JinjateResult<()> {
        if self.env.test(&test.name).is_none() && !frame.soft {
            return Err(Error::assertion(format!("No test named '{}'.", test.name), lineno));
        }
        let idx = self.test_index(&test.name);
        self.expr(&test.node, frame)?;
        let spec = self.call_args(&test.args, frame, None)?;
        self.emit(Instruction::PerformTest(idx, spec)).map(drop)
    }
}

fn internal(message: &str) -> Error {
    Error::new(
        ErrorKind::TemplateAssertion,
        format!("internal compiler error: {}", message),
    )
}
