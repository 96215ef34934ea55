//! The interpreter for compiled templates.
//!
//! A [`Vm`] lives for one top level render. Every unit invocation (the root, a block, a macro
//! call, a recursive loop pass) runs in its own [`Frame`] with a fresh [`Scope`] chained to the
//! scope the unit was defined in.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;

use crate::{
    environment::Environment,
    error::{Error, JinjateResult},
    filters::Filter,
    functions::{Args, State, builtin_method},
    instructions::{
        CallSpec, CompiledTemplate, EmitMode, Export, Instruction, ROOT_UNIT, SlotRef, TemplateLookup, UnitId,
    },
    output::Output,
    runtime::{
        BlockRef, LoopState, Macro, Module, ObjectKind, Recursion, RenderContext, Scope, TemplateRef, no_parent_block,
    },
    sandbox::{unsafe_call, unsafe_undefined},
    tests::Test,
    value::{CmpOp, Key, Kwargs, Undefined, UndefinedBehavior, Value, ops},
};

/// Filters and tests of one template, looked up in the environment once per render.
struct Bindings {
    template: Arc<CompiledTemplate>,
    filters: Vec<Option<Filter>>,
    tests: Vec<Option<Test>>,
}

struct Frame {
    template: Arc<CompiledTemplate>,
    unit: UnitId,
    ctx: Arc<RenderContext>,
    scope: Arc<Scope>,
    stack: Vec<Value>,
    /// `loop.depth0` of the loop a recursive loop unit starts.
    loop_depth: usize,
    /// The parent template once `extends` ran.
    extended: Option<Arc<CompiledTemplate>>,
    loops: Vec<Arc<LoopState>>,
    autoescapes: Vec<bool>,
}

impl Frame {
    fn new(template: Arc<CompiledTemplate>, unit: UnitId, ctx: Arc<RenderContext>, scope: Arc<Scope>) -> Self {
        Self {
            template,
            unit,
            ctx,
            scope,
            stack: Vec::new(),
            loop_depth: 0,
            extended: None,
            loops: Vec::new(),
            autoescapes: Vec::new(),
        }
    }

    fn pop(&mut self) -> JinjateResult<Value> {
        self.stack.pop().ok_or_else(|| Error::runtime("stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> JinjateResult<Vec<Value>> {
        let at = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| Error::runtime("stack underflow"))?;
        Ok(self.stack.split_off(at))
    }

    fn peek(&self) -> JinjateResult<&Value> {
        self.stack.last().ok_or_else(|| Error::runtime("stack underflow"))
    }

    fn current_loop(&self) -> JinjateResult<&Arc<LoopState>> {
        self.loops.last().ok_or_else(|| Error::runtime("no active loop"))
    }
}

fn markup(body: String, autoescape: bool) -> Value {
    if autoescape {
        Value::from_safe_string(body)
    } else {
        Value::from(body)
    }
}

fn type_repr(obj: &Value) -> String {
    match obj {
        Value::None => "None".to_string(),
        _ => format!("{} object", obj.kind_name()),
    }
}

fn missing_attribute(obj: &Value, name: &str) -> Value {
    Value::Undefined(Undefined::with_hint(
        Some(name),
        &format!("'{}' has no attribute '{}'", type_repr(obj), name),
    ))
}

fn missing_element(obj: &Value, key: &Value) -> Value {
    match key.as_str() {
        Some(name) => missing_attribute(obj, name),
        None => Value::Undefined(Undefined::with_hint(
            Some(&key.to_string()),
            &format!("{} has no element {}", type_repr(obj), key.repr()),
        )),
    }
}

fn fail_undefined(value: &Value) -> JinjateResult<()> {
    match value {
        Value::Undefined(undefined) => Err(undefined.to_error()),
        _ => Ok(()),
    }
}

pub(crate) struct Vm<'env> {
    env: &'env Environment,
    depth: usize,
    bindings: Vec<Bindings>,
    /// Scopes and contexts that macros captured, cleared when the render ends.
    scopes: Vec<Weak<Scope>>,
    contexts: Vec<Weak<RenderContext>>,
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        for scope in self.scopes.drain(..).filter_map(|scope| scope.upgrade()) {
            scope.clear();
        }
        for ctx in self.contexts.drain(..).filter_map(|ctx| ctx.upgrade()) {
            ctx.clear();
        }
    }
}

impl<'env> Vm<'env> {
    pub(crate) const fn new(env: &'env Environment) -> Self {
        Self {
            env,
            depth: 0,
            bindings: Vec::new(),
            scopes: Vec::new(),
            contexts: Vec::new(),
        }
    }

    /// Renders a template's root unit in a new context over `vars`.
    pub(crate) fn render(
        &mut self,
        template: &Arc<CompiledTemplate>,
        vars: IndexMap<String, Value>,
        out: &mut Output<'_>,
    ) -> JinjateResult<Arc<RenderContext>> {
        let autoescape = self.env.autoescape_for(template.name.as_deref());
        let ctx = Arc::new(RenderContext::new(template, vars, autoescape));
        self.contexts.push(Arc::downgrade(&ctx));
        self.run_root(template, Arc::clone(&ctx), out)?;
        Ok(ctx)
    }

    fn run_root(
        &mut self,
        template: &Arc<CompiledTemplate>,
        ctx: Arc<RenderContext>,
        out: &mut Output<'_>,
    ) -> JinjateResult<()> {
        let slots = template.root().map_or(0, |unit| unit.num_slots);
        let frame = Frame::new(Arc::clone(template), ROOT_UNIT, ctx, Scope::new(slots, None));
        self.run(frame, out).map(drop)
    }

    fn run(&mut self, mut frame: Frame, out: &mut Output<'_>) -> JinjateResult<Option<Value>> {
        if self.depth >= self.env.recursion_limit() {
            return Err(Error::runtime("maximum recursion depth exceeded"));
        }
        self.depth = self.depth.saturating_add(1);
        let capture_depth = out.capture_depth();
        let mut pc = 0;
        let rv = self.execute(&mut frame, out, &mut pc);
        self.depth = self.depth.saturating_sub(1);
        rv.map_err(|err| {
            out.truncate_captures(capture_depth);
            let template = &frame.template;
            let lineno = template
                .unit(frame.unit)
                .map_or(1, |unit| unit.line_for(pc.saturating_sub(1)));
            err.push_frame(template.name.as_deref(), template.filename.as_deref(), lineno)
        })
    }

    fn behavior(&self) -> UndefinedBehavior {
        self.env.undefined_behavior()
    }

    fn truthy(&self, value: &Value) -> JinjateResult<bool> {
        self.behavior().check_soft_use(value)?;
        Ok(value.is_true())
    }

    fn state<'a>(&'a self, ctx: &'a RenderContext) -> State<'a> {
        State::new(self.env, Some(ctx), ctx.autoescape())
    }

    fn bindings(&mut self, template: &Arc<CompiledTemplate>) -> JinjateResult<&Bindings> {
        let idx = match self
            .bindings
            .iter()
            .position(|bound| Arc::ptr_eq(&bound.template, template))
        {
            Some(idx) => idx,
            None => {
                let env = self.env;
                self.bindings.push(Bindings {
                    template: Arc::clone(template),
                    filters: template.filters.iter().map(|name| env.filter(name).cloned()).collect(),
                    tests: template.tests.iter().map(|name| env.test(name).cloned()).collect(),
                });
                self.bindings.len().saturating_sub(1)
            }
        };
        self.bindings
            .get(idx)
            .ok_or_else(|| Error::runtime("missing filter bindings"))
    }

    fn filter(&mut self, template: &Arc<CompiledTemplate>, idx: usize) -> JinjateResult<Filter> {
        let bound = self.bindings(template)?;
        bound.filters.get(idx).cloned().flatten().ok_or_else(|| {
            let name = template.filters.get(idx).map_or("", String::as_str);
            Error::runtime(format!("No filter named '{}' found.", name))
        })
    }

    fn test(&mut self, template: &Arc<CompiledTemplate>, idx: usize) -> JinjateResult<Test> {
        let bound = self.bindings(template)?;
        bound.tests.get(idx).cloned().flatten().ok_or_else(|| {
            let name = template.tests.get(idx).map_or("", String::as_str);
            Error::runtime(format!("No test named '{}' found.", name))
        })
    }

    fn get_attr(&self, obj: &Value, name: &str) -> JinjateResult<Value> {
        if let Value::Undefined(undefined) = obj {
            return match self.behavior() {
                UndefinedBehavior::Chainable => Ok(obj.clone()),
                _ => Err(undefined.to_error()),
            };
        }
        let Some(found) = ops::get_attr(obj, name) else {
            return Ok(missing_attribute(obj, name));
        };
        match self.env.sandbox() {
            Some(policy) if !policy.is_safe_attribute(obj, name, &found) => Ok(unsafe_undefined(obj, name)),
            _ => Ok(found),
        }
    }

    fn get_item(&self, obj: &Value, key: &Value) -> JinjateResult<Value> {
        if let Value::Undefined(undefined) = obj {
            return match self.behavior() {
                UndefinedBehavior::Chainable => Ok(obj.clone()),
                _ => Err(undefined.to_error()),
            };
        }
        let Some(found) = ops::get_item(obj, key)? else {
            return Ok(missing_element(obj, key));
        };
        match (self.env.sandbox(), key.as_str()) {
            (Some(policy), Some(name)) if !policy.is_safe_attribute(obj, name, &found) => {
                Ok(unsafe_undefined(obj, name))
            }
            _ => Ok(found),
        }
    }

    fn output_text(&self, value: &Value, mode: EmitMode, ctx: &RenderContext) -> JinjateResult<String> {
        if let Value::Undefined(undefined) = value {
            return self.behavior().render(undefined);
        }
        let escape = match mode {
            EmitMode::Escape => true,
            EmitMode::Str => false,
            EmitMode::Auto => ctx.autoescape(),
        };
        Ok(if escape {
            value.escape().to_string()
        } else {
            value.to_string()
        })
    }

    fn pop_args(&self, frame: &mut Frame, spec: &CallSpec) -> JinjateResult<(Vec<Value>, Kwargs)> {
        let dyn_kwargs = match spec.dyn_kwargs {
            true => Some(frame.pop()?),
            false => None,
        };
        let dyn_args = match spec.dyn_args {
            true => Some(frame.pop()?),
            false => None,
        };
        let values = frame.pop_n(spec.kwargs.len())?;
        let mut args = frame.pop_n(spec.args)?;
        let mut kwargs: Kwargs = spec
            .kwargs
            .iter()
            .map(|name| name.to_string())
            .zip(values)
            .collect();
        if let Some(extra) = dyn_args {
            self.behavior().check_soft_use(&extra)?;
            args.extend(extra.try_iter()?);
        }
        if let Some(extra) = dyn_kwargs {
            match &extra {
                Value::Map(map) => {
                    for (key, value) in map.iter() {
                        let name = key
                            .as_str()
                            .ok_or_else(|| Error::type_error("keywords must be strings"))?;
                        kwargs.insert(name.to_string(), value.clone());
                    }
                }
                Value::Undefined(_) => self.behavior().check_soft_use(&extra)?,
                other => {
                    return Err(Error::type_error(format!(
                        "argument after ** must be a mapping, not {}",
                        other.kind_name()
                    )));
                }
            }
        }
        Ok((args, kwargs))
    }

    fn call_value(
        &mut self,
        frame: &Frame,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
        out: &mut Output<'_>,
    ) -> JinjateResult<Value> {
        let kind = match callee {
            Value::Undefined(undefined) => return Err(undefined.to_error()),
            Value::Object(_) => callee.object(),
            _ => None,
        };
        let Some(kind) = kind else {
            return Err(Error::type_error(format!(
                "'{}' object is not callable",
                callee.kind_name()
            )));
        };
        if let Some(policy) = self.env.sandbox() {
            if !policy.is_safe_callable(callee) {
                return Err(unsafe_call(callee));
            }
        }
        match kind {
            ObjectKind::Function(func) => func.call(&self.state(&frame.ctx), &Args::new(&args, &kwargs)),
            ObjectKind::Macro(m) => self.call_macro(m, args, kwargs, out),
            ObjectKind::Loop(state) => self.call_loop(frame, state, args, &kwargs, out),
            ObjectKind::BlockRef(block) => {
                let Some(current) = block.current() else {
                    return Ok(no_parent_block(&block.name));
                };
                let slots = current.template.unit(current.unit).map_or(0, |unit| unit.num_slots);
                let child = Frame::new(
                    Arc::clone(&current.template),
                    current.unit,
                    Arc::clone(&block.ctx),
                    Scope::new(slots, None),
                );
                let body = self.run_captured(child, out)?;
                Ok(markup(body, block.ctx.autoescape()))
            }
            ObjectKind::Namespace(_) | ObjectKind::Module(_) | ObjectKind::TemplateRef(_) => Err(Error::type_error(
                format!("'{}' object is not callable", kind.type_name()),
            )),
        }
    }

    fn call_macro(&mut self, m: &Arc<Macro>, args: Vec<Value>, kwargs: Kwargs, out: &mut Output<'_>) -> JinjateResult<Value> {
        let bound = m.bind(args, kwargs)?;
        let slots = m.template.unit(m.spec.unit).map_or(0, |unit| unit.num_slots);
        let scope = Scope::new(slots, Some(Arc::clone(&m.closure)));
        for (slot, value) in m.spec.params.iter().zip(bound) {
            scope.set(SlotRef { up: 0, slot: *slot }, value)?;
        }
        let frame = Frame::new(Arc::clone(&m.template), m.spec.unit, Arc::clone(&m.ctx), scope);
        let body = self.run_captured(frame, out)?;
        Ok(markup(body, m.autoescape))
    }

    fn call_loop(
        &mut self,
        frame: &Frame,
        state: &Arc<LoopState>,
        args: Vec<Value>,
        kwargs: &Kwargs,
        out: &mut Output<'_>,
    ) -> JinjateResult<Value> {
        let Some(recursion) = state.recursion() else {
            return Err(Error::type_error(
                "Tried to call non recursive loop. Maybe you forgot the 'recursive' modifier.",
            ));
        };
        let iterable = match <[Value; 1]>::try_from(args) {
            Ok([iterable]) if kwargs.is_empty() => iterable,
            _ => return Err(Error::type_error("loop() takes exactly one argument")),
        };
        let slots = recursion
            .template
            .unit(recursion.unit)
            .map_or(0, |unit| unit.num_slots);
        let mut child = Frame::new(
            Arc::clone(&recursion.template),
            recursion.unit,
            Arc::clone(&recursion.ctx),
            Scope::new(slots, recursion.closure.clone()),
        );
        child.stack.push(iterable);
        child.loop_depth = state.depth();
        child.extended = frame.extended.clone();
        let body = self.run_captured(child, out)?;
        Ok(markup(body, recursion.ctx.autoescape()))
    }

    fn run_captured(&mut self, frame: Frame, out: &mut Output<'_>) -> JinjateResult<String> {
        out.begin_capture();
        let rv = self.run(frame, out);
        let body = out.end_capture();
        rv.map(|_| body)
    }

    fn lookup_template(&self, value: &Value, lookup: TemplateLookup) -> JinjateResult<Arc<CompiledTemplate>> {
        self.env.load_value(value, lookup)
    }

    /// The variables a template pulled in by `include` or `import` starts with.
    fn template_vars(&self, ctx: &RenderContext, locals: Option<Value>) -> IndexMap<String, Value> {
        let Some(locals) = locals else {
            return self.env.globals().clone();
        };
        let mut vars = ctx.get_all();
        if let Value::Map(map) = locals {
            vars.extend(
                map.iter()
                    .filter_map(|(key, value)| Some((key.as_str()?.to_string(), value.clone()))),
            );
        }
        vars
    }

    fn new_context(&mut self, template: &Arc<CompiledTemplate>, vars: IndexMap<String, Value>) -> Arc<RenderContext> {
        let autoescape = self.env.autoescape_for(template.name.as_deref());
        let ctx = Arc::new(RenderContext::new(template, vars, autoescape));
        self.contexts.push(Arc::downgrade(&ctx));
        ctx
    }

    /// Runs a unit's instructions from `pc`. Instructions that enter another unit are handled
    /// out of line so a nested call only keeps small frames on the native stack.
    fn execute(&mut self, frame: &mut Frame, out: &mut Output<'_>, pc: &mut usize) -> JinjateResult<Option<Value>> {
        let template = Arc::clone(&frame.template);
        let code = &template
            .unit(frame.unit)
            .ok_or_else(|| Error::runtime("unknown code unit"))?
            .instructions;

        while let Some(instr) = code.get(*pc) {
            *pc = pc.saturating_add(1);
            match instr {
                Instruction::Call(spec) => self.exec_call(frame, spec, out)?,
                Instruction::CallMethod(name, spec) => self.exec_call_method(frame, name, spec, out)?,
                Instruction::FilterIter(unit) => self.exec_filter_iter(frame, *unit, out)?,
                Instruction::CallRecursiveLoop(unit) => self.exec_recursive_loop(frame, *unit, out)?,
                Instruction::RenderParent => {
                    if let Some(parent) = frame.extended.clone() {
                        self.run_root(&parent, Arc::clone(&frame.ctx), out)?;
                    }
                }
                Instruction::CallBlock { name, scoped, required } => {
                    self.exec_call_block(frame, name, *scoped, *required, out)?;
                }
                Instruction::Include {
                    lookup,
                    ignore_missing,
                    with_context,
                } => self.exec_include(frame, *lookup, *ignore_missing, *with_context, out)?,
                Instruction::Import { with_context } => self.exec_import(frame, *with_context, out)?,
                other => self.step(frame, other, out, pc)?,
            }
        }
        Ok(frame.stack.pop())
    }

    #[inline(never)]
    #[expect(clippy::too_many_lines, reason = "one arm per instruction")]
    fn step(&mut self, frame: &mut Frame, instr: &Instruction, out: &mut Output<'_>, pc: &mut usize) -> JinjateResult<()> {
        match instr {
            Instruction::Emit(text) => out.write_str(text)?,
            Instruction::EmitValue(mode) => {
                let value = frame.pop()?;
                let text = self.output_text(&value, *mode, &frame.ctx)?;
                out.write_str(&text)?;
            }
            Instruction::LoadConst(value) => frame.stack.push(value.clone()),
            Instruction::LoadRef(slot, name) => {
                let value = frame.scope.get(*slot)?.unwrap_or_else(|| Value::undefined(name));
                frame.stack.push(value);
            }
            Instruction::StoreRef(slot) => {
                let value = frame.pop()?;
                frame.scope.set(*slot, Some(value))?;
            }
            Instruction::CopyRef(from, to) => {
                let value = frame.scope.get(*from)?;
                frame.scope.set(*to, value)?;
            }
            Instruction::ClearRef(slot) => frame.scope.set(*slot, None)?,
            Instruction::JumpIfBound(slot, target) => {
                if frame.scope.get(*slot)?.is_some() {
                    *pc = *target;
                }
            }
            Instruction::Resolve { name, slot } => {
                let value = frame.ctx.resolve(name);
                frame.scope.set(*slot, Some(value))?;
            }
            Instruction::Publish { name, slot, export } => {
                let value = frame.scope.get(*slot)?.unwrap_or_else(|| Value::undefined(name));
                frame.ctx.set_var(name, value);
                match export {
                    Export::Add => frame.ctx.export(name),
                    Export::Discard => frame.ctx.unexport(name),
                    Export::Keep => {}
                }
            }
            Instruction::Pop => {
                frame.pop()?;
            }
            Instruction::BuildList(n) => {
                let items = frame.pop_n(*n)?;
                frame.stack.push(Value::from(items));
            }
            Instruction::BuildTuple(n) => {
                let items = frame.pop_n(*n)?;
                frame.stack.push(Value::tuple(items));
            }
            Instruction::BuildMap(n) => {
                let items = frame.pop_n(n.saturating_mul(2))?;
                let mut map = IndexMap::with_capacity(*n);
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    map.insert(Key::from_value(&key)?, value);
                }
                frame.stack.push(Value::Map(Arc::new(map)));
            }
            Instruction::UnpackSeq(n) => {
                let value = frame.pop()?;
                self.behavior().check_soft_use(&value)?;
                let items: Vec<Value> = value.try_iter()?.collect();
                if items.len() < *n {
                    return Err(Error::runtime(format!(
                        "not enough values to unpack (expected {}, got {})",
                        n,
                        items.len()
                    )));
                }
                if items.len() > *n {
                    return Err(Error::runtime(format!("too many values to unpack (expected {})", n)));
                }
                frame.stack.extend(items.into_iter().rev());
            }
            Instruction::BinOp(op) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                fail_undefined(&left)?;
                fail_undefined(&right)?;
                frame.stack.push(ops::binop(*op, &left, &right)?);
            }
            Instruction::Neg | Instruction::Pos => {
                let value = frame.pop()?;
                fail_undefined(&value)?;
                frame.stack.push(match instr {
                    Instruction::Neg => ops::neg(&value)?,
                    _ => ops::pos(&value)?,
                });
            }
            Instruction::Not => {
                let value = frame.pop()?;
                let rv = !self.truthy(&value)?;
                frame.stack.push(Value::Bool(rv));
            }
            Instruction::Compare(op) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                let rv = self.compare(*op, &left, &right)?;
                frame.stack.push(Value::Bool(rv));
            }
            Instruction::CompareChain(op, target) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                if self.compare(*op, &left, &right)? {
                    frame.stack.push(right);
                } else {
                    frame.stack.push(Value::Bool(false));
                    *pc = *target;
                }
            }
            Instruction::Concat(n) => {
                let mut values = frame.pop_n(*n)?;
                for value in &mut values {
                    if let Value::Undefined(undefined) = value {
                        *value = Value::from(self.behavior().render(undefined)?);
                    }
                }
                let autoescape = frame.ctx.autoescape() && values.iter().any(Value::is_safe);
                frame.stack.push(ops::string_concat(&values, autoescape));
            }
            Instruction::GetAttr(name) => {
                let obj = frame.pop()?;
                let value = self.get_attr(&obj, name)?;
                frame.stack.push(value);
            }
            Instruction::GetItem => {
                let key = frame.pop()?;
                let obj = frame.pop()?;
                let value = self.get_item(&obj, &key)?;
                frame.stack.push(value);
            }
            Instruction::Slice => {
                let step = frame.pop()?;
                let stop = frame.pop()?;
                let start = frame.pop()?;
                let obj = frame.pop()?;
                self.behavior().check_soft_use(&obj)?;
                frame.stack.push(ops::slice(&obj, &start, &stop, &step)?);
            }
            Instruction::Jump(target) => *pc = *target,
            Instruction::JumpIfFalse(target) => {
                let value = frame.pop()?;
                if !self.truthy(&value)? {
                    *pc = *target;
                }
            }
            Instruction::JumpIfTrue(target) => {
                let value = frame.pop()?;
                if self.truthy(&value)? {
                    *pc = *target;
                }
            }
            Instruction::JumpIfFalseOrPop(target) => {
                if self.truthy(frame.peek()?)? {
                    frame.pop()?;
                } else {
                    *pc = *target;
                }
            }
            Instruction::JumpIfTrueOrPop(target) => {
                if self.truthy(frame.peek()?)? {
                    *pc = *target;
                } else {
                    frame.pop()?;
                }
            }
            Instruction::CallFilter(idx, spec) => {
                let (args, kwargs) = self.pop_args(frame, spec)?;
                let value = frame.pop()?;
                let filter = self.filter(&frame.template, *idx)?;
                let rv = filter.call(&self.state(&frame.ctx), &value, &Args::new(&args, &kwargs))?;
                frame.stack.push(rv);
            }
            Instruction::PerformTest(idx, spec) => {
                let (args, kwargs) = self.pop_args(frame, spec)?;
                let value = frame.pop()?;
                let test = self.test(&frame.template, *idx)?;
                let rv = test.call(&self.state(&frame.ctx), &value, &Args::new(&args, &kwargs))?;
                frame.stack.push(Value::Bool(rv));
            }
            Instruction::PushLoop { recursive } => {
                let iterable = frame.pop()?;
                self.behavior().check_soft_use(&iterable)?;
                let iter = iterable.try_iter()?;
                let (depth0, recursion) = if *recursive {
                    let recursion = Recursion {
                        template: Arc::clone(&frame.template),
                        unit: frame.unit,
                        closure: frame.scope.parent().cloned(),
                        ctx: Arc::clone(&frame.ctx),
                    };
                    (frame.loop_depth, Some(recursion))
                } else {
                    (0, None)
                };
                frame.loops.push(Arc::new(LoopState::new(iter, depth0, recursion)));
            }
            Instruction::Iterate(target) => match frame.current_loop()?.next_item() {
                Some(item) => frame.stack.push(item),
                None => *pc = *target,
            },
            Instruction::LoadLoop => {
                let state = Arc::clone(frame.current_loop()?);
                frame.stack.push(Value::from_object(ObjectKind::Loop(state)));
            }
            Instruction::PopLoop { push_iterated } => {
                let state = frame.loops.pop().ok_or_else(|| Error::runtime("no active loop"))?;
                if *push_iterated {
                    frame.stack.push(Value::Bool(state.iterated()));
                }
            }
            Instruction::BeginCapture => out.begin_capture(),
            Instruction::EndCapture => {
                let body = out.end_capture();
                frame.stack.push(markup(body, frame.ctx.autoescape()));
            }
            Instruction::DiscardCapture => {
                out.end_capture();
            }
            Instruction::MakeMacro(spec) => {
                self.scopes.push(Arc::downgrade(&frame.scope));
                self.contexts.push(Arc::downgrade(&frame.ctx));
                let m = Macro {
                    spec: Arc::clone(spec),
                    template: Arc::clone(&frame.template),
                    closure: Arc::clone(&frame.scope),
                    ctx: Arc::clone(&frame.ctx),
                    autoescape: frame.ctx.autoescape(),
                };
                frame.stack.push(Value::from_object(ObjectKind::Macro(Arc::new(m))));
            }
            Instruction::Extends => {
                let name = frame.pop()?;
                let parent = self.lookup_template(&name, TemplateLookup::Get)?;
                frame.ctx.inherit_blocks(&parent);
                frame.extended = Some(parent);
            }
            Instruction::JumpIfExtended(target) => {
                if frame.extended.is_some() {
                    *pc = *target;
                }
            }
            Instruction::JumpIfNotExtended(target) => {
                if frame.extended.is_none() {
                    *pc = *target;
                }
            }
            Instruction::LoadSelf => {
                let tref = TemplateRef {
                    ctx: Arc::clone(&frame.ctx),
                };
                frame.stack.push(Value::from_object(ObjectKind::TemplateRef(Arc::new(tref))));
            }
            Instruction::LoadSuper(name) => {
                let stack = frame.ctx.blocks(name).unwrap_or_default();
                let position = stack
                    .iter()
                    .position(|block| block.is(&frame.template, frame.unit));
                let value = match position.map(|idx| idx.saturating_add(1)) {
                    Some(depth) if depth < stack.len() => Value::from_object(ObjectKind::BlockRef(Arc::new(BlockRef {
                        name: name.to_string(),
                        ctx: Arc::clone(&frame.ctx),
                        stack,
                        depth,
                    }))),
                    _ => no_parent_block(name),
                };
                frame.stack.push(value);
            }
            Instruction::GetModuleAttr { name, lineno } => {
                let module = frame.pop()?;
                let value = match module.object() {
                    Some(ObjectKind::Module(m)) => m.exports.get(&**name).cloned().ok_or_else(|| {
                        let location = match &frame.template.name {
                            Some(current) => format!("line {} in '{}'", lineno, current),
                            None => format!("line {}", lineno),
                        };
                        Value::Undefined(Undefined::with_hint(
                            Some(&**name),
                            &format!(
                                "the template '{}' (imported on {}) does not export the requested name '{}'",
                                m.name.as_deref().unwrap_or("<template>"),
                                location,
                                name
                            ),
                        ))
                    }),
                    _ => Err(missing_attribute(&module, name)),
                };
                frame.stack.push(value.unwrap_or_else(|undefined| undefined));
            }
            Instruction::BuildLocals(slots) => {
                let mut map = IndexMap::with_capacity(slots.len());
                for (name, slot) in slots {
                    if let Some(value) = frame.scope.get(*slot)? {
                        map.insert(Key::from(&**name), value);
                    }
                }
                frame.stack.push(Value::Map(Arc::new(map)));
            }
            Instruction::PushAutoescape => {
                let value = frame.pop()?;
                frame.autoescapes.push(frame.ctx.autoescape());
                frame.ctx.set_autoescape(value.is_true());
            }
            Instruction::PopAutoescape => {
                if let Some(previous) = frame.autoescapes.pop() {
                    frame.ctx.set_autoescape(previous);
                }
            }
            Instruction::SetNamespaceAttr(attr) => {
                let target = frame.pop()?;
                let value = frame.pop()?;
                match target.object() {
                    Some(ObjectKind::Namespace(ns)) => ns.set(attr, value),
                    _ => return Err(Error::runtime("cannot assign attribute on non-namespace object")),
                }
            }
            Instruction::MarkSafe => {
                let value = frame.pop()?;
                let rv = match frame.ctx.autoescape() && !value.is_safe() {
                    true => Value::from_safe_string(value.to_string()),
                    false => value,
                };
                frame.stack.push(rv);
            }
            Instruction::Fail(message) => return Err(Error::runtime(&**message)),
            Instruction::Call(_)
            | Instruction::CallMethod(..)
            | Instruction::FilterIter(_)
            | Instruction::CallRecursiveLoop(_)
            | Instruction::RenderParent
            | Instruction::CallBlock { .. }
            | Instruction::Include { .. }
            | Instruction::Import { .. } => return Err(Error::runtime("instruction dispatched out of line")),
        }
        Ok(())
    }

    #[inline(never)]
    fn exec_call(&mut self, frame: &mut Frame, spec: &CallSpec, out: &mut Output<'_>) -> JinjateResult<()> {
        let (args, kwargs) = self.pop_args(frame, spec)?;
        let callee = frame.pop()?;
        let rv = self.call_value(frame, &callee, args, kwargs, out)?;
        frame.stack.push(rv);
        Ok(())
    }

    #[inline(never)]
    fn exec_call_method(&mut self, frame: &mut Frame, name: &str, spec: &CallSpec, out: &mut Output<'_>) -> JinjateResult<()> {
        let (args, kwargs) = self.pop_args(frame, spec)?;
        let obj = frame.pop()?;
        let rv = self.call_method(frame, &obj, name, args, kwargs, out)?;
        frame.stack.push(rv);
        Ok(())
    }

    #[inline(never)]
    fn exec_filter_iter(&mut self, frame: &mut Frame, unit: UnitId, out: &mut Output<'_>) -> JinjateResult<()> {
        let iterable = frame.pop()?;
        self.behavior().check_soft_use(&iterable)?;
        let slots = frame.template.unit(unit).map_or(0, |unit| unit.num_slots);
        let mut kept = Vec::new();
        for item in iterable.try_iter()? {
            let mut child = Frame::new(
                Arc::clone(&frame.template),
                unit,
                Arc::clone(&frame.ctx),
                Scope::new(slots, Some(Arc::clone(&frame.scope))),
            );
            child.stack.push(item.clone());
            let accepted = self.run(child, out)?.unwrap_or(Value::Bool(false));
            if self.truthy(&accepted)? {
                kept.push(item);
            }
        }
        frame.stack.push(Value::from(kept));
        Ok(())
    }

    #[inline(never)]
    fn exec_recursive_loop(&mut self, frame: &mut Frame, unit: UnitId, out: &mut Output<'_>) -> JinjateResult<()> {
        let iterable = frame.pop()?;
        let slots = frame.template.unit(unit).map_or(0, |unit| unit.num_slots);
        let mut child = Frame::new(
            Arc::clone(&frame.template),
            unit,
            Arc::clone(&frame.ctx),
            Scope::new(slots, Some(Arc::clone(&frame.scope))),
        );
        child.stack.push(iterable);
        child.extended = frame.extended.clone();
        let body = self.run_captured(child, out)?;
        frame.stack.push(markup(body, frame.ctx.autoescape()));
        Ok(())
    }

    #[inline(never)]
    fn exec_call_block(
        &mut self,
        frame: &mut Frame,
        name: &str,
        scoped: bool,
        required: bool,
        out: &mut Output<'_>,
    ) -> JinjateResult<()> {
        let locals = match scoped {
            true => Some(frame.pop()?),
            false => None,
        };
        let stack = frame.ctx.blocks(name).unwrap_or_default();
        if required && stack.len() <= 1 {
            return Err(Error::runtime(format!("Required block '{}' not found", name)));
        }
        let Some(block) = stack.first() else {
            return Err(Error::runtime(format!("block '{}' is not defined", name)));
        };
        let ctx = match locals {
            Some(Value::Map(map)) => {
                let locals = map
                    .iter()
                    .filter_map(|(key, value)| Some((key.as_str()?.to_string(), value.clone())))
                    .collect();
                let derived = Arc::new(frame.ctx.derived(locals));
                self.contexts.push(Arc::downgrade(&derived));
                derived
            }
            _ => Arc::clone(&frame.ctx),
        };
        let slots = block.template.unit(block.unit).map_or(0, |unit| unit.num_slots);
        let child = Frame::new(Arc::clone(&block.template), block.unit, ctx, Scope::new(slots, None));
        self.run(child, out).map(drop)
    }

    #[inline(never)]
    fn exec_include(
        &mut self,
        frame: &mut Frame,
        lookup: TemplateLookup,
        ignore_missing: bool,
        with_context: bool,
        out: &mut Output<'_>,
    ) -> JinjateResult<()> {
        let locals = match with_context {
            true => Some(frame.pop()?),
            false => None,
        };
        let name = frame.pop()?;
        let included = match self.lookup_template(&name, lookup) {
            Ok(included) => included,
            Err(err) if ignore_missing && err.kind().is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        let vars = self.template_vars(&frame.ctx, locals);
        let ctx = self.new_context(&included, vars);
        self.run_root(&included, ctx, out)
    }

    #[inline(never)]
    fn exec_import(&mut self, frame: &mut Frame, with_context: bool, out: &mut Output<'_>) -> JinjateResult<()> {
        let locals = match with_context {
            true => Some(frame.pop()?),
            false => None,
        };
        let name = frame.pop()?;
        let imported = self.lookup_template(&name, TemplateLookup::Get)?;
        let vars = self.template_vars(&frame.ctx, locals);
        let ctx = self.new_context(&imported, vars);
        out.begin_capture();
        let rv = self.run_root(&imported, Arc::clone(&ctx), out);
        let body = out.end_capture();
        rv?;
        let module = Module {
            name: imported.name.clone(),
            exports: ctx.get_exported(),
            body,
        };
        frame.stack.push(Value::from_object(ObjectKind::Module(Arc::new(module))));
        Ok(())
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> JinjateResult<bool> {
        if matches!(op, CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq) {
            fail_undefined(left)?;
            fail_undefined(right)?;
        }
        if matches!(op, CmpOp::In | CmpOp::NotIn) {
            self.behavior().check_soft_use(right)?;
        }
        ops::compare(op, left, right)
    }

    fn call_method(
        &mut self,
        frame: &Frame,
        obj: &Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        out: &mut Output<'_>,
    ) -> JinjateResult<Value> {
        if let Some(ObjectKind::Loop(state)) = obj.object() {
            match name {
                "cycle" => return state.cycle(&args),
                "changed" => return Ok(Value::Bool(state.changed(&args))),
                _ => {}
            }
        }
        if !obj.is_undefined() {
            if let Some(rv) = builtin_method(obj, name, &Args::new(&args, &kwargs)) {
                return rv;
            }
        }
        let callee = self.get_attr(obj, name)?;
        self.call_value(frame, &callee, args, kwargs, out)
    }
}

#[cfg(test)]
mod tests {
    use crate::{environment::Environment, error::ErrorKind, interface::Context, sandbox::DefaultSandbox};

    fn render(env: &Environment, source: &str, ctx: &Context) -> crate::JinjateResult<String> {
        env.from_string(source)?.render(ctx)
    }

    fn render_plain(source: &str) -> String {
        render(&Environment::new(), source, &Context::new()).unwrap()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_controls_and_else() {
        assert_eq!(
            render_plain("{% for i in range(6) %}{% if i == 4 %}{% break %}{% endif %}{% if i is odd %}{% continue %}{% endif %}{{ i }}{% endfor %}"),
            "02"
        );
        assert_eq!(render_plain("{% for i in [] %}x{% else %}empty{% endfor %}"), "empty");
        assert_eq!(
            render_plain("{% for i in range(3) %}{% set x %}{% break %}{% endset %}{% endfor %}done"),
            "done"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_helpers() {
        assert_eq!(
            render_plain("{% for i in 'abc' %}{{ loop.cycle('x', 'y') }}{{ loop.index }}{% endfor %}"),
            "x1y2x3"
        );
        assert_eq!(
            render_plain("{% for i in [1, 1, 2] %}{% if loop.changed(i) %}{{ i }}{% endif %}{% endfor %}"),
            "12"
        );
        assert_eq!(
            render_plain("{% for i in range(10) if i is even %}{{ loop.length }}{% endfor %}"),
            "55555"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_recursive_loop_depth() {
        let source = "{% for item in tree recursive %}{{ loop.depth }}{{ item.name }}\
                      {% if item.children %}[{{ loop(item.children) }}]{% endif %}{% endfor %}";
        let leaf = crate::Value::from_map([("name", "b")]);
        let tree = crate::Value::from(vec![crate::Value::from_map([
            ("name", crate::Value::from("a")),
            ("children", crate::Value::from(vec![leaf])),
        ])]);
        let ctx: Context = [("tree".to_string(), tree)].into_iter().collect();
        assert_eq!(render(&Environment::new(), source, &ctx).unwrap(), "1a[2b]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unpack_errors() {
        let err = render(&Environment::new(), "{% set a, b = [1] %}", &Context::new()).unwrap_err();
        assert_eq!(err.message(), "not enough values to unpack (expected 2, got 1)");
        let err = render(&Environment::new(), "{% set a, b = [1, 2, 3] %}", &Context::new()).unwrap_err();
        assert_eq!(err.message(), "too many values to unpack (expected 2)");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_namespace_assignment() {
        assert_eq!(
            render_plain("{% set ns = namespace(n=0) %}{% for i in range(3) %}{% set ns.n = ns.n + i %}{% endfor %}{{ ns.n }}"),
            "3"
        );
        let err = render(&Environment::new(), "{% set d = {} %}{% set d.x = 1 %}", &Context::new()).unwrap_err();
        assert_eq!(err.message(), "cannot assign attribute on non-namespace object");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_conditional_store_falls_back_to_context() {
        let source = "{% if flag %}{% set name = 'local' %}{% endif %}{{ name is defined }}:{{ name }}";
        let mut ctx = Context::new();
        ctx.insert("flag", false);
        assert_eq!(render(&Environment::new(), source, &ctx).unwrap(), "False:");
        ctx.insert("name", "outer");
        assert_eq!(render(&Environment::new(), source, &ctx).unwrap(), "True:outer");
        ctx.insert("flag", true);
        assert_eq!(render(&Environment::new(), source, &ctx).unwrap(), "True:local");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_recursion_limit() {
        let mut env = Environment::new();
        env.set_recursion_limit(20);
        let err = render(&env, "{% macro f() %}{{ f() }}{% endmacro %}{{ f() }}", &Context::new()).unwrap_err();
        assert_eq!(err.message(), "maximum recursion depth exceeded");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_default_recursion_limit_fits_a_small_stack() {
        let handle = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let mut env = Environment::new();
                env.set_loader(crate::loader::MapLoader::from_iter([("self.html", "{% include 'self.html' %}")]));
                let sources = [
                    "{% macro r() %}{{ r() }}{% endmacro %}{{ r() }}",
                    "{% for x in [1] recursive %}{{ loop([x]) }}{% endfor %}",
                    "{% include 'self.html' %}",
                ];
                sources
                    .iter()
                    .map(|source| render(&env, source, &Context::new()).map_err(|err| err.message().to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap();
        for rv in handle.join().unwrap() {
            assert_eq!(rv, Err("maximum recursion depth exceeded".to_string()));
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_attribute_hint() {
        let mut env = Environment::new();
        env.set_undefined_behavior(crate::UndefinedBehavior::Strict);
        let ctx: Context = [("d".to_string(), crate::Value::from_map([("a", 1)]))].into_iter().collect();
        let err = render(&env, "{{ d.x }}", &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Undefined);
        assert_eq!(err.message(), "'dict object' has no attribute 'x'");
        let err = render(&env, "{{ none.x }}", &Context::new()).unwrap_err();
        assert_eq!(err.message(), "'None' has no attribute 'x'");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_sandbox_denies_private_attributes_and_calls() {
        let mut env = Environment::new();
        env.set_sandbox(DefaultSandbox::new().deny_callable("range"));
        let ctx: Context = [("d".to_string(), crate::Value::from_map([("_secret", 1)]))].into_iter().collect();
        assert_eq!(render(&env, "{{ d._secret }}", &ctx).unwrap(), "");
        let err = render(&env, "{{ d._secret + 1 }}", &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        let err = render(&env, "{{ range(3) }}", &Context::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_calling_non_callables() {
        let err = render(&Environment::new(), "{{ 42() }}", &Context::new()).unwrap_err();
        assert_eq!(err.message(), "'int' object is not callable");
        let err = render(&Environment::new(), "{% for i in [1] %}{{ loop([]) }}{% endfor %}", &Context::new())
            .unwrap_err();
        assert!(err.message().starts_with("Tried to call non recursive loop"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_runtime_error_carries_line() {
        let err = render(&Environment::new(), "line one\n{{ 1 // 0 }}", &Context::new()).unwrap_err();
        assert_eq!(err.lineno(), Some(2));
    }
}
