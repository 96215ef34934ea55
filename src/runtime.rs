//! Objects compiled code works with while it runs.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::{
    error::{Error, JinjateResult},
    functions::Function,
    instructions::{CompiledTemplate, MacroSpec, SlotRef, UnitId},
    value::{Key, Kwargs, Undefined, Value, ValueIter},
};

/// The variable slots of one executing unit, chained to the scope the unit was defined in.
pub(crate) struct Scope {
    slots: Mutex<Vec<Option<Value>>>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub(crate) fn new(size: usize, parent: Option<Arc<Self>>) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![None; size]),
            parent,
        })
    }

    pub(crate) const fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    fn ancestor(&self, up: usize) -> JinjateResult<&Self> {
        let mut scope = self;
        for _ in 0..up {
            scope = scope
                .parent
                .as_deref()
                .ok_or_else(|| Error::runtime("variable reference escapes its scope"))?;
        }
        Ok(scope)
    }

    /// The slot's value, `None` while it is missing.
    pub(crate) fn get(&self, target: SlotRef) -> JinjateResult<Option<Value>> {
        let scope = self.ancestor(target.up)?;
        let slots = scope.slots.lock();
        Ok(slots.get(target.slot).cloned().flatten())
    }

    pub(crate) fn set(&self, target: SlotRef, value: Option<Value>) -> JinjateResult<()> {
        let scope = self.ancestor(target.up)?;
        let mut slots = scope.slots.lock();
        let slot = slots
            .get_mut(target.slot)
            .ok_or_else(|| Error::runtime("variable slot out of range"))?;
        *slot = value;
        Ok(())
    }

    /// Drops every value, breaking reference cycles through macros that captured this scope.
    pub(crate) fn clear(&self) {
        for slot in self.slots.lock().iter_mut() {
            *slot = None;
        }
    }
}

/// One implementation of a block: a unit in some template of the inheritance chain.
#[derive(Debug, Clone)]
pub(crate) struct BlockImpl {
    pub template: Arc<CompiledTemplate>,
    pub unit: UnitId,
}

impl BlockImpl {
    pub(crate) fn is(&self, template: &Arc<CompiledTemplate>, unit: UnitId) -> bool {
        Arc::ptr_eq(&self.template, template) && self.unit == unit
    }
}

/// The variables, blocks and evaluation state of one render.
pub(crate) struct RenderContext {
    name: Option<String>,
    parent: IndexMap<String, Value>,
    vars: Mutex<IndexMap<String, Value>>,
    exported: Mutex<IndexSet<String>>,
    blocks: Mutex<IndexMap<String, Vec<BlockImpl>>>,
    autoescape: AtomicBool,
}

impl RenderContext {
    pub(crate) fn new(
        template: &Arc<CompiledTemplate>,
        parent: IndexMap<String, Value>,
        autoescape: bool,
    ) -> Self {
        let blocks = template
            .blocks
            .iter()
            .map(|(name, unit)| {
                let block = BlockImpl {
                    template: Arc::clone(template),
                    unit: *unit,
                };
                (name.clone(), vec![block])
            })
            .collect();
        Self {
            name: template.name.clone(),
            parent,
            vars: Mutex::new(IndexMap::new()),
            exported: Mutex::new(IndexSet::new()),
            blocks: Mutex::new(blocks),
            autoescape: AtomicBool::new(autoescape),
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn resolve_or_missing(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.vars.lock().get(key) {
            return Some(value.clone());
        }
        self.parent.get(key).cloned()
    }

    pub(crate) fn resolve(&self, key: &str) -> Value {
        self.resolve_or_missing(key)
            .unwrap_or_else(|| Value::undefined(key))
    }

    pub(crate) fn set_var(&self, name: &str, value: Value) {
        self.vars.lock().insert(name.to_string(), value);
    }

    pub(crate) fn export(&self, name: &str) {
        self.exported.lock().insert(name.to_string());
    }

    pub(crate) fn unexport(&self, name: &str) {
        self.exported.lock().shift_remove(name);
    }

    /// The parent mapping overlaid with everything assigned during the render.
    pub(crate) fn get_all(&self) -> IndexMap<String, Value> {
        let mut rv = self.parent.clone();
        rv.extend(
            self.vars
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        rv
    }

    /// The exported top level variables, in the order they were exported.
    pub(crate) fn get_exported(&self) -> IndexMap<String, Value> {
        let vars = self.vars.lock();
        self.exported
            .lock()
            .iter()
            .filter_map(|name| vars.get(name).map(|value| (name.clone(), value.clone())))
            .collect()
    }

    /// A context seeing every current variable plus `locals`, sharing the block chains.
    pub(crate) fn derived(&self, locals: IndexMap<String, Value>) -> Self {
        let mut parent = self.get_all();
        parent.extend(locals);
        Self {
            name: self.name.clone(),
            parent,
            vars: Mutex::new(IndexMap::new()),
            exported: Mutex::new(IndexSet::new()),
            blocks: Mutex::new(self.blocks.lock().clone()),
            autoescape: AtomicBool::new(self.autoescape()),
        }
    }

    pub(crate) fn autoescape(&self) -> bool {
        self.autoescape.load(Ordering::Relaxed)
    }

    pub(crate) fn set_autoescape(&self, value: bool) {
        self.autoescape.store(value, Ordering::Relaxed);
    }

    pub(crate) fn blocks(&self, name: &str) -> Option<Vec<BlockImpl>> {
        self.blocks.lock().get(name).cloned()
    }

    /// Appends the parent template's blocks behind the ones already registered.
    pub(crate) fn inherit_blocks(&self, parent: &Arc<CompiledTemplate>) {
        let mut blocks = self.blocks.lock();
        for (name, unit) in &parent.blocks {
            blocks.entry(name.clone()).or_default().push(BlockImpl {
                template: Arc::clone(parent),
                unit: *unit,
            });
        }
    }

    /// Drops assigned variables, breaking cycles between the context and macros stored in it.
    pub(crate) fn clear(&self) {
        self.vars.lock().clear();
    }
}

/// Lets a recursive loop call itself through `loop(...)`.
pub(crate) struct Recursion {
    pub template: Arc<CompiledTemplate>,
    pub unit: UnitId,
    pub closure: Option<Arc<Scope>>,
    pub ctx: Arc<RenderContext>,
}

struct LoopCursor {
    iter: Box<dyn Iterator<Item = Value> + Send>,
    /// Position of the current item; `None` before the first one.
    index0: Option<usize>,
    length: Option<usize>,
    /// One item of lookahead: `Some(None)` once the iterator is known to be exhausted.
    after: Option<Option<Value>>,
    current: Option<Value>,
    before: Option<Value>,
    last_changed: Option<Vec<Value>>,
}

impl LoopCursor {
    fn peek(&mut self) -> Option<&Value> {
        if self.after.is_none() {
            self.after = Some(self.iter.next());
        }
        self.after.as_ref().and_then(Option::as_ref)
    }

    fn consumed(&self) -> usize {
        self.index0.map_or(0, |idx| idx.saturating_add(1))
    }

    fn length(&mut self) -> usize {
        if let Some(length) = self.length {
            return length;
        }
        let rest: Vec<Value> = std::mem::replace(&mut self.iter, Box::new(std::iter::empty())).collect();
        let pending = usize::from(matches!(self.after, Some(Some(_))));
        let length = rest.len().saturating_add(self.consumed()).saturating_add(pending);
        self.iter = Box::new(rest.into_iter());
        self.length = Some(length);
        length
    }
}

/// The state of a `for` loop, exposed to templates as `loop`.
pub(crate) struct LoopState {
    cursor: Mutex<LoopCursor>,
    depth0: usize,
    recursion: Option<Recursion>,
}

impl LoopState {
    pub(crate) fn new(iter: ValueIter, depth0: usize, recursion: Option<Recursion>) -> Self {
        let length = iter.known_len();
        Self {
            cursor: Mutex::new(LoopCursor {
                iter: iter.into_inner(),
                index0: None,
                length,
                after: None,
                current: None,
                before: None,
                last_changed: None,
            }),
            depth0,
            recursion,
        }
    }

    /// Advances the loop.
    pub(crate) fn next_item(&self) -> Option<Value> {
        let mut cursor = self.cursor.lock();
        let item = match cursor.after.take() {
            Some(after) => after,
            None => cursor.iter.next(),
        }?;
        cursor.index0 = Some(cursor.index0.map_or(0, |idx| idx.saturating_add(1)));
        cursor.before = cursor.current.replace(item.clone());
        Some(item)
    }

    /// Whether at least one item was produced.
    pub(crate) fn iterated(&self) -> bool {
        self.cursor.lock().index0.is_some()
    }

    pub(crate) const fn depth(&self) -> usize {
        self.depth0.saturating_add(1)
    }

    pub(crate) const fn recursion(&self) -> Option<&Recursion> {
        self.recursion.as_ref()
    }

    pub(crate) fn length(&self) -> usize {
        self.cursor.lock().length()
    }

    pub(crate) fn get_attr(&self, name: &str) -> Option<Value> {
        let mut cursor = self.cursor.lock();
        let index0 = cursor.index0.unwrap_or(0);
        let rv = match name {
            "index0" => Value::from(index0),
            "index" => Value::from(index0.saturating_add(1)),
            "revindex" => Value::from(cursor.length().saturating_sub(index0)),
            "revindex0" => Value::from(cursor.length().saturating_sub(index0).saturating_sub(1)),
            "first" => Value::Bool(index0 == 0),
            "last" => Value::Bool(cursor.peek().is_none()),
            "length" => Value::from(cursor.length()),
            "depth" => Value::from(self.depth()),
            "depth0" => Value::from(self.depth0),
            "previtem" => match (&cursor.before, index0) {
                (Some(before), idx) if idx > 0 => before.clone(),
                _ => Value::Undefined(Undefined::with_hint(None, "there is no previous item")),
            },
            "nextitem" => match cursor.peek() {
                Some(next) => next.clone(),
                None => Value::Undefined(Undefined::with_hint(None, "there is no next item")),
            },
            _ => return None,
        };
        Some(rv)
    }

    /// `loop.cycle(*values)`: the value at the current position, wrapping around.
    pub(crate) fn cycle(&self, args: &[Value]) -> JinjateResult<Value> {
        if args.is_empty() {
            return Err(Error::type_error("no items for cycling given"));
        }
        let index0 = self.cursor.lock().index0.unwrap_or(0);
        Ok(args
            .get(index0 % args.len())
            .cloned()
            .unwrap_or(Value::None))
    }

    /// `loop.changed(*values)`: true the first time and whenever the values differ from the
    /// previous call.
    pub(crate) fn changed(&self, args: &[Value]) -> bool {
        let mut cursor = self.cursor.lock();
        if cursor.last_changed.as_deref() == Some(args) {
            return false;
        }
        cursor.last_changed = Some(args.to_vec());
        true
    }
}

/// A macro or call block body bound to the scope and context it was defined in.
pub(crate) struct Macro {
    pub spec: Arc<MacroSpec>,
    pub template: Arc<CompiledTemplate>,
    pub closure: Arc<Scope>,
    pub ctx: Arc<RenderContext>,
    /// Whether the output is marked safe, fixed when the macro is defined.
    pub autoescape: bool,
}

impl Macro {
    /// Binds call arguments to parameter slot values, in `spec.params` order. Missing
    /// arguments are `None` so that their defaults run.
    pub(crate) fn bind(&self, mut args: Vec<Value>, mut kwargs: Kwargs) -> JinjateResult<Vec<Option<Value>>> {
        let spec = &self.spec;
        let argc = spec.arguments.len();
        let extra: Vec<Value> = if args.len() > argc {
            args.split_off(argc)
        } else {
            Vec::new()
        };
        let mut rv: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        for name in spec.arguments.iter().skip(rv.len()) {
            rv.push(kwargs.shift_remove(name.as_ref()));
        }
        if spec.caller && !spec.explicit_caller {
            let caller = kwargs.shift_remove("caller").unwrap_or_else(|| {
                Value::Undefined(Undefined::with_hint(Some("caller"), "No caller defined"))
            });
            rv.push(Some(caller));
        }
        if spec.catch_kwargs {
            let map: IndexMap<Key, Value> = kwargs
                .into_iter()
                .map(|(k, v)| (Key::from(k), v))
                .collect();
            rv.push(Some(Value::Map(Arc::new(map))));
        } else if let Some(name) = kwargs.keys().next() {
            if name == "caller" {
                return Err(Error::type_error(format!(
                    "macro '{}' was invoked with two values for the special caller argument. This is most likely a bug.",
                    spec.name
                )));
            }
            return Err(Error::type_error(format!(
                "macro '{}' takes no keyword argument '{}'",
                spec.name, name
            )));
        }
        if spec.catch_varargs {
            rv.push(Some(Value::tuple(extra)));
        } else if !extra.is_empty() {
            return Err(Error::type_error(format!(
                "macro '{}' takes not more than {} argument(s)",
                spec.name, argc
            )));
        }
        Ok(rv)
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        let spec = &self.spec;
        let rv = match name {
            "name" => Value::from(spec.name.clone()),
            "arguments" => Value::tuple(
                spec.arguments
                    .iter()
                    .map(|arg| Value::from(arg.clone()))
                    .collect(),
            ),
            "catch_kwargs" => Value::Bool(spec.catch_kwargs),
            "catch_varargs" => Value::Bool(spec.catch_varargs),
            "caller" => Value::Bool(spec.caller),
            _ => return None,
        };
        Some(rv)
    }
}

/// A mutable attribute bag, the one object templates may assign attributes on.
#[derive(Default)]
pub(crate) struct Namespace {
    attrs: Mutex<IndexMap<String, Value>>,
}

impl Namespace {
    pub(crate) fn set(&self, name: &str, value: Value) {
        self.attrs.lock().insert(name.to_string(), value);
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.attrs.lock().get(name).cloned()
    }
}

/// A rendered template seen from the outside: its exported names and its output.
pub(crate) struct Module {
    pub name: Option<String>,
    pub exports: IndexMap<String, Value>,
    pub body: String,
}

/// One position in a block's override chain, callable to render it.
pub(crate) struct BlockRef {
    pub name: String,
    pub ctx: Arc<RenderContext>,
    pub stack: Vec<BlockImpl>,
    pub depth: usize,
}

impl BlockRef {
    pub(crate) fn current(&self) -> Option<&BlockImpl> {
        self.stack.get(self.depth)
    }

    fn parent(&self) -> Value {
        let depth = self.depth.saturating_add(1);
        if depth >= self.stack.len() {
            return no_parent_block(&self.name);
        }
        Value::from_object(ObjectKind::BlockRef(Arc::new(Self {
            name: self.name.clone(),
            ctx: Arc::clone(&self.ctx),
            stack: self.stack.clone(),
            depth,
        })))
    }
}

pub(crate) fn no_parent_block(name: &str) -> Value {
    Value::Undefined(Undefined::with_hint(
        Some("super"),
        &format!("there is no parent block called '{}'.", name),
    ))
}

/// `self` inside templates: gives access to the blocks of the render.
pub(crate) struct TemplateRef {
    pub ctx: Arc<RenderContext>,
}

impl TemplateRef {
    fn get_attr(&self, name: &str) -> Option<Value> {
        let stack = self.ctx.blocks(name)?;
        Some(Value::from_object(ObjectKind::BlockRef(Arc::new(BlockRef {
            name: name.to_string(),
            ctx: Arc::clone(&self.ctx),
            stack,
            depth: 0,
        }))))
    }
}

/// The runtime objects behind [`crate::value::Object`].
#[derive(Clone)]
pub(crate) enum ObjectKind {
    Function(Arc<Function>),
    Macro(Arc<Macro>),
    Loop(Arc<LoopState>),
    Namespace(Arc<Namespace>),
    Module(Arc<Module>),
    BlockRef(Arc<BlockRef>),
    TemplateRef(Arc<TemplateRef>),
}

impl ObjectKind {
    pub(crate) const fn type_name(&self) -> &'static str {
        match self {
            Self::Function(_) => "function",
            Self::Macro(_) => "Macro",
            Self::Loop(_) => "LoopContext",
            Self::Namespace(_) => "Namespace",
            Self::Module(_) => "TemplateModule",
            Self::BlockRef(_) => "BlockReference",
            Self::TemplateRef(_) => "TemplateReference",
        }
    }

    pub(crate) fn len(&self) -> Option<usize> {
        match self {
            Self::Loop(state) => Some(state.length()),
            Self::Namespace(ns) => Some(ns.attrs.lock().len()),
            Self::Function(_)
            | Self::Macro(_)
            | Self::Module(_)
            | Self::BlockRef(_)
            | Self::TemplateRef(_) => None,
        }
    }

    pub(crate) const fn try_iter(&self) -> Option<ValueIter> {
        None
    }

    /// Modules print their rendered body, which is already markup.
    pub(crate) const fn is_markup(&self) -> bool {
        matches!(self, Self::Module(_))
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Macro(a), Self::Macro(b)) => Arc::ptr_eq(a, b),
            (Self::Loop(a), Self::Loop(b)) => Arc::ptr_eq(a, b),
            (Self::Namespace(a), Self::Namespace(b)) => Arc::ptr_eq(a, b),
            (Self::Module(a), Self::Module(b)) => Arc::ptr_eq(a, b),
            (Self::BlockRef(a), Self::BlockRef(b)) => Arc::ptr_eq(a, b),
            (Self::TemplateRef(a), Self::TemplateRef(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn get_attr(&self, name: &str) -> Option<Value> {
        match self {
            Self::Macro(m) => m.get_attr(name),
            Self::Loop(state) => state.get_attr(name),
            Self::Namespace(ns) => ns.get(name),
            Self::Module(module) => module.exports.get(name).cloned(),
            Self::BlockRef(block) => (name == "super").then(|| block.parent()),
            Self::TemplateRef(tref) => tref.get_attr(name),
            Self::Function(_) => None,
        }
    }

    pub(crate) fn fmt_display(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(func) => write!(f, "<function {}>", func.name()),
            Self::Macro(m) => write!(f, "<Macro '{}'>", m.spec.name),
            Self::Loop(state) => {
                let index = state.cursor.lock().consumed();
                write!(f, "<LoopContext {}/{}>", index, state.length())
            }
            Self::Namespace(ns) => {
                let attrs: IndexMap<Key, Value> = ns
                    .attrs
                    .lock()
                    .iter()
                    .map(|(k, v)| (Key::from(k.as_str()), v.clone()))
                    .collect();
                write!(f, "<Namespace {}>", Value::Map(Arc::new(attrs)))
            }
            Self::Module(module) => f.write_str(&module.body),
            Self::BlockRef(block) => write!(f, "<BlockReference '{}'>", block.name),
            Self::TemplateRef(tref) => write!(
                f,
                "<TemplateReference '{}'>",
                tref.ctx.name().unwrap_or("<template>")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_over(items: Vec<Value>, known_len: bool) -> LoopState {
        let len = items.len();
        let iter = ValueIter::new(Box::new(items.into_iter()), known_len.then_some(len));
        LoopState::new(iter, 0, None)
    }

    fn attr(state: &LoopState, name: &str) -> Value {
        state.get_attr(name).unwrap()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_metadata() {
        let state = loop_over(vec![Value::from("a"), Value::from("b"), Value::from("c")], false);
        let mut seen = Vec::new();
        while let Some(item) = state.next_item() {
            seen.push((
                item.to_string(),
                attr(&state, "index").to_string(),
                attr(&state, "first").is_true(),
                attr(&state, "last").is_true(),
                attr(&state, "length").to_string(),
            ));
        }
        assert_eq!(
            seen,
            vec![
                ("a".into(), "1".into(), true, false, "3".into()),
                ("b".into(), "2".into(), false, false, "3".into()),
                ("c".into(), "3".into(), false, true, "3".into()),
            ]
        );
        assert!(state.iterated());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_length_after_lookahead_keeps_pending_item() {
        let state = loop_over((0..4).map(Value::from).collect(), false);
        assert_eq!(state.next_item(), Some(Value::from(0)));
        assert_eq!(attr(&state, "nextitem"), Value::from(1));
        assert_eq!(attr(&state, "length"), Value::from(4));
        assert_eq!(attr(&state, "revindex"), Value::from(4));
        assert_eq!(attr(&state, "revindex0"), Value::from(3));
        let rest: Vec<Value> = std::iter::from_fn(|| state.next_item()).collect();
        assert_eq!(rest, vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(attr(&state, "previtem"), Value::from(2));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_cycle_and_changed() {
        let state = loop_over(vec![Value::from(1), Value::from(1), Value::from(2)], true);
        let mut cycled = Vec::new();
        let mut changed = Vec::new();
        while let Some(item) = state.next_item() {
            cycled.push(state.cycle(&[Value::from("odd"), Value::from("even")]).unwrap().to_string());
            changed.push(state.changed(&[item]));
        }
        assert_eq!(cycled, vec!["odd", "even", "odd"]);
        assert_eq!(changed, vec![true, false, true]);
        assert!(state.cycle(&[]).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_scope_chain() {
        let outer = Scope::new(2, None);
        let inner = Scope::new(1, Some(Arc::clone(&outer)));
        inner.set(SlotRef { up: 1, slot: 1 }, Some(Value::from(5))).unwrap();
        assert_eq!(outer.get(SlotRef { up: 0, slot: 1 }).unwrap(), Some(Value::from(5)));
        assert_eq!(inner.get(SlotRef { up: 0, slot: 0 }).unwrap(), None);
        assert!(inner.get(SlotRef { up: 2, slot: 0 }).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_macro_binding_errors() {
        let spec = MacroSpec {
            unit: 1,
            name: "m".into(),
            arguments: vec!["a".into()],
            params: vec![0],
            caller: false,
            catch_kwargs: false,
            catch_varargs: false,
            explicit_caller: false,
        };
        let template = Arc::new(CompiledTemplate::default());
        let m = Macro {
            spec: Arc::new(spec),
            ctx: Arc::new(RenderContext::new(&template, IndexMap::new(), false)),
            template,
            closure: Scope::new(0, None),
            autoescape: false,
        };
        let err = m.bind(vec![Value::from(1), Value::from(2)], Kwargs::new()).unwrap_err();
        assert_eq!(err.message(), "macro 'm' takes not more than 1 argument(s)");

        let mut kwargs = Kwargs::new();
        kwargs.insert("x".into(), Value::None);
        let err = m.bind(vec![], kwargs).unwrap_err();
        assert_eq!(err.message(), "macro 'm' takes no keyword argument 'x'");

        let bound = m.bind(vec![], Kwargs::new()).unwrap();
        assert_eq!(bound, vec![None], "a missing argument stays unbound for its default");
    }
}
