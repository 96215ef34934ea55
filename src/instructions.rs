//! The compiled form of a template: flat instruction lists with a line map.

use std::{collections::BTreeSet, fmt, sync::Arc};

use indexmap::IndexMap;

use crate::value::{BinOpKind, CmpOp, Value};

/// Index of a [`CodeUnit`] within its [`CompiledTemplate`].
pub type UnitId = usize;

/// The unit holding the template's top level code.
pub const ROOT_UNIT: UnitId = 0;

/// A variable slot, `up` scopes out from the executing one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub up: usize,
    pub slot: usize,
}

/// How a value is converted when written to the output.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EmitMode {
    /// Escaped, because autoescaping is known to be on.
    Escape,
    /// Converted to a string as is.
    Str,
    /// Decided at runtime from the evaluation context.
    Auto,
}

/// What a top level store does to the set of exported names.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Export {
    Add,
    Discard,
    Keep,
}

/// Which environment lookup an include uses for its template expression.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TemplateLookup {
    /// A single name.
    Get,
    /// A list of candidate names.
    Select,
    /// Decided by the runtime type of the value.
    Either,
}

/// The shape of the arguments on the stack for a call, filter or test.
///
/// Values are pushed in this order: positional arguments, keyword argument values, the `*args`
/// value and the `**kwargs` value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSpec {
    pub args: usize,
    pub kwargs: Vec<Arc<str>>,
    pub dyn_args: bool,
    pub dyn_kwargs: bool,
}

impl CallSpec {
    /// The number of stack values the arguments occupy.
    pub fn stack_len(&self) -> usize {
        self.args
            .saturating_add(self.kwargs.len())
            .saturating_add(usize::from(self.dyn_args))
            .saturating_add(usize::from(self.dyn_kwargs))
    }
}

/// Everything needed to create a macro object at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroSpec {
    pub unit: UnitId,
    pub name: Arc<str>,
    /// Declared argument names, in order.
    pub arguments: Vec<Arc<str>>,
    /// Parameter slots in binding order: arguments, then `caller`, `kwargs` and `varargs` when
    /// the body uses them.
    pub params: Vec<usize>,
    pub caller: bool,
    pub catch_kwargs: bool,
    pub catch_varargs: bool,
    /// `caller` is one of the declared arguments.
    pub explicit_caller: bool,
}

#[derive(Debug, Clone)]
pub enum Instruction {
    /// Writes constant text.
    Emit(Arc<str>),
    /// Pops a value and writes it.
    EmitValue(EmitMode),
    LoadConst(Value),
    /// Pushes a slot's value, or an undefined value carrying the name if the slot is missing.
    LoadRef(SlotRef, Arc<str>),
    StoreRef(SlotRef),
    /// Copies a slot, keeping it missing if the source is.
    CopyRef(SlotRef, SlotRef),
    /// Marks a slot as missing.
    ClearRef(SlotRef),
    /// Jumps if the slot holds a value.
    JumpIfBound(SlotRef, usize),
    /// Stores a context variable, or marks the slot missing.
    Resolve { name: Arc<str>, slot: SlotRef },
    /// Copies a slot into the context variables of a top level scope.
    Publish {
        name: Arc<str>,
        slot: SlotRef,
        export: Export,
    },
    Pop,
    BuildList(usize),
    BuildTuple(usize),
    BuildMap(usize),
    /// Pops a sequence and pushes its items so that the first one ends up on top.
    UnpackSeq(usize),
    BinOp(BinOpKind),
    Neg,
    Pos,
    Not,
    Compare(CmpOp),
    /// One link of a comparison chain: on failure pushes `false` and jumps, otherwise keeps the
    /// right operand for the next link.
    CompareChain(CmpOp, usize),
    Concat(usize),
    GetAttr(Arc<str>),
    GetItem,
    Slice,
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    JumpIfFalseOrPop(usize),
    JumpIfTrueOrPop(usize),
    CallFilter(usize, CallSpec),
    PerformTest(usize, CallSpec),
    Call(CallSpec),
    CallMethod(Arc<str>, CallSpec),
    /// Pops an iterable and pushes the items the test unit accepts.
    FilterIter(UnitId),
    /// Pops an iterable and starts a loop over it.
    PushLoop {
        recursive: bool,
    },
    /// Pushes the next item, or jumps once the innermost loop is exhausted.
    Iterate(usize),
    /// Pushes the innermost loop object.
    LoadLoop,
    /// Ends the innermost loop, pushing whether it ran at least once when asked to.
    PopLoop {
        push_iterated: bool,
    },
    /// Pops an iterable and runs a recursive loop unit over it, pushing the rendered output.
    CallRecursiveLoop(UnitId),
    BeginCapture,
    /// Pops the innermost capture and pushes it, marked safe when autoescaping is on.
    EndCapture,
    DiscardCapture,
    MakeMacro(Arc<MacroSpec>),
    /// Pops a template name and loads it as the parent template.
    Extends,
    JumpIfExtended(usize),
    JumpIfNotExtended(usize),
    RenderParent,
    /// Renders the most derived implementation of a block. When `scoped`, pops the locals
    /// the block sees.
    CallBlock {
        name: Arc<str>,
        scoped: bool,
        required: bool,
    },
    LoadSelf,
    LoadSuper(Arc<str>),
    /// Pops a template expression (and locals when `with_context`) and renders it.
    Include {
        lookup: TemplateLookup,
        ignore_missing: bool,
        with_context: bool,
    },
    /// Pops a template name (and locals when `with_context`) and pushes the module.
    Import {
        with_context: bool,
    },
    /// Pops a module and pushes one of its exports, or an undefined value explaining why not.
    GetModuleAttr {
        name: Arc<str>,
        lineno: usize,
    },
    /// Pushes a map of the named slots that are bound.
    BuildLocals(Vec<(Arc<str>, SlotRef)>),
    /// Saves the autoescape flag and sets it from the popped value.
    PushAutoescape,
    PopAutoescape,
    /// Pops a namespace, then the value to assign to its attribute.
    SetNamespaceAttr(Arc<str>),
    /// Pops a value and pushes it marked safe when autoescaping is on.
    MarkSafe,
    Fail(Arc<str>),
}

/// One independently callable piece of compiled code: the root, a block, a macro body, a
/// recursive loop or a loop filter.
#[derive(Debug, Clone, Default)]
pub struct CodeUnit {
    pub name: String,
    pub instructions: Vec<Instruction>,
    /// `(template line, instruction offset)` pairs, ordered by offset.
    pub debug_info: Vec<(usize, usize)>,
    pub num_slots: usize,
}

impl CodeUnit {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The template line the instruction at `offset` was compiled from.
    pub fn line_for(&self, offset: usize) -> usize {
        let idx = self
            .debug_info
            .partition_point(|&(_, start)| start <= offset);
        idx.checked_sub(1)
            .and_then(|idx| self.debug_info.get(idx))
            .map_or(1, |&(lineno, _)| lineno)
    }
}

/// A compiled template, independent of the environment that produced it.
#[derive(Debug, Clone, Default)]
pub struct CompiledTemplate {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub units: Vec<CodeUnit>,
    /// Block name to unit, in source order.
    pub blocks: IndexMap<String, UnitId>,
    /// Filter and test names referenced by `CallFilter`/`PerformTest` indexes.
    pub filters: Vec<String>,
    pub tests: Vec<String>,
    /// Names looked up in the render context, across every unit.
    pub resolved: BTreeSet<String>,
    /// Constant template names used by `extends`, `include` and `import`.
    pub references: Vec<String>,
}

impl CompiledTemplate {
    pub fn root(&self) -> Option<&CodeUnit> {
        self.units.get(ROOT_UNIT)
    }

    pub fn unit(&self, id: UnitId) -> Option<&CodeUnit> {
        self.units.get(id)
    }

    pub fn instruction_count(&self) -> usize {
        self.units.iter().map(|unit| unit.instructions.len()).sum()
    }
}

impl fmt::Display for CompiledTemplate {
    /// A readable listing, used when debugging the compiler.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, unit) in self.units.iter().enumerate() {
            writeln!(f, "unit {} ({}, {} slots):", id, unit.name, unit.num_slots)?;
            for (offset, instr) in unit.instructions.iter().enumerate() {
                writeln!(f, "  {:>4} [{:>3}] {:?}", offset, unit.line_for(offset), instr)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_line_for_uses_last_entry_at_or_before_offset() {
        let unit = CodeUnit {
            debug_info: vec![(1, 0), (3, 4), (7, 9)],
            ..CodeUnit::new("root")
        };
        assert_eq!(unit.line_for(0), 1);
        assert_eq!(unit.line_for(3), 1);
        assert_eq!(unit.line_for(4), 3);
        assert_eq!(unit.line_for(100), 7);
        assert_eq!(CodeUnit::new("empty").line_for(5), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_call_spec_stack_len() {
        let spec = CallSpec {
            args: 2,
            kwargs: vec!["a".into()],
            dyn_args: true,
            dyn_kwargs: false,
        };
        assert_eq!(spec.stack_len(), 4);
    }
}
