//! Compile time evaluation of constant expressions.
//!
//! [`fold`] answers whether an expression has a value that is known without rendering;
//! [`optimize`] replaces every such subexpression of a template with a constant.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    ast::{CallArgs, Expr, ExprKind, If, LogicOp, Stmt, StmtKind, UnaryOp},
    environment::Environment,
    functions::{Args, State},
    value::{Key, Kwargs, Value, ops},
};

/// The evaluation context constant folding runs under.
#[derive(Clone, Copy)]
pub(crate) struct FoldCtx<'a> {
    pub env: &'a Environment,
    pub autoescape: bool,
    /// The autoescape setting is only known at runtime.
    pub volatile: bool,
}

/// Values that can be embedded in compiled code.
fn is_safe_constant(value: &Value) -> bool {
    match value {
        Value::None
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::String(_)
        | Value::Safe(_) => true,
        Value::Seq(items) | Value::Tuple(items) => items.iter().all(is_safe_constant),
        Value::Map(map) => map.values().all(is_safe_constant),
        Value::Undefined(_) | Value::OneShot(_) | Value::Object(_) => false,
    }
}

fn fold_all(exprs: &[Expr], ctx: &FoldCtx<'_>) -> Option<Vec<Value>> {
    exprs.iter().map(|expr| fold(expr, ctx)).collect()
}

fn fold_args(args: &CallArgs, ctx: &FoldCtx<'_>) -> Option<(Vec<Value>, Kwargs)> {
    let mut positional = fold_all(&args.args, ctx)?;
    let mut kwargs: Kwargs = args
        .kwargs
        .iter()
        .map(|kw| Some((kw.key.clone(), fold(&kw.value, ctx)?)))
        .collect::<Option<_>>()?;
    if let Some(dyn_args) = &args.dyn_args {
        positional.extend(fold(dyn_args, ctx)?.try_iter().ok()?);
    }
    if let Some(dyn_kwargs) = &args.dyn_kwargs {
        for (key, value) in fold(dyn_kwargs, ctx)?.as_map()? {
            kwargs.insert(key.as_str()?.to_string(), value.clone());
        }
    }
    Some((positional, kwargs))
}

/// The value of `expr` if it can be computed at compile time.
pub(crate) fn fold(expr: &Expr, ctx: &FoldCtx<'_>) -> Option<Value> {
    let rv = match &expr.kind {
        ExprKind::Const(value) => value.clone(),
        ExprKind::TemplateData(data) => {
            if ctx.volatile {
                return None;
            }
            if ctx.autoescape {
                Value::from_safe_string(data.as_str())
            } else {
                Value::from(data.as_str())
            }
        }
        ExprKind::Tuple { items, .. } => Value::tuple(fold_all(items, ctx)?),
        ExprKind::List(items) => Value::from(fold_all(items, ctx)?),
        ExprKind::Dict(pairs) => {
            let mut map = IndexMap::with_capacity(pairs.len());
            for (key, value) in pairs {
                map.insert(Key::from_value(&fold(key, ctx)?).ok()?, fold(value, ctx)?);
            }
            Value::Map(Arc::new(map))
        }
        ExprKind::CondExpr { test, expr1, expr2 } => {
            if fold(test, ctx)?.is_true() {
                fold(expr1, ctx)?
            } else {
                fold(expr2.as_deref()?, ctx)?
            }
        }
        ExprKind::BinOp { op, left, right } => ops::binop(*op, &fold(left, ctx)?, &fold(right, ctx)?).ok()?,
        ExprKind::Unary { op, node } => {
            let value = fold(node, ctx)?;
            match op {
                UnaryOp::Not => Value::Bool(!value.is_true()),
                UnaryOp::Neg => ops::neg(&value).ok()?,
                UnaryOp::Pos => ops::pos(&value).ok()?,
            }
        }
        ExprKind::Logic { op, left, right } => {
            let left = fold(left, ctx)?;
            match (op, left.is_true()) {
                (LogicOp::And, false) | (LogicOp::Or, true) => left,
                _ => fold(right, ctx)?,
            }
        }
        ExprKind::Concat(nodes) => {
            let parts = fold_all(nodes, ctx)?;
            Value::from(parts.iter().map(ToString::to_string).collect::<String>())
        }
        ExprKind::Compare { expr, ops: operands } => {
            let mut value = fold(expr, ctx)?;
            let mut result = true;
            for operand in operands {
                let next = fold(&operand.expr, ctx)?;
                result = ops::compare(operand.op, &value, &next).ok()?;
                if !result {
                    break;
                }
                value = next;
            }
            Value::Bool(result)
        }
        ExprKind::Getattr { node, attr } => {
            if ctx.env.sandbox().is_some() {
                return None;
            }
            ops::get_attr(&fold(node, ctx)?, attr)?
        }
        ExprKind::Getitem { node, arg } => {
            if ctx.env.sandbox().is_some() {
                return None;
            }
            let value = fold(node, ctx)?;
            match &arg.kind {
                ExprKind::Slice { start, stop, step } => {
                    let bound = |part: &Option<Box<Expr>>| match part {
                        Some(part) => fold(part, ctx),
                        None => Some(Value::None),
                    };
                    ops::slice(&value, &bound(start)?, &bound(stop)?, &bound(step)?).ok()?
                }
                _ => ops::get_item(&value, &fold(arg, ctx)?).ok()??,
            }
        }
        ExprKind::Filter(call) => {
            if ctx.volatile {
                return None;
            }
            let filter = ctx.env.filter(&call.name)?;
            if filter.pass_context() {
                return None;
            }
            let value = fold(call.node.as_ref()?, ctx)?;
            let (args, kwargs) = fold_args(&call.args, ctx)?;
            let state = State::new(ctx.env, None, ctx.autoescape);
            filter.call(&state, &value, &Args::new(&args, &kwargs)).ok()?
        }
        ExprKind::Test(call) => {
            if ctx.volatile {
                return None;
            }
            let test = ctx.env.test(&call.name)?;
            let value = fold(&call.node, ctx)?;
            let (args, kwargs) = fold_args(&call.args, ctx)?;
            let state = State::new(ctx.env, None, ctx.autoescape);
            Value::Bool(test.call(&state, &value, &Args::new(&args, &kwargs)).ok()?)
        }
        ExprKind::Name { .. }
        | ExprKind::NsRef { .. }
        | ExprKind::Call(_)
        | ExprKind::Slice { .. } => return None,
    };
    is_safe_constant(&rv).then_some(rv)
}

/// Replaces foldable subexpressions with constants. Template data is left alone, the code
/// generator handles it.
fn optimize_expr(expr: &mut Expr, ctx: &FoldCtx<'_>) {
    if matches!(
        expr.kind,
        ExprKind::Const(_) | ExprKind::TemplateData(_) | ExprKind::Name { .. } | ExprKind::NsRef { .. }
    ) {
        return;
    }
    if let Some(value) = fold(expr, ctx) {
        expr.kind = ExprKind::Const(value);
        return;
    }
    for_each_child_mut(expr, &mut |child| optimize_expr(child, ctx));
}

fn args_mut(args: &mut CallArgs, f: &mut impl FnMut(&mut Expr)) {
    args.args.iter_mut().for_each(&mut *f);
    for kw in &mut args.kwargs {
        f(&mut kw.value);
    }
    if let Some(dyn_args) = &mut args.dyn_args {
        f(dyn_args);
    }
    if let Some(dyn_kwargs) = &mut args.dyn_kwargs {
        f(dyn_kwargs);
    }
}

fn for_each_child_mut(expr: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
    match &mut expr.kind {
        ExprKind::Tuple { items, .. } | ExprKind::List(items) | ExprKind::Concat(items) => {
            items.iter_mut().for_each(f);
        }
        ExprKind::Dict(pairs) => {
            for (key, value) in pairs {
                f(key);
                f(value);
            }
        }
        ExprKind::CondExpr { test, expr1, expr2 } => {
            f(test);
            f(expr1);
            if let Some(expr2) = expr2 {
                f(expr2);
            }
        }
        ExprKind::Filter(call) => {
            if let Some(node) = &mut call.node {
                f(node);
            }
            args_mut(&mut call.args, f);
        }
        ExprKind::Test(call) => {
            f(&mut call.node);
            args_mut(&mut call.args, f);
        }
        ExprKind::Call(call) => {
            f(&mut call.node);
            args_mut(&mut call.args, f);
        }
        ExprKind::Getitem { node, arg } => {
            f(node);
            f(arg);
        }
        ExprKind::Getattr { node, .. } | ExprKind::Unary { node, .. } => f(node),
        ExprKind::Slice { start, stop, step } => {
            for part in [start, stop, step].into_iter().flatten() {
                f(part);
            }
        }
        ExprKind::Compare { expr, ops } => {
            f(expr);
            for operand in ops {
                f(&mut operand.expr);
            }
        }
        ExprKind::BinOp { left, right, .. } | ExprKind::Logic { left, right, .. } => {
            f(left);
            f(right);
        }
        ExprKind::Name { .. } | ExprKind::NsRef { .. } | ExprKind::Const(_) | ExprKind::TemplateData(_) => {}
    }
}

fn optimize_if(node: &mut If, ctx: &FoldCtx<'_>) {
    optimize_expr(&mut node.test, ctx);
    optimize(&mut node.body, ctx);
    for elif in &mut node.elif {
        optimize_if(elif, ctx);
    }
    optimize(&mut node.else_, ctx);
}

/// Folds every constant expression in `stmts`.
pub(crate) fn optimize(stmts: &mut [Stmt], ctx: &FoldCtx<'_>) {
    for stmt in stmts {
        match &mut stmt.kind {
            StmtKind::Output(nodes) => nodes.iter_mut().for_each(|node| optimize_expr(node, ctx)),
            StmtKind::For(node) => {
                optimize_expr(&mut node.iter, ctx);
                if let Some(test) = &mut node.test {
                    optimize_expr(test, ctx);
                }
                optimize(&mut node.body, ctx);
                optimize(&mut node.else_, ctx);
            }
            StmtKind::If(node) => optimize_if(node, ctx),
            StmtKind::Macro(node) => {
                node.defaults.iter_mut().for_each(|expr| optimize_expr(expr, ctx));
                optimize(&mut node.body, ctx);
            }
            StmtKind::CallBlock(node) => {
                optimize_expr(&mut node.call, ctx);
                node.defaults.iter_mut().for_each(|expr| optimize_expr(expr, ctx));
                optimize(&mut node.body, ctx);
            }
            StmtKind::FilterBlock(node) => {
                optimize_expr(&mut node.filter, ctx);
                optimize(&mut node.body, ctx);
            }
            StmtKind::With(node) => {
                node.values.iter_mut().for_each(|expr| optimize_expr(expr, ctx));
                optimize(&mut node.body, ctx);
            }
            StmtKind::Block(node) => optimize(&mut node.body, ctx),
            StmtKind::Extends(template) => optimize_expr(template, ctx),
            StmtKind::Include(node) => optimize_expr(&mut node.template, ctx),
            StmtKind::Import(node) => optimize_expr(&mut node.template, ctx),
            StmtKind::FromImport(node) => optimize_expr(&mut node.template, ctx),
            StmtKind::ExprStmt(expr) => optimize_expr(expr, ctx),
            StmtKind::Assign { node, .. } => optimize_expr(node, ctx),
            StmtKind::AssignBlock(node) => {
                if let Some(filter) = &mut node.filter {
                    optimize_expr(filter, ctx);
                }
                optimize(&mut node.body, ctx);
            }
            StmtKind::Scope(body) => optimize(body, ctx),
            StmtKind::ScopedEvalContextModifier { options, body } => {
                let mut inner = *ctx;
                for option in options.iter_mut() {
                    optimize_expr(&mut option.value, ctx);
                    match fold(&option.value, ctx) {
                        Some(value) if option.key == "autoescape" => inner.autoescape = value.is_true(),
                        Some(_) => {}
                        None => inner.volatile = true,
                    }
                }
                optimize(body, &inner);
            }
            StmtKind::Break | StmtKind::Continue => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folded(source: &str) -> Option<Value> {
        let env = Environment::new();
        let template = env.parse(&format!("{{{{ {} }}}}", source), None, None).unwrap();
        let ctx = FoldCtx {
            env: &env,
            autoescape: false,
            volatile: false,
        };
        match &template.body.first()?.kind {
            StmtKind::Output(nodes) => fold(nodes.first()?, &ctx),
            _ => None,
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arithmetic_and_logic_fold() {
        assert_eq!(folded("1 + 2 * 3"), Some(Value::Int(7)));
        assert_eq!(folded("not 0"), Some(Value::Bool(true)));
        assert_eq!(folded("0 or 'x'"), Some(Value::from("x")));
        assert_eq!(folded("1 < 2 < 3"), Some(Value::Bool(true)));
        assert_eq!(folded("'a' ~ 1"), Some(Value::from("a1")));
        assert_eq!(folded("(1, 'a')").map(|v| v.to_string()).as_deref(), Some("(1, 'a')"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_names_and_calls_do_not_fold() {
        assert_eq!(folded("x + 1"), None);
        assert_eq!(folded("range(3)"), None);
        assert_eq!(folded("1 / 0"), None);
        assert_eq!(folded("'a' if false"), None);
        assert_eq!(folded("'ab' * 4611686018427387904"), None);
        assert_eq!(folded("[1] * 4611686018427387904"), None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_filters_fold_unless_volatile() {
        assert_eq!(folded("'abc'|upper"), Some(Value::from("ABC")));
        assert_eq!(folded("[3, 1]|sort|first"), Some(Value::Int(1)));
        assert_eq!(folded("'abc'|nosuchfilter"), None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_optimize_rewrites_nested_expressions() {
        let env = Environment::new();
        let mut template = env.parse("{{ x + (2 * 3) }}", None, None).unwrap();
        let ctx = FoldCtx {
            env: &env,
            autoescape: false,
            volatile: false,
        };
        optimize(&mut template.body, &ctx);
        let Some(StmtKind::Output(nodes)) = template.body.first().map(|stmt| &stmt.kind) else {
            panic!("expected output");
        };
        let Some(ExprKind::BinOp { right, .. }) = nodes.first().map(|node| &node.kind) else {
            panic!("expected binop");
        };
        assert_eq!(right.kind, ExprKind::Const(Value::Int(6)));
    }
}
