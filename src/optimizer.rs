use std::rc::Rc;

use crate::ast::{Expr, Stmt, UnaryOp};
use crate::value::{ops, Value};

/// Compile-time constant folding.
///
/// Every expression whose children are all constant and whose operator
/// is pure (arithmetic, comparison, boolean logic, concatenation,
/// indexing, literal containers) is replaced by its value. Filters,
/// tests and calls are never folded; any evaluation error leaves the
/// node untouched, so the pass cannot change render semantics. Running
/// it twice is a no-op.
pub fn optimize(body: &mut Vec<Stmt>) {
    for stmt in body {
        optimize_stmt(stmt);
    }
}

fn optimize_body(body: &mut Rc<Vec<Stmt>>) {
    // bodies are uniquely owned at compile time; a shared body (already
    // handed out to a value) is left alone
    if let Some(body) = Rc::get_mut(body) {
        optimize(body);
    }
}

fn optimize_stmt(stmt: &mut Stmt) {
    match stmt {
        Stmt::Output(items) => {
            for item in items {
                optimize_expr(item);
            }
        }
        Stmt::If { arms, else_body } => {
            for (cond, body) in arms {
                optimize_expr(cond);
                optimize(body);
            }
            optimize(else_body);
        }
        Stmt::For {
            iter,
            body,
            else_body,
            filter,
            ..
        } => {
            optimize_expr(iter);
            if let Some(filter) = filter {
                optimize_expr(filter);
            }
            optimize_body(body);
            optimize(else_body);
        }
        Stmt::Set { value, .. } => optimize_expr(value),
        Stmt::AssignBlock { filters, body, .. } => {
            for spec in filters {
                for arg in &mut spec.args {
                    optimize_expr(arg);
                }
                for (_, arg) in &mut spec.kwargs {
                    optimize_expr(arg);
                }
            }
            optimize(body);
        }
        Stmt::Block(def) => optimize_body(&mut def.body),
        Stmt::Extends { template }
        | Stmt::Include { template, .. }
        | Stmt::Import { template, .. }
        | Stmt::FromImport { template, .. } => optimize_expr(template),
        Stmt::Macro(decl) => {
            for default in &mut decl.defaults {
                optimize_expr(default);
            }
            optimize_body(&mut decl.body);
        }
        Stmt::CallBlock { call, body, .. } => {
            optimize_expr(call);
            optimize_body(body);
        }
        Stmt::FilterBlock { filters, body } => {
            for spec in filters {
                for arg in &mut spec.args {
                    optimize_expr(arg);
                }
                for (_, arg) in &mut spec.kwargs {
                    optimize_expr(arg);
                }
            }
            optimize(body);
        }
        Stmt::With { values, body, .. } => {
            for value in values {
                optimize_expr(value);
            }
            optimize(body);
        }
        Stmt::Do(expr) => optimize_expr(expr),
        Stmt::AutoEscape { value, body } => {
            optimize_expr(value);
            optimize(body);
        }
        Stmt::ScopedContextModifier { overrides, body } => {
            for (_, value) in overrides {
                optimize_expr(value);
            }
            optimize(body);
        }
    }
}

fn as_const(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Const(v) => Some(v),
        _ => None,
    }
}

fn optimize_expr(expr: &mut Expr) {
    // children first, so folding cascades bottom-up
    match expr {
        Expr::Name(_) | Expr::Const(_) | Expr::TemplateData(_) => {}
        Expr::Tuple(items) | Expr::List(items) | Expr::Concat(items) => {
            for item in items {
                optimize_expr(item);
            }
        }
        Expr::Dict(pairs) => {
            for (k, v) in pairs {
                optimize_expr(k);
                optimize_expr(v);
            }
        }
        Expr::Unary { operand, .. } => optimize_expr(operand),
        Expr::Binary { left, right, .. } => {
            optimize_expr(left);
            optimize_expr(right);
        }
        Expr::Compare { left, ops } => {
            optimize_expr(left);
            for (_, rhs) in ops {
                optimize_expr(rhs);
            }
        }
        Expr::Getattr { target, .. } => optimize_expr(target),
        Expr::Getitem { target, key } => {
            optimize_expr(target);
            optimize_expr(key);
        }
        Expr::Slice { start, stop, step } => {
            for part in [start, stop, step].into_iter().flatten() {
                optimize_expr(part);
            }
        }
        Expr::Call {
            target,
            args,
            kwargs,
            var_arg,
            kw_arg,
        } => {
            optimize_expr(target);
            for arg in args {
                optimize_expr(arg);
            }
            for (_, arg) in kwargs {
                optimize_expr(arg);
            }
            for arg in [var_arg, kw_arg].into_iter().flatten() {
                optimize_expr(arg);
            }
        }
        Expr::Filter {
            operand,
            args,
            kwargs,
            ..
        } => {
            if let Some(operand) = operand {
                optimize_expr(operand);
            }
            for arg in args {
                optimize_expr(arg);
            }
            for (_, arg) in kwargs {
                optimize_expr(arg);
            }
        }
        Expr::Test {
            operand,
            args,
            kwargs,
            ..
        } => {
            optimize_expr(operand);
            for arg in args {
                optimize_expr(arg);
            }
            for (_, arg) in kwargs {
                optimize_expr(arg);
            }
        }
        Expr::Condition {
            test,
            then,
            otherwise,
        } => {
            optimize_expr(test);
            optimize_expr(then);
            if let Some(otherwise) = otherwise {
                optimize_expr(otherwise);
            }
        }
    }

    // prune constant conditions down to the taken branch
    if let Expr::Condition {
        test,
        then,
        otherwise,
    } = expr
    {
        if let Some(test) = as_const(test) {
            let branch = if test.is_truthy() {
                std::mem::replace(then.as_mut(), Expr::Const(Value::None))
            } else {
                match otherwise.take() {
                    Some(mut otherwise) => {
                        std::mem::replace(otherwise.as_mut(), Expr::Const(Value::None))
                    }
                    None => Expr::Const(Value::Undefined),
                }
            };
            *expr = branch;
            return;
        }
    }

    let folded = match &*expr {
        Expr::Unary { op, operand } => as_const(operand).and_then(|v| match op {
            UnaryOp::Not => Some(Value::Bool(!v.is_truthy())),
            UnaryOp::Neg => ops::neg(v).ok(),
            UnaryOp::Pos => ops::pos(v).ok(),
        }),
        Expr::Binary { op, left, right } => match (as_const(left), as_const(right)) {
            (Some(l), Some(r)) => ops::binary(*op, l, r).ok(),
            _ => None,
        },
        Expr::Compare { left, ops: links } => as_const(left).and_then(|first| {
            let mut prev = first;
            for (op, rhs) in links {
                let rhs = as_const(rhs)?;
                match ops::compare(*op, prev, rhs) {
                    Ok(true) => prev = rhs,
                    Ok(false) => return Some(Value::Bool(false)),
                    Err(_) => return None,
                }
            }
            Some(Value::Bool(true))
        }),
        Expr::Concat(items) => items
            .iter()
            .map(|item| as_const(item).map(Value::to_output_string))
            .collect::<Option<String>>()
            .map(Value::String),
        Expr::Getitem { target, key } => match (as_const(target), as_const(key)) {
            (Some(t), Some(k)) => ops::get_item(t, k),
            _ => None,
        },
        Expr::Getattr { target, name } => match as_const(target) {
            Some(Value::Map(entries)) => entries.get(name).cloned(),
            _ => None,
        },
        Expr::Tuple(items) | Expr::List(items) => items
            .iter()
            .map(|item| as_const(item).cloned())
            .collect::<Option<Vec<Value>>>()
            .map(Value::Array),
        Expr::Dict(pairs) => pairs
            .iter()
            .map(|(k, v)| {
                let key = as_const(k)?.as_map_key().ok()?;
                Some((key, as_const(v)?.clone()))
            })
            .collect::<Option<std::collections::BTreeMap<String, Value>>>()
            .map(Value::Map),
        _ => None,
    };
    if let Some(value) = folded {
        *expr = Expr::Const(value);
    }
}
