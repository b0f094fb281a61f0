//! Filters, tests and globals seeded into every default environment.
//!
//! The set is deliberately small; the interesting part is the
//! registration protocol, including the pass-context and
//! pass-environment modes.

use crate::environment::{pass_context, pass_environment, Environment, RegisteredCallable};
use crate::error::{Error, Result};
use crate::value::{escape_html, ops, Kwargs, Value};

pub(crate) fn register_defaults(env: &mut Environment) {
    env.add_function("range", RegisteredCallable::new(global_range));
    env.add_function("debug", pass_context(global_debug));

    env.add_filter("upper", filter_upper);
    env.add_filter("lower", filter_lower);
    env.add_filter("capitalize", filter_capitalize);
    env.add_filter("trim", filter_trim);
    env.add_filter("length", filter_length);
    env.add_filter("count", filter_length);
    env.add_filter("first", filter_first);
    env.add_filter("last", filter_last);
    env.add_filter("reverse", filter_reverse);
    env.add_filter("join", filter_join);
    env.add_filter("default", filter_default);
    env.add_filter("d", filter_default);
    env.add_filter("abs", filter_abs);
    env.add_filter("int", filter_int);
    env.add_filter("float", filter_float);
    env.add_filter("escape", filter_escape);
    env.add_filter("e", filter_escape);
    env.add_filter("safe", filter_safe);
    env.register_filter("attr", pass_environment(filter_attr));

    env.add_test("defined", test_defined);
    env.add_test("undefined", test_undefined);
    env.add_test("none", test_none);
    env.add_test("even", test_even);
    env.add_test("odd", test_odd);
    env.add_test("divisibleby", test_divisibleby);
    env.add_test("string", test_string);
    env.add_test("number", test_number);
    env.add_test("mapping", test_mapping);
    env.add_test("sequence", test_sequence);
    env.add_test("eq", test_eq);
    env.add_test("ne", test_ne);
    env.add_test("lt", test_lt);
    env.add_test("gt", test_gt);
    env.add_test("in", test_in);
}

fn arg<'a>(args: &'a [Value], idx: usize) -> &'a Value {
    args.get(idx).unwrap_or(&Value::Undefined)
}

fn int_arg(args: &[Value], idx: usize, what: &str) -> Result<i64> {
    arg(args, idx)
        .as_int()
        .ok_or_else(|| Error::runtime(format!("{what} must be an integer")))
}

// ---- globals ----

fn global_range(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    let (start, stop, step) = match args.len() {
        1 => (0, int_arg(args, 0, "range() stop")?, 1),
        2 => (
            int_arg(args, 0, "range() start")?,
            int_arg(args, 1, "range() stop")?,
            1,
        ),
        3 => (
            int_arg(args, 0, "range() start")?,
            int_arg(args, 1, "range() stop")?,
            int_arg(args, 2, "range() step")?,
        ),
        _ => return Err(Error::runtime("range() takes 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(Error::runtime("range() step must not be zero"));
    }
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        items.push(Value::Int(i));
        i += step;
    }
    Ok(Value::Array(items))
}

fn global_debug(
    ctx: &crate::context::Context,
    _args: &[Value],
    _kwargs: &Kwargs,
) -> Result<Value> {
    Ok(Value::String(format!("{:?}", ctx.known_names())))
}

// ---- filters ----

fn filter_upper(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::String(arg(args, 0).to_output_string().to_uppercase()))
}

fn filter_lower(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::String(arg(args, 0).to_output_string().to_lowercase()))
}

fn filter_capitalize(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    let s = arg(args, 0).to_output_string();
    let mut chars = s.chars();
    let out = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    };
    Ok(Value::String(out))
}

fn filter_trim(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::String(arg(args, 0).to_output_string().trim().to_string()))
}

fn filter_length(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    let len = match arg(args, 0) {
        Value::String(s) | Value::Markup(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Map(entries) => entries.len(),
        other => {
            return Err(Error::runtime(format!(
                "object of type {} has no length",
                other.kind()
            )))
        }
    };
    Ok(Value::Int(len as i64))
}

fn filter_first(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    match arg(args, 0) {
        Value::Array(items) => Ok(items.first().cloned().unwrap_or(Value::Undefined)),
        Value::String(s) | Value::Markup(s) => Ok(s
            .chars()
            .next()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Undefined)),
        other => Err(Error::runtime(format!(
            "cannot take first item of {}",
            other.kind()
        ))),
    }
}

fn filter_last(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    match arg(args, 0) {
        Value::Array(items) => Ok(items.last().cloned().unwrap_or(Value::Undefined)),
        Value::String(s) | Value::Markup(s) => Ok(s
            .chars()
            .next_back()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Undefined)),
        other => Err(Error::runtime(format!(
            "cannot take last item of {}",
            other.kind()
        ))),
    }
}

fn filter_reverse(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    match arg(args, 0) {
        Value::Array(items) => Ok(Value::Array(items.iter().rev().cloned().collect())),
        Value::String(s) | Value::Markup(s) => Ok(Value::String(s.chars().rev().collect())),
        other => Err(Error::runtime(format!(
            "cannot reverse {}",
            other.kind()
        ))),
    }
}

fn filter_join(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let sep = match args.get(1).or_else(|| kwargs.get("d")) {
        Some(sep) => sep.to_output_string(),
        None => String::new(),
    };
    match arg(args, 0) {
        Value::Array(items) => Ok(Value::String(
            items
                .iter()
                .map(Value::to_output_string)
                .collect::<Vec<_>>()
                .join(&sep),
        )),
        other => Err(Error::runtime(format!("cannot join {}", other.kind()))),
    }
}

fn filter_default(args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    let fallback = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()));
    let boolean = args
        .get(2)
        .or_else(|| kwargs.get("boolean"))
        .is_some_and(Value::is_truthy);
    let operand = arg(args, 0);
    if operand.is_undefined() || (boolean && !operand.is_truthy()) {
        Ok(fallback)
    } else {
        Ok(operand.clone())
    }
}

fn filter_abs(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    match arg(args, 0) {
        Value::Int(v) => Ok(Value::Int(v.abs())),
        Value::Float(v) => Ok(Value::Float(v.abs())),
        other => Err(Error::runtime(format!(
            "abs() requires a number, got {}",
            other.kind()
        ))),
    }
}

fn filter_int(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    let fallback = args.get(1).and_then(Value::as_int).unwrap_or(0);
    let out = match arg(args, 0) {
        Value::Int(v) => *v,
        Value::Float(v) => *v as i64,
        Value::Bool(b) => *b as i64,
        Value::String(s) | Value::Markup(s) => s.trim().parse().unwrap_or(fallback),
        _ => fallback,
    };
    Ok(Value::Int(out))
}

fn filter_float(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    let fallback = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
    let out = match arg(args, 0) {
        Value::Int(v) => *v as f64,
        Value::Float(v) => *v,
        Value::String(s) | Value::Markup(s) => s.trim().parse().unwrap_or(fallback),
        _ => fallback,
    };
    Ok(Value::Float(out))
}

fn filter_escape(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    match arg(args, 0) {
        Value::Markup(s) => Ok(Value::Markup(s.clone())),
        other => Ok(Value::Markup(escape_html(&other.to_output_string()))),
    }
}

fn filter_safe(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Markup(arg(args, 0).to_output_string()))
}

fn filter_attr(env: &Environment, args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    let name = arg(args, 1)
        .as_str()
        .ok_or_else(|| Error::runtime("attr() requires an attribute name"))?
        .to_string();
    Ok(env.get_attribute(arg(args, 0), &name))
}

// ---- tests ----

fn test_defined(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(!arg(args, 0).is_undefined()))
}

fn test_undefined(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(arg(args, 0).is_undefined()))
}

fn test_none(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(arg(args, 0).is_none()))
}

fn test_even(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(int_arg(args, 0, "'even' operand")? % 2 == 0))
}

fn test_odd(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(int_arg(args, 0, "'odd' operand")? % 2 != 0))
}

fn test_divisibleby(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    let num = int_arg(args, 0, "'divisibleby' operand")?;
    let div = int_arg(args, 1, "'divisibleby' argument")?;
    if div == 0 {
        return Err(Error::runtime("'divisibleby' argument must not be zero"));
    }
    Ok(Value::Bool(num % div == 0))
}

fn test_string(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(matches!(
        arg(args, 0),
        Value::String(_) | Value::Markup(_)
    )))
}

fn test_number(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(matches!(
        arg(args, 0),
        Value::Int(_) | Value::Float(_)
    )))
}

fn test_mapping(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(matches!(arg(args, 0), Value::Map(_))))
}

fn test_sequence(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(matches!(
        arg(args, 0),
        Value::Array(_) | Value::String(_) | Value::Markup(_)
    )))
}

fn test_eq(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(ops::value_eq(arg(args, 0), arg(args, 1))))
}

fn test_ne(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    Ok(Value::Bool(!ops::value_eq(arg(args, 0), arg(args, 1))))
}

fn test_lt(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    ops::compare(crate::ast::CmpOp::Lt, arg(args, 0), arg(args, 1)).map(Value::Bool)
}

fn test_gt(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    ops::compare(crate::ast::CmpOp::Gt, arg(args, 0), arg(args, 1)).map(Value::Bool)
}

fn test_in(args: &[Value], _kwargs: &Kwargs) -> Result<Value> {
    ops::contains(arg(args, 1), arg(args, 0)).map(Value::Bool)
}
