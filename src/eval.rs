use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::ast::{BinOp, Expr, FilterSpec, Stmt, UnaryOp};
use crate::context::Context;
use crate::environment::{CompiledTemplate, Environment};
use crate::error::{Error, Result};
use crate::value::{ops, Kwargs, LoopValue, MacroValue, Scope, Value};

/// Tree-walking renderer. Walks statements, evaluates expressions
/// against the scoped context and writes to a `fmt::Write` sink.
pub struct Evaluator<'env> {
    ctx: Context<'env>,
    /// Inheritance chains per block name, most-derived first.
    blocks: BTreeMap<String, Vec<crate::ast::BlockDef>>,
    block_frames: Vec<BlockFrame>,
    active_loops: Vec<ActiveLoop>,
    /// Template names on the render stack, for cycle detection.
    render_stack: Vec<String>,
}

#[derive(Clone)]
struct BlockFrame {
    name: String,
    pos: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockMode {
    /// Declared `scoped`: sees the enclosing locals.
    Scoped,
    /// Default: sees the render data and globals only.
    DataOnly,
    /// A `super()` body, rendered in the overriding block's context.
    Inline,
}

#[derive(Clone)]
struct ActiveLoop {
    body: Rc<Vec<Stmt>>,
    targets: Vec<String>,
    filter: Option<Expr>,
    recursive: bool,
}

impl<'env> Evaluator<'env> {
    pub fn new(env: &'env Environment, root: Scope) -> Evaluator<'env> {
        Evaluator {
            ctx: Context::new(env, root),
            blocks: BTreeMap::new(),
            block_frames: Vec::new(),
            active_loops: Vec::new(),
            render_stack: Vec::new(),
        }
    }

    fn sub_evaluator(&self, scopes: Vec<Scope>) -> Evaluator<'env> {
        Evaluator {
            ctx: Context::with_scopes(self.ctx.environment(), scopes, self.ctx.auto_escape()),
            blocks: BTreeMap::new(),
            block_frames: Vec::new(),
            active_loops: Vec::new(),
            render_stack: self.render_stack.clone(),
        }
    }

    /// Renders a whole template, following its `extends` chain.
    pub fn render_template(
        &mut self,
        tmpl: &CompiledTemplate,
        out: &mut dyn fmt::Write,
    ) -> Result<()> {
        if let Some(path) = &tmpl.path {
            if self.render_stack.iter().any(|p| p == path) {
                return Err(Error::runtime(format!(
                    "circular template inheritance or inclusion involving '{path}'"
                )));
            }
            self.render_stack.push(path.clone());
        }
        self.merge_blocks(tmpl);
        let result = match tmpl.body.first() {
            Some(Stmt::Extends { template }) => self.render_parent(template, out),
            _ => self.render_stmts(&tmpl.body, out),
        };
        if tmpl.path.is_some() {
            self.render_stack.pop();
        }
        result
    }

    pub(crate) fn merge_blocks(&mut self, tmpl: &CompiledTemplate) {
        for (name, def) in &tmpl.blocks {
            self.blocks
                .entry(name.clone())
                .or_default()
                .push(def.clone());
        }
    }

    fn render_parent(&mut self, template: &Expr, out: &mut dyn fmt::Write) -> Result<()> {
        let name_val = self.eval(template)?;
        let name = name_val
            .as_str()
            .ok_or_else(|| Error::runtime("'extends' requires a template name string"))?
            .to_string();
        let parent = self.ctx.environment().get_template(&name)?;
        self.render_template(parent.compiled(), out)
    }

    pub(crate) fn render_stmts(&mut self, stmts: &[Stmt], out: &mut dyn fmt::Write) -> Result<()> {
        for stmt in stmts {
            self.render_stmt(stmt, out)?;
        }
        Ok(())
    }

    fn render_stmt(&mut self, stmt: &Stmt, out: &mut dyn fmt::Write) -> Result<()> {
        match stmt {
            Stmt::Output(items) => {
                for item in items {
                    if let Expr::TemplateData(text) = item {
                        out.write_str(text)?;
                    } else {
                        let value = self.eval(item)?;
                        self.write_value(value, out)?;
                    }
                }
            }
            Stmt::If { arms, else_body } => {
                for (cond, body) in arms {
                    if self.eval(cond)?.is_truthy() {
                        return self.render_stmts(body, out);
                    }
                }
                self.render_stmts(else_body, out)?;
            }
            Stmt::For {
                targets,
                iter,
                body,
                else_body,
                filter,
                recursive,
            } => {
                let iter_val = self.eval(iter)?;
                let al = ActiveLoop {
                    body: Rc::clone(body),
                    targets: targets.clone(),
                    filter: filter.clone(),
                    recursive: *recursive,
                };
                self.run_loop(al, iter_val, 0, Some(else_body), out)?;
            }
            Stmt::Set { targets, value } => {
                let value = self.eval(value)?;
                self.bind_targets(targets, &value)?;
            }
            Stmt::AssignBlock {
                target,
                filters,
                body,
            } => {
                let mut buf = String::new();
                self.render_stmts(body, &mut buf)?;
                let mut value = Value::String(buf);
                for spec in filters {
                    value = self.apply_filter_spec(spec, value)?;
                }
                self.ctx.set(target.clone(), value);
            }
            Stmt::Block(def) => {
                let chain = match self.blocks.get(&def.name) {
                    Some(chain) => chain.clone(),
                    None => vec![def.clone()],
                };
                if chain[0].required {
                    return Err(Error::runtime(format!(
                        "required block '{}' was not overridden",
                        def.name
                    )));
                }
                // scoped-ness comes from the declaration being rendered,
                // not from whichever override wins the chain
                let mode = if def.scoped {
                    BlockMode::Scoped
                } else {
                    BlockMode::DataOnly
                };
                self.render_block_at(&def.name, &chain, 0, mode, out)?;
            }
            Stmt::Extends { .. } => {
                // only reachable as the first statement; render_template
                // already dispatched on it
            }
            Stmt::Include {
                template,
                ignore_missing,
                with_context,
            } => {
                self.render_include(template, *ignore_missing, *with_context, out)?;
            }
            Stmt::Import {
                template,
                alias,
                with_context,
            } => {
                let (_, exports) = self.load_module(template, *with_context)?;
                self.ctx.set(alias.clone(), Value::Map(exports));
            }
            Stmt::FromImport {
                template,
                names,
                with_context,
            } => {
                let (tpl_name, exports) = self.load_module(template, *with_context)?;
                for (name, alias) in names {
                    let value = exports.get(name).cloned().ok_or_else(|| {
                        Error::runtime(format!(
                            "template '{tpl_name}' does not export the requested name '{name}'"
                        ))
                    })?;
                    self.ctx.set(alias.clone().unwrap_or_else(|| name.clone()), value);
                }
            }
            Stmt::Macro(decl) => {
                let value = Value::Macro(Rc::new(MacroValue {
                    name: decl.name.clone(),
                    args: decl.args.clone(),
                    defaults: decl.defaults.clone(),
                    body: Rc::clone(&decl.body),
                    closure: None,
                }));
                self.ctx.set(decl.name.clone(), value);
            }
            Stmt::CallBlock {
                call,
                caller_args,
                body,
            } => {
                let caller = Value::Macro(Rc::new(MacroValue {
                    name: "caller".to_string(),
                    args: caller_args.clone(),
                    defaults: Vec::new(),
                    body: Rc::clone(body),
                    closure: Some(self.ctx.scopes_snapshot()),
                }));
                let value = match call {
                    Expr::Call {
                        target,
                        args,
                        kwargs,
                        var_arg,
                        kw_arg,
                    } => self.eval_call(target, args, kwargs, var_arg, kw_arg, Some(caller))?,
                    _ => return Err(Error::runtime("'call' requires a macro invocation")),
                };
                self.write_value(value, out)?;
            }
            Stmt::FilterBlock { filters, body } => {
                let mut buf = String::new();
                self.render_stmts(body, &mut buf)?;
                let mut value = Value::String(buf);
                for spec in filters {
                    value = self.apply_filter_spec(spec, value)?;
                }
                self.write_value(value, out)?;
            }
            Stmt::With {
                targets,
                values,
                body,
            } => {
                self.ctx.push_scope();
                let result: Result<()> = (|| {
                    for (target, value) in targets.iter().zip(values) {
                        let value = self.eval(value)?;
                        self.ctx.set(target.clone(), value);
                    }
                    self.render_stmts(body, out)
                })();
                self.ctx.pop_scope();
                result?;
            }
            Stmt::Do(expr) => {
                self.eval(expr)?;
            }
            Stmt::AutoEscape { value, body } => {
                let on = self.eval(value)?.is_truthy();
                let saved = self.ctx.auto_escape();
                self.ctx.set_auto_escape(on);
                let result = self.render_stmts(body, out);
                self.ctx.set_auto_escape(saved);
                result?;
            }
            Stmt::ScopedContextModifier { overrides, body } => {
                self.ctx.push_scope();
                let result: Result<()> = (|| {
                    for (name, expr) in overrides {
                        let value = self.eval(expr)?;
                        self.ctx.set(name.clone(), value);
                    }
                    self.render_stmts(body, out)
                })();
                self.ctx.pop_scope();
                result?;
            }
        }
        Ok(())
    }

    /// Escape (when active), finalize, stringify, write. In that order.
    fn write_value(&mut self, value: Value, out: &mut dyn fmt::Write) -> Result<()> {
        let value = self.ctx.escape(value);
        let value = self.ctx.environment().apply_finalize(&self.ctx, value);
        out.write_str(&value.to_output_string())?;
        Ok(())
    }

    // ---- blocks and inheritance ----

    fn render_block_at(
        &mut self,
        name: &str,
        chain: &[crate::ast::BlockDef],
        pos: usize,
        mode: BlockMode,
        out: &mut dyn fmt::Write,
    ) -> Result<()> {
        self.block_frames.push(BlockFrame {
            name: name.to_string(),
            pos,
        });
        let body = Rc::clone(&chain[pos].body);
        let result = match mode {
            // scoped blocks and super() bodies see the enclosing locals
            BlockMode::Scoped | BlockMode::Inline => {
                self.ctx.push_scope();
                let result = self.render_stmts(&body, out);
                self.ctx.pop_scope();
                result
            }
            // default visibility: the render data plus globals only
            BlockMode::DataOnly => {
                let saved = self
                    .ctx
                    .swap_scopes(vec![self.ctx.root_scope(), Scope::new()]);
                let result = self.render_stmts(&body, out);
                self.ctx.swap_scopes(saved);
                result
            }
        };
        self.block_frames.pop();
        result
    }

    fn call_super(&mut self) -> Result<Value> {
        let frame = self
            .block_frames
            .last()
            .cloned()
            .ok_or_else(|| Error::runtime("super() is only available inside a block"))?;
        let chain = self.blocks.get(&frame.name).cloned().unwrap_or_default();
        if frame.pos + 1 >= chain.len() {
            return Err(Error::runtime(format!(
                "block '{}' has no parent block",
                frame.name
            )));
        }
        let mut buf = String::new();
        self.render_block_at(&frame.name, &chain, frame.pos + 1, BlockMode::Inline, &mut buf)?;
        Ok(Value::Markup(buf))
    }

    // ---- includes and imports ----

    fn render_include(
        &mut self,
        template: &Expr,
        ignore_missing: bool,
        with_context: bool,
        out: &mut dyn fmt::Write,
    ) -> Result<()> {
        let tv = self.eval(template)?;
        let name_err = || Error::runtime("'include' requires a template name or list of names");
        let (names, multiple) = match &tv {
            Value::Array(items) => {
                let names = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).ok_or_else(name_err))
                    .collect::<Result<Vec<_>>>()?;
                (names, true)
            }
            other => (vec![other.as_str().ok_or_else(name_err)?.to_string()], false),
        };

        let mut last_missing = None;
        for name in &names {
            match self.ctx.environment().get_template(name) {
                Ok(tmpl) => {
                    debug!(template = name.as_str(), "rendering include");
                    let scopes = if with_context {
                        self.ctx.scopes_snapshot()
                    } else {
                        vec![Scope::new()]
                    };
                    let mut sub = self.sub_evaluator(scopes);
                    return sub.render_template(tmpl.compiled(), out);
                }
                Err(err @ (Error::TemplateNotFound(_) | Error::TemplatesNotFound(_))) => {
                    last_missing = Some(err);
                }
                Err(other) => return Err(other),
            }
        }
        if ignore_missing {
            return Ok(());
        }
        if multiple {
            Err(Error::TemplatesNotFound(names))
        } else {
            Err(last_missing.unwrap_or_else(|| Error::TemplateNotFound(names[0].clone())))
        }
    }

    /// Renders a template as a module: output is discarded and its
    /// top-level bindings (macros, sets) become the exports.
    fn load_module(&mut self, template: &Expr, with_context: bool) -> Result<(String, Scope)> {
        let tv = self.eval(template)?;
        let name = tv
            .as_str()
            .ok_or_else(|| Error::runtime("'import' requires a template name string"))?
            .to_string();
        let tmpl = self.ctx.environment().get_template(&name)?;
        let mut scopes = if with_context {
            self.ctx.scopes_snapshot()
        } else {
            vec![Scope::new()]
        };
        scopes.push(Scope::new());
        let mut sub = self.sub_evaluator(scopes);
        let mut sink = String::new();
        sub.render_template(tmpl.compiled(), &mut sink)?;
        Ok((name, sub.ctx.take_top_scope()))
    }

    // ---- loops ----

    fn make_iterable(&self, value: &Value) -> Result<Vec<Value>> {
        match value {
            Value::Array(items) => Ok(items.clone()),
            Value::Map(entries) => Ok(entries
                .iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                .collect()),
            Value::String(s) | Value::Markup(s) => {
                Ok(s.chars().map(|c| Value::String(c.to_string())).collect())
            }
            // an absent sequence iterates as empty, so for/else works
            // on missing data
            Value::Undefined => Ok(Vec::new()),
            Value::None => Err(Error::runtime("cannot iterate over none")),
            other => Err(Error::runtime(format!(
                "value of type {} is not iterable",
                other.kind()
            ))),
        }
    }

    /// Binds loop or set targets; multi-target binds destructure with
    /// strict arity.
    fn bind_targets(&mut self, targets: &[String], item: &Value) -> Result<()> {
        if targets.len() == 1 {
            self.ctx.set(targets[0].clone(), item.clone());
            return Ok(());
        }
        let values = self.make_iterable(item)?;
        if values.len() < targets.len() {
            return Err(Error::runtime(format!(
                "not enough values to unpack (expected {}, got {})",
                targets.len(),
                values.len()
            )));
        }
        if values.len() > targets.len() {
            return Err(Error::runtime(format!(
                "too many values to unpack (expected {})",
                targets.len()
            )));
        }
        for (target, value) in targets.iter().zip(values) {
            self.ctx.set(target.clone(), value);
        }
        Ok(())
    }

    fn run_loop(
        &mut self,
        al: ActiveLoop,
        iter_val: Value,
        depth: usize,
        else_body: Option<&[Stmt]>,
        out: &mut dyn fmt::Write,
    ) -> Result<()> {
        let mut items = self.make_iterable(&iter_val)?;

        // the filter sees the targets (and any outer `loop`), not this
        // loop's own metadata
        if let Some(filter) = al.filter.clone() {
            let mut kept = Vec::new();
            for item in items {
                self.ctx.push_scope();
                let keep: Result<bool> = (|| {
                    self.bind_targets(&al.targets, &item)?;
                    Ok(self.eval(&filter)?.is_truthy())
                })();
                self.ctx.pop_scope();
                if keep? {
                    kept.push(item);
                }
            }
            items = kept;
        }

        if items.is_empty() {
            if let Some(else_body) = else_body {
                self.render_stmts(else_body, out)?;
            }
            return Ok(());
        }

        let len = items.len();
        let items = Rc::new(items);
        let slot = self.active_loops.len();
        let body = Rc::clone(&al.body);
        let targets = al.targets.clone();
        let recursive = al.recursive;
        self.active_loops.push(al);

        let result: Result<()> = (|| {
            for i in 0..len {
                self.ctx.push_scope();
                let iteration: Result<()> = (|| {
                    self.bind_targets(&targets, &items[i])?;
                    let lo = LoopValue {
                        index0: i,
                        len,
                        depth0: depth,
                        items: Rc::clone(&items),
                        slot,
                        recursive,
                    };
                    self.ctx.set("loop", Value::Loop(Rc::new(lo)));
                    self.render_stmts(&body, out)
                })();
                self.ctx.pop_scope();
                iteration?;
            }
            Ok(())
        })();
        self.active_loops.truncate(slot);
        result
    }

    // ---- expressions ----

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Name(name) => self.ctx.resolve(name),
            Expr::Const(value) => Ok(value.clone()),
            Expr::TemplateData(text) => Ok(Value::String(text.clone())),
            Expr::Tuple(items) | Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Dict(pairs) => {
                let mut out = BTreeMap::new();
                for (key, value) in pairs {
                    let key = self.eval(key)?.as_map_key()?;
                    out.insert(key, self.eval(value)?);
                }
                Ok(Value::Map(out))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => ops::neg(&value),
                    UnaryOp::Pos => ops::pos(&value),
                }
            }
            Expr::Binary { op, left, right } => match op {
                BinOp::And => {
                    let left = self.eval(left)?;
                    if left.is_truthy() {
                        self.eval(right)
                    } else {
                        Ok(left)
                    }
                }
                BinOp::Or => {
                    let left = self.eval(left)?;
                    if left.is_truthy() {
                        Ok(left)
                    } else {
                        self.eval(right)
                    }
                }
                _ => {
                    let left = self.eval(left)?;
                    let right = self.eval(right)?;
                    ops::binary(*op, &left, &right)
                }
            },
            Expr::Compare { left, ops: links } => {
                let mut prev = self.eval(left)?;
                for (op, rhs) in links {
                    let rhs = self.eval(rhs)?;
                    if !ops::compare(*op, &prev, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    prev = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::Getattr { target, name } => {
                let value = self.eval(target)?;
                self.get_attr(&value, name)
            }
            Expr::Getitem { target, key } => {
                let value = self.eval(target)?;
                if let Expr::Slice { start, stop, step } = &**key {
                    if value.is_undefined() {
                        return Err(Error::Undefined(
                            "tried to slice an undefined value".into(),
                        ));
                    }
                    let start = self.eval_slice_part(start)?;
                    let stop = self.eval_slice_part(stop)?;
                    let step = self.eval_slice_part(step)?;
                    return ops::slice(&value, start, stop, step);
                }
                let key = self.eval(key)?;
                self.get_item(&value, &key)
            }
            Expr::Slice { .. } => Err(Error::runtime("slice used outside a subscript")),
            Expr::Call {
                target,
                args,
                kwargs,
                var_arg,
                kw_arg,
            } => self.eval_call(target, args, kwargs, var_arg, kw_arg, None),
            Expr::Filter {
                name,
                operand,
                args,
                kwargs,
            } => {
                let operand = operand
                    .as_ref()
                    .ok_or_else(|| Error::runtime(format!("filter '{name}' has no operand")))?;
                let base = self.eval(operand)?;
                let mut all = vec![base];
                for arg in args {
                    all.push(self.eval(arg)?);
                }
                let kwargs = self.eval_kwargs(kwargs)?;
                self.ctx.filter(name, &all, &kwargs)
            }
            Expr::Test {
                name,
                operand,
                args,
                kwargs,
            } => {
                let base = self.eval(operand)?;
                let mut all = vec![base];
                for arg in args {
                    all.push(self.eval(arg)?);
                }
                let kwargs = self.eval_kwargs(kwargs)?;
                self.ctx.test(name, &all, &kwargs).map(Value::Bool)
            }
            Expr::Condition {
                test,
                then,
                otherwise,
            } => {
                if self.eval(test)?.is_truthy() {
                    self.eval(then)
                } else {
                    match otherwise {
                        Some(otherwise) => self.eval(otherwise),
                        None => Ok(Value::Undefined),
                    }
                }
            }
            Expr::Concat(items) => {
                let mut out = String::new();
                for item in items {
                    out.push_str(&self.eval(item)?.to_output_string());
                }
                Ok(Value::String(out))
            }
        }
    }

    fn eval_slice_part(&mut self, part: &Option<Box<Expr>>) -> Result<Option<i64>> {
        match part {
            None => Ok(None),
            Some(expr) => match self.eval(expr)? {
                Value::None | Value::Undefined => Ok(None),
                value => value
                    .as_int()
                    .map(Some)
                    .ok_or_else(|| Error::runtime("slice indices must be integers")),
            },
        }
    }

    fn eval_kwargs(&mut self, kwargs: &[(String, Expr)]) -> Result<Kwargs> {
        let mut out = Kwargs::new();
        for (name, expr) in kwargs {
            let value = self.eval(expr)?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    fn get_attr(&self, value: &Value, name: &str) -> Result<Value> {
        match value {
            Value::Undefined => Err(Error::Undefined(format!(
                "tried to access attribute '{name}' of an undefined value"
            ))),
            Value::Loop(lo) => Ok(loop_attr(lo, name)),
            other => Ok(self.ctx.environment().get_attribute(other, name)),
        }
    }

    fn get_item(&self, value: &Value, key: &Value) -> Result<Value> {
        match value {
            Value::Undefined => Err(Error::Undefined(format!(
                "tried to access item '{}' of an undefined value",
                key.to_output_string()
            ))),
            other => Ok(self.ctx.environment().get_item(other, key)),
        }
    }

    fn apply_filter_spec(&mut self, spec: &FilterSpec, operand: Value) -> Result<Value> {
        let mut all = vec![operand];
        for arg in &spec.args {
            all.push(self.eval(arg)?);
        }
        let kwargs = self.eval_kwargs(&spec.kwargs)?;
        self.ctx.filter(&spec.name, &all, &kwargs)
    }

    // ---- calls ----

    #[allow(clippy::too_many_arguments)]
    fn eval_call(
        &mut self,
        target: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        var_arg: &Option<Box<Expr>>,
        kw_arg: &Option<Box<Expr>>,
        caller: Option<Value>,
    ) -> Result<Value> {
        if let Expr::Name(name) = target {
            if name == "super" && args.is_empty() && kwargs.is_empty() {
                return self.call_super();
            }
        }

        let mut pos_args = Vec::with_capacity(args.len());
        for arg in args {
            pos_args.push(self.eval(arg)?);
        }
        if let Some(var_arg) = var_arg {
            let value = self.eval(var_arg)?;
            pos_args.extend(self.make_iterable(&value)?);
        }
        let mut kw_map = self.eval_kwargs(kwargs)?;
        if let Some(kw_arg) = kw_arg {
            match self.eval(kw_arg)? {
                Value::Map(entries) => kw_map.extend(entries),
                other => {
                    return Err(Error::runtime(format!(
                        "'**' argument must be a map, got {}",
                        other.kind()
                    )))
                }
            }
        }

        // loop methods dispatch on the loop object, not through the
        // generic attribute path
        if let Expr::Getattr { target: obj, name } = target {
            let obj_val = self.eval(obj)?;
            if let Value::Loop(lo) = &obj_val {
                return self.call_loop_method(lo, name, &pos_args);
            }
            let callee = self.get_attr(&obj_val, name)?;
            return self.call_value(callee, pos_args, kw_map, caller);
        }

        let callee = self.eval(target)?;
        self.call_value(callee, pos_args, kw_map, caller)
    }

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Kwargs,
        caller: Option<Value>,
    ) -> Result<Value> {
        match callee {
            Value::Func(f) => f.call(&self.ctx, &args, &kwargs),
            Value::Macro(m) => self.invoke_macro(&m, args, kwargs, caller),
            Value::Loop(lo) => self.call_loop_recursive(&lo, args),
            Value::Undefined => Err(Error::Undefined("tried to call an undefined value".into())),
            other => Err(Error::runtime(format!(
                "value of type {} is not callable",
                other.kind()
            ))),
        }
    }

    fn call_loop_method(&self, lo: &LoopValue, name: &str, args: &[Value]) -> Result<Value> {
        match name {
            "cycle" => {
                if args.is_empty() {
                    return Err(Error::runtime("no items for cycling given"));
                }
                Ok(args[lo.index0 % args.len()].clone())
            }
            "changed" => {
                let current = args.first().cloned().unwrap_or(Value::Undefined);
                let changed =
                    lo.index0 == 0 || !ops::value_eq(&current, &lo.items[lo.index0 - 1]);
                Ok(Value::Bool(changed))
            }
            other => Err(Error::runtime(format!("'loop.{other}' is not callable"))),
        }
    }

    fn call_loop_recursive(&mut self, lo: &LoopValue, args: Vec<Value>) -> Result<Value> {
        if !lo.recursive {
            return Err(Error::runtime(
                "loop() may only be called on loops marked 'recursive'",
            ));
        }
        if args.len() != 1 {
            return Err(Error::runtime("loop() takes exactly one iterable argument"));
        }
        if lo.slot >= self.active_loops.len() {
            return Err(Error::runtime("loop() called outside of its loop"));
        }
        let al = self.active_loops[lo.slot].clone();
        let iter_val = args.into_iter().next().expect("one argument");
        let mut buf = String::new();
        self.run_loop(al, iter_val, lo.depth0 + 1, None, &mut buf)?;
        Ok(Value::Markup(buf))
    }

    fn invoke_macro(
        &mut self,
        m: &Rc<MacroValue>,
        args: Vec<Value>,
        mut kwargs: Kwargs,
        caller: Option<Value>,
    ) -> Result<Value> {
        if args.len() > m.args.len() {
            return Err(Error::runtime(format!(
                "macro '{}' takes not more than {} argument(s)",
                m.name,
                m.args.len()
            )));
        }
        let mut scope = Scope::new();
        for (name, value) in m.args.iter().zip(args) {
            if kwargs.contains_key(name) {
                return Err(Error::runtime(format!(
                    "macro '{}' got multiple values for argument '{}'",
                    m.name, name
                )));
            }
            scope.insert(name.clone(), value);
        }
        for name in &m.args {
            if scope.contains_key(name) {
                continue;
            }
            if let Some(value) = kwargs.remove(name) {
                scope.insert(name.clone(), value);
            }
        }
        if let Some(unexpected) = kwargs.keys().next() {
            return Err(Error::runtime(format!(
                "macro '{}' got an unexpected keyword argument '{}'",
                m.name, unexpected
            )));
        }

        // macros see their arguments plus globals; callers additionally
        // see the scopes captured at the call site
        let scopes = match &m.closure {
            Some(captured) => {
                let mut scopes = captured.clone();
                scopes.push(scope);
                scopes
            }
            None => vec![scope],
        };
        let saved = self.ctx.swap_scopes(scopes);
        let result: Result<String> = (|| {
            let required = m.args.len() - m.defaults.len();
            for (i, name) in m.args.iter().enumerate() {
                if self.ctx.top_scope_has(name) {
                    continue;
                }
                let value = if i >= required {
                    let default = m.defaults[i - required].clone();
                    self.eval(&default)?
                } else {
                    Value::Undefined
                };
                self.ctx.set(name.clone(), value);
            }
            if m.closure.is_none() {
                self.ctx.set(m.name.clone(), Value::Macro(Rc::clone(m)));
                if let Some(caller) = caller {
                    self.ctx.set("caller", caller);
                }
            }
            let mut buf = String::new();
            self.render_stmts(&m.body, &mut buf)?;
            Ok(buf)
        })();
        self.ctx.swap_scopes(saved);
        Ok(Value::Markup(result?))
    }
}

fn loop_attr(lo: &LoopValue, name: &str) -> Value {
    let i = lo.index0;
    let len = lo.len;
    match name {
        "index" => Value::Int(i as i64 + 1),
        "index0" => Value::Int(i as i64),
        "revindex" => Value::Int((len - i) as i64),
        "revindex0" => Value::Int((len - i - 1) as i64),
        "first" => Value::Bool(i == 0),
        "last" => Value::Bool(i + 1 == len),
        "length" => Value::Int(len as i64),
        "previtem" => {
            if i == 0 {
                Value::Undefined
            } else {
                lo.items[i - 1].clone()
            }
        }
        "nextitem" => {
            if i + 1 == len {
                Value::Undefined
            } else {
                lo.items[i + 1].clone()
            }
        }
        "depth" => Value::Int(lo.depth0 as i64 + 1),
        "depth0" => Value::Int(lo.depth0 as i64),
        _ => Value::Undefined,
    }
}

/// Pull-based renderer: one chunk per top-level statement, so a caller
/// can stop early by dropping the iterator. A template rooted in
/// `extends` renders as a single chunk.
pub struct RenderChunks<'env> {
    evaluator: Evaluator<'env>,
    compiled: Rc<CompiledTemplate>,
    idx: usize,
    whole: bool,
    done: bool,
}

impl<'env> RenderChunks<'env> {
    pub(crate) fn new(
        env: &'env Environment,
        compiled: Rc<CompiledTemplate>,
        root: Scope,
    ) -> RenderChunks<'env> {
        let mut evaluator = Evaluator::new(env, root);
        let whole = matches!(compiled.body.first(), Some(Stmt::Extends { .. }));
        if !whole {
            evaluator.merge_blocks(&compiled);
            if let Some(path) = &compiled.path {
                evaluator.render_stack.push(path.clone());
            }
        }
        RenderChunks {
            evaluator,
            compiled,
            idx: 0,
            whole,
            done: false,
        }
    }
}

impl Iterator for RenderChunks<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Result<String>> {
        if self.done {
            return None;
        }
        let compiled = Rc::clone(&self.compiled);
        let mut buf = String::new();
        if self.whole {
            self.done = true;
            return Some(
                self.evaluator
                    .render_template(&compiled, &mut buf)
                    .map(|()| buf),
            );
        }
        if self.idx >= compiled.body.len() {
            self.done = true;
            return None;
        }
        let stmt = &compiled.body[self.idx];
        self.idx += 1;
        match self.evaluator.render_stmts(std::slice::from_ref(stmt), &mut buf) {
            Ok(()) => Some(Ok(buf)),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
