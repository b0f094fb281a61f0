use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::ast::{find_blocks, BlockDef, Stmt};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::eval::{Evaluator, RenderChunks};
use crate::lexer::{Syntax, Tokenizer};
use crate::loader::Loader;
use crate::optimizer;
use crate::parser::Parser;
use crate::token::Token;
use crate::value::{ops, Kwargs, Scope, Value};

/// Whether a registered callable wants the active context or the owning
/// environment prepended to its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    None,
    Context,
    Environment,
}

enum CallableImpl {
    Plain(Box<dyn Fn(&[Value], &Kwargs) -> Result<Value>>),
    WithContext(Box<dyn Fn(&Context, &[Value], &Kwargs) -> Result<Value>>),
    WithEnvironment(Box<dyn Fn(&Environment, &[Value], &Kwargs) -> Result<Value>>),
}

/// A filter, test or global function together with its pass mode.
pub struct RegisteredCallable {
    name: String,
    imp: CallableImpl,
}

impl RegisteredCallable {
    pub fn new(f: impl Fn(&[Value], &Kwargs) -> Result<Value> + 'static) -> RegisteredCallable {
        RegisteredCallable {
            name: String::new(),
            imp: CallableImpl::Plain(Box::new(f)),
        }
    }

    pub fn mode(&self) -> PassMode {
        match self.imp {
            CallableImpl::Plain(_) => PassMode::None,
            CallableImpl::WithContext(_) => PassMode::Context,
            CallableImpl::WithEnvironment(_) => PassMode::Environment,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn named(mut self, name: &str) -> RegisteredCallable {
        self.name = name.to_string();
        self
    }

    pub(crate) fn call(&self, ctx: &Context, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        match &self.imp {
            CallableImpl::Plain(f) => f(args, kwargs),
            CallableImpl::WithContext(f) => f(ctx, args, kwargs),
            CallableImpl::WithEnvironment(f) => f(ctx.environment(), args, kwargs),
        }
    }
}

impl fmt::Debug for RegisteredCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredCallable")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .finish()
    }
}

/// Registers a callable that receives the active `Context` first.
pub fn pass_context(
    f: impl Fn(&Context, &[Value], &Kwargs) -> Result<Value> + 'static,
) -> RegisteredCallable {
    RegisteredCallable {
        name: String::new(),
        imp: CallableImpl::WithContext(Box::new(f)),
    }
}

/// Registers a callable that receives the owning `Environment` first.
pub fn pass_environment(
    f: impl Fn(&Environment, &[Value], &Kwargs) -> Result<Value> + 'static,
) -> RegisteredCallable {
    RegisteredCallable {
        name: String::new(),
        imp: CallableImpl::WithEnvironment(Box::new(f)),
    }
}

/// Post-processing applied to every rendered expression. The three
/// accepted shapes are normalized behind `Environment::apply_finalize`;
/// registration is statically typed, so the unknown-signature failure
/// the dynamic protocol guards against cannot arise here.
pub enum Finalize {
    Value(Box<dyn Fn(Value) -> Value>),
    WithEnvironment(Box<dyn Fn(&Environment, Value) -> Value>),
    WithContext(Box<dyn Fn(&Context, Value) -> Value>),
}

type AttributeHook = Box<dyn Fn(&Value, &str) -> Option<Value>>;
type ItemHook = Box<dyn Fn(&Value, &Value) -> Option<Value>>;
type Modifier = Box<dyn Fn(&Environment, &mut Vec<Stmt>)>;

/// A parsed template, owned by the environment's cache or by the
/// `Template` handles cloned from it.
pub(crate) struct CompiledTemplate {
    pub(crate) body: Vec<Stmt>,
    pub(crate) blocks: BTreeMap<String, BlockDef>,
    pub(crate) path: Option<String>,
}

/// Configuration root: delimiters and whitespace policy, the three
/// registries, the template cache, and every pipeline entry point.
pub struct Environment {
    syntax: Syntax,
    optimize: bool,
    auto_escape: bool,
    auto_reload: bool,
    strict_lookup: bool,
    finalize: Option<Finalize>,
    globals: BTreeMap<String, Value>,
    filters: BTreeMap<String, RegisteredCallable>,
    tests: BTreeMap<String, RegisteredCallable>,
    modifiers: Vec<Modifier>,
    loader: Option<Box<dyn Loader>>,
    cache: RefCell<HashMap<String, Rc<CompiledTemplate>>>,
    attribute_hook: Option<AttributeHook>,
    item_hook: Option<ItemHook>,
}

impl Default for Environment {
    fn default() -> Environment {
        Environment::new()
    }
}

impl Environment {
    /// An environment with the canonical `{% %}` / `{{ }}` / `{# #}`
    /// delimiters and the built-in filters, tests and globals.
    pub fn new() -> Environment {
        let mut env = Environment {
            syntax: Syntax::default(),
            optimize: true,
            auto_escape: false,
            auto_reload: true,
            strict_lookup: false,
            finalize: None,
            globals: BTreeMap::new(),
            filters: BTreeMap::new(),
            tests: BTreeMap::new(),
            modifiers: Vec::new(),
            loader: None,
            cache: RefCell::new(HashMap::new()),
            attribute_hook: None,
            item_hook: None,
        };
        crate::defaults::register_defaults(&mut env);
        env
    }

    /// An environment with no built-ins registered at all.
    pub fn empty() -> Environment {
        Environment {
            syntax: Syntax::default(),
            optimize: true,
            auto_escape: false,
            auto_reload: true,
            strict_lookup: false,
            finalize: None,
            globals: BTreeMap::new(),
            filters: BTreeMap::new(),
            tests: BTreeMap::new(),
            modifiers: Vec::new(),
            loader: None,
            cache: RefCell::new(HashMap::new()),
            attribute_hook: None,
            item_hook: None,
        }
    }

    // ---- configuration ----

    pub fn syntax(&self) -> &Syntax {
        &self.syntax
    }

    /// Replaces the delimiter/whitespace configuration wholesale.
    pub fn set_syntax(&mut self, syntax: Syntax) {
        self.syntax = syntax;
        self.cache.borrow_mut().clear();
    }

    pub fn set_trim_blocks(&mut self, on: bool) {
        self.syntax.trim_blocks = on;
    }

    pub fn set_lstrip_blocks(&mut self, on: bool) {
        self.syntax.lstrip_blocks = on;
    }

    pub fn set_keep_trailing_newline(&mut self, on: bool) {
        self.syntax.keep_trailing_newline = on;
    }

    pub fn set_newline(&mut self, newline: &str) {
        self.syntax.newline = newline.to_string();
    }

    pub fn set_line_statement_prefix(&mut self, prefix: Option<&str>) {
        self.syntax.line_statement_prefix = prefix.map(str::to_string);
    }

    pub fn set_line_comment_prefix(&mut self, prefix: Option<&str>) {
        self.syntax.line_comment_prefix = prefix.map(str::to_string);
    }

    pub fn set_optimize(&mut self, on: bool) {
        self.optimize = on;
    }

    pub fn auto_escape(&self) -> bool {
        self.auto_escape
    }

    pub fn set_auto_escape(&mut self, on: bool) {
        self.auto_escape = on;
    }

    pub fn set_auto_reload(&mut self, on: bool) {
        self.auto_reload = on;
    }

    pub fn strict_lookup(&self) -> bool {
        self.strict_lookup
    }

    /// When on, resolving an unknown name raises
    /// `Error::ContextVariableNotFound` instead of yielding undefined.
    pub fn set_strict_lookup(&mut self, on: bool) {
        self.strict_lookup = on;
    }

    pub fn set_finalize(&mut self, finalize: Finalize) {
        self.finalize = Some(finalize);
    }

    pub(crate) fn apply_finalize(&self, ctx: &Context, value: Value) -> Value {
        match &self.finalize {
            None => value,
            Some(Finalize::Value(f)) => f(value),
            Some(Finalize::WithEnvironment(f)) => f(self, value),
            Some(Finalize::WithContext(f)) => f(ctx, value),
        }
    }

    pub fn set_loader(&mut self, loader: impl Loader + 'static) {
        self.loader = Some(Box::new(loader));
        self.cache.borrow_mut().clear();
    }

    /// Overrides attribute access; return `None` to fall back to the
    /// default map-field policy.
    pub fn set_attribute_hook(&mut self, hook: impl Fn(&Value, &str) -> Option<Value> + 'static) {
        self.attribute_hook = Some(Box::new(hook));
    }

    /// Overrides subscript access; return `None` to fall back to the
    /// default array/map/string policy.
    pub fn set_item_hook(&mut self, hook: impl Fn(&Value, &Value) -> Option<Value> + 'static) {
        self.item_hook = Some(Box::new(hook));
    }

    /// Registers an AST modifier, run over every parsed template in
    /// registration order, before the optimizer.
    pub fn add_modifier(&mut self, modifier: impl Fn(&Environment, &mut Vec<Stmt>) + 'static) {
        self.modifiers.push(Box::new(modifier));
    }

    // ---- registries ----

    pub fn add_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    /// Registers a callable global, reachable as `name(...)`.
    pub fn add_function(&mut self, name: &str, callable: RegisteredCallable) {
        self.globals
            .insert(name.to_string(), Value::Func(Rc::new(callable.named(name))));
    }

    pub fn add_filter(&mut self, name: &str, f: impl Fn(&[Value], &Kwargs) -> Result<Value> + 'static) {
        self.register_filter(name, RegisteredCallable::new(f));
    }

    pub fn register_filter(&mut self, name: &str, callable: RegisteredCallable) {
        self.filters.insert(name.to_string(), callable.named(name));
    }

    pub fn add_test(&mut self, name: &str, f: impl Fn(&[Value], &Kwargs) -> Result<Value> + 'static) {
        self.register_test(name, RegisteredCallable::new(f));
    }

    pub fn register_test(&mut self, name: &str, callable: RegisteredCallable) {
        self.tests.insert(name.to_string(), callable.named(name));
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub(crate) fn global_names(&self) -> Vec<String> {
        self.globals.keys().cloned().collect()
    }

    pub(crate) fn filter_callable(&self, name: &str) -> Option<&RegisteredCallable> {
        self.filters.get(name)
    }

    pub(crate) fn test_callable(&self, name: &str) -> Option<&RegisteredCallable> {
        self.tests.get(name)
    }

    // ---- attribute / subscript policy ----

    /// Attribute access: the hook first, then map fields, then the
    /// subscript fallback.
    pub fn get_attribute(&self, value: &Value, name: &str) -> Value {
        if let Some(hook) = &self.attribute_hook {
            if let Some(found) = hook(value, name) {
                return found;
            }
        }
        if let Value::Map(entries) = value {
            if let Some(found) = entries.get(name) {
                return found.clone();
            }
        }
        self.get_item(value, &Value::String(name.to_string()))
    }

    /// Subscript access: the hook first, then the built-in
    /// array/map/string policy; misses yield undefined.
    pub fn get_item(&self, value: &Value, key: &Value) -> Value {
        if let Some(hook) = &self.item_hook {
            if let Some(found) = hook(value, key) {
                return found;
            }
        }
        ops::get_item(value, key).unwrap_or(Value::Undefined)
    }

    // ---- pipeline entry points ----

    /// Tokenizes a source string with this environment's syntax.
    pub fn lex(&self, source: &str) -> Result<Vec<Token>> {
        Tokenizer::new(source, &self.syntax, None).tokenize()
    }

    /// Parses a source string into its top-level statement list.
    pub fn parse(&self, source: &str) -> Result<Vec<Stmt>> {
        Parser::new(source, &self.syntax, None).parse()
    }

    fn compile(&self, source: &str, path: Option<&str>) -> Result<Rc<CompiledTemplate>> {
        let mut body = Parser::new(source, &self.syntax, path).parse()?;
        for modifier in &self.modifiers {
            modifier(self, &mut body);
        }
        if self.optimize {
            optimizer::optimize(&mut body);
        }
        let blocks = find_blocks(&body)
            .into_iter()
            .map(|def| (def.name.clone(), def.clone()))
            .collect();
        debug!(path, bytes = source.len(), "compiled template");
        Ok(Rc::new(CompiledTemplate {
            body,
            blocks,
            path: path.map(str::to_string),
        }))
    }

    /// Compiles a template from a string, outside the loader/cache path.
    pub fn from_string(&self, source: &str) -> Result<Template<'_>> {
        Ok(Template {
            env: self,
            compiled: self.compile(source, None)?,
        })
    }

    /// Loads a template by name through the configured loader. With
    /// `auto_reload` off, compiled templates are cached by name.
    pub fn get_template(&self, name: &str) -> Result<Template<'_>> {
        if !self.auto_reload {
            if let Some(compiled) = self.cache.borrow().get(name) {
                debug!(name, "template cache hit");
                return Ok(Template {
                    env: self,
                    compiled: Rc::clone(compiled),
                });
            }
        }
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| Error::runtime("no template loader configured"))?;
        let source = loader.load(self, name)?;
        let compiled = self.compile(&source, Some(name))?;
        if !self.auto_reload {
            debug!(name, "caching compiled template");
            self.cache
                .borrow_mut()
                .insert(name.to_string(), Rc::clone(&compiled));
        }
        Ok(Template {
            env: self,
            compiled,
        })
    }

    /// Names the configured loader can resolve.
    pub fn list_templates(&self) -> Vec<String> {
        self.loader.as_ref().map(|l| l.list()).unwrap_or_default()
    }

    /// One-shot compile-and-render of a source string.
    pub fn render_str(&self, source: &str, data: &Value) -> Result<String> {
        self.from_string(source)?.render(data)
    }
}

/// Two environments are equivalent when templates lex identically under
/// them: delimiters and whitespace policy are what matters.
impl PartialEq for Environment {
    fn eq(&self, other: &Environment) -> bool {
        self.syntax == other.syntax
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("syntax", &self.syntax)
            .field("optimize", &self.optimize)
            .field("auto_escape", &self.auto_escape)
            .field("auto_reload", &self.auto_reload)
            .finish_non_exhaustive()
    }
}

/// A compiled template bound to its environment.
#[derive(Clone)]
pub struct Template<'env> {
    env: &'env Environment,
    compiled: Rc<CompiledTemplate>,
}

impl<'env> Template<'env> {
    pub fn path(&self) -> Option<&str> {
        self.compiled.path.as_deref()
    }

    pub(crate) fn compiled(&self) -> &CompiledTemplate {
        &self.compiled
    }

    pub(crate) fn compiled_rc(&self) -> Rc<CompiledTemplate> {
        Rc::clone(&self.compiled)
    }

    /// Renders with `data` as the root scope. `data` must be a map (or
    /// none/undefined for an empty scope).
    pub fn render(&self, data: &Value) -> Result<String> {
        let mut out = String::new();
        self.render_to(&mut out, data)?;
        Ok(out)
    }

    /// Renders into any `fmt::Write` sink.
    pub fn render_to(&self, out: &mut dyn fmt::Write, data: &Value) -> Result<()> {
        let root = root_scope(data)?;
        let mut evaluator = Evaluator::new(self.env, root);
        evaluator.render_template(self.compiled(), out)
    }

    /// A pull-based renderer yielding one chunk per top-level statement;
    /// dropping the iterator cancels the rest of the render.
    pub fn render_chunks(&self, data: &Value) -> Result<RenderChunks<'env>> {
        let root = root_scope(data)?;
        Ok(RenderChunks::new(self.env, self.compiled_rc(), root))
    }
}

fn root_scope(data: &Value) -> Result<Scope> {
    match data {
        Value::Map(entries) => Ok(entries.clone()),
        Value::None | Value::Undefined => Ok(Scope::new()),
        other => Err(Error::runtime(format!(
            "template data must be a map, got {}",
            other.kind()
        ))),
    }
}
