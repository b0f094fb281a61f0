use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::value::{escape_html, Kwargs, Scope, Value};

/// Scoped variable resolution for one render.
///
/// Lookup order is innermost scope outward, then the environment
/// globals, then the undefined sentinel. The root scope holds the data
/// the caller passed to `render`.
pub struct Context<'env> {
    env: &'env Environment,
    scopes: Vec<Scope>,
    auto_escape: bool,
}

impl<'env> Context<'env> {
    pub fn new(env: &'env Environment, root: Scope) -> Context<'env> {
        Context {
            env,
            scopes: vec![root],
            auto_escape: env.auto_escape(),
        }
    }

    pub(crate) fn with_scopes(
        env: &'env Environment,
        scopes: Vec<Scope>,
        auto_escape: bool,
    ) -> Context<'env> {
        let scopes = if scopes.is_empty() {
            vec![Scope::new()]
        } else {
            scopes
        };
        Context {
            env,
            scopes,
            auto_escape,
        }
    }

    pub fn environment(&self) -> &'env Environment {
        self.env
    }

    pub fn auto_escape(&self) -> bool {
        self.auto_escape
    }

    pub(crate) fn set_auto_escape(&mut self, on: bool) {
        self.auto_escape = on;
    }

    /// Resolves a name; never errors in the default mode, returning the
    /// undefined sentinel instead. Strict lookup turns a miss into
    /// `Error::ContextVariableNotFound`.
    pub fn resolve(&self, name: &str) -> Result<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.env.global(name) {
            return Ok(value);
        }
        if self.env.strict_lookup() {
            return Err(Error::ContextVariableNotFound {
                variable_name: name.to_string(),
            });
        }
        Ok(Value::Undefined)
    }

    /// Binds a name in the innermost scope.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.scopes
            .last_mut()
            .expect("context always has a scope")
            .insert(name.into(), value);
    }

    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
        debug_assert!(!self.scopes.is_empty());
    }

    pub(crate) fn top_scope_has(&self, name: &str) -> bool {
        self.scopes
            .last()
            .expect("context always has a scope")
            .contains_key(name)
    }

    pub(crate) fn root_scope(&self) -> Scope {
        self.scopes[0].clone()
    }

    pub(crate) fn scopes_snapshot(&self) -> Vec<Scope> {
        self.scopes.clone()
    }

    pub(crate) fn swap_scopes(&mut self, scopes: Vec<Scope>) -> Vec<Scope> {
        std::mem::replace(&mut self.scopes, scopes)
    }

    pub(crate) fn take_top_scope(&mut self) -> Scope {
        self.scopes.pop().unwrap_or_default()
    }

    /// An independent context that starts from this one's scopes;
    /// writes into it do not affect the original.
    pub fn derived(&self) -> Context<'env> {
        Context {
            env: self.env,
            scopes: self.scopes.clone(),
            auto_escape: self.auto_escape,
        }
    }

    /// Runs `f` with `overrides` pushed as a fresh scope. The scope is
    /// popped on every path, including early error returns.
    pub fn apply<R>(
        &mut self,
        overrides: Scope,
        f: impl FnOnce(&mut Context<'env>) -> Result<R>,
    ) -> Result<R> {
        self.scopes.push(overrides);
        let result = f(self);
        self.scopes.pop();
        result
    }

    /// Dispatches a filter through the environment registry.
    pub fn filter(&self, name: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        match self.env.filter_callable(name) {
            Some(callable) => callable.call(self, args, kwargs),
            None => Err(Error::runtime(format!("unknown filter '{name}'"))),
        }
    }

    /// Dispatches a test through the environment registry.
    pub fn test(&self, name: &str, args: &[Value], kwargs: &Kwargs) -> Result<bool> {
        match self.env.test_callable(name) {
            Some(callable) => Ok(callable.call(self, args, kwargs)?.is_truthy()),
            None => Err(Error::runtime(format!("unknown test '{name}'"))),
        }
    }

    /// Marks a value safe when auto-escaping is active. Markup passes
    /// through unchanged in either mode.
    pub fn escape(&self, value: Value) -> Value {
        match value {
            Value::Markup(_) => value,
            other if self.auto_escape => Value::Markup(escape_html(&other.to_output_string())),
            other => other,
        }
    }

    /// Every name currently resolvable, innermost shadowing outermost.
    pub fn known_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.env.global_names();
        for scope in &self.scopes {
            names.extend(scope.keys().cloned());
        }
        names.sort();
        names.dedup();
        names
    }
}
