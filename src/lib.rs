//! ginja — a Jinja2-compatible template engine.
//!
//! The pipeline is `source → lexer → tokens → parser → AST →
//! (optimizer) → template`, and rendering walks the tree against a
//! scoped context: an [`Environment`] owns configuration, the
//! filter/test/global registries and the template cache; a
//! [`Template`] renders with caller data.
//!
//! ```
//! use ginja::{Environment, to_value};
//! use serde_json::json;
//!
//! let env = Environment::new();
//! let tmpl = env.from_string("Hello {{ name }}!").unwrap();
//! let data = to_value(json!({ "name": "World" })).unwrap();
//! assert_eq!(tmpl.render(&data).unwrap(), "Hello World!");
//! ```
//!
//! Templates support the familiar statement set — `for` with loop
//! metadata and recursion, `if`/`elif`/`else`, `set`, inheritance via
//! `extends`/`block`/`super()`, `include`, `import`, macros with
//! `call` blocks, `filter` blocks, `with`, `do`, `autoescape` and
//! `raw` — plus the full expression grammar with filters, tests,
//! slicing and inline conditions. Delimiters, whitespace control and
//! auto-escaping are configured on the [`Environment`].

pub mod ast;
mod context;
mod defaults;
mod environment;
mod error;
mod eval;
mod lexer;
mod loader;
mod optimizer;
mod parser;
pub mod token;
mod value;

pub use crate::context::Context;
pub use crate::environment::{
    pass_context, pass_environment, Environment, Finalize, PassMode, RegisteredCallable, Template,
};
pub use crate::error::{Error, Location, Result};
pub use crate::eval::RenderChunks;
pub use crate::lexer::{Syntax, Tokenizer};
pub use crate::loader::{Loader, MapLoader};
pub use crate::parser::Parser;
pub use crate::value::{escape_html, to_value, Kwargs, Scope, Value};

/// Renders a one-off template with a default environment.
///
/// For anything beyond a single render, build an [`Environment`] and
/// reuse it: it caches nothing across calls here.
pub fn render_str(source: &str, data: &Value) -> Result<String> {
    Environment::new().render_str(source, data)
}
