use thiserror::Error;

use crate::token::Span;

pub type Result<T> = std::result::Result<T, Error>;

/// Where in a template source an error was detected.
///
/// `line` is 1-based, `start`/`end` are byte offsets into the source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    pub path: Option<String>,
    pub line: u32,
    pub start: u32,
    pub end: u32,
}

impl Location {
    pub(crate) fn from_span(span: Span, path: Option<&str>) -> Location {
        Location {
            path: path.map(str::to_string),
            line: span.line,
            start: span.start,
            end: span.end,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Lexer or parser failure.
    #[error("{message}")]
    Syntax { message: String, location: Location },

    /// A parse-time semantic error (reserved target name, hyphenated
    /// block name, and the like).
    #[error("{message}")]
    Assertion { message: String, location: Location },

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// None of the candidate templates of an `include` could be resolved.
    #[error("none of the templates could be found: {}", .0.join(", "))]
    TemplatesNotFound(Vec<String>),

    /// Generic render failure: unknown filter or test, missing required
    /// block, unpack arity mismatch, invalid call.
    #[error("{0}")]
    Runtime(String),

    /// An operation on the undefined sentinel that demands a value.
    #[error("{0}")]
    Undefined(String),

    /// Strict-lookup mode only: a name could not be resolved at all.
    #[error("variable '{variable_name}' not found in context")]
    ContextVariableNotFound { variable_name: String },
}

impl Error {
    pub(crate) fn syntax(message: impl Into<String>, span: Span, path: Option<&str>) -> Error {
        Error::Syntax {
            message: message.into(),
            location: Location::from_span(span, path),
        }
    }

    pub(crate) fn assertion(message: impl Into<String>, span: Span, path: Option<&str>) -> Error {
        Error::Assertion {
            message: message.into(),
            location: Location::from_span(span, path),
        }
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Error {
        Error::Runtime(message.into())
    }

    /// The source location, for the error kinds that carry one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Error::Syntax { location, .. } | Error::Assertion { location, .. } => Some(location),
            _ => None,
        }
    }
}

impl From<std::fmt::Error> for Error {
    fn from(_: std::fmt::Error) -> Error {
        Error::Runtime("failed to write rendered output".into())
    }
}
