use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, PartialEq, Fail)]
pub enum ErrorKind {
    #[fail(display = "invalid number literal '{}' at offset {}", literal, offset)]
    InvalidNumber { literal: String, offset: usize },

    #[fail(display = "expected {}, found {}", expected, found)]
    UnexpectedToken { expected: String, found: String },

    #[fail(display = "invalid precedence {}: must be within 1..=100", _0)]
    InvalidPrecedence(f64),

    #[fail(
        display = "invalid number of operands for operator '{}': expected {}, found {}",
        name, expected, found
    )]
    OperatorArity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[fail(display = "unknown variable name '{}'", _0)]
    UnknownVariable(String),

    #[fail(display = "unknown function referenced '{}'", _0)]
    UnknownFunction(String),

    #[fail(
        display = "incorrect # of arguments passed to '{}': expected {}, found {}",
        name, expected, found
    )]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },

    #[fail(display = "invalid binary operator '{}'", _0)]
    InvalidBinaryOperator(char),

    #[fail(display = "invalid unary operator '{}'", _0)]
    InvalidUnaryOperator(char),

    #[fail(display = "function cannot be redefined: '{}'", _0)]
    Redefinition(String),

    #[fail(
        display = "redefinition of '{}' with a different # of arguments: expected {}, found {}",
        name, expected, found
    )]
    PrototypeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[fail(display = "destination of '=' must be a variable")]
    AssignmentTarget,

    #[fail(display = "generated function '{}' is invalid: {}", name, reason)]
    Verify { name: String, reason: String },

    #[fail(display = "builder has no insertion point")]
    NoInsertPoint,

    #[fail(display = "unresolved symbol '{}'", _0)]
    UnresolvedSymbol(String),

    #[fail(display = "call depth exceeded {} frames", _0)]
    StackOverflow(usize),

    #[fail(display = "compilation unit is not loaded")]
    UnknownUnit,

    #[fail(display = "execution failed: {}", _0)]
    Execution(String),
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}
