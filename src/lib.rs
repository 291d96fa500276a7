//! A JIT-compiled Kaleidoscope: lexer, operator-precedence parser, SSA code
//! generator and a compilation-unit manager driving a pluggable backend.

pub mod ast;
pub mod backend;
pub mod codegen;
pub mod config;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod token;
pub mod toplevel;

pub use self::backend::{Backend, Interpreter};
pub use self::config::{Config, ErrorPolicy};
pub use self::error::{Error, ErrorKind};
pub use self::toplevel::{Outcome, Session};
