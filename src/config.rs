use crate::backend::engine::DEFAULT_MAX_CALL_DEPTH;

/// What a [`Session`](crate::toplevel::Session) does when a statement fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Report the error as an outcome and carry on with the next statement.
    Recover,
    /// Stop at the first error and hand it back to the caller.
    Abort,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::Recover
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub error_policy: ErrorPolicy,
    /// Print every generated function to stderr.
    pub dump_ir: bool,
    /// Deepest call chain the interpreting backend runs. Native code
    /// compiled by LLVM is bounded by the process stack instead.
    pub max_call_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            error_policy: ErrorPolicy::default(),
            dump_ir: false,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl Config {
    pub fn strict() -> Self {
        Config {
            error_policy: ErrorPolicy::Abort,
            ..Config::default()
        }
    }
}
