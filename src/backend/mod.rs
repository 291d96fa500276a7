//! IR construction and execution, consumed by the code generator.
//!
//! [`Backend`] is everything codegen and the session need from an IR
//! library and a JIT: building functions into the current compilation unit,
//! submitting that unit for execution, running and unloading it.
//!
//! - [`Interpreter`]: reference SSA IR plus an interpreting engine (default).
//! - `llvm::LlvmBackend`: LLVM's C API through `llvm-sys` (feature `llvm`).

pub mod engine;
pub mod interp;
pub mod ir;

#[cfg(feature = "llvm")]
pub mod llvm;

pub use self::interp::Interpreter;

use super::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl FloatOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            FloatOp::Add => lhs + rhs,
            FloatOp::Sub => lhs - rhs,
            FloatOp::Mul => lhs * rhs,
            FloatOp::Div => lhs / rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatPredicate {
    /// Unordered or less than.
    Ult,
    /// Ordered and not equal.
    One,
}

impl FloatPredicate {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        let unordered = lhs.is_nan() || rhs.is_nan();
        match self {
            FloatPredicate::Ult => unordered || lhs < rhs,
            FloatPredicate::One => !unordered && lhs != rhs,
        }
    }
}

/// Every function takes and returns the single scalar type `double`.
pub trait Backend {
    type Value: Copy;
    type Block: Copy;
    type Function: Copy;
    /// A submitted compilation unit.
    type Unit;

    /// Looks a function up in the current unit only.
    fn get_function(&self, name: &str) -> Option<Self::Function>;
    /// Declares a function in the current unit.
    fn declare_function(&mut self, name: &str, params: &[String]) -> Self::Function;
    fn param_count(&self, function: Self::Function) -> usize;
    fn param(&self, function: Self::Function, index: usize) -> Self::Value;
    /// Whether the function already has a body.
    fn has_body(&self, function: Self::Function) -> bool;

    fn append_block(&mut self, function: Self::Function, name: &str) -> Self::Block;
    fn position_at_end(&mut self, block: Self::Block);
    fn insert_block(&self) -> Option<Self::Block>;

    fn const_number(&mut self, value: f64) -> Self::Value;
    /// Allocates a mutable slot at the start of the function's entry block.
    fn build_alloca(&mut self, function: Self::Function, name: &str) -> Result<Self::Value, Error>;
    fn build_load(&mut self, slot: Self::Value, name: &str) -> Result<Self::Value, Error>;
    fn build_store(&mut self, slot: Self::Value, value: Self::Value) -> Result<(), Error>;
    fn build_float_op(
        &mut self,
        op: FloatOp,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> Result<Self::Value, Error>;
    fn build_compare(
        &mut self,
        predicate: FloatPredicate,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> Result<Self::Value, Error>;
    /// Widens a comparison result to 0.0 / 1.0.
    fn build_bool_to_number(&mut self, flag: Self::Value, name: &str)
        -> Result<Self::Value, Error>;
    fn build_br(&mut self, dest: Self::Block) -> Result<(), Error>;
    fn build_cond_br(
        &mut self,
        cond: Self::Value,
        then_block: Self::Block,
        else_block: Self::Block,
    ) -> Result<(), Error>;
    fn build_phi(
        &mut self,
        incoming: &[(Self::Value, Self::Block)],
        name: &str,
    ) -> Result<Self::Value, Error>;
    fn build_call(
        &mut self,
        callee: Self::Function,
        args: &[Self::Value],
        name: &str,
    ) -> Result<Self::Value, Error>;
    fn build_ret(&mut self, value: Self::Value) -> Result<(), Error>;

    fn verify_function(&self, function: Self::Function) -> Result<(), Error>;
    /// Erases the function from the current unit.
    fn delete_function(&mut self, function: Self::Function);
    fn print_function(&self, function: Self::Function) -> String;

    /// Whether any loaded unit carries a compiled body for `name`.
    fn is_defined(&self, name: &str) -> bool;
    /// Hands the current unit to the execution engine and opens a fresh one.
    fn submit_unit(&mut self) -> Result<Self::Unit, Error>;
    /// Runs a zero-argument function and returns its result.
    fn run_function(&mut self, unit: &Self::Unit, name: &str) -> Result<f64, Error>;
    /// Unloads a previously submitted unit.
    fn remove_unit(&mut self, unit: Self::Unit) -> Result<(), Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(FloatPredicate::Ult.apply(1.0, 2.0));
        assert!(!FloatPredicate::Ult.apply(2.0, 2.0));
        assert!(FloatPredicate::Ult.apply(std::f64::NAN, 2.0));

        assert!(FloatPredicate::One.apply(1.0, 0.0));
        assert!(!FloatPredicate::One.apply(0.0, 0.0));
        assert!(!FloatPredicate::One.apply(std::f64::NAN, 0.0));
    }

    #[test]
    fn test_float_ops() {
        assert_eq!(FloatOp::Add.apply(1.0, 2.0), 3.0);
        assert_eq!(FloatOp::Sub.apply(1.0, 2.0), -1.0);
        assert_eq!(FloatOp::Mul.apply(3.0, 2.0), 6.0);
        assert_eq!(FloatOp::Div.apply(3.0, 2.0), 1.5);
    }
}
