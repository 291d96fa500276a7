use super::engine::{ExecutionEngine, UnitHandle};
use super::ir::{BlockId, FuncId, Function, InstKind, Module, Value};
use super::{Backend, FloatOp, FloatPredicate};
use crate::error::{Error, ErrorKind};
use log::debug;

/// Default [`Backend`]: builds the reference IR and interprets it.
pub struct Interpreter {
    module: Module,
    units: usize,
    cursor: Option<(FuncId, BlockId)>,
    engine: ExecutionEngine,
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::with_engine(ExecutionEngine::new())
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpreter whose calls may nest at most `max_call_depth` deep.
    pub fn with_max_call_depth(max_call_depth: usize) -> Self {
        Interpreter::with_engine(ExecutionEngine::with_max_call_depth(max_call_depth))
    }

    fn with_engine(engine: ExecutionEngine) -> Self {
        Interpreter {
            module: Module::new("unit0".to_owned()),
            units: 1,
            cursor: None,
            engine,
        }
    }

    /// The unit currently being built.
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    fn function(&self, id: FuncId) -> Option<&Function> {
        self.module.get(id)
    }

    fn emit(&mut self, kind: InstKind, name: &str) -> Result<Value, Error> {
        let (func, block) = self.cursor.ok_or_else(|| Error::from(ErrorKind::NoInsertPoint))?;
        let function = self
            .module
            .get_mut(func)
            .ok_or_else(|| Error::from(ErrorKind::NoInsertPoint))?;
        Ok(Value::Inst(function.insert(block, kind, name, false)))
    }
}

impl Backend for Interpreter {
    type Value = Value;
    type Block = (FuncId, BlockId);
    type Function = FuncId;
    type Unit = UnitHandle;

    fn get_function(&self, name: &str) -> Option<FuncId> {
        self.module.find(name)
    }

    fn declare_function(&mut self, name: &str, params: &[String]) -> FuncId {
        self.module.add(Function::new(name, params))
    }

    fn param_count(&self, function: FuncId) -> usize {
        self.function(function).map_or(0, |f| f.params.len())
    }

    fn param(&self, _function: FuncId, index: usize) -> Value {
        Value::Param(index)
    }

    fn has_body(&self, function: FuncId) -> bool {
        self.function(function).map_or(false, |f| !f.is_declaration())
    }

    fn append_block(&mut self, function: FuncId, name: &str) -> (FuncId, BlockId) {
        let block = match self.module.get_mut(function) {
            Some(f) => f.append_block(name),
            None => BlockId(usize::max_value()),
        };
        (function, block)
    }

    fn position_at_end(&mut self, block: (FuncId, BlockId)) {
        self.cursor = Some(block);
    }

    fn insert_block(&self) -> Option<(FuncId, BlockId)> {
        self.cursor
    }

    fn const_number(&mut self, value: f64) -> Value {
        Value::Const(value)
    }

    fn build_alloca(&mut self, function: FuncId, name: &str) -> Result<Value, Error> {
        let function = self
            .module
            .get_mut(function)
            .filter(|f| !f.is_declaration())
            .ok_or_else(|| Error::from(ErrorKind::NoInsertPoint))?;
        Ok(Value::Inst(function.insert(
            BlockId(0),
            InstKind::Alloca,
            name,
            true,
        )))
    }

    fn build_load(&mut self, slot: Value, name: &str) -> Result<Value, Error> {
        self.emit(InstKind::Load(slot), name)
    }

    fn build_store(&mut self, slot: Value, value: Value) -> Result<(), Error> {
        self.emit(InstKind::Store { slot, value }, "").map(|_| ())
    }

    fn build_float_op(
        &mut self,
        op: FloatOp,
        lhs: Value,
        rhs: Value,
        name: &str,
    ) -> Result<Value, Error> {
        self.emit(InstKind::Float { op, lhs, rhs }, name)
    }

    fn build_compare(
        &mut self,
        predicate: FloatPredicate,
        lhs: Value,
        rhs: Value,
        name: &str,
    ) -> Result<Value, Error> {
        self.emit(
            InstKind::Compare {
                predicate,
                lhs,
                rhs,
            },
            name,
        )
    }

    fn build_bool_to_number(&mut self, flag: Value, name: &str) -> Result<Value, Error> {
        self.emit(InstKind::BoolToNumber(flag), name)
    }

    fn build_br(&mut self, dest: (FuncId, BlockId)) -> Result<(), Error> {
        self.emit(InstKind::Br(dest.1), "").map(|_| ())
    }

    fn build_cond_br(
        &mut self,
        cond: Value,
        then_block: (FuncId, BlockId),
        else_block: (FuncId, BlockId),
    ) -> Result<(), Error> {
        self.emit(
            InstKind::CondBr {
                cond,
                then_block: then_block.1,
                else_block: else_block.1,
            },
            "",
        )
        .map(|_| ())
    }

    fn build_phi(
        &mut self,
        incoming: &[(Value, (FuncId, BlockId))],
        name: &str,
    ) -> Result<Value, Error> {
        let incoming = incoming
            .iter()
            .map(|(value, (_, block))| (*value, *block))
            .collect();
        self.emit(InstKind::Phi(incoming), name)
    }

    fn build_call(&mut self, callee: FuncId, args: &[Value], name: &str) -> Result<Value, Error> {
        let callee = self
            .function(callee)
            .map(|f| f.name.clone())
            .ok_or_else(|| Error::from(ErrorKind::NoInsertPoint))?;
        self.emit(
            InstKind::Call {
                callee,
                args: args.to_vec(),
            },
            name,
        )
    }

    fn build_ret(&mut self, value: Value) -> Result<(), Error> {
        self.emit(InstKind::Ret(value), "").map(|_| ())
    }

    fn verify_function(&self, function: FuncId) -> Result<(), Error> {
        let f = match self.function(function) {
            Some(f) => f,
            None => return Ok(()),
        };
        f.verify().map_err(|reason| {
            Error::from(ErrorKind::Verify {
                name: f.name.clone(),
                reason,
            })
        })
    }

    fn delete_function(&mut self, function: FuncId) {
        if let Some(f) = self.module.remove(function) {
            debug!("erased '{}' from {}", f.name, self.module.name);
        }
        if self.cursor.map_or(false, |(f, _)| f == function) {
            self.cursor = None;
        }
    }

    fn print_function(&self, function: FuncId) -> String {
        self.function(function)
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    fn is_defined(&self, name: &str) -> bool {
        self.engine.find_function(name).is_some()
    }

    fn submit_unit(&mut self) -> Result<UnitHandle, Error> {
        let fresh = Module::new(format!("unit{}", self.units));
        self.units += 1;
        self.cursor = None;
        let module = std::mem::replace(&mut self.module, fresh);
        for function in module.functions().filter(|f| !f.is_declaration()) {
            function.verify().map_err(|reason| {
                Error::from(ErrorKind::Verify {
                    name: function.name.clone(),
                    reason,
                })
            })?;
        }
        Ok(self.engine.add_module(module))
    }

    fn run_function(&mut self, unit: &UnitHandle, name: &str) -> Result<f64, Error> {
        if !self.engine.is_loaded(*unit) {
            return Err(Error::from(ErrorKind::UnknownUnit));
        }
        self.engine.run_function(name, &[])
    }

    fn remove_unit(&mut self, unit: UnitHandle) -> Result<(), Error> {
        self.engine.remove_module(unit).map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_build_and_run() {
        let mut b = Interpreter::new();
        let f = b.declare_function("anon", &[]);
        let entry = b.append_block(f, "entry");
        b.position_at_end(entry);
        let slot = b.build_alloca(f, "x").unwrap();
        let two = b.const_number(2.0);
        b.build_store(slot, two).unwrap();
        let x = b.build_load(slot, "x").unwrap();
        let sum = b.build_float_op(FloatOp::Add, x, x, "addtmp").unwrap();
        b.build_ret(sum).unwrap();
        b.verify_function(f).unwrap();
        assert!(b.has_body(f));

        let unit = b.submit_unit().unwrap();
        assert!(b.get_function("anon").is_none());
        assert!(b.is_defined("anon"));
        assert_eq!(b.run_function(&unit, "anon").unwrap(), 4.0);

        b.remove_unit(unit).unwrap();
        assert!(!b.is_defined("anon"));
        assert_eq!(
            b.run_function(&unit, "anon").unwrap_err().kind(),
            &ErrorKind::UnknownUnit
        );
    }

    #[test]
    fn test_no_insert_point() {
        let mut b = Interpreter::new();
        let one = b.const_number(1.0);
        assert_eq!(
            b.build_ret(one).unwrap_err().kind(),
            &ErrorKind::NoInsertPoint
        );
    }

    #[test]
    fn test_delete_function_clears_cursor() {
        let mut b = Interpreter::new();
        let f = b.declare_function("f", &["x".to_owned()]);
        let entry = b.append_block(f, "entry");
        b.position_at_end(entry);
        b.delete_function(f);
        assert!(b.get_function("f").is_none());
        assert!(b.insert_block().is_none());
        assert_eq!(b.print_function(f), "");
    }

    #[test]
    fn test_submit_rejects_malformed_body() {
        let mut b = Interpreter::new();
        let f = b.declare_function("f", &[]);
        let entry = b.append_block(f, "entry");
        b.position_at_end(entry);
        b.build_alloca(f, "x").unwrap();
        match b.submit_unit().unwrap_err().kind() {
            ErrorKind::Verify { name, .. } => assert_eq!(name, "f"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
