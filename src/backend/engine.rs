//! Executes verified [`Module`]s.
//!
//! Units are loaded whole and unloaded by handle. Calls are resolved by name
//! at run time: the newest loaded unit with a body for the name wins, then
//! the native [`runtime`](crate::runtime) library.

use super::ir::{BlockId, Function, InstId, InstKind, Module, Value};
use crate::error::{Error, ErrorKind};
use crate::runtime::{self, NativeFn};
use log::debug;
use std::thread;

/// Deepest call chain the interpreter follows unless configured otherwise.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 4_096;

// Native stack reserved per interpreted call on the evaluation thread.
const STACK_PER_CALL: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitHandle(u64);

enum Callee<'a> {
    Compiled(&'a Function),
    Native(NativeFn),
}

pub struct ExecutionEngine {
    units: Vec<(UnitHandle, Module)>,
    next_handle: u64,
    max_call_depth: usize,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        ExecutionEngine::with_max_call_depth(DEFAULT_MAX_CALL_DEPTH)
    }
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_call_depth(max_call_depth: usize) -> Self {
        ExecutionEngine {
            units: Vec::new(),
            next_handle: 0,
            max_call_depth,
        }
    }

    pub fn max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    pub fn add_module(&mut self, module: Module) -> UnitHandle {
        let handle = UnitHandle(self.next_handle);
        self.next_handle += 1;
        debug!("loading unit {:?} ('{}')", handle, module.name);
        self.units.push((handle, module));
        handle
    }

    pub fn remove_module(&mut self, handle: UnitHandle) -> Result<Module, Error> {
        let index = self
            .units
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or_else(|| Error::from(ErrorKind::UnknownUnit))?;
        debug!("unloading unit {:?}", handle);
        Ok(self.units.remove(index).1)
    }

    pub fn is_loaded(&self, handle: UnitHandle) -> bool {
        self.units.iter().any(|(h, _)| *h == handle)
    }

    /// The compiled body for `name`, newest unit first.
    pub fn find_function(&self, name: &str) -> Option<&Function> {
        self.units.iter().rev().find_map(|(_, module)| {
            module
                .functions()
                .find(|f| f.name == name && !f.is_declaration())
        })
    }

    fn resolve(&self, name: &str) -> Option<Callee<'_>> {
        self.find_function(name)
            .map(Callee::Compiled)
            .or_else(|| runtime::lookup(name).map(Callee::Native))
    }

    /// Runs `name` on a thread whose stack fits the configured call depth.
    pub fn run_function(&self, name: &str, args: &[f64]) -> Result<f64, Error> {
        let stack_size = (self.max_call_depth + 1).saturating_mul(STACK_PER_CALL);
        thread::scope(|scope| {
            let handle = thread::Builder::new()
                .name("kaleidoscope-eval".to_owned())
                .stack_size(stack_size)
                .spawn_scoped(scope, || self.call(name, args, 0))
                .map_err(|e| Error::from(ErrorKind::Execution(e.to_string())))?;
            match handle.join() {
                Ok(result) => result,
                Err(_) => Err(Error::from(ErrorKind::Execution(format!(
                    "evaluation of '{}' panicked",
                    name
                )))),
            }
        })
    }

    fn call(&self, name: &str, args: &[f64], depth: usize) -> Result<f64, Error> {
        if depth >= self.max_call_depth {
            return Err(Error::from(ErrorKind::StackOverflow(self.max_call_depth)));
        }
        let (expected, result) = match self.resolve(name) {
            Some(Callee::Compiled(function)) if function.params.len() == args.len() => {
                return Frame::new(self, function, args, depth).run();
            }
            Some(Callee::Compiled(function)) => (function.params.len(), None),
            Some(Callee::Native(native)) => (native.arity(), native.call(args)),
            None => return Err(Error::from(ErrorKind::UnresolvedSymbol(name.to_owned()))),
        };
        result.ok_or_else(|| {
            Error::from(ErrorKind::ArgumentCount {
                name: name.to_owned(),
                expected,
                found: args.len(),
            })
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Number(f64),
    Flag(bool),
    Pointer(usize),
}

/// Activation record of one interpreted call.
struct Frame<'a> {
    engine: &'a ExecutionEngine,
    function: &'a Function,
    args: &'a [f64],
    depth: usize,
    regs: Vec<Option<Slot>>,
    memory: Vec<f64>,
}

impl<'a> Frame<'a> {
    fn new(
        engine: &'a ExecutionEngine,
        function: &'a Function,
        args: &'a [f64],
        depth: usize,
    ) -> Self {
        Frame {
            engine,
            function,
            args,
            depth,
            regs: vec![None; function.insts.len()],
            memory: Vec::new(),
        }
    }

    fn run(mut self) -> Result<f64, Error> {
        let function = self.function;
        let mut block = BlockId(0);
        let mut prev = None;

        'blocks: loop {
            let insts = match function.blocks.get(block.0) {
                Some(b) => &b.insts,
                None => return Err(self.fault("branch to a missing block")),
            };
            for &id in insts {
                let next = match &function.inst(id).kind {
                    InstKind::Ret(value) => return self.number(*value),
                    InstKind::Br(dest) => *dest,
                    InstKind::CondBr {
                        cond,
                        then_block,
                        else_block,
                    } => {
                        if self.flag(*cond)? {
                            *then_block
                        } else {
                            *else_block
                        }
                    }
                    InstKind::Phi(incoming) => {
                        let value = incoming
                            .iter()
                            .find(|(_, from)| Some(*from) == prev)
                            .map(|(value, _)| *value)
                            .ok_or_else(|| self.fault("phi has no entry for the predecessor"))?;
                        let number = self.number(value)?;
                        self.set(id, Slot::Number(number));
                        continue;
                    }
                    kind => {
                        let slot = self.step(kind)?;
                        if let Some(slot) = slot {
                            self.set(id, slot);
                        }
                        continue;
                    }
                };
                prev = Some(block);
                block = next;
                continue 'blocks;
            }
            return Err(self.fault("block fell through without a terminator"));
        }
    }

    fn step(&mut self, kind: &InstKind) -> Result<Option<Slot>, Error> {
        let slot = match kind {
            InstKind::Alloca => {
                self.memory.push(0.0);
                Slot::Pointer(self.memory.len() - 1)
            }
            InstKind::Load(slot) => {
                let address = self.pointer(*slot)?;
                Slot::Number(self.memory[address])
            }
            InstKind::Store { slot, value } => {
                let address = self.pointer(*slot)?;
                let value = self.number(*value)?;
                self.memory[address] = value;
                return Ok(None);
            }
            InstKind::Float { op, lhs, rhs } => {
                Slot::Number(op.apply(self.number(*lhs)?, self.number(*rhs)?))
            }
            InstKind::Compare {
                predicate,
                lhs,
                rhs,
            } => Slot::Flag(predicate.apply(self.number(*lhs)?, self.number(*rhs)?)),
            InstKind::BoolToNumber(flag) => {
                Slot::Number(if self.flag(*flag)? { 1.0 } else { 0.0 })
            }
            InstKind::Call { callee, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.number(*arg))
                    .collect::<Result<Vec<_>, _>>()?;
                Slot::Number(self.engine.call(callee, &args, self.depth + 1)?)
            }
            InstKind::Phi(_) | InstKind::Br(_) | InstKind::CondBr { .. } | InstKind::Ret(_) => {
                return Err(self.fault("control flow handled outside of step"))
            }
        };
        Ok(Some(slot))
    }

    fn set(&mut self, id: InstId, slot: Slot) {
        self.regs[id.0] = Some(slot);
    }

    fn read(&self, value: Value) -> Result<Slot, Error> {
        match value {
            Value::Const(n) => Ok(Slot::Number(n)),
            Value::Param(i) => self
                .args
                .get(i)
                .map(|n| Slot::Number(*n))
                .ok_or_else(|| self.fault("missing parameter")),
            Value::Inst(id) => self
                .regs
                .get(id.0)
                .cloned()
                .flatten()
                .ok_or_else(|| self.fault("use of a value before its definition")),
        }
    }

    fn number(&self, value: Value) -> Result<f64, Error> {
        match self.read(value)? {
            Slot::Number(n) => Ok(n),
            _ => Err(self.fault("expected a double")),
        }
    }

    fn flag(&self, value: Value) -> Result<bool, Error> {
        match self.read(value)? {
            Slot::Flag(b) => Ok(b),
            _ => Err(self.fault("expected an i1")),
        }
    }

    fn pointer(&self, value: Value) -> Result<usize, Error> {
        match self.read(value)? {
            Slot::Pointer(p) if p < self.memory.len() => Ok(p),
            _ => Err(self.fault("expected a stack slot")),
        }
    }

    fn fault(&self, reason: &str) -> Error {
        Error::from(ErrorKind::Execution(format!(
            "{} in '{}'",
            reason, self.function.name
        )))
    }
}

#[cfg(test)]
mod test {
    use super::super::ir::Function;
    use super::super::{FloatOp, FloatPredicate};
    use super::*;

    fn params(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn unit(functions: Vec<Function>) -> Module {
        let mut module = Module::new("test".to_owned());
        for f in functions {
            module.add(f);
        }
        module
    }

    // def twice(x) x + x
    fn twice() -> Function {
        let mut f = Function::new("twice", &params(&["x"]));
        let entry = f.append_block("entry");
        let sum = f.insert(
            entry,
            InstKind::Float {
                op: FloatOp::Add,
                lhs: Value::Param(0),
                rhs: Value::Param(0),
            },
            "addtmp",
            false,
        );
        f.insert(entry, InstKind::Ret(Value::Inst(sum)), "", false);
        f
    }

    // def anon() callee(21)
    fn calls(name: &str, callee: &str, args: Vec<Value>) -> Function {
        let mut f = Function::new(name, &[]);
        let entry = f.append_block("entry");
        let call = f.insert(
            entry,
            InstKind::Call {
                callee: callee.to_owned(),
                args,
            },
            "calltmp",
            false,
        );
        f.insert(entry, InstKind::Ret(Value::Inst(call)), "", false);
        f
    }

    #[test]
    fn test_call_across_units() {
        let mut engine = ExecutionEngine::new();
        engine.add_module(unit(vec![twice()]));
        let anon = engine.add_module(unit(vec![calls(
            "anon",
            "twice",
            vec![Value::Const(21.0)],
        )]));

        assert_eq!(engine.run_function("anon", &[]).unwrap(), 42.0);

        engine.remove_module(anon).unwrap();
        assert!(!engine.is_loaded(anon));
        assert_eq!(
            engine.run_function("anon", &[]).unwrap_err().kind(),
            &ErrorKind::UnresolvedSymbol("anon".to_owned())
        );
        assert_eq!(
            engine.remove_module(anon).unwrap_err().kind(),
            &ErrorKind::UnknownUnit
        );
    }

    #[test]
    fn test_newest_definition_wins() {
        let mut engine = ExecutionEngine::new();
        engine.add_module(unit(vec![twice()]));
        let mut shadow = twice();
        shadow.insts[0].kind = InstKind::Float {
            op: FloatOp::Mul,
            lhs: Value::Param(0),
            rhs: Value::Param(0),
        };
        let newer = engine.add_module(unit(vec![shadow]));
        assert_eq!(engine.run_function("twice", &[5.0]).unwrap(), 25.0);

        engine.remove_module(newer).unwrap();
        assert_eq!(engine.run_function("twice", &[5.0]).unwrap(), 10.0);
    }

    #[test]
    fn test_declarations_do_not_resolve() {
        let mut engine = ExecutionEngine::new();
        engine.add_module(unit(vec![Function::new("twice", &params(&["x"]))]));
        assert!(engine.find_function("twice").is_none());
        assert!(engine.run_function("twice", &[1.0]).is_err());
    }

    #[test]
    fn test_natives_and_arity() {
        let mut engine = ExecutionEngine::new();
        engine.add_module(unit(vec![twice()]));
        assert_eq!(engine.run_function("sqrt", &[9.0]).unwrap(), 3.0);
        assert_eq!(
            engine.run_function("twice", &[1.0, 2.0]).unwrap_err().kind(),
            &ErrorKind::ArgumentCount {
                name: "twice".to_owned(),
                expected: 1,
                found: 2,
            }
        );
    }

    #[test]
    fn test_loop_with_memory_and_phi() {
        // sum = 0; i = 0; do { sum = sum + i; i = i + 1 } while i < n; ret sum
        let mut f = Function::new("sum", &params(&["n"]));
        let entry = f.append_block("entry");
        let body = f.append_block("loop");
        let exit = f.append_block("afterloop");

        let sum = f.insert(entry, InstKind::Alloca, "sum", false);
        let i = f.insert(entry, InstKind::Alloca, "i", false);
        f.insert(
            entry,
            InstKind::Store {
                slot: Value::Inst(i),
                value: Value::Const(0.0),
            },
            "",
            false,
        );
        f.insert(entry, InstKind::Br(body), "", false);

        let cur_sum = f.insert(body, InstKind::Load(Value::Inst(sum)), "s", false);
        let cur_i = f.insert(body, InstKind::Load(Value::Inst(i)), "i", false);
        let new_sum = f.insert(
            body,
            InstKind::Float {
                op: FloatOp::Add,
                lhs: Value::Inst(cur_sum),
                rhs: Value::Inst(cur_i),
            },
            "s",
            false,
        );
        f.insert(
            body,
            InstKind::Store {
                slot: Value::Inst(sum),
                value: Value::Inst(new_sum),
            },
            "",
            false,
        );
        let next_i = f.insert(
            body,
            InstKind::Float {
                op: FloatOp::Add,
                lhs: Value::Inst(cur_i),
                rhs: Value::Const(1.0),
            },
            "nextvar",
            false,
        );
        f.insert(
            body,
            InstKind::Store {
                slot: Value::Inst(i),
                value: Value::Inst(next_i),
            },
            "",
            false,
        );
        let cond = f.insert(
            body,
            InstKind::Compare {
                predicate: FloatPredicate::Ult,
                lhs: Value::Inst(next_i),
                rhs: Value::Param(0),
            },
            "loopcond",
            false,
        );
        f.insert(
            body,
            InstKind::CondBr {
                cond: Value::Inst(cond),
                then_block: body,
                else_block: exit,
            },
            "",
            false,
        );
        let result = f.insert(exit, InstKind::Load(Value::Inst(sum)), "result", false);
        f.insert(exit, InstKind::Ret(Value::Inst(result)), "", false);
        assert_eq!(f.verify(), Ok(()));

        let mut engine = ExecutionEngine::new();
        engine.add_module(unit(vec![f]));
        assert_eq!(engine.run_function("sum", &[5.0]).unwrap(), 10.0);
    }

    #[test]
    fn test_unbounded_recursion() {
        let mut engine = ExecutionEngine::new();
        engine.add_module(unit(vec![calls("forever", "forever", vec![])]));
        assert_eq!(
            engine.run_function("forever", &[]).unwrap_err().kind(),
            &ErrorKind::StackOverflow(DEFAULT_MAX_CALL_DEPTH)
        );

        let mut shallow = ExecutionEngine::with_max_call_depth(8);
        shallow.add_module(unit(vec![calls("forever", "forever", vec![])]));
        assert_eq!(
            shallow.run_function("forever", &[]).unwrap_err().kind(),
            &ErrorKind::StackOverflow(8)
        );
    }
}
