use super::ast::{Expr, Function, Prototype, ANON_FUNCTION_NAME};
use super::backend::{Backend, FloatOp, FloatPredicate};
use super::error::{Error, ErrorKind};
use super::parser::PrecedenceTable;
use log::debug;
use std::collections::HashMap;

/// Latest prototype seen for every function name, across compilation units.
pub type PrototypeCache = HashMap<String, Prototype>;

type SavedBindings<V> = Vec<(String, Option<V>)>;

/// Lowers AST into the backend's current compilation unit.
///
/// Mutable variables, including parameters, live in stack slots allocated in
/// the entry block; `named_values` maps each visible name to its slot.
pub struct CodeGen<'a, B: Backend> {
    backend: &'a mut B,
    prototypes: &'a mut PrototypeCache,
    precedence: &'a mut PrecedenceTable,
    named_values: HashMap<String, B::Value>,
    function: Option<B::Function>,
}

impl<'a, B: Backend> CodeGen<'a, B> {
    pub fn new(
        backend: &'a mut B,
        prototypes: &'a mut PrototypeCache,
        precedence: &'a mut PrecedenceTable,
    ) -> Self {
        CodeGen {
            backend,
            prototypes,
            precedence,
            named_values: HashMap::new(),
            function: None,
        }
    }

    /// Declares `proto` in the current unit and remembers it for later units.
    pub fn codegen_proto(&mut self, proto: &Prototype) -> Result<B::Function, Error> {
        let function = self.declare(proto)?;
        self.prototypes.insert(proto.name.clone(), proto.clone());
        Ok(function)
    }

    /// Generates a full definition. On failure nothing of it is left behind:
    /// the function is erased from the unit and the prototype cache is
    /// restored.
    pub fn codegen_function(&mut self, func: &Function) -> Result<B::Function, Error> {
        let proto = &func.proto;
        let defined_here = self
            .backend
            .get_function(&proto.name)
            .map_or(false, |f| self.backend.has_body(f));
        if defined_here || self.backend.is_defined(&proto.name) {
            return Err(Error::from(ErrorKind::Redefinition(proto.name.clone())));
        }

        // Anonymous functions are unloaded after one run, so later units
        // must never re-declare them.
        let previous = if proto.name == ANON_FUNCTION_NAME {
            None
        } else {
            Some(self.prototypes.insert(proto.name.clone(), proto.clone()))
        };
        let function = match self.declare(proto) {
            Ok(function) => function,
            Err(e) => {
                self.restore_prototype(&proto.name, previous);
                return Err(e);
            }
        };

        match self.codegen_body(function, func) {
            Ok(()) => {
                if let Some((op, precedence)) = proto.binary_precedence() {
                    debug!("installing binary operator '{}' at {}", op, precedence);
                    self.precedence.insert(op, precedence);
                }
                debug!("generated '{}'", proto.name);
                Ok(function)
            }
            Err(e) => {
                debug!("discarding '{}': {}", proto.name, e);
                self.backend.delete_function(function);
                self.restore_prototype(&proto.name, previous);
                Err(e)
            }
        }
    }

    fn codegen_body(&mut self, function: B::Function, func: &Function) -> Result<(), Error> {
        let entry = self.backend.append_block(function, "entry");
        self.backend.position_at_end(entry);
        self.function = Some(function);

        self.named_values.clear();
        for (index, param) in func.proto.params.iter().enumerate() {
            let slot = self.backend.build_alloca(function, param)?;
            let value = self.backend.param(function, index);
            self.backend.build_store(slot, value)?;
            self.named_values.insert(param.clone(), slot);
        }

        let ret = self.codegen_expr(&func.body)?;
        self.backend.build_ret(ret)?;
        self.backend.verify_function(function)
    }

    pub fn codegen_expr(&mut self, e: &Expr) -> Result<B::Value, Error> {
        match e {
            Expr::Number(n) => Ok(self.backend.const_number(*n)),
            Expr::Variable(name) => {
                let slot = self.lookup(name)?;
                self.backend.build_load(slot, name)
            }
            Expr::Unary(op, operand) => {
                let operand = self.codegen_expr(operand)?;
                let function = self
                    .get_function(&format!("unary{}", op))
                    .ok_or_else(|| Error::from(ErrorKind::InvalidUnaryOperator(*op)))?;
                self.build_call_checked(function, &format!("unary{}", op), &[operand], "unop")
            }
            Expr::Binary('=', lhs, rhs) => self.codegen_assign(lhs, rhs),
            Expr::Binary(op, lhs, rhs) => self.codegen_binary(*op, lhs, rhs),
            Expr::Call(callee, args) => self.codegen_call(callee, args),
            Expr::If(cond, then, otherwise) => self.codegen_if(cond, then, otherwise),
            Expr::For(var, start, end, step, body) => {
                self.codegen_for(var, start, end, step.as_deref(), body)
            }
            Expr::Var(bindings, body) => self.codegen_var(bindings, body),
        }
    }

    fn codegen_assign(&mut self, lhs: &Expr, rhs: &Expr) -> Result<B::Value, Error> {
        let name = match lhs {
            Expr::Variable(name) => name,
            _ => return Err(Error::from(ErrorKind::AssignmentTarget)),
        };
        let value = self.codegen_expr(rhs)?;
        let slot = self.lookup(name)?;
        self.backend.build_store(slot, value)?;
        Ok(value)
    }

    fn codegen_binary(&mut self, op: char, lhs: &Expr, rhs: &Expr) -> Result<B::Value, Error> {
        let l = self.codegen_expr(lhs)?;
        let r = self.codegen_expr(rhs)?;
        match op {
            '+' => self.backend.build_float_op(FloatOp::Add, l, r, "addtmp"),
            '-' => self.backend.build_float_op(FloatOp::Sub, l, r, "subtmp"),
            '*' => self.backend.build_float_op(FloatOp::Mul, l, r, "multmp"),
            '/' => self.backend.build_float_op(FloatOp::Div, l, r, "divtmp"),
            '<' => {
                let cmp = self
                    .backend
                    .build_compare(FloatPredicate::Ult, l, r, "cmptmp")?;
                self.backend.build_bool_to_number(cmp, "booltmp")
            }
            _ => {
                let name = format!("binary{}", op);
                let function = self
                    .get_function(&name)
                    .ok_or_else(|| Error::from(ErrorKind::InvalidBinaryOperator(op)))?;
                self.build_call_checked(function, &name, &[l, r], "binop")
            }
        }
    }

    fn codegen_call(&mut self, callee: &str, args: &[Expr]) -> Result<B::Value, Error> {
        let function = self
            .get_function(callee)
            .ok_or_else(|| Error::from(ErrorKind::UnknownFunction(callee.to_owned())))?;
        self.check_arity(function, callee, args.len())?;

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.codegen_expr(arg)?);
        }
        self.backend.build_call(function, &values, "calltmp")
    }

    fn codegen_if(&mut self, cond: &Expr, then: &Expr, otherwise: &Expr) -> Result<B::Value, Error> {
        let function = self.current_function()?;
        let cond = self.codegen_expr(cond)?;
        let zero = self.backend.const_number(0.0);
        let cond = self
            .backend
            .build_compare(FloatPredicate::One, cond, zero, "ifcond")?;

        let then_bb = self.backend.append_block(function, "then");
        let else_bb = self.backend.append_block(function, "else");
        let merge_bb = self.backend.append_block(function, "ifcont");
        self.backend.build_cond_br(cond, then_bb, else_bb)?;

        // Either branch may end in a different block than it started in.
        self.backend.position_at_end(then_bb);
        let then_val = self.codegen_expr(then)?;
        self.backend.build_br(merge_bb)?;
        let then_end = self.insert_block()?;

        self.backend.position_at_end(else_bb);
        let else_val = self.codegen_expr(otherwise)?;
        self.backend.build_br(merge_bb)?;
        let else_end = self.insert_block()?;

        self.backend.position_at_end(merge_bb);
        self.backend
            .build_phi(&[(then_val, then_end), (else_val, else_end)], "iftmp")
    }

    /// The body always runs once; the end condition is checked before the
    /// loop variable is stepped.
    fn codegen_for(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> Result<B::Value, Error> {
        let function = self.current_function()?;
        let slot = self.backend.build_alloca(function, var)?;
        let start = self.codegen_expr(start)?;
        self.backend.build_store(slot, start)?;

        let loop_bb = self.backend.append_block(function, "loop");
        self.backend.build_br(loop_bb)?;
        self.backend.position_at_end(loop_bb);

        let saved = vec![(var.to_owned(), self.named_values.insert(var.to_owned(), slot))];
        let result = self.codegen_loop(function, var, slot, end, step, body, loop_bb);
        self.restore(saved);
        result?;

        Ok(self.backend.const_number(0.0))
    }

    #[allow(clippy::too_many_arguments)]
    fn codegen_loop(
        &mut self,
        function: B::Function,
        var: &str,
        slot: B::Value,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
        loop_bb: B::Block,
    ) -> Result<(), Error> {
        self.codegen_expr(body)?;
        let step = match step {
            Some(step) => self.codegen_expr(step)?,
            None => self.backend.const_number(1.0),
        };
        let end = self.codegen_expr(end)?;

        let current = self.backend.build_load(slot, var)?;
        let next = self
            .backend
            .build_float_op(FloatOp::Add, current, step, "nextvar")?;
        self.backend.build_store(slot, next)?;

        let zero = self.backend.const_number(0.0);
        let end = self
            .backend
            .build_compare(FloatPredicate::One, end, zero, "loopcond")?;
        let after_bb = self.backend.append_block(function, "afterloop");
        self.backend.build_cond_br(end, loop_bb, after_bb)?;
        self.backend.position_at_end(after_bb);
        Ok(())
    }

    fn codegen_var(
        &mut self,
        bindings: &[(String, Option<Expr>)],
        body: &Expr,
    ) -> Result<B::Value, Error> {
        let function = self.current_function()?;
        let mut saved = Vec::with_capacity(bindings.len());
        let result = self
            .bind_vars(function, bindings, &mut saved)
            .and_then(|()| self.codegen_expr(body));
        self.restore(saved);
        result
    }

    // Each initializer sees the bindings made before it, never its own.
    fn bind_vars(
        &mut self,
        function: B::Function,
        bindings: &[(String, Option<Expr>)],
        saved: &mut SavedBindings<B::Value>,
    ) -> Result<(), Error> {
        for (name, init) in bindings {
            let value = match init {
                Some(init) => self.codegen_expr(init)?,
                None => self.backend.const_number(0.0),
            };
            let slot = self.backend.build_alloca(function, name)?;
            self.backend.build_store(slot, value)?;
            let old = self.named_values.insert(name.clone(), slot);
            saved.push((name.clone(), old));
        }
        Ok(())
    }

    fn restore(&mut self, saved: SavedBindings<B::Value>) {
        for (name, old) in saved.into_iter().rev() {
            match old {
                Some(slot) => {
                    self.named_values.insert(name, slot);
                }
                None => {
                    self.named_values.remove(&name);
                }
            }
        }
    }

    /// Puts back what the cache held before `name` was inserted. `None`
    /// means nothing was inserted.
    fn restore_prototype(&mut self, name: &str, previous: Option<Option<Prototype>>) {
        match previous {
            Some(Some(proto)) => {
                self.prototypes.insert(name.to_owned(), proto);
            }
            Some(None) => {
                self.prototypes.remove(name);
            }
            None => {}
        }
    }

    fn declare(&mut self, proto: &Prototype) -> Result<B::Function, Error> {
        match self.backend.get_function(&proto.name) {
            Some(function) => {
                self.check_prototype(function, proto)?;
                Ok(function)
            }
            None => Ok(self.backend.declare_function(&proto.name, &proto.params)),
        }
    }

    fn check_prototype(&self, function: B::Function, proto: &Prototype) -> Result<(), Error> {
        let expected = self.backend.param_count(function);
        if expected != proto.params.len() {
            return Err(Error::from(ErrorKind::PrototypeMismatch {
                name: proto.name.clone(),
                expected,
                found: proto.params.len(),
            }));
        }
        Ok(())
    }

    /// Finds `name` in the current unit, declaring it from the prototype
    /// cache when only an earlier unit knows it.
    fn get_function(&mut self, name: &str) -> Option<B::Function> {
        if let Some(function) = self.backend.get_function(name) {
            return Some(function);
        }
        let proto = self.prototypes.get(name)?;
        debug!("re-declaring '{}' from the prototype cache", name);
        Some(self.backend.declare_function(&proto.name, &proto.params))
    }

    fn check_arity(&self, function: B::Function, name: &str, found: usize) -> Result<(), Error> {
        let expected = self.backend.param_count(function);
        if expected != found {
            return Err(Error::from(ErrorKind::ArgumentCount {
                name: name.to_owned(),
                expected,
                found,
            }));
        }
        Ok(())
    }

    fn build_call_checked(
        &mut self,
        function: B::Function,
        name: &str,
        args: &[B::Value],
        tmp: &str,
    ) -> Result<B::Value, Error> {
        self.check_arity(function, name, args.len())?;
        self.backend.build_call(function, args, tmp)
    }

    fn lookup(&self, name: &str) -> Result<B::Value, Error> {
        self.named_values
            .get(name)
            .cloned()
            .ok_or_else(|| Error::from(ErrorKind::UnknownVariable(name.to_owned())))
    }

    fn current_function(&self) -> Result<B::Function, Error> {
        self.function
            .ok_or_else(|| Error::from(ErrorKind::NoInsertPoint))
    }

    fn insert_block(&self) -> Result<B::Block, Error> {
        self.backend
            .insert_block()
            .ok_or_else(|| Error::from(ErrorKind::NoInsertPoint))
    }
}
