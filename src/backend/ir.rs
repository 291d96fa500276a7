//! Reference SSA form: one [`Module`] per compilation unit.

use super::{FloatOp, FloatPredicate};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Const(f64),
    Param(usize),
    Inst(InstId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Alloca,
    Load(Value),
    Store {
        slot: Value,
        value: Value,
    },
    Float {
        op: FloatOp,
        lhs: Value,
        rhs: Value,
    },
    Compare {
        predicate: FloatPredicate,
        lhs: Value,
        rhs: Value,
    },
    BoolToNumber(Value),
    Call {
        callee: String,
        args: Vec<Value>,
    },
    Phi(Vec<(Value, BlockId)>),
    Br(BlockId),
    CondBr {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret(Value),
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        match self {
            InstKind::Br(_) | InstKind::CondBr { .. } | InstKind::Ret(_) => true,
            _ => false,
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstKind::Alloca | InstKind::Br(_) => vec![],
            InstKind::Load(v) | InstKind::BoolToNumber(v) | InstKind::Ret(v) => vec![*v],
            InstKind::Store { slot, value } => vec![*slot, *value],
            InstKind::Float { lhs, rhs, .. } | InstKind::Compare { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            InstKind::Call { args, .. } => args.clone(),
            InstKind::Phi(incoming) => incoming.iter().map(|(v, _)| *v).collect(),
            InstKind::CondBr { cond, .. } => vec![*cond],
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br(dest) => vec![*dest],
            InstKind::CondBr {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub name: String,
    pub kind: InstKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
}

/// A function with no blocks is a declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
}

impl Function {
    pub fn new(name: &str, params: &[String]) -> Self {
        Function {
            name: name.to_owned(),
            params: params.to_vec(),
            blocks: Vec::new(),
            insts: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0]
    }

    pub fn append_block(&mut self, name: &str) -> BlockId {
        self.blocks.push(Block {
            name: name.to_owned(),
            insts: Vec::new(),
        });
        BlockId(self.blocks.len() - 1)
    }

    /// Adds an instruction at the end of `block`, or at its start when
    /// `at_start` is set.
    pub fn insert(&mut self, block: BlockId, kind: InstKind, name: &str, at_start: bool) -> InstId {
        let id = InstId(self.insts.len());
        self.insts.push(Inst {
            name: name.to_owned(),
            kind,
        });
        let insts = &mut self.blocks[block.0].insts;
        if at_start {
            insts.insert(0, id);
        } else {
            insts.push(id);
        }
        id
    }

    pub fn terminator(&self, block: BlockId) -> Option<&InstKind> {
        self.blocks[block.0]
            .insts
            .last()
            .map(|id| &self.inst(*id).kind)
            .filter(|kind| kind.is_terminator())
    }

    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for index in 0..self.blocks.len() {
            if let Some(term) = self.terminator(BlockId(index)) {
                for succ in term.successors() {
                    if let Some(list) = preds.get_mut(succ.0) {
                        if !list.contains(&BlockId(index)) {
                            list.push(BlockId(index));
                        }
                    }
                }
            }
        }
        preds
    }

    /// Structural checks: every block ends in exactly one terminator, phis
    /// lead their block and cover exactly its predecessors, and all operands
    /// and branch targets exist.
    pub fn verify(&self) -> Result<(), String> {
        if self.is_declaration() {
            return Err("function has no body".to_owned());
        }
        let preds = self.predecessors();

        for (index, block) in self.blocks.iter().enumerate() {
            let label = self.block_label(BlockId(index));
            let last = match block.insts.last() {
                Some(last) => *last,
                None => return Err(format!("block '{}' is empty", label)),
            };

            let mut in_phis = true;
            for &id in &block.insts {
                let inst = self
                    .insts
                    .get(id.0)
                    .ok_or_else(|| format!("block '{}' names a missing instruction", label))?;

                if inst.kind.is_terminator() != (id == last) {
                    return Err(format!(
                        "block '{}' must end in exactly one terminator",
                        label
                    ));
                }

                match &inst.kind {
                    InstKind::Phi(incoming) => {
                        if !in_phis {
                            return Err(format!("phi '{}' is not at the start of '{}'", inst.name, label));
                        }
                        let covers = incoming.len() == preds[index].len()
                            && preds[index]
                                .iter()
                                .all(|pred| incoming.iter().any(|(_, from)| from == pred));
                        if !covers {
                            return Err(format!(
                                "phi '{}' does not match the predecessors of '{}'",
                                inst.name, label
                            ));
                        }
                    }
                    _ => in_phis = false,
                }

                for operand in inst.kind.operands() {
                    match operand {
                        Value::Inst(op) if op.0 >= self.insts.len() => {
                            return Err(format!("'{}' uses an undefined value", inst.name));
                        }
                        Value::Param(p) if p >= self.params.len() => {
                            return Err(format!("'{}' uses a missing parameter", inst.name));
                        }
                        _ => {}
                    }
                }
                if inst
                    .kind
                    .successors()
                    .iter()
                    .any(|succ| succ.0 >= self.blocks.len())
                {
                    return Err(format!("'{}' branches to a missing block", label));
                }
            }
        }
        Ok(())
    }

    fn block_label(&self, id: BlockId) -> String {
        match id.0 {
            0 => self.blocks[0].name.clone(),
            n => format!("{}{}", self.blocks[n].name, n),
        }
    }

    fn value_label(&self, value: Value) -> String {
        match value {
            Value::Const(n) => format!("{:?}", n),
            Value::Param(p) => format!("%{}", self.params[p]),
            Value::Inst(id) => format!("%{}{}", self.inst(id).name, id.0),
        }
    }

    fn fmt_inst(&self, f: &mut fmt::Formatter<'_>, id: InstId) -> fmt::Result {
        let inst = self.inst(id);
        let dest = format!("%{}{}", inst.name, id.0);
        let v = |value: &Value| self.value_label(*value);
        match &inst.kind {
            InstKind::Alloca => writeln!(f, "  {} = alloca double", dest),
            InstKind::Load(slot) => writeln!(f, "  {} = load double, double* {}", dest, v(slot)),
            InstKind::Store { slot, value } => {
                writeln!(f, "  store double {}, double* {}", v(value), v(slot))
            }
            InstKind::Float { op, lhs, rhs } => {
                let op = match op {
                    FloatOp::Add => "fadd",
                    FloatOp::Sub => "fsub",
                    FloatOp::Mul => "fmul",
                    FloatOp::Div => "fdiv",
                };
                writeln!(f, "  {} = {} double {}, {}", dest, op, v(lhs), v(rhs))
            }
            InstKind::Compare {
                predicate,
                lhs,
                rhs,
            } => {
                let predicate = match predicate {
                    FloatPredicate::Ult => "ult",
                    FloatPredicate::One => "one",
                };
                writeln!(f, "  {} = fcmp {} double {}, {}", dest, predicate, v(lhs), v(rhs))
            }
            InstKind::BoolToNumber(flag) => {
                writeln!(f, "  {} = uitofp i1 {} to double", dest, v(flag))
            }
            InstKind::Call { callee, args } => {
                let args: Vec<_> = args.iter().map(|a| format!("double {}", v(a))).collect();
                writeln!(f, "  {} = call double @{}({})", dest, callee, args.join(", "))
            }
            InstKind::Phi(incoming) => {
                let incoming: Vec<_> = incoming
                    .iter()
                    .map(|(value, block)| format!("[ {}, %{} ]", v(value), self.block_label(*block)))
                    .collect();
                writeln!(f, "  {} = phi double {}", dest, incoming.join(", "))
            }
            InstKind::Br(dest) => writeln!(f, "  br label %{}", self.block_label(*dest)),
            InstKind::CondBr {
                cond,
                then_block,
                else_block,
            } => writeln!(
                f,
                "  br i1 {}, label %{}, label %{}",
                v(cond),
                self.block_label(*then_block),
                self.block_label(*else_block)
            ),
            InstKind::Ret(value) => writeln!(f, "  ret double {}", v(value)),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<_> = self.params.iter().map(|p| format!("double %{}", p)).collect();
        if self.is_declaration() {
            return writeln!(f, "declare double @{}({})", self.name, params.join(", "));
        }

        writeln!(f, "define double @{}({}) {{", self.name, params.join(", "))?;
        for (index, block) in self.blocks.iter().enumerate() {
            writeln!(f, "{}:", self.block_label(BlockId(index)))?;
            for id in &block.insts {
                self.fmt_inst(f, *id)?;
            }
        }
        writeln!(f, "}}")
    }
}

/// Functions are never moved, so a [`FuncId`] stays valid until the function
/// is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    functions: Vec<Option<Function>>,
}

impl Module {
    pub fn new(name: String) -> Self {
        Module {
            name,
            functions: Vec::new(),
        }
    }

    pub fn add(&mut self, function: Function) -> FuncId {
        self.functions.push(Some(function));
        FuncId(self.functions.len() - 1)
    }

    pub fn get(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn find(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.as_ref().map_or(false, |f| f.name == name))
            .map(FuncId)
    }

    pub fn remove(&mut self, id: FuncId) -> Option<Function> {
        self.functions.get_mut(id.0).and_then(Option::take)
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter_map(Option::as_ref)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        for function in self.functions() {
            writeln!(f)?;
            write!(f, "{}", function)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // max(a, b) with a diamond and a phi
    fn max_function() -> Function {
        let mut f = Function::new("max", &params(&["a", "b"]));
        let entry = f.append_block("entry");
        let then = f.append_block("then");
        let other = f.append_block("else");
        let merge = f.append_block("ifcont");

        let cmp = f.insert(
            entry,
            InstKind::Compare {
                predicate: FloatPredicate::Ult,
                lhs: Value::Param(0),
                rhs: Value::Param(1),
            },
            "cmptmp",
            false,
        );
        f.insert(
            entry,
            InstKind::CondBr {
                cond: Value::Inst(cmp),
                then_block: then,
                else_block: other,
            },
            "",
            false,
        );
        f.insert(then, InstKind::Br(merge), "", false);
        f.insert(other, InstKind::Br(merge), "", false);
        let phi = f.insert(
            merge,
            InstKind::Phi(vec![(Value::Param(1), then), (Value::Param(0), other)]),
            "iftmp",
            false,
        );
        f.insert(merge, InstKind::Ret(Value::Inst(phi)), "", false);
        f
    }

    #[test]
    fn test_verify_ok() {
        assert_eq!(max_function().verify(), Ok(()));
    }

    #[test]
    fn test_verify_declaration() {
        let f = Function::new("sin", &params(&["x"]));
        assert!(f.is_declaration());
        assert!(f.verify().is_err());
    }

    #[test]
    fn test_verify_missing_terminator() {
        let mut f = Function::new("f", &[]);
        let entry = f.append_block("entry");
        f.insert(entry, InstKind::Alloca, "x", false);
        assert!(f.verify().unwrap_err().contains("terminator"));
    }

    #[test]
    fn test_verify_phi_predecessors() {
        let mut f = max_function();
        let merge = BlockId(3);
        let phi = f.blocks[merge.0].insts[0];
        f.insts[phi.0].kind = InstKind::Phi(vec![(Value::Param(1), BlockId(1))]);
        assert!(f.verify().unwrap_err().contains("predecessors"));
    }

    #[test]
    fn test_alloca_at_start() {
        let mut f = Function::new("f", &[]);
        let entry = f.append_block("entry");
        f.insert(entry, InstKind::Ret(Value::Const(0.0)), "", false);
        let slot = f.insert(entry, InstKind::Alloca, "x", true);
        assert_eq!(f.blocks[0].insts[0], slot);
        assert_eq!(f.verify(), Ok(()));
    }

    #[test]
    fn test_print() {
        let text = max_function().to_string();
        assert!(text.starts_with("define double @max(double %a, double %b) {"));
        assert!(text.contains("%cmptmp0 = fcmp ult double %a, %b"));
        assert!(text.contains("%iftmp4 = phi double [ %b, %then1 ], [ %a, %else2 ]"));
        assert!(text.contains("ret double %iftmp4"));

        let decl = Function::new("sin", &params(&["x"])).to_string();
        assert_eq!(decl, "declare double @sin(double %x)\n");
    }

    #[test]
    fn test_module_remove_keeps_ids() {
        let mut module = Module::new("unit".to_owned());
        let a = module.add(Function::new("a", &[]));
        let b = module.add(Function::new("b", &[]));
        assert_eq!(module.find("b"), Some(b));
        assert!(module.remove(a).is_some());
        assert!(module.get(a).is_none());
        assert_eq!(module.find("a"), None);
        assert_eq!(module.get(b).map(|f| f.name.as_str()), Some("b"));
        assert_eq!(module.functions().count(), 1);
    }
}
