#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Unary(char, Box<Expr>),
    /// `=` is parsed as an ordinary binary operator; codegen requires its
    /// left operand to be a `Variable`.
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Loop variable, start, end condition, optional step, body.
    For(String, Box<Expr>, Box<Expr>, Option<Box<Expr>>, Box<Expr>),
    Var(Vec<(String, Option<Expr>)>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrototypeKind {
    Function,
    Unary(char),
    Binary { op: char, precedence: i32 },
}

impl PrototypeKind {
    /// Operand count an operator prototype must declare.
    pub fn operands(self) -> Option<usize> {
        match self {
            PrototypeKind::Function => None,
            PrototypeKind::Unary(_) => Some(1),
            PrototypeKind::Binary { .. } => Some(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub name: String,
    pub params: Vec<String>,
    pub kind: PrototypeKind,
}

impl Prototype {
    pub fn new(name: impl Into<String>, params: Vec<String>) -> Self {
        Prototype {
            name: name.into(),
            params,
            kind: PrototypeKind::Function,
        }
    }

    pub fn unary(op: char, param: String) -> Self {
        Prototype {
            name: format!("unary{}", op),
            params: vec![param],
            kind: PrototypeKind::Unary(op),
        }
    }

    pub fn binary(op: char, precedence: i32, lhs: String, rhs: String) -> Self {
        Prototype {
            name: format!("binary{}", op),
            params: vec![lhs, rhs],
            kind: PrototypeKind::Binary { op, precedence },
        }
    }

    /// Operator character and precedence when this declares a binary operator.
    pub fn binary_precedence(&self) -> Option<(char, i32)> {
        match self.kind {
            PrototypeKind::Binary { op, precedence } => Some((op, precedence)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub proto: Prototype,
    pub body: Expr,
}

impl Function {
    pub fn new(proto: Prototype, body: Expr) -> Self {
        Function { proto, body }
    }
}

/// Name given to the function wrapping a top-level expression. Identifiers
/// cannot start with `_`, so source code can never refer to it.
pub const ANON_FUNCTION_NAME: &str = "__anon_expr";
