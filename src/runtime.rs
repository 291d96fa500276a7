//! Native functions reachable from source through `extern` declarations.

use std::io::{self, Write};

#[derive(Clone, Copy)]
pub enum NativeFn {
    Unary(extern "C" fn(f64) -> f64),
    Binary(extern "C" fn(f64, f64) -> f64),
}

impl NativeFn {
    pub fn arity(self) -> usize {
        match self {
            NativeFn::Unary(_) => 1,
            NativeFn::Binary(_) => 2,
        }
    }

    /// `None` when `args` does not match the arity.
    pub fn call(self, args: &[f64]) -> Option<f64> {
        match (self, args) {
            (NativeFn::Unary(f), [x]) => Some(f(*x)),
            (NativeFn::Binary(f), [x, y]) => Some(f(*x, *y)),
            _ => None,
        }
    }

    /// Entry point for a JIT to bind declarations to.
    pub fn address(self) -> *const () {
        match self {
            NativeFn::Unary(f) => f as *const (),
            NativeFn::Binary(f) => f as *const (),
        }
    }
}

/// Writes the byte `x` to stderr.
pub extern "C" fn putchard(x: f64) -> f64 {
    let _ = io::stderr().write_all(&[x as u8]);
    0.0
}

/// Writes `x` and a newline to stderr.
pub extern "C" fn printd(x: f64) -> f64 {
    eprintln!("{}", x);
    0.0
}

macro_rules! unary_math {
    ($($name:ident),*) => {
        $(
            extern "C" fn $name(x: f64) -> f64 {
                x.$name()
            }
        )*
    };
}

unary_math!(sin, cos, tan, atan, sqrt, exp, floor);

extern "C" fn log(x: f64) -> f64 {
    x.ln()
}

extern "C" fn fabs(x: f64) -> f64 {
    x.abs()
}

extern "C" fn pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn fmod(x: f64, y: f64) -> f64 {
    x % y
}

pub fn lookup(name: &str) -> Option<NativeFn> {
    let native = match name {
        "putchard" => NativeFn::Unary(putchard),
        "printd" => NativeFn::Unary(printd),
        "sin" => NativeFn::Unary(sin),
        "cos" => NativeFn::Unary(cos),
        "tan" => NativeFn::Unary(tan),
        "atan" => NativeFn::Unary(atan),
        "sqrt" => NativeFn::Unary(sqrt),
        "exp" => NativeFn::Unary(exp),
        "log" => NativeFn::Unary(log),
        "fabs" => NativeFn::Unary(fabs),
        "floor" => NativeFn::Unary(floor),
        "pow" => NativeFn::Binary(pow),
        "fmod" => NativeFn::Binary(fmod),
        _ => return None,
    };
    Some(native)
}
