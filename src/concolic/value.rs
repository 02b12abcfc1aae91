use std::fmt;

use super::{ConcreteVar, SymbolicVar};

/// A machine value that is either fully concrete or an unresolved solver
/// expression. Semantic handlers never branch on which; all combinators go
/// through [`crate::concolic::Operators`], which keeps concrete inputs on
/// the native path and lifts to z3 when anything is symbolic.
#[derive(Clone, Debug)]
pub enum Value<'ctx> {
    /// Concrete payload plus its width in bits; the payload is always
    /// masked to that width.
    Concrete(ConcreteVar, u32),
    Symbolic(SymbolicVar<'ctx>),
}

impl<'ctx> Value<'ctx> {
    pub fn from_u64(value: u64, size: u32) -> Self {
        let mut var = ConcreteVar::Int(value);
        var.mask_to(size);
        Value::Concrete(var, size)
    }

    pub fn from_u128(value: u128, size: u32) -> Self {
        Value::Concrete(ConcreteVar::from_u128(value, size), size)
    }

    pub fn from_bool(value: bool) -> Self {
        Value::Concrete(ConcreteVar::Bool(value), 1)
    }

    /// Width in bits.
    pub fn size(&self) -> u32 {
        match self {
            Value::Concrete(_, size) => *size,
            Value::Symbolic(sym) => sym.get_size(),
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Value::Symbolic(_))
    }

    /// The concrete `u64` payload, when there is one and it fits.
    pub fn as_concrete_u64(&self) -> Option<u64> {
        match self {
            Value::Concrete(var, size) if *size <= 64 => Some(var.to_u64()),
            _ => None,
        }
    }

    pub fn as_concrete_u128(&self) -> Option<u128> {
        match self {
            Value::Concrete(var, size) if *size <= 128 => Some(var.to_u128()),
            _ => None,
        }
    }

    /// The concrete truth value, when there is one.
    pub fn as_concrete_bool(&self) -> Option<bool> {
        match self {
            Value::Concrete(var, _) => Some(var.to_bool()),
            Value::Symbolic(_) => None,
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Concrete(var, size) => write!(f, "{}:{}", var, size),
            Value::Symbolic(sym) => write!(f, "<sym:{}>", sym.get_size()),
        }
    }
}
