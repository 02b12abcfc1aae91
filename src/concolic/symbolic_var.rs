use z3::ast::{Ast, Bool, BV};
use z3::Context;
use z3_sys::Z3_ast;

/// Symbolic payload of a [`crate::concolic::Value`]: a z3 bitvector or a
/// z3 boolean (the latter backs flag cells and comparison results).
#[derive(Clone, Debug, PartialEq)]
pub enum SymbolicVar<'ctx> {
    Int(BV<'ctx>),
    Bool(Bool<'ctx>),
}

impl<'ctx> SymbolicVar<'ctx> {
    /// Fresh unconstrained bitvector variable.
    pub fn fresh(ctx: &'ctx Context, name: &str, size: u32) -> SymbolicVar<'ctx> {
        SymbolicVar::Int(BV::new_const(ctx, name, size))
    }

    /// Converts to a bitvector; a boolean becomes a 1-bit `0`/`1` vector.
    pub fn to_bv(&self, ctx: &'ctx Context) -> BV<'ctx> {
        match self {
            SymbolicVar::Int(bv) => bv.clone(),
            SymbolicVar::Bool(b) => b.ite(&BV::from_u64(ctx, 1, 1), &BV::from_u64(ctx, 0, 1)),
        }
    }

    /// Converts to a boolean; a bitvector becomes `bv != 0`.
    pub fn to_bool(&self, ctx: &'ctx Context) -> Bool<'ctx> {
        match self {
            SymbolicVar::Bool(b) => b.clone(),
            SymbolicVar::Int(bv) => bv._eq(&BV::from_u64(ctx, 0, bv.get_size())).not(),
        }
    }

    pub fn get_size(&self) -> u32 {
        match self {
            SymbolicVar::Int(bv) => bv.get_size(),
            SymbolicVar::Bool(_) => 1,
        }
    }

    pub fn get_z3_ast(&self) -> Z3_ast {
        match self {
            SymbolicVar::Int(bv) => bv.get_z3_ast(),
            SymbolicVar::Bool(b) => b.get_z3_ast(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.get_z3_ast().is_null()
    }
}
