//! The `Operators` facade: every arithmetic, boolean, and bitwise
//! combinator the semantic handlers use, implemented exactly once.
//!
//! Each operation evaluates natively when its inputs are concrete and
//! lifts to a z3 expression when any input is symbolic, so one handler
//! body serves both execution modes. Symbolic results are simplified
//! and folded back to concrete values when they reduce to constants,
//! which keeps a rebind-and-retry cycle from reading back an expression
//! it just pinned.

use z3::ast::{Ast, Bool, BV};
use z3::Context;

use super::concrete_var::mask_u64;
use super::{ConcreteVar, SymbolicVar, Value};

#[derive(Clone, Copy, Debug)]
pub struct Operators<'ctx> {
    pub ctx: &'ctx Context,
}

impl<'ctx> Operators<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Operators { ctx }
    }

    // ---- lifting and folding -------------------------------------------

    /// Lifts any value to a bitvector of its own width.
    pub fn to_bv(&self, v: &Value<'ctx>) -> BV<'ctx> {
        match v {
            Value::Concrete(var, size) => self.bv_from_concrete(var, *size),
            Value::Symbolic(sym) => sym.to_bv(self.ctx),
        }
    }

    /// Lifts any value to a boolean (`v != 0`).
    pub fn to_bool(&self, v: &Value<'ctx>) -> Bool<'ctx> {
        match v {
            Value::Concrete(var, _) => Bool::from_bool(self.ctx, var.to_bool()),
            Value::Symbolic(sym) => sym.to_bool(self.ctx),
        }
    }

    /// Wraps a symbolic bitvector result, folding it back to a concrete
    /// value when simplification reduces it to a constant.
    fn sym(&self, bv: BV<'ctx>) -> Value<'ctx> {
        let simplified = bv.simplify();
        if simplified.get_size() <= 64 {
            if let Some(value) = simplified.as_u64() {
                return Value::from_u64(value, simplified.get_size());
            }
        }
        Value::Symbolic(SymbolicVar::Int(simplified))
    }

    /// Boolean counterpart of [`Operators::sym`].
    fn sym_bool(&self, b: Bool<'ctx>) -> Value<'ctx> {
        let simplified = b.simplify();
        if let Some(value) = simplified.as_bool() {
            return Value::from_bool(value);
        }
        Value::Symbolic(SymbolicVar::Bool(simplified))
    }

    fn bv_from_concrete(&self, var: &ConcreteVar, size: u32) -> BV<'ctx> {
        if size <= 64 {
            return BV::from_u64(self.ctx, var.to_u64(), size);
        }
        let limbs = var.limbs(size);
        let top_bits = if size % 64 == 0 { 64 } else { size % 64 };
        let mut bv: Option<BV<'ctx>> = None;
        for (i, limb) in limbs.iter().enumerate().rev() {
            let width = if i == limbs.len() - 1 { top_bits } else { 64 };
            let limb_bv = BV::from_u64(self.ctx, mask_u64(*limb, width), width);
            bv = Some(match bv {
                None => limb_bv,
                Some(acc) => acc.concat(&limb_bv),
            });
        }
        bv.expect("concrete value has at least one limb")
    }

    // ---- arithmetic ----------------------------------------------------

    pub fn add(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        debug_assert_eq!(a.size(), b.size());
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) => Value::from_u128(x.wrapping_add(y), a.size()),
            _ => self.sym(self.to_bv(a).bvadd(&self.to_bv(b))),
        }
    }

    pub fn sub(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        debug_assert_eq!(a.size(), b.size());
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) => Value::from_u128(x.wrapping_sub(y), a.size()),
            _ => self.sym(self.to_bv(a).bvsub(&self.to_bv(b))),
        }
    }

    /// Low-`size` multiplication.
    pub fn mul(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        debug_assert_eq!(a.size(), b.size());
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) => Value::from_u128(x.wrapping_mul(y), a.size()),
            _ => self.sym(self.to_bv(a).bvmul(&self.to_bv(b))),
        }
    }

    pub fn neg(&self, a: &Value<'ctx>) -> Value<'ctx> {
        match a.as_concrete_u128() {
            Some(x) => Value::from_u128(x.wrapping_neg(), a.size()),
            None => self.sym(self.to_bv(a).bvneg()),
        }
    }

    /// Unsigned division; widths up to 128 bits on the concrete path.
    /// Division by zero never reaches here (the handlers fault first).
    pub fn udiv(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) if y != 0 => Value::from_u128(x / y, a.size()),
            _ => self.sym(self.to_bv(a).bvudiv(&self.to_bv(b))),
        }
    }

    pub fn urem(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) if y != 0 => Value::from_u128(x % y, a.size()),
            _ => self.sym(self.to_bv(a).bvurem(&self.to_bv(b))),
        }
    }

    pub fn sdiv(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        let size = a.size();
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) if y != 0 => {
                let sx = sign_extend_128(x, size);
                let sy = sign_extend_128(y, size);
                Value::from_u128(sx.wrapping_div(sy) as u128, size)
            }
            _ => self.sym(self.to_bv(a).bvsdiv(&self.to_bv(b))),
        }
    }

    pub fn srem(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        let size = a.size();
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) if y != 0 => {
                let sx = sign_extend_128(x, size);
                let sy = sign_extend_128(y, size);
                Value::from_u128(sx.wrapping_rem(sy) as u128, size)
            }
            _ => self.sym(self.to_bv(a).bvsrem(&self.to_bv(b))),
        }
    }

    // ---- bitwise -------------------------------------------------------

    pub fn and(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        self.bitwise(a, b, |x, y| x & y, |x, y| x.bvand(y))
    }

    pub fn or(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        self.bitwise(a, b, |x, y| x | y, |x, y| x.bvor(y))
    }

    pub fn xor(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        self.bitwise(a, b, |x, y| x ^ y, |x, y| x.bvxor(y))
    }

    pub fn not(&self, a: &Value<'ctx>) -> Value<'ctx> {
        let size = a.size();
        match a {
            Value::Concrete(var, _) => {
                let limbs: Vec<u64> = var.limbs(size).iter().map(|l| !l).collect();
                concrete_from_limbs(limbs, size)
            }
            Value::Symbolic(_) => self.sym(self.to_bv(a).bvnot()),
        }
    }

    /// Limb-wise concrete fast path shared by the bitwise operations, so
    /// vector-width values stay concrete in a concrete run.
    fn bitwise(
        &self,
        a: &Value<'ctx>,
        b: &Value<'ctx>,
        f: impl Fn(u64, u64) -> u64,
        g: impl Fn(&BV<'ctx>, &BV<'ctx>) -> BV<'ctx>,
    ) -> Value<'ctx> {
        debug_assert_eq!(a.size(), b.size());
        let size = a.size();
        match (a, b) {
            (Value::Concrete(x, _), Value::Concrete(y, _)) => {
                let limbs: Vec<u64> = x
                    .limbs(size)
                    .iter()
                    .zip(y.limbs(size).iter())
                    .map(|(l, r)| f(*l, *r))
                    .collect();
                concrete_from_limbs(limbs, size)
            }
            _ => self.sym(g(&self.to_bv(a), &self.to_bv(b))),
        }
    }

    // ---- shifts (concrete amounts; handlers concretize counts) ---------

    pub fn shl(&self, a: &Value<'ctx>, amount: u32) -> Value<'ctx> {
        let size = a.size();
        match a.as_concrete_u64() {
            Some(x) => {
                let shifted = if amount >= size { 0 } else { x << amount };
                Value::from_u64(shifted, size)
            }
            None => self.sym(
                self.to_bv(a)
                    .bvshl(&BV::from_u64(self.ctx, amount as u64, size)),
            ),
        }
    }

    pub fn lshr(&self, a: &Value<'ctx>, amount: u32) -> Value<'ctx> {
        let size = a.size();
        match a.as_concrete_u64() {
            Some(x) => {
                let shifted = if amount >= size { 0 } else { x >> amount };
                Value::from_u64(shifted, size)
            }
            None => self.sym(
                self.to_bv(a)
                    .bvlshr(&BV::from_u64(self.ctx, amount as u64, size)),
            ),
        }
    }

    pub fn ashr(&self, a: &Value<'ctx>, amount: u32) -> Value<'ctx> {
        let size = a.size();
        match a.as_concrete_u64() {
            Some(x) => {
                let sx = ((x << (64 - size)) as i64) >> (64 - size);
                let shifted = if amount >= size {
                    if sx < 0 {
                        u64::MAX
                    } else {
                        0
                    }
                } else {
                    (sx >> amount) as u64
                };
                Value::from_u64(shifted, size)
            }
            None => self.sym(
                self.to_bv(a)
                    .bvashr(&BV::from_u64(self.ctx, amount as u64, size)),
            ),
        }
    }

    // ---- comparisons ---------------------------------------------------

    pub fn eq(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        debug_assert_eq!(a.size(), b.size());
        let size = a.size();
        match (a, b) {
            (Value::Concrete(x, _), Value::Concrete(y, _)) => {
                Value::from_bool(x.limbs(size) == y.limbs(size))
            }
            _ => self.sym_bool(self.to_bv(a)._eq(&self.to_bv(b))),
        }
    }

    pub fn ne(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        self.not_bool(&self.eq(a, b))
    }

    pub fn ult(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) => Value::from_bool(x < y),
            _ => self.sym_bool(self.to_bv(a).bvult(&self.to_bv(b))),
        }
    }

    pub fn ule(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) => Value::from_bool(x <= y),
            _ => self.sym_bool(self.to_bv(a).bvule(&self.to_bv(b))),
        }
    }

    pub fn slt(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        let size = a.size();
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) => {
                Value::from_bool(sign_extend_128(x, size) < sign_extend_128(y, size))
            }
            _ => self.sym_bool(self.to_bv(a).bvslt(&self.to_bv(b))),
        }
    }

    pub fn sle(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        let size = a.size();
        match (a.as_concrete_u128(), b.as_concrete_u128()) {
            (Some(x), Some(y)) => {
                Value::from_bool(sign_extend_128(x, size) <= sign_extend_128(y, size))
            }
            _ => self.sym_bool(self.to_bv(a).bvsle(&self.to_bv(b))),
        }
    }

    pub fn is_zero(&self, a: &Value<'ctx>) -> Value<'ctx> {
        match a {
            Value::Concrete(var, _) => Value::from_bool(!var.to_bool()),
            Value::Symbolic(_) => {
                let bv = self.to_bv(a);
                let zero = BV::from_u64(self.ctx, 0, bv.get_size());
                self.sym_bool(bv._eq(&zero))
            }
        }
    }

    // ---- boolean combinators (flag algebra) ----------------------------

    pub fn and_bool(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        match (a.as_concrete_bool(), b.as_concrete_bool()) {
            (Some(x), Some(y)) => Value::from_bool(x && y),
            _ => self.sym_bool(Bool::and(self.ctx, &[&self.to_bool(a), &self.to_bool(b)])),
        }
    }

    pub fn or_bool(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        match (a.as_concrete_bool(), b.as_concrete_bool()) {
            (Some(x), Some(y)) => Value::from_bool(x || y),
            _ => self.sym_bool(Bool::or(self.ctx, &[&self.to_bool(a), &self.to_bool(b)])),
        }
    }

    pub fn xor_bool(&self, a: &Value<'ctx>, b: &Value<'ctx>) -> Value<'ctx> {
        match (a.as_concrete_bool(), b.as_concrete_bool()) {
            (Some(x), Some(y)) => Value::from_bool(x ^ y),
            _ => self.sym_bool(self.to_bool(a).xor(&self.to_bool(b))),
        }
    }

    pub fn not_bool(&self, a: &Value<'ctx>) -> Value<'ctx> {
        match a.as_concrete_bool() {
            Some(x) => Value::from_bool(!x),
            None => self.sym_bool(self.to_bool(a).not()),
        }
    }

    /// If-then-else over values of equal width. A concrete condition
    /// selects eagerly; a symbolic one produces a z3 ite expression.
    pub fn ite(&self, cond: &Value<'ctx>, then: &Value<'ctx>, other: &Value<'ctx>) -> Value<'ctx> {
        debug_assert_eq!(then.size(), other.size());
        match cond.as_concrete_bool() {
            Some(true) => then.clone(),
            Some(false) => other.clone(),
            None => self.sym(self.to_bool(cond).ite(&self.to_bv(then), &self.to_bv(other))),
        }
    }

    // ---- structure: extend, extract, concatenate -----------------------

    pub fn zext(&self, a: &Value<'ctx>, new_size: u32) -> Value<'ctx> {
        let size = a.size();
        debug_assert!(new_size >= size);
        if new_size == size {
            return a.clone();
        }
        match a {
            Value::Concrete(var, _) => {
                let mut limbs = var.limbs(size);
                limbs.resize(((new_size + 63) / 64) as usize, 0);
                concrete_from_limbs(limbs, new_size)
            }
            Value::Symbolic(_) => self.sym(self.to_bv(a).zero_ext(new_size - size)),
        }
    }

    pub fn sext(&self, a: &Value<'ctx>, new_size: u32) -> Value<'ctx> {
        let size = a.size();
        debug_assert!(new_size >= size);
        if new_size == size {
            return a.clone();
        }
        match a.as_concrete_u128() {
            Some(x) if new_size <= 128 => {
                Value::from_u128(sign_extend_128(x, size) as u128, new_size)
            }
            _ => self.sym(self.to_bv(a).sign_ext(new_size - size)),
        }
    }

    /// Extracts bits `high..=low` (inclusive, little-endian numbering).
    pub fn extract(&self, a: &Value<'ctx>, high: u32, low: u32) -> Value<'ctx> {
        debug_assert!(high >= low && high < a.size());
        let width = high - low + 1;
        match a {
            Value::Concrete(var, size) => {
                Value::Concrete(var.extract_bits(low, width, *size), width)
            }
            Value::Symbolic(sym) => self.sym(sym.to_bv(self.ctx).extract(high, low)),
        }
    }

    /// `high:low` concatenation; the first argument lands in the upper bits.
    pub fn concat(&self, high: &Value<'ctx>, low: &Value<'ctx>) -> Value<'ctx> {
        let new_size = high.size() + low.size();
        match (high, low) {
            (Value::Concrete(_, _), Value::Concrete(_, _)) => {
                let shifted = self.shl_wide(&self.zext(high, new_size), low.size());
                let low_ext = self.zext(low, new_size);
                self.or(&shifted, &low_ext)
            }
            _ => self.sym(self.to_bv(high).concat(&self.to_bv(low))),
        }
    }

    /// Concrete-capable wide left shift, used only by `concat`.
    fn shl_wide(&self, a: &Value<'ctx>, amount: u32) -> Value<'ctx> {
        let size = a.size();
        match a {
            Value::Concrete(var, _) => {
                let limbs = var.limbs(size);
                let count = limbs.len();
                let limb_shift = (amount / 64) as usize;
                let bit_shift = amount % 64;
                let mut out = vec![0u64; count];
                for i in (0..count).rev() {
                    if i >= limb_shift {
                        out[i] = limbs[i - limb_shift] << bit_shift;
                        if bit_shift != 0 && i > limb_shift {
                            out[i] |= limbs[i - limb_shift - 1] >> (64 - bit_shift);
                        }
                    }
                }
                concrete_from_limbs(out, size)
            }
            Value::Symbolic(_) => self.sym(
                self.to_bv(a)
                    .bvshl(&BV::from_u64(self.ctx, amount as u64, size)),
            ),
        }
    }

    /// Truncates or zero-extends to `new_size`.
    pub fn resize(&self, a: &Value<'ctx>, new_size: u32) -> Value<'ctx> {
        let size = a.size();
        if new_size == size {
            a.clone()
        } else if new_size < size {
            self.extract(a, new_size - 1, 0)
        } else {
            self.zext(a, new_size)
        }
    }

    // ---- single-bit helpers --------------------------------------------

    /// Bit `index` of `a`, as a boolean value.
    pub fn bit(&self, a: &Value<'ctx>, index: u32) -> Value<'ctx> {
        debug_assert!(index < a.size());
        match a {
            Value::Concrete(var, size) => {
                Value::from_bool(var.extract_bits(index, 1, *size).to_u64() != 0)
            }
            Value::Symbolic(sym) => {
                let bit = sym.to_bv(self.ctx).extract(index, index);
                self.sym_bool(bit._eq(&BV::from_u64(self.ctx, 1, 1)))
            }
        }
    }

    /// Most significant bit (the sign bit at the value's width).
    pub fn msb(&self, a: &Value<'ctx>) -> Value<'ctx> {
        self.bit(a, a.size() - 1)
    }

    /// Even parity of the low 8 bits, the x86 PF definition.
    pub fn parity_even(&self, a: &Value<'ctx>) -> Value<'ctx> {
        match a.as_concrete_u64() {
            Some(x) => Value::from_bool((x as u8).count_ones() % 2 == 0),
            None => {
                let bv = self.to_bv(a);
                let mut folded = bv.extract(0, 0);
                for i in 1..8 {
                    folded = folded.bvxor(&bv.extract(i, i));
                }
                self.sym_bool(folded._eq(&BV::from_u64(self.ctx, 0, 1)))
            }
        }
    }
}

fn concrete_from_limbs<'ctx>(limbs: Vec<u64>, size: u32) -> Value<'ctx> {
    let mut var = if size <= 64 {
        ConcreteVar::Int(limbs.first().copied().unwrap_or(0))
    } else {
        ConcreteVar::LargeInt(limbs)
    };
    var.mask_to(size);
    Value::Concrete(var, size)
}

/// Reads the low `size` bits of `x` as a signed 128-bit integer.
fn sign_extend_128(x: u128, size: u32) -> i128 {
    if size >= 128 {
        x as i128
    } else {
        ((x << (128 - size)) as i128) >> (128 - size)
    }
}
