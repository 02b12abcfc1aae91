//! Status-flag identifiers and the condition-code predicate table.
//!
//! The table in [`Cond::eval`] is the single source of truth for Jcc,
//! CMOVcc, and SETcc; the three families differ only in what they do with
//! the predicate, never in how it is computed.

use crate::concolic::{Operators, Value};

/// The architectural status flags this core models. Each one is an
/// independent boolean register cell, set explicitly by every instruction
/// that defines it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flag {
    CF,
    PF,
    AF,
    ZF,
    SF,
    DF,
    OF,
}

pub const FLAG_COUNT: usize = 7;

impl Flag {
    pub fn index(self) -> usize {
        match self {
            Flag::CF => 0,
            Flag::PF => 1,
            Flag::AF => 2,
            Flag::ZF => 3,
            Flag::SF => 4,
            Flag::DF => 5,
            Flag::OF => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Flag::CF => "CF",
            Flag::PF => "PF",
            Flag::AF => "AF",
            Flag::ZF => "ZF",
            Flag::SF => "SF",
            Flag::DF => "DF",
            Flag::OF => "OF",
        }
    }

    pub fn from_name(name: &str) -> Option<Flag> {
        match name {
            "CF" => Some(Flag::CF),
            "PF" => Some(Flag::PF),
            "AF" => Some(Flag::AF),
            "ZF" => Some(Flag::ZF),
            "SF" => Some(Flag::SF),
            "DF" => Some(Flag::DF),
            "OF" => Some(Flag::OF),
            _ => None,
        }
    }
}

/// x86 condition codes, in the encoding order of the Jcc/SETcc/CMOVcc
/// opcode tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    /// The flags the predicate reads, in evaluation order. Callers that
    /// must decide the predicate concretely (Jcc) concretize these one by
    /// one.
    pub fn flags(self) -> &'static [Flag] {
        match self {
            Cond::O | Cond::No => &[Flag::OF],
            Cond::B | Cond::Ae => &[Flag::CF],
            Cond::E | Cond::Ne => &[Flag::ZF],
            Cond::Be | Cond::A => &[Flag::CF, Flag::ZF],
            Cond::S | Cond::Ns => &[Flag::SF],
            Cond::P | Cond::Np => &[Flag::PF],
            Cond::L | Cond::Ge => &[Flag::SF, Flag::OF],
            Cond::Le | Cond::G => &[Flag::ZF, Flag::SF, Flag::OF],
        }
    }

    /// Evaluates the documented flag combination through a flag getter.
    /// The getter decides the execution mode: a raising getter yields a
    /// concrete decision (Jcc), a plain one keeps the predicate symbolic
    /// (CMOVcc/SETcc).
    pub fn eval<'ctx, E>(
        self,
        ops: &Operators<'ctx>,
        get: &mut impl FnMut(Flag) -> Result<Value<'ctx>, E>,
    ) -> Result<Value<'ctx>, E> {
        let value = match self {
            Cond::O => get(Flag::OF)?,
            Cond::No => ops.not_bool(&get(Flag::OF)?),
            Cond::B => get(Flag::CF)?,
            Cond::Ae => ops.not_bool(&get(Flag::CF)?),
            Cond::E => get(Flag::ZF)?,
            Cond::Ne => ops.not_bool(&get(Flag::ZF)?),
            Cond::Be => ops.or_bool(&get(Flag::CF)?, &get(Flag::ZF)?),
            Cond::A => {
                let be = ops.or_bool(&get(Flag::CF)?, &get(Flag::ZF)?);
                ops.not_bool(&be)
            }
            Cond::S => get(Flag::SF)?,
            Cond::Ns => ops.not_bool(&get(Flag::SF)?),
            Cond::P => get(Flag::PF)?,
            Cond::Np => ops.not_bool(&get(Flag::PF)?),
            Cond::L => ops.xor_bool(&get(Flag::SF)?, &get(Flag::OF)?),
            Cond::Ge => {
                let l = ops.xor_bool(&get(Flag::SF)?, &get(Flag::OF)?);
                ops.not_bool(&l)
            }
            Cond::Le => {
                let l = ops.xor_bool(&get(Flag::SF)?, &get(Flag::OF)?);
                ops.or_bool(&get(Flag::ZF)?, &l)
            }
            Cond::G => {
                let l = ops.xor_bool(&get(Flag::SF)?, &get(Flag::OF)?);
                let le = ops.or_bool(&get(Flag::ZF)?, &l);
                ops.not_bool(&le)
            }
        };
        Ok(value)
    }
}
