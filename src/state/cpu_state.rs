//! Canonical register storage and the sub-register alias table.
//!
//! Backing cells exist only for the widest form of each register family:
//! sixteen 64-bit general-purpose cells, RIP, one boolean cell per status
//! flag, and sixteen 256-bit vector cells. Every architectural name is a
//! masked view over one of those cells; all reads and writes funnel
//! through a single extract/deposit pair. The one architectural
//! exception — writing a 32-bit general-purpose form zero-extends into
//! the full 64-bit cell — is special-cased here and nowhere else.

use std::collections::HashMap;
use std::fmt;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use z3::Context;

use super::flags::{Flag, FLAG_COUNT};
use crate::concolic::{Operators, Value};

/// Identifies one canonical backing cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cell {
    Gpr(usize),
    Rip,
    Flag(Flag),
    Vector(usize),
}

/// One row of the alias table: an architectural name resolved to a
/// canonical cell plus the bit window it views.
#[derive(Debug)]
pub struct RegAlias {
    pub name: &'static str,
    pub cell: Cell,
    pub offset: u32,
    pub width: u32,
}

const fn alias(name: &'static str, cell: Cell, offset: u32, width: u32) -> RegAlias {
    RegAlias {
        name,
        cell,
        offset,
        width,
    }
}

const fn gpr(name: &'static str, index: usize, offset: u32, width: u32) -> RegAlias {
    alias(name, Cell::Gpr(index), offset, width)
}

const fn xmm(name: &'static str, index: usize, width: u32) -> RegAlias {
    alias(name, Cell::Vector(index), 0, width)
}

/// Every architectural register name the core resolves, in the
/// general-purpose encoding order (RAX, RCX, RDX, RBX, RSP, RBP, RSI,
/// RDI, R8..R15).
pub static REGISTER_ALIASES: &[RegAlias] = &[
    gpr("RAX", 0, 0, 64), gpr("EAX", 0, 0, 32), gpr("AX", 0, 0, 16), gpr("AL", 0, 0, 8), gpr("AH", 0, 8, 8),
    gpr("RCX", 1, 0, 64), gpr("ECX", 1, 0, 32), gpr("CX", 1, 0, 16), gpr("CL", 1, 0, 8), gpr("CH", 1, 8, 8),
    gpr("RDX", 2, 0, 64), gpr("EDX", 2, 0, 32), gpr("DX", 2, 0, 16), gpr("DL", 2, 0, 8), gpr("DH", 2, 8, 8),
    gpr("RBX", 3, 0, 64), gpr("EBX", 3, 0, 32), gpr("BX", 3, 0, 16), gpr("BL", 3, 0, 8), gpr("BH", 3, 8, 8),
    gpr("RSP", 4, 0, 64), gpr("ESP", 4, 0, 32), gpr("SP", 4, 0, 16), gpr("SPL", 4, 0, 8),
    gpr("RBP", 5, 0, 64), gpr("EBP", 5, 0, 32), gpr("BP", 5, 0, 16), gpr("BPL", 5, 0, 8),
    gpr("RSI", 6, 0, 64), gpr("ESI", 6, 0, 32), gpr("SI", 6, 0, 16), gpr("SIL", 6, 0, 8),
    gpr("RDI", 7, 0, 64), gpr("EDI", 7, 0, 32), gpr("DI", 7, 0, 16), gpr("DIL", 7, 0, 8),
    gpr("R8", 8, 0, 64), gpr("R8D", 8, 0, 32), gpr("R8W", 8, 0, 16), gpr("R8B", 8, 0, 8),
    gpr("R9", 9, 0, 64), gpr("R9D", 9, 0, 32), gpr("R9W", 9, 0, 16), gpr("R9B", 9, 0, 8),
    gpr("R10", 10, 0, 64), gpr("R10D", 10, 0, 32), gpr("R10W", 10, 0, 16), gpr("R10B", 10, 0, 8),
    gpr("R11", 11, 0, 64), gpr("R11D", 11, 0, 32), gpr("R11W", 11, 0, 16), gpr("R11B", 11, 0, 8),
    gpr("R12", 12, 0, 64), gpr("R12D", 12, 0, 32), gpr("R12W", 12, 0, 16), gpr("R12B", 12, 0, 8),
    gpr("R13", 13, 0, 64), gpr("R13D", 13, 0, 32), gpr("R13W", 13, 0, 16), gpr("R13B", 13, 0, 8),
    gpr("R14", 14, 0, 64), gpr("R14D", 14, 0, 32), gpr("R14W", 14, 0, 16), gpr("R14B", 14, 0, 8),
    gpr("R15", 15, 0, 64), gpr("R15D", 15, 0, 32), gpr("R15W", 15, 0, 16), gpr("R15B", 15, 0, 8),

    alias("RIP", Cell::Rip, 0, 64),

    alias("CF", Cell::Flag(Flag::CF), 0, 1),
    alias("PF", Cell::Flag(Flag::PF), 0, 1),
    alias("AF", Cell::Flag(Flag::AF), 0, 1),
    alias("ZF", Cell::Flag(Flag::ZF), 0, 1),
    alias("SF", Cell::Flag(Flag::SF), 0, 1),
    alias("DF", Cell::Flag(Flag::DF), 0, 1),
    alias("OF", Cell::Flag(Flag::OF), 0, 1),

    xmm("XMM0", 0, 128), xmm("XMM1", 1, 128), xmm("XMM2", 2, 128), xmm("XMM3", 3, 128),
    xmm("XMM4", 4, 128), xmm("XMM5", 5, 128), xmm("XMM6", 6, 128), xmm("XMM7", 7, 128),
    xmm("XMM8", 8, 128), xmm("XMM9", 9, 128), xmm("XMM10", 10, 128), xmm("XMM11", 11, 128),
    xmm("XMM12", 12, 128), xmm("XMM13", 13, 128), xmm("XMM14", 14, 128), xmm("XMM15", 15, 128),
    xmm("YMM0", 0, 256), xmm("YMM1", 1, 256), xmm("YMM2", 2, 256), xmm("YMM3", 3, 256),
    xmm("YMM4", 4, 256), xmm("YMM5", 5, 256), xmm("YMM6", 6, 256), xmm("YMM7", 7, 256),
    xmm("YMM8", 8, 256), xmm("YMM9", 9, 256), xmm("YMM10", 10, 256), xmm("YMM11", 11, 256),
    xmm("YMM12", 12, 256), xmm("YMM13", 13, 256), xmm("YMM14", 14, 256), xmm("YMM15", 15, 256),
];

static ALIAS_INDEX: Lazy<HashMap<&'static str, &'static RegAlias>> = Lazy::new(|| {
    REGISTER_ALIASES
        .iter()
        .map(|alias| (alias.name, alias))
        .collect()
});

/// Resolves an architectural name (case-insensitive) to its alias row.
pub fn lookup_alias(name: &str) -> Option<&'static RegAlias> {
    let upper = name.to_ascii_uppercase();
    ALIAS_INDEX.get(upper.as_str()).copied()
}

const GPR_COUNT: usize = 16;
const VECTOR_COUNT: usize = 16;
const VECTOR_WIDTH: u32 = 256;

#[derive(Clone, Debug)]
pub struct CpuState<'ctx> {
    ctx: &'ctx Context,
    gpr: Vec<Value<'ctx>>,
    rip: Value<'ctx>,
    flags: Vec<Value<'ctx>>,
    vector: Vec<Value<'ctx>>,
}

impl<'ctx> CpuState<'ctx> {
    /// Fresh state, every cell concrete zero.
    pub fn new(ctx: &'ctx Context) -> Self {
        CpuState {
            ctx,
            gpr: vec![Value::from_u64(0, 64); GPR_COUNT],
            rip: Value::from_u64(0, 64),
            flags: vec![Value::from_bool(false); FLAG_COUNT],
            vector: vec![Value::from_u64(0, VECTOR_WIDTH); VECTOR_COUNT],
        }
    }

    fn ops(&self) -> Operators<'ctx> {
        Operators::new(self.ctx)
    }

    fn cell_width(cell: Cell) -> u32 {
        match cell {
            Cell::Gpr(_) | Cell::Rip => 64,
            Cell::Flag(_) => 1,
            Cell::Vector(_) => VECTOR_WIDTH,
        }
    }

    fn cell_value(&self, cell: Cell) -> &Value<'ctx> {
        match cell {
            Cell::Gpr(i) => &self.gpr[i],
            Cell::Rip => &self.rip,
            Cell::Flag(f) => &self.flags[f.index()],
            Cell::Vector(i) => &self.vector[i],
        }
    }

    fn store_cell(&mut self, cell: Cell, value: Value<'ctx>) {
        match cell {
            Cell::Gpr(i) => self.gpr[i] = value,
            Cell::Rip => self.rip = value,
            Cell::Flag(f) => self.flags[f.index()] = value,
            Cell::Vector(i) => self.vector[i] = value,
        }
    }

    /// Reads a register by any architectural alias name. The result has
    /// exactly the alias's width.
    pub fn get(&self, name: &str) -> Result<Value<'ctx>> {
        let alias = lookup_alias(name).ok_or_else(|| anyhow!("unknown register {}", name))?;
        Ok(self.get_alias(alias))
    }

    pub fn get_alias(&self, alias: &RegAlias) -> Value<'ctx> {
        let cell = self.cell_value(alias.cell);
        if alias.offset == 0 && alias.width == Self::cell_width(alias.cell) {
            return cell.clone();
        }
        self.ops()
            .extract(cell, alias.offset + alias.width - 1, alias.offset)
    }

    /// Writes a register by any architectural alias name. The value is
    /// truncated to the alias's width first. A 32-bit general-purpose
    /// write zero-extends into the 64-bit cell; every other sub-register
    /// write preserves the untouched bits of the wider form.
    pub fn set(&mut self, name: &str, value: Value<'ctx>) -> Result<()> {
        let alias = lookup_alias(name).ok_or_else(|| anyhow!("unknown register {}", name))?;
        self.set_alias(alias, value);
        Ok(())
    }

    pub fn set_alias(&mut self, alias: &RegAlias, value: Value<'ctx>) {
        let ops = self.ops();
        let cell_width = Self::cell_width(alias.cell);
        let value = ops.resize(&value, alias.width);

        let new_cell = if alias.width == cell_width {
            value
        } else if matches!(alias.cell, Cell::Gpr(_)) && alias.offset == 0 && alias.width == 32 {
            // The architectural exception: 32-bit writes clear bits 63:32.
            ops.zext(&value, 64)
        } else {
            let old = self.cell_value(alias.cell);
            deposit(&ops, old, alias.offset, &value)
        };
        self.store_cell(alias.cell, new_cell);
    }

    pub fn rip(&self) -> Value<'ctx> {
        self.rip.clone()
    }

    pub fn set_rip(&mut self, value: Value<'ctx>) {
        self.rip = self.ops().resize(&value, 64);
    }

    pub fn get_flag(&self, flag: Flag) -> Value<'ctx> {
        self.flags[flag.index()].clone()
    }

    pub fn set_flag(&mut self, flag: Flag, value: Value<'ctx>) {
        debug_assert!(value.size() == 1);
        self.flags[flag.index()] = value;
    }
}

/// Replaces bits `offset..offset+value.size()` of `old`, preserving the
/// rest. Shared by every sub-register write path.
fn deposit<'ctx>(
    ops: &Operators<'ctx>,
    old: &Value<'ctx>,
    offset: u32,
    value: &Value<'ctx>,
) -> Value<'ctx> {
    let total = old.size();
    let width = value.size();
    let mut parts: Vec<Value<'ctx>> = Vec::with_capacity(3);
    if offset + width < total {
        parts.push(ops.extract(old, total - 1, offset + width));
    }
    parts.push(value.clone());
    if offset > 0 {
        parts.push(ops.extract(old, offset - 1, 0));
    }
    let mut merged = parts.remove(0);
    for part in parts {
        merged = ops.concat(&merged, &part);
    }
    merged
}

impl fmt::Display for CpuState<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CPU state:")?;
        for (i, name) in ["RAX", "RCX", "RDX", "RBX", "RSP", "RBP", "RSI", "RDI"]
            .iter()
            .enumerate()
        {
            writeln!(f, "  {}: {}", name, self.gpr[i])?;
        }
        for i in 8..GPR_COUNT {
            writeln!(f, "  R{}: {}", i, self.gpr[i])?;
        }
        writeln!(f, "  RIP: {}", self.rip)?;
        for flag in [Flag::CF, Flag::PF, Flag::AF, Flag::ZF, Flag::SF, Flag::DF, Flag::OF] {
            writeln!(f, "  {}: {}", flag.name(), self.flags[flag.index()])?;
        }
        Ok(())
    }
}
