//! Shift, rotate, and bit-scan semantics.
//!
//! Counts are masked to 5 bits (6 for 64-bit operands) before anything
//! else, and a masked count of zero modifies neither the destination nor
//! any flag. CF always takes the last bit shifted out; OF is defined
//! only for a count of exactly one, with the per-mnemonic rule the
//! architecture documents, and is left unmodified for larger counts.

use crate::instruction::Inst;
use crate::state::flags::Flag;
use crate::state::memory::MemoryBackend;

use super::executor::{expect_operands, CpuExecutor, ExecError, Fault, NextRip};
use super::executor_arith::set_result_flags;
use super::Value;

enum ShiftKind {
    Left,
    LogicalRight,
    ArithmeticRight,
}

/// Fetches `(dst, value, masked count)` for the two-operand shift forms.
fn shift_operands<'ctx, M: MemoryBackend<'ctx>>(
    exec: &CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<(super::executor::Operand, Value<'ctx>, u32), ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let count_op = exec.fetch_operand(&inst.operands[1])?;
    let a = exec.read_operand(&dst)?;
    let raw = exec.read_operand_concrete(&count_op)?;
    let mask = if dst.size == 64 { 0x3f } else { 0x1f };
    Ok((dst, a, (raw & mask) as u32))
}

fn shift<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    kind: ShiftKind,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let (dst, a, count) = shift_operands(exec, inst)?;
    if count == 0 {
        return Ok(NextRip::Advance);
    }
    let ops = exec.ops;
    let size = dst.size;

    let result = match kind {
        ShiftKind::Left => ops.shl(&a, count),
        ShiftKind::LogicalRight => ops.lshr(&a, count),
        ShiftKind::ArithmeticRight => ops.ashr(&a, count),
    };
    // CF: the last bit shifted out. Shifting everything out leaves 0 for
    // the logical forms and the sign bit for SAR.
    let cf = match kind {
        ShiftKind::Left => {
            if count <= size {
                ops.bit(&a, size - count)
            } else {
                Value::from_bool(false)
            }
        }
        ShiftKind::LogicalRight => {
            if count <= size {
                ops.bit(&a, count - 1)
            } else {
                Value::from_bool(false)
            }
        }
        ShiftKind::ArithmeticRight => {
            if count <= size {
                ops.bit(&a, count - 1)
            } else {
                ops.msb(&a)
            }
        }
    };

    exec.write_operand(&dst, result.clone())?;
    if count == 1 {
        let of = match kind {
            ShiftKind::Left => ops.xor_bool(&ops.msb(&result), &cf),
            ShiftKind::LogicalRight => ops.msb(&a),
            ShiftKind::ArithmeticRight => Value::from_bool(false),
        };
        exec.cpu.set_flag(Flag::OF, of);
    }
    exec.cpu.set_flag(Flag::CF, cf);
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

pub(crate) fn handle_shl<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    shift(exec, inst, ShiftKind::Left)
}

pub(crate) fn handle_shr<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    shift(exec, inst, ShiftKind::LogicalRight)
}

pub(crate) fn handle_sar<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    shift(exec, inst, ShiftKind::ArithmeticRight)
}

fn rotate<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    left: bool,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let (dst, a, count) = shift_operands(exec, inst)?;
    if count == 0 {
        return Ok(NextRip::Advance);
    }
    let ops = exec.ops;
    let size = dst.size;
    let effective = count % size;

    let result = if effective == 0 {
        a.clone()
    } else if left {
        ops.or(&ops.shl(&a, effective), &ops.lshr(&a, size - effective))
    } else {
        ops.or(&ops.lshr(&a, effective), &ops.shl(&a, size - effective))
    };
    // Rotates only define CF (the bit rotated into it) and, for a count
    // of one, OF; SF/ZF/PF stay untouched.
    let cf = if left {
        ops.bit(&result, 0)
    } else {
        ops.msb(&result)
    };

    exec.write_operand(&dst, result.clone())?;
    if count == 1 {
        let of = if left {
            ops.xor_bool(&ops.msb(&result), &cf)
        } else {
            ops.xor_bool(&ops.msb(&result), &ops.bit(&result, size - 2))
        };
        exec.cpu.set_flag(Flag::OF, of);
    }
    exec.cpu.set_flag(Flag::CF, cf);
    Ok(NextRip::Advance)
}

pub(crate) fn handle_rol<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    rotate(exec, inst, true)
}

pub(crate) fn handle_ror<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    rotate(exec, inst, false)
}

/// SHLX: the VEX shift — three operands, count from a register, and no
/// flag effects at all.
pub(crate) fn handle_shlx<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 3)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let count_op = exec.fetch_operand(&inst.operands[2])?;
    let a = exec.read_operand(&src)?;
    let raw = exec.read_operand_concrete(&count_op)?;
    let mask = if dst.size == 64 { 0x3f } else { 0x1f };
    let result = exec.ops.shl(&a, (raw & mask) as u32);
    exec.write_operand(&dst, result)?;
    Ok(NextRip::Advance)
}

/// BSF/BSR. ZF reflects a zero source; the destination is then left
/// unchanged — the deterministic fallback the reference traces pin.
fn bit_scan<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    reverse: bool,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    if src.size != dst.size {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "bit scan operand widths differ".to_string(),
        )));
    }
    let value = exec.read_operand_concrete(&src)?;
    if value == 0 {
        exec.cpu.set_flag(Flag::ZF, Value::from_bool(true));
        return Ok(NextRip::Advance);
    }
    let index = if reverse {
        63 - value.leading_zeros()
    } else {
        value.trailing_zeros()
    };
    exec.write_operand(&dst, Value::from_u64(index as u64, dst.size))?;
    exec.cpu.set_flag(Flag::ZF, Value::from_bool(false));
    Ok(NextRip::Advance)
}

pub(crate) fn handle_bsf<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    bit_scan(exec, inst, false)
}

pub(crate) fn handle_bsr<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    bit_scan(exec, inst, true)
}
