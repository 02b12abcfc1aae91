//! Data movement: MOV and friends, LEA, XCHG, and the conditional
//! move/set family. None of these touch flags; CMOVcc and SETcc read
//! them through the same predicate table Jcc uses.

use crate::instruction::{Inst, OperandDesc};
use crate::state::flags::Cond;
use crate::state::memory::MemoryBackend;

use super::executor::{expect_operands, CpuExecutor, ExecError, Fault, NextRip};
use super::Value;

/// MOV and MOVABS: plain width-preserving store. A narrower immediate is
/// sign-extended to the destination (the encoding x86 actually has).
pub(crate) fn handle_mov<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let mut value = exec.read_operand(&src)?;
    if value.size() < dst.size {
        if matches!(inst.operands[1], OperandDesc::Immediate { .. }) {
            value = exec.ops.sext(&value, dst.size);
        } else {
            return Err(ExecError::Fault(Fault::InvalidOperand(
                "MOV source narrower than destination".to_string(),
            )));
        }
    } else if value.size() > dst.size {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "MOV source wider than destination".to_string(),
        )));
    }
    exec.write_operand(&dst, value)?;
    Ok(NextRip::Advance)
}

/// MOVZX: explicit zero-extension from the source width.
pub(crate) fn handle_movzx<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    extend(exec, inst, false)
}

/// MOVSX/MOVSXD: explicit sign-extension from the source width.
pub(crate) fn handle_movsx<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    extend(exec, inst, true)
}

fn extend<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    signed: bool,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    if src.size >= dst.size {
        return Err(ExecError::Fault(Fault::InvalidOperand(format!(
            "{:?}: source must be narrower than destination",
            inst.mnemonic
        ))));
    }
    let value = exec.read_operand(&src)?;
    let widened = if signed {
        exec.ops.sext(&value, dst.size)
    } else {
        exec.ops.zext(&value, dst.size)
    };
    exec.write_operand(&dst, widened)?;
    Ok(NextRip::Advance)
}

/// LEA: the effective address itself, never dereferenced and never
/// resolved — a symbolic address stores symbolically.
pub(crate) fn handle_lea<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let address = exec.effective_address(&inst.operands[1])?;
    let value = exec.ops.resize(&address, dst.size);
    exec.write_operand(&dst, value)?;
    Ok(NextRip::Advance)
}

pub(crate) fn handle_xchg<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let first = exec.fetch_operand(&inst.operands[0])?;
    let second = exec.fetch_operand(&inst.operands[1])?;
    if first.size != second.size {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "XCHG operand widths differ".to_string(),
        )));
    }
    let a = exec.read_operand(&first)?;
    let b = exec.read_operand(&second)?;
    exec.write_operand(&first, b)?;
    exec.write_operand(&second, a)?;
    Ok(NextRip::Advance)
}

/// CMOVcc: the destination receives the source when the predicate holds
/// and its old value otherwise, through if-then-else on the value domain
/// so a symbolic predicate stays symbolic. Note the write happens either
/// way, which reproduces the architectural 32-bit zero-extension even
/// for a not-taken CMOV.
pub(crate) fn handle_cmovcc<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    cond: Cond,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let ops = exec.ops;
    let taken = cond.eval(&ops, &mut |flag| -> Result<Value<'ctx>, ExecError<'ctx>> {
        Ok(exec.cpu.get_flag(flag))
    })?;
    let old = exec.read_operand(&dst)?;
    let new = exec.read_operand(&src)?;
    let selected = ops.ite(&taken, &new, &old);
    exec.write_operand(&dst, selected)?;
    Ok(NextRip::Advance)
}

/// SETcc: the byte destination is always written, 1 or 0.
pub(crate) fn handle_setcc<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    cond: Cond,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    if dst.size != 8 {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "SETcc needs a byte destination".to_string(),
        )));
    }
    let ops = exec.ops;
    let taken = cond.eval(&ops, &mut |flag| -> Result<Value<'ctx>, ExecError<'ctx>> {
        Ok(exec.cpu.get_flag(flag))
    })?;
    let byte = ops.ite(&taken, &Value::from_u64(1, 8), &Value::from_u64(0, 8));
    exec.write_operand(&dst, byte)?;
    Ok(NextRip::Advance)
}
