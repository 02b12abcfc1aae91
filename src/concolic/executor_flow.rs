//! Stack and control-flow semantics.
//!
//! Stack traffic always moves full stack-pointer-width values. CALL
//! pushes the address of the instruction that follows it; conditional
//! jumps decide on exactly the documented flag combination, concretizing
//! each involved flag through the constraint set when it is symbolic.

use crate::instruction::{Inst, OperandDesc};
use crate::state::flags::Cond;
use crate::state::memory::MemoryBackend;

use super::executor::{expect_operands, CpuExecutor, ExecError, Fault, NextRip};
use super::Value;

const STACK_WIDTH: u32 = 64;

fn push_value<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    value: &Value<'ctx>,
) -> Result<(), ExecError<'ctx>> {
    let rsp = exec.reg_u64("RSP")?;
    let new_rsp = rsp.wrapping_sub((value.size() / 8) as u64);
    exec.memory.write_value(new_rsp, value)?;
    exec.write_reg("RSP", Value::from_u64(new_rsp, 64))?;
    Ok(())
}

fn pop_value<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    size: u32,
) -> Result<Value<'ctx>, ExecError<'ctx>> {
    let rsp = exec.reg_u64("RSP")?;
    let value = exec.memory.read_value(rsp, size)?;
    exec.write_reg("RSP", Value::from_u64(rsp.wrapping_add((size / 8) as u64), 64))?;
    Ok(value)
}

/// Reads a branch-target operand as a 64-bit address value. Immediates
/// are absolute targets, already resolved by the decoder.
fn branch_target<'ctx, M: MemoryBackend<'ctx>>(
    exec: &CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<Value<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let operand = exec.fetch_operand(&inst.operands[0])?;
    let value = exec.read_operand(&operand)?;
    Ok(exec.ops.resize(&value, 64))
}

pub(crate) fn handle_push<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let src = exec.fetch_operand(&inst.operands[0])?;
    let mut value = exec.read_operand(&src)?;
    if value.size() < STACK_WIDTH {
        if matches!(inst.operands[0], OperandDesc::Immediate { .. }) {
            value = exec.ops.sext(&value, STACK_WIDTH);
        } else {
            return Err(ExecError::Fault(Fault::InvalidOperand(
                "PUSH moves full stack-pointer-width values".to_string(),
            )));
        }
    }
    push_value(exec, &value)?;
    Ok(NextRip::Advance)
}

pub(crate) fn handle_pop<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    if dst.size != STACK_WIDTH {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "POP moves full stack-pointer-width values".to_string(),
        )));
    }
    let value = pop_value(exec, STACK_WIDTH)?;
    exec.write_operand(&dst, value)?;
    Ok(NextRip::Advance)
}

/// CALL pushes the address of the instruction immediately following it,
/// then transfers.
pub(crate) fn handle_call<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let target = branch_target(exec, inst)?;
    let return_address = exec
        .ops
        .add(&exec.cpu.rip(), &Value::from_u64(inst.length, 64));
    push_value(exec, &return_address)?;
    Ok(NextRip::Jump(target))
}

/// RET pops the return address; the `ret imm16` form releases that many
/// extra stack bytes afterwards. The popped target may stay symbolic —
/// resolving it is the caller's concern when it next needs a concrete
/// RIP.
pub(crate) fn handle_ret<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    if inst.operands.len() > 1 {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "RET takes at most one immediate".to_string(),
        )));
    }
    let release = match inst.operands.first() {
        Some(desc) => {
            let operand = exec.fetch_operand(desc)?;
            exec.read_operand_concrete(&operand)?
        }
        None => 0,
    };
    let target = pop_value(exec, STACK_WIDTH)?;
    if release != 0 {
        let rsp = exec.reg_u64("RSP")?;
        exec.write_reg("RSP", Value::from_u64(rsp.wrapping_add(release), 64))?;
    }
    Ok(NextRip::Jump(target))
}

pub(crate) fn handle_jmp<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let target = branch_target(exec, inst)?;
    Ok(NextRip::Jump(target))
}

/// Jcc: the predicate must decide; each involved flag is concretized
/// individually, so a flag pinned to a single value by the constraints
/// resolves silently and a genuinely two-valued one surfaces.
pub(crate) fn handle_jcc<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    cond: Cond,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let target = branch_target(exec, inst)?;
    let ops = exec.ops;
    let predicate = cond.eval(&ops, &mut |flag| {
        exec.flag_concrete(flag).map(Value::from_bool)
    })?;
    let taken = predicate
        .as_concrete_bool()
        .expect("a predicate over concrete flags is concrete");
    if taken {
        Ok(NextRip::Jump(target))
    } else {
        Ok(NextRip::Advance)
    }
}

/// LEAVE: `rsp = rbp; rbp = pop()`.
pub(crate) fn handle_leave<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 0)?;
    let rbp = exec.reg_u64("RBP")?;
    exec.write_reg("RSP", Value::from_u64(rbp, 64))?;
    let saved = pop_value(exec, STACK_WIDTH)?;
    exec.write_reg("RBP", saved)?;
    Ok(NextRip::Advance)
}
