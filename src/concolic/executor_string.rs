//! String-instruction semantics: MOVS/STOS/SCAS/CMPS/LODS with the
//! REP/REPE/REPNE prefixes.
//!
//! The exposed behavior is the post-loop state: pointer registers have
//! advanced element-width steps in the DF direction for every iteration
//! actually executed, the counter holds what remains, and the flags (for
//! the comparing forms) are those of the last executed iteration.
//! Register updates are buffered in locals and committed after the loop,
//! so a mid-loop concretization raise leaves the architectural state
//! untouched and the retry re-runs the whole instruction.

use crate::instruction::{Inst, RepPrefix};
use crate::state::flags::Flag;
use crate::state::memory::MemoryBackend;

use super::executor::{
    acc_name, expect_operands, ConcretizeTarget, CpuExecutor, ExecError, Fault, NextRip,
};
use super::executor_arith::sub_parts;
use super::Value;

struct LoopState {
    step: u64,
    count: u64,
    counted: bool,
}

/// Shared setup: element step from DF, iteration count from RCX when a
/// REP-family prefix is present. Both concretize if symbolic.
fn loop_state<'ctx, M: MemoryBackend<'ctx>>(
    exec: &CpuExecutor<'ctx, M>,
    inst: &Inst,
    width: u32,
) -> Result<LoopState, ExecError<'ctx>> {
    expect_operands(inst, 0)?;
    if !matches!(width, 8 | 16 | 32 | 64) {
        return Err(ExecError::Fault(Fault::InvalidOperand(format!(
            "string element of {} bits",
            width
        ))));
    }
    let element = (width / 8) as u64;
    let down = exec.flag_concrete(Flag::DF)?;
    let step = if down { element.wrapping_neg() } else { element };
    let (count, counted) = match inst.rep {
        Some(_) => (exec.reg_u64("RCX")?, true),
        None => (1, false),
    };
    Ok(LoopState {
        step,
        count,
        counted,
    })
}

/// Flags of the comparing string forms: the full SUB set of the last
/// executed iteration.
struct CompareFlags<'ctx> {
    result: Value<'ctx>,
    cf: Value<'ctx>,
    of: Value<'ctx>,
    af: Value<'ctx>,
    zf: Value<'ctx>,
}

fn commit_compare_flags<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    flags: CompareFlags<'ctx>,
) {
    let ops = exec.ops;
    exec.cpu.set_flag(Flag::CF, flags.cf);
    exec.cpu.set_flag(Flag::OF, flags.of);
    exec.cpu.set_flag(Flag::AF, flags.af);
    exec.cpu.set_flag(Flag::SF, ops.msb(&flags.result));
    exec.cpu.set_flag(Flag::ZF, flags.zf);
    exec.cpu.set_flag(Flag::PF, ops.parity_even(&flags.result));
}

/// REPE continues while ZF holds, REPNE while it does not. The plain REP
/// encoding on the comparing forms is the REPE byte, so it terminates
/// the same way.
fn stops_loop(prefix: RepPrefix, zf: bool) -> bool {
    match prefix {
        RepPrefix::Rep | RepPrefix::Repe => !zf,
        RepPrefix::Repne => zf,
    }
}

pub(crate) fn handle_movs<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    width: u32,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let state = loop_state(exec, inst, width)?;
    let mut rsi = exec.reg_u64("RSI")?;
    let mut rdi = exec.reg_u64("RDI")?;
    let mut remaining = state.count;
    while remaining > 0 {
        // Data is pure pass-through: a symbolic element moves unresolved.
        let value = exec.memory.read_value(rsi, width)?;
        exec.memory.write_value(rdi, &value)?;
        rsi = rsi.wrapping_add(state.step);
        rdi = rdi.wrapping_add(state.step);
        remaining -= 1;
    }
    exec.write_reg("RSI", Value::from_u64(rsi, 64))?;
    exec.write_reg("RDI", Value::from_u64(rdi, 64))?;
    if state.counted {
        exec.write_reg("RCX", Value::from_u64(remaining, 64))?;
    }
    Ok(NextRip::Advance)
}

pub(crate) fn handle_stos<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    width: u32,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let state = loop_state(exec, inst, width)?;
    let value = exec.read_reg(acc_name(width)?)?;
    let mut rdi = exec.reg_u64("RDI")?;
    let mut remaining = state.count;
    while remaining > 0 {
        exec.memory.write_value(rdi, &value)?;
        rdi = rdi.wrapping_add(state.step);
        remaining -= 1;
    }
    exec.write_reg("RDI", Value::from_u64(rdi, 64))?;
    if state.counted {
        exec.write_reg("RCX", Value::from_u64(remaining, 64))?;
    }
    Ok(NextRip::Advance)
}

pub(crate) fn handle_lods<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    width: u32,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let state = loop_state(exec, inst, width)?;
    let mut rsi = exec.reg_u64("RSI")?;
    let mut remaining = state.count;
    let mut last = None;
    while remaining > 0 {
        last = Some(exec.memory.read_value(rsi, width)?);
        rsi = rsi.wrapping_add(state.step);
        remaining -= 1;
    }
    if let Some(value) = last {
        exec.write_reg(acc_name(width)?, value)?;
    }
    exec.write_reg("RSI", Value::from_u64(rsi, 64))?;
    if state.counted {
        exec.write_reg("RCX", Value::from_u64(remaining, 64))?;
    }
    Ok(NextRip::Advance)
}

pub(crate) fn handle_scas<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    width: u32,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let state = loop_state(exec, inst, width)?;
    let ops = exec.ops;
    let accumulator = acc_name(width)?;
    let acc = exec.read_reg(accumulator)?;
    // The early-termination decision compares against the accumulator
    // every iteration; a symbolic accumulator cannot drive it.
    if state.counted {
        exec.require_concrete(&acc, ConcretizeTarget::Register(accumulator))?;
    }
    let mut rdi = exec.reg_u64("RDI")?;
    let mut remaining = state.count;
    let mut last = None;
    while remaining > 0 {
        let address = rdi;
        let value = exec.memory.read_value(address, width)?;
        let (result, cf, of, af) = sub_parts(&ops, &acc, &value, &Value::from_bool(false));
        let zf = ops.is_zero(&result);
        rdi = rdi.wrapping_add(state.step);
        remaining -= 1;
        let stop = match inst.rep {
            Some(prefix) => {
                let zf_concrete = match zf.as_concrete_bool() {
                    Some(b) => b,
                    // Nothing is committed yet; concretize the element
                    // and re-run the instruction from scratch.
                    None => {
                        exec.require_concrete(&value, ConcretizeTarget::MemoryValue(address))?;
                        unreachable!("a symbolic comparison has a symbolic element")
                    }
                };
                stops_loop(prefix, zf_concrete)
            }
            None => true,
        };
        last = Some(CompareFlags {
            result,
            cf,
            of,
            af,
            zf,
        });
        if stop {
            break;
        }
    }
    if let Some(flags) = last {
        commit_compare_flags(exec, flags);
    }
    exec.write_reg("RDI", Value::from_u64(rdi, 64))?;
    if state.counted {
        exec.write_reg("RCX", Value::from_u64(remaining, 64))?;
    }
    Ok(NextRip::Advance)
}

pub(crate) fn handle_cmps<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    width: u32,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let state = loop_state(exec, inst, width)?;
    let ops = exec.ops;
    let mut rsi = exec.reg_u64("RSI")?;
    let mut rdi = exec.reg_u64("RDI")?;
    let mut remaining = state.count;
    let mut last = None;
    while remaining > 0 {
        let lhs_address = rsi;
        let rhs_address = rdi;
        let lhs = exec.memory.read_value(lhs_address, width)?;
        let rhs = exec.memory.read_value(rhs_address, width)?;
        let (result, cf, of, af) = sub_parts(&ops, &lhs, &rhs, &Value::from_bool(false));
        let zf = ops.is_zero(&result);
        rsi = rsi.wrapping_add(state.step);
        rdi = rdi.wrapping_add(state.step);
        remaining -= 1;
        let stop = match inst.rep {
            Some(prefix) => {
                let zf_concrete = match zf.as_concrete_bool() {
                    Some(b) => b,
                    None => {
                        // Pin whichever side is symbolic and retry.
                        let (value, address) = if lhs.is_symbolic() {
                            (&lhs, lhs_address)
                        } else {
                            (&rhs, rhs_address)
                        };
                        exec.require_concrete(value, ConcretizeTarget::MemoryValue(address))?;
                        unreachable!("a symbolic comparison has a symbolic element")
                    }
                };
                stops_loop(prefix, zf_concrete)
            }
            None => true,
        };
        last = Some(CompareFlags {
            result,
            cf,
            of,
            af,
            zf,
        });
        if stop {
            break;
        }
    }
    if let Some(flags) = last {
        commit_compare_flags(exec, flags);
    }
    exec.write_reg("RSI", Value::from_u64(rsi, 64))?;
    exec.write_reg("RDI", Value::from_u64(rdi, 64))?;
    if state.counted {
        exec.write_reg("RCX", Value::from_u64(remaining, 64))?;
    }
    Ok(NextRip::Advance)
}
