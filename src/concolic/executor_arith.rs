//! Arithmetic, logic, widening-convert, multiply/divide, and
//! compare-exchange semantics.
//!
//! Every flag an instruction defines is computed explicitly from the
//! operands and result, on the value domain, so the same handler body
//! serves concrete and symbolic execution. Flags the manual leaves
//! undefined are left unmodified.

use crate::instruction::{Inst, Mnemonic, OperandDesc};
use crate::state::flags::Flag;
use crate::state::memory::MemoryBackend;

use super::executor::{
    acc_name, expect_operands, high_name, CpuExecutor, ExecError, Fault, NextRip, Operand,
};
use super::{Operators, Value};

/// Fetches the destination/source pair shared by the two-operand ALU
/// forms. An immediate narrower than the destination is sign-extended to
/// it (the only immediate encodings x86 has are sign-extending); any
/// other width mismatch is a decoder violation.
fn dst_src<'ctx, M: MemoryBackend<'ctx>>(
    exec: &CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<(Operand, Value<'ctx>, Value<'ctx>), ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let a = exec.read_operand(&dst)?;
    let mut b = exec.read_operand(&src)?;
    if b.size() < a.size() {
        if matches!(inst.operands[1], OperandDesc::Immediate { .. }) {
            b = exec.ops.sext(&b, a.size());
        } else {
            return Err(ExecError::Fault(Fault::InvalidOperand(format!(
                "{:?}: source is {} bits, destination {}",
                inst.mnemonic,
                b.size(),
                a.size()
            ))));
        }
    } else if b.size() > a.size() {
        return Err(ExecError::Fault(Fault::InvalidOperand(format!(
            "{:?}: source wider than destination",
            inst.mnemonic
        ))));
    }
    Ok((dst, a, b))
}

/// SF/ZF/PF from a result, the triple every ALU instruction defines.
pub(crate) fn set_result_flags<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    result: &Value<'ctx>,
) {
    let ops = exec.ops;
    exec.cpu.set_flag(Flag::SF, ops.msb(result));
    exec.cpu.set_flag(Flag::ZF, ops.is_zero(result));
    exec.cpu.set_flag(Flag::PF, ops.parity_even(result));
}

/// `a + b + carry_in` in `size+1` bits: result, carry-out, signed
/// overflow (sign(a)==sign(b)!=sign(r)), and the low-nibble adjust flag.
pub(crate) fn add_parts<'ctx>(
    ops: &Operators<'ctx>,
    a: &Value<'ctx>,
    b: &Value<'ctx>,
    carry_in: &Value<'ctx>,
) -> (Value<'ctx>, Value<'ctx>, Value<'ctx>, Value<'ctx>) {
    let size = a.size();
    let wide = ops.add(
        &ops.add(&ops.zext(a, size + 1), &ops.zext(b, size + 1)),
        &ops.zext(carry_in, size + 1),
    );
    let result = ops.extract(&wide, size - 1, 0);
    let cf = ops.bit(&wide, size);
    let of = ops.msb(&ops.and(&ops.xor(a, &result), &ops.xor(b, &result)));
    let af = ops.bit(&ops.xor(&ops.xor(a, b), &result), 4);
    (result, cf, of, af)
}

/// `a - b - borrow_in` in `size+1` bits: result, borrow-out, signed
/// overflow (sign(a)!=sign(b) and sign(a)!=sign(r)), and the adjust flag.
pub(crate) fn sub_parts<'ctx>(
    ops: &Operators<'ctx>,
    a: &Value<'ctx>,
    b: &Value<'ctx>,
    borrow_in: &Value<'ctx>,
) -> (Value<'ctx>, Value<'ctx>, Value<'ctx>, Value<'ctx>) {
    let size = a.size();
    let wide = ops.sub(
        &ops.sub(&ops.zext(a, size + 1), &ops.zext(b, size + 1)),
        &ops.zext(borrow_in, size + 1),
    );
    let result = ops.extract(&wide, size - 1, 0);
    let cf = ops.bit(&wide, size);
    let of = ops.msb(&ops.and(&ops.xor(a, b), &ops.xor(a, &result)));
    let af = ops.bit(&ops.xor(&ops.xor(a, b), &result), 4);
    (result, cf, of, af)
}

pub(crate) fn handle_add<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let (dst, a, b) = dst_src(exec, inst)?;
    let (result, cf, of, af) = add_parts(&exec.ops, &a, &b, &Value::from_bool(false));
    exec.write_operand(&dst, result.clone())?;
    exec.cpu.set_flag(Flag::CF, cf);
    exec.cpu.set_flag(Flag::OF, of);
    exec.cpu.set_flag(Flag::AF, af);
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

pub(crate) fn handle_adc<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let (dst, a, b) = dst_src(exec, inst)?;
    let carry_in = exec.cpu.get_flag(Flag::CF);
    let (result, cf, of, af) = add_parts(&exec.ops, &a, &b, &carry_in);
    exec.write_operand(&dst, result.clone())?;
    exec.cpu.set_flag(Flag::CF, cf);
    exec.cpu.set_flag(Flag::OF, of);
    exec.cpu.set_flag(Flag::AF, af);
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

pub(crate) fn handle_sub<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let (dst, a, b) = dst_src(exec, inst)?;
    let (result, cf, of, af) = sub_parts(&exec.ops, &a, &b, &Value::from_bool(false));
    exec.write_operand(&dst, result.clone())?;
    exec.cpu.set_flag(Flag::CF, cf);
    exec.cpu.set_flag(Flag::OF, of);
    exec.cpu.set_flag(Flag::AF, af);
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

pub(crate) fn handle_sbb<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let (dst, a, b) = dst_src(exec, inst)?;
    let borrow_in = exec.cpu.get_flag(Flag::CF);
    let (result, cf, of, af) = sub_parts(&exec.ops, &a, &b, &borrow_in);
    exec.write_operand(&dst, result.clone())?;
    exec.cpu.set_flag(Flag::CF, cf);
    exec.cpu.set_flag(Flag::OF, of);
    exec.cpu.set_flag(Flag::AF, af);
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

/// SUB without the write-back.
pub(crate) fn handle_cmp<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let (_dst, a, b) = dst_src(exec, inst)?;
    let (result, cf, of, af) = sub_parts(&exec.ops, &a, &b, &Value::from_bool(false));
    exec.cpu.set_flag(Flag::CF, cf);
    exec.cpu.set_flag(Flag::OF, of);
    exec.cpu.set_flag(Flag::AF, af);
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

/// The logic family clears CF/OF, defines SF/ZF/PF, and leaves AF alone
/// (the manual calls it undefined there).
fn logic<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    op: fn(&Operators<'ctx>, &Value<'ctx>, &Value<'ctx>) -> Value<'ctx>,
    write_back: bool,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let (dst, a, b) = dst_src(exec, inst)?;
    let result = op(&exec.ops, &a, &b);
    if write_back {
        exec.write_operand(&dst, result.clone())?;
    }
    exec.cpu.set_flag(Flag::CF, Value::from_bool(false));
    exec.cpu.set_flag(Flag::OF, Value::from_bool(false));
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

pub(crate) fn handle_and<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    logic(exec, inst, Operators::and, true)
}

pub(crate) fn handle_or<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    logic(exec, inst, Operators::or, true)
}

pub(crate) fn handle_xor<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    logic(exec, inst, Operators::xor, true)
}

/// AND without the write-back.
pub(crate) fn handle_test<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    logic(exec, inst, Operators::and, false)
}

/// INC/DEC define OF/AF/SF/ZF/PF but preserve CF.
fn step_by_one<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    decrement: bool,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let a = exec.read_operand(&dst)?;
    let one = Value::from_u64(1, a.size());
    let zero = Value::from_bool(false);
    let (result, _cf, of, af) = if decrement {
        sub_parts(&exec.ops, &a, &one, &zero)
    } else {
        add_parts(&exec.ops, &a, &one, &zero)
    };
    exec.write_operand(&dst, result.clone())?;
    exec.cpu.set_flag(Flag::OF, of);
    exec.cpu.set_flag(Flag::AF, af);
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

pub(crate) fn handle_inc<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    step_by_one(exec, inst, false)
}

pub(crate) fn handle_dec<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    step_by_one(exec, inst, true)
}

pub(crate) fn handle_neg<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let a = exec.read_operand(&dst)?;
    let zero = Value::from_u64(0, a.size());
    let (result, cf, of, af) = sub_parts(&exec.ops, &zero, &a, &Value::from_bool(false));
    exec.write_operand(&dst, result.clone())?;
    exec.cpu.set_flag(Flag::CF, cf);
    exec.cpu.set_flag(Flag::OF, of);
    exec.cpu.set_flag(Flag::AF, af);
    set_result_flags(exec, &result);
    Ok(NextRip::Advance)
}

/// NOT touches no flags.
pub(crate) fn handle_not<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let a = exec.read_operand(&dst)?;
    let result = exec.ops.not(&a);
    exec.write_operand(&dst, result)?;
    Ok(NextRip::Advance)
}

/// CBW/CWDE/CDQE: sign-extend the accumulator in place. No flags.
pub(crate) fn handle_sign_extend_acc<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 0)?;
    let (src, dst) = match inst.mnemonic {
        Mnemonic::Cbw => ("AL", "AX"),
        Mnemonic::Cwde => ("AX", "EAX"),
        Mnemonic::Cdqe => ("EAX", "RAX"),
        _ => unreachable!("dispatch routes only the convert forms here"),
    };
    let value = exec.read_reg(src)?;
    let widened = exec.ops.sext(&value, value.size() * 2);
    exec.write_reg(dst, widened)?;
    Ok(NextRip::Advance)
}

/// CWD/CDQ/CQO: replicate the accumulator sign into the data register.
pub(crate) fn handle_sign_split_acc<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 0)?;
    let (src, dst) = match inst.mnemonic {
        Mnemonic::Cwd => ("AX", "DX"),
        Mnemonic::Cdq => ("EAX", "EDX"),
        Mnemonic::Cqo => ("RAX", "RDX"),
        _ => unreachable!("dispatch routes only the convert forms here"),
    };
    let value = exec.read_reg(src)?;
    let fill = exec.ops.ashr(&value, value.size() - 1);
    exec.write_reg(dst, fill)?;
    Ok(NextRip::Advance)
}

/// MUL: unsigned, full double-width product into the high:low pair.
/// CF=OF = high half nonzero; SF/ZF/AF/PF are undefined and left alone.
pub(crate) fn handle_mul<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let src = exec.fetch_operand(&inst.operands[0])?;
    let size = src.size;
    let b = exec.read_operand(&src)?;
    let a = exec.read_reg(acc_name(size)?)?;
    let ops = exec.ops;
    let wide = ops.mul(&ops.zext(&a, size * 2), &ops.zext(&b, size * 2));
    let low = ops.extract(&wide, size - 1, 0);
    let high = ops.extract(&wide, size * 2 - 1, size);
    let overflow = ops.not_bool(&ops.is_zero(&high));
    exec.write_reg(acc_name(size)?, low)?;
    exec.write_reg(high_name(size)?, high)?;
    exec.cpu.set_flag(Flag::CF, overflow.clone());
    exec.cpu.set_flag(Flag::OF, overflow);
    Ok(NextRip::Advance)
}

/// IMUL in its one-, two-, and three-operand forms. CF=OF indicate that
/// the full signed product does not fit the destination width.
pub(crate) fn handle_imul<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    let ops = exec.ops;
    match inst.operands.len() {
        1 => {
            let src = exec.fetch_operand(&inst.operands[0])?;
            let size = src.size;
            let b = exec.read_operand(&src)?;
            let a = exec.read_reg(acc_name(size)?)?;
            let wide = ops.mul(&ops.sext(&a, size * 2), &ops.sext(&b, size * 2));
            let low = ops.extract(&wide, size - 1, 0);
            let high = ops.extract(&wide, size * 2 - 1, size);
            let fits = ops.eq(&wide, &ops.sext(&low, size * 2));
            let overflow = ops.not_bool(&fits);
            exec.write_reg(acc_name(size)?, low)?;
            exec.write_reg(high_name(size)?, high)?;
            exec.cpu.set_flag(Flag::CF, overflow.clone());
            exec.cpu.set_flag(Flag::OF, overflow);
        }
        2 | 3 => {
            let dst = exec.fetch_operand(&inst.operands[0])?;
            let size = dst.size;
            let (a, b) = if inst.operands.len() == 2 {
                let src = exec.fetch_operand(&inst.operands[1])?;
                (exec.read_operand(&dst)?, exec.read_operand(&src)?)
            } else {
                let src = exec.fetch_operand(&inst.operands[1])?;
                let imm = exec.fetch_operand(&inst.operands[2])?;
                let imm_value = exec.read_operand(&imm)?;
                (exec.read_operand(&src)?, ops.sext(&imm_value, size))
            };
            let wide = ops.mul(&ops.sext(&a, size * 2), &ops.sext(&b, size * 2));
            let result = ops.extract(&wide, size - 1, 0);
            let fits = ops.eq(&wide, &ops.sext(&result, size * 2));
            let overflow = ops.not_bool(&fits);
            exec.write_operand(&dst, result)?;
            exec.cpu.set_flag(Flag::CF, overflow.clone());
            exec.cpu.set_flag(Flag::OF, overflow);
        }
        n => {
            return Err(ExecError::Fault(Fault::InvalidOperand(format!(
                "IMUL with {} operands",
                n
            ))))
        }
    }
    Ok(NextRip::Advance)
}

/// DIV: unsigned division of the high:low pair by the source. The
/// divisor and the high half must resolve to concrete values (the fault
/// predicates depend on them); the low half may stay symbolic. Zero
/// divisor and quotient overflow are hard faults, never wrapped.
pub(crate) fn handle_div<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let src = exec.fetch_operand(&inst.operands[0])?;
    let size = src.size;
    let divisor = exec.read_operand_concrete(&src)?;
    if divisor == 0 {
        return Err(ExecError::Fault(Fault::DivideByZero));
    }
    let high = exec.reg_u64(high_name(size)?)?;
    // Quotient fits iff the high half is below the divisor.
    if high >= divisor {
        return Err(ExecError::Fault(Fault::DivideOverflow));
    }
    let ops = exec.ops;
    let low = exec.read_reg(acc_name(size)?)?;
    let dividend = ops.concat(&Value::from_u64(high, size), &low);
    let wide_divisor = Value::from_u64(divisor, size * 2);
    let quotient = ops.extract(&ops.udiv(&dividend, &wide_divisor), size - 1, 0);
    let remainder = ops.extract(&ops.urem(&dividend, &wide_divisor), size - 1, 0);
    exec.write_reg(acc_name(size)?, quotient)?;
    exec.write_reg(high_name(size)?, remainder)?;
    Ok(NextRip::Advance)
}

/// IDIV: signed division. Both halves of the dividend and the divisor
/// must resolve concretely; the overflow predicate involves all three.
pub(crate) fn handle_idiv<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let src = exec.fetch_operand(&inst.operands[0])?;
    let size = src.size;
    let divisor_bits = exec.read_operand_concrete(&src)?;
    let divisor = sign_at(divisor_bits, size);
    if divisor == 0 {
        return Err(ExecError::Fault(Fault::DivideByZero));
    }
    let high = exec.reg_u64(high_name(size)?)?;
    let low = exec.reg_u64(acc_name(size)?)?;
    let dividend_bits = ((high as u128) << size) | low as u128;
    let dividend = sign_at_128(dividend_bits, size * 2);
    let quotient = dividend.wrapping_div(divisor as i128);
    let remainder = dividend.wrapping_rem(divisor as i128);
    let max = (1i128 << (size - 1)) - 1;
    let min = -(1i128 << (size - 1));
    if quotient > max || quotient < min {
        return Err(ExecError::Fault(Fault::DivideOverflow));
    }
    exec.write_reg(acc_name(size)?, Value::from_u64(quotient as u64, size))?;
    exec.write_reg(high_name(size)?, Value::from_u64(remainder as u64, size))?;
    Ok(NextRip::Advance)
}

fn sign_at(bits: u64, size: u32) -> i64 {
    ((bits << (64 - size)) as i64) >> (64 - size)
}

fn sign_at_128(bits: u128, size: u32) -> i128 {
    ((bits << (128 - size)) as i128) >> (128 - size)
}

/// CMPXCHG: compare the accumulator with the destination. Both the
/// destination and the accumulator are written exactly once, destination
/// first, with if-then-else selected values so a symbolic comparison
/// stays symbolic. The comparison sets the full SUB flag set.
pub(crate) fn handle_cmpxchg<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    if src.size != dst.size {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "CMPXCHG operand widths differ".to_string(),
        )));
    }
    let ops = exec.ops;
    let accumulator = acc_name(dst.size)?;
    let acc_old = exec.read_reg(accumulator)?;
    let dst_old = exec.read_operand(&dst)?;
    let src_value = exec.read_operand(&src)?;

    let equal = ops.eq(&acc_old, &dst_old);
    let (result, cf, of, af) = sub_parts(&ops, &acc_old, &dst_old, &Value::from_bool(false));

    let dst_new = ops.ite(&equal, &src_value, &dst_old);
    let acc_new = ops.ite(&equal, &acc_old, &dst_old);
    exec.write_operand(&dst, dst_new)?;
    exec.write_reg(accumulator, acc_new)?;

    exec.cpu.set_flag(Flag::CF, cf);
    exec.cpu.set_flag(Flag::OF, of);
    exec.cpu.set_flag(Flag::AF, af);
    exec.cpu.set_flag(Flag::SF, ops.msb(&result));
    exec.cpu.set_flag(Flag::ZF, equal);
    exec.cpu.set_flag(Flag::PF, ops.parity_even(&result));
    Ok(NextRip::Advance)
}

/// CMPXCHG8B: compare EDX:EAX with the 64-bit destination; on equality
/// store ECX:EBX there, otherwise load the destination into EDX:EAX.
/// Only ZF is affected.
pub(crate) fn handle_cmpxchg8b<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 1)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    if dst.size != 64 {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "CMPXCHG8B needs a 64-bit destination".to_string(),
        )));
    }
    let ops = exec.ops;
    let dst_old = exec.read_operand(&dst)?;
    let eax = exec.read_reg("EAX")?;
    let edx = exec.read_reg("EDX")?;
    let ebx = exec.read_reg("EBX")?;
    let ecx = exec.read_reg("ECX")?;
    let compare = ops.concat(&edx, &eax);
    let replacement = ops.concat(&ecx, &ebx);

    let equal = ops.eq(&compare, &dst_old);
    let dst_new = ops.ite(&equal, &replacement, &dst_old);
    exec.write_operand(&dst, dst_new)?;

    let loaded_low = ops.extract(&dst_old, 31, 0);
    let loaded_high = ops.extract(&dst_old, 63, 32);
    exec.write_reg("EAX", ops.ite(&equal, &eax, &loaded_low))?;
    exec.write_reg("EDX", ops.ite(&equal, &edx, &loaded_high))?;

    exec.cpu.set_flag(Flag::ZF, equal);
    Ok(NextRip::Advance)
}
