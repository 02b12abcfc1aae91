//! Vector (SSE/AVX subset) semantics.
//!
//! Vector values are opaque multi-byte quantities; only the documented
//! lane-wise or whole-register transform is modeled and nothing here
//! touches flags. Legacy-SSE destination writes go through the XMM alias
//! and therefore preserve YMM bits 255:128, exactly like an 8/16-bit GPR
//! write; the VEX-encoded forms zero that lane explicitly.

use crate::instruction::Inst;
use crate::state::memory::MemoryBackend;

use super::executor::{
    expect_operands, CpuExecutor, ExecError, Fault, NextRip, Operand, OperandKind,
};
use super::{Operators, Value};

const XMM_BITS: u32 = 128;
const BYTE_LANES: u32 = 16;

/// Lane `index` of `v`, `lane_bits` wide.
fn lane<'ctx>(ops: &Operators<'ctx>, v: &Value<'ctx>, index: u32, lane_bits: u32) -> Value<'ctx> {
    ops.extract(v, (index + 1) * lane_bits - 1, index * lane_bits)
}

/// Reassembles lanes (index 0 = least significant) into one value.
fn from_lanes<'ctx>(ops: &Operators<'ctx>, lanes: &[Value<'ctx>]) -> Value<'ctx> {
    let mut iter = lanes.iter().rev();
    let mut value = iter.next().expect("at least one lane").clone();
    for lane in iter {
        value = ops.concat(&value, lane);
    }
    value
}

/// The YMM register shadowing an XMM destination operand, for the VEX
/// forms that zero the upper lane.
fn ymm_shadow<'ctx>(operand: &Operand) -> Result<String, ExecError<'ctx>> {
    match &operand.kind {
        OperandKind::Register(alias) if alias.name.starts_with("XMM") => {
            Ok(format!("YMM{}", &alias.name[3..]))
        }
        _ => Err(ExecError::Fault(Fault::InvalidOperand(
            "VEX destination must be an XMM register".to_string(),
        ))),
    }
}

/// MOVD/MOVQ: 32- or 64-bit transfer between a GPR or memory slot and
/// the low lane of an XMM register. Loading into the XMM register zeroes
/// everything above the transferred width.
pub(crate) fn handle_movd<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let value = exec.read_operand(&src)?;
    if dst.size == XMM_BITS {
        if !matches!(src.size, 32 | 64) {
            return Err(ExecError::Fault(Fault::InvalidOperand(
                "MOVD/MOVQ source must be 32 or 64 bits".to_string(),
            )));
        }
        exec.write_operand(&dst, exec.ops.zext(&value, XMM_BITS))?;
    } else if src.size == XMM_BITS {
        if !matches!(dst.size, 32 | 64) {
            return Err(ExecError::Fault(Fault::InvalidOperand(
                "MOVD/MOVQ destination must be 32 or 64 bits".to_string(),
            )));
        }
        exec.write_operand(&dst, exec.ops.extract(&value, dst.size - 1, 0))?;
    } else {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "MOVD/MOVQ needs an XMM register on one side".to_string(),
        )));
    }
    Ok(NextRip::Advance)
}

/// MOVDQA/MOVDQU: 128-bit move; the aligned form faults on a memory
/// operand not at a 16-byte boundary.
pub(crate) fn handle_movdq<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    aligned: bool,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    if dst.size != XMM_BITS || src.size != XMM_BITS {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "MOVDQ moves 128 bits".to_string(),
        )));
    }
    if aligned {
        for operand in [&dst, &src] {
            if let OperandKind::Memory(address) = operand.kind {
                if address % 16 != 0 {
                    return Err(ExecError::Fault(Fault::Memory(
                        crate::state::memory::MemoryError::UnalignedAccess(address, 16),
                    )));
                }
            }
        }
    }
    let value = exec.read_operand(&src)?;
    exec.write_operand(&dst, value)?;
    Ok(NextRip::Advance)
}

/// MOVLPD: 64-bit transfer into or out of the low quadword of an XMM
/// register; the high quadword of the register is preserved.
pub(crate) fn handle_movlpd<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let ops = exec.ops;
    if dst.size == XMM_BITS && src.size == 64 {
        let old = exec.read_operand(&dst)?;
        let low = exec.read_operand(&src)?;
        let merged = ops.concat(&ops.extract(&old, 127, 64), &low);
        exec.write_operand(&dst, merged)?;
    } else if dst.size == 64 && src.size == XMM_BITS {
        let value = exec.read_operand(&src)?;
        exec.write_operand(&dst, ops.extract(&value, 63, 0))?;
    } else {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "MOVLPD moves 64 bits to or from an XMM register".to_string(),
        )));
    }
    Ok(NextRip::Advance)
}

/// The whole-register bitwise family (also serves XORPS, which is the
/// same bit transform).
fn bitwise<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    op: fn(&Operators<'ctx>, &Value<'ctx>, &Value<'ctx>) -> Value<'ctx>,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let a = exec.read_operand(&dst)?;
    let b = exec.read_operand(&src)?;
    let result = op(&exec.ops, &a, &b);
    exec.write_operand(&dst, result)?;
    Ok(NextRip::Advance)
}

pub(crate) fn handle_pxor<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    bitwise(exec, inst, Operators::xor)
}

pub(crate) fn handle_por<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    bitwise(exec, inst, Operators::or)
}

pub(crate) fn handle_pand<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    bitwise(exec, inst, Operators::and)
}

/// PANDN: `(!dst) & src`.
pub(crate) fn handle_pandn<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    bitwise(exec, inst, |ops, a, b| ops.and(&ops.not(a), b))
}

/// PCMPEQB: each byte lane becomes 0xFF where equal, 0 where not.
pub(crate) fn handle_pcmpeqb<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let a = exec.read_operand(&dst)?;
    let b = exec.read_operand(&src)?;
    let ops = exec.ops;
    let ones = Value::from_u64(0xff, 8);
    let zero = Value::from_u64(0, 8);
    let lanes: Vec<Value<'ctx>> = (0..BYTE_LANES)
        .map(|i| {
            let equal = ops.eq(&lane(&ops, &a, i, 8), &lane(&ops, &b, i, 8));
            ops.ite(&equal, &ones, &zero)
        })
        .collect();
    exec.write_operand(&dst, from_lanes(&ops, &lanes))?;
    Ok(NextRip::Advance)
}

/// PSHUFD: doubleword shuffle steered by the immediate's 2-bit fields.
pub(crate) fn handle_pshufd<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 3)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let order_op = exec.fetch_operand(&inst.operands[2])?;
    let order = exec.read_operand_concrete(&order_op)?;
    let value = exec.read_operand(&src)?;
    let ops = exec.ops;
    let lanes: Vec<Value<'ctx>> = (0..4)
        .map(|i| {
            let selector = ((order >> (2 * i)) & 0x3) as u32;
            lane(&ops, &value, selector, 32)
        })
        .collect();
    exec.write_operand(&dst, from_lanes(&ops, &lanes))?;
    Ok(NextRip::Advance)
}

fn unpack_low<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
    lane_bits: u32,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let a = exec.read_operand(&dst)?;
    let b = exec.read_operand(&src)?;
    let ops = exec.ops;
    let half = XMM_BITS / lane_bits / 2;
    let mut lanes = Vec::with_capacity((half * 2) as usize);
    for i in 0..half {
        lanes.push(lane(&ops, &a, i, lane_bits));
        lanes.push(lane(&ops, &b, i, lane_bits));
    }
    exec.write_operand(&dst, from_lanes(&ops, &lanes))?;
    Ok(NextRip::Advance)
}

/// PUNPCKLBW: interleave the low eight byte lanes of both operands.
pub(crate) fn handle_punpcklbw<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    unpack_low(exec, inst, 8)
}

/// PUNPCKLWD: interleave the low four word lanes of both operands.
pub(crate) fn handle_punpcklwd<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    unpack_low(exec, inst, 16)
}

/// PMOVMSKB: the byte-lane sign bits gathered into the low bits of a
/// general-purpose destination, upper bits zeroed.
pub(crate) fn handle_pmovmskb<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    if src.size != XMM_BITS || !matches!(dst.size, 32 | 64) {
        return Err(ExecError::Fault(Fault::InvalidOperand(
            "PMOVMSKB reads an XMM register into a GPR".to_string(),
        )));
    }
    let value = exec.read_operand(&src)?;
    let ops = exec.ops;
    let mut mask = ops.msb(&lane(&ops, &value, BYTE_LANES - 1, 8));
    for i in (0..BYTE_LANES - 1).rev() {
        mask = ops.concat(&mask, &ops.msb(&lane(&ops, &value, i, 8)));
    }
    exec.write_operand(&dst, ops.zext(&mask, dst.size))?;
    Ok(NextRip::Advance)
}

/// PMINUB: unsigned byte-lane minimum.
pub(crate) fn handle_pminub<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 2)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let a = exec.read_operand(&dst)?;
    let b = exec.read_operand(&src)?;
    let ops = exec.ops;
    let lanes: Vec<Value<'ctx>> = (0..BYTE_LANES)
        .map(|i| {
            let x = lane(&ops, &a, i, 8);
            let y = lane(&ops, &b, i, 8);
            ops.ite(&ops.ult(&x, &y), &x, &y)
        })
        .collect();
    exec.write_operand(&dst, from_lanes(&ops, &lanes))?;
    Ok(NextRip::Advance)
}

/// VPXOR: three-operand VEX xor; the destination's upper YMM lane is
/// zeroed.
pub(crate) fn handle_vpxor<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 3)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let first = exec.fetch_operand(&inst.operands[1])?;
    let second = exec.fetch_operand(&inst.operands[2])?;
    let shadow = ymm_shadow(&dst)?;
    let a = exec.read_operand(&first)?;
    let b = exec.read_operand(&second)?;
    let result = exec.ops.xor(&a, &b);
    let widened = exec.ops.zext(&result, 256);
    exec.write_reg(&shadow, widened)?;
    Ok(NextRip::Advance)
}

/// VPSHUFB: byte shuffle steered by the mask operand. A mask byte with
/// bit 7 set clears the lane; otherwise its low nibble selects a source
/// byte. A symbolic mask byte turns the selection into an if-then-else
/// chain rather than demanding concretization.
pub(crate) fn handle_vpshufb<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 3)?;
    let dst = exec.fetch_operand(&inst.operands[0])?;
    let src = exec.fetch_operand(&inst.operands[1])?;
    let mask_op = exec.fetch_operand(&inst.operands[2])?;
    let shadow = ymm_shadow(&dst)?;
    let value = exec.read_operand(&src)?;
    let mask = exec.read_operand(&mask_op)?;
    let ops = exec.ops;
    let zero = Value::from_u64(0, 8);
    let lanes: Vec<Value<'ctx>> = (0..BYTE_LANES)
        .map(|i| {
            let mask_byte = lane(&ops, &mask, i, 8);
            match mask_byte.as_concrete_u64() {
                Some(m) if m & 0x80 != 0 => zero.clone(),
                Some(m) => lane(&ops, &value, (m & 0x0f) as u32, 8),
                None => {
                    let selector = ops.and(&mask_byte, &Value::from_u64(0x0f, 8));
                    let mut selected = zero.clone();
                    for j in 0..BYTE_LANES {
                        let hit = ops.eq(&selector, &Value::from_u64(j as u64, 8));
                        selected = ops.ite(&hit, &lane(&ops, &value, j, 8), &selected);
                    }
                    ops.ite(&ops.bit(&mask_byte, 7), &zero, &selected)
                }
            }
        })
        .collect();
    let result = from_lanes(&ops, &lanes);
    exec.write_reg(&shadow, ops.zext(&result, 256))?;
    Ok(NextRip::Advance)
}

/// VZEROUPPER: clears bits 255:128 of every YMM register.
pub(crate) fn handle_vzeroupper<'ctx, M: MemoryBackend<'ctx>>(
    exec: &mut CpuExecutor<'ctx, M>,
    inst: &Inst,
) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
    expect_operands(inst, 0)?;
    let ops = exec.ops;
    for i in 0..16 {
        let name = format!("YMM{}", i);
        let value = exec.read_reg(&name)?;
        let low = ops.extract(&value, 127, 0);
        exec.write_reg(&name, ops.zext(&low, 256))?;
    }
    Ok(NextRip::Advance)
}
