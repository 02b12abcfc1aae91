//! The CPU executor: one decoded instruction in, exact architectural
//! effects out.
//!
//! Each `execute` call runs the fetch-operands → compute → write-back →
//! advance-RIP machine once. A handler that needs a concrete value where
//! the state only holds a symbolic one returns
//! [`ExecError::Concretize`]; [`CpuExecutor::step`] services those
//! requests against the constraint set and retries the instruction.
//! Handlers never mutate architectural state before their last possible
//! concretization raise, so the retry is sound.

use std::error::Error;
use std::fmt;

use log::trace;
use z3::ast::{Ast, BV};
use z3::Context;

use crate::instruction::{Inst, Mnemonic, OperandDesc};
use crate::state::cpu_state::{lookup_alias, CpuState, RegAlias};
use crate::state::flags::Flag;
use crate::state::memory::{MemoryBackend, MemoryError};

use super::{
    executor_arith, executor_flow, executor_mov, executor_shift, executor_string, executor_vector,
    ConstraintSet, Operators, Value,
};

/// Hard failures: the instruction aborts and nothing retries it.
#[derive(Debug)]
pub enum Fault {
    Memory(MemoryError),
    DivideByZero,
    DivideOverflow,
    InvalidOperand(String),
    MissingHandler(String),
    /// A concretization rebind found no satisfying value at all.
    Unsatisfiable(String),
}

impl Error for Fault {}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Memory(err) => write!(f, "memory fault: {}", err),
            Fault::DivideByZero => write!(f, "divide error: zero divisor"),
            Fault::DivideOverflow => write!(f, "divide error: quotient overflow"),
            Fault::InvalidOperand(msg) => write!(f, "invalid operand: {}", msg),
            Fault::MissingHandler(msg) => write!(f, "no semantic handler for {}", msg),
            Fault::Unsatisfiable(msg) => write!(f, "unsatisfiable state: {}", msg),
        }
    }
}

impl From<MemoryError> for Fault {
    fn from(err: MemoryError) -> Self {
        Fault::Memory(err)
    }
}

/// What a concretization request identifies: a register (by alias name),
/// the value stored at a known concrete address, or an address expression
/// that is itself symbolic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcretizeTarget {
    Register(&'static str),
    MemoryValue(u64),
    Address,
}

/// The recoverable control signal: `expr` is the symbolic expression the
/// caller should enumerate against the constraint set before rebinding
/// `target` and retrying the instruction.
#[derive(Debug)]
pub struct ConcretizeRequest<'ctx> {
    pub target: ConcretizeTarget,
    pub expr: BV<'ctx>,
}

#[derive(Debug)]
pub enum ExecError<'ctx> {
    Fault(Fault),
    Concretize(ConcretizeRequest<'ctx>),
}

impl fmt::Display for ExecError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Fault(fault) => write!(f, "{}", fault),
            ExecError::Concretize(req) => {
                write!(f, "concretization required for {:?}", req.target)
            }
        }
    }
}

impl From<Fault> for ExecError<'_> {
    fn from(fault: Fault) -> Self {
        ExecError::Fault(fault)
    }
}

impl From<MemoryError> for ExecError<'_> {
    fn from(err: MemoryError) -> Self {
        ExecError::Fault(Fault::Memory(err))
    }
}

/// Result of the solve-and-retry loop in [`CpuExecutor::step`].
#[derive(Debug)]
pub enum StepError<'ctx> {
    Fault(Fault),
    /// The request admits several values; forking per candidate belongs
    /// to the external exploration layer, not this core.
    MultipleCandidates {
        request: ConcretizeRequest<'ctx>,
        candidates: Vec<u64>,
    },
}

impl fmt::Display for StepError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Fault(fault) => write!(f, "{}", fault),
            StepError::MultipleCandidates { request, candidates } => write!(
                f,
                "{:?} admits {} candidate values",
                request.target,
                candidates.len()
            ),
        }
    }
}

/// How RIP moves after a handler: sequentially, or to a (possibly still
/// symbolic) target.
pub enum NextRip<'ctx> {
    Advance,
    Jump(Value<'ctx>),
}

/// A transient, per-execution operand handle with a fixed bit width.
/// Memory operands carry their already-resolved effective address, so a
/// retried instruction recomputes it from scratch.
#[derive(Debug, Clone)]
pub struct Operand {
    pub kind: OperandKind,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub enum OperandKind {
    Register(&'static RegAlias),
    Memory(u64),
    Immediate(u64),
}

pub struct CpuExecutor<'ctx, M: MemoryBackend<'ctx>> {
    pub ctx: &'ctx Context,
    pub ops: Operators<'ctx>,
    pub cpu: CpuState<'ctx>,
    pub memory: M,
    pub constraints: ConstraintSet<'ctx>,
    pub instruction_counter: u64,
}

/// Candidate cap for the step loop; past this many the ambiguity is
/// reported without further enumeration.
const CANDIDATE_LIMIT: usize = 16;

impl<'ctx, M: MemoryBackend<'ctx>> CpuExecutor<'ctx, M> {
    pub fn new(ctx: &'ctx Context, memory: M) -> Self {
        CpuExecutor {
            ctx,
            ops: Operators::new(ctx),
            cpu: CpuState::new(ctx),
            memory,
            constraints: ConstraintSet::new(ctx),
            instruction_counter: 0,
        }
    }

    /// Advances by exactly one instruction, or faults, or raises a
    /// concretization request without having touched any state.
    pub fn execute(&mut self, inst: &Inst) -> Result<(), ExecError<'ctx>> {
        trace!(
            "#{} executing {:?} ({} operands)",
            self.instruction_counter,
            inst.mnemonic,
            inst.operands.len()
        );
        let next = self.dispatch(inst)?;
        match next {
            NextRip::Advance => {
                let advanced = self
                    .ops
                    .add(&self.cpu.rip(), &Value::from_u64(inst.length, 64));
                self.cpu.set_rip(advanced);
            }
            NextRip::Jump(target) => {
                let target = self.ops.resize(&target, 64);
                self.cpu.set_rip(target);
            }
        }
        self.instruction_counter += 1;
        Ok(())
    }

    /// The solve-and-retry loop around [`CpuExecutor::execute`]: a
    /// concretization request with exactly one satisfying value is bound
    /// and the instruction re-runs; several satisfying values are handed
    /// back for the exploration layer to fork on.
    pub fn step(&mut self, inst: &Inst) -> Result<(), StepError<'ctx>> {
        loop {
            match self.execute(inst) {
                Ok(()) => return Ok(()),
                Err(ExecError::Fault(fault)) => return Err(StepError::Fault(fault)),
                Err(ExecError::Concretize(request)) => {
                    let candidates = self.constraints.get_all_values(&request.expr, CANDIDATE_LIMIT);
                    trace!(
                        "concretizing {:?}: {} candidate(s)",
                        request.target,
                        candidates.len()
                    );
                    match candidates.as_slice() {
                        [] => {
                            return Err(StepError::Fault(Fault::Unsatisfiable(format!(
                                "{:?} has no satisfying value",
                                request.target
                            ))))
                        }
                        [value] => {
                            self.rebind(&request, *value)
                                .map_err(StepError::Fault)?;
                        }
                        _ => {
                            return Err(StepError::MultipleCandidates {
                                request,
                                candidates,
                            })
                        }
                    }
                }
            }
        }
    }

    /// Pins `request.expr` to `value` in the constraint set and writes
    /// the concrete value back into the identified register or memory
    /// location, so the retry sees it resolved.
    fn rebind(&mut self, request: &ConcretizeRequest<'ctx>, value: u64) -> Result<(), Fault> {
        let size = request.expr.get_size();
        let pinned = request.expr._eq(&BV::from_u64(self.ctx, value, size));
        self.constraints.assert(&pinned);
        match request.target {
            ConcretizeTarget::Register(name) => self
                .cpu
                .set(name, Value::from_u64(value, size))
                .map_err(|err| Fault::InvalidOperand(err.to_string())),
            ConcretizeTarget::MemoryValue(address) => self
                .memory
                .write_value(address, &Value::from_u64(value, size))
                .map_err(Fault::Memory),
            // The assertion alone pins a symbolic address; the next
            // resolution finds the single candidate.
            ConcretizeTarget::Address => Ok(()),
        }
    }

    fn dispatch(&mut self, inst: &Inst) -> Result<NextRip<'ctx>, ExecError<'ctx>> {
        match &inst.mnemonic {
            Mnemonic::Mov | Mnemonic::Movabs => executor_mov::handle_mov(self, inst),
            Mnemonic::Movzx => executor_mov::handle_movzx(self, inst),
            Mnemonic::Movsx | Mnemonic::Movsxd => executor_mov::handle_movsx(self, inst),
            Mnemonic::Lea => executor_mov::handle_lea(self, inst),
            Mnemonic::Xchg => executor_mov::handle_xchg(self, inst),
            Mnemonic::Nop => Ok(NextRip::Advance),
            Mnemonic::Cmovcc(cond) => executor_mov::handle_cmovcc(self, inst, *cond),
            Mnemonic::Setcc(cond) => executor_mov::handle_setcc(self, inst, *cond),

            Mnemonic::Add => executor_arith::handle_add(self, inst),
            Mnemonic::Adc => executor_arith::handle_adc(self, inst),
            Mnemonic::Sub => executor_arith::handle_sub(self, inst),
            Mnemonic::Sbb => executor_arith::handle_sbb(self, inst),
            Mnemonic::Cmp => executor_arith::handle_cmp(self, inst),
            Mnemonic::And => executor_arith::handle_and(self, inst),
            Mnemonic::Or => executor_arith::handle_or(self, inst),
            Mnemonic::Xor => executor_arith::handle_xor(self, inst),
            Mnemonic::Test => executor_arith::handle_test(self, inst),
            Mnemonic::Inc => executor_arith::handle_inc(self, inst),
            Mnemonic::Dec => executor_arith::handle_dec(self, inst),
            Mnemonic::Neg => executor_arith::handle_neg(self, inst),
            Mnemonic::Not => executor_arith::handle_not(self, inst),
            Mnemonic::Cbw | Mnemonic::Cwde | Mnemonic::Cdqe => {
                executor_arith::handle_sign_extend_acc(self, inst)
            }
            Mnemonic::Cwd | Mnemonic::Cdq | Mnemonic::Cqo => {
                executor_arith::handle_sign_split_acc(self, inst)
            }
            Mnemonic::Mul => executor_arith::handle_mul(self, inst),
            Mnemonic::Imul => executor_arith::handle_imul(self, inst),
            Mnemonic::Div => executor_arith::handle_div(self, inst),
            Mnemonic::Idiv => executor_arith::handle_idiv(self, inst),
            Mnemonic::Cmpxchg => executor_arith::handle_cmpxchg(self, inst),
            Mnemonic::Cmpxchg8b => executor_arith::handle_cmpxchg8b(self, inst),

            Mnemonic::Shl => executor_shift::handle_shl(self, inst),
            Mnemonic::Shr => executor_shift::handle_shr(self, inst),
            Mnemonic::Sar => executor_shift::handle_sar(self, inst),
            Mnemonic::Rol => executor_shift::handle_rol(self, inst),
            Mnemonic::Ror => executor_shift::handle_ror(self, inst),
            Mnemonic::Shlx => executor_shift::handle_shlx(self, inst),
            Mnemonic::Bsf => executor_shift::handle_bsf(self, inst),
            Mnemonic::Bsr => executor_shift::handle_bsr(self, inst),

            Mnemonic::Movs(width) => executor_string::handle_movs(self, inst, *width),
            Mnemonic::Stos(width) => executor_string::handle_stos(self, inst, *width),
            Mnemonic::Scas(width) => executor_string::handle_scas(self, inst, *width),
            Mnemonic::Cmps(width) => executor_string::handle_cmps(self, inst, *width),
            Mnemonic::Lods(width) => executor_string::handle_lods(self, inst, *width),

            Mnemonic::Push => executor_flow::handle_push(self, inst),
            Mnemonic::Pop => executor_flow::handle_pop(self, inst),
            Mnemonic::Call => executor_flow::handle_call(self, inst),
            Mnemonic::Ret => executor_flow::handle_ret(self, inst),
            Mnemonic::Jmp => executor_flow::handle_jmp(self, inst),
            Mnemonic::Jcc(cond) => executor_flow::handle_jcc(self, inst, *cond),
            Mnemonic::Leave => executor_flow::handle_leave(self, inst),

            Mnemonic::Movd | Mnemonic::Movq => executor_vector::handle_movd(self, inst),
            Mnemonic::Movdqa => executor_vector::handle_movdq(self, inst, true),
            Mnemonic::Movdqu => executor_vector::handle_movdq(self, inst, false),
            Mnemonic::Movlpd => executor_vector::handle_movlpd(self, inst),
            Mnemonic::Pxor => executor_vector::handle_pxor(self, inst),
            Mnemonic::Por => executor_vector::handle_por(self, inst),
            Mnemonic::Pand => executor_vector::handle_pand(self, inst),
            Mnemonic::Pandn => executor_vector::handle_pandn(self, inst),
            Mnemonic::Pcmpeqb => executor_vector::handle_pcmpeqb(self, inst),
            Mnemonic::Pshufd => executor_vector::handle_pshufd(self, inst),
            Mnemonic::Punpcklbw => executor_vector::handle_punpcklbw(self, inst),
            Mnemonic::Punpcklwd => executor_vector::handle_punpcklwd(self, inst),
            Mnemonic::Pmovmskb => executor_vector::handle_pmovmskb(self, inst),
            Mnemonic::Pminub => executor_vector::handle_pminub(self, inst),
            Mnemonic::Vpxor => executor_vector::handle_vpxor(self, inst),
            Mnemonic::Vpshufb => executor_vector::handle_vpshufb(self, inst),
            Mnemonic::Xorps => executor_vector::handle_pxor(self, inst),
            Mnemonic::Vzeroupper => executor_vector::handle_vzeroupper(self, inst),

            Mnemonic::Other(name) => {
                Err(ExecError::Fault(Fault::MissingHandler(name.clone())))
            }
        }
    }

    // ---- operand abstraction -------------------------------------------

    /// Resolves a decoder operand descriptor into a transient handle.
    /// Memory operands get their effective address computed (and, where
    /// symbolic, resolved) here, in the fetch phase.
    pub fn fetch_operand(&self, desc: &OperandDesc) -> Result<Operand, ExecError<'ctx>> {
        match desc {
            OperandDesc::Register(name) => {
                let alias = lookup_alias(name).ok_or_else(|| {
                    ExecError::Fault(Fault::InvalidOperand(format!("unknown register {}", name)))
                })?;
                Ok(Operand {
                    kind: OperandKind::Register(alias),
                    size: alias.width,
                })
            }
            OperandDesc::Memory { size, .. } => {
                let ea = self.effective_address(desc)?;
                let address =
                    self.memory
                        .resolve_address(&ea, (*size as usize + 7) / 8, &self.constraints)?;
                Ok(Operand {
                    kind: OperandKind::Memory(address),
                    size: *size,
                })
            }
            OperandDesc::Immediate { value, size } => Ok(Operand {
                kind: OperandKind::Immediate(*value as u64),
                size: *size,
            }),
        }
    }

    /// Computes `base + index*scale + displacement` as a 64-bit value,
    /// without dereferencing or resolving it (LEA wants it raw).
    pub fn effective_address(&self, desc: &OperandDesc) -> Result<Value<'ctx>, ExecError<'ctx>> {
        let (base, index, scale, displacement) = match desc {
            OperandDesc::Memory {
                base,
                index,
                scale,
                displacement,
                ..
            } => (base, index, scale, displacement),
            _ => {
                return Err(ExecError::Fault(Fault::InvalidOperand(
                    "effective address of a non-memory operand".to_string(),
                )))
            }
        };
        let mut ea = Value::from_u64(*displacement as u64, 64);
        if let Some(name) = base {
            let value = self.read_reg(name)?;
            ea = self.ops.add(&ea, &self.ops.resize(&value, 64));
        }
        if let Some(name) = index {
            let value = self.read_reg(name)?;
            let scaled = self.ops.mul(
                &self.ops.resize(&value, 64),
                &Value::from_u64(*scale as u64, 64),
            );
            ea = self.ops.add(&ea, &scaled);
        }
        Ok(ea)
    }

    /// `read()` of the operand contract: yields a value of exactly the
    /// operand's width.
    pub fn read_operand(&self, operand: &Operand) -> Result<Value<'ctx>, ExecError<'ctx>> {
        match &operand.kind {
            OperandKind::Register(alias) => Ok(self.cpu.get_alias(alias)),
            OperandKind::Memory(address) => {
                Ok(self.memory.read_value(*address, operand.size)?)
            }
            OperandKind::Immediate(value) => Ok(Value::from_u64(*value, operand.size)),
        }
    }

    /// `write(v)` of the operand contract: truncates to the operand's
    /// width before committing.
    pub fn write_operand(
        &mut self,
        operand: &Operand,
        value: Value<'ctx>,
    ) -> Result<(), ExecError<'ctx>> {
        let value = self.ops.resize(&value, operand.size);
        match &operand.kind {
            OperandKind::Register(alias) => {
                self.cpu.set_alias(alias, value);
                Ok(())
            }
            OperandKind::Memory(address) => Ok(self.memory.write_value(*address, &value)?),
            OperandKind::Immediate(_) => Err(ExecError::Fault(Fault::InvalidOperand(
                "write to an immediate operand".to_string(),
            ))),
        }
    }

    // ---- concretization helpers ----------------------------------------

    /// The identifier a concretization request should carry for this
    /// operand.
    pub fn operand_target(&self, operand: &Operand) -> ConcretizeTarget {
        match &operand.kind {
            OperandKind::Register(alias) => ConcretizeTarget::Register(alias.name),
            OperandKind::Memory(address) => ConcretizeTarget::MemoryValue(*address),
            OperandKind::Immediate(_) => ConcretizeTarget::Address,
        }
    }

    /// Demands a concrete value, raising a concretization request
    /// identifying `target` when it is symbolic.
    pub fn require_concrete(
        &self,
        value: &Value<'ctx>,
        target: ConcretizeTarget,
    ) -> Result<u64, ExecError<'ctx>> {
        match value.as_concrete_u64() {
            Some(v) => Ok(v),
            None => Err(ExecError::Concretize(ConcretizeRequest {
                target,
                expr: self.ops.to_bv(value),
            })),
        }
    }

    /// Reads an operand and demands the result concrete.
    pub fn read_operand_concrete(&self, operand: &Operand) -> Result<u64, ExecError<'ctx>> {
        let value = self.read_operand(operand)?;
        self.require_concrete(&value, self.operand_target(operand))
    }

    pub fn read_reg(&self, name: &str) -> Result<Value<'ctx>, ExecError<'ctx>> {
        self.cpu
            .get(name)
            .map_err(|err| ExecError::Fault(Fault::InvalidOperand(err.to_string())))
    }

    pub fn write_reg(&mut self, name: &str, value: Value<'ctx>) -> Result<(), ExecError<'ctx>> {
        self.cpu
            .set(name, value)
            .map_err(|err| ExecError::Fault(Fault::InvalidOperand(err.to_string())))
    }

    /// Reads a general-purpose register and demands it concrete.
    pub fn reg_u64(&self, name: &'static str) -> Result<u64, ExecError<'ctx>> {
        let value = self.read_reg(name)?;
        self.require_concrete(&value, ConcretizeTarget::Register(name))
    }

    /// Reads a flag and demands a concrete truth value, raising a
    /// register-identified request when the flag is symbolic.
    pub fn flag_concrete(&self, flag: Flag) -> Result<bool, ExecError<'ctx>> {
        let value = self.cpu.get_flag(flag);
        match value.as_concrete_bool() {
            Some(b) => Ok(b),
            None => Err(ExecError::Concretize(ConcretizeRequest {
                target: ConcretizeTarget::Register(flag.name()),
                expr: self.ops.to_bv(&value),
            })),
        }
    }
}

/// Validates the decoder-supplied operand count for a handler.
pub(crate) fn expect_operands<'ctx>(inst: &Inst, count: usize) -> Result<(), ExecError<'ctx>> {
    if inst.operands.len() != count {
        return Err(ExecError::Fault(Fault::InvalidOperand(format!(
            "{:?} expects {} operand(s), decoder supplied {}",
            inst.mnemonic,
            count,
            inst.operands.len()
        ))));
    }
    Ok(())
}

/// The accumulator alias for an operand width.
pub(crate) fn acc_name<'ctx>(size: u32) -> Result<&'static str, ExecError<'ctx>> {
    match size {
        8 => Ok("AL"),
        16 => Ok("AX"),
        32 => Ok("EAX"),
        64 => Ok("RAX"),
        _ => Err(ExecError::Fault(Fault::InvalidOperand(format!(
            "no accumulator form for {} bits",
            size
        )))),
    }
}

/// The high half of the accumulator pair (MUL/DIV families).
pub(crate) fn high_name<'ctx>(size: u32) -> Result<&'static str, ExecError<'ctx>> {
    match size {
        8 => Ok("AH"),
        16 => Ok("DX"),
        32 => Ok("EDX"),
        64 => Ok("RDX"),
        _ => Err(ExecError::Fault(Fault::InvalidOperand(format!(
            "no high register form for {} bits",
            size
        )))),
    }
}
