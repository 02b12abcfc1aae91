use danica::concolic::executor::{ConcretizeTarget, StepError};
use danica::concolic::SymbolicVar;
use danica::instruction::{Inst, Mnemonic, OperandDesc};
use danica::state::memory::MemoryBackend;
use danica::{CpuExecutor, SymbolicMemory, Value};
use z3::ast::{Ast, Bool, BV};
use z3::{Config, Context, SatResult};

fn setup_executor() -> CpuExecutor<'static, SymbolicMemory<'static>> {
    let cfg = Config::new();
    let ctx = Box::leak(Box::new(Context::new(&cfg)));
    let memory = SymbolicMemory::new(ctx);
    CpuExecutor::new(ctx, memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Binds a register to a fresh symbolic variable and pins it to a
    /// concrete value through the constraint set, the way a symbolic run
    /// expresses a known initial state.
    fn pin_register(
        exec: &mut CpuExecutor<'static, SymbolicMemory<'static>>,
        name: &str,
        pinned: u64,
    ) -> BV<'static> {
        let var = BV::new_const(exec.ctx, format!("{}_0", name.to_lowercase()).as_str(), 64);
        exec.cpu
            .set(name, Value::Symbolic(SymbolicVar::Int(var.clone())))
            .unwrap();
        exec.constraints
            .assert(&var._eq(&BV::from_u64(exec.ctx, pinned, 64)));
        var
    }

    fn register_bv(
        exec: &CpuExecutor<'static, SymbolicMemory<'static>>,
        name: &str,
    ) -> BV<'static> {
        let value = exec.cpu.get(name).unwrap();
        exec.ops.to_bv(&value)
    }

    /// The equivalence contract: with every input pinned to one value,
    /// "final state equals the concrete result" must be satisfiable and
    /// "final state differs" must not.
    #[test]
    fn test_concrete_symbolic_equivalence_for_add() {
        let mut exec = setup_executor();
        pin_register(&mut exec, "RAX", 5);
        exec.cpu.set("RBX", Value::from_u64(7, 64)).unwrap();

        let inst = Inst::new(
            Mnemonic::Add,
            vec![OperandDesc::reg("RAX"), OperandDesc::reg("RBX")],
            3,
        );
        exec.execute(&inst).unwrap();

        let result = register_bv(&exec, "RAX");
        let expected = BV::from_u64(exec.ctx, 12, 64);
        assert!(exec.constraints.is_feasible(&result._eq(&expected)));
        assert!(!exec.constraints.is_feasible(&result._eq(&expected).not()));
    }

    #[test]
    fn test_symbolic_flags_track_the_operation() {
        let mut exec = setup_executor();
        pin_register(&mut exec, "RAX", u64::MAX);

        let inst = Inst::new(
            Mnemonic::Add,
            vec![OperandDesc::reg("RAX"), OperandDesc::imm(1, 32)],
            4,
        );
        exec.execute(&inst).unwrap();

        // The carry flag is a symbolic expression pinned to true by the
        // input constraint.
        let cf = exec.cpu.get_flag(danica::state::flags::Flag::CF);
        assert!(cf.is_symbolic(), "flags stay unresolved expressions");
        let cf_bool = exec.ops.to_bool(&cf);
        assert!(exec.constraints.is_feasible(&cf_bool));
        assert!(!exec.constraints.is_feasible(&cf_bool.not()));
    }

    /// A symbolic value with exactly one satisfying assignment resolves
    /// through the step loop and the instruction completes.
    #[test]
    fn test_step_resolves_unique_candidate() {
        let mut exec = setup_executor();
        exec.cpu.set("RBX", Value::from_u64(1, 64)).unwrap();
        pin_register(&mut exec, "RCX", 4);

        // The shift count lives in CL and must be concrete.
        let inst = Inst::new(
            Mnemonic::Shl,
            vec![OperandDesc::reg("RBX"), OperandDesc::reg("CL")],
            3,
        );
        exec.step(&inst).unwrap();

        assert_eq!(exec.cpu.get("RBX").unwrap().as_concrete_u64(), Some(0x10));
        // The rebind wrote the concrete value back.
        assert_eq!(exec.cpu.get("CL").unwrap().as_concrete_u64(), Some(4));
    }

    /// Two satisfying assignments: the core refuses to choose and hands
    /// both to the exploration layer.
    #[test]
    fn test_step_surfaces_multiple_candidates() {
        let mut exec = setup_executor();
        exec.cpu.set("RBX", Value::from_u64(1, 64)).unwrap();
        let var = BV::new_const(exec.ctx, "rcx_0", 64);
        exec.cpu
            .set("RCX", Value::Symbolic(SymbolicVar::Int(var.clone())))
            .unwrap();
        let one = var._eq(&BV::from_u64(exec.ctx, 1, 64));
        let two = var._eq(&BV::from_u64(exec.ctx, 2, 64));
        exec.constraints.assert(&Bool::or(exec.ctx, &[&one, &two]));

        let inst = Inst::new(
            Mnemonic::Shl,
            vec![OperandDesc::reg("RBX"), OperandDesc::reg("CL")],
            3,
        );
        match exec.step(&inst) {
            Err(StepError::MultipleCandidates { request, mut candidates }) => {
                assert!(matches!(request.target, ConcretizeTarget::Register("CL")));
                candidates.sort_unstable();
                assert_eq!(candidates, vec![1, 2]);
            }
            other => panic!("expected candidate fan-out, got {:?}", other.err()),
        }
        // Nothing was committed: the instruction is still retryable.
        assert_eq!(exec.cpu.get("RBX").unwrap().as_concrete_u64(), Some(1));
    }

    /// Branch predicates concretize per involved flag.
    #[test]
    fn test_jcc_concretizes_symbolic_flag() {
        let mut exec = setup_executor();
        exec.cpu.set_rip(Value::from_u64(0x401000, 64));
        let zf = Bool::new_const(exec.ctx, "zf_0");
        exec.cpu.set_flag(
            danica::state::flags::Flag::ZF,
            Value::Symbolic(SymbolicVar::Bool(zf.clone())),
        );
        exec.constraints.assert(&zf);

        let inst = Inst::new(
            Mnemonic::Jcc(danica::state::flags::Cond::E),
            vec![OperandDesc::imm(0x405000, 64)],
            6,
        );
        exec.step(&inst).unwrap();
        assert_eq!(exec.cpu.get("RIP").unwrap().as_concrete_u64(), Some(0x405000));
        // The flag was rebound to its only satisfying value.
        assert_eq!(
            exec.cpu
                .get_flag(danica::state::flags::Flag::ZF)
                .as_concrete_bool(),
            Some(true)
        );
    }

    /// Symbolic data flows through memory unresolved; pinning the input
    /// afterwards pins the copy.
    #[test]
    fn test_symbolic_data_moves_through_memory() {
        let mut exec = setup_executor();
        exec.memory.mmap(0x30000, 0x1000, "rw-").unwrap();
        let cells = exec
            .memory
            .write_fresh_symbolic(0x30000, 8, "input")
            .unwrap();

        exec.cpu.set("RSI", Value::from_u64(0x30000, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Mov,
            vec![OperandDesc::reg("RAX"), OperandDesc::mem("RSI", 0, 64)],
            3,
        );
        exec.execute(&inst).unwrap();
        assert!(exec.cpu.get("RAX").unwrap().is_symbolic());

        // Pin every input byte and check the copy is forced.
        for (i, cell) in cells.iter().enumerate() {
            exec.constraints
                .assert(&cell._eq(&BV::from_u64(exec.ctx, i as u64, 8)));
        }
        let rax = register_bv(&exec, "RAX");
        let expected = BV::from_u64(exec.ctx, 0x0706_0504_0302_0100, 64);
        assert!(exec.constraints.is_feasible(&rax._eq(&expected)));
        assert!(!exec.constraints.is_feasible(&rax._eq(&expected).not()));
    }

    /// Division with a symbolic low half stays symbolic; the fault
    /// predicates only demanded the divisor and the high half.
    #[test]
    fn test_div_with_symbolic_dividend_low() {
        let mut exec = setup_executor();
        exec.cpu.set("RDX", Value::from_u64(0, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(0x3f3, 64)).unwrap();
        pin_register(&mut exec, "RAX", 0x3de00ec7);

        let inst = Inst::new(Mnemonic::Div, vec![OperandDesc::reg("RCX")], 3);
        exec.execute(&inst).unwrap();

        let quotient = register_bv(&exec, "RAX");
        let remainder = register_bv(&exec, "RDX");
        let q_expected = BV::from_u64(exec.ctx, 0xfaaef, 64);
        let r_expected = BV::from_u64(exec.ctx, 0xea, 64);
        assert!(exec.constraints.is_feasible(&q_expected._eq(&quotient)));
        assert!(!exec.constraints.is_feasible(&q_expected._eq(&quotient).not()));
        assert!(!exec.constraints.is_feasible(&r_expected._eq(&remainder).not()));
    }

    /// The scoped trial mode: hypotheses vanish when the scope closes.
    #[test]
    fn test_constraint_scopes_are_transactional() {
        let exec = setup_executor();
        let var = BV::new_const(exec.ctx, "x", 8);
        exec.constraints
            .assert(&var.bvugt(&BV::from_u64(exec.ctx, 10, 8)));

        let contradiction = var._eq(&BV::from_u64(exec.ctx, 3, 8));
        exec.constraints.with_scope(|scope| {
            scope.assert(&contradiction);
            assert_eq!(scope.check(), SatResult::Unsat);
        });
        assert_eq!(exec.constraints.check(), SatResult::Sat);
    }

    #[test]
    fn test_get_all_values_enumerates_and_bounds() {
        let exec = setup_executor();
        let var = BV::new_const(exec.ctx, "x", 8);
        exec.constraints
            .assert(&var.bvult(&BV::from_u64(exec.ctx, 3, 8)));

        let mut values = exec.constraints.get_all_values(&var, 16);
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2]);

        let bounded = exec.constraints.get_all_values(&var, 2);
        assert_eq!(bounded.len(), 2, "enumeration respects the limit");
    }
}
