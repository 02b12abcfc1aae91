use danica::concolic::executor::{ExecError, Fault, StepError};
use danica::instruction::{Inst, Mnemonic, OperandDesc};
use danica::state::flags::Flag;
use danica::state::memory::MemoryBackend;
use danica::{ConcreteMemory, CpuExecutor, Value};
use z3::{Config, Context};

fn setup_executor() -> CpuExecutor<'static, ConcreteMemory<'static>> {
    let cfg = Config::new();
    let ctx = Box::leak(Box::new(Context::new(&cfg)));
    let memory = ConcreteMemory::new(ctx);
    CpuExecutor::new(ctx, memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(exec: &CpuExecutor<'static, ConcreteMemory<'static>>, flag: Flag) -> bool {
        exec.cpu
            .get_flag(flag)
            .as_concrete_bool()
            .expect("flag is concrete")
    }

    fn reg(exec: &CpuExecutor<'static, ConcreteMemory<'static>>, name: &str) -> u64 {
        exec.cpu
            .get(name)
            .unwrap()
            .as_concrete_u64()
            .expect("register is concrete")
    }

    /// The reference-trace vector: `add rcx, 1` with RCX = 0x7ffff7ba0aba
    /// and only PF set must produce RCX = 0x7ffff7ba0abb, advance RIP by
    /// the encoded length, clear AF/OF/ZF/CF/SF, and leave PF set.
    #[test]
    fn test_add_rcx_reference_trace() {
        let mut exec = setup_executor();
        exec.cpu.set("RCX", Value::from_u64(0x7ffff7ba0aba, 64)).unwrap();
        exec.cpu.set_rip(Value::from_u64(0x401000, 64));
        exec.cpu.set_flag(Flag::PF, Value::from_bool(true));

        let inst = Inst::new(
            Mnemonic::Add,
            vec![OperandDesc::reg("RCX"), OperandDesc::imm(1, 32)],
            4,
        );
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RCX"), 0x7ffff7ba0abb);
        assert_eq!(reg(&exec, "RIP"), 0x401004);
        assert!(!flag(&exec, Flag::AF));
        assert!(!flag(&exec, Flag::OF));
        assert!(!flag(&exec, Flag::ZF));
        assert!(!flag(&exec, Flag::CF));
        assert!(!flag(&exec, Flag::SF));
        assert!(flag(&exec, Flag::PF));
    }

    /// The reference-trace vector for unsigned division: RDX:RAX =
    /// 0:0x3de00ec7 divided by RCX = 0x3f3 leaves the quotient 0xfaaef
    /// in RAX and the remainder 0xea in RDX.
    #[test]
    fn test_div_rcx_reference_trace() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0x3de00ec7, 64)).unwrap();
        exec.cpu.set("RDX", Value::from_u64(0, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(0x3f3, 64)).unwrap();

        let inst = Inst::new(Mnemonic::Div, vec![OperandDesc::reg("RCX")], 3);
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), 0xfaaef);
        assert_eq!(reg(&exec, "RDX"), 0xea);
    }

    #[test]
    fn test_add_carry_and_overflow() {
        let mut exec = setup_executor();
        exec.cpu.set("AL", Value::from_u64(0x7f, 8)).unwrap();
        let inst = Inst::new(
            Mnemonic::Add,
            vec![OperandDesc::reg("AL"), OperandDesc::imm(1, 8)],
            2,
        );
        exec.execute(&inst).unwrap();

        // 0x7f + 1 = 0x80: signed overflow, no carry, nibble carry.
        assert_eq!(reg(&exec, "AL"), 0x80);
        assert!(flag(&exec, Flag::OF));
        assert!(!flag(&exec, Flag::CF));
        assert!(flag(&exec, Flag::AF));
        assert!(flag(&exec, Flag::SF));
        assert!(!flag(&exec, Flag::ZF));
    }

    #[test]
    fn test_sub_borrow_flags() {
        let mut exec = setup_executor();
        exec.cpu.set("AL", Value::from_u64(3, 8)).unwrap();
        let inst = Inst::new(
            Mnemonic::Sub,
            vec![OperandDesc::reg("AL"), OperandDesc::imm(5, 8)],
            2,
        );
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "AL"), 0xfe);
        assert!(flag(&exec, Flag::CF));
        assert!(flag(&exec, Flag::SF));
        assert!(!flag(&exec, Flag::OF));
        assert!(!flag(&exec, Flag::ZF));
        assert!(flag(&exec, Flag::AF));
    }

    #[test]
    fn test_adc_consumes_carry() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(u64::MAX, 64)).unwrap();
        exec.cpu.set_flag(Flag::CF, Value::from_bool(true));
        let inst = Inst::new(
            Mnemonic::Adc,
            vec![OperandDesc::reg("RAX"), OperandDesc::imm(0, 32)],
            4,
        );
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), 0);
        assert!(flag(&exec, Flag::CF));
        assert!(flag(&exec, Flag::ZF));
    }

    #[test]
    fn test_sbb_consumes_borrow() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(5, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(5, 64)).unwrap();
        exec.cpu.set_flag(Flag::CF, Value::from_bool(true));
        let inst = Inst::new(
            Mnemonic::Sbb,
            vec![OperandDesc::reg("RAX"), OperandDesc::reg("RBX")],
            3,
        );
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), u64::MAX);
        assert!(flag(&exec, Flag::CF));
        assert!(flag(&exec, Flag::SF));
    }

    #[test]
    fn test_inc_preserves_carry() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(u64::MAX, 64)).unwrap();
        exec.cpu.set_flag(Flag::CF, Value::from_bool(true));
        let inst = Inst::new(Mnemonic::Inc, vec![OperandDesc::reg("RAX")], 3);
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), 0);
        assert!(flag(&exec, Flag::CF), "INC must not touch CF");
        assert!(flag(&exec, Flag::ZF));
        assert!(flag(&exec, Flag::AF));
        assert!(!flag(&exec, Flag::OF));
    }

    #[test]
    fn test_dec_overflow_at_minimum() {
        let mut exec = setup_executor();
        exec.cpu.set("AL", Value::from_u64(0x80, 8)).unwrap();
        let inst = Inst::new(Mnemonic::Dec, vec![OperandDesc::reg("AL")], 2);
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "AL"), 0x7f);
        assert!(flag(&exec, Flag::OF));
        assert!(!flag(&exec, Flag::SF));
    }

    #[test]
    fn test_neg_sets_carry_for_nonzero() {
        let mut exec = setup_executor();
        exec.cpu.set("RBX", Value::from_u64(5, 64)).unwrap();
        let inst = Inst::new(Mnemonic::Neg, vec![OperandDesc::reg("RBX")], 3);
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RBX"), 5u64.wrapping_neg());
        assert!(flag(&exec, Flag::CF));

        exec.cpu.set("RBX", Value::from_u64(0, 64)).unwrap();
        let inst = Inst::new(Mnemonic::Neg, vec![OperandDesc::reg("RBX")], 3);
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RBX"), 0);
        assert!(!flag(&exec, Flag::CF));
        assert!(flag(&exec, Flag::ZF));
    }

    #[test]
    fn test_logic_clears_carry_and_overflow() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0xff00, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(0x0ff0, 64)).unwrap();
        exec.cpu.set_flag(Flag::CF, Value::from_bool(true));
        exec.cpu.set_flag(Flag::OF, Value::from_bool(true));
        let inst = Inst::new(
            Mnemonic::And,
            vec![OperandDesc::reg("RAX"), OperandDesc::reg("RBX")],
            3,
        );
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), 0x0f00);
        assert!(!flag(&exec, Flag::CF));
        assert!(!flag(&exec, Flag::OF));
        assert!(!flag(&exec, Flag::ZF));
        // 0x00 low byte: even parity.
        assert!(flag(&exec, Flag::PF));
    }

    #[test]
    fn test_test_does_not_write() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0xf0, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Test,
            vec![OperandDesc::reg("RAX"), OperandDesc::imm(0x0f, 32)],
            4,
        );
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), 0xf0, "TEST leaves the destination alone");
        assert!(flag(&exec, Flag::ZF));
    }

    #[test]
    fn test_not_touches_no_flags() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0, 64)).unwrap();
        exec.cpu.set_flag(Flag::ZF, Value::from_bool(true));
        let inst = Inst::new(Mnemonic::Not, vec![OperandDesc::reg("RAX")], 3);
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), u64::MAX);
        assert!(flag(&exec, Flag::ZF), "NOT must not touch flags");
    }

    #[test]
    fn test_mul_full_double_width_product() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(1 << 60, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(1 << 10, 64)).unwrap();
        let inst = Inst::new(Mnemonic::Mul, vec![OperandDesc::reg("RBX")], 3);
        exec.execute(&inst).unwrap();

        // 2^60 * 2^10 = 2^70 = high 2^6, low 0.
        assert_eq!(reg(&exec, "RAX"), 0);
        assert_eq!(reg(&exec, "RDX"), 1 << 6);
        assert!(flag(&exec, Flag::CF));
        assert!(flag(&exec, Flag::OF));
    }

    #[test]
    fn test_mul_byte_form_lands_in_ax() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0xffff_ffff_ffff_0040, 64)).unwrap();
        exec.cpu.set("BL", Value::from_u64(4, 8)).unwrap();
        let inst = Inst::new(Mnemonic::Mul, vec![OperandDesc::reg("BL")], 2);
        exec.execute(&inst).unwrap();

        // AL(0x40) * 4 = 0x100: AL = 0, AH = 1; bits 63:16 untouched.
        assert_eq!(reg(&exec, "AX"), 0x0100);
        assert_eq!(reg(&exec, "RAX") >> 16, 0xffff_ffff_ffff);
        assert!(flag(&exec, Flag::CF));
    }

    #[test]
    fn test_imul_two_operand_overflow() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(i64::MAX as u64, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(2, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Imul,
            vec![OperandDesc::reg("RAX"), OperandDesc::reg("RBX")],
            4,
        );
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), (i64::MAX as u64).wrapping_mul(2));
        assert!(flag(&exec, Flag::CF));
        assert!(flag(&exec, Flag::OF));
    }

    #[test]
    fn test_imul_three_operand_in_range() {
        let mut exec = setup_executor();
        exec.cpu.set("RBX", Value::from_u64(6, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Imul,
            vec![
                OperandDesc::reg("RAX"),
                OperandDesc::reg("RBX"),
                OperandDesc::imm(-7, 32),
            ],
            4,
        );
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), (-42i64) as u64);
        assert!(!flag(&exec, Flag::CF));
        assert!(!flag(&exec, Flag::OF));
    }

    #[test]
    fn test_imul_one_operand_signed() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64((-3i64) as u64, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(4, 64)).unwrap();
        let inst = Inst::new(Mnemonic::Imul, vec![OperandDesc::reg("RCX")], 3);
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), (-12i64) as u64);
        assert_eq!(reg(&exec, "RDX"), u64::MAX, "sign fill of the high half");
        assert!(!flag(&exec, Flag::CF), "product fits 64 bits");
    }

    #[test]
    fn test_div_by_zero_faults() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(1, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(0, 64)).unwrap();
        let inst = Inst::new(Mnemonic::Div, vec![OperandDesc::reg("RCX")], 3);
        match exec.execute(&inst) {
            Err(ExecError::Fault(Fault::DivideByZero)) => {}
            other => panic!("expected a divide fault, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_div_quotient_overflow_faults() {
        let mut exec = setup_executor();
        // RDX >= divisor: the quotient cannot fit 64 bits.
        exec.cpu.set("RDX", Value::from_u64(5, 64)).unwrap();
        exec.cpu.set("RAX", Value::from_u64(0, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(5, 64)).unwrap();
        let inst = Inst::new(Mnemonic::Div, vec![OperandDesc::reg("RCX")], 3);
        match exec.execute(&inst) {
            Err(ExecError::Fault(Fault::DivideOverflow)) => {}
            other => panic!("expected a divide overflow, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_idiv_signed_quotient_and_remainder() {
        let mut exec = setup_executor();
        // -7 / 2 = -3 rem -1 (truncation toward zero).
        exec.cpu.set("RAX", Value::from_u64((-7i64) as u64, 64)).unwrap();
        exec.cpu.set("RDX", Value::from_u64(u64::MAX, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(2, 64)).unwrap();
        let inst = Inst::new(Mnemonic::Idiv, vec![OperandDesc::reg("RCX")], 3);
        exec.execute(&inst).unwrap();

        assert_eq!(reg(&exec, "RAX"), (-3i64) as u64);
        assert_eq!(reg(&exec, "RDX"), (-1i64) as u64);
    }

    #[test]
    fn test_idiv_overflow_faults() {
        let mut exec = setup_executor();
        // i64::MIN / -1 does not fit.
        exec.cpu.set("RAX", Value::from_u64(i64::MIN as u64, 64)).unwrap();
        exec.cpu.set("RDX", Value::from_u64(u64::MAX, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64((-1i64) as u64, 64)).unwrap();
        let inst = Inst::new(Mnemonic::Idiv, vec![OperandDesc::reg("RCX")], 3);
        match exec.execute(&inst) {
            Err(ExecError::Fault(Fault::DivideOverflow)) => {}
            other => panic!("expected a divide overflow, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_cdq_and_cqo_sign_fill() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0x8000_0000, 64)).unwrap();
        exec.execute(&Inst::new(Mnemonic::Cdq, vec![], 2)).unwrap();
        assert_eq!(reg(&exec, "EDX"), 0xffff_ffff);

        exec.cpu.set("RAX", Value::from_u64(1, 64)).unwrap();
        exec.execute(&Inst::new(Mnemonic::Cqo, vec![], 2)).unwrap();
        assert_eq!(reg(&exec, "RDX"), 0);
    }

    #[test]
    fn test_cdqe_sign_extends_eax() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0x8000_0000, 64)).unwrap();
        exec.execute(&Inst::new(Mnemonic::Cdqe, vec![], 2)).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0xffff_ffff_8000_0000);
    }

    #[test]
    fn test_cmpxchg_equal_branch() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(42, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(42, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(99, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Cmpxchg,
            vec![OperandDesc::reg("RBX"), OperandDesc::reg("RCX")],
            4,
        );
        exec.execute(&inst).unwrap();

        // Equal: destination takes the source, accumulator unchanged.
        assert_eq!(reg(&exec, "RBX"), 99);
        assert_eq!(reg(&exec, "RAX"), 42);
        assert!(flag(&exec, Flag::ZF));
    }

    #[test]
    fn test_cmpxchg_unequal_branch() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(41, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(42, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(99, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Cmpxchg,
            vec![OperandDesc::reg("RBX"), OperandDesc::reg("RCX")],
            4,
        );
        exec.execute(&inst).unwrap();

        // Unequal: accumulator takes the destination's actual value,
        // destination keeps it.
        assert_eq!(reg(&exec, "RBX"), 42);
        assert_eq!(reg(&exec, "RAX"), 42);
        assert!(!flag(&exec, Flag::ZF));
        assert!(flag(&exec, Flag::CF), "41 - 42 borrows");
    }

    #[test]
    fn test_cmpxchg8b_both_branches() {
        let mut exec = setup_executor();
        exec.memory.mmap(0x5000, 0x1000, "rw-").unwrap();
        exec.memory.write_u64(0x5000, 0x1111_2222_3333_4444).unwrap();

        exec.cpu.set("RDX", Value::from_u64(0x1111_2222, 64)).unwrap();
        exec.cpu.set("RAX", Value::from_u64(0x3333_4444, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(0xaaaa_bbbb, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(0xcccc_dddd, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Cmpxchg8b,
            vec![OperandDesc::mem_abs(0x5000, 64)],
            5,
        );
        exec.execute(&inst).unwrap();

        // Equal: memory takes ECX:EBX, ZF set.
        assert_eq!(exec.memory.read_u64(0x5000).unwrap(), 0xaaaa_bbbb_cccc_dddd);
        assert!(flag(&exec, Flag::ZF));

        // Now EDX:EAX no longer matches: they load the memory value.
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "EDX"), 0xaaaa_bbbb);
        assert_eq!(reg(&exec, "EAX"), 0xcccc_dddd);
        assert!(!flag(&exec, Flag::ZF));
    }

    #[test]
    fn test_missing_handler_is_a_violation() {
        let mut exec = setup_executor();
        let inst = Inst::new(Mnemonic::Other("fxsave".to_string()), vec![], 3);
        match exec.step(&inst) {
            Err(StepError::Fault(Fault::MissingHandler(name))) => assert_eq!(name, "fxsave"),
            other => panic!("expected a missing-handler fault, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_memory_operand_arithmetic() {
        let mut exec = setup_executor();
        exec.memory.mmap(0x6000, 0x1000, "rw-").unwrap();
        exec.memory.write_u64(0x6010, 40).unwrap();
        exec.cpu.set("RBX", Value::from_u64(0x6000, 64)).unwrap();

        let inst = Inst::new(
            Mnemonic::Add,
            vec![OperandDesc::mem("RBX", 0x10, 64), OperandDesc::imm(2, 32)],
            5,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(exec.memory.read_u64(0x6010).unwrap(), 42);
    }
}
