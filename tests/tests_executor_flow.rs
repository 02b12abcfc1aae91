use danica::instruction::{Inst, Mnemonic, OperandDesc};
use danica::state::flags::{Cond, Flag};
use danica::state::memory::MemoryBackend;
use danica::{ConcreteMemory, CpuExecutor, Value};
use z3::{Config, Context};

const STACK_BASE: u64 = 0x7fff_0000;
const STACK_TOP: u64 = 0x7fff_8000;

fn setup_executor() -> CpuExecutor<'static, ConcreteMemory<'static>> {
    let cfg = Config::new();
    let ctx = Box::leak(Box::new(Context::new(&cfg)));
    let memory = ConcreteMemory::new(ctx);
    let mut exec = CpuExecutor::new(ctx, memory);
    exec.memory.mmap(STACK_BASE, STACK_TOP - STACK_BASE, "rw-").unwrap();
    exec.cpu.set("RSP", Value::from_u64(STACK_TOP - 0x100, 64)).unwrap();
    exec
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(exec: &CpuExecutor<'static, ConcreteMemory<'static>>, name: &str) -> u64 {
        exec.cpu
            .get(name)
            .unwrap()
            .as_concrete_u64()
            .expect("register is concrete")
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let mut exec = setup_executor();
        let rsp0 = reg(&exec, "RSP");
        exec.cpu.set("RAX", Value::from_u64(0xdead_beef, 64)).unwrap();

        let push = Inst::new(Mnemonic::Push, vec![OperandDesc::reg("RAX")], 1);
        exec.execute(&push).unwrap();
        assert_eq!(reg(&exec, "RSP"), rsp0 - 8);
        assert_eq!(exec.memory.read_u64(rsp0 - 8).unwrap(), 0xdead_beef);

        let pop = Inst::new(Mnemonic::Pop, vec![OperandDesc::reg("RBX")], 1);
        exec.execute(&pop).unwrap();
        assert_eq!(reg(&exec, "RSP"), rsp0);
        assert_eq!(reg(&exec, "RBX"), 0xdead_beef);
    }

    #[test]
    fn test_push_immediate_sign_extends() {
        let mut exec = setup_executor();
        let rsp0 = reg(&exec, "RSP");
        let push = Inst::new(Mnemonic::Push, vec![OperandDesc::imm(-1, 32)], 5);
        exec.execute(&push).unwrap();
        assert_eq!(exec.memory.read_u64(rsp0 - 8).unwrap(), u64::MAX);
    }

    /// CALL pushes the address of the instruction immediately following
    /// it, then transfers to the target.
    #[test]
    fn test_call_pushes_return_address() {
        let mut exec = setup_executor();
        exec.cpu.set_rip(Value::from_u64(0x401000, 64));
        let rsp0 = reg(&exec, "RSP");

        let call = Inst::new(
            Mnemonic::Call,
            vec![OperandDesc::imm(0x402000, 64)],
            5,
        );
        exec.execute(&call).unwrap();

        assert_eq!(reg(&exec, "RIP"), 0x402000);
        assert_eq!(reg(&exec, "RSP"), rsp0 - 8);
        assert_eq!(exec.memory.read_u64(rsp0 - 8).unwrap(), 0x401005);
    }

    #[test]
    fn test_ret_returns_to_pushed_address() {
        let mut exec = setup_executor();
        exec.cpu.set_rip(Value::from_u64(0x401000, 64));
        let call = Inst::new(Mnemonic::Call, vec![OperandDesc::imm(0x402000, 64)], 5);
        exec.execute(&call).unwrap();

        let ret = Inst::new(Mnemonic::Ret, vec![], 1);
        exec.execute(&ret).unwrap();
        assert_eq!(reg(&exec, "RIP"), 0x401005);
    }

    #[test]
    fn test_ret_imm_releases_stack_bytes() {
        let mut exec = setup_executor();
        let rsp0 = reg(&exec, "RSP");
        exec.memory.write_u64(rsp0, 0x403000).unwrap();

        let ret = Inst::new(Mnemonic::Ret, vec![OperandDesc::imm(0x10, 16)], 3);
        exec.execute(&ret).unwrap();
        assert_eq!(reg(&exec, "RIP"), 0x403000);
        assert_eq!(reg(&exec, "RSP"), rsp0 + 8 + 0x10);
    }

    #[test]
    fn test_jmp_indirect_through_register() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0x404000, 64)).unwrap();
        let jmp = Inst::new(Mnemonic::Jmp, vec![OperandDesc::reg("RAX")], 2);
        exec.execute(&jmp).unwrap();
        assert_eq!(reg(&exec, "RIP"), 0x404000);
    }

    /// JG requires ZF = 0 and SF = OF.
    #[test]
    fn test_jg_flag_combination() {
        let cases = [
            // (zf, sf, of, taken)
            (false, false, false, true),
            (false, true, true, true),
            (false, true, false, false),
            (true, false, false, false),
        ];
        for (zf, sf, of, taken) in cases {
            let mut exec = setup_executor();
            exec.cpu.set_rip(Value::from_u64(0x401000, 64));
            exec.cpu.set_flag(Flag::ZF, Value::from_bool(zf));
            exec.cpu.set_flag(Flag::SF, Value::from_bool(sf));
            exec.cpu.set_flag(Flag::OF, Value::from_bool(of));
            let jcc = Inst::new(
                Mnemonic::Jcc(Cond::G),
                vec![OperandDesc::imm(0x405000, 64)],
                6,
            );
            exec.execute(&jcc).unwrap();
            let expected = if taken { 0x405000 } else { 0x401006 };
            assert_eq!(
                reg(&exec, "RIP"),
                expected,
                "JG with ZF={} SF={} OF={}",
                zf,
                sf,
                of
            );
        }
    }

    #[test]
    fn test_jb_uses_carry() {
        let mut exec = setup_executor();
        exec.cpu.set_rip(Value::from_u64(0x401000, 64));
        exec.cpu.set_flag(Flag::CF, Value::from_bool(true));
        let jcc = Inst::new(
            Mnemonic::Jcc(Cond::B),
            vec![OperandDesc::imm(0x405000, 64)],
            2,
        );
        exec.execute(&jcc).unwrap();
        assert_eq!(reg(&exec, "RIP"), 0x405000);
    }

    #[test]
    fn test_leave_unwinds_frame() {
        let mut exec = setup_executor();
        let frame = STACK_TOP - 0x200;
        exec.memory.write_u64(frame, 0x1111_2222).unwrap();
        exec.cpu.set("RBP", Value::from_u64(frame, 64)).unwrap();

        let leave = Inst::new(Mnemonic::Leave, vec![], 1);
        exec.execute(&leave).unwrap();

        assert_eq!(reg(&exec, "RBP"), 0x1111_2222);
        assert_eq!(reg(&exec, "RSP"), frame + 8);
    }

    /// The predicate table is shared: the flags a condition reads are
    /// fixed per condition code.
    #[test]
    fn test_condition_flag_sets() {
        assert_eq!(Cond::G.flags(), &[Flag::ZF, Flag::SF, Flag::OF]);
        assert_eq!(Cond::B.flags(), &[Flag::CF]);
        assert_eq!(Cond::P.flags(), &[Flag::PF]);
    }
}
