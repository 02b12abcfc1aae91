use danica::instruction::{Inst, Mnemonic, OperandDesc};
use danica::state::flags::{Cond, Flag};
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

    fn reg(exec: &CpuExecutor<'static, ConcreteMemory<'static>>, name: &str) -> u64 {
        exec.cpu
            .get(name)
            .unwrap()
            .as_concrete_u64()
            .expect("register is concrete")
    }

    #[test]
    fn test_mov_imm_sign_extends_to_destination() {
        let mut exec = setup_executor();
        let inst = Inst::new(
            Mnemonic::Mov,
            vec![OperandDesc::reg("RAX"), OperandDesc::imm(-1, 32)],
            7,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), u64::MAX);
    }

    #[test]
    fn test_mov_eax_zero_extends() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(u64::MAX, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(0x1234_5678, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Mov,
            vec![OperandDesc::reg("EAX"), OperandDesc::reg("EBX")],
            2,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0x1234_5678, "bits 63:32 cleared");
    }

    #[test]
    fn test_mov_al_preserves_high_bits() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0x1111_1111_1111_1111, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Mov,
            vec![OperandDesc::reg("AL"), OperandDesc::imm(0x42, 8)],
            2,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0x1111_1111_1111_1142);
    }

    #[test]
    fn test_movabs_full_width_immediate() {
        let mut exec = setup_executor();
        let inst = Inst::new(
            Mnemonic::Movabs,
            vec![
                OperandDesc::reg("RAX"),
                OperandDesc::imm(0x1234_5678_9abc_def0u64 as i64, 64),
            ],
            10,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn test_movzx_zero_extends() {
        let mut exec = setup_executor();
        exec.cpu.set("RBX", Value::from_u64(0xff80, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Movzx,
            vec![OperandDesc::reg("RAX"), OperandDesc::reg("BL")],
            4,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0x80);
    }

    #[test]
    fn test_movsx_sign_extends() {
        let mut exec = setup_executor();
        exec.cpu.set("RBX", Value::from_u64(0x80, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Movsx,
            vec![OperandDesc::reg("RAX"), OperandDesc::reg("BL")],
            4,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0xffff_ffff_ffff_ff80);
    }

    #[test]
    fn test_movsxd_from_memory() {
        let mut exec = setup_executor();
        exec.memory.mmap(0x7000, 0x1000, "rw-").unwrap();
        exec.memory.write_bytes(0x7100, &0x8000_0000u32.to_le_bytes()).unwrap();
        let inst = Inst::new(
            Mnemonic::Movsxd,
            vec![OperandDesc::reg("RAX"), OperandDesc::mem_abs(0x7100, 32)],
            7,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0xffff_ffff_8000_0000);
    }

    #[test]
    fn test_lea_computes_without_dereferencing() {
        let mut exec = setup_executor();
        // Nothing is mapped: LEA must not touch memory at all.
        exec.cpu.set("RBX", Value::from_u64(0x1000, 64)).unwrap();
        exec.cpu.set("RCX", Value::from_u64(0x20, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Lea,
            vec![
                OperandDesc::reg("RAX"),
                OperandDesc::mem_sib("RBX", "RCX", 4, 8, 64),
            ],
            5,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0x1000 + 0x20 * 4 + 8);
    }

    #[test]
    fn test_xchg_swaps() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(1, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(2, 64)).unwrap();
        let inst = Inst::new(
            Mnemonic::Xchg,
            vec![OperandDesc::reg("RAX"), OperandDesc::reg("RBX")],
            3,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 2);
        assert_eq!(reg(&exec, "RBX"), 1);
    }

    #[test]
    fn test_cmov_taken_and_not_taken() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(u64::MAX, 64)).unwrap();
        exec.cpu.set("RBX", Value::from_u64(0x5555_5555, 64)).unwrap();
        exec.cpu.set_flag(Flag::ZF, Value::from_bool(true));
        let inst = Inst::new(
            Mnemonic::Cmovcc(Cond::E),
            vec![OperandDesc::reg("EAX"), OperandDesc::reg("EBX")],
            4,
        );
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0x5555_5555);

        // Not taken: the destination keeps its value, but the 32-bit
        // write still zero-extends, as hardware does.
        exec.cpu.set("RAX", Value::from_u64(u64::MAX, 64)).unwrap();
        exec.cpu.set_flag(Flag::ZF, Value::from_bool(false));
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "RAX"), 0xffff_ffff);
    }

    #[test]
    fn test_setcc_writes_the_byte_either_way() {
        let mut exec = setup_executor();
        exec.cpu.set("RAX", Value::from_u64(0xffff, 64)).unwrap();
        exec.cpu.set_flag(Flag::SF, Value::from_bool(true));
        exec.cpu.set_flag(Flag::OF, Value::from_bool(true));
        exec.cpu.set_flag(Flag::ZF, Value::from_bool(false));

        // SF == OF and ZF clear: G holds.
        let inst = Inst::new(Mnemonic::Setcc(Cond::G), vec![OperandDesc::reg("AL")], 4);
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "AL"), 1);
        assert_eq!(reg(&exec, "RAX") >> 8, 0xff, "only the byte is written");

        exec.cpu.set_flag(Flag::ZF, Value::from_bool(true));
        exec.execute(&inst).unwrap();
        assert_eq!(reg(&exec, "AL"), 0);
    }

    #[test]
    fn test_nop_only_advances_rip() {
        let mut exec = setup_executor();
        exec.cpu.set_rip(Value::from_u64(0x400000, 64));
        exec.execute(&Inst::new(Mnemonic::Nop, vec![], 1)).unwrap();
        assert_eq!(reg(&exec, "RIP"), 0x400001);
    }
}
