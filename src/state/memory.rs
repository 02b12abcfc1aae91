//! Memory contract shared by the two backends.
//!
//! The address space is a sparse set of page-aligned, permission-tagged
//! regions. All multi-byte traffic is little-endian and built strictly on
//! the byte primitive; nothing assumes hardware alignment. Any access
//! outside mapped memory, or without sufficient permission, faults
//! deterministically — reads never silently return garbage.

use std::error::Error;
use std::fmt;

use z3::Context;

use crate::concolic::{ConstraintSet, Operators, Value};
use crate::concolic::executor::ExecError;

pub const PAGE_SIZE: u64 = 0x1000;

// Protection flags for memory regions
pub const PROT_READ: i32 = 0x1;
pub const PROT_WRITE: i32 = 0x2;
pub const PROT_EXEC: i32 = 0x4;

/// Parses an `"rwx"`/`"rw-"`-style permission string into `PROT_*` bits.
pub fn parse_perms(perms: &str) -> Result<i32, MemoryError> {
    let mut prot = 0;
    for ch in perms.chars() {
        match ch {
            'r' => prot |= PROT_READ,
            'w' => prot |= PROT_WRITE,
            'x' => prot |= PROT_EXEC,
            '-' => {}
            _ => return Err(MemoryError::InvalidPermissions(perms.to_string())),
        }
    }
    Ok(prot)
}

#[derive(Debug, PartialEq, Eq)]
pub enum MemoryError {
    Unmapped(u64, usize),
    PermissionDenied(u64, i32),
    AlreadyMapped(u64),
    InvalidPermissions(String),
    InvalidAccessSize(u32),
    UnalignedAccess(u64, u64),
    AddressOverflow(u64),
    SymbolicValue(u64),
    SymbolicAddress,
    UnresolvableAddress,
}

impl Error for MemoryError {}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Unmapped(addr, size) => {
                write!(f, "unmapped access at 0x{:x} ({} bytes)", addr, size)
            }
            MemoryError::PermissionDenied(addr, prot) => {
                write!(f, "permission denied at 0x{:x} (needs 0x{:x})", addr, prot)
            }
            MemoryError::AlreadyMapped(addr) => {
                write!(f, "region overlapping 0x{:x} is already mapped", addr)
            }
            MemoryError::InvalidPermissions(perms) => {
                write!(f, "invalid permission string {:?}", perms)
            }
            MemoryError::InvalidAccessSize(bits) => {
                write!(f, "invalid access size of {} bits", bits)
            }
            MemoryError::UnalignedAccess(addr, align) => {
                write!(f, "access at 0x{:x} violates {}-byte alignment", addr, align)
            }
            MemoryError::AddressOverflow(addr) => {
                write!(f, "address range starting at 0x{:x} overflows", addr)
            }
            MemoryError::SymbolicValue(addr) => {
                write!(f, "concrete backend cannot store a symbolic value at 0x{:x}", addr)
            }
            MemoryError::SymbolicAddress => {
                write!(f, "concrete backend cannot dereference a symbolic address")
            }
            MemoryError::UnresolvableAddress => {
                write!(f, "no satisfying address within mapped memory")
            }
        }
    }
}

/// The read/write contract both backends implement. `read_value` and
/// `write_value` are derived from the byte primitive, so backends only
/// supply mapping, byte access, and address resolution.
pub trait MemoryBackend<'ctx> {
    fn ctx(&self) -> &'ctx Context;

    /// Maps `[address, address+size)` with the given permissions, rounded
    /// out to page granularity. Overlapping an existing region faults.
    fn mmap(&mut self, address: u64, size: u64, perms: &str) -> Result<(), MemoryError>;

    /// Whether every byte of the range is mapped (any permission).
    fn is_mapped(&self, address: u64, size: usize) -> bool;

    /// Faults unless every byte of the range is mapped with `prot`.
    fn check_range(&self, address: u64, size: usize, prot: i32) -> Result<(), MemoryError>;

    /// Reads one byte as an 8-bit value (possibly symbolic).
    fn read_byte(&self, address: u64) -> Result<Value<'ctx>, MemoryError>;

    /// Writes one 8-bit value (possibly symbolic, backend permitting).
    fn write_byte(&mut self, address: u64, value: &Value<'ctx>) -> Result<(), MemoryError>;

    /// Resolves a possibly-symbolic address to a single concrete one that
    /// the whole `size`-byte access fits into, consulting the constraint
    /// set where the backend supports it.
    fn resolve_address(
        &self,
        address: &Value<'ctx>,
        size: usize,
        constraints: &ConstraintSet<'ctx>,
    ) -> Result<u64, ExecError<'ctx>>;

    /// Little-endian multi-byte read, assembled from the byte primitive.
    fn read_value(&self, address: u64, size_bits: u32) -> Result<Value<'ctx>, MemoryError> {
        if size_bits == 0 || size_bits % 8 != 0 {
            return Err(MemoryError::InvalidAccessSize(size_bits));
        }
        let count = (size_bits / 8) as usize;
        self.check_range(address, count, PROT_READ)?;
        let ops = Operators::new(self.ctx());
        let mut value = self.read_byte(address + count as u64 - 1)?;
        for i in (0..count - 1).rev() {
            let byte = self.read_byte(address + i as u64)?;
            value = ops.concat(&value, &byte);
        }
        Ok(value)
    }

    /// Little-endian multi-byte write. The whole range is validated
    /// before the first byte is stored, so a faulting write mutates
    /// nothing.
    fn write_value(&mut self, address: u64, value: &Value<'ctx>) -> Result<(), MemoryError> {
        let size_bits = value.size();
        if size_bits == 0 || size_bits % 8 != 0 {
            return Err(MemoryError::InvalidAccessSize(size_bits));
        }
        let count = (size_bits / 8) as usize;
        self.check_range(address, count, PROT_WRITE)?;
        let ops = Operators::new(self.ctx());
        for i in 0..count {
            let byte = ops.extract(value, (i as u32) * 8 + 7, (i as u32) * 8);
            self.write_byte(address + i as u64, &byte)?;
        }
        Ok(())
    }
}

/// Rounds a mapping request out to page boundaries.
pub(crate) fn page_span(address: u64, size: u64) -> Result<(u64, u64), MemoryError> {
    let start = address & !(PAGE_SIZE - 1);
    let unaligned_end = address
        .checked_add(size)
        .ok_or(MemoryError::AddressOverflow(address))?;
    let end = unaligned_end
        .checked_add(PAGE_SIZE - 1)
        .ok_or(MemoryError::AddressOverflow(address))?
        & !(PAGE_SIZE - 1);
    Ok((start, end))
}
