//! Pure-concrete memory backend: raw bytes in page-aligned regions.

use byteorder::{ByteOrder, LittleEndian};
use z3::Context;

use super::memory::{page_span, parse_perms, MemoryBackend, MemoryError, PROT_READ, PROT_WRITE};
use crate::concolic::executor::{ExecError, Fault};
use crate::concolic::{ConstraintSet, Value};

#[derive(Debug)]
pub struct ConcreteRegion {
    pub start_address: u64,
    pub end_address: u64,
    pub prot: i32,
    pub data: Vec<u8>,
}

impl ConcreteRegion {
    pub fn contains(&self, address: u64, size: usize) -> bool {
        if address < self.start_address {
            return false;
        }
        match address.checked_add(size as u64) {
            Some(end) => end <= self.end_address,
            None => false,
        }
    }

    pub fn offset(&self, address: u64) -> usize {
        (address - self.start_address) as usize
    }
}

#[derive(Debug)]
pub struct ConcreteMemory<'ctx> {
    pub regions: Vec<ConcreteRegion>,
    ctx: &'ctx Context,
}

impl<'ctx> ConcreteMemory<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        ConcreteMemory {
            regions: Vec::new(),
            ctx,
        }
    }

    fn region_for(&self, address: u64, size: usize) -> Option<&ConcreteRegion> {
        self.regions.iter().find(|r| r.contains(address, size))
    }

    /// Bulk byte read, for loaders and tests.
    pub fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        self.check_range(address, size, PROT_READ)?;
        let region = self
            .region_for(address, size)
            .ok_or(MemoryError::Unmapped(address, size))?;
        let offset = region.offset(address);
        Ok(region.data[offset..offset + size].to_vec())
    }

    /// Bulk byte write, for loaders and tests.
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_range(address, bytes.len(), PROT_WRITE)?;
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.contains(address, bytes.len()))
            .ok_or(MemoryError::Unmapped(address, bytes.len()))?;
        let offset = region.offset(address);
        region.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        let bytes = self.read_bytes(address, 8)?;
        Ok(LittleEndian::read_u64(&bytes))
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<(), MemoryError> {
        let mut bytes = [0u8; 8];
        LittleEndian::write_u64(&mut bytes, value);
        self.write_bytes(address, &bytes)
    }
}

impl<'ctx> MemoryBackend<'ctx> for ConcreteMemory<'ctx> {
    fn ctx(&self) -> &'ctx Context {
        self.ctx
    }

    fn mmap(&mut self, address: u64, size: u64, perms: &str) -> Result<(), MemoryError> {
        let prot = parse_perms(perms)?;
        let (start, end) = page_span(address, size)?;
        for region in &self.regions {
            if start < region.end_address && region.start_address < end {
                return Err(MemoryError::AlreadyMapped(start));
            }
        }
        self.regions.push(ConcreteRegion {
            start_address: start,
            end_address: end,
            prot,
            data: vec![0; (end - start) as usize],
        });
        Ok(())
    }

    fn is_mapped(&self, address: u64, size: usize) -> bool {
        self.region_for(address, size).is_some()
    }

    fn check_range(&self, address: u64, size: usize, prot: i32) -> Result<(), MemoryError> {
        let region = self
            .region_for(address, size)
            .ok_or(MemoryError::Unmapped(address, size))?;
        if region.prot & prot != prot {
            return Err(MemoryError::PermissionDenied(address, prot));
        }
        Ok(())
    }

    fn read_byte(&self, address: u64) -> Result<Value<'ctx>, MemoryError> {
        self.check_range(address, 1, PROT_READ)?;
        let region = self
            .region_for(address, 1)
            .ok_or(MemoryError::Unmapped(address, 1))?;
        Ok(Value::from_u64(region.data[region.offset(address)] as u64, 8))
    }

    fn write_byte(&mut self, address: u64, value: &Value<'ctx>) -> Result<(), MemoryError> {
        self.check_range(address, 1, PROT_WRITE)?;
        let byte = value
            .as_concrete_u64()
            .ok_or(MemoryError::SymbolicValue(address))?;
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.contains(address, 1))
            .ok_or(MemoryError::Unmapped(address, 1))?;
        let offset = region.offset(address);
        region.data[offset] = byte as u8;
        Ok(())
    }

    fn resolve_address(
        &self,
        address: &Value<'ctx>,
        _size: usize,
        _constraints: &ConstraintSet<'ctx>,
    ) -> Result<u64, ExecError<'ctx>> {
        address
            .as_concrete_u64()
            .ok_or(ExecError::Fault(Fault::Memory(MemoryError::SymbolicAddress)))
    }
}
