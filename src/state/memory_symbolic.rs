//! Constraint-backed symbolic memory: concrete bytes plus a per-byte
//! symbolic overlay, and symbolic-address resolution through the
//! constraint set.

use std::collections::BTreeMap;

use z3::ast::{Ast, BV};
use z3::Context;

use super::memory::{page_span, parse_perms, MemoryBackend, MemoryError, PROT_READ, PROT_WRITE};
use crate::concolic::executor::{ConcretizeRequest, ConcretizeTarget, ExecError, Fault};
use crate::concolic::{ConstraintSet, Operators, SymbolicVar, Value};

/// How many candidate addresses are enumerated before the ambiguity is
/// handed to the exploration layer.
const ADDRESS_CANDIDATE_LIMIT: usize = 16;

#[derive(Debug)]
pub struct SymbolicRegion<'ctx> {
    pub start_address: u64,
    pub end_address: u64,
    pub prot: i32,
    /// Concrete backing bytes, one per mapped byte.
    pub concrete_data: Vec<u8>,
    /// Symbolic overlay; a present entry shadows the concrete byte at
    /// that offset. Every write installs a fresh cell or removes one.
    pub symbolic_data: BTreeMap<usize, BV<'ctx>>,
}

impl<'ctx> SymbolicRegion<'ctx> {
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

    fn write_symbolic(&mut self, offset: usize, symbolic: BV<'ctx>) {
        self.symbolic_data.insert(offset, symbolic);
    }

    fn read_symbolic(&self, offset: usize) -> Option<&BV<'ctx>> {
        self.symbolic_data.get(&offset)
    }

    fn remove_symbolic(&mut self, offset: usize) {
        self.symbolic_data.remove(&offset);
    }
}

#[derive(Debug)]
pub struct SymbolicMemory<'ctx> {
    pub regions: Vec<SymbolicRegion<'ctx>>,
    ctx: &'ctx Context,
}

impl<'ctx> SymbolicMemory<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        SymbolicMemory {
            regions: Vec::new(),
            ctx,
        }
    }

    fn region_for(&self, address: u64, size: usize) -> Option<&SymbolicRegion<'ctx>> {
        self.regions.iter().find(|r| r.contains(address, size))
    }

    fn region_for_mut(&mut self, address: u64, size: usize) -> Option<&mut SymbolicRegion<'ctx>> {
        self.regions.iter_mut().find(|r| r.contains(address, size))
    }

    /// Seeds a range with concrete bytes, clearing any overlay cells.
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_range(address, bytes.len(), PROT_WRITE)?;
        let region = self
            .region_for_mut(address, bytes.len())
            .ok_or(MemoryError::Unmapped(address, bytes.len()))?;
        let offset = region.offset(address);
        for (i, &byte) in bytes.iter().enumerate() {
            region.concrete_data[offset + i] = byte;
            region.remove_symbolic(offset + i);
        }
        Ok(())
    }

    /// Installs a fresh unconstrained symbolic byte at each address of
    /// the range, named after `label`. Returns the per-byte variables so
    /// the caller can constrain them.
    pub fn write_fresh_symbolic(
        &mut self,
        address: u64,
        size: usize,
        label: &str,
    ) -> Result<Vec<BV<'ctx>>, MemoryError> {
        self.check_range(address, size, PROT_WRITE)?;
        let ctx = self.ctx;
        let region = self
            .region_for_mut(address, size)
            .ok_or(MemoryError::Unmapped(address, size))?;
        let offset = region.offset(address);
        let mut cells = Vec::with_capacity(size);
        for i in 0..size {
            let name = format!("{}_{:x}", label, address + i as u64);
            let cell = BV::new_const(ctx, name.as_str(), 8);
            region.write_symbolic(offset + i, cell.clone());
            cells.push(cell);
        }
        Ok(cells)
    }
}

impl<'ctx> MemoryBackend<'ctx> for SymbolicMemory<'ctx> {
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
        self.regions.push(SymbolicRegion {
            start_address: start,
            end_address: end,
            prot,
            concrete_data: vec![0; (end - start) as usize],
            symbolic_data: BTreeMap::new(),
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

    /// Returns the overlay expression unresolved when one is present;
    /// concretizing is the caller's decision, never this backend's.
    fn read_byte(&self, address: u64) -> Result<Value<'ctx>, MemoryError> {
        self.check_range(address, 1, PROT_READ)?;
        let region = self
            .region_for(address, 1)
            .ok_or(MemoryError::Unmapped(address, 1))?;
        let offset = region.offset(address);
        match region.read_symbolic(offset) {
            Some(bv) => Ok(Value::Symbolic(SymbolicVar::Int(bv.clone()))),
            None => Ok(Value::from_u64(region.concrete_data[offset] as u64, 8)),
        }
    }

    fn write_byte(&mut self, address: u64, value: &Value<'ctx>) -> Result<(), MemoryError> {
        self.check_range(address, 1, PROT_WRITE)?;
        let ops = Operators::new(self.ctx);
        let region = self
            .region_for_mut(address, 1)
            .ok_or(MemoryError::Unmapped(address, 1))?;
        let offset = region.offset(address);
        match value.as_concrete_u64() {
            Some(byte) => {
                region.concrete_data[offset] = byte as u8;
                region.remove_symbolic(offset);
            }
            None => {
                debug_assert!(
                    matches!(value, Value::Symbolic(sym) if sym.is_valid()),
                    "symbolic store of an invalid AST"
                );
                region.write_symbolic(offset, ops.to_bv(value));
            }
        }
        Ok(())
    }

    /// A concrete address passes through; a symbolic one is resolved
    /// against the constraint set. Exactly one mapped candidate is pinned
    /// by assertion and dereferenced; none faults; several raise a
    /// concretization request for the exploration layer.
    fn resolve_address(
        &self,
        address: &Value<'ctx>,
        size: usize,
        constraints: &ConstraintSet<'ctx>,
    ) -> Result<u64, ExecError<'ctx>> {
        if let Some(addr) = address.as_concrete_u64() {
            return Ok(addr);
        }
        let ops = Operators::new(self.ctx);
        let expr = ops.to_bv(address);
        let candidates: Vec<u64> = constraints
            .get_all_values(&expr, ADDRESS_CANDIDATE_LIMIT)
            .into_iter()
            .filter(|addr| self.is_mapped(*addr, size))
            .collect();
        match candidates.as_slice() {
            [] => Err(ExecError::Fault(Fault::Memory(
                MemoryError::UnresolvableAddress,
            ))),
            [addr] => {
                let pinned = expr._eq(&BV::from_u64(self.ctx, *addr, expr.get_size()));
                constraints.assert(&pinned);
                Ok(*addr)
            }
            _ => Err(ExecError::Concretize(ConcretizeRequest {
                target: ConcretizeTarget::Address,
                expr,
            })),
        }
    }
}
