use std::fmt;

/// Concrete payload of a [`crate::concolic::Value`].
///
/// Values up to 64 bits are a single masked `u64`; vector-width values are
/// little-endian 64-bit limbs. Booleans back the flag cells.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConcreteVar {
    Int(u64),
    LargeInt(Vec<u64>),
    Bool(bool),
}

impl ConcreteVar {
    /// Builds a payload of `size` bits from a `u128`, choosing the limb
    /// representation when the value does not fit a single cell.
    pub fn from_u128(value: u128, size: u32) -> Self {
        if size <= 64 {
            ConcreteVar::Int(mask_u64(value as u64, size))
        } else {
            let mut limbs = vec![value as u64, (value >> 64) as u64];
            limbs.resize(((size + 63) / 64) as usize, 0);
            let mut var = ConcreteVar::LargeInt(limbs);
            var.mask_to(size);
            var
        }
    }

    /// Lower 64 bits of the payload.
    pub fn to_u64(&self) -> u64 {
        match self {
            ConcreteVar::Int(v) => *v,
            ConcreteVar::LargeInt(limbs) => limbs.first().copied().unwrap_or(0),
            ConcreteVar::Bool(b) => *b as u64,
        }
    }

    /// Lower 128 bits of the payload.
    pub fn to_u128(&self) -> u128 {
        match self {
            ConcreteVar::Int(v) => *v as u128,
            ConcreteVar::LargeInt(limbs) => {
                let lo = limbs.first().copied().unwrap_or(0) as u128;
                let hi = limbs.get(1).copied().unwrap_or(0) as u128;
                lo | (hi << 64)
            }
            ConcreteVar::Bool(b) => *b as u128,
        }
    }

    pub fn to_bool(&self) -> bool {
        match self {
            ConcreteVar::Int(v) => *v != 0,
            ConcreteVar::LargeInt(limbs) => limbs.iter().any(|l| *l != 0),
            ConcreteVar::Bool(b) => *b,
        }
    }

    /// The little-endian limb view, regardless of representation.
    pub fn limbs(&self, size: u32) -> Vec<u64> {
        let count = ((size + 63) / 64) as usize;
        match self {
            ConcreteVar::Int(v) => {
                let mut limbs = vec![0; count.max(1)];
                limbs[0] = *v;
                limbs
            }
            ConcreteVar::LargeInt(limbs) => {
                let mut limbs = limbs.clone();
                limbs.resize(count.max(1), 0);
                limbs
            }
            ConcreteVar::Bool(b) => {
                let mut limbs = vec![0; count.max(1)];
                limbs[0] = *b as u64;
                limbs
            }
        }
    }

    /// Masks the payload in place to `size` bits.
    pub fn mask_to(&mut self, size: u32) {
        match self {
            ConcreteVar::Int(v) => *v = mask_u64(*v, size),
            ConcreteVar::LargeInt(limbs) => {
                let count = ((size + 63) / 64) as usize;
                limbs.truncate(count.max(1));
                limbs.resize(count.max(1), 0);
                let last_bits = size % 64;
                if last_bits != 0 {
                    if let Some(last) = limbs.last_mut() {
                        *last &= (1u64 << last_bits) - 1;
                    }
                }
            }
            ConcreteVar::Bool(_) => {}
        }
    }

    /// Extracts `width` bits starting at bit `offset`, across limbs.
    pub fn extract_bits(&self, offset: u32, width: u32, total_size: u32) -> ConcreteVar {
        let limbs = self.limbs(total_size);
        if width <= 64 {
            let idx = (offset / 64) as usize;
            let shift = offset % 64;
            let mut value = limbs.get(idx).copied().unwrap_or(0) >> shift;
            if shift != 0 && shift + width > 64 {
                value |= limbs.get(idx + 1).copied().unwrap_or(0) << (64 - shift);
            }
            ConcreteVar::Int(mask_u64(value, width))
        } else {
            let count = ((width + 63) / 64) as usize;
            let mut out = Vec::with_capacity(count);
            for i in 0..count {
                let bit = offset + (i as u32) * 64;
                let idx = (bit / 64) as usize;
                let shift = bit % 64;
                let mut value = limbs.get(idx).copied().unwrap_or(0) >> shift;
                if shift != 0 {
                    value |= limbs.get(idx + 1).copied().unwrap_or(0) << (64 - shift);
                }
                out.push(value);
            }
            let mut var = ConcreteVar::LargeInt(out);
            var.mask_to(width);
            var
        }
    }
}

/// Masks `value` to its low `size` bits (`size` in 1..=64).
pub fn mask_u64(value: u64, size: u32) -> u64 {
    if size >= 64 {
        value
    } else {
        value & ((1u64 << size) - 1)
    }
}

impl fmt::Display for ConcreteVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcreteVar::Int(v) => write!(f, "0x{:x}", v),
            ConcreteVar::LargeInt(limbs) => {
                write!(f, "0x")?;
                for limb in limbs.iter().rev() {
                    write!(f, "{:016x}", limb)?;
                }
                Ok(())
            }
            ConcreteVar::Bool(b) => write!(f, "{}", b),
        }
    }
}
