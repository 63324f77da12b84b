//! 32-bit x86 instruction decoding for the trace front end.
//!
//! The decoder is table-driven and total: [`decode`] always yields a
//! [`DecodedInst`], with unmapped opcodes, repeated prefixes, truncated
//! encodings, and unsupported addressing forms deferred into
//! [`InstKind::Bad`]. Nothing here emits code or touches register state;
//! operands come out as plain data for the trace builder to lower.

mod decoder;
mod inst;
mod laziness;
mod modrm;
mod operand;
mod prefix;
mod tables;

pub use decoder::decode;
pub use inst::{ControlReg, DecodeFault, DecodedInst, ImmKind, InstKind, OpShape};
pub use laziness::{AliasTag, RegAliasState, TraceKey};
pub use modrm::{ModRm, Sib};
pub use operand::{MemRef, Operand, RegView};
pub use prefix::{PrefixFlags, Prefixes};

/// Read-only access to guest instruction bytes.
///
/// Fetches are by virtual address and may fail at image boundaries; the
/// decoder converts a failed fetch into a deferred bad-instruction rather
/// than an error.
pub trait InstFetch {
    fn fetch8(&self, addr: u32) -> Option<u8>;

    fn fetch16(&self, addr: u32) -> Option<u16> {
        let lo = self.fetch8(addr)?;
        let hi = self.fetch8(addr.wrapping_add(1))?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    fn fetch32(&self, addr: u32) -> Option<u32> {
        let b0 = self.fetch8(addr)?;
        let b1 = self.fetch8(addr.wrapping_add(1))?;
        let b2 = self.fetch8(addr.wrapping_add(2))?;
        let b3 = self.fetch8(addr.wrapping_add(3))?;
        Some(u32::from_le_bytes([b0, b1, b2, b3]))
    }
}

/// A byte slice is an image starting at address zero, which is all the tests
/// and simple harnesses need.
impl InstFetch for [u8] {
    fn fetch8(&self, addr: u32) -> Option<u8> {
        self.get(addr as usize).copied()
    }
}

impl<T: InstFetch + ?Sized> InstFetch for &T {
    fn fetch8(&self, addr: u32) -> Option<u8> {
        (**self).fetch8(addr)
    }

    fn fetch16(&self, addr: u32) -> Option<u16> {
        (**self).fetch16(addr)
    }

    fn fetch32(&self, addr: u32) -> Option<u32> {
        (**self).fetch32(addr)
    }
}
