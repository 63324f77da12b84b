//! Prefix-byte scanning.
//!
//! x86 prefixes fall into mutually exclusive groups: at most one prefix of
//! each group may appear before the opcode. A repeated prefix within a group
//! is a decode fault, which (like every decode fault) is deferred to emission
//! rather than failing the decode itself.

use bitflags::bitflags;
use lariat_types::{Seg, Width};

use crate::DecodeFault;

bitflags! {
    /// Summary bits for the single-byte prefixes.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PrefixFlags: u8 {
        /// Group 1: 0xF0.
        const LOCK = 1 << 0;
        /// Group 1: 0xF2.
        const REPNE = 1 << 1;
        /// Group 1: 0xF3.
        const REP = 1 << 2;
        /// Group 3: 0x66.
        const OPERAND_SIZE = 1 << 3;
        /// Group 4: 0x67.
        const ADDRESS_SIZE = 1 << 4;
    }
}

/// The decoded prefix run preceding an opcode.
///
/// Group 5 (the REX-style extension group) has no members in 32-bit mode,
/// where 0x40..=0x4F decode as inc/dec; the slot is reserved so the group
/// accounting matches the architecture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub flags: PrefixFlags,
    /// Group 2: segment override, doubling as a branch hint on Jcc.
    pub segment: Option<Seg>,
    /// Group 5: extension prefix, always `None` in 32-bit mode.
    pub rex: Option<u8>,
    /// Number of prefix bytes consumed.
    pub len: u8,
}

impl Prefixes {
    /// Effective operand width given the table's 16/32-bit default.
    pub fn operand_width(&self) -> Width {
        if self.flags.contains(PrefixFlags::OPERAND_SIZE) {
            Width::W32.swapped()
        } else {
            Width::W32
        }
    }

    /// Effective address width.
    pub fn address_width(&self) -> Width {
        if self.flags.contains(PrefixFlags::ADDRESS_SIZE) {
            Width::W32.swapped()
        } else {
            Width::W32
        }
    }

    /// Apply this prefix run to a table-declared 16/32 operand width.
    pub fn apply_operand_size(&self, width: Width) -> Width {
        if self.flags.contains(PrefixFlags::OPERAND_SIZE) {
            width.swapped()
        } else {
            width
        }
    }

    pub fn rep(&self) -> bool {
        self.flags.contains(PrefixFlags::REP)
    }

    pub fn repne(&self) -> bool {
        self.flags.contains(PrefixFlags::REPNE)
    }

    pub fn lock(&self) -> bool {
        self.flags.contains(PrefixFlags::LOCK)
    }

    /// The active segment, or `default` when no override is present.
    pub fn segment_or(&self, default: Seg) -> Seg {
        self.segment.unwrap_or(default)
    }

    /// Branch hint carried by a segment-override prefix on a conditional
    /// jump: CS hints taken, DS hints not taken. Other overrides carry no
    /// hint.
    pub fn branch_hint(&self) -> Option<bool> {
        match self.segment {
            Some(Seg::Cs) => Some(true),
            Some(Seg::Ds) => Some(false),
            _ => None,
        }
    }
}

/// Which prefix group a byte belongs to, if any.
fn classify(byte: u8) -> Option<PrefixKind> {
    Some(match byte {
        0xF0 => PrefixKind::Flag(PrefixFlags::LOCK),
        0xF2 => PrefixKind::Flag(PrefixFlags::REPNE),
        0xF3 => PrefixKind::Flag(PrefixFlags::REP),
        0x26 => PrefixKind::Segment(Seg::Es),
        0x2E => PrefixKind::Segment(Seg::Cs),
        0x36 => PrefixKind::Segment(Seg::Ss),
        0x3E => PrefixKind::Segment(Seg::Ds),
        0x64 => PrefixKind::Segment(Seg::Fs),
        0x65 => PrefixKind::Segment(Seg::Gs),
        0x66 => PrefixKind::Flag(PrefixFlags::OPERAND_SIZE),
        0x67 => PrefixKind::Flag(PrefixFlags::ADDRESS_SIZE),
        _ => return None,
    })
}

enum PrefixKind {
    Flag(PrefixFlags),
    Segment(Seg),
}

/// Group-1 membership, for repeat detection across lock/repne/rep.
const GROUP1: PrefixFlags = PrefixFlags::LOCK
    .union(PrefixFlags::REPNE)
    .union(PrefixFlags::REP);

/// Consume prefix bytes from `fetch` starting at `pc`.
///
/// Stops at the first non-prefix byte. A second prefix from an
/// already-occupied group is reported as a fault with the bytes consumed so
/// far, so the caller can surface a bad instruction of the right length.
pub(crate) fn scan<F: crate::InstFetch + ?Sized>(
    fetch: &F,
    pc: u32,
) -> Result<Prefixes, (DecodeFault, u8)> {
    let mut prefixes = Prefixes::default();
    loop {
        let byte = match fetch.fetch8(pc.wrapping_add(u32::from(prefixes.len))) {
            Some(b) => b,
            None => return Err((DecodeFault::UnexpectedEnd, prefixes.len)),
        };
        match classify(byte) {
            Some(PrefixKind::Flag(flag)) => {
                let group_taken = if GROUP1.contains(flag) {
                    prefixes.flags.intersects(GROUP1)
                } else {
                    prefixes.flags.contains(flag)
                };
                if group_taken {
                    return Err((DecodeFault::RepeatedPrefix { byte }, prefixes.len + 1));
                }
                prefixes.flags |= flag;
            }
            Some(PrefixKind::Segment(seg)) => {
                if prefixes.segment.is_some() {
                    return Err((DecodeFault::RepeatedPrefix { byte }, prefixes.len + 1));
                }
                prefixes.segment = Some(seg);
            }
            None => return Ok(prefixes),
        }
        prefixes.len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_each_group_once() {
        let bytes: &[u8] = &[0xF3, 0x2E, 0x66, 0x67, 0x90];
        let p = scan(bytes, 0).unwrap();
        assert_eq!(p.len, 4);
        assert!(p.rep());
        assert_eq!(p.segment, Some(Seg::Cs));
        assert_eq!(p.operand_width(), Width::W16);
        assert_eq!(p.address_width(), Width::W16);
    }

    #[test]
    fn repeated_group_is_a_fault() {
        // Two group-1 prefixes: lock then rep.
        let bytes: &[u8] = &[0xF0, 0xF3, 0x90];
        let (fault, len) = scan(bytes, 0).unwrap_err();
        assert_eq!(fault, DecodeFault::RepeatedPrefix { byte: 0xF3 });
        assert_eq!(len, 2);

        // Two segment overrides.
        let bytes: &[u8] = &[0x2E, 0x3E, 0x90];
        assert!(scan(bytes, 0).is_err());

        // Doubled operand-size override.
        let bytes: &[u8] = &[0x66, 0x66, 0x90];
        assert!(scan(bytes, 0).is_err());
    }

    #[test]
    fn cs_and_ds_overrides_carry_branch_hints() {
        let taken = scan([0x2E, 0x74].as_slice(), 0).unwrap();
        assert_eq!(taken.branch_hint(), Some(true));
        let not_taken = scan([0x3E, 0x74].as_slice(), 0).unwrap();
        assert_eq!(not_taken.branch_hint(), Some(false));
        let none = scan([0x65, 0x74].as_slice(), 0).unwrap();
        assert_eq!(none.branch_hint(), None);
    }
}
