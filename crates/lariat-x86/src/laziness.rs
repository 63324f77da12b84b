//! Deferred register-alias materialization state.
//!
//! Each general-purpose register can be accessed as a 32-bit value, a 16-bit
//! value, or (for the first four) a pair of 8-bit halves. During a trace the
//! translator keeps whichever view was last written in its own temporary and
//! defers the mask/shift/or reconciliation until a different view is actually
//! read. This state records, per register, which view is currently valid.
//!
//! The packed state doubles as the trace-point identity: two visits to the
//! same pc are the same translation point only if their alias states are
//! identical, because the reconciliation code that must be emitted differs
//! otherwise.

use lariat_types::Gpr;

/// Which view of a register holds the live value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AliasTag {
    /// The full 32-bit temporary is valid.
    WideValid = 0,
    /// The two 8-bit half temporaries are valid.
    BytesValid = 1,
    /// The 16-bit temporary is valid.
    HalfValid = 2,
}

/// Per-register alias validity, packed two bits per register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegAliasState(u16);

impl Default for RegAliasState {
    /// Trace entry: every register is filled at full width.
    fn default() -> Self {
        RegAliasState(0)
    }
}

impl RegAliasState {
    pub fn tag(&self, reg: Gpr) -> AliasTag {
        match (self.0 >> (reg.index() * 2)) & 3 {
            0 => AliasTag::WideValid,
            1 => AliasTag::BytesValid,
            _ => AliasTag::HalfValid,
        }
    }

    pub fn set_tag(&mut self, reg: Gpr, tag: AliasTag) {
        let shift = reg.index() * 2;
        self.0 = (self.0 & !(3u16 << shift)) | ((tag as u16) << shift);
    }

    pub fn is_wide_valid(&self, reg: Gpr) -> bool {
        self.tag(reg) == AliasTag::WideValid
    }

    pub fn is_half_valid(&self, reg: Gpr) -> bool {
        self.tag(reg) == AliasTag::HalfValid
    }

    pub fn is_bytes_valid(&self, reg: Gpr) -> bool {
        self.tag(reg) == AliasTag::BytesValid
    }

    /// All registers back at full width, the state expected at trace exits.
    pub fn is_fully_wide(&self) -> bool {
        self.0 == 0
    }

    /// The memoization key for a translation point.
    pub fn key(&self, pc: u32) -> TraceKey {
        TraceKey { pc, state: *self }
    }
}

/// Identity of a translation point: a pc plus the alias state it was reached
/// with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceKey {
    pub pc: u32,
    pub state: RegAliasState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_fully_wide() {
        let state = RegAliasState::default();
        assert!(state.is_fully_wide());
        for gpr in Gpr::ALL {
            assert_eq!(state.tag(gpr), AliasTag::WideValid);
        }
    }

    #[test]
    fn tags_are_independent_per_register() {
        let mut state = RegAliasState::default();
        state.set_tag(Gpr::Eax, AliasTag::BytesValid);
        state.set_tag(Gpr::Esi, AliasTag::HalfValid);
        assert_eq!(state.tag(Gpr::Eax), AliasTag::BytesValid);
        assert_eq!(state.tag(Gpr::Esi), AliasTag::HalfValid);
        assert_eq!(state.tag(Gpr::Ecx), AliasTag::WideValid);
        state.set_tag(Gpr::Eax, AliasTag::WideValid);
        assert_eq!(state.tag(Gpr::Eax), AliasTag::WideValid);
        assert_eq!(state.tag(Gpr::Esi), AliasTag::HalfValid);
    }

    #[test]
    fn keys_distinguish_pc_and_state() {
        let wide = RegAliasState::default();
        let mut narrow = wide;
        narrow.set_tag(Gpr::Edx, AliasTag::HalfValid);
        assert_eq!(wide.key(0x1000), wide.key(0x1000));
        assert_ne!(wide.key(0x1000), wide.key(0x1004));
        assert_ne!(wide.key(0x1000), narrow.key(0x1000));
    }
}
