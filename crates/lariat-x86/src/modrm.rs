//! ModRM and SIB byte decoding.

use lariat_types::{Gpr, Width};

/// A decoded ModRM byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn from_byte(byte: u8) -> ModRm {
        ModRm {
            mode: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }

    /// The reg field doubles as a secondary opcode for group opcodes.
    pub fn opcode_ext(&self) -> u8 {
        self.reg
    }

    /// A SIB byte follows only for 32-bit addressing with a memory operand
    /// whose rm field selects it.
    pub fn has_sib(&self, addr_width: Width) -> bool {
        addr_width == Width::W32 && self.mode != 3 && self.rm == 4
    }

    /// Size in bits of the displacement that follows, per (mod, rm) and the
    /// effective address width. With mod=0, rm=5 under 32-bit addressing the
    /// "displacement" is an absolute address with no base register; the
    /// 16-bit analogue is mod=0, rm=6.
    pub fn displacement_bits(&self, addr_width: Width, sib: Option<Sib>) -> u8 {
        match self.mode {
            0 => match addr_width {
                Width::W32 => {
                    let sib_no_base = sib.is_some_and(|s| s.base(self.mode).is_none());
                    if self.rm == 5 || (self.rm == 4 && sib_no_base) {
                        32
                    } else {
                        0
                    }
                }
                _ => {
                    if self.rm == 6 {
                        16
                    } else {
                        0
                    }
                }
            },
            1 => 8,
            2 => {
                if addr_width == Width::W32 {
                    32
                } else {
                    16
                }
            }
            _ => 0,
        }
    }
}

/// A decoded SIB byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sib {
    pub scale_bits: u8,
    pub index_bits: u8,
    pub base_bits: u8,
}

impl Sib {
    pub fn from_byte(byte: u8) -> Sib {
        Sib {
            scale_bits: byte >> 6,
            index_bits: (byte >> 3) & 7,
            base_bits: byte & 7,
        }
    }

    /// Multiplier applied to the index register.
    pub fn scale(&self) -> u8 {
        1 << self.scale_bits
    }

    /// The index register, if any. index=4 encodes "no index".
    pub fn index(&self) -> Option<Gpr> {
        if self.index_bits == 4 {
            None
        } else {
            Gpr::from_index(self.index_bits)
        }
    }

    /// The base register, if any. base=5 with mod=0 encodes "no base,
    /// 32-bit displacement instead".
    pub fn base(&self, modrm_mode: u8) -> Option<Gpr> {
        if self.base_bits == 5 && modrm_mode == 0 {
            None
        } else {
            Gpr::from_index(self.base_bits)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_unpack_in_encoding_order() {
        let m = ModRm::from_byte(0xC0);
        assert_eq!((m.mode, m.reg, m.rm), (3, 0, 0));
        let m = ModRm::from_byte(0x54);
        assert_eq!((m.mode, m.reg, m.rm), (1, 2, 4));
    }

    #[test]
    fn sib_follows_only_for_memory_rm4_with_32bit_addressing() {
        assert!(ModRm::from_byte(0x04).has_sib(Width::W32));
        assert!(ModRm::from_byte(0x44).has_sib(Width::W32));
        assert!(!ModRm::from_byte(0xC4).has_sib(Width::W32));
        assert!(!ModRm::from_byte(0x04).has_sib(Width::W16));
        assert!(!ModRm::from_byte(0x05).has_sib(Width::W32));
    }

    #[test]
    fn displacement_sizes_follow_the_mod_table() {
        // mod=0, rm=5: 32-bit absolute.
        assert_eq!(ModRm::from_byte(0x05).displacement_bits(Width::W32, None), 32);
        // mod=0, plain base register: none.
        assert_eq!(ModRm::from_byte(0x00).displacement_bits(Width::W32, None), 0);
        // mod=1: always 8.
        assert_eq!(ModRm::from_byte(0x40).displacement_bits(Width::W32, None), 8);
        // mod=2: full width.
        assert_eq!(ModRm::from_byte(0x80).displacement_bits(Width::W32, None), 32);
        assert_eq!(ModRm::from_byte(0x80).displacement_bits(Width::W16, None), 16);
        // mod=3: register operand, no displacement.
        assert_eq!(ModRm::from_byte(0xC0).displacement_bits(Width::W32, None), 0);
        // mod=0 with a baseless SIB: 32-bit displacement.
        let sib = Sib::from_byte(0x25); // no index, base=5
        assert_eq!(
            ModRm::from_byte(0x04).displacement_bits(Width::W32, Some(sib)),
            32
        );
        // 16-bit addressing, mod=0, rm=6: 16-bit absolute.
        assert_eq!(ModRm::from_byte(0x06).displacement_bits(Width::W16, None), 16);
    }

    #[test]
    fn sib_base_and_index_special_cases() {
        let s = Sib::from_byte(0x25);
        assert_eq!(s.index(), None);
        assert_eq!(s.base(0), None);
        assert_eq!(s.base(1), Some(Gpr::Ebp));

        let s = Sib::from_byte(0x98); // scale=2, index=3(ebx), base=0(eax)
        assert_eq!(s.scale(), 4);
        assert_eq!(s.index(), Some(Gpr::Ebx));
        assert_eq!(s.base(0), Some(Gpr::Eax));
    }
}
