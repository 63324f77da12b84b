//! Shared scalar types for the x86 translation front end.
//!
//! Everything here is `Copy` and dependency-free so both the decoder and the
//! trace builder can speak the same vocabulary without pulling each other in.

use std::fmt;

/// General-purpose register, in x86 encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    pub fn from_index(idx: u8) -> Option<Gpr> {
        Self::ALL.get(usize::from(idx)).copied()
    }

    /// Like `from_index`, for encoding fields already masked to three bits.
    pub fn from_bits(bits: u8) -> Gpr {
        Self::ALL[usize::from(bits & 7)]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name32(self) -> &'static str {
        match self {
            Gpr::Eax => "eax",
            Gpr::Ecx => "ecx",
            Gpr::Edx => "edx",
            Gpr::Ebx => "ebx",
            Gpr::Esp => "esp",
            Gpr::Ebp => "ebp",
            Gpr::Esi => "esi",
            Gpr::Edi => "edi",
        }
    }

    pub fn name16(self) -> &'static str {
        // Strip the leading "e".
        &self.name32()[1..]
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name32())
    }
}

/// An 8-bit register view: the low or high byte of one of the first four GPRs.
///
/// Encoding indices 0-3 select AL/CL/DL/BL, 4-7 select AH/CH/DH/BH.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reg8 {
    pub gpr: Gpr,
    pub high: bool,
}

impl Reg8 {
    pub fn from_index(idx: u8) -> Option<Reg8> {
        if idx < 8 {
            Some(Reg8 {
                gpr: Gpr::from_index(idx & 3)?,
                high: idx >= 4,
            })
        } else {
            None
        }
    }

    /// Like `from_index`, for encoding fields already masked to three bits.
    pub fn from_bits(bits: u8) -> Reg8 {
        Reg8 {
            gpr: Gpr::from_bits(bits & 3),
            high: bits & 4 != 0,
        }
    }

    pub fn name(self) -> &'static str {
        match (self.gpr, self.high) {
            (Gpr::Eax, false) => "al",
            (Gpr::Ecx, false) => "cl",
            (Gpr::Edx, false) => "dl",
            (Gpr::Ebx, false) => "bl",
            (Gpr::Eax, true) => "ah",
            (Gpr::Ecx, true) => "ch",
            (Gpr::Edx, true) => "dh",
            (Gpr::Ebx, true) => "bh",
            _ => unreachable!("no 8-bit view of {:?}", self.gpr),
        }
    }
}

impl fmt::Display for Reg8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Segment register, in x86 encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Seg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl Seg {
    pub const ALL: [Seg; 6] = [Seg::Es, Seg::Cs, Seg::Ss, Seg::Ds, Seg::Fs, Seg::Gs];

    pub fn from_index(idx: u8) -> Option<Seg> {
        Self::ALL.get(usize::from(idx)).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Seg::Es => "es",
            Seg::Cs => "cs",
            Seg::Ss => "ss",
            Seg::Ds => "ds",
            Seg::Fs => "fs",
            Seg::Gs => "gs",
        }
    }
}

impl fmt::Display for Seg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operand or address width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
        }
    }

    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }

    pub fn mask(self) -> u32 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
        }
    }

    /// The 16<->32 swap applied by the operand-size and address-size override
    /// prefixes. 8-bit widths are never affected.
    pub fn swapped(self) -> Width {
        match self {
            Width::W8 => Width::W8,
            Width::W16 => Width::W32,
            Width::W32 => Width::W16,
        }
    }
}

/// x86 condition codes, in the encoding order of the low opcode nibble of
/// Jcc/SETcc/CMOVcc.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cond {
    /// Overflow.
    O = 0,
    /// Not overflow.
    No = 1,
    /// Below (unsigned).
    B = 2,
    /// Above or equal (unsigned).
    Ae = 3,
    /// Equal.
    E = 4,
    /// Not equal.
    Ne = 5,
    /// Below or equal (unsigned).
    Be = 6,
    /// Above (unsigned).
    A = 7,
    /// Sign set.
    S = 8,
    /// Sign clear.
    Ns = 9,
    /// Parity even.
    P = 10,
    /// Parity odd.
    Np = 11,
    /// Less (signed).
    L = 12,
    /// Greater or equal (signed).
    Ge = 13,
    /// Less or equal (signed).
    Le = 14,
    /// Greater (signed).
    G = 15,
}

impl Cond {
    pub fn from_low_nibble(nibble: u8) -> Cond {
        const TABLE: [Cond; 16] = [
            Cond::O,
            Cond::No,
            Cond::B,
            Cond::Ae,
            Cond::E,
            Cond::Ne,
            Cond::Be,
            Cond::A,
            Cond::S,
            Cond::Ns,
            Cond::P,
            Cond::Np,
            Cond::L,
            Cond::Ge,
            Cond::Le,
            Cond::G,
        ];
        TABLE[usize::from(nibble & 0xF)]
    }

    pub fn mnemonic_suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

/// Two-operand ALU operators that share the read/op/flags/write emission
/// shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
}

impl AluOp {
    /// Operator order of the 0x80/0x81/0x83 immediate groups (reg field 0-6;
    /// 7 is cmp, which is handled as a discarded sub).
    pub fn from_group_index(idx: u8) -> Option<AluOp> {
        Some(match idx {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::Adc => "adc",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
        }
    }
}

/// Shift and rotate operators of the 0xC0/0xC1/0xD0-0xD3 groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ShiftOp::Rol => "rol",
            ShiftOp::Ror => "ror",
            ShiftOp::Rcl => "rcl",
            ShiftOp::Rcr => "rcr",
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sar => "sar",
        }
    }
}

/// Individual status/control flags tracked by the translator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    Of,
    Df,
    /// Interrupt enable, toggled by cli/sti.
    If,
}

impl Flag {
    pub const ALL: [Flag; 8] = [
        Flag::Cf,
        Flag::Pf,
        Flag::Af,
        Flag::Zf,
        Flag::Sf,
        Flag::Of,
        Flag::Df,
        Flag::If,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Flag::Cf => "cf",
            Flag::Pf => "pf",
            Flag::Af => "af",
            Flag::Zf => "zf",
            Flag::Sf => "sf",
            Flag::Of => "of",
            Flag::Df => "df",
            Flag::If => "if",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
