//! The operand model: immediates, register views, segment registers, and
//! memory references.
//!
//! Operands are plain data. Loading, storing, and effective-address
//! computation are emission-time concerns and live with the trace builder;
//! the decoder only resolves *which* operand an instruction names.

use std::fmt;

use lariat_types::{Gpr, Reg8, Seg, Width};

use crate::modrm::{ModRm, Sib};
use crate::prefix::Prefixes;

/// A register operand at one of the three access widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegView {
    R8(Reg8),
    R16(Gpr),
    R32(Gpr),
}

impl RegView {
    /// The register view selected by a 3-bit encoding field at `width`.
    pub fn from_index(idx: u8, width: Width) -> Option<RegView> {
        Some(match width {
            Width::W8 => RegView::R8(Reg8::from_index(idx)?),
            Width::W16 => RegView::R16(Gpr::from_index(idx)?),
            Width::W32 => RegView::R32(Gpr::from_index(idx)?),
        })
    }

    /// Infallible variant of `from_index` for fields already masked to three
    /// bits.
    pub fn from_bits(bits: u8, width: Width) -> RegView {
        match width {
            Width::W8 => RegView::R8(Reg8::from_bits(bits)),
            Width::W16 => RegView::R16(Gpr::from_bits(bits)),
            Width::W32 => RegView::R32(Gpr::from_bits(bits)),
        }
    }

    pub fn width(self) -> Width {
        match self {
            RegView::R8(_) => Width::W8,
            RegView::R16(_) => Width::W16,
            RegView::R32(_) => Width::W32,
        }
    }

    /// The full-width register this view aliases.
    pub fn gpr(self) -> Gpr {
        match self {
            RegView::R8(r) => r.gpr,
            RegView::R16(g) | RegView::R32(g) => g,
        }
    }
}

impl fmt::Display for RegView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegView::R8(r) => write!(f, "{r}"),
            RegView::R16(g) => f.write_str(g.name16()),
            RegView::R32(g) => write!(f, "{g}"),
        }
    }
}

/// A memory reference: segment + base + scaled index + displacement.
///
/// Effective-address arithmetic is fixed as index*scale, then + base, then
/// + displacement, then + segment base, with 32-bit wraparound at each step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRef {
    pub seg: Seg,
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    /// Multiplier for the index register; meaningless when `index` is None.
    pub scale: u8,
    pub disp: i32,
    pub addr_width: Width,
    pub width: Width,
}

impl MemRef {
    /// A stack-top reference through SS:ESP.
    pub fn stack(addr_width: Width, width: Width) -> MemRef {
        MemRef {
            seg: Seg::Ss,
            base: Some(Gpr::Esp),
            index: None,
            scale: 0,
            disp: 0,
            addr_width,
            width,
        }
    }

    /// A plain [seg:base] reference, as used by the string operations.
    pub fn based(seg: Seg, base: Gpr, addr_width: Width, width: Width) -> MemRef {
        MemRef {
            seg,
            base: Some(base),
            index: None,
            scale: 0,
            disp: 0,
            addr_width,
            width,
        }
    }

    /// An absolute [seg:disp] reference.
    pub fn absolute(seg: Seg, disp: i32, addr_width: Width, width: Width) -> MemRef {
        MemRef {
            seg,
            base: None,
            index: None,
            scale: 0,
            disp,
            addr_width,
            width,
        }
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[", self.seg)?;
        let mut sep = "";
        if let Some(base) = self.base {
            write!(f, "{base}")?;
            sep = "+";
        }
        if let Some(index) = self.index {
            write!(f, "{sep}{index}*{}", self.scale)?;
            sep = "+";
        }
        if self.disp != 0 || (self.base.is_none() && self.index.is_none()) {
            write!(f, "{sep}{:#x}", self.disp)?;
        }
        f.write_str("]")
    }
}

/// A fully resolved instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Imm(i32),
    Reg(RegView),
    SegReg(Seg),
    Mem(MemRef),
}

impl Operand {
    pub fn reg(idx: u8, width: Width) -> Option<Operand> {
        RegView::from_index(idx, width).map(Operand::Reg)
    }

    pub fn is_assignable(&self) -> bool {
        !matches!(self, Operand::Imm(_))
    }

    pub fn width(&self) -> Option<Width> {
        match self {
            Operand::Imm(_) => None,
            Operand::Reg(r) => Some(r.width()),
            Operand::SegReg(_) => Some(Width::W16),
            Operand::Mem(m) => Some(m.width),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm(v) => write!(f, "{v:#x}"),
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::SegReg(s) => write!(f, "{s}"),
            Operand::Mem(m) => write!(f, "{m}"),
        }
    }
}

/// Resolve the rm field of a ModRM byte into a register or memory operand.
///
/// Only 32-bit addressing forms are supported; 16-bit addressing of a memory
/// operand is reported as `None` and surfaces as a bad instruction.
pub(crate) fn rm_operand(
    modrm: ModRm,
    sib: Option<Sib>,
    disp: i32,
    prefixes: &Prefixes,
    width: Width,
    default_seg: Seg,
) -> Option<Operand> {
    if modrm.mode == 3 {
        return Operand::reg(modrm.rm, width);
    }
    let addr_width = prefixes.address_width();
    if addr_width != Width::W32 {
        return None;
    }
    let seg = prefixes.segment_or(default_seg);
    let mem = match (modrm.mode, modrm.rm) {
        (0, 4) | (1, 4) | (2, 4) => {
            let sib = sib?;
            MemRef {
                seg,
                base: sib.base(modrm.mode),
                index: sib.index(),
                scale: sib.scale(),
                disp,
                addr_width,
                width,
            }
        }
        (0, 5) => MemRef::absolute(seg, disp, addr_width, width),
        (0, rm) => MemRef {
            disp: 0,
            ..MemRef::based(seg, Gpr::from_index(rm)?, addr_width, width)
        },
        (_, rm) => MemRef {
            disp,
            ..MemRef::based(seg, Gpr::from_index(rm)?, addr_width, width)
        },
    };
    Some(Operand::Mem(mem))
}
