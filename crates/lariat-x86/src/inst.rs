//! Decoded-instruction representation.

use std::fmt;

use lariat_types::{AluOp, Cond, Flag, ShiftOp, Width};
use thiserror::Error;

use crate::modrm::{ModRm, Sib};
use crate::operand::{MemRef, Operand, RegView};
use crate::prefix::Prefixes;

/// A decode fault. Decoding never fails outright: faults are carried inside
/// [`InstKind::Bad`] and raised as a guest-visible illegal-instruction fault
/// only when the instruction is actually emitted.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeFault {
    #[error("unmapped opcode {opcode:#04x}")]
    UnknownOpcode { opcode: u8 },
    #[error("unmapped secondary opcode 0f {opcode:#04x}")]
    UnknownSecondaryOpcode { opcode: u8 },
    #[error("unmapped extension /{ext} of opcode {opcode:#04x}")]
    UnknownGroupExt { opcode: u8, ext: u8 },
    #[error("prefix byte {byte:#04x} repeats its group")]
    RepeatedPrefix { byte: u8 },
    #[error("unsupported 16-bit addressing form")]
    UnsupportedAddressing,
    #[error("segment register field {index} out of range")]
    BadSegmentIndex { index: u8 },
    #[error("instruction bytes run past the end of the image")]
    UnexpectedEnd,
}

/// Immediate-field size as declared by the opcode table, before the
/// operand-size override is applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImmKind {
    #[default]
    None,
    /// 8-bit, sign-extended.
    Byte,
    /// Fixed 16-bit, never swapped (ret imm16).
    Word,
    /// 16 or 32 bits, following the effective operand size.
    WordDword,
    /// 16 or 32 bits, following the effective *address* size (moffs forms).
    AddrWord,
    /// No bytes fetched; the immediate is the constant 1 (shift-by-one).
    One,
}

impl ImmKind {
    /// Bits fetched from the instruction stream.
    pub fn bits(self, prefixes: &Prefixes) -> u8 {
        match self {
            ImmKind::None | ImmKind::One => 0,
            ImmKind::Byte => 8,
            ImmKind::Word => 16,
            ImmKind::WordDword => prefixes.apply_operand_size(Width::W32).bits() as u8,
            ImmKind::AddrWord => prefixes.address_width().bits() as u8,
        }
    }
}

/// Operand-shape policy declared by the opcode table entry that matched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpShape {
    pub has_modrm: bool,
    pub imm: ImmKind,
    /// Direction bit: the rm operand is the destination.
    pub mem_dest: bool,
    /// Compare/test style: flags are computed but the result is dropped.
    pub discard_result: bool,
}

/// Control registers with load/store support.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlReg {
    FpuCw,
    Mxcsr,
}

/// The semantic operation of a decoded instruction, with operands resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstKind {
    Alu {
        op: AluOp,
        width: Width,
        dst: Operand,
        src: Operand,
    },
    /// Subtract and discard, keeping flags.
    Cmp {
        width: Width,
        lhs: Operand,
        rhs: Operand,
    },
    /// And and discard, keeping flags.
    Test {
        width: Width,
        lhs: Operand,
        rhs: Operand,
    },
    Mov {
        width: Width,
        dst: Operand,
        src: Operand,
    },
    Lea {
        dst: RegView,
        mem: MemRef,
    },
    Shift {
        op: ShiftOp,
        width: Width,
        dst: Operand,
        count: Operand,
    },
    IncDec {
        dec: bool,
        width: Width,
        dst: Operand,
    },
    Push {
        width: Width,
        src: Operand,
    },
    Pop {
        width: Width,
        dst: Operand,
    },
    /// String copy [es:edi] <- [seg:esi]; `rep` wraps it in an ECX loop.
    Movs {
        width: Width,
        rep: bool,
    },
    /// Unsigned widening multiply into EDX:EAX.
    Mul {
        width: Width,
        src: Operand,
    },
    /// Two/three-operand signed multiply.
    Imul {
        width: Width,
        dst: RegView,
        src: Operand,
        imm: Option<i32>,
    },
    /// Unsigned divide of EDX:EAX, quotient to EAX, remainder to EDX.
    Div {
        width: Width,
        src: Operand,
    },
    Not {
        width: Width,
        dst: Operand,
    },
    Neg {
        width: Width,
        dst: Operand,
    },
    JmpRel {
        target: u32,
    },
    JccRel {
        cond: Cond,
        target: u32,
        /// Taken-likelihood hint from a CS/DS prefix, if present.
        hint: Option<bool>,
    },
    CallRel {
        target: u32,
    },
    JmpInd {
        target: Operand,
    },
    CallInd {
        target: Operand,
    },
    Ret {
        far: bool,
        stack_adjust: u16,
    },
    Leave,
    Int {
        vector: u8,
    },
    Setcc {
        cond: Cond,
        dst: Operand,
    },
    Cmov {
        cond: Cond,
        width: Width,
        dst: RegView,
        src: Operand,
    },
    Movzx {
        dst: RegView,
        src: Operand,
    },
    Movsx {
        dst: RegView,
        src: Operand,
    },
    CmpXchg {
        width: Width,
        dst: Operand,
        src: RegView,
    },
    Rdtsc,
    Nop,
    SetFlag {
        flag: Flag,
        value: bool,
    },
    LoadControl {
        reg: ControlReg,
        src: Operand,
    },
    StoreControl {
        reg: ControlReg,
        dst: Operand,
    },
    /// Decode fault carrier; raises a guest fault when emitted.
    Bad {
        fault: DecodeFault,
    },
}

/// One fully decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedInst {
    pub pc: u32,
    /// Total encoded length in bytes, prefixes included.
    pub len: u8,
    pub prefixes: Prefixes,
    pub shape: OpShape,
    pub modrm: Option<ModRm>,
    pub sib: Option<Sib>,
    pub disp: i32,
    pub imm: Option<i32>,
    pub kind: InstKind,
}

impl DecodedInst {
    /// Address of the next sequential instruction.
    pub fn next_pc(&self) -> u32 {
        self.pc.wrapping_add(u32::from(self.len))
    }

    /// True when the instruction never falls through to `next_pc`.
    pub fn ends_trace_run(&self) -> bool {
        matches!(
            self.kind,
            InstKind::JmpRel { .. }
                | InstKind::JmpInd { .. }
                | InstKind::CallRel { .. }
                | InstKind::CallInd { .. }
                | InstKind::Ret { .. }
                | InstKind::Bad { .. }
        )
    }
}

impl fmt::Display for DecodedInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InstKind::Alu { op, dst, src, .. } => write!(f, "{} {dst}, {src}", op.mnemonic()),
            InstKind::Cmp { lhs, rhs, .. } => write!(f, "cmp {lhs}, {rhs}"),
            InstKind::Test { lhs, rhs, .. } => write!(f, "test {lhs}, {rhs}"),
            InstKind::Mov { dst, src, .. } => write!(f, "mov {dst}, {src}"),
            InstKind::Lea { dst, mem } => write!(f, "lea {dst}, {mem}"),
            InstKind::Shift { op, dst, count, .. } => {
                write!(f, "{} {dst}, {count}", op.mnemonic())
            }
            InstKind::IncDec { dec: false, dst, .. } => write!(f, "inc {dst}"),
            InstKind::IncDec { dec: true, dst, .. } => write!(f, "dec {dst}"),
            InstKind::Push { src, .. } => write!(f, "push {src}"),
            InstKind::Pop { dst, .. } => write!(f, "pop {dst}"),
            InstKind::Movs { width, rep } => {
                let suffix = match width {
                    Width::W8 => 'b',
                    Width::W16 => 'w',
                    Width::W32 => 'd',
                };
                if *rep {
                    write!(f, "rep movs{suffix}")
                } else {
                    write!(f, "movs{suffix}")
                }
            }
            InstKind::Mul { src, .. } => write!(f, "mul {src}"),
            InstKind::Imul {
                dst,
                src,
                imm: Some(imm),
                ..
            } => write!(f, "imul {dst}, {src}, {imm:#x}"),
            InstKind::Imul { dst, src, .. } => write!(f, "imul {dst}, {src}"),
            InstKind::Div { src, .. } => write!(f, "div {src}"),
            InstKind::Not { dst, .. } => write!(f, "not {dst}"),
            InstKind::Neg { dst, .. } => write!(f, "neg {dst}"),
            InstKind::JmpRel { target } => write!(f, "jmp {target:#x}"),
            InstKind::JccRel { cond, target, .. } => {
                write!(f, "j{} {target:#x}", cond.mnemonic_suffix())
            }
            InstKind::CallRel { target } => write!(f, "call {target:#x}"),
            InstKind::JmpInd { target } => write!(f, "jmp {target}"),
            InstKind::CallInd { target } => write!(f, "call {target}"),
            InstKind::Ret {
                far,
                stack_adjust: 0,
            } => write!(f, "ret{}", if *far { "f" } else { "" }),
            InstKind::Ret { far, stack_adjust } => {
                write!(f, "ret{} {stack_adjust:#x}", if *far { "f" } else { "" })
            }
            InstKind::Leave => f.write_str("leave"),
            InstKind::Int { vector } => write!(f, "int {vector:#x}"),
            InstKind::Setcc { cond, dst } => write!(f, "set{} {dst}", cond.mnemonic_suffix()),
            InstKind::Cmov { cond, dst, src, .. } => {
                write!(f, "cmov{} {dst}, {src}", cond.mnemonic_suffix())
            }
            InstKind::Movzx { dst, src } => write!(f, "movzx {dst}, {src}"),
            InstKind::Movsx { dst, src } => write!(f, "movsx {dst}, {src}"),
            InstKind::CmpXchg { dst, src, .. } => write!(f, "cmpxchg {dst}, {src}"),
            InstKind::Rdtsc => f.write_str("rdtsc"),
            InstKind::Nop => f.write_str("nop"),
            InstKind::SetFlag { flag: Flag::Cf, value } => {
                f.write_str(if *value { "stc" } else { "clc" })
            }
            InstKind::SetFlag { flag: Flag::Df, value } => {
                f.write_str(if *value { "std" } else { "cld" })
            }
            InstKind::SetFlag { value, .. } => {
                f.write_str(if *value { "sti" } else { "cli" })
            }
            InstKind::LoadControl { reg: ControlReg::FpuCw, src } => write!(f, "fldcw {src}"),
            InstKind::LoadControl { reg: ControlReg::Mxcsr, src } => write!(f, "ldmxcsr {src}"),
            InstKind::StoreControl { reg: ControlReg::FpuCw, dst } => write!(f, "fnstcw {dst}"),
            InstKind::StoreControl { reg: ControlReg::Mxcsr, dst } => write!(f, "stmxcsr {dst}"),
            InstKind::Bad { fault } => write!(f, "(bad: {fault})"),
        }
    }
}
