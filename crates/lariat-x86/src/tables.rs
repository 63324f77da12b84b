//! Opcode dispatch tables.
//!
//! Each entry describes the *shape* of an instruction (ModRM presence,
//! immediate size, direction) plus a semantic class; the decoder turns the
//! pair into a concrete [`crate::InstKind`]. Unmapped opcodes stay
//! [`Entry::Bad`] so they decode to a deferred bad-instruction rather than an
//! error. Prefix bytes are marked [`Entry::Prefix`]; the scanner consumes
//! them before table lookup ever happens.

use lariat_types::{AluOp, Flag, ShiftOp, Width};

use crate::inst::{ControlReg, ImmKind};

/// 8/16/32 size policy declared by the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SizeSpec {
    /// Always 8 bits.
    Byte,
    /// 32 bits, or 16 under the operand-size override.
    WordDword,
    /// The class fixes its own widths.
    Fixed,
}

/// Semantic class of an opcode. Condition codes and register indices are
/// carried as raw encoding fields and resolved by the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpClass {
    Alu(AluOp),
    Cmp,
    Test,
    Mov,
    /// Accumulator <-> absolute-offset move; `store` when memory is written.
    MovMoffs { store: bool },
    /// Segment-register move; `to_rm` for the store direction.
    MovSeg { to_rm: bool },
    /// mov reg, imm with the register in the low opcode bits.
    MovRegImm(u8),
    Lea,
    IncReg(u8),
    DecReg(u8),
    IncRm,
    DecRm,
    PushReg(u8),
    PopReg(u8),
    PushImm,
    PushRm,
    PopRm,
    /// Conditional jump; the field is the condition nibble.
    Jcc(u8),
    JmpRel,
    JmpRm,
    CallRel,
    CallRm,
    Ret { far: bool },
    Leave,
    Int,
    Nop,
    Movs,
    Shift(ShiftOp),
    Not,
    Neg,
    Mul,
    Div,
    Imul,
    Setcc(u8),
    Cmov(u8),
    Movzx(Width),
    Movsx(Width),
    CmpXchg,
    Rdtsc,
    SetFlag(Flag, bool),
    Control { reg: ControlReg, store: bool },
}

/// Shape + class for one opcode (or one group extension).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OpSpec {
    pub class: OpClass,
    pub size: SizeSpec,
    pub has_modrm: bool,
    pub imm: ImmKind,
    /// The rm operand is the destination.
    pub mem_dest: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Entry {
    Op(OpSpec),
    /// Opcode extended by the reg field of ModRM; unused slots stay `None`.
    Group([Option<OpSpec>; 8]),
    /// 0x0F: switch to the secondary table.
    Escape,
    /// Consumed by the prefix scanner, never reached through lookup.
    Prefix,
    /// Unmapped; decodes to a deferred bad-instruction.
    Bad,
}

const fn spec(class: OpClass, size: SizeSpec, has_modrm: bool, imm: ImmKind, mem_dest: bool) -> OpSpec {
    OpSpec {
        class,
        size,
        has_modrm,
        imm,
        mem_dest,
    }
}

const fn op(class: OpClass, size: SizeSpec, has_modrm: bool, imm: ImmKind, mem_dest: bool) -> Entry {
    Entry::Op(spec(class, size, has_modrm, imm, mem_dest))
}

/// The six encodings shared by the classic ALU row (add, or, and, sub, ...):
/// rm8,r8 / rm,r / r8,rm8 / r,rm / al,imm8 / eAX,imm.
const fn alu_row(t: &mut [Entry; 256], base: usize, alu: AluOp) {
    t[base] = op(OpClass::Alu(alu), SizeSpec::Byte, true, ImmKind::None, true);
    t[base + 1] = op(OpClass::Alu(alu), SizeSpec::WordDword, true, ImmKind::None, true);
    t[base + 2] = op(OpClass::Alu(alu), SizeSpec::Byte, true, ImmKind::None, false);
    t[base + 3] = op(OpClass::Alu(alu), SizeSpec::WordDword, true, ImmKind::None, false);
    t[base + 4] = op(OpClass::Alu(alu), SizeSpec::Byte, false, ImmKind::Byte, false);
    t[base + 5] = op(OpClass::Alu(alu), SizeSpec::WordDword, false, ImmKind::WordDword, false);
}

/// 0x80/0x81/0x83: ALU selected by the reg field, /7 being cmp.
const fn alu_group(size: SizeSpec, imm: ImmKind) -> Entry {
    Entry::Group([
        Some(spec(OpClass::Alu(AluOp::Add), size, true, imm, true)),
        Some(spec(OpClass::Alu(AluOp::Or), size, true, imm, true)),
        Some(spec(OpClass::Alu(AluOp::Adc), size, true, imm, true)),
        Some(spec(OpClass::Alu(AluOp::Sbb), size, true, imm, true)),
        Some(spec(OpClass::Alu(AluOp::And), size, true, imm, true)),
        Some(spec(OpClass::Alu(AluOp::Sub), size, true, imm, true)),
        Some(spec(OpClass::Alu(AluOp::Xor), size, true, imm, true)),
        Some(spec(OpClass::Cmp, size, true, imm, true)),
    ])
}

/// Shift/rotate group with the full eight slots (0xD0/0xD1 forms).
const fn shift_group_full(size: SizeSpec, imm: ImmKind) -> Entry {
    Entry::Group([
        Some(spec(OpClass::Shift(ShiftOp::Rol), size, true, imm, true)),
        Some(spec(OpClass::Shift(ShiftOp::Ror), size, true, imm, true)),
        Some(spec(OpClass::Shift(ShiftOp::Rcl), size, true, imm, true)),
        Some(spec(OpClass::Shift(ShiftOp::Rcr), size, true, imm, true)),
        Some(spec(OpClass::Shift(ShiftOp::Shl), size, true, imm, true)),
        Some(spec(OpClass::Shift(ShiftOp::Shr), size, true, imm, true)),
        None,
        Some(spec(OpClass::Shift(ShiftOp::Sar), size, true, imm, true)),
    ])
}

/// Shift group with only shl/shr/sar mapped (0xC1/0xD3 forms).
const fn shift_group_basic(size: SizeSpec, imm: ImmKind) -> Entry {
    Entry::Group([
        None,
        None,
        None,
        None,
        Some(spec(OpClass::Shift(ShiftOp::Shl), size, true, imm, true)),
        Some(spec(OpClass::Shift(ShiftOp::Shr), size, true, imm, true)),
        None,
        Some(spec(OpClass::Shift(ShiftOp::Sar), size, true, imm, true)),
    ])
}

/// 0xF6/0xF7: test/not/neg/mul/div selected by the reg field.
const fn unary_group(size: SizeSpec, test_imm: ImmKind) -> Entry {
    Entry::Group([
        Some(spec(OpClass::Test, size, true, test_imm, true)),
        None,
        Some(spec(OpClass::Not, size, true, ImmKind::None, true)),
        Some(spec(OpClass::Neg, size, true, ImmKind::None, true)),
        Some(spec(OpClass::Mul, size, true, ImmKind::None, true)),
        None,
        Some(spec(OpClass::Div, size, true, ImmKind::None, true)),
        None,
    ])
}

const fn build_primary() -> [Entry; 256] {
    let mut t = [Entry::Bad; 256];

    alu_row(&mut t, 0x00, AluOp::Add);
    alu_row(&mut t, 0x08, AluOp::Or);
    t[0x0F] = Entry::Escape;
    // sbb: only the rm-destination pair is mapped.
    t[0x18] = op(OpClass::Alu(AluOp::Sbb), SizeSpec::Byte, true, ImmKind::None, true);
    t[0x19] = op(OpClass::Alu(AluOp::Sbb), SizeSpec::WordDword, true, ImmKind::None, true);
    alu_row(&mut t, 0x20, AluOp::And);
    alu_row(&mut t, 0x28, AluOp::Sub);
    alu_row(&mut t, 0x30, AluOp::Xor);
    // cmp shares the ALU row shape but discards its result.
    t[0x38] = op(OpClass::Cmp, SizeSpec::Byte, true, ImmKind::None, true);
    t[0x39] = op(OpClass::Cmp, SizeSpec::WordDword, true, ImmKind::None, true);
    t[0x3A] = op(OpClass::Cmp, SizeSpec::Byte, true, ImmKind::None, false);
    t[0x3B] = op(OpClass::Cmp, SizeSpec::WordDword, true, ImmKind::None, false);
    t[0x3C] = op(OpClass::Cmp, SizeSpec::Byte, false, ImmKind::Byte, false);
    t[0x3D] = op(OpClass::Cmp, SizeSpec::WordDword, false, ImmKind::WordDword, false);

    let mut r = 0u8;
    while r < 8 {
        let i = r as usize;
        t[0x40 + i] = op(OpClass::IncReg(r), SizeSpec::WordDword, false, ImmKind::None, false);
        t[0x48 + i] = op(OpClass::DecReg(r), SizeSpec::WordDword, false, ImmKind::None, false);
        t[0x50 + i] = op(OpClass::PushReg(r), SizeSpec::WordDword, false, ImmKind::None, false);
        t[0x58 + i] = op(OpClass::PopReg(r), SizeSpec::WordDword, false, ImmKind::None, false);
        r += 1;
    }

    // 0x26/0x2E/0x36/0x3E/0x64/0x65/0x66/0x67 and 0xF0/0xF2/0xF3 are prefix
    // bytes; the scanner owns them.
    t[0x26] = Entry::Prefix;
    t[0x2E] = Entry::Prefix;
    t[0x36] = Entry::Prefix;
    t[0x3E] = Entry::Prefix;
    t[0x64] = Entry::Prefix;
    t[0x65] = Entry::Prefix;
    t[0x66] = Entry::Prefix;
    t[0x67] = Entry::Prefix;
    t[0xF0] = Entry::Prefix;
    t[0xF2] = Entry::Prefix;
    t[0xF3] = Entry::Prefix;

    t[0x68] = op(OpClass::PushImm, SizeSpec::WordDword, false, ImmKind::WordDword, false);
    t[0x69] = op(OpClass::Imul, SizeSpec::WordDword, true, ImmKind::WordDword, false);
    t[0x6A] = op(OpClass::PushImm, SizeSpec::WordDword, false, ImmKind::Byte, false);
    t[0x6B] = op(OpClass::Imul, SizeSpec::WordDword, true, ImmKind::Byte, false);

    let mut cc = 0u8;
    while cc < 16 {
        t[0x70 + cc as usize] = op(OpClass::Jcc(cc), SizeSpec::Byte, false, ImmKind::Byte, false);
        cc += 1;
    }

    t[0x80] = alu_group(SizeSpec::Byte, ImmKind::Byte);
    t[0x81] = alu_group(SizeSpec::WordDword, ImmKind::WordDword);
    t[0x83] = alu_group(SizeSpec::WordDword, ImmKind::Byte);
    t[0x84] = op(OpClass::Test, SizeSpec::Byte, true, ImmKind::None, true);
    t[0x85] = op(OpClass::Test, SizeSpec::WordDword, true, ImmKind::None, true);
    t[0x88] = op(OpClass::Mov, SizeSpec::Byte, true, ImmKind::None, true);
    t[0x89] = op(OpClass::Mov, SizeSpec::WordDword, true, ImmKind::None, true);
    t[0x8A] = op(OpClass::Mov, SizeSpec::Byte, true, ImmKind::None, false);
    t[0x8B] = op(OpClass::Mov, SizeSpec::WordDword, true, ImmKind::None, false);
    t[0x8C] = op(OpClass::MovSeg { to_rm: true }, SizeSpec::Fixed, true, ImmKind::None, true);
    t[0x8D] = op(OpClass::Lea, SizeSpec::WordDword, true, ImmKind::None, false);
    t[0x8E] = op(OpClass::MovSeg { to_rm: false }, SizeSpec::Fixed, true, ImmKind::None, false);
    t[0x8F] = Entry::Group([
        Some(spec(OpClass::PopRm, SizeSpec::WordDword, true, ImmKind::None, true)),
        None,
        None,
        None,
        None,
        None,
        None,
        None,
    ]);
    t[0x90] = op(OpClass::Nop, SizeSpec::Fixed, false, ImmKind::None, false);

    t[0xA0] = op(OpClass::MovMoffs { store: false }, SizeSpec::Byte, false, ImmKind::AddrWord, false);
    t[0xA1] = op(OpClass::MovMoffs { store: false }, SizeSpec::WordDword, false, ImmKind::AddrWord, false);
    t[0xA2] = op(OpClass::MovMoffs { store: true }, SizeSpec::Byte, false, ImmKind::AddrWord, false);
    t[0xA3] = op(OpClass::MovMoffs { store: true }, SizeSpec::WordDword, false, ImmKind::AddrWord, false);
    t[0xA4] = op(OpClass::Movs, SizeSpec::Byte, false, ImmKind::None, false);
    t[0xA5] = op(OpClass::Movs, SizeSpec::WordDword, false, ImmKind::None, false);

    let mut r = 0u8;
    while r < 8 {
        let i = r as usize;
        t[0xB0 + i] = op(OpClass::MovRegImm(r), SizeSpec::Byte, false, ImmKind::Byte, false);
        t[0xB8 + i] = op(OpClass::MovRegImm(r), SizeSpec::WordDword, false, ImmKind::WordDword, false);
        r += 1;
    }

    t[0xC1] = shift_group_basic(SizeSpec::WordDword, ImmKind::Byte);
    t[0xC2] = op(OpClass::Ret { far: false }, SizeSpec::Fixed, false, ImmKind::Word, false);
    t[0xC3] = op(OpClass::Ret { far: false }, SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xC6] = op(OpClass::Mov, SizeSpec::Byte, true, ImmKind::Byte, true);
    t[0xC7] = op(OpClass::Mov, SizeSpec::WordDword, true, ImmKind::WordDword, true);
    t[0xC9] = op(OpClass::Leave, SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xCA] = op(OpClass::Ret { far: true }, SizeSpec::Fixed, false, ImmKind::Word, false);
    t[0xCB] = op(OpClass::Ret { far: true }, SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xCD] = op(OpClass::Int, SizeSpec::Fixed, false, ImmKind::Byte, false);

    t[0xD0] = shift_group_full(SizeSpec::Byte, ImmKind::One);
    t[0xD1] = shift_group_full(SizeSpec::WordDword, ImmKind::One);
    // Shift by CL: no immediate bytes, the count comes from the register.
    t[0xD3] = shift_group_basic(SizeSpec::WordDword, ImmKind::None);
    t[0xD9] = Entry::Group([
        None,
        None,
        None,
        None,
        None,
        Some(spec(OpClass::Control { reg: ControlReg::FpuCw, store: false }, SizeSpec::Fixed, true, ImmKind::None, false)),
        None,
        Some(spec(OpClass::Control { reg: ControlReg::FpuCw, store: true }, SizeSpec::Fixed, true, ImmKind::None, true)),
    ]);

    t[0xE8] = op(OpClass::CallRel, SizeSpec::WordDword, false, ImmKind::WordDword, false);
    t[0xE9] = op(OpClass::JmpRel, SizeSpec::WordDword, false, ImmKind::WordDword, false);
    t[0xEB] = op(OpClass::JmpRel, SizeSpec::Byte, false, ImmKind::Byte, false);

    t[0xF6] = unary_group(SizeSpec::Byte, ImmKind::Byte);
    t[0xF7] = unary_group(SizeSpec::WordDword, ImmKind::WordDword);
    t[0xF8] = op(OpClass::SetFlag(Flag::Cf, false), SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xF9] = op(OpClass::SetFlag(Flag::Cf, true), SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xFA] = op(OpClass::SetFlag(Flag::If, false), SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xFB] = op(OpClass::SetFlag(Flag::If, true), SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xFC] = op(OpClass::SetFlag(Flag::Df, false), SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xFD] = op(OpClass::SetFlag(Flag::Df, true), SizeSpec::Fixed, false, ImmKind::None, false);
    t[0xFF] = Entry::Group([
        Some(spec(OpClass::IncRm, SizeSpec::WordDword, true, ImmKind::None, true)),
        None,
        Some(spec(OpClass::CallRm, SizeSpec::WordDword, true, ImmKind::None, false)),
        None,
        Some(spec(OpClass::JmpRm, SizeSpec::WordDword, true, ImmKind::None, false)),
        None,
        Some(spec(OpClass::PushRm, SizeSpec::WordDword, true, ImmKind::None, false)),
        None,
    ]);

    t
}

const fn build_secondary() -> [Entry; 256] {
    let mut t = [Entry::Bad; 256];

    t[0x31] = op(OpClass::Rdtsc, SizeSpec::Fixed, false, ImmKind::None, false);

    let mut cc = 0u8;
    while cc < 16 {
        let i = cc as usize;
        t[0x40 + i] = op(OpClass::Cmov(cc), SizeSpec::WordDword, true, ImmKind::None, false);
        t[0x80 + i] = op(OpClass::Jcc(cc), SizeSpec::WordDword, false, ImmKind::WordDword, false);
        t[0x90 + i] = op(OpClass::Setcc(cc), SizeSpec::Byte, true, ImmKind::None, true);
        cc += 1;
    }

    t[0xAE] = Entry::Group([
        None,
        None,
        Some(spec(OpClass::Control { reg: ControlReg::Mxcsr, store: false }, SizeSpec::Fixed, true, ImmKind::None, false)),
        Some(spec(OpClass::Control { reg: ControlReg::Mxcsr, store: true }, SizeSpec::Fixed, true, ImmKind::None, true)),
        None,
        None,
        None,
        None,
    ]);
    t[0xAF] = op(OpClass::Imul, SizeSpec::WordDword, true, ImmKind::None, false);
    t[0xB0] = op(OpClass::CmpXchg, SizeSpec::Byte, true, ImmKind::None, true);
    t[0xB1] = op(OpClass::CmpXchg, SizeSpec::WordDword, true, ImmKind::None, true);
    t[0xB6] = op(OpClass::Movzx(Width::W8), SizeSpec::WordDword, true, ImmKind::None, false);
    t[0xB7] = op(OpClass::Movzx(Width::W16), SizeSpec::Fixed, true, ImmKind::None, false);
    t[0xBE] = op(OpClass::Movsx(Width::W8), SizeSpec::WordDword, true, ImmKind::None, false);
    t[0xBF] = op(OpClass::Movsx(Width::W16), SizeSpec::Fixed, true, ImmKind::None, false);

    t
}

pub(crate) static PRIMARY: [Entry; 256] = build_primary();
pub(crate) static SECONDARY: [Entry; 256] = build_secondary();
