//! The instruction decoder.
//!
//! `decode` is a pure function of the byte image and never fails: every
//! malformed or unmapped encoding produces an [`InstKind::Bad`] carrying the
//! fault, which the trace builder turns into a guest illegal-instruction
//! exit only if execution actually reaches it.

use lariat_types::{Cond, Gpr, Reg8, Seg, Width};

use crate::inst::{ControlReg, DecodeFault, DecodedInst, ImmKind, InstKind, OpShape};
use crate::modrm::{ModRm, Sib};
use crate::operand::{rm_operand, MemRef, Operand, RegView};
use crate::prefix::{self, Prefixes};
use crate::tables::{Entry, OpClass, OpSpec, SizeSpec, PRIMARY, SECONDARY};
use crate::InstFetch;

/// Decode the instruction at `pc`.
pub fn decode<F: InstFetch + ?Sized>(fetch: &F, pc: u32) -> DecodedInst {
    match decode_inner(fetch, pc) {
        Ok(inst) => inst,
        Err((fault, len)) => bad(pc, len.max(1), fault),
    }
}

fn bad(pc: u32, len: u8, fault: DecodeFault) -> DecodedInst {
    DecodedInst {
        pc,
        len,
        prefixes: Prefixes::default(),
        shape: OpShape::default(),
        modrm: None,
        sib: None,
        disp: 0,
        imm: None,
        kind: InstKind::Bad { fault },
    }
}

/// Byte cursor over the instruction stream; tracks consumed length so faults
/// can report how far decoding got.
struct Reader<'a, F: ?Sized> {
    fetch: &'a F,
    pc: u32,
    len: u8,
}

impl<F: InstFetch + ?Sized> Reader<'_, F> {
    fn addr(&self) -> u32 {
        self.pc.wrapping_add(u32::from(self.len))
    }

    fn u8(&mut self) -> Result<u8, (DecodeFault, u8)> {
        let b = self
            .fetch
            .fetch8(self.addr())
            .ok_or((DecodeFault::UnexpectedEnd, self.len))?;
        self.len += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, (DecodeFault, u8)> {
        let v = self
            .fetch
            .fetch16(self.addr())
            .ok_or((DecodeFault::UnexpectedEnd, self.len))?;
        self.len += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, (DecodeFault, u8)> {
        let v = self
            .fetch
            .fetch32(self.addr())
            .ok_or((DecodeFault::UnexpectedEnd, self.len))?;
        self.len += 4;
        Ok(v)
    }
}

fn decode_inner<F: InstFetch + ?Sized>(
    fetch: &F,
    pc: u32,
) -> Result<DecodedInst, (DecodeFault, u8)> {
    let prefixes = prefix::scan(fetch, pc)?;
    let mut r = Reader {
        fetch,
        pc,
        len: prefixes.len,
    };

    let opcode = r.u8()?;
    let (entry, opcode, secondary) = match PRIMARY[usize::from(opcode)] {
        Entry::Escape => {
            let op2 = r.u8()?;
            (SECONDARY[usize::from(op2)], op2, true)
        }
        e => (e, opcode, false),
    };

    let mut modrm: Option<ModRm> = None;
    let spec: OpSpec = match entry {
        Entry::Op(s) => s,
        Entry::Group(slots) => {
            let m = ModRm::from_byte(r.u8()?);
            modrm = Some(m);
            match slots[usize::from(m.opcode_ext())] {
                Some(s) => s,
                None => {
                    return Err((
                        DecodeFault::UnknownGroupExt {
                            opcode,
                            ext: m.opcode_ext(),
                        },
                        r.len,
                    ))
                }
            }
        }
        Entry::Bad | Entry::Prefix | Entry::Escape => {
            let fault = if secondary {
                DecodeFault::UnknownSecondaryOpcode { opcode }
            } else {
                DecodeFault::UnknownOpcode { opcode }
            };
            return Err((fault, r.len));
        }
    };

    if spec.has_modrm && modrm.is_none() {
        modrm = Some(ModRm::from_byte(r.u8()?));
    }

    let addr_width = prefixes.address_width();
    let sib = match modrm {
        Some(m) if m.has_sib(addr_width) => Some(Sib::from_byte(r.u8()?)),
        _ => None,
    };

    let disp = match modrm.map_or(0, |m| m.displacement_bits(addr_width, sib)) {
        0 => 0,
        8 => i32::from(r.u8()? as i8),
        16 => i32::from(r.u16()? as i16),
        _ => r.u32()? as i32,
    };

    let imm = match spec.imm {
        ImmKind::None => None,
        ImmKind::One => Some(1),
        ImmKind::Byte => Some(i32::from(r.u8()? as i8)),
        ImmKind::Word => Some(i32::from(r.u16()?)),
        ImmKind::WordDword => Some(match prefixes.apply_operand_size(Width::W32) {
            Width::W16 => i32::from(r.u16()? as i16),
            _ => r.u32()? as i32,
        }),
        ImmKind::AddrWord => Some(match addr_width {
            Width::W16 => i32::from(r.u16()?),
            _ => r.u32()? as i32,
        }),
    };

    let len = r.len;
    let kind = classify(&spec, &prefixes, modrm, sib, disp, imm, pc, len)
        .map_err(|fault| (fault, len))?;

    Ok(DecodedInst {
        pc,
        len,
        prefixes,
        shape: OpShape {
            has_modrm: spec.has_modrm,
            imm: spec.imm,
            mem_dest: spec.mem_dest,
            discard_result: matches!(spec.class, OpClass::Cmp | OpClass::Test),
        },
        modrm,
        sib,
        disp,
        imm,
        kind,
    })
}

#[allow(clippy::too_many_arguments)]
fn classify(
    spec: &OpSpec,
    prefixes: &Prefixes,
    modrm: Option<ModRm>,
    sib: Option<Sib>,
    disp: i32,
    imm: Option<i32>,
    pc: u32,
    len: u8,
) -> Result<InstKind, DecodeFault> {
    let width = match spec.size {
        SizeSpec::Byte => Width::W8,
        SizeSpec::WordDword => prefixes.apply_operand_size(Width::W32),
        SizeSpec::Fixed => Width::W32,
    };
    let next = pc.wrapping_add(u32::from(len));
    let imm_val = imm.unwrap_or(0);

    // The rm operand, with its default segment. Only resolvable when the
    // shape declared a ModRM byte.
    let rm = |w: Width, default_seg: Seg| -> Result<Operand, DecodeFault> {
        let m = modrm.ok_or(DecodeFault::UnsupportedAddressing)?;
        rm_operand(m, sib, disp, prefixes, w, default_seg)
            .ok_or(DecodeFault::UnsupportedAddressing)
    };
    let reg_field = |w: Width| -> RegView {
        RegView::from_bits(modrm.map_or(0, |m| m.reg), w)
    };
    let acc = |w: Width| Operand::Reg(RegView::from_bits(0, w));

    Ok(match spec.class {
        OpClass::Alu(op) => {
            let (dst, src) = if !spec.has_modrm {
                (acc(width), Operand::Imm(imm_val))
            } else if spec.imm != ImmKind::None {
                (rm(width, Seg::Ds)?, Operand::Imm(imm_val))
            } else {
                let rm = rm(width, Seg::Ds)?;
                let reg = Operand::Reg(reg_field(width));
                if spec.mem_dest {
                    (rm, reg)
                } else {
                    (reg, rm)
                }
            };
            InstKind::Alu {
                op,
                width,
                dst,
                src,
            }
        }
        OpClass::Cmp => {
            let (lhs, rhs) = if !spec.has_modrm {
                (acc(width), Operand::Imm(imm_val))
            } else if spec.imm != ImmKind::None {
                (rm(width, Seg::Ds)?, Operand::Imm(imm_val))
            } else {
                let rm = rm(width, Seg::Ds)?;
                let reg = Operand::Reg(reg_field(width));
                if spec.mem_dest {
                    (rm, reg)
                } else {
                    (reg, rm)
                }
            };
            InstKind::Cmp { width, lhs, rhs }
        }
        OpClass::Test => {
            let lhs = rm(width, Seg::Ds)?;
            let rhs = if spec.imm != ImmKind::None {
                Operand::Imm(imm_val)
            } else {
                Operand::Reg(reg_field(width))
            };
            InstKind::Test { width, lhs, rhs }
        }
        OpClass::Mov => {
            let (dst, src) = if spec.imm != ImmKind::None {
                (rm(width, Seg::Ds)?, Operand::Imm(imm_val))
            } else {
                let rm = rm(width, Seg::Ds)?;
                let reg = Operand::Reg(reg_field(width));
                if spec.mem_dest {
                    (rm, reg)
                } else {
                    (reg, rm)
                }
            };
            InstKind::Mov { width, dst, src }
        }
        OpClass::MovMoffs { store } => {
            let mem = Operand::Mem(MemRef::absolute(
                prefixes.segment_or(Seg::Ds),
                imm_val,
                prefixes.address_width(),
                width,
            ));
            let (dst, src) = if store { (mem, acc(width)) } else { (acc(width), mem) };
            InstKind::Mov { width, dst, src }
        }
        OpClass::MovSeg { to_rm } => {
            let m = modrm.ok_or(DecodeFault::UnsupportedAddressing)?;
            let seg = Seg::from_index(m.reg)
                .ok_or(DecodeFault::BadSegmentIndex { index: m.reg })?;
            let rm16 = rm(Width::W16, Seg::Ds)?;
            let (dst, src) = if to_rm {
                (rm16, Operand::SegReg(seg))
            } else {
                (Operand::SegReg(seg), rm16)
            };
            InstKind::Mov {
                width: Width::W16,
                dst,
                src,
            }
        }
        OpClass::MovRegImm(r) => InstKind::Mov {
            width,
            dst: Operand::Reg(RegView::from_bits(r, width)),
            src: Operand::Imm(imm_val),
        },
        OpClass::Lea => match rm(width, Seg::Ds)? {
            Operand::Mem(mem) => InstKind::Lea {
                dst: reg_field(width),
                mem,
            },
            // lea with a register rm has no address to take.
            _ => return Err(DecodeFault::UnsupportedAddressing),
        },
        OpClass::IncReg(r) => InstKind::IncDec {
            dec: false,
            width,
            dst: Operand::Reg(RegView::from_bits(r, width)),
        },
        OpClass::DecReg(r) => InstKind::IncDec {
            dec: true,
            width,
            dst: Operand::Reg(RegView::from_bits(r, width)),
        },
        OpClass::IncRm => InstKind::IncDec {
            dec: false,
            width,
            dst: rm(width, Seg::Ds)?,
        },
        OpClass::DecRm => InstKind::IncDec {
            dec: true,
            width,
            dst: rm(width, Seg::Ds)?,
        },
        OpClass::PushReg(r) => InstKind::Push {
            width,
            src: Operand::Reg(RegView::from_bits(r, width)),
        },
        OpClass::PopReg(r) => InstKind::Pop {
            width,
            dst: Operand::Reg(RegView::from_bits(r, width)),
        },
        OpClass::PushImm => InstKind::Push {
            width,
            src: Operand::Imm(imm_val),
        },
        OpClass::PushRm => InstKind::Push {
            width,
            src: rm(width, Seg::Ds)?,
        },
        OpClass::PopRm => InstKind::Pop {
            width,
            dst: rm(width, Seg::Ds)?,
        },
        OpClass::Jcc(nibble) => InstKind::JccRel {
            cond: Cond::from_low_nibble(nibble),
            target: next.wrapping_add(imm_val as u32),
            hint: prefixes.branch_hint(),
        },
        OpClass::JmpRel => InstKind::JmpRel {
            target: next.wrapping_add(imm_val as u32),
        },
        OpClass::CallRel => InstKind::CallRel {
            target: next.wrapping_add(imm_val as u32),
        },
        // Indirect jumps read their target through CS by default.
        OpClass::JmpRm => InstKind::JmpInd {
            target: rm(width, Seg::Cs)?,
        },
        OpClass::CallRm => InstKind::CallInd {
            target: rm(width, Seg::Ds)?,
        },
        OpClass::Ret { far } => InstKind::Ret {
            far,
            stack_adjust: imm_val as u16,
        },
        OpClass::Leave => InstKind::Leave,
        OpClass::Int => InstKind::Int {
            vector: imm_val as u8,
        },
        OpClass::Nop => InstKind::Nop,
        OpClass::Movs => InstKind::Movs {
            width,
            rep: prefixes.rep(),
        },
        OpClass::Shift(op) => {
            let count = match imm {
                Some(v) => Operand::Imm(v),
                // No immediate: the count is CL.
                None => Operand::Reg(RegView::R8(Reg8 {
                    gpr: Gpr::Ecx,
                    high: false,
                })),
            };
            InstKind::Shift {
                op,
                width,
                dst: rm(width, Seg::Ds)?,
                count,
            }
        }
        OpClass::Not => InstKind::Not {
            width,
            dst: rm(width, Seg::Ds)?,
        },
        OpClass::Neg => InstKind::Neg {
            width,
            dst: rm(width, Seg::Ds)?,
        },
        OpClass::Mul => InstKind::Mul {
            width,
            src: rm(width, Seg::Ds)?,
        },
        OpClass::Div => InstKind::Div {
            width,
            src: rm(width, Seg::Ds)?,
        },
        OpClass::Imul => InstKind::Imul {
            width,
            dst: reg_field(width),
            src: rm(width, Seg::Ds)?,
            imm,
        },
        OpClass::Setcc(nibble) => InstKind::Setcc {
            cond: Cond::from_low_nibble(nibble),
            dst: rm(Width::W8, Seg::Ds)?,
        },
        OpClass::Cmov(nibble) => InstKind::Cmov {
            cond: Cond::from_low_nibble(nibble),
            width,
            dst: reg_field(width),
            src: rm(width, Seg::Ds)?,
        },
        OpClass::Movzx(src_width) => {
            let dst_width = if src_width == Width::W16 {
                Width::W32
            } else {
                width
            };
            InstKind::Movzx {
                dst: reg_field(dst_width),
                src: rm(src_width, Seg::Ds)?,
            }
        }
        OpClass::Movsx(src_width) => {
            let dst_width = if src_width == Width::W16 {
                Width::W32
            } else {
                width
            };
            InstKind::Movsx {
                dst: reg_field(dst_width),
                src: rm(src_width, Seg::Ds)?,
            }
        }
        OpClass::CmpXchg => InstKind::CmpXchg {
            width,
            dst: rm(width, Seg::Ds)?,
            src: reg_field(width),
        },
        OpClass::Rdtsc => InstKind::Rdtsc,
        OpClass::SetFlag(flag, value) => InstKind::SetFlag { flag, value },
        OpClass::Control { reg, store } => {
            let w = match reg {
                ControlReg::FpuCw => Width::W16,
                ControlReg::Mxcsr => Width::W32,
            };
            let operand = rm(w, Seg::Ds)?;
            if store {
                InstKind::StoreControl { reg, dst: operand }
            } else {
                InstKind::LoadControl { reg, src: operand }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use lariat_types::AluOp;

    use super::*;

    fn decode_bytes(bytes: &[u8]) -> DecodedInst {
        decode(bytes, 0)
    }

    #[test]
    fn add_eax_imm8_sign_extends() {
        // add eax, 5 via the sign-extended byte-immediate group.
        let inst = decode_bytes(&[0x83, 0xC0, 0x05]);
        assert_eq!(inst.len, 3);
        assert_eq!(inst.shape.imm, ImmKind::Byte);
        assert_eq!(
            inst.kind,
            InstKind::Alu {
                op: AluOp::Add,
                width: Width::W32,
                dst: Operand::Reg(RegView::R32(Gpr::Eax)),
                src: Operand::Imm(5),
            }
        );

        let inst = decode_bytes(&[0x83, 0xC0, 0xFF]);
        assert_eq!(
            inst.kind,
            InstKind::Alu {
                op: AluOp::Add,
                width: Width::W32,
                dst: Operand::Reg(RegView::R32(Gpr::Eax)),
                src: Operand::Imm(-1),
            }
        );
    }

    #[test]
    fn operand_size_prefix_swaps_width_and_immediate() {
        // add ax, imm16.
        let inst = decode_bytes(&[0x66, 0x05, 0x34, 0x12]);
        assert_eq!(inst.len, 4);
        assert_eq!(
            inst.kind,
            InstKind::Alu {
                op: AluOp::Add,
                width: Width::W16,
                dst: Operand::Reg(RegView::R16(Gpr::Eax)),
                src: Operand::Imm(0x1234),
            }
        );
    }

    #[test]
    fn relative_branches_target_past_the_instruction() {
        // jmp rel8 of -2: a self-loop.
        let inst = decode_bytes(&[0xEB, 0xFE]);
        assert_eq!(inst.kind, InstKind::JmpRel { target: 0 });

        // je +0x10 from pc 0.
        let inst = decode_bytes(&[0x74, 0x10]);
        assert_eq!(
            inst.kind,
            InstKind::JccRel {
                cond: Cond::E,
                target: 0x12,
                hint: None,
            }
        );

        // call rel32.
        let inst = decode_bytes(&[0xE8, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(inst.kind, InstKind::CallRel { target: 0x105 });
    }

    #[test]
    fn unmapped_opcode_defers_to_a_bad_instruction() {
        let inst = decode_bytes(&[0xF4]);
        assert_eq!(
            inst.kind,
            InstKind::Bad {
                fault: DecodeFault::UnknownOpcode { opcode: 0xF4 }
            }
        );
        assert_eq!(inst.len, 1);

        let inst = decode_bytes(&[0x0F, 0x0B]);
        assert_eq!(
            inst.kind,
            InstKind::Bad {
                fault: DecodeFault::UnknownSecondaryOpcode { opcode: 0x0B }
            }
        );
    }

    #[test]
    fn repeated_prefix_defers_to_a_bad_instruction() {
        let inst = decode_bytes(&[0x66, 0x66, 0x90]);
        assert!(matches!(
            inst.kind,
            InstKind::Bad {
                fault: DecodeFault::RepeatedPrefix { byte: 0x66 }
            }
        ));
        assert_eq!(inst.len, 2);
    }

    #[test]
    fn group_extension_selects_the_operation() {
        // f7 /3: neg rm32.
        let inst = decode_bytes(&[0xF7, 0xDB]);
        assert_eq!(
            inst.kind,
            InstKind::Neg {
                width: Width::W32,
                dst: Operand::Reg(RegView::R32(Gpr::Ebx)),
            }
        );

        // f7 /1 is unmapped.
        let inst = decode_bytes(&[0xF7, 0xC8]);
        assert_eq!(
            inst.kind,
            InstKind::Bad {
                fault: DecodeFault::UnknownGroupExt {
                    opcode: 0xF7,
                    ext: 1
                }
            }
        );
    }

    #[test]
    fn sib_addressing_resolves_base_index_scale() {
        // mov eax, [eax + ebx*4 + 0x10]
        let inst = decode_bytes(&[0x8B, 0x44, 0x98, 0x10]);
        assert_eq!(inst.len, 4);
        match inst.kind {
            InstKind::Mov {
                src: Operand::Mem(mem),
                ..
            } => {
                assert_eq!(mem.base, Some(Gpr::Eax));
                assert_eq!(mem.index, Some(Gpr::Ebx));
                assert_eq!(mem.scale, 4);
                assert_eq!(mem.disp, 0x10);
                assert_eq!(mem.seg, Seg::Ds);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn sixteen_bit_addressing_is_a_deferred_fault() {
        // 0x67 forces 16-bit addressing on a memory operand.
        let inst = decode_bytes(&[0x67, 0x8B, 0x04]);
        assert!(matches!(
            inst.kind,
            InstKind::Bad {
                fault: DecodeFault::UnsupportedAddressing
            }
        ));
    }

    #[test]
    fn shift_forms_pick_their_count_operand() {
        // c1 /4: shl ebx, 3.
        let inst = decode_bytes(&[0xC1, 0xE3, 0x03]);
        assert!(matches!(
            inst.kind,
            InstKind::Shift {
                count: Operand::Imm(3),
                ..
            }
        ));

        // d1 /4: shl ebx, 1 with no immediate byte.
        let inst = decode_bytes(&[0xD1, 0xE3]);
        assert_eq!(inst.len, 2);
        assert!(matches!(
            inst.kind,
            InstKind::Shift {
                count: Operand::Imm(1),
                ..
            }
        ));

        // d3 /4: shl ebx, cl.
        let inst = decode_bytes(&[0xD3, 0xE3]);
        assert!(matches!(
            inst.kind,
            InstKind::Shift {
                count: Operand::Reg(RegView::R8(Reg8 {
                    gpr: Gpr::Ecx,
                    high: false
                })),
                ..
            }
        ));
    }

    #[test]
    fn truncated_instruction_is_a_deferred_fault() {
        let inst = decode_bytes(&[0x83, 0xC0]);
        assert!(matches!(
            inst.kind,
            InstKind::Bad {
                fault: DecodeFault::UnexpectedEnd
            }
        ));
    }

    #[test]
    fn decode_is_deterministic() {
        let bytes: &[u8] = &[0x8B, 0x44, 0x98, 0x10, 0x90];
        assert_eq!(decode(bytes, 0), decode(bytes, 0));
    }
}
