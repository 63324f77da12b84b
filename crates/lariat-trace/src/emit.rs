//! Per-instruction lowering to IR.
//!
//! Flag modelling: every arithmetic instruction recomputes cf/of directly
//! from its operands with the dedicated compare predicates, and sf/zf from
//! the result. Logic operations clear cf/of. Shifts derive cf from the last
//! bit shifted out of the source; their of, undefined past a 1-bit shift,
//! is modelled as clear. af/pf are not modelled.

use lariat_types::{AluOp, Cond, Flag, Gpr, Seg, ShiftOp, Width};
use lariat_x86::{DecodedInst, InstKind, MemRef, Operand, RegView};

use crate::builder::{Flow, TraceBuilder};
use crate::ir::{BinOp, BranchKind, CmpCond, Inst, Src, Temp, Terminator, UnOp};
use crate::operands::{self, operand_width};
use crate::TranslateError;

impl TraceBuilder<'_> {
    fn load(&mut self, op: &Operand) -> Result<Temp, TranslateError> {
        let gs = self.image.gs_base();
        operands::load_operand(&mut *self.sink, &mut self.regs, op, gs)
    }

    fn store(&mut self, op: &Operand, src: Temp) -> Result<(), TranslateError> {
        let gs = self.image.gs_base();
        operands::store_operand(&mut *self.sink, &mut self.regs, op, src, gs)
    }

    fn address(&mut self, mem: &MemRef) -> Result<Temp, TranslateError> {
        let gs = self.image.gs_base();
        operands::compute_address(&mut *self.sink, &mut self.regs, mem, gs)
    }

    fn view(&mut self, view: RegView) -> Temp {
        self.regs.view(&mut *self.sink, view)
    }

    fn set_flag_cmp(&mut self, flag: Flag, cond: CmpCond, lhs: Temp, rhs: Src) {
        let dst = self.regs.flag(flag);
        self.sink.push(Inst::BoolCmp {
            dst,
            cond,
            lhs,
            rhs,
        });
    }

    fn set_flag_const(&mut self, flag: Flag, value: bool) {
        let dst = self.regs.flag(flag);
        self.sink.push(Inst::Const {
            dst,
            value: i32::from(value),
        });
    }

    /// sf and zf from a result temp.
    fn result_flags(&mut self, r: Temp) {
        self.set_flag_cmp(Flag::Sf, CmpCond::LtSigned, r, Src::Imm(0));
        self.set_flag_cmp(Flag::Zf, CmpCond::Eq, r, Src::Imm(0));
    }

    /// cf = the last bit shifted out of `v`: bit `width-n` of the pre-shift
    /// value for a left shift by `n`, bit `n-1` for right shifts. A runtime
    /// count of zero leaves cf as it was.
    fn shift_carry(&mut self, bin: BinOp, width: Width, v: Temp, count: Src) {
        let out_op = match bin {
            BinOp::Shl => BinOp::Shr,
            right => right,
        };
        let pos = match count {
            Src::Imm(n) => {
                if bin == BinOp::Shl {
                    Src::Imm(width.bits() as i32 - n)
                } else {
                    Src::Imm(n - 1)
                }
            }
            Src::Temp(m) => {
                let p = self.temp();
                if bin == BinOp::Shl {
                    let w = self.const_temp(width.bits() as i32);
                    self.sink.push(Inst::Binary {
                        dst: p,
                        op: BinOp::Sub,
                        lhs: w,
                        rhs: m.into(),
                    });
                } else {
                    self.sink.push(Inst::Binary {
                        dst: p,
                        op: BinOp::Sub,
                        lhs: m,
                        rhs: Src::Imm(1),
                    });
                }
                Src::Temp(p)
            }
        };
        let out = self.temp();
        self.sink.push(Inst::Binary {
            dst: out,
            op: out_op,
            lhs: v,
            rhs: pos,
        });
        let cf = self.regs.flag(Flag::Cf);
        match count {
            Src::Imm(_) => {
                self.sink.push(Inst::Binary {
                    dst: cf,
                    op: BinOp::And,
                    lhs: out,
                    rhs: Src::Imm(1),
                });
            }
            Src::Temp(m) => {
                let bit = self.temp();
                self.sink.push(Inst::Binary {
                    dst: bit,
                    op: BinOp::And,
                    lhs: out,
                    rhs: Src::Imm(1),
                });
                let moved = self.temp();
                self.sink.push(Inst::BoolCmp {
                    dst: moved,
                    cond: CmpCond::Ne,
                    lhs: m,
                    rhs: Src::Imm(0),
                });
                self.sink.push(Inst::Select {
                    dst: cf,
                    cond: moved,
                    on_true: bit.into(),
                    on_false: cf.into(),
                });
            }
        }
    }

    /// cf and of for an add/sub-family operation on `a` and `b`.
    fn carry_flags(&mut self, subtract: bool, a: Temp, b: Temp) {
        if subtract {
            self.set_flag_cmp(Flag::Cf, CmpCond::LtUnsigned, a, b.into());
            self.set_flag_cmp(Flag::Of, CmpCond::OverflowFromSub, a, b.into());
        } else {
            self.set_flag_cmp(Flag::Cf, CmpCond::CarryFromAdd, a, b.into());
            self.set_flag_cmp(Flag::Of, CmpCond::OverflowFromAdd, a, b.into());
        }
    }

    /// Boolean temp for an x86 condition, computed from the live flag temps.
    fn cond_temp(&mut self, cond: Cond) -> Result<Temp, TranslateError> {
        let t = self.temp();
        match cond {
            Cond::E => {
                let zf = self.regs.flag(Flag::Zf);
                self.sink.push(Inst::BoolCmp {
                    dst: t,
                    cond: CmpCond::Ne,
                    lhs: zf,
                    rhs: Src::Imm(0),
                });
            }
            Cond::Ne => {
                let zf = self.regs.flag(Flag::Zf);
                self.sink.push(Inst::BoolCmp {
                    dst: t,
                    cond: CmpCond::Eq,
                    lhs: zf,
                    rhs: Src::Imm(0),
                });
            }
            Cond::B => {
                let cf = self.regs.flag(Flag::Cf);
                self.sink.push(Inst::BoolCmp {
                    dst: t,
                    cond: CmpCond::Ne,
                    lhs: cf,
                    rhs: Src::Imm(0),
                });
            }
            Cond::Ae => {
                let cf = self.regs.flag(Flag::Cf);
                self.sink.push(Inst::BoolCmp {
                    dst: t,
                    cond: CmpCond::Eq,
                    lhs: cf,
                    rhs: Src::Imm(0),
                });
            }
            Cond::Be | Cond::A => {
                let cf = self.regs.flag(Flag::Cf);
                let zf = self.regs.flag(Flag::Zf);
                let u = self.temp();
                self.sink.push(Inst::Binary {
                    dst: u,
                    op: BinOp::Or,
                    lhs: cf,
                    rhs: zf.into(),
                });
                let pred = if cond == Cond::Be {
                    CmpCond::Ne
                } else {
                    CmpCond::Eq
                };
                self.sink.push(Inst::BoolCmp {
                    dst: t,
                    cond: pred,
                    lhs: u,
                    rhs: Src::Imm(0),
                });
            }
            Cond::S => {
                let sf = self.regs.flag(Flag::Sf);
                self.sink.push(Inst::BoolCmp {
                    dst: t,
                    cond: CmpCond::Ne,
                    lhs: sf,
                    rhs: Src::Imm(0),
                });
            }
            Cond::Ns => {
                let sf = self.regs.flag(Flag::Sf);
                self.sink.push(Inst::BoolCmp {
                    dst: t,
                    cond: CmpCond::Eq,
                    lhs: sf,
                    rhs: Src::Imm(0),
                });
            }
            Cond::Ge | Cond::L => {
                let sf = self.regs.flag(Flag::Sf);
                let of = self.regs.flag(Flag::Of);
                let pred = if cond == Cond::Ge {
                    CmpCond::Eq
                } else {
                    CmpCond::Ne
                };
                self.sink.push(Inst::BoolCmp {
                    dst: t,
                    cond: pred,
                    lhs: sf,
                    rhs: of.into(),
                });
            }
            Cond::G => {
                let zf = self.regs.flag(Flag::Zf);
                let sf = self.regs.flag(Flag::Sf);
                let of = self.regs.flag(Flag::Of);
                let nz = self.temp();
                self.sink.push(Inst::BoolCmp {
                    dst: nz,
                    cond: CmpCond::Eq,
                    lhs: zf,
                    rhs: Src::Imm(0),
                });
                let ge = self.temp();
                self.sink.push(Inst::BoolCmp {
                    dst: ge,
                    cond: CmpCond::Eq,
                    lhs: sf,
                    rhs: of.into(),
                });
                self.sink.push(Inst::Binary {
                    dst: t,
                    op: BinOp::And,
                    lhs: nz,
                    rhs: ge.into(),
                });
            }
            Cond::Le => {
                let zf = self.regs.flag(Flag::Zf);
                let sf = self.regs.flag(Flag::Sf);
                let of = self.regs.flag(Flag::Of);
                let z = self.temp();
                self.sink.push(Inst::BoolCmp {
                    dst: z,
                    cond: CmpCond::Ne,
                    lhs: zf,
                    rhs: Src::Imm(0),
                });
                let lt = self.temp();
                self.sink.push(Inst::BoolCmp {
                    dst: lt,
                    cond: CmpCond::Ne,
                    lhs: sf,
                    rhs: of.into(),
                });
                self.sink.push(Inst::Binary {
                    dst: t,
                    op: BinOp::Or,
                    lhs: z,
                    rhs: lt.into(),
                });
            }
            Cond::O | Cond::No | Cond::P | Cond::Np => {
                return Err(TranslateError::Unimplemented(
                    "overflow/parity branch condition",
                ))
            }
        }
        Ok(t)
    }

    /// esp -= size; [ss:esp] = v.
    fn push_value(&mut self, v: Temp, width: Width) {
        let esp = self.view(RegView::R32(Gpr::Esp));
        self.sink.push(Inst::Binary {
            dst: esp,
            op: BinOp::Sub,
            lhs: esp,
            rhs: Src::Imm(width.bytes() as i32),
        });
        self.sink.push(Inst::Store {
            addr: esp,
            src: v,
            width,
        });
    }

    /// One movs element: copy, then step esi/edi by the df-directed delta.
    fn copy_string_element(&mut self, seg: Seg, width: Width) -> Result<(), TranslateError> {
        let n = width.bytes() as i32;
        let src_ref = MemRef::based(seg, Gpr::Esi, Width::W32, width);
        let dst_ref = MemRef::based(Seg::Es, Gpr::Edi, Width::W32, width);
        let saddr = self.address(&src_ref)?;
        let daddr = self.address(&dst_ref)?;
        let v = self.temp();
        self.sink.push(Inst::Load {
            dst: v,
            addr: saddr,
            width,
        });
        self.sink.push(Inst::Store {
            addr: daddr,
            src: v,
            width,
        });

        let df = self.regs.flag(Flag::Df);
        let delta = self.temp();
        self.sink.push(Inst::Select {
            dst: delta,
            cond: df,
            on_true: Src::Imm(-n),
            on_false: Src::Imm(n),
        });
        let esi = self.view(RegView::R32(Gpr::Esi));
        self.sink.push(Inst::Binary {
            dst: esi,
            op: BinOp::Add,
            lhs: esi,
            rhs: delta.into(),
        });
        let edi = self.view(RegView::R32(Gpr::Edi));
        self.sink.push(Inst::Binary {
            dst: edi,
            op: BinOp::Add,
            lhs: edi,
            rhs: delta.into(),
        });
        Ok(())
    }

    /// Lower one decoded instruction into the current block.
    pub(crate) fn emit_inst(&mut self, inst: &DecodedInst) -> Result<Flow, TranslateError> {
        match inst.kind {
            InstKind::Alu { op, dst, src, .. } => {
                let a = self.load(&dst)?;
                let b = self.load(&src)?;
                let b_eff = match op {
                    AluOp::Adc | AluOp::Sbb => {
                        let cf = self.regs.flag(Flag::Cf);
                        let t = self.temp();
                        self.sink.push(Inst::Binary {
                            dst: t,
                            op: BinOp::Add,
                            lhs: b,
                            rhs: cf.into(),
                        });
                        t
                    }
                    _ => b,
                };
                let bin = match op {
                    AluOp::Add | AluOp::Adc => BinOp::Add,
                    AluOp::Sub | AluOp::Sbb => BinOp::Sub,
                    AluOp::And => BinOp::And,
                    AluOp::Or => BinOp::Or,
                    AluOp::Xor => BinOp::Xor,
                };
                let r = self.temp();
                self.sink.push(Inst::Binary {
                    dst: r,
                    op: bin,
                    lhs: a,
                    rhs: b_eff.into(),
                });
                match op {
                    AluOp::Add | AluOp::Adc => self.carry_flags(false, a, b_eff),
                    AluOp::Sub | AluOp::Sbb => self.carry_flags(true, a, b_eff),
                    AluOp::And | AluOp::Or | AluOp::Xor => {
                        self.set_flag_const(Flag::Cf, false);
                        self.set_flag_const(Flag::Of, false);
                    }
                }
                self.result_flags(r);
                self.store(&dst, r)?;
                Ok(Flow::Next)
            }
            InstKind::Cmp { lhs, rhs, .. } => {
                let a = self.load(&lhs)?;
                let b = self.load(&rhs)?;
                let r = self.temp();
                self.sink.push(Inst::Binary {
                    dst: r,
                    op: BinOp::Sub,
                    lhs: a,
                    rhs: b.into(),
                });
                self.carry_flags(true, a, b);
                self.result_flags(r);
                Ok(Flow::Next)
            }
            InstKind::Test { lhs, rhs, .. } => {
                let a = self.load(&lhs)?;
                let b = self.load(&rhs)?;
                let r = self.temp();
                self.sink.push(Inst::Binary {
                    dst: r,
                    op: BinOp::And,
                    lhs: a,
                    rhs: b.into(),
                });
                self.set_flag_const(Flag::Cf, false);
                self.set_flag_const(Flag::Of, false);
                self.result_flags(r);
                Ok(Flow::Next)
            }
            InstKind::Mov { dst, src, .. } => {
                let v = self.load(&src)?;
                self.store(&dst, v)?;
                Ok(Flow::Next)
            }
            InstKind::Lea { dst, mem } => {
                let addr = self.address(&mem)?;
                let d = self.view(dst);
                self.sink.push(Inst::Move { dst: d, src: addr });
                Ok(Flow::Next)
            }
            InstKind::Shift {
                op,
                width,
                dst,
                count,
            } => {
                let bin = match op {
                    ShiftOp::Shl => BinOp::Shl,
                    ShiftOp::Shr => BinOp::Shr,
                    ShiftOp::Sar => BinOp::Sar,
                    ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr => {
                        return Err(TranslateError::Unimplemented(op.mnemonic()))
                    }
                };
                let v = self.load(&dst)?;
                let rhs = match count {
                    Operand::Imm(n) => {
                        let n = n & 31;
                        if n == 0 {
                            // A zero count changes neither the value nor
                            // the flags.
                            return Ok(Flow::Next);
                        }
                        Src::Imm(n)
                    }
                    ref other => {
                        let c = self.load(other)?;
                        let m = self.temp();
                        self.sink.push(Inst::Binary {
                            dst: m,
                            op: BinOp::And,
                            lhs: c,
                            rhs: Src::Imm(31),
                        });
                        Src::Temp(m)
                    }
                };
                let r = self.temp();
                self.sink.push(Inst::Binary {
                    dst: r,
                    op: bin,
                    lhs: v,
                    rhs,
                });
                self.shift_carry(bin, width, v, rhs);
                self.set_flag_const(Flag::Of, false);
                self.result_flags(r);
                self.store(&dst, r)?;
                Ok(Flow::Next)
            }
            InstKind::IncDec { dec, dst, .. } => {
                let v = self.load(&dst)?;
                let r = self.temp();
                self.sink.push(Inst::Binary {
                    dst: r,
                    op: if dec { BinOp::Sub } else { BinOp::Add },
                    lhs: v,
                    rhs: Src::Imm(1),
                });
                // cf is architecturally preserved by inc/dec.
                let of_pred = if dec {
                    CmpCond::OverflowFromSub
                } else {
                    CmpCond::OverflowFromAdd
                };
                self.set_flag_cmp(Flag::Of, of_pred, v, Src::Imm(1));
                self.result_flags(r);
                self.store(&dst, r)?;
                Ok(Flow::Next)
            }
            InstKind::Push { width, src } => {
                let v = self.load(&src)?;
                self.push_value(v, width);
                Ok(Flow::Next)
            }
            InstKind::Pop { width, dst } => {
                let esp = self.view(RegView::R32(Gpr::Esp));
                let v = self.temp();
                self.sink.push(Inst::Load {
                    dst: v,
                    addr: esp,
                    width,
                });
                self.sink.push(Inst::Binary {
                    dst: esp,
                    op: BinOp::Add,
                    lhs: esp,
                    rhs: Src::Imm(width.bytes() as i32),
                });
                self.store(&dst, v)?;
                Ok(Flow::Next)
            }
            InstKind::Movs { width, rep } => {
                let seg = inst.prefixes.segment_or(Seg::Ds);
                if rep {
                    let ecx = self.view(RegView::R32(Gpr::Ecx));
                    let done = self.temp();
                    self.sink.push(Inst::BoolCmp {
                        dst: done,
                        cond: CmpCond::Eq,
                        lhs: ecx,
                        rhs: Src::Imm(0),
                    });
                    let body = self.sink.create_block();
                    let after = self.sink.create_block();
                    self.sink.terminate(Terminator::Branch {
                        cond: done,
                        likely: Some(false),
                        taken: after,
                        fallthrough: body,
                    });
                    self.sink.set_current(body);
                    self.copy_string_element(seg, width)?;
                    let ecx = self.view(RegView::R32(Gpr::Ecx));
                    self.sink.push(Inst::Binary {
                        dst: ecx,
                        op: BinOp::Sub,
                        lhs: ecx,
                        rhs: Src::Imm(1),
                    });
                    let again = self.temp();
                    self.sink.push(Inst::BoolCmp {
                        dst: again,
                        cond: CmpCond::Ne,
                        lhs: ecx,
                        rhs: Src::Imm(0),
                    });
                    self.sink.terminate(Terminator::Branch {
                        cond: again,
                        likely: Some(true),
                        taken: body,
                        fallthrough: after,
                    });
                    self.sink.set_current(after);
                } else {
                    self.copy_string_element(seg, width)?;
                }
                Ok(Flow::Next)
            }
            InstKind::Mul { width, src } => {
                let s = self.load(&src)?;
                match width {
                    Width::W32 => {
                        let eax = self.view(RegView::R32(Gpr::Eax));
                        let a64 = self.long_temp();
                        self.sink.push(Inst::Unary {
                            dst: a64,
                            op: UnOp::IntToLongUnsigned,
                            src: eax,
                        });
                        let b64 = self.long_temp();
                        self.sink.push(Inst::Unary {
                            dst: b64,
                            op: UnOp::IntToLongUnsigned,
                            src: s,
                        });
                        let p = self.long_temp();
                        self.sink.push(Inst::Binary {
                            dst: p,
                            op: BinOp::Mul,
                            lhs: a64,
                            rhs: b64.into(),
                        });
                        self.sink.push(Inst::Unary {
                            dst: eax,
                            op: UnOp::LongToInt,
                            src: p,
                        });
                        let edx = self.view(RegView::R32(Gpr::Edx));
                        self.sink.push(Inst::Unary {
                            dst: edx,
                            op: UnOp::LongHigh,
                            src: p,
                        });
                    }
                    Width::W8 | Width::W16 => {
                        // Narrow products fit in 32 bits; mask both factors
                        // and split the result.
                        let mask = width.mask() as i32;
                        let acc = self.view(RegView::from_bits(0, width));
                        let a = self.temp();
                        self.sink.push(Inst::Binary {
                            dst: a,
                            op: BinOp::And,
                            lhs: acc,
                            rhs: Src::Imm(mask),
                        });
                        let b = self.temp();
                        self.sink.push(Inst::Binary {
                            dst: b,
                            op: BinOp::And,
                            lhs: s,
                            rhs: Src::Imm(mask),
                        });
                        let p = self.temp();
                        self.sink.push(Inst::Binary {
                            dst: p,
                            op: BinOp::Mul,
                            lhs: a,
                            rhs: b.into(),
                        });
                        let ax = self.view(RegView::R16(Gpr::Eax));
                        self.sink.push(Inst::Move { dst: ax, src: p });
                        if width == Width::W16 {
                            let hi = self.temp();
                            self.sink.push(Inst::Binary {
                                dst: hi,
                                op: BinOp::Shr,
                                lhs: p,
                                rhs: Src::Imm(16),
                            });
                            let dx = self.view(RegView::R16(Gpr::Edx));
                            self.sink.push(Inst::Move { dst: dx, src: hi });
                        }
                    }
                }
                Ok(Flow::Next)
            }
            InstKind::Imul { dst, src, imm, .. } => {
                let s = self.load(&src)?;
                let r = self.temp();
                match imm {
                    Some(v) => self.sink.push(Inst::Binary {
                        dst: r,
                        op: BinOp::Mul,
                        lhs: s,
                        rhs: Src::Imm(v),
                    }),
                    None => {
                        let d = self.load(&Operand::Reg(dst))?;
                        self.sink.push(Inst::Binary {
                            dst: r,
                            op: BinOp::Mul,
                            lhs: d,
                            rhs: s.into(),
                        });
                    }
                }
                let dv = self.view(dst);
                self.sink.push(Inst::Move { dst: dv, src: r });
                Ok(Flow::Next)
            }
            InstKind::Div { width, src } => {
                if width != Width::W32 {
                    return Err(TranslateError::Unimplemented("narrow divide"));
                }
                let s = self.load(&src)?;
                let eax = self.view(RegView::R32(Gpr::Eax));
                let edx = self.view(RegView::R32(Gpr::Edx));
                let n = self.long_temp();
                self.sink.push(Inst::MakeLong {
                    dst: n,
                    hi: edx,
                    lo: eax,
                });
                // Guest-visible divide fault on a zero divisor.
                let zero = self.temp();
                self.sink.push(Inst::BoolCmp {
                    dst: zero,
                    cond: CmpCond::Eq,
                    lhs: s,
                    rhs: Src::Imm(0),
                });
                let fault = self.exit_divide_fault(inst.pc);
                let cont = self.sink.create_block();
                self.sink.terminate(Terminator::Branch {
                    cond: zero,
                    likely: Some(false),
                    taken: fault,
                    fallthrough: cont,
                });
                self.sink.set_current(cont);
                let d = self.long_temp();
                self.sink.push(Inst::Unary {
                    dst: d,
                    op: UnOp::IntToLongUnsigned,
                    src: s,
                });
                let q = self.long_temp();
                self.sink.push(Inst::Binary {
                    dst: q,
                    op: BinOp::Div,
                    lhs: n,
                    rhs: d.into(),
                });
                let rem = self.long_temp();
                self.sink.push(Inst::Binary {
                    dst: rem,
                    op: BinOp::Rem,
                    lhs: n,
                    rhs: d.into(),
                });
                self.sink.push(Inst::Unary {
                    dst: eax,
                    op: UnOp::LongToInt,
                    src: q,
                });
                self.sink.push(Inst::Unary {
                    dst: edx,
                    op: UnOp::LongToInt,
                    src: rem,
                });
                Ok(Flow::Next)
            }
            InstKind::Not { dst, .. } => {
                let v = self.load(&dst)?;
                let r = self.temp();
                self.sink.push(Inst::Unary {
                    dst: r,
                    op: UnOp::Not,
                    src: v,
                });
                self.store(&dst, r)?;
                Ok(Flow::Next)
            }
            InstKind::Neg { dst, .. } => {
                let v = self.load(&dst)?;
                let r = self.temp();
                self.sink.push(Inst::Unary {
                    dst: r,
                    op: UnOp::Neg,
                    src: v,
                });
                self.set_flag_cmp(Flag::Cf, CmpCond::Ne, v, Src::Imm(0));
                let zero = self.const_temp(0);
                self.set_flag_cmp(Flag::Of, CmpCond::OverflowFromSub, zero, v.into());
                self.result_flags(r);
                self.store(&dst, r)?;
                Ok(Flow::Next)
            }
            InstKind::JmpRel { target } => {
                let key = self.regs.lazy.key(target);
                let b = self.block_for(key);
                self.sink.terminate(Terminator::Jump(b));
                Ok(Flow::Done)
            }
            InstKind::JccRel { cond, target, hint } => {
                let c = self.cond_temp(cond)?;
                // Without a prefix hint, backward branches predict taken.
                let likely = hint.unwrap_or(target < inst.pc);
                let lazy = self.regs.lazy;
                let taken = self.block_for(lazy.key(target));
                let fallthrough = self.block_for(lazy.key(inst.next_pc()));
                self.sink.terminate(Terminator::Branch {
                    cond: c,
                    likely: Some(likely),
                    taken,
                    fallthrough,
                });
                Ok(Flow::Done)
            }
            InstKind::CallRel { target } => {
                let ra = self.const_temp(inst.next_pc() as i32);
                self.push_value(ra, Width::W32);
                let t = self.const_temp(target as i32);
                self.sink.push(Inst::RecordBranch {
                    source: inst.pc,
                    target: t,
                    kind: BranchKind::Call,
                });
                let key = self.regs.lazy.key(target);
                let exit = self.exit_to(key);
                self.sink.terminate(Terminator::Jump(exit));
                Ok(Flow::Done)
            }
            InstKind::CallInd { target } => {
                let t = self.load(&target)?;
                let ra = self.const_temp(inst.next_pc() as i32);
                self.push_value(ra, Width::W32);
                self.exit_via(t, inst.pc, BranchKind::Call);
                Ok(Flow::Done)
            }
            InstKind::JmpInd { target } => {
                let t = self.load(&target)?;
                self.defer_dynamic(inst.pc, t, BranchKind::Jump);
                Ok(Flow::Done)
            }
            InstKind::Ret { far, stack_adjust } => {
                if far {
                    return Err(TranslateError::Unimplemented("far return"));
                }
                let esp = self.view(RegView::R32(Gpr::Esp));
                let t = self.temp();
                self.sink.push(Inst::Load {
                    dst: t,
                    addr: esp,
                    width: Width::W32,
                });
                self.sink.push(Inst::Binary {
                    dst: esp,
                    op: BinOp::Add,
                    lhs: esp,
                    rhs: Src::Imm(4 + i32::from(stack_adjust)),
                });
                self.exit_via(t, inst.pc, BranchKind::Return);
                Ok(Flow::Done)
            }
            InstKind::Leave => {
                let ebp = self.view(RegView::R32(Gpr::Ebp));
                let esp = self.view(RegView::R32(Gpr::Esp));
                self.sink.push(Inst::Move { dst: esp, src: ebp });
                let v = self.temp();
                self.sink.push(Inst::Load {
                    dst: v,
                    addr: esp,
                    width: Width::W32,
                });
                self.sink.push(Inst::Binary {
                    dst: esp,
                    op: BinOp::Add,
                    lhs: esp,
                    rhs: Src::Imm(4),
                });
                self.sink.push(Inst::Move { dst: ebp, src: v });
                Ok(Flow::Next)
            }
            InstKind::Int { vector } => {
                // The kernel proxy may touch anything: resolve and spill
                // everything, trap, and refill.
                self.regs.resolve_all(&mut *self.sink);
                self.regs.mark_all_used();
                self.regs.emit_spills(&mut *self.sink);
                self.sink.push(Inst::SystemCall {
                    vector,
                    next_pc: inst.next_pc(),
                });
                self.regs.emit_fills(&mut *self.sink);
                Ok(Flow::Next)
            }
            InstKind::Setcc { cond, dst } => {
                let c = self.cond_temp(cond)?;
                self.store(&dst, c)?;
                Ok(Flow::Next)
            }
            InstKind::Cmov {
                cond, dst, src, ..
            } => {
                let c = self.cond_temp(cond)?;
                let v = self.load(&src)?;
                let cur = self.load(&Operand::Reg(dst))?;
                let r = self.temp();
                self.sink.push(Inst::Select {
                    dst: r,
                    cond: c,
                    on_true: v.into(),
                    on_false: cur.into(),
                });
                let d = self.view(dst);
                self.sink.push(Inst::Move { dst: d, src: r });
                Ok(Flow::Next)
            }
            InstKind::Movzx { dst, src } => {
                let v = self.load(&src)?;
                let r = self.temp();
                self.sink.push(Inst::Binary {
                    dst: r,
                    op: BinOp::And,
                    lhs: v,
                    rhs: Src::Imm(operand_width(&src).mask() as i32),
                });
                let d = self.view(dst);
                self.sink.push(Inst::Move { dst: d, src: r });
                Ok(Flow::Next)
            }
            InstKind::Movsx { dst, src } => {
                let v = self.load(&src)?;
                let op = match operand_width(&src) {
                    Width::W8 => UnOp::SignExtend8,
                    _ => UnOp::SignExtend16,
                };
                let r = self.temp();
                self.sink.push(Inst::Unary { dst: r, op, src: v });
                let d = self.view(dst);
                self.sink.push(Inst::Move { dst: d, src: r });
                Ok(Flow::Next)
            }
            InstKind::CmpXchg { width, dst, src } => {
                let acc_view = RegView::from_bits(0, width);
                let a = self.load(&Operand::Reg(acc_view))?;
                let old = self.load(&dst)?;
                let sv = self.load(&Operand::Reg(src))?;
                let diff = self.temp();
                self.sink.push(Inst::Binary {
                    dst: diff,
                    op: BinOp::Sub,
                    lhs: a,
                    rhs: old.into(),
                });
                self.carry_flags(true, a, old);
                self.result_flags(diff);
                // Branch-free: both sides select on the zf outcome.
                let eq = self.regs.flag(Flag::Zf);
                let newv = self.temp();
                self.sink.push(Inst::Select {
                    dst: newv,
                    cond: eq,
                    on_true: sv.into(),
                    on_false: old.into(),
                });
                self.store(&dst, newv)?;
                let accnew = self.temp();
                self.sink.push(Inst::Select {
                    dst: accnew,
                    cond: eq,
                    on_true: a.into(),
                    on_false: old.into(),
                });
                self.store(&Operand::Reg(acc_view), accnew)?;
                Ok(Flow::Next)
            }
            InstKind::Rdtsc => {
                let eax = self.view(RegView::R32(Gpr::Eax));
                let edx = self.view(RegView::R32(Gpr::Edx));
                self.sink.push(Inst::ReadTimestamp { lo: eax, hi: edx });
                Ok(Flow::Next)
            }
            InstKind::Nop => Ok(Flow::Next),
            InstKind::SetFlag { flag, value } => {
                self.set_flag_const(flag, value);
                Ok(Flow::Next)
            }
            InstKind::LoadControl { reg, src } => {
                let v = self.load(&src)?;
                self.sink.push(Inst::WriteControl { reg, src: v });
                Ok(Flow::Next)
            }
            InstKind::StoreControl { reg, dst } => {
                let t = self.temp();
                self.sink.push(Inst::ReadControl { dst: t, reg });
                self.store(&dst, t)?;
                Ok(Flow::Next)
            }
            InstKind::Bad { fault } => {
                tracing::debug!(
                    pc = format_args!("{:#x}", inst.pc),
                    %fault,
                    "bad instruction reached"
                );
                self.exit_bad(inst.pc);
                Ok(Flow::Done)
            }
        }
    }
}
