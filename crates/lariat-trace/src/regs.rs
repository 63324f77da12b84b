//! Guest register temps and deferred alias reconciliation.
//!
//! Each general-purpose register owns four temps: the 32-bit value, the
//! 16-bit low half, and (for eax..ebx) the two 8-bit halves. Only the view
//! tagged valid in the [`RegAliasState`] is current; requesting another view
//! emits the mask/shift/or merge on the spot and retags. High-byte views are
//! derived by an unmasked shift, with the mask applied where the narrow temp
//! is merged back.
//!
//! Fill and spill are deferred to trace entry and exit, and elided for
//! registers the trace never touches.

use lariat_types::{Flag, Gpr, Seg};
use lariat_x86::{AliasTag, RegAliasState, RegView};

use crate::ir::{ArchReg, BinOp, Inst, IrSink, Src, Temp, TempKind};

pub(crate) struct RegBank {
    gpr32: [Temp; 8],
    gpr16: [Temp; 8],
    gpr8l: [Temp; 4],
    gpr8h: [Temp; 4],
    seg: [Temp; 6],
    flag: [Temp; 8],
    gpr_used: [bool; 8],
    seg_used: [bool; 6],
    flag_used: [bool; 8],
    pub lazy: RegAliasState,
}

impl RegBank {
    pub fn new(sink: &mut dyn IrSink) -> RegBank {
        let mut t = || sink.new_temp(TempKind::Int);
        RegBank {
            gpr32: [t(), t(), t(), t(), t(), t(), t(), t()],
            gpr16: [t(), t(), t(), t(), t(), t(), t(), t()],
            gpr8l: [t(), t(), t(), t()],
            gpr8h: [t(), t(), t(), t()],
            seg: [t(), t(), t(), t(), t(), t()],
            flag: [t(), t(), t(), t(), t(), t(), t(), t()],
            gpr_used: [false; 8],
            seg_used: [false; 6],
            flag_used: [false; 8],
            lazy: RegAliasState::default(),
        }
    }

    /// The temp holding the requested view, reconciling from whichever view
    /// is currently valid. After this the requested view is the valid one,
    /// so the returned temp may be read or overwritten.
    pub fn view(&mut self, sink: &mut dyn IrSink, view: RegView) -> Temp {
        let gpr = view.gpr();
        let i = gpr.index();
        self.gpr_used[i] = true;
        let tag = self.lazy.tag(gpr);
        match view {
            RegView::R32(_) => {
                match tag {
                    AliasTag::WideValid => {}
                    AliasTag::HalfValid => {
                        // e = (e & 0xffff0000) | (x & 0xffff)
                        let low = sink.new_temp(TempKind::Int);
                        sink.push(Inst::Binary {
                            dst: self.gpr32[i],
                            op: BinOp::And,
                            lhs: self.gpr32[i],
                            rhs: Src::Imm(0xFFFF_0000u32 as i32),
                        });
                        sink.push(Inst::Binary {
                            dst: low,
                            op: BinOp::And,
                            lhs: self.gpr16[i],
                            rhs: Src::Imm(0xFFFF),
                        });
                        sink.push(Inst::Binary {
                            dst: self.gpr32[i],
                            op: BinOp::Or,
                            lhs: self.gpr32[i],
                            rhs: low.into(),
                        });
                    }
                    AliasTag::BytesValid => {
                        // e = (e & 0xffff0000) | ((h & 0xff) << 8) | (l & 0xff)
                        let hi = sink.new_temp(TempKind::Int);
                        let lo = sink.new_temp(TempKind::Int);
                        sink.push(Inst::Binary {
                            dst: self.gpr32[i],
                            op: BinOp::And,
                            lhs: self.gpr32[i],
                            rhs: Src::Imm(0xFFFF_0000u32 as i32),
                        });
                        sink.push(Inst::Binary {
                            dst: hi,
                            op: BinOp::And,
                            lhs: self.gpr8h[i],
                            rhs: Src::Imm(0xFF),
                        });
                        sink.push(Inst::Binary {
                            dst: hi,
                            op: BinOp::Shl,
                            lhs: hi,
                            rhs: Src::Imm(8),
                        });
                        sink.push(Inst::Binary {
                            dst: lo,
                            op: BinOp::And,
                            lhs: self.gpr8l[i],
                            rhs: Src::Imm(0xFF),
                        });
                        sink.push(Inst::Binary {
                            dst: self.gpr32[i],
                            op: BinOp::Or,
                            lhs: self.gpr32[i],
                            rhs: hi.into(),
                        });
                        sink.push(Inst::Binary {
                            dst: self.gpr32[i],
                            op: BinOp::Or,
                            lhs: self.gpr32[i],
                            rhs: lo.into(),
                        });
                    }
                }
                self.lazy.set_tag(gpr, AliasTag::WideValid);
                self.gpr32[i]
            }
            RegView::R16(_) => {
                match tag {
                    AliasTag::HalfValid => {}
                    AliasTag::WideValid => {
                        sink.push(Inst::Move {
                            dst: self.gpr16[i],
                            src: self.gpr32[i],
                        });
                    }
                    AliasTag::BytesValid => {
                        // x = ((h & 0xff) << 8) | (l & 0xff)
                        let lo = sink.new_temp(TempKind::Int);
                        sink.push(Inst::Binary {
                            dst: self.gpr16[i],
                            op: BinOp::And,
                            lhs: self.gpr8h[i],
                            rhs: Src::Imm(0xFF),
                        });
                        sink.push(Inst::Binary {
                            dst: self.gpr16[i],
                            op: BinOp::Shl,
                            lhs: self.gpr16[i],
                            rhs: Src::Imm(8),
                        });
                        sink.push(Inst::Binary {
                            dst: lo,
                            op: BinOp::And,
                            lhs: self.gpr8l[i],
                            rhs: Src::Imm(0xFF),
                        });
                        sink.push(Inst::Binary {
                            dst: self.gpr16[i],
                            op: BinOp::Or,
                            lhs: self.gpr16[i],
                            rhs: lo.into(),
                        });
                    }
                }
                self.lazy.set_tag(gpr, AliasTag::HalfValid);
                self.gpr16[i]
            }
            RegView::R8(r8) => {
                match tag {
                    AliasTag::BytesValid => {}
                    AliasTag::WideValid | AliasTag::HalfValid => {
                        let src = if tag == AliasTag::WideValid {
                            self.gpr32[i]
                        } else {
                            self.gpr16[i]
                        };
                        sink.push(Inst::Move {
                            dst: self.gpr8l[i],
                            src,
                        });
                        sink.push(Inst::Binary {
                            dst: self.gpr8h[i],
                            op: BinOp::Shr,
                            lhs: src,
                            rhs: Src::Imm(8),
                        });
                    }
                }
                self.lazy.set_tag(gpr, AliasTag::BytesValid);
                if r8.high {
                    self.gpr8h[i]
                } else {
                    self.gpr8l[i]
                }
            }
        }
    }

    pub fn seg(&mut self, seg: Seg) -> Temp {
        self.seg_used[seg.index()] = true;
        self.seg[seg.index()]
    }

    pub fn flag(&mut self, flag: Flag) -> Temp {
        let i = flag as usize;
        self.flag_used[i] = true;
        self.flag[i]
    }

    /// Reconcile every register back to its 32-bit view, as required at
    /// every trace exit.
    pub fn resolve_all(&mut self, sink: &mut dyn IrSink) {
        for gpr in Gpr::ALL {
            if !self.lazy.is_wide_valid(gpr) {
                self.view(sink, RegView::R32(gpr));
            }
        }
    }

    /// System calls may read or write anything, so everything is live.
    pub fn mark_all_used(&mut self) {
        self.gpr_used = [true; 8];
        self.seg_used = [true; 6];
        self.flag_used = [true; 8];
    }

    /// Fills for every register the trace touched, in architected order.
    pub fn emit_fills(&self, sink: &mut dyn IrSink) {
        for gpr in Gpr::ALL {
            if self.gpr_used[gpr.index()] {
                sink.push(Inst::Fill {
                    dst: self.gpr32[gpr.index()],
                    reg: ArchReg::Gpr(gpr),
                });
            }
        }
        for seg in Seg::ALL {
            if self.seg_used[seg.index()] {
                sink.push(Inst::Fill {
                    dst: self.seg[seg.index()],
                    reg: ArchReg::Seg(seg),
                });
            }
        }
        for flag in Flag::ALL {
            if self.flag_used[flag as usize] {
                sink.push(Inst::Fill {
                    dst: self.flag[flag as usize],
                    reg: ArchReg::Flag(flag),
                });
            }
        }
    }

    /// Spill-backs for every touched register; callers must have resolved
    /// the 32-bit views first.
    pub fn emit_spills(&self, sink: &mut dyn IrSink) {
        for gpr in Gpr::ALL {
            if self.gpr_used[gpr.index()] {
                sink.push(Inst::Spill {
                    reg: ArchReg::Gpr(gpr),
                    src: self.gpr32[gpr.index()],
                });
            }
        }
        for seg in Seg::ALL {
            if self.seg_used[seg.index()] {
                sink.push(Inst::Spill {
                    reg: ArchReg::Seg(seg),
                    src: self.seg[seg.index()],
                });
            }
        }
        for flag in Flag::ALL {
            if self.flag_used[flag as usize] {
                sink.push(Inst::Spill {
                    reg: ArchReg::Flag(flag),
                    src: self.flag[flag as usize],
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lariat_types::Reg8;

    use super::*;
    use crate::cfg::Cfg;

    fn setup() -> (Cfg, RegBank, crate::ir::BlockId) {
        let mut cfg = Cfg::new();
        let bank = RegBank::new(&mut cfg);
        let b = cfg.create_block();
        cfg.set_current(b);
        (cfg, bank, b)
    }

    #[test]
    fn wide_view_of_a_wide_register_emits_nothing() {
        let (mut cfg, mut bank, b) = setup();
        bank.view(&mut cfg, RegView::R32(Gpr::Eax));
        assert!(cfg.block(b).insts.is_empty());
        assert!(bank.lazy.is_wide_valid(Gpr::Eax));
    }

    #[test]
    fn byte_views_derive_the_high_byte_by_shift() {
        let (mut cfg, mut bank, b) = setup();
        let ah = bank.view(
            &mut cfg,
            RegView::R8(Reg8 {
                gpr: Gpr::Eax,
                high: true,
            }),
        );
        assert!(bank.lazy.is_bytes_valid(Gpr::Eax));
        // A move for the low byte and a shift for the high byte.
        let insts = &cfg.block(b).insts;
        assert_eq!(insts.len(), 2);
        assert!(matches!(insts[0], Inst::Move { .. }));
        assert!(matches!(
            insts[1],
            Inst::Binary {
                dst,
                op: BinOp::Shr,
                rhs: Src::Imm(8),
                ..
            } if dst == ah
        ));
    }

    #[test]
    fn resolving_bytes_back_to_wide_masks_and_merges() {
        let (mut cfg, mut bank, b) = setup();
        bank.view(
            &mut cfg,
            RegView::R8(Reg8 {
                gpr: Gpr::Eax,
                high: false,
            }),
        );
        let split_at = cfg.block(b).insts.len();
        bank.resolve_all(&mut cfg);
        assert!(bank.lazy.is_fully_wide());
        // Mask the wide keep-half, mask both bytes, shift the high one, or
        // everything together.
        let merge = &cfg.block(b).insts[split_at..];
        assert_eq!(merge.len(), 6);
    }

    #[test]
    fn untouched_registers_are_not_filled_or_spilled() {
        let (mut cfg, mut bank, b) = setup();
        bank.view(&mut cfg, RegView::R32(Gpr::Ecx));
        bank.flag(Flag::Zf);
        bank.emit_fills(&mut cfg);
        bank.emit_spills(&mut cfg);
        let insts = &cfg.block(b).insts;
        let fills = insts
            .iter()
            .filter(|i| matches!(i, Inst::Fill { .. }))
            .count();
        let spills = insts
            .iter()
            .filter(|i| matches!(i, Inst::Spill { .. }))
            .count();
        assert_eq!(fills, 2);
        assert_eq!(spills, 2);
    }
}
