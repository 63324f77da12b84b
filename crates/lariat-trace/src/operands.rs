//! Lowering of decoded operands to IR: loads, stores, and effective
//! addresses.

use lariat_types::{Seg, Width};
use lariat_x86::{MemRef, Operand, RegView};

use crate::ir::{BinOp, Inst, IrSink, Src, Temp, TempKind};
use crate::regs::RegBank;
use crate::TranslateError;

/// Effective address of a memory reference, in a fresh temp.
///
/// The address is accumulated in a fixed order: scaled index, base,
/// displacement, then segment base, each step wrapping at 32 bits. Only gs
/// carries a nonzero segment base, folded in as a constant from the guest
/// image; fs is rejected, every other segment contributes nothing.
pub(crate) fn compute_address(
    sink: &mut dyn IrSink,
    regs: &mut RegBank,
    mem: &MemRef,
    gs_base: u32,
) -> Result<Temp, TranslateError> {
    let addr = sink.new_temp(TempKind::Int);
    let mut seeded = false;

    if let Some(index) = mem.index {
        let idx = regs.view(sink, RegView::R32(index));
        let shift = mem.scale.trailing_zeros() as i32;
        if shift > 0 {
            sink.push(Inst::Binary {
                dst: addr,
                op: BinOp::Shl,
                lhs: idx,
                rhs: Src::Imm(shift),
            });
        } else {
            sink.push(Inst::Move { dst: addr, src: idx });
        }
        seeded = true;
    }

    if let Some(base) = mem.base {
        let b = regs.view(sink, RegView::R32(base));
        if seeded {
            sink.push(Inst::Binary {
                dst: addr,
                op: BinOp::Add,
                lhs: addr,
                rhs: b.into(),
            });
        } else {
            sink.push(Inst::Move { dst: addr, src: b });
            seeded = true;
        }
    }

    if mem.disp != 0 || !seeded {
        if seeded {
            sink.push(Inst::Binary {
                dst: addr,
                op: BinOp::Add,
                lhs: addr,
                rhs: Src::Imm(mem.disp),
            });
        } else {
            sink.push(Inst::Const {
                dst: addr,
                value: mem.disp,
            });
        }
    }

    match mem.seg {
        Seg::Gs if gs_base != 0 => {
            sink.push(Inst::Binary {
                dst: addr,
                op: BinOp::Add,
                lhs: addr,
                rhs: Src::Imm(gs_base as i32),
            });
        }
        Seg::Fs => return Err(TranslateError::FsSegment),
        _ => {}
    }

    Ok(addr)
}

/// Read an operand's value into a fresh temp. Sub-word memory loads
/// sign-extend; register reads are raw, with masking left to the points
/// that merge narrow views.
pub(crate) fn load_operand(
    sink: &mut dyn IrSink,
    regs: &mut RegBank,
    op: &Operand,
    gs_base: u32,
) -> Result<Temp, TranslateError> {
    let dst = sink.new_temp(TempKind::Int);
    match op {
        Operand::Imm(v) => sink.push(Inst::Const { dst, value: *v }),
        Operand::Reg(view) => {
            let src = regs.view(sink, *view);
            sink.push(Inst::Move { dst, src });
        }
        Operand::SegReg(seg) => {
            let src = regs.seg(*seg);
            sink.push(Inst::Move { dst, src });
        }
        Operand::Mem(mem) => {
            let addr = compute_address(sink, regs, mem, gs_base)?;
            sink.push(Inst::Load {
                dst,
                addr,
                width: mem.width,
            });
        }
    }
    Ok(dst)
}

/// Write a value to an assignable operand. Stores truncate to the operand
/// width; an immediate destination is a translator bug surfaced as an error.
pub(crate) fn store_operand(
    sink: &mut dyn IrSink,
    regs: &mut RegBank,
    op: &Operand,
    src: Temp,
    gs_base: u32,
) -> Result<(), TranslateError> {
    match op {
        Operand::Imm(_) => return Err(TranslateError::StoreToImmediate),
        Operand::Reg(view) => {
            let dst = regs.view(sink, *view);
            sink.push(Inst::Move { dst, src });
        }
        Operand::SegReg(seg) => {
            let dst = regs.seg(*seg);
            sink.push(Inst::Move { dst, src });
        }
        Operand::Mem(mem) => {
            let addr = compute_address(sink, regs, mem, gs_base)?;
            sink.push(Inst::Store {
                addr,
                src,
                width: mem.width,
            });
        }
    }
    Ok(())
}

/// The operand's width, defaulting to 32 bits for bare immediates.
pub(crate) fn operand_width(op: &Operand) -> Width {
    op.width().unwrap_or(Width::W32)
}

#[cfg(test)]
mod tests {
    use lariat_types::Gpr;

    use super::*;
    use crate::cfg::Cfg;
    use crate::regs::RegBank;

    fn setup() -> (Cfg, RegBank) {
        let mut cfg = Cfg::new();
        let bank = RegBank::new(&mut cfg);
        let b = cfg.create_block();
        cfg.set_current(b);
        (cfg, bank)
    }

    fn mem(base: Option<Gpr>, index: Option<Gpr>, scale: u8, disp: i32, seg: Seg) -> MemRef {
        MemRef {
            seg,
            base,
            index,
            scale,
            disp,
            addr_width: Width::W32,
            width: Width::W32,
        }
    }

    #[test]
    fn address_accumulates_index_base_disp_in_order() {
        let (mut cfg, mut bank) = setup();
        let m = mem(Some(Gpr::Eax), Some(Gpr::Ebx), 4, 0x10, Seg::Ds);
        compute_address(&mut cfg, &mut bank, &m, 0).unwrap();
        let b = cfg.current();
        let insts = &cfg.block(b).insts;
        assert!(matches!(
            insts[0],
            Inst::Binary {
                op: BinOp::Shl,
                rhs: Src::Imm(2),
                ..
            }
        ));
        assert!(matches!(insts[1], Inst::Binary { op: BinOp::Add, .. }));
        assert!(matches!(
            insts[2],
            Inst::Binary {
                op: BinOp::Add,
                rhs: Src::Imm(0x10),
                ..
            }
        ));
    }

    #[test]
    fn gs_addresses_fold_in_the_segment_base() {
        let (mut cfg, mut bank) = setup();
        let m = mem(Some(Gpr::Eax), None, 0, 0, Seg::Gs);
        compute_address(&mut cfg, &mut bank, &m, 0x7000_0000).unwrap();
        let b = cfg.current();
        assert!(cfg.block(b).insts.iter().any(|i| matches!(
            i,
            Inst::Binary {
                op: BinOp::Add,
                rhs: Src::Imm(0x7000_0000),
                ..
            }
        )));

        // A flat gs contributes nothing.
        let (mut cfg, mut bank) = setup();
        compute_address(&mut cfg, &mut bank, &m, 0).unwrap();
        let b = cfg.current();
        assert_eq!(cfg.block(b).insts.len(), 1);
    }

    #[test]
    fn fs_addresses_are_rejected() {
        let (mut cfg, mut bank) = setup();
        let m = mem(Some(Gpr::Eax), None, 0, 0, Seg::Fs);
        assert_eq!(
            compute_address(&mut cfg, &mut bank, &m, 0).unwrap_err(),
            TranslateError::FsSegment
        );
    }

    #[test]
    fn absolute_addresses_seed_from_the_displacement() {
        let (mut cfg, mut bank) = setup();
        let m = mem(None, None, 0, 0x1234, Seg::Ds);
        let addr = compute_address(&mut cfg, &mut bank, &m, 0).unwrap();
        let b = cfg.current();
        assert_eq!(
            cfg.block(b).insts,
            vec![Inst::Const {
                dst: addr,
                value: 0x1234
            }]
        );
    }

    #[test]
    fn storing_to_an_immediate_is_an_error() {
        let (mut cfg, mut bank) = setup();
        let t = cfg.new_temp(crate::ir::TempKind::Int);
        assert_eq!(
            store_operand(&mut cfg, &mut bank, &Operand::Imm(1), t, 0).unwrap_err(),
            TranslateError::StoreToImmediate
        );
    }
}
