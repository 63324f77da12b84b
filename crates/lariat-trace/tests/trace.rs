//! End-to-end trace translation over small guest code images.

use std::collections::{HashMap, HashSet};

use lariat_trace::{
    ArchReg, BinOp, BranchKind, BranchProfile, Cfg, CmpCond, ColdStart, GuestImage, Inst, Src,
    Terminator, TraceBuilder, TraceCache, TraceConfig, TraceSummary, BAD_EXIT_PC,
};
use lariat_types::Gpr;
use lariat_x86::InstFetch;

struct Image(Vec<u8>);

impl InstFetch for Image {
    fn fetch8(&self, addr: u32) -> Option<u8> {
        self.0.get(addr as usize).copied()
    }
}

impl GuestImage for Image {}

struct Profile(HashMap<u32, Vec<u32>>);

impl BranchProfile for Profile {
    fn targets(&self, pc: u32) -> Vec<u32> {
        self.0.get(&pc).cloned().unwrap_or_default()
    }
}

struct Resident(HashSet<u32>);

impl TraceCache for Resident {
    fn contains(&self, pc: u32) -> bool {
        self.0.contains(&pc)
    }
}

fn translate_with(
    code: &[u8],
    profile: &dyn BranchProfile,
    cache: &dyn TraceCache,
    config: TraceConfig,
) -> (Cfg, TraceSummary) {
    let image = Image(code.to_vec());
    let mut cfg = Cfg::new();
    let summary = TraceBuilder::new(&mut cfg, &image, profile, cache, config)
        .build(0)
        .unwrap();
    (cfg, summary)
}

fn translate(code: &[u8]) -> (Cfg, TraceSummary) {
    translate_with(code, &ColdStart, &ColdStart, TraceConfig::default())
}

fn all_insts(cfg: &Cfg) -> Vec<Inst> {
    cfg.blocks().flat_map(|(_, b)| b.insts.clone()).collect()
}

/// The block the prologue jumps into, i.e. the entry instruction's block.
fn first_block(cfg: &Cfg, summary: &TraceSummary) -> lariat_trace::BlockId {
    match cfg.block(summary.entry).term {
        Terminator::Jump(b) => b,
        ref other => panic!("prologue ends in {other:?}"),
    }
}

#[test]
fn straightline_add_then_ret() {
    // add eax, 5; ret
    let (cfg, summary) = translate(&[0x83, 0xC0, 0x05, 0xC3]);
    assert_eq!(summary.instructions, 2);
    assert!(matches!(
        cfg.block(summary.finish).term,
        Terminator::Return(_)
    ));
    assert!(all_insts(&cfg).iter().any(|i| matches!(
        i,
        Inst::RecordBranch {
            kind: BranchKind::Return,
            ..
        }
    )));
}

#[test]
fn self_loop_reuses_its_own_block() {
    // jmp -2: an unconditional jump back to itself.
    let (cfg, summary) = translate(&[0xEB, 0xFE]);
    assert_eq!(summary.instructions, 1);
    let b = first_block(&cfg, &summary);
    assert_eq!(cfg.block(b).term, Terminator::Jump(b));
}

#[test]
fn conditional_branch_produces_two_way_block() {
    // je +2; inc eax; ret; ret
    let (cfg, summary) = translate(&[0x74, 0x02, 0x40, 0xC3, 0xC3]);
    assert_eq!(summary.instructions, 4);
    let b = first_block(&cfg, &summary);
    match cfg.block(b).term {
        Terminator::Branch {
            likely,
            taken,
            fallthrough,
            ..
        } => {
            // Forward branch with no hint predicts not taken.
            assert_eq!(likely, Some(false));
            assert_ne!(taken, fallthrough);
        }
        ref other => panic!("expected a branch, got {other:?}"),
    }
}

#[test]
fn cs_prefix_hints_a_conditional_taken() {
    let (cfg, summary) = translate(&[0x2E, 0x74, 0x01, 0xC3, 0xC3]);
    let b = first_block(&cfg, &summary);
    match cfg.block(b).term {
        Terminator::Branch { likely, .. } => assert_eq!(likely, Some(true)),
        ref other => panic!("expected a branch, got {other:?}"),
    }
}

#[test]
fn call_records_the_branch_and_exits() {
    // call +0x10
    let (cfg, summary) = translate(&[0xE8, 0x10, 0x00, 0x00, 0x00]);
    assert_eq!(summary.instructions, 1);
    let insts = all_insts(&cfg);
    assert!(insts.iter().any(|i| matches!(
        i,
        Inst::RecordBranch {
            kind: BranchKind::Call,
            ..
        }
    )));
    // The pushed return address and the exit pc both name pc 5 / 0x15.
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Const { value: 5, .. })));
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Const { value: 0x15, .. })));
}

#[test]
fn unknown_target_dynamic_jump_exits_through_the_profile_hook() {
    // jmp eax with no profiled targets.
    let (cfg, summary) = translate(&[0xFF, 0xE0]);
    assert_eq!(summary.instructions, 1);
    let b = first_block(&cfg, &summary);
    assert_eq!(cfg.block(b).term, Terminator::Jump(summary.finish));
    assert!(all_insts(&cfg).iter().any(|i| matches!(
        i,
        Inst::RecordBranch {
            kind: BranchKind::Jump,
            ..
        }
    )));
}

#[test]
fn single_target_dynamic_jump_degrades_to_compare_and_branch() {
    let mut code = vec![0x90u8; 0x11];
    code[0] = 0xFF;
    code[1] = 0xE0; // jmp eax
    code[0x10] = 0xC3; // profiled target
    let profile = Profile(HashMap::from([(0, vec![0x10])]));
    let (cfg, summary) =
        translate_with(&code, &profile, &ColdStart, TraceConfig::default());
    assert_eq!(summary.instructions, 2);
    let b = first_block(&cfg, &summary);
    match cfg.block(b).term {
        Terminator::Branch { likely, .. } => assert_eq!(likely, Some(true)),
        ref other => panic!("expected a branch, got {other:?}"),
    }
    assert!(cfg.block(b).insts.iter().any(|i| matches!(
        i,
        Inst::BoolCmp {
            rhs: Src::Imm(0x10),
            ..
        }
    )));
}

#[test]
fn multi_target_dynamic_jump_becomes_a_switch() {
    let mut code = vec![0x90u8; 0x21];
    code[0] = 0xFF;
    code[1] = 0xE0;
    code[0x10] = 0xC3;
    code[0x20] = 0xC3;
    let profile = Profile(HashMap::from([(0, vec![0x10, 0x20])]));
    let (cfg, summary) =
        translate_with(&code, &profile, &ColdStart, TraceConfig::default());
    assert_eq!(summary.instructions, 3);
    let b = first_block(&cfg, &summary);
    match cfg.block(b).term {
        Terminator::Switch { ref cases, .. } => {
            assert_eq!(cases.len(), 2);
            assert_eq!(cases[0].0, 0x10);
            assert_eq!(cases[1].0, 0x20);
        }
        ref other => panic!("expected a switch, got {other:?}"),
    }
}

#[test]
fn instruction_budget_caps_trace_growth() {
    let code = [0x40, 0x40, 0x40, 0x40, 0xC3];
    let config = TraceConfig {
        max_instructions: 2,
        single_instruction: false,
    };
    let (cfg, summary) = translate_with(&code, &ColdStart, &ColdStart, config);
    assert_eq!(summary.instructions, 2);
    // The overflow continuation exits with its pc.
    assert!(all_insts(&cfg)
        .iter()
        .any(|i| matches!(i, Inst::Const { value: 2, .. })));
}

#[test]
fn single_instruction_mode_translates_exactly_one() {
    let (cfg, summary) = translate_with(
        &[0x83, 0xC0, 0x05, 0xC3],
        &ColdStart,
        &ColdStart,
        TraceConfig::single_instruction(),
    );
    assert_eq!(summary.instructions, 1);
    assert!(all_insts(&cfg)
        .iter()
        .any(|i| matches!(i, Inst::Const { value: 3, .. })));
}

#[test]
fn branches_into_cached_traces_exit_instead_of_inlining() {
    let cache = Resident(HashSet::from([1]));
    let (cfg, summary) = translate_with(
        &[0x40, 0x40, 0xC3],
        &ColdStart,
        &cache,
        TraceConfig::default(),
    );
    assert_eq!(summary.instructions, 1);
    assert!(all_insts(&cfg)
        .iter()
        .any(|i| matches!(i, Inst::Const { value: 1, .. })));
}

#[test]
fn bad_instruction_raises_and_exits_with_the_sentinel() {
    let (cfg, summary) = translate(&[0x62]);
    assert_eq!(summary.instructions, 1);
    let insts = all_insts(&cfg);
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::RaiseBadInstruction { pc: 0 })));
    let sentinel = BAD_EXIT_PC as i32;
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::Const { value, .. } if *value == sentinel)));
}

#[test]
fn divide_guards_against_a_zero_divisor() {
    // div ebx; ret
    let (cfg, summary) = translate(&[0xF7, 0xF3, 0xC3]);
    assert_eq!(summary.instructions, 2);
    let insts = all_insts(&cfg);
    assert!(insts
        .iter()
        .any(|i| matches!(i, Inst::RaiseDivideError { pc: 0 })));
    let b = first_block(&cfg, &summary);
    match cfg.block(b).term {
        Terminator::Branch { likely, .. } => assert_eq!(likely, Some(false)),
        ref other => panic!("expected the zero guard, got {other:?}"),
    }
}

#[test]
fn high_byte_write_is_merged_back_at_the_exit() {
    // mov ah, 0x12; ret
    let (cfg, summary) = translate(&[0xB4, 0x12, 0xC3]);
    assert_eq!(summary.instructions, 2);
    let insts = all_insts(&cfg);
    // Reconciliation masks both byte temps and shifts the high one back up.
    assert!(insts.iter().any(|i| matches!(
        i,
        Inst::Binary {
            op: BinOp::And,
            rhs: Src::Imm(0xFF),
            ..
        }
    )));
    assert!(insts.iter().any(|i| matches!(
        i,
        Inst::Binary {
            op: BinOp::Shl,
            rhs: Src::Imm(8),
            ..
        }
    )));
}

#[test]
fn same_pc_under_different_laziness_gets_its_own_block() {
    // je +2; mov al, 0x12; inc ebx; ret — pc 4 is reached clean on the
    // taken edge and with a dirty byte view on the fallthrough edge, so
    // both it and the ret behind it are translated once per state.
    let (cfg, summary) = translate(&[0x74, 0x02, 0xB0, 0x12, 0x43, 0xC3]);
    assert_eq!(summary.instructions, 6);

    // Two independent copies of the inc.
    let inc_lowerings = all_insts(&cfg)
        .iter()
        .filter(|i| {
            matches!(
                i,
                Inst::BoolCmp {
                    cond: CmpCond::OverflowFromAdd,
                    rhs: Src::Imm(1),
                    ..
                }
            )
        })
        .count();
    assert_eq!(inc_lowerings, 2);

    // The dirty path reconciles eax back to full width before leaving.
    let insts = all_insts(&cfg);
    assert!(insts.iter().any(|i| matches!(
        i,
        Inst::Binary {
            op: BinOp::And,
            rhs: Src::Imm(0xFF),
            ..
        }
    )));
    assert!(insts.iter().any(|i| matches!(
        i,
        Inst::Binary {
            op: BinOp::Shl,
            rhs: Src::Imm(8),
            ..
        }
    )));
}

#[test]
fn untouched_registers_are_not_filled_or_spilled() {
    // add eax, 5; ret — touches eax, esp, and the arithmetic flags only.
    let (cfg, summary) = translate(&[0x83, 0xC0, 0x05, 0xC3]);
    let prologue = &cfg.block(summary.entry).insts;
    let has_fill = |reg: ArchReg| {
        prologue
            .iter()
            .any(|i| matches!(i, Inst::Fill { reg: r, .. } if *r == reg))
    };
    assert!(has_fill(ArchReg::Gpr(Gpr::Eax)));
    assert!(has_fill(ArchReg::Gpr(Gpr::Esp)));
    assert!(!has_fill(ArchReg::Gpr(Gpr::Ecx)));

    let finish = &cfg.block(summary.finish).insts;
    let spills = finish
        .iter()
        .filter(|i| matches!(i, Inst::Spill { .. }))
        .count();
    let fills = prologue
        .iter()
        .filter(|i| matches!(i, Inst::Fill { .. }))
        .count();
    assert_eq!(fills, spills);
}

#[test]
fn rep_movs_builds_a_counted_loop() {
    // rep movsd; ret
    let (cfg, summary) = translate(&[0xF3, 0xA5, 0xC3]);
    assert_eq!(summary.instructions, 2);
    // One back edge: some block branches to itself.
    let back_edges = cfg
        .blocks()
        .filter(|(id, b)| match b.term {
            Terminator::Branch { taken, .. } => taken == *id,
            _ => false,
        })
        .count();
    assert_eq!(back_edges, 1);
}

#[test]
fn system_call_spills_and_refills_everything() {
    // int 0x80; ret
    let (cfg, summary) = translate(&[0xCD, 0x80, 0xC3]);
    assert_eq!(summary.instructions, 2);
    let b = first_block(&cfg, &summary);
    let insts = &cfg.block(b).insts;
    let call_at = insts
        .iter()
        .position(|i| matches!(i, Inst::SystemCall { vector: 0x80, .. }))
        .expect("system call emitted");
    let spills_before = insts[..call_at]
        .iter()
        .filter(|i| matches!(i, Inst::Spill { .. }))
        .count();
    let fills_after = insts[call_at..]
        .iter()
        .filter(|i| matches!(i, Inst::Fill { .. }))
        .count();
    // Every gpr, segment, and modelled flag crosses the trap.
    assert_eq!(spills_before, 8 + 6 + 8);
    assert_eq!(fills_after, 8 + 6 + 8);
}
