//! Trace translation for the x86 front end: turns decoded guest
//! instructions into target-independent IR, one basic block per translated
//! instruction, with lazy register aliasing and profile-guided resolution of
//! dynamic branches.
//!
//! The backend that generates real code plugs in through [`IrSink`]; the
//! guest address space, branch profile, and code cache are likewise trait
//! objects so the builder stays independent of the runtime that hosts it.

use thiserror::Error;

mod builder;
mod cfg;
mod config;
mod emit;
mod ir;
mod operands;
mod regs;
mod traits;

pub use builder::{TraceBuilder, TraceSummary, BAD_EXIT_PC};
pub use cfg::{Block, Cfg};
pub use config::TraceConfig;
pub use ir::{
    ArchReg, BinOp, BlockId, BranchKind, CmpCond, Inst, IrSink, Src, Temp, TempKind, Terminator,
    UnOp,
};
pub use traits::{BranchProfile, ColdStart, GuestImage, TraceCache};

/// Why a trace could not be translated. Decoding itself never fails; these
/// are translation-time limits and internal misuse.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslateError {
    /// A decodable instruction with no lowering yet.
    #[error("no lowering for {0}")]
    Unimplemented(&'static str),
    /// fs-relative addressing is not supported by the memory model.
    #[error("fs segment override is not supported")]
    FsSegment,
    /// An immediate showed up as a store destination.
    #[error("store to an immediate operand")]
    StoreToImmediate,
    /// The worklists referenced a translation point with no block.
    #[error("branch resolution referenced an unknown translation point {pc:#x}")]
    ResolutionInconsistency { pc: u32 },
}
