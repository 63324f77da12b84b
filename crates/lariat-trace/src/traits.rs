//! Collaborator interfaces the trace builder is generic over.

use lariat_x86::InstFetch;

/// The guest address space a trace is compiled against: instruction bytes
/// plus the per-process segment layout.
pub trait GuestImage: InstFetch {
    /// Linear base of the gs segment for this process. gs is the only
    /// nonzero-base segment supported; fs-relative addressing is rejected at
    /// translation time.
    fn gs_base(&self) -> u32 {
        0
    }
}

/// Observed targets of dynamic branches, fed back from earlier executions.
pub trait BranchProfile {
    /// Known targets of the dynamic branch at `pc`, most likely first.
    fn targets(&self, pc: u32) -> Vec<u32>;
}

/// The code cache: traces are not grown into regions that already have a
/// compiled entry point.
pub trait TraceCache {
    fn contains(&self, pc: u32) -> bool;
}

/// An empty profile and cache, for cold-start translation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ColdStart;

impl BranchProfile for ColdStart {
    fn targets(&self, _pc: u32) -> Vec<u32> {
        Vec::new()
    }
}

impl TraceCache for ColdStart {
    fn contains(&self, _pc: u32) -> bool {
        false
    }
}
