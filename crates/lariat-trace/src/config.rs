//! Trace-construction policy knobs.

/// Limits and modes for one trace compilation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceConfig {
    /// Maximum number of guest instructions translated into one trace.
    /// Branches past the budget become trace exits.
    pub max_instructions: usize,
    /// Translate exactly the entry instruction and exit, used for precise
    /// fault replay and debugging.
    pub single_instruction: bool,
}

impl TraceConfig {
    /// Budget ladder for the recompilation tiers: quick first-touch traces
    /// at level 0, larger regions as a pc proves hot.
    pub fn for_opt_level(level: u8) -> TraceConfig {
        let max_instructions = match level {
            0 => 16,
            1 => 64,
            _ => 256,
        };
        TraceConfig {
            max_instructions,
            single_instruction: false,
        }
    }

    pub fn single_instruction() -> TraceConfig {
        TraceConfig {
            max_instructions: 1,
            single_instruction: true,
        }
    }
}

impl Default for TraceConfig {
    fn default() -> TraceConfig {
        TraceConfig::for_opt_level(1)
    }
}
