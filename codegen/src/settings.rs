//! Shared code generation settings.
//!
//! A `Flags` value is constructed once by the driver (from the command
//! line) and passed down explicitly; the core keeps no global state.

/// Code generation flags.
#[derive(Clone, Debug)]
pub struct Flags {
    /// Plant canary words between the return address and the locals and
    /// verify them in the epilogue.
    pub enable_stack_canaries: bool,
    /// Log every peephole rewrite (before/after) at `log::trace!` level.
    pub trace_peephole: bool,
    /// Log liveness dataflow iterations at `log::trace!` level.
    pub trace_liveness: bool,
    /// Upper bound on full peephole passes over a stream.
    pub max_peephole_passes: usize,
    /// Log the frame layout of each function as it is finalized.
    pub debug_frame_layout: bool,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            enable_stack_canaries: false,
            trace_peephole: false,
            trace_liveness: false,
            max_peephole_passes: 5,
            debug_frame_layout: false,
        }
    }
}
