//! Peephole optimization: a fixed-point pattern-rewrite engine over the
//! post-codegen instruction stream.
//!
//! Patterns are tagged records, not opaque callables, so the table can be
//! inspected, reordered, and exercised one kind at a time in tests. Every
//! decision a pattern makes reads the instructions' semantic fields;
//! `assembly_text` is never consulted.

mod patterns;

pub use patterns::PatternKind;

use crate::inst::{Instruction, JitAttr, OpType};
use crate::settings::Flags;
use crate::stream::InstructionStream;
use log::trace;
use rustc_hash::FxHashMap;

/// Outcome of a pattern match at a stream position. `length` is the number
/// of instructions the window actually covers (variable-length patterns
/// report their real extent).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    pub length: usize,
}

impl MatchResult {
    pub const NO: MatchResult = MatchResult {
        matched: false,
        length: 0,
    };

    pub fn hit(length: usize) -> MatchResult {
        MatchResult {
            matched: true,
            length,
        }
    }
}

/// A rewrite pattern: its kind (which carries the matching and transforming
/// logic), the maximum window it may inspect, and a stats/trace name.
#[derive(Clone, Copy, Debug)]
pub struct Pattern {
    pub kind: PatternKind,
    pub window: usize,
    pub description: &'static str,
}

/// Counters accumulated across passes.
#[derive(Clone, Debug, Default)]
pub struct PeepholeStats {
    pub passes: usize,
    pub optimizations_applied: usize,
    pub pattern_matches: FxHashMap<&'static str, usize>,
}

/// The rewrite engine.
pub struct PeepholeOptimizer {
    patterns: Vec<Pattern>,
    max_passes: usize,
    trace_enabled: bool,
    stats: PeepholeStats,
}

impl PeepholeOptimizer {
    pub fn new(flags: &Flags) -> PeepholeOptimizer {
        PeepholeOptimizer {
            patterns: PatternKind::default_table(),
            max_passes: flags.max_peephole_passes,
            trace_enabled: flags.trace_peephole,
            stats: PeepholeStats::default(),
        }
    }

    /// An optimizer running a caller-chosen pattern table (tests use this
    /// to exercise one kind at a time).
    pub fn with_patterns(flags: &Flags, patterns: Vec<Pattern>) -> PeepholeOptimizer {
        PeepholeOptimizer {
            patterns,
            max_passes: flags.max_peephole_passes,
            trace_enabled: flags.trace_peephole,
            stats: PeepholeStats::default(),
        }
    }

    pub fn stats(&self) -> &PeepholeStats {
        &self.stats
    }

    /// Run passes until a pass makes no change or `max_passes` is reached.
    /// A pass never grows the stream.
    pub fn optimize(&mut self, stream: &mut InstructionStream) {
        for _ in 0..self.max_passes {
            self.stats.passes += 1;
            let before = stream.len();
            let changed = self.apply_pass(stream);
            debug_assert!(stream.len() <= before);
            if !changed {
                break;
            }
        }
    }

    /// One left-to-right pass. After a rewrite the scan restarts at the
    /// same position so chained opportunities are caught within the pass.
    fn apply_pass(&mut self, stream: &mut InstructionStream) -> bool {
        let mut any_changes = false;
        let mut pos = 0;

        while pos < stream.len() {
            if is_special_instruction(&stream[pos]) {
                pos += 1;
                continue;
            }

            let mut applied = false;
            for pattern in &self.patterns {
                let result = pattern.kind.matches(stream.as_slice(), pos);
                if !result.matched {
                    continue;
                }
                debug_assert!(result.length >= 1);
                if window_is_fenced(stream.as_slice(), pos, result.length) {
                    continue;
                }
                let replacements = match pattern.kind.transform(stream.as_slice(), pos) {
                    Some(replacements) => replacements,
                    None => continue,
                };
                debug_assert!(replacements.len() <= result.length);
                if would_break_label_references(stream.as_slice(), pos, result.length, &replacements)
                {
                    continue;
                }

                if self.trace_enabled {
                    trace_rewrite(pattern.description, stream.as_slice(), pos, result.length, &replacements);
                }

                stream.replace(pos, result.length, replacements);
                self.stats.optimizations_applied += 1;
                *self
                    .stats
                    .pattern_matches
                    .entry(pattern.description)
                    .or_insert(0) += 1;
                any_changes = true;
                applied = true;
                break;
            }

            if !applied {
                pos += 1;
            }
        }
        any_changes
    }
}

/// Instructions the optimizer never touches: labels, data directives,
/// system instructions, calls and returns, and anything the JIT loader
/// patches in place.
pub fn is_special_instruction(inst: &Instruction) -> bool {
    if inst.is_label_definition || inst.is_data_value {
        return true;
    }
    if inst.jit_attr != JitAttr::None {
        return true;
    }
    matches!(
        inst.opcode,
        OpType::Svc
            | OpType::Brk
            | OpType::Dmb
            | OpType::Isb
            | OpType::Dsb
            | OpType::Msr
            | OpType::Mrs
            | OpType::Ret
            | OpType::Bl
            | OpType::Nop
            | OpType::Udf
            | OpType::Directive
    )
}

/// A window is rejected outright if any instruction inside it (beyond the
/// head, which the scan already vetted) is special. In particular a window
/// may not span a `BL`: a rewrite that starts before and ends after a call
/// would reorder around the call's side effects.
fn window_is_fenced(insts: &[Instruction], pos: usize, length: usize) -> bool {
    insts[pos + 1..(pos + length).min(insts.len())]
        .iter()
        .any(is_special_instruction)
}

/// A shrinking rewrite may not delete a label definition: something may
/// branch to it.
fn would_break_label_references(
    insts: &[Instruction],
    pos: usize,
    count: usize,
    replacements: &[Instruction],
) -> bool {
    if count > replacements.len() {
        insts[pos..pos + count]
            .iter()
            .any(|inst| inst.is_label_definition)
    } else {
        false
    }
}

fn trace_rewrite(
    description: &str,
    insts: &[Instruction],
    pos: usize,
    length: usize,
    replacements: &[Instruction],
) {
    trace!("[peephole] position {pos}: {description}");
    trace!("  before ({length} instructions):");
    for (i, inst) in insts[pos..pos + length].iter().enumerate() {
        trace!("    {}: {inst}", pos + i);
    }
    trace!("  after ({} instructions):", replacements.len());
    for (i, inst) in replacements.iter().enumerate() {
        trace!("    {}: {inst}", pos + i);
    }
}

#[cfg(test)]
mod tests;
