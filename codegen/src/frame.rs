//! Per-function call-frame layout and prologue/epilogue synthesis.
//!
//! Offsets grow upward from the frame pointer:
//!
//! ```text
//!   FP+0   old frame pointer        <- FP (x29) points here
//!   FP+8   return address
//!   FP+16  upper canary             (only with canaries enabled)
//!   FP+24  lower canary             (only with canaries enabled)
//!   ...    locals, in declaration order
//!   ...    spill slots, 8 bytes each
//!   ...    callee-saved register save area
//!   SP = FP + frame_size            (frame_size is 16-byte aligned)
//! ```
//!
//! Once the prologue is generated the layout is locked: adding locals,
//! spill slots beyond the preallocated reserve, or callee-saved registers
//! is structural misuse.

use crate::ast::VarType;
use crate::error::{CodegenError, CodegenResult};
use crate::inst::emit::{
    add_imm, b_cond, cmp_reg, ldp, ldp_post, ldr_imm, load_constant, mov_sp, ret, stp, stp_pre,
    str_imm,
};
use crate::inst::regs::{fp_reg, link_reg, spilltmp_reg, stack_reg, tmp2_reg, xreg, Reg};
use crate::inst::{Cond, Instruction};
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};

const UPPER_CANARY_VALUE: u64 = 0x1122334455667788;
const LOWER_CANARY_VALUE: u64 = 0xAABBCCDDEEFF0011;
const CANARY_SIZE: i64 = 8;

/// Label of the runtime's canary-failure handler; bound by the JIT loader
/// like any other runtime symbol.
pub const CANARY_FAIL_LABEL: &str = "__canary_fail";

/// The interface through which the register allocator obtains spill slots,
/// breaking the frame/allocator dependency cycle. Instructions that use the
/// returned offsets are emitted by the caller.
pub trait FrameSlotAllocator {
    /// The FP-relative offset of the spill slot for `name`, allocating one
    /// if this is the first request. Offsets are stable for the lifetime of
    /// the function and slots are never reused.
    fn spill_offset(&mut self, name: &str) -> CodegenResult<i64>;
}

#[derive(Clone, Debug)]
struct LocalVar {
    name: String,
    size: usize,
}

/// Builds one function's frame.
pub struct CallFrameManager {
    function_name: String,
    enable_canaries: bool,
    debug_enabled: bool,

    locals: Vec<LocalVar>,
    variable_offsets: FxHashMap<String, i64>,
    float_variables: FxHashSet<String>,

    /// Allocation cursor: the next free FP-relative offset.
    cursor: i64,
    spill_offsets: FxHashMap<String, i64>,
    spills_started: bool,
    /// Spill slots preallocated for post-prologue demand.
    reserved_spill_slots: usize,

    callee_saved: Vec<Reg>,
    prologue_generated: bool,
    final_frame_size: i64,
    x29_spill_slot_offset: i64,
}

impl CallFrameManager {
    pub fn new(function_name: &str, enable_canaries: bool, debug_enabled: bool) -> CallFrameManager {
        // Locals start after the FP/LR pair, and after the canaries when
        // those are enabled.
        let cursor = 16 + if enable_canaries { 2 * CANARY_SIZE } else { 0 };
        if debug_enabled {
            debug!("call frame layout for function: {function_name}");
        }
        CallFrameManager {
            function_name: function_name.to_string(),
            enable_canaries,
            debug_enabled,
            locals: Vec::new(),
            variable_offsets: FxHashMap::default(),
            float_variables: FxHashSet::default(),
            cursor,
            spill_offsets: FxHashMap::default(),
            spills_started: false,
            reserved_spill_slots: 0,
            callee_saved: Vec::new(),
            prologue_generated: false,
            final_frame_size: 0,
            x29_spill_slot_offset: 0,
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Declare a local variable. Must happen before the prologue and before
    /// any spill slot is handed out; the offset is final immediately.
    pub fn add_local(&mut self, name: &str, size_in_bytes: usize) -> CodegenResult<()> {
        if self.prologue_generated {
            return Err(CodegenError::LocalAfterPrologue(name.to_string()));
        }
        if self.spills_started {
            return Err(CodegenError::LocalAfterSpill(name.to_string()));
        }
        if size_in_bytes == 0 || size_in_bytes % 8 != 0 {
            return Err(CodegenError::UnalignedLocalSize(size_in_bytes));
        }
        self.locals.push(LocalVar {
            name: name.to_string(),
            size: size_in_bytes,
        });
        self.variable_offsets.insert(name.to_string(), self.cursor);
        if self.debug_enabled {
            debug!("  local '{name}' at FP+{}", self.cursor);
        }
        self.cursor += size_in_bytes as i64;
        Ok(())
    }

    /// Parameters are homed as 8-byte locals.
    pub fn add_parameter(&mut self, name: &str) -> CodegenResult<()> {
        self.add_local(name, 8)
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.variable_offsets.contains_key(name)
    }

    /// The FP-relative offset of a declared local. Stable under repeated
    /// queries.
    pub fn get_offset(&self, name: &str) -> CodegenResult<i64> {
        self.variable_offsets
            .get(name)
            .copied()
            .ok_or_else(|| CodegenError::UnknownLocal(name.to_string()))
    }

    pub fn local_variable_names(&self) -> Vec<String> {
        self.locals.iter().map(|local| local.name.clone()).collect()
    }

    pub fn set_variable_type(&mut self, name: &str, var_type: VarType) {
        if var_type == VarType::Float {
            self.float_variables.insert(name.to_string());
        } else {
            self.float_variables.remove(name);
        }
    }

    pub fn mark_variable_as_float(&mut self, name: &str) {
        self.set_variable_type(name, VarType::Float);
    }

    pub fn is_float_variable(&self, name: &str) -> bool {
        self.float_variables.contains(name)
    }

    /// Reserve spill slots ahead of the prologue so spill requests that
    /// arrive after the frame is locked can still be honored.
    pub fn preallocate_spill_slots(&mut self, count: usize) -> CodegenResult<()> {
        if self.prologue_generated {
            return Err(CodegenError::SaveAfterPrologue);
        }
        self.reserved_spill_slots += count;
        if self.debug_enabled {
            debug!("  preallocated {count} spill slots ({} bytes)", count * 8);
        }
        Ok(())
    }

    /// Mark a callee-saved register for save/restore regardless of what the
    /// allocator decides.
    pub fn force_save_register(&mut self, reg: Reg) -> CodegenResult<()> {
        if self.prologue_generated {
            return Err(CodegenError::SaveAfterPrologue);
        }
        if !self.callee_saved.contains(&reg) {
            self.callee_saved.push(reg);
            if self.debug_enabled {
                debug!("  will save {}", reg.show());
            }
        }
        Ok(())
    }

    /// Functions that make calls preserve x19/x20 for the caller chain.
    pub fn force_save_x19_x20(&mut self) -> CodegenResult<()> {
        self.force_save_register(xreg(19))?;
        self.force_save_register(xreg(20))
    }

    /// Mark x21..x21+pressure-1 (capped at x28) for save/restore, based on
    /// the allocator's variable-pool usage prediction. Pressure beyond the
    /// pool is the allocator's problem: it will spill.
    pub fn reserve_registers_based_on_pressure(&mut self, pressure: usize) -> CodegenResult<()> {
        if self.prologue_generated {
            return Err(CodegenError::SaveAfterPrologue);
        }
        const START_REG: usize = 21;
        const END_REG: usize = 28;
        for i in 0..pressure {
            let num = START_REG + i;
            if num > END_REG {
                warn!(
                    "register pressure {pressure} exceeds the callee-saved pool (x21..x28) in '{}'",
                    self.function_name
                );
                break;
            }
            self.force_save_register(xreg(num as u8))?;
        }
        Ok(())
    }

    /// Dedicated spill-slot offset for x29. With the STP-based prologue the
    /// old frame pointer always lands at FP+0.
    pub fn x29_spill_slot_offset(&self) -> i64 {
        self.x29_spill_slot_offset
    }

    /// Final frame size; zero until the prologue is generated.
    pub fn frame_size(&self) -> i64 {
        self.final_frame_size
    }

    fn align_to_16(size: i64) -> i64 {
        (size + 15) & !15
    }

    /// Synthesize the prologue and lock the layout. Must be called exactly
    /// once per function.
    pub fn generate_prologue(&mut self) -> CodegenResult<Vec<Instruction>> {
        if self.prologue_generated {
            return Err(CodegenError::PrologueTwice(self.function_name.clone()));
        }

        let callee_base = self.cursor + (self.reserved_spill_slots as i64) * 8;
        for (i, reg) in self.callee_saved.iter().enumerate() {
            self.variable_offsets
                .insert(reg.show().to_uppercase(), callee_base + (i as i64) * 8);
        }
        let frame_size =
            Self::align_to_16(callee_base + (self.callee_saved.len() as i64) * 8);
        self.final_frame_size = frame_size;

        let mut insts: Vec<Instruction> = Vec::new();

        // Allocate the frame and save FP/LR. The pre-index STP form only
        // reaches -512, so large frames split the SP adjustment out.
        if frame_size <= 504 {
            insts.push(stp_pre(fp_reg(), link_reg(), stack_reg(), -frame_size)?);
        } else {
            insts.push(sub_sp(frame_size)?);
            insts.push(stp(fp_reg(), link_reg(), stack_reg(), 0)?);
        }
        insts.push(mov_sp(fp_reg(), stack_reg()));

        for reg in &self.callee_saved {
            let offset = self.variable_offsets[&reg.show().to_uppercase()];
            insts.push(str_imm(*reg, fp_reg(), offset)?);
        }

        if self.enable_canaries {
            insts.extend(load_constant(spilltmp_reg(), UPPER_CANARY_VALUE, ""));
            insts.push(str_imm(spilltmp_reg(), fp_reg(), 16)?);
            insts.extend(load_constant(spilltmp_reg(), LOWER_CANARY_VALUE, ""));
            insts.push(str_imm(spilltmp_reg(), fp_reg(), 16 + CANARY_SIZE)?);
        }

        self.prologue_generated = true;
        if self.debug_enabled {
            debug!("{}", self.display_frame_layout());
        }
        Ok(insts)
    }

    /// Synthesize the epilogue: canary verification, callee-saved restores
    /// in reverse order, FP/LR restore, return.
    pub fn generate_epilogue(&mut self) -> CodegenResult<Vec<Instruction>> {
        if !self.prologue_generated {
            return Err(CodegenError::EpilogueBeforePrologue(
                self.function_name.clone(),
            ));
        }
        let frame_size = self.final_frame_size;
        let mut insts: Vec<Instruction> = Vec::new();

        if self.enable_canaries {
            for (offset, value) in [
                (16, UPPER_CANARY_VALUE),
                (16 + CANARY_SIZE, LOWER_CANARY_VALUE),
            ] {
                insts.extend(load_constant(spilltmp_reg(), value, ""));
                insts.push(ldr_imm(tmp2_reg(), fp_reg(), offset)?);
                insts.push(cmp_reg(tmp2_reg(), spilltmp_reg()));
                insts.push(b_cond(Cond::Ne, CANARY_FAIL_LABEL));
            }
        }

        for reg in self.callee_saved.iter().rev() {
            let offset = self.variable_offsets[&reg.show().to_uppercase()];
            insts.push(ldr_imm(*reg, fp_reg(), offset)?);
        }

        if frame_size <= 504 {
            insts.push(ldp_post(fp_reg(), link_reg(), stack_reg(), frame_size)?);
        } else {
            insts.push(ldp(fp_reg(), link_reg(), stack_reg(), 0)?);
            insts.push(add_imm(stack_reg(), stack_reg(), frame_size)?);
        }
        insts.push(ret());
        Ok(insts)
    }

    /// A human-readable view of the frame, sorted by offset.
    pub fn display_frame_layout(&self) -> String {
        use core::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "--- call frame layout for function: {} (total size: {} bytes) ---",
            self.function_name, self.final_frame_size
        );
        let _ = writeln!(out, "{:<9}| {:<38}| type", "offset", "content");
        let _ = writeln!(out, "------------------------------------------------------");
        let _ = writeln!(out, "{:<9}| old frame pointer (x29)     <-- FP", "+0");
        let _ = writeln!(out, "{:<9}| return address (caller's pc)", "+8");
        if self.enable_canaries {
            let _ = writeln!(out, "{:<9}| upper stack canary (0x{UPPER_CANARY_VALUE:x})", "+16");
            let _ = writeln!(
                out,
                "{:<9}| lower stack canary (0x{LOWER_CANARY_VALUE:x})",
                format!("+{}", 16 + CANARY_SIZE)
            );
        }

        let mut items: Vec<(i64, String, &str)> = Vec::new();
        for local in &self.locals {
            items.push((
                self.variable_offsets[&local.name],
                format!("local: {}", local.name),
                if self.is_float_variable(&local.name) { "float" } else { "int" },
            ));
        }
        for (name, offset) in &self.spill_offsets {
            items.push((
                *offset,
                format!("spill slot: {name}"),
                if self.is_float_variable(name) { "float" } else { "int" },
            ));
        }
        for reg in &self.callee_saved {
            let key = reg.show().to_uppercase();
            if let Some(offset) = self.variable_offsets.get(&key) {
                items.push((
                    *offset,
                    format!("saved reg: {key}"),
                    if reg.is_float() { "float" } else { "int" },
                ));
            }
        }
        items.sort_by_key(|(offset, _, _)| *offset);
        for (offset, description, ty) in items {
            let _ = writeln!(out, "{:<9}| {description:<38}| {ty}", format!("+{offset}"));
        }
        let _ = writeln!(out, "------------------------------------------------------");
        let _ = writeln!(
            out,
            "                                     <-- SP (+{} from FP)",
            self.final_frame_size
        );
        out
    }
}

fn sub_sp(amount: i64) -> CodegenResult<Instruction> {
    use crate::inst::emit::sub_imm;
    sub_imm(stack_reg(), stack_reg(), amount)
}

impl FrameSlotAllocator for CallFrameManager {
    fn spill_offset(&mut self, name: &str) -> CodegenResult<i64> {
        if let Some(offset) = self.spill_offsets.get(name) {
            return Ok(*offset);
        }
        if self.prologue_generated {
            // Post-prologue demand is served from the preallocated reserve.
            if self.reserved_spill_slots == 0 {
                return Err(CodegenError::SpillAreaExhausted(name.to_string()));
            }
            self.reserved_spill_slots -= 1;
        }
        self.spills_started = true;
        let offset = self.cursor;
        self.cursor += 8;
        self.spill_offsets.insert(name.to_string(), offset);
        if self.debug_enabled {
            debug!("  spill slot '{name}' at FP+{offset}");
        }
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_locals_with_canaries() {
        let mut frame = CallFrameManager::new("F", true, false);
        frame.add_local("a", 8).unwrap();
        frame.add_local("b", 8).unwrap();
        assert_eq!(frame.get_offset("a").unwrap(), 32);
        assert_eq!(frame.get_offset("b").unwrap(), 40);
        frame.generate_prologue().unwrap();
        assert_eq!(frame.frame_size(), 48);
    }

    #[test]
    fn frame_size_is_16_byte_aligned() {
        let mut frame = CallFrameManager::new("F", false, false);
        frame.add_local("a", 8).unwrap();
        frame.generate_prologue().unwrap();
        // 16 bytes of FP/LR + 8 bytes of local, rounded up.
        assert_eq!(frame.frame_size(), 32);
        assert_eq!(frame.frame_size() % 16, 0);
    }

    #[test]
    fn offsets_are_stable() {
        let mut frame = CallFrameManager::new("F", false, false);
        frame.add_local("v", 16).unwrap();
        let first = frame.get_offset("v").unwrap();
        assert_eq!(first, frame.get_offset("v").unwrap());
        let spill = frame.spill_offset("t1").unwrap();
        assert_eq!(spill, frame.spill_offset("t1").unwrap());
        assert_eq!(frame.spill_offset("t2").unwrap(), spill + 8);
    }

    #[test]
    fn locals_locked_after_prologue() {
        let mut frame = CallFrameManager::new("F", false, false);
        frame.add_local("a", 8).unwrap();
        frame.generate_prologue().unwrap();
        assert!(matches!(
            frame.add_local("b", 8),
            Err(CodegenError::LocalAfterPrologue(_))
        ));
        assert!(matches!(
            frame.force_save_register(xreg(21)),
            Err(CodegenError::SaveAfterPrologue)
        ));
        assert!(matches!(
            frame.generate_prologue(),
            Err(CodegenError::PrologueTwice(_))
        ));
    }

    #[test]
    fn locals_locked_after_spill() {
        let mut frame = CallFrameManager::new("F", false, false);
        frame.add_local("a", 8).unwrap();
        frame.spill_offset("t0").unwrap();
        assert!(matches!(
            frame.add_local("b", 8),
            Err(CodegenError::LocalAfterSpill(_))
        ));
    }

    #[test]
    fn unaligned_local_rejected() {
        let mut frame = CallFrameManager::new("F", false, false);
        assert!(matches!(
            frame.add_local("a", 4),
            Err(CodegenError::UnalignedLocalSize(4))
        ));
    }

    #[test]
    fn spill_reserve_serves_post_prologue_demand() {
        let mut frame = CallFrameManager::new("F", false, false);
        frame.add_local("a", 8).unwrap();
        frame.preallocate_spill_slots(2).unwrap();
        frame.generate_prologue().unwrap();
        let s0 = frame.spill_offset("t0").unwrap();
        let s1 = frame.spill_offset("t1").unwrap();
        assert_eq!(s1, s0 + 8);
        assert!(matches!(
            frame.spill_offset("t2"),
            Err(CodegenError::SpillAreaExhausted(_))
        ));
        // Known slots remain queryable.
        assert_eq!(frame.spill_offset("t0").unwrap(), s0);
    }

    #[test]
    fn prologue_and_epilogue_mirror() {
        let mut frame = CallFrameManager::new("F", false, false);
        frame.add_local("a", 8).unwrap();
        frame.reserve_registers_based_on_pressure(2).unwrap();
        let prologue = frame.generate_prologue().unwrap();
        let epilogue = frame.generate_epilogue().unwrap();

        assert_eq!(prologue[0].assembly_text, "stp x29, x30, [sp, #-48]!");
        assert_eq!(prologue[1].assembly_text, "mov x29, sp");
        let stores: Vec<_> = prologue[2..]
            .iter()
            .map(|inst| inst.assembly_text.clone())
            .collect();
        assert_eq!(stores, vec!["str x21, [x29, #24]", "str x22, [x29, #32]"]);

        let restores: Vec<_> = epilogue
            .iter()
            .map(|inst| inst.assembly_text.clone())
            .collect();
        assert_eq!(
            restores,
            vec![
                "ldr x22, [x29, #32]",
                "ldr x21, [x29, #24]",
                "ldp x29, x30, [sp], #48",
                "ret",
            ]
        );
    }

    #[test]
    fn canaries_planted_and_checked() {
        let mut frame = CallFrameManager::new("F", true, false);
        let prologue = frame.generate_prologue().unwrap();
        // Two canary stores at FP+16 and FP+24.
        assert!(prologue
            .iter()
            .any(|inst| inst.assembly_text == "str x16, [x29, #16]"));
        assert!(prologue
            .iter()
            .any(|inst| inst.assembly_text == "str x16, [x29, #24]"));

        let epilogue = frame.generate_epilogue().unwrap();
        let branch_count = epilogue
            .iter()
            .filter(|inst| inst.target_label.as_deref() == Some(CANARY_FAIL_LABEL))
            .count();
        assert_eq!(branch_count, 2);
    }

    #[test]
    fn pressure_reservation_caps_at_x28() {
        let mut frame = CallFrameManager::new("F", false, false);
        frame.reserve_registers_based_on_pressure(12).unwrap();
        let prologue = frame.generate_prologue().unwrap();
        // x21..x28 inclusive, no further.
        let saves = prologue
            .iter()
            .filter(|inst| inst.assembly_text.starts_with("str x2"))
            .count();
        assert_eq!(saves, 8);
    }
}
