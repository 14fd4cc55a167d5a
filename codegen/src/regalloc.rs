//! Variable-to-register binding with LRU eviction and spill codegen.
//!
//! The manager guarantees that every live variable is either in a register
//! or in its canonical spill slot. Spill and reload instructions are
//! returned to the caller for emission; the frame manager is only consulted
//! for offsets, through [`FrameSlotAllocator`].

use crate::ast::VarType;
use crate::error::{CodegenError, CodegenResult};
use crate::frame::FrameSlotAllocator;
use crate::inst::emit::{ldr_imm, str_imm};
use crate::inst::regs::{
    data_base_reg, fp_reg, Reg, FP_SCRATCH_REGS, FP_VARIABLE_REGS, SCRATCH_REGS, VARIABLE_REGS,
};
use crate::inst::Instruction;
use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// What a register is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegStatus {
    Free,
    InUseVariable,
    InUseScratch,
    InUseDataBase,
}

#[derive(Clone, Debug)]
struct RegState {
    status: RegStatus,
    bound_to: Option<String>,
    dirty: bool,
}

impl RegState {
    fn free() -> RegState {
        RegState {
            status: RegStatus::Free,
            bound_to: None,
            dirty: false,
        }
    }
}

/// Spill/reload instructions produced by an acquire.
pub type TransferSeq = SmallVec<[Instruction; 2]>;

/// The per-function register manager. `reset` must be called between
/// functions.
pub struct RegisterManager {
    states: FxHashMap<Reg, RegState>,
    variable_to_reg: FxHashMap<String, Reg>,
    /// LRU order for the integer variable pool, least recent first.
    lru: Vec<Reg>,
    /// LRU order for the float variable pool, least recent first.
    fp_lru: Vec<Reg>,
    spilled_variables: FxHashSet<String>,
}

impl Default for RegisterManager {
    fn default() -> RegisterManager {
        RegisterManager::new()
    }
}

impl RegisterManager {
    pub fn new() -> RegisterManager {
        let mut manager = RegisterManager {
            states: FxHashMap::default(),
            variable_to_reg: FxHashMap::default(),
            lru: Vec::new(),
            fp_lru: Vec::new(),
            spilled_variables: FxHashSet::default(),
        };
        manager.reset();
        manager
    }

    /// Clear all bindings and re-reserve the data-base register.
    pub fn reset(&mut self) {
        self.states.clear();
        self.variable_to_reg.clear();
        self.lru.clear();
        self.fp_lru.clear();
        self.spilled_variables.clear();

        for reg in VARIABLE_REGS
            .iter()
            .chain(SCRATCH_REGS.iter())
            .chain(FP_VARIABLE_REGS.iter())
            .chain(FP_SCRATCH_REGS.iter())
        {
            self.states.insert(*reg, RegState::free());
        }
        self.states.insert(
            data_base_reg(),
            RegState {
                status: RegStatus::InUseDataBase,
                bound_to: Some("data_base".to_string()),
                dirty: false,
            },
        );
    }

    fn state(&self, reg: Reg) -> &RegState {
        self.states.get(&reg).expect("register is managed")
    }

    fn state_mut(&mut self, reg: Reg) -> &mut RegState {
        self.states.get_mut(&reg).expect("register is managed")
    }

    /// The register currently bound to `name`, if any.
    pub fn bound_register(&self, name: &str) -> Option<Reg> {
        self.variable_to_reg.get(name).copied()
    }

    pub fn is_variable_spilled(&self, name: &str) -> bool {
        self.spilled_variables.contains(name)
    }

    pub fn is_scratch_register(&self, reg: Reg) -> bool {
        SCRATCH_REGS.contains(&reg) || FP_SCRATCH_REGS.contains(&reg)
    }

    pub fn is_fp_register(&self, reg: Reg) -> bool {
        FP_VARIABLE_REGS.contains(&reg) || FP_SCRATCH_REGS.contains(&reg)
    }

    pub fn is_dirty(&self, reg: Reg) -> bool {
        self.state(reg).dirty
    }

    /// Every store into a variable's register must be recorded here so a
    /// later eviction spills the up-to-date value.
    pub fn mark_dirty(&mut self, reg: Reg) {
        self.state_mut(reg).dirty = true;
    }

    fn lru_for(&mut self, float: bool) -> &mut Vec<Reg> {
        if float {
            &mut self.fp_lru
        } else {
            &mut self.lru
        }
    }

    fn touch(&mut self, reg: Reg, float: bool) {
        let lru = self.lru_for(float);
        lru.retain(|&r| r != reg);
        lru.push(reg);
    }

    /// Bind `name` to a register of the appropriate class, reloading from
    /// its spill slot when it was previously spilled. Returns the register
    /// and any spill/reload instructions the caller must emit first.
    pub fn acquire_variable_reg(
        &mut self,
        name: &str,
        var_type: VarType,
        frame: &mut dyn FrameSlotAllocator,
    ) -> CodegenResult<(Reg, TransferSeq)> {
        let float = var_type == VarType::Float;
        let mut insts: TransferSeq = SmallVec::new();

        if let Some(reg) = self.variable_to_reg.get(name).copied() {
            self.touch(reg, float);
            return Ok((reg, insts));
        }

        let pool: &[Reg] = if float { &FP_VARIABLE_REGS } else { &VARIABLE_REGS };
        let reg = match pool.iter().find(|reg| self.state(**reg).status == RegStatus::Free) {
            Some(reg) => *reg,
            None => {
                // Evict the least-recently-used binding. A pinned
                // (scratch-held) register is never a victim.
                let order: Vec<Reg> = if float { self.fp_lru.clone() } else { self.lru.clone() };
                let victim = order
                    .into_iter()
                    .find(|&reg| matches!(self.state(reg).status, RegStatus::InUseVariable))
                    .ok_or_else(|| CodegenError::RegisterPoolExhausted(name.to_string()))?;
                if let Some(inst) = self.evict(victim, frame)? {
                    insts.push(inst);
                }
                victim
            }
        };

        self.variable_to_reg.insert(name.to_string(), reg);
        *self.state_mut(reg) = RegState {
            status: RegStatus::InUseVariable,
            bound_to: Some(name.to_string()),
            dirty: false,
        };
        self.touch(reg, float);

        if self.spilled_variables.remove(name) {
            let offset = frame.spill_offset(name)?;
            insts.push(ldr_imm(reg, fp_reg(), offset)?);
            trace!("reloading '{name}' into {} from FP+{offset}", reg.show());
        }
        Ok((reg, insts))
    }

    fn evict(
        &mut self,
        reg: Reg,
        frame: &mut dyn FrameSlotAllocator,
    ) -> CodegenResult<Option<Instruction>> {
        let (name, dirty) = {
            let state = self.state(reg);
            (
                state.bound_to.clone().ok_or_else(|| {
                    CodegenError::UnboundRegister(reg.show())
                })?,
                state.dirty,
            )
        };
        let spill = if dirty {
            let offset = frame.spill_offset(&name)?;
            trace!("evicting '{name}' from {}, spilling to FP+{offset}", reg.show());
            Some(str_imm(reg, fp_reg(), offset)?)
        } else {
            trace!("evicting '{name}' from {} (clean)", reg.show());
            None
        };
        self.spilled_variables.insert(name.clone());
        self.variable_to_reg.remove(&name);
        *self.state_mut(reg) = RegState::free();
        self.lru.retain(|&r| r != reg);
        self.fp_lru.retain(|&r| r != reg);
        Ok(spill)
    }

    /// A caller-saved integer register for expression temporaries; released
    /// at the end of the expression.
    pub fn acquire_scratch_reg(&mut self) -> CodegenResult<Reg> {
        self.acquire_scratch_from(&SCRATCH_REGS)
    }

    /// A caller-saved float register for expression temporaries.
    pub fn acquire_fp_scratch_reg(&mut self) -> CodegenResult<Reg> {
        self.acquire_scratch_from(&FP_SCRATCH_REGS)
    }

    fn acquire_scratch_from(&mut self, pool: &[Reg]) -> CodegenResult<Reg> {
        let reg = pool
            .iter()
            .copied()
            .find(|&reg| self.state(reg).status == RegStatus::Free)
            .ok_or_else(|| CodegenError::RegisterPoolExhausted("<scratch>".to_string()))?;
        self.state_mut(reg).status = RegStatus::InUseScratch;
        Ok(reg)
    }

    /// Release a register. A dirty register still bound to a variable is
    /// spilled first; the store (if any) is returned for the caller to
    /// emit.
    pub fn release_register(
        &mut self,
        reg: Reg,
        frame: &mut dyn FrameSlotAllocator,
    ) -> CodegenResult<Option<Instruction>> {
        let state = self.state(reg).clone();
        match state.status {
            RegStatus::InUseDataBase => Ok(None),
            RegStatus::InUseVariable if state.dirty => {
                let spill = self.evict(reg, frame)?;
                Ok(spill)
            }
            _ => {
                if let Some(name) = state.bound_to {
                    self.variable_to_reg.remove(&name);
                }
                *self.state_mut(reg) = RegState::free();
                self.lru.retain(|&r| r != reg);
                self.fp_lru.retain(|&r| r != reg);
                Ok(None)
            }
        }
    }

    /// Before any `BL`: caller-saved registers lose their contents, so
    /// every binding in a caller-saved register spills (if dirty) or drops.
    pub fn invalidate_caller_saved(
        &mut self,
        frame: &mut dyn FrameSlotAllocator,
    ) -> CodegenResult<Vec<Instruction>> {
        let mut insts = Vec::new();
        for reg in SCRATCH_REGS.iter().chain(FP_SCRATCH_REGS.iter()).copied() {
            match self.state(reg).status {
                RegStatus::InUseVariable => {
                    if let Some(inst) = self.evict(reg, frame)? {
                        insts.push(inst);
                    }
                }
                RegStatus::InUseScratch => {
                    *self.state_mut(reg) = RegState::free();
                }
                _ => {}
            }
        }
        Ok(insts)
    }

    /// The spill store for `reg` holding `name`: a real store when the
    /// register is dirty, a commented no-op when it is clean.
    pub fn generate_spill_code(
        &self,
        reg: Reg,
        name: &str,
        frame: &mut dyn FrameSlotAllocator,
    ) -> CodegenResult<Instruction> {
        if !self.is_dirty(reg) {
            return Ok(Instruction::comment(format!(
                "skipping spill for clean register {} ({name})",
                reg.show()
            )));
        }
        let offset = frame.spill_offset(name)?;
        str_imm(reg, fp_reg(), offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CallFrameManager;
    use crate::inst::regs::{dreg, xreg};

    fn frame() -> CallFrameManager {
        CallFrameManager::new("F", false, false)
    }

    #[test]
    fn binds_from_the_variable_pool() {
        let mut rm = RegisterManager::new();
        let mut cfm = frame();
        let (reg, insts) = rm
            .acquire_variable_reg("a", VarType::Integer, &mut cfm)
            .unwrap();
        assert_eq!(reg, xreg(21));
        assert!(insts.is_empty());

        // Re-acquire returns the same binding.
        let (again, insts) = rm
            .acquire_variable_reg("a", VarType::Integer, &mut cfm)
            .unwrap();
        assert_eq!(again, reg);
        assert!(insts.is_empty());
    }

    #[test]
    fn float_variables_use_the_float_pool() {
        let mut rm = RegisterManager::new();
        let mut cfm = frame();
        let (reg, _) = rm
            .acquire_variable_reg("f", VarType::Float, &mut cfm)
            .unwrap();
        assert_eq!(reg, dreg(8));
        assert!(rm.is_fp_register(reg));
    }

    #[test]
    fn lru_eviction_spills_dirty_victim() {
        let mut rm = RegisterManager::new();
        let mut cfm = frame();

        // Fill the integer pool.
        for i in 0..7 {
            let name = format!("v{i}");
            let (reg, _) = rm
                .acquire_variable_reg(&name, VarType::Integer, &mut cfm)
                .unwrap();
            rm.mark_dirty(reg);
        }

        // The next acquire evicts v0 (least recently used) and spills it.
        let (reg, insts) = rm
            .acquire_variable_reg("v7", VarType::Integer, &mut cfm)
            .unwrap();
        assert_eq!(reg, xreg(21));
        assert_eq!(insts.len(), 1);
        assert_eq!(insts[0].assembly_text, "str x21, [x29, #16]");
        assert!(rm.is_variable_spilled("v0"));

        // Touching v1 re-orders the LRU list; the next eviction takes v2.
        rm.acquire_variable_reg("v1", VarType::Integer, &mut cfm)
            .unwrap();
        let (reg, _) = rm
            .acquire_variable_reg("v8", VarType::Integer, &mut cfm)
            .unwrap();
        assert_eq!(reg, xreg(23));
    }

    #[test]
    fn spilled_variable_is_reloaded() {
        let mut rm = RegisterManager::new();
        let mut cfm = frame();

        for i in 0..8 {
            let name = format!("v{i}");
            let (reg, _) = rm
                .acquire_variable_reg(&name, VarType::Integer, &mut cfm)
                .unwrap();
            rm.mark_dirty(reg);
        }
        assert!(rm.is_variable_spilled("v0"));

        // v0 comes back from its slot, evicting another victim first.
        let (reg, insts) = rm
            .acquire_variable_reg("v0", VarType::Integer, &mut cfm)
            .unwrap();
        assert!(!rm.is_variable_spilled("v0"));
        let reload = insts.last().unwrap();
        assert_eq!(reload.assembly_text, format!("ldr {}, [x29, #16]", reg.show()));
    }

    #[test]
    fn scratch_registers_are_not_victims() {
        let mut rm = RegisterManager::new();
        let scratch = rm.acquire_scratch_reg().unwrap();
        assert_eq!(scratch, xreg(9));
        assert!(rm.is_scratch_register(scratch));
        let next = rm.acquire_scratch_reg().unwrap();
        assert_eq!(next, xreg(10));
    }

    #[test]
    fn invalidate_caller_saved_drops_and_spills() {
        let mut rm = RegisterManager::new();
        let mut cfm = frame();

        let scratch = rm.acquire_scratch_reg().unwrap();
        let insts = rm.invalidate_caller_saved(&mut cfm).unwrap();
        assert!(insts.is_empty());
        // The scratch register is free again.
        assert_eq!(rm.acquire_scratch_reg().unwrap(), scratch);
    }

    #[test]
    fn spill_code_for_clean_register_is_a_comment() {
        let mut rm = RegisterManager::new();
        let mut cfm = frame();
        let (reg, _) = rm
            .acquire_variable_reg("a", VarType::Integer, &mut cfm)
            .unwrap();

        let clean = rm.generate_spill_code(reg, "a", &mut cfm).unwrap();
        assert_eq!(clean.encoding, 0);
        assert!(clean.assembly_text.contains("skipping spill"));

        rm.mark_dirty(reg);
        let dirty = rm.generate_spill_code(reg, "a", &mut cfm).unwrap();
        assert_eq!(dirty.assembly_text, "str x21, [x29, #16]");
    }

    #[test]
    fn reset_clears_bindings_and_keeps_data_base() {
        let mut rm = RegisterManager::new();
        let mut cfm = frame();
        rm.acquire_variable_reg("a", VarType::Integer, &mut cfm)
            .unwrap();
        rm.reset();
        assert_eq!(rm.bound_register("a"), None);
        // x28 stays reserved for the data segment base.
        assert!(!rm.is_scratch_register(crate::inst::regs::data_base_reg()));
    }
}
