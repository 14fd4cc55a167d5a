//! The built-in rewrite patterns.
//!
//! Each pattern is a `PatternKind` variant; `matches` reports whether (and
//! how far) a window matches at a position, and `transform` builds the
//! replacement. `transform` may still decline (returning `None`) when the
//! matched shape has no legal rewrite, e.g. an immediate that cannot be
//! encoded; the driver then moves on without looping.

use super::{MatchResult, Pattern};
use crate::inst::emit::{
    add_imm, add_reg, add_reg_shifted, adr, and_imm, asr_imm, b_cond, can_encode_as_immediate,
    cbnz, cbz, cmp_imm, eor_imm, fmadd, fmsub, ldr_imm, ldr_scaled_reg, lsl_imm, mov_reg, movz,
    orr_imm, str_imm, str_scaled_reg, sub_imm, ubfx,
};
use crate::inst::imms::MoveWideConst;
use crate::inst::regs::{xreg, Reg};
use crate::inst::{same_reg, Cond, Instruction, OpType, Reloc, ShiftOp};

/// Which rewrite a pattern performs. The table in `default_table` decides
/// ordering; every kind is self-contained so tests can run one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// `MOV Xd, Xd` -> (nothing).
    RedundantMove,
    /// `MOVZ Xd, #a ; MOVZ/MOVK Xd, ...` constant-build simplification.
    ConstantFold,
    /// `MOVZ Xt, #2^k ; MUL Xd, Xn, Xt` -> `LSL Xd, Xn, #k`.
    MulByPowerOfTwo,
    /// `MOVZ Xt, #2^k ; SDIV Xd, Xn, Xt` -> `ASR Xd, Xn, #k`.
    DivByPowerOfTwo,
    /// `CMP Xn, #0 ; B.EQ/B.NE L` -> `CBZ/CBNZ Xn, L`.
    CompareZeroBranch,
    /// `CMP a,b ; CSET Xt,c ; CMP Xt,XZR ; B.EQ/B.NE L` -> `CMP a,b ; B.c' L`.
    BooleanCheckSimplification,
    /// `ADD Xd, Xn, #a ; ADD Xd, Xd, #b` -> `ADD Xd, Xn, #(a+b)`.
    FuseAluImmediates,
    /// `MOVZ Xt, #imm ; OP Xd, Xs, Xt` -> `OP Xd, Xs, #imm`.
    FuseMovAlu,
    /// `STR Xs, [Xn,#k] ; ... ; LDR Xd, [Xn,#k]` -> forward through `MOV`.
    LoadStoreForwarding,
    /// Store overwritten by a store to the same address with no
    /// intervening load: drop the first.
    DeadStore,
    /// `CMP` whose flags no consumer reads before the next flag-setter.
    RedundantCompare,
    /// `FMUL ; FADD/FSUB` -> `FMADD`/`FMSUB`.
    FusedMultiplyAddSub,
    /// `CSEL Xd, Xn, Xn, cond` -> `MOV Xd, Xn`.
    ConditionalSelect,
    /// `LSR Xd, Xn, #s ; AND Xd, Xd, #ones(w)` -> `UBFX Xd, Xn, #s, #w`.
    BitFieldExtract,
    /// Address-calculation reshaping into addressing modes.
    AddressGeneration,
    /// `ADRP Xd, sym ; ADD Xd, Xd, :lo12:sym` -> `ADR Xd, sym`.
    AdrpFusion,
}

impl PatternKind {
    /// The standard pattern table, in application order.
    pub fn default_table() -> Vec<Pattern> {
        use PatternKind::*;
        [
            (RedundantMove, 1, "redundant move elimination"),
            (ConstantFold, 2, "constant folding"),
            (MulByPowerOfTwo, 2, "multiply by power of two to shift"),
            (DivByPowerOfTwo, 2, "divide by power of two to shift"),
            (CompareZeroBranch, 2, "compare zero and branch fusion"),
            (BooleanCheckSimplification, 4, "boolean check simplification"),
            (FuseAluImmediates, 2, "fused consecutive add immediates"),
            (FuseMovAlu, 2, "fuse mov with alu operation"),
            (LoadStoreForwarding, 6, "load-store forwarding"),
            (DeadStore, 6, "dead store elimination"),
            (RedundantCompare, 1, "redundant compare elimination"),
            (FusedMultiplyAddSub, 2, "floating-point multiply-add fusion"),
            (ConditionalSelect, 1, "conditional select simplification"),
            (BitFieldExtract, 2, "bit field extraction"),
            (AddressGeneration, 2, "address generation"),
            (AdrpFusion, 2, "adrp/add to adr fusion"),
        ]
        .into_iter()
        .map(|(kind, window, description)| Pattern {
            kind,
            window,
            description,
        })
        .collect()
    }

    pub fn matches(self, insts: &[Instruction], pos: usize) -> MatchResult {
        match self {
            PatternKind::RedundantMove => match_redundant_move(insts, pos),
            PatternKind::ConstantFold => match_constant_fold(insts, pos),
            PatternKind::MulByPowerOfTwo => match_mul_pow2(insts, pos),
            PatternKind::DivByPowerOfTwo => match_div_pow2(insts, pos),
            PatternKind::CompareZeroBranch => match_cmp_zero_branch(insts, pos),
            PatternKind::BooleanCheckSimplification => match_boolean_check(insts, pos),
            PatternKind::FuseAluImmediates => match_fuse_alu_imm(insts, pos),
            PatternKind::FuseMovAlu => match_fuse_mov_alu(insts, pos),
            PatternKind::LoadStoreForwarding => match_load_store_forwarding(insts, pos),
            PatternKind::DeadStore => match_dead_store(insts, pos),
            PatternKind::RedundantCompare => match_redundant_compare(insts, pos),
            PatternKind::FusedMultiplyAddSub => match_fma(insts, pos),
            PatternKind::ConditionalSelect => match_conditional_select(insts, pos),
            PatternKind::BitFieldExtract => match_bitfield(insts, pos),
            PatternKind::AddressGeneration => match_address_generation(insts, pos),
            PatternKind::AdrpFusion => match_adrp_fusion(insts, pos),
        }
    }

    pub fn transform(self, insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
        match self {
            PatternKind::RedundantMove => Some(vec![]),
            PatternKind::ConstantFold => transform_constant_fold(insts, pos),
            PatternKind::MulByPowerOfTwo => transform_mul_pow2(insts, pos),
            PatternKind::DivByPowerOfTwo => transform_div_pow2(insts, pos),
            PatternKind::CompareZeroBranch => transform_cmp_zero_branch(insts, pos),
            PatternKind::BooleanCheckSimplification => transform_boolean_check(insts, pos),
            PatternKind::FuseAluImmediates => transform_fuse_alu_imm(insts, pos),
            PatternKind::FuseMovAlu => transform_fuse_mov_alu(insts, pos),
            PatternKind::LoadStoreForwarding => transform_load_store_forwarding(insts, pos),
            PatternKind::DeadStore => transform_dead_store(insts, pos),
            PatternKind::RedundantCompare => Some(vec![]),
            PatternKind::FusedMultiplyAddSub => transform_fma(insts, pos),
            PatternKind::ConditionalSelect => transform_conditional_select(insts, pos),
            PatternKind::BitFieldExtract => transform_bitfield(insts, pos),
            PatternKind::AddressGeneration => transform_address_generation(insts, pos),
            PatternKind::AdrpFusion => transform_adrp_fusion(insts, pos),
        }
    }
}

//=============================================================================
// Shared helpers

/// A plain constant load: a MOVZ (or immediate MOV) with no symbol
/// attached. Relocation-tagged chunks with a symbol are loader-patched and
/// must not be consumed by rewrites.
fn const_load(inst: &Instruction) -> Option<(Reg, i64)> {
    let is_plain_movz = inst.opcode == OpType::Movz && inst.target_label.is_none();
    let is_imm_mov =
        inst.opcode == OpType::Mov && inst.uses_immediate && inst.target_label.is_none();
    if is_plain_movz || is_imm_mov {
        Some((inst.dest?, inst.immediate))
    } else {
        None
    }
}

/// Conservative forward liveness: is the value in `reg` provably dead at
/// `start`? True when the register is redefined (or the function returns)
/// before any read, with the scan aborting at anything that could transfer
/// control or clobber unpredictably.
fn is_dead_after(insts: &[Instruction], start: usize, reg: Reg) -> bool {
    for inst in &insts[start.min(insts.len())..] {
        if inst.is_label_definition {
            return false; // another path may enter here and read it
        }
        if inst.opcode == OpType::Ret {
            return true;
        }
        if matches!(
            inst.opcode,
            OpType::B | OpType::BCond | OpType::Cbz | OpType::Cbnz | OpType::Br | OpType::Bl
        ) {
            // The value may be read at the target; give up.
            return false;
        }
        if inst.reads(reg) {
            return false;
        }
        if inst.defines(reg) {
            return true;
        }
    }
    true
}

fn power_of_two_exponent(value: i64) -> Option<u8> {
    if value >= 2 && (value & (value - 1)) == 0 {
        Some(value.trailing_zeros() as u8)
    } else {
        None
    }
}

/// The width of a mask consisting of w consecutive ones from bit zero.
fn low_ones_width(mask: i64) -> Option<u8> {
    if mask > 0 && (mask & mask.wrapping_add(1)) == 0 {
        Some(mask.count_ones() as u8)
    } else {
        None
    }
}

fn is_zero_reg(reg: Option<Reg>) -> bool {
    reg == Some(xreg(31))
}

//=============================================================================
// Individual patterns

fn match_redundant_move(insts: &[Instruction], pos: usize) -> MatchResult {
    let inst = &insts[pos];
    if inst.opcode == OpType::Mov
        && !inst.uses_immediate
        && same_reg(inst.dest, inst.src1)
    {
        MatchResult::hit(1)
    } else {
        MatchResult::NO
    }
}

fn match_constant_fold(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (first, second) = (&insts[pos], &insts[pos + 1]);
    if const_load(first).is_none() {
        return MatchResult::NO;
    }
    // Overwritten constant: the second MOVZ replaces all 64 bits.
    if second.opcode == OpType::Movz && same_reg(first.dest, second.dest) {
        return MatchResult::hit(2);
    }
    // MOVZ #0 + MOVK: the MOVK's chunk is the whole value.
    if first.immediate == 0
        && second.opcode == OpType::Movk
        && second.target_label.is_none()
        && same_reg(first.dest, second.dest)
    {
        return MatchResult::hit(2);
    }
    MatchResult::NO
}

fn transform_constant_fold(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let second = &insts[pos + 1];
    if second.opcode == OpType::Movz {
        return Some(vec![second.clone()]);
    }
    // MOVZ #0 ; MOVK #b, LSL s  ->  MOVZ #b, LSL s
    let mwc = MoveWideConst::maybe_from_u64(second.immediate as u64)?;
    let inst = movz(second.dest?, mwc.bits, mwc.shift * 16, Reloc::None, "").ok()?;
    Some(vec![inst])
}

fn match_mul_pow2(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (mov, mul) = (&insts[pos], &insts[pos + 1]);
    let (rt, value) = match const_load(mov) {
        Some(found) => found,
        None => return MatchResult::NO,
    };
    if power_of_two_exponent(value).is_none() || mul.opcode != OpType::Mul {
        return MatchResult::NO;
    }
    let uses_rt = same_reg(mul.src1, Some(rt)) || same_reg(mul.src2, Some(rt));
    if !uses_rt || same_reg(mul.dest, Some(rt)) {
        return MatchResult::NO;
    }
    // Both operands being the constant register would square it.
    if same_reg(mul.src1, Some(rt)) && same_reg(mul.src2, Some(rt)) {
        return MatchResult::NO;
    }
    if !is_dead_after(insts, pos + 2, rt) {
        return MatchResult::NO;
    }
    MatchResult::hit(2)
}

fn transform_mul_pow2(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let (mov, mul) = (&insts[pos], &insts[pos + 1]);
    let (rt, value) = const_load(mov)?;
    let shift = power_of_two_exponent(value)?;
    let other = if same_reg(mul.src1, Some(rt)) {
        mul.src2?
    } else {
        mul.src1?
    };
    Some(vec![lsl_imm(mul.dest?, other, shift).ok()?])
}

fn match_div_pow2(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (mov, div) = (&insts[pos], &insts[pos + 1]);
    let (rt, value) = match const_load(mov) {
        Some(found) => found,
        None => return MatchResult::NO,
    };
    if power_of_two_exponent(value).is_none() || div.opcode != OpType::Sdiv {
        return MatchResult::NO;
    }
    // The constant must be the divisor, and must not alias the dividend or
    // the destination.
    if !same_reg(div.src2, Some(rt))
        || same_reg(div.src1, Some(rt))
        || same_reg(div.dest, Some(rt))
    {
        return MatchResult::NO;
    }
    if !is_dead_after(insts, pos + 2, rt) {
        return MatchResult::NO;
    }
    MatchResult::hit(2)
}

fn transform_div_pow2(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let (mov, div) = (&insts[pos], &insts[pos + 1]);
    let (_, value) = const_load(mov)?;
    let shift = power_of_two_exponent(value)?;
    Some(vec![asr_imm(div.dest?, div.src1?, shift).ok()?])
}

fn match_cmp_zero_branch(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (cmp, branch) = (&insts[pos], &insts[pos + 1]);
    if cmp.opcode != OpType::Cmp {
        return MatchResult::NO;
    }
    let compares_zero = if cmp.uses_immediate {
        cmp.immediate == 0
    } else {
        is_zero_reg(cmp.src2)
    };
    if !compares_zero || branch.opcode != OpType::BCond {
        return MatchResult::NO;
    }
    // Only equality conditions fuse into CBZ/CBNZ.
    if !matches!(branch.cond, Some(Cond::Eq) | Some(Cond::Ne)) {
        return MatchResult::NO;
    }
    MatchResult::hit(2)
}

fn transform_cmp_zero_branch(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let (cmp, branch) = (&insts[pos], &insts[pos + 1]);
    let reg = cmp.src1?;
    let label = branch.target_label.as_deref()?;
    let inst = match branch.cond? {
        Cond::Eq => cbz(reg, label),
        Cond::Ne => cbnz(reg, label),
        _ => return None,
    };
    Some(vec![inst])
}

fn match_boolean_check(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 3 >= insts.len() {
        return MatchResult::NO;
    }
    let cmp = &insts[pos];
    let cset = &insts[pos + 1];
    let cmp_zero = &insts[pos + 2];
    let branch = &insts[pos + 3];

    if cmp.opcode != OpType::Cmp
        || cset.opcode != OpType::Cset
        || cmp_zero.opcode != OpType::Cmp
        || branch.opcode != OpType::BCond
    {
        return MatchResult::NO;
    }
    // The boolean must flow from the CSET into the second compare, which
    // must test against zero.
    if !same_reg(cset.dest, cmp_zero.src1) {
        return MatchResult::NO;
    }
    let tests_zero = if cmp_zero.uses_immediate {
        cmp_zero.immediate == 0
    } else {
        is_zero_reg(cmp_zero.src2)
    };
    if !tests_zero {
        return MatchResult::NO;
    }
    // Only EQ/NE on the boolean compose with the CSET condition.
    if !matches!(branch.cond, Some(Cond::Eq) | Some(Cond::Ne)) {
        return MatchResult::NO;
    }
    if cset.cond.is_none() {
        return MatchResult::NO;
    }
    // The boolean itself must not be needed afterwards.
    let bool_reg = match cset.dest {
        Some(reg) => reg,
        None => return MatchResult::NO,
    };
    if !is_dead_after(insts, pos + 4, bool_reg) {
        return MatchResult::NO;
    }
    MatchResult::hit(4)
}

fn transform_boolean_check(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let cmp = &insts[pos];
    let cset = &insts[pos + 1];
    let branch = &insts[pos + 3];

    // `B.NE L` on the 0/1 value branches when the CSET condition held;
    // `B.EQ L` branches when it did not.
    let cond = match branch.cond? {
        Cond::Ne => cset.cond?,
        Cond::Eq => cset.cond?.invert(),
        _ => return None,
    };
    Some(vec![
        cmp.clone(),
        b_cond(cond, branch.target_label.as_deref()?),
    ])
}

fn match_fuse_alu_imm(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (first, second) = (&insts[pos], &insts[pos + 1]);
    if first.opcode != OpType::Add || second.opcode != OpType::Add {
        return MatchResult::NO;
    }
    if !first.uses_immediate || !second.uses_immediate {
        return MatchResult::NO;
    }
    // Lo12-relocated adds carry symbols, not plain immediates.
    if first.relocation != Reloc::None || second.relocation != Reloc::None {
        return MatchResult::NO;
    }
    if !same_reg(first.dest, second.dest) || !same_reg(first.dest, second.src1) {
        return MatchResult::NO;
    }
    let combined = first.immediate + second.immediate;
    if !(0..=4095).contains(&combined) {
        return MatchResult::NO;
    }
    MatchResult::hit(2)
}

fn transform_fuse_alu_imm(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let (first, second) = (&insts[pos], &insts[pos + 1]);
    let combined = first.immediate + second.immediate;
    Some(vec![add_imm(first.dest?, first.src1?, combined).ok()?])
}

fn match_fuse_mov_alu(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (mov, alu) = (&insts[pos], &insts[pos + 1]);
    let (rt, imm) = match const_load(mov) {
        Some(found) => found,
        None => return MatchResult::NO,
    };
    if !matches!(
        alu.opcode,
        OpType::Add | OpType::Sub | OpType::And | OpType::Orr | OpType::Eor | OpType::Cmp
    ) || alu.uses_immediate
    {
        return MatchResult::NO;
    }
    if !can_encode_as_immediate(alu.opcode, imm) {
        return MatchResult::NO;
    }
    let feeds_src1 = same_reg(alu.src1, Some(rt));
    let feeds_src2 = same_reg(alu.src2, Some(rt));
    if !feeds_src1 && !feeds_src2 {
        return MatchResult::NO;
    }
    // SUB and CMP have no reversed-immediate form: when the constant is
    // the first operand the pair must stay as it is.
    if feeds_src1 && matches!(alu.opcode, OpType::Sub | OpType::Cmp) {
        return MatchResult::NO;
    }
    if !is_dead_after(insts, pos + 2, rt) {
        return MatchResult::NO;
    }
    MatchResult::hit(2)
}

fn transform_fuse_mov_alu(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let (mov, alu) = (&insts[pos], &insts[pos + 1]);
    let (rt, imm) = const_load(mov)?;
    let other = if same_reg(alu.src1, Some(rt)) {
        alu.src2?
    } else {
        alu.src1?
    };
    let fused = match alu.opcode {
        OpType::Add => add_imm(alu.dest?, other, imm).ok()?,
        OpType::Sub => sub_imm(alu.dest?, other, imm).ok()?,
        OpType::And => and_imm(alu.dest?, other, imm).ok()?,
        OpType::Orr => orr_imm(alu.dest?, other, imm).ok()?,
        OpType::Eor => eor_imm(alu.dest?, other, imm).ok()?,
        OpType::Cmp => cmp_imm(other, imm).ok()?,
        _ => return None,
    };
    Some(vec![fused])
}

const FORWARD_LOOKAHEAD: usize = 5;

fn match_load_store_forwarding(insts: &[Instruction], pos: usize) -> MatchResult {
    let store = &insts[pos];
    if store.opcode != OpType::Str || !store.uses_immediate {
        return MatchResult::NO;
    }
    let (src, base, offset) = match (store.src1, store.base) {
        (Some(src), Some(base)) => (src, base, store.immediate),
        _ => return MatchResult::NO,
    };

    for i in 1..=FORWARD_LOOKAHEAD {
        let Some(inst) = insts.get(pos + i) else {
            return MatchResult::NO;
        };
        // A store to the same address kills the forwarded value.
        if matches!(inst.opcode, OpType::Str | OpType::Stp | OpType::Strb)
            && same_reg(inst.base, Some(base))
            && inst.immediate == offset
        {
            return MatchResult::NO;
        }
        // Overwriting the stored register or the base invalidates the
        // rewrite.
        if inst.defines(src) || inst.defines(base) {
            return MatchResult::NO;
        }
        if inst.opcode == OpType::Ldr
            && inst.uses_immediate
            && same_reg(inst.base, Some(base))
            && inst.immediate == offset
        {
            return MatchResult::hit(i + 1);
        }
    }
    MatchResult::NO
}

fn transform_load_store_forwarding(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let result = match_load_store_forwarding(insts, pos);
    if !result.matched {
        return None;
    }
    let store = &insts[pos];
    let load = &insts[pos + result.length - 1];
    let mut replacements: Vec<Instruction> =
        insts[pos..pos + result.length - 1].to_vec();
    replacements.push(mov_reg(load.dest?, store.src1?));
    Some(replacements)
}

fn match_dead_store(insts: &[Instruction], pos: usize) -> MatchResult {
    let store = &insts[pos];
    if store.opcode != OpType::Str || !store.uses_immediate {
        return MatchResult::NO;
    }
    let (base, offset) = match store.base {
        Some(base) => (base, store.immediate),
        None => return MatchResult::NO,
    };

    for i in 1..=FORWARD_LOOKAHEAD {
        let Some(inst) = insts.get(pos + i) else {
            return MatchResult::NO;
        };
        // Any load may observe the stored value (aliasing unknown).
        if matches!(
            inst.opcode,
            OpType::Ldr | OpType::Ldrb | OpType::Ldp | OpType::Ld1Vec
        ) {
            return MatchResult::NO;
        }
        if inst.defines(base) {
            return MatchResult::NO;
        }
        if inst.opcode == OpType::Str
            && inst.uses_immediate
            && same_reg(inst.base, Some(base))
            && inst.immediate == offset
        {
            return MatchResult::hit(i + 1);
        }
    }
    MatchResult::NO
}

fn transform_dead_store(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let result = match_dead_store(insts, pos);
    if !result.matched {
        return None;
    }
    // Drop the first store; everything after it survives.
    Some(insts[pos + 1..pos + result.length].to_vec())
}

fn match_redundant_compare(insts: &[Instruction], pos: usize) -> MatchResult {
    let cmp = &insts[pos];
    if !matches!(cmp.opcode, OpType::Cmp | OpType::Fcmp) {
        return MatchResult::NO;
    }
    for inst in &insts[pos + 1..] {
        if inst.is_label_definition
            || super::is_special_instruction(inst)
            || matches!(
                inst.opcode,
                OpType::B | OpType::BCond | OpType::Cbz | OpType::Cbnz | OpType::Br
            )
        {
            // Control flow (or a call) may consume the flags elsewhere.
            return MatchResult::NO;
        }
        if inst.opcode.reads_flags() {
            return MatchResult::NO;
        }
        if inst.opcode.sets_flags() {
            return MatchResult::hit(1);
        }
    }
    MatchResult::NO
}

fn match_fma(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (mul, addsub) = (&insts[pos], &insts[pos + 1]);
    if mul.opcode != OpType::Fmul {
        return MatchResult::NO;
    }
    match addsub.opcode {
        // FADD Dd, Dd, Dz accumulates onto the product.
        OpType::Fadd => {
            if same_reg(mul.dest, addsub.dest) && same_reg(mul.dest, addsub.src1) {
                MatchResult::hit(2)
            } else {
                MatchResult::NO
            }
        }
        // FMSUB computes Da - Dn*Dm, so only the minuend form fuses:
        // FSUB Dd, Dz, Dd.
        OpType::Fsub => {
            if same_reg(mul.dest, addsub.dest)
                && same_reg(mul.dest, addsub.src2)
                && !same_reg(mul.dest, addsub.src1)
            {
                MatchResult::hit(2)
            } else {
                MatchResult::NO
            }
        }
        _ => MatchResult::NO,
    }
}

fn transform_fma(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let (mul, addsub) = (&insts[pos], &insts[pos + 1]);
    let inst = match addsub.opcode {
        OpType::Fadd => fmadd(addsub.dest?, mul.src1?, mul.src2?, addsub.src2?),
        OpType::Fsub => fmsub(addsub.dest?, mul.src1?, mul.src2?, addsub.src1?),
        _ => return None,
    };
    Some(vec![inst])
}

fn match_conditional_select(insts: &[Instruction], pos: usize) -> MatchResult {
    // Both arms the same register (XZR included): the select is a plain
    // move whatever the condition says.
    let inst = &insts[pos];
    if inst.opcode == OpType::Csel && same_reg(inst.src1, inst.src2) {
        MatchResult::hit(1)
    } else {
        MatchResult::NO
    }
}

fn transform_conditional_select(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let inst = &insts[pos];
    Some(vec![mov_reg(inst.dest?, inst.src1?)])
}

fn match_bitfield(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (shift, and) = (&insts[pos], &insts[pos + 1]);
    if shift.opcode != OpType::Lsr || and.opcode != OpType::And {
        return MatchResult::NO;
    }
    if !shift.uses_immediate || !and.uses_immediate {
        return MatchResult::NO;
    }
    if !same_reg(shift.dest, and.dest) || !same_reg(shift.dest, and.src1) {
        return MatchResult::NO;
    }
    let width = match low_ones_width(and.immediate) {
        Some(width) => width,
        None => return MatchResult::NO,
    };
    let lsb = shift.immediate as u8;
    if u32::from(lsb) + u32::from(width) > 64 {
        return MatchResult::NO;
    }
    MatchResult::hit(2)
}

fn transform_bitfield(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let (shift, and) = (&insts[pos], &insts[pos + 1]);
    let width = low_ones_width(and.immediate)?;
    let lsb = shift.immediate as u8;
    Some(vec![ubfx(and.dest?, shift.src1?, lsb, width).ok()?])
}

fn match_address_generation(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (first, second) = (&insts[pos], &insts[pos + 1]);
    let is_load = second.opcode == OpType::Ldr;
    let is_store = second.opcode == OpType::Str;

    if first.opcode == OpType::Add && first.relocation == Reloc::None {
        // ADD #imm ; ADD reg (optionally shifted) over the same register.
        if first.uses_immediate
            && second.opcode == OpType::Add
            && !second.uses_immediate
            && same_reg(first.dest, second.dest)
            && same_reg(first.dest, second.src1)
            && !same_reg(first.dest, second.src2)
            && matches!(second.shift, None | Some((ShiftOp::Lsl, _)))
        {
            return MatchResult::hit(2);
        }
        // ADD reg ; LDR/STR [Xd, #0].
        if !first.uses_immediate
            && first.shift.is_none()
            && (is_load || is_store)
            && second.uses_immediate
            && second.immediate == 0
            && same_reg(Some(addr_dest(first)), second.base)
            && addr_base_dead(insts, pos, first, second)
        {
            return MatchResult::hit(2);
        }
        // ADD #imm ; LDR/STR [Xd, #k] with a mergeable offset.
        if first.uses_immediate && (is_load || is_store) && same_reg(first.dest, second.base) {
            let combined = first.immediate + second.immediate;
            if (-256..=4095).contains(&combined)
                && second.uses_immediate
                && addr_base_dead(insts, pos, first, second)
            {
                return MatchResult::hit(2);
            }
        }
    }
    MatchResult::NO
}

fn addr_dest(first: &Instruction) -> Reg {
    first.dest.expect("ADD has a destination")
}

/// After folding the ADD into the memory operand the ADD's destination no
/// longer receives the address; it must be dead (or be the load's own
/// target, which overwrites it anyway).
fn addr_base_dead(insts: &[Instruction], pos: usize, first: &Instruction, mem: &Instruction) -> bool {
    let dest = addr_dest(first);
    if mem.opcode == OpType::Ldr && same_reg(mem.dest, Some(dest)) {
        return true;
    }
    is_dead_after(insts, pos + 2, dest)
}

fn transform_address_generation(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let (first, second) = (&insts[pos], &insts[pos + 1]);
    let is_load = second.opcode == OpType::Ldr;
    let is_store = second.opcode == OpType::Str;

    if first.uses_immediate && second.opcode == OpType::Add && !second.uses_immediate {
        // Reassociate so the register add happens first and the immediate
        // can later merge into an addressing mode.
        let dest = second.dest?;
        let reg_add = match second.shift {
            Some((ShiftOp::Lsl, amount)) => {
                add_reg_shifted(dest, first.src1?, second.src2?, ShiftOp::Lsl, amount).ok()?
            }
            None => add_reg(dest, first.src1?, second.src2?),
            Some(_) => return None,
        };
        return if first.immediate != 0 {
            Some(vec![reg_add, add_imm(dest, dest, first.immediate).ok()?])
        } else {
            Some(vec![reg_add])
        };
    }

    if !first.uses_immediate && (is_load || is_store) {
        // Register-offset addressing absorbs the ADD.
        let (rn, rm) = (first.src1?, first.src2?);
        let inst = if is_load {
            ldr_scaled_reg(second.dest?, rn, rm, false)
        } else {
            str_scaled_reg(second.src1?, rn, rm, false)
        };
        return Some(vec![inst]);
    }

    if first.uses_immediate && (is_load || is_store) {
        let combined = first.immediate + second.immediate;
        let inst = if is_load {
            ldr_imm(second.dest?, first.src1?, combined).ok()?
        } else {
            str_imm(second.src1?, first.src1?, combined).ok()?
        };
        return Some(vec![inst]);
    }
    None
}

fn match_adrp_fusion(insts: &[Instruction], pos: usize) -> MatchResult {
    if pos + 1 >= insts.len() {
        return MatchResult::NO;
    }
    let (page, lo12) = (&insts[pos], &insts[pos + 1]);
    if page.opcode != OpType::Adrp || lo12.opcode != OpType::Add {
        return MatchResult::NO;
    }
    if lo12.relocation != Reloc::AddImmLo12 {
        return MatchResult::NO;
    }
    if !same_reg(page.dest, lo12.dest) || !same_reg(page.dest, lo12.src1) {
        return MatchResult::NO;
    }
    match (&page.target_label, &lo12.target_label) {
        (Some(a), Some(b)) if a == b => MatchResult::hit(2),
        _ => MatchResult::NO,
    }
}

fn transform_adrp_fusion(insts: &[Instruction], pos: usize) -> Option<Vec<Instruction>> {
    let page = &insts[pos];
    Some(vec![adr(page.dest?, page.target_label.as_deref()?)])
}
