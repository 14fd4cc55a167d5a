//! Binary code emission: one constructor per instruction family, each
//! producing an `Instruction` whose 32-bit word, assembly text, and
//! semantic fields agree.

use super::imms::{Imm12, ImmLogic, ImmShift, MoveWideConst};
use super::regs::*;
use super::{Cond, Instruction, JitAttr, OpType, Reloc, ShiftOp};
use crate::error::{CodegenError, CodegenResult};
use smallvec::{smallvec, SmallVec};

//=============================================================================
// Encoding helpers (bit packing only; no semantic fields)

fn enc_arith_rrr(bits_31_21: u32, bits_15_10: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (bits_31_21 << 21) | (bits_15_10 << 10) | (rm.hw_enc() << 16) | (rn.hw_enc() << 5) | rd.hw_enc()
}

fn enc_arith_rr_imm12(bits_31_24: u32, imm12: &Imm12, rn: Reg, rd: Reg) -> u32 {
    (bits_31_24 << 24)
        | (imm12.shift_bits() << 22)
        | (imm12.imm_bits() << 10)
        | (rn.hw_enc() << 5)
        | rd.hw_enc()
}

fn enc_arith_rr_imml(bits_31_23: u32, imml: &ImmLogic, rn: Reg, rd: Reg) -> u32 {
    (bits_31_23 << 23) | (imml.enc_bits() << 10) | (rn.hw_enc() << 5) | rd.hw_enc()
}

fn enc_arith_rrrr(top11: u32, rm: Reg, bit15: u32, ra: Reg, rn: Reg, rd: Reg) -> u32 {
    (top11 << 21)
        | (rm.hw_enc() << 16)
        | (bit15 << 15)
        | (ra.hw_enc() << 10)
        | (rn.hw_enc() << 5)
        | rd.hw_enc()
}

fn enc_jump26(op_31_26: u32, off_26_0: u32) -> u32 {
    debug_assert!(off_26_0 < (1 << 26));
    (op_31_26 << 26) | off_26_0
}

fn enc_cmpbr(op_31_24: u32, off_18_0: u32, rt: Reg) -> u32 {
    debug_assert!(off_18_0 < (1 << 19));
    (op_31_24 << 24) | (off_18_0 << 5) | rt.hw_enc()
}

fn enc_cbr(op_31_24: u32, off_18_0: u32, cond: Cond) -> u32 {
    debug_assert!(off_18_0 < (1 << 19));
    (op_31_24 << 24) | (off_18_0 << 5) | cond.bits()
}

fn enc_move_wide(top9: u32, rd: Reg, imm: &MoveWideConst) -> u32 {
    (top9 << 23) | (u32::from(imm.shift) << 21) | (u32::from(imm.bits) << 5) | rd.hw_enc()
}

fn enc_ldst_pair(op_31_22: u32, simm7_scaled: i64, rn: Reg, rt: Reg, rt2: Reg) -> u32 {
    let imm7 = ((simm7_scaled / 8) as u32) & 0x7f;
    (op_31_22 << 22) | (imm7 << 15) | (rt2.hw_enc() << 10) | (rn.hw_enc() << 5) | rt.hw_enc()
}

fn enc_ldst_simm9(op_31_22: u32, simm9: i64, op_11_10: u32, rn: Reg, rt: Reg) -> u32 {
    let imm9 = (simm9 as u32) & 0x1ff;
    (op_31_22 << 22) | (imm9 << 12) | (op_11_10 << 10) | (rn.hw_enc() << 5) | rt.hw_enc()
}

fn enc_ldst_uimm12(op_31_22: u32, scaled_imm12: u32, rn: Reg, rt: Reg) -> u32 {
    (op_31_22 << 22) | (1 << 24) | (scaled_imm12 << 10) | (rn.hw_enc() << 5) | rt.hw_enc()
}

fn enc_ldst_reg(op_31_22: u32, rn: Reg, rm: Reg, scaled: bool, rt: Reg) -> u32 {
    // Option 011 is LSL; S selects a shift by the access size.
    let s_bit = u32::from(scaled);
    (op_31_22 << 22)
        | (1 << 21)
        | (rm.hw_enc() << 16)
        | (0b011 << 13)
        | (s_bit << 12)
        | (0b10 << 10)
        | (rn.hw_enc() << 5)
        | rt.hw_enc()
}

fn enc_bitfield(opc_31_22: u32, immr: u32, imms: u32, rn: Reg, rd: Reg) -> u32 {
    (opc_31_22 << 22) | (immr << 16) | (imms << 10) | (rn.hw_enc() << 5) | rd.hw_enc()
}

fn enc_csel(top11: u32, rm: Reg, cond: Cond, op2_11_10: u32, rn: Reg, rd: Reg) -> u32 {
    (top11 << 21)
        | (rm.hw_enc() << 16)
        | (cond.bits() << 12)
        | (op2_11_10 << 10)
        | (rn.hw_enc() << 5)
        | rd.hw_enc()
}

fn enc_fpu_rrr(top10: u32, bits_15_10: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (top10 << 22)
        | (0b1 << 21)
        | (rm.hw_enc() << 16)
        | (bits_15_10 << 10)
        | (rn.hw_enc() << 5)
        | rd.hw_enc()
}

fn enc_vec_rrr(top11: u32, bits_15_10: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (top11 << 21) | (rm.hw_enc() << 16) | (bits_15_10 << 10) | (rn.hw_enc() << 5) | rd.hw_enc()
}

//=============================================================================
// Integer ALU, register forms

fn alu_rrr(op: OpType, bits_31_21: u32, mnem: &str, rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    let mut inst = Instruction::new(
        enc_arith_rrr(bits_31_21, 0, rd, rn, rm),
        format!("{mnem} {}, {}, {}", rd.show(), rn.show(), rm.show()),
    );
    inst.opcode = op;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

pub fn add_reg(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    alu_rrr(OpType::Add, 0b10001011_000, "add", rd, rn, rm)
}

pub fn sub_reg(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    alu_rrr(OpType::Sub, 0b11001011_000, "sub", rd, rn, rm)
}

pub fn and_reg(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    alu_rrr(OpType::And, 0b10001010_000, "and", rd, rn, rm)
}

pub fn orr_reg(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    alu_rrr(OpType::Orr, 0b10101010_000, "orr", rd, rn, rm)
}

pub fn eor_reg(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    alu_rrr(OpType::Eor, 0b11001010_000, "eor", rd, rn, rm)
}

/// ADD with a shifted register operand: `ADD Xd, Xn, Xm, <shift> #amount`.
pub fn add_reg_shifted(
    rd: Reg,
    rn: Reg,
    rm: Reg,
    shift: ShiftOp,
    amount: u8,
) -> CodegenResult<Instruction> {
    let imm = ImmShift::maybe_from_u64(u64::from(amount))
        .ok_or(CodegenError::ShiftOutOfRange(i64::from(amount)))?;
    let encoding = (0b10001011u32 << 24)
        | (shift.bits() << 22)
        | (rm.hw_enc() << 16)
        | (u32::from(imm.value()) << 10)
        | (rn.hw_enc() << 5)
        | rd.hw_enc();
    let mut inst = Instruction::new(
        encoding,
        format!(
            "add {}, {}, {}, {} #{}",
            rd.show(),
            rn.show(),
            rm.show(),
            shift.name(),
            amount
        ),
    );
    inst.opcode = OpType::Add;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst.shift = Some((shift, amount));
    Ok(inst)
}

/// CMP (register): SUBS with the zero register as destination.
pub fn cmp_reg(rn: Reg, rm: Reg) -> Instruction {
    let mut inst = Instruction::new(
        enc_arith_rrr(0b11101011_000, 0, zero_reg(), rn, rm),
        format!("cmp {}, {}", rn.show(), rm.show()),
    );
    inst.opcode = OpType::Cmp;
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

/// MUL is MADD with the zero register as addend.
pub fn mul(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    let mut inst = Instruction::new(
        enc_arith_rrrr(0b10011011_000, rm, 0, zero_reg(), rn, rd),
        format!("mul {}, {}, {}", rd.show(), rn.show(), rm.show()),
    );
    inst.opcode = OpType::Mul;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

pub fn madd(rd: Reg, rn: Reg, rm: Reg, ra: Reg) -> Instruction {
    let mut inst = Instruction::new(
        enc_arith_rrrr(0b10011011_000, rm, 0, ra, rn, rd),
        format!(
            "madd {}, {}, {}, {}",
            rd.show(),
            rn.show(),
            rm.show(),
            ra.show()
        ),
    );
    inst.opcode = OpType::Madd;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

pub fn sdiv(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    let mut inst = Instruction::new(
        enc_arith_rrr(0b10011010_110, 0b000011, rd, rn, rm),
        format!("sdiv {}, {}, {}", rd.show(), rn.show(), rm.show()),
    );
    inst.opcode = OpType::Sdiv;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

pub fn udiv(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    let mut inst = Instruction::new(
        enc_arith_rrr(0b10011010_110, 0b000010, rd, rn, rm),
        format!("udiv {}, {}, {}", rd.show(), rn.show(), rm.show()),
    );
    inst.opcode = OpType::Udiv;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

//=============================================================================
// Integer ALU, immediate forms

fn alu_rr_imm12(
    op: OpType,
    bits_31_24: u32,
    mnem: &str,
    rd: Reg,
    rn: Reg,
    imm: i64,
) -> CodegenResult<Instruction> {
    let imm12 = u64::try_from(imm)
        .ok()
        .and_then(Imm12::maybe_from_u64)
        .ok_or(CodegenError::ImmediateOutOfRange { op: mnem.to_string(), value: imm })?;
    // Arithmetic immediates can address SP in both operand positions.
    let mut inst = Instruction::new(
        enc_arith_rr_imm12(bits_31_24, &imm12, rn, rd),
        format!("{mnem} {}, {}, #{}", rd.show_sp(), rn.show_sp(), imm),
    );
    inst.opcode = op;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.immediate = imm;
    inst.uses_immediate = true;
    Ok(inst)
}

pub fn add_imm(rd: Reg, rn: Reg, imm: i64) -> CodegenResult<Instruction> {
    alu_rr_imm12(OpType::Add, 0b1_0_0_10001, "add", rd, rn, imm)
}

pub fn sub_imm(rd: Reg, rn: Reg, imm: i64) -> CodegenResult<Instruction> {
    alu_rr_imm12(OpType::Sub, 0b1_1_0_10001, "sub", rd, rn, imm)
}

/// CMP (immediate): SUBS with the zero register as destination.
pub fn cmp_imm(rn: Reg, imm: i64) -> CodegenResult<Instruction> {
    let imm12 = u64::try_from(imm)
        .ok()
        .and_then(Imm12::maybe_from_u64)
        .ok_or(CodegenError::ImmediateOutOfRange { op: "cmp".to_string(), value: imm })?;
    let mut inst = Instruction::new(
        enc_arith_rr_imm12(0b1_1_1_10001, &imm12, rn, zero_reg()),
        format!("cmp {}, #{}", rn.show(), imm),
    );
    inst.opcode = OpType::Cmp;
    inst.src1 = Some(rn);
    inst.immediate = imm;
    inst.uses_immediate = true;
    Ok(inst)
}

fn alu_rr_imml(
    op: OpType,
    bits_31_23: u32,
    mnem: &str,
    rd: Reg,
    rn: Reg,
    imm: i64,
) -> CodegenResult<Instruction> {
    let imml = ImmLogic::maybe_from_u64(imm as u64)
        .ok_or(CodegenError::ImmediateOutOfRange { op: mnem.to_string(), value: imm })?;
    let mut inst = Instruction::new(
        enc_arith_rr_imml(bits_31_23, &imml, rn, rd),
        format!("{mnem} {}, {}, #{}", rd.show(), rn.show(), imm),
    );
    inst.opcode = op;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.immediate = imm;
    inst.uses_immediate = true;
    Ok(inst)
}

pub fn and_imm(rd: Reg, rn: Reg, imm: i64) -> CodegenResult<Instruction> {
    alu_rr_imml(OpType::And, 0b100_100100, "and", rd, rn, imm)
}

pub fn orr_imm(rd: Reg, rn: Reg, imm: i64) -> CodegenResult<Instruction> {
    alu_rr_imml(OpType::Orr, 0b101_100100, "orr", rd, rn, imm)
}

pub fn eor_imm(rd: Reg, rn: Reg, imm: i64) -> CodegenResult<Instruction> {
    alu_rr_imml(OpType::Eor, 0b110_100100, "eor", rd, rn, imm)
}

/// Whether `op` can take `value` as its immediate operand: a (possibly
/// 12-bit-shifted) arithmetic immediate for ADD/SUB/CMP, a bitmask
/// immediate for the logical group. The peephole MOV+ALU fusion asks this
/// before rewriting so it never produces an unencodable instruction.
pub fn can_encode_as_immediate(op: OpType, value: i64) -> bool {
    match op {
        OpType::Add | OpType::Sub | OpType::Cmp | OpType::Subs => u64::try_from(value)
            .ok()
            .and_then(Imm12::maybe_from_u64)
            .is_some(),
        OpType::And | OpType::Orr | OpType::Eor => {
            ImmLogic::maybe_from_u64(value as u64).is_some()
        }
        _ => false,
    }
}

//=============================================================================
// Moves and constants

/// MOVZ with an optional relocation tag and symbol.
pub fn movz(rd: Reg, imm16: u16, shift: u8, reloc: Reloc, symbol: &str) -> CodegenResult<Instruction> {
    let mwc = MoveWideConst::maybe_with_shift(imm16, shift)
        .ok_or(CodegenError::ShiftOutOfRange(i64::from(shift)))?;
    let text = if mwc.shift == 0 {
        format!("movz {}, #{}", rd.show(), imm16)
    } else {
        format!("movz {}, #{}, lsl #{}", rd.show(), imm16, shift)
    };
    let mut inst = Instruction::new(enc_move_wide(0b110100101, rd, &mwc), text);
    inst.opcode = OpType::Movz;
    inst.dest = Some(rd);
    inst.immediate = mwc.value() as i64;
    inst.uses_immediate = true;
    inst.relocation = reloc;
    if !symbol.is_empty() {
        inst.target_label = Some(symbol.to_string());
    }
    Ok(inst)
}

/// MOVK with an optional relocation tag and symbol.
pub fn movk(rd: Reg, imm16: u16, shift: u8, reloc: Reloc, symbol: &str) -> CodegenResult<Instruction> {
    let mwc = MoveWideConst::maybe_with_shift(imm16, shift)
        .ok_or(CodegenError::ShiftOutOfRange(i64::from(shift)))?;
    let text = if mwc.shift == 0 {
        format!("movk {}, #{}", rd.show(), imm16)
    } else {
        format!("movk {}, #{}, lsl #{}", rd.show(), imm16, shift)
    };
    let mut inst = Instruction::new(enc_move_wide(0b111100101, rd, &mwc), text);
    inst.opcode = OpType::Movk;
    inst.dest = Some(rd);
    inst.src1 = Some(rd); // keeps its other bits
    inst.immediate = mwc.value() as i64;
    inst.uses_immediate = true;
    inst.relocation = reloc;
    if !symbol.is_empty() {
        inst.target_label = Some(symbol.to_string());
    }
    Ok(inst)
}

/// Load a 16-bit immediate with a plain MOVZ, tagged as a semantic MOV so
/// the optimizer treats it as a constant load.
pub fn mov_imm16(rd: Reg, imm: u16) -> Instruction {
    let mut inst = movz(rd, imm, 0, Reloc::None, "").expect("shift 0 is valid");
    inst.opcode = OpType::Mov;
    inst.assembly_text = format!("mov {}, #{}", rd.show(), imm);
    inst
}

/// MOV (register): ORR Xd, XZR, Xm.
pub fn mov_reg(rd: Reg, rm: Reg) -> Instruction {
    if rd.is_float() || rm.is_float() {
        return fmov_reg(rd, rm);
    }
    let mut inst = Instruction::new(
        enc_arith_rrr(0b10101010_000, 0, rd, zero_reg(), rm),
        format!("mov {}, {}", rd.show(), rm.show()),
    );
    inst.opcode = OpType::Mov;
    inst.dest = Some(rd);
    inst.src1 = Some(rm);
    inst
}

/// MOV to or from SP: encoded as ADD Xd, Xn, #0, since the ORR form cannot
/// name the stack pointer.
pub fn mov_sp(rd: Reg, rn: Reg) -> Instruction {
    let mut inst = Instruction::new(
        (0b1_0_0_10001u32 << 24) | (rn.hw_enc() << 5) | rd.hw_enc(),
        format!("mov {}, {}", rd.show_sp(), rn.show_sp()),
    );
    inst.opcode = OpType::Mov;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst
}

/// FMOV between two D registers, or between an X and a D register.
pub fn fmov_reg(rd: Reg, rn: Reg) -> Instruction {
    let (encoding, text) = match (rd.is_float(), rn.is_float()) {
        (true, true) => (
            0x1E604000 | (rn.hw_enc() << 5) | rd.hw_enc(),
            format!("fmov {}, {}", rd.show(), rn.show()),
        ),
        (true, false) => (
            0x9E670000 | (rn.hw_enc() << 5) | rd.hw_enc(),
            format!("fmov {}, {}", rd.show(), rn.show()),
        ),
        (false, true) => (
            0x9E660000 | (rn.hw_enc() << 5) | rd.hw_enc(),
            format!("fmov {}, {}", rd.show(), rn.show()),
        ),
        (false, false) => {
            // Integer-to-integer is a plain move.
            return mov_reg(rd, rn);
        }
    };
    let mut inst = Instruction::new(encoding, text);
    inst.opcode = OpType::Fmov;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst
}

/// Load a 64-bit absolute value or symbol address with a MOVZ/MOVK
/// sequence, each chunk tagged with its relocation.
///
/// The first instruction is always MOVZ for bits [15:0] (even for value 0,
/// to clear the upper bits). Later chunks emit MOVK only when the chunk is
/// non-zero, unless a symbol is attached: a symbol's final address is
/// unknown, so all four chunks must exist for the loader to patch.
pub fn load_constant(rd: Reg, value: u64, symbol: &str) -> SmallVec<[Instruction; 4]> {
    const RELOCS: [Reloc; 4] = [
        Reloc::MovzMovkImm0,
        Reloc::MovzMovkImm16,
        Reloc::MovzMovkImm32,
        Reloc::MovzMovkImm48,
    ];
    let mut insts: SmallVec<[Instruction; 4]> = smallvec![];
    let chunk = |i: u8| ((value >> (16 * i)) & 0xffff) as u16;

    insts.push(movz(rd, chunk(0), 0, RELOCS[0], symbol).expect("shift 0 is valid"));
    for i in 1..4u8 {
        if chunk(i) != 0 || !symbol.is_empty() {
            insts
                .push(movk(rd, chunk(i), 16 * i, RELOCS[i as usize], symbol).expect("valid shift"));
        }
    }
    insts
}

//=============================================================================
// Loads and stores

fn ldst_imm(
    op: OpType,
    load: bool,
    rt: Reg,
    rn: Reg,
    offset: i64,
    size_bytes: u32,
) -> CodegenResult<Instruction> {
    // Shared op_31_22 prefix (bits [25:24] zero): the unsigned-offset form
    // sets bit 24, the unscaled (simm9) form leaves it clear.
    let op_31_22: u32 = match (size_bytes, rt.is_float(), load) {
        (8, false, true) => 0b11_111_0_00_01,
        (8, false, false) => 0b11_111_0_00_00,
        (8, true, true) => 0b11_111_1_00_01,
        (8, true, false) => 0b11_111_1_00_00,
        (4, false, true) => 0b10_111_0_00_01,
        (4, false, false) => 0b10_111_0_00_00,
        (1, false, true) => 0b00_111_0_00_01,
        (1, false, false) => 0b00_111_0_00_00,
        _ => return Err(CodegenError::InvalidOperand("unsupported access size".into())),
    };
    let mnem = match (size_bytes, load) {
        (1, true) => "ldrb",
        (1, false) => "strb",
        (_, true) => "ldr",
        (_, false) => "str",
    };
    let rt_name = if size_bytes < 8 && !rt.is_float() {
        format!("w{}", rt.hw_enc())
    } else {
        rt.show()
    };

    let scale = i64::from(size_bytes);
    let encoding = if offset >= 0 && offset % scale == 0 && offset / scale <= 4095 {
        // Scaled, unsigned-offset form.
        enc_ldst_uimm12(op_31_22, (offset / scale) as u32, rn, rt)
    } else if (-256..256).contains(&offset) {
        // Unscaled LDUR/STUR form. The semantic opcode stays LDR/STR.
        enc_ldst_simm9(op_31_22, offset, 0b00, rn, rt)
    } else {
        return Err(CodegenError::OffsetOutOfRange(offset));
    };

    let text = if offset == 0 {
        format!("{mnem} {rt_name}, [{}]", rn.show_sp())
    } else if offset >= 0 && offset % scale == 0 && offset / scale <= 4095 {
        format!("{mnem} {rt_name}, [{}, #{offset}]", rn.show_sp())
    } else {
        let u = if load { "ldur" } else { "stur" };
        format!("{u} {rt_name}, [{}, #{offset}]", rn.show_sp())
    };

    let mut inst = Instruction::new(encoding, text);
    inst.opcode = op;
    if load {
        inst.dest = Some(rt);
    } else {
        inst.src1 = Some(rt);
    }
    inst.base = Some(rn);
    inst.immediate = offset;
    inst.uses_immediate = true;
    Ok(inst)
}

/// LDR (64-bit, or float D-register by class of `rt`), immediate offset.
pub fn ldr_imm(rt: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    ldst_imm(OpType::Ldr, true, rt, rn, offset, 8)
}

/// STR (64-bit, or float D-register by class of `rt`), immediate offset.
pub fn str_imm(rt: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    ldst_imm(OpType::Str, false, rt, rn, offset, 8)
}

/// LDR (32-bit W-register), immediate offset.
pub fn ldr_word_imm(rt: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    ldst_imm(OpType::Ldr, true, rt, rn, offset, 4)
}

/// STR (32-bit W-register), immediate offset.
pub fn str_word_imm(rt: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    ldst_imm(OpType::Str, false, rt, rn, offset, 4)
}

/// LDRB, immediate offset.
pub fn ldrb_imm(rt: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    ldst_imm(OpType::Ldrb, true, rt, rn, offset, 1)
}

/// STRB, immediate offset.
pub fn strb_imm(rt: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    ldst_imm(OpType::Strb, false, rt, rn, offset, 1)
}

/// LDR with a scaled register offset: `LDR Xt, [Xn, Xm, LSL #3]` (or an
/// unshifted register offset when `scaled` is false).
pub fn ldr_scaled_reg(rt: Reg, rn: Reg, rm: Reg, scaled: bool) -> Instruction {
    let op = if rt.is_float() { 0b11_111_1_00_01 } else { 0b11_111_0_00_01 };
    let text = if scaled {
        format!("ldr {}, [{}, {}, lsl #3]", rt.show(), rn.show_sp(), rm.show())
    } else {
        format!("ldr {}, [{}, {}]", rt.show(), rn.show_sp(), rm.show())
    };
    let mut inst = Instruction::new(enc_ldst_reg(op, rn, rm, scaled, rt), text);
    inst.opcode = OpType::Ldr;
    inst.dest = Some(rt);
    inst.base = Some(rn);
    inst.src2 = Some(rm);
    if scaled {
        inst.shift = Some((ShiftOp::Lsl, 3));
    }
    inst
}

/// STR with a scaled register offset.
pub fn str_scaled_reg(rt: Reg, rn: Reg, rm: Reg, scaled: bool) -> Instruction {
    let op = if rt.is_float() { 0b11_111_1_00_00 } else { 0b11_111_0_00_00 };
    let text = if scaled {
        format!("str {}, [{}, {}, lsl #3]", rt.show(), rn.show_sp(), rm.show())
    } else {
        format!("str {}, [{}, {}]", rt.show(), rn.show_sp(), rm.show())
    };
    let mut inst = Instruction::new(enc_ldst_reg(op, rn, rm, scaled, rt), text);
    inst.opcode = OpType::Str;
    inst.src1 = Some(rt);
    inst.base = Some(rn);
    inst.src2 = Some(rm);
    if scaled {
        inst.shift = Some((ShiftOp::Lsl, 3));
    }
    inst
}

/// STR with pre-index writeback: `STR Xt, [Xn, #imm]!`.
pub fn str_pre_imm(rt: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    if !(-256..256).contains(&offset) {
        return Err(CodegenError::OffsetOutOfRange(offset));
    }
    let op = if rt.is_float() { 0b11_111_1_00_00 } else { 0b11_111_0_00_00 };
    let mut inst = Instruction::new(
        enc_ldst_simm9(op, offset, 0b11, rn, rt),
        format!("str {}, [{}, #{}]!", rt.show(), rn.show_sp(), offset),
    );
    inst.opcode = OpType::Str;
    inst.src1 = Some(rt);
    inst.base = Some(rn);
    inst.immediate = offset;
    inst.uses_immediate = true;
    Ok(inst)
}

/// LDR with post-index writeback: `LDR Xt, [Xn], #imm`.
pub fn ldr_post_imm(rt: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    if !(-256..256).contains(&offset) {
        return Err(CodegenError::OffsetOutOfRange(offset));
    }
    let op = if rt.is_float() { 0b11_111_1_00_01 } else { 0b11_111_0_00_01 };
    let mut inst = Instruction::new(
        enc_ldst_simm9(op, offset, 0b01, rn, rt),
        format!("ldr {}, [{}], #{}", rt.show(), rn.show_sp(), offset),
    );
    inst.opcode = OpType::Ldr;
    inst.dest = Some(rt);
    inst.base = Some(rn);
    inst.immediate = offset;
    inst.uses_immediate = true;
    Ok(inst)
}

fn pair_offset_ok(offset: i64) -> bool {
    offset % 8 == 0 && (-512..=504).contains(&offset)
}

/// STP Xt, Xt2, [Xn, #imm].
pub fn stp(rt: Reg, rt2: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    if !pair_offset_ok(offset) {
        return Err(CodegenError::OffsetOutOfRange(offset));
    }
    let mut inst = Instruction::new(
        enc_ldst_pair(0b10101001_00, offset, rn, rt, rt2),
        format!("stp {}, {}, [{}, #{}]", rt.show(), rt2.show(), rn.show_sp(), offset),
    );
    inst.opcode = OpType::Stp;
    inst.src1 = Some(rt);
    inst.src2 = Some(rt2);
    inst.base = Some(rn);
    inst.immediate = offset;
    inst.uses_immediate = true;
    Ok(inst)
}

/// LDP Xt, Xt2, [Xn, #imm].
pub fn ldp(rt: Reg, rt2: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    if !pair_offset_ok(offset) {
        return Err(CodegenError::OffsetOutOfRange(offset));
    }
    let mut inst = Instruction::new(
        enc_ldst_pair(0b10101001_01, offset, rn, rt, rt2),
        format!("ldp {}, {}, [{}, #{}]", rt.show(), rt2.show(), rn.show_sp(), offset),
    );
    inst.opcode = OpType::Ldp;
    inst.dest = Some(rt);
    inst.src2 = Some(rt2);
    inst.base = Some(rn);
    inst.immediate = offset;
    inst.uses_immediate = true;
    Ok(inst)
}

/// STP with pre-index writeback: `STP Xt, Xt2, [Xn, #imm]!`. The prologue's
/// frame-allocating store.
pub fn stp_pre(rt: Reg, rt2: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    if !pair_offset_ok(offset) {
        return Err(CodegenError::OffsetOutOfRange(offset));
    }
    let mut inst = Instruction::new(
        enc_ldst_pair(0b10101001_10, offset, rn, rt, rt2),
        format!("stp {}, {}, [{}, #{}]!", rt.show(), rt2.show(), rn.show_sp(), offset),
    );
    inst.opcode = OpType::Stp;
    inst.src1 = Some(rt);
    inst.src2 = Some(rt2);
    inst.base = Some(rn);
    inst.immediate = offset;
    inst.uses_immediate = true;
    Ok(inst)
}

/// LDP with post-index writeback: `LDP Xt, Xt2, [Xn], #imm`. The epilogue's
/// frame-releasing load.
pub fn ldp_post(rt: Reg, rt2: Reg, rn: Reg, offset: i64) -> CodegenResult<Instruction> {
    if !pair_offset_ok(offset) {
        return Err(CodegenError::OffsetOutOfRange(offset));
    }
    let mut inst = Instruction::new(
        enc_ldst_pair(0b10101000_11, offset, rn, rt, rt2),
        format!("ldp {}, {}, [{}], #{}", rt.show(), rt2.show(), rn.show_sp(), offset),
    );
    inst.opcode = OpType::Ldp;
    inst.dest = Some(rt);
    inst.src2 = Some(rt2);
    inst.base = Some(rn);
    inst.immediate = offset;
    inst.uses_immediate = true;
    Ok(inst)
}

//=============================================================================
// Control flow

/// B (unconditional branch to label; offset patched at link time).
pub fn b(label: &str) -> Instruction {
    let mut inst = Instruction::new(enc_jump26(0b000101, 0), format!("b {label}"));
    inst.opcode = OpType::B;
    inst.target_label = Some(label.to_string());
    inst.relocation = Reloc::B26;
    inst
}

/// BL (call to label; offset patched at link time).
pub fn bl(label: &str) -> Instruction {
    let mut inst = Instruction::new(enc_jump26(0b100101, 0), format!("bl {label}"));
    inst.opcode = OpType::Bl;
    inst.target_label = Some(label.to_string());
    inst.relocation = Reloc::B26;
    inst
}

pub fn br(rn: Reg) -> Instruction {
    let mut inst = Instruction::new(0xD61F0000 | (rn.hw_enc() << 5), format!("br {}", rn.show()));
    inst.opcode = OpType::Br;
    inst.src1 = Some(rn);
    inst
}

pub fn blr(rn: Reg) -> Instruction {
    let mut inst = Instruction::new(0xD63F0000 | (rn.hw_enc() << 5), format!("blr {}", rn.show()));
    inst.opcode = OpType::Blr;
    inst.src1 = Some(rn);
    inst
}

pub fn ret() -> Instruction {
    let mut inst = Instruction::new(0xD65F03C0, "ret".to_string());
    inst.opcode = OpType::Ret;
    inst
}

/// B.cond to a label.
pub fn b_cond(cond: Cond, label: &str) -> Instruction {
    let mut inst = Instruction::new(
        enc_cbr(0b01010100, 0, cond),
        format!("b.{} {label}", cond.name()),
    );
    inst.opcode = OpType::BCond;
    inst.cond = Some(cond);
    inst.target_label = Some(label.to_string());
    inst.relocation = Reloc::BCond;
    inst
}

/// CBZ Xt, label.
pub fn cbz(rt: Reg, label: &str) -> Instruction {
    let mut inst = Instruction::new(
        enc_cmpbr(0b1_011010_0, 0, rt),
        format!("cbz {}, {label}", rt.show()),
    );
    inst.opcode = OpType::Cbz;
    inst.src1 = Some(rt);
    inst.target_label = Some(label.to_string());
    inst.relocation = Reloc::BCond;
    inst
}

/// CBNZ Xt, label.
pub fn cbnz(rt: Reg, label: &str) -> Instruction {
    let mut inst = Instruction::new(
        enc_cmpbr(0b1_011010_1, 0, rt),
        format!("cbnz {}, {label}", rt.show()),
    );
    inst.opcode = OpType::Cbnz;
    inst.src1 = Some(rt);
    inst.target_label = Some(label.to_string());
    inst.relocation = Reloc::BCond;
    inst
}

/// ADRP Xd, label (page address, patched at link time).
pub fn adrp(rd: Reg, label: &str) -> Instruction {
    let mut inst = Instruction::new(0x90000000 | rd.hw_enc(), format!("adrp {}, {label}", rd.show()));
    inst.opcode = OpType::Adrp;
    inst.dest = Some(rd);
    inst.target_label = Some(label.to_string());
    inst.relocation = Reloc::AdrpImm;
    inst
}

/// ADD Xd, Xn, :lo12:label — the page-offset completion of an ADRP.
pub fn add_lo12(rd: Reg, rn: Reg, label: &str) -> Instruction {
    let mut inst = Instruction::new(
        (0b1_0_0_10001u32 << 24) | (rn.hw_enc() << 5) | rd.hw_enc(),
        format!("add {}, {}, :lo12:{label}", rd.show(), rn.show()),
    );
    inst.opcode = OpType::Add;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.uses_immediate = true;
    inst.target_label = Some(label.to_string());
    inst.relocation = Reloc::AddImmLo12;
    inst
}

/// ADR Xd, label (PC-relative within ±1MiB, patched at link time).
pub fn adr(rd: Reg, label: &str) -> Instruction {
    let mut inst = Instruction::new(0x10000000 | rd.hw_enc(), format!("adr {}, {label}", rd.show()));
    inst.opcode = OpType::Adr;
    inst.dest = Some(rd);
    inst.target_label = Some(label.to_string());
    inst.relocation = Reloc::Adr21;
    inst
}

//=============================================================================
// Bitfield and shift

fn shift_imm(
    op: OpType,
    mnem: &str,
    rd: Reg,
    rn: Reg,
    amount: u8,
    immr: u32,
    imms: u32,
    sbfm: bool,
) -> CodegenResult<Instruction> {
    if amount > 63 {
        return Err(CodegenError::ShiftOutOfRange(i64::from(amount)));
    }
    let opc = if sbfm { 0b100_100110_1 } else { 0b110_100110_1 };
    let mut inst = Instruction::new(
        enc_bitfield(opc, immr, imms, rn, rd),
        format!("{mnem} {}, {}, #{}", rd.show(), rn.show(), amount),
    );
    inst.opcode = op;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.immediate = i64::from(amount);
    inst.uses_immediate = true;
    Ok(inst)
}

/// LSL Xd, Xn, #shift (alias of UBFM).
pub fn lsl_imm(rd: Reg, rn: Reg, shift: u8) -> CodegenResult<Instruction> {
    if shift > 63 {
        return Err(CodegenError::ShiftOutOfRange(i64::from(shift)));
    }
    let immr = (64 - u32::from(shift)) % 64;
    let imms = 63 - u32::from(shift);
    shift_imm(OpType::Lsl, "lsl", rd, rn, shift, immr, imms, false)
}

/// LSR Xd, Xn, #shift (alias of UBFM).
pub fn lsr_imm(rd: Reg, rn: Reg, shift: u8) -> CodegenResult<Instruction> {
    shift_imm(OpType::Lsr, "lsr", rd, rn, shift, u32::from(shift), 63, false)
}

/// ASR Xd, Xn, #shift (alias of SBFM).
pub fn asr_imm(rd: Reg, rn: Reg, shift: u8) -> CodegenResult<Instruction> {
    shift_imm(OpType::Asr, "asr", rd, rn, shift, u32::from(shift), 63, true)
}

fn bitfield_extract(
    op: OpType,
    mnem: &str,
    rd: Reg,
    rn: Reg,
    lsb: u8,
    width: u8,
    sbfm: bool,
) -> CodegenResult<Instruction> {
    if lsb > 63 || width == 0 || u32::from(lsb) + u32::from(width) > 64 {
        return Err(CodegenError::InvalidOperand(format!(
            "{mnem} lsb {lsb} width {width}"
        )));
    }
    let opc = if sbfm { 0b100_100110_1 } else { 0b110_100110_1 };
    let mut inst = Instruction::new(
        enc_bitfield(
            opc,
            u32::from(lsb),
            u32::from(lsb) + u32::from(width) - 1,
            rn,
            rd,
        ),
        format!("{mnem} {}, {}, #{lsb}, #{width}", rd.show(), rn.show()),
    );
    inst.opcode = op;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.immediate = i64::from(lsb);
    inst.uses_immediate = true;
    // The width rides in the shift slot so both parameters stay semantic.
    inst.shift = Some((ShiftOp::Lsr, width));
    Ok(inst)
}

/// UBFX Xd, Xn, #lsb, #width.
pub fn ubfx(rd: Reg, rn: Reg, lsb: u8, width: u8) -> CodegenResult<Instruction> {
    bitfield_extract(OpType::Ubfx, "ubfx", rd, rn, lsb, width, false)
}

/// SBFX Xd, Xn, #lsb, #width.
pub fn sbfx(rd: Reg, rn: Reg, lsb: u8, width: u8) -> CodegenResult<Instruction> {
    bitfield_extract(OpType::Sbfx, "sbfx", rd, rn, lsb, width, true)
}

//=============================================================================
// Conditional select family

/// CSEL Xd, Xn, Xm, cond.
pub fn csel(rd: Reg, rn: Reg, rm: Reg, cond: Cond) -> Instruction {
    let mut inst = Instruction::new(
        enc_csel(0b10011010_100, rm, cond, 0b00, rn, rd),
        format!("csel {}, {}, {}, {}", rd.show(), rn.show(), rm.show(), cond.name()),
    );
    inst.opcode = OpType::Csel;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst.cond = Some(cond);
    inst
}

/// CSINV Xd, Xn, Xm, cond.
pub fn csinv(rd: Reg, rn: Reg, rm: Reg, cond: Cond) -> Instruction {
    let mut inst = Instruction::new(
        enc_csel(0b11011010_100, rm, cond, 0b00, rn, rd),
        format!("csinv {}, {}, {}, {}", rd.show(), rn.show(), rm.show(), cond.name()),
    );
    inst.opcode = OpType::Csinv;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst.cond = Some(cond);
    inst
}

/// CSET Xd, cond — alias of CSINC Xd, XZR, XZR, invert(cond).
pub fn cset(rd: Reg, cond: Cond) -> Instruction {
    let mut inst = Instruction::new(
        enc_csel(0b10011010_100, zero_reg(), cond.invert(), 0b01, zero_reg(), rd),
        format!("cset {}, {}", rd.show(), cond.name()),
    );
    inst.opcode = OpType::Cset;
    inst.dest = Some(rd);
    inst.cond = Some(cond);
    inst
}

/// CSETM Xd, cond — alias of CSINV Xd, XZR, XZR, invert(cond).
pub fn csetm(rd: Reg, cond: Cond) -> Instruction {
    let mut inst = Instruction::new(
        enc_csel(0b11011010_100, zero_reg(), cond.invert(), 0b00, zero_reg(), rd),
        format!("csetm {}, {}", rd.show(), cond.name()),
    );
    inst.opcode = OpType::Csetm;
    inst.dest = Some(rd);
    inst.cond = Some(cond);
    inst
}

//=============================================================================
// Floating point

fn fpu_rrr(op: OpType, bits_15_10: u32, mnem: &str, rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    // Double-precision scalar group: top bits 0001111001.
    let mut inst = Instruction::new(
        enc_fpu_rrr(0b0001111001, bits_15_10, rd, rn, rm),
        format!("{mnem} {}, {}, {}", rd.show(), rn.show(), rm.show()),
    );
    inst.opcode = op;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

pub fn fadd(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    fpu_rrr(OpType::Fadd, 0b001010, "fadd", rd, rn, rm)
}

pub fn fsub(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    fpu_rrr(OpType::Fsub, 0b001110, "fsub", rd, rn, rm)
}

pub fn fmul(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    fpu_rrr(OpType::Fmul, 0b000010, "fmul", rd, rn, rm)
}

pub fn fdiv(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    fpu_rrr(OpType::Fdiv, 0b000110, "fdiv", rd, rn, rm)
}

/// FMADD Dd, Dn, Dm, Da = Da + Dn*Dm.
pub fn fmadd(rd: Reg, rn: Reg, rm: Reg, ra: Reg) -> Instruction {
    let encoding = (0b00011111_010u32 << 21)
        | (rm.hw_enc() << 16)
        | (ra.hw_enc() << 10)
        | (rn.hw_enc() << 5)
        | rd.hw_enc();
    let mut inst = Instruction::new(
        encoding,
        format!("fmadd {}, {}, {}, {}", rd.show(), rn.show(), rm.show(), ra.show()),
    );
    inst.opcode = OpType::Fmadd;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

/// FMSUB Dd, Dn, Dm, Da = Da - Dn*Dm.
pub fn fmsub(rd: Reg, rn: Reg, rm: Reg, ra: Reg) -> Instruction {
    let encoding = (0b00011111_010u32 << 21)
        | (rm.hw_enc() << 16)
        | (1 << 15)
        | (ra.hw_enc() << 10)
        | (rn.hw_enc() << 5)
        | rd.hw_enc();
    let mut inst = Instruction::new(
        encoding,
        format!("fmsub {}, {}, {}, {}", rd.show(), rn.show(), rm.show(), ra.show()),
    );
    inst.opcode = OpType::Fmsub;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

/// FCMP Dn, Dm.
pub fn fcmp(rn: Reg, rm: Reg) -> Instruction {
    let encoding = enc_fpu_rrr(0b0001111001, 0b001000, dreg(0), rn, rm);
    let mut inst = Instruction::new(encoding, format!("fcmp {}, {}", rn.show(), rm.show()));
    inst.opcode = OpType::Fcmp;
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

/// SCVTF Dd, Xn — signed 64-bit integer to double.
pub fn scvtf(rd: Reg, rn: Reg) -> Instruction {
    let mut inst = Instruction::new(
        0x9E620000 | (rn.hw_enc() << 5) | rd.hw_enc(),
        format!("scvtf {}, {}", rd.show(), rn.show()),
    );
    inst.opcode = OpType::Scvtf;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst
}

/// FCVTZS Xd, Dn — double to signed 64-bit integer, round toward zero.
pub fn fcvtzs(rd: Reg, rn: Reg) -> Instruction {
    let mut inst = Instruction::new(
        0x9E780000 | (rn.hw_enc() << 5) | rd.hw_enc(),
        format!("fcvtzs {}, {}", rd.show(), rn.show()),
    );
    inst.opcode = OpType::Fcvtzs;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst
}

//=============================================================================
// Vector (SIMD), 4x32 arrangement

fn vec_rrr(
    op: OpType,
    top11: u32,
    bits_15_10: u32,
    mnem: &str,
    rd: Reg,
    rn: Reg,
    rm: Reg,
) -> Instruction {
    let mut inst = Instruction::new(
        enc_vec_rrr(top11, bits_15_10, rd, rn, rm),
        format!("{mnem} v{}.4s, v{}.4s, v{}.4s", rd.hw_enc(), rn.hw_enc(), rm.hw_enc()),
    );
    inst.opcode = op;
    inst.dest = Some(rd);
    inst.src1 = Some(rn);
    inst.src2 = Some(rm);
    inst
}

/// ADD Vd.4S, Vn.4S, Vm.4S.
pub fn add_vec_4s(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    vec_rrr(OpType::AddVec, 0b01001110_101, 0b100001, "add", rd, rn, rm)
}

/// MUL Vd.4S, Vn.4S, Vm.4S.
pub fn mul_vec_4s(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    vec_rrr(OpType::MulVec, 0b01001110_101, 0b100111, "mul", rd, rn, rm)
}

/// FADD Vd.4S, Vn.4S, Vm.4S.
pub fn fadd_vec_4s(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    vec_rrr(OpType::FaddVec, 0b01001110_001, 0b110101, "fadd", rd, rn, rm)
}

/// FMLA Vd.4S, Vn.4S, Vm.4S.
pub fn fmla_vec_4s(rd: Reg, rn: Reg, rm: Reg) -> Instruction {
    vec_rrr(OpType::FmlaVec, 0b01001110_001, 0b110011, "fmla", rd, rn, rm)
}

/// LD1 {Vt.4S}, [Xn].
pub fn ld1_vec_4s(rt: Reg, rn: Reg) -> Instruction {
    let mut inst = Instruction::new(
        0x4C407800 | (rn.hw_enc() << 5) | rt.hw_enc(),
        format!("ld1 {{v{}.4s}}, [{}]", rt.hw_enc(), rn.show_sp()),
    );
    inst.opcode = OpType::Ld1Vec;
    inst.dest = Some(rt);
    inst.base = Some(rn);
    inst
}

//=============================================================================
// Pseudo / directives

pub fn nop() -> Instruction {
    let mut inst = Instruction::new(0xD503201F, "nop".to_string());
    inst.opcode = OpType::Nop;
    inst
}

/// A `.quad` data directive. The encoding field carries the low word of the
/// data value; the full value lives in `immediate`.
pub fn directive_quad(value: u64, target_label: &str) -> Instruction {
    let text = if target_label.is_empty() {
        format!(".quad 0x{value:x}")
    } else {
        format!(".quad 0x{value:x} ; {target_label}")
    };
    let mut inst = Instruction::new((value & 0xffff_ffff) as u32, text);
    inst.opcode = OpType::Directive;
    inst.immediate = value as i64;
    inst.uses_immediate = true;
    inst.is_data_value = true;
    if !target_label.is_empty() {
        inst.target_label = Some(target_label.to_string());
    }
    inst
}

/// Mark an instruction for the JIT loader; fenced from the optimizer.
pub fn with_jit_attr(mut inst: Instruction, attr: JitAttr) -> Instruction {
    inst.jit_attr = attr;
    inst
}
