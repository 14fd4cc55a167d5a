use super::emit::*;
use super::regs::*;
use super::{Cond, Instruction, Reloc, ShiftOp};

// N.B.: the architecture is little-endian, so when transcribing the 32-bit
// hex instructions from e.g. objdump disassembly, one must swap the bytes
// seen below. (E.g., a `ret` is normally written as the u32 `D65F03C0`,
// but we write it here as C0035FD6.)
//
// Useful helper script to produce the encodings from the text:
//
//      #!/bin/sh
//      tmp=`mktemp /tmp/XXXXXXXX.o`
//      aarch64-linux-gnu-as /dev/stdin -o $tmp
//      aarch64-linux-gnu-objdump -d $tmp
//      rm -f $tmp
//
// Then:
//
//      $ echo "mov x1, x2" | aarch64inst.sh

fn le_bytes(encoding: u32) -> String {
    encoding
        .to_le_bytes()
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect()
}

#[test]
fn test_aarch64_binemit() {
    let mut insns = Vec::<(Instruction, &str, &str)>::new();

    insns.push((ret(), "C0035FD6", "ret"));
    insns.push((nop(), "1F2003D5", "nop"));

    // Integer ALU, register forms.
    insns.push((add_reg(xreg(4), xreg(5), xreg(6)), "A400068B", "add x4, x5, x6"));
    insns.push((sub_reg(xreg(1), xreg(2), xreg(3)), "410003CB", "sub x1, x2, x3"));
    insns.push((and_reg(xreg(1), xreg(2), xreg(3)), "4100038A", "and x1, x2, x3"));
    insns.push((orr_reg(xreg(1), xreg(2), xreg(3)), "410003AA", "orr x1, x2, x3"));
    insns.push((eor_reg(xreg(1), xreg(2), xreg(3)), "410003CA", "eor x1, x2, x3"));
    insns.push((cmp_reg(xreg(1), xreg(2)), "3F0002EB", "cmp x1, x2"));
    insns.push((mul(xreg(1), xreg(2), xreg(3)), "417C039B", "mul x1, x2, x3"));
    insns.push((
        madd(xreg(1), xreg(2), xreg(3), xreg(4)),
        "4110039B",
        "madd x1, x2, x3, x4",
    ));
    insns.push((sdiv(xreg(10), xreg(11), xreg(9)), "6A0DC99A", "sdiv x10, x11, x9"));
    insns.push((udiv(xreg(1), xreg(2), xreg(3)), "4108C39A", "udiv x1, x2, x3"));
    insns.push((
        add_reg_shifted(xreg(0), xreg(1), xreg(2), ShiftOp::Lsl, 3).unwrap(),
        "200C028B",
        "add x0, x1, x2, lsl #3",
    ));

    // Integer ALU, immediate forms.
    insns.push((
        add_imm(xreg(0), xreg(1), 100).unwrap(),
        "20900191",
        "add x0, x1, #100",
    ));
    insns.push((
        add_imm(xreg(7), xreg(8), 4096).unwrap(),
        "07054091",
        "add x7, x8, #4096",
    ));
    insns.push((
        sub_imm(xreg(0), xreg(1), 100).unwrap(),
        "209001D1",
        "sub x0, x1, #100",
    ));
    insns.push((cmp_imm(xreg(5), 0).unwrap(), "BF0000F1", "cmp x5, #0"));
    insns.push((
        and_imm(xreg(0), xreg(1), 0xff).unwrap(),
        "201C4092",
        "and x0, x1, #255",
    ));
    insns.push((orr_imm(xreg(2), xreg(3), 1).unwrap(), "620040B2", "orr x2, x3, #1"));
    insns.push((
        eor_imm(xreg(2), xreg(3), 0xf0).unwrap(),
        "620C7CD2",
        "eor x2, x3, #240",
    ));

    // Moves and constants.
    insns.push((
        movz(xreg(1), 0xffff, 0, Reloc::None, "").unwrap(),
        "E1FF9FD2",
        "movz x1, #65535",
    ));
    insns.push((
        movz(xreg(2), 0xbeef, 16, Reloc::None, "").unwrap(),
        "E2DDB7D2",
        "movz x2, #48879, lsl #16",
    ));
    insns.push((
        movk(xreg(3), 0x1234, 32, Reloc::None, "").unwrap(),
        "8346C2F2",
        "movk x3, #4660, lsl #32",
    ));
    insns.push((mov_reg(xreg(1), xreg(2)), "E10302AA", "mov x1, x2"));
    insns.push((mov_sp(fp_reg(), stack_reg()), "FD030091", "mov x29, sp"));
    insns.push((fmov_reg(dreg(1), dreg(2)), "4140601E", "fmov d1, d2"));
    insns.push((fmov_reg(xreg(1), dreg(2)), "4100669E", "fmov x1, d2"));
    insns.push((fmov_reg(dreg(1), xreg(2)), "4100679E", "fmov d1, x2"));

    // Loads and stores.
    insns.push((ldr_imm(xreg(1), xreg(2), 0).unwrap(), "410040F9", "ldr x1, [x2]"));
    insns.push((
        ldr_imm(xreg(1), fp_reg(), 16).unwrap(),
        "A10B40F9",
        "ldr x1, [x29, #16]",
    ));
    insns.push((
        str_imm(xreg(3), fp_reg(), -16).unwrap(),
        "A3031FF8",
        "stur x3, [x29, #-16]",
    ));
    insns.push((
        ldr_imm(dreg(1), xreg(2), 8).unwrap(),
        "410440FD",
        "ldr d1, [x2, #8]",
    ));
    insns.push((
        str_word_imm(xreg(1), xreg(2), 4).unwrap(),
        "410400B9",
        "str w1, [x2, #4]",
    ));
    insns.push((
        ldrb_imm(xreg(1), xreg(2), 3).unwrap(),
        "410C4039",
        "ldrb w1, [x2, #3]",
    ));
    insns.push((
        ldr_scaled_reg(xreg(0), xreg(1), xreg(2), true),
        "207862F8",
        "ldr x0, [x1, x2, lsl #3]",
    ));
    insns.push((
        ldr_scaled_reg(xreg(0), xreg(1), xreg(2), false),
        "206862F8",
        "ldr x0, [x1, x2]",
    ));
    insns.push((
        str_scaled_reg(xreg(0), xreg(1), xreg(2), false),
        "206822F8",
        "str x0, [x1, x2]",
    ));
    insns.push((
        stp(xreg(19), xreg(20), stack_reg(), 16).unwrap(),
        "F35301A9",
        "stp x19, x20, [sp, #16]",
    ));
    insns.push((
        stp_pre(fp_reg(), link_reg(), stack_reg(), -48).unwrap(),
        "FD7BBDA9",
        "stp x29, x30, [sp, #-48]!",
    ));
    insns.push((
        ldp_post(fp_reg(), link_reg(), stack_reg(), 48).unwrap(),
        "FD7BC3A8",
        "ldp x29, x30, [sp], #48",
    ));
    insns.push((
        str_pre_imm(xreg(1), stack_reg(), -8).unwrap(),
        "E18F1FF8",
        "str x1, [sp, #-8]!",
    ));
    insns.push((
        ldr_post_imm(xreg(1), stack_reg(), 8).unwrap(),
        "E18740F8",
        "ldr x1, [sp], #8",
    ));

    // Control flow (labels are zero until patched; relocation carries the
    // target).
    insns.push((b("L1"), "00000014", "b L1"));
    insns.push((bl("WRITES"), "00000094", "bl WRITES"));
    insns.push((br(xreg(1)), "20001FD6", "br x1"));
    insns.push((blr(xreg(2)), "40003FD6", "blr x2"));
    insns.push((b_cond(Cond::Eq, "L1"), "00000054", "b.eq L1"));
    insns.push((b_cond(Cond::Ne, "L1"), "01000054", "b.ne L1"));
    insns.push((cbz(xreg(5), "L1"), "050000B4", "cbz x5, L1"));
    insns.push((cbnz(xreg(5), "L1"), "050000B5", "cbnz x5, L1"));
    insns.push((adrp(xreg(0), "G"), "00000090", "adrp x0, G"));
    insns.push((adr(xreg(0), "G"), "00000010", "adr x0, G"));
    insns.push((add_lo12(xreg(0), xreg(0), "G"), "00000091", "add x0, x0, :lo12:G"));

    // Bitfield and shift.
    insns.push((
        lsl_imm(xreg(10), xreg(11), 3).unwrap(),
        "6AF17DD3",
        "lsl x10, x11, #3",
    ));
    insns.push((
        lsr_imm(xreg(1), xreg(2), 4).unwrap(),
        "41FC44D3",
        "lsr x1, x2, #4",
    ));
    insns.push((
        asr_imm(xreg(10), xreg(11), 2).unwrap(),
        "6AFD4293",
        "asr x10, x11, #2",
    ));
    insns.push((
        ubfx(xreg(0), xreg(1), 8, 8).unwrap(),
        "203C48D3",
        "ubfx x0, x1, #8, #8",
    ));
    insns.push((
        sbfx(xreg(0), xreg(1), 4, 8).unwrap(),
        "202C4493",
        "sbfx x0, x1, #4, #8",
    ));

    // Conditional select family.
    insns.push((
        csel(xreg(0), xreg(1), xreg(2), Cond::Lt),
        "20B0829A",
        "csel x0, x1, x2, lt",
    ));
    insns.push((
        csinv(xreg(0), xreg(1), xreg(2), Cond::Ge),
        "20A082DA",
        "csinv x0, x1, x2, ge",
    ));
    insns.push((cset(xreg(3), Cond::Lt), "E3A79F9A", "cset x3, lt"));
    insns.push((csetm(xreg(1), Cond::Eq), "E1139FDA", "csetm x1, eq"));

    // Floating point.
    insns.push((fadd(dreg(0), dreg(1), dreg(2)), "2028621E", "fadd d0, d1, d2"));
    insns.push((fsub(dreg(3), dreg(4), dreg(5)), "8338651E", "fsub d3, d4, d5"));
    insns.push((fmul(dreg(0), dreg(1), dreg(2)), "2008621E", "fmul d0, d1, d2"));
    insns.push((fdiv(dreg(0), dreg(1), dreg(2)), "2018621E", "fdiv d0, d1, d2"));
    insns.push((
        fmadd(dreg(0), dreg(1), dreg(2), dreg(3)),
        "200C421F",
        "fmadd d0, d1, d2, d3",
    ));
    insns.push((
        fmsub(dreg(0), dreg(1), dreg(2), dreg(3)),
        "208C421F",
        "fmsub d0, d1, d2, d3",
    ));
    insns.push((fcmp(dreg(1), dreg(2)), "2020621E", "fcmp d1, d2"));
    insns.push((scvtf(dreg(1), xreg(2)), "4100629E", "scvtf d1, x2"));
    insns.push((fcvtzs(xreg(1), dreg(2)), "4100789E", "fcvtzs x1, d2"));

    // Vector.
    insns.push((
        add_vec_4s(dreg(0), dreg(1), dreg(2)),
        "2084A24E",
        "add v0.4s, v1.4s, v2.4s",
    ));
    insns.push((
        mul_vec_4s(dreg(0), dreg(1), dreg(2)),
        "209CA24E",
        "mul v0.4s, v1.4s, v2.4s",
    ));
    insns.push((
        fadd_vec_4s(dreg(0), dreg(1), dreg(2)),
        "20D4224E",
        "fadd v0.4s, v1.4s, v2.4s",
    ));
    insns.push((
        fmla_vec_4s(dreg(0), dreg(1), dreg(2)),
        "20CC224E",
        "fmla v0.4s, v1.4s, v2.4s",
    ));
    insns.push((ld1_vec_4s(dreg(1), xreg(2)), "4178404C", "ld1 {v1.4s}, [x2]"));

    for (inst, expected_bytes, expected_asm) in insns {
        assert_eq!(
            expected_asm, inst.assembly_text,
            "assembly text mismatch for {expected_asm}"
        );
        assert_eq!(
            expected_bytes,
            le_bytes(inst.encoding),
            "encoding mismatch for {expected_asm}"
        );
    }
}

#[test]
fn load_constant_of_zero_is_a_single_movz() {
    let insts = load_constant(xreg(0), 0, "");
    assert_eq!(insts.len(), 1);
    assert_eq!(insts[0].assembly_text, "movz x0, #0");
    assert_eq!(insts[0].relocation, Reloc::MovzMovkImm0);
}

#[test]
fn load_constant_emits_chunks_low_to_high() {
    let insts = load_constant(xreg(0), 0xDEAD_BEEF_CAFE_BABE, "");
    let texts: Vec<&str> = insts.iter().map(|inst| inst.assembly_text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "movz x0, #47806",
            "movk x0, #51966, lsl #16",
            "movk x0, #48879, lsl #32",
            "movk x0, #57005, lsl #48",
        ]
    );
    assert_eq!(
        insts.iter().map(|inst| inst.relocation).collect::<Vec<_>>(),
        vec![
            Reloc::MovzMovkImm0,
            Reloc::MovzMovkImm16,
            Reloc::MovzMovkImm32,
            Reloc::MovzMovkImm48,
        ]
    );
}

#[test]
fn load_constant_skips_zero_chunks() {
    // 0x0000_0001_0000_0002: chunk 1 and chunk 3 are zero.
    let insts = load_constant(xreg(0), 0x0000_0001_0000_0002, "");
    assert_eq!(insts.len(), 2);
    assert_eq!(insts[0].assembly_text, "movz x0, #2");
    assert_eq!(insts[1].assembly_text, "movk x0, #1, lsl #32");
}

#[test]
fn load_constant_with_symbol_emits_all_chunks() {
    // A symbol's final address is unknown, so every chunk must exist for
    // the loader to patch.
    let insts = load_constant(xreg(0), 0, "G_table");
    assert_eq!(insts.len(), 4);
    for inst in &insts {
        assert_eq!(inst.target_label.as_deref(), Some("G_table"));
    }
}

#[test]
fn can_encode_as_immediate_boundaries() {
    use super::OpType;
    assert!(can_encode_as_immediate(OpType::Add, 4095));
    // 4096 still encodes, via the 12-bit left shift.
    assert!(can_encode_as_immediate(OpType::Add, 4096));
    assert!(!can_encode_as_immediate(OpType::Add, 4097));
    assert!(can_encode_as_immediate(OpType::Add, 4095 << 12));
    assert!(!can_encode_as_immediate(OpType::Add, (4095 << 12) + 8));
    assert!(!can_encode_as_immediate(OpType::Add, -1));
    // Logical immediates follow the bitmask rules instead.
    assert!(can_encode_as_immediate(OpType::And, 0xff));
    assert!(!can_encode_as_immediate(OpType::And, 0xfd));
    assert!(can_encode_as_immediate(OpType::Orr, 0x0f0f_0f0f_0f0f_0f0f));
    // Multiplies never take an immediate operand.
    assert!(!can_encode_as_immediate(OpType::Mul, 8));
}

#[test]
fn semantic_fields_round_trip() {
    // Decoding the encoded word recovers the same semantic fields the
    // constructor recorded.
    let inst = add_reg(xreg(4), xreg(5), xreg(6));
    assert_eq!(inst.encoding & 0x1f, inst.dest.unwrap().hw_enc());
    assert_eq!((inst.encoding >> 5) & 0x1f, inst.src1.unwrap().hw_enc());
    assert_eq!((inst.encoding >> 16) & 0x1f, inst.src2.unwrap().hw_enc());

    let inst = ldr_imm(xreg(1), fp_reg(), 16).unwrap();
    assert_eq!(inst.encoding & 0x1f, inst.dest.unwrap().hw_enc());
    assert_eq!((inst.encoding >> 5) & 0x1f, inst.base.unwrap().hw_enc());
    assert_eq!(((inst.encoding >> 10) & 0xfff) as i64 * 8, inst.immediate);

    let inst = movz(xreg(2), 0xbeef, 16, Reloc::None, "").unwrap();
    assert_eq!(inst.encoding & 0x1f, inst.dest.unwrap().hw_enc());
    assert_eq!((((inst.encoding >> 5) & 0xffff) as i64) << 16, inst.immediate);
}

#[test]
fn directives_carry_their_value() {
    let inst = directive_quad(0x1122334455667788, "L_data");
    assert!(inst.is_data_value);
    assert_eq!(inst.immediate, 0x1122334455667788);
    assert_eq!(inst.encoding, 0x55667788);
    assert_eq!(inst.assembly_text, ".quad 0x1122334455667788 ; L_data");
}
