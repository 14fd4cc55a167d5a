use super::*;
use crate::inst::emit::*;
use crate::inst::regs::{dreg, xreg};
use crate::inst::{Cond, Instruction, Reloc};
use crate::settings::Flags;
use crate::stream::InstructionStream;

fn optimize(insts: Vec<Instruction>) -> InstructionStream {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut stream = InstructionStream::from_instructions(insts);
    let mut optimizer = PeepholeOptimizer::new(&Flags::default());
    optimizer.optimize(&mut stream);
    stream
}

fn texts(stream: &InstructionStream) -> Vec<String> {
    stream.iter().map(|inst| inst.assembly_text.clone()).collect()
}

fn movz_plain(rd: crate::inst::regs::Reg, imm: u16) -> Instruction {
    movz(rd, imm, 0, Reloc::None, "").unwrap()
}

#[test]
fn shift_fusion() {
    let stream = optimize(vec![
        movz_plain(xreg(9), 8),
        mul(xreg(10), xreg(11), xreg(9)),
    ]);
    assert_eq!(texts(&stream), vec!["lsl x10, x11, #3"]);
}

#[test]
fn multiply_by_one_is_left_alone() {
    let stream = optimize(vec![
        movz_plain(xreg(9), 1),
        mul(xreg(10), xreg(11), xreg(9)),
    ]);
    assert_eq!(stream.len(), 2);
}

#[test]
fn multiply_by_large_power_of_two() {
    let stream = optimize(vec![
        movz_plain(xreg(9), 1 << 14),
        mul(xreg(10), xreg(11), xreg(9)),
    ]);
    assert_eq!(texts(&stream), vec!["lsl x10, x11, #14"]);
}

#[test]
fn shift_fusion_keeps_live_constant() {
    // x9 is read after the multiply, so the pair must survive.
    let stream = optimize(vec![
        movz_plain(xreg(9), 8),
        mul(xreg(10), xreg(11), xreg(9)),
        add_reg(xreg(12), xreg(12), xreg(9)),
    ]);
    assert_eq!(stream.len(), 3);
    assert_eq!(stream[0].assembly_text, "movz x9, #8");
}

#[test]
fn divide_by_power_of_two() {
    let stream = optimize(vec![
        movz_plain(xreg(9), 4),
        sdiv(xreg(10), xreg(11), xreg(9)),
    ]);
    assert_eq!(texts(&stream), vec!["asr x10, x11, #2"]);
}

#[test]
fn compare_zero_branch_fusion() {
    let stream = optimize(vec![
        cmp_imm(xreg(5), 0).unwrap(),
        b_cond(Cond::Eq, "Lend"),
    ]);
    assert_eq!(texts(&stream), vec!["cbz x5, Lend"]);

    let stream = optimize(vec![
        cmp_imm(xreg(5), 0).unwrap(),
        b_cond(Cond::Ne, "Lend"),
    ]);
    assert_eq!(texts(&stream), vec!["cbnz x5, Lend"]);
}

#[test]
fn compare_zero_other_conditions_do_not_fuse() {
    let stream = optimize(vec![
        cmp_imm(xreg(5), 0).unwrap(),
        b_cond(Cond::Lt, "Lend"),
    ]);
    assert_eq!(stream.len(), 2);
}

#[test]
fn add_immediate_fusion() {
    let stream = optimize(vec![
        add_imm(xreg(0), xreg(1), 100).unwrap(),
        add_imm(xreg(0), xreg(0), 200).unwrap(),
    ]);
    assert_eq!(texts(&stream), vec!["add x0, x1, #300"]);
}

#[test]
fn add_immediate_fusion_respects_range() {
    let stream = optimize(vec![
        add_imm(xreg(0), xreg(1), 4000).unwrap(),
        add_imm(xreg(0), xreg(0), 200).unwrap(),
    ]);
    assert_eq!(stream.len(), 2);
}

#[test]
fn load_store_forwarding() {
    let stream = optimize(vec![
        str_imm(xreg(3), xreg(29), -16).unwrap(),
        add_imm(xreg(4), xreg(4), 1).unwrap(),
        ldr_imm(xreg(5), xreg(29), -16).unwrap(),
    ]);
    assert_eq!(
        texts(&stream),
        vec![
            "stur x3, [x29, #-16]",
            "add x4, x4, #1",
            "mov x5, x3",
        ]
    );
}

#[test]
fn load_store_forwarding_aborts_on_clobber() {
    // The stored register is overwritten in between.
    let stream = optimize(vec![
        str_imm(xreg(3), xreg(29), -16).unwrap(),
        add_imm(xreg(3), xreg(3), 1).unwrap(),
        ldr_imm(xreg(5), xreg(29), -16).unwrap(),
    ]);
    assert_eq!(stream.len(), 3);
    assert!(stream[2].assembly_text.starts_with("ldur"));
}

#[test]
fn load_store_forwarding_aborts_on_intervening_store() {
    let stream = optimize(vec![
        str_imm(xreg(3), xreg(29), 16).unwrap(),
        str_imm(xreg(4), xreg(29), 16).unwrap(),
        ldr_imm(xreg(5), xreg(29), 16).unwrap(),
    ]);
    // Dead-store elimination may drop the first store, but the load must
    // not forward x3.
    assert!(!texts(&stream).contains(&"mov x5, x3".to_string()));
}

#[test]
fn fma_fusion() {
    let stream = optimize(vec![
        fmul(dreg(0), dreg(1), dreg(2)),
        fadd(dreg(0), dreg(0), dreg(3)),
    ]);
    assert_eq!(texts(&stream), vec!["fmadd d0, d1, d2, d3"]);
}

#[test]
fn fms_fusion_minuend_form() {
    // d0 := d3 - d1*d2 is exactly FMSUB.
    let stream = optimize(vec![
        fmul(dreg(0), dreg(1), dreg(2)),
        fsub(dreg(0), dreg(3), dreg(0)),
    ]);
    assert_eq!(texts(&stream), vec!["fmsub d0, d1, d2, d3"]);
}

#[test]
fn boolean_check_simplification() {
    let stream = optimize(vec![
        cmp_reg(xreg(1), xreg(2)),
        cset(xreg(3), Cond::Lt),
        cmp_reg(xreg(3), xreg(31)),
        b_cond(Cond::Ne, "Lbody"),
    ]);
    assert_eq!(texts(&stream), vec!["cmp x1, x2", "b.lt Lbody"]);
}

#[test]
fn boolean_check_with_eq_inverts() {
    let stream = optimize(vec![
        cmp_reg(xreg(1), xreg(2)),
        cset(xreg(3), Cond::Lt),
        cmp_reg(xreg(3), xreg(31)),
        b_cond(Cond::Eq, "Lskip"),
    ]);
    assert_eq!(texts(&stream), vec!["cmp x1, x2", "b.ge Lskip"]);
}

#[test]
fn redundant_move_is_dropped() {
    let stream = optimize(vec![
        mov_reg(xreg(7), xreg(7)),
        add_imm(xreg(0), xreg(0), 1).unwrap(),
    ]);
    assert_eq!(texts(&stream), vec!["add x0, x0, #1"]);
}

#[test]
fn dead_store_is_dropped() {
    let stream = optimize(vec![
        str_imm(xreg(1), xreg(29), 32).unwrap(),
        add_imm(xreg(2), xreg(2), 1).unwrap(),
        str_imm(xreg(3), xreg(29), 32).unwrap(),
    ]);
    assert_eq!(
        texts(&stream),
        vec!["add x2, x2, #1", "str x3, [x29, #32]"]
    );
}

#[test]
fn redundant_compare_is_dropped() {
    let stream = optimize(vec![
        cmp_reg(xreg(1), xreg(2)),
        add_imm(xreg(0), xreg(0), 1).unwrap(),
        cmp_reg(xreg(3), xreg(4)),
        cset(xreg(5), Cond::Lt),
    ]);
    assert_eq!(
        texts(&stream),
        vec!["add x0, x0, #1", "cmp x3, x4", "cset x5, lt"]
    );
}

#[test]
fn consumed_compare_survives() {
    let stream = optimize(vec![
        cmp_reg(xreg(1), xreg(2)),
        cset(xreg(5), Cond::Lt),
        cmp_reg(xreg(3), xreg(4)),
        cset(xreg(6), Cond::Lt),
    ]);
    assert_eq!(stream.len(), 4);
}

#[test]
fn mov_alu_fusion() {
    let stream = optimize(vec![
        movz_plain(xreg(9), 42),
        add_reg(xreg(0), xreg(1), xreg(9)),
    ]);
    assert_eq!(texts(&stream), vec!["add x0, x1, #42"]);
}

#[test]
fn mov_alu_fusion_sub_first_operand_falls_back() {
    // SUB Xd, #imm, Xm does not exist; the pair must stay.
    let stream = optimize(vec![
        movz_plain(xreg(9), 42),
        sub_reg(xreg(0), xreg(9), xreg(1)),
    ]);
    assert_eq!(stream.len(), 2);
}

#[test]
fn mov_alu_fusion_sub_second_operand() {
    let stream = optimize(vec![
        movz_plain(xreg(9), 42),
        sub_reg(xreg(0), xreg(1), xreg(9)),
    ]);
    assert_eq!(texts(&stream), vec!["sub x0, x1, #42"]);
}

#[test]
fn mov_alu_fusion_checks_encodability() {
    // 4097 is not a valid arithmetic immediate.
    let stream = optimize(vec![
        movz_plain(xreg(9), 4097),
        add_reg(xreg(0), xreg(1), xreg(9)),
    ]);
    assert_eq!(stream.len(), 2);
}

#[test]
fn mov_alu_fusion_logical_immediate() {
    // 0xff is a valid bitmask immediate for AND.
    let stream = optimize(vec![
        movz_plain(xreg(9), 0xff),
        and_reg(xreg(0), xreg(1), xreg(9)),
    ]);
    assert_eq!(texts(&stream), vec!["and x0, x1, #255"]);
}

#[test]
fn csel_same_register_becomes_mov() {
    let stream = optimize(vec![
        csel(xreg(0), xreg(1), xreg(1), Cond::Lt),
        add_reg(xreg(2), xreg(2), xreg(0)),
    ]);
    assert_eq!(
        texts(&stream),
        vec!["mov x0, x1", "add x2, x2, x0"]
    );
}

#[test]
fn csel_zero_zero_becomes_mov_from_xzr() {
    let stream = optimize(vec![
        csel(xreg(0), xreg(31), xreg(31), Cond::Lt),
        add_reg(xreg(2), xreg(2), xreg(0)),
    ]);
    assert_eq!(
        texts(&stream),
        vec!["mov x0, xzr", "add x2, x2, x0"]
    );
}

#[test]
fn bitfield_extract() {
    let stream = optimize(vec![
        lsr_imm(xreg(0), xreg(1), 8).unwrap(),
        and_imm(xreg(0), xreg(0), 0xff).unwrap(),
    ]);
    assert_eq!(texts(&stream), vec!["ubfx x0, x1, #8, #8"]);
}

#[test]
fn address_generation_merges_offsets() {
    let stream = optimize(vec![
        add_imm(xreg(0), xreg(1), 16).unwrap(),
        ldr_imm(xreg(2), xreg(0), 8).unwrap(),
    ]);
    assert_eq!(texts(&stream), vec!["ldr x2, [x1, #24]"]);
}

#[test]
fn address_generation_register_offset() {
    let stream = optimize(vec![
        add_reg(xreg(0), xreg(1), xreg(2)),
        ldr_imm(xreg(0), xreg(0), 0).unwrap(),
    ]);
    assert_eq!(texts(&stream), vec!["ldr x0, [x1, x2]"]);
}

#[test]
fn address_generation_keeps_live_address() {
    // x0 (the computed address) is used again: no folding.
    let stream = optimize(vec![
        add_imm(xreg(0), xreg(1), 16).unwrap(),
        str_imm(xreg(2), xreg(0), 0).unwrap(),
        str_imm(xreg(3), xreg(0), 8).unwrap(),
    ]);
    assert_eq!(stream.len(), 3);
}

#[test]
fn adrp_fusion() {
    let stream = optimize(vec![
        adrp(xreg(0), "G_table"),
        add_lo12(xreg(0), xreg(0), "G_table"),
    ]);
    assert_eq!(texts(&stream), vec!["adr x0, G_table"]);
}

#[test]
fn constant_overwrite_folds() {
    let stream = optimize(vec![
        movz_plain(xreg(0), 1),
        movz_plain(xreg(0), 2),
        add_reg(xreg(1), xreg(1), xreg(0)),
    ]);
    assert_eq!(stream.len(), 2);
    assert_eq!(stream[0].assembly_text, "movz x0, #2");
}

#[test]
fn movz_zero_movk_folds_to_shifted_movz() {
    let stream = optimize(vec![
        movz_plain(xreg(0), 0),
        movk(xreg(0), 0xbeef, 16, Reloc::None, "").unwrap(),
        add_reg(xreg(1), xreg(1), xreg(0)),
    ]);
    assert_eq!(stream[0].assembly_text, "movz x0, #48879, lsl #16");
}

#[test]
fn relocated_sequences_are_not_folded() {
    let mut insts = load_constant(xreg(0), 0, "G_sym").into_vec();
    insts.push(add_reg(xreg(1), xreg(1), xreg(0)));
    let before = insts.len();
    let stream = optimize(insts);
    assert_eq!(stream.len(), before);
}

#[test]
fn labels_fence_rewrites() {
    let stream = optimize(vec![
        cmp_imm(xreg(5), 0).unwrap(),
        Instruction::label_def("Lmid"),
        b_cond(Cond::Eq, "Lend"),
    ]);
    assert_eq!(stream.len(), 3);
}

#[test]
fn calls_fence_rewrites() {
    // A window may not span a BL.
    let stream = optimize(vec![
        str_imm(xreg(3), xreg(29), 16).unwrap(),
        bl("WRITES"),
        ldr_imm(xreg(5), xreg(29), 16).unwrap(),
    ]);
    assert_eq!(stream.len(), 3);
    assert!(stream[2].assembly_text.starts_with("ldr"));
}

#[test]
fn passes_never_grow_the_stream() {
    let insts = vec![
        movz_plain(xreg(9), 8),
        mul(xreg(10), xreg(11), xreg(9)),
        cmp_imm(xreg(10), 0).unwrap(),
        b_cond(Cond::Eq, "Lend"),
        add_imm(xreg(0), xreg(1), 100).unwrap(),
        add_imm(xreg(0), xreg(0), 200).unwrap(),
        ret(),
    ];
    let before = insts.len();
    let stream = optimize(insts);
    assert!(stream.len() <= before);
}

#[test]
fn optimizer_is_idempotent_at_fixed_point() {
    let insts = vec![
        movz_plain(xreg(9), 8),
        mul(xreg(10), xreg(11), xreg(9)),
        cmp_imm(xreg(10), 0).unwrap(),
        b_cond(Cond::Eq, "Lend"),
        str_imm(xreg(3), xreg(29), -16).unwrap(),
        add_imm(xreg(4), xreg(4), 1).unwrap(),
        ldr_imm(xreg(5), xreg(29), -16).unwrap(),
        ret(),
    ];
    let once = optimize(insts);
    let twice = {
        let mut stream = once.clone();
        let mut optimizer = PeepholeOptimizer::new(&Flags::default());
        optimizer.optimize(&mut stream);
        stream
    };
    assert_eq!(texts(&once), texts(&twice));
}

#[test]
fn stats_record_applied_patterns() {
    let mut stream = InstructionStream::from_instructions(vec![
        movz_plain(xreg(9), 8),
        mul(xreg(10), xreg(11), xreg(9)),
    ]);
    let mut optimizer = PeepholeOptimizer::new(&Flags::default());
    optimizer.optimize(&mut stream);
    let stats = optimizer.stats();
    assert_eq!(stats.optimizations_applied, 1);
    assert_eq!(
        stats.pattern_matches["multiply by power of two to shift"],
        1
    );
}

#[test]
fn max_passes_bounds_iteration() {
    let mut flags = Flags::default();
    flags.max_peephole_passes = 1;
    let mut stream = InstructionStream::from_instructions(vec![
        movz_plain(xreg(9), 8),
        mul(xreg(10), xreg(11), xreg(9)),
    ]);
    let mut optimizer = PeepholeOptimizer::new(&flags);
    optimizer.optimize(&mut stream);
    assert_eq!(optimizer.stats().passes, 1);
}
