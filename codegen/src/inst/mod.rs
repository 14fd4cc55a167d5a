//! The machine instruction model: a flat record per emitted AArch64
//! instruction carrying the 32-bit encoding, the printable assembly text,
//! and the semantic fields the optimizer works from.
//!
//! Invariant: for every non-directive instruction the semantic fields
//! (opcode, registers, immediate) agree with `encoding` and
//! `assembly_text`. Rewrite passes read the semantic fields only; the text
//! is pretty-printer output.

use core::fmt;

pub mod emit;
pub mod imms;
pub mod regs;

pub use emit::*;
pub use imms::*;
pub use regs::*;

#[cfg(test)]
mod emit_tests;

/// Semantic opcode tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpType {
    Unknown,
    // Moves
    Mov,
    Movz,
    Movk,
    Fmov,
    // Integer arithmetic / logic
    Add,
    Sub,
    Subs,
    Mul,
    Madd,
    Msub,
    Sdiv,
    Udiv,
    And,
    Orr,
    Eor,
    Cmp,
    // Float arithmetic
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fmadd,
    Fmsub,
    Fcmp,
    // Conversion
    Scvtf,
    Fcvtzs,
    // Loads / stores
    Ldr,
    Str,
    Ldrb,
    Strb,
    Ldp,
    Stp,
    // Control flow
    B,
    Bl,
    Br,
    Blr,
    Ret,
    BCond,
    Cbz,
    Cbnz,
    Adr,
    Adrp,
    // Bitfield & shift
    Lsl,
    Lsr,
    Asr,
    Ubfx,
    Sbfx,
    // Conditional
    Csel,
    Cset,
    Csetm,
    Csinv,
    // Vector/SIMD
    AddVec,
    MulVec,
    FaddVec,
    FmlaVec,
    Ld1Vec,
    // System / pseudo
    Nop,
    Svc,
    Brk,
    Udf,
    Dmb,
    Dsb,
    Isb,
    Msr,
    Mrs,
    Directive,
}

impl OpType {
    /// Does this opcode write the NZCV flags?
    pub fn sets_flags(self) -> bool {
        matches!(self, OpType::Cmp | OpType::Subs | OpType::Fcmp)
    }

    /// Does this opcode read the NZCV flags?
    pub fn reads_flags(self) -> bool {
        matches!(
            self,
            OpType::BCond | OpType::Csel | OpType::Cset | OpType::Csetm | OpType::Csinv
        )
    }
}

/// A condition code for B.cond / CSEL-family instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

impl Cond {
    /// The 4-bit condition encoding.
    pub fn bits(self) -> u32 {
        match self {
            Cond::Eq => 0b0000,
            Cond::Ne => 0b0001,
            Cond::Cs => 0b0010,
            Cond::Cc => 0b0011,
            Cond::Mi => 0b0100,
            Cond::Pl => 0b0101,
            Cond::Vs => 0b0110,
            Cond::Vc => 0b0111,
            Cond::Hi => 0b1000,
            Cond::Ls => 0b1001,
            Cond::Ge => 0b1010,
            Cond::Lt => 0b1011,
            Cond::Gt => 0b1100,
            Cond::Le => 0b1101,
            Cond::Al => 0b1110,
        }
    }

    /// The logically inverted condition.
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Al,
        }
    }

    /// Assembler mnemonic suffix.
    pub fn name(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Cs => "cs",
            Cond::Cc => "cc",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Vs => "vs",
            Cond::Vc => "vc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Al => "al",
        }
    }
}

/// A shift operator attached to a register operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Lsl,
    Lsr,
    Asr,
}

impl ShiftOp {
    pub fn bits(self) -> u32 {
        match self {
            ShiftOp::Lsl => 0b00,
            ShiftOp::Lsr => 0b01,
            ShiftOp::Asr => 0b10,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShiftOp::Lsl => "lsl",
            ShiftOp::Lsr => "lsr",
            ShiftOp::Asr => "asr",
        }
    }
}

/// Relocation tag: tells the linker/JIT loader which bits of the encoding
/// to patch once the referenced symbol's address is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reloc {
    None,
    /// MOVZ/MOVK absolute-address chunk, bits [15:0].
    MovzMovkImm0,
    /// MOVZ/MOVK chunk, bits [31:16].
    MovzMovkImm16,
    /// MOVZ/MOVK chunk, bits [47:32].
    MovzMovkImm32,
    /// MOVZ/MOVK chunk, bits [63:48].
    MovzMovkImm48,
    /// ADRP page-relative immediate.
    AdrpImm,
    /// ADD :lo12: page-offset immediate.
    AddImmLo12,
    /// 19-bit conditional-branch offset (also CBZ/CBNZ).
    BCond,
    /// 26-bit unconditional-branch offset.
    B26,
    /// 21-bit ADR offset.
    Adr21,
}

/// JIT loader attribute. Instructions carrying one are fenced off from the
/// optimizer because the loader patches or interprets them in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum JitAttr {
    #[default]
    None,
    /// The loader replaces this instruction's immediate with a runtime
    /// address it computes at load time.
    JitAddress,
}

/// One emitted machine instruction (or directive, or label definition).
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    /// The 32-bit machine-code word (low word of the data value for
    /// `.quad` directives).
    pub encoding: u32,
    /// Human-readable assembly. Never parsed for correctness decisions.
    pub assembly_text: String,
    pub opcode: OpType,
    pub dest: Option<Reg>,
    pub src1: Option<Reg>,
    pub src2: Option<Reg>,
    /// Base address register for loads/stores.
    pub base: Option<Reg>,
    pub immediate: i64,
    pub uses_immediate: bool,
    /// Shift attached to the last register operand, if any.
    pub shift: Option<(ShiftOp, u8)>,
    pub cond: Option<Cond>,
    pub target_label: Option<String>,
    pub relocation: Reloc,
    pub is_data_value: bool,
    pub is_label_definition: bool,
    pub jit_attr: JitAttr,
}

impl Instruction {
    /// A bare instruction with only an encoding and text; constructors
    /// fill in the semantic fields.
    pub fn new(encoding: u32, assembly_text: impl Into<String>) -> Instruction {
        Instruction {
            encoding,
            assembly_text: assembly_text.into(),
            opcode: OpType::Unknown,
            dest: None,
            src1: None,
            src2: None,
            base: None,
            immediate: 0,
            uses_immediate: false,
            shift: None,
            cond: None,
            target_label: None,
            relocation: Reloc::None,
            is_data_value: false,
            is_label_definition: false,
            jit_attr: JitAttr::None,
        }
    }

    /// A label definition pseudo-instruction.
    pub fn label_def(name: impl Into<String>) -> Instruction {
        let name = name.into();
        let mut inst = Instruction::new(0, format!("{name}:"));
        inst.opcode = OpType::Directive;
        inst.target_label = Some(name);
        inst.is_label_definition = true;
        inst
    }

    /// A commented no-op that emits nothing (zero encoding, directive
    /// opcode). Used where a spill turned out to be unnecessary.
    pub fn comment(text: impl Into<String>) -> Instruction {
        let mut inst = Instruction::new(0, format!("// {}", text.into()));
        inst.opcode = OpType::Directive;
        inst
    }

    /// Does this instruction write `reg`?
    pub fn defines(&self, reg: Reg) -> bool {
        self.dest == Some(reg)
    }

    /// Does this instruction read `reg` (as a source or base operand)?
    pub fn reads(&self, reg: Reg) -> bool {
        self.src1 == Some(reg) || self.src2 == Some(reg) || self.base == Some(reg)
    }
}

/// Register equality where either side may be absent: absent operands never
/// compare equal to anything.
pub fn same_reg(a: Option<Reg>, b: Option<Reg>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.assembly_text)
    }
}
