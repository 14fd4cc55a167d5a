//! Result and error types for the code generation core.

use thiserror::Error;

/// An error produced while generating code.
///
/// Structural-misuse variants indicate a bug in the compiler itself (a
/// phase calling the core out of order); they abort the compilation of the
/// current program rather than being recovered from.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("invalid register name '{0}'")]
    InvalidRegisterName(String),

    #[error("immediate #{value} is not encodable for {op}")]
    ImmediateOutOfRange { op: String, value: i64 },

    #[error("memory offset {0} is out of range")]
    OffsetOutOfRange(i64),

    #[error("shift amount {0} is out of range")]
    ShiftOutOfRange(i64),

    #[error("invalid operand: {0}")]
    InvalidOperand(String),

    #[error("local variable size {0} is not a multiple of 8 bytes")]
    UnalignedLocalSize(usize),

    #[error("cannot add local '{0}' after the prologue is generated")]
    LocalAfterPrologue(String),

    #[error("cannot add local '{0}' after spill slots have been allocated")]
    LocalAfterSpill(String),

    #[error("cannot modify callee-saved set after the prologue is generated")]
    SaveAfterPrologue,

    #[error("prologue generated twice for function '{0}'")]
    PrologueTwice(String),

    #[error("epilogue requested before prologue for function '{0}'")]
    EpilogueBeforePrologue(String),

    #[error("unknown local variable '{0}'")]
    UnknownLocal(String),

    #[error("spill area exhausted for '{0}' (post-prologue demand exceeds reserve)")]
    SpillAreaExhausted(String),

    #[error("register pool exhausted acquiring a register for '{0}'")]
    RegisterPoolExhausted(String),

    #[error("register {0} is not bound to a variable")]
    UnboundRegister(String),

    #[error("duplicate symbol '{0}'")]
    DuplicateSymbol(String),

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("liveness analysis failed in function '{function}': {message}")]
    Liveness { function: String, message: String },
}

/// A convenient alias for the result of a codegen operation.
pub type CodegenResult<T> = Result<T, CodegenError>;
