//! AArch64 code generation core for the BCPL compiler.
//!
//! The pipeline, leaves first: the front end hands over a typed AST, a
//! symbol table, and per-function metrics; per function, a
//! [`frame::CallFrameManager`] lays out the stack frame, a
//! [`regalloc::RegisterManager`] binds variables to registers with
//! liveness information from [`liveness`], and the [`inst`] encoders
//! produce an [`stream::InstructionStream`] that the
//! [`peephole::PeepholeOptimizer`] rewrites to a fixed point before
//! assembly or JIT loading.

pub mod analysis;
pub mod ast;
pub mod codegen;
pub mod error;
pub mod frame;
pub mod inst;
pub mod liveness;
pub mod peephole;
pub mod regalloc;
pub mod settings;
pub mod stream;
pub mod symbols;

pub use error::{CodegenError, CodegenResult};
