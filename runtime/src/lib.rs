//! Runtime support for programs emitted by bcplc: the tracked heap
//! allocator for BCPL vectors and strings, and the async-signal-safe
//! diagnostics the fatal-signal handler prints from.
//!
//! The block-tracking ring is process-global by design: the emitted
//! program has one heap, and the signal handler must be able to walk it
//! without acquiring anything.

#![allow(clippy::missing_safety_doc)]

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod heap;
        pub mod signal_safe;

        pub use heap::{AllocKind, HeapManager, ALIGNMENT, MAX_HEAP_BLOCKS};
        pub use signal_safe::safe_print;
    } else {
        compile_error!("bcplc-runtime targets unix (AArch64 macOS/Linux)");
    }
}
