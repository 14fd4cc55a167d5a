//! Tracked vector and string allocations for the emitted program.
//!
//! Layouts (payload pointers are what BCPL code holds):
//!
//! ```text
//! vector:  [u64 length][length x u64 elements]        payload -> first element
//! string:  [u64 length][(length+1) x u32 points]      payload -> first point, NUL-terminated
//! ```
//!
//! Every allocation is registered in a global 128-slot ring so the fatal
//! signal handler can report live blocks. The ring is per-slot atomics:
//! the signal-context reader never takes a lock, and the emitted program
//! is single-threaded, so relaxed ordering suffices. When the rolling
//! index wraps, older records are overwritten and the dump says so.

use crate::signal_safe::{encode_utf8_char, i64_to_dec, safe_print, u64_to_hex};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use log::trace;
use std::io::Write;

/// Capacity of the block-tracking ring.
pub const MAX_HEAP_BLOCKS: usize = 128;
/// Allocation alignment in bytes.
pub const ALIGNMENT: usize = 16;

const WORD: usize = core::mem::size_of::<u64>();

/// What a tracked block holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Unknown,
    Vec,
    String,
    Free,
}

impl AllocKind {
    fn from_u8(value: u8) -> AllocKind {
        match value {
            1 => AllocKind::Vec,
            2 => AllocKind::String,
            3 => AllocKind::Free,
            _ => AllocKind::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            AllocKind::Unknown => 0,
            AllocKind::Vec => 1,
            AllocKind::String => 2,
            AllocKind::Free => 3,
        }
    }
}

struct BlockSlot {
    kind: AtomicUsize,
    address: AtomicUsize,
    size: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: BlockSlot = BlockSlot {
    kind: AtomicUsize::new(0),
    address: AtomicUsize::new(0),
    size: AtomicUsize::new(0),
};

static HEAP_BLOCKS: [BlockSlot; MAX_HEAP_BLOCKS] = [EMPTY_SLOT; MAX_HEAP_BLOCKS];
static HEAP_INDEX: AtomicUsize = AtomicUsize::new(0);
static TRACKING_WRAPPED: AtomicBool = AtomicBool::new(false);

// Process-wide metrics.
static TOTAL_BYTES_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static TOTAL_BYTES_FREED: AtomicUsize = AtomicUsize::new(0);
static TOTAL_ALLOCS: AtomicUsize = AtomicUsize::new(0);
static TOTAL_FREES: AtomicUsize = AtomicUsize::new(0);
static VEC_ALLOCS: AtomicUsize = AtomicUsize::new(0);
static STRING_ALLOCS: AtomicUsize = AtomicUsize::new(0);

fn track_block(kind: AllocKind, address: *mut u8, size: usize) {
    // fetch_add keeps slot assignment unique even when the host embeds the
    // runtime in a threaded test harness; the ring index wraps at use.
    let index = HEAP_INDEX.fetch_add(1, Ordering::Relaxed);
    if index + 1 >= MAX_HEAP_BLOCKS {
        TRACKING_WRAPPED.store(true, Ordering::Relaxed);
    }
    let slot = &HEAP_BLOCKS[index % MAX_HEAP_BLOCKS];
    slot.kind.store(kind.as_u8() as usize, Ordering::Relaxed);
    slot.address.store(address as usize, Ordering::Relaxed);
    slot.size.store(size, Ordering::Relaxed);
}

fn find_block(payload: *mut u8) -> Option<&'static BlockSlot> {
    HEAP_BLOCKS.iter().find(|slot| {
        let address = slot.address.load(Ordering::Relaxed);
        address != 0 && (address + WORD) == payload as usize
    })
}

fn update_alloc_metrics(bytes: usize, kind: AllocKind) {
    TOTAL_BYTES_ALLOCATED.fetch_add(bytes, Ordering::Relaxed);
    TOTAL_ALLOCS.fetch_add(1, Ordering::Relaxed);
    match kind {
        AllocKind::Vec => {
            VEC_ALLOCS.fetch_add(1, Ordering::Relaxed);
        }
        AllocKind::String => {
            STRING_ALLOCS.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
}

fn update_free_metrics(bytes: usize) {
    TOTAL_BYTES_FREED.fetch_add(bytes, Ordering::Relaxed);
    TOTAL_FREES.fetch_add(1, Ordering::Relaxed);
}

/// The runtime allocator for BCPL vectors and strings.
#[derive(Debug, Default)]
pub struct HeapManager {
    trace_enabled: bool,
}

impl HeapManager {
    pub fn new() -> HeapManager {
        HeapManager::default()
    }

    pub fn set_trace_enabled(&mut self, enabled: bool) {
        self.trace_enabled = enabled;
    }

    /// Allocate a vector of `num_elements` 64-bit words. Returns the
    /// payload pointer (the first element), or null on failure. The length
    /// lives at `payload[-1]`.
    pub fn alloc_vec(&self, num_elements: usize) -> *mut u64 {
        let total_size = WORD + num_elements * WORD;
        let base = match aligned_alloc(total_size) {
            Some(base) => base,
            None => {
                safe_print("Error: Vector allocation failed\n");
                return core::ptr::null_mut();
            }
        };
        unsafe {
            let vec = base as *mut u64;
            *vec = num_elements as u64;
            track_block(AllocKind::Vec, base, total_size);
            update_alloc_metrics(total_size, AllocKind::Vec);
            if self.trace_enabled {
                trace!("allocated vector: address={base:p}, size={total_size}, elements={num_elements}");
            }
            vec.add(1)
        }
    }

    /// Allocate a string of `num_chars` 32-bit code points plus a NUL
    /// terminator. Returns the payload pointer (the first code point), or
    /// null on failure.
    pub fn alloc_string(&self, num_chars: usize) -> *mut u32 {
        let total_size = WORD + (num_chars + 1) * core::mem::size_of::<u32>();
        let base = match aligned_alloc(total_size) {
            Some(base) => base,
            None => {
                safe_print("Error: String allocation failed\n");
                return core::ptr::null_mut();
            }
        };
        unsafe {
            let header = base as *mut u64;
            *header = num_chars as u64;
            let payload = header.add(1) as *mut u32;
            *payload.add(num_chars) = 0;
            track_block(AllocKind::String, base, total_size);
            update_alloc_metrics(total_size, AllocKind::String);
            if self.trace_enabled {
                trace!("allocated string: address={base:p}, size={total_size}, chars={num_chars}");
            }
            payload
        }
    }

    /// Resize a vector in place (via `realloc`), preserving its tracking
    /// record. Returns the (possibly moved) payload, or null on failure.
    pub fn resize_vec(&self, payload: *mut u64, new_num_elements: usize) -> *mut u64 {
        if payload.is_null() {
            safe_print("Error: Cannot resize a NULL vector\n");
            return core::ptr::null_mut();
        }
        let slot = match find_block(payload as *mut u8) {
            Some(slot) => slot,
            None => {
                safe_print("Error: Vector not found in heap tracking\n");
                return core::ptr::null_mut();
            }
        };
        if AllocKind::from_u8(slot.kind.load(Ordering::Relaxed) as u8) != AllocKind::Vec {
            safe_print("Error: Attempt to resize a non-vector block\n");
            return core::ptr::null_mut();
        }
        let new_total = WORD + new_num_elements * WORD;
        unsafe {
            let old_base = slot.address.load(Ordering::Relaxed) as *mut libc::c_void;
            let new_base = libc::realloc(old_base, new_total);
            if new_base.is_null() {
                safe_print("Error: Vector resize failed\n");
                return core::ptr::null_mut();
            }
            slot.address.store(new_base as usize, Ordering::Relaxed);
            slot.size.store(new_total, Ordering::Relaxed);
            let vec = new_base as *mut u64;
            *vec = new_num_elements as u64;
            vec.add(1)
        }
    }

    /// Resize a string in place, preserving tracking and the terminator.
    pub fn resize_string(&self, payload: *mut u32, new_num_chars: usize) -> *mut u32 {
        if payload.is_null() {
            safe_print("Error: Cannot resize a NULL string\n");
            return core::ptr::null_mut();
        }
        let slot = match find_block(payload as *mut u8) {
            Some(slot) => slot,
            None => {
                safe_print("Error: String not found in heap tracking\n");
                return core::ptr::null_mut();
            }
        };
        if AllocKind::from_u8(slot.kind.load(Ordering::Relaxed) as u8) != AllocKind::String {
            safe_print("Error: Attempt to resize a non-string block\n");
            return core::ptr::null_mut();
        }
        let new_total = WORD + (new_num_chars + 1) * core::mem::size_of::<u32>();
        unsafe {
            let old_base = slot.address.load(Ordering::Relaxed) as *mut libc::c_void;
            let new_base = libc::realloc(old_base, new_total);
            if new_base.is_null() {
                safe_print("Error: String resize failed\n");
                return core::ptr::null_mut();
            }
            slot.address.store(new_base as usize, Ordering::Relaxed);
            slot.size.store(new_total, Ordering::Relaxed);
            let header = new_base as *mut u64;
            *header = new_num_chars as u64;
            let payload = header.add(1) as *mut u32;
            *payload.add(new_num_chars) = 0;
            payload
        }
    }

    /// Free a tracked allocation by its payload pointer. Freeing an
    /// untracked pointer is reported and otherwise ignored.
    pub fn free(&self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        let slot = match find_block(payload) {
            Some(slot) => slot,
            None => {
                safe_print("Error: Attempt to free untracked memory\n");
                return;
            }
        };
        let size = slot.size.load(Ordering::Relaxed);
        unsafe {
            libc::free(slot.address.load(Ordering::Relaxed) as *mut libc::c_void);
        }
        update_free_metrics(size);
        slot.kind.store(AllocKind::Free.as_u8() as usize, Ordering::Relaxed);
        slot.size.store(0, Ordering::Relaxed);
        slot.address.store(0, Ordering::Relaxed);
        if self.trace_enabled {
            trace!("freed memory: payload={payload:p}");
        }
    }

    /// Human-readable dump of live blocks, for interactive debugging. Uses
    /// ordinary (non-signal-safe) stdio.
    pub fn dump_heap(&self) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "\n=== Heap Allocation Report =======================");
        if TRACKING_WRAPPED.load(Ordering::Relaxed) {
            let _ = writeln!(err, "(tracking ring wrapped; oldest records dropped)");
        }
        let mut active = 0;
        for (index, slot) in HEAP_BLOCKS.iter().enumerate() {
            let kind = AllocKind::from_u8(slot.kind.load(Ordering::Relaxed) as u8);
            if kind != AllocKind::Vec && kind != AllocKind::String {
                continue;
            }
            active += 1;
            let _ = writeln!(
                err,
                "Block {index}: Type={}, Address={:#x}, Size={}",
                if kind == AllocKind::Vec { "Vector" } else { "String" },
                slot.address.load(Ordering::Relaxed),
                slot.size.load(Ordering::Relaxed),
            );
        }
        if active == 0 {
            let _ = writeln!(err, "No active Vector or String allocations found.");
        }
        let _ = writeln!(err, "=== End Allocation Report ========================");
    }

    /// Signal-safe dump: the same report, restricted to async-signal-safe
    /// primitives. Called from the fatal-signal handler.
    pub fn dump_heap_signal_safe(&self) {
        safe_print("\n=== Heap Allocation Report =======================\n");
        if TRACKING_WRAPPED.load(Ordering::Relaxed) {
            safe_print("(tracking ring wrapped; oldest records dropped)\n");
        }

        let mut index_buf = [0u8; 21];
        let mut size_buf = [0u8; 21];
        let mut addr_buf = [0u8; 18];
        let mut content_buf = [0u8; 21];
        let mut utf8_buf = [0u8; 4];
        let mut active = 0;

        for (index, slot) in HEAP_BLOCKS.iter().enumerate() {
            let kind = AllocKind::from_u8(slot.kind.load(Ordering::Relaxed) as u8);
            if kind != AllocKind::Vec && kind != AllocKind::String {
                continue;
            }
            active += 1;
            let address = slot.address.load(Ordering::Relaxed);
            let size = slot.size.load(Ordering::Relaxed);

            safe_print("Block ");
            safe_print(i64_to_dec(index as i64, &mut index_buf));
            safe_print(if kind == AllocKind::Vec {
                ": Type=Vector, Address="
            } else {
                ": Type=String, Address="
            });
            safe_print(u64_to_hex(address as u64, &mut addr_buf));
            safe_print(", Size=");
            safe_print(i64_to_dec(size as i64, &mut size_buf));
            safe_print("\n");

            if address == 0 {
                continue;
            }
            match kind {
                AllocKind::Vec => unsafe {
                    let vec = address as *const u64;
                    let len = *vec as usize;
                    let preview = len.min(8);
                    safe_print("  Content: [");
                    for i in 0..preview {
                        safe_print(i64_to_dec(*vec.add(1 + i) as i64, &mut content_buf));
                        if i + 1 < preview {
                            safe_print(", ");
                        }
                    }
                    if len > preview {
                        safe_print(" ...");
                    }
                    safe_print("]\n");
                },
                AllocKind::String => unsafe {
                    let header = address as *const u64;
                    let len = *header as usize;
                    let chars = header.add(1) as *const u32;
                    let preview = len.min(32);
                    safe_print("  Content: \"");
                    for i in 0..preview {
                        match encode_utf8_char(*chars.add(i), &mut utf8_buf) {
                            Some(s) => safe_print(s),
                            None => safe_print("?"),
                        }
                    }
                    if len > preview {
                        safe_print("...");
                    }
                    safe_print("\"\n");
                },
                _ => {}
            }
        }

        if active == 0 {
            safe_print("No active Vector or String allocations found.\n");
        }
        safe_print("=== End Allocation Report ========================\n");
    }

    /// Print the alloc/free counters.
    pub fn print_metrics(&self) {
        let mut err = std::io::stderr().lock();
        let allocs = TOTAL_ALLOCS.load(Ordering::Relaxed);
        let frees = TOTAL_FREES.load(Ordering::Relaxed);
        let bytes_allocated = TOTAL_BYTES_ALLOCATED.load(Ordering::Relaxed);
        let bytes_freed = TOTAL_BYTES_FREED.load(Ordering::Relaxed);
        let _ = writeln!(err, "\n--- BCPL Runtime Metrics ---");
        let _ = writeln!(err, "Memory allocations: {allocs} ({bytes_allocated} bytes)");
        let _ = writeln!(err, "Memory frees: {frees} ({bytes_freed} bytes)");
        let _ = writeln!(err, "Vector allocations: {}", VEC_ALLOCS.load(Ordering::Relaxed));
        let _ = writeln!(err, "String allocations: {}", STRING_ALLOCS.load(Ordering::Relaxed));
        let _ = writeln!(
            err,
            "Current active allocations: {} ({} bytes)",
            allocs - frees,
            bytes_allocated - bytes_freed
        );
        let _ = writeln!(err, "--------------------------");
    }
}

fn aligned_alloc(size: usize) -> Option<*mut u8> {
    let mut ptr: *mut libc::c_void = core::ptr::null_mut();
    let rc = unsafe { libc::posix_memalign(&mut ptr, ALIGNMENT, size) };
    if rc != 0 || ptr.is_null() {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_layout_and_free() {
        let heap = HeapManager::new();
        let payload = heap.alloc_vec(4);
        assert!(!payload.is_null());
        unsafe {
            // The length word sits just below the payload.
            assert_eq!(*payload.sub(1), 4);
            for i in 0..4 {
                *payload.add(i) = (i as u64) * 10;
            }
            assert_eq!(*payload.add(3), 30);
        }
        // Alignment comes from posix_memalign on the base pointer.
        let base = unsafe { payload.sub(1) } as usize;
        assert_eq!(base % ALIGNMENT, 0);
        heap.free(payload as *mut u8);
    }

    #[test]
    fn string_layout_has_terminator() {
        let heap = HeapManager::new();
        let payload = heap.alloc_string(3);
        assert!(!payload.is_null());
        unsafe {
            let header = (payload as *mut u64).sub(1);
            assert_eq!(*header, 3);
            assert_eq!(*payload.add(3), 0);
            *payload = b'H' as u32;
            *payload.add(1) = b'i' as u32;
            *payload.add(2) = b'!' as u32;
        }
        heap.free(payload as *mut u8);
    }

    #[test]
    fn resize_vec_preserves_tracking() {
        let heap = HeapManager::new();
        let payload = heap.alloc_vec(2);
        unsafe {
            *payload = 7;
            *payload.add(1) = 8;
        }
        let grown = heap.resize_vec(payload, 16);
        assert!(!grown.is_null());
        unsafe {
            assert_eq!(*grown.sub(1), 16);
            assert_eq!(*grown, 7);
            assert_eq!(*grown.add(1), 8);
        }
        heap.free(grown as *mut u8);
    }

    #[test]
    fn resize_rejects_kind_mismatch() {
        let heap = HeapManager::new();
        let payload = heap.alloc_string(4);
        let resized = heap.resize_vec(payload as *mut u64, 8);
        assert!(resized.is_null());
        heap.free(payload as *mut u8);
    }

    #[test]
    fn free_untracked_is_reported_not_fatal() {
        let heap = HeapManager::new();
        let mut local = 0u64;
        heap.free(&mut local as *mut u64 as *mut u8);
    }

    #[test]
    fn metrics_count_allocations() {
        let heap = HeapManager::new();
        let before = TOTAL_ALLOCS.load(Ordering::Relaxed);
        let v = heap.alloc_vec(1);
        let s = heap.alloc_string(1);
        assert!(TOTAL_ALLOCS.load(Ordering::Relaxed) >= before + 2);
        heap.free(v as *mut u8);
        heap.free(s as *mut u8);
        heap.print_metrics();
    }

    #[test]
    fn signal_safe_dump_runs() {
        let heap = HeapManager::new();
        let v = heap.alloc_vec(3);
        unsafe {
            *v = 1;
            *v.add(1) = 2;
            *v.add(2) = 3;
        }
        let s = heap.alloc_string(2);
        unsafe {
            *s = b'o' as u32;
            *s.add(1) = b'k' as u32;
        }
        heap.dump_heap_signal_safe();
        heap.dump_heap();
        heap.free(v as *mut u8);
        heap.free(s as *mut u8);
    }
}
