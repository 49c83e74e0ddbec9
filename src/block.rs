//! Data model (spec.md §3): basic-block descriptors and the tagged payload
//! each role carries.
//!
//! The original stores one `union`-valued payload per descriptor and
//! distinguishes "free" from "in use" by comparing a field against the
//! enclosing block pointer (the hazard spec.md §9 calls out under
//! "Ambiguous free/in-use discrimination"). Here the tag is explicit: a
//! [`Payload`] variant *is* the role, so there is no pointer-equality trick
//! and no aliasing hazard to re-discover during a heap walk.
//!
//! Per spec.md §9 ("Deeply-linked free lists spanning heap pages"), blocks
//! reference each other by [`BlockIndex`] (a position number into the
//! directory's flat descriptor array), never by raw pointer.

use crate::caller::CallerKey;
use std::time::SystemTime;

/// Index of a basic block, counted from the start of the managed heap.
/// Equivalent to the original's "position number".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

/// Per-allocation monotonics (spec.md §4.6: "an overhead record attached to
/// the descriptor captures optional per-allocation monotonics").
#[derive(Debug, Clone, Copy, Default)]
pub struct OverheadRecord {
    /// How many times this (file,line) site has allocated so far.
    pub seen_count: u32,
    /// The global allocator iteration counter at allocation time (used by
    /// delayed reuse, spec.md §5).
    pub iteration: u64,
    /// Wall-clock time of allocation, when the platform clock is available.
    pub timestamp: Option<SystemTime>,
    /// The allocating thread, recorded for diagnostics only: the engine
    /// itself is single-lock-serialized (spec.md §5), this is not used for
    /// synchronization.
    pub thread_id: Option<std::thread::ThreadId>,
}

impl OverheadRecord {
    pub fn capture(seen_count: u32, iteration: u64, record_monotonics: bool) -> Self {
        if record_monotonics {
            Self {
                seen_count,
                iteration,
                timestamp: Some(SystemTime::now()),
                thread_id: Some(std::thread::current().id()),
            }
        } else {
            Self {
                seen_count,
                iteration,
                timestamp: None,
                thread_id: None,
            }
        }
    }
}

/// One free mini-slot's reuse-iteration watermark (spec.md §5: "a freed slot
/// is marked with `iter + delay`").
pub type ReuseIter = Option<u64>;

/// The role-specific payload of a [`BasicBlockDescriptor`].
///
/// This *is* the role tag (spec.md's `bb_flags` plus the union), so
/// `matches!(descriptor.payload, Payload::Free { .. })` answers "is this
/// slot free?" directly, with no possibility of the pointer-aliasing
/// ambiguity spec.md §9 documents as a defect in the original.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Newly carved from the page source, not yet handed to any engine.
    Unused,
    /// The first basic block of a user allocation spanning one or more
    /// blocks. `page_aligned` on the descriptor marks the Valloc variant.
    StartOfUser {
        /// User-requested size, inflated by fence overhead.
        size: usize,
        caller: CallerKey,
        overhead: OverheadRecord,
    },
    /// A basic block belonging to the run started by `run_start`, carrying
    /// no payload of its own (spec.md: "no payload; it belongs to the
    /// immediately preceding start block").
    ContinuationOfUser { run_start: BlockIndex },
    /// The first block of a free run of `run_len` blocks, filed on free
    /// class list `class_bit`.
    Free {
        class_bit: u32,
        run_len: u32,
        reuse_iter: ReuseIter,
    },
    /// A non-start block belonging to the free run starting at `run_start`.
    FreeContinuation { run_start: BlockIndex },
    /// A basic block subdivided into equal mini-slots of size `2^class_bit`.
    DividedBlock {
        class_bit: u32,
        raw: std::ptr::NonNull<u8>,
        slots: Vec<MiniSlot>,
    },
    /// Process-internal bookkeeping block (descriptor directory growth).
    Administrative,
    /// A region the page source reported as non-contiguous with the rest of
    /// the managed heap (spec.md §4.1/§4.3).
    External { len: usize },
}

// SAFETY: `NonNull<u8>` inside `DividedBlock` always points at memory this
// crate owns exclusively behind the allocator's gate; no aliasing occurs
// because every access happens under the single coarse lock (spec.md §5).
unsafe impl Send for Payload {}

/// One mini-slot inside a [`Payload::DividedBlock`].
///
/// Explicit state tag: this is the fix for the hazard spec.md §9 documents
/// ("the unioned file-pointer can coincide with a heap address and confuse
/// the walker"). See `divided.rs` tests for a regression test that
/// constructs a return-address key which aliases a live heap address and
/// confirms the slot is still read correctly.
#[derive(Debug, Clone)]
pub enum MiniSlot {
    Free { reuse_iter: ReuseIter },
    InUse {
        size: u32,
        caller: CallerKey,
        overhead: OverheadRecord,
    },
}

impl MiniSlot {
    pub fn is_free(&self) -> bool {
        matches!(self, MiniSlot::Free { .. })
    }
}

/// One per BLOCK-aligned region under management (spec.md §3).
#[derive(Debug, Clone)]
pub struct BasicBlockDescriptor {
    pub payload: Payload,
    /// Orthogonal "page-aligned-user" bit (spec.md §3): set on the
    /// `Valloc`/`Memalign`-to-a-page-boundary variant of `StartOfUser`.
    pub page_aligned: bool,
}

impl BasicBlockDescriptor {
    pub fn unused() -> Self {
        Self {
            payload: Payload::Unused,
            page_aligned: false,
        }
    }

    pub fn role_char(&self) -> char {
        match &self.payload {
            Payload::Unused => '_',
            Payload::StartOfUser { .. } if self.page_aligned => 'V',
            Payload::StartOfUser { .. } => 'S',
            Payload::ContinuationOfUser { .. } => 'U',
            Payload::Free { .. } | Payload::FreeContinuation { .. } => 'F',
            Payload::DividedBlock { .. } => 'd',
            Payload::Administrative => 'A',
            Payload::External { .. } => 'E',
        }
    }

    pub fn is_free_run_start(&self) -> bool {
        matches!(self.payload, Payload::Free { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_char_matches_the_heap_map_legend() {
        let mut d = BasicBlockDescriptor::unused();
        assert_eq!(d.role_char(), '_');

        d.payload = Payload::StartOfUser {
            size: 8,
            caller: CallerKey::Unknown,
            overhead: OverheadRecord::default(),
        };
        assert_eq!(d.role_char(), 'S');
        d.page_aligned = true;
        assert_eq!(d.role_char(), 'V');
    }

    #[test]
    fn free_and_free_continuation_both_render_as_free() {
        let free = BasicBlockDescriptor {
            payload: Payload::Free {
                class_bit: 12,
                run_len: 2,
                reuse_iter: None,
            },
            page_aligned: false,
        };
        let cont = BasicBlockDescriptor {
            payload: Payload::FreeContinuation {
                run_start: BlockIndex(0),
            },
            page_aligned: false,
        };
        assert_eq!(free.role_char(), 'F');
        assert_eq!(cont.role_char(), 'F');
        assert!(free.is_free_run_start());
        assert!(!cont.is_free_run_start());
    }
}
