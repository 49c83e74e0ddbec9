//! The closed error taxonomy reported by every fallible operation.
//!
//! This mirrors the original `dmalloc`'s `error_val.h` code list one-to-one
//! (grouped the same way: setup, pointer validity, allocation, free,
//! administrative), but as a Rust enum with `Display`/`Error` impls instead
//! of an `int` plus a side lookup table.

use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

/// Every error this crate can report, across every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DmallocError {
    // setup
    /// Configuration was malformed beyond repair.
    BadSetup,
    /// A public entry point was re-entered from the same execution context
    /// (typically: the log sink calling back into the allocator).
    InTwice,
    /// The lock was required but never configured.
    LockNotConfig,

    // pointer validity
    /// A `free`/`realloc` pointer argument was null and the configuration
    /// does not permit that silently.
    IsNull,
    /// Pointer does not lie within `[heap_low, heap_high)`.
    NotInHeap,
    /// Pointer does not correspond to any known allocation.
    NotFound,
    /// The address watchpoint (`addr=`) matched.
    IsFound,
    /// Recorded source-file pointer failed sanity checks.
    BadFile,
    /// Recorded source line number failed sanity checks.
    BadLine,
    /// The lower fence-post does not hold `BOTTOM_FENCE`.
    UnderFence,
    /// The upper fence-post does not hold `TOP_FENCE`.
    OverFence,
    /// A write through the pointer would exceed its allocation.
    WouldOverwrite,
    /// Pointer is not the start of a `start-of-user` run.
    NotStartBlock,
    /// Pointer is not aligned to its divided-block slot size.
    NotOnBlock,

    // allocation
    /// Zero-size request and the configuration forbids it.
    BadSize,
    /// Requested size exceeds the largest supported size class.
    TooBig,
    /// The page source failed to produce more memory.
    AllocFailed,
    /// A configured allocation limit (bytes or count) was exceeded.
    OverLimit,
    /// The page source reported more external (non-contiguous) regions
    /// than the block directory can register at once.
    ExternalHuge,

    // free
    /// The pointer's slot was already on a free list.
    AlreadyFree,
    /// Freed memory's poison pattern was overwritten (use-after-free).
    FreeOverwritten,
    /// Two free descriptors ended up adjacent (coalescing invariant broken).
    FreeNonContig,

    // administrative
    BadAdminList,
    BadAdminMagic,
    BadAdminCount,
    BadFreeList,
    BadFlag,
    BadBlockOrder,
    BadDblockSize,
    BadDblockPointer,
    BadDblockMem,
    BadDbadminSlot,
    BadDbadminPointer,
    BadDbadminMagic,
    AllocNonLinear,
    BadSizeInfo,
}

impl DmallocError {
    /// The original's error-string table, carried over verbatim in meaning.
    pub const fn description(self) -> &'static str {
        use DmallocError::*;
        match self {
            BadSetup => "dmallox initialization and setup failed",
            InTwice => "dmallox has gone recursive",
            LockNotConfig => "dmallox locking has not been configured",
            IsNull => "pointer is null",
            NotInHeap => "pointer is not pointing to heap data space",
            NotFound => "cannot locate pointer in heap",
            IsFound => "found the pointer the caller was watching for",
            BadFile => "possibly bad source-file-name pointer",
            BadLine => "possibly bad source line number",
            UnderFence => "failed UNDER picket-fence magic-number check",
            OverFence => "failed OVER picket-fence magic-number check",
            WouldOverwrite => "use of pointer would exceed allocation",
            NotStartBlock => "pointer is not to start of memory block",
            NotOnBlock => "pointer is not on a divided-block slot boundary",
            BadSize => "invalid allocation size",
            TooBig => "largest maximum allocation size exceeded",
            AllocFailed => "could not grow heap by allocating memory",
            OverLimit => "over caller-specified allocation limit",
            ExternalHuge => "too many non-contiguous page-source regions",
            AlreadyFree => "tried to free a previously freed pointer",
            FreeOverwritten => "free space has been overwritten",
            FreeNonContig => "two free runs ended up adjacent",
            BadAdminList => "bad admin structure list",
            BadAdminMagic => "descriptor page magic-number corruption",
            BadAdminCount => "descriptor page position-counter corruption",
            BadFreeList => "free-list cross-check failed",
            BadFlag => "descriptor carries an unrecognized role flag",
            BadBlockOrder => "user-continuation block is not contiguous",
            BadDblockSize => "divided-block size-class is inconsistent",
            BadDblockPointer => "divided-block raw pointer is inconsistent",
            BadDblockMem => "divided-block memory region is corrupt",
            BadDbadminSlot => "mini-slot-descriptor slot is corrupt",
            BadDbadminPointer => "mini-slot-descriptor pointer is corrupt",
            BadDbadminMagic => "mini-slot-descriptor page magic is corrupt",
            AllocNonLinear => "page source returned a non-contiguous region",
            BadSizeInfo => "recorded size information is inconsistent",
        }
    }
}

impl fmt::Display for DmallocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl std::error::Error for DmallocError {}

/// Process-wide last-error slot (spec.md §7). Supplements, never replaces,
/// the `Result` returned by public operations.
static LAST_ERROR: AtomicI32 = AtomicI32::new(0);

/// Encode `None` as `0` (no error recorded yet) and any [`DmallocError`] as
/// `discriminant + 1`, matching the "none is reserved" convention in the
/// original's `error_val.h`.
fn encode(err: Option<DmallocError>) -> i32 {
    match err {
        None => 0,
        Some(e) => e as i32 + 1,
    }
}

/// Record `err` (or clear it with `None`) in the process-wide last-error
/// slot. Called by every fallible public operation before it returns.
pub fn set_last_error(err: Option<DmallocError>) {
    LAST_ERROR.store(encode(err), Ordering::Relaxed);
}

/// Read back whatever [`set_last_error`] last recorded.
pub fn last_error() -> Option<DmallocError> {
    let raw = LAST_ERROR.load(Ordering::Relaxed);
    if raw == 0 {
        return None;
    }
    // SAFETY net: only values produced by `encode` are ever stored, so this
    // round-trips; `ALL` is kept in sync by the exhaustive match above.
    ALL.get((raw - 1) as usize).copied()
}

/// All variants in declaration order, used only to decode [`last_error`].
const ALL: [DmallocError; 36] = {
    use DmallocError::*;
    [
        BadSetup,
        InTwice,
        LockNotConfig,
        IsNull,
        NotInHeap,
        NotFound,
        IsFound,
        BadFile,
        BadLine,
        UnderFence,
        OverFence,
        WouldOverwrite,
        NotStartBlock,
        NotOnBlock,
        BadSize,
        TooBig,
        AllocFailed,
        OverLimit,
        ExternalHuge,
        AlreadyFree,
        FreeOverwritten,
        FreeNonContig,
        BadAdminList,
        BadAdminMagic,
        BadAdminCount,
        BadFreeList,
        BadFlag,
        BadBlockOrder,
        BadDblockSize,
        BadDblockPointer,
        BadDblockMem,
        BadDbadminSlot,
        BadDbadminPointer,
        BadDbadminMagic,
        AllocNonLinear,
        BadSizeInfo,
    ]
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_last_error_slot() {
        set_last_error(Some(DmallocError::UnderFence));
        assert_eq!(last_error(), Some(DmallocError::UnderFence));

        set_last_error(None);
        assert_eq!(last_error(), None);
    }

    #[test]
    fn description_is_non_empty_for_every_variant() {
        assert!(!DmallocError::TooBig.description().is_empty());
        assert!(!DmallocError::BadSizeInfo.description().is_empty());
    }
}
