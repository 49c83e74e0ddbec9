//! Allocator context (spec.md §5, §9 "single owning context object"): the
//! process-wide gate, re-entrancy guard, and the glue between
//! [`AllocationCore`], [`IntegrityChecker`] and the transaction logger.

use crate::block::Payload;
use crate::caller::CallerKey;
use crate::checker::{CheckOptions, IntegrityChecker};
use crate::config::{DebugFlags, Options, StartCondition};
use crate::core_alloc::{AllocationCore, Counters, Variant};
use crate::error::{last_error, set_last_error, DmallocError};
use crate::fence::FenceGuard;
use crate::free_index::SelectionPolicy;
use crate::logger::{LineBuffer, LogSink};
use std::cell::Cell;
use std::ptr::NonNull;

const BLOCK_SIZE: usize = 4096;
const SMALLEST_BIT: u32 = 3;
const LARGEST_BIT: u32 = 30;
const ENTRIES_PER_PAGE: u32 = 64;
const MEMORY_TABLE_SIZE: usize = 509;

/// Whether `free(NULL)` is silent, warns, or errors (spec.md §9 open
/// question; resolved per `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullFreePolicy {
    #[default]
    Silent,
    Warn,
    Error,
}

/// Whether `reallocate(ptr, 0)` frees and returns null, or returns a
/// distinct zero-size pointer (spec.md §9 open question; resolved per
/// `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReallocZeroPolicy {
    #[default]
    FreesAndReturnsNull,
    ReturnsZeroSizePointer,
}

thread_local! {
    /// Per-execution-context re-entrancy flag (spec.md §5: "a re-entrancy
    /// flag inside the gate makes a second entry from the same execution
    /// context fail with InTwice"). Thread-local rather than a field behind
    /// the gate itself, since the hazard this guards against is the *same*
    /// thread re-entering through the log sink while already holding the
    /// gate, not a second thread contending for it.
    static ENTERED: Cell<bool> = const { Cell::new(false) };
}

struct Inner {
    core: AllocationCore,
    options: Options,
    log: LogSink,
    allocations_seen: u64,
    checking_started: bool,
    null_free_policy: NullFreePolicy,
    realloc_zero_policy: ReallocZeroPolicy,
    watch_hits: u64,
}

impl Inner {
    fn check_options(&self) -> CheckOptions {
        CheckOptions {
            cross_check_lists: self.options.flags.contains(DebugFlags::CHECK_LISTS),
            verify_poison: self.options.flags.contains(DebugFlags::CHECK_FREE),
            poison_byte: self.core.poison_byte.unwrap_or(0xD0),
            largest_bit: LARGEST_BIT,
        }
    }

    fn run_check_heap(&self) -> Result<(), DmallocError> {
        let checker = IntegrityChecker::new(
            self.core.directory(),
            self.core.free_index(),
            self.core.divided(),
            self.core.fence(),
            self.check_options(),
        );
        checker.check_heap()
    }

    /// Whether checking has reached the configured `start=` threshold yet
    /// (spec.md §6: "delay heap checking until this caller appears, or
    /// until the N-th allocation").
    fn checking_is_due(&mut self, caller: &CallerKey) -> bool {
        if self.checking_started {
            return true;
        }
        match &self.options.start {
            None => {
                self.checking_started = true;
                true
            }
            Some(StartCondition::AllocationCount(n)) => {
                if self.allocations_seen >= *n {
                    self.checking_started = true;
                }
                self.checking_started
            }
            Some(StartCondition::CallSite { file, line }) => {
                if let CallerKey::File { file: f, line: l } = caller {
                    if f == file && l == line {
                        self.checking_started = true;
                    }
                }
                self.checking_started
            }
        }
    }

    fn maybe_check_heap(&mut self, caller: &CallerKey) -> Result<(), DmallocError> {
        if !self.options.flags.contains(DebugFlags::CHECK_HEAP) {
            return Ok(());
        }
        if !self.checking_is_due(caller) {
            return Ok(());
        }
        if let Some(interval) = self.options.interval {
            if interval > 0 && self.core.counters().check_count % interval as u64 != 0 {
                return Ok(());
            }
        }
        let result = self.run_check_heap();
        if result.is_ok() && self.options.flags.contains(DebugFlags::HEAP_CHECK_MAP) {
            self.log_heap_map();
        }
        result
    }

    fn log_trans(&mut self, op: &str, caller: CallerKey, ptr: *mut u8, size: usize) {
        if !self.options.flags.contains(DebugFlags::LOG_TRANS) {
            return;
        }
        let mut line = LineBuffer::new();
        line.push_str(op)
            .push_str(" ")
            .push_caller(&caller)
            .push_str(" ptr=")
            .push_ptr(ptr as usize)
            .push_str(" size=")
            .push_uint(size as u64, 0, false)
            .newline();
        self.log.write_line(&line);
    }

    fn log_heap_map(&mut self) {
        if !self.options.flags.contains(DebugFlags::LOG_BLOCKS) {
            return;
        }
        let map = crate::heap_map::render(self.core.directory());
        let mut line = LineBuffer::new();
        line.push_str("heap-map ").push_str(&map).newline();
        self.log.write_line(&line);
    }

    fn log_admin_growth(&mut self) {
        if !self.options.flags.contains(DebugFlags::LOG_ADMIN) {
            return;
        }
        let mut line = LineBuffer::new();
        line.push_str("admin-blocks=")
            .push_uint(self.core.directory().admin_blocks() as u64, 0, false)
            .newline();
        self.log.write_line(&line);
    }

    /// `addr=ADDR[:N]` (spec.md §6): "kill the process the N-th time the
    /// engine hands out or is handed exactly ADDR". Rendered as `IsFound`
    /// instead of an actual process kill, consistent with the rest of the
    /// crate turning fatal conditions into `Result`s (the `error-abort` flag
    /// is what turns any of them into a real abort).
    fn check_watchpoint(&mut self, ptr: *mut u8) -> Result<(), DmallocError> {
        let Some((addr, n)) = self.options.address_watch else {
            return Ok(());
        };
        if ptr as usize != addr {
            return Ok(());
        }
        self.watch_hits += 1;
        if self.watch_hits >= n as u64 {
            return Err(DmallocError::IsFound);
        }
        Ok(())
    }

    fn note_error(&mut self, err: DmallocError) -> DmallocError {
        set_last_error(Some(err));
        if self.options.flags.contains(DebugFlags::PRINT_ERROR) {
            eprintln!("dmallox: {err}");
        }
        if self.options.flags.contains(DebugFlags::LOG_BAD_SPACE) {
            let mut line = LineBuffer::new();
            line.push_str("error ").push_str(err.description()).newline();
            self.log.write_line(&line);
        }
        if self.options.flags.contains(DebugFlags::ERROR_ABORT) {
            panic!("dmallox: fatal error {err} (error-abort set)");
        }
        err
    }
}

/// The single owning object spec.md §9 asks for: one process-wide
/// [`AllocationCore`] behind a coarse [`spin::Mutex`] gate, reached through
/// `#[track_caller]` entry points. Never cloned; construct once (typically
/// behind a `static`) and share by reference.
pub struct AllocatorContext {
    inner: spin::Mutex<Inner>,
    /// Copy of the flags fixed at construction, read without the gate so the
    /// re-entrant branch of [`Self::gated`] can honor `print-error`/
    /// `error-abort` without re-locking the mutex it's already inside.
    flags: DebugFlags,
}

impl AllocatorContext {
    pub fn new(options: Options) -> Self {
        let fence = if options.flags.contains(DebugFlags::CHECK_FENCE) {
            FenceGuard::new(16, 16)
        } else {
            FenceGuard::disabled()
        };
        let mut core = AllocationCore::new(
            BLOCK_SIZE,
            SMALLEST_BIT,
            LARGEST_BIT,
            ENTRIES_PER_PAGE,
            fence,
            SelectionPolicy::FirstFit,
            MEMORY_TABLE_SIZE,
        );
        core.set_never_reuse(options.flags.contains(DebugFlags::NEVER_REUSE));
        core.realloc_always_copy = options.flags.contains(DebugFlags::REALLOC_COPY);
        if options.flags.contains(DebugFlags::ALLOC_BLANK) {
            core.fill_byte = Some(0xCE);
        }
        if options.flags.contains(DebugFlags::FREE_BLANK) {
            core.poison_byte = Some(0xD0);
        }

        let flags = options.flags;
        let log = LogSink::new(options.log_path.clone());
        let inner = Inner {
            core,
            options,
            log,
            allocations_seen: 0,
            checking_started: false,
            null_free_policy: NullFreePolicy::default(),
            realloc_zero_policy: ReallocZeroPolicy::default(),
            watch_hits: 0,
        };
        Self {
            inner: spin::Mutex::new(inner),
            flags,
        }
    }

    /// Build from the process environment (`DMALLOC_OPTIONS`).
    pub fn from_env() -> Self {
        Self::new(Options::from_env())
    }

    pub fn set_null_free_policy(&self, policy: NullFreePolicy) {
        self.inner.lock().null_free_policy = policy;
    }

    pub fn set_realloc_zero_policy(&self, policy: ReallocZeroPolicy) {
        self.inner.lock().realloc_zero_policy = policy;
    }

    /// Install or replace the `addr=ADDR[:N]` watchpoint at runtime (spec.md
    /// §6). Resets the hit counter, matching the semantics of setting it
    /// fresh from `DMALLOC_OPTIONS` at startup.
    pub fn set_address_watch(&self, addr: usize, hit_count: u32) {
        let mut guard = self.inner.lock();
        guard.options.address_watch = Some((addr, hit_count));
        guard.watch_hits = 0;
    }

    /// Handle an error raised by the re-entrancy guard itself, before the
    /// gate is ever locked. Can't go through [`Inner::note_error`] (that
    /// would re-lock a mutex this execution context already holds), so it
    /// only honors the flags that don't need the log sink; `log-bad-space`
    /// is silently skipped here, same as it would be on any other path that
    /// fails before the gate opens.
    fn note_reentrant_error(&self, err: DmallocError) -> DmallocError {
        set_last_error(Some(err));
        if self.flags.contains(DebugFlags::PRINT_ERROR) {
            eprintln!("dmallox: {err}");
        }
        if self.flags.contains(DebugFlags::ERROR_ABORT) {
            panic!("dmallox: fatal error {err} (error-abort set)");
        }
        err
    }

    /// Run `body` under the gate, enforcing the re-entrancy guard (spec.md
    /// §5: a second entry from the same execution context fails `InTwice`).
    fn gated<T>(&self, body: impl FnOnce(&mut Inner) -> Result<T, DmallocError>) -> Result<T, DmallocError> {
        let already_entered = ENTERED.with(|flag| flag.replace(true));
        if already_entered {
            return Err(self.note_reentrant_error(DmallocError::InTwice));
        }
        let result = {
            let mut guard = self.inner.lock();
            let outcome = body(&mut guard);
            if let Err(err) = outcome {
                guard.note_error(err);
            } else {
                set_last_error(None);
            }
            outcome
        };
        ENTERED.with(|flag| flag.set(false));
        result
    }

    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, DmallocError> {
        let caller = CallerKey::from_location(core::panic::Location::caller());
        self.allocate_as(size, Variant::Malloc, caller)
    }

    #[track_caller]
    pub fn count_and_size_allocate(&self, n: usize, size: usize) -> Result<NonNull<u8>, DmallocError> {
        let caller = CallerKey::from_location(core::panic::Location::caller());
        let total = n.checked_mul(size).ok_or(DmallocError::TooBig)?;
        self.allocate_as(total, Variant::Calloc, caller)
    }

    #[track_caller]
    pub fn page_allocate(&self, size: usize) -> Result<NonNull<u8>, DmallocError> {
        let caller = CallerKey::from_location(core::panic::Location::caller());
        self.allocate_as(size, Variant::Valloc, caller)
    }

    #[track_caller]
    pub fn aligned_allocate(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, DmallocError> {
        let caller = CallerKey::from_location(core::panic::Location::caller());
        if alignment > BLOCK_SIZE {
            return Err(DmallocError::TooBig);
        }
        self.allocate_as(size, Variant::Memalign(alignment), caller)
    }

    fn allocate_as(
        &self,
        size: usize,
        variant: Variant,
        caller: CallerKey,
    ) -> Result<NonNull<u8>, DmallocError> {
        self.gated(|inner| {
            inner.allocations_seen += 1;
            let ptr = inner.core.allocate(size, variant, caller)?;
            inner.log_trans("alloc", caller, ptr.as_ptr(), size);
            inner.log_admin_growth();
            inner.check_watchpoint(ptr.as_ptr())?;
            inner.maybe_check_heap(&caller)?;
            Ok(ptr)
        })
    }

    #[track_caller]
    pub fn free(&self, ptr: *mut u8) -> Result<(), DmallocError> {
        let caller = CallerKey::from_location(core::panic::Location::caller());
        self.gated(|inner| {
            if ptr.is_null() {
                return match inner.null_free_policy {
                    NullFreePolicy::Silent => Ok(()),
                    NullFreePolicy::Warn => {
                        let mut line = LineBuffer::new();
                        line.push_str("warning: free(NULL)").newline();
                        inner.log.write_line(&line);
                        Ok(())
                    }
                    NullFreePolicy::Error => Err(DmallocError::IsNull),
                };
            }
            inner.core.free(ptr, false)?;
            inner.log_trans("free", caller, ptr, 0);
            inner.check_watchpoint(ptr)?;
            inner.maybe_check_heap(&caller)?;
            Ok(())
        })
    }

    #[track_caller]
    pub fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, DmallocError> {
        let caller = CallerKey::from_location(core::panic::Location::caller());
        self.gated(|inner| {
            if new_size == 0 && !ptr.is_null() {
                match inner.realloc_zero_policy {
                    ReallocZeroPolicy::FreesAndReturnsNull => {
                        inner.core.free(ptr, false)?;
                        inner.log_trans("free", caller, ptr, 0);
                        return Err(DmallocError::IsNull);
                    }
                    ReallocZeroPolicy::ReturnsZeroSizePointer => {}
                }
            }
            let result = inner.core.reallocate(ptr, new_size, false, caller)?;
            inner.log_trans("realloc", caller, result.as_ptr(), new_size);
            inner.maybe_check_heap(&caller)?;
            Ok(result)
        })
    }

    #[track_caller]
    pub fn clear_and_reallocate(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, DmallocError> {
        let caller = CallerKey::from_location(core::panic::Location::caller());
        self.gated(|inner| {
            let result = inner.core.reallocate(ptr, new_size, true, caller)?;
            inner.log_trans("recalloc", caller, result.as_ptr(), new_size);
            inner.maybe_check_heap(&caller)?;
            Ok(result)
        })
    }

    /// `check-heap()` (spec.md §4.7), callable directly regardless of the
    /// `check-heap` debug flag.
    pub fn check_heap(&self) -> Result<(), DmallocError> {
        self.gated(|inner| inner.run_check_heap())
    }

    /// Per-pointer check (spec.md §4.7).
    pub fn check_pointer(&self, ptr: *const u8, loose: bool) -> Result<(), DmallocError> {
        self.gated(|inner| {
            let checker = IntegrityChecker::new(
                inner.core.directory(),
                inner.core.free_index(),
                inner.core.divided(),
                inner.core.fence(),
                inner.check_options(),
            );
            checker.check_pointer(ptr as usize, loose)
        })
    }

    /// Snapshot accessor (`read-info`, supplemented per `SPEC_FULL.md`):
    /// the current [`Counters`] plus the last-recorded error.
    pub fn read_info(&self) -> (Counters, Option<DmallocError>) {
        let counters = self.inner.lock().core.counters();
        (counters, last_error())
    }

    pub fn log_heap_map(&self) {
        self.inner.lock().log_heap_map();
    }

    /// `log-stats` (spec.md §6): emit summary statistics.
    pub fn log_stats(&self) {
        let mut guard = self.inner.lock();
        let counters = guard.core.counters();
        let mut line = LineBuffer::new();
        line.push_str("stats bytes-total=")
            .push_uint(counters.bytes_total, 0, false)
            .push_str(" bytes-in-use=")
            .push_uint(counters.bytes_in_use, 0, false)
            .push_str(" bytes-peak=")
            .push_uint(counters.bytes_peak, 0, false)
            .push_str(" points-out=")
            .push_uint(counters.points_out, 0, false)
            .newline();
        guard.log.write_line(&line);
    }

    /// `log-non-free` (spec.md §6): emit every descriptor still carrying a
    /// live `StartOfUser`/in-use mini-slot.
    pub fn log_unfreed(&self) {
        let mut guard = self.inner.lock();
        let include_unknown = guard.options.flags.contains(DebugFlags::LOG_UNKNOWN);
        let dump_bytes = guard.options.flags.contains(DebugFlags::LOG_NONFREE_SPACE);
        let entries: Vec<(usize, usize, String)> = guard
            .core
            .directory()
            .iter()
            .filter_map(|(index, descriptor)| match &descriptor.payload {
                Payload::StartOfUser { size, caller, .. } => {
                    if matches!(caller, CallerKey::Unknown) && !include_unknown {
                        return None;
                    }
                    let addr = guard.core.directory().address_of(index);
                    Some((addr, *size, caller.to_string()))
                }
                _ => None,
            })
            .collect();
        for (addr, size, caller) in entries {
            let mut line = LineBuffer::new();
            line.push_str("unfreed ")
                .push_str(&caller)
                .push_str(" ptr=")
                .push_ptr(addr)
                .push_str(" size=")
                .push_uint(size as u64, 0, false)
                .newline();
            guard.log.write_line(&line);
            if dump_bytes {
                let mut hex = LineBuffer::new();
                // SAFETY: the descriptor is still `StartOfUser`, so its
                // `size` bytes remain live and readable.
                unsafe { crate::logger::hex_dump(addr as *const u8, size.min(32), &mut hex) };
                hex.newline();
                guard.log.write_line(&hex);
            }
        }
    }

    /// Total number of times a watched address (`addr=ADDR[:N]`) has been
    /// handed out or freed so far, for callers inspecting `IsFound` state.
    pub fn points_watched(&self) -> u64 {
        self.inner.lock().watch_hits
    }
}

impl Drop for AllocatorContext {
    fn drop(&mut self) {
        let flags = self.inner.lock().options.flags;
        if flags.contains(DebugFlags::LOG_STATS) {
            self.log_stats();
        }
        if flags.contains(DebugFlags::LOG_NON_FREE) {
            self.log_unfreed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_round_trips_bytes_in_use() {
        let ctx = AllocatorContext::new(Options::parse("check-fence"));
        let ptr = ctx.allocate(64).unwrap();
        assert_eq!(ctx.read_info().0.bytes_in_use, 64);
        ctx.free(ptr.as_ptr()).unwrap();
        assert_eq!(ctx.read_info().0.bytes_in_use, 0);
    }

    #[test]
    fn null_free_policy_governs_free_of_null() {
        let ctx = AllocatorContext::new(Options::default());
        assert!(ctx.free(std::ptr::null_mut()).is_ok());

        ctx.set_null_free_policy(NullFreePolicy::Error);
        assert_eq!(ctx.free(std::ptr::null_mut()), Err(DmallocError::IsNull));
    }

    #[test]
    fn check_heap_passes_on_a_clean_allocation() {
        let ctx = AllocatorContext::new(Options::parse("check-fence,check-lists"));
        let _ptr = ctx.allocate(128).unwrap();
        assert!(ctx.check_heap().is_ok());
    }

    #[test]
    fn realloc_zero_defaults_to_freeing_and_returning_null() {
        let ctx = AllocatorContext::new(Options::default());
        let ptr = ctx.allocate(32).unwrap();
        assert_eq!(ctx.reallocate(ptr.as_ptr(), 0), Err(DmallocError::IsNull));
        assert_eq!(ctx.read_info().0.points_out, 0);
    }

    #[test]
    fn address_watchpoint_fires_isfound_on_the_nth_hit() {
        let ctx = AllocatorContext::new(Options::default());
        let ptr = ctx.allocate(32).unwrap();
        ctx.free(ptr.as_ptr()).unwrap();

        ctx.set_address_watch(ptr.as_ptr() as usize, 2);
        let reused = ctx.allocate(32).unwrap();
        assert_eq!(reused, ptr, "freed slot is expected to be reused immediately");
        assert_eq!(ctx.points_watched(), 1);

        assert_eq!(ctx.free(reused.as_ptr()), Err(DmallocError::IsFound));
        assert_eq!(ctx.points_watched(), 2);
    }

    #[test]
    fn start_condition_delays_heap_checking_until_the_nth_allocation() {
        let ctx = AllocatorContext::new(Options::parse("check-fence,check-heap,start=2"));
        assert!(ctx.allocate(8).is_ok());
        assert!(ctx.allocate(8).is_ok());
    }
}
