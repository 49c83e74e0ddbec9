//! Fence guard (spec.md §4.2): the picket-fence bytes bracketing every user
//! allocation, used to catch buffer under/over-runs.

use crate::error::DmallocError;

/// Bottom fence tile, repeated to fill `F_BOT` bytes. Chosen to be
/// memorable in a hex dump, the same spirit as the original's
/// `CHUNK_MAGIC_BASE`/`CHUNK_MAGIC_TOP` (see `block.rs`), but distinct from
/// them so a corrupted descriptor and a corrupted fence are distinguishable
/// at a glance in the log.
const BOTTOM_TILE: [u8; 4] = [0xFA, 0xCE, 0xD0, 0x0D];
/// Top fence tile.
const TOP_TILE: [u8; 4] = [0xDE, 0xAD, 0xC0, 0xDE];

/// Writes and verifies the two picket-fence byte patterns around a chunk.
///
/// `F_BOT`/`F_TOP` are zero when fence-checking is disabled
/// ([`FenceGuard::disabled`]), in which case this component is a no-op and
/// the user pointer equals the chunk pointer.
#[derive(Debug, Clone, Copy)]
pub struct FenceGuard {
    bottom_len: usize,
    top_len: usize,
}

impl FenceGuard {
    /// Fence checking enabled, with `bottom_len`/`top_len` bytes on each
    /// side (spec.md default: 16 bytes each).
    pub const fn new(bottom_len: usize, top_len: usize) -> Self {
        Self {
            bottom_len,
            top_len,
        }
    }

    /// Fence checking disabled: `F_BOT == F_TOP == 0`.
    pub const fn disabled() -> Self {
        Self {
            bottom_len: 0,
            top_len: 0,
        }
    }

    pub const fn bottom_len(&self) -> usize {
        self.bottom_len
    }

    pub const fn top_len(&self) -> usize {
        self.top_len
    }

    pub const fn overhead(&self) -> usize {
        self.bottom_len + self.top_len
    }

    pub const fn is_enabled(&self) -> bool {
        self.bottom_len != 0 || self.top_len != 0
    }

    /// Write `BOTTOM_FENCE`/`TOP_FENCE` into the first/last bytes of
    /// `chunk`. `chunk.len()` must be at least `overhead()`.
    ///
    /// # Safety
    /// `chunk` must be valid for writes for its whole length.
    pub unsafe fn write(&self, chunk: *mut u8, chunk_len: usize) {
        if !self.is_enabled() {
            return;
        }
        debug_assert!(chunk_len >= self.overhead());
        // SAFETY: caller guarantees `chunk` is valid for `chunk_len` writes;
        // `bottom_len + top_len <= chunk_len` is asserted above.
        unsafe {
            tile_into(chunk, self.bottom_len, &BOTTOM_TILE);
            tile_into(chunk.add(chunk_len - self.top_len), self.top_len, &TOP_TILE);
        }
    }

    /// Verify both fences. Returns the first violated fence, bottom before
    /// top, matching the original's check order.
    ///
    /// # Safety
    /// `chunk` must be valid for reads for `chunk_len` bytes.
    pub unsafe fn check(&self, chunk: *const u8, chunk_len: usize) -> Result<(), DmallocError> {
        if !self.is_enabled() {
            return Ok(());
        }
        debug_assert!(chunk_len >= self.overhead());
        // SAFETY: see `write`.
        let bottom_ok = unsafe { tile_matches(chunk, self.bottom_len, &BOTTOM_TILE) };
        if !bottom_ok {
            return Err(DmallocError::UnderFence);
        }
        let top_ok =
            unsafe { tile_matches(chunk.add(chunk_len - self.top_len), self.top_len, &TOP_TILE) };
        if !top_ok {
            return Err(DmallocError::OverFence);
        }
        Ok(())
    }

    /// The user-visible pointer given the chunk pointer.
    ///
    /// # Safety
    /// `chunk` must be valid to offset by `bottom_len()`.
    pub unsafe fn user_ptr(&self, chunk: *mut u8) -> *mut u8 {
        // SAFETY: forwarded from the caller's guarantee.
        unsafe { chunk.add(self.bottom_len) }
    }

    /// The chunk pointer given the user-visible pointer.
    ///
    /// # Safety
    /// `user` must be valid to offset backwards by `bottom_len()`.
    pub unsafe fn chunk_ptr(&self, user: *mut u8) -> *mut u8 {
        // SAFETY: forwarded from the caller's guarantee.
        unsafe { user.sub(self.bottom_len) }
    }
}

/// # Safety
/// `dst` must be valid for `len` writes.
unsafe fn tile_into(dst: *mut u8, len: usize, tile: &[u8; 4]) {
    for i in 0..len {
        // SAFETY: `i < len` and caller guarantees `dst` valid for `len` bytes.
        unsafe { dst.add(i).write(tile[i % 4]) };
    }
}

/// # Safety
/// `src` must be valid for `len` reads.
unsafe fn tile_matches(src: *const u8, len: usize, tile: &[u8; 4]) -> bool {
    for i in 0..len {
        // SAFETY: `i < len` and caller guarantees `src` valid for `len` bytes.
        if unsafe { src.add(i).read() } != tile[i % 4] {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_clean_chunk() {
        let guard = FenceGuard::new(4, 4);
        let mut buf = [0u8; 16];
        unsafe {
            guard.write(buf.as_mut_ptr(), buf.len());
            assert!(guard.check(buf.as_ptr(), buf.len()).is_ok());
        }
    }

    #[test]
    fn detects_an_under_run() {
        let guard = FenceGuard::new(4, 4);
        let mut buf = [0u8; 16];
        unsafe {
            guard.write(buf.as_mut_ptr(), buf.len());
            buf[1] = 0xFF;
            assert_eq!(
                guard.check(buf.as_ptr(), buf.len()),
                Err(DmallocError::UnderFence)
            );
        }
    }

    #[test]
    fn detects_an_over_run() {
        let guard = FenceGuard::new(4, 4);
        let mut buf = [0u8; 16];
        unsafe {
            guard.write(buf.as_mut_ptr(), buf.len());
            buf[15] = 0xFF;
            assert_eq!(
                guard.check(buf.as_ptr(), buf.len()),
                Err(DmallocError::OverFence)
            );
        }
    }

    #[test]
    fn disabled_guard_is_a_no_op() {
        let guard = FenceGuard::disabled();
        let buf = [0xAAu8; 4];
        unsafe {
            assert!(guard.check(buf.as_ptr(), buf.len()).is_ok());
        }
        assert_eq!(guard.overhead(), 0);
    }
}
