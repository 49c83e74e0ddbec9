//! Configuration (spec.md §6): parses the single `DMALLOC_OPTIONS`
//! environment variable into [`Options`].
//!
//! Hand-rolled comma/colon tokenizer, no `clap`/`nom`: this is one env var,
//! not a CLI surface, the same call the original's own `env.c` makes.

/// One bit per symbolic debug flag in spec.md §6. A plain `u32` newtype
/// rather than a `bitflags`-crate type, matching `error.rs`'s own
/// no-crate-support enum and the teacher's dependency-light style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugFlags(pub u32);

impl DebugFlags {
    pub const LOG_STATS: DebugFlags = DebugFlags(1 << 0);
    pub const LOG_NON_FREE: DebugFlags = DebugFlags(1 << 1);
    pub const LOG_TRANS: DebugFlags = DebugFlags(1 << 2);
    pub const LOG_ADMIN: DebugFlags = DebugFlags(1 << 3);
    pub const LOG_BLOCKS: DebugFlags = DebugFlags(1 << 4);
    pub const LOG_UNKNOWN: DebugFlags = DebugFlags(1 << 5);
    pub const LOG_BAD_SPACE: DebugFlags = DebugFlags(1 << 6);
    pub const LOG_NONFREE_SPACE: DebugFlags = DebugFlags(1 << 7);
    pub const CHECK_FENCE: DebugFlags = DebugFlags(1 << 8);
    pub const CHECK_HEAP: DebugFlags = DebugFlags(1 << 9);
    pub const CHECK_LISTS: DebugFlags = DebugFlags(1 << 10);
    pub const CHECK_FREE: DebugFlags = DebugFlags(1 << 11);
    pub const CHECK_FUNCS: DebugFlags = DebugFlags(1 << 12);
    pub const REALLOC_COPY: DebugFlags = DebugFlags(1 << 13);
    pub const FREE_BLANK: DebugFlags = DebugFlags(1 << 14);
    pub const ERROR_ABORT: DebugFlags = DebugFlags(1 << 15);
    pub const ALLOC_BLANK: DebugFlags = DebugFlags(1 << 16);
    pub const HEAP_CHECK_MAP: DebugFlags = DebugFlags(1 << 17);
    pub const PRINT_ERROR: DebugFlags = DebugFlags(1 << 18);
    pub const CATCH_NULL: DebugFlags = DebugFlags(1 << 19);
    pub const NEVER_REUSE: DebugFlags = DebugFlags(1 << 20);
    pub const ALLOW_NONLINEAR: DebugFlags = DebugFlags(1 << 21);

    pub const fn empty() -> Self {
        DebugFlags(0)
    }

    pub fn contains(self, other: DebugFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: DebugFlags) {
        self.0 |= other.0;
    }

    fn from_token(token: &str) -> Option<DebugFlags> {
        Some(match token {
            "log-stats" => Self::LOG_STATS,
            "log-non-free" => Self::LOG_NON_FREE,
            "log-trans" => Self::LOG_TRANS,
            "log-admin" => Self::LOG_ADMIN,
            "log-blocks" => Self::LOG_BLOCKS,
            "log-unknown" => Self::LOG_UNKNOWN,
            "log-bad-space" => Self::LOG_BAD_SPACE,
            "log-nonfree-space" => Self::LOG_NONFREE_SPACE,
            "check-fence" => Self::CHECK_FENCE,
            "check-heap" => Self::CHECK_HEAP,
            "check-lists" => Self::CHECK_LISTS,
            "check-free" => Self::CHECK_FREE,
            "check-funcs" => Self::CHECK_FUNCS,
            "realloc-copy" => Self::REALLOC_COPY,
            "free-blank" => Self::FREE_BLANK,
            "error-abort" => Self::ERROR_ABORT,
            "alloc-blank" => Self::ALLOC_BLANK,
            "heap-check-map" => Self::HEAP_CHECK_MAP,
            "print-error" => Self::PRINT_ERROR,
            "catch-null" => Self::CATCH_NULL,
            "never-reuse" => Self::NEVER_REUSE,
            "allow-nonlinear" => Self::ALLOW_NONLINEAR,
            _ => return None,
        })
    }
}

impl std::ops::BitOr for DebugFlags {
    type Output = DebugFlags;
    fn bitor(self, rhs: DebugFlags) -> DebugFlags {
        DebugFlags(self.0 | rhs.0)
    }
}

/// `start=FILE:LINE | start=N` (spec.md §6): delay heap checking until a
/// named call site is reached, or until the N-th allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartCondition {
    CallSite { file: String, line: u32 },
    AllocationCount(u64),
}

/// Parsed `DMALLOC_OPTIONS` (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub flags: DebugFlags,
    pub log_path: Option<String>,
    pub interval: Option<u32>,
    pub start: Option<StartCondition>,
    pub address_watch: Option<(usize, u32)>,
}

impl Options {
    /// Read and parse `DMALLOC_OPTIONS` from the process environment.
    /// Missing or unset is equivalent to an empty options string.
    pub fn from_env() -> Self {
        match std::env::var("DMALLOC_OPTIONS") {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::default(),
        }
    }

    /// Parse a raw `DMALLOC_OPTIONS`-style string directly (exposed for
    /// tests and for callers that source configuration some other way).
    pub fn parse(raw: &str) -> Self {
        let mut options = Options::default();
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            options.apply_token(token);
        }
        options
    }

    fn apply_token(&mut self, token: &str) {
        if let Some((key, value)) = token.split_once('=') {
            match key {
                "log" => self.log_path = Some(value.to_string()),
                "debug" => {
                    if let Ok(bits) = u32::from_str_radix(value.trim_start_matches("0x"), 16) {
                        self.flags.insert(DebugFlags(bits));
                    }
                }
                "inter" => self.interval = value.parse().ok(),
                "start" => self.start = parse_start(value),
                "addr" => self.address_watch = parse_addr_watch(value),
                _ => {}
            }
            return;
        }
        if let Some(flag) = DebugFlags::from_token(token) {
            self.flags.insert(flag);
        }
    }
}

fn parse_start(value: &str) -> Option<StartCondition> {
    if let Some((file, line)) = value.split_once(':') {
        Some(StartCondition::CallSite {
            file: file.to_string(),
            line: line.parse().ok()?,
        })
    } else {
        value.parse().ok().map(StartCondition::AllocationCount)
    }
}

fn parse_addr_watch(value: &str) -> Option<(usize, u32)> {
    let (addr_str, n_str) = value.split_once(':').unwrap_or((value, "1"));
    let addr = usize::from_str_radix(addr_str.trim_start_matches("0x"), 16)
        .or_else(|_| addr_str.parse())
        .ok()?;
    let n = n_str.parse().ok()?;
    Some((addr, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_flags_set_their_bit() {
        let options = Options::parse("check-fence,log-stats");
        assert!(options.flags.contains(DebugFlags::CHECK_FENCE));
        assert!(options.flags.contains(DebugFlags::LOG_STATS));
        assert!(!options.flags.contains(DebugFlags::NEVER_REUSE));
    }

    #[test]
    fn log_path_is_captured_verbatim() {
        let options = Options::parse("log=/tmp/dmallox.%d.log,check-fence");
        assert_eq!(options.log_path.as_deref(), Some("/tmp/dmallox.%d.log"));
    }

    #[test]
    fn debug_hex_mask_merges_with_symbolic_flags() {
        let options = Options::parse("debug=0x100,log-stats");
        assert!(options.flags.contains(DebugFlags::CHECK_FENCE));
        assert!(options.flags.contains(DebugFlags::LOG_STATS));
    }

    #[test]
    fn start_accepts_both_call_site_and_count_forms() {
        assert_eq!(
            Options::parse("start=x.rs:42").start,
            Some(StartCondition::CallSite {
                file: "x.rs".to_string(),
                line: 42,
            })
        );
        assert_eq!(
            Options::parse("start=1000").start,
            Some(StartCondition::AllocationCount(1000))
        );
    }

    #[test]
    fn addr_watch_defaults_the_hit_count_to_one() {
        let options = Options::parse("addr=0xdead:3");
        assert_eq!(options.address_watch, Some((0xdead, 3)));
        let options = Options::parse("addr=0xbeef");
        assert_eq!(options.address_watch, Some((0xbeef, 1)));
    }

    #[test]
    fn unrecognized_tokens_are_ignored() {
        let options = Options::parse("not-a-real-flag,log-stats");
        assert!(options.flags.contains(DebugFlags::LOG_STATS));
    }
}
