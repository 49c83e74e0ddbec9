//! Provenance key capture.
//!
//! spec.md §9 calls out the original's caller-address-capture trick as a
//! requirement that "needs re-expression in a systems language": the C
//! version reads a return address off the stack with inline assembly or a
//! compiler builtin. Rust gives us the same information for free through
//! `#[track_caller]`/[`core::panic::Location`], which is why the allocator's
//! public entry points are all `#[track_caller]` instead of macro-wrapped.
//! `CallerKey::ReturnAddr`/`Unknown` remain so the type still matches the
//! tagged-sum shape spec.md asks for, and so tests can exercise the
//! "address only" provenance path the same way the original's `0`-line
//! convention does.

use core::fmt;

/// Tagged sum: exactly the three-way provenance spec.md §9 asks for, with
/// the state made explicit instead of living inside a union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerKey {
    /// `(file, line)` captured by `#[track_caller]`.
    File { file: &'static str, line: u32 },
    /// A raw return address, used when only `addr` provenance is available
    /// (the "zero line is the convention for address-only" case).
    ReturnAddr(usize),
    /// Provenance could not be determined.
    Unknown,
}

impl CallerKey {
    /// Capture provenance from a [`core::panic::Location`], as produced by
    /// `#[track_caller]` at every public entry point.
    pub fn from_location(location: &'static core::panic::Location<'static>) -> Self {
        CallerKey::File {
            file: location.file(),
            line: location.line(),
        }
    }

    /// The "line" half of the original's `(file,line) | return-address`
    /// convention: `0` marks "this key is a return address, not a source
    /// location", matching spec.md §6's "a zero line is the convention for
    /// address only".
    pub fn line(&self) -> u32 {
        match self {
            CallerKey::File { line, .. } => *line,
            CallerKey::ReturnAddr(_) | CallerKey::Unknown => 0,
        }
    }

    /// Bytes to hash for the provenance table (spec.md §4.8): the file path
    /// bytes when we have a source location, the pointer bytes when we only
    /// have a return address.
    pub fn hash_bytes<'a>(&'a self, scratch: &'a mut [u8; 8]) -> &'a [u8] {
        match self {
            CallerKey::File { file, .. } => file.as_bytes(),
            CallerKey::ReturnAddr(addr) => {
                *scratch = addr.to_ne_bytes();
                scratch
            }
            CallerKey::Unknown => b"<unknown>",
        }
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerKey::File { file, line } => write!(f, "{file}:{line}"),
            CallerKey::ReturnAddr(addr) => write!(f, "ra:{addr:#x}"),
            CallerKey::Unknown => f.write_str("<unknown>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_key_reports_its_line() {
        let key = CallerKey::File {
            file: "x.rs",
            line: 10,
        };
        assert_eq!(key.line(), 10);
    }

    #[test]
    fn return_addr_key_reports_line_zero() {
        let key = CallerKey::ReturnAddr(0xdead_beef);
        assert_eq!(key.line(), 0);
    }

    #[test]
    fn display_formats_both_variants() {
        assert_eq!(
            CallerKey::File {
                file: "x.rs",
                line: 10
            }
            .to_string(),
            "x.rs:10"
        );
        assert_eq!(CallerKey::ReturnAddr(0x10).to_string(), "ra:0x10");
    }
}
