//! Transaction logger (spec.md §4.9): formats into a fixed on-stack buffer
//! with a private, no-heap printf-like formatter, and writes the result to
//! a lazily-opened log file. The log path must never re-enter the
//! allocator (spec.md §9), so nothing in this module calls `alloc::format!`
//! or touches a `String`.

use crate::caller::CallerKey;
use std::fs::{File, OpenOptions};
use std::io::Write as _;

/// One value plugged into a [`LineBuffer::format`] template. A thin,
/// no-heap stand-in for the varargs a printf-style formatter would pull off
/// the C stack.
pub enum Arg<'a> {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(&'a str),
    Char(u8),
    Ptr(usize),
}

fn arg_as_usize(arg: Option<&Arg>) -> usize {
    match arg {
        Some(Arg::Int(n)) => (*n).max(0) as usize,
        Some(Arg::UInt(n)) => *n as usize,
        _ => 0,
    }
}

fn next_arg<'a, 'b>(args: &'b [Arg<'a>], idx: &mut usize) -> Option<&'b Arg<'a>> {
    let arg = args.get(*idx);
    *idx += 1;
    arg
}

fn render_uint_into(mut n: u64, buf: &mut [u8]) -> usize {
    let mut tmp = [0u8; 20];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    let len = tmp.len() - i;
    buf[..len].copy_from_slice(&tmp[i..]);
    len
}

fn render_hex_into(mut n: u64, buf: &mut [u8]) -> usize {
    if n == 0 {
        buf[0] = b'0';
        return 1;
    }
    let mut tmp = [0u8; 16];
    let mut i = tmp.len();
    while n > 0 {
        i -= 1;
        let d = (n % 16) as u8;
        tmp[i] = if d < 10 { b'0' + d } else { b'a' + (d - 10) };
        n /= 16;
    }
    let len = tmp.len() - i;
    buf[..len].copy_from_slice(&tmp[i..]);
    len
}

fn render_octal_into(mut n: u64, buf: &mut [u8]) -> usize {
    if n == 0 {
        buf[0] = b'0';
        return 1;
    }
    let mut tmp = [0u8; 22];
    let mut i = tmp.len();
    while n > 0 {
        i -= 1;
        tmp[i] = b'0' + (n % 8) as u8;
        n /= 8;
    }
    let len = tmp.len() - i;
    buf[..len].copy_from_slice(&tmp[i..]);
    len
}

/// Fixed-capacity, no-heap byte buffer used to build one log line.
pub struct LineBuffer {
    buf: [u8; 256],
    len: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0; 256],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn push(&mut self, b: u8) {
        if self.len < self.buf.len() {
            self.buf[self.len] = b;
            self.len += 1;
        }
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        for b in s.bytes() {
            self.push(b);
        }
        self
    }

    /// `%u`/`%d` with optional zero-padded field width.
    pub fn push_uint(&mut self, mut n: u64, width: usize, zero_pad: bool) -> &mut Self {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        let printed = digits.len() - i;
        for _ in printed..width {
            self.push(if zero_pad { b'0' } else { b' ' });
        }
        for &d in &digits[i..] {
            self.push(d);
        }
        self
    }

    /// `%x`: lowercase hex, optional `#` prefix.
    pub fn push_hex(&mut self, n: u64, alternate: bool) -> &mut Self {
        if alternate {
            self.push_str("0x");
        }
        if n == 0 {
            self.push(b'0');
            return self;
        }
        let mut digits = [0u8; 16];
        let mut i = digits.len();
        let mut n = n;
        while n > 0 {
            i -= 1;
            let d = (n % 16) as u8;
            digits[i] = if d < 10 { b'0' + d } else { b'a' + (d - 10) };
            n /= 16;
        }
        for &d in &digits[i..] {
            self.push(d);
        }
        self
    }

    /// `%p`: pointers render as `0x`-prefixed hex, matching the formatter
    /// token set in spec.md §4.9.
    pub fn push_ptr(&mut self, addr: usize) -> &mut Self {
        self.push_hex(addr as u64, true)
    }

    /// `%o`, optional `#` prefix.
    pub fn push_octal(&mut self, n: u64, alternate: bool) -> &mut Self {
        let mut buf = [0u8; 23];
        let mut start = 0;
        if alternate {
            buf[0] = b'0';
            start = 1;
        }
        let len = render_octal_into(n, &mut buf[start..]);
        for &b in &buf[..start + len] {
            self.push(b);
        }
        self
    }

    /// `%f`: fixed-point, `precision` digits after the point (printf
    /// defaults to 6 when none is given).
    pub fn push_float(&mut self, value: f64, precision: usize) -> &mut Self {
        let mut v = value;
        if v.is_sign_negative() {
            self.push(b'-');
            v = -v;
        }
        let int_part = v as u64;
        self.push_uint(int_part, 0, false);
        if precision > 0 {
            self.push(b'.');
            let mut frac = v - int_part as f64;
            for _ in 0..precision {
                frac *= 10.0;
                let digit = frac as u64 % 10;
                self.push(b'0' + digit as u8);
            }
        }
        self
    }

    /// Render a [`CallerKey`] the way `Display` would, without going
    /// through `Display`/`ToString` (which would heap-allocate a `String`
    /// and re-enter the allocator while the gate is held).
    pub fn push_caller(&mut self, caller: &CallerKey) -> &mut Self {
        match caller {
            CallerKey::File { file, line } => self
                .push_str(file)
                .push_str(":")
                .push_uint(*line as u64, 0, false),
            CallerKey::ReturnAddr(addr) => self.push_str("ra:").push_hex(*addr as u64, true),
            CallerKey::Unknown => self.push_str("<unknown>"),
        }
    }

    fn push_padded(&mut self, content: &[u8], width: usize, left_justify: bool, pad: u8) {
        let pad_count = width.saturating_sub(content.len());
        if left_justify {
            for &b in content {
                self.push(b);
            }
            for _ in 0..pad_count {
                self.push(pad);
            }
        } else {
            for _ in 0..pad_count {
                self.push(pad);
            }
            for &b in content {
                self.push(b);
            }
        }
    }

    /// printf-style formatter (spec.md §4.9): `%c %d %f %o %p %s %u %x`,
    /// with flags `-` (left-justify), `0` (zero-pad), `#` (alternate form),
    /// a field width (literal or `*`), a `%s` truncation/`%f` precision
    /// (literal or `*`), and an `l` length modifier (accepted and ignored —
    /// every [`Arg`] already carries its own native width).
    pub fn format(&mut self, template: &str, args: &[Arg]) -> &mut Self {
        let bytes = template.as_bytes();
        let mut i = 0;
        let mut arg_idx = 0;

        while i < bytes.len() {
            if bytes[i] != b'%' {
                self.push(bytes[i]);
                i += 1;
                continue;
            }
            i += 1;
            if i >= bytes.len() {
                break;
            }
            if bytes[i] == b'%' {
                self.push(b'%');
                i += 1;
                continue;
            }

            let mut left_justify = false;
            let mut zero_pad = false;
            let mut alternate = false;
            while i < bytes.len() {
                match bytes[i] {
                    b'-' => {
                        left_justify = true;
                        i += 1;
                    }
                    b'0' => {
                        zero_pad = true;
                        i += 1;
                    }
                    b'#' => {
                        alternate = true;
                        i += 1;
                    }
                    _ => break,
                }
            }

            let mut width = 0usize;
            if i < bytes.len() && bytes[i] == b'*' {
                width = arg_as_usize(next_arg(args, &mut arg_idx));
                i += 1;
            } else {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    width = width * 10 + (bytes[i] - b'0') as usize;
                    i += 1;
                }
            }

            let mut precision: Option<usize> = None;
            if i < bytes.len() && bytes[i] == b'.' {
                i += 1;
                if i < bytes.len() && bytes[i] == b'*' {
                    precision = Some(arg_as_usize(next_arg(args, &mut arg_idx)));
                    i += 1;
                } else {
                    let mut p = 0usize;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        p = p * 10 + (bytes[i] - b'0') as usize;
                        i += 1;
                    }
                    precision = Some(p);
                }
            }

            // `l` length modifier: no-op, `Arg::Int`/`Arg::UInt` are already
            // 64-bit.
            while i < bytes.len() && bytes[i] == b'l' {
                i += 1;
            }

            if i >= bytes.len() {
                break;
            }
            let conv = bytes[i];
            i += 1;
            let pad_byte = if zero_pad && !left_justify { b'0' } else { b' ' };

            match conv {
                b'c' => {
                    if let Some(Arg::Char(c)) = next_arg(args, &mut arg_idx) {
                        self.push_padded(&[*c], width, left_justify, b' ');
                    }
                }
                b's' => {
                    if let Some(Arg::Str(s)) = next_arg(args, &mut arg_idx) {
                        let s_bytes = s.as_bytes();
                        let truncated = match precision {
                            Some(p) => &s_bytes[..s_bytes.len().min(p)],
                            None => s_bytes,
                        };
                        self.push_padded(truncated, width, left_justify, b' ');
                    }
                }
                b'd' => {
                    let n = match next_arg(args, &mut arg_idx) {
                        Some(Arg::Int(n)) => *n,
                        Some(Arg::UInt(n)) => *n as i64,
                        _ => 0,
                    };
                    let mut buf = [0u8; 21];
                    let len = if n < 0 {
                        buf[0] = b'-';
                        render_uint_into(n.unsigned_abs(), &mut buf[1..]) + 1
                    } else {
                        render_uint_into(n as u64, &mut buf)
                    };
                    self.push_padded(&buf[..len], width, left_justify, pad_byte);
                }
                b'u' => {
                    let n = match next_arg(args, &mut arg_idx) {
                        Some(Arg::UInt(n)) => *n,
                        Some(Arg::Int(n)) => *n as u64,
                        _ => 0,
                    };
                    let mut buf = [0u8; 20];
                    let len = render_uint_into(n, &mut buf);
                    self.push_padded(&buf[..len], width, left_justify, pad_byte);
                }
                b'x' => {
                    let n = match next_arg(args, &mut arg_idx) {
                        Some(Arg::UInt(n)) => *n,
                        Some(Arg::Int(n)) => *n as u64,
                        Some(Arg::Ptr(p)) => *p as u64,
                        _ => 0,
                    };
                    let mut buf = [0u8; 18];
                    let mut start = 0;
                    if alternate {
                        buf[0] = b'0';
                        buf[1] = b'x';
                        start = 2;
                    }
                    let len = render_hex_into(n, &mut buf[start..]);
                    self.push_padded(&buf[..start + len], width, left_justify, pad_byte);
                }
                b'o' => {
                    let n = match next_arg(args, &mut arg_idx) {
                        Some(Arg::UInt(n)) => *n,
                        Some(Arg::Int(n)) => *n as u64,
                        _ => 0,
                    };
                    let mut buf = [0u8; 23];
                    let mut start = 0;
                    if alternate {
                        buf[0] = b'0';
                        start = 1;
                    }
                    let len = render_octal_into(n, &mut buf[start..]);
                    self.push_padded(&buf[..start + len], width, left_justify, pad_byte);
                }
                b'p' => {
                    if let Some(Arg::Ptr(p)) = next_arg(args, &mut arg_idx) {
                        let mut buf = [0u8; 18];
                        buf[0] = b'0';
                        buf[1] = b'x';
                        let len = render_hex_into(*p as u64, &mut buf[2..]);
                        self.push_padded(&buf[..2 + len], width, left_justify, b' ');
                    }
                }
                b'f' => {
                    if let Some(Arg::Float(v)) = next_arg(args, &mut arg_idx) {
                        let mut tmp = LineBuffer::new();
                        tmp.push_float(*v, precision.unwrap_or(6));
                        self.push_padded(tmp.as_bytes(), width, left_justify, b' ');
                    }
                }
                _ => {}
            }
        }
        self
    }

    pub fn newline(&mut self) -> &mut Self {
        self.push(b'\n');
        self
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Substitute the first `%d` in `template` with `pid`, writing into a fixed
/// buffer (no heap): spec.md §6, "`%d` in PATH is replaced by the pid".
pub fn substitute_pid(template: &str, pid: u32, out: &mut LineBuffer) {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && bytes.get(i + 1) == Some(&b'd') {
            out.push_uint(pid as u64, 0, false);
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
}

/// Opens the log file on first use and appends raw bytes to it.
///
/// Deliberately bypasses `std::io::Write`'s line-buffering/formatting glue
/// for anything beyond a raw `write_all`: the content is always pre-rendered
/// into a [`LineBuffer`] by the caller.
pub struct LogSink {
    path: Option<String>,
    file: Option<File>,
}

impl LogSink {
    pub fn new(path: Option<String>) -> Self {
        Self { path, file: None }
    }

    pub fn is_configured(&self) -> bool {
        self.path.is_some()
    }

    fn ensure_open(&mut self) -> Option<&mut File> {
        if self.file.is_none() {
            let template = self.path.as_ref()?;
            let mut resolved = LineBuffer::new();
            substitute_pid(template, std::process::id(), &mut resolved);
            let path_str = std::str::from_utf8(resolved.as_bytes()).ok()?;
            self.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path_str)
                .ok();
        }
        self.file.as_mut()
    }

    /// Append one already-rendered line to the log file. A no-op if no
    /// `log=PATH` was configured or the file could not be opened.
    pub fn write_line(&mut self, line: &LineBuffer) {
        if let Some(file) = self.ensure_open() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .finish()
    }
}

/// Render a byte range as a `log-bad-space`/`log-nonfree-space` hex dump,
/// spec.md §6: "hex-dump bytes around a detected corruption" /
/// "hex-dump bytes of each unfreed allocation".
///
/// # Safety
/// `ptr` must be valid for `len` reads.
pub unsafe fn hex_dump(ptr: *const u8, len: usize, out: &mut LineBuffer) {
    for i in 0..len {
        // SAFETY: forwarded from the caller's guarantee.
        let byte = unsafe { ptr.add(i).read() };
        out.push_hex(byte as u64, false);
        out.push_str(" ");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_uint_pads_with_zeros_when_requested() {
        let mut buf = LineBuffer::new();
        buf.push_uint(42, 5, true);
        assert_eq!(buf.as_bytes(), b"00042");
    }

    #[test]
    fn push_hex_renders_with_alternate_prefix() {
        let mut buf = LineBuffer::new();
        buf.push_hex(255, true);
        assert_eq!(buf.as_bytes(), b"0xff");
    }

    #[test]
    fn substitute_pid_replaces_the_first_percent_d_only() {
        let mut buf = LineBuffer::new();
        substitute_pid("/tmp/dmallox.%d.log", 1234, &mut buf);
        assert_eq!(buf.as_bytes(), b"/tmp/dmallox.1234.log");
    }

    #[test]
    fn log_sink_with_no_path_is_a_silent_no_op() {
        let mut sink = LogSink::new(None);
        let mut line = LineBuffer::new();
        line.push_str("hello\n");
        sink.write_line(&line); // must not panic
        assert!(!sink.is_configured());
    }

    #[test]
    fn format_supports_the_whole_conversion_set() {
        let mut buf = LineBuffer::new();
        buf.format(
            "%c %d %o %u %x %#x %s %p",
            &[
                Arg::Char(b'z'),
                Arg::Int(-7),
                Arg::UInt(8),
                Arg::UInt(9),
                Arg::UInt(255),
                Arg::UInt(255),
                Arg::Str("hi"),
                Arg::Ptr(0x10),
            ],
        );
        assert_eq!(buf.as_bytes(), b"z -7 10 9 ff 0xff hi 0x10");
    }

    #[test]
    fn format_zero_pads_and_left_justifies_within_a_field_width() {
        let mut buf = LineBuffer::new();
        buf.format("%05d|%-5d|", &[Arg::Int(42), Arg::Int(42)]);
        assert_eq!(buf.as_bytes(), b"00042|42   |");
    }

    #[test]
    fn format_truncates_a_string_to_its_precision() {
        let mut buf = LineBuffer::new();
        buf.format("%.3s", &[Arg::Str("hello")]);
        assert_eq!(buf.as_bytes(), b"hel");
    }

    #[test]
    fn format_star_width_and_precision_pull_from_the_next_args() {
        let mut buf = LineBuffer::new();
        buf.format("%*d", &[Arg::UInt(6), Arg::Int(7)]);
        assert_eq!(buf.as_bytes(), b"     7");
    }

    #[test]
    fn format_renders_a_float_with_explicit_precision() {
        let mut buf = LineBuffer::new();
        buf.format("%.2f", &[Arg::Float(3.5)]);
        assert_eq!(buf.as_bytes(), b"3.50");
    }

    #[test]
    fn push_caller_renders_file_and_line_without_heap_allocation() {
        let mut buf = LineBuffer::new();
        buf.push_caller(&CallerKey::File { file: "src/main.rs", line: 12 });
        assert_eq!(buf.as_bytes(), b"src/main.rs:12");
    }

    #[test]
    fn log_sink_appends_rendered_lines_to_the_configured_path() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("dmallox-test-{}.log", std::process::id()));
        let mut sink = LogSink::new(Some(path.to_string_lossy().into_owned()));
        let mut line = LineBuffer::new();
        line.push_str("alloc 10 bytes\n");
        sink.write_line(&line);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("alloc 10 bytes"));
        let _ = std::fs::remove_file(&path);
    }
}
