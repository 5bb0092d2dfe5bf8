//! Helpers that keep log lines single-line and bounded.

use std::fmt::{self, Write};

const MAX_TEXT_CHARS: usize = 300;
const MAX_HEX_BYTES: usize = 32;

/// Log view of untrusted text: one line, bounded, formatted lazily.
///
/// Control characters and backslashes print in their `escape_debug` form
/// (`\n`, `\t`, `\u{1b}`); quotes are left alone. Text past the limit
/// collapses into a `…(+N chars)` marker.
#[derive(Debug, Clone, Copy)]
pub struct LogText<'a> {
    text: &'a str,
    limit: usize,
}

impl<'a> LogText<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            limit: MAX_TEXT_CHARS,
        }
    }

    pub fn limit(self, limit: usize) -> Self {
        Self { limit, ..self }
    }
}

impl fmt::Display for LogText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chars = self.text.chars();
        for ch in chars.by_ref().take(self.limit) {
            if ch == '\\' || ch.is_control() {
                write!(f, "{}", ch.escape_debug())?;
            } else {
                f.write_char(ch)?;
            }
        }
        let rest = chars.count();
        if rest > 0 {
            write!(f, "…(+{} chars)", rest)?;
        }
        Ok(())
    }
}

pub fn escape_log(text: &str) -> LogText<'_> {
    LogText::new(text)
}

/// Space-separated uppercase hex of at most `MAX_HEX_BYTES` bytes, followed
/// by the total length when truncated.
pub fn hex_preview(bytes: &[u8]) -> String {
    let shown = bytes.len().min(MAX_HEX_BYTES);
    let mut out = String::with_capacity(shown * 3 + 12);
    for (i, b) in bytes[..shown].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{:02X}", b);
    }
    if bytes.len() > shown {
        let _ = write!(&mut out, " … ({} bytes)", bytes.len());
    }
    out
}
