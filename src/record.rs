//! Fixed-width trace records.
//!
//! A [`TraceRecord`] is written in place inside a prefilled ring slot, so its message lives in
//! a fixed-capacity [`Payload`] rather than a `String`.

use core::fmt;

/// Payload width of a [`TraceRecord`] in bytes, terminator included.
pub const MAX_MESSAGE_LEN: usize = 128;

/// Fixed-capacity, zero-terminated text buffer of `W` bytes.
///
/// At most `W - 1` bytes of a message are kept. Every byte after the stored message is zero,
/// so the last byte is always a terminator.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Payload<const W: usize> {
    bytes: [u8; W],
}

impl<const W: usize> Payload<W> {
    pub const fn new() -> Self {
        Self { bytes: [0; W] }
    }

    /// Store `text`, truncating it to `W - 1` bytes and zero-filling the rest.
    /// Returns the number of bytes kept.
    pub fn set(&mut self, text: &str) -> usize {
        self.set_bytes(text.as_bytes())
    }

    /// Byte-level [`set`](Self::set). Bytes are copied as-is, so a zero byte ends the message
    /// early.
    pub fn set_bytes(&mut self, text: &[u8]) -> usize {
        let len = text.len().min(W.saturating_sub(1));
        let (head, tail) = self.bytes.split_at_mut(len);
        head.copy_from_slice(&text[..len]);
        tail.fill(0);
        len
    }

    /// Message bytes up to the first zero.
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.bytes.iter().position(|&b| b == 0).unwrap_or(W);
        &self.bytes[..end]
    }

    /// The whole `W`-byte buffer, padding included.
    #[inline]
    pub fn raw_bytes(&self) -> &[u8; W] {
        &self.bytes
    }

    /// Length of the stored message in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// `true` when no message is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.first().is_none_or(|&b| b == 0)
    }
}

impl<const W: usize> Default for Payload<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the message, replacing invalid UTF-8 (e.g. a character cut by truncation) with
/// U+FFFD.
impl<const W: usize> fmt::Display for Payload<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.as_bytes().utf8_chunks() {
            f.write_str(chunk.valid())?;
            if !chunk.invalid().is_empty() {
                f.write_str("\u{FFFD}")?;
            }
        }
        Ok(())
    }
}

impl<const W: usize> fmt::Debug for Payload<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for chunk in self.as_bytes().utf8_chunks() {
            for c in chunk.valid().chars() {
                write!(f, "{}", c.escape_debug())?;
            }
            for b in chunk.invalid() {
                write!(f, "\\x{b:02X}")?;
            }
        }
        f.write_str("\"")
    }
}

/// One trace event: when it happened, who recorded it, and what they said.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceRecord {
    /// Monotonic timestamp in nanoseconds.
    pub time: i64,
    /// Task that recorded the event.
    pub task: u64,
    /// Worker the task was running on.
    pub worker: i64,
    message: Payload<MAX_MESSAGE_LEN>,
}

impl TraceRecord {
    pub const fn new() -> Self {
        Self {
            time: 0,
            task: 0,
            worker: 0,
            message: Payload::new(),
        }
    }

    #[inline]
    pub fn set_message(&mut self, text: &str) -> usize {
        self.message.set(text)
    }

    #[inline]
    pub fn message(&self) -> &Payload<MAX_MESSAGE_LEN> {
        &self.message
    }

    #[inline]
    pub fn raw_bytes(&self) -> &[u8; MAX_MESSAGE_LEN] {
        self.message.raw_bytes()
    }
}

/// The emitted trace line, without a trailing newline.
impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "eventtrace: t={}, g={} m={}, {}",
            self.time, self.task, self.worker, self.message
        )
    }
}
