//! # Live console rendering
//!
//! Subprocess output arrives as arbitrary byte chunks.  Progress bars
//! (e.g. `wget --progress=bar:force`) redraw their line with a carriage
//! return; a scrollback buffer has no cursor addressing, so [`LiveConsole`]
//! interprets the carriage returns itself and keeps only the final state
//! of each line.

use std::io::Write;

/// Receives output chunks in the order the subprocess produced them.
pub trait ConsoleSink: Send {
    /// Consume one chunk.  Chunk boundaries carry no meaning.
    fn feed(&mut self, chunk: &[u8]);

    /// Called once after the last chunk.
    fn finish(&mut self) {}
}

/// A scrollback buffer that renders carriage-return redraws.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LiveConsole {
    lines: Vec<String>,
    current: String,
    /// A carriage return was seen; the next text replaces `current`.
    pending_cr: bool,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial: Vec<u8>,
}

impl LiveConsole {
    /// An empty console.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines terminated by a newline so far.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The line being written, not yet terminated.
    pub fn current_line(&self) -> &str {
        &self.current
    }

    /// The visible transcript: every committed line followed by a newline,
    /// then the current line if any.
    pub fn render(&self) -> String {
        let mut r = String::new();
        for line in &self.lines {
            r.push_str(line);
            r.push('\n');
        }
        r.push_str(&self.current);
        r
    }

    fn push_text(&mut self, text: &str) {
        for c in text.chars() {
            match c {
                '\r' => self.pending_cr = true,
                '\n' => {
                    // \r\n is a plain line ending
                    self.pending_cr = false;
                    self.lines.push(std::mem::take(&mut self.current));
                }
                c => {
                    if self.pending_cr {
                        self.current.clear();
                        self.pending_cr = false;
                    }
                    self.current.push(c);
                }
            }
        }
    }
}

impl ConsoleSink for LiveConsole {
    fn feed(&mut self, chunk: &[u8]) {
        let mut buf = std::mem::take(&mut self.partial);
        buf.extend_from_slice(chunk);
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.push_text(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.push_text(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(n) => {
                            self.push_text(char::REPLACEMENT_CHARACTER.encode_utf8(&mut [0; 4]));
                            rest = &after[n..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes
                            self.partial = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        if !self.partial.is_empty() {
            self.partial.clear();
            self.push_text(&char::REPLACEMENT_CHARACTER.to_string());
        }
    }
}

/// Copies raw output to a writer (e.g. the terminal) before handing it on.
pub struct Tee<W, S> {
    out: W,
    inner: S,
    failed: bool,
}

impl<W, S> std::fmt::Debug for Tee<W, S>
where
    S: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tee")
            .field("inner", &self.inner)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<W: Write + Send, S: ConsoleSink> Tee<W, S> {
    /// Echo to `out` and feed `inner`.
    pub fn new(out: W, inner: S) -> Self {
        Self {
            out,
            inner,
            failed: false,
        }
    }

    /// Unwrap the inner sink.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<W: Write + Send, S: ConsoleSink> ConsoleSink for Tee<W, S> {
    fn feed(&mut self, chunk: &[u8]) {
        if !self.failed {
            if let Err(e) = self.out.write_all(chunk).and_then(|_| self.out.flush()) {
                // Keep capturing even if the terminal went away
                tracing::warn!("Failed to echo output: {e}");
                self.failed = true;
            }
        }
        self.inner.feed(chunk);
    }

    fn finish(&mut self) {
        self.inner.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(chunks: &[&[u8]]) -> LiveConsole {
        let mut c = LiveConsole::new();
        for chunk in chunks {
            c.feed(chunk);
        }
        c
    }

    #[test]
    fn test_progress_redraw() {
        let c = render(&[
            b"Downloading... 10%\r",
            b"Downloading... 55%\r",
            b"Downloading... 100%\n",
            b"Done.\n",
        ]);
        assert_eq!(c.lines(), ["Downloading... 100%", "Done."]);
        assert_eq!(c.render(), "Downloading... 100%\nDone.\n");
    }

    #[test]
    fn test_split_line() {
        let c = render(&[b"Down", b"loading...\n"]);
        assert_eq!(c.lines(), ["Downloading..."]);
        assert_eq!(c.current_line(), "");
    }

    #[test]
    fn test_embedded_cr() {
        // Only the segment after the last carriage return survives
        let c = render(&[b"start\n 1%\r 2%\r 3%", b"\rfinal\nnext"]);
        assert_eq!(c.lines(), ["start", "final"]);
        assert_eq!(c.current_line(), "next");
        assert_eq!(c.render(), "start\nfinal\nnext");
    }

    #[test]
    fn test_crlf_and_leading_cr() {
        let c = render(&[b"a\r\n", b"\rb\r\n"]);
        assert_eq!(c.lines(), ["a", "b"]);
        // A trailing carriage return keeps the line visible until replaced
        let c = render(&[b"50%\r"]);
        assert_eq!(c.current_line(), "50%");
    }

    #[test]
    fn test_split_utf8() {
        let s = "größe ✓\n".as_bytes();
        let mut c = LiveConsole::new();
        for b in s {
            c.feed(std::slice::from_ref(b));
        }
        assert_eq!(c.lines(), ["größe ✓"]);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut c = render(&[b"a\xffb\n", b"c\xe2\x9c"]);
        assert_eq!(c.lines(), ["a\u{fffd}b"]);
        assert_eq!(c.current_line(), "c");
        c.finish();
        assert_eq!(c.current_line(), "c\u{fffd}");
    }

    #[test]
    fn test_tee() {
        let mut t = Tee::new(Vec::new(), LiveConsole::new());
        t.feed(b"1%\r2%\n");
        assert_eq!(t.out, b"1%\r2%\n");
        assert_eq!(t.into_inner().lines(), ["2%"]);
    }
}
