use std::fmt::Display;

/// Helper to format a string as a single POSIX shell word.
#[derive(Debug)]
pub struct ShellQuoted<'a> {
    word: &'a str,
}

impl<'a> Display for ShellQuoted<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.word.is_empty()
            && self
                .word
                .chars()
                .all(|c| matches!(c, '/' | '.' | '_' | '-' | ':' | '=' | ',' | '+' | '@') || c.is_ascii_alphanumeric())
        {
            return f.write_str(self.word);
        }
        match shlex::try_quote(self.word) {
            Ok(r) => f.write_str(&r),
            // Only possible with an interior NUL, which no shell can represent
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl<'a> ShellQuoted<'a> {
    /// Given a string, quote it in a way that it would be parsed as exactly one
    /// word by a default POSIX shell. Plain identifiers and paths are emitted
    /// unchanged.
    pub fn new<S: AsRef<str> + ?Sized>(word: &'a S) -> ShellQuoted<'a> {
        ShellQuoted {
            word: word.as_ref(),
        }
    }
}

/// Quote `word` for a POSIX shell, returning an owned string.
pub fn shell_quote(word: &str) -> String {
    ShellQuoted::new(word).to_string()
}
