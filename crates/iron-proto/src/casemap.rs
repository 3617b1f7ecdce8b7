//! IRC case-mapping functions.
//!
//! IRC uses a case-insensitive comparison for nicknames and channel names,
//! with the rule advertised by the server through `CASEMAPPING` in
//! RPL_ISUPPORT. Under `rfc1459` some punctuation pairs are equivalent
//! (e.g., `[` and `{`); under `ascii` only letters fold.

/// A server-advertised casemapping rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Casemapping {
    /// Plain ASCII letter folding.
    Ascii,
    /// RFC 1459 folding: ASCII letters plus `[]\~` → `{}|^`.
    #[default]
    Rfc1459,
}

impl Casemapping {
    /// Parse a `CASEMAPPING` token value. Unknown values fall back to
    /// `rfc1459`, the historical default.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "ascii" => Casemapping::Ascii,
            _ => Casemapping::Rfc1459,
        }
    }

    /// Convert a single character to lowercase under this mapping.
    #[inline]
    pub const fn lower_char(self, c: char) -> char {
        match (self, c) {
            (Casemapping::Rfc1459, '[') => '{',
            (Casemapping::Rfc1459, ']') => '}',
            (Casemapping::Rfc1459, '\\') => '|',
            (Casemapping::Rfc1459, '~') => '^',
            (_, 'A'..='Z') => (c as u8 + 32) as char,
            _ => c,
        }
    }

    /// Fold a string to its canonical lowercase form.
    pub fn fold(self, s: &str) -> String {
        s.chars().map(|c| self.lower_char(c)).collect()
    }

    /// Compare two strings case-insensitively under this mapping.
    pub fn eq(self, a: &str, b: &str) -> bool {
        if a.len() != b.len() {
            return false;
        }
        a.chars()
            .zip(b.chars())
            .all(|(ca, cb)| self.lower_char(ca) == self.lower_char(cb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1459_special_chars() {
        let cm = Casemapping::Rfc1459;
        assert_eq!(cm.lower_char('['), '{');
        assert_eq!(cm.lower_char(']'), '}');
        assert_eq!(cm.lower_char('\\'), '|');
        assert_eq!(cm.lower_char('~'), '^');
        assert_eq!(cm.fold("Nick[Away]"), "nick{away}");
    }

    #[test]
    fn ascii_leaves_punctuation_alone() {
        let cm = Casemapping::Ascii;
        assert_eq!(cm.fold("Nick[Away]"), "nick[away]");
        assert!(!cm.eq("foo[", "foo{"));
    }

    #[test]
    fn divergent_pair_between_mappings() {
        // `Foo[` and `foo{` are the same entity under rfc1459 but not ascii.
        assert!(Casemapping::Rfc1459.eq("Foo[", "foo{"));
        assert!(!Casemapping::Ascii.eq("Foo[", "foo{"));
    }

    #[test]
    fn plain_case_insensitivity() {
        for cm in [Casemapping::Ascii, Casemapping::Rfc1459] {
            assert!(cm.eq("HELLO", "hello"));
            assert!(!cm.eq("hello", "world"));
        }
    }

    #[test]
    fn parse_token() {
        assert_eq!(Casemapping::parse("ascii"), Casemapping::Ascii);
        assert_eq!(Casemapping::parse("rfc1459"), Casemapping::Rfc1459);
        assert_eq!(Casemapping::parse("rfc1459-strict"), Casemapping::Rfc1459);
    }
}
