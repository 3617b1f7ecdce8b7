//! RPL_ISUPPORT (005) token handling.
//!
//! Servers advertise their feature set across one or more 005 numerics.
//! Tokens accumulate; a token prefixed with `-` is withdrawn.

use std::collections::HashMap;

use crate::casemap::Casemapping;

/// Accumulated ISUPPORT state for one connection.
#[derive(Clone, Debug, Default)]
pub struct Isupport {
    tokens: HashMap<String, Option<String>>,
}

impl Isupport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the parameters of one 005 reply.
    ///
    /// The first parameter (client nick) and the trailing human-readable
    /// text ("are supported by this server") must already be removed.
    pub fn update(&mut self, params: &[String]) {
        for token in params {
            if let Some(name) = token.strip_prefix('-') {
                self.tokens.remove(&name.to_ascii_uppercase());
                continue;
            }
            match token.split_once('=') {
                Some((name, value)) => {
                    self.tokens
                        .insert(name.to_ascii_uppercase(), Some(value.to_owned()));
                }
                None => {
                    self.tokens.insert(token.to_ascii_uppercase(), None);
                }
            }
        }
    }

    /// Get a token value. `Some(None)` means present without a value.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.tokens
            .get(&name.to_ascii_uppercase())
            .map(|v| v.as_deref())
    }

    /// The advertised `CASEMAPPING`, defaulting to rfc1459.
    pub fn casemapping(&self) -> Casemapping {
        match self.get("CASEMAPPING").flatten() {
            Some(value) => Casemapping::parse(value),
            None => Casemapping::default(),
        }
    }

    /// The advertised `NETWORK` name, if any.
    pub fn network(&self) -> Option<&str> {
        self.get("NETWORK").flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn accumulates_across_replies() {
        let mut isupport = Isupport::new();
        isupport.update(&params(&["CASEMAPPING=ascii", "CHANTYPES=#"]));
        isupport.update(&params(&["NETWORK=Libera.Chat"]));
        assert_eq!(isupport.casemapping(), Casemapping::Ascii);
        assert_eq!(isupport.network(), Some("Libera.Chat"));
        assert_eq!(isupport.get("CHANTYPES").flatten(), Some("#"));
    }

    #[test]
    fn default_casemapping_is_rfc1459() {
        let isupport = Isupport::new();
        assert_eq!(isupport.casemapping(), Casemapping::Rfc1459);
    }

    #[test]
    fn negated_token_is_withdrawn() {
        let mut isupport = Isupport::new();
        isupport.update(&params(&["MONITOR=100"]));
        isupport.update(&params(&["-MONITOR"]));
        assert_eq!(isupport.get("MONITOR"), None);
    }

    #[test]
    fn valueless_token() {
        let mut isupport = Isupport::new();
        isupport.update(&params(&["EXCEPTS"]));
        assert_eq!(isupport.get("EXCEPTS"), Some(None));
    }
}
