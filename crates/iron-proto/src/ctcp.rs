//! CTCP (Client-to-Client Protocol) message handling.
//!
//! CTCP payloads are embedded within PRIVMSG and NOTICE bodies using the
//! `\x01` delimiter character.
//!
//! # Reference
//! - CTCP specification: <https://modern.ircdocs.horse/ctcp.html>

use std::fmt;

/// The CTCP delimiter character (`\x01`).
const CTCP_DELIM: char = '\x01';

/// Known CTCP command types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CtcpKind {
    /// ACTION - describes an action performed by the user (`/me`).
    Action,
    /// VERSION - requests client version information.
    Version,
    /// PING - measures round-trip latency.
    Ping,
    /// TIME - requests local time from the client.
    Time,
    /// CLIENTINFO - requests list of supported CTCP commands.
    Clientinfo,
    /// SOURCE - requests source code location.
    Source,
    /// Unknown or custom CTCP command.
    Unknown(String),
}

impl CtcpKind {
    /// Parse a CTCP command name into a `CtcpKind`.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "ACTION" => Self::Action,
            "VERSION" => Self::Version,
            "PING" => Self::Ping,
            "TIME" => Self::Time,
            "CLIENTINFO" => Self::Clientinfo,
            "SOURCE" => Self::Source,
            _ => Self::Unknown(name.to_ascii_uppercase()),
        }
    }

    /// Returns the canonical uppercase name of this CTCP command.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Action => "ACTION",
            Self::Version => "VERSION",
            Self::Ping => "PING",
            Self::Time => "TIME",
            Self::Clientinfo => "CLIENTINFO",
            Self::Source => "SOURCE",
            Self::Unknown(s) => s,
        }
    }
}

impl fmt::Display for CtcpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed CTCP message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ctcp {
    /// The CTCP command type.
    pub kind: CtcpKind,
    /// Optional parameters following the command.
    pub params: Option<String>,
}

impl Ctcp {
    /// Parse a CTCP message from a PRIVMSG/NOTICE body.
    ///
    /// Returns `None` if the body is not a CTCP message. A missing
    /// trailing delimiter is tolerated, as many clients omit it.
    pub fn parse(text: &str) -> Option<Self> {
        let inner = text.strip_prefix(CTCP_DELIM)?;
        let inner = inner.strip_suffix(CTCP_DELIM).unwrap_or(inner);
        if inner.is_empty() {
            return None;
        }

        let (name, params) = match inner.split_once(' ') {
            Some((n, p)) => (n, Some(p.to_owned())),
            None => (inner, None),
        };

        Some(Ctcp {
            kind: CtcpKind::parse(name),
            params,
        })
    }

    /// Create an ACTION message (`/me`).
    pub fn action(text: impl Into<String>) -> Self {
        Ctcp {
            kind: CtcpKind::Action,
            params: Some(text.into()),
        }
    }
}

impl fmt::Display for Ctcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.params {
            Some(p) => write!(f, "{CTCP_DELIM}{} {p}{CTCP_DELIM}", self.kind),
            None => write!(f, "{CTCP_DELIM}{}{CTCP_DELIM}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action() {
        let ctcp = Ctcp::parse("\x01ACTION waves hello\x01").unwrap();
        assert_eq!(ctcp.kind, CtcpKind::Action);
        assert_eq!(ctcp.params.as_deref(), Some("waves hello"));
    }

    #[test]
    fn parses_bare_version() {
        let ctcp = Ctcp::parse("\x01VERSION\x01").unwrap();
        assert_eq!(ctcp.kind, CtcpKind::Version);
        assert_eq!(ctcp.params, None);
    }

    #[test]
    fn tolerates_missing_trailing_delim() {
        let ctcp = Ctcp::parse("\x01ACTION shrugs").unwrap();
        assert_eq!(ctcp.params.as_deref(), Some("shrugs"));
    }

    #[test]
    fn non_ctcp_is_none() {
        assert!(Ctcp::parse("just a message").is_none());
        assert!(Ctcp::parse("\x01\x01").is_none());
    }

    #[test]
    fn formats_action() {
        assert_eq!(Ctcp::action("dances").to_string(), "\x01ACTION dances\x01");
    }

    #[test]
    fn unknown_kind_preserved() {
        let ctcp = Ctcp::parse("\x01DCC SEND file 1 2 3\x01").unwrap();
        assert_eq!(ctcp.kind, CtcpKind::Unknown("DCC".into()));
    }
}
