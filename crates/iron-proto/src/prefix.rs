//! IRC message prefix types.
//!
//! An IRC message prefix identifies the origin of a message. It can be either
//! a server name or a user's nick!user@host mask.

use std::fmt;
use std::str::FromStr;

/// IRC message prefix - identifies the origin of a message.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum Prefix {
    /// Server name (e.g., "irc.example.com")
    ServerName(String),
    /// User prefix: (nickname, username, hostname)
    Nickname(String, String, String),
}

impl Prefix {
    /// Parse a prefix string. Lenient: components are not validated.
    ///
    /// A dot before any `!` or `@` marks the prefix as a server name.
    pub fn new_from_str(s: &str) -> Self {
        let (name, rest) = match s.split_once('!') {
            Some((n, r)) => (n, Some(r)),
            None => (s, None),
        };

        match rest {
            Some(rest) => {
                let (user, host) = rest.split_once('@').unwrap_or((rest, ""));
                Prefix::Nickname(name.to_owned(), user.to_owned(), host.to_owned())
            }
            None => match name.split_once('@') {
                Some((nick, host)) => {
                    Prefix::Nickname(nick.to_owned(), String::new(), host.to_owned())
                }
                None if name.contains('.') => Prefix::ServerName(name.to_owned()),
                None => Prefix::Nickname(name.to_owned(), String::new(), String::new()),
            },
        }
    }

    /// The nickname, if this is a user prefix.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(nick, _, _) => Some(nick),
            Prefix::ServerName(_) => None,
        }
    }
}

impl FromStr for Prefix {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Prefix::new_from_str(s))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => f.write_str(name),
            Prefix::Nickname(nick, user, host) => {
                f.write_str(nick)?;
                if !user.is_empty() {
                    write!(f, "!{user}")?;
                }
                if !host.is_empty() {
                    write!(f, "@{host}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_user_prefix() {
        let p = Prefix::new_from_str("alice!ident@host.example");
        assert_eq!(
            p,
            Prefix::Nickname("alice".into(), "ident".into(), "host.example".into())
        );
        assert_eq!(p.nick(), Some("alice"));
    }

    #[test]
    fn parses_server_prefix() {
        let p = Prefix::new_from_str("irc.libera.chat");
        assert_eq!(p, Prefix::ServerName("irc.libera.chat".into()));
        assert_eq!(p.nick(), None);
    }

    #[test]
    fn bare_nick_is_user_prefix() {
        let p = Prefix::new_from_str("alice");
        assert_eq!(p.nick(), Some("alice"));
    }

    #[test]
    fn round_trips() {
        for s in ["alice!ident@host", "irc.example.com", "alice@host"] {
            assert_eq!(Prefix::new_from_str(s).to_string(), s);
        }
    }
}
