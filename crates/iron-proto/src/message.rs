//! IRC message parsing and serialization.
//!
//! A message is an optional `:prefix`, a command (word or three-digit
//! numeric), any number of middle parameters and an optional `:trailing`
//! parameter. IRCv3 tags are accepted on input and discarded; the bridge
//! does not consume them.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::prefix::Prefix;

/// An owned, parsed IRC message.
///
/// # Example
///
/// ```
/// use iron_proto::Message;
///
/// let msg: Message = ":nick!user@host PRIVMSG #channel :Hello!".parse().unwrap();
/// assert_eq!(msg.command, "PRIVMSG");
/// assert_eq!(msg.params, vec!["#channel", "Hello!"]);
/// ```
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    /// Message prefix/source (e.g., `nick!user@host`).
    pub prefix: Option<Prefix>,
    /// Command name, uppercased, or a three-digit numeric.
    pub command: String,
    /// Parameters, trailing last.
    pub params: Vec<String>,
}

impl Message {
    /// Build a message with no prefix.
    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Message {
            prefix: None,
            command: command.to_ascii_uppercase(),
            params: params.into_iter().map(str::to_owned).collect(),
        }
    }

    /// Create a PRIVMSG to a target.
    pub fn privmsg(target: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            prefix: None,
            command: "PRIVMSG".to_owned(),
            params: vec![target.into(), text.into()],
        }
    }

    /// Create a NOTICE to a target.
    pub fn notice(target: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            prefix: None,
            command: "NOTICE".to_owned(),
            params: vec![target.into(), text.into()],
        }
    }

    /// Get the nickname from the message prefix, if present.
    pub fn source_nickname(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(Prefix::nick)
    }

    /// First parameter, conventionally the target of the command.
    pub fn target(&self) -> Option<&str> {
        self.params.first().map(String::as_str)
    }

    /// Last parameter, conventionally the message body.
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    /// Whether the command is a three-digit numeric reply.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, Self::Err> {
        let mut rest = s.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }

        // Tags are tolerated but not represented.
        if let Some(stripped) = rest.strip_prefix('@') {
            rest = match stripped.split_once(' ') {
                Some((_, r)) => r.trim_start_matches(' '),
                None => return Err(ProtocolError::MissingCommand),
            };
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (p, r) = stripped
                .split_once(' ')
                .ok_or(ProtocolError::MissingCommand)?;
            rest = r.trim_start_matches(' ');
            Some(Prefix::new_from_str(p))
        } else {
            None
        };

        let mut params = Vec::new();
        let command = match rest.split_once(' ') {
            Some((cmd, mut args)) => {
                loop {
                    args = args.trim_start_matches(' ');
                    if args.is_empty() {
                        break;
                    }
                    if let Some(trailing) = args.strip_prefix(':') {
                        params.push(trailing.to_owned());
                        break;
                    }
                    match args.split_once(' ') {
                        Some((word, r)) => {
                            params.push(word.to_owned());
                            args = r;
                        }
                        None => {
                            params.push(args.to_owned());
                            break;
                        }
                    }
                }
                cmd
            }
            None => rest,
        };

        if command.is_empty() {
            return Err(ProtocolError::MissingCommand);
        }

        Ok(Message {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.starts_with(':') || param.contains(' ')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_privmsg_with_prefix() {
        let msg: Message = ":alice!a@example PRIVMSG #test :hello world".parse().unwrap();
        assert_eq!(msg.source_nickname(), Some("alice"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#test", "hello world"]);
    }

    #[test]
    fn parses_numeric() {
        let msg: Message = ":server 001 bridgenick :Welcome to IRC".parse().unwrap();
        assert!(msg.is_numeric());
        assert_eq!(msg.command, "001");
        assert_eq!(msg.trailing(), Some("Welcome to IRC"));
    }

    #[test]
    fn lowercase_command_is_normalized() {
        let msg: Message = "ping :token".parse().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn tags_are_skipped() {
        let msg: Message = "@time=2023-01-01T00:00:00Z;msgid=abc :a!b@c PRIVMSG #x :hi"
            .parse()
            .unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.source_nickname(), Some("a"));
    }

    #[test]
    fn empty_trailing_survives_round_trip() {
        let msg: Message = "TOPIC #chan :".parse().unwrap();
        assert_eq!(msg.params, vec!["#chan", ""]);
        assert_eq!(msg.to_string(), "TOPIC #chan :");
    }

    #[test]
    fn serializes_trailing_with_spaces() {
        let msg = Message::privmsg("#test", "two words");
        assert_eq!(msg.to_string(), "PRIVMSG #test :two words");
    }

    #[test]
    fn multiple_middle_params() {
        let msg: Message = "USER ident 0 * :Real Name".parse().unwrap();
        assert_eq!(msg.params, vec!["ident", "0", "*", "Real Name"]);
    }

    #[test]
    fn rejects_empty_line() {
        assert!("".parse::<Message>().is_err());
        assert!("\r\n".parse::<Message>().is_err());
    }
}
