//! Line-based codec for tokio.
//!
//! Reads and writes newline-terminated IRC lines. Incoming bytes are
//! decoded as lossy UTF-8 since real IRC servers relay arbitrary legacy
//! encodings; outgoing lines get CRLF appended.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::MAX_LINE_LEN;

/// Line-based codec that handles newline-terminated messages.
///
/// By default, lines are limited to 512 bytes (IRC standard). Servers
/// with message-tags enabled may exceed that, so a generous cap is
/// applied on the read path instead of the strict protocol limit.
pub struct LineCodec {
    /// Index of next byte to check for newline
    next_index: usize,
    /// Maximum accepted inbound line length
    max_len: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            // 512 line + 8191 tag bytes, the IRCv3 worst case
            max_len: MAX_LINE_LEN + 8191,
        }
    }

    /// Create a codec with a custom max inbound line length.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if line.len() > self.max_len {
                return Err(ProtocolError::MessageTooLong {
                    actual: line.len(),
                    limit: self.max_len,
                });
            }

            let text = String::from_utf8_lossy(&line);
            Ok(Some(text.trim_end_matches(['\r', '\n']).to_owned()))
        } else {
            if src.len() > self.max_len {
                return Err(ProtocolError::MessageTooLong {
                    actual: src.len(),
                    limit: self.max_len,
                });
            }
            self.next_index = src.len();
            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        // Refuse to emit anything that would smuggle a second command.
        if line.contains('\r') || line.contains('\n') {
            return Err(ProtocolError::InvalidMessage(line));
        }
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
