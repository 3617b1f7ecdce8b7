//! Message Pipeline - translation between Matrix room events and IRC lines.
//!
//! Matrix → IRC: formatting conversion, newline handling, length-based
//! splitting with `...` continuation markers, and edit-as-correction backed
//! by a bounded LRU of recently sent events. IRC → Matrix: PRIVMSG/NOTICE/
//! ACTION to the matching `m.room.message` msgtype with formatting
//! converted when control codes are present.
//!
//! Ordering is inherited from the session control loop: one task per
//! session processes events strictly in arrival order.

use std::collections::{HashMap, VecDeque};

use iron_proto::format;
use iron_proto::MAX_LINE_LEN;

use crate::matrix::types::MessageContent;

const CONTINUATION: &str = "...";

/// How the lines should be delivered on IRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrcPayloadKind {
    Privmsg,
    Notice,
    Action,
}

/// The IRC side of one translated Matrix event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPlan {
    pub kind: IrcPayloadKind,
    pub lines: Vec<String>,
    /// True when this plan is a correction of an earlier message.
    pub is_correction: bool,
}

/// Sender identity used to compute per-line overhead as the server will
/// relay it to other clients.
#[derive(Debug, Clone)]
pub struct WireIdentity {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl WireIdentity {
    /// Worst-case prefix overhead for a PRIVMSG to `target`.
    fn overhead(&self, target: &str) -> usize {
        // :nick!user@host PRIVMSG target :\r\n
        format!(":{}!{}@{} PRIVMSG {} :\r\n", self.nick, self.user, self.host, target).len()
    }
}

/// Split one logical line into wire-sized chunks at whitespace boundaries,
/// marking continuations with `...` on both sides of the break.
pub fn split_long(identity: &WireIdentity, target: &str, message: &str) -> Vec<String> {
    let maxlen = MAX_LINE_LEN.saturating_sub(identity.overhead(target)).max(16);
    // every line must leave room for a trailing " ..." marker, and a
    // continuation line additionally carries a leading "... "
    let reserve = CONTINUATION.len() + 1;
    let word_budget = maxlen.saturating_sub(2 * reserve).max(1);

    // a single word that cannot fit on any line is broken at char boundaries
    let mut emit = Vec::new();
    for word in message.split(' ') {
        if word.len() > word_budget {
            emit.extend(hard_chunks(word, word_budget));
        } else {
            emit.push(word.to_owned());
        }
    }

    let mut out = Vec::new();
    let mut words: Vec<&str> = Vec::new();
    let mut words_len = 0usize;
    for word in &emit {
        let word = word.as_str();
        let with_word = if words.is_empty() {
            word.len()
        } else {
            words_len + 1 + word.len()
        };
        if with_word + reserve > maxlen && !words.is_empty() {
            let mut line = words.join(" ");
            line.push(' ');
            line.push_str(CONTINUATION);
            out.push(line);
            words = vec![CONTINUATION, word];
            words_len = reserve + word.len();
        } else {
            words.push(word);
            words_len = with_word;
        }
    }
    out.push(words.join(" "));
    out
}

fn hard_chunks(word: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for c in word.chars() {
        if current.len() + c.len_utf8() > budget {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Rejoin split lines, dropping the bridge's own continuation markers.
/// Inverse of [`split_long`] for messages without literal `...` runs.
pub fn rejoin_split(lines: &[String]) -> String {
    let mut words: Vec<&str> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let mut line = line.as_str();
        if i > 0 {
            line = line.strip_prefix(CONTINUATION).unwrap_or(line);
            line = line.strip_prefix(' ').unwrap_or(line);
        }
        if i + 1 < lines.len() {
            line = line.strip_suffix(CONTINUATION).unwrap_or(line);
            line = line.strip_suffix(' ').unwrap_or(line);
        }
        if !line.is_empty() {
            words.push(line);
        }
    }
    words.join(" ")
}

struct TrackedMessage {
    lines: Vec<String>,
}

/// Bounded LRU of Matrix event ID → last emitted IRC lines.
struct PendingEdits {
    capacity: usize,
    entries: HashMap<String, TrackedMessage>,
    order: VecDeque<String>,
}

impl PendingEdits {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, event_id: &str, lines: Vec<String>) {
        if self.entries.insert(event_id.to_owned(), TrackedMessage { lines }).is_none() {
            self.order.push_back(event_id.to_owned());
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    fn get(&self, event_id: &str) -> Option<&TrackedMessage> {
        self.entries.get(event_id)
    }

    /// Re-key an entry so further edits of the edit chain keep working.
    fn replace(&mut self, event_id: &str, lines: Vec<String>) {
        if let Some(entry) = self.entries.get_mut(event_id) {
            entry.lines = lines;
        }
    }
}

/// Per-session pipeline state.
pub struct Pipeline {
    edits: PendingEdits,
}

impl Pipeline {
    pub fn new(pending_edit_len: usize) -> Self {
        Self {
            edits: PendingEdits::new(pending_edit_len),
        }
    }

    /// Translate a Matrix message event into IRC lines for `target`.
    ///
    /// Edits of a tracked event become a single `* <text>` correction line;
    /// edits of unknown or evicted events fall back to a full send.
    pub fn plan_matrix_message(
        &mut self,
        identity: &WireIdentity,
        target: &str,
        event_id: &str,
        content: &MessageContent,
    ) -> OutboundPlan {
        let effective = content.effective();
        let kind = match effective.msgtype.as_str() {
            "m.emote" => IrcPayloadKind::Action,
            "m.notice" => IrcPayloadKind::Notice,
            _ => IrcPayloadKind::Privmsg,
        };
        let lines = self.render_lines(identity, target, effective);

        if let Some(original) = content.edit_target() {
            if self.edits.get(original).is_some() {
                let first = lines.first().cloned().unwrap_or_default();
                let correction = format!("* {first}");
                self.edits.replace(original, lines);
                return OutboundPlan {
                    kind,
                    lines: vec![correction],
                    is_correction: true,
                };
            }
            // untracked edit: predates our uptime or was evicted
        }

        self.edits.insert(
            if let Some(original) = content.edit_target() {
                original
            } else {
                event_id
            },
            lines.clone(),
        );
        OutboundPlan {
            kind,
            lines,
            is_correction: false,
        }
    }

    fn render_lines(
        &self,
        identity: &WireIdentity,
        target: &str,
        content: &MessageContent,
    ) -> Vec<String> {
        let text = match (&content.format, &content.formatted_body) {
            (Some(f), Some(html)) if f == "org.matrix.custom.html" => {
                format::matrix_html_to_irc(html)
            }
            _ => content.body.clone(),
        };

        text.replace('\r', "")
            .split('\n')
            .filter(|line| !line.trim().is_empty())
            .map(strip_control_chars)
            .flat_map(|line| split_long(identity, target, &line))
            .collect()
    }

    /// Translate an inbound IRC message body into Matrix message content.
    pub fn irc_to_matrix(text: &str, kind: IrcPayloadKind) -> MessageContent {
        let (plain, html) = format::irc_to_matrix(text);
        let content = match kind {
            IrcPayloadKind::Privmsg => MessageContent::text(plain),
            IrcPayloadKind::Notice => MessageContent::notice(plain),
            IrcPayloadKind::Action => MessageContent::emote(plain),
        };
        match html {
            Some(html) => content.with_html(html),
            None => content,
        }
    }
}

/// Remove control characters that could confuse IRC clients, keeping the
/// formatting codes the conversion itself emits and ZWSP.
fn strip_control_chars(line: &str) -> String {
    line.chars()
        .filter(|&c| {
            !c.is_control()
                || matches!(
                    c,
                    format::BOLD
                        | format::COLOR
                        | format::RESET
                        | format::MONOSPACE
                        | format::ITALIC
                        | format::STRIKETHROUGH
                        | format::UNDERLINE
                )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> WireIdentity {
        WireIdentity {
            nick: "alice".into(),
            user: "alice".into(),
            host: "bridge.example".into(),
        }
    }

    fn wire_len(identity: &WireIdentity, target: &str, line: &str) -> usize {
        identity.overhead(target) + line.len()
    }

    #[test]
    fn short_message_is_one_line() {
        let lines = split_long(&identity(), "#test", "hello world");
        assert_eq!(lines, vec!["hello world"]);
    }

    #[test]
    fn long_message_splits_within_limit_at_whitespace() {
        let word = "abcdefg";
        let message = std::iter::repeat(word)
            .take(120)
            .collect::<Vec<_>>()
            .join(" ");
        let id = identity();
        let lines = split_long(&id, "#test", &message);

        assert!(lines.len() >= 2);
        for line in &lines {
            assert!(wire_len(&id, "#test", line) <= MAX_LINE_LEN);
        }
        // no word was broken: every chunk boundary falls on whitespace
        for line in &lines {
            for w in line.split(' ') {
                assert!(w == word || w == CONTINUATION, "unexpected token {w:?}");
            }
        }
    }

    #[test]
    fn split_round_trips() {
        let message = std::iter::repeat("lorem ipsum dolor")
            .take(60)
            .collect::<Vec<_>>()
            .join(" ");
        let lines = split_long(&identity(), "#test", &message);
        assert!(lines.len() >= 2);
        assert_eq!(rejoin_split(&lines), message);
    }

    #[test]
    fn overlong_single_word_is_hard_split() {
        let message = "a".repeat(1200);
        let id = identity();
        let lines = split_long(&id, "#test", &message);
        assert!(lines.len() >= 3);
        for line in &lines {
            assert!(wire_len(&id, "#test", line) <= MAX_LINE_LEN);
        }
    }

    #[test]
    fn continuation_markers_ride_inside_the_budget() {
        // words exactly at the per-line budget force every line to carry
        // markers on both sides; none may spill past the wire limit
        let id = identity();
        let maxlen = MAX_LINE_LEN - id.overhead("#test");
        let word = "b".repeat(maxlen - 2 * (CONTINUATION.len() + 1));
        let message = format!("{word} {word} {word}");

        let lines = split_long(&id, "#test", &message);
        assert_eq!(lines.len(), 3);
        for line in &lines {
            assert!(wire_len(&id, "#test", line) <= MAX_LINE_LEN, "{}", line.len());
        }
        assert_eq!(rejoin_split(&lines), message);
    }

    #[test]
    fn edit_becomes_single_correction() {
        let mut pipeline = Pipeline::new(16);
        let id = identity();

        let original = MessageContent::text("helo world");
        let plan = pipeline.plan_matrix_message(&id, "#test", "$e1", &original);
        assert_eq!(plan.lines, vec!["helo world"]);
        assert!(!plan.is_correction);

        let mut edit = MessageContent::text("* hello world");
        edit.new_content = Some(Box::new(MessageContent::text("hello world")));
        edit.relates_to = Some(crate::matrix::types::RelatesTo {
            rel_type: Some("m.replace".into()),
            event_id: Some("$e1".into()),
            in_reply_to: None,
        });

        let plan = pipeline.plan_matrix_message(&id, "#test", "$e2", &edit);
        assert!(plan.is_correction);
        assert_eq!(plan.lines, vec!["* hello world"]);
    }

    #[test]
    fn repeated_edits_correct_not_stack() {
        let mut pipeline = Pipeline::new(16);
        let id = identity();

        let original = MessageContent::text("v1");
        pipeline.plan_matrix_message(&id, "#test", "$e1", &original);

        for (i, text) in ["v2", "v3"].iter().enumerate() {
            let mut edit = MessageContent::text(format!("* {text}"));
            edit.new_content = Some(Box::new(MessageContent::text(*text)));
            edit.relates_to = Some(crate::matrix::types::RelatesTo {
                rel_type: Some("m.replace".into()),
                event_id: Some("$e1".into()),
                in_reply_to: None,
            });
            let plan =
                pipeline.plan_matrix_message(&id, "#test", &format!("$e{}", i + 2), &edit);
            assert!(plan.is_correction);
            assert_eq!(plan.lines.len(), 1);
        }
    }

    #[test]
    fn evicted_edit_falls_back_to_full_send() {
        let mut pipeline = Pipeline::new(1);
        let id = identity();

        pipeline.plan_matrix_message(&id, "#t", "$e1", &MessageContent::text("one"));
        // capacity 1: this evicts $e1
        pipeline.plan_matrix_message(&id, "#t", "$e2", &MessageContent::text("two"));

        let mut edit = MessageContent::text("* one fixed");
        edit.new_content = Some(Box::new(MessageContent::text("one fixed")));
        edit.relates_to = Some(crate::matrix::types::RelatesTo {
            rel_type: Some("m.replace".into()),
            event_id: Some("$e1".into()),
            in_reply_to: None,
        });
        let plan = pipeline.plan_matrix_message(&id, "#t", "$e3", &edit);
        assert!(!plan.is_correction);
        assert_eq!(plan.lines, vec!["one fixed"]);
    }

    #[test]
    fn emote_maps_to_action() {
        let mut pipeline = Pipeline::new(4);
        let plan = pipeline.plan_matrix_message(
            &identity(),
            "#t",
            "$e",
            &MessageContent::emote("waves"),
        );
        assert_eq!(plan.kind, IrcPayloadKind::Action);
    }

    #[test]
    fn html_body_converts_to_codes() {
        let mut pipeline = Pipeline::new(4);
        let content = MessageContent::text("bold move").with_html("<b>bold</b> move".into());
        let plan = pipeline.plan_matrix_message(&identity(), "#t", "$e", &content);
        assert_eq!(plan.lines, vec!["\x02bold\x02 move"]);
    }

    #[test]
    fn irc_action_to_emote() {
        let content = Pipeline::irc_to_matrix("waves", IrcPayloadKind::Action);
        assert_eq!(content.msgtype, "m.emote");
        assert_eq!(content.body, "waves");
        assert!(content.formatted_body.is_none());
    }

    #[test]
    fn irc_formatting_to_html() {
        let content = Pipeline::irc_to_matrix("\x02loud\x02 quiet", IrcPayloadKind::Privmsg);
        assert_eq!(content.body, "loud quiet");
        assert_eq!(content.formatted_body.as_deref(), Some("<b>loud</b> quiet"));
    }
}
