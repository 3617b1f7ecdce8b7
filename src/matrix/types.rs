//! Serde model of the Matrix event surface the bridge consumes and emits.
//!
//! Only the fields the pipeline needs are modeled; everything else rides
//! along in `serde_json::Value` catch-alls so unknown event shapes never
//! fail a transaction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One appservice transaction pushed by the homeserver.
#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub events: Vec<MatrixEvent>,
}

/// A Matrix room event as delivered in a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixEvent {
    pub event_id: String,
    pub sender: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl MatrixEvent {
    /// Typed view of `content` for `m.room.message` events.
    pub fn message_content(&self) -> Option<MessageContent> {
        if self.kind != "m.room.message" {
            return None;
        }
        serde_json::from_value(self.content.clone()).ok()
    }

    /// For `m.room.member` events, the membership value.
    pub fn membership(&self) -> Option<&str> {
        if self.kind != "m.room.member" {
            return None;
        }
        self.content.get("membership")?.as_str()
    }
}

/// Relation carried by edits and replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(default)]
    pub rel_type: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default, rename = "m.in_reply_to")]
    pub in_reply_to: Option<InReplyTo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: String,
}

/// Content of an `m.room.message` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub formatted_body: Option<String>,
    #[serde(default, rename = "m.relates_to")]
    pub relates_to: Option<RelatesTo>,
    #[serde(default, rename = "m.new_content")]
    pub new_content: Option<Box<MessageContent>>,
}

impl MessageContent {
    /// Plain text content.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.text".to_owned(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Notice content (bridge status traffic).
    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.notice".to_owned(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Emote content (IRC ACTION).
    pub fn emote(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.emote".to_owned(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Attach an HTML formatted body.
    pub fn with_html(mut self, html: String) -> Self {
        self.format = Some("org.matrix.custom.html".to_owned());
        self.formatted_body = Some(html);
        self
    }

    /// The event this content edits, when it is an `m.replace` relation.
    pub fn edit_target(&self) -> Option<&str> {
        let rel = self.relates_to.as_ref()?;
        if rel.rel_type.as_deref() == Some("m.replace") {
            rel.event_id.as_deref()
        } else {
            None
        }
    }

    /// The effective content: for an edit, the replacement payload.
    pub fn effective(&self) -> &MessageContent {
        self.new_content.as_deref().unwrap_or(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(content: Value) -> MatrixEvent {
        MatrixEvent {
            event_id: "$e1".into(),
            sender: "@alice:example.org".into(),
            room_id: "!room:example.org".into(),
            kind: "m.room.message".into(),
            state_key: None,
            content,
        }
    }

    #[test]
    fn parses_plain_message() {
        let content = event(json!({"msgtype": "m.text", "body": "hi"}))
            .message_content()
            .unwrap();
        assert_eq!(content.msgtype, "m.text");
        assert_eq!(content.body, "hi");
        assert!(content.edit_target().is_none());
    }

    #[test]
    fn parses_edit_relation() {
        let content = event(json!({
            "msgtype": "m.text",
            "body": "* fixed",
            "m.new_content": {"msgtype": "m.text", "body": "fixed"},
            "m.relates_to": {"rel_type": "m.replace", "event_id": "$orig"}
        }))
        .message_content()
        .unwrap();
        assert_eq!(content.edit_target(), Some("$orig"));
        assert_eq!(content.effective().body, "fixed");
    }

    #[test]
    fn non_message_event_has_no_content_view() {
        let mut ev = event(json!({"membership": "join"}));
        ev.kind = "m.room.member".into();
        assert!(ev.message_content().is_none());
        assert_eq!(ev.membership(), Some("join"));
    }
}
