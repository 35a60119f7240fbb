use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn as_str(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }
}

/// One content part of a turn submitted to the Generation Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    InlineData { mime_type: String, data: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn inline(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Part::InlineData {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text.as_str()),
            Part::InlineData { .. } => None,
        }
    }
}

/// First text part of a submission, or empty when the input is attachment-only.
pub fn first_text(parts: &[Part]) -> &str {
    parts.iter().find_map(Part::as_text).unwrap_or("")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub url: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Always kept so the Generation Service sees the original upload.
    pub raw_bytes: Vec<u8>,
    pub mime_type: String,
    pub display_form: Option<Vec<u8>>,
    pub remote_ref: Option<RemoteRef>,
}

impl Attachment {
    pub fn new(raw_bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            raw_bytes,
            mime_type: mime_type.into(),
            display_form: None,
            remote_ref: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
            attachment: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Inline data goes ahead of the text, matching how uploads are submitted.
    pub fn to_parts(&self) -> Vec<Part> {
        let mut parts = Vec::with_capacity(2);
        if let Some(attachment) = &self.attachment {
            if !attachment.raw_bytes.is_empty() {
                parts.push(Part::inline(
                    attachment.mime_type.clone(),
                    attachment.raw_bytes.clone(),
                ));
            }
        }
        if !self.text.is_empty() || parts.is_empty() {
            parts.push(Part::text(self.text.clone()));
        }
        parts
    }
}

/// A single conversation and the per-conversation instruction that steers it.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub id: String,
    pub title: String,
    pub system_instruction: String,
    pub turns: Vec<ConversationTurn>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(system_instruction: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_CONVERSATION_TITLE.to_string(),
            system_instruction: system_instruction.into(),
            turns: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_CONVERSATION_TITLE
    }

    pub fn push_user_turn(&mut self, turn: ConversationTurn) {
        debug_assert_eq!(turn.speaker, Speaker::User);
        self.turns.push(turn);
        self.touch();
    }

    pub fn push_assistant_turn(&mut self, text: impl Into<String>) {
        self.turns.push(ConversationTurn::assistant(text));
        self.touch();
    }

    /// Drops the trailing assistant turn so it can be generated again.
    /// Returns `None` (and leaves the transcript alone) if the last turn is not
    /// an assistant turn.
    pub fn strip_trailing_assistant_turn(&mut self) -> Option<ConversationTurn> {
        match self.turns.last() {
            Some(turn) if turn.speaker == Speaker::Assistant => {
                let removed = self.turns.pop();
                self.touch();
                removed
            }
            _ => None,
        }
    }

    /// The trailing user turn, provided it is the last turn in the transcript.
    pub fn pending_user_turn(&self) -> Option<&ConversationTurn> {
        self.turns
            .last()
            .filter(|turn| turn.speaker == Speaker::User)
    }

    pub fn last_user_input_parts(&self) -> Option<Vec<Part>> {
        self.pending_user_turn().map(ConversationTurn::to_parts)
    }

    /// Transcript without the trailing user turn, i.e. what the model saw
    /// before that input was submitted.
    pub fn history_before_pending(&self) -> &[ConversationTurn] {
        match self.pending_user_turn() {
            Some(_) => &self.turns[..self.turns.len() - 1],
            None => &self.turns,
        }
    }

    /// Remote blob ids referenced by this conversation's attachments.
    pub fn remote_blob_ids(&self) -> Vec<String> {
        self.turns
            .iter()
            .filter_map(|turn| turn.attachment.as_ref())
            .filter_map(|attachment| attachment.remote_ref.as_ref())
            .map(|remote| remote.id.clone())
            .collect()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_parts_put_inline_data_before_text() {
        let turn = ConversationTurn::user("what is this?")
            .with_attachment(Attachment::new(vec![1, 2, 3], "image/png"));
        let parts = turn.to_parts();
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], Part::InlineData { mime_type, .. } if mime_type == "image/png"));
        assert_eq!(parts[1].as_text(), Some("what is this?"));
    }

    #[test]
    fn strip_only_removes_trailing_assistant_turn() {
        let mut session = ConversationSession::new("be brief");
        session.push_user_turn(ConversationTurn::user("hi"));
        assert!(session.strip_trailing_assistant_turn().is_none());
        assert_eq!(session.turns.len(), 1);

        session.push_assistant_turn("hello");
        let removed = session.strip_trailing_assistant_turn().unwrap();
        assert_eq!(removed.text, "hello");
        assert_eq!(session.pending_user_turn().unwrap().text, "hi");
        assert!(session.history_before_pending().is_empty());
    }

    #[test]
    fn first_text_skips_inline_parts() {
        let parts = vec![Part::inline("image/png", vec![0]), Part::text("caption")];
        assert_eq!(first_text(&parts), "caption");
        assert_eq!(first_text(&[Part::inline("image/png", vec![0])]), "");
    }

    #[test]
    fn remote_blob_ids_are_collected_from_attachments() {
        let mut session = ConversationSession::new("");
        let mut attachment = Attachment::new(vec![9], "image/jpeg");
        attachment.remote_ref = Some(RemoteRef {
            url: "http://localhost/v1/blobs/faust_image_1".to_string(),
            id: "faust_image_1".to_string(),
        });
        session.push_user_turn(ConversationTurn::user("look").with_attachment(attachment));
        session.push_assistant_turn("nice");
        assert_eq!(session.remote_blob_ids(), vec!["faust_image_1".to_string()]);
    }
}
