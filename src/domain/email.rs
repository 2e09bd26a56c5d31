use chrono::{DateTime, Utc};

/// Server-assigned, folder-scoped message identifier.
pub type Uid = u32;

/// Raw message as returned by one FETCH.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: Uid,
    pub body: Option<Vec<u8>>,
    /// Server INTERNALDATE, used when the Date header is unusable.
    pub internal_date: Option<DateTime<Utc>>,
}

/// One exported row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub uid: Uid,
    pub received_at: Option<DateTime<Utc>>,
    pub sender: String,
    pub subject: String,
    pub body_text: String,
}

impl MessageRecord {
    pub const TIMESTAMP_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";

    /// Row with every field set to its placeholder.
    pub fn placeholder(uid: Uid) -> Self {
        Self {
            uid,
            received_at: None,
            sender: "(unknown)".to_string(),
            subject: "(no subject)".to_string(),
            body_text: String::new(),
        }
    }

    pub fn timestamp(&self) -> String {
        self.received_at
            .map(|t| t.format(Self::TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeField {
    Message,
    Date,
    Sender,
    Subject,
    Body,
}

/// Non-fatal decode fallback for a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    pub uid: Uid,
    pub field: DecodeField,
    pub detail: String,
}

impl std::fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UID {}: {:?}: {}", self.uid, self.field, self.detail)
    }
}

#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub record: MessageRecord,
    pub warnings: Vec<DecodeWarning>,
}

impl DecodedMessage {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}
