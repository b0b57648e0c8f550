use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;
/// Group identifier; scopes every stored row so a single database can back
/// multiple chats at once (see GLOSSARY in spec.md).
pub type GroupId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: UserId,
    pub user_name: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub links: u32,
    pub mentions: u32,
    pub images: u32,
    pub has_video: bool,
    pub has_audio: bool,
    pub is_forward: bool,
    pub has_keyboard: bool,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub sent_at: DateTime<Utc>,
    pub chat_id: ChatId,
    pub from: Author,
    pub text: String,
    pub reply_to_text: Option<String>,
    pub meta: MessageMeta,
}

impl Message {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_image_only(&self) -> bool {
        self.meta.images > 0 && self.text.trim().is_empty()
    }
}

/// One outcome from a single Detector check. `details` carries whatever
/// human-readable context an admin would need to judge the verdict (matched
/// stop phrase, emoji count, log-likelihoods, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub spam: bool,
    pub details: String,
}

impl CheckResult {
    pub fn ham(name: &'static str, details: impl Into<String>) -> Self {
        CheckResult {
            name: name.to_owned(),
            spam: false,
            details: details.into(),
        }
    }

    pub fn spam(name: &'static str, details: impl Into<String>) -> Self {
        CheckResult {
            name: name.to_owned(),
            spam: true,
            details: details.into(),
        }
    }
}

/// The ordered list of check results for one `Detector::check` call, plus the
/// derived `any(spam)` flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub results: Vec<CheckResult>,
}

impl Verdict {
    pub fn push(&mut self, result: CheckResult) {
        self.results.push(result);
    }

    pub fn is_spam(&self) -> bool {
        self.results.iter().any(|r| r.spam)
    }

    /// The first spam=true result, reported to admins as the "primary reason".
    pub fn primary_reason(&self) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.spam)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{Author, Message, MessageMeta};
    use chrono::{TimeZone, Utc};

    pub(crate) const USER_ID: i64 = 3;
    pub(crate) const CHAT_ID: i64 = 2;
    pub(crate) const MESSAGE_ID: i64 = 1;

    pub(crate) fn message(text: &str) -> Message {
        message_at_time(text, 100)
    }

    pub(crate) fn message_at_time(text: &str, secs: i64) -> Message {
        Message {
            id: MESSAGE_ID,
            sent_at: Utc.timestamp_opt(secs, 0).unwrap(),
            chat_id: CHAT_ID,
            from: Author {
                id: USER_ID,
                user_name: Some("spammer".to_owned()),
                display_name: "Spammer".to_owned(),
            },
            text: text.to_owned(),
            reply_to_text: None,
            meta: MessageMeta::default(),
        }
    }
}
