use std::time::Duration;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::model::{ChatId, Message, MessageId, UserId};

/// Rendering mode for an admin notification. The Pipeline tries these in
/// order (`Markdown` → `Html` → `Plain`) when the platform rejects a
/// message's entities, per §4.11's "Markdown rendering ... falls back to
/// HTML then plain text" — the callback keyboard passed alongside must
/// survive every fallback attempt unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Markdown,
    Html,
    Plain,
}

/// One button on an admin-notification keyboard: a human label plus the
/// opaque callback payload the platform echoes back on tap.
#[derive(Debug, Clone)]
pub struct KeyboardButton {
    pub label: String,
    pub callback_data: String,
}

/// The primitives the Pipeline needs from whatever chat platform it's
/// wired to. Send/edit/delete/ban are all it asks for — the platform's
/// gateway/update stream is `UpdateSource`, kept separate so a test harness
/// can inject updates without standing up a fake send path (§9: the core
/// never imports the platform vendor type directly beyond this boundary).
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<MessageId, AdapterError>;
    async fn delete_message(&self, chat_id: ChatId, msg_id: MessageId) -> Result<(), AdapterError>;
    async fn ban_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        duration: Option<Duration>,
    ) -> Result<(), AdapterError>;
    async fn unban_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), AdapterError>;
    async fn is_super_user(&self, user_id: UserId) -> bool;

    /// Sends an admin notification rendered in `format`, with an inline
    /// callback keyboard attached. Implementations that reject a given
    /// `format`'s entity syntax return `AdapterError::BadResponse` so the
    /// Pipeline can retry with the next fallback format (§4.11).
    async fn send_with_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        format: Format,
        keyboard: &[KeyboardButton],
    ) -> Result<MessageId, AdapterError>;
}

/// Where main-chat messages are archived for audit purposes (§4.11 step 2:
/// "If message belongs to primary chat, append to MessageLogger").
#[async_trait]
pub trait MessageLogger: Send + Sync {
    async fn log(&self, msg: &Message) -> Result<(), AdapterError>;
}

pub struct NullMessageLogger;

#[async_trait]
impl MessageLogger for NullMessageLogger {
    async fn log(&self, _msg: &Message) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// One incoming platform update, already close to internal shape so the
/// Pipeline's "transform platform update to internal Message" step (§4.11
/// step 1) is a thin mapping rather than a parse.
#[derive(Debug, Clone)]
pub enum Update {
    Message(Message),
    CallbackQuery { payload: String, chat_id: ChatId, from: UserId },
}

/// The inbound half of the platform boundary: a stream of updates to drain
/// in the Pipeline's main loop.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn next(&self) -> Option<Update>;
}

/// Outcome of an external check: either it ran and produced a verdict, or it
/// didn't run at all (timeout, transport error) — kept distinct from "ran
/// and said not-spam" because the Detector needs to know whether an
/// unreachable adapter should still count as "a check ran" for
/// approved-users bookkeeping (spec currently says yes; see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterOutcome {
    Ran { spam: bool },
    DidNotRun,
}

/// External reputation lookup (e.g. CAS). A single `check(msg, userId)`
/// contract, treated as opaque past this boundary.
#[async_trait]
pub trait ReputationCheck: Send + Sync {
    async fn check(&self, user_id: UserId) -> Result<AdapterOutcome, AdapterError>;
}

/// LLM-based veto, invoked only as confirmation of an already-suspicious
/// message or for short messages when configured (§4.5.2 step 3, LLM row).
#[async_trait]
pub trait LlmVeto: Send + Sync {
    async fn check(&self, text: &str) -> Result<AdapterOutcome, AdapterError>;
}

/// Where `Detector::update_spam`/`update_ham` forward newly-labeled samples
/// once they've been deduped and newline-normalized, so an external corpus
/// (e.g. a shared dataset file) can stay in sync with what the running
/// instance has learned.
#[async_trait]
pub trait SampleUpdater: Send + Sync {
    async fn append(&self, text: &str) -> Result<(), AdapterError>;
}

/// No-op adapters for wiring a Detector/Pipeline without any of the
/// optional external collaborators configured.
pub struct NullReputationCheck;

#[async_trait]
impl ReputationCheck for NullReputationCheck {
    async fn check(&self, _user_id: UserId) -> Result<AdapterOutcome, AdapterError> {
        Ok(AdapterOutcome::DidNotRun)
    }
}

pub struct NullLlmVeto;

#[async_trait]
impl LlmVeto for NullLlmVeto {
    async fn check(&self, _text: &str) -> Result<AdapterOutcome, AdapterError> {
        Ok(AdapterOutcome::DidNotRun)
    }
}

pub struct NullSampleUpdater;

#[async_trait]
impl SampleUpdater for NullSampleUpdater {
    async fn append(&self, _text: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}
