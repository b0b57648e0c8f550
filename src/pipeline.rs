use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{Format, KeyboardButton, MessageLogger, PlatformAdapter, Update, UpdateSource};
use crate::detected_spam::DetectedSpamLog;
use crate::detector::Detector;
use crate::locator::Locator;
use crate::model::{ChatId, GroupId, Message, MessageId, UserId};
use crate::terminator::Terminator;

/// Capacity of the admin-injected outbound submit channel (§4.11: "outbound
/// submit channel (administratively injected messages, buffered, capacity
/// 100)").
const SUBMIT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub gid: GroupId,
    pub primary_chat_id: ChatId,
    pub admin_chat_id: ChatId,
    /// Dry mode: decisions are taken but no side effects reach the platform
    /// (§GLOSSARY "Dry mode").
    pub dry: bool,
    /// Training mode: only the admin notification is sent; no delete/ban
    /// (§4.11 step 4).
    pub training: bool,
    pub all_activity_ban_duration: Duration,
    pub permanent_ban_duration: Duration,
    pub idle_interval: Duration,
}

/// Orchestrates the three terminators named in §4.7: all-activity per user,
/// bot-activity per user, and overall bot activity (subject held constant).
pub struct Terminators {
    pub all_activity: Terminator,
    pub bots_activity: Terminator,
    pub overall_bot_activity: Terminator,
}

/// Subject for the overall-bot-activity terminator: a single constant key
/// shared by every call, per §4.7 ("subject = constant").
const OVERALL_BOT_SUBJECT: &str = "__overall_bot__";

fn all_activity_subject(user_id: UserId, sender_chat_id: Option<ChatId>, chat_id: ChatId) -> String {
    format!("{user_id}|{}|{chat_id}", sender_chat_id.unwrap_or(0))
}

/// The single-consumer loop over the platform update stream (§4.11). Pulls
/// updates, runs the Detector and Terminators, and dispatches the resulting
/// actions through the platform adapter. Main-chat updates, admin callbacks,
/// administratively-submitted messages and idle ticks all funnel through one
/// `tokio::select!`.
pub struct Pipeline {
    config: PipelineConfig,
    detector: Arc<Detector>,
    locator: Arc<Locator>,
    detected_spam_log: Arc<DetectedSpamLog>,
    terminators: Terminators,
    platform: Arc<dyn PlatformAdapter>,
    message_logger: Arc<dyn MessageLogger>,
    submit_tx: mpsc::Sender<Update>,
    submit_rx: tokio::sync::Mutex<mpsc::Receiver<Update>>,
    /// Original text of the most recent spam verdict per user, keyed for the
    /// lifetime of the admin notification. `Locator` only stores a one-way
    /// SHA-256 hash (§4.8), so it can re-identify a forwarded report's
    /// metadata but can never answer "what was the text" — §4.11's "resolve
    /// the original text via Locator" is read here as "via the pipeline's
    /// own short-lived notification context", not a hash reversal. See
    /// DESIGN.md for this Open Question's resolution.
    pending_confirmations: StdMutex<HashMap<UserId, String>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        detector: Arc<Detector>,
        locator: Arc<Locator>,
        detected_spam_log: Arc<DetectedSpamLog>,
        terminators: Terminators,
        platform: Arc<dyn PlatformAdapter>,
        message_logger: Arc<dyn MessageLogger>,
    ) -> Arc<Self> {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_CHANNEL_CAPACITY);
        Arc::new(Pipeline {
            config,
            detector,
            locator,
            detected_spam_log,
            terminators,
            platform,
            message_logger,
            submit_tx,
            submit_rx: tokio::sync::Mutex::new(submit_rx),
            pending_confirmations: StdMutex::new(HashMap::new()),
        })
    }

    /// A handle administrators can use to inject a message into the main
    /// path (e.g. a synthetic "replay this report" update) without standing
    /// up a second consumer.
    pub fn submit_handle(&self) -> mpsc::Sender<Update> {
        self.submit_tx.clone()
    }

    /// Runs the event loop until `cancel` fires. All network-bound work
    /// inside a single iteration happens synchronously so ordering within a
    /// chat is preserved (§5); only the admin-callback path is allowed to
    /// interleave with main-chat updates, which `tokio::select!`'s inherent
    /// fairness gives us for free since both arms are driven from the same
    /// task.
    pub async fn run(self: Arc<Self>, updates: Box<dyn UpdateSource>, cancel: CancellationToken) {
        let mut idle = tokio::time::interval(self.config.idle_interval);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(gid = self.config.gid, "pipeline entering main loop");

        // Locked for the lifetime of the loop: this is the single consumer
        // of the submit channel, so there's never contention worth paying a
        // per-iteration lock for (§4.11, §5's single-consumer guarantee).
        let mut submit_rx = self.submit_rx.lock().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pipeline received cancellation, shutting down");
                    break;
                }
                maybe_update = updates.next() => {
                    match maybe_update {
                        Some(update) => {
                            self.clone().handle_update(update).await;
                        }
                        None => {
                            warn!("update source closed, shutting down pipeline");
                            break;
                        }
                    }
                }
                Some(update) = submit_rx.recv() => {
                    self.clone().handle_update(update).await;
                }
                _ = idle.tick() => {
                    self.clone().handle_idle_tick().await;
                }
            }
        }
    }

    /// Processes a single update to completion. Exposed as `pub` in
    /// addition to being driven from `run`'s loop because a webhook-style
    /// HTTP admin surface (§1, out of scope here) processes one update per
    /// request rather than running the select loop itself.
    #[instrument(skip(self, update), fields(gid = self.config.gid))]
    pub async fn handle_update(self: Arc<Self>, update: Update) {
        let start = Instant::now();
        match update {
            Update::Message(msg) => self.handle_message(msg).await,
            Update::CallbackQuery { payload, chat_id, from } => {
                self.handle_callback(&payload, chat_id, from).await
            }
        }
        debug!(elapsed = ?start.elapsed(), "update handled");
    }

    async fn handle_idle_tick(self: Arc<Self>) {
        // Fires the Detector on a synthetic idle message so bots driven by
        // its output can emit periodic keepalive traffic (§4.11). No text,
        // so `min_msg_len` gates it out of every real check; this is purely
        // a heartbeat through the same code path, never a source of bans.
        let idle = synthetic_idle_message(self.config.primary_chat_id);
        let _ = self.detector.check(&idle, 0).await;
    }

    async fn handle_message(self: Arc<Self>, msg: Message) {
        if msg.chat_id == self.config.primary_chat_id {
            if let Err(err) = self.message_logger.log(&msg).await {
                warn!(error = %err, "message logger failed");
            }
        }

        let sender_chat_id = None; // platform adapters that model sender-chats should extend Author.
        let is_super_user = self.platform.is_super_user(msg.from.id).await;

        let subject = all_activity_subject(msg.from.id, sender_chat_id, msg.chat_id);
        let all_activity = self.terminators.all_activity.check(&subject, msg.sent_at).await;
        if all_activity.active && !is_super_user {
            if all_activity.new {
                self.ban_if_live(msg.chat_id, msg.from.id, Some(self.config.all_activity_ban_duration)).await;
            }
            return;
        }

        let verdict = self.detector.check(&msg, msg.from.id).await;

        if verdict.is_spam() {
            self.handle_spam(&msg, &verdict, is_super_user).await;
        }

        // Throttle legitimate bot replies derived from this message, per
        // §4.11 step 5. Subjects are the message's own chat/user for the
        // per-user terminator and the shared constant for the overall one.
        let bot_subject = format!("{}|{}", msg.from.id, msg.chat_id);
        self.terminators.bots_activity.check(&bot_subject, msg.sent_at).await;
        self.terminators.overall_bot_activity.check(OVERALL_BOT_SUBJECT, msg.sent_at).await;
    }

    async fn handle_spam(&self, msg: &Message, verdict: &crate::model::Verdict, is_super_user: bool) {
        let checks_json = serde_json::to_string(&verdict.results).unwrap_or_default();

        if let Err(err) = self
            .detected_spam_log
            .add(self.config.gid, &msg.text, msg.from.id, msg.from.user_name.as_deref(), &verdict.results)
            .await
        {
            error!(error = %err, "failed to record detected spam");
        }

        if let Err(err) = self.locator.add_message(
            self.config.gid,
            msg.chat_id,
            msg.from.id,
            msg.from.user_name.as_deref(),
            msg.id,
            &msg.text,
        ).await {
            error!(error = %err, "failed to record locator message");
        }

        if let Err(err) = self.locator.add_spam(msg.from.id, self.config.gid, &checks_json).await {
            error!(error = %err, "failed to record locator spam verdict");
        }

        if !self.config.dry && !self.config.training {
            if let Err(err) = self.platform.delete_message(msg.chat_id, msg.id).await {
                warn!(error = %err, "failed to delete spam message");
            }

            if !is_super_user {
                self.ban_if_live(msg.chat_id, msg.from.id, Some(self.config.permanent_ban_duration)).await;
            }
        }

        self.pending_confirmations
            .lock()
            .unwrap()
            .insert(msg.from.id, msg.text.clone());

        self.notify_admin(msg, verdict).await;
    }

    async fn ban_if_live(&self, chat_id: ChatId, user_id: UserId, duration: Option<Duration>) {
        if self.config.dry {
            debug!(user_id, "dry mode: would ban but not executing");
            return;
        }
        if let Err(err) = self.platform.ban_user(chat_id, user_id, duration).await {
            warn!(error = %err, user_id, "ban failed");
        }
    }

    /// Sends the admin notification with the confirm/ham/info keyboard,
    /// retrying with the next rendering format whenever the platform
    /// rejects the current one's entity syntax (§4.11's Markdown → HTML →
    /// plain-text fallback). The keyboard is identical on every attempt so
    /// its callback payload is never lost.
    async fn notify_admin(&self, msg: &Message, verdict: &crate::model::Verdict) {
        let reason = verdict.primary_reason();
        let text = match reason {
            Some(r) => format!(
                "Spam detected from {} ({}): {}\n> {}",
                msg.from.display_name, msg.from.id, r.details, msg.text
            ),
            None => format!("Spam detected from {} ({})\n> {}", msg.from.display_name, msg.from.id, msg.text),
        };

        let keyboard = vec![
            KeyboardButton { label: "Confirm ban".to_owned(), callback_data: format!("+{}:{}", msg.from.id, msg.id) },
            KeyboardButton { label: "Mark as ham".to_owned(), callback_data: format!("!{}:{}", msg.from.id, msg.id) },
            KeyboardButton { label: "Show info".to_owned(), callback_data: format!("?{}:{}", msg.from.id, msg.id) },
        ];

        for format in [Format::Markdown, Format::Html, Format::Plain] {
            match self.platform.send_with_keyboard(self.config.admin_chat_id, &text, format, &keyboard).await {
                Ok(_) => return,
                Err(err) => {
                    warn!(error = %err, ?format, "admin notification format rejected, retrying with fallback");
                }
            }
        }
        error!("admin notification failed in every rendering format");
    }

    /// Parses `<op><userId>:<msgId>` and dispatches the corresponding admin
    /// action (§4.11). Unrecognized payloads are logged and dropped.
    async fn handle_callback(&self, payload: &str, _chat_id: ChatId, _from: UserId) {
        let Some(op) = payload.chars().next() else {
            warn!(payload, "empty callback payload");
            return;
        };
        let rest = &payload[op.len_utf8()..];
        let Some((user_id_str, msg_id_str)) = rest.split_once(':') else {
            warn!(payload, "malformed callback payload");
            return;
        };
        let (Ok(user_id), Ok(msg_id)) = (user_id_str.parse::<UserId>(), msg_id_str.parse::<MessageId>()) else {
            warn!(payload, "callback payload has non-numeric ids");
            return;
        };

        // Confirm the user actually has a recorded spam verdict (via
        // Locator) before acting, then recover the original text from the
        // pipeline's own pending-confirmation cache (see struct doc).
        let has_locator_record = matches!(self.locator.spam(user_id).await, Ok(Some(_)));
        let original_text = if has_locator_record {
            self.pending_confirmations.lock().unwrap().get(&user_id).cloned()
        } else {
            None
        };

        match op {
            '+' => self.handle_confirm_ban(user_id, msg_id, original_text).await,
            '!' => self.handle_mark_ham(user_id, original_text).await,
            '?' => self.handle_show_info(user_id).await,
            other => warn!(op = %other, "unrecognized callback op"),
        }
    }

    async fn handle_confirm_ban(&self, user_id: UserId, msg_id: MessageId, original_text: Option<String>) {
        if let Some(text) = original_text {
            let msg = synthetic_message_for_training(self.config.primary_chat_id, user_id, msg_id, &text);
            self.detector.update_spam(&msg).await;
            if let Ok(id) = self.detected_spam_log.read(self.config.gid).await.map(|rows| rows.into_iter().find(|r| r.user_id == user_id).map(|r| r.id)) {
                if let Some(id) = id {
                    let _ = self.detected_spam_log.set_added_to_samples_flag(id).await;
                }
            }
        }

        if self.config.training || self.config.dry {
            debug!(user_id, "training/dry mode: confirm-ban acknowledged without platform ban");
            return;
        }
        self.ban_if_live(self.config.primary_chat_id, user_id, Some(self.config.permanent_ban_duration)).await;
    }

    async fn handle_mark_ham(&self, user_id: UserId, original_text: Option<String>) {
        if let Some(text) = original_text {
            let msg = synthetic_message_for_training(self.config.primary_chat_id, user_id, 0, &text);
            self.detector.update_ham(&msg).await;
        }
        self.pending_confirmations.lock().unwrap().remove(&user_id);
        self.detector.remove_approved_user(user_id).await;

        if self.config.training || self.config.dry {
            return;
        }
        if let Err(err) = self.platform.unban_user(self.config.primary_chat_id, user_id).await {
            warn!(error = %err, user_id, "unban failed");
        }
    }

    async fn handle_show_info(&self, user_id: UserId) {
        let spam = self.locator.spam(user_id).await.ok().flatten();
        match spam {
            Some(s) => debug!(user_id, checks = %s.checks_json, "admin requested info"),
            None => debug!(user_id, "admin requested info, no locator record"),
        }
    }
}

fn synthetic_idle_message(chat_id: ChatId) -> Message {
    use crate::model::{Author, MessageMeta};
    Message {
        id: 0,
        sent_at: chrono::Utc::now(),
        chat_id,
        from: Author { id: 0, user_name: None, display_name: String::new() },
        text: String::new(),
        reply_to_text: None,
        meta: MessageMeta::default(),
    }
}

fn synthetic_message_for_training(chat_id: ChatId, user_id: UserId, msg_id: MessageId, text: &str) -> Message {
    use crate::model::{Author, MessageMeta};
    Message {
        id: msg_id,
        sent_at: chrono::Utc::now(),
        chat_id,
        from: Author { id: user_id, user_name: None, display_name: String::new() },
        text: text.to_owned(),
        reply_to_text: None,
        meta: MessageMeta::default(),
    }
}

/// In-process `UpdateSource`/submit-handle pairing used by tests and by
/// `main`'s stand-in wiring: a channel the test harness (or a real platform
/// adapter's gateway task) feeds directly.
pub struct ChannelUpdateSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<Update>>,
}

impl ChannelUpdateSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Update>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, ChannelUpdateSource { rx: tokio::sync::Mutex::new(rx) })
    }
}

#[async_trait::async_trait]
impl UpdateSource for ChannelUpdateSource {
    async fn next(&self) -> Option<Update> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapters::NullMessageLogger;
    use crate::approved_users::ApprovedUsersMirror;
    use crate::config::DetectorConfig;
    use crate::db::Db;
    use crate::error::AdapterError;
    use crate::model::test::message;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakePlatform {
        deleted: StdMutex<Vec<MessageId>>,
        banned: StdMutex<Vec<UserId>>,
        notified: AtomicU64,
        super_users: Vec<UserId>,
    }

    impl FakePlatform {
        fn new(super_users: Vec<UserId>) -> Self {
            FakePlatform {
                deleted: StdMutex::new(Vec::new()),
                banned: StdMutex::new(Vec::new()),
                notified: AtomicU64::new(0),
                super_users,
            }
        }
    }

    #[async_trait::async_trait]
    impl PlatformAdapter for FakePlatform {
        async fn send_message(&self, _chat_id: ChatId, _text: &str) -> Result<MessageId, AdapterError> {
            Ok(1)
        }
        async fn delete_message(&self, _chat_id: ChatId, msg_id: MessageId) -> Result<(), AdapterError> {
            self.deleted.lock().unwrap().push(msg_id);
            Ok(())
        }
        async fn ban_user(&self, _chat_id: ChatId, user_id: UserId, _duration: Option<Duration>) -> Result<(), AdapterError> {
            self.banned.lock().unwrap().push(user_id);
            Ok(())
        }
        async fn unban_user(&self, _chat_id: ChatId, _user_id: UserId) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn is_super_user(&self, user_id: UserId) -> bool {
            self.super_users.contains(&user_id)
        }
        async fn send_with_keyboard(
            &self,
            _chat_id: ChatId,
            _text: &str,
            _format: Format,
            _keyboard: &[KeyboardButton],
        ) -> Result<MessageId, AdapterError> {
            self.notified.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    async fn test_db() -> Arc<Db> {
        Db::connect("sqlite::memory:").await.unwrap()
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            gid: 1,
            primary_chat_id: 100,
            admin_chat_id: 200,
            dry: false,
            training: false,
            all_activity_ban_duration: Duration::from_secs(60),
            permanent_ban_duration: Duration::from_secs(3600),
            idle_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn spam_message_is_deleted_banned_and_notified() {
        let db = test_db().await;
        let detector = Arc::new(Detector::new(
            DetectorConfig { min_msg_len: 1, ..Default::default() },
            Arc::new(ApprovedUsersMirror::new()),
        ));
        detector.load_stop_words(vec!["buy now".to_owned()]).await;

        let locator = Arc::new(Locator::new(db.clone(), chrono::Duration::days(1), 0));
        let detected_spam_log = Arc::new(DetectedSpamLog::new(db.clone(), 500));
        let terminators = Terminators {
            all_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
            bots_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
            overall_bot_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
        };
        let platform = Arc::new(FakePlatform::new(vec![]));

        let pipeline = Pipeline::new(
            test_config(),
            detector,
            locator,
            detected_spam_log,
            terminators,
            platform.clone(),
            Arc::new(NullMessageLogger),
        );

        pipeline.clone().handle_message(message("buy now cheap watches")).await;

        assert_eq!(platform.deleted.lock().unwrap().len(), 1);
        assert_eq!(platform.banned.lock().unwrap().len(), 1);
        assert_eq!(platform.notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn super_user_is_never_banned() {
        let db = test_db().await;
        let detector = Arc::new(Detector::new(
            DetectorConfig { min_msg_len: 1, ..Default::default() },
            Arc::new(ApprovedUsersMirror::new()),
        ));
        detector.load_stop_words(vec!["buy now".to_owned()]).await;

        let locator = Arc::new(Locator::new(db.clone(), chrono::Duration::days(1), 0));
        let detected_spam_log = Arc::new(DetectedSpamLog::new(db.clone(), 500));
        let terminators = Terminators {
            all_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
            bots_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
            overall_bot_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
        };
        let platform = Arc::new(FakePlatform::new(vec![crate::model::test::USER_ID]));

        let pipeline = Pipeline::new(
            test_config(),
            detector,
            locator,
            detected_spam_log,
            terminators,
            platform.clone(),
            Arc::new(NullMessageLogger),
        );

        pipeline.clone().handle_message(message("buy now cheap watches")).await;

        assert_eq!(platform.deleted.lock().unwrap().len(), 1);
        assert!(platform.banned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_mode_never_bans_or_deletes() {
        let db = test_db().await;
        let detector = Arc::new(Detector::new(
            DetectorConfig { min_msg_len: 1, ..Default::default() },
            Arc::new(ApprovedUsersMirror::new()),
        ));
        detector.load_stop_words(vec!["buy now".to_owned()]).await;

        let locator = Arc::new(Locator::new(db.clone(), chrono::Duration::days(1), 0));
        let detected_spam_log = Arc::new(DetectedSpamLog::new(db.clone(), 500));
        let terminators = Terminators {
            all_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
            bots_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
            overall_bot_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
        };
        let platform = Arc::new(FakePlatform::new(vec![]));

        let mut config = test_config();
        config.dry = true;
        let pipeline = Pipeline::new(
            config,
            detector,
            locator,
            detected_spam_log,
            terminators,
            platform.clone(),
            Arc::new(NullMessageLogger),
        );

        pipeline.clone().handle_message(message("buy now cheap watches")).await;

        assert!(platform.deleted.lock().unwrap().is_empty());
        assert!(platform.banned.lock().unwrap().is_empty());
        assert_eq!(platform.notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_payload_parses_op_and_ids() {
        let payload = "+42:7";
        let op = payload.chars().next().unwrap();
        let rest = &payload[op.len_utf8()..];
        let (user_id_str, msg_id_str) = rest.split_once(':').unwrap();
        assert_eq!(op, '+');
        assert_eq!(user_id_str.parse::<UserId>().unwrap(), 42);
        assert_eq!(msg_id_str.parse::<MessageId>().unwrap(), 7);
    }
}
