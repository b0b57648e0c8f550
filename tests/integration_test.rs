use std::sync::Arc;
use std::time::Duration;

use foxglove::adapters::{Format, KeyboardButton, MessageLogger, NullMessageLogger, PlatformAdapter, Update};
use foxglove::approved_users::ApprovedUsersMirror;
use foxglove::config::DetectorConfig;
use foxglove::db::Db;
use foxglove::detected_spam::DetectedSpamLog;
use foxglove::detector::Detector;
use foxglove::dictionary::{Dictionary, EntryType};
use foxglove::error::AdapterError;
use foxglove::locator::Locator;
use foxglove::model::{ChatId, Message, MessageId, UserId};
use foxglove::pipeline::{Pipeline, PipelineConfig, Terminators};
use foxglove::samples::{Origin, OriginFilter, SampleStore, SampleType};
use foxglove::terminator::Terminator;

struct RecordingPlatform {
    deleted: std::sync::Mutex<Vec<MessageId>>,
    banned: std::sync::Mutex<Vec<UserId>>,
}

impl RecordingPlatform {
    fn new() -> Self {
        RecordingPlatform {
            deleted: std::sync::Mutex::new(Vec::new()),
            banned: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for RecordingPlatform {
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

    async fn unban_user(&self, _chat_id: ChatId, user_id: UserId) -> Result<(), AdapterError> {
        self.banned.lock().unwrap().retain(|u| *u != user_id);
        Ok(())
    }

    async fn is_super_user(&self, _user_id: UserId) -> bool {
        false
    }

    async fn send_with_keyboard(
        &self,
        _chat_id: ChatId,
        _text: &str,
        _format: Format,
        _keyboard: &[KeyboardButton],
    ) -> Result<MessageId, AdapterError> {
        Ok(1)
    }
}

fn message(text: &str, user_id: UserId, chat_id: ChatId) -> Message {
    use foxglove::model::{Author, MessageMeta};
    Message {
        id: 10,
        sent_at: chrono::Utc::now(),
        chat_id,
        from: Author { id: user_id, user_name: Some("spammer".to_owned()), display_name: "Spammer".to_owned() },
        text: text.to_owned(),
        reply_to_text: None,
        meta: MessageMeta::default(),
    }
}

/// End-to-end: persisted samples/dictionary → a Detector reloaded from them
/// → a Pipeline that deletes, bans, and records a spam message, using only
/// the public crate surface (no internal test helpers), mirroring §8's
/// literal end-to-end scenario 1.
#[tokio::test]
async fn pipeline_detects_trained_spam_and_applies_side_effects() {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    let gid = 1;

    let samples = SampleStore::new(db.clone());
    samples.add(gid, SampleType::Spam, Origin::Preset, "win free iphone").await.unwrap();
    samples.add(gid, SampleType::Spam, Origin::Preset, "lottery prize xyz").await.unwrap();
    samples.add(gid, SampleType::Ham, Origin::Preset, "hello world").await.unwrap();
    samples.add(gid, SampleType::Ham, Origin::Preset, "how are you").await.unwrap();
    samples.add(gid, SampleType::Ham, Origin::Preset, "have a good day").await.unwrap();

    let dictionary = Dictionary::new(db.clone());
    dictionary.add(gid, EntryType::IgnoredWord, "xyz").await.unwrap();

    let ignored = dictionary.read(gid, EntryType::IgnoredWord).await.unwrap();
    let spam = samples.read(gid, SampleType::Spam, OriginFilter::Any).await.unwrap();
    let ham = samples.read(gid, SampleType::Ham, OriginFilter::Any).await.unwrap();

    let detector = Arc::new(Detector::new(
        DetectorConfig { min_msg_len: 5, ..Default::default() },
        Arc::new(ApprovedUsersMirror::new()),
    ));
    detector.load_samples(ignored, spam, ham).await;

    let locator = Arc::new(Locator::new(db.clone(), chrono::Duration::days(1), 0));
    let detected_spam_log = Arc::new(DetectedSpamLog::new(db.clone(), 500));
    let terminators = Terminators {
        all_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
        bots_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
        overall_bot_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
    };
    let platform = Arc::new(RecordingPlatform::new());

    let config = PipelineConfig {
        gid,
        primary_chat_id: 100,
        admin_chat_id: 200,
        dry: false,
        training: false,
        all_activity_ban_duration: Duration::from_secs(60),
        permanent_ban_duration: Duration::from_secs(3600),
        idle_interval: Duration::from_secs(3600),
    };

    let pipeline = Pipeline::new(
        config,
        detector,
        locator.clone(),
        detected_spam_log.clone(),
        terminators,
        platform.clone(),
        Arc::new(NullMessageLogger) as Arc<dyn MessageLogger>,
    );

    let spam_msg = message("Win a free iPhone now!", 42, 100);
    pipeline.clone().handle_update(Update::Message(spam_msg.clone())).await;

    assert_eq!(platform.deleted.lock().unwrap().as_slice(), &[10]);
    assert_eq!(platform.banned.lock().unwrap().as_slice(), &[42]);

    let locator_hit = locator.message(&spam_msg.text).await.unwrap();
    assert!(locator_hit.is_some());

    let log_rows = detected_spam_log.read(gid).await.unwrap();
    assert_eq!(log_rows.len(), 1);
    assert_eq!(log_rows[0].user_id, 42);

    let ham_msg = message("Hello, how are you?", 7, 100);
    pipeline.clone().handle_update(Update::Message(ham_msg)).await;
    assert_eq!(platform.deleted.lock().unwrap().len(), 1);
    assert_eq!(platform.banned.lock().unwrap().len(), 1);
}

/// §8 scenario 5: a user who trips the all-activity terminator's hit limit
/// gets banned on the transition call and every subsequent call while the
/// ban is active, without ever reaching the Detector.
#[tokio::test]
async fn all_activity_terminator_bans_before_detector_runs() {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    let gid = 1;

    let detector = Arc::new(Detector::new(DetectorConfig::default(), Arc::new(ApprovedUsersMirror::new())));
    let locator = Arc::new(Locator::new(db.clone(), chrono::Duration::days(1), 0));
    let detected_spam_log = Arc::new(DetectedSpamLog::new(db.clone(), 500));
    let terminators = Terminators {
        all_activity: Terminator::new(Duration::from_secs(10), 1, Duration::from_secs(60)),
        bots_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
        overall_bot_activity: Terminator::new(Duration::from_secs(10), 1000, Duration::from_secs(60)),
    };
    let platform = Arc::new(RecordingPlatform::new());

    let config = PipelineConfig {
        gid,
        primary_chat_id: 100,
        admin_chat_id: 200,
        dry: false,
        training: false,
        all_activity_ban_duration: Duration::from_secs(900),
        permanent_ban_duration: Duration::from_secs(3600),
        idle_interval: Duration::from_secs(3600),
    };

    let pipeline = Pipeline::new(
        config,
        detector,
        locator,
        detected_spam_log,
        terminators,
        platform.clone(),
        Arc::new(NullMessageLogger) as Arc<dyn MessageLogger>,
    );

    pipeline.clone().handle_update(Update::Message(message("hello", 9, 100))).await;
    pipeline.clone().handle_update(Update::Message(message("hello again", 9, 100))).await;
    pipeline.clone().handle_update(Update::Message(message("hello a third time", 9, 100))).await;

    assert_eq!(platform.banned.lock().unwrap().as_slice(), &[9]);
}
