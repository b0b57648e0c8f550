use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use foxglove::adapters::{
    Format, KeyboardButton, MessageLogger, NullLlmVeto, NullReputationCheck, NullSampleUpdater,
    PlatformAdapter,
};
use foxglove::approved_users::{ApprovedUsersMirror, ApprovedUsersStore};
use foxglove::config::DetectorConfig;
use foxglove::db::Db;
use foxglove::detected_spam::DetectedSpamLog;
use foxglove::detector::Detector;
use foxglove::dictionary::{Dictionary, EntryType};
use foxglove::error::AdapterError;
use foxglove::locator::Locator;
use foxglove::model::{ChatId, GroupId, Message, MessageId, UserId};
use foxglove::pipeline::{ChannelUpdateSource, Pipeline, PipelineConfig, Terminators};
use foxglove::samples::{OriginFilter, SampleStore, SampleType};
use foxglove::terminator::Terminator;

/// The out-of-scope platform collaborator (§1), stood in here with a
/// logging-only implementation so the crate produces a runnable binary
/// without a real Telegram/Discord/etc. client wired in. A real deployment
/// swaps this for an adapter that actually talks to the platform.
struct LoggingPlatformAdapter;

#[async_trait::async_trait]
impl PlatformAdapter for LoggingPlatformAdapter {
    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<MessageId, AdapterError> {
        info!(chat_id, text, "[stand-in] send_message");
        Ok(0)
    }

    async fn delete_message(&self, chat_id: ChatId, msg_id: MessageId) -> Result<(), AdapterError> {
        info!(chat_id, msg_id, "[stand-in] delete_message");
        Ok(())
    }

    async fn ban_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        duration: Option<Duration>,
    ) -> Result<(), AdapterError> {
        info!(chat_id, user_id, ?duration, "[stand-in] ban_user");
        Ok(())
    }

    async fn unban_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), AdapterError> {
        info!(chat_id, user_id, "[stand-in] unban_user");
        Ok(())
    }

    async fn is_super_user(&self, _user_id: UserId) -> bool {
        false
    }

    async fn send_with_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        format: Format,
        keyboard: &[KeyboardButton],
    ) -> Result<MessageId, AdapterError> {
        info!(chat_id, text, ?format, buttons = keyboard.len(), "[stand-in] send_with_keyboard");
        Ok(0)
    }
}

struct LoggingMessageLogger;

#[async_trait::async_trait]
impl MessageLogger for LoggingMessageLogger {
    async fn log(&self, msg: &Message) -> Result<(), AdapterError> {
        tracing::trace!(msg_id = msg.id, chat_id = msg.chat_id, "[stand-in] message logged");
        Ok(())
    }
}

const DEFAULT_GID: GroupId = 1;
const DEFAULT_DB_URL: &str = "sqlite::memory:";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    foxglove::init_tracing();
    dotenv::dotenv().ok();

    let _sentry_guard = std::env::var("SENTRY_DSN").ok().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let db_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_URL.to_owned());
    let db = Db::connect(&db_url).await.wrap_err("failed to connect to database")?;

    let samples = Arc::new(SampleStore::new(db.clone()));
    let dictionary = Arc::new(Dictionary::new(db.clone()));
    let approved_users_store = Arc::new(ApprovedUsersStore::new(db.clone()));
    let detected_spam_log = Arc::new(DetectedSpamLog::new(db.clone(), 500));
    let locator = Arc::new(Locator::new(db.clone(), chrono::Duration::days(14), 200));

    let approved_users_mirror = Arc::new(ApprovedUsersMirror::new());
    let persisted_approved = approved_users_store
        .read(DEFAULT_GID)
        .await
        .wrap_err("failed to load approved users")?;
    approved_users_mirror
        .load(persisted_approved.into_iter().map(|u| u.user_id))
        .await;

    let detector = Arc::new(
        Detector::new(DetectorConfig::default(), approved_users_mirror.clone())
            .with_reputation(Arc::new(NullReputationCheck))
            .with_llm(Arc::new(NullLlmVeto))
            .with_spam_updater(Arc::new(NullSampleUpdater))
            .with_ham_updater(Arc::new(NullSampleUpdater)),
    );

    reload_detector_from_stores(&detector, &samples, &dictionary, DEFAULT_GID)
        .await
        .wrap_err("failed to load initial samples/dictionary into detector")?;

    let watch_paths: Vec<PathBuf> = std::env::var("FOXGLOVE_WATCH_PATHS")
        .ok()
        .map(|s| s.split(',').map(PathBuf::from).collect())
        .unwrap_or_default();

    let cancel = CancellationToken::new();
    let _watcher = if !watch_paths.is_empty() {
        let detector_for_watch = detector.clone();
        let samples_for_watch = samples.clone();
        let dictionary_for_watch = dictionary.clone();
        Some(foxglove::watcher::Watcher::watch(
            watch_paths,
            Duration::from_millis(300),
            move |_path| {
                let detector = detector_for_watch.clone();
                let samples = samples_for_watch.clone();
                let dictionary = dictionary_for_watch.clone();
                tokio::spawn(async move {
                    if let Err(err) = reload_detector_from_stores(&detector, &samples, &dictionary, DEFAULT_GID).await {
                        tracing::error!(error = %err, "sample reload failed");
                    }
                });
                Ok(())
            },
        ))
    } else {
        None
    };

    let terminators = Terminators {
        all_activity: Terminator::new(Duration::from_secs(10), 5, Duration::from_secs(300)),
        bots_activity: Terminator::new(Duration::from_secs(10), 20, Duration::from_secs(60)),
        overall_bot_activity: Terminator::new(Duration::from_secs(1), 30, Duration::from_secs(30)),
    };

    let pipeline_config = PipelineConfig {
        gid: DEFAULT_GID,
        primary_chat_id: 0,
        admin_chat_id: 0,
        dry: std::env::var("FOXGLOVE_DRY_RUN").is_ok(),
        training: std::env::var("FOXGLOVE_TRAINING").is_ok(),
        all_activity_ban_duration: Duration::from_secs(15 * 60),
        permanent_ban_duration: Duration::from_secs(0),
        idle_interval: Duration::from_secs(30),
    };

    let pipeline = Pipeline::new(
        pipeline_config,
        detector,
        locator,
        detected_spam_log,
        terminators,
        Arc::new(LoggingPlatformAdapter),
        Arc::new(LoggingMessageLogger),
    );

    // A real deployment replaces `ChannelUpdateSource` with an adapter that
    // drains the platform's own gateway/long-poll stream; this stand-in
    // just gives the pipeline something to select over so the binary is
    // runnable end to end (§1: the platform client is out of scope).
    let (_update_tx, update_source) = ChannelUpdateSource::new(100);

    info!("foxglove core online");
    let run_handle = tokio::spawn(pipeline.run(Box::new(update_source), cancel.clone()));

    signal::ctrl_c().await.wrap_err("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = run_handle.await;

    Ok(())
}

/// Rebuilds the Detector's in-memory state from the persisted stores: the
/// ignored-words dictionary first (so it affects tokenization of what
/// follows), then spam and ham samples, then stop-phrases (§4.5.4's
/// `LoadSamples`/`LoadStopWords` ordering).
async fn reload_detector_from_stores(
    detector: &Detector,
    samples: &SampleStore,
    dictionary: &Dictionary,
    gid: GroupId,
) -> Result<()> {
    let ignored_words = dictionary.read(gid, EntryType::IgnoredWord).await?;
    let spam_messages = samples.read(gid, SampleType::Spam, OriginFilter::Any).await?;
    let ham_messages = samples.read(gid, SampleType::Ham, OriginFilter::Any).await?;
    let stop_phrases = dictionary.read(gid, EntryType::StopPhrase).await?;

    detector.load_samples(ignored_words, spam_messages, ham_messages).await;
    detector.load_stop_words(stop_phrases).await;

    info!(gid, "detector reloaded from persisted stores");
    Ok(())
}
