use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::adapters::{AdapterOutcome, LlmVeto, ReputationCheck, SampleUpdater};
use crate::approved_users::ApprovedUsersMirror;
use crate::classifier::{Class, Classifier, Doc};
use crate::config::DetectorConfig;
use crate::model::{CheckResult, Message, UserId, Verdict};
use crate::tokenizer;

/// Everything the Detector needs to hold in memory to answer `check`
/// without touching storage: the classifier, the tokenized spam corpus
/// (for cosine similarity), the stop-phrase and ignored-word lists, and the
/// approved-users mirror (§4.5).
struct DetectorState {
    classifier: Classifier,
    tokenized_spam: Vec<HashMap<String, u32>>,
    stop_phrases: Vec<String>,
    ignored_words: Vec<String>,
}

impl Default for DetectorState {
    fn default() -> Self {
        DetectorState {
            classifier: Classifier::new(),
            tokenized_spam: Vec::new(),
            stop_phrases: Vec::new(),
            ignored_words: Vec::new(),
        }
    }
}

/// Orchestrates every spam check and combines their results into a
/// `Verdict` (§4.5). Optional adapters degrade to "did not run" rather than
/// failing the surrounding check (§4.5.5, §7's `AdapterUnavailable`).
pub struct Detector {
    config: RwLock<DetectorConfig>,
    state: RwLock<DetectorState>,
    approved_users: Arc<ApprovedUsersMirror>,
    reputation: Option<Arc<dyn ReputationCheck>>,
    llm: Option<Arc<dyn LlmVeto>>,
    spam_updater: Option<Arc<dyn SampleUpdater>>,
    ham_updater: Option<Arc<dyn SampleUpdater>>,
}

impl Detector {
    pub fn new(config: DetectorConfig, approved_users: Arc<ApprovedUsersMirror>) -> Self {
        Detector {
            config: RwLock::new(config.normalize()),
            state: RwLock::new(DetectorState::default()),
            approved_users,
            reputation: None,
            llm: None,
            spam_updater: None,
            ham_updater: None,
        }
    }

    pub fn with_reputation(mut self, adapter: Arc<dyn ReputationCheck>) -> Self {
        self.reputation = Some(adapter);
        self
    }

    pub fn with_llm(mut self, adapter: Arc<dyn LlmVeto>) -> Self {
        self.llm = Some(adapter);
        self
    }

    pub fn with_spam_updater(mut self, adapter: Arc<dyn SampleUpdater>) -> Self {
        self.spam_updater = Some(adapter);
        self
    }

    pub fn with_ham_updater(mut self, adapter: Arc<dyn SampleUpdater>) -> Self {
        self.ham_updater = Some(adapter);
        self
    }

    pub async fn set_config(&self, config: DetectorConfig) {
        *self.config.write().await = config.normalize();
    }

    /// The decision algorithm, §4.5.2 step by step.
    pub async fn check(&self, msg: &Message, user_id: UserId) -> Verdict {
        let config = self.config.read().await.clone_inner();
        let mut verdict = Verdict::default();

        let len = msg.char_len();
        if len < config.min_msg_len {
            verdict.push(CheckResult::ham("length", "message shorter than minimum"));
            return verdict;
        }

        if config.first_message_only && self.approved_users.contains(user_id).await {
            verdict.push(CheckResult::ham("pre-approved", "user already passed first-message screening"));
            return verdict;
        }

        let state = self.state.read().await;

        run_check(&mut verdict, "stopword", || check_stop_phrase(msg, &state.stop_phrases));

        if config.emoji_check_enabled() {
            run_check(&mut verdict, "emoji", || check_emoji(msg, config.max_allowed_emoji));
        }

        let tokens = tokenizer::tokenize(&msg.text, &state.ignored_words);

        if config.cosine_enabled() {
            run_check(&mut verdict, "similarity", || {
                check_cosine(&tokens, &state.tokenized_spam, config.similarity_threshold)
            });
        }

        run_check(&mut verdict, "classifier", || {
            check_classifier(&state.classifier, &tokens, &config)
        });

        run_check(&mut verdict, "meta", || check_meta(msg, &config));

        if config.multi_lang_enabled() {
            run_check(&mut verdict, "multi_lang", || check_multi_lang(&tokens, config.multi_lang_words));
        }

        if config.abnormal_spacing.enabled {
            run_check(&mut verdict, "abnormal_spacing", || check_abnormal_spacing(msg, &config));
        }

        drop(state);

        if config.reputation_enabled() {
            if let Some(adapter) = &self.reputation {
                match adapter.check(user_id).await {
                    Ok(AdapterOutcome::Ran { spam }) => {
                        verdict.push(if spam {
                            CheckResult::spam("reputation", "flagged by reputation service")
                        } else {
                            CheckResult::ham("reputation", "clean")
                        });
                    }
                    Ok(AdapterOutcome::DidNotRun) => {
                        verdict.push(CheckResult::ham("reputation", "adapter did not run"));
                    }
                    Err(err) => {
                        warn!(error = %err, "reputation adapter unavailable");
                        verdict.push(CheckResult::ham("reputation", format!("adapter error: {err}")));
                    }
                }
            }
        }

        let should_run_llm = verdict.is_spam() || (len <= config.min_msg_len * 4 && config.check_short_messages);
        if should_run_llm {
            if let Some(adapter) = &self.llm {
                match adapter.check(&msg.text).await {
                    Ok(AdapterOutcome::Ran { spam }) => {
                        verdict.push(if spam {
                            CheckResult::spam("llm", "confirmed by LLM veto")
                        } else {
                            CheckResult::ham("llm", "LLM veto found no spam")
                        });
                    }
                    Ok(AdapterOutcome::DidNotRun) => {
                        verdict.push(CheckResult::ham("llm", "adapter did not run"));
                    }
                    Err(err) => {
                        warn!(error = %err, "llm adapter unavailable");
                        verdict.push(CheckResult::ham("llm", format!("adapter error: {err}")));
                    }
                }
            }
        }

        if !verdict.is_spam() && config.first_message_only {
            self.approved_users.insert(user_id).await;
        }

        verdict
    }

    /// `UpdateSpam`: tokenize, add to the in-memory spam corpus, retrain the
    /// classifier, and forward to the spam-sample adapter (§4.5.4).
    pub async fn update_spam(&self, msg: &Message) {
        let mut state = self.state.write().await;
        let tokens = tokenizer::tokenize(&msg.text, &state.ignored_words);
        state.tokenized_spam.push(tokens.clone());
        state.classifier.learn(&[Doc { class: Class::Spam, tokens }]);
        drop(state);

        if let Some(updater) = &self.spam_updater {
            let normalized = msg.text.replace('\n', " ");
            if let Err(err) = updater.append(&normalized).await {
                warn!(error = %err, "spam sample adapter append failed");
            }
        }
    }

    /// `UpdateHam`: symmetric to `update_spam`. Removing the user from
    /// approved-users, if desired, is the caller's responsibility via
    /// `remove_approved_user` (§4.5.4: "caller responsibility via separate
    /// RemoveApprovedUser").
    pub async fn update_ham(&self, msg: &Message) {
        let mut state = self.state.write().await;
        let tokens = tokenizer::tokenize(&msg.text, &state.ignored_words);
        state.classifier.learn(&[Doc { class: Class::Ham, tokens }]);
        drop(state);

        if let Some(updater) = &self.ham_updater {
            let normalized = msg.text.replace('\n', " ");
            if let Err(err) = updater.append(&normalized).await {
                warn!(error = %err, "ham sample adapter append failed");
            }
        }
    }

    pub async fn remove_approved_user(&self, user_id: UserId) {
        self.approved_users.remove(user_id).await;
    }

    /// Resets tokenized-spam, ignored-tokens and classifier, then reloads
    /// from scratch. Ignored tokens load first so they affect how the spam
    /// and ham corpora tokenize (§4.5.4).
    pub async fn load_samples(
        &self,
        ignored_words: Vec<String>,
        spam_messages: Vec<String>,
        ham_messages: Vec<String>,
    ) {
        let mut state = self.state.write().await;
        state.tokenized_spam.clear();
        state.classifier.reset();
        state.ignored_words = ignored_words;

        let mut docs = Vec::with_capacity(spam_messages.len() + ham_messages.len());
        for text in &spam_messages {
            let tokens = tokenizer::tokenize(text, &state.ignored_words);
            state.tokenized_spam.push(tokens.clone());
            docs.push(Doc { class: Class::Spam, tokens });
        }
        for text in &ham_messages {
            let tokens = tokenizer::tokenize(text, &state.ignored_words);
            docs.push(Doc { class: Class::Ham, tokens });
        }
        state.classifier.learn(&docs);
    }

    pub async fn load_stop_words(&self, stop_phrases: Vec<String>) {
        self.state.write().await.stop_phrases = stop_phrases.into_iter().map(|s| s.to_lowercase()).collect();
    }
}

/// `config` is cloned out from behind its lock once per `check` call so the
/// rest of the pipeline doesn't hold the lock across adapter I/O.
impl DetectorConfig {
    fn clone_inner(&self) -> DetectorConfig {
        self.clone()
    }
}

/// Runs a single check under `catch_unwind` so a panicking check degrades to
/// a non-spam result instead of unwinding the whole `Detector::check` call
/// (§4.5.5, §9). Checks are plain synchronous `fn`s, so `AssertUnwindSafe` is
/// sound here: none of them hold a lock or other guard across the call.
fn run_check(verdict: &mut Verdict, name: &str, check: impl FnOnce() -> CheckResult) {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(check)) {
        Ok(result) => verdict.push(result),
        Err(_) => {
            warn!(check = name, "check panicked, treating as non-spam");
            verdict.push(CheckResult::ham(name, "check panicked"));
        }
    }
}

fn check_stop_phrase(msg: &Message, stop_phrases: &[String]) -> CheckResult {
    let haystack = tokenizer::normalize_for_substring_match(&msg.text);
    for phrase in stop_phrases {
        if haystack.contains(phrase.as_str()) {
            return CheckResult::spam("stopword", phrase.clone());
        }
    }
    CheckResult::ham("stopword", "no match")
}

fn check_emoji(msg: &Message, max_allowed: i32) -> CheckResult {
    let count = tokenizer::count_emoji(&msg.text);
    if count as i64 > max_allowed as i64 {
        CheckResult::spam("emoji", format!("emoji {count}/{max_allowed}"))
    } else {
        CheckResult::ham("emoji", format!("emoji {count}/{max_allowed}"))
    }
}

fn cosine_similarity(a: &HashMap<String, u32>, b: &HashMap<String, u32>) -> f64 {
    let mut dot = 0.0f64;
    for (token, count_a) in a {
        if let Some(count_b) = b.get(token) {
            dot += (*count_a as f64) * (*count_b as f64);
        }
    }
    let norm_a = (a.values().map(|c| (*c as f64).powi(2)).sum::<f64>()).sqrt();
    let norm_b = (b.values().map(|c| (*c as f64).powi(2)).sum::<f64>()).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn check_cosine(tokens: &HashMap<String, u32>, spam_corpus: &[HashMap<String, u32>], threshold: f64) -> CheckResult {
    let max = spam_corpus
        .iter()
        .map(|sample| cosine_similarity(tokens, sample))
        .fold(0.0f64, f64::max);

    if max >= threshold {
        CheckResult::spam("similarity", format!("cosine {max:.3} >= {threshold:.3}"))
    } else {
        CheckResult::ham("similarity", format!("cosine {max:.3} < {threshold:.3}"))
    }
}

fn check_classifier(classifier: &Classifier, tokens: &HashMap<String, u32>, config: &DetectorConfig) -> CheckResult {
    if !classifier.is_trained() {
        return CheckResult::ham("classifier", "no training");
    }

    let result = classifier.classify(tokens);
    let probability = result.spam_probability_pct();
    let gated_by_probability = !config.classifier_gating_enabled() || probability >= config.min_spam_probability;
    let is_spam = result.certain && result.best_class == Some(Class::Spam) && gated_by_probability;

    let details = format!(
        "spam_probability={probability:.2} log_spam={:.3} log_ham={:.3}",
        result.scores.get(&Class::Spam).copied().unwrap_or(f64::NEG_INFINITY),
        result.scores.get(&Class::Ham).copied().unwrap_or(f64::NEG_INFINITY),
    );

    if is_spam {
        CheckResult::spam("classifier", details)
    } else {
        CheckResult::ham("classifier", details)
    }
}

fn check_meta(msg: &Message, config: &DetectorConfig) -> CheckResult {
    let meta = &msg.meta;
    let rules = &config.meta_checks;

    if let Some(limit) = rules.links_limit {
        if meta.links > limit {
            return CheckResult::spam("meta", format!("links {} > {limit}", meta.links));
        }
    }
    if let Some(limit) = rules.mentions_limit {
        if meta.mentions > limit {
            return CheckResult::spam("meta", format!("mentions {} > {limit}", meta.mentions));
        }
    }
    if rules.image_only && msg.is_image_only() {
        return CheckResult::spam("meta", "image only");
    }
    if rules.links_only && meta.links > 0 && msg.text.trim().is_empty() {
        return CheckResult::spam("meta", "links only");
    }
    if rules.videos_only && meta.has_video && msg.text.trim().is_empty() {
        return CheckResult::spam("meta", "video only");
    }
    if rules.audios_only && meta.has_audio && msg.text.trim().is_empty() {
        return CheckResult::spam("meta", "audio only");
    }
    if rules.forward && meta.is_forward {
        return CheckResult::spam("meta", "forwarded message");
    }
    if rules.keyboard && meta.has_keyboard {
        return CheckResult::spam("meta", "inline keyboard present");
    }
    if !rules.username_symbols.is_empty()
        && msg
            .from
            .display_name
            .chars()
            .any(|c| rules.username_symbols.contains(c))
    {
        return CheckResult::spam("meta", "display name contains flagged symbol");
    }

    CheckResult::ham("meta", "no rule matched")
}

fn script_family(c: char) -> Option<&'static str> {
    match c {
        'a'..='z' | 'A'..='Z' => Some("latin"),
        '\u{0400}'..='\u{04FF}' => Some("cyrillic"),
        '\u{4E00}'..='\u{9FFF}' => Some("han"),
        _ => None,
    }
}

fn check_multi_lang(tokens: &HashMap<String, u32>, threshold: i32) -> CheckResult {
    let mixed = tokens
        .keys()
        .filter(|token| {
            let families: std::collections::HashSet<_> = token.chars().filter_map(script_family).collect();
            families.len() > 1
        })
        .count();

    if mixed as i32 > threshold {
        CheckResult::spam("multi_lang", format!("{mixed} mixed-script tokens > {threshold}"))
    } else {
        CheckResult::ham("multi_lang", format!("{mixed} mixed-script tokens"))
    }
}

fn check_abnormal_spacing(msg: &Message, config: &DetectorConfig) -> CheckResult {
    let cfg = &config.abnormal_spacing;
    let text = &msg.text;
    let total_chars = text.chars().count().max(1);
    let whitespace_chars = text.chars().filter(|c| c.is_whitespace()).count();
    let whitespace_ratio = whitespace_chars as f64 / total_chars as f64;

    let words: Vec<&str> = text.split_whitespace().collect();
    let total_words = words.len();
    let short_words = words.iter().filter(|w| w.chars().count() <= cfg.short_word_len).count();
    let short_word_ratio = if total_words == 0 {
        0.0
    } else {
        short_words as f64 / total_words as f64
    };

    let spam = whitespace_ratio > cfg.ratio || (short_word_ratio > cfg.short_word_ratio && total_words >= cfg.min_words);

    let details = format!(
        "whitespace_ratio={whitespace_ratio:.2} short_word_ratio={short_word_ratio:.2} words={total_words}"
    );

    if spam {
        CheckResult::spam("abnormal_spacing", details)
    } else {
        CheckResult::ham("abnormal_spacing", details)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::test::message;

    fn detector(config: DetectorConfig) -> Detector {
        Detector::new(config, Arc::new(ApprovedUsersMirror::new()))
    }

    #[tokio::test]
    async fn too_short_message_skips_all_checks() {
        let det = detector(DetectorConfig {
            min_msg_len: 10,
            ..Default::default()
        });
        let verdict = det.check(&message("hi"), 1).await;
        assert!(!verdict.is_spam());
        assert_eq!(verdict.results.len(), 1);
        assert_eq!(verdict.results[0].name, "length");
    }

    #[tokio::test]
    async fn stop_phrase_flags_spam_scenario_3() {
        let det = detector(DetectorConfig {
            max_allowed_emoji: -1,
            ..Default::default()
        });
        det.load_stop_words(vec!["в личку".to_owned(), "всем привет".to_owned()]).await;

        let verdict = det.check(&message("👋Всем привет\nПишите в лс✍️"), 0).await;
        assert!(verdict.is_spam());
        assert_eq!(verdict.primary_reason().unwrap().name, "stopword");
    }

    #[tokio::test]
    async fn emoji_count_flags_spam_scenario_4() {
        let det = detector(DetectorConfig {
            max_allowed_emoji: 2,
            ..Default::default()
        });
        let verdict = det.check(&message("😁🐶🍕"), 0).await;
        assert!(verdict.is_spam());
        let reason = verdict.primary_reason().unwrap();
        assert_eq!(reason.name, "emoji");
        assert!(reason.details.contains("3/2"));
    }

    #[tokio::test]
    async fn classifier_training_scenario_1_and_2() {
        let det = detector(DetectorConfig {
            min_msg_len: 5,
            ..Default::default()
        });

        det.update_spam(&message("win free iphone")).await;
        det.update_spam(&message("lottery prize xyz")).await;
        det.update_ham(&message("hello world")).await;
        det.update_ham(&message("how are you")).await;
        det.update_ham(&message("have a good day")).await;

        let spammy = det.check(&message("Win a free iPhone now!"), 0).await;
        assert!(spammy.is_spam());
        assert!(spammy.results.iter().any(|r| r.name == "classifier" && r.spam));

        let hammy = det.check(&message("Hello, how are you?"), 0).await;
        assert!(!hammy.is_spam());
        let classifier_result = hammy.results.iter().find(|r| r.name == "classifier").unwrap();
        assert!(classifier_result.details.contains("log_spam"));
        assert!(classifier_result.details.contains("log_ham"));
    }

    #[tokio::test]
    async fn first_message_only_approves_clean_users() {
        let det = detector(DetectorConfig {
            first_message_only: true,
            min_msg_len: 1,
            ..Default::default()
        });

        let verdict = det.check(&message("hello there"), 42).await;
        assert!(!verdict.is_spam());
        assert!(det.approved_users.contains(42).await);

        let second = det.check(&message("anything"), 42).await;
        assert_eq!(second.results[0].name, "pre-approved");
    }
}
