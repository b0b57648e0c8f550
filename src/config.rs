use serde::{Deserialize, Serialize};

/// Abnormal-spacing heuristic thresholds (§4.5.1 `AbnormalSpacing`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbnormalSpacingConfig {
    pub enabled: bool,
    pub ratio: f64,
    pub short_word_ratio: f64,
    pub short_word_len: usize,
    pub min_words: usize,
}

impl Default for AbnormalSpacingConfig {
    fn default() -> Self {
        AbnormalSpacingConfig {
            enabled: false,
            ratio: 0.5,
            short_word_ratio: 0.5,
            short_word_len: 2,
            min_words: 5,
        }
    }
}

/// Meta-rule toggles (§4.5.3). Each field is independently optional;
/// `None`/`0`/empty disables the corresponding rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaChecksConfig {
    pub links_limit: Option<u32>,
    pub mentions_limit: Option<u32>,
    pub image_only: bool,
    pub links_only: bool,
    pub videos_only: bool,
    pub audios_only: bool,
    pub forward: bool,
    pub keyboard: bool,
    pub username_symbols: String,
}

/// The Detector's enumerated configuration (§4.5.1). Mutually exclusive
/// pairs (`FirstMessagesCount` vs `ParanoidMode`) are resolved in
/// `DetectorConfig::normalize`, not left for the caller to reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub similarity_threshold: f64,
    pub min_msg_len: usize,
    pub max_allowed_emoji: i32,
    pub min_spam_probability: f64,
    pub cas_api: String,
    pub first_message_only: bool,
    pub first_messages_count: i32,
    pub paranoid_mode: bool,
    pub multi_lang_words: i32,
    pub abnormal_spacing: AbnormalSpacingConfig,
    pub meta_checks: MetaChecksConfig,
    pub check_short_messages: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            similarity_threshold: 0.0,
            min_msg_len: 1,
            max_allowed_emoji: -1,
            min_spam_probability: 0.0,
            cas_api: String::new(),
            first_message_only: false,
            first_messages_count: 0,
            paranoid_mode: false,
            multi_lang_words: 0,
            abnormal_spacing: AbnormalSpacingConfig::default(),
            meta_checks: MetaChecksConfig::default(),
            check_short_messages: false,
        }
    }
}

impl DetectorConfig {
    /// Applies the deterministic precedence rule from §4.5.1 / §9's first
    /// open question: `ParanoidMode`, if set, forces `FirstMessageOnly=false`
    /// and `FirstMessagesCount=0`, overriding whatever the caller set those
    /// to. `FirstMessagesCount > 0` (when `ParanoidMode` is off) forces
    /// `FirstMessageOnly=true`.
    pub fn normalize(mut self) -> Self {
        if self.paranoid_mode {
            self.first_message_only = false;
            self.first_messages_count = 0;
        } else if self.first_messages_count > 0 {
            self.first_message_only = true;
        }
        self
    }

    pub fn cosine_enabled(&self) -> bool {
        self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0
    }

    pub fn emoji_check_enabled(&self) -> bool {
        self.max_allowed_emoji >= 0
    }

    pub fn classifier_gating_enabled(&self) -> bool {
        self.min_spam_probability > 0.0
    }

    pub fn reputation_enabled(&self) -> bool {
        !self.cas_api.is_empty()
    }

    pub fn multi_lang_enabled(&self) -> bool {
        self.multi_lang_words > 0
    }

    /// Collects human-readable problems instead of failing on the first one,
    /// mirroring the teacher's `validate_config` in spirit (§C of the
    /// expanded spec).
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            problems.push(format!(
                "similarity_threshold must be in [0, 1], got {}",
                self.similarity_threshold
            ));
        }
        if !(0.0..=100.0).contains(&self.min_spam_probability) {
            problems.push(format!(
                "min_spam_probability must be in [0, 100], got {}",
                self.min_spam_probability
            ));
        }
        if self.paranoid_mode && self.first_messages_count > 0 {
            problems.push(
                "paranoid_mode and first_messages_count are both set; paranoid_mode wins and first_messages_count has no effect".to_owned(),
            );
        }
        if self.abnormal_spacing.enabled {
            if !(0.0..=1.0).contains(&self.abnormal_spacing.ratio) {
                problems.push(format!(
                    "abnormal_spacing.ratio must be in [0, 1], got {}",
                    self.abnormal_spacing.ratio
                ));
            }
            if !(0.0..=1.0).contains(&self.abnormal_spacing.short_word_ratio) {
                problems.push(format!(
                    "abnormal_spacing.short_word_ratio must be in [0, 1], got {}",
                    self.abnormal_spacing.short_word_ratio
                ));
            }
        }
        problems
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn paranoid_mode_wins_over_first_messages_count() {
        let cfg = DetectorConfig {
            paranoid_mode: true,
            first_messages_count: 5,
            first_message_only: false,
            ..Default::default()
        }
        .normalize();

        assert!(!cfg.first_message_only);
        assert_eq!(cfg.first_messages_count, 0);
    }

    #[test]
    fn first_messages_count_forces_first_message_only() {
        let cfg = DetectorConfig {
            first_messages_count: 3,
            ..Default::default()
        }
        .normalize();

        assert!(cfg.first_message_only);
    }

    #[test]
    fn validate_flags_conflicting_paranoid_and_count() {
        let cfg = DetectorConfig {
            paranoid_mode: true,
            first_messages_count: 5,
            ..Default::default()
        };
        let problems = cfg.validate();
        assert!(problems.iter().any(|p| p.contains("paranoid_mode")));
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(DetectorConfig::default().validate().is_empty());
    }
}
