use std::collections::{HashMap, HashSet};

/// Either of the two classes the classifier trains and predicts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum Class {
    Ham,
    Spam,
}

impl Class {
    const ALL: [Class; 2] = [Class::Ham, Class::Spam];
}

/// One training document: a class label plus its token→count bag. Only the
/// token *set* matters to `Learn` (§4.2 dedups tokens within a doc), but we
/// accept the same bag shape `Classify` works on so callers don't need two
/// representations.
#[derive(Debug, Clone)]
pub struct Doc {
    pub class: Class,
    pub tokens: HashMap<String, u32>,
}

/// The result of `Classify`: per-class log-probabilities, the best class, and
/// whether it's unambiguous.
#[derive(Debug, Clone)]
pub struct Classification {
    pub scores: HashMap<Class, f64>,
    pub best_class: Option<Class>,
    pub certain: bool,
}

impl Classification {
    /// Maps `(scores[spam], scores[ham])` onto a `[0, 100]` spam-probability
    /// scale via the standard two-class log-odds normalization
    /// `1 / (1 + exp(ham - spam))`. Returns 0 if either score is missing
    /// (i.e. the classifier has never seen that class).
    pub fn spam_probability_pct(&self) -> f64 {
        let (Some(&spam), Some(&ham)) = (self.scores.get(&Class::Spam), self.scores.get(&Class::Ham)) else {
            return 0.0;
        };
        let diff = ham - spam;
        // guard against overflow for very confident (very negative) diffs
        let odds = if diff > 700.0 { 0.0 } else { 1.0 / (1.0 + diff.exp()) };
        odds * 100.0
    }
}

/// Multinomial naive Bayes with Laplace (add-one) smoothing, trained and
/// queried over deduplicated token bags (§4.2).
#[derive(Debug, Default)]
pub struct Classifier {
    token_freq_by_class: HashMap<Class, HashMap<String, u64>>,
    freq_by_class: HashMap<Class, u64>,
    docs_by_class: HashMap<Class, u64>,
    n_docs: u64,
    vocab: HashSet<String>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trains on a batch of documents. Each doc's tokens are deduplicated
    /// before counting (repeated words in one message count once per doc).
    pub fn learn(&mut self, docs: &[Doc]) {
        for doc in docs {
            let class_tokens = self.token_freq_by_class.entry(doc.class).or_default();
            *self.docs_by_class.entry(doc.class).or_insert(0) += 1;
            self.n_docs += 1;

            for token in doc.tokens.keys() {
                *class_tokens.entry(token.clone()).or_insert(0) += 1;
                *self.freq_by_class.entry(doc.class).or_insert(0) += 1;
                self.vocab.insert(token.clone());
            }
        }
    }

    fn prior(&self, class: Class) -> f64 {
        let docs = *self.docs_by_class.get(&class).unwrap_or(&0) as f64;
        if self.n_docs == 0 || docs == 0.0 {
            return f64::NEG_INFINITY;
        }
        (docs / self.n_docs as f64).ln()
    }

    /// Classifies a deduplicated token bag. Returns `certain = false` and no
    /// `best_class` when the classifier has no training data at all, or when
    /// the top two classes tie exactly.
    pub fn classify(&self, tokens: &HashMap<String, u32>) -> Classification {
        if self.n_docs == 0 {
            return Classification {
                scores: HashMap::new(),
                best_class: None,
                certain: false,
            };
        }

        let vocab_size = self.vocab.len() as f64;
        let mut scores = HashMap::new();

        for class in Class::ALL {
            let mut log_prob = self.prior(class);
            if log_prob.is_infinite() {
                continue;
            }
            let class_total = *self.freq_by_class.get(&class).unwrap_or(&0) as f64;
            let class_tokens = self.token_freq_by_class.get(&class);

            for token in tokens.keys() {
                let freq = class_tokens
                    .and_then(|m| m.get(token))
                    .copied()
                    .unwrap_or(0) as f64;
                log_prob += ((freq + 1.0) / (class_total + vocab_size)).ln();
            }

            scores.insert(class, log_prob);
        }

        let mut ranked: Vec<(Class, f64)> = scores.iter().map(|(&c, &s)| (c, s)).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

        let best_class = ranked.first().map(|(c, _)| *c);
        let certain = match ranked.as_slice() {
            [first, second, ..] => first.1 > second.1,
            [_] => true,
            [] => false,
        };

        Classification {
            scores,
            best_class,
            certain,
        }
    }

    pub fn reset(&mut self) {
        self.token_freq_by_class.clear();
        self.freq_by_class.clear();
        self.docs_by_class.clear();
        self.n_docs = 0;
        self.vocab.clear();
    }

    pub fn is_trained(&self) -> bool {
        self.n_docs > 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bag(words: &[&str]) -> HashMap<String, u32> {
        let mut m = HashMap::new();
        for w in words {
            *m.entry(w.to_string()).or_insert(0) += 1;
        }
        m
    }

    fn doc(class: Class, words: &[&str]) -> Doc {
        Doc {
            class,
            tokens: bag(words),
        }
    }

    #[test]
    fn untrained_classifier_is_uncertain() {
        let c = Classifier::new();
        let result = c.classify(&bag(&["free", "iphone"]));
        assert_eq!(result.best_class, None);
        assert!(!result.certain);
    }

    #[test]
    fn classifies_spam_leaning_message() {
        let mut c = Classifier::new();
        c.learn(&[
            doc(Class::Spam, &["win", "free", "iphone"]),
            doc(Class::Spam, &["lottery", "prize", "claim"]),
            doc(Class::Ham, &["hello", "world"]),
            doc(Class::Ham, &["how", "are", "you"]),
        ]);

        let result = c.classify(&bag(&["win", "free", "iphone", "now"]));
        assert_eq!(result.best_class, Some(Class::Spam));
        assert!(result.certain);
    }

    #[test]
    fn classifies_ham_leaning_message() {
        let mut c = Classifier::new();
        c.learn(&[
            doc(Class::Spam, &["win", "free", "iphone"]),
            doc(Class::Spam, &["lottery", "prize", "claim"]),
            doc(Class::Ham, &["hello", "world"]),
            doc(Class::Ham, &["how", "are", "you"]),
        ]);

        let result = c.classify(&bag(&["hello", "how", "are", "you"]));
        assert_eq!(result.best_class, Some(Class::Ham));
        assert!(result.certain);
    }

    #[test]
    fn reset_clears_training() {
        let mut c = Classifier::new();
        c.learn(&[doc(Class::Spam, &["win"])]);
        assert!(c.is_trained());
        c.reset();
        assert!(!c.is_trained());
    }

    #[test]
    fn spam_probability_is_high_for_confident_spam() {
        let mut c = Classifier::new();
        for _ in 0..20 {
            c.learn(&[doc(Class::Spam, &["win", "free", "iphone", "lottery"])]);
        }
        for _ in 0..20 {
            c.learn(&[doc(Class::Ham, &["hello", "world", "how", "are"])]);
        }

        let result = c.classify(&bag(&["win", "free", "iphone", "lottery"]));
        assert!(result.spam_probability_pct() > 90.0);
    }
}
