use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Outcome of a single `check` call: whether the subject is currently
/// banned, and whether this call is the one that *just* banned them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminatorResult {
    pub active: bool,
    pub new: bool,
}

#[derive(Debug, Clone)]
struct SubjectState {
    first_hit: DateTime<Utc>,
    hits: u32,
    active_until: Option<DateTime<Utc>>,
}

/// Per-subject sliding-window rate limiter with cooldown (§4.7). Takes an
/// explicit `now` on every call rather than reading the wall clock, so
/// behavior is reproducible under test (§8's Terminator-correctness
/// property).
pub struct Terminator {
    first_hit_window: Duration,
    max_hits: u32,
    ban_duration: Duration,
    subjects: Mutex<HashMap<String, SubjectState>>,
}

impl Terminator {
    pub fn new(first_hit_window: Duration, max_hits: u32, ban_duration: Duration) -> Self {
        Terminator {
            first_hit_window,
            max_hits,
            ban_duration,
            subjects: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, subject: &str, now: DateTime<Utc>) -> TerminatorResult {
        let mut subjects = self.subjects.lock().await;
        Self::evict_expired(&mut subjects, now, self.first_hit_window);
        let state = subjects.get(subject).cloned();

        match state {
            Some(s) if s.active_until.map(|u| u > now).unwrap_or(false) => TerminatorResult {
                active: true,
                new: false,
            },
            Some(s)
                if (now - s.first_hit)
                    .to_std()
                    .map(|d| d > self.first_hit_window)
                    .unwrap_or(true) =>
            {
                subjects.insert(
                    subject.to_owned(),
                    SubjectState {
                        first_hit: now,
                        hits: 1,
                        active_until: None,
                    },
                );
                TerminatorResult {
                    active: false,
                    new: false,
                }
            }
            Some(mut s) => {
                s.hits += 1;
                let result = if s.hits > self.max_hits {
                    s.active_until = Some(now + chrono::Duration::from_std(self.ban_duration).unwrap());
                    TerminatorResult {
                        active: true,
                        new: true,
                    }
                } else {
                    TerminatorResult {
                        active: false,
                        new: false,
                    }
                };
                subjects.insert(subject.to_owned(), s);
                result
            }
            None => {
                subjects.insert(
                    subject.to_owned(),
                    SubjectState {
                        first_hit: now,
                        hits: 1,
                        active_until: None,
                    },
                );
                TerminatorResult {
                    active: false,
                    new: false,
                }
            }
        }
    }

    /// Drops entries whose ban has expired and whose window has also lapsed,
    /// i.e. nothing left worth remembering. Invoked from inside `check`'s own
    /// lock on every call rather than on a timer, per §4.7's
    /// "garbage-collected lazily: expired entries removed on touch".
    fn evict_expired(subjects: &mut HashMap<String, SubjectState>, now: DateTime<Utc>, first_hit_window: Duration) {
        subjects.retain(|_, s| {
            let ban_expired = s.active_until.map(|u| u <= now).unwrap_or(true);
            let window_expired = (now - s.first_hit)
                .to_std()
                .map(|d| d > first_hit_window)
                .unwrap_or(true);
            !(ban_expired && window_expired)
        });
    }

    #[cfg(test)]
    pub async fn gc(&self, now: DateTime<Utc>) {
        let mut subjects = self.subjects.lock().await;
        Self::evict_expired(&mut subjects, now, self.first_hit_window);
    }
}
