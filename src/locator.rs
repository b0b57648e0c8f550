use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::db::{decode_ts, encode_ts, Db};
use crate::error::CoreResult;
use crate::model::{ChatId, GroupId, MessageId, UserId};

#[derive(Debug, Clone)]
pub struct LocatorMessage {
    pub msg_hash: String,
    pub gid: GroupId,
    pub ts: DateTime<Utc>,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub user_name: Option<String>,
    pub msg_id: MessageId,
}

#[derive(Debug, Clone)]
pub struct LocatorSpam {
    pub user_id: UserId,
    pub gid: GroupId,
    pub ts: DateTime<Utc>,
    pub checks_json: String,
}

fn hash_text(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{digest:x}")
}

/// Bounded TTL+min-size index from message fingerprint to originator (§4.8).
/// Used to trace an admin's forwarded report back to the user who sent it.
pub struct Locator {
    db: Arc<Db>,
    ttl: Duration,
    min_size: u64,
}

impl Locator {
    pub fn new(db: Arc<Db>, ttl: Duration, min_size: u64) -> Self {
        Locator { db, ttl, min_size }
    }

    pub async fn add_message(
        &self,
        gid: GroupId,
        chat_id: ChatId,
        user_id: UserId,
        user_name: Option<&str>,
        msg_id: MessageId,
        text: &str,
    ) -> CoreResult<()> {
        let hash = hash_text(text);
        let now = encode_ts(Utc::now());
        let _guard = self.db.write_guard().await;

        sqlx::query(
            "INSERT INTO messages (hash, gid, ts, chat_id, user_id, user_name, msg_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (hash) DO UPDATE SET ts = excluded.ts, chat_id = excluded.chat_id,
                 user_id = excluded.user_id, user_name = excluded.user_name, msg_id = excluded.msg_id",
        )
        .bind(&hash)
        .bind(gid)
        .bind(now)
        .bind(chat_id)
        .bind(user_id)
        .bind(user_name)
        .bind(msg_id)
        .execute(self.db.pool())
        .await?;

        self.evict(gid).await?;
        Ok(())
    }

    pub async fn add_spam(&self, user_id: UserId, gid: GroupId, checks_json: &str) -> CoreResult<()> {
        let now = encode_ts(Utc::now());
        let _guard = self.db.write_guard().await;
        sqlx::query(
            "INSERT INTO spam (user_id, gid, ts, checks) VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id) DO UPDATE SET gid = excluded.gid, ts = excluded.ts, checks = excluded.checks",
        )
        .bind(user_id)
        .bind(gid)
        .bind(now)
        .bind(checks_json)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn message(&self, text: &str) -> CoreResult<Option<LocatorMessage>> {
        let hash = hash_text(text);
        let _guard = self.db.read_guard().await;
        let row = sqlx::query(
            "SELECT hash, gid, ts, chat_id, user_id, user_name, msg_id FROM messages WHERE hash = $1",
        )
        .bind(&hash)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| {
            Ok(LocatorMessage {
                msg_hash: r.get("hash"),
                gid: r.get("gid"),
                ts: decode_ts(&r.get::<String, _>("ts"))?,
                chat_id: r.get("chat_id"),
                user_id: r.get("user_id"),
                user_name: r.get("user_name"),
                msg_id: r.get("msg_id"),
            })
        })
        .transpose()
    }

    pub async fn user_id_by_name(&self, gid: GroupId, user_name: &str) -> CoreResult<Option<UserId>> {
        let _guard = self.db.read_guard().await;
        let row = sqlx::query(
            "SELECT user_id FROM messages WHERE gid = $1 AND user_name = $2 ORDER BY ts DESC LIMIT 1",
        )
        .bind(gid)
        .bind(user_name)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|r| r.get("user_id")))
    }

    pub async fn user_name_by_id(&self, gid: GroupId, user_id: UserId) -> CoreResult<Option<String>> {
        let _guard = self.db.read_guard().await;
        let row = sqlx::query(
            "SELECT user_name FROM messages WHERE gid = $1 AND user_id = $2 ORDER BY ts DESC LIMIT 1",
        )
        .bind(gid)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.and_then(|r| r.get("user_name")))
    }

    pub async fn spam(&self, user_id: UserId) -> CoreResult<Option<LocatorSpam>> {
        let _guard = self.db.read_guard().await;
        let row = sqlx::query("SELECT user_id, gid, ts, checks FROM spam WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|r| {
            Ok(LocatorSpam {
                user_id: r.get("user_id"),
                gid: r.get("gid"),
                ts: decode_ts(&r.get::<String, _>("ts"))?,
                checks_json: r.get("checks"),
            })
        })
        .transpose()
    }

    /// Delete rows older than `ttl` for this gid, but only if doing so would
    /// still leave at least `min_size` rows — both conditions are required
    /// together so a quiet gid never gets emptied out (§4.8, §8 Locator
    /// bound property).
    async fn evict(&self, gid: GroupId) -> CoreResult<()> {
        let total: i64 = sqlx::query("SELECT COUNT(*) as n FROM messages WHERE gid = $1")
            .bind(gid)
            .fetch_one(self.db.pool())
            .await?
            .get("n");

        if (total as u64) <= self.min_size {
            return Ok(());
        }

        let cutoff = encode_ts(Utc::now() - self.ttl);
        let excess = (total as u64) - self.min_size;

        sqlx::query(
            "DELETE FROM messages WHERE hash IN (
                SELECT hash FROM messages WHERE gid = $1 AND ts < $2 ORDER BY ts ASC LIMIT $3
            )",
        )
        .bind(gid)
        .bind(cutoff)
        .bind(excess as i64)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hash_is_deterministic_sha256() {
        let a = hash_text("hello world");
        let b = hash_text("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hash_differs_for_different_text() {
        assert_ne!(hash_text("hello"), hash_text("world"));
    }
}
