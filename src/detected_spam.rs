use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use crate::db::{decode_ts, encode_ts, Db};
use crate::error::CoreResult;
use crate::model::{CheckResult, GroupId, UserId};

#[derive(Debug, Clone)]
pub struct DetectedSpam {
    pub id: i64,
    pub gid: GroupId,
    pub ts: DateTime<Utc>,
    pub text: String,
    pub user_id: UserId,
    pub user_name: Option<String>,
    pub checks: Vec<CheckResult>,
    pub added_to_samples: bool,
}

#[derive(Serialize)]
struct ChecksJson<'a>(&'a [CheckResult]);

/// Append-only log of confirmed-spam decisions with bounded per-gid
/// retention (§4.10). Each insert prunes the oldest rows beyond the cap
/// rather than relying on a separate cleanup pass.
pub struct DetectedSpamLog {
    db: Arc<Db>,
    max_entries: u64,
}

impl DetectedSpamLog {
    pub fn new(db: Arc<Db>, max_entries: u64) -> Self {
        DetectedSpamLog { db, max_entries }
    }

    pub async fn add(
        &self,
        gid: GroupId,
        text: &str,
        user_id: UserId,
        user_name: Option<&str>,
        checks: &[CheckResult],
    ) -> CoreResult<i64> {
        let checks_json = serde_json::to_string(&ChecksJson(checks))
            .map_err(|e| crate::error::CoreError::InputInvalid(e.to_string()))?;
        let now = encode_ts(Utc::now());
        let _guard = self.db.write_guard().await;

        let row = sqlx::query(
            "INSERT INTO detected_spam (gid, text, user_id, user_name, ts, added, checks)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(gid)
        .bind(text)
        .bind(user_id)
        .bind(user_name)
        .bind(now)
        .bind(0i64)
        .bind(&checks_json)
        .fetch_one(self.db.pool())
        .await?;
        let id: i64 = row.get("id");

        self.prune(gid).await?;
        Ok(id)
    }

    pub async fn set_added_to_samples_flag(&self, id: i64) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query("UPDATE detected_spam SET added = $1 WHERE id = $2")
            .bind(1i64)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn read(&self, gid: GroupId) -> CoreResult<Vec<DetectedSpam>> {
        let _guard = self.db.read_guard().await;
        let rows = sqlx::query(
            "SELECT id, gid, text, user_id, user_name, ts, added, checks
             FROM detected_spam WHERE gid = $1 ORDER BY ts DESC LIMIT $2",
        )
        .bind(gid)
        .bind(self.max_entries as i64)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|r| {
                let checks_raw: String = r.get("checks");
                let checks: Vec<CheckResult> = serde_json::from_str(&checks_raw)
                    .map_err(|e| crate::error::CoreError::InputInvalid(e.to_string()))?;
                Ok(DetectedSpam {
                    id: r.get("id"),
                    gid: r.get("gid"),
                    ts: decode_ts(&r.get::<String, _>("ts"))?,
                    text: r.get("text"),
                    user_id: r.get("user_id"),
                    user_name: r.get("user_name"),
                    checks,
                    added_to_samples: r.get::<i64, _>("added") != 0,
                })
            })
            .collect()
    }

    async fn prune(&self, gid: GroupId) -> CoreResult<()> {
        sqlx::query(
            "DELETE FROM detected_spam WHERE gid = $1 AND id NOT IN (
                SELECT id FROM detected_spam WHERE gid = $1 ORDER BY ts DESC LIMIT $2
            )",
        )
        .bind(gid)
        .bind(self.max_entries as i64)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
