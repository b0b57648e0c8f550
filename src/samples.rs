use std::io::BufRead;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::db::{decode_ts, encode_ts, Db};
use crate::error::CoreResult;
use crate::model::GroupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    Ham,
    Spam,
}

impl SampleType {
    fn as_str(self) -> &'static str {
        match self {
            SampleType::Ham => "ham",
            SampleType::Spam => "spam",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Preset,
    User,
}

impl Origin {
    fn as_str(self) -> &'static str {
        match self {
            Origin::Preset => "preset",
            Origin::User => "user",
        }
    }
}

/// An `origin` read/import filter that also accepts "don't filter" (§4.3:
/// "origin any" is a read-only concept, never a value you can `Add` with).
#[derive(Debug, Clone, Copy)]
pub enum OriginFilter {
    Any,
    Only(Origin),
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub id: i64,
    pub gid: GroupId,
    pub ts: DateTime<Utc>,
    pub sample_type: SampleType,
    pub origin: Origin,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportStats {
    pub imported: u64,
    pub deleted: u64,
}

/// Persistent ham/spam corpus (§4.3). All mutations serialize through the
/// shared `Db` write lock; reads take the read lock so they never observe a
/// half-applied import.
pub struct SampleStore {
    db: Arc<Db>,
}

impl SampleStore {
    pub fn new(db: Arc<Db>) -> Self {
        SampleStore { db }
    }

    /// Insert or, on a `(gid, message)` collision, replace — §3's
    /// "duplicates silently replace" and §8's idempotence-of-add property.
    pub async fn add(
        &self,
        gid: GroupId,
        sample_type: SampleType,
        origin: Origin,
        message: &str,
    ) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        let now = encode_ts(Utc::now());
        sqlx::query(
            "INSERT INTO samples (gid, ts, type, origin, message) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (gid, message) DO UPDATE SET ts = excluded.ts, type = excluded.type, origin = excluded.origin",
        )
        .bind(gid)
        .bind(now)
        .bind(sample_type.as_str())
        .bind(origin.as_str())
        .bind(message)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query("DELETE FROM samples WHERE id = $1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, gid: GroupId, message: &str) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query("DELETE FROM samples WHERE gid = $1 AND message = $2")
            .bind(gid)
            .bind(message)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn read(
        &self,
        gid: GroupId,
        sample_type: SampleType,
        origin: OriginFilter,
    ) -> CoreResult<Vec<String>> {
        let _guard = self.db.read_guard().await;
        let rows = match origin {
            OriginFilter::Any => {
                sqlx::query("SELECT message FROM samples WHERE gid = $1 AND type = $2 ORDER BY ts DESC")
                    .bind(gid)
                    .bind(sample_type.as_str())
                    .fetch_all(self.db.pool())
                    .await?
            }
            OriginFilter::Only(origin) => sqlx::query(
                "SELECT message FROM samples WHERE gid = $1 AND type = $2 AND origin = $3 ORDER BY ts DESC",
            )
            .bind(gid)
            .bind(sample_type.as_str())
            .bind(origin.as_str())
            .fetch_all(self.db.pool())
            .await?,
        };
        Ok(rows.iter().map(|r| r.get::<String, _>("message")).collect())
    }

    /// Ordered-by-ts-desc full rows, for callers (the Detector's reload path)
    /// that need more than just the message text.
    pub async fn iter(
        &self,
        gid: GroupId,
        sample_type: SampleType,
        origin: OriginFilter,
    ) -> CoreResult<Vec<Sample>> {
        let _guard = self.db.read_guard().await;
        let rows = match origin {
            OriginFilter::Any => sqlx::query(
                "SELECT id, gid, ts, type, origin, message FROM samples WHERE gid = $1 AND type = $2 ORDER BY ts DESC",
            )
            .bind(gid)
            .bind(sample_type.as_str())
            .fetch_all(self.db.pool())
            .await?,
            OriginFilter::Only(origin) => sqlx::query(
                "SELECT id, gid, ts, type, origin, message FROM samples WHERE gid = $1 AND type = $2 AND origin = $3 ORDER BY ts DESC",
            )
            .bind(gid)
            .bind(sample_type.as_str())
            .bind(origin.as_str())
            .fetch_all(self.db.pool())
            .await?,
        };

        rows.iter()
            .map(|r| {
                Ok(Sample {
                    id: r.get("id"),
                    gid: r.get("gid"),
                    ts: decode_ts(&r.get::<String, _>("ts"))?,
                    sample_type,
                    origin: match r.get::<String, _>("origin").as_str() {
                        "preset" => Origin::Preset,
                        _ => Origin::User,
                    },
                    message: r.get("message"),
                })
            })
            .collect()
    }

    /// Streams `reader` line by line, adding one sample per line. If
    /// `with_cleanup`, every existing `(type, origin, gid)` row is deleted
    /// first, in the same transaction (§4.3).
    pub async fn import<R: BufRead>(
        &self,
        gid: GroupId,
        sample_type: SampleType,
        origin: Origin,
        reader: R,
        with_cleanup: bool,
    ) -> CoreResult<ImportStats> {
        let mut stats = ImportStats::default();
        let _guard = self.db.write_guard().await;
        let mut tx = self.db.pool().begin().await?;

        if with_cleanup {
            let result = sqlx::query("DELETE FROM samples WHERE gid = $1 AND type = $2 AND origin = $3")
                .bind(gid)
                .bind(sample_type.as_str())
                .bind(origin.as_str())
                .execute(&mut *tx)
                .await?;
            stats.deleted = result.rows_affected();
        }

        for line in reader.lines() {
            let line = line.map_err(|e| crate::error::CoreError::InputInvalid(e.to_string()))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let now = encode_ts(Utc::now());
            sqlx::query(
                "INSERT INTO samples (gid, ts, type, origin, message) VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (gid, message) DO UPDATE SET ts = excluded.ts",
            )
            .bind(gid)
            .bind(now)
            .bind(sample_type.as_str())
            .bind(origin.as_str())
            .bind(line)
            .execute(&mut *tx)
            .await?;
            stats.imported += 1;
        }

        tx.commit().await?;
        Ok(stats)
    }

    pub async fn stats(&self, gid: GroupId) -> CoreResult<Vec<(SampleType, Origin, i64)>> {
        let _guard = self.db.read_guard().await;
        let rows = sqlx::query(
            "SELECT type, origin, COUNT(*) as n FROM samples WHERE gid = $1 GROUP BY type, origin",
        )
        .bind(gid)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let t = match r.get::<String, _>("type").as_str() {
                    "spam" => SampleType::Spam,
                    _ => SampleType::Ham,
                };
                let o = match r.get::<String, _>("origin").as_str() {
                    "preset" => Origin::Preset,
                    _ => Origin::User,
                };
                (t, o, r.get::<i64, _>("n"))
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sample_type_roundtrips_through_as_str() {
        assert_eq!(SampleType::Ham.as_str(), "ham");
        assert_eq!(SampleType::Spam.as_str(), "spam");
        assert_eq!(Origin::Preset.as_str(), "preset");
        assert_eq!(Origin::User.as_str(), "user");
    }
}
