use std::io::BufRead;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::db::{encode_ts, Db};
use crate::error::{CoreError, CoreResult};
use crate::model::GroupId;
use crate::samples::ImportStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    StopPhrase,
    IgnoredWord,
}

impl EntryType {
    fn as_str(self) -> &'static str {
        match self {
            EntryType::StopPhrase => "stop_phrase",
            EntryType::IgnoredWord => "ignored_word",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DictionaryEntry {
    pub id: i64,
    pub gid: GroupId,
    pub ts: DateTime<Utc>,
    pub entry_type: EntryType,
    pub data: String,
}

/// Persisted stop-phrases and ignored-words, same shape as `SampleStore` but
/// partitioned by `EntryType` instead of `(SampleType, Origin)` (§4.4).
pub struct Dictionary {
    db: Arc<Db>,
}

impl Dictionary {
    pub fn new(db: Arc<Db>) -> Self {
        Dictionary { db }
    }

    pub async fn add(&self, gid: GroupId, entry_type: EntryType, data: &str) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        let now = encode_ts(Utc::now());
        sqlx::query(
            "INSERT INTO dictionary (gid, ts, type, data) VALUES ($1, $2, $3, $4)
             ON CONFLICT (gid, data) DO UPDATE SET ts = excluded.ts, type = excluded.type",
        )
        .bind(gid)
        .bind(now)
        .bind(entry_type.as_str())
        .bind(data)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query("DELETE FROM dictionary WHERE id = $1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn read(&self, gid: GroupId, entry_type: EntryType) -> CoreResult<Vec<String>> {
        let _guard = self.db.read_guard().await;
        let rows = sqlx::query("SELECT data FROM dictionary WHERE gid = $1 AND type = $2 ORDER BY ts DESC")
            .bind(gid)
            .bind(entry_type.as_str())
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("data")).collect())
    }

    /// One-phrase-per-line, or CSV where a single record can expand into
    /// many entries (e.g. `"a","b","c"` → three entries). Detected by
    /// whether a line parses as more than one CSV field.
    pub async fn import<R: BufRead>(
        &self,
        gid: GroupId,
        entry_type: EntryType,
        reader: R,
        with_cleanup: bool,
    ) -> CoreResult<ImportStats> {
        let mut stats = ImportStats::default();
        let _guard = self.db.write_guard().await;
        let mut tx = self.db.pool().begin().await?;

        if with_cleanup {
            let result = sqlx::query("DELETE FROM dictionary WHERE gid = $1 AND type = $2")
                .bind(gid)
                .bind(entry_type.as_str())
                .execute(&mut *tx)
                .await?;
            stats.deleted = result.rows_affected();
        }

        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| CoreError::InputInvalid(e.to_string()))?;
            lines.push(line);
        }
        let joined = lines.join("\n");

        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(joined.as_bytes());

        for record in csv_reader.records() {
            let record = record.map_err(|e| CoreError::InputInvalid(e.to_string()))?;
            for field in record.iter() {
                let field = field.trim();
                if field.is_empty() {
                    continue;
                }
                let now = encode_ts(Utc::now());
                sqlx::query(
                    "INSERT INTO dictionary (gid, ts, type, data) VALUES ($1, $2, $3, $4)
                     ON CONFLICT (gid, data) DO UPDATE SET ts = excluded.ts",
                )
                .bind(gid)
                .bind(now)
                .bind(entry_type.as_str())
                .bind(field)
                .execute(&mut *tx)
                .await?;
                stats.imported += 1;
            }
        }

        tx.commit().await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn csv_import_expands_quoted_record_into_multiple_entries() {
        let input = "\"a\",\"b\",\"c\"\nd\n\"\"";
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input.as_bytes());

        let mut fields = Vec::new();
        for record in reader.records() {
            let record = record.unwrap();
            for f in record.iter() {
                let f = f.trim();
                if !f.is_empty() {
                    fields.push(f.to_string());
                }
            }
        }

        assert_eq!(fields, vec!["a", "b", "c", "d"]);
    }
}
