use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::debug;

use crate::db::{decode_ts, encode_ts, Db};
use crate::error::CoreResult;
use crate::model::{GroupId, UserId};

#[derive(Debug, Clone)]
pub struct ApprovedUser {
    pub gid: GroupId,
    pub user_id: UserId,
    pub user_name: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Persistent `(gid, userId) → {userName, ts}` store (§4.9). The Detector
/// keeps its own in-memory mirror (a plain `HashSet<UserId>` per the
/// teacher's `Arc<RwLock<HashMap<...>>>` pattern in `filter.rs`) rebuilt from
/// this store on startup and periodically flushed back by the auto-save
/// loop.
pub struct ApprovedUsersStore {
    db: Arc<Db>,
}

impl ApprovedUsersStore {
    pub fn new(db: Arc<Db>) -> Self {
        ApprovedUsersStore { db }
    }

    pub async fn read(&self, gid: GroupId) -> CoreResult<Vec<ApprovedUser>> {
        let _guard = self.db.read_guard().await;
        let rows = sqlx::query("SELECT uid, gid, name, ts FROM approved_users WHERE gid = $1")
            .bind(gid)
            .fetch_all(self.db.pool())
            .await?;

        rows.iter()
            .map(|r| {
                Ok(ApprovedUser {
                    gid: r.get("gid"),
                    user_id: r.get("uid"),
                    user_name: r.get("name"),
                    ts: decode_ts(&r.get::<String, _>("ts"))?,
                })
            })
            .collect()
    }

    pub async fn write(&self, user: &ApprovedUser) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query(
            "INSERT INTO approved_users (uid, gid, name, ts) VALUES ($1, $2, $3, $4)
             ON CONFLICT (gid, uid) DO UPDATE SET name = excluded.name, ts = excluded.ts",
        )
        .bind(user.user_id)
        .bind(user.gid)
        .bind(&user.user_name)
        .bind(encode_ts(user.ts))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn delete(&self, gid: GroupId, user_id: UserId) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query("DELETE FROM approved_users WHERE gid = $1 AND uid = $2")
            .bind(gid)
            .bind(user_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// The Detector's in-memory mirror of approved users for one group. Cheap to
/// check on every message; persisted lazily by the auto-save loop rather than
/// on every insert.
#[derive(Default)]
pub struct ApprovedUsersMirror {
    users: RwLock<HashSet<UserId>>,
}

impl ApprovedUsersMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self, users: impl IntoIterator<Item = UserId>) {
        let mut guard = self.users.write().await;
        guard.clear();
        guard.extend(users);
    }

    pub async fn contains(&self, user_id: UserId) -> bool {
        self.users.read().await.contains(&user_id)
    }

    pub async fn insert(&self, user_id: UserId) -> bool {
        self.users.write().await.insert(user_id)
    }

    pub async fn remove(&self, user_id: UserId) -> bool {
        self.users.write().await.remove(&user_id)
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<UserId> {
        self.users.read().await.iter().copied().collect()
    }
}

/// Flushes `mirror` back to `store` if its cardinality changed since the
/// last flush, per §4.9's auto-save rule and §5's "compares cardinality to
/// avoid unchanged writes".
pub struct AutoSaveState {
    last_len: std::sync::atomic::AtomicUsize,
}

impl AutoSaveState {
    pub fn new() -> Self {
        AutoSaveState {
            last_len: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub async fn flush_if_changed(
        &self,
        store: &ApprovedUsersStore,
        mirror: &ApprovedUsersMirror,
        gid: GroupId,
    ) -> CoreResult<bool> {
        let current = mirror.len().await;
        let last = self.last_len.load(std::sync::atomic::Ordering::Acquire);
        if current == last {
            return Ok(false);
        }

        let now = Utc::now();
        for user_id in mirror.snapshot().await {
            store
                .write(&ApprovedUser {
                    gid,
                    user_id,
                    user_name: None,
                    ts: now,
                })
                .await?;
        }

        self.last_len.store(current, std::sync::atomic::Ordering::Release);
        debug!(gid, count = current, "flushed approved-users mirror");
        Ok(true)
    }
}

impl Default for AutoSaveState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn mirror_insert_and_contains() {
        let mirror = ApprovedUsersMirror::new();
        assert!(!mirror.contains(7).await);
        assert!(mirror.insert(7).await);
        assert!(mirror.contains(7).await);
        assert!(!mirror.insert(7).await);
    }

    #[tokio::test]
    async fn mirror_remove() {
        let mirror = ApprovedUsersMirror::new();
        mirror.insert(7).await;
        assert!(mirror.remove(7).await);
        assert!(!mirror.contains(7).await);
    }

    #[tokio::test]
    async fn mirror_load_replaces_contents() {
        let mirror = ApprovedUsersMirror::new();
        mirror.insert(1).await;
        mirror.load([2, 3]).await;
        assert!(!mirror.contains(1).await);
        assert!(mirror.contains(2).await);
        assert!(mirror.contains(3).await);
    }
}
