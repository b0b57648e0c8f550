use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use crate::crypto::FieldCipher;
use crate::db::{decode_ts, encode_ts, Db};
use crate::error::{CoreError, CoreResult};
use crate::model::GroupId;

/// The enumerated set of JSON-pointer paths treated as sensitive (§4.12,
/// §9's "dynamic reflection over config field names ... becomes an explicit
/// enum of recognized paths"). Unknown paths found while encrypting/
/// decrypting are logged and left untouched rather than guessed at.
const SENSITIVE_FIELD_PATHS: &[&str] = &[
    "/telegram/token",
    "/openai/token",
    "/server/auth_hash",
    "/server/auth_user",
];

/// Load/Save/Delete/Exists/LastUpdated of a single JSON config blob per gid,
/// with optional field-level AES-256-GCM encryption of the paths above
/// (§4.12, §6's "Config JSON"). `transient` top-level fields are the
/// caller's concern — this store round-trips whatever JSON it's given,
/// modulo the sensitive paths it encrypts.
pub struct SettingsStore {
    db: Arc<Db>,
    cipher: Option<FieldCipher>,
}

impl SettingsStore {
    pub fn new(db: Arc<Db>, cipher: Option<FieldCipher>) -> Self {
        SettingsStore { db, cipher }
    }

    /// Serializes `value`, encrypting recognized sensitive paths in place,
    /// and upserts it for `gid`.
    pub async fn save(&self, gid: GroupId, value: &Value) -> CoreResult<()> {
        let mut encoded = value.clone();
        if let Some(cipher) = &self.cipher {
            encrypt_sensitive_paths(&mut encoded, cipher)?;
        }
        let data = serde_json::to_string(&encoded)
            .map_err(|e| CoreError::InputInvalid(e.to_string()))?;
        let now = encode_ts(Utc::now());

        let _guard = self.db.write_guard().await;
        sqlx::query(
            "INSERT INTO config (gid, data, created_at, updated_at) VALUES ($1, $2, $3, $3)
             ON CONFLICT (gid) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(gid)
        .bind(&data)
        .bind(now)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Loads and deserializes the blob for `gid`, decrypting any recognized
    /// sensitive paths back to plaintext. Returns `Ok(None)` if no config is
    /// stored yet for this gid.
    pub async fn load(&self, gid: GroupId) -> CoreResult<Option<Value>> {
        let _guard = self.db.read_guard().await;
        let row = sqlx::query("SELECT data FROM config WHERE gid = $1")
            .bind(gid)
            .fetch_optional(self.db.pool())
            .await?;

        let Some(row) = row else { return Ok(None) };
        let raw: String = row.get("data");
        let mut value: Value =
            serde_json::from_str(&raw).map_err(|e| CoreError::InputInvalid(e.to_string()))?;

        if let Some(cipher) = &self.cipher {
            decrypt_sensitive_paths(&mut value, cipher)?;
        }

        Ok(Some(value))
    }

    pub async fn delete(&self, gid: GroupId) -> CoreResult<()> {
        let _guard = self.db.write_guard().await;
        sqlx::query("DELETE FROM config WHERE gid = $1")
            .bind(gid)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn exists(&self, gid: GroupId) -> CoreResult<bool> {
        let _guard = self.db.read_guard().await;
        let row = sqlx::query("SELECT 1 as one FROM config WHERE gid = $1")
            .bind(gid)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    pub async fn last_updated(&self, gid: GroupId) -> CoreResult<Option<DateTime<Utc>>> {
        let _guard = self.db.read_guard().await;
        let row = sqlx::query("SELECT updated_at FROM config WHERE gid = $1")
            .bind(gid)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|r| decode_ts(&r.get::<String, _>("updated_at"))).transpose()
    }
}

fn pointer_parent_and_key(path: &str) -> (String, String) {
    let idx = path.rfind('/').unwrap_or(0);
    (path[..idx].to_owned(), path[idx + 1..].to_owned())
}

fn encrypt_sensitive_paths(value: &mut Value, cipher: &FieldCipher) -> CoreResult<()> {
    for path in SENSITIVE_FIELD_PATHS {
        let (parent, key) = pointer_parent_and_key(path);
        let parent_ptr = if parent.is_empty() { "" } else { &parent };
        if let Some(parent_value) = value.pointer_mut(parent_ptr) {
            if let Some(obj) = parent_value.as_object_mut() {
                if let Some(Value::String(s)) = obj.get(&key) {
                    if !s.is_empty() {
                        let encrypted = cipher.encrypt(s)?;
                        obj.insert(key, Value::String(encrypted));
                    }
                }
            }
        }
    }
    Ok(())
}

fn decrypt_sensitive_paths(value: &mut Value, cipher: &FieldCipher) -> CoreResult<()> {
    for path in SENSITIVE_FIELD_PATHS {
        let (parent, key) = pointer_parent_and_key(path);
        let parent_ptr = if parent.is_empty() { "" } else { &parent };
        if let Some(parent_value) = value.pointer_mut(parent_ptr) {
            if let Some(obj) = parent_value.as_object_mut() {
                if let Some(Value::String(s)) = obj.get(&key).cloned() {
                    let plain = cipher.decrypt_if_needed(&s)?;
                    obj.insert(key, Value::String(plain));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn test_cipher() -> FieldCipher {
        FieldCipher::new(b"0123456789abcdef0123456789", "instance-1").unwrap()
    }

    #[test]
    fn encrypts_and_decrypts_recognized_paths_only() {
        let cipher = test_cipher();
        let mut value = json!({
            "telegram": { "token": "secret-token" },
            "admin": { "chat_id": 42 },
        });

        encrypt_sensitive_paths(&mut value, &cipher).unwrap();
        let encrypted_token = value["telegram"]["token"].as_str().unwrap().to_owned();
        assert!(encrypted_token.starts_with("ENC:"));
        assert_eq!(value["admin"]["chat_id"], 42);

        decrypt_sensitive_paths(&mut value, &cipher).unwrap();
        assert_eq!(value["telegram"]["token"], "secret-token");
    }

    #[test]
    fn leaves_empty_sensitive_field_untouched() {
        let cipher = test_cipher();
        let mut value = json!({ "telegram": { "token": "" } });
        encrypt_sensitive_paths(&mut value, &cipher).unwrap();
        assert_eq!(value["telegram"]["token"], "");
    }
}
