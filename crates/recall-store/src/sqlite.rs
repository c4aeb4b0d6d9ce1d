//! SQLite-backed [`SignatureStore`].
//!
//! One row per enrollment. Uniqueness of `(account_id, name)` among active
//! rows is enforced by a partial unique index, so the check and the write
//! are a single statement. Embeddings are stored as little-endian `f64`
//! blobs, sealed with [`EmbeddingCipher`] when a key is configured.

use crate::cipher::EmbeddingCipher;
use chrono::{DateTime, SecondsFormat, Utc};
use recall_core::{
    Embedding, Filter, IdentityRecord, MemberDetails, NewIdentity, Order, Relation,
    SignatureStore, StoreError,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    name TEXT NOT NULL,
    relation TEXT NOT NULL,
    mobile TEXT NOT NULL,
    is_close INTEGER NOT NULL,
    address TEXT NOT NULL,
    additional_info TEXT,
    important_notes TEXT,
    embedding BLOB NOT NULL,
    sealed INTEGER NOT NULL DEFAULT 0,
    image_ref TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    last_seen TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_identities_active_name
    ON identities(account_id, name)
    WHERE active = 1;

CREATE INDEX IF NOT EXISTS idx_identities_account
    ON identities(account_id, active);
";

const COLUMNS: &str = "id, account_id, name, relation, mobile, is_close, address, \
     additional_info, important_notes, embedding, sealed, image_ref, active, \
     last_seen, created_at, updated_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteSignatureStore {
    conn: Mutex<Connection>,
    cipher: Option<EmbeddingCipher>,
}

impl SqliteSignatureStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>, cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
        }
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(StoreError::backend)?;
        conn.execute_batch(SCHEMA_SQL).map_err(StoreError::backend)?;
        tracing::info!(
            path = %path.display(),
            sealed = cipher.is_some(),
            "signature store opened"
        );
        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))
    }

    fn encode_embedding(&self, embedding: &Embedding) -> Result<(Vec<u8>, bool), StoreError> {
        let bytes = embedding.to_le_bytes();
        match &self.cipher {
            Some(cipher) => Ok((cipher.seal(&bytes).map_err(StoreError::backend)?, true)),
            None => Ok((bytes, false)),
        }
    }

    fn decode(&self, raw: RawRow) -> Result<IdentityRecord, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: raw.id.clone(),
            message,
        };

        let bytes = match (raw.sealed, &self.cipher) {
            (false, _) => raw.embedding.clone(),
            (true, Some(cipher)) => cipher
                .open(&raw.embedding)
                .map_err(|e| corrupt(e.to_string()))?,
            (true, None) => return Err(corrupt("embedding is sealed but no store key is configured".into())),
        };
        let embedding = Embedding::from_le_bytes(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let relation: Relation = raw.relation.parse().map_err(|e| corrupt(format!("{e}")))?;
        let last_seen = parse_time(&raw.last_seen).map_err(&corrupt)?;
        let created_at = parse_time(&raw.created_at).map_err(&corrupt)?;
        let updated_at = parse_time(&raw.updated_at).map_err(&corrupt)?;

        Ok(IdentityRecord {
            id: raw.id,
            account_id: raw.account_id,
            name: raw.name,
            details: MemberDetails {
                relation,
                mobile: raw.mobile,
                is_close: raw.is_close,
                address: raw.address,
                additional_info: raw.additional_info,
                important_notes: raw.important_notes,
            },
            embedding,
            image_ref: raw.image_ref,
            active: raw.active,
            last_seen,
            created_at,
            updated_at,
        })
    }

    /// Fetch one active row while the caller holds the connection.
    fn fetch(
        &self,
        conn: &Connection,
        account_id: &str,
        id: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM identities
                     WHERE account_id = ?1 AND id = ?2 AND active = 1"
                ),
                params![account_id, id],
                RawRow::from_row,
            )
            .optional()
            .map_err(StoreError::backend)?;
        raw.map(|r| self.decode(r)).transpose()
    }
}

impl std::fmt::Debug for SqliteSignatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSignatureStore")
            .field("sealed", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl SignatureStore for SqliteSignatureStore {
    /// Rows that fail to decode are logged and left out, so one damaged
    /// enrollment cannot take down lookups for the whole account.
    fn find(&self, account_id: &str, filter: &Filter) -> Result<Vec<IdentityRecord>, StoreError> {
        let order = match filter.order {
            Order::Enrollment => "rowid",
            Order::Name => "name, rowid",
        };
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM identities
                 WHERE account_id = ?1 AND active = 1
                 ORDER BY {order}"
            ))
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![account_id], RawRow::from_row)
            .map_err(StoreError::backend)?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(StoreError::backend)?;
            match self.decode(raw) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(err) => tracing::warn!(account = account_id, error = %err, "skipping unreadable identity"),
            }
        }
        Ok(records)
    }

    fn find_active_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM identities
                     WHERE account_id = ?1 AND name = ?2 AND active = 1"
                ),
                params![account_id, name],
                RawRow::from_row,
            )
            .optional()
            .map_err(StoreError::backend)?;
        raw.map(|r| self.decode(r)).transpose()
    }

    fn get(&self, account_id: &str, id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let conn = self.lock()?;
        self.fetch(&conn, account_id, id)
    }

    fn save(&self, identity: NewIdentity) -> Result<IdentityRecord, StoreError> {
        let record = IdentityRecord::from_new(identity, Utc::now());
        let (blob, sealed) = self.encode_embedding(&record.embedding)?;
        let details = &record.details;
        let now = format_time(record.created_at);

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO identities ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13, ?13, ?13)"
            ),
            params![
                record.id,
                record.account_id,
                record.name,
                details.relation.as_str(),
                details.mobile,
                details.is_close,
                details.address,
                details.additional_info,
                details.important_notes,
                blob,
                sealed,
                record.image_ref,
                now,
            ],
        )
        .map_err(|e| map_write_error(e, &record.account_id, &record.name))?;
        Ok(record)
    }

    fn update(
        &self,
        account_id: &str,
        id: &str,
        name: &str,
        details: &MemberDetails,
    ) -> Result<IdentityRecord, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE identities
                 SET name = ?3, relation = ?4, mobile = ?5, is_close = ?6, address = ?7,
                     additional_info = ?8, important_notes = ?9, updated_at = ?10
                 WHERE account_id = ?1 AND id = ?2 AND active = 1",
                params![
                    account_id,
                    id,
                    name,
                    details.relation.as_str(),
                    details.mobile,
                    details.is_close,
                    details.address,
                    details.additional_info,
                    details.important_notes,
                    format_time(Utc::now()),
                ],
            )
            .map_err(|e| map_write_error(e, account_id, name))?;
        if changed == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        self.fetch(&conn, account_id, id)?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn touch_last_seen(
        &self,
        account_id: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE identities SET last_seen = ?3
                 WHERE account_id = ?1 AND id = ?2 AND active = 1",
                params![account_id, id, format_time(at)],
            )
            .map_err(StoreError::backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        self.fetch(&conn, account_id, id)?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn deactivate(&self, account_id: &str, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE identities SET active = 0, updated_at = ?3
                 WHERE account_id = ?1 AND id = ?2 AND active = 1",
                params![account_id, id, format_time(Utc::now())],
            )
            .map_err(StoreError::backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }
}

/// Column values as read, before decryption and parsing.
struct RawRow {
    id: String,
    account_id: String,
    name: String,
    relation: String,
    mobile: String,
    is_close: bool,
    address: String,
    additional_info: Option<String>,
    important_notes: Option<String>,
    embedding: Vec<u8>,
    sealed: bool,
    image_ref: String,
    active: bool,
    last_seen: String,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            name: row.get(2)?,
            relation: row.get(3)?,
            mobile: row.get(4)?,
            is_close: row.get(5)?,
            address: row.get(6)?,
            additional_info: row.get(7)?,
            important_notes: row.get(8)?,
            embedding: row.get(9)?,
            sealed: row.get(10)?,
            image_ref: row.get(11)?,
            active: row.get(12)?,
            last_seen: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }
}

fn map_write_error(err: rusqlite::Error, account_id: &str, name: &str) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Duplicate {
            account_id: account_id.to_string(),
            name: name.to_string(),
        },
        _ => StoreError::backend(err),
    }
}

// Full sub-second precision so values read back compare equal.
fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{value}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::EMBEDDING_DIM;
    use tempfile::TempDir;

    fn details() -> MemberDetails {
        MemberDetails {
            relation: Relation::Daughter,
            mobile: "+15550001111".into(),
            is_close: true,
            address: "4 Birch Road".into(),
            additional_info: Some("Lives nearby".into()),
            important_notes: None,
        }
    }

    fn embedding(first: f64) -> Embedding {
        let mut values = vec![0.01; EMBEDDING_DIM];
        values[0] = first;
        Embedding::from_values(values).unwrap()
    }

    fn new_identity(account: &str, name: &str) -> NewIdentity {
        NewIdentity {
            account_id: account.into(),
            name: name.into(),
            details: details(),
            embedding: embedding(0.5),
            image_ref: "sha256:ab".into(),
        }
    }

    fn open(dir: &TempDir, key: Option<&str>) -> SqliteSignatureStore {
        SqliteSignatureStore::open(
            dir.path().join("db").join("identities.db"),
            key.map(EmbeddingCipher::from_passphrase),
        )
        .unwrap()
    }

    #[test]
    fn test_save_then_reopen() {
        let dir = TempDir::new().unwrap();
        let saved = open(&dir, None).save(new_identity("u1", "Anna")).unwrap();

        let store = open(&dir, None);
        let loaded = store.get("u1", &saved.id).unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(store.get("u2", &saved.id).unwrap().is_none());
    }

    #[test]
    fn test_active_name_unique_per_account() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, None);
        let first = store.save(new_identity("u1", "Anna")).unwrap();
        assert!(matches!(
            store.save(new_identity("u1", "Anna")),
            Err(StoreError::Duplicate { .. })
        ));
        store.save(new_identity("u2", "Anna")).unwrap();

        store.deactivate("u1", &first.id).unwrap();
        assert!(store.find_active_by_name("u1", "Anna").unwrap().is_none());
        let again = store.save(new_identity("u1", "Anna")).unwrap();
        assert_ne!(again.id, first.id);
        assert!(matches!(
            store.deactivate("u1", &first.id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_find_orders_and_filters() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, None);
        store.save(new_identity("u1", "Zed")).unwrap();
        let mut friend = new_identity("u1", "Bea");
        friend.details.relation = Relation::Friend;
        friend.details.is_close = false;
        store.save(friend).unwrap();

        let enrolled: Vec<_> = store
            .find("u1", &Filter::default())
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(enrolled, ["Zed", "Bea"]);

        let by_name = store
            .find("u1", &Filter { order: Order::Name, ..Default::default() })
            .unwrap();
        assert_eq!(by_name[0].name, "Bea");

        let close = store
            .find("u1", &Filter { is_close: Some(true), ..Default::default() })
            .unwrap();
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].name, "Zed");
    }

    #[test]
    fn test_update_and_touch() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, None);
        store.save(new_identity("u1", "Anna")).unwrap();
        let ben = store.save(new_identity("u1", "Ben")).unwrap();

        assert!(matches!(
            store.update("u1", &ben.id, "Anna", &ben.details),
            Err(StoreError::Duplicate { .. })
        ));
        let mut changed = ben.details.clone();
        changed.important_notes = Some("Allergic to cats".into());
        let updated = store.update("u1", &ben.id, "Benjamin", &changed).unwrap();
        assert_eq!(updated.name, "Benjamin");
        assert_eq!(updated.details.important_notes.as_deref(), Some("Allergic to cats"));
        assert_eq!(updated.embedding, ben.embedding);

        let later = ben.last_seen + chrono::Duration::seconds(90);
        let touched = store.touch_last_seen("u1", &ben.id, later).unwrap();
        assert_eq!(touched.last_seen, later);
        assert!(matches!(
            store.touch_last_seen("u2", &ben.id, later),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_sealed_embeddings() {
        let dir = TempDir::new().unwrap();
        let saved = open(&dir, Some("s3cret")).save(new_identity("u1", "Anna")).unwrap();

        // the blob on disk is not the plain encoding
        let conn = Connection::open(dir.path().join("db").join("identities.db")).unwrap();
        let (blob, sealed): (Vec<u8>, bool) = conn
            .query_row("SELECT embedding, sealed FROM identities", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert!(sealed);
        assert_ne!(blob, saved.embedding.to_le_bytes());

        let reopened = open(&dir, Some("s3cret"));
        assert_eq!(reopened.get("u1", &saved.id).unwrap().unwrap().embedding, saved.embedding);

        let wrong = open(&dir, Some("guess"));
        assert!(matches!(wrong.get("u1", &saved.id), Err(StoreError::Corrupt { .. })));
        // unreadable rows are left out of searches rather than failing them
        assert!(wrong.find("u1", &Filter::default()).unwrap().is_empty());

        let keyless = open(&dir, None);
        assert!(matches!(keyless.get("u1", &saved.id), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_plain_rows_readable_after_key_added() {
        let dir = TempDir::new().unwrap();
        let saved = open(&dir, None).save(new_identity("u1", "Anna")).unwrap();
        let store = open(&dir, Some("new key"));
        assert_eq!(store.get("u1", &saved.id).unwrap().unwrap().embedding, saved.embedding);
    }
}
