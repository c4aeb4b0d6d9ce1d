//! Signature store contract and an in-memory implementation.

use crate::identity::{IdentityRecord, MemberDetails, NewIdentity, Relation};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("an active identity named '{name}' already exists for this account")]
    Duplicate { account_id: String, name: String },
    #[error("identity {id} not found")]
    NotFound { id: String },
    #[error("stored record {id} is corrupt: {message}")]
    Corrupt { id: String, message: String },
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Result ordering for [`SignatureStore::find`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    /// Enrollment order. Stable; lookups rely on it for tie-breaking.
    #[default]
    Enrollment,
    /// Alphabetical by display name.
    Name,
}

/// Narrowing applied on top of "active records for this account".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub relation: Option<Relation>,
    pub is_close: Option<bool>,
    /// Case-insensitive substring match on the display name.
    pub name_contains: Option<String>,
    pub order: Order,
}

impl Filter {
    pub fn matches(&self, record: &IdentityRecord) -> bool {
        self.relation.map_or(true, |r| record.details.relation == r)
            && self.is_close.map_or(true, |c| record.details.is_close == c)
            && self.name_contains.as_deref().map_or(true, |needle| {
                record.name.to_lowercase().contains(&needle.to_lowercase())
            })
    }
}

/// Persistence for enrolled signatures, always scoped to one owning account.
///
/// Only active records are ever returned. `(account_id, name)` is unique
/// among active records; `save` and `update` report a violation as
/// [`StoreError::Duplicate`] without writing anything.
pub trait SignatureStore: Send + Sync {
    fn find(&self, account_id: &str, filter: &Filter) -> Result<Vec<IdentityRecord>, StoreError>;

    fn find_active_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<IdentityRecord>, StoreError>;

    fn get(&self, account_id: &str, id: &str) -> Result<Option<IdentityRecord>, StoreError>;

    fn save(&self, identity: NewIdentity) -> Result<IdentityRecord, StoreError>;

    /// Replace name and descriptive fields of an active record.
    fn update(
        &self,
        account_id: &str,
        id: &str,
        name: &str,
        details: &MemberDetails,
    ) -> Result<IdentityRecord, StoreError>;

    fn touch_last_seen(
        &self,
        account_id: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError>;

    /// Soft delete: the record stays, flagged inactive.
    fn deactivate(&self, account_id: &str, id: &str) -> Result<(), StoreError>;
}

impl<T: SignatureStore + ?Sized> SignatureStore for Arc<T> {
    fn find(&self, account_id: &str, filter: &Filter) -> Result<Vec<IdentityRecord>, StoreError> {
        (**self).find(account_id, filter)
    }

    fn find_active_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        (**self).find_active_by_name(account_id, name)
    }

    fn get(&self, account_id: &str, id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        (**self).get(account_id, id)
    }

    fn save(&self, identity: NewIdentity) -> Result<IdentityRecord, StoreError> {
        (**self).save(identity)
    }

    fn update(
        &self,
        account_id: &str,
        id: &str,
        name: &str,
        details: &MemberDetails,
    ) -> Result<IdentityRecord, StoreError> {
        (**self).update(account_id, id, name, details)
    }

    fn touch_last_seen(
        &self,
        account_id: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError> {
        (**self).touch_last_seen(account_id, id, at)
    }

    fn deactivate(&self, account_id: &str, id: &str) -> Result<(), StoreError> {
        (**self).deactivate(account_id, id)
    }
}

/// Volatile store backed by a `Vec`, in enrollment order.
#[derive(Debug, Default)]
pub struct MemorySignatureStore {
    records: Mutex<Vec<IdentityRecord>>,
}

impl MemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record including inactive ones.
    pub fn snapshot(&self) -> Vec<IdentityRecord> {
        self.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<IdentityRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn active_mut<'a>(
        records: &'a mut [IdentityRecord],
        account_id: &str,
        id: &str,
    ) -> Result<&'a mut IdentityRecord, StoreError> {
        records
            .iter_mut()
            .find(|r| r.active && r.account_id == account_id && r.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}

impl SignatureStore for MemorySignatureStore {
    fn find(&self, account_id: &str, filter: &Filter) -> Result<Vec<IdentityRecord>, StoreError> {
        let records = self.lock()?;
        let mut found: Vec<IdentityRecord> = records
            .iter()
            .filter(|r| r.active && r.account_id == account_id && filter.matches(r))
            .cloned()
            .collect();
        if filter.order == Order::Name {
            found.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(found)
    }

    fn find_active_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let records = self.lock()?;
        Ok(records
            .iter()
            .find(|r| r.active && r.account_id == account_id && r.name == name)
            .cloned())
    }

    fn get(&self, account_id: &str, id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let records = self.lock()?;
        Ok(records
            .iter()
            .find(|r| r.active && r.account_id == account_id && r.id == id)
            .cloned())
    }

    fn save(&self, identity: NewIdentity) -> Result<IdentityRecord, StoreError> {
        let mut records = self.lock()?;
        if records
            .iter()
            .any(|r| r.active && r.account_id == identity.account_id && r.name == identity.name)
        {
            return Err(StoreError::Duplicate {
                account_id: identity.account_id,
                name: identity.name,
            });
        }
        let record = IdentityRecord::from_new(identity, Utc::now());
        records.push(record.clone());
        Ok(record)
    }

    fn update(
        &self,
        account_id: &str,
        id: &str,
        name: &str,
        details: &MemberDetails,
    ) -> Result<IdentityRecord, StoreError> {
        let mut records = self.lock()?;
        if records
            .iter()
            .any(|r| r.active && r.account_id == account_id && r.name == name && r.id != id)
        {
            return Err(StoreError::Duplicate {
                account_id: account_id.to_string(),
                name: name.to_string(),
            });
        }
        let record = Self::active_mut(&mut records, account_id, id)?;
        record.name = name.to_string();
        record.details = details.clone();
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    fn touch_last_seen(
        &self,
        account_id: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError> {
        let mut records = self.lock()?;
        let record = Self::active_mut(&mut records, account_id, id)?;
        record.last_seen = at;
        Ok(record.clone())
    }

    fn deactivate(&self, account_id: &str, id: &str) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let record = Self::active_mut(&mut records, account_id, id)?;
        record.active = false;
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_details;
    use crate::types::test_embedding;

    fn new_identity(account: &str, name: &str) -> NewIdentity {
        NewIdentity {
            account_id: account.into(),
            name: name.into(),
            details: test_details(),
            embedding: test_embedding(0.1),
            image_ref: "sha256:00".into(),
        }
    }

    #[test]
    fn test_find_is_account_scoped_and_ordered() {
        let store = MemorySignatureStore::new();
        store.save(new_identity("u1", "Zoe")).unwrap();
        store.save(new_identity("u2", "Other")).unwrap();
        store.save(new_identity("u1", "Adam")).unwrap();

        let enrolled = store.find("u1", &Filter::default()).unwrap();
        let names: Vec<_> = enrolled.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["Zoe", "Adam"]);

        let by_name = store
            .find("u1", &Filter { order: Order::Name, ..Default::default() })
            .unwrap();
        assert_eq!(by_name[0].name, "Adam");
    }

    #[test]
    fn test_duplicate_rejected_until_deactivated() {
        let store = MemorySignatureStore::new();
        let first = store.save(new_identity("u1", "John")).unwrap();
        assert!(matches!(
            store.save(new_identity("u1", "John")),
            Err(StoreError::Duplicate { .. })
        ));
        // same name under another account is fine
        store.save(new_identity("u2", "John")).unwrap();

        store.deactivate("u1", &first.id).unwrap();
        assert!(store.get("u1", &first.id).unwrap().is_none());
        store.save(new_identity("u1", "John")).unwrap();
        assert_eq!(store.snapshot().len(), 3);
    }

    #[test]
    fn test_filter_by_name_substring() {
        let store = MemorySignatureStore::new();
        store.save(new_identity("u1", "Johnny")).unwrap();
        store.save(new_identity("u1", "Mary")).unwrap();
        let filter = Filter {
            name_contains: Some("JOHN".into()),
            ..Default::default()
        };
        assert_eq!(store.find("u1", &filter).unwrap().len(), 1);
    }

    #[test]
    fn test_update_rename_collision() {
        let store = MemorySignatureStore::new();
        store.save(new_identity("u1", "John")).unwrap();
        let mary = store.save(new_identity("u1", "Mary")).unwrap();
        assert!(matches!(
            store.update("u1", &mary.id, "John", &mary.details),
            Err(StoreError::Duplicate { .. })
        ));
        let renamed = store.update("u1", &mary.id, "Maria", &mary.details).unwrap();
        assert_eq!(renamed.name, "Maria");
    }

    #[test]
    fn test_touch_last_seen_requires_owner() {
        let store = MemorySignatureStore::new();
        let john = store.save(new_identity("u1", "John")).unwrap();
        let later = john.last_seen + chrono::Duration::minutes(5);
        assert!(matches!(
            store.touch_last_seen("u2", &john.id, later),
            Err(StoreError::NotFound { .. })
        ));
        let touched = store.touch_last_seen("u1", &john.id, later).unwrap();
        assert_eq!(touched.last_seen, later);
    }
}
