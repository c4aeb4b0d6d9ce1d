//! Identity records and the descriptive fields a caregiver enters for them.

use crate::types::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MAX_ADDITIONAL_INFO: usize = 500;
const MAX_IMPORTANT_NOTES: usize = 1000;
const MAX_MOBILE_DIGITS: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetailsError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("please enter a valid mobile number")]
    InvalidMobile,
    #[error("{field} cannot exceed {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("unknown relation '{0}'")]
    UnknownRelation(String),
}

/// How the enrolled person relates to the patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Spouse,
    Son,
    Daughter,
    Father,
    Mother,
    Brother,
    Sister,
    Grandfather,
    Grandmother,
    Uncle,
    Aunt,
    Cousin,
    Friend,
    Other,
}

impl Relation {
    pub const ALL: [Relation; 14] = [
        Relation::Spouse,
        Relation::Son,
        Relation::Daughter,
        Relation::Father,
        Relation::Mother,
        Relation::Brother,
        Relation::Sister,
        Relation::Grandfather,
        Relation::Grandmother,
        Relation::Uncle,
        Relation::Aunt,
        Relation::Cousin,
        Relation::Friend,
        Relation::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Spouse => "spouse",
            Relation::Son => "son",
            Relation::Daughter => "daughter",
            Relation::Father => "father",
            Relation::Mother => "mother",
            Relation::Brother => "brother",
            Relation::Sister => "sister",
            Relation::Grandfather => "grandfather",
            Relation::Grandmother => "grandmother",
            Relation::Uncle => "uncle",
            Relation::Aunt => "aunt",
            Relation::Cousin => "cousin",
            Relation::Friend => "friend",
            Relation::Other => "other",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = DetailsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Relation::ALL
            .into_iter()
            .find(|r| r.as_str() == wanted)
            .ok_or_else(|| DetailsError::UnknownRelation(s.to_string()))
    }
}

/// Free-text and descriptive fields stored alongside a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDetails {
    pub relation: Relation,
    pub mobile: String,
    #[serde(default = "default_is_close")]
    pub is_close: bool,
    pub address: String,
    #[serde(default)]
    pub additional_info: Option<String>,
    #[serde(default)]
    pub important_notes: Option<String>,
}

fn default_is_close() -> bool {
    true
}

impl MemberDetails {
    /// Trim every text field and check required fields and length limits.
    pub fn normalized(self) -> Result<Self, DetailsError> {
        let mobile = self.mobile.trim().to_string();
        if mobile.is_empty() {
            return Err(DetailsError::Missing("mobile"));
        }
        if !is_valid_mobile(&mobile) {
            return Err(DetailsError::InvalidMobile);
        }

        let address = self.address.trim().to_string();
        if address.is_empty() {
            return Err(DetailsError::Missing("address"));
        }

        let additional_info = trim_optional(self.additional_info);
        check_len(&additional_info, "additional info", MAX_ADDITIONAL_INFO)?;
        let important_notes = trim_optional(self.important_notes);
        check_len(&important_notes, "important notes", MAX_IMPORTANT_NOTES)?;

        Ok(Self {
            relation: self.relation,
            mobile,
            is_close: self.is_close,
            address,
            additional_info,
            important_notes,
        })
    }
}

/// Trimmed, non-empty display name.
pub fn normalize_name(name: &str) -> Result<String, DetailsError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DetailsError::Missing("name"));
    }
    Ok(trimmed.to_string())
}

/// `+` optional, then a non-zero digit, then at most 15 more digits.
fn is_valid_mobile(mobile: &str) -> bool {
    let digits = mobile.strip_prefix('+').unwrap_or(mobile);
    let mut chars = digits.chars();
    match chars.next() {
        Some(c) if ('1'..='9').contains(&c) => {}
        _ => return false,
    }
    digits.len() <= MAX_MOBILE_DIGITS && chars.all(|c| c.is_ascii_digit())
}

fn trim_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_len(value: &Option<String>, field: &'static str, max: usize) -> Result<(), DetailsError> {
    match value {
        Some(v) if v.chars().count() > max => Err(DetailsError::TooLong { field, max }),
        _ => Ok(()),
    }
}

/// Partial update of an identity's descriptive fields.
///
/// `None` leaves a field untouched. For the two optional notes fields,
/// `Some(String::new())` clears the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailsPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub relation: Option<Relation>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub is_close: Option<bool>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub additional_info: Option<String>,
    #[serde(default)]
    pub important_notes: Option<String>,
}

impl DetailsPatch {
    /// Apply the patch to `record`, re-validating the merged details.
    pub fn apply_to(&self, record: &IdentityRecord) -> Result<(String, MemberDetails), DetailsError> {
        let name = match &self.name {
            Some(n) => normalize_name(n)?,
            None => record.name.clone(),
        };
        let current = &record.details;
        let merged = MemberDetails {
            relation: self.relation.unwrap_or(current.relation),
            mobile: self.mobile.clone().unwrap_or_else(|| current.mobile.clone()),
            is_close: self.is_close.unwrap_or(current.is_close),
            address: self.address.clone().unwrap_or_else(|| current.address.clone()),
            additional_info: self
                .additional_info
                .clone()
                .or_else(|| current.additional_info.clone()),
            important_notes: self
                .important_notes
                .clone()
                .or_else(|| current.important_notes.clone()),
        };
        Ok((name, merged.normalized()?))
    }
}

/// A validated identity ready to be written by a [`SignatureStore`](crate::store::SignatureStore).
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub account_id: String,
    pub name: String,
    pub details: MemberDetails,
    pub embedding: Embedding,
    pub image_ref: String,
}

/// One enrolled person: a single embedding plus caregiver notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub details: MemberDetails,
    pub embedding: Embedding,
    /// Where the enrollment photo came from (`sha256:<hex>` or a path).
    pub image_ref: String,
    pub active: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityRecord {
    /// Build a fresh active record with a new UUID and all timestamps set to `now`.
    pub fn from_new(new: NewIdentity, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: new.account_id,
            name: new.name,
            details: new.details,
            embedding: new.embedding,
            image_ref: new.image_ref,
            active: true,
            last_seen: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn profile(&self) -> IdentityProfile {
        IdentityProfile {
            id: self.id.clone(),
            name: self.name.clone(),
            details: self.details.clone(),
            image_ref: self.image_ref.clone(),
            last_seen: self.last_seen,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Caller-facing view of an identity. Never carries the embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub details: MemberDetails,
    pub image_ref: String,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) fn test_details() -> MemberDetails {
    MemberDetails {
        relation: Relation::Son,
        mobile: "+15551234567".into(),
        is_close: true,
        address: "12 Elm Street".into(),
        additional_info: None,
        important_notes: Some("Visits on Sundays".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_parse() {
        assert_eq!("Daughter".parse::<Relation>().unwrap(), Relation::Daughter);
        assert!(matches!(
            "neighbour".parse::<Relation>(),
            Err(DetailsError::UnknownRelation(_))
        ));
    }

    #[test]
    fn test_mobile_validation() {
        assert!(is_valid_mobile("+15551234567"));
        assert!(is_valid_mobile("9"));
        assert!(!is_valid_mobile("0123"));
        assert!(!is_valid_mobile("+"));
        assert!(!is_valid_mobile("555-1234"));
        assert!(!is_valid_mobile("12345678901234567"));
    }

    #[test]
    fn test_normalized_trims_and_drops_empty_notes() {
        let details = MemberDetails {
            mobile: "  5551234 ".into(),
            address: " 1 Main St ".into(),
            additional_info: Some("   ".into()),
            ..test_details()
        };
        let n = details.normalized().unwrap();
        assert_eq!(n.mobile, "5551234");
        assert_eq!(n.address, "1 Main St");
        assert_eq!(n.additional_info, None);
    }

    #[test]
    fn test_normalized_requires_address() {
        let details = MemberDetails {
            address: " ".into(),
            ..test_details()
        };
        assert_eq!(details.normalized(), Err(DetailsError::Missing("address")));
    }

    #[test]
    fn test_normalized_limits_notes() {
        let details = MemberDetails {
            important_notes: Some("x".repeat(MAX_IMPORTANT_NOTES + 1)),
            ..test_details()
        };
        assert!(matches!(
            details.normalized(),
            Err(DetailsError::TooLong { field: "important notes", .. })
        ));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  John ").unwrap(), "John");
        assert_eq!(normalize_name(""), Err(DetailsError::Missing("name")));
    }

    #[test]
    fn test_patch_merges_and_clears_notes() {
        let record = IdentityRecord::from_new(
            NewIdentity {
                account_id: "u1".into(),
                name: "John".into(),
                details: test_details(),
                embedding: crate::types::test_embedding(0.1),
                image_ref: "sha256:00".into(),
            },
            Utc::now(),
        );
        let patch = DetailsPatch {
            is_close: Some(false),
            important_notes: Some(String::new()),
            ..Default::default()
        };
        let (name, details) = patch.apply_to(&record).unwrap();
        assert_eq!(name, "John");
        assert!(!details.is_close);
        assert_eq!(details.important_notes, None);
        assert_eq!(details.mobile, record.details.mobile);
    }

    #[test]
    fn test_profile_omits_embedding() {
        let record = IdentityRecord::from_new(
            NewIdentity {
                account_id: "u1".into(),
                name: "John".into(),
                details: test_details(),
                embedding: crate::types::test_embedding(0.1),
                image_ref: "sha256:00".into(),
            },
            Utc::now(),
        );
        let json = serde_json::to_value(record.profile()).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["relation"], "son");
        assert_eq!(json["name"], "John");
    }
}
