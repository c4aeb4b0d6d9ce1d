//! Enrollment and lookup workflows: the operations exposed to API layers.

use crate::comparator::Comparator;
use crate::generator::{EmbeddingGenerator, Generated, ImageInput};
use crate::identity::{
    normalize_name, DetailsError, DetailsPatch, IdentityRecord, MemberDetails, NewIdentity,
};
use crate::resolver::{MatchOutcome, Resolver};
use crate::store::{Filter, Order, SignatureStore, StoreError};
use chrono::Utc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error(transparent)]
    InvalidDetails(#[from] DetailsError),
    #[error("could not detect a face in the image; please try again")]
    NoFaceDetected,
    #[error("an identity named '{name}' already exists; choose another name or remove the existing one")]
    Duplicate { name: String },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EnrollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { name, .. } => EnrollError::Duplicate { name },
            other => EnrollError::Store(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    InvalidDetails(#[from] DetailsError),
    #[error("identity {0} not found")]
    NotFound(String),
    #[error("an identity named '{name}' already exists")]
    Duplicate { name: String },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { name, .. } => ServiceError::Duplicate { name },
            StoreError::NotFound { id } => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

const LOOKUP_ATTEMPTS: usize = 3;

/// Result of a lookup. Every variant is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyOutcome {
    Identified {
        record: IdentityRecord,
        score: f64,
        distance: f64,
    },
    NoFaceDetected,
    NoEnrollments,
    NoMatch {
        /// Score of the closest candidate, below the acceptance floor.
        closest: f64,
    },
}

/// Drives the generator, comparator and store for one deployment.
pub struct RecallService {
    generator: Box<dyn EmbeddingGenerator>,
    comparator: Box<dyn Comparator>,
    store: Box<dyn SignatureStore>,
    resolver: Resolver,
}

impl RecallService {
    pub fn new(
        generator: Box<dyn EmbeddingGenerator>,
        comparator: Box<dyn Comparator>,
        store: Box<dyn SignatureStore>,
        resolver: Resolver,
    ) -> Self {
        Self {
            generator,
            comparator,
            store,
            resolver,
        }
    }

    /// Enroll a new identity for `account_id`.
    ///
    /// The duplicate check runs before the generator so a resubmission is
    /// rejected without spawning any work; the store re-checks on write.
    pub fn enroll(
        &self,
        account_id: &str,
        name: &str,
        details: MemberDetails,
        image: &ImageInput,
    ) -> Result<IdentityRecord, EnrollError> {
        let name = normalize_name(name)?;
        let details = details.normalized()?;

        if self.store.find_active_by_name(account_id, &name)?.is_some() {
            tracing::info!(account = account_id, name = %name, "enroll rejected: duplicate name");
            return Err(EnrollError::Duplicate { name });
        }

        let embedding = match self.generator.generate(image) {
            Generated::Face(e) => e,
            Generated::NoFace => {
                tracing::info!(account = account_id, name = %name, "enroll rejected: no face");
                return Err(EnrollError::NoFaceDetected);
            }
        };

        let record = self.store.save(NewIdentity {
            account_id: account_id.to_string(),
            name,
            details,
            embedding,
            image_ref: image.reference(),
        })?;

        tracing::info!(account = account_id, id = %record.id, name = %record.name, "identity enrolled");
        Ok(record)
    }

    /// Find which of the account's enrolled identities is in `image`.
    pub fn identify(
        &self,
        account_id: &str,
        image: &ImageInput,
    ) -> Result<IdentifyOutcome, StoreError> {
        let Some(probe) = self.generator.generate(image).into_embedding() else {
            tracing::info!(account = account_id, "identify: no face detected");
            return Ok(IdentifyOutcome::NoFaceDetected);
        };

        // A winner removed between the search and the touch starts a fresh search.
        for _ in 0..LOOKUP_ATTEMPTS {
            let candidates = self.store.find(account_id, &Filter::default())?;
            if candidates.is_empty() {
                tracing::info!(account = account_id, "identify: no identities enrolled");
                return Ok(IdentifyOutcome::NoEnrollments);
            }

            let outcome: MatchOutcome =
                self.resolver
                    .resolve(account_id, &probe, &candidates, self.comparator.as_ref());
            tracing::info!(
                account = account_id,
                candidates = candidates.len(),
                compared = outcome.compared,
                skipped = outcome.skipped,
                matched = outcome.matched,
                similarity = outcome.similarity,
                "identify: search complete"
            );

            let Some(idx) = outcome.candidate else {
                return Ok(IdentifyOutcome::NoMatch {
                    closest: outcome.similarity,
                });
            };

            let winner = &candidates[idx];
            match self.store.touch_last_seen(account_id, &winner.id, Utc::now()) {
                Ok(record) => {
                    return Ok(IdentifyOutcome::Identified {
                        record,
                        score: outcome.similarity,
                        distance: outcome.distance.unwrap_or_default(),
                    })
                }
                Err(StoreError::NotFound { id }) => {
                    tracing::info!(account = account_id, id = %id, "identify: winner removed mid-lookup");
                }
                Err(err) => return Err(err),
            }
        }

        tracing::warn!(account = account_id, "identify: enrollments kept changing; giving up");
        Ok(IdentifyOutcome::NoMatch { closest: 0.0 })
    }

    pub fn list(&self, account_id: &str, filter: &Filter) -> Result<Vec<IdentityRecord>, ServiceError> {
        Ok(self.store.find(account_id, filter)?)
    }

    /// Case-insensitive name search, alphabetical.
    pub fn search(&self, account_id: &str, query: &str) -> Result<Vec<IdentityRecord>, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(DetailsError::Missing("search query").into());
        }
        let filter = Filter {
            name_contains: Some(query.to_string()),
            order: Order::Name,
            ..Default::default()
        };
        self.list(account_id, &filter)
    }

    pub fn get(&self, account_id: &str, id: &str) -> Result<IdentityRecord, ServiceError> {
        self.store
            .get(account_id, id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    pub fn update(
        &self,
        account_id: &str,
        id: &str,
        patch: &DetailsPatch,
    ) -> Result<IdentityRecord, ServiceError> {
        let current = self.get(account_id, id)?;
        let (name, details) = patch.apply_to(&current)?;
        let record = self.store.update(account_id, id, &name, &details)?;
        tracing::info!(account = account_id, id, "identity updated");
        Ok(record)
    }

    pub fn remove(&self, account_id: &str, id: &str) -> Result<(), ServiceError> {
        self.store.deactivate(account_id, id)?;
        tracing::info!(account = account_id, id, "identity deactivated");
        Ok(())
    }
}
