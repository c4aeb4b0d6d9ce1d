//! recall-core: identity-resolution engine.
//!
//! Validated 128-d face embeddings, the generator and comparator
//! contracts, best-match search over one account's enrolled identities,
//! and the enrollment / lookup workflows built on top of them.

pub mod comparator;
pub mod generator;
pub mod identity;
pub mod resolver;
pub mod service;
pub mod store;
pub mod types;

pub use comparator::{Comparator, Comparison, ComparisonError, EuclideanComparator, Tolerance};
pub use generator::{EmbeddingGenerator, Generated, ImageInput, ImageInputError};
pub use identity::{
    DetailsError, DetailsPatch, IdentityProfile, IdentityRecord, MemberDetails, NewIdentity,
    Relation,
};
pub use resolver::{MatchOutcome, MatchPolicy, Resolver};
pub use service::{EnrollError, IdentifyOutcome, RecallService, ServiceError};
pub use store::{Filter, MemorySignatureStore, Order, SignatureStore, StoreError};
pub use types::{Embedding, EmbeddingError, EMBEDDING_DIM};
